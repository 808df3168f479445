use crate::platform::Filesystem;
use crate::progress::Stage;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification of a [`FlashError`], used by front-ends to decide
/// how to present a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request itself is invalid; nothing destructive was attempted.
    Validation,
    /// Elevation was refused, unavailable or rejected.
    Privilege,
    /// An external tool failed or could not be started.
    Tool,
    /// An I/O error in the native write path.
    Io,
    /// The job worker failed unexpectedly.
    Internal,
}

#[derive(Debug, Error)]
pub enum FlashError {
    #[error("Please select an image file.")]
    NoImage,

    #[error("The selected image file does not exist: {}", .0.display())]
    ImageNotFound(PathBuf),

    #[error("The selected image is not a regular file: {}", .0.display())]
    ImageNotAFile(PathBuf),

    #[error("The selected image cannot be read: {}: {source}", path.display())]
    ImageUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Please select a valid target device.")]
    NoDevice,

    #[error("{} is not one of the removable devices found in this session.", .0.display())]
    UnknownDevice(PathBuf),

    #[error("{filesystem} is not supported by the {platform} formatter.")]
    UnsupportedFilesystem {
        filesystem: Filesystem,
        platform: &'static str,
    },

    #[error("Another flash or format job is already running.")]
    Busy,

    #[error("Administrator privileges required: {0}")]
    Privilege(String),

    #[error("{tool} failed while {stage}: {message}")]
    Tool {
        tool: String,
        stage: Stage,
        message: String,
    },

    #[error("I/O error while {stage}: {source}")]
    Io {
        stage: Stage,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Internal(String),
}

impl FlashError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlashError::NoImage
            | FlashError::ImageNotFound(_)
            | FlashError::ImageNotAFile(_)
            | FlashError::ImageUnreadable { .. }
            | FlashError::NoDevice
            | FlashError::UnknownDevice(_)
            | FlashError::UnsupportedFilesystem { .. }
            | FlashError::Busy => ErrorKind::Validation,
            FlashError::Privilege(_) => ErrorKind::Privilege,
            FlashError::Tool { .. } => ErrorKind::Tool,
            FlashError::Io { .. } => ErrorKind::Io,
            FlashError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Maps an I/O error from the native write path, treating a denied open
    /// as a privilege problem rather than a device failure.
    pub(crate) fn from_io(stage: Stage, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::PermissionDenied {
            FlashError::Privilege(source.to_string())
        } else {
            FlashError::Io { stage, source }
        }
    }
}
