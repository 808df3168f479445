use std::fmt;
use std::path::PathBuf;

/// A removable block device that can be used as a flash target.
///
/// Records are produced by a [`crate::platform::DeviceBackend`] and are only
/// meaningful for the session that enumerated them; they are never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    /// The system path used for raw access (e.g. `/dev/sdb`, `/dev/disk4` or `\\.\E:`).
    pub path: PathBuf,
    /// The kernel or disk identifier (e.g. "sdb", "disk4" or "E:").
    pub name: String,
    /// The model or volume name, empty when the platform reports none.
    pub label: String,
    /// The total size of the device in bytes, 0 if unknown.
    pub size_bytes: u64,
    /// The primary mount point of the device, if any.
    pub mount_point: Option<PathBuf>,
}

impl Device {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            label: String::new(),
            size_bytes,
            mount_point: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// The size of the device in gigabytes (GiB).
    pub fn size_gb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<15} {:>7.1} GB", self.path.display(), self.size_gb())?;
        if !self.label.is_empty() {
            write!(f, "  {}", self.label)?;
        }
        if let Some(mount_point) = &self.mount_point {
            write!(f, " [Mounted at {}]", mount_point.display())?;
        }
        Ok(())
    }
}
