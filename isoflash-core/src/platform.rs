//! Provides platform-specific functionality.
//!
//! Everything that differs between operating systems sits behind the
//! [`DeviceBackend`] trait: how removable devices are discovered, and which
//! commands unmount, format, write and sync them. The rest of the library only
//! talks to the trait; [`native`] picks the implementation for the host once.
//!
//! The Linux and macOS backends only build commands and parse tool output, so
//! they are available on every host. The Windows backend calls the Win32 API
//! and only exists on Windows.

use crate::command::{CommandRunner, ToolCommand};
use crate::device::Device;
use crate::error::FlashError;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

pub mod linux;
pub mod macos;
#[cfg(windows)]
pub mod windows;

pub use self::linux::LinuxBackend;
pub use self::macos::MacosBackend;
#[cfg(windows)]
pub use self::windows::WindowsBackend;

/// The filesystem a device is formatted with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Filesystem {
    Ntfs,
    Fat32,
    ExFat,
}

impl fmt::Display for Filesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Filesystem::Ntfs => "NTFS",
            Filesystem::Fat32 => "FAT32",
            Filesystem::ExFat => "exFAT",
        })
    }
}

impl FromStr for Filesystem {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ntfs" => Ok(Filesystem::Ntfs),
            "fat32" | "vfat" | "ms-dos" => Ok(Filesystem::Fat32),
            "exfat" => Ok(Filesystem::ExFat),
            other => Err(format!(
                "unknown filesystem '{other}' (expected ntfs, fat32 or exfat)"
            )),
        }
    }
}

/// How a device is formatted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormatOptions {
    pub filesystem: Filesystem,
    /// The volume label. Shortened and upper-cased where the filesystem
    /// requires it.
    pub label: String,
}

impl FormatOptions {
    pub const DEFAULT_LABEL: &'static str = "FLASHDRIVE";

    /// NTFS everywhere except macOS, which cannot create it and gets FAT32.
    pub fn platform_default() -> Self {
        let filesystem = if cfg!(target_os = "macos") {
            Filesystem::Fat32
        } else {
            Filesystem::Ntfs
        };
        Self {
            filesystem,
            label: Self::DEFAULT_LABEL.to_string(),
        }
    }

    /// The label as FAT32 accepts it: at most 11 upper-case characters.
    pub(crate) fn fat_label(&self) -> String {
        self.label.to_uppercase().chars().take(11).collect()
    }
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self::platform_default()
    }
}

/// How the image is copied onto the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMethod {
    /// Run the platform's block copy tool (`dd`) and scrape its output.
    Tool,
    /// Copy in-process through a raw device handle, counting bytes exactly.
    Native,
}

/// Where the progress of a [`WriteMethod::Tool`] write comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressSource {
    /// The tool prints byte counts (`dd status=progress`).
    ByteCounts,
    /// The tool is silent; progress is estimated from elapsed time.
    Elapsed,
}

/// The platform capabilities the orchestrator needs.
pub trait DeviceBackend: Send + Sync {
    /// A short name of the platform, used in messages.
    fn platform(&self) -> &'static str;

    /// Lists candidate removable devices. Never fails: if the platform's
    /// enumeration is unavailable the list is empty.
    fn list_devices(&self) -> Vec<Device>;

    /// Commands that unmount `device`. Their failure is never fatal.
    fn unmount_commands(&self, device: &Device) -> Vec<ToolCommand>;

    fn format_command(
        &self,
        device: &Device,
        options: &FormatOptions,
    ) -> Result<ToolCommand, FlashError>;

    fn default_write_method(&self) -> WriteMethod {
        WriteMethod::Tool
    }

    /// The command that copies `image` onto `device` for [`WriteMethod::Tool`].
    fn write_command(
        &self,
        image: &Path,
        device: &Device,
        chunk_size: usize,
    ) -> (ToolCommand, ProgressSource);

    /// Whether a write tool that cannot be started should be replaced by a
    /// native copy instead of failing the job.
    fn native_fallback(&self) -> bool {
        false
    }

    /// The path the native writer opens for `device`.
    fn raw_path(&self, device: &Device) -> PathBuf {
        device.path.clone()
    }

    /// Whether the native writer should bypass the page cache.
    fn direct_io(&self) -> bool {
        false
    }

    /// The command that flushes buffered writes to the device, if the
    /// platform has one beyond flushing the device handle.
    fn sync_command(&self, device: &Device) -> Option<ToolCommand>;
}

/// The `dd` invocation shared by the Unix backends.
pub(crate) fn dd_command(image: &Path, target: &Path, chunk_size: usize) -> ToolCommand {
    ToolCommand::new("dd").args([
        format!("if={}", image.display()),
        format!("of={}", target.display()),
        format!("bs={chunk_size}"),
    ])
}

/// Returns the backend for the host operating system.
#[cfg(target_os = "linux")]
pub fn native(runner: Arc<dyn CommandRunner>) -> Box<dyn DeviceBackend> {
    Box::new(LinuxBackend::new(runner))
}

/// Returns the backend for the host operating system.
#[cfg(target_os = "macos")]
pub fn native(runner: Arc<dyn CommandRunner>) -> Box<dyn DeviceBackend> {
    Box::new(MacosBackend::new(runner))
}

/// Returns the backend for the host operating system.
#[cfg(windows)]
pub fn native(_runner: Arc<dyn CommandRunner>) -> Box<dyn DeviceBackend> {
    Box::new(WindowsBackend::new())
}

/// Other Unix systems get the Linux backend; without `lsblk` it lists nothing.
#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
pub fn native(runner: Arc<dyn CommandRunner>) -> Box<dyn DeviceBackend> {
    Box::new(LinuxBackend::new(runner))
}
