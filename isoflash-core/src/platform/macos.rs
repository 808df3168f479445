use super::{dd_command, DeviceBackend, Filesystem, FormatOptions, ProgressSource};
use crate::command::{CommandRunner, ToolCommand};
use crate::device::Device;
use crate::error::FlashError;
use log::warn;
use std::path::Path;
use std::sync::Arc;

/// Extracts the disk paths from `diskutil list external`.
///
/// Disk headers look like `/dev/disk4 (external, physical):`. Synthesized
/// APFS containers and mounted disk images are not real targets and are
/// skipped.
pub fn parse_disk_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| line.starts_with("/dev/"))
        .filter(|line| !line.contains("synthesized") && !line.contains("disk image"))
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// The fields of `diskutil info` the device list needs.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DiskInfo {
    pub size_bytes: u64,
    pub volume_name: String,
    pub media_name: String,
}

/// Parses `diskutil info <disk>` output.
///
/// `Disk Size:` reads like `16.0 GB (16008609792 Bytes) (exactly ...)`; the
/// exact byte count in parentheses is used.
pub fn parse_disk_info(output: &str) -> DiskInfo {
    let mut info = DiskInfo::default();

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Disk Size" | "Total Size" if info.size_bytes == 0 => {
                info.size_bytes = value
                    .split('(')
                    .nth(1)
                    .and_then(|s| s.split_whitespace().next())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
            }
            "Volume Name" if !value.starts_with("Not applicable") => {
                info.volume_name = value.to_string();
            }
            "Device / Media Name" => info.media_name = value.to_string(),
            _ => {}
        }
    }

    info
}

/// Discovers and drives external disks with `diskutil`, `dd` and `sync`.
pub struct MacosBackend {
    runner: Arc<dyn CommandRunner>,
}

impl MacosBackend {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn disk_info(&self, disk: &str) -> Option<DiskInfo> {
        let cmd = ToolCommand::new("diskutil").args(["info", disk]);
        match self.runner.output(&cmd) {
            Ok(output) if output.success() => Some(parse_disk_info(&output.stdout)),
            Ok(output) => {
                warn!("diskutil info {disk} failed: {}", output.failure_text());
                None
            }
            Err(e) => {
                warn!("diskutil info {disk} failed: {e}");
                None
            }
        }
    }
}

impl DeviceBackend for MacosBackend {
    fn platform(&self) -> &'static str {
        "macOS"
    }

    fn list_devices(&self) -> Vec<Device> {
        let cmd = ToolCommand::new("diskutil").args(["list", "external"]);
        let listing = match self.runner.output(&cmd) {
            Ok(output) if output.success() => output.stdout,
            Ok(output) => {
                warn!("Could not retrieve device information on macOS: {}", output.failure_text());
                return Vec::new();
            }
            Err(e) => {
                warn!("Could not retrieve device information on macOS: {e}");
                return Vec::new();
            }
        };

        parse_disk_list(&listing)
            .into_iter()
            .filter_map(|path| {
                let info = self.disk_info(&path)?;
                let name = path.trim_start_matches("/dev/").to_string();
                let label = if info.volume_name.is_empty() {
                    info.media_name
                } else {
                    info.volume_name
                };
                Some(Device::new(&path, name, info.size_bytes).with_label(label))
            })
            .collect()
    }

    fn unmount_commands(&self, device: &Device) -> Vec<ToolCommand> {
        vec![ToolCommand::new("diskutil")
            .arg("unmountDisk")
            .arg(device.path.to_string_lossy())]
    }

    fn format_command(
        &self,
        device: &Device,
        options: &FormatOptions,
    ) -> Result<ToolCommand, FlashError> {
        let (personality, label) = match options.filesystem {
            Filesystem::Fat32 => ("MS-DOS", options.fat_label()),
            Filesystem::ExFat => ("ExFAT", options.label.clone()),
            Filesystem::Ntfs => {
                return Err(FlashError::UnsupportedFilesystem {
                    filesystem: options.filesystem,
                    platform: self.platform(),
                });
            }
        };
        Ok(ToolCommand::new("diskutil")
            .args(["eraseDisk", personality])
            .arg(label)
            .arg(device.path.to_string_lossy()))
    }

    fn write_command(
        &self,
        image: &Path,
        device: &Device,
        chunk_size: usize,
    ) -> (ToolCommand, ProgressSource) {
        let cmd = dd_command(image, &device.path, chunk_size).privileged();
        (cmd, ProgressSource::Elapsed)
    }

    // Flushes every filesystem; needs no rights.
    fn sync_command(&self, _device: &Device) -> Option<ToolCommand> {
        Some(ToolCommand::new("sync"))
    }
}
