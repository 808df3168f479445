use super::{dd_command, DeviceBackend, Filesystem, FormatOptions, ProgressSource};
use crate::command::{CommandRunner, ToolCommand};
use crate::device::Device;
use crate::error::FlashError;
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Transports that always mean an internal disk.
const INTERNAL_TRANSPORTS: &[&str] = &["sata", "ata", "nvme", "sas", "scsi", "virtio"];

/// Helper to find the parent device of a partition (e.g., /dev/sda1 -> /dev/sda).
/// This is used to find the system drive's parent for exclusion.
fn get_parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/dev/sd") {
        if let Some(index) = path_str.rfind(|c: char| c.is_alphabetic()) {
            return PathBuf::from(&path_str[..=index]);
        }
    } else if path_str.starts_with("/dev/mmcblk") || path_str.starts_with("/dev/nvme") {
        if let Some(index) = path_str.rfind('p') {
            return PathBuf::from(&path_str[..index]);
        }
    }

    path.to_path_buf()
}

/// Finds the kernel name of the disk holding the root filesystem.
fn system_disk_name() -> Option<String> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let root = disks.iter().find(|disk| disk.mount_point() == Path::new("/"))?;
    let path = get_parent_device_path(&PathBuf::from("/dev/").join(root.name()));
    let name = path.file_name()?.to_string_lossy().into_owned();
    debug!("system disk is {name}");
    Some(name)
}

/// Parses `lsblk -d -b -n -o NAME,SIZE,MODEL,TRAN` output into the devices
/// that are safe to offer as flash targets.
///
/// A line is `name size [model...] [transport]`; the model may contain
/// spaces. A device is kept if it is attached over USB, or if its name looks
/// like a removable disk (`sd*`, `mmcblk*`) other than `sda`. Loop devices,
/// disks on an internal transport and the disk holding the root filesystem
/// are never kept.
pub fn parse_lsblk(output: &str, system_disk: Option<&str>) -> Vec<Device> {
    let mut devices = Vec::new();

    for line in output.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 {
            continue;
        }
        let name = parts[0];
        let size_bytes = parts[1].parse::<u64>().unwrap_or(0);
        let model = if parts.len() > 3 {
            parts[2..parts.len() - 1].join(" ")
        } else {
            String::new()
        };
        let transport = if parts.len() > 2 { parts[parts.len() - 1] } else { "" };

        if name.starts_with("loop") || Some(name) == system_disk {
            continue;
        }
        if INTERNAL_TRANSPORTS.contains(&transport) {
            continue;
        }
        let removable_name =
            (name.starts_with("sd") || name.starts_with("mmcblk")) && !name.starts_with("sda");
        if transport != "usb" && !removable_name {
            continue;
        }

        devices.push(Device::new(format!("/dev/{name}"), name, size_bytes).with_label(model));
    }

    devices
}

/// Discovers and drives removable devices with `lsblk`, `umount`, `mkfs.*`,
/// `dd` and `sync`.
pub struct LinuxBackend {
    runner: Arc<dyn CommandRunner>,
    system_disk: Option<String>,
    inspect_mounts: bool,
}

impl LinuxBackend {
    /// A backend for the running system; the root disk is looked up once here.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        let system_disk = system_disk_name();
        if system_disk.is_none() {
            warn!("could not determine the system disk; relying on name heuristics only");
        }
        Self {
            runner,
            system_disk,
            inspect_mounts: true,
        }
    }

    /// A backend that does not inspect the running system's mounts, with an
    /// explicit system disk.
    pub fn with_system_disk(runner: Arc<dyn CommandRunner>, system_disk: Option<String>) -> Self {
        Self {
            runner,
            system_disk,
            inspect_mounts: false,
        }
    }

    /// Mounted partitions of `device` with their mount points.
    fn mounted_partitions(&self, device: &Device) -> Vec<(PathBuf, PathBuf)> {
        if !self.inspect_mounts {
            return Vec::new();
        }
        let disks = sysinfo::Disks::new_with_refreshed_list();
        disks
            .iter()
            .filter_map(|disk| {
                let partition = PathBuf::from("/dev/").join(disk.name());
                let on_device = partition
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with(device.name.as_str()));
                on_device.then(|| (partition, disk.mount_point().to_path_buf()))
            })
            .collect()
    }
}

impl DeviceBackend for LinuxBackend {
    fn platform(&self) -> &'static str {
        "Linux"
    }

    fn list_devices(&self) -> Vec<Device> {
        let cmd = ToolCommand::new("lsblk").args(["-d", "-b", "-n", "-o", "NAME,SIZE,MODEL,TRAN"]);
        let output = match self.runner.output(&cmd) {
            Ok(output) if output.success() => output,
            Ok(output) => {
                warn!("Could not retrieve device information on Linux: {}", output.failure_text());
                return Vec::new();
            }
            Err(e) => {
                warn!("Could not retrieve device information on Linux: {e}");
                return Vec::new();
            }
        };

        let mut devices = parse_lsblk(&output.stdout, self.system_disk.as_deref());
        for device in &mut devices {
            device.mount_point = self
                .mounted_partitions(device)
                .into_iter()
                .map(|(_, mount_point)| mount_point)
                .next();
        }
        devices
    }

    fn unmount_commands(&self, device: &Device) -> Vec<ToolCommand> {
        self.mounted_partitions(device)
            .into_iter()
            .map(|(partition, _)| {
                ToolCommand::new("umount")
                    .arg(partition.to_string_lossy())
                    .privileged()
            })
            .collect()
    }

    fn format_command(
        &self,
        device: &Device,
        options: &FormatOptions,
    ) -> Result<ToolCommand, FlashError> {
        let target = device.path.to_string_lossy().into_owned();
        let cmd = match options.filesystem {
            Filesystem::Ntfs => {
                let mut cmd = ToolCommand::new("mkfs.ntfs").arg("-f");
                if !options.label.is_empty() {
                    cmd = cmd.args(["-L", options.label.as_str()]);
                }
                cmd.arg(target)
            }
            Filesystem::Fat32 => ToolCommand::new("mkfs.vfat")
                .args(["-I", "-F", "32", "-n"])
                .arg(options.fat_label())
                .arg(target),
            Filesystem::ExFat => ToolCommand::new("mkfs.exfat")
                .args(["-n", options.label.as_str()])
                .arg(target),
        };
        Ok(cmd.privileged())
    }

    fn write_command(
        &self,
        image: &Path,
        device: &Device,
        chunk_size: usize,
    ) -> (ToolCommand, ProgressSource) {
        let cmd = dd_command(image, &device.path, chunk_size)
            .arg("status=progress")
            .privileged();
        (cmd, ProgressSource::ByteCounts)
    }

    fn direct_io(&self) -> bool {
        true
    }

    fn sync_command(&self, _device: &Device) -> Option<ToolCommand> {
        Some(ToolCommand::new("sync"))
    }
}
