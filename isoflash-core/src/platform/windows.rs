use super::{dd_command, DeviceBackend, Filesystem, FormatOptions, ProgressSource, WriteMethod};
use crate::command::ToolCommand;
use crate::device::Device;
use crate::error::FlashError;
use log::debug;
use std::path::Path;
use windows_sys::Win32::Storage::FileSystem::{
    GetDiskFreeSpaceExW, GetDriveTypeW, GetLogicalDrives, GetVolumeInformationW,
};

/// `DRIVE_REMOVABLE` from `GetDriveTypeW`.
const DRIVE_REMOVABLE: u32 = 2;

/// Drive letters that are never offered, in addition to the system drive.
const RESERVED_DRIVES: &[char] = &['C', 'S'];

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn system_drive_letter() -> Option<char> {
    std::env::var("SystemDrive")
        .ok()
        .and_then(|s| s.chars().next())
        .map(|c| c.to_ascii_uppercase())
}

fn total_bytes(root: &[u16]) -> u64 {
    let mut free_available = 0u64;
    let mut total = 0u64;
    let mut total_free = 0u64;
    // SAFETY: `root` is a NUL-terminated wide string and the out-pointers
    // refer to live locals.
    let ok = unsafe {
        GetDiskFreeSpaceExW(root.as_ptr(), &mut free_available, &mut total, &mut total_free)
    };
    if ok == 0 { 0 } else { total }
}

fn volume_label(root: &[u16]) -> String {
    let mut name = [0u16; 261];
    // SAFETY: `root` is NUL-terminated and `name` is writable for the length
    // passed; the optional out-parameters are null.
    let ok = unsafe {
        GetVolumeInformationW(
            root.as_ptr(),
            name.as_mut_ptr(),
            name.len() as u32,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            0,
        )
    };
    if ok == 0 {
        return String::new();
    }
    let len = name.iter().position(|&c| c == 0).unwrap_or(name.len());
    String::from_utf16_lossy(&name[..len])
}

/// Discovers removable drives through the Win32 API and writes to them through
/// raw volume handles.
#[derive(Debug, Default)]
pub struct WindowsBackend;

impl WindowsBackend {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceBackend for WindowsBackend {
    fn platform(&self) -> &'static str {
        "Windows"
    }

    fn list_devices(&self) -> Vec<Device> {
        let system = system_drive_letter();
        // SAFETY: no arguments; returns a bitmask of available drives.
        let mask = unsafe { GetLogicalDrives() };
        let mut devices = Vec::new();

        for (bit, letter) in ('A'..='Z').enumerate() {
            if mask & (1 << bit) == 0 {
                continue;
            }
            if RESERVED_DRIVES.contains(&letter) || Some(letter) == system {
                continue;
            }

            let root = wide(&format!("{letter}:\\"));
            // SAFETY: `root` is a NUL-terminated wide string.
            let drive_type = unsafe { GetDriveTypeW(root.as_ptr()) };
            if drive_type != DRIVE_REMOVABLE {
                continue;
            }

            let size_bytes = total_bytes(&root);
            if size_bytes == 0 {
                debug!("skipping {letter}: with no medium");
                continue;
            }

            let name = format!("{letter}:");
            let mut device = Device::new(format!("\\\\.\\{name}"), name, size_bytes)
                .with_label(volume_label(&root));
            device.mount_point = Some(format!("{letter}:\\").into());
            devices.push(device);
        }

        devices
    }

    fn unmount_commands(&self, _device: &Device) -> Vec<ToolCommand> {
        Vec::new()
    }

    fn format_command(
        &self,
        device: &Device,
        options: &FormatOptions,
    ) -> Result<ToolCommand, FlashError> {
        let (fs, label) = match options.filesystem {
            Filesystem::Ntfs => ("NTFS", options.label.clone()),
            Filesystem::Fat32 => ("FAT32", options.fat_label()),
            Filesystem::ExFat => ("exFAT", options.label.clone()),
        };
        Ok(ToolCommand::new("format.com")
            .arg(device.name.as_str())
            .arg(format!("/fs:{fs}"))
            .arg(format!("/v:{label}"))
            .args(["/q", "/y"]))
    }

    fn default_write_method(&self) -> WriteMethod {
        WriteMethod::Native
    }

    fn write_command(
        &self,
        image: &Path,
        device: &Device,
        chunk_size: usize,
    ) -> (ToolCommand, ProgressSource) {
        let cmd = dd_command(image, &device.path, chunk_size).arg("status=progress");
        (cmd, ProgressSource::ByteCounts)
    }

    fn native_fallback(&self) -> bool {
        true
    }

    fn sync_command(&self, _device: &Device) -> Option<ToolCommand> {
        None
    }
}
