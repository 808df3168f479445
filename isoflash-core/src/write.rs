//! Contains the in-process writer used by [`WriteMethod::Native`].
//!
//! The image is copied onto the raw device in fixed-size chunks, reporting the
//! exact number of bytes written after each one. The caller owns the returned
//! device handle and is responsible for flushing it.
//!
//! [`WriteMethod::Native`]: crate::platform::WriteMethod::Native
use crate::os_options;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

/// Default chunk size for a single write to the device.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024; // 4 MiB

/// Sector size assumed when the device cannot report its own.
pub const DEFAULT_BLOCK_SIZE: usize = 512;

#[cfg(target_os = "linux")]
nix::ioctl_read_bad!(blksszget, nix::request_code_none!(0x12, 104), libc::c_int);

/// The logical block size of the device behind `file`.
///
/// Only Linux block devices report one (`BLKSSZGET`); everything else, including
/// regular files, gets [`DEFAULT_BLOCK_SIZE`].
pub fn block_size(file: &File) -> usize {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let mut size: libc::c_int = 0;
        // SAFETY: `file` is open for the duration of the call and `size` is a
        // live `c_int` the kernel writes into.
        if unsafe { blksszget(file.as_raw_fd(), &mut size) }.is_ok() && size > 0 {
            let size = size as usize;
            if size.is_power_of_two() {
                return size;
            }
        }
    }
    let _ = file;
    DEFAULT_BLOCK_SIZE
}

/// Opens a raw device (or, in tests, any existing file) for writing.
///
/// With `direct_io` the page cache is bypassed where the platform supports it,
/// and [`copy_image`] must then be called with the device's [`block_size`].
pub fn open_target(path: &Path, direct_io: bool) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true);
    if direct_io {
        os_options::direct_io(&mut options);
    }
    #[cfg(windows)]
    os_options::share_volume(&mut options);

    let file = options.open(path)?;
    #[cfg(windows)]
    lock_volume(&file);
    Ok(file)
}

/// Locks and dismounts a Windows volume so that raw writes to sectors owned by
/// its filesystem are allowed. Best-effort: a volume that cannot be locked is
/// written anyway and the OS reports any refused write.
#[cfg(windows)]
fn lock_volume(file: &File) {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::System::IO::DeviceIoControl;
    use windows_sys::Win32::System::Ioctl::{FSCTL_DISMOUNT_VOLUME, FSCTL_LOCK_VOLUME};

    let handle = file.as_raw_handle() as isize;
    for (code, what) in [(FSCTL_LOCK_VOLUME, "lock"), (FSCTL_DISMOUNT_VOLUME, "dismount")] {
        let mut returned = 0u32;
        // SAFETY: `handle` is a valid open handle for the lifetime of `file`;
        // neither control code takes buffers.
        let ok = unsafe {
            DeviceIoControl(
                handle,
                code,
                std::ptr::null(),
                0,
                std::ptr::null_mut(),
                0,
                &mut returned,
                std::ptr::null_mut(),
            )
        };
        if ok == 0 {
            log::warn!("could not {what} volume: {}", io::Error::last_os_error());
        }
    }
}

/// Copies `image_len` bytes from `image` to `device` in `chunk_size` chunks.
///
/// `on_progress` is called after every chunk with the total number of image
/// bytes written so far. With `block_size` every write is a multiple of that
/// size and comes from a buffer aligned to it; the final chunk is padded with
/// zeros.
///
/// Returns the number of image bytes written, which is always `image_len`.
pub fn copy_image<R, W, F>(
    image: &mut R,
    image_len: u64,
    device: &mut W,
    chunk_size: usize,
    block_size: Option<usize>,
    mut on_progress: F,
) -> io::Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
    F: FnMut(u64),
{
    let align = block_size.unwrap_or(1).max(1);
    let chunk_size = chunk_size.max(align) / align * align;

    // O_DIRECT needs the buffer itself aligned, not just the lengths.
    let mut buf = vec![0u8; chunk_size + align];
    let offset = buf.as_ptr().align_offset(align);
    let buffer = &mut buf[offset..offset + chunk_size];

    let mut written: u64 = 0;
    while written < image_len {
        let to_read = std::cmp::min(chunk_size as u64, image_len - written) as usize;
        image.read_exact(&mut buffer[..to_read])?;

        // The last chunk of data may not be a multiple of the block size.
        let to_write = to_read.div_ceil(align) * align;
        buffer[to_read..to_write].fill(0);

        device.write_all(&buffer[..to_write])?;
        written += to_read as u64;
        on_progress(written);
    }

    device.flush()?;
    Ok(written)
}
