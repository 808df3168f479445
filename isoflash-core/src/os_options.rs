use std::fs::OpenOptions;

/// Asks the OS to bypass its page cache for `options` where that is supported.
///
/// Only Linux honors this (`O_DIRECT`); buffers then have to be aligned, which
/// the native writer takes care of.
pub(crate) fn direct_io(options: &mut OpenOptions) -> &mut OpenOptions {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(libc::O_DIRECT);
    }
    options
}

/// Opens Windows volumes with sharing enabled, so that Explorer holding the
/// drive open does not make the open fail.
#[cfg(windows)]
pub(crate) fn share_volume(options: &mut OpenOptions) -> &mut OpenOptions {
    use std::os::windows::fs::OpenOptionsExt;
    use windows_sys::Win32::Storage::FileSystem::{FILE_SHARE_READ, FILE_SHARE_WRITE};
    options.share_mode(FILE_SHARE_READ | FILE_SHARE_WRITE)
}
