//! The core, UI-agnostic library for the `isoflash` image flashing utility.
//!
//! `isoflash-core` can be driven by any front-end, whether it's a command-line
//! interface (like `isoflash`) or a graphical one. It discovers removable
//! devices, and formats and flashes them by orchestrating the platform's own
//! tools (`lsblk`, `diskutil`, `mkfs`, `dd`, `sync`, ...) or, where that is the
//! better fit, by writing through a raw device handle itself.
//!
//! The library is structured into several key modules:
//! - [`device`]: The cross-platform `Device` record.
//! - [`platform`]: The `DeviceBackend` trait and one implementation per OS.
//! - [`command`]: How external tools are run, behind the `CommandRunner` trait.
//! - [`privilege`]: Elevation of privileged commands through `sudo`.
//! - [`progress`]: Best-effort progress from tool output or elapsed time.
//! - [`mod@write`]: The native chunked writer.
//! - [`flash`]: The flash and format jobs.
//! - [`session`]: Device list, single in-flight job, and worker threads.
//!
//! The primary entry point is [`session::Session`]. Jobs report progress
//! through callbacks, or through [`session::JobEvent`]s when run on a worker,
//! allowing the calling application to display progress in any way it chooses.
//!
//! ## Example: Flashing an Image with Progress Reporting
//!
//! ```rust,no_run
//! use isoflash_core::flash::FlashOptions;
//! use isoflash_core::session::{JobEvent, Session};
//! use std::path::PathBuf;
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = Arc::new(Session::native(FlashOptions::default(), None));
//!     let devices = session.refresh_devices();
//!     let device = devices.first().expect("No removable devices found.");
//!
//!     let image = PathBuf::from("path/to/image.iso");
//!     // Validate before asking the user to confirm.
//!     session.validate_flash(&image, Some(device))?;
//!
//!     let job = session.spawn_flash(image, device.clone(), false)?;
//!     job.wait(|event| {
//!         if let JobEvent::Progress(p) = event {
//!             println!("{:>5.1}% {}", p.percent, p.message);
//!         }
//!     })?;
//!
//!     println!("Flash complete!");
//!     Ok(())
//! }
//! ```

pub mod command;
pub mod device;
pub mod error;
pub mod flash;
mod os_options;
pub mod platform;
pub mod privilege;
pub mod progress;
pub mod session;
pub mod write;

pub use error::{ErrorKind, FlashError};
