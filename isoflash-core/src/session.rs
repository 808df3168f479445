//! The per-application state shared by all jobs.
//!
//! A [`Session`] owns the device list from the last enumeration, the cached
//! elevation credential and the single in-flight job flag. Jobs can run on the
//! calling thread ([`Session::flash`], [`Session::format`]) or on a worker
//! ([`Session::spawn_flash`], [`Session::spawn_format`]) that reports back
//! over a channel, so the UI thread stays the only one touching UI state.

use crate::command::{CommandRunner, SystemRunner};
use crate::device::Device;
use crate::error::FlashError;
use crate::flash::{self, FlashOptions, Toolbox};
use crate::platform::{self, DeviceBackend};
use crate::privilege::{CredentialPrompt, Elevator};
use crate::progress::Progress;
use log::{debug, info};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

/// An update from a job running on a worker thread.
#[derive(Debug)]
pub enum JobEvent {
    Progress(Progress),
    /// The device list after a format job re-enumerated devices.
    DevicesRefreshed(Vec<Device>),
    /// The job is over; always the last event.
    Finished(Result<(), FlashError>),
}

/// A job running on a worker thread.
pub struct JobHandle {
    events: Receiver<JobEvent>,
    worker: JoinHandle<()>,
}

impl JobHandle {
    /// The events of the job, ending with [`JobEvent::Finished`].
    pub fn events(&self) -> &Receiver<JobEvent> {
        &self.events
    }

    /// Blocks until the job is over, passing every other event to `on_event`.
    pub fn wait(self, mut on_event: impl FnMut(JobEvent)) -> Result<(), FlashError> {
        let mut result = None;
        for event in self.events.iter() {
            match event {
                JobEvent::Finished(r) => {
                    result = Some(r);
                    break;
                }
                other => on_event(other),
            }
        }
        self.worker.join().ok();
        result.unwrap_or_else(|| {
            Err(FlashError::Internal(
                "the job worker exited without reporting a result".into(),
            ))
        })
    }
}

pub struct Session {
    backend: Box<dyn DeviceBackend>,
    runner: Arc<dyn CommandRunner>,
    elevator: Elevator,
    options: FlashOptions,
    devices: Mutex<Vec<Device>>,
    busy: AtomicBool,
}

/// Clears the in-flight flag and the cached credential when a job ends,
/// however it ends.
struct JobGuard<'a>(&'a Session);

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        self.0.elevator.forget();
        self.0.busy.store(false, Ordering::SeqCst);
        debug!("job finished; session is ready");
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("the job failed unexpectedly: {detail}")
}

impl Session {
    pub fn new(
        backend: Box<dyn DeviceBackend>,
        runner: Arc<dyn CommandRunner>,
        elevator: Elevator,
        options: FlashOptions,
    ) -> Self {
        Self {
            backend,
            runner,
            elevator,
            options,
            devices: Mutex::new(Vec::new()),
            busy: AtomicBool::new(false),
        }
    }

    /// A session for the host platform, running real commands.
    pub fn native(options: FlashOptions, prompt: Option<Arc<dyn CredentialPrompt>>) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new());
        let backend = platform::native(runner.clone());
        info!("using the {} device backend", backend.platform());
        Self::new(backend, runner, Elevator::detect(prompt), options)
    }

    pub fn options(&self) -> &FlashOptions {
        &self.options
    }

    pub fn elevator(&self) -> &Elevator {
        &self.elevator
    }

    fn device_list(&self) -> MutexGuard<'_, Vec<Device>> {
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enumerates removable devices, replacing the session's device list.
    pub fn refresh_devices(&self) -> Vec<Device> {
        let devices = self.backend.list_devices();
        info!("found {} removable device(s)", devices.len());
        *self.device_list() = devices.clone();
        devices
    }

    /// The device list from the last enumeration.
    pub fn devices(&self) -> Vec<Device> {
        self.device_list().clone()
    }

    /// Whether a job is running.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Checks that `device` was returned by the last enumeration and returns
    /// the session's record for it.
    pub fn validate_device(&self, device: Option<&Device>) -> Result<Device, FlashError> {
        let device = device.ok_or(FlashError::NoDevice)?;
        self.device_list()
            .iter()
            .find(|d| d.path == device.path)
            .cloned()
            .ok_or_else(|| FlashError::UnknownDevice(device.path.clone()))
    }

    /// Looks up a device of the last enumeration by its path.
    pub fn find_device(&self, path: &Path) -> Result<Device, FlashError> {
        self.device_list()
            .iter()
            .find(|d| d.path == path)
            .cloned()
            .ok_or_else(|| FlashError::UnknownDevice(path.to_path_buf()))
    }

    /// Checks the inputs of a flash job. Call this before asking the user to
    /// confirm; it runs no commands.
    pub fn validate_flash(&self, image: &Path, device: Option<&Device>) -> Result<Device, FlashError> {
        flash::validate_image(image)?;
        self.validate_device(device)
    }

    /// Obtains the rights a flash job needs, asking for the password on the
    /// calling thread. Call this after the user confirmed and before
    /// [`Session::spawn_flash`], so that the prompt does not run on the
    /// worker. The credential lasts until the end of the next job.
    pub fn authorize_flash(
        &self,
        image: &Path,
        device: &Device,
        format_requested: bool,
    ) -> Result<(), FlashError> {
        if self.is_busy() {
            return Err(FlashError::Busy);
        }
        let device = self.validate_flash(image, Some(device))?;
        flash::authorize(
            &self.toolbox(),
            image,
            &device,
            format_requested,
            &self.options,
        )
    }

    /// Like [`Session::authorize_flash`], for [`Session::spawn_format`].
    pub fn authorize_format(&self, device: &Device) -> Result<(), FlashError> {
        if self.is_busy() {
            return Err(FlashError::Busy);
        }
        let device = self.validate_device(Some(device))?;
        flash::authorize_format(&self.toolbox(), &device, &self.options.format)
    }

    fn toolbox(&self) -> Toolbox<'_> {
        Toolbox {
            backend: self.backend.as_ref(),
            runner: self.runner.as_ref(),
            elevator: &self.elevator,
        }
    }

    fn begin(&self) -> Result<JobGuard<'_>, FlashError> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| FlashError::Busy)?;
        Ok(JobGuard(self))
    }

    fn run_flash(
        &self,
        image: &Path,
        device: &Device,
        format_requested: bool,
        on_progress: &mut dyn FnMut(Progress),
    ) -> Result<(), FlashError> {
        let image_len = flash::validate_image(image)?;
        let device = self.validate_device(Some(device))?;
        debug!("validated {} ({image_len} bytes)", image.display());
        flash::run(
            &self.toolbox(),
            image,
            &device,
            format_requested,
            &self.options,
            on_progress,
        )
    }

    fn run_format(
        &self,
        device: &Device,
        on_progress: &mut dyn FnMut(Progress),
    ) -> Result<(), FlashError> {
        let device = self.validate_device(Some(device))?;
        flash::format(&self.toolbox(), &device, &self.options.format, on_progress)
    }

    /// Flashes `image` onto `device` on the calling thread.
    pub fn flash(
        &self,
        image: &Path,
        device: &Device,
        format_requested: bool,
        on_progress: &mut dyn FnMut(Progress),
    ) -> Result<(), FlashError> {
        let _guard = self.begin()?;
        self.run_flash(image, device, format_requested, on_progress)
    }

    /// Formats `device` on the calling thread, then re-enumerates devices
    /// whether or not formatting succeeded.
    pub fn format(
        &self,
        device: &Device,
        on_progress: &mut dyn FnMut(Progress),
    ) -> Result<(), FlashError> {
        let result = {
            let _guard = self.begin()?;
            self.run_format(device, on_progress)
        };
        self.refresh_devices();
        result
    }

    /// Starts a job on a worker thread. The in-flight flag is taken here, so a
    /// second job is refused immediately rather than by its worker.
    fn spawn_job<F>(self: &Arc<Self>, job: F) -> Result<JobHandle, FlashError>
    where
        F: FnOnce(&Session, &Sender<JobEvent>) -> Result<(), FlashError> + Send + 'static,
    {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| FlashError::Busy)?;

        let (tx, rx) = mpsc::channel();
        let session = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("isoflash-job".into())
            .spawn(move || {
                let result = {
                    let _guard = JobGuard(&session);
                    panic::catch_unwind(AssertUnwindSafe(|| job(&session, &tx)))
                        .unwrap_or_else(|payload| Err(FlashError::Internal(panic_message(payload))))
                };
                tx.send(JobEvent::Finished(result)).ok();
            });

        match spawned {
            Ok(worker) => Ok(JobHandle { events: rx, worker }),
            Err(e) => {
                self.elevator.forget();
                self.busy.store(false, Ordering::SeqCst);
                Err(FlashError::Internal(format!("could not start the job worker: {e}")))
            }
        }
    }

    /// Flashes `image` onto `device` on a worker thread.
    pub fn spawn_flash(
        self: &Arc<Self>,
        image: PathBuf,
        device: Device,
        format_requested: bool,
    ) -> Result<JobHandle, FlashError> {
        self.spawn_job(move |session, tx| {
            session.run_flash(&image, &device, format_requested, &mut |progress| {
                tx.send(JobEvent::Progress(progress)).ok();
            })
        })
    }

    /// Formats `device` on a worker thread. Devices are re-enumerated before
    /// the job finishes, and the new list is sent as
    /// [`JobEvent::DevicesRefreshed`].
    pub fn spawn_format(self: &Arc<Self>, device: Device) -> Result<JobHandle, FlashError> {
        self.spawn_job(move |session, tx| {
            let result = session.run_format(&device, &mut |progress| {
                tx.send(JobEvent::Progress(progress)).ok();
            });
            let devices = session.refresh_devices();
            tx.send(JobEvent::DevicesRefreshed(devices)).ok();
            result
        })
    }
}
