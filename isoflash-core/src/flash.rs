//! Contains the flash and format jobs.
//!
//! A flash job runs these steps in order, stopping at the first failure:
//! 1.  Optionally unmount and format the device.
//! 2.  Unmount the device and copy the image onto it, either with the
//!     platform's `dd` or with the native writer.
//! 3.  Flush all buffered writes to the device.
//!
//! Nothing is rolled back: a job that fails half-way leaves the device in
//! whatever state the failed step left it.
use crate::command::{CommandRunner, StreamEvent, ToolCommand, ToolOutput};
use crate::device::Device;
use crate::error::FlashError;
use crate::platform::{DeviceBackend, FormatOptions, ProgressSource, WriteMethod};
use crate::privilege::{ElevationMode, Elevator};
use crate::progress::{
    COMPLETE, ESTIMATE_CAP, ElapsedEstimate, FORMAT_DONE, FORMAT_START, Progress,
    ProgressTracker, SYNC_START, Stage, WRITE_CAP, WRITE_START, parse_dd_bytes,
};
use crate::write;
use log::{debug, info, warn};
use std::fs::{self, File};
use std::io;
use std::path::Path;

/// Settings for flash jobs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlashOptions {
    /// Bytes per write to the device.
    pub chunk_size: usize,
    /// How to copy the image; `None` uses the platform's default.
    pub write_method: Option<WriteMethod>,
    /// Used when the job formats the device first.
    pub format: FormatOptions,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            chunk_size: write::DEFAULT_CHUNK_SIZE,
            write_method: None,
            format: FormatOptions::platform_default(),
        }
    }
}

/// The collaborators a job runs against.
pub struct Toolbox<'a> {
    pub backend: &'a dyn DeviceBackend,
    pub runner: &'a dyn CommandRunner,
    pub elevator: &'a Elevator,
}

impl Toolbox<'_> {
    /// Runs `command` (elevated if it needs to be) and fails on a non-zero exit.
    fn run(&self, stage: Stage, command: &ToolCommand) -> Result<ToolOutput, FlashError> {
        let mut actual = self.elevator.wrap(command);
        let mut output = self
            .runner
            .output(&actual)
            .map_err(|e| spawn_error(&actual, stage, e))?;
        if self.elevator.login_expired(&actual, &output) {
            warn!("the sudo login expired while {stage}; asking for the password");
            self.elevator.renew()?;
            actual = self.elevator.wrap(command);
            output = self
                .runner
                .output(&actual)
                .map_err(|e| spawn_error(&actual, stage, e))?;
        }
        self.check(stage, &actual, output)
    }

    fn check(
        &self,
        stage: Stage,
        command: &ToolCommand,
        output: ToolOutput,
    ) -> Result<ToolOutput, FlashError> {
        if let Some(err) = self.elevator.rejection(command, &output) {
            return Err(err);
        }
        if !output.success() {
            return Err(FlashError::Tool {
                tool: command.name.clone(),
                stage,
                message: output.failure_text(),
            });
        }
        Ok(output)
    }

    /// Unmounts `device`. A device that is not mounted, or refuses to unmount,
    /// is not an error here; the following step fails if it matters.
    fn unmount(&self, device: &Device) {
        for command in self.backend.unmount_commands(device) {
            match self.run(Stage::Writing, &command) {
                Ok(_) => debug!("{command} succeeded"),
                Err(e) => warn!("could not unmount {}: {e}", device.path.display()),
            }
        }
    }
}

fn spawn_error(command: &ToolCommand, stage: Stage, e: io::Error) -> FlashError {
    FlashError::Tool {
        tool: command.name.clone(),
        stage,
        message: format!("could not run {}: {e}", command.program),
    }
}

struct Reporter<'a> {
    on_progress: &'a mut dyn FnMut(Progress),
}

impl Reporter<'_> {
    fn report(&mut self, stage: Stage, percent: f64, message: impl Into<String>) {
        let progress = Progress::new(stage, percent, message);
        debug!("{:>5.1}% {}", progress.percent, progress.message);
        (self.on_progress)(progress);
    }
}

/// Checks that `image` is a readable regular file and returns its size.
pub fn validate_image(image: &Path) -> Result<u64, FlashError> {
    if image.as_os_str().is_empty() {
        return Err(FlashError::NoImage);
    }
    let metadata = match fs::metadata(image) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(FlashError::ImageNotFound(image.to_path_buf()));
        }
        Err(source) => {
            return Err(FlashError::ImageUnreadable {
                path: image.to_path_buf(),
                source,
            });
        }
    };
    if !metadata.is_file() {
        return Err(FlashError::ImageNotAFile(image.to_path_buf()));
    }
    File::open(image).map_err(|source| FlashError::ImageUnreadable {
        path: image.to_path_buf(),
        source,
    })?;
    Ok(metadata.len())
}

enum WritePlan {
    Tool {
        command: ToolCommand,
        source: ProgressSource,
    },
    Native,
}

/// Every command a flash job will run, decided before any of them runs.
struct Plan {
    format: Option<ToolCommand>,
    write: WritePlan,
    sync: Option<ToolCommand>,
}

impl Plan {
    fn new(
        tools: &Toolbox<'_>,
        image: &Path,
        device: &Device,
        format_requested: bool,
        options: &FlashOptions,
    ) -> Result<Self, FlashError> {
        let format = if format_requested {
            Some(tools.backend.format_command(device, &options.format)?)
        } else {
            None
        };
        let method = options
            .write_method
            .unwrap_or_else(|| tools.backend.default_write_method());
        let write = match method {
            WriteMethod::Tool => {
                let (command, source) =
                    tools
                        .backend
                        .write_command(image, device, options.chunk_size);
                WritePlan::Tool { command, source }
            }
            // `sudo` elevates child processes only; the raw device is opened by
            // this process, which would fail after the device was already
            // formatted.
            WriteMethod::Native if tools.elevator.mode() == ElevationMode::Sudo => {
                return Err(FlashError::Privilege(
                    "writing through a raw device handle needs isoflash itself to run \
                     with administrator rights"
                        .into(),
                ));
            }
            WriteMethod::Native => WritePlan::Native,
        };
        let sync = tools.backend.sync_command(device);
        Ok(Self {
            format,
            write,
            sync,
        })
    }

    fn commands(&self) -> impl Iterator<Item = &ToolCommand> {
        let write = match &self.write {
            WritePlan::Tool { command, .. } => Some(command),
            WritePlan::Native => None,
        };
        self.format.iter().chain(write).chain(self.sync.iter())
    }
}

/// Obtains elevation for the privileged ones among `commands` and the
/// unmounting of `device`, asking for the password if needed.
fn elevate<'c>(
    tools: &Toolbox<'_>,
    device: &Device,
    commands: impl IntoIterator<Item = &'c ToolCommand>,
) -> Result<(), FlashError> {
    let needs_privilege = commands.into_iter().any(|c| c.privileged)
        || tools
            .backend
            .unmount_commands(device)
            .iter()
            .any(|c| c.privileged);
    if needs_privilege {
        tools.elevator.prepare(tools.runner)?;
    }
    Ok(())
}

/// Obtains elevation for a flash job before it starts, so that a front-end
/// can ask for the password on a thread of its choosing. Also fails, without
/// running anything, if the job could not get the rights it needs.
pub fn authorize(
    tools: &Toolbox<'_>,
    image: &Path,
    device: &Device,
    format_requested: bool,
    options: &FlashOptions,
) -> Result<(), FlashError> {
    let plan = Plan::new(tools, image, device, format_requested, options)?;
    elevate(tools, device, plan.commands())
}

/// Like [`authorize`], for a format-only job.
pub fn authorize_format(
    tools: &Toolbox<'_>,
    device: &Device,
    options: &FormatOptions,
) -> Result<(), FlashError> {
    let command = tools.backend.format_command(device, options)?;
    elevate(tools, device, [&command])
}

/// Flashes `image` onto `device`.
///
/// `on_progress` receives monotonically increasing percentages; 100% is only
/// reported after the device has been synced. The image is validated, and
/// every privilege the job needs obtained, before any command runs.
pub fn run(
    tools: &Toolbox<'_>,
    image: &Path,
    device: &Device,
    format_requested: bool,
    options: &FlashOptions,
    on_progress: &mut dyn FnMut(Progress),
) -> Result<(), FlashError> {
    let image_len = validate_image(image)?;
    let mut reporter = Reporter { on_progress };

    let plan = Plan::new(tools, image, device, format_requested, options)?;
    elevate(tools, device, plan.commands())?;

    info!(
        "flashing {} ({image_len} bytes) onto {}",
        image.display(),
        device.path.display()
    );

    if let Some(command) = &plan.format {
        reporter.report(Stage::Formatting, FORMAT_START, "Formatting device...");
        tools.unmount(device);
        tools.run(Stage::Formatting, command)?;
        info!("formatted {} as {}", device.path.display(), options.format.filesystem);
        reporter.report(Stage::Formatting, FORMAT_DONE, "Formatting complete");
    }

    reporter.report(Stage::Writing, WRITE_START, "Flashing image to device...");
    tools.unmount(device);
    let handle = match plan.write {
        WritePlan::Tool { command, source } => write_with_tool(
            tools,
            &command,
            source,
            image,
            image_len,
            device,
            options,
            &mut reporter,
        )?,
        WritePlan::Native => Some(write_native(
            tools,
            image,
            image_len,
            device,
            options,
            &mut reporter,
        )?),
    };

    reporter.report(Stage::Syncing, SYNC_START, "Finalizing and syncing...");
    if let Some(file) = handle {
        file.sync_all()
            .map_err(|e| FlashError::from_io(Stage::Syncing, e))?;
    }
    if let Some(command) = &plan.sync {
        tools.run(Stage::Syncing, command)?;
    }

    info!("flashed {} onto {}", image.display(), device.path.display());
    reporter.report(Stage::Done, COMPLETE, "Flash completed successfully!");
    Ok(())
}

/// Runs the write tool, translating its output (or its silence) into progress.
///
/// Returns a device handle to flush if the tool could not be started and the
/// platform fell back to the native writer.
#[allow(clippy::too_many_arguments)]
fn write_with_tool(
    tools: &Toolbox<'_>,
    command: &ToolCommand,
    source: ProgressSource,
    image: &Path,
    image_len: u64,
    device: &Device,
    options: &FlashOptions,
    reporter: &mut Reporter<'_>,
) -> Result<Option<File>, FlashError> {
    let mut actual = tools.elevator.wrap(command);
    let cap = match source {
        ProgressSource::ByteCounts => WRITE_CAP,
        ProgressSource::Elapsed => ESTIMATE_CAP,
    };
    let mut tracker = ProgressTracker::new(WRITE_START, cap);
    let estimate = ElapsedEstimate::for_image(image_len);

    let mut on_event = |event: StreamEvent<'_>| match (source, event) {
        (ProgressSource::ByteCounts, StreamEvent::Line(line)) => {
            if let Some(percent) = parse_dd_bytes(line).and_then(|n| tracker.bytes(n, image_len)) {
                reporter.report(
                    Stage::Writing,
                    percent,
                    format!("Flashing: {percent:.0}% complete"),
                );
            }
        }
        (ProgressSource::Elapsed, StreamEvent::Tick(elapsed)) => {
            if let Some(percent) = tracker.fraction(estimate.fraction(elapsed)) {
                reporter.report(
                    Stage::Writing,
                    percent,
                    format!("Flashing in progress... (estimate: {percent:.0}%)"),
                );
            }
        }
        _ => {}
    };

    let mut streamed = tools.runner.stream(&actual, &mut on_event);
    if let Ok(output) = &streamed {
        if tools.elevator.login_expired(&actual, output) {
            warn!("the sudo login expired before writing; asking for the password");
            tools.elevator.renew()?;
            actual = tools.elevator.wrap(command);
            streamed = tools.runner.stream(&actual, &mut on_event);
        }
    }

    let can_fall_back =
        tools.backend.native_fallback() && tools.elevator.mode() == ElevationMode::Direct;
    match streamed {
        Err(e) if e.kind() == io::ErrorKind::NotFound && can_fall_back => {
            warn!("{} is not available ({e}); writing natively", actual.program);
            write_native(tools, image, image_len, device, options, reporter).map(Some)
        }
        Err(e) => Err(spawn_error(&actual, Stage::Writing, e)),
        Ok(output) => {
            tools.check(Stage::Writing, &actual, output)?;
            Ok(None)
        }
    }
}

/// Copies the image through a raw device handle, returning the handle so the
/// caller can flush it.
fn write_native(
    tools: &Toolbox<'_>,
    image: &Path,
    image_len: u64,
    device: &Device,
    options: &FlashOptions,
    reporter: &mut Reporter<'_>,
) -> Result<File, FlashError> {
    let target = tools.backend.raw_path(device);
    let direct_io = tools.backend.direct_io();

    let mut source = File::open(image).map_err(|source| FlashError::ImageUnreadable {
        path: image.to_path_buf(),
        source,
    })?;
    let mut handle = write::open_target(&target, direct_io)
        .map_err(|e| FlashError::from_io(Stage::Writing, e))?;
    let block_size = (direct_io || cfg!(windows)).then(|| write::block_size(&handle));
    debug!(
        "opened {} for raw writing (block size {block_size:?})",
        target.display()
    );

    let mut tracker = ProgressTracker::new(WRITE_START, WRITE_CAP);
    write::copy_image(
        &mut source,
        image_len,
        &mut handle,
        options.chunk_size,
        block_size,
        |written| {
            if let Some(percent) = tracker.bytes(written, image_len) {
                reporter.report(
                    Stage::Writing,
                    percent,
                    format!("Flashing: {percent:.0}% complete"),
                );
            }
        },
    )
    .map_err(|e| FlashError::from_io(Stage::Writing, e))?;

    Ok(handle)
}

/// Formats `device` without writing an image.
pub fn format(
    tools: &Toolbox<'_>,
    device: &Device,
    options: &FormatOptions,
    on_progress: &mut dyn FnMut(Progress),
) -> Result<(), FlashError> {
    let mut reporter = Reporter { on_progress };
    let command = tools.backend.format_command(device, options)?;
    elevate(tools, device, [&command])?;

    reporter.report(Stage::Formatting, FORMAT_START, "Formatting device...");
    tools.unmount(device);
    tools.run(Stage::Formatting, &command)?;
    info!("formatted {} as {}", device.path.display(), options.filesystem);
    reporter.report(Stage::Done, COMPLETE, "Format completed successfully!");
    Ok(())
}
