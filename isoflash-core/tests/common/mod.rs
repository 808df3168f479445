#![allow(dead_code)]

use isoflash_core::command::{CommandRunner, StreamEvent, ToolCommand, ToolOutput};
use isoflash_core::device::Device;
use isoflash_core::error::FlashError;
use isoflash_core::flash::FlashOptions;
use isoflash_core::platform::{DeviceBackend, FormatOptions, ProgressSource, WriteMethod};
use isoflash_core::privilege::Elevator;
use isoflash_core::session::Session;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What a scripted tool does when run.
#[derive(Clone, Debug, Default)]
pub struct Script {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Lines streamed before the tool exits.
    pub lines: Vec<String>,
    /// Ticks streamed before the tool exits.
    pub ticks: Vec<Duration>,
    /// Makes the tool impossible to start.
    pub spawn_error: Option<io::ErrorKind>,
    /// Makes the runner panic instead of running the tool.
    pub panic: bool,
}

impl Script {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn fail(code: i32, stderr: &str) -> Self {
        Self {
            code,
            stderr: stderr.to_string(),
            ..Default::default()
        }
    }

    pub fn missing() -> Self {
        Self {
            spawn_error: Some(io::ErrorKind::NotFound),
            ..Default::default()
        }
    }
}

/// A [`CommandRunner`] that plays back scripts keyed by tool name and
/// records every command it is asked to run.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<String, Script>>,
    /// Played, in order, before falling back to `scripts`.
    once: Mutex<HashMap<String, VecDeque<Script>>>,
    gates: Mutex<HashMap<String, Receiver<()>>>,
    /// Shared with progress callbacks so the relative order can be checked.
    pub log: Arc<Mutex<Vec<String>>>,
    calls: Mutex<Vec<ToolCommand>>,
}

impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, name: &str, script: Script) {
        self.scripts.lock().unwrap().insert(name.to_string(), script);
    }

    /// Plays `script` for the next run of `name` only.
    pub fn script_once(&self, name: &str, script: Script) {
        self.once
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push_back(script);
    }

    /// Makes `name` block until a message arrives on `gate`.
    pub fn gate(&self, name: &str, gate: Receiver<()>) {
        self.gates.lock().unwrap().insert(name.to_string(), gate);
    }

    pub fn calls(&self) -> Vec<ToolCommand> {
        self.calls.lock().unwrap().clone()
    }

    /// The names of the tools run so far, in order.
    pub fn names(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.name).collect()
    }

    pub fn ran(&self, name: &str) -> bool {
        self.names().iter().any(|n| n == name)
    }

    fn play(
        &self,
        command: &ToolCommand,
        on_event: &mut dyn FnMut(StreamEvent<'_>),
    ) -> io::Result<ToolOutput> {
        self.calls.lock().unwrap().push(command.clone());
        self.log.lock().unwrap().push(format!("run:{}", command.name));

        let queued = self
            .once
            .lock()
            .unwrap()
            .get_mut(&command.name)
            .and_then(VecDeque::pop_front);
        let script = queued.unwrap_or_else(|| {
            self.scripts
                .lock()
                .unwrap()
                .get(&command.name)
                .cloned()
                .unwrap_or_default()
        });
        if let Some(kind) = script.spawn_error {
            return Err(io::Error::from(kind));
        }
        if script.panic {
            panic!("{} blew up", command.name);
        }
        let gate = self.gates.lock().unwrap().remove(&command.name);
        if let Some(gate) = gate {
            gate.recv().ok();
        }
        for line in &script.lines {
            on_event(StreamEvent::Line(line));
        }
        for tick in &script.ticks {
            on_event(StreamEvent::Tick(*tick));
        }
        Ok(ToolOutput {
            code: Some(script.code),
            stdout: script.stdout,
            stderr: script.stderr,
        })
    }
}

impl CommandRunner for ScriptedRunner {
    fn output(&self, command: &ToolCommand) -> io::Result<ToolOutput> {
        self.play(command, &mut |_| {})
    }

    fn stream(
        &self,
        command: &ToolCommand,
        on_event: &mut dyn FnMut(StreamEvent<'_>),
    ) -> io::Result<ToolOutput> {
        self.play(command, on_event)
    }
}

/// A backend with fixed devices and simple, recognizable commands.
pub struct FakeBackend {
    pub devices: Arc<Mutex<Vec<Device>>>,
    pub list_calls: Arc<AtomicUsize>,
    pub write_method: WriteMethod,
    pub progress_source: ProgressSource,
    pub raw_path: Option<PathBuf>,
    pub native_fallback: bool,
    pub privileged_write: bool,
    pub privileged_sync: bool,
}

impl FakeBackend {
    pub fn new(devices: Vec<Device>) -> Self {
        Self {
            devices: Arc::new(Mutex::new(devices)),
            list_calls: Arc::new(AtomicUsize::new(0)),
            write_method: WriteMethod::Tool,
            progress_source: ProgressSource::ByteCounts,
            raw_path: None,
            native_fallback: false,
            privileged_write: false,
            privileged_sync: false,
        }
    }
}

impl DeviceBackend for FakeBackend {
    fn platform(&self) -> &'static str {
        "test"
    }

    fn list_devices(&self) -> Vec<Device> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.devices.lock().unwrap().clone()
    }

    fn unmount_commands(&self, device: &Device) -> Vec<ToolCommand> {
        vec![ToolCommand::new("umount").arg(device.path.to_string_lossy())]
    }

    fn format_command(
        &self,
        device: &Device,
        options: &FormatOptions,
    ) -> Result<ToolCommand, FlashError> {
        Ok(ToolCommand::new("mkfs")
            .arg(format!("-t{}", options.filesystem))
            .arg(device.path.to_string_lossy()))
    }

    fn default_write_method(&self) -> WriteMethod {
        self.write_method
    }

    fn write_command(
        &self,
        image: &Path,
        device: &Device,
        chunk_size: usize,
    ) -> (ToolCommand, ProgressSource) {
        let mut cmd = ToolCommand::new("dd").args([
            format!("if={}", image.display()),
            format!("of={}", device.path.display()),
            format!("bs={chunk_size}"),
        ]);
        if self.privileged_write {
            cmd = cmd.privileged();
        }
        (cmd, self.progress_source)
    }

    fn native_fallback(&self) -> bool {
        self.native_fallback
    }

    fn raw_path(&self, device: &Device) -> PathBuf {
        self.raw_path.clone().unwrap_or_else(|| device.path.clone())
    }

    fn sync_command(&self, _device: &Device) -> Option<ToolCommand> {
        let cmd = ToolCommand::new("sync");
        Some(if self.privileged_sync { cmd.privileged() } else { cmd })
    }
}

pub fn usb_stick() -> Device {
    Device::new("/dev/sdz", "sdz", 16 * 1024 * 1024 * 1024).with_label("Test Stick")
}

/// A temporary image file of `len` bytes.
pub fn image(len: usize) -> tempfile::NamedTempFile {
    let file = tempfile::NamedTempFile::new().unwrap();
    let data: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
    std::fs::write(file.path(), data).unwrap();
    file
}

pub fn session(backend: FakeBackend, runner: Arc<ScriptedRunner>) -> Session {
    session_with(backend, runner, Elevator::direct(), FlashOptions::default())
}

pub fn session_with(
    backend: FakeBackend,
    runner: Arc<ScriptedRunner>,
    elevator: Elevator,
    options: FlashOptions,
) -> Session {
    let session = Session::new(Box::new(backend), runner, elevator, options);
    session.refresh_devices();
    session
}
