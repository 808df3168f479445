//! Invocation of the external tools that do the actual work.
//!
//! Every subprocess the library starts goes through a [`CommandRunner`], so
//! that front-ends and tests can observe or replace them. [`SystemRunner`] is
//! the real implementation on top of `std::process`.

use log::debug;
use std::fmt;
use std::io::{self, Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

/// A fully described external command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolCommand {
    /// The tool this command runs, kept even when it is wrapped by an
    /// elevation helper. Used in error messages.
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    /// Text written to the child's standard input before it is closed.
    pub stdin: Option<String>,
    /// Whether the command needs administrator rights.
    pub privileged: bool,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        let program = program.into();
        Self {
            name: program.clone(),
            program,
            args: Vec::new(),
            stdin: None,
            privileged: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(' ') {
                write!(f, " {arg:?}")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// The result of a finished command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code, `None` if the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// The text to show the user when the command failed: stderr if there is
    /// any, otherwise stdout, otherwise the exit status.
    pub fn failure_text(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        match self.code {
            Some(code) => format!("exited with status {code}"),
            None => "terminated by a signal".to_string(),
        }
    }
}

/// Something observed while a streamed command runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamEvent<'a> {
    /// A line of output from stdout or stderr. Carriage returns count as line
    /// breaks, since progress meters redraw with them.
    Line(&'a str),
    /// Emitted periodically while the command is silent, with the time since
    /// it started.
    Tick(Duration),
}

pub trait CommandRunner: Send + Sync {
    /// Runs `command` to completion and captures its output.
    fn output(&self, command: &ToolCommand) -> io::Result<ToolOutput>;

    /// Runs `command` to completion, reporting its output line by line as it
    /// is produced.
    fn stream(
        &self,
        command: &ToolCommand,
        on_event: &mut dyn FnMut(StreamEvent<'_>),
    ) -> io::Result<ToolOutput>;
}

/// Runs commands as real child processes.
#[derive(Clone, Debug)]
pub struct SystemRunner {
    tick: Duration,
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
        }
    }
}

impl SystemRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how often [`StreamEvent::Tick`] is emitted while a command is quiet.
    pub fn with_tick(tick: Duration) -> Self {
        Self { tick }
    }

    fn spawn(&self, command: &ToolCommand) -> io::Result<Child> {
        debug!("running: {command}");
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Keep children out of the terminal's foreground group so that a
        // Ctrl+C aimed at the front-end does not kill a write half-way.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn()?;
        if let (Some(input), Some(mut stdin)) = (&command.stdin, child.stdin.take()) {
            // A child that exits before reading its input reports that
            // through its exit status.
            stdin.write_all(input.as_bytes()).ok();
        }
        Ok(child)
    }
}

#[derive(Clone, Copy)]
enum Pipe {
    Stdout,
    Stderr,
}

/// Reads `reader` to the end, sending each `\n`- or `\r`-terminated line.
fn pump<R: Read>(mut reader: R, pipe: Pipe, tx: mpsc::Sender<(Pipe, String)>) {
    let mut buf = [0u8; 4096];
    let mut line = Vec::new();
    let send = |line: &mut Vec<u8>| {
        let text = String::from_utf8_lossy(line).into_owned();
        line.clear();
        tx.send((pipe, text)).is_ok()
    };

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &byte in &buf[..n] {
            if byte == b'\n' || byte == b'\r' {
                if !line.is_empty() && !send(&mut line) {
                    return;
                }
            } else {
                line.push(byte);
            }
        }
    }
    if !line.is_empty() {
        send(&mut line);
    }
}

impl CommandRunner for SystemRunner {
    fn output(&self, command: &ToolCommand) -> io::Result<ToolOutput> {
        let output = self.spawn(command)?.wait_with_output()?;
        Ok(ToolOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn stream(
        &self,
        command: &ToolCommand,
        on_event: &mut dyn FnMut(StreamEvent<'_>),
    ) -> io::Result<ToolOutput> {
        let started = Instant::now();
        let mut child = self.spawn(command)?;

        let (tx, rx) = mpsc::channel();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            readers.push(thread::spawn(move || pump(stdout, Pipe::Stdout, tx)));
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = tx.clone();
            readers.push(thread::spawn(move || pump(stderr, Pipe::Stderr, tx)));
        }
        drop(tx);

        let mut output = ToolOutput::default();
        loop {
            match rx.recv_timeout(self.tick) {
                Ok((pipe, line)) => {
                    on_event(StreamEvent::Line(&line));
                    let buf = match pipe {
                        Pipe::Stdout => &mut output.stdout,
                        Pipe::Stderr => &mut output.stderr,
                    };
                    buf.push_str(&line);
                    buf.push('\n');
                }
                Err(RecvTimeoutError::Timeout) => on_event(StreamEvent::Tick(started.elapsed())),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        for reader in readers {
            reader.join().ok();
        }
        output.code = child.wait()?.code();
        Ok(output)
    }
}
