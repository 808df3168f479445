//! Elevation of the commands that need administrator rights.
//!
//! When the process is not already elevated, privileged commands are re-run
//! through `sudo`. The password is asked for at most once per job through a
//! [`CredentialPrompt`], kept in memory only, and dropped by
//! [`Elevator::forget`] when the job ends.

use crate::command::{CommandRunner, ToolCommand, ToolOutput};
use crate::error::FlashError;
use log::{debug, info};
use std::sync::{Arc, Mutex, MutexGuard};

/// Asks the user for their administrator password.
pub trait CredentialPrompt: Send + Sync {
    /// Returns `None` if the user declined.
    fn password(&self, reason: &str) -> Option<String>;
}

/// Asks for the password with a native macOS dialog through `osascript`.
pub struct OsascriptPrompt {
    runner: Arc<dyn CommandRunner>,
}

impl OsascriptPrompt {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl CredentialPrompt for OsascriptPrompt {
    fn password(&self, reason: &str) -> Option<String> {
        let script = format!(
            r#"tell application "System Events"
    display dialog "{}" & return & return & "Please enter your password:" with title "isoflash" default answer "" with hidden answer buttons {{"Cancel", "OK"}} default button "OK" with icon caution
    if button returned of result is "OK" then
        return text returned of result
    else
        return ""
    end if
end tell"#,
            reason.replace('\\', "\\\\").replace('"', "\\\"")
        );
        let output = self
            .runner
            .output(&ToolCommand::new("osascript").args(["-e", &script]))
            .ok()?;
        let password = output.stdout.trim_end_matches(['\r', '\n']);
        (output.success() && !password.is_empty()).then(|| password.to_string())
    }
}

/// How privileged commands are run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElevationMode {
    /// The process already has the rights it needs.
    Direct,
    /// Commands are wrapped with `sudo`.
    Sudo,
}

#[derive(Default)]
enum Credential {
    #[default]
    Unknown,
    /// `sudo` works without a password (cached timestamp or NOPASSWD).
    NotNeeded,
    Password(String),
}

pub struct Elevator {
    mode: ElevationMode,
    prompt: Option<Arc<dyn CredentialPrompt>>,
    credential: Mutex<Credential>,
}

const PROMPT_REASON: &str = "Administrator privileges are required to flash the device.";

impl Elevator {
    /// An elevator for a process that already runs with enough rights.
    pub fn direct() -> Self {
        Self {
            mode: ElevationMode::Direct,
            prompt: None,
            credential: Mutex::new(Credential::Unknown),
        }
    }

    pub fn sudo(prompt: Option<Arc<dyn CredentialPrompt>>) -> Self {
        Self {
            mode: ElevationMode::Sudo,
            prompt,
            credential: Mutex::new(Credential::Unknown),
        }
    }

    /// Picks [`ElevationMode::Direct`] when running as root (and always on
    /// Windows, where raw access is checked when the device is opened), and
    /// `sudo` otherwise.
    pub fn detect(prompt: Option<Arc<dyn CredentialPrompt>>) -> Self {
        #[cfg(unix)]
        {
            if nix::unistd::geteuid().is_root() {
                Self::direct()
            } else {
                Self::sudo(prompt)
            }
        }
        #[cfg(not(unix))]
        {
            let _ = prompt;
            Self::direct()
        }
    }

    pub fn mode(&self) -> ElevationMode {
        self.mode
    }

    fn credential(&self) -> MutexGuard<'_, Credential> {
        self.credential
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes sure privileged commands of the current job can run, asking for
    /// the password if `sudo` needs one. Does nothing if this job already
    /// obtained a credential.
    pub fn prepare(&self, runner: &dyn CommandRunner) -> Result<(), FlashError> {
        if self.mode == ElevationMode::Direct {
            return Ok(());
        }
        let mut credential = self.credential();
        if !matches!(*credential, Credential::Unknown) {
            return Ok(());
        }

        let check = ToolCommand::new("sudo").args(["-n", "true"]);
        if runner.output(&check).is_ok_and(|output| output.success()) {
            debug!("sudo does not need a password");
            *credential = Credential::NotNeeded;
            return Ok(());
        }

        self.ask(&mut credential)
    }

    fn ask(&self, credential: &mut Credential) -> Result<(), FlashError> {
        let prompt = self.prompt.as_ref().ok_or_else(|| {
            FlashError::Privilege("no way to ask for the administrator password".into())
        })?;
        match prompt.password(PROMPT_REASON) {
            Some(password) if !password.is_empty() => {
                info!("administrator password provided for this job");
                *credential = Credential::Password(password);
                Ok(())
            }
            _ => Err(FlashError::Privilege(
                "the administrator password was not provided".into(),
            )),
        }
    }

    /// Recognizes `sudo -n` refusing a command because the cached login it
    /// relied on expired while the job ran.
    pub fn login_expired(&self, command: &ToolCommand, output: &ToolOutput) -> bool {
        if output.success() || self.mode == ElevationMode::Direct || !command.privileged {
            return false;
        }
        matches!(*self.credential(), Credential::NotNeeded)
            && output
                .stderr
                .to_ascii_lowercase()
                .contains("a password is required")
    }

    /// Asks for the password after [`Elevator::login_expired`]. This is the
    /// job's only prompt, since `prepare` found no password necessary.
    pub fn renew(&self) -> Result<(), FlashError> {
        let mut credential = self.credential();
        if matches!(*credential, Credential::Password(_)) {
            return Ok(());
        }
        self.ask(&mut credential)
    }

    /// Returns the command to actually run for `command`.
    ///
    /// Unprivileged commands, and every command in [`ElevationMode::Direct`],
    /// are returned unchanged.
    pub fn wrap(&self, command: &ToolCommand) -> ToolCommand {
        if !command.privileged || self.mode == ElevationMode::Direct {
            return command.clone();
        }

        let mut wrapped = ToolCommand::new("sudo");
        match &*self.credential() {
            Credential::Password(password) => {
                wrapped = wrapped.args(["-S", "-p", ""]);
                wrapped.stdin = Some(format!("{password}\n"));
            }
            Credential::NotNeeded | Credential::Unknown => wrapped = wrapped.arg("-n"),
        }
        wrapped = wrapped
            .arg(command.program.as_str())
            .args(command.args.iter().cloned());
        wrapped.name = command.name.clone();
        wrapped.privileged = true;
        wrapped
    }

    /// Recognizes `sudo` refusing to run a wrapped command.
    pub fn rejection(&self, command: &ToolCommand, output: &ToolOutput) -> Option<FlashError> {
        if output.success() || self.mode == ElevationMode::Direct || !command.privileged {
            return None;
        }
        let stderr = output.stderr.to_ascii_lowercase();
        let rejected = stderr.contains("incorrect password")
            || stderr.contains("sorry, try again")
            || stderr.contains("a password is required")
            || stderr.contains("is not in the sudoers file");
        if !rejected {
            return None;
        }
        // A wrong password must be asked for again by the next job.
        *self.credential() = Credential::Unknown;
        Some(FlashError::Privilege(output.failure_text()))
    }

    /// Drops any cached credential. Called at the end of every job.
    pub fn forget(&self) {
        *self.credential() = Credential::Unknown;
    }

    /// Whether a credential is cached for the current job.
    pub fn has_credential(&self) -> bool {
        !matches!(*self.credential(), Credential::Unknown)
    }
}
