use anyhow::{Context, Result, anyhow};
use clap::Parser;
use console::style;
use dialoguer::{Confirm, Password, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use isoflash::{Cli, Commands, FlashArgs, FormatArgs};
use isoflash_core::FlashError;
use isoflash_core::command::SystemRunner;
use isoflash_core::device::Device;
use isoflash_core::privilege::{CredentialPrompt, OsascriptPrompt};
use isoflash_core::session::{JobEvent, JobHandle, Session};
use log::LevelFilter;
use std::io::{IsTerminal, stdin, stdout};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `ECHOCTL` is the terminal flag that causes Ctrl+C to be printed as `^C`.
/// By disabling it, the `ctrlc` handler's own message is all the user sees.
/// The original terminal state is restored when this struct is dropped, or
/// by [`TermRestorer::restore`] before exiting from the handler.
#[derive(Clone)]
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }
            let fd = stdout().as_raw_fd();
            let original_termios = Termios::from_fd(fd).ok().filter(|original| {
                let mut quiet = *original;
                quiet.c_lflag &= !ECHOCTL;
                tcsetattr(fd, TCSANOW, &quiet).is_ok()
            });
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    fn restore(&self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, original_termios).ok();
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Asks for the administrator password on the terminal.
struct TerminalPrompt;

impl CredentialPrompt for TerminalPrompt {
    fn password(&self, reason: &str) -> Option<String> {
        println!("{}", style(reason).yellow());
        Password::with_theme(&ColorfulTheme::default())
            .with_prompt("Password")
            .allow_empty_password(true)
            .interact()
            .ok()
    }
}

/// The terminal when there is one; otherwise a native dialog on macOS.
fn credential_prompt() -> Option<Arc<dyn CredentialPrompt>> {
    if stdin().is_terminal() && stdout().is_terminal() {
        Some(Arc::new(TerminalPrompt))
    } else if cfg!(target_os = "macos") {
        Some(Arc::new(OsascriptPrompt::new(Arc::new(SystemRunner::new()))))
    } else {
        None
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

/// Presents an interactive menu for the user to select a device.
fn select_device(devices: &[Device], prompt: &str) -> Result<Device> {
    if devices.is_empty() {
        return Err(anyhow!("No removable devices found."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

/// The device named on the command line, or the one the user picks.
fn pick_device(session: &Session, requested: Option<&Path>, prompt: &str) -> Result<Device> {
    let devices = session.refresh_devices();
    match requested {
        Some(path) => Ok(session.find_device(path)?),
        None => select_device(&devices, prompt),
    }
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

fn job_bar() -> ProgressBar {
    let pb = ProgressBar::new(1000);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{prefix:12} [{elapsed_precise}] [{bar:40.green/black}] {percent:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("■ "),
    );
    pb.enable_steady_tick(Duration::from_millis(200));
    pb
}

/// Renders the events of `job` until it finishes.
///
/// The bar is only drawn once the first progress event arrives, so a password
/// prompt issued by the job is not drawn over.
fn follow(job: JobHandle, mut on_devices: impl FnMut(Vec<Device>)) -> Result<(), FlashError> {
    let mut bar: Option<ProgressBar> = None;
    let result = job.wait(|event| match event {
        JobEvent::Progress(progress) => {
            let pb = bar.get_or_insert_with(job_bar);
            pb.set_prefix(progress.stage.title());
            pb.set_position((progress.percent * 10.0).round() as u64);
            pb.set_message(progress.message);
        }
        JobEvent::DevicesRefreshed(devices) => on_devices(devices),
        JobEvent::Finished(_) => {}
    });

    if let Some(pb) = bar {
        match &result {
            Ok(()) => pb.finish(),
            Err(_) => pb.abandon_with_message("❌ Operation failed."),
        }
    }
    result
}

fn print_devices(devices: &[Device]) {
    if devices.is_empty() {
        println!("No removable devices found.");
        return;
    }

    println!("Found {} removable devices:", devices.len());
    println!(
        "\n  {:<14} {:<25} {:<10} {}",
        "DEVICE", "LABEL", "SIZE", "LOCATION"
    );
    println!("  {:-<14} {:-<25} {:-<10} {:-<20}", "", "", "", "");
    for device in devices {
        let location = match &device.mount_point {
            Some(mount_point) => mount_point.display().to_string(),
            None => "(Not mounted)".to_string(),
        };
        println!(
            "  {:<14} {:<25} {:>7.1} GB  {}",
            device.path.display(),
            device.label,
            device.size_gb(),
            location
        );
    }
}

fn flash(session: &Arc<Session>, args: &FlashArgs, job_running: &AtomicBool) -> Result<()> {
    let device = pick_device(session, args.device.as_deref(), "Select the target device to FLASH")?;
    let device = session.validate_flash(&args.image, Some(&device))?;

    println!(
        "{} This will erase all data on '{}' ({:.1} GB).",
        style("WARNING:").red().bold(),
        device.name,
        device.size_gb(),
    );
    println!("  Device: {}", style(device.path.display()).cyan());
    println!("  Image:  {}", style(args.image.display()).cyan());
    if args.format_requested() {
        let format = &session.options().format;
        println!(
            "  Format: {} \"{}\" first",
            style(format.filesystem).cyan(),
            format.label
        );
    }
    println!();

    if !args.yes && !confirm_operation("Are you sure you want to proceed?")? {
        println!("Flash operation cancelled.");
        return Ok(());
    }
    println!();

    // Any password prompt runs here, on the terminal's thread.
    session
        .authorize_flash(&args.image, &device, args.format_requested())
        .with_context(|| format!("Failed to flash {}", device.path.display()))?;

    job_running.store(true, Ordering::SeqCst);
    let result = session
        .spawn_flash(args.image.clone(), device.clone(), args.format_requested())
        .and_then(|job| follow(job, |_| {}));
    job_running.store(false, Ordering::SeqCst);

    result.with_context(|| format!("Failed to flash {}", device.path.display()))?;
    println!(
        "\n✨ Successfully flashed {} with {}.",
        style(device.path.display()).cyan(),
        style(args.image.display()).cyan()
    );
    Ok(())
}

fn format(
    session: &Arc<Session>,
    device: Option<&Path>,
    args: &FormatArgs,
    yes: bool,
    job_running: &AtomicBool,
) -> Result<()> {
    let device = pick_device(session, device, "Select the device to FORMAT")?;
    let device = session.validate_device(Some(&device))?;
    let options = args.options();

    println!(
        "{} This will erase all data on '{}' ({:.1} GB).",
        style("WARNING:").red().bold(),
        device.name,
        device.size_gb(),
    );
    println!("  Device: {}", style(device.path.display()).cyan());
    println!(
        "  Format: {} \"{}\"",
        style(options.filesystem).cyan(),
        options.label
    );
    println!();

    if !yes && !confirm_operation("Are you sure you want to proceed?")? {
        println!("Format operation cancelled.");
        return Ok(());
    }
    println!();

    session
        .authorize_format(&device)
        .with_context(|| format!("Failed to format {}", device.path.display()))?;

    let mut refreshed = Vec::new();
    job_running.store(true, Ordering::SeqCst);
    let result = session
        .spawn_format(device.clone())
        .and_then(|job| follow(job, |devices| refreshed = devices));
    job_running.store(false, Ordering::SeqCst);

    result.with_context(|| format!("Failed to format {}", device.path.display()))?;
    println!(
        "\n✨ Formatted {} as {}.\n",
        style(device.path.display()).cyan(),
        options.filesystem
    );
    print_devices(&refreshed);
    println!("\n{}", style("Ready").green().bold());
    Ok(())
}

fn main() -> Result<()> {
    // This guard will be dropped when main() exits, restoring the terminal.
    let term_restorer = TermRestorer::new();

    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Running jobs are not interruptible; a half-written device is worse than
    // waiting for the job to end.
    let job_running = Arc::new(AtomicBool::new(false));
    {
        let job_running = job_running.clone();
        let term_restorer = term_restorer.clone();
        ctrlc::set_handler(move || {
            if job_running.load(Ordering::SeqCst) {
                eprintln!(
                    "\n{} The device is being written; it will be left unusable if stopped now. Please wait for the job to finish.",
                    style("WARNING:").yellow().bold()
                );
            } else {
                term_restorer.restore();
                eprintln!("\nCancelled.");
                std::process::exit(130);
            }
        })?;
    }

    let session = Arc::new(Session::native(cli.command.options(), credential_prompt()));

    match &cli.command {
        Commands::Flash(args) => flash(&session, args, &job_running)?,
        Commands::Format {
            device,
            format: args,
            yes,
        } => format(&session, device.as_deref(), args, *yes, &job_running)?,
        Commands::List => print_devices(&session.refresh_devices()),
    }

    Ok(())
}
