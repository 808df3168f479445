mod common;

use common::{FakeBackend, Script, ScriptedRunner, image, session, session_with, usb_stick};
use isoflash_core::command::CommandRunner;
use isoflash_core::device::Device;
use isoflash_core::flash::FlashOptions;
use isoflash_core::platform::{DeviceBackend, LinuxBackend, MacosBackend};
use isoflash_core::privilege::{CredentialPrompt, Elevator};
use isoflash_core::progress::Stage;
use isoflash_core::session::{JobEvent, Session};
use isoflash_core::{ErrorKind, FlashError};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;

#[test]
fn format_only_twice_leaves_the_session_ready_with_fresh_devices() {
    let runner = ScriptedRunner::new();
    let backend = FakeBackend::new(vec![usb_stick()]);
    let devices = backend.devices.clone();
    let list_calls = backend.list_calls.clone();
    let session = session(backend, runner.clone());
    assert_eq!(list_calls.load(Ordering::SeqCst), 1);

    let mut last = None;
    session
        .format(&usb_stick(), &mut |p| last = Some(p))
        .unwrap();
    let last = last.unwrap();
    assert_eq!(last.stage, Stage::Done);
    assert_eq!(last.percent, 100.0);
    assert_eq!(last.message, "Format completed successfully!");
    assert!(!session.is_busy());
    assert_eq!(list_calls.load(Ordering::SeqCst), 2);

    devices.lock().unwrap()[0].label = "FLASHDRIVE".into();
    session.format(&usb_stick(), &mut |_| {}).unwrap();

    assert!(!session.is_busy());
    assert_eq!(list_calls.load(Ordering::SeqCst), 3);
    assert_eq!(session.devices()[0].label, "FLASHDRIVE");
    assert_eq!(runner.names(), ["umount", "mkfs", "umount", "mkfs"]);
}

#[test]
fn failed_format_still_refreshes_devices() {
    let runner = ScriptedRunner::new();
    runner.script("mkfs", Script::fail(1, "mkfs: device busy"));
    let backend = FakeBackend::new(vec![usb_stick()]);
    let list_calls = backend.list_calls.clone();
    let session = session(backend, runner);

    let err = session.format(&usb_stick(), &mut |_| {}).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Tool);
    assert_eq!(list_calls.load(Ordering::SeqCst), 2);
    assert!(!session.is_busy());
}

#[test]
fn format_uses_the_configured_filesystem() {
    let runner = ScriptedRunner::new();
    let session = session(FakeBackend::new(vec![usb_stick()]), runner.clone());

    session.format(&usb_stick(), &mut |_| {}).unwrap();

    let mkfs = &runner.calls()[1];
    let filesystem = session.options().format.filesystem;
    assert_eq!(mkfs.args[0], format!("-t{filesystem}"));
}

#[test]
fn a_second_job_is_refused_while_one_is_running() {
    let runner = ScriptedRunner::new();
    let (release, gate) = mpsc::channel();
    runner.gate("dd", gate);
    let session = Arc::new(session(FakeBackend::new(vec![usb_stick()]), runner.clone()));
    let img = image(4096);

    let job = session
        .spawn_flash(img.path().to_path_buf(), usb_stick(), false)
        .unwrap();
    assert!(session.is_busy());

    let err = session.flash(img.path(), &usb_stick(), false, &mut |_| {}).unwrap_err();
    assert!(matches!(err, FlashError::Busy));
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(matches!(
        session.format(&usb_stick(), &mut |_| {}),
        Err(FlashError::Busy)
    ));
    assert!(matches!(
        session.spawn_format(usb_stick()),
        Err(FlashError::Busy)
    ));

    release.send(()).unwrap();
    job.wait(|_| {}).unwrap();

    assert!(!session.is_busy());
    assert_eq!(runner.names(), ["umount", "dd", "sync"]);
}

#[test]
fn spawned_flash_streams_progress_and_finishes_last() {
    let runner = ScriptedRunner::new();
    let session = Arc::new(session(FakeBackend::new(vec![usb_stick()]), runner));
    let img = image(4096);

    let job = session
        .spawn_flash(img.path().to_path_buf(), usb_stick(), true)
        .unwrap();
    let events: Vec<JobEvent> = job.events().iter().collect();

    let Some(JobEvent::Finished(Ok(()))) = events.last() else {
        panic!("the last event should be a successful Finished, got {events:?}");
    };
    let percents: Vec<f64> = events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Progress(p) => Some(p.percent),
            _ => None,
        })
        .collect();
    assert_eq!(percents, [10.0, 20.0, 25.0, 95.0, 100.0]);
    assert!(!session.is_busy());
}

#[test]
fn spawned_format_reports_the_refreshed_devices() {
    let runner = ScriptedRunner::new();
    let backend = FakeBackend::new(vec![usb_stick()]);
    let devices = backend.devices.clone();
    let session = Arc::new(session(backend, runner));
    let relabeled = usb_stick().with_label("FLASHDRIVE");
    *devices.lock().unwrap() = vec![relabeled.clone()];

    let job = session.spawn_format(usb_stick()).unwrap();
    let mut refreshed = None;
    job.wait(|event| {
        if let JobEvent::DevicesRefreshed(list) = event {
            refreshed = Some(list);
        }
    })
    .unwrap();

    assert_eq!(refreshed.unwrap(), [relabeled.clone()]);
    assert_eq!(session.devices(), [relabeled]);
    assert!(!session.is_busy());
}

#[test]
fn a_panicking_job_becomes_an_internal_error() {
    let runner = ScriptedRunner::new();
    runner.script(
        "dd",
        Script {
            panic: true,
            ..Default::default()
        },
    );
    let session = Arc::new(session(FakeBackend::new(vec![usb_stick()]), runner));
    let img = image(4096);

    let err = session
        .spawn_flash(img.path().to_path_buf(), usb_stick(), false)
        .unwrap()
        .wait(|_| {})
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(err.to_string().contains("dd blew up"));
    assert!(!session.is_busy());
}

#[test]
fn find_device_looks_up_the_last_enumeration() {
    let session = session(FakeBackend::new(vec![usb_stick()]), ScriptedRunner::new());

    assert_eq!(
        session.find_device(std::path::Path::new("/dev/sdz")).unwrap(),
        usb_stick()
    );
    assert!(matches!(
        session.find_device(std::path::Path::new("/dev/sda")),
        Err(FlashError::UnknownDevice(_))
    ));
}

fn runner_with(name: &str, script: Script) -> Arc<ScriptedRunner> {
    let runner = ScriptedRunner::new();
    runner.script(name, script);
    runner
}

#[test]
fn linux_enumeration_failure_yields_no_devices() {
    let missing: Arc<dyn CommandRunner> = runner_with("lsblk", Script::missing());
    assert!(LinuxBackend::with_system_disk(missing, None).list_devices().is_empty());

    let failing: Arc<dyn CommandRunner> = runner_with("lsblk", Script::fail(1, "lsblk: boom"));
    assert!(LinuxBackend::with_system_disk(failing, None).list_devices().is_empty());
}

#[test]
fn linux_enumeration_filters_lsblk_output() {
    let runner = runner_with(
        "lsblk",
        Script {
            stdout: "sda 500107862016 Samsung SSD sata\nsdb 15682240512 SanDisk Ultra usb\n"
                .into(),
            ..Default::default()
        },
    );
    let backend = LinuxBackend::with_system_disk(runner.clone(), Some("sda".into()));

    let devices = backend.list_devices();

    assert_eq!(
        devices,
        [Device::new("/dev/sdb", "sdb", 15_682_240_512).with_label("SanDisk Ultra")]
    );
    assert_eq!(
        runner.calls()[0].to_string(),
        "lsblk -d -b -n -o NAME,SIZE,MODEL,TRAN"
    );
}

#[test]
fn macos_enumeration_failure_yields_no_devices() {
    let missing: Arc<dyn CommandRunner> = runner_with("diskutil", Script::missing());
    assert!(MacosBackend::new(missing).list_devices().is_empty());

    let failing: Arc<dyn CommandRunner> = runner_with("diskutil", Script::fail(1, "boom"));
    assert!(MacosBackend::new(failing).list_devices().is_empty());
}

/// Records the thread each password prompt ran on.
#[derive(Default)]
struct ThreadPrompt(Mutex<Vec<Option<String>>>);

impl CredentialPrompt for ThreadPrompt {
    fn password(&self, _reason: &str) -> Option<String> {
        self.0
            .lock()
            .unwrap()
            .push(thread::current().name().map(str::to_string));
        Some("hunter2".into())
    }
}

fn sudo_session(runner: Arc<ScriptedRunner>, prompt: Arc<ThreadPrompt>) -> Arc<Session> {
    // `sudo -n true` fails, so a password is needed.
    runner.script("sudo", Script::fail(1, "sudo: a password is required"));
    let mut backend = FakeBackend::new(vec![usb_stick()]);
    backend.privileged_write = true;
    Arc::new(session_with(
        backend,
        runner,
        Elevator::sudo(Some(prompt)),
        FlashOptions::default(),
    ))
}

#[test]
fn authorized_flash_asks_on_the_calling_thread_only() {
    let runner = ScriptedRunner::new();
    let prompt = Arc::new(ThreadPrompt::default());
    let session = sudo_session(runner.clone(), prompt.clone());
    let img = image(4096);

    session.authorize_flash(img.path(), &usb_stick(), false).unwrap();
    assert!(session.elevator().has_credential());
    assert_eq!(runner.names(), ["sudo"]);

    session
        .spawn_flash(img.path().to_path_buf(), usb_stick(), false)
        .unwrap()
        .wait(|_| {})
        .unwrap();

    let asked = prompt.0.lock().unwrap().clone();
    assert_eq!(asked.len(), 1);
    assert_ne!(asked[0].as_deref(), Some("isoflash-job"));
    assert_eq!(runner.names(), ["sudo", "umount", "dd", "sync"]);
    assert_eq!(runner.calls()[2].stdin.as_deref(), Some("hunter2\n"));
    assert!(!session.elevator().has_credential());
}

#[test]
fn authorize_is_refused_while_a_job_runs_and_checks_its_inputs() {
    let runner = ScriptedRunner::new();
    let prompt = Arc::new(ThreadPrompt::default());
    let session = sudo_session(runner.clone(), prompt.clone());
    let img = image(4096);

    let unknown = Device::new("/dev/sdq", "sdq", 1);
    let err = session.authorize_format(&unknown).unwrap_err();
    assert!(matches!(err, FlashError::UnknownDevice(_)));

    let (open, gate) = mpsc::channel();
    runner.gate("dd", gate);
    session.authorize_flash(img.path(), &usb_stick(), false).unwrap();
    let job = session
        .spawn_flash(img.path().to_path_buf(), usb_stick(), false)
        .unwrap();
    while !runner.ran("dd") {
        thread::yield_now();
    }

    assert!(matches!(
        session.authorize_format(&usb_stick()),
        Err(FlashError::Busy)
    ));
    assert!(matches!(
        session.authorize_flash(img.path(), &usb_stick(), false),
        Err(FlashError::Busy)
    ));

    open.send(()).unwrap();
    job.wait(|_| {}).unwrap();
    assert_eq!(prompt.0.lock().unwrap().len(), 1);
    assert!(!session.is_busy());
}
