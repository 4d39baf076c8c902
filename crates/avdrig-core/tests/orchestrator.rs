//! End-to-end setup and teardown with scripted SDK tools.

#![cfg(unix)]

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{devices_with, exit, fake_package, ok, Call, FakeRunner, MockStatusServer, TempDir, NO_DEVICES};

use avdrig_core::config::{ImageConfig, OrchestratorConfig, Timeouts};
use avdrig_core::error::OrchestratorError;
use avdrig_core::orchestrator::Orchestrator;
use avdrig_core::process::ProcessRunner;
use avdrig_core::session::{DeviceSessionState, SessionRegistry};

const DEVICES: &str = "adb devices";
const GETPROP: &str = "adb -s emulator-5554 shell getprop sys.boot_completed";
const INSTALL: &str = "adb -s emulator-5554 install -r";
const EMU_KILL: &str = "adb -s emulator-5554 emu kill";

/// Temp directories for one orchestrated run.
struct Workspace {
    root: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let root = TempDir::new("orchestrator");
        let cache = root.join("image_cache");
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(cache.join("system.img"), b"img").unwrap();
        std::fs::create_dir_all(root.join("sdk")).unwrap();
        std::fs::create_dir_all(root.join("avd")).unwrap();
        fake_package(&root);
        Self { root }
    }

    fn config(&self, companion_port: u16) -> OrchestratorConfig {
        let mut config = OrchestratorConfig {
            image: ImageConfig {
                local_source: Some(self.root.join("image_cache")),
            },
            package_path: Some(self.root.join("app-debug.apk")),
            sdk_root: Some(self.root.join("sdk")),
            avd_home: Some(self.root.join("avd")),
            timeouts: Timeouts {
                registration_timeout: Duration::from_secs(2),
                boot_timeout: Duration::from_secs(2),
                stabilization_delay: Duration::from_millis(10),
                poll_interval: Duration::from_millis(50),
                command_timeout: Duration::from_secs(5),
                install_timeout: Duration::from_secs(5),
            },
            ..Default::default()
        };
        config.device.name = "ci_pixel".to_string();
        config.companion.port = companion_port;
        config.companion.start_timeout = Duration::from_secs(2);
        config
    }
}

fn scripted_device() -> Arc<FakeRunner> {
    let runner = FakeRunner::new();
    runner.script(DEVICES, vec![ok(NO_DEVICES), ok(&devices_with("emulator-5554", "device"))]);
    runner.script(GETPROP, vec![ok("0\n"), ok("1\n")]);
    runner.script(INSTALL, vec![ok("Success\n")]);
    runner
}

fn orchestrator(runner: &Arc<FakeRunner>, config: OrchestratorConfig) -> Orchestrator {
    let runner: Arc<dyn ProcessRunner> = runner.clone();
    Orchestrator::new(config, runner, SessionRegistry::default()).unwrap()
}

#[tokio::test]
async fn setup_runs_every_step_in_order() {
    let workspace = Workspace::new();
    let companion = MockStatusServer::start(true).await;
    let runner = scripted_device();
    let mut orchestrator = orchestrator(&runner, workspace.config(companion.port));

    orchestrator.setup().await.unwrap();

    assert!(orchestrator.is_ready());
    assert_eq!(orchestrator.session().state(), DeviceSessionState::Running);

    let create = runner.position("avdmanager create avd --name ci_pixel").unwrap();
    let kill_server = runner.position("adb kill-server").unwrap();
    let start_server = runner.position("adb start-server").unwrap();
    let launch = runner
        .calls()
        .iter()
        .position(|c| matches!(c, Call::Spawn(line) if line.starts_with("emulator -avd ci_pixel")))
        .unwrap();
    let registered = runner.position(DEVICES).unwrap();
    let booted = runner.position(GETPROP).unwrap();
    let install = runner.position(INSTALL).unwrap();
    assert!(create < kill_server);
    assert!(kill_server < start_server);
    assert!(start_server < launch);
    assert!(launch < registered);
    assert!(registered < booted);
    assert!(booted < install);

    // Image mirrored into the SDK.
    assert!(workspace
        .root
        .join("sdk/system-images/android-34/google_apis/x86_64/system.img")
        .is_file());

    let report = orchestrator.teardown().await;
    assert!(report.is_clean(), "teardown errors: {:?}", report.errors);
    assert_eq!(orchestrator.session().state(), DeviceSessionState::Stopped);
    assert_eq!(runner.count(EMU_KILL), 1);
}

#[tokio::test]
async fn existing_definition_is_reused() {
    let workspace = Workspace::new();
    std::fs::create_dir_all(workspace.root.join("avd/ci_pixel.avd")).unwrap();
    let companion = MockStatusServer::start(true).await;
    let runner = scripted_device();
    let mut orchestrator = orchestrator(&runner, workspace.config(companion.port));

    orchestrator.setup().await.unwrap();

    assert_eq!(runner.count("avdmanager"), 0);
    orchestrator.teardown().await;
}

#[tokio::test]
async fn install_failure_skips_tests_and_still_tears_down() {
    let workspace = Workspace::new();
    let companion = MockStatusServer::start(true).await;
    let runner = FakeRunner::new();
    runner.script(DEVICES, vec![ok(NO_DEVICES), ok(&devices_with("emulator-5554", "device"))]);
    runner.script(GETPROP, vec![ok("1\n")]);
    runner.script(INSTALL, vec![exit(1, "adb: failed to install app-debug.apk")]);
    let mut orchestrator = orchestrator(&runner, workspace.config(companion.port));

    let tests_ran = Arc::new(AtomicBool::new(false));
    let flag = tests_ran.clone();
    let result = orchestrator
        .run(|| async move {
            flag.store(true, Ordering::SeqCst);
        })
        .await;

    assert!(matches!(result, Err(OrchestratorError::PackageInstall { exit_code: 1, .. })));
    assert!(!tests_ran.load(Ordering::SeqCst));
    assert_eq!(runner.count(EMU_KILL), 1);
    assert_eq!(orchestrator.session().state(), DeviceSessionState::Stopped);
}

#[tokio::test]
async fn teardown_failure_does_not_replace_test_result() {
    let workspace = Workspace::new();
    let companion = MockStatusServer::start(true).await;
    let runner = scripted_device();
    runner.script(EMU_KILL, vec![exit(1, "error: device offline")]);
    let mut orchestrator = orchestrator(&runner, workspace.config(companion.port));

    let outcome = orchestrator.run(|| async { 42 }).await.unwrap();

    assert_eq!(outcome, 42);
    assert_eq!(orchestrator.session().state(), DeviceSessionState::Stopped);
}

#[tokio::test]
async fn boot_timeout_is_reported_and_device_is_killed() {
    let workspace = Workspace::new();
    let companion = MockStatusServer::start(true).await;
    let runner = FakeRunner::new();
    runner.script(DEVICES, vec![ok(NO_DEVICES), ok(&devices_with("emulator-5554", "device"))]);
    runner.script(GETPROP, vec![ok("\n")]);
    let mut config = workspace.config(companion.port);
    config.timeouts.boot_timeout = Duration::from_millis(300);
    let mut orchestrator = orchestrator(&runner, config);

    let result = orchestrator.run(|| async {}).await;

    assert!(matches!(result, Err(OrchestratorError::DeviceBootTimeout { .. })));
    assert_eq!(runner.count(INSTALL), 0);
    assert_eq!(runner.count(EMU_KILL), 1);
}

#[tokio::test]
async fn interrupt_during_setup_still_tears_down() {
    let workspace = Workspace::new();
    let companion = MockStatusServer::start(true).await;
    let runner = FakeRunner::new();
    runner.script(DEVICES, vec![ok(NO_DEVICES)]);
    let mut config = workspace.config(companion.port);
    config.timeouts.registration_timeout = Duration::from_secs(30);
    let mut orchestrator = orchestrator(&runner, config);

    let tests_ran = Arc::new(AtomicBool::new(false));
    let flag = tests_ran.clone();
    let started = std::time::Instant::now();
    let result = orchestrator
        .run_with_shutdown(
            || async move {
                flag.store(true, Ordering::SeqCst);
            },
            tokio::time::sleep(Duration::from_millis(300)),
        )
        .await;

    assert!(matches!(result, Err(OrchestratorError::Interrupted)));
    assert!(!tests_ran.load(Ordering::SeqCst));
    assert_eq!(runner.count(EMU_KILL), 1);
    assert_eq!(orchestrator.session().state(), DeviceSessionState::Stopped);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn interrupt_during_tests_drops_them_and_tears_down() {
    let workspace = Workspace::new();
    let companion = MockStatusServer::start(true).await;
    let runner = scripted_device();
    let mut orchestrator = orchestrator(&runner, workspace.config(companion.port));

    let (started_tx, started_rx) = tokio::sync::oneshot::channel();
    let result = orchestrator
        .run_with_shutdown(
            || async move {
                let _ = started_tx.send(());
                tokio::time::sleep(Duration::from_secs(60)).await;
                0
            },
            async {
                let _ = started_rx.await;
            },
        )
        .await;

    assert!(matches!(result, Err(OrchestratorError::Interrupted)));
    assert_eq!(runner.count(EMU_KILL), 1);
    assert_eq!(orchestrator.session().state(), DeviceSessionState::Stopped);
}

#[tokio::test]
async fn missing_image_fails_before_any_tool_runs() {
    let workspace = Workspace::new();
    let companion = MockStatusServer::start(true).await;
    let runner = scripted_device();
    let mut config = workspace.config(companion.port);
    config.image.local_source = Some(workspace.root.join("no_such_cache"));
    let mut orchestrator = orchestrator(&runner, config);

    let result = orchestrator.setup().await;

    assert!(matches!(result, Err(OrchestratorError::ImageNotFound { .. })));
    assert!(runner.calls().is_empty());
    let report = orchestrator.teardown().await;
    assert!(report.is_clean());
    assert_eq!(runner.count(EMU_KILL), 0);
}

#[tokio::test]
async fn status_reports_live_observations() {
    let workspace = Workspace::new();
    let companion = MockStatusServer::start(true).await;
    let runner = FakeRunner::new();
    runner.script(DEVICES, vec![ok(&devices_with("emulator-5554", "device"))]);
    runner.script(GETPROP, vec![ok("1\n")]);
    let mut orchestrator = orchestrator(&runner, workspace.config(companion.port));

    let status = orchestrator.status().await.unwrap();

    assert_eq!(status.device, "ci_pixel");
    assert_eq!(status.serial, "emulator-5554");
    assert!(!status.definition_exists);
    assert!(status.registered);
    assert!(status.boot_completed);
    assert!(status.companion_running);
    assert_eq!(status.session_state, "NotStarted");
    assert_eq!(runner.spawn_count(), 0);
}

#[test]
fn incomplete_config_is_rejected() {
    let runner: Arc<dyn ProcessRunner> = FakeRunner::new();
    let result = Orchestrator::new(OrchestratorConfig::default(), runner, SessionRegistry::default());
    assert!(matches!(result, Err(OrchestratorError::Config(_))));
}
