//! Test-harness hook that brings up an Android emulator around a test run.
//!
//! # Usage
//!
//! ```bash
//! # Provision, boot, install, start Appium, run the tests, tear everything down
//! avdrig run --package build/app-debug.apk -- ./gradlew connectedCheck
//!
//! # Same, with settings from a specific config file and a log file
//! avdrig --config ci/avdrig.json --log-file target/avdrig.log run -- mvn test
//!
//! # What is the device and the companion server doing right now?
//! avdrig status
//!
//! # Check configuration and that every tool can be found
//! avdrig doctor
//! ```
//!
//! Settings come from `~/.avdrig/config.json` (or `--config`), then the
//! `AVDRIG_*` environment variables and flags below, highest last.

mod logging;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::process::Command as TestCommand;
use tracing::{error, info, warn};

use avdrig_core::config::OrchestratorConfig;
use avdrig_core::error::OrchestratorError;
use avdrig_core::orchestrator::Orchestrator;
use avdrig_core::process::TokioProcessRunner;
use avdrig_core::session::SessionRegistry;
use avdrig_core::toolchain::{resolve_executable, Toolchain};

/// Exit code when the test command itself cannot be started.
const TEST_LAUNCH_FAILED: u8 = 127;

/// Android emulator lifecycle orchestration for test runs.
#[derive(Parser)]
#[command(name = "avdrig")]
#[command(about = "Provision, boot, and tear down an Android emulator around a test command")]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.avdrig/config.json)
    #[arg(short, long, global = true, env = "AVDRIG_CONFIG")]
    config: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long, global = true, env = "AVDRIG_LOG_FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Set up the device, run a test command, and tear down
    Run {
        #[command(flatten)]
        overrides: Overrides,

        /// The test command and its arguments
        #[arg(last = true, required = true, value_name = "TEST_COMMAND")]
        test_command: Vec<String>,
    },

    /// Print device and companion server status as JSON
    Status {
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Validate configuration and check that required tools resolve
    Doctor {
        #[command(flatten)]
        overrides: Overrides,
    },
}

/// Per-invocation overrides applied on top of the config file.
#[derive(Args)]
struct Overrides {
    /// Virtual device name
    #[arg(long, env = "AVDRIG_DEVICE_NAME")]
    device_name: Option<String>,

    /// Application package to install
    #[arg(long, env = "AVDRIG_PACKAGE_PATH")]
    package: Option<PathBuf>,

    /// Local directory holding the unpacked system image
    #[arg(long, env = "AVDRIG_IMAGE_SOURCE")]
    image_source: Option<PathBuf>,

    /// Android SDK root
    #[arg(long, env = "AVDRIG_SDK_ROOT")]
    sdk_root: Option<PathBuf>,

    /// Virtual device definitions directory
    #[arg(long, env = "AVDRIG_AVD_HOME")]
    avd_home: Option<PathBuf>,

    /// Emulator console port; the device serial is emulator-<port>
    #[arg(long, env = "AVDRIG_CONSOLE_PORT")]
    console_port: Option<u16>,

    /// Companion server port
    #[arg(long, env = "AVDRIG_COMPANION_PORT")]
    companion_port: Option<u16>,

    /// Run the emulator without a window
    #[arg(long)]
    headless: bool,

    /// Keep user data from the previous boot instead of wiping it
    #[arg(long)]
    keep_data: bool,
}

impl Overrides {
    fn apply(self, config: &mut OrchestratorConfig) {
        if let Some(name) = self.device_name {
            config.device.name = name;
        }
        if let Some(package) = self.package {
            config.package_path = Some(package);
        }
        if let Some(source) = self.image_source {
            config.image.local_source = Some(source);
        }
        if let Some(root) = self.sdk_root {
            config.sdk_root = Some(root);
        }
        if let Some(home) = self.avd_home {
            config.avd_home = Some(home);
        }
        if let Some(port) = self.console_port {
            config.device.console_port = port;
        }
        if let Some(port) = self.companion_port {
            config.companion.port = port;
        }
        if self.headless {
            config.boot.headless = true;
        }
        if self.keep_data {
            config.boot.wipe_data = false;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _log_guard = match logging::init(cli.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: cannot open log file: {e}");
            return ExitCode::from(1);
        }
    };

    match execute(cli.config, cli.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            error_exit_code(&e)
        }
    }
}

fn error_exit_code(error: &OrchestratorError) -> ExitCode {
    ExitCode::from(u8::try_from(error.exit_code()).unwrap_or(1))
}

fn load_config(path: Option<PathBuf>, overrides: Overrides) -> Result<OrchestratorConfig, OrchestratorError> {
    let mut config = match path {
        Some(path) => OrchestratorConfig::load(&path)?,
        None => OrchestratorConfig::load_default()?,
    };
    overrides.apply(&mut config);
    Ok(config)
}

async fn execute(config_path: Option<PathBuf>, command: Command) -> Result<ExitCode, OrchestratorError> {
    match command {
        Command::Run { overrides, test_command } => {
            let config = load_config(config_path, overrides)?;
            run_tests(config, test_command).await
        }
        Command::Status { overrides } => {
            let config = load_config(config_path, overrides)?;
            let mut orchestrator =
                Orchestrator::new(config, Arc::new(TokioProcessRunner), SessionRegistry::default())?;
            let report = orchestrator.status().await?;
            let json = serde_json::to_string_pretty(&report)
                .map_err(|e| OrchestratorError::Config(e.to_string()))?;
            println!("{json}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Doctor { overrides } => {
            let config = load_config(config_path, overrides)?;
            Ok(doctor(&config))
        }
    }
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

/// How the test command ended.
enum TestOutcome {
    Exited(u8),
    LaunchFailed,
}

async fn run_tests(config: OrchestratorConfig, test_command: Vec<String>) -> Result<ExitCode, OrchestratorError> {
    let mut orchestrator = Orchestrator::new(config, Arc::new(TokioProcessRunner), SessionRegistry::default())?;
    info!(run_id = %orchestrator.run_id(), "avdrig run starting");

    let tests = || async move {
        let (program, args) = match test_command.split_first() {
            Some(split) => split,
            None => return TestOutcome::LaunchFailed,
        };
        info!(command = ?test_command, "running test command");
        // stdio is inherited so the test runner's output reaches the caller.
        let mut child = match TestCommand::new(program).args(args).kill_on_drop(true).spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(program = %program, error = %e, "cannot start test command");
                return TestOutcome::LaunchFailed;
            }
        };

        // Dropped on interrupt, which kills the child.
        match child.wait().await {
            Ok(status) => {
                let code = status.code().unwrap_or(1);
                info!(exit_code = code, "test command finished");
                TestOutcome::Exited(u8::try_from(code).unwrap_or(1))
            }
            Err(e) => {
                error!(error = %e, "lost track of test command");
                TestOutcome::LaunchFailed
            }
        }
    };
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
        warn!("interrupted, tearing down");
    };

    let outcome = orchestrator.run_with_shutdown(tests, shutdown).await?;

    Ok(match outcome {
        TestOutcome::Exited(code) => ExitCode::from(code),
        TestOutcome::LaunchFailed => ExitCode::from(TEST_LAUNCH_FAILED),
    })
}

// ---------------------------------------------------------------------------
// doctor
// ---------------------------------------------------------------------------

fn doctor(config: &OrchestratorConfig) -> ExitCode {
    let mut healthy = true;
    let mut report = |ok: bool, what: &str, detail: String| {
        healthy &= ok;
        let mark = if ok { "ok  " } else { "FAIL" };
        println!("{mark} {what}: {detail}");
    };

    match config.validate() {
        Ok(()) => report(true, "config", "valid".to_string()),
        Err(e) => report(false, "config", e.to_string()),
    }

    let sdk_root = config.resolved_sdk_root();
    match &sdk_root {
        Some(root) => report(root.is_dir(), "sdk root", root.display().to_string()),
        None => report(false, "sdk root", "not set (sdk_root, ANDROID_SDK_ROOT, ANDROID_HOME)".to_string()),
    }

    let toolchain = Toolchain::from_sdk_root(sdk_root.as_deref());
    let missing = toolchain.missing_tools();
    for (name, path) in [
        ("adb", &toolchain.adb),
        ("emulator", &toolchain.emulator),
        ("avdmanager", &toolchain.avdmanager),
    ] {
        let found = !missing.iter().any(|(missing_name, _)| *missing_name == name);
        report(found, name, path.display().to_string());
    }

    let companion = &config.companion.binary;
    match resolve_executable(companion) {
        Some(path) => report(true, "companion", path.display().to_string()),
        None => report(false, "companion", format!("{} not found", companion.display())),
    }

    if let Some(source) = &config.image.local_source {
        report(source.is_dir(), "image source", source.display().to_string());
    }
    if let Some(package) = &config.package_path {
        report(package.is_file(), "package", package.display().to_string());
    }

    if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}
