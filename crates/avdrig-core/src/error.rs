//! Error taxonomy for device lifecycle orchestration.
//!
//! Every failure the orchestrator can surface is a variant of
//! [`OrchestratorError`]. Variants carry the context a caller needs to
//! diagnose the failure (the command that ran, its exit code, the tail of its
//! stderr, the time spent waiting) so nothing has to be re-queried after the
//! fact. Nothing in this crate retries on its own; retry policy belongs to
//! the caller.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::session::DeviceSessionState;

/// Errors raised by the orchestrator and its components.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// The executable could not be found or started.
    #[error("Failed to launch `{command}`: {source}")]
    ProcessLaunch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A caller-specified timeout elapsed; the process was killed.
    #[error("`{command}` timed out after {timeout:?}{}", tail_suffix(.stderr_tail))]
    ProcessTimeout {
        command: String,
        timeout: Duration,
        stderr_tail: String,
    },

    /// The local system image source directory does not exist.
    #[error("System image source not found: {}", .path.display())]
    ImageNotFound { path: PathBuf },

    /// Copying the system image into the SDK failed part way.
    #[error("Failed to copy system image at {}: {source}", .path.display())]
    ImageCopy {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The device creation tool exited non-zero.
    #[error("Virtual device creation failed (exit {exit_code}){}", tail_suffix(.stderr))]
    DeviceCreation { exit_code: i32, stderr: String },

    /// The device never appeared in the bridge's device list.
    #[error("Device {serial} did not register with the bridge within {elapsed:?} (last seen: {last_observation})")]
    DeviceRegistrationTimeout {
        serial: String,
        elapsed: Duration,
        last_observation: String,
    },

    /// The device never reported boot completion.
    #[error("Device {serial} did not finish booting within {elapsed:?} (last seen: {last_observation})")]
    DeviceBootTimeout {
        serial: String,
        elapsed: Duration,
        last_observation: String,
    },

    /// The package to install does not exist on disk.
    #[error("Package not found: {}", .path.display())]
    PackageNotFound { path: PathBuf },

    /// The installer exited non-zero or reported a failure.
    #[error("Package install failed (exit {exit_code}){}", tail_suffix(.stderr))]
    PackageInstall { exit_code: i32, stderr: String },

    /// The emulator kill command exited non-zero.
    #[error("Device stop failed (exit {exit_code}){}", tail_suffix(.stderr))]
    DeviceStop { exit_code: i32, stderr: String },

    /// Another emulator already holds this device's serial or console port.
    #[error("Device {serial} is already running: {detail}")]
    DeviceAlreadyRunning { serial: String, detail: String },

    /// The launched emulator process exited before the device was ready.
    #[error("Emulator for {serial} exited with code {exit_code}{}", tail_suffix(.stderr))]
    EmulatorExited {
        serial: String,
        exit_code: i32,
        stderr: String,
    },

    /// The run was interrupted; teardown has already run.
    #[error("Interrupted")]
    Interrupted,

    /// The bridge daemon could not be restarted.
    #[error("Bridge restart failed (exit {exit_code}){}", tail_suffix(.stderr))]
    BridgeRestart { exit_code: i32, stderr: String },

    /// The companion service could not be started or stopped.
    #[error("Companion service control failed: {0}")]
    ServiceControl(String),

    /// A session for this device name is already active.
    #[error("A session for device '{name}' is already active")]
    SessionAlreadyActive { name: String },

    /// A session operation was called from the wrong state.
    #[error("Cannot {operation} while session is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: DeviceSessionState,
    },

    /// The configuration is missing, unreadable, or invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Any other I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn tail_suffix(tail: &str) -> String {
    let tail = tail.trim();
    if tail.is_empty() {
        String::new()
    } else {
        format!(": {tail}")
    }
}

impl OrchestratorError {
    /// Process exit code a harness should use when this error aborts a run.
    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestratorError::Io(_) => 1,
            OrchestratorError::Config(_) => 2,
            OrchestratorError::ImageNotFound { .. } | OrchestratorError::ImageCopy { .. } => 3,
            OrchestratorError::DeviceCreation { .. } => 4,
            OrchestratorError::DeviceRegistrationTimeout { .. } => 5,
            OrchestratorError::DeviceBootTimeout { .. } => 6,
            OrchestratorError::PackageNotFound { .. }
            | OrchestratorError::PackageInstall { .. } => 7,
            OrchestratorError::ServiceControl(_) => 8,
            OrchestratorError::SessionAlreadyActive { .. } => 9,
            OrchestratorError::ProcessLaunch { .. } => 10,
            OrchestratorError::ProcessTimeout { .. } => 11,
            OrchestratorError::InvalidState { .. } => 12,
            OrchestratorError::BridgeRestart { .. } => 13,
            OrchestratorError::DeviceStop { .. } => 14,
            OrchestratorError::DeviceAlreadyRunning { .. } => 15,
            OrchestratorError::EmulatorExited { .. } => 16,
            OrchestratorError::Interrupted => 130,
        }
    }
}
