//! The device session state machine.
//!
//! A [`DeviceSession`] drives one emulator instance from launch to shutdown:
//!
//! ```text
//! NotStarted -> Launching -> RegisteredWithBridge -> BootCompleted
//!            -> Stabilized -> Running -> Stopping -> Stopped
//! ```
//!
//! Transitions only move forward; [`DeviceSession::reset`] is the one way
//! back, from `Stopped` to `NotStarted`. Each operation checks that the
//! session is in the state it expects and otherwise fails with
//! [`OrchestratorError::InvalidState`] without side effects.
//!
//! Sessions for the same device name are mutually exclusive through a
//! [`SessionRegistry`] shared by everyone who might start one.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use avdrig_core::config::BootOptions;
//! use avdrig_core::process::TokioProcessRunner;
//! use avdrig_core::session::{DeviceSession, SessionRegistry};
//! use avdrig_core::toolchain::Toolchain;
//!
//! # async fn example() -> Result<(), avdrig_core::error::OrchestratorError> {
//! let mut session = DeviceSession::new(
//!     "ci_pixel",
//!     5554,
//!     BootOptions::default(),
//!     Arc::new(TokioProcessRunner),
//!     Toolchain::default(),
//!     SessionRegistry::default(),
//! );
//! session.start().await?;
//! session.await_registration(Duration::from_secs(120)).await?;
//! session.await_boot(Duration::from_secs(120)).await?;
//! session.stabilize(Duration::from_secs(10)).await?;
//! session.install_package("app-debug.apk".as_ref()).await?;
//! session.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::TcpStream;

use crate::config::BootOptions;
use crate::drain::DrainMode;
use crate::error::OrchestratorError;
use crate::poll::{wait_until, ReadinessCheck, ReadinessProbe, WaitError};
use crate::process::{ProcessHandle, ProcessRunner};
use crate::toolchain::{emulator_serial, install_failure, parse_device_list, Toolchain, BOOT_COMPLETED_PROPERTY};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(300);

/// How long to try the console port when checking for a stale emulator.
const CONSOLE_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a dead emulator's output drains get to reach EOF.
const EXITED_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Lines of emulator stderr carried in [`OrchestratorError::EmulatorExited`].
const EMULATOR_TAIL_LINES: usize = 20;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Where a [`DeviceSession`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceSessionState {
    NotStarted,
    Launching,
    RegisteredWithBridge,
    BootCompleted,
    Stabilized,
    Running,
    Stopping,
    Stopped,
}

impl DeviceSessionState {
    /// Whether the device process may be alive in this state.
    pub fn is_active(self) -> bool {
        !matches!(self, DeviceSessionState::NotStarted | DeviceSessionState::Stopped)
    }
}

// ---------------------------------------------------------------------------
// Registry of active sessions
// ---------------------------------------------------------------------------

/// Device names that currently have an active session.
///
/// Cloning shares the underlying set. Pass the same registry to every
/// session that could target the same device.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    active: Arc<Mutex<HashSet<String>>>,
}

impl SessionRegistry {
    /// Claim `name`, failing if another session holds it.
    pub fn claim(&self, name: &str) -> Result<SessionLease, OrchestratorError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(name.to_string()) {
            return Err(OrchestratorError::SessionAlreadyActive {
                name: name.to_string(),
            });
        }
        Ok(SessionLease {
            registry: self.clone(),
            name: name.to_string(),
        })
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }
}

/// A claimed device name, released on drop.
#[derive(Debug)]
pub struct SessionLease {
    registry: SessionRegistry,
    name: String,
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.registry
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}

// ---------------------------------------------------------------------------
// DeviceSession
// ---------------------------------------------------------------------------

/// One emulator instance and the state of its lifecycle.
pub struct DeviceSession {
    name: String,
    serial: String,
    console_port: u16,
    boot: BootOptions,
    runner: Arc<dyn ProcessRunner>,
    toolchain: Toolchain,
    registry: SessionRegistry,
    poll_interval: Duration,
    command_timeout: Duration,
    install_timeout: Duration,
    state: DeviceSessionState,
    lease: Option<SessionLease>,
    emulator: Option<ProcessHandle>,
}

impl DeviceSession {
    pub fn new(
        name: impl Into<String>,
        console_port: u16,
        boot: BootOptions,
        runner: Arc<dyn ProcessRunner>,
        toolchain: Toolchain,
        registry: SessionRegistry,
    ) -> Self {
        Self {
            name: name.into(),
            serial: emulator_serial(console_port),
            console_port,
            boot,
            runner,
            toolchain,
            registry,
            poll_interval: DEFAULT_POLL_INTERVAL,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            install_timeout: DEFAULT_INSTALL_TIMEOUT,
            state: DeviceSessionState::NotStarted,
            lease: None,
            emulator: None,
        }
    }

    /// Set the readiness poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the bound for each bridge query command.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_install_timeout(mut self, timeout: Duration) -> Self {
        self.install_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bridge serial (`emulator-<port>`).
    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn state(&self) -> DeviceSessionState {
        self.state
    }

    /// PID of the emulator process this session launched, if any.
    pub fn emulator_pid(&self) -> Option<u32> {
        self.emulator.as_ref().and_then(ProcessHandle::pid)
    }

    fn expect_state(&self, expected: DeviceSessionState, operation: &'static str) -> Result<(), OrchestratorError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn transition(&mut self, next: DeviceSessionState) {
        tracing::info!(device = %self.name, from = ?self.state, to = ?next, "session state change");
        self.state = next;
    }

    /// Restart the bridge and launch the emulator.
    ///
    /// The bridge daemon is killed and relaunched first so registrations left
    /// behind by a crashed earlier run cannot be mistaken for this device.
    /// An emulator that survived such a run still holds the serial, so the
    /// launch is refused while the serial is attached or the console port
    /// accepts connections.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::SessionAlreadyActive`] if the name is claimed
    /// - [`OrchestratorError::BridgeRestart`] if `adb start-server` fails
    /// - [`OrchestratorError::DeviceAlreadyRunning`] if another emulator holds
    ///   the serial
    /// - [`OrchestratorError::ProcessLaunch`] if a tool cannot be started
    pub async fn start(&mut self) -> Result<(), OrchestratorError> {
        if self.state != DeviceSessionState::NotStarted {
            if self.state.is_active() {
                return Err(OrchestratorError::SessionAlreadyActive { name: self.name.clone() });
            }
            return Err(OrchestratorError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }
        let lease = self.registry.claim(&self.name)?;

        // On any error below the lease drops and the name is free again.
        self.restart_bridge().await?;
        self.ensure_serial_free().await?;

        let command = self
            .toolchain
            .boot_device(&self.name, self.console_port, &self.boot);
        tracing::info!(device = %self.name, command = %command, "launching emulator");
        let handle = self
            .runner
            .spawn(&command, DrainMode::Forward { target: "avdrig::emulator" })?;

        self.emulator = Some(handle);
        self.lease = Some(lease);
        self.transition(DeviceSessionState::Launching);
        Ok(())
    }

    async fn restart_bridge(&self) -> Result<(), OrchestratorError> {
        let kill = self
            .runner
            .run_to_completion(&self.toolchain.kill_bridge(), Some(self.command_timeout))
            .await?;
        if !kill.success() {
            // Exits non-zero when no daemon was running.
            tracing::debug!(exit_code = kill.exit_code, "bridge kill-server reported failure");
        }

        let start = self
            .runner
            .run_to_completion(&self.toolchain.start_bridge(), Some(self.command_timeout))
            .await?;
        if !start.success() {
            return Err(OrchestratorError::BridgeRestart {
                exit_code: start.exit_code,
                stderr: start.stderr_tail(20),
            });
        }
        tracing::debug!("bridge restarted");
        Ok(())
    }

    async fn ensure_serial_free(&self) -> Result<(), OrchestratorError> {
        let listing = self
            .runner
            .run_to_completion(&self.toolchain.list_devices(), Some(self.command_timeout))
            .await;
        match listing {
            Ok(output) if output.success() => {
                if let Some(device) = parse_device_list(&output.stdout)
                    .into_iter()
                    .find(|d| d.serial == self.serial)
                {
                    return Err(OrchestratorError::DeviceAlreadyRunning {
                        serial: self.serial.clone(),
                        detail: format!("bridge lists it as {}", device.state),
                    });
                }
            }
            Ok(output) => {
                tracing::debug!(exit_code = output.exit_code, "device list unavailable before launch");
            }
            Err(OrchestratorError::ProcessTimeout { timeout, .. }) => {
                tracing::debug!(?timeout, "device list timed out before launch");
            }
            Err(e) => return Err(e),
        }

        let connect = TcpStream::connect(("127.0.0.1", self.console_port));
        if let Ok(Ok(_)) = tokio::time::timeout(CONSOLE_CONNECT_TIMEOUT, connect).await {
            return Err(OrchestratorError::DeviceAlreadyRunning {
                serial: self.serial.clone(),
                detail: format!("console port {} is in use", self.console_port),
            });
        }
        Ok(())
    }

    /// Poll `probe`, giving up early if the launched emulator exits.
    async fn poll_probe(&mut self, probe: &ReadinessProbe, timeout: Duration) -> Result<Duration, WaitError> {
        let check = ReadinessCheck::new(self.poll_interval, timeout);
        let runner = self.runner.as_ref();
        let toolchain = &self.toolchain;
        let serial = self.serial.as_str();
        let command_timeout = self.command_timeout;
        let emulator = &mut self.emulator;

        let result = wait_until(&check, move || {
            let exited = match emulator.as_mut().map(ProcessHandle::try_exit) {
                Some(Ok(Some(code))) => Some(code),
                _ => None,
            };
            async move {
                if let Some(exit_code) = exited {
                    return Err(OrchestratorError::EmulatorExited {
                        serial: serial.to_string(),
                        exit_code,
                        stderr: String::new(),
                    });
                }
                probe.evaluate(runner, toolchain, command_timeout).await
            }
        })
        .await;

        match result {
            Err(WaitError::Aborted(OrchestratorError::EmulatorExited { serial, exit_code, .. })) => {
                let stderr = self.emulator_stderr_tail().await;
                tracing::warn!(%serial, exit_code, stderr = %stderr, "emulator exited before the device was ready");
                Err(WaitError::Aborted(OrchestratorError::EmulatorExited {
                    serial,
                    exit_code,
                    stderr,
                }))
            }
            other => other,
        }
    }

    async fn emulator_stderr_tail(&mut self) -> String {
        let Some(handle) = self.emulator.as_mut() else {
            return String::new();
        };
        let (_, stderr) = handle.finish_drains(Some(EXITED_DRAIN_GRACE)).await;
        let start = stderr.tail.len().saturating_sub(EMULATOR_TAIL_LINES);
        stderr.tail[start..].join("\n")
    }

    /// Wait until the bridge lists the device as attached.
    ///
    /// Fails with [`OrchestratorError::EmulatorExited`] as soon as the
    /// launched emulator is seen to have exited.
    pub async fn await_registration(&mut self, timeout: Duration) -> Result<(), OrchestratorError> {
        self.expect_state(DeviceSessionState::Launching, "await registration")?;
        let probe = ReadinessProbe::BridgeListContains {
            serial: self.serial.clone(),
        };
        match self.poll_probe(&probe, timeout).await {
            Ok(elapsed) => {
                tracing::info!(serial = %self.serial, ?elapsed, "device registered with bridge");
                self.transition(DeviceSessionState::RegisteredWithBridge);
                Ok(())
            }
            Err(WaitError::TimedOut { elapsed, last_observation }) => {
                Err(OrchestratorError::DeviceRegistrationTimeout {
                    serial: self.serial.clone(),
                    elapsed,
                    last_observation: self.with_emulator_exit(last_observation),
                })
            }
            Err(WaitError::Aborted(e)) => Err(e),
        }
    }

    /// Wait until the device reports `sys.boot_completed == 1`.
    pub async fn await_boot(&mut self, timeout: Duration) -> Result<(), OrchestratorError> {
        self.expect_state(DeviceSessionState::RegisteredWithBridge, "await boot")?;
        let probe = ReadinessProbe::BootPropertyEquals {
            serial: self.serial.clone(),
            property: BOOT_COMPLETED_PROPERTY.to_string(),
            expected: "1".to_string(),
        };
        match self.poll_probe(&probe, timeout).await {
            Ok(elapsed) => {
                tracing::info!(serial = %self.serial, ?elapsed, "device boot completed");
                self.transition(DeviceSessionState::BootCompleted);
                Ok(())
            }
            Err(WaitError::TimedOut { elapsed, last_observation }) => {
                Err(OrchestratorError::DeviceBootTimeout {
                    serial: self.serial.clone(),
                    elapsed,
                    last_observation: self.with_emulator_exit(last_observation),
                })
            }
            Err(WaitError::Aborted(e)) => Err(e),
        }
    }

    // A dead emulator explains a timeout better than the last bridge output.
    fn with_emulator_exit(&mut self, observation: String) -> String {
        match self.emulator.as_mut().map(ProcessHandle::try_exit) {
            Some(Ok(Some(code))) => format!("{observation}; emulator exited with code {code}"),
            _ => observation,
        }
    }

    /// Fixed delay between boot completion and first use.
    ///
    /// `sys.boot_completed` is set before the launcher and system UI settle.
    pub async fn stabilize(&mut self, delay: Duration) -> Result<(), OrchestratorError> {
        self.expect_state(DeviceSessionState::BootCompleted, "stabilize")?;
        tracing::info!(device = %self.name, ?delay, "waiting for device to stabilize");
        tokio::time::sleep(delay).await;
        self.transition(DeviceSessionState::Stabilized);
        Ok(())
    }

    /// Install (or reinstall) the package at `path`. Success moves the
    /// session to `Running`; failure leaves it `Stabilized`.
    pub async fn install_package(&mut self, path: &Path) -> Result<(), OrchestratorError> {
        self.expect_state(DeviceSessionState::Stabilized, "install package")?;
        if !path.is_file() {
            return Err(OrchestratorError::PackageNotFound {
                path: path.to_path_buf(),
            });
        }

        tracing::info!(serial = %self.serial, package = %path.display(), "installing package");
        let command = self.toolchain.install_package(&self.serial, path, true);
        let output = self
            .runner
            .run_to_completion(&command, Some(self.install_timeout))
            .await?;

        if !output.success() {
            return Err(OrchestratorError::PackageInstall {
                exit_code: output.exit_code,
                stderr: output.stderr_tail(20),
            });
        }
        if let Some(failure) = install_failure(&output.stdout) {
            return Err(OrchestratorError::PackageInstall {
                exit_code: output.exit_code,
                stderr: failure.to_string(),
            });
        }

        self.transition(DeviceSessionState::Running);
        Ok(())
    }

    /// Ask the emulator to shut down.
    ///
    /// Issues `adb emu kill` and does not wait for the process to exit. The
    /// session ends `Stopped` and releases its name even if the kill command
    /// fails; that failure is still returned.
    pub async fn stop(&mut self) -> Result<(), OrchestratorError> {
        if !self.state.is_active() {
            return Err(OrchestratorError::InvalidState {
                operation: "stop",
                state: self.state,
            });
        }
        self.transition(DeviceSessionState::Stopping);

        let result = self
            .runner
            .run_to_completion(&self.toolchain.kill_device(&self.serial), Some(self.command_timeout))
            .await
            .and_then(|output| {
                if output.success() {
                    Ok(())
                } else {
                    Err(OrchestratorError::DeviceStop {
                        exit_code: output.exit_code,
                        stderr: output.stderr_tail(5),
                    })
                }
            });

        if let Some(handle) = self.emulator.take() {
            tracing::debug!(pid = ?handle.pid(), "released emulator process handle");
        }
        self.lease = None;
        self.transition(DeviceSessionState::Stopped);
        result
    }

    /// Return a stopped session to `NotStarted` so it can be started again.
    pub fn reset(&mut self) -> Result<(), OrchestratorError> {
        self.expect_state(DeviceSessionState::Stopped, "reset")?;
        self.transition(DeviceSessionState::NotStarted);
        Ok(())
    }
}
