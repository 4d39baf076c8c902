//! Supervision of the companion automation server (Appium).
//!
//! Test clients talk to the device through a local automation server. The
//! [`CompanionSupervisor`] starts it before tests and stops it afterwards.
//! Whether the server is running is always asked of the server itself via
//! its HTTP status endpoint, never taken from remembered state, so a server
//! that crashed or was started by someone else is seen as it really is.
//!
//! Both `start` and `stop` are idempotent: asking for the state the server is
//! already in logs and returns `Ok`.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};

use crate::config::CompanionConfig;
use crate::drain::DrainMode;
use crate::error::OrchestratorError;
use crate::poll::{wait_until, Readiness, ReadinessCheck, WaitError};
use crate::process::{CommandSpec, ProcessHandle, ProcessRunner};

/// Budget for a single status request.
const STATUS_TIMEOUT: Duration = Duration::from_secs(2);

/// Interval between status polls while starting or stopping.
const SERVICE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Time allowed for a killed server to stop answering.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Starts, stops, and checks the companion server.
pub struct CompanionSupervisor {
    config: CompanionConfig,
    runner: Arc<dyn ProcessRunner>,
    client: Client,
    process: Option<ProcessHandle>,
}

impl CompanionSupervisor {
    /// # Errors
    ///
    /// - [`OrchestratorError::ServiceControl`] if the HTTP client cannot be built
    pub fn new(config: CompanionConfig, runner: Arc<dyn ProcessRunner>) -> Result<Self, OrchestratorError> {
        Ok(Self {
            config,
            runner,
            client: status_client()?,
            process: None,
        })
    }

    pub fn config(&self) -> &CompanionConfig {
        &self.config
    }

    /// Whether this supervisor launched the server currently tracked.
    pub fn owns_process(&self) -> bool {
        self.process.is_some()
    }

    /// PID of the server process this supervisor launched, if any.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(ProcessHandle::pid)
    }

    /// URL of the status endpoint.
    pub fn status_url(&self) -> String {
        format!(
            "http://{}:{}{}",
            self.config.address, self.config.port, self.config.status_path
        )
    }

    /// The launch command vector.
    pub fn command(&self) -> CommandSpec {
        let mut cmd = CommandSpec::new(&self.config.binary)
            .args(["--address", self.config.address.as_str(), "--port"])
            .arg(self.config.port.to_string());
        for feature in &self.config.allow_insecure {
            cmd = cmd.args(["--allow-insecure", feature.as_str()]);
        }
        cmd.args(self.config.extra_args.iter().cloned())
    }

    /// Fresh check: does the status endpoint answer with HTTP 200?
    ///
    /// Also reaps the owned process handle if that process has exited.
    pub async fn is_running(&mut self) -> bool {
        if let Some(handle) = self.process.as_mut() {
            if let Ok(Some(code)) = handle.try_exit() {
                tracing::warn!(exit_code = code, "companion service process exited");
                self.process = None;
            }
        }
        status_ok(&self.client, &self.status_url()).await
    }

    /// Start the server unless it is already running, then wait until its
    /// status endpoint answers.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::ServiceControl`] if the binary cannot be launched,
    ///   exits during startup, or does not answer within the start timeout
    pub async fn start(&mut self) -> Result<(), OrchestratorError> {
        if self.is_running().await {
            tracing::info!(
                address = %self.config.address,
                port = self.config.port,
                "companion service already running"
            );
            return Ok(());
        }

        let command = self.command();
        tracing::info!(command = %command, "starting companion service");
        let handle = self
            .runner
            .spawn(&command, DrainMode::Forward { target: "avdrig::companion" })
            .map_err(|e| OrchestratorError::ServiceControl(e.to_string()))?;
        self.process = Some(handle);

        let check = ReadinessCheck::new(SERVICE_POLL_INTERVAL, self.config.start_timeout);
        let url = self.status_url();
        let url = url.as_str();
        let client = &self.client;
        let process = &mut self.process;
        let outcome = wait_until(&check, || {
            let exited = match process.as_mut().map(ProcessHandle::try_exit) {
                Some(Ok(Some(code))) => Some(code),
                _ => None,
            };
            async move {
                if let Some(code) = exited {
                    return Err(OrchestratorError::ServiceControl(format!(
                        "companion service exited during startup with code {code}"
                    )));
                }
                if status_ok(client, url).await {
                    Ok(Readiness::Ready)
                } else {
                    Ok(Readiness::Pending(format!("no answer from {url}")))
                }
            }
        })
        .await;

        match outcome {
            Ok(elapsed) => {
                tracing::info!(port = self.config.port, ?elapsed, "companion service ready");
                Ok(())
            }
            Err(failure) => {
                let tail = self.abandon_process().await;
                let reason = match failure {
                    WaitError::TimedOut { elapsed, last_observation } => format!(
                        "companion service not ready after {elapsed:?} ({last_observation})"
                    ),
                    WaitError::Aborted(e) => e.to_string(),
                };
                Err(OrchestratorError::ServiceControl(if tail.is_empty() {
                    reason
                } else {
                    format!("{reason}: {tail}")
                }))
            }
        }
    }

    /// Stop the server this supervisor launched.
    ///
    /// A live process this supervisor launched is always killed, whether or
    /// not its status endpoint still answers. A server that was not launched
    /// here is left running and logged.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::ServiceControl`] if the owned server cannot be
    ///   killed or keeps answering after being killed
    pub async fn stop(&mut self) -> Result<(), OrchestratorError> {
        if let Some(handle) = self.process.as_mut() {
            if let Ok(Some(code)) = handle.try_exit() {
                tracing::info!(exit_code = code, "companion service process already exited");
                self.process = None;
            }
        }

        let Some(mut handle) = self.process.take() else {
            if status_ok(&self.client, &self.status_url()).await {
                tracing::info!(
                    port = self.config.port,
                    "companion service was not started by this run, leaving it running"
                );
            } else {
                tracing::info!("companion service not running");
            }
            return Ok(());
        };

        tracing::info!(pid = ?handle.pid(), "stopping companion service");
        handle
            .kill()
            .await
            .map_err(|e| OrchestratorError::ServiceControl(format!("kill failed: {e}")))?;
        handle.finish_drains(Some(Duration::from_millis(500))).await;

        let check = ReadinessCheck::new(SERVICE_POLL_INTERVAL, STOP_TIMEOUT);
        let url = self.status_url();
        let url = url.as_str();
        let client = &self.client;
        let stopped = wait_until(&check, || async move {
            if status_ok(client, url).await {
                Ok(Readiness::Pending("status endpoint still answering".to_string()))
            } else {
                Ok(Readiness::Ready)
            }
        })
        .await;

        match stopped {
            Ok(_) => {
                tracing::info!("companion service stopped");
                Ok(())
            }
            Err(_) => Err(OrchestratorError::ServiceControl(format!(
                "companion service on port {} still answering after kill",
                self.config.port
            ))),
        }
    }

    async fn abandon_process(&mut self) -> String {
        let Some(mut handle) = self.process.take() else {
            return String::new();
        };
        let _ = handle.kill().await;
        let (_, stderr) = handle.finish_drains(Some(Duration::from_millis(500))).await;
        stderr.tail.last().cloned().unwrap_or_default()
    }
}

fn status_client() -> Result<Client, OrchestratorError> {
    Client::builder()
        .timeout(STATUS_TIMEOUT)
        .no_proxy()
        .pool_max_idle_per_host(0)
        .build()
        .map_err(|e| OrchestratorError::ServiceControl(format!("cannot build HTTP client: {e}")))
}

/// `GET url`; true only on HTTP 200. Connection errors and timeouts are false.
async fn status_ok(client: &Client, url: &str) -> bool {
    match client.get(url).send().await {
        Ok(response) => response.status() == StatusCode::OK,
        Err(e) => {
            tracing::trace!(url, error = %e, "status request failed");
            false
        }
    }
}
