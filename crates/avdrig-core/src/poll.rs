//! Fixed-interval readiness polling.
//!
//! [`wait_until`] is the single primitive behind every "wait for the outside
//! world" step: bridge registration, boot completion, and companion service
//! startup. It evaluates an async predicate immediately and then once per
//! [`ReadinessCheck::poll_interval`] until the predicate reports
//! [`Readiness::Ready`] or [`ReadinessCheck::timeout`] elapses. The interval
//! never grows; the polled tools give no signal that backoff would react to.
//!
//! Conditions on the device are expressed as [`ReadinessProbe`] variants,
//! each of which runs a fresh tool invocation per evaluation.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::OrchestratorError;
use crate::process::ProcessRunner;
use crate::toolchain::{parse_device_list, Toolchain};

/// Outcome of one predicate evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Not ready yet; the string describes what was observed.
    Pending(String),
}

/// Interval and deadline for a [`wait_until`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessCheck {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl ReadinessCheck {
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self { poll_interval, timeout }
    }
}

/// Why a [`wait_until`] call gave up.
#[derive(Debug)]
pub enum WaitError {
    /// The predicate never reported ready within the timeout.
    TimedOut {
        elapsed: Duration,
        last_observation: String,
    },
    /// The predicate failed in a way polling cannot fix.
    Aborted(OrchestratorError),
}

/// Poll `predicate` until it is ready or `check.timeout` elapses.
///
/// Returns the elapsed time on success. The last evaluation happens at the
/// deadline (sleeps are clamped to the remaining time), so a predicate that
/// never becomes ready fails at `timeout`, not earlier. A single evaluation
/// may run at most one interval past the deadline; one that hangs longer is
/// dropped and the wait fails as timed out.
pub async fn wait_until<F, Fut>(check: &ReadinessCheck, mut predicate: F) -> Result<Duration, WaitError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Readiness, OrchestratorError>>,
{
    let started = Instant::now();
    let deadline = started + check.timeout;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let budget = (deadline + check.poll_interval).saturating_duration_since(Instant::now());
        let evaluated = match tokio::time::timeout(budget, predicate()).await {
            Ok(evaluated) => evaluated,
            Err(_) => {
                tracing::debug!(attempt, ?budget, "readiness check overran the deadline");
                return Err(WaitError::TimedOut {
                    elapsed: started.elapsed(),
                    last_observation: format!("readiness check still running after {budget:?}"),
                });
            }
        };
        let observation = match evaluated.map_err(WaitError::Aborted)? {
            Readiness::Ready => {
                let elapsed = started.elapsed();
                tracing::debug!(attempt, ?elapsed, "readiness check passed");
                return Ok(elapsed);
            }
            Readiness::Pending(observation) => observation,
        };

        let now = Instant::now();
        if now >= deadline {
            return Err(WaitError::TimedOut {
                elapsed: now - started,
                last_observation: observation,
            });
        }
        tracing::debug!(attempt, observation = %observation, "not ready, polling again");

        let remaining = deadline - now;
        tokio::time::sleep(check.poll_interval.min(remaining)).await;
    }
}

// ---------------------------------------------------------------------------
// Probes
// ---------------------------------------------------------------------------

/// A device condition checked by running a bridge command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessProbe {
    /// `adb devices` lists `serial` in the `device` state.
    BridgeListContains { serial: String },
    /// `getprop <property>` on `serial` prints `expected`.
    BootPropertyEquals {
        serial: String,
        property: String,
        expected: String,
    },
}

impl ReadinessProbe {
    /// Run the probe's command once and interpret its output.
    ///
    /// A non-zero exit or a command timeout is reported as
    /// [`Readiness::Pending`], since both are normal while a device boots.
    /// A launch failure is returned as an error.
    pub async fn evaluate(
        &self,
        runner: &dyn ProcessRunner,
        toolchain: &Toolchain,
        command_timeout: Duration,
    ) -> Result<Readiness, OrchestratorError> {
        let command = match self {
            ReadinessProbe::BridgeListContains { .. } => toolchain.list_devices(),
            ReadinessProbe::BootPropertyEquals { serial, property, .. } => {
                toolchain.get_property(serial, property)
            }
        };

        let output = match runner.run_to_completion(&command, Some(command_timeout)).await {
            Ok(output) => output,
            Err(OrchestratorError::ProcessTimeout { timeout, .. }) => {
                return Ok(Readiness::Pending(format!("`{command}` timed out after {timeout:?}")));
            }
            Err(e) => return Err(e),
        };

        if !output.success() {
            return Ok(Readiness::Pending(format!(
                "`{command}` exited {}: {}",
                output.exit_code,
                output.stderr_tail(1)
            )));
        }

        Ok(match self {
            ReadinessProbe::BridgeListContains { serial } => {
                match parse_device_list(&output.stdout)
                    .into_iter()
                    .find(|d| &d.serial == serial)
                {
                    Some(device) if device.state == "device" => Readiness::Ready,
                    Some(device) => Readiness::Pending(format!("{serial} is {}", device.state)),
                    None => Readiness::Pending(format!("{serial} not listed")),
                }
            }
            ReadinessProbe::BootPropertyEquals { property, expected, .. } => {
                let value = output.stdout.trim();
                if value == expected {
                    Readiness::Ready
                } else {
                    Readiness::Pending(format!("{property}='{value}'"))
                }
            }
        })
    }
}
