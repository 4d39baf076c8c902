//! Setup and teardown of a complete test device.
//!
//! [`Orchestrator`] owns every component for one device and runs them in the
//! required order:
//!
//! 1. mirror the system image into the SDK
//! 2. create the virtual device definition if missing
//! 3. restart the bridge and launch the emulator
//! 4. wait for bridge registration, then boot completion
//! 5. wait the stabilization delay
//! 6. install the application package
//! 7. start the companion automation server
//!
//! Teardown stops the emulator and the companion server on a best-effort
//! basis: every step is attempted and every failure is reported in a
//! [`TeardownReport`]. A setup failure is never replaced by a teardown
//! failure.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use avdrig_core::config::OrchestratorConfig;
//! use avdrig_core::orchestrator::Orchestrator;
//! use avdrig_core::process::TokioProcessRunner;
//! use avdrig_core::session::SessionRegistry;
//!
//! # async fn example() -> Result<(), avdrig_core::error::OrchestratorError> {
//! let config = OrchestratorConfig::load_default()?;
//! let mut orchestrator = Orchestrator::new(config, Arc::new(TokioProcessRunner), SessionRegistry::default())?;
//! let passed = orchestrator.run(|| async { true }).await?;
//! # let _ = passed;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::companion::CompanionSupervisor;
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::image::{ensure_image, DeviceImage};
use crate::poll::{Readiness, ReadinessProbe};
use crate::process::ProcessRunner;
use crate::registry::{DeviceRegistry, VirtualDeviceSpec};
use crate::session::{DeviceSession, DeviceSessionState, SessionRegistry};
use crate::toolchain::{Toolchain, BOOT_COMPLETED_PROPERTY};

/// Failures collected while tearing down.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub errors: Vec<OrchestratorError>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Point-in-time view of the device and companion server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub device: String,
    pub serial: String,
    pub definition_exists: bool,
    pub registered: bool,
    pub boot_completed: bool,
    pub companion_running: bool,
    /// State of this orchestrator's own session.
    pub session_state: String,
}

/// Drives one virtual device through setup and teardown.
pub struct Orchestrator {
    config: OrchestratorConfig,
    run_id: Uuid,
    runner: Arc<dyn ProcessRunner>,
    toolchain: Toolchain,
    image: DeviceImage,
    device: VirtualDeviceSpec,
    registry: DeviceRegistry,
    session: DeviceSession,
    companion: CompanionSupervisor,
}

impl Orchestrator {
    /// Build an orchestrator from a validated configuration.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::Config`] if the configuration is incomplete or
    ///   no SDK root can be determined
    pub fn new(
        config: OrchestratorConfig,
        runner: Arc<dyn ProcessRunner>,
        sessions: SessionRegistry,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let sdk_root = config.resolved_sdk_root().ok_or_else(|| {
            OrchestratorError::Config(
                "no SDK root: set sdk_root, ANDROID_SDK_ROOT, or ANDROID_HOME".to_string(),
            )
        })?;
        let toolchain = Toolchain::from_sdk_root(Some(&sdk_root));

        let local_source: PathBuf = config.image.local_source.clone().unwrap_or_default();
        let image = DeviceImage::for_package(local_source, &sdk_root, &config.device.image_package);
        let device = VirtualDeviceSpec {
            name: config.device.name.clone(),
            device_profile: config.device.profile.clone(),
            image_package: config.device.image_package.clone(),
            abi: config.device.abi.clone(),
        };

        let timeouts = &config.timeouts;
        let registry = DeviceRegistry::new(
            runner.clone(),
            toolchain.clone(),
            config.resolved_avd_home(),
            timeouts.command_timeout,
        );
        let session = DeviceSession::new(
            config.device.name.clone(),
            config.device.console_port,
            config.boot.clone(),
            runner.clone(),
            toolchain.clone(),
            sessions,
        )
        .with_poll_interval(timeouts.poll_interval)
        .with_command_timeout(timeouts.command_timeout)
        .with_install_timeout(timeouts.install_timeout);
        let companion = CompanionSupervisor::new(config.companion.clone(), runner.clone())?;

        Ok(Self {
            config,
            run_id: Uuid::new_v4(),
            runner,
            toolchain,
            image,
            device,
            registry,
            session,
            companion,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    pub fn companion(&self) -> &CompanionSupervisor {
        &self.companion
    }

    fn span(&self) -> tracing::Span {
        tracing::info_span!("avdrig", run_id = %self.run_id, device = %self.device.name)
    }

    /// Bring the device from nothing to `Running` with the companion server up.
    pub async fn setup(&mut self) -> Result<(), OrchestratorError> {
        let span = self.span();
        self.setup_steps().instrument(span).await
    }

    async fn setup_steps(&mut self) -> Result<(), OrchestratorError> {
        let timeouts = self.config.timeouts.clone();
        tracing::info!("setup started");

        ensure_image(&self.image).await?;
        let outcome = self.registry.ensure_device(&self.device).await?;
        tracing::debug!(created = outcome.created, "virtual device ready");

        self.session.start().await?;
        self.session.await_registration(timeouts.registration_timeout).await?;
        self.session.await_boot(timeouts.boot_timeout).await?;
        self.session.stabilize(timeouts.stabilization_delay).await?;

        // validate() guarantees a package path.
        if let Some(package) = self.config.package_path.clone() {
            self.session.install_package(&package).await?;
        }

        self.companion.start().await?;
        tracing::info!("setup complete");
        Ok(())
    }

    /// Stop the emulator and the companion server, attempting both even if
    /// the first fails.
    pub async fn teardown(&mut self) -> TeardownReport {
        let span = self.span();
        async {
            let mut report = TeardownReport::default();
            tracing::info!("teardown started");

            if self.session.state().is_active() {
                if let Err(e) = self.session.stop().await {
                    tracing::error!(error = %e, "failed to stop device");
                    report.errors.push(e);
                }
            } else {
                tracing::debug!(state = ?self.session.state(), "no active device session to stop");
            }

            if let Err(e) = self.companion.stop().await {
                tracing::error!(error = %e, "failed to stop companion service");
                report.errors.push(e);
            }

            tracing::info!(failures = report.errors.len(), "teardown finished");
            report
        }
        .instrument(span)
        .await
    }

    /// Run `tests` between setup and teardown.
    ///
    /// A setup failure skips `tests`, still attempts teardown, and returns the
    /// setup error. Teardown failures after the tests ran are logged and do
    /// not change the returned value.
    pub async fn run<F, Fut, T>(&mut self, tests: F) -> Result<T, OrchestratorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.run_with_shutdown(tests, std::future::pending()).await
    }

    /// [`run`](Self::run), abandoning setup or `tests` as soon as `shutdown`
    /// completes.
    ///
    /// Teardown always runs. An interrupted run returns
    /// [`OrchestratorError::Interrupted`]; the dropped `tests` future is
    /// responsible for its own cleanup.
    pub async fn run_with_shutdown<F, Fut, T, S>(&mut self, tests: F, shutdown: S) -> Result<T, OrchestratorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let setup = tokio::select! {
            result = self.setup() => result,
            _ = &mut shutdown => Err(OrchestratorError::Interrupted),
        };
        if let Err(setup_error) = setup {
            match setup_error {
                OrchestratorError::Interrupted => tracing::warn!("interrupted during setup, tearing down"),
                ref e => tracing::error!(error = %e, "setup failed, aborting run"),
            }
            let report = self.teardown().await;
            if !report.is_clean() {
                tracing::error!(
                    failures = report.errors.len(),
                    "teardown after failed setup was incomplete"
                );
            }
            return Err(setup_error);
        }

        let result = tokio::select! {
            result = tests() => Some(result),
            _ = &mut shutdown => None,
        };
        if result.is_none() {
            tracing::warn!("interrupted while tests were running, tearing down");
        }

        let report = self.teardown().await;
        for error in &report.errors {
            tracing::error!(error = %error, "teardown failure");
        }
        result.ok_or(OrchestratorError::Interrupted)
    }

    /// Query the device and companion server without changing anything.
    pub async fn status(&mut self) -> Result<StatusReport, OrchestratorError> {
        let serial = self.session.serial().to_string();
        let command_timeout = self.config.timeouts.command_timeout;

        let registered = ReadinessProbe::BridgeListContains { serial: serial.clone() }
            .evaluate(self.runner.as_ref(), &self.toolchain, command_timeout)
            .await?
            == Readiness::Ready;
        let boot_completed = if registered {
            ReadinessProbe::BootPropertyEquals {
                serial: serial.clone(),
                property: BOOT_COMPLETED_PROPERTY.to_string(),
                expected: "1".to_string(),
            }
            .evaluate(self.runner.as_ref(), &self.toolchain, command_timeout)
            .await?
                == Readiness::Ready
        } else {
            false
        };

        Ok(StatusReport {
            device: self.device.name.clone(),
            serial,
            definition_exists: self.registry.exists(&self.device.name),
            registered,
            boot_completed,
            companion_running: self.companion.is_running().await,
            session_state: format!("{:?}", self.session.state()),
        })
    }

    /// Whether this orchestrator's session reached `Running`.
    pub fn is_ready(&self) -> bool {
        self.session.state() == DeviceSessionState::Running
    }
}
