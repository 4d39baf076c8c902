//! Virtual device definitions on disk.
//!
//! A device definition is the `<name>.avd` directory `avdmanager` writes into
//! the AVD home. [`DeviceRegistry::ensure_device`] only invokes the creation
//! tool when that directory is absent, so repeated setup runs reuse the
//! existing definition.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::OrchestratorError;
use crate::process::ProcessRunner;
use crate::toolchain::Toolchain;

/// Identity and hardware of a virtual device. Identity is `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualDeviceSpec {
    pub name: String,
    pub device_profile: String,
    pub image_package: String,
    pub abi: String,
}

/// Result of [`DeviceRegistry::ensure_device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnsureOutcome {
    pub created: bool,
}

/// Checks for and creates device definitions in an AVD home directory.
pub struct DeviceRegistry {
    runner: Arc<dyn ProcessRunner>,
    toolchain: Toolchain,
    avd_home: PathBuf,
    command_timeout: Duration,
}

impl DeviceRegistry {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        toolchain: Toolchain,
        avd_home: PathBuf,
        command_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            toolchain,
            avd_home,
            command_timeout,
        }
    }

    /// Path of the definition directory for `name`.
    pub fn definition_dir(&self, name: &str) -> PathBuf {
        self.avd_home.join(format!("{name}.avd"))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.definition_dir(name).is_dir()
    }

    /// Create the definition for `spec` unless it already exists.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::DeviceCreation`] if the creation tool exits non-zero
    /// - [`OrchestratorError::ProcessLaunch`] / [`OrchestratorError::ProcessTimeout`]
    ///   from running the tool
    pub async fn ensure_device(&self, spec: &VirtualDeviceSpec) -> Result<EnsureOutcome, OrchestratorError> {
        if self.exists(&spec.name) {
            tracing::info!(device = %spec.name, "virtual device already exists");
            return Ok(EnsureOutcome { created: false });
        }

        tracing::info!(
            device = %spec.name,
            profile = %spec.device_profile,
            package = %spec.image_package,
            "creating virtual device"
        );
        let command = self.toolchain.create_device(spec);
        let output = self
            .runner
            .run_to_completion(&command, Some(self.command_timeout))
            .await?;

        if !output.success() {
            return Err(OrchestratorError::DeviceCreation {
                exit_code: output.exit_code,
                stderr: output.stderr_tail(20),
            });
        }

        tracing::info!(device = %spec.name, "virtual device created");
        Ok(EnsureOutcome { created: true })
    }
}
