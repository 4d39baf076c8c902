//! Orchestrator configuration.
//!
//! Settings are stored as JSON, by default in `~/.avdrig/config.json`. Every
//! section has defaults so a config file only needs to name what differs,
//! typically the device name and the two local paths. Durations are written
//! in milliseconds (`*_ms` keys).
//!
//! # Example
//!
//! ```no_run
//! use avdrig_core::config::OrchestratorConfig;
//!
//! let config = OrchestratorConfig::load_default().unwrap();
//! config.validate().unwrap();
//! println!("device: {}", config.device.name);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;

const CONFIG_FILENAME: &str = "config.json";

/// Returns the avdrig state directory (`~/.avdrig/`).
///
/// Falls back to the system temp directory if no home directory is known.
pub fn avdrig_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".avdrig")
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub device: DeviceConfig,
    pub image: ImageConfig,
    /// The application package installed once the device is stable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_path: Option<PathBuf>,
    /// Android SDK root. Falls back to `$ANDROID_SDK_ROOT` / `$ANDROID_HOME`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdk_root: Option<PathBuf>,
    /// Virtual device definitions directory. Falls back to
    /// `$ANDROID_AVD_HOME`, then `~/.android/avd`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avd_home: Option<PathBuf>,
    pub boot: BootOptions,
    pub companion: CompanionConfig,
    pub timeouts: Timeouts,
}

/// Identity and hardware of the virtual device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: String,
    pub profile: String,
    pub image_package: String,
    pub abi: String,
    /// Console port passed to the emulator; the bridge serial is
    /// `emulator-<console_port>`.
    pub console_port: u16,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "avdrig_test".to_string(),
            profile: "pixel_6".to_string(),
            image_package: "system-images;android-34;google_apis;x86_64".to_string(),
            abi: "x86_64".to_string(),
            console_port: 5554,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Local cache directory holding the unpacked system image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_source: Option<PathBuf>,
}

/// Emulator boot flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootOptions {
    /// Discard user data on every boot for a fresh device.
    pub wipe_data: bool,
    pub no_snapshot_load: bool,
    /// Run without a window (`-no-window`), for CI hosts.
    pub headless: bool,
    pub extra_args: Vec<String>,
}

impl Default for BootOptions {
    fn default() -> Self {
        Self {
            wipe_data: true,
            no_snapshot_load: true,
            headless: false,
            extra_args: Vec::new(),
        }
    }
}

/// The automation server test clients connect to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionConfig {
    pub binary: PathBuf,
    pub address: String,
    pub port: u16,
    /// Insecure features enabled with `--allow-insecure`.
    pub allow_insecure: Vec<String>,
    pub status_path: String,
    #[serde(rename = "start_timeout_ms", with = "duration_ms")]
    pub start_timeout: Duration,
    pub extra_args: Vec<String>,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("appium"),
            address: "127.0.0.1".to_string(),
            port: 4723,
            allow_insecure: vec!["chromedriver_autodownload".to_string()],
            status_path: "/status".to_string(),
            start_timeout: Duration::from_secs(30),
            extra_args: Vec::new(),
        }
    }
}

/// Every wait the orchestrator performs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    #[serde(rename = "registration_timeout_ms", with = "duration_ms")]
    pub registration_timeout: Duration,
    #[serde(rename = "boot_timeout_ms", with = "duration_ms")]
    pub boot_timeout: Duration,
    #[serde(rename = "stabilization_delay_ms", with = "duration_ms")]
    pub stabilization_delay: Duration,
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,
    /// Upper bound for short query commands (`adb devices`, `getprop`, ...).
    #[serde(rename = "command_timeout_ms", with = "duration_ms")]
    pub command_timeout: Duration,
    #[serde(rename = "install_timeout_ms", with = "duration_ms")]
    pub install_timeout: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            registration_timeout: Duration::from_secs(120),
            boot_timeout: Duration::from_secs(120),
            stabilization_delay: Duration::from_secs(10),
            poll_interval: Duration::from_secs(5),
            command_timeout: Duration::from_secs(60),
            install_timeout: Duration::from_secs(300),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

impl OrchestratorConfig {
    /// Load config from `path`.
    pub fn load(path: &Path) -> Result<Self, OrchestratorError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| OrchestratorError::Config(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| OrchestratorError::Config(format!("cannot parse {}: {e}", path.display())))
    }

    /// Load config from `~/.avdrig/config.json`.
    ///
    /// Returns [`Default`] if the file does not exist.
    pub fn load_default() -> Result<Self, OrchestratorError> {
        let path = Self::default_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn default_path() -> PathBuf {
        avdrig_dir().join(CONFIG_FILENAME)
    }

    /// Save config to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), OrchestratorError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| OrchestratorError::Config(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Check the values a setup run cannot do without.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        let name = &self.device.name;
        if name.is_empty() {
            return Err(OrchestratorError::Config("device.name must not be empty".into()));
        }
        // The name becomes a directory name under the AVD home.
        if name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(OrchestratorError::Config(format!(
                "device.name '{name}' must not contain path separators"
            )));
        }
        if self.device.image_package.is_empty() {
            return Err(OrchestratorError::Config("device.image_package must not be empty".into()));
        }
        if self.image.local_source.is_none() {
            return Err(OrchestratorError::Config("image.local_source is required".into()));
        }
        if self.package_path.is_none() {
            return Err(OrchestratorError::Config("package_path is required".into()));
        }
        if self.timeouts.poll_interval.is_zero() {
            return Err(OrchestratorError::Config("timeouts.poll_interval_ms must be positive".into()));
        }
        Ok(())
    }

    /// SDK root from config or the environment.
    pub fn resolved_sdk_root(&self) -> Option<PathBuf> {
        self.sdk_root.clone().or_else(|| {
            std::env::var_os("ANDROID_SDK_ROOT")
                .or_else(|| std::env::var_os("ANDROID_HOME"))
                .map(PathBuf::from)
        })
    }

    /// AVD home from config, `$ANDROID_AVD_HOME`, or `~/.android/avd`.
    pub fn resolved_avd_home(&self) -> PathBuf {
        if let Some(dir) = &self.avd_home {
            return dir.clone();
        }
        if let Some(dir) = std::env::var_os("ANDROID_AVD_HOME") {
            return PathBuf::from(dir);
        }
        dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".android")
            .join("avd")
    }
}
