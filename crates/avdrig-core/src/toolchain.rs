//! Android SDK tool locations and the exact command vectors run against them.
//!
//! All knowledge of `adb`, `emulator`, and `avdmanager` argument syntax lives
//! here; the rest of the crate asks a [`Toolchain`] for a
//! [`CommandSpec`] and hands it to a
//! [`ProcessRunner`](crate::process::ProcessRunner). Output parsing for
//! those commands lives here too.

use std::path::{Path, PathBuf};

use crate::config::BootOptions;
use crate::process::CommandSpec;
use crate::registry::VirtualDeviceSpec;

/// Property the emulator sets to `1` once Android has finished booting.
pub const BOOT_COMPLETED_PROPERTY: &str = "sys.boot_completed";

/// Resolved paths to the SDK tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub adb: PathBuf,
    pub emulator: PathBuf,
    pub avdmanager: PathBuf,
}

impl Default for Toolchain {
    /// Bare program names, resolved through `PATH` at spawn time.
    fn default() -> Self {
        Self {
            adb: PathBuf::from("adb"),
            emulator: PathBuf::from("emulator"),
            avdmanager: PathBuf::from("avdmanager"),
        }
    }
}

impl Toolchain {
    /// Locate tools inside `sdk_root`, falling back to `PATH` for any tool
    /// not found there.
    pub fn from_sdk_root(sdk_root: Option<&Path>) -> Self {
        let Some(root) = sdk_root else {
            return Self::default();
        };
        let pick = |candidates: &[PathBuf], fallback: &str| {
            candidates
                .iter()
                .find(|p| p.is_file())
                .cloned()
                .unwrap_or_else(|| PathBuf::from(fallback))
        };
        Self {
            adb: pick(&[root.join("platform-tools").join("adb")], "adb"),
            emulator: pick(&[root.join("emulator").join("emulator")], "emulator"),
            avdmanager: pick(
                &[
                    root.join("cmdline-tools").join("latest").join("bin").join("avdmanager"),
                    root.join("tools").join("bin").join("avdmanager"),
                ],
                "avdmanager",
            ),
        }
    }

    /// Tools that cannot be resolved to an executable file.
    pub fn missing_tools(&self) -> Vec<(&'static str, PathBuf)> {
        [
            ("adb", &self.adb),
            ("emulator", &self.emulator),
            ("avdmanager", &self.avdmanager),
        ]
        .into_iter()
        .filter(|(_, path)| resolve_executable(path).is_none())
        .map(|(name, path)| (name, path.clone()))
        .collect()
    }

    // -- bridge -------------------------------------------------------------

    /// `adb devices`
    pub fn list_devices(&self) -> CommandSpec {
        CommandSpec::new(&self.adb).arg("devices")
    }

    /// `adb kill-server`
    pub fn kill_bridge(&self) -> CommandSpec {
        CommandSpec::new(&self.adb).arg("kill-server")
    }

    /// `adb start-server`
    pub fn start_bridge(&self) -> CommandSpec {
        CommandSpec::new(&self.adb).arg("start-server")
    }

    /// `adb -s <serial> shell getprop <property>`
    pub fn get_property(&self, serial: &str, property: &str) -> CommandSpec {
        CommandSpec::new(&self.adb).args(["-s", serial, "shell", "getprop", property])
    }

    /// `adb -s <serial> install [-r] <package>`
    pub fn install_package(&self, serial: &str, package: &Path, reinstall: bool) -> CommandSpec {
        let mut cmd = CommandSpec::new(&self.adb).args(["-s", serial, "install"]);
        if reinstall {
            cmd = cmd.arg("-r");
        }
        cmd.arg(package.to_string_lossy())
    }

    /// `adb -s <serial> emu kill`
    pub fn kill_device(&self, serial: &str) -> CommandSpec {
        CommandSpec::new(&self.adb).args(["-s", serial, "emu", "kill"])
    }

    // -- definitions and boot -----------------------------------------------

    /// `avdmanager create avd --name <n> --device <p> --package <k> --abi <a> --force`
    pub fn create_device(&self, spec: &VirtualDeviceSpec) -> CommandSpec {
        CommandSpec::new(&self.avdmanager).args([
            "create",
            "avd",
            "--name",
            spec.name.as_str(),
            "--device",
            spec.device_profile.as_str(),
            "--package",
            spec.image_package.as_str(),
            "--abi",
            spec.abi.as_str(),
            "--force",
        ])
    }

    /// `emulator -avd <name> -port <port> [-no-snapshot-load] [-wipe-data] [-no-window] ...`
    pub fn boot_device(&self, name: &str, console_port: u16, options: &BootOptions) -> CommandSpec {
        let mut cmd = CommandSpec::new(&self.emulator)
            .args(["-avd", name, "-port"])
            .arg(console_port.to_string());
        if options.no_snapshot_load {
            cmd = cmd.arg("-no-snapshot-load");
        }
        if options.wipe_data {
            cmd = cmd.arg("-wipe-data");
        }
        if options.headless {
            cmd = cmd.arg("-no-window");
        }
        cmd.args(options.extra_args.iter().cloned())
    }
}

/// The bridge serial of an emulator listening on `console_port`.
pub fn emulator_serial(console_port: u16) -> String {
    format!("emulator-{console_port}")
}

/// Find `program` as an executable file, searching `PATH` for bare names.
pub fn resolve_executable(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }
    which::which(program).ok()
}

/// One row of `adb devices` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeDevice {
    pub serial: String,
    /// `device`, `offline`, `unauthorized`, ...
    pub state: String,
}

/// Parse `adb devices` output, skipping the header and daemon chatter.
pub fn parse_device_list(stdout: &str) -> Vec<BridgeDevice> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            let state = parts.next()?;
            Some(BridgeDevice {
                serial: serial.to_string(),
                state: state.to_string(),
            })
        })
        .collect()
}

/// The `Failure [...]` line older `adb install` versions print while still
/// exiting 0.
pub fn install_failure(stdout: &str) -> Option<&str> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("Failure") || line.starts_with("adb: failed to install"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> VirtualDeviceSpec {
        VirtualDeviceSpec {
            name: "ci_pixel".to_string(),
            device_profile: "pixel_6".to_string(),
            image_package: "system-images;android-34;google_apis;x86_64".to_string(),
            abi: "x86_64".to_string(),
        }
    }

    #[test]
    fn create_device_argument_contract() {
        let cmd = Toolchain::default().create_device(&spec());
        assert_eq!(cmd.program, PathBuf::from("avdmanager"));
        assert_eq!(
            cmd.args,
            vec![
                "create", "avd", "--name", "ci_pixel", "--device", "pixel_6", "--package",
                "system-images;android-34;google_apis;x86_64", "--abi", "x86_64", "--force",
            ]
        );
    }

    #[test]
    fn boot_device_default_flags() {
        let cmd = Toolchain::default().boot_device("ci_pixel", 5554, &BootOptions::default());
        assert_eq!(
            cmd.args,
            vec!["-avd", "ci_pixel", "-port", "5554", "-no-snapshot-load", "-wipe-data"]
        );
    }

    #[test]
    fn boot_device_without_wipe_and_headless() {
        let options = BootOptions {
            wipe_data: false,
            no_snapshot_load: false,
            headless: true,
            extra_args: vec!["-gpu".to_string(), "swiftshader_indirect".to_string()],
        };
        let cmd = Toolchain::default().boot_device("ci_pixel", 5556, &options);
        assert_eq!(
            cmd.args,
            vec!["-avd", "ci_pixel", "-port", "5556", "-no-window", "-gpu", "swiftshader_indirect"]
        );
    }

    #[test]
    fn bridge_commands() {
        let tools = Toolchain::default();
        assert_eq!(tools.list_devices().args, vec!["devices"]);
        assert_eq!(tools.kill_bridge().args, vec!["kill-server"]);
        assert_eq!(tools.start_bridge().args, vec!["start-server"]);
        assert_eq!(
            tools.get_property("emulator-5554", BOOT_COMPLETED_PROPERTY).args,
            vec!["-s", "emulator-5554", "shell", "getprop", "sys.boot_completed"]
        );
        assert_eq!(
            tools.kill_device("emulator-5554").args,
            vec!["-s", "emulator-5554", "emu", "kill"]
        );
        assert_eq!(
            tools
                .install_package("emulator-5554", Path::new("/apks/app.apk"), true)
                .args,
            vec!["-s", "emulator-5554", "install", "-r", "/apks/app.apk"]
        );
    }

    #[test]
    fn sdk_root_without_tools_falls_back_to_path_names() {
        let tools = Toolchain::from_sdk_root(Some(Path::new("/nonexistent/sdk")));
        assert_eq!(tools, Toolchain::default());
    }

    #[test]
    fn sdk_root_tools_are_preferred() {
        let root = std::env::temp_dir().join(format!("avdrig_sdk_{}", uuid::Uuid::new_v4()));
        let tools_dir = root.join("platform-tools");
        std::fs::create_dir_all(&tools_dir).unwrap();
        std::fs::write(tools_dir.join("adb"), "").unwrap();

        let tools = Toolchain::from_sdk_root(Some(&root));
        assert_eq!(tools.adb, tools_dir.join("adb"));
        assert_eq!(tools.emulator, PathBuf::from("emulator"));

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn parse_device_list_with_daemon_chatter() {
        let stdout = "* daemon not running; starting now at tcp:5037\n\
                      * daemon started successfully\n\
                      List of devices attached\n\
                      emulator-5554\tdevice\n\
                      emulator-5556\toffline\n\n";
        let devices = parse_device_list(stdout);
        assert_eq!(
            devices,
            vec![
                BridgeDevice { serial: "emulator-5554".into(), state: "device".into() },
                BridgeDevice { serial: "emulator-5556".into(), state: "offline".into() },
            ]
        );
    }

    #[test]
    fn parse_empty_device_list() {
        assert!(parse_device_list("List of devices attached\n\n").is_empty());
    }

    #[test]
    fn install_failure_detection() {
        assert_eq!(
            install_failure("Performing Streamed Install\nFailure [INSTALL_FAILED_OLDER_SDK]\n"),
            Some("Failure [INSTALL_FAILED_OLDER_SDK]")
        );
        assert_eq!(install_failure("Performing Streamed Install\nSuccess\n"), None);
    }

    #[cfg(unix)]
    #[test]
    fn bare_names_resolve_through_path() {
        let sh = resolve_executable(Path::new("sh")).unwrap();
        assert!(sh.is_absolute());
        assert!(resolve_executable(Path::new("avdrig-no-such-tool")).is_none());
        assert!(resolve_executable(Path::new("/nonexistent/sdk/platform-tools/adb")).is_none());
    }

    #[test]
    fn serial_for_console_port() {
        assert_eq!(emulator_serial(5554), "emulator-5554");
    }
}
