//! Shared test helpers for avdrig-core integration tests.
//!
//! Provides a scripted [`ProcessRunner`] that stands in for the Android SDK
//! tools, a mock HTTP status endpoint for the companion server, and temp
//! directory helpers.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use avdrig_core::drain::DrainMode;
use avdrig_core::error::OrchestratorError;
use avdrig_core::process::{CommandSpec, ProcessHandle, ProcessOutput, ProcessRunner, TokioProcessRunner};

// ---------------------------------------------------------------------------
// Scripted runner
// ---------------------------------------------------------------------------

/// A canned result for one `run_to_completion` call.
#[derive(Debug, Clone)]
pub enum Scripted {
    Output(ProcessOutput),
    LaunchError,
    Timeout,
}

pub fn ok(stdout: &str) -> Scripted {
    Scripted::Output(ProcessOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    })
}

pub fn exit(code: i32, stderr: &str) -> Scripted {
    Scripted::Output(ProcessOutput {
        exit_code: code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    })
}

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Run(String),
    Spawn(String),
}

impl Call {
    pub fn line(&self) -> &str {
        match self {
            Call::Run(line) | Call::Spawn(line) => line,
        }
    }
}

/// Key used to match a command: program file name plus arguments.
pub fn command_key(command: &CommandSpec) -> String {
    let mut key = command.program_name().to_string();
    for arg in &command.args {
        key.push(' ');
        key.push_str(arg);
    }
    key
}

/// [`ProcessRunner`] whose query commands return scripted results.
///
/// Scripts are matched by prefix of [`command_key`]. Each script is a queue;
/// the last entry repeats once the others are used up. Unscripted commands
/// succeed with empty output. `spawn` starts a real, harmless placeholder
/// process so a genuine [`ProcessHandle`] is returned.
#[derive(Default)]
pub struct FakeRunner {
    scripts: Mutex<Vec<(String, VecDeque<Scripted>)>>,
    calls: Mutex<Vec<Call>>,
    spawn_command: Mutex<Option<CommandSpec>>,
    fail_spawn: AtomicBool,
}

impl FakeRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Script the results for commands whose key starts with `prefix`.
    pub fn script(&self, prefix: &str, results: Vec<Scripted>) {
        self.scripts
            .lock()
            .unwrap()
            .push((prefix.to_string(), results.into_iter().collect()));
    }

    /// Replace the placeholder process `spawn` starts.
    pub fn spawn_with(&self, command: CommandSpec) {
        *self.spawn_command.lock().unwrap() = Some(command);
    }

    pub fn fail_spawns(&self) {
        self.fail_spawn.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.line().starts_with(prefix))
            .count()
    }

    pub fn spawn_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Spawn(_)))
            .count()
    }

    /// Index of the first call starting with `prefix`.
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.calls().iter().position(|c| c.line().starts_with(prefix))
    }

    fn next_result(&self, key: &str) -> Option<Scripted> {
        let mut scripts = self.scripts.lock().unwrap();
        let (_, queue) = scripts
            .iter_mut()
            .find(|(prefix, _)| key.starts_with(prefix.as_str()))?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl ProcessRunner for FakeRunner {
    fn spawn(&self, command: &CommandSpec, mode: DrainMode) -> Result<ProcessHandle, OrchestratorError> {
        self.calls.lock().unwrap().push(Call::Spawn(command_key(command)));
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(OrchestratorError::ProcessLaunch {
                command: command.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted launch failure"),
            });
        }
        let placeholder = self
            .spawn_command
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| CommandSpec::new("sleep").arg("5"));
        TokioProcessRunner.spawn(&placeholder, mode)
    }

    async fn run_to_completion(
        &self,
        command: &CommandSpec,
        timeout: Option<Duration>,
    ) -> Result<ProcessOutput, OrchestratorError> {
        let key = command_key(command);
        self.calls.lock().unwrap().push(Call::Run(key.clone()));
        match self.next_result(&key) {
            None => Ok(ProcessOutput::default()),
            Some(Scripted::Output(output)) => Ok(output),
            Some(Scripted::LaunchError) => Err(OrchestratorError::ProcessLaunch {
                command: command.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted launch failure"),
            }),
            Some(Scripted::Timeout) => Err(OrchestratorError::ProcessTimeout {
                command: command.to_string(),
                timeout: timeout.unwrap_or_default(),
                stderr_tail: String::new(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Canned adb output
// ---------------------------------------------------------------------------

pub const NO_DEVICES: &str = "List of devices attached\n\n";

pub fn devices_with(serial: &str, state: &str) -> String {
    format!("List of devices attached\n{serial}\t{state}\n\n")
}

// ---------------------------------------------------------------------------
// Mock companion status endpoint
// ---------------------------------------------------------------------------

/// HTTP server answering every request with 200 while `healthy`, else 503.
pub struct MockStatusServer {
    pub port: u16,
    pub healthy: Arc<AtomicBool>,
    pub requests: Arc<AtomicUsize>,
}

impl MockStatusServer {
    pub async fn start(healthy: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let healthy = Arc::new(AtomicBool::new(healthy));
        let requests = Arc::new(AtomicUsize::new(0));

        let flag = healthy.clone();
        let counter = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let flag = flag.clone();
                let counter = counter.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    let response = if flag.load(Ordering::SeqCst) {
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 24\r\n\r\n{\"value\":{\"ready\":true}}"
                    } else {
                        "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n"
                    };
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Self { port, healthy, requests }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

/// A port nothing listens on: bind, read the port, release it.
pub async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

/// A fresh directory under the system temp dir, removed on drop.
pub struct TempDir {
    pub path: PathBuf,
}

impl TempDir {
    pub fn new(label: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "avdrig_{label}_{}",
            uuid::Uuid::new_v4().to_string().replace('-', "")[..8].to_string()
        ));
        std::fs::create_dir_all(&path).unwrap();
        Self { path }
    }

    pub fn join(&self, part: &str) -> PathBuf {
        self.path.join(part)
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// Write a placeholder package file and return its path.
pub fn fake_package(dir: &TempDir) -> PathBuf {
    let path = dir.join("app-debug.apk");
    std::fs::write(&path, b"PK\x03\x04 not really an apk").unwrap();
    path
}

/// All files under `root` with their contents, sorted by relative path.
pub fn tree_snapshot(root: &std::path::Path) -> Vec<(String, Vec<u8>)> {
    fn walk(root: &std::path::Path, dir: &std::path::Path, out: &mut Vec<(String, Vec<u8>)>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                out.push((path.strip_prefix(root).unwrap().display().to_string() + "/", Vec::new()));
                walk(root, &path, out);
            } else {
                out.push((
                    path.strip_prefix(root).unwrap().display().to_string(),
                    std::fs::read(&path).unwrap(),
                ));
            }
        }
    }
    let mut out = Vec::new();
    walk(root, root, &mut out);
    out.sort();
    out
}
