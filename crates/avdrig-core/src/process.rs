//! Launching external tools as command vectors.
//!
//! Every external program the orchestrator drives (`adb`, `emulator`,
//! `avdmanager`, the companion server) is started through a
//! [`ProcessRunner`]. Commands are always a program plus an explicit argument
//! list ([`CommandSpec`]); no shell string is ever assembled, so arguments
//! coming from configuration cannot be reinterpreted by a shell.
//!
//! Both output streams are piped and handed to
//! [`spawn_drain`](crate::drain::spawn_drain) immediately at spawn, so a
//! chatty child can never block on a full pipe while the caller is busy
//! elsewhere.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use avdrig_core::process::{CommandSpec, ProcessRunner, TokioProcessRunner};
//!
//! # async fn example() -> Result<(), avdrig_core::error::OrchestratorError> {
//! let runner = TokioProcessRunner;
//! let output = runner
//!     .run_to_completion(&CommandSpec::new("adb").arg("devices"), Some(Duration::from_secs(10)))
//!     .await?;
//! if output.success() {
//!     println!("{}", output.stdout);
//! }
//! # Ok(())
//! # }
//! ```

use std::ffi::OsStr;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::drain::{spawn_drain, DrainHandle, DrainMode, DrainedStream, StreamKind};
use crate::error::OrchestratorError;

/// How long drains get to reach EOF after their process was killed.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Lines of stderr carried in error values.
const ERROR_TAIL_LINES: usize = 20;

// ---------------------------------------------------------------------------
// CommandSpec
// ---------------------------------------------------------------------------

/// A program and its argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// The program's file name, used for matching in fakes and for log fields.
    pub fn program_name(&self) -> &str {
        self.program
            .file_name()
            .and_then(OsStr::to_str)
            .unwrap_or_default()
    }
}

impl fmt::Display for CommandSpec {
    /// Renders the vector for logs only; quoting is cosmetic.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ProcessOutput
// ---------------------------------------------------------------------------

/// Result of a process that ran to completion.
///
/// A non-zero `exit_code` is data, not an error; the caller decides what it
/// means. A process terminated by a signal reports `-1`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// The last `lines` lines of stderr.
    pub fn stderr_tail(&self, lines: usize) -> String {
        let all: Vec<&str> = self.stderr.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

// ---------------------------------------------------------------------------
// ProcessHandle
// ---------------------------------------------------------------------------

/// A spawned process with both output streams being drained.
///
/// The handle exclusively owns the child. Dropping it does not kill the
/// process unless it was spawned by [`ProcessRunner::run_to_completion`].
pub struct ProcessHandle {
    command: CommandSpec,
    pid: Option<u32>,
    child: Child,
    stdout: Option<DrainHandle>,
    stderr: Option<DrainHandle>,
    exit_code: Option<i32>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("command", &self.command.to_string())
            .field("pid", &self.pid)
            .field("exit_code", &self.exit_code)
            .finish()
    }
}

impl ProcessHandle {
    pub fn command(&self) -> &CommandSpec {
        &self.command
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit code, if the process has been observed to exit.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Non-blocking exit check. Returns the exit code once the process is gone.
    pub fn try_exit(&mut self) -> Result<Option<i32>, OrchestratorError> {
        if self.exit_code.is_none() {
            if let Some(status) = self.child.try_wait()? {
                self.exit_code = Some(exit_code_of(status));
            }
        }
        Ok(self.exit_code)
    }

    /// Send a kill signal and reap the process.
    pub async fn kill(&mut self) -> Result<(), OrchestratorError> {
        if self.exit_code.is_some() {
            return Ok(());
        }
        self.child.kill().await?;
        let status = self.child.wait().await?;
        self.exit_code = Some(exit_code_of(status));
        Ok(())
    }

    /// Wait for the process to exit and for both drains to finish.
    ///
    /// With a timeout, an overrunning process is killed and
    /// [`OrchestratorError::ProcessTimeout`] is returned.
    pub async fn wait(mut self, timeout: Option<Duration>) -> Result<ProcessOutput, OrchestratorError> {
        let status = match timeout {
            None => self.child.wait().await?,
            Some(limit) => match tokio::time::timeout(limit, self.child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    tracing::warn!(command = %self.command, ?limit, "process timed out, killing");
                    let _ = self.child.kill().await;
                    let (_, stderr) = self.finish_drains(Some(DRAIN_GRACE)).await;
                    return Err(OrchestratorError::ProcessTimeout {
                        command: self.command.to_string(),
                        timeout: limit,
                        stderr_tail: last_lines(&stderr.tail, ERROR_TAIL_LINES),
                    });
                }
            },
        };

        let exit_code = exit_code_of(status);
        self.exit_code = Some(exit_code);
        // A grandchild that inherited the pipes can keep them open after the
        // direct child exits.
        let (stdout, stderr) = self.finish_drains(Some(DRAIN_GRACE)).await;
        Ok(ProcessOutput {
            exit_code,
            stdout: stdout.text,
            stderr: stderr.text,
        })
    }

    /// Collect both drains, aborting any that outlive `grace`.
    ///
    /// Lines an aborted drain had already read are still returned. Also used
    /// on handles that are being abandoned so their tails can be logged.
    pub async fn finish_drains(&mut self, grace: Option<Duration>) -> (DrainedStream, DrainedStream) {
        let stdout = match self.stdout.take() {
            Some(drain) => drain.finish(grace).await,
            None => DrainedStream::default(),
        };
        let stderr = match self.stderr.take() {
            Some(drain) => drain.finish(grace).await,
            None => DrainedStream::default(),
        };
        (stdout, stderr)
    }
}

fn last_lines(lines: &[String], n: usize) -> String {
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

// ---------------------------------------------------------------------------
// ProcessRunner
// ---------------------------------------------------------------------------

/// Launches external commands.
///
/// The trait is the seam tests use to script tool behavior without touching
/// a real Android SDK.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Start `command` and return immediately with both streams draining.
    fn spawn(&self, command: &CommandSpec, mode: DrainMode) -> Result<ProcessHandle, OrchestratorError>;

    /// Run `command` to completion, capturing both streams.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::ProcessLaunch`] if the program cannot be started
    /// - [`OrchestratorError::ProcessTimeout`] if `timeout` elapses first
    async fn run_to_completion(
        &self,
        command: &CommandSpec,
        timeout: Option<Duration>,
    ) -> Result<ProcessOutput, OrchestratorError>;
}

/// [`ProcessRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessRunner;

impl TokioProcessRunner {
    fn launch(command: &CommandSpec, mode: DrainMode, kill_on_drop: bool) -> Result<ProcessHandle, OrchestratorError> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(kill_on_drop)
            .spawn()
            .map_err(|source| OrchestratorError::ProcessLaunch {
                command: command.to_string(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .map(|out| spawn_drain(out, StreamKind::Stdout, mode));
        let stderr = child
            .stderr
            .take()
            .map(|err| spawn_drain(err, StreamKind::Stderr, mode));

        let pid = child.id();
        tracing::debug!(command = %command, ?pid, "spawned process");

        Ok(ProcessHandle {
            command: command.clone(),
            pid,
            child,
            stdout,
            stderr,
            exit_code: None,
        })
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    fn spawn(&self, command: &CommandSpec, mode: DrainMode) -> Result<ProcessHandle, OrchestratorError> {
        Self::launch(command, mode, false)
    }

    async fn run_to_completion(
        &self,
        command: &CommandSpec,
        timeout: Option<Duration>,
    ) -> Result<ProcessOutput, OrchestratorError> {
        let handle = Self::launch(command, DrainMode::Capture, true)?;
        let output = handle.wait(timeout).await?;
        tracing::debug!(command = %command, exit_code = output.exit_code, "process exited");
        Ok(output)
    }
}
