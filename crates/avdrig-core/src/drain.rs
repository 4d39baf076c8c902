//! Concurrent draining of child process output streams.
//!
//! A child that writes more than the OS pipe buffer to a stream nobody reads
//! blocks forever. Every stream the [`process`](crate::process) runner pipes
//! is therefore handed to [`spawn_drain`] the moment the child is spawned, and
//! read to EOF on its own tokio task regardless of when (or whether) the
//! caller waits for the exit status.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

/// Number of trailing lines kept for error context.
pub const TAIL_LINES: usize = 64;

/// Which of a child's output streams a drain is reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// What a drain does with the lines it reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
    /// Buffer the complete stream; used for short-lived query commands.
    Capture,
    /// Log every line under `target` and keep only the tail; used for
    /// long-running processes whose output is unbounded.
    Forward { target: &'static str },
}

/// Everything a drain retained once its stream hit EOF.
#[derive(Debug, Clone, Default)]
pub struct DrainedStream {
    /// Full text for [`DrainMode::Capture`], empty for [`DrainMode::Forward`].
    pub text: String,
    /// The last [`TAIL_LINES`] lines in either mode.
    pub tail: Vec<String>,
    /// Total number of lines read.
    pub lines: usize,
}

impl DrainedStream {
    /// The tail joined back into a single string.
    pub fn tail_text(&self) -> String {
        self.tail.join("\n")
    }
}

/// Lines read so far, shared between the drain task and its handle.
#[derive(Debug, Default)]
struct Accumulated {
    text: String,
    tail: VecDeque<String>,
    lines: usize,
}

/// A running drain task.
///
/// What the task has read is kept outside the task, so it survives
/// [`DrainHandle::finish`] having to abort a drain whose pipe never closes.
#[derive(Debug)]
pub struct DrainHandle {
    task: JoinHandle<()>,
    state: Arc<Mutex<Accumulated>>,
}

impl DrainHandle {
    /// Wait for EOF, or at most `grace`, then return everything read.
    ///
    /// A drain still running after `grace` (a grandchild can hold the pipe
    /// open) is aborted; the lines it read up to then are still returned.
    pub async fn finish(mut self, grace: Option<Duration>) -> DrainedStream {
        match grace {
            None => {
                let _ = (&mut self.task).await;
            }
            Some(grace) => {
                if tokio::time::timeout(grace, &mut self.task).await.is_err() {
                    tracing::debug!(?grace, "output drain still open, aborting");
                    self.task.abort();
                }
            }
        }
        self.snapshot()
    }

    /// What has been read so far, without waiting.
    pub fn snapshot(&self) -> DrainedStream {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        DrainedStream {
            text: state.text.clone(),
            tail: state.tail.iter().cloned().collect(),
            lines: state.lines,
        }
    }
}

/// Spawn a task that reads `reader` to EOF.
///
/// Lines are decoded lossily so that a tool emitting invalid UTF-8 never
/// stops the drain. Read errors end the drain early and are logged.
pub fn spawn_drain<R>(reader: R, stream: StreamKind, mode: DrainMode) -> DrainHandle
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let state = Arc::new(Mutex::new(Accumulated::default()));
    let shared = state.clone();
    let task = tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let raw = String::from_utf8_lossy(&buf);
                    let line = raw.trim_end_matches(['\r', '\n']).to_string();
                    if let DrainMode::Forward { target } = mode {
                        forward_line(target, stream, &line);
                    }

                    let mut acc = shared.lock().unwrap_or_else(PoisonError::into_inner);
                    if let DrainMode::Capture = mode {
                        acc.text.push_str(&raw);
                    }
                    if acc.tail.len() == TAIL_LINES {
                        acc.tail.pop_front();
                    }
                    acc.tail.push_back(line);
                    acc.lines += 1;
                }
                Err(e) => {
                    tracing::warn!(%stream, error = %e, "output drain stopped on read error");
                    break;
                }
            }
        }
    });

    DrainHandle { task, state }
}

// `tracing` needs a static target per callsite, so the known targets are
// matched explicitly.
fn forward_line(target: &'static str, stream: StreamKind, line: &str) {
    match target {
        "avdrig::emulator" => tracing::debug!(target: "avdrig::emulator", %stream, "{line}"),
        "avdrig::companion" => tracing::debug!(target: "avdrig::companion", %stream, "{line}"),
        other => tracing::debug!(source = other, %stream, "{line}"),
    }
}
