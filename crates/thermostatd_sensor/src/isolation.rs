//! Time-bounded, fault-isolated sensor reads.
//!
//! A protocol read busy-polls hardware and can hang waiting for an edge that
//! never comes. [`read_isolated`] runs one read in a separate execution
//! context and races it against a timeout. The boundary is narrow: the context
//! delivers at most one [`ReadOutcome`], and the caller can terminate it.
//! Nothing else crosses it.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::io::Lines;
use tokio::process::Child;
use tokio::process::ChildStdout;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::reading::ProtocolError;
use crate::reading::ReadOutcome;

#[derive(Debug, thiserror::Error)]
pub enum IsolationError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn read thread: {0}")]
    Thread(#[source] io::Error),
}

/// A running isolated read.
#[async_trait]
pub trait IsolatedTask: Send {
    /// Wait for the context's single result message. `None` if the context
    /// ended without sending one.
    async fn result(&mut self) -> Option<ReadOutcome>;

    /// Stop the context outright. Anything it sends afterwards is discarded.
    async fn terminate(&mut self);
}

/// Something that can start one protocol read in its own execution context.
pub trait Isolation: Send + Sync {
    fn spawn(&self) -> Result<Box<dyn IsolatedTask>, IsolationError>;
}

/// Run one read in a fresh context from `isolation`, giving it `timeout` to
/// produce a result. Returns [`ReadOutcome::Timeout`] exactly when no result
/// arrived in time; the context is terminated either way.
pub async fn read_isolated(isolation: &dyn Isolation, timeout: Duration) -> ReadOutcome {
    let mut task = match isolation.spawn() {
        Ok(task) => task,
        Err(e) => {
            warn!("Failed to start isolated sensor read: {}", e);
            return ReadOutcome::ProtocolError(ProtocolError::Context {
                message: e.to_string(),
            });
        }
    };

    let outcome = match tokio::time::timeout(timeout, task.result()).await {
        Ok(Some(outcome)) => outcome,
        Ok(None) => ReadOutcome::ProtocolError(ProtocolError::Context {
            message: "context exited without a result".to_string(),
        }),
        Err(_) => {
            debug!("Isolated sensor read timed out after {:?}", timeout);
            ReadOutcome::Timeout
        }
    };

    task.terminate().await;
    outcome
}

/// Runs each read as a child process whose stdout carries one JSON-encoded
/// [`ReadOutcome`] line.
#[derive(Debug, Clone)]
pub struct ProcessIsolation {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessIsolation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl Isolation for ProcessIsolation {
    fn spawn(&self) -> Result<Box<dyn IsolatedTask>, IsolationError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| IsolationError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        trace!("Spawned sensor read process {:?}", child.id());
        let lines = child.stdout.take().map(|stdout| BufReader::new(stdout).lines());
        Ok(Box::new(ProcessTask { child, lines }))
    }
}

struct ProcessTask {
    child: Child,
    lines: Option<Lines<BufReader<ChildStdout>>>,
}

#[async_trait]
impl IsolatedTask for ProcessTask {
    async fn result(&mut self) -> Option<ReadOutcome> {
        let lines = self.lines.as_mut()?;
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => {
                    warn!("Failed to read from sensor read process: {}", e);
                    return None;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            return Some(serde_json::from_str(&line).unwrap_or_else(|e| {
                ReadOutcome::ProtocolError(ProtocolError::Context {
                    message: format!("malformed result: {}", e),
                })
            }));
        }
    }

    async fn terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            trace!("Sensor read process already gone: {}", e);
        }
        match self.child.wait().await {
            Ok(status) => trace!("Sensor read process exited: {}", status),
            Err(e) => warn!("Failed to reap sensor read process: {}", e),
        }
    }
}

/// Runs each read on a dedicated OS thread.
///
/// A thread cannot be killed. The read closure gets a cancellation flag that
/// is set on termination (or when the task is dropped) and must return soon
/// after it is set, releasing whatever it holds. A result sent after that is
/// discarded.
#[derive(Clone)]
pub struct ThreadIsolation {
    read: Arc<dyn Fn(&AtomicBool) -> ReadOutcome + Send + Sync>,
}

impl ThreadIsolation {
    pub fn new<F>(read: F) -> Self
    where
        F: Fn(&AtomicBool) -> ReadOutcome + Send + Sync + 'static,
    {
        Self {
            read: Arc::new(read),
        }
    }
}

impl Isolation for ThreadIsolation {
    fn spawn(&self) -> Result<Box<dyn IsolatedTask>, IsolationError> {
        let (tx, rx) = oneshot::channel();
        let read = Arc::clone(&self.read);
        let cancel = Arc::new(AtomicBool::new(false));
        let thread_cancel = Arc::clone(&cancel);

        thread::Builder::new()
            .name("sensor-read".to_string())
            .spawn(move || {
                if tx.send(read(thread_cancel.as_ref())).is_err() {
                    debug!("Discarding sensor result that arrived after termination");
                }
            })
            .map_err(IsolationError::Thread)?;

        Ok(Box::new(ThreadTask { rx: Some(rx), cancel }))
    }
}

struct ThreadTask {
    rx: Option<oneshot::Receiver<ReadOutcome>>,
    cancel: Arc<AtomicBool>,
}

impl ThreadTask {
    fn cancel(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(mut rx) = self.rx.take() {
            rx.close();
        }
    }
}

#[async_trait]
impl IsolatedTask for ThreadTask {
    async fn result(&mut self) -> Option<ReadOutcome> {
        // A panicking read drops the sender, which reads as "no result".
        self.rx.as_mut()?.await.ok()
    }

    async fn terminate(&mut self) {
        self.cancel();
    }
}

impl Drop for ThreadTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
