//! Thread-isolation mode.
//!
//! The kernel runs in-process on a detached worker thread and the caller
//! waits on a channel for at most the timeout. On timeout the caller moves
//! on and the thread is abandoned: it cannot be stopped, only outlived. A
//! runaway submission keeps its CPU until it finishes or the process exits.
//!
//! The kernel redirects `sys.stdout`/`sys.stderr` while it runs. Those are
//! process-wide, so in this mode output written by unrelated Python code on
//! other threads during a run lands in the submission's capture.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use super::protocol::WorkerRequest;
use super::{ExecutorError, IsolatedExecutor, IsolationMode, WorkerOutcome};

/// An in-process implementation of the kernel's `handle(request) -> reply`
pub trait EmbeddedKernel: Send + Sync + 'static {
    /// Run one JSON request, returning the JSON reply or a host-level failure
    ///
    /// # Errors
    /// Returns a description when the kernel itself could not run
    fn handle(&self, request: String) -> Result<String, String>;
}

/// Runs an [`EmbeddedKernel`] on detached threads
#[derive(Debug)]
pub struct ThreadExecutor<K> {
    kernel: Arc<K>,
}

impl<K: EmbeddedKernel> ThreadExecutor<K> {
    /// Wrap a kernel
    pub fn new(kernel: K) -> Self {
        Self {
            kernel: Arc::new(kernel),
        }
    }
}

impl<K: EmbeddedKernel> IsolatedExecutor for ThreadExecutor<K> {
    fn mode(&self) -> IsolationMode {
        IsolationMode::Thread
    }

    fn run(&self, request: &WorkerRequest, timeout: Duration) -> Result<WorkerOutcome, ExecutorError> {
        let payload = serde_json::to_string(request).map_err(ExecutorError::Encode)?;
        let (tx, rx) = mpsc::sync_channel(1);
        let kernel = Arc::clone(&self.kernel);

        // the handle is dropped: the thread is detached from the start
        thread::Builder::new()
            .name("gradebox-sandbox".to_string())
            .spawn(move || {
                let _ = tx.send(kernel.handle(payload));
            })?;

        match rx.recv_timeout(timeout) {
            Ok(Ok(reply)) => {
                debug!(reply_bytes = reply.len(), "sandbox thread replied");
                let reply = serde_json::from_str(&reply)
                    .map_err(|e| ExecutorError::NoReply(format!("malformed reply: {e}")))?;
                Ok(WorkerOutcome::Completed {
                    reply,
                    diagnostics: String::new(),
                })
            }
            Ok(Err(detail)) => Err(ExecutorError::NoReply(detail)),
            Err(RecvTimeoutError::Timeout) => {
                warn!(?timeout, "sandbox thread timed out, abandoning it");
                Ok(WorkerOutcome::TimedOut)
            }
            Err(RecvTimeoutError::Disconnected) => Err(ExecutorError::NoReply(
                "sandbox thread exited without a result".to_string(),
            )),
        }
    }
}
