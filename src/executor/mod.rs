//! Isolated execution of sandboxed jobs.
//!
//! A job (run a submission, or run a test unit against a replayed
//! submission) is handed to an [`IsolatedExecutor`], which runs the sandbox
//! kernel somewhere the caller can walk away from:
//!
//! * [`ProcessExecutor`] spawns a child interpreter and kills it when the
//!   deadline passes. Termination is forcible and reliable.
//! * [`ThreadExecutor`] runs an embedded kernel on a detached thread and
//!   stops waiting when the deadline passes. The thread is abandoned, not
//!   stopped; it keeps running until it finishes or the process exits.
//!
//! The mode is chosen once per process by [`capabilities::select`].
//! [`SandboxEngine`] sits on top and turns worker replies into
//! [`SandboxResult`]s.

pub mod capabilities;
#[cfg(feature = "embedded-python")]
mod embedded;
mod engine;
pub mod process;
pub mod protocol;
pub mod thread;

pub use capabilities::{EnvironmentCheck, IsolationCapabilities};
#[cfg(feature = "embedded-python")]
pub use embedded::PyO3Kernel;
pub use engine::{ExecutionState, SandboxEngine, SandboxResult};
pub(crate) use engine::timeout_messages;
pub use process::ProcessExecutor;
pub use protocol::{ExposedSymbol, SymbolKind, TestReport, WorkerReply, WorkerRequest};
pub use thread::{EmbeddedKernel, ThreadExecutor};

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Worker infrastructure errors
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The interpreter could not be started
    #[error("failed to launch worker {program}: {source}")]
    Spawn {
        /// Interpreter path
        program: PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// IO on the worker's pipes or scratch directory failed
    #[error("worker io error: {0}")]
    Io(#[from] std::io::Error),

    /// The request could not be encoded
    #[error("failed to encode worker request: {0}")]
    Encode(#[source] serde_json::Error),

    /// The worker exited without a usable reply
    #[error("no result from worker: {0}")]
    NoReply(String),

    /// The configured isolation mode cannot run on this host
    #[error("isolation mode unavailable: {0}")]
    Unavailable(String),
}

/// How a worker is isolated from the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// Separate OS process, killed on timeout
    Process,
    /// Detached thread in this process, abandoned on timeout
    Thread,
}

impl IsolationMode {
    /// Whether a timeout stops the worker for certain
    #[must_use]
    pub const fn terminates_on_timeout(self) -> bool {
        matches!(self, Self::Process)
    }
}

impl fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process => write!(f, "process"),
            Self::Thread => write!(f, "thread"),
        }
    }
}

/// What came back from one bounded run
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    /// The kernel replied before the deadline
    Completed {
        /// Parsed reply
        reply: WorkerReply,
        /// Interpreter-level stderr outside the kernel's capture (process mode)
        diagnostics: String,
    },
    /// The deadline passed first; nothing the worker produced is trusted
    TimedOut,
}

/// Runs one kernel request under a wall-clock bound
pub trait IsolatedExecutor: Send + Sync {
    /// Isolation mode this executor provides
    fn mode(&self) -> IsolationMode;

    /// Run `request`, waiting at most `timeout`.
    ///
    /// # Errors
    /// Returns error when the worker cannot be started or replies with
    /// nothing usable. A timeout is not an error.
    fn run(&self, request: &WorkerRequest, timeout: Duration) -> Result<WorkerOutcome, ExecutorError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted executors for exercising the engine without an interpreter.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub(crate) struct ScriptedExecutor {
        replies: Mutex<VecDeque<Result<WorkerOutcome, ExecutorError>>>,
        requests: Mutex<Vec<WorkerRequest>>,
        pub(crate) runs: AtomicUsize,
    }

    impl ScriptedExecutor {
        pub(crate) fn new(replies: Vec<Result<WorkerOutcome, ExecutorError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
                runs: AtomicUsize::new(0),
            }
        }

        pub(crate) fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }

        pub(crate) fn last_request(&self) -> WorkerRequest {
            self.requests.lock().unwrap().last().cloned().unwrap()
        }
    }

    impl IsolatedExecutor for ScriptedExecutor {
        fn mode(&self) -> IsolationMode {
            IsolationMode::Process
        }

        fn run(&self, request: &WorkerRequest, _timeout: Duration) -> Result<WorkerOutcome, ExecutorError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ExecutorError::NoReply("script exhausted".to_string())))
        }
    }

    pub(crate) fn reply(json: &str) -> Result<WorkerOutcome, ExecutorError> {
        Ok(WorkerOutcome::Completed {
            reply: serde_json::from_str(json).unwrap(),
            diagnostics: String::new(),
        })
    }
}
