//! Request and reply messages exchanged with the sandbox kernel.
//!
//! One request goes in, one reply comes out. In process mode the reply is
//! the last stdout line starting with [`REPLY_MARKER`]; in thread mode the
//! kernel returns it directly.

use serde::{Deserialize, Serialize};

use crate::sandbox::{ExecutionEnvironment, REPLY_MARKER};

/// What the worker should do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Job {
    /// Run a submission and report its exposed symbols
    Execute,
    /// Replay a submission, then run a test unit against its symbols
    Test,
}

/// OS limits the kernel applies to itself before running submitted code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ResourceLimits {
    /// `RLIMIT_AS`
    pub memory_bytes: Option<u64>,
    /// `RLIMIT_CPU`
    pub cpu_secs: Option<u64>,
    /// `RLIMIT_FSIZE`
    pub file_size_bytes: Option<u64>,
}

/// A test unit shipped to the worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestUnit {
    /// Resolved path, used as the unit's `__file__` and in tracebacks
    pub path: String,
    /// Unit source
    pub source: String,
    /// Names injected from the replayed submission; nothing else crosses over
    pub symbols: Vec<String>,
}

/// Message sent to the kernel
#[derive(Debug, Clone, Serialize)]
pub struct WorkerRequest {
    /// Job kind
    pub job: Job,
    /// Submitted source
    pub source: String,
    /// Namespace recipe
    pub environment: ExecutionEnvironment,
    /// Self-imposed limits; process mode only
    pub limits: Option<ResourceLimits>,
    /// Cooperative deadline in seconds; thread mode only
    pub deadline_secs: Option<f64>,
    /// Per-stream capture bound
    pub max_capture_chars: usize,
    /// Present for [`Job::Test`]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tests: Option<TestUnit>,
}

/// Whether the job ran to the end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    /// Job finished
    Completed,
    /// Job stopped at [`WorkerReply::stage`]
    Failed,
}

/// Where a failed job stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Submission did not compile
    Compile,
    /// A runtime guard refused an operation
    Guard,
    /// Submitted code raised
    Runtime,
    /// The cooperative deadline fired
    Timeout,
    /// Submission failed when replayed for a test job
    Replay,
    /// Test unit raised while loading
    Load,
    /// Test runner itself raised
    Run,
    /// The kernel could not understand the request
    Protocol,
}

/// Broad shape of an exposed symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    /// `def` or other callable
    Function,
    /// `class`
    Class,
    /// Imported module
    Module,
    /// Anything else
    Value,
}

/// Snapshot of one top-level binding left by a submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposedSymbol {
    /// Binding name
    pub name: String,
    /// Shape
    pub kind: SymbolKind,
    /// Python type name
    pub type_name: String,
    /// Bounded `repr()`
    pub repr: String,
    /// JSON rendering for plain data values
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

/// Test outcome as reported by the kernel's runner
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct TestReport {
    /// Tests executed
    pub runs: usize,
    /// Runner verdict
    pub success: bool,
    /// `(test name, traceback)` for assertion failures
    #[serde(default)]
    pub failures: Vec<(String, String)>,
    /// `(test name, traceback)` for uncaught exceptions
    #[serde(default)]
    pub errors: Vec<(String, String)>,
    /// Names a test asked `resolve()` for that were absent or of the wrong kind
    #[serde(default)]
    pub missing_symbols: Vec<String>,
}

/// Message returned by the kernel
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WorkerReply {
    /// Outcome
    pub status: ReplyStatus,
    /// Failure point
    #[serde(default)]
    pub stage: Option<Stage>,
    /// Exception message
    #[serde(default)]
    pub error: Option<String>,
    /// The capturing `print` buffer
    #[serde(default)]
    pub stdout: String,
    /// Whatever reached `sys.stdout` directly
    #[serde(default)]
    pub raw_stdout: String,
    /// Redirected stderr plus the filtered traceback
    #[serde(default)]
    pub stderr: String,
    /// Top-level bindings, in binding order
    #[serde(default)]
    pub symbols: Vec<ExposedSymbol>,
    /// Present for completed test jobs
    #[serde(default)]
    pub tests: Option<TestReport>,
}

/// Pull the reply out of a process-mode worker's stdout.
///
/// Returns `None` when no marker line is present. The last marker line
/// wins, so a submission cannot forge an earlier one.
pub fn extract_reply(stdout: &str) -> Option<Result<WorkerReply, serde_json::Error>> {
    stdout
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix(REPLY_MARKER))
        .map(serde_json::from_str)
}
