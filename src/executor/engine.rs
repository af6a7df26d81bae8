//! Isolated execution engine.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info_span};

use super::protocol::{
    ExposedSymbol, Job, ReplyStatus, ResourceLimits, Stage, TestUnit, WorkerReply, WorkerRequest,
};
use super::{ExecutorError, IsolatedExecutor, IsolationMode, WorkerOutcome};
use crate::analyzer::restricted;
use crate::config::{format_secs, ConfigError, GraderConfig, SecurityPolicy};
use crate::error::{FaultKind, GradeError};
use crate::sandbox::{build_sandbox_environment, ExecutionEnvironment, StderrFilter};

/// Lifecycle of one sandboxed execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Not started
    Idle,
    /// Worker launched, waiting for it
    Running,
    /// Ran to the end
    Completed,
    /// Stopped by a compile error, guard, exception or worker failure
    Failed,
    /// Deadline passed first
    TimedOut,
}

impl ExecutionState {
    /// Whether no further transition is possible
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }
}

/// Outcome of one sandboxed run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SandboxResult {
    /// Whether the submission ran to the end
    pub succeeded: bool,
    /// The capturing `print` buffer, or raw stdout when the buffer is empty
    pub captured_stdout: String,
    /// Filtered stderr
    pub captured_stderr: String,
    /// Top-level bindings the submission left behind
    pub exposed_symbols: BTreeMap<String, ExposedSymbol>,
    /// The underlying diagnostic when the run failed
    pub error_message: Option<String>,
    /// Failure category
    pub fault: Option<FaultKind>,
    /// Terminal state
    pub state: ExecutionState,
    #[serde(skip)]
    source: String,
}

impl SandboxResult {
    fn failed(source: &str, fault: FaultKind, message: String, stdout: String, stderr: String) -> Self {
        Self {
            succeeded: false,
            captured_stdout: stdout,
            captured_stderr: stderr,
            exposed_symbols: BTreeMap::new(),
            error_message: Some(message),
            fault: Some(fault),
            state: ExecutionState::Failed,
            source: source.to_string(),
        }
    }

    fn timed_out(source: &str, timeout: Duration) -> Self {
        let (message, stderr) = timeout_messages(timeout);
        Self {
            state: ExecutionState::TimedOut,
            ..Self::failed(source, FaultKind::Timeout, message, String::new(), stderr)
        }
    }

    /// Names of the exposed symbols
    #[must_use]
    pub fn symbol_names(&self) -> Vec<String> {
        self.exposed_symbols.keys().cloned().collect()
    }

    /// The failure as a pipeline error; `None` on success
    #[must_use]
    pub fn error(&self) -> Option<GradeError> {
        let message = self.error_message.clone()?;
        Some(match self.fault? {
            FaultKind::Compile => GradeError::Compile(message),
            FaultKind::SafetyRejection => GradeError::SafetyRejection(message),
            FaultKind::Timeout => GradeError::Timeout(message),
            FaultKind::Worker => GradeError::Worker(message),
            _ => GradeError::Runtime(message),
        })
    }

    pub(crate) fn source(&self) -> &str {
        &self.source
    }
}

/// Error message and stderr for a run that exceeded `timeout`
pub(crate) fn timeout_messages(timeout: Duration) -> (String, String) {
    let secs = format_secs(timeout);
    (
        format!("Time limit exceeded: code ran longer than {secs} seconds"),
        format!("Execution timed out after {secs} seconds"),
    )
}

fn prefer_buffer(buffer: String, raw: String) -> String {
    if buffer.is_empty() {
        raw
    } else {
        buffer
    }
}

/// Compiles, runs and reports on submissions through an [`IsolatedExecutor`]
pub struct SandboxEngine {
    executor: Arc<dyn IsolatedExecutor>,
    policy: Arc<SecurityPolicy>,
    environment: ExecutionEnvironment,
    filter: StderrFilter,
    default_timeout: Duration,
    memory_limit_bytes: Option<u64>,
    file_size_limit_bytes: Option<u64>,
    cooperative_deadline: bool,
    max_capture_chars: usize,
    launches: AtomicUsize,
}

impl std::fmt::Debug for SandboxEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxEngine")
            .field("mode", &self.executor.mode())
            .field("default_timeout", &self.default_timeout)
            .field("launches", &self.launches())
            .finish_non_exhaustive()
    }
}

impl SandboxEngine {
    /// Create an engine.
    ///
    /// # Errors
    /// Returns error if the stderr filters do not compile
    pub fn new(
        config: &GraderConfig,
        policy: Arc<SecurityPolicy>,
        executor: Arc<dyn IsolatedExecutor>,
    ) -> Result<Self, ConfigError> {
        let environment = build_sandbox_environment(&policy, &config.print_end, BTreeMap::new())?;
        Ok(Self {
            executor,
            policy,
            environment,
            filter: StderrFilter::from_config(config)?,
            default_timeout: config.timeout(),
            memory_limit_bytes: config.memory_limit_bytes,
            file_size_limit_bytes: config.file_size_limit_bytes,
            cooperative_deadline: config.cooperative_deadline,
            max_capture_chars: config.max_capture_chars,
            launches: AtomicUsize::new(0),
        })
    }

    /// Isolation mode of the underlying executor
    #[must_use]
    pub fn mode(&self) -> IsolationMode {
        self.executor.mode()
    }

    /// Shared security policy
    #[must_use]
    pub const fn policy(&self) -> &Arc<SecurityPolicy> {
        &self.policy
    }

    /// Configured timeout
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Workers launched so far
    #[must_use]
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::Relaxed)
    }

    pub(crate) const fn stderr_filter(&self) -> &StderrFilter {
        &self.filter
    }

    /// Run `source` with the configured timeout
    #[must_use]
    pub fn execute(&self, source: &str) -> SandboxResult {
        self.execute_with_timeout(source, self.default_timeout)
    }

    /// Compile `source` under sandbox rules and run it in an isolated worker.
    ///
    /// A restricted-compile rejection fails without launching a worker.
    #[must_use]
    pub fn execute_with_timeout(&self, source: &str, timeout: Duration) -> SandboxResult {
        let span = info_span!("execute", mode = %self.mode(), timeout = %format_secs(timeout));
        let _enter = span.enter();

        let mut state = ExecutionState::Idle;
        if let Err(err) = restricted::check_source(source, &self.policy) {
            debug!(reason = %err, "restricted compile rejected submission");
            let message = err.to_string();
            return SandboxResult::failed(
                source,
                FaultKind::Compile,
                message.clone(),
                String::new(),
                message,
            );
        }

        debug!(from = ?state, to = ?ExecutionState::Running, "state change");
        state = ExecutionState::Running;
        let request = self.request(Job::Execute, source, timeout, None);
        let result = match self.launch(&request, timeout) {
            Ok(WorkerOutcome::Completed { reply, diagnostics }) => {
                self.interpret(source, reply, &diagnostics, timeout)
            }
            Ok(WorkerOutcome::TimedOut) => SandboxResult::timed_out(source, timeout),
            Err(err) => {
                let message = err.to_string();
                SandboxResult::failed(source, FaultKind::Worker, message.clone(), String::new(), message)
            }
        };
        debug!(from = ?state, to = ?result.state, "state change");
        result
    }

    /// Replay `result`'s submission in a fresh worker and run `unit` against it
    pub(crate) fn run_tests(
        &self,
        result: &SandboxResult,
        unit: TestUnit,
        timeout: Duration,
    ) -> Result<WorkerOutcome, ExecutorError> {
        let request = self.request(Job::Test, result.source(), timeout, Some(unit));
        self.launch(&request, timeout)
    }

    fn launch(&self, request: &WorkerRequest, timeout: Duration) -> Result<WorkerOutcome, ExecutorError> {
        self.launches.fetch_add(1, Ordering::Relaxed);
        self.executor.run(request, timeout)
    }

    fn request(&self, job: Job, source: &str, timeout: Duration, tests: Option<TestUnit>) -> WorkerRequest {
        let mode = self.mode();
        let limits = (mode == IsolationMode::Process).then(|| ResourceLimits {
            memory_bytes: self.memory_limit_bytes,
            // the kill comes first; this only stops a worker that outlives its parent
            cpu_secs: Some(timeout.as_secs() + 2),
            file_size_bytes: self.file_size_limit_bytes,
        });
        let deadline_secs = (mode == IsolationMode::Thread && self.cooperative_deadline)
            .then(|| timeout.as_secs_f64());
        WorkerRequest {
            job,
            source: source.to_string(),
            environment: self.environment.clone(),
            limits,
            deadline_secs,
            max_capture_chars: self.max_capture_chars,
            tests,
        }
    }

    fn interpret(&self, source: &str, reply: WorkerReply, diagnostics: &str, timeout: Duration) -> SandboxResult {
        let mut stderr = self.filter.apply(&reply.stderr);
        let diagnostics = self.filter.apply(diagnostics);
        if !diagnostics.is_empty() {
            if !stderr.is_empty() {
                stderr.push('\n');
            }
            stderr.push_str(&diagnostics);
        }
        let stdout = prefer_buffer(reply.stdout, reply.raw_stdout);

        if reply.status == ReplyStatus::Completed {
            return SandboxResult {
                succeeded: true,
                captured_stdout: stdout,
                captured_stderr: stderr,
                exposed_symbols: reply
                    .symbols
                    .into_iter()
                    .map(|symbol| (symbol.name.clone(), symbol))
                    .collect(),
                error_message: None,
                fault: None,
                state: ExecutionState::Completed,
                source: source.to_string(),
            };
        }

        let message = reply.error.unwrap_or_default();
        let fault = match reply.stage {
            Some(Stage::Timeout) => return SandboxResult::timed_out(source, timeout),
            Some(Stage::Compile) => FaultKind::Compile,
            Some(Stage::Guard) => FaultKind::SafetyRejection,
            Some(Stage::Runtime) => FaultKind::Runtime,
            _ => FaultKind::Worker,
        };
        SandboxResult::failed(source, fault, message, stdout, stderr)
    }
}
