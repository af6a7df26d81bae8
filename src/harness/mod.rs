//! Test harness loader.
//!
//! Runs a task's test unit against the symbols a successful submission
//! exposed. The unit is resolved on disk here, then shipped to an isolated
//! worker together with the submission: the worker replays the submission
//! in a fresh sandbox, copies exactly the exposed names into a new
//! `task_test_module` namespace, binds `resolve(name, kind)`, executes the
//! unit and runs every `TestCase` it defines in declaration order. Test
//! code calls untrusted functions, so it gets the same timeout and the same
//! isolation as the submission itself.

pub mod resolve;

pub use resolve::{ResolutionError, TestLocator};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::error::FaultKind;
use crate::executor::timeout_messages;
use crate::executor::protocol::{ReplyStatus, Stage, TestUnit};
use crate::executor::{ExecutorError, SandboxEngine, SandboxResult, WorkerOutcome};

/// Aggregate test outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestRunResult {
    /// Tests executed
    pub total_run: usize,
    /// Every executed test passed
    pub all_passed: bool,
    /// `(test name, diagnostic)` for assertion failures, in run order
    pub failures: Vec<(String, String)>,
    /// `(test name, diagnostic)` for exceptions raised by test code, in run order
    pub errors: Vec<(String, String)>,
}

impl TestRunResult {
    /// Result reported when the unit could not be run at all
    #[must_use]
    pub const fn not_run() -> Self {
        Self {
            total_run: 0,
            all_passed: false,
            failures: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// A test run plus what the unit printed, captured apart from the submission's output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRun {
    /// Counts and diagnostics
    pub result: TestRunResult,
    /// Test-scope stdout
    pub stdout: String,
    /// Test-scope stderr, filtered
    pub stderr: String,
}

/// Test harness errors
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The test reference does not name a usable file
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// The resolved file could not be read
    #[error("failed to read test file {}: {source}", .path.display())]
    Read {
        /// Resolved path
        path: PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// The unit raised while executing its top-level code
    #[error("{0}")]
    Load(String),

    /// The test runner raised outside any test
    #[error("{0}")]
    Run(String),

    /// The submission failed when replayed in the test worker
    #[error("submission failed when replayed for testing: {0}")]
    Replay(String),

    /// A test asked for a symbol the submission does not define
    #[error("submission does not define required symbol(s): {}", .0.join(", "))]
    MissingSymbol(Vec<String>),

    /// Tests were requested for a failed submission
    #[error("tests require a successful submission")]
    NotRunnable,

    /// The test run exceeded the timeout
    #[error("{0}")]
    Timeout(String),

    /// The worker could not run the job
    #[error(transparent)]
    Worker(#[from] ExecutorError),
}

impl HarnessError {
    /// Fault category for the response
    #[must_use]
    pub const fn kind(&self) -> FaultKind {
        match self {
            Self::Resolution(_) => FaultKind::Resolution,
            Self::Timeout(_) => FaultKind::Timeout,
            Self::Worker(_) => FaultKind::Worker,
            _ => FaultKind::Harness,
        }
    }
}

/// Loads and runs task test units
#[derive(Debug, Clone)]
pub struct TestHarness {
    engine: Arc<SandboxEngine>,
    locator: TestLocator,
}

impl TestHarness {
    /// Create a harness over a shared engine
    #[must_use]
    pub const fn new(engine: Arc<SandboxEngine>, locator: TestLocator) -> Self {
        Self { engine, locator }
    }

    /// Where test references are looked up
    #[must_use]
    pub const fn locator(&self) -> &TestLocator {
        &self.locator
    }

    /// Run the unit `reference` names against `sandbox`'s exposed symbols
    ///
    /// # Errors
    /// See [`TestHarness::run`]
    pub fn run_task_tests(
        &self,
        sandbox: &SandboxResult,
        reference: &Path,
    ) -> Result<TestRunResult, HarnessError> {
        self.run(sandbox, reference).map(|run| run.result)
    }

    /// Like [`TestHarness::run_task_tests`], also returning the test-scope output.
    ///
    /// # Errors
    /// Returns error if the unit cannot be resolved, read, loaded or run, if
    /// a test asks for a missing symbol, or if the run times out
    pub fn run(&self, sandbox: &SandboxResult, reference: &Path) -> Result<TestRun, HarnessError> {
        if !sandbox.succeeded {
            return Err(HarnessError::NotRunnable);
        }
        let path = self.locator.resolve(reference)?;
        let source = fs::read_to_string(&path).map_err(|source| HarnessError::Read {
            path: path.clone(),
            source,
        })?;
        let unit = TestUnit {
            path: path.display().to_string(),
            source,
            symbols: sandbox.symbol_names(),
        };
        debug!(path = %path.display(), symbols = unit.symbols.len(), "running test unit");

        let timeout = self.engine.default_timeout();
        let reply = match self.engine.run_tests(sandbox, unit, timeout)? {
            WorkerOutcome::Completed { reply, .. } => reply,
            WorkerOutcome::TimedOut => return Err(HarnessError::Timeout(timeout_messages(timeout).0)),
        };

        let filter = self.engine.stderr_filter();
        if reply.status == ReplyStatus::Failed {
            let message = reply.error.unwrap_or_default();
            return Err(match reply.stage {
                Some(Stage::Load) => HarnessError::Load(message),
                Some(Stage::Run) => HarnessError::Run(message),
                Some(Stage::Replay) => HarnessError::Replay(message),
                Some(Stage::Timeout) => HarnessError::Timeout(timeout_messages(timeout).0),
                _ => HarnessError::Worker(ExecutorError::NoReply(message)),
            });
        }

        let report = reply
            .tests
            .ok_or_else(|| ExecutorError::NoReply("worker reply has no test report".to_string()))?;
        if !report.missing_symbols.is_empty() {
            return Err(HarnessError::MissingSymbol(report.missing_symbols));
        }

        info!(
            runs = report.runs,
            failures = report.failures.len(),
            errors = report.errors.len(),
            "test unit finished"
        );
        Ok(TestRun {
            result: TestRunResult {
                total_run: report.runs,
                all_passed: report.success,
                failures: report.failures,
                errors: report.errors,
            },
            stdout: reply.stdout,
            stderr: filter.apply(&reply.stderr),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GraderConfig;
    use crate::executor::testing::{reply, ScriptedExecutor};
    use crate::executor::{IsolatedExecutor, ProcessExecutor};
    use std::fs;
    use std::time::Duration;

    const SUBMISSION_OK: &str = r#"{"status":"completed","symbols":[
        {"name":"say_hello","kind":"function","type_name":"function","repr":"<function say_hello>"}]}"#;

    struct Fixture {
        _dir: tempfile::TempDir,
        executor: Arc<ScriptedExecutor>,
        harness: TestHarness,
        engine: Arc<SandboxEngine>,
    }

    fn fixture(replies: Vec<Result<WorkerOutcome, ExecutorError>>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("test_hello.py"), "import unittest\n").unwrap();
        let executor = Arc::new(ScriptedExecutor::new(replies));
        let config = GraderConfig::default();
        let engine = Arc::new(
            SandboxEngine::new(&config, Arc::new(config.policy.clone()), executor.clone()).unwrap(),
        );
        let harness = TestHarness::new(
            Arc::clone(&engine),
            TestLocator::new(None, dir.path().to_path_buf()),
        );
        Fixture {
            _dir: dir,
            executor,
            harness,
            engine,
        }
    }

    #[test]
    fn test_report_becomes_result() {
        let fx = fixture(vec![
            reply(SUBMISSION_OK),
            reply(
                r#"{"status":"completed","stdout":"from test\n","tests":{"runs":2,"success":false,
                    "failures":[["test_b (task_test_module.T.test_b)","AssertionError: 'x' != 'y'"]],
                    "errors":[],"missing_symbols":[]}}"#,
            ),
        ]);
        let sandbox = fx.engine.execute("def say_hello():\n    return 'x'\n");
        let run = fx.harness.run(&sandbox, Path::new("test_hello.py")).unwrap();

        assert_eq!(run.result.total_run, 2);
        assert!(!run.result.all_passed);
        assert_eq!(run.result.failures.len(), 1);
        assert!(run.result.errors.is_empty());
        assert_eq!(run.stdout, "from test\n");

        let request = fx.executor.last_request();
        let unit = request.tests.unwrap();
        assert_eq!(unit.symbols, vec!["say_hello".to_string()]);
        assert_eq!(unit.source, "import unittest\n");
        assert_eq!(request.source, "def say_hello():\n    return 'x'\n");
    }

    #[test]
    fn test_failed_submission_is_not_tested() {
        let fx = fixture(vec![reply(r#"{"status":"failed","stage":"runtime","error":"boom"}"#)]);
        let sandbox = fx.engine.execute("raise ValueError('boom')");
        assert!(matches!(
            fx.harness.run_task_tests(&sandbox, Path::new("test_hello.py")),
            Err(HarnessError::NotRunnable)
        ));
        assert_eq!(fx.executor.runs(), 1);
    }

    #[test]
    fn test_unresolvable_reference() {
        let fx = fixture(vec![reply(SUBMISSION_OK)]);
        let sandbox = fx.engine.execute("x = 1");
        let err = fx
            .harness
            .run_task_tests(&sandbox, Path::new("nope/test_missing.py"))
            .unwrap_err();
        assert_eq!(err.kind(), FaultKind::Resolution);
        assert_eq!(
            err.to_string(),
            "Test file not found at derived paths for: nope/test_missing.py"
        );
        assert_eq!(fx.executor.runs(), 1);
    }

    #[test]
    fn test_load_failure_is_harness_fault() {
        let fx = fixture(vec![
            reply(SUBMISSION_OK),
            reply(r#"{"status":"failed","stage":"load","error":"name 'unittest' is not defined"}"#),
        ]);
        let sandbox = fx.engine.execute("x = 1");
        let err = fx
            .harness
            .run_task_tests(&sandbox, Path::new("test_hello.py"))
            .unwrap_err();
        assert_eq!(err.kind(), FaultKind::Harness);
        assert_eq!(err.to_string(), "name 'unittest' is not defined");
    }

    #[test]
    fn test_missing_symbol_is_dedicated_fault() {
        let fx = fixture(vec![
            reply(SUBMISSION_OK),
            reply(
                r#"{"status":"completed","tests":{"runs":1,"success":false,"failures":[],
                    "errors":[["test_a (task_test_module.T.test_a)","SymbolMissing"]],
                    "missing_symbols":["add_two_numbers"]}}"#,
            ),
        ]);
        let sandbox = fx.engine.execute("x = 1");
        let err = fx
            .harness
            .run_task_tests(&sandbox, Path::new("test_hello.py"))
            .unwrap_err();
        assert!(matches!(&err, HarnessError::MissingSymbol(names) if names == &["add_two_numbers".to_string()]));
        assert_eq!(err.kind(), FaultKind::Harness);
    }

    #[test]
    fn test_test_timeout() {
        let fx = fixture(vec![reply(SUBMISSION_OK), Ok(WorkerOutcome::TimedOut)]);
        let sandbox = fx.engine.execute("x = 1");
        let err = fx
            .harness
            .run_task_tests(&sandbox, Path::new("test_hello.py"))
            .unwrap_err();
        assert_eq!(err.kind(), FaultKind::Timeout);
        assert!(err.to_string().starts_with("Time limit exceeded"));
    }

    fn python_harness(dir: &Path) -> Option<(Arc<SandboxEngine>, TestHarness)> {
        let config = GraderConfig::default();
        let executor = ProcessExecutor::new(&config.python_bin, config.max_output_bytes);
        if !executor.is_available() {
            eprintln!("Skipping test: Python not available");
            return None;
        }
        let executor: Arc<dyn IsolatedExecutor> = Arc::new(executor);
        let engine = Arc::new(SandboxEngine::new(&config, Arc::new(config.policy.clone()), executor).unwrap());
        let harness = TestHarness::new(Arc::clone(&engine), TestLocator::new(None, dir.to_path_buf()));
        Some((engine, harness))
    }

    #[test]
    fn test_python_unit_sees_exposed_symbols() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("test_f.py"),
            "import unittest\n\nclass T(unittest.TestCase):\n    def test_f(self):\n        self.assertEqual(f(), 42)\n\n    def test_resolve(self):\n        self.assertEqual(resolve('f')(), 42)\n",
        )
        .unwrap();
        let Some((engine, harness)) = python_harness(dir.path()) else { return };

        let sandbox = engine.execute_with_timeout("def f():\n    return 42\n", Duration::from_secs(10));
        let result = harness.run_task_tests(&sandbox, Path::new("test_f.py")).unwrap();
        assert_eq!(result.total_run, 2);
        assert!(result.all_passed, "{result:?}");
    }

    #[test]
    fn test_python_failures_and_errors_are_separate() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("test_mixed.py"),
            "import unittest\n\nclass T(unittest.TestCase):\n    def test_fails(self):\n        self.assertEqual(f(), 1)\n\n    def test_errors(self):\n        raise KeyError('k')\n\n    def test_passes(self):\n        self.assertTrue(callable(f))\n",
        )
        .unwrap();
        let Some((engine, harness)) = python_harness(dir.path()) else { return };

        let sandbox = engine.execute("def f():\n    return 42\n");
        let result = harness.run_task_tests(&sandbox, Path::new("test_mixed.py")).unwrap();
        assert_eq!(result.total_run, 3);
        assert!(!result.all_passed);
        assert_eq!(result.failures.len(), 1);
        assert!(result.failures[0].0.starts_with("test_fails"));
        assert!(result.failures[0].1.contains("AssertionError"));
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].0.starts_with("test_errors"));
    }

    #[test]
    fn test_python_broken_unit() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("test_broken.py"), "raise RuntimeError('unit is broken')\n").unwrap();
        let Some((engine, harness)) = python_harness(dir.path()) else { return };

        let sandbox = engine.execute("x = 1\n");
        let err = harness.run_task_tests(&sandbox, Path::new("test_broken.py")).unwrap_err();
        assert!(matches!(err, HarnessError::Load(ref m) if m == "unit is broken"));
    }
}
