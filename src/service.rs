//! End-to-end grading pipeline.
//!
//! `code + task id -> analyzer -> sandbox -> test harness -> progress`.
//! Every stage can stop the pipeline; whichever one does decides which
//! response field carries the cause. The service itself never fails.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, info_span, warn};

use crate::analyzer::SafetyAnalyzer;
use crate::catalog::TaskCatalog;
use crate::error::{FaultKind, GradeError};
use crate::executor::SandboxEngine;
use crate::harness::{TestHarness, TestLocator, TestRunResult};
use crate::progress::{record_completion_if_passed, ProgressStore, UserId};

/// Task id as a web layer may send it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskRef {
    /// `"task_id": 3`
    Number(u64),
    /// `"task_id": "3"`
    Text(String),
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Inbound grading request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRequest {
    /// Submitted source
    #[serde(default)]
    pub code: Option<String>,
    /// Task to grade against
    #[serde(default)]
    pub task_id: Option<TaskRef>,
}

impl SubmissionRequest {
    /// Request for `code` against task `task_id`
    #[must_use]
    pub fn new(code: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            task_id: Some(TaskRef::Text(task_id.into())),
        }
    }
}

/// Test counts and diagnostics as reported to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResults {
    /// Tests executed
    pub runs: usize,
    /// Every executed test passed
    pub success: bool,
    /// `[name, detail]` per erroring test
    pub errors: Vec<(String, String)>,
    /// `[name, detail]` per failing test
    pub failures: Vec<(String, String)>,
}

impl From<TestRunResult> for TestResults {
    fn from(result: TestRunResult) -> Self {
        Self {
            runs: result.total_run,
            success: result.all_passed,
            errors: result.errors,
            failures: result.failures,
        }
    }
}

/// Grading response; always well formed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradingResponse {
    /// Submission output followed by test output
    pub stdout: String,
    /// Filtered diagnostics
    pub stderr: String,
    /// Why the submission was not graded
    pub error: Option<String>,
    /// Why grading could not be completed for reasons outside the submission
    pub execution_error: Option<String>,
    /// `None` when the tests were never reached
    pub test_results: Option<TestResults>,
    /// Category of the fault that stopped the pipeline
    pub fault: Option<FaultKind>,
}

impl GradingResponse {
    fn from_error(err: &GradeError) -> Self {
        let mut response = Self::default();
        response.set_fault(err);
        response
    }

    fn set_fault(&mut self, err: &GradeError) {
        let kind = err.kind();
        let message = err.to_string();
        if kind.is_operator_fault() {
            self.execution_error = Some(message);
        } else {
            self.error = Some(message);
        }
        self.fault = Some(kind);
    }

    fn append_stdout(&mut self, text: &str) {
        self.stdout.push_str(text);
    }

    fn append_stderr(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if !self.stderr.is_empty() && !self.stderr.ends_with('\n') {
            self.stderr.push('\n');
        }
        self.stderr.push_str(text);
    }

    /// Whether the submission passed every test
    #[must_use]
    pub fn passed(&self) -> bool {
        self.test_results.as_ref().is_some_and(|t| t.success && t.runs > 0)
    }
}

/// Short digest of submitted code for log correlation
#[must_use]
pub fn submission_digest(code: &str) -> String {
    let digest = Sha256::digest(code.as_bytes());
    hex::encode(&digest[..6])
}

/// Grades submissions against catalog tasks
pub struct GradingService {
    analyzer: SafetyAnalyzer,
    engine: Arc<SandboxEngine>,
    harness: TestHarness,
    catalog: Arc<dyn TaskCatalog>,
    progress: Arc<dyn ProgressStore>,
}

impl fmt::Debug for GradingService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GradingService")
            .field("engine", &self.engine)
            .field("catalog", &self.catalog.install_dir())
            .finish_non_exhaustive()
    }
}

impl GradingService {
    /// Wire the pipeline. Test units are looked up under `tests_root` first,
    /// then under the catalog's install directory.
    #[must_use]
    pub fn new(
        engine: Arc<SandboxEngine>,
        catalog: Arc<dyn TaskCatalog>,
        progress: Arc<dyn ProgressStore>,
        tests_root: Option<PathBuf>,
    ) -> Self {
        let locator = TestLocator::new(tests_root, catalog.install_dir().to_path_buf());
        Self {
            analyzer: SafetyAnalyzer::new(Arc::clone(engine.policy())),
            harness: TestHarness::new(Arc::clone(&engine), locator),
            engine,
            catalog,
            progress,
        }
    }

    /// The sandbox engine
    #[must_use]
    pub const fn engine(&self) -> &Arc<SandboxEngine> {
        &self.engine
    }

    /// Grade `request` for `user`
    #[must_use]
    pub fn grade(&self, user: &UserId, request: &SubmissionRequest) -> GradingResponse {
        let Some(code) = request.code.as_deref().filter(|c| !c.trim().is_empty()) else {
            return GradingResponse::from_error(&GradeError::InvalidRequest("No code provided.".to_string()));
        };
        let Some(task_ref) = &request.task_id else {
            return GradingResponse::from_error(&GradeError::InvalidRequest(
                "No task_id provided.".to_string(),
            ));
        };

        let span = info_span!("grade", %user, task = %task_ref, digest = %submission_digest(code));
        let _enter = span.enter();

        let task = match self.catalog.lookup(&task_ref.to_string()) {
            Ok(task) => task,
            Err(err) => {
                info!(%err, "task lookup failed");
                return GradingResponse::from_error(&GradeError::from(err));
            }
        };
        let reference = match task.test_reference() {
            Ok(reference) => reference.to_path_buf(),
            Err(err) => return GradingResponse::from_error(&GradeError::from(err)),
        };

        if let Some(err) = self.analyzer.analyze(code).into_error() {
            info!(reason = %err, "submission rejected before execution");
            let mut response = GradingResponse::from_error(&err);
            response.stderr = err.to_string();
            return response;
        }

        let sandbox = self.engine.execute(code);
        let mut response = GradingResponse::default();
        response.append_stdout(&sandbox.captured_stdout);
        response.append_stderr(&sandbox.captured_stderr);
        if let Some(err) = sandbox.error() {
            info!(fault = ?err.kind(), "submission failed");
            response.set_fault(&err);
            return response;
        }

        let run = match self.harness.run(&sandbox, &reference) {
            Ok(run) => run,
            Err(err) => {
                let err = GradeError::from(err);
                warn!(fault = ?err.kind(), %err, "test unit did not run");
                if err.kind() == FaultKind::Harness {
                    response.test_results = Some(TestRunResult::not_run().into());
                }
                response.set_fault(&err);
                return response;
            }
        };
        response.append_stdout(&run.stdout);
        response.append_stderr(&run.stderr);

        if let Err(err) = record_completion_if_passed(self.progress.as_ref(), user, task.id, &run.result) {
            warn!(%err, "completion not recorded");
            response.set_fault(&GradeError::from(err));
        }
        info!(runs = run.result.total_run, passed = run.result.all_passed, "graded");
        response.test_results = Some(run.result.into());
        response
    }

    /// [`GradingService::grade`] on the blocking pool, for async hosts
    pub async fn grade_async(self: Arc<Self>, user: UserId, request: SubmissionRequest) -> GradingResponse {
        match tokio::task::spawn_blocking(move || self.grade(&user, &request)).await {
            Ok(response) => response,
            Err(err) => {
                let mut response = GradingResponse::default();
                response.execution_error = Some(format!("grading task failed: {err}"));
                response.fault = Some(FaultKind::Worker);
                response
            }
        }
    }
}
