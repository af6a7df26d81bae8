//! Isolation capabilities and executor selection.
//!
//! The host is probed once at startup: can we launch the configured
//! interpreter, and was the embedded runtime compiled in? The answer picks
//! the isolation mode for the lifetime of the process.

use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{ExecutorError, IsolatedExecutor, IsolationMode, ProcessExecutor};
use crate::config::{GraderConfig, IsolationPreference};

/// Result of checking one isolation mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentCheck {
    /// Mode being checked
    pub mode: IsolationMode,
    /// Whether the mode can run here
    pub available: bool,
    /// Interpreter version, if known
    pub version: Option<String>,
    /// Caveats that do not prevent use
    pub warnings: Vec<String>,
    /// What to do if unavailable
    pub setup_instructions: Option<String>,
}

impl EnvironmentCheck {
    /// Detect whether process mode works with `config.python_bin`
    #[must_use]
    pub fn detect_process(config: &GraderConfig) -> Self {
        let executor = ProcessExecutor::new(&config.python_bin, config.max_output_bytes);
        let version = executor.version();
        let available = version.as_deref().is_some_and(|v| v.starts_with("Python 3"));

        let mut warnings = Vec::new();
        if !cfg!(unix) {
            warnings.push("resource limits and environment clearing are POSIX-only".to_string());
        }
        if version.is_some() && !available {
            warnings.push(format!(
                "{} is not a Python 3 interpreter",
                executor.program().display()
            ));
        }

        Self {
            mode: IsolationMode::Process,
            available,
            version,
            warnings,
            setup_instructions: (!available).then(|| {
                format!(
                    "Install Python 3.8+ or point {} at an interpreter",
                    crate::config::ENV_PYTHON
                )
            }),
        }
    }

    /// Detect whether thread mode was compiled in
    #[must_use]
    pub fn detect_thread() -> Self {
        let available = cfg!(feature = "embedded-python");
        Self {
            mode: IsolationMode::Thread,
            available,
            version: None,
            warnings: if available {
                vec!["timeouts abandon the worker thread instead of stopping it".to_string()]
            } else {
                Vec::new()
            },
            setup_instructions: (!available)
                .then(|| "Rebuild with --features embedded-python".to_string()),
        }
    }
}

/// Everything the probe found
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationCapabilities {
    /// One check per mode, strongest first
    pub checks: Vec<EnvironmentCheck>,
}

impl IsolationCapabilities {
    /// Whether `mode` can run on this host
    #[must_use]
    pub fn supports(&self, mode: IsolationMode) -> bool {
        self.checks.iter().any(|c| c.mode == mode && c.available)
    }

    /// Pick a mode for `preference`.
    ///
    /// `Auto` prefers process isolation and falls back to threads.
    ///
    /// # Errors
    /// Returns `ExecutorError::Unavailable` if the requested mode, or every
    /// mode for `Auto`, is unavailable
    pub fn select(&self, preference: IsolationPreference) -> Result<IsolationMode, ExecutorError> {
        let wanted: &[IsolationMode] = match preference {
            IsolationPreference::Auto => &[IsolationMode::Process, IsolationMode::Thread],
            IsolationPreference::Process => &[IsolationMode::Process],
            IsolationPreference::Thread => &[IsolationMode::Thread],
        };
        wanted
            .iter()
            .copied()
            .find(|mode| self.supports(*mode))
            .ok_or_else(|| {
                let hints: Vec<String> = self
                    .checks
                    .iter()
                    .filter(|c| wanted.contains(&c.mode))
                    .filter_map(|c| c.setup_instructions.clone())
                    .collect();
                ExecutorError::Unavailable(hints.join("; "))
            })
    }
}

/// Probe every isolation mode
#[must_use]
pub fn probe(config: &GraderConfig) -> IsolationCapabilities {
    IsolationCapabilities {
        checks: vec![
            EnvironmentCheck::detect_process(config),
            EnvironmentCheck::detect_thread(),
        ],
    }
}

static SELECTED: OnceLock<IsolationMode> = OnceLock::new();

/// Mode for this process: probed on first call, cached afterwards.
///
/// # Errors
/// Returns error if no acceptable mode is available on the first call
pub fn select(config: &GraderConfig) -> Result<IsolationMode, ExecutorError> {
    if let Some(mode) = SELECTED.get() {
        return Ok(*mode);
    }
    let capabilities = probe(config);
    let mode = capabilities.select(config.isolation)?;
    for check in capabilities.checks.iter().filter(|c| c.mode == mode) {
        for warning in &check.warnings {
            warn!(%mode, "{warning}");
        }
    }
    let mode = *SELECTED.get_or_init(|| mode);
    info!(%mode, "isolation mode selected");
    Ok(mode)
}

/// Build the executor for `mode`
///
/// # Errors
/// Returns `ExecutorError::Unavailable` for thread mode without the embedded runtime
pub fn executor_for(
    mode: IsolationMode,
    config: &GraderConfig,
) -> Result<Arc<dyn IsolatedExecutor>, ExecutorError> {
    match mode {
        IsolationMode::Process => Ok(Arc::new(ProcessExecutor::new(
            &config.python_bin,
            config.max_output_bytes,
        ))),
        #[cfg(feature = "embedded-python")]
        IsolationMode::Thread => Ok(Arc::new(super::ThreadExecutor::new(super::PyO3Kernel))),
        #[cfg(not(feature = "embedded-python"))]
        IsolationMode::Thread => Err(ExecutorError::Unavailable(
            "thread mode requires the embedded-python feature".to_string(),
        )),
    }
}
