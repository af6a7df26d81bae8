//! # Gradebox
//!
//! Sandboxed, timeout-bounded execution and auto-grading of untrusted Python
//! submissions.
//!
//! ## Pipeline
//!
//! A submission flows through five stages:
//! - **Analyzer**: parses the source and rejects denied imports, attributes
//!   and calls before anything runs
//! - **Sandbox**: builds the whitelisted namespace the code runs in
//! - **Executor**: runs the code in an isolated worker under a hard timeout
//! - **Harness**: runs the task's test unit against the exposed symbols
//! - **Progress**: records completion when every test passed
//!
//! ## Isolation
//!
//! - Process mode spawns a child interpreter and kills it on timeout
//! - Thread mode (feature `embedded-python`) runs an embedded interpreter on
//!   a detached thread; a timed-out thread is abandoned, not stopped

#![forbid(unsafe_code)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms
)]
#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

pub mod analyzer;
pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod harness;
pub mod progress;
pub mod sandbox;
pub mod service;

pub use analyzer::{SafetyAnalyzer, SafetyVerdict, Violation};
pub use catalog::{JsonTaskCatalog, MemoryTaskCatalog, TaskCatalog, TaskDescriptor, TaskId};
pub use config::{GraderConfig, IsolationPreference, SecurityPolicy};
pub use error::{FaultKind, GradeError};
pub use executor::{IsolatedExecutor, IsolationMode, SandboxEngine, SandboxResult};
pub use harness::{TestHarness, TestRunResult};
pub use progress::{MemoryProgressStore, ProgressRecord, ProgressStore, SledProgressStore, UserId};
pub use sandbox::{build_sandbox_environment, ExecutionEnvironment};
pub use service::{GradingResponse, GradingService, SubmissionRequest};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
