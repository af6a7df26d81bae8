//! Grading bridge and progress stores.
//!
//! A passing test run marks the task completed for the acting user. Partial
//! passes earn nothing, and re-grading a completed task only refreshes its
//! timestamp.

mod sled_store;

pub use sled_store::SledProgressStore;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::catalog::TaskId;
use crate::harness::TestRunResult;

/// Authenticated acting user, as supplied by the host's auth layer
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wrap a user name
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The name
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Completion state of one task for one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// User
    pub user: UserId,
    /// Task
    pub task: TaskId,
    /// Always true once written by the bridge
    pub completed: bool,
    /// Last passing grade
    pub completed_at: DateTime<Utc>,
}

/// Progress store errors
#[derive(Debug, Error)]
pub enum ProgressError {
    /// Storage backend error
    #[error("progress storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Stored record could not be encoded or decoded
    #[error("progress record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// A previous writer panicked while holding the store
    #[error("progress store lock poisoned")]
    Poisoned,
}

/// Upsert-by-(user, task) progress persistence
pub trait ProgressStore: Send + Sync {
    /// Mark `task` completed for `user` at `at`, replacing any earlier record.
    ///
    /// # Errors
    /// Returns error if the record cannot be written
    fn upsert_completion(
        &self,
        user: &UserId,
        task: TaskId,
        at: DateTime<Utc>,
    ) -> Result<ProgressRecord, ProgressError>;

    /// Record for `(user, task)`, if any.
    ///
    /// # Errors
    /// Returns error if the store cannot be read
    fn get(&self, user: &UserId, task: TaskId) -> Result<Option<ProgressRecord>, ProgressError>;

    /// Number of records.
    ///
    /// # Errors
    /// Returns error if the store cannot be read
    fn count(&self) -> Result<usize, ProgressError>;
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    records: Mutex<HashMap<(UserId, TaskId), ProgressRecord>>,
    upserts: AtomicUsize,
}

impl MemoryProgressStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of upserts performed, including refreshes
    #[must_use]
    pub fn upserts(&self) -> usize {
        self.upserts.load(Ordering::Relaxed)
    }
}

impl ProgressStore for MemoryProgressStore {
    fn upsert_completion(
        &self,
        user: &UserId,
        task: TaskId,
        at: DateTime<Utc>,
    ) -> Result<ProgressRecord, ProgressError> {
        let record = ProgressRecord {
            user: user.clone(),
            task,
            completed: true,
            completed_at: at,
        };
        self.records
            .lock()
            .map_err(|_| ProgressError::Poisoned)?
            .insert((user.clone(), task), record.clone());
        self.upserts.fetch_add(1, Ordering::Relaxed);
        Ok(record)
    }

    fn get(&self, user: &UserId, task: TaskId) -> Result<Option<ProgressRecord>, ProgressError> {
        Ok(self
            .records
            .lock()
            .map_err(|_| ProgressError::Poisoned)?
            .get(&(user.clone(), task))
            .cloned())
    }

    fn count(&self) -> Result<usize, ProgressError> {
        Ok(self.records.lock().map_err(|_| ProgressError::Poisoned)?.len())
    }
}

/// Record completion of `task` for `user` if and only if every test passed
/// and at least one ran. Returns the written record.
///
/// # Errors
/// Returns error if the store rejects the write
pub fn record_completion_if_passed(
    store: &dyn ProgressStore,
    user: &UserId,
    task: TaskId,
    result: &TestRunResult,
) -> Result<Option<ProgressRecord>, ProgressError> {
    if !result.all_passed || result.total_run == 0 {
        debug!(%user, %task, runs = result.total_run, "not recording progress");
        return Ok(None);
    }
    let record = store.upsert_completion(user, task, Utc::now())?;
    info!(%user, %task, at = %record.completed_at, "task completed");
    Ok(Some(record))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(total_run: usize, all_passed: bool) -> TestRunResult {
        TestRunResult {
            total_run,
            all_passed,
            failures: Vec::new(),
            errors: Vec::new(),
        }
    }

    #[test]
    fn test_pass_records_once() {
        let store = MemoryProgressStore::new();
        let user = UserId::new("ada");
        let record = record_completion_if_passed(&store, &user, TaskId(1), &result(1, true))
            .unwrap()
            .unwrap();
        assert!(record.completed);
        assert_eq!(store.upserts(), 1);
        assert_eq!(store.get(&user, TaskId(1)).unwrap(), Some(record));
    }

    #[test]
    fn test_partial_and_empty_runs_earn_nothing() {
        let store = MemoryProgressStore::new();
        let user = UserId::new("ada");
        assert!(record_completion_if_passed(&store, &user, TaskId(1), &result(3, false))
            .unwrap()
            .is_none());
        assert!(record_completion_if_passed(&store, &user, TaskId(1), &result(0, true))
            .unwrap()
            .is_none());
        assert_eq!(store.upserts(), 0);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_regrade_refreshes_timestamp() {
        let store = MemoryProgressStore::new();
        let user = UserId::new("ada");
        let first = store
            .upsert_completion(&user, TaskId(4), DateTime::<Utc>::MIN_UTC)
            .unwrap();
        let second = record_completion_if_passed(&store, &user, TaskId(4), &result(2, true))
            .unwrap()
            .unwrap();
        assert!(second.completed_at > first.completed_at);
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.upserts(), 2);
    }

    #[test]
    fn test_users_are_separate() {
        let store = MemoryProgressStore::new();
        store.upsert_completion(&UserId::new("a"), TaskId(1), Utc::now()).unwrap();
        store.upsert_completion(&UserId::new("b"), TaskId(1), Utc::now()).unwrap();
        assert_eq!(store.count().unwrap(), 2);
        assert!(store.get(&UserId::new("c"), TaskId(1)).unwrap().is_none());
    }
}
