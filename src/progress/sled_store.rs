//! Persistent progress store.

use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::{ProgressError, ProgressRecord, ProgressStore, UserId};
use crate::catalog::TaskId;

/// Progress records in a `sled` tree, one JSON value per `(user, task)`
#[derive(Debug, Clone)]
pub struct SledProgressStore {
    db: sled::Db,
}

impl SledProgressStore {
    /// Open or create the store at `path`
    ///
    /// # Errors
    /// Returns error if the database cannot be opened
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ProgressError> {
        let db = sled::open(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "progress store opened");
        Ok(Self { db })
    }

    /// Store discarded on drop
    ///
    /// # Errors
    /// Returns error if the database cannot be created
    pub fn temporary() -> Result<Self, ProgressError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    fn key(user: &UserId, task: TaskId) -> Vec<u8> {
        let mut key = user.as_str().as_bytes().to_vec();
        key.push(0);
        key.extend_from_slice(&task.0.to_be_bytes());
        key
    }
}

impl ProgressStore for SledProgressStore {
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
        self.db
            .insert(Self::key(user, task), serde_json::to_vec(&record)?)?;
        self.db.flush()?;
        Ok(record)
    }

    fn get(&self, user: &UserId, task: TaskId) -> Result<Option<ProgressRecord>, ProgressError> {
        self.db
            .get(Self::key(user, task))?
            .map(|bytes| serde_json::from_slice(&bytes))
            .transpose()
            .map_err(ProgressError::from)
    }

    fn count(&self) -> Result<usize, ProgressError> {
        Ok(self.db.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_replaces() {
        let store = SledProgressStore::temporary().unwrap();
        let user = UserId::new("grace");
        let later = Utc::now();
        store
            .upsert_completion(&user, TaskId(7), later - chrono::Duration::minutes(5))
            .unwrap();
        store.upsert_completion(&user, TaskId(7), later).unwrap();

        assert_eq!(store.count().unwrap(), 1);
        let record = store.get(&user, TaskId(7)).unwrap().unwrap();
        assert_eq!(record.completed_at, later);
        assert!(record.completed);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let user = UserId::new("grace");
        {
            let store = SledProgressStore::open(dir.path()).unwrap();
            store.upsert_completion(&user, TaskId(1), Utc::now()).unwrap();
        }
        let store = SledProgressStore::open(dir.path()).unwrap();
        assert!(store.get(&user, TaskId(1)).unwrap().is_some());
        assert!(store.get(&user, TaskId(2)).unwrap().is_none());
    }

    #[test]
    fn test_user_prefix_does_not_collide() {
        let store = SledProgressStore::temporary().unwrap();
        store.upsert_completion(&UserId::new("ab"), TaskId(1), Utc::now()).unwrap();
        assert!(store.get(&UserId::new("a"), TaskId(1)).unwrap().is_none());
    }
}
