//! Task catalog.
//!
//! Maps a task id to the test unit that grades it. The catalog is owned by
//! whoever administers tasks; the grader only reads it.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|_| CatalogError::InvalidId(s.to_string()))
    }
}

/// One gradable task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Task id
    pub id: TaskId,
    /// Display title
    #[serde(default)]
    pub title: Option<String>,
    /// Test unit, relative to a tests base directory
    #[serde(default)]
    pub test_file: Option<PathBuf>,
}

impl TaskDescriptor {
    /// The task's test reference
    ///
    /// # Errors
    /// Returns `CatalogError::NoTestFile` if the task has none
    pub fn test_reference(&self) -> Result<&Path, CatalogError> {
        self.test_file
            .as_deref()
            .ok_or(CatalogError::NoTestFile(self.id))
    }
}

/// Catalog errors
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Well-formed id with no task behind it
    #[error("Task with id {0} not found.")]
    NotFound(TaskId),

    /// The id is not a task id at all
    #[error("Invalid task_id format: {0}.")]
    InvalidId(String),

    /// The task exists but cannot be graded
    #[error("Task {0} has no associated test file.")]
    NoTestFile(TaskId),

    /// Manifest could not be read
    #[error("failed to read task catalog {}: {source}", .path.display())]
    Read {
        /// Manifest path
        path: PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// Manifest is not valid
    #[error("invalid task catalog {}: {source}", .path.display())]
    Parse {
        /// Manifest path
        path: PathBuf,
        /// Underlying JSON error
        source: serde_json::Error,
    },

    /// Two manifest entries share an id
    #[error("task {0} is listed more than once")]
    Duplicate(TaskId),
}

/// Read-only task lookup
pub trait TaskCatalog: Send + Sync {
    /// Find the task `id` names.
    ///
    /// # Errors
    /// `InvalidId` if `id` is malformed, `NotFound` if it is unknown
    fn lookup(&self, id: &str) -> Result<TaskDescriptor, CatalogError>;

    /// Directory the catalog's test references are relative to
    fn install_dir(&self) -> &Path;
}

/// In-memory catalog
#[derive(Debug, Clone, Default)]
pub struct MemoryTaskCatalog {
    tasks: BTreeMap<TaskId, TaskDescriptor>,
    install_dir: PathBuf,
}

impl MemoryTaskCatalog {
    /// Build from descriptors
    ///
    /// # Errors
    /// Returns `CatalogError::Duplicate` if two descriptors share an id
    pub fn new<I>(install_dir: PathBuf, tasks: I) -> Result<Self, CatalogError>
    where
        I: IntoIterator<Item = TaskDescriptor>,
    {
        let mut map = BTreeMap::new();
        for task in tasks {
            let id = task.id;
            if map.insert(id, task).is_some() {
                return Err(CatalogError::Duplicate(id));
            }
        }
        Ok(Self {
            tasks: map,
            install_dir,
        })
    }

    /// Number of tasks
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the catalog is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks in id order
    pub fn tasks(&self) -> impl Iterator<Item = &TaskDescriptor> {
        self.tasks.values()
    }
}

impl TaskCatalog for MemoryTaskCatalog {
    fn lookup(&self, id: &str) -> Result<TaskDescriptor, CatalogError> {
        let id: TaskId = id.parse()?;
        self.tasks.get(&id).cloned().ok_or(CatalogError::NotFound(id))
    }

    fn install_dir(&self) -> &Path {
        &self.install_dir
    }
}

#[derive(Deserialize)]
struct Manifest {
    tasks: Vec<TaskDescriptor>,
}

/// Catalog loaded from a JSON manifest; test references are relative to
/// the manifest's directory
#[derive(Debug, Clone)]
pub struct JsonTaskCatalog {
    inner: MemoryTaskCatalog,
    path: PathBuf,
}

impl JsonTaskCatalog {
    /// Load `{"tasks": [{"id", "title", "test_file"}]}` from `path`
    ///
    /// # Errors
    /// Returns error if the manifest cannot be read or parsed, or repeats an id
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CatalogError> {
        let path = path.as_ref().to_path_buf();
        let contents = fs::read_to_string(&path).map_err(|source| CatalogError::Read {
            path: path.clone(),
            source,
        })?;
        let manifest: Manifest =
            serde_json::from_str(&contents).map_err(|source| CatalogError::Parse {
                path: path.clone(),
                source,
            })?;
        let install_dir = path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let inner = MemoryTaskCatalog::new(install_dir, manifest.tasks)?;
        debug!(path = %path.display(), tasks = inner.len(), "task catalog loaded");
        Ok(Self { inner, path })
    }

    /// Manifest location
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TaskCatalog for JsonTaskCatalog {
    fn lookup(&self, id: &str) -> Result<TaskDescriptor, CatalogError> {
        self.inner.lookup(id)
    }

    fn install_dir(&self) -> &Path {
        self.inner.install_dir()
    }
}
