//! Test-unit resolution.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// A task's test reference could not be turned into a file
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// No base contains the reference
    #[error("Test file not found at derived paths for: {}", .0.display())]
    NotFound(PathBuf),

    /// The reference exists but escapes the base it was resolved against
    #[error("Test file {} resolves outside {}", .path.display(), .base.display())]
    OutsideBase {
        /// Resolved file
        path: PathBuf,
        /// Base it should have stayed in
        base: PathBuf,
    },
}

/// Resolves test references against an ordered list of base directories
#[derive(Debug, Clone)]
pub struct TestLocator {
    bases: Vec<PathBuf>,
}

impl TestLocator {
    /// `primary` (the configured tests root) is tried before `fallback`
    /// (the catalog's install directory)
    #[must_use]
    pub fn new(primary: Option<PathBuf>, fallback: PathBuf) -> Self {
        let mut bases: Vec<PathBuf> = primary.into_iter().collect();
        if !bases.contains(&fallback) {
            bases.push(fallback);
        }
        Self { bases }
    }

    /// Bases in resolution order
    #[must_use]
    pub fn bases(&self) -> &[PathBuf] {
        &self.bases
    }

    /// Find the file `reference` names.
    ///
    /// # Errors
    /// `OutsideBase` if the only match escapes its base (`..`, symlinks,
    /// absolute paths elsewhere); `NotFound` otherwise
    pub fn resolve(&self, reference: &Path) -> Result<PathBuf, ResolutionError> {
        let mut escaped = None;
        for base in &self.bases {
            let Ok(base) = base.canonicalize() else {
                continue;
            };
            let Ok(candidate) = base.join(reference).canonicalize() else {
                continue;
            };
            if !candidate.is_file() {
                continue;
            }
            if candidate.starts_with(&base) {
                debug!(path = %candidate.display(), "test unit resolved");
                return Ok(candidate);
            }
            escaped.get_or_insert(ResolutionError::OutsideBase {
                path: candidate,
                base,
            });
        }
        Err(escaped.unwrap_or_else(|| ResolutionError::NotFound(reference.to_path_buf())))
    }
}
