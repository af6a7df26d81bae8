//! Strips sandbox artifacts from captured stderr.

use regex::Regex;

use crate::config::{ConfigError, GraderConfig};

/// Removes lines produced by the sandboxing machinery rather than the submission
#[derive(Debug, Clone, Default)]
pub struct StderrFilter {
    patterns: Vec<Regex>,
}

impl StderrFilter {
    /// Compile a filter from regex patterns
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidFilter` for the first pattern that does not compile
    pub fn new<I, S>(patterns: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| {
                Regex::new(p.as_ref()).map_err(|source| ConfigError::InvalidFilter {
                    pattern: p.as_ref().to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Filter built from `config.stderr_filters`
    ///
    /// # Errors
    /// See [`StderrFilter::new`]
    pub fn from_config(config: &GraderConfig) -> Result<Self, ConfigError> {
        Self::new(&config.stderr_filters)
    }

    /// Apply every pattern in order, then trim surrounding whitespace
    #[must_use]
    pub fn apply(&self, text: &str) -> String {
        let mut filtered = text.to_string();
        for pattern in &self.patterns {
            filtered = pattern.replace_all(&filtered, "").into_owned();
        }
        filtered.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filters_strip_bookkeeping_warning() {
        let filter = StderrFilter::from_config(&GraderConfig::default()).unwrap();
        let stderr = "<string>:1: SyntaxWarning: Line 3: Prints, but never reads 'printed' variable.\n\
                      division by zero\n";
        assert_eq!(filter.apply(stderr), "division by zero");
    }

    #[test]
    fn test_unrelated_lines_kept() {
        let filter = StderrFilter::from_config(&GraderConfig::default()).unwrap();
        let stderr = "\nTraceback (most recent call last):\n  File \"<submission>\", line 1\nZeroDivisionError: division by zero\n";
        assert_eq!(
            filter.apply(stderr),
            "Traceback (most recent call last):\n  File \"<submission>\", line 1\nZeroDivisionError: division by zero"
        );
    }

    #[test]
    fn test_empty_filter_only_trims() {
        let filter = StderrFilter::default();
        assert_eq!(filter.apply("  warning  \n"), "warning");
    }

    #[test]
    fn test_bad_pattern_reported() {
        let err = StderrFilter::new(["ok", "(bad"]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFilter { pattern, .. } if pattern == "(bad"));
    }
}
