//! Grader configuration and the immutable security policy.
//!
//! `GraderConfig` is loaded once at startup (JSON file, then environment
//! overrides) and validated. The `SecurityPolicy` it carries is frozen into an
//! `Arc` and shared by the analyzer, the restricted compiler and the
//! namespace builder; nothing mutates it after construction.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable overriding the execution timeout (seconds)
pub const ENV_TIMEOUT: &str = "GRADEBOX_TIMEOUT_SECS";
/// Environment variable overriding the interpreter path
pub const ENV_PYTHON: &str = "GRADEBOX_PYTHON";
/// Environment variable overriding the isolation preference
pub const ENV_ISOLATION: &str = "GRADEBOX_ISOLATION";
/// Environment variable overriding the primary test-unit directory
pub const ENV_TESTS_ROOT: &str = "GRADEBOX_TESTS_ROOT";
/// Environment variable overriding the progress store location
pub const ENV_STORE: &str = "GRADEBOX_STORE";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config {path}: {source}")]
    Read {
        /// Path that was read
        path: PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },
    /// Config file is not valid JSON for this schema
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// Path that was parsed
        path: PathBuf,
        /// Underlying parse error
        source: serde_json::Error,
    },
    /// An environment override has an unusable value
    #[error("invalid value for {key}: {value}")]
    InvalidOverride {
        /// Variable name
        key: String,
        /// Offending value
        value: String,
    },
    /// Timeout must be positive
    #[error("timeout must be greater than zero")]
    ZeroTimeout,
    /// A stderr filter is not a valid regex
    #[error("invalid stderr filter {pattern:?}: {source}")]
    InvalidFilter {
        /// The pattern
        pattern: String,
        /// Regex compile error
        source: regex::Error,
    },
    /// Policy tables contradict each other or name unknown types
    #[error("invalid security policy: {0}")]
    InvalidPolicy(String),
    /// The sandbox environment could not be built
    #[error(transparent)]
    Environment(#[from] crate::sandbox::EnvironmentError),
}

/// Which isolation mode the engine should use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationPreference {
    /// Probe the host and pick the strongest available mode
    #[default]
    Auto,
    /// Always use a child process
    Process,
    /// Always use the embedded interpreter on a worker thread
    Thread,
}

impl std::str::FromStr for IsolationPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "process" => Ok(Self::Process),
            "thread" => Ok(Self::Thread),
            other => Err(format!("unknown isolation mode: {other}")),
        }
    }
}

/// Top-level grader configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraderConfig {
    /// Wall-clock budget for one sandboxed run, in seconds
    pub timeout_secs: u64,
    /// Isolation mode preference
    pub isolation: IsolationPreference,
    /// Interpreter used in process mode
    pub python_bin: PathBuf,
    /// Address-space limit applied to the worker process
    pub memory_limit_bytes: Option<u64>,
    /// Largest file the worker process may write
    pub file_size_limit_bytes: Option<u64>,
    /// Upper bound on the worker reply (bytes on the wire)
    pub max_output_bytes: usize,
    /// Upper bound on each captured text stream (characters)
    pub max_capture_chars: usize,
    /// Terminator appended by the sandboxed `print`
    pub print_end: String,
    /// Install a line-level deadline check in thread mode
    pub cooperative_deadline: bool,
    /// Primary directory test-file references are resolved against
    pub tests_root: Option<PathBuf>,
    /// Location of the progress database
    pub store_path: Option<PathBuf>,
    /// Patterns stripped from captured stderr
    pub stderr_filters: Vec<String>,
    /// Deny/allow tables
    pub policy: SecurityPolicy,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            isolation: IsolationPreference::Auto,
            python_bin: PathBuf::from("python3"),
            memory_limit_bytes: Some(256 * 1024 * 1024),
            file_size_limit_bytes: Some(1024 * 1024),
            max_output_bytes: 4 * 1024 * 1024,
            max_capture_chars: 64 * 1024,
            print_end: "\n".to_string(),
            cooperative_deadline: true,
            tests_root: None,
            store_path: None,
            stderr_filters: default_stderr_filters(),
            policy: SecurityPolicy::default(),
        }
    }
}

fn default_stderr_filters() -> Vec<String> {
    vec![
        r"(?m)^.*SyntaxWarning: Line \d+: Prints, but never reads 'printed' variable.*(\n|$)".to_string(),
        r"(?m)^.*RuntimeWarning: .*(\n|$)".to_string(),
    ]
}

impl GraderConfig {
    /// Load configuration: optional JSON file, then environment overrides.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed, an override is
    /// malformed, or the result fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON config file without applying overrides
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `GRADEBOX_*` overrides from a key/value source.
    ///
    /// # Errors
    /// Returns error if a recognised key carries an unusable value
    pub fn apply_overrides<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                ENV_TIMEOUT => {
                    self.timeout_secs =
                        value
                            .trim()
                            .parse()
                            .map_err(|_| ConfigError::InvalidOverride {
                                key: key.clone(),
                                value: value.clone(),
                            })?;
                }
                ENV_PYTHON => self.python_bin = PathBuf::from(value),
                ENV_ISOLATION => {
                    self.isolation =
                        value.parse().map_err(|_| ConfigError::InvalidOverride {
                            key: key.clone(),
                            value: value.clone(),
                        })?;
                }
                ENV_TESTS_ROOT => self.tests_root = Some(PathBuf::from(value)),
                ENV_STORE => self.store_path = Some(PathBuf::from(value)),
                _ => {}
            }
        }
        Ok(())
    }

    /// Check internal consistency
    ///
    /// # Errors
    /// Returns the first problem found
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        for pattern in &self.stderr_filters {
            Regex::new(pattern).map_err(|source| ConfigError::InvalidFilter {
                pattern: pattern.clone(),
                source,
            })?;
        }
        self.policy.validate()
    }

    /// Execution timeout as a `Duration`
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Progress store path, defaulting to the platform data directory
    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        self.store_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("gradebox")
                .join("progress")
        })
    }
}

/// Container types the sandbox may index into or assign through
const KNOWN_ITEM_TYPES: &[&str] = &["list", "tuple", "dict", "str", "bytes", "bytearray", "range"];

/// Deny and allow tables enforced statically and at runtime.
///
/// Shared read-only by every component that enforces restrictions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    /// The only modules submissions may import (matched on the first dotted
    /// segment); anything else is refused
    pub allowed_modules: BTreeSet<String>,
    /// Modules that may never be imported, even if allowlisted
    pub denied_modules: BTreeSet<String>,
    /// Attribute names that may not be read, written, or called as methods
    pub denied_attributes: BTreeSet<String>,
    /// Names that may not be imported from any module
    pub denied_import_names: BTreeSet<String>,
    /// Builtin names that may never be called directly
    pub denied_calls: BTreeSet<String>,
    /// Builtins available inside the sandbox
    pub allowed_builtins: BTreeSet<String>,
    /// `__dunder__` names submitted code may define or access
    pub allowed_dunders: BTreeSet<String>,
    /// Types whose items may be read through subscription
    pub item_read_types: BTreeSet<String>,
    /// Types whose items may be assigned or deleted
    pub item_write_types: BTreeSet<String>,
}

fn set_of(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            allowed_modules: set_of(&[
                "math", "cmath", "random", "statistics", "fractions", "decimal", "numbers",
                "collections", "itertools", "functools", "heapq", "bisect", "datetime", "re",
                "textwrap",
            ]),
            denied_modules: set_of(&[
                // operating system and filesystem
                "os", "posix", "nt", "posixpath", "ntpath", "shutil", "pathlib", "io", "tempfile",
                "glob", "fnmatch", "fileinput", "linecache", "tokenize", "codecs", "mmap",
                "zipfile", "tarfile", "gzip", "bz2", "lzma", "zipimport", "filecmp", "stat",
                "_io", "_os",
                // process spawning and signals
                "subprocess", "commands", "popen2", "pipes", "pty", "tty", "termios", "signal",
                "_posixsubprocess", "faulthandler",
                // interpreter and process introspection
                "sys", "builtins", "__builtin__", "__main__", "platform", "resource", "gc",
                "inspect", "traceback", "atexit", "sysconfig", "site", "operator", "string",
                "types", "copyreg", "weakref", "ctypes", "cffi", "_ctypes", "dis", "trace",
                "pdb", "bdb", "code", "codeop", "timeit", "profile", "cProfile", "doctest",
                "pydoc", "unittest", "warnings", "logging",
                // dynamic import machinery
                "importlib", "imp", "pkgutil", "runpy", "modulefinder", "gradebox_kernel",
                // concurrency
                "multiprocessing", "threading", "_thread", "concurrent", "asyncio", "sched",
                // networking
                "socket", "ssl", "select", "selectors", "http", "urllib", "ftplib", "smtplib",
                "telnetlib", "poplib", "imaplib", "nntplib", "xmlrpc", "socketserver",
                "webbrowser", "email", "mailbox",
                // serialisation and encoding
                "base64", "binascii", "pickle", "cPickle", "_pickle", "pickletools", "shelve",
                "marshal", "dill", "dbm", "sqlite3",
                // registry access
                "_winreg", "winreg", "msvcrt", "_winapi",
            ]),
            denied_attributes: set_of(&[
                "system", "popen", "spawn", "call", "getattr", "setattr", "eval", "exec",
                "execfile", "compile", "open", "file", "write", "globals", "locals", "dir",
                "__dict__", "__class__", "__bases__", "__subclasses__", "__import__", "load",
                "loads", "dump", "dumps",
                // frame and code objects
                "gi_frame", "gi_code", "gi_yieldfrom", "cr_frame", "cr_code", "cr_await",
                "ag_frame", "ag_code", "f_back", "f_globals", "f_locals", "f_builtins",
                "f_code", "tb_frame", "tb_next", "co_code", "func_globals",
            ]),
            denied_import_names: set_of(&[
                "__builtins__", "__loader__", "__spec__", "__dict__", "__globals__",
                "__code__", "__subclasses__", "__import__", "modules", "environ", "getenv",
                "_getframe", "settrace", "setprofile",
            ]),
            denied_calls: set_of(&["eval", "exec", "compile", "open", "input", "breakpoint", "__import__"]),
            allowed_builtins: set_of(&[
                // type constructors
                "bool", "bytes", "bytearray", "complex", "dict", "float", "frozenset", "int",
                "list", "object", "range", "set", "slice", "str", "tuple", "type",
                // math and conversion
                "abs", "bin", "chr", "divmod", "format", "hash", "hex", "oct", "ord", "pow",
                "repr", "round", "ascii",
                // collections and iteration
                "all", "any", "enumerate", "filter", "iter", "len", "map", "max", "min", "next",
                "reversed", "sorted", "sum", "zip",
                // introspection-free checks
                "callable", "isinstance", "issubclass",
                // class machinery
                "classmethod", "property", "staticmethod", "super",
                // exceptions
                "ArithmeticError", "AssertionError", "AttributeError", "BaseException",
                "Exception", "GeneratorExit", "IndexError", "KeyError", "LookupError",
                "NameError", "NotImplementedError", "OverflowError", "RecursionError",
                "RuntimeError", "StopIteration", "TypeError", "UnboundLocalError",
                "UnicodeError", "ValueError", "ZeroDivisionError",
                // constants
                "True", "False", "None", "NotImplemented", "Ellipsis",
            ]),
            allowed_dunders: set_of(&[
                "__init__", "__new__", "__str__", "__repr__", "__format__", "__hash__",
                "__bool__", "__len__", "__iter__", "__next__", "__reversed__", "__contains__",
                "__getitem__", "__setitem__", "__delitem__", "__missing__", "__enter__",
                "__exit__", "__call__", "__eq__", "__ne__", "__lt__", "__le__", "__gt__",
                "__ge__", "__add__", "__sub__", "__mul__", "__truediv__", "__floordiv__",
                "__mod__", "__pow__", "__neg__", "__pos__", "__abs__", "__radd__",
                "__rsub__", "__rmul__", "__rtruediv__", "__iadd__", "__isub__", "__imul__",
                "__and__", "__or__", "__xor__", "__invert__", "__int__", "__float__",
                "__index__", "__round__", "__name__", "__doc__", "__slots__",
                "__post_init__", "__qualname__", "__module__",
            ]),
            item_read_types: set_of(&["list", "tuple", "dict", "str", "range", "bytes"]),
            item_write_types: set_of(&["list", "dict"]),
        }
    }
}

impl SecurityPolicy {
    /// Whether importing `module` (possibly dotted) is forbidden: its root
    /// is off the allowlist or on the deny list
    #[must_use]
    pub fn is_denied_module(&self, module: &str) -> bool {
        let root = module.split('.').next().unwrap_or(module);
        !self.allowed_modules.contains(root) || self.denied_modules.contains(root)
    }

    /// Whether reading/writing/calling attribute `name` is forbidden
    #[must_use]
    pub fn is_denied_attribute(&self, name: &str) -> bool {
        self.denied_attributes.contains(name)
    }

    /// Whether `name` may not be pulled in with `from x import name`
    #[must_use]
    pub fn is_denied_import_name(&self, name: &str) -> bool {
        self.denied_import_names.contains(name) || self.denied_attributes.contains(name)
    }

    /// Whether a direct call to builtin `name` is forbidden
    #[must_use]
    pub fn is_denied_call(&self, name: &str) -> bool {
        self.denied_calls.contains(name)
    }

    /// Whether special name `name` is on the allowlist
    #[must_use]
    pub fn is_allowed_dunder(&self, name: &str) -> bool {
        self.allowed_dunders.contains(name)
    }

    /// Check the tables against each other
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidPolicy` naming the first inconsistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(name) = self.allowed_builtins.intersection(&self.denied_calls).next() {
            return Err(ConfigError::InvalidPolicy(format!(
                "builtin {name} is both allowed and denied"
            )));
        }
        if let Some(name) = self.allowed_modules.intersection(&self.denied_modules).next() {
            return Err(ConfigError::InvalidPolicy(format!(
                "module {name} is both allowed and denied"
            )));
        }
        let unknown = self
            .item_read_types
            .iter()
            .chain(&self.item_write_types)
            .find(|t| !KNOWN_ITEM_TYPES.contains(&t.as_str()));
        if let Some(name) = unknown {
            return Err(ConfigError::InvalidPolicy(format!(
                "unknown container type in item tables: {name}"
            )));
        }
        if let Some(name) = self.item_write_types.difference(&self.item_read_types).next() {
            return Err(ConfigError::InvalidPolicy(format!(
                "type {name} is writable but not readable"
            )));
        }
        Ok(())
    }
}

/// Render a duration the way timeout messages print it: `10`, `1.5`
#[must_use]
pub fn format_secs(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        duration.as_secs().to_string()
    } else {
        let secs = duration.as_secs_f64();
        let rendered = format!("{secs:.3}");
        rendered.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = GraderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timeout(), Duration::from_secs(10));
        assert_eq!(config.print_end, "\n");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = GraderConfig::default();
        config
            .apply_overrides(vars(&[
                (ENV_TIMEOUT, "3"),
                (ENV_ISOLATION, "Thread"),
                (ENV_PYTHON, "/opt/python/bin/python3"),
                ("UNRELATED", "x"),
            ]))
            .unwrap();

        assert_eq!(config.timeout_secs, 3);
        assert_eq!(config.isolation, IsolationPreference::Thread);
        assert_eq!(config.python_bin, PathBuf::from("/opt/python/bin/python3"));
    }

    #[test]
    fn test_bad_override_rejected() {
        let mut config = GraderConfig::default();
        let err = config
            .apply_overrides(vars(&[(ENV_TIMEOUT, "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { .. }));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = GraderConfig {
            timeout_secs: 0,
            ..GraderConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::ZeroTimeout)));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gradebox.json");
        std::fs::write(
            &path,
            r#"{"timeout_secs": 4, "policy": {"allowed_modules": ["math", "json"]}}"#,
        )
        .unwrap();

        let config = GraderConfig::from_file(&path).unwrap();
        assert_eq!(config.timeout_secs, 4);
        assert!(!config.policy.is_denied_module("json.decoder"));
        assert!(config.policy.is_denied_module("random"));
        assert!(config.policy.is_denied_module("subprocess"));
        // untouched tables keep their defaults
        assert!(config.policy.is_denied_call("eval"));
    }

    #[test]
    fn test_policy_contradiction_rejected() {
        let mut policy = SecurityPolicy::default();
        policy.allowed_builtins.insert("eval".to_string());
        assert!(matches!(policy.validate(), Err(ConfigError::InvalidPolicy(_))));

        let mut policy = SecurityPolicy::default();
        policy.item_write_types.insert("socket".to_string());
        assert!(policy.validate().is_err());

        let mut policy = SecurityPolicy::default();
        policy.allowed_modules.insert("os".to_string());
        match policy.validate() {
            Err(ConfigError::InvalidPolicy(message)) => assert!(message.contains("module os")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unsubscriptable_item_type_rejected() {
        for name in ["set", "frozenset"] {
            let mut policy = SecurityPolicy::default();
            policy.item_read_types.insert(name.to_string());
            assert!(matches!(policy.validate(), Err(ConfigError::InvalidPolicy(_))), "{name}");
        }
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let config = GraderConfig {
            stderr_filters: vec!["(unclosed".to_string()],
            ..GraderConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidFilter { .. })
        ));
    }

    #[test]
    fn test_dotted_module_matches_root() {
        let policy = SecurityPolicy::default();
        assert!(policy.is_denied_module("os.path"));
        assert!(policy.is_denied_module("urllib.request"));
        assert!(!policy.is_denied_module("math"));
        assert!(!policy.is_denied_module("collections.abc"));
    }

    #[test]
    fn test_modules_off_the_allowlist_are_denied() {
        let policy = SecurityPolicy::default();
        assert!(policy.validate().is_ok());
        for module in ["argparse", "ossify", "json", "dataclasses", "typing"] {
            assert!(policy.is_denied_module(module), "{module}");
        }
    }

    #[test]
    fn test_format_secs() {
        assert_eq!(format_secs(Duration::from_secs(10)), "10");
        assert_eq!(format_secs(Duration::from_millis(1500)), "1.5");
        assert_eq!(format_secs(Duration::from_millis(250)), "0.25");
    }
}
