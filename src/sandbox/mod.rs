//! Restricted namespace builder.
//!
//! The namespace a submission runs in is materialised inside the worker by
//! the sandbox kernel (`kernel.py`). This module decides what goes into it:
//! the builtin and module allowlists, the runtime deny tables behind the
//! guard functions, the capturing `print` terminator and any host-provided
//! bindings. The result is a plain serialisable value, so the same
//! environment can be shipped to a child process or handed to the embedded
//! interpreter.
//!
//! Anything not listed here is absent from the sandbox: the kernel builds a
//! fresh `__builtins__` table from [`ExecutionEnvironment::builtins`] and
//! never falls back to the host's builtins module.

pub mod stderr;

pub use stderr::StderrFilter;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SecurityPolicy;

/// Python source of the sandbox kernel
pub const KERNEL_SOURCE: &str = include_str!("kernel.py");

/// Module name the kernel is registered under in embedded mode
pub const KERNEL_MODULE: &str = "gradebox_kernel";

/// Prefix of the single reply line a process-mode worker writes
pub const REPLY_MARKER: &str = "@@GRADEBOX-REPLY@@";

/// Globals the kernel binds so rewritten attribute/item access can find the guards
pub const GUARD_NAMES: &[&str] = &["_getattr_", "_getitem_", "_write_", "_write_item_", "_slice_"];

/// Builtins the kernel always provides, each replaced by a guarded or capturing variant
pub const GUARDED_BUILTINS: &[&str] = &["print", "getattr", "hasattr", "__import__", "__build_class__"];

/// Invalid extra bindings
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvironmentError {
    /// Leading underscores are reserved for the sandbox machinery
    #[error("binding name {0:?} is reserved for the sandbox")]
    ReservedBinding(String),

    /// Not a Python identifier
    #[error("binding name {0:?} is not a valid identifier")]
    InvalidBindingName(String),
}

/// Everything the kernel needs to build one sandbox namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEnvironment {
    builtins: Vec<String>,
    allowed_modules: Vec<String>,
    denied_modules: Vec<String>,
    denied_attributes: Vec<String>,
    denied_import_names: Vec<String>,
    allowed_dunders: Vec<String>,
    item_read_types: Vec<String>,
    item_write_types: Vec<String>,
    print_end: String,
    bindings: BTreeMap<String, serde_json::Value>,
}

impl ExecutionEnvironment {
    /// Allowlisted builtins, in policy order
    pub fn builtins(&self) -> impl Iterator<Item = &str> {
        self.builtins.iter().map(String::as_str)
    }

    /// Modules the kernel's import guard lets through
    pub fn allowed_modules(&self) -> impl Iterator<Item = &str> {
        self.allowed_modules.iter().map(String::as_str)
    }

    /// Whether `name` resolves to something inside the sandbox
    #[must_use]
    pub fn exposes(&self, name: &str) -> bool {
        self.builtins.iter().any(|b| b == name)
            || GUARDED_BUILTINS.contains(&name)
            || GUARD_NAMES.contains(&name)
            || self.bindings.contains_key(name)
    }

    /// Host-provided bindings merged into the namespace last
    #[must_use]
    pub const fn bindings(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.bindings
    }

    /// Terminator the capturing `print` appends
    #[must_use]
    pub fn print_end(&self) -> &str {
        &self.print_end
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Build the environment a submission runs in.
///
/// `extra_bindings` are plain JSON data; they cannot carry callables, so
/// they cannot open a path out of the sandbox. Student execution passes an
/// empty map.
///
/// # Errors
/// Returns error if a binding name is not an identifier or starts with `_`
pub fn build_sandbox_environment(
    policy: &SecurityPolicy,
    print_end: &str,
    extra_bindings: BTreeMap<String, serde_json::Value>,
) -> Result<ExecutionEnvironment, EnvironmentError> {
    for name in extra_bindings.keys() {
        if !is_identifier(name) {
            return Err(EnvironmentError::InvalidBindingName(name.clone()));
        }
        if name.starts_with('_') {
            return Err(EnvironmentError::ReservedBinding(name.clone()));
        }
    }

    let collect = |set: &std::collections::BTreeSet<String>| set.iter().cloned().collect();
    Ok(ExecutionEnvironment {
        builtins: policy
            .allowed_builtins
            .iter()
            .filter(|name| !policy.is_denied_call(name))
            .cloned()
            .collect(),
        allowed_modules: policy
            .allowed_modules
            .iter()
            .filter(|name| !policy.denied_modules.contains(*name))
            .cloned()
            .collect(),
        denied_modules: collect(&policy.denied_modules),
        denied_attributes: collect(&policy.denied_attributes),
        denied_import_names: collect(&policy.denied_import_names),
        allowed_dunders: collect(&policy.allowed_dunders),
        item_read_types: collect(&policy.item_read_types),
        item_write_types: collect(&policy.item_write_types),
        print_end: print_end.to_string(),
        bindings: extra_bindings,
    })
}
