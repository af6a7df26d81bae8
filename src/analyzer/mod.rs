//! Static safety analysis of submitted source.
//!
//! The analyzer parses a submission and walks its syntax tree looking for
//! imports outside the module allowlist and attribute accesses and calls on
//! the policy's deny tables. It is
//! a pure function of the source text: nothing is compiled or executed, so a
//! rejected submission never costs a worker launch.
//!
//! A second, stricter pass lives in [`restricted`]; it enforces the
//! syntactic subset the sandbox can guard at runtime and reports its
//! findings as compile errors rather than safety rejections.

pub mod restricted;
pub(crate) mod walk;

use std::sync::Arc;

use rustpython_parser::ast::{self, Expr, Pattern, Stmt};
use rustpython_parser::Parse;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::config::SecurityPolicy;
use crate::error::GradeError;
use walk::Inspect;

/// Filename the submission is compiled under, here and in the worker
pub const SUBMISSION_FILENAME: &str = "<submission>";

/// Why a submission was rejected before execution
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "rule", content = "detail", rename_all = "snake_case")]
pub enum Violation {
    /// The parser's own diagnostic
    #[error("{0}")]
    Syntax(String),

    /// `import x` / `from x import y` of a module that is not allowlisted, or is denied
    #[error("forbidden module: {0} cannot be imported for security reasons")]
    ForbiddenModule(String),

    /// `from x import y` where `y` is a denied name
    #[error("forbidden function: {module}.{name} cannot be used for security reasons")]
    ForbiddenImportName {
        /// Source module (`.` for a bare relative import)
        module: String,
        /// Imported name
        name: String,
    },

    /// `obj.attr` where `attr` is denied
    #[error("forbidden attribute access: {0} cannot be used for security reasons")]
    ForbiddenAttribute(String),

    /// Direct call to an always-dangerous builtin
    #[error("forbidden function: {0} cannot be used for security reasons")]
    ForbiddenCall(String),

    /// `obj.attr(...)` where `attr` is denied
    #[error("forbidden method: {0} cannot be used for security reasons")]
    ForbiddenMethod(String),
}

/// Outcome of static analysis
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SafetyVerdict {
    /// Whether the source may proceed to execution
    pub is_safe: bool,
    /// Human-readable reason when rejected
    pub reason: Option<String>,
    violation: Option<Violation>,
}

impl SafetyVerdict {
    fn safe() -> Self {
        Self {
            is_safe: true,
            reason: None,
            violation: None,
        }
    }

    fn rejected(violation: Violation) -> Self {
        Self {
            is_safe: false,
            reason: Some(violation.to_string()),
            violation: Some(violation),
        }
    }

    /// The rule that fired, if any
    #[must_use]
    pub const fn violation(&self) -> Option<&Violation> {
        self.violation.as_ref()
    }

    /// Convert a rejection into the pipeline fault it represents.
    ///
    /// Parse failures are compile errors; everything else is a safety
    /// rejection. Returns `None` for a safe verdict.
    #[must_use]
    pub fn into_error(self) -> Option<GradeError> {
        self.violation.map(|violation| match violation {
            Violation::Syntax(message) => GradeError::Compile(message),
            other => GradeError::SafetyRejection(other.to_string()),
        })
    }
}

/// Parse submitted source, returning the parser's diagnostic on failure
pub(crate) fn parse_submission(source: &str) -> Result<ast::Suite, String> {
    ast::Suite::parse(source, SUBMISSION_FILENAME).map_err(|e| e.to_string())
}

/// Static safety analyzer
#[derive(Debug, Clone)]
pub struct SafetyAnalyzer {
    policy: Arc<SecurityPolicy>,
}

impl SafetyAnalyzer {
    /// Create an analyzer over a shared policy
    #[must_use]
    pub const fn new(policy: Arc<SecurityPolicy>) -> Self {
        Self { policy }
    }

    /// Analyze `source` without executing it
    #[must_use]
    pub fn analyze(&self, source: &str) -> SafetyVerdict {
        let suite = match parse_submission(source) {
            Ok(suite) => suite,
            Err(message) => {
                debug!(%message, "submission does not parse");
                return SafetyVerdict::rejected(Violation::Syntax(message));
            }
        };

        let mut scanner = Scanner {
            policy: &self.policy,
        };
        match walk::suite(&mut scanner, &suite) {
            Ok(()) => SafetyVerdict::safe(),
            Err(violation) => {
                debug!(reason = %violation, "submission rejected by static analysis");
                SafetyVerdict::rejected(violation)
            }
        }
    }
}

struct Scanner<'a> {
    policy: &'a SecurityPolicy,
}

impl Inspect for Scanner<'_> {
    type Error = Violation;

    fn stmt(&mut self, stmt: &Stmt) -> Result<(), Violation> {
        match stmt {
            Stmt::Import(node) => {
                for alias in &node.names {
                    let module = alias.name.as_str();
                    if self.policy.is_denied_module(module) {
                        return Err(Violation::ForbiddenModule(module.to_string()));
                    }
                }
            }
            Stmt::ImportFrom(node) => {
                let module = node.module.as_ref().map(ast::Identifier::as_str);
                if let Some(module) = module {
                    if self.policy.is_denied_module(module) {
                        return Err(Violation::ForbiddenModule(module.to_string()));
                    }
                }
                for alias in &node.names {
                    let name = alias.name.as_str();
                    if self.policy.is_denied_import_name(name) {
                        return Err(Violation::ForbiddenImportName {
                            module: module.unwrap_or(".").to_string(),
                            name: name.to_string(),
                        });
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn expr(&mut self, expr: &Expr) -> Result<(), Violation> {
        match expr {
            Expr::Call(call) => match call.func.as_ref() {
                Expr::Name(name) if self.policy.is_denied_call(name.id.as_str()) => {
                    Err(Violation::ForbiddenCall(name.id.as_str().to_string()))
                }
                Expr::Attribute(attr) if self.policy.is_denied_attribute(attr.attr.as_str()) => {
                    Err(Violation::ForbiddenMethod(attr.attr.as_str().to_string()))
                }
                _ => Ok(()),
            },
            Expr::Attribute(attr) if self.policy.is_denied_attribute(attr.attr.as_str()) => {
                Err(Violation::ForbiddenAttribute(attr.attr.as_str().to_string()))
            }
            _ => Ok(()),
        }
    }

    fn pattern(&mut self, pattern: &Pattern) -> Result<(), Violation> {
        if let Pattern::MatchClass(class) = pattern {
            if let Some(attr) = class
                .kwd_attrs
                .iter()
                .find(|a| self.policy.is_denied_attribute(a.as_str()))
            {
                return Err(Violation::ForbiddenAttribute(attr.as_str().to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn analyzer() -> SafetyAnalyzer {
        SafetyAnalyzer::new(Arc::new(SecurityPolicy::default()))
    }

    fn reason(source: &str) -> String {
        let verdict = analyzer().analyze(source);
        assert!(!verdict.is_safe, "expected rejection for {source:?}");
        verdict.reason.unwrap()
    }

    #[test]
    fn test_plain_code_is_safe() {
        let source = r#"
import math
from collections import Counter

class Account:
    def __init__(self, owner):
        self.owner = owner
        self._balance = 0

    def deposit(self, amount):
        self._balance += amount
        return self._balance

def area(r):
    return math.pi * r ** 2

print("Hello", Counter("abca").most_common(1))
"#;
        let verdict = analyzer().analyze(source);
        assert!(verdict.is_safe, "{:?}", verdict.reason);
        assert!(verdict.violation().is_none());
    }

    #[test]
    fn test_denied_import() {
        assert_eq!(
            reason("import os"),
            "forbidden module: os cannot be imported for security reasons"
        );
        assert!(reason("import math, subprocess").contains("subprocess"));
        assert!(reason("import os.path as p").contains("os.path"));
    }

    #[test]
    fn test_denied_import_from() {
        assert!(reason("from socket import create_connection").contains("socket"));
        assert_eq!(
            reason("from functools import __dict__"),
            "forbidden function: functools.__dict__ cannot be used for security reasons"
        );
        assert!(reason("from random import system").contains("random.system"));
    }

    #[test]
    fn test_unlisted_module_rejected() {
        assert_eq!(
            reason("import argparse
f = argparse.FileType('r')('/etc/hostname')"),
            "forbidden module: argparse cannot be imported for security reasons"
        );
        assert!(reason("from argparse import FileType").contains("argparse"));
        assert!(reason("import json").contains("json"));
        assert!(reason("from dataclasses import dataclass").contains("dataclasses"));
        assert!(analyzer().analyze("import collections.abc
from itertools import chain").is_safe);
    }

    #[test]
    fn test_denied_builtin_call() {
        assert_eq!(
            reason("eval('1 + 1')"),
            "forbidden function: eval cannot be used for security reasons"
        );
        assert!(reason("x = open('secret.txt')").contains("open"));
        assert!(reason("name = input()").contains("input"));
    }

    #[test]
    fn test_denied_method_call_reported_before_attribute() {
        let verdict = analyzer().analyze("import math\nmath.system('ls')");
        assert_eq!(
            verdict.violation(),
            Some(&Violation::ForbiddenMethod("system".to_string()))
        );
    }

    #[test]
    fn test_denied_attribute_access() {
        assert_eq!(
            reason("x = (1).__class__"),
            "forbidden attribute access: __class__ cannot be used for security reasons"
        );
        assert!(reason("def f(g):\n    return g.gi_frame").contains("gi_frame"));
    }

    #[test]
    fn test_nested_constructs_are_scanned() {
        assert!(reason("def f():\n    def g():\n        return eval('1')\n    return g").contains("eval"));
        assert!(reason("x = [y.__subclasses__ for y in []]").contains("__subclasses__"));
        assert!(reason("try:\n    pass\nexcept Exception:\n    import pickle").contains("pickle"));
        assert!(reason("lambda: compile('', '', 'exec')").contains("compile"));
    }

    #[test]
    fn test_match_class_keyword_attribute() {
        let source = "match x:\n    case int(__class__=c):\n        pass\n";
        assert!(reason(source).contains("__class__"));
    }

    #[test]
    fn test_first_match_wins() {
        let verdict = analyzer().analyze("import os\nimport subprocess\n");
        assert_eq!(
            verdict.violation(),
            Some(&Violation::ForbiddenModule("os".to_string()))
        );
    }

    #[test]
    fn test_syntax_error_is_reported_verbatim() {
        let source = "def broken(:\n    pass";
        let expected = parse_submission(source).unwrap_err();
        let verdict = analyzer().analyze(source);
        assert!(!verdict.is_safe);
        assert_eq!(verdict.reason.as_deref(), Some(expected.as_str()));
        assert!(matches!(verdict.into_error(), Some(GradeError::Compile(_))));
    }

    #[test]
    fn test_rejection_maps_to_safety_fault() {
        let verdict = analyzer().analyze("import ctypes");
        match verdict.into_error() {
            Some(GradeError::SafetyRejection(message)) => assert!(message.contains("ctypes")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(analyzer().analyze("x = 1").into_error().is_none());
    }

    #[test]
    fn test_policy_override_is_respected() {
        let mut policy = SecurityPolicy::default();
        policy.allowed_modules.remove("math");
        policy.allowed_modules.insert("argparse".to_string());
        let analyzer = SafetyAnalyzer::new(Arc::new(policy));
        assert!(!analyzer.analyze("import math").is_safe);
        assert!(analyzer.analyze("import argparse").is_safe);
    }

    fn denied_module() -> impl Strategy<Value = String> {
        let modules: Vec<String> = SecurityPolicy::default()
            .denied_modules
            .into_iter()
            .collect();
        proptest::sample::select(modules)
    }

    proptest! {
        #[test]
        fn prop_denied_import_always_rejected(
            module in denied_module(),
            use_from in any::<bool>(),
            padding in 0usize..4,
        ) {
            let prelude = "x = 1\n".repeat(padding);
            let source = if use_from {
                format!("{prelude}from {module} import thing\n")
            } else {
                format!("{prelude}import {module}\n")
            };
            let verdict = analyzer().analyze(&source);
            prop_assert!(!verdict.is_safe);
            prop_assert!(verdict.reason.unwrap().contains(module.as_str()));
        }

        #[test]
        fn prop_arithmetic_functions_are_safe(
            name in "[a-z]{3,10}",
            a in 0i64..1000,
            b in 1i64..1000,
        ) {
            prop_assume!(!["def", "for", "and", "not", "del", "try", "pass", "with",
                "else", "elif", "from", "while", "yield", "class", "raise", "break",
                "return", "lambda", "global", "import", "assert", "except", "finally",
                "continue", "nonlocal", "async", "await", "match", "case", "type"]
                .contains(&name.as_str()));
            prop_assume!(!SecurityPolicy::default().is_denied_call(&name));
            let source = format!("def {name}(x):\n    return x * {a} // {b}\n\nresult = {name}({a})\n");
            prop_assert!(analyzer().analyze(&source).is_safe);
        }
    }
}
