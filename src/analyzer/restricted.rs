//! Restricted-compile subset check.
//!
//! Runs before any worker is launched. The sandbox rewrites attribute and
//! item access into guard calls; this pass rejects the constructs that could
//! sidestep that rewrite or collide with the guard names.

use rustpython_parser::ast::{self, Expr, Identifier, Pattern, Ranged, Stmt};
use thiserror::Error;

use super::walk::{self, Inspect};
use crate::config::SecurityPolicy;

/// A construct outside the sandboxed subset
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RestrictedSyntaxError {
    /// Source does not parse
    #[error("{0}")]
    Syntax(String),

    /// `_name_` identifiers are reserved for the sandbox guards
    #[error("Line {line}: \"{name}\" is a reserved name and cannot be used")]
    ReservedName {
        /// 1-based line
        line: usize,
        /// Offending identifier
        name: String,
    },

    /// `__name__` identifiers outside the allowlist
    #[error("Line {line}: \"{name}\" is not an allowed special name")]
    SpecialName {
        /// 1-based line
        line: usize,
        /// Offending identifier
        name: String,
    },

    /// `from x import *`
    #[error("Line {line}: \"from {module} import *\" is not allowed")]
    StarImport {
        /// 1-based line
        line: usize,
        /// Source module
        module: String,
    },

    /// `async def`, `await`, `async for`, `async with`
    #[error("Line {line}: async constructs are not supported")]
    Async {
        /// 1-based line
        line: usize,
    },
}

/// Check `source` against the sandboxed subset.
///
/// # Errors
/// Returns the first construct, in traversal order, the sandbox cannot guard
pub fn check_source(source: &str, policy: &SecurityPolicy) -> Result<(), RestrictedSyntaxError> {
    let suite = super::parse_submission(source).map_err(RestrictedSyntaxError::Syntax)?;
    let mut checker = Checker {
        policy,
        lines: LineIndex::new(source),
        line: 1,
    };
    walk::suite(&mut checker, &suite)
}

fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

fn is_guard_like(name: &str) -> bool {
    name.len() > 2 && name.starts_with('_') && name.ends_with('_') && !is_dunder(name)
}

struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    fn new(source: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(source.match_indices('\n').map(|(i, _)| i + 1));
        Self { starts }
    }

    fn line_of(&self, offset: usize) -> usize {
        match self.starts.binary_search(&offset) {
            Ok(index) => index + 1,
            Err(index) => index,
        }
    }
}

struct Checker<'a> {
    policy: &'a SecurityPolicy,
    lines: LineIndex,
    line: usize,
}

impl Checker<'_> {
    fn identifier(&self, name: &str) -> Result<(), RestrictedSyntaxError> {
        if is_guard_like(name) {
            return Err(RestrictedSyntaxError::ReservedName {
                line: self.line,
                name: name.to_string(),
            });
        }
        if is_dunder(name) && !self.policy.is_allowed_dunder(name) {
            return Err(RestrictedSyntaxError::SpecialName {
                line: self.line,
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn dotted(&self, name: &str) -> Result<(), RestrictedSyntaxError> {
        name.split('.').try_for_each(|segment| self.identifier(segment))
    }

    const fn not_async(&self) -> RestrictedSyntaxError {
        RestrictedSyntaxError::Async { line: self.line }
    }
}

impl Inspect for Checker<'_> {
    type Error = RestrictedSyntaxError;

    fn stmt(&mut self, stmt: &Stmt) -> Result<(), RestrictedSyntaxError> {
        self.line = self.lines.line_of(usize::from(stmt.range().start()));
        match stmt {
            Stmt::AsyncFunctionDef(_) | Stmt::AsyncFor(_) | Stmt::AsyncWith(_) => {
                Err(self.not_async())
            }
            Stmt::FunctionDef(f) => self.identifier(f.name.as_str()),
            Stmt::ClassDef(c) => self.identifier(c.name.as_str()),
            Stmt::Import(node) => node.names.iter().try_for_each(|alias| {
                self.dotted(alias.name.as_str())?;
                alias
                    .asname
                    .as_ref()
                    .map_or(Ok(()), |name| self.identifier(name.as_str()))
            }),
            Stmt::ImportFrom(node) => {
                if node.names.iter().any(|alias| alias.name.as_str() == "*") {
                    return Err(RestrictedSyntaxError::StarImport {
                        line: self.line,
                        module: node.module.as_ref().map_or(".", Identifier::as_str).to_string(),
                    });
                }
                if let Some(module) = &node.module {
                    self.dotted(module.as_str())?;
                }
                node.names.iter().try_for_each(|alias| {
                    self.identifier(alias.name.as_str())?;
                    alias
                        .asname
                        .as_ref()
                        .map_or(Ok(()), |name| self.identifier(name.as_str()))
                })
            }
            Stmt::Global(node) => node
                .names
                .iter()
                .try_for_each(|n| self.identifier(n.as_str())),
            Stmt::Nonlocal(node) => node
                .names
                .iter()
                .try_for_each(|n| self.identifier(n.as_str())),
            _ => Ok(()),
        }
    }

    fn expr(&mut self, expr: &Expr) -> Result<(), RestrictedSyntaxError> {
        self.line = self.lines.line_of(usize::from(expr.range().start()));
        match expr {
            Expr::Name(name) => self.identifier(name.id.as_str()),
            Expr::Attribute(attr) => self.identifier(attr.attr.as_str()),
            Expr::Await(_) => Err(self.not_async()),
            _ => Ok(()),
        }
    }

    fn arg(&mut self, arg: &ast::Arg) -> Result<(), RestrictedSyntaxError> {
        self.identifier(arg.arg.as_str())
    }

    fn keyword(&mut self, keyword: &ast::Keyword) -> Result<(), RestrictedSyntaxError> {
        keyword
            .arg
            .as_ref()
            .map_or(Ok(()), |name| self.identifier(name.as_str()))
    }

    fn handler(
        &mut self,
        handler: &ast::ExceptHandlerExceptHandler,
    ) -> Result<(), RestrictedSyntaxError> {
        handler
            .name
            .as_ref()
            .map_or(Ok(()), |name| self.identifier(name.as_str()))
    }

    fn comprehension(
        &mut self,
        comprehension: &ast::Comprehension,
    ) -> Result<(), RestrictedSyntaxError> {
        if comprehension.is_async {
            return Err(self.not_async());
        }
        Ok(())
    }

    fn pattern(&mut self, pattern: &Pattern) -> Result<(), RestrictedSyntaxError> {
        let names: Vec<&str> = match pattern {
            Pattern::MatchAs(p) => p.name.iter().map(Identifier::as_str).collect(),
            Pattern::MatchStar(p) => p.name.iter().map(Identifier::as_str).collect(),
            Pattern::MatchMapping(p) => p.rest.iter().map(Identifier::as_str).collect(),
            Pattern::MatchClass(p) => p.kwd_attrs.iter().map(Identifier::as_str).collect(),
            _ => Vec::new(),
        };
        names.into_iter().try_for_each(|name| self.identifier(name))
    }
}
