//! Pre-order traversal over the submission syntax tree.
//!
//! Every node is handed to the inspector before its children, so the first
//! `Err` returned is the first offending node in source traversal order.

use rustpython_parser::ast::{
    self, Arguments, Comprehension, ExceptHandler, Expr, Keyword, Pattern, Stmt, WithItem,
};

/// Hooks called for each node kind. Defaults accept everything.
pub(crate) trait Inspect {
    /// Error produced when a node is rejected
    type Error;

    fn stmt(&mut self, _stmt: &Stmt) -> Result<(), Self::Error> {
        Ok(())
    }

    fn expr(&mut self, _expr: &Expr) -> Result<(), Self::Error> {
        Ok(())
    }

    fn arg(&mut self, _arg: &ast::Arg) -> Result<(), Self::Error> {
        Ok(())
    }

    fn keyword(&mut self, _keyword: &Keyword) -> Result<(), Self::Error> {
        Ok(())
    }

    fn handler(&mut self, _handler: &ast::ExceptHandlerExceptHandler) -> Result<(), Self::Error> {
        Ok(())
    }

    fn comprehension(&mut self, _comprehension: &Comprehension) -> Result<(), Self::Error> {
        Ok(())
    }

    fn pattern(&mut self, _pattern: &Pattern) -> Result<(), Self::Error> {
        Ok(())
    }
}

pub(crate) fn suite<I: Inspect>(inspector: &mut I, body: &[Stmt]) -> Result<(), I::Error> {
    body.iter().try_for_each(|s| stmt(inspector, s))
}

fn exprs<I: Inspect>(inspector: &mut I, items: &[Expr]) -> Result<(), I::Error> {
    items.iter().try_for_each(|e| expr(inspector, e))
}

fn opt_expr<I: Inspect>(inspector: &mut I, item: Option<&Expr>) -> Result<(), I::Error> {
    item.map_or(Ok(()), |e| expr(inspector, e))
}

fn stmt<I: Inspect>(inspector: &mut I, node: &Stmt) -> Result<(), I::Error> {
    inspector.stmt(node)?;
    match node {
        Stmt::FunctionDef(f) => {
            exprs(inspector, &f.decorator_list)?;
            arguments(inspector, &f.args)?;
            opt_expr(inspector, f.returns.as_deref())?;
            suite(inspector, &f.body)
        }
        Stmt::AsyncFunctionDef(f) => {
            exprs(inspector, &f.decorator_list)?;
            arguments(inspector, &f.args)?;
            opt_expr(inspector, f.returns.as_deref())?;
            suite(inspector, &f.body)
        }
        Stmt::ClassDef(c) => {
            exprs(inspector, &c.decorator_list)?;
            exprs(inspector, &c.bases)?;
            keywords(inspector, &c.keywords)?;
            suite(inspector, &c.body)
        }
        Stmt::Return(r) => opt_expr(inspector, r.value.as_deref()),
        Stmt::Delete(d) => exprs(inspector, &d.targets),
        Stmt::Assign(a) => {
            exprs(inspector, &a.targets)?;
            expr(inspector, &a.value)
        }
        Stmt::AugAssign(a) => {
            expr(inspector, &a.target)?;
            expr(inspector, &a.value)
        }
        Stmt::AnnAssign(a) => {
            expr(inspector, &a.target)?;
            expr(inspector, &a.annotation)?;
            opt_expr(inspector, a.value.as_deref())
        }
        Stmt::For(f) => {
            expr(inspector, &f.target)?;
            expr(inspector, &f.iter)?;
            suite(inspector, &f.body)?;
            suite(inspector, &f.orelse)
        }
        Stmt::AsyncFor(f) => {
            expr(inspector, &f.target)?;
            expr(inspector, &f.iter)?;
            suite(inspector, &f.body)?;
            suite(inspector, &f.orelse)
        }
        Stmt::While(w) => {
            expr(inspector, &w.test)?;
            suite(inspector, &w.body)?;
            suite(inspector, &w.orelse)
        }
        Stmt::If(i) => {
            expr(inspector, &i.test)?;
            suite(inspector, &i.body)?;
            suite(inspector, &i.orelse)
        }
        Stmt::With(w) => {
            with_items(inspector, &w.items)?;
            suite(inspector, &w.body)
        }
        Stmt::AsyncWith(w) => {
            with_items(inspector, &w.items)?;
            suite(inspector, &w.body)
        }
        Stmt::Match(m) => {
            expr(inspector, &m.subject)?;
            for case in &m.cases {
                pattern(inspector, &case.pattern)?;
                opt_expr(inspector, case.guard.as_deref())?;
                suite(inspector, &case.body)?;
            }
            Ok(())
        }
        Stmt::Raise(r) => {
            opt_expr(inspector, r.exc.as_deref())?;
            opt_expr(inspector, r.cause.as_deref())
        }
        Stmt::Try(t) => {
            suite(inspector, &t.body)?;
            handlers(inspector, &t.handlers)?;
            suite(inspector, &t.orelse)?;
            suite(inspector, &t.finalbody)
        }
        Stmt::TryStar(t) => {
            suite(inspector, &t.body)?;
            handlers(inspector, &t.handlers)?;
            suite(inspector, &t.orelse)?;
            suite(inspector, &t.finalbody)
        }
        Stmt::Assert(a) => {
            expr(inspector, &a.test)?;
            opt_expr(inspector, a.msg.as_deref())
        }
        Stmt::Expr(e) => expr(inspector, &e.value),
        // imports, global/nonlocal and bare keywords have no child nodes
        _ => Ok(()),
    }
}

fn expr<I: Inspect>(inspector: &mut I, node: &Expr) -> Result<(), I::Error> {
    inspector.expr(node)?;
    match node {
        Expr::BoolOp(b) => exprs(inspector, &b.values),
        Expr::NamedExpr(n) => {
            expr(inspector, &n.target)?;
            expr(inspector, &n.value)
        }
        Expr::BinOp(b) => {
            expr(inspector, &b.left)?;
            expr(inspector, &b.right)
        }
        Expr::UnaryOp(u) => expr(inspector, &u.operand),
        Expr::Lambda(l) => {
            arguments(inspector, &l.args)?;
            expr(inspector, &l.body)
        }
        Expr::IfExp(i) => {
            expr(inspector, &i.test)?;
            expr(inspector, &i.body)?;
            expr(inspector, &i.orelse)
        }
        Expr::Dict(d) => {
            for (key, value) in d.keys.iter().zip(&d.values) {
                opt_expr(inspector, key.as_ref())?;
                expr(inspector, value)?;
            }
            Ok(())
        }
        Expr::Set(s) => exprs(inspector, &s.elts),
        Expr::ListComp(c) => {
            expr(inspector, &c.elt)?;
            generators(inspector, &c.generators)
        }
        Expr::SetComp(c) => {
            expr(inspector, &c.elt)?;
            generators(inspector, &c.generators)
        }
        Expr::GeneratorExp(c) => {
            expr(inspector, &c.elt)?;
            generators(inspector, &c.generators)
        }
        Expr::DictComp(c) => {
            expr(inspector, &c.key)?;
            expr(inspector, &c.value)?;
            generators(inspector, &c.generators)
        }
        Expr::Await(a) => expr(inspector, &a.value),
        Expr::Yield(y) => opt_expr(inspector, y.value.as_deref()),
        Expr::YieldFrom(y) => expr(inspector, &y.value),
        Expr::Compare(c) => {
            expr(inspector, &c.left)?;
            exprs(inspector, &c.comparators)
        }
        Expr::Call(c) => {
            expr(inspector, &c.func)?;
            exprs(inspector, &c.args)?;
            keywords(inspector, &c.keywords)
        }
        Expr::FormattedValue(f) => {
            expr(inspector, &f.value)?;
            opt_expr(inspector, f.format_spec.as_deref())
        }
        Expr::JoinedStr(j) => exprs(inspector, &j.values),
        Expr::Attribute(a) => expr(inspector, &a.value),
        Expr::Subscript(s) => {
            expr(inspector, &s.value)?;
            expr(inspector, &s.slice)
        }
        Expr::Starred(s) => expr(inspector, &s.value),
        Expr::List(l) => exprs(inspector, &l.elts),
        Expr::Tuple(t) => exprs(inspector, &t.elts),
        Expr::Slice(s) => {
            opt_expr(inspector, s.lower.as_deref())?;
            opt_expr(inspector, s.upper.as_deref())?;
            opt_expr(inspector, s.step.as_deref())
        }
        // names and constants are leaves
        _ => Ok(()),
    }
}

fn arguments<I: Inspect>(inspector: &mut I, args: &Arguments) -> Result<(), I::Error> {
    for param in args
        .posonlyargs
        .iter()
        .chain(&args.args)
        .chain(&args.kwonlyargs)
    {
        inspector.arg(&param.def)?;
        opt_expr(inspector, param.def.annotation.as_deref())?;
        opt_expr(inspector, param.default.as_deref())?;
    }
    for param in args.vararg.iter().chain(&args.kwarg) {
        inspector.arg(param)?;
        opt_expr(inspector, param.annotation.as_deref())?;
    }
    Ok(())
}

fn keywords<I: Inspect>(inspector: &mut I, items: &[Keyword]) -> Result<(), I::Error> {
    for keyword in items {
        inspector.keyword(keyword)?;
        expr(inspector, &keyword.value)?;
    }
    Ok(())
}

fn with_items<I: Inspect>(inspector: &mut I, items: &[WithItem]) -> Result<(), I::Error> {
    for item in items {
        expr(inspector, &item.context_expr)?;
        opt_expr(inspector, item.optional_vars.as_deref())?;
    }
    Ok(())
}

fn handlers<I: Inspect>(inspector: &mut I, items: &[ExceptHandler]) -> Result<(), I::Error> {
    for item in items {
        let ExceptHandler::ExceptHandler(handler) = item;
        inspector.handler(handler)?;
        opt_expr(inspector, handler.type_.as_deref())?;
        suite(inspector, &handler.body)?;
    }
    Ok(())
}

fn generators<I: Inspect>(inspector: &mut I, items: &[Comprehension]) -> Result<(), I::Error> {
    for generator in items {
        inspector.comprehension(generator)?;
        expr(inspector, &generator.target)?;
        expr(inspector, &generator.iter)?;
        exprs(inspector, &generator.ifs)?;
    }
    Ok(())
}

fn pattern<I: Inspect>(inspector: &mut I, node: &Pattern) -> Result<(), I::Error> {
    inspector.pattern(node)?;
    match node {
        Pattern::MatchValue(p) => expr(inspector, &p.value),
        Pattern::MatchSequence(p) => p.patterns.iter().try_for_each(|p| pattern(inspector, p)),
        Pattern::MatchMapping(p) => {
            exprs(inspector, &p.keys)?;
            p.patterns.iter().try_for_each(|p| pattern(inspector, p))
        }
        Pattern::MatchClass(p) => {
            expr(inspector, &p.cls)?;
            p.patterns
                .iter()
                .chain(&p.kwd_patterns)
                .try_for_each(|p| pattern(inspector, p))
        }
        Pattern::MatchAs(p) => p
            .pattern
            .as_deref()
            .map_or(Ok(()), |p| pattern(inspector, p)),
        Pattern::MatchOr(p) => p.patterns.iter().try_for_each(|p| pattern(inspector, p)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustpython_parser::Parse;

    /// Records the names it sees, in visit order
    #[derive(Default)]
    struct NameLog(Vec<String>);

    impl Inspect for NameLog {
        type Error = ();

        fn expr(&mut self, expr: &Expr) -> Result<(), ()> {
            if let Expr::Name(name) = expr {
                self.0.push(name.id.as_str().to_string());
            }
            Ok(())
        }
    }

    /// Stops at the first name equal to `target`
    struct StopAt(&'static str, usize);

    impl Inspect for StopAt {
        type Error = usize;

        fn expr(&mut self, expr: &Expr) -> Result<(), usize> {
            self.1 += 1;
            match expr {
                Expr::Name(name) if name.id.as_str() == self.0 => Err(self.1),
                _ => Ok(()),
            }
        }
    }

    fn parse(source: &str) -> ast::Suite {
        ast::Suite::parse(source, "<test>").unwrap()
    }

    #[test]
    fn test_visits_in_source_order() {
        let suite_ = parse("a = b(c, d=e)\nfor f in g:\n    h[i] = [j for j in k if l]\n");
        let mut log = NameLog::default();
        suite(&mut log, &suite_).unwrap();
        assert_eq!(
            log.0,
            vec!["a", "b", "c", "e", "f", "g", "h", "i", "j", "j", "k", "l"]
        );
    }

    #[test]
    fn test_reaches_nested_scopes() {
        let source = "\
@deco
class A(Base, metaclass=Meta):
    def m(self, x=default, *a, **kw) -> Ret:
        try:
            pass
        except Err as e:
            return lambda y=inner: {key: val}
";
        let mut log = NameLog::default();
        suite(&mut log, &parse(source)).unwrap();
        for name in ["deco", "Base", "Meta", "default", "Ret", "Err", "inner", "key", "val"] {
            assert!(log.0.iter().any(|n| n == name), "missing {name}");
        }
    }

    #[test]
    fn test_first_error_short_circuits() {
        let mut stop = StopAt("target", 0);
        let visited = suite(&mut stop, &parse("x = 1\ny = target + other\n")).unwrap_err();
        // x, 1, y, binop, target
        assert_eq!(visited, 5);
    }
}
