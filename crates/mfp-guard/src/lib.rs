//! Static AST guard over LLM-submitted snippets.
//!
//! The guard is a visitor over the sandbox language's syntax tree (Python,
//! parsed with `rustpython-parser`) that rejects dangerous constructs before
//! anything reaches a container:
//!
//! - imports of blocked modules (filesystem, process, raw network,
//!   reflection, bytecode, dynamic evaluation);
//! - imports outside the positive allowlist, unless the module is a compiled
//!   server known to the registry;
//! - calls to `eval` / `exec` / `__import__` / `compile` / `open`;
//! - dunder attribute access (`__globals__`, `__class__`, ...);
//! - `global` / `nonlocal` declarations at module scope.
//!
//! The first violation wins. The submitted code is never captured into the
//! error; only the violation kind and the offending symbol are.

use std::collections::BTreeSet;

use mfp_types::{MfpError, ViolationKind};
use rustpython_parser::{Mode, ast, parse};

/// Modules a snippet may never import, grouped by the capability they leak.
pub const BLOCKED_MODULES: &[&str] = &[
    // filesystem
    "os", "io", "shutil", "pathlib", "tempfile", "glob", "fileinput",
    // process control
    "subprocess", "multiprocessing", "threading", "signal", "resource", "pty", "fcntl",
    // raw network (generated libraries use `requests` instead)
    "socket", "ssl", "selectors", "http", "urllib", "ftplib", "smtplib",
    // reflection and interpreter internals
    "sys", "importlib", "builtins", "inspect", "ctypes", "gc",
    // bytecode and code objects
    "marshal", "dis", "py_compile", "compileall", "code", "codeop",
    // arbitrary object execution on load
    "pickle", "shelve",
];

/// The positive list: data handling plus the HTTP client generated libraries
/// use. Compiled server libraries are allowed separately, by registry lookup.
pub const ALLOWED_MODULES: &[&str] = &[
    "json",
    "math",
    "re",
    "datetime",
    "time",
    "collections",
    "itertools",
    "functools",
    "statistics",
    "string",
    "textwrap",
    "random",
    "typing",
    "dataclasses",
    "decimal",
    "fractions",
    "uuid",
    "base64",
    "hashlib",
    "copy",
    "enum",
    "operator",
    "heapq",
    "bisect",
    "csv",
    "requests",
];

/// Call targets that are rejected wherever they appear.
pub const BLOCKED_CALLS: &[&str] = &["eval", "exec", "__import__", "compile", "open"];

/// The guard, configured with the set of compiled server names the registry
/// currently knows.
#[derive(Debug, Clone, Default)]
pub struct AstGuard {
    allowed_servers: BTreeSet<String>,
}

impl AstGuard {
    pub fn new<I, S>(allowed_servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_servers: allowed_servers.into_iter().map(Into::into).collect(),
        }
    }

    /// Check a snippet. `Ok(())` means the code is structurally safe to hand
    /// to the sandbox. A snippet that does not parse is a lint failure, not a
    /// security event.
    pub fn check(&self, code: &str) -> Result<(), MfpError> {
        let parsed = parse(code, Mode::Module, "<snippet>")
            .map_err(|e| MfpError::Lint { output: format!("syntax error: {e}") })?;

        let body = match &parsed {
            ast::Mod::Module(module) => &module.body,
            _ => return Ok(()),
        };

        for stmt in body {
            self.visit_stmt(stmt, true)?;
        }
        Ok(())
    }

    fn check_import(&self, module: &str) -> Result<(), MfpError> {
        let top = module.split('.').next().unwrap_or(module);
        if BLOCKED_MODULES.contains(&top) {
            return Err(violation(ViolationKind::BlockedImport, top));
        }
        if ALLOWED_MODULES.contains(&top) || self.allowed_servers.contains(top) {
            return Ok(());
        }
        Err(violation(ViolationKind::UnknownImport, top))
    }

    fn visit_stmt(&self, stmt: &ast::Stmt, module_scope: bool) -> Result<(), MfpError> {
        match stmt {
            ast::Stmt::Import(node) => {
                for alias in &node.names {
                    self.check_import(alias.name.as_str())?;
                }
            }
            ast::Stmt::ImportFrom(node) => {
                if matches!(&node.level, Some(level) if level.to_u32() > 0) {
                    return Err(violation(ViolationKind::UnknownImport, "."));
                }
                match &node.module {
                    Some(module) => self.check_import(module.as_str())?,
                    None => return Err(violation(ViolationKind::UnknownImport, ".")),
                }
            }
            ast::Stmt::Global(node) => {
                if module_scope {
                    let name = node.names.first().map(|n| n.as_str()).unwrap_or("global");
                    return Err(violation(ViolationKind::ScopeDeclaration, name));
                }
            }
            ast::Stmt::Nonlocal(node) => {
                if module_scope {
                    let name = node.names.first().map(|n| n.as_str()).unwrap_or("nonlocal");
                    return Err(violation(ViolationKind::ScopeDeclaration, name));
                }
            }
            ast::Stmt::FunctionDef(node) => {
                for dec in &node.decorator_list {
                    self.visit_expr(dec)?;
                }
                self.visit_body(&node.body, false)?;
            }
            ast::Stmt::AsyncFunctionDef(node) => {
                for dec in &node.decorator_list {
                    self.visit_expr(dec)?;
                }
                self.visit_body(&node.body, false)?;
            }
            ast::Stmt::ClassDef(node) => {
                for dec in &node.decorator_list {
                    self.visit_expr(dec)?;
                }
                for base in &node.bases {
                    self.visit_expr(base)?;
                }
                for kw in &node.keywords {
                    self.visit_expr(&kw.value)?;
                }
                self.visit_body(&node.body, false)?;
            }
            ast::Stmt::Return(node) => {
                if let Some(value) = &node.value {
                    self.visit_expr(value)?;
                }
            }
            ast::Stmt::Delete(node) => {
                for target in &node.targets {
                    self.visit_expr(target)?;
                }
            }
            ast::Stmt::Assign(node) => {
                for target in &node.targets {
                    self.visit_expr(target)?;
                }
                self.visit_expr(&node.value)?;
            }
            ast::Stmt::AugAssign(node) => {
                self.visit_expr(&node.target)?;
                self.visit_expr(&node.value)?;
            }
            ast::Stmt::AnnAssign(node) => {
                self.visit_expr(&node.target)?;
                self.visit_expr(&node.annotation)?;
                if let Some(value) = &node.value {
                    self.visit_expr(value)?;
                }
            }
            ast::Stmt::For(node) => {
                self.visit_expr(&node.target)?;
                self.visit_expr(&node.iter)?;
                self.visit_body(&node.body, module_scope)?;
                self.visit_body(&node.orelse, module_scope)?;
            }
            ast::Stmt::AsyncFor(node) => {
                self.visit_expr(&node.target)?;
                self.visit_expr(&node.iter)?;
                self.visit_body(&node.body, module_scope)?;
                self.visit_body(&node.orelse, module_scope)?;
            }
            ast::Stmt::While(node) => {
                self.visit_expr(&node.test)?;
                self.visit_body(&node.body, module_scope)?;
                self.visit_body(&node.orelse, module_scope)?;
            }
            ast::Stmt::If(node) => {
                self.visit_expr(&node.test)?;
                self.visit_body(&node.body, module_scope)?;
                self.visit_body(&node.orelse, module_scope)?;
            }
            ast::Stmt::With(node) => {
                for item in &node.items {
                    self.visit_expr(&item.context_expr)?;
                    if let Some(vars) = &item.optional_vars {
                        self.visit_expr(vars)?;
                    }
                }
                self.visit_body(&node.body, module_scope)?;
            }
            ast::Stmt::AsyncWith(node) => {
                for item in &node.items {
                    self.visit_expr(&item.context_expr)?;
                    if let Some(vars) = &item.optional_vars {
                        self.visit_expr(vars)?;
                    }
                }
                self.visit_body(&node.body, module_scope)?;
            }
            ast::Stmt::Raise(node) => {
                if let Some(exc) = &node.exc {
                    self.visit_expr(exc)?;
                }
                if let Some(cause) = &node.cause {
                    self.visit_expr(cause)?;
                }
            }
            ast::Stmt::Try(node) => {
                self.visit_body(&node.body, module_scope)?;
                for handler in &node.handlers {
                    let ast::ExceptHandler::ExceptHandler(h) = handler;
                    if let Some(type_) = &h.type_ {
                        self.visit_expr(type_)?;
                    }
                    self.visit_body(&h.body, module_scope)?;
                }
                self.visit_body(&node.orelse, module_scope)?;
                self.visit_body(&node.finalbody, module_scope)?;
            }
            ast::Stmt::Assert(node) => {
                self.visit_expr(&node.test)?;
                if let Some(msg) = &node.msg {
                    self.visit_expr(msg)?;
                }
            }
            ast::Stmt::Expr(node) => {
                self.visit_expr(&node.value)?;
            }
            // Pass / Break / Continue and rarer statements carry no
            // expressions the guard inspects.
            _ => {}
        }
        Ok(())
    }

    fn visit_body(&self, body: &[ast::Stmt], module_scope: bool) -> Result<(), MfpError> {
        for stmt in body {
            self.visit_stmt(stmt, module_scope)?;
        }
        Ok(())
    }

    fn visit_expr(&self, expr: &ast::Expr) -> Result<(), MfpError> {
        match expr {
            ast::Expr::Call(node) => {
                if let ast::Expr::Name(name) = node.func.as_ref() {
                    if BLOCKED_CALLS.contains(&name.id.as_str()) {
                        return Err(violation(ViolationKind::BlockedCall, name.id.as_str()));
                    }
                }
                self.visit_expr(&node.func)?;
                for arg in &node.args {
                    self.visit_expr(arg)?;
                }
                for kw in &node.keywords {
                    self.visit_expr(&kw.value)?;
                }
            }
            ast::Expr::Attribute(node) => {
                let attr = node.attr.as_str();
                if attr.len() > 4 && attr.starts_with("__") && attr.ends_with("__") {
                    return Err(violation(ViolationKind::DunderAccess, attr));
                }
                self.visit_expr(&node.value)?;
            }
            ast::Expr::BoolOp(node) => {
                for value in &node.values {
                    self.visit_expr(value)?;
                }
            }
            ast::Expr::NamedExpr(node) => {
                self.visit_expr(&node.target)?;
                self.visit_expr(&node.value)?;
            }
            ast::Expr::BinOp(node) => {
                self.visit_expr(&node.left)?;
                self.visit_expr(&node.right)?;
            }
            ast::Expr::UnaryOp(node) => {
                self.visit_expr(&node.operand)?;
            }
            ast::Expr::Lambda(node) => {
                self.visit_expr(&node.body)?;
            }
            ast::Expr::IfExp(node) => {
                self.visit_expr(&node.test)?;
                self.visit_expr(&node.body)?;
                self.visit_expr(&node.orelse)?;
            }
            ast::Expr::Dict(node) => {
                for key in node.keys.iter().flatten() {
                    self.visit_expr(key)?;
                }
                for value in &node.values {
                    self.visit_expr(value)?;
                }
            }
            ast::Expr::Set(node) => {
                for elt in &node.elts {
                    self.visit_expr(elt)?;
                }
            }
            ast::Expr::ListComp(node) => {
                self.visit_expr(&node.elt)?;
                self.visit_generators(&node.generators)?;
            }
            ast::Expr::SetComp(node) => {
                self.visit_expr(&node.elt)?;
                self.visit_generators(&node.generators)?;
            }
            ast::Expr::DictComp(node) => {
                self.visit_expr(&node.key)?;
                self.visit_expr(&node.value)?;
                self.visit_generators(&node.generators)?;
            }
            ast::Expr::GeneratorExp(node) => {
                self.visit_expr(&node.elt)?;
                self.visit_generators(&node.generators)?;
            }
            ast::Expr::Await(node) => {
                self.visit_expr(&node.value)?;
            }
            ast::Expr::Yield(node) => {
                if let Some(value) = &node.value {
                    self.visit_expr(value)?;
                }
            }
            ast::Expr::YieldFrom(node) => {
                self.visit_expr(&node.value)?;
            }
            ast::Expr::Compare(node) => {
                self.visit_expr(&node.left)?;
                for comparator in &node.comparators {
                    self.visit_expr(comparator)?;
                }
            }
            ast::Expr::FormattedValue(node) => {
                self.visit_expr(&node.value)?;
            }
            ast::Expr::JoinedStr(node) => {
                for value in &node.values {
                    self.visit_expr(value)?;
                }
            }
            ast::Expr::Subscript(node) => {
                self.visit_expr(&node.value)?;
                self.visit_expr(&node.slice)?;
            }
            ast::Expr::Starred(node) => {
                self.visit_expr(&node.value)?;
            }
            ast::Expr::List(node) => {
                for elt in &node.elts {
                    self.visit_expr(elt)?;
                }
            }
            ast::Expr::Tuple(node) => {
                for elt in &node.elts {
                    self.visit_expr(elt)?;
                }
            }
            ast::Expr::Slice(node) => {
                if let Some(lower) = &node.lower {
                    self.visit_expr(lower)?;
                }
                if let Some(upper) = &node.upper {
                    self.visit_expr(upper)?;
                }
                if let Some(step) = &node.step {
                    self.visit_expr(step)?;
                }
            }
            // Name and Constant leaves are safe on their own.
            _ => {}
        }
        Ok(())
    }

    fn visit_generators(&self, generators: &[ast::Comprehension]) -> Result<(), MfpError> {
        for generator in generators {
            self.visit_expr(&generator.target)?;
            self.visit_expr(&generator.iter)?;
            for cond in &generator.ifs {
                self.visit_expr(cond)?;
            }
        }
        Ok(())
    }
}

fn violation(kind: ViolationKind, pattern: &str) -> MfpError {
    MfpError::Security { kind, pattern: pattern.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> AstGuard {
        AstGuard::new(["weather", "petstore"])
    }

    fn expect_violation(code: &str, kind: ViolationKind, pattern: &str) {
        match guard().check(code) {
            Err(MfpError::Security { kind: k, pattern: p }) => {
                assert_eq!(k, kind, "kind for {code:?}");
                assert_eq!(p, pattern, "pattern for {code:?}");
            }
            other => panic!("expected violation for {code:?}, got {other:?}"),
        }
    }

    #[test]
    fn clean_snippet_passes() {
        let code = r#"
import json
from weather.functions import get_forecast

result = get_forecast(city="Oslo")
print(json.dumps({"success": True, "data": result}))
"#;
        assert!(guard().check(code).is_ok());
    }

    #[test]
    fn blocked_module_import_is_rejected() {
        expect_violation("import os\nos.listdir('/')", ViolationKind::BlockedImport, "os");
        expect_violation("import subprocess", ViolationKind::BlockedImport, "subprocess");
        expect_violation("from socket import socket", ViolationKind::BlockedImport, "socket");
    }

    #[test]
    fn blocked_submodule_import_is_rejected() {
        expect_violation("import os.path", ViolationKind::BlockedImport, "os");
        expect_violation("from urllib.request import urlopen", ViolationKind::BlockedImport, "urllib");
    }

    #[test]
    fn unknown_module_is_rejected() {
        expect_violation("import numpy", ViolationKind::UnknownImport, "numpy");
    }

    #[test]
    fn relative_import_is_rejected() {
        expect_violation("from . import thing", ViolationKind::UnknownImport, ".");
    }

    #[test]
    fn server_import_requires_registry_entry() {
        assert!(guard().check("from weather.functions import get_forecast").is_ok());
        expect_violation(
            "from ghost.functions import anything",
            ViolationKind::UnknownImport,
            "ghost",
        );
    }

    #[test]
    fn dynamic_evaluation_calls_are_rejected() {
        expect_violation("eval('1+1')", ViolationKind::BlockedCall, "eval");
        expect_violation("exec('x = 1')", ViolationKind::BlockedCall, "exec");
        expect_violation("__import__('os')", ViolationKind::BlockedCall, "__import__");
        expect_violation("compile('x', '<s>', 'exec')", ViolationKind::BlockedCall, "compile");
        expect_violation("open('/etc/passwd')", ViolationKind::BlockedCall, "open");
    }

    #[test]
    fn nested_blocked_call_is_found() {
        expect_violation(
            "data = [eval(x) for x in items]",
            ViolationKind::BlockedCall,
            "eval",
        );
        expect_violation(
            "def helper():\n    return open('f')",
            ViolationKind::BlockedCall,
            "open",
        );
    }

    #[test]
    fn dunder_attribute_access_is_rejected() {
        expect_violation("().__class__", ViolationKind::DunderAccess, "__class__");
        expect_violation(
            "f.__globals__['x']",
            ViolationKind::DunderAccess,
            "__globals__",
        );
        expect_violation(
            "x = type(o).__subclasses__",
            ViolationKind::DunderAccess,
            "__subclasses__",
        );
    }

    #[test]
    fn module_scope_global_is_rejected() {
        expect_violation("global counter", ViolationKind::ScopeDeclaration, "counter");
    }

    #[test]
    fn function_scope_global_is_allowed() {
        let code = "counter = 0\ndef bump():\n    global counter\n    counter += 1\n";
        assert!(guard().check(code).is_ok());
    }

    #[test]
    fn syntax_error_is_a_lint_failure() {
        match guard().check("def broken(:") {
            Err(MfpError::Lint { output }) => assert!(output.contains("syntax error")),
            other => panic!("expected lint failure, got {other:?}"),
        }
    }

    #[test]
    fn violation_never_echoes_code() {
        let code = "SECRET_MARKER = 1\nimport os";
        let err = guard().check(code).expect_err("violation");
        assert!(!err.to_string().contains("SECRET_MARKER"));
    }
}
