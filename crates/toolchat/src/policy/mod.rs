//! Static policy evaluation of untrusted Python.
//!
//! The [`PolicyEvaluator`] parses a submission into a [`Program`] and walks
//! its nodes in source order, rejecting on the first of:
//!
//! - an import whose full dotted name and top-level package are both absent
//!   from the allow-list;
//! - a call of (or bare reference to) a blocked builtin;
//! - attribute access on any `__dunder__` name.
//!
//! Code that is not well-formed Python is rejected as a syntax error before
//! any of these checks. Identifiers are NFKC-normalized first, so fullwidth
//! and other compatibility spellings name the same builtins and attributes.
//!
//! Evaluation is pure and runs before any process is spawned. Accepted code is
//! wrapped in [`AcceptedCode`], the only input the
//! [`ExecutionRunner`](crate::sandbox::ExecutionRunner) takes.

mod grammar;
pub mod lexer;
pub mod program;

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

pub use lexer::ParseError;
pub use program::{Node, Program};

// ── Policy table ───────────────────────────────────────────────────

/// Modules that may be imported, by exact dotted name or top-level package.
pub const ALLOWED_MODULES: &[&str] = &[
    // Math & science
    "math",
    "cmath",
    "decimal",
    "fractions",
    "statistics",
    "random",
    // Data
    "numpy",
    "np",
    "pandas",
    "pd",
    // Plotting
    "matplotlib",
    "matplotlib.pyplot",
    "matplotlib.figure",
    "matplotlib.dates",
    "mpl_toolkits",
    "mpl_toolkits.mplot3d",
    "seaborn",
    "sns",
    // Finance
    "yfinance",
    "yf",
    // Scientific computing & ML
    "scipy",
    "scipy.stats",
    "scipy.optimize",
    "scipy.interpolate",
    "scipy.signal",
    "scipy.linalg",
    "scipy.integrate",
    "sklearn",
    "sklearn.linear_model",
    "sklearn.cluster",
    "sklearn.preprocessing",
    "sklearn.model_selection",
    "sklearn.metrics",
    "sklearn.ensemble",
    "sklearn.tree",
    "sklearn.neighbors",
    "sklearn.svm",
    "sklearn.decomposition",
    "sklearn.pipeline",
    // HTTP (yfinance depends on it)
    "requests",
    // Standard library
    "datetime",
    "json",
    "csv",
    "collections",
    "itertools",
    "functools",
    "re",
    "string",
    "textwrap",
    "operator",
    "copy",
    "pprint",
    "typing",
    "dataclasses",
    "enum",
    "abc",
    "io",
    "base64",
    "hashlib",
    "hmac",
    "time",
    "calendar",
];

/// Builtins that may be neither called nor referenced.
pub const BLOCKED_BUILTINS: &[&str] = &[
    "exec",
    "eval",
    "compile",
    "__import__",
    "globals",
    "locals",
    "getattr",
    "setattr",
    "delattr",
    "vars",
    "open",
    "input",
    "breakpoint",
    "exit",
    "quit",
];

/// Module-level dunder names that expose the interpreter's internals.
pub const BLOCKED_NAMES: &[&str] = &["__builtins__", "__loader__", "__spec__"];

/// The declarative rule set a [`PolicyEvaluator`] enforces.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    allowed_modules: BTreeSet<String>,
    blocked_builtins: BTreeSet<String>,
    blocked_names: BTreeSet<String>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self {
            allowed_modules: ALLOWED_MODULES.iter().map(|s| s.to_string()).collect(),
            blocked_builtins: BLOCKED_BUILTINS.iter().map(|s| s.to_string()).collect(),
            blocked_names: BLOCKED_NAMES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl PolicyTable {
    /// Allow an additional module (and, through the top-level rule, its
    /// submodules).
    pub fn allow_module(mut self, module: impl Into<String>) -> Self {
        self.allowed_modules.insert(module.into());
        self
    }

    /// Block an additional builtin name.
    pub fn block_builtin(mut self, name: impl Into<String>) -> Self {
        self.blocked_builtins.insert(name.into());
        self
    }

    /// Exact match or top-level package match.
    pub fn module_allowed(&self, module: &str) -> bool {
        if module.starts_with('.') {
            return false;
        }
        let top = module.split('.').next().unwrap_or(module);
        self.allowed_modules.contains(module) || self.allowed_modules.contains(top)
    }

    pub fn allowed_modules(&self) -> impl Iterator<Item = &str> {
        self.allowed_modules.iter().map(String::as_str)
    }
}

// ── Verdicts ───────────────────────────────────────────────────────

/// Category of a policy violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    ParseError,
    DisallowedImport,
    BlockedBuiltin,
    DunderAttribute,
}

/// The first disallowed construct in a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyViolation {
    pub kind: ViolationKind,
    pub line: usize,
    /// The offending module, name, or attribute. Empty for parse errors.
    pub construct: String,
    pub reason: String,
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Line {}: {}", self.line, self.reason)
    }
}

/// Code that passed policy evaluation. Only [`PolicyEvaluator::evaluate`]
/// constructs one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedCode {
    source: String,
}

impl AcceptedCode {
    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Outcome of evaluating a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyVerdict {
    Accept(AcceptedCode),
    Reject(PolicyViolation),
}

impl PolicyVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, PolicyVerdict::Accept(_))
    }
}

// ── Evaluator ──────────────────────────────────────────────────────

/// Checks submissions against a [`PolicyTable`].
#[derive(Debug, Clone, Default)]
pub struct PolicyEvaluator {
    table: PolicyTable,
}

impl PolicyEvaluator {
    pub fn new(table: PolicyTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &PolicyTable {
        &self.table
    }

    /// Evaluate a submission. Deterministic and side-effect free.
    pub fn evaluate(&self, code: &str) -> PolicyVerdict {
        let program = match Program::parse(code) {
            Ok(program) => program,
            Err(e) => {
                return PolicyVerdict::Reject(PolicyViolation {
                    kind: ViolationKind::ParseError,
                    line: e.line,
                    construct: String::new(),
                    reason: format!("Syntax error: {}", e.message),
                });
            }
        };

        match program.nodes.iter().find_map(|node| self.check(node)) {
            Some(violation) => PolicyVerdict::Reject(violation),
            None => PolicyVerdict::Accept(AcceptedCode {
                source: code.to_string(),
            }),
        }
    }

    fn check(&self, node: &Node) -> Option<PolicyViolation> {
        match node {
            Node::Import { module, line } if !self.table.module_allowed(module) => {
                let allowed: Vec<&str> = self.table.allowed_modules().collect();
                Some(PolicyViolation {
                    kind: ViolationKind::DisallowedImport,
                    line: *line,
                    construct: module.clone(),
                    reason: format!(
                        "import of '{module}' is not allowed. Allowed modules: {}",
                        allowed.join(", ")
                    ),
                })
            }
            Node::Call { callee, line } if self.table.blocked_builtins.contains(callee) => {
                Some(PolicyViolation {
                    kind: ViolationKind::BlockedBuiltin,
                    line: *line,
                    construct: callee.clone(),
                    reason: format!("call to '{callee}()' is not allowed."),
                })
            }
            Node::Reference { name, line }
                if self.table.blocked_builtins.contains(name)
                    || self.table.blocked_names.contains(name) =>
            {
                Some(PolicyViolation {
                    kind: ViolationKind::BlockedBuiltin,
                    line: *line,
                    construct: name.clone(),
                    reason: format!("use of '{name}' is not allowed."),
                })
            }
            Node::Attribute { name, line } if is_dunder(name) => Some(PolicyViolation {
                kind: ViolationKind::DunderAttribute,
                line: *line,
                construct: name.clone(),
                reason: format!("access to '{name}' is not allowed."),
            }),
            _ => None,
        }
    }
}

fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}
