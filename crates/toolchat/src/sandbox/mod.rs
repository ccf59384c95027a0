//! Isolated execution of policy-accepted Python code.
//!
//! Each execution gets a fresh child interpreter in its own scratch
//! directory, a cleared environment, a hard wall-clock limit, and capped
//! output. Plots are captured through a [`PlotSink`] and copied into the
//! [`ArtifactStore`] before the scratch directory is removed.
//!
//! The runner only accepts [`AcceptedCode`](crate::policy::AcceptedCode),
//! which can only be obtained from the policy evaluator.

pub mod artifacts;
pub mod plots;
pub mod runner;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;

pub use artifacts::{ARTIFACT_URL_PREFIX, ArtifactRef, ArtifactStore};
pub use plots::{MatplotlibFileSink, PlotSink};
pub use runner::ExecutionRunner;

use crate::policy::AcceptedCode;

/// Default wall-clock limit for a single execution.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// ── Configuration ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Interpreter binary, resolved through `PATH` when not absolute.
    pub interpreter: PathBuf,
    pub timeout: Duration,
    /// Stdout cap in bytes.
    pub max_stdout: usize,
    /// Stderr cap in bytes.
    pub max_stderr: usize,
    /// Parent directory for scratch directories. System temp dir if unset.
    pub scratch_base: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            interpreter: PathBuf::from("python3"),
            timeout: DEFAULT_TIMEOUT,
            max_stdout: 50_000,
            max_stderr: 10_000,
            scratch_base: None,
        }
    }
}

impl RunnerConfig {
    pub fn with_interpreter(mut self, interpreter: impl Into<PathBuf>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_scratch_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.scratch_base = Some(base.into());
        self
    }
}

// ── Results ────────────────────────────────────────────────────────

/// How an unsuccessful execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionFailure {
    Timeout,
    Fault,
}

/// Outcome of one execution. Produced for every run, including ones that
/// failed to start.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub success: bool,
    pub timed_out: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub artifacts: Vec<ArtifactRef>,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl ExecutionResult {
    pub(crate) fn failed_to_start(
        execution_id: String,
        message: String,
        elapsed: Duration,
    ) -> Self {
        Self {
            execution_id,
            success: false,
            timed_out: false,
            exit_code: None,
            stdout: String::new(),
            stderr: message,
            stdout_truncated: false,
            stderr_truncated: false,
            artifacts: Vec::new(),
            elapsed,
        }
    }

    pub fn failure(&self) -> Option<ExecutionFailure> {
        if self.success {
            None
        } else if self.timed_out {
            Some(ExecutionFailure::Timeout)
        } else {
            Some(ExecutionFailure::Fault)
        }
    }
}

// ── Executor seam ──────────────────────────────────────────────────

pub type ExecFuture<'a> = Pin<Box<dyn Future<Output = ExecutionResult> + Send + 'a>>;

/// Something that can run accepted code. Implemented by
/// [`ExecutionRunner`]; test doubles implement it to observe dispatch.
pub trait Executor: Send + Sync {
    fn execute<'a>(&'a self, code: &'a AcceptedCode) -> ExecFuture<'a>;
}
