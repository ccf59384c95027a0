//! The execution runner: one child interpreter per accepted submission.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Instant;

use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    ArtifactRef, ArtifactStore, ExecFuture, ExecutionResult, Executor, MatplotlibFileSink,
    PlotSink, RunnerConfig,
};
use crate::policy::AcceptedCode;

const SCRIPT_NAME: &str = "main.py";

// ── Scoped resource ────────────────────────────────────────────────

/// A child process and its scratch directory, released together.
///
/// Dropping a `Sandbox` kills the child (`kill_on_drop`) and then removes the
/// directory, so cancellation of the owning task leaves nothing behind.
struct Sandbox {
    // Field order matters: the child is killed before the directory goes.
    child: Option<Child>,
    dir: TempDir,
}

impl Sandbox {
    fn create(base: Option<&Path>) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("toolchat-exec-");
        let dir = match base {
            Some(base) => {
                std::fs::create_dir_all(base)?;
                builder.tempdir_in(base)?
            }
            None => builder.tempdir()?,
        };
        Ok(Self { child: None, dir })
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Release both halves, reporting any failure to remove the directory.
    async fn close(mut self) -> io::Result<()> {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
        }
        self.dir.close()
    }
}

// ── Output capture ─────────────────────────────────────────────────

/// Byte buffer that keeps at most `cap` bytes and drains the rest.
struct CappedBuffer {
    bytes: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl CappedBuffer {
    fn new(cap: usize) -> Self {
        Self {
            bytes: Vec::new(),
            cap,
            truncated: false,
        }
    }

    fn push(&mut self, data: &[u8]) {
        let room = self.cap.saturating_sub(self.bytes.len());
        if data.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&data[..data.len().min(room)]);
    }

    /// Decode as UTF-8. A multi-byte character split by the cap is dropped
    /// rather than replaced.
    fn into_text(self) -> String {
        match String::from_utf8(self.bytes) {
            Ok(s) => s,
            Err(e) => {
                let utf8_error = e.utf8_error();
                let bytes = e.into_bytes();
                if utf8_error.error_len().is_none() {
                    String::from_utf8_lossy(&bytes[..utf8_error.valid_up_to()]).into_owned()
                } else {
                    String::from_utf8_lossy(&bytes).into_owned()
                }
            }
        }
    }
}

async fn drain_into<R: AsyncRead + Unpin>(mut reader: R, buf: &mut CappedBuffer) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.push(&chunk[..n]),
        }
    }
}

/// The environment forwarded to the child. No credentials are inherited.
fn sandbox_env(scratch: &Path) -> Vec<(String, String)> {
    vec![
        (
            "PATH".into(),
            std::env::var("PATH")
                .unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string()),
        ),
        ("HOME".into(), scratch.to_string_lossy().into_owned()),
        ("TERM".into(), "dumb".into()),
        (
            "LANG".into(),
            std::env::var("LANG").unwrap_or_else(|_| "C.UTF-8".to_string()),
        ),
        ("PYTHONDONTWRITEBYTECODE".into(), "1".into()),
        ("PYTHONUNBUFFERED".into(), "1".into()),
        ("PYTHONIOENCODING".into(), "utf-8".into()),
    ]
}

enum Completion {
    Exited(ExitStatus),
    TimedOut,
    WaitFailed(io::Error),
}

// ── Runner ─────────────────────────────────────────────────────────

/// Runs accepted code in a fresh child interpreter with a hard wall-clock
/// limit and capped output.
pub struct ExecutionRunner {
    config: RunnerConfig,
    artifacts: ArtifactStore,
    plots: Arc<dyn PlotSink>,
}

impl ExecutionRunner {
    pub fn new(config: RunnerConfig, artifacts: ArtifactStore) -> Self {
        Self {
            config,
            artifacts,
            plots: Arc::new(MatplotlibFileSink),
        }
    }

    /// Replace the plot capture strategy.
    pub fn with_plot_sink(mut self, sink: Arc<dyn PlotSink>) -> Self {
        self.plots = sink;
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Execute `code`. Always produces exactly one result; failures are
    /// reported inside it.
    pub async fn run(&self, code: &AcceptedCode) -> ExecutionResult {
        let execution_id = Uuid::new_v4().to_string();
        let start = Instant::now();

        let sandbox = match Sandbox::create(self.config.scratch_base.as_deref()) {
            Ok(sandbox) => sandbox,
            Err(e) => {
                warn!("Failed to create scratch directory: {e}");
                return ExecutionResult::failed_to_start(
                    execution_id,
                    format!("Failed to create scratch directory: {e}"),
                    start.elapsed(),
                );
            }
        };
        debug!(
            "Execution {execution_id}: scratch dir {}",
            sandbox.path().display()
        );

        let mut sandbox = sandbox;
        let mut stdout = CappedBuffer::new(self.config.max_stdout);
        let mut stderr = CappedBuffer::new(self.config.max_stderr);
        let completion = self
            .execute_in(&mut sandbox, code, &mut stdout, &mut stderr)
            .await;

        let artifacts = self.collect_artifacts(&execution_id, sandbox.path()).await;
        if let Err(e) = sandbox.close().await {
            warn!("Failed to remove scratch directory for {execution_id}: {e}");
        }

        let stdout_truncated = stdout.truncated;
        let stderr_truncated = stderr.truncated;
        let stdout = stdout.into_text();
        let mut stderr = stderr.into_text();

        let (success, timed_out, exit_code) = match completion {
            Ok(Completion::Exited(status)) => (status.success(), false, status.code()),
            Ok(Completion::TimedOut) => {
                if !stderr.is_empty() && !stderr.ends_with('\n') {
                    stderr.push('\n');
                }
                stderr.push_str(&format!(
                    "Execution timed out after {} seconds.",
                    self.config.timeout.as_secs()
                ));
                (false, true, None)
            }
            Ok(Completion::WaitFailed(e)) => {
                stderr.push_str(&format!("Failed to wait for interpreter: {e}"));
                (false, false, None)
            }
            Err(e) => {
                stderr = format!(
                    "Failed to start Python interpreter '{}': {e}",
                    self.config.interpreter.display()
                );
                (false, false, None)
            }
        };

        let elapsed = start.elapsed();
        info!(
            "Execution {execution_id}: success={success}, timed_out={timed_out}, stdout={} bytes, stderr={} bytes, artifacts={}, {:.1}s",
            stdout.len(),
            stderr.len(),
            artifacts.len(),
            elapsed.as_secs_f64()
        );

        ExecutionResult {
            execution_id,
            success,
            timed_out,
            exit_code,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            artifacts,
            elapsed,
        }
    }

    /// Spawn the child inside `sandbox` and wait for it, up to the timeout.
    /// `Err` means the child never started.
    async fn execute_in(
        &self,
        sandbox: &mut Sandbox,
        code: &AcceptedCode,
        stdout: &mut CappedBuffer,
        stderr: &mut CappedBuffer,
    ) -> io::Result<Completion> {
        let scratch = sandbox.path().to_path_buf();
        tokio::fs::write(scratch.join(SCRIPT_NAME), code.source()).await?;
        let plot_env = self.plots.prepare(&scratch)?;

        let mut child = Command::new(&self.config.interpreter)
            .args(["-B", "-u", "-s", SCRIPT_NAME])
            .current_dir(&scratch)
            .env_clear()
            .envs(sandbox_env(&scratch))
            .envs(plot_env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let child_stdout = child.stdout.take();
        let child_stderr = child.stderr.take();
        let child = sandbox.child.insert(child);

        let io = async {
            let read_stdout = async {
                if let Some(out) = child_stdout {
                    drain_into(out, stdout).await;
                }
            };
            let read_stderr = async {
                if let Some(err) = child_stderr {
                    drain_into(err, stderr).await;
                }
            };
            let (_, _, status) = tokio::join!(read_stdout, read_stderr, child.wait());
            status
        };

        let completion = match tokio::time::timeout(self.config.timeout, io).await {
            Ok(Ok(status)) => Completion::Exited(status),
            Ok(Err(e)) => Completion::WaitFailed(e),
            Err(_elapsed) => {
                warn!(
                    "Execution exceeded {}s limit, killing interpreter",
                    self.config.timeout.as_secs()
                );
                Completion::TimedOut
            }
        };

        if let Some(child) = sandbox.child.as_mut() {
            // Reap (or kill, after a timeout) before the scratch dir is read.
            let _ = child.kill().await;
        }
        Ok(completion)
    }

    async fn collect_artifacts(&self, execution_id: &str, scratch: &Path) -> Vec<ArtifactRef> {
        let files: Vec<PathBuf> = match self.plots.collect(scratch) {
            Ok(files) => files,
            Err(e) => {
                warn!("Failed to collect plots for {execution_id}: {e}");
                return Vec::new();
            }
        };
        match self.artifacts.store(execution_id, &files).await {
            Ok(refs) => refs,
            Err(e) => {
                warn!("Failed to store artifacts for {execution_id}: {e}");
                Vec::new()
            }
        }
    }
}

impl Executor for ExecutionRunner {
    fn execute<'a>(&'a self, code: &'a AcceptedCode) -> ExecFuture<'a> {
        Box::pin(self.run(code))
    }
}
