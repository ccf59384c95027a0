//! Evaluate or execute a local Python file through the gateway's policy and
//! execution runner.
//!
//! # Examples
//!
//! ```sh
//! # Policy verdict only; nothing is executed
//! toolchat check analysis.py
//!
//! # Check, then run in the sandbox and print the result as JSON
//! toolchat run analysis.py --timeout 10
//!
//! # Read the program from stdin
//! echo 'print(2 + 2)' | toolchat run -
//! ```

use std::io::{self, Read};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{Parser, Subcommand};
use toolchat::policy::{PolicyEvaluator, PolicyVerdict};
use toolchat::sandbox::{ArtifactStore, ExecutionRunner, RunnerConfig};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Check or run Python code under the toolchat execution policy.
#[derive(Parser)]
#[command(name = "toolchat", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the policy verdict for a file.
    Check {
        /// Python source file, or `-` for stdin
        file: String,
    },
    /// Check a file, then execute it if accepted.
    Run {
        /// Python source file, or `-` for stdin
        file: String,

        /// Python interpreter to execute with
        #[arg(long, env = "TOOLCHAT_PYTHON", default_value = "python3")]
        python: PathBuf,

        /// Wall-clock limit in seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,

        /// Directory that receives produced images
        #[arg(long, env = "TOOLCHAT_ARTIFACTS", default_value = "code_outputs")]
        artifacts: PathBuf,
    },
}

fn read_source(file: &str) -> Result<String, String> {
    if file == "-" {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| format!("failed to read stdin: {e}"))?;
        Ok(buf)
    } else {
        std::fs::read_to_string(file).map_err(|e| format!("failed to read '{file}': {e}"))
    }
}

/// Returns whether the code was accepted (and, for `run`, succeeded).
async fn execute(cli: Cli) -> Result<bool, String> {
    let evaluator = PolicyEvaluator::default();
    match cli.command {
        Command::Check { file } => {
            let source = read_source(&file)?;
            match evaluator.evaluate(&source) {
                PolicyVerdict::Accept(_) => {
                    println!("accepted");
                    Ok(true)
                }
                PolicyVerdict::Reject(violation) => {
                    println!("rejected: {violation}");
                    Ok(false)
                }
            }
        }
        Command::Run {
            file,
            python,
            timeout,
            artifacts,
        } => {
            let source = read_source(&file)?;
            let code = match evaluator.evaluate(&source) {
                PolicyVerdict::Accept(code) => code,
                PolicyVerdict::Reject(violation) => {
                    eprintln!("rejected: {violation}");
                    return Ok(false);
                }
            };

            let store = ArtifactStore::new(artifacts);
            store
                .ensure_root()
                .await
                .map_err(|e| format!("failed to create artifact directory: {e}"))?;
            let config = RunnerConfig::default()
                .with_interpreter(python)
                .with_timeout(Duration::from_secs(timeout));
            let result = ExecutionRunner::new(config, store).run(&code).await;

            let json = serde_json::to_string_pretty(&result).map_err(|e| e.to_string())?;
            println!("{json}");
            Ok(result.success)
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();
    match execute(cli).await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(2);
        }
    }
}
