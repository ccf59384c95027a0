//! toolchat HTTP server.
//!
//! Serves the REST API and SSE chat endpoint for a local Ollama model with
//! Python execution and web search tools.
//!
//! # Usage
//!
//! ```bash
//! toolchat-web
//! toolchat-web --model qwen3:8b --port 8080
//! SERPER_API_KEY=... OLLAMA_BASE_URL=http://gpu-box:11434 toolchat-web
//! RUST_LOG=debug toolchat-web
//! ```
//!
//! Then chat with `curl -N`:
//!
//! ```bash
//! curl -N -X POST localhost:8000/api/chat \
//!   -H 'content-type: application/json' \
//!   -d '{"message": "What is 2 + 2? Use Python."}'
//! ```

use std::path::PathBuf;
use std::process;

use clap::Parser;
use toolchat::config::GatewayConfig;
use toolchat::{DEFAULT_MODEL, DEFAULT_OLLAMA_URL};
use toolchat_web::{DEFAULT_CORS_ORIGIN, WebConfig, build_and_run};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Tool-augmented chat gateway for a local model.
#[derive(Parser)]
#[command(name = "toolchat-web", version)]
struct Args {
    /// Base URL of the Ollama server.
    #[arg(long, env = "OLLAMA_BASE_URL", default_value = DEFAULT_OLLAMA_URL)]
    ollama_url: String,

    /// Model used for chat and summaries.
    #[arg(long, env = "OLLAMA_MODEL", default_value = DEFAULT_MODEL)]
    model: String,

    /// Serper API key for web_search.
    #[arg(long, env = "SERPER_API_KEY", hide_env_values = true)]
    serper_api_key: Option<String>,

    /// SQLite database file.
    #[arg(long, env = "TOOLCHAT_DB", default_value = "toolchat.db")]
    db: PathBuf,

    /// Directory for execution artifacts.
    #[arg(long, env = "TOOLCHAT_ARTIFACTS", default_value = "code_outputs")]
    artifacts: PathBuf,

    /// Python interpreter used for run_python.
    #[arg(long, env = "TOOLCHAT_PYTHON", default_value = "python3")]
    python: PathBuf,

    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on.
    #[arg(long, env = "TOOLCHAT_PORT", default_value_t = 8000)]
    port: u16,

    /// Allowed CORS origin (repeatable).
    #[arg(long = "cors-origin", default_value = DEFAULT_CORS_ORIGIN)]
    cors_origins: Vec<String>,

    /// Disable separate chain-of-thought output.
    #[arg(long)]
    no_think: bool,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,toolchat=debug,toolchat_web=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[tokio::main]
async fn main() {
    init_tracing();
    let args = Args::parse();

    let bind_addr = match format!("{}:{}", args.host, args.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("Error: invalid bind address '{}:{}': {e}", args.host, args.port);
            process::exit(2);
        }
    };

    let config = GatewayConfig::default()
        .with_ollama_url(args.ollama_url)
        .with_model(args.model)
        .with_search_api_key(args.serper_api_key)
        .with_database_path(args.db)
        .with_artifact_root(args.artifacts)
        .with_interpreter(args.python)
        .with_think(!args.no_think);
    let web = WebConfig {
        bind_addr,
        cors_origins: args.cors_origins,
    };

    if let Err(e) = build_and_run(&config, web, shutdown_signal()).await {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
