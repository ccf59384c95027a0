//! Gateway configuration and component wiring.
//!
//! [`GatewayConfig`] holds every tunable with a working default and turns
//! into a running [`Gateway`] with [`build`](GatewayConfig::build).
//!
//! ```ignore
//! let gateway = GatewayConfig::default()
//!     .with_model("qwen3:8b")
//!     .with_database_path("/var/lib/toolchat/chat.db")
//!     .with_search_api_key(std::env::var("SERPER_API_KEY").ok())
//!     .build()
//!     .await?;
//! ```
//!
//! Tests and embedders that bring their own generation or search backend use
//! [`build_with`](GatewayConfig::build_with).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::api::RetryConfig;
use crate::context::{ContextWindowManager, Summarizer, SummarizerConfig, WindowConfig};
use crate::error::GatewayError;
use crate::orchestrator::{DEFAULT_SYSTEM_PROMPT, Orchestrator, OrchestratorConfig};
use crate::policy::{PolicyEvaluator, PolicyTable};
use crate::sandbox::{ArtifactStore, ExecutionRunner, RunnerConfig};
use crate::store::Store;
use crate::tools::{SearchConfig, SearchService, SerperSearch, ToolDispatcher};
use crate::{ChatBackend, DEFAULT_MODEL, DEFAULT_OLLAMA_URL, OllamaClient};

pub const DEFAULT_DATABASE_PATH: &str = "toolchat.db";
pub const DEFAULT_ARTIFACT_ROOT: &str = "code_outputs";
pub const DEFAULT_ARTIFACT_MAX_AGE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub ollama_url: String,
    pub model: String,
    /// Model used for conversation summaries. The main model when unset.
    pub summary_model: Option<String>,
    pub system_prompt: String,
    pub think: bool,
    pub database_path: PathBuf,
    /// Where execution artifacts are kept and served from.
    pub artifact_root: PathBuf,
    /// Artifact directories older than this are pruned at startup.
    pub artifact_max_age: Duration,
    pub runner: RunnerConfig,
    pub search: SearchConfig,
    pub window: WindowConfig,
    pub retry: RetryConfig,
    pub policy: PolicyTable,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            summary_model: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            think: true,
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            artifact_root: PathBuf::from(DEFAULT_ARTIFACT_ROOT),
            artifact_max_age: DEFAULT_ARTIFACT_MAX_AGE,
            runner: RunnerConfig::default(),
            search: SearchConfig::default(),
            window: WindowConfig::default(),
            retry: RetryConfig::with_retries(2),
            policy: PolicyTable::default(),
        }
    }
}

impl GatewayConfig {
    pub fn with_ollama_url(mut self, url: impl Into<String>) -> Self {
        self.ollama_url = url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_summary_model(mut self, model: Option<String>) -> Self {
        self.summary_model = model;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_think(mut self, think: bool) -> Self {
        self.think = think;
        self
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    pub fn with_artifact_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.artifact_root = root.into();
        self
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<PathBuf>) -> Self {
        self.runner = self.runner.with_interpreter(interpreter);
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.runner = self.runner.with_timeout(timeout);
        self
    }

    /// Empty keys count as unset.
    pub fn with_search_api_key(mut self, key: Option<String>) -> Self {
        self.search.api_key = key.filter(|k| !k.trim().is_empty());
        self
    }

    pub fn with_window(mut self, window: WindowConfig) -> Self {
        self.window = window;
        self
    }

    pub fn with_policy(mut self, policy: PolicyTable) -> Self {
        self.policy = policy;
        self
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            model: self.model.clone(),
            system_prompt: self.system_prompt.clone(),
            think: self.think,
            retry: self.retry.clone(),
            ..Default::default()
        }
    }

    /// Connect to Ollama and the search provider, open the store, and wire
    /// the orchestrator.
    pub async fn build(&self) -> Result<Gateway, GatewayError> {
        let backend = Arc::new(OllamaClient::new(&self.ollama_url)?);
        if self.search.api_key.is_none() {
            warn!("No search API key configured; web_search calls will fail");
        }
        let search = Arc::new(SerperSearch::new(self.search.clone())?);
        self.build_with(backend, search).await
    }

    /// Wire the gateway around the given generation and search backends.
    pub async fn build_with(
        &self,
        backend: Arc<dyn ChatBackend>,
        search: Arc<dyn SearchService>,
    ) -> Result<Gateway, GatewayError> {
        let store = Store::open(&self.database_path).await?;

        let artifacts = ArtifactStore::new(&self.artifact_root);
        artifacts.ensure_root().await?;
        match artifacts.prune_older_than(self.artifact_max_age).await {
            Ok(0) => {}
            Ok(n) => info!("Pruned {n} old artifact directories"),
            Err(e) => warn!("Failed to prune artifacts: {e}"),
        }

        let runner = Arc::new(ExecutionRunner::new(self.runner.clone(), artifacts.clone()));
        let tools = ToolDispatcher::new(
            PolicyEvaluator::new(self.policy.clone()),
            runner,
            search,
        );
        let summarizer = Summarizer::new(SummarizerConfig {
            model: self.summary_model.clone(),
            ..Default::default()
        });
        let context = ContextWindowManager::new(
            store.clone(),
            backend.clone(),
            self.model.as_str(),
            self.window.clone(),
        )
        .with_summarizer(summarizer);

        let orchestrator = Orchestrator::new(
            backend,
            context,
            tools,
            store.clone(),
            self.orchestrator_config(),
        );
        info!(
            "Gateway ready: model={}, database={}, artifacts={}",
            self.model,
            self.database_path.display(),
            self.artifact_root.display()
        );

        Ok(Gateway {
            orchestrator,
            store,
            artifacts,
        })
    }
}

/// The assembled gateway.
#[derive(Clone)]
pub struct Gateway {
    pub orchestrator: Orchestrator,
    pub store: Store,
    pub artifacts: ArtifactStore,
}

impl Gateway {
    /// Close the database pool.
    pub async fn shutdown(&self) {
        self.store.close().await;
    }
}
