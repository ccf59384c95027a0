//! Error taxonomy for the gateway.
//!
//! Each layer owns one error enum. Failures that the model should see
//! (policy rejections, timeouts, non-zero exits) never appear here; they are
//! captured as data inside [`ExecutionResult`](crate::sandbox::ExecutionResult)
//! and [`ToolResult`](crate::tools::ToolResult). The enums below cover the
//! failures that end a turn or get swallowed with a fallback.

use thiserror::Error;

/// Failure talking to the generation service.
///
/// Surfaced to clients as a stream transport failure.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("generation service HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("failed to decode generation response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("generation service error: {0}")]
    Service(String),
}

impl GenerationError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            GenerationError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            GenerationError::Http { status, .. } => matches!(status, 429 | 500 | 502 | 503 | 504),
            GenerationError::Decode(_) | GenerationError::Service(_) => false,
        }
    }
}

/// Failure of the web-search provider or page fetcher.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search API key is not configured")]
    MissingApiKey,
    #[error("search request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("search service HTTP {status}: {body}")]
    Http { status: u16, body: String },
}

/// Failure of the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("conversation not found: {0}")]
    NotFound(String),
    #[error("summary coverage may not move backwards (current {current}, proposed {proposed})")]
    CoverageRegression { current: i64, proposed: i64 },
}

/// Summarization did not produce a usable summary. Always swallowed by the
/// context window manager, which keeps the previous summary.
#[derive(Debug, Error)]
pub enum SummarizationFailure {
    #[error("summary generation failed: {0}")]
    Generation(#[from] GenerationError),
    #[error("summary generation returned no text")]
    Empty,
    #[error("summary could not be stored: {0}")]
    Store(#[from] StoreError),
}

/// A failure that ends a turn in the error state. Nothing from the turn is
/// persisted once one of these is raised.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("{0}")]
    StreamTransport(#[from] GenerationError),
    #[error("tool service failure: {0}")]
    ToolService(String),
    #[error("failed to save conversation: {0}")]
    Persistence(#[from] StoreError),
}

/// Failure while assembling the gateway at startup.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to create generation client: {0}")]
    Generation(#[from] GenerationError),
    #[error("failed to create search client: {0}")]
    Search(#[from] SearchError),
    #[error("failed to open conversation store: {0}")]
    Store(#[from] StoreError),
    #[error("failed to prepare artifact directory: {0}")]
    Io(#[from] std::io::Error),
}
