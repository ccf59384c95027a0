//! REST and SSE endpoint handlers.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use toolchat::error::StoreError;
use toolchat::orchestrator::{Orchestrator, TurnRequest};
use toolchat::store::{Conversation, ConversationHeader, Store, StoredMessage};
use tracing::{error, info};

pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";

/// Shared application state passed to all handlers via axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub store: Store,
}

// ── Errors ─────────────────────────────────────────────────────────

/// A failed request, rendered as `{"error": "..."}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    fn conversation_not_found() -> Self {
        ApiError::NotFound("Conversation not found".to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) | ApiError::Store(StoreError::NotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Store(e) => {
                error!("Request failed: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

// ── Conversations ──────────────────────────────────────────────────

/// GET /api/conversations: newest first.
pub async fn list_conversations(
    State(app): State<AppState>,
) -> Result<Json<Vec<ConversationHeader>>, ApiError> {
    Ok(Json(app.store.list_conversations().await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateConversation {
    pub title: Option<String>,
}

/// POST /api/conversations: body optional.
pub async fn create_conversation(
    State(app): State<AppState>,
    body: Option<Json<CreateConversation>>,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    let Json(body) = body.unwrap_or_default();
    let title = body
        .title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| DEFAULT_CONVERSATION_TITLE.to_string());
    let conversation = app.store.create_conversation(&title).await?;
    info!("Created conversation {}", conversation.id);
    Ok((StatusCode::CREATED, Json(conversation)))
}

#[derive(Debug, Serialize)]
pub struct ConversationDetail {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub messages: Vec<StoredMessage>,
}

/// GET /api/conversations/{id}
pub async fn get_conversation(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConversationDetail>, ApiError> {
    let conversation = app
        .store
        .get_conversation(&id)
        .await?
        .ok_or_else(ApiError::conversation_not_found)?;
    let messages = app.store.messages(&id).await?;
    Ok(Json(ConversationDetail {
        conversation,
        messages,
    }))
}

/// DELETE /api/conversations/{id}: messages go with it.
pub async fn delete_conversation(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !app.store.delete_conversation(&id).await? {
        return Err(ApiError::conversation_not_found());
    }
    info!("Deleted conversation {id}");
    Ok(Json(serde_json::json!({ "ok": true })))
}

// ── Chat ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub conversation_id: Option<String>,
    pub message: String,
}

/// POST /api/chat: run one turn and stream its events as SSE.
///
/// Closing the connection drops the event stream, which cancels the turn.
pub async fn post_chat(
    State(app): State<AppState>,
    Json(body): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    if body.message.trim().is_empty() {
        return Err(ApiError::BadRequest("Message must not be empty".to_string()));
    }
    if let Some(id) = &body.conversation_id
        && !app.store.conversation_exists(id).await?
    {
        return Err(ApiError::conversation_not_found());
    }

    let turn = app
        .orchestrator
        .submit(TurnRequest::new(body.conversation_id, body.message));
    info!("Streaming turn for conversation {}", turn.conversation_id());

    let events = turn.map(|event| Event::default().json_data(&event));
    let sse = Sse::new(events).keep_alive(KeepAlive::default());
    Ok((
        [(
            HeaderName::from_static("x-accel-buffering"),
            HeaderValue::from_static("no"),
        )],
        sse,
    )
        .into_response())
}

/// GET /api/health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_deserializes() {
        let req: ChatRequest = serde_json::from_str(r#"{"message":"hi"}"#).unwrap();
        assert!(req.conversation_id.is_none());
        assert_eq!(req.message, "hi");

        let req: ChatRequest =
            serde_json::from_str(r#"{"conversation_id":"c1","message":"hi"}"#).unwrap();
        assert_eq!(req.conversation_id.as_deref(), Some("c1"));
    }

    #[test]
    fn error_statuses() {
        let resp = ApiError::conversation_not_found().into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = ApiError::BadRequest("x".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let resp = ApiError::Store(StoreError::NotFound("c".into())).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = ApiError::Store(StoreError::CoverageRegression {
            current: 2,
            proposed: 1,
        })
        .into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
