//! Integration tests for the toolchat-web server.
//!
//! These tests start a real axum server on a random port, backed by a
//! scripted generation backend and a temporary database, and exercise the
//! REST and SSE endpoints over HTTP.

use std::sync::Arc;

use futures::stream;
use tempfile::TempDir;
use toolchat::config::GatewayConfig;
use toolchat::tools::{SearchFuture, SearchService};
use toolchat::{
    ChatBackend, ChatCompletion, ChatRequest, CompletionFuture, EventStream, MessageRole,
    StreamEvent, ToolCall,
};
use toolchat_web::{WebConfig, spawn_web};

/// Answers from the last message: asks for `run_python` when the user says
/// "shell", otherwise replies directly. The streaming pass echoes the last
/// tool result.
struct ScriptedModel;

impl ChatBackend for ScriptedModel {
    fn complete(&self, request: ChatRequest) -> CompletionFuture<'_> {
        let last = request.messages.last().cloned();
        Box::pin(async move {
            let last = last.map(|m| m.content).unwrap_or_default();
            if last.contains("shell") {
                Ok(ChatCompletion {
                    tool_calls: vec![ToolCall::new(
                        "run_python",
                        serde_json::json!({ "code": "import os\nos.system('ls')" }),
                    )],
                    ..Default::default()
                })
            } else {
                Ok(ChatCompletion {
                    content: format!("You said: {last}"),
                    thinking: Some("easy".into()),
                    tool_calls: vec![],
                })
            }
        })
    }

    fn stream(&self, request: ChatRequest) -> EventStream {
        let tool_output = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Tool)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Box::pin(stream::iter(vec![
            Ok(StreamEvent::ContentDelta("That code was ".into())),
            Ok(StreamEvent::ContentDelta(if tool_output.contains("VALIDATION ERRORS") {
                "rejected.".into()
            } else {
                "accepted.".into()
            })),
            Ok(StreamEvent::Done),
        ]))
    }
}

struct NoSearch;

impl SearchService for NoSearch {
    fn search<'a>(&'a self, query: &'a str) -> SearchFuture<'a> {
        Box::pin(async move { Ok(format!("Web search results for: {query}\n")) })
    }
}

struct TestServer {
    base: String,
    dir: TempDir,
}

/// Spawn a test server on port 0 (random available port).
async fn spawn_test_server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let config = GatewayConfig::default()
        .with_database_path(dir.path().join("chat.db"))
        .with_artifact_root(dir.path().join("artifacts"));
    let gateway = config
        .build_with(Arc::new(ScriptedModel), Arc::new(NoSearch))
        .await
        .unwrap();

    let web = WebConfig {
        bind_addr: ([127, 0, 0, 1], 0).into(),
        ..Default::default()
    };
    let addr = spawn_web(gateway, web).await.unwrap();
    TestServer {
        base: format!("http://{addr}"),
        dir,
    }
}

/// POST /api/chat and collect the JSON payload of every SSE event.
async fn chat(base: &str, body: serde_json::Value) -> Vec<serde_json::Value> {
    let resp = reqwest::Client::new()
        .post(format!("{base}/api/chat"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let content_type = resp.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/event-stream"), "{content_type}");

    let text = resp.text().await.unwrap();
    text.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim_start()).unwrap())
        .collect()
}

fn types(events: &[serde_json::Value]) -> Vec<&str> {
    events.iter().map(|e| e["type"].as_str().unwrap()).collect()
}

// ── REST Tests ───────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_ok() {
    let server = spawn_test_server().await;
    let resp = reqwest::get(format!("{}/api/health", server.base)).await.unwrap();
    assert_eq!(resp.status(), 200);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn conversation_lifecycle() {
    let server = spawn_test_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/conversations", server.base))
        .json(&serde_json::json!({ "title": "Plots" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let created: serde_json::Value = resp.json().await.unwrap();
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["title"], "Plots");

    let list: serde_json::Value = reqwest::get(format!("{}/api/conversations", server.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["id"], id.as_str());

    let detail: serde_json::Value =
        reqwest::get(format!("{}/api/conversations/{id}", server.base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
    assert_eq!(detail["summary"], "");
    assert_eq!(detail["summary_up_to_index"], 0);
    assert!(detail["messages"].as_array().unwrap().is_empty());

    let resp = client
        .delete(format!("{}/api/conversations/{id}", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["ok"], true);

    let resp = reqwest::get(format!("{}/api/conversations/{id}", server.base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["error"], "Conversation not found");

    let resp = client
        .delete(format!("{}/api/conversations/{id}", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn create_without_body_uses_default_title() {
    let server = spawn_test_server().await;
    let resp = reqwest::Client::new()
        .post(format!("{}/api/conversations", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["title"], "New Conversation");
}

// ── Chat Tests ───────────────────────────────────────────────────────

#[tokio::test]
async fn chat_streams_and_persists_new_conversation() {
    let server = spawn_test_server().await;
    let events = chat(&server.base, serde_json::json!({ "message": "hello" })).await;

    assert_eq!(types(&events), vec!["thinking", "token", "done"]);
    assert_eq!(events[1]["content"], "You said: hello");
    let id = events[2]["conversation_id"].as_str().unwrap();

    let detail: serde_json::Value =
        reqwest::get(format!("{}/api/conversations/{id}", server.base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
    assert_eq!(detail["title"], "hello");
    let messages = detail["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["content"], "You said: hello");

    // A follow-up on the same conversation appends.
    let events = chat(
        &server.base,
        serde_json::json!({ "conversation_id": id, "message": "again" }),
    )
    .await;
    assert_eq!(events.last().unwrap()["conversation_id"], id);
    let detail: serde_json::Value =
        reqwest::get(format!("{}/api/conversations/{id}", server.base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
    assert_eq!(detail["messages"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn rejected_code_is_reported_to_model() {
    let server = spawn_test_server().await;
    let events = chat(
        &server.base,
        serde_json::json!({ "message": "open a shell for me" }),
    )
    .await;

    assert_eq!(types(&events)[0], "tool_status");
    let status = events[0]["content"].as_str().unwrap();
    assert!(status.starts_with("Python code rejected by policy"), "{status}");
    assert_eq!(events[1]["type"], "code_output");
    assert_eq!(events[1]["code"], "import os\nos.system('ls')");
    assert_eq!(events[1]["success"], false);
    assert_eq!(events[1]["images"], serde_json::json!([]));
    assert!(
        !events
            .iter()
            .any(|e| e["content"] == "Running Python code...")
    );
    let answer: String = events
        .iter()
        .filter(|e| e["type"] == "token")
        .map(|e| e["content"].as_str().unwrap())
        .collect();
    assert_eq!(answer, "That code was rejected.");
    assert_eq!(events.last().unwrap()["type"], "done");

    let id = events.last().unwrap()["conversation_id"].as_str().unwrap();
    let detail: serde_json::Value =
        reqwest::get(format!("{}/api/conversations/{id}", server.base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
    let roles: Vec<_> = detail["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["role"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(roles, vec!["user", "tool", "assistant"]);
}

#[tokio::test]
async fn chat_rejects_bad_requests() {
    let server = spawn_test_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/chat", server.base))
        .json(&serde_json::json!({ "message": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(format!("{}/api/chat", server.base))
        .json(&serde_json::json!({ "conversation_id": "nope", "message": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // Nothing was created by either request.
    let list: serde_json::Value = reqwest::get(format!("{}/api/conversations", server.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(list.as_array().unwrap().is_empty());
}

// ── Static Tests ─────────────────────────────────────────────────────

#[tokio::test]
async fn artifacts_are_served() {
    let server = spawn_test_server().await;
    let exec_dir = server.dir.path().join("artifacts").join("exec-1");
    std::fs::create_dir_all(&exec_dir).unwrap();
    std::fs::write(exec_dir.join("plot_1.png"), b"\x89PNG fake").unwrap();

    let resp = reqwest::get(format!("{}/api/code-output/exec-1/plot_1.png", server.base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "image/png");
    assert_eq!(resp.bytes().await.unwrap().as_ref(), b"\x89PNG fake");

    let resp = reqwest::get(format!("{}/api/code-output/exec-1/missing.png", server.base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn cors_allows_local_ui() {
    let server = spawn_test_server().await;
    let resp = reqwest::Client::new()
        .get(format!("{}/api/health", server.base))
        .header("origin", "http://localhost:5173")
        .send()
        .await
        .unwrap();
    assert_eq!(
        resp.headers()["access-control-allow-origin"],
        "http://localhost:5173"
    );

    let resp = reqwest::Client::new()
        .get(format!("{}/api/health", server.base))
        .header("origin", "http://evil.example")
        .send()
        .await
        .unwrap();
    assert!(resp.headers().get("access-control-allow-origin").is_none());
}
