//! Tool-augmented streaming chat gateway.
//!
//! `toolchat` sits between a chat front end and a local
//! [Ollama](https://ollama.com/) model and gives the model two capabilities it
//! cannot safely exercise on its own: running short numeric Python programs
//! and reading live web content. Every user turn is driven by the
//! [`Orchestrator`](orchestrator::Orchestrator), a small state machine that
//! asks the model whether it needs a tool, runs the tools, and then streams
//! the final answer back as [`TurnEvent`](orchestrator::TurnEvent)s.
//!
//! # Getting started
//!
//! ```ignore
//! use std::sync::Arc;
//! use toolchat::config::GatewayConfig;
//! use toolchat::orchestrator::TurnRequest;
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfig::default();
//!     let gateway = config.build().await?;
//!
//!     let mut turn = gateway
//!         .orchestrator
//!         .submit(TurnRequest::new(None, "What is 2 + 2? Use Python."));
//!     while let Some(event) = turn.next().await {
//!         println!("{}", serde_json::to_string(&event)?);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`policy`] | Static policy evaluation of untrusted Python before it runs |
//! | [`sandbox`] | Isolated, time- and output-bounded execution with plot capture |
//! | [`context`] | Sliding window plus running summary over conversation history |
//! | [`tools`] | Closed tool set (`web_search`, `run_python`) and the dispatcher |
//! | [`orchestrator`] | Per-turn state machine, event stream, per-conversation ordering |
//! | [`store`] | SQLite persistence for conversations, messages, and summaries |
//! | [`api`] | NDJSON streaming from the generation service, retry with backoff |
//! | [`config`] | Gateway configuration and component wiring |
//!
//! # Design principles
//!
//! 1. **Check before you run.** Code reaches the execution runner only as
//!    [`AcceptedCode`](policy::AcceptedCode), which nothing but the policy
//!    evaluator can construct.
//!
//! 2. **Every resource is scoped.** The child process and its scratch
//!    directory live and die together, whether the execution finishes, times
//!    out, or the client walks away mid-turn.
//!
//! 3. **A turn commits whole or not at all.** Messages are written in one
//!    transaction after the answer is complete. A failed turn leaves the
//!    conversation exactly as it was.

pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod orchestrator;
pub mod policy;
pub mod sandbox;
pub mod store;
pub mod tools;

#[cfg(test)]
mod test_support;

use std::future::Future;
use std::pin::Pin;

use futures::Stream;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

pub use api::streaming::StreamEvent;
pub use error::GenerationError;

// ── Constants ──────────────────────────────────────────────────────

/// Default base URL of the generation service.
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Default model for all generation calls.
pub const DEFAULT_MODEL: &str = "qwen3.5:35b-a3b";

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`. Tool parameter schemas are derived from the
/// argument structs the dispatcher parses into.
///
/// # Example
///
/// ```
/// use toolchat::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct SearchArgs {
///     query: String,
/// }
///
/// let schema = json_schema_for::<SearchArgs>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["required"].as_array().unwrap().contains(&"query".into()));
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Request types ──────────────────────────────────────────────────

/// Request body for the generation service's `/api/chat` endpoint.
#[derive(Serialize, Debug, Clone, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDef>>,
    /// Ask thinking-capable models to return their chain of thought
    /// separately from the answer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub think: Option<bool>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            ..Default::default()
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDef>) -> Self {
        self.tools = if tools.is_empty() { None } else { Some(tools) };
        self
    }

    pub fn with_think(mut self, think: bool) -> Self {
        self.think = Some(think);
        self
    }
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }

    /// Parse a stored role name. Returns `None` for anything unrecognized.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(MessageRole::System),
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "tool" => Some(MessageRole::Tool),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message in the prompt sent to the generation service.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Name of the tool that produced a `tool` message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            thinking: None,
            tool_calls: None,
            tool_name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// The assistant turn that requested tool calls. Any filler text from
    /// the first pass is left out.
    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: Some(calls),
            ..Self::new(MessageRole::Assistant, "")
        }
    }

    pub fn tool_result(tool_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_name: Some(tool_name.into()),
            ..Self::new(MessageRole::Tool, content)
        }
    }
}

// ── Tool types ─────────────────────────────────────────────────────

/// The type of a tool definition. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ToolType {
    #[serde(rename = "function")]
    Function,
}

/// Tool definition sent to the generation service (function-calling format).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    pub function: FunctionDef,
}

impl ToolDef {
    /// Create a function-calling tool definition.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: ToolType::Function,
            function: FunctionDef {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A tool call returned by the model's first pass.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolCall {
    pub function: FunctionCallData,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FunctionCallData {
    pub name: String,
    /// Usually a JSON object, but some models send the object encoded as a
    /// string. Use [`ToolCall::arguments_object`] to read it.
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            function: FunctionCallData {
                name: name.into(),
                arguments,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }

    /// The call's arguments as a JSON object. String-encoded objects are
    /// decoded; anything unparseable yields an empty object.
    pub fn arguments_object(&self) -> serde_json::Map<String, serde_json::Value> {
        match &self.function.arguments {
            serde_json::Value::Object(map) => map.clone(),
            serde_json::Value::String(s) => serde_json::from_str(s).unwrap_or_default(),
            _ => serde_json::Map::new(),
        }
    }
}

// ── Response types ─────────────────────────────────────────────────

/// Raw API response (internal deserialization target).
#[derive(Deserialize, Debug)]
struct RawChatResponse {
    message: Option<RawResponseMessage>,
    error: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    #[serde(default)]
    content: String,
    thinking: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
}

/// Clean return type from a non-streaming generation call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatCompletion {
    pub content: String,
    /// Chain-of-thought text, when the model produced any.
    pub thinking: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

// ── Backend trait ──────────────────────────────────────────────────

/// Boxed future returned by [`ChatBackend::complete`].
pub type CompletionFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ChatCompletion, GenerationError>> + Send + 'a>>;

/// Stream of incremental events returned by [`ChatBackend::stream`].
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, GenerationError>> + Send>>;

/// The generation service as seen by the rest of the gateway.
///
/// [`OllamaClient`] is the production implementation; tests substitute
/// scripted backends.
pub trait ChatBackend: Send + Sync {
    /// One non-streaming generation pass.
    fn complete(&self, request: ChatRequest) -> CompletionFuture<'_>;

    /// A streaming generation pass. The stream owns everything it needs, so
    /// dropping it cancels the underlying request.
    fn stream(&self, request: ChatRequest) -> EventStream;
}

// ── Client ─────────────────────────────────────────────────────────

/// Async HTTP client for an Ollama-compatible `/api/chat` endpoint.
#[derive(Clone, Debug)]
pub struct OllamaClient {
    pub(crate) client: reqwest::Client,
    pub(crate) base_url: String,
}

impl OllamaClient {
    /// Create a new client for the service at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, GenerationError> {
        // Local models can take minutes on a cold start; only the connect
        // phase is bounded tightly.
        let client = reqwest::Client::builder()
            .user_agent(concat!("toolchat/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub(crate) fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    /// Send a non-streaming chat request.
    pub async fn chat(&self, body: &ChatRequest) -> Result<ChatCompletion, GenerationError> {
        let tool_count = body.tools.as_ref().map_or(0, |t| t.len());
        debug!(
            "LLM request: model={}, messages={}, tools={}",
            body.model,
            body.messages.len(),
            tool_count,
        );
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(body).map_or(0, |s| s.len())
        );

        let start = Instant::now();

        let mut body = body.clone();
        body.stream = false;
        let resp = self.client.post(self.chat_url()).json(&body).send().await?;

        let status = resp.status();
        let text = resp.text().await?;

        debug!(
            "LLM response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(GenerationError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        parse_completion(&text)
    }
}

/// Decode a non-streaming `/api/chat` response body.
fn parse_completion(text: &str) -> Result<ChatCompletion, GenerationError> {
    let parsed: RawChatResponse = serde_json::from_str(text)?;

    if let Some(err) = parsed.error {
        return Err(GenerationError::Service(err));
    }

    let completion = match parsed.message {
        Some(m) => ChatCompletion {
            content: m.content,
            thinking: m.thinking.filter(|t| !t.is_empty()),
            tool_calls: m.tool_calls.unwrap_or_default(),
        },
        None => ChatCompletion::default(),
    };
    debug!(
        "LLM output: {} chars text, {} tool call(s)",
        completion.content.len(),
        completion.tool_calls.len()
    );
    Ok(completion)
}

impl ChatBackend for OllamaClient {
    fn complete(&self, request: ChatRequest) -> CompletionFuture<'_> {
        Box::pin(async move { self.chat(&request).await })
    }

    fn stream(&self, request: ChatRequest) -> EventStream {
        self.chat_stream(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors() {
        let sys = Message::system("hello");
        assert_eq!(sys.role, MessageRole::System);
        assert_eq!(sys.content, "hello");

        let user = Message::user("world");
        assert_eq!(user.role, MessageRole::User);

        let assist = Message::assistant_text("answer");
        assert_eq!(assist.role, MessageRole::Assistant);
        assert_eq!(assist.content, "answer");

        let tool = Message::tool_result("web_search", "result");
        assert_eq!(tool.role, MessageRole::Tool);
        assert_eq!(tool.tool_name.as_deref(), Some("web_search"));
    }

    #[test]
    fn chat_request_skips_none_fields() {
        let req = ChatRequest::new("test-model", vec![Message::user("hi")]);
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("tools").is_none());
        assert!(json.get("think").is_none());
        assert_eq!(json["stream"], false);
        assert!(json["messages"][0].get("tool_calls").is_none());
    }

    #[test]
    fn empty_tool_list_is_omitted() {
        let req = ChatRequest::new("m", vec![]).with_tools(vec![]);
        assert!(req.tools.is_none());
    }

    #[test]
    fn role_round_trips_through_storage_names() {
        for role in [
            MessageRole::System,
            MessageRole::User,
            MessageRole::Assistant,
            MessageRole::Tool,
        ] {
            assert_eq!(MessageRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(MessageRole::parse("narrator"), None);
    }

    #[test]
    fn arguments_accept_object_or_encoded_string() {
        let call = ToolCall::new("web_search", serde_json::json!({"query": "rust"}));
        assert_eq!(call.arguments_object()["query"], "rust");

        let call = ToolCall::new(
            "web_search",
            serde_json::Value::String(r#"{"query":"tokio"}"#.into()),
        );
        assert_eq!(call.arguments_object()["query"], "tokio");

        let call = ToolCall::new("web_search", serde_json::Value::String("not json".into()));
        assert!(call.arguments_object().is_empty());
    }

    #[test]
    fn parse_completion_with_tool_calls() {
        let body = r#"{
            "model": "m",
            "message": {
                "role": "assistant",
                "content": "",
                "thinking": "I should compute this.",
                "tool_calls": [{"function": {"name": "run_python", "arguments": {"code": "print(2+2)"}}}]
            },
            "done": true
        }"#;
        let completion = parse_completion(body).unwrap();
        assert_eq!(completion.tool_calls.len(), 1);
        assert_eq!(completion.tool_calls[0].name(), "run_python");
        assert_eq!(
            completion.thinking.as_deref(),
            Some("I should compute this.")
        );
    }

    #[test]
    fn parse_completion_error_field() {
        let err = parse_completion(r#"{"error": "model 'x' not found"}"#).unwrap_err();
        assert!(matches!(err, GenerationError::Service(ref m) if m.contains("not found")));
    }

    #[test]
    fn parse_completion_empty_thinking_dropped() {
        let body = r#"{"message": {"role": "assistant", "content": "Hi", "thinking": ""}}"#;
        let completion = parse_completion(body).unwrap();
        assert_eq!(completion.content, "Hi");
        assert!(completion.thinking.is_none());
    }
}
