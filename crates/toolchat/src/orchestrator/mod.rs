//! The streaming orchestrator: one state machine per user turn.
//!
//! [`Orchestrator::submit`] queues a turn behind any earlier turns on the
//! same conversation, spawns it, and returns a [`TurnStream`] of
//! [`TurnEvent`]s. Each turn:
//!
//! 1. **Init**: builds the context window, appends the user message, and asks
//!    the model (non-streaming, tools enabled) whether it needs a tool.
//! 2. **ToolExec** (only when tools were requested): dispatches each call in
//!    order, announcing each with a `tool_status` event. Python calls are
//!    followed by a `code_output` event.
//! 3. **Streaming**: streams the final answer (tools disabled), or replays
//!    the first pass when it already answered.
//! 4. **Done**: commits user, tool, and assistant messages in one
//!    transaction, then emits `done`. Any failure instead emits `error` and
//!    writes nothing.
//!
//! Dropping the [`TurnStream`] aborts the turn, which cancels the in-flight
//! generation request and kills any running child process.

pub mod events;
pub mod locks;
pub mod state;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use events::TurnEvent;
pub use locks::{ConversationLocks, TurnTicket};
pub use state::{Transition, TurnState};

use crate::api::{RetryConfig, retry_generation};
use crate::context::{ContextWindow, ContextWindowManager};
use crate::error::TurnError;
use crate::store::{Store, TurnRecord};
use crate::tools::{ToolDispatcher, tool_definitions};
use crate::{ChatBackend, ChatRequest, DEFAULT_MODEL, Message, MessageRole, StreamEvent};

/// Maximum characters of the first message used as a conversation title.
const TITLE_CHARS: usize = 50;

pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a helpful assistant running locally. You can search the web with the \
web_search tool for current information, and run Python with the run_python tool \
for calculations, data analysis, and charts. Use a tool when it gives a better \
answer than you can from memory. When code produces an image, mention that the \
chart is shown below your answer.";

// ── Configuration ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub model: String,
    pub system_prompt: String,
    /// Ask the model for separate chain-of-thought.
    pub think: bool,
    /// Retry policy for the first generation pass.
    pub retry: RetryConfig,
    /// Events buffered between a turn and its client.
    pub channel_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            think: true,
            retry: RetryConfig::with_retries(2),
            channel_capacity: 64,
        }
    }
}

/// A user message to process.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    /// `None` starts a new conversation.
    pub conversation_id: Option<String>,
    pub message: String,
}

impl TurnRequest {
    pub fn new(conversation_id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            conversation_id,
            message: message.into(),
        }
    }
}

/// Title for a conversation started by `message`.
pub fn conversation_title(message: &str) -> String {
    let mut title: String = message.chars().take(TITLE_CHARS).collect();
    title = title.trim().to_string();
    if message.chars().count() > TITLE_CHARS {
        title.push_str("...");
    }
    title
}

// ── Orchestrator ───────────────────────────────────────────────────

struct Shared {
    backend: Arc<dyn ChatBackend>,
    context: ContextWindowManager,
    tools: ToolDispatcher,
    store: Store,
    locks: ConversationLocks,
    config: OrchestratorConfig,
}

#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        context: ContextWindowManager,
        tools: ToolDispatcher,
        store: Store,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                context,
                tools,
                store,
                locks: ConversationLocks::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &Store {
        &self.shared.store
    }

    /// Queue and start a turn. The turn's place in its conversation's queue
    /// is fixed before this returns.
    pub fn submit(&self, request: TurnRequest) -> TurnStream {
        let (conversation_id, is_new) = match request.conversation_id {
            Some(id) => (id, false),
            None => (Uuid::new_v4().to_string(), true),
        };
        let ticket = self.shared.locks.ticket(&conversation_id);
        let (tx, rx) = mpsc::channel(self.shared.config.channel_capacity.max(1));

        let turn = Turn {
            shared: self.shared.clone(),
            conversation_id: conversation_id.clone(),
            is_new,
            user_message: request.message,
            state: TurnState::Init,
            tx,
            saw_token: false,
            answer: String::new(),
            tool_messages: Vec::new(),
        };
        let task = tokio::spawn(turn.run(ticket));

        TurnStream {
            conversation_id,
            rx,
            task,
        }
    }
}

// ── Event stream ───────────────────────────────────────────────────

/// Events of one turn, ending with `done` or `error`. Dropping the stream
/// aborts the turn.
pub struct TurnStream {
    conversation_id: String,
    rx: mpsc::Receiver<TurnEvent>,
    task: JoinHandle<()>,
}

impl TurnStream {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }
}

impl Stream for TurnStream {
    type Item = TurnEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<TurnEvent>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for TurnStream {
    fn drop(&mut self) {
        if !self.task.is_finished() {
            debug!("Turn on {} abandoned by client", self.conversation_id);
            self.task.abort();
        }
    }
}

// ── Turn ───────────────────────────────────────────────────────────

struct Turn {
    shared: Arc<Shared>,
    conversation_id: String,
    is_new: bool,
    user_message: String,
    state: TurnState,
    tx: mpsc::Sender<TurnEvent>,
    /// Thinking is only forwarded until the first answer token.
    saw_token: bool,
    answer: String,
    tool_messages: Vec<String>,
}

impl Turn {
    async fn run(mut self, mut ticket: TurnTicket) {
        ticket.wait().await;
        info!(
            "Turn started on {} ({})",
            self.conversation_id,
            if self.is_new { "new" } else { "existing" }
        );

        match self.drive().await {
            Ok(()) => {
                let conversation_id = self.conversation_id.clone();
                self.emit(TurnEvent::Done { conversation_id }).await;
                info!(
                    "Turn finished on {}: {} chars, {} tool message(s)",
                    self.conversation_id,
                    self.answer.len(),
                    self.tool_messages.len()
                );
            }
            Err(e) => {
                warn!("Turn failed on {} in {}: {e}", self.conversation_id, self.state);
                self.transition(Transition::Failed);
                self.emit(TurnEvent::Error {
                    content: e.to_string(),
                })
                .await;
            }
        }
        // The ticket is held until the turn's outcome is final.
        drop(ticket);
    }

    async fn drive(&mut self) -> Result<(), TurnError> {
        let shared = self.shared.clone();
        let config = &shared.config;

        // Init
        let context = if self.is_new {
            ContextWindow::empty()
        } else {
            shared.context.build_context(&self.conversation_id).await?
        };
        let mut messages = context.to_messages(&config.system_prompt);
        messages.push(Message::user(self.user_message.clone()));
        debug!(
            "Context for {}: {} recent, coverage {}/{}",
            self.conversation_id,
            context.recent.len(),
            context.coverage,
            context.total
        );

        let first_request = ChatRequest::new(config.model.as_str(), messages.clone())
            .with_tools(tool_definitions())
            .with_think(config.think);
        let first = retry_generation(&config.retry, || {
            shared.backend.complete(first_request.clone())
        })
        .await?;
        info!(
            "First pass: tool_calls={}, content_len={}, thinking_len={}",
            first.tool_calls.len(),
            first.content.len(),
            first.thinking.as_deref().map_or(0, str::len)
        );

        if let Some(thinking) = &first.thinking {
            self.emit(TurnEvent::thinking(thinking.clone())).await;
        }

        if !first.tool_calls.is_empty() {
            self.transition(Transition::ToolCallsSignaled);
            messages.push(Message::assistant_tool_calls(first.tool_calls.clone()));
            for call in &first.tool_calls {
                let prepared = shared.tools.prepare(call);
                self.emit(TurnEvent::tool_status(prepared.status_line())).await;
                let result = shared.tools.dispatch(prepared).await;
                if let Some(output) = &result.code_output {
                    self.emit(TurnEvent::code_output(output.clone())).await;
                }
                if let Some(failure) = result.failure.filter(|f| f.is_fatal()) {
                    debug!("{} failed with {failure:?}", result.tool);
                    return Err(TurnError::ToolService(result.content));
                }
                messages.push(Message::tool_result(result.tool.clone(), result.content.clone()));
                self.tool_messages.push(result.content);
            }
            self.transition(Transition::ToolsFinished);
            self.stream_answer(messages).await?;
        } else {
            self.transition(Transition::NoToolCalls);
            if first.content.is_empty() {
                self.stream_answer(messages).await?;
            } else {
                self.push_token(first.content).await;
            }
        }

        self.commit().await?;
        self.transition(Transition::Committed);
        Ok(())
    }

    /// Streaming phase: a generation call with tools disabled.
    async fn stream_answer(&mut self, messages: Vec<Message>) -> Result<(), TurnError> {
        let config = &self.shared.config;
        let request = ChatRequest::new(config.model.as_str(), messages).with_think(config.think);
        let mut stream = self.shared.backend.stream(request);

        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::ThinkingDelta(text) => {
                    if !self.saw_token && !text.is_empty() {
                        self.emit(TurnEvent::thinking(text)).await;
                    }
                }
                StreamEvent::ContentDelta(text) => {
                    if !text.is_empty() {
                        self.push_token(text).await;
                    }
                }
                StreamEvent::Done => break,
            }
        }
        debug!("Streamed answer: {} chars", self.answer.len());
        Ok(())
    }

    async fn push_token(&mut self, text: String) {
        self.saw_token = true;
        self.answer.push_str(&text);
        self.emit(TurnEvent::token(text)).await;
    }

    /// Write the whole turn in one transaction.
    async fn commit(&mut self) -> Result<(), TurnError> {
        let mut messages = Vec::with_capacity(self.tool_messages.len() + 2);
        messages.push((MessageRole::User, self.user_message.clone()));
        messages.extend(
            self.tool_messages
                .iter()
                .map(|content| (MessageRole::Tool, content.clone())),
        );
        if !self.answer.is_empty() {
            messages.push((MessageRole::Assistant, self.answer.clone()));
        }

        let record = TurnRecord {
            conversation_id: self.conversation_id.clone(),
            new_title: self
                .is_new
                .then(|| conversation_title(&self.user_message)),
            messages,
        };
        self.shared.store.commit_turn(&record).await?;
        Ok(())
    }

    fn transition(&mut self, transition: Transition) {
        match self.state.next(transition) {
            Some(next) => {
                debug!("Turn {}: {} -> {next}", self.conversation_id, self.state);
                self.state = next;
            }
            None => warn!(
                "Turn {}: ignoring {transition:?} in state {}",
                self.conversation_id, self.state
            ),
        }
    }

    async fn emit(&self, event: TurnEvent) {
        // A closed channel means the client is gone and this task is about
        // to be aborted.
        let _ = self.tx.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::WindowConfig;
    use crate::policy::PolicyEvaluator;
    use crate::sandbox::{ArtifactStore, ExecutionRunner, Executor, RunnerConfig};
    use crate::test_support::{FakeSearch, ScriptedBackend, SpyExecutor, exec_result, text};
    use crate::{ChatCompletion, ToolCall};
    use std::time::Duration;

    struct Harness {
        store: Store,
        backend: Arc<ScriptedBackend>,
        executor: Arc<SpyExecutor>,
        orchestrator: Orchestrator,
    }

    async fn harness_with(
        backend: ScriptedBackend,
        executor: Arc<dyn Executor>,
        spy: Arc<SpyExecutor>,
    ) -> Harness {
        let store = Store::open_in_memory().await.unwrap();
        let backend = Arc::new(backend);
        let context = ContextWindowManager::new(
            store.clone(),
            backend.clone(),
            "test-model",
            WindowConfig::default(),
        );
        let tools = ToolDispatcher::new(
            PolicyEvaluator::default(),
            executor,
            Arc::new(FakeSearch::default()),
        );
        let config = OrchestratorConfig {
            model: "test-model".into(),
            retry: RetryConfig::default(),
            ..Default::default()
        };
        let orchestrator =
            Orchestrator::new(backend.clone(), context, tools, store.clone(), config);
        Harness {
            store,
            backend,
            executor: spy,
            orchestrator,
        }
    }

    async fn harness(backend: ScriptedBackend) -> Harness {
        let spy = Arc::new(SpyExecutor::returning(exec_result(true, false, "4\n", "")));
        harness_with(backend, spy.clone(), spy).await
    }

    fn python_call(code: &str) -> ChatCompletion {
        ChatCompletion {
            tool_calls: vec![ToolCall::new("run_python", serde_json::json!({ "code": code }))],
            ..Default::default()
        }
    }

    async fn collect(stream: TurnStream) -> Vec<TurnEvent> {
        tokio::time::timeout(Duration::from_secs(30), stream.collect::<Vec<_>>())
            .await
            .unwrap()
    }

    fn count(events: &[TurnEvent], pred: impl Fn(&TurnEvent) -> bool) -> usize {
        events.iter().filter(|e| pred(e)).count()
    }

    fn tokens(events: &[TurnEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                TurnEvent::Token { content } => Some(content.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn titles_are_truncated_on_characters() {
        assert_eq!(conversation_title("Hello"), "Hello");
        let long = "é".repeat(60);
        let title = conversation_title(&long);
        assert_eq!(title.chars().count(), 53);
        assert!(title.ends_with("..."));
    }

    #[tokio::test]
    async fn direct_answer_replays_first_pass() {
        let backend = ScriptedBackend::new();
        backend.push_completion(ChatCompletion {
            content: "Hello there".into(),
            thinking: Some("greeting".into()),
            tool_calls: vec![],
        });
        let h = harness(backend).await;

        let events = collect(h.orchestrator.submit(TurnRequest::new(None, "hi"))).await;
        assert_eq!(events[0], TurnEvent::thinking("greeting"));
        assert_eq!(events[1], TurnEvent::token("Hello there"));
        let TurnEvent::Done { conversation_id } = &events[2] else {
            panic!("expected done, got {:?}", events[2]);
        };

        let conv = h.store.get_conversation(conversation_id).await.unwrap().unwrap();
        assert_eq!(conv.title, "hi");
        let stored = h.store.messages(conversation_id).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].content, "Hello there");
        // Only the first pass was needed.
        assert_eq!(h.backend.requests().len(), 1);
        assert!(h.backend.requests()[0].tools.is_some());
    }

    #[tokio::test]
    async fn empty_first_pass_streams_without_tools() {
        let backend = ScriptedBackend::new();
        backend.push_completion(text(""));
        backend.push_stream(vec![
            Ok(StreamEvent::ThinkingDelta("hmm".into())),
            Ok(StreamEvent::ContentDelta("Hel".into())),
            Ok(StreamEvent::ThinkingDelta("late".into())),
            Ok(StreamEvent::ContentDelta("".into())),
            Ok(StreamEvent::ContentDelta("lo".into())),
            Ok(StreamEvent::Done),
        ]);
        let h = harness(backend).await;

        let events = collect(h.orchestrator.submit(TurnRequest::new(None, "hi"))).await;
        assert_eq!(
            events[..3],
            [
                TurnEvent::thinking("hmm"),
                TurnEvent::token("Hel"),
                TurnEvent::token("lo"),
            ]
        );
        assert!(matches!(events[3], TurnEvent::Done { .. }));
        assert_eq!(events.len(), 4);

        let requests = h.backend.requests();
        assert!(requests[1].tools.is_none());
    }

    #[tokio::test]
    async fn run_python_turn_end_to_end() {
        let backend = ScriptedBackend::new();
        backend.push_completion(python_call("print(2 + 2)"));
        backend.push_tokens(&["The answer ", "is 4."]);
        let h = harness(backend).await;

        let events = collect(h.orchestrator.submit(TurnRequest::new(None, "what is 2+2?"))).await;
        assert_eq!(
            count(&events, |e| matches!(e, TurnEvent::ToolStatus { .. })),
            1
        );
        assert_eq!(events[0], TurnEvent::tool_status("Running Python code..."));
        assert_eq!(
            events[1],
            TurnEvent::CodeOutput {
                code: "print(2 + 2)".into(),
                stdout: "4\n".into(),
                stderr: String::new(),
                images: vec![],
                success: true,
            }
        );
        assert!(tokens(&events).contains('4'));
        assert!(matches!(events.last(), Some(TurnEvent::Done { .. })));
        assert_eq!(h.executor.calls(), 1);

        // The follow-up prompt carries the tool call and its output.
        let follow_up = &h.backend.requests()[1];
        assert!(follow_up.tools.is_none());
        let n = follow_up.messages.len();
        assert!(follow_up.messages[n - 2].tool_calls.is_some());
        assert_eq!(follow_up.messages[n - 1].role, MessageRole::Tool);
        assert_eq!(follow_up.messages[n - 1].content, "STDOUT:\n4\n");

        let TurnEvent::Done { conversation_id } = events.last().unwrap() else {
            unreachable!()
        };
        let roles: Vec<_> = h
            .store
            .messages(conversation_id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.role)
            .collect();
        assert_eq!(
            roles,
            vec![MessageRole::User, MessageRole::Tool, MessageRole::Assistant]
        );
    }

    #[tokio::test]
    async fn rejected_code_informs_model_and_finishes() {
        let backend = ScriptedBackend::new();
        backend.push_completion(python_call("import os; os.system(\"ls\")"));
        backend.push_tokens(&["I can't run that."]);
        let h = harness(backend).await;

        let events = collect(h.orchestrator.submit(TurnRequest::new(None, "list files"))).await;
        assert!(
            !events
                .iter()
                .any(|e| *e == TurnEvent::tool_status("Running Python code..."))
        );
        let TurnEvent::ToolStatus { content } = &events[0] else {
            panic!("expected tool status, got {:?}", events[0]);
        };
        assert!(content.starts_with("Python code rejected by policy: Line 1: import of 'os'"));
        assert!(matches!(
            &events[1],
            TurnEvent::CodeOutput { success: false, code, .. } if code.starts_with("import os")
        ));
        assert!(matches!(events.last(), Some(TurnEvent::Done { .. })));
        assert_eq!(h.executor.calls(), 0);

        let follow_up = &h.backend.requests()[1];
        let tool_msg = follow_up.messages.last().unwrap();
        assert!(tool_msg.content.starts_with("VALIDATION ERRORS:\n"));
    }

    #[tokio::test]
    async fn generation_failure_persists_nothing() {
        let backend = ScriptedBackend::new();
        backend.push_completion_error("model 'x' not found");
        let h = harness(backend).await;

        let stream = h.orchestrator.submit(TurnRequest::new(None, "hi"));
        let id = stream.conversation_id().to_string();
        let events = collect(stream).await;
        assert_eq!(
            events,
            vec![TurnEvent::Error {
                content: "generation service error: model 'x' not found".into()
            }]
        );
        assert!(h.store.get_conversation(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stream_failure_mid_answer_persists_nothing() {
        let backend = ScriptedBackend::new();
        backend.push_completion(text(""));
        backend.push_stream(vec![
            Ok(StreamEvent::ContentDelta("partial".into())),
            Err("connection reset".into()),
        ]);
        let h = harness(backend).await;
        let conv = h.store.create_conversation("t").await.unwrap();

        let events = collect(
            h.orchestrator
                .submit(TurnRequest::new(Some(conv.id.clone()), "hi")),
        )
        .await;
        assert_eq!(events[0], TurnEvent::token("partial"));
        assert!(matches!(events.last(), Some(TurnEvent::Error { .. })));
        assert_eq!(h.store.message_count(&conv.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn search_service_failure_ends_turn() {
        let store = Store::open_in_memory().await.unwrap();
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_completion(ChatCompletion {
            tool_calls: vec![ToolCall::new(
                "web_search",
                serde_json::json!({ "query": "news" }),
            )],
            ..Default::default()
        });
        let context = ContextWindowManager::new(
            store.clone(),
            backend.clone(),
            "m",
            WindowConfig::default(),
        );
        let tools = ToolDispatcher::new(
            PolicyEvaluator::default(),
            Arc::new(SpyExecutor::returning(exec_result(true, false, "", ""))),
            Arc::new(FakeSearch::failing()),
        );
        let orchestrator = Orchestrator::new(
            backend.clone(),
            context,
            tools,
            store.clone(),
            OrchestratorConfig::default(),
        );

        let events = collect(orchestrator.submit(TurnRequest::new(None, "news?"))).await;
        assert_eq!(events[0], TurnEvent::tool_status("Searching the web for: news"));
        let TurnEvent::Error { content } = &events[1] else {
            panic!("expected error, got {:?}", events[1]);
        };
        assert!(content.starts_with("tool service failure: Web search failed"));
        assert_eq!(events.len(), 2);
        assert!(store.list_conversations().await.unwrap().is_empty());
        // No streaming pass after the failure.
        assert_eq!(backend.requests().len(), 1);
    }

    #[tokio::test]
    async fn unknown_conversation_is_an_error() {
        let h = harness(ScriptedBackend::new()).await;
        let events = collect(
            h.orchestrator
                .submit(TurnRequest::new(Some("missing".into()), "hi")),
        )
        .await;
        assert!(matches!(&events[..], [TurnEvent::Error { content }] if content.contains("missing")));
    }

    #[tokio::test]
    async fn concurrent_turns_persist_in_submission_order() {
        let backend = ScriptedBackend::new().with_complete_delay(Duration::from_millis(30));
        for answer in ["first", "second", "third"] {
            backend.push_completion(text(answer));
        }
        let h = harness(backend).await;
        let conv = h.store.create_conversation("t").await.unwrap();

        let streams: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|m| {
                h.orchestrator
                    .submit(TurnRequest::new(Some(conv.id.clone()), m))
            })
            .collect();
        let results = futures::future::join_all(streams.into_iter().map(collect)).await;
        for events in &results {
            assert!(matches!(events.last(), Some(TurnEvent::Done { .. })));
        }

        let contents: Vec<_> = h
            .store
            .messages(&conv.id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["a", "first", "b", "second", "c", "third"]);
    }

    #[tokio::test]
    async fn long_conversation_sends_summary_and_window() {
        let backend = ScriptedBackend::new();
        backend.push_completion(text("They talked about numbers."));
        backend.push_completion(text("ok"));
        let h = harness(backend).await;
        let conv = h.store.create_conversation("t").await.unwrap();
        let messages = (0..25)
            .map(|i| (MessageRole::User, format!("m{i}")))
            .collect();
        h.store
            .commit_turn(&TurnRecord {
                conversation_id: conv.id.clone(),
                new_title: None,
                messages,
            })
            .await
            .unwrap();

        collect(
            h.orchestrator
                .submit(TurnRequest::new(Some(conv.id.clone()), "next")),
        )
        .await;

        let first_pass = &h.backend.requests()[1];
        // system, summary, 20 recent, new user message
        assert_eq!(first_pass.messages.len(), 23);
        assert_eq!(
            first_pass.messages[1].content,
            "Summary of the earlier conversation: They talked about numbers."
        );
        assert_eq!(first_pass.messages[2].content, "m5");
        assert_eq!(first_pass.messages[22].content, "next");
    }

    #[tokio::test]
    async fn dropping_stream_cancels_turn() {
        let backend =
            ScriptedBackend::new().with_complete_delay(Duration::from_secs(30));
        let h = harness(backend).await;

        let stream = h.orchestrator.submit(TurnRequest::new(None, "hi"));
        let id = stream.conversation_id().to_string();
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(stream);

        // The next turn on the same conversation is not blocked by the
        // abandoned one.
        let mut next = h
            .orchestrator
            .submit(TurnRequest::new(Some(id.clone()), "again"));
        let first = tokio::time::timeout(Duration::from_secs(5), next.next())
            .await
            .unwrap();
        assert!(matches!(first, Some(TurnEvent::Error { .. })), "{first:?}");
        assert!(h.store.get_conversation(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn real_runner_end_to_end() {
        let python = std::process::Command::new("python3")
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success());
        if !python {
            eprintln!("python3 not available, skipping");
            return;
        }
        let scratch = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();
        let runner = Arc::new(ExecutionRunner::new(
            RunnerConfig::default().with_scratch_base(scratch.path()),
            ArtifactStore::new(artifacts.path()),
        ));
        let spy = Arc::new(SpyExecutor::returning(exec_result(true, false, "", "")));

        let backend = ScriptedBackend::new();
        backend.push_completion(python_call("print(2+2)"));
        backend.push_tokens(&["4"]);
        let h = harness_with(backend, runner, spy).await;

        let events = collect(h.orchestrator.submit(TurnRequest::new(None, "2+2?"))).await;
        assert_eq!(events[0], TurnEvent::tool_status("Running Python code..."));
        assert!(matches!(events.last(), Some(TurnEvent::Done { .. })));
        let tool_msg = h.backend.requests()[1].messages.last().cloned().unwrap();
        assert_eq!(tool_msg.content.trim(), "STDOUT:\n4");
        assert!(std::fs::read_dir(scratch.path()).unwrap().next().is_none());
    }
}
