//! Scripted collaborators shared by unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::SearchError;
use crate::policy::AcceptedCode;
use crate::sandbox::{ExecFuture, ExecutionResult, Executor};
use crate::tools::{SearchFuture, SearchService};
use crate::{
    ChatBackend, ChatCompletion, ChatRequest, CompletionFuture, EventStream, GenerationError,
    StreamEvent,
};

/// A generation backend that replays queued responses and records every
/// request it receives. Empty queues fall back to a plain `"ok"` answer.
#[derive(Default)]
pub(crate) struct ScriptedBackend {
    completions: Mutex<VecDeque<Result<ChatCompletion, String>>>,
    streams: Mutex<VecDeque<Vec<Result<StreamEvent, String>>>>,
    requests: Mutex<Vec<ChatRequest>>,
    complete_delay: Option<Duration>,
}

impl ScriptedBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_complete_delay(mut self, delay: Duration) -> Self {
        self.complete_delay = Some(delay);
        self
    }

    pub(crate) fn push_completion(&self, completion: ChatCompletion) {
        self.completions.lock().unwrap().push_back(Ok(completion));
    }

    pub(crate) fn push_completion_error(&self, message: &str) {
        self.completions
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
    }

    pub(crate) fn push_stream(&self, events: Vec<Result<StreamEvent, String>>) {
        self.streams.lock().unwrap().push_back(events);
    }

    /// Queue a stream that yields `tokens` as content deltas.
    pub(crate) fn push_tokens(&self, tokens: &[&str]) {
        let mut events: Vec<_> = tokens
            .iter()
            .map(|t| Ok(StreamEvent::ContentDelta(t.to_string())))
            .collect();
        events.push(Ok(StreamEvent::Done));
        self.push_stream(events);
    }

    pub(crate) fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

pub(crate) fn text(content: &str) -> ChatCompletion {
    ChatCompletion {
        content: content.to_string(),
        ..Default::default()
    }
}

impl ChatBackend for ScriptedBackend {
    fn complete(&self, request: ChatRequest) -> CompletionFuture<'_> {
        self.requests.lock().unwrap().push(request);
        let next = self.completions.lock().unwrap().pop_front();
        let delay = self.complete_delay;
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match next {
                Some(Ok(c)) => Ok(c),
                Some(Err(e)) => Err(GenerationError::Service(e)),
                None => Ok(text("ok")),
            }
        })
    }

    fn stream(&self, request: ChatRequest) -> EventStream {
        self.requests.lock().unwrap().push(request);
        let events = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                vec![
                    Ok(StreamEvent::ContentDelta("ok".into())),
                    Ok(StreamEvent::Done),
                ]
            });
        Box::pin(futures::stream::iter(
            events
                .into_iter()
                .map(|e| e.map_err(GenerationError::Service)),
        ))
    }
}

// ── Tool collaborators ─────────────────────────────────────────────

pub(crate) fn exec_result(
    success: bool,
    timed_out: bool,
    stdout: &str,
    stderr: &str,
) -> ExecutionResult {
    ExecutionResult {
        execution_id: "e1".into(),
        success,
        timed_out,
        exit_code: if success { Some(0) } else { None },
        stdout: stdout.into(),
        stderr: stderr.into(),
        stdout_truncated: false,
        stderr_truncated: false,
        artifacts: Vec::new(),
        elapsed: Duration::ZERO,
    }
}

/// Counts executions and returns a canned result.
pub(crate) struct SpyExecutor {
    calls: AtomicUsize,
    result: ExecutionResult,
}

impl SpyExecutor {
    pub(crate) fn returning(result: ExecutionResult) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            result,
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Executor for SpyExecutor {
    fn execute<'a>(&'a self, _code: &'a AcceptedCode) -> ExecFuture<'a> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = self.result.clone();
        Box::pin(async move { result })
    }
}

/// Records queries; answers with a fixed header or fails without a key.
#[derive(Default)]
pub(crate) struct FakeSearch {
    queries: Mutex<Vec<String>>,
    fail: bool,
}

impl FakeSearch {
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub(crate) fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

impl SearchService for FakeSearch {
    fn search<'a>(&'a self, query: &'a str) -> SearchFuture<'a> {
        self.queries.lock().unwrap().push(query.to_string());
        let fail = self.fail;
        Box::pin(async move {
            if fail {
                Err(SearchError::MissingApiKey)
            } else {
                Ok(format!("Web search results for: {query}\n"))
            }
        })
    }
}
