//! Sliding window plus running summary.
//!
//! The last `W` messages of a conversation are sent verbatim. Everything
//! before them is represented only by the stored summary, which is brought
//! up to date lazily when a context is built.

use std::sync::Arc;

use tracing::{info, warn};

use super::summarizer::Summarizer;
use crate::error::{StoreError, SummarizationFailure};
use crate::store::{Store, StoredMessage};
use crate::{ChatBackend, Message};

pub const DEFAULT_WINDOW_SIZE: usize = 20;
pub const DEFAULT_SUMMARY_TRIGGER: usize = 10;

#[derive(Debug, Clone)]
pub struct WindowConfig {
    /// Number of most recent messages kept verbatim (`W`).
    pub window_size: usize,
    /// Messages that must slide out of the window past the current summary
    /// before it is rebuilt (`T`). The first summary is built as soon as any
    /// message leaves the window.
    pub summary_trigger: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            summary_trigger: DEFAULT_SUMMARY_TRIGGER,
        }
    }
}

/// The history a turn is generated from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextWindow {
    pub summary: String,
    pub recent: Vec<StoredMessage>,
    /// Messages folded into `summary`.
    pub coverage: i64,
    /// Messages in the conversation.
    pub total: i64,
}

impl ContextWindow {
    /// Context of a conversation that does not exist yet.
    pub fn empty() -> Self {
        Self {
            summary: String::new(),
            recent: Vec::new(),
            coverage: 0,
            total: 0,
        }
    }

    /// Render as prompt messages: system prompt, summary (when present),
    /// then recent messages verbatim.
    pub fn to_messages(&self, system_prompt: &str) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.recent.len() + 2);
        if !system_prompt.is_empty() {
            messages.push(Message::system(system_prompt));
        }
        if !self.summary.is_empty() {
            messages.push(Message::system(format!(
                "Summary of the earlier conversation: {}",
                self.summary
            )));
        }
        messages.extend(
            self.recent
                .iter()
                .map(|m| Message::new(m.role, m.content.clone())),
        );
        messages
    }
}

pub struct ContextWindowManager {
    store: Store,
    backend: Arc<dyn ChatBackend>,
    model: String,
    summarizer: Summarizer,
    config: WindowConfig,
}

impl ContextWindowManager {
    pub fn new(
        store: Store,
        backend: Arc<dyn ChatBackend>,
        model: impl Into<String>,
        config: WindowConfig,
    ) -> Self {
        Self {
            store,
            backend,
            model: model.into(),
            summarizer: Summarizer::default(),
            config,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Summarizer) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// Build the context for `conversation_id`, re-summarizing first when
    /// enough messages have slid out of the window.
    ///
    /// A failed summarization is logged and the previous summary is used.
    pub async fn build_context(&self, conversation_id: &str) -> Result<ContextWindow, StoreError> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(conversation_id.to_string()))?;

        let total = self.store.message_count(conversation_id).await?;
        let window = self.config.window_size as i64;
        let trigger = self.config.summary_trigger as i64;
        let boundary = (total - window).max(0);

        let mut summary = conversation.summary;
        let mut coverage = conversation.summary_up_to_index;

        if needs_summary(coverage, boundary, trigger) {
            match self
                .resummarize(conversation_id, &summary, coverage, boundary)
                .await
            {
                Ok(new_summary) => {
                    info!(
                        "Summary for {conversation_id} advanced from {coverage} to {boundary} message(s)"
                    );
                    summary = new_summary;
                    coverage = boundary;
                }
                Err(e) => {
                    warn!("Summarization failed for {conversation_id}, keeping previous summary: {e}");
                }
            }
        }

        let recent = self
            .store
            .message_range(conversation_id, boundary, total)
            .await?;

        Ok(ContextWindow {
            summary,
            recent,
            coverage,
            total,
        })
    }

    async fn resummarize(
        &self,
        conversation_id: &str,
        existing: &str,
        coverage: i64,
        boundary: i64,
    ) -> Result<String, SummarizationFailure> {
        let span = self
            .store
            .message_range(conversation_id, coverage, boundary)
            .await?;
        let summary = self
            .summarizer
            .summarize(self.backend.as_ref(), &self.model, existing, &span)
            .await?;
        self.store
            .update_summary(conversation_id, &summary, boundary)
            .await?;
        Ok(summary)
    }
}

/// Whether the summary should be advanced from `coverage` to `boundary`.
fn needs_summary(coverage: i64, boundary: i64, trigger: i64) -> bool {
    if boundary <= coverage {
        return false;
    }
    coverage == 0 || boundary - coverage > trigger
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageRole;
    use crate::store::TurnRecord;
    use crate::test_support::{ScriptedBackend, text};

    async fn conversation_with(store: &Store, n: usize) -> String {
        let conv = store.create_conversation("t").await.unwrap();
        append(store, &conv.id, 0, n).await;
        conv.id
    }

    async fn append(store: &Store, id: &str, from: usize, to: usize) {
        let messages = (from..to)
            .map(|i| {
                let role = if i % 2 == 0 {
                    MessageRole::User
                } else {
                    MessageRole::Assistant
                };
                (role, format!("m{i}"))
            })
            .collect();
        store
            .commit_turn(&TurnRecord {
                conversation_id: id.to_string(),
                new_title: None,
                messages,
            })
            .await
            .unwrap();
    }

    fn manager(store: &Store, backend: &Arc<ScriptedBackend>) -> ContextWindowManager {
        ContextWindowManager::new(
            store.clone(),
            backend.clone(),
            "test-model",
            WindowConfig::default(),
        )
    }

    #[tokio::test]
    async fn short_conversation_is_sent_whole() {
        let store = Store::open_in_memory().await.unwrap();
        let backend = Arc::new(ScriptedBackend::new());
        let id = conversation_with(&store, 6).await;

        let ctx = manager(&store, &backend).build_context(&id).await.unwrap();
        assert_eq!(ctx.recent.len(), 6);
        assert_eq!(ctx.total, 6);
        assert_eq!(ctx.coverage, 0);
        assert!(ctx.summary.is_empty());
        assert!(backend.requests().is_empty());
    }

    #[tokio::test]
    async fn long_conversation_keeps_last_window_and_summarizes_rest() {
        let store = Store::open_in_memory().await.unwrap();
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_completion(text("The user counted from m0 to m4."));
        let id = conversation_with(&store, 25).await;

        let ctx = manager(&store, &backend).build_context(&id).await.unwrap();
        assert_eq!(ctx.recent.len(), 20);
        assert_eq!(ctx.recent[0].content, "m5");
        assert_eq!(ctx.recent[19].content, "m24");
        assert_eq!(ctx.summary, "The user counted from m0 to m4.");
        assert!(ctx.coverage >= 5);

        let stored = store.get_conversation(&id).await.unwrap().unwrap();
        assert_eq!(stored.summary_up_to_index, 5);

        // The span sent for summarization is exactly the messages that left
        // the window.
        let prompt = &backend.requests()[0].messages[1].content;
        assert!(prompt.contains("m0") && prompt.contains("m4"));
        assert!(!prompt.contains("m5"));
    }

    #[tokio::test]
    async fn rebuilding_without_new_messages_changes_nothing() {
        let store = Store::open_in_memory().await.unwrap();
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_completion(text("summary one"));
        let id = conversation_with(&store, 25).await;
        let mgr = manager(&store, &backend);

        let first = mgr.build_context(&id).await.unwrap();
        let second = mgr.build_context(&id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.requests().len(), 1);
    }

    #[tokio::test]
    async fn resummarizes_after_trigger_and_merges() {
        let store = Store::open_in_memory().await.unwrap();
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_completion(text("first"));
        backend.push_completion(text("second"));
        let id = conversation_with(&store, 25).await;
        let mgr = manager(&store, &backend);
        mgr.build_context(&id).await.unwrap();

        // total 36: boundary 16, coverage 5, 11 messages past the summary.
        append(&store, &id, 25, 36).await;
        let ctx = mgr.build_context(&id).await.unwrap();
        assert_eq!(ctx.summary, "second");
        assert_eq!(ctx.coverage, 16);

        let prompt = &backend.requests()[1].messages[1].content;
        assert!(prompt.contains("=== EXISTING SUMMARY ===\nfirst"));
        assert!(prompt.contains("m5"));
        assert!(!prompt.contains("[user]: m0\n"));
    }

    #[tokio::test]
    async fn one_message_per_turn_does_not_resummarize_every_turn() {
        let store = Store::open_in_memory().await.unwrap();
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_completion(text("first"));
        backend.push_completion(text("second"));
        let id = conversation_with(&store, 20).await;
        let mgr = manager(&store, &backend);

        // Messages 21..=30 leave at most 10 past the first summary.
        for n in 20..30 {
            append(&store, &id, n, n + 1).await;
            let ctx = mgr.build_context(&id).await.unwrap();
            assert_eq!(ctx.summary, "first");
            assert_eq!(ctx.coverage, 1);
            assert_eq!(ctx.recent.len(), 20);
        }
        assert_eq!(backend.requests().len(), 1);

        // The 11th message past the summary triggers the rebuild.
        append(&store, &id, 30, 32).await;
        let ctx = mgr.build_context(&id).await.unwrap();
        assert_eq!(ctx.summary, "second");
        assert_eq!(ctx.coverage, 12);
        assert_eq!(backend.requests().len(), 2);
    }

    #[test]
    fn summary_trigger_rule() {
        assert!(!needs_summary(0, 0, 10));
        assert!(needs_summary(0, 1, 10));
        assert!(!needs_summary(1, 11, 10));
        assert!(needs_summary(1, 12, 10));
        assert!(!needs_summary(12, 12, 10));
    }

    #[tokio::test]
    async fn failed_summarization_keeps_previous_summary() {
        let store = Store::open_in_memory().await.unwrap();
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_completion(text("kept"));
        backend.push_completion_error("model unavailable");
        backend.push_completion(text("  "));
        let id = conversation_with(&store, 25).await;
        let mgr = manager(&store, &backend);

        let mut coverages = vec![mgr.build_context(&id).await.unwrap().coverage];
        append(&store, &id, 25, 40).await;
        for _ in 0..2 {
            let ctx = mgr.build_context(&id).await.unwrap();
            assert_eq!(ctx.summary, "kept");
            assert_eq!(ctx.recent.len(), 20);
            coverages.push(ctx.coverage);
        }
        assert!(coverages.windows(2).all(|w| w[0] <= w[1]));
        let stored = store.get_conversation(&id).await.unwrap().unwrap();
        assert_eq!(stored.summary, "kept");
        assert_eq!(stored.summary_up_to_index, 5);
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() {
        let store = Store::open_in_memory().await.unwrap();
        let backend = Arc::new(ScriptedBackend::new());
        let err = manager(&store, &backend)
            .build_context("missing")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn to_messages_layout() {
        let ctx = ContextWindow {
            summary: "Earlier things.".into(),
            recent: vec![StoredMessage {
                id: "1".into(),
                conversation_id: "c".into(),
                role: MessageRole::Tool,
                content: "STDOUT:\n4".into(),
                created_at: String::new(),
            }],
            coverage: 3,
            total: 4,
        };
        let messages = ctx.to_messages("You are helpful.");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content, "You are helpful.");
        assert_eq!(
            messages[1].content,
            "Summary of the earlier conversation: Earlier things."
        );
        assert_eq!(messages[2].role, MessageRole::Tool);

        assert_eq!(ContextWindow::empty().to_messages("sys").len(), 1);
    }
}
