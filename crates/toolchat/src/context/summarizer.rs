//! Anchored incremental summarization of older conversation messages.
//!
//! Maintains a running summary updated incrementally, never re-summarizing
//! the whole history. Each call folds one not-yet-summarized span into the
//! existing summary with a single generation call.

use tracing::debug;

use crate::error::SummarizationFailure;
use crate::store::StoredMessage;
use crate::{ChatBackend, ChatRequest, Message};

/// The prompt used for summarization. Instructs the model to produce a concise,
/// factual summary suitable for injecting into a conversation as context.
const SUMMARIZATION_PROMPT: &str = "\
Summarize the following conversation messages in 3-5 sentences. Focus on:
- What the user asked for and what was answered
- Numbers, results, and conclusions from code that was run
- Facts found through web searches, with their sources
- Open questions or follow-ups the user mentioned

Rules:
- Only include facts explicitly stated in the messages. Do not infer or extrapolate.
- Preserve names, figures, and error messages verbatim.
- If there is an existing summary, merge the new information into it to produce a single \
  cohesive summary. Do not simply append. The result must be a standalone summary that \
  replaces the existing one entirely.";

/// Default bound on the formatted span sent for summarization.
pub const DEFAULT_MAX_SPAN_CHARS: usize = 24_000;

#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    /// Model to use for summarization. The main model when unset.
    pub model: Option<String>,
    pub max_span_chars: usize,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            model: None,
            max_span_chars: DEFAULT_MAX_SPAN_CHARS,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Summarizer {
    pub config: SummarizerConfig,
}

impl Summarizer {
    pub fn new(config: SummarizerConfig) -> Self {
        Self { config }
    }

    /// Build the summarization prompt for a span of messages.
    ///
    /// Returns a (system, user) pair suitable for a one-shot generation call.
    pub fn build_summarization_request(
        &self,
        existing: &str,
        span: &[StoredMessage],
    ) -> (String, String) {
        let mut transcript = String::new();
        for msg in span {
            transcript.push_str(&format!("[{}]: {}\n\n", msg.role, msg.content));
        }
        let transcript = bound_chars(&transcript, self.config.max_span_chars);

        let mut content = String::new();
        if !existing.is_empty() {
            content.push_str("=== EXISTING SUMMARY ===\n");
            content.push_str(existing);
            content.push_str("\n\n=== NEW MESSAGES TO SUMMARIZE ===\n");
        }
        content.push_str(&transcript);

        (SUMMARIZATION_PROMPT.to_string(), content)
    }

    /// Get the model to use for summarization.
    pub fn summary_model<'a>(&'a self, main_model: &'a str) -> &'a str {
        self.config.model.as_deref().unwrap_or(main_model)
    }

    /// Merge `span` into `existing` with one generation call.
    pub async fn summarize(
        &self,
        backend: &dyn ChatBackend,
        main_model: &str,
        existing: &str,
        span: &[StoredMessage],
    ) -> Result<String, SummarizationFailure> {
        let (system, user) = self.build_summarization_request(existing, span);
        let request = ChatRequest::new(
            self.summary_model(main_model),
            vec![Message::system(system), Message::user(user)],
        )
        .with_think(false);

        let completion = backend.complete(request).await?;
        let summary = completion.content.trim();
        if summary.is_empty() {
            return Err(SummarizationFailure::Empty);
        }
        debug!(
            "Summarized {} message(s) into {} chars",
            span.len(),
            summary.len()
        );
        Ok(summary.to_string())
    }
}

/// Keep at most `max` characters, marking the cut.
fn bound_chars(text: &str, max: usize) -> String {
    if text.chars().nth(max).is_none() {
        return text.to_string();
    }
    let kept: String = text.chars().take(max).collect();
    format!("{kept}\n[... truncated]")
}
