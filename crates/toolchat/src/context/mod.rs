//! Context window management: sliding window plus running summary.
//!
//! Unbounded history never reaches the model. Each turn is generated from:
//!
//! 1. **Running summary**: everything older than the window, folded into a
//!    few sentences by [`summarizer`] and stored with the conversation.
//! 2. **Raw recency window**: the last `W` messages, unmodified.
//!
//! [`ContextWindowManager::build_context`] advances the summary lazily, only
//! once enough messages have slid out of the window, and coverage never
//! moves backwards.

pub mod summarizer;
pub mod window;

pub use summarizer::{Summarizer, SummarizerConfig};
pub use window::{
    ContextWindow, ContextWindowManager, DEFAULT_SUMMARY_TRIGGER, DEFAULT_WINDOW_SIZE,
    WindowConfig,
};
