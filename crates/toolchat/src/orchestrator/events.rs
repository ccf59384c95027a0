//! Events a turn emits to its client.
//!
//! Each event serializes to the JSON carried in one SSE `data:` line, tagged
//! by `type`:
//!
//! | type | fields |
//! |------|--------|
//! | `thinking` | `content` |
//! | `token` | `content` |
//! | `tool_status` | `content` |
//! | `code_output` | `code`, `stdout`, `stderr`, `images`, `success` |
//! | `done` | `conversation_id` |
//! | `error` | `content` |

use serde::Serialize;

use crate::tools::CodeOutput;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// Chain-of-thought increment.
    Thinking { content: String },
    /// Answer increment.
    Token { content: String },
    /// A tool action about to run.
    ToolStatus { content: String },
    /// What a `run_python` call did. `images` are artifact URLs.
    CodeOutput {
        code: String,
        stdout: String,
        stderr: String,
        images: Vec<String>,
        success: bool,
    },
    /// The turn completed and was persisted.
    Done { conversation_id: String },
    /// The turn failed. Nothing from it was persisted.
    Error { content: String },
}

impl TurnEvent {
    pub fn thinking(content: impl Into<String>) -> Self {
        TurnEvent::Thinking {
            content: content.into(),
        }
    }

    pub fn token(content: impl Into<String>) -> Self {
        TurnEvent::Token {
            content: content.into(),
        }
    }

    pub fn tool_status(content: impl Into<String>) -> Self {
        TurnEvent::ToolStatus {
            content: content.into(),
        }
    }

    pub fn code_output(output: CodeOutput) -> Self {
        TurnEvent::CodeOutput {
            code: output.code,
            stdout: output.stdout,
            stderr: output.stderr,
            images: output.images,
            success: output.success,
        }
    }

    /// `done` and `error` end a turn's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnEvent::Done { .. } | TurnEvent::Error { .. })
    }
}
