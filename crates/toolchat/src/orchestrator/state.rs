//! The per-turn state machine.
//!
//! ```text
//! Init ──tool calls──▶ ToolExec ──tools done──▶ Streaming ──committed──▶ Done
//!   └──────no tool calls────────────────────────▶ │
//! any non-terminal ──failure──▶ Error
//! ```

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// Waiting for the conversation's ticket, building context, first pass.
    Init,
    ToolExec,
    Streaming,
    Done,
    Error,
}

/// What happened, as seen by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    ToolCallsSignaled,
    NoToolCalls,
    ToolsFinished,
    Committed,
    Failed,
}

impl TurnState {
    /// The state after `transition`, or `None` if it is not allowed here.
    pub fn next(self, transition: Transition) -> Option<TurnState> {
        use Transition::*;
        use TurnState::*;
        match (self, transition) {
            (Done | Error, _) => None,
            (_, Failed) => Some(Error),
            (Init, ToolCallsSignaled) => Some(ToolExec),
            (Init, NoToolCalls) => Some(Streaming),
            (ToolExec, ToolsFinished) => Some(Streaming),
            (Streaming, Committed) => Some(Done),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TurnState::Done | TurnState::Error)
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TurnState::Init => "init",
            TurnState::ToolExec => "tool_exec",
            TurnState::Streaming => "streaming",
            TurnState::Done => "done",
            TurnState::Error => "error",
        };
        f.write_str(name)
    }
}
