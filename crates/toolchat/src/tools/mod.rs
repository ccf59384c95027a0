//! The closed tool set offered to the model, and its dispatcher.
//!
//! The model may call exactly two tools:
//!
//! - `web_search {query}`: live web results through a [`SearchService`].
//! - `run_python {code}`: policy check, then isolated execution.
//!
//! Every call produces a [`ToolResult`]. Nothing is thrown across the
//! [`ToolDispatcher`] boundary; failures the model should see are carried
//! as content, and the [`ToolFailure`] classification tells the
//! orchestrator whether the turn can continue.
//!
//! # Submodules
//!
//! - [`dispatcher`]: [`ToolDispatcher`], [`PreparedCall`], status lines,
//!   result normalization.
//! - [`search`]: [`SearchService`] and the Serper-backed [`SerperSearch`].

pub mod dispatcher;
pub mod search;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{ToolDef, json_schema_for};

pub use dispatcher::{PreparedCall, ToolDispatcher};
pub use search::{SearchConfig, SearchFuture, SearchService, SerperSearch};

pub const WEB_SEARCH: &str = "web_search";
pub const RUN_PYTHON: &str = "run_python";

// ── Arguments ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct WebSearchArgs {
    /// The search query
    pub query: String,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct RunPythonArgs {
    /// Python source code to execute. Print results to stdout; call
    /// plt.show() to return a chart.
    pub code: String,
}

/// Definitions sent with the first generation pass.
pub fn tool_definitions() -> Vec<ToolDef> {
    vec![
        ToolDef::new(
            WEB_SEARCH,
            "Search the web for current information. Use this when the user asks about \
             recent events, current data, or anything you need to look up.",
            json_schema_for::<WebSearchArgs>(),
        ),
        ToolDef::new(
            RUN_PYTHON,
            "Execute Python code for calculations, data analysis, and charts. Available \
             libraries include math, statistics, numpy, pandas, scipy, sklearn, matplotlib, \
             and seaborn. File, network, and system access are not available. Print values \
             to see them; charts shown with plt.show() are returned as images.",
            json_schema_for::<RunPythonArgs>(),
        ),
    ]
}

// ── Results ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Ok,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ToolFailure {
    PolicyRejected,
    ExecutionTimeout,
    ExecutionFault,
    InvalidArguments,
    UnknownTool,
    ToolServiceFailure,
}

impl ToolFailure {
    /// Whether the turn must stop. Every other failure is reported to the
    /// model as tool content and the turn continues.
    pub fn is_fatal(self) -> bool {
        matches!(self, ToolFailure::ToolServiceFailure)
    }
}

/// What a `run_python` call did, for clients that show the code and its
/// charts next to the answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeOutput {
    pub code: String,
    pub stdout: String,
    pub stderr: String,
    /// Artifact URLs.
    pub images: Vec<String>,
    pub success: bool,
}

/// Outcome of one tool call, as the model will see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolResult {
    /// Name of the tool that was called.
    pub tool: String,
    pub status: ToolStatus,
    pub content: String,
    pub failure: Option<ToolFailure>,
    /// Set for `run_python`, whether or not the code ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_output: Option<CodeOutput>,
}

impl ToolResult {
    pub fn ok(tool: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            status: ToolStatus::Ok,
            content: content.into(),
            failure: None,
            code_output: None,
        }
    }

    pub fn failed(tool: impl Into<String>, failure: ToolFailure, content: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            status: ToolStatus::Failed,
            content: content.into(),
            failure: Some(failure),
            code_output: None,
        }
    }

    pub fn with_code_output(mut self, output: CodeOutput) -> Self {
        self.code_output = Some(output);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == ToolStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definitions_cover_closed_set() {
        let defs = tool_definitions();
        let names: Vec<_> = defs.iter().map(|d| d.function.name.as_str()).collect();
        assert_eq!(names, vec!["web_search", "run_python"]);

        let search = &defs[0].function.parameters;
        assert_eq!(search["type"], "object");
        assert!(search["properties"]["query"].is_object());
        let python = &defs[1].function.parameters;
        assert!(
            python["required"]
                .as_array()
                .unwrap()
                .contains(&"code".into())
        );
    }

    #[test]
    fn only_service_failures_are_fatal() {
        assert!(ToolFailure::ToolServiceFailure.is_fatal());
        for f in [
            ToolFailure::PolicyRejected,
            ToolFailure::ExecutionTimeout,
            ToolFailure::ExecutionFault,
            ToolFailure::InvalidArguments,
            ToolFailure::UnknownTool,
        ] {
            assert!(!f.is_fatal(), "{f:?}");
        }
    }
}
