//! Tool call routing.
//!
//! Dispatch is split in two so the orchestrator can announce what is about
//! to happen before it happens: [`ToolDispatcher::prepare`] parses the
//! arguments and runs the policy check (pure, no I/O), and
//! [`ToolDispatcher::dispatch`] performs the prepared call.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::{info, warn};

use super::search::SearchService;
use super::{
    CodeOutput, RUN_PYTHON, RunPythonArgs, ToolFailure, ToolResult, WEB_SEARCH, WebSearchArgs,
};
use crate::ToolCall;
use crate::policy::{AcceptedCode, PolicyEvaluator, PolicyVerdict, PolicyViolation};
use crate::sandbox::{ExecutionFailure, ExecutionResult, Executor};

/// A tool call after argument parsing and policy evaluation.
#[derive(Debug, Clone)]
pub enum PreparedCall {
    WebSearch { query: String },
    RunPython(AcceptedCode),
    /// `run_python` whose code the policy rejected. Never executed.
    Rejected {
        code: String,
        violation: PolicyViolation,
    },
    InvalidArguments { tool: String, message: String },
    Unknown { tool: String },
}

impl PreparedCall {
    pub fn tool_name(&self) -> &str {
        match self {
            PreparedCall::WebSearch { .. } => WEB_SEARCH,
            PreparedCall::RunPython(_) | PreparedCall::Rejected { .. } => RUN_PYTHON,
            PreparedCall::InvalidArguments { tool, .. } | PreparedCall::Unknown { tool } => {
                tool.as_str()
            }
        }
    }

    /// The `tool_status` line announced before dispatch.
    pub fn status_line(&self) -> String {
        match self {
            PreparedCall::WebSearch { query } => format!("Searching the web for: {query}"),
            PreparedCall::RunPython(_) => "Running Python code...".to_string(),
            PreparedCall::Rejected { violation, .. } => {
                format!("Python code rejected by policy: {violation}")
            }
            PreparedCall::InvalidArguments { tool, .. } | PreparedCall::Unknown { tool } => {
                format!("Calling tool: {tool}")
            }
        }
    }
}

pub struct ToolDispatcher {
    policy: PolicyEvaluator,
    executor: Arc<dyn Executor>,
    search: Arc<dyn SearchService>,
}

impl ToolDispatcher {
    pub fn new(
        policy: PolicyEvaluator,
        executor: Arc<dyn Executor>,
        search: Arc<dyn SearchService>,
    ) -> Self {
        Self {
            policy,
            executor,
            search,
        }
    }

    pub fn policy(&self) -> &PolicyEvaluator {
        &self.policy
    }

    /// Parse arguments and evaluate policy. Never spawns anything.
    pub fn prepare(&self, call: &ToolCall) -> PreparedCall {
        match call.name() {
            WEB_SEARCH => match parse_args::<WebSearchArgs>(call) {
                Ok(args) => PreparedCall::WebSearch { query: args.query },
                Err(message) => PreparedCall::InvalidArguments {
                    tool: WEB_SEARCH.to_string(),
                    message,
                },
            },
            RUN_PYTHON => match parse_args::<RunPythonArgs>(call) {
                Ok(args) => match self.policy.evaluate(&args.code) {
                    PolicyVerdict::Accept(code) => PreparedCall::RunPython(code),
                    PolicyVerdict::Reject(violation) => PreparedCall::Rejected {
                        code: args.code,
                        violation,
                    },
                },
                Err(message) => PreparedCall::InvalidArguments {
                    tool: RUN_PYTHON.to_string(),
                    message,
                },
            },
            other => PreparedCall::Unknown {
                tool: other.to_string(),
            },
        }
    }

    /// Perform a prepared call.
    pub async fn dispatch(&self, prepared: PreparedCall) -> ToolResult {
        match prepared {
            PreparedCall::WebSearch { query } => {
                info!("Executing web_search for: {query}");
                match self.search.search(&query).await {
                    Ok(text) => {
                        info!("Search result length: {}", text.len());
                        ToolResult::ok(WEB_SEARCH, text)
                    }
                    Err(e) => {
                        warn!("web_search failed: {e}");
                        ToolResult::failed(
                            WEB_SEARCH,
                            ToolFailure::ToolServiceFailure,
                            format!("Web search failed: {e}"),
                        )
                    }
                }
            }
            PreparedCall::RunPython(code) => {
                info!("Executing run_python ({} chars)", code.source().len());
                let result = self.executor.execute(&code).await;
                execution_result(&result).with_code_output(CodeOutput {
                    code: code.source().to_string(),
                    stdout: result.stdout.clone(),
                    stderr: result.stderr.clone(),
                    images: result.artifacts.iter().map(|a| a.url.clone()).collect(),
                    success: result.success,
                })
            }
            PreparedCall::Rejected { code, violation } => {
                info!("run_python rejected by policy: {violation}");
                ToolResult::failed(
                    RUN_PYTHON,
                    ToolFailure::PolicyRejected,
                    format!("VALIDATION ERRORS:\n{violation}"),
                )
                .with_code_output(CodeOutput {
                    code,
                    stdout: String::new(),
                    stderr: String::new(),
                    images: Vec::new(),
                    success: false,
                })
            }
            PreparedCall::InvalidArguments { tool, message } => {
                warn!("Invalid arguments for {tool}: {message}");
                ToolResult::failed(tool, ToolFailure::InvalidArguments, message)
            }
            PreparedCall::Unknown { tool } => {
                warn!("Model called unknown tool: {tool}");
                let content = format!("Unknown tool: {tool}");
                ToolResult::failed(tool, ToolFailure::UnknownTool, content)
            }
        }
    }

    pub async fn dispatch_call(&self, call: &ToolCall) -> ToolResult {
        self.dispatch(self.prepare(call)).await
    }
}

fn parse_args<T: DeserializeOwned>(call: &ToolCall) -> Result<T, String> {
    let args = serde_json::Value::Object(call.arguments_object());
    serde_json::from_value(args).map_err(|e| {
        format!(
            "Error: invalid arguments for {}: {e}. \
             Please provide valid JSON matching the tool's parameter schema.",
            call.name()
        )
    })
}

/// Normalize an execution result into tool content.
fn execution_result(result: &ExecutionResult) -> ToolResult {
    info!(
        "Code execution: success={}, stdout={} chars, images={}",
        result.success,
        result.stdout.len(),
        result.artifacts.len()
    );

    let mut parts = Vec::new();
    if !result.stdout.is_empty() {
        parts.push(format!("STDOUT:\n{}", result.stdout));
    }
    if !result.stderr.is_empty() {
        parts.push(format!("STDERR:\n{}", result.stderr));
    }
    if !result.artifacts.is_empty() {
        let urls: Vec<&str> = result.artifacts.iter().map(|a| a.url.as_str()).collect();
        parts.push(format!("IMAGES:\n{}", urls.join("\n")));
    }
    if parts.is_empty() {
        parts.push("Code executed successfully with no output.".to_string());
    }
    let content = parts.join("\n\n");

    match result.failure() {
        None => ToolResult::ok(RUN_PYTHON, content),
        Some(ExecutionFailure::Timeout) => {
            ToolResult::failed(RUN_PYTHON, ToolFailure::ExecutionTimeout, content)
        }
        Some(ExecutionFailure::Fault) => {
            ToolResult::failed(RUN_PYTHON, ToolFailure::ExecutionFault, content)
        }
    }
}
