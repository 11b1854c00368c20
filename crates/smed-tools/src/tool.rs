// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use smed_model::PermissionType;

/// What the processor hands a tool for one invocation.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: String,
    /// The session's workspace directory
    pub directory: PathBuf,
    /// Cancelled when the run is aborted; long-running tools must watch it.
    pub cancel: CancellationToken,
}

/// The result of a successful tool invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolResult {
    /// Text fed back to the model as the tool result
    pub output: String,
    /// Structured extras persisted on the tool part (line counts, exit
    /// codes, diagnostics)
    pub metadata: Value,
    /// Workspace files this invocation created or modified
    pub edited: Vec<String>,
}

impl ToolResult {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            metadata: Value::Null,
            edited: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ToolError(pub String);

impl ToolError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Trait every tool exposed to the model implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the input object
    fn schema(&self) -> Value;
    /// The permission category this tool's calls fall under, if any.
    /// `Bash` routes the call through command-pattern matching.
    fn permission(&self) -> Option<PermissionType> {
        None
    }
    /// Execute the tool.  Tool failures are reported as `Err`; the run
    /// continues and the error text is fed back to the model.
    async fn invoke(&self, ctx: &ToolContext, input: Value) -> Result<ToolResult, ToolError>;
}
