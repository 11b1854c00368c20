// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The canonical message layout sent to a model provider.
//!
//! This is distinct from the persisted [`crate::Message`] / [`crate::Part`]
//! tree: a provider sees a flat list of role-tagged messages where tool
//! results are correlated to the assistant's tool calls by `call_id`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMessage {
    pub role: WireRole,
    pub content: WireContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireContent {
    Text(String),
    ToolCall {
        call_id: String,
        tool: String,
        /// JSON-encoded argument object
        arguments: String,
    },
    ToolResult {
        call_id: String,
        content: String,
    },
}

impl ModelMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: WireRole::System,
            content: WireContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: WireRole::User,
            content: WireContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: WireRole::Assistant,
            content: WireContent::Text(text.into()),
        }
    }

    pub fn tool_call(
        call_id: impl Into<String>,
        tool: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            role: WireRole::Assistant,
            content: WireContent::ToolCall {
                call_id: call_id.into(),
                tool: tool.into(),
                arguments: arguments.into(),
            },
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: WireRole::Tool,
            content: WireContent::ToolResult {
                call_id: call_id.into(),
                content: content.into(),
            },
        }
    }

    /// The plain text of this message, when it carries any.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            WireContent::Text(t) => Some(t),
            _ => None,
        }
    }

    /// Character count used by the chars/4 token heuristic.
    pub fn chars(&self) -> usize {
        match &self.content {
            WireContent::Text(t) => t.len(),
            WireContent::ToolCall {
                tool, arguments, ..
            } => tool.len() + arguments.len(),
            WireContent::ToolResult { content, .. } => content.len(),
        }
    }
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct ProviderRequest {
    pub messages: Vec<ModelMessage>,
    pub tools: Vec<ToolSchema>,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
