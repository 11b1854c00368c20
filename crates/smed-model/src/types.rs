// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The persisted domain model: sessions own messages, messages own parts.
//!
//! Ownership is strictly downward — a part stores only the id of its
//! message, a message only the id of its session.  The tagged-union parts
//! are persisted polymorphically, so every variant carries its
//! discriminant in the JSON envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Workspace directory this session operates on.
    pub directory: String,
    pub title: String,
    pub time_created: DateTime<Utc>,
    /// Points at the latest compaction part, when the session has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<SessionSummary>,
}

impl Session {
    pub fn new(directory: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: ids::session(),
            directory: directory.into(),
            title: title.into(),
            time_created: Utc::now(),
            summary: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub message_id: String,
    pub part_id: String,
}

/// Small record the REPL client keeps to remember its last session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStateEntry {
    pub session_id: String,
    pub model: String,
    pub provider: String,
    pub agent: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u32,
    pub output: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub time_created: DateTime<Utc>,
    /// Filled when the assistant reply completes; absent until then.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish: Option<FinishReason>,
}

impl Message {
    pub fn new(session_id: impl Into<String>, role: Role) -> Self {
        Self {
            id: ids::message(),
            session_id: session_id.into(),
            role,
            time_created: Utc::now(),
            tokens: None,
            error: None,
            finish: None,
        }
    }

    pub fn user(session_id: impl Into<String>) -> Self {
        Self::new(session_id, Role::User)
    }

    pub fn assistant(session_id: impl Into<String>) -> Self {
        Self::new(session_id, Role::Assistant)
    }
}

/// Why a provider turn stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolUse,
    Length,
    Error,
}

/// A typed fragment of a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text(TextPart),
    Tool(ToolPart),
    Compaction(CompactionPart),
}

impl Part {
    pub fn text(message_id: impl Into<String>, text: impl Into<String>) -> Self {
        Part::Text(TextPart {
            id: ids::part(),
            message_id: message_id.into(),
            text: text.into(),
        })
    }

    pub fn tool(
        message_id: impl Into<String>,
        tool: impl Into<String>,
        call_id: impl Into<String>,
    ) -> Self {
        Part::Tool(ToolPart {
            id: ids::part(),
            message_id: message_id.into(),
            tool: tool.into(),
            call_id: call_id.into(),
            state: ToolState::Pending,
        })
    }

    pub fn compaction(
        message_id: impl Into<String>,
        summary: impl Into<String>,
        count: usize,
    ) -> Self {
        Part::Compaction(CompactionPart {
            id: ids::part(),
            message_id: message_id.into(),
            summary: summary.into(),
            count,
        })
    }

    pub fn id(&self) -> &str {
        match self {
            Part::Text(p) => &p.id,
            Part::Tool(p) => &p.id,
            Part::Compaction(p) => &p.id,
        }
    }

    pub fn message_id(&self) -> &str {
        match self {
            Part::Text(p) => &p.message_id,
            Part::Tool(p) => &p.message_id,
            Part::Compaction(p) => &p.message_id,
        }
    }

    pub fn as_tool(&self) -> Option<&ToolPart> {
        match self {
            Part::Tool(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_tool_mut(&mut self) -> Option<&mut ToolPart> {
        match self {
            Part::Tool(p) => Some(p),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextPart {
    pub id: String,
    pub message_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPart {
    pub id: String,
    pub message_id: String,
    pub tool: String,
    /// Correlates this invocation with the result sent back to the provider
    /// on the next turn.  Unique per message.
    pub call_id: String,
    pub state: ToolState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionPart {
    pub id: String,
    pub message_id: String,
    pub summary: String,
    /// How many prior messages were folded into this summary.
    pub count: usize,
}

/// Tool invocation lifecycle.  Transitions only run forward:
/// `Pending → Running → (Completed | Error)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolState {
    Pending,
    Running {
        input: serde_json::Value,
    },
    Completed {
        input: serde_json::Value,
        output: String,
        metadata: serde_json::Value,
    },
    Error {
        input: serde_json::Value,
        error: String,
    },
}

impl ToolState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ToolState::Completed { .. } | ToolState::Error { .. })
    }

    pub fn input(&self) -> Option<&serde_json::Value> {
        match self {
            ToolState::Pending => None,
            ToolState::Running { input }
            | ToolState::Completed { input, .. }
            | ToolState::Error { input, .. } => Some(input),
        }
    }
}

// ─── Permissions ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionType {
    Bash,
    Edit,
    Webfetch,
    ExternalDirectory,
    DoomLoop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionReply {
    Once,
    Always,
    Reject,
}

/// A pending question to the user about one gated tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    /// Assigned on creation when left empty by the caller.
    #[serde(default)]
    pub id: String,
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: PermissionType,
    /// Command-shape patterns an "always" reply memoizes for the session.
    #[serde(default)]
    pub patterns: Vec<String>,
    pub title: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
