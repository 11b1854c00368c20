// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

use smed_model::{Message, Part, PermissionReply, PermissionRequest, Session};

/// Everything the server can tell its observers, as one closed set.
///
/// The serialized form is `{"type": "<kind>", "properties": {...}}` — the
/// exact shape each SSE frame carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "properties")]
pub enum Event {
    #[serde(rename = "session.created")]
    SessionCreated { session: Session },
    #[serde(rename = "session.updated")]
    SessionUpdated { session: Session },
    #[serde(rename = "session.deleted")]
    SessionDeleted { session_id: String },
    /// Terminal event of a successful processor run.
    #[serde(rename = "session.idle")]
    SessionIdle { session_id: String },
    #[serde(rename = "session.status")]
    SessionStatus {
        session_id: String,
        status: SessionStatus,
    },
    /// Terminal event of a failed processor run.
    #[serde(rename = "session.error")]
    SessionError {
        session_id: String,
        error: ErrorPayload,
    },
    #[serde(rename = "session.diff")]
    SessionDiff {
        session_id: String,
        file: String,
        diff: String,
    },
    #[serde(rename = "session.compacted")]
    SessionCompacted {
        session_id: String,
        /// Messages folded into the summary
        count: usize,
        tokens_before: usize,
        tokens_after: usize,
    },

    #[serde(rename = "message.created")]
    MessageCreated { message: Message },
    #[serde(rename = "message.updated")]
    MessageUpdated { message: Message },
    #[serde(rename = "message.removed")]
    MessageRemoved {
        session_id: String,
        message_id: String,
    },

    #[serde(rename = "message.part.updated")]
    PartUpdated {
        part: Part,
        /// Present when this update appends streamed text to the part.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delta: Option<String>,
    },
    #[serde(rename = "message.part.removed")]
    PartRemoved {
        message_id: String,
        part_id: String,
    },

    #[serde(rename = "file.edited")]
    FileEdited { session_id: String, path: String },

    #[serde(rename = "permission.updated")]
    PermissionUpdated { request: PermissionRequest },
    #[serde(rename = "permission.replied")]
    PermissionReplied {
        session_id: String,
        request_id: String,
        granted: bool,
        response: PermissionReply,
    },

    #[serde(rename = "client-tool.request")]
    ClientToolRequest {
        session_id: String,
        call_id: String,
        tool: String,
        input: serde_json::Value,
    },
    #[serde(rename = "client-tool.registered")]
    ClientToolRegistered { name: String },
    #[serde(rename = "client-tool.unregistered")]
    ClientToolUnregistered { name: String },
    #[serde(rename = "client-tool.executing")]
    ClientToolExecuting { call_id: String },
    #[serde(rename = "client-tool.completed")]
    ClientToolCompleted {
        call_id: String,
        output: serde_json::Value,
    },
    #[serde(rename = "client-tool.failed")]
    ClientToolFailed { call_id: String, error: String },

    #[serde(rename = "vcs.branch.updated")]
    VcsBranchUpdated { directory: String, branch: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Busy,
    Idle,
}

/// Structured error payload mirrored by HTTP error bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SessionCreated,
    SessionUpdated,
    SessionDeleted,
    SessionIdle,
    SessionStatus,
    SessionError,
    SessionDiff,
    SessionCompacted,
    MessageCreated,
    MessageUpdated,
    MessageRemoved,
    PartUpdated,
    PartRemoved,
    FileEdited,
    PermissionUpdated,
    PermissionReplied,
    ClientToolRequest,
    ClientToolRegistered,
    ClientToolUnregistered,
    ClientToolExecuting,
    ClientToolCompleted,
    ClientToolFailed,
    VcsBranchUpdated,
}

impl EventKind {
    /// The wire name, identical to the serde rename on [`Event`].
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionCreated => "session.created",
            Self::SessionUpdated => "session.updated",
            Self::SessionDeleted => "session.deleted",
            Self::SessionIdle => "session.idle",
            Self::SessionStatus => "session.status",
            Self::SessionError => "session.error",
            Self::SessionDiff => "session.diff",
            Self::SessionCompacted => "session.compacted",
            Self::MessageCreated => "message.created",
            Self::MessageUpdated => "message.updated",
            Self::MessageRemoved => "message.removed",
            Self::PartUpdated => "message.part.updated",
            Self::PartRemoved => "message.part.removed",
            Self::FileEdited => "file.edited",
            Self::PermissionUpdated => "permission.updated",
            Self::PermissionReplied => "permission.replied",
            Self::ClientToolRequest => "client-tool.request",
            Self::ClientToolRegistered => "client-tool.registered",
            Self::ClientToolUnregistered => "client-tool.unregistered",
            Self::ClientToolExecuting => "client-tool.executing",
            Self::ClientToolCompleted => "client-tool.completed",
            Self::ClientToolFailed => "client-tool.failed",
            Self::VcsBranchUpdated => "vcs.branch.updated",
        }
    }
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::SessionCreated { .. } => EventKind::SessionCreated,
            Event::SessionUpdated { .. } => EventKind::SessionUpdated,
            Event::SessionDeleted { .. } => EventKind::SessionDeleted,
            Event::SessionIdle { .. } => EventKind::SessionIdle,
            Event::SessionStatus { .. } => EventKind::SessionStatus,
            Event::SessionError { .. } => EventKind::SessionError,
            Event::SessionDiff { .. } => EventKind::SessionDiff,
            Event::SessionCompacted { .. } => EventKind::SessionCompacted,
            Event::MessageCreated { .. } => EventKind::MessageCreated,
            Event::MessageUpdated { .. } => EventKind::MessageUpdated,
            Event::MessageRemoved { .. } => EventKind::MessageRemoved,
            Event::PartUpdated { .. } => EventKind::PartUpdated,
            Event::PartRemoved { .. } => EventKind::PartRemoved,
            Event::FileEdited { .. } => EventKind::FileEdited,
            Event::PermissionUpdated { .. } => EventKind::PermissionUpdated,
            Event::PermissionReplied { .. } => EventKind::PermissionReplied,
            Event::ClientToolRequest { .. } => EventKind::ClientToolRequest,
            Event::ClientToolRegistered { .. } => EventKind::ClientToolRegistered,
            Event::ClientToolUnregistered { .. } => EventKind::ClientToolUnregistered,
            Event::ClientToolExecuting { .. } => EventKind::ClientToolExecuting,
            Event::ClientToolCompleted { .. } => EventKind::ClientToolCompleted,
            Event::ClientToolFailed { .. } => EventKind::ClientToolFailed,
            Event::VcsBranchUpdated { .. } => EventKind::VcsBranchUpdated,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
