// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use smed_core::ProcessError;
use smed_storage::StorageError;

/// HTTP error whose body mirrors the `session.error` payload shape:
/// `{"error": {"kind", "message"}}`.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: String,
    pub message: String,
}

impl ApiError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "invalid_input".into(),
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: "not_found".into(),
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "error": { "kind": self.kind, "message": self.message }
        }));
        (self.status, body).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(key) => Self::not_found(format!("not found: {key}")),
            StorageError::Corrupt { .. } => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                kind: "corruption".into(),
                message: e.to_string(),
            },
            other => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                kind: "storage".into(),
                message: other.to_string(),
            },
        }
    }
}

impl From<ProcessError> for ApiError {
    fn from(e: ProcessError) -> Self {
        Self {
            status: crate::process_error_status(&e),
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
