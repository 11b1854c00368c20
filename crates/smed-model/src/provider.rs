// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{FinishReason, ProviderRequest};

/// A single streamed event from the model.
///
/// Streams are finite: a well-behaved provider terminates after emitting
/// `Finish` or `Error`.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// A text chunk streamed from the model
    TextDelta(String),
    /// The model opened a tool call
    ToolCallStart { call_id: String, tool: String },
    /// A fragment of the tool call's JSON arguments
    ToolCallArgumentsDelta { call_id: String, fragment: String },
    /// The tool call's arguments are complete
    ToolCallEnd { call_id: String },
    /// Running usage statistics
    UsageUpdate { input: u32, output: u32 },
    /// The stream finished
    Finish(FinishReason),
    /// The provider failed; `retryable` selects the retry path
    Error(ProviderError),
}

#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    pub fn fatal(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Missing or rejected credentials
    Auth,
    /// Unknown or unavailable model
    BadModel,
    /// The stream violated the wire protocol
    MalformedStream,
    RateLimit,
    Overloaded,
    Network,
    Other,
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Auth => "auth",
            Self::BadModel => "bad_model",
            Self::MalformedStream => "malformed_stream",
            Self::RateLimit => "rate_limit",
            Self::Overloaded => "overloaded",
            Self::Network => "network",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = ProviderEvent> + Send>>;

#[async_trait]
pub trait Provider: Send + Sync {
    /// Human-readable provider name for status display.
    fn name(&self) -> &str;

    /// Open one streaming completion turn.
    async fn stream(&self, req: ProviderRequest) -> Result<EventStream, ProviderError>;
}
