// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{
    provider::EventStream, FinishReason, ModelMessage, Provider, ProviderError, ProviderEvent,
    ProviderRequest, WireRole,
};

/// Deterministic mock provider.  Echoes the last user message back as the
/// assistant response.
#[derive(Default)]
pub struct EchoProvider;

#[async_trait]
impl Provider for EchoProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn stream(&self, req: ProviderRequest) -> Result<EventStream, ProviderError> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, WireRole::User))
            .and_then(ModelMessage::as_text)
            .unwrap_or("[no input]")
            .to_string();

        let events = vec![
            ProviderEvent::TextDelta(format!("MOCK: {reply}")),
            ProviderEvent::UsageUpdate {
                input: 10,
                output: 10,
            },
            ProviderEvent::Finish(FinishReason::Stop),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// A pre-scripted provider.  Each `stream` call pops the next script from
/// the front of the queue, so tests can specify exact event sequences —
/// including the streaming tool-call protocol — without network access.
pub struct ScriptedProvider {
    scripts: Mutex<Vec<Vec<ProviderEvent>>>,
    /// Errors returned from `stream` itself (before any event), consumed
    /// first.  Lets tests exercise the retry path.
    open_errors: Mutex<Vec<ProviderError>>,
    /// The last request seen, for assertions on history layout.
    pub last_request: Arc<Mutex<Option<ProviderRequest>>>,
    /// Every request seen, in order.
    pub requests: Arc<Mutex<Vec<ProviderRequest>>>,
}

impl ScriptedProvider {
    /// The outer `Vec` is the ordered list of turns; the inner `Vec` is the
    /// event sequence emitted for that turn.
    pub fn new(scripts: Vec<Vec<ProviderEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            open_errors: Mutex::new(Vec::new()),
            last_request: Arc::new(Mutex::new(None)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fail the first `errors.len()` calls to `stream` with the given
    /// errors, then serve scripts as usual.
    pub fn with_open_errors(self, errors: Vec<ProviderError>) -> Self {
        *self.open_errors.lock().unwrap() = errors;
        self
    }

    /// Convenience: a single turn streaming `text` in one delta.
    pub fn always_text(text: impl Into<String>) -> Self {
        Self::new(vec![Self::text_turn(text)])
    }

    /// Event sequence for one plain text turn.
    pub fn text_turn(text: impl Into<String>) -> Vec<ProviderEvent> {
        vec![
            ProviderEvent::TextDelta(text.into()),
            ProviderEvent::UsageUpdate {
                input: 5,
                output: 5,
            },
            ProviderEvent::Finish(FinishReason::Stop),
        ]
    }

    /// Event sequence for one turn that requests a single tool call, with
    /// the arguments split across two fragments the way real providers
    /// stream them.
    pub fn tool_turn(
        call_id: impl Into<String>,
        tool: impl Into<String>,
        args_json: impl Into<String>,
    ) -> Vec<ProviderEvent> {
        let call_id = call_id.into();
        let args = args_json.into();
        let split = args.len() / 2;
        vec![
            ProviderEvent::ToolCallStart {
                call_id: call_id.clone(),
                tool: tool.into(),
            },
            ProviderEvent::ToolCallArgumentsDelta {
                call_id: call_id.clone(),
                fragment: args[..split].to_string(),
            },
            ProviderEvent::ToolCallArgumentsDelta {
                call_id: call_id.clone(),
                fragment: args[split..].to_string(),
            },
            ProviderEvent::ToolCallEnd { call_id },
            ProviderEvent::UsageUpdate {
                input: 5,
                output: 5,
            },
            ProviderEvent::Finish(FinishReason::ToolUse),
        ]
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }

    async fn stream(&self, req: ProviderRequest) -> Result<EventStream, ProviderError> {
        *self.last_request.lock().unwrap() = Some(req.clone());
        self.requests.lock().unwrap().push(req);

        {
            let mut errors = self.open_errors.lock().unwrap();
            if !errors.is_empty() {
                return Err(errors.remove(0));
            }
        }

        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed
                vec![
                    ProviderEvent::TextDelta("[no more scripts]".into()),
                    ProviderEvent::Finish(FinishReason::Stop),
                ]
            } else {
                scripts.remove(0)
            }
        };
        Ok(Box::pin(stream::iter(events)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
