// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Turning the persisted message tree into the provider's wire layout.

use smed_model::{Message, ModelMessage, Part, Role, Session, ToolState};

/// Stable system prompt prefix; the workspace directory is appended so the
/// model knows where relative paths land.
const SYSTEM_PROMPT: &str = "You are smed, a headless coding agent. \
You operate on the user's workspace with the tools provided. \
Prefer small, verifiable steps and report what you changed.";

/// Build the flat provider history for one turn.
///
/// The compaction summary, when present, is rendered first so the retained
/// tail reads as a continuation; the message holding the summary part is
/// skipped in the normal sweep.  Within one assistant message every tool
/// call is emitted before the first tool result, which is the layout the
/// OpenAI-style wire format requires for parallel calls.
pub(crate) fn build_history(
    session: &Session,
    messages: &[(Message, Vec<Part>)],
) -> Vec<ModelMessage> {
    let mut out = Vec::new();
    out.push(ModelMessage::system(format!(
        "{SYSTEM_PROMPT}\n\nWorkspace directory: {}",
        session.directory
    )));

    if let Some(summary) = &session.summary {
        if let Some(text) = find_summary(messages, &summary.part_id) {
            out.push(ModelMessage::user(format!(
                "Summary of the conversation so far (earlier messages were compacted):\n\n{text}"
            )));
        }
    }

    for (message, parts) in messages {
        if session
            .summary
            .as_ref()
            .is_some_and(|s| s.message_id == message.id)
        {
            continue;
        }
        match message.role {
            Role::User => {
                for part in parts {
                    if let Part::Text(tp) = part {
                        out.push(ModelMessage::user(tp.text.clone()));
                    }
                }
            }
            Role::Assistant => {
                let mut results = Vec::new();
                for part in parts {
                    match part {
                        Part::Text(tp) => out.push(ModelMessage::assistant(tp.text.clone())),
                        Part::Tool(tp) => match &tp.state {
                            ToolState::Completed { input, output, .. } => {
                                out.push(ModelMessage::tool_call(
                                    &tp.call_id,
                                    &tp.tool,
                                    input.to_string(),
                                ));
                                results.push(ModelMessage::tool_result(&tp.call_id, output));
                            }
                            ToolState::Error { input, error } => {
                                out.push(ModelMessage::tool_call(
                                    &tp.call_id,
                                    &tp.tool,
                                    input.to_string(),
                                ));
                                results.push(ModelMessage::tool_result(
                                    &tp.call_id,
                                    format!("ERROR: {error}"),
                                ));
                            }
                            // A part that never finished carries nothing the
                            // model can use.
                            ToolState::Pending | ToolState::Running { .. } => {}
                        },
                        Part::Compaction(_) => {}
                    }
                }
                out.extend(results);
            }
        }
    }
    out
}

fn find_summary<'a>(messages: &'a [(Message, Vec<Part>)], part_id: &str) -> Option<&'a str> {
    for (_, parts) in messages {
        for part in parts {
            if let Part::Compaction(cp) = part {
                if cp.id == part_id {
                    return Some(&cp.summary);
                }
            }
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
