// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Context compaction.
//!
//! When the running token estimate crosses the threshold, the oldest
//! messages are folded into a model-written summary: one provider call with
//! a fixed prompt and no tools.  The folded messages are deleted, the
//! summary lands in a compaction part, and the session's summary pointer
//! makes the history builder render it ahead of the retained tail.

use futures::StreamExt;
use tracing::{debug, warn};

use smed_bus::Event;
use smed_model::{
    Message, ModelMessage, Part, ProviderEvent, ProviderRequest, SessionSummary,
};

use crate::processor::Processor;
use crate::ProcessError;

const COMPACTION_PROMPT: &str = "You are summarizing an agent coding session \
so it can continue in a smaller context window. Write a dense summary of the \
conversation so far: the user's goal, what was changed (files, commands), \
important findings, and what remains to be done. Reply with the summary only.";

/// `ceil(chars / 4)` per message, summed — cheap and monotone, a heuristic
/// for the compaction threshold, never a hard guarantee.
pub fn estimate_tokens(messages: &[(Message, Vec<Part>)]) -> usize {
    messages
        .iter()
        .map(|(_, parts)| {
            let chars: usize = parts.iter().map(part_chars).sum();
            chars.div_ceil(4)
        })
        .sum()
}

fn part_chars(part: &Part) -> usize {
    match part {
        Part::Text(tp) => tp.text.len(),
        Part::Tool(tp) => {
            let input = tp.state.input().map(|v| v.to_string().len()).unwrap_or(0);
            let output = match &tp.state {
                smed_model::ToolState::Completed { output, .. } => output.len(),
                smed_model::ToolState::Error { error, .. } => error.len(),
                _ => 0,
            };
            tp.tool.len() + input + output
        }
        Part::Compaction(cp) => cp.summary.len(),
    }
}

impl Processor {
    /// Fold old messages when the estimate crosses the threshold.  Keeps at
    /// least `min_messages_to_keep` recent messages verbatim; a session
    /// with no more than that is never compacted.
    pub(crate) async fn maybe_compact(
        &self,
        session_id: &str,
        model: &str,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<(), ProcessError> {
        let mut session = self.store().session(session_id)?;
        let messages = self.store().messages_with_parts(session_id)?;
        let tokens_before = estimate_tokens(&messages);
        let threshold =
            (self.limits().max_context_tokens as f32 * self.limits().context_threshold) as usize;
        if tokens_before < threshold {
            return Ok(());
        }
        let keep = self.limits().min_messages_to_keep;
        if messages.len() <= keep {
            return Ok(());
        }
        let fold_count = messages.len() - keep;
        let to_fold = &messages[..fold_count];
        debug!(
            session = %session_id,
            tokens = tokens_before,
            folding = fold_count,
            "context over threshold, compacting"
        );

        let request = summary_request(&session, to_fold, model);
        let summary = match self.summarize(request, cancel).await {
            Ok(text) if !text.is_empty() => text,
            Ok(_) => {
                warn!(session = %session_id, "compaction returned an empty summary; skipping");
                return Ok(());
            }
            Err(ProcessError::Aborted) => return Err(ProcessError::Aborted),
            Err(e) => {
                // A failed summarization must not kill the run; the next
                // threshold crossing retries.
                warn!(session = %session_id, error = %e, "compaction call failed; skipping");
                return Ok(());
            }
        };

        let holder = Message::assistant(session_id);
        let part = Part::compaction(&holder.id, summary, fold_count);
        self.store().save_message(&holder)?;
        self.store().save_part(&part)?;
        self.bus().publish_sync(&Event::MessageCreated {
            message: holder.clone(),
        });
        self.bus().publish_sync(&Event::PartUpdated {
            part: part.clone(),
            delta: None,
        });

        for (message, _) in to_fold {
            self.store().delete_message(message)?;
        }

        session.summary = Some(SessionSummary {
            message_id: holder.id.clone(),
            part_id: part.id().to_string(),
        });
        self.store().update_session(&session)?;

        let tokens_after = estimate_tokens(&self.store().messages_with_parts(session_id)?);
        self.bus().publish_sync(&Event::SessionCompacted {
            session_id: session_id.to_string(),
            count: fold_count,
            tokens_before,
            tokens_after,
        });
        Ok(())
    }

    /// One tool-free provider turn; returns the streamed text.
    async fn summarize(
        &self,
        request: ProviderRequest,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<String, ProcessError> {
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProcessError::Aborted),
            r = self.provider().stream(request) => r.map_err(ProcessError::Provider)?,
        };
        let mut text = String::new();
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProcessError::Aborted),
                ev = stream.next() => ev,
            };
            match event {
                Some(ProviderEvent::TextDelta(delta)) => text.push_str(&delta),
                Some(ProviderEvent::Error(e)) => return Err(ProcessError::Provider(e)),
                Some(ProviderEvent::Finish(_)) | None => break,
                Some(_) => {}
            }
        }
        Ok(text.trim().to_string())
    }
}

fn summary_request(
    session: &smed_model::Session,
    to_fold: &[(Message, Vec<Part>)],
    model: &str,
) -> ProviderRequest {
    let mut messages = vec![ModelMessage::system(COMPACTION_PROMPT)];
    // Reuse the normal history rendering for the folded slice so tool calls
    // and results keep their wire shape.
    let rendered = crate::history::build_history(session, to_fold);
    messages.extend(rendered.into_iter().skip(1)); // drop the nested system prompt
    messages.push(ModelMessage::user(
        "Summarize the conversation above as instructed.",
    ));
    ProviderRequest {
        messages,
        tools: Vec::new(),
        model: model.to_string(),
        temperature: None,
        max_tokens: None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
