// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `GET /event` — the Server-Sent-Events mirror of the bus.
//!
//! Each frame is `event: <kind>` plus a single-line `data:` JSON object of
//! the `{type, properties}` shape.  The handler subscribes through a
//! bounded channel; a client that cannot keep up loses events rather than
//! stalling publishers, and a disconnect drops the subscription.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::Stream;
use tracing::debug;

use crate::AppState;

/// Events buffered per client before drops set in.
const CLIENT_BUFFER: usize = 256;

pub(crate) async fn events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let mut channel = state.bus.channel_all(CLIENT_BUFFER);
    debug!("event stream client connected");

    let stream = async_stream::stream! {
        // `channel` unsubscribes when this stream is dropped.
        while let Some(event) = channel.recv().await {
            match serde_json::to_string(&event) {
                Ok(data) => {
                    yield Ok(SseEvent::default().event(event.kind().name()).data(data));
                }
                Err(e) => {
                    debug!(error = %e, "dropping unserializable event");
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
