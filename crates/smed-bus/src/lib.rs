// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Process-wide typed pub/sub.
//!
//! The event set is closed: every kind the server can emit is a variant of
//! [`Event`], serialized as `{type, properties}` so the wire shape matches
//! what the SSE stream sends to clients.  Consumers subscribe per kind or
//! to everything; `publish` fans out on detached tasks while
//! `publish_sync` runs every subscriber on the caller's task before
//! returning.
//!
//! Subscribers must not re-enter `publish_sync` and must not block on locks
//! the publisher holds.  A consumer that needs buffering forwards into its
//! own bounded channel — see [`Bus::channel_all`] — and accepts drops when
//! it falls behind; the bus itself never buffers.

mod event;

pub use event::*;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::trace;

type Callback = Arc<dyn Fn(Event) + Send + Sync + 'static>;

struct Registration {
    id: u64,
    /// `None` subscribes to every kind.
    kind: Option<EventKind>,
    callback: Callback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Registry {
    subs: Vec<Registration>,
    closed: bool,
}

#[derive(Default)]
pub struct Bus {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
}

impl Bus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `callback` for events of `kind`.
    pub fn subscribe(
        &self,
        kind: EventKind,
        callback: impl Fn(Event) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.register(Some(kind), Arc::new(callback))
    }

    /// Register `callback` for every event.
    pub fn subscribe_all(
        &self,
        callback: impl Fn(Event) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.register(None, Arc::new(callback))
    }

    fn register(&self, kind: Option<EventKind>, callback: Callback) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        registry.subs.push(Registration { id, kind, callback });
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        registry.subs.retain(|r| r.id != id.0);
    }

    /// Fan out asynchronously: snapshot the current subscribers, spawn one
    /// dispatch task per subscriber, return without waiting.
    pub fn publish(&self, event: Event) {
        let matching = self.snapshot(event.kind());
        trace!(kind = event.kind().name(), subscribers = matching.len(), "publish");
        for callback in matching {
            let event = event.clone();
            tokio::spawn(async move { callback(event) });
        }
    }

    /// Fan out on the caller's task; returns only after every subscriber
    /// has returned.  Order across subscribers is arbitrary but finite.
    pub fn publish_sync(&self, event: &Event) {
        let matching = self.snapshot(event.kind());
        trace!(kind = event.kind().name(), subscribers = matching.len(), "publish_sync");
        for callback in matching {
            callback(event.clone());
        }
    }

    fn snapshot(&self, kind: EventKind) -> Vec<Callback> {
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
        if registry.closed {
            return Vec::new();
        }
        registry
            .subs
            .iter()
            .filter(|r| r.kind.is_none() || r.kind == Some(kind))
            .map(|r| Arc::clone(&r.callback))
            .collect()
    }

    /// Drop every subscription; subsequent publishes are no-ops.
    pub fn close(&self) {
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        registry.subs.clear();
        registry.closed = true;
    }

    /// Drop every subscription but keep the bus usable.
    pub fn reset(&self) {
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        registry.subs.clear();
        registry.closed = false;
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .subs
            .len()
    }

    /// Subscribe with a bounded forwarding channel.  Events that arrive
    /// while the channel is full are dropped for this consumer only.
    /// Dropping the returned [`BusChannel`] unsubscribes.
    pub fn channel(self: &Arc<Self>, kind: EventKind, capacity: usize) -> BusChannel {
        let (tx, rx) = mpsc::channel(capacity);
        let id = self.subscribe(kind, move |event| {
            let _ = tx.try_send(event);
        });
        BusChannel {
            bus: Arc::clone(self),
            id,
            rx,
        }
    }

    /// Like [`Bus::channel`] but receives every event kind.
    pub fn channel_all(self: &Arc<Self>, capacity: usize) -> BusChannel {
        let (tx, rx) = mpsc::channel(capacity);
        let id = self.subscribe_all(move |event| {
            let _ = tx.try_send(event);
        });
        BusChannel {
            bus: Arc::clone(self),
            id,
            rx,
        }
    }
}

/// A channel-backed subscription; unsubscribes on drop.
pub struct BusChannel {
    bus: Arc<Bus>,
    id: SubscriptionId,
    pub rx: mpsc::Receiver<Event>,
}

impl BusChannel {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Drop for BusChannel {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    fn idle(sid: &str) -> Event {
        Event::SessionIdle {
            session_id: sid.into(),
        }
    }

    fn edited(path: &str) -> Event {
        Event::FileEdited {
            session_id: "ses_1".into(),
            path: path.into(),
        }
    }

    // ── publish_sync delivery ─────────────────────────────────────────────────

    #[test]
    fn sync_publish_reaches_kind_subscriber_exactly_once() {
        let bus = Bus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        bus.subscribe(EventKind::SessionIdle, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish_sync(&idle("ses_1"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sync_publish_skips_other_kinds() {
        let bus = Bus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        bus.subscribe(EventKind::SessionIdle, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish_sync(&edited("/tmp/a"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn subscribe_all_sees_every_kind() {
        let bus = Bus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        bus.subscribe_all(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish_sync(&idle("ses_1"));
        bus.publish_sync(&edited("/tmp/a"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribed_callback_is_not_invoked() {
        let bus = Bus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let id = bus.subscribe(EventKind::SessionIdle, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.unsubscribe(id);
        bus.publish_sync(&idle("ses_1"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsubscribe_after_subscribe_restores_subscriber_set() {
        let bus = Bus::new();
        assert_eq!(bus.subscriber_count(), 0);
        let id = bus.subscribe(EventKind::SessionIdle, |_| {});
        assert_eq!(bus.subscriber_count(), 1);
        bus.unsubscribe(id);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn sync_publish_preserves_publish_order_per_subscriber() {
        let bus = Bus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        bus.subscribe(EventKind::SessionIdle, move |e| {
            if let Event::SessionIdle { session_id } = e {
                s.lock().unwrap().push(session_id);
            }
        });
        for i in 0..10 {
            bus.publish_sync(&idle(&format!("ses_{i}")));
        }
        let seen = seen.lock().unwrap();
        let expected: Vec<String> = (0..10).map(|i| format!("ses_{i}")).collect();
        assert_eq!(*seen, expected);
    }

    // ── close / reset ─────────────────────────────────────────────────────────

    #[test]
    fn closed_bus_drops_publishes() {
        let bus = Bus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        bus.subscribe_all(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.close();
        bus.publish_sync(&idle("ses_1"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reset_clears_subscriptions_but_allows_new_ones() {
        let bus = Bus::new();
        bus.subscribe_all(|_| {});
        bus.reset();
        assert_eq!(bus.subscriber_count(), 0);

        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        bus.subscribe_all(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish_sync(&idle("ses_1"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    // ── async publish ─────────────────────────────────────────────────────────

    #[tokio::test(flavor = "multi_thread")]
    async fn async_publish_eventually_reaches_subscriber() {
        let bus = Bus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(EventKind::SessionIdle, move |e| {
            let _ = tx.send(e);
        });
        bus.publish(idle("ses_9"));
        let got = rx.recv().await.unwrap();
        assert!(matches!(got, Event::SessionIdle { session_id } if session_id == "ses_9"));
    }

    #[tokio::test]
    async fn channel_forwards_matching_events() {
        let bus = Bus::new();
        let mut ch = bus.channel(EventKind::FileEdited, 8);
        bus.publish_sync(&edited("/tmp/x"));
        let got = ch.recv().await.unwrap();
        assert!(matches!(got, Event::FileEdited { path, .. } if path == "/tmp/x"));
    }

    #[tokio::test]
    async fn channel_drops_when_full_without_blocking_publisher() {
        let bus = Bus::new();
        let mut ch = bus.channel_all(1);
        bus.publish_sync(&idle("ses_1"));
        bus.publish_sync(&idle("ses_2")); // dropped: channel full, nobody reading
        assert!(ch.try_recv().is_some());
        assert!(ch.try_recv().is_none());
    }

    #[tokio::test]
    async fn dropping_channel_unsubscribes() {
        let bus = Bus::new();
        let ch = bus.channel_all(8);
        assert_eq!(bus.subscriber_count(), 1);
        drop(ch);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
