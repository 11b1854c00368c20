// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The interactive gate in front of tool execution.
//!
//! A gated call turns into a [`PermissionRequest`] published on the bus;
//! the run blocks until some client replies or the run is cancelled.
//! "Always" replies are memoized per session, by request type and by
//! command pattern, so the same question is never asked twice.

pub mod bash;
mod doom;

pub use doom::{fingerprint_hex, DoomLoopDetector};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use smed_bus::{Bus, Event};
use smed_config::PermissionAction;
use smed_model::{ids, PermissionReply, PermissionRequest, PermissionType};

#[derive(Debug, Error)]
pub enum PermissionError {
    #[error("permission rejected: {0}")]
    Rejected(String),

    #[error("permission wait cancelled")]
    Cancelled,
}

/// The processor's view of a permission checker.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    /// Gate one tool call.  `Ok(())` means it may run.
    async fn check(
        &self,
        cancel: &CancellationToken,
        req: PermissionRequest,
        action: PermissionAction,
    ) -> Result<(), PermissionError>;

    /// Deliver a user reply for a pending request.  Returns `false` when no
    /// request with that id is waiting.
    fn respond(&self, request_id: &str, reply: PermissionReply) -> bool;
}

#[derive(Default)]
struct CheckerState {
    /// Per session: request types approved with "always".
    approved_types: HashMap<String, HashSet<PermissionType>>,
    /// Per session: command patterns approved with "always".
    approved_patterns: HashMap<String, HashSet<String>>,
    pending: HashMap<String, oneshot::Sender<PermissionReply>>,
}

/// The interactive checker.
pub struct Checker {
    bus: Arc<Bus>,
    state: Mutex<CheckerState>,
}

impl Checker {
    pub fn new(bus: Arc<Bus>) -> Self {
        Self {
            bus,
            state: Mutex::new(CheckerState::default()),
        }
    }

    /// Forget a session's memoized approvals (e.g. when it is deleted).
    pub fn forget_session(&self, session_id: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.approved_types.remove(session_id);
        state.approved_patterns.remove(session_id);
    }

    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending
            .len()
    }

    async fn ask(
        &self,
        cancel: &CancellationToken,
        mut req: PermissionRequest,
    ) -> Result<(), PermissionError> {
        let rx = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

            if let Some(types) = state.approved_types.get(&req.session_id) {
                if types.contains(&req.kind) {
                    return Ok(());
                }
            }
            if !req.patterns.is_empty() {
                if let Some(patterns) = state.approved_patterns.get(&req.session_id) {
                    if req.patterns.iter().all(|p| patterns.contains(p)) {
                        return Ok(());
                    }
                }
            }

            if req.id.is_empty() {
                req.id = ids::permission();
            }
            let (tx, rx) = oneshot::channel();
            state.pending.insert(req.id.clone(), tx);
            rx
        };

        debug!(
            request = %req.id,
            session = %req.session_id,
            kind = ?req.kind,
            "waiting for permission reply"
        );
        self.bus.publish_sync(&Event::PermissionUpdated {
            request: req.clone(),
        });

        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = rx => r.ok(),
        };

        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.pending.remove(&req.id);
            if reply == Some(PermissionReply::Always) {
                state
                    .approved_types
                    .entry(req.session_id.clone())
                    .or_default()
                    .insert(req.kind);
                state
                    .approved_patterns
                    .entry(req.session_id.clone())
                    .or_default()
                    .extend(req.patterns.iter().cloned());
            }
        }

        let granted = matches!(reply, Some(PermissionReply::Once | PermissionReply::Always));
        self.bus.publish_sync(&Event::PermissionReplied {
            session_id: req.session_id.clone(),
            request_id: req.id.clone(),
            granted,
            response: reply.unwrap_or(PermissionReply::Reject),
        });

        match reply {
            Some(PermissionReply::Once) | Some(PermissionReply::Always) => Ok(()),
            Some(PermissionReply::Reject) => Err(PermissionError::Rejected(req.title)),
            None => Err(PermissionError::Cancelled),
        }
    }
}

#[async_trait]
impl PermissionGate for Checker {
    async fn check(
        &self,
        cancel: &CancellationToken,
        req: PermissionRequest,
        action: PermissionAction,
    ) -> Result<(), PermissionError> {
        match action {
            PermissionAction::Allow => Ok(()),
            PermissionAction::Deny => Err(PermissionError::Rejected(req.title)),
            PermissionAction::Ask => self.ask(cancel, req).await,
        }
    }

    fn respond(&self, request_id: &str, reply: PermissionReply) -> bool {
        let sender = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.pending.remove(request_id)
        };
        match sender {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }
}

/// Headless checker: grants every ask.  Hard `deny` actions still reject —
/// running unattended is no reason to ignore an explicit deny rule.  With
/// `trace` enabled it publishes the request/reply pair so observers still
/// see what would have been asked.
pub struct AutoApprover {
    bus: Arc<Bus>,
    trace: bool,
}

impl AutoApprover {
    pub fn new(bus: Arc<Bus>) -> Self {
        Self { bus, trace: false }
    }

    pub fn with_trace(bus: Arc<Bus>) -> Self {
        Self { bus, trace: true }
    }
}

#[async_trait]
impl PermissionGate for AutoApprover {
    async fn check(
        &self,
        _cancel: &CancellationToken,
        mut req: PermissionRequest,
        action: PermissionAction,
    ) -> Result<(), PermissionError> {
        if action == PermissionAction::Deny {
            return Err(PermissionError::Rejected(req.title));
        }
        if self.trace {
            if req.id.is_empty() {
                req.id = ids::permission();
            }
            self.bus.publish_sync(&Event::PermissionUpdated {
                request: req.clone(),
            });
            self.bus.publish_sync(&Event::PermissionReplied {
                session_id: req.session_id,
                request_id: req.id,
                granted: true,
                response: PermissionReply::Always,
            });
        }
        Ok(())
    }

    fn respond(&self, _request_id: &str, _reply: PermissionReply) -> bool {
        false
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: PermissionType, patterns: &[&str]) -> PermissionRequest {
        PermissionRequest {
            id: String::new(),
            session_id: "ses_1".into(),
            kind,
            patterns: patterns.iter().map(|s| s.to_string()).collect(),
            title: "test request".into(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Grab the request id the checker published for its pending ask.
    fn published_request_id(bus: &Arc<Bus>) -> Arc<Mutex<Option<String>>> {
        let id = Arc::new(Mutex::new(None));
        let captured = Arc::clone(&id);
        bus.subscribe(smed_bus::EventKind::PermissionUpdated, move |e| {
            if let Event::PermissionUpdated { request } = e {
                *captured.lock().unwrap() = Some(request.id);
            }
        });
        id
    }

    #[tokio::test]
    async fn allow_passes_without_asking() {
        let bus = Bus::new();
        let checker = Checker::new(Arc::clone(&bus));
        let cancel = CancellationToken::new();
        let result = checker
            .check(&cancel, request(PermissionType::Edit, &[]), PermissionAction::Allow)
            .await;
        assert!(result.is_ok());
        assert_eq!(checker.pending_count(), 0);
    }

    #[tokio::test]
    async fn deny_rejects_without_asking() {
        let bus = Bus::new();
        let checker = Checker::new(Arc::clone(&bus));
        let cancel = CancellationToken::new();
        let result = checker
            .check(&cancel, request(PermissionType::Edit, &[]), PermissionAction::Deny)
            .await;
        assert!(matches!(result, Err(PermissionError::Rejected(_))));
    }

    #[tokio::test]
    async fn ask_resolves_with_once_reply() {
        let bus = Bus::new();
        let checker = Arc::new(Checker::new(Arc::clone(&bus)));
        let req_id = published_request_id(&bus);
        let cancel = CancellationToken::new();

        let waiter = {
            let checker = Arc::clone(&checker);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                checker
                    .check(&cancel, request(PermissionType::Bash, &["ls *"]), PermissionAction::Ask)
                    .await
            })
        };

        // Wait for the request to be published, then reply.
        let id = loop {
            if let Some(id) = req_id.lock().unwrap().clone() {
                break id;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };
        assert!(checker.respond(&id, PermissionReply::Once));
        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(checker.pending_count(), 0);
    }

    #[tokio::test]
    async fn once_does_not_memoize() {
        let bus = Bus::new();
        let checker = Arc::new(Checker::new(Arc::clone(&bus)));
        let req_id = published_request_id(&bus);
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            *req_id.lock().unwrap() = None;
            let waiter = {
                let checker = Arc::clone(&checker);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    checker
                        .check(
                            &cancel,
                            request(PermissionType::Webfetch, &["curl *"]),
                            PermissionAction::Ask,
                        )
                        .await
                })
            };
            let id = loop {
                if let Some(id) = req_id.lock().unwrap().clone() {
                    break id;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            };
            assert!(checker.respond(&id, PermissionReply::Once), "second ask must still ask");
            assert!(waiter.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn always_memoizes_type_for_the_session() {
        let bus = Bus::new();
        let checker = Arc::new(Checker::new(Arc::clone(&bus)));
        let req_id = published_request_id(&bus);
        let cancel = CancellationToken::new();

        let waiter = {
            let checker = Arc::clone(&checker);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                checker
                    .check(&cancel, request(PermissionType::Webfetch, &[]), PermissionAction::Ask)
                    .await
            })
        };
        let id = loop {
            if let Some(id) = req_id.lock().unwrap().clone() {
                break id;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };
        assert!(checker.respond(&id, PermissionReply::Always));
        assert!(waiter.await.unwrap().is_ok());

        // Second ask of the same type resolves immediately.
        let result = checker
            .check(&cancel, request(PermissionType::Webfetch, &[]), PermissionAction::Ask)
            .await;
        assert!(result.is_ok());
        assert_eq!(checker.pending_count(), 0);
    }

    #[tokio::test]
    async fn reject_publishes_not_granted() {
        let bus = Bus::new();
        let checker = Arc::new(Checker::new(Arc::clone(&bus)));
        let req_id = published_request_id(&bus);

        let granted = Arc::new(Mutex::new(None));
        let g = Arc::clone(&granted);
        bus.subscribe(smed_bus::EventKind::PermissionReplied, move |e| {
            if let Event::PermissionReplied { granted, .. } = e {
                *g.lock().unwrap() = Some(granted);
            }
        });

        let cancel = CancellationToken::new();
        let waiter = {
            let checker = Arc::clone(&checker);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                checker
                    .check(&cancel, request(PermissionType::Bash, &["rm *"]), PermissionAction::Ask)
                    .await
            })
        };
        let id = loop {
            if let Some(id) = req_id.lock().unwrap().clone() {
                break id;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };
        assert!(checker.respond(&id, PermissionReply::Reject));
        assert!(matches!(
            waiter.await.unwrap(),
            Err(PermissionError::Rejected(_))
        ));
        assert_eq!(*granted.lock().unwrap(), Some(false));
    }

    #[tokio::test]
    async fn cancellation_resolves_the_wait() {
        let bus = Bus::new();
        let checker = Arc::new(Checker::new(Arc::clone(&bus)));
        let cancel = CancellationToken::new();

        let waiter = {
            let checker = Arc::clone(&checker);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                checker
                    .check(&cancel, request(PermissionType::Bash, &[]), PermissionAction::Ask)
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        cancel.cancel();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(PermissionError::Cancelled)
        ));
        assert_eq!(checker.pending_count(), 0);
    }

    #[tokio::test]
    async fn respond_to_unknown_request_returns_false() {
        let bus = Bus::new();
        let checker = Checker::new(bus);
        assert!(!checker.respond("perm_missing", PermissionReply::Once));
    }

    #[tokio::test]
    async fn auto_approver_grants_asks() {
        let bus = Bus::new();
        let auto = AutoApprover::new(Arc::clone(&bus));
        let cancel = CancellationToken::new();
        let result = auto
            .check(&cancel, request(PermissionType::Bash, &["rm *"]), PermissionAction::Ask)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn auto_approver_still_honors_deny() {
        let bus = Bus::new();
        let auto = AutoApprover::new(Arc::clone(&bus));
        let cancel = CancellationToken::new();
        let result = auto
            .check(&cancel, request(PermissionType::Bash, &["rm *"]), PermissionAction::Deny)
            .await;
        assert!(matches!(result, Err(PermissionError::Rejected(_))));
    }

    #[tokio::test]
    async fn auto_approver_trace_publishes_request_and_reply() {
        let bus = Bus::new();
        let auto = AutoApprover::with_trace(Arc::clone(&bus));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        bus.subscribe_all(move |e| s.lock().unwrap().push(e.kind().name()));

        let cancel = CancellationToken::new();
        auto.check(&cancel, request(PermissionType::Edit, &[]), PermissionAction::Ask)
            .await
            .unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec!["permission.updated", "permission.replied"]
        );
    }
}
