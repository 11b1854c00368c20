// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Persistence for the session → message → part tree.
//!
//! Layout under the storage root:
//! `session/<sid>.json`, `message/<sid>/<mid>.json`,
//! `part/<mid>/<pid>.json`, `session/state/<sid>.json`.
//! Ids are monotonic, so directory listings come back in creation order.

use std::sync::Arc;

use tracing::debug;

use smed_bus::{Bus, Event};
use smed_model::{Message, Part, Session, SessionStateEntry};
use smed_storage::{Storage, StorageError};

#[derive(Clone)]
pub struct SessionStore {
    storage: Arc<Storage>,
    bus: Arc<Bus>,
}

impl SessionStore {
    pub fn new(storage: Arc<Storage>, bus: Arc<Bus>) -> Self {
        Self { storage, bus }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    // ── Sessions ──────────────────────────────────────────────────────────────

    pub fn create_session(
        &self,
        directory: impl Into<String>,
        title: Option<String>,
    ) -> Result<Session, StorageError> {
        let session = Session::new(directory, title.unwrap_or_else(|| "New session".into()));
        self.storage.put(&["session", &session.id], &session)?;
        debug!(session = %session.id, "session created");
        self.bus.publish_sync(&Event::SessionCreated {
            session: session.clone(),
        });
        Ok(session)
    }

    pub fn session(&self, id: &str) -> Result<Session, StorageError> {
        self.storage.get(&["session", id])
    }

    pub fn list_sessions(&self) -> Result<Vec<Session>, StorageError> {
        let mut sessions = Vec::new();
        // scan only visits documents, so the `state/` subdirectory is skipped.
        self.storage.scan(&["session"], |_, bytes| {
            if let Ok(session) = serde_json::from_slice::<Session>(bytes) {
                sessions.push(session);
            }
        })?;
        Ok(sessions)
    }

    pub fn update_session(&self, session: &Session) -> Result<(), StorageError> {
        self.storage.put(&["session", &session.id], session)?;
        self.bus.publish_sync(&Event::SessionUpdated {
            session: session.clone(),
        });
        Ok(())
    }

    /// Delete a session and everything it owns: messages, their parts, and
    /// the client state entry.
    pub fn delete_session(&self, id: &str) -> Result<(), StorageError> {
        for message_id in self.storage.list(&["message", id])? {
            for part_id in self.storage.list(&["part", &message_id])? {
                self.storage.delete(&["part", &message_id, &part_id])?;
            }
            self.storage.delete(&["message", id, &message_id])?;
        }
        self.storage.delete(&["session", "state", id])?;
        self.storage.delete(&["session", id])?;
        debug!(session = %id, "session deleted");
        self.bus.publish_sync(&Event::SessionDeleted {
            session_id: id.to_string(),
        });
        Ok(())
    }

    /// Derive a title from the first user prompt of an untitled session.
    pub fn title_from_prompt(&self, session: &mut Session, prompt: &str) -> Result<(), StorageError> {
        if session.title != "New session" {
            return Ok(());
        }
        let mut title: String = prompt.chars().take(80).collect();
        if prompt.chars().count() > 80 {
            title.push('…');
        }
        session.title = title;
        self.update_session(session)
    }

    // ── Messages and parts ────────────────────────────────────────────────────

    pub fn save_message(&self, message: &Message) -> Result<(), StorageError> {
        self.storage
            .put(&["message", &message.session_id, &message.id], message)
    }

    pub fn save_part(&self, part: &Part) -> Result<(), StorageError> {
        self.storage
            .put(&["part", part.message_id(), part.id()], part)
    }

    pub fn messages(&self, session_id: &str) -> Result<Vec<Message>, StorageError> {
        let mut messages = Vec::new();
        self.storage.scan(&["message", session_id], |_, bytes| {
            if let Ok(m) = serde_json::from_slice::<Message>(bytes) {
                messages.push(m);
            }
        })?;
        Ok(messages)
    }

    pub fn parts(&self, message_id: &str) -> Result<Vec<Part>, StorageError> {
        let mut parts = Vec::new();
        self.storage.scan(&["part", message_id], |_, bytes| {
            if let Ok(p) = serde_json::from_slice::<Part>(bytes) {
                parts.push(p);
            }
        })?;
        Ok(parts)
    }

    pub fn messages_with_parts(
        &self,
        session_id: &str,
    ) -> Result<Vec<(Message, Vec<Part>)>, StorageError> {
        let mut out = Vec::new();
        for message in self.messages(session_id)? {
            let parts = self.parts(&message.id)?;
            out.push((message, parts));
        }
        Ok(out)
    }

    /// Remove one message and its parts, announcing the removal.
    pub fn delete_message(&self, message: &Message) -> Result<(), StorageError> {
        for part_id in self.storage.list(&["part", &message.id])? {
            self.storage.delete(&["part", &message.id, &part_id])?;
        }
        self.storage
            .delete(&["message", &message.session_id, &message.id])?;
        self.bus.publish_sync(&Event::MessageRemoved {
            session_id: message.session_id.clone(),
            message_id: message.id.clone(),
        });
        Ok(())
    }

    /// Persist a user prompt as a message with one text part and announce it.
    pub fn create_user_message(
        &self,
        session_id: &str,
        text: &str,
    ) -> Result<(Message, Part), StorageError> {
        let message = Message::user(session_id);
        let part = Part::text(&message.id, text);
        self.save_message(&message)?;
        self.save_part(&part)?;
        self.bus.publish_sync(&Event::MessageCreated {
            message: message.clone(),
        });
        self.bus.publish_sync(&Event::PartUpdated {
            part: part.clone(),
            delta: None,
        });
        Ok((message, part))
    }

    // ── Client state cache ────────────────────────────────────────────────────

    pub fn save_state_entry(&self, entry: &SessionStateEntry) -> Result<(), StorageError> {
        self.storage
            .put(&["session", "state", &entry.session_id], entry)
    }

    pub fn state_entry(&self, session_id: &str) -> Result<SessionStateEntry, StorageError> {
        self.storage.get(&["session", "state", session_id])
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
