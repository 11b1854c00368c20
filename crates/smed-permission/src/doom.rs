// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Repeated-call detection.
//!
//! A model that issues the same tool call with the same input over and over
//! is stuck.  Each session keeps the last few call fingerprints; when an
//! incoming call matches the required run length, the call is flagged and
//! the processor raises a `doom_loop` permission request before running it.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use sha2::{Digest, Sha256};

const WINDOW: usize = 10;
const TRIGGER: usize = 3;

#[derive(Default)]
pub struct DoomLoopDetector {
    history: Mutex<HashMap<String, VecDeque<[u8; 32]>>>,
}

impl DoomLoopDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tool call and report whether it completes a run of
    /// [`TRIGGER`] identical calls.
    pub fn check(&self, session_id: &str, tool: &str, input: &serde_json::Value) -> bool {
        let fp = fingerprint(tool, input);
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let entry = history.entry(session_id.to_string()).or_default();

        let run = entry.iter().rev().take_while(|prev| **prev == fp).count();
        entry.push_back(fp);
        if entry.len() > WINDOW {
            entry.pop_front();
        }
        run + 1 >= TRIGGER
    }

    /// Forget a session's history.
    pub fn reset(&self, session_id: &str) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.remove(session_id);
    }
}

/// SHA-256 over the canonical `{tool, input}` JSON.
fn fingerprint(tool: &str, input: &serde_json::Value) -> [u8; 32] {
    let doc = serde_json::json!({ "tool": tool, "input": input });
    let bytes = serde_json::to_vec(&doc).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hasher.finalize().into()
}

/// Hex form of a call fingerprint, for request metadata.
pub fn fingerprint_hex(tool: &str, input: &serde_json::Value) -> String {
    hex::encode(fingerprint(tool, input))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
