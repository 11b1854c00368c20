// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Prefixed, monotonic identifiers.
//!
//! Ids sort in creation order: a process-wide ULID generator increments the
//! random component for ids minted within the same millisecond, so the
//! lexicographic order of message and part ids matches the order they were
//! created in.  Everything downstream (storage listings, history building)
//! relies on that.

use std::sync::{Mutex, OnceLock};

use ulid::{Generator, Ulid};

fn next() -> String {
    static GENERATOR: OnceLock<Mutex<Generator>> = OnceLock::new();
    let generator = GENERATOR.get_or_init(|| Mutex::new(Generator::new()));
    let mut generator = generator.lock().unwrap_or_else(|e| e.into_inner());
    // Overflow of the per-millisecond counter is vanishingly rare; a fresh
    // random ULID keeps ids unique at the cost of one ordering hiccup.
    let ulid = generator.generate().unwrap_or_else(|_| Ulid::new());
    ulid.to_string().to_lowercase()
}

pub fn session() -> String {
    format!("ses_{}", next())
}

pub fn message() -> String {
    format!("msg_{}", next())
}

pub fn part() -> String {
    format!("prt_{}", next())
}

pub fn permission() -> String {
    format!("perm_{}", uuid::Uuid::new_v4())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_their_prefix() {
        assert!(session().starts_with("ses_"));
        assert!(message().starts_with("msg_"));
        assert!(part().starts_with("prt_"));
        assert!(permission().starts_with("perm_"));
    }

    #[test]
    fn ids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(message()));
        }
    }

    #[test]
    fn ids_minted_in_sequence_sort_in_sequence() {
        let ids: Vec<String> = (0..100).map(|_| part()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }
}
