// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-file locks for the store.
//!
//! Each target file gets one lock entry, reference-held in a process-wide
//! map.  Acquisition takes two layers in order: the entry's in-process
//! lock, then an exclusive OS lock on `<path>.lock` (fs4).  Release drops
//! both layers and removes the `.lock` file.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

use fs4::fs_std::FileExt;

pub(crate) struct LockMap {
    entries: Mutex<HashMap<PathBuf, Arc<LockEntry>>>,
}

impl LockMap {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Blocking acquisition of both lock layers for `target`.
    pub(crate) fn lock(&self, target: &Path) -> std::io::Result<Guard> {
        let entry = self.entry(target);
        entry.acquire();
        match os_lock(target, true)? {
            Some(file) => Ok(Guard {
                entry,
                file: Some(file),
                lock_path: lock_path(target),
            }),
            // lock_exclusive blocks, so None is unreachable here; keep the
            // entry consistent anyway.
            None => {
                entry.release();
                Err(std::io::Error::other("exclusive file lock unavailable"))
            }
        }
    }

    /// Non-blocking acquisition.  `None` when either layer would block.
    pub(crate) fn try_lock(&self, target: &Path) -> std::io::Result<Option<Guard>> {
        let entry = self.entry(target);
        if !entry.try_acquire() {
            return Ok(None);
        }
        match os_lock(target, false) {
            Ok(Some(file)) => Ok(Some(Guard {
                entry,
                file: Some(file),
                lock_path: lock_path(target),
            })),
            Ok(None) => {
                entry.release();
                Ok(None)
            }
            Err(e) => {
                entry.release();
                Err(e)
            }
        }
    }

    fn entry(&self, target: &Path) -> Arc<LockEntry> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(target.to_path_buf())
            .or_insert_with(|| Arc::new(LockEntry::new()))
            .clone()
    }
}

/// The in-process layer: a binary lock built on Mutex + Condvar so the
/// release can happen from a guard that owns the entry by `Arc`.
struct LockEntry {
    busy: Mutex<bool>,
    freed: Condvar,
}

impl LockEntry {
    fn new() -> Self {
        Self {
            busy: Mutex::new(false),
            freed: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut busy = self.busy.lock().unwrap_or_else(|e| e.into_inner());
        while *busy {
            busy = self.freed.wait(busy).unwrap_or_else(|e| e.into_inner());
        }
        *busy = true;
    }

    fn try_acquire(&self) -> bool {
        let mut busy = self.busy.lock().unwrap_or_else(|e| e.into_inner());
        if *busy {
            return false;
        }
        *busy = true;
        true
    }

    fn release(&self) {
        let mut busy = self.busy.lock().unwrap_or_else(|e| e.into_inner());
        *busy = false;
        self.freed.notify_one();
    }
}

fn lock_path(target: &Path) -> PathBuf {
    let mut os = target.as_os_str().to_owned();
    os.push(".lock");
    PathBuf::from(os)
}

/// Take the OS layer on `<target>.lock`.  Blocking when `wait` is true;
/// otherwise returns `None` if another process holds it.
fn os_lock(target: &Path, wait: bool) -> std::io::Result<Option<File>> {
    let path = lock_path(target);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(&path)?;
    if wait {
        file.lock_exclusive()?;
        Ok(Some(file))
    } else if file.try_lock_exclusive()? {
        Ok(Some(file))
    } else {
        Ok(None)
    }
}

pub(crate) struct Guard {
    entry: Arc<LockEntry>,
    file: Option<File>,
    lock_path: PathBuf,
}

impl Drop for Guard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
        }
        let _ = fs::remove_file(&self.lock_path);
        self.entry.release();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_then_drop_releases_both_layers() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("doc.json");
        let locks = LockMap::new();

        let guard = locks.lock(&target).unwrap();
        assert!(lock_path(&target).exists());
        drop(guard);
        assert!(!lock_path(&target).exists());

        // Re-acquirable after release.
        let again = locks.try_lock(&target).unwrap();
        assert!(again.is_some());
    }

    #[test]
    fn try_lock_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("doc.json");
        let locks = LockMap::new();

        let _guard = locks.lock(&target).unwrap();
        assert!(locks.try_lock(&target).unwrap().is_none());
    }

    #[test]
    fn distinct_paths_do_not_contend() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockMap::new();
        let _a = locks.lock(&dir.path().join("a.json")).unwrap();
        let b = locks.try_lock(&dir.path().join("b.json")).unwrap();
        assert!(b.is_some());
    }

    #[test]
    fn blocking_lock_waits_for_release() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc as StdArc;

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("doc.json");
        let locks = StdArc::new(LockMap::new());

        let guard = locks.lock(&target).unwrap();
        let acquired = StdArc::new(AtomicBool::new(false));

        let handle = {
            let locks = StdArc::clone(&locks);
            let acquired = StdArc::clone(&acquired);
            let target = target.clone();
            std::thread::spawn(move || {
                let _g = locks.lock(&target).unwrap();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst), "must block while held");
        drop(guard);
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }
}
