// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Crash-safe JSON key-value store over a path hierarchy.
//!
//! A key is an ordered list of path segments; `["message", sid, mid]` maps to
//! `<base>/message/<sid>/<mid>.json`.  Writes go through a temp file and an
//! atomic rename, serialized per target file by a lock that composes an
//! in-process mutex with an exclusive OS file lock on `<path>.lock`, so a
//! reader observes either the previous committed document or the new one —
//! never a torn write.

mod lock;

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::lock::LockMap;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("corrupt document at {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("encoding failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Filesystem-backed JSON store.  Cheap to clone via `Arc`.
pub struct Storage {
    base: PathBuf,
    locks: LockMap,
}

impl Storage {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            locks: LockMap::new(),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Read and decode the document at `path`.
    pub fn get<T: DeserializeOwned>(&self, path: &[&str]) -> Result<T, StorageError> {
        let file = self.file_path(path);
        let bytes = match fs::read(&file) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(path.join("/")))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|source| StorageError::Corrupt {
            path: file.display().to_string(),
            source,
        })
    }

    /// Encode `value` and atomically replace the document at `path`.
    ///
    /// The write sequence is: create parent directories (0755), take the
    /// per-file lock, write `<path>.tmp` (0644), fsync, rename onto the
    /// target.  On any failure before the rename the target is unchanged;
    /// a stale `.tmp` left by a crash is ignored by readers.
    pub fn put<T: Serialize>(&self, path: &[&str], value: &T) -> Result<(), StorageError> {
        let file = self.file_path(path);
        let encoded = serde_json::to_vec(value).map_err(StorageError::Encode)?;

        if let Some(parent) = file.parent() {
            create_dirs(parent)?;
        }

        let _guard = self.locks.lock(&file)?;

        let tmp = tmp_path(&file);
        {
            let mut f = open_for_write(&tmp)?;
            f.write_all(&encoded)?;
            f.sync_all()?;
        }
        if let Err(e) = fs::rename(&tmp, &file) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!(path = %file.display(), bytes = encoded.len(), "stored document");
        Ok(())
    }

    /// Remove the document at `path`.  Removing an absent key is not an error.
    pub fn delete(&self, path: &[&str]) -> Result<(), StorageError> {
        let file = self.file_path(path);
        let _guard = self.locks.lock(&file)?;
        match fs::remove_file(&file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(&self, path: &[&str]) -> bool {
        self.file_path(path).is_file()
    }

    /// List the direct children of `path`: document names with the `.json`
    /// suffix stripped, plus child directory names.  A missing directory
    /// yields an empty list, not an error.
    pub fn list(&self, path: &[&str]) -> Result<Vec<String>, StorageError> {
        let dir = self.dir_path(path);
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        // BTreeSet: de-duplicates and keeps lexicographic (= id) order.
        let mut names = BTreeSet::new();
        for entry in entries {
            let entry = entry?;
            let p = entry.path();
            if p.is_dir() {
                if let Some(name) = p.file_name().and_then(|n| n.to_str()) {
                    names.insert(name.to_string());
                }
            } else if p.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = p.file_stem().and_then(|s| s.to_str()) {
                    names.insert(stem.to_string());
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    /// Stream the child documents of `path` as raw JSON bytes.
    ///
    /// Unreadable entries are skipped; the iteration continues with the rest.
    pub fn scan(
        &self,
        path: &[&str],
        mut f: impl FnMut(&str, &[u8]),
    ) -> Result<(), StorageError> {
        let dir = self.dir_path(path);
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        files.sort();
        for p in files {
            let Some(stem) = p.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match fs::read(&p) {
                Ok(bytes) => f(stem, &bytes),
                Err(e) => {
                    debug!(path = %p.display(), error = %e, "skipping unreadable entry");
                }
            }
        }
        Ok(())
    }

    /// Non-blocking variant of the per-file lock.  Returns `false` when
    /// either the in-process mutex or the OS lock is held elsewhere.
    pub fn try_lock(&self, path: &[&str]) -> Result<bool, StorageError> {
        let file = self.file_path(path);
        Ok(self.locks.try_lock(&file)?.is_some())
    }

    fn file_path(&self, path: &[&str]) -> PathBuf {
        let mut p = self.dir_path(path);
        p.set_extension("json");
        p
    }

    fn dir_path(&self, path: &[&str]) -> PathBuf {
        let mut p = self.base.clone();
        for seg in path {
            p.push(seg);
        }
        p
    }
}

fn tmp_path(file: &Path) -> PathBuf {
    let mut os = file.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

#[cfg(unix)]
fn create_dirs(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o755).create(dir)
}

#[cfg(not(unix))]
fn create_dirs(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}

#[cfg(unix)]
fn open_for_write(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(path)
}

#[cfg(not(unix))]
fn open_for_write(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
