// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persisted local update state.
//!
//! Stores the currently installed version and the per-file {size, hash}
//! cache the differ compares manifests against. Everything survives process
//! restarts; writes go through a temp file plus atomic rename while holding
//! an exclusive lock on a sidecar `.lock` file, so concurrent instances
//! never interleave writes or read torn state.
//!
//! The lock/atomic-write helpers are shared with the offline replace queue
//! (see [`crate::replacer`]).

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::manifest::{ManifestEntry, Version};

/// Default timeout for acquiring file locks.
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval when waiting for lock acquisition.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// State file name inside the state directory.
const STATE_FILE: &str = "state.json";

/// Size and content hash recorded for one installed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStamp {
    /// File size in bytes.
    pub size: u64,
    /// Lowercase hex SHA-256 of the file contents.
    pub hash: String,
}

impl FileStamp {
    /// True when this stamp matches a manifest entry's expectations.
    pub fn matches(&self, entry: &ManifestEntry) -> bool {
        self.size == entry.size && self.hash == entry.hash
    }
}

/// Persisted local install state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStore {
    /// The version currently installed locally.
    pub installed_version: Version,
    /// Relative file path -> stamp of the installed copy.
    pub file_cache: HashMap<String, FileStamp>,
    /// When the state was last saved.
    pub last_saved: Option<DateTime<Utc>>,
    /// Schema version for future migrations.
    pub version: u32,
    /// State directory this store persists into.
    #[serde(skip)]
    dir: PathBuf,
}

impl UpdateStore {
    /// Open the store in `dir`, loading existing state if present.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let path = dir.join(STATE_FILE);
        let mut store = match load_json_locked::<UpdateStore>(&path)? {
            Some(store) => store,
            None => Self {
                installed_version: 0,
                file_cache: HashMap::new(),
                last_saved: None,
                version: 1,
                dir: PathBuf::new(),
            },
        };
        store.dir = dir;
        Ok(store)
    }

    /// Save state to disk with an atomic locked write.
    pub fn save(&mut self) -> Result<()> {
        self.last_saved = Some(Utc::now());
        save_json_locked(&self.dir.join(STATE_FILE), self)
    }

    /// True when the cached stamp for `path` matches the manifest entry,
    /// i.e. the local copy is already current and needs no download.
    pub fn stamp_matches(&self, path: &str, entry: &ManifestEntry) -> bool {
        self.file_cache
            .get(path)
            .map(|stamp| stamp.matches(entry))
            .unwrap_or(false)
    }

    /// Record the stamp of a freshly installed file.
    pub fn record_file(&mut self, path: impl Into<String>, stamp: FileStamp) {
        self.file_cache.insert(path.into(), stamp);
    }

    /// Advance the installed version. Older versions are ignored; the
    /// installed version never moves backwards.
    pub fn advance_version(&mut self, version: Version) {
        if version > self.installed_version {
            self.installed_version = version;
        }
    }
}

/// Acquire an exclusive lock on `path` (created if missing), retrying until
/// `timeout` expires.
pub(crate) fn acquire_exclusive_lock_with_timeout(
    path: &Path,
    timeout: Duration,
) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory for lock file: {:?}", parent))?;
    }

    let lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Failed to open lock file: {:?}", path))?;

    let start = Instant::now();
    loop {
        match FileExt::try_lock_exclusive(&lock_file) {
            Ok(()) => return Ok(lock_file),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if start.elapsed() >= timeout {
                    bail!(
                        "Timed out waiting for exclusive lock on {:?} after {:?}. \
                         Another instance may be writing to the state file.",
                        path,
                        timeout
                    );
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to acquire exclusive lock on {:?}", path));
            }
        }
    }
}

/// Acquire a shared lock on an open lock file, retrying until `timeout`
/// expires. Multiple readers may hold the shared lock at once.
pub(crate) fn acquire_shared_lock_with_timeout(file: &File, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    loop {
        match FileExt::try_lock_shared(file) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if start.elapsed() >= timeout {
                    bail!(
                        "Timed out waiting for shared lock after {:?}. \
                         Another instance may be writing to the state file.",
                        timeout
                    );
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => {
                return Err(e).with_context(|| "Failed to acquire shared lock on state file");
            }
        }
    }
}

/// Load a JSON value from `path` under a shared lock. Returns `None` when
/// the file does not exist.
pub(crate) fn load_json_locked<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }

    let lock_path = path.with_extension("lock");
    let lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .with_context(|| format!("Failed to open lock file: {:?}", lock_path))?;
    acquire_shared_lock_with_timeout(&lock_file, LOCK_TIMEOUT)?;

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read state file: {:?}", path))?;
    let value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse state file: {:?}", path))?;

    // Shared lock released when lock_file drops.
    Ok(Some(value))
}

/// Write a JSON value to `path` atomically: serialize, write to a temp
/// sibling, fsync, rename into place while holding the exclusive
/// sidecar lock.
pub(crate) fn save_json_locked<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }

    let lock_path = path.with_extension("lock");
    let _lock_guard = acquire_exclusive_lock_with_timeout(&lock_path, LOCK_TIMEOUT)?;

    let content = serde_json::to_string_pretty(value)
        .with_context(|| "Failed to serialize state to JSON")?;

    let temp_path = path.with_extension("tmp");
    {
        let mut temp_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
        temp_file
            .write_all(content.as_bytes())
            .with_context(|| "Failed to write to temp file")?;
        temp_file
            .sync_all()
            .with_context(|| "Failed to sync temp file to disk")?;
    }

    fs::rename(&temp_path, path).with_context(|| {
        format!(
            "Failed to rename temp file to state file: {:?} -> {:?}",
            temp_path, path
        )
    })?;

    Ok(())
}
