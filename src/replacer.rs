// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Deferred replacement of locked files.
//!
//! Files that cannot be installed because the host process holds them open
//! (its own executable, loaded libraries) are queued here. The queue is a
//! durable ordered list; a detached helper process applies it after the
//! host exits and optionally relaunches the host. Entries leave the queue
//! only after the helper confirms the copy, or when a later session
//! installs the same target successfully.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::store::{load_json_locked, save_json_locked};

/// Queue file name inside the state directory.
const QUEUE_FILE: &str = "replace_queue.json";

/// Helper binary name, expected next to the host executable unless
/// configured explicitly.
const HELPER_BIN: &str = "patchrun-helper";

/// Delay between copy attempts while a target stays locked.
const LOCKED_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// One deferred file replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineReplaceEntry {
    /// Fully downloaded and verified temp file.
    pub temp_path: PathBuf,
    /// Destination the temp file is copied over.
    pub target_path: PathBuf,
}

/// Persisted replace queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplaceQueue {
    /// Entries in the order they were queued.
    pub entries: Vec<OfflineReplaceEntry>,
    /// Schema version for future migrations.
    pub version: u32,
}

/// Handle to the persisted replace queue plus the detached helper contract.
#[derive(Debug, Clone)]
pub struct OfflineFileReplacer {
    queue_path: PathBuf,
    helper_path: Option<PathBuf>,
    relaunch: Option<PathBuf>,
}

impl OfflineFileReplacer {
    /// Create a replacer persisting its queue under `state_dir`.
    pub fn new(
        state_dir: impl Into<PathBuf>,
        helper_path: Option<PathBuf>,
        relaunch: Option<PathBuf>,
    ) -> Self {
        Self {
            queue_path: state_dir.into().join(QUEUE_FILE),
            helper_path,
            relaunch,
        }
    }

    /// Path of the persisted queue file.
    pub fn queue_path(&self) -> &Path {
        &self.queue_path
    }

    /// Currently queued entries, oldest first.
    pub fn pending(&self) -> Result<Vec<OfflineReplaceEntry>> {
        Ok(load_json_locked::<ReplaceQueue>(&self.queue_path)?
            .unwrap_or_default()
            .entries)
    }

    /// Queue a replacement of `target_path` by `temp_path`.
    ///
    /// A pending entry for the same target is superseded; only the newest
    /// temp file matters for any given destination.
    pub fn queue_replacement(
        &self,
        temp_path: impl Into<PathBuf>,
        target_path: impl Into<PathBuf>,
    ) -> Result<()> {
        let entry = OfflineReplaceEntry {
            temp_path: temp_path.into(),
            target_path: target_path.into(),
        };

        let mut queue = load_json_locked::<ReplaceQueue>(&self.queue_path)?.unwrap_or_default();
        queue
            .entries
            .retain(|e| e.target_path != entry.target_path);
        tracing::info!(
            target = %entry.target_path.display(),
            "queueing offline replacement"
        );
        queue.entries.push(entry);
        save_json_locked(&self.queue_path, &queue)
            .with_context(|| "Failed to persist offline replace queue")
    }

    /// Drop any pending entry for `target`: a later session installed the
    /// file directly, so the deferred copy is stale.
    pub fn clear_pending(&self, target: &Path) -> Result<()> {
        let Some(mut queue) = load_json_locked::<ReplaceQueue>(&self.queue_path)? else {
            return Ok(());
        };
        let before = queue.entries.len();
        queue.entries.retain(|e| e.target_path != target);
        if queue.entries.len() != before {
            tracing::debug!(target = %target.display(), "dropping superseded replace entry");
            save_json_locked(&self.queue_path, &queue)
                .with_context(|| "Failed to persist offline replace queue")?;
        }
        Ok(())
    }

    /// Spawn the detached helper to apply the queue after the host exits.
    ///
    /// Returns `true` iff at least one entry is queued and the helper was
    /// spawned. Returns `false` on an empty queue, or when spawning fails;
    /// the queue is left intact either way so a later invocation can retry.
    pub fn try_execute(&self) -> bool {
        let pending = match self.pending() {
            Ok(pending) => pending,
            Err(e) => {
                tracing::error!(error = %e, "failed to read offline replace queue");
                return false;
            }
        };
        if pending.is_empty() {
            return false;
        }

        let helper = match self.helper_binary() {
            Some(helper) => helper,
            None => {
                tracing::error!("offline replace helper binary not found");
                return false;
            }
        };

        let mut command = Command::new(&helper);
        command
            .arg("--queue")
            .arg(&self.queue_path)
            .arg("--wait-pid")
            .arg(std::process::id().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(relaunch) = &self.relaunch {
            command.arg("--relaunch").arg(relaunch);
        }

        match command.spawn() {
            Ok(child) => {
                tracing::info!(
                    helper = %helper.display(),
                    pid = child.id(),
                    entries = pending.len(),
                    "spawned offline replace helper"
                );
                true
            }
            Err(e) => {
                tracing::error!(
                    helper = %helper.display(),
                    error = %e,
                    "failed to spawn offline replace helper, queue left intact"
                );
                false
            }
        }
    }

    fn helper_binary(&self) -> Option<PathBuf> {
        if let Some(path) = &self.helper_path {
            return Some(path.clone());
        }
        let exe = env::current_exe().ok()?;
        let dir = exe.parent()?;
        Some(dir.join(format!("{}{}", HELPER_BIN, env::consts::EXE_SUFFIX)))
    }
}

/// Apply all queued entries in order, persisting progress after each one.
///
/// Each copy retries while the target stays locked, up to
/// `locked_timeout`. The queue file is rewritten after every applied entry
/// and removed once empty, so an interrupted run resumes where it stopped.
/// Returns the number of entries applied.
pub fn apply_queue(queue_path: &Path, locked_timeout: Duration) -> Result<usize> {
    let Some(mut queue) = load_json_locked::<ReplaceQueue>(queue_path)? else {
        return Ok(0);
    };

    let mut applied = 0;
    while let Some(entry) = queue.entries.first().cloned() {
        apply_entry(&entry, locked_timeout)?;
        queue.entries.remove(0);
        applied += 1;
        save_json_locked(queue_path, &queue)
            .with_context(|| "Failed to persist offline replace queue progress")?;
    }

    let _ = fs::remove_file(queue_path);
    Ok(applied)
}

fn apply_entry(entry: &OfflineReplaceEntry, locked_timeout: Duration) -> Result<()> {
    if !entry.temp_path.exists() {
        // Already applied by an earlier run, or superseded by a direct
        // install. Nothing left to copy.
        tracing::warn!(
            temp = %entry.temp_path.display(),
            "replace source missing, skipping entry"
        );
        return Ok(());
    }

    if let Some(parent) = entry.target_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }

    let start = Instant::now();
    loop {
        match fs::copy(&entry.temp_path, &entry.target_path) {
            Ok(_) => break,
            Err(e) if is_locked_error(&e) && start.elapsed() < locked_timeout => {
                tracing::debug!(
                    target = %entry.target_path.display(),
                    "target still locked, retrying copy"
                );
                thread::sleep(LOCKED_RETRY_INTERVAL);
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!(
                        "Failed to copy {:?} over {:?}",
                        entry.temp_path, entry.target_path
                    )
                });
            }
        }
    }

    fs::remove_file(&entry.temp_path)
        .with_context(|| format!("Failed to remove applied temp file: {:?}", entry.temp_path))?;
    tracing::info!(target = %entry.target_path.display(), "applied offline replacement");
    Ok(())
}

/// True when an I/O error means the target file is held open by a running
/// process, as opposed to a genuine failure.
pub fn is_locked_error(error: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        // ETXTBSY: text file busy (running executable). EBUSY: device or
        // resource busy.
        matches!(error.raw_os_error(), Some(26) | Some(16))
    }
    #[cfg(windows)]
    {
        // ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION, and the access
        // denial Windows reports when renaming over an open file.
        matches!(error.raw_os_error(), Some(32) | Some(33))
            || error.kind() == std::io::ErrorKind::PermissionDenied
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = error;
        false
    }
}
