// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Task, state, and event types for the update client.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::manifest::{ManifestEntry, Version};

/// Status of a single file download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Waiting to be scheduled onto a source.
    Pending,
    /// Claimed by a transfer worker.
    Downloading,
    /// Downloaded and verified against manifest size and hash.
    Verified,
    /// Permanently failed (retry budget exhausted, or install error).
    Failed,
    /// Moved into its target location.
    Installed,
    /// Target was locked; queued for the detached offline replace.
    QueuedForOfflineReplace,
}

impl TaskStatus {
    /// True once the task will never change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Failed | TaskStatus::Installed | TaskStatus::QueuedForOfflineReplace
        )
    }
}

/// One file to bring up to date within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    /// File path relative to the install root and the source root.
    pub remote_path: String,
    /// Temp file the transfer writes into.
    pub temp_path: PathBuf,
    /// Final install location.
    pub target_path: PathBuf,
    /// Expected size in bytes.
    pub size: u64,
    /// Expected lowercase hex SHA-256.
    pub hash: String,
    /// The version owning this file on the download sources.
    pub version: Version,
    /// Download attempts made so far.
    pub attempts: u32,
    /// Current status.
    pub status: TaskStatus,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the status last changed.
    pub updated_at: DateTime<Utc>,
}

impl DownloadTask {
    /// Build a pending task for one manifest entry.
    pub fn new(
        remote_path: impl Into<String>,
        temp_path: PathBuf,
        target_path: PathBuf,
        entry: &ManifestEntry,
    ) -> Self {
        let now = Utc::now();
        Self {
            remote_path: remote_path.into(),
            temp_path,
            target_path,
            size: entry.size,
            hash: entry.hash.clone(),
            version: entry.version,
            attempts: 0,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Update the status and timestamp.
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Overall state of an update session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateState {
    /// No session has run yet.
    Idle,
    /// Querying master servers for the live version.
    CheckingVersion,
    /// Comparing the manifest against the local file cache.
    Diffing,
    /// Transferring stale files from download sources.
    Downloading,
    /// Moving verified files into place.
    Installing,
    /// Session finished; per-file failures may have occurred
    /// (`has_errors`).
    Completed,
    /// Session aborted: version resolution exhausted all endpoints.
    Failed,
    /// Session cancelled by the host before completing.
    Cancelled,
}

impl UpdateState {
    /// True for states a session can end in.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UpdateState::Completed | UpdateState::Failed | UpdateState::Cancelled
        )
    }
}

/// Lifecycle notifications raised by the update client.
#[derive(Debug, Clone)]
pub enum UpdateEvent {
    /// The session moved between states.
    StateChanged { from: UpdateState, to: UpdateState },
    /// The resolver found the currently published version.
    LiveVersionFound { version: Version },
    /// A file was downloaded and verified.
    FileDownloaded { remote: String, local: PathBuf },
    /// A file exhausted its download attempts.
    FileDownloadFailed { remote: String },
    /// Installing a verified file failed (not a locked-target case).
    FileMoveFailed {
        remote: String,
        local: PathBuf,
        target: PathBuf,
    },
    /// The session's error flag flipped.
    HasErrorsChanged { has_errors: bool },
    /// The session started or reached a terminal state.
    IsRunningChanged { is_running: bool },
}

/// Snapshot of the client's observable properties.
#[derive(Debug, Clone)]
pub struct ClientStatus {
    /// Current session state.
    pub state: UpdateState,
    /// True from `start()` until the session reaches a terminal state.
    pub is_running: bool,
    /// True once any file permanently failed this session.
    pub has_errors: bool,
    /// The published version reported by the resolver, once known.
    pub live_version: Option<Version>,
}

impl ClientStatus {
    /// Status before any session has run.
    pub fn idle() -> Self {
        Self {
            state: UpdateState::Idle,
            is_running: false,
            has_errors: false,
            live_version: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> ManifestEntry {
        ManifestEntry {
            size: 16,
            hash: "ff".into(),
            version: 4,
        }
    }

    #[test]
    fn test_new_task_is_pending() {
        let task = DownloadTask::new(
            "data/a.bin",
            PathBuf::from("/tmp/a.part"),
            PathBuf::from("/opt/game/data/a.bin"),
            &entry(),
        );
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
        assert_eq!(task.version, 4);
        assert!(!task.status.is_terminal());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Installed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::QueuedForOfflineReplace.is_terminal());
        assert!(!TaskStatus::Verified.is_terminal());
        assert!(!TaskStatus::Downloading.is_terminal());
    }

    #[test]
    fn test_terminal_session_states() {
        assert!(UpdateState::Completed.is_terminal());
        assert!(UpdateState::Failed.is_terminal());
        assert!(UpdateState::Cancelled.is_terminal());
        assert!(!UpdateState::Downloading.is_terminal());
        assert!(!UpdateState::Idle.is_terminal());
    }
}
