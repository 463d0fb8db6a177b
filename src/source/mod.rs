// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download sources and transfer workers.
//!
//! A download source wraps one transport backend (HTTP today) behind a
//! bounded pool of concurrent transfer workers. `download()` never blocks:
//! it either claims an idle worker and starts the transfer, or returns
//! `false` so the scheduler retries later. Every accepted transfer posts
//! exactly one [`TransferOutcome`] on the coordinator channel.
//!
//! Sources perform no retries; retry policy lives entirely in the session
//! coordinator.

pub mod http;
pub mod pool;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::manifest::Version;

pub use http::HttpSource;
pub use pool::{TransferWorker, WorkerPool};

/// Transport backing a download source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Plain HTTP(S) file server.
    Http,
}

/// Configuration for one download source.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Transport used to fetch files.
    pub transport: TransportKind,
    /// Root location files are fetched relative to, e.g.
    /// `https://cdn.example/patches`.
    pub root: String,
    /// Concurrent transfer worker capacity.
    pub workers: usize,
}

/// Two descriptors identify the same backend when transport and root
/// match; worker capacity does not distinguish sources.
impl PartialEq for SourceDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.transport == other.transport && self.root == other.root
    }
}

impl SourceDescriptor {
    /// HTTP source descriptor.
    pub fn http(root: impl Into<String>, workers: usize) -> Self {
        Self {
            transport: TransportKind::Http,
            root: root.into(),
            workers,
        }
    }
}

/// One file transfer request handed to a source.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// File path relative to the source root.
    pub remote_path: String,
    /// Local temp file the transfer writes into.
    pub temp_path: PathBuf,
    /// The version owning this file on the source.
    pub version: Version,
    /// Session cancel flag; workers abort between chunks when set.
    pub cancel: Arc<AtomicBool>,
}

/// Why a transfer failed. Classification only; no retry here.
#[derive(Debug, Clone)]
pub enum TransferError {
    /// The request timed out.
    Timeout(String),
    /// Could not connect to the source.
    Connect(String),
    /// The source answered with a non-success HTTP status.
    Status(u16),
    /// The session cancel flag was set mid-transfer.
    Cancelled,
    /// Local I/O failure while writing the temp file.
    Io(String),
}

impl TransferError {
    /// True for failures that a retry against the same source cannot fix
    /// (the file is missing or the request is malformed).
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Status(code) => {
                (400..500).contains(code) && *code != 408 && *code != 429
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout(msg) => write!(f, "transfer timed out: {}", msg),
            Self::Connect(msg) => write!(f, "connection failed: {}", msg),
            Self::Status(code) => write!(f, "source answered HTTP {}", code),
            Self::Cancelled => write!(f, "transfer cancelled"),
            Self::Io(msg) => write!(f, "local I/O error: {}", msg),
        }
    }
}

impl std::error::Error for TransferError {}

/// Completion message posted by a worker when its transfer ends. Exactly
/// one outcome is sent per accepted `download()` call.
#[derive(Debug)]
pub struct TransferOutcome {
    /// File path relative to the source root.
    pub remote_path: String,
    /// Temp file the transfer wrote (complete on `Ok`).
    pub temp_path: PathBuf,
    /// Transfer result.
    pub result: Result<(), TransferError>,
}

/// A transport backend with bounded transfer concurrency.
pub trait DownloadSource: Send + Sync {
    /// The descriptor this source was built from.
    fn descriptor(&self) -> &SourceDescriptor;

    /// Number of currently idle transfer workers.
    fn free_workers(&self) -> usize;

    /// True iff at least one worker is idle.
    fn can_download(&self) -> bool {
        self.free_workers() > 0
    }

    /// Claim an idle worker and start an asynchronous transfer.
    ///
    /// Returns `false` immediately when no worker is free; no task was
    /// started and the caller must reschedule later; this is not a
    /// download failure.
    fn download(&self, request: DownloadRequest) -> bool;
}

/// Build sources from descriptors, collapsing duplicates (same transport
/// and root) into a single pool so one backend never gets two pools.
pub fn build_sources(
    descriptors: &[SourceDescriptor],
    completion_tx: mpsc::Sender<TransferOutcome>,
) -> Result<Vec<Arc<dyn DownloadSource>>> {
    let mut seen: Vec<SourceDescriptor> = Vec::new();
    let mut sources: Vec<Arc<dyn DownloadSource>> = Vec::new();

    for descriptor in descriptors {
        if seen.iter().any(|d| d == descriptor) {
            tracing::warn!(
                root = %descriptor.root,
                "duplicate download source descriptor ignored"
            );
            continue;
        }
        seen.push(descriptor.clone());
        match descriptor.transport {
            TransportKind::Http => {
                sources.push(Arc::new(HttpSource::new(
                    descriptor.clone(),
                    completion_tx.clone(),
                )?));
            }
        }
    }

    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_identity_ignores_capacity() {
        let a = SourceDescriptor::http("http://cdn.example/files", 4);
        let b = SourceDescriptor::http("http://cdn.example/files", 16);
        let c = SourceDescriptor::http("http://mirror.example/files", 4);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_permanent_error_classification() {
        assert!(TransferError::Status(404).is_permanent());
        assert!(TransferError::Status(403).is_permanent());
        assert!(!TransferError::Status(408).is_permanent());
        assert!(!TransferError::Status(429).is_permanent());
        assert!(!TransferError::Status(500).is_permanent());
        assert!(!TransferError::Timeout("slow".into()).is_permanent());
        assert!(!TransferError::Cancelled.is_permanent());
    }

    #[tokio::test]
    async fn test_build_sources_dedups_same_backend() {
        let (tx, _rx) = mpsc::channel(8);
        let sources = build_sources(
            &[
                SourceDescriptor::http("http://cdn.example/files", 2),
                SourceDescriptor::http("http://cdn.example/files", 8),
                SourceDescriptor::http("http://mirror.example/files", 2),
            ],
            tx,
        )
        .expect("build");

        assert_eq!(sources.len(), 2);
        // The first descriptor wins; its capacity is the one kept.
        assert_eq!(sources[0].descriptor().workers, 2);
    }
}
