// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! patchrun - Live-update client library
//!
//! Download what changed, swap the rest on restart.
//!
//! patchrun keeps an installed file tree in sync with the currently
//! published release: it resolves the live version and manifest from
//! master-server endpoints, diffs against a local file-hash cache,
//! downloads only stale files concurrently from one or more sources, and
//! installs them atomically. Files locked by the still-running host are
//! deferred to a persisted queue applied by the detached `patchrun-helper`
//! process after the host exits.
//!
//! **CheckingVersion** -> **Diffing** -> **Downloading** -> **Installing**
//!
//! # Core Modules
//!
//! - [`client`] - The update client: state machine, events, observable properties
//! - [`resolver`] - Live version and manifest resolution with retry/backoff
//! - [`source`] - Download sources with bounded transfer worker pools
//! - [`manifest`] - Release manifest types
//! - [`store`] - Persisted installed version and per-file hash cache
//! - [`replacer`] - Deferred replacement of locked files
//! - [`config`] - Client configuration
//! - [`hashing`] - SHA-256 content hashing
//! - [`error`] - Session-level error taxonomy

pub mod client;
pub mod config;
pub mod error;
pub mod hashing;
pub mod manifest;
pub mod replacer;
pub mod resolver;
pub mod source;
pub mod store;

// Re-export the host-facing surface
pub use client::{
    ClientStatus, DownloadTask, TaskStatus, UpdateClient, UpdateEvent, UpdateState,
};
pub use config::UpdateConfig;
pub use error::UpdateError;
pub use manifest::{Manifest, ManifestEntry, Version};
pub use replacer::{OfflineFileReplacer, OfflineReplaceEntry};
pub use resolver::{HttpResolver, ManifestResolver};
pub use source::{
    DownloadRequest, DownloadSource, HttpSource, SourceDescriptor, TransferError,
    TransferOutcome, TransportKind, WorkerPool,
};
pub use store::{FileStamp, UpdateStore};
