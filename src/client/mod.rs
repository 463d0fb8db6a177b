// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The host-facing update client.
//!
//! [`UpdateClient`] spawns one coordinator task that owns all session
//! state; the client itself is a thin handle of channels. Commands go in
//! over an mpsc channel, observable properties come back through a watch
//! snapshot, and lifecycle notifications fan out on a broadcast channel.
//!
//! # Example
//!
//! ```no_run
//! use patchrun::{SourceDescriptor, UpdateClient, UpdateConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = UpdateConfig::new("/opt/game")
//!     .endpoint("https://master.example/updates")
//!     .source(SourceDescriptor::http("https://cdn.example/patches", 4));
//!
//! let client = UpdateClient::new(config)?;
//! client.start().await?;
//!
//! let status = client.wait().await;
//! if status.has_errors {
//!     eprintln!("update finished with per-file errors");
//! }
//! if client.try_execute_offline_replacer() {
//!     // Locked files will be swapped after this process exits.
//! }
//! # Ok(())
//! # }
//! ```

mod session;
pub mod types;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::{broadcast, mpsc, watch};

use crate::config::UpdateConfig;
use crate::manifest::Version;
use crate::replacer::OfflineFileReplacer;
use crate::resolver::{HttpResolver, ManifestResolver};
use crate::source::{build_sources, DownloadSource, TransferOutcome};
use crate::store::UpdateStore;

use session::{Command, Coordinator};

pub use types::{ClientStatus, DownloadTask, TaskStatus, UpdateEvent, UpdateState};

/// Capacity of the host command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// Capacity of the transfer completion channel.
const COMPLETION_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the event broadcast channel; slow subscribers lag rather
/// than block the coordinator.
const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Handle to the update coordinator.
///
/// Cheap to clone-by-parts: all fields are channel handles. Dropping the
/// client does not stop a running session; call [`UpdateClient::shutdown`]
/// for an orderly stop.
pub struct UpdateClient {
    command_tx: mpsc::Sender<Command>,
    cancel_flag: Arc<AtomicBool>,
    status_rx: watch::Receiver<ClientStatus>,
    events_tx: broadcast::Sender<UpdateEvent>,
    replacer: OfflineFileReplacer,
}

impl UpdateClient {
    /// Create a client with an HTTP resolver and HTTP download sources
    /// built from the config, and start the coordinator task.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(config: UpdateConfig) -> Result<Self> {
        config.validate()?;
        let resolver: Arc<dyn ManifestResolver> = Arc::new(
            HttpResolver::new(config.endpoints.clone())
                .with_context(|| "Failed to build manifest resolver")?,
        );
        let descriptors = config.sources.clone();
        Self::with_parts(config, resolver, move |completion_tx| {
            build_sources(&descriptors, completion_tx)
        })
    }

    /// Create a client from explicit parts: a resolver and a source
    /// builder receiving the completion channel. This is the seam tests
    /// and alternative transports plug into.
    pub fn with_parts(
        config: UpdateConfig,
        resolver: Arc<dyn ManifestResolver>,
        build: impl FnOnce(mpsc::Sender<TransferOutcome>) -> Result<Vec<Arc<dyn DownloadSource>>>,
    ) -> Result<Self> {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (completion_tx, completion_rx) = mpsc::channel(COMPLETION_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(ClientStatus::idle());
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let cancel_flag = Arc::new(AtomicBool::new(false));

        let sources = build(completion_tx)?;
        if sources.is_empty() {
            bail!("update client needs at least one download source");
        }

        let store = UpdateStore::open(&config.state_dir)
            .with_context(|| "Failed to open local update state")?;
        let replacer = OfflineFileReplacer::new(
            &config.state_dir,
            config.helper_path.clone(),
            config.relaunch.clone(),
        );

        let coordinator = Coordinator {
            config,
            resolver,
            sources,
            store,
            replacer: replacer.clone(),
            cancel_flag: Arc::clone(&cancel_flag),
            command_rx,
            completion_rx,
            status_tx,
            events_tx: events_tx.clone(),
        };
        tokio::spawn(coordinator.run());

        Ok(Self {
            command_tx,
            cancel_flag,
            status_rx,
            events_tx,
            replacer,
        })
    }

    /// Trigger an update check. The session runs in the background; watch
    /// [`UpdateClient::subscribe`] or [`UpdateClient::wait`] for progress.
    pub async fn start(&self) -> Result<()> {
        self.command_tx
            .send(Command::Start)
            .await
            .with_context(|| "update coordinator is not running")?;
        Ok(())
    }

    /// Cancel the running session. In-flight transfers abort at the next
    /// chunk; no files are installed. A no-op when nothing is running.
    pub async fn cancel(&self) -> Result<()> {
        self.cancel_flag.store(true, Ordering::Relaxed);
        self.command_tx
            .send(Command::Cancel)
            .await
            .with_context(|| "update coordinator is not running")?;
        Ok(())
    }

    /// Stop the coordinator task. A running session is cancelled first.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel_flag.store(true, Ordering::Relaxed);
        self.command_tx
            .send(Command::Shutdown)
            .await
            .with_context(|| "update coordinator is not running")?;
        Ok(())
    }

    /// Subscribe to lifecycle events. Each subscriber gets every event
    /// from the point of subscription; lagging subscribers skip, never
    /// block.
    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.events_tx.subscribe()
    }

    /// Snapshot of the observable session properties.
    pub fn status(&self) -> ClientStatus {
        self.status_rx.borrow().clone()
    }

    /// Current session state.
    pub fn state(&self) -> UpdateState {
        self.status_rx.borrow().state
    }

    /// True while a session is running.
    pub fn is_running(&self) -> bool {
        self.status_rx.borrow().is_running
    }

    /// True once any file permanently failed in the current/last session.
    pub fn has_errors(&self) -> bool {
        self.status_rx.borrow().has_errors
    }

    /// The live version reported by the resolver, once known.
    pub fn live_version(&self) -> Option<Version> {
        self.status_rx.borrow().live_version
    }

    /// Wait until the session reaches a terminal state and return the
    /// final status.
    pub async fn wait(&self) -> ClientStatus {
        let mut status_rx = self.status_rx.clone();
        loop {
            {
                let status = status_rx.borrow_and_update();
                if status.state.is_terminal() && !status.is_running {
                    return status.clone();
                }
            }
            if status_rx.changed().await.is_err() {
                return self.status_rx.borrow().clone();
            }
        }
    }

    /// Spawn the detached helper to apply queued offline replacements.
    ///
    /// Returns true iff the queue is non-empty and the helper was spawned;
    /// the host typically calls this right before exiting or relaunching.
    pub fn try_execute_offline_replacer(&self) -> bool {
        self.replacer.try_execute()
    }

    /// Access the offline replacer (queue inspection, manual clears).
    pub fn offline_replacer(&self) -> &OfflineFileReplacer {
        &self.replacer
    }
}
