// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The update session coordinator.
//!
//! One tokio task owns every piece of mutable session state: the pending
//! queue, the active task map, the in-flight target guard, the local store.
//! Transfer workers and the host talk to it exclusively through channels,
//! so task state is never mutated from two contexts at once.
//!
//! Session flow: CheckingVersion -> Diffing -> Downloading -> Installing ->
//! Completed, with Failed reserved for resolver exhaustion and Cancelled
//! for explicit aborts. Per-file failures re-enqueue up to the configured
//! attempt budget and then mark only that task as permanently failed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};

use super::types::{ClientStatus, DownloadTask, TaskStatus, UpdateEvent, UpdateState};
use crate::config::UpdateConfig;
use crate::hashing;
use crate::manifest::Manifest;
use crate::replacer::{is_locked_error, OfflineFileReplacer};
use crate::resolver::ManifestResolver;
use crate::source::{DownloadRequest, DownloadSource, TransferOutcome};
use crate::store::{FileStamp, UpdateStore};

/// Host commands consumed by the coordinator.
#[derive(Debug)]
pub(crate) enum Command {
    /// Begin an update session.
    Start,
    /// Abort the running session.
    Cancel,
    /// Stop the coordinator task.
    Shutdown,
}

/// What a command means for a session in progress.
enum CommandAction {
    Continue,
    Abort { shutdown: bool },
}

/// The coordinator: single owner of all session state.
pub(crate) struct Coordinator {
    pub(crate) config: UpdateConfig,
    pub(crate) resolver: Arc<dyn ManifestResolver>,
    pub(crate) sources: Vec<Arc<dyn DownloadSource>>,
    pub(crate) store: UpdateStore,
    pub(crate) replacer: OfflineFileReplacer,
    pub(crate) cancel_flag: Arc<std::sync::atomic::AtomicBool>,
    pub(crate) command_rx: mpsc::Receiver<Command>,
    pub(crate) completion_rx: mpsc::Receiver<TransferOutcome>,
    pub(crate) status_tx: watch::Sender<ClientStatus>,
    pub(crate) events_tx: broadcast::Sender<UpdateEvent>,
}

impl Coordinator {
    /// Consume commands until shutdown. Each `Start` runs one full session
    /// to a terminal state.
    pub(crate) async fn run(mut self) {
        loop {
            let Some(command) = self.command_rx.recv().await else {
                break;
            };
            match command {
                Command::Start => {
                    if self.run_session().await {
                        break;
                    }
                }
                Command::Cancel => {
                    // No session running; nothing to cancel.
                }
                Command::Shutdown => break,
            }
        }
        tracing::debug!("update coordinator stopped");
    }

    /// Run one session to a terminal state. Returns true when a shutdown
    /// was requested mid-session.
    async fn run_session(&mut self) -> bool {
        self.cancel_flag.store(false, Ordering::Relaxed);
        // Stale outcomes from a cancelled session must not leak into this
        // one.
        while self.completion_rx.try_recv().is_ok() {}

        self.set_has_errors(false);
        self.status_tx.send_modify(|s| s.live_version = None);
        self.set_running(true);

        // --- CheckingVersion ---
        self.transition(UpdateState::CheckingVersion);
        let local_version = self.store.installed_version;
        let resolver = Arc::clone(&self.resolver);
        let mut resolve_fut = resolver.resolve(local_version);
        let manifest = loop {
            enum Wake {
                Resolved(Result<Manifest, crate::error::UpdateError>),
                Command(Option<Command>),
            }
            let wake = tokio::select! {
                result = &mut resolve_fut => Wake::Resolved(result),
                command = self.command_rx.recv() => Wake::Command(command),
            };
            match wake {
                Wake::Resolved(result) => break result,
                Wake::Command(command) => match classify_command(command) {
                    CommandAction::Continue => {}
                    CommandAction::Abort { shutdown } => {
                        self.cancel_flag.store(true, Ordering::Relaxed);
                        self.finish(UpdateState::Cancelled);
                        return shutdown;
                    }
                },
            }
        };
        drop(resolve_fut);

        let manifest = match manifest {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::error!(error = %e, "version resolution failed, session aborted");
                self.finish(UpdateState::Failed);
                return false;
            }
        };

        self.status_tx
            .send_modify(|s| s.live_version = Some(manifest.version));
        self.emit(UpdateEvent::LiveVersionFound {
            version: manifest.version,
        });
        tracing::info!(
            local = local_version,
            live = manifest.version,
            "live version found"
        );

        if manifest.version == local_version {
            tracing::info!("already up to date");
            self.finish(UpdateState::Completed);
            return false;
        }

        // --- Diffing ---
        self.transition(UpdateState::Diffing);
        let tasks = build_tasks(&manifest, &self.store, &self.config);
        tracing::info!(
            listed = manifest.len(),
            stale = tasks.len(),
            "manifest diff complete"
        );

        // --- Downloading ---
        self.transition(UpdateState::Downloading);
        let mut pending = tasks;
        let mut active: HashMap<String, DownloadTask> = HashMap::new();
        let mut in_flight = HashSet::new();
        let mut finished: Vec<DownloadTask> = Vec::new();
        let mut cancelled = false;
        let mut shutdown = false;

        while !pending.is_empty() || !active.is_empty() {
            if !cancelled {
                self.schedule(&mut pending, &mut active, &mut in_flight);
            }
            if active.is_empty() {
                if cancelled {
                    break;
                }
                if pending.is_empty() {
                    break;
                }
                // All sources momentarily refused while nothing is in
                // flight; back off briefly rather than spin.
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }

            enum Wake {
                Outcome(Option<TransferOutcome>),
                Command(Option<Command>),
            }
            let wake = tokio::select! {
                outcome = self.completion_rx.recv() => Wake::Outcome(outcome),
                command = self.command_rx.recv() => Wake::Command(command),
            };
            match wake {
                Wake::Outcome(outcome) => {
                    let Some(outcome) = outcome else { break };
                    self.handle_outcome(
                        outcome,
                        &mut pending,
                        &mut active,
                        &mut in_flight,
                        &mut finished,
                        cancelled,
                    )
                    .await;
                }
                Wake::Command(command) => match classify_command(command) {
                    CommandAction::Continue => {}
                    CommandAction::Abort { shutdown: s } => {
                        cancelled = true;
                        shutdown = s;
                        self.cancel_flag.store(true, Ordering::Relaxed);
                        tracing::info!("cancelling session, draining active transfers");
                    }
                },
            }
        }

        if cancelled {
            for task in pending.iter().chain(active.values()).chain(finished.iter()) {
                let _ = fs::remove_file(&task.temp_path);
            }
            self.finish(UpdateState::Cancelled);
            return shutdown;
        }

        // --- Installing ---
        self.transition(UpdateState::Installing);
        let manifest_version = manifest.version;
        let mut store_dirty = false;
        for task in finished
            .iter_mut()
            .filter(|t| t.status == TaskStatus::Verified)
        {
            match install_file(&task.temp_path, &task.target_path) {
                Ok(()) => {
                    task.set_status(TaskStatus::Installed);
                    self.store.record_file(
                        task.remote_path.clone(),
                        FileStamp {
                            size: task.size,
                            hash: task.hash.clone(),
                        },
                    );
                    store_dirty = true;
                    if let Err(e) = self.replacer.clear_pending(&task.target_path) {
                        tracing::warn!(error = %e, "failed to drop stale replace entry");
                    }
                    tracing::info!(remote = %task.remote_path, "installed");
                }
                Err(e) if is_locked_error(&e) => {
                    tracing::info!(
                        remote = %task.remote_path,
                        "target locked, deferring to offline replace"
                    );
                    match self
                        .replacer
                        .queue_replacement(&task.temp_path, &task.target_path)
                    {
                        Ok(()) => task.set_status(TaskStatus::QueuedForOfflineReplace),
                        Err(qe) => {
                            tracing::error!(
                                remote = %task.remote_path,
                                error = %qe,
                                "failed to queue offline replacement"
                            );
                            self.fail_install(task);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(
                        remote = %task.remote_path,
                        error = %e,
                        "failed to move file into place"
                    );
                    self.fail_install(task);
                    let _ = fs::remove_file(&task.temp_path);
                }
            }
        }

        // A session with permanent failures keeps the old version so the
        // next check re-diffs and retries only what is still stale.
        if !self.status_tx.borrow().has_errors {
            self.store.advance_version(manifest_version);
            store_dirty = true;
        }
        if store_dirty {
            if let Err(e) = self.store.save() {
                tracing::error!(error = %e, "failed to persist update state");
            }
        }

        self.finish(UpdateState::Completed);
        false
    }

    /// Hand pending tasks to sources while capacity allows, preferring the
    /// source with the most idle workers.
    fn schedule(
        &self,
        pending: &mut VecDeque<DownloadTask>,
        active: &mut HashMap<String, DownloadTask>,
        in_flight: &mut HashSet<std::path::PathBuf>,
    ) {
        while let Some(front) = pending.front() {
            if in_flight.contains(&front.target_path) {
                // Another worker is already writing this target; wait for
                // it to finish before rescheduling.
                break;
            }
            let Some(source) = self
                .sources
                .iter()
                .filter(|s| s.can_download())
                .max_by_key(|s| s.free_workers())
            else {
                break;
            };

            let Some(mut task) = pending.pop_front() else {
                break;
            };
            let accepted = source.download(DownloadRequest {
                remote_path: task.remote_path.clone(),
                temp_path: task.temp_path.clone(),
                version: task.version,
                cancel: Arc::clone(&self.cancel_flag),
            });
            if accepted {
                task.set_status(TaskStatus::Downloading);
                in_flight.insert(task.target_path.clone());
                active.insert(task.remote_path.clone(), task);
            } else {
                pending.push_front(task);
                break;
            }
        }
    }

    /// Fold one transfer completion back into the task sets.
    async fn handle_outcome(
        &self,
        outcome: TransferOutcome,
        pending: &mut VecDeque<DownloadTask>,
        active: &mut HashMap<String, DownloadTask>,
        in_flight: &mut HashSet<std::path::PathBuf>,
        finished: &mut Vec<DownloadTask>,
        cancelled: bool,
    ) {
        let Some(mut task) = active.remove(&outcome.remote_path) else {
            tracing::warn!(remote = %outcome.remote_path, "completion for unknown task");
            return;
        };
        in_flight.remove(&task.target_path);

        if cancelled {
            task.set_status(TaskStatus::Pending);
            pending.push_back(task);
            return;
        }

        match outcome.result {
            Ok(()) => {
                let temp = task.temp_path.clone();
                let size = task.size;
                let hash = task.hash.clone();
                let verified =
                    tokio::task::spawn_blocking(move || verify_file(&temp, size, &hash))
                        .await
                        .unwrap_or_else(|e| Err(format!("verification task failed: {}", e)));

                match verified {
                    Ok(()) => {
                        task.set_status(TaskStatus::Verified);
                        self.emit(UpdateEvent::FileDownloaded {
                            remote: task.remote_path.clone(),
                            local: task.temp_path.clone(),
                        });
                        tracing::info!(remote = %task.remote_path, "downloaded and verified");
                        finished.push(task);
                    }
                    Err(reason) => {
                        tracing::warn!(
                            remote = %task.remote_path,
                            reason = %reason,
                            "downloaded file failed verification"
                        );
                        self.retry_or_fail(task, pending, finished);
                    }
                }
            }
            Err(error) => {
                tracing::warn!(
                    remote = %task.remote_path,
                    error = %error,
                    "transfer failed"
                );
                self.retry_or_fail(task, pending, finished);
            }
        }
    }

    /// Re-enqueue a failed task while budget remains, otherwise mark it
    /// permanently failed and keep the session going.
    fn retry_or_fail(
        &self,
        mut task: DownloadTask,
        pending: &mut VecDeque<DownloadTask>,
        finished: &mut Vec<DownloadTask>,
    ) {
        task.attempts += 1;
        if task.attempts < self.config.max_retries {
            tracing::info!(
                remote = %task.remote_path,
                attempt = task.attempts,
                "re-queueing download"
            );
            task.set_status(TaskStatus::Pending);
            pending.push_back(task);
        } else {
            tracing::error!(
                remote = %task.remote_path,
                attempts = task.attempts,
                "download failed permanently"
            );
            task.set_status(TaskStatus::Failed);
            self.emit(UpdateEvent::FileDownloadFailed {
                remote: task.remote_path.clone(),
            });
            self.set_has_errors(true);
            let _ = fs::remove_file(&task.temp_path);
            finished.push(task);
        }
    }

    fn fail_install(&self, task: &mut DownloadTask) {
        task.set_status(TaskStatus::Failed);
        self.set_has_errors(true);
        self.emit(UpdateEvent::FileMoveFailed {
            remote: task.remote_path.clone(),
            local: task.temp_path.clone(),
            target: task.target_path.clone(),
        });
    }

    fn transition(&self, to: UpdateState) {
        let from = self.status_tx.borrow().state;
        if from == to {
            return;
        }
        self.status_tx.send_modify(|s| s.state = to);
        tracing::info!(?from, ?to, "update state changed");
        self.emit(UpdateEvent::StateChanged { from, to });
    }

    fn finish(&self, state: UpdateState) {
        self.transition(state);
        self.set_running(false);
    }

    fn set_running(&self, is_running: bool) {
        if self.status_tx.borrow().is_running == is_running {
            return;
        }
        self.status_tx.send_modify(|s| s.is_running = is_running);
        self.emit(UpdateEvent::IsRunningChanged { is_running });
    }

    fn set_has_errors(&self, has_errors: bool) {
        if self.status_tx.borrow().has_errors == has_errors {
            return;
        }
        self.status_tx.send_modify(|s| s.has_errors = has_errors);
        self.emit(UpdateEvent::HasErrorsChanged { has_errors });
    }

    fn emit(&self, event: UpdateEvent) {
        // Nobody listening is fine; events are advisory.
        let _ = self.events_tx.send(event);
    }
}

fn classify_command(command: Option<Command>) -> CommandAction {
    match command {
        Some(Command::Start) => CommandAction::Continue,
        Some(Command::Cancel) => CommandAction::Abort { shutdown: false },
        Some(Command::Shutdown) | None => CommandAction::Abort { shutdown: true },
    }
}

/// Compare a manifest against the local cache and build the pending task
/// queue, in manifest (publish) order. Files whose cached stamp matches
/// are never scheduled.
pub(crate) fn build_tasks(
    manifest: &Manifest,
    store: &UpdateStore,
    config: &UpdateConfig,
) -> VecDeque<DownloadTask> {
    manifest
        .files
        .iter()
        .filter(|(path, entry)| !store.stamp_matches(path, entry))
        .map(|(path, entry)| {
            DownloadTask::new(
                path.clone(),
                config.temp_dir.join(format!("{}.part", path)),
                config.install_dir.join(path),
                entry,
            )
        })
        .collect()
}

/// Check a downloaded file against its manifest expectations.
fn verify_file(path: &Path, size: u64, hash: &str) -> Result<(), String> {
    let metadata = fs::metadata(path).map_err(|e| e.to_string())?;
    if metadata.len() != size {
        return Err(format!(
            "size mismatch: expected {}, got {}",
            size,
            metadata.len()
        ));
    }
    let actual = hashing::sha256_file(path).map_err(|e| e.to_string())?;
    if actual != hash {
        return Err(format!("hash mismatch: expected {}, got {}", hash, actual));
    }
    Ok(())
}

/// Move a verified temp file into its target location. Falls back to
/// copy+remove when temp and target live on different filesystems.
fn install_file(temp: &Path, target: &Path) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(temp, target) {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device_error(&e) => {
            fs::copy(temp, target)?;
            fs::remove_file(temp)?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn is_cross_device_error(error: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        // EXDEV
        error.raw_os_error() == Some(18)
    }
    #[cfg(windows)]
    {
        // ERROR_NOT_SAME_DEVICE
        error.raw_os_error() == Some(17)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = error;
        false
    }
}
