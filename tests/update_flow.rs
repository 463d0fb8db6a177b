// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! End-to-end update session scenarios.
//!
//! These tests drive the full state machine with scripted resolvers and
//! download sources: no network, real temp/install/state directories on
//! disk.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use patchrun::hashing::sha256_bytes;
use patchrun::{
    DownloadRequest, DownloadSource, Manifest, ManifestResolver, SourceDescriptor,
    TransferError, TransferOutcome, UpdateClient, UpdateConfig, UpdateError, UpdateEvent,
    UpdateState, UpdateStore, Version, WorkerPool,
};

// =============================================================================
// Scripted collaborators
// =============================================================================

/// Resolver that always returns the same manifest.
struct FixedResolver {
    manifest: Manifest,
}

#[async_trait]
impl ManifestResolver for FixedResolver {
    async fn resolve(&self, _local_version: Version) -> Result<Manifest, UpdateError> {
        Ok(self.manifest.clone())
    }
}

/// Resolver with no reachable endpoints.
struct FailingResolver;

#[async_trait]
impl ManifestResolver for FailingResolver {
    async fn resolve(&self, _local_version: Version) -> Result<Manifest, UpdateError> {
        Err(UpdateError::Resolver("all endpoints unreachable".into()))
    }
}

/// Observation handles shared between a test and its scripted source.
#[derive(Clone, Default)]
struct SourceProbe {
    /// Accepted download() calls.
    started: Arc<AtomicUsize>,
    /// Transfers currently in flight.
    concurrent: Arc<AtomicUsize>,
    /// High-water mark of concurrent transfers.
    max_concurrent: Arc<AtomicUsize>,
}

/// Download source serving scripted file contents from memory, optionally
/// failing the first N attempts per path.
struct ScriptedSource {
    descriptor: SourceDescriptor,
    pool: Arc<WorkerPool>,
    completion_tx: mpsc::Sender<TransferOutcome>,
    contents: HashMap<String, Vec<u8>>,
    fail_counts: Mutex<HashMap<String, u32>>,
    delay: Duration,
    probe: SourceProbe,
}

impl ScriptedSource {
    #[allow(clippy::too_many_arguments)]
    fn build(
        root: &str,
        workers: usize,
        contents: HashMap<String, Vec<u8>>,
        fail_counts: HashMap<String, u32>,
        delay: Duration,
        completion_tx: mpsc::Sender<TransferOutcome>,
        probe: SourceProbe,
    ) -> Arc<dyn DownloadSource> {
        Arc::new(Self {
            descriptor: SourceDescriptor::http(root, workers),
            pool: Arc::new(WorkerPool::new(workers)),
            completion_tx,
            contents,
            fail_counts: Mutex::new(fail_counts),
            delay,
            probe,
        })
    }
}

impl DownloadSource for ScriptedSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    fn free_workers(&self) -> usize {
        self.pool.free_count()
    }

    fn download(&self, request: DownloadRequest) -> bool {
        let Some(worker) = self.pool.claim() else {
            return false;
        };
        self.probe.started.fetch_add(1, Ordering::SeqCst);

        let fail = {
            let mut counts = self.fail_counts.lock().expect("fail counts lock");
            match counts.get_mut(&request.remote_path) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };
        let content = self.contents.get(&request.remote_path).cloned();
        let pool = Arc::clone(&self.pool);
        let completion_tx = self.completion_tx.clone();
        let delay = self.delay;
        let probe = self.probe.clone();

        tokio::spawn(async move {
            let now = probe.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            probe.max_concurrent.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(delay).await;

            let result = if fail {
                Err(TransferError::Status(503))
            } else {
                match content {
                    Some(bytes) => write_temp(&request.temp_path, &bytes).await,
                    None => Err(TransferError::Status(404)),
                }
            };

            probe.concurrent.fetch_sub(1, Ordering::SeqCst);
            pool.release(worker);
            let _ = completion_tx
                .send(TransferOutcome {
                    remote_path: request.remote_path,
                    temp_path: request.temp_path,
                    result,
                })
                .await;
        });

        true
    }
}

async fn write_temp(path: &PathBuf, bytes: &[u8]) -> Result<(), TransferError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| TransferError::Io(e.to_string()))?;
    }
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| TransferError::Io(e.to_string()))
}

// =============================================================================
// Fixture helpers
// =============================================================================

fn test_config(dir: &TempDir) -> UpdateConfig {
    let mut config = UpdateConfig::new(dir.path().join("install"));
    config.state_dir = dir.path().join("state");
    config.temp_dir = dir.path().join("tmp");
    config
}

fn seed_local_version(config: &UpdateConfig, version: Version) {
    let mut store = UpdateStore::open(&config.state_dir).expect("open store");
    store.advance_version(version);
    store.save().expect("save store");
}

fn entry_for(bytes: &[u8], version: Version) -> (u64, String, Version) {
    (bytes.len() as u64, sha256_bytes(bytes), version)
}

fn drain_events(events: &mut tokio::sync::broadcast::Receiver<UpdateEvent>) -> Vec<UpdateEvent> {
    let mut collected = Vec::new();
    while let Ok(event) = events.try_recv() {
        collected.push(event);
    }
    collected
}

// =============================================================================
// Scenario A: already up to date
// =============================================================================

#[tokio::test]
async fn up_to_date_session_skips_downloads() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&dir);
    seed_local_version(&config, 3);

    let probe = SourceProbe::default();
    let probe_handle = probe.clone();
    let client = UpdateClient::with_parts(
        config,
        Arc::new(FixedResolver {
            manifest: Manifest::new(3).with_file("data/a.bin", 4, "aaaa", 3),
        }),
        move |tx| {
            Ok(vec![ScriptedSource::build(
                "http://cdn.test/files",
                2,
                HashMap::new(),
                HashMap::new(),
                Duration::from_millis(5),
                tx,
                probe_handle,
            )])
        },
    )
    .expect("client");

    client.start().await.expect("start");
    let status = client.wait().await;

    assert_eq!(status.state, UpdateState::Completed);
    assert!(!status.is_running);
    assert!(!status.has_errors);
    assert_eq!(status.live_version, Some(3));
    assert_eq!(probe.started.load(Ordering::SeqCst), 0, "no downloads expected");
}

#[tokio::test]
async fn fully_cached_manifest_completes_without_downloads() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&dir);

    let bytes = b"already on disk".to_vec();
    let (size, hash, _) = entry_for(&bytes, 2);

    // Version is behind but every manifest entry matches the cache.
    {
        let mut store = UpdateStore::open(&config.state_dir).expect("open store");
        store.advance_version(3);
        store.record_file(
            "data/a.bin",
            patchrun::FileStamp {
                size,
                hash: hash.clone(),
            },
        );
        store.save().expect("save store");
    }

    let probe = SourceProbe::default();
    let probe_handle = probe.clone();
    let client = UpdateClient::with_parts(
        config.clone(),
        Arc::new(FixedResolver {
            manifest: Manifest::new(5).with_file("data/a.bin", size, hash, 2),
        }),
        move |tx| {
            Ok(vec![ScriptedSource::build(
                "http://cdn.test/files",
                2,
                HashMap::new(),
                HashMap::new(),
                Duration::from_millis(5),
                tx,
                probe_handle,
            )])
        },
    )
    .expect("client");

    client.start().await.expect("start");
    let status = client.wait().await;

    assert_eq!(status.state, UpdateState::Completed);
    assert!(!status.has_errors);
    assert_eq!(probe.started.load(Ordering::SeqCst), 0);

    // An error-free session records the new version even with nothing to
    // download.
    let store = UpdateStore::open(&config.state_dir).expect("reopen store");
    assert_eq!(store.installed_version, 5);
}

// =============================================================================
// Scenario B: one stale file among cached ones
// =============================================================================

#[tokio::test]
async fn stale_file_is_downloaded_and_installed() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&dir);

    let a_bytes = b"fresh contents of a".to_vec();
    let b_bytes = b"unchanged b".to_vec();
    let (a_size, a_hash, _) = entry_for(&a_bytes, 5);
    let (b_size, b_hash, _) = entry_for(&b_bytes, 2);

    // Local state: version 3, b.bin already current.
    {
        let mut store = UpdateStore::open(&config.state_dir).expect("open store");
        store.advance_version(3);
        store.record_file(
            "data/b.bin",
            patchrun::FileStamp {
                size: b_size,
                hash: b_hash.clone(),
            },
        );
        store.save().expect("save store");
    }

    let manifest = Manifest::new(5)
        .with_file("data/a.bin", a_size, a_hash.clone(), 5)
        .with_file("data/b.bin", b_size, b_hash, 2);

    let probe = SourceProbe::default();
    let probe_handle = probe.clone();
    let contents = HashMap::from([("data/a.bin".to_string(), a_bytes.clone())]);
    let client = UpdateClient::with_parts(
        config.clone(),
        Arc::new(FixedResolver { manifest }),
        move |tx| {
            Ok(vec![ScriptedSource::build(
                "http://cdn.test/files",
                2,
                contents,
                HashMap::new(),
                Duration::from_millis(5),
                tx,
                probe_handle,
            )])
        },
    )
    .expect("client");

    let mut events = client.subscribe();
    client.start().await.expect("start");
    let status = client.wait().await;

    assert_eq!(status.state, UpdateState::Completed);
    assert!(!status.has_errors);
    assert_eq!(status.live_version, Some(5));
    assert_eq!(probe.started.load(Ordering::SeqCst), 1, "only a.bin is stale");

    let installed = fs::read(config.install_dir.join("data/a.bin")).expect("installed file");
    assert_eq!(installed, a_bytes);

    // Version advanced and the new stamp recorded.
    let store = UpdateStore::open(&config.state_dir).expect("reopen store");
    assert_eq!(store.installed_version, 5);
    assert_eq!(store.file_cache["data/a.bin"].hash, a_hash);

    let events = drain_events(&mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, UpdateEvent::LiveVersionFound { version: 5 })));
    assert!(events
        .iter()
        .any(|e| matches!(e, UpdateEvent::FileDownloaded { remote, .. } if remote == "data/a.bin")));
    assert!(!events
        .iter()
        .any(|e| matches!(e, UpdateEvent::FileDownloadFailed { .. })));
}

// =============================================================================
// Scenario C: one file exhausts its retry budget
// =============================================================================

#[tokio::test]
async fn exhausted_retries_fail_only_that_file() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&dir);
    seed_local_version(&config, 3);

    let a_bytes = b"a payload".to_vec();
    let b_bytes = b"b payload".to_vec();
    let (a_size, a_hash, _) = entry_for(&a_bytes, 5);
    let (b_size, b_hash, _) = entry_for(&b_bytes, 5);

    let manifest = Manifest::new(5)
        .with_file("data/a.bin", a_size, a_hash, 5)
        .with_file("data/b.bin", b_size, b_hash.clone(), 5);

    let probe = SourceProbe::default();
    let probe_handle = probe.clone();
    let contents = HashMap::from([
        ("data/a.bin".to_string(), a_bytes),
        ("data/b.bin".to_string(), b_bytes.clone()),
    ]);
    // a.bin fails every one of its 3 attempts.
    let fail_counts = HashMap::from([("data/a.bin".to_string(), 3u32)]);

    let client = UpdateClient::with_parts(
        config.clone(),
        Arc::new(FixedResolver { manifest }),
        move |tx| {
            Ok(vec![ScriptedSource::build(
                "http://cdn.test/files",
                2,
                contents,
                fail_counts,
                Duration::from_millis(5),
                tx,
                probe_handle,
            )])
        },
    )
    .expect("client");

    let mut events = client.subscribe();
    client.start().await.expect("start");
    let status = client.wait().await;

    assert_eq!(status.state, UpdateState::Completed, "per-file failure never fails the session");
    assert!(status.has_errors);

    // b.bin installed regardless of a.bin's fate.
    let installed = fs::read(config.install_dir.join("data/b.bin")).expect("b installed");
    assert_eq!(installed, b_bytes);
    assert!(!config.install_dir.join("data/a.bin").exists());

    // 3 attempts for a.bin, 1 for b.bin.
    assert_eq!(probe.started.load(Ordering::SeqCst), 4);

    // Version held back so the next session retries a.bin.
    let store = UpdateStore::open(&config.state_dir).expect("reopen store");
    assert_eq!(store.installed_version, 3);
    assert_eq!(store.file_cache["data/b.bin"].hash, b_hash);

    let events = drain_events(&mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, UpdateEvent::FileDownloadFailed { remote } if remote == "data/a.bin")));
    assert!(events
        .iter()
        .any(|e| matches!(e, UpdateEvent::HasErrorsChanged { has_errors: true })));
}

#[tokio::test]
async fn transient_failures_within_budget_still_succeed() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&dir);
    seed_local_version(&config, 1);

    let bytes = b"eventually fine".to_vec();
    let (size, hash, _) = entry_for(&bytes, 2);
    let manifest = Manifest::new(2).with_file("data/flaky.bin", size, hash, 2);

    let probe = SourceProbe::default();
    let probe_handle = probe.clone();
    let contents = HashMap::from([("data/flaky.bin".to_string(), bytes.clone())]);
    // Two failures, success on the third and final attempt.
    let fail_counts = HashMap::from([("data/flaky.bin".to_string(), 2u32)]);

    let client = UpdateClient::with_parts(
        config.clone(),
        Arc::new(FixedResolver { manifest }),
        move |tx| {
            Ok(vec![ScriptedSource::build(
                "http://cdn.test/files",
                1,
                contents,
                fail_counts,
                Duration::from_millis(5),
                tx,
                probe_handle,
            )])
        },
    )
    .expect("client");

    client.start().await.expect("start");
    let status = client.wait().await;

    assert_eq!(status.state, UpdateState::Completed);
    assert!(!status.has_errors);
    assert_eq!(probe.started.load(Ordering::SeqCst), 3);
    assert_eq!(
        fs::read(config.install_dir.join("data/flaky.bin")).expect("installed"),
        bytes
    );
}

// =============================================================================
// Resolver failure aborts the whole session
// =============================================================================

#[tokio::test]
async fn resolver_exhaustion_fails_session() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&dir);
    seed_local_version(&config, 3);

    let probe = SourceProbe::default();
    let probe_handle = probe.clone();
    let client = UpdateClient::with_parts(
        config.clone(),
        Arc::new(FailingResolver),
        move |tx| {
            Ok(vec![ScriptedSource::build(
                "http://cdn.test/files",
                1,
                HashMap::new(),
                HashMap::new(),
                Duration::from_millis(5),
                tx,
                probe_handle,
            )])
        },
    )
    .expect("client");

    client.start().await.expect("start");
    let status = client.wait().await;

    assert_eq!(status.state, UpdateState::Failed);
    assert!(!status.is_running);
    assert_eq!(status.live_version, None);
    assert_eq!(probe.started.load(Ordering::SeqCst), 0);

    // Local version untouched.
    let store = UpdateStore::open(&config.state_dir).expect("reopen store");
    assert_eq!(store.installed_version, 3);
}

// =============================================================================
// Capacity property: never more concurrent transfers than workers
// =============================================================================

#[tokio::test]
async fn source_concurrency_never_exceeds_capacity() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&dir);
    seed_local_version(&config, 1);

    let mut manifest = Manifest::new(2);
    let mut contents = HashMap::new();
    for i in 0..6 {
        let path = format!("data/file{}.bin", i);
        let bytes = format!("payload number {}", i).into_bytes();
        let (size, hash, _) = entry_for(&bytes, 2);
        manifest = manifest.with_file(&path, size, hash, 2);
        contents.insert(path, bytes);
    }

    let probe = SourceProbe::default();
    let probe_handle = probe.clone();
    let client = UpdateClient::with_parts(
        config.clone(),
        Arc::new(FixedResolver { manifest }),
        move |tx| {
            Ok(vec![ScriptedSource::build(
                "http://cdn.test/files",
                2,
                contents,
                HashMap::new(),
                Duration::from_millis(30),
                tx,
                probe_handle,
            )])
        },
    )
    .expect("client");

    client.start().await.expect("start");
    let status = client.wait().await;

    assert_eq!(status.state, UpdateState::Completed);
    assert_eq!(probe.started.load(Ordering::SeqCst), 6);
    assert!(
        probe.max_concurrent.load(Ordering::SeqCst) <= 2,
        "observed {} concurrent transfers from a capacity-2 source",
        probe.max_concurrent.load(Ordering::SeqCst)
    );
}

// =============================================================================
// Load distribution across sources
// =============================================================================

#[tokio::test]
async fn downloads_spread_across_sources() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&dir);
    seed_local_version(&config, 1);

    let mut manifest = Manifest::new(2);
    let mut contents = HashMap::new();
    for i in 0..4 {
        let path = format!("data/file{}.bin", i);
        let bytes = format!("spread payload {}", i).into_bytes();
        let (size, hash, _) = entry_for(&bytes, 2);
        manifest = manifest.with_file(&path, size, hash, 2);
        contents.insert(path, bytes);
    }

    let probe_one = SourceProbe::default();
    let probe_two = SourceProbe::default();
    let (handle_one, handle_two) = (probe_one.clone(), probe_two.clone());
    let (contents_one, contents_two) = (contents.clone(), contents);

    let client = UpdateClient::with_parts(
        config,
        Arc::new(FixedResolver { manifest }),
        move |tx| {
            Ok(vec![
                ScriptedSource::build(
                    "http://cdn-one.test/files",
                    1,
                    contents_one,
                    HashMap::new(),
                    Duration::from_millis(40),
                    tx.clone(),
                    handle_one,
                ),
                ScriptedSource::build(
                    "http://cdn-two.test/files",
                    1,
                    contents_two,
                    HashMap::new(),
                    Duration::from_millis(40),
                    tx,
                    handle_two,
                ),
            ])
        },
    )
    .expect("client");

    client.start().await.expect("start");
    let status = client.wait().await;

    assert_eq!(status.state, UpdateState::Completed);
    let one = probe_one.started.load(Ordering::SeqCst);
    let two = probe_two.started.load(Ordering::SeqCst);
    assert_eq!(one + two, 4);
    assert!(one > 0 && two > 0, "both sources must carry transfers ({} / {})", one, two);
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn cancel_mid_download_installs_nothing() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&dir);
    seed_local_version(&config, 1);

    let mut manifest = Manifest::new(2);
    let mut contents = HashMap::new();
    for i in 0..4 {
        let path = format!("data/file{}.bin", i);
        let bytes = format!("slow payload {}", i).into_bytes();
        let (size, hash, _) = entry_for(&bytes, 2);
        manifest = manifest.with_file(&path, size, hash, 2);
        contents.insert(path, bytes);
    }

    let probe = SourceProbe::default();
    let probe_handle = probe.clone();
    let client = UpdateClient::with_parts(
        config.clone(),
        Arc::new(FixedResolver { manifest }),
        move |tx| {
            Ok(vec![ScriptedSource::build(
                "http://cdn.test/files",
                1,
                contents,
                HashMap::new(),
                Duration::from_millis(200),
                tx,
                probe_handle,
            )])
        },
    )
    .expect("client");

    client.start().await.expect("start");
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.cancel().await.expect("cancel");
    let status = client.wait().await;

    assert_eq!(status.state, UpdateState::Cancelled);
    assert!(!status.is_running);
    assert!(
        !config.install_dir.exists()
            || fs::read_dir(&config.install_dir).expect("read dir").next().is_none(),
        "cancellation must not install anything"
    );

    // Local version untouched by a cancelled session.
    let store = UpdateStore::open(&config.state_dir).expect("reopen store");
    assert_eq!(store.installed_version, 1);
}

// =============================================================================
// Scenario D: offline replace queue and helper spawn
// =============================================================================

#[cfg(unix)]
#[tokio::test]
async fn queued_replacement_spawns_helper() {
    let dir = TempDir::new().expect("tempdir");
    let mut config = test_config(&dir);
    // Anything spawnable stands in for the helper here; the contract under
    // test is queue persistence plus detached spawn.
    config.helper_path = Some(PathBuf::from("/bin/sh"));

    let client = UpdateClient::with_parts(
        config,
        Arc::new(FailingResolver),
        move |tx| {
            let probe = SourceProbe::default();
            Ok(vec![ScriptedSource::build(
                "http://cdn.test/files",
                1,
                HashMap::new(),
                HashMap::new(),
                Duration::from_millis(5),
                tx,
                probe,
            )])
        },
    )
    .expect("client");

    let replacer = client.offline_replacer();
    assert!(!client.try_execute_offline_replacer(), "empty queue is a no-op");

    let temp = dir.path().join("app.new");
    fs::write(&temp, b"new binary").expect("write temp");
    replacer
        .queue_replacement(&temp, dir.path().join("install/app"))
        .expect("queue");

    assert!(client.try_execute_offline_replacer(), "helper must spawn");
    // The queue stays intact until the helper itself confirms the copies.
    assert_eq!(replacer.pending().expect("pending").len(), 1);
}
