// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP download source.
//!
//! Fetches files from `{root}/{owning_version}/{relative_path}` and
//! streams the response body straight into the task's temp file. The
//! session cancel flag is checked between chunks, so an abort never waits
//! for the full body.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use super::{DownloadRequest, DownloadSource, SourceDescriptor, TransferError, TransferOutcome, WorkerPool};

/// Timeout for establishing a connection (in seconds).
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Timeout for each read from the response body (in seconds).
const READ_TIMEOUT_SECS: u64 = 30;

/// HTTP(S) download source with a bounded worker pool.
pub struct HttpSource {
    descriptor: SourceDescriptor,
    pool: Arc<WorkerPool>,
    client: reqwest::Client,
    completion_tx: mpsc::Sender<TransferOutcome>,
}

impl HttpSource {
    /// Create a source for `descriptor`, posting completions to
    /// `completion_tx`.
    pub fn new(
        descriptor: SourceDescriptor,
        completion_tx: mpsc::Sender<TransferOutcome>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .read_timeout(Duration::from_secs(READ_TIMEOUT_SECS))
            .build()
            .with_context(|| "Failed to build HTTP client for download source")?;

        let pool = Arc::new(WorkerPool::new(descriptor.workers));
        Ok(Self {
            descriptor,
            pool,
            client,
            completion_tx,
        })
    }

    /// Remote URL for a request: `{root}/{version}/{path}`.
    fn url_for(&self, request: &DownloadRequest) -> String {
        format!(
            "{}/{}/{}",
            self.descriptor.root.trim_end_matches('/'),
            request.version,
            request.remote_path
        )
    }
}

impl DownloadSource for HttpSource {
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

        let url = self.url_for(&request);
        let client = self.client.clone();
        let pool = Arc::clone(&self.pool);
        let completion_tx = self.completion_tx.clone();

        tracing::debug!(
            worker = worker.id,
            url = %url,
            "starting transfer"
        );

        tokio::spawn(async move {
            let result = transfer(&client, &url, &request).await;
            pool.release(worker);

            let outcome = TransferOutcome {
                remote_path: request.remote_path,
                temp_path: request.temp_path,
                result,
            };
            if completion_tx.send(outcome).await.is_err() {
                tracing::debug!("coordinator gone, dropping transfer outcome");
            }
        });

        true
    }
}

/// Run one transfer to completion, writing the body to the temp file.
async fn transfer(
    client: &reqwest::Client,
    url: &str,
    request: &DownloadRequest,
) -> Result<(), TransferError> {
    if request.cancel.load(Ordering::Relaxed) {
        return Err(TransferError::Cancelled);
    }

    let response = client
        .get(url)
        .send()
        .await
        .map_err(classify_request_error)?;

    let status = response.status();
    if !status.is_success() {
        return Err(TransferError::Status(status.as_u16()));
    }

    if let Some(parent) = request.temp_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| TransferError::Io(e.to_string()))?;
    }
    let mut file = tokio::fs::File::create(&request.temp_path)
        .await
        .map_err(|e| TransferError::Io(e.to_string()))?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        if request.cancel.load(Ordering::Relaxed) {
            return Err(TransferError::Cancelled);
        }
        let chunk = chunk.map_err(classify_request_error)?;
        file.write_all(&chunk)
            .await
            .map_err(|e| TransferError::Io(e.to_string()))?;
    }

    file.flush()
        .await
        .map_err(|e| TransferError::Io(e.to_string()))?;
    file.sync_all()
        .await
        .map_err(|e| TransferError::Io(e.to_string()))?;

    Ok(())
}

/// Map a reqwest error onto the transfer taxonomy.
fn classify_request_error(error: reqwest::Error) -> TransferError {
    if error.is_timeout() {
        TransferError::Timeout(error.to_string())
    } else if error.is_connect() {
        TransferError::Connect(error.to_string())
    } else {
        TransferError::Io(error.to_string())
    }
}
