// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Live version resolution.
//!
//! Queries the configured master-server endpoints for the currently
//! published manifest. Endpoints are tried in order within a round; on a
//! failed round the resolver backs off exponentially before the next one.
//! A manifest older than the locally installed version is rejected; the
//! installed version never moves backwards.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use crate::error::UpdateError;
use crate::manifest::{Manifest, Version};

/// Timeout for one manifest request (in seconds).
const RESOLVE_TIMEOUT_SECS: u64 = 10;

/// Maximum retry rounds across all endpoints.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (milliseconds).
const RETRY_BASE_DELAY_MS: u64 = 500;

/// Maximum delay for exponential backoff (milliseconds).
const RETRY_MAX_DELAY_MS: u64 = 10_000;

/// Manifest file path relative to an endpoint root.
const MANIFEST_PATH: &str = "manifest.json";

/// Resolves the currently published version and manifest.
#[async_trait]
pub trait ManifestResolver: Send + Sync {
    /// Query for the live manifest. Implementations must never return a
    /// manifest with a version below `local_version`.
    async fn resolve(&self, local_version: Version) -> Result<Manifest, UpdateError>;
}

/// HTTP resolver querying one or more master-server endpoints.
pub struct HttpResolver {
    endpoints: Vec<String>,
    client: reqwest::Client,
}

impl HttpResolver {
    /// Create a resolver over `endpoints` (base URLs; the manifest is
    /// fetched from `{endpoint}/manifest.json`).
    pub fn new(endpoints: Vec<String>) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(RESOLVE_TIMEOUT_SECS))
            .build()
            .map_err(|e| UpdateError::Resolver(e.to_string()))?;
        Ok(Self { endpoints, client })
    }

    async fn fetch(&self, endpoint: &str) -> Result<Manifest, String> {
        let url = format!("{}/{}", endpoint.trim_end_matches('/'), MANIFEST_PATH);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("{}: {}", url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("{}: HTTP {}", url, status.as_u16()));
        }

        response
            .json::<Manifest>()
            .await
            .map_err(|e| format!("{}: invalid manifest: {}", url, e))
    }
}

#[async_trait]
impl ManifestResolver for HttpResolver {
    async fn resolve(&self, local_version: Version) -> Result<Manifest, UpdateError> {
        let mut last_error = String::from("no endpoints configured");

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = backoff_delay(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying version resolution after backoff"
                );
                sleep(delay).await;
            }

            for endpoint in &self.endpoints {
                match self.fetch(endpoint).await {
                    Ok(manifest) if manifest.version < local_version => {
                        let err = UpdateError::StaleManifest {
                            remote: manifest.version,
                            local: local_version,
                        };
                        tracing::warn!(endpoint = %endpoint, %err, "rejecting stale manifest");
                        last_error = err.to_string();
                    }
                    Ok(manifest) => {
                        tracing::info!(
                            endpoint = %endpoint,
                            version = manifest.version,
                            files = manifest.len(),
                            "resolved live manifest"
                        );
                        return Ok(manifest);
                    }
                    Err(e) => {
                        tracing::warn!(endpoint = %endpoint, error = %e, "manifest fetch failed");
                        last_error = e;
                    }
                }
            }
        }

        Err(UpdateError::Resolver(format!(
            "all endpoints failed after {} attempts, last error: {}",
            MAX_RETRIES, last_error
        )))
    }
}

/// Exponential backoff delay for a retry round, capped.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = RETRY_BASE_DELAY_MS.saturating_mul(1u64 << attempt.min(16));
    Duration::from_millis(exp.min(RETRY_MAX_DELAY_MS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(2), Duration::from_millis(2000));
        assert_eq!(backoff_delay(3), Duration::from_millis(4000));
        // Far beyond the cap
        assert_eq!(backoff_delay(10), Duration::from_millis(RETRY_MAX_DELAY_MS));
        assert_eq!(backoff_delay(63), Duration::from_millis(RETRY_MAX_DELAY_MS));
    }

    #[tokio::test]
    async fn test_resolve_fails_with_no_endpoints() {
        let resolver = HttpResolver::new(Vec::new()).expect("resolver");
        let err = resolver.resolve(0).await.expect_err("must fail");
        assert!(matches!(err, UpdateError::Resolver(_)));
    }
}
