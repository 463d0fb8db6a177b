// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Update client configuration.

use std::path::PathBuf;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::source::SourceDescriptor;

/// Default per-file download attempt budget.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Configuration for an [`crate::client::UpdateClient`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Master-server endpoints queried for the live version manifest,
    /// tried in order.
    pub endpoints: Vec<String>,
    /// Download sources files are fetched from. Duplicate descriptors
    /// (same transport and root) collapse to a single source.
    pub sources: Vec<SourceDescriptor>,
    /// Directory updated files are installed into.
    pub install_dir: PathBuf,
    /// Directory for in-flight temp files. Defaults to `<state_dir>/tmp`.
    pub temp_dir: PathBuf,
    /// Directory for persisted state (installed version, file cache,
    /// offline replace queue).
    pub state_dir: PathBuf,
    /// Total download attempts per file before it is marked permanently
    /// failed.
    pub max_retries: u32,
    /// Explicit path to the detached replace helper binary. When unset,
    /// the helper is looked up next to the current executable.
    pub helper_path: Option<PathBuf>,
    /// Host executable the helper relaunches after applying queued
    /// replacements.
    pub relaunch: Option<PathBuf>,
}

impl UpdateConfig {
    /// Build a config with defaults for everything but the install
    /// directory: state under `~/.patchrun`, temps under the state dir,
    /// and a 3-attempt per-file budget.
    pub fn new(install_dir: impl Into<PathBuf>) -> Self {
        let state_dir = Self::default_state_dir();
        Self {
            endpoints: Vec::new(),
            sources: Vec::new(),
            install_dir: install_dir.into(),
            temp_dir: state_dir.join("tmp"),
            state_dir,
            max_retries: DEFAULT_MAX_RETRIES,
            helper_path: None,
            relaunch: None,
        }
    }

    /// Default state directory, `~/.patchrun`.
    pub fn default_state_dir() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".patchrun"))
            .unwrap_or_else(|| PathBuf::from(".patchrun"))
    }

    /// Add a master-server endpoint.
    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoints.push(url.into());
        self
    }

    /// Add a download source.
    pub fn source(mut self, descriptor: SourceDescriptor) -> Self {
        self.sources.push(descriptor);
        self
    }

    /// Validate that the config can drive a session.
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            bail!("update config has no master-server endpoints");
        }
        if self.sources.is_empty() {
            bail!("update config has no download sources");
        }
        if self.max_retries == 0 {
            bail!("max_retries must be at least 1");
        }
        if let Some(desc) = self.sources.iter().find(|d| d.workers == 0) {
            bail!("download source {} has zero worker capacity", desc.root);
        }
        Ok(())
    }
}
