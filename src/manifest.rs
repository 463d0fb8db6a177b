// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Release manifest types.
//!
//! A manifest describes one published release: a version number plus a map
//! of relative file paths to their expected size, content hash, and owning
//! version. Entry order is the publish order and is preserved end to end,
//! so download tasks are scheduled in the order the release was laid out.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Monotonically increasing release version.
pub type Version = u64;

/// Expected metadata for one file in a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// File size in bytes.
    pub size: u64,
    /// Lowercase hex SHA-256 of the file contents.
    pub hash: String,
    /// The version that last changed this file. Files are fetched from
    /// their owning version's directory on the download source.
    pub version: Version,
}

/// One published release: version plus per-file expectations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// The published version this manifest describes.
    pub version: Version,
    /// Relative file path -> expected metadata, in publish order.
    pub files: IndexMap<String, ManifestEntry>,
}

impl Manifest {
    /// Create an empty manifest for a version.
    pub fn new(version: Version) -> Self {
        Self {
            version,
            files: IndexMap::new(),
        }
    }

    /// Add or replace a file entry. Returns `self` for fixture building.
    pub fn with_file(
        mut self,
        path: impl Into<String>,
        size: u64,
        hash: impl Into<String>,
        version: Version,
    ) -> Self {
        self.files.insert(
            path.into(),
            ManifestEntry {
                size,
                hash: hash.into(),
                version,
            },
        );
        self
    }

    /// Number of files in the release.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True when the release lists no files.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
