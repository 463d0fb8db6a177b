// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Content hashing for manifest verification.
//!
//! All hashes in manifests and the local file cache are lowercase hex
//! SHA-256 digests.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// Read buffer size for file hashing.
const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Hash a byte slice to a lowercase hex SHA-256 digest.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Hash a file's contents to a lowercase hex SHA-256 digest.
///
/// Streams the file in chunks so large patch files never sit in memory
/// whole.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {:?}", path))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];

    loop {
        let read = file
            .read(&mut buf)
            .with_context(|| format!("Failed to read file for hashing: {:?}", path))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}
