// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session-level error taxonomy.
//!
//! Per-transfer failures are carried by [`crate::source::TransferError`];
//! the variants here are the ones that can end a whole update session or
//! surface from the resolver and persistence layers.

use crate::manifest::Version;

/// Errors that abort or refuse an update session.
#[derive(Debug, Clone)]
pub enum UpdateError {
    /// No master-server endpoint produced a usable manifest after all
    /// retry rounds.
    Resolver(String),
    /// An endpoint answered with a manifest older than the locally
    /// installed version.
    StaleManifest { remote: Version, local: Version },
}

impl std::fmt::Display for UpdateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resolver(msg) => write!(f, "version resolution failed: {}", msg),
            Self::StaleManifest { remote, local } => write!(
                f,
                "manifest version {} is older than installed version {}",
                remote, local
            ),
        }
    }
}

impl std::error::Error for UpdateError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = UpdateError::StaleManifest { remote: 3, local: 5 };
        assert_eq!(
            err.to_string(),
            "manifest version 3 is older than installed version 5"
        );
        assert!(UpdateError::Resolver("all endpoints down".into())
            .to_string()
            .contains("all endpoints down"));
    }
}
