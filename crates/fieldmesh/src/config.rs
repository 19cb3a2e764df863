// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Boot configuration: the plugin set and the autostart list.
//!
//! A JSON document in the configuration directory, read once by the
//! daemon. Plugin settings themselves are opaque blobs owned by the
//! nodes and live in the store, not here.

use crate::error::{ErrorCode, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default file name inside the `--config` directory.
pub const BOOT_FILE: &str = "fieldmesh.json";

/// Top-level boot document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootConfig {
    /// Plugin modules to register; empty means all built-ins.
    #[serde(default)]
    pub plugins: Vec<String>,

    /// Nodes to start after the store has been restored.
    #[serde(default)]
    pub autostart: Vec<String>,
}

impl Default for BootConfig {
    fn default() -> Self {
        BootConfig {
            plugins: Vec::new(),
            autostart: Vec::new(),
        }
    }
}

impl BootConfig {
    /// Load the boot document; a missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<BootConfig> {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(text) => {
                serde_json::from_str(&text).map_err(|e| {
                    tracing::error!(
                        "boot config {}: parse failed: {}",
                        path.as_ref().display(),
                        e
                    );
                    ErrorCode::GroupParameterInvalid
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BootConfig::default()),
            Err(e) => {
                tracing::error!("boot config {}: {}", path.as_ref().display(), e);
                Err(ErrorCode::EInternal)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = BootConfig::load(dir.path().join(BOOT_FILE)).unwrap();
        assert!(cfg.plugins.is_empty());
        assert!(cfg.autostart.is_empty());
    }

    #[test]
    fn test_load_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(BOOT_FILE);
        std::fs::write(
            &path,
            r#"{"plugins": ["sim", "sink"], "autostart": ["d1"]}"#,
        )
        .unwrap();
        let cfg = BootConfig::load(&path).unwrap();
        assert_eq!(cfg.plugins, vec!["sim", "sink"]);
        assert_eq!(cfg.autostart, vec!["d1"]);
    }

    #[test]
    fn test_malformed_document_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(BOOT_FILE);
        std::fs::write(&path, "{not json").unwrap();
        assert!(BootConfig::load(&path).is_err());
    }
}
