//! # Configuration Management
//!
//! Paths and knobs for opening a property store. Defaults match the standard
//! deployment layout; tests and embedders override the directory.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::consts::INDEX_FILE_NAME;

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding one area file per context plus `properties_serial`.
    pub dir: PathBuf,
    /// Binary routing index. When the file exists the router runs in indexed
    /// mode; otherwise it falls back to `text_indexes`.
    pub binary_index: PathBuf,
    /// Text routing configuration files, tried in order. Missing files are
    /// skipped as long as at least one loads.
    pub text_indexes: Vec<PathBuf>,
    /// UNIX stream socket of the setter daemon.
    pub socket_path: PathBuf,
    /// Cap on the v1 wire protocol's wait for the daemon to close the
    /// connection, in milliseconds.
    pub service_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::for_dir("/dev/__properties__")
    }
}

impl StoreConfig {
    /// Configuration rooted at `dir`, with the binary index at its
    /// well-known path inside the directory.
    pub fn for_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let binary_index = dir.join(INDEX_FILE_NAME);
        Self {
            dir,
            binary_index,
            text_indexes: vec![PathBuf::from("/etc/property_contexts")],
            socket_path: PathBuf::from("/dev/socket/property_service"),
            service_timeout_ms: 250,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_dir_derives_index_path() {
        let cfg = StoreConfig::for_dir("/tmp/props");
        assert_eq!(cfg.binary_index, PathBuf::from("/tmp/props/property_info"));
        assert_eq!(cfg.service_timeout_ms, 250);
    }
}
