//! Node identity and storage configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Node identity and storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Data directory for the store, queue, frontier and inverted index
    pub data_dir: PathBuf,
    /// Identifier stamped on every page this node fetches
    pub worker_id: String,
}

impl NodeConfig {
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store.sled")
    }

    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join("index")
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: directories::ProjectDirs::from("", "", "crawlrank")
                .map(|d| d.data_dir().to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".crawlrank")),
            worker_id: format!("worker-{}", std::process::id()),
        }
    }
}
