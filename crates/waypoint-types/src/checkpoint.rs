//! Checkpoint: a serializable snapshot of execution state.
//!
//! One JSON object per file. The engine writes a checkpoint after each
//! non-terminal node; loading one is sufficient to resume after the most
//! recently completed node.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Snapshot of pipeline execution state.
///
/// Field names are the wire format and must not change: `timestamp`,
/// `current_node`, `completed_nodes`, `node_retries`, `context_values`,
/// `logs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub current_node: String,
    pub completed_nodes: Vec<String>,
    pub node_retries: HashMap<String, usize>,
    pub context_values: HashMap<String, serde_json::Value>,
    pub logs: Vec<String>,
}

impl Checkpoint {
    /// Serialize this checkpoint to pretty JSON and write it to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Read a checkpoint from a JSON file at `path`. Corrupt JSON is a
    /// load error.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}
