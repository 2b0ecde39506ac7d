//! Checkpoint file management for the engine.
//!
//! Each non-terminal node produces one uniquely named checkpoint file in
//! the configured directory. A failed write never aborts the run; the
//! engine logs it and continues.

use std::path::{Path, PathBuf};

use waypoint_types::{Checkpoint, Result};

/// File name for the checkpoint taken after the `seq`-th executed node.
/// Zero-padding keeps lexicographic and chronological order aligned.
pub fn checkpoint_file_name(seq: usize, node_id: &str) -> String {
    format!("checkpoint-{seq:05}-{node_id}.json")
}

/// Write `checkpoint` into `dir` under a unique name, creating the
/// directory if needed. Returns the written path.
pub fn save_checkpoint(checkpoint: &Checkpoint, dir: &Path, seq: usize) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(checkpoint_file_name(seq, &checkpoint.current_node));
    checkpoint.save(&path)?;
    tracing::debug!(path = %path.display(), "checkpoint saved");
    Ok(path)
}

/// Locate the most recent checkpoint file in `dir`, if any.
pub fn latest_checkpoint(dir: &Path) -> Result<Option<PathBuf>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut newest: Option<PathBuf> = None;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with("checkpoint-") || !name.ends_with(".json") {
            continue;
        }
        let newer = newest
            .as_ref()
            .and_then(|p| p.file_name().and_then(|n| n.to_str()))
            .map_or(true, |current| name > current);
        if newer {
            newest = Some(path);
        }
    }
    Ok(newest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample(node: &str) -> Checkpoint {
        Checkpoint {
            timestamp: chrono::Utc::now(),
            current_node: node.into(),
            completed_nodes: vec!["start".into(), node.into()],
            node_retries: HashMap::new(),
            context_values: HashMap::new(),
            logs: Vec::new(),
        }
    }

    #[test]
    fn file_names_are_unique_and_ordered() {
        let a = checkpoint_file_name(1, "work");
        let b = checkpoint_file_name(2, "work");
        let c = checkpoint_file_name(10, "other");
        assert_ne!(a, b);
        assert!(a < b && b < c);
    }

    #[test]
    fn save_creates_directory_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested");

        let path = save_checkpoint(&sample("work"), &target, 3).unwrap();
        assert!(path.exists());
        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.current_node, "work");
    }

    #[test]
    fn latest_picks_highest_sequence() {
        let dir = tempfile::tempdir().unwrap();
        save_checkpoint(&sample("a"), dir.path(), 1).unwrap();
        save_checkpoint(&sample("b"), dir.path(), 2).unwrap();
        let latest = latest_checkpoint(dir.path()).unwrap().unwrap();
        let loaded = Checkpoint::load(&latest).unwrap();
        assert_eq!(loaded.current_node, "b");
    }

    #[test]
    fn latest_on_missing_dir_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent");
        assert!(latest_checkpoint(&missing).unwrap().is_none());
    }
}
