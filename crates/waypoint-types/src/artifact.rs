//! Artifact store: named binary blobs produced by handlers.
//!
//! Blobs at or below the threshold live in memory; larger ones are written
//! under `<base_dir>/artifacts/`. The map is guarded by a single lock;
//! file-backed writes happen under the lock, reads copy the path out and
//! do their I/O without it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::{Result, WaypointError};

/// Blobs larger than this are spilled to disk.
const FILE_BACKED_THRESHOLD: usize = 100 * 1024;

/// Metadata about a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub name: String,
    pub size_bytes: usize,
    pub file_backed: bool,
}

#[derive(Debug)]
enum Stored {
    InMemory(Vec<u8>),
    FileBacked(PathBuf),
}

/// Thread-safe store for named pipeline artifacts.
#[derive(Debug)]
pub struct ArtifactStore {
    entries: RwLock<HashMap<String, (ArtifactRef, Stored)>>,
    base_dir: PathBuf,
}

impl ArtifactStore {
    /// Create a store rooted at `base_dir`. The directory itself is only
    /// created once a blob actually spills to disk.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            base_dir: base_dir.into(),
        }
    }

    /// Store a blob under `name`, replacing any previous artifact with the
    /// same name.
    pub fn put(&self, name: impl Into<String>, data: &[u8]) -> Result<ArtifactRef> {
        let name = name.into();
        let size = data.len();
        let file_backed = size > FILE_BACKED_THRESHOLD;

        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        // Drop any stale file before the name is reused.
        if let Some((_, Stored::FileBacked(old))) = entries.get(&name) {
            let _ = std::fs::remove_file(old);
        }

        let stored = if file_backed {
            let dir = self.base_dir.join("artifacts");
            std::fs::create_dir_all(&dir)?;
            let path = dir.join(sanitize_file_name(&name));
            std::fs::write(&path, data)?;
            Stored::FileBacked(path)
        } else {
            Stored::InMemory(data.to_vec())
        };

        let info = ArtifactRef {
            name: name.clone(),
            size_bytes: size,
            file_backed,
        };
        entries.insert(name, (info.clone(), stored));
        Ok(info)
    }

    /// Retrieve a blob by name.
    pub fn get(&self, name: &str) -> Result<Vec<u8>> {
        let path = {
            let entries = self
                .entries
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match entries.get(name) {
                Some((_, Stored::InMemory(bytes))) => return Ok(bytes.clone()),
                Some((_, Stored::FileBacked(path))) => path.clone(),
                None => {
                    return Err(WaypointError::Other(format!(
                        "artifact not found: {name}"
                    )))
                }
            }
        };
        // File read happens outside the lock.
        Ok(std::fs::read(path)?)
    }

    /// Whether an artifact with this name exists.
    pub fn has(&self, name: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(name)
    }

    /// Metadata for every stored artifact.
    pub fn list(&self) -> Vec<ArtifactRef> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .map(|(info, _)| info.clone())
            .collect()
    }

    /// The directory large artifacts are written under.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

/// Replace path separators so artifact names like `node.stdout` stay flat.
fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_artifact_stays_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());

        let info = store.put("note", b"small payload").unwrap();
        assert!(!info.file_backed);
        assert_eq!(info.size_bytes, 13);
        assert_eq!(store.get("note").unwrap(), b"small payload");
        // Nothing was written to disk.
        assert!(!dir.path().join("artifacts").exists());
    }

    #[test]
    fn large_artifact_is_file_backed() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());

        let big = vec![b'x'; FILE_BACKED_THRESHOLD + 1];
        let info = store.put("big.output", &big).unwrap();
        assert!(info.file_backed);
        assert_eq!(store.get("big.output").unwrap(), big);
        assert!(dir.path().join("artifacts").join("big.output").exists());
    }

    #[test]
    fn overwrite_replaces_previous_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());

        store.put("a", b"one").unwrap();
        store.put("a", b"two").unwrap();
        assert_eq!(store.get("a").unwrap(), b"two");
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn missing_artifact_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let err = store.get("nope").unwrap_err();
        assert!(err.to_string().contains("nope"));
        assert!(!store.has("nope"));
    }

    #[test]
    fn list_reports_all_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.put("one", b"1").unwrap();
        store.put("two", b"2").unwrap();

        let mut names: Vec<_> = store.list().into_iter().map(|i| i.name).collect();
        names.sort();
        assert_eq!(names, vec!["one", "two"]);
    }
}
