//! Durable persistence for tool-provider state.
//!
//! One JSON file with two top-level buckets: `global` (provider name →
//! value) and `conversations` (conversation id → provider name → value).
//! Saves are atomic: serialize to a sibling temp file, fsync, rename over
//! the canonical path.  Container handles and shell processes are never
//! persisted; they are runtime-only and re-established after a restart.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

/// The two persisted buckets.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StateBuckets {
    /// Shared across conversations, keyed by provider name.
    #[serde(default)]
    pub global: BTreeMap<String, Value>,
    /// Partitioned by conversation id, then provider name.
    #[serde(default)]
    pub conversations: BTreeMap<String, BTreeMap<String, Value>>,
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("write state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Disk store for [`StateBuckets`].  All access is serialized by a single
/// mutex held across serialize+write, so `save` may be called from any
/// thread.
pub struct StateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the buckets from disk.  A missing or corrupt file is reported
    /// and treated as empty — the operator's remedy for corruption is
    /// [`StateStore::reset`].
    pub fn load(&self) -> StateBuckets {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return StateBuckets::default();
            }
            Err(err) => {
                warn!(path = %self.path.display(), %err, "cannot read state file; starting empty");
                return StateBuckets::default();
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(buckets) => buckets,
            Err(err) => {
                warn!(path = %self.path.display(), %err, "corrupt state file; starting empty");
                StateBuckets::default()
            }
        }
    }

    /// Atomically persist the buckets.  Failure is returned so the caller
    /// can log it, but the in-memory buckets stay authoritative and the
    /// next mutation re-attempts the save.
    pub fn save(&self, buckets: &StateBuckets) -> Result<(), StateError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let rendered = serde_json::to_vec_pretty(buckets)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| StateError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let tmp = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).map_err(|source| StateError::Io {
            path: tmp.clone(),
            source,
        })?;
        file.write_all(&rendered).map_err(|source| StateError::Io {
            path: tmp.clone(),
            source,
        })?;
        file.sync_all().map_err(|source| StateError::Io {
            path: tmp.clone(),
            source,
        })?;
        drop(file);

        fs::rename(&tmp, &self.path).map_err(|source| StateError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }

    /// Delete the state file and return empty buckets.
    pub fn reset(&self) -> StateBuckets {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        match fs::remove_file(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "state file removed"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), %err, "cannot remove state file"),
        }
        StateBuckets::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_in(dir: &tempfile::TempDir) -> StateStore {
        StateStore::new(dir.path().join("state.bin"))
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert_eq!(store.load(), StateBuckets::default());
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let mut buckets = StateBuckets::default();
        buckets
            .global
            .insert("shell".to_string(), json!({"total_commands": 7}));
        buckets.conversations.insert(
            "c1".to_string(),
            BTreeMap::from([(
                "shell".to_string(),
                json!({
                    "commands_run": 3,
                    "pi": 3.25,
                    "flags": [true, false],
                    "nested": {"deep": {"ok": "yes"}}
                }),
            )]),
        );

        store.save(&buckets).unwrap();
        assert_eq!(store.load(), buckets);
    }

    #[test]
    fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), b"not json at all {{{").unwrap();
        assert_eq!(store.load(), StateBuckets::default());
    }

    #[test]
    fn save_overwrites_previous_content_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let mut first = StateBuckets::default();
        first.global.insert("a".to_string(), json!(1));
        store.save(&first).unwrap();

        let mut second = StateBuckets::default();
        second.global.insert("b".to_string(), json!(2));
        store.save(&second).unwrap();

        let loaded = store.load();
        assert_eq!(loaded, second);
        // No temp file left behind after a successful rename.
        assert!(!store.path().with_extension("tmp").exists());
    }

    #[test]
    fn reset_removes_file_and_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let mut buckets = StateBuckets::default();
        buckets.global.insert("x".to_string(), json!("y"));
        store.save(&buckets).unwrap();
        assert!(store.path().exists());

        assert_eq!(store.reset(), StateBuckets::default());
        assert!(!store.path().exists());
        assert_eq!(store.load(), StateBuckets::default());
    }

    #[test]
    fn reset_when_no_file_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert_eq!(store.reset(), StateBuckets::default());
    }
}
