//! Flat-document JSON store with advisory per-document locking.
//!
//! Each named document lives at `<data_dir>/<name>.json`. Readers get a plain
//! snapshot; writers go through [`DocumentStore::update`], which serializes the
//! read-modify-write cycle per document and lands the result with an atomic
//! temp-file rename, so two racing webhook deliveries cannot lose an update.

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

const DOC_SUFFIX: &str = ".json";
const TEMP_FILE_SUFFIX: &str = ".tmp";

pub struct DocumentStore {
    dir: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl DocumentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: DashMap::new(),
        }
    }

    fn doc_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}{}", name, DOC_SUFFIX))
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Snapshot of a document. Absent or corrupt documents load as the default
    /// (empty) collection rather than erroring.
    pub fn load<T>(&self, name: &str) -> T
    where
        T: DeserializeOwned + Default,
    {
        let path = self.doc_path(name);
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(_) => return T::default(),
        };
        match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                warn!("document '{}' is corrupt, treating as empty: {:?}", name, e);
                T::default()
            }
        }
    }

    fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serialize document '{}'", name))?;
        write_atomic(&self.doc_path(name), &bytes)
    }

    /// Read-modify-write under the document's advisory lock.
    pub async fn update<T, F, R>(&self, name: &str, f: F) -> Result<R>
    where
        T: DeserializeOwned + Serialize + Default,
        F: FnOnce(&mut T) -> R,
    {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        let mut doc: T = self.load(name);
        let out = f(&mut doc);
        self.save(name, &doc)?;
        Ok(out)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = PathBuf::from(format!("{}{}", path.display(), TEMP_FILE_SUFFIX));
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashMap};

    fn store() -> (tempfile::TempDir, Arc<DocumentStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DocumentStore::new(dir.path()));
        (dir, store)
    }

    #[tokio::test]
    async fn absent_document_loads_empty() {
        let (_dir, store) = store();
        let users: BTreeSet<u64> = store.load("bot_users");
        assert!(users.is_empty());
    }

    #[tokio::test]
    async fn corrupt_document_loads_empty() {
        let (dir, store) = store();
        std::fs::write(dir.path().join("bot_users.json"), b"{,not json").unwrap();
        let users: BTreeSet<u64> = store.load("bot_users");
        assert!(users.is_empty());
    }

    #[tokio::test]
    async fn update_persists() {
        let (_dir, store) = store();
        store
            .update::<BTreeSet<u64>, _, _>("bot_users", |s| {
                s.insert(7);
            })
            .await
            .unwrap();
        let users: BTreeSet<u64> = store.load("bot_users");
        assert!(users.contains(&7));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_updates_do_not_lose_increments() {
        let (_dir, store) = store();
        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update::<HashMap<String, u32>, _, _>("user_add_counts", |counts| {
                        *counts.entry("1".to_string()).or_insert(0) += 1;
                    })
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let counts: HashMap<String, u32> = store.load("user_add_counts");
        assert_eq!(counts.get("1"), Some(&50));
    }
}
