//! # StoreRouter
//!
//! Locates and opens the [`VersionedStore`] for a `(project_id,
//! data_source_id)` key, caches open handles for the process lifetime, and
//! owns store-file lifecycle (create, close, delete, backup). The cache is
//! the sole authority for file-handle lifetime: no two concurrent openers
//! ever receive different handles for the same key.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, info};

use dataforge_core::{DataForgeError, Result};

use crate::versioned::VersionedStore;

type Key = (String, String);

pub struct StoreRouter {
    root: PathBuf,
    handles: Mutex<HashMap<Key, Arc<VersionedStore>>>,
}

impl StoreRouter {
    pub fn new(root: &Path) -> Self {
        StoreRouter {
            root: root.to_path_buf(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// The data-root directory this router serves.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Canonical store path for a key:
    /// `<root>/data_sources/<project_id>/<ds_id>.store`.
    pub fn store_path(&self, project_id: &str, ds_id: &str) -> PathBuf {
        self.root
            .join("data_sources")
            .join(project_id)
            .join(format!("{}.store", ds_id))
    }

    /// Open (lazily creating) the store for a key. Subsequent calls return
    /// the cached handle.
    pub fn open(&self, project_id: &str, ds_id: &str) -> Result<Arc<VersionedStore>> {
        let key = (project_id.to_string(), ds_id.to_string());
        let mut handles = self.lock()?;
        if let Some(handle) = handles.get(&key) {
            return Ok(handle.clone());
        }
        let path = self.store_path(project_id, ds_id);
        debug!(project_id, data_source_id = ds_id, path = %path.display(), "opening versioned store");
        let store = Arc::new(VersionedStore::open(&path)?);
        handles.insert(key, store.clone());
        Ok(store)
    }

    /// Close and evict a handle. Idempotent.
    pub fn close(&self, project_id: &str, ds_id: &str) -> Result<()> {
        let key = (project_id.to_string(), ds_id.to_string());
        if let Some(store) = self.lock()?.remove(&key) {
            store.flush()?;
        }
        Ok(())
    }

    /// Flush and evict every open handle (shutdown path).
    pub fn close_all(&self) -> Result<()> {
        let mut handles = self.lock()?;
        for ((project_id, ds_id), store) in handles.drain() {
            if let Err(error) = store.flush() {
                tracing::warn!(project_id, data_source_id = ds_id, %error, "flush on close failed");
            }
        }
        Ok(())
    }

    /// Close the handle and delete the store file (plus WAL side files).
    /// Missing files are fine; the deletion must leave no store behind.
    pub fn delete_store(&self, project_id: &str, ds_id: &str) -> Result<()> {
        self.close(project_id, ds_id)?;
        let path = self.store_path(project_id, ds_id);
        remove_if_exists(&path)?;
        remove_if_exists(&side_file(&path, "-wal"))?;
        remove_if_exists(&side_file(&path, "-shm"))?;
        info!(project_id, data_source_id = ds_id, "deleted versioned store");
        Ok(())
    }

    /// Byte-exact copy of a source's store into
    /// `<root>/backups/<timestamp>-<dsId>.store`. The WAL is flushed first
    /// so the copy is self-contained.
    pub fn backup(&self, project_id: &str, ds_id: &str) -> Result<PathBuf> {
        let store = self.open(project_id, ds_id)?;
        store.flush()?;
        let backups = self.root.join("backups");
        std::fs::create_dir_all(&backups)?;
        let target = backups.join(format!("{}-{}.store", Utc::now().timestamp(), ds_id));
        std::fs::copy(store.path(), &target)?;
        info!(project_id, data_source_id = ds_id, backup = %target.display(), "backed up store");
        Ok(target)
    }

    /// `.store` files under `data_sources/` not present in `known`:
    /// leftovers from failed deletions, reported by the facade sweep.
    pub fn orphan_stores(&self, known: &[(String, String)]) -> Result<Vec<PathBuf>> {
        let known: std::collections::HashSet<PathBuf> = known
            .iter()
            .map(|(project_id, ds_id)| self.store_path(project_id, ds_id))
            .collect();
        let mut orphans = Vec::new();
        let base = self.root.join("data_sources");
        if !base.exists() {
            return Ok(orphans);
        }
        for project_entry in std::fs::read_dir(&base)? {
            let project_dir = project_entry?.path();
            if !project_dir.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(&project_dir)? {
                let path = entry?.path();
                if path.extension().is_some_and(|e| e == "store") && !known.contains(&path) {
                    orphans.push(path);
                }
            }
        }
        orphans.sort();
        Ok(orphans)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Key, Arc<VersionedStore>>>> {
        self.handles.lock().map_err(|_| DataForgeError::DatabaseError {
            message: "store router mutex poisoned".to_string(),
        })
    }
}

fn side_file(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
