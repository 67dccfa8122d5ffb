use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::model::{Loadable, Pin};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct LoadableFile {
    next_id: u64,
    loadables: Vec<Loadable>,
}

#[derive(Debug, Default)]
struct LoadableIndex {
    next_id: u64,
    // identity -> stored loadable with its id
    by_identity: HashMap<Loadable, Loadable>,
}

/// Persists loadables and pins as JSON in a data directory.
#[derive(Debug, Clone)]
pub struct ChanStore {
    loadables: Arc<RwLock<LoadableIndex>>,
    pins: Arc<RwLock<Vec<Pin>>>,
    loadables_path: PathBuf,
    pins_path: PathBuf,
}

impl ChanStore {
    pub async fn load_from_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        let loadables_path = dir.join("loadables.json");
        let pins_path = dir.join("pins.json");

        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            warn!(error = %e, "failed to create data dir");
        }

        let file: LoadableFile = read_json_with_tmp_fallback(&loadables_path).await;
        let mut next_id = file.next_id;
        let mut by_identity = HashMap::with_capacity(file.loadables.len());
        for loadable in file.loadables {
            if let Some(id) = loadable.id {
                next_id = next_id.max(id + 1);
            }
            if by_identity.contains_key(&loadable) {
                warn!(board = %loadable.board, no = loadable.no, "duplicate persisted loadable");
                continue;
            }
            by_identity.insert(loadable.clone(), loadable);
        }

        let pins: Vec<Pin> = read_json_with_tmp_fallback(&pins_path).await;

        Self {
            loadables: Arc::new(RwLock::new(LoadableIndex {
                next_id: next_id.max(1),
                by_identity,
            })),
            pins: Arc::new(RwLock::new(pins)),
            loadables_path,
            pins_path,
        }
    }

    /// Returns the stored loadable with the same identity, creating it first
    /// if needed. Catalog loadables are not persisted.
    pub async fn get_or_create(&self, loadable: &Loadable) -> Loadable {
        if loadable.is_catalog_mode() {
            return loadable.clone();
        }

        {
            let index = self.loadables.read().await;
            if let Some(existing) = index.by_identity.get(loadable) {
                debug!("cached loadable found");
                return existing.clone();
            }
        }

        let mut index = self.loadables.write().await;
        // Raced with another creator between the two locks.
        if let Some(existing) = index.by_identity.get(loadable) {
            return existing.clone();
        }
        let mut created = loadable.clone();
        created.id = Some(index.next_id);
        index.next_id += 1;
        debug!(board = %created.board, no = created.no, id = ?created.id, "creating loadable");
        index.by_identity.insert(created.clone(), created.clone());
        drop(index);

        self.persist_loadables().await;
        created
    }

    /// Stores title and scroll hints for an already known loadable.
    pub async fn update_loadable(&self, loadable: &Loadable) {
        let mut index = self.loadables.write().await;
        let Some(stored) = index.by_identity.get_mut(loadable) else {
            debug!("update for unknown loadable ignored");
            return;
        };
        stored.title = loadable.title.clone();
        stored.list_view_index = loadable.list_view_index;
        stored.list_view_top = loadable.list_view_top;
        drop(index);
        self.persist_loadables().await;
    }

    pub async fn list_loadables(&self) -> Vec<Loadable> {
        let index = self.loadables.read().await;
        let mut all: Vec<Loadable> = index.by_identity.values().cloned().collect();
        all.sort_by_key(|l| l.id);
        all
    }

    pub async fn load_pins(&self) -> Vec<Pin> {
        self.pins.read().await.clone()
    }

    pub async fn save_pins(&self, pins: &[Pin]) {
        *self.pins.write().await = pins.to_vec();
        let bytes = match serde_json::to_vec_pretty(pins) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to serialize pins for persistence");
                return;
            }
        };
        write_atomic(&self.pins_path, &bytes).await;
    }

    async fn persist_loadables(&self) {
        let file = {
            let index = self.loadables.read().await;
            let mut loadables: Vec<Loadable> = index.by_identity.values().cloned().collect();
            loadables.sort_by_key(|l| l.id);
            LoadableFile {
                next_id: index.next_id,
                loadables,
            }
        };
        match serde_json::to_vec_pretty(&file) {
            Ok(bytes) => write_atomic(&self.loadables_path, &bytes).await,
            Err(e) => warn!(error = %e, "failed to serialize loadables for persistence"),
        }
    }
}

// Reads JSON, falling back to the temp copy when the main file is corrupt.
// Falls back to the `.json.tmp` copy when the main file is missing or
// unreadable, which covers a crash between the temp write and the rename.
async fn read_json_with_tmp_fallback<T: DeserializeOwned + Default>(path: &Path) -> T {
    match read_json::<T>(path).await {
        Ok(Some(value)) => return value,
        Ok(None) => {}
        Err(e) => warn!(error = %e, path = %path.display(), "stored json unreadable, trying temp copy"),
    }

    let tmp = path.with_extension("json.tmp");
    match read_json::<T>(&tmp).await {
        Ok(Some(value)) => {
            info!(path = %tmp.display(), "recovered from temp copy");
            value
        }
        Ok(None) => T::default(),
        Err(e) => {
            warn!(error = %e, path = %tmp.display(), "temp copy unreadable too, starting empty");
            T::default()
        }
    }
}

// `Ok(None)` when the file does not exist.
async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, serde_json::Error> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(serde_json::Error::io(e)),
    };
    serde_json::from_slice(&bytes).map(Some)
}

async fn write_atomic(path: &Path, bytes: &[u8]) {
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    let tmp = path.with_extension("json.tmp");
    if let Err(e) = tokio::fs::write(&tmp, bytes).await {
        warn!(error = %e, path = %tmp.display(), "failed to write temp file");
        return;
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        warn!(error = %e, path = %path.display(), "failed to persist file");
    }
}
