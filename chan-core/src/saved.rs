use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// A post the user made, used to count quotes in watched threads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SavedReply {
    pub board: String,
    pub no: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct SavedData {
    // board -> post numbers
    saved: HashMap<String, HashSet<u64>>,
}

impl SavedData {
    fn from_replies(replies: impl IntoIterator<Item = SavedReply>) -> Self {
        let mut data = Self::default();
        for reply in replies {
            data.saved.entry(reply.board).or_default().insert(reply.no);
        }
        data
    }
}

/// Lookup of saved replies, readable from any task while being rebuilt.
#[derive(Debug, Clone)]
pub struct SavedReplyStore {
    inner: Arc<RwLock<SavedData>>,
    path: Option<PathBuf>,
}

impl SavedReplyStore {
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(RwLock::new(SavedData::default())),
            path: None,
        }
    }

    pub async fn load_from(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let data = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<SavedData>(&bytes).unwrap_or_else(|e| {
                warn!(error = %e, path = %path.display(), "corrupt saved replies, starting empty");
                SavedData::default()
            }),
            Err(_) => SavedData::default(),
        };
        Self {
            inner: Arc::new(RwLock::new(data)),
            path: Some(path),
        }
    }

    pub async fn is_saved(&self, board: &str, no: u64) -> bool {
        let inner = self.inner.read().await;
        inner
            .saved
            .get(board)
            .map(|set| set.contains(&no))
            .unwrap_or(false)
    }

    /// Post numbers saved for one board.
    pub async fn saved_for_board(&self, board: &str) -> HashSet<u64> {
        let inner = self.inner.read().await;
        inner.saved.get(board).cloned().unwrap_or_default()
    }

    pub async fn save(&self, reply: SavedReply) {
        let mut inner = self.inner.write().await;
        if inner.saved.entry(reply.board).or_default().insert(reply.no) {
            drop(inner);
            self.persist().await;
        } else {
            debug!("reply already saved");
        }
    }

    /// Swaps the whole lookup for a freshly loaded set.
    pub async fn replace_all(&self, replies: Vec<SavedReply>) {
        let data = SavedData::from_replies(replies);
        *self.inner.write().await = data;
        self.persist().await;
    }

    async fn persist(&self) {
        let Some(path) = &self.path else {
            debug!("saved reply store is in-memory only; skipping persist");
            return;
        };
        let bytes = {
            let inner = self.inner.read().await;
            match serde_json::to_vec_pretty(&*inner) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "failed to serialize saved replies");
                    return;
                }
            }
        };
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Err(e) = tokio::fs::write(path, bytes).await {
            warn!(error = %e, path = %path.display(), "failed to persist saved replies");
        }
    }
}
