use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::fetch::ThreadFetcher;
use crate::loader::{ListenerId, LoaderConfig, LoaderListener, ThreadLoader};
use crate::model::Loadable;

/// Shares one [`ThreadLoader`] per loadable among all of its consumers.
#[derive(Clone)]
pub struct LoaderPool {
    fetcher: Arc<dyn ThreadFetcher>,
    config: LoaderConfig,
    loaders: Arc<Mutex<HashMap<Loadable, ThreadLoader>>>,
}

impl LoaderPool {
    pub fn new(fetcher: Arc<dyn ThreadFetcher>, config: LoaderConfig) -> Self {
        Self {
            fetcher,
            config,
            loaders: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the loader for `loadable`, creating it when needed, with
    /// `listener` attached.
    pub async fn obtain(
        &self,
        loadable: &Loadable,
        listener: Arc<dyn LoaderListener>,
    ) -> (ThreadLoader, ListenerId) {
        let mut loaders = self.loaders.lock().await;
        let loader = loaders
            .entry(loadable.clone())
            .or_insert_with(|| {
                debug!(board = %loadable.board, no = loadable.no, "creating loader");
                ThreadLoader::spawn(loadable.clone(), self.fetcher.clone(), self.config)
            })
            .clone();
        let id = loader.add_listener(listener);
        (loader, id)
    }

    /// Detaches a listener; the loader is stopped once nobody uses it.
    pub async fn release(&self, loader: &ThreadLoader, id: ListenerId) {
        let mut loaders = self.loaders.lock().await;
        if loader.remove_listener(id).await {
            debug!(board = %loader.loadable().board, no = loader.loadable().no, "releasing loader");
            loaders.remove(loader.loadable());
            loader.stop();
        }
    }

    pub async fn len(&self) -> usize {
        self.loaders.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
