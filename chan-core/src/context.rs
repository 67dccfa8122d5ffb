use std::path::Path;
use std::sync::Arc;

use reqwest::Client;
use tracing::info;
use url::Url;

use crate::cache::FileCache;
use crate::config::AppConfig;
use crate::error::{ContextError, LoaderError};
use crate::fetch::{HttpThreadFetcher, ThreadFetcher};
use crate::loader::LoaderConfig;
use crate::pool::LoaderPool;
use crate::saved::SavedReplyStore;
use crate::store::ChanStore;
use crate::watcher::WatchManager;

/// Every long-lived service of the application, wired together once.
#[derive(Clone)]
pub struct ChanContext {
    pub config: AppConfig,
    pub client: Client,
    pub store: ChanStore,
    pub saved: SavedReplyStore,
    pub pool: LoaderPool,
    pub cache: FileCache,
    pub watcher: WatchManager,
}

impl ChanContext {
    /// Builds the services against the real JSON API. Stores are kept in
    /// `data_dir`.
    pub async fn build(config: AppConfig, data_dir: &Path) -> Result<Self, ContextError> {
        let client = Client::builder()
            .user_agent(&config.site.user_agent)
            .timeout(config.site.request_timeout())
            .build()?;
        let fetcher = HttpThreadFetcher::new(client.clone(), &config.site.api_base_url)?;
        Self::with_fetcher(config, data_dir, client, Arc::new(fetcher)).await
    }

    /// Same as [`ChanContext::build`] with a caller supplied thread source.
    pub async fn with_fetcher(
        config: AppConfig,
        data_dir: &Path,
        client: Client,
        fetcher: Arc<dyn ThreadFetcher>,
    ) -> Result<Self, ContextError> {
        let store = ChanStore::load_from_dir(data_dir).await;
        let saved = SavedReplyStore::load_from(data_dir.join("saved_replies.json")).await;
        let pool = LoaderPool::new(fetcher, LoaderConfig::from(&config.watch));
        let cache = FileCache::from_config(&config.cache, &config.site)?;
        let media_base = Url::parse(&config.site.media_base_url).map_err(LoaderError::from)?;
        let watcher = WatchManager::spawn(
            store.clone(),
            saved.clone(),
            pool.clone(),
            &config.watch,
            Some(media_base),
        )
        .await;

        info!(
            data_dir = %data_dir.display(),
            cache_dir = %cache.directory().display(),
            "context ready"
        );

        Ok(Self {
            config,
            client,
            store,
            saved,
            pool,
            cache,
            watcher,
        })
    }
}
