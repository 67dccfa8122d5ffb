pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod fetch;
pub mod loader;
pub mod model;
pub mod pool;
pub mod saved;
pub mod store;
pub mod watcher;

pub use cache::{DownloadCallback, DownloadHandle, FileCache, StreamingSource};
pub use config::AppConfig;
pub use context::ChanContext;
pub use error::{CacheError, ConfigError, ContextError, LoaderError};
pub use fetch::{FetchResponse, HttpThreadFetcher, ThreadFetcher};
pub use loader::{ListenerId, LoaderConfig, LoaderListener, LoaderStatus, ThreadLoader, WATCH_TIMEOUTS};
pub use model::{ChanThread, Loadable, LoadableMode, Pin, PinId, Post};
pub use pool::LoaderPool;
pub use saved::{SavedReply, SavedReplyStore};
pub use store::ChanStore;
pub use watcher::{WatchEvent, WatchManager};
