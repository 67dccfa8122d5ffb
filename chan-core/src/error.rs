use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("server responded with status {0}")]
    Status(u16),
    #[error("thread parsing error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid api url: {0}")]
    Url(#[from] url::ParseError),
    #[error("thread contained no posts")]
    EmptyThread,
}

impl LoaderError {
    /// The thread was pruned or never existed.
    pub fn is_not_found(&self) -> bool {
        matches!(self, LoaderError::Status(404))
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("server responded with status {0}")]
    Status(u16),
    #[error("content length unavailable for {0}")]
    Unavailable(String),
    #[error("stream of {length} bytes exceeds the {limit} byte limit")]
    TooLarge { length: u64, limit: u64 },
    #[error("tried to read uncached data at {position} (+{length})")]
    RangeNotCached { position: u64, length: u64 },
    #[error("stream source opened with a different url")]
    UriMismatch,
}

impl CacheError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::Status(404))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration directory available on this platform")]
    NoConfigDir,
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure while wiring a [`crate::context::ChanContext`].
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
    #[error(transparent)]
    Loader(#[from] LoaderError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}
