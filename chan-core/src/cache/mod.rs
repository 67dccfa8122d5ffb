//! Disk-backed media cache.
//!
//! Files live in one directory, named by a hash of their url. Downloads are
//! de-duplicated per url, run on a small fixed pool and can be cancelled.
//! The total size of the directory is tracked and trimmed by deleting the
//! least recently modified files.

mod downloader;
mod stream;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::{CacheConfig, SiteConfig};
use crate::error::CacheError;

pub use downloader::{DownloadCallback, DownloadHandle};
pub use stream::{ByteRange, PartialFileCache, RangeSet, RegionStats, StreamingSource, DEFAULT_MAX_STREAM_LENGTH};

/// Connect and read timeout for downloads.
pub const TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on deletions per trim pass.
pub const TRIM_TRIES: usize = 20;
/// Number of downloads allowed to run at once.
pub const DOWNLOAD_CONCURRENCY: usize = 2;

const PARTIAL_DIR: &str = ".partial";
const STREAM_SUFFIX: &str = "stream";

#[derive(Clone)]
pub struct FileCache {
    inner: Arc<CacheInner>,
}

pub(crate) struct CacheInner {
    directory: PathBuf,
    max_size: u64,
    client: Client,
    permits: Arc<Semaphore>,
    state: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    size: u64,
    downloaders: HashMap<String, DownloadHandle>,
}

impl std::fmt::Debug for FileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCache")
            .field("directory", &self.inner.directory)
            .field("max_size", &self.inner.max_size)
            .finish()
    }
}

impl FileCache {
    pub fn new(directory: impl Into<PathBuf>, max_size: u64, client: Client) -> Result<Self, CacheError> {
        let directory = directory.into();
        fs::create_dir_all(directory.join(PARTIAL_DIR))?;

        let inner = CacheInner {
            directory,
            max_size,
            client,
            permits: Arc::new(Semaphore::new(DOWNLOAD_CONCURRENCY)),
            state: Mutex::new(CacheState::default()),
        };
        {
            let mut state = inner.lock_state();
            state.size = inner.calculate_size();
        }
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn from_config(cache: &CacheConfig, site: &SiteConfig) -> Result<Self, CacheError> {
        let client = Self::build_client(&site.user_agent)?;
        Self::new(cache.resolved_directory(), cache.max_size_bytes, client)
    }

    /// HTTP/1.1 client with the download timeouts applied.
    pub fn build_client(user_agent: &str) -> Result<Client, CacheError> {
        Ok(Client::builder()
            .user_agent(user_agent)
            .connect_timeout(TIMEOUT)
            .read_timeout(TIMEOUT)
            .http1_only()
            .build()?)
    }

    /// Starts downloading `url`.
    ///
    /// A file already on disk is reported to `callback` right away and `None`
    /// is returned. A url that is already downloading gets `callback`
    /// attached to the running download. Otherwise a new download is queued.
    /// Requires a tokio runtime.
    pub fn download_file(&self, url: &str, callback: Arc<dyn DownloadCallback>) -> Option<DownloadHandle> {
        let file = self.get(url);
        let mut state = self.inner.lock_state();

        if let Some(existing) = state.downloaders.get(url) {
            existing.add_callback(callback);
            return Some(existing.clone());
        }

        if file.exists() {
            drop(state);
            touch(&file);
            callback.on_progress(0, 0, true);
            callback.on_success(&file);
            return None;
        }

        let partial = self.partial_path(url);
        let handle = DownloadHandle::new(url.to_string(), file, partial, Arc::downgrade(&self.inner));
        handle.add_callback(callback);
        state.downloaders.insert(url.to_string(), handle.clone());
        drop(state);

        tokio::spawn(downloader::run(self.inner.clone(), handle.clone()));
        Some(handle)
    }

    /// Path the file for `url` is (or will be) stored at.
    pub fn get(&self, url: &str) -> PathBuf {
        self.inner.make_dir();
        self.inner.directory.join(cache_key(url))
    }

    pub fn exists(&self, url: &str) -> bool {
        self.get(url).exists()
    }

    /// Cancels every download and deletes every cached file.
    pub fn clear_cache(&self) {
        debug!("clearing cache");
        let downloaders: Vec<DownloadHandle> = self.inner.lock_state().downloaders.values().cloned().collect();
        for downloader in downloaders {
            downloader.cancel();
        }

        let mut state = self.inner.lock_state();
        for (path, _, _) in self.inner.list_files() {
            if let Err(e) = fs::remove_file(&path) {
                debug!(error = %e, path = %path.display(), "could not delete cache file while clearing");
            }
        }
        state.size = self.inner.calculate_size();
    }

    /// Source for streaming playback of `url`.
    ///
    /// A complete file on disk is served as is. A running download for the
    /// url is cancelled and whatever it already wrote seeds the region cache.
    /// Otherwise every byte comes from range requests.
    pub fn stream(&self, url: &str) -> StreamingSource {
        let file = self.get(url);
        let client = self.inner.client.clone();
        let running = self.inner.lock_state().downloaders.get(url).cloned();

        let Some(downloader) = running else {
            if file.exists() {
                match fs::read(&file) {
                    Ok(data) => {
                        touch(&file);
                        return StreamingSource::from_cached(client, url, file, &data);
                    }
                    Err(e) => warn!(error = %e, path = %file.display(), "cannot read cached file, streaming instead"),
                }
            }
            return StreamingSource::new(client, url, file, Some(self.clone()));
        };

        let mut source = StreamingSource::new(client, url, file, Some(self.clone()));
        match fs::read(self.partial_path(url)) {
            Ok(prefix) if !prefix.is_empty() => {
                debug!(url, bytes = prefix.len(), "seeding stream from running download");
                source.fill_cache(Bytes::from(prefix));
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, url, "no partial data to seed stream"),
        }
        downloader.cancel();
        source
    }

    pub fn log_stats(&self) {
        let state = self.inner.lock_state();
        info!(size = state.size, max_size = self.inner.max_size, "cache size");
        info!(downloaders = state.downloaders.len(), "active downloaders");
        for downloader in state.downloaders.values() {
            info!(url = %downloader.url(), cancelled = downloader.is_cancelled(), "downloader");
        }
    }

    /// Tracked size of the cache directory in bytes.
    pub fn size(&self) -> u64 {
        self.inner.lock_state().size
    }

    pub fn max_size(&self) -> u64 {
        self.inner.max_size
    }

    pub fn directory(&self) -> &Path {
        &self.inner.directory
    }

    /// Number of downloads currently registered.
    pub fn in_flight(&self) -> usize {
        self.inner.lock_state().downloaders.len()
    }

    /// Rescans the directory after a file was written by another path,
    /// then trims.
    pub(crate) fn resync_size(&self) {
        self.inner.resync();
    }

    pub(crate) fn partial_path(&self, url: &str) -> PathBuf {
        self.inner.directory.join(PARTIAL_DIR).join(cache_key(url))
    }

    // Separate from `partial_path` so a stream never touches a download's file.
    pub(crate) fn stream_staging_path(&self, url: &str) -> PathBuf {
        self.partial_path(url).with_extension(STREAM_SUFFIX)
    }
}

impl CacheInner {
    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    pub(crate) fn permits(&self) -> Arc<Semaphore> {
        self.permits.clone()
    }

    /// Adds a finished file to the size count and trims.
    pub(crate) fn put(&self, file: &Path) {
        let mut state = self.lock_state();
        state.size += fs::metadata(file).map(|m| m.len()).unwrap_or(0);
        self.trim(&mut state);
    }

    pub(crate) fn resync(&self) {
        let mut state = self.lock_state();
        state.size = self.calculate_size();
        self.trim(&mut state);
    }

    pub(crate) fn remove_downloader(&self, handle: &DownloadHandle) {
        let mut state = self.lock_state();
        if state
            .downloaders
            .get(handle.url())
            .is_some_and(|registered| registered.same_as(handle))
        {
            state.downloaders.remove(handle.url());
        }
    }

    fn make_dir(&self) {
        if self.directory.exists() {
            return;
        }
        match fs::create_dir_all(self.directory.join(PARTIAL_DIR)) {
            Ok(()) => {
                let size = self.calculate_size();
                self.lock_state().size = size;
            }
            Err(e) => error!(error = %e, dir = %self.directory.display(), "unable to create file cache dir"),
        }
    }

    fn trim(&self, state: &mut CacheState) {
        let mut tries = 0;
        while state.size > self.max_size && tries < TRIM_TRIES {
            tries += 1;
            let files = self.list_files();
            if files.len() <= 1 {
                break;
            }

            let Some((oldest, _, _)) = files.iter().min_by_key(|(_, _, modified)| *modified) else {
                error!("no files to trim");
                break;
            };

            debug!(path = %oldest.display(), "deleting");
            if let Err(e) = fs::remove_file(oldest) {
                error!(error = %e, "cannot delete cache file while trimming");
                state.size = self.calculate_size();
                break;
            }
            state.size = self.calculate_size();
        }
    }

    fn calculate_size(&self) -> u64 {
        self.list_files().iter().map(|(_, len, _)| len).sum()
    }

    // Regular files directly inside the cache directory.
    fn list_files(&self) -> Vec<(PathBuf, u64, SystemTime)> {
        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, dir = %self.directory.display(), "cannot list cache dir");
                return Vec::new();
            }
        };
        entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let metadata = entry.metadata().ok()?;
                if !metadata.is_file() {
                    return None;
                }
                let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                Some((entry.path(), metadata.len(), modified))
            })
            .collect()
    }
}

/// Stable file name for a url.
pub fn cache_key(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

// Bumps the modification time so LRU trimming keeps the file.
fn touch(file: &Path) {
    let result = fs::File::options()
        .write(true)
        .open(file)
        .and_then(|f| f.set_modified(SystemTime::now()));
    if let Err(e) = result {
        debug!(error = %e, path = %file.display(), "could not set last modified time");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_cache(name: &str, max_size: u64) -> FileCache {
        let mut dir = std::env::temp_dir();
        dir.push(format!("chanwatch_cache_{name}_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        FileCache::new(dir, max_size, Client::new()).unwrap()
    }

    fn write_aged(cache: &FileCache, url: &str, len: usize, age_secs: u64) -> PathBuf {
        let path = cache.get(url);
        fs::write(&path, vec![7u8; len]).unwrap();
        let when = SystemTime::now() - Duration::from_secs(age_secs);
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(when)
            .unwrap();
        cache.inner.put(&path);
        path
    }

    fn disk_size(cache: &FileCache) -> u64 {
        cache.inner.list_files().iter().map(|(_, len, _)| len).sum()
    }

    #[test]
    fn keys_are_stable_and_distinct() {
        assert_eq!(cache_key("http://a/1.jpg"), cache_key("http://a/1.jpg"));
        assert_ne!(cache_key("http://a/1.jpg"), cache_key("http://a/2.jpg"));
        assert_eq!(cache_key("x").len(), 64);
    }

    #[test]
    fn trim_evicts_least_recently_modified() {
        let cache = temp_cache("trim", 250);
        let oldest = write_aged(&cache, "u1", 100, 300);
        let middle = write_aged(&cache, "u2", 100, 200);
        assert_eq!(cache.size(), 200);

        let newest = write_aged(&cache, "u3", 100, 100);
        assert!(!oldest.exists());
        assert!(middle.exists());
        assert!(newest.exists());
        assert_eq!(cache.size(), 200);
        assert_eq!(cache.size(), disk_size(&cache));

        let _ = fs::remove_dir_all(cache.directory());
    }

    #[test]
    fn trim_keeps_a_single_oversized_file() {
        let cache = temp_cache("single", 10);
        let only = write_aged(&cache, "big", 100, 10);
        assert!(only.exists());
        assert_eq!(cache.size(), 100);

        let _ = fs::remove_dir_all(cache.directory());
    }

    #[test]
    fn size_is_rescanned_on_open_and_clear() {
        let cache = temp_cache("rescan", 1_000);
        write_aged(&cache, "a", 30, 5);
        write_aged(&cache, "b", 40, 5);

        let reopened = FileCache::new(cache.directory().to_path_buf(), 1_000, Client::new()).unwrap();
        assert_eq!(reopened.size(), 70);

        reopened.clear_cache();
        assert_eq!(reopened.size(), 0);
        assert!(!reopened.exists("a"));

        let _ = fs::remove_dir_all(cache.directory());
    }
}
