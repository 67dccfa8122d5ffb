use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::CacheInner;
use crate::error::CacheError;

/// Minimum number of new bytes between two progress reports.
const PROGRESS_STEP: u64 = 16 * 1024;

/// Receives the outcome of a download. Called from the download task.
pub trait DownloadCallback: Send + Sync {
    /// Without a content length `total` equals `downloaded`.
    fn on_progress(&self, downloaded: u64, total: u64, done: bool) {
        let _ = (downloaded, total, done);
    }

    fn on_success(&self, file: &Path);

    /// `not_found` is set when the server answered 404.
    fn on_fail(&self, not_found: bool);

    /// The download was cancelled through its handle after it started.
    /// Cancellation is not a failure; nothing else is reported.
    fn on_cancel(&self) {}
}

/// Shared handle to one in-flight download.
#[derive(Clone)]
pub struct DownloadHandle {
    shared: Arc<Shared>,
}

struct Shared {
    url: String,
    output: PathBuf,
    partial: PathBuf,
    callbacks: Mutex<Vec<Arc<dyn DownloadCallback>>>,
    running: AtomicBool,
    user_cancelled: AtomicBool,
    finished: AtomicBool,
    token: CancellationToken,
    cache: Weak<CacheInner>,
}

#[derive(Clone, Copy)]
enum Outcome {
    Success,
    Failed { not_found: bool },
    /// `moved` is set when the file reached its final path before the
    /// cancel was seen.
    Cancelled { moved: bool },
}

impl std::fmt::Debug for DownloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadHandle")
            .field("url", &self.shared.url)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl DownloadHandle {
    pub(crate) fn new(url: String, output: PathBuf, partial: PathBuf, cache: Weak<CacheInner>) -> Self {
        Self {
            shared: Arc::new(Shared {
                url,
                output,
                partial,
                callbacks: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                user_cancelled: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                token: CancellationToken::new(),
                cache,
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.user_cancelled.load(Ordering::SeqCst)
    }

    /// Whether cleanup already ran, successful or not.
    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::SeqCst)
    }

    /// Cancels the download. Safe to call more than once. Neither
    /// `on_success` nor `on_fail` is invoked for a cancelled download.
    pub fn cancel(&self) {
        if self.shared.user_cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.token.cancel();
        // Not picked up by a worker yet, nothing else will clean up.
        if !self.shared.running.load(Ordering::SeqCst) {
            self.finish(Outcome::Cancelled { moved: false });
        }
    }

    pub(crate) fn add_callback(&self, callback: Arc<dyn DownloadCallback>) {
        self.shared
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    pub(crate) fn same_as(&self, other: &DownloadHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn callbacks(&self) -> Vec<Arc<dyn DownloadCallback>> {
        self.shared
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn post_progress(&self, downloaded: u64, total: u64, done: bool) {
        for callback in self.callbacks() {
            callback.on_progress(downloaded, total, done);
        }
    }

    // Single exit for every download. Runs once.
    fn finish(&self, outcome: Outcome) {
        if self.shared.finished.swap(true, Ordering::SeqCst) {
            return;
        }

        let cache = self.shared.cache.upgrade();
        match outcome {
            Outcome::Success => {
                if let Some(cache) = &cache {
                    cache.put(&self.shared.output);
                }
            }
            // Kept but not reported, and a stream may have replaced it.
            Outcome::Cancelled { moved: true } => {
                if let Some(cache) = &cache {
                    cache.resync();
                }
            }
            Outcome::Failed { .. } | Outcome::Cancelled { moved: false } => self.purge(),
        }
        if let Some(cache) = &cache {
            cache.remove_downloader(self);
        }

        match outcome {
            Outcome::Success => {
                debug!(url = %self.shared.url, "download done");
                for callback in self.callbacks() {
                    callback.on_progress(0, 0, true);
                    callback.on_success(&self.shared.output);
                }
            }
            Outcome::Failed { not_found } => {
                for callback in self.callbacks() {
                    callback.on_progress(0, 0, true);
                    callback.on_fail(not_found);
                }
            }
            Outcome::Cancelled { .. } => {
                debug!(url = %self.shared.url, "download cancelled");
                // A download that never ran just leaves the registry.
                if self.shared.running.load(Ordering::SeqCst) {
                    for callback in self.callbacks() {
                        callback.on_cancel();
                    }
                }
            }
        }
    }

    // The output path is only ever written by the final rename, so the
    // partial is all there is to remove.
    fn purge(&self) {
        let path = &self.shared.partial;
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, path = %path.display(), "could not clean up download"),
        }
    }
}

/// Worker body for one download: waits for a pool slot, streams the body to
/// the partial file and moves it into place.
pub(crate) async fn run(cache: Arc<CacheInner>, handle: DownloadHandle) {
    let token = handle.shared.token.clone();

    let permit = tokio::select! {
        biased;
        _ = token.cancelled() => {
            handle.finish(Outcome::Cancelled { moved: false });
            return;
        }
        permit = cache.permits().acquire_owned() => permit,
    };
    let Ok(_permit) = permit else {
        handle.finish(Outcome::Failed { not_found: false });
        return;
    };

    handle.shared.running.store(true, Ordering::SeqCst);
    if token.is_cancelled() {
        handle.finish(Outcome::Cancelled { moved: false });
        return;
    }

    debug!(url = %handle.url(), "start load");
    let result = tokio::select! {
        biased;
        _ = token.cancelled() => None,
        result = execute(&cache, &handle) => Some(result),
    };

    let outcome = match result {
        None => Outcome::Cancelled { moved: false },
        Some(result) if handle.is_cancelled() => Outcome::Cancelled { moved: result.is_ok() },
        Some(Ok(())) => Outcome::Success,
        Some(Err(e)) => {
            warn!(url = %handle.url(), error = %e, "download failed");
            Outcome::Failed {
                not_found: e.is_not_found(),
            }
        }
    };

    let finishing = handle.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || finishing.finish(outcome)).await {
        warn!(error = %e, "download cleanup task failed");
    }
}

async fn execute(cache: &CacheInner, handle: &DownloadHandle) -> Result<(), CacheError> {
    let response = cache.client().get(handle.url()).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(CacheError::Status(status.as_u16()));
    }
    let content_length = response.content_length().unwrap_or(0);

    let partial = &handle.shared.partial;
    if let Some(parent) = partial.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(partial).await?;

    let mut total_read: u64 = 0;
    let mut last_progress: u64 = 0;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        total_read += chunk.len() as u64;
        if total_read >= last_progress + PROGRESS_STEP {
            let total = if content_length == 0 { total_read } else { content_length };
            handle.post_progress(total_read, total, false);
            last_progress = total_read;
        }
    }
    file.flush().await?;
    drop(file);

    tokio::fs::rename(partial, &handle.shared.output).await?;
    Ok(())
}
