//! Range cached streaming of a single remote file.
//!
//! A [`StreamingSource`] serves sequential reads of an open region. Bytes
//! already held in its [`PartialFileCache`] are served from memory, gaps are
//! fetched with HTTP range requests and written back. Once every byte of the
//! file has been seen the buffer is written into the [`FileCache`].

use std::path::{Path, PathBuf};

use bytes::Bytes;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, warn};

use super::FileCache;
use crate::error::CacheError;

/// Inclusive byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "range start {start} after end {end}");
        Self { start, end }
    }

    /// `None` for an empty range.
    pub fn with_len(start: u64, len: u64) -> Option<Self> {
        (len > 0).then(|| Self::new(start, start + len - 1))
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn contains(&self, position: u64) -> bool {
        self.start <= position && position <= self.end
    }

    pub fn covers(&self, other: &ByteRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn intersect(&self, other: &ByteRange) -> Option<ByteRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start <= end).then(|| ByteRange::new(start, end))
    }
}

/// Sorted set of disjoint, non-adjacent ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<ByteRange>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a range, merging it with every overlapping or touching range.
    pub fn insert(&mut self, range: ByteRange) {
        let idx = self.ranges.partition_point(|r| r.start < range.start);
        self.ranges.insert(idx, range);

        let mut merged: Vec<ByteRange> = Vec::with_capacity(self.ranges.len());
        for r in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if r.start <= last.end.saturating_add(1) => last.end = last.end.max(r.end),
                _ => merged.push(r),
            }
        }
        self.ranges = merged;
    }

    pub fn ranges(&self) -> &[ByteRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn covers(&self, range: &ByteRange) -> bool {
        self.find(range.start).is_some_and(|r| r.covers(range))
    }

    pub fn find(&self, position: u64) -> Option<ByteRange> {
        let idx = self.ranges.partition_point(|r| r.end < position);
        self.ranges.get(idx).copied().filter(|r| r.contains(position))
    }

    /// Parts of `region` not in the set.
    pub fn missing_within(&self, region: ByteRange) -> Vec<ByteRange> {
        let mut missing = Vec::new();
        let mut cursor = region.start;
        for r in &self.ranges {
            if r.end < cursor {
                continue;
            }
            if r.start > region.end {
                break;
            }
            if r.start > cursor {
                missing.push(ByteRange::new(cursor, r.start - 1));
            }
            if r.end >= region.end {
                return missing;
            }
            cursor = r.end + 1;
        }
        missing.push(ByteRange::new(cursor, region.end));
        missing
    }

    /// Whether the set is exactly `[0, length - 1]`.
    pub fn is_complete(&self, length: u64) -> bool {
        match self.ranges.as_slice() {
            [only] => only.start == 0 && only.end + 1 >= length,
            [] => length == 0,
            _ => false,
        }
    }
}

/// Cached and missing parts of one requested region.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionStats {
    pub cached: Vec<ByteRange>,
    pub missing: Vec<ByteRange>,
}

impl RegionStats {
    pub fn find_cached(&self, position: u64) -> Option<ByteRange> {
        self.cached.iter().copied().find(|r| r.contains(position))
    }

    pub fn find_missing(&self, position: u64) -> Option<ByteRange> {
        self.missing.iter().copied().find(|r| r.contains(position))
    }
}

/// In-memory buffer for a file of known length plus the set of ranges written.
#[derive(Debug)]
pub struct PartialFileCache {
    data: Vec<u8>,
    ranges: RangeSet,
    position: u64,
    complete: bool,
}

impl PartialFileCache {
    pub fn new(file_length: u64) -> Self {
        Self {
            data: vec![0; file_length as usize],
            ranges: RangeSet::new(),
            position: 0,
            complete: false,
        }
    }

    pub fn file_length(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn seek(&mut self, position: u64) {
        self.position = position;
    }

    pub fn is_cached(&self, position: u64, length: u64) -> bool {
        match ByteRange::with_len(position, length) {
            Some(range) => self.ranges.covers(&range),
            None => true,
        }
    }

    pub fn cached_ranges(&self) -> &[ByteRange] {
        self.ranges.ranges()
    }

    pub fn region_stats(&self, region: ByteRange) -> RegionStats {
        let cached = self
            .ranges
            .ranges()
            .iter()
            .filter_map(|r| r.intersect(&region))
            .collect();
        RegionStats {
            cached,
            missing: self.ranges.missing_within(region),
        }
    }

    /// Writes at the current position. Bytes past the end of the file are
    /// dropped. Returns `true` only for the write that completes the file.
    pub fn write(&mut self, data: &[u8]) -> bool {
        let length = self.file_length();
        if self.position >= length || data.is_empty() {
            return false;
        }
        let n = data.len().min((length - self.position) as usize);
        let start = self.position as usize;
        self.data[start..start + n].copy_from_slice(&data[..n]);
        if let Some(range) = ByteRange::with_len(self.position, n as u64) {
            self.ranges.insert(range);
        }
        self.position += n as u64;

        if !self.complete && self.ranges.is_complete(length) {
            self.complete = true;
            return true;
        }
        false
    }

    /// Fills `buf` from the current position. Every requested byte must be cached.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<(), CacheError> {
        let length = buf.len() as u64;
        if !self.is_cached(self.position, length) || self.position + length > self.file_length() {
            return Err(CacheError::RangeNotCached {
                position: self.position,
                length,
            });
        }
        let start = self.position as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        self.position += length;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

struct ActiveRange {
    range: ByteRange,
    // offset of the next byte the response will yield
    next: u64,
    response: Response,
    pending: Bytes,
}

type CompletionListener = Box<dyn FnOnce(&Path) + Send>;

/// Largest file a source without a [`FileCache`] buffers in memory.
pub const DEFAULT_MAX_STREAM_LENGTH: u64 = 256 * 1024 * 1024;

/// Seekable reader over a remote file that caches what it reads.
pub struct StreamingSource {
    client: Client,
    url: String,
    output: PathBuf,
    cache: Option<FileCache>,
    max_length: u64,
    partial: Option<PartialFileCache>,
    pending_fill: Option<Bytes>,
    position: u64,
    // exclusive
    end: u64,
    region: RegionStats,
    active: Option<ActiveRange>,
    listeners: Vec<CompletionListener>,
    completed: bool,
}

impl std::fmt::Debug for StreamingSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingSource")
            .field("url", &self.url)
            .field("position", &self.position)
            .field("end", &self.end)
            .field("completed", &self.completed)
            .finish()
    }
}

impl StreamingSource {
    /// `output` is where the finished file is written. With a `cache` the
    /// file is also counted against its size limit, and files larger than
    /// that limit are refused.
    pub fn new(client: Client, url: &str, output: PathBuf, cache: Option<FileCache>) -> Self {
        let max_length = cache
            .as_ref()
            .map_or(DEFAULT_MAX_STREAM_LENGTH, FileCache::max_size);
        Self {
            client,
            url: url.to_string(),
            output,
            cache,
            max_length,
            partial: None,
            pending_fill: None,
            position: 0,
            end: 0,
            region: RegionStats::default(),
            active: None,
            listeners: Vec::new(),
            completed: false,
        }
    }

    /// Source over a file that is already complete on disk. Never touches
    /// the network.
    pub(crate) fn from_cached(client: Client, url: &str, output: PathBuf, data: &[u8]) -> Self {
        let mut partial = PartialFileCache::new(data.len() as u64);
        partial.write(data);
        let mut source = Self::new(client, url, output, None);
        source.partial = Some(partial);
        source.completed = true;
        source
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Pre-seeds the cache with the file prefix. Applied on the first open.
    pub fn fill_cache(&mut self, data: Bytes) {
        match &mut self.partial {
            Some(partial) => {
                partial.seek(0);
                if partial.write(&data) {
                    debug!(url = %self.url, "cache filled before streaming");
                }
            }
            None => self.pending_fill = Some(data),
        }
    }

    /// Called with the cached file path once the whole file is cached. Runs
    /// immediately if that already happened.
    pub fn add_listener<F>(&mut self, listener: F)
    where
        F: FnOnce(&Path) + Send + 'static,
    {
        if self.completed {
            listener(&self.output);
        } else {
            self.listeners.push(Box::new(listener));
        }
    }

    /// Opens `[position, position + length)` for reading, clamped to the file.
    /// Returns the number of readable bytes.
    pub async fn open(&mut self, url: &str, position: u64, length: Option<u64>) -> Result<u64, CacheError> {
        if url != self.url {
            return Err(CacheError::UriMismatch);
        }

        let file_length = match &self.partial {
            Some(partial) => partial.file_length(),
            None => {
                let file_length = self.detect_length().await?;
                if file_length > self.max_length {
                    return Err(CacheError::TooLarge {
                        length: file_length,
                        limit: self.max_length,
                    });
                }
                let mut partial = PartialFileCache::new(file_length);
                if let Some(data) = self.pending_fill.take() {
                    partial.write(&data);
                }
                self.partial = Some(partial);
                file_length
            }
        };
        if !self.completed && self.partial.as_ref().is_some_and(PartialFileCache::is_complete) {
            self.on_complete().await;
        }

        let start = position.min(file_length);
        let end = match length {
            Some(length) => start.saturating_add(length).min(file_length),
            None => file_length,
        };
        self.position = start;
        self.end = end;
        self.active = None;
        self.region = match (&self.partial, ByteRange::with_len(start, end - start)) {
            (Some(partial), Some(region)) => partial.region_stats(region),
            _ => RegionStats::default(),
        };
        Ok(end - start)
    }

    /// Reads up to `buf.len()` bytes. `Ok(0)` marks the end of the open region.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, CacheError> {
        if buf.is_empty() || self.position >= self.end {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.end - self.position);

        if let Some(cached) = self.region.find_cached(self.position) {
            let n = want.min(cached.end - self.position + 1) as usize;
            let position = self.position;
            let partial = self.partial_mut()?;
            partial.seek(position);
            partial.read(&mut buf[..n])?;
            self.position += n as u64;
            return Ok(n);
        }

        let missing = self
            .region
            .find_missing(self.position)
            .unwrap_or_else(|| ByteRange::new(self.position, self.end - 1));
        let n = want.min(missing.end - self.position + 1) as usize;
        self.ensure_active(missing).await?;
        let n = self.read_http(&mut buf[..n]).await?;

        let position = self.position;
        let partial = self.partial_mut()?;
        partial.seek(position);
        let completed_now = partial.write(&buf[..n]);
        self.position += n as u64;

        if completed_now {
            self.on_complete().await;
        }
        Ok(n)
    }

    /// Drops any open HTTP response.
    pub fn close(&mut self) {
        self.active = None;
    }

    pub fn file_length(&self) -> Option<u64> {
        self.partial.as_ref().map(PartialFileCache::file_length)
    }

    pub fn cached_ranges(&self) -> Vec<ByteRange> {
        self.partial
            .as_ref()
            .map(|p| p.cached_ranges().to_vec())
            .unwrap_or_default()
    }

    pub fn is_complete(&self) -> bool {
        self.completed
    }

    fn partial_mut(&mut self) -> Result<&mut PartialFileCache, CacheError> {
        self.partial
            .as_mut()
            .ok_or_else(|| CacheError::Unavailable(self.url.clone()))
    }

    async fn detect_length(&self) -> Result<u64, CacheError> {
        let response = self.client.get(&self.url).header(RANGE, "bytes=0-0").send().await?;
        let status = response.status();
        let length = match status {
            StatusCode::PARTIAL_CONTENT => response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total),
            StatusCode::OK => response.content_length(),
            _ => return Err(CacheError::Status(status.as_u16())),
        };
        let length = length.ok_or_else(|| CacheError::Unavailable(self.url.clone()))?;
        debug!(url = %self.url, length, "detected stream length");
        Ok(length)
    }

    async fn ensure_active(&mut self, range: ByteRange) -> Result<(), CacheError> {
        if self
            .active
            .as_ref()
            .is_some_and(|a| a.range == range && a.next == self.position)
        {
            return Ok(());
        }

        let from = self.position;
        debug!(url = %self.url, from, to = range.end, "requesting range");
        let response = self
            .client
            .get(&self.url)
            .header(RANGE, format!("bytes={}-{}", from, range.end))
            .send()
            .await?;
        let status = response.status();
        let usable = status == StatusCode::PARTIAL_CONTENT || (status == StatusCode::OK && from == 0);
        if !usable {
            return Err(CacheError::Status(status.as_u16()));
        }
        self.active = Some(ActiveRange {
            range,
            next: from,
            response,
            pending: Bytes::new(),
        });
        Ok(())
    }

    async fn read_http(&mut self, buf: &mut [u8]) -> Result<usize, CacheError> {
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| CacheError::Unavailable(self.url.clone()))?;
        while active.pending.is_empty() {
            match active.response.chunk().await? {
                Some(chunk) => active.pending = chunk,
                None => {
                    self.active = None;
                    return Err(CacheError::Io(std::io::ErrorKind::UnexpectedEof.into()));
                }
            }
        }
        let n = buf.len().min(active.pending.len());
        let chunk = active.pending.split_to(n);
        buf[..n].copy_from_slice(&chunk);
        active.next += n as u64;
        Ok(n)
    }

    async fn on_complete(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        self.active = None;

        let Some(partial) = &self.partial else {
            return;
        };
        let staging = match &self.cache {
            Some(cache) => cache.stream_staging_path(&self.url),
            None => self.output.with_extension("part"),
        };
        if let Err(e) = write_file(&staging, &self.output, partial.data()).await {
            warn!(url = %self.url, error = %e, "could not store streamed file");
            return;
        }
        debug!(url = %self.url, path = %self.output.display(), "streamed file cached");

        // The output may have replaced an older copy, so the size is rescanned.
        if let Some(cache) = self.cache.clone() {
            if let Err(e) = tokio::task::spawn_blocking(move || cache.resync_size()).await {
                warn!(error = %e, "could not register streamed file");
            }
        }

        for listener in std::mem::take(&mut self.listeners) {
            listener(&self.output);
        }
    }
}

async fn write_file(staging: &Path, output: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = staging.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(staging, data).await?;
    tokio::fs::rename(staging, output).await
}

// "bytes 0-0/1234" -> 1234
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.split_once('/')?;
    total.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ranges: &[(u64, u64)]) -> RangeSet {
        let mut set = RangeSet::new();
        for &(start, end) in ranges {
            set.insert(ByteRange::new(start, end));
        }
        set
    }

    #[test]
    fn adjacent_ranges_coalesce() {
        assert_eq!(set(&[(0, 99), (100, 199)]).ranges(), &[ByteRange::new(0, 199)]);
        assert_eq!(set(&[(300, 399), (200, 299)]).ranges(), &[ByteRange::new(200, 399)]);
    }

    #[test]
    fn overlapping_and_disjoint_ranges() {
        let ranges = set(&[(50, 80), (0, 10), (70, 120), (200, 210)]);
        assert_eq!(
            ranges.ranges(),
            &[ByteRange::new(0, 10), ByteRange::new(50, 120), ByteRange::new(200, 210)]
        );

        let bridged = set(&[(0, 10), (20, 30), (11, 19)]);
        assert_eq!(bridged.ranges(), &[ByteRange::new(0, 30)]);
    }

    #[test]
    fn missing_parts_of_a_region() {
        let ranges = set(&[(10, 19), (30, 39)]);
        assert_eq!(
            ranges.missing_within(ByteRange::new(0, 49)),
            vec![ByteRange::new(0, 9), ByteRange::new(20, 29), ByteRange::new(40, 49)]
        );
        assert!(ranges.missing_within(ByteRange::new(12, 18)).is_empty());
        assert_eq!(ranges.missing_within(ByteRange::new(15, 32)), vec![ByteRange::new(20, 29)]);
    }

    #[test]
    fn reading_uncached_bytes_fails() {
        let mut cache = PartialFileCache::new(10);
        cache.seek(2);
        cache.write(b"abc");

        let mut buf = [0u8; 3];
        cache.seek(2);
        cache.read(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");

        cache.seek(4);
        let err = cache.read(&mut buf).unwrap_err();
        assert!(matches!(err, CacheError::RangeNotCached { position: 4, length: 3 }));
    }

    #[test]
    fn completion_is_reported_once() {
        let mut cache = PartialFileCache::new(6);
        cache.seek(3);
        assert!(!cache.write(b"def"));
        cache.seek(0);
        assert!(cache.write(b"abc"));
        assert!(cache.is_complete());

        cache.seek(0);
        assert!(!cache.write(b"abcdef"));
        assert_eq!(cache.data(), b"abcdef");
    }

    #[test]
    fn writes_past_the_end_are_clamped() {
        let mut cache = PartialFileCache::new(4);
        cache.seek(2);
        cache.write(b"xyz!");
        assert_eq!(cache.cached_ranges(), &[ByteRange::new(2, 3)]);
        assert_eq!(cache.position(), 4);
    }

    #[test]
    fn region_stats_split_cached_and_missing() {
        let mut cache = PartialFileCache::new(100);
        cache.seek(20);
        cache.write(&[1; 10]);

        let stats = cache.region_stats(ByteRange::new(25, 44));
        assert_eq!(stats.cached, vec![ByteRange::new(25, 29)]);
        assert_eq!(stats.missing, vec![ByteRange::new(30, 44)]);
        assert_eq!(stats.find_cached(27), Some(ByteRange::new(25, 29)));
        assert_eq!(stats.find_missing(27), None);
    }

    #[test]
    fn content_range_total() {
        assert_eq!(parse_content_range_total("bytes 0-0/1234"), Some(1234));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }
}
