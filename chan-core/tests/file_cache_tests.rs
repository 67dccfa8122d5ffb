use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chan_core::cache::DOWNLOAD_CONCURRENCY;
use chan_core::{DownloadCallback, FileCache};
use reqwest::Client;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Debug, PartialEq)]
enum Outcome {
    Progress { downloaded: u64, total: u64 },
    Success(PathBuf),
    Fail { not_found: bool },
    Cancelled,
}

struct ChannelCallback(mpsc::UnboundedSender<Outcome>);

// Reports success and failure only, like most image views do.
struct ResultOnly(mpsc::UnboundedSender<Outcome>);

impl DownloadCallback for ResultOnly {
    fn on_success(&self, file: &Path) {
        let _ = self.0.send(Outcome::Success(file.to_path_buf()));
    }

    fn on_fail(&self, not_found: bool) {
        let _ = self.0.send(Outcome::Fail { not_found });
    }
}

impl DownloadCallback for ChannelCallback {
    fn on_progress(&self, downloaded: u64, total: u64, done: bool) {
        if !done {
            let _ = self.0.send(Outcome::Progress { downloaded, total });
        }
    }

    fn on_success(&self, file: &Path) {
        let _ = self.0.send(Outcome::Success(file.to_path_buf()));
    }

    fn on_fail(&self, not_found: bool) {
        let _ = self.0.send(Outcome::Fail { not_found });
    }

    fn on_cancel(&self) {
        let _ = self.0.send(Outcome::Cancelled);
    }
}

fn callback() -> (Arc<ChannelCallback>, mpsc::UnboundedReceiver<Outcome>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelCallback(tx)), rx)
}

fn temp_cache(name: &str, max_size: u64) -> FileCache {
    let mut dir = std::env::temp_dir();
    dir.push(format!(
        "chanwatch_files_{name}_{}",
        SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));
    FileCache::new(dir, max_size, Client::new()).unwrap()
}

// Final outcome, skipping progress reports.
async fn finished(rx: &mut mpsc::UnboundedReceiver<Outcome>) -> Outcome {
    loop {
        match rx.recv().await.expect("callback dropped without an outcome") {
            Outcome::Progress { .. } => continue,
            outcome => return outcome,
        }
    }
}

fn disk_size(dir: &Path) -> u64 {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

fn age(file: &Path, secs: u64) {
    std::fs::File::options()
        .write(true)
        .open(file)
        .unwrap()
        .set_modified(SystemTime::now() - Duration::from_secs(secs))
        .unwrap();
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..500 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn concurrent_requests_share_one_download() {
    let server = MockServer::start().await;
    let body: Vec<u8> = (0..40_960u32).map(|i| (i % 251) as u8).collect();
    Mock::given(method("GET"))
        .and(path("/g/1.webm"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(body.clone())
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let cache = temp_cache("dedup", 10 * 1024 * 1024);
    let url = format!("{}/g/1.webm", server.uri());

    let mut receivers = Vec::new();
    let mut handles = Vec::new();
    for _ in 0..5 {
        let (cb, rx) = callback();
        handles.push(cache.download_file(&url, cb).expect("download should be queued"));
        receivers.push(rx);
    }
    assert_eq!(cache.in_flight(), 1);
    assert!(handles.iter().all(|h| h.url() == url));

    let expected = cache.get(&url);
    for rx in &mut receivers {
        assert_eq!(finished(rx).await, Outcome::Success(expected.clone()));
    }
    assert_eq!(std::fs::read(&expected).unwrap(), body);
    assert_eq!(cache.in_flight(), 0);
    assert_eq!(cache.size(), body.len() as u64);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);

    let _ = std::fs::remove_dir_all(cache.directory());
}

#[tokio::test]
async fn progress_is_reported_in_steps() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/big"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 64 * 1024]))
        .mount(&server)
        .await;

    let cache = temp_cache("progress", 10 * 1024 * 1024);
    let (cb, mut rx) = callback();
    cache.download_file(&format!("{}/big", server.uri()), cb);

    let mut progress = Vec::new();
    loop {
        match rx.recv().await.unwrap() {
            Outcome::Progress { downloaded, total } => progress.push((downloaded, total)),
            Outcome::Success(_) => break,
            other => panic!("unexpected {other:?}"),
        }
    }
    assert!(!progress.is_empty());
    assert!(progress.iter().all(|(_, total)| *total == 64 * 1024));
    assert!(progress.windows(2).all(|w| w[1].0 >= w[0].0 + 16 * 1024));

    let _ = std::fs::remove_dir_all(cache.directory());
}

#[tokio::test]
async fn cached_file_is_reported_without_a_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"png".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let cache = temp_cache("hit", 1024);
    let url = format!("{}/a.png", server.uri());
    let (cb, mut rx) = callback();
    cache.download_file(&url, cb);
    finished(&mut rx).await;
    assert!(cache.exists(&url));

    let (cb, mut rx) = callback();
    assert!(cache.download_file(&url, cb).is_none());
    assert_eq!(rx.try_recv().unwrap(), Outcome::Success(cache.get(&url)));

    let _ = std::fs::remove_dir_all(cache.directory());
}

#[tokio::test]
async fn not_found_and_server_errors_fail() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone.jpg"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/broken.jpg"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let cache = temp_cache("fail", 1024);
    let gone = format!("{}/gone.jpg", server.uri());
    let broken = format!("{}/broken.jpg", server.uri());

    let (cb, mut rx) = callback();
    cache.download_file(&gone, cb);
    assert_eq!(finished(&mut rx).await, Outcome::Fail { not_found: true });

    let (cb, mut rx) = callback();
    cache.download_file(&broken, cb);
    assert_eq!(finished(&mut rx).await, Outcome::Fail { not_found: false });

    assert!(!cache.exists(&gone));
    assert!(!cache.exists(&broken));
    assert_eq!(cache.in_flight(), 0);
    assert_eq!(cache.size(), 0);

    let _ = std::fs::remove_dir_all(cache.directory());
}

#[tokio::test]
async fn cancel_before_start_is_silent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 128]))
        .mount(&server)
        .await;

    let cache = temp_cache("cancel_early", 1024);
    let url = format!("{}/c.jpg", server.uri());
    let (cb, mut rx) = callback();
    let handle = cache.download_file(&url, cb).unwrap();

    handle.cancel();
    handle.cancel();
    assert!(handle.is_cancelled());
    wait_until(|| handle.is_finished()).await;
    assert_eq!(cache.in_flight(), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err(), "a cancelled download reports nothing");
    assert!(!cache.exists(&url));
    assert!(server.received_requests().await.unwrap().is_empty());

    let _ = std::fs::remove_dir_all(cache.directory());
}

#[tokio::test]
async fn cancel_while_downloading_cleans_up() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![0u8; 128])
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let cache = temp_cache("cancel_running", 1024);
    let url = format!("{}/slow.jpg", server.uri());
    let (cb, mut rx) = callback();
    let handle = cache.download_file(&url, cb).unwrap();
    let (plain_tx, mut plain_rx) = mpsc::unbounded_channel();
    cache.download_file(&url, Arc::new(ResultOnly(plain_tx)));

    for _ in 0..500 {
        if !server.received_requests().await.unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.cancel();
    handle.cancel();
    wait_until(|| handle.is_finished()).await;

    assert_eq!(cache.in_flight(), 0);
    assert_eq!(rx.recv().await, Some(Outcome::Cancelled));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());
    assert!(plain_rx.try_recv().is_err(), "no success or failure after a cancel");
    assert!(!cache.exists(&url));
    assert_eq!(disk_size(cache.directory()), 0);

    let _ = std::fs::remove_dir_all(cache.directory());
}

#[tokio::test]
async fn at_most_two_downloads_run_at_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![0u8; 16])
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let cache = temp_cache("pool", 1024);
    let mut receivers = Vec::new();
    for i in 0..3 {
        let (cb, rx) = callback();
        cache.download_file(&format!("{}/{i}.jpg", server.uri()), cb);
        receivers.push(rx);
    }

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(server.received_requests().await.unwrap().len(), DOWNLOAD_CONCURRENCY);

    for rx in &mut receivers {
        assert!(matches!(finished(rx).await, Outcome::Success(_)));
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 3);

    let _ = std::fs::remove_dir_all(cache.directory());
}

#[tokio::test]
async fn oldest_files_are_evicted_over_the_limit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![9u8; 100]))
        .mount(&server)
        .await;

    let cache = temp_cache("evict", 250);
    let urls: Vec<String> = (0..3).map(|i| format!("{}/{i}.gif", server.uri())).collect();

    for (i, url) in urls.iter().enumerate() {
        let (cb, mut rx) = callback();
        cache.download_file(url, cb);
        let Outcome::Success(file) = finished(&mut rx).await else {
            panic!("download {i} failed");
        };
        // Older downloads look less recently used.
        age(&file, 1000 - 100 * i as u64);
        assert_eq!(cache.size(), disk_size(cache.directory()));
    }

    assert!(!cache.exists(&urls[0]));
    assert!(cache.exists(&urls[1]));
    assert!(cache.exists(&urls[2]));
    assert_eq!(cache.size(), 200);
    assert!(cache.size() <= cache.max_size());

    let _ = std::fs::remove_dir_all(cache.directory());
}

#[tokio::test]
async fn clear_cache_removes_everything() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/done.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 64]))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/slow.jpg"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![1u8; 64])
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let cache = temp_cache("clear", 4096);
    let done = format!("{}/done.jpg", server.uri());
    let (cb, mut rx) = callback();
    cache.download_file(&done, cb);
    finished(&mut rx).await;

    let (cb, mut slow_rx) = callback();
    let slow = cache.download_file(&format!("{}/slow.jpg", server.uri()), cb).unwrap();

    cache.clear_cache();
    assert!(slow.is_cancelled());
    assert!(!cache.exists(&done));
    assert_eq!(cache.size(), 0);

    wait_until(|| slow.is_finished()).await;
    while let Ok(outcome) = slow_rx.try_recv() {
        assert!(
            matches!(outcome, Outcome::Cancelled),
            "cleared download reported {outcome:?}"
        );
    }
    assert_eq!(cache.in_flight(), 0);

    let _ = std::fs::remove_dir_all(cache.directory());
}
