//! Thread and catalog loader.
//!
//! Each [`ThreadLoader`] is a handle to one actor task that owns the loaded
//! thread, the listener list and the refresh timer. Fetches run on separate
//! tasks and post their result back to the actor, so all state changes happen
//! on a single task.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::WatchConfig;
use crate::error::LoaderError;
use crate::fetch::{FetchResponse, ThreadFetcher};
use crate::model::{derive_title, ChanThread, Loadable};

/// Seconds between scheduled reloads, indexed by the backoff tier.
pub const WATCH_TIMEOUTS: [u64; 13] = [10, 15, 20, 30, 60, 90, 120, 180, 240, 300, 600, 1800, 3600];

const LAST_TIER: usize = WATCH_TIMEOUTS.len() - 1;

pub type ListenerId = u64;

/// Receives loader results. Called from the loader task; implementations
/// must not block.
pub trait LoaderListener: Send + Sync {
    fn on_chan_loader_data(&self, thread: Arc<ChanThread>);

    fn on_chan_loader_error(&self, error: Arc<LoaderError>);
}

#[derive(Debug, Clone, Copy)]
pub struct LoaderConfig {
    /// Tier a sticky thread resets to on new posts instead of tier 0.
    pub sticky_backoff_floor: usize,
    pub auto_reschedule: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            sticky_backoff_floor: 3,
            auto_reschedule: true,
        }
    }
}

impl From<&WatchConfig> for LoaderConfig {
    fn from(config: &WatchConfig) -> Self {
        Self {
            sticky_backoff_floor: config.sticky_backoff_floor,
            auto_reschedule: config.auto_reschedule,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderStatus {
    Idle,
    Fetching,
    Stopped,
}

enum Command {
    AddListener(ListenerId, Arc<dyn LoaderListener>),
    RemoveListener(ListenerId, oneshot::Sender<bool>),
    RequestFreshData,
    RequestAdditionalData(Option<oneshot::Sender<bool>>),
    LoadMoreIfTime(oneshot::Sender<bool>),
    QuickLoad,
    RequestAdditionalDataAndResetTimer,
    SetTimer,
    ClearTimer,
    GetThread(oneshot::Sender<Option<Arc<ChanThread>>>),
    GetLoadable(oneshot::Sender<Loadable>),
    TimeUntilLoadMore(oneshot::Sender<Duration>),
    CurrentTimeout(oneshot::Sender<usize>),
    Status(oneshot::Sender<LoaderStatus>),
    Stop,
    FetchDone {
        generation: u64,
        result: Result<FetchResponse, LoaderError>,
    },
    TimerFired {
        generation: u64,
    },
}

/// Handle to a running loader. Cheap to clone.
#[derive(Clone)]
pub struct ThreadLoader {
    commands: mpsc::UnboundedSender<Command>,
    loadable: Loadable,
    next_listener: Arc<AtomicU64>,
}

impl std::fmt::Debug for ThreadLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadLoader")
            .field("loadable", &self.loadable)
            .finish()
    }
}

impl ThreadLoader {
    /// Spawns the loader task. Must be called inside a tokio runtime.
    pub fn spawn(loadable: Loadable, fetcher: Arc<dyn ThreadFetcher>, config: LoaderConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = LoaderActor {
            loadable: loadable.clone(),
            fetcher,
            config,
            listeners: Vec::new(),
            thread: None,
            request: None,
            generation: 0,
            timer: None,
            timer_generation: 0,
            current_timeout: 0,
            last_post_count: 0,
            last_load_time: None,
            commands: tx.downgrade(),
        };
        tokio::spawn(actor.run(rx));

        Self {
            commands: tx,
            loadable,
            next_listener: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Identity this loader was created for.
    pub fn loadable(&self) -> &Loadable {
        &self.loadable
    }

    pub fn add_listener(&self, listener: Arc<dyn LoaderListener>) -> ListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.send(Command::AddListener(id, listener));
        id
    }

    /// Removes a listener. Returns `true` when no listeners remain, in which
    /// case the timer and any in-flight fetch are cancelled.
    pub async fn remove_listener(&self, id: ListenerId) -> bool {
        self.ask(|tx| Command::RemoveListener(id, tx))
            .await
            .unwrap_or(true)
    }

    /// Cancels pending work, resets the backoff and loads from scratch.
    pub fn request_fresh_data(&self) {
        self.send(Command::RequestFreshData);
    }

    /// Fetches new posts for a thread. Returns `false` without fetching when
    /// a request is already in flight or this is a catalog loader.
    pub async fn request_additional_data(&self) -> bool {
        self.ask(|tx| Command::RequestAdditionalData(Some(tx)))
            .await
            .unwrap_or(false)
    }

    pub async fn load_more_if_time(&self) -> bool {
        self.ask(Command::LoadMoreIfTime).await.unwrap_or(false)
    }

    /// Delivers the current thread to listeners again, then requests more data.
    pub fn quick_load(&self) {
        self.send(Command::QuickLoad);
    }

    pub fn request_additional_data_and_reset_timer(&self) {
        self.send(Command::RequestAdditionalDataAndResetTimer);
    }

    /// Schedules a `request_additional_data` after the current backoff delay.
    pub fn set_timer(&self) {
        self.send(Command::SetTimer);
    }

    pub fn clear_timer(&self) {
        self.send(Command::ClearTimer);
    }

    pub async fn thread(&self) -> Option<Arc<ChanThread>> {
        self.ask(Command::GetThread).await.flatten()
    }

    /// Loadable as seen by the loader, including a derived title.
    pub async fn current_loadable(&self) -> Loadable {
        self.ask(Command::GetLoadable)
            .await
            .unwrap_or_else(|| self.loadable.clone())
    }

    /// Time left until another load is due; zero when overdue or loading.
    pub async fn time_until_load_more(&self) -> Duration {
        self.ask(Command::TimeUntilLoadMore)
            .await
            .unwrap_or(Duration::ZERO)
    }

    /// Index into [`WATCH_TIMEOUTS`] used for the next timer.
    pub async fn current_timeout(&self) -> usize {
        self.ask(Command::CurrentTimeout).await.unwrap_or(0)
    }

    pub async fn status(&self) -> LoaderStatus {
        self.ask(Command::Status)
            .await
            .unwrap_or(LoaderStatus::Stopped)
    }

    /// Stops the loader for good. Later requests have no effect.
    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!(board = %self.loadable.board, no = self.loadable.no, "loader already stopped");
        }
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).ok()?;
        rx.await.ok()
    }
}

struct LoaderActor {
    loadable: Loadable,
    fetcher: Arc<dyn ThreadFetcher>,
    config: LoaderConfig,
    listeners: Vec<(ListenerId, Arc<dyn LoaderListener>)>,
    thread: Option<Arc<ChanThread>>,
    request: Option<JoinHandle<()>>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
    timer_generation: u64,
    current_timeout: usize,
    last_post_count: usize,
    last_load_time: Option<Instant>,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl LoaderActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            if !self.handle(command) {
                break;
            }
        }
        self.shutdown();
    }

    /// Returns `false` once the loader should stop.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::AddListener(id, listener) => self.listeners.push((id, listener)),
            Command::RemoveListener(id, reply) => {
                let _ = reply.send(self.remove_listener(id));
            }
            Command::RequestFreshData => self.request_fresh_data(),
            Command::RequestAdditionalData(reply) => {
                let started = self.request_additional_data();
                if let Some(reply) = reply {
                    let _ = reply.send(started);
                }
            }
            Command::LoadMoreIfTime(reply) => {
                let started = self.time_until_load_more().is_zero() && self.request_additional_data();
                let _ = reply.send(started);
            }
            Command::QuickLoad => self.quick_load(),
            Command::RequestAdditionalDataAndResetTimer => {
                if self.request.is_none() {
                    self.clear_timer();
                    self.request_additional_data();
                }
            }
            Command::SetTimer => self.set_timer(),
            Command::ClearTimer => self.clear_timer(),
            Command::GetThread(reply) => {
                let _ = reply.send(self.thread.clone());
            }
            Command::GetLoadable(reply) => {
                let _ = reply.send(self.loadable.clone());
            }
            Command::TimeUntilLoadMore(reply) => {
                let _ = reply.send(self.time_until_load_more());
            }
            Command::CurrentTimeout(reply) => {
                let _ = reply.send(self.current_timeout);
            }
            Command::Status(reply) => {
                let status = if self.request.is_some() {
                    LoaderStatus::Fetching
                } else {
                    LoaderStatus::Idle
                };
                let _ = reply.send(status);
            }
            Command::Stop => return false,
            Command::FetchDone { generation, result } => self.on_fetch_done(generation, result),
            Command::TimerFired { generation } => {
                if generation == self.timer_generation && self.timer.take().is_some() {
                    self.request_additional_data();
                }
            }
        }
        true
    }

    fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.retain(|(existing, _)| *existing != id);
        if self.listeners.is_empty() {
            self.clear_timer();
            self.cancel_request();
            true
        } else {
            false
        }
    }

    fn request_fresh_data(&mut self) {
        self.clear_timer();
        self.cancel_request();

        if self.loadable.is_catalog_mode() {
            self.loadable.list_view_index = 0;
            self.loadable.list_view_top = 0;
            self.thread = None;
        }

        self.current_timeout = 0;
        self.start_request();
    }

    fn request_additional_data(&mut self) -> bool {
        self.clear_pending_timer();

        if self.loadable.is_thread_mode() && self.request.is_none() {
            self.start_request();
            true
        } else {
            false
        }
    }

    fn quick_load(&mut self) {
        match self.thread.clone() {
            Some(thread) => {
                self.notify_data(&thread);
                self.request_additional_data();
            }
            None => warn!(board = %self.loadable.board, no = self.loadable.no, "quick load without a loaded thread"),
        }
    }

    fn start_request(&mut self) {
        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        debug!(board = %self.loadable.board, no = self.loadable.no, "requested");

        self.generation += 1;
        let generation = self.generation;
        let fetcher = self.fetcher.clone();
        let loadable = self.loadable.clone();
        let cached = self
            .thread
            .as_ref()
            .map(|thread| thread.posts.clone())
            .unwrap_or_default();

        self.request = Some(tokio::spawn(async move {
            let result = fetcher.fetch(&loadable, &cached).await;
            let _ = commands.send(Command::FetchDone { generation, result });
        }));
    }

    fn cancel_request(&mut self) {
        if let Some(request) = self.request.take() {
            request.abort();
            self.generation += 1;
        }
    }

    fn on_fetch_done(&mut self, generation: u64, result: Result<FetchResponse, LoaderError>) {
        if generation != self.generation || self.request.is_none() {
            debug!(generation, "dropping stale fetch result");
            return;
        }
        self.request = None;

        match result {
            Ok(response) if response.posts.is_empty() => self.on_error(LoaderError::EmptyThread),
            Ok(response) => self.on_response(response),
            Err(error) => self.on_error(error),
        }
    }

    fn on_response(&mut self, response: FetchResponse) {
        let thread = Arc::new(merge_response(&mut self.loadable, response));
        self.last_load_time = Some(Instant::now());

        let sticky = self.loadable.is_thread_mode()
            && thread.op().map(|op| op.sticky).unwrap_or(false);
        self.current_timeout = next_timeout(
            self.current_timeout,
            self.last_post_count,
            thread.posts.len(),
            sticky,
            self.config.sticky_backoff_floor,
        );
        self.last_post_count = self.last_post_count.max(thread.posts.len());
        self.thread = Some(thread.clone());

        self.notify_data(&thread);

        if self.config.auto_reschedule && self.loadable.is_thread_mode() && !self.listeners.is_empty() {
            self.set_timer();
        }
    }

    fn on_error(&mut self, error: LoaderError) {
        info!(board = %self.loadable.board, no = self.loadable.no, %error, "loading error");
        self.clear_timer();

        let error = Arc::new(error);
        for (_, listener) in self.listeners.clone() {
            let error = error.clone();
            if catch_unwind(AssertUnwindSafe(|| listener.on_chan_loader_error(error))).is_err() {
                warn!("loader listener panicked on error delivery");
            }
        }
    }

    fn notify_data(&self, thread: &Arc<ChanThread>) {
        for (_, listener) in self.listeners.clone() {
            let thread = thread.clone();
            if catch_unwind(AssertUnwindSafe(|| listener.on_chan_loader_data(thread))).is_err() {
                warn!("loader listener panicked on data delivery");
            }
        }
    }

    fn set_timer(&mut self) {
        self.clear_pending_timer();
        let Some(commands) = self.commands.upgrade() else {
            return;
        };

        let seconds = WATCH_TIMEOUTS[self.current_timeout.min(LAST_TIER)];
        debug!(seconds, "scheduled reload");

        self.timer_generation += 1;
        let generation = self.timer_generation;
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(seconds)).await;
            let _ = commands.send(Command::TimerFired { generation });
        }));
    }

    fn clear_timer(&mut self) {
        self.current_timeout = 0;
        self.clear_pending_timer();
    }

    fn clear_pending_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            debug!("cleared timer");
            timer.abort();
            self.timer_generation += 1;
        }
    }

    fn time_until_load_more(&self) -> Duration {
        if self.request.is_some() {
            return Duration::ZERO;
        }
        match self.last_load_time {
            Some(loaded) => {
                let wait = Duration::from_secs(WATCH_TIMEOUTS[self.current_timeout.min(LAST_TIER)]);
                (loaded + wait).saturating_duration_since(Instant::now())
            }
            None => Duration::ZERO,
        }
    }

    fn shutdown(&mut self) {
        debug!(board = %self.loadable.board, no = self.loadable.no, "loader stopped");
        self.clear_pending_timer();
        self.cancel_request();
        self.listeners.clear();
    }
}

/// Replaces the post list with the fetched one and patches the OP.
///
/// The fetched OP metadata wins over the values on the post at index 0,
/// since incremental responses carry it separately from the OP body.
pub(crate) fn merge_response(loadable: &mut Loadable, response: FetchResponse) -> ChanThread {
    let mut thread = ChanThread::new(loadable.clone());
    thread.posts = response.posts;

    if loadable.is_thread_mode() {
        match (response.op, thread.posts.first_mut()) {
            (Some(op), Some(real_op)) => {
                real_op.apply_op_metadata(&op);
                thread.closed = op.closed;
                thread.archived = op.archived;
            }
            _ => warn!(board = %loadable.board, no = loadable.no, "thread has no op"),
        }

        if loadable.title.is_empty() {
            if let Some(op) = thread.posts.first() {
                loadable.title = derive_title(op, loadable);
            }
        }
    }

    for post in &mut thread.posts {
        post.title = loadable.title.clone();
    }
    thread.loadable = loadable.clone();
    thread
}

/// Backoff tier after a successful load.
pub(crate) fn next_timeout(
    current: usize,
    last_post_count: usize,
    post_count: usize,
    sticky: bool,
    sticky_floor: usize,
) -> usize {
    if post_count > last_post_count {
        if sticky {
            sticky_floor.min(LAST_TIER)
        } else {
            0
        }
    } else {
        (current + 1).min(LAST_TIER)
    }
}
