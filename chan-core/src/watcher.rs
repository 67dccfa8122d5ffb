//! Pins and the watch manager.
//!
//! The [`WatchManager`] actor owns every [`Pin`] and the loader attached to
//! it. Loader results are forwarded into the actor's channel, so pin state
//! has a single writer.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::WatchConfig;
use crate::error::LoaderError;
use crate::loader::{ListenerId, LoaderListener, ThreadLoader};
use crate::model::{ChanThread, Loadable, Pin, PinId, Post};
use crate::pool::LoaderPool;
use crate::saved::SavedReplyStore;
use crate::store::ChanStore;

#[derive(Debug, Clone)]
pub enum WatchEvent {
    PinAdded(Pin),
    PinRemoved(PinId),
    PinUpdated(Pin),
    NewPosts { pin: PinId, count: usize },
    NewQuotes { pin: PinId, count: usize },
    /// The thread returned not-found; the pin stopped watching.
    ThreadGone(PinId),
}

enum WatchCommand {
    CreatePin(Loadable, oneshot::Sender<Option<Pin>>),
    DeletePin(PinId, oneshot::Sender<bool>),
    SetWatching(PinId, bool, oneshot::Sender<Option<Pin>>),
    PinViewed(PinId),
    Pins(oneshot::Sender<Vec<Pin>>),
    Pin(PinId, oneshot::Sender<Option<Pin>>),
    Update(oneshot::Sender<usize>),
    UnviewedPosts(PinId, oneshot::Sender<Vec<Post>>),
    UnviewedQuotes(PinId, oneshot::Sender<Vec<Post>>),
    LoaderData(PinId, Arc<ChanThread>),
    LoaderError(PinId, Arc<LoaderError>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the watch manager task.
#[derive(Clone)]
pub struct WatchManager {
    commands: mpsc::UnboundedSender<WatchCommand>,
    events: broadcast::Sender<WatchEvent>,
}

impl WatchManager {
    /// Restores persisted pins and starts the background update loop.
    pub async fn spawn(
        store: ChanStore,
        saved: SavedReplyStore,
        pool: LoaderPool,
        config: &WatchConfig,
        media_base: Option<Url>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);

        let mut pins = BTreeMap::new();
        let mut next_pin_id = 1;
        for pin in store.load_pins().await {
            next_pin_id = next_pin_id.max(pin.id + 1);
            pins.insert(pin.id, Watched::new(pin));
        }
        info!(pins = pins.len(), "restored pins");

        let mut actor = WatchActor {
            store,
            saved,
            pool,
            pins,
            next_pin_id,
            enabled: config.enabled,
            media_base,
            events: events.clone(),
            commands: tx.downgrade(),
        };
        let ids: Vec<PinId> = actor.pins.keys().copied().collect();
        for id in ids {
            actor.start_watching(id).await;
        }
        tokio::spawn(actor.run(rx, config.update_interval()));

        Self {
            commands: tx,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    /// Creates a pin for a thread, or returns the pin already watching it.
    pub async fn create_pin(&self, loadable: Loadable) -> Option<Pin> {
        self.ask(|tx| WatchCommand::CreatePin(loadable, tx)).await.flatten()
    }

    pub async fn delete_pin(&self, id: PinId) -> bool {
        self.ask(|tx| WatchCommand::DeletePin(id, tx)).await.unwrap_or(false)
    }

    pub async fn set_watching(&self, id: PinId, watching: bool) -> Option<Pin> {
        self.ask(|tx| WatchCommand::SetWatching(id, watching, tx))
            .await
            .flatten()
    }

    /// Marks all posts and quotes of a pin as seen.
    pub fn pin_viewed(&self, id: PinId) {
        let _ = self.commands.send(WatchCommand::PinViewed(id));
    }

    pub async fn pins(&self) -> Vec<Pin> {
        self.ask(WatchCommand::Pins).await.unwrap_or_default()
    }

    pub async fn pin(&self, id: PinId) -> Option<Pin> {
        self.ask(|tx| WatchCommand::Pin(id, tx)).await.flatten()
    }

    /// Runs one update pass now. Returns how many fetches were started.
    pub async fn update(&self) -> usize {
        self.ask(WatchCommand::Update).await.unwrap_or(0)
    }

    pub async fn unviewed_posts(&self, id: PinId) -> Vec<Post> {
        self.ask(|tx| WatchCommand::UnviewedPosts(id, tx))
            .await
            .unwrap_or_default()
    }

    pub async fn unviewed_quotes(&self, id: PinId) -> Vec<Post> {
        self.ask(|tx| WatchCommand::UnviewedQuotes(id, tx))
            .await
            .unwrap_or_default()
    }

    /// Releases every loader and stops the manager task.
    pub async fn shutdown(&self) {
        let _ = self.ask(WatchCommand::Shutdown).await;
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> WatchCommand) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).ok()?;
        rx.await.ok()
    }
}

/// Forwards loader callbacks of one pin into the manager task.
struct PinListener {
    pin: PinId,
    commands: mpsc::WeakUnboundedSender<WatchCommand>,
}

impl LoaderListener for PinListener {
    fn on_chan_loader_data(&self, thread: Arc<ChanThread>) {
        if let Some(commands) = self.commands.upgrade() {
            let _ = commands.send(WatchCommand::LoaderData(self.pin, thread));
        }
    }

    fn on_chan_loader_error(&self, error: Arc<LoaderError>) {
        if let Some(commands) = self.commands.upgrade() {
            let _ = commands.send(WatchCommand::LoaderError(self.pin, error));
        }
    }
}

struct Watched {
    pin: Pin,
    loader: Option<(ThreadLoader, ListenerId)>,
    thread: Option<Arc<ChanThread>>,
    quotes: Vec<Post>,
}

impl Watched {
    fn new(pin: Pin) -> Self {
        Self {
            pin,
            loader: None,
            thread: None,
            quotes: Vec::new(),
        }
    }

    fn unviewed_posts(&self) -> Vec<Post> {
        let Some(thread) = &self.thread else {
            return Vec::new();
        };
        let skip = thread.posts.len().saturating_sub(self.pin.new_post_count());
        thread.posts[skip..].to_vec()
    }

    fn unviewed_quotes(&self) -> Vec<Post> {
        let skip = self.quotes.len().saturating_sub(self.pin.new_quote_count());
        self.quotes[skip..].to_vec()
    }
}

struct WatchActor {
    store: ChanStore,
    saved: SavedReplyStore,
    pool: LoaderPool,
    pins: BTreeMap<PinId, Watched>,
    next_pin_id: PinId,
    enabled: bool,
    // used to fill pin thumbnails
    media_base: Option<Url>,
    events: broadcast::Sender<WatchEvent>,
    commands: mpsc::WeakUnboundedSender<WatchCommand>,
}

impl WatchActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<WatchCommand>, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(WatchCommand::Shutdown(reply)) => {
                        info!("watch manager shutdown requested");
                        self.release_all().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        self.release_all().await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    let started = self.update().await;
                    debug!(started, "scheduled update pass");
                }
            }
        }
    }

    async fn handle(&mut self, command: WatchCommand) {
        match command {
            WatchCommand::CreatePin(loadable, reply) => {
                let _ = reply.send(self.create_pin(loadable).await);
            }
            WatchCommand::DeletePin(id, reply) => {
                let _ = reply.send(self.delete_pin(id).await);
            }
            WatchCommand::SetWatching(id, watching, reply) => {
                let _ = reply.send(self.set_watching(id, watching).await);
            }
            WatchCommand::PinViewed(id) => {
                if let Some(watched) = self.pins.get_mut(&id) {
                    watched.pin.mark_viewed();
                    let pin = watched.pin.clone();
                    self.pin_changed(pin).await;
                }
            }
            WatchCommand::Pins(reply) => {
                let _ = reply.send(self.pins.values().map(|w| w.pin.clone()).collect());
            }
            WatchCommand::Pin(id, reply) => {
                let _ = reply.send(self.pins.get(&id).map(|w| w.pin.clone()));
            }
            WatchCommand::Update(reply) => {
                let _ = reply.send(self.update().await);
            }
            WatchCommand::UnviewedPosts(id, reply) => {
                let posts = self.pins.get(&id).map(Watched::unviewed_posts);
                let _ = reply.send(posts.unwrap_or_default());
            }
            WatchCommand::UnviewedQuotes(id, reply) => {
                let quotes = self.pins.get(&id).map(Watched::unviewed_quotes);
                let _ = reply.send(quotes.unwrap_or_default());
            }
            WatchCommand::LoaderData(id, thread) => self.on_loader_data(id, thread).await,
            WatchCommand::LoaderError(id, error) => self.on_loader_error(id, &error).await,
            WatchCommand::Shutdown(_) => unreachable!("shutdown is handled by the run loop"),
        }
    }

    async fn create_pin(&mut self, loadable: Loadable) -> Option<Pin> {
        if !loadable.is_thread_mode() {
            warn!(board = %loadable.board, "only threads can be pinned");
            return None;
        }
        let loadable = self.store.get_or_create(&loadable).await;

        if let Some(existing) = self.pins.values().find(|w| w.pin.loadable == loadable) {
            return Some(existing.pin.clone());
        }

        let id = self.next_pin_id;
        self.next_pin_id += 1;
        let pin = Pin::new(id, loadable);
        self.pins.insert(id, Watched::new(pin.clone()));
        self.start_watching(id).await;

        self.persist().await;
        let _ = self.events.send(WatchEvent::PinAdded(pin.clone()));
        Some(pin)
    }

    async fn delete_pin(&mut self, id: PinId) -> bool {
        let Some(mut watched) = self.pins.remove(&id) else {
            return false;
        };
        self.release(&mut watched).await;
        self.persist().await;
        let _ = self.events.send(WatchEvent::PinRemoved(id));
        true
    }

    async fn set_watching(&mut self, id: PinId, watching: bool) -> Option<Pin> {
        let watched = self.pins.get_mut(&id)?;
        watched.pin.watching = watching;
        if watching {
            watched.pin.is_error = false;
            self.start_watching(id).await;
        } else {
            self.stop_watching(id).await;
        }
        let pin = self.pins.get(&id)?.pin.clone();
        self.pin_changed(pin.clone()).await;
        Some(pin)
    }

    async fn start_watching(&mut self, id: PinId) {
        let Some(watched) = self.pins.get_mut(&id) else {
            return;
        };
        if !watched.pin.watching || watched.loader.is_some() {
            return;
        }
        let listener = Arc::new(PinListener {
            pin: id,
            commands: self.commands.clone(),
        });
        let (loader, listener_id) = self.pool.obtain(&watched.pin.loadable, listener).await;
        loader.request_additional_data().await;
        watched.loader = Some((loader, listener_id));
    }

    async fn stop_watching(&mut self, id: PinId) {
        if let Some(mut watched) = self.pins.remove(&id) {
            self.release(&mut watched).await;
            self.pins.insert(id, watched);
        }
    }

    async fn release(&self, watched: &mut Watched) {
        if let Some((loader, listener_id)) = watched.loader.take() {
            self.pool.release(&loader, listener_id).await;
        }
    }

    async fn release_all(&mut self) {
        let ids: Vec<PinId> = self.pins.keys().copied().collect();
        for id in ids {
            self.stop_watching(id).await;
        }
    }

    async fn update(&mut self) -> usize {
        if !self.enabled {
            return 0;
        }
        let loaders: Vec<&ThreadLoader> = self
            .pins
            .values()
            .filter(|watched| watched.pin.watching)
            .filter_map(|watched| watched.loader.as_ref().map(|(loader, _)| loader))
            .collect();
        join_all(loaders.into_iter().map(ThreadLoader::load_more_if_time))
            .await
            .into_iter()
            .filter(|started| *started)
            .count()
    }

    async fn on_loader_data(&mut self, id: PinId, thread: Arc<ChanThread>) {
        let Some(watched) = self.pins.get(&id) else {
            return;
        };
        let saved = self.saved.saved_for_board(&watched.pin.loadable.board).await;
        let quotes: Vec<Post> = thread
            .posts
            .iter()
            .filter(|post| post.replies_to.iter().any(|no| saved.contains(no)))
            .cloned()
            .collect();

        let Some(watched) = self.pins.get_mut(&id) else {
            return;
        };
        let pin = &mut watched.pin;
        pin.is_error = false;
        pin.last_checked = Some(Utc::now());

        if pin.loadable.title.is_empty() && !thread.loadable.title.is_empty() {
            pin.loadable.title = thread.loadable.title.clone();
            self.store.update_loadable(&pin.loadable).await;
        }
        if pin.thumbnail_url.is_none() {
            pin.thumbnail_url = match (&self.media_base, thread.op()) {
                (Some(base), Some(op)) => op.thumbnail_url(base).map(String::from),
                _ => None,
            };
        }

        let post_count = thread.posts.len();
        let quote_count = quotes.len();
        let first_load = pin.watch_new_count.is_none() || pin.quote_new_count.is_none();
        let previous_posts = pin.watch_new_count.unwrap_or(0);
        let previous_quotes = pin.quote_new_count.unwrap_or(0);

        if first_load {
            pin.watch_last_count = post_count;
            pin.quote_last_count = quote_count;
        }
        pin.watch_new_count = Some(post_count);
        pin.quote_new_count = Some(quote_count);

        let mut events = Vec::new();
        if !first_load {
            if post_count > previous_posts {
                events.push(WatchEvent::NewPosts {
                    pin: id,
                    count: pin.new_post_count(),
                });
            }
            if quote_count > previous_quotes {
                events.push(WatchEvent::NewQuotes {
                    pin: id,
                    count: pin.new_quote_count(),
                });
            }
        }
        debug!(
            pin = id,
            post_last = pin.watch_last_count,
            post_new = post_count,
            quote_last = pin.quote_last_count,
            quote_new = quote_count,
            "pin updated"
        );

        let finished = thread.archived || thread.closed;
        if finished {
            pin.archived = true;
            pin.watching = false;
        }

        watched.thread = Some(thread);
        watched.quotes = quotes;
        let pin = watched.pin.clone();

        if finished {
            self.stop_watching(id).await;
        }
        for event in events {
            let _ = self.events.send(event);
        }
        self.pin_changed(pin).await;
    }

    async fn on_loader_error(&mut self, id: PinId, error: &LoaderError) {
        let Some(watched) = self.pins.get_mut(&id) else {
            return;
        };
        warn!(pin = id, %error, "pin load failed");
        watched.pin.is_error = true;
        watched.pin.last_checked = Some(Utc::now());

        let gone = error.is_not_found();
        if gone {
            watched.pin.watching = false;
        }
        let pin = watched.pin.clone();

        if gone {
            self.stop_watching(id).await;
            let _ = self.events.send(WatchEvent::ThreadGone(id));
        }
        self.pin_changed(pin).await;
    }

    async fn pin_changed(&self, pin: Pin) {
        self.persist().await;
        let _ = self.events.send(WatchEvent::PinUpdated(pin));
    }

    async fn persist(&self) {
        let pins: Vec<Pin> = self.pins.values().map(|w| w.pin.clone()).collect();
        self.store.save_pins(&pins).await;
    }
}
