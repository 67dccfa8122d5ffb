use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chan_core::{AppConfig, ChanContext, DownloadCallback, Loadable, WatchEvent};
use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "chan-watch", version, about = "Watch imageboard threads and cache their media")]
struct Cli {
    /// Log filter, overrides RUST_LOG.
    #[arg(long, global = true, env = "CHANWATCH_LOG")]
    log_level: Option<String>,

    /// Config file to use instead of the platform default.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Pin threads given as board/number and print watch events until Ctrl-C.
    Watch { threads: Vec<String> },
    /// List pinned threads.
    Pins,
    /// Remove a pin.
    Unpin { id: u64 },
    /// Download urls into the file cache.
    Download {
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Delete every cached file.
    ClearCache,
    /// Log cache statistics.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let (config, data_dir) = load_config(cli.config.as_deref())?;
    let ctx = ChanContext::build(config, &data_dir)
        .await
        .context("failed to set up services")?;

    match cli.command {
        Command::Watch { threads } => watch(&ctx, &threads).await?,
        Command::Pins => {
            for pin in ctx.watcher.pins().await {
                println!(
                    "{:>4}  /{}/{}  {}  new posts: {}  new quotes: {}{}",
                    pin.id,
                    pin.loadable.board,
                    pin.loadable.no,
                    pin.loadable.title,
                    pin.new_post_count(),
                    pin.new_quote_count(),
                    if pin.watching { "" } else { "  (not watching)" },
                );
            }
        }
        Command::Unpin { id } => {
            if !ctx.watcher.delete_pin(id).await {
                bail!("no pin with id {id}");
            }
        }
        Command::Download { urls } => download(&ctx, urls).await,
        Command::ClearCache => {
            ctx.cache.clear_cache();
            info!("cache cleared");
        }
        Command::Stats => ctx.cache.log_stats(),
    }

    ctx.watcher.shutdown().await;
    Ok(())
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn load_config(path: Option<&Path>) -> Result<(AppConfig, PathBuf)> {
    match path {
        Some(path) => {
            let config = AppConfig::load_from(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            let data_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
            Ok((config, data_dir))
        }
        None => Ok((AppConfig::load(), AppConfig::config_dir()?)),
    }
}

fn parse_thread(spec: &str) -> Result<Loadable> {
    let trimmed = spec.trim_matches('/');
    let Some((board, no)) = trimmed.split_once('/') else {
        bail!("expected board/number, got {spec:?}");
    };
    let no: u64 = no.parse().with_context(|| format!("invalid thread number in {spec:?}"))?;
    Ok(Loadable::for_thread(0, board, no))
}

async fn watch(ctx: &ChanContext, threads: &[String]) -> Result<()> {
    let mut events = ctx.watcher.subscribe();
    for spec in threads {
        let loadable = parse_thread(spec)?;
        match ctx.watcher.create_pin(loadable).await {
            Some(pin) => info!(pin = pin.id, board = %pin.loadable.board, no = pin.loadable.no, "watching"),
            None => warn!(thread = %spec, "could not pin thread"),
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

fn print_event(event: &WatchEvent) {
    match event {
        WatchEvent::PinAdded(pin) => println!("pinned /{}/{} as {}", pin.loadable.board, pin.loadable.no, pin.id),
        WatchEvent::PinRemoved(id) => println!("pin {id} removed"),
        WatchEvent::PinUpdated(pin) => println!(
            "pin {} checked: {} posts{}",
            pin.id,
            pin.watch_new_count.unwrap_or(0),
            if pin.is_error { ", last check failed" } else { "" },
        ),
        WatchEvent::NewPosts { pin, count } => println!("pin {pin}: {count} new posts"),
        WatchEvent::NewQuotes { pin, count } => println!("pin {pin}: {count} new replies to you"),
        WatchEvent::ThreadGone(pin) => println!("pin {pin}: thread is gone"),
    }
}

struct PrintProgress {
    url: String,
    done: mpsc::UnboundedSender<()>,
}

impl DownloadCallback for PrintProgress {
    fn on_progress(&self, downloaded: u64, total: u64, done: bool) {
        if !done {
            println!("{}: {downloaded}/{total}", self.url);
        }
    }

    fn on_success(&self, file: &Path) {
        println!("{} -> {}", self.url, file.display());
        let _ = self.done.send(());
    }

    fn on_fail(&self, not_found: bool) {
        if not_found {
            println!("{}: not found", self.url);
        } else {
            println!("{}: download failed", self.url);
        }
        let _ = self.done.send(());
    }
}

async fn download(ctx: &ChanContext, urls: Vec<String>) {
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let expected = urls.len();
    for url in urls {
        let callback = Arc::new(PrintProgress {
            url: url.clone(),
            done: done_tx.clone(),
        });
        ctx.cache.download_file(&url, callback);
    }
    drop(done_tx);

    let mut finished = 0;
    while finished < expected && done_rx.recv().await.is_some() {
        finished += 1;
    }
}
