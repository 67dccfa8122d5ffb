use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::LoaderError;
use crate::model::{link_replies, Loadable, OpMetadata, Post, PostImage};

/// Result of one thread or catalog fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    /// Thread-level metadata of the OP, separate from the post list.
    pub op: Option<OpMetadata>,
    pub posts: Vec<Post>,
}

/// Source of thread state. `cached` is the previously loaded post list and
/// only serves as a hint for incremental parsing.
#[async_trait]
pub trait ThreadFetcher: Send + Sync {
    async fn fetch(&self, loadable: &Loadable, cached: &[Post]) -> Result<FetchResponse, LoaderError>;
}

/// Fetcher for the read-only 4chan style JSON API.
#[derive(Debug, Clone)]
pub struct HttpThreadFetcher {
    client: Client,
    api_base: Url,
}

impl HttpThreadFetcher {
    pub fn new(client: Client, api_base: &str) -> Result<Self, LoaderError> {
        let mut base = api_base.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        Ok(Self {
            client,
            api_base: Url::parse(&base)?,
        })
    }

    fn url_for(&self, loadable: &Loadable) -> Result<Url, LoaderError> {
        let path = if loadable.is_thread_mode() {
            format!("{}/thread/{}.json", loadable.board, loadable.no)
        } else {
            format!("{}/catalog.json", loadable.board)
        };
        Ok(self.api_base.join(&path)?)
    }
}

#[async_trait]
impl ThreadFetcher for HttpThreadFetcher {
    async fn fetch(&self, loadable: &Loadable, cached: &[Post]) -> Result<FetchResponse, LoaderError> {
        let url = self.url_for(loadable)?;
        debug!(%url, "fetching");
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LoaderError::Status(status.as_u16()));
        }
        let bytes = response.bytes().await?;

        if loadable.is_thread_mode() {
            parse_thread(&loadable.board, &bytes, cached)
        } else {
            parse_catalog(&loadable.board, &bytes)
        }
    }
}

#[derive(Debug, Deserialize)]
struct ThreadJson {
    posts: Vec<PostJson>,
}

#[derive(Debug, Deserialize)]
struct CatalogPageJson {
    #[serde(default)]
    threads: Vec<PostJson>,
}

#[derive(Debug, Deserialize)]
struct PostJson {
    no: u64,
    #[serde(default)]
    resto: u64,
    #[serde(default)]
    time: i64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    trip: Option<String>,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    com: Option<String>,
    #[serde(default)]
    tim: Option<i64>,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    ext: Option<String>,
    #[serde(default)]
    w: u32,
    #[serde(default)]
    h: u32,
    #[serde(default)]
    fsize: u64,
    #[serde(default)]
    sticky: u8,
    #[serde(default)]
    closed: u8,
    #[serde(default)]
    archived: u8,
    #[serde(default)]
    replies: u32,
    #[serde(default)]
    images: u32,
    #[serde(default)]
    unique_ips: u32,
    #[serde(default)]
    last_modified: i64,
}

impl PostJson {
    fn into_post(self, board: &str) -> Post {
        let image = match (self.tim, self.ext) {
            (Some(tim), Some(ext)) => Some(PostImage {
                server_filename: tim.to_string(),
                filename: self.filename.unwrap_or_default(),
                extension: ext,
                width: self.w,
                height: self.h,
                size: self.fsize,
            }),
            _ => None,
        };
        let comment = self.com.unwrap_or_default();
        let mut replies_to = extract_quotes(&comment);
        replies_to.remove(&self.no);

        let mut post = Post::new(board, self.no, self.resto);
        post.time = self.time;
        post.name = self.name.unwrap_or_default();
        post.tripcode = self.trip;
        post.subject = self.sub;
        post.comment = comment;
        post.image = image;
        post.replies_to = replies_to;
        post.sticky = self.sticky != 0;
        post.closed = self.closed != 0;
        post.archived = self.archived != 0;
        post.replies = self.replies;
        post.images = self.images;
        post.unique_ips = self.unique_ips;
        post.last_modified = self.last_modified;
        post
    }
}

/// Parses a thread document, reusing unchanged posts from `cached`.
pub fn parse_thread(board: &str, body: &[u8], cached: &[Post]) -> Result<FetchResponse, LoaderError> {
    let thread: ThreadJson = serde_json::from_slice(body)?;
    let cached: HashMap<u64, &Post> = cached.iter().map(|post| (post.no, post)).collect();

    let mut op = None;
    let mut reused = 0usize;
    let mut posts = Vec::with_capacity(thread.posts.len());
    for raw in thread.posts {
        let parsed = raw.into_post(board);
        if parsed.is_op() {
            op = Some(parsed.op_metadata());
        }
        match cached.get(&parsed.no) {
            Some(old) if old.comment == parsed.comment && old.image == parsed.image => {
                reused += 1;
                posts.push((*old).clone());
            }
            _ => posts.push(parsed),
        }
    }
    debug!(board, total = posts.len(), reused, "parsed thread");

    link_replies(&mut posts);
    Ok(FetchResponse { op, posts })
}

/// Parses a catalog document into one OP per thread.
pub fn parse_catalog(board: &str, body: &[u8]) -> Result<FetchResponse, LoaderError> {
    let pages: Vec<CatalogPageJson> = serde_json::from_slice(body)?;
    let posts = pages
        .into_iter()
        .flat_map(|page| page.threads)
        .map(|raw| raw.into_post(board))
        .collect();
    Ok(FetchResponse { op: None, posts })
}

/// Post numbers referenced by `>>123` quote links.
pub fn extract_quotes(comment: &str) -> BTreeSet<u64> {
    static QUOTE: OnceLock<Regex> = OnceLock::new();
    let quote = QUOTE.get_or_init(|| Regex::new(r"(?:&gt;|>){2}(\d+)").expect("valid quote regex"));
    quote
        .captures_iter(comment)
        .filter_map(|caps| caps.get(1)?.as_str().parse().ok())
        .collect()
}
