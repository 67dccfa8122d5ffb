use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

const MAX_TITLE_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadableMode {
    Thread,
    Catalog,
}

/// A browsable target: a board catalog (`no == 0`) or a single thread.
///
/// Equality and hashing only look at `(site, board, no)`; the title and
/// scroll hints are informational.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Loadable {
    /// Stable id assigned by the store on first persistence.
    #[serde(default)]
    pub id: Option<u64>,
    pub site: u32,
    pub board: String,
    pub no: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub list_view_index: usize,
    #[serde(default)]
    pub list_view_top: i32,
}

impl Loadable {
    pub fn for_thread(site: u32, board: impl Into<String>, no: u64) -> Self {
        Self {
            id: None,
            site,
            board: board.into(),
            no,
            title: String::new(),
            list_view_index: 0,
            list_view_top: 0,
        }
    }

    pub fn for_catalog(site: u32, board: impl Into<String>) -> Self {
        Self::for_thread(site, board, 0)
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn mode(&self) -> LoadableMode {
        if self.no == 0 {
            LoadableMode::Catalog
        } else {
            LoadableMode::Thread
        }
    }

    pub fn is_thread_mode(&self) -> bool {
        self.mode() == LoadableMode::Thread
    }

    pub fn is_catalog_mode(&self) -> bool {
        self.mode() == LoadableMode::Catalog
    }
}

impl PartialEq for Loadable {
    fn eq(&self, other: &Self) -> bool {
        self.site == other.site && self.board == other.board && self.no == other.no
    }
}

impl Eq for Loadable {}

impl Hash for Loadable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.site.hash(state);
        self.board.hash(state);
        self.no.hash(state);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostImage {
    /// Server-side file name (timestamp based).
    pub server_filename: String,
    /// Name the uploader gave the file.
    pub filename: String,
    pub extension: String,
    pub width: u32,
    pub height: u32,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpMetadata {
    pub sticky: bool,
    pub closed: bool,
    pub archived: bool,
    pub replies: u32,
    pub images: u32,
    pub unique_ips: u32,
    pub last_modified: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub board: String,
    pub no: u64,
    /// Thread number this post belongs to, `0` for the OP itself.
    pub resto: u64,
    pub time: i64,
    pub name: String,
    pub tripcode: Option<String>,
    pub subject: Option<String>,
    /// Raw comment HTML as delivered by the site.
    pub comment: String,
    pub image: Option<PostImage>,
    /// Posts quoted by this post.
    pub replies_to: BTreeSet<u64>,
    /// Posts quoting this post, filled by [`link_replies`].
    pub replies_from: BTreeSet<u64>,
    pub sticky: bool,
    pub closed: bool,
    pub archived: bool,
    pub replies: u32,
    pub images: u32,
    pub unique_ips: u32,
    pub last_modified: i64,
    /// Display title of the owning thread.
    pub title: String,
}

impl Post {
    pub fn new(board: impl Into<String>, no: u64, resto: u64) -> Self {
        Self {
            board: board.into(),
            no,
            resto,
            time: 0,
            name: String::new(),
            tripcode: None,
            subject: None,
            comment: String::new(),
            image: None,
            replies_to: BTreeSet::new(),
            replies_from: BTreeSet::new(),
            sticky: false,
            closed: false,
            archived: false,
            replies: 0,
            images: 0,
            unique_ips: 0,
            last_modified: 0,
            title: String::new(),
        }
    }

    pub fn is_op(&self) -> bool {
        self.resto == 0
    }

    /// Thread number of this post, its own number for an OP.
    pub fn thread_no(&self) -> u64 {
        if self.is_op() {
            self.no
        } else {
            self.resto
        }
    }

    pub fn posted_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.time, 0)
    }

    pub fn op_metadata(&self) -> OpMetadata {
        OpMetadata {
            sticky: self.sticky,
            closed: self.closed,
            archived: self.archived,
            replies: self.replies,
            images: self.images,
            unique_ips: self.unique_ips,
            last_modified: self.last_modified,
        }
    }

    pub fn apply_op_metadata(&mut self, op: &OpMetadata) {
        self.sticky = op.sticky;
        self.closed = op.closed;
        self.archived = op.archived;
        self.replies = op.replies;
        self.images = op.images;
        self.unique_ips = op.unique_ips;
        self.last_modified = op.last_modified;
    }

    pub fn image_url(&self, media_base: &Url) -> Option<Url> {
        let image = self.image.as_ref()?;
        media_base
            .join(&format!(
                "{}/{}{}",
                self.board, image.server_filename, image.extension
            ))
            .ok()
    }

    pub fn thumbnail_url(&self, media_base: &Url) -> Option<Url> {
        let image = self.image.as_ref()?;
        media_base
            .join(&format!("{}/{}s.jpg", self.board, image.server_filename))
            .ok()
    }
}

/// Posts of one loadable, OP first in thread mode.
#[derive(Debug, Clone)]
pub struct ChanThread {
    pub loadable: Loadable,
    pub posts: Vec<Post>,
    pub closed: bool,
    pub archived: bool,
}

impl ChanThread {
    pub fn new(loadable: Loadable) -> Self {
        Self {
            loadable,
            posts: Vec::new(),
            closed: false,
            archived: false,
        }
    }

    pub fn op(&self) -> Option<&Post> {
        self.posts.first()
    }
}

pub type PinId = u64;

/// A watched thread and its unread bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pin {
    pub id: PinId,
    pub loadable: Loadable,
    pub watching: bool,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub watch_last_count: usize,
    /// `None` until the first successful load.
    #[serde(default)]
    pub watch_new_count: Option<usize>,
    #[serde(default)]
    pub quote_last_count: usize,
    #[serde(default)]
    pub quote_new_count: Option<usize>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub last_checked: Option<DateTime<Utc>>,
}

impl Pin {
    pub fn new(id: PinId, loadable: Loadable) -> Self {
        Self {
            id,
            loadable,
            watching: true,
            is_error: false,
            archived: false,
            watch_last_count: 0,
            watch_new_count: None,
            quote_last_count: 0,
            quote_new_count: None,
            thumbnail_url: None,
            last_checked: None,
        }
    }

    pub fn new_post_count(&self) -> usize {
        self.watch_new_count
            .map(|new| new.saturating_sub(self.watch_last_count))
            .unwrap_or(0)
    }

    pub fn new_quote_count(&self) -> usize {
        self.quote_new_count
            .map(|new| new.saturating_sub(self.quote_last_count))
            .unwrap_or(0)
    }

    /// Marks everything seen so far as read.
    pub fn mark_viewed(&mut self) {
        if let Some(new) = self.watch_new_count {
            self.watch_last_count = new;
        }
        if let Some(new) = self.quote_new_count {
            self.quote_last_count = new;
        }
    }
}

/// Fills `replies_from` from the `replies_to` sets of the whole list.
pub fn link_replies(posts: &mut [Post]) {
    let index: HashMap<u64, usize> = posts
        .iter()
        .enumerate()
        .map(|(i, post)| (post.no, i))
        .collect();

    for post in posts.iter_mut() {
        post.replies_from.clear();
    }

    let mut links = Vec::new();
    for post in posts.iter() {
        for target in &post.replies_to {
            if let Some(&i) = index.get(target) {
                links.push((i, post.no));
            }
        }
    }
    for (i, from) in links {
        posts[i].replies_from.insert(from);
    }
}

/// Title shown for a thread: the subject, else the start of the comment.
pub fn derive_title(op: &Post, loadable: &Loadable) -> String {
    if let Some(subject) = op.subject.as_deref().map(str::trim) {
        if !subject.is_empty() {
            return subject.to_string();
        }
    }

    let text = strip_html(&op.comment);
    let text = text.trim();
    if text.is_empty() {
        format!("/{}/{}", loadable.board, loadable.no)
    } else {
        text.chars().take(MAX_TITLE_LEN).collect()
    }
}

fn strip_html(html: &str) -> String {
    static TAG: OnceLock<Regex> = OnceLock::new();
    let tag = TAG.get_or_init(|| Regex::new(r"<[^>]*>").expect("valid tag regex"));
    let without_breaks = html.replace("<br>", " ");
    tag.replace_all(&without_breaks, "")
        .replace("&gt;", ">")
        .replace("&lt;", "<")
        .replace("&quot;", "\"")
        .replace("&#039;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn loadable_identity_ignores_title() {
        let a = Loadable::for_thread(0, "g", 123).with_title("first");
        let b = Loadable::for_thread(0, "g", 123).with_title("second");
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(!set.insert(b));
        assert!(set.insert(Loadable::for_thread(1, "g", 123)));
    }

    #[test]
    fn link_replies_fills_back_references() {
        let mut op = Post::new("g", 1, 0);
        op.replies_to = BTreeSet::new();
        let mut a = Post::new("g", 2, 1);
        a.replies_to = [1].into_iter().collect();
        let mut b = Post::new("g", 3, 1);
        b.replies_to = [1, 2, 99].into_iter().collect();

        let mut posts = vec![op, a, b];
        link_replies(&mut posts);

        assert_eq!(posts[0].replies_from, [2, 3].into_iter().collect());
        assert_eq!(posts[1].replies_from, [3].into_iter().collect());
        assert!(posts[2].replies_from.is_empty());
    }

    #[test]
    fn title_prefers_subject_then_comment() {
        let loadable = Loadable::for_thread(0, "g", 7);
        let mut op = Post::new("g", 7, 0);
        op.comment = "Hello <b>there</b><br>friend &amp; co".into();
        assert_eq!(derive_title(&op, &loadable), "Hello there friend & co");

        op.subject = Some("Subject line".into());
        assert_eq!(derive_title(&op, &loadable), "Subject line");

        let empty = Post::new("g", 7, 0);
        assert_eq!(derive_title(&empty, &loadable), "/g/7");
    }

    #[test]
    fn pin_counts_reset_only_when_viewed() {
        let mut pin = Pin::new(1, Loadable::for_thread(0, "g", 1));
        assert_eq!(pin.new_post_count(), 0);

        pin.watch_last_count = 10;
        pin.watch_new_count = Some(14);
        pin.quote_new_count = Some(2);
        assert_eq!(pin.new_post_count(), 4);
        assert_eq!(pin.new_quote_count(), 2);

        pin.mark_viewed();
        assert_eq!(pin.new_post_count(), 0);
        assert_eq!(pin.new_quote_count(), 0);
    }
}
