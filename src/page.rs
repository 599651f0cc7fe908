//! In-memory model of the forum page: named regions that sync units write
//! into, plus the values the hosting page supplies before any sync starts.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use percent_encoding::percent_decode_str;
use regex::Regex;
use url::Url;

use crate::render::escape_html;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Region {
    Shoutbox,
    ShoutboxForm,
    ShoutboxStatus,
    AnnouncementsCount,
    GeneralCount,
    MmServiceCount,
    BuyersCount,
    SellersCount,
    SellServicesCount,
    BuyServicesCount,
    CategoryPostsTable,
    PaginationLinks,
    NextPage,
    PostTitle,
    PostContent,
    PostCategory,
    PostComments,
    BackLink,
    SearchForm,
    SearchResults,
}

impl Region {
    pub const COUNTERS: [Region; 7] = [
        Region::AnnouncementsCount,
        Region::GeneralCount,
        Region::MmServiceCount,
        Region::BuyersCount,
        Region::SellersCount,
        Region::SellServicesCount,
        Region::BuyServicesCount,
    ];

    /// Counter slots whose presence marks a marketplace or services page.
    pub const MARKET_COUNTERS: [Region; 4] = [
        Region::BuyersCount,
        Region::SellersCount,
        Region::SellServicesCount,
        Region::BuyServicesCount,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            Region::Shoutbox => "shoutbox",
            Region::ShoutboxForm => "shoutbox-form",
            Region::ShoutboxStatus => "shoutbox-status",
            Region::AnnouncementsCount => "announcements-count",
            Region::GeneralCount => "general-count",
            Region::MmServiceCount => "mm-service-count",
            Region::BuyersCount => "buyers-count",
            Region::SellersCount => "sellers-count",
            Region::SellServicesCount => "sell-services-count",
            Region::BuyServicesCount => "buy-services-count",
            Region::CategoryPostsTable => "category-posts-table",
            Region::PaginationLinks => "pagination-links",
            Region::NextPage => "next-page",
            Region::PostTitle => "post-title",
            Region::PostContent => "post-content",
            Region::PostCategory => "post-category",
            Region::PostComments => "post-comments",
            Region::BackLink => "back-link",
            Region::SearchForm => "search-form",
            Region::SearchResults => "search-results",
        }
    }
}

/// A single write against one region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    /// Replace the region's markup.
    Html(Region, String),
    /// Replace the region's content with escaped plain text.
    Text(Region, String),
    Href(Region, String),
    Disabled(Region, bool),
}

impl Update {
    pub fn region(&self) -> Region {
        match self {
            Update::Html(region, _)
            | Update::Text(region, _)
            | Update::Href(region, _)
            | Update::Disabled(region, _) => *region,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionState {
    pub html: String,
    pub href: Option<String>,
    pub disabled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Page {
    regions: BTreeMap<Region, RegionState>,
}

impl Page {
    pub fn with_anchors(anchors: impl IntoIterator<Item = Region>) -> Self {
        Self {
            regions: anchors
                .into_iter()
                .map(|region| (region, RegionState::default()))
                .collect(),
        }
    }

    pub fn for_path(path: &str) -> Self {
        Self::with_anchors(Layout::for_path(path))
    }

    pub fn has(&self, region: Region) -> bool {
        self.regions.contains_key(&region)
    }

    pub fn anchors(&self) -> impl Iterator<Item = Region> + '_ {
        self.regions.keys().copied()
    }

    /// Writes to regions the page does not contain are dropped.
    pub fn apply(&mut self, update: Update) -> bool {
        let Some(state) = self.regions.get_mut(&update.region()) else {
            return false;
        };
        match update {
            Update::Html(_, html) => state.html = html,
            Update::Text(_, text) => state.html = escape_html(&text),
            Update::Href(_, href) => state.href = Some(href),
            Update::Disabled(_, disabled) => state.disabled = disabled,
        }
        true
    }

    pub fn region(&self, region: Region) -> Option<&RegionState> {
        self.regions.get(&region)
    }

    pub fn html(&self, region: Region) -> &str {
        self.region(region).map(|s| s.html.as_str()).unwrap_or("")
    }

    pub fn href(&self, region: Region) -> Option<&str> {
        self.region(region).and_then(|s| s.href.as_deref())
    }

    pub fn is_disabled(&self, region: Region) -> bool {
        self.region(region).map(|s| s.disabled).unwrap_or(false)
    }

    /// Visible text, one entry per block element (paragraph, row, comment).
    pub fn lines(&self, region: Region) -> Vec<String> {
        text_lines(self.html(region))
    }

    pub fn text(&self, region: Region) -> String {
        self.lines(region).join("\n")
    }

    pub fn row_count(&self, region: Region) -> usize {
        ROW_RE.find_iter(self.html(region)).count()
    }
}

static BLOCK_END_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</(p|tr|div|li)>|<br\s*/?>").expect("block regex"));
static CELL_END_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)</td>").expect("cell regex"));
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("tag regex"));
static ROW_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<tr[\s>]").expect("row regex"));

fn text_lines(html: &str) -> Vec<String> {
    BLOCK_END_RE
        .split(html)
        .map(|block| {
            let cells = CELL_END_RE.replace_all(block, "\t");
            let stripped = TAG_RE.replace_all(&cells, "");
            unescape_html(stripped.trim_matches(|c: char| c.is_whitespace()))
        })
        .filter(|line| !line.is_empty())
        .collect()
}

fn unescape_html(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Anchors each server-rendered page template provides.
pub struct Layout;

impl Layout {
    pub fn for_path(path: &str) -> BTreeSet<Region> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let anchors: &[Region] = match segments.as_slice() {
            [] => &[
                Region::Shoutbox,
                Region::ShoutboxForm,
                Region::ShoutboxStatus,
                Region::AnnouncementsCount,
                Region::GeneralCount,
                Region::MmServiceCount,
            ],
            ["marketplace"] => &[Region::BuyersCount, Region::SellersCount],
            ["services"] => &[Region::SellServicesCount, Region::BuyServicesCount],
            ["search"] => &[Region::SearchForm, Region::SearchResults],
            ["category", _, _] => &[
                Region::CategoryPostsTable,
                Region::PaginationLinks,
                Region::NextPage,
            ],
            ["post", _, _] => &[
                Region::PostTitle,
                Region::PostContent,
                Region::PostCategory,
                Region::PostComments,
                Region::BackLink,
            ],
            _ => &[],
        };
        anchors.iter().copied().collect()
    }
}

/// The URL the page was loaded from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Location {
    pub path: String,
    pub query: Vec<(String, String)>,
}

impl Location {
    /// Accepts either a full URL or an origin-relative path with query.
    pub fn parse(input: &str) -> Result<Self> {
        let base = Url::parse("http://localhost/").context("location: base url")?;
        let url = base
            .join(input.trim())
            .with_context(|| format!("location: invalid url {input:?}"))?;
        Ok(Self {
            path: url.path().to_string(),
            query: url.query_pairs().into_owned().collect(),
        })
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Requested listing page; anything missing or unusable means page 1.
    pub fn page_param(&self) -> u32 {
        self.query_param("page")
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            .filter(|page| *page >= 1)
            .unwrap_or(1)
    }

    /// `(post_type, category)` from the third and fourth path segments.
    pub fn category_segments(&self) -> Option<(String, String)> {
        let mut parts = self.path.split('/');
        let post_type = parts.nth(2)?;
        let category = parts.next()?;
        if post_type.is_empty() || category.is_empty() {
            return None;
        }
        Some((decode_segment(post_type), decode_segment(category)))
    }

    pub fn segment(&self, index: usize) -> Option<String> {
        self.path
            .split('/')
            .nth(index)
            .filter(|s| !s.is_empty())
            .map(decode_segment)
    }
}

fn decode_segment(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

/// Values the hosting page injects before the controller starts.
#[derive(Debug, Clone, Default)]
pub struct PageContext {
    pub location: Location,
    pub current_user: Option<String>,
    pub post_type: Option<String>,
    pub post_id: Option<String>,
}

impl PageContext {
    pub fn new(location: Location) -> Self {
        Self {
            location,
            ..Self::default()
        }
    }

    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.current_user = user.filter(|u| !u.trim().is_empty());
        self
    }

    pub fn with_post(mut self, post_type: Option<String>, post_id: Option<String>) -> Self {
        self.post_type = post_type.filter(|v| !v.is_empty());
        self.post_id = post_id.filter(|v| !v.is_empty());
        self
    }
}

/// Page shared between sync units; every applied write is announced to
/// subscribers by region.
#[derive(Clone)]
pub struct SharedPage {
    page: Arc<Mutex<Page>>,
    watchers: Arc<Mutex<Vec<Sender<Region>>>>,
}

impl SharedPage {
    pub fn new(page: Page) -> Self {
        Self {
            page: Arc::new(Mutex::new(page)),
            watchers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn apply(&self, updates: Vec<Update>) {
        let mut touched = BTreeSet::new();
        {
            let mut page = self.page.lock();
            for update in updates {
                let region = update.region();
                if page.apply(update) {
                    touched.insert(region);
                }
            }
        }
        if touched.is_empty() {
            return;
        }
        let mut watchers = self.watchers.lock();
        watchers.retain(|tx| touched.iter().all(|region| tx.send(*region).is_ok()));
    }

    pub fn subscribe(&self) -> Receiver<Region> {
        let (tx, rx) = unbounded();
        self.watchers.lock().push(tx);
        rx
    }

    pub fn has(&self, region: Region) -> bool {
        self.page.lock().has(region)
    }

    pub fn snapshot(&self) -> Page {
        self.page.lock().clone()
    }

    pub fn text(&self, region: Region) -> String {
        self.page.lock().text(region)
    }

    pub fn html(&self, region: Region) -> String {
        self.page.lock().html(region).to_string()
    }
}
