//! Fetch-then-render units, one per page region group.
//!
//! Every unit moves `Idle -> Fetching -> Rendered | ErrorRendered` and
//! re-enters `Fetching` on the next tick or trigger. A [`CycleGuard`] keeps
//! responses from landing out of order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;

use crate::api::{ForumApi, ShoutboxMessage};
use crate::error::Failure;
use crate::page::SharedPage;
use crate::render::{self, PendingLine};

pub const GUEST: &str = "Guest";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    #[default]
    Idle,
    Fetching,
    Rendered,
    ErrorRendered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    Shoutbox,
    Counts,
    Listing,
    Detail,
    Search,
}

impl Unit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Unit::Shoutbox => "shoutbox",
            Unit::Counts => "counts",
            Unit::Listing => "listing",
            Unit::Detail => "detail",
            Unit::Search => "search",
        }
    }
}

/// What to do when a cycle starts while an earlier one is still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overlap {
    /// Drop the new cycle; the pending one will render.
    Skip,
    /// Run the new cycle; only the most recently started one may render.
    LatestWins,
}

#[derive(Debug)]
pub struct Ticket(u64);

#[derive(Debug, Default)]
struct GuardState {
    state: SyncState,
    in_flight: usize,
    issued: u64,
    applied: u64,
}

pub struct CycleGuard {
    overlap: Overlap,
    inner: Mutex<GuardState>,
}

impl CycleGuard {
    pub fn new(overlap: Overlap) -> Self {
        Self {
            overlap,
            inner: Mutex::new(GuardState::default()),
        }
    }

    pub fn begin(&self) -> Option<Ticket> {
        let mut inner = self.inner.lock();
        if inner.in_flight > 0 && self.overlap == Overlap::Skip {
            return None;
        }
        inner.in_flight += 1;
        inner.issued += 1;
        inner.state = SyncState::Fetching;
        Some(Ticket(inner.issued))
    }

    /// Runs `apply` only if no newer response has rendered (and, for
    /// `LatestWins`, no newer cycle has started). Returns whether it ran.
    pub fn complete<F>(&self, ticket: Ticket, ok: bool, apply: F) -> bool
    where
        F: FnOnce(),
    {
        let mut inner = self.inner.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        let superseded = self.overlap == Overlap::LatestWins && ticket.0 != inner.issued;
        if ticket.0 <= inner.applied || superseded {
            return false;
        }
        apply();
        inner.applied = ticket.0;
        inner.state = if ok {
            SyncState::Rendered
        } else {
            SyncState::ErrorRendered
        };
        true
    }

    pub fn state(&self) -> SyncState {
        self.inner.lock().state
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Blank input; nothing was sent.
    Ignored,
    /// Accepted by the server; shown as pending until a poll confirms it.
    Sent,
    /// Rejected by the server; the local line was withdrawn.
    Rejected(Failure),
}

struct PendingShout {
    id: u64,
    line: PendingLine,
    submitted_at: Instant,
    /// Matching messages already in the feed when this one was submitted.
    baseline: Vec<ShoutboxMessage>,
}

#[derive(Default)]
struct Feed {
    server: Vec<ShoutboxMessage>,
    pending: Vec<PendingShout>,
    notice: Option<String>,
}

impl Feed {
    fn matches(message: &ShoutboxMessage, line: &PendingLine) -> bool {
        message.username == line.username && message.message == line.message
    }

    /// Drops pending shouts that the server feed now carries, and any that
    /// have waited longer than `ttl`. A shout is confirmed by a matching
    /// entry that was not in the feed at submit time. The server caps the
    /// feed, so a repeat can arrive as its older copy drops off.
    fn reconcile(&mut self, messages: &[ShoutboxMessage], ttl: Duration) {
        self.pending.retain(|pending| {
            let confirmed = messages
                .iter()
                .any(|m| Self::matches(m, &pending.line) && !pending.baseline.contains(m));
            let expired = pending.submitted_at.elapsed() >= ttl;
            if expired && !confirmed {
                tracing::debug!("dropping unconfirmed shout {}", pending.id);
            }
            !confirmed && !expired
        });
    }

    fn render(&self) -> Vec<crate::page::Update> {
        let pending: Vec<PendingLine> = self.pending.iter().map(|p| p.line.clone()).collect();
        let mut updates = render::shoutbox(&self.server, &pending);
        updates.extend(render::shoutbox_status(self.notice.as_deref()));
        updates
    }
}

pub struct ShoutboxSync {
    api: Arc<dyn ForumApi>,
    page: SharedPage,
    user: String,
    pending_ttl: Duration,
    guard: CycleGuard,
    feed: Mutex<Feed>,
    next_id: AtomicU64,
}

impl ShoutboxSync {
    pub fn new(
        api: Arc<dyn ForumApi>,
        page: SharedPage,
        current_user: Option<String>,
        pending_ttl: Duration,
    ) -> Self {
        Self {
            api,
            page,
            user: current_user.unwrap_or_else(|| GUEST.to_string()),
            pending_ttl,
            guard: CycleGuard::new(Overlap::Skip),
            feed: Mutex::new(Feed::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn run(&self) -> bool {
        let Some(ticket) = self.guard.begin() else {
            tracing::debug!("shoutbox poll still in flight, skipping tick");
            return false;
        };
        match self.api.shoutbox() {
            Ok(messages) => self.guard.complete(ticket, true, || {
                let mut feed = self.feed.lock();
                feed.reconcile(&messages, self.pending_ttl);
                feed.server = messages;
                feed.notice = None;
                self.page.apply(feed.render());
            }),
            Err(err) => {
                let failure = err.classify();
                tracing::warn!("Failed to load shoutbox: {err}");
                self.guard.complete(ticket, false, || {
                    let mut feed = self.feed.lock();
                    feed.notice = Some(failure.message());
                    self.page.apply(render::shoutbox_status(feed.notice.as_deref()));
                })
            }
        }
    }

    /// Shows `message` immediately, then posts it. The local line stays
    /// until a poll returns it, the server rejects it, or it times out.
    pub fn submit(&self, message: &str) -> SubmitOutcome {
        let text = message.trim();
        if text.is_empty() {
            return SubmitOutcome::Ignored;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut feed = self.feed.lock();
            let line = PendingLine {
                username: self.user.clone(),
                timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                message: text.to_string(),
            };
            let baseline = feed
                .server
                .iter()
                .filter(|m| Feed::matches(m, &line))
                .cloned()
                .collect();
            feed.pending.insert(
                0,
                PendingShout {
                    id,
                    line,
                    submitted_at: Instant::now(),
                    baseline,
                },
            );
            self.page.apply(feed.render());
        }

        match self.api.post_shout(text) {
            Ok(()) => SubmitOutcome::Sent,
            Err(err) => {
                let failure = err.classify();
                tracing::warn!("Shout was rejected: {err}");
                let mut feed = self.feed.lock();
                feed.pending.retain(|pending| pending.id != id);
                feed.notice = Some(format!("Your message was not posted. {}", failure.message()));
                self.page.apply(feed.render());
                SubmitOutcome::Rejected(failure)
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.feed.lock().pending.len()
    }

    pub fn state(&self) -> SyncState {
        self.guard.state()
    }
}

pub struct CountsSync {
    api: Arc<dyn ForumApi>,
    page: SharedPage,
    guard: CycleGuard,
}

impl CountsSync {
    pub fn new(api: Arc<dyn ForumApi>, page: SharedPage) -> Self {
        Self {
            api,
            page,
            guard: CycleGuard::new(Overlap::Skip),
        }
    }

    /// A failed fetch leaves the displayed counts untouched.
    pub fn run(&self) -> bool {
        let Some(ticket) = self.guard.begin() else {
            tracing::debug!("category counts still in flight, skipping tick");
            return false;
        };
        match self.api.category_counts() {
            Ok(counts) => self.guard.complete(ticket, true, || {
                self.page.apply(render::counts(&counts));
            }),
            Err(err) => {
                tracing::warn!("Failed to load category counts: {err}");
                self.guard.complete(ticket, false, || {})
            }
        }
    }

    pub fn state(&self) -> SyncState {
        self.guard.state()
    }
}

pub struct ListingSync {
    api: Arc<dyn ForumApi>,
    page: SharedPage,
    post_type: String,
    category: String,
    page_number: u32,
    guard: CycleGuard,
}

impl ListingSync {
    pub fn new(
        api: Arc<dyn ForumApi>,
        page: SharedPage,
        post_type: String,
        category: String,
        page_number: u32,
    ) -> Self {
        Self {
            api,
            page,
            post_type,
            category,
            page_number: page_number.max(1),
            guard: CycleGuard::new(Overlap::Skip),
        }
    }

    pub fn run(&self) -> bool {
        let Some(ticket) = self.guard.begin() else {
            return false;
        };
        match self
            .api
            .posts(&self.post_type, &self.category, self.page_number)
        {
            Ok(listing) => self.guard.complete(ticket, true, || {
                self.page
                    .apply(render::listing(&self.post_type, &self.category, &listing));
            }),
            Err(err) => {
                let failure = err.classify();
                tracing::warn!(
                    "Failed to load {}/{} page {}: {err}",
                    self.post_type,
                    self.category,
                    self.page_number
                );
                self.guard.complete(ticket, false, || {
                    self.page.apply(render::listing_failure(&failure));
                })
            }
        }
    }

    pub fn state(&self) -> SyncState {
        self.guard.state()
    }
}

pub struct DetailSync {
    api: Arc<dyn ForumApi>,
    page: SharedPage,
    post_type: String,
    post_id: String,
    guard: CycleGuard,
}

impl DetailSync {
    pub fn new(api: Arc<dyn ForumApi>, page: SharedPage, post_type: String, post_id: String) -> Self {
        Self {
            api,
            page,
            post_type,
            post_id,
            guard: CycleGuard::new(Overlap::Skip),
        }
    }

    pub fn run(&self) -> bool {
        let Some(ticket) = self.guard.begin() else {
            return false;
        };
        match self.api.post(&self.post_type, &self.post_id) {
            Ok(detail) => self.guard.complete(ticket, true, || {
                self.page.apply(render::detail(&self.post_type, &detail));
            }),
            Err(err) => {
                let failure = err.classify();
                tracing::warn!(
                    "Failed to load post {}/{}: {err}",
                    self.post_type,
                    self.post_id
                );
                self.guard.complete(ticket, false, || {
                    self.page.apply(render::detail_failure(&failure));
                })
            }
        }
    }

    pub fn state(&self) -> SyncState {
        self.guard.state()
    }
}

pub struct SearchSync {
    api: Arc<dyn ForumApi>,
    page: SharedPage,
    guard: CycleGuard,
}

impl SearchSync {
    pub fn new(api: Arc<dyn ForumApi>, page: SharedPage) -> Self {
        Self {
            api,
            page,
            guard: CycleGuard::new(Overlap::LatestWins),
        }
    }

    /// Results of an older query never replace those of a newer one.
    pub fn run(&self, query: &str, kind: &str) -> bool {
        let Some(ticket) = self.guard.begin() else {
            return false;
        };
        match self.api.search(query, kind) {
            Ok(results) => self.guard.complete(ticket, true, || {
                self.page.apply(render::search(&results));
            }),
            Err(err) => {
                let failure = err.classify();
                tracing::warn!("Search for {query:?} failed: {err}");
                self.guard.complete(ticket, false, || {
                    self.page.apply(render::search_failure(&failure));
                })
            }
        }
    }

    pub fn state(&self) -> SyncState {
        self.guard.state()
    }
}
