use std::sync::Arc;

use anyhow::Result;

use crate::api::ForumApi;
use crate::config::SyncConfig;
use crate::page::{PageContext, Region, SharedPage};
use crate::scheduler::Task;
use crate::sync::{
    CountsSync, DetailSync, ListingSync, SearchSync, ShoutboxSync, SubmitOutcome, SyncState, Unit,
};

#[derive(Default)]
struct Units {
    shoutbox: Option<Arc<ShoutboxSync>>,
    counts: Option<Arc<CountsSync>>,
    listing: Option<Arc<ListingSync>>,
    detail: Option<Arc<DetailSync>>,
    search: Option<Arc<SearchSync>>,
}

/// Owns the sync units for one page and the timers that drive them.
pub struct ViewController {
    page: SharedPage,
    context: PageContext,
    sync: SyncConfig,
    units: Units,
    poll_counts: bool,
    tasks: Vec<Task>,
}

impl ViewController {
    /// Builds the units the page's anchors call for. Nothing is fetched
    /// until [`ViewController::activate`] or [`ViewController::run_once`].
    pub fn new(
        api: Arc<dyn ForumApi>,
        page: SharedPage,
        context: PageContext,
        sync: SyncConfig,
    ) -> Self {
        let mut units = Units::default();

        let has_shoutbox = page.has(Region::Shoutbox);
        let poll_counts = Region::MARKET_COUNTERS.iter().any(|r| page.has(*r));

        if has_shoutbox {
            units.shoutbox = Some(Arc::new(ShoutboxSync::new(
                api.clone(),
                page.clone(),
                context.current_user.clone(),
                sync.pending_ttl,
            )));
        }
        if has_shoutbox || poll_counts {
            units.counts = Some(Arc::new(CountsSync::new(api.clone(), page.clone())));
        }

        if page.has(Region::CategoryPostsTable) {
            match context.location.category_segments() {
                Some((post_type, category)) => {
                    units.listing = Some(Arc::new(ListingSync::new(
                        api.clone(),
                        page.clone(),
                        post_type,
                        category,
                        context.location.page_param(),
                    )));
                }
                None => tracing::debug!(
                    "category table present but {} names no category",
                    context.location.path
                ),
            }
        }

        if page.has(Region::PostTitle) {
            match (&context.post_type, &context.post_id) {
                (Some(post_type), Some(post_id)) => {
                    units.detail = Some(Arc::new(DetailSync::new(
                        api.clone(),
                        page.clone(),
                        post_type.clone(),
                        post_id.clone(),
                    )));
                }
                _ => tracing::debug!("post detail anchors present without post type and id"),
            }
        }

        if page.has(Region::SearchForm) {
            units.search = Some(Arc::new(SearchSync::new(api, page.clone())));
        }

        Self {
            page,
            context,
            sync,
            units,
            poll_counts,
            tasks: Vec::new(),
        }
    }

    pub fn page(&self) -> &SharedPage {
        &self.page
    }

    pub fn context(&self) -> &PageContext {
        &self.context
    }

    pub fn units(&self) -> Vec<Unit> {
        let mut units = Vec::new();
        if self.units.shoutbox.is_some() {
            units.push(Unit::Shoutbox);
        }
        if self.units.counts.is_some() {
            units.push(Unit::Counts);
        }
        if self.units.listing.is_some() {
            units.push(Unit::Listing);
        }
        if self.units.detail.is_some() {
            units.push(Unit::Detail);
        }
        if self.units.search.is_some() {
            units.push(Unit::Search);
        }
        units
    }

    /// Starts every unit: recurring ones on their timers, the rest once.
    /// Calling it again while active is a no-op.
    pub fn activate(&mut self) -> Result<()> {
        if !self.tasks.is_empty() {
            return Ok(());
        }

        if let Some(shoutbox) = self.units.shoutbox.clone() {
            self.tasks.push(Task::every(
                Unit::Shoutbox.as_str(),
                self.sync.shoutbox_interval,
                move || {
                    shoutbox.run();
                },
            )?);
        }

        if let Some(counts) = self.units.counts.clone() {
            if self.poll_counts {
                self.tasks.push(Task::every(
                    Unit::Counts.as_str(),
                    self.sync.counts_interval,
                    move || {
                        counts.run();
                    },
                )?);
            } else {
                self.tasks.push(Task::once(Unit::Counts.as_str(), move || {
                    counts.run();
                })?);
            }
        }

        if let Some(listing) = self.units.listing.clone() {
            self.tasks.push(Task::once(Unit::Listing.as_str(), move || {
                listing.run();
            })?);
        }

        if let Some(detail) = self.units.detail.clone() {
            self.tasks.push(Task::once(Unit::Detail.as_str(), move || {
                detail.run();
            })?);
        }

        tracing::info!(
            "activated {} task(s) for {}",
            self.tasks.len(),
            self.context.location.path
        );
        Ok(())
    }

    /// One fetch-render cycle of every fetching unit, on the caller's thread.
    pub fn run_once(&self) {
        if let Some(shoutbox) = &self.units.shoutbox {
            shoutbox.run();
        }
        if let Some(counts) = &self.units.counts {
            counts.run();
        }
        if let Some(listing) = &self.units.listing {
            listing.run();
        }
        if let Some(detail) = &self.units.detail {
            detail.run();
        }
    }

    /// `None` when the page has no shoutbox.
    pub fn submit_shout(&self, message: &str) -> Option<SubmitOutcome> {
        self.units
            .shoutbox
            .as_ref()
            .map(|shoutbox| shoutbox.submit(message))
    }

    /// Returns false when the page has no search form.
    pub fn submit_search(&self, query: &str, kind: &str) -> bool {
        match &self.units.search {
            Some(search) => {
                search.run(query, kind);
                true
            }
            None => false,
        }
    }

    pub fn refresh_listing(&self) -> bool {
        self.units
            .listing
            .as_ref()
            .map(|listing| listing.run())
            .unwrap_or(false)
    }

    pub fn state(&self, unit: Unit) -> Option<SyncState> {
        match unit {
            Unit::Shoutbox => self.units.shoutbox.as_ref().map(|u| u.state()),
            Unit::Counts => self.units.counts.as_ref().map(|u| u.state()),
            Unit::Listing => self.units.listing.as_ref().map(|u| u.state()),
            Unit::Detail => self.units.detail.as_ref().map(|u| u.state()),
            Unit::Search => self.units.search.as_ref().map(|u| u.state()),
        }
    }

    pub fn is_active(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Cancels every timer and waits for in-progress cycles to finish.
    pub fn teardown(&mut self) {
        for mut task in self.tasks.drain(..) {
            tracing::debug!("cancelling {} task", task.name());
            task.cancel();
        }
    }
}

impl Drop for ViewController {
    fn drop(&mut self) {
        self.teardown();
    }
}
