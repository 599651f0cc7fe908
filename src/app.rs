use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::RecvTimeoutError;

use crate::api::{self, ForumApi};
use crate::config;
use crate::controller::ViewController;
use crate::page::{Location, Page, PageContext, Region, SharedPage};
use crate::sync::SubmitOutcome;

#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Page URL or path, e.g. `/category/marketplace/Buyers?page=2`.
    pub location: String,
    pub config_file: Option<PathBuf>,
    pub base_url: Option<String>,
    pub user: Option<String>,
    pub post_type: Option<String>,
    pub post_id: Option<String>,
    pub once: bool,
    pub duration: Option<Duration>,
    pub shout: Option<String>,
    pub search: Option<(String, String)>,
}

pub fn run(options: Options) -> Result<()> {
    let mut cfg = config::load(config::LoadOptions {
        config_file: options.config_file.clone(),
        env_prefix: None,
    })
    .context("load config")?;
    if let Some(base_url) = options.base_url.clone() {
        cfg.server.base_url = base_url;
    }
    if options.user.is_some() {
        cfg.page.current_user = options.user.clone();
    }

    let client = api::Client::new(api::ClientConfig {
        base_url: cfg.server.base_url.clone(),
        user_agent: cfg.server.user_agent.clone(),
        timeout: Some(cfg.server.timeout),
        http_client: None,
    })
    .context("create forum client")?;
    tracing::debug!("using forum at {}", client.base_url());
    let api: Arc<dyn ForumApi> = Arc::new(client);

    let location = Location::parse(&options.location)?;
    let context = hosting_context(&location, &options, cfg.page.current_user.clone());
    let page = SharedPage::new(Page::for_path(&location.path));
    let mut controller = ViewController::new(api, page.clone(), context, cfg.sync.clone());

    if controller.units().is_empty() {
        tracing::warn!("{} has no regions to keep in sync", location.path);
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();

    if options.once {
        controller.run_once();
        submit_actions(&controller, &options);
        write!(out, "{}", format_page(&page.snapshot()))?;
        return Ok(());
    }

    let changes = page.subscribe();
    controller.activate()?;
    submit_actions(&controller, &options);

    let deadline = options.duration.map(|d| Instant::now() + d);
    loop {
        let wait = match deadline {
            Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                Some(left) => left,
                None => break,
            },
            None => Duration::from_secs(3600),
        };
        match changes.recv_timeout(wait) {
            Ok(region) => {
                let snapshot = page.snapshot();
                write!(out, "{}", format_region(&snapshot, region))?;
                out.flush()?;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    controller.teardown();
    Ok(())
}

/// Builds what the server-rendered page would inject: the signed-in user and,
/// on detail pages, the post type and id from the route.
fn hosting_context(location: &Location, options: &Options, user: Option<String>) -> PageContext {
    let on_post_page = location.segment(1).as_deref() == Some("post");
    let post_type = options
        .post_type
        .clone()
        .or_else(|| on_post_page.then(|| location.segment(2)).flatten());
    let post_id = options
        .post_id
        .clone()
        .or_else(|| on_post_page.then(|| location.segment(3)).flatten());
    PageContext::new(location.clone())
        .with_user(user)
        .with_post(post_type, post_id)
}

fn submit_actions(controller: &ViewController, options: &Options) {
    if let Some(message) = options.shout.as_deref() {
        match controller.submit_shout(message) {
            Some(SubmitOutcome::Rejected(failure)) => {
                tracing::warn!("shout rejected: {}", failure.message())
            }
            Some(outcome) => tracing::debug!("shout submitted: {outcome:?}"),
            None => tracing::warn!("this page has no shoutbox"),
        }
    }
    if let Some((query, kind)) = options.search.as_ref() {
        if !controller.submit_search(query, kind) {
            tracing::warn!("this page has no search form");
        }
    }
}

pub fn format_region(page: &Page, region: Region) -> String {
    let mut out = format!("#{}", region.id());
    if let Some(href) = page.href(region) {
        out.push_str(&format!(" -> {href}"));
    }
    if page.is_disabled(region) {
        out.push_str(" [disabled]");
    }
    out.push('\n');
    for line in page.lines(region) {
        out.push_str("  ");
        out.push_str(&line.replace('\t', " | "));
        out.push('\n');
    }
    out
}

pub fn format_page(page: &Page) -> String {
    page.anchors()
        .map(|region| format_region(page, region))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Update;

    #[test]
    fn post_route_supplies_identifiers() {
        let location = Location::parse("/post/marketplace/12").unwrap();
        let context = hosting_context(&location, &Options::default(), Some("alice".into()));
        assert_eq!(context.post_type.as_deref(), Some("marketplace"));
        assert_eq!(context.post_id.as_deref(), Some("12"));
        assert_eq!(context.current_user.as_deref(), Some("alice"));
    }

    #[test]
    fn explicit_identifiers_win() {
        let location = Location::parse("/post/marketplace/12").unwrap();
        let options = Options {
            post_id: Some("99".into()),
            ..Options::default()
        };
        let context = hosting_context(&location, &options, None);
        assert_eq!(context.post_id.as_deref(), Some("99"));
    }

    #[test]
    fn other_routes_supply_no_post() {
        let location = Location::parse("/category/marketplace/Buyers").unwrap();
        let context = hosting_context(&location, &Options::default(), None);
        assert_eq!(context.post_type, None);
        assert_eq!(context.post_id, None);
    }

    #[test]
    fn formats_links_and_rows() {
        let mut page = Page::for_path("/category/a/b");
        page.apply(Update::Html(
            Region::CategoryPostsTable,
            "<tr><td>x</td><td>y</td></tr>".into(),
        ));
        page.apply(Update::Href(Region::NextPage, "/category/a/b?page=2".into()));
        page.apply(Update::Disabled(Region::NextPage, true));
        let text = format_page(&page);
        assert!(text.contains("#category-posts-table\n  x | y\n"));
        assert!(text.contains("#next-page -> /category/a/b?page=2 [disabled]"));
    }
}
