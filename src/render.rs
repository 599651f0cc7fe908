//! Pure projections from fetched data (or a classified failure) to page
//! updates. Nothing here performs I/O.

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

use crate::api::{CategoryCounts, PaginatedListing, PostDetail, SearchResult, ShoutboxMessage};
use crate::error::{rate_limit_message, Failure, LOGIN_REQUIRED};
use crate::page::{Region, Update};

const LISTING_COLUMNS: usize = 5;
const SEARCH_COLUMNS: usize = 6;

/// Post type whose detail body is raw content rather than description + price.
pub const CONTENT_POST_TYPE: &str = "announcements";

const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

pub fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn segment(raw: &str) -> String {
    utf8_percent_encode(raw, SEGMENT).to_string()
}

pub fn category_href(post_type: &str, category: &str) -> String {
    format!("/category/{}/{}", segment(post_type), segment(category))
}

pub fn post_href(post_type: &str, id: &str) -> String {
    format!("/post/{}/{}", segment(post_type), segment(id))
}

pub fn profile_href(username: &str) -> String {
    format!("/profile/{}", segment(username))
}

fn profile_link(username: &str) -> String {
    format!(
        r#"<a href="{}" class="text-light">{}</a>"#,
        escape_html(&profile_href(username)),
        escape_html(username)
    )
}

/// A shout that has been shown locally but not yet seen in a server poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLine {
    pub username: String,
    pub timestamp: String,
    pub message: String,
}

pub fn shout_line(username: &str, timestamp: &str, message: &str) -> String {
    format!(
        "<p><strong>{}</strong> ({}): {}</p>",
        escape_html(username),
        escape_html(timestamp),
        escape_html(message)
    )
}

/// Pending lines come first, newest first, followed by the server feed in
/// the order it arrived.
pub fn shoutbox(messages: &[ShoutboxMessage], pending: &[PendingLine]) -> Vec<Update> {
    let mut html = String::new();
    for line in pending {
        html.push_str(&shout_line(&line.username, &line.timestamp, &line.message));
    }
    for item in messages {
        html.push_str(&shout_line(&item.username, &item.timestamp, &item.message));
    }
    vec![Update::Html(Region::Shoutbox, html)]
}

pub fn shoutbox_status(notice: Option<&str>) -> Vec<Update> {
    let html = match notice {
        Some(text) => format!(r#"<p class="text-warning">{}</p>"#, escape_html(text)),
        None => String::new(),
    };
    vec![Update::Html(Region::ShoutboxStatus, html)]
}

pub fn counts(counts: &CategoryCounts) -> Vec<Update> {
    [
        (Region::AnnouncementsCount, "announcements", "Announcements"),
        (Region::GeneralCount, "announcements", "General"),
        (Region::MmServiceCount, "announcements", "MM Service"),
        (Region::BuyersCount, "marketplace", "Buyers"),
        (Region::SellersCount, "marketplace", "Sellers"),
        (Region::SellServicesCount, "services", "Sell"),
        (Region::BuyServicesCount, "services", "Buy"),
    ]
    .into_iter()
    .map(|(region, section, subsection)| {
        Update::Text(region, counts.get(section, subsection).to_string())
    })
    .collect()
}

fn message_row(columns: usize, message: &str) -> String {
    format!(
        r#"<tr><td colspan="{columns}" class="text-light">{}</td></tr>"#,
        escape_html(message)
    )
}

pub fn listing(post_type: &str, category: &str, data: &PaginatedListing) -> Vec<Update> {
    let mut rows = String::new();
    for item in &data.posts {
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td><a href=\"{}\" class=\"btn btn-outline-secondary btn-sm\">View</a></td></tr>",
            escape_html(&item.title),
            profile_link(&item.username),
            escape_html(&item.date),
            item.comments,
            escape_html(&post_href(post_type, &item.id)),
        ));
    }
    if data.posts.is_empty() {
        rows = message_row(LISTING_COLUMNS, "No posts in this category yet.");
    }

    let total = data.total_pages.max(1);
    let current = data.current_page.max(1);
    let mut updates = vec![
        Update::Html(Region::CategoryPostsTable, rows),
        Update::Html(
            Region::PaginationLinks,
            format!("Page {current} of {total}"),
        ),
    ];
    if data.total_pages > 1 {
        updates.push(Update::Href(
            Region::NextPage,
            format!(
                "{}?page={}",
                category_href(post_type, category),
                current.saturating_add(1)
            ),
        ));
    }
    updates.push(Update::Disabled(
        Region::NextPage,
        data.total_pages <= 1 || current >= data.total_pages,
    ));
    updates
}

/// Message for a table whose fetch failed. Rate limits, unreachable servers
/// and unreadable replies get their own wording; every other rejection reads
/// as a login prompt.
pub fn table_failure_message(failure: &Failure) -> String {
    match failure {
        Failure::Network | Failure::RateLimited { .. } | Failure::Malformed => failure.message(),
        _ => LOGIN_REQUIRED.to_string(),
    }
}

pub fn listing_failure(failure: &Failure) -> Vec<Update> {
    vec![
        Update::Html(
            Region::CategoryPostsTable,
            message_row(LISTING_COLUMNS, &table_failure_message(failure)),
        ),
        Update::Html(Region::PaginationLinks, String::new()),
        Update::Disabled(Region::NextPage, true),
    ]
}

pub fn detail(post_type: &str, data: &PostDetail) -> Vec<Update> {
    let post = &data.post;
    let title = post
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or("Untitled");

    let mut body = String::new();
    if post_type == CONTENT_POST_TYPE {
        let content = post.content.as_deref().or(post.description.as_deref());
        body.push_str(&format!("<p>{}</p>", escape_html(content.unwrap_or(""))));
    } else {
        let description = post.description.as_deref().or(post.content.as_deref());
        body.push_str(&format!("<p>{}</p>", escape_html(description.unwrap_or(""))));
        if let Some(price) = post.price.as_deref() {
            body.push_str(&format!(
                "<p><strong>Price:</strong> {}</p>",
                escape_html(price)
            ));
        }
    }
    body.push_str(&format!(
        r#"<p class="text-muted">Posted by {} on {}</p>"#,
        profile_link(&post.username),
        escape_html(&post.date)
    ));

    let comments = if data.comments.is_empty() {
        r#"<p class="text-muted">No comments yet.</p>"#.to_string()
    } else {
        data.comments
            .iter()
            .map(|comment| {
                format!(
                    r#"<div class="comment"><p><strong>{}</strong> <span class="text-muted">{}</span></p><p>{}</p></div>"#,
                    escape_html(&comment.username),
                    escape_html(&comment.date),
                    escape_html(&comment.content)
                )
            })
            .collect()
    };

    vec![
        Update::Text(Region::PostTitle, title.to_string()),
        Update::Html(Region::PostContent, body),
        Update::Text(Region::PostCategory, post.category.clone()),
        Update::Html(Region::PostComments, comments),
        Update::Href(Region::BackLink, category_href(post_type, &post.category)),
        Update::Text(Region::BackLink, format!("Back to {}", post.category)),
    ]
}

pub fn detail_failure(failure: &Failure) -> Vec<Update> {
    if let Failure::RateLimited { retry_after } = failure {
        return vec![
            Update::Text(Region::PostTitle, "Slow down".to_string()),
            Update::Html(
                Region::PostContent,
                format!(
                    r#"<p>{}</p><p><a href="/" class="text-light">Return home</a></p>"#,
                    escape_html(&rate_limit_message(retry_after.as_deref()))
                ),
            ),
            Update::Text(Region::PostCategory, String::new()),
            Update::Html(Region::PostComments, String::new()),
        ];
    }
    vec![
        Update::Text(Region::PostTitle, "Error".to_string()),
        Update::Html(
            Region::PostContent,
            format!(
                "<p>Failed to load post.</p><p>{}</p>",
                escape_html(&failure.message())
            ),
        ),
        Update::Text(Region::PostCategory, String::new()),
        Update::Html(
            Region::PostComments,
            "<p>Failed to load comments.</p>".to_string(),
        ),
    ]
}

pub fn search(results: &[SearchResult]) -> Vec<Update> {
    if results.is_empty() {
        return vec![Update::Html(
            Region::SearchResults,
            message_row(SEARCH_COLUMNS, "No results found."),
        )];
    }
    let rows = results
        .iter()
        .map(|item| {
            let summary = item
                .description
                .as_deref()
                .or(item.content.as_deref())
                .unwrap_or("");
            format!(
                r#"<tr><td>{}</td><td><a href="{}" class="text-light">{}</a></td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>"#,
                escape_html(&item.category),
                escape_html(&post_href(&item.post_type, &item.id)),
                escape_html(&item.title),
                escape_html(summary),
                profile_link(&item.username),
                escape_html(item.price.as_deref().unwrap_or("")),
                escape_html(&item.date)
            )
        })
        .collect();
    vec![Update::Html(Region::SearchResults, rows)]
}

pub fn search_failure(failure: &Failure) -> Vec<Update> {
    vec![Update::Html(
        Region::SearchResults,
        message_row(SEARCH_COLUMNS, &table_failure_message(failure)),
    )]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Comment, PostBody, PostSummary};
    use crate::page::{Layout, Page};

    fn page_for(path: &str, updates: Vec<Update>) -> Page {
        let mut page = Page::with_anchors(Layout::for_path(path));
        for update in updates {
            page.apply(update);
        }
        page
    }

    fn listing_of(count: usize, current: u32, total: u32) -> PaginatedListing {
        PaginatedListing {
            posts: (0..count)
                .map(|i| PostSummary {
                    id: i.to_string(),
                    title: format!("Post {i}"),
                    username: "alice".into(),
                    date: "2024-01-01".into(),
                    comments: i as i64,
                })
                .collect(),
            total_pages: total,
            current_page: current,
        }
    }

    #[test]
    fn shoutbox_renders_one_line_per_message() {
        let page = page_for(
            "/",
            shoutbox(
                &[ShoutboxMessage {
                    username: "alice".into(),
                    timestamp: "2024-01-01T00:00:00Z".into(),
                    message: "hi".into(),
                }],
                &[],
            ),
        );
        assert_eq!(
            page.lines(Region::Shoutbox),
            vec!["alice (2024-01-01T00:00:00Z): hi"]
        );
        assert!(page.html(Region::Shoutbox).contains("<strong>alice</strong>"));
    }

    #[test]
    fn shoutbox_escapes_markup() {
        let updates = shoutbox(
            &[ShoutboxMessage {
                username: "<script>".into(),
                timestamp: "t".into(),
                message: "a & b".into(),
            }],
            &[],
        );
        let Update::Html(_, html) = &updates[0] else {
            panic!("expected html update");
        };
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("a &amp; b"));
    }

    #[test]
    fn counts_default_missing_keys_to_zero() {
        let mut data = CategoryCounts::default();
        data.marketplace.insert("Buyers".into(), 7);
        let page = page_for("/marketplace", counts(&data));
        assert_eq!(page.text(Region::BuyersCount), "7");
        assert_eq!(page.text(Region::SellersCount), "0");

        let home = page_for("/", counts(&data));
        for region in [
            Region::AnnouncementsCount,
            Region::GeneralCount,
            Region::MmServiceCount,
        ] {
            assert_eq!(home.text(region), "0");
        }
    }

    #[test]
    fn middle_page_links_forward() {
        let page = page_for(
            "/category/marketplace/Buyers",
            listing("marketplace", "Buyers", &listing_of(2, 2, 3)),
        );
        assert_eq!(page.text(Region::PaginationLinks), "Page 2 of 3");
        assert_eq!(
            page.href(Region::NextPage),
            Some("/category/marketplace/Buyers?page=3")
        );
        assert!(!page.is_disabled(Region::NextPage));
        assert_eq!(page.row_count(Region::CategoryPostsTable), 2);
    }

    #[test]
    fn next_page_disabled_at_or_past_last_page() {
        for (current, total) in [(3, 3), (4, 3), (1, 1), (1, 0), (0, 0)] {
            let page = page_for(
                "/category/services/Sell",
                listing("services", "Sell", &listing_of(1, current, total)),
            );
            assert!(
                page.is_disabled(Region::NextPage),
                "page {current} of {total} should disable next"
            );
        }
    }

    #[test]
    fn single_page_sets_no_link() {
        let page = page_for(
            "/category/services/Sell",
            listing("services", "Sell", &listing_of(1, 1, 1)),
        );
        assert_eq!(page.href(Region::NextPage), None);
        assert_eq!(page.text(Region::PaginationLinks), "Page 1 of 1");
    }

    #[test]
    fn category_with_space_is_encoded_in_links() {
        let updates = listing("announcements", "MM Service", &listing_of(1, 1, 2));
        assert!(updates.contains(&Update::Href(
            Region::NextPage,
            "/category/announcements/MM%20Service?page=2".into()
        )));
    }

    #[test]
    fn rows_link_to_profile_and_detail() {
        let page = page_for(
            "/category/marketplace/Sellers",
            listing("marketplace", "Sellers", &listing_of(1, 1, 1)),
        );
        let html = page.html(Region::CategoryPostsTable);
        assert!(html.contains(r#"href="/profile/alice""#));
        assert!(html.contains(r#"href="/post/marketplace/0""#));
        assert_eq!(
            page.lines(Region::CategoryPostsTable),
            vec!["Post 0\talice\t2024-01-01\t0\tView"]
        );
    }

    #[test]
    fn empty_listing_is_not_an_error() {
        let page = page_for(
            "/category/marketplace/Buyers",
            listing("marketplace", "Buyers", &listing_of(0, 1, 1)),
        );
        assert_eq!(
            page.text(Region::CategoryPostsTable),
            "No posts in this category yet."
        );
    }

    #[test]
    fn listing_failure_replaces_every_row() {
        let mut page = page_for(
            "/category/marketplace/Buyers",
            listing("marketplace", "Buyers", &listing_of(4, 1, 2)),
        );
        for update in listing_failure(&Failure::Server { status: 500 }) {
            page.apply(update);
        }
        assert_eq!(page.row_count(Region::CategoryPostsTable), 1);
        assert!(page
            .html(Region::CategoryPostsTable)
            .contains(r#"colspan="5""#));
        assert_eq!(page.text(Region::CategoryPostsTable), LOGIN_REQUIRED);
        assert!(page.is_disabled(Region::NextPage));
    }

    #[test]
    fn table_failures_special_case_rate_limits() {
        let message = table_failure_message(&Failure::RateLimited {
            retry_after: Some("10s".into()),
        });
        assert!(message.contains("10s"));
        assert_eq!(table_failure_message(&Failure::NotFound), LOGIN_REQUIRED);
    }

    #[test]
    fn unreadable_reply_is_not_a_login_prompt() {
        let message = table_failure_message(&Failure::Malformed);
        assert_ne!(message, LOGIN_REQUIRED);
        assert_eq!(message, Failure::Malformed.message());
    }

    #[test]
    fn last_representable_page_does_not_overflow() {
        let updates = listing("services", "Sell", &listing_of(1, u32::MAX, 3));
        assert!(updates.contains(&Update::Href(
            Region::NextPage,
            format!("/category/services/Sell?page={}", u32::MAX)
        )));
        assert!(updates.contains(&Update::Disabled(Region::NextPage, true)));
    }

    fn detail_of(post: PostBody, comments: Vec<Comment>) -> PostDetail {
        PostDetail {
            post,
            comments,
            user: None,
        }
    }

    #[test]
    fn detail_for_marketplace_shows_description_and_price() {
        let data = detail_of(
            PostBody {
                title: Some("Lamp".into()),
                description: Some("Bright lamp".into()),
                price: Some("$20".into()),
                username: "bob".into(),
                date: "2024-02-02".into(),
                category: "Sellers".into(),
                ..PostBody::default()
            },
            vec![Comment {
                username: "carol".into(),
                date: "2024-02-03".into(),
                content: "Still available?".into(),
            }],
        );
        let page = page_for("/post/marketplace/1", detail("marketplace", &data));
        assert_eq!(page.text(Region::PostTitle), "Lamp");
        assert_eq!(
            page.lines(Region::PostContent),
            vec!["Bright lamp", "Price: $20", "Posted by bob on 2024-02-02"]
        );
        assert_eq!(page.text(Region::PostCategory), "Sellers");
        assert_eq!(
            page.lines(Region::PostComments),
            vec!["carol 2024-02-03", "Still available?"]
        );
        assert_eq!(
            page.href(Region::BackLink),
            Some("/category/marketplace/Sellers")
        );
        assert_eq!(page.text(Region::BackLink), "Back to Sellers");
    }

    #[test]
    fn detail_for_announcements_uses_raw_content() {
        let data = detail_of(
            PostBody {
                content: Some("Welcome".into()),
                price: Some("ignored".into()),
                username: "admin".into(),
                date: "d".into(),
                category: "General".into(),
                ..PostBody::default()
            },
            vec![],
        );
        let page = page_for("/post/announcements/1", detail("announcements", &data));
        assert_eq!(page.text(Region::PostTitle), "Untitled");
        assert!(!page.text(Region::PostContent).contains("Price"));
        assert!(page.text(Region::PostContent).starts_with("Welcome"));
        assert_eq!(page.text(Region::PostComments), "No comments yet.");
    }

    #[test]
    fn detail_rate_limit_includes_hint_and_home_link() {
        let page = page_for(
            "/post/services/2",
            detail_failure(&Failure::RateLimited {
                retry_after: Some("30s".into()),
            }),
        );
        assert!(page.text(Region::PostContent).contains("30s"));
        assert!(page.html(Region::PostContent).contains(r#"href="/""#));

        let page = page_for(
            "/post/services/2",
            detail_failure(&Failure::RateLimited { retry_after: None }),
        );
        assert!(page.text(Region::PostContent).contains("try again later"));
    }

    #[test]
    fn detail_generic_failure_marks_each_region() {
        let page = page_for("/post/services/2", detail_failure(&Failure::NotFound));
        assert_eq!(page.text(Region::PostTitle), "Error");
        assert!(page.text(Region::PostContent).starts_with("Failed to load post."));
        assert_eq!(page.text(Region::PostComments), "Failed to load comments.");
    }

    #[test]
    fn search_rows_have_six_columns() {
        let results = vec![SearchResult {
            category: "Buyers".into(),
            post_type: "marketplace".into(),
            id: "9".into(),
            title: "Need GPU".into(),
            description: None,
            content: Some("Looking for one".into()),
            username: "dave".into(),
            price: None,
            date: "2024-03-03".into(),
        }];
        let page = page_for("/search", search(&results));
        assert_eq!(
            page.lines(Region::SearchResults),
            vec!["Buyers\tNeed GPU\tLooking for one\tdave\t\t2024-03-03"]
        );
        assert!(page
            .html(Region::SearchResults)
            .contains(r#"href="/post/marketplace/9""#));

        let failed = page_for("/search", search_failure(&Failure::Unauthorized));
        assert!(failed.html(Region::SearchResults).contains(r#"colspan="6""#));
        assert_eq!(failed.text(Region::SearchResults), LOGIN_REQUIRED);
    }
}
