use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response};
use reqwest::header::{ACCEPT, RETRY_AFTER, USER_AGENT};
use reqwest::redirect::Policy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::FetchError;

/// Read and write operations the page consumes from the forum server.
pub trait ForumApi: Send + Sync {
    fn shoutbox(&self) -> Result<Vec<ShoutboxMessage>, FetchError>;
    fn post_shout(&self, message: &str) -> Result<(), FetchError>;
    fn category_counts(&self) -> Result<CategoryCounts, FetchError>;
    fn posts(
        &self,
        post_type: &str,
        category: &str,
        page: u32,
    ) -> Result<PaginatedListing, FetchError>;
    fn post(&self, post_type: &str, post_id: &str) -> Result<PostDetail, FetchError>;
    fn search(&self, query: &str, kind: &str) -> Result<Vec<SearchResult>, FetchError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShoutboxMessage {
    #[serde(default, deserialize_with = "lenient_string")]
    pub username: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub timestamp: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub message: String,
}

/// Section name to subsection name to count.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CategoryCounts {
    #[serde(default, deserialize_with = "lenient_counts")]
    pub announcements: BTreeMap<String, i64>,
    #[serde(default, deserialize_with = "lenient_counts")]
    pub marketplace: BTreeMap<String, i64>,
    #[serde(default, deserialize_with = "lenient_counts")]
    pub services: BTreeMap<String, i64>,
}

impl CategoryCounts {
    pub fn get(&self, section: &str, subsection: &str) -> i64 {
        let map = match section {
            "announcements" => &self.announcements,
            "marketplace" => &self.marketplace,
            "services" => &self.services,
            _ => return 0,
        };
        map.get(subsection).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostSummary {
    #[serde(deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub title: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub username: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub date: String,
    #[serde(default)]
    pub comments: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaginatedListing {
    pub posts: Vec<PostSummary>,
    pub total_pages: u32,
    pub current_page: u32,
}

impl<'de> Deserialize<'de> for PaginatedListing {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Paged {
            #[serde(default)]
            posts: Vec<PostSummary>,
            #[serde(default)]
            total_pages: u32,
            #[serde(default)]
            current_page: u32,
        }

        // Older servers answer with a bare array and no paging.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Payload {
            Paged(Paged),
            Flat(Vec<PostSummary>),
        }

        Ok(match Payload::deserialize(deserializer)? {
            Payload::Paged(paged) => PaginatedListing {
                posts: paged.posts,
                total_pages: paged.total_pages,
                current_page: paged.current_page,
            },
            Payload::Flat(posts) => PaginatedListing {
                posts,
                total_pages: 1,
                current_page: 1,
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PostBody {
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub content: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub price: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub username: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub date: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub category: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    #[serde(default, deserialize_with = "lenient_string")]
    pub username: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub date: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostDetail {
    pub post: PostBody,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub user: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    #[serde(default, deserialize_with = "lenient_string")]
    pub category: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub post_type: String,
    #[serde(deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub title: String,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub content: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub username: String,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub price: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub date: String,
}

fn value_to_string(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(value_to_string(Value::deserialize(deserializer)?).unwrap_or_default())
}

fn lenient_opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(value_to_string(Value::deserialize(deserializer)?).filter(|s| !s.is_empty()))
}

fn lenient_counts<'de, D>(deserializer: D) -> Result<BTreeMap<String, i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let Value::Object(map) = value else {
        return Ok(BTreeMap::new());
    };
    Ok(map
        .into_iter()
        .filter_map(|(key, value)| value.as_i64().map(|count| (key, count)))
        .collect())
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub base_url: String,
    pub user_agent: String,
    pub timeout: Option<Duration>,
    pub http_client: Option<HttpClient>,
}

pub struct Client {
    http: HttpClient,
    user_agent: String,
    base_url: Url,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.user_agent.trim().is_empty() {
            bail!("forum client user agent required");
        }
        let mut base = config.base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url =
            Url::parse(&base).with_context(|| format!("invalid forum base url {base:?}"))?;
        if base_url.cannot_be_a_base() {
            bail!("forum base url {base:?} cannot carry a path");
        }

        // Login redirects must surface as statuses, not as the login page.
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(config.timeout.unwrap_or(Duration::from_secs(20)))
                .redirect(Policy::none())
                .build()
                .context("build forum http client")?,
        };

        Ok(Client {
            http,
            user_agent: config.user_agent,
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn get<T>(&self, segments: &[&str], params: &[(&str, String)]) -> Result<T, FetchError>
    where
        T: DeserializeOwned,
    {
        let mut url = self.endpoint(segments);
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in params {
                pairs.append_pair(k, v);
            }
        }
        tracing::debug!("GET {}", url);
        self.send(self.http.get(url))
    }

    /// Sends `req`, turning any non-2xx reply into a `Status` error.
    fn execute(&self, req: RequestBuilder) -> Result<Response, FetchError> {
        let resp = req
            .header(USER_AGENT, self.user_agent.clone())
            .header(ACCEPT, "application/json")
            .send()?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.to_string());
            let body = resp.text().unwrap_or_default();
            tracing::debug!("request rejected with {}", status);
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
                retry_after,
            });
        }
        Ok(resp)
    }

    fn send<T>(&self, req: RequestBuilder) -> Result<T, FetchError>
    where
        T: DeserializeOwned,
    {
        let body = self.execute(req)?.text()?;
        if body.trim().is_empty() {
            return serde_json::from_value(Value::Null)
                .map_err(|err| FetchError::Decode(err.to_string()));
        }
        serde_json::from_str(&body).map_err(|err| FetchError::Decode(err.to_string()))
    }
}

impl ForumApi for Client {
    fn shoutbox(&self) -> Result<Vec<ShoutboxMessage>, FetchError> {
        self.get(&["api", "shoutbox"], &[])
    }

    fn post_shout(&self, message: &str) -> Result<(), FetchError> {
        let url = self.endpoint(&["api", "shoutbox"]);
        tracing::debug!("POST {}", url);
        let body = serde_json::json!({ "message": message });
        // Any 2xx means the shout was stored; the reply body is not read.
        self.execute(self.http.post(url).json(&body))?;
        Ok(())
    }

    fn category_counts(&self) -> Result<CategoryCounts, FetchError> {
        self.get(&["api", "category_counts"], &[])
    }

    fn posts(
        &self,
        post_type: &str,
        category: &str,
        page: u32,
    ) -> Result<PaginatedListing, FetchError> {
        self.get(
            &["api", "posts", post_type, category],
            &[("page", page.max(1).to_string())],
        )
    }

    fn post(&self, post_type: &str, post_id: &str) -> Result<PostDetail, FetchError> {
        self.get(&["api", "post", post_type, post_id], &[])
    }

    fn search(&self, query: &str, kind: &str) -> Result<Vec<SearchResult>, FetchError> {
        self.get(
            &["api", "search"],
            &[("query", query.to_string()), ("type", kind.to_string())],
        )
    }
}

/// In-memory `ForumApi` serving queued responses, for offline use and tests.
/// Each operation pops its next queued result; an empty queue repeats the
/// last result that was served.
#[derive(Default)]
pub struct ScriptedApi {
    shoutbox: Script<Vec<ShoutboxMessage>>,
    post_shout: Script<()>,
    counts: Script<CategoryCounts>,
    posts: Script<PaginatedListing>,
    post: Script<PostDetail>,
    search: Script<Vec<SearchResult>>,
    calls: Mutex<Vec<String>>,
}

struct Script<T> {
    queue: Mutex<VecDeque<Result<T, FetchError>>>,
    last: Mutex<Option<Result<T, FetchError>>>,
}

impl<T> Default for Script<T> {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            last: Mutex::new(None),
        }
    }
}

impl<T: Clone> Script<T> {
    fn push(&self, result: Result<T, FetchError>) {
        self.queue.lock().push_back(result);
    }

    fn next(&self) -> Result<T, FetchError> {
        if let Some(result) = self.queue.lock().pop_front() {
            *self.last.lock() = Some(result.clone());
            return result;
        }
        self.last
            .lock()
            .clone()
            .unwrap_or_else(|| Err(FetchError::status(404, "")))
    }
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_shoutbox(&self, result: Result<Vec<ShoutboxMessage>, FetchError>) {
        self.shoutbox.push(result);
    }

    pub fn push_post_shout(&self, result: Result<(), FetchError>) {
        self.post_shout.push(result);
    }

    pub fn push_counts(&self, result: Result<CategoryCounts, FetchError>) {
        self.counts.push(result);
    }

    pub fn push_posts(&self, result: Result<PaginatedListing, FetchError>) {
        self.posts.push(result);
    }

    pub fn push_post(&self, result: Result<PostDetail, FetchError>) {
        self.post.push(result);
    }

    pub fn push_search(&self, result: Result<Vec<SearchResult>, FetchError>) {
        self.search.push(result);
    }

    /// Every call made so far, formatted like `posts marketplace/Buyers?page=2`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

impl ForumApi for ScriptedApi {
    fn shoutbox(&self) -> Result<Vec<ShoutboxMessage>, FetchError> {
        self.record("shoutbox".into());
        self.shoutbox.next()
    }

    fn post_shout(&self, message: &str) -> Result<(), FetchError> {
        self.record(format!("post_shout {message}"));
        // Unscripted posts are accepted.
        if self.post_shout.queue.lock().is_empty() && self.post_shout.last.lock().is_none() {
            return Ok(());
        }
        self.post_shout.next()
    }

    fn category_counts(&self) -> Result<CategoryCounts, FetchError> {
        self.record("category_counts".into());
        self.counts.next()
    }

    fn posts(
        &self,
        post_type: &str,
        category: &str,
        page: u32,
    ) -> Result<PaginatedListing, FetchError> {
        self.record(format!("posts {post_type}/{category}?page={page}"));
        self.posts.next()
    }

    fn post(&self, post_type: &str, post_id: &str) -> Result<PostDetail, FetchError> {
        self.record(format!("post {post_type}/{post_id}"));
        self.post.next()
    }

    fn search(&self, query: &str, kind: &str) -> Result<Vec<SearchResult>, FetchError> {
        self.record(format!("search {query}&type={kind}"));
        self.search.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_encodes_segments() {
        let client = Client::new(ClientConfig {
            base_url: "http://forum.test/board".into(),
            user_agent: "test".into(),
            ..ClientConfig::default()
        })
        .unwrap();
        let url = client.endpoint(&["api", "posts", "announcements", "MM Service"]);
        assert_eq!(
            url.as_str(),
            "http://forum.test/board/api/posts/announcements/MM%20Service"
        );
    }

    #[test]
    fn client_requires_user_agent() {
        assert!(Client::new(ClientConfig {
            base_url: "http://forum.test/".into(),
            ..ClientConfig::default()
        })
        .is_err());
    }

    #[test]
    fn counts_tolerate_missing_sections() {
        let counts: CategoryCounts =
            serde_json::from_str(r#"{"marketplace":{"Buyers":4,"Sellers":null}}"#).unwrap();
        assert_eq!(counts.get("marketplace", "Buyers"), 4);
        assert_eq!(counts.get("marketplace", "Sellers"), 0);
        assert_eq!(counts.get("services", "Buy"), 0);
    }

    #[test]
    fn listing_accepts_flat_array() {
        let listing: PaginatedListing = serde_json::from_str(
            r#"[{"id":1,"title":"Hello","username":"alice","date":"2024-01-01","comments":2}]"#,
        )
        .unwrap();
        assert_eq!(listing.total_pages, 1);
        assert_eq!(listing.current_page, 1);
        assert_eq!(listing.posts[0].id, "1");
    }

    #[test]
    fn detail_accepts_numeric_price() {
        let detail: PostDetail = serde_json::from_str(
            r#"{"post":{"title":"Lamp","description":"Bright","price":25,"username":"bob","date":"d","category":"Sellers"},"comments":[]}"#,
        )
        .unwrap();
        assert_eq!(detail.post.price.as_deref(), Some("25"));
        assert!(detail.user.is_none());
    }

    #[test]
    fn scripted_api_repeats_last_result() {
        let api = ScriptedApi::new();
        api.push_counts(Ok(CategoryCounts::default()));
        assert!(api.category_counts().is_ok());
        assert!(api.category_counts().is_ok());
        assert_eq!(api.calls(), vec!["category_counts", "category_counts"]);
    }
}
