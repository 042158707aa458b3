//! GitHub REST API client: repository search plus the three per-repository
//! facet endpoints (topics, languages, readme).
//!
//! All external access goes through the [`HarvestSource`] trait so the
//! pipeline can be driven against scripted doubles in tests.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::HarvestConfig;
use crate::sanitize::sanitize_bytes;

/// One hit from the repository search endpoint.
///
/// Fields the API may omit are defaulted so a sparse record still
/// deserializes; the drop policy downstream decides what is usable.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchRepo {
    pub owner: Option<RepoOwner>,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub name: String,
    pub description: Option<String>,
    pub language: Option<String>,
    #[serde(default)]
    pub stargazers_count: u64,
    #[serde(default)]
    pub watchers_count: u64,
    #[serde(default)]
    pub forks_count: u64,
    #[serde(default)]
    pub open_issues_count: u64,
    #[serde(default)]
    pub fork: bool,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub disabled: bool,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub pushed_at: Option<String>,
    pub homepage: Option<String>,
    pub license: Option<RepoLicense>,
}

impl SearchRepo {
    /// A result is only usable with a non-empty identity.
    pub fn is_valid(&self) -> bool {
        !self.full_name.is_empty() && !self.name.is_empty()
    }

    /// Owner login, falling back to the prefix of `full_name`.
    pub fn owner_login(&self) -> &str {
        match &self.owner {
            Some(o) if !o.login.is_empty() => &o.login,
            _ => self.full_name.split('/').next().unwrap_or(""),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepoOwner {
    #[serde(default)]
    pub login: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepoLicense {
    pub spdx_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchRepo>,
}

#[derive(Debug, Deserialize)]
struct TopicsResponse {
    #[serde(default)]
    names: Vec<String>,
}

/// README content response
#[derive(Debug, Deserialize)]
struct ReadmeResponse {
    content: String,
    encoding: String,
}

/// Remaining/limit quota pair reported in the API response headers.
/// Observed for operator visibility only; nothing throttles on it.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitInfo {
    pub remaining: u64,
    pub limit: u64,
}

impl RateLimitInfo {
    pub fn from_headers(headers: &reqwest::header::HeaderMap) -> Option<Self> {
        let read = |name: &str| -> Option<u64> {
            headers.get(name)?.to_str().ok()?.parse().ok()
        };
        Some(Self {
            remaining: read("x-ratelimit-remaining")?,
            limit: read("x-ratelimit-limit")?,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct RateLimit {
    pub limit: u32,
    pub remaining: u32,
    pub reset: u64,
}

#[derive(Debug, Deserialize)]
pub struct RateLimitResources {
    pub core: RateLimit,
    pub search: RateLimit,
}

#[derive(Debug, Deserialize)]
struct RateLimitResponse {
    resources: RateLimitResources,
}

/// External surface a harvest consumes: one search endpoint and three
/// per-repository facet endpoints, each independently fallible.
#[async_trait]
pub trait HarvestSource: Send + Sync {
    /// Fetch one page of search results plus the rate-limit state the API
    /// reported for that call.
    async fn search_page(
        &self,
        query: &str,
        per_page: usize,
        page: usize,
    ) -> Result<(Vec<SearchRepo>, Option<RateLimitInfo>)>;

    /// Topic labels for one repository.
    async fn topics(&self, owner: &str, name: &str) -> Result<Vec<String>>;

    /// Bytes of code per language for one repository.
    async fn languages(&self, owner: &str, name: &str) -> Result<BTreeMap<String, u64>>;

    /// Decoded primary document, `None` when the repository has none.
    async fn readme(&self, owner: &str, name: &str) -> Result<Option<String>>;
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// GitHub API client
#[derive(Clone)]
pub struct GitHubClient {
    client: reqwest::Client,
    token: Option<String>,
    debug: bool,
}

impl GitHubClient {
    pub fn new(token: Option<String>, debug: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("gh-harvest/0.1.0")
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            token,
            debug,
        })
    }

    /// Build REST request with auth header if token available
    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.get(url);
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }
        req.header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    /// Send REST request with optional debug timing
    async fn send_request(&self, url: &str) -> Result<reqwest::Response, reqwest::Error> {
        let start = std::time::Instant::now();
        let result = self.request(url).send().await;
        if self.debug {
            let now = chrono::Local::now().format("%H:%M:%S%.3f");
            eprintln!(
                "\x1b[90m[{}] GET {} ... {}ms\x1b[0m",
                now,
                url,
                start.elapsed().as_millis()
            );
        }
        result
    }

    /// REST GET with retry on transient and rate-limit errors. Used by the
    /// facet endpoints only; their callers treat any surviving error as
    /// soft. Page fetches never come through here.
    async fn rest_get(&self, url: &str) -> Result<reqwest::Response> {
        for attempt in 0..5 {
            if attempt > 0 {
                let delay = Duration::from_millis(500 * (1 << attempt.min(3)));
                tokio::time::sleep(delay).await;
            }

            let response = match self.send_request(url).await {
                Ok(r) => r,
                Err(e) => {
                    if attempt == 4 {
                        anyhow::bail!("Request failed: {}", e);
                    }
                    continue;
                }
            };

            let status = response.status();

            if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
                return Ok(response);
            }

            // Transient server errors
            if status == reqwest::StatusCode::BAD_GATEWAY
                || status == reqwest::StatusCode::GATEWAY_TIMEOUT
                || status == reqwest::StatusCode::SERVICE_UNAVAILABLE
            {
                continue;
            }

            // Rate limited: wait for the reported reset, capped at 2 min
            if status == reqwest::StatusCode::FORBIDDEN
                || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            {
                let reset = response
                    .headers()
                    .get("x-ratelimit-reset")
                    .and_then(|h| h.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok());
                let now = unix_now();
                let wait_secs = match reset {
                    Some(r) if r > now => (r - now).min(120),
                    _ => 2,
                };
                if self.debug {
                    eprintln!(
                        "\x1b[33m[api]\x1b[0m rate limited ({}), waiting {}s",
                        status, wait_secs
                    );
                }
                tokio::time::sleep(Duration::from_secs(wait_secs)).await;
                continue;
            }

            if attempt == 4 {
                anyhow::bail!("GitHub API error {}", status);
            }
        }

        anyhow::bail!("Request failed after 5 retries")
    }

    /// Current REST quota, for the `rate-limit` subcommand.
    pub async fn rate_limit(&self) -> Result<RateLimitResources> {
        let response = self
            .request("https://api.github.com/rate_limit")
            .send()
            .await
            .context("Failed to check rate limit")?;

        let data: RateLimitResponse = response
            .json()
            .await
            .context("Failed to parse rate limit response")?;
        Ok(data.resources)
    }
}

#[async_trait]
impl HarvestSource for GitHubClient {
    /// Fetch one page of search results. A transport or API error here is
    /// fatal to the harvest, so this is a single attempt with no retry.
    async fn search_page(
        &self,
        query: &str,
        per_page: usize,
        page: usize,
    ) -> Result<(Vec<SearchRepo>, Option<RateLimitInfo>)> {
        let url = "https://api.github.com/search/repositories";
        let per_page_s = per_page.to_string();
        let page_s = page.to_string();

        let start = std::time::Instant::now();
        let response = self
            .request(url)
            .query(&[
                ("q", query),
                ("sort", "stars"),
                ("order", "desc"),
                ("per_page", per_page_s.as_str()),
                ("page", page_s.as_str()),
            ])
            .send()
            .await
            .with_context(|| format!("Search request failed (page {})", page))?;

        if self.debug {
            let now = chrono::Local::now().format("%H:%M:%S%.3f");
            eprintln!(
                "\x1b[90m[{}] GET {}?q={} page={} ... {}ms\x1b[0m",
                now,
                url,
                query,
                page,
                start.elapsed().as_millis()
            );
        }

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("GitHub search API error {} (page {})", status, page);
        }

        let rate = RateLimitInfo::from_headers(response.headers());

        let body: SearchResponse = response
            .json()
            .await
            .context("Failed to parse search response")?;

        Ok((body.items, rate))
    }

    async fn topics(&self, owner: &str, name: &str) -> Result<Vec<String>> {
        let url = format!("https://api.github.com/repos/{}/{}/topics", owner, name);
        let response = self.rest_get(&url).await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }

        let body: TopicsResponse = response
            .json()
            .await
            .context("Failed to parse topics response")?;
        Ok(body.names)
    }

    async fn languages(&self, owner: &str, name: &str) -> Result<BTreeMap<String, u64>> {
        let url = format!("https://api.github.com/repos/{}/{}/languages", owner, name);
        let response = self.rest_get(&url).await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(BTreeMap::new());
        }

        response
            .json()
            .await
            .context("Failed to parse languages response")
    }

    async fn readme(&self, owner: &str, name: &str) -> Result<Option<String>> {
        let url = format!("https://api.github.com/repos/{}/{}/readme", owner, name);
        let response = self.rest_get(&url).await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let body: ReadmeResponse = response
            .json()
            .await
            .context("Failed to parse readme response")?;

        if body.encoding != "base64" {
            return Ok(None);
        }

        // Decode base64 content (GitHub sends it with newlines)
        let cleaned = body.content.replace('\n', "");
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&cleaned)
            .context("Failed to decode readme content")?;

        // Decoded bytes are untrusted; repair rather than reject
        Ok(Some(sanitize_bytes(&decoded)))
    }
}

/// Pull ordered search pages until `target` results are collected, a page
/// comes back empty, or a short page signals the source is exhausted.
///
/// Sort order is whatever the API returned; nothing here re-sorts. Any page
/// error or deadline overrun is fatal to the caller.
pub async fn paginate_search(
    source: &dyn HarvestSource,
    query: &str,
    target: usize,
    config: &HarvestConfig,
) -> Result<Vec<SearchRepo>> {
    let mut repos: Vec<SearchRepo> = Vec::with_capacity(target);
    if target == 0 {
        return Ok(repos);
    }

    let mut page = 1;
    loop {
        let fetch = source.search_page(query, config.page_size, page);
        let (page_repos, rate) = match tokio::time::timeout(config.page_timeout, fetch).await {
            Ok(result) => result.with_context(|| format!("Search page {} failed", page))?,
            Err(_) => anyhow::bail!(
                "Search page {} timed out after {}s",
                page,
                config.page_timeout.as_secs()
            ),
        };

        if page_repos.is_empty() {
            break;
        }

        let count = page_repos.len();
        repos.extend(page_repos);

        let quota = rate
            .map(|r| format!(", quota {}/{}", r.remaining, r.limit))
            .unwrap_or_default();
        eprintln!(
            "\x1b[36m..\x1b[0m page {}: {} results (total {}{})",
            page,
            count,
            repos.len(),
            quota
        );

        if repos.len() >= target {
            repos.truncate(target);
            break;
        }

        // Short page means the source has nothing further
        if count < config.page_size {
            break;
        }

        page += 1;
        tokio::time::sleep(config.page_delay).await;
    }

    Ok(repos)
}

#[cfg(test)]
pub(crate) fn stub_repo(full_name: &str, stars: u64) -> SearchRepo {
    let (owner, name) = full_name.split_once('/').unwrap_or(("", full_name));
    SearchRepo {
        owner: Some(RepoOwner {
            login: owner.to_string(),
        }),
        full_name: full_name.to_string(),
        name: name.to_string(),
        description: Some(format!("{} description", name)),
        language: Some("Go".to_string()),
        stargazers_count: stars,
        watchers_count: stars,
        forks_count: stars / 10,
        open_issues_count: 3,
        created_at: Some("2019-01-01T00:00:00Z".to_string()),
        updated_at: Some("2024-06-01T00:00:00Z".to_string()),
        pushed_at: Some("2024-06-01T00:00:00Z".to_string()),
        homepage: None,
        license: Some(RepoLicense {
            spdx_id: Some("MIT".to_string()),
        }),
        ..SearchRepo::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves a fixed script of pages; anything past the script is empty.
    struct PagedSource {
        pages: Vec<Vec<SearchRepo>>,
        calls: AtomicUsize,
    }

    impl PagedSource {
        fn new(pages: Vec<Vec<SearchRepo>>) -> Self {
            Self {
                pages,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl HarvestSource for PagedSource {
        async fn search_page(
            &self,
            _query: &str,
            _per_page: usize,
            page: usize,
        ) -> Result<(Vec<SearchRepo>, Option<RateLimitInfo>)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((self.pages.get(page - 1).cloned().unwrap_or_default(), None))
        }

        async fn topics(&self, _owner: &str, _name: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn languages(&self, _owner: &str, _name: &str) -> Result<BTreeMap<String, u64>> {
            Ok(BTreeMap::new())
        }

        async fn readme(&self, _owner: &str, _name: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    struct FailingPageSource;

    #[async_trait]
    impl HarvestSource for FailingPageSource {
        async fn search_page(
            &self,
            _query: &str,
            _per_page: usize,
            _page: usize,
        ) -> Result<(Vec<SearchRepo>, Option<RateLimitInfo>)> {
            anyhow::bail!("connection reset")
        }

        async fn topics(&self, _owner: &str, _name: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn languages(&self, _owner: &str, _name: &str) -> Result<BTreeMap<String, u64>> {
            Ok(BTreeMap::new())
        }

        async fn readme(&self, _owner: &str, _name: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    fn test_config(page_size: usize) -> HarvestConfig {
        HarvestConfig {
            page_size,
            page_delay: Duration::from_millis(0),
            ..HarvestConfig::default()
        }
    }

    fn page_of(prefix: &str, n: usize) -> Vec<SearchRepo> {
        (0..n)
            .map(|i| stub_repo(&format!("{}/repo{}", prefix, i), 100))
            .collect()
    }

    #[tokio::test]
    async fn test_pagination_stops_on_short_page() {
        // 90 available when 100 were requested: one call, all 90 yielded.
        let source = PagedSource::new(vec![page_of("a", 90)]);
        let repos = paginate_search(&source, "q", 100, &test_config(100))
            .await
            .unwrap();
        assert_eq!(repos.len(), 90);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pagination_stops_on_empty_page() {
        let source = PagedSource::new(vec![vec![]]);
        let repos = paginate_search(&source, "q", 50, &test_config(100))
            .await
            .unwrap();
        assert!(repos.is_empty());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pagination_truncates_at_target() {
        let source = PagedSource::new(vec![page_of("a", 100), page_of("b", 100)]);
        let repos = paginate_search(&source, "q", 150, &test_config(100))
            .await
            .unwrap();
        assert_eq!(repos.len(), 150);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_pagination_single_page_target() {
        let source = PagedSource::new(vec![page_of("a", 3)]);
        let repos = paginate_search(&source, "q", 3, &test_config(100))
            .await
            .unwrap();
        assert_eq!(repos.len(), 3);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pagination_preserves_rank_order() {
        let mut first = page_of("a", 100);
        first[0].full_name = "top/most-starred".to_string();
        let source = PagedSource::new(vec![first, page_of("b", 50)]);
        let repos = paginate_search(&source, "q", 200, &test_config(100))
            .await
            .unwrap();
        assert_eq!(repos.len(), 150);
        assert_eq!(repos[0].full_name, "top/most-starred");
        assert_eq!(repos[100].full_name, "b/repo0");
    }

    #[tokio::test]
    async fn test_page_error_is_fatal() {
        let err = paginate_search(&FailingPageSource, "q", 10, &test_config(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Search page 1 failed"));
    }

    #[tokio::test]
    async fn test_page_timeout_is_fatal() {
        struct SlowSource;

        #[async_trait]
        impl HarvestSource for SlowSource {
            async fn search_page(
                &self,
                _query: &str,
                _per_page: usize,
                _page: usize,
            ) -> Result<(Vec<SearchRepo>, Option<RateLimitInfo>)> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok((Vec::new(), None))
            }

            async fn topics(&self, _owner: &str, _name: &str) -> Result<Vec<String>> {
                Ok(Vec::new())
            }

            async fn languages(
                &self,
                _owner: &str,
                _name: &str,
            ) -> Result<BTreeMap<String, u64>> {
                Ok(BTreeMap::new())
            }

            async fn readme(&self, _owner: &str, _name: &str) -> Result<Option<String>> {
                Ok(None)
            }
        }

        let config = HarvestConfig {
            page_timeout: Duration::from_millis(50),
            ..test_config(100)
        };
        let err = paginate_search(&SlowSource, "q", 10, &config)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_is_valid_requires_names() {
        assert!(stub_repo("a/b", 1).is_valid());

        let mut nameless = stub_repo("a/b", 1);
        nameless.full_name = String::new();
        assert!(!nameless.is_valid());

        let mut short = stub_repo("a/b", 1);
        short.name = String::new();
        assert!(!short.is_valid());
    }

    #[test]
    fn test_owner_login_falls_back_to_full_name() {
        let mut repo = stub_repo("someone/thing", 1);
        assert_eq!(repo.owner_login(), "someone");

        repo.owner = None;
        assert_eq!(repo.owner_login(), "someone");
    }

    #[test]
    fn test_rate_limit_info_from_headers() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("x-ratelimit-remaining", "28".parse().unwrap());
        headers.insert("x-ratelimit-limit", "30".parse().unwrap());

        let info = RateLimitInfo::from_headers(&headers).unwrap();
        assert_eq!(info.remaining, 28);
        assert_eq!(info.limit, 30);

        headers.remove("x-ratelimit-limit");
        assert!(RateLimitInfo::from_headers(&headers).is_none());
    }
}
