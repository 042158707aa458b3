//! Concurrent enrichment: fan out facet fetches over the search results and
//! assemble the final records.
//!
//! Facet failures are soft. A repository that loses all three facets still
//! comes out the other end with its base fields intact; only the search
//! pages themselves can fail a harvest.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::config::HarvestConfig;
use crate::github::{HarvestSource, SearchRepo};
use crate::sanitize::{cap_document, sanitize_str};

/// Per-repository enrichment payload. A missing facet is its empty value,
/// never an absent record.
#[derive(Debug, Clone, Default)]
pub struct Facets {
    pub topics: Vec<String>,
    pub languages: BTreeMap<String, u64>,
    pub readme: Option<String>,
}

/// Fully assembled repository record: the base search fields plus whichever
/// facets survived. Immutable once built; a later harvest replaces the
/// stored row wholesale rather than merging into it.
#[derive(Debug, Clone, Serialize)]
pub struct Repository {
    pub full_name: String,
    pub owner: String,
    pub name: String,
    pub description: Option<String>,
    pub language: Option<String>,
    pub stars: u64,
    pub watchers: u64,
    pub forks: u64,
    pub open_issues: u64,
    pub fork: bool,
    pub archived: bool,
    pub disabled: bool,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub pushed_at: Option<String>,
    pub homepage: Option<String>,
    pub license: Option<String>,
    pub topics: Vec<String>,
    pub languages: BTreeMap<String, u64>,
    pub readme: Option<String>,
}

/// Collapse a deadline-wrapped facet result to its value, logging and
/// falling back to the empty value on error or timeout.
fn facet_or_default<T: Default>(
    result: Result<anyhow::Result<T>, tokio::time::error::Elapsed>,
    full_name: &str,
    facet: &str,
    deadline: Duration,
) -> T {
    match result {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            eprintln!("  \x1b[33m!\x1b[0m {} {}: {}", full_name, facet, e);
            T::default()
        }
        Err(_) => {
            eprintln!(
                "  \x1b[33m!\x1b[0m {} {}: timed out after {}s",
                full_name,
                facet,
                deadline.as_secs()
            );
            T::default()
        }
    }
}

/// Fetch the three facets for one repository, each under its own deadline.
/// The calls run concurrently; a failure in one never blocks the others.
pub async fn fetch_facets(
    source: &dyn HarvestSource,
    repo: &SearchRepo,
    deadline: Duration,
) -> Facets {
    let owner = repo.owner_login();

    let (topics, languages, readme) = tokio::join!(
        timeout(deadline, source.topics(owner, &repo.name)),
        timeout(deadline, source.languages(owner, &repo.name)),
        timeout(deadline, source.readme(owner, &repo.name)),
    );

    Facets {
        topics: facet_or_default(topics, &repo.full_name, "topics", deadline),
        languages: facet_or_default(languages, &repo.full_name, "languages", deadline),
        readme: facet_or_default(readme, &repo.full_name, "readme", deadline),
    }
}

/// Merge one search hit with its facets into the final record.
///
/// Deterministic: the same base and facets always produce the same record.
/// Every free-text field passes through the sanitizer once more on the way
/// in, and the document is capped here so nothing oversized reaches
/// persistence.
pub fn assemble(base: &SearchRepo, facets: Facets, doc_cap: usize) -> Repository {
    Repository {
        full_name: sanitize_str(&base.full_name),
        owner: sanitize_str(base.owner_login()),
        name: sanitize_str(&base.name),
        description: base.description.as_deref().map(sanitize_str),
        language: base.language.as_deref().map(sanitize_str),
        stars: base.stargazers_count,
        watchers: base.watchers_count,
        forks: base.forks_count,
        open_issues: base.open_issues_count,
        fork: base.fork,
        archived: base.archived,
        disabled: base.disabled,
        created_at: base.created_at.clone(),
        updated_at: base.updated_at.clone(),
        pushed_at: base.pushed_at.clone(),
        homepage: base.homepage.as_deref().map(sanitize_str),
        license: base
            .license
            .as_ref()
            .and_then(|l| l.spdx_id.as_deref())
            .map(sanitize_str),
        topics: facets.topics.iter().map(|t| sanitize_str(t)).collect(),
        languages: facets
            .languages
            .into_iter()
            .map(|(k, v)| (sanitize_str(&k), v))
            .collect(),
        readme: facets
            .readme
            .as_deref()
            .map(|r| cap_document(&sanitize_str(r), doc_cap)),
    }
}

/// Enrich every search hit and return the assembled batch.
///
/// One semaphore permit covers the whole facet triplet for a repository, so
/// at most `pool` repositories are in flight at once across the entire run.
pub async fn enrich_all(
    source: &dyn HarvestSource,
    repos: Vec<SearchRepo>,
    config: &HarvestConfig,
) -> Vec<Repository> {
    let pool = config.pool.max(1);
    let deadline = config.facet_timeout;
    let doc_cap = config.doc_cap;
    let total = repos.len();
    let semaphore = Arc::new(Semaphore::new(pool));
    let completed = Arc::new(AtomicUsize::new(0));

    let futures = repos.into_iter().map(|base| {
        let semaphore = Arc::clone(&semaphore);
        let completed = Arc::clone(&completed);
        async move {
            // Acquire semaphore permit (limits concurrency)
            let _permit = semaphore.acquire().await.unwrap();

            let facets = fetch_facets(source, &base, deadline).await;

            let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
            if done % 25 == 0 || done == total {
                eprintln!("\x1b[90m..\x1b[0m enriched {}/{}", done, total);
            }

            assemble(&base, facets, doc_cap)
        }
    });

    stream::iter(futures)
        .buffer_unordered(pool) // semaphore enforces the same bound; this caps polled futures
        .collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::{stub_repo, RateLimitInfo};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn go_languages() -> BTreeMap<String, u64> {
        let mut map = BTreeMap::new();
        map.insert("Go".to_string(), 120_000);
        map.insert("Makefile".to_string(), 800);
        map
    }

    /// Counts concurrent facet triplets via the topics call, which every
    /// triplet makes exactly once while holding its permit.
    struct CountingSource {
        current: AtomicUsize,
        peak: AtomicUsize,
        served: AtomicUsize,
    }

    impl CountingSource {
        fn new() -> Self {
            Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                served: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl HarvestSource for CountingSource {
        async fn search_page(
            &self,
            _query: &str,
            _per_page: usize,
            _page: usize,
        ) -> Result<(Vec<SearchRepo>, Option<RateLimitInfo>)> {
            Ok((Vec::new(), None))
        }

        async fn topics(&self, _owner: &str, _name: &str) -> Result<Vec<String>> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            self.served.fetch_add(1, Ordering::SeqCst);
            Ok(vec!["tool".to_string()])
        }

        async fn languages(&self, _owner: &str, _name: &str) -> Result<BTreeMap<String, u64>> {
            Ok(go_languages())
        }

        async fn readme(&self, _owner: &str, _name: &str) -> Result<Option<String>> {
            Ok(Some("# readme".to_string()))
        }
    }

    /// Readme errors out; the other two facets succeed.
    struct FailingDocSource;

    #[async_trait]
    impl HarvestSource for FailingDocSource {
        async fn search_page(
            &self,
            _query: &str,
            _per_page: usize,
            _page: usize,
        ) -> Result<(Vec<SearchRepo>, Option<RateLimitInfo>)> {
            Ok((Vec::new(), None))
        }

        async fn topics(&self, _owner: &str, _name: &str) -> Result<Vec<String>> {
            Ok(vec!["cli".to_string(), "terminal".to_string()])
        }

        async fn languages(&self, _owner: &str, _name: &str) -> Result<BTreeMap<String, u64>> {
            Ok(go_languages())
        }

        async fn readme(&self, _owner: &str, _name: &str) -> Result<Option<String>> {
            anyhow::bail!("decode failed")
        }
    }

    /// Every facet fails.
    struct AllFailSource;

    #[async_trait]
    impl HarvestSource for AllFailSource {
        async fn search_page(
            &self,
            _query: &str,
            _per_page: usize,
            _page: usize,
        ) -> Result<(Vec<SearchRepo>, Option<RateLimitInfo>)> {
            Ok((Vec::new(), None))
        }

        async fn topics(&self, _owner: &str, _name: &str) -> Result<Vec<String>> {
            anyhow::bail!("boom")
        }

        async fn languages(&self, _owner: &str, _name: &str) -> Result<BTreeMap<String, u64>> {
            anyhow::bail!("boom")
        }

        async fn readme(&self, _owner: &str, _name: &str) -> Result<Option<String>> {
            anyhow::bail!("boom")
        }
    }

    /// Readme hangs past any reasonable deadline; the rest respond fast.
    struct SlowDocSource;

    #[async_trait]
    impl HarvestSource for SlowDocSource {
        async fn search_page(
            &self,
            _query: &str,
            _per_page: usize,
            _page: usize,
        ) -> Result<(Vec<SearchRepo>, Option<RateLimitInfo>)> {
            Ok((Vec::new(), None))
        }

        async fn topics(&self, _owner: &str, _name: &str) -> Result<Vec<String>> {
            Ok(vec!["database".to_string()])
        }

        async fn languages(&self, _owner: &str, _name: &str) -> Result<BTreeMap<String, u64>> {
            Ok(go_languages())
        }

        async fn readme(&self, _owner: &str, _name: &str) -> Result<Option<String>> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Some("too late".to_string()))
        }
    }

    fn test_config(pool: usize) -> HarvestConfig {
        HarvestConfig {
            pool,
            facet_timeout: Duration::from_millis(200),
            ..HarvestConfig::default()
        }
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrent_triplets() {
        let source = CountingSource::new();
        let repos: Vec<_> = (0..20).map(|i| stub_repo(&format!("o/r{}", i), 10)).collect();

        let batch = enrich_all(&source, repos, &test_config(3)).await;

        assert_eq!(batch.len(), 20);
        assert_eq!(source.served.load(Ordering::SeqCst), 20);
        assert!(
            source.peak.load(Ordering::SeqCst) <= 3,
            "peak {} exceeded pool of 3",
            source.peak.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_failed_facet_leaves_others_intact() {
        let repos = vec![stub_repo("a/one", 50), stub_repo("a/two", 60)];

        let batch = enrich_all(&FailingDocSource, repos, &test_config(5)).await;

        assert_eq!(batch.len(), 2);
        for repo in &batch {
            assert_eq!(repo.topics, vec!["cli", "terminal"]);
            assert_eq!(repo.languages.get("Go"), Some(&120_000));
            assert!(repo.readme.is_none());
        }
    }

    #[tokio::test]
    async fn test_all_facets_failing_still_yields_record() {
        let repos = vec![stub_repo("a/bare", 7)];

        let batch = enrich_all(&AllFailSource, repos, &test_config(5)).await;

        assert_eq!(batch.len(), 1);
        let repo = &batch[0];
        assert_eq!(repo.full_name, "a/bare");
        assert_eq!(repo.stars, 7);
        assert!(repo.topics.is_empty());
        assert!(repo.languages.is_empty());
        assert!(repo.readme.is_none());
    }

    #[tokio::test]
    async fn test_facet_timeout_degrades_to_empty() {
        let repos = vec![stub_repo("a/slow", 5)];

        let batch = enrich_all(&SlowDocSource, repos, &test_config(5)).await;

        assert_eq!(batch.len(), 1);
        assert!(batch[0].readme.is_none());
        assert_eq!(batch[0].topics, vec!["database"]);
        assert!(!batch[0].languages.is_empty());
    }

    #[tokio::test]
    async fn test_empty_input_yields_empty_batch() {
        let batch = enrich_all(&AllFailSource, Vec::new(), &test_config(5)).await;
        assert!(batch.is_empty());
    }

    #[test]
    fn test_assemble_merges_base_and_facets() {
        let base = stub_repo("acme/widget", 4200);
        let facets = Facets {
            topics: vec!["cli".to_string()],
            languages: go_languages(),
            readme: Some("# Widget".to_string()),
        };

        let repo = assemble(&base, facets, 10_000);

        assert_eq!(repo.full_name, "acme/widget");
        assert_eq!(repo.owner, "acme");
        assert_eq!(repo.name, "widget");
        assert_eq!(repo.stars, 4200);
        assert_eq!(repo.license.as_deref(), Some("MIT"));
        assert_eq!(repo.topics, vec!["cli"]);
        assert_eq!(repo.readme.as_deref(), Some("# Widget"));
    }

    #[test]
    fn test_assemble_caps_long_document() {
        let base = stub_repo("acme/widget", 1);
        let facets = Facets {
            readme: Some("x".repeat(50)),
            ..Facets::default()
        };

        let repo = assemble(&base, facets, 20);

        let readme = repo.readme.unwrap();
        assert_eq!(readme.chars().count(), 20);
        assert!(readme.ends_with("[truncated]"));
    }

    #[test]
    fn test_assemble_is_deterministic() {
        let base = stub_repo("acme/widget", 99);
        let facets = Facets {
            topics: vec!["a".to_string(), "b".to_string()],
            languages: go_languages(),
            readme: Some("same every time".to_string()),
        };

        let first = assemble(&base, facets.clone(), 10_000);
        let second = assemble(&base, facets, 10_000);

        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }
}
