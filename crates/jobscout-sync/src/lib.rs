//! Run orchestration: load, fetch, merge, score, save, render.

pub mod config;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jobscout_adapters::{FetchError, JobBoardAdapter, ListingFetcher};
use jobscout_core::ListingStore;
use jobscout_scoring::{GeminiOracle, Scorer, ScoringOracle};
use jobscout_storage::{HttpFetcher, JsonStore, PageSource};
use jobscout_web::{dashboard_stats, write_dashboard, DashboardOptions, DashboardStats};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{ConfigError, RunConfig, SearchConfig};

pub const CRATE_NAME: &str = "jobscout-sync";

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Re-analyse listings that already carry an analysis.
    pub rescore: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub queries_started: usize,
    pub pages_fetched: usize,
    pub parse_failures: usize,
    pub transient_failures: usize,
    pub blocked: bool,
    pub candidates: usize,
    pub new_listings: usize,
    pub duplicates: usize,
    pub descriptions_filled: usize,
    pub scored: usize,
    pub score_failures: usize,
    /// Why scoring stopped early, when it did.
    pub scoring_halted: Option<String>,
    pub total_listings: usize,
    pub dashboard: Option<String>,
    pub relevant: usize,
}

pub struct RunPipeline<'a> {
    search: &'a SearchConfig,
    store: &'a JsonStore,
    pages: &'a dyn PageSource,
    adapter: &'a dyn JobBoardAdapter,
    oracle: &'a dyn ScoringOracle,
    dashboard_path: Option<&'a Path>,
}

#[derive(Debug, Default)]
struct ScoringTally {
    descriptions_filled: usize,
    scored: usize,
    failures: usize,
    halted: Option<String>,
}

impl<'a> RunPipeline<'a> {
    pub fn new(
        search: &'a SearchConfig,
        store: &'a JsonStore,
        pages: &'a dyn PageSource,
        adapter: &'a dyn JobBoardAdapter,
        oracle: &'a dyn ScoringOracle,
    ) -> Self {
        Self {
            search,
            store,
            pages,
            adapter,
            oracle,
            dashboard_path: None,
        }
    }

    pub fn with_dashboard(mut self, path: &'a Path) -> Self {
        self.dashboard_path = Some(path);
        self
    }

    pub async fn run_once(&self, options: RunOptions) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id, board = self.adapter.board_id());
        self.run_inner(run_id, options).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, options: RunOptions) -> Result<RunSummary> {
        let started_at = Utc::now();

        let mut listings = self
            .store
            .load()
            .await
            .with_context(|| format!("loading listing store {}", self.store.path().display()))?;
        info!(existing = listings.len(), "store loaded");

        let fetcher = ListingFetcher::new(self.pages, self.adapter, self.search.max_pages);
        let mut cursor = fetcher.search(self.search.queries());
        let mut added = Vec::new();
        let mut duplicates = 0usize;
        while let Some(candidate) = cursor.next_candidate().await {
            let outcome = listings.merge([candidate], Utc::now());
            duplicates += outcome.duplicates;
            added.extend(outcome.added);
        }
        let fetch = cursor.stats().clone();
        info!(
            pages = fetch.pages_fetched,
            candidates = fetch.candidates,
            new = added.len(),
            duplicates,
            blocked = fetch.blocked,
            "fetch phase finished"
        );

        let tally = self
            .score_pending(&mut listings, &fetcher, &added, options, fetch.blocked)
            .await;

        self.store
            .save(&listings)
            .await
            .with_context(|| format!("saving listing store {}", self.store.path().display()))?;

        let dashboard_options = self.search.dashboard_options();
        let relevant = match self.dashboard_path {
            Some(path) => {
                write_dashboard(path, &listings, dashboard_options, Utc::now())
                    .await
                    .with_context(|| format!("rendering dashboard {}", path.display()))?
                    .relevant
            }
            None => dashboard_stats(&listings, dashboard_options.threshold).relevant,
        };

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            queries_started: fetch.queries_started,
            pages_fetched: fetch.pages_fetched,
            parse_failures: fetch.parse_failures,
            transient_failures: fetch.transient_failures,
            blocked: fetch.blocked,
            candidates: fetch.candidates,
            new_listings: added.len(),
            duplicates,
            descriptions_filled: tally.descriptions_filled,
            scored: tally.scored,
            score_failures: tally.failures,
            scoring_halted: tally.halted,
            total_listings: listings.len(),
            dashboard: self.dashboard_path.map(|p| p.display().to_string()),
            relevant,
        };
        info!(
            scored = summary.scored,
            failures = summary.score_failures,
            total = summary.total_listings,
            "run complete"
        );
        Ok(summary)
    }

    async fn score_pending(
        &self,
        listings: &mut ListingStore,
        fetcher: &ListingFetcher<'_>,
        added: &[String],
        options: RunOptions,
        board_blocked: bool,
    ) -> ScoringTally {
        let profile = self.search.scoring_profile();
        let scorer = Scorer::new(self.oracle, &profile);
        let mut queue = listings.scoring_queue(added, options.rescore);
        if let Some(budget) = self.search.max_scores_per_run {
            if queue.len() > budget {
                debug!(budget, deferred = queue.len() - budget, "scoring budget applied");
                queue.truncate(budget);
            }
        }
        info!(queued = queue.len(), analyzer = scorer.analyzer(), "scoring phase started");

        let mut tally = ScoringTally::default();
        let mut details_blocked = board_blocked;
        for key in queue {
            let needs_description = listings
                .get(&key)
                .is_some_and(|l| l.description.is_none() && l.analysis.is_none());
            let job_id = listings.get(&key).and_then(|l| l.job_id.clone());
            if let (true, false, Some(job_id)) = (needs_description, details_blocked, job_id) {
                match fetcher.fetch_description(&job_id).await {
                    Ok(Some(description)) => {
                        if listings.fill_description(&key, description) {
                            tally.descriptions_filled += 1;
                        }
                    }
                    Ok(None) => debug!(%key, "detail page had no description"),
                    Err(err @ FetchError::Blocked { .. }) => {
                        warn!(error = %err, "detail pages blocked, scoring without descriptions");
                        details_blocked = true;
                    }
                    Err(err) => warn!(%key, error = %err, "description unavailable"),
                }
            }

            let Some(listing) = listings.get(&key).cloned() else {
                continue;
            };
            match scorer.score(&listing).await {
                Ok(analysis) => {
                    info!(%key, score = analysis.score, "listing analysed");
                    if listings.attach_analysis(&key, analysis, options.rescore) {
                        tally.scored += 1;
                    }
                }
                Err(err) if err.halts_scoring() => {
                    warn!(%key, error = %err, "scoring stopped for this run");
                    tally.halted = Some(err.to_string());
                    break;
                }
                Err(err) => {
                    warn!(%key, error = %err, "listing left unscored");
                    tally.failures += 1;
                }
            }
        }
        tally
    }
}

/// Full run wired from the process environment and `search.yaml`.
///
/// Configuration and credentials are checked before the store is touched or any
/// request is made.
pub async fn run_once_from_env(options: RunOptions) -> Result<RunSummary> {
    let config = RunConfig::from_env();
    let search = SearchConfig::load(&config.config_path)
        .await
        .context("loading search configuration")?;
    let gemini = config.gemini_config().context("configuring scoring oracle")?;
    let oracle = GeminiOracle::new(gemini).context("configuring scoring oracle")?;
    let adapter = search
        .linkedin_adapter(config.board_base_url.as_deref())
        .context("configuring job board adapter")?;
    let http = HttpFetcher::new(config.http_client_config(&search)).context("building http client")?;
    let store = JsonStore::new(config.store_path.clone());

    RunPipeline::new(&search, &store, &http, &adapter, &oracle)
        .with_dashboard(&config.dashboard_path)
        .run_once(options)
        .await
}

/// Search settings if the file exists, defaults otherwise. Only the
/// dashboard options are read from it, so validation is skipped.
async fn dashboard_options_from(path: &Path, threshold: Option<u8>) -> Result<DashboardOptions> {
    let mut options = match tokio::fs::try_exists(path).await {
        Ok(true) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            SearchConfig::from_yaml(&text, path)?.dashboard_options()
        }
        _ => {
            debug!(path = %path.display(), "no search configuration, using dashboard defaults");
            DashboardOptions::default()
        }
    };
    if let Some(threshold) = threshold {
        options.threshold = threshold;
    }
    if options.threshold > jobscout_core::MAX_SCORE {
        anyhow::bail!("threshold {} is outside 0..=10", options.threshold);
    }
    Ok(options)
}

/// Re-renders the dashboard from the saved store without touching the network.
pub async fn render_from_env(threshold: Option<u8>) -> Result<(PathBuf, DashboardStats)> {
    let config = RunConfig::from_env();
    let options = dashboard_options_from(&config.config_path, threshold).await?;
    let listings = JsonStore::new(config.store_path.clone())
        .load()
        .await
        .with_context(|| format!("loading listing store {}", config.store_path.display()))?;
    let stats = write_dashboard(&config.dashboard_path, &listings, options, Utc::now())
        .await
        .with_context(|| format!("rendering dashboard {}", config.dashboard_path.display()))?;
    Ok((config.dashboard_path, stats))
}

pub async fn store_stats_from_env() -> Result<(PathBuf, DashboardStats)> {
    let config = RunConfig::from_env();
    let options = dashboard_options_from(&config.config_path, None).await?;
    let listings = JsonStore::new(config.store_path.clone())
        .load()
        .await
        .with_context(|| format!("loading listing store {}", config.store_path.display()))?;
    Ok((config.store_path, dashboard_stats(&listings, options.threshold)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use jobscout_adapters::AdapterError;
    use jobscout_core::{ListingCandidate, SearchQuery};
    use jobscout_scoring::OracleError;
    use jobscout_storage::{FetchedResponse, HttpError, StoreError};
    use jobscout_web::ranked_listings;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Serves each URL back as its own body; the adapter then looks the body up in
    /// its script. Unscripted search pages come back empty.
    #[derive(Default)]
    struct FakeBoard {
        results: HashMap<String, Vec<ListingCandidate>>,
        descriptions: HashMap<String, String>,
        blocked_urls: Vec<String>,
        requests: AtomicUsize,
    }

    impl FakeBoard {
        fn with_page(mut self, keyword: &str, location: &str, page: usize, ids: &[&str]) -> Self {
            let cards = ids.iter().map(|id| card(id)).collect();
            self.results
                .insert(format!("search:{keyword}:{location}:{page}"), cards);
            self
        }

        fn with_description(mut self, id: &str, text: &str) -> Self {
            self.descriptions.insert(format!("detail:{id}"), text.to_string());
            self
        }

        fn requests(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }
    }

    fn card(id: &str) -> ListingCandidate {
        ListingCandidate {
            job_id: Some(id.to_string()),
            title: format!("Alternance {id}"),
            company: "Acme".to_string(),
            location: "Paris".to_string(),
            url: format!("https://www.linkedin.com/jobs/view/{id}"),
            posted_at: None,
            description: None,
            search: None,
        }
    }

    #[async_trait]
    impl PageSource for FakeBoard {
        async fn get_page(&self, url: &str) -> Result<FetchedResponse, HttpError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if self.blocked_urls.iter().any(|u| u == url) {
                return Err(HttpError::Status {
                    status: 999,
                    url: url.to_string(),
                });
            }
            Ok(FetchedResponse {
                status: 200,
                final_url: url.to_string(),
                body: url.as_bytes().to_vec(),
            })
        }
    }

    impl JobBoardAdapter for FakeBoard {
        fn board_id(&self) -> &'static str {
            "fake"
        }

        fn search_url(&self, query: &SearchQuery, page: usize) -> Result<String, AdapterError> {
            Ok(format!("search:{}:{}:{page}", query.keyword, query.location))
        }

        fn detail_url(&self, job_id: &str) -> Result<String, AdapterError> {
            Ok(format!("detail:{job_id}"))
        }

        fn is_blocked(&self, _page: &FetchedResponse) -> bool {
            false
        }

        fn parse_listing(
            &self,
            html: &str,
            query: &SearchQuery,
        ) -> Result<Vec<ListingCandidate>, AdapterError> {
            Ok(self
                .results
                .get(html)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(|c| ListingCandidate {
                    search: Some(query.clone()),
                    ..c
                })
                .collect())
        }

        fn parse_detail(&self, html: &str) -> Result<Option<String>, AdapterError> {
            Ok(self.descriptions.get(html).cloned())
        }
    }

    struct ScriptedOracle {
        replies: Mutex<VecDeque<Result<String, OracleError>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedOracle {
        fn new(replies: Vec<Result<String, OracleError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn scores(scores: &[u8]) -> Self {
            Self::new(scores.iter().map(|s| Ok(score_reply(*s))).collect())
        }

        fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    fn score_reply(score: u8) -> String {
        format!(r#"{{"score": {score}, "verdict": "v{score}", "strengths": [], "weaknesses": [], "recommendation": "r"}}"#)
    }

    #[async_trait]
    impl ScoringOracle for ScriptedOracle {
        fn model(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, prompt: &str) -> Result<String, OracleError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(OracleError::Transient("script exhausted".into())))
        }
    }

    fn search_config() -> SearchConfig {
        SearchConfig {
            keywords: vec!["supply chain".into()],
            locations: vec!["Paris".into()],
            ..SearchConfig::default()
        }
    }

    #[tokio::test]
    async fn new_listings_are_scored_and_ranked() {
        let dir = tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path().join("jobs_database.json"));
        let dashboard = dir.path().join("index.html");
        let board = FakeBoard::default().with_page("supply chain", "Paris", 0, &["1", "2", "3"]);
        let oracle = ScriptedOracle::scores(&[9, 4, 7]);
        let search = search_config();

        let summary = RunPipeline::new(&search, &store, &board, &board, &oracle)
            .with_dashboard(&dashboard)
            .run_once(RunOptions::default())
            .await
            .expect("run");

        assert_eq!(summary.new_listings, 3);
        assert_eq!(summary.scored, 3);
        assert_eq!(summary.relevant, 2);
        assert_eq!(summary.pages_fetched, 2);

        let saved = store.load().await.expect("reload");
        assert_eq!(saved.len(), 3);
        let ranked: Vec<_> = ranked_listings(&saved, 7)
            .iter()
            .map(|l| (l.identity_key.clone(), l.score()))
            .collect();
        assert_eq!(
            ranked,
            vec![
                ("linkedin:1".to_string(), Some(9)),
                ("linkedin:3".to_string(), Some(7)),
            ]
        );
        let first = saved.get("linkedin:1").unwrap();
        assert_eq!(first.analysis.as_ref().unwrap().analyzer, "scripted");
        assert_eq!(first.search, Some(SearchQuery::new("supply chain", "Paris")));

        let html = std::fs::read_to_string(&dashboard).expect("dashboard");
        assert!(html.contains("Alternance 1"));
        assert!(html.contains("Alternance 3"));
        assert!(!html.contains("Alternance 2"));
    }

    #[tokio::test]
    async fn unparseable_analysis_is_retried_next_run() {
        let dir = tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path().join("jobs_database.json"));
        let board = FakeBoard::default().with_page("supply chain", "Paris", 0, &["42"]);
        let search = search_config();

        let first = ScriptedOracle::new(vec![Ok("Great match, 8/10".into())]);
        let summary = RunPipeline::new(&search, &store, &board, &board, &first)
            .run_once(RunOptions::default())
            .await
            .expect("first run");
        assert_eq!(summary.score_failures, 1);
        assert!(!store.load().await.unwrap().get("linkedin:42").unwrap().is_analyzed());

        let second = ScriptedOracle::scores(&[6]);
        let summary = RunPipeline::new(&search, &store, &board, &board, &second)
            .run_once(RunOptions::default())
            .await
            .expect("second run");
        assert_eq!(summary.new_listings, 0);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.scored, 1);

        let saved = store.load().await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved.get("linkedin:42").unwrap().score(), Some(6));
    }

    #[tokio::test]
    async fn quota_exhaustion_keeps_remaining_listings_unscored() {
        let dir = tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path().join("jobs_database.json"));
        let board =
            FakeBoard::default().with_page("supply chain", "Paris", 0, &["1", "2", "3", "4", "5"]);
        let oracle = ScriptedOracle::new(vec![
            Ok(score_reply(8)),
            Err(OracleError::QuotaExceeded("RESOURCE_EXHAUSTED".into())),
            Ok(score_reply(9)),
        ]);
        let search = search_config();

        let summary = RunPipeline::new(&search, &store, &board, &board, &oracle)
            .run_once(RunOptions::default())
            .await
            .expect("run succeeds despite quota");

        assert_eq!(oracle.calls(), 2);
        assert_eq!(summary.scored, 1);
        assert!(summary.scoring_halted.is_some());

        let saved = store.load().await.unwrap();
        assert_eq!(saved.len(), 5);
        assert!(saved.get("linkedin:1").unwrap().is_analyzed());
        for id in ["2", "3", "4", "5"] {
            assert!(!saved.get(&format!("linkedin:{id}")).unwrap().is_analyzed());
        }
    }

    #[tokio::test]
    async fn corrupt_store_aborts_before_fetching() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("jobs_database.json");
        std::fs::write(&path, "{\"linkedin:1\": [unterminated").unwrap();
        let store = JsonStore::new(&path);
        let board = FakeBoard::default().with_page("supply chain", "Paris", 0, &["1"]);
        let oracle = ScriptedOracle::scores(&[9]);
        let search = search_config();

        let err = RunPipeline::new(&search, &store, &board, &board, &oracle)
            .run_once(RunOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Corrupt { .. })
        ));
        assert_eq!(board.requests(), 0);
        assert_eq!(oracle.calls(), 0);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "{\"linkedin:1\": [unterminated"
        );
    }

    #[tokio::test]
    async fn descriptions_are_fetched_before_scoring() {
        let dir = tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path().join("jobs_database.json"));
        let board = FakeBoard::default()
            .with_page("supply chain", "Paris", 0, &["7"])
            .with_description("7", "Pilotage des flux logistiques");
        let oracle = ScriptedOracle::scores(&[8]);
        let search = search_config();

        let summary = RunPipeline::new(&search, &store, &board, &board, &oracle)
            .run_once(RunOptions::default())
            .await
            .expect("run");

        assert_eq!(summary.descriptions_filled, 1);
        assert!(oracle.prompts.lock().unwrap()[0].contains("Pilotage des flux logistiques"));
        let saved = store.load().await.unwrap();
        assert_eq!(
            saved.get("linkedin:7").unwrap().description.as_deref(),
            Some("Pilotage des flux logistiques")
        );
    }

    #[tokio::test]
    async fn blocked_detail_page_still_scores_without_description() {
        let dir = tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path().join("jobs_database.json"));
        let mut board = FakeBoard::default().with_page("supply chain", "Paris", 0, &["1", "2"]);
        board.blocked_urls.push("detail:1".into());
        let oracle = ScriptedOracle::scores(&[5, 6]);
        let search = search_config();

        let summary = RunPipeline::new(&search, &store, &board, &board, &oracle)
            .run_once(RunOptions::default())
            .await
            .expect("run");

        assert_eq!(summary.scored, 2);
        assert_eq!(summary.descriptions_filled, 0);
        // search pages 0 and 1, then one detail request before the wall stops them
        assert_eq!(board.requests(), 3);
        assert!(oracle.prompts.lock().unwrap()[0].contains("Description: Not available"));
    }

    #[tokio::test]
    async fn budget_and_rescore_control_the_queue() {
        let dir = tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path().join("jobs_database.json"));
        let board = FakeBoard::default().with_page("supply chain", "Paris", 0, &["1", "2", "3"]);
        let search = SearchConfig {
            max_scores_per_run: Some(2),
            ..search_config()
        };

        let oracle = ScriptedOracle::scores(&[3, 3, 3]);
        let summary = RunPipeline::new(&search, &store, &board, &board, &oracle)
            .run_once(RunOptions::default())
            .await
            .expect("first run");
        assert_eq!(summary.scored, 2);
        assert_eq!(oracle.calls(), 2);

        let unlimited = search_config();
        let oracle = ScriptedOracle::scores(&[9, 9, 9]);
        let summary = RunPipeline::new(&unlimited, &store, &board, &board, &oracle)
            .run_once(RunOptions { rescore: true })
            .await
            .expect("rescore run");
        assert_eq!(summary.scored, 3);

        let saved = store.load().await.unwrap();
        assert!(saved.listings().all(|l| l.score() == Some(9)));
    }
}
