//! Job-board adapter contract, fetch error taxonomy and the paginating search cursor.

use std::collections::{HashSet, VecDeque};

use jobscout_core::{identity_key, ListingCandidate, SearchQuery};
use jobscout_storage::{FetchedResponse, HttpError, PageSource};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub mod linkedin;

pub use linkedin::LinkedInGuestAdapter;

pub const CRATE_NAME: &str = "jobscout-adapters";

/// Status codes LinkedIn (and friends) answer with when a guest session hits a wall.
const BLOCKED_STATUSES: [u16; 3] = [401, 403, 999];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector: {0}")]
    Selector(String),
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error("unrecognized page: {0}")]
    UnrecognizedPage(String),
    #[error("job id {0:?} is not numeric")]
    InvalidJobId(String),
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// Rate limit, timeout or server error that survived the retry budget.
    #[error("transient failure fetching {url}: {reason}")]
    Transient { url: String, reason: String },
    /// Auth or verification wall; nothing more will be fetched this run.
    #[error("blocked by job board at {url} (status {status:?})")]
    Blocked { url: String, status: Option<u16> },
    #[error("unrecognized page structure at {url}: {reason}")]
    Parse { url: String, reason: String },
}

pub fn classify_http_error(url: &str, err: &HttpError) -> FetchError {
    match err.status() {
        Some(status) if BLOCKED_STATUSES.contains(&status) => FetchError::Blocked {
            url: url.to_string(),
            status: Some(status),
        },
        _ => FetchError::Transient {
            url: url.to_string(),
            reason: err.to_string(),
        },
    }
}

/// Everything that knows about a particular board's URLs and markup.
pub trait JobBoardAdapter: Send + Sync {
    fn board_id(&self) -> &'static str;

    /// URL of the zero-based `page` of results for `query`.
    fn search_url(&self, query: &SearchQuery, page: usize) -> Result<String, AdapterError>;

    fn detail_url(&self, job_id: &str) -> Result<String, AdapterError>;

    /// Whether a successful response is actually a login or verification wall.
    fn is_blocked(&self, page: &FetchedResponse) -> bool;

    /// Cards on a results page. An empty body is an empty page, not an error.
    fn parse_listing(
        &self,
        html: &str,
        query: &SearchQuery,
    ) -> Result<Vec<ListingCandidate>, AdapterError>;

    fn parse_detail(&self, html: &str) -> Result<Option<String>, AdapterError>;
}

#[derive(Clone, Copy)]
pub struct ListingFetcher<'a> {
    pages: &'a dyn PageSource,
    adapter: &'a dyn JobBoardAdapter,
    max_pages: usize,
}

impl<'a> ListingFetcher<'a> {
    pub fn new(pages: &'a dyn PageSource, adapter: &'a dyn JobBoardAdapter, max_pages: usize) -> Self {
        Self {
            pages,
            adapter,
            max_pages: max_pages.max(1),
        }
    }

    /// Lazily walks every query in order. Nothing is requested until the cursor is polled.
    pub fn search(&self, queries: Vec<SearchQuery>) -> SearchCursor<'a> {
        SearchCursor {
            fetcher: *self,
            pending: queries.into(),
            active: None,
            buffered: VecDeque::new(),
            yielded: HashSet::new(),
            blocked: false,
            stats: FetchStats::default(),
        }
    }

    async fn get(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let page = self
            .pages
            .get_page(url)
            .await
            .map_err(|e| classify_http_error(url, &e))?;
        if self.adapter.is_blocked(&page) {
            return Err(FetchError::Blocked {
                url: page.final_url,
                status: Some(page.status),
            });
        }
        Ok(page)
    }

    pub async fn fetch_page(
        &self,
        query: &SearchQuery,
        page: usize,
    ) -> Result<Vec<ListingCandidate>, FetchError> {
        let url = self
            .adapter
            .search_url(query, page)
            .map_err(|e| FetchError::Transient {
                url: format!("{}:{}/{}", self.adapter.board_id(), query.keyword, query.location),
                reason: e.to_string(),
            })?;
        let response = self.get(&url).await?;
        self.adapter
            .parse_listing(&response.text(), query)
            .map_err(|e| FetchError::Parse {
                url,
                reason: e.to_string(),
            })
    }

    /// Full description text from the posting's detail page.
    pub async fn fetch_description(&self, job_id: &str) -> Result<Option<String>, FetchError> {
        let url = self
            .adapter
            .detail_url(job_id)
            .map_err(|e| FetchError::Transient {
                url: job_id.to_string(),
                reason: e.to_string(),
            })?;
        let response = self.get(&url).await?;
        self.adapter
            .parse_detail(&response.text())
            .map_err(|e| FetchError::Parse {
                url,
                reason: e.to_string(),
            })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchStats {
    pub queries_started: usize,
    pub pages_fetched: usize,
    pub parse_failures: usize,
    pub transient_failures: usize,
    pub blocked: bool,
    pub candidates: usize,
}

struct ActivePair {
    query: SearchQuery,
    next_page: usize,
    seen: HashSet<String>,
}

/// Finite, single-pass sequence of candidates across all queries.
///
/// A pair stops paginating on a page with nothing new for that pair, on `max_pages`,
/// or on a transient failure. A parse failure skips only the page. A block ends the
/// whole cursor.
pub struct SearchCursor<'a> {
    fetcher: ListingFetcher<'a>,
    pending: VecDeque<SearchQuery>,
    active: Option<ActivePair>,
    buffered: VecDeque<ListingCandidate>,
    yielded: HashSet<String>,
    blocked: bool,
    stats: FetchStats,
}

impl<'a> SearchCursor<'a> {
    pub fn stats(&self) -> &FetchStats {
        &self.stats
    }

    pub async fn next_candidate(&mut self) -> Option<ListingCandidate> {
        loop {
            if let Some(candidate) = self.buffered.pop_front() {
                return Some(candidate);
            }
            if self.blocked {
                return None;
            }

            let mut pair = match self.active.take() {
                Some(pair) => pair,
                None => {
                    let query = self.pending.pop_front()?;
                    self.stats.queries_started += 1;
                    info!(keyword = %query.keyword, location = %query.location, "starting search");
                    ActivePair {
                        query,
                        next_page: 0,
                        seen: HashSet::new(),
                    }
                }
            };

            if pair.next_page >= self.fetcher.max_pages {
                debug!(keyword = %pair.query.keyword, location = %pair.query.location, "page limit reached");
                continue;
            }

            let page = pair.next_page;
            pair.next_page += 1;

            match self.fetcher.fetch_page(&pair.query, page).await {
                Ok(candidates) => {
                    self.stats.pages_fetched += 1;
                    let mut new_for_pair = 0usize;
                    for candidate in candidates {
                        let key = identity_key(&candidate);
                        if pair.seen.insert(key.clone()) {
                            new_for_pair += 1;
                            if self.yielded.insert(key) {
                                self.stats.candidates += 1;
                                self.buffered.push_back(candidate);
                            }
                        }
                    }
                    debug!(
                        keyword = %pair.query.keyword,
                        location = %pair.query.location,
                        page,
                        new_for_pair,
                        "page parsed"
                    );
                    if new_for_pair > 0 {
                        self.active = Some(pair);
                    }
                }
                Err(err @ FetchError::Parse { .. }) => {
                    self.stats.parse_failures += 1;
                    warn!(error = %err, page, "skipping unparseable page");
                    self.active = Some(pair);
                }
                Err(err @ FetchError::Transient { .. }) => {
                    self.stats.transient_failures += 1;
                    warn!(
                        error = %err,
                        keyword = %pair.query.keyword,
                        location = %pair.query.location,
                        "giving up on search after retries"
                    );
                }
                Err(err @ FetchError::Blocked { .. }) => {
                    self.stats.blocked = true;
                    self.blocked = true;
                    error!(error = %err, "job board wall hit, no further searches this run");
                }
            }
        }
    }

    pub async fn collect_all(mut self) -> (Vec<ListingCandidate>, FetchStats) {
        let mut out = Vec::new();
        while let Some(candidate) = self.next_candidate().await {
            out.push(candidate);
        }
        (out, self.stats)
    }
}
