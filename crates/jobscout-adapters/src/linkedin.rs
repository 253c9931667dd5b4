//! LinkedIn guest job-search surface (`/jobs-guest/jobs/api/...`).
//!
//! The markup is undocumented and changes without notice; everything that knows about
//! it lives in this file.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use jobscout_core::{ListingCandidate, SearchQuery};
use jobscout_storage::FetchedResponse;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::{AdapterError, JobBoardAdapter};

pub const DEFAULT_BASE_URL: &str = "https://www.linkedin.com";
pub const DEFAULT_PAGE_SIZE: usize = 25;

const SEARCH_PATH: &str = "/jobs-guest/jobs/api/seeMoreJobPostings/search";
const POSTING_PATH: &str = "/jobs-guest/jobs/api/jobPosting";
const WALL_MARKERS: [&str; 3] = ["/authwall", "/checkpoint", "/uas/login"];

#[derive(Debug, Clone)]
pub struct LinkedInGuestAdapter {
    base_url: String,
    keyword_suffix: Option<String>,
    filters: BTreeMap<String, String>,
    page_size: usize,
}

impl Default for LinkedInGuestAdapter {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            keyword_suffix: None,
            filters: BTreeMap::new(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl LinkedInGuestAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_keyword_suffix(mut self, suffix: Option<String>) -> Self {
        self.keyword_suffix = suffix.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_filters(mut self, filters: BTreeMap<String, String>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Absolute http(s) link with query and fragment removed. Anything else
    /// (`javascript:`, `data:`, unparseable) is rejected.
    fn listing_link(&self, href: &str) -> Option<String> {
        let base = Url::parse(&self.base_url).ok()?;
        let mut url = base.join(href.trim()).ok()?;
        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }
        url.set_query(None);
        url.set_fragment(None);
        Some(url.to_string())
    }

    fn keywords_param(&self, query: &SearchQuery) -> String {
        match &self.keyword_suffix {
            Some(suffix) => format!("{} {}", query.keyword.trim(), suffix.trim()),
            None => query.keyword.trim().to_string(),
        }
    }
}

impl JobBoardAdapter for LinkedInGuestAdapter {
    fn board_id(&self) -> &'static str {
        "linkedin"
    }

    fn search_url(&self, query: &SearchQuery, page: usize) -> Result<String, AdapterError> {
        let start = (page * self.page_size).to_string();
        let mut params = vec![
            ("keywords".to_string(), self.keywords_param(query)),
            ("location".to_string(), query.location.trim().to_string()),
        ];
        params.extend(
            self.filters
                .iter()
                .filter(|(k, _)| !matches!(k.as_str(), "keywords" | "location" | "start"))
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        params.push(("start".to_string(), start));

        let url = Url::parse_with_params(&format!("{}{SEARCH_PATH}", self.base_url), &params)?;
        Ok(url.to_string())
    }

    fn detail_url(&self, job_id: &str) -> Result<String, AdapterError> {
        let id = numeric_id(job_id).ok_or_else(|| AdapterError::InvalidJobId(job_id.to_string()))?;
        let mut url = Url::parse(&format!("{}{POSTING_PATH}", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| AdapterError::InvalidJobId(job_id.to_string()))?
            .pop_if_empty()
            .push(&id);
        Ok(url.to_string())
    }

    fn is_blocked(&self, page: &FetchedResponse) -> bool {
        WALL_MARKERS.iter().any(|m| page.final_url.contains(m))
    }

    fn parse_listing(
        &self,
        html: &str,
        query: &SearchQuery,
    ) -> Result<Vec<ListingCandidate>, AdapterError> {
        if html.trim().is_empty() {
            return Ok(Vec::new());
        }

        let document = Html::parse_document(html);
        let card_sel = selector("li")?;
        let base_card_sel = selector("div.base-card, div.job-search-card")?;
        let title_sel = selector(".base-search-card__title")?;
        let company_sel = selector(".base-search-card__subtitle")?;
        let location_sel = selector(".job-search-card__location")?;
        let link_sel = selector("a.base-card__full-link")?;
        let time_sel = selector("time")?;

        let cards = document.select(&card_sel).collect::<Vec<_>>();
        if cards.is_empty() {
            return Err(AdapterError::UnrecognizedPage(
                "no job cards in non-empty page".to_string(),
            ));
        }

        let mut candidates = Vec::new();
        for card in &cards {
            let base_card = card.select(&base_card_sel).next();
            let job_id = base_card
                .and_then(|c| c.value().attr("data-entity-urn"))
                .and_then(job_id_from_urn)
                .or_else(|| {
                    card.value()
                        .attr("data-occludable-job-id")
                        .and_then(numeric_id)
                });

            let (Some(job_id), Some(title), Some(company)) = (
                job_id,
                first_text(card, &title_sel),
                first_text(card, &company_sel),
            ) else {
                continue;
            };

            let url = first_attr(card, &link_sel, "href")
                .and_then(|href| self.listing_link(&href))
                .unwrap_or_else(|| format!("{}/jobs/view/{job_id}", self.base_url));
            let posted_at = first_attr(card, &time_sel, "datetime")
                .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok());

            candidates.push(ListingCandidate {
                job_id: Some(job_id),
                title,
                company,
                location: first_text(card, &location_sel).unwrap_or_default(),
                url,
                posted_at,
                description: None,
                search: Some(query.clone()),
            });
        }

        if candidates.is_empty() {
            return Err(AdapterError::UnrecognizedPage(format!(
                "{} cards found but none carried id, title and company",
                cards.len()
            )));
        }
        Ok(candidates)
    }

    fn parse_detail(&self, html: &str) -> Result<Option<String>, AdapterError> {
        let document = Html::parse_document(html);
        for css in [".description__text", ".show-more-less-html__markup"] {
            let sel = selector(css)?;
            if let Some(node) = document.select(&sel).next() {
                let text = node
                    .text()
                    .flat_map(str::split_whitespace)
                    .collect::<Vec<_>>()
                    .join(" ");
                if let Some(text) = text_or_none(text) {
                    return Ok(Some(text));
                }
            }
        }
        Ok(None)
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn first_text(scope: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope.select(sel).next().and_then(|n| {
        text_or_none(
            n.text()
                .flat_map(str::split_whitespace)
                .collect::<Vec<_>>()
                .join(" "),
        )
    })
}

fn first_attr(scope: &ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

fn numeric_id(raw: &str) -> Option<String> {
    let id = raw.trim();
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_digit())).then(|| id.to_string())
}

/// `urn:li:jobPosting:3812345678` -> `3812345678`
fn job_id_from_urn(urn: &str) -> Option<String> {
    urn.rsplit(':').next().and_then(numeric_id)
}
