//! Core domain model for JobScout: listings, analyses, and the in-memory store.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "jobscout-core";

/// Highest score the scoring oracle may assign.
pub const MAX_SCORE: u8 = 10;

/// One (keyword, location) search issued against the job board.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchQuery {
    pub keyword: String,
    pub location: String,
}

impl SearchQuery {
    pub fn new(keyword: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
            location: location.into(),
        }
    }
}

/// Raw listing as extracted from a search results page, before it enters the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingCandidate {
    pub job_id: Option<String>,
    pub title: String,
    pub company: String,
    pub location: String,
    pub url: String,
    pub posted_at: Option<NaiveDate>,
    pub description: Option<String>,
    pub search: Option<SearchQuery>,
}

/// Relevance assessment returned by the scoring oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    pub score: u8,
    #[serde(default)]
    pub verdict: String,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
    #[serde(default)]
    pub recommendation: String,
    pub analyzed_at: DateTime<Utc>,
    pub analyzer: String,
}

/// Persisted job posting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub identity_key: String,
    #[serde(default)]
    pub job_id: Option<String>,
    pub title: String,
    pub company: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub description: Option<String>,
    pub url: String,
    #[serde(default)]
    pub posted_at: Option<NaiveDate>,
    #[serde(default)]
    pub search: Option<SearchQuery>,
    pub first_seen_at: DateTime<Utc>,
    #[serde(default)]
    pub analysis: Option<Analysis>,
}

impl Listing {
    pub fn from_candidate(candidate: ListingCandidate, first_seen_at: DateTime<Utc>) -> Self {
        Self {
            identity_key: identity_key(&candidate),
            job_id: candidate.job_id,
            title: candidate.title,
            company: candidate.company,
            location: candidate.location,
            description: candidate.description,
            url: candidate.url,
            posted_at: candidate.posted_at,
            search: candidate.search,
            first_seen_at,
            analysis: None,
        }
    }

    pub fn score(&self) -> Option<u8> {
        self.analysis.as_ref().map(|a| a.score)
    }

    pub fn is_analyzed(&self) -> bool {
        self.analysis.is_some()
    }
}

/// Lowercases, drops punctuation and collapses whitespace.
pub fn normalize_key_fragment(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn strip_volatile_url_parts(url: &str) -> &str {
    let end = url.find(&['?', '#'][..]).unwrap_or(url.len());
    url[..end].trim_end_matches('/')
}

/// Deduplication key for a candidate.
///
/// The board-assigned job id wins when present. Otherwise the key is a SHA-256
/// digest over the normalized title, company and URL (query string and fragment
/// removed, since tracking parameters change between scrapes).
pub fn identity_key(candidate: &ListingCandidate) -> String {
    if let Some(job_id) = candidate.job_id.as_deref().map(str::trim) {
        if !job_id.is_empty() {
            return format!("linkedin:{job_id}");
        }
    }

    let mut hasher = Sha256::new();
    hasher.update(normalize_key_fragment(&candidate.title).as_bytes());
    hasher.update([0x1f]);
    hasher.update(normalize_key_fragment(&candidate.company).as_bytes());
    hasher.update([0x1f]);
    hasher.update(strip_volatile_url_parts(candidate.url.trim()).as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Keys inserted by this merge, in candidate order.
    pub added: Vec<String>,
    pub duplicates: usize,
}

/// Every listing ever seen, keyed by identity key.
///
/// Keys are never removed, and neither `first_seen_at` nor `analysis` of an
/// existing entry is touched by a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingStore {
    listings: BTreeMap<String, Listing>,
}

impl ListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_listings(listings: BTreeMap<String, Listing>) -> Self {
        Self { listings }
    }

    pub fn len(&self) -> usize {
        self.listings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listings.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Listing> {
        self.listings.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.listings.keys()
    }

    pub fn listings(&self) -> impl Iterator<Item = &Listing> {
        self.listings.values()
    }

    pub fn merge<I>(&mut self, candidates: I, now: DateTime<Utc>) -> MergeOutcome
    where
        I: IntoIterator<Item = ListingCandidate>,
    {
        let mut outcome = MergeOutcome::default();
        for candidate in candidates {
            let listing = Listing::from_candidate(candidate, now);
            match self.listings.entry(listing.identity_key.clone()) {
                Entry::Occupied(_) => outcome.duplicates += 1,
                Entry::Vacant(slot) => {
                    outcome.added.push(listing.identity_key.clone());
                    slot.insert(listing);
                }
            }
        }
        outcome
    }

    /// Keys of listings without an analysis, oldest first.
    pub fn unscored_keys(&self) -> Vec<String> {
        let mut pending = self
            .listings
            .values()
            .filter(|l| !l.is_analyzed())
            .collect::<Vec<_>>();
        pending.sort_by(|a, b| {
            a.first_seen_at
                .cmp(&b.first_seen_at)
                .then_with(|| a.identity_key.cmp(&b.identity_key))
        });
        pending.into_iter().map(|l| l.identity_key.clone()).collect()
    }

    /// Orders the scoring queue: `priority` keys first (in the given order), then
    /// the remaining candidates from `unscored_keys` or, when `force` is set,
    /// every key in the store.
    pub fn scoring_queue(&self, priority: &[String], force: bool) -> Vec<String> {
        let rest = if force {
            let mut all = self.listings.values().collect::<Vec<_>>();
            all.sort_by(|a, b| {
                a.first_seen_at
                    .cmp(&b.first_seen_at)
                    .then_with(|| a.identity_key.cmp(&b.identity_key))
            });
            all.into_iter().map(|l| l.identity_key.clone()).collect()
        } else {
            self.unscored_keys()
        };

        let mut seen = HashSet::new();
        priority
            .iter()
            .chain(rest.iter())
            .filter(|key| {
                self.listings
                    .get(key.as_str())
                    .is_some_and(|l| force || !l.is_analyzed())
            })
            .filter(|key| seen.insert(*key))
            .cloned()
            .collect()
    }

    /// Attaches an analysis. An existing analysis is only replaced when `force` is set.
    pub fn attach_analysis(&mut self, key: &str, analysis: Analysis, force: bool) -> bool {
        match self.listings.get_mut(key) {
            Some(listing) if force || listing.analysis.is_none() => {
                listing.analysis = Some(analysis);
                true
            }
            _ => false,
        }
    }

    /// Fills a missing description; analysed listings are left alone.
    pub fn fill_description(&mut self, key: &str, description: String) -> bool {
        match self.listings.get_mut(key) {
            Some(listing) if listing.description.is_none() && listing.analysis.is_none() => {
                listing.description = Some(description);
                true
            }
            _ => false,
        }
    }
}
