//! Static HTML dashboard of the best-scored listings.

use std::cmp::Reverse;
use std::path::Path;

use askama::Template;
use chrono::{DateTime, Utc};
use jobscout_core::{Listing, ListingStore};
use jobscout_storage::write_atomic;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "jobscout-web";

pub const DEFAULT_THRESHOLD: u8 = 7;
pub const EXCELLENT_SCORE: u8 = 8;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("rendering dashboard template: {0}")]
    Template(#[from] askama::Error),
    #[error("writing dashboard {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DashboardOptions {
    pub threshold: u8,
    /// Caps the number of cards; stats always count every listing.
    pub limit: Option<usize>,
}

impl Default for DashboardOptions {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DashboardStats {
    pub total: usize,
    pub relevant: usize,
    pub excellent: usize,
    pub unscored: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DashboardCard {
    pub key: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub url: String,
    pub score: u8,
    pub badge: &'static str,
    pub verdict: String,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub recommendation: String,
    pub posted: String,
    pub first_seen: String,
}

#[derive(Debug, Template)]
#[template(path = "dashboard.html")]
pub struct Dashboard {
    pub threshold: u8,
    pub generated_at: String,
    pub stats: DashboardStats,
    pub cards: Vec<DashboardCard>,
}

pub fn badge_class(score: u8, threshold: u8) -> &'static str {
    if score >= EXCELLENT_SCORE {
        "high"
    } else if score >= threshold {
        "medium"
    } else {
        "low"
    }
}

/// Analysed listings scoring at least `threshold`, best first.
///
/// Ties go to the most recently seen listing, then to the identity key so the
/// order never depends on map iteration.
pub fn ranked_listings(store: &ListingStore, threshold: u8) -> Vec<&Listing> {
    let mut ranked = store
        .listings()
        .filter(|l| l.score().is_some_and(|s| s >= threshold))
        .collect::<Vec<_>>();
    ranked.sort_by(|a, b| {
        Reverse(a.score())
            .cmp(&Reverse(b.score()))
            .then_with(|| b.first_seen_at.cmp(&a.first_seen_at))
            .then_with(|| a.identity_key.cmp(&b.identity_key))
    });
    ranked
}

pub fn dashboard_stats(store: &ListingStore, threshold: u8) -> DashboardStats {
    store
        .listings()
        .fold(DashboardStats::default(), |mut stats, listing| {
            stats.total += 1;
            match listing.score() {
                Some(score) => {
                    if score >= threshold {
                        stats.relevant += 1;
                    }
                    if score >= EXCELLENT_SCORE {
                        stats.excellent += 1;
                    }
                }
                None => stats.unscored += 1,
            }
            stats
        })
}

/// Only absolute http(s) links make it onto the page; anything else renders
/// as an empty link slot.
fn safe_link(raw: &str) -> String {
    match url::Url::parse(raw.trim()) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => url.to_string(),
        _ => String::new(),
    }
}

fn card(listing: &Listing, threshold: u8) -> DashboardCard {
    let analysis = listing.analysis.as_ref();
    let score = listing.score().unwrap_or_default();
    DashboardCard {
        key: listing.identity_key.clone(),
        title: listing.title.clone(),
        company: listing.company.clone(),
        location: listing.location.clone(),
        url: safe_link(&listing.url),
        score,
        badge: badge_class(score, threshold),
        verdict: analysis.map(|a| a.verdict.clone()).unwrap_or_default(),
        strengths: analysis.map(|a| a.strengths.clone()).unwrap_or_default(),
        weaknesses: analysis.map(|a| a.weaknesses.clone()).unwrap_or_default(),
        recommendation: analysis.map(|a| a.recommendation.clone()).unwrap_or_default(),
        posted: listing
            .posted_at
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
        first_seen: listing.first_seen_at.format("%Y-%m-%d %H:%M UTC").to_string(),
    }
}

/// Builds the dashboard view. Pure: same store and options, same document.
pub fn build_dashboard(
    store: &ListingStore,
    options: DashboardOptions,
    generated_at: DateTime<Utc>,
) -> Dashboard {
    let limit = options.limit.unwrap_or(usize::MAX);
    Dashboard {
        threshold: options.threshold,
        generated_at: generated_at.format("%Y-%m-%d %H:%M UTC").to_string(),
        stats: dashboard_stats(store, options.threshold),
        cards: ranked_listings(store, options.threshold)
            .into_iter()
            .take(limit)
            .map(|l| card(l, options.threshold))
            .collect(),
    }
}

pub fn render(
    store: &ListingStore,
    options: DashboardOptions,
    generated_at: DateTime<Utc>,
) -> Result<String, RenderError> {
    Ok(build_dashboard(store, options, generated_at).render()?)
}

/// Renders and atomically replaces the HTML file at `path`.
pub async fn write_dashboard(
    path: &Path,
    store: &ListingStore,
    options: DashboardOptions,
    generated_at: DateTime<Utc>,
) -> Result<DashboardStats, RenderError> {
    let dashboard = build_dashboard(store, options, generated_at);
    let html = dashboard.render()?;
    write_atomic(path, html.as_bytes())
        .await
        .map_err(|source| RenderError::Io {
            path: path.display().to_string(),
            source,
        })?;
    info!(
        path = %path.display(),
        cards = dashboard.cards.len(),
        relevant = dashboard.stats.relevant,
        "dashboard written"
    );
    Ok(dashboard.stats)
}
