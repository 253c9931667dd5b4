//! AI relevance scoring for stored listings.

mod error;
pub mod gemini;
mod prompt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobscout_core::{Analysis, Listing};
use tracing::{debug, info_span, Instrument};

pub use error::{OracleError, ScoreError, ScoreParseError};
pub use gemini::{GeminiConfig, GeminiOracle};
pub use prompt::{build_prompt, parse_analysis, ScoringProfile, DESCRIPTION_CHAR_LIMIT};

pub const CRATE_NAME: &str = "jobscout-scoring";

/// A text-completion service able to judge a listing.
#[async_trait]
pub trait ScoringOracle: Send + Sync {
    /// Recorded as the `analyzer` of every analysis it produces.
    fn model(&self) -> &str;
    async fn complete(&self, prompt: &str) -> Result<String, OracleError>;
}

pub struct Scorer<'a> {
    oracle: &'a dyn ScoringOracle,
    profile: &'a ScoringProfile,
}

impl<'a> Scorer<'a> {
    pub fn new(oracle: &'a dyn ScoringOracle, profile: &'a ScoringProfile) -> Self {
        Self { oracle, profile }
    }

    pub fn analyzer(&self) -> &str {
        self.oracle.model()
    }

    pub async fn score(&self, listing: &Listing) -> Result<Analysis, ScoreError> {
        self.score_at(listing, Utc::now()).await
    }

    pub async fn score_at(
        &self,
        listing: &Listing,
        now: DateTime<Utc>,
    ) -> Result<Analysis, ScoreError> {
        let span = info_span!("score_listing", key = %listing.identity_key);
        async {
            let prompt = build_prompt(listing, self.profile);
            let text = self.oracle.complete(&prompt).await?;
            let analysis = parse_analysis(&text, self.oracle.model(), now)?;
            debug!(score = analysis.score, "listing scored");
            Ok(analysis)
        }
        .instrument(span)
        .await
    }
}
