//! Error types for the scoring oracle and response parsing.

use thiserror::Error;

/// Failures talking to the oracle itself.
#[derive(Debug, Error)]
pub enum OracleError {
    /// Missing API key or invalid settings.
    #[error("configuration error: {0}")]
    Config(String),

    /// Quota or rate limit exhausted; no further calls should be made this run.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Credentials rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Timeout, connection failure or server error that survived the retry budget.
    #[error("transient oracle failure: {0}")]
    Transient(String),

    /// Any other non-2xx answer.
    #[error("oracle returned status {status}: {message}")]
    Api { status: u16, message: String },

    /// The envelope carried no text, e.g. the prompt was blocked.
    #[error("oracle returned no text: {0}")]
    EmptyResponse(String),
}

/// Why the oracle's text could not be turned into an analysis.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScoreParseError {
    #[error("response is not a JSON object: {0}")]
    NotJson(String),
    #[error("response has no score field")]
    MissingScore,
    #[error("score is not an integer: {0}")]
    NonNumericScore(String),
    #[error("score {0} is outside 0..=10")]
    ScoreOutOfRange(String),
}

#[derive(Debug, Error)]
pub enum ScoreError {
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error(transparent)]
    Parse(#[from] ScoreParseError),
}

impl ScoreError {
    /// Whether the whole scoring phase should stop rather than move to the next listing.
    pub fn halts_scoring(&self) -> bool {
        matches!(
            self,
            Self::Oracle(OracleError::QuotaExceeded(_))
                | Self::Oracle(OracleError::Unauthorized(_))
                | Self::Oracle(OracleError::Config(_))
        )
    }
}
