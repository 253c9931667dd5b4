//! Prompt construction and oracle response parsing.

use chrono::{DateTime, Utc};
use jobscout_core::{Analysis, Listing, MAX_SCORE};
use serde_json::Value as JsonValue;

use crate::error::ScoreParseError;

pub const DESCRIPTION_CHAR_LIMIT: usize = 1500;

/// Who the listings are being evaluated for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScoringProfile {
    pub profile: String,
    pub criteria: Vec<String>,
}

const DEFAULT_CRITERIA: [&str; 4] = [
    "Match between the role's missions and the candidate's skills",
    "Type of company and learning opportunities",
    "Clarity and realism of the mission",
    "Red flags (disguised internship, vague mission, over-qualification required)",
];

fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub fn build_prompt(listing: &Listing, profile: &ScoringProfile) -> String {
    let description = listing
        .description
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| truncate_chars(d, DESCRIPTION_CHAR_LIMIT))
        .unwrap_or("Not available");

    let candidate = if profile.profile.trim().is_empty() {
        "No profile provided; judge general quality of the offer."
    } else {
        profile.profile.trim()
    };

    let criteria = if profile.criteria.is_empty() {
        DEFAULT_CRITERIA.iter().map(|c| format!("- {c}")).collect::<Vec<_>>()
    } else {
        profile.criteria.iter().map(|c| format!("- {c}")).collect()
    }
    .join("\n");

    format!(
        r#"Evaluate this job offer and give it a score out of {MAX_SCORE} for the candidate below.

CANDIDATE PROFILE:
{candidate}

JOB OFFER:
Title: {title}
Company: {company}
Location: {location}
Description: {description}

SCORING CRITERIA:
{criteria}

Return ONLY one JSON object with exactly these fields:
{{
  "score": 8,
  "verdict": "Strong opportunity",
  "strengths": ["Direct match with data + operations skills"],
  "weaknesses": ["Office is far from the preferred area"],
  "recommendation": "Apply quickly"
}}
"score" must be an integer between 0 and {MAX_SCORE}."#,
        title = listing.title,
        company = listing.company,
        location = if listing.location.is_empty() { "Unknown" } else { listing.location.as_str() },
    )
}

/// Removes a surrounding markdown code fence if the model added one.
fn strip_code_fence(text: &str) -> &str {
    let text = text.trim();
    let inner = if let Some((_, rest)) = text.split_once("```json") {
        rest
    } else if let Some((_, rest)) = text.split_once("```") {
        rest
    } else {
        return text;
    };
    inner.split("```").next().unwrap_or(inner).trim()
}

fn parse_score(value: Option<&JsonValue>) -> Result<u8, ScoreParseError> {
    let value = match value {
        None | Some(JsonValue::Null) => return Err(ScoreParseError::MissingScore),
        Some(v) => v,
    };
    let JsonValue::Number(number) = value else {
        return Err(ScoreParseError::NonNumericScore(value.to_string()));
    };

    if let Some(n) = number.as_i64() {
        return u8::try_from(n)
            .ok()
            .filter(|s| *s <= MAX_SCORE)
            .ok_or_else(|| ScoreParseError::ScoreOutOfRange(number.to_string()));
    }

    // Floats like `7.0` or `1e20`: whole numbers are range-checked, fractions rejected.
    match number.as_f64() {
        Some(f) if f.fract() != 0.0 || !f.is_finite() => {
            Err(ScoreParseError::NonNumericScore(number.to_string()))
        }
        Some(f) if (0.0..=f64::from(MAX_SCORE)).contains(&f) => Ok(f as u8),
        Some(_) => Err(ScoreParseError::ScoreOutOfRange(number.to_string())),
        None => Err(ScoreParseError::NonNumericScore(number.to_string())),
    }
}

fn text_field(obj: &serde_json::Map<String, JsonValue>, names: &[&str]) -> String {
    names
        .iter()
        .find_map(|n| obj.get(*n).and_then(JsonValue::as_str))
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

fn list_field(obj: &serde_json::Map<String, JsonValue>, names: &[&str]) -> Vec<String> {
    let Some(value) = names.iter().find_map(|n| obj.get(*n)) else {
        return Vec::new();
    };
    match value {
        JsonValue::Array(items) => items
            .iter()
            .filter_map(JsonValue::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect(),
        JsonValue::String(s) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

/// Turns the oracle's text into an analysis, or says precisely why it could not.
pub fn parse_analysis(
    text: &str,
    analyzer: &str,
    analyzed_at: DateTime<Utc>,
) -> Result<Analysis, ScoreParseError> {
    let body = strip_code_fence(text);
    let value: JsonValue =
        serde_json::from_str(body).map_err(|e| ScoreParseError::NotJson(e.to_string()))?;
    let JsonValue::Object(obj) = value else {
        return Err(ScoreParseError::NotJson(format!("top-level {}", kind(&value))));
    };

    Ok(Analysis {
        score: parse_score(obj.get("score"))?,
        verdict: text_field(&obj, &["verdict"]),
        strengths: list_field(&obj, &["strengths", "points_forts"]),
        weaknesses: list_field(&obj, &["weaknesses", "points_faibles"]),
        recommendation: text_field(&obj, &["recommendation", "recommandation"]),
        analyzed_at,
        analyzer: analyzer.to_string(),
    })
}

fn kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
