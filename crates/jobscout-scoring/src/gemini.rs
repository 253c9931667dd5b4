//! Gemini `generateContent` client.

use std::time::Duration;

use async_trait::async_trait;
use jobscout_storage::BackoffPolicy;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::error::OracleError;
use crate::ScoringOracle;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
    pub temperature: f32,
    pub backoff: BackoffPolicy,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
            temperature: 0.2,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: [Part<'a>; 1],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: &'static str,
    temperature: f32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
    generation_config: GenerationConfig,
}

/// What to do with a non-success answer from the API.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum StatusVerdict {
    Retry,
    Fail(OracleErrorKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OracleErrorKind {
    Quota,
    Unauthorized,
    Api,
}

pub(crate) fn classify_gemini_status(status: StatusCode, body: &str) -> StatusVerdict {
    if status == StatusCode::TOO_MANY_REQUESTS || body.contains("RESOURCE_EXHAUSTED") {
        return StatusVerdict::Fail(OracleErrorKind::Quota);
    }
    if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || body.contains("API_KEY_INVALID")
    {
        return StatusVerdict::Fail(OracleErrorKind::Unauthorized);
    }
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return StatusVerdict::Retry;
    }
    StatusVerdict::Fail(OracleErrorKind::Api)
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<JsonValue>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(JsonValue::as_str)
                .map(ToString::to_string)
        })
        .unwrap_or_else(|| body.chars().take(300).collect())
}

/// Concatenated text parts of the first candidate.
pub(crate) fn extract_text(envelope: &JsonValue) -> Result<String, OracleError> {
    let Some(candidate) = envelope.pointer("/candidates/0") else {
        let reason = envelope
            .pointer("/promptFeedback/blockReason")
            .and_then(JsonValue::as_str)
            .unwrap_or("no candidates");
        return Err(OracleError::EmptyResponse(reason.to_string()));
    };

    let text: String = candidate
        .pointer("/content/parts")
        .and_then(JsonValue::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(JsonValue::as_str))
                .collect()
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        let reason = candidate
            .get("finishReason")
            .and_then(JsonValue::as_str)
            .unwrap_or("empty candidate");
        return Err(OracleError::EmptyResponse(reason.to_string()));
    }
    Ok(text)
}

#[derive(Debug)]
pub struct GeminiOracle {
    client: reqwest::Client,
    config: GeminiConfig,
}

impl GeminiOracle {
    pub fn new(config: GeminiConfig) -> Result<Self, OracleError> {
        if config.api_key.trim().is_empty() {
            return Err(OracleError::Config("GEMINI_API_KEY is empty".to_string()));
        }
        if config.model.trim().is_empty() {
            return Err(OracleError::Config("model name is empty".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| OracleError::Config(format!("http client: {e}")))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        )
    }

    async fn backoff(&self, attempt: usize, reason: &str) {
        let delay = self.config.backoff.delay_for_attempt(attempt);
        warn!(attempt, ?delay, reason, "gemini call failed, backing off");
        tokio::time::sleep(delay).await;
    }
}

#[async_trait]
impl ScoringOracle for GeminiOracle {
    fn model(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, prompt: &str) -> Result<String, OracleError> {
        let request = GenerateRequest {
            contents: [Content {
                role: "user",
                parts: [Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                response_mime_type: "application/json",
                temperature: self.config.temperature,
            },
        };
        let endpoint = self.endpoint();

        let mut attempt = 0;
        loop {
            let can_retry = attempt < self.config.backoff.max_retries;
            let sent = self
                .client
                .post(&endpoint)
                .header("x-goog-api-key", &self.config.api_key)
                .json(&request)
                .send()
                .await;

            let resp = match sent {
                Ok(resp) => resp,
                Err(err) if (err.is_timeout() || err.is_connect()) && can_retry => {
                    self.backoff(attempt, &err.to_string()).await;
                    attempt += 1;
                    continue;
                }
                Err(err) => return Err(OracleError::Transient(err.to_string())),
            };

            let status = resp.status();
            let body = resp
                .text()
                .await
                .map_err(|e| OracleError::Transient(format!("reading body: {e}")))?;

            if status.is_success() {
                debug!(bytes = body.len(), "gemini answered");
                let envelope: JsonValue = serde_json::from_str(&body).map_err(|e| OracleError::Api {
                    status: status.as_u16(),
                    message: format!("undecodable envelope: {e}"),
                })?;
                return extract_text(&envelope);
            }

            let message = error_message(&body);
            match classify_gemini_status(status, &body) {
                StatusVerdict::Retry if can_retry => {
                    self.backoff(attempt, &message).await;
                    attempt += 1;
                }
                StatusVerdict::Retry => {
                    return Err(OracleError::Transient(format!("status {status}: {message}")))
                }
                StatusVerdict::Fail(OracleErrorKind::Quota) => {
                    return Err(OracleError::QuotaExceeded(message))
                }
                StatusVerdict::Fail(OracleErrorKind::Unauthorized) => {
                    return Err(OracleError::Unauthorized(message))
                }
                StatusVerdict::Fail(OracleErrorKind::Api) => {
                    return Err(OracleError::Api {
                        status: status.as_u16(),
                        message,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::http::{HeaderMap, Uri};
    use axum::Router;
    use serde_json::json;

    const SCORED: &str = r#"{"candidates":[{"content":{"parts":[{"text":"{\"score\": 7}"}]}}]}"#;

    /// Answers `replies` in order, repeating the last one. Requests without
    /// the api key header or outside the model endpoint get a 404.
    async fn gemini_stub(replies: Vec<(u16, &'static str)>) -> (GeminiOracle, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().fallback(move |uri: Uri, headers: HeaderMap| {
            let counter = counter.clone();
            let replies = replies.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let keyed = headers
                    .get("x-goog-api-key")
                    .is_some_and(|v| v.as_bytes() == b"test-key");
                if !keyed || uri.path() != "/v1beta/models/gemini-1.5-flash:generateContent" {
                    return (axum::http::StatusCode::NOT_FOUND, String::new());
                }
                let (code, body) = replies[n.min(replies.len() - 1)];
                (axum::http::StatusCode::from_u16(code).unwrap(), body.to_string())
            }
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let oracle = GeminiOracle::new(GeminiConfig {
            base_url: format!("http://{addr}"),
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
            },
            ..GeminiConfig::new("test-key")
        })
        .unwrap();
        (oracle, hits)
    }

    #[tokio::test]
    async fn quota_exhaustion_fails_without_retrying() {
        let (oracle, hits) = gemini_stub(vec![(
            429,
            r#"{"error":{"code":429,"message":"Quota exceeded for metric","status":"RESOURCE_EXHAUSTED"}}"#,
        )])
        .await;

        match oracle.complete("score this").await {
            Err(OracleError::QuotaExceeded(message)) => {
                assert_eq!(message, "Quota exceeded for metric")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn overloaded_model_is_retried_until_it_answers() {
        let (oracle, hits) = gemini_stub(vec![(503, "overloaded"), (200, SCORED)]).await;

        assert_eq!(oracle.complete("score this").await.unwrap(), "{\"score\": 7}");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn persistent_outage_is_transient_after_the_retry_budget() {
        let (oracle, hits) = gemini_stub(vec![(503, "overloaded")]).await;

        let err = oracle.complete("score this").await.unwrap_err();
        assert!(matches!(err, OracleError::Transient(_)), "{err}");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn status_classification_matches_gemini_semantics() {
        assert_eq!(
            classify_gemini_status(StatusCode::TOO_MANY_REQUESTS, ""),
            StatusVerdict::Fail(OracleErrorKind::Quota)
        );
        assert_eq!(
            classify_gemini_status(StatusCode::FORBIDDEN, "{}"),
            StatusVerdict::Fail(OracleErrorKind::Unauthorized)
        );
        assert_eq!(
            classify_gemini_status(
                StatusCode::BAD_REQUEST,
                r#"{"error":{"status":"INVALID_ARGUMENT","details":[{"reason":"API_KEY_INVALID"}]}}"#
            ),
            StatusVerdict::Fail(OracleErrorKind::Unauthorized)
        );
        assert_eq!(
            classify_gemini_status(StatusCode::SERVICE_UNAVAILABLE, ""),
            StatusVerdict::Retry
        );
        assert_eq!(
            classify_gemini_status(StatusCode::NOT_FOUND, "model not found"),
            StatusVerdict::Fail(OracleErrorKind::Api)
        );
    }

    #[test]
    fn extracts_text_from_first_candidate() {
        let envelope = json!({
            "candidates": [{
                "content": {"parts": [{"text": "{\"score\": "}, {"text": "7}"}], "role": "model"},
                "finishReason": "STOP"
            }]
        });
        assert_eq!(extract_text(&envelope).unwrap(), "{\"score\": 7}");
    }

    #[test]
    fn blocked_or_empty_envelopes_are_empty_responses() {
        let blocked = json!({"promptFeedback": {"blockReason": "SAFETY"}});
        match extract_text(&blocked) {
            Err(OracleError::EmptyResponse(reason)) => assert_eq!(reason, "SAFETY"),
            other => panic!("unexpected {other:?}"),
        }

        let empty = json!({"candidates": [{"finishReason": "MAX_TOKENS"}]});
        match extract_text(&empty) {
            Err(OracleError::EmptyResponse(reason)) => assert_eq!(reason, "MAX_TOKENS"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn error_message_prefers_api_error_field() {
        assert_eq!(
            error_message(r#"{"error": {"code": 429, "message": "Quota exceeded for metric"}}"#),
            "Quota exceeded for metric"
        );
        assert_eq!(error_message("bad gateway"), "bad gateway");
    }

    #[test]
    fn request_body_uses_gemini_field_names() {
        let request = GenerateRequest {
            contents: [Content {
                role: "user",
                parts: [Part { text: "hello" }],
            }],
            generation_config: GenerationConfig {
                response_mime_type: "application/json",
                temperature: 0.5,
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["contents"][0]["parts"][0]["text"], "hello");
        assert_eq!(value["generationConfig"]["responseMimeType"], "application/json");
        assert_eq!(value["generationConfig"]["temperature"], 0.5);
    }

    #[test]
    fn rejects_blank_credentials() {
        let err = GeminiOracle::new(GeminiConfig::new("  ")).unwrap_err();
        assert!(matches!(err, OracleError::Config(_)));

        let oracle = GeminiOracle::new(GeminiConfig {
            base_url: "http://localhost:9/".into(),
            ..GeminiConfig::new("key")
        })
        .unwrap();
        assert_eq!(oracle.model(), DEFAULT_MODEL);
        assert_eq!(
            oracle.endpoint(),
            "http://localhost:9/v1beta/models/gemini-1.5-flash:generateContent"
        );
    }
}
