//! Search configuration file and process environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use jobscout_adapters::linkedin::{self, LinkedInGuestAdapter};
use jobscout_core::{SearchQuery, MAX_SCORE};
use jobscout_scoring::gemini::{DEFAULT_BASE_URL as GEMINI_BASE_URL, DEFAULT_MODEL};
use jobscout_scoring::{GeminiConfig, ScoringProfile};
use jobscout_storage::{BackoffPolicy, HttpClientConfig};
use jobscout_web::{DashboardOptions, DEFAULT_THRESHOLD};
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "search.yaml";
pub const DEFAULT_STORE_PATH: &str = "jobs_database.json";
pub const DEFAULT_DASHBOARD_PATH: &str = "index.html";
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid search configuration: {0}")]
    Invalid(String),
    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),
}

fn default_max_pages() -> usize {
    3
}

fn default_page_size() -> usize {
    linkedin::DEFAULT_PAGE_SIZE
}

fn default_request_delay_ms() -> u64 {
    2000
}

fn default_threshold() -> u8 {
    DEFAULT_THRESHOLD
}

/// Contents of `search.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    pub keywords: Vec<String>,
    pub locations: Vec<String>,
    #[serde(default)]
    pub keyword_suffix: Option<String>,
    /// Extra query parameters passed through to the board, e.g. `f_TPR: r604800`.
    #[serde(default)]
    pub filters: BTreeMap<String, serde_yaml::Value>,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
    #[serde(default = "default_threshold")]
    pub score_threshold: u8,
    #[serde(default)]
    pub dashboard_limit: Option<usize>,
    #[serde(default)]
    pub max_scores_per_run: Option<usize>,
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub criteria: Vec<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            keywords: Vec::new(),
            locations: Vec::new(),
            keyword_suffix: None,
            filters: BTreeMap::new(),
            max_pages: default_max_pages(),
            page_size: default_page_size(),
            request_delay_ms: default_request_delay_ms(),
            score_threshold: default_threshold(),
            dashboard_limit: None,
            max_scores_per_run: None,
            profile: String::new(),
            criteria: Vec::new(),
        }
    }
}

impl SearchConfig {
    pub fn from_yaml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reads and validates the file.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let config = Self::from_yaml(&text, path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let blank = |items: &[String]| items.iter().all(|s| s.trim().is_empty());
        if blank(&self.keywords) {
            return Err(ConfigError::Invalid("`keywords` must list at least one keyword".into()));
        }
        if blank(&self.locations) {
            return Err(ConfigError::Invalid("`locations` must list at least one location".into()));
        }
        if self.max_pages == 0 {
            return Err(ConfigError::Invalid("`max_pages` must be at least 1".into()));
        }
        if self.page_size == 0 {
            return Err(ConfigError::Invalid("`page_size` must be at least 1".into()));
        }
        if self.score_threshold > MAX_SCORE {
            return Err(ConfigError::Invalid(format!(
                "`score_threshold` must be between 0 and {MAX_SCORE}, got {}",
                self.score_threshold
            )));
        }
        self.filter_params().map(|_| ())
    }

    /// Every (keyword, location) pair, location-major.
    pub fn queries(&self) -> Vec<SearchQuery> {
        let non_blank = |s: &&String| !s.trim().is_empty();
        self.locations
            .iter()
            .filter(non_blank)
            .flat_map(|location| {
                self.keywords
                    .iter()
                    .filter(non_blank)
                    .map(move |keyword| SearchQuery::new(keyword.trim(), location.trim()))
            })
            .collect()
    }

    pub fn filter_params(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        self.filters
            .iter()
            .map(|(key, value)| {
                let text = match value {
                    serde_yaml::Value::String(s) => s.clone(),
                    serde_yaml::Value::Number(n) => n.to_string(),
                    serde_yaml::Value::Bool(b) => b.to_string(),
                    _ => {
                        return Err(ConfigError::Invalid(format!(
                            "filter `{key}` must be a string, number or boolean"
                        )))
                    }
                };
                Ok((key.clone(), text))
            })
            .collect()
    }

    pub fn linkedin_adapter(&self, base_url: Option<&str>) -> Result<LinkedInGuestAdapter, ConfigError> {
        let mut adapter = LinkedInGuestAdapter::new()
            .with_keyword_suffix(self.keyword_suffix.clone())
            .with_filters(self.filter_params()?)
            .with_page_size(self.page_size);
        if let Some(base_url) = base_url {
            adapter = adapter.with_base_url(base_url);
        }
        Ok(adapter)
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn scoring_profile(&self) -> ScoringProfile {
        ScoringProfile {
            profile: self.profile.clone(),
            criteria: self
                .criteria
                .iter()
                .filter(|c| !c.trim().is_empty())
                .cloned()
                .collect(),
        }
    }

    pub fn dashboard_options(&self) -> DashboardOptions {
        DashboardOptions {
            threshold: self.score_threshold,
            limit: self.dashboard_limit,
        }
    }
}

/// Paths and credentials taken from the environment.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub config_path: PathBuf,
    pub store_path: PathBuf,
    pub dashboard_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub board_base_url: Option<String>,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_base_url: String,
}

impl RunConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        Self {
            config_path: var("JOBSCOUT_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
            store_path: var("JOBSCOUT_STORE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_PATH)),
            dashboard_path: var("JOBSCOUT_DASHBOARD")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DASHBOARD_PATH)),
            user_agent: var("JOBSCOUT_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: var("JOBSCOUT_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(10),
            board_base_url: var("JOBSCOUT_BOARD_BASE_URL"),
            gemini_api_key: var("GEMINI_API_KEY"),
            gemini_model: var("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            gemini_base_url: var("GEMINI_BASE_URL").unwrap_or_else(|| GEMINI_BASE_URL.to_string()),
        }
    }

    pub fn gemini_config(&self) -> Result<GeminiConfig, ConfigError> {
        let api_key = self
            .gemini_api_key
            .clone()
            .ok_or(ConfigError::MissingEnv("GEMINI_API_KEY"))?;
        Ok(GeminiConfig {
            model: self.gemini_model.clone(),
            base_url: self.gemini_base_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs.max(30)),
            ..GeminiConfig::new(api_key)
        })
    }

    pub fn http_client_config(&self, search: &SearchConfig) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            min_request_interval: search.request_delay(),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
keywords: ["supply chain", "data analyst", "  "]
locations: [Paris, Lyon]
keyword_suffix: alternance
filters:
  f_WT: 2
  f_TPR: r604800
  f_E: true
score_threshold: 6
dashboard_limit: 20
profile: Master student in operations
criteria: ["Start-ups are a plus", ""]
"#;

    fn parse(text: &str) -> Result<SearchConfig, ConfigError> {
        SearchConfig::from_yaml(text, Path::new("search.yaml"))
    }

    #[test]
    fn parses_sample_with_defaults() {
        let config = parse(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.max_pages, 3);
        assert_eq!(config.page_size, 25);
        assert_eq!(config.request_delay(), Duration::from_secs(2));
        assert_eq!(config.score_threshold, 6);
        assert_eq!(config.max_scores_per_run, None);
        assert_eq!(
            config.dashboard_options(),
            DashboardOptions {
                threshold: 6,
                limit: Some(20)
            }
        );
        assert_eq!(config.scoring_profile().criteria, vec!["Start-ups are a plus"]);

        let filters = config.filter_params().unwrap();
        assert_eq!(filters["f_WT"], "2");
        assert_eq!(filters["f_TPR"], "r604800");
        assert_eq!(filters["f_E"], "true");
    }

    #[test]
    fn threshold_defaults_to_seven() {
        let config = parse("keywords: [a]\nlocations: [b]\n").unwrap();
        assert_eq!(config.score_threshold, 7);
        assert_eq!(config.dashboard_options(), DashboardOptions::default());
    }

    #[test]
    fn queries_are_location_major_and_skip_blanks() {
        let queries = parse(SAMPLE).unwrap().queries();
        let pairs: Vec<_> = queries
            .iter()
            .map(|q| (q.location.as_str(), q.keyword.as_str()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("Paris", "supply chain"),
                ("Paris", "data analyst"),
                ("Lyon", "supply chain"),
                ("Lyon", "data analyst"),
            ]
        );
    }

    #[test]
    fn validation_rejects_unusable_settings() {
        let invalid = |text: &str| matches!(parse(text).unwrap().validate(), Err(ConfigError::Invalid(_)));
        assert!(invalid("keywords: []\nlocations: [Paris]\n"));
        assert!(invalid("keywords: [' ']\nlocations: [Paris]\n"));
        assert!(invalid("keywords: [a]\nlocations: []\n"));
        assert!(invalid("keywords: [a]\nlocations: [b]\nmax_pages: 0\n"));
        assert!(invalid("keywords: [a]\nlocations: [b]\nscore_threshold: 11\n"));
        assert!(invalid("keywords: [a]\nlocations: [b]\nfilters:\n  f_WT: [1, 2]\n"));

        assert!(matches!(parse("keywords: a: b"), Err(ConfigError::Parse { .. })));
        assert!(matches!(parse("locations: [Paris]\n"), Err(ConfigError::Parse { .. })));
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let err = SearchConfig::load(Path::new("/nonexistent/search.yaml"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn run_config_reads_environment_with_defaults() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("GEMINI_API_KEY", "secret"),
            ("JOBSCOUT_STORE", "/data/jobs.json"),
            ("JOBSCOUT_HTTP_TIMEOUT_SECS", "15"),
            ("GEMINI_MODEL", ""),
        ]);
        let config = RunConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.config_path, PathBuf::from("search.yaml"));
        assert_eq!(config.store_path, PathBuf::from("/data/jobs.json"));
        assert_eq!(config.dashboard_path, PathBuf::from("index.html"));
        assert_eq!(config.http_timeout_secs, 15);
        assert_eq!(config.gemini_model, "gemini-1.5-flash");

        let gemini = config.gemini_config().unwrap();
        assert_eq!(gemini.api_key, "secret");
        assert_eq!(gemini.base_url, "https://generativelanguage.googleapis.com");
    }

    #[test]
    fn missing_api_key_is_reported() {
        let config = RunConfig::from_lookup(|_| None);
        assert!(matches!(
            config.gemini_config(),
            Err(ConfigError::MissingEnv("GEMINI_API_KEY"))
        ));
    }
}
