use std::time::Duration;

use ::config::{Config, Environment};
use reqwest::Url;
use serde::Deserialize;

use crate::error::ConfigError;

pub const DB_URL_VAR: &str = "DB_URL";
pub const SOURCE_URL_VAR: &str = "SCRAPER_SOURCE_URL";
const ENV_PREFIX: &str = "SCRAPER";

const DEFAULT_PAGE_PARAM: &str = "page";
const DEFAULT_FIRST_PAGE: u32 = 1;
const DEFAULT_MAX_PAGES: u32 = 50;
const DEFAULT_CONCURRENCY: usize = 4;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;
const DEFAULT_RUN_TIMEOUT_SECS: u64 = 300;
const DEFAULT_MAX_REJECTION_RATE: f64 = 0.5;

/// Where and how to fetch the dining-location feed.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub base_url: Url,
    pub page_param: String,
    pub first_page: u32,
    pub per_page: Option<u32>,
    pub max_pages: u32,
    pub concurrency: usize,
    pub request_timeout: Duration,
    pub auth_token: Option<String>,
}

impl SourceConfig {
    pub fn new(base_url: Url) -> Self {
        SourceConfig {
            base_url,
            page_param: DEFAULT_PAGE_PARAM.to_string(),
            first_page: DEFAULT_FIRST_PAGE,
            per_page: None,
            max_pages: DEFAULT_MAX_PAGES,
            concurrency: DEFAULT_CONCURRENCY,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            auth_token: None,
        }
    }

    /// URL of page `page`, with the pagination parameters appended.
    pub fn page_url(&self, page: u32) -> Url {
        let mut url = self.base_url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair(&self.page_param, &page.to_string());
            if let Some(n) = self.per_page {
                pairs.append_pair("per_page", &n.to_string());
            }
        }
        url
    }
}

/// Knobs that govern a single run, independent of the source.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub fail_fast: bool,
    pub max_rejection_rate: f64,
    pub run_timeout: Option<Duration>,
    /// Soft-delete unseen rows even when some pages failed.
    pub deactivate_on_partial_fetch: bool,
    /// Abort instead of committing when the feed yields no documents.
    pub refuse_empty_source: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            fail_fast: false,
            max_rejection_rate: DEFAULT_MAX_REJECTION_RATE,
            run_timeout: Some(Duration::from_secs(DEFAULT_RUN_TIMEOUT_SECS)),
            deactivate_on_partial_fetch: true,
            refuse_empty_source: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub db_url: String,
    pub source: Option<SourceConfig>,
    pub run: RunOptions,
}

#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    db_url: Option<String>,
    source_url: Option<String>,
    auth_token: Option<String>,
    page_param: Option<String>,
    first_page: Option<u32>,
    per_page: Option<u32>,
    max_pages: Option<u32>,
    concurrency: Option<usize>,
    request_timeout_secs: Option<u64>,
    run_timeout_secs: Option<u64>,
    fail_fast: Option<bool>,
    max_rejection_rate: Option<f64>,
    deactivate_on_partial_fetch: Option<bool>,
    refuse_empty_source: Option<bool>,
}

impl Settings {
    /// Load from an explicit set of variables (the process environment in production).
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: ::config::Map<String, String> = vars.into_iter().collect();
        let db_url = vars.get(DB_URL_VAR).cloned();

        let raw: RawSettings = Config::builder()
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .source(Some(vars)),
            )
            .set_override_option("db_url", db_url)?
            .build()?
            .try_deserialize()?;

        raw.validate()
    }

    /// The source configuration, required by `run`.
    pub fn source(&self) -> Result<&SourceConfig, ConfigError> {
        self.source
            .as_ref()
            .ok_or(ConfigError::MissingVar(SOURCE_URL_VAR))
    }
}

impl RawSettings {
    fn validate(self) -> Result<Settings, ConfigError> {
        let db_url = self
            .db_url
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingVar(DB_URL_VAR))?;

        let source = match self.source_url.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => {
                let base_url = Url::parse(raw).map_err(|e| ConfigError::Invalid {
                    key: SOURCE_URL_VAR,
                    reason: e.to_string(),
                })?;
                if !matches!(base_url.scheme(), "http" | "https") {
                    return Err(ConfigError::Invalid {
                        key: SOURCE_URL_VAR,
                        reason: format!("unsupported scheme '{}'", base_url.scheme()),
                    });
                }

                let mut source = SourceConfig::new(base_url);
                if let Some(param) = self.page_param.filter(|p| !p.trim().is_empty()) {
                    source.page_param = param.trim().to_string();
                }
                if let Some(first) = self.first_page {
                    source.first_page = first;
                }
                source.per_page = self.per_page.filter(|n| *n > 0);
                if let Some(max) = self.max_pages {
                    if max == 0 {
                        return Err(ConfigError::Invalid {
                            key: "SCRAPER_MAX_PAGES",
                            reason: "must be at least 1".into(),
                        });
                    }
                    source.max_pages = max;
                }
                if let Some(n) = self.concurrency {
                    if n == 0 {
                        return Err(ConfigError::Invalid {
                            key: "SCRAPER_CONCURRENCY",
                            reason: "must be at least 1".into(),
                        });
                    }
                    source.concurrency = n;
                }
                if let Some(secs) = self.request_timeout_secs.filter(|s| *s > 0) {
                    source.request_timeout = Duration::from_secs(secs);
                }
                source.auth_token = self.auth_token.filter(|t| !t.trim().is_empty());
                Some(source)
            }
        };

        let mut run = RunOptions::default();
        if let Some(fail_fast) = self.fail_fast {
            run.fail_fast = fail_fast;
        }
        if let Some(rate) = self.max_rejection_rate {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ConfigError::Invalid {
                    key: "SCRAPER_MAX_REJECTION_RATE",
                    reason: format!("{} is outside 0.0..=1.0", rate),
                });
            }
            run.max_rejection_rate = rate;
        }
        if let Some(secs) = self.run_timeout_secs {
            run.run_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(flag) = self.deactivate_on_partial_fetch {
            run.deactivate_on_partial_fetch = flag;
        }
        if let Some(flag) = self.refuse_empty_source {
            run.refuse_empty_source = flag;
        }

        Ok(Settings {
            db_url,
            source,
            run,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn missing_db_url() {
        let err = Settings::from_vars(vars(&[(SOURCE_URL_VAR, "https://dining.example.edu/api")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(DB_URL_VAR)));
    }

    #[test]
    fn blank_db_url_is_missing() {
        let err = Settings::from_vars(vars(&[(DB_URL_VAR, "   ")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(DB_URL_VAR)));
    }

    #[test]
    fn defaults() {
        let s = Settings::from_vars(vars(&[
            (DB_URL_VAR, "sqlite://data/dining.sqlite"),
            (SOURCE_URL_VAR, "https://dining.example.edu/api/locations"),
        ]))
        .unwrap();
        assert_eq!(s.db_url, "sqlite://data/dining.sqlite");
        let src = s.source().unwrap();
        assert_eq!(src.page_param, "page");
        assert_eq!(src.first_page, 1);
        assert_eq!(src.max_pages, 50);
        assert_eq!(src.concurrency, 4);
        assert_eq!(src.request_timeout, Duration::from_secs(15));
        assert!(src.auth_token.is_none());
        assert!(!s.run.fail_fast);
        assert_eq!(s.run.max_rejection_rate, 0.5);
        assert_eq!(s.run.run_timeout, Some(Duration::from_secs(300)));
        assert!(s.run.deactivate_on_partial_fetch);
        assert!(!s.run.refuse_empty_source);
    }

    #[test]
    fn overrides_from_prefixed_vars() {
        let s = Settings::from_vars(vars(&[
            (DB_URL_VAR, ":memory:"),
            (SOURCE_URL_VAR, "https://dining.example.edu/api"),
            ("SCRAPER_MAX_PAGES", "3"),
            ("SCRAPER_CONCURRENCY", "2"),
            ("SCRAPER_FAIL_FAST", "true"),
            ("SCRAPER_MAX_REJECTION_RATE", "0.1"),
            ("SCRAPER_RUN_TIMEOUT_SECS", "0"),
            ("SCRAPER_AUTH_TOKEN", "secret"),
            ("SCRAPER_PER_PAGE", "25"),
            ("SCRAPER_DEACTIVATE_ON_PARTIAL_FETCH", "false"),
            ("SCRAPER_REFUSE_EMPTY_SOURCE", "true"),
        ]))
        .unwrap();
        let src = s.source().unwrap();
        assert_eq!(src.max_pages, 3);
        assert_eq!(src.concurrency, 2);
        assert_eq!(src.per_page, Some(25));
        assert_eq!(src.auth_token.as_deref(), Some("secret"));
        assert!(s.run.fail_fast);
        assert_eq!(s.run.max_rejection_rate, 0.1);
        assert_eq!(s.run.run_timeout, None);
        assert!(!s.run.deactivate_on_partial_fetch);
        assert!(s.run.refuse_empty_source);
    }

    #[test]
    fn source_is_optional_until_needed() {
        let s = Settings::from_vars(vars(&[(DB_URL_VAR, ":memory:")])).unwrap();
        assert!(matches!(
            s.source(),
            Err(ConfigError::MissingVar(SOURCE_URL_VAR))
        ));
    }

    #[test]
    fn rejects_bad_values() {
        let bad_url = Settings::from_vars(vars(&[
            (DB_URL_VAR, ":memory:"),
            (SOURCE_URL_VAR, "not a url"),
        ]));
        assert!(matches!(bad_url, Err(ConfigError::Invalid { key: SOURCE_URL_VAR, .. })));

        let bad_scheme = Settings::from_vars(vars(&[
            (DB_URL_VAR, ":memory:"),
            (SOURCE_URL_VAR, "ftp://dining.example.edu/"),
        ]));
        assert!(matches!(bad_scheme, Err(ConfigError::Invalid { .. })));

        let bad_rate = Settings::from_vars(vars(&[
            (DB_URL_VAR, ":memory:"),
            ("SCRAPER_MAX_REJECTION_RATE", "1.5"),
        ]));
        assert!(matches!(bad_rate, Err(ConfigError::Invalid { .. })));

        let zero_workers = Settings::from_vars(vars(&[
            (DB_URL_VAR, ":memory:"),
            (SOURCE_URL_VAR, "https://dining.example.edu/api"),
            ("SCRAPER_CONCURRENCY", "0"),
        ]));
        assert!(matches!(zero_workers, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn page_url_appends_pagination() {
        let mut src = SourceConfig::new(Url::parse("https://dining.example.edu/api?campus=main").unwrap());
        src.per_page = Some(10);
        assert_eq!(
            src.page_url(3).as_str(),
            "https://dining.example.edu/api?campus=main&page=3&per_page=10"
        );
    }
}
