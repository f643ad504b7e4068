use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::model::{PageFailure, SourceDocument};
use crate::settings::SourceConfig;

const USER_AGENT: &str = concat!("dining_scraper/", env!("CARGO_PKG_VERSION"));

/// Keys under which a page object may carry its list of locations.
const UNIT_KEYS: &[&str] = &["locations", "data", "items", "results"];

/// Retrieves one page of the source feed, split into per-location documents.
///
/// An empty vector means the feed has no page `page` (end of pagination).
/// Implementations must be restartable: fetching the same page twice is safe.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch_page(
        &self,
        source: &SourceConfig,
        page: u32,
    ) -> Result<Vec<SourceDocument>, FetchError>;
}

/// Fetcher backed by a shared `reqwest` client.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| FetchError::Worker(format!("failed to build http client: {}", e)))?;
        Ok(HttpFetcher { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_page(
        &self,
        source: &SourceConfig,
        page: u32,
    ) -> Result<Vec<SourceDocument>, FetchError> {
        let url = source.page_url(page);
        let url_str = url.to_string();

        let mut request = self
            .client
            .get(url)
            .timeout(source.request_timeout)
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(token) = &source.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_transport_error(&url_str, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url_str,
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout {
                    url: url_str.clone(),
                }
            } else {
                FetchError::Body {
                    url: url_str.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let fetched_at = Utc::now();
        let documents: Vec<SourceDocument> = split_units(&body)
            .into_iter()
            .enumerate()
            .map(|(position, body)| SourceDocument {
                url: url_str.clone(),
                page,
                position,
                fetched_at,
                body,
            })
            .collect();
        debug!(page, url = %url_str, units = documents.len(), "fetched page");
        Ok(documents)
    }
}

fn classify_transport_error(url: &str, e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Unreachable {
            url: url.to_string(),
            reason: e.to_string(),
        }
    }
}

/// Split a page body into per-location units.
///
/// Accepts a JSON array, an object wrapping an array under one of
/// [`UNIT_KEYS`], or a single location object. Anything else is returned as
/// one unit so the normalizer can reject it. Blank bodies, `null` and empty
/// arrays yield no units.
pub fn split_units(body: &str) -> Vec<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Null) => Vec::new(),
        Ok(Value::Array(items)) => items.iter().map(Value::to_string).collect(),
        Ok(Value::Object(map)) => {
            match UNIT_KEYS
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_array))
            {
                Some(items) => items.iter().map(Value::to_string).collect(),
                None => vec![trimmed.to_string()],
            }
        }
        _ => vec![trimmed.to_string()],
    }
}

/// Everything one pass over the feed produced.
#[derive(Debug, Default)]
pub struct FetchReport {
    /// Sorted by `(page, position)`.
    pub documents: Vec<SourceDocument>,
    pub failures: Vec<PageFailure>,
    pub pages_fetched: usize,
}

/// Fetch every page of the feed with at most `source.concurrency` requests in
/// flight.
///
/// Pages are requested in order starting at `source.first_page`; no page past
/// the first empty one is requested and results from pages past it are
/// discarded. A page failure is recorded and the remaining pages are still
/// fetched, unless `fail_fast` is set, in which case the first failure is
/// returned and in-flight requests are aborted.
pub async fn fetch_all(
    fetcher: Arc<dyn Fetcher>,
    source: &SourceConfig,
    fail_fast: bool,
    show_progress: bool,
) -> Result<FetchReport, FetchError> {
    let source = Arc::new(source.clone());
    let first = u64::from(source.first_page);
    let last = (first + u64::from(source.max_pages.max(1)) - 1).min(u64::from(u32::MAX));
    let concurrency = source.concurrency.max(1);

    let pb = if show_progress {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
        {
            pb.set_style(style);
        }
        pb.enable_steady_tick(Duration::from_millis(120));
        pb
    } else {
        ProgressBar::hidden()
    };

    let mut tasks = JoinSet::new();
    let mut next = first;
    // Lowest page number observed to be empty.
    let mut end: Option<u32> = None;
    let mut pages: BTreeMap<u32, Vec<SourceDocument>> = BTreeMap::new();
    let mut failures = Vec::new();

    loop {
        while tasks.len() < concurrency && next <= last && end.map_or(true, |e| next < u64::from(e)) {
            let fetcher = Arc::clone(&fetcher);
            let source = Arc::clone(&source);
            let page = next as u32;
            tasks.spawn(async move { (page, fetcher.fetch_page(&source, page).await) });
            next += 1;
        }

        let Some(joined) = tasks.join_next().await else {
            break;
        };
        let (page, result) = joined.map_err(|e| FetchError::Worker(e.to_string()))?;

        match result {
            Ok(docs) if docs.is_empty() => {
                debug!(page, "empty page, end of feed");
                end = Some(end.map_or(page, |e| e.min(page)));
            }
            Ok(docs) => {
                pages.insert(page, docs);
            }
            Err(e) => {
                if fail_fast {
                    warn!(page, error = %e, "page failed, aborting (fail-fast)");
                    pb.finish_and_clear();
                    return Err(e);
                }
                warn!(page, error = %e, "page failed, continuing");
                failures.push(PageFailure { page, error: e });
            }
        }

        pb.set_message(format!(
            "{} pages, {} failed",
            pages.len(),
            failures.len()
        ));
    }
    pb.finish_and_clear();

    if let Some(end) = end {
        pages.retain(|page, _| *page < end);
        failures.retain(|f| f.page < end);
    }
    failures.sort_by_key(|f| f.page);

    let pages_fetched = pages.len();
    let documents: Vec<SourceDocument> = pages.into_values().flatten().collect();
    info!(
        "Fetched {} documents from {} pages ({} failed)",
        documents.len(),
        pages_fetched,
        failures.len()
    );

    Ok(FetchReport {
        documents,
        failures,
        pages_fetched,
    })
}
