use chrono::{DateTime, Utc};

use crate::error::{FetchError, ParseError};

/// One unit of raw source data (a single location object) as fetched.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub url: String,
    pub page: u32,
    /// Index of the unit within its page.
    pub position: usize,
    pub fetched_at: DateTime<Utc>,
    pub body: String,
}

/// Canonical location record produced by the normalizer.
#[derive(Debug, Clone, PartialEq)]
pub struct DiningRecord {
    /// Natural key, e.g. a location slug.
    pub id: String,
    pub name: String,
    pub latitude: String,
    pub longitude: String,
    /// Set for every record the current run saw; the store clears it on rows
    /// a committed run did not see.
    pub active: bool,
    pub last_seen: DateTime<Utc>,
}

/// A row of the `locations` table.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedRow {
    pub id: String,
    pub name: String,
    pub latitude: String,
    pub longitude: String,
    pub active: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deactivated: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone)]
pub struct PageFailure {
    pub page: u32,
    pub error: FetchError,
}

#[derive(Debug, Clone)]
pub struct Rejection {
    pub url: String,
    pub page: u32,
    pub position: usize,
    pub error: ParseError,
}

/// Outcome of a committed run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub documents: usize,
    pub summary: UpsertSummary,
    pub fetch_failures: Vec<PageFailure>,
    pub rejections: Vec<Rejection>,
    pub deactivation_skipped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Committed,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Committed => "committed",
            RunStatus::Aborted => "aborted",
        }
    }
}

/// Entry in the `scrape_runs` log.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub documents: usize,
    pub summary: UpsertSummary,
    pub fetch_errors: usize,
    pub error: Option<String>,
}

pub fn new_run_id(started_at: DateTime<Utc>) -> String {
    format!("run-{}", started_at.format("%Y%m%dT%H%M%S%.3fZ"))
}
