use std::time::Duration;

use thiserror::Error;

/// Missing or invalid configuration. Always raised before a run starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable must be set")]
    MissingVar(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Failure fetching one page of the source feed.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("{url} is unreachable: {reason}")]
    Unreachable { url: String, reason: String },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("failed to read body from {url}: {reason}")]
    Body { url: String, reason: String },
    #[error("fetch worker failed: {0}")]
    Worker(String),
}

/// Why a single source document was rejected by the normalizer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("malformed document: {0}")]
    Malformed(String),
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("identifier is empty")]
    EmptyIdentifier,
    #[error("{field} '{value}' is not a decimal number")]
    InvalidCoordinate { field: &'static str, value: String },
    #[error("{field} '{value}' is out of range")]
    OutOfRange { field: &'static str, value: String },
    #[error("identifier '{0}' appears more than once in this run")]
    DuplicateIdentifier(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("unsupported database url '{0}' (expected sqlite)")]
    UnsupportedUrl(String),
    #[error("run deadline exceeded before commit; transaction rolled back")]
    DeadlineExceeded,
    #[error("stored timestamp '{0}' is not RFC 3339")]
    InvalidTimestamp(String),
}

/// Run-level failure. Any of these means nothing was committed.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("rejected {rejected} of {total} documents (max rate {max_rate})")]
    RejectionThreshold {
        rejected: usize,
        total: usize,
        max_rate: f64,
    },
    #[error("source returned no documents; refusing to deactivate every location")]
    EmptySource,
    #[error("run exceeded its {0:?} timeout")]
    TimedOut(Duration),
}

impl PipelineError {
    /// Short label stored in the run log.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Config(_) => "config",
            PipelineError::Fetch(_) => "fetch",
            PipelineError::Store(_) => "store",
            PipelineError::RejectionThreshold { .. } => "rejection_threshold",
            PipelineError::EmptySource => "empty_source",
            PipelineError::TimedOut(_) => "timeout",
        }
    }
}
