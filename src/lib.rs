//! Scrape the campus dining-location feed and merge it into SQLite.
//!
//! One run: fetch every page, normalize each location, upsert the survivors
//! in a single transaction, soft-delete locations that disappeared.

pub mod db;
pub mod error;
pub mod fetcher;
pub mod model;
pub mod normalizer;
pub mod pipeline;
pub mod settings;

pub use error::{ConfigError, FetchError, ParseError, PipelineError, StoreError};
pub use model::{DiningRecord, PersistedRow, RunReport, SourceDocument, UpsertSummary};
pub use pipeline::{run_from_vars, run_pipeline, Pipeline, RunState};
pub use settings::{RunOptions, Settings, SourceConfig};
