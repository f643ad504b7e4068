use std::path::Path;
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::model::{DiningRecord, PersistedRow, RunRecord, UpsertSummary};

/// Open the SQLite database named by `db_url`.
///
/// Accepts `sqlite://path`, `sqlite:path`, `file:` URIs, `:memory:` and plain
/// paths. Missing parent directories are created.
pub fn connect(db_url: &str) -> Result<Connection, StoreError> {
    let conn = match parse_db_url(db_url)? {
        DbTarget::Memory => Connection::open_in_memory()?,
        DbTarget::Uri(uri) => Connection::open_with_flags(
            uri,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?,
        DbTarget::Path(path) => {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            Connection::open(path)?
        }
    };
    // journal_mode returns a row, so it can't go through execute_batch.
    let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
    conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;
    Ok(conn)
}

#[derive(Debug, PartialEq)]
enum DbTarget<'a> {
    Memory,
    Uri(&'a str),
    Path(&'a str),
}

fn parse_db_url(db_url: &str) -> Result<DbTarget<'_>, StoreError> {
    let url = db_url.trim();
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);

    if rest.is_empty() {
        return Err(StoreError::UnsupportedUrl(db_url.to_string()));
    }
    if rest == ":memory:" {
        return Ok(DbTarget::Memory);
    }
    if rest.starts_with("file:") {
        return Ok(DbTarget::Uri(rest));
    }
    // Any other scheme (postgres://, mysql://, ...) is not ours.
    if let Some((scheme, _)) = rest.split_once("://") {
        if scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+') {
            return Err(StoreError::UnsupportedUrl(db_url.to_string()));
        }
    }
    Ok(DbTarget::Path(rest))
}

pub fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS locations (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            latitude    TEXT NOT NULL,
            longitude   TEXT NOT NULL,
            active      BOOLEAN NOT NULL DEFAULT 1,
            first_seen  TEXT NOT NULL,
            last_seen   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_locations_active ON locations(active);

        CREATE TABLE IF NOT EXISTS scrape_runs (
            run_id       TEXT PRIMARY KEY,
            started_at   TEXT NOT NULL,
            finished_at  TEXT NOT NULL,
            status       TEXT NOT NULL CHECK(status IN ('committed','aborted')),
            documents    INTEGER NOT NULL DEFAULT 0,
            inserted     INTEGER NOT NULL DEFAULT 0,
            updated      INTEGER NOT NULL DEFAULT 0,
            deactivated  INTEGER NOT NULL DEFAULT 0,
            rejected     INTEGER NOT NULL DEFAULT 0,
            fetch_errors INTEGER NOT NULL DEFAULT 0,
            error        TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_runs_started ON scrape_runs(started_at);
        ",
    )?;
    Ok(())
}

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidTimestamp(raw.to_string()))
}

// ── Upsert ──

/// One run's worth of normalized records.
#[derive(Debug, Clone, Copy)]
pub struct UpsertBatch<'a> {
    pub records: &'a [DiningRecord],
    pub run_at: DateTime<Utc>,
    /// Soft-delete rows not present in `records`.
    pub deactivate_missing: bool,
    /// Abort and roll back if still writing past this instant.
    pub deadline: Option<Instant>,
}

/// Durable sink for normalized records.
pub trait Store: Send {
    /// Merge a batch by natural key inside one transaction. On error nothing
    /// is written. `rejected` in the returned summary is always 0.
    fn upsert(&mut self, batch: UpsertBatch<'_>) -> Result<UpsertSummary, StoreError>;

    /// Append an entry to the run log.
    fn record_run(&mut self, run: &RunRecord) -> Result<(), StoreError>;
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Self {
        SqliteStore { conn }
    }

    pub fn open(db_url: &str) -> Result<Self, StoreError> {
        let conn = connect(db_url)?;
        init_schema(&conn)?;
        Ok(SqliteStore { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}

fn check_deadline(deadline: Option<Instant>) -> Result<(), StoreError> {
    match deadline {
        Some(d) if Instant::now() >= d => Err(StoreError::DeadlineExceeded),
        _ => Ok(()),
    }
}

impl Store for SqliteStore {
    fn upsert(&mut self, batch: UpsertBatch<'_>) -> Result<UpsertSummary, StoreError> {
        let run_at = format_ts(batch.run_at);
        let mut summary = UpsertSummary::default();

        // Dropping `tx` on any early return rolls everything back.
        let tx = self.conn.transaction()?;
        {
            tx.execute_batch(
                "CREATE TEMP TABLE IF NOT EXISTS run_seen (id TEXT PRIMARY KEY);
                 DELETE FROM run_seen;",
            )?;

            let mut update = tx.prepare(
                "UPDATE locations
                 SET name = ?2, latitude = ?3, longitude = ?4, active = ?5, last_seen = ?6
                 WHERE id = ?1",
            )?;
            let mut insert = tx.prepare(
                "INSERT INTO locations (id, name, latitude, longitude, active, first_seen, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            )?;
            let mut seen = tx.prepare("INSERT OR IGNORE INTO run_seen (id) VALUES (?1)")?;

            for r in batch.records {
                let matched =
                    update.execute(params![r.id, r.name, r.latitude, r.longitude, r.active, run_at])?;
                if matched == 0 {
                    insert.execute(params![r.id, r.name, r.latitude, r.longitude, r.active, run_at])?;
                    summary.inserted += 1;
                } else {
                    summary.updated += 1;
                }
                seen.execute(params![r.id])?;
                check_deadline(batch.deadline)?;
            }

            if batch.deactivate_missing {
                summary.deactivated = tx.execute(
                    "UPDATE locations SET active = 0
                     WHERE active = 1 AND id NOT IN (SELECT id FROM run_seen)",
                    [],
                )?;
            }
            tx.execute("DELETE FROM run_seen", [])?;
        }

        check_deadline(batch.deadline)?;
        tx.commit()?;

        debug!(?summary, "upsert committed");
        Ok(summary)
    }

    fn record_run(&mut self, run: &RunRecord) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO scrape_runs
             (run_id, started_at, finished_at, status, documents, inserted, updated,
              deactivated, rejected, fetch_errors, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                run.run_id,
                format_ts(run.started_at),
                format_ts(run.finished_at),
                run.status.as_str(),
                run.documents,
                run.summary.inserted,
                run.summary.updated,
                run.summary.deactivated,
                run.summary.rejected,
                run.fetch_errors,
                run.error,
            ],
        )?;
        info!(run_id = %run.run_id, status = run.status.as_str(), "recorded run");
        Ok(())
    }
}

// ── Read side ──

/// Fetch persisted locations, optionally filtered to one identifier.
/// Inactive rows are skipped unless `include_inactive` is set.
pub fn fetch_locations(
    conn: &Connection,
    id: Option<&str>,
    include_inactive: bool,
    limit: Option<usize>,
) -> Result<Vec<PersistedRow>, StoreError> {
    let mut conditions = Vec::new();
    let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(id) = id {
        conditions.push(format!("id = ?{}", params.len() + 1));
        params.push(Box::new(id.to_string()));
    }
    if !include_inactive {
        conditions.push("active = 1".to_string());
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };
    let sql = format!(
        "SELECT id, name, latitude, longitude, active, first_seen, last_seen
         FROM locations{}
         ORDER BY id{}",
        where_clause,
        match limit {
            Some(n) => format!(" LIMIT {}", n),
            None => String::new(),
        }
    );

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let raw = stmt
        .query_map(param_refs.as_slice(), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, bool>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    raw.into_iter()
        .map(|(id, name, latitude, longitude, active, first_seen, last_seen)| {
            Ok(PersistedRow {
                id,
                name,
                latitude,
                longitude,
                active,
                first_seen: parse_ts(&first_seen)?,
                last_seen: parse_ts(&last_seen)?,
            })
        })
        .collect()
}

pub struct RunLogRow {
    pub run_id: String,
    pub started_at: String,
    pub status: String,
    pub inserted: usize,
    pub updated: usize,
    pub deactivated: usize,
    pub rejected: usize,
    pub fetch_errors: usize,
    pub error: Option<String>,
}

pub struct Stats {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
    pub runs: usize,
    pub recent_runs: Vec<RunLogRow>,
}

pub fn get_stats(conn: &Connection, recent: usize) -> Result<Stats, StoreError> {
    let total: usize = conn.query_row("SELECT COUNT(*) FROM locations", [], |r| r.get(0))?;
    let active: usize =
        conn.query_row("SELECT COUNT(*) FROM locations WHERE active = 1", [], |r| r.get(0))?;
    let runs: usize = conn.query_row("SELECT COUNT(*) FROM scrape_runs", [], |r| r.get(0))?;

    let mut stmt = conn.prepare(
        "SELECT run_id, started_at, status, inserted, updated, deactivated, rejected,
                fetch_errors, error
         FROM scrape_runs
         ORDER BY started_at DESC
         LIMIT ?1",
    )?;
    let recent_runs = stmt
        .query_map([recent], |row| {
            Ok(RunLogRow {
                run_id: row.get(0)?,
                started_at: row.get(1)?,
                status: row.get(2)?,
                inserted: row.get(3)?,
                updated: row.get(4)?,
                deactivated: row.get(5)?,
                rejected: row.get(6)?,
                fetch_errors: row.get(7)?,
                error: row.get(8)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Stats {
        total,
        active,
        inactive: total - active,
        runs,
        recent_runs,
    })
}

/// Whether a row exists for `id`, active or not.
pub fn location_exists(conn: &Connection, id: &str) -> Result<bool, StoreError> {
    let found = conn
        .query_row("SELECT 1 FROM locations WHERE id = ?1", [id], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}
