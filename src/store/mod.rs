//! SQLite-backed time-series store.
//!
//! Holds raw per-user deltas, raw cumulative peer snapshots, their 8-hour
//! rollups and the sampler run log. A single connection behind a mutex
//! serializes every statement, so concurrent callers queue instead of
//! failing with `SQLITE_BUSY`.

pub mod query;
pub mod rollup;
pub mod schema;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;

use crate::config::DatabaseConfig;

/// Source name recorded for per-user samplers.
pub const SOURCE_TRAFFIC: &str = "traffic";
/// Source name recorded for the log attribution calculator.
pub const SOURCE_ATTRIBUTION: &str = "attribution";
/// Source name recorded for the peer sampler.
pub const SOURCE_PEERS: &str = "peers";
/// Source name recorded for retention passes.
pub const SOURCE_RETENTION: &str = "retention";

/// A marginal per-identity traffic delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sample {
    pub identity: String,
    pub ts: i64,
    pub uplink: u64,
    pub downlink: u64,
}

/// A cumulative peer counter snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSample {
    pub peer_id: String,
    pub ts: i64,
    pub rx: u64,
    pub tx: u64,
    pub endpoint: String,
}

/// One entry in the sampler observability log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SamplerRun {
    pub ts: i64,
    pub duration_ms: u64,
    pub inserted: usize,
    pub error: Option<String>,
    pub source: String,
}

/// Which raw series a query reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Series {
    /// Pre-computed per-user deltas.
    Traffic,
    /// Cumulative per-peer snapshots.
    Peers,
}

impl Series {
    /// Returns the canonical series name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Traffic => SOURCE_TRAFFIC,
            Self::Peers => SOURCE_PEERS,
        }
    }
}

/// Time-series store handle. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Opens (creating if needed) the database file and applies migrations.
    pub fn open(cfg: &DatabaseConfig) -> Result<Self> {
        if let Some(parent) = cfg.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating database directory {}", parent.display()))?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
        let conn = Connection::open_with_flags(&cfg.path, flags)
            .with_context(|| format!("opening database {}", cfg.path.display()))?;

        Self::from_connection(conn, cfg.busy_timeout, Some(&cfg.path))
    }

    /// Opens a private in-memory store. Used by tests and one-shot tools.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory database")?;
        Self::from_connection(conn, Duration::from_secs(5), None)
    }

    fn from_connection(
        mut conn: Connection,
        busy_timeout: Duration,
        path: Option<&Path>,
    ) -> Result<Self> {
        apply_pragmas(&conn, busy_timeout)?;
        schema::migrate_up(&mut conn).context("applying schema migrations")?;

        if let Some(path) = path {
            tracing::info!(path = %path.display(), "time-series store opened");
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` with exclusive access to the connection.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock();
        f(&mut guard)
    }

    /// Runs a store operation on the blocking thread pool.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Store) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .context("store task panicked")?
    }

    /// Appends one delta sample. Returns false when (identity, ts) already exists.
    pub fn append(&self, sample: &Sample) -> Result<bool> {
        let inserted = self.append_batch(std::slice::from_ref(sample))?;
        Ok(inserted == 1)
    }

    /// Appends delta samples in one transaction, ignoring duplicates.
    ///
    /// Returns the number of rows actually inserted.
    pub fn append_batch(&self, samples: &[Sample]) -> Result<usize> {
        if samples.is_empty() {
            return Ok(0);
        }

        self.with_conn(|conn| {
            let tx = conn.transaction().context("starting sample batch")?;
            let mut inserted = 0usize;
            {
                let mut stmt = tx
                    .prepare_cached(
                        "INSERT OR IGNORE INTO traffic_samples (identity, ts, uplink, downlink)
                         VALUES (?1, ?2, ?3, ?4)",
                    )
                    .context("preparing sample insert")?;
                for sample in samples {
                    inserted += stmt
                        .execute(params![
                            sample.identity,
                            sample.ts,
                            to_sql_bytes(sample.uplink),
                            to_sql_bytes(sample.downlink),
                        ])
                        .with_context(|| format!("inserting sample for {}", sample.identity))?;
                }
            }
            tx.commit().context("committing sample batch")?;
            Ok(inserted)
        })
    }

    /// Adds delta samples in one transaction. A row that already exists for
    /// (identity, ts) has the new delta added to it.
    ///
    /// Returns the number of rows inserted or merged.
    pub fn merge_batch(&self, samples: &[Sample]) -> Result<usize> {
        if samples.is_empty() {
            return Ok(0);
        }

        self.with_conn(|conn| {
            let tx = conn.transaction().context("starting sample merge")?;
            let mut merged = 0usize;
            {
                let mut stmt = tx
                    .prepare_cached(
                        "INSERT INTO traffic_samples (identity, ts, uplink, downlink)
                         VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(identity, ts) DO UPDATE SET
                             uplink = uplink + excluded.uplink,
                             downlink = downlink + excluded.downlink",
                    )
                    .context("preparing sample merge")?;
                for sample in samples {
                    merged += stmt
                        .execute(params![
                            sample.identity,
                            sample.ts,
                            to_sql_bytes(sample.uplink),
                            to_sql_bytes(sample.downlink),
                        ])
                        .with_context(|| format!("merging sample for {}", sample.identity))?;
                }
            }
            tx.commit().context("committing sample merge")?;
            Ok(merged)
        })
    }

    /// Appends peer snapshots in one transaction, ignoring duplicate (peer, ts).
    pub fn append_peer_batch(&self, samples: &[PeerSample]) -> Result<usize> {
        if samples.is_empty() {
            return Ok(0);
        }

        self.with_conn(|conn| {
            let tx = conn.transaction().context("starting peer batch")?;
            let mut inserted = 0usize;
            {
                let mut stmt = tx
                    .prepare_cached(
                        "INSERT OR IGNORE INTO peer_samples (peer_id, ts, rx, tx, endpoint)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                    )
                    .context("preparing peer insert")?;
                for sample in samples {
                    inserted += stmt
                        .execute(params![
                            sample.peer_id,
                            sample.ts,
                            to_sql_bytes(sample.rx),
                            to_sql_bytes(sample.tx),
                            sample.endpoint,
                        ])
                        .with_context(|| format!("inserting snapshot for {}", sample.peer_id))?;
                }
            }
            tx.commit().context("committing peer batch")?;
            Ok(inserted)
        })
    }

    /// Appends one sampler run record.
    pub fn record_run(&self, run: &SamplerRun) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sampler_runs (ts, duration_ms, inserted, error, source)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run.ts,
                    to_sql_bytes(run.duration_ms),
                    i64::try_from(run.inserted).unwrap_or(i64::MAX),
                    run.error,
                    run.source,
                ],
            )
            .context("inserting sampler run")?;
            Ok(())
        })
    }

    /// Returns the newest sampler runs, newest first, optionally for one source.
    pub fn recent_runs(&self, source: Option<&str>, limit: usize) -> Result<Vec<SamplerRun>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT ts, duration_ms, inserted, error, source FROM sampler_runs
                     WHERE (?1 IS NULL OR source = ?1)
                     ORDER BY id DESC LIMIT ?2",
                )
                .context("preparing sampler run query")?;

            let rows = stmt
                .query_map(params![source, limit], |row| {
                    Ok(SamplerRun {
                        ts: row.get(0)?,
                        duration_ms: from_sql_bytes(row.get(1)?),
                        inserted: usize::try_from(row.get::<_, i64>(2)?).unwrap_or(0),
                        error: row.get(3)?,
                        source: row.get(4)?,
                    })
                })
                .context("querying sampler runs")?;

            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("reading sampler runs")
        })
    }

    /// Reclaims free pages after large deletes.
    pub fn vacuum(&self) -> Result<()> {
        self.with_conn(|conn| conn.execute_batch("VACUUM").context("vacuuming database"))
    }
}

/// Applies SQLite pragmas for durability and writer queuing.
fn apply_pragmas(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    let journal_mode: String = conn
        .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
        .context("setting journal_mode")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("setting synchronous")?;
    conn.busy_timeout(busy_timeout)
        .context("setting busy timeout")?;

    tracing::debug!(journal_mode = %journal_mode, "applied database pragmas");

    Ok(())
}

/// Returns the start of the bucket containing `ts`.
pub fn bucket_start(ts: i64, interval_secs: i64) -> i64 {
    if interval_secs <= 0 {
        return ts;
    }
    ts.div_euclid(interval_secs).saturating_mul(interval_secs)
}

/// Converts a byte count for storage, saturating at `i64::MAX`.
pub(crate) fn to_sql_bytes(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Converts a stored byte count back, treating negatives as zero.
pub(crate) fn from_sql_bytes(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Current wall-clock time as Unix seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
