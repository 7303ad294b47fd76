//! durable job store over SQLite: schema, leasing, outcomes and config.
//!
//! The store is the only state shared between the supervisor, the workers
//! and the admin surface, all of which may be separate OS processes. WAL
//! journaling plus a bounded busy timeout make concurrent access safe;
//! the lease runs its SELECT-then-UPDATE inside one `BEGIN IMMEDIATE`
//! transaction so two workers can never claim the same row.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tokio::sync::Mutex;

use crate::error::QueueError;
use crate::types::job::{Job, JobSpec};
use crate::types::states::JobState;

/// How long a connection waits on the write lock before surfacing `Busy`.
const BUSY_TIMEOUT_MS: u64 = 10_000;

/// Configuration defaults seeded by `init`.
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BACKOFF_BASE: u32 = 2;

/// Keys the config table recognizes.
pub const CONFIG_KEYS: [&str; 2] = ["max_retries", "backoff_base"];

const SCHEMA: &str = "\
    CREATE TABLE IF NOT EXISTS jobs (
        id              TEXT PRIMARY KEY,
        command         TEXT NOT NULL,
        state           TEXT NOT NULL DEFAULT 'pending',
        priority        INTEGER NOT NULL DEFAULT 0,
        attempts        INTEGER NOT NULL DEFAULT 0,
        max_retries     INTEGER NOT NULL DEFAULT 3,
        backoff_base    INTEGER NOT NULL DEFAULT 2,
        timeout_seconds INTEGER,
        run_at          TEXT,
        created_at      TEXT NOT NULL,
        updated_at      TEXT NOT NULL,
        last_error      TEXT,
        worker_id       TEXT,
        leased_at       TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_jobs_eligible
        ON jobs(state, priority DESC, created_at ASC, id ASC);
    CREATE TABLE IF NOT EXISTS config (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    INSERT OR IGNORE INTO config (key, value) VALUES ('max_retries', '3');
    INSERT OR IGNORE INTO config (key, value) VALUES ('backoff_base', '2');
";

const JOB_COLUMNS: &str = "id, command, state, priority, attempts, \
     max_retries, backoff_base, timeout_seconds, run_at, created_at, \
     updated_at, last_error, worker_id, leased_at";

/// Fields written back when an attempt's outcome is committed.
///
/// `worker_id` and `leased_at` are always cleared; they only exist while
/// a lease is held.
#[derive(Clone, Debug)]
pub struct OutcomeUpdate {
    pub state: JobState,
    pub run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Selection criteria for `list`.
#[derive(Clone, Copy, Debug)]
pub struct ListFilter {
    pub state: Option<JobState>,
    pub limit: usize,
}

impl Default for ListFilter {
    fn default() -> Self {
        Self {
            state: None,
            limit: 100,
        }
    }
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Opens (creating if absent) the store at `path` and ensures the
    /// schema exists. Idempotent: reopening an initialized store changes
    /// nothing.
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        let conn = Connection::open(path)?;
        Self::prepare(conn)
    }

    /// An in-memory store for tests.
    pub fn open_in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()?;
        Self::prepare(conn)
    }

    fn prepare(conn: Connection) -> Result<Self, QueueError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", BUSY_TIMEOUT_MS)?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Inserts a new job. The row starts `scheduled` when `run_at` lies
    /// in the future and `pending` otherwise; `max_retries` and
    /// `backoff_base` are snapshotted from config unless the spec
    /// overrides them.
    pub async fn insert(
        &self,
        spec: &JobSpec,
        now: DateTime<Utc>,
    ) -> Result<Job, QueueError> {
        spec.validate()?;

        let conn = self.conn.lock().await;

        let max_retries = match spec.max_retries {
            Some(n) => n as u32,
            None => config_snapshot(&conn, "max_retries", DEFAULT_MAX_RETRIES)?,
        };
        let backoff_base =
            config_snapshot(&conn, "backoff_base", DEFAULT_BACKOFF_BASE)?;

        let state = match spec.run_at {
            Some(run_at) if run_at > now => JobState::Scheduled,
            _ => JobState::Pending,
        };

        let job = Job {
            id: spec.id.clone(),
            command: spec.command.clone(),
            state,
            priority: spec.priority,
            attempts: 0,
            max_retries,
            backoff_base,
            timeout_seconds: spec.timeout.map(|t| t as u32),
            run_at: spec.run_at,
            created_at: now,
            updated_at: now,
            last_error: None,
            worker_id: None,
            leased_at: None,
        };

        let inserted = conn.execute(
            "INSERT INTO jobs (id, command, state, priority, attempts, \
             max_retries, backoff_base, timeout_seconds, run_at, \
             created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                job.id,
                job.command,
                job.state.as_str(),
                job.priority,
                job.max_retries,
                job.backoff_base,
                job.timeout_seconds,
                job.run_at.map(|t| to_db_time(&t)),
                to_db_time(&now),
            ],
        );

        match inserted {
            Ok(_) => Ok(job),
            Err(e)
                if e.sqlite_error_code()
                    == Some(rusqlite::ErrorCode::ConstraintViolation) =>
            {
                Err(QueueError::Duplicate(job.id))
            },
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Job, QueueError> {
        let conn = self.conn.lock().await;
        get_with_conn(&conn, id)
    }

    /// Jobs matching `filter`, most recently touched first.
    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<Job>, QueueError> {
        let conn = self.conn.lock().await;

        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs {} \
             ORDER BY updated_at DESC LIMIT ?1",
            match filter.state {
                Some(_) => "WHERE state = ?2",
                None => "",
            },
        );
        let mut stmt = conn.prepare(&sql)?;

        let rows = match filter.state {
            Some(state) => stmt.query_map(
                params![filter.limit as i64, state.as_str()],
                row_to_job,
            )?,
            None => stmt
                .query_map(params![filter.limit as i64], row_to_job)?,
        };

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    /// Job counts per state, for `status`. States with no rows are absent.
    pub async fn counts_by_state(
        &self,
    ) -> Result<Vec<(JobState, u64)>, QueueError> {
        let conn = self.conn.lock().await;

        let mut stmt = conn
            .prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")?;
        let rows = stmt.query_map([], |row| {
            Ok((parse_state(row, 0)?, row.get::<_, u64>(1)?))
        })?;

        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        Ok(counts)
    }

    /// Atomically claims the next eligible job for `worker_id`.
    ///
    /// The eligible set is `pending` rows plus `scheduled`/`failed` rows
    /// whose `run_at` has passed, ordered by priority (descending), then
    /// `created_at`, then id. Selection and claim happen inside a single
    /// exclusive write transaction, which is what guarantees a job is
    /// only ever leased by one worker.
    pub async fn lease(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn.lock().await;
        let now_s = to_db_time(&now);

        let tx =
            conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidate: Option<String> = tx
            .query_row(
                "SELECT id FROM jobs \
                 WHERE state = 'pending' \
                    OR (state IN ('scheduled', 'failed') AND run_at <= ?1) \
                 ORDER BY priority DESC, created_at ASC, id ASC \
                 LIMIT 1",
                params![now_s],
                |row| row.get(0),
            )
            .optional()?;

        let Some(id) = candidate else {
            tx.commit()?;
            return Ok(None);
        };

        tx.execute(
            "UPDATE jobs SET state = 'processing', worker_id = ?1, \
             leased_at = ?2, attempts = attempts + 1, updated_at = ?2 \
             WHERE id = ?3",
            params![worker_id, now_s, id],
        )?;

        let job = get_with_conn(&tx, &id)?;
        tx.commit()?;

        Ok(Some(job))
    }

    /// Commits an attempt's outcome, guarded on the expected pre-state.
    ///
    /// A duplicate delivery finds the row already moved on and changes
    /// nothing; the caller sees `StateMismatch` and can treat it as
    /// already-applied.
    pub async fn update_outcome(
        &self,
        id: &str,
        expected: JobState,
        update: &OutcomeUpdate,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let conn = self.conn.lock().await;

        let changed = conn.execute(
            "UPDATE jobs SET state = ?1, run_at = ?2, last_error = ?3, \
             worker_id = NULL, leased_at = NULL, updated_at = ?4 \
             WHERE id = ?5 AND state = ?6",
            params![
                update.state.as_str(),
                update.run_at.map(|t| to_db_time(&t)),
                update.last_error,
                to_db_time(&now),
                id,
                expected.as_str(),
            ],
        )?;

        if changed == 0 {
            return Err(mismatch(&conn, id, expected)?);
        }
        Ok(())
    }

    /// Returns a dead job to `pending` with a clean slate: attempts back
    /// to zero, error and schedule cleared.
    pub async fn retry_dead(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let conn = self.conn.lock().await;

        let changed = conn.execute(
            "UPDATE jobs SET state = 'pending', attempts = 0, \
             last_error = NULL, run_at = NULL, worker_id = NULL, \
             leased_at = NULL, updated_at = ?1 \
             WHERE id = ?2 AND state = 'dead'",
            params![to_db_time(&now), id],
        )?;

        if changed == 0 {
            return Err(mismatch(&conn, id, JobState::Dead)?);
        }
        Ok(())
    }

    /// Deletes every dead job, returning how many were removed.
    pub async fn purge_dead(&self) -> Result<usize, QueueError> {
        let conn = self.conn.lock().await;
        Ok(conn.execute("DELETE FROM jobs WHERE state = 'dead'", [])?)
    }

    pub async fn config_get(
        &self,
        key: &str,
    ) -> Result<Option<String>, QueueError> {
        check_config_key(key)?;

        let conn = self.conn.lock().await;
        Ok(config_value(&conn, key)?)
    }

    pub async fn config_set(
        &self,
        key: &str,
        value: &str,
    ) -> Result<(), QueueError> {
        check_config_key(key)?;
        if value.parse::<u32>().is_err() {
            return Err(QueueError::InvalidSpec(format!(
                "config value for {key} must be a non-negative integer, \
                 got {value:?}"
            )));
        }

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO config (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }
}

fn check_config_key(key: &str) -> Result<(), QueueError> {
    if CONFIG_KEYS.contains(&key) {
        Ok(())
    } else {
        Err(QueueError::UnknownConfigKey(key.to_string()))
    }
}

fn config_value(
    conn: &Connection,
    key: &str,
) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

// Reads a numeric config value for snapshotting onto a new row. A value
// an operator managed to corrupt out-of-band falls back to the default.
fn config_snapshot(
    conn: &Connection,
    key: &str,
    default: u32,
) -> Result<u32, QueueError> {
    Ok(config_value(conn, key)?
        .and_then(|v| v.parse().ok())
        .unwrap_or(default))
}

fn get_with_conn(conn: &Connection, id: &str) -> Result<Job, QueueError> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
        params![id],
        |row| row_to_job(row),
    )
    .optional()?
    .ok_or_else(|| QueueError::NotFound(id.to_string()))
}

// Classifies a guarded update that matched no row.
fn mismatch(
    conn: &Connection,
    id: &str,
    expected: JobState,
) -> Result<QueueError, QueueError> {
    let job = get_with_conn(conn, id)?;
    Ok(QueueError::StateMismatch {
        id: id.to_string(),
        expected,
        actual: job.state,
    })
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        command: row.get(1)?,
        state: parse_state(row, 2)?,
        priority: row.get(3)?,
        attempts: row.get(4)?,
        max_retries: row.get(5)?,
        backoff_base: row.get(6)?,
        timeout_seconds: row.get(7)?,
        run_at: parse_time_opt(row, 8)?,
        created_at: parse_time(row, 9)?,
        updated_at: parse_time(row, 10)?,
        last_error: row.get(11)?,
        worker_id: row.get(12)?,
        leased_at: parse_time_opt(row, 13)?,
    })
}

fn parse_state(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<JobState> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            e.into(),
        )
    })
}

fn parse_time(
    row: &rusqlite::Row,
    idx: usize,
) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    from_db_time(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })
}

fn parse_time_opt(
    row: &rusqlite::Row,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => {
            let t = from_db_time(&raw).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;
            Ok(Some(t))
        },
        None => Ok(None),
    }
}

/// Timestamps are stored as UTC RFC 3339 with fixed microsecond
/// precision, so SQL string comparison agrees with chronological order.
fn to_db_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn from_db_time(s: &str) -> chrono::ParseResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}
