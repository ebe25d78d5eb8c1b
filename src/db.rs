use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::errors::AnalyzerError;
use crate::models::{Job, JobSnapshot, JobStatus, RepoLocator, StageResult, is_valid_transition};

/// Async-safe handle to the job store.
///
/// Wraps `JobDb` behind `Arc<Mutex>` and runs all access on tokio's blocking
/// thread pool via `spawn_blocking`, preventing synchronous SQLite I/O from
/// tying up async worker threads. The single mutex also gives the store its
/// single-writer discipline: transitions and snapshot reads are atomic with
/// respect to each other.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<JobDb>>,
}

impl DbHandle {
    pub fn new(db: JobDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R, AnalyzerError>
    where
        F: FnOnce(&JobDb) -> Result<R, AnalyzerError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct JobDb {
    conn: Connection,
}

impl JobDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    repository TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'queued',
                    error TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS stage_results (
                    job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    stage_index INTEGER NOT NULL,
                    stage TEXT NOT NULL,
                    payload TEXT NOT NULL DEFAULT '{}',
                    success INTEGER NOT NULL DEFAULT 1,
                    recorded_at TEXT NOT NULL DEFAULT (datetime('now')),
                    PRIMARY KEY (job_id, stage_index)
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
                CREATE INDEX IF NOT EXISTS idx_stage_results_job ON stage_results(job_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    pub fn create_job(&self, locator: &RepoLocator) -> Result<Job, AnalyzerError> {
        let id = Uuid::new_v4();
        self.conn
            .execute(
                "INSERT INTO jobs (id, repository) VALUES (?1, ?2)",
                params![id.to_string(), locator.to_string()],
            )
            .context("Failed to insert job")?;
        self.get_job(id)?
            .ok_or_else(|| anyhow::anyhow!("Job not found after insert").into())
    }

    pub fn get_job(&self, id: Uuid) -> Result<Option<Job>, AnalyzerError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, repository, status, error, created_at, updated_at
                 FROM jobs WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok(JobRow {
                        id: row.get(0)?,
                        repository: row.get(1)?,
                        status: row.get(2)?,
                        error: row.get(3)?,
                        created_at: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
            .optional()
            .context("Failed to query job")?;
        match row {
            Some(r) => Ok(Some(r.into_job()?)),
            None => Ok(None),
        }
    }

    pub fn list_jobs(&self, limit: i64, offset: i64) -> Result<Vec<Job>, AnalyzerError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, repository, status, error, created_at, updated_at
                 FROM jobs ORDER BY created_at DESC, id LIMIT ?1 OFFSET ?2",
            )
            .context("Failed to prepare list_jobs")?;
        let rows = stmt
            .query_map(params![limit, offset], |row| {
                Ok(JobRow {
                    id: row.get(0)?,
                    repository: row.get(1)?,
                    status: row.get(2)?,
                    error: row.get(3)?,
                    created_at: row.get(4)?,
                    updated_at: row.get(5)?,
                })
            })
            .context("Failed to query jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            let r = row.context("Failed to read job row")?;
            jobs.push(r.into_job()?);
        }
        Ok(jobs)
    }

    pub fn count_jobs(&self) -> Result<i64, AnalyzerError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))
            .context("Failed to count jobs")?;
        Ok(count)
    }

    pub fn count_jobs_with_status(&self, status: JobStatus) -> Result<i64, AnalyzerError> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM jobs WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )
            .context("Failed to count jobs by status")?;
        Ok(count)
    }

    /// Apply a status transition, enforcing the monotonic state machine.
    /// The read-check-write sequence runs under the handle's single mutex,
    /// so concurrent writers cannot interleave.
    pub fn transition(
        &self,
        id: Uuid,
        to: JobStatus,
        error: Option<&str>,
    ) -> Result<Job, AnalyzerError> {
        let job = self.get_job(id)?.ok_or(AnalyzerError::NotFound(id))?;
        if !is_valid_transition(job.status, to) {
            return Err(AnalyzerError::InvalidTransition {
                from: job.status,
                to,
            });
        }
        self.conn
            .execute(
                "UPDATE jobs SET status = ?1, error = ?2, updated_at = datetime('now') WHERE id = ?3",
                params![to.as_str(), error, id.to_string()],
            )
            .context("Failed to update job status")?;
        self.get_job(id)?
            .ok_or_else(|| anyhow::anyhow!("Job not found after transition").into())
    }

    // ── Stage results ─────────────────────────────────────────────────

    /// Append one stage result. The index is assigned here (next in
    /// sequence); appending to a terminal job is an invariant violation.
    pub fn append_stage_result(
        &self,
        id: Uuid,
        stage: &str,
        payload: &serde_json::Value,
        success: bool,
    ) -> Result<StageResult, AnalyzerError> {
        let job = self.get_job(id)?.ok_or(AnalyzerError::NotFound(id))?;
        if job.status.is_terminal() {
            return Err(AnalyzerError::InvalidTransition {
                from: job.status,
                to: job.status,
            });
        }

        let next_index: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(stage_index), -1) + 1 FROM stage_results WHERE job_id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .context("Failed to get next stage index")?;

        let payload_str =
            serde_json::to_string(payload).context("Failed to serialize stage payload")?;
        self.conn
            .execute(
                "INSERT INTO stage_results (job_id, stage_index, stage, payload, success)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id.to_string(), next_index, stage, payload_str, success],
            )
            .context("Failed to insert stage result")?;
        self.conn
            .execute(
                "UPDATE jobs SET updated_at = datetime('now') WHERE id = ?1",
                params![id.to_string()],
            )
            .context("Failed to touch job after stage append")?;

        let results = self.get_stage_results(id)?;
        results
            .into_iter()
            .find(|r| r.index == next_index)
            .ok_or_else(|| anyhow::anyhow!("Stage result not found after insert").into())
    }

    pub fn get_stage_results(&self, id: Uuid) -> Result<Vec<StageResult>, AnalyzerError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT job_id, stage_index, stage, payload, success, recorded_at
                 FROM stage_results WHERE job_id = ?1 ORDER BY stage_index",
            )
            .context("Failed to prepare get_stage_results")?;
        let rows = stmt
            .query_map(params![id.to_string()], |row| {
                Ok(StageResultRow {
                    job_id: row.get(0)?,
                    index: row.get(1)?,
                    stage: row.get(2)?,
                    payload: row.get(3)?,
                    success: row.get(4)?,
                    recorded_at: row.get(5)?,
                })
            })
            .context("Failed to query stage results")?;
        let mut results = Vec::new();
        for row in rows {
            let r = row.context("Failed to read stage result row")?;
            results.push(r.into_stage_result()?);
        }
        Ok(results)
    }

    /// Read a job together with its stage results in one locked section, so
    /// a reader never sees a Complete job with missing stage results.
    pub fn get_snapshot(&self, id: Uuid) -> Result<Option<JobSnapshot>, AnalyzerError> {
        let job = match self.get_job(id)? {
            Some(j) => j,
            None => return Ok(None),
        };
        let stages = self.get_stage_results(id)?;
        Ok(Some(JobSnapshot { job, stages }))
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

/// Intermediate row struct for reading jobs from SQLite before converting
/// the id and status strings into typed values.
struct JobRow {
    id: String,
    repository: String,
    status: String,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        let id = Uuid::parse_str(&self.id).context("Failed to parse job id")?;
        let status = JobStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse job status")?;
        Ok(Job {
            id,
            repository: self.repository,
            status,
            error: self.error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Intermediate row struct for stage_results.
struct StageResultRow {
    job_id: String,
    index: i64,
    stage: String,
    payload: String,
    success: bool,
    recorded_at: String,
}

impl StageResultRow {
    fn into_stage_result(self) -> Result<StageResult> {
        let job_id = Uuid::parse_str(&self.job_id).context("Failed to parse job id")?;
        let payload: serde_json::Value =
            serde_json::from_str(&self.payload).context("Failed to parse stage payload JSON")?;
        Ok(StageResult {
            job_id,
            index: self.index,
            stage: self.stage,
            payload,
            success: self.success,
            recorded_at: self.recorded_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
