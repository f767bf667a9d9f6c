use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::types::{row_to_job, QueueOptions, QueuedJob};

/// Column order consumed by [`row_to_job`].
pub(crate) const JOB_SELECT_COLS: &str = "id, queue_name, handler, params, retry, \
     version, attempts, created_at, available_at, started_at";

/// Add a one-off job to the queue for background processing.
///
/// The queue is not strictly sequential: it uses optimistic locking, and a
/// re-queued retry goes to the back by virtue of its bumped attempt count.
/// A retry is only queued when `retry_on_fail` is set and the handler
/// explicitly returns [`crate::types::JobOutcome::Failed`].
///
/// With `allow_duplicate` false, a job whose handler and encoded params
/// match an existing row is silently dropped.
pub fn queue_job(
    conn: &Connection,
    handler: &str,
    params: &[Value],
    retry_on_fail: bool,
    allow_duplicate: bool,
    options: QueueOptions,
) -> Result<()> {
    let encoded = serde_json::to_string(params)?;

    if !allow_duplicate {
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM cron_jobs WHERE handler = ?1 AND params = ?2 LIMIT 1",
                rusqlite::params![handler, encoded],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            // identical job already in the queue
            return Ok(());
        }
    }

    let now = Utc::now().to_rfc3339();
    let available_at = options.available_at.map(|at| at.to_rfc3339());
    conn.execute(
        "INSERT INTO cron_jobs
         (queue_name, handler, params, created_at, retry, version, attempts, available_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 1, 0, ?6)",
        rusqlite::params![
            options.queue_name,
            handler,
            encoded,
            now,
            retry_on_fail,
            available_at
        ],
    )?;
    debug!(handler, "job queued");
    Ok(())
}

/// Fetch up to `limit` claimable jobs: unclaimed, past their availability
/// time, optionally restricted to one queue partition. Least-attempted
/// first so starved jobs are not permanently skipped; id breaks ties
/// oldest-first.
pub(crate) fn eligible_jobs(
    conn: &Connection,
    limit: u32,
    queue_name: Option<&str>,
) -> Result<Vec<QueuedJob>> {
    let now = Utc::now().to_rfc3339();
    let mut jobs = Vec::new();

    match queue_name {
        Some(queue) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_SELECT_COLS} FROM cron_jobs
                 WHERE started_at IS NULL
                   AND (available_at IS NULL OR available_at <= ?1)
                   AND queue_name = ?2
                 ORDER BY attempts, id ASC
                 LIMIT ?3"
            ))?;
            let rows = stmt.query_map(rusqlite::params![now, queue, limit], row_to_job)?;
            for row in rows {
                jobs.push(row?);
            }
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_SELECT_COLS} FROM cron_jobs
                 WHERE started_at IS NULL
                   AND (available_at IS NULL OR available_at <= ?1)
                 ORDER BY attempts, id ASC
                 LIMIT ?2"
            ))?;
            let rows = stmt.query_map(rusqlite::params![now, limit], row_to_job)?;
            for row in rows {
                jobs.push(row?);
            }
        }
    }

    Ok(jobs)
}

/// Atomically claim a job at the version the caller last observed.
///
/// The UPDATE is conditioned on `(id, version)`; exactly one affected row
/// means the claim is ours. Zero rows means another invocation advanced the
/// version first and the caller must move on without side effects.
pub(crate) fn claim_job(conn: &Connection, job: &QueuedJob) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let affected = conn.execute(
        "UPDATE cron_jobs
         SET started_at = ?1, attempts = attempts + 1, version = version + 1
         WHERE id = ?2 AND version = ?3",
        rusqlite::params![now, job.id, job.version],
    )?;
    Ok(affected == 1)
}

/// Return a claimed job to the unclaimed pool. Attempts and version keep
/// their bumped values, which is what sends the job to the back of the
/// (attempts, id) ordering.
pub(crate) fn release_job(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("UPDATE cron_jobs SET started_at = NULL WHERE id = ?1", [id])?;
    Ok(())
}

/// Delete a job, but only at the version the caller holds, so a delete never
/// removes a row another invocation has since re-claimed.
pub(crate) fn delete_job_version(conn: &Connection, id: i64, version: i64) -> Result<()> {
    conn.execute(
        "DELETE FROM cron_jobs WHERE id = ?1 AND version = ?2",
        rusqlite::params![id, version],
    )?;
    Ok(())
}

/// True when the job row still exists, is still claimed, and still carries
/// the given version, i.e. no other invocation has reconciled or reclaimed
/// it in the meantime.
pub(crate) fn still_claimed(conn: &Connection, id: i64, version: i64) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT id FROM cron_jobs
             WHERE started_at IS NOT NULL AND id = ?1 AND version = ?2",
            rusqlite::params![id, version],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Jobs claimed longer ago than `max_duration_seconds`; the claiming worker
/// is presumed dead or hung.
pub(crate) fn stale_jobs(conn: &Connection, max_duration_seconds: u64) -> Result<Vec<QueuedJob>> {
    let cutoff =
        (Utc::now() - chrono::Duration::seconds(max_duration_seconds as i64)).to_rfc3339();
    let mut stmt = conn.prepare(&format!(
        "SELECT {JOB_SELECT_COLS} FROM cron_jobs
         WHERE started_at IS NOT NULL AND started_at < ?1"
    ))?;
    let rows = stmt.query_map([cutoff], row_to_job)?;
    let mut jobs = Vec::new();
    for row in rows {
        jobs.push(row?);
    }
    Ok(jobs)
}

/// Fetch one job by id, claimed or not.
pub(crate) fn job_by_id(conn: &Connection, id: i64) -> Result<Option<QueuedJob>> {
    let job = conn
        .query_row(
            &format!("SELECT {JOB_SELECT_COLS} FROM cron_jobs WHERE id = ?1"),
            [id],
            row_to_job,
        )
        .optional()?;
    Ok(job)
}
