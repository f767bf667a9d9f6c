use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A persisted one-off job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    /// Store-assigned rowid, the primary key.
    pub id: i64,
    /// Optional queue partition; a pass can be restricted to one partition.
    pub queue_name: Option<String>,
    /// `"Target::entry_point"` dispatch name, resolved through the handler
    /// registry at claim time.
    pub handler: String,
    /// Ordered argument list, JSON-encoded in the params column.
    pub params: Vec<Value>,
    /// Re-queue instead of delete when the handler reports [`JobOutcome::Failed`].
    pub retry_on_fail: bool,
    /// Optimistic-concurrency counter. Every claim must supply the version it
    /// last observed and bumps it by one.
    pub version: i64,
    /// Claim attempts so far. Least-attempted jobs are fetched first.
    pub attempts: i64,
    /// ISO-8601 creation timestamp.
    pub created_at: String,
    /// Not eligible for claiming before this instant, if set.
    pub available_at: Option<String>,
    /// Non-NULL while a worker holds the claim.
    pub started_at: Option<String>,
}

/// Map a SELECT row (column order from [`crate::queue::JOB_SELECT_COLS`]) to
/// a QueuedJob. Centralised here so every query in this crate stays
/// consistent.
pub(crate) fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueuedJob> {
    let params: Vec<Value> =
        serde_json::from_str(&row.get::<_, String>(3)?).unwrap_or_default();
    Ok(QueuedJob {
        id: row.get(0)?,
        queue_name: row.get(1)?,
        handler: row.get(2)?,
        params,
        retry_on_fail: row.get::<_, i64>(4)? != 0,
        version: row.get(5)?,
        attempts: row.get(6)?,
        created_at: row.get(7)?,
        available_at: row.get(8)?,
        started_at: row.get(9)?,
    })
}

/// Optional enqueue settings for [`crate::queue::queue_job`].
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    /// Earliest instant the job may be claimed.
    pub available_at: Option<DateTime<Utc>>,
    /// Queue partition to file the job under.
    pub queue_name: Option<String>,
}

/// What a job handler reports back to the queue.
///
/// An `Err` from the handler is not the same as `Failed`: errors are
/// reported on the event channel and the job is deleted, because the handler
/// never got to the point of signalling anything. Only an explicit `Failed`
/// re-queues, and only when the job was enqueued with retry enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Work is finished: delete the job.
    Done,
    /// Explicit failure signal: re-queue when retry_on_fail is set.
    Failed,
}

/// Which part of the one-off job queue a cron pass should process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobQueueSelection {
    /// Claim from every queue partition.
    All,
    /// Skip job processing on this pass.
    Skip,
    /// Claim only jobs filed under the named partition.
    Queue(String),
}

/// Failure notifications forwarded on the event channel.
///
/// Fire-and-forget: the scheduler never consumes a response. Consumers
/// typically route these to alerting or an audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum CronEvent {
    /// A phase of execute_cron failed outside the per-item boundaries.
    CronFailed { error: String },
    /// A claimed job's handler returned an error or was not executable.
    JobFailed {
        job_id: i64,
        handler: String,
        error: String,
    },
    /// A recurring task method returned an error.
    TaskFailed { record_code: String, error: String },
    /// A claimed job panicked; the shutdown guard resolved it.
    JobShutdown {
        job_id: i64,
        handler: String,
        panic: String,
    },
    /// A claimed job exceeded the duration ceiling. `requeued` tells whether
    /// it went back to the pool or was dropped for exhausting its retries.
    JobTimedOut {
        job_id: i64,
        handler: String,
        requeued: bool,
    },
}
