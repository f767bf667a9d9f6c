use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use chrono::Utc;
use rand::seq::SliceRandom;
use rusqlite::Connection;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use shopkit_core::config::CronConfig;

use crate::budget::TimeBudget;
use crate::db;
use crate::error::Result;
use crate::interval;
use crate::queue;
use crate::registry::{CronModule, HandlerRegistry, ModuleRegistry, RecurringTask};
use crate::types::{CronEvent, JobOutcome, JobQueueSelection, QueueOptions, QueuedJob};

/// Drives the whole cron subsystem over one SQLite connection.
///
/// There is no in-process concurrency here: overlap comes only from other
/// OS processes running their own `Cron` against the same database, and the
/// version column on cron_jobs is the sole synchronisation primitive. A lost
/// claim race means "someone else has it" and the pass moves on immediately.
pub struct Cron {
    conn: Connection,
    config: CronConfig,
    handlers: HandlerRegistry,
    modules: ModuleRegistry,
    /// If set, failure notifications are sent here for delivery routing.
    events: Option<mpsc::Sender<CronEvent>>,
}

impl Cron {
    /// Create a new engine, initialising the DB schema if needed.
    ///
    /// Pass `Some(tx)` to receive a copy of every [`CronEvent`] via mpsc.
    /// The sender is non-blocking (`try_send`) so a pass is never stalled by
    /// a slow consumer.
    pub fn new(
        conn: Connection,
        config: CronConfig,
        handlers: HandlerRegistry,
        modules: ModuleRegistry,
        events: Option<mpsc::Sender<CronEvent>>,
    ) -> Result<Self> {
        db::init_db(&conn)?;
        Ok(Self {
            conn,
            config,
            handlers,
            modules,
            events,
        })
    }

    /// The connection this engine runs on, for co-located queueing and
    /// interval control.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Enqueue a one-off job on this engine's connection.
    /// See [`crate::queue::queue_job`].
    pub fn queue_job(
        &self,
        handler: &str,
        params: &[Value],
        retry_on_fail: bool,
        allow_duplicate: bool,
        options: QueueOptions,
    ) -> Result<()> {
        queue::queue_job(
            &self.conn,
            handler,
            params,
            retry_on_fail,
            allow_duplicate,
            options,
        )
    }

    /// The single externally-triggered entry point. Safe to invoke
    /// repeatedly and concurrently with itself in other processes.
    ///
    /// Runs the one-off job batch, then the recurring tasks, then the
    /// reconciliation sweep, which always runs whatever happened before it.
    /// Phase failures
    /// are reported on the event channel, never returned: the external
    /// trigger only sees an error if the sweep itself cannot reach the
    /// store.
    pub fn execute_cron(&self, process_tabs: bool, jobs: JobQueueSelection) -> Result<()> {
        let budget = TimeBudget::new(self.config.time_limit_seconds);
        self.execute_cron_with_budget(process_tabs, jobs, &budget)
    }

    /// [`Cron::execute_cron`] with a caller-supplied time budget, for hosts
    /// that track their own deadline (and for tests with a fake clock).
    pub fn execute_cron_with_budget(
        &self,
        process_tabs: bool,
        jobs: JobQueueSelection,
        budget: &TimeBudget,
    ) -> Result<()> {
        let phase_result: Result<()> = (|| {
            if jobs != JobQueueSelection::Skip {
                let queue_name = match &jobs {
                    JobQueueSelection::Queue(name) => Some(name.as_str()),
                    _ => self.config.queue_name.as_deref(),
                };
                self.execute_cronjobs(
                    self.config.job_batch_size,
                    queue_name,
                    self.config.job_batch_shuffle,
                    budget,
                )?;
            }
            if process_tabs {
                self.execute_crontabs(budget)?;
            }
            Ok(())
        })();

        if let Err(err) = phase_result {
            error!(error = %err, "cron pass failed");
            self.fire(CronEvent::CronFailed {
                error: err.to_string(),
            });
        }

        // Stuck claims must be recovered no matter what happened above.
        self.reconcile_cronjobs()
    }

    /// Claim and run up to `limit` eligible one-off jobs.
    ///
    /// Jobs whose claim is lost to a concurrent invocation are skipped
    /// without side effects. Handler failures stay inside the per-job
    /// boundary; store failures abort the remaining batch.
    pub fn execute_cronjobs(
        &self,
        limit: u32,
        queue_name: Option<&str>,
        shuffle: bool,
        budget: &TimeBudget,
    ) -> Result<()> {
        let mut jobs = queue::eligible_jobs(&self.conn, limit, queue_name)?;
        if jobs.is_empty() {
            return Ok(());
        }

        if shuffle {
            // Overlapping invocations fetch the same window; processing it in
            // a different order keeps them off each other's rows.
            jobs.shuffle(&mut rand::thread_rng());
        }

        for mut job in jobs {
            if !budget.has_time_remaining() {
                debug!("time budget exhausted, remaining jobs wait for a later pass");
                break;
            }

            if !queue::claim_job(&self.conn, &job)? {
                // lost the race to another invocation
                continue;
            }
            job.version += 1;

            info!(job_id = job.id, handler = %job.handler, "job claimed");
            self.run_claimed_job(&job)?;
        }
        Ok(())
    }

    /// Invoke a claimed job's handler and resolve the outcome: delete on
    /// success, error, or non-retryable failure; release back to the pool on
    /// an explicit failure with retry enabled.
    ///
    /// The catch_unwind boundary doubles as the shutdown guard: a panicking
    /// handler unwinds into [`Cron::resolve_job_panic`] instead of killing
    /// the batch.
    fn run_claimed_job(&self, job: &QueuedJob) -> Result<()> {
        let mut retry = job.retry_on_fail;
        let mut result: Option<JobOutcome> = None;

        match self.handlers.resolve(&job.handler) {
            Ok(handler) => {
                match panic::catch_unwind(AssertUnwindSafe(|| handler.call(&job.params))) {
                    Ok(Ok(outcome)) => result = Some(outcome),
                    Ok(Err(err)) => {
                        // The handler errored rather than signalling failure;
                        // that is not the explicit retry signal.
                        warn!(job_id = job.id, handler = %job.handler, error = %err, "job handler failed");
                        self.fire(CronEvent::JobFailed {
                            job_id: job.id,
                            handler: job.handler.clone(),
                            error: err.to_string(),
                        });
                    }
                    Err(payload) => return self.resolve_job_panic(job, payload),
                }
            }
            Err(err) => {
                // nothing to invoke, so retrying cannot help
                retry = false;
                warn!(job_id = job.id, handler = %job.handler, "job is not executable");
                self.fire(CronEvent::JobFailed {
                    job_id: job.id,
                    handler: job.handler.clone(),
                    error: err.to_string(),
                });
            }
        }

        if retry && result == Some(JobOutcome::Failed) {
            // Back of the queue: attempts stays incremented, so the
            // (attempts, id) ordering deprioritises it naturally.
            queue::release_job(&self.conn, job.id)?;
            return Ok(());
        }

        queue::delete_job_version(&self.conn, job.id, job.version)
    }

    /// Shutdown guard: a handler panicked while we held the claim.
    ///
    /// Re-checks that the job is still ours at the claimed version before
    /// acting, since another invocation may have reconciled it already. A
    /// timeout-class panic goes through the same attempts-vs-ceiling routing
    /// as the sweeper; any other panic is assumed to crash again on retry
    /// and the job is deleted outright.
    ///
    /// This only covers unwinding panics. A hard process death (abort,
    /// OOM-kill) leaves the claim standing until the reconciliation sweep of
    /// a later pass picks it up: slower to detect, same end state.
    fn resolve_job_panic(&self, job: &QueuedJob, payload: Box<dyn Any + Send>) -> Result<()> {
        let message = panic_message(payload);
        error!(job_id = job.id, handler = %job.handler, panic = %message, "job handler panicked");

        if queue::still_claimed(&self.conn, job.id, job.version)? {
            if is_timeout_panic(&message) {
                self.handle_timeout_job(job)?;
            } else {
                queue::delete_job_version(&self.conn, job.id, job.version)?;
            }
        }

        self.fire(CronEvent::JobShutdown {
            job_id: job.id,
            handler: job.handler.clone(),
            panic: message,
        });
        Ok(())
    }

    /// Run every registered module's due recurring tasks.
    ///
    /// The due-check and interval write are not atomic: two overlapping
    /// invocations can both pass the check before either writes. Writing the
    /// interval forward *before* invoking the method narrows that window but
    /// does not close it. This is an accepted weaker guarantee than the job
    /// queue's claim. Task methods must tolerate loosely-serialised
    /// execution.
    pub fn execute_crontabs(&self, budget: &TimeBudget) -> Result<()> {
        let now = Utc::now();

        'modules: for module in self.modules.modules() {
            for task in module.recurring_tasks() {
                let code = format!("{}_{}", module.id(), task.code);
                let last = interval::get_interval(&self.conn, &code)?;
                let due_at = last + chrono::Duration::minutes(task.interval_minutes);
                if now < due_at {
                    continue;
                }

                if !budget.has_time_remaining() {
                    debug!("time budget exhausted, remaining tasks wait for a later pass");
                    break 'modules;
                }

                self.run_recurring_task(module.as_ref(), &task, &code, last)?;
            }
        }
        Ok(())
    }

    /// Invoke one due task. Store failures propagate; task failures are
    /// reported and contained.
    fn run_recurring_task(
        &self,
        module: &dyn CronModule,
        task: &RecurringTask,
        code: &str,
        previous: chrono::DateTime<Utc>,
    ) -> Result<()> {
        // Soft claim: move the interval forward before invoking, so an
        // overlapping invocation that checks mid-run sees the task as fresh.
        interval::update_interval(&self.conn, code, None)?;

        info!(record_code = %code, method = %task.method, "recurring task starting");

        match module.run_task(&task.method) {
            Ok(true) => {
                // completion time, not just start time
                interval::update_interval(&self.conn, code, None)?;
            }
            Ok(false) => {
                // Did not run: revert to the previously effective last-run
                // time so the task is still due on the next pass.
                interval::update_interval(&self.conn, code, Some(previous))?;
            }
            Err(err) => {
                warn!(record_code = %code, error = %err, "recurring task failed");
                self.fire(CronEvent::TaskFailed {
                    record_code: code.to_string(),
                    error: err.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Find jobs stuck in "started" beyond the duration ceiling and route
    /// each through the timeout logic: re-queue while the attempt budget
    /// lasts, delete once it is exhausted.
    ///
    /// Runs at the end of every pass regardless of what the earlier phases
    /// did. This is the only recovery path for claims orphaned by a hard
    /// process death.
    pub fn reconcile_cronjobs(&self) -> Result<()> {
        let max_duration = self.config.max_job_duration_seconds;
        if max_duration == 0 {
            return Ok(());
        }

        let mut stale = queue::stale_jobs(&self.conn, max_duration)?;
        if stale.is_empty() {
            return Ok(());
        }

        stale.shuffle(&mut rand::thread_rng());
        for job in stale {
            self.handle_timeout_job(&job)?;
        }
        Ok(())
    }

    /// A claimed job exceeded its allowed duration: give it back to the pool
    /// unless its claim attempts already reached the ceiling.
    fn handle_timeout_job(&self, job: &QueuedJob) -> Result<()> {
        let requeued = job.attempts < i64::from(self.config.timeout_retries);
        if requeued {
            queue::release_job(&self.conn, job.id)?;
        } else {
            queue::delete_job_version(&self.conn, job.id, job.version)?;
        }
        warn!(job_id = job.id, handler = %job.handler, requeued, "job exceeded max duration");
        self.fire(CronEvent::JobTimedOut {
            job_id: job.id,
            handler: job.handler.clone(),
            requeued,
        });
        Ok(())
    }

    /// Forward a notification to the event channel (non-blocking); dropped
    /// with a warning when the channel is full or closed.
    fn fire(&self, event: CronEvent) {
        if let Some(tx) = &self.events {
            if tx.try_send(event).is_err() {
                warn!("cron event channel full or closed, event dropped");
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "job handler panicked".to_string()
    }
}

/// An execution-time fatal may deserve another try (subject to the attempt
/// ceiling); every other fatal is treated as unrecoverable.
fn is_timeout_panic(message: &str) -> bool {
    message.to_ascii_lowercase().contains("maximum execution time")
}
