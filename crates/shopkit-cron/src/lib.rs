//! `shopkit-cron` — background job queue and recurring-task scheduler with
//! SQLite persistence.
//!
//! # Overview
//!
//! One-off jobs are persisted to a `cron_jobs` table and recurring tasks are
//! gated by a `cron_intervals` table. An external scheduler (OS cron, a
//! systemd timer) invokes [`Cron::execute_cron`] on whatever cadence it
//! likes; invocations may overlap freely. Correctness under overlap comes
//! from one mechanism only: every transition away from "unclaimed" is a
//! conditional UPDATE keyed on `(id, version)`, judged by the affected-row
//! count.
//!
//! # Phases of a pass
//!
//! | Phase       | Behaviour                                                |
//! |-------------|----------------------------------------------------------|
//! | Jobs        | Claim up to a batch of eligible one-off jobs and run them |
//! | Tabs        | Run every registered module's due recurring tasks         |
//! | Reconcile   | Sweep claims older than the duration ceiling; always runs |
//!
//! A soft time budget (80% of the configured execution-time limit) stops the
//! first two phases early so the pass ends cleanly instead of being killed
//! mid-claim by the host environment.

pub mod budget;
pub mod db;
pub mod engine;
pub mod error;
pub mod interval;
pub mod queue;
pub mod registry;
pub mod types;

pub use budget::TimeBudget;
pub use engine::Cron;
pub use error::{CronError, Result};
pub use interval::{get_interval, postpone_until, update_interval};
pub use queue::queue_job;
pub use registry::{CronModule, HandlerRegistry, JobHandler, ModuleRegistry, RecurringTask};
pub use types::{CronEvent, JobOutcome, JobQueueSelection, QueueOptions, QueuedJob};
