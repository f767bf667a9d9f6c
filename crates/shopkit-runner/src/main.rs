use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use shopkit_core::config::ShopkitConfig;
use shopkit_cron::{
    Cron, CronEvent, HandlerRegistry, JobQueueSelection, ModuleRegistry, QueueOptions,
};

/// External trigger for the shopkit cron subsystem.
///
/// Invoke `shopkit-cron run` from OS cron or a systemd timer on whatever
/// cadence suits the deployment; overlapping invocations are safe.
#[derive(Parser)]
#[command(name = "shopkit-cron", version, about = "Shopkit background job & cron runner")]
struct Cli {
    /// Path to shopkit.toml (falls back to SHOPKIT_CONFIG, then
    /// ~/.shopkit/shopkit.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute one cron pass: claim queued jobs, run due recurring tasks,
    /// sweep stale claims
    Run {
        /// Skip recurring tasks on this pass
        #[arg(long)]
        no_tabs: bool,
        /// Skip the one-off job queue on this pass
        #[arg(long)]
        no_jobs: bool,
        /// Process only jobs filed under this queue name
        #[arg(long, conflicts_with = "no_jobs")]
        queue: Option<String>,
    },
    /// Add a one-off job to the queue
    Queue {
        /// Dispatch name, e.g. "orders::send_receipts"
        handler: String,
        /// JSON argument array passed to the handler
        #[arg(default_value = "[]")]
        params: String,
        /// Re-queue the job when the handler reports an explicit failure
        #[arg(long)]
        retry_on_fail: bool,
        /// Drop the job silently when an identical one is already queued
        #[arg(long)]
        no_duplicate: bool,
        /// Queue partition to file the job under
        #[arg(long)]
        queue: Option<String>,
        /// RFC 3339 instant before which the job must not be claimed
        #[arg(long)]
        available_at: Option<String>,
    },
    /// Defer a recurring task until the given RFC 3339 instant
    Postpone { code: String, until: String },
    /// Mark a recurring task as run now (or at the given RFC 3339 instant)
    Touch { code: String, at: Option<String> },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shopkit=info,shopkit_cron=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: explicit path > SHOPKIT_CONFIG env > ~/.shopkit/shopkit.toml
    let config_path = cli.config.or_else(|| std::env::var("SHOPKIT_CONFIG").ok());
    let config = ShopkitConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        ShopkitConfig::default()
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let conn = rusqlite::Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

    // Application job handlers and cron modules are registered here by the
    // deployment build; the stock runner ships none of its own. Jobs queued
    // for unregistered handlers resolve as not executable and are dropped
    // with a JobFailed event.
    let handlers = HandlerRegistry::new();
    let modules = ModuleRegistry::new();

    let (events_tx, mut events_rx) = tokio::sync::mpsc::channel::<CronEvent>(256);
    let cron = Cron::new(conn, config.cron.clone(), handlers, modules, Some(events_tx))?;

    match cli.command {
        Command::Run {
            no_tabs,
            no_jobs,
            queue,
        } => {
            let jobs = match (no_jobs, queue) {
                (true, _) => JobQueueSelection::Skip,
                (false, Some(name)) => JobQueueSelection::Queue(name),
                (false, None) => JobQueueSelection::All,
            };
            cron.execute_cron(!no_tabs, jobs)?;
            info!("cron pass complete");
        }
        Command::Queue {
            handler,
            params,
            retry_on_fail,
            no_duplicate,
            queue,
            available_at,
        } => {
            let params: Vec<serde_json::Value> =
                serde_json::from_str(&params).context("params must be a JSON array")?;
            let options = QueueOptions {
                available_at: available_at.as_deref().map(parse_instant).transpose()?,
                queue_name: queue,
            };
            cron.queue_job(&handler, &params, retry_on_fail, !no_duplicate, options)?;
            info!(%handler, "job queued");
        }
        Command::Postpone { code, until } => {
            let until = parse_instant(&until)?;
            shopkit_cron::postpone_until(cron.connection(), &code, until)?;
            info!(record_code = %code, until = %until, "task postponed");
        }
        Command::Touch { code, at } => {
            let at = at.as_deref().map(parse_instant).transpose()?;
            shopkit_cron::update_interval(cron.connection(), &code, at)?;
            info!(record_code = %code, "interval updated");
        }
    }

    // Everything the pass reported lands in the log; a deployment can swap
    // this loop for delivery to its alerting channel.
    while let Ok(event) = events_rx.try_recv() {
        warn!(event = ?event, "cron event");
    }

    Ok(())
}

fn parse_instant(value: &str) -> anyhow::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("not an RFC 3339 timestamp: {value}"))
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
