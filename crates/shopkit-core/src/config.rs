use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// One-off jobs claimed per cron pass unless overridden.
pub const DEFAULT_JOB_BATCH_SIZE: u32 = 5;
/// Seconds a claim may stand before the sweeper presumes the worker dead.
pub const DEFAULT_MAX_JOB_DURATION_SECS: u64 = 3600; // one hour
/// Claim attempts a timed-out job may accumulate before it is dropped.
pub const DEFAULT_TIMEOUT_RETRIES: u32 = 5;

/// Top-level config (shopkit.toml + SHOPKIT_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShopkitConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cron: CronConfig,
}

impl Default for ShopkitConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            cron: CronConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Cron subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronConfig {
    /// Soft ceiling on one cron pass, in seconds. The scheduler stops
    /// starting new work at 80% of this value. 0 means unlimited.
    /// Override with env var: SHOPKIT_CRON__TIME_LIMIT_SECONDS=120
    #[serde(default)]
    pub time_limit_seconds: u64,
    /// How many one-off jobs a single pass may claim.
    #[serde(default = "default_job_batch_size")]
    pub job_batch_size: u32,
    /// Randomise batch processing order. Helps overlapping invocations
    /// avoid fighting over the same rows.
    #[serde(default)]
    pub job_batch_shuffle: bool,
    /// When set, passes only claim jobs filed under this queue name.
    #[serde(default)]
    pub queue_name: Option<String>,
    /// Jobs claimed longer ago than this are swept as timed out. 0 disables
    /// the sweep.
    #[serde(default = "default_max_job_duration")]
    pub max_job_duration_seconds: u64,
    /// Timed-out jobs with this many claim attempts are deleted instead of
    /// re-queued.
    #[serde(default = "default_timeout_retries")]
    pub timeout_retries: u32,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            time_limit_seconds: 0,
            job_batch_size: DEFAULT_JOB_BATCH_SIZE,
            job_batch_shuffle: false,
            queue_name: None,
            max_job_duration_seconds: DEFAULT_MAX_JOB_DURATION_SECS,
            timeout_retries: DEFAULT_TIMEOUT_RETRIES,
        }
    }
}

fn default_job_batch_size() -> u32 {
    DEFAULT_JOB_BATCH_SIZE
}
fn default_max_job_duration() -> u64 {
    DEFAULT_MAX_JOB_DURATION_SECS
}
fn default_timeout_retries() -> u32 {
    DEFAULT_TIMEOUT_RETRIES
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.shopkit/shopkit.db", home)
}

impl ShopkitConfig {
    /// Load config from a TOML file with SHOPKIT_* env var overrides.
    ///
    /// Nested keys use a double underscore in the env name, e.g.
    /// `SHOPKIT_CRON__JOB_BATCH_SIZE=20` sets `cron.job_batch_size`.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.shopkit/shopkit.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: ShopkitConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("SHOPKIT_").split("__"))
            .extract()
            .map_err(|e| crate::error::ShopkitError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.shopkit/shopkit.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = CronConfig::default();
        assert_eq!(config.time_limit_seconds, 0);
        assert_eq!(config.job_batch_size, 5);
        assert!(!config.job_batch_shuffle);
        assert_eq!(config.max_job_duration_seconds, 3600);
        assert_eq!(config.timeout_retries, 5);
        assert!(config.queue_name.is_none());
    }

    #[test]
    fn toml_section_overrides_defaults() {
        let config: ShopkitConfig = Figment::new()
            .merge(figment::providers::Toml::string(
                r#"
                [cron]
                job_batch_size = 20
                job_batch_shuffle = true
                queue_name = "mail"
                "#,
            ))
            .extract()
            .expect("extract failed");
        assert_eq!(config.cron.job_batch_size, 20);
        assert!(config.cron.job_batch_shuffle);
        assert_eq!(config.cron.queue_name.as_deref(), Some("mail"));
        // untouched fields keep their defaults
        assert_eq!(config.cron.timeout_retries, 5);
    }
}
