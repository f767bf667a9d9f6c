use thiserror::Error;

/// Errors that can occur within the cron subsystem.
#[derive(Debug, Error)]
pub enum CronError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Job parameters could not be encoded for the params column.
    #[error("Parameter encoding error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The dispatch name is malformed or has no registered handler.
    #[error("Job is not executable: {handler}")]
    NotExecutable { handler: String },
}

pub type Result<T> = std::result::Result<T, CronError>;
