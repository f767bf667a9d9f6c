use rusqlite::Connection;

use crate::error::Result;

/// Initialise all tables for the cron subsystem. Safe to call on every
/// startup; CREATE IF NOT EXISTS means it's idempotent.
pub fn init_db(conn: &Connection) -> Result<()> {
    create_jobs_table(conn)?;
    create_intervals_table(conn)?;
    Ok(())
}

fn create_jobs_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS cron_jobs (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            queue_name   TEXT,
            handler      TEXT    NOT NULL,   -- 'Target::entry_point' dispatch name
            params       TEXT    NOT NULL DEFAULT '[]',  -- JSON argument array
            retry        INTEGER NOT NULL DEFAULT 0,
            version      INTEGER NOT NULL DEFAULT 1,     -- optimistic-concurrency counter
            attempts     INTEGER NOT NULL DEFAULT 0,
            created_at   TEXT    NOT NULL,   -- RFC 3339 UTC
            available_at TEXT,               -- NULL means immediately eligible
            started_at   TEXT                -- non-NULL while a claim is held
        ) STRICT;

        -- Eligibility scan: started_at IS NULL AND available_at <= now,
        -- ordered (attempts, id) so starved jobs surface first.
        CREATE INDEX IF NOT EXISTS idx_cron_jobs_eligible
            ON cron_jobs (started_at, attempts, id);
        ",
    )?;
    Ok(())
}

fn create_intervals_table(conn: &Connection) -> Result<()> {
    // Rows are created lazily the first time a record_code is touched and
    // are never deleted by this subsystem.
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS cron_intervals (
            record_code    TEXT NOT NULL PRIMARY KEY,
            updated_at     TEXT,   -- last run (or deemed-run) time
            postpone_until TEXT    -- defers eligibility when later than updated_at
        ) STRICT;
        ",
    )?;
    Ok(())
}
