use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};

use crate::error::Result;

/// Record that a recurring task ran (or should be considered run) at `at`,
/// defaulting to now. Lazily creates the interval row.
pub fn update_interval(conn: &Connection, code: &str, at: Option<DateTime<Utc>>) -> Result<()> {
    let at = at.unwrap_or_else(Utc::now).to_rfc3339();
    conn.execute(
        "INSERT INTO cron_intervals (record_code, updated_at) VALUES (?1, ?2)
         ON CONFLICT(record_code) DO UPDATE SET updated_at = excluded.updated_at",
        rusqlite::params![code, at],
    )?;
    Ok(())
}

/// Defer a recurring task's next eligibility until `until` without touching
/// its last-completed timestamp.
pub fn postpone_until(conn: &Connection, code: &str, until: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO cron_intervals (record_code, postpone_until) VALUES (?1, ?2)
         ON CONFLICT(record_code) DO UPDATE SET postpone_until = excluded.postpone_until",
        rusqlite::params![code, until.to_rfc3339()],
    )?;
    Ok(())
}

/// Effective last-considered run time for `code`:
/// `max(updated_at, postpone_until)`.
///
/// A never-seen code is initialised to now and that instant returned, so a
/// freshly registered task waits one full interval before its first run.
pub fn get_interval(conn: &Connection, code: &str) -> Result<DateTime<Utc>> {
    let row: Option<(Option<String>, Option<String>)> = conn
        .query_row(
            "SELECT updated_at, postpone_until FROM cron_intervals WHERE record_code = ?1",
            [code],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    if let Some((updated_at, postponed)) = row {
        let effective = parse_rfc3339(updated_at).max(parse_rfc3339(postponed));
        if let Some(at) = effective {
            return Ok(at);
        }
        // row exists but holds no usable timestamp: fall through and
        // initialise it like a never-seen code
    }

    let now = Utc::now();
    update_interval(conn, code, Some(now))?;
    Ok(now)
}

fn parse_rfc3339(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use chrono::Duration;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open failed");
        init_db(&conn).expect("init failed");
        conn
    }

    #[test]
    fn unseen_code_initialises_to_now() {
        let conn = test_conn();
        let before = Utc::now();
        let at = get_interval(&conn, "shop_cleanup").unwrap();
        assert!(at >= before && at <= Utc::now());

        // the row now exists and returns the stored instant
        let again = get_interval(&conn, "shop_cleanup").unwrap();
        assert_eq!(at.timestamp(), again.timestamp());
    }

    #[test]
    fn explicit_update_is_returned() {
        let conn = test_conn();
        let at = Utc::now() - Duration::minutes(90);
        update_interval(&conn, "shop_cleanup", Some(at)).unwrap();
        assert_eq!(get_interval(&conn, "shop_cleanup").unwrap(), at);
    }

    #[test]
    fn later_postponement_wins() {
        let conn = test_conn();
        let ran = Utc::now() - Duration::minutes(90);
        let deferred = Utc::now() + Duration::minutes(120);
        update_interval(&conn, "shop_reindex", Some(ran)).unwrap();
        postpone_until(&conn, "shop_reindex", deferred).unwrap();

        assert_eq!(get_interval(&conn, "shop_reindex").unwrap(), deferred);
    }

    #[test]
    fn past_postponement_does_not_mask_newer_run() {
        let conn = test_conn();
        let deferred = Utc::now() - Duration::minutes(120);
        let ran = Utc::now() - Duration::minutes(5);
        postpone_until(&conn, "shop_reindex", deferred).unwrap();
        update_interval(&conn, "shop_reindex", Some(ran)).unwrap();

        assert_eq!(get_interval(&conn, "shop_reindex").unwrap(), ran);
    }

    #[test]
    fn postpone_alone_creates_the_row() {
        let conn = test_conn();
        let deferred = Utc::now() + Duration::minutes(30);
        postpone_until(&conn, "shop_export", deferred).unwrap();
        assert_eq!(get_interval(&conn, "shop_export").unwrap(), deferred);
    }

    #[test]
    fn update_does_not_clear_postponement() {
        let conn = test_conn();
        let deferred = Utc::now() + Duration::minutes(60);
        postpone_until(&conn, "shop_export", deferred).unwrap();
        update_interval(&conn, "shop_export", None).unwrap();

        // postpone_until is still later than the fresh updated_at
        assert_eq!(get_interval(&conn, "shop_export").unwrap(), deferred);
    }
}
