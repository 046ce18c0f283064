//! Database operations for tracked TestFlight monitors.
//!
//! The scheduler is the only writer of `status`; the facade writes the
//! schedule fields (`interval_secs`, `duration_secs`, `expire_at`,
//! `notify_mode`, `enabled`). Timestamps are stored as RFC3339 TEXT.

use crate::core::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Availability state of a tracked TestFlight link.
///
/// `Checking` is transient: it holds only while a check is in flight and is
/// never trusted across restarts (see [`reset_interrupted`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MonitorStatus {
    Available,
    Full,
    Checking,
    Error,
    Expired,
}

/// Repeat-notification policy for a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotifyMode {
    /// Notify on every transition into `available`.
    Loop,
    /// Notify once, then auto-pause the monitor.
    Once,
    /// Notify on every transition into `available`; keep polling.
    OnlyAvailable,
}

/// A tracked TestFlight link row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Monitor {
    pub id: i64,
    pub app_id: String,
    /// Empty until resolved from the join page.
    pub app_name: String,
    pub icon_url: String,
    #[serde(rename = "testFlightUrl")]
    pub testflight_url: String,
    pub status: MonitorStatus,
    /// Seconds between checks.
    pub interval: u32,
    /// Total seconds the monitor stays active; 0 = unbounded.
    pub duration: u32,
    pub notify_mode: NotifyMode,
    pub enabled: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub expire_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Field values for a monitor being created.
#[derive(Debug, Clone)]
pub struct NewMonitor {
    pub app_id: String,
    pub app_name: String,
    pub icon_url: String,
    pub testflight_url: String,
    pub status: MonitorStatus,
    pub interval: u32,
    pub duration: u32,
    pub notify_mode: NotifyMode,
    pub enabled: bool,
    /// Set when the row was probed at creation time.
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub expire_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

const MONITOR_COLUMNS: &str = "id, app_id, app_name, icon_url, testflight_url, status, \
     interval_secs, duration_secs, notify_mode, enabled, last_check, last_error, expire_at, created_at";

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc))
}

fn required_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    parse_ts(s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("invalid RFC3339 timestamp: {s}").into(),
        )
    })
}

fn column_enum<T: FromStr>(idx: usize, s: &str) -> rusqlite::Result<T> {
    T::from_str(s).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unrecognized value: {s}").into(),
        )
    })
}

fn parse_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Monitor> {
    let status_raw: String = row.get(5)?;
    let mode_raw: String = row.get(8)?;
    let created_raw: String = row.get(13)?;
    Ok(Monitor {
        id: row.get(0)?,
        app_id: row.get(1)?,
        app_name: row.get(2)?,
        icon_url: row.get(3)?,
        testflight_url: row.get(4)?,
        status: column_enum(5, &status_raw)?,
        interval: row.get(6)?,
        duration: row.get(7)?,
        notify_mode: column_enum(8, &mode_raw)?,
        enabled: row.get::<_, i32>(9)? != 0,
        last_check: row.get::<_, Option<String>>(10)?.as_deref().and_then(parse_ts),
        last_error: row.get(11)?,
        expire_at: row.get::<_, Option<String>>(12)?.as_deref().and_then(parse_ts),
        created_at: required_ts(13, &created_raw)?,
    })
}

/// Insert a new monitor and return the stored row.
pub fn insert_monitor(conn: &Connection, m: &NewMonitor) -> AppResult<Monitor> {
    conn.execute(
        "INSERT INTO monitors (app_id, app_name, icon_url, testflight_url, status,
             interval_secs, duration_secs, notify_mode, enabled, last_check, last_error,
             expire_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            m.app_id,
            m.app_name,
            m.icon_url,
            m.testflight_url,
            m.status.to_string(),
            m.interval,
            m.duration,
            m.notify_mode.to_string(),
            m.enabled as i32,
            m.last_check.map(|t| t.to_rfc3339()),
            m.last_error,
            m.expire_at.map(|t| t.to_rfc3339()),
            m.created_at.to_rfc3339(),
        ],
    )?;

    let id = conn.last_insert_rowid();
    get_monitor(conn, id)?.ok_or(AppError::NotFound(id))
}

/// Get a monitor by id.
pub fn get_monitor(conn: &Connection, id: i64) -> AppResult<Option<Monitor>> {
    let sql = format!("SELECT {MONITOR_COLUMNS} FROM monitors WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], parse_row).optional()?)
}

/// Find a monitor by TestFlight app id (duplicate detection at creation).
pub fn find_by_app_id(conn: &Connection, app_id: &str) -> AppResult<Option<Monitor>> {
    let sql = format!("SELECT {MONITOR_COLUMNS} FROM monitors WHERE app_id = ?1 LIMIT 1");
    Ok(conn.query_row(&sql, params![app_id], parse_row).optional()?)
}

/// All monitors in creation order.
pub fn list_monitors(conn: &Connection) -> AppResult<Vec<Monitor>> {
    let sql = format!("SELECT {MONITOR_COLUMNS} FROM monitors ORDER BY id ASC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], parse_row)?;

    let mut monitors = Vec::new();
    for row in rows {
        monitors.push(row?);
    }
    Ok(monitors)
}

/// Enabled monitors, for scheduler startup.
pub fn list_enabled(conn: &Connection) -> AppResult<Vec<Monitor>> {
    let sql = format!("SELECT {MONITOR_COLUMNS} FROM monitors WHERE enabled = 1 ORDER BY id ASC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], parse_row)?;

    let mut monitors = Vec::new();
    for row in rows {
        monitors.push(row?);
    }
    Ok(monitors)
}

/// Flip the enabled flag without touching the schedule fields.
pub fn set_enabled(conn: &Connection, id: i64, enabled: bool) -> AppResult<()> {
    conn.execute(
        "UPDATE monitors SET enabled = ?1 WHERE id = ?2",
        params![enabled as i32, id],
    )?;
    Ok(())
}

/// Persist updated schedule fields. `expire_at` must already be recomputed
/// from `created_at + duration` by the caller.
pub fn update_schedule(
    conn: &Connection,
    id: i64,
    interval: u32,
    duration: u32,
    notify_mode: NotifyMode,
    expire_at: Option<DateTime<Utc>>,
) -> AppResult<()> {
    conn.execute(
        "UPDATE monitors
         SET interval_secs = ?1, duration_secs = ?2, notify_mode = ?3, expire_at = ?4
         WHERE id = ?5",
        params![
            interval,
            duration,
            notify_mode.to_string(),
            expire_at.map(|t| t.to_rfc3339()),
            id
        ],
    )?;
    Ok(())
}

/// Mark a monitor as having a check in flight.
pub fn mark_checking(conn: &Connection, id: i64) -> AppResult<()> {
    conn.execute(
        "UPDATE monitors SET status = ?1 WHERE id = ?2",
        params![MonitorStatus::Checking.to_string(), id],
    )?;
    Ok(())
}

/// Apply a successful check: terminal status, completion time, error cleared.
pub fn apply_check_success(
    conn: &Connection,
    id: i64,
    status: MonitorStatus,
    checked_at: DateTime<Utc>,
) -> AppResult<()> {
    conn.execute(
        "UPDATE monitors SET status = ?1, last_check = ?2, last_error = NULL WHERE id = ?3",
        params![status.to_string(), checked_at.to_rfc3339(), id],
    )?;
    Ok(())
}

/// Apply a failed check: status `error`, cause captured, completion time set.
pub fn apply_check_error(conn: &Connection, id: i64, error: &str, checked_at: DateTime<Utc>) -> AppResult<()> {
    conn.execute(
        "UPDATE monitors SET status = ?1, last_check = ?2, last_error = ?3 WHERE id = ?4",
        params![MonitorStatus::Error.to_string(), checked_at.to_rfc3339(), error, id],
    )?;
    Ok(())
}

/// Fill in page metadata, but only where it is still empty: the first
/// successful parse wins and later page changes don't churn the fields.
pub fn fill_metadata(conn: &Connection, id: i64, app_name: &str, icon_url: &str) -> AppResult<()> {
    conn.execute(
        "UPDATE monitors
         SET app_name = CASE WHEN app_name = '' THEN ?1 ELSE app_name END,
             icon_url = CASE WHEN icon_url = '' THEN ?2 ELSE icon_url END
         WHERE id = ?3",
        params![app_name, icon_url, id],
    )?;
    Ok(())
}

/// Retire a monitor whose duration has elapsed.
pub fn mark_expired(conn: &Connection, id: i64) -> AppResult<()> {
    conn.execute(
        "UPDATE monitors SET status = ?1, enabled = 0 WHERE id = ?2",
        params![MonitorStatus::Expired.to_string(), id],
    )?;
    Ok(())
}

/// Delete a monitor. Returns false if no row existed (idempotent).
pub fn delete_monitor(conn: &Connection, id: i64) -> AppResult<bool> {
    let rows = conn.execute("DELETE FROM monitors WHERE id = ?1", params![id])?;
    Ok(rows > 0)
}

/// Startup recovery: any row persisted as `checking` was interrupted by a
/// crash mid-check. Reset it to `error` before scheduling resumes; the
/// transient state is never durable truth. Returns the number of rows reset.
pub fn reset_interrupted(conn: &Connection) -> AppResult<u32> {
    let rows = conn.execute(
        "UPDATE monitors SET status = ?1, last_error = 'interrupted' WHERE status = ?2",
        params![MonitorStatus::Error.to_string(), MonitorStatus::Checking.to_string()],
    )?;
    Ok(rows as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migrations::run_migrations_for_test;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use rusqlite::Connection;

    fn make_conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations_for_test(&mut conn).unwrap();
        conn
    }

    fn sample(url: &str, app_id: &str) -> NewMonitor {
        NewMonitor {
            app_id: app_id.to_string(),
            app_name: String::new(),
            icon_url: String::new(),
            testflight_url: url.to_string(),
            status: MonitorStatus::Full,
            interval: 30,
            duration: 0,
            notify_mode: NotifyMode::Once,
            enabled: true,
            last_check: None,
            last_error: None,
            expire_at: None,
            created_at: Utc::now(),
        }
    }

    // ── insert / get ─────────────────────────────────────────────────────────

    #[test]
    fn insert_and_get_roundtrip() {
        let conn = make_conn();
        let m = insert_monitor(&conn, &sample("https://testflight.apple.com/join/abc123", "abc123")).unwrap();

        let fetched = get_monitor(&conn, m.id).unwrap().expect("must exist");
        assert_eq!(fetched.app_id, "abc123");
        assert_eq!(fetched.testflight_url, "https://testflight.apple.com/join/abc123");
        assert_eq!(fetched.status, MonitorStatus::Full);
        assert_eq!(fetched.interval, 30);
        assert_eq!(fetched.duration, 0);
        assert_eq!(fetched.notify_mode, NotifyMode::Once);
        assert!(fetched.enabled);
        assert!(fetched.last_check.is_none());
        assert!(fetched.expire_at.is_none());
    }

    #[test]
    fn get_nonexistent_returns_none() {
        let conn = make_conn();
        assert!(get_monitor(&conn, 9999).unwrap().is_none());
    }

    #[test]
    fn insert_preserves_expire_at() {
        let conn = make_conn();
        let created = Utc::now();
        let mut new = sample("https://testflight.apple.com/join/xyz", "xyz");
        new.duration = 3600;
        new.created_at = created;
        new.expire_at = Some(created + Duration::seconds(3600));

        let m = insert_monitor(&conn, &new).unwrap();
        let exp = m.expire_at.expect("expire_at must be stored");
        assert_eq!(exp.timestamp(), (created + Duration::seconds(3600)).timestamp());
    }

    #[test]
    fn insert_preserves_last_check() {
        let conn = make_conn();
        let probed_at = Utc::now();
        let mut new = sample("https://testflight.apple.com/join/probed", "probed");
        new.last_check = Some(probed_at);

        let m = insert_monitor(&conn, &new).unwrap();
        let stored = m.last_check.expect("last_check must be stored");
        assert_eq!(stored.timestamp(), probed_at.timestamp());
    }

    #[test]
    fn duplicate_url_rejected_by_unique_constraint() {
        let conn = make_conn();
        insert_monitor(&conn, &sample("https://testflight.apple.com/join/dup", "dup")).unwrap();
        let result = insert_monitor(&conn, &sample("https://testflight.apple.com/join/dup", "dup2"));
        assert!(result.is_err(), "second insert of same URL must fail");
    }

    // ── list ─────────────────────────────────────────────────────────────────

    #[test]
    fn list_returns_creation_order() {
        let conn = make_conn();
        insert_monitor(&conn, &sample("https://testflight.apple.com/join/a", "a")).unwrap();
        insert_monitor(&conn, &sample("https://testflight.apple.com/join/b", "b")).unwrap();
        insert_monitor(&conn, &sample("https://testflight.apple.com/join/c", "c")).unwrap();

        let all = list_monitors(&conn).unwrap();
        let ids: Vec<&str> = all.iter().map(|m| m.app_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"], "list must be in creation order");
    }

    #[test]
    fn list_enabled_excludes_disabled() {
        let conn = make_conn();
        let m1 = insert_monitor(&conn, &sample("https://testflight.apple.com/join/on", "on")).unwrap();
        let m2 = insert_monitor(&conn, &sample("https://testflight.apple.com/join/off", "off")).unwrap();
        set_enabled(&conn, m2.id, false).unwrap();

        let enabled = list_enabled(&conn).unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, m1.id);
    }

    // ── find_by_app_id ───────────────────────────────────────────────────────

    #[test]
    fn find_by_app_id_matches() {
        let conn = make_conn();
        insert_monitor(&conn, &sample("https://testflight.apple.com/join/findme", "findme")).unwrap();
        assert!(find_by_app_id(&conn, "findme").unwrap().is_some());
        assert!(find_by_app_id(&conn, "nope").unwrap().is_none());
    }

    // ── check result application ─────────────────────────────────────────────

    #[test]
    fn apply_check_success_clears_error() {
        let conn = make_conn();
        let m = insert_monitor(&conn, &sample("https://testflight.apple.com/join/ok", "ok")).unwrap();
        apply_check_error(&conn, m.id, "timeout", Utc::now()).unwrap();

        apply_check_success(&conn, m.id, MonitorStatus::Available, Utc::now()).unwrap();

        let fetched = get_monitor(&conn, m.id).unwrap().unwrap();
        assert_eq!(fetched.status, MonitorStatus::Available);
        assert!(fetched.last_error.is_none(), "last_error must be cleared on success");
        assert!(fetched.last_check.is_some());
    }

    #[test]
    fn apply_check_error_records_cause() {
        let conn = make_conn();
        let m = insert_monitor(&conn, &sample("https://testflight.apple.com/join/err", "err")).unwrap();

        apply_check_error(&conn, m.id, "HTTP request failed with status: 503", Utc::now()).unwrap();

        let fetched = get_monitor(&conn, m.id).unwrap().unwrap();
        assert_eq!(fetched.status, MonitorStatus::Error);
        assert_eq!(fetched.last_error.as_deref(), Some("HTTP request failed with status: 503"));
    }

    #[test]
    fn fill_metadata_only_when_empty() {
        let conn = make_conn();
        let m = insert_monitor(&conn, &sample("https://testflight.apple.com/join/meta", "meta")).unwrap();

        fill_metadata(&conn, m.id, "First Name", "https://icons/1.png").unwrap();
        fill_metadata(&conn, m.id, "Second Name", "https://icons/2.png").unwrap();

        let fetched = get_monitor(&conn, m.id).unwrap().unwrap();
        assert_eq!(fetched.app_name, "First Name", "first resolved name must stick");
        assert_eq!(fetched.icon_url, "https://icons/1.png");
    }

    // ── schedule updates ─────────────────────────────────────────────────────

    #[test]
    fn update_schedule_persists_fields() {
        let conn = make_conn();
        let m = insert_monitor(&conn, &sample("https://testflight.apple.com/join/sched", "sched")).unwrap();
        let new_expire = m.created_at + Duration::seconds(7200);

        update_schedule(&conn, m.id, 60, 7200, NotifyMode::Loop, Some(new_expire)).unwrap();

        let fetched = get_monitor(&conn, m.id).unwrap().unwrap();
        assert_eq!(fetched.interval, 60);
        assert_eq!(fetched.duration, 7200);
        assert_eq!(fetched.notify_mode, NotifyMode::Loop);
        assert_eq!(fetched.expire_at.unwrap().timestamp(), new_expire.timestamp());
    }

    #[test]
    fn mark_expired_disables() {
        let conn = make_conn();
        let m = insert_monitor(&conn, &sample("https://testflight.apple.com/join/exp", "exp")).unwrap();

        mark_expired(&conn, m.id).unwrap();

        let fetched = get_monitor(&conn, m.id).unwrap().unwrap();
        assert_eq!(fetched.status, MonitorStatus::Expired);
        assert!(!fetched.enabled);
    }

    // ── delete ───────────────────────────────────────────────────────────────

    #[test]
    fn delete_is_idempotent() {
        let conn = make_conn();
        let m = insert_monitor(&conn, &sample("https://testflight.apple.com/join/del", "del")).unwrap();

        assert!(delete_monitor(&conn, m.id).unwrap());
        assert!(!delete_monitor(&conn, m.id).unwrap(), "second delete must report no row");
        assert!(get_monitor(&conn, m.id).unwrap().is_none());
    }

    // ── startup recovery ─────────────────────────────────────────────────────

    #[test]
    fn reset_interrupted_recovers_checking_rows() {
        let conn = make_conn();
        let m1 = insert_monitor(&conn, &sample("https://testflight.apple.com/join/c1", "c1")).unwrap();
        let m2 = insert_monitor(&conn, &sample("https://testflight.apple.com/join/c2", "c2")).unwrap();
        mark_checking(&conn, m1.id).unwrap();

        let reset = reset_interrupted(&conn).unwrap();
        assert_eq!(reset, 1);

        let fetched = get_monitor(&conn, m1.id).unwrap().unwrap();
        assert_eq!(fetched.status, MonitorStatus::Error);
        assert_eq!(fetched.last_error.as_deref(), Some("interrupted"));

        let untouched = get_monitor(&conn, m2.id).unwrap().unwrap();
        assert_eq!(untouched.status, MonitorStatus::Full, "terminal statuses must be untouched");
    }

    // ── enum wire text ───────────────────────────────────────────────────────

    #[test]
    fn status_strings_are_snake_case() {
        assert_eq!(MonitorStatus::Available.to_string(), "available");
        assert_eq!(MonitorStatus::Expired.to_string(), "expired");
        assert_eq!(NotifyMode::OnlyAvailable.to_string(), "only_available");
        assert_eq!("only_available".parse::<NotifyMode>().unwrap(), NotifyMode::OnlyAvailable);
    }
}
