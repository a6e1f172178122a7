//! Alert history (immutable audit log) and the delivery outbox.
//!
//! Both tables carry a unique fingerprint; a collision on insert is the
//! success path for "already seen" and is never surfaced as an error.

use anyhow::Result;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use super::db::Database;

/// Pending or delivered outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRow {
    pub outbox_id: i64,
    pub ts: i64,
    pub chat_id: i64,
    pub text: String,
    pub fingerprint: String,
    pub sent_ok: bool,
    pub sent_ts: Option<i64>,
    pub failed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertHistoryRow {
    pub alert_id: i64,
    pub coin_id: Option<i64>,
    pub hot_id: Option<i64>,
    pub ts: i64,
    pub kind: String,
    pub payload_json: String,
    pub fingerprint: String,
}

/// Insert an alert-history row inside an already-open transaction. Returns
/// false when the fingerprint was already recorded.
pub(crate) fn record_alert_in(
    conn: &Connection,
    coin_id: Option<i64>,
    hot_id: Option<i64>,
    ts: i64,
    kind: &str,
    payload_json: &str,
    fingerprint: &str,
) -> Result<bool> {
    let n = conn.execute(
        "INSERT OR IGNORE INTO alert_history (coin_id, hot_id, ts, kind, payload_json, fingerprint) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![coin_id, hot_id, ts, kind, payload_json, fingerprint],
    )?;
    Ok(n > 0)
}

impl Database {
    /// Idempotent audit insert keyed by fingerprint.
    pub fn record_alert(
        &self,
        coin_id: Option<i64>,
        hot_id: Option<i64>,
        ts: i64,
        kind: &str,
        payload_json: &str,
        fingerprint: &str,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            record_alert_in(conn, coin_id, hot_id, ts, kind, payload_json, fingerprint)
        })
    }

    pub fn recent_alerts(&self, limit: usize) -> Result<Vec<AlertHistoryRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT alert_id, coin_id, hot_id, ts, kind, payload_json, fingerprint \
                 FROM alert_history ORDER BY ts DESC, alert_id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit], |row| {
                Ok(AlertHistoryRow {
                    alert_id: row.get(0)?,
                    coin_id: row.get(1)?,
                    hot_id: row.get(2)?,
                    ts: row.get(3)?,
                    kind: row.get(4)?,
                    payload_json: row.get(5)?,
                    fingerprint: row.get(6)?,
                })
            })?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }

    /// Queue a message for delivery. Returns false when the fingerprint is
    /// already queued or sent (success path, not an error).
    pub fn enqueue_outbox(
        &self,
        ts: i64,
        chat_id: i64,
        text: &str,
        fingerprint: &str,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO outbox (ts, chat_id, text, fingerprint, sent_ok) \
                 VALUES (?1, ?2, ?3, ?4, 0)",
                params![ts, chat_id, text, fingerprint],
            )?;
            Ok(n > 0)
        })
    }

    /// Undelivered rows in enqueue order.
    pub fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT outbox_id, ts, chat_id, text, fingerprint, sent_ok, sent_ts, failed \
                 FROM outbox WHERE sent_ok = 0 AND failed = 0 \
                 ORDER BY ts ASC, outbox_id ASC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit], |row| {
                Ok(OutboxRow {
                    outbox_id: row.get(0)?,
                    ts: row.get(1)?,
                    chat_id: row.get(2)?,
                    text: row.get(3)?,
                    fingerprint: row.get(4)?,
                    sent_ok: row.get::<_, i64>(5)? != 0,
                    sent_ts: row.get(6)?,
                    failed: row.get::<_, i64>(7)? != 0,
                })
            })?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }

    pub fn mark_outbox_sent(&self, outbox_id: i64, sent_ts: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE outbox SET sent_ok = 1, sent_ts = ?2 WHERE outbox_id = ?1",
                params![outbox_id, sent_ts],
            )?;
            Ok(())
        })
    }

    /// Permanent-failure marker; the row will not be retried.
    pub fn mark_outbox_failed(&self, outbox_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE outbox SET failed = 1 WHERE outbox_id = ?1",
                params![outbox_id],
            )?;
            Ok(())
        })
    }

    /// (pending, sent, failed) counts for health reporting.
    pub fn outbox_counts(&self) -> Result<(i64, i64, i64)> {
        self.with_conn(|conn| {
            let row = conn.query_row(
                "SELECT \
                     SUM(CASE WHEN sent_ok = 0 AND failed = 0 THEN 1 ELSE 0 END), \
                     SUM(CASE WHEN sent_ok = 1 THEN 1 ELSE 0 END), \
                     SUM(CASE WHEN failed = 1 THEN 1 ELSE 0 END) \
                 FROM outbox",
                [],
                |row| {
                    Ok((
                        row.get::<_, Option<i64>>(0)?.unwrap_or(0),
                        row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                        row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                    ))
                },
            )?;
            Ok(row)
        })
    }

    /// Age out delivered outbox rows and old audit history. `dry_run`
    /// returns the counts without deleting. Returns (history, outbox, mints).
    pub fn cleanup_history(&self, now: i64, days_to_keep: i64, dry_run: bool) -> Result<(i64, i64, i64)> {
        let cutoff = now - days_to_keep * 86_400;
        self.with_tx(|conn| {
            let history: i64 = conn.query_row(
                "SELECT COUNT(*) FROM alert_history WHERE ts < ?1",
                params![cutoff],
                |r| r.get(0),
            )?;
            let outbox: i64 = conn.query_row(
                "SELECT COUNT(*) FROM outbox WHERE (sent_ok = 1 OR failed = 1) AND ts < ?1",
                params![cutoff],
                |r| r.get(0),
            )?;
            let mints: i64 = conn.query_row(
                "SELECT COUNT(*) FROM mint_events WHERE received_at < ?1",
                params![cutoff],
                |r| r.get(0),
            )?;

            if !dry_run {
                conn.execute("DELETE FROM alert_history WHERE ts < ?1", params![cutoff])?;
                conn.execute(
                    "DELETE FROM outbox WHERE (sent_ok = 1 OR failed = 1) AND ts < ?1",
                    params![cutoff],
                )?;
                conn.execute(
                    "DELETE FROM mint_events WHERE received_at < ?1",
                    params![cutoff],
                )?;
            }

            Ok((history, outbox, mints))
        })
    }
}
