//! Additive schema migrations.
//!
//! The base DDL is idempotent `CREATE TABLE IF NOT EXISTS`; this module
//! upgrades databases created by earlier builds. Migrations must stay
//! re-runnable: each step checks current shape before touching anything.

use anyhow::Result;
use rusqlite::{params, Connection};
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    ensure_column(conn, "hot_entries", "pct_targets", "TEXT NOT NULL DEFAULT '[]'")?;
    ensure_column(conn, "hot_entries", "mcap_targets", "TEXT NOT NULL DEFAULT '[]'")?;
    ensure_column(conn, "outbox", "failed", "INTEGER NOT NULL DEFAULT 0")?;
    fold_legacy_pct_target(conn)?;
    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn ensure_column(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
    if !has_column(conn, table, column)? {
        conn.execute(
            &format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl),
            [],
        )?;
        info!("Schema migration: added {}.{}", table, column);
    }
    Ok(())
}

/// Older databases carried a single signed `pct_target` per hot entry. Fold
/// it into the `pct_targets` array and materialize its trigger row, leaving
/// the legacy column in place so a rollback still reads it.
fn fold_legacy_pct_target(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT hot_id, pct_target FROM hot_entries \
         WHERE pct_target IS NOT NULL AND pct_targets = '[]'",
    )?;
    let legacy: Vec<(i64, f64)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .filter_map(|r| r.ok())
        .collect();

    for (hot_id, target) in &legacy {
        conn.execute(
            "UPDATE hot_entries SET pct_targets = ?2 WHERE hot_id = ?1",
            params![hot_id, serde_json::to_string(&vec![target])?],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO hot_trigger_state (hot_id, kind, value, fired) \
             VALUES (?1, 'pct', ?2, 0)",
            params![hot_id, target],
        )?;
    }

    if !legacy.is_empty() {
        info!(
            "Schema migration: folded {} legacy pct_target values into pct_targets",
            legacy.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE hot_entries (
                hot_id INTEGER PRIMARY KEY,
                chain TEXT NOT NULL,
                contract_address TEXT NOT NULL,
                symbol TEXT NOT NULL,
                display_name TEXT,
                added_at INTEGER NOT NULL,
                anchor_price REAL NOT NULL,
                anchor_mcap REAL,
                pct_target REAL,
                failsafe_fired INTEGER NOT NULL DEFAULT 0,
                coin_id INTEGER
            );
            CREATE TABLE hot_trigger_state (
                hot_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                value REAL NOT NULL,
                fired INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (hot_id, kind, value)
            ) WITHOUT ROWID;
            CREATE TABLE outbox (
                outbox_id INTEGER PRIMARY KEY,
                ts INTEGER NOT NULL,
                chat_id INTEGER NOT NULL,
                text TEXT NOT NULL,
                fingerprint TEXT NOT NULL UNIQUE,
                sent_ok INTEGER NOT NULL DEFAULT 0,
                sent_ts INTEGER
            );",
        )
        .unwrap();
        conn
    }

    #[test]
    fn legacy_pct_target_is_folded_once() {
        let conn = legacy_db();
        conn.execute(
            "INSERT INTO hot_entries (hot_id, chain, contract_address, symbol, added_at, anchor_price, pct_target) \
             VALUES (1, 'solana', 'mint1', 'AAA', 0, 2.0, -10.0)",
            [],
        )
        .unwrap();

        run(&conn).unwrap();
        // Second run must be a no-op.
        run(&conn).unwrap();

        let targets: String = conn
            .query_row("SELECT pct_targets FROM hot_entries WHERE hot_id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(targets, "[-10.0]");

        let rows: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM hot_trigger_state WHERE hot_id = 1 AND kind = 'pct'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn outbox_failed_column_is_added() {
        let conn = legacy_db();
        run(&conn).unwrap();
        assert!(has_column(&conn, "outbox", "failed").unwrap());
    }
}
