//! SQLite-backed persistence layer.
//!
//! One connection guarded by a parking_lot mutex; WAL mode keeps readers
//! (health endpoints, reports) from blocking the evaluator write path.
//! Samples are the source of truth; `long_state` is a rebuildable cache.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::sync::Arc;
use tracing::{info, warn};

use super::migrations;

const SCHEMA_SQL: &str = r#"
-- WAL for concurrent reads during evaluator writes
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA cache_size = -16000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS coins (
    coin_id INTEGER PRIMARY KEY,
    chain TEXT NOT NULL,
    token_address TEXT NOT NULL,
    symbol TEXT NOT NULL,
    name TEXT,
    decimals INTEGER,
    is_active INTEGER NOT NULL DEFAULT 1,
    UNIQUE (chain, token_address)
);

CREATE INDEX IF NOT EXISTS idx_coins_symbol ON coins(symbol);
CREATE INDEX IF NOT EXISTS idx_coins_is_active ON coins(is_active);

CREATE TABLE IF NOT EXISTS symbol_aliases (
    alias TEXT PRIMARY KEY,
    coin_id INTEGER NOT NULL REFERENCES coins(coin_id) ON DELETE CASCADE
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS long_watch (
    coin_id INTEGER PRIMARY KEY REFERENCES coins(coin_id) ON DELETE CASCADE,
    retrace_on INTEGER NOT NULL DEFAULT 1,
    stall_on INTEGER NOT NULL DEFAULT 1,
    breakout_on INTEGER NOT NULL DEFAULT 1,
    mcap_on INTEGER NOT NULL DEFAULT 1,
    retrace_pct REAL NOT NULL DEFAULT 15.0,
    stall_vol_pct REAL NOT NULL DEFAULT 30.0,
    stall_band_pct REAL NOT NULL DEFAULT 5.0,
    breakout_pct REAL NOT NULL DEFAULT 12.0,
    breakout_vol_x REAL NOT NULL DEFAULT 1.5,
    mcap_levels TEXT NOT NULL DEFAULT '[]',
    added_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS long_state (
    coin_id INTEGER PRIMARY KEY REFERENCES coins(coin_id) ON DELETE CASCADE,
    h12_high REAL, h12_low REAL,
    h24_high REAL, h24_low REAL,
    h72_high REAL, h72_low REAL,
    v12_sum REAL, v24_sum REAL,
    last_price REAL,
    last_mcap REAL,
    last_updated INTEGER,
    last_retrace_fire INTEGER,
    last_stall_fire INTEGER,
    last_breakout_fire INTEGER,
    last_mcap_fire INTEGER
);

CREATE INDEX IF NOT EXISTS idx_long_state_updated ON long_state(last_updated);

CREATE TABLE IF NOT EXISTS rolling_data_points (
    coin_id INTEGER NOT NULL REFERENCES coins(coin_id) ON DELETE CASCADE,
    ts INTEGER NOT NULL,
    price REAL NOT NULL,
    volume REAL NOT NULL,
    market_cap REAL
);

CREATE INDEX IF NOT EXISTS idx_rolling_coin_ts ON rolling_data_points(coin_id, ts);

CREATE TABLE IF NOT EXISTS hot_entries (
    hot_id INTEGER PRIMARY KEY,
    chain TEXT NOT NULL,
    contract_address TEXT NOT NULL,
    symbol TEXT NOT NULL,
    display_name TEXT,
    added_at INTEGER NOT NULL,
    anchor_price REAL NOT NULL,
    anchor_mcap REAL,
    pct_target REAL,
    pct_targets TEXT NOT NULL DEFAULT '[]',
    mcap_targets TEXT NOT NULL DEFAULT '[]',
    failsafe_fired INTEGER NOT NULL DEFAULT 0,
    coin_id INTEGER REFERENCES coins(coin_id) ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS hot_trigger_state (
    hot_id INTEGER NOT NULL REFERENCES hot_entries(hot_id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    value REAL NOT NULL,
    fired INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (hot_id, kind, value)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS alert_history (
    alert_id INTEGER PRIMARY KEY,
    coin_id INTEGER,
    hot_id INTEGER,
    ts INTEGER NOT NULL,
    kind TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    fingerprint TEXT NOT NULL UNIQUE
);

CREATE INDEX IF NOT EXISTS idx_alert_history_coin_ts ON alert_history(coin_id, ts);

CREATE TABLE IF NOT EXISTS outbox (
    outbox_id INTEGER PRIMARY KEY,
    ts INTEGER NOT NULL,
    chat_id INTEGER NOT NULL,
    text TEXT NOT NULL,
    fingerprint TEXT NOT NULL UNIQUE,
    sent_ok INTEGER NOT NULL DEFAULT 0,
    sent_ts INTEGER,
    failed INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_outbox_pending ON outbox(sent_ok, ts);

CREATE TABLE IF NOT EXISTS schedule_config (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    anchor_times_local TEXT NOT NULL,
    anchor_period_hours REAL NOT NULL,
    long_checkpoint_hours REAL NOT NULL,
    hot_interval_minutes REAL NOT NULL,
    cooldown_hours REAL NOT NULL,
    hysteresis_pct REAL NOT NULL,
    global_retrace_on INTEGER NOT NULL,
    global_stall_on INTEGER NOT NULL,
    global_breakout_on INTEGER NOT NULL,
    global_mcap_on INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS mint_events (
    mint TEXT PRIMARY KEY,
    signature TEXT NOT NULL,
    ts INTEGER NOT NULL,
    decimals INTEGER,
    is_first INTEGER NOT NULL DEFAULT 0,
    received_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_mint_events_received ON mint_events(received_at DESC);
"#;

/// Shared database handle. Cheap to clone; all clones use the same
/// mutex-guarded connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // we handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        migrations::run(&conn).context("Failed to run schema migrations")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if db_path != ":memory:" && journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let coins: i64 = conn
            .query_row("SELECT COUNT(*) FROM coins WHERE is_active = 1", [], |r| {
                r.get(0)
            })
            .unwrap_or(0);
        let pending: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM outbox WHERE sent_ok = 0 AND failed = 0",
                [],
                |r| r.get(0),
            )
            .unwrap_or(0);

        info!(
            "📊 Database ready at {} ({} active coins, {} pending outbox rows)",
            db_path, coins, pending
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// Run `f` while holding the connection lock.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` inside an IMMEDIATE transaction; rolls back on error.
    pub(crate) fn with_tx<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(&conn) {
            Ok(v) => {
                conn.execute_batch("COMMIT")?;
                Ok(v)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// On-disk size of the main database file, in bytes.
    pub fn file_size_bytes(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let page_count: u64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
            let page_size: u64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
            Ok(page_count * page_size)
        })
    }

    /// Ask SQLite to return freed pages to the OS. Used by the admin
    /// memory endpoint and after large cleanups.
    pub fn shrink(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch("PRAGMA shrink_memory; PRAGMA optimize;")?;
            Ok(())
        })
    }
}
