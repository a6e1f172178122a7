//! Coin registry: identity, long-watch subscriptions, symbol aliases.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::db::Database;
use crate::models::{Coin, LongState, LongWatch};

fn coin_from_row(row: &Row) -> rusqlite::Result<Coin> {
    Ok(Coin {
        coin_id: row.get(0)?,
        chain: row.get(1)?,
        token_address: row.get(2)?,
        symbol: row.get(3)?,
        name: row.get(4)?,
        decimals: row.get(5)?,
        is_active: row.get::<_, i64>(6)? != 0,
    })
}

const COIN_COLS: &str = "coin_id, chain, token_address, symbol, name, decimals, is_active";

const WATCH_COLS: &str = "coin_id, retrace_on, stall_on, breakout_on, mcap_on, \
     retrace_pct, stall_vol_pct, stall_band_pct, breakout_pct, breakout_vol_x, \
     added_at, mcap_levels";

impl Database {
    /// Register a coin, reactivating a previously soft-deleted row for the
    /// same `(chain, token_address)`.
    pub fn upsert_coin(
        &self,
        chain: &str,
        token_address: &str,
        symbol: &str,
        name: Option<&str>,
        decimals: Option<i64>,
    ) -> Result<Coin> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO coins (chain, token_address, symbol, name, decimals, is_active) \
                 VALUES (?1, ?2, ?3, ?4, ?5, 1) \
                 ON CONFLICT(chain, token_address) DO UPDATE SET \
                     symbol = excluded.symbol, \
                     name = COALESCE(excluded.name, coins.name), \
                     decimals = COALESCE(excluded.decimals, coins.decimals), \
                     is_active = 1",
                params![chain, token_address, symbol, name, decimals],
            )?;
            self.find_coin_in(conn, chain, token_address)?
                .ok_or_else(|| anyhow::anyhow!("coin upsert did not persist"))
        })
    }

    fn find_coin_in(
        &self,
        conn: &Connection,
        chain: &str,
        token_address: &str,
    ) -> Result<Option<Coin>> {
        let coin = conn
            .query_row(
                &format!(
                    "SELECT {} FROM coins WHERE chain = ?1 AND token_address = ?2",
                    COIN_COLS
                ),
                params![chain, token_address],
                coin_from_row,
            )
            .optional()?;
        Ok(coin)
    }

    pub fn find_coin(&self, chain: &str, token_address: &str) -> Result<Option<Coin>> {
        self.with_conn(|conn| self.find_coin_in(conn, chain, token_address))
    }

    pub fn get_coin(&self, coin_id: i64) -> Result<Option<Coin>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM coins WHERE coin_id = ?1", COIN_COLS),
                    params![coin_id],
                    coin_from_row,
                )
                .optional()?)
        })
    }

    /// Resolve a user-facing name: alias table first, then symbol match
    /// (first active row wins, symbols are not unique).
    pub fn resolve_symbol(&self, name: &str) -> Result<Option<Coin>> {
        self.with_conn(|conn| {
            let via_alias = conn
                .query_row(
                    "SELECT c.coin_id, c.chain, c.token_address, c.symbol, c.name, c.decimals, \
                            c.is_active \
                     FROM coins c \
                     JOIN symbol_aliases a ON a.coin_id = c.coin_id \
                     WHERE a.alias = ?1",
                    params![name.to_uppercase()],
                    coin_from_row,
                )
                .optional()?;
            if via_alias.is_some() {
                return Ok(via_alias);
            }

            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {} FROM coins \
                         WHERE symbol = ?1 COLLATE NOCASE AND is_active = 1 \
                         ORDER BY coin_id LIMIT 1",
                        COIN_COLS
                    ),
                    params![name],
                    coin_from_row,
                )
                .optional()?)
        })
    }

    pub fn add_symbol_alias(&self, alias: &str, coin_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO symbol_aliases (alias, coin_id) VALUES (?1, ?2)",
                params![alias.to_uppercase(), coin_id],
            )?;
            Ok(())
        })
    }

    /// Soft delete. Rolling samples and state are retained until the
    /// cleanup task ages them out.
    pub fn deactivate_coin(&self, coin_id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE coins SET is_active = 0 WHERE coin_id = ?1",
                params![coin_id],
            )?;
            Ok(n > 0)
        })
    }

    /// Hard delete; cascades watch, state, samples, aliases and trigger
    /// state through foreign keys.
    pub fn delete_coin(&self, coin_id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM coins WHERE coin_id = ?1", params![coin_id])?;
            Ok(n > 0)
        })
    }

    pub fn upsert_long_watch(&self, watch: &LongWatch) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO long_watch (coin_id, retrace_on, stall_on, breakout_on, mcap_on, \
                     retrace_pct, stall_vol_pct, stall_band_pct, breakout_pct, breakout_vol_x, \
                     mcap_levels, added_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
                 ON CONFLICT(coin_id) DO UPDATE SET \
                     retrace_on = excluded.retrace_on, \
                     stall_on = excluded.stall_on, \
                     breakout_on = excluded.breakout_on, \
                     mcap_on = excluded.mcap_on, \
                     retrace_pct = excluded.retrace_pct, \
                     stall_vol_pct = excluded.stall_vol_pct, \
                     stall_band_pct = excluded.stall_band_pct, \
                     breakout_pct = excluded.breakout_pct, \
                     breakout_vol_x = excluded.breakout_vol_x, \
                     mcap_levels = excluded.mcap_levels",
                params![
                    watch.coin_id,
                    watch.retrace_on as i64,
                    watch.stall_on as i64,
                    watch.breakout_on as i64,
                    watch.mcap_on as i64,
                    watch.retrace_pct,
                    watch.stall_vol_pct,
                    watch.stall_band_pct,
                    watch.breakout_pct,
                    watch.breakout_vol_x,
                    serde_json::to_string(&watch.mcap_levels)?,
                    watch.added_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_long_watch(&self, coin_id: i64) -> Result<Option<LongWatch>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {} FROM long_watch WHERE coin_id = ?1", WATCH_COLS),
                    params![coin_id],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, f64>(5)?,
                            row.get::<_, f64>(6)?,
                            row.get::<_, f64>(7)?,
                            row.get::<_, f64>(8)?,
                            row.get::<_, f64>(9)?,
                            row.get::<_, i64>(10)?,
                            row.get::<_, String>(11)?,
                        ))
                    },
                )
                .optional()?;

            Ok(row.map(|r| LongWatch {
                coin_id: r.0,
                retrace_on: r.1 != 0,
                stall_on: r.2 != 0,
                breakout_on: r.3 != 0,
                mcap_on: r.4 != 0,
                retrace_pct: r.5,
                stall_vol_pct: r.6,
                stall_band_pct: r.7,
                breakout_pct: r.8,
                breakout_vol_x: r.9,
                added_at: r.10,
                mcap_levels: serde_json::from_str(&r.11).unwrap_or_default(),
            }))
        })
    }

    /// Destroy the subscription; cascades the derived state row.
    pub fn remove_long_watch(&self, coin_id: i64) -> Result<bool> {
        self.with_tx(|conn| {
            let n = conn.execute(
                "DELETE FROM long_watch WHERE coin_id = ?1",
                params![coin_id],
            )?;
            conn.execute("DELETE FROM long_state WHERE coin_id = ?1", params![coin_id])?;
            Ok(n > 0)
        })
    }

    /// All active coins carrying a long-watch subscription, with their
    /// per-coin configuration.
    pub fn list_long_watched(&self) -> Result<Vec<(Coin, LongWatch)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT c.coin_id, c.chain, c.token_address, c.symbol, c.name, c.decimals, \
                        c.is_active, \
                        w.retrace_on, w.stall_on, w.breakout_on, w.mcap_on, \
                        w.retrace_pct, w.stall_vol_pct, w.stall_band_pct, w.breakout_pct, \
                        w.breakout_vol_x, w.added_at, w.mcap_levels \
                 FROM coins c JOIN long_watch w ON w.coin_id = c.coin_id \
                 WHERE c.is_active = 1 \
                 ORDER BY c.coin_id",
            )?;

            let rows = stmt.query_map([], |row| {
                let coin = Coin {
                    coin_id: row.get(0)?,
                    chain: row.get(1)?,
                    token_address: row.get(2)?,
                    symbol: row.get(3)?,
                    name: row.get(4)?,
                    decimals: row.get(5)?,
                    is_active: row.get::<_, i64>(6)? != 0,
                };
                let levels_json: String = row.get(17)?;
                let watch = LongWatch {
                    coin_id: coin.coin_id,
                    retrace_on: row.get::<_, i64>(7)? != 0,
                    stall_on: row.get::<_, i64>(8)? != 0,
                    breakout_on: row.get::<_, i64>(9)? != 0,
                    mcap_on: row.get::<_, i64>(10)? != 0,
                    retrace_pct: row.get(11)?,
                    stall_vol_pct: row.get(12)?,
                    stall_band_pct: row.get(13)?,
                    breakout_pct: row.get(14)?,
                    breakout_vol_x: row.get(15)?,
                    added_at: row.get(16)?,
                    mcap_levels: serde_json::from_str(&levels_json).unwrap_or_default(),
                };
                Ok((coin, watch))
            })?;

            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }

    pub fn get_long_state(&self, coin_id: i64) -> Result<LongState> {
        self.with_conn(|conn| {
            let state = conn
                .query_row(
                    "SELECT coin_id, h12_high, h12_low, h24_high, h24_low, h72_high, h72_low, \
                            v12_sum, v24_sum, last_price, last_mcap, last_updated, \
                            last_retrace_fire, last_stall_fire, last_breakout_fire, last_mcap_fire \
                     FROM long_state WHERE coin_id = ?1",
                    params![coin_id],
                    |row| {
                        Ok(LongState {
                            coin_id: row.get(0)?,
                            h12_high: row.get(1)?,
                            h12_low: row.get(2)?,
                            h24_high: row.get(3)?,
                            h24_low: row.get(4)?,
                            h72_high: row.get(5)?,
                            h72_low: row.get(6)?,
                            v12_sum: row.get(7)?,
                            v24_sum: row.get(8)?,
                            last_price: row.get(9)?,
                            last_mcap: row.get(10)?,
                            last_updated: row.get(11)?,
                            last_retrace_fire: row.get(12)?,
                            last_stall_fire: row.get(13)?,
                            last_breakout_fire: row.get(14)?,
                            last_mcap_fire: row.get(15)?,
                        })
                    },
                )
                .optional()?;

            Ok(state.unwrap_or(LongState {
                coin_id,
                ..Default::default()
            }))
        })
    }

    /// Record a long-trigger fire: the `last_*_fire` timestamp and the
    /// audit row move together in one transaction. Returns false when the
    /// fingerprint was already recorded.
    pub fn fire_long_trigger(
        &self,
        coin_id: i64,
        kind: &str,
        ts: i64,
        payload_json: &str,
        fingerprint: &str,
    ) -> Result<bool> {
        let column = match kind {
            "retrace" => "last_retrace_fire",
            "stall" => "last_stall_fire",
            "breakout" => "last_breakout_fire",
            "mcap" => "last_mcap_fire",
            other => anyhow::bail!("unknown long trigger kind: {}", other),
        };
        self.with_tx(|conn| {
            let fresh = super::alerts::record_alert_in(
                conn,
                Some(coin_id),
                None,
                ts,
                kind,
                payload_json,
                fingerprint,
            )?;
            if !fresh {
                return Ok(false);
            }
            conn.execute(
                &format!(
                    "INSERT INTO long_state (coin_id, {col}) VALUES (?1, ?2) \
                     ON CONFLICT(coin_id) DO UPDATE SET {col} = excluded.{col}",
                    col = column
                ),
                params![coin_id, ts],
            )?;
            Ok(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::now_ts;

    #[test]
    fn coin_upsert_reactivates_soft_deleted_row() {
        let db = Database::open_in_memory().unwrap();
        let coin = db
            .upsert_coin("solana", "mintA", "AAA", Some("Alpha"), Some(9))
            .unwrap();
        assert!(db.deactivate_coin(coin.coin_id).unwrap());

        let again = db.upsert_coin("solana", "mintA", "AAA", None, None).unwrap();
        assert_eq!(again.coin_id, coin.coin_id);
        assert!(again.is_active);
        assert_eq!(again.name.as_deref(), Some("Alpha"));
    }

    #[test]
    fn symbol_resolution_prefers_alias() {
        let db = Database::open_in_memory().unwrap();
        let a = db.upsert_coin("solana", "mintA", "PEPE", None, None).unwrap();
        let b = db.upsert_coin("ethereum", "0xb", "PEPE", None, None).unwrap();
        db.add_symbol_alias("pepe", b.coin_id).unwrap();

        let hit = db.resolve_symbol("pepe").unwrap().unwrap();
        assert_eq!(hit.coin_id, b.coin_id);

        // Without the alias the first active symbol match wins.
        db.delete_coin(b.coin_id).unwrap();
        let hit = db.resolve_symbol("PEPE").unwrap().unwrap();
        assert_eq!(hit.coin_id, a.coin_id);
    }

    #[test]
    fn long_watch_round_trip_and_cascade() {
        let db = Database::open_in_memory().unwrap();
        let coin = db.upsert_coin("solana", "mintA", "AAA", None, None).unwrap();

        let mut watch = LongWatch::with_defaults(coin.coin_id, now_ts());
        watch.mcap_levels = vec![1_000_000.0, 5_000_000.0];
        db.upsert_long_watch(&watch).unwrap();

        let got = db.get_long_watch(coin.coin_id).unwrap().unwrap();
        assert_eq!(got.mcap_levels, vec![1_000_000.0, 5_000_000.0]);

        db.delete_coin(coin.coin_id).unwrap();
        assert!(db.get_long_watch(coin.coin_id).unwrap().is_none());
    }

    #[test]
    fn fire_long_trigger_is_atomic_and_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let coin = db.upsert_coin("solana", "mintA", "AAA", None, None).unwrap();

        assert!(db
            .fire_long_trigger(coin.coin_id, "retrace", 100, "{}", "long:1:retrace:1")
            .unwrap());
        assert!(!db
            .fire_long_trigger(coin.coin_id, "retrace", 200, "{}", "long:1:retrace:1")
            .unwrap());

        let state = db.get_long_state(coin.coin_id).unwrap();
        assert_eq!(state.last_retrace_fire, Some(100));

        assert!(db
            .fire_long_trigger(coin.coin_id, "nope", 100, "{}", "fp-x")
            .is_err());
    }
}
