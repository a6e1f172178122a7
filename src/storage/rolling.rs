//! Rolling-window sample store.
//!
//! Append-only `(coin_id, ts, price, volume, market_cap)` rows with window
//! aggregates computed per query. Appends also refresh the derived
//! `long_state` row so the evaluator reads one record per coin; the sample
//! table stays the source of truth and the cache is rebuildable from it.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::db::Database;
use crate::models::{RollingSample, WindowAggregates};

pub const WINDOW_12H: i64 = 12 * 3600;
pub const WINDOW_24H: i64 = 24 * 3600;
pub const WINDOW_72H: i64 = 72 * 3600;

/// Samples older than 73h carry no information for any window; the extra
/// hour of slack keeps a cleanup pass from racing the 72h window edge.
pub const RETENTION_SECS: i64 = 73 * 3600;

fn window_high_low(
    conn: &Connection,
    coin_id: i64,
    from: i64,
) -> Result<(Option<f64>, Option<f64>)> {
    let row = conn
        .query_row(
            "SELECT MAX(price), MIN(price) FROM rolling_data_points \
             WHERE coin_id = ?1 AND ts >= ?2",
            params![coin_id, from],
            |row| Ok((row.get::<_, Option<f64>>(0)?, row.get::<_, Option<f64>>(1)?)),
        )
        .optional()?;
    Ok(row.unwrap_or((None, None)))
}

fn window_volume(conn: &Connection, coin_id: i64, from: i64) -> Result<Option<f64>> {
    let sum = conn
        .query_row(
            "SELECT SUM(volume) FROM rolling_data_points WHERE coin_id = ?1 AND ts >= ?2",
            params![coin_id, from],
            |row| row.get::<_, Option<f64>>(0),
        )
        .optional()?;
    Ok(sum.flatten())
}

fn aggregates_in(conn: &Connection, coin_id: i64, now: i64) -> Result<WindowAggregates> {
    let (h12_high, h12_low) = window_high_low(conn, coin_id, now - WINDOW_12H)?;
    let (h24_high, h24_low) = window_high_low(conn, coin_id, now - WINDOW_24H)?;
    let (h72_high, h72_low) = window_high_low(conn, coin_id, now - WINDOW_72H)?;
    let v12_sum = window_volume(conn, coin_id, now - WINDOW_12H)?;
    let v24_sum = window_volume(conn, coin_id, now - WINDOW_24H)?;

    Ok(WindowAggregates {
        h12_high,
        h12_low,
        h24_high,
        h24_low,
        h72_high,
        h72_low,
        v12_sum,
        v24_sum,
    })
}

impl Database {
    /// Append a sample and refresh the derived state row in one
    /// transaction. Returns the aggregates as of the sample's timestamp.
    pub fn fold_sample(&self, coin_id: i64, sample: RollingSample) -> Result<WindowAggregates> {
        self.with_tx(|conn| {
            conn.execute(
                "INSERT INTO rolling_data_points (coin_id, ts, price, volume, market_cap) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![coin_id, sample.ts, sample.price, sample.volume, sample.market_cap],
            )?;

            let agg = aggregates_in(conn, coin_id, sample.ts)?;

            // last_updated is clamped to be non-decreasing; the connection
            // mutex already serializes same-coin appends.
            conn.execute(
                "INSERT INTO long_state (coin_id, h12_high, h12_low, h24_high, h24_low, \
                     h72_high, h72_low, v12_sum, v24_sum, last_price, last_mcap, last_updated) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
                 ON CONFLICT(coin_id) DO UPDATE SET \
                     h12_high = excluded.h12_high, h12_low = excluded.h12_low, \
                     h24_high = excluded.h24_high, h24_low = excluded.h24_low, \
                     h72_high = excluded.h72_high, h72_low = excluded.h72_low, \
                     v12_sum = excluded.v12_sum, v24_sum = excluded.v24_sum, \
                     last_price = excluded.last_price, \
                     last_mcap = COALESCE(excluded.last_mcap, long_state.last_mcap), \
                     last_updated = MAX(COALESCE(long_state.last_updated, 0), excluded.last_updated)",
                params![
                    coin_id,
                    agg.h12_high,
                    agg.h12_low,
                    agg.h24_high,
                    agg.h24_low,
                    agg.h72_high,
                    agg.h72_low,
                    agg.v12_sum,
                    agg.v24_sum,
                    sample.price,
                    sample.market_cap,
                    sample.ts,
                ],
            )?;

            Ok(agg)
        })
    }

    /// Window aggregates at an arbitrary point in time, straight from the
    /// sample table.
    pub fn window_aggregates(&self, coin_id: i64, now: i64) -> Result<WindowAggregates> {
        self.with_conn(|conn| aggregates_in(conn, coin_id, now))
    }

    pub fn sum_volume(&self, coin_id: i64, from: i64, to: i64) -> Result<f64> {
        self.with_conn(|conn| {
            let sum: Option<f64> = conn.query_row(
                "SELECT SUM(volume) FROM rolling_data_points \
                 WHERE coin_id = ?1 AND ts >= ?2 AND ts <= ?3",
                params![coin_id, from, to],
                |row| row.get(0),
            )?;
            Ok(sum.unwrap_or(0.0))
        })
    }

    pub fn data_points_count(&self, coin_id: i64) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM rolling_data_points WHERE coin_id = ?1",
                params![coin_id],
                |row| row.get(0),
            )?)
        })
    }

    pub fn earliest_sample_ts(&self, coin_id: i64) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT MIN(ts) FROM rolling_data_points WHERE coin_id = ?1",
                params![coin_id],
                |row| row.get(0),
            )?)
        })
    }

    /// True iff the earliest stored sample for the coin is at least
    /// `min_hours` old. 12 gates the evaluator; 72 gates full-depth reports.
    pub fn is_warmup_complete(&self, coin_id: i64, min_hours: i64, now: i64) -> Result<bool> {
        let earliest = self.earliest_sample_ts(coin_id)?;
        Ok(matches!(earliest, Some(ts) if now - ts >= min_hours * 3600))
    }

    /// Delete samples older than the retention horizon, in bounded batches
    /// so a large backlog never holds the write lock across an append.
    /// Returns the number of rows deleted.
    pub fn cleanup_expired_samples(&self, now: i64, batch_size: usize) -> Result<usize> {
        let cutoff = now - RETENTION_SECS;
        let mut total = 0usize;

        loop {
            let deleted = self.with_conn(|conn| {
                Ok(conn.execute(
                    "DELETE FROM rolling_data_points WHERE rowid IN ( \
                         SELECT rowid FROM rolling_data_points WHERE ts < ?1 LIMIT ?2)",
                    params![cutoff, batch_size],
                )?)
            })?;

            total += deleted;
            if deleted < batch_size {
                break;
            }
        }

        if total > 0 {
            debug!(deleted = total, cutoff, "rolling sample cleanup pass");
        }
        Ok(total)
    }
}
