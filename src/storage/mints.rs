//! Webhook-ingested mint events.

use anyhow::Result;
use rusqlite::params;

use super::db::Database;
use crate::models::MintEvent;

impl Database {
    /// Persist a mint event. The mint address is the primary key, so the
    /// first writer wins and `is_first` reflects that heuristic. Returns
    /// true when the row was newly inserted.
    pub fn record_mint_event(
        &self,
        signature: &str,
        mint: &str,
        ts: i64,
        decimals: Option<i64>,
        received_at: i64,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO mint_events (mint, signature, ts, decimals, is_first, received_at) \
                 VALUES (?1, ?2, ?3, ?4, 1, ?5)",
                params![mint, signature, ts, decimals, received_at],
            )?;
            Ok(n > 0)
        })
    }

    pub fn recent_mint_events(&self, limit: usize) -> Result<Vec<MintEvent>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT signature, mint, ts, decimals, is_first, received_at \
                 FROM mint_events ORDER BY received_at DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit], |row| {
                Ok(MintEvent {
                    signature: row.get(0)?,
                    mint: row.get(1)?,
                    ts: row.get(2)?,
                    decimals: row.get(3)?,
                    is_first: row.get::<_, i64>(4)? != 0,
                    received_at: row.get(5)?,
                })
            })?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }

    pub fn mint_event_count(&self) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM mint_events", [], |r| r.get(0))?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_insert_wins_per_mint() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.record_mint_event("sig1", "mintX", 100, Some(9), 100).unwrap());
        assert!(!db.record_mint_event("sig2", "mintX", 200, Some(9), 200).unwrap());

        let events = db.recent_mint_events(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].signature, "sig1");
        assert!(events[0].is_first);
    }
}
