//! Hot-entry storage: anchors, one-shot trigger rows, lifecycle.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::alerts::record_alert_in;
use super::db::Database;
use crate::models::{HotEntry, HotTrigger, HotTriggerKind};

fn entry_from_row(row: &Row) -> rusqlite::Result<HotEntry> {
    let pct_json: String = row.get(8)?;
    let mcap_json: String = row.get(9)?;
    Ok(HotEntry {
        hot_id: row.get(0)?,
        chain: row.get(1)?,
        contract_address: row.get(2)?,
        symbol: row.get(3)?,
        display_name: row.get(4)?,
        added_at: row.get(5)?,
        anchor_price: row.get(6)?,
        anchor_mcap: row.get(7)?,
        pct_targets: serde_json::from_str(&pct_json).unwrap_or_default(),
        mcap_targets: serde_json::from_str(&mcap_json).unwrap_or_default(),
        failsafe_fired: row.get::<_, i64>(10)? != 0,
        coin_id: row.get(11)?,
    })
}

const ENTRY_COLS: &str = "hot_id, chain, contract_address, symbol, display_name, added_at, \
     anchor_price, anchor_mcap, pct_targets, mcap_targets, failsafe_fired, coin_id";

/// Parameters for creating a hot entry. Anchors are the snapshot captured
/// at add time; targets are validated by the caller.
#[derive(Debug, Clone)]
pub struct NewHotEntry {
    pub chain: String,
    pub contract_address: String,
    pub symbol: String,
    pub display_name: Option<String>,
    pub anchor_price: f64,
    pub anchor_mcap: Option<f64>,
    pub pct_targets: Vec<f64>,
    pub mcap_targets: Vec<f64>,
    pub coin_id: Option<i64>,
}

impl Database {
    /// Create the entry and materialize one trigger row per target in the
    /// same transaction.
    pub fn add_hot_entry(&self, new: &NewHotEntry, now: i64) -> Result<HotEntry> {
        for &t in &new.pct_targets {
            if t == 0.0 || t.abs() >= 100.0 {
                anyhow::bail!("pct target {} out of range: |x| must be in (0, 100)", t);
            }
        }
        for &l in &new.mcap_targets {
            if l <= 0.0 {
                anyhow::bail!("mcap target {} must be positive", l);
            }
        }
        if new.anchor_price <= 0.0 {
            anyhow::bail!("anchor price must be positive");
        }
        if matches!(new.anchor_mcap, Some(m) if m <= 0.0) {
            anyhow::bail!("anchor mcap must be positive when present");
        }

        self.with_tx(|conn| {
            conn.execute(
                "INSERT INTO hot_entries (chain, contract_address, symbol, display_name, \
                     added_at, anchor_price, anchor_mcap, pct_targets, mcap_targets, \
                     failsafe_fired, coin_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10)",
                params![
                    new.chain,
                    new.contract_address,
                    new.symbol,
                    new.display_name,
                    now,
                    new.anchor_price,
                    new.anchor_mcap,
                    serde_json::to_string(&new.pct_targets)?,
                    serde_json::to_string(&new.mcap_targets)?,
                    new.coin_id,
                ],
            )?;
            let hot_id = conn.last_insert_rowid();

            for &t in &new.pct_targets {
                conn.execute(
                    "INSERT OR IGNORE INTO hot_trigger_state (hot_id, kind, value, fired) \
                     VALUES (?1, 'pct', ?2, 0)",
                    params![hot_id, t],
                )?;
            }
            for &l in &new.mcap_targets {
                conn.execute(
                    "INSERT OR IGNORE INTO hot_trigger_state (hot_id, kind, value, fired) \
                     VALUES (?1, 'mcap', ?2, 0)",
                    params![hot_id, l],
                )?;
            }

            conn.query_row(
                &format!("SELECT {} FROM hot_entries WHERE hot_id = ?1", ENTRY_COLS),
                params![hot_id],
                entry_from_row,
            )
            .map_err(Into::into)
        })
    }

    pub fn get_hot_entry(&self, hot_id: i64) -> Result<Option<HotEntry>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM hot_entries WHERE hot_id = ?1", ENTRY_COLS),
                    params![hot_id],
                    entry_from_row,
                )
                .optional()?)
        })
    }

    pub fn list_hot_entries(&self) -> Result<Vec<HotEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM hot_entries ORDER BY hot_id",
                ENTRY_COLS
            ))?;
            let rows = stmt.query_map([], entry_from_row)?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }

    /// Still-armed triggers only; fired rows are never re-consulted.
    pub fn unfired_hot_triggers(&self, hot_id: i64) -> Result<Vec<HotTrigger>> {
        self.with_conn(|conn| unfired_triggers_in(conn, hot_id))
    }

    /// Flip a trigger to fired and write its audit row atomically. Returns
    /// false if the trigger was already fired (lost race, duplicate tick).
    pub fn fire_hot_trigger(
        &self,
        hot_id: i64,
        kind: HotTriggerKind,
        value: f64,
        ts: i64,
        alert_kind: &str,
        payload_json: &str,
        fingerprint: &str,
    ) -> Result<bool> {
        self.with_tx(|conn| {
            let n = conn.execute(
                "UPDATE hot_trigger_state SET fired = 1 \
                 WHERE hot_id = ?1 AND kind = ?2 AND value = ?3 AND fired = 0",
                params![hot_id, kind.as_str(), value],
            )?;
            if n == 0 {
                return Ok(false);
            }
            record_alert_in(conn, None, Some(hot_id), ts, alert_kind, payload_json, fingerprint)?;
            Ok(true)
        })
    }

    /// Set the failsafe flag and write its audit row atomically. Returns
    /// false if the failsafe had already fired.
    pub fn fire_hot_failsafe(
        &self,
        hot_id: i64,
        ts: i64,
        payload_json: &str,
        fingerprint: &str,
    ) -> Result<bool> {
        self.with_tx(|conn| {
            let n = conn.execute(
                "UPDATE hot_entries SET failsafe_fired = 1 \
                 WHERE hot_id = ?1 AND failsafe_fired = 0",
                params![hot_id],
            )?;
            if n == 0 {
                return Ok(false);
            }
            record_alert_in(conn, None, Some(hot_id), ts, "failsafe", payload_json, fingerprint)?;
            Ok(true)
        })
    }

    /// Removal rule: every user-defined trigger fired AND the failsafe
    /// fired. Either alone leaves the entry in place.
    pub fn hot_entry_removable(&self, hot_id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let failsafe: bool = conn
                .query_row(
                    "SELECT failsafe_fired FROM hot_entries WHERE hot_id = ?1",
                    params![hot_id],
                    |row| Ok(row.get::<_, i64>(0)? != 0),
                )
                .optional()?
                .unwrap_or(false);
            if !failsafe {
                return Ok(false);
            }

            let unfired: i64 = conn.query_row(
                "SELECT COUNT(*) FROM hot_trigger_state WHERE hot_id = ?1 AND fired = 0",
                params![hot_id],
                |r| r.get(0),
            )?;
            Ok(unfired == 0)
        })
    }

    pub fn remove_hot_entry(&self, hot_id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM hot_entries WHERE hot_id = ?1", params![hot_id])?;
            Ok(n > 0)
        })
    }

    /// Detach hot entries referencing a coin that is being deleted.
    pub fn detach_hot_entries_from_coin(&self, coin_id: i64) -> Result<usize> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE hot_entries SET coin_id = NULL WHERE coin_id = ?1",
                params![coin_id],
            )?)
        })
    }
}

fn unfired_triggers_in(conn: &Connection, hot_id: i64) -> Result<Vec<HotTrigger>> {
    let mut stmt = conn.prepare_cached(
        "SELECT hot_id, kind, value, fired FROM hot_trigger_state \
         WHERE hot_id = ?1 AND fired = 0 ORDER BY kind, value",
    )?;
    let rows = stmt.query_map([hot_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, f64>(2)?,
            row.get::<_, i64>(3)?,
        ))
    })?;

    Ok(rows
        .filter_map(|r| r.ok())
        .filter_map(|(hot_id, kind, value, fired)| {
            HotTriggerKind::parse(&kind).map(|kind| HotTrigger {
                hot_id,
                kind,
                value,
                fired: fired != 0,
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_entry() -> NewHotEntry {
        NewHotEntry {
            chain: "solana".to_string(),
            contract_address: "mintH".to_string(),
            symbol: "HOT".to_string(),
            display_name: None,
            anchor_price: 2.0,
            anchor_mcap: Some(1_000_000.0),
            pct_targets: vec![25.0, -10.0],
            mcap_targets: vec![5_000_000.0],
            coin_id: None,
        }
    }

    #[test]
    fn add_materializes_trigger_rows() {
        let db = Database::open_in_memory().unwrap();
        let entry = db.add_hot_entry(&new_entry(), 100).unwrap();

        let triggers = db.unfired_hot_triggers(entry.hot_id).unwrap();
        assert_eq!(triggers.len(), 3);
        assert!(triggers
            .iter()
            .any(|t| t.kind == HotTriggerKind::Pct && t.value == -10.0));
        assert!(triggers
            .iter()
            .any(|t| t.kind == HotTriggerKind::Mcap && t.value == 5_000_000.0));
    }

    #[test]
    fn pct_target_magnitude_is_bounded() {
        let db = Database::open_in_memory().unwrap();
        let mut bad = new_entry();
        bad.pct_targets = vec![150.0];
        assert!(db.add_hot_entry(&bad, 100).is_err());

        bad.pct_targets = vec![0.0];
        assert!(db.add_hot_entry(&bad, 100).is_err());
    }

    #[test]
    fn fire_is_one_shot() {
        let db = Database::open_in_memory().unwrap();
        let entry = db.add_hot_entry(&new_entry(), 100).unwrap();

        let fired = db
            .fire_hot_trigger(entry.hot_id, HotTriggerKind::Pct, 25.0, 200, "hot_pct", "{}", "fp-1")
            .unwrap();
        assert!(fired);

        let again = db
            .fire_hot_trigger(entry.hot_id, HotTriggerKind::Pct, 25.0, 300, "hot_pct", "{}", "fp-2")
            .unwrap();
        assert!(!again);

        // The fired trigger no longer appears in the armed set.
        let triggers = db.unfired_hot_triggers(entry.hot_id).unwrap();
        assert!(!triggers.iter().any(|t| t.kind == HotTriggerKind::Pct && t.value == 25.0));
    }

    #[test]
    fn removal_requires_failsafe_and_all_user_triggers() {
        let db = Database::open_in_memory().unwrap();
        let entry = db.add_hot_entry(&new_entry(), 100).unwrap();

        // Failsafe alone is not enough.
        assert!(db.fire_hot_failsafe(entry.hot_id, 200, "{}", "fp-fs").unwrap());
        assert!(!db.hot_entry_removable(entry.hot_id).unwrap());

        db.fire_hot_trigger(entry.hot_id, HotTriggerKind::Pct, 25.0, 210, "hot_pct", "{}", "fp-a")
            .unwrap();
        db.fire_hot_trigger(entry.hot_id, HotTriggerKind::Pct, -10.0, 220, "hot_pct", "{}", "fp-b")
            .unwrap();
        assert!(!db.hot_entry_removable(entry.hot_id).unwrap());

        db.fire_hot_trigger(
            entry.hot_id,
            HotTriggerKind::Mcap,
            5_000_000.0,
            230,
            "hot_mcap",
            "{}",
            "fp-c",
        )
        .unwrap();
        assert!(db.hot_entry_removable(entry.hot_id).unwrap());

        assert!(db.remove_hot_entry(entry.hot_id).unwrap());
        assert!(db.get_hot_entry(entry.hot_id).unwrap().is_none());
    }

    #[test]
    fn all_user_triggers_without_failsafe_keeps_entry() {
        let db = Database::open_in_memory().unwrap();
        let mut single = new_entry();
        single.pct_targets = vec![50.0];
        single.mcap_targets = vec![];
        let entry = db.add_hot_entry(&single, 100).unwrap();

        db.fire_hot_trigger(entry.hot_id, HotTriggerKind::Pct, 50.0, 200, "hot_pct", "{}", "fp-a")
            .unwrap();
        assert!(!db.hot_entry_removable(entry.hot_id).unwrap());
    }
}
