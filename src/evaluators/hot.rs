//! Hot-entry evaluator.
//!
//! One-shot alerts against absolute anchors captured at add time: signed
//! percent targets, market-cap ladders, and the always-on 60% drawdown
//! failsafe. No cooldowns; every trigger fires at most once. An entry
//! leaves the list only when every user trigger has fired AND the
//! failsafe has fired.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::alerts::{AlertBus, AlertData, AlertEvent, HotAlert, HotAlertKind};
use crate::market_data::{DexScreenerClient, PairInfo, SnapshotValidator};
use crate::models::{token_key, HotEntry, HotTriggerKind};
use crate::storage::{Database, NewHotEntry};

/// Drawdown fraction that arms the failsafe: 60% below anchor.
const FAILSAFE_FLOOR: f64 = 0.40;

#[derive(Debug, Default, Clone, Copy)]
pub struct HotTickSummary {
    pub evaluated: usize,
    pub skipped: usize,
    pub fired: usize,
    pub removed: usize,
}

pub struct HotEvaluator {
    db: Database,
    bus: Arc<AlertBus>,
    validator: SnapshotValidator,
}

impl HotEvaluator {
    pub fn new(db: Database, bus: Arc<AlertBus>) -> Self {
        Self {
            db,
            bus,
            validator: SnapshotValidator::new(),
        }
    }

    /// Create an entry; `announce` suppresses the `entry_added` alert for
    /// bulk-import callers.
    pub fn add_entry(&self, new: &NewHotEntry, now: i64, announce: bool) -> Result<HotEntry> {
        let entry = self.db.add_hot_entry(new, now)?;
        info!(
            symbol = %entry.symbol,
            hot_id = entry.hot_id,
            anchor_price = entry.anchor_price,
            "hot entry added"
        );
        if announce {
            let event = AlertEvent::new(
                now,
                AlertData::HotAlert(HotAlert {
                    hot_id: entry.hot_id,
                    symbol: entry.symbol.clone(),
                    kind: HotAlertKind::EntryAdded,
                    price: entry.anchor_price,
                    delta_from_anchor: None,
                    target_value: None,
                    target_level: None,
                    tick: entry.added_at,
                }),
            );
            self.bus.publish(&event)?;
        }
        Ok(entry)
    }

    pub async fn run_tick(&self, client: &DexScreenerClient, now: i64) -> Result<HotTickSummary> {
        let entries = self.db.list_hot_entries()?;
        if entries.is_empty() {
            return Ok(HotTickSummary::default());
        }

        let requests: Vec<(String, String)> = entries
            .iter()
            .map(|e| (e.chain.clone(), e.contract_address.clone()))
            .collect();

        let snapshots = client.batch_get_tokens(&requests).await;
        self.evaluate_with_snapshots(now, &snapshots)
    }

    pub fn evaluate_with_snapshots(
        &self,
        now: i64,
        snapshots: &HashMap<String, Option<PairInfo>>,
    ) -> Result<HotTickSummary> {
        let schedule = self.db.schedule_config()?;
        let tick_secs = ((schedule.hot_interval_minutes * 60.0) as i64).max(1);
        let tick = now / tick_secs;

        let mut summary = HotTickSummary::default();

        for entry in self.db.list_hot_entries()? {
            let key = token_key(&entry.chain, &entry.contract_address);
            let snapshot = match snapshots.get(&key) {
                Some(Some(pair)) if self.validator.is_valid(pair) => pair,
                _ => {
                    summary.skipped += 1;
                    continue;
                }
            };

            summary.fired += self.evaluate_entry(now, tick, &entry, snapshot)?;
            summary.evaluated += 1;

            if self.db.hot_entry_removable(entry.hot_id)? {
                self.db.remove_hot_entry(entry.hot_id)?;
                summary.removed += 1;
                info!(
                    symbol = %entry.symbol,
                    hot_id = entry.hot_id,
                    "hot entry retired: all targets and failsafe fired"
                );
            }
        }

        info!(
            evaluated = summary.evaluated,
            skipped = summary.skipped,
            fired = summary.fired,
            removed = summary.removed,
            "hot interval tick complete"
        );
        Ok(summary)
    }

    fn evaluate_entry(
        &self,
        now: i64,
        tick: i64,
        entry: &HotEntry,
        snapshot: &PairInfo,
    ) -> Result<usize> {
        let p = snapshot.price;
        let m = snapshot.market_cap;
        let anchor = entry.anchor_price;
        let delta_from_anchor = (p - anchor) / anchor * 100.0;
        let mut fired = 0usize;

        for trigger in self.db.unfired_hot_triggers(entry.hot_id)? {
            let crossed = match trigger.kind {
                HotTriggerKind::Pct => {
                    let threshold = anchor * (1.0 + trigger.value / 100.0);
                    (trigger.value > 0.0 && p >= threshold)
                        || (trigger.value < 0.0 && p <= threshold)
                }
                HotTriggerKind::Mcap => matches!(m, Some(m) if m >= trigger.value),
            };
            if !crossed {
                continue;
            }

            let kind = match trigger.kind {
                HotTriggerKind::Pct => HotAlertKind::Pct,
                HotTriggerKind::Mcap => HotAlertKind::Mcap,
            };
            let event = AlertEvent::new(
                now,
                AlertData::HotAlert(HotAlert {
                    hot_id: entry.hot_id,
                    symbol: entry.symbol.clone(),
                    kind,
                    price: p,
                    delta_from_anchor: Some(delta_from_anchor),
                    target_value: (trigger.kind == HotTriggerKind::Pct).then_some(trigger.value),
                    target_level: (trigger.kind == HotTriggerKind::Mcap).then_some(trigger.value),
                    tick,
                }),
            );
            let payload = serde_json::to_string(&event.data)?;

            let fresh = self.db.fire_hot_trigger(
                entry.hot_id,
                trigger.kind,
                trigger.value,
                now,
                kind.as_str(),
                &payload,
                &event.fingerprint(),
            )?;
            if fresh {
                self.bus.publish(&event)?;
                info!(
                    symbol = %entry.symbol,
                    kind = kind.as_str(),
                    target = trigger.value,
                    price = p,
                    "hot trigger fired"
                );
                fired += 1;
            }
        }

        // Failsafe: 60% drawdown on price, or on market cap when both the
        // anchor and the current cap are known.
        if !entry.failsafe_fired {
            let price_floor = p <= anchor * FAILSAFE_FLOOR;
            let mcap_floor = match (entry.anchor_mcap, m) {
                (Some(anchor_mcap), Some(m)) => m <= anchor_mcap * FAILSAFE_FLOOR,
                _ => false,
            };
            if price_floor || mcap_floor {
                let event = AlertEvent::new(
                    now,
                    AlertData::HotAlert(HotAlert {
                        hot_id: entry.hot_id,
                        symbol: entry.symbol.clone(),
                        kind: HotAlertKind::Failsafe,
                        price: p,
                        delta_from_anchor: Some(delta_from_anchor),
                        target_value: None,
                        target_level: None,
                        tick,
                    }),
                );
                let payload = serde_json::to_string(&event.data)?;
                let fresh = self.db.fire_hot_failsafe(
                    entry.hot_id,
                    now,
                    &payload,
                    &event.fingerprint(),
                )?;
                if fresh {
                    self.bus.publish(&event)?;
                    warn!(
                        symbol = %entry.symbol,
                        price = p,
                        anchor,
                        "hot failsafe fired: 60%+ drawdown"
                    );
                    fired += 1;
                }
            }
        }

        Ok(fired)
    }
}
