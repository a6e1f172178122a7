//! Long-list trigger evaluator.
//!
//! Each checkpoint tick: batch-fetch snapshots for every watched coin,
//! fold them into the rolling store, then test the four trigger families
//! against window aggregates computed at the tick time over the samples
//! preceding the fold. The market-cap ladder compares against the
//! pre-fold `last_mcap` so a level fires exactly once on first touch.

use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::alerts::{
    AlertBus, AlertData, AlertEvent, AlertPriority, LongTriggerAlert, LongTriggerKind, SystemAlert,
};
use crate::market_data::{DexScreenerClient, PairInfo, SnapshotValidator};
use crate::models::{Coin, LongState, LongWatch, RollingSample, ScheduleConfig, WindowAggregates};
use crate::storage::Database;

/// Rejected-snapshot count per rolling hour that raises a system alert.
const ANOMALY_ALERT_THRESHOLD: u32 = 25;

/// Hours of history required before any long trigger may fire.
const WARMUP_HOURS: i64 = 12;

#[derive(Debug, Default, Clone, Copy)]
pub struct TickSummary {
    pub evaluated: usize,
    pub skipped: usize,
    pub fired: usize,
}

struct AnomalyCounter {
    window_start: i64,
    rejected: u32,
    alerted: bool,
}

pub struct LongEvaluator {
    db: Database,
    bus: Arc<AlertBus>,
    validator: SnapshotValidator,
    anomalies: Mutex<AnomalyCounter>,
}

impl LongEvaluator {
    pub fn new(db: Database, bus: Arc<AlertBus>) -> Self {
        Self {
            db,
            bus,
            validator: SnapshotValidator::new(),
            anomalies: Mutex::new(AnomalyCounter {
                window_start: 0,
                rejected: 0,
                alerted: false,
            }),
        }
    }

    /// Production tick: one batched fetch, then the pure evaluation pass.
    pub async fn run_tick(&self, client: &DexScreenerClient, now: i64) -> Result<TickSummary> {
        let watched = self.db.list_long_watched()?;
        if watched.is_empty() {
            return Ok(TickSummary::default());
        }

        let requests: Vec<(String, String)> = watched
            .iter()
            .map(|(coin, _)| (coin.chain.clone(), coin.token_address.clone()))
            .collect();

        let snapshots = client.batch_get_tokens(&requests).await;
        self.evaluate_with_snapshots(now, &snapshots)
    }

    /// Evaluate every watched coin against the given snapshot map. All
    /// arithmetic is synchronous; suspension only happens at the batch
    /// fetch in `run_tick`.
    pub fn evaluate_with_snapshots(
        &self,
        now: i64,
        snapshots: &HashMap<String, Option<PairInfo>>,
    ) -> Result<TickSummary> {
        let schedule = self.db.schedule_config()?;
        let watched = self.db.list_long_watched()?;
        let mut summary = TickSummary::default();

        for (coin, watch) in &watched {
            let snapshot = match snapshots.get(&coin.token_key()) {
                Some(Some(pair)) => pair,
                // Rate-limited, not found, or failed batch: skip the fold
                // and emit nothing for this coin this tick.
                _ => {
                    summary.skipped += 1;
                    continue;
                }
            };

            if !self.validator.is_valid(snapshot) {
                self.note_rejected_snapshot(now);
                summary.skipped += 1;
                continue;
            }

            let prev = self.db.get_long_state(coin.coin_id)?;

            if let Some(reason) = self.validator.anomaly_reason(snapshot) {
                warn!(symbol = %coin.symbol, reason, "anomalous snapshot");
                // An anomalous quote must not overwrite a prior good price.
                if prev.last_price.is_some() {
                    summary.skipped += 1;
                    continue;
                }
            }

            // Window aggregates at T over samples preceding this fold;
            // the breakout and retrace thresholds compare the new price
            // against history, not against itself.
            let windows = self.db.window_aggregates(coin.coin_id, now)?;

            self.db.fold_sample(
                coin.coin_id,
                RollingSample {
                    ts: now,
                    price: snapshot.price,
                    volume: snapshot.volume24h,
                    market_cap: snapshot.market_cap,
                },
            )?;

            if !self.db.is_warmup_complete(coin.coin_id, WARMUP_HOURS, now)? {
                summary.evaluated += 1;
                continue;
            }

            summary.fired +=
                self.evaluate_coin(now, &schedule, coin, watch, &prev, &windows, snapshot)?;
            summary.evaluated += 1;
        }

        info!(
            evaluated = summary.evaluated,
            skipped = summary.skipped,
            fired = summary.fired,
            "long checkpoint tick complete"
        );
        Ok(summary)
    }

    fn evaluate_coin(
        &self,
        now: i64,
        schedule: &ScheduleConfig,
        coin: &Coin,
        watch: &LongWatch,
        prev: &LongState,
        windows: &WindowAggregates,
        snapshot: &PairInfo,
    ) -> Result<usize> {
        let cooldown_secs = (schedule.cooldown_hours * 3600.0) as i64;
        let cooldown_ok =
            |last: Option<i64>| last.map(|t| now - t >= cooldown_secs).unwrap_or(true);

        let p = snapshot.price;
        let v = snapshot.volume24h;
        let m = snapshot.market_cap;
        let mut fired = 0usize;

        // Retrace: price fell at least retrace_pct below the 72h high.
        if watch.retrace_on && schedule.global_retrace_on && cooldown_ok(prev.last_retrace_fire) {
            if let Some(h72) = windows.h72_high {
                if p <= h72 * (1.0 - watch.retrace_pct / 100.0) {
                    let retrace_from_high = (h72 - p) / h72 * 100.0;
                    fired += self.emit(
                        now,
                        schedule,
                        coin,
                        LongTriggerKind::Retrace,
                        snapshot,
                        Some(retrace_from_high),
                        None,
                    )?;
                }
            }
        }

        // Stall: contracted volume plus price compression inside the band.
        if watch.stall_on && schedule.global_stall_on && cooldown_ok(prev.last_stall_fire) {
            if let (Some(v24), Some(h12_high), Some(h12_low)) =
                (windows.v24_sum, windows.h12_high, windows.h12_low)
            {
                let volume_contracted = v <= v24 * (1.0 - watch.stall_vol_pct / 100.0);
                let compressed = h12_high <= p * (1.0 + watch.stall_band_pct / 100.0)
                    && h12_low >= p * (1.0 - watch.stall_band_pct / 100.0);
                if volume_contracted && compressed {
                    fired += self.emit(
                        now,
                        schedule,
                        coin,
                        LongTriggerKind::Stall,
                        snapshot,
                        None,
                        None,
                    )?;
                }
            }
        }

        // Breakout: price above the 12h high with expanding volume.
        if watch.breakout_on && schedule.global_breakout_on && cooldown_ok(prev.last_breakout_fire)
        {
            if let (Some(h12_high), Some(v12)) = (windows.h12_high, windows.v12_sum) {
                if p >= h12_high * (1.0 + watch.breakout_pct / 100.0)
                    && v >= v12 * watch.breakout_vol_x
                {
                    fired += self.emit(
                        now,
                        schedule,
                        coin,
                        LongTriggerKind::Breakout,
                        snapshot,
                        None,
                        None,
                    )?;
                }
            }
        }

        // Mcap ladder: first untouched level, ascending, one per tick.
        if watch.mcap_on
            && schedule.global_mcap_on
            && cooldown_ok(prev.last_mcap_fire)
            && !watch.mcap_levels.is_empty()
        {
            if let Some(m) = m {
                let mut levels = watch.mcap_levels.clone();
                levels.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let crossed = levels.into_iter().find(|&level| {
                    m >= level && prev.last_mcap.map(|prior| prior < level).unwrap_or(true)
                });
                if let Some(level) = crossed {
                    fired += self.emit(
                        now,
                        schedule,
                        coin,
                        LongTriggerKind::Mcap,
                        snapshot,
                        None,
                        Some(level),
                    )?;
                }
            }
        }

        Ok(fired)
    }

    fn emit(
        &self,
        now: i64,
        schedule: &ScheduleConfig,
        coin: &Coin,
        kind: LongTriggerKind,
        snapshot: &PairInfo,
        retrace_from_high: Option<f64>,
        target_level: Option<f64>,
    ) -> Result<usize> {
        let checkpoint_secs = ((schedule.long_checkpoint_hours * 3600.0) as i64).max(1);
        let alert = LongTriggerAlert {
            coin_id: coin.coin_id,
            symbol: coin.symbol.clone(),
            kind,
            price: snapshot.price,
            volume24h: snapshot.volume24h,
            market_cap: snapshot.market_cap,
            retrace_from_high,
            target_level,
            tick: now / checkpoint_secs,
        };
        let event = AlertEvent::new(now, AlertData::LongTrigger(alert));
        let payload = serde_json::to_string(&event.data)?;

        let fresh = self.db.fire_long_trigger(
            coin.coin_id,
            kind.as_str(),
            now,
            &payload,
            &event.fingerprint(),
        )?;
        if !fresh {
            return Ok(0);
        }

        self.bus.publish(&event)?;
        info!(symbol = %coin.symbol, kind = kind.as_str(), price = snapshot.price, "long trigger fired");
        Ok(1)
    }

    /// Count rejected snapshots per rolling hour; past the threshold one
    /// system alert is raised for that hour.
    fn note_rejected_snapshot(&self, now: i64) {
        let mut counter = self.anomalies.lock();
        if now - counter.window_start >= 3600 {
            counter.window_start = now;
            counter.rejected = 0;
            counter.alerted = false;
        }
        counter.rejected += 1;

        if counter.rejected >= ANOMALY_ALERT_THRESHOLD && !counter.alerted {
            counter.alerted = true;
            let event = AlertEvent::new(
                now,
                AlertData::SystemAlert(SystemAlert {
                    message: format!(
                        "{} malformed snapshots rejected within the last hour",
                        counter.rejected
                    ),
                    dedup_key: format!("snapshot_anomalies:{}", now / 3600),
                    priority: AlertPriority::High,
                }),
            );
            if let Err(e) = self.bus.publish(&event) {
                warn!(error = %e, "failed to publish anomaly alert");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::PairMeta;
    use crate::models::now_ts;

    fn pair(price: f64, volume: f64, mcap: Option<f64>) -> PairInfo {
        PairInfo {
            chain_id: "solana".to_string(),
            base_token_address: "mintA".to_string(),
            symbol: "AAA".to_string(),
            name: None,
            price,
            market_cap: mcap,
            fdv: None,
            volume24h: volume,
            volume6h: None,
            volume1h: None,
            price_change24h: 0.0,
            price_change6h: None,
            price_change1h: None,
            liquidity: Some(100_000.0),
            meta: PairMeta::default(),
        }
    }

    struct Fixture {
        db: Database,
        evaluator: LongEvaluator,
        coin_id: i64,
        key: String,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let bus = Arc::new(AlertBus::new(db.clone()));
        let evaluator = LongEvaluator::new(db.clone(), bus);
        let coin = db.upsert_coin("solana", "mintA", "AAA", None, None).unwrap();
        db.upsert_long_watch(&LongWatch::with_defaults(coin.coin_id, now_ts()))
            .unwrap();
        let key = coin.token_key();
        Fixture {
            db,
            evaluator,
            coin_id: coin.coin_id,
            key,
        }
    }

    /// Seed enough history that the 12h warm-up gate passes.
    fn seed_history(f: &Fixture, now: i64, price: f64, volume_per_sample: f64) {
        for i in 1..=13 {
            f.db.fold_sample(
                f.coin_id,
                RollingSample {
                    ts: now - i * 3600,
                    price,
                    volume: volume_per_sample,
                    market_cap: None,
                },
            )
            .unwrap();
        }
    }

    fn snapshots(key: &str, pair: PairInfo) -> HashMap<String, Option<PairInfo>> {
        HashMap::from([(key.to_string(), Some(pair))])
    }

    #[test]
    fn retrace_fires_at_threshold() {
        let f = fixture();
        let now = 1_700_000_000;
        seed_history(&f, now, 100.0, 10.0);

        let summary = f
            .evaluator
            .evaluate_with_snapshots(now, &snapshots(&f.key, pair(84.9, 10.0, None)))
            .unwrap();
        assert_eq!(summary.fired, 1);

        let history = f.db.recent_alerts(10).unwrap();
        let retrace = history.iter().find(|r| r.kind == "retrace").unwrap();
        let payload: serde_json::Value = serde_json::from_str(&retrace.payload_json).unwrap();
        let from_high = payload["retrace_from_high"].as_f64().unwrap();
        assert!((from_high - 15.1).abs() < 0.01);
    }

    #[test]
    fn retrace_suppressed_by_cooldown() {
        let f = fixture();
        let now = 1_700_000_000;
        seed_history(&f, now, 100.0, 10.0);

        let first = f
            .evaluator
            .evaluate_with_snapshots(now, &snapshots(&f.key, pair(84.9, 10.0, None)))
            .unwrap();
        assert_eq!(first.fired, 1);

        // 30 minutes later, deeper drop, 2h cooldown: no alert, state updated.
        let later = now + 1800;
        let second = f
            .evaluator
            .evaluate_with_snapshots(later, &snapshots(&f.key, pair(80.0, 10.0, None)))
            .unwrap();
        assert_eq!(second.fired, 0);

        let state = f.db.get_long_state(f.coin_id).unwrap();
        assert_eq!(state.last_price, Some(80.0));

        // Past the cooldown the trigger is eligible again.
        let after_cooldown = now + 2 * 3600 + 60;
        let third = f
            .evaluator
            .evaluate_with_snapshots(after_cooldown, &snapshots(&f.key, pair(80.0, 10.0, None)))
            .unwrap();
        assert_eq!(third.fired, 1);
    }

    #[test]
    fn exact_high_does_not_retrace() {
        let f = fixture();
        let now = 1_700_000_000;
        seed_history(&f, now, 100.0, 10.0);

        let mut watch = f.db.get_long_watch(f.coin_id).unwrap().unwrap();
        watch.stall_on = false;
        watch.breakout_on = false;
        watch.mcap_on = false;
        f.db.upsert_long_watch(&watch).unwrap();

        let summary = f
            .evaluator
            .evaluate_with_snapshots(now, &snapshots(&f.key, pair(100.0, 10.0, None)))
            .unwrap();
        assert_eq!(summary.fired, 0);
    }

    /// Fresh fixture with a 12h high of 10.0 and a 12h volume sum of 1000,
    /// breakout as the only enabled trigger.
    fn breakout_fixture(now: i64) -> Fixture {
        let f = fixture();
        for i in 1..=13 {
            f.db.fold_sample(
                f.coin_id,
                RollingSample {
                    ts: now - i * 3600,
                    price: 10.0,
                    volume: 1000.0 / 12.0,
                    market_cap: None,
                },
            )
            .unwrap();
        }
        let mut watch = f.db.get_long_watch(f.coin_id).unwrap().unwrap();
        watch.retrace_on = false;
        watch.stall_on = false;
        watch.mcap_on = false;
        f.db.upsert_long_watch(&watch).unwrap();
        f
    }

    #[test]
    fn breakout_requires_both_price_and_volume() {
        let now = 1_700_000_000;

        // Price fails (11.15 < 11.2), volume passes.
        let f = breakout_fixture(now);
        let s = f
            .evaluator
            .evaluate_with_snapshots(now, &snapshots(&f.key, pair(11.15, 2000.0, None)))
            .unwrap();
        assert_eq!(s.fired, 0);

        // Price passes, volume fails (1400 < 1500).
        let f = breakout_fixture(now);
        let s = f
            .evaluator
            .evaluate_with_snapshots(now, &snapshots(&f.key, pair(11.3, 1400.0, None)))
            .unwrap();
        assert_eq!(s.fired, 0);

        // Both pass.
        let f = breakout_fixture(now);
        let s = f
            .evaluator
            .evaluate_with_snapshots(now, &snapshots(&f.key, pair(11.3, 1600.0, None)))
            .unwrap();
        assert_eq!(s.fired, 1);
        let history = f.db.recent_alerts(1).unwrap();
        assert_eq!(history[0].kind, "breakout");
    }

    #[test]
    fn stall_requires_contraction_and_compression() {
        let f = fixture();
        let now = 1_700_000_000;
        // Flat price, steady volume history.
        seed_history(&f, now, 10.0, 100.0);

        let mut watch = f.db.get_long_watch(f.coin_id).unwrap().unwrap();
        watch.retrace_on = false;
        watch.breakout_on = false;
        watch.mcap_on = false;
        f.db.upsert_long_watch(&watch).unwrap();

        // v24_sum = 1300; contraction threshold = 30% -> V <= 910.
        // Price 10.0 sits inside the 5% band around the 12h extremes.
        let s = f
            .evaluator
            .evaluate_with_snapshots(now, &snapshots(&f.key, pair(10.0, 900.0, None)))
            .unwrap();
        assert_eq!(s.fired, 1);

        // Volume too high: no stall.
        let f2 = fixture();
        seed_history(&f2, now, 10.0, 100.0);
        let mut watch = f2.db.get_long_watch(f2.coin_id).unwrap().unwrap();
        watch.retrace_on = false;
        watch.breakout_on = false;
        watch.mcap_on = false;
        f2.db.upsert_long_watch(&watch).unwrap();
        let s = f2
            .evaluator
            .evaluate_with_snapshots(now, &snapshots(&f2.key, pair(10.0, 1200.0, None)))
            .unwrap();
        assert_eq!(s.fired, 0);
    }

    #[test]
    fn warmup_gates_triggers_but_not_state() {
        let f = fixture();
        let now = 1_700_000_000;

        // Only 2 hours of history: deep retrace must not fire.
        f.db.fold_sample(
            f.coin_id,
            RollingSample {
                ts: now - 2 * 3600,
                price: 100.0,
                volume: 10.0,
                market_cap: None,
            },
        )
        .unwrap();

        let summary = f
            .evaluator
            .evaluate_with_snapshots(now, &snapshots(&f.key, pair(50.0, 10.0, None)))
            .unwrap();
        assert_eq!(summary.fired, 0);
        assert_eq!(summary.evaluated, 1);

        // State still folded.
        let state = f.db.get_long_state(f.coin_id).unwrap();
        assert_eq!(state.last_price, Some(50.0));
    }

    #[test]
    fn mcap_ladder_first_touch_in_order() {
        let f = fixture();
        let now = 1_700_000_000;
        seed_history(&f, now, 10.0, 10.0);

        let mut watch = f.db.get_long_watch(f.coin_id).unwrap().unwrap();
        watch.retrace_on = false;
        watch.stall_on = false;
        watch.breakout_on = false;
        watch.mcap_levels = vec![2_000_000.0, 1_000_000.0, 3_000_000.0];
        f.db.upsert_long_watch(&watch).unwrap();

        let mut cfg = f.db.schedule_config().unwrap();
        cfg.cooldown_hours = 0.0;
        f.db.save_schedule_config(&cfg).unwrap();

        // Monotonically increasing M: exactly one alert per level crossed,
        // ascending order, one per tick.
        let expected = [
            (1_500_000.0, Some(1_000_000.0)),
            (2_500_000.0, Some(2_000_000.0)),
            (3_500_000.0, Some(3_000_000.0)),
        ];
        for (i, (mcap, level)) in expected.iter().enumerate() {
            let s = f
                .evaluator
                .evaluate_with_snapshots(
                    now + i as i64 * 3600,
                    &snapshots(&f.key, pair(10.0, 10.0, Some(*mcap))),
                )
                .unwrap();
            assert_eq!(s.fired, 1, "tick {} should fire exactly once", i);
            let history = f.db.recent_alerts(1).unwrap();
            let payload: serde_json::Value =
                serde_json::from_str(&history[0].payload_json).unwrap();
            assert_eq!(payload["target_level"].as_f64(), *level);
        }

        // Every level already touched: nothing further fires.
        let s = f
            .evaluator
            .evaluate_with_snapshots(
                now + 4 * 3600,
                &snapshots(&f.key, pair(10.0, 10.0, Some(9_000_000.0))),
            )
            .unwrap();
        assert_eq!(s.fired, 0);
    }

    #[test]
    fn null_snapshot_skips_fold() {
        let f = fixture();
        let now = 1_700_000_000;
        seed_history(&f, now, 100.0, 10.0);

        let map: HashMap<String, Option<PairInfo>> = HashMap::from([(f.key.clone(), None)]);
        let summary = f.evaluator.evaluate_with_snapshots(now, &map).unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.evaluated, 0);

        let state = f.db.get_long_state(f.coin_id).unwrap();
        assert_eq!(state.last_updated, Some(now - 3600));
    }

    #[test]
    fn global_kill_switch_masks_coin_flag() {
        let f = fixture();
        let now = 1_700_000_000;
        seed_history(&f, now, 100.0, 10.0);

        let mut cfg = f.db.schedule_config().unwrap();
        cfg.global_retrace_on = false;
        f.db.save_schedule_config(&cfg).unwrap();

        let summary = f
            .evaluator
            .evaluate_with_snapshots(now, &snapshots(&f.key, pair(50.0, 10.0, None)))
            .unwrap();
        assert_eq!(summary.fired, 0);
    }

    #[test]
    fn anomalous_snapshot_never_overwrites_good_price() {
        let f = fixture();
        let now = 1_700_000_000;
        seed_history(&f, now, 100.0, 10.0);

        // Good price on record.
        f.evaluator
            .evaluate_with_snapshots(now, &snapshots(&f.key, pair(99.0, 10.0, None)))
            .unwrap();

        // +96% move is anomalous: logged, skipped, state unchanged.
        let mut weird = pair(42.0, 10.0, None);
        weird.price_change24h = 96.0;
        let summary = f
            .evaluator
            .evaluate_with_snapshots(now + 60, &snapshots(&f.key, weird))
            .unwrap();
        assert_eq!(summary.skipped, 1);

        let state = f.db.get_long_state(f.coin_id).unwrap();
        assert_eq!(state.last_price, Some(99.0));
    }
}
