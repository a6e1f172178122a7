//! Cooperative scheduler: four independent periodic tasks driving the
//! monitoring pipeline.
//!
//! Every loop is a single sequential task, so a tick can never overlap
//! itself; families run in parallel with each other. Cadences are re-read
//! from the schedule config each pass, so administrative edits apply
//! without a restart. On shutdown the loops stop accepting ticks and the
//! in-flight one finishes before teardown.

use anyhow::Result;
use chrono::{DateTime, Days, Duration as ChronoDuration, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::alerts::format::{fmt_price, fmt_usd_compact};
use crate::alerts::{AlertBus, AlertData, AlertEvent, AlertPriority, SystemAlert};
use crate::evaluators::{HotEvaluator, LongEvaluator};
use crate::market_data::DexScreenerClient;
use crate::models::now_ts;
use crate::storage::Database;

/// Consecutive tick failures that raise a critical alert.
const PERSISTENCE_FAILURE_THRESHOLD: u32 = 3;

/// A loop is considered live if it ticked within 3x its cadence.
const LIVENESS_SLACK: f64 = 3.0;

#[derive(Debug, Serialize)]
pub struct SchedulerSnapshot {
    pub last_long_tick: Option<i64>,
    pub last_hot_tick: Option<i64>,
    pub last_cleanup: Option<i64>,
    pub last_anchor: Option<i64>,
    pub long_alive: bool,
    pub hot_alive: bool,
    pub cleanup_alive: bool,
}

#[derive(Default)]
pub struct SchedulerStatus {
    last_long_tick: AtomicI64,
    last_hot_tick: AtomicI64,
    last_cleanup: AtomicI64,
    last_anchor: AtomicI64,
    long_failures: AtomicU32,
    hot_failures: AtomicU32,
}

impl SchedulerStatus {
    fn stamp(&self, slot: &AtomicI64) {
        slot.store(now_ts(), Ordering::Relaxed);
    }

    fn read(slot: &AtomicI64) -> Option<i64> {
        match slot.load(Ordering::Relaxed) {
            0 => None,
            ts => Some(ts),
        }
    }

    pub fn snapshot(&self, long_cadence_secs: i64, hot_cadence_secs: i64) -> SchedulerSnapshot {
        let now = now_ts();
        let alive = |last: Option<i64>, cadence: i64| {
            last.map(|ts| (now - ts) as f64 <= cadence as f64 * LIVENESS_SLACK)
                .unwrap_or(false)
        };

        let last_long = Self::read(&self.last_long_tick);
        let last_hot = Self::read(&self.last_hot_tick);
        let last_cleanup = Self::read(&self.last_cleanup);

        SchedulerSnapshot {
            last_long_tick: last_long,
            last_hot_tick: last_hot,
            last_cleanup,
            last_anchor: Self::read(&self.last_anchor),
            long_alive: alive(last_long, long_cadence_secs),
            hot_alive: alive(last_hot, hot_cadence_secs),
            cleanup_alive: alive(last_cleanup, 3600),
        }
    }
}

pub struct Scheduler {
    db: Database,
    bus: Arc<AlertBus>,
    client: Arc<DexScreenerClient>,
    long_eval: Arc<LongEvaluator>,
    hot_eval: Arc<HotEvaluator>,
    status: Arc<SchedulerStatus>,
    tz: Tz,
}

impl Scheduler {
    pub fn new(
        db: Database,
        bus: Arc<AlertBus>,
        client: Arc<DexScreenerClient>,
        long_eval: Arc<LongEvaluator>,
        hot_eval: Arc<HotEvaluator>,
        tz: Tz,
    ) -> Self {
        Self {
            db,
            bus,
            client,
            long_eval,
            hot_eval,
            status: Arc::new(SchedulerStatus::default()),
            tz,
        }
    }

    pub fn status(&self) -> Arc<SchedulerStatus> {
        self.status.clone()
    }

    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.clone().long_loop(shutdown.clone())),
            tokio::spawn(self.clone().hot_loop(shutdown.clone())),
            tokio::spawn(self.clone().cleanup_loop(shutdown.clone())),
            tokio::spawn(self.anchor_loop(shutdown)),
        ]
    }

    async fn long_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("long checkpoint loop started");
        loop {
            let now = now_ts();
            match self.long_eval.run_tick(&self.client, now).await {
                Ok(_) => {
                    self.status.long_failures.store(0, Ordering::Relaxed);
                }
                Err(e) => {
                    error!(error = %e, "long checkpoint tick failed");
                    self.escalate_tick_failure(&self.status.long_failures, "long checkpoint");
                }
            }
            self.status.stamp(&self.status.last_long_tick);

            let cadence = self.long_cadence_secs();
            tokio::select! {
                _ = sleep(Duration::from_secs(cadence as u64)) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("long checkpoint loop stopped");
    }

    async fn hot_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("hot interval loop started");
        loop {
            let now = now_ts();
            match self.hot_eval.run_tick(&self.client, now).await {
                Ok(_) => {
                    self.status.hot_failures.store(0, Ordering::Relaxed);
                }
                Err(e) => {
                    error!(error = %e, "hot interval tick failed");
                    self.escalate_tick_failure(&self.status.hot_failures, "hot interval");
                }
            }
            self.status.stamp(&self.status.last_hot_tick);

            let cadence = self.hot_cadence_secs();
            tokio::select! {
                _ = sleep(Duration::from_secs(cadence as u64)) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("hot interval loop stopped");
    }

    async fn cleanup_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("rolling cleanup loop started (hourly)");
        loop {
            match self.db.cleanup_expired_samples(now_ts(), 5_000) {
                Ok(deleted) if deleted > 0 => {
                    info!(deleted, "expired rolling samples removed");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "rolling cleanup failed"),
            }
            self.status.stamp(&self.status.last_cleanup);

            tokio::select! {
                _ = sleep(Duration::from_secs(3600)) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("rolling cleanup loop stopped");
    }

    async fn anchor_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(tz = %self.tz, "anchor report loop started");
        loop {
            let times = match self.db.schedule_config() {
                Ok(cfg) => cfg.anchor_times_local,
                Err(e) => {
                    warn!(error = %e, "failed to read schedule config; retrying in 60s");
                    vec![]
                }
            };

            let Some((delay, label)) = next_anchor_delay(Utc::now(), &times, self.tz) else {
                // No valid anchor times configured; re-check in a minute.
                tokio::select! {
                    _ = sleep(Duration::from_secs(60)) => continue,
                    _ = shutdown.changed() => break,
                }
            };

            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => break,
            }

            if let Err(e) = self.publish_anchor_report(&label) {
                warn!(error = %e, "anchor report failed");
            }
            self.status.stamp(&self.status.last_anchor);
        }
        info!("anchor report loop stopped");
    }

    fn long_cadence_secs(&self) -> i64 {
        self.db
            .schedule_config()
            .map(|c| (c.long_checkpoint_hours * 3600.0) as i64)
            .unwrap_or(3600)
            .max(60)
    }

    fn hot_cadence_secs(&self) -> i64 {
        self.db
            .schedule_config()
            .map(|c| (c.hot_interval_minutes * 60.0) as i64)
            .unwrap_or(300)
            .max(30)
    }

    fn escalate_tick_failure(&self, counter: &AtomicU32, task: &str) {
        let failures = counter.fetch_add(1, Ordering::Relaxed) + 1;
        if failures == PERSISTENCE_FAILURE_THRESHOLD {
            let now = now_ts();
            let event = AlertEvent::new(
                now,
                AlertData::SystemAlert(SystemAlert {
                    message: format!(
                        "{} tick failed {} times in a row; check the database and upstream",
                        task, failures
                    ),
                    dedup_key: format!("tick_failures:{}:{}", task.replace(' ', "_"), now / 3600),
                    priority: AlertPriority::Critical,
                }),
            );
            if let Err(e) = self.bus.publish(&event) {
                error!(error = %e, "failed to publish tick-failure alert");
            }
        }
    }

    /// Long-list snapshot published through the system-alert path at the
    /// configured local times.
    fn publish_anchor_report(&self, label: &str) -> Result<()> {
        let watched = self.db.list_long_watched()?;
        let local_date = Utc::now().with_timezone(&self.tz).date_naive();

        let mut lines = vec![format!("📋 Anchor report {} {}", local_date, label)];
        if watched.is_empty() {
            lines.push("Long list is empty.".to_string());
        }
        for (coin, _watch) in &watched {
            let state = self.db.get_long_state(coin.coin_id)?;
            let price = state.last_price.map(fmt_price).unwrap_or_else(|| "n/a".to_string());
            let mcap = state
                .last_mcap
                .map(fmt_usd_compact)
                .unwrap_or_else(|| "n/a".to_string());
            lines.push(format!("• {}  {}  mcap {}", coin.symbol, price, mcap));
        }

        let event = AlertEvent::new(
            now_ts(),
            AlertData::SystemAlert(SystemAlert {
                message: lines.join("\n"),
                dedup_key: format!("anchor:{}:{}", local_date, label),
                priority: AlertPriority::Normal,
            }),
        );
        self.bus.publish(&event)?;
        info!(label, coins = watched.len(), "anchor report published");
        Ok(())
    }
}

fn parse_hhmm(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.trim().split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    (h < 24 && m < 60).then_some((h, m))
}

/// Delay until the next configured anchor time in the given timezone,
/// along with the matching "HH:MM" label. `None` when no time parses.
pub fn next_anchor_delay(
    now_utc: DateTime<Utc>,
    times: &[String],
    tz: Tz,
) -> Option<(Duration, String)> {
    let local_now = now_utc.with_timezone(&tz);
    let today = local_now.date_naive();

    let mut best: Option<(DateTime<Tz>, String)> = None;
    for raw in times {
        let Some((hour, minute)) = parse_hhmm(raw) else {
            continue;
        };
        for day_offset in 0..2u64 {
            let Some(date) = today.checked_add_days(Days::new(day_offset)) else {
                continue;
            };
            let Some(naive) = date.and_hms_opt(hour, minute, 0) else {
                continue;
            };
            // DST gaps make a local time nonexistent; earliest() skips it.
            let Some(candidate) = tz.from_local_datetime(&naive).earliest() else {
                continue;
            };
            if candidate > local_now {
                let replace = best
                    .as_ref()
                    .map(|(current, _)| candidate < *current)
                    .unwrap_or(true);
                if replace {
                    best = Some((candidate, raw.clone()));
                }
                break;
            }
        }
    }

    best.map(|(candidate, label)| {
        let delta: ChronoDuration = candidate.with_timezone(&Utc) - now_utc;
        (delta.to_std().unwrap_or(Duration::ZERO), label)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    #[test]
    fn next_anchor_picks_earliest_upcoming_time() {
        let tz: Tz = "UTC".parse().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let times = vec!["09:00".to_string(), "21:00".to_string()];

        let (delay, label) = next_anchor_delay(now, &times, tz).unwrap();
        assert_eq!(label, "21:00");
        assert_eq!(delay, Duration::from_secs(11 * 3600));
    }

    #[test]
    fn next_anchor_rolls_to_tomorrow() {
        let tz: Tz = "UTC".parse().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 22, 30, 0).unwrap();
        let times = vec!["09:00".to_string(), "21:00".to_string()];

        let (delay, label) = next_anchor_delay(now, &times, tz).unwrap();
        assert_eq!(label, "09:00");
        assert_eq!(delay, Duration::from_secs(10 * 3600 + 1800));
    }

    #[test]
    fn next_anchor_respects_timezone() {
        let tz: Tz = "America/New_York".parse().unwrap();
        // 13:00 UTC in winter = 08:00 New York; next 09:00 NY is one hour out.
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 13, 0, 0).unwrap();
        let times = vec!["09:00".to_string()];

        let (delay, _) = next_anchor_delay(now, &times, tz).unwrap();
        assert_eq!(delay, Duration::from_secs(3600));
    }

    #[test]
    fn invalid_times_are_skipped() {
        let tz: Tz = "UTC".parse().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();

        assert!(next_anchor_delay(now, &["25:00".to_string()], tz).is_none());
        assert!(next_anchor_delay(now, &["abc".to_string()], tz).is_none());
        assert!(next_anchor_delay(now, &[], tz).is_none());

        let (_, label) =
            next_anchor_delay(now, &["bad".to_string(), "12:30".to_string()], tz).unwrap();
        assert_eq!(label, "12:30");
    }

    #[test]
    fn liveness_uses_cadence_slack() {
        let status = SchedulerStatus::default();
        let snap = status.snapshot(3600, 300);
        assert!(!snap.long_alive);

        status.stamp(&status.last_long_tick);
        status.stamp(&status.last_hot_tick);
        status.stamp(&status.last_cleanup);
        let snap = status.snapshot(3600, 300);
        assert!(snap.long_alive);
        assert!(snap.hot_alive);
        assert!(snap.cleanup_alive);
    }
}
