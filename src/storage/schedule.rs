//! Singleton scheduler tuning record.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};

use super::db::Database;
use crate::models::ScheduleConfig;

impl Database {
    /// Load the singleton row, seeding defaults on first run.
    pub fn schedule_config(&self) -> Result<ScheduleConfig> {
        if let Some(cfg) = self.try_schedule_config()? {
            return Ok(cfg);
        }
        let cfg = ScheduleConfig::default();
        self.save_schedule_config(&cfg)?;
        Ok(cfg)
    }

    fn try_schedule_config(&self) -> Result<Option<ScheduleConfig>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT anchor_times_local, anchor_period_hours, long_checkpoint_hours, \
                            hot_interval_minutes, cooldown_hours, hysteresis_pct, \
                            global_retrace_on, global_stall_on, global_breakout_on, global_mcap_on \
                     FROM schedule_config WHERE id = 1",
                    [],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, f64>(1)?,
                            row.get::<_, f64>(2)?,
                            row.get::<_, f64>(3)?,
                            row.get::<_, f64>(4)?,
                            row.get::<_, f64>(5)?,
                            row.get::<_, i64>(6)?,
                            row.get::<_, i64>(7)?,
                            row.get::<_, i64>(8)?,
                            row.get::<_, i64>(9)?,
                        ))
                    },
                )
                .optional()?;

            Ok(row.map(|r| ScheduleConfig {
                anchor_times_local: serde_json::from_str(&r.0).unwrap_or_default(),
                anchor_period_hours: r.1,
                long_checkpoint_hours: r.2,
                hot_interval_minutes: r.3,
                cooldown_hours: r.4,
                hysteresis_pct: r.5,
                global_retrace_on: r.6 != 0,
                global_stall_on: r.7 != 0,
                global_breakout_on: r.8 != 0,
                global_mcap_on: r.9 != 0,
            }))
        })
    }

    /// Administrative write path; the command surface that calls this lives
    /// outside this crate.
    pub fn save_schedule_config(&self, cfg: &ScheduleConfig) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO schedule_config (id, anchor_times_local, anchor_period_hours, \
                     long_checkpoint_hours, hot_interval_minutes, cooldown_hours, hysteresis_pct, \
                     global_retrace_on, global_stall_on, global_breakout_on, global_mcap_on) \
                 VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
                 ON CONFLICT(id) DO UPDATE SET \
                     anchor_times_local = excluded.anchor_times_local, \
                     anchor_period_hours = excluded.anchor_period_hours, \
                     long_checkpoint_hours = excluded.long_checkpoint_hours, \
                     hot_interval_minutes = excluded.hot_interval_minutes, \
                     cooldown_hours = excluded.cooldown_hours, \
                     hysteresis_pct = excluded.hysteresis_pct, \
                     global_retrace_on = excluded.global_retrace_on, \
                     global_stall_on = excluded.global_stall_on, \
                     global_breakout_on = excluded.global_breakout_on, \
                     global_mcap_on = excluded.global_mcap_on",
                params![
                    serde_json::to_string(&cfg.anchor_times_local)?,
                    cfg.anchor_period_hours,
                    cfg.long_checkpoint_hours,
                    cfg.hot_interval_minutes,
                    cfg.cooldown_hours,
                    cfg.hysteresis_pct,
                    cfg.global_retrace_on as i64,
                    cfg.global_stall_on as i64,
                    cfg.global_breakout_on as i64,
                    cfg.global_mcap_on as i64,
                ],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_seeded_then_persisted_edits_stick() {
        let db = Database::open_in_memory().unwrap();

        let cfg = db.schedule_config().unwrap();
        assert_eq!(cfg.cooldown_hours, 2.0);
        assert!(cfg.global_retrace_on);

        let mut edited = cfg.clone();
        edited.cooldown_hours = 6.0;
        edited.global_stall_on = false;
        db.save_schedule_config(&edited).unwrap();

        let reloaded = db.schedule_config().unwrap();
        assert_eq!(reloaded.cooldown_hours, 6.0);
        assert!(!reloaded.global_stall_on);
        assert_eq!(reloaded.anchor_times_local, cfg.anchor_times_local);
    }
}
