//! Alert pipeline: typed events, in-process bus, outbox delivery.

pub mod bus;
pub mod format;
pub mod sender;
pub mod telegram;

pub use bus::AlertBus;
pub use sender::{spawn_alert_subscriber, spawn_outbox_sender};
pub use telegram::{MessageSender, SendResult, TelegramSender};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertPriority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LongTriggerKind {
    Retrace,
    Stall,
    Breakout,
    Mcap,
}

impl LongTriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LongTriggerKind::Retrace => "retrace",
            LongTriggerKind::Stall => "stall",
            LongTriggerKind::Breakout => "breakout",
            LongTriggerKind::Mcap => "mcap",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotAlertKind {
    Pct,
    Mcap,
    Failsafe,
    EntryAdded,
}

impl HotAlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HotAlertKind::Pct => "hot_pct",
            HotAlertKind::Mcap => "hot_mcap",
            HotAlertKind::Failsafe => "failsafe",
            HotAlertKind::EntryAdded => "entry_added",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongTriggerAlert {
    pub coin_id: i64,
    pub symbol: String,
    pub kind: LongTriggerKind,
    pub price: f64,
    pub volume24h: f64,
    pub market_cap: Option<f64>,
    /// Percent drop from the 72h high; retrace only.
    pub retrace_from_high: Option<f64>,
    /// Crossed ladder level; mcap only.
    pub target_level: Option<f64>,
    /// Discretized evaluation tick, part of the fingerprint.
    pub tick: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotAlert {
    pub hot_id: i64,
    pub symbol: String,
    pub kind: HotAlertKind,
    pub price: f64,
    /// Percent move from the anchor price.
    pub delta_from_anchor: Option<f64>,
    /// Signed pct target; pct only.
    pub target_value: Option<f64>,
    /// Crossed mcap target; mcap only.
    pub target_level: Option<f64>,
    pub tick: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemAlert {
    pub message: String,
    /// Stable key distinguishing logically different system alerts.
    pub dedup_key: String,
    pub priority: AlertPriority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertData {
    LongTrigger(LongTriggerAlert),
    HotAlert(HotAlert),
    SystemAlert(SystemAlert),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: Uuid,
    pub timestamp: i64,
    pub data: AlertData,
    pub priority: AlertPriority,
}

impl AlertEvent {
    pub fn new(timestamp: i64, data: AlertData) -> Self {
        let priority = priority_for(&data);
        Self {
            id: Uuid::new_v4(),
            timestamp,
            data,
            priority,
        }
    }

    /// Stable idempotency key shared by alert history and the outbox.
    pub fn fingerprint(&self) -> String {
        match &self.data {
            AlertData::LongTrigger(a) => {
                format!("long:{}:{}:{}", a.coin_id, a.kind.as_str(), a.tick)
            }
            // Target-carrying hot alerts embed the target so two targets of
            // the same kind crossing in one tick stay distinct.
            AlertData::HotAlert(a) => match a.target_value.or(a.target_level) {
                Some(target) => {
                    format!("hot:{}:{}:{}:{}", a.hot_id, a.kind.as_str(), target, a.tick)
                }
                None => format!("hot:{}:{}:{}", a.hot_id, a.kind.as_str(), a.tick),
            },
            AlertData::SystemAlert(a) => format!("system:{}", a.dedup_key),
        }
    }

    /// History row `kind` column value.
    pub fn kind_str(&self) -> &'static str {
        match &self.data {
            AlertData::LongTrigger(a) => a.kind.as_str(),
            AlertData::HotAlert(a) => a.kind.as_str(),
            AlertData::SystemAlert(_) => "system",
        }
    }

    pub fn coin_id(&self) -> Option<i64> {
        match &self.data {
            AlertData::LongTrigger(a) => Some(a.coin_id),
            _ => None,
        }
    }

    pub fn hot_id(&self) -> Option<i64> {
        match &self.data {
            AlertData::HotAlert(a) => Some(a.hot_id),
            _ => None,
        }
    }
}

fn priority_for(data: &AlertData) -> AlertPriority {
    match data {
        AlertData::LongTrigger(a) => match a.kind {
            LongTriggerKind::Retrace => {
                if a.retrace_from_high.unwrap_or(0.0) > 30.0 {
                    AlertPriority::High
                } else {
                    AlertPriority::Normal
                }
            }
            LongTriggerKind::Breakout => AlertPriority::High,
            LongTriggerKind::Mcap => AlertPriority::Normal,
            LongTriggerKind::Stall => AlertPriority::Low,
        },
        AlertData::HotAlert(a) => match a.kind {
            HotAlertKind::Failsafe => AlertPriority::Critical,
            HotAlertKind::Pct => {
                if a.delta_from_anchor.unwrap_or(0.0).abs() > 50.0 {
                    AlertPriority::High
                } else {
                    AlertPriority::Normal
                }
            }
            HotAlertKind::Mcap | HotAlertKind::EntryAdded => AlertPriority::Normal,
        },
        AlertData::SystemAlert(a) => a.priority,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_alert(kind: LongTriggerKind, retrace: Option<f64>) -> AlertEvent {
        AlertEvent::new(
            1_000,
            AlertData::LongTrigger(LongTriggerAlert {
                coin_id: 42,
                symbol: "AAA".to_string(),
                kind,
                price: 1.0,
                volume24h: 10.0,
                market_cap: None,
                retrace_from_high: retrace,
                target_level: None,
                tick: 168_123,
            }),
        )
    }

    #[test]
    fn long_fingerprints_follow_documented_shape() {
        let e = long_alert(LongTriggerKind::Retrace, Some(15.1));
        assert_eq!(e.fingerprint(), "long:42:retrace:168123");
    }

    #[test]
    fn priority_mapping_matches_table() {
        assert_eq!(
            long_alert(LongTriggerKind::Retrace, Some(31.0)).priority,
            AlertPriority::High
        );
        assert_eq!(
            long_alert(LongTriggerKind::Retrace, Some(15.0)).priority,
            AlertPriority::Normal
        );
        assert_eq!(
            long_alert(LongTriggerKind::Breakout, None).priority,
            AlertPriority::High
        );
        assert_eq!(
            long_alert(LongTriggerKind::Stall, None).priority,
            AlertPriority::Low
        );

        let failsafe = AlertEvent::new(
            1_000,
            AlertData::HotAlert(HotAlert {
                hot_id: 7,
                symbol: "HOT".to_string(),
                kind: HotAlertKind::Failsafe,
                price: 0.4,
                delta_from_anchor: Some(-60.0),
                target_value: None,
                target_level: None,
                tick: 99,
            }),
        );
        assert_eq!(failsafe.priority, AlertPriority::Critical);
        assert_eq!(failsafe.fingerprint(), "hot:7:failsafe:99");

        let big_pct = AlertEvent::new(
            1_000,
            AlertData::HotAlert(HotAlert {
                hot_id: 7,
                symbol: "HOT".to_string(),
                kind: HotAlertKind::Pct,
                price: 3.2,
                delta_from_anchor: Some(60.0),
                target_value: Some(50.0),
                target_level: None,
                tick: 99,
            }),
        );
        assert_eq!(big_pct.priority, AlertPriority::High);
    }

    #[test]
    fn priorities_order_low_to_critical() {
        assert!(AlertPriority::Low < AlertPriority::Normal);
        assert!(AlertPriority::Normal < AlertPriority::High);
        assert!(AlertPriority::High < AlertPriority::Critical);
    }
}
