//! Alert text rendering for the chat channel.

use super::{AlertData, AlertEvent, AlertPriority, HotAlertKind, LongTriggerKind};

fn priority_tag(priority: AlertPriority) -> &'static str {
    match priority {
        AlertPriority::Critical => "🚨",
        AlertPriority::High => "🔴",
        AlertPriority::Normal => "🟡",
        AlertPriority::Low => "⚪",
    }
}

/// Compact price formatting: small-cap tokens need the extra digits.
pub fn fmt_price(price: f64) -> String {
    if price >= 1.0 {
        format!("${:.4}", price)
    } else if price >= 0.0001 {
        format!("${:.6}", price)
    } else {
        format!("${:.10}", price)
    }
}

pub fn fmt_usd_compact(value: f64) -> String {
    if value >= 1_000_000_000.0 {
        format!("${:.2}B", value / 1_000_000_000.0)
    } else if value >= 1_000_000.0 {
        format!("${:.2}M", value / 1_000_000.0)
    } else if value >= 1_000.0 {
        format!("${:.1}K", value / 1_000.0)
    } else {
        format!("${:.0}", value)
    }
}

pub fn render(event: &AlertEvent) -> String {
    let tag = priority_tag(event.priority);
    match &event.data {
        AlertData::LongTrigger(a) => {
            let body = match a.kind {
                LongTriggerKind::Retrace => format!(
                    "{} retraced {:.1}% from its 72h high, now {}",
                    a.symbol,
                    a.retrace_from_high.unwrap_or(0.0),
                    fmt_price(a.price)
                ),
                LongTriggerKind::Stall => format!(
                    "{} stalling: volume contracted, price pinned near {}",
                    a.symbol,
                    fmt_price(a.price)
                ),
                LongTriggerKind::Breakout => format!(
                    "{} breakout above the 12h high on expanding volume, now {}",
                    a.symbol,
                    fmt_price(a.price)
                ),
                LongTriggerKind::Mcap => format!(
                    "{} market cap crossed {} (now {})",
                    a.symbol,
                    fmt_usd_compact(a.target_level.unwrap_or(0.0)),
                    a.market_cap.map(fmt_usd_compact).unwrap_or_default()
                ),
            };
            format!("{} {}", tag, body)
        }
        AlertData::HotAlert(a) => {
            let body = match a.kind {
                HotAlertKind::Pct => format!(
                    "{} hit {:+.0}% target: {:+.1}% from anchor, now {}",
                    a.symbol,
                    a.target_value.unwrap_or(0.0),
                    a.delta_from_anchor.unwrap_or(0.0),
                    fmt_price(a.price)
                ),
                HotAlertKind::Mcap => format!(
                    "{} market cap reached {}",
                    a.symbol,
                    fmt_usd_compact(a.target_level.unwrap_or(0.0))
                ),
                HotAlertKind::Failsafe => format!(
                    "{} FAILSAFE: down 60%+ from anchor, now {}",
                    a.symbol,
                    fmt_price(a.price)
                ),
                HotAlertKind::EntryAdded => format!(
                    "{} added to the hot list at {}",
                    a.symbol,
                    fmt_price(a.price)
                ),
            };
            format!("{} {}", tag, body)
        }
        AlertData::SystemAlert(a) => format!("{} {}", tag, a.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{HotAlert, LongTriggerAlert};

    #[test]
    fn retrace_text_carries_pct_and_price() {
        let event = AlertEvent::new(
            1_000,
            AlertData::LongTrigger(LongTriggerAlert {
                coin_id: 1,
                symbol: "WIF".to_string(),
                kind: LongTriggerKind::Retrace,
                price: 84.9,
                volume24h: 0.0,
                market_cap: None,
                retrace_from_high: Some(15.1),
                target_level: None,
                tick: 1,
            }),
        );
        let text = render(&event);
        assert!(text.contains("15.1%"));
        assert!(text.contains("$84.9000"));
    }

    #[test]
    fn pct_target_text_is_signed() {
        let event = AlertEvent::new(
            1_000,
            AlertData::HotAlert(HotAlert {
                hot_id: 1,
                symbol: "HOT".to_string(),
                kind: HotAlertKind::Pct,
                price: 1.79,
                delta_from_anchor: Some(-10.5),
                target_value: Some(-10.0),
                target_level: None,
                tick: 1,
            }),
        );
        let text = render(&event);
        assert!(text.contains("-10%"));
        assert!(text.contains("-10.5%"));
    }

    #[test]
    fn compact_usd_scales() {
        assert_eq!(fmt_usd_compact(2_500_000.0), "$2.50M");
        assert_eq!(fmt_usd_compact(1_200.0), "$1.2K");
        assert_eq!(fmt_usd_compact(3_100_000_000.0), "$3.10B");
    }

    #[test]
    fn tiny_prices_keep_precision() {
        assert_eq!(fmt_price(0.000012345), "$0.0000123450");
    }
}
