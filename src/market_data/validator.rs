//! Snapshot validation gate.
//!
//! Every snapshot passes through here before being folded into rolling
//! state. Rejected samples are dropped for the tick; anomalous ones are
//! logged and must never overwrite a prior good price.

use regex::Regex;
use tracing::warn;

use super::dexscreener::PairInfo;

/// A pluggable rejection rule: returns a reason when the snapshot must be
/// dropped.
pub type ValidationRule = Box<dyn Fn(&PairInfo) -> Option<String> + Send + Sync>;

pub struct SnapshotValidator {
    symbol_re: Regex,
    extra_rules: Vec<ValidationRule>,
}

impl Default for SnapshotValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotValidator {
    pub fn new() -> Self {
        Self {
            // Anchored, case-insensitive; symbols longer than 20 chars are junk pairs.
            symbol_re: Regex::new(r"(?i)^[A-Z0-9_\-]{1,20}$").expect("static regex"),
            extra_rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: ValidationRule) -> Self {
        self.extra_rules.push(rule);
        self
    }

    /// Returns the rejection reason, or `None` when the snapshot is usable.
    pub fn reject_reason(&self, pair: &PairInfo) -> Option<String> {
        if pair.price <= 0.0 || !pair.price.is_finite() {
            return Some(format!("non-positive price {}", pair.price));
        }
        if pair.volume24h < 0.0 || !pair.volume24h.is_finite() {
            return Some(format!("negative volume {}", pair.volume24h));
        }
        if pair.price_change24h.abs() > 1000.0 {
            return Some(format!("implausible 24h change {}%", pair.price_change24h));
        }
        if matches!(pair.market_cap, Some(m) if m <= 0.0) {
            return Some("non-positive market cap".to_string());
        }
        if matches!(pair.liquidity, Some(l) if l <= 0.0) {
            return Some("non-positive liquidity".to_string());
        }
        if !self.symbol_re.is_match(&pair.symbol) {
            return Some(format!("malformed symbol {:?}", pair.symbol));
        }

        for rule in &self.extra_rules {
            if let Some(reason) = rule(pair) {
                return Some(reason);
            }
        }

        None
    }

    pub fn is_valid(&self, pair: &PairInfo) -> bool {
        match self.reject_reason(pair) {
            None => true,
            Some(reason) => {
                warn!(
                    symbol = %pair.symbol,
                    token = %pair.base_token_address,
                    reason,
                    "snapshot rejected"
                );
                false
            }
        }
    }

    /// Anomaly flag: suspicious but not auto-rejected. Logged by callers;
    /// an anomalous price must never replace a prior good one.
    pub fn anomaly_reason(&self, pair: &PairInfo) -> Option<String> {
        if pair.price_change24h.abs() > 95.0 {
            return Some(format!("extreme 24h change {:.1}%", pair.price_change24h));
        }
        if pair.volume24h < 100.0 && pair.price_change24h.abs() > 10.0 {
            return Some(format!(
                "thin volume {:.0} with {:.1}% move",
                pair.volume24h, pair.price_change24h
            ));
        }
        None
    }
}
