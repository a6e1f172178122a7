use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A tracked trading pair. `(chain, token_address)` is unique; `symbol` is
/// not and is resolved through the alias table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coin {
    pub coin_id: i64,
    pub chain: String,
    pub token_address: String,
    pub symbol: String,
    pub name: Option<String>,
    pub decimals: Option<i64>,
    pub is_active: bool,
}

impl Coin {
    /// Key used by the market-data client batch map.
    pub fn token_key(&self) -> String {
        token_key(&self.chain, &self.token_address)
    }
}

#[inline]
pub fn token_key(chain: &str, token_address: &str) -> String {
    format!("{}:{}", chain, token_address)
}

/// Per-coin subscription to long-term monitoring. Zero or one per coin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongWatch {
    pub coin_id: i64,
    pub retrace_on: bool,
    pub stall_on: bool,
    pub breakout_on: bool,
    pub mcap_on: bool,
    pub retrace_pct: f64,
    pub stall_vol_pct: f64,
    pub stall_band_pct: f64,
    pub breakout_pct: f64,
    pub breakout_vol_x: f64,
    /// Ascending positive market-cap targets; may be empty.
    pub mcap_levels: Vec<f64>,
    pub added_at: i64,
}

impl LongWatch {
    pub fn with_defaults(coin_id: i64, now: i64) -> Self {
        Self {
            coin_id,
            retrace_on: true,
            stall_on: true,
            breakout_on: true,
            mcap_on: true,
            retrace_pct: 15.0,
            stall_vol_pct: 30.0,
            stall_band_pct: 5.0,
            breakout_pct: 12.0,
            breakout_vol_x: 1.5,
            mcap_levels: Vec::new(),
            added_at: now,
        }
    }
}

/// Rolling-window cache per coin. Every field is either `None` (warm-up
/// incomplete for that window) or finite and non-negative.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LongState {
    pub coin_id: i64,
    pub h12_high: Option<f64>,
    pub h12_low: Option<f64>,
    pub h24_high: Option<f64>,
    pub h24_low: Option<f64>,
    pub h72_high: Option<f64>,
    pub h72_low: Option<f64>,
    pub v12_sum: Option<f64>,
    pub v24_sum: Option<f64>,
    pub last_price: Option<f64>,
    pub last_mcap: Option<f64>,
    pub last_updated: Option<i64>,
    pub last_retrace_fire: Option<i64>,
    pub last_stall_fire: Option<i64>,
    pub last_breakout_fire: Option<i64>,
    pub last_mcap_fire: Option<i64>,
}

/// Window aggregates computed from the sample table at query time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowAggregates {
    pub h12_high: Option<f64>,
    pub h12_low: Option<f64>,
    pub h24_high: Option<f64>,
    pub h24_low: Option<f64>,
    pub h72_high: Option<f64>,
    pub h72_low: Option<f64>,
    pub v12_sum: Option<f64>,
    pub v24_sum: Option<f64>,
}

/// Append-only per-coin sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RollingSample {
    pub ts: i64,
    pub price: f64,
    pub volume: f64,
    pub market_cap: Option<f64>,
}

/// Quick-alert entry with absolute anchors captured at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotEntry {
    pub hot_id: i64,
    pub chain: String,
    pub contract_address: String,
    pub symbol: String,
    pub display_name: Option<String>,
    pub added_at: i64,
    pub anchor_price: f64,
    pub anchor_mcap: Option<f64>,
    /// Signed percent targets, magnitude in (0, 100).
    pub pct_targets: Vec<f64>,
    /// Ascending positive market-cap targets.
    pub mcap_targets: Vec<f64>,
    pub failsafe_fired: bool,
    pub coin_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotTriggerKind {
    Pct,
    Mcap,
}

impl HotTriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HotTriggerKind::Pct => "pct",
            HotTriggerKind::Mcap => "mcap",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pct" => Some(HotTriggerKind::Pct),
            "mcap" => Some(HotTriggerKind::Mcap),
            _ => None,
        }
    }
}

/// Materialized one-shot trigger. Once `fired`, the row is never re-consulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotTrigger {
    pub hot_id: i64,
    pub kind: HotTriggerKind,
    pub value: f64,
    pub fired: bool,
}

/// Singleton scheduler tuning record, mutated only through admin commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Local "HH:MM" times resolved against the configured timezone.
    pub anchor_times_local: Vec<String>,
    pub anchor_period_hours: f64,
    pub long_checkpoint_hours: f64,
    pub hot_interval_minutes: f64,
    pub cooldown_hours: f64,
    pub hysteresis_pct: f64,
    pub global_retrace_on: bool,
    pub global_stall_on: bool,
    pub global_breakout_on: bool,
    pub global_mcap_on: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            anchor_times_local: vec!["09:00".to_string(), "21:00".to_string()],
            anchor_period_hours: 12.0,
            long_checkpoint_hours: 1.0,
            hot_interval_minutes: 5.0,
            cooldown_hours: 2.0,
            hysteresis_pct: 3.0,
            global_retrace_on: true,
            global_stall_on: true,
            global_breakout_on: true,
            global_mcap_on: true,
        }
    }
}

/// On-chain mint event ingested from the webhook stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MintEvent {
    pub signature: String,
    pub mint: String,
    pub ts: i64,
    pub decimals: Option<i64>,
    pub is_first: bool,
    pub received_at: i64,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub telegram_bot_token: String,
    pub telegram_chat_id: i64,
    pub telegram_group_chat_id: Option<i64>,
    pub database_path: String,
    pub timezone: chrono_tz::Tz,
    pub dexscreener_rate_limit_ms: u64,
    pub health_check_port: u16,
    pub helius_webhook_secret: Option<String>,
    pub ws_enabled: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let telegram_bot_token = require_env("TELEGRAM_BOT_TOKEN")?;

        let telegram_chat_id = require_env("TELEGRAM_CHAT_ID")?
            .parse::<i64>()
            .map_err(|_| anyhow::anyhow!("TELEGRAM_CHAT_ID must be a numeric chat id"))?;

        let telegram_group_chat_id = std::env::var("TELEGRAM_GROUP_CHAT_ID")
            .ok()
            .and_then(|v| v.trim().parse::<i64>().ok());

        // Accept both a bare path and a sqlite: DSN.
        let database_url = require_env("DATABASE_URL")?;
        let database_path = database_url
            .strip_prefix("sqlite://")
            .or_else(|| database_url.strip_prefix("sqlite:"))
            .unwrap_or(&database_url)
            .to_string();

        let timezone = std::env::var("TIMEZONE")
            .unwrap_or_else(|_| "UTC".to_string())
            .parse::<chrono_tz::Tz>()
            .map_err(|e| anyhow::anyhow!("Invalid TIMEZONE: {e}"))?;

        let dexscreener_rate_limit_ms = std::env::var("DEXSCREENER_RATE_LIMIT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(200);

        let health_check_port = std::env::var("HEALTH_CHECK_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(3002);

        let helius_webhook_secret = std::env::var("HELIUS_WEBHOOK_SECRET")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let ws_enabled = std::env::var("WS_ENABLED")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(false);

        Ok(Self {
            telegram_bot_token,
            telegram_chat_id,
            telegram_group_chat_id,
            database_path,
            timezone,
            dexscreener_rate_limit_ms,
            health_check_port,
            helius_webhook_secret,
            ws_enabled,
        })
    }

    /// Destination for market alerts: the group chat when configured,
    /// otherwise the admin chat.
    pub fn alert_chat_id(&self) -> i64 {
        self.telegram_group_chat_id.unwrap_or(self.telegram_chat_id)
    }
}

fn require_env(key: &str) -> anyhow::Result<String> {
    let value =
        std::env::var(key).map_err(|_| anyhow::anyhow!("{} is required but not set", key))?;
    if value.trim().is_empty() {
        anyhow::bail!("{} is required but empty", key);
    }
    Ok(value)
}

/// Current UTC timestamp in whole seconds.
#[inline]
pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}
