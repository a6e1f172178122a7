//! Telegram Bot API sender.
//!
//! The only chat backend; everything upstream of it talks to the
//! `MessageSender` trait so tests can substitute a recorder. Rate-limit
//! responses are transient; a chat the bot cannot reach is permanent.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::circuit_breaker::{BreakerConfig, CircuitBreaker};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendResult {
    Sent,
    /// Retry on the next sender pass.
    Transient(String),
    /// Do not retry; mark the row failed and raise a system alert.
    Permanent(String),
}

#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, chat_id: i64, text: &str, parse_mode: Option<&str>) -> SendResult;
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    description: Option<String>,
}

pub struct TelegramSender {
    client: Client,
    base_url: String,
    breaker: Arc<CircuitBreaker>,
}

impl TelegramSender {
    pub fn new(bot_token: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build Telegram HTTP client: {e}"))?;

        Ok(Self {
            client,
            base_url: format!("https://api.telegram.org/bot{}", bot_token),
            breaker: Arc::new(CircuitBreaker::new(BreakerConfig::new(
                "chat_send",
                5,
                Duration::from_secs(60),
            ))),
        })
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker.clone()
    }
}

#[async_trait]
impl MessageSender for TelegramSender {
    async fn send(&self, chat_id: i64, text: &str, parse_mode: Option<&str>) -> SendResult {
        if !self.breaker.allow() {
            return SendResult::Transient("chat send circuit open".to_string());
        }

        let mut body = json!({
            "chat_id": chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });
        if let Some(mode) = parse_mode {
            body["parse_mode"] = json!(mode);
        }

        let resp = self
            .client
            .post(format!("{}/sendMessage", self.base_url))
            .json(&body)
            .send()
            .await;

        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                self.breaker.record_failure();
                return SendResult::Transient(format!("network error: {e}"));
            }
        };

        let status = resp.status();
        let parsed: Option<TelegramResponse> = resp.json().await.ok();
        let ok = parsed.as_ref().map(|p| p.ok).unwrap_or(false);
        let description = parsed
            .and_then(|p| p.description)
            .unwrap_or_else(|| status.to_string());

        if ok {
            self.breaker.record_success();
            return SendResult::Sent;
        }

        // 429 and server errors retry; 4xx means the request itself is bad
        // (unknown chat, bot kicked, malformed markup) and never will work.
        if status.as_u16() == 429 || status.is_server_error() {
            self.breaker.record_failure();
            warn!(chat_id, status = %status, description, "transient telegram failure");
            SendResult::Transient(description)
        } else {
            self.breaker.record_success();
            warn!(chat_id, status = %status, description, "permanent telegram failure");
            SendResult::Permanent(description)
        }
    }
}
