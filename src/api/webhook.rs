//! Helius webhook ingest.
//!
//! Verifies the HMAC signature over the raw body, extracts
//! `(signature, mint, timestamp, decimals?)` tuples, dedups mints through
//! an LRU, and persists mint events. Nothing is written for requests that
//! fail verification or parsing.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, warn};

use super::ApiState;
use crate::models::now_ts;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTokenTransfer {
    mint: Option<String>,
    #[serde(default)]
    decimals: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHeliusEvent {
    signature: Option<String>,
    timestamp: Option<i64>,
    #[serde(default)]
    token_transfers: Vec<RawTokenTransfer>,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub received: usize,
    pub persisted: usize,
    pub deduped: usize,
}

/// Constant-time HMAC check over the raw payload bytes.
pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

pub async fn helius_webhook(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, StatusCode> {
    let Some(secret) = state.webhook_secret.as_deref() else {
        // Not configured: the endpoint exists but refuses traffic.
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if !verify_signature(secret, &body, signature) {
        warn!("webhook signature mismatch");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let events: Vec<RawHeliusEvent> =
        serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?;

    let received_at = now_ts();
    let mut response = WebhookResponse {
        received: 0,
        persisted: 0,
        deduped: 0,
    };

    for event in events {
        let Some(signature) = event.signature else {
            continue;
        };
        let ts = event.timestamp.unwrap_or(received_at);

        for transfer in event.token_transfers {
            let Some(mint) = transfer.mint else { continue };
            response.received += 1;

            // LRU gate before touching the database: webhook streams
            // repeat mints heavily.
            {
                let mut seen = state.mint_dedup.lock();
                if seen.put(mint.clone(), ()).is_some() {
                    response.deduped += 1;
                    continue;
                }
            }

            match state
                .db
                .record_mint_event(&signature, &mint, ts, transfer.decimals, received_at)
            {
                Ok(true) => response.persisted += 1,
                Ok(false) => response.deduped += 1,
                Err(e) => {
                    warn!(error = %e, mint, "failed to persist mint event");
                }
            }
        }
    }

    if response.persisted > 0 {
        info!(
            persisted = response.persisted,
            deduped = response.deduped,
            "mint events ingested"
        );
    }
    Ok(Json(response))
}
