//! DexScreener REST client.
//!
//! One GET per chain with a comma-separated address list; responses are
//! flat pair arrays. Every call flows through the shared token bucket and
//! the market-data circuit breaker. Failures are per-batch non-fatal: the
//! affected tokens resolve to `None` and the tick carries on.

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::rate_limit::TokenBucket;
use crate::circuit_breaker::{BreakerConfig, CircuitBreaker};
use crate::models::token_key;

const DEXSCREENER_API_BASE: &str = "https://api.dexscreener.com";

/// Upstream hard limit on addresses per request.
const MAX_ADDRESSES_PER_CALL: usize = 30;

/// Metadata bag passed through to the formatter; never consulted by the
/// evaluators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PairMeta {
    pub image_url: Option<String>,
    pub websites: Vec<String>,
    pub socials: Vec<String>,
}

/// The single best pair selected for a token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairInfo {
    pub chain_id: String,
    pub base_token_address: String,
    pub symbol: String,
    pub name: Option<String>,
    /// USD price, always positive once constructed.
    pub price: f64,
    pub market_cap: Option<f64>,
    pub fdv: Option<f64>,
    pub volume24h: f64,
    pub volume6h: Option<f64>,
    pub volume1h: Option<f64>,
    pub price_change24h: f64,
    pub price_change6h: Option<f64>,
    pub price_change1h: Option<f64>,
    pub liquidity: Option<f64>,
    pub meta: PairMeta,
}

impl PairInfo {
    /// Market cap with FDV fallback. Report paths opt in explicitly; the
    /// evaluator always reads `market_cap` directly.
    pub fn market_cap_or_fdv(&self) -> Option<f64> {
        self.market_cap.or(self.fdv)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawToken {
    address: String,
    name: Option<String>,
    symbol: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawVolume {
    h24: Option<f64>,
    h6: Option<f64>,
    h1: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPriceChange {
    h24: Option<f64>,
    h6: Option<f64>,
    h1: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawLiquidity {
    usd: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLink {
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInfo {
    image_url: Option<String>,
    #[serde(default)]
    websites: Vec<RawLink>,
    #[serde(default)]
    socials: Vec<RawLink>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPair {
    chain_id: String,
    base_token: RawToken,
    price_usd: Option<String>,
    #[serde(default)]
    volume: RawVolume,
    #[serde(default)]
    price_change: RawPriceChange,
    #[serde(default)]
    liquidity: RawLiquidity,
    market_cap: Option<f64>,
    fdv: Option<f64>,
    info: Option<RawInfo>,
}

impl RawPair {
    /// `priceUsd` missing or "0" means no usable quote.
    fn parsed_price(&self) -> Option<f64> {
        let price = self.price_usd.as_deref()?.trim().parse::<f64>().ok()?;
        (price > 0.0 && price.is_finite()).then_some(price)
    }

    fn into_pair_info(self) -> Option<PairInfo> {
        let price = self.parsed_price()?;
        let meta = self
            .info
            .map(|i| PairMeta {
                image_url: i.image_url,
                websites: i.websites.into_iter().filter_map(|l| l.url).collect(),
                socials: i.socials.into_iter().filter_map(|l| l.url).collect(),
            })
            .unwrap_or_default();

        Some(PairInfo {
            chain_id: self.chain_id,
            base_token_address: self.base_token.address,
            symbol: self.base_token.symbol.unwrap_or_default(),
            name: self.base_token.name,
            price,
            market_cap: self.market_cap,
            fdv: self.fdv,
            volume24h: self.volume.h24.unwrap_or(0.0),
            volume6h: self.volume.h6,
            volume1h: self.volume.h1,
            price_change24h: self.price_change.h24.unwrap_or(0.0),
            price_change6h: self.price_change.h6,
            price_change1h: self.price_change.h1,
            liquidity: self.liquidity.usd,
            meta,
        })
    }
}

pub struct DexScreenerClient {
    client: Client,
    base_url: String,
    bucket: TokenBucket,
    breaker: Arc<CircuitBreaker>,
}

impl DexScreenerClient {
    pub fn new(min_request_delay: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .context("Failed to build DexScreener HTTP client")?;

        Ok(Self {
            client,
            base_url: DEXSCREENER_API_BASE.to_string(),
            bucket: TokenBucket::new(min_request_delay),
            breaker: Arc::new(CircuitBreaker::new(BreakerConfig::new(
                "market_data",
                5,
                Duration::from_secs(120),
            ))),
        })
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker.clone()
    }

    /// Fetch the best pair for each `(chain, token_address)` request. The
    /// result map always contains every requested key; tokens without a
    /// liquid pair (or inside a failed chain batch) map to `None`.
    pub async fn batch_get_tokens(
        &self,
        requests: &[(String, String)],
    ) -> HashMap<String, Option<PairInfo>> {
        let mut result: HashMap<String, Option<PairInfo>> = requests
            .iter()
            .map(|(chain, addr)| (token_key(chain, addr), None))
            .collect();

        let mut by_chain: HashMap<&str, Vec<&str>> = HashMap::new();
        for (chain, addr) in requests {
            by_chain.entry(chain.as_str()).or_default().push(addr.as_str());
        }

        for (chain, addresses) in by_chain {
            for chunk in addresses.chunks(MAX_ADDRESSES_PER_CALL) {
                match self.fetch_chain_chunk(chain, chunk).await {
                    Ok(pairs) => {
                        for addr in chunk {
                            if let Some(best) = select_best_pair(&pairs, addr) {
                                result.insert(token_key(chain, addr), Some(best));
                            }
                        }
                    }
                    Err(e) => {
                        warn!(chain, tokens = chunk.len(), error = %e, "market data batch failed");
                    }
                }
            }
        }

        result
    }

    async fn fetch_chain_chunk(&self, chain: &str, addresses: &[&str]) -> Result<Vec<PairInfo>> {
        if !self.breaker.allow() {
            anyhow::bail!("market data circuit open");
        }

        self.bucket.acquire().await;

        let url = format!(
            "{}/tokens/v1/{}/{}",
            self.base_url,
            chain,
            addresses.join(",")
        );

        let outcome = async {
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .context("GET tokens batch failed")?;

            if !resp.status().is_success() {
                let status = resp.status();
                anyhow::bail!("GET tokens batch {}: {}", status, chain);
            }

            let raw: Vec<RawPair> = resp
                .json()
                .await
                .context("Failed to parse tokens batch response")?;

            Ok::<_, anyhow::Error>(raw)
        }
        .await;

        match outcome {
            Ok(raw) => {
                self.breaker.record_success();
                let pairs: Vec<PairInfo> =
                    raw.into_iter().filter_map(RawPair::into_pair_info).collect();
                debug!(chain, pairs = pairs.len(), "market data batch ok");
                Ok(pairs)
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(e)
            }
        }
    }

    /// Lightweight availability probe for health checks.
    pub async fn is_available(&self) -> bool {
        self.client
            .get(format!("{}/latest/dex/search", self.base_url))
            .query(&[("q", "SOL")])
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

/// Select the single best pair for a token: highest USD liquidity first,
/// then highest 24h volume. The fold keeps the earliest candidate on exact
/// ties so the choice is stable while upstream data is stable.
pub fn select_best_pair(pairs: &[PairInfo], token_address: &str) -> Option<PairInfo> {
    pairs
        .iter()
        .filter(|p| addresses_match(&p.base_token_address, token_address))
        .fold(None::<&PairInfo>, |best, candidate| match best {
            None => Some(candidate),
            Some(current) => {
                if pair_rank(candidate) > pair_rank(current) {
                    Some(candidate)
                } else {
                    Some(current)
                }
            }
        })
        .cloned()
}

#[inline]
fn pair_rank(p: &PairInfo) -> (f64, f64) {
    (p.liquidity.unwrap_or(0.0), p.volume24h)
}

/// EVM addresses come back in mixed checksum casing; Solana mints are
/// case-sensitive base58 but never differ only by case in practice.
#[inline]
fn addresses_match(a: &str, b: &str) -> bool {
    a == b || a.eq_ignore_ascii_case(b)
}
