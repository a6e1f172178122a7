//! Warm-up backfill for newly added coins.
//!
//! The upstream has no candle history endpoint, but every snapshot carries
//! 1h/6h/24h price-change and volume buckets. Those are enough to
//! reconstruct coarse anchor samples, which lets the 12h warm-up gate pass
//! immediately instead of a day later. Coins whose snapshot lacks the
//! buckets warm up naturally.

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::market_data::{DexScreenerClient, PairInfo};
use crate::models::{token_key, RollingSample};
use crate::storage::Database;

#[derive(Debug, Clone, Copy)]
pub struct BackfillJob {
    pub coin_id: i64,
}

pub struct WarmupService {
    db: Database,
}

impl WarmupService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Fetch the coin's current snapshot and seed anchors from it.
    /// Returns how many samples were written.
    pub async fn backfill(
        &self,
        client: &DexScreenerClient,
        coin_id: i64,
        now: i64,
    ) -> Result<usize> {
        let Some(coin) = self.db.get_coin(coin_id)? else {
            warn!(coin_id, "backfill requested for unknown coin");
            return Ok(0);
        };

        let requests = vec![(coin.chain.clone(), coin.token_address.clone())];
        let snapshots = client.batch_get_tokens(&requests).await;
        let Some(Some(snapshot)) = snapshots.get(&token_key(&coin.chain, &coin.token_address))
        else {
            info!(symbol = %coin.symbol, "no snapshot for backfill; coin warms up naturally");
            return Ok(0);
        };

        let seeded = self.seed_from_snapshot(coin_id, now, snapshot)?;
        info!(symbol = %coin.symbol, seeded, "backfill complete");
        Ok(seeded)
    }

    /// Reconstruct anchor samples from the change buckets. Pure with
    /// respect to the snapshot, so tests drive it directly.
    pub fn seed_from_snapshot(
        &self,
        coin_id: i64,
        now: i64,
        snapshot: &PairInfo,
    ) -> Result<usize> {
        // Don't double-seed a coin that already has history.
        if self.db.data_points_count(coin_id)? > 0 {
            return Ok(0);
        }

        let p = snapshot.price;
        let v24 = snapshot.volume24h;
        let v6 = snapshot.volume6h.unwrap_or(0.0).min(v24);
        let v1 = snapshot.volume1h.unwrap_or(0.0).min(v6);

        // price N hours ago = P / (1 + change/100); a -100% bucket would
        // divide by zero and is junk anyway.
        let back_price = |change: Option<f64>| -> Option<f64> {
            let c = change?;
            let divisor = 1.0 + c / 100.0;
            (divisor > 0.0).then(|| p / divisor).filter(|r| r.is_finite() && *r > 0.0)
        };

        let anchors: [(i64, Option<f64>, f64); 3] = [
            (24 * 3600, back_price(Some(snapshot.price_change24h)), (v24 - v6).max(0.0)),
            (6 * 3600, back_price(snapshot.price_change6h), (v6 - v1).max(0.0)),
            (3600, back_price(snapshot.price_change1h), v1),
        ];

        let mut seeded = 0usize;
        for (offset, price, volume) in anchors {
            let Some(price) = price else { continue };
            self.db.fold_sample(
                coin_id,
                RollingSample {
                    ts: now - offset,
                    price,
                    volume,
                    market_cap: None,
                },
            )?;
            seeded += 1;
        }

        Ok(seeded)
    }
}

/// Background worker: drains backfill jobs enqueued when coins are added.
pub fn spawn_backfill_worker(
    service: WarmupService,
    client: std::sync::Arc<DexScreenerClient>,
    mut rx: mpsc::Receiver<BackfillJob>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                job = rx.recv() => match job {
                    Some(job) => {
                        let now = crate::models::now_ts();
                        if let Err(e) = service.backfill(&client, job.coin_id, now).await {
                            warn!(coin_id = job.coin_id, error = %e, "backfill job failed");
                        }
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("backfill worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::PairMeta;

    fn snapshot_with_buckets() -> PairInfo {
        PairInfo {
            chain_id: "solana".to_string(),
            base_token_address: "mintA".to_string(),
            symbol: "AAA".to_string(),
            name: None,
            price: 110.0,
            market_cap: None,
            fdv: None,
            volume24h: 24_000.0,
            volume6h: Some(6_000.0),
            volume1h: Some(1_000.0),
            price_change24h: 10.0,
            price_change6h: Some(4.0),
            price_change1h: Some(1.0),
            liquidity: Some(100_000.0),
            meta: PairMeta::default(),
        }
    }

    #[test]
    fn seeds_three_anchor_samples() {
        let db = Database::open_in_memory().unwrap();
        let coin = db.upsert_coin("solana", "mintA", "AAA", None, None).unwrap();
        let service = WarmupService::new(db.clone());
        let now = 1_700_000_000;

        let seeded = service
            .seed_from_snapshot(coin.coin_id, now, &snapshot_with_buckets())
            .unwrap();
        assert_eq!(seeded, 3);

        // The 24h anchor makes the 12h warm-up gate pass immediately.
        assert!(db.is_warmup_complete(coin.coin_id, 12, now).unwrap());

        // Reconstructed 24h-ago price: 110 / 1.10 = 100.
        let agg = db.window_aggregates(coin.coin_id, now).unwrap();
        assert!((agg.h72_low.unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn does_not_double_seed() {
        let db = Database::open_in_memory().unwrap();
        let coin = db.upsert_coin("solana", "mintA", "AAA", None, None).unwrap();
        let service = WarmupService::new(db.clone());
        let now = 1_700_000_000;

        service
            .seed_from_snapshot(coin.coin_id, now, &snapshot_with_buckets())
            .unwrap();
        let again = service
            .seed_from_snapshot(coin.coin_id, now + 60, &snapshot_with_buckets())
            .unwrap();
        assert_eq!(again, 0);
        assert_eq!(db.data_points_count(coin.coin_id).unwrap(), 3);
    }

    #[test]
    fn missing_buckets_seed_only_what_exists() {
        let db = Database::open_in_memory().unwrap();
        let coin = db.upsert_coin("solana", "mintA", "AAA", None, None).unwrap();
        let service = WarmupService::new(db.clone());

        let mut snapshot = snapshot_with_buckets();
        snapshot.price_change6h = None;
        snapshot.price_change1h = None;

        let seeded = service
            .seed_from_snapshot(coin.coin_id, 1_700_000_000, &snapshot)
            .unwrap();
        assert_eq!(seeded, 1);
    }

    #[test]
    fn total_drawdown_bucket_is_skipped() {
        let db = Database::open_in_memory().unwrap();
        let coin = db.upsert_coin("solana", "mintA", "AAA", None, None).unwrap();
        let service = WarmupService::new(db.clone());

        let mut snapshot = snapshot_with_buckets();
        snapshot.price_change24h = -100.0;
        snapshot.price_change6h = None;
        snapshot.price_change1h = None;

        let seeded = service
            .seed_from_snapshot(coin.coin_id, 1_700_000_000, &snapshot)
            .unwrap();
        assert_eq!(seeded, 0);
    }
}
