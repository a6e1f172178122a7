//! HTTP surface: health/admin endpoints and the webhook callback.

pub mod routes;
pub mod webhook;

use axum::{
    routing::{get, post},
    Router,
};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::alerts::AlertBus;
use crate::circuit_breaker::CircuitBreaker;
use crate::models::now_ts;
use crate::scheduler::SchedulerStatus;
use crate::storage::Database;

/// Recently-seen mints; webhook streams repeat the same mint many times.
const MINT_LRU_CAPACITY: usize = 10_000;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct ApiState {
    pub db: Database,
    pub bus: Arc<AlertBus>,
    pub scheduler_status: Arc<SchedulerStatus>,
    pub market_breaker: Arc<CircuitBreaker>,
    pub chat_breaker: Arc<CircuitBreaker>,
    pub webhook_secret: Option<String>,
    pub started_at: i64,
    pub mint_dedup: Arc<Mutex<LruCache<String, ()>>>,
}

impl ApiState {
    pub fn new(
        db: Database,
        bus: Arc<AlertBus>,
        scheduler_status: Arc<SchedulerStatus>,
        market_breaker: Arc<CircuitBreaker>,
        chat_breaker: Arc<CircuitBreaker>,
        webhook_secret: Option<String>,
    ) -> Self {
        Self {
            db,
            bus,
            scheduler_status,
            market_breaker,
            chat_breaker,
            webhook_secret,
            started_at: now_ts(),
            mint_dedup: Arc::new(Mutex::new(LruCache::new(
                NonZeroUsize::new(MINT_LRU_CAPACITY).expect("nonzero capacity"),
            ))),
        }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/status", get(routes::status))
        .route("/memory", get(routes::memory))
        .route("/memory/gc", post(routes::memory_gc))
        .route(
            "/database/cleanup",
            get(routes::database_cleanup_preview).post(routes::database_cleanup),
        )
        .route("/webhooks/helius", post(webhook::helius_webhook))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
