//! followbot - long-list and hot-list market monitoring with Telegram alerts.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use followbot_backend::{
    alerts::{spawn_alert_subscriber, spawn_outbox_sender, AlertBus, TelegramSender},
    api::{router, ApiState},
    evaluators::{HotEvaluator, LongEvaluator},
    market_data::DexScreenerClient,
    models::Config,
    scheduler::Scheduler,
    storage::Database,
    warmup::{spawn_backfill_worker, BackfillJob, WarmupService},
};

/// Seconds granted to in-flight ticks and the outbox drain on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "followbot", about = "Crypto monitoring agent")]
struct Cli {
    /// Override HEALTH_CHECK_PORT.
    #[arg(long)]
    port: Option<u16>,
    /// Override DATABASE_URL.
    #[arg(long)]
    database: Option<String>,
}

fn init_tracing() {
    let default_directive = std::env::var("LOG_LEVEL")
        .map(|l| format!("followbot_backend={l},followbot={l}"))
        .unwrap_or_else(|_| "followbot_backend=info,followbot=info".to_string());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_directive.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = Config::from_env().context("fatal: configuration error")?;
    if let Some(port) = cli.port {
        config.health_check_port = port;
    }
    if let Some(database) = cli.database {
        config.database_path = database;
    }

    info!("🚀 followbot starting");
    if config.ws_enabled {
        warn!("WS_ENABLED is set but this build ingests mints via webhook only");
    }

    let db = Database::open(&config.database_path)?;

    let client = Arc::new(DexScreenerClient::new(Duration::from_millis(
        config.dexscreener_rate_limit_ms,
    ))?);
    let telegram = Arc::new(TelegramSender::new(&config.telegram_bot_token)?);

    let bus = Arc::new(AlertBus::new(db.clone()));
    let long_eval = Arc::new(LongEvaluator::new(db.clone(), bus.clone()));
    let hot_eval = Arc::new(HotEvaluator::new(db.clone(), bus.clone()));

    // Single shutdown signal observed by every long-running task.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Alert pipeline: bus -> outbox writer -> sender.
    let subscriber_handle = spawn_alert_subscriber(
        db.clone(),
        bus.subscribe(),
        config.clone(),
        shutdown_rx.clone(),
    );
    let sender_handle = spawn_outbox_sender(
        db.clone(),
        telegram.clone(),
        bus.clone(),
        shutdown_rx.clone(),
    );

    // Backfill queue: seeds rolling history for coins that need it.
    let (backfill_tx, backfill_rx) = mpsc::channel::<BackfillJob>(64);
    let backfill_handle = spawn_backfill_worker(
        WarmupService::new(db.clone()),
        client.clone(),
        backfill_rx,
        shutdown_rx.clone(),
    );

    // Re-enqueue warm-up for watched coins with no history yet (fresh
    // database or rows imported while the process was down).
    for (coin, _) in db.list_long_watched()? {
        if db.data_points_count(coin.coin_id)? == 0 {
            let _ = backfill_tx.send(BackfillJob { coin_id: coin.coin_id }).await;
        }
    }

    // Scheduler: long checkpoint, hot interval, cleanup, anchor reports.
    let scheduler = Arc::new(Scheduler::new(
        db.clone(),
        bus.clone(),
        client.clone(),
        long_eval,
        hot_eval,
        config.timezone,
    ));
    let scheduler_status = scheduler.status();
    let scheduler_handles = scheduler.spawn(shutdown_rx.clone());

    // HTTP surface: health endpoints + webhook callback.
    let api_state = ApiState::new(
        db.clone(),
        bus.clone(),
        scheduler_status,
        client.breaker(),
        telegram.breaker(),
        config.helius_webhook_secret.clone(),
    );
    let app = router(api_state);

    let addr = format!("0.0.0.0:{}", config.health_check_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("fatal: cannot bind {addr}"))?;
    info!("🎯 HTTP server listening on {}", addr);

    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "HTTP server error");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received; draining");

    // Stop accepting new ticks, then give in-flight work a bounded grace
    // period, outbox drain included.
    let _ = shutdown_tx.send(true);

    let mut handles = scheduler_handles;
    handles.push(subscriber_handle);
    handles.push(sender_handle);
    handles.push(backfill_handle);
    handles.push(server);

    let drain = async {
        for handle in handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("some tasks did not stop within the grace period");
    }

    info!("👋 followbot stopped");
    Ok(())
}
