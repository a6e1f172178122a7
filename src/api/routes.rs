//! Health and admin endpoints.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{info, warn};

use super::ApiState;
use crate::circuit_breaker::{BreakerSnapshot, BreakerState};
use crate::models::now_ts;

/// Header that authorizes a live (non-dry-run) database cleanup.
pub const CONFIRM_CLEANUP_HEADER: &str = "x-confirm-cleanup";

#[derive(Debug, Serialize)]
pub struct MemorySnapshot {
    pub process_rss_bytes: u64,
    pub process_virtual_bytes: u64,
    pub system_total_bytes: u64,
    pub system_used_bytes: u64,
    pub database_file_bytes: u64,
}

fn memory_snapshot(state: &ApiState) -> MemorySnapshot {
    let mut sys = System::new();
    sys.refresh_memory();

    let pid = Pid::from_u32(std::process::id());
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        ProcessRefreshKind::new().with_memory(),
    );

    let (rss, virt) = sys
        .process(pid)
        .map(|p| (p.memory(), p.virtual_memory()))
        .unwrap_or((0, 0));

    MemorySnapshot {
        process_rss_bytes: rss,
        process_virtual_bytes: virt,
        system_total_bytes: sys.total_memory(),
        system_used_bytes: sys.used_memory(),
        database_file_bytes: state.db.file_size_bytes().unwrap_or(0),
    }
}

/// Overall status folds scheduler liveness with breaker states: a dead
/// evaluator loop is unhealthy, an open upstream circuit is degraded.
pub async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let schedule = state.db.schedule_config().ok();
    let long_cadence = schedule
        .as_ref()
        .map(|c| (c.long_checkpoint_hours * 3600.0) as i64)
        .unwrap_or(3600);
    let hot_cadence = schedule
        .as_ref()
        .map(|c| (c.hot_interval_minutes * 60.0) as i64)
        .unwrap_or(300);

    let scheduler = state.scheduler_status.snapshot(long_cadence, hot_cadence);
    let breakers: Vec<BreakerSnapshot> = vec![
        state.market_breaker.snapshot(),
        state.chat_breaker.snapshot(),
    ];
    let breaker_open = breakers.iter().any(|b| b.state != BreakerState::Closed);

    let (pending, sent, failed) = state.db.outbox_counts().unwrap_or((0, 0, 0));

    let status = if !scheduler.long_alive || !scheduler.hot_alive {
        "unhealthy"
    } else if breaker_open || !scheduler.cleanup_alive || pending > 500 {
        "degraded"
    } else {
        "healthy"
    };

    Json(json!({
        "status": status,
        "uptime_seconds": now_ts() - state.started_at,
        "memory": memory_snapshot(&state),
        "scheduler": scheduler,
        "breakers": breakers,
        "outbox": {"pending": pending, "sent": sent, "failed": failed},
        "growth": {
            "alert_ring": state.bus.ring_len(),
            "mint_events": state.db.mint_event_count().unwrap_or(0),
            "database_file_bytes": state.db.file_size_bytes().unwrap_or(0),
        },
    }))
}

pub async fn status(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptime_seconds": now_ts() - state.started_at,
    }))
}

pub async fn memory(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let snapshot = memory_snapshot(&state);
    Json(json!({
        "memory": snapshot,
        "alert_ring": state.bus.ring_len(),
    }))
}

/// Release what we can: SQLite page cache plus freed-page bookkeeping.
pub async fn memory_gc(
    State(state): State<ApiState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let before = state.db.file_size_bytes().unwrap_or(0);
    state.db.shrink().map_err(|e| {
        warn!(error = %e, "memory gc failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let after = state.db.file_size_bytes().unwrap_or(0);
    info!(before, after, "memory gc complete");
    Ok(Json(
        json!({"ok": true, "db_bytes_before": before, "db_bytes_after": after}),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupRequest {
    pub days_to_keep: Option<i64>,
    pub dry_run: Option<bool>,
}

const DEFAULT_DAYS_TO_KEEP: i64 = 30;

fn run_cleanup(
    state: &ApiState,
    days_to_keep: i64,
    dry_run: bool,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if days_to_keep < 1 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let (history, outbox, mints) = state
        .db
        .cleanup_history(now_ts(), days_to_keep, dry_run)
        .map_err(|e| {
            warn!(error = %e, "database cleanup failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    if !dry_run {
        info!(history, outbox, mints, days_to_keep, "database cleanup executed");
    }

    Ok(Json(json!({
        "dry_run": dry_run,
        "days_to_keep": days_to_keep,
        "alert_history_rows": history,
        "outbox_rows": outbox,
        "mint_event_rows": mints,
    })))
}

/// GET form is always a dry run.
pub async fn database_cleanup_preview(
    State(state): State<ApiState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    run_cleanup(&state, DEFAULT_DAYS_TO_KEEP, true)
}

/// POST form performs the deletion when `dryRun` is false AND the
/// confirmation header is present.
pub async fn database_cleanup(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<CleanupRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let days_to_keep = req.days_to_keep.unwrap_or(DEFAULT_DAYS_TO_KEEP);
    let dry_run = req.dry_run.unwrap_or(true);

    if !dry_run {
        let confirmed = headers
            .get(CONFIRM_CLEANUP_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("yes"))
            .unwrap_or(false);
        if !confirmed {
            return Err(StatusCode::PRECONDITION_REQUIRED);
        }
    }

    run_cleanup(&state, days_to_keep, dry_run)
}
