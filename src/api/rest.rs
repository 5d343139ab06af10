// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. The health probe is public; everything
// else requires a valid API key checked via the `ApiKey` extractor.
//
// CORS is configured permissively for development; tighten allowed origins in
// production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api::auth::ApiKey;
use crate::app_state::AppState;
use crate::types::TradingMode;
use crate::venue::Venue;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/risk-profile", get(risk_profile))
        .route("/api/v1/simulate-margin", post(simulate_margin))
        .route("/api/v1/target-positions", get(target_positions))
        .route("/api/v1/market-scores", get(market_scores))
        .route("/api/v1/reconciliation", get(reconciliation))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/control/pause", post(control_pause))
        .route("/api/v1/control/resume", post(control_resume))
        .route("/api/v1/control/breaker-reset", post(breaker_reset))
        // ── WebSocket position stream ───────────────────────────────
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health probe (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    uptime_secs: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let serving = state.serving();
    let resp = HealthResponse {
        status: if serving { "SERVING" } else { "DEGRADED" },
        state_version: state.current_state_version(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    let code = if serving {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(resp))
}

// =============================================================================
// Risk profile
// =============================================================================

async fn risk_profile(_auth: ApiKey, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let breakers: Vec<serde_json::Value> = state
        .breaker
        .open_symbols()
        .into_iter()
        .map(|(symbol, reason)| serde_json::json!({ "symbol": symbol, "reason": reason }))
        .collect();

    Json(serde_json::json!({
        "triggered": state.risk_monitor.triggered(),
        "volumes": state.risk_monitor.snapshots(),
        "open_breakers": breakers,
        "regimes": state.regime_monitor.snapshots(),
    }))
}

// =============================================================================
// Margin simulation
// =============================================================================

#[derive(Deserialize)]
struct MarginProposal {
    symbol: String,
    /// Additional notional the proposal would deploy (quote units).
    notional: Decimal,
    #[serde(default = "default_leverage")]
    leverage: f64,
}

fn default_leverage() -> f64 {
    1.0
}

#[derive(Serialize)]
struct MarginSimulation {
    current_health: f64,
    projected_health: f64,
    liquidation_risk: bool,
}

/// Margin health below which a projection is flagged as liquidation risk.
const LIQUIDATION_FLOOR: f64 = 0.10;

async fn simulate_margin(
    _auth: ApiKey,
    State(state): State<Arc<AppState>>,
    Json(proposals): Json<Vec<MarginProposal>>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let account = state.venue.get_account().await.map_err(|e| {
        (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({ "error": format!("account fetch failed: {e}") })),
        )
    })?;

    let equity = account.equity.to_f64().unwrap_or(0.0);
    let current_health = account.margin_health;
    // Current margin usage implied by health, plus each proposal's initial
    // margin at its leverage.
    let current_used = equity * (1.0 - current_health);
    let additional: f64 = proposals
        .iter()
        .map(|p| {
            let notional = p.notional.to_f64().unwrap_or(0.0).abs();
            notional / p.leverage.max(1.0)
        })
        .sum();

    let projected_health = if equity <= 0.0 {
        0.0
    } else {
        (1.0 - (current_used + additional) / equity).clamp(0.0, 1.0)
    };

    info!(
        proposals = proposals.len(),
        symbols = ?proposals.iter().map(|p| p.symbol.as_str()).collect::<Vec<_>>(),
        current_health,
        projected_health,
        "margin simulation"
    );

    Ok(Json(MarginSimulation {
        current_health,
        projected_health,
        liquidation_risk: projected_health < LIQUIDATION_FLOOR,
    }))
}

// =============================================================================
// Portfolio views
// =============================================================================

async fn target_positions(_auth: ApiKey, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state
        .portfolio
        .read()
        .as_ref()
        .and_then(|controller| controller.last_report());
    match report {
        Some(report) => Json(serde_json::json!({
            "cycle_id": report.cycle_id,
            "targets": report.targets,
            "actions": report.actions,
            "margin_gate_passed": report.margin_gate_passed,
        }))
        .into_response(),
        None => Json(serde_json::json!({ "targets": [], "message": "no cycle has run yet" }))
            .into_response(),
    }
}

async fn market_scores(_auth: ApiKey, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let scores = state
        .scanner
        .read()
        .as_ref()
        .map(|scanner| scanner.last_scores())
        .unwrap_or_default();
    Json(scores)
}

// =============================================================================
// Reconciliation status
// =============================================================================

async fn reconciliation(_auth: ApiKey, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let reports: Vec<serde_json::Value> = state
        .reconcilers
        .read()
        .iter()
        .map(|(symbol, reconciler)| match reconciler.last_report() {
            Some(report) => serde_json::to_value(&report).unwrap_or_default(),
            None => serde_json::json!({ "symbol": symbol, "message": "no pass yet" }),
        })
        .collect();
    Json(reports)
}

// =============================================================================
// Positions
// =============================================================================

async fn positions(_auth: ApiKey, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.positions())
}

// =============================================================================
// Control endpoints
// =============================================================================

#[derive(Serialize)]
struct ControlResponse {
    trading_mode: String,
    message: String,
}

async fn control_pause(_auth: ApiKey, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    {
        let mut config = state.runtime_config.write();
        config.trading_mode = TradingMode::Paused;
    }
    state.increment_version();
    info!("trading PAUSED via API");
    Json(ControlResponse {
        trading_mode: "Paused".to_string(),
        message: "Trading paused".to_string(),
    })
}

async fn control_resume(_auth: ApiKey, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    {
        let mut config = state.runtime_config.write();
        config.trading_mode = TradingMode::Live;
    }
    state.increment_version();
    info!("trading RESUMED via API");
    Json(ControlResponse {
        trading_mode: "Live".to_string(),
        message: "Trading resumed".to_string(),
    })
}

#[derive(Deserialize)]
struct BreakerResetRequest {
    symbol: String,
}

async fn breaker_reset(
    _auth: ApiKey,
    State(state): State<Arc<AppState>>,
    Json(req): Json<BreakerResetRequest>,
) -> impl IntoResponse {
    let reset = state.breaker.reset(&req.symbol);
    state.increment_version();
    Json(serde_json::json!({
        "symbol": req.symbol,
        "reset": reset,
    }))
}
