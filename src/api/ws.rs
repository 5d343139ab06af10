// =============================================================================
// WebSocket Handler — position subscription stream
// =============================================================================
//
// Clients connect to `/api/v1/ws?key=<api-key>&symbols=BTCUSDT,ETHUSDT` and
// receive:
//   1. An immediate position snapshot on connect.
//   2. A fresh snapshot every 500 ms whenever the state version has changed
//      since the last push (optionally filtered to the requested symbols).
//
// Ping frames are answered with Pongs; disconnects clean up silently.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tokio::time::{interval, Duration};
use tracing::{debug, warn};

use crate::api::auth::validate_key;
use crate::app_state::AppState;

const PUSH_INTERVAL_MS: u64 = 500;

#[derive(Deserialize)]
pub struct WsQuery {
    key: Option<String>,
    /// Comma-separated symbol filter; empty = all symbols.
    symbols: Option<String>,
}

/// Axum handler for the WebSocket upgrade; validates the API key from the
/// query parameter before upgrading.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let key = query.key.unwrap_or_default();
    if !validate_key(&key) {
        warn!("WebSocket connection rejected: invalid API key");
        return (StatusCode::FORBIDDEN, "invalid API key").into_response();
    }

    let filter: Option<HashSet<String>> = query.symbols.map(|raw| {
        raw.split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect()
    });

    ws.on_upgrade(move |socket| handle_socket(socket, state, filter))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, filter: Option<HashSet<String>>) {
    debug!("position stream client connected");

    // Immediate snapshot on connect.
    if send_snapshot(&mut socket, &state, &filter, 0).await.is_none() {
        return;
    }
    let mut last_version = state.current_state_version();

    let mut ticker = interval(Duration::from_millis(PUSH_INTERVAL_MS));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let version = state.current_state_version();
                if version != last_version {
                    if send_snapshot(&mut socket, &state, &filter, version).await.is_none() {
                        break;
                    }
                    last_version = version;
                }
            }
            msg = socket.recv() => match msg {
                Some(Ok(Message::Ping(payload))) => {
                    if socket.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "position stream read error");
                    break;
                }
            },
        }
    }

    debug!("position stream client disconnected");
}

async fn send_snapshot(
    socket: &mut WebSocket,
    state: &Arc<AppState>,
    filter: &Option<HashSet<String>>,
    version: u64,
) -> Option<()> {
    let mut positions = state.positions();
    if let Some(filter) = filter {
        positions.retain(|p| filter.contains(&p.symbol));
    }
    let payload = serde_json::json!({
        "type": "positions",
        "state_version": version,
        "positions": positions,
    });
    let text = serde_json::to_string(&payload).ok()?;
    socket.send(Message::Text(text)).await.ok()
}
