// =============================================================================
// Central Application State — Meridian Funding Nexus
// =============================================================================
//
// Ties the per-symbol engines, monitors, and controllers together for the RPC
// surface and the position stream. Subsystems own their interior mutability;
// AppState holds Arc handles plus a lock-free version counter the WebSocket
// feed uses to detect changes.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::alert::AlertSender;
use crate::config::RuntimeConfig;
use crate::engine::{Engine, EngineHandle};
use crate::monitor::funding::FundingMonitor;
use crate::monitor::regime::RegimeMonitor;
use crate::portfolio::scanner::Scanner;
use crate::portfolio::PortfolioController;
use crate::reconcile::Reconciler;
use crate::risk::{CircuitBreaker, RiskMonitor};
use crate::venue::Venue;

/// Position snapshot row served by the API and the WebSocket feed.
#[derive(Debug, Clone, Serialize)]
pub struct PositionRow {
    pub symbol: String,
    pub qty: Decimal,
    pub last_price: Decimal,
    pub locked_orders: usize,
}

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    /// Monotonically increasing version counter, bumped on meaningful state
    /// mutations; the WebSocket feed polls it to decide when to push.
    pub state_version: AtomicU64,

    pub runtime_config: Arc<RwLock<RuntimeConfig>>,

    // ── Per-symbol machinery ────────────────────────────────────────────
    pub engines: RwLock<HashMap<String, Arc<Engine>>>,
    pub engine_handles: RwLock<HashMap<String, EngineHandle>>,
    pub reconcilers: RwLock<HashMap<String, Arc<Reconciler>>>,

    // ── Monitors ────────────────────────────────────────────────────────
    pub risk_monitor: Arc<RiskMonitor>,
    pub breaker: Arc<CircuitBreaker>,
    pub regime_monitor: Arc<RegimeMonitor>,
    pub funding_monitor: Arc<FundingMonitor>,

    // ── Portfolio ───────────────────────────────────────────────────────
    pub scanner: RwLock<Option<Arc<Scanner>>>,
    pub portfolio: RwLock<Option<Arc<PortfolioController>>>,

    // ── Infrastructure ──────────────────────────────────────────────────
    pub venue: Arc<dyn Venue>,
    pub alert: Arc<AlertSender>,
    pub venue_healthy: RwLock<bool>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: RuntimeConfig,
        venue: Arc<dyn Venue>,
        alert: Arc<AlertSender>,
    ) -> Self {
        let risk_monitor = Arc::new(RiskMonitor::new(config.risk.clone()));
        Self {
            state_version: AtomicU64::new(1),
            runtime_config: Arc::new(RwLock::new(config)),
            engines: RwLock::new(HashMap::new()),
            engine_handles: RwLock::new(HashMap::new()),
            reconcilers: RwLock::new(HashMap::new()),
            risk_monitor,
            breaker: Arc::new(CircuitBreaker::new()),
            regime_monitor: Arc::new(RegimeMonitor::new()),
            funding_monitor: Arc::new(FundingMonitor::new()),
            scanner: RwLock::new(None),
            portfolio: RwLock::new(None),
            venue,
            alert,
            venue_healthy: RwLock::new(true),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    /// SERVING iff the venue health probe passes and no breaker is open.
    pub fn serving(&self) -> bool {
        *self.venue_healthy.read() && self.breaker.open_symbols().is_empty()
    }

    /// Deep-copied position rows across all engines.
    pub fn positions(&self) -> Vec<PositionRow> {
        self.engines
            .read()
            .values()
            .map(|engine| {
                let slots = engine.snapshot_slots();
                PositionRow {
                    symbol: engine.symbol().to_string(),
                    qty: slots.values().map(|s| s.position_qty).sum(),
                    last_price: engine.last_price(),
                    locked_orders: slots.values().filter(|s| s.is_locked()).count(),
                }
            })
            .collect()
    }

    /// Current per-symbol notionals for the portfolio reconcile step.
    pub fn current_notionals(&self) -> HashMap<String, Decimal> {
        self.engines
            .read()
            .values()
            .filter_map(|engine| {
                let qty: Decimal = engine
                    .snapshot_slots()
                    .values()
                    .map(|s| s.position_qty)
                    .sum();
                if qty.is_zero() {
                    None
                } else {
                    Some((
                        engine.symbol().to_string(),
                        (qty * engine.last_price()).abs(),
                    ))
                }
            })
            .collect()
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("engines", &self.engines.read().len())
            .field("state_version", &self.current_state_version())
            .finish()
    }
}
