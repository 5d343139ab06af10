// =============================================================================
// Reconciler — periodic repair of local state against venue truth
// =============================================================================
//
// Runs on a timer (default 5 min, first tick skewed) and skips silently while
// the risk monitor is triggered. One pass:
//
//   1. Snapshot live slots (deep copy).
//   2. Fetch open orders and positions from the venue.
//   3. Ghost-local: locked slots whose order is gone on the venue get a
//      synthesized CANCELED update fed through the engine's order handler.
//   4. Ghost-venue: venue orders the engine does not index are cancelled.
//   5. Position divergence: < threshold adopts the venue size (force sync);
//      ≥ threshold trips the circuit breaker instead of silently trading.
//
// A secondary cleaner loop (default 60 s) prunes the furthest-from-market
// orders on the over-represented side once the open-order count crosses a
// threshold. Partially-filled orders are never cleaner-cancelled.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::time::{interval, sleep, Duration};
use tracing::{debug, info, warn};

use crate::alert::AlertSender;
use crate::config::ReconcilerConfig;
use crate::engine::Engine;
use crate::executor::OrderExecutor;
use crate::risk::{CircuitBreaker, RiskMonitor};
use crate::types::{Shutdown, Side};
use crate::venue::{OrderStatus, OrderUpdate, Venue};

/// What the divergence step decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DivergenceAction {
    None,
    ForceSync,
    BreakerTripped,
}

/// Summary of one reconciliation pass, kept for the RPC surface.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub symbol: String,
    pub skipped: bool,
    pub ghost_local: u32,
    pub ghost_venue: u32,
    pub local_position: Decimal,
    pub venue_position: Decimal,
    pub divergence: f64,
    pub action: DivergenceAction,
    pub at: String,
}

impl ReconcileReport {
    fn skipped(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            skipped: true,
            ghost_local: 0,
            ghost_venue: 0,
            local_position: Decimal::ZERO,
            venue_position: Decimal::ZERO,
            divergence: 0.0,
            action: DivergenceAction::None,
            at: Utc::now().to_rfc3339(),
        }
    }
}

/// Periodic reconciler for one engine.
pub struct Reconciler {
    engine: Arc<Engine>,
    venue: Arc<dyn Venue>,
    executor: Arc<OrderExecutor>,
    risk: Arc<RiskMonitor>,
    breaker: Arc<CircuitBreaker>,
    alert: Arc<AlertSender>,
    cfg: ReconcilerConfig,
    last_report: parking_lot::RwLock<Option<ReconcileReport>>,
}

impl Reconciler {
    pub fn new(
        engine: Arc<Engine>,
        venue: Arc<dyn Venue>,
        executor: Arc<OrderExecutor>,
        risk: Arc<RiskMonitor>,
        breaker: Arc<CircuitBreaker>,
        alert: Arc<AlertSender>,
        cfg: ReconcilerConfig,
    ) -> Self {
        Self {
            engine,
            venue,
            executor,
            risk,
            breaker,
            alert,
            cfg,
            last_report: parking_lot::RwLock::new(None),
        }
    }

    pub fn last_report(&self) -> Option<ReconcileReport> {
        self.last_report.read().clone()
    }

    // -------------------------------------------------------------------------
    // One pass
    // -------------------------------------------------------------------------

    pub async fn reconcile_once(&self, shutdown: &Shutdown) -> Result<ReconcileReport> {
        let symbol = self.engine.symbol().to_string();

        if self.risk.triggered() {
            let report = ReconcileReport::skipped(&symbol);
            *self.last_report.write() = Some(report.clone());
            return Ok(report);
        }

        // 1. Deep-copied slot snapshot.
        let slots = self.engine.snapshot_slots();

        // 2. Venue truth.
        let venue_orders = self
            .venue
            .get_open_orders(Some(&symbol))
            .await
            .context("reconcile: failed to fetch open orders")?;
        let venue_positions = self
            .venue
            .get_positions(Some(&symbol))
            .await
            .context("reconcile: failed to fetch positions")?;

        let venue_order_ids: std::collections::HashSet<u64> =
            venue_orders.iter().map(|o| o.order_id).collect();

        // 3. Ghost-local: bound orders the venue no longer has.
        let mut ghost_local = 0u32;
        for slot in slots.values() {
            if slot.is_locked() && !venue_order_ids.contains(&slot.order_id) {
                ghost_local += 1;
                warn!(
                    symbol = %symbol,
                    order_id = slot.order_id,
                    price = %slot.price,
                    "ghost-local order — synthesizing cancel"
                );
                let synthetic = OrderUpdate {
                    exchange: self.venue.name().to_string(),
                    symbol: symbol.clone(),
                    order_id: slot.order_id,
                    client_order_id: slot.client_order_id.clone(),
                    side: slot.order_side,
                    price: slot.order_price,
                    status: OrderStatus::Canceled,
                    last_executed_qty: Decimal::ZERO,
                    cum_executed_qty: Decimal::ZERO,
                    ts_ms: Utc::now().timestamp_millis(),
                };
                self.engine.on_order_update(synthetic, shutdown).await?;
            }
        }

        // 4. Ghost-venue: venue orders the engine does not know.
        let ghost_ids: Vec<u64> = venue_orders
            .iter()
            .filter(|o| !self.engine.owns_order(o.order_id))
            .map(|o| o.order_id)
            .collect();
        let ghost_venue = ghost_ids.len() as u32;
        if !ghost_ids.is_empty() {
            warn!(symbol = %symbol, count = ghost_venue, "ghost venue orders — cancelling");
            let results = self.executor.batch_cancel(&symbol, &ghost_ids, shutdown).await;
            for result in results {
                if let Err(e) = result {
                    warn!(symbol = %symbol, error = %e, "ghost venue cancel failed");
                }
            }
        }

        // 5. Position divergence.
        let local_position = self.engine.local_position();
        let venue_position: Decimal = venue_positions.iter().map(|p| p.qty).sum();
        let delta = (local_position - venue_position).abs();
        let denom = venue_position.abs().to_f64().unwrap_or(0.0).max(1e-9);
        let divergence = delta.to_f64().unwrap_or(0.0) / denom;

        let action = if delta.is_zero() {
            DivergenceAction::None
        } else if divergence < self.cfg.divergence_pct / 100.0 {
            self.engine
                .force_sync(venue_position)
                .context("reconcile: force sync failed")?;
            DivergenceAction::ForceSync
        } else {
            self.breaker.open(&symbol, "large_position_divergence");
            self.alert.critical(
                "position divergence",
                &format!(
                    "local {local_position} vs venue {venue_position} ({:.1}%)",
                    divergence * 100.0
                ),
                Some(&symbol),
            );
            DivergenceAction::BreakerTripped
        };

        let report = ReconcileReport {
            symbol: symbol.clone(),
            skipped: false,
            ghost_local,
            ghost_venue,
            local_position,
            venue_position,
            divergence,
            action,
            at: Utc::now().to_rfc3339(),
        };

        info!(
            symbol = %symbol,
            ghost_local,
            ghost_venue,
            local = %local_position,
            venue = %venue_position,
            divergence = format!("{:.4}", divergence),
            action = ?action,
            "reconciliation pass completed"
        );

        *self.last_report.write() = Some(report.clone());
        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Order cleaner
    // -------------------------------------------------------------------------

    /// Prune the furthest-from-market orders once the book is crowded.
    /// Returns the number of cancels issued.
    pub async fn clean_orders_once(&self, shutdown: &Shutdown) -> Result<u32> {
        let symbol = self.engine.symbol().to_string();
        let open_orders = self
            .venue
            .get_open_orders(Some(&symbol))
            .await
            .context("cleaner: failed to fetch open orders")?;

        if open_orders.len() < self.cfg.open_order_threshold {
            return Ok(0);
        }

        let last_price = self.engine.last_price();
        // Partially-filled orders are never cleaner-cancelled.
        let candidates: Vec<_> = open_orders
            .iter()
            .filter(|o| o.executed_qty.is_zero() && o.status != OrderStatus::PartiallyFilled)
            .collect();

        let buys = candidates.iter().filter(|o| o.side == Side::Buy).count();
        let sells = candidates.len() - buys;

        let mut victims: Vec<(Decimal, u64)> = candidates
            .iter()
            .filter(|o| {
                if buys > sells {
                    o.side == Side::Buy
                } else if sells > buys {
                    o.side == Side::Sell
                } else {
                    true
                }
            })
            .map(|o| ((o.price - last_price).abs(), o.order_id))
            .collect();
        victims.sort_by(|a, b| b.0.cmp(&a.0));
        victims.truncate(self.cfg.cleaner_batch_size);

        if victims.is_empty() {
            return Ok(0);
        }

        let ids: Vec<u64> = victims.iter().map(|(_, id)| *id).collect();
        debug!(symbol = %symbol, count = ids.len(), "cleaner cancelling far-from-market orders");
        let results = self.executor.batch_cancel(&symbol, &ids, shutdown).await;
        let cancelled = results.iter().filter(|r| r.is_ok()).count() as u32;
        info!(symbol = %symbol, cancelled, "order cleaner pass completed");
        Ok(cancelled)
    }

    // -------------------------------------------------------------------------
    // Loops
    // -------------------------------------------------------------------------

    /// Main reconcile loop. The first tick is skewed to avoid a thundering
    /// herd across engines.
    pub async fn run(self: Arc<Self>, shutdown: Shutdown) {
        let skew = rand::thread_rng().gen_range(0..=self.cfg.interval_secs / 2);
        let mut sd = shutdown.clone();
        tokio::select! {
            _ = sleep(Duration::from_secs(skew)) => {}
            _ = sd.cancelled() => return,
        }

        let mut ticker = interval(Duration::from_secs(self.cfg.interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = sd.cancelled() => return,
            }
            if let Err(e) = self.reconcile_once(&shutdown).await {
                warn!(symbol = %self.engine.symbol(), error = %e, "reconciliation failed");
            }
        }
    }

    /// Secondary cleaner loop.
    pub async fn run_cleaner(self: Arc<Self>, shutdown: Shutdown) {
        let skew = rand::thread_rng().gen_range(0..=self.cfg.cleaner_interval_secs / 2);
        let mut sd = shutdown.clone();
        tokio::select! {
            _ = sleep(Duration::from_secs(skew)) => {}
            _ = sd.cancelled() => return,
        }

        let mut ticker = interval(Duration::from_secs(self.cfg.cleaner_interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = sd.cancelled() => return,
            }
            if let Err(e) = self.clean_orders_once(&shutdown).await {
                warn!(symbol = %self.engine.symbol(), error = %e, "order cleaner failed");
            }
        }
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("symbol", &self.engine.symbol())
            .finish()
    }
}
