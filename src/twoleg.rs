// =============================================================================
// Two-Leg Executor — atomic delta-neutral entry and exit with compensation
// =============================================================================
//
// Entry:
//   1. Spot leg as an IOC market order for the configured quantity.
//   2. Zero fill short-circuits the whole entry.
//   3. Perp leg sized to the spot leg's executed quantity (dynamic scaling).
//   4. Perp failure triggers a compensating spot order; if compensation also
//      fails a CRITICAL alert fires and the circuit breaker opens — never a
//      silent retry.
//
// Exit:
//   1. Re-sync both legs from the venues.
//   2. Close sides derive from the observed signed sizes.
//   3. Same unified-margin venue → one batch; otherwise sequential, perp
//      first.
//   4. Aggressive limit pricing 0.5 % through the last price, market when no
//      price is known.
//
// Every step is checkpointed in the workflow table; a resumed workflow
// replays from the last completed step, and deterministic per-step client
// order ids make replays idempotent even without a checkpoint.
// =============================================================================

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::alert::AlertSender;
use crate::executor::OrderExecutor;
use crate::risk::CircuitBreaker;
use crate::store::StateStore;
use crate::types::{Shutdown, Side};
use crate::venue::{OrderRequest, OrderType, TimeInForce};

/// Price offset pushed through the touch on aggressive-limit exits.
const AGGRESSIVE_OFFSET: Decimal = dec!(0.005);

const STEP_SPOT_LEG: &str = "spot_leg";
const STEP_PERP_LEG: &str = "perp_leg";
const STEP_COMPENSATION: &str = "compensation";
const STEP_EXIT_PERP: &str = "exit_perp";
const STEP_EXIT_SPOT: &str = "exit_spot";

/// Checkpoint payload for a completed leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LegCheckpoint {
    executed_qty: Decimal,
    side: Side,
}

/// Result of a completed entry.
#[derive(Debug, Clone, Serialize)]
pub struct EntryOutcome {
    pub workflow_id: String,
    pub spot_filled: Decimal,
    pub perp_filled: Decimal,
    /// True = long spot / short perp.
    pub direction_positive: bool,
}

/// Atomic two-leg execution over a spot and a perp venue.
pub struct TwoLegExecutor {
    symbol: String,
    spot: Arc<OrderExecutor>,
    perp: Arc<OrderExecutor>,
    store: Arc<StateStore>,
    breaker: Arc<CircuitBreaker>,
    alert: Arc<AlertSender>,
}

impl TwoLegExecutor {
    pub fn new(
        symbol: impl Into<String>,
        spot: Arc<OrderExecutor>,
        perp: Arc<OrderExecutor>,
        store: Arc<StateStore>,
        breaker: Arc<CircuitBreaker>,
        alert: Arc<AlertSender>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            spot,
            perp,
            store,
            breaker,
            alert,
        }
    }

    fn new_workflow_id(kind: &str) -> String {
        let id = Uuid::new_v4().simple().to_string();
        format!("twoleg-{kind}-{}", &id[..8])
    }

    // -------------------------------------------------------------------------
    // Entry
    // -------------------------------------------------------------------------

    /// Enter a fresh delta-neutral position.
    pub async fn enter(
        &self,
        direction_positive: bool,
        quantity: Decimal,
        shutdown: &Shutdown,
    ) -> Result<EntryOutcome> {
        let workflow_id = Self::new_workflow_id("entry");
        self.enter_resumable(&workflow_id, direction_positive, quantity, shutdown)
            .await
    }

    /// Entry body, resumable by workflow id. Completed steps replay from
    /// their checkpoints and are never re-placed.
    pub async fn enter_resumable(
        &self,
        workflow_id: &str,
        direction_positive: bool,
        quantity: Decimal,
        shutdown: &Shutdown,
    ) -> Result<EntryOutcome> {
        let spot_side = if direction_positive { Side::Buy } else { Side::Sell };
        let perp_side = spot_side.opposite();

        // ── Step 1: spot leg ────────────────────────────────────────────────
        let spot_filled = match self.load_leg(workflow_id, STEP_SPOT_LEG)? {
            Some(checkpoint) => {
                info!(workflow = workflow_id, qty = %checkpoint.executed_qty, "spot leg replayed from checkpoint");
                checkpoint.executed_qty
            }
            None => {
                let req = OrderRequest {
                    symbol: self.symbol.clone(),
                    side: spot_side,
                    order_type: OrderType::Market,
                    quantity,
                    price: None,
                    time_in_force: TimeInForce::Ioc,
                    post_only: false,
                    reduce_only: false,
                    client_order_id: format!("{workflow_id}-spot"),
                };
                let order = self
                    .spot
                    .place_order(req, 0, shutdown)
                    .await
                    .map_err(|e| anyhow::anyhow!(e))
                    .context("spot leg placement failed")?;
                self.record_leg(workflow_id, STEP_SPOT_LEG, order.executed_qty, spot_side)?;
                order.executed_qty
            }
        };

        // ── Step 2: zero-fill short circuit ─────────────────────────────────
        if spot_filled.is_zero() {
            self.store.clear_workflow(workflow_id).ok();
            bail!("zero fill on spot leg");
        }

        // ── Step 3: perp leg, sized to the spot fill ───────────────────────
        let perp_result = match self.load_leg(workflow_id, STEP_PERP_LEG)? {
            Some(checkpoint) => Ok(checkpoint.executed_qty),
            None => {
                let req = OrderRequest {
                    symbol: self.symbol.clone(),
                    side: perp_side,
                    order_type: OrderType::Market,
                    quantity: spot_filled,
                    price: None,
                    time_in_force: TimeInForce::Ioc,
                    post_only: false,
                    reduce_only: false,
                    client_order_id: format!("{workflow_id}-perp"),
                };
                match self.perp.place_order(req, 0, shutdown).await {
                    Ok(order) => {
                        self.record_leg(workflow_id, STEP_PERP_LEG, order.executed_qty, perp_side)?;
                        Ok(order.executed_qty)
                    }
                    Err(e) => Err(e),
                }
            }
        };

        let perp_filled = match perp_result {
            Ok(filled) => filled,
            Err(perp_err) => {
                // ── Step 4: compensation ────────────────────────────────────
                warn!(
                    workflow = workflow_id,
                    error = %perp_err,
                    qty = %spot_filled,
                    "perp leg failed — compensating spot"
                );
                let comp_req = OrderRequest {
                    symbol: self.symbol.clone(),
                    side: spot_side.opposite(),
                    order_type: OrderType::Market,
                    quantity: spot_filled,
                    price: None,
                    time_in_force: TimeInForce::Ioc,
                    post_only: false,
                    reduce_only: false,
                    client_order_id: format!("{workflow_id}-comp"),
                };
                match self.spot.place_order(comp_req, 0, shutdown).await {
                    Ok(comp) => {
                        self.record_leg(
                            workflow_id,
                            STEP_COMPENSATION,
                            comp.executed_qty,
                            spot_side.opposite(),
                        )?;
                        self.store.clear_workflow(workflow_id).ok();
                        bail!("perp leg failed ({perp_err}); spot compensated for {spot_filled}");
                    }
                    Err(comp_err) => {
                        self.breaker.open(&self.symbol, "compensation_failure");
                        self.alert.critical(
                            "two-leg compensation failed",
                            &format!(
                                "perp leg: {perp_err}; compensation: {comp_err}; unhedged spot {spot_filled}"
                            ),
                            Some(&self.symbol),
                        );
                        bail!("compensation failed after perp failure — circuit breaker opened");
                    }
                }
            }
        };

        self.store.clear_workflow(workflow_id).ok();
        info!(
            workflow = workflow_id,
            symbol = %self.symbol,
            spot = %spot_filled,
            perp = %perp_filled,
            direction_positive,
            "two-leg entry complete"
        );
        Ok(EntryOutcome {
            workflow_id: workflow_id.to_string(),
            spot_filled,
            perp_filled,
            direction_positive,
        })
    }

    // -------------------------------------------------------------------------
    // Exit
    // -------------------------------------------------------------------------

    /// Close both legs from observed venue positions.
    pub async fn exit(&self, shutdown: &Shutdown) -> Result<()> {
        let workflow_id = Self::new_workflow_id("exit");
        self.exit_resumable(&workflow_id, shutdown).await
    }

    pub async fn exit_resumable(&self, workflow_id: &str, shutdown: &Shutdown) -> Result<()> {
        // 1. Re-sync both legs.
        let spot_positions = self
            .spot
            .venue()
            .get_positions(Some(&self.symbol))
            .await
            .map_err(|e| anyhow::anyhow!(e))
            .context("exit: spot position sync failed")?;
        let perp_positions = self
            .perp
            .venue()
            .get_positions(Some(&self.symbol))
            .await
            .map_err(|e| anyhow::anyhow!(e))
            .context("exit: perp position sync failed")?;

        let spot_qty: Decimal = spot_positions.iter().map(|p| p.qty).sum();
        let perp_qty: Decimal = perp_positions.iter().map(|p| p.qty).sum();

        if spot_qty.is_zero() && perp_qty.is_zero() {
            info!(symbol = %self.symbol, "exit requested with both legs flat");
            return Ok(());
        }

        // 3. One batch on a shared unified-margin venue, else perp first. A
        // shared venue nets both legs into one book, so its close collapses
        // into a single net order.
        let same_venue = self.spot.venue().name() == self.perp.venue().name();
        if same_venue && self.spot.venue().is_unified_margin() {
            let reqs: Vec<OrderRequest> = [self
                .close_request(&self.spot, spot_qty, format!("{workflow_id}-net"))
                .await]
            .into_iter()
            .flatten()
            .collect();
            if !reqs.is_empty() {
                let results = self.spot.batch_place(reqs, shutdown).await;
                for result in results {
                    result
                        .map_err(|e| anyhow::anyhow!(e))
                        .context("exit: batch close failed")?;
                }
            }
        } else {
            let spot_req = self
                .close_request(&self.spot, spot_qty, format!("{workflow_id}-spot"))
                .await;
            let perp_req = self
                .close_request(&self.perp, perp_qty, format!("{workflow_id}-perp"))
                .await;
            if let Some(req) = perp_req {
                if self.load_leg(workflow_id, STEP_EXIT_PERP)?.is_none() {
                    let order = self
                        .perp
                        .place_order(req, 0, shutdown)
                        .await
                        .map_err(|e| anyhow::anyhow!(e))
                        .context("exit: perp close failed")?;
                    self.record_leg(workflow_id, STEP_EXIT_PERP, order.executed_qty, order.side)?;
                }
            }
            if let Some(req) = spot_req {
                if self.load_leg(workflow_id, STEP_EXIT_SPOT)?.is_none() {
                    let order = self
                        .spot
                        .place_order(req, 0, shutdown)
                        .await
                        .map_err(|e| anyhow::anyhow!(e))
                        .context("exit: spot close failed")?;
                    self.record_leg(workflow_id, STEP_EXIT_SPOT, order.executed_qty, order.side)?;
                }
            }
        }

        self.store.clear_workflow(workflow_id).ok();
        info!(symbol = %self.symbol, spot = %spot_qty, perp = %perp_qty, "two-leg exit complete");
        Ok(())
    }

    /// Partially unwind both legs by `quantity` (clamped to what is actually
    /// held). Sequential, perp first, with the same aggressive pricing as a
    /// full exit.
    pub async fn reduce(&self, quantity: Decimal, shutdown: &Shutdown) -> Result<()> {
        if quantity <= Decimal::ZERO {
            return Ok(());
        }
        let spot_positions = self
            .spot
            .venue()
            .get_positions(Some(&self.symbol))
            .await
            .map_err(|e| anyhow::anyhow!(e))
            .context("reduce: spot position sync failed")?;
        let perp_positions = self
            .perp
            .venue()
            .get_positions(Some(&self.symbol))
            .await
            .map_err(|e| anyhow::anyhow!(e))
            .context("reduce: perp position sync failed")?;

        let spot_qty: Decimal = spot_positions.iter().map(|p| p.qty).sum();
        let perp_qty: Decimal = perp_positions.iter().map(|p| p.qty).sum();

        let workflow_id = Self::new_workflow_id("reduce");
        for (executor, held, step) in [
            (&self.perp, perp_qty, STEP_EXIT_PERP),
            (&self.spot, spot_qty, STEP_EXIT_SPOT),
        ] {
            let clamped = quantity.min(held.abs());
            if clamped.is_zero() {
                continue;
            }
            let signed = if held > Decimal::ZERO { clamped } else { -clamped };
            if let Some(req) = self
                .close_request(executor, signed, format!("{workflow_id}-{step}"))
                .await
            {
                let order = executor
                    .place_order(req, 0, shutdown)
                    .await
                    .map_err(|e| anyhow::anyhow!(e))
                    .context("reduce: close order failed")?;
                self.record_leg(&workflow_id, step, order.executed_qty, order.side)?;
            }
        }
        self.store.clear_workflow(&workflow_id).ok();
        info!(symbol = %self.symbol, qty = %quantity, "two-leg exposure reduced");
        Ok(())
    }

    /// Build the closing order for one leg: aggressive limit 0.5 % through
    /// the last price, market when no price is known yet.
    async fn close_request(
        &self,
        executor: &Arc<OrderExecutor>,
        signed_qty: Decimal,
        client_order_id: String,
    ) -> Option<OrderRequest> {
        if signed_qty.is_zero() {
            return None;
        }
        let side = if signed_qty > Decimal::ZERO {
            Side::Sell
        } else {
            Side::Buy
        };
        let quantity = signed_qty.abs();

        let price = match executor.venue().get_latest_price(&self.symbol).await {
            Ok(last) => Some(match side {
                Side::Sell => last * (Decimal::ONE - AGGRESSIVE_OFFSET),
                Side::Buy => last * (Decimal::ONE + AGGRESSIVE_OFFSET),
            }),
            Err(_) => None,
        };

        Some(OrderRequest {
            symbol: self.symbol.clone(),
            side,
            order_type: if price.is_some() {
                OrderType::Limit
            } else {
                OrderType::Market
            },
            quantity,
            price,
            time_in_force: TimeInForce::Ioc,
            post_only: false,
            reduce_only: true,
            client_order_id,
        })
    }

    // -------------------------------------------------------------------------
    // Checkpoints
    // -------------------------------------------------------------------------

    fn record_leg(
        &self,
        workflow_id: &str,
        step: &str,
        executed_qty: Decimal,
        side: Side,
    ) -> Result<()> {
        let payload = serde_json::to_value(LegCheckpoint { executed_qty, side })
            .context("failed to serialize leg checkpoint")?;
        self.store.record_step(workflow_id, step, &payload)
    }

    fn load_leg(&self, workflow_id: &str, step: &str) -> Result<Option<LegCheckpoint>> {
        match self.store.get_step(workflow_id, step)? {
            Some(payload) => Ok(Some(
                serde_json::from_value(payload).context("failed to parse leg checkpoint")?,
            )),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for TwoLegExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwoLegExecutor")
            .field("symbol", &self.symbol)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;
    use crate::executor::RateLimiter;
    use crate::types::{ShutdownController, VenueError};
    use crate::venue::paper::PaperVenue;
    use crate::venue::Venue;

    struct Harness {
        twoleg: TwoLegExecutor,
        spot: Arc<PaperVenue>,
        perp: Arc<PaperVenue>,
        breaker: Arc<CircuitBreaker>,
        store: Arc<StateStore>,
        shutdown: Shutdown,
        _ctl: ShutdownController,
    }

    fn harness() -> Harness {
        let spot = Arc::new(PaperVenue::new("paper-spot", false));
        let perp = Arc::new(PaperVenue::new("paper-perp", false));
        spot.set_price("BTCUSDT", dec!(45000));
        perp.set_price("BTCUSDT", dec!(45005));

        let cfg = ExecutorConfig::default();
        let spot_exec = Arc::new(OrderExecutor::new(
            spot.clone(),
            Arc::new(RateLimiter::new(cfg.orders_per_sec, cfg.order_burst)),
            cfg.clone(),
        ));
        let perp_exec = Arc::new(OrderExecutor::new(
            perp.clone(),
            Arc::new(RateLimiter::new(cfg.orders_per_sec, cfg.order_burst)),
            cfg,
        ));

        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let breaker = Arc::new(CircuitBreaker::new());
        let alert = Arc::new(AlertSender::new(Vec::new()));
        let twoleg = TwoLegExecutor::new(
            "BTCUSDT",
            spot_exec,
            perp_exec,
            store.clone(),
            breaker.clone(),
            alert,
        );
        let (ctl, shutdown) = ShutdownController::new();
        Harness {
            twoleg,
            spot,
            perp,
            breaker,
            store,
            shutdown,
            _ctl: ctl,
        }
    }

    async fn position(venue: &Arc<PaperVenue>) -> Decimal {
        venue
            .get_positions(Some("BTCUSDT"))
            .await
            .unwrap()
            .iter()
            .map(|p| p.qty)
            .sum()
    }

    #[tokio::test]
    async fn entry_positive_full_fill() {
        let h = harness();
        let outcome = h
            .twoleg
            .enter(true, dec!(1.0), &h.shutdown)
            .await
            .unwrap();
        assert_eq!(outcome.spot_filled, dec!(1.0));
        assert_eq!(outcome.perp_filled, dec!(1.0));
        assert_eq!(position(&h.spot).await, dec!(1.0));
        assert_eq!(position(&h.perp).await, dec!(-1.0));
    }

    #[tokio::test]
    async fn entry_scales_perp_to_spot_fill() {
        let h = harness();
        // Spot IOC fills only 80 % — perp must match 0.8, not 1.0.
        h.spot.set_next_market_fill_ratio(dec!(0.8));
        let outcome = h
            .twoleg
            .enter(true, dec!(1.0), &h.shutdown)
            .await
            .unwrap();
        assert_eq!(outcome.spot_filled, dec!(0.8));
        assert_eq!(outcome.perp_filled, dec!(0.8));
        assert_eq!(position(&h.spot).await, dec!(0.8));
        assert_eq!(position(&h.perp).await, dec!(-0.8));
    }

    #[tokio::test]
    async fn zero_fill_short_circuits() {
        let h = harness();
        h.spot.set_next_market_fill_ratio(Decimal::ZERO);
        let err = h
            .twoleg
            .enter(true, dec!(1.0), &h.shutdown)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("zero fill"));
        assert_eq!(position(&h.perp).await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn perp_failure_compensates_to_net_zero() {
        let h = harness();
        h.perp
            .inject_failure("place_order", VenueError::OrderRejected("risk limit".into()));
        let err = h
            .twoleg
            .enter(true, dec!(1.0), &h.shutdown)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("compensated"));

        // Compensation restores a flat book; the breaker stays closed.
        assert_eq!(position(&h.spot).await, Decimal::ZERO);
        assert_eq!(position(&h.perp).await, Decimal::ZERO);
        assert!(!h.breaker.is_open("BTCUSDT"));
    }

    #[tokio::test]
    async fn compensation_failure_opens_breaker() {
        let h = harness();
        h.perp
            .inject_failure("place_order", VenueError::OrderRejected("risk limit".into()));
        // The spot leg passes; the compensation order fails.
        h.spot.inject_pass("place_order");
        h.spot
            .inject_failure("place_order", VenueError::OrderRejected("spot rejected".into()));

        let err = h
            .twoleg
            .enter(true, dec!(1.0), &h.shutdown)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("circuit breaker"));
        // Delta is NOT zero and the breaker is open — the operator must act.
        assert_eq!(position(&h.spot).await, dec!(1.0));
        assert!(h.breaker.is_open("BTCUSDT"));
        assert_eq!(h.breaker.reason("BTCUSDT").unwrap(), "compensation_failure");
    }

    #[tokio::test]
    async fn resumed_entry_replays_completed_spot_leg() {
        let h = harness();
        // First attempt: perp leg dies AND compensation dies, leaving the
        // spot checkpoint behind (breaker opens).
        h.perp
            .inject_failure("place_order", VenueError::OrderRejected("perp rejected".into()));
        h.spot.inject_pass("place_order");
        h.spot
            .inject_failure("place_order", VenueError::OrderRejected("spot rejected".into()));
        let workflow_id = "twoleg-entry-resume1";
        let _ = h
            .twoleg
            .enter_resumable(workflow_id, true, dec!(1.0), &h.shutdown)
            .await
            .unwrap_err();
        assert_eq!(position(&h.spot).await, dec!(1.0));

        // Resume: the spot leg must replay from its checkpoint, not re-place.
        h.breaker.reset("BTCUSDT");
        let outcome = h
            .twoleg
            .enter_resumable(workflow_id, true, dec!(1.0), &h.shutdown)
            .await
            .unwrap();
        assert_eq!(outcome.spot_filled, dec!(1.0));
        // Still exactly 1.0 long on spot — no double placement.
        assert_eq!(position(&h.spot).await, dec!(1.0));
        assert_eq!(position(&h.perp).await, dec!(-1.0));
        // Checkpoints are cleared after success.
        assert!(h.store.get_step(workflow_id, STEP_SPOT_LEG).unwrap().is_none());
    }

    #[tokio::test]
    async fn exit_closes_both_legs_sequentially() {
        let h = harness();
        h.twoleg.enter(true, dec!(1.0), &h.shutdown).await.unwrap();

        h.twoleg.exit(&h.shutdown).await.unwrap();
        assert_eq!(position(&h.spot).await, Decimal::ZERO);
        assert_eq!(position(&h.perp).await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn reduce_unwinds_half_the_position() {
        let h = harness();
        h.twoleg.enter(true, dec!(1.0), &h.shutdown).await.unwrap();

        h.twoleg.reduce(dec!(0.5), &h.shutdown).await.unwrap();
        assert_eq!(position(&h.spot).await, dec!(0.5));
        assert_eq!(position(&h.perp).await, dec!(-0.5));
    }

    #[tokio::test]
    async fn reduce_clamps_to_held_quantity() {
        let h = harness();
        h.twoleg.enter(true, dec!(0.3), &h.shutdown).await.unwrap();

        // Asking for more than held flattens, never flips.
        h.twoleg.reduce(dec!(5.0), &h.shutdown).await.unwrap();
        assert_eq!(position(&h.spot).await, Decimal::ZERO);
        assert_eq!(position(&h.perp).await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn exit_with_flat_legs_is_noop() {
        let h = harness();
        h.twoleg.exit(&h.shutdown).await.unwrap();
        assert_eq!(h.spot.open_order_count(), 0);
        assert_eq!(h.perp.open_order_count(), 0);
    }

    #[tokio::test]
    async fn unified_margin_exit_uses_single_batch() {
        // Both legs on one unified-margin venue.
        let venue = Arc::new(PaperVenue::new("paper-um", true));
        venue.set_price("BTCUSDT", dec!(45000));
        let cfg = ExecutorConfig::default();
        let exec = Arc::new(OrderExecutor::new(
            venue.clone(),
            Arc::new(RateLimiter::new(cfg.orders_per_sec, cfg.order_burst)),
            cfg,
        ));
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let breaker = Arc::new(CircuitBreaker::new());
        let alert = Arc::new(AlertSender::new(Vec::new()));
        let twoleg = TwoLegExecutor::new(
            "BTCUSDT",
            exec.clone(),
            exec,
            store,
            breaker,
            alert,
        );
        let (_ctl, shutdown) = ShutdownController::new();

        // Seed a lopsided book: +0.5 spot-equivalent on the venue.
        venue.set_position("BTCUSDT", dec!(0.5), dec!(45000));
        twoleg.exit(&shutdown).await.unwrap();
        let qty: Decimal = venue
            .get_positions(Some("BTCUSDT"))
            .await
            .unwrap()
            .iter()
            .map(|p| p.qty)
            .sum();
        assert_eq!(qty, Decimal::ZERO);
    }
}
