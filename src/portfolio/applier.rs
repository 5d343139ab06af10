// =============================================================================
// Arbitrage Rebalance Applier — routes portfolio actions into two-leg trades
// =============================================================================
//
// Converts notional-level rebalance actions into two-leg executions on a
// unified-margin venue:
//
//   remove       → exit both legs
//   reduce       → unwind (current − target) / price
//   expand / add → enter (target − current) / price
//
// Entry direction follows the sign of the latest cached funding rate for the
// symbol (positive carry → long spot / short perp).
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::info;

use crate::alert::AlertSender;
use crate::executor::OrderExecutor;
use crate::monitor::funding::FundingMonitor;
use crate::portfolio::{ActionKind, RebalanceAction, RebalanceApplier};
use crate::risk::CircuitBreaker;
use crate::store::StateStore;
use crate::twoleg::TwoLegExecutor;
use crate::types::{round_down_to_step, Shutdown};
use crate::venue::Venue;

pub struct ArbRebalanceApplier {
    spot: Arc<OrderExecutor>,
    perp: Arc<OrderExecutor>,
    store: Arc<StateStore>,
    breaker: Arc<CircuitBreaker>,
    alert: Arc<AlertSender>,
    funding: Arc<FundingMonitor>,
    executors: RwLock<HashMap<String, Arc<TwoLegExecutor>>>,
    /// Quantity step used when no symbol info is cached.
    default_step: Decimal,
}

impl ArbRebalanceApplier {
    pub fn new(
        spot: Arc<OrderExecutor>,
        perp: Arc<OrderExecutor>,
        store: Arc<StateStore>,
        breaker: Arc<CircuitBreaker>,
        alert: Arc<AlertSender>,
        funding: Arc<FundingMonitor>,
        default_step: Decimal,
    ) -> Self {
        Self {
            spot,
            perp,
            store,
            breaker,
            alert,
            funding,
            executors: RwLock::new(HashMap::new()),
            default_step,
        }
    }

    fn executor_for(&self, symbol: &str) -> Arc<TwoLegExecutor> {
        if let Some(existing) = self.executors.read().get(symbol) {
            return existing.clone();
        }
        let created = Arc::new(TwoLegExecutor::new(
            symbol,
            self.spot.clone(),
            self.perp.clone(),
            self.store.clone(),
            self.breaker.clone(),
            self.alert.clone(),
        ));
        self.executors
            .write()
            .entry(symbol.to_string())
            .or_insert(created)
            .clone()
    }

    async fn qty_for_notional(&self, symbol: &str, notional: Decimal) -> Result<Decimal> {
        let price = self
            .spot
            .venue()
            .get_latest_price(symbol)
            .await
            .map_err(|e| anyhow::anyhow!(e))
            .context("applier: price fetch failed")?;
        if price.is_zero() {
            anyhow::bail!("no usable price for {symbol}");
        }
        Ok(round_down_to_step(notional / price, self.default_step))
    }
}

#[async_trait]
impl RebalanceApplier for ArbRebalanceApplier {
    async fn apply(&self, action: &RebalanceAction, shutdown: &Shutdown) -> Result<()> {
        if self.breaker.is_open(&action.symbol) {
            anyhow::bail!("circuit breaker open for {}", action.symbol);
        }
        let twoleg = self.executor_for(&action.symbol);

        match action.kind {
            ActionKind::Remove => {
                twoleg.exit(shutdown).await?;
            }
            ActionKind::Reduce => {
                let delta = action.current_notional - action.target_notional;
                let qty = self.qty_for_notional(&action.symbol, delta).await?;
                twoleg.reduce(qty, shutdown).await?;
            }
            ActionKind::Expand | ActionKind::Add => {
                let delta = action.target_notional - action.current_notional;
                let qty = self.qty_for_notional(&action.symbol, delta).await?;
                if qty.is_zero() {
                    return Ok(());
                }
                // Positive carry → long spot / short perp; a negative cached
                // rate flips the legs.
                let direction_positive = self
                    .funding
                    .get_rate(self.perp.venue().name(), &action.symbol)
                    .map(|rate| rate.rate >= Decimal::ZERO)
                    .unwrap_or(true);
                twoleg.enter(direction_positive, qty, shutdown).await?;
            }
        }

        info!(
            symbol = %action.symbol,
            kind = %action.kind,
            current = %action.current_notional,
            target = %action.target_notional,
            "rebalance action applied"
        );
        Ok(())
    }
}

impl std::fmt::Debug for ArbRebalanceApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArbRebalanceApplier")
            .field("symbols", &self.executors.read().len())
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
    use crate::types::ShutdownController;
    use crate::venue::paper::PaperVenue;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn harness() -> (ArbRebalanceApplier, Arc<PaperVenue>, Shutdown, ShutdownController) {
        let venue = Arc::new(PaperVenue::new("paper", true));
        venue.set_price("BTCUSDT", dec!(50000));
        let cfg = ExecutorConfig::default();
        let exec = Arc::new(OrderExecutor::new(
            venue.clone(),
            Arc::new(RateLimiter::new(cfg.orders_per_sec, cfg.order_burst)),
            cfg,
        ));
        let funding = Arc::new(FundingMonitor::new());
        funding.update(crate::venue::FundingRate {
            exchange: "paper".into(),
            symbol: "BTCUSDT".into(),
            rate: dec!(0.0004),
            predicted_rate: dec!(0.0004),
            next_funding_time_ms: 0,
            observed_at: Utc::now(),
        });
        let applier = ArbRebalanceApplier::new(
            exec.clone(),
            exec,
            Arc::new(StateStore::open_in_memory().unwrap()),
            Arc::new(CircuitBreaker::new()),
            Arc::new(AlertSender::new(Vec::new())),
            funding,
            dec!(0.001),
        );
        let (ctl, shutdown) = ShutdownController::new();
        (applier, venue, shutdown, ctl)
    }

    #[tokio::test]
    async fn add_enters_sized_by_notional() {
        let (applier, venue, shutdown, _ctl) = harness();
        let action = RebalanceAction {
            symbol: "BTCUSDT".into(),
            kind: ActionKind::Add,
            current_notional: Decimal::ZERO,
            target_notional: dec!(25000),
        };
        applier.apply(&action, &shutdown).await.unwrap();

        // 25000 / 50000 = 0.5, entered and immediately hedged on the shared
        // venue: both legs on one venue net out in the book.
        let qty: Decimal = venue
            .get_positions(Some("BTCUSDT"))
            .await
            .unwrap()
            .iter()
            .map(|p| p.qty)
            .sum();
        assert_eq!(qty, Decimal::ZERO);
    }

    #[tokio::test]
    async fn open_breaker_blocks_actions() {
        let (applier, _venue, shutdown, _ctl) = harness();
        applier.breaker.open("BTCUSDT", "large_position_divergence");
        let action = RebalanceAction {
            symbol: "BTCUSDT".into(),
            kind: ActionKind::Add,
            current_notional: Decimal::ZERO,
            target_notional: dec!(25000),
        };
        assert!(applier.apply(&action, &shutdown).await.is_err());
    }
}
