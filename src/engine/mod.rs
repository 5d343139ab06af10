// =============================================================================
// Symbol Engine — event-driven slot reconciliation with persist-before-mutate
// =============================================================================
//
// One engine per symbol. The engine's event task is the only writer of its
// slot map; everyone else gets deep-copied snapshots.
//
// Concurrency contract (load-bearing):
//   - The engine mutex guards state inspection and decision only.
//   - Before any network call the handler sets `is_executing` and releases
//     the mutex; after the call it re-acquires to apply results.
//   - Handlers observing `is_executing == true` return without acting.
//   - No lock is ever held across `.await`.
//
// Persistence contract:
//   - Results are applied to a cloned slot map, persisted as a preview, and
//     only then copied into live state. A failed save leaves the in-memory
//     map byte-identical to its pre-handler snapshot; there is no rollback
//     path because nothing was mutated.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::GridConfig;
use crate::executor::OrderExecutor;
use crate::monitor::regime::RegimeMonitor;
use crate::risk::{CircuitBreaker, RiskMonitor};
use crate::slot::{InventorySlot, SlotStatus};
use crate::store::{PersistedState, StateStore};
use crate::strategy::grid::{compute_grid_target, GridInputs};
use crate::strategy::TargetState;
use crate::types::{round_to_tick, Shutdown, Side, VenueError};
use crate::venue::{
    AccountUpdate, FundingRate, OrderRequest, OrderStatus, OrderUpdate, PositionUpdate,
    PriceUpdate, SymbolInfo,
};

// ---------------------------------------------------------------------------
// Events and queues
// ---------------------------------------------------------------------------

/// Canonical event fed into a per-engine queue.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Price(PriceUpdate),
    Order(OrderUpdate),
    Funding(FundingRate),
    Position(PositionUpdate),
    Account(AccountUpdate),
}

/// Sending side of an engine's bounded queues.
///
/// Price events are lossy (drop-with-warning on overflow); order, position,
/// and account events are critical and apply backpressure instead.
#[derive(Clone)]
pub struct EngineHandle {
    symbol: String,
    critical_tx: mpsc::Sender<EngineEvent>,
    lossy_tx: mpsc::Sender<EngineEvent>,
}

impl EngineHandle {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Non-critical delivery: overflow drops the event with a warning.
    pub fn send_lossy(&self, event: EngineEvent) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.lossy_tx.try_send(event) {
            warn!(symbol = %self.symbol, "engine queue full — price event dropped");
        }
    }

    /// Critical delivery: awaits queue space rather than dropping.
    pub async fn send_critical(&self, event: EngineEvent) {
        if self.critical_tx.send(event).await.is_err() {
            warn!(symbol = %self.symbol, "engine queue closed — critical event lost");
        }
    }
}

// ---------------------------------------------------------------------------
// Planned actions
// ---------------------------------------------------------------------------

/// One step of the ordered action list derived from a target diff.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedAction {
    Cancel {
        slot_key: String,
        order_id: u64,
    },
    Place {
        slot_key: String,
        side: Side,
        price: Decimal,
        quantity: Decimal,
        post_only: bool,
        reduce_only: bool,
    },
}

/// Diff a target state against the live slots.
///
/// Returns the ordered action list (cancels before places; buys ascending by
/// price, sells descending) and the keys of slots that are Free/Empty with no
/// remaining target, which the caller destroys.
///
/// Partially-filled orders are never cancelled here; a slot whose order no
/// longer matches its target is cancelled this pass and re-quoted on the
/// next.
pub fn diff_target(
    slots: &BTreeMap<String, InventorySlot>,
    target: &TargetState,
) -> (Vec<PlannedAction>, Vec<String>) {
    let mut cancels: Vec<(Decimal, PlannedAction)> = Vec::new();
    let mut buys: Vec<(Decimal, PlannedAction)> = Vec::new();
    let mut sells: Vec<(Decimal, PlannedAction)> = Vec::new();
    let mut removals: Vec<String> = Vec::new();

    for (key, slot) in slots {
        if slot.is_locked() {
            if slot.is_partially_filled() {
                continue;
            }
            let wanted = target.orders.iter().any(|o| {
                o.slot_key == *key
                    && o.side == slot.order_side
                    && o.price == slot.order_price
                    && o.quantity == slot.order_qty
            });
            if !wanted {
                cancels.push((
                    slot.price,
                    PlannedAction::Cancel {
                        slot_key: key.clone(),
                        order_id: slot.order_id,
                    },
                ));
            }
        } else if slot.is_removable() && !target.orders.iter().any(|o| o.slot_key == *key) {
            removals.push(key.clone());
        }
    }

    for order in &target.orders {
        if let Some(slot) = slots.get(&order.slot_key) {
            if slot.slot_status != SlotStatus::Free {
                // Locked (kept or being cancelled) or already pending — the
                // next tick re-evaluates once the slot frees up.
                continue;
            }
        }
        let action = PlannedAction::Place {
            slot_key: order.slot_key.clone(),
            side: order.side,
            price: order.price,
            quantity: order.quantity,
            post_only: order.post_only,
            reduce_only: order.reduce_only,
        };
        match order.side {
            Side::Buy => buys.push((order.price, action)),
            Side::Sell => sells.push((order.price, action)),
        }
    }

    cancels.sort_by(|a, b| a.0.cmp(&b.0));
    buys.sort_by(|a, b| a.0.cmp(&b.0));
    sells.sort_by(|a, b| b.0.cmp(&a.0));

    let mut actions: Vec<PlannedAction> = Vec::new();
    actions.extend(cancels.into_iter().map(|(_, a)| a));
    actions.extend(buys.into_iter().map(|(_, a)| a));
    actions.extend(sells.into_iter().map(|(_, a)| a));
    (actions, removals)
}

// ---------------------------------------------------------------------------
// Engine state
// ---------------------------------------------------------------------------

struct EngineState {
    slots: BTreeMap<String, InventorySlot>,
    /// order_id → slot key; rebuilt on every apply.
    order_index: HashMap<u64, String>,
    /// client_order_id → slot key; rebuilt on every apply.
    coid_index: HashMap<String, String>,
    anchor_price: Decimal,
    last_price: Decimal,
    version: u64,
    risk_was_triggered: bool,
}

impl EngineState {
    fn rebuild_indexes(&mut self) {
        self.order_index.clear();
        self.coid_index.clear();
        for (key, slot) in &self.slots {
            if slot.order_id != 0 {
                self.order_index.insert(slot.order_id, key.clone());
            }
            if !slot.client_order_id.is_empty() {
                self.coid_index.insert(slot.client_order_id.clone(), key.clone());
            }
        }
    }
}

/// Outcome of one executed action, applied to the preview slot map.
enum ActionResult {
    Canceled {
        slot_key: String,
        result: Result<OrderUpdate, VenueError>,
    },
    Placed {
        slot_key: String,
        result: Result<crate::venue::VenueOrder, VenueError>,
    },
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Per-symbol grid engine.
pub struct Engine {
    symbol: String,
    grid_cfg: GridConfig,
    symbol_info: SymbolInfo,
    state: Mutex<EngineState>,
    is_executing: AtomicBool,
    executor: Arc<OrderExecutor>,
    store: Arc<StateStore>,
    risk: Arc<RiskMonitor>,
    breaker: Arc<CircuitBreaker>,
    regime: Arc<RegimeMonitor>,
    last_funding: RwLock<Option<FundingRate>>,
    last_venue_position: RwLock<Option<PositionUpdate>>,
    margin_health: RwLock<f64>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        grid_cfg: GridConfig,
        symbol_info: SymbolInfo,
        executor: Arc<OrderExecutor>,
        store: Arc<StateStore>,
        risk: Arc<RiskMonitor>,
        breaker: Arc<CircuitBreaker>,
        regime: Arc<RegimeMonitor>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            grid_cfg,
            symbol_info,
            state: Mutex::new(EngineState {
                slots: BTreeMap::new(),
                order_index: HashMap::new(),
                coid_index: HashMap::new(),
                anchor_price: Decimal::ZERO,
                last_price: Decimal::ZERO,
                version: 0,
                risk_was_triggered: false,
            }),
            is_executing: AtomicBool::new(false),
            executor,
            store,
            risk,
            breaker,
            regime,
            last_funding: RwLock::new(None),
            last_venue_position: RwLock::new(None),
            margin_health: RwLock::new(1.0),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn symbol_info(&self) -> &SymbolInfo {
        &self.symbol_info
    }

    // -------------------------------------------------------------------------
    // Recovery
    // -------------------------------------------------------------------------

    /// Restore durable state. Called once before the first handler dispatch;
    /// a checksum failure propagates and must abort startup.
    pub fn recover(&self) -> Result<()> {
        let Some(persisted) = self.store.load_state().context("state recovery failed")? else {
            info!(symbol = %self.symbol, "no persisted state — starting empty");
            return Ok(());
        };

        let mut st = self.state.lock();
        st.version = persisted.version;
        st.last_price = persisted.last_price;
        // Grid lines re-anchor on the last durable price.
        st.anchor_price = round_to_tick(persisted.last_price, self.symbol_info.tick_size);
        st.slots = persisted.slots;
        st.rebuild_indexes();
        info!(
            symbol = %self.symbol,
            version = st.version,
            slots = st.slots.len(),
            last_price = %st.last_price,
            "state restored from store"
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Snapshots (reconciler / RPC surface)
    // -------------------------------------------------------------------------

    /// Deep copy of the slot map.
    pub fn snapshot_slots(&self) -> BTreeMap<String, InventorySlot> {
        self.state.lock().slots.clone()
    }

    pub fn last_price(&self) -> Decimal {
        self.state.lock().last_price
    }

    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    pub fn margin_health(&self) -> f64 {
        *self.margin_health.read()
    }

    /// Signed sum of inventory across filled slots.
    pub fn local_position(&self) -> Decimal {
        self.state
            .lock()
            .slots
            .values()
            .map(|s| s.position_qty)
            .sum()
    }

    /// Whether the engine holds an order with this venue order id.
    pub fn owns_order(&self, order_id: u64) -> bool {
        self.state.lock().order_index.contains_key(&order_id)
    }

    // -------------------------------------------------------------------------
    // Price handler
    // -------------------------------------------------------------------------

    pub async fn on_price_update(&self, update: PriceUpdate, shutdown: &Shutdown) -> Result<()> {
        if shutdown.is_cancelled() {
            return Ok(());
        }
        if self.is_executing.load(Ordering::Acquire) {
            debug!(symbol = %self.symbol, "handler busy — price update skipped");
            return Ok(());
        }

        let price = round_to_tick(update.price, self.symbol_info.tick_size);

        // ── Phase 1: inspect and decide under the engine lock ──────────────
        let plan = {
            let mut st = self.state.lock();
            if st.anchor_price.is_zero() {
                st.anchor_price = price;
                info!(symbol = %self.symbol, anchor = %price, "anchor price set");
            }

            let triggered = self.risk.triggered();
            let target = if triggered {
                if st.risk_was_triggered {
                    st.last_price = price;
                    return Ok(());
                }
                st.risk_was_triggered = true;
                // Freshly triggered: flush the bid side, quote nothing new.
                self.cancel_all_buys_target(&st)
            } else {
                if st.risk_was_triggered {
                    st.risk_was_triggered = false;
                    info!(symbol = %self.symbol, "risk trigger cleared — resuming quoting");
                }
                if self.breaker.is_open(&self.symbol) {
                    st.last_price = price;
                    return Ok(());
                }
                let inputs = GridInputs {
                    current_price: price,
                    anchor_price: st.anchor_price,
                    atr: self.regime.atr(&self.symbol),
                    volatility_factor: 1.0,
                    regime: self.regime.current(&self.symbol),
                    slots: &st.slots,
                    symbol_info: &self.symbol_info,
                };
                compute_grid_target(&self.grid_cfg, &inputs)
            };

            let (actions, removals) = diff_target(&st.slots, &target);
            if actions.is_empty() && removals.is_empty() {
                st.last_price = price;
                return Ok(());
            }

            // Byte-identical restore point for a failed persist.
            let pre_slots = st.slots.clone();

            // Mark Pending and destroy dead slots inside the decision phase.
            let mut working = st.slots.clone();
            for key in &removals {
                working.remove(key);
            }
            for action in &actions {
                if let PlannedAction::Place { slot_key, side, price, .. } = action {
                    let slot = working
                        .entry(slot_key.clone())
                        .or_insert_with(|| InventorySlot::new(*price));
                    if let Err(e) = slot.begin_place(*side) {
                        warn!(symbol = %self.symbol, error = %e, "place skipped — slot not placeable");
                    }
                }
            }
            st.slots = working.clone();
            st.rebuild_indexes();

            self.is_executing.store(true, Ordering::Release);
            (actions, removals, pre_slots, working, price)
        };
        let (actions, _removals, pre_slots, mut working, price) = plan;

        // ── Phase 2: execute without any lock held ──────────────────────────
        let results = self.execute_actions(&actions, &working, shutdown).await;

        // ── Phase 3: persist the preview, then mutate live state ───────────
        let outcome = self
            .apply_results(&mut working, results, price, pre_slots)
            .await;
        self.is_executing.store(false, Ordering::Release);
        outcome
    }

    /// Target that cancels every live BUY (risk trip). Expressed as an empty
    /// order set restricted to sells so the diff cancels the bid side only.
    fn cancel_all_buys_target(&self, st: &EngineState) -> TargetState {
        let mut target = TargetState::empty();
        for (key, slot) in &st.slots {
            if slot.is_locked() && slot.order_side == Side::Sell {
                // Keep resting sells exactly as they are.
                target.orders.push(crate::strategy::TargetOrder {
                    client_order_id: String::new(),
                    slot_key: key.clone(),
                    price: slot.order_price,
                    quantity: slot.order_qty,
                    side: Side::Sell,
                    post_only: true,
                    reduce_only: false,
                });
            }
        }
        target
    }

    async fn execute_actions(
        &self,
        actions: &[PlannedAction],
        working: &BTreeMap<String, InventorySlot>,
        shutdown: &Shutdown,
    ) -> Vec<ActionResult> {
        let mut results = Vec::with_capacity(actions.len());
        for action in actions {
            if shutdown.is_cancelled() {
                break;
            }
            match action {
                PlannedAction::Cancel { slot_key, order_id } => {
                    let result = self
                        .executor
                        .cancel_order(&self.symbol, *order_id, shutdown)
                        .await
                        .map(|order| OrderUpdate {
                            exchange: self.executor.venue().name().to_string(),
                            symbol: order.symbol,
                            order_id: order.order_id,
                            client_order_id: order.client_order_id,
                            side: order.side,
                            price: order.price,
                            status: OrderStatus::Canceled,
                            last_executed_qty: Decimal::ZERO,
                            cum_executed_qty: order.executed_qty,
                            ts_ms: order.update_time_ms,
                        });
                    results.push(ActionResult::Canceled {
                        slot_key: slot_key.clone(),
                        result,
                    });
                }
                PlannedAction::Place {
                    slot_key,
                    side,
                    price,
                    quantity,
                    post_only,
                    reduce_only,
                } => {
                    let failures = working
                        .get(slot_key)
                        .map(|s| s.post_only_failures)
                        .unwrap_or(0);
                    let req = OrderRequest {
                        symbol: self.symbol.clone(),
                        side: *side,
                        order_type: crate::venue::OrderType::Limit,
                        quantity: *quantity,
                        price: Some(*price),
                        time_in_force: crate::venue::TimeInForce::Gtc,
                        post_only: *post_only,
                        reduce_only: *reduce_only,
                        client_order_id: self.executor.next_client_order_id(*price, *side),
                    };
                    let result = self.executor.place_order(req, failures, shutdown).await;
                    results.push(ActionResult::Placed {
                        slot_key: slot_key.clone(),
                        result,
                    });
                }
            }
        }
        results
    }

    /// Fold execution results into the preview map, persist it, and only then
    /// copy it into live state.
    async fn apply_results(
        &self,
        working: &mut BTreeMap<String, InventorySlot>,
        results: Vec<ActionResult>,
        price: Decimal,
        pre_slots: BTreeMap<String, InventorySlot>,
    ) -> Result<()> {
        for result in results {
            match result {
                ActionResult::Canceled { slot_key, result } => {
                    let Some(slot) = working.get_mut(&slot_key) else { continue };
                    match result {
                        Ok(update) => {
                            if let Err(e) =
                                slot.apply_order_update(&update, self.symbol_info.qty_decimals)
                            {
                                warn!(symbol = %self.symbol, error = %e, "cancel result not applicable");
                            }
                        }
                        Err(VenueError::NotFound(_)) => {
                            // Already gone on the venue — same end state.
                            let ghost = OrderUpdate {
                                exchange: self.executor.venue().name().to_string(),
                                symbol: self.symbol.clone(),
                                order_id: slot.order_id,
                                client_order_id: slot.client_order_id.clone(),
                                side: slot.order_side,
                                price: slot.order_price,
                                status: OrderStatus::Canceled,
                                last_executed_qty: Decimal::ZERO,
                                cum_executed_qty: Decimal::ZERO,
                                ts_ms: 0,
                            };
                            let _ = slot.apply_order_update(&ghost, self.symbol_info.qty_decimals);
                        }
                        Err(e) => {
                            warn!(symbol = %self.symbol, slot = %slot_key, error = %e, "cancel failed — slot stays locked");
                        }
                    }
                }
                ActionResult::Placed { slot_key, result } => {
                    let Some(slot) = working.get_mut(&slot_key) else { continue };
                    match result {
                        Ok(order) => {
                            if let Err(e) =
                                slot.apply_place_ack(order.order_id, &order.client_order_id)
                            {
                                warn!(symbol = %self.symbol, error = %e, "place ack not applicable");
                            } else {
                                slot.order_price = order.price;
                                slot.order_qty = order.orig_qty;
                            }
                        }
                        Err(e) => {
                            let would_cross = e.is_post_only_cross();
                            if let Err(apply_err) = slot.apply_place_err() {
                                warn!(symbol = %self.symbol, error = %apply_err, "place error not applicable");
                            } else if would_cross {
                                slot.post_only_failures += 1;
                                debug!(
                                    symbol = %self.symbol,
                                    slot = %slot_key,
                                    failures = slot.post_only_failures,
                                    "post-only would cross"
                                );
                            }
                            if !would_cross {
                                warn!(symbol = %self.symbol, slot = %slot_key, error = %e, "place failed");
                            }
                        }
                    }
                }
            }
        }

        // Actions aborted by cancellation never produced a result; their
        // slots must not persist as Pending. Any venue order that did land
        // becomes a ghost the reconciler cancels.
        for slot in working.values_mut() {
            if slot.slot_status == SlotStatus::Pending {
                let _ = slot.apply_place_err();
            }
        }

        let preview = {
            let st = self.state.lock();
            PersistedState {
                version: st.version + 1,
                symbol: self.symbol.clone(),
                last_price: price,
                last_update_time_ns: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
                slots: working.clone(),
            }
        };

        if let Err(e) = self.store.save_state(&preview) {
            // Persist failed: restore the exact pre-handler snapshot. Venue
            // orders placed this pass become ghosts the reconciler cancels.
            let mut st = self.state.lock();
            st.slots = pre_slots;
            st.rebuild_indexes();
            error!(symbol = %self.symbol, error = %e, "state persist failed — in-memory state restored");
            return Err(e.context("state save failed"));
        }

        let mut st = self.state.lock();
        st.slots = working.clone();
        st.rebuild_indexes();
        st.version = preview.version;
        st.last_price = price;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Order handler
    // -------------------------------------------------------------------------

    pub async fn on_order_update(&self, update: OrderUpdate, shutdown: &Shutdown) -> Result<()> {
        if shutdown.is_cancelled() {
            return Ok(());
        }
        if self.is_executing.load(Ordering::Acquire) {
            debug!(symbol = %self.symbol, order_id = update.order_id, "handler busy — order update deferred to reconciler");
            return Ok(());
        }

        // Build the preview under the lock, but persist outside it.
        let preview = {
            let st = self.state.lock();
            let key = st
                .order_index
                .get(&update.order_id)
                .or_else(|| st.coid_index.get(&update.client_order_id))
                .cloned();
            let Some(key) = key else {
                debug!(
                    symbol = %self.symbol,
                    order_id = update.order_id,
                    "order update for unindexed order — left to the reconciler"
                );
                return Ok(());
            };

            let mut working = st.slots.clone();
            let Some(slot) = working.get_mut(&key) else {
                return Ok(());
            };
            match slot.apply_order_update(&update, self.symbol_info.qty_decimals) {
                Ok(transition) => {
                    debug!(
                        symbol = %self.symbol,
                        slot = %key,
                        transition = ?transition,
                        status = ?update.status,
                        cum = %update.cum_executed_qty,
                        "order update applied"
                    );
                }
                Err(e) => {
                    warn!(symbol = %self.symbol, error = %e, "order update rejected by slot");
                    return Ok(());
                }
            }

            PersistedState {
                version: st.version + 1,
                symbol: self.symbol.clone(),
                last_price: st.last_price,
                last_update_time_ns: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
                slots: working,
            }
        };

        // Persist strictly before mutating live state; a failure leaves the
        // live map untouched by construction.
        self.store
            .save_state(&preview)
            .context("order update persist failed")?;

        let mut st = self.state.lock();
        st.slots = preview.slots;
        st.rebuild_indexes();
        st.version = preview.version;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Remaining handlers
    // -------------------------------------------------------------------------

    pub async fn on_funding_update(&self, update: FundingRate, _shutdown: &Shutdown) -> Result<()> {
        *self.last_funding.write() = Some(update);
        Ok(())
    }

    pub async fn on_position_update(
        &self,
        update: PositionUpdate,
        _shutdown: &Shutdown,
    ) -> Result<()> {
        *self.last_venue_position.write() = Some(update);
        Ok(())
    }

    pub async fn on_account_update(
        &self,
        update: AccountUpdate,
        _shutdown: &Shutdown,
    ) -> Result<()> {
        *self.margin_health.write() = update.margin_health;
        Ok(())
    }

    pub fn last_funding(&self) -> Option<FundingRate> {
        self.last_funding.read().clone()
    }

    // -------------------------------------------------------------------------
    // Force sync (reconciler, divergence < threshold)
    // -------------------------------------------------------------------------

    /// Adopt the venue's position size. The delta lands on the largest filled
    /// slot, or a synthetic slot at the last price when none exists.
    pub fn force_sync(&self, venue_qty: Decimal) -> Result<()> {
        let preview = {
            let st = self.state.lock();
            let local: Decimal = st.slots.values().map(|s| s.position_qty).sum();
            let delta = venue_qty - local;
            if delta.is_zero() {
                return Ok(());
            }

            let mut working = st.slots.clone();
            let key = working
                .iter()
                .filter(|(_, s)| s.position_status == crate::slot::PositionStatus::Filled)
                .max_by_key(|(_, s)| s.position_qty.abs())
                .map(|(k, _)| k.clone())
                .unwrap_or_else(|| {
                    let price = if st.last_price.is_zero() {
                        st.anchor_price
                    } else {
                        st.last_price
                    };
                    let slot = InventorySlot::new(price);
                    let key = slot.key();
                    working.insert(key.clone(), slot);
                    key
                });

            let slot = working.get_mut(&key).expect("sync slot exists");
            slot.position_qty += delta;
            slot.position_status = if slot.position_qty.is_zero() {
                crate::slot::PositionStatus::Empty
            } else {
                crate::slot::PositionStatus::Filled
            };
            info!(
                symbol = %self.symbol,
                venue_qty = %venue_qty,
                local_qty = %local,
                delta = %delta,
                slot = %key,
                "force sync — venue size adopted"
            );

            PersistedState {
                version: st.version + 1,
                symbol: self.symbol.clone(),
                last_price: st.last_price,
                last_update_time_ns: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
                slots: working,
            }
        };

        self.store
            .save_state(&preview)
            .context("force sync persist failed")?;

        let mut st = self.state.lock();
        st.slots = preview.slots;
        st.rebuild_indexes();
        st.version = preview.version;
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("symbol", &self.symbol)
            .field("slots", &self.state.lock().slots.len())
            .field("is_executing", &self.is_executing.load(Ordering::Relaxed))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Build the bounded queues for one engine.
pub fn engine_queues(
    symbol: &str,
    capacity: usize,
) -> (EngineHandle, mpsc::Receiver<EngineEvent>, mpsc::Receiver<EngineEvent>) {
    let (critical_tx, critical_rx) = mpsc::channel(capacity.max(1));
    let (lossy_tx, lossy_rx) = mpsc::channel(capacity.max(1));
    (
        EngineHandle {
            symbol: symbol.to_string(),
            critical_tx,
            lossy_tx,
        },
        critical_rx,
        lossy_rx,
    )
}

/// Drain the engine's queues until shutdown. Critical events win ties.
///
/// A panicking handler is caught, logged, and its event dropped; the engine
/// keeps running.
pub async fn run_event_loop(
    engine: Arc<Engine>,
    mut critical_rx: mpsc::Receiver<EngineEvent>,
    mut lossy_rx: mpsc::Receiver<EngineEvent>,
    shutdown: Shutdown,
) {
    info!(symbol = %engine.symbol(), "engine event loop started");
    let mut sd = shutdown.clone();
    loop {
        let event = tokio::select! {
            biased;
            _ = sd.cancelled() => break,
            event = critical_rx.recv() => event,
            event = lossy_rx.recv() => event,
        };
        let Some(event) = event else { break };
        dispatch_event(&engine, event, &shutdown).await;
    }
    info!(symbol = %engine.symbol(), "engine event loop stopped");
}

async fn dispatch_event(engine: &Arc<Engine>, event: EngineEvent, shutdown: &Shutdown) {
    let label = match &event {
        EngineEvent::Price(_) => "price",
        EngineEvent::Order(_) => "order",
        EngineEvent::Funding(_) => "funding",
        EngineEvent::Position(_) => "position",
        EngineEvent::Account(_) => "account",
    };

    let engine = engine.clone();
    let shutdown = shutdown.clone();
    let fut = async move {
        match event {
            EngineEvent::Price(u) => engine.on_price_update(u, &shutdown).await,
            EngineEvent::Order(u) => engine.on_order_update(u, &shutdown).await,
            EngineEvent::Funding(u) => engine.on_funding_update(u, &shutdown).await,
            EngineEvent::Position(u) => engine.on_position_update(u, &shutdown).await,
            EngineEvent::Account(u) => engine.on_account_update(u, &shutdown).await,
        }
    };

    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(handler = label, error = %e, "handler returned error"),
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic".to_string());
            error!(handler = label, panic = %msg, "handler panicked — event dropped");
        }
    }
}
