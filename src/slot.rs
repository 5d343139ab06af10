// =============================================================================
// Inventory Slot — per-price state machine for grid inventory and orders
// =============================================================================
//
// One slot exists per active grid price level. Allowed transitions:
//
//   Free/Empty  ──begin_place(BUY)──▶ Pending/Empty ──ack──▶ Locked/Empty
//                                                   ──err──▶ Free/Empty
//   Locked/Empty  ──fill(BUY)──▶ Free/Filled       (full fill)
//   Locked/Empty  ──fill(BUY)──▶ Locked/Filled     (partial fill)
//   Locked/Empty  ──cancel────▶ Free/Empty
//   Free/Filled ──begin_place(SELL)──▶ Pending/Filled ──ack──▶ Locked/Filled
//   Locked/Filled ──fill(SELL)──▶ Free/Empty        (cumulative qty matches)
//   Locked/Filled ──cancel──▶ Free/Filled
//
// Invariants enforced by every mutator:
//   Locked  ⇒ order_id ≠ 0
//   Free    ⇒ order_id = 0
//   Filled  ⇒ |position_qty| > 0
//   Pending exists only between the decision to place and the applied result.
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::Side;
use crate::venue::{OrderStatus, OrderUpdate};

// ---------------------------------------------------------------------------
// State enums
// ---------------------------------------------------------------------------

/// Whether the slot currently holds inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Empty,
    Filled,
}

/// Lifecycle of the slot's bound order as last reported by the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotOrderStatus {
    NotPlaced,
    Placed,
    PartiallyFilled,
    Filled,
    Canceled,
}

/// Lifecycle of the slot itself with respect to active orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotStatus {
    Free,
    Pending,
    Locked,
}

/// What a successfully applied mutation did, for logging and engine decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotTransition {
    Placed,
    PlaceFailed,
    PartialFill,
    PositionOpened,
    PositionClosed,
    Canceled,
    /// Update referred to a terminal state already applied; nothing changed.
    NoOp,
}

/// Attempted transition not allowed from the slot's current state.
#[derive(Debug, Clone, thiserror::Error)]
#[error("illegal slot transition at {price}: {attempted} from {slot_status:?}/{position_status:?}")]
pub struct SlotError {
    pub price: Decimal,
    pub attempted: &'static str,
    pub slot_status: SlotStatus,
    pub position_status: PositionStatus,
}

// ---------------------------------------------------------------------------
// The slot
// ---------------------------------------------------------------------------

/// One price-level inventory/order record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventorySlot {
    /// Grid price, pre-rounded to the venue tick.
    pub price: Decimal,
    pub position_status: PositionStatus,
    /// Signed inventory at this level (positive = long).
    pub position_qty: Decimal,
    /// Venue order id of the bound order; 0 when no order is bound.
    pub order_id: u64,
    pub client_order_id: String,
    pub order_side: Side,
    /// Limit price of the bound order (a close rests one interval away from
    /// the slot's grid level).
    #[serde(default)]
    pub order_price: Decimal,
    #[serde(default)]
    pub order_qty: Decimal,
    pub order_status: SlotOrderStatus,
    pub slot_status: SlotStatus,
    /// Consecutive "post-only would cross" rejections on this slot.
    pub post_only_failures: u32,
}

impl InventorySlot {
    /// Create a fresh Free/Empty slot at `price`.
    pub fn new(price: Decimal) -> Self {
        Self {
            price,
            position_status: PositionStatus::Empty,
            position_qty: Decimal::ZERO,
            order_id: 0,
            client_order_id: String::new(),
            order_side: Side::Buy,
            order_price: Decimal::ZERO,
            order_qty: Decimal::ZERO,
            order_status: SlotOrderStatus::NotPlaced,
            slot_status: SlotStatus::Free,
            post_only_failures: 0,
        }
    }

    /// Arena key: the normalized price string.
    pub fn key(&self) -> String {
        price_key(self.price)
    }

    fn illegal(&self, attempted: &'static str) -> SlotError {
        SlotError {
            price: self.price,
            attempted,
            slot_status: self.slot_status,
            position_status: self.position_status,
        }
    }

    // -------------------------------------------------------------------------
    // Placement
    // -------------------------------------------------------------------------

    /// Mark the slot Pending ahead of an order placement.
    ///
    /// Only a Free slot may enter Pending. An Empty slot accepts either side
    /// (a neutral grid opens shorts with SELLs); a Filled slot only accepts
    /// the side that reduces its inventory.
    pub fn begin_place(&mut self, side: Side) -> Result<(), SlotError> {
        if self.slot_status != SlotStatus::Free {
            return Err(self.illegal("begin_place"));
        }
        if self.position_status == PositionStatus::Filled {
            let reduces = match side {
                Side::Sell => self.position_qty > Decimal::ZERO,
                Side::Buy => self.position_qty < Decimal::ZERO,
            };
            if !reduces {
                return Err(self.illegal("begin_place"));
            }
        }
        self.slot_status = SlotStatus::Pending;
        self.order_side = side;
        Ok(())
    }

    /// Bind the acknowledged venue order and lock the slot.
    pub fn apply_place_ack(
        &mut self,
        order_id: u64,
        client_order_id: &str,
    ) -> Result<SlotTransition, SlotError> {
        if self.slot_status != SlotStatus::Pending || order_id == 0 {
            return Err(self.illegal("apply_place_ack"));
        }
        self.slot_status = SlotStatus::Locked;
        self.order_id = order_id;
        self.client_order_id = client_order_id.to_string();
        self.order_status = SlotOrderStatus::Placed;
        Ok(SlotTransition::Placed)
    }

    /// The placement failed; release the slot.
    pub fn apply_place_err(&mut self) -> Result<SlotTransition, SlotError> {
        if self.slot_status != SlotStatus::Pending {
            return Err(self.illegal("apply_place_err"));
        }
        self.slot_status = SlotStatus::Free;
        self.order_id = 0;
        self.client_order_id.clear();
        self.order_price = Decimal::ZERO;
        self.order_qty = Decimal::ZERO;
        self.order_status = SlotOrderStatus::NotPlaced;
        Ok(SlotTransition::PlaceFailed)
    }

    // -------------------------------------------------------------------------
    // Order updates
    // -------------------------------------------------------------------------

    /// Apply a venue execution report for the bound order.
    ///
    /// `qty_decimals` defines the close tolerance: a SELL empties the slot
    /// when cumulative executed quantity matches the held position within
    /// `10^-qty_decimals`.
    pub fn apply_order_update(
        &mut self,
        update: &OrderUpdate,
        qty_decimals: u32,
    ) -> Result<SlotTransition, SlotError> {
        if self.slot_status != SlotStatus::Locked || update.order_id != self.order_id {
            return Err(self.illegal("apply_order_update"));
        }

        match update.status {
            OrderStatus::New => Ok(SlotTransition::NoOp),
            OrderStatus::PartiallyFilled => self.apply_partial_fill(update),
            OrderStatus::Filled => self.apply_full_fill(update, qty_decimals),
            OrderStatus::Canceled | OrderStatus::Expired | OrderStatus::Rejected => {
                self.apply_cancel(update.cum_executed_qty, qty_decimals)
            }
        }
    }

    /// Signed executed quantity of the bound order: BUYs add, SELLs subtract.
    fn signed_cum(&self, cum_executed_qty: Decimal) -> Decimal {
        match self.order_side {
            Side::Buy => cum_executed_qty,
            Side::Sell => -cum_executed_qty,
        }
    }

    /// Whether the bound order opens inventory (same sign as the position, or
    /// the slot was empty) rather than reducing it.
    fn order_opens(&self) -> bool {
        match self.order_side {
            Side::Buy => self.position_qty >= Decimal::ZERO,
            Side::Sell => self.position_qty <= Decimal::ZERO,
        }
    }

    fn apply_partial_fill(&mut self, update: &OrderUpdate) -> Result<SlotTransition, SlotError> {
        self.order_status = SlotOrderStatus::PartiallyFilled;
        if self.order_opens() {
            // Inventory accrues immediately; the order stays live until fully
            // filled or canceled. Reducing orders apply on the terminal event.
            self.position_qty = self.signed_cum(update.cum_executed_qty);
            self.position_status = PositionStatus::Filled;
        }
        Ok(SlotTransition::PartialFill)
    }

    fn apply_full_fill(
        &mut self,
        update: &OrderUpdate,
        qty_decimals: u32,
    ) -> Result<SlotTransition, SlotError> {
        if self.order_opens() {
            self.position_qty = self.signed_cum(update.cum_executed_qty);
            self.position_status = PositionStatus::Filled;
            self.release_order(SlotOrderStatus::Filled);
            Ok(SlotTransition::PositionOpened)
        } else {
            let tolerance = close_tolerance(qty_decimals);
            let remaining = self.position_qty + self.signed_cum(update.cum_executed_qty);
            if remaining.abs() <= tolerance {
                self.position_qty = Decimal::ZERO;
                self.position_status = PositionStatus::Empty;
            } else {
                // Venue reported a full fill for less than we hold; keep the
                // residual inventory and let the reconciler converge.
                self.position_qty = remaining;
                self.position_status = PositionStatus::Filled;
            }
            self.release_order(SlotOrderStatus::Filled);
            Ok(SlotTransition::PositionClosed)
        }
    }

    fn apply_cancel(
        &mut self,
        cum_executed_qty: Decimal,
        qty_decimals: u32,
    ) -> Result<SlotTransition, SlotError> {
        if !self.order_opens() && !cum_executed_qty.is_zero() {
            // A canceled partially-filled reducing order leaves residual
            // inventory behind.
            let tolerance = close_tolerance(qty_decimals);
            let remaining = self.position_qty + self.signed_cum(cum_executed_qty);
            if remaining.abs() <= tolerance {
                self.position_qty = Decimal::ZERO;
                self.position_status = PositionStatus::Empty;
            } else {
                self.position_qty = remaining;
            }
        }
        self.release_order(SlotOrderStatus::Canceled);
        Ok(SlotTransition::Canceled)
    }

    fn release_order(&mut self, final_status: SlotOrderStatus) {
        self.slot_status = SlotStatus::Free;
        self.order_id = 0;
        self.client_order_id.clear();
        self.order_price = Decimal::ZERO;
        self.order_qty = Decimal::ZERO;
        self.order_status = final_status;
        self.post_only_failures = 0;
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// A slot may be destroyed only when it is Free and holds no inventory.
    pub fn is_removable(&self) -> bool {
        self.slot_status == SlotStatus::Free && self.position_status == PositionStatus::Empty
    }

    pub fn is_locked(&self) -> bool {
        self.slot_status == SlotStatus::Locked
    }

    pub fn is_partially_filled(&self) -> bool {
        self.order_status == SlotOrderStatus::PartiallyFilled
    }

    /// Verify the structural invariants; used by tests and debug assertions.
    pub fn check_invariants(&self) -> Result<(), SlotError> {
        let ok = match self.slot_status {
            SlotStatus::Locked => self.order_id != 0,
            SlotStatus::Free => self.order_id == 0,
            SlotStatus::Pending => self.order_id == 0,
        };
        let pos_ok = match self.position_status {
            PositionStatus::Filled => !self.position_qty.is_zero(),
            PositionStatus::Empty => self.position_qty.is_zero(),
        };
        if ok && pos_ok {
            Ok(())
        } else {
            Err(self.illegal("check_invariants"))
        }
    }
}

/// Normalize a decimal price into the canonical arena key.
pub fn price_key(price: Decimal) -> String {
    price.normalize().to_string()
}

/// `10^-qty_decimals`, the residual below which a position counts as closed.
pub fn close_tolerance(qty_decimals: u32) -> Decimal {
    Decimal::new(1, qty_decimals)
}
