// =============================================================================
// Strategy Contract — pure target-state computation
// =============================================================================
//
// A strategy is a pure function from market inputs and a slot snapshot to a
// `TargetState`: the declarative answer to "what should reality look like
// right now?". The engine diffs the target against live slots to derive
// cancels and places; strategies never touch the venue, the store, or any
// lock.
//
// TargetStates are created per tick, consumed once, and never stored.
// =============================================================================

pub mod arbitrage;
pub mod grid;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::Side;

/// Desired signed position on one venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetPosition {
    pub exchange: String,
    pub symbol: String,
    /// Signed size: positive long, negative short. Pre-rounded to step size.
    pub size: Decimal,
}

/// Desired resting order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetOrder {
    /// Filled in by the engine at placement time; strategies leave it empty.
    pub client_order_id: String,
    /// Arena key of the slot this order binds to. For fresh opens this is the
    /// key of `price`; for reduce-only closes it is the filled slot being
    /// closed (whose limit price sits one interval above its grid level).
    pub slot_key: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub side: Side,
    pub post_only: bool,
    pub reduce_only: bool,
}

/// Immutable snapshot of desired positions and orders.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetState {
    pub positions: Vec<TargetPosition>,
    pub orders: Vec<TargetOrder>,
}

impl TargetState {
    /// The empty target: cancel everything cancelable, hold nothing new.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty() && self.orders.is_empty()
    }

    /// Find the target order at `price`, if any.
    pub fn order_at(&self, price: Decimal) -> Option<&TargetOrder> {
        self.orders.iter().find(|o| o.price == price)
    }
}
