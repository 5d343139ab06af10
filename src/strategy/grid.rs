// =============================================================================
// Grid Strategy — passive limit-order ladder around a snapped center price
// =============================================================================
//
// The grid quotes `buy_window` BUY levels below and (in neutral mode)
// `sell_window` SELL levels above a center price snapped to the anchor-derived
// grid. Filled levels are closed with reduce-only SELLs one interval above
// their entry. The computation is pure: slots in, target out.
//
// Level geometry:
//   interval = max(price_interval, atr * atr_interval_scale)   (dynamic mode)
//   center   = anchor + round((effective - anchor) / interval) * interval
//   effective = current * (1 - inventory * skew_factor)
// =============================================================================

use std::collections::{BTreeMap, HashSet};

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use crate::config::GridConfig;
use crate::monitor::regime::Regime;
use crate::slot::{price_key, InventorySlot, PositionStatus};
use crate::strategy::{TargetOrder, TargetState};
use crate::types::{round_down_to_step, round_to_tick, Side};
use crate::venue::SymbolInfo;

/// Market inputs to one grid evaluation.
#[derive(Debug, Clone, Copy)]
pub struct GridInputs<'a> {
    pub current_price: Decimal,
    /// Reference price fixed at engine init; all grid lines derive from it.
    pub anchor_price: Decimal,
    /// Latest ATR in absolute price units, if enough klines have been seen.
    pub atr: Option<f64>,
    /// Multiplier ≥ 1 widening the grid in turbulent markets.
    pub volatility_factor: f64,
    pub regime: Regime,
    pub slots: &'a BTreeMap<String, InventorySlot>,
    pub symbol_info: &'a SymbolInfo,
}

/// Compute the declarative target for one symbol's grid.
pub fn compute_grid_target(cfg: &GridConfig, inputs: &GridInputs<'_>) -> TargetState {
    let tick = inputs.symbol_info.tick_size;
    let step = inputs.symbol_info.step_size;

    let interval = effective_interval(cfg, inputs.atr, inputs.volatility_factor, tick);
    if interval <= Decimal::ZERO || inputs.current_price <= Decimal::ZERO {
        return TargetState::empty();
    }

    let center = snap_center(cfg, inputs, interval);

    let mut orders: Vec<TargetOrder> = Vec::new();
    let mut taken: HashSet<String> = HashSet::new();

    // --- Reduce-only closes for filled levels --------------------------------
    // Longs close one interval above their level, shorts one interval below.
    // Emitted first so a close always wins a slot-key collision with a fresh
    // open at the same level.
    for slot in inputs.slots.values() {
        if slot.position_status != PositionStatus::Filled || slot.position_qty.is_zero() {
            continue;
        }
        let long = slot.position_qty > Decimal::ZERO;
        let (close_price, close_side) = if long {
            (round_to_tick(slot.price + interval, tick), Side::Sell)
        } else {
            (round_to_tick(slot.price - interval, tick), Side::Buy)
        };
        let qty = slot.position_qty.abs();
        if close_price <= Decimal::ZERO || close_price * qty < cfg.min_order_value {
            continue;
        }
        let key = slot.key();
        if taken.insert(key.clone()) {
            orders.push(TargetOrder {
                client_order_id: String::new(),
                slot_key: key,
                price: close_price,
                quantity: qty,
                side: close_side,
                post_only: true,
                reduce_only: true,
            });
        }
    }

    // --- Fresh BUY levels below center ---------------------------------------
    let quantity = round_down_to_step(cfg.order_quantity, step);
    if inputs.regime != Regime::BearTrend && !quantity.is_zero() {
        for k in 1..=cfg.buy_window {
            let price = round_to_tick(center - Decimal::from(k) * interval, tick);
            if price <= Decimal::ZERO || price * quantity < cfg.min_order_value {
                continue;
            }
            let key = price_key(price);
            if let Some(slot) = inputs.slots.get(&key) {
                // Never re-buy a level that already holds inventory.
                if slot.position_status == PositionStatus::Filled {
                    continue;
                }
            }
            if taken.insert(key.clone()) {
                orders.push(TargetOrder {
                    client_order_id: String::new(),
                    slot_key: key,
                    price,
                    quantity,
                    side: Side::Buy,
                    post_only: true,
                    reduce_only: false,
                });
            }
        }
    }

    // --- Fresh SELL levels above center (neutral grids only) -----------------
    if cfg.is_neutral && inputs.regime != Regime::BullTrend && !quantity.is_zero() {
        for k in 1..=cfg.sell_window {
            let price = round_to_tick(center + Decimal::from(k) * interval, tick);
            if price * quantity < cfg.min_order_value {
                continue;
            }
            let key = price_key(price);
            if let Some(slot) = inputs.slots.get(&key) {
                if slot.position_status == PositionStatus::Filled {
                    continue;
                }
            }
            if taken.insert(key.clone()) {
                orders.push(TargetOrder {
                    client_order_id: String::new(),
                    slot_key: key,
                    price,
                    quantity,
                    side: Side::Sell,
                    post_only: true,
                    reduce_only: false,
                });
            }
        }
    }

    TargetState { positions: Vec::new(), orders }
}

/// Interval after dynamic-ATR widening and the volatility multiplier.
fn effective_interval(
    cfg: &GridConfig,
    atr: Option<f64>,
    volatility_factor: f64,
    tick: Decimal,
) -> Decimal {
    let mut interval = cfg.price_interval;

    if cfg.dynamic_interval {
        if let Some(atr) = atr {
            let scaled = atr * cfg.atr_interval_scale;
            if let Some(candidate) = Decimal::from_f64(scaled) {
                let candidate = round_to_tick(candidate, tick);
                if candidate > interval {
                    interval = candidate;
                }
            }
        }
    }

    if volatility_factor > 1.0 {
        if let Some(mult) = Decimal::from_f64(volatility_factor) {
            interval = round_to_tick(interval * mult, tick);
        }
    }

    interval
}

/// Inventory-skewed center price snapped to the nearest grid line from the
/// anchor.
fn snap_center(cfg: &GridConfig, inputs: &GridInputs<'_>, interval: Decimal) -> Decimal {
    let inventory: Decimal = inputs
        .slots
        .values()
        .filter(|s| s.position_status == PositionStatus::Filled)
        .map(|s| s.position_qty)
        .sum();

    let effective = if cfg.skew_factor.is_zero() || inventory.is_zero() {
        inputs.current_price
    } else {
        inputs.current_price * (Decimal::ONE - inventory * cfg.skew_factor)
    };

    let steps = ((effective - inputs.anchor_price) / interval).round();
    round_to_tick(inputs.anchor_price + steps * interval, inputs.symbol_info.tick_size)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn symbol_info() -> SymbolInfo {
        SymbolInfo {
            symbol: "BTCUSDT".into(),
            base_asset: "BTC".into(),
            quote_asset: "USDT".into(),
            tick_size: dec!(0.01),
            step_size: dec!(0.001),
            price_decimals: 2,
            qty_decimals: 3,
            min_notional: dec!(10),
        }
    }

    fn base_cfg() -> GridConfig {
        let mut cfg = GridConfig::default();
        cfg.price_interval = dec!(10);
        cfg.order_quantity = dec!(0.01);
        cfg.min_order_value = dec!(10);
        cfg.buy_window = 2;
        cfg.sell_window = 2;
        cfg.is_neutral = true;
        cfg
    }

    fn inputs<'a>(
        price: Decimal,
        slots: &'a BTreeMap<String, InventorySlot>,
        info: &'a SymbolInfo,
    ) -> GridInputs<'a> {
        GridInputs {
            current_price: price,
            anchor_price: dec!(45000),
            atr: None,
            volatility_factor: 1.0,
            regime: Regime::Range,
            slots,
            symbol_info: info,
        }
    }

    fn filled_slot(price: Decimal, qty: Decimal) -> InventorySlot {
        let mut slot = InventorySlot::new(price);
        slot.position_status = PositionStatus::Filled;
        slot.position_qty = qty;
        slot
    }

    #[test]
    fn cold_start_quotes_both_windows() {
        let slots = BTreeMap::new();
        let info = symbol_info();
        let target = compute_grid_target(&base_cfg(), &inputs(dec!(45000), &slots, &info));

        let buys: Vec<Decimal> = target
            .orders
            .iter()
            .filter(|o| o.side == Side::Buy)
            .map(|o| o.price)
            .collect();
        let sells: Vec<Decimal> = target
            .orders
            .iter()
            .filter(|o| o.side == Side::Sell)
            .map(|o| o.price)
            .collect();

        assert_eq!(buys, vec![dec!(44990), dec!(44980)]);
        assert_eq!(sells, vec![dec!(45010), dec!(45020)]);
        assert!(target.orders.iter().all(|o| o.quantity == dec!(0.01)));
        assert!(target.orders.iter().all(|o| o.post_only));
        assert!(target.orders.iter().all(|o| !o.reduce_only));
    }

    #[test]
    fn filled_level_gets_reduce_only_close() {
        let mut slots = BTreeMap::new();
        let slot = filled_slot(dec!(44990), dec!(0.01));
        slots.insert(slot.key(), slot);
        let info = symbol_info();
        let target = compute_grid_target(&base_cfg(), &inputs(dec!(45000), &slots, &info));

        let close = target
            .orders
            .iter()
            .find(|o| o.reduce_only)
            .expect("reduce-only close expected");
        assert_eq!(close.price, dec!(45000));
        assert_eq!(close.quantity, dec!(0.01));
        assert_eq!(close.side, Side::Sell);
        assert_eq!(close.slot_key, "44990");

        // The filled level is not re-bought.
        assert!(!target
            .orders
            .iter()
            .any(|o| o.side == Side::Buy && o.price == dec!(44990)));
        // Fresh sells above center are still quoted.
        assert!(target
            .orders
            .iter()
            .any(|o| o.side == Side::Sell && !o.reduce_only && o.price == dec!(45010)));
    }

    #[test]
    fn center_snaps_to_anchor_grid() {
        let slots = BTreeMap::new();
        let info = symbol_info();
        // 45004.2 snaps to 45000, 45006.8 snaps to 45010.
        let t1 = compute_grid_target(&base_cfg(), &inputs(dec!(45004.2), &slots, &info));
        assert!(t1.orders.iter().any(|o| o.price == dec!(44990) && o.side == Side::Buy));
        let t2 = compute_grid_target(&base_cfg(), &inputs(dec!(45006.8), &slots, &info));
        assert!(t2.orders.iter().any(|o| o.price == dec!(45000) && o.side == Side::Buy));
    }

    #[test]
    fn min_order_value_filters_small_orders() {
        let mut cfg = base_cfg();
        cfg.min_order_value = dec!(1000);
        let slots = BTreeMap::new();
        let info = symbol_info();
        // 45000 * 0.01 = 450 < 1000 — everything filtered.
        let target = compute_grid_target(&cfg, &inputs(dec!(45000), &slots, &info));
        assert!(target.orders.is_empty());
    }

    #[test]
    fn directional_grid_emits_no_fresh_sells() {
        let mut cfg = base_cfg();
        cfg.is_neutral = false;
        let mut slots = BTreeMap::new();
        let slot = filled_slot(dec!(44990), dec!(0.01));
        slots.insert(slot.key(), slot);
        let info = symbol_info();
        let target = compute_grid_target(&cfg, &inputs(dec!(45000), &slots, &info));

        let fresh_sells = target
            .orders
            .iter()
            .filter(|o| o.side == Side::Sell && !o.reduce_only)
            .count();
        assert_eq!(fresh_sells, 0);
        // The close is still there.
        assert!(target.orders.iter().any(|o| o.reduce_only));
    }

    #[test]
    fn bull_trend_gates_fresh_sells() {
        let slots = BTreeMap::new();
        let info = symbol_info();
        let mut gi = inputs(dec!(45000), &slots, &info);
        gi.regime = Regime::BullTrend;
        let target = compute_grid_target(&base_cfg(), &gi);
        assert!(target.orders.iter().all(|o| o.side == Side::Buy));
    }

    #[test]
    fn bear_trend_gates_fresh_buys() {
        let slots = BTreeMap::new();
        let info = symbol_info();
        let mut gi = inputs(dec!(45000), &slots, &info);
        gi.regime = Regime::BearTrend;
        let target = compute_grid_target(&base_cfg(), &gi);
        assert!(target.orders.iter().all(|o| o.side == Side::Sell));
    }

    #[test]
    fn dynamic_interval_widens_with_atr() {
        let mut cfg = base_cfg();
        cfg.dynamic_interval = true;
        cfg.atr_interval_scale = 1.5;
        let slots = BTreeMap::new();
        let info = symbol_info();
        let mut gi = inputs(dec!(45000), &slots, &info);
        gi.atr = Some(20.0); // 20 * 1.5 = 30 > base 10
        let target = compute_grid_target(&cfg, &gi);
        let buys: Vec<Decimal> = target
            .orders
            .iter()
            .filter(|o| o.side == Side::Buy)
            .map(|o| o.price)
            .collect();
        assert_eq!(buys, vec![dec!(44970), dec!(44940)]);
    }

    #[test]
    fn inventory_skew_lowers_center() {
        let mut cfg = base_cfg();
        cfg.skew_factor = dec!(0.0001);
        let mut slots = BTreeMap::new();
        // Inventory of 0.5 skews effective price down by 0.005%.
        let slot = filled_slot(dec!(44990), dec!(0.5));
        slots.insert(slot.key(), slot);
        let info = symbol_info();
        let target = compute_grid_target(&cfg, &inputs(dec!(45000), &slots, &info));
        // effective = 45000 * (1 - 0.5 * 0.0001) = 44997.75 → snaps to 45000;
        // with a larger skew the center moves a full line down.
        cfg.skew_factor = dec!(0.001);
        let target2 = compute_grid_target(&cfg, &inputs(dec!(45000), &slots, &info));
        let top_buy_1 = target.orders.iter().filter(|o| o.side == Side::Buy).map(|o| o.price).max();
        let top_buy_2 = target2.orders.iter().filter(|o| o.side == Side::Buy).map(|o| o.price).max();
        assert!(top_buy_2 < top_buy_1);
    }
}
