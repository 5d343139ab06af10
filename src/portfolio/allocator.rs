// =============================================================================
// Allocator — quality-weighted portfolio weights under symbol and sector caps
// =============================================================================
//
// Normalizes positive quality scores into weights, caps each symbol at
// `max_weight`, caps each sector's cumulative weight at `sector_cap`
// (allocated in descending quality order, so weaker names absorb the
// truncation), and drops anything left at zero.
// =============================================================================

use std::collections::HashMap;

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Scanner output for one tradable opportunity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub symbol: String,
    pub long_venue: String,
    pub short_venue: String,
    /// Raw per-interval funding spread.
    pub spread: f64,
    /// Annualized spread.
    pub spread_apr: f64,
    /// (spot − perp) / spot at scan time.
    pub basis: f64,
    /// Bounded composite in [0, 1].
    pub quality_score: f64,
    pub sector: String,
}

/// One allocation slice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetAllocation {
    pub symbol: String,
    pub weight: f64,
    pub notional: Decimal,
    pub exchange: String,
    pub quality_score: f64,
}

/// Convert opportunities into capped allocations.
pub fn allocate(
    opportunities: &[Opportunity],
    adjusted_equity: Decimal,
    target_leverage: f64,
    max_weight: f64,
    sector_cap: f64,
) -> Vec<TargetAllocation> {
    let positive: Vec<&Opportunity> = opportunities
        .iter()
        .filter(|o| o.quality_score > 0.0)
        .collect();

    let total: f64 = positive.iter().map(|o| o.quality_score).sum();
    if total <= 0.0 {
        return Vec::new();
    }

    // Descending quality so caps truncate the weakest names first.
    let mut ranked = positive;
    ranked.sort_by(|a, b| {
        b.quality_score
            .partial_cmp(&a.quality_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut sector_used: HashMap<&str, f64> = HashMap::new();
    let mut allocations = Vec::new();

    for opp in ranked {
        let mut weight = (opp.quality_score / total).min(max_weight);

        let used = sector_used.entry(opp.sector.as_str()).or_insert(0.0);
        let sector_room = (sector_cap - *used).max(0.0);
        weight = weight.min(sector_room);
        if weight <= 0.0 {
            continue;
        }
        *used += weight;

        let notional = adjusted_equity
            * Decimal::from_f64(target_leverage * weight).unwrap_or_default();
        allocations.push(TargetAllocation {
            symbol: opp.symbol.clone(),
            weight,
            notional,
            exchange: opp.long_venue.clone(),
            quality_score: opp.quality_score,
        });
    }

    allocations
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn opp(symbol: &str, quality: f64, sector: &str) -> Opportunity {
        Opportunity {
            symbol: symbol.into(),
            long_venue: "paper-spot".into(),
            short_venue: "paper-perp".into(),
            spread: 0.0004,
            spread_apr: 0.4,
            basis: 0.0,
            quality_score: quality,
            sector: sector.into(),
        }
    }

    #[test]
    fn caps_per_symbol_and_per_sector() {
        // Three L1 names and one AI name; the L1 sector saturates at 0.30.
        let opportunities = vec![
            opp("BTCUSDT", 0.8, "L1"),
            opp("ETHUSDT", 0.6, "L1"),
            opp("SOLUSDT", 0.4, "L1"),
            opp("TAOUSDT", 0.9, "AI"),
        ];
        let allocations = allocate(&opportunities, dec!(100000), 1.0, 0.25, 0.30);

        let weight = |symbol: &str| {
            allocations
                .iter()
                .find(|a| a.symbol == symbol)
                .map(|a| a.weight)
        };

        // sum = 2.7; raw: TAO 0.333→0.25, BTC 0.296→0.25, ETH 0.222, SOL 0.148.
        // Sector L1: BTC takes 0.25, ETH the remaining 0.05, SOL dropped.
        assert!((weight("TAOUSDT").unwrap() - 0.25).abs() < 1e-9);
        assert!((weight("BTCUSDT").unwrap() - 0.25).abs() < 1e-9);
        assert!((weight("ETHUSDT").unwrap() - 0.05).abs() < 1e-9);
        assert!(weight("SOLUSDT").is_none());
    }

    #[test]
    fn notional_scales_with_equity_and_leverage() {
        let opportunities = vec![opp("BTCUSDT", 1.0, "L1")];
        let allocations = allocate(&opportunities, dec!(100000), 2.0, 0.25, 0.30);
        assert_eq!(allocations.len(), 1);
        // weight capped at 0.25, notional = 100000 * 2.0 * 0.25.
        assert_eq!(allocations[0].notional, dec!(50000.00));
    }

    #[test]
    fn non_positive_scores_dropped() {
        let opportunities = vec![opp("BTCUSDT", 0.0, "L1"), opp("ETHUSDT", -0.5, "L1")];
        assert!(allocate(&opportunities, dec!(100000), 1.0, 0.25, 0.30).is_empty());
    }

    #[test]
    fn empty_input_allocates_nothing() {
        assert!(allocate(&[], dec!(100000), 1.0, 0.25, 0.30).is_empty());
    }
}
