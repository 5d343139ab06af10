// =============================================================================
// Funding Arbitrage Strategy — delta-neutral two-leg decision table
// =============================================================================
//
// Harvests the funding spread between a spot (or low-funding) leg and a perp
// leg. Entries require both legs' funding observations to be fresh; exits are
// always allowed, since closing risk on stale data beats holding it.
//
// Decision table (first match wins):
//   open ∧ um_health < emergency                    → Exit
//   open ∧ toxic basis on 3 consecutive updates     → ToxicExit
//   open ∧ um_health < warning                      → ReduceExposure (× 0.5)
//   open ∧ apr crossed exit_spread_apr              → Exit
//   ¬open ∧ fresh ∧ apr ≥ +min_spread_apr           → EntryPositive
//   ¬open ∧ fresh ∧ apr ≤ −min_spread_apr           → EntryNegative
//   otherwise                                       → Hold
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::config::ArbitrageConfig;
use crate::strategy::{TargetPosition, TargetState};
use crate::types::round_down_to_step;
use crate::venue::FundingRate;

/// What the decision table chose this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbAction {
    Hold,
    EntryPositive,
    EntryNegative,
    Exit,
    ToxicExit,
    ReduceExposure,
}

impl std::fmt::Display for ArbAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hold => write!(f, "Hold"),
            Self::EntryPositive => write!(f, "EntryPositive"),
            Self::EntryNegative => write!(f, "EntryNegative"),
            Self::Exit => write!(f, "Exit"),
            Self::ToxicExit => write!(f, "ToxicExit"),
            Self::ReduceExposure => write!(f, "ReduceExposure"),
        }
    }
}

/// Market and position inputs to one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct ArbitrageInputs<'a> {
    pub spot_rate: &'a FundingRate,
    pub perp_rate: &'a FundingRate,
    pub now: DateTime<Utc>,
    pub position_open: bool,
    /// True when the open position is long-spot / short-perp.
    pub direction_positive: bool,
    /// Absolute size of the spot leg while open.
    pub current_size: Decimal,
    /// (spot − perp) / spot at this instant.
    pub basis: f64,
    /// Consecutive prior updates whose basis already exceeded the threshold.
    pub basis_streak: u32,
    /// Unified-margin account health in [0, 1].
    pub um_health: f64,
    pub spot_exchange: &'a str,
    pub perp_exchange: &'a str,
    pub symbol: &'a str,
    pub step_size: Decimal,
}

/// Decision plus the target state the engine should converge to.
#[derive(Debug, Clone)]
pub struct ArbDecision {
    pub action: ArbAction,
    pub target: TargetState,
    /// Annualized funding spread used for the decision.
    pub spread_apr: f64,
    /// Whether this update counts toward the toxic-basis streak.
    pub basis_toxic: bool,
}

/// Annualize a per-interval funding rate: `rate · (24 / hours) · 365`.
pub fn annualize_spread(rate: f64, hours_between: f64) -> f64 {
    if hours_between <= 0.0 {
        return 0.0;
    }
    rate * (24.0 / hours_between) * 365.0
}

/// Run the decision table.
pub fn decide(cfg: &ArbitrageConfig, inputs: &ArbitrageInputs<'_>) -> ArbDecision {
    let spread = (inputs.perp_rate.rate - inputs.spot_rate.rate)
        .to_f64()
        .unwrap_or(0.0);
    let spread_apr = annualize_spread(spread, cfg.funding_interval_hours);
    let basis_toxic = inputs.basis.abs() >= cfg.basis_toxic_threshold;

    let decision = |action: ArbAction, target: TargetState| ArbDecision {
        action,
        target,
        spread_apr,
        basis_toxic,
    };

    if inputs.position_open {
        if inputs.um_health < cfg.um_health_emergency {
            return decision(ArbAction::Exit, flat_target(inputs));
        }
        if basis_toxic && inputs.basis_streak + 1 >= 3 {
            return decision(ArbAction::ToxicExit, flat_target(inputs));
        }
        if inputs.um_health < cfg.um_health_warning {
            return decision(ArbAction::ReduceExposure, reduced_target(inputs));
        }
        let crossed = if inputs.direction_positive {
            spread_apr <= cfg.exit_spread_apr
        } else {
            spread_apr >= -cfg.exit_spread_apr
        };
        if crossed {
            return decision(ArbAction::Exit, flat_target(inputs));
        }
        return decision(ArbAction::Hold, TargetState::empty());
    }

    // Entries are gated on freshness of both legs; missing or old data means
    // no new risk.
    let ttl = chrono::Duration::milliseconds(cfg.funding_staleness_ms);
    if !inputs.spot_rate.is_fresh(inputs.now, ttl) || !inputs.perp_rate.is_fresh(inputs.now, ttl) {
        return decision(ArbAction::Hold, TargetState::empty());
    }

    let quantity = round_down_to_step(cfg.order_quantity, inputs.step_size);
    if quantity.is_zero() {
        return decision(ArbAction::Hold, TargetState::empty());
    }

    if spread_apr >= cfg.min_spread_apr {
        return decision(ArbAction::EntryPositive, entry_target(inputs, quantity, true));
    }
    if spread_apr <= -cfg.min_spread_apr {
        return decision(ArbAction::EntryNegative, entry_target(inputs, quantity, false));
    }

    decision(ArbAction::Hold, TargetState::empty())
}

fn entry_target(inputs: &ArbitrageInputs<'_>, quantity: Decimal, positive: bool) -> TargetState {
    let (spot_size, perp_size) = if positive {
        (quantity, -quantity)
    } else {
        (-quantity, quantity)
    };
    TargetState {
        positions: vec![
            TargetPosition {
                exchange: inputs.spot_exchange.to_string(),
                symbol: inputs.symbol.to_string(),
                size: spot_size,
            },
            TargetPosition {
                exchange: inputs.perp_exchange.to_string(),
                symbol: inputs.symbol.to_string(),
                size: perp_size,
            },
        ],
        orders: Vec::new(),
    }
}

fn flat_target(inputs: &ArbitrageInputs<'_>) -> TargetState {
    TargetState {
        positions: vec![
            TargetPosition {
                exchange: inputs.spot_exchange.to_string(),
                symbol: inputs.symbol.to_string(),
                size: Decimal::ZERO,
            },
            TargetPosition {
                exchange: inputs.perp_exchange.to_string(),
                symbol: inputs.symbol.to_string(),
                size: Decimal::ZERO,
            },
        ],
        orders: Vec::new(),
    }
}

fn reduced_target(inputs: &ArbitrageInputs<'_>) -> TargetState {
    let half = round_down_to_step(
        inputs.current_size * rust_decimal_macros::dec!(0.5),
        inputs.step_size,
    );
    let (spot_size, perp_size) = if inputs.direction_positive {
        (half, -half)
    } else {
        (-half, half)
    };
    TargetState {
        positions: vec![
            TargetPosition {
                exchange: inputs.spot_exchange.to_string(),
                symbol: inputs.symbol.to_string(),
                size: spot_size,
            },
            TargetPosition {
                exchange: inputs.perp_exchange.to_string(),
                symbol: inputs.symbol.to_string(),
                size: perp_size,
            },
        ],
        orders: Vec::new(),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn rate(exchange: &str, rate: Decimal, age_ms: i64, now: DateTime<Utc>) -> FundingRate {
        FundingRate {
            exchange: exchange.into(),
            symbol: "BTCUSDT".into(),
            rate,
            predicted_rate: rate,
            next_funding_time_ms: 0,
            observed_at: now - chrono::Duration::milliseconds(age_ms),
        }
    }

    fn inputs<'a>(
        spot: &'a FundingRate,
        perp: &'a FundingRate,
        now: DateTime<Utc>,
    ) -> ArbitrageInputs<'a> {
        ArbitrageInputs {
            spot_rate: spot,
            perp_rate: perp,
            now,
            position_open: false,
            direction_positive: true,
            current_size: Decimal::ZERO,
            basis: 0.0,
            basis_streak: 0,
            um_health: 1.0,
            spot_exchange: "paper-spot",
            perp_exchange: "paper-perp",
            symbol: "BTCUSDT",
            step_size: dec!(0.001),
        }
    }

    #[test]
    fn annualize_eight_hour_cadence() {
        // 0.0005 every 8h → 0.0005 * 3 * 365 = 0.5475
        let apr = annualize_spread(0.0005, 8.0);
        assert!((apr - 0.5475).abs() < 1e-12);
        assert_eq!(annualize_spread(0.1, 0.0), 0.0);
    }

    #[test]
    fn positive_spread_enters_long_spot_short_perp() {
        let now = Utc::now();
        let spot = rate("paper-spot", dec!(0), 10, now);
        let perp = rate("paper-perp", dec!(0.0005), 10, now);
        let cfg = ArbitrageConfig::default();

        let d = decide(&cfg, &inputs(&spot, &perp, now));
        assert_eq!(d.action, ArbAction::EntryPositive);
        assert!((d.spread_apr - 0.5475).abs() < 1e-12);

        let spot_leg = d.target.positions.iter().find(|p| p.exchange == "paper-spot").unwrap();
        let perp_leg = d.target.positions.iter().find(|p| p.exchange == "paper-perp").unwrap();
        assert_eq!(spot_leg.size, dec!(1.0));
        assert_eq!(perp_leg.size, dec!(-1.0));
    }

    #[test]
    fn negative_spread_enters_short_spot_long_perp() {
        let now = Utc::now();
        let spot = rate("paper-spot", dec!(0.0005), 10, now);
        let perp = rate("paper-perp", dec!(0), 10, now);
        let cfg = ArbitrageConfig::default();

        let d = decide(&cfg, &inputs(&spot, &perp, now));
        assert_eq!(d.action, ArbAction::EntryNegative);
        let spot_leg = d.target.positions.iter().find(|p| p.exchange == "paper-spot").unwrap();
        assert_eq!(spot_leg.size, dec!(-1.0));
    }

    #[test]
    fn stale_rates_block_entry() {
        let now = Utc::now();
        let mut cfg = ArbitrageConfig::default();
        cfg.funding_staleness_ms = 100;
        // Both observations are 200 ms old with a 100 ms ttl.
        let spot = rate("paper-spot", dec!(0), 200, now);
        let perp = rate("paper-perp", dec!(0.0005), 200, now);

        let d = decide(&cfg, &inputs(&spot, &perp, now));
        assert_eq!(d.action, ArbAction::Hold);
        assert!(d.target.is_empty());
    }

    #[test]
    fn one_stale_leg_also_blocks_entry() {
        let now = Utc::now();
        let mut cfg = ArbitrageConfig::default();
        cfg.funding_staleness_ms = 100;
        let spot = rate("paper-spot", dec!(0), 10, now);
        let perp = rate("paper-perp", dec!(0.0005), 200, now);

        let d = decide(&cfg, &inputs(&spot, &perp, now));
        assert_eq!(d.action, ArbAction::Hold);
    }

    #[test]
    fn small_spread_holds() {
        let now = Utc::now();
        let spot = rate("paper-spot", dec!(0), 10, now);
        let perp = rate("paper-perp", dec!(0.00001), 10, now);
        let cfg = ArbitrageConfig::default();

        let d = decide(&cfg, &inputs(&spot, &perp, now));
        assert_eq!(d.action, ArbAction::Hold);
    }

    #[test]
    fn apr_crossing_exit_threshold_closes() {
        let now = Utc::now();
        // Spread collapsed to near zero while a positive position is open.
        let spot = rate("paper-spot", dec!(0), 10, now);
        let perp = rate("paper-perp", dec!(0.00001), 10, now);
        let cfg = ArbitrageConfig::default();

        let mut i = inputs(&spot, &perp, now);
        i.position_open = true;
        i.current_size = dec!(1.0);

        let d = decide(&cfg, &i);
        assert_eq!(d.action, ArbAction::Exit);
        assert!(d.target.positions.iter().all(|p| p.size.is_zero()));
    }

    #[test]
    fn toxic_basis_fires_on_third_consecutive_update() {
        let now = Utc::now();
        let spot = rate("paper-spot", dec!(0), 10, now);
        let perp = rate("paper-perp", dec!(0.0005), 10, now);
        let cfg = ArbitrageConfig::default();

        let mut i = inputs(&spot, &perp, now);
        i.position_open = true;
        i.current_size = dec!(1.0);
        i.basis = 0.01; // over the 0.005 threshold

        i.basis_streak = 0;
        let d = decide(&cfg, &i);
        assert_ne!(d.action, ArbAction::ToxicExit);
        assert!(d.basis_toxic);

        i.basis_streak = 2;
        let d = decide(&cfg, &i);
        assert_eq!(d.action, ArbAction::ToxicExit);
        assert!(d.target.positions.iter().all(|p| p.size.is_zero()));
    }

    #[test]
    fn um_health_emergency_exits() {
        let now = Utc::now();
        let spot = rate("paper-spot", dec!(0), 10, now);
        let perp = rate("paper-perp", dec!(0.0005), 10, now);
        let cfg = ArbitrageConfig::default();

        let mut i = inputs(&spot, &perp, now);
        i.position_open = true;
        i.current_size = dec!(1.0);
        i.um_health = 0.2; // below emergency 0.3

        let d = decide(&cfg, &i);
        assert_eq!(d.action, ArbAction::Exit);
    }

    #[test]
    fn um_health_warning_halves_exposure() {
        let now = Utc::now();
        let spot = rate("paper-spot", dec!(0), 10, now);
        let perp = rate("paper-perp", dec!(0.0005), 10, now);
        let cfg = ArbitrageConfig::default();

        let mut i = inputs(&spot, &perp, now);
        i.position_open = true;
        i.current_size = dec!(1.0);
        i.um_health = 0.4; // below warning 0.5, above emergency

        let d = decide(&cfg, &i);
        assert_eq!(d.action, ArbAction::ReduceExposure);
        let spot_leg = d.target.positions.iter().find(|p| p.exchange == "paper-spot").unwrap();
        let perp_leg = d.target.positions.iter().find(|p| p.exchange == "paper-perp").unwrap();
        assert_eq!(spot_leg.size, dec!(0.5));
        assert_eq!(perp_leg.size, dec!(-0.5));
    }

    #[test]
    fn exits_allowed_on_stale_data() {
        let now = Utc::now();
        let mut cfg = ArbitrageConfig::default();
        cfg.funding_staleness_ms = 100;
        let spot = rate("paper-spot", dec!(0), 500, now);
        let perp = rate("paper-perp", dec!(0.00001), 500, now);

        let mut i = inputs(&spot, &perp, now);
        i.position_open = true;
        i.current_size = dec!(1.0);

        let d = decide(&cfg, &i);
        assert_eq!(d.action, ArbAction::Exit);
    }
}
