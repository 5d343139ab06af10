// =============================================================================
// Regime Monitor — RSI/ATR based trend classification per symbol
// =============================================================================
//
// Maintains a rolling kline window per symbol, recomputing RSI(14) and
// ATR(14) on every closed bar.
//
// Classification:
//   RSI > 70  → BULL_TREND   (grid emits no fresh SELL-opens)
//   RSI < 30  → BEAR_TREND   (grid emits no fresh BUY-opens)
//   otherwise → RANGE
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::indicators::{atr, rsi};
use crate::venue::Kline;

/// Indicator look-back period for both RSI and ATR.
const INDICATOR_PERIOD: usize = 14;
/// Klines retained per symbol.
const WINDOW: usize = 200;

const RSI_BULL: f64 = 70.0;
const RSI_BEAR: f64 = 30.0;

/// High-level market regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regime {
    Range,
    BullTrend,
    BearTrend,
}

impl Default for Regime {
    fn default() -> Self {
        Self::Range
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Range => write!(f, "RANGE"),
            Self::BullTrend => write!(f, "BULL_TREND"),
            Self::BearTrend => write!(f, "BEAR_TREND"),
        }
    }
}

/// Snapshot of the classification and its inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeSnapshot {
    pub symbol: String,
    pub regime: Regime,
    pub rsi: f64,
    pub atr: f64,
}

struct SymbolState {
    klines: VecDeque<Kline>,
    snapshot: Option<RegimeSnapshot>,
}

/// Thread-safe per-symbol regime classifier fed from kline streams.
pub struct RegimeMonitor {
    state: RwLock<HashMap<String, SymbolState>>,
}

impl RegimeMonitor {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Ingest
    // -------------------------------------------------------------------------

    /// Feed one kline; open bars are ignored, closed bars update the window
    /// and re-run classification.
    pub fn on_kline(&self, kline: Kline) {
        if !kline.is_closed {
            return;
        }

        let mut state = self.state.write();
        let entry = state.entry(kline.symbol.clone()).or_insert_with(|| SymbolState {
            klines: VecDeque::with_capacity(WINDOW),
            snapshot: None,
        });

        if entry.klines.len() == WINDOW {
            entry.klines.pop_front();
        }
        entry.klines.push_back(kline.clone());

        let window: Vec<Kline> = entry.klines.iter().cloned().collect();
        let closes: Vec<f64> = window.iter().map(|k| k.close).collect();

        let (Some(rsi_value), Some(atr_value)) =
            (rsi(&closes, INDICATOR_PERIOD), atr(&window, INDICATOR_PERIOD))
        else {
            return;
        };

        let regime = classify(rsi_value);
        if entry.snapshot.as_ref().map(|s| s.regime) != Some(regime) {
            debug!(symbol = %kline.symbol, regime = %regime, rsi = rsi_value, "regime changed");
        }
        entry.snapshot = Some(RegimeSnapshot {
            symbol: kline.symbol,
            regime,
            rsi: rsi_value,
            atr: atr_value,
        });
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Current regime; defaults to RANGE before enough data has been seen.
    pub fn current(&self, symbol: &str) -> Regime {
        self.state
            .read()
            .get(symbol)
            .and_then(|s| s.snapshot.as_ref())
            .map(|s| s.regime)
            .unwrap_or_default()
    }

    /// Latest ATR in absolute price units, if computed.
    pub fn atr(&self, symbol: &str) -> Option<f64> {
        self.state
            .read()
            .get(symbol)
            .and_then(|s| s.snapshot.as_ref())
            .map(|s| s.atr)
    }

    pub fn snapshot(&self, symbol: &str) -> Option<RegimeSnapshot> {
        self.state
            .read()
            .get(symbol)
            .and_then(|s| s.snapshot.clone())
    }

    /// Snapshots for every tracked symbol.
    pub fn snapshots(&self) -> Vec<RegimeSnapshot> {
        self.state
            .read()
            .values()
            .filter_map(|s| s.snapshot.clone())
            .collect()
    }
}

impl Default for RegimeMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn classify(rsi_value: f64) -> Regime {
    if rsi_value > RSI_BULL {
        Regime::BullTrend
    } else if rsi_value < RSI_BEAR {
        Regime::BearTrend
    } else {
        Regime::Range
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn kline(symbol: &str, close: f64, closed: bool) -> Kline {
        Kline {
            symbol: symbol.into(),
            open_time_ms: 0,
            close_time_ms: 0,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
            is_closed: closed,
        }
    }

    #[test]
    fn classify_thresholds() {
        assert_eq!(classify(75.0), Regime::BullTrend);
        assert_eq!(classify(25.0), Regime::BearTrend);
        assert_eq!(classify(50.0), Regime::Range);
        assert_eq!(classify(70.0), Regime::Range);
        assert_eq!(classify(30.0), Regime::Range);
    }

    #[test]
    fn defaults_to_range_without_data() {
        let monitor = RegimeMonitor::new();
        assert_eq!(monitor.current("BTCUSDT"), Regime::Range);
        assert!(monitor.atr("BTCUSDT").is_none());
    }

    #[test]
    fn open_bars_are_ignored() {
        let monitor = RegimeMonitor::new();
        for i in 0..50 {
            monitor.on_kline(kline("BTCUSDT", 100.0 + i as f64, false));
        }
        assert!(monitor.snapshot("BTCUSDT").is_none());
    }

    #[test]
    fn monotonic_rally_classifies_bull() {
        let monitor = RegimeMonitor::new();
        for i in 0..40 {
            monitor.on_kline(kline("BTCUSDT", 100.0 + i as f64 * 2.0, true));
        }
        assert_eq!(monitor.current("BTCUSDT"), Regime::BullTrend);
        assert!(monitor.atr("BTCUSDT").unwrap() > 0.0);
    }

    #[test]
    fn monotonic_selloff_classifies_bear() {
        let monitor = RegimeMonitor::new();
        for i in 0..40 {
            monitor.on_kline(kline("BTCUSDT", 200.0 - i as f64 * 2.0, true));
        }
        assert_eq!(monitor.current("BTCUSDT"), Regime::BearTrend);
    }

    #[test]
    fn flat_market_classifies_range() {
        let monitor = RegimeMonitor::new();
        for _ in 0..40 {
            monitor.on_kline(kline("BTCUSDT", 100.0, true));
        }
        assert_eq!(monitor.current("BTCUSDT"), Regime::Range);
    }

    #[test]
    fn symbols_tracked_independently() {
        let monitor = RegimeMonitor::new();
        for i in 0..40 {
            monitor.on_kline(kline("BTCUSDT", 100.0 + i as f64 * 2.0, true));
            monitor.on_kline(kline("ETHUSDT", 200.0 - i as f64 * 2.0, true));
        }
        assert_eq!(monitor.current("BTCUSDT"), Regime::BullTrend);
        assert_eq!(monitor.current("ETHUSDT"), Regime::BearTrend);
        assert_eq!(monitor.snapshots().len(), 2);
    }
}
