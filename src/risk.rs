// =============================================================================
// Risk Monitor & Circuit Breaker — volume spike detection and per-symbol latch
// =============================================================================
//
// The risk monitor consumes kline streams for a configured symbol set and
// keeps a rolling volume average per symbol. The global `triggered` flag
// flips when volume exceeds `multiplier * average` under the configured
// policy:
//   Any — a single spiking symbol suffices.
//   All — the spiking fraction must reach `recovery_threshold` (majority).
// Clearing requires the policy condition to reverse. While triggered, engines
// cancel all BUYs and halt new entries.
//
// The circuit breaker is a per-symbol latch: once opened it blocks all
// strategy output for that symbol until an operator resets it. Trip sources:
// large position divergence, two-leg compensation failure, repeated venue
// auth failures.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{RiskConfig, TriggerPolicy};
use crate::venue::Kline;

/// Samples required before a symbol's average is considered meaningful.
const MIN_SAMPLES: usize = 5;

struct VolumeState {
    window: VecDeque<f64>,
    spiking: bool,
}

/// Snapshot of one symbol's volume state for the RPC surface.
#[derive(Debug, Clone, Serialize)]
pub struct VolumeSnapshot {
    pub symbol: String,
    pub last_volume: f64,
    pub average_volume: f64,
    pub spiking: bool,
}

// ---------------------------------------------------------------------------
// Risk monitor
// ---------------------------------------------------------------------------

/// Volume-spike monitor driving the global triggered flag.
pub struct RiskMonitor {
    cfg: RiskConfig,
    state: RwLock<HashMap<String, VolumeState>>,
    triggered: AtomicBool,
}

impl RiskMonitor {
    pub fn new(cfg: RiskConfig) -> Self {
        Self {
            cfg,
            state: RwLock::new(HashMap::new()),
            triggered: AtomicBool::new(false),
        }
    }

    /// Feed one kline. Open bars are ignored; closed bars update the rolling
    /// window and re-evaluate the trigger policy.
    pub fn on_kline(&self, kline: &Kline) {
        if !kline.is_closed {
            return;
        }
        if !self.cfg.symbols.is_empty() && !self.cfg.symbols.contains(&kline.symbol) {
            return;
        }

        let mut state = self.state.write();
        let entry = state
            .entry(kline.symbol.clone())
            .or_insert_with(|| VolumeState {
                window: VecDeque::with_capacity(self.cfg.volume_window),
                spiking: false,
            });

        let average = if entry.window.len() >= MIN_SAMPLES {
            entry.window.iter().sum::<f64>() / entry.window.len() as f64
        } else {
            0.0
        };
        entry.spiking = average > 0.0 && kline.volume > self.cfg.volume_multiplier * average;

        if entry.window.len() == self.cfg.volume_window.max(1) {
            entry.window.pop_front();
        }
        entry.window.push_back(kline.volume);

        let spiking_count = state.values().filter(|s| s.spiking).count();
        let tracked = state.len().max(1);
        drop(state);

        let now_triggered = match self.cfg.policy {
            TriggerPolicy::Any => spiking_count > 0,
            TriggerPolicy::All => {
                spiking_count as f64 / tracked as f64 >= self.cfg.recovery_threshold
            }
        };

        let was = self.triggered.swap(now_triggered, Ordering::SeqCst);
        if now_triggered && !was {
            warn!(
                symbol = %kline.symbol,
                volume = kline.volume,
                spiking = spiking_count,
                "risk monitor TRIGGERED — volume spike"
            );
        } else if !now_triggered && was {
            info!("risk monitor cleared — volume back under threshold");
        }
    }

    /// Whether the engine should be cancelling BUYs and halting entries.
    pub fn triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Per-symbol volume snapshots for the RPC surface.
    pub fn snapshots(&self) -> Vec<VolumeSnapshot> {
        self.state
            .read()
            .iter()
            .map(|(symbol, s)| VolumeSnapshot {
                symbol: symbol.clone(),
                last_volume: s.window.back().copied().unwrap_or(0.0),
                average_volume: if s.window.is_empty() {
                    0.0
                } else {
                    s.window.iter().sum::<f64>() / s.window.len() as f64
                },
                spiking: s.spiking,
            })
            .collect()
    }
}

impl std::fmt::Debug for RiskMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskMonitor")
            .field("triggered", &self.triggered())
            .field("tracked", &self.state.read().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// Per-symbol latch suppressing all strategy output until reset.
pub struct CircuitBreaker {
    open: RwLock<HashMap<String, String>>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            open: RwLock::new(HashMap::new()),
        }
    }

    /// Latch the breaker for `symbol`. Idempotent; the first reason wins.
    pub fn open(&self, symbol: &str, reason: &str) {
        let mut open = self.open.write();
        if !open.contains_key(symbol) {
            warn!(symbol, reason, "circuit breaker OPEN");
            open.insert(symbol.to_string(), reason.to_string());
        }
    }

    pub fn is_open(&self, symbol: &str) -> bool {
        self.open.read().contains_key(symbol)
    }

    pub fn reason(&self, symbol: &str) -> Option<String> {
        self.open.read().get(symbol).cloned()
    }

    /// Operator action: close the breaker and resume strategy output.
    pub fn reset(&self, symbol: &str) -> bool {
        let removed = self.open.write().remove(symbol).is_some();
        if removed {
            info!(symbol, "circuit breaker reset");
        }
        removed
    }

    /// All open breakers as (symbol, reason) pairs.
    pub fn open_symbols(&self) -> Vec<(String, String)> {
        self.open
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("open", &self.open.read().len())
            .finish()
    }
}
