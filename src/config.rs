// =============================================================================
// Runtime Configuration — Hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Meridian engine. Every tunable parameter
// lives here so the engine can be reconfigured without a rebuild.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry serde defaults so that adding new fields never
// breaks loading an older config file. Venue credentials are `Secret`-typed
// and therefore render as "[REDACTED]" in any serialized form — keys are only
// ever read from the environment, never from the config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{AccountMode, TradingMode};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_price_interval() -> Decimal {
    dec!(10)
}

fn default_order_quantity() -> Decimal {
    dec!(0.01)
}

fn default_min_order_value() -> Decimal {
    dec!(10)
}

fn default_window() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

fn default_atr_interval_scale() -> f64 {
    1.5
}

fn default_arb_quantity() -> Decimal {
    dec!(1.0)
}

fn default_min_spread_apr() -> f64 {
    0.10
}

fn default_exit_spread_apr() -> f64 {
    0.02
}

fn default_funding_staleness_ms() -> i64 {
    60_000
}

fn default_funding_interval_hours() -> f64 {
    8.0
}

fn default_basis_toxic_threshold() -> f64 {
    0.005
}

fn default_um_health_warning() -> f64 {
    0.5
}

fn default_um_health_emergency() -> f64 {
    0.3
}

fn default_orders_per_sec() -> u32 {
    25
}

fn default_order_burst() -> u32 {
    30
}

fn default_retry_initial_ms() -> u64 {
    100
}

fn default_retry_cap_ms() -> u64 {
    2_000
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_margin_lock_secs() -> u64 {
    30
}

fn default_cancel_chunk_size() -> usize {
    20
}

fn default_max_client_order_id_len() -> usize {
    36
}

fn default_reconcile_interval_secs() -> u64 {
    300
}

fn default_cleaner_interval_secs() -> u64 {
    60
}

fn default_open_order_threshold() -> usize {
    40
}

fn default_cleaner_batch_size() -> usize {
    10
}

fn default_divergence_pct() -> f64 {
    5.0
}

fn default_portfolio_interval_secs() -> u64 {
    900
}

fn default_max_weight() -> f64 {
    0.25
}

fn default_sector_cap() -> f64 {
    0.30
}

fn default_target_leverage() -> f64 {
    1.0
}

fn default_rebalance_threshold_pct() -> f64 {
    5.0
}

fn default_round_trip_cost() -> f64 {
    0.001
}

fn default_hysteresis_mult() -> f64 {
    2.0
}

fn default_scanner_workers() -> usize {
    4
}

fn default_min_margin_health() -> f64 {
    0.7
}

fn default_margin_wait_secs() -> u64 {
    30
}

fn default_max_concurrent_actions() -> usize {
    5
}

fn default_volume_multiplier() -> f64 {
    3.0
}

fn default_volume_window() -> usize {
    20
}

fn default_recovery_threshold() -> f64 {
    0.5
}

fn default_event_queue_capacity() -> usize {
    128
}

fn default_state_dir() -> String {
    "state".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_network_deadline_secs() -> u64 {
    30
}

// =============================================================================
// Per-subsystem parameter blocks
// =============================================================================

/// Grid strategy parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Base spacing between grid lines (quote currency).
    #[serde(default = "default_price_interval")]
    pub price_interval: Decimal,

    /// Quantity quoted at each grid level (base currency).
    #[serde(default = "default_order_quantity")]
    pub order_quantity: Decimal,

    /// Orders with notional below this are filtered out.
    #[serde(default = "default_min_order_value")]
    pub min_order_value: Decimal,

    /// Number of BUY levels quoted below the center.
    #[serde(default = "default_window")]
    pub buy_window: u32,

    /// Number of SELL levels quoted above the center.
    #[serde(default = "default_window")]
    pub sell_window: u32,

    /// Neutral grids quote both sides; directional grids only close
    /// inventory with reduce-only sells.
    #[serde(default = "default_true")]
    pub is_neutral: bool,

    /// When set, interval = max(price_interval, atr * atr_interval_scale).
    #[serde(default)]
    pub dynamic_interval: bool,

    #[serde(default = "default_atr_interval_scale")]
    pub atr_interval_scale: f64,

    /// Inventory skew: effective center = price * (1 - inventory * skew).
    #[serde(default)]
    pub skew_factor: Decimal,
}

impl Default for GridConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("grid defaults")
    }
}

/// Funding-arbitrage strategy parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageConfig {
    /// Base quantity for the spot leg.
    #[serde(default = "default_arb_quantity")]
    pub order_quantity: Decimal,

    /// Minimum annualized funding spread to open a position.
    #[serde(default = "default_min_spread_apr")]
    pub min_spread_apr: f64,

    /// Annualized spread under which an open position is exited.
    #[serde(default = "default_exit_spread_apr")]
    pub exit_spread_apr: f64,

    /// Max age of a cached funding rate before it is unusable.
    #[serde(default = "default_funding_staleness_ms")]
    pub funding_staleness_ms: i64,

    /// Hours between funding events on the perp leg.
    #[serde(default = "default_funding_interval_hours")]
    pub funding_interval_hours: f64,

    /// |basis| beyond which an update counts toward a toxic exit.
    #[serde(default = "default_basis_toxic_threshold")]
    pub basis_toxic_threshold: f64,

    /// UM health below which exposure is halved.
    #[serde(default = "default_um_health_warning")]
    pub um_health_warning: f64,

    /// UM health below which the position is exited outright.
    #[serde(default = "default_um_health_emergency")]
    pub um_health_emergency: f64,
}

impl Default for ArbitrageConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("arbitrage defaults")
    }
}

/// Order executor parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_orders_per_sec")]
    pub orders_per_sec: u32,

    #[serde(default = "default_order_burst")]
    pub order_burst: u32,

    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,

    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,

    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    /// How long "insufficient margin" blocks all new placements.
    #[serde(default = "default_margin_lock_secs")]
    pub margin_lock_secs: u64,

    /// Venue batch-cancel chunk size.
    #[serde(default = "default_cancel_chunk_size")]
    pub cancel_chunk_size: usize,

    /// Optional broker prefix prepended to client order ids.
    #[serde(default)]
    pub broker_prefix: String,

    /// Venue cap on client order id length.
    #[serde(default = "default_max_client_order_id_len")]
    pub max_client_order_id_len: usize,

    /// Per-call network deadline.
    #[serde(default = "default_network_deadline_secs")]
    pub network_deadline_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("executor defaults")
    }
}

/// Reconciler and order-cleaner parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_cleaner_interval_secs")]
    pub cleaner_interval_secs: u64,

    /// Open-order count at which the cleaner starts pruning.
    #[serde(default = "default_open_order_threshold")]
    pub open_order_threshold: usize,

    /// How many orders one cleaner pass cancels.
    #[serde(default = "default_cleaner_batch_size")]
    pub cleaner_batch_size: usize,

    /// Position divergence (percent) at which the circuit breaker trips
    /// instead of force-syncing.
    #[serde(default = "default_divergence_pct")]
    pub divergence_pct: f64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("reconciler defaults")
    }
}

/// Portfolio controller parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioConfig {
    #[serde(default = "default_portfolio_interval_secs")]
    pub interval_secs: u64,

    /// Per-symbol weight cap.
    #[serde(default = "default_max_weight")]
    pub max_weight: f64,

    /// Per-sector cumulative weight cap.
    #[serde(default = "default_sector_cap")]
    pub sector_cap: f64,

    #[serde(default = "default_target_leverage")]
    pub target_leverage: f64,

    /// Relative rebalance hysteresis (percent).
    #[serde(default = "default_rebalance_threshold_pct")]
    pub rebalance_threshold_pct: f64,

    /// Estimated round-trip cost fraction used by the hysteresis rule.
    #[serde(default = "default_round_trip_cost")]
    pub round_trip_cost: f64,

    #[serde(default = "default_hysteresis_mult")]
    pub hysteresis_mult: f64,

    /// Persistent scanner worker-pool size.
    #[serde(default = "default_scanner_workers")]
    pub scanner_workers: usize,

    /// Margin health required before expand/add actions run.
    #[serde(default = "default_min_margin_health")]
    pub min_margin_health: f64,

    #[serde(default = "default_margin_wait_secs")]
    pub margin_wait_secs: u64,

    /// Bounded concurrency within one action batch.
    #[serde(default = "default_max_concurrent_actions")]
    pub max_concurrent_actions: usize,

    /// Symbol → sector labels used by the sector cap (unlisted symbols fall
    /// into "UNKNOWN").
    #[serde(default)]
    pub sectors: std::collections::HashMap<String, String>,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("portfolio defaults")
    }
}

/// Trigger policy for the volume risk monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerPolicy {
    /// One symbol over threshold suffices.
    Any,
    /// A majority (per recovery_threshold) must be over threshold.
    All,
}

impl Default for TriggerPolicy {
    fn default() -> Self {
        Self::Any
    }
}

/// Risk monitor parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Symbols whose volume is monitored (defaults to the trading set).
    #[serde(default)]
    pub symbols: Vec<String>,

    /// Volume must exceed multiplier * rolling average to count as a spike.
    #[serde(default = "default_volume_multiplier")]
    pub volume_multiplier: f64,

    /// Rolling average window (klines).
    #[serde(default = "default_volume_window")]
    pub volume_window: usize,

    #[serde(default)]
    pub policy: TriggerPolicy,

    /// Fraction of symbols required for the All policy (majority).
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("risk defaults")
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Meridian engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields still deserialize correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Operational modes ---------------------------------------------------

    #[serde(default)]
    pub trading_mode: TradingMode,

    #[serde(default)]
    pub account_mode: AccountMode,

    // --- Symbols -------------------------------------------------------------

    /// Symbols the engine is quoting.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    // --- Subsystems ----------------------------------------------------------

    #[serde(default)]
    pub grid: GridConfig,

    #[serde(default)]
    pub arbitrage: ArbitrageConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    #[serde(default)]
    pub portfolio: PortfolioConfig,

    #[serde(default)]
    pub risk: RiskConfig,

    // --- Infrastructure ------------------------------------------------------

    /// Per-engine event queue capacity.
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,

    /// Directory holding the per-symbol state databases.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// RPC bind address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Webhook URLs receiving alert fan-out.
    #[serde(default)]
    pub alert_webhooks: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("runtime defaults")
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            trading_mode = %config.trading_mode,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialize runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.account_mode, AccountMode::Paper);
        assert_eq!(cfg.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(cfg.grid.buy_window, 2);
        assert_eq!(cfg.grid.sell_window, 2);
        assert!(cfg.grid.is_neutral);
        assert_eq!(cfg.executor.orders_per_sec, 25);
        assert_eq!(cfg.executor.order_burst, 30);
        assert_eq!(cfg.executor.retry_max_attempts, 3);
        assert_eq!(cfg.reconciler.interval_secs, 300);
        assert_eq!(cfg.reconciler.cleaner_interval_secs, 60);
        assert!((cfg.portfolio.max_weight - 0.25).abs() < f64::EPSILON);
        assert!((cfg.portfolio.sector_cap - 0.30).abs() < f64::EPSILON);
        assert_eq!(cfg.risk.policy, TriggerPolicy::Any);
        assert_eq!(cfg.event_queue_capacity, 128);
    }

    #[test]
    fn deserialize_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert!((cfg.arbitrage.min_spread_apr - 0.10).abs() < f64::EPSILON);
        assert_eq!(cfg.arbitrage.funding_staleness_ms, 60_000);
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let json = r#"{ "trading_mode": "Live", "symbols": ["ETHUSDT"], "grid": { "buy_window": 5 } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Live);
        assert_eq!(cfg.symbols, vec!["ETHUSDT"]);
        assert_eq!(cfg.grid.buy_window, 5);
        assert_eq!(cfg.grid.sell_window, 2);
    }

    #[test]
    fn decimal_fields_serialize_as_strings() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["grid"]["price_interval"], serde_json::json!("10"));
        assert_eq!(json["grid"]["order_quantity"], serde_json::json!("0.01"));
    }

    #[test]
    fn roundtrip_serialization() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.grid.price_interval, cfg2.grid.price_interval);
        assert_eq!(cfg.portfolio.interval_secs, cfg2.portfolio.interval_secs);
    }
}
