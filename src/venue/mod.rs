// =============================================================================
// Venue Capability Contract — uniform adapter surface for every exchange
// =============================================================================
//
// The core engine never talks to an exchange SDK directly; it consumes this
// trait. Adapters map raw venue errors into the `VenueError` taxonomy and
// produce the canonical event types below, so the engine, executor, and
// reconciler stay venue-agnostic.
//
// All monetary quantities cross the wire as string-backed decimals; adapters
// parse them into `rust_decimal::Decimal` without ever passing through a
// float.
// =============================================================================

pub mod binance;
pub mod paper;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::{BalanceInfo, Shutdown, Side, VenueError};

// ---------------------------------------------------------------------------
// Order types
// ---------------------------------------------------------------------------

/// Order execution style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
}

/// Time-in-force for limit orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good till canceled.
    Gtc,
    /// Immediate or cancel.
    Ioc,
}

/// Venue-reported lifecycle state of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// An order in a terminal state will never fill further.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Rejected | Self::Expired)
    }
}

/// A new-order request submitted to a venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    /// Required for limit orders.
    pub price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    /// Maker-only: the venue rejects the order if it would take liquidity.
    pub post_only: bool,
    /// The order may only decrease an existing position.
    pub reduce_only: bool,
    /// Idempotency key; resubmitting the same id returns the existing order.
    pub client_order_id: String,
}

impl OrderRequest {
    /// Convenience constructor for a plain GTC limit order.
    pub fn limit(
        symbol: impl Into<String>,
        side: Side,
        price: Decimal,
        quantity: Decimal,
        client_order_id: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            time_in_force: TimeInForce::Gtc,
            post_only: false,
            reduce_only: false,
            client_order_id: client_order_id.into(),
        }
    }

    /// Convenience constructor for a market order.
    pub fn market(
        symbol: impl Into<String>,
        side: Side,
        quantity: Decimal,
        client_order_id: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            time_in_force: TimeInForce::Ioc,
            post_only: false,
            reduce_only: false,
            client_order_id: client_order_id.into(),
        }
    }
}

/// A venue's view of an order, returned by place/get/cancel calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueOrder {
    pub order_id: u64,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub orig_qty: Decimal,
    pub executed_qty: Decimal,
    pub status: OrderStatus,
    pub update_time_ms: i64,
}

// ---------------------------------------------------------------------------
// Account / position types
// ---------------------------------------------------------------------------

/// Account snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    /// Total account equity in the quote currency.
    pub equity: Decimal,
    /// Balance available for new orders.
    pub available: Decimal,
    /// Margin health ratio in [0, 1]; 1.0 means no margin in use.
    pub margin_health: f64,
    /// Whether spot and perp share collateral on this venue.
    pub unified_margin: bool,
    pub balances: Vec<BalanceInfo>,
}

/// A single (possibly zero) position on a venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionInfo {
    pub symbol: String,
    /// Signed size: positive long, negative short.
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Decimal,
}

// ---------------------------------------------------------------------------
// Market data types
// ---------------------------------------------------------------------------

/// OHLCV candle. Market-data prices feed indicator math and therefore stay in
/// `f64`; order and position quantities never do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kline {
    pub symbol: String,
    pub open_time_ms: i64,
    pub close_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_closed: bool,
}

/// 24 h ticker summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerInfo {
    pub symbol: String,
    pub last_price: Decimal,
    pub quote_volume_24h: Decimal,
}

/// Open-interest reading for a perp symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenInterestInfo {
    pub symbol: String,
    pub open_interest: Decimal,
    pub ts_ms: i64,
}

/// Precision and asset metadata for a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub tick_size: Decimal,
    pub step_size: Decimal,
    pub price_decimals: u32,
    pub qty_decimals: u32,
    pub min_notional: Decimal,
}

/// Funding-rate observation for a perp symbol on one venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRate {
    pub exchange: String,
    pub symbol: String,
    pub rate: Decimal,
    pub predicted_rate: Decimal,
    pub next_funding_time_ms: i64,
    /// When this observation was taken; drives staleness gating.
    pub observed_at: DateTime<Utc>,
}

impl FundingRate {
    /// A rate is fresh iff `now − observed_at ≤ ttl`.
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now.signed_duration_since(self.observed_at) <= ttl
    }
}

// ---------------------------------------------------------------------------
// Canonical stream events
// ---------------------------------------------------------------------------

/// Last-trade price tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub exchange: String,
    pub symbol: String,
    pub price: Decimal,
    pub ts_ms: i64,
}

/// Execution report for one of our orders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub exchange: String,
    pub symbol: String,
    pub order_id: u64,
    pub client_order_id: String,
    pub side: Side,
    pub price: Decimal,
    pub status: OrderStatus,
    /// Quantity executed in this event.
    pub last_executed_qty: Decimal,
    /// Cumulative executed quantity over the order's life.
    pub cum_executed_qty: Decimal,
    pub ts_ms: i64,
}

/// Position change pushed by the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub exchange: String,
    pub symbol: String,
    pub qty: Decimal,
    pub entry_price: Decimal,
}

/// Account balance / margin change pushed by the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountUpdate {
    pub exchange: String,
    pub margin_health: f64,
    pub balances: Vec<BalanceInfo>,
}

// ---------------------------------------------------------------------------
// The capability trait
// ---------------------------------------------------------------------------

/// Uniform capability set every venue adapter must provide.
///
/// Stream methods run until shutdown fires, reconnecting internally with a
/// 5 s delay. They deliver canonical events into the supplied channel; the
/// caller owns queue sizing and overflow policy.
#[async_trait]
pub trait Venue: Send + Sync {
    fn name(&self) -> &str;

    // --- Orders --------------------------------------------------------------

    async fn place_order(&self, req: &OrderRequest) -> Result<VenueOrder, VenueError>;

    /// Place several orders; a single rejection never aborts the batch.
    async fn batch_place_orders(
        &self,
        reqs: &[OrderRequest],
    ) -> Result<Vec<Result<VenueOrder, VenueError>>, VenueError>;

    async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<VenueOrder, VenueError>;

    /// Cancel several orders; per-order results, batch never aborts early.
    async fn batch_cancel_orders(
        &self,
        symbol: &str,
        order_ids: &[u64],
    ) -> Result<Vec<Result<u64, VenueError>>, VenueError>;

    /// Cancel everything open on `symbol`; returns the number canceled.
    async fn cancel_all_orders(&self, symbol: &str) -> Result<u32, VenueError>;

    async fn get_order(&self, symbol: &str, order_id: u64) -> Result<VenueOrder, VenueError>;

    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<VenueOrder>, VenueError>;

    // --- Account / positions -------------------------------------------------

    async fn get_account(&self) -> Result<AccountInfo, VenueError>;

    async fn get_positions(&self, symbol: Option<&str>) -> Result<Vec<PositionInfo>, VenueError>;

    async fn get_balance(&self, asset: &str) -> Result<Decimal, VenueError>;

    /// Whether spot and perp legs share collateral on this venue.
    fn is_unified_margin(&self) -> bool;

    // --- Market data ---------------------------------------------------------

    async fn get_latest_price(&self, symbol: &str) -> Result<Decimal, VenueError>;

    async fn get_historical_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Kline>, VenueError>;

    async fn get_funding_rate(&self, symbol: &str) -> Result<FundingRate, VenueError>;

    async fn get_funding_rates(&self) -> Result<Vec<FundingRate>, VenueError>;

    async fn get_historical_funding_rates(
        &self,
        symbol: &str,
        limit: u32,
    ) -> Result<Vec<FundingRate>, VenueError>;

    async fn get_tickers(&self) -> Result<Vec<TickerInfo>, VenueError>;

    async fn get_open_interest(&self, symbol: &str) -> Result<OpenInterestInfo, VenueError>;

    async fn get_symbol_info(&self, symbol: &str) -> Result<SymbolInfo, VenueError>;

    // --- Streams -------------------------------------------------------------

    async fn start_price_stream(
        &self,
        symbols: Vec<String>,
        tx: mpsc::Sender<PriceUpdate>,
        shutdown: Shutdown,
    ) -> Result<(), VenueError>;

    async fn start_order_stream(
        &self,
        tx: mpsc::Sender<OrderUpdate>,
        shutdown: Shutdown,
    ) -> Result<(), VenueError>;

    async fn start_kline_stream(
        &self,
        symbols: Vec<String>,
        interval: &str,
        tx: mpsc::Sender<Kline>,
        shutdown: Shutdown,
    ) -> Result<(), VenueError>;

    async fn start_account_stream(
        &self,
        tx: mpsc::Sender<AccountUpdate>,
        shutdown: Shutdown,
    ) -> Result<(), VenueError>;

    async fn start_position_stream(
        &self,
        tx: mpsc::Sender<PositionUpdate>,
        shutdown: Shutdown,
    ) -> Result<(), VenueError>;

    async fn start_funding_rate_stream(
        &self,
        symbols: Vec<String>,
        tx: mpsc::Sender<FundingRate>,
        shutdown: Shutdown,
    ) -> Result<(), VenueError>;

    // --- Health --------------------------------------------------------------

    async fn check_health(&self) -> Result<(), VenueError>;
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn order_status_terminality() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn funding_rate_freshness() {
        let now = Utc::now();
        let fresh = FundingRate {
            exchange: "paper".into(),
            symbol: "BTCUSDT".into(),
            rate: dec!(0.0001),
            predicted_rate: dec!(0.0001),
            next_funding_time_ms: 0,
            observed_at: now - chrono::Duration::milliseconds(50),
        };
        assert!(fresh.is_fresh(now, chrono::Duration::milliseconds(100)));
        assert!(!fresh.is_fresh(now, chrono::Duration::milliseconds(10)));
    }

    #[test]
    fn decimal_quantities_serialize_as_strings() {
        let req = OrderRequest::limit("BTCUSDT", Side::Buy, dec!(44990), dec!(0.01), "x");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["price"], serde_json::json!("44990"));
        assert_eq!(json["quantity"], serde_json::json!("0.01"));
    }
}
