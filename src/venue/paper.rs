// =============================================================================
// Paper Venue — deterministic in-memory venue for paper mode and tests
// =============================================================================
//
// Implements the full `Venue` capability set against in-memory state:
//   - Limit orders rest until `force_fill` (or a crossing check rejects a
//     post-only order).
//   - Market/IOC orders execute instantly at the last set price, scaled by a
//     scriptable fill ratio (for partial-fill scenarios).
//   - Client-order-id dedup returns the existing order unchanged.
//   - Per-operation fault injection surfaces any `VenueError` exactly once.
//
// Stream methods forward internal broadcast channels, so tests and paper-mode
// wiring observe the same canonical events a live adapter would produce.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::types::{BalanceInfo, Shutdown, Side, VenueError};
use crate::venue::{
    AccountInfo, AccountUpdate, FundingRate, Kline, OpenInterestInfo, OrderRequest, OrderStatus,
    OrderType, OrderUpdate, PositionInfo, PositionUpdate, PriceUpdate, SymbolInfo, TickerInfo,
    Venue, VenueOrder,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

struct Inner {
    next_order_id: u64,
    open_orders: HashMap<u64, VenueOrder>,
    orders_by_coid: HashMap<String, u64>,
    positions: HashMap<String, PositionInfo>,
    prices: HashMap<String, Decimal>,
    symbol_info: HashMap<String, SymbolInfo>,
    klines: HashMap<String, Vec<Kline>>,
    funding: HashMap<String, FundingRate>,
    funding_history: HashMap<String, Vec<FundingRate>>,
    open_interest: HashMap<String, Decimal>,
    account: AccountInfo,
    /// Scripted outcomes per operation name: `Some(err)` fails the call,
    /// `None` lets it pass (used to fail the Nth call, not the first).
    failures: HashMap<&'static str, VecDeque<Option<VenueError>>>,
    /// Fill ratio applied to the next market order (then reset to 1).
    next_market_fill_ratio: Decimal,
}

/// In-memory venue. Cheap to construct per test; share via `Arc` in the app.
pub struct PaperVenue {
    name: String,
    unified_margin: bool,
    inner: Mutex<Inner>,
    order_events: broadcast::Sender<OrderUpdate>,
    price_events: broadcast::Sender<PriceUpdate>,
    kline_events: broadcast::Sender<Kline>,
    account_events: broadcast::Sender<AccountUpdate>,
    position_events: broadcast::Sender<PositionUpdate>,
    funding_events: broadcast::Sender<FundingRate>,
}

impl PaperVenue {
    pub fn new(name: impl Into<String>, unified_margin: bool) -> Self {
        Self {
            name: name.into(),
            unified_margin,
            inner: Mutex::new(Inner {
                next_order_id: 1,
                open_orders: HashMap::new(),
                orders_by_coid: HashMap::new(),
                positions: HashMap::new(),
                prices: HashMap::new(),
                symbol_info: HashMap::new(),
                klines: HashMap::new(),
                funding: HashMap::new(),
                funding_history: HashMap::new(),
                open_interest: HashMap::new(),
                account: AccountInfo {
                    equity: dec!(100000),
                    available: dec!(100000),
                    margin_health: 1.0,
                    unified_margin,
                    balances: Vec::new(),
                },
                failures: HashMap::new(),
                next_market_fill_ratio: Decimal::ONE,
            }),
            order_events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            price_events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            kline_events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            account_events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            position_events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            funding_events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
        }
    }

    // -------------------------------------------------------------------------
    // Scripting surface (paper-mode wiring and tests)
    // -------------------------------------------------------------------------

    /// Set the last price and emit a price event.
    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.inner.lock().prices.insert(symbol.to_string(), price);
        let _ = self.price_events.send(PriceUpdate {
            exchange: self.name.clone(),
            symbol: symbol.to_string(),
            price,
            ts_ms: Utc::now().timestamp_millis(),
        });
    }

    pub fn set_symbol_info(&self, info: SymbolInfo) {
        self.inner
            .lock()
            .symbol_info
            .insert(info.symbol.clone(), info);
    }

    pub fn set_funding_rate(&self, rate: FundingRate) {
        let mut inner = self.inner.lock();
        inner.funding.insert(rate.symbol.clone(), rate.clone());
        inner
            .funding_history
            .entry(rate.symbol.clone())
            .or_default()
            .push(rate.clone());
        drop(inner);
        let _ = self.funding_events.send(rate);
    }

    pub fn set_funding_history(&self, symbol: &str, history: Vec<FundingRate>) {
        self.inner
            .lock()
            .funding_history
            .insert(symbol.to_string(), history);
    }

    pub fn set_open_interest(&self, symbol: &str, oi: Decimal) {
        self.inner
            .lock()
            .open_interest
            .insert(symbol.to_string(), oi);
    }

    pub fn set_klines(&self, symbol: &str, klines: Vec<Kline>) {
        self.inner.lock().klines.insert(symbol.to_string(), klines);
    }

    pub fn set_account(&self, account: AccountInfo) {
        self.inner.lock().account = account;
    }

    pub fn set_margin_health(&self, health: f64) {
        let mut inner = self.inner.lock();
        inner.account.margin_health = health;
        let update = AccountUpdate {
            exchange: self.name.clone(),
            margin_health: health,
            balances: inner.account.balances.clone(),
        };
        drop(inner);
        let _ = self.account_events.send(update);
    }

    /// Directly set a venue-side position (divergence scenarios).
    pub fn set_position(&self, symbol: &str, qty: Decimal, entry_price: Decimal) {
        self.inner.lock().positions.insert(
            symbol.to_string(),
            PositionInfo {
                symbol: symbol.to_string(),
                qty,
                entry_price,
                unrealized_pnl: Decimal::ZERO,
            },
        );
    }

    /// Queue a one-shot failure for the named operation.
    pub fn inject_failure(&self, op: &'static str, err: VenueError) {
        self.inner
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(Some(err));
    }

    /// Queue a pass-through slot so a following injected failure hits the
    /// Nth call instead of the first.
    pub fn inject_pass(&self, op: &'static str) {
        self.inner.lock().failures.entry(op).or_default().push_back(None);
    }

    /// Scale the next market order's executed quantity (e.g. 0.8 for an 80 %
    /// IOC fill).
    pub fn set_next_market_fill_ratio(&self, ratio: Decimal) {
        self.inner.lock().next_market_fill_ratio = ratio;
    }

    pub fn open_order_count(&self) -> usize {
        self.inner.lock().open_orders.len()
    }

    /// Remove an order behind the engine's back (ghost-local scenarios).
    pub fn drop_order(&self, order_id: u64) {
        let mut inner = self.inner.lock();
        if let Some(order) = inner.open_orders.remove(&order_id) {
            inner.orders_by_coid.remove(&order.client_order_id);
        }
    }

    /// Inject an order the engine knows nothing about (ghost-venue scenarios).
    pub fn seed_unknown_order(&self, symbol: &str, side: Side, price: Decimal, qty: Decimal) -> u64 {
        let mut inner = self.inner.lock();
        let order_id = inner.next_order_id;
        inner.next_order_id += 1;
        inner.open_orders.insert(
            order_id,
            VenueOrder {
                order_id,
                client_order_id: format!("ghost-{order_id}"),
                symbol: symbol.to_string(),
                side,
                price,
                orig_qty: qty,
                executed_qty: Decimal::ZERO,
                status: OrderStatus::New,
                update_time_ms: Utc::now().timestamp_millis(),
            },
        );
        order_id
    }

    /// Fill `ratio` of a resting order, apply the position change, and emit
    /// the resulting order update. Returns the update for direct handler
    /// injection in tests.
    pub fn force_fill(&self, order_id: u64, ratio: Decimal) -> Option<OrderUpdate> {
        let mut inner = self.inner.lock();
        let order = inner.open_orders.get_mut(&order_id)?;

        let fill_qty = (order.orig_qty * ratio).min(order.orig_qty - order.executed_qty);
        order.executed_qty += fill_qty;
        let full = order.executed_qty >= order.orig_qty;
        order.status = if full {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        let update = OrderUpdate {
            exchange: self.name.clone(),
            symbol: order.symbol.clone(),
            order_id,
            client_order_id: order.client_order_id.clone(),
            side: order.side,
            price: order.price,
            status: order.status,
            last_executed_qty: fill_qty,
            cum_executed_qty: order.executed_qty,
            ts_ms: Utc::now().timestamp_millis(),
        };

        let symbol = order.symbol.clone();
        let side = order.side;
        let price = order.price;
        if full {
            let coid = order.client_order_id.clone();
            inner.open_orders.remove(&order_id);
            inner.orders_by_coid.remove(&coid);
        }
        Self::apply_position_delta(&mut inner, &symbol, side, fill_qty, price);

        drop(inner);
        let _ = self.order_events.send(update.clone());
        Some(update)
    }

    fn take_failure(&self, op: &'static str) -> Option<VenueError> {
        self.inner
            .lock()
            .failures
            .get_mut(op)
            .and_then(|q| q.pop_front())
            .flatten()
    }

    fn apply_position_delta(
        inner: &mut Inner,
        symbol: &str,
        side: Side,
        qty: Decimal,
        price: Decimal,
    ) {
        let delta = match side {
            Side::Buy => qty,
            Side::Sell => -qty,
        };
        let entry = inner
            .positions
            .entry(symbol.to_string())
            .or_insert_with(|| PositionInfo {
                symbol: symbol.to_string(),
                qty: Decimal::ZERO,
                entry_price: price,
                unrealized_pnl: Decimal::ZERO,
            });
        entry.qty += delta;
        if entry.qty.is_zero() {
            inner.positions.remove(symbol);
        }
    }

    async fn forward<T: Clone + Send + 'static>(
        mut rx: broadcast::Receiver<T>,
        tx: mpsc::Sender<T>,
        mut shutdown: Shutdown,
    ) -> Result<(), VenueError> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                event = rx.recv() => match event {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            return Ok(());
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "paper stream subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
            }
        }
    }
}

#[async_trait]
impl Venue for PaperVenue {
    fn name(&self) -> &str {
        &self.name
    }

    // --- Orders --------------------------------------------------------------

    async fn place_order(&self, req: &OrderRequest) -> Result<VenueOrder, VenueError> {
        if let Some(err) = self.take_failure("place_order") {
            return Err(err);
        }

        let mut inner = self.inner.lock();

        // Idempotency: duplicate client order ids return the existing order.
        if let Some(&existing_id) = inner.orders_by_coid.get(&req.client_order_id) {
            if let Some(existing) = inner.open_orders.get(&existing_id) {
                return Ok(existing.clone());
            }
        }

        let last_price = inner.prices.get(&req.symbol).copied();

        match req.order_type {
            OrderType::Limit => {
                let price = req
                    .price
                    .ok_or_else(|| VenueError::InvalidParameter("limit order without price".into()))?;

                if let Some(market) = last_price {
                    let crosses = match req.side {
                        Side::Buy => price > market,
                        Side::Sell => price < market,
                    };
                    if crosses && req.post_only {
                        return Err(VenueError::OrderRejected("post-only would cross".into()));
                    }
                    if crosses {
                        // Marketable limit: executes immediately at the touch.
                        let order_id = inner.next_order_id;
                        inner.next_order_id += 1;
                        Self::apply_position_delta(&mut inner, &req.symbol, req.side, req.quantity, market);
                        return Ok(VenueOrder {
                            order_id,
                            client_order_id: req.client_order_id.clone(),
                            symbol: req.symbol.clone(),
                            side: req.side,
                            price: market,
                            orig_qty: req.quantity,
                            executed_qty: req.quantity,
                            status: OrderStatus::Filled,
                            update_time_ms: Utc::now().timestamp_millis(),
                        });
                    }
                }

                let order_id = inner.next_order_id;
                inner.next_order_id += 1;
                let order = VenueOrder {
                    order_id,
                    client_order_id: req.client_order_id.clone(),
                    symbol: req.symbol.clone(),
                    side: req.side,
                    price,
                    orig_qty: req.quantity,
                    executed_qty: Decimal::ZERO,
                    status: OrderStatus::New,
                    update_time_ms: Utc::now().timestamp_millis(),
                };
                inner.open_orders.insert(order_id, order.clone());
                inner
                    .orders_by_coid
                    .insert(req.client_order_id.clone(), order_id);
                Ok(order)
            }
            OrderType::Market => {
                let price = last_price.ok_or_else(|| {
                    VenueError::InvalidParameter(format!("no price seeded for {}", req.symbol))
                })?;
                let ratio = inner.next_market_fill_ratio;
                inner.next_market_fill_ratio = Decimal::ONE;
                let executed = req.quantity * ratio;

                let order_id = inner.next_order_id;
                inner.next_order_id += 1;
                let status = if executed >= req.quantity {
                    OrderStatus::Filled
                } else {
                    OrderStatus::PartiallyFilled
                };
                if !executed.is_zero() {
                    Self::apply_position_delta(&mut inner, &req.symbol, req.side, executed, price);
                }
                Ok(VenueOrder {
                    order_id,
                    client_order_id: req.client_order_id.clone(),
                    symbol: req.symbol.clone(),
                    side: req.side,
                    price,
                    orig_qty: req.quantity,
                    executed_qty: executed,
                    status,
                    update_time_ms: Utc::now().timestamp_millis(),
                })
            }
        }
    }

    async fn batch_place_orders(
        &self,
        reqs: &[OrderRequest],
    ) -> Result<Vec<Result<VenueOrder, VenueError>>, VenueError> {
        if let Some(err) = self.take_failure("batch_place_orders") {
            return Err(err);
        }
        let mut results = Vec::with_capacity(reqs.len());
        for req in reqs {
            results.push(self.place_order(req).await);
        }
        Ok(results)
    }

    async fn cancel_order(&self, _symbol: &str, order_id: u64) -> Result<VenueOrder, VenueError> {
        if let Some(err) = self.take_failure("cancel_order") {
            return Err(err);
        }
        let mut inner = self.inner.lock();
        let mut order = inner
            .open_orders
            .remove(&order_id)
            .ok_or_else(|| VenueError::NotFound(format!("order {order_id}")))?;
        inner.orders_by_coid.remove(&order.client_order_id);
        order.status = OrderStatus::Canceled;
        Ok(order)
    }

    async fn batch_cancel_orders(
        &self,
        symbol: &str,
        order_ids: &[u64],
    ) -> Result<Vec<Result<u64, VenueError>>, VenueError> {
        if let Some(err) = self.take_failure("batch_cancel_orders") {
            return Err(err);
        }
        let mut results = Vec::with_capacity(order_ids.len());
        for &id in order_ids {
            results.push(self.cancel_order(symbol, id).await.map(|o| o.order_id));
        }
        Ok(results)
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<u32, VenueError> {
        if let Some(err) = self.take_failure("cancel_all_orders") {
            return Err(err);
        }
        let mut inner = self.inner.lock();
        let ids: Vec<u64> = inner
            .open_orders
            .values()
            .filter(|o| o.symbol == symbol)
            .map(|o| o.order_id)
            .collect();
        for id in &ids {
            if let Some(order) = inner.open_orders.remove(id) {
                inner.orders_by_coid.remove(&order.client_order_id);
            }
        }
        Ok(ids.len() as u32)
    }

    async fn get_order(&self, _symbol: &str, order_id: u64) -> Result<VenueOrder, VenueError> {
        self.inner
            .lock()
            .open_orders
            .get(&order_id)
            .cloned()
            .ok_or_else(|| VenueError::NotFound(format!("order {order_id}")))
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<VenueOrder>, VenueError> {
        if let Some(err) = self.take_failure("get_open_orders") {
            return Err(err);
        }
        Ok(self
            .inner
            .lock()
            .open_orders
            .values()
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .cloned()
            .collect())
    }

    // --- Account / positions -------------------------------------------------

    async fn get_account(&self) -> Result<AccountInfo, VenueError> {
        if let Some(err) = self.take_failure("get_account") {
            return Err(err);
        }
        Ok(self.inner.lock().account.clone())
    }

    async fn get_positions(&self, symbol: Option<&str>) -> Result<Vec<PositionInfo>, VenueError> {
        if let Some(err) = self.take_failure("get_positions") {
            return Err(err);
        }
        Ok(self
            .inner
            .lock()
            .positions
            .values()
            .filter(|p| symbol.map_or(true, |s| p.symbol == s))
            .cloned()
            .collect())
    }

    async fn get_balance(&self, asset: &str) -> Result<Decimal, VenueError> {
        Ok(self
            .inner
            .lock()
            .account
            .balances
            .iter()
            .find(|b| b.asset == asset)
            .map(|b| b.free)
            .unwrap_or_default())
    }

    fn is_unified_margin(&self) -> bool {
        self.unified_margin
    }

    // --- Market data ---------------------------------------------------------

    async fn get_latest_price(&self, symbol: &str) -> Result<Decimal, VenueError> {
        self.inner
            .lock()
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| VenueError::NotFound(format!("no price for {symbol}")))
    }

    async fn get_historical_klines(
        &self,
        symbol: &str,
        _interval: &str,
        limit: u32,
    ) -> Result<Vec<Kline>, VenueError> {
        let inner = self.inner.lock();
        let klines = inner.klines.get(symbol).cloned().unwrap_or_default();
        let skip = klines.len().saturating_sub(limit as usize);
        Ok(klines.into_iter().skip(skip).collect())
    }

    async fn get_funding_rate(&self, symbol: &str) -> Result<FundingRate, VenueError> {
        self.inner
            .lock()
            .funding
            .get(symbol)
            .cloned()
            .ok_or_else(|| VenueError::NotFound(format!("no funding rate for {symbol}")))
    }

    async fn get_funding_rates(&self) -> Result<Vec<FundingRate>, VenueError> {
        Ok(self.inner.lock().funding.values().cloned().collect())
    }

    async fn get_historical_funding_rates(
        &self,
        symbol: &str,
        limit: u32,
    ) -> Result<Vec<FundingRate>, VenueError> {
        if let Some(err) = self.take_failure("get_historical_funding_rates") {
            return Err(err);
        }
        let inner = self.inner.lock();
        let history = inner.funding_history.get(symbol).cloned().unwrap_or_default();
        let skip = history.len().saturating_sub(limit as usize);
        Ok(history.into_iter().skip(skip).collect())
    }

    async fn get_tickers(&self) -> Result<Vec<TickerInfo>, VenueError> {
        Ok(self
            .inner
            .lock()
            .prices
            .iter()
            .map(|(symbol, &price)| TickerInfo {
                symbol: symbol.clone(),
                last_price: price,
                quote_volume_24h: Decimal::ZERO,
            })
            .collect())
    }

    async fn get_open_interest(&self, symbol: &str) -> Result<OpenInterestInfo, VenueError> {
        Ok(OpenInterestInfo {
            symbol: symbol.to_string(),
            open_interest: self
                .inner
                .lock()
                .open_interest
                .get(symbol)
                .copied()
                .unwrap_or_default(),
            ts_ms: Utc::now().timestamp_millis(),
        })
    }

    async fn get_symbol_info(&self, symbol: &str) -> Result<SymbolInfo, VenueError> {
        self.inner
            .lock()
            .symbol_info
            .get(symbol)
            .cloned()
            .ok_or_else(|| VenueError::NotFound(format!("no symbol info for {symbol}")))
    }

    // --- Streams -------------------------------------------------------------

    async fn start_price_stream(
        &self,
        _symbols: Vec<String>,
        tx: mpsc::Sender<PriceUpdate>,
        shutdown: Shutdown,
    ) -> Result<(), VenueError> {
        Self::forward(self.price_events.subscribe(), tx, shutdown).await
    }

    async fn start_order_stream(
        &self,
        tx: mpsc::Sender<OrderUpdate>,
        shutdown: Shutdown,
    ) -> Result<(), VenueError> {
        Self::forward(self.order_events.subscribe(), tx, shutdown).await
    }

    async fn start_kline_stream(
        &self,
        _symbols: Vec<String>,
        _interval: &str,
        tx: mpsc::Sender<Kline>,
        shutdown: Shutdown,
    ) -> Result<(), VenueError> {
        Self::forward(self.kline_events.subscribe(), tx, shutdown).await
    }

    async fn start_account_stream(
        &self,
        tx: mpsc::Sender<AccountUpdate>,
        shutdown: Shutdown,
    ) -> Result<(), VenueError> {
        Self::forward(self.account_events.subscribe(), tx, shutdown).await
    }

    async fn start_position_stream(
        &self,
        tx: mpsc::Sender<PositionUpdate>,
        shutdown: Shutdown,
    ) -> Result<(), VenueError> {
        Self::forward(self.position_events.subscribe(), tx, shutdown).await
    }

    async fn start_funding_rate_stream(
        &self,
        _symbols: Vec<String>,
        tx: mpsc::Sender<FundingRate>,
        shutdown: Shutdown,
    ) -> Result<(), VenueError> {
        Self::forward(self.funding_events.subscribe(), tx, shutdown).await
    }

    // --- Health --------------------------------------------------------------

    async fn check_health(&self) -> Result<(), VenueError> {
        match self.take_failure("check_health") {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for PaperVenue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaperVenue")
            .field("name", &self.name)
            .field("open_orders", &self.open_order_count())
            .finish()
    }
}

/// Emit a position update into the paper venue's position stream.
impl PaperVenue {
    pub fn push_kline(&self, kline: Kline) {
        let _ = self.kline_events.send(kline);
    }

    pub fn push_position_update(&self, update: PositionUpdate) {
        let _ = self.position_events.send(update);
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn venue() -> PaperVenue {
        let v = PaperVenue::new("paper", true);
        v.set_price("BTCUSDT", dec!(45000));
        v
    }

    #[tokio::test]
    async fn limit_order_rests_until_filled() {
        let v = venue();
        let req = OrderRequest::limit("BTCUSDT", Side::Buy, dec!(44990), dec!(0.01), "coid-1");
        let order = v.place_order(&req).await.unwrap();
        assert_eq!(order.status, OrderStatus::New);
        assert_eq!(v.open_order_count(), 1);

        let update = v.force_fill(order.order_id, Decimal::ONE).unwrap();
        assert_eq!(update.status, OrderStatus::Filled);
        assert_eq!(update.cum_executed_qty, dec!(0.01));
        assert_eq!(v.open_order_count(), 0);

        let positions = v.get_positions(Some("BTCUSDT")).await.unwrap();
        assert_eq!(positions[0].qty, dec!(0.01));
    }

    #[tokio::test]
    async fn duplicate_client_order_id_returns_existing_order() {
        let v = venue();
        let req = OrderRequest::limit("BTCUSDT", Side::Buy, dec!(44990), dec!(0.01), "dup");
        let first = v.place_order(&req).await.unwrap();
        let second = v.place_order(&req).await.unwrap();
        assert_eq!(first.order_id, second.order_id);
        assert_eq!(v.open_order_count(), 1);
    }

    #[tokio::test]
    async fn post_only_crossing_rejected() {
        let v = venue();
        let mut req = OrderRequest::limit("BTCUSDT", Side::Buy, dec!(45010), dec!(0.01), "po");
        req.post_only = true;
        let err = v.place_order(&req).await.unwrap_err();
        assert!(err.is_post_only_cross());
    }

    #[tokio::test]
    async fn market_order_honours_fill_ratio() {
        let v = venue();
        v.set_next_market_fill_ratio(dec!(0.8));
        let req = OrderRequest::market("BTCUSDT", Side::Buy, dec!(1.0), "mkt");
        let order = v.place_order(&req).await.unwrap();
        assert_eq!(order.executed_qty, dec!(0.8));
        assert_eq!(order.status, OrderStatus::PartiallyFilled);

        // Ratio resets to full for the next order.
        let order2 = v
            .place_order(&OrderRequest::market("BTCUSDT", Side::Sell, dec!(0.8), "mkt2"))
            .await
            .unwrap();
        assert_eq!(order2.executed_qty, dec!(0.8));
        // 0.8 long opened then 0.8 sold — flat again.
        assert!(v.get_positions(Some("BTCUSDT")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let v = venue();
        v.inject_failure("place_order", VenueError::Network("boom".into()));
        let req = OrderRequest::limit("BTCUSDT", Side::Buy, dec!(44990), dec!(0.01), "x");
        assert!(v.place_order(&req).await.is_err());
        assert!(v.place_order(&req).await.is_ok());
    }

    #[tokio::test]
    async fn batch_place_isolates_failures() {
        let v = venue();
        let good = OrderRequest::limit("BTCUSDT", Side::Buy, dec!(44990), dec!(0.01), "a");
        let mut bad = OrderRequest::limit("BTCUSDT", Side::Buy, dec!(45010), dec!(0.01), "b");
        bad.post_only = true;
        let results = v.batch_place_orders(&[good, bad]).await.unwrap();
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[tokio::test]
    async fn cancel_unknown_order_is_not_found() {
        let v = venue();
        let err = v.cancel_order("BTCUSDT", 999).await.unwrap_err();
        assert!(matches!(err, VenueError::NotFound(_)));
    }

    #[tokio::test]
    async fn order_stream_delivers_fills() {
        let v = venue();
        let (tx, mut rx) = mpsc::channel(16);
        let (_ctl, shutdown) = crate::types::ShutdownController::new();
        let v = std::sync::Arc::new(v);
        let streamer = v.clone();
        let handle = tokio::spawn(async move {
            streamer.start_order_stream(tx, shutdown).await.unwrap();
        });

        // Give the forwarder a beat to subscribe.
        tokio::task::yield_now().await;
        let req = OrderRequest::limit("BTCUSDT", Side::Buy, dec!(44990), dec!(0.01), "s");
        let order = v.place_order(&req).await.unwrap();
        v.force_fill(order.order_id, Decimal::ONE).unwrap();

        let update = rx.recv().await.unwrap();
        assert_eq!(update.order_id, order.order_id);
        assert_eq!(update.status, OrderStatus::Filled);
        handle.abort();
    }
}
