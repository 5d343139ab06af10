// =============================================================================
// Binance USDⓈ-M Futures Adapter — HMAC-SHA256 signed REST + user streams
// =============================================================================
//
// SECURITY: the secret key is `Secret`-typed and never logged or serialized.
// All signed requests carry X-MBX-APIKEY as a header and a recvWindow of
// 5 000 ms to tolerate minor clock drift.
//
// Monetary fields are parsed from Binance's string-backed decimals straight
// into `rust_decimal::Decimal`; kline OHLCV goes to `f64` for indicator math.
//
// Streams reconnect with a 5 s delay until shutdown and answer Ping frames
// with Pongs. The user-data stream keeps its listen key alive every 30 min.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use rust_decimal::Decimal;
use sha2::Sha256;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::types::{BalanceInfo, Secret, Shutdown, Side, VenueError};
use crate::venue::{
    AccountInfo, AccountUpdate, FundingRate, Kline, OpenInterestInfo, OrderRequest, OrderStatus,
    OrderType, OrderUpdate, PositionInfo, PositionUpdate, PriceUpdate, SymbolInfo, TickerInfo,
    TimeInForce, Venue, VenueOrder,
};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;
/// Reconnect delay for all streams.
const RECONNECT_DELAY_SECS: u64 = 5;
/// Listen-key keepalive cadence.
const LISTEN_KEY_KEEPALIVE_SECS: u64 = 1800;
/// Self-imposed ceiling on 1-minute request weight.
const WEIGHT_HARD_LIMIT: u32 = 1000;

/// Binance futures adapter. Clone-cheap via `Arc`.
pub struct BinanceFutures {
    api_key: Secret,
    secret: Secret,
    base_url: String,
    ws_url: String,
    client: reqwest::Client,
    /// Latest X-MBX-USED-WEIGHT-1M reading.
    used_weight_1m: AtomicU32,
}

impl BinanceFutures {
    pub fn new(api_key: Secret, secret: Secret) -> Self {
        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(api_key.expose()) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key,
            secret,
            base_url: "https://fapi.binance.com".to_string(),
            ws_url: "wss://fstream.binance.com".to_string(),
            client,
            used_weight_1m: AtomicU32::new(0),
        }
    }

    /// Testnet endpoints.
    pub fn with_base_urls(mut self, base_url: impl Into<String>, ws_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self.ws_url = ws_url.into();
        self
    }

    // -------------------------------------------------------------------------
    // Signing and transport
    // -------------------------------------------------------------------------

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose().as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Utc::now().timestamp_millis();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    fn over_weight_budget(&self) -> bool {
        self.used_weight_1m.load(Ordering::Relaxed) >= WEIGHT_HARD_LIMIT
    }

    fn track_weight(&self, headers: &HeaderMap) {
        if let Some(weight) = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        {
            self.used_weight_1m.store(weight, Ordering::Relaxed);
            if weight >= WEIGHT_HARD_LIMIT {
                warn!(used_weight = weight, "request weight at hard limit");
            }
        }
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
        signed: bool,
    ) -> Result<serde_json::Value, VenueError> {
        if self.over_weight_budget() {
            return Err(VenueError::RateLimited("local weight budget exhausted".into()));
        }

        let qs = if signed {
            self.signed_query(query)
        } else {
            query.to_string()
        };
        let url = if qs.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, qs)
        };

        let resp = self
            .client
            .request(method, &url)
            .send()
            .await
            .map_err(|e| VenueError::Network(format!("{path}: {e}")))?;

        let status = resp.status();
        self.track_weight(resp.headers());
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| VenueError::Network(format!("{path}: body parse: {e}")))?;

        if status.is_success() {
            return Ok(body);
        }
        Err(map_error(status.as_u16(), &body))
    }

    // -------------------------------------------------------------------------
    // Stream plumbing
    // -------------------------------------------------------------------------

    /// Connect to `url` and feed parsed messages into `handle` until the
    /// socket drops or shutdown fires. Reconnects are the caller's loop.
    async fn read_socket<F>(
        &self,
        url: &str,
        shutdown: &Shutdown,
        mut handle: F,
    ) -> Result<(), VenueError>
    where
        F: FnMut(&serde_json::Value),
    {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| VenueError::Network(format!("ws connect: {e}")))?;
        debug!(url, "websocket connected");
        let (mut write, mut read) = ws.split();
        let mut sd = shutdown.clone();

        loop {
            tokio::select! {
                _ = sd.cancelled() => return Ok(()),
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<serde_json::Value>(&text) {
                            Ok(value) => handle(&value),
                            Err(e) => warn!(error = %e, "unparseable ws message"),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(VenueError::Network(format!("ws read: {e}"))),
                    None => return Ok(()),
                },
            }
        }
    }

    /// Reconnect-forever wrapper around [`read_socket`].
    async fn run_stream<F>(&self, url: String, shutdown: Shutdown, mut handle: F)
    where
        F: FnMut(&serde_json::Value),
    {
        let mut sd = shutdown.clone();
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            if let Err(e) = self.read_socket(&url, &shutdown, &mut handle).await {
                warn!(error = %e, "stream error — reconnecting in 5s");
            } else if shutdown.is_cancelled() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_DELAY_SECS)) => {}
                _ = sd.cancelled() => return,
            }
        }
    }

    async fn create_listen_key(&self) -> Result<String, VenueError> {
        let body = self
            .request(reqwest::Method::POST, "/fapi/v1/listenKey", "", false)
            .await?;
        body["listenKey"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| VenueError::Network("listenKey missing from response".into()))
    }

    async fn keepalive_listen_key(&self) -> Result<(), VenueError> {
        self.request(reqwest::Method::PUT, "/fapi/v1/listenKey", "", false)
            .await
            .map(|_| ())
    }

    /// Shared user-data stream (order / account / position events).
    async fn run_user_stream<F>(&self, shutdown: Shutdown, mut handle: F) -> Result<(), VenueError>
    where
        F: FnMut(&serde_json::Value),
    {
        let mut sd = shutdown.clone();
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            let listen_key = match self.create_listen_key().await {
                Ok(key) => key,
                Err(e) => {
                    warn!(error = %e, "listen key creation failed — retrying in 5s");
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_DELAY_SECS)) => continue,
                        _ = sd.cancelled() => return Ok(()),
                    }
                }
            };
            let url = format!("{}/ws/{}", self.ws_url, listen_key);

            let keepalive = async {
                let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
                    LISTEN_KEY_KEEPALIVE_SECS,
                ));
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(e) = self.keepalive_listen_key().await {
                        warn!(error = %e, "listen key keepalive failed");
                    }
                }
            };

            tokio::select! {
                result = self.read_socket(&url, &shutdown, &mut handle) => {
                    if let Err(e) = result {
                        warn!(error = %e, "user stream dropped — reconnecting in 5s");
                    }
                }
                _ = keepalive => {}
                _ = sd.cancelled() => return Ok(()),
            }
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_DELAY_SECS)) => {}
                _ = sd.cancelled() => return Ok(()),
            }
        }
    }
}

#[async_trait]
impl Venue for BinanceFutures {
    fn name(&self) -> &str {
        "binance-futures"
    }

    // --- Orders --------------------------------------------------------------

    async fn place_order(&self, req: &OrderRequest) -> Result<VenueOrder, VenueError> {
        let params = order_params(req)?;
        let body = self
            .request(reqwest::Method::POST, "/fapi/v1/order", &params, true)
            .await?;
        parse_order(&body)
    }

    async fn batch_place_orders(
        &self,
        reqs: &[OrderRequest],
    ) -> Result<Vec<Result<VenueOrder, VenueError>>, VenueError> {
        if reqs.is_empty() {
            return Ok(Vec::new());
        }
        let mut orders = Vec::with_capacity(reqs.len());
        for req in reqs {
            orders.push(order_json(req)?);
        }
        let batch = serde_json::Value::Array(orders).to_string();
        let params = format!("batchOrders={}", urlencode(&batch));
        let body = self
            .request(reqwest::Method::POST, "/fapi/v1/batchOrders", &params, true)
            .await?;

        let entries = body
            .as_array()
            .ok_or_else(|| VenueError::Network("batchOrders response not an array".into()))?;
        Ok(entries
            .iter()
            .map(|entry| {
                if entry.get("code").is_some() {
                    Err(map_error(400, entry))
                } else {
                    parse_order(entry)
                }
            })
            .collect())
    }

    async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<VenueOrder, VenueError> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let body = self
            .request(reqwest::Method::DELETE, "/fapi/v1/order", &params, true)
            .await?;
        parse_order(&body)
    }

    async fn batch_cancel_orders(
        &self,
        symbol: &str,
        order_ids: &[u64],
    ) -> Result<Vec<Result<u64, VenueError>>, VenueError> {
        if order_ids.is_empty() {
            return Ok(Vec::new());
        }
        let id_list = serde_json::to_string(order_ids)
            .map_err(|e| VenueError::InvalidParameter(e.to_string()))?;
        let params = format!("symbol={symbol}&orderIdList={}", urlencode(&id_list));
        let body = self
            .request(
                reqwest::Method::DELETE,
                "/fapi/v1/batchOrders",
                &params,
                true,
            )
            .await?;

        let entries = body
            .as_array()
            .ok_or_else(|| VenueError::Network("batch cancel response not an array".into()))?;
        Ok(entries
            .iter()
            .map(|entry| {
                if entry.get("code").is_some() && entry["code"].as_i64() != Some(200) {
                    Err(map_error(400, entry))
                } else {
                    entry["orderId"]
                        .as_u64()
                        .ok_or_else(|| VenueError::Network("orderId missing".into()))
                }
            })
            .collect())
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<u32, VenueError> {
        let params = format!("symbol={symbol}");
        self.request(
            reqwest::Method::DELETE,
            "/fapi/v1/allOpenOrders",
            &params,
            true,
        )
        .await?;
        Ok(0)
    }

    async fn get_order(&self, symbol: &str, order_id: u64) -> Result<VenueOrder, VenueError> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let body = self
            .request(reqwest::Method::GET, "/fapi/v1/order", &params, true)
            .await?;
        parse_order(&body)
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<VenueOrder>, VenueError> {
        let params = symbol.map(|s| format!("symbol={s}")).unwrap_or_default();
        let body = self
            .request(reqwest::Method::GET, "/fapi/v1/openOrders", &params, true)
            .await?;
        body.as_array()
            .ok_or_else(|| VenueError::Network("openOrders response not an array".into()))?
            .iter()
            .map(parse_order)
            .collect()
    }

    // --- Account / positions -------------------------------------------------

    async fn get_account(&self) -> Result<AccountInfo, VenueError> {
        let body = self
            .request(reqwest::Method::GET, "/fapi/v2/account", "", true)
            .await?;

        let equity = parse_decimal(&body["totalMarginBalance"])?;
        let available = parse_decimal(&body["availableBalance"])?;
        let initial_margin = parse_decimal(&body["totalInitialMargin"])?;
        let margin_health = if equity.is_zero() {
            1.0
        } else {
            use rust_decimal::prelude::ToPrimitive;
            (1.0 - (initial_margin / equity).to_f64().unwrap_or(0.0)).clamp(0.0, 1.0)
        };

        let balances = body["assets"]
            .as_array()
            .map(|assets| {
                assets
                    .iter()
                    .filter_map(|a| {
                        let free = parse_decimal(&a["availableBalance"]).ok()?;
                        let total = parse_decimal(&a["walletBalance"]).ok()?;
                        if total.is_zero() {
                            return None;
                        }
                        Some(BalanceInfo {
                            asset: a["asset"].as_str()?.to_string(),
                            free,
                            locked: total - free,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(AccountInfo {
            equity,
            available,
            margin_health,
            unified_margin: true,
            balances,
        })
    }

    async fn get_positions(&self, symbol: Option<&str>) -> Result<Vec<PositionInfo>, VenueError> {
        let params = symbol.map(|s| format!("symbol={s}")).unwrap_or_default();
        let body = self
            .request(reqwest::Method::GET, "/fapi/v2/positionRisk", &params, true)
            .await?;
        let entries = body
            .as_array()
            .ok_or_else(|| VenueError::Network("positionRisk response not an array".into()))?;

        let mut positions = Vec::new();
        for entry in entries {
            let qty = parse_decimal(&entry["positionAmt"])?;
            if qty.is_zero() {
                continue;
            }
            positions.push(PositionInfo {
                symbol: entry["symbol"].as_str().unwrap_or_default().to_string(),
                qty,
                entry_price: parse_decimal(&entry["entryPrice"])?,
                unrealized_pnl: parse_decimal(&entry["unRealizedProfit"])?,
            });
        }
        Ok(positions)
    }

    async fn get_balance(&self, asset: &str) -> Result<Decimal, VenueError> {
        let account = self.get_account().await?;
        Ok(account
            .balances
            .iter()
            .find(|b| b.asset == asset)
            .map(|b| b.free)
            .unwrap_or_default())
    }

    fn is_unified_margin(&self) -> bool {
        true
    }

    // --- Market data ---------------------------------------------------------

    async fn get_latest_price(&self, symbol: &str) -> Result<Decimal, VenueError> {
        let params = format!("symbol={symbol}");
        let body = self
            .request(reqwest::Method::GET, "/fapi/v1/ticker/price", &params, false)
            .await?;
        parse_decimal(&body["price"])
    }

    async fn get_historical_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Kline>, VenueError> {
        let params = format!("symbol={symbol}&interval={interval}&limit={limit}");
        let body = self
            .request(reqwest::Method::GET, "/fapi/v1/klines", &params, false)
            .await?;

        let rows = body
            .as_array()
            .ok_or_else(|| VenueError::Network("klines response not an array".into()))?;
        let mut klines = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(fields) = row.as_array() else { continue };
            if fields.len() < 7 {
                warn!(len = fields.len(), "skipping malformed kline row");
                continue;
            }
            klines.push(Kline {
                symbol: symbol.to_string(),
                open_time_ms: fields[0].as_i64().unwrap_or(0),
                open: parse_f64(&fields[1])?,
                high: parse_f64(&fields[2])?,
                low: parse_f64(&fields[3])?,
                close: parse_f64(&fields[4])?,
                volume: parse_f64(&fields[5])?,
                close_time_ms: fields[6].as_i64().unwrap_or(0),
                is_closed: true,
            });
        }
        Ok(klines)
    }

    async fn get_funding_rate(&self, symbol: &str) -> Result<FundingRate, VenueError> {
        let params = format!("symbol={symbol}");
        let body = self
            .request(reqwest::Method::GET, "/fapi/v1/premiumIndex", &params, false)
            .await?;
        Ok(FundingRate {
            exchange: self.name().to_string(),
            symbol: symbol.to_string(),
            rate: parse_decimal(&body["lastFundingRate"])?,
            predicted_rate: parse_decimal(&body["lastFundingRate"])?,
            next_funding_time_ms: body["nextFundingTime"].as_i64().unwrap_or(0),
            observed_at: Utc::now(),
        })
    }

    async fn get_funding_rates(&self) -> Result<Vec<FundingRate>, VenueError> {
        let body = self
            .request(reqwest::Method::GET, "/fapi/v1/premiumIndex", "", false)
            .await?;
        let entries = body
            .as_array()
            .ok_or_else(|| VenueError::Network("premiumIndex response not an array".into()))?;
        let now = Utc::now();
        entries
            .iter()
            .map(|entry| {
                Ok(FundingRate {
                    exchange: self.name().to_string(),
                    symbol: entry["symbol"].as_str().unwrap_or_default().to_string(),
                    rate: parse_decimal(&entry["lastFundingRate"])?,
                    predicted_rate: parse_decimal(&entry["lastFundingRate"])?,
                    next_funding_time_ms: entry["nextFundingTime"].as_i64().unwrap_or(0),
                    observed_at: now,
                })
            })
            .collect()
    }

    async fn get_historical_funding_rates(
        &self,
        symbol: &str,
        limit: u32,
    ) -> Result<Vec<FundingRate>, VenueError> {
        let params = format!("symbol={symbol}&limit={limit}");
        let body = self
            .request(reqwest::Method::GET, "/fapi/v1/fundingRate", &params, false)
            .await?;
        let entries = body
            .as_array()
            .ok_or_else(|| VenueError::Network("fundingRate response not an array".into()))?;
        entries
            .iter()
            .map(|entry| {
                let ts = entry["fundingTime"].as_i64().unwrap_or(0);
                Ok(FundingRate {
                    exchange: self.name().to_string(),
                    symbol: symbol.to_string(),
                    rate: parse_decimal(&entry["fundingRate"])?,
                    predicted_rate: parse_decimal(&entry["fundingRate"])?,
                    next_funding_time_ms: ts,
                    observed_at: chrono::DateTime::from_timestamp_millis(ts).unwrap_or_else(Utc::now),
                })
            })
            .collect()
    }

    async fn get_tickers(&self) -> Result<Vec<TickerInfo>, VenueError> {
        let body = self
            .request(reqwest::Method::GET, "/fapi/v1/ticker/24hr", "", false)
            .await?;
        let entries = body
            .as_array()
            .ok_or_else(|| VenueError::Network("ticker response not an array".into()))?;
        entries
            .iter()
            .map(|entry| {
                Ok(TickerInfo {
                    symbol: entry["symbol"].as_str().unwrap_or_default().to_string(),
                    last_price: parse_decimal(&entry["lastPrice"])?,
                    quote_volume_24h: parse_decimal(&entry["quoteVolume"])?,
                })
            })
            .collect()
    }

    async fn get_open_interest(&self, symbol: &str) -> Result<OpenInterestInfo, VenueError> {
        let params = format!("symbol={symbol}");
        let body = self
            .request(reqwest::Method::GET, "/fapi/v1/openInterest", &params, false)
            .await?;
        Ok(OpenInterestInfo {
            symbol: symbol.to_string(),
            open_interest: parse_decimal(&body["openInterest"])?,
            ts_ms: body["time"].as_i64().unwrap_or(0),
        })
    }

    async fn get_symbol_info(&self, symbol: &str) -> Result<SymbolInfo, VenueError> {
        let body = self
            .request(reqwest::Method::GET, "/fapi/v1/exchangeInfo", "", false)
            .await?;
        let entry = body["symbols"]
            .as_array()
            .and_then(|arr| arr.iter().find(|s| s["symbol"].as_str() == Some(symbol)))
            .ok_or_else(|| VenueError::NotFound(format!("symbol {symbol} not in exchangeInfo")))?;
        parse_symbol_info(entry)
    }

    // --- Streams -------------------------------------------------------------

    async fn start_price_stream(
        &self,
        symbols: Vec<String>,
        tx: mpsc::Sender<PriceUpdate>,
        shutdown: Shutdown,
    ) -> Result<(), VenueError> {
        let streams: Vec<String> = symbols
            .iter()
            .map(|s| format!("{}@aggTrade", s.to_lowercase()))
            .collect();
        let url = format!("{}/stream?streams={}", self.ws_url, streams.join("/"));
        let exchange = self.name().to_string();
        self.run_stream(url, shutdown, move |value| {
            let data = &value["data"];
            if data["e"].as_str() != Some("aggTrade") {
                return;
            }
            let Some(price) = data["p"].as_str().and_then(|p| p.parse::<Decimal>().ok()) else {
                return;
            };
            let update = PriceUpdate {
                exchange: exchange.clone(),
                symbol: data["s"].as_str().unwrap_or_default().to_string(),
                price,
                ts_ms: data["T"].as_i64().unwrap_or(0),
            };
            if tx.try_send(update).is_err() {
                debug!("price subscriber full — tick dropped");
            }
        })
        .await;
        Ok(())
    }

    async fn start_order_stream(
        &self,
        tx: mpsc::Sender<OrderUpdate>,
        shutdown: Shutdown,
    ) -> Result<(), VenueError> {
        let exchange = self.name().to_string();
        self.run_user_stream(shutdown, move |value| {
            if value["e"].as_str() != Some("ORDER_TRADE_UPDATE") {
                return;
            }
            let o = &value["o"];
            let Some(update) = parse_order_event(&exchange, o) else {
                warn!("unparseable order event");
                return;
            };
            if tx.try_send(update).is_err() {
                warn!("order subscriber full — execution report dropped");
            }
        })
        .await
    }

    async fn start_kline_stream(
        &self,
        symbols: Vec<String>,
        interval: &str,
        tx: mpsc::Sender<Kline>,
        shutdown: Shutdown,
    ) -> Result<(), VenueError> {
        let streams: Vec<String> = symbols
            .iter()
            .map(|s| format!("{}@kline_{}", s.to_lowercase(), interval))
            .collect();
        let url = format!("{}/stream?streams={}", self.ws_url, streams.join("/"));
        self.run_stream(url, shutdown, move |value| {
            let k = &value["data"]["k"];
            if k.is_null() {
                return;
            }
            let parse = |v: &serde_json::Value| {
                v.as_str().and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0)
            };
            let kline = Kline {
                symbol: k["s"].as_str().unwrap_or_default().to_string(),
                open_time_ms: k["t"].as_i64().unwrap_or(0),
                close_time_ms: k["T"].as_i64().unwrap_or(0),
                open: parse(&k["o"]),
                high: parse(&k["h"]),
                low: parse(&k["l"]),
                close: parse(&k["c"]),
                volume: parse(&k["v"]),
                is_closed: k["x"].as_bool().unwrap_or(false),
            };
            let _ = tx.try_send(kline);
        })
        .await;
        Ok(())
    }

    async fn start_account_stream(
        &self,
        tx: mpsc::Sender<AccountUpdate>,
        shutdown: Shutdown,
    ) -> Result<(), VenueError> {
        let exchange = self.name().to_string();
        self.run_user_stream(shutdown, move |value| {
            if value["e"].as_str() != Some("ACCOUNT_UPDATE") {
                return;
            }
            let balances = value["a"]["B"]
                .as_array()
                .map(|entries| {
                    entries
                        .iter()
                        .filter_map(|b| {
                            Some(BalanceInfo {
                                asset: b["a"].as_str()?.to_string(),
                                free: b["wb"].as_str()?.parse().ok()?,
                                locked: Decimal::ZERO,
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();
            let update = AccountUpdate {
                exchange: exchange.clone(),
                // Health is refreshed from REST by the account monitor; the
                // push event only carries balances.
                margin_health: 1.0,
                balances,
            };
            if tx.try_send(update).is_err() {
                warn!("account subscriber full — update dropped");
            }
        })
        .await
    }

    async fn start_position_stream(
        &self,
        tx: mpsc::Sender<PositionUpdate>,
        shutdown: Shutdown,
    ) -> Result<(), VenueError> {
        let exchange = self.name().to_string();
        self.run_user_stream(shutdown, move |value| {
            if value["e"].as_str() != Some("ACCOUNT_UPDATE") {
                return;
            }
            let Some(positions) = value["a"]["P"].as_array() else { return };
            for p in positions {
                let Some(qty) = p["pa"].as_str().and_then(|s| s.parse::<Decimal>().ok()) else {
                    continue;
                };
                let update = PositionUpdate {
                    exchange: exchange.clone(),
                    symbol: p["s"].as_str().unwrap_or_default().to_string(),
                    qty,
                    entry_price: p["ep"]
                        .as_str()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or_default(),
                };
                if tx.try_send(update).is_err() {
                    warn!("position subscriber full — update dropped");
                }
            }
        })
        .await
    }

    async fn start_funding_rate_stream(
        &self,
        symbols: Vec<String>,
        tx: mpsc::Sender<FundingRate>,
        shutdown: Shutdown,
    ) -> Result<(), VenueError> {
        let streams: Vec<String> = symbols
            .iter()
            .map(|s| format!("{}@markPrice", s.to_lowercase()))
            .collect();
        let url = format!("{}/stream?streams={}", self.ws_url, streams.join("/"));
        let exchange = self.name().to_string();
        self.run_stream(url, shutdown, move |value| {
            let data = &value["data"];
            if data["e"].as_str() != Some("markPriceUpdate") {
                return;
            }
            let Some(rate) = data["r"].as_str().and_then(|s| s.parse::<Decimal>().ok()) else {
                return;
            };
            let update = FundingRate {
                exchange: exchange.clone(),
                symbol: data["s"].as_str().unwrap_or_default().to_string(),
                rate,
                predicted_rate: rate,
                next_funding_time_ms: data["T"].as_i64().unwrap_or(0),
                observed_at: Utc::now(),
            };
            let _ = tx.try_send(update);
        })
        .await;
        Ok(())
    }

    // --- Health --------------------------------------------------------------

    async fn check_health(&self) -> Result<(), VenueError> {
        self.request(reqwest::Method::GET, "/fapi/v1/ping", "", false)
            .await
            .map(|_| ())
    }
}

impl std::fmt::Debug for BinanceFutures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFutures")
            .field("api_key", &self.api_key)
            .field("secret", &self.secret)
            .field("base_url", &self.base_url)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() * 3);
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

/// Strict string-decimal parse; numbers are tolerated via their string form
/// but floats never round-trip through `f64`.
fn parse_decimal(value: &serde_json::Value) -> Result<Decimal, VenueError> {
    let raw = match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        other => {
            return Err(VenueError::InvalidParameter(format!(
                "expected decimal string, got {other}"
            )))
        }
    };
    raw.parse::<Decimal>()
        .map_err(|e| VenueError::InvalidParameter(format!("bad decimal '{raw}': {e}")))
}

fn parse_f64(value: &serde_json::Value) -> Result<f64, VenueError> {
    value
        .as_str()
        .and_then(|s| s.parse::<f64>().ok())
        .or_else(|| value.as_f64())
        .ok_or_else(|| VenueError::InvalidParameter(format!("expected number, got {value}")))
}

fn order_params(req: &OrderRequest) -> Result<String, VenueError> {
    let mut params = format!(
        "symbol={}&side={}&quantity={}",
        req.symbol, req.side, req.quantity
    );
    match req.order_type {
        OrderType::Limit => {
            let price = req
                .price
                .ok_or_else(|| VenueError::InvalidParameter("limit order without price".into()))?;
            // GTX = post-only on Binance futures.
            let tif = if req.post_only {
                "GTX"
            } else {
                match req.time_in_force {
                    TimeInForce::Gtc => "GTC",
                    TimeInForce::Ioc => "IOC",
                }
            };
            params.push_str(&format!("&type=LIMIT&price={price}&timeInForce={tif}"));
        }
        OrderType::Market => params.push_str("&type=MARKET"),
    }
    if req.reduce_only {
        params.push_str("&reduceOnly=true");
    }
    if !req.client_order_id.is_empty() {
        params.push_str(&format!("&newClientOrderId={}", req.client_order_id));
    }
    Ok(params)
}

fn order_json(req: &OrderRequest) -> Result<serde_json::Value, VenueError> {
    let mut obj = serde_json::json!({
        "symbol": req.symbol,
        "side": req.side.to_string(),
        "quantity": req.quantity.to_string(),
        "newClientOrderId": req.client_order_id,
    });
    match req.order_type {
        OrderType::Limit => {
            let price = req
                .price
                .ok_or_else(|| VenueError::InvalidParameter("limit order without price".into()))?;
            obj["type"] = "LIMIT".into();
            obj["price"] = price.to_string().into();
            obj["timeInForce"] = if req.post_only {
                "GTX".into()
            } else {
                match req.time_in_force {
                    TimeInForce::Gtc => "GTC".into(),
                    TimeInForce::Ioc => "IOC".into(),
                }
            };
        }
        OrderType::Market => obj["type"] = "MARKET".into(),
    }
    if req.reduce_only {
        obj["reduceOnly"] = "true".into();
    }
    Ok(obj)
}

fn parse_side(raw: &str) -> Side {
    if raw == "SELL" {
        Side::Sell
    } else {
        Side::Buy
    }
}

fn parse_status(raw: &str) -> OrderStatus {
    match raw {
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" => OrderStatus::Canceled,
        "REJECTED" => OrderStatus::Rejected,
        "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Expired,
        _ => OrderStatus::New,
    }
}

fn parse_order(body: &serde_json::Value) -> Result<VenueOrder, VenueError> {
    Ok(VenueOrder {
        order_id: body["orderId"]
            .as_u64()
            .ok_or_else(|| VenueError::Network("orderId missing".into()))?,
        client_order_id: body["clientOrderId"].as_str().unwrap_or_default().to_string(),
        symbol: body["symbol"].as_str().unwrap_or_default().to_string(),
        side: parse_side(body["side"].as_str().unwrap_or("BUY")),
        price: parse_decimal(&body["price"]).unwrap_or_default(),
        orig_qty: parse_decimal(&body["origQty"]).unwrap_or_default(),
        executed_qty: parse_decimal(&body["executedQty"]).unwrap_or_default(),
        status: parse_status(body["status"].as_str().unwrap_or("NEW")),
        update_time_ms: body["updateTime"].as_i64().unwrap_or(0),
    })
}

fn parse_order_event(exchange: &str, o: &serde_json::Value) -> Option<OrderUpdate> {
    Some(OrderUpdate {
        exchange: exchange.to_string(),
        symbol: o["s"].as_str()?.to_string(),
        order_id: o["i"].as_u64()?,
        client_order_id: o["c"].as_str().unwrap_or_default().to_string(),
        side: parse_side(o["S"].as_str()?),
        price: o["p"].as_str()?.parse().ok()?,
        status: parse_status(o["X"].as_str()?),
        last_executed_qty: o["l"].as_str()?.parse().ok()?,
        cum_executed_qty: o["z"].as_str()?.parse().ok()?,
        ts_ms: o["T"].as_i64().unwrap_or(0),
    })
}

fn parse_symbol_info(entry: &serde_json::Value) -> Result<SymbolInfo, VenueError> {
    let mut tick_size = Decimal::ZERO;
    let mut step_size = Decimal::ZERO;
    let mut min_notional = Decimal::ZERO;
    if let Some(filters) = entry["filters"].as_array() {
        for filter in filters {
            match filter["filterType"].as_str() {
                Some("PRICE_FILTER") => tick_size = parse_decimal(&filter["tickSize"])?,
                Some("LOT_SIZE") => step_size = parse_decimal(&filter["stepSize"])?,
                Some("MIN_NOTIONAL") => {
                    min_notional = parse_decimal(&filter["notional"]).unwrap_or_default()
                }
                _ => {}
            }
        }
    }
    Ok(SymbolInfo {
        symbol: entry["symbol"].as_str().unwrap_or_default().to_string(),
        base_asset: entry["baseAsset"].as_str().unwrap_or_default().to_string(),
        quote_asset: entry["quoteAsset"].as_str().unwrap_or_default().to_string(),
        tick_size,
        step_size,
        price_decimals: entry["pricePrecision"].as_u64().unwrap_or(2) as u32,
        qty_decimals: entry["quantityPrecision"].as_u64().unwrap_or(3) as u32,
        min_notional,
    })
}

/// Map an HTTP status + Binance error body into the venue taxonomy.
fn map_error(status: u16, body: &serde_json::Value) -> VenueError {
    let code = body["code"].as_i64().unwrap_or(0);
    let msg = body["msg"].as_str().unwrap_or("unknown error");
    let detail = format!("code {code}: {msg}");

    match code {
        -2019 | -2018 => return VenueError::InsufficientFunds(detail),
        -2011 | -2013 => return VenueError::NotFound(detail),
        -2010 if msg.contains("Duplicate") => return VenueError::Duplicate(detail),
        -5022 | -2010 if msg.contains("immediately match") => {
            return VenueError::OrderRejected(format!("post-only would cross ({detail})"))
        }
        -2010 | -4164 => return VenueError::OrderRejected(detail),
        -1021 => return VenueError::TimestampOutOfBounds(detail),
        -1022 | -2014 | -2015 => return VenueError::Auth(detail),
        -1003 => return VenueError::RateLimited(detail),
        -1102..=-1100 | -1111 | -1121 => return VenueError::InvalidParameter(detail),
        _ => {}
    }

    match status {
        401 | 403 => VenueError::Auth(detail),
        404 => VenueError::NotFound(detail),
        418 | 429 => VenueError::RateLimited(detail),
        503 => VenueError::Maintenance(detail),
        500..=599 => VenueError::Overload(detail),
        _ => VenueError::OrderRejected(detail),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn error_mapping_covers_taxonomy() {
        let body = |code: i64, msg: &str| serde_json::json!({ "code": code, "msg": msg });

        assert!(matches!(
            map_error(400, &body(-2019, "Margin is insufficient.")),
            VenueError::InsufficientFunds(_)
        ));
        assert!(matches!(
            map_error(400, &body(-1021, "Timestamp outside recvWindow.")),
            VenueError::TimestampOutOfBounds(_)
        ));
        assert!(matches!(
            map_error(400, &body(-2015, "Invalid API-key.")),
            VenueError::Auth(_)
        ));
        assert!(matches!(
            map_error(429, &body(0, "Too many requests.")),
            VenueError::RateLimited(_)
        ));
        assert!(matches!(
            map_error(503, &body(0, "Service unavailable.")),
            VenueError::Maintenance(_)
        ));
        assert!(matches!(
            map_error(500, &body(0, "Internal error.")),
            VenueError::Overload(_)
        ));
    }

    #[test]
    fn post_only_rejection_carries_marker() {
        let body = serde_json::json!({
            "code": -5022,
            "msg": "Due to the order could not be executed as maker, the Post Only order will be rejected.",
        });
        let err = map_error(400, &body);
        assert!(err.is_post_only_cross());
    }

    #[test]
    fn parse_order_reads_string_decimals() {
        let body = serde_json::json!({
            "orderId": 283194212,
            "clientOrderId": "44990_B_1700000000001",
            "symbol": "BTCUSDT",
            "side": "BUY",
            "price": "44990.00",
            "origQty": "0.010",
            "executedQty": "0.004",
            "status": "PARTIALLY_FILLED",
            "updateTime": 1700000000123i64,
        });
        let order = parse_order(&body).unwrap();
        assert_eq!(order.order_id, 283194212);
        assert_eq!(order.price, dec!(44990.00));
        assert_eq!(order.orig_qty, dec!(0.010));
        assert_eq!(order.executed_qty, dec!(0.004));
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.side, Side::Buy);
    }

    #[test]
    fn parse_symbol_info_extracts_filters() {
        let entry = serde_json::json!({
            "symbol": "BTCUSDT",
            "baseAsset": "BTC",
            "quoteAsset": "USDT",
            "pricePrecision": 2,
            "quantityPrecision": 3,
            "filters": [
                { "filterType": "PRICE_FILTER", "tickSize": "0.10" },
                { "filterType": "LOT_SIZE", "stepSize": "0.001" },
                { "filterType": "MIN_NOTIONAL", "notional": "100" },
            ],
        });
        let info = parse_symbol_info(&entry).unwrap();
        assert_eq!(info.tick_size, dec!(0.10));
        assert_eq!(info.step_size, dec!(0.001));
        assert_eq!(info.min_notional, dec!(100));
        assert_eq!(info.price_decimals, 2);
        assert_eq!(info.qty_decimals, 3);
    }

    #[test]
    fn order_params_post_only_uses_gtx() {
        let mut req = OrderRequest::limit("BTCUSDT", Side::Buy, dec!(44990), dec!(0.01), "coid");
        req.post_only = true;
        let params = order_params(&req).unwrap();
        assert!(params.contains("timeInForce=GTX"));
        assert!(params.contains("price=44990"));
        assert!(params.contains("newClientOrderId=coid"));
    }

    #[test]
    fn order_event_parses_execution_report() {
        let o = serde_json::json!({
            "s": "BTCUSDT",
            "i": 42u64,
            "c": "44990_B_1700000000001",
            "S": "BUY",
            "p": "44990.00",
            "X": "FILLED",
            "l": "0.010",
            "z": "0.010",
            "T": 1700000000123i64,
        });
        let update = parse_order_event("binance-futures", &o).unwrap();
        assert_eq!(update.order_id, 42);
        assert_eq!(update.cum_executed_qty, dec!(0.010));
        assert_eq!(update.status, OrderStatus::Filled);
    }

    #[test]
    fn urlencode_escapes_json() {
        assert_eq!(urlencode("[1,2]"), "%5B1%2C2%5D");
        assert_eq!(urlencode("abc-_.~"), "abc-_.~");
    }

    #[test]
    fn debug_redacts_credentials() {
        let venue = BinanceFutures::new(
            Secret::new("ak-live-a1b2c3"),
            Secret::new("sk-live-d4e5f6"),
        );
        let rendered = format!("{venue:?}");
        assert!(!rendered.contains("ak-live-a1b2c3"));
        assert!(!rendered.contains("sk-live-d4e5f6"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
