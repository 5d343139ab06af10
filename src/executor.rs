// =============================================================================
// Order Executor — rate-limited, retrying order placement and cancellation
// =============================================================================
//
// Policy implemented here:
//   - Token-bucket rate limiting shared per venue across engines (25/s,
//     burst 30 by default), with bounded waiters and cancellation support.
//   - Jittered exponential backoff for transient errors (100 ms, ×2, cap 2 s,
//     3 attempts by default).
//   - Post-only degradation: after 3 consecutive "post-only would cross"
//     rejections on the same slot, the next attempt drops the flag.
//   - Margin lock: "insufficient margin" on any request blocks all new
//     placements for `margin_lock_secs`.
//   - Batch cancel chunking (20 per venue call) with per-order fallback when
//     the venue rejects the batch outright.
//
// Client order ids are `{price_int}_{B|S}_{unix_sec}{3-digit seq}` with an
// optional broker prefix, capped at the venue's id length.
// =============================================================================

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::Decimal;
use tokio::time::{sleep, timeout, Duration, Instant};
use tracing::{debug, warn};

use crate::config::ExecutorConfig;
use crate::types::{Shutdown, Side, VenueError};
use crate::venue::{OrderRequest, Venue, VenueOrder};

/// Post-only rejections tolerated before the flag is dropped once.
pub const POST_ONLY_DEGRADE_AFTER: u32 = 3;

/// Waiters allowed to queue on the rate limiter before it sheds load.
const MAX_RATE_LIMIT_WAITERS: usize = 64;

// ---------------------------------------------------------------------------
// Client order ids
// ---------------------------------------------------------------------------

/// Parsed form of a client order id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedClientOrderId {
    pub price_int: i64,
    pub side: Side,
    pub unix_sec: i64,
    pub seq: u32,
}

/// Build `{prefix}{price_int}_{B|S}_{unix_sec}{seq:03}` capped at `max_len`.
///
/// When the prefixed id would exceed the venue cap the prefix is dropped; the
/// unprefixed form is always within any supported cap.
pub fn generate_client_order_id(
    prefix: &str,
    price: Decimal,
    side: Side,
    unix_sec: i64,
    seq: u32,
    max_len: usize,
) -> String {
    let core = format!("{}_{}_{}{:03}", price.trunc(), side.tag(), unix_sec, seq % 1000);
    let full = format!("{prefix}{core}");
    if full.len() <= max_len {
        full
    } else {
        core
    }
}

/// Parse a client order id back into price, side, timestamp, and sequence.
pub fn parse_client_order_id(id: &str, prefix: &str) -> Option<ParsedClientOrderId> {
    let id = id.strip_prefix(prefix).unwrap_or(id);
    let mut parts = id.split('_');
    let price_int: i64 = parts.next()?.parse().ok()?;
    let side = match parts.next()? {
        "B" => Side::Buy,
        "S" => Side::Sell,
        _ => return None,
    };
    let tail = parts.next()?;
    if parts.next().is_some() || tail.len() <= 3 {
        return None;
    }
    let (sec_str, seq_str) = tail.split_at(tail.len() - 3);
    Some(ParsedClientOrderId {
        price_int,
        side,
        unix_sec: sec_str.parse().ok()?,
        seq: seq_str.parse().ok()?,
    })
}

// ---------------------------------------------------------------------------
// Token-bucket rate limiter
// ---------------------------------------------------------------------------

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket shared per venue. The only global mutable resource across
/// engines, so waiting is bounded and honours cancellation.
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    rate_per_sec: f64,
    burst: f64,
    waiters: AtomicUsize,
}

impl RateLimiter {
    pub fn new(rate_per_sec: u32, burst: u32) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
            rate_per_sec: rate_per_sec as f64,
            burst: burst as f64,
            waiters: AtomicUsize::new(0),
        }
    }

    fn try_take(&self) -> Result<(), Duration> {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - bucket.tokens;
            Err(Duration::from_secs_f64(deficit / self.rate_per_sec))
        }
    }

    /// Take one token, waiting as needed. Fails fast when the waiter queue is
    /// saturated or shutdown fires mid-wait.
    pub async fn acquire(&self, shutdown: &Shutdown) -> Result<(), VenueError> {
        let mut waiting = false;
        loop {
            match self.try_take() {
                Ok(()) => {
                    if waiting {
                        self.waiters.fetch_sub(1, Ordering::Relaxed);
                    }
                    return Ok(());
                }
                Err(wait) => {
                    if !waiting {
                        let queued = self.waiters.fetch_add(1, Ordering::Relaxed);
                        if queued >= MAX_RATE_LIMIT_WAITERS {
                            self.waiters.fetch_sub(1, Ordering::Relaxed);
                            return Err(VenueError::RateLimited(
                                "local rate limiter waiter queue full".into(),
                            ));
                        }
                        waiting = true;
                    }
                    let mut sd = shutdown.clone();
                    tokio::select! {
                        _ = sleep(wait) => {}
                        _ = sd.cancelled() => {
                            self.waiters.fetch_sub(1, Ordering::Relaxed);
                            return Err(VenueError::Network("cancelled while rate limited".into()));
                        }
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Per-engine view over a shared venue and its shared rate limiter.
pub struct OrderExecutor {
    venue: Arc<dyn Venue>,
    limiter: Arc<RateLimiter>,
    cfg: ExecutorConfig,
    margin_locked_until: Mutex<Option<Instant>>,
    seq: AtomicU32,
}

impl OrderExecutor {
    pub fn new(venue: Arc<dyn Venue>, limiter: Arc<RateLimiter>, cfg: ExecutorConfig) -> Self {
        Self {
            venue,
            limiter,
            cfg,
            margin_locked_until: Mutex::new(None),
            seq: AtomicU32::new(0),
        }
    }

    pub fn venue(&self) -> &Arc<dyn Venue> {
        &self.venue
    }

    /// Next idempotency key for an order on this executor.
    pub fn next_client_order_id(&self, price: Decimal, side: Side) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        generate_client_order_id(
            &self.cfg.broker_prefix,
            price,
            side,
            chrono::Utc::now().timestamp(),
            seq,
            self.cfg.max_client_order_id_len,
        )
    }

    // -------------------------------------------------------------------------
    // Margin lock
    // -------------------------------------------------------------------------

    /// While locked, no new placements are attempted.
    pub fn margin_locked(&self) -> bool {
        self.margin_locked_until
            .lock()
            .map_or(false, |until| Instant::now() < until)
    }

    fn set_margin_lock(&self) {
        let until = Instant::now() + Duration::from_secs(self.cfg.margin_lock_secs);
        *self.margin_locked_until.lock() = Some(until);
        warn!(
            lock_secs = self.cfg.margin_lock_secs,
            "insufficient margin — placement locked"
        );
    }

    // -------------------------------------------------------------------------
    // Single-order operations
    // -------------------------------------------------------------------------

    /// Place one order with rate limiting, per-call deadline, and retry on
    /// transient errors.
    ///
    /// `post_only_failures` is the slot's consecutive would-cross count; at
    /// [`POST_ONLY_DEGRADE_AFTER`] the post-only flag is dropped for this
    /// attempt.
    pub async fn place_order(
        &self,
        mut req: OrderRequest,
        post_only_failures: u32,
        shutdown: &Shutdown,
    ) -> Result<VenueOrder, VenueError> {
        if self.margin_locked() {
            return Err(VenueError::InsufficientFunds("margin lock active".into()));
        }
        if req.post_only && post_only_failures >= POST_ONLY_DEGRADE_AFTER {
            debug!(
                client_order_id = %req.client_order_id,
                failures = post_only_failures,
                "degrading post-only after repeated would-cross rejections"
            );
            req.post_only = false;
        }

        let result = self
            .call_with_retry(shutdown, "place_order", || self.venue.place_order(&req))
            .await;

        if let Err(VenueError::InsufficientFunds(_)) = &result {
            self.set_margin_lock();
        }
        result
    }

    /// Cancel one order with the same rate-limit/retry envelope.
    pub async fn cancel_order(
        &self,
        symbol: &str,
        order_id: u64,
        shutdown: &Shutdown,
    ) -> Result<VenueOrder, VenueError> {
        self.call_with_retry(shutdown, "cancel_order", || {
            self.venue.cancel_order(symbol, order_id)
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Batch operations
    // -------------------------------------------------------------------------

    /// Place a batch; one failure never aborts the rest. Insufficient margin
    /// on any request engages the margin lock.
    pub async fn batch_place(
        &self,
        reqs: Vec<OrderRequest>,
        shutdown: &Shutdown,
    ) -> Vec<Result<VenueOrder, VenueError>> {
        if reqs.is_empty() {
            return Vec::new();
        }
        if self.margin_locked() {
            return reqs
                .iter()
                .map(|_| Err(VenueError::InsufficientFunds("margin lock active".into())))
                .collect();
        }

        for _ in &reqs {
            if let Err(e) = self.limiter.acquire(shutdown).await {
                return reqs.iter().map(|_| Err(e.clone())).collect();
            }
        }

        let deadline = Duration::from_secs(self.cfg.network_deadline_secs);
        let results = match timeout(deadline, self.venue.batch_place_orders(&reqs)).await {
            Ok(Ok(results)) => results,
            Ok(Err(e)) => reqs.iter().map(|_| Err(e.clone())).collect(),
            Err(_) => reqs
                .iter()
                .map(|_| Err(VenueError::Network("batch place deadline exceeded".into())))
                .collect(),
        };

        if results
            .iter()
            .any(|r| matches!(r, Err(VenueError::InsufficientFunds(_))))
        {
            self.set_margin_lock();
        }
        results
    }

    /// Cancel orders in venue-sized chunks, falling back to per-order
    /// cancellation when the venue rejects a whole chunk.
    pub async fn batch_cancel(
        &self,
        symbol: &str,
        order_ids: &[u64],
        shutdown: &Shutdown,
    ) -> Vec<Result<u64, VenueError>> {
        let mut results = Vec::with_capacity(order_ids.len());
        for chunk in order_ids.chunks(self.cfg.cancel_chunk_size.max(1)) {
            if let Err(e) = self.limiter.acquire(shutdown).await {
                results.extend(chunk.iter().map(|_| Err(e.clone())));
                continue;
            }
            let deadline = Duration::from_secs(self.cfg.network_deadline_secs);
            match timeout(deadline, self.venue.batch_cancel_orders(symbol, chunk)).await {
                Ok(Ok(chunk_results)) => results.extend(chunk_results),
                Ok(Err(batch_err)) => {
                    warn!(
                        error = %batch_err,
                        chunk_len = chunk.len(),
                        "batch cancel rejected — falling back to per-order cancels"
                    );
                    for &order_id in chunk {
                        results.push(
                            self.cancel_order(symbol, order_id, shutdown)
                                .await
                                .map(|o| o.order_id),
                        );
                    }
                }
                Err(_) => {
                    results.extend(chunk.iter().map(|_| {
                        Err(VenueError::Network("batch cancel deadline exceeded".into()))
                    }));
                }
            }
        }
        results
    }

    // -------------------------------------------------------------------------
    // Retry envelope
    // -------------------------------------------------------------------------

    async fn call_with_retry<'a, T, F, Fut>(
        &'a self,
        shutdown: &Shutdown,
        op: &'static str,
        f: F,
    ) -> Result<T, VenueError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, VenueError>> + 'a,
    {
        let deadline = Duration::from_secs(self.cfg.network_deadline_secs);
        let mut attempt: u32 = 0;

        loop {
            self.limiter.acquire(shutdown).await?;

            let result = match timeout(deadline, f()).await {
                Ok(result) => result,
                Err(_) => Err(VenueError::Network(format!("{op} deadline exceeded"))),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < self.cfg.retry_max_attempts => {
                    attempt += 1;
                    let backoff = self.backoff_delay(attempt);
                    debug!(op, attempt, backoff_ms = backoff.as_millis() as u64, error = %err, "retrying venue call");
                    let mut sd = shutdown.clone();
                    tokio::select! {
                        _ = sleep(backoff) => {}
                        _ = sd.cancelled() => {
                            return Err(VenueError::Network(format!("{op} cancelled during backoff")));
                        }
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Exponential backoff with up to 50 % random jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self
            .cfg
            .retry_initial_ms
            .saturating_mul(1u64 << (attempt - 1).min(16))
            .min(self.cfg.retry_cap_ms);
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        Duration::from_millis(base + jitter)
    }
}

impl std::fmt::Debug for OrderExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderExecutor")
            .field("venue", &self.venue.name())
            .field("margin_locked", &self.margin_locked())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ShutdownController;
    use crate::venue::paper::PaperVenue;
    use rust_decimal_macros::dec;

    fn executor(venue: Arc<PaperVenue>) -> OrderExecutor {
        let cfg = ExecutorConfig::default();
        let limiter = Arc::new(RateLimiter::new(cfg.orders_per_sec, cfg.order_burst));
        OrderExecutor::new(venue, limiter, cfg)
    }

    fn paper() -> Arc<PaperVenue> {
        let v = Arc::new(PaperVenue::new("paper", true));
        v.set_price("BTCUSDT", dec!(45000));
        v
    }

    // ---- client order ids -------------------------------------------------

    #[test]
    fn client_order_id_roundtrip() {
        let id = generate_client_order_id("", dec!(44990), Side::Buy, 1_700_000_000, 7, 36);
        assert_eq!(id, "44990_B_1700000000007");
        let parsed = parse_client_order_id(&id, "").unwrap();
        assert_eq!(parsed.price_int, 44990);
        assert_eq!(parsed.side, Side::Buy);
        assert_eq!(parsed.unix_sec, 1_700_000_000);
        assert_eq!(parsed.seq, 7);
    }

    #[test]
    fn client_order_id_broker_prefix() {
        let id = generate_client_order_id("x-MRDN10ab", dec!(45010), Side::Sell, 1_700_000_000, 999, 36);
        assert!(id.starts_with("x-MRDN10ab"));
        let parsed = parse_client_order_id(&id, "x-MRDN10ab").unwrap();
        assert_eq!(parsed.price_int, 45010);
        assert_eq!(parsed.side, Side::Sell);
        assert_eq!(parsed.seq, 999);
    }

    #[test]
    fn client_order_id_drops_prefix_when_over_cap() {
        let id = generate_client_order_id("x-MRDN10ab", dec!(44990), Side::Buy, 1_700_000_000, 1, 21);
        assert_eq!(id, "44990_B_1700000000001");
        assert!(id.len() <= 21);
    }

    #[test]
    fn client_order_id_sequence_wraps_to_three_digits() {
        let id = generate_client_order_id("", dec!(100), Side::Buy, 1_700_000_000, 1234, 36);
        let parsed = parse_client_order_id(&id, "").unwrap();
        assert_eq!(parsed.seq, 234);
    }

    #[test]
    fn parse_rejects_malformed_ids() {
        assert!(parse_client_order_id("garbage", "").is_none());
        assert!(parse_client_order_id("100_X_1700000000001", "").is_none());
        assert!(parse_client_order_id("100_B_12", "").is_none());
    }

    // ---- rate limiter -----------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_allows_burst_then_throttles() {
        let limiter = RateLimiter::new(10, 5);
        let (_ctl, shutdown) = ShutdownController::new();

        // Burst drains instantly.
        for _ in 0..5 {
            limiter.acquire(&shutdown).await.unwrap();
        }
        // Next token requires ~100 ms of refill; paused clock auto-advances.
        let start = Instant::now();
        limiter.acquire(&shutdown).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn rate_limiter_cancellation() {
        let limiter = RateLimiter::new(1, 1);
        let (ctl, shutdown) = ShutdownController::new();
        limiter.acquire(&shutdown).await.unwrap();
        ctl.shutdown();
        let err = limiter.acquire(&shutdown).await.unwrap_err();
        assert!(matches!(err, VenueError::Network(_)));
    }

    // ---- placement --------------------------------------------------------

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let venue = paper();
        venue.inject_failure("place_order", VenueError::Network("blip".into()));
        let exec = executor(venue.clone());
        let (_ctl, shutdown) = ShutdownController::new();

        let req = OrderRequest::limit("BTCUSDT", Side::Buy, dec!(44990), dec!(0.01), "r1");
        let order = exec.place_order(req, 0, &shutdown).await.unwrap();
        assert_eq!(order.price, dec!(44990));
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let venue = paper();
        for _ in 0..5 {
            venue.inject_failure("place_order", VenueError::Network("down".into()));
        }
        let exec = executor(venue);
        let (_ctl, shutdown) = ShutdownController::new();

        let req = OrderRequest::limit("BTCUSDT", Side::Buy, dec!(44990), dec!(0.01), "r2");
        let err = exec.place_order(req, 0, &shutdown).await.unwrap_err();
        assert!(matches!(err, VenueError::Network(_)));
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_fast() {
        let venue = paper();
        venue.inject_failure("place_order", VenueError::Auth("bad key".into()));
        let exec = executor(venue.clone());
        let (_ctl, shutdown) = ShutdownController::new();

        let req = OrderRequest::limit("BTCUSDT", Side::Buy, dec!(44990), dec!(0.01), "r3");
        let err = exec.place_order(req.clone(), 0, &shutdown).await.unwrap_err();
        assert!(matches!(err, VenueError::Auth(_)));
        // The injected failure was consumed exactly once — no retries burned.
        assert!(exec.place_order(req, 0, &shutdown).await.is_ok());
    }

    #[tokio::test]
    async fn post_only_degrades_after_three_failures() {
        let venue = paper();
        let exec = executor(venue.clone());
        let (_ctl, shutdown) = ShutdownController::new();

        // A crossing post-only buy: rejected while failures < 3.
        let mut req = OrderRequest::limit("BTCUSDT", Side::Buy, dec!(45010), dec!(0.01), "po1");
        req.post_only = true;

        let err = exec.place_order(req.clone(), 2, &shutdown).await.unwrap_err();
        assert!(err.is_post_only_cross());

        // At 3 consecutive failures the flag is dropped and the order rests.
        req.client_order_id = "po2".into();
        let order = exec.place_order(req, 3, &shutdown).await.unwrap();
        assert_eq!(order.price, dec!(45010));
    }

    #[tokio::test]
    async fn insufficient_margin_sets_lock() {
        let venue = paper();
        venue.inject_failure(
            "place_order",
            VenueError::InsufficientFunds("margin exhausted".into()),
        );
        let exec = executor(venue);
        let (_ctl, shutdown) = ShutdownController::new();

        let req = OrderRequest::limit("BTCUSDT", Side::Buy, dec!(44990), dec!(0.01), "m1");
        let err = exec.place_order(req.clone(), 0, &shutdown).await.unwrap_err();
        assert!(matches!(err, VenueError::InsufficientFunds(_)));
        assert!(exec.margin_locked());

        // Subsequent placements are refused locally without touching the venue.
        let err = exec.place_order(req, 0, &shutdown).await.unwrap_err();
        assert!(matches!(err, VenueError::InsufficientFunds(_)));
    }

    #[tokio::test]
    async fn batch_place_margin_failure_locks_but_batch_completes() {
        let venue = paper();
        venue.inject_failure(
            "place_order",
            VenueError::InsufficientFunds("margin exhausted".into()),
        );
        let exec = executor(venue);
        let (_ctl, shutdown) = ShutdownController::new();

        let reqs = vec![
            OrderRequest::limit("BTCUSDT", Side::Buy, dec!(44990), dec!(0.01), "b1"),
            OrderRequest::limit("BTCUSDT", Side::Buy, dec!(44980), dec!(0.01), "b2"),
        ];
        let results = exec.batch_place(reqs, &shutdown).await;
        assert_eq!(results.len(), 2);
        // First failed on margin, second went through — no abort.
        assert!(results[0].is_err());
        assert!(results[1].is_ok());
        assert!(exec.margin_locked());
    }

    #[tokio::test]
    async fn batch_cancel_chunks_and_falls_back() {
        let venue = paper();
        let exec = executor(venue.clone());
        let (_ctl, shutdown) = ShutdownController::new();

        let mut ids = Vec::new();
        for i in 0..3 {
            let req = OrderRequest::limit(
                "BTCUSDT",
                Side::Buy,
                dec!(44990) - Decimal::from(i * 10),
                dec!(0.01),
                format!("c{i}"),
            );
            ids.push(exec.place_order(req, 0, &shutdown).await.unwrap().order_id);
        }

        // Whole-batch rejection forces the per-order fallback path.
        venue.inject_failure(
            "batch_cancel_orders",
            VenueError::OrderRejected("batch refused".into()),
        );
        let results = exec.batch_cancel("BTCUSDT", &ids, &shutdown).await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(venue.open_order_count(), 0);
    }
}
