// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

// ---------------------------------------------------------------------------
// Order side
// ---------------------------------------------------------------------------

/// Side of an order or position leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The opposite side (used for compensation orders and position closes).
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Single-letter tag used inside client order ids.
    pub fn tag(self) -> char {
        match self {
            Self::Buy => 'B',
            Self::Sell => 'S',
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            other => anyhow::bail!("unknown order side: {other}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Operational modes
// ---------------------------------------------------------------------------

/// Whether the engine is actively trading, paused, or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// Whether we are running against real funds or the in-process paper venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Paper,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => write!(f, "Paper"),
            Self::Live => write!(f, "Live"),
        }
    }
}

// ---------------------------------------------------------------------------
// Venue error taxonomy
// ---------------------------------------------------------------------------

/// Classified failure surfaced by a venue adapter.
///
/// Every adapter maps its raw error codes into this taxonomy so that the
/// executor, reconciler, and two-leg engine can apply uniform retry and
/// interlock policy without knowing venue specifics.
#[derive(Debug, Clone, thiserror::Error)]
pub enum VenueError {
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("order rejected: {0}")]
    OrderRejected(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("authentication failure: {0}")]
    Auth(String),
    #[error("venue under maintenance: {0}")]
    Maintenance(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("duplicate client order id: {0}")]
    Duplicate(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("venue overloaded: {0}")]
    Overload(String),
    #[error("timestamp out of bounds: {0}")]
    TimestampOutOfBounds(String),
}

impl VenueError {
    /// Transient failures that the executor may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::RateLimited(_) | Self::Overload(_) | Self::TimestampOutOfBounds(_)
        )
    }

    /// Post-only rejections are reported as `OrderRejected` with a marker the
    /// adapters agree on; the executor uses this to drive degradation.
    pub fn is_post_only_cross(&self) -> bool {
        matches!(self, Self::OrderRejected(msg) if msg.contains("post-only"))
    }
}

// ---------------------------------------------------------------------------
// Secrets
// ---------------------------------------------------------------------------

/// Wrapper for API keys and signing secrets.
///
/// Every textual rendering — `Debug`, `Display`, and serde — emits the
/// constant `[REDACTED]`. The raw value is only reachable via [`Secret::expose`].
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the underlying value. Call sites are the only audit surface.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for Secret {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self(raw))
    }
}

// ---------------------------------------------------------------------------
// Shutdown handle
// ---------------------------------------------------------------------------

/// Cancellation context passed to every handler and stream task.
///
/// Cloning is cheap; all clones observe the same signal. Network calls race
/// against [`Shutdown::cancelled`] via `tokio::select!` so that an in-flight
/// action list aborts promptly on shutdown.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Owning side of the shutdown signal, held by `main`.
pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

impl ShutdownController {
    pub fn new() -> (Self, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, Shutdown { rx })
    }

    /// Signal every holder of a [`Shutdown`] clone to stop.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

impl Shutdown {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is signalled. Safe to call repeatedly.
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                // Controller dropped — treat as shutdown.
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Balances
// ---------------------------------------------------------------------------

/// Balance snapshot for a single asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub free: Decimal,
    #[serde(default)]
    pub locked: Decimal,
}

// ---------------------------------------------------------------------------
// Decimal rounding helpers
// ---------------------------------------------------------------------------

/// Round `price` to the nearest multiple of `tick`.
pub fn round_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick.is_zero() {
        return price;
    }
    ((price / tick).round() * tick).normalize()
}

/// Round `qty` down to a multiple of `step` (quantities never round up, which
/// could exceed a balance or position).
pub fn round_down_to_step(qty: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return qty;
    }
    ((qty / step).floor() * step).normalize()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn side_opposite_and_tag() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
        assert_eq!(Side::Buy.tag(), 'B');
        assert_eq!(Side::Sell.tag(), 'S');
    }

    #[test]
    fn side_parse_roundtrip() {
        assert_eq!("BUY".parse::<Side>().unwrap(), Side::Buy);
        assert_eq!("sell".parse::<Side>().unwrap(), Side::Sell);
        assert!("HOLD".parse::<Side>().is_err());
    }

    #[test]
    fn secret_never_leaks_in_text() {
        let s = Secret::new("sk-very-private");
        assert_eq!(format!("{s}"), "[REDACTED]");
        assert_eq!(format!("{s:?}"), "[REDACTED]");
        let json = serde_json::to_string(&s).unwrap();
        assert_eq!(json, "\"[REDACTED]\"");
        assert_eq!(s.expose(), "sk-very-private");
    }

    #[test]
    fn venue_error_retry_classification() {
        assert!(VenueError::Network("timeout".into()).is_retryable());
        assert!(VenueError::RateLimited("429".into()).is_retryable());
        assert!(VenueError::Overload("busy".into()).is_retryable());
        assert!(!VenueError::InsufficientFunds("margin".into()).is_retryable());
        assert!(!VenueError::Auth("bad key".into()).is_retryable());
    }

    #[test]
    fn post_only_cross_marker() {
        let err = VenueError::OrderRejected("post-only would cross".into());
        assert!(err.is_post_only_cross());
        let other = VenueError::OrderRejected("price out of band".into());
        assert!(!other.is_post_only_cross());
    }

    #[test]
    fn round_to_tick_snaps_to_grid() {
        assert_eq!(round_to_tick(dec!(45003.7), dec!(10)), dec!(45000));
        assert_eq!(round_to_tick(dec!(45006.2), dec!(10)), dec!(45010));
        assert_eq!(round_to_tick(dec!(0.12349), dec!(0.0001)), dec!(0.1235));
    }

    #[test]
    fn round_down_to_step_never_rounds_up() {
        assert_eq!(round_down_to_step(dec!(0.0199), dec!(0.01)), dec!(0.01));
        assert_eq!(round_down_to_step(dec!(1.999), dec!(0.001)), dec!(1.999));
        assert_eq!(round_down_to_step(dec!(0.009), dec!(0.01)), dec!(0));
    }

    #[tokio::test]
    async fn shutdown_signal_observed_by_clones() {
        let (ctl, sd) = ShutdownController::new();
        let mut sd2 = sd.clone();
        assert!(!sd.is_cancelled());
        ctl.shutdown();
        assert!(sd.is_cancelled());
        sd2.cancelled().await;
    }
}
