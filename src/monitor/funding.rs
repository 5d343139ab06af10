// =============================================================================
// Funding Monitor — cross-venue funding-rate cache with staleness gating
// =============================================================================
//
// Keeps the latest `FundingRate` per `(exchange, symbol)` with its observation
// time. Staleness is judged conservatively: an untracked pair is stale.
//
// Subscribers receive filtered update streams through bounded channels with
// drop-on-full semantics — a slow consumer loses ticks, never blocks the
// monitor.
// =============================================================================

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::venue::FundingRate;

/// Minimum subscriber buffer; smaller requests are bumped up to this.
const MIN_SUBSCRIBER_BUFFER: usize = 100;

struct Subscriber {
    /// None = all symbols.
    symbols: Option<HashSet<String>>,
    tx: mpsc::Sender<FundingRate>,
}

/// Thread-safe cache of the latest funding observation per venue and symbol.
pub struct FundingMonitor {
    rates: RwLock<HashMap<(String, String), FundingRate>>,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl FundingMonitor {
    pub fn new() -> Self {
        Self {
            rates: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Ingest
    // -------------------------------------------------------------------------

    /// Record a fresh observation and fan it out to matching subscribers.
    pub fn update(&self, rate: FundingRate) {
        let key = (rate.exchange.clone(), rate.symbol.clone());
        self.rates.write().insert(key, rate.clone());

        let mut subs = self.subscribers.write();
        subs.retain(|sub| {
            if let Some(filter) = &sub.symbols {
                if !filter.contains(&rate.symbol) {
                    return !sub.tx.is_closed();
                }
            }
            match sub.tx.try_send(rate.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        exchange = %rate.exchange,
                        symbol = %rate.symbol,
                        "funding subscriber buffer full — update dropped"
                    );
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        debug!(
            exchange = %rate.exchange,
            symbol = %rate.symbol,
            rate = %rate.rate,
            "funding rate updated"
        );
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Latest observation for `(exchange, symbol)`; fails if untracked.
    pub fn get_rate(&self, exchange: &str, symbol: &str) -> Result<FundingRate> {
        self.rates
            .read()
            .get(&(exchange.to_string(), symbol.to_string()))
            .cloned()
            .with_context(|| format!("no funding rate tracked for {exchange}/{symbol}"))
    }

    /// Conservative staleness check: missing ⇒ stale.
    pub fn is_stale(&self, exchange: &str, symbol: &str, ttl: chrono::Duration) -> bool {
        match self
            .rates
            .read()
            .get(&(exchange.to_string(), symbol.to_string()))
        {
            Some(rate) => !rate.is_fresh(Utc::now(), ttl),
            None => true,
        }
    }

    /// Deep-copied snapshot of every tracked rate.
    pub fn snapshot(&self) -> Vec<FundingRate> {
        self.rates.read().values().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Subscribe to updates, optionally filtered to `symbols`. The buffer is
    /// bounded (≥ 100); overflow drops updates for this subscriber only.
    pub fn subscribe(
        &self,
        symbols: Option<Vec<String>>,
        buffer: usize,
    ) -> mpsc::Receiver<FundingRate> {
        let (tx, rx) = mpsc::channel(buffer.max(MIN_SUBSCRIBER_BUFFER));
        self.subscribers.write().push(Subscriber {
            symbols: symbols.map(|s| s.into_iter().collect()),
            tx,
        });
        rx
    }
}

impl Default for FundingMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FundingMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FundingMonitor")
            .field("tracked", &self.rates.read().len())
            .field("subscribers", &self.subscribers.read().len())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn rate(exchange: &str, symbol: &str, age_ms: i64) -> FundingRate {
        FundingRate {
            exchange: exchange.into(),
            symbol: symbol.into(),
            rate: dec!(0.0001),
            predicted_rate: dec!(0.0001),
            next_funding_time_ms: 0,
            observed_at: Utc::now() - chrono::Duration::milliseconds(age_ms),
        }
    }

    #[test]
    fn get_rate_fails_when_untracked() {
        let monitor = FundingMonitor::new();
        assert!(monitor.get_rate("paper", "BTCUSDT").is_err());
        monitor.update(rate("paper", "BTCUSDT", 0));
        assert!(monitor.get_rate("paper", "BTCUSDT").is_ok());
    }

    #[test]
    fn staleness_is_conservative() {
        let monitor = FundingMonitor::new();
        let ttl = chrono::Duration::milliseconds(100);

        // Missing ⇒ stale.
        assert!(monitor.is_stale("paper", "BTCUSDT", ttl));

        monitor.update(rate("paper", "BTCUSDT", 10));
        assert!(!monitor.is_stale("paper", "BTCUSDT", ttl));

        monitor.update(rate("paper", "ETHUSDT", 500));
        assert!(monitor.is_stale("paper", "ETHUSDT", ttl));
    }

    #[test]
    fn rates_keyed_per_exchange() {
        let monitor = FundingMonitor::new();
        monitor.update(rate("paper-spot", "BTCUSDT", 0));
        monitor.update(rate("paper-perp", "BTCUSDT", 0));
        assert_eq!(monitor.snapshot().len(), 2);
        assert!(monitor.get_rate("paper-spot", "BTCUSDT").is_ok());
        assert!(monitor.get_rate("paper-perp", "BTCUSDT").is_ok());
    }

    #[tokio::test]
    async fn subscribers_receive_filtered_updates() {
        let monitor = FundingMonitor::new();
        let mut rx = monitor.subscribe(Some(vec!["BTCUSDT".into()]), 100);

        monitor.update(rate("paper", "ETHUSDT", 0));
        monitor.update(rate("paper", "BTCUSDT", 0));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.symbol, "BTCUSDT");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_subscriber_drops_updates_without_blocking() {
        let monitor = FundingMonitor::new();
        // Buffer is clamped up to 100; fill it past capacity.
        let mut rx = monitor.subscribe(None, 1);
        for _ in 0..150 {
            monitor.update(rate("paper", "BTCUSDT", 0));
        }
        // Drain what fit; the rest were dropped, not queued.
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 100);
    }
}
