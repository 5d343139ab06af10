// =============================================================================
// Opportunity Scanner — worker pool scoring funding histories
// =============================================================================
//
// A persistent pool of workers pulls symbols off a queue, fetches each
// symbol's historical funding, and derives:
//
//   - SMA of the funding rate over 1d / 7d / 30d windows (8 h cadence).
//   - Sign-flip count and a stability score (fewer flips = steadier carry).
//   - Rate volatility (standard deviation).
//   - Momentum (short SMA minus long SMA).
//   - An open-interest factor (deeper markets score higher).
//   - The average annualized APR.
//
// `quality_score` is a bounded linear combination of those factors, clamped
// to [0, 1].
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::portfolio::allocator::Opportunity;
use crate::strategy::arbitrage::annualize_spread;
use crate::venue::Venue;

/// 8 h funding cadence: samples per window.
const SAMPLES_1D: usize = 3;
const SAMPLES_7D: usize = 21;
const SAMPLES_30D: usize = 90;

/// Open interest (quote units) at which the depth factor saturates ~0.5.
const OI_MIDPOINT: f64 = 10_000_000.0;

/// Quality-score weights; they sum to 1 so the clamp rarely binds.
const W_STABILITY: f64 = 0.35;
const W_MAGNITUDE: f64 = 0.25;
const W_MOMENTUM: f64 = 0.20;
const W_OPEN_INTEREST: f64 = 0.20;

/// Full per-symbol metrics, exposed on the RPC surface.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolScore {
    pub symbol: String,
    pub sma_1d: f64,
    pub sma_7d: f64,
    pub sma_30d: f64,
    pub sign_flips: usize,
    pub stability: f64,
    pub volatility: f64,
    pub momentum: f64,
    pub oi_factor: f64,
    pub avg_apr: f64,
    pub quality_score: f64,
}

/// Worker-pool scanner over one venue's funding history.
pub struct Scanner {
    venue: Arc<dyn Venue>,
    workers: usize,
    funding_interval_hours: f64,
    last_scores: parking_lot::RwLock<Vec<SymbolScore>>,
}

impl Scanner {
    pub fn new(venue: Arc<dyn Venue>, workers: usize, funding_interval_hours: f64) -> Self {
        Self {
            venue,
            workers: workers.max(1),
            funding_interval_hours,
            last_scores: parking_lot::RwLock::new(Vec::new()),
        }
    }

    pub fn last_scores(&self) -> Vec<SymbolScore> {
        self.last_scores.read().clone()
    }

    /// Score every symbol through the worker pool and convert to
    /// opportunities. Symbols that fail to fetch are skipped with a warning.
    pub async fn scan(
        &self,
        symbols: &[String],
        sectors: &HashMap<String, String>,
    ) -> Vec<Opportunity> {
        let (work_tx, work_rx) = mpsc::channel::<String>(symbols.len().max(1));
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
        let (result_tx, mut result_rx) = mpsc::channel::<SymbolScore>(symbols.len().max(1));

        let mut workers = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            let venue = self.venue.clone();
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let hours = self.funding_interval_hours;
            workers.push(tokio::spawn(async move {
                loop {
                    let symbol = { work_rx.lock().await.recv().await };
                    let Some(symbol) = symbol else { break };
                    match score_symbol(&venue, &symbol, hours).await {
                        Ok(score) => {
                            let _ = result_tx.send(score).await;
                        }
                        Err(e) => warn!(symbol = %symbol, error = %e, "funding scan failed"),
                    }
                }
            }));
        }
        drop(result_tx);

        for symbol in symbols {
            let _ = work_tx.send(symbol.clone()).await;
        }
        drop(work_tx);

        let mut scores = Vec::with_capacity(symbols.len());
        while let Some(score) = result_rx.recv().await {
            scores.push(score);
        }
        for worker in workers {
            let _ = worker.await;
        }

        // Stable output order regardless of worker interleaving.
        scores.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        *self.last_scores.write() = scores.clone();

        let venue_name = self.venue.name().to_string();
        scores
            .into_iter()
            .map(|score| {
                let positive_carry = score.sma_30d >= 0.0;
                Opportunity {
                    symbol: score.symbol.clone(),
                    long_venue: if positive_carry {
                        format!("{venue_name}-spot")
                    } else {
                        format!("{venue_name}-perp")
                    },
                    short_venue: if positive_carry {
                        format!("{venue_name}-perp")
                    } else {
                        format!("{venue_name}-spot")
                    },
                    spread: score.sma_30d,
                    spread_apr: score.avg_apr,
                    basis: 0.0,
                    quality_score: score.quality_score,
                    sector: sectors
                        .get(&score.symbol)
                        .cloned()
                        .unwrap_or_else(|| "UNKNOWN".to_string()),
                }
            })
            .collect()
    }
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("workers", &self.workers)
            .finish()
    }
}

/// Fetch one symbol's history and derive its score.
async fn score_symbol(
    venue: &Arc<dyn Venue>,
    symbol: &str,
    funding_interval_hours: f64,
) -> anyhow::Result<SymbolScore> {
    let history = venue
        .get_historical_funding_rates(symbol, SAMPLES_30D as u32)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    if history.len() < SAMPLES_1D {
        anyhow::bail!("insufficient funding history ({} samples)", history.len());
    }

    let rates: Vec<f64> = history
        .iter()
        .map(|r| r.rate.to_f64().unwrap_or(0.0))
        .collect();

    let sma = |n: usize| -> f64 {
        let tail = &rates[rates.len().saturating_sub(n)..];
        tail.iter().sum::<f64>() / tail.len() as f64
    };
    let sma_1d = sma(SAMPLES_1D);
    let sma_7d = sma(SAMPLES_7D);
    let sma_30d = sma(SAMPLES_30D);

    let sign_flips = rates
        .windows(2)
        .filter(|w| w[0].signum() != w[1].signum() && w[0] != 0.0 && w[1] != 0.0)
        .count();
    let stability = 1.0 - (sign_flips as f64 / (rates.len() - 1) as f64);

    let mean = rates.iter().sum::<f64>() / rates.len() as f64;
    let volatility =
        (rates.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / rates.len() as f64).sqrt();

    let momentum = sma_1d - sma_30d;
    let avg_apr = annualize_spread(sma_30d, funding_interval_hours);

    let oi = venue
        .get_open_interest(symbol)
        .await
        .map(|o| o.open_interest.to_f64().unwrap_or(0.0))
        .unwrap_or(0.0);
    let oi_factor = oi / (oi + OI_MIDPOINT);

    // Bounded combination: magnitude saturates at 50 % APR, momentum maps
    // [-1x..+1x of the long-run rate] onto [0..1].
    let magnitude = (avg_apr.abs() / 0.5).min(1.0);
    let momentum_norm = if sma_30d.abs() > f64::EPSILON {
        (0.5 + momentum / (2.0 * sma_30d.abs())).clamp(0.0, 1.0)
    } else {
        0.5
    };
    let quality_score = (W_STABILITY * stability
        + W_MAGNITUDE * magnitude
        + W_MOMENTUM * momentum_norm
        + W_OPEN_INTEREST * oi_factor)
        .clamp(0.0, 1.0);

    debug!(
        symbol,
        sma_30d,
        sign_flips,
        stability,
        volatility,
        avg_apr,
        quality_score,
        "symbol scored"
    );

    Ok(SymbolScore {
        symbol: symbol.to_string(),
        sma_1d,
        sma_7d,
        sma_30d,
        sign_flips,
        stability,
        volatility,
        momentum,
        oi_factor,
        avg_apr,
        quality_score,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::paper::PaperVenue;
    use crate::venue::FundingRate;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn seed(venue: &PaperVenue, symbol: &str, rates: Vec<Decimal>) {
        let now = Utc::now();
        let len = rates.len() as i64;
        let history: Vec<FundingRate> = rates
            .into_iter()
            .enumerate()
            .map(|(i, rate)| FundingRate {
                exchange: "paper".into(),
                symbol: symbol.into(),
                rate,
                predicted_rate: rate,
                next_funding_time_ms: 0,
                observed_at: now - chrono::Duration::hours(8 * (len - i as i64)),
            })
            .collect();
        venue.set_funding_history(symbol, history);
    }

    #[tokio::test]
    async fn steady_positive_carry_scores_high() {
        let venue = Arc::new(PaperVenue::new("paper", true));
        seed(&venue, "BTCUSDT", vec![dec!(0.0004); 90]);
        venue.set_open_interest("BTCUSDT", dec!(50000000));
        seed(&venue, "CHOPUSDT", {
            // Alternating sign every sample: zero stability.
            (0..90)
                .map(|i| if i % 2 == 0 { dec!(0.0004) } else { dec!(-0.0004) })
                .collect()
        });
        venue.set_open_interest("CHOPUSDT", dec!(50000000));

        let scanner = Scanner::new(venue, 2, 8.0);
        let opportunities = scanner
            .scan(
                &["BTCUSDT".to_string(), "CHOPUSDT".to_string()],
                &HashMap::new(),
            )
            .await;

        let by_symbol: HashMap<_, _> = opportunities
            .iter()
            .map(|o| (o.symbol.as_str(), o.quality_score))
            .collect();
        assert!(by_symbol["BTCUSDT"] > by_symbol["CHOPUSDT"]);
        assert!(by_symbol.values().all(|q| (0.0..=1.0).contains(q)));
    }

    #[tokio::test]
    async fn apr_annualizes_eight_hour_cadence() {
        let venue = Arc::new(PaperVenue::new("paper", true));
        seed(&venue, "BTCUSDT", vec![dec!(0.0005); 90]);
        let scanner = Scanner::new(venue, 1, 8.0);
        let opportunities = scanner.scan(&["BTCUSDT".to_string()], &HashMap::new()).await;
        assert!((opportunities[0].spread_apr - 0.5475).abs() < 1e-9);
        // Positive carry → long spot, short perp.
        assert!(opportunities[0].long_venue.ends_with("spot"));
        assert!(opportunities[0].short_venue.ends_with("perp"));
    }

    #[tokio::test]
    async fn failed_symbols_are_skipped() {
        let venue = Arc::new(PaperVenue::new("paper", true));
        seed(&venue, "BTCUSDT", vec![dec!(0.0004); 90]);
        // ETH has no history at all.
        let scanner = Scanner::new(venue, 2, 8.0);
        let opportunities = scanner
            .scan(
                &["BTCUSDT".to_string(), "ETHUSDT".to_string()],
                &HashMap::new(),
            )
            .await;
        assert_eq!(opportunities.len(), 1);
        assert_eq!(opportunities[0].symbol, "BTCUSDT");
    }

    #[tokio::test]
    async fn sector_labels_applied() {
        let venue = Arc::new(PaperVenue::new("paper", true));
        seed(&venue, "BTCUSDT", vec![dec!(0.0004); 90]);
        let scanner = Scanner::new(venue, 1, 8.0);
        let mut sectors = HashMap::new();
        sectors.insert("BTCUSDT".to_string(), "L1".to_string());
        let opportunities = scanner.scan(&["BTCUSDT".to_string()], &sectors).await;
        assert_eq!(opportunities[0].sector, "L1");

        let unlabelled = scanner.scan(&["BTCUSDT".to_string()], &HashMap::new()).await;
        assert_eq!(unlabelled[0].sector, "UNKNOWN");
    }

    #[tokio::test]
    async fn worker_pool_covers_all_symbols() {
        let venue = Arc::new(PaperVenue::new("paper", true));
        let symbols: Vec<String> = (0..12).map(|i| format!("SYM{i}USDT")).collect();
        for symbol in &symbols {
            seed(&venue, symbol, vec![dec!(0.0003); 90]);
        }
        let scanner = Scanner::new(venue, 4, 8.0);
        let opportunities = scanner.scan(&symbols, &HashMap::new()).await;
        assert_eq!(opportunities.len(), 12);
        // Deterministic output order.
        let mut sorted = opportunities.clone();
        sorted.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        assert_eq!(
            opportunities.iter().map(|o| &o.symbol).collect::<Vec<_>>(),
            sorted.iter().map(|o| &o.symbol).collect::<Vec<_>>()
        );
    }
}
