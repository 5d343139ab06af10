// =============================================================================
// Portfolio Controller — scan → allocate → reconcile → gated execution
// =============================================================================
//
// Runs over multiple symbols on a long timer (default 15 min). One cycle:
//
//   Scan      — worker pool scores funding opportunities (scanner.rs).
//   Allocate  — quality-weighted allocation under per-symbol and per-sector
//               caps (allocator.rs).
//   Reconcile — diff targets against active positions into prioritized
//               actions: 1 remove, 2 reduce, 3 expand, 4 add, with rebalance
//               hysteresis.
//   Execute   — priorities {1,2} first, then a margin-health gate, then
//               {3,4}; a bounded semaphore limits concurrency, and each
//               action is a durable workflow step so a crash mid-batch
//               resumes without duplication.
// =============================================================================

pub mod allocator;
pub mod applier;
pub mod scanner;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::{interval, sleep, Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::PortfolioConfig;
use crate::store::StateStore;
use crate::types::Shutdown;
use crate::venue::Venue;
use allocator::{allocate, TargetAllocation};
use scanner::Scanner;

// ---------------------------------------------------------------------------
// Rebalance actions
// ---------------------------------------------------------------------------

/// Action kinds in execution priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActionKind {
    Remove,
    Reduce,
    Expand,
    Add,
}

impl ActionKind {
    pub fn priority(self) -> u8 {
        match self {
            Self::Remove => 1,
            Self::Reduce => 2,
            Self::Expand => 3,
            Self::Add => 4,
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remove => write!(f, "remove"),
            Self::Reduce => write!(f, "reduce"),
            Self::Expand => write!(f, "expand"),
            Self::Add => write!(f, "add"),
        }
    }
}

/// One planned portfolio adjustment.
#[derive(Debug, Clone, Serialize)]
pub struct RebalanceAction {
    pub symbol: String,
    pub kind: ActionKind,
    pub current_notional: Decimal,
    pub target_notional: Decimal,
}

/// Receives planned actions; the application wires this to engine lifecycle
/// and two-leg execution, tests to a recorder.
#[async_trait]
pub trait RebalanceApplier: Send + Sync {
    async fn apply(&self, action: &RebalanceAction, shutdown: &Shutdown) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Reconcile (pure)
// ---------------------------------------------------------------------------

/// Diff target allocations against current notionals into prioritized
/// actions.
///
/// Hysteresis: a symbol present on both sides only produces an action when
/// `|target − current| / (current + 1)` exceeds the relative threshold OR the
/// absolute difference exceeds `round_trip_cost · hysteresis_mult ·
/// (current + 1)`.
pub fn plan_rebalance(
    targets: &[TargetAllocation],
    current: &HashMap<String, Decimal>,
    cfg: &PortfolioConfig,
) -> Vec<RebalanceAction> {
    use rust_decimal::prelude::ToPrimitive;

    let mut actions = Vec::new();
    let target_by_symbol: HashMap<&str, &TargetAllocation> =
        targets.iter().map(|t| (t.symbol.as_str(), t)).collect();

    for (symbol, &current_notional) in current {
        let Some(target) = target_by_symbol.get(symbol.as_str()) else {
            actions.push(RebalanceAction {
                symbol: symbol.clone(),
                kind: ActionKind::Remove,
                current_notional,
                target_notional: Decimal::ZERO,
            });
            continue;
        };

        let cur = current_notional.to_f64().unwrap_or(0.0);
        let tgt = target.notional.to_f64().unwrap_or(0.0);
        let delta = (tgt - cur).abs();
        let relative = delta / (cur + 1.0);
        let cost_threshold = cfg.round_trip_cost * cfg.hysteresis_mult * (cur + 1.0);

        if relative <= cfg.rebalance_threshold_pct / 100.0 && delta <= cost_threshold {
            continue;
        }

        actions.push(RebalanceAction {
            symbol: symbol.clone(),
            kind: if tgt < cur {
                ActionKind::Reduce
            } else {
                ActionKind::Expand
            },
            current_notional,
            target_notional: target.notional,
        });
    }

    for target in targets {
        if !current.contains_key(&target.symbol) {
            actions.push(RebalanceAction {
                symbol: target.symbol.clone(),
                kind: ActionKind::Add,
                current_notional: Decimal::ZERO,
                target_notional: target.notional,
            });
        }
    }

    actions.sort_by_key(|a| (a.kind.priority(), a.symbol.clone()));
    actions
}

// ---------------------------------------------------------------------------
// Margin gate
// ---------------------------------------------------------------------------

/// Poll account margin health until it reaches `min` or `timeout` expires.
pub async fn wait_for_margin_health(
    venue: &Arc<dyn Venue>,
    min: f64,
    timeout: Duration,
    shutdown: &Shutdown,
) -> Result<bool> {
    let deadline = Instant::now() + timeout;
    let mut sd = shutdown.clone();
    loop {
        match venue.get_account().await {
            Ok(account) if account.margin_health >= min => return Ok(true),
            Ok(account) => {
                if Instant::now() >= deadline {
                    warn!(
                        health = account.margin_health,
                        min, "margin health gate timed out"
                    );
                    return Ok(false);
                }
            }
            Err(e) => {
                if Instant::now() >= deadline {
                    return Err(anyhow::anyhow!(e)).context("margin health gate failed");
                }
            }
        }
        tokio::select! {
            _ = sleep(Duration::from_secs(1)) => {}
            _ = sd.cancelled() => return Ok(false),
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Summary of one completed cycle for the RPC surface.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: String,
    pub opportunities: usize,
    pub targets: Vec<TargetAllocation>,
    pub actions: Vec<RebalanceAction>,
    pub executed: usize,
    pub margin_gate_passed: bool,
}

pub struct PortfolioController {
    scanner: Arc<Scanner>,
    venue: Arc<dyn Venue>,
    store: Arc<StateStore>,
    applier: Arc<dyn RebalanceApplier>,
    cfg: PortfolioConfig,
    last_report: parking_lot::RwLock<Option<CycleReport>>,
}

impl PortfolioController {
    pub fn new(
        scanner: Arc<Scanner>,
        venue: Arc<dyn Venue>,
        store: Arc<StateStore>,
        applier: Arc<dyn RebalanceApplier>,
        cfg: PortfolioConfig,
    ) -> Self {
        Self {
            scanner,
            venue,
            store,
            applier,
            cfg,
            last_report: parking_lot::RwLock::new(None),
        }
    }

    pub fn last_report(&self) -> Option<CycleReport> {
        self.last_report.read().clone()
    }

    /// One full cycle with a fresh cycle id.
    pub async fn run_cycle(
        &self,
        symbols: &[String],
        current: &HashMap<String, Decimal>,
        shutdown: &Shutdown,
    ) -> Result<CycleReport> {
        let cycle_id = format!("rebalance-{}", &Uuid::new_v4().simple().to_string()[..8]);
        self.run_cycle_resumable(&cycle_id, symbols, current, shutdown)
            .await
    }

    /// Cycle body, resumable by id: actions already checkpointed under this
    /// cycle id are skipped on replay.
    pub async fn run_cycle_resumable(
        &self,
        cycle_id: &str,
        symbols: &[String],
        current: &HashMap<String, Decimal>,
        shutdown: &Shutdown,
    ) -> Result<CycleReport> {
        // ── Scan ────────────────────────────────────────────────────────────
        let opportunities = self.scanner.scan(symbols, &self.cfg.sectors).await;
        info!(cycle = cycle_id, count = opportunities.len(), "scan complete");

        // ── Allocate ────────────────────────────────────────────────────────
        let account = self
            .venue
            .get_account()
            .await
            .map_err(|e| anyhow::anyhow!(e))
            .context("portfolio: account fetch failed")?;
        let targets = allocate(
            &opportunities,
            account.equity,
            self.cfg.target_leverage,
            self.cfg.max_weight,
            self.cfg.sector_cap,
        );

        // ── Reconcile ───────────────────────────────────────────────────────
        let actions = plan_rebalance(&targets, current, &self.cfg);
        info!(cycle = cycle_id, actions = actions.len(), "rebalance planned");

        // ── Execute: de-risking batch first ─────────────────────────────────
        let (derisk, growth): (Vec<_>, Vec<_>) = actions
            .iter()
            .cloned()
            .partition(|a| a.kind.priority() <= 2);

        let (mut executed, mut skipped) = self.execute_batch(cycle_id, &derisk, shutdown).await?;

        // ── Margin gate before growth ───────────────────────────────────────
        let margin_gate_passed = if growth.is_empty() {
            true
        } else {
            wait_for_margin_health(
                &self.venue,
                self.cfg.min_margin_health,
                Duration::from_secs(self.cfg.margin_wait_secs),
                shutdown,
            )
            .await?
        };

        if margin_gate_passed {
            let (batch_executed, batch_skipped) =
                self.execute_batch(cycle_id, &growth, shutdown).await?;
            executed += batch_executed;
            skipped += batch_skipped;
        } else {
            warn!(
                cycle = cycle_id,
                deferred = growth.len(),
                "margin gate failed — expand/add batch skipped"
            );
        }

        // Checkpoints only clear once every planned action has landed; a
        // partially-failed cycle keeps them so a resume skips completed work.
        if margin_gate_passed && executed + skipped == actions.len() {
            self.store.clear_workflow(cycle_id).ok();
        }

        let report = CycleReport {
            cycle_id: cycle_id.to_string(),
            opportunities: opportunities.len(),
            targets,
            actions,
            executed,
            margin_gate_passed,
        };
        *self.last_report.write() = Some(report.clone());
        Ok(report)
    }

    /// Run one batch under the concurrency semaphore, checkpointing each
    /// completed action. Returns `(executed, skipped_from_checkpoint)`.
    async fn execute_batch(
        &self,
        cycle_id: &str,
        actions: &[RebalanceAction],
        shutdown: &Shutdown,
    ) -> Result<(usize, usize)> {
        if actions.is_empty() {
            return Ok((0, 0));
        }
        let semaphore = Arc::new(Semaphore::new(self.cfg.max_concurrent_actions.max(1)));
        let mut handles = Vec::with_capacity(actions.len());
        let mut skipped = 0usize;

        for action in actions {
            let step = format!("{}-{}", action.kind, action.symbol);
            if self.store.get_step(cycle_id, &step)?.is_some() {
                info!(cycle = cycle_id, step = %step, "action already executed — skipped on resume");
                skipped += 1;
                continue;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .context("action semaphore closed")?;
            let applier = self.applier.clone();
            let action = action.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let result = applier.apply(&action, &shutdown).await;
                drop(permit);
                (action, result)
            }));
        }

        let mut executed = 0usize;
        for handle in handles {
            let (action, result) = handle.await.context("action task panicked")?;
            let step = format!("{}-{}", action.kind, action.symbol);
            match result {
                Ok(()) => {
                    let payload = serde_json::to_value(&action)
                        .context("failed to serialize action checkpoint")?;
                    self.store.record_step(cycle_id, &step, &payload)?;
                    executed += 1;
                }
                Err(e) => {
                    warn!(cycle = cycle_id, step = %step, error = %e, "rebalance action failed");
                }
            }
        }
        Ok((executed, skipped))
    }

    /// Long-interval control loop with a skewed first tick.
    pub async fn run(
        self: Arc<Self>,
        symbols: Vec<String>,
        current: Arc<dyn Fn() -> HashMap<String, Decimal> + Send + Sync>,
        shutdown: Shutdown,
    ) {
        let skew = rand::thread_rng().gen_range(0..=self.cfg.interval_secs / 4);
        let mut sd = shutdown.clone();
        tokio::select! {
            _ = sleep(Duration::from_secs(skew)) => {}
            _ = sd.cancelled() => return,
        }

        let mut ticker = interval(Duration::from_secs(self.cfg.interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = sd.cancelled() => return,
            }
            let snapshot = current();
            if let Err(e) = self.run_cycle(&symbols, &snapshot, &shutdown).await {
                warn!(error = %e, "portfolio cycle failed");
            }
        }
    }
}

impl std::fmt::Debug for PortfolioController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortfolioController").finish_non_exhaustive()
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
    use crate::venue::{AccountInfo, FundingRate};
    use chrono::Utc;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    fn cfg() -> PortfolioConfig {
        let mut cfg = PortfolioConfig::default();
        cfg.sectors.insert("BTCUSDT".into(), "L1".into());
        cfg.sectors.insert("ETHUSDT".into(), "L1".into());
        cfg.sectors.insert("SOLUSDT".into(), "L1".into());
        cfg.sectors.insert("TAOUSDT".into(), "AI".into());
        cfg
    }

    struct Recorder {
        applied: Mutex<Vec<String>>,
        fail_symbols: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                applied: Mutex::new(Vec::new()),
                fail_symbols: Mutex::new(Vec::new()),
            })
        }
        fn applied(&self) -> Vec<String> {
            self.applied.lock().clone()
        }
    }

    #[async_trait]
    impl RebalanceApplier for Recorder {
        async fn apply(&self, action: &RebalanceAction, _shutdown: &Shutdown) -> Result<()> {
            let tag = format!("{}-{}", action.kind, action.symbol);
            if self.fail_symbols.lock().contains(&action.symbol) {
                anyhow::bail!("scripted failure for {tag}");
            }
            self.applied.lock().push(tag);
            Ok(())
        }
    }

    fn seed_history(venue: &PaperVenue, symbol: &str, rate: Decimal) {
        let now = Utc::now();
        let history: Vec<FundingRate> = (0..90)
            .map(|i| FundingRate {
                exchange: "paper".into(),
                symbol: symbol.into(),
                rate,
                predicted_rate: rate,
                next_funding_time_ms: 0,
                observed_at: now - chrono::Duration::hours(8 * (90 - i)),
            })
            .collect();
        venue.set_funding_history(symbol, history);
        venue.set_open_interest(symbol, dec!(50000000));
    }

    fn harness(applier: Arc<dyn RebalanceApplier>) -> (PortfolioController, Arc<PaperVenue>) {
        let venue = Arc::new(PaperVenue::new("paper", true));
        for (symbol, rate) in [
            ("BTCUSDT", dec!(0.0004)),
            ("ETHUSDT", dec!(0.0003)),
            ("SOLUSDT", dec!(0.0002)),
            ("TAOUSDT", dec!(0.00045)),
        ] {
            seed_history(&venue, symbol, rate);
        }
        let scanner = Arc::new(Scanner::new(venue.clone(), 2, 8.0));
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let controller =
            PortfolioController::new(scanner, venue.clone(), store, applier, cfg());
        (controller, venue)
    }

    fn symbols() -> Vec<String> {
        vec![
            "BTCUSDT".into(),
            "ETHUSDT".into(),
            "SOLUSDT".into(),
            "TAOUSDT".into(),
        ]
    }

    #[test]
    fn hysteresis_suppresses_small_deltas() {
        let cfg = cfg();
        let targets = vec![TargetAllocation {
            symbol: "BTCUSDT".into(),
            weight: 0.25,
            notional: dec!(1030),
            exchange: "paper".into(),
            quality_score: 0.8,
        }];
        let mut current = HashMap::new();
        // 3 % off target and under the cost threshold — no action.
        current.insert("BTCUSDT".to_string(), dec!(1000));
        let actions = plan_rebalance(&targets, &current, &cfg);
        assert!(actions.is_empty());
    }

    #[test]
    fn plan_orders_actions_by_priority() {
        let cfg = cfg();
        let targets = vec![
            TargetAllocation {
                symbol: "ETHUSDT".into(),
                weight: 0.1,
                notional: dec!(500),
                exchange: "paper".into(),
                quality_score: 0.6,
            },
            TargetAllocation {
                symbol: "TAOUSDT".into(),
                weight: 0.25,
                notional: dec!(2000),
                exchange: "paper".into(),
                quality_score: 0.9,
            },
            TargetAllocation {
                symbol: "BTCUSDT".into(),
                weight: 0.25,
                notional: dec!(3000),
                exchange: "paper".into(),
                quality_score: 0.8,
            },
        ];
        let mut current = HashMap::new();
        current.insert("SOLUSDT".to_string(), dec!(800)); // remove
        current.insert("ETHUSDT".to_string(), dec!(1500)); // reduce
        current.insert("BTCUSDT".to_string(), dec!(1000)); // expand
                                                           // TAOUSDT → add

        let actions = plan_rebalance(&targets, &current, &cfg);
        let kinds: Vec<ActionKind> = actions.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ActionKind::Remove,
                ActionKind::Reduce,
                ActionKind::Expand,
                ActionKind::Add
            ]
        );
    }

    #[tokio::test]
    async fn cycle_executes_derisk_before_growth() {
        let recorder = Recorder::new();
        let (controller, _venue) = harness(recorder.clone());
        let (_ctl, shutdown) = ShutdownController::new();

        let mut current = HashMap::new();
        current.insert("DOGEUSDT".to_string(), dec!(500)); // stale position → remove

        let report = controller
            .run_cycle(&symbols(), &current, &shutdown)
            .await
            .unwrap();
        assert!(report.margin_gate_passed);
        assert!(report.executed >= 2);

        let applied = recorder.applied();
        // The remove ran before any add.
        let remove_idx = applied.iter().position(|a| a.starts_with("remove")).unwrap();
        let first_add = applied.iter().position(|a| a.starts_with("add")).unwrap();
        assert!(remove_idx < first_add);
    }

    #[tokio::test]
    async fn low_margin_health_skips_growth_batch() {
        let recorder = Recorder::new();
        let (controller, venue) = harness(recorder.clone());
        let (_ctl, shutdown) = ShutdownController::new();

        venue.set_account(AccountInfo {
            equity: dec!(100000),
            available: dec!(1000),
            margin_health: 0.4,
            unified_margin: true,
            balances: Vec::new(),
        });

        // Shorten the gate so the test does not sit out the full timeout.
        let mut config = cfg();
        config.margin_wait_secs = 1;
        let venue2: Arc<dyn Venue> = venue.clone();
        let scanner = Arc::new(Scanner::new(venue.clone(), 2, 8.0));
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let controller2 = PortfolioController::new(
            scanner,
            venue2,
            store,
            recorder.clone(),
            config,
        );
        drop(controller);

        let report = controller2
            .run_cycle(&symbols(), &HashMap::new(), &shutdown)
            .await
            .unwrap();
        assert!(!report.margin_gate_passed);
        assert_eq!(report.executed, 0);
        assert!(recorder.applied().is_empty());
    }

    #[tokio::test]
    async fn resumed_cycle_skips_completed_actions() {
        let recorder = Recorder::new();
        let (controller, _venue) = harness(recorder.clone());
        let (_ctl, shutdown) = ShutdownController::new();

        // First run: TAOUSDT fails, everything else lands.
        recorder.fail_symbols.lock().push("TAOUSDT".to_string());
        let report = controller
            .run_cycle_resumable("rebalance-test1", &symbols(), &HashMap::new(), &shutdown)
            .await
            .unwrap();
        let first_executed = report.executed;
        assert!(first_executed >= 1);

        // Resume the same cycle: completed adds are skipped, only the failed
        // action re-runs.
        recorder.fail_symbols.lock().clear();
        let applied_before = recorder.applied().len();
        let report = controller
            .run_cycle_resumable("rebalance-test1", &symbols(), &HashMap::new(), &shutdown)
            .await
            .unwrap();
        assert_eq!(report.executed, 1);
        assert_eq!(recorder.applied().len(), applied_before + 1);
        assert!(recorder.applied().last().unwrap().contains("TAOUSDT"));
    }
}
