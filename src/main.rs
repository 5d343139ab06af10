// =============================================================================
// Meridian Funding Nexus — Main Entry Point
// =============================================================================
//
// The engine starts in Paper + Paused mode for safety. Operators must
// explicitly switch to Live mode via the API.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod alert;
mod api;
mod app_state;
mod config;
mod engine;
mod executor;
mod indicators;
mod monitor;
mod portfolio;
mod reconcile;
mod risk;
mod slot;
mod store;
mod strategy;
mod twoleg;
mod types;
mod venue;

use std::sync::Arc;

use rust_decimal_macros::dec;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::alert::AlertSender;
use crate::app_state::AppState;
use crate::config::RuntimeConfig;
use crate::engine::{engine_queues, run_event_loop, Engine, EngineEvent};
use crate::executor::{OrderExecutor, RateLimiter};
use crate::portfolio::applier::ArbRebalanceApplier;
use crate::portfolio::scanner::Scanner;
use crate::portfolio::PortfolioController;
use crate::reconcile::Reconciler;
use crate::store::StateStore;
use crate::types::{AccountMode, Secret, ShutdownController, TradingMode};
use crate::venue::binance::BinanceFutures;
use crate::venue::paper::PaperVenue;
use crate::venue::{SymbolInfo, Venue};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Funding Nexus — Starting Up             ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut cfg = RuntimeConfig::load("runtime_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // SAFETY: force Paper + Paused on startup.
    cfg.trading_mode = TradingMode::Paused;
    cfg.account_mode = AccountMode::Paper;
    if std::env::var("MERIDIAN_LIVE").as_deref() == Ok("1") {
        cfg.account_mode = AccountMode::Live;
        warn!("LIVE account mode requested via MERIDIAN_LIVE=1");
    }

    // Override symbols from env if available.
    if let Ok(raw) = std::env::var("MERIDIAN_SYMBOLS") {
        cfg.symbols = raw
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if cfg.symbols.is_empty() {
        cfg.symbols = vec!["BTCUSDT".into(), "ETHUSDT".into()];
    }

    info!(symbols = ?cfg.symbols, "configured trading pairs");
    info!(
        trading_mode = %cfg.trading_mode,
        account_mode = %cfg.account_mode,
        "engine starting in SAFE mode (Paper + Paused)"
    );

    // ── 2. Venue ─────────────────────────────────────────────────────────
    let venue: Arc<dyn Venue> = match cfg.account_mode {
        AccountMode::Live => {
            let api_key = Secret::new(std::env::var("MERIDIAN_API_KEY_BINANCE").unwrap_or_default());
            let secret = Secret::new(std::env::var("MERIDIAN_API_SECRET_BINANCE").unwrap_or_default());
            if api_key.is_empty() || secret.is_empty() {
                anyhow::bail!("live mode requires MERIDIAN_API_KEY_BINANCE and MERIDIAN_API_SECRET_BINANCE");
            }
            Arc::new(BinanceFutures::new(api_key, secret))
        }
        AccountMode::Paper => {
            let paper = Arc::new(PaperVenue::new("paper", true));
            for symbol in &cfg.symbols {
                paper.set_symbol_info(SymbolInfo {
                    symbol: symbol.clone(),
                    base_asset: symbol.trim_end_matches("USDT").to_string(),
                    quote_asset: "USDT".to_string(),
                    tick_size: dec!(0.01),
                    step_size: dec!(0.001),
                    price_decimals: 2,
                    qty_decimals: 3,
                    min_notional: dec!(10),
                });
            }
            paper
        }
    };

    // ── 3. Shared state, alerts, shutdown ────────────────────────────────
    let alert = Arc::new(AlertSender::new(cfg.alert_webhooks.clone()));
    let state = Arc::new(AppState::new(cfg.clone(), venue.clone(), alert.clone()));
    let (shutdown_ctl, shutdown) = ShutdownController::new();

    let limiter = Arc::new(RateLimiter::new(
        cfg.executor.orders_per_sec,
        cfg.executor.order_burst,
    ));

    // ── 4. Per-symbol engines: store → recover → reconcile → event loop ──
    for symbol in &cfg.symbols {
        let symbol_info = match venue.get_symbol_info(symbol).await {
            Ok(info) => info,
            Err(e) => {
                error!(symbol = %symbol, error = %e, "symbol info unavailable — skipping engine");
                continue;
            }
        };

        let store = Arc::new(StateStore::open(format!("{}/{}.db", cfg.state_dir, symbol))?);
        let order_executor = Arc::new(OrderExecutor::new(
            venue.clone(),
            limiter.clone(),
            cfg.executor.clone(),
        ));

        let engine = Arc::new(Engine::new(
            symbol.clone(),
            cfg.grid.clone(),
            symbol_info,
            order_executor.clone(),
            store,
            state.risk_monitor.clone(),
            state.breaker.clone(),
            state.regime_monitor.clone(),
        ));

        // Recovery: a checksum failure refuses to start — operator action.
        engine.recover()?;

        let reconciler = Arc::new(Reconciler::new(
            engine.clone(),
            venue.clone(),
            order_executor,
            state.risk_monitor.clone(),
            state.breaker.clone(),
            alert.clone(),
            cfg.reconciler.clone(),
        ));

        // One reconcile pass before the first handler dispatches.
        if let Err(e) = reconciler.reconcile_once(&shutdown).await {
            warn!(symbol = %symbol, error = %e, "startup reconcile failed");
        }

        let (handle, critical_rx, lossy_rx) = engine_queues(symbol, cfg.event_queue_capacity);
        tokio::spawn(run_event_loop(
            engine.clone(),
            critical_rx,
            lossy_rx,
            shutdown.clone(),
        ));

        tokio::spawn(reconciler.clone().run(shutdown.clone()));
        tokio::spawn(reconciler.clone().run_cleaner(shutdown.clone()));

        state.engines.write().insert(symbol.clone(), engine);
        state.engine_handles.write().insert(symbol.clone(), handle);
        state.reconcilers.write().insert(symbol.clone(), reconciler);
    }
    info!(count = state.engines.read().len(), "engines started");

    // ── 5. Market data & account streams ─────────────────────────────────
    spawn_streams(&state, &venue, &cfg, &shutdown);

    // ── 6. Portfolio controller ──────────────────────────────────────────
    {
        let scanner = Arc::new(Scanner::new(
            venue.clone(),
            cfg.portfolio.scanner_workers,
            cfg.arbitrage.funding_interval_hours,
        ));
        let portfolio_store = Arc::new(StateStore::open(format!("{}/portfolio.db", cfg.state_dir))?);
        let portfolio_executor = Arc::new(OrderExecutor::new(
            venue.clone(),
            limiter.clone(),
            cfg.executor.clone(),
        ));
        let applier = Arc::new(ArbRebalanceApplier::new(
            portfolio_executor.clone(),
            portfolio_executor,
            portfolio_store.clone(),
            state.breaker.clone(),
            alert.clone(),
            state.funding_monitor.clone(),
            dec!(0.001),
        ));
        let controller = Arc::new(PortfolioController::new(
            scanner.clone(),
            venue.clone(),
            portfolio_store,
            applier,
            cfg.portfolio.clone(),
        ));
        *state.scanner.write() = Some(scanner);
        *state.portfolio.write() = Some(controller.clone());

        let current_state = state.clone();
        tokio::spawn(controller.run(
            cfg.symbols.clone(),
            Arc::new(move || current_state.current_notionals()),
            shutdown.clone(),
        ));
    }

    // ── 7. Venue health probe ────────────────────────────────────────────
    {
        let probe_state = state.clone();
        let probe_venue = venue.clone();
        let mut sd = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = sd.cancelled() => return,
                }
                let healthy = probe_venue.check_health().await.is_ok();
                let was = *probe_state.venue_healthy.read();
                if healthy != was {
                    if healthy {
                        info!("venue health restored");
                    } else {
                        warn!("venue health probe failing — reporting DEGRADED");
                    }
                    *probe_state.venue_healthy.write() = healthy;
                    probe_state.increment_version();
                }
            }
        });
    }

    // ── 8. API server ────────────────────────────────────────────────────
    let bind_addr = std::env::var("MERIDIAN_BIND_ADDR").unwrap_or_else(|_| cfg.bind_addr.clone());
    {
        let api_state = state.clone();
        let addr = bind_addr.clone();
        tokio::spawn(async move {
            let app = api::rest::router(api_state);
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .expect("failed to bind API server");
            info!(addr = %addr, "API server listening");
            axum::serve(listener, app).await.expect("API server failed");
        });
    }

    info!("all subsystems running. Press Ctrl+C to stop.");

    // ── 9. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");
    shutdown_ctl.shutdown();

    if let Err(e) = state.runtime_config.read().save("runtime_config.json") {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    // Give stream and engine tasks a beat to observe the signal.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    info!("Meridian Funding Nexus shut down complete.");
    Ok(())
}

/// Spawn the venue streams and fan their events into monitors and per-engine
/// queues. Adapters reconnect internally until shutdown.
fn spawn_streams(
    state: &Arc<AppState>,
    venue: &Arc<dyn Venue>,
    cfg: &RuntimeConfig,
    shutdown: &crate::types::Shutdown,
) {
    let symbols = cfg.symbols.clone();
    let capacity = cfg.event_queue_capacity;

    // Price ticks → lossy engine queues.
    {
        let (tx, mut rx) = tokio::sync::mpsc::channel(capacity);
        let stream_venue = venue.clone();
        let stream_symbols = symbols.clone();
        let stream_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = stream_venue
                .start_price_stream(stream_symbols, tx, stream_shutdown)
                .await
            {
                error!(error = %e, "price stream terminated");
            }
        });
        let route_state = state.clone();
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                if let Some(handle) = route_state.engine_handles.read().get(&update.symbol) {
                    handle.send_lossy(EngineEvent::Price(update));
                }
            }
        });
    }

    // Execution reports → critical engine queues.
    {
        let (tx, mut rx) = tokio::sync::mpsc::channel(capacity);
        let stream_venue = venue.clone();
        let stream_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = stream_venue.start_order_stream(tx, stream_shutdown).await {
                error!(error = %e, "order stream terminated");
            }
        });
        let route_state = state.clone();
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                let handle = route_state.engine_handles.read().get(&update.symbol).cloned();
                if let Some(handle) = handle {
                    handle.send_critical(EngineEvent::Order(update)).await;
                }
            }
        });
    }

    // Klines → risk + regime monitors.
    {
        let (tx, mut rx) = tokio::sync::mpsc::channel(capacity);
        let stream_venue = venue.clone();
        let stream_symbols = symbols.clone();
        let stream_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = stream_venue
                .start_kline_stream(stream_symbols, "1m", tx, stream_shutdown)
                .await
            {
                error!(error = %e, "kline stream terminated");
            }
        });
        let route_state = state.clone();
        tokio::spawn(async move {
            while let Some(kline) = rx.recv().await {
                route_state.risk_monitor.on_kline(&kline);
                route_state.regime_monitor.on_kline(kline);
            }
        });
    }

    // Funding → funding monitor + lossy engine queues.
    {
        let (tx, mut rx) = tokio::sync::mpsc::channel(capacity);
        let stream_venue = venue.clone();
        let stream_symbols = symbols.clone();
        let stream_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = stream_venue
                .start_funding_rate_stream(stream_symbols, tx, stream_shutdown)
                .await
            {
                error!(error = %e, "funding stream terminated");
            }
        });
        let route_state = state.clone();
        tokio::spawn(async move {
            while let Some(rate) = rx.recv().await {
                route_state.funding_monitor.update(rate.clone());
                if let Some(handle) = route_state.engine_handles.read().get(&rate.symbol) {
                    handle.send_lossy(EngineEvent::Funding(rate));
                }
            }
        });
    }

    // Account updates → critical queues of every engine.
    {
        let (tx, mut rx) = tokio::sync::mpsc::channel(capacity);
        let stream_venue = venue.clone();
        let stream_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = stream_venue.start_account_stream(tx, stream_shutdown).await {
                error!(error = %e, "account stream terminated");
            }
        });
        let route_state = state.clone();
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                let handles: Vec<_> = route_state.engine_handles.read().values().cloned().collect();
                for handle in handles {
                    handle
                        .send_critical(EngineEvent::Account(update.clone()))
                        .await;
                }
            }
        });
    }

    // Position updates → critical queue of the owning engine.
    {
        let (tx, mut rx) = tokio::sync::mpsc::channel(capacity);
        let stream_venue = venue.clone();
        let stream_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = stream_venue.start_position_stream(tx, stream_shutdown).await {
                error!(error = %e, "position stream terminated");
            }
        });
        let route_state = state.clone();
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                let handle = route_state.engine_handles.read().get(&update.symbol).cloned();
                if let Some(handle) = handle {
                    handle.send_critical(EngineEvent::Position(update)).await;
                }
            }
        });
    }

    info!(count = symbols.len(), "market data streams launched");
}
