//! Drives the drop-buy engine against the simulated exchange adapter.
//!
//! Wires together configuration loading, the market-data service, the
//! reconciler, the Prometheus metrics server, and the FSM engine itself,
//! then runs until a kill-switch signal or Ctrl-C trips the shared
//! shutdown flag.

use anyhow::{Context, Result};
use clap::Parser;
use dropwatch_bins::common::{init_logging, CommonArgs};
use dropwatch_core::bus::EventBus;
use dropwatch_core::config::EngineConfig;
use dropwatch_core::core::Symbol;
use dropwatch_core::engine::{Engine, ShutdownCoordinator};
use dropwatch_core::exchange::SimulatedExchangeAdapter;
use dropwatch_core::market::{AnchorManager, MarketDataService};
use dropwatch_core::monitoring::{MetricsRegistry, MetricsServer, MetricsServerConfig};
use dropwatch_core::portfolio::Portfolio;
use dropwatch_core::quantize::FilterCache;
use dropwatch_core::reconcile::{OrphanPolicy, Reconciler, ReconcilerClock};
use dropwatch_core::resilience::KillSwitch;
use dropwatch_core::router::OrderRouter;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

fn main() -> Result<()> {
    let args = CommonArgs::parse();
    let config = EngineConfig::load(&args.config)?;
    init_logging(&args.log_level, config.metrics.json_logs)?;

    tracing::info!("dropwatch engine starting up");

    let symbols: Vec<Symbol> = args.symbols.iter().map(|s| Symbol::new(s)).collect();
    if symbols.is_empty() {
        anyhow::bail!("no symbols given; pass --symbols BTC-USDT,ETH-USDT");
    }

    let exchange: Arc<SimulatedExchangeAdapter> = Arc::new(SimulatedExchangeAdapter::new());
    let initial_budget = Decimal::from_str(&args.initial_budget)?;
    let bus = EventBus::new();
    let portfolio = Arc::new(Portfolio::new(initial_budget).with_event_bus(bus.clone()));
    let router = Arc::new(OrderRouter::new(exchange.clone(), config.router.clone()));
    let anchors = Arc::new(AnchorManager::new());
    let filters = Arc::new(FilterCache::new());

    let kill_switch = KillSwitch::install();
    let shutdown = Arc::new(AtomicBool::new(false));

    let ctrlc_switch = kill_switch.clone();
    ctrlc::set_handler(move || ctrlc_switch.shutdown("SIGINT received"))
        .context("failed to install Ctrl-C handler")?;

    let (snapshot_tx, snapshot_rx) = mpsc::channel();
    let market_data = Arc::new(MarketDataService::new(
        exchange.clone(),
        symbols.clone(),
        config.market_data.clone(),
        config.signal.clone(),
        anchors.clone(),
        snapshot_tx,
        shutdown.clone(),
    ));
    let md_handle = market_data.clone().run_supervised();

    let mut engine = Engine::new(
        config.clone(),
        exchange.clone() as Arc<dyn dropwatch_core::exchange::ExchangeAdapter>,
        portfolio.clone(),
        router.clone(),
        anchors.clone(),
        filters.clone(),
        snapshot_rx,
        shutdown.clone(),
    )
    .with_event_bus(bus);

    if config.metrics.enable_prometheus {
        let metrics = Arc::new(MetricsRegistry::new()?);
        engine = engine.with_metrics(metrics.clone());
        spawn_metrics_server(&config.metrics.metrics_addr, metrics)?;
    }

    let engine = Arc::new(engine);
    for symbol in &symbols {
        engine.register_symbol(symbol.clone());
    }

    let reconciler = Reconciler::new(
        exchange.clone(),
        router.clone(),
        portfolio.clone(),
        OrphanPolicy::Close,
    );
    let reconcile_handle = spawn_reconciler(reconciler, engine.clone(), config.router.reconciler_interval_s, shutdown.clone());

    let engine_for_run = engine.clone();
    let engine_handle = std::thread::spawn(move || engine_for_run.run());

    let mut coordinator = ShutdownCoordinator::new(shutdown.clone(), Duration::from_secs(10));
    coordinator.register("market_data", md_handle);
    coordinator.register("reconciler", reconcile_handle);
    coordinator.register("engine", engine_handle);

    while !kill_switch.should_stop() {
        std::thread::sleep(Duration::from_millis(200));
    }
    shutdown.store(true, Ordering::Relaxed);

    let stragglers = coordinator.shutdown(&portfolio);
    if !stragglers.is_empty() {
        tracing::warn!(?stragglers, "threads did not join within the shutdown timeout");
    }

    tracing::info!("dropwatch engine stopped");
    Ok(())
}

fn spawn_reconciler(
    reconciler: Reconciler,
    engine: Arc<Engine>,
    interval_s: u64,
    shutdown: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut clock = ReconcilerClock::new(interval_s);
        while !shutdown.load(Ordering::Relaxed) {
            if clock.due() {
                let intents = engine.tracked_intents();
                match reconciler.sync(&intents) {
                    Ok(report) => tracing::debug!(?report, "reconcile cycle complete"),
                    Err(e) => tracing::warn!(error = %e, "reconcile cycle failed"),
                }
                clock.mark_run();
            }
            std::thread::sleep(Duration::from_millis(500));
        }
    })
}

fn spawn_metrics_server(addr: &str, registry: Arc<MetricsRegistry>) -> Result<()> {
    let listen_addr = addr.parse()?;
    let server = MetricsServer::new(MetricsServerConfig { listen_addr, metrics_path: "/metrics".into() }, registry);
    std::thread::spawn(move || {
        let rt = match tokio::runtime::Runtime::new() {
            Ok(rt) => rt,
            Err(e) => {
                tracing::error!(error = %e, "failed to start metrics server runtime");
                return;
            }
        };
        if let Err(e) = rt.block_on(server.serve()) {
            tracing::error!(error = %e, "metrics server exited");
        }
    });
    Ok(())
}
