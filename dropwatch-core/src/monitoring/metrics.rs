//! Prometheus metrics for the drop-buy trading engine.
//!
//! Counters/gauges for orders sent/filled/failed, reconciliation drift,
//! active positions, and phase-transition counts per phase, registered
//! once at startup and exposed over HTTP by `monitoring::server`.

use prometheus::{
    Counter, Gauge, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Arc<Registry>,
    orders: Arc<OrderMetrics>,
    positions: Arc<PositionMetrics>,
    phases: Arc<PhaseMetrics>,
    reconcile: Arc<ReconcileMetrics>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Arc::new(Registry::new());

        let orders = Arc::new(OrderMetrics::new(&registry)?);
        let positions = Arc::new(PositionMetrics::new(&registry)?);
        let phases = Arc::new(PhaseMetrics::new(&registry)?);
        let reconcile = Arc::new(ReconcileMetrics::new(&registry)?);

        info!("Prometheus metrics registry initialized");

        Ok(Self {
            registry,
            orders,
            positions,
            phases,
            reconcile,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn orders(&self) -> &OrderMetrics {
        &self.orders
    }

    pub fn positions(&self) -> &PositionMetrics {
        &self.positions
    }

    pub fn phases(&self) -> &PhaseMetrics {
        &self.phases
    }

    pub fn reconcile(&self) -> &ReconcileMetrics {
        &self.reconcile
    }
}

impl Default for MetricsRegistry {
    #[allow(clippy::panic)]
    fn default() -> Self {
        Self::new().unwrap_or_else(|e| {
            tracing::error!("FATAL: failed to create metrics registry: {}", e);
            panic!("cannot create metrics registry")
        })
    }
}

/// Order-router activity.
pub struct OrderMetrics {
    pub orders_sent_total: IntCounterVec,
    pub orders_filled_total: IntCounterVec,
    pub orders_failed_total: IntCounterVec,
    pub orders_canceled_total: IntCounterVec,
    pub retries_total: IntCounterVec,
}

impl OrderMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let orders_sent_total = IntCounterVec::new(
            Opts::new("orders_sent_total", "Total orders sent to the exchange").namespace("dropwatch"),
            &["symbol", "side"],
        )?;
        registry.register(Box::new(orders_sent_total.clone()))?;

        let orders_filled_total = IntCounterVec::new(
            Opts::new("orders_filled_total", "Total orders that reached FILLED").namespace("dropwatch"),
            &["symbol", "side"],
        )?;
        registry.register(Box::new(orders_filled_total.clone()))?;

        let orders_failed_total = IntCounterVec::new(
            Opts::new("orders_failed_total", "Total orders that reached FAILED").namespace("dropwatch"),
            &["symbol", "reason"],
        )?;
        registry.register(Box::new(orders_failed_total.clone()))?;

        let orders_canceled_total = IntCounterVec::new(
            Opts::new("orders_canceled_total", "Total orders canceled").namespace("dropwatch"),
            &["symbol"],
        )?;
        registry.register(Box::new(orders_canceled_total.clone()))?;

        let retries_total = IntCounterVec::new(
            Opts::new("order_retries_total", "Total router retry attempts").namespace("dropwatch"),
            &["symbol"],
        )?;
        registry.register(Box::new(retries_total.clone()))?;

        Ok(Self {
            orders_sent_total,
            orders_filled_total,
            orders_failed_total,
            orders_canceled_total,
            retries_total,
        })
    }
}

/// Portfolio / position state.
pub struct PositionMetrics {
    pub active_positions: IntGauge,
    pub free_balance_usd: Gauge,
    pub reserved_balance_usd: Gauge,
    pub realized_pnl_usd_total: Counter,
}

impl PositionMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let active_positions = IntGauge::new(
            "dropwatch_active_positions",
            "Number of symbols currently holding a position",
        )?;
        registry.register(Box::new(active_positions.clone()))?;

        let free_balance_usd = Gauge::new("dropwatch_free_balance_usd", "Free quote balance")?;
        registry.register(Box::new(free_balance_usd.clone()))?;

        let reserved_balance_usd =
            Gauge::new("dropwatch_reserved_balance_usd", "Reserved quote balance")?;
        registry.register(Box::new(reserved_balance_usd.clone()))?;

        let realized_pnl_usd_total = Counter::new(
            "dropwatch_realized_pnl_usd_total",
            "Cumulative realized PnL in USD (may be reported negative via a gauge upstream)",
        )?;
        registry.register(Box::new(realized_pnl_usd_total.clone()))?;

        Ok(Self {
            active_positions,
            free_balance_usd,
            reserved_balance_usd,
            realized_pnl_usd_total,
        })
    }
}

/// Phase-transition counters, one series per phase name.
pub struct PhaseMetrics {
    pub transitions_total: IntCounterVec,
    pub symbols_in_phase: IntGaugeVec,
}

impl PhaseMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let transitions_total = IntCounterVec::new(
            Opts::new("phase_transitions_total", "Total phase transitions").namespace("dropwatch"),
            &["from", "to"],
        )?;
        registry.register(Box::new(transitions_total.clone()))?;

        let symbols_in_phase = IntGaugeVec::new(
            Opts::new("symbols_in_phase", "Number of symbols currently in each phase")
                .namespace("dropwatch"),
            &["phase"],
        )?;
        registry.register(Box::new(symbols_in_phase.clone()))?;

        Ok(Self {
            transitions_total,
            symbols_in_phase,
        })
    }
}

/// Reconciler drift tracking.
pub struct ReconcileMetrics {
    pub runs_total: Counter,
    pub drift_events_total: IntCounterVec,
    pub orphans_adopted_total: Counter,
    pub orphans_closed_total: Counter,
}

impl ReconcileMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let runs_total = Counter::new("dropwatch_reconcile_runs_total", "Total reconciler cycles")?;
        registry.register(Box::new(runs_total.clone()))?;

        let drift_events_total = IntCounterVec::new(
            Opts::new("reconcile_drift_events_total", "Total position/balance drift corrections")
                .namespace("dropwatch"),
            &["symbol"],
        )?;
        registry.register(Box::new(drift_events_total.clone()))?;

        let orphans_adopted_total = Counter::new(
            "dropwatch_reconcile_orphans_adopted_total",
            "Total exchange orders adopted under a generated intent id",
        )?;
        registry.register(Box::new(orphans_adopted_total.clone()))?;

        let orphans_closed_total = Counter::new(
            "dropwatch_reconcile_orphans_closed_total",
            "Total exchange orders closed as orphans",
        )?;
        registry.register(Box::new(orphans_closed_total.clone()))?;

        Ok(Self {
            runs_total,
            drift_events_total,
            orphans_adopted_total,
            orphans_closed_total,
        })
    }
}
