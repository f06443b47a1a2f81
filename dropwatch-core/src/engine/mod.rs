//! The FSM Engine: owns the per-symbol phase map and drives the main loop.
//!
//! Generalizes `engine::generic::Engine`'s outer loop (shared shutdown
//! flag, `while !shutdown` main loop, draining side effects before any
//! early return) from one owned `Position` to a `DashMap<Symbol,
//! SymbolState>`. Phase dispatch is a flat `match` rather than the
//! move-based typestate used for forward-only graphs elsewhere in this
//! codebase: this graph has back-edges (POSITION<->EXIT_EVAL,
//! PLACE_SELL<->WAIT_SELL_FILL, any->ERROR) that a move-based typestate
//! can't express without a sum type at every call site.

use crate::config::{EngineConfig, LowLiquidityAction};
use crate::core::{
    now_ms, EngineError, EngineResult, GhostPositionLog, IntentId, Phase, ReservationId, Side, Symbol, SymbolState,
    TimeInForce,
};
use crate::exchange::{ExchangeAdapter, OrderStatus};
use crate::exits::{DynamicProtectionManager, ExitEngine, ProtectionSwitch, WaitFillOutcome, WaitFillService};
use crate::guards::MarketGuards;
use crate::market::{AnchorManager, DropSignalEvaluator, Snapshot};
use crate::monitoring::MetricsRegistry;
use crate::portfolio::Portfolio;
use crate::quantize::{FilterCache, FilterRecord};
use crate::router::{OrderRouter, SubmitParams};
use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub use crate::bus::{BusEvent, EventBus};

/// Backoff schedule for the ERROR phase: 10s, 20s, 40s, ... capped, then
/// pinned once `FSM_MAX_RETRIES` is exceeded pending manual reset.
const FSM_BACKOFF_BASE_S: u64 = 10;
const FSM_BACKOFF_MAX_S: u64 = 300;
const FSM_MAX_RETRIES: u32 = 8;

/// Active scanner runs roughly every 3s at a 500ms cycle interval.
const SCAN_EVERY_N_CYCLES: u64 = 6;

pub struct Engine {
    states: DashMap<Symbol, SymbolState>,
    latest_snapshots: DashMap<Symbol, Snapshot>,
    scanner_flags: DashMap<Symbol, bool>,
    protection_switch_ms: DashMap<Symbol, u64>,
    config: EngineConfig,
    exchange: Arc<dyn ExchangeAdapter>,
    portfolio: Arc<Portfolio>,
    router: Arc<OrderRouter>,
    anchors: Arc<AnchorManager>,
    filters: Arc<FilterCache>,
    metrics: Option<Arc<MetricsRegistry>>,
    bus: EventBus,
    snapshot_rx: Receiver<Vec<Snapshot>>,
    shutdown: Arc<AtomicBool>,
    cycle_count: AtomicU64,
    ghost_positions: GhostPositionLog,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        exchange: Arc<dyn ExchangeAdapter>,
        portfolio: Arc<Portfolio>,
        router: Arc<OrderRouter>,
        anchors: Arc<AnchorManager>,
        filters: Arc<FilterCache>,
        snapshot_rx: Receiver<Vec<Snapshot>>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            states: DashMap::new(),
            latest_snapshots: DashMap::new(),
            scanner_flags: DashMap::new(),
            protection_switch_ms: DashMap::new(),
            config,
            exchange,
            portfolio,
            router,
            anchors,
            filters,
            metrics: None,
            bus: EventBus::new(),
            snapshot_rx,
            shutdown,
            cycle_count: AtomicU64::new(0),
            ghost_positions: GhostPositionLog::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Adopt an externally-created bus so `Portfolio`'s budget events and
    /// the engine's own order/phase events land on one shared stream
    /// instead of two independent ones nobody can subscribe to together.
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn event_bus(&self) -> EventBus {
        self.bus.clone()
    }

    /// Every ghost position retained in the ring buffer, oldest first —
    /// for a UI or operator to inspect aborted buy attempts.
    pub fn ghost_positions(&self) -> Vec<crate::core::GhostPosition> {
        self.ghost_positions.all()
    }

    pub fn ghost_positions_for(&self, symbol: &Symbol) -> Vec<crate::core::GhostPosition> {
        self.ghost_positions.for_symbol(symbol)
    }

    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Shared with `MarketDataService`, which is the thread that actually
    /// calls `update()` on every snapshot; exposed here so a binary can
    /// persist anchor state at shutdown without owning a second handle.
    pub fn anchors(&self) -> &Arc<AnchorManager> {
        &self.anchors
    }

    pub fn register_symbol(&self, symbol: Symbol) {
        self.states.entry(symbol.clone()).or_insert_with(|| SymbolState::new(symbol));
    }

    pub fn symbol_state(&self, symbol: &Symbol) -> Option<SymbolState> {
        self.states.get(symbol).map(|s| s.clone())
    }

    pub fn tracked_intents(&self) -> Vec<IntentId> {
        self.states.iter().filter_map(|s| s.pending_intent_id).collect()
    }

    /// Main loop: drain market data, dispatch every tracked symbol once,
    /// run the active scanner on its cadence, sleep, repeat until the
    /// shared shutdown flag trips.
    pub fn run(&self) {
        info!("engine main loop starting");
        let cycle_interval = Duration::from_millis(self.config.market_data.md_poll_ms.max(1));

        while !self.shutdown.load(Ordering::Relaxed) {
            self.drain_snapshots();

            let symbols: Vec<Symbol> = self.states.iter().map(|e| e.key().clone()).collect();
            for symbol in &symbols {
                self.dispatch(symbol);
            }

            let cycle = self.cycle_count.fetch_add(1, Ordering::Relaxed) + 1;
            if cycle % SCAN_EVERY_N_CYCLES == 0 {
                self.scan_for_opportunities();
            }

            std::thread::sleep(cycle_interval);
        }

        info!("engine main loop stopping, flushing portfolio");
        self.portfolio.flush();
    }

    fn drain_snapshots(&self) {
        while let Ok(batch) = self.snapshot_rx.try_recv() {
            for snap in &batch {
                self.latest_snapshots.insert(snap.symbol.clone(), snap.clone());
            }
            if !batch.is_empty() {
                self.bus.publish(BusEvent::MarketSnapshots(batch));
            }
        }
    }

    fn open_position_count(&self) -> usize {
        self.states.iter().filter(|e| e.phase.has_open_position()).count()
    }

    fn record_phase_metric(&self, from: Phase, to: Phase) {
        if let Some(metrics) = &self.metrics {
            metrics
                .phases()
                .transitions_total
                .with_label_values(&[phase_tag(from), phase_tag(to)])
                .inc();
        }
    }

    fn dispatch(&self, symbol: &Symbol) {
        let phase = match self.states.get(symbol) {
            Some(s) => s.phase,
            None => return,
        };

        let result = match phase {
            Phase::Warmup => self.handle_warmup(symbol),
            Phase::Idle => self.handle_idle(symbol),
            Phase::EntryEval => self.handle_entry_eval(symbol),
            Phase::PlaceBuy => self.handle_place_buy(symbol),
            Phase::WaitFill => self.handle_wait_fill(symbol),
            Phase::Position => self.handle_position(symbol),
            Phase::ExitEval => self.handle_exit_eval(symbol),
            Phase::PlaceSell => self.handle_place_sell(symbol),
            Phase::WaitSellFill => self.handle_wait_sell_fill(symbol),
            Phase::PostTrade => self.handle_post_trade(symbol),
            Phase::Cooldown => self.handle_cooldown(symbol),
            Phase::Error => self.handle_error(symbol),
        };

        if let Err(e) = result {
            if e.is_recoverable_locally() {
                warn!(%symbol, error = %e, "recoverable error left unhandled by phase handler, retrying next cycle");
            } else {
                self.route_to_error(symbol, &e);
            }
        } else if let Some(state) = self.states.get(symbol) {
            let to = state.phase;
            drop(state);
            if to != phase {
                self.record_phase_metric(phase, to);
            }
        }
    }

    fn route_to_error(&self, symbol: &Symbol, e: &EngineError) {
        if let Some(mut state) = self.states.get_mut(symbol) {
            let from = state.phase;
            state.error_count += 1;
            state.last_error = Some(e.to_string());
            state.transition(Phase::Error, "ERROR_OCCURRED");
            drop(state);
            self.record_phase_metric(from, Phase::Error);
        }
        error!(%symbol, error = %e, "ERROR_OCCURRED");
    }

    fn get_filters(&self, symbol: &Symbol) -> FilterRecord {
        self.filters.get_or_insert_with(symbol, || {
            self.exchange.market(symbol).unwrap_or_else(|_| FilterRecord::conservative_default())
        })
    }

    // ---- phase handlers --------------------------------------------------

    fn handle_warmup(&self, symbol: &Symbol) -> EngineResult<()> {
        let Some(snapshot) = self.latest_snapshots.get(symbol) else { return Ok(()) };
        let last = snapshot.last;
        drop(snapshot);
        if let Some(mut state) = self.states.get_mut(symbol) {
            state.current_price = last;
            state.transition(Phase::Idle, "warmup_complete");
        }
        Ok(())
    }

    fn handle_idle(&self, symbol: &Symbol) -> EngineResult<()> {
        let Some(mut state) = self.states.get_mut(symbol) else { return Ok(()) };
        if state.is_in_cooldown() {
            return Ok(());
        }
        if self.open_position_count() >= self.config.trading.max_concurrent_positions {
            return Ok(());
        }
        let flagged = self.scanner_flags.remove(symbol).map(|(_, v)| v).unwrap_or(false);
        if flagged {
            state.transition(Phase::EntryEval, "SLOT_AVAILABLE");
        }
        Ok(())
    }

    fn handle_entry_eval(&self, symbol: &Symbol) -> EngineResult<()> {
        let Some(snapshot) = self.latest_snapshots.get(symbol).map(|s| s.clone()) else { return Ok(()) };
        let filters = self.get_filters(symbol);
        let Some(mut state) = self.states.get_mut(symbol) else { return Ok(()) };

        if !snapshot.usable() {
            state.transition(Phase::Idle, "stale_data");
            return Ok(());
        }

        let open = self.open_position_count();
        let budget = self.portfolio.free_balance();
        let report = MarketGuards::evaluate_entry(
            &snapshot,
            &state,
            &self.config.trading,
            &self.config.guard,
            open,
            budget,
            filters,
        );
        if !report.passed() {
            state.cooldown_until_ms = Some(now_ms() + self.config.trading.entry_block_cooldown_s * 1000);
            state.transition(Phase::Idle, format!("guard_block:{:?}", report.failed));
            return Ok(());
        }

        let drop = DropSignalEvaluator::evaluate(&snapshot, self.config.signal.drop_trigger_value);
        if !drop.triggered {
            state.transition(Phase::Idle, "drop_not_triggered");
            return Ok(());
        }

        state.entry_signal_tag = Some(drop.mode_tag.to_string());
        state.transition(Phase::PlaceBuy, "entry_conditions_met");
        Ok(())
    }

    fn handle_place_buy(&self, symbol: &Symbol) -> EngineResult<()> {
        let Some(snapshot) = self.latest_snapshots.get(symbol).map(|s| s.clone()) else { return Ok(()) };
        let filters = self.get_filters(symbol);

        let price = snapshot.ask.max(snapshot.last);
        if price <= Decimal::ZERO {
            if let Some(mut state) = self.states.get_mut(symbol) {
                state.transition(Phase::Idle, "BUY_ABORTED:invalid_price");
            }
            return Ok(());
        }

        let position_size = self.config.trading.position_size_usdt;
        let raw_qty = position_size / price;
        let timestamp_bucket = now_ms() / 1000;
        let intent_id = IntentId::derive(symbol, Side::Buy, raw_qty, price, timestamp_bucket);
        let reservation_id = ReservationId::from_intent(intent_id);

        if !self.portfolio.reserve(position_size, symbol, Side::Buy, reservation_id) {
            if let Some(mut state) = self.states.get_mut(symbol) {
                state.transition(Phase::Idle, "BUY_ABORTED:insufficient_budget");
            }
            return Ok(());
        }
        self.bus.publish(BusEvent::BudgetReserved { symbol: symbol.clone(), amount: position_size });

        let submit = self.router.submit(
            intent_id,
            SubmitParams {
                symbol: symbol.clone(),
                side: Side::Buy,
                raw_price: price,
                raw_quantity: raw_qty,
                time_in_force: TimeInForce::GoodTilCanceled,
                timestamp_bucket,
            },
            filters,
        );

        let Some(mut state) = self.states.get_mut(symbol) else { return Ok(()) };
        match submit {
            Ok(intent) => {
                state.pending_intent_id = Some(intent_id);
                state.active_order_id = intent.exchange_order_id.clone();
                state.client_order_id = Some(intent.client_order_id.clone());
                state.order_placed_ms = Some(now_ms());
                state.partial_fill_first_seen_ms = None;
                state.transition(Phase::WaitFill, "order_submitted");
                drop(state);
                if let Some(metrics) = &self.metrics {
                    metrics.orders().orders_sent_total.with_label_values(&[symbol.as_str(), "buy"]).inc();
                }
                self.bus.publish(BusEvent::OrderIntent { symbol: symbol.clone(), intent_id, side: Side::Buy });
                Ok(())
            }
            Err(e) => {
                self.portfolio.release(reservation_id, "buy_submit_failed");
                self.bus.publish(BusEvent::BudgetReleased { symbol: symbol.clone(), amount: position_size });
                self.bus.publish(BusEvent::OrderFailed { symbol: symbol.clone(), intent_id, reason: e.to_string() });
                match &e {
                    EngineError::ComplianceError(reason) => {
                        self.ghost_positions.record(symbol.clone(), reason.clone());
                        state.transition(Phase::Idle, "BUY_ABORTED:compliance");
                        Ok(())
                    }
                    EngineError::GuardBlock(_) | EngineError::BudgetError(_) => {
                        state.transition(Phase::Idle, "BUY_ABORTED:compliance");
                        Ok(())
                    }
                    EngineError::ExchangeRejection { .. } | EngineError::LiquidityBlock(_) => {
                        state.transition(Phase::Idle, "BUY_ABORTED:rejected");
                        Ok(())
                    }
                    EngineError::ExchangeTransient(_) | EngineError::StaleData(_) => {
                        // leave in PLACE_BUY, retried next cycle
                        Ok(())
                    }
                    EngineError::Unhandled(_) => Err(e),
                }
            }
        }
    }

    fn handle_wait_fill(&self, symbol: &Symbol) -> EngineResult<()> {
        let Some(mut state) = self.states.get_mut(symbol) else { return Ok(()) };
        let Some(intent_id) = state.pending_intent_id else {
            state.transition(Phase::Idle, "BUY_ABORTED:missing_intent");
            return Ok(());
        };
        let Some(intent) = self.router.get(intent_id) else {
            state.transition(Phase::Idle, "BUY_ABORTED:missing_intent");
            return Ok(());
        };

        let exchange_order = intent
            .exchange_order_id
            .as_deref()
            .and_then(|id| self.exchange.fetch_order(id, symbol).ok());
        if let Some(order) = &exchange_order {
            if order.status == OrderStatus::PartiallyFilled && state.partial_fill_first_seen_ms.is_none() {
                state.partial_fill_first_seen_ms = Some(now_ms());
            }
        }
        let placed_at = state.order_placed_ms.unwrap_or_else(now_ms);
        let outcome = WaitFillService::evaluate(
            exchange_order.as_ref(),
            placed_at,
            state.partial_fill_first_seen_ms,
            self.config.execution.wait_fill_timeout_s,
            self.config.execution.partial_max_age_s,
        );

        match outcome {
            WaitFillOutcome::Pending => Ok(()),
            WaitFillOutcome::Filled => {
                let (filled_qty, avg_price, fee) = exchange_order
                    .map(|o| (o.filled_qty, o.avg_fill_price, o.fee))
                    .unwrap_or((intent.quantity, intent.limit_price, Decimal::ZERO));
                self.router.mark_filled(intent_id, filled_qty, avg_price, fee);
                self.portfolio
                    .apply_fill(ReservationId::from_intent(intent_id), symbol, Side::Buy, filled_qty, avg_price, fee);

                state.amount = filled_qty;
                state.entry_price = avg_price;
                state.fee_per_unit = if filled_qty.is_zero() { Decimal::ZERO } else { fee / filled_qty };
                state.current_price = avg_price;
                state.entry_ts_ms = Some(now_ms());
                state.trail_high = avg_price;
                state.trailing_active = false;
                state.tp_price = Some(avg_price * (Decimal::ONE + self.config.protection.tp_pct / Decimal::ONE_HUNDRED));
                state.sl_price = Some(avg_price * (Decimal::ONE - self.config.protection.sl_pct / Decimal::ONE_HUNDRED));
                state.tp_active = true;
                state.sl_active = true;
                state.pending_intent_id = None;
                state.transition(Phase::Position, "filled");
                drop(state);
                if let Some(metrics) = &self.metrics {
                    metrics.orders().orders_filled_total.with_label_values(&[symbol.as_str(), "buy"]).inc();
                    metrics.positions().active_positions.set(self.open_position_count() as i64);
                }
                self.bus
                    .publish(BusEvent::OrderFilled { symbol: symbol.clone(), intent_id, qty: filled_qty, price: avg_price });
                Ok(())
            }
            WaitFillOutcome::Canceled => {
                if let Some(order_id) = intent.exchange_order_id.as_deref() {
                    let _ = self.exchange.cancel_order(order_id, symbol);
                }
                self.router.mark_canceled(intent_id);
                self.portfolio.release(ReservationId::from_intent(intent_id), "wait_fill_timeout");
                state.pending_intent_id = None;
                state.transition(Phase::Idle, "wait_fill_timeout_canceled");
                Ok(())
            }
            WaitFillOutcome::BuyAborted => {
                self.portfolio.release(ReservationId::from_intent(intent_id), "buy_aborted");
                state.pending_intent_id = None;
                state.transition(Phase::Idle, "BUY_ABORTED");
                Ok(())
            }
        }
    }

    fn handle_position(&self, symbol: &Symbol) -> EngineResult<()> {
        let Some(snapshot) = self.latest_snapshots.get(symbol).map(|s| s.clone()) else { return Ok(()) };
        let Some(mut state) = self.states.get_mut(symbol) else { return Ok(()) };

        state.current_price = snapshot.last;
        ExitEngine::update_trailing(&mut state, snapshot.last, &self.config.protection);

        let last_switch = self.protection_switch_ms.get(symbol).map(|v| *v);
        let switch = DynamicProtectionManager::decide(&state, &self.config.protection, last_switch);
        if switch != ProtectionSwitch::None {
            DynamicProtectionManager::apply(&mut state, switch);
            self.protection_switch_ms.insert(symbol.clone(), now_ms());
            info!(%symbol, ?switch, "PROTECTION_SWITCH");
        }

        state.transition(Phase::ExitEval, "periodic_check");
        Ok(())
    }

    fn handle_exit_eval(&self, symbol: &Symbol) -> EngineResult<()> {
        let Some(mut state) = self.states.get_mut(symbol) else { return Ok(()) };
        let current_price = state.current_price;
        match ExitEngine::evaluate(&state, current_price, &self.config.protection) {
            Some(decision) => {
                let spread_pct = self
                    .latest_snapshots
                    .get(symbol)
                    .map(|s| s.spread_pct)
                    .unwrap_or(Decimal::ZERO);
                if spread_pct > self.config.guard.exit_min_liquidity_spread_pct
                    && self.config.guard.exit_low_liquidity_action == LowLiquidityAction::Skip
                {
                    warn!(%symbol, spread_pct = %spread_pct, reason = %decision.reason, "EXIT_BLOCKED_LOW_LIQUIDITY");
                    state.transition(Phase::Position, "EXIT_BLOCKED_LOW_LIQUIDITY");
                    return Ok(());
                }

                info!(%symbol, reason = %decision.reason, price = %decision.price, "exit triggered");
                state.exit_reason = Some(decision.reason.clone());
                state.retry_count = 0;
                state.transition(Phase::PlaceSell, decision.reason);
                Ok(())
            }
            None => {
                state.transition(Phase::Position, "no_exit_triggered");
                Ok(())
            }
        }
    }

    fn handle_place_sell(&self, symbol: &Symbol) -> EngineResult<()> {
        let Some(snapshot) = self.latest_snapshots.get(symbol).map(|s| s.clone()) else { return Ok(()) };
        let filters = self.get_filters(symbol);
        let Some(mut state) = self.states.get_mut(symbol) else { return Ok(()) };

        let ladder = &self.config.execution.exit_ladder_bps;
        if ladder.is_empty() {
            state.transition(Phase::ExitEval, "empty_exit_ladder");
            return Ok(());
        }
        let rung = (state.retry_count as usize).min(ladder.len() - 1);
        let bps = ladder[rung];
        if bps > self.config.execution.max_slippage_bps_exit {
            // nothing left to escalate to within the slippage cap; give the
            // price a chance to recover before trying again
            state.transition(Phase::ExitEval, "max_slippage_reached");
            return Ok(());
        }

        let price = snapshot.bid * (Decimal::ONE - Decimal::from(bps) / Decimal::new(10_000, 0));
        let qty = state.amount;
        if qty <= Decimal::ZERO {
            state.transition(Phase::PostTrade, "no_inventory_to_sell");
            return Ok(());
        }

        let timestamp_bucket = now_ms() / 1000;
        let intent_id = IntentId::derive(symbol, Side::Sell, qty, price, timestamp_bucket);
        let reservation_id = ReservationId::from_intent(intent_id);
        // The sell side of the book reserves zero cash (inventory, not
        // budget, backs a sell); registering the reservation still gives
        // `apply_fill` a record to settle against.
        self.portfolio.reserve(Decimal::ZERO, symbol, Side::Sell, reservation_id);

        let submit = self.router.submit(
            intent_id,
            SubmitParams {
                symbol: symbol.clone(),
                side: Side::Sell,
                raw_price: price,
                raw_quantity: qty,
                time_in_force: TimeInForce::ImmediateOrCancel,
                timestamp_bucket,
            },
            filters,
        );

        match submit {
            Ok(intent) => {
                state.pending_intent_id = Some(intent_id);
                state.active_order_id = intent.exchange_order_id.clone();
                state.client_order_id = Some(intent.client_order_id.clone());
                state.order_placed_ms = Some(now_ms());
                state.partial_fill_first_seen_ms = None;
                state.transition(Phase::WaitSellFill, "sell_order_submitted");
                drop(state);
                if let Some(metrics) = &self.metrics {
                    metrics.orders().orders_sent_total.with_label_values(&[symbol.as_str(), "sell"]).inc();
                }
                self.bus.publish(BusEvent::OrderIntent { symbol: symbol.clone(), intent_id, side: Side::Sell });
                Ok(())
            }
            Err(e) => {
                self.portfolio.release(reservation_id, "sell_submit_failed");
                warn!(%symbol, error = %e, "sell submission failed, escalating ladder rung");
                state.retry_count += 1;
                state.transition(Phase::ExitEval, "sell_retry");
                Ok(())
            }
        }
    }

    fn handle_wait_sell_fill(&self, symbol: &Symbol) -> EngineResult<()> {
        let Some(mut state) = self.states.get_mut(symbol) else { return Ok(()) };
        let Some(intent_id) = state.pending_intent_id else {
            state.transition(Phase::ExitEval, "missing_sell_intent");
            return Ok(());
        };
        let Some(intent) = self.router.get(intent_id) else {
            state.transition(Phase::ExitEval, "missing_sell_intent");
            return Ok(());
        };

        let exchange_order = intent
            .exchange_order_id
            .as_deref()
            .and_then(|id| self.exchange.fetch_order(id, symbol).ok());
        if let Some(order) = &exchange_order {
            if order.status == OrderStatus::PartiallyFilled && state.partial_fill_first_seen_ms.is_none() {
                state.partial_fill_first_seen_ms = Some(now_ms());
            }
        }
        let placed_at = state.order_placed_ms.unwrap_or_else(now_ms);
        let outcome = WaitFillService::evaluate(
            exchange_order.as_ref(),
            placed_at,
            state.partial_fill_first_seen_ms,
            self.config.execution.wait_fill_timeout_s,
            self.config.execution.partial_max_age_s,
        );

        if matches!(outcome, WaitFillOutcome::Pending) {
            return Ok(());
        }

        let fill_ratio = exchange_order
            .as_ref()
            .map(|o| if intent.quantity.is_zero() { Decimal::ZERO } else { o.filled_qty / intent.quantity })
            .unwrap_or(Decimal::ZERO);

        if matches!(outcome, WaitFillOutcome::Filled) && fill_ratio >= Decimal::new(95, 2) {
            let (filled_qty, avg_price, fee) = exchange_order
                .map(|o| (o.filled_qty, o.avg_fill_price, o.fee))
                .unwrap_or((intent.quantity, intent.limit_price, Decimal::ZERO));
            self.router.mark_filled(intent_id, filled_qty, avg_price, fee);
            let realized =
                self.portfolio
                    .apply_fill(ReservationId::from_intent(intent_id), symbol, Side::Sell, filled_qty, avg_price, fee);
            state.pending_intent_id = None;
            state.transition(Phase::PostTrade, "sell_filled");
            drop(state);
            if let Some(metrics) = &self.metrics {
                metrics.orders().orders_filled_total.with_label_values(&[symbol.as_str(), "sell"]).inc();
                metrics
                    .positions()
                    .realized_pnl_usd_total
                    .inc_by(realized.realized_pnl.max(Decimal::ZERO).to_f64().unwrap_or(0.0));
            }
            info!(%symbol, realized_pnl = %realized.realized_pnl, "position closed");
            self.bus
                .publish(BusEvent::OrderFilled { symbol: symbol.clone(), intent_id, qty: filled_qty, price: avg_price });
            return Ok(());
        }

        // partial or timed out: cancel the remainder and escalate the ladder
        if let Some(order_id) = intent.exchange_order_id.as_deref() {
            let _ = self.exchange.cancel_order(order_id, symbol);
        }
        self.router.mark_canceled(intent_id);
        self.portfolio.release(ReservationId::from_intent(intent_id), "sell_partial_retry");
        if let Some(order) = &exchange_order {
            if order.filled_qty > Decimal::ZERO {
                state.amount = (state.amount - order.filled_qty).max(Decimal::ZERO);
            }
        }
        state.retry_count += 1;
        state.pending_intent_id = None;
        state.transition(Phase::PlaceSell, "sell_retry_next_rung");
        Ok(())
    }

    fn handle_post_trade(&self, symbol: &Symbol) -> EngineResult<()> {
        let Some(mut state) = self.states.get_mut(symbol) else { return Ok(()) };
        state.cooldown_until_ms = Some(now_ms() + self.config.trading.cooldown_secs * 1000);
        state.amount = Decimal::ZERO;
        state.entry_price = Decimal::ZERO;
        state.tp_active = false;
        state.sl_active = false;
        state.trailing_active = false;
        state.retry_count = 0;
        state.exit_reason = None;
        state.transition(Phase::Cooldown, "post_trade_complete");
        if let Some(metrics) = &self.metrics {
            metrics.positions().active_positions.set(self.open_position_count() as i64);
        }
        Ok(())
    }

    fn handle_cooldown(&self, symbol: &Symbol) -> EngineResult<()> {
        let Some(mut state) = self.states.get_mut(symbol) else { return Ok(()) };
        if !state.is_in_cooldown() {
            state.transition(Phase::Idle, "cooldown_expired");
        }
        Ok(())
    }

    fn handle_error(&self, symbol: &Symbol) -> EngineResult<()> {
        let Some(mut state) = self.states.get_mut(symbol) else { return Ok(()) };
        if state.error_count >= FSM_MAX_RETRIES {
            return Ok(()); // pinned pending manual reset
        }
        let backoff_s = FSM_BACKOFF_BASE_S
            .saturating_mul(1u64 << state.error_count.min(10))
            .min(FSM_BACKOFF_MAX_S);
        if now_ms().saturating_sub(state.last_update_ms) >= backoff_s * 1000 {
            state.retry_count += 1;
            state.transition(Phase::Idle, "error_backoff_elapsed_retry");
        }
        Ok(())
    }

    /// Periodic scan of {IDLE, WARMUP, COOLDOWN} symbols for drop-entry
    /// opportunities, independent of each symbol's own per-cycle dispatch.
    fn scan_for_opportunities(&self) {
        let candidates: Vec<Symbol> = self
            .states
            .iter()
            .filter(|e| e.phase.is_scanner_eligible() && !e.is_in_cooldown())
            .map(|e| e.key().clone())
            .collect();

        for symbol in candidates {
            let Some(snapshot) = self.latest_snapshots.get(&symbol).map(|s| s.clone()) else { continue };
            if !snapshot.usable() {
                continue;
            }
            let signal = DropSignalEvaluator::evaluate(&snapshot, self.config.signal.drop_trigger_value);
            if signal.triggered {
                self.scanner_flags.insert(symbol.clone(), true);
                info!(%symbol, drop_pct = %signal.drop_pct, "SLOT_AVAILABLE");
            }
        }
    }
}

fn phase_tag(phase: Phase) -> &'static str {
    match phase {
        Phase::Warmup => "warmup",
        Phase::Idle => "idle",
        Phase::EntryEval => "entry_eval",
        Phase::PlaceBuy => "place_buy",
        Phase::WaitFill => "wait_fill",
        Phase::Position => "position",
        Phase::ExitEval => "exit_eval",
        Phase::PlaceSell => "place_sell",
        Phase::WaitSellFill => "wait_sell_fill",
        Phase::PostTrade => "post_trade",
        Phase::Cooldown => "cooldown",
        Phase::Error => "error",
    }
}

/// Coordinates an orderly shutdown across the main engine loop and the
/// auxiliary threads (market data, reconciler, housekeeping): trips the
/// shared stop flag, then joins each registered thread with a bounded
/// wait, falling back to reporting stragglers rather than blocking
/// forever on a thread that refuses to exit.
pub struct ShutdownCoordinator {
    shutdown: Arc<AtomicBool>,
    handles: Vec<(&'static str, std::thread::JoinHandle<()>)>,
    join_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(shutdown: Arc<AtomicBool>, join_timeout: Duration) -> Self {
        Self {
            shutdown,
            handles: Vec::new(),
            join_timeout,
        }
    }

    pub fn register(&mut self, name: &'static str, handle: std::thread::JoinHandle<()>) {
        self.handles.push((name, handle));
    }

    /// Signal stop, join every registered thread (polling `is_finished`
    /// since a plain `JoinHandle` has no interruptible join), then force a
    /// final portfolio flush regardless of how many threads joined.
    pub fn shutdown(mut self, portfolio: &Portfolio) -> Vec<&'static str> {
        self.shutdown.store(true, Ordering::SeqCst);
        let deadline = std::time::Instant::now() + self.join_timeout;
        let mut stragglers = Vec::new();

        for (name, handle) in self.handles.drain(..) {
            let mut joined = false;
            while std::time::Instant::now() < deadline {
                if handle.is_finished() {
                    let _ = handle.join();
                    joined = true;
                    break;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            if !joined {
                warn!(thread = name, "thread did not finish within shutdown timeout");
                stragglers.push(name);
            }
        }

        portfolio.flush();
        if stragglers.is_empty() {
            info!("shutdown coordinator: all threads joined cleanly");
        } else {
            warn!(?stragglers, "shutdown coordinator: some threads did not join in time");
        }
        stragglers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::*;
    use crate::exchange::SimulatedExchangeAdapter;
    use crate::market::AnchorManager;
    use crate::quantize::{FilterCache, FilterRecord};
    use rust_decimal_macros::dec;
    use std::sync::mpsc::channel;

    fn test_config() -> EngineConfig {
        EngineConfig {
            trading: TradingConfig {
                max_concurrent_positions: 2,
                position_size_usdt: dec!(100),
                cooldown_secs: 1,
                entry_block_cooldown_s: 1,
            },
            signal: SignalConfig {
                drop_trigger_mode: DropTriggerMode::SessionPeak,
                drop_trigger_value: dec!(0.01),
                anchor_stale_minutes: 60,
                window_lookback_s: 300,
                anchor_clamp_pct: dec!(0.2),
            },
            protection: ProtectionConfig {
                tp_pct: dec!(1.0),
                sl_pct: dec!(1.0),
                trail_pct: dec!(0.5),
                trail_activation_pct: dec!(0.3),
                max_hold_time_s: 14_400,
                switch_cooldown_s: 20,
                switch_to_sl_pnl_pct: dec!(-0.5),
                switch_to_tp_pnl_pct: dec!(0.2),
            },
            execution: ExecutionConfig {
                buy_escalation_steps: vec![],
                exit_ladder_bps: vec![0, 5, 10, 15],
                max_slippage_bps_entry: 20,
                max_slippage_bps_exit: 20,
                never_market_sells: true,
                ioc_order_ttl_ms: 2_000,
                wait_fill_timeout_s: 30,
                partial_max_age_s: 10,
            },
            guard: GuardConfig {
                max_spread_bps: 50,
                depth_min_notional_usd: dec!(10),
                exit_min_liquidity_spread_pct: dec!(1.0),
                exit_low_liquidity_action: LowLiquidityAction::Wait,
            },
            market_data: MarketDataConfig {
                md_poll_ms: 50,
                md_batch_size: 10,
                md_auto_restart_on_crash: true,
                md_max_auto_restarts: 3,
                snapshot_min_period_ms: 0,
                snapshot_stale_ttl_s: 60,
                md_cache_soft_ttl_ms: 500,
                md_cache_ttl_ms: 1_000,
            },
            router: RouterConfig {
                router_max_retries: 2,
                router_backoff_ms: 1,
                state_persist_interval_s: 10,
                intent_stale_threshold_s: 60,
                router_cleanup_interval_s: 3600,
                router_completed_order_ttl_s: 7200,
                max_pending_buy_intents: 10,
                router_submit_timeout_s: 10,
                reconciler_interval_s: 60,
            },
            metrics: MetricsConfig::default(),
            atr: AtrConfig::default(),
        }
    }

    fn test_engine(symbol: &Symbol) -> (Engine, Arc<SimulatedExchangeAdapter>, std::sync::mpsc::Sender<Vec<Snapshot>>) {
        let adapter = Arc::new(SimulatedExchangeAdapter::new());
        adapter.set_price(symbol, dec!(100));
        let cfg = test_config();
        let portfolio = Arc::new(Portfolio::new(dec!(10_000)));
        let router = Arc::new(OrderRouter::new(adapter.clone(), cfg.router.clone()));
        let anchors = Arc::new(AnchorManager::new());
        let filters = Arc::new(FilterCache::new());
        let (tx, rx) = channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let engine = Engine::new(cfg, adapter.clone(), portfolio, router, anchors, filters, rx, shutdown);
        engine.register_symbol(symbol.clone());
        (engine, adapter, tx)
    }

    fn snapshot(symbol: &Symbol, last: Decimal, anchor: Decimal) -> Snapshot {
        Snapshot {
            schema_version: crate::market::SNAPSHOT_SCHEMA_VERSION,
            symbol: symbol.clone(),
            timestamp_ms: now_ms(),
            last,
            bid: last,
            ask: last,
            mid: last,
            spread_bps: Decimal::ZERO,
            spread_pct: Decimal::ZERO,
            depth_usd_bid: dec!(1000),
            depth_usd_ask: dec!(1000),
            depth_imbalance: Decimal::ZERO,
            rolling_peak: anchor,
            rolling_trough: last,
            anchor,
            anchor_mode_tag: "session_peak",
            drop_pct_from_anchor: (last - anchor) / anchor,
            rise_pct_from_trough: Decimal::ZERO,
            data_age_ms: 0,
            stale: false,
            valid: true,
        }
    }

    #[test]
    fn warmup_transitions_to_idle_once_a_snapshot_arrives() {
        let sym = Symbol::new("BTC-USDT");
        let (engine, _adapter, _tx) = test_engine(&sym);
        engine.latest_snapshots.insert(sym.clone(), snapshot(&sym, dec!(100), dec!(100)));
        engine.dispatch(&sym);
        assert_eq!(engine.symbol_state(&sym).unwrap().phase, Phase::Idle);
    }

    #[test]
    fn scanner_flags_idle_symbol_into_entry_eval_on_drop() {
        let sym = Symbol::new("BTC-USDT");
        let (engine, _adapter, _tx) = test_engine(&sym);
        engine.states.get_mut(&sym).unwrap().transition(Phase::Idle, "test");
        engine.latest_snapshots.insert(sym.clone(), snapshot(&sym, dec!(98), dec!(100)));
        engine.scan_for_opportunities();
        engine.dispatch(&sym);
        assert_eq!(engine.symbol_state(&sym).unwrap().phase, Phase::EntryEval);
    }

    #[test]
    fn entry_eval_without_drop_returns_to_idle() {
        let sym = Symbol::new("BTC-USDT");
        let (engine, _adapter, _tx) = test_engine(&sym);
        engine.states.get_mut(&sym).unwrap().transition(Phase::EntryEval, "test");
        engine.latest_snapshots.insert(sym.clone(), snapshot(&sym, dec!(100), dec!(100)));
        engine.dispatch(&sym);
        assert_eq!(engine.symbol_state(&sym).unwrap().phase, Phase::Idle);
    }

    #[test]
    fn full_buy_cycle_reaches_position() {
        let sym = Symbol::new("BTC-USDT");
        let (engine, _adapter, _tx) = test_engine(&sym);
        engine.states.get_mut(&sym).unwrap().transition(Phase::PlaceBuy, "test");
        engine.latest_snapshots.insert(sym.clone(), snapshot(&sym, dec!(100), dec!(100)));

        engine.dispatch(&sym); // PlaceBuy -> WaitFill
        assert_eq!(engine.symbol_state(&sym).unwrap().phase, Phase::WaitFill);
        engine.dispatch(&sym); // WaitFill -> Position (auto_fill)
        let state = engine.symbol_state(&sym).unwrap();
        assert_eq!(state.phase, Phase::Position);
        assert!(state.amount > Decimal::ZERO);
        assert!(state.entry_price > Decimal::ZERO);
    }

    #[test]
    fn compliance_abort_records_a_ghost_position() {
        let sym = Symbol::new("BTC-USDT");
        let (engine, _adapter, _tx) = test_engine(&sym);
        engine.filters.insert(
            sym.clone(),
            FilterRecord {
                price_tick: dec!(0.01),
                amount_step: dec!(0.0001),
                min_qty: dec!(1_000_000),
                min_notional: dec!(10),
            },
        );
        engine.states.get_mut(&sym).unwrap().transition(Phase::PlaceBuy, "test");
        engine.latest_snapshots.insert(sym.clone(), snapshot(&sym, dec!(100), dec!(100)));

        engine.dispatch(&sym);
        assert_eq!(engine.symbol_state(&sym).unwrap().phase, Phase::Idle);
        let ghosts = engine.ghost_positions_for(&sym);
        assert_eq!(ghosts.len(), 1);
        assert!(ghosts[0].reason.contains("quantization failed"));
    }

    #[test]
    fn full_sell_cycle_reaches_cooldown() {
        let sym = Symbol::new("BTC-USDT");
        let (engine, _adapter, _tx) = test_engine(&sym);
        {
            let mut state = engine.states.get_mut(&sym).unwrap();
            state.transition(Phase::Position, "test");
            state.amount = dec!(1);
            state.entry_price = dec!(100);
            state.entry_ts_ms = Some(now_ms());
            state.sl_price = Some(dec!(90));
            state.tp_price = Some(dec!(101));
            state.sl_active = true;
            state.tp_active = true;
            state.trail_high = dec!(100);
        }
        engine.latest_snapshots.insert(sym.clone(), snapshot(&sym, dec!(102), dec!(100)));

        engine.dispatch(&sym); // Position -> ExitEval
        assert_eq!(engine.symbol_state(&sym).unwrap().phase, Phase::ExitEval);
        engine.dispatch(&sym); // ExitEval -> PlaceSell (TP hit)
        assert_eq!(engine.symbol_state(&sym).unwrap().phase, Phase::PlaceSell);
        engine.dispatch(&sym); // PlaceSell -> WaitSellFill
        assert_eq!(engine.symbol_state(&sym).unwrap().phase, Phase::WaitSellFill);
        engine.dispatch(&sym); // WaitSellFill -> PostTrade (auto_fill)
        assert_eq!(engine.symbol_state(&sym).unwrap().phase, Phase::PostTrade);
        engine.dispatch(&sym); // PostTrade -> Cooldown
        let state = engine.symbol_state(&sym).unwrap();
        assert_eq!(state.phase, Phase::Cooldown);
        assert_eq!(state.amount, Decimal::ZERO);
    }

    #[test]
    fn error_phase_stays_pinned_until_backoff_elapses() {
        let sym = Symbol::new("BTC-USDT");
        let (engine, _adapter, _tx) = test_engine(&sym);
        {
            let mut state = engine.states.get_mut(&sym).unwrap();
            state.transition(Phase::Error, "test");
            state.error_count = 1;
            state.last_update_ms = now_ms();
        }
        engine.dispatch(&sym);
        assert_eq!(engine.symbol_state(&sym).unwrap().phase, Phase::Error);

        engine.states.get_mut(&sym).unwrap().last_update_ms = now_ms() - 30_000;
        engine.dispatch(&sym);
        assert_eq!(engine.symbol_state(&sym).unwrap().phase, Phase::Idle);
    }

    #[test]
    fn exit_blocked_on_low_liquidity_with_skip_action() {
        let sym = Symbol::new("BTC-USDT");
        let (mut engine, _adapter, _tx) = test_engine(&sym);
        engine.config.guard.exit_low_liquidity_action = LowLiquidityAction::Skip;
        {
            let mut state = engine.states.get_mut(&sym).unwrap();
            state.transition(Phase::Position, "test");
            state.amount = dec!(1);
            state.entry_price = dec!(100);
            state.entry_ts_ms = Some(now_ms());
            state.sl_price = Some(dec!(90));
            state.tp_price = Some(dec!(101));
            state.sl_active = true;
            state.tp_active = true;
            state.trail_high = dec!(100);
        }
        let mut wide_spread = snapshot(&sym, dec!(102), dec!(100));
        wide_spread.spread_pct = dec!(12); // exceeds test_config's exit_min_liquidity_spread_pct of 1.0
        engine.latest_snapshots.insert(sym.clone(), wide_spread);

        engine.dispatch(&sym); // Position -> ExitEval
        assert_eq!(engine.symbol_state(&sym).unwrap().phase, Phase::ExitEval);
        engine.dispatch(&sym); // TP is hit but EXIT_BLOCKED_LOW_LIQUIDITY holds it back
        let state = engine.symbol_state(&sym).unwrap();
        assert_eq!(state.phase, Phase::Position);
        assert!(state.amount > Decimal::ZERO);
    }
}
