//! Reconciler: periodic sync between local state and the exchange's view
//! of orders and balances.
//!
//! Generalizes the single-aggregate-position reconciliation pattern used
//! elsewhere in this codebase (drift calculation, mismatch threshold) to a
//! per-symbol map, and adds order-level reconciliation and orphan
//! adoption/closure — concepts a single-strategy market maker never needed
//! since it owns the only strategy touching that book.

use crate::core::{now_ms, IntentId, Symbol};
use crate::exchange::{ExchangeAdapter, OrderStatus};
use crate::portfolio::Portfolio;
use crate::router::{IntentStatus, OrderRouter};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct DriftEvent {
    pub symbol: Symbol,
    pub drift_fraction: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub intents_advanced: usize,
    pub drift_events: Vec<DriftEvent>,
    pub orphans_adopted: usize,
    pub orphans_closed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanPolicy {
    Adopt,
    Close,
}

pub struct Reconciler {
    exchange: Arc<dyn ExchangeAdapter>,
    router: Arc<OrderRouter>,
    portfolio: Arc<Portfolio>,
    orphan_policy: OrphanPolicy,
    drift_warn_threshold: Decimal,
}

impl Reconciler {
    pub fn new(
        exchange: Arc<dyn ExchangeAdapter>,
        router: Arc<OrderRouter>,
        portfolio: Arc<Portfolio>,
        orphan_policy: OrphanPolicy,
    ) -> Self {
        Self {
            exchange,
            router,
            portfolio,
            orphan_policy,
            drift_warn_threshold: Decimal::new(1, 2), // 1%
        }
    }

    /// Run one sync cycle. Afterward, local positions should match the
    /// exchange's reported balances within tolerance, and every local
    /// open order should correspond to a real exchange order.
    pub fn sync(&self, tracked_intents: &[IntentId]) -> anyhow::Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let open_orders = self.exchange.fetch_open_orders()?;

        for intent_id in tracked_intents {
            let Some(intent) = self.router.get(*intent_id) else { continue };
            if intent.status.is_terminal() {
                continue;
            }
            let Some(exchange_order_id) = &intent.exchange_order_id else { continue };
            let Ok(order) = self.exchange.fetch_order(exchange_order_id, &intent.symbol) else {
                continue;
            };

            match order.status {
                OrderStatus::Filled => {
                    self.router
                        .mark_filled(*intent_id, order.filled_qty, order.avg_fill_price, order.fee);
                    report.intents_advanced += 1;
                }
                OrderStatus::PartiallyFilled => {
                    self.router
                        .mark_filled(*intent_id, order.filled_qty, order.avg_fill_price, order.fee);
                    report.intents_advanced += 1;
                }
                OrderStatus::Canceled | OrderStatus::Rejected => {
                    self.router.mark_canceled(*intent_id);
                    report.intents_advanced += 1;
                }
                OrderStatus::Open => {}
            }
        }

        for position in self.portfolio.get_all_positions() {
            if let Ok(balance) = self.exchange.fetch_balance() {
                let drift = self.portfolio.budget_drift(balance.free + balance.locked);
                if drift.abs() > self.drift_warn_threshold {
                    warn!(symbol = %position.symbol, drift = %drift, "portfolio drift exceeds tolerance");
                    report.drift_events.push(DriftEvent {
                        symbol: position.symbol.clone(),
                        drift_fraction: drift,
                    });
                }
            }
        }

        let known_client_order_ids: Vec<String> = tracked_intents
            .iter()
            .filter_map(|id| self.router.get(*id))
            .map(|i| i.client_order_id)
            .collect();

        for order in &open_orders {
            if known_client_order_ids.contains(&order.client_order_id) {
                continue;
            }
            match self.orphan_policy {
                OrphanPolicy::Close => {
                    if self.exchange.cancel_order(&order.exchange_order_id, &order.symbol).is_ok() {
                        info!(order_id = %order.exchange_order_id, "closed orphan order");
                        report.orphans_closed += 1;
                    }
                }
                OrphanPolicy::Adopt => {
                    let generated_id = IntentId::for_orphan(&order.exchange_order_id);
                    self.router.adopt_orphan(generated_id, order);

                    let best_effort_price = self
                        .exchange
                        .fetch_tickers(std::slice::from_ref(&order.symbol))
                        .ok()
                        .and_then(|tickers| tickers.into_iter().next())
                        .map(|t| (t.bid + t.ask) / Decimal::from(2))
                        .unwrap_or(order.avg_fill_price);
                    if !order.filled_qty.is_zero() {
                        self.portfolio.adopt_position(&order.symbol, order.filled_qty, best_effort_price);
                    }

                    warn!(
                        order_id = %order.exchange_order_id,
                        symbol = %order.symbol,
                        intent_id = %generated_id,
                        price = %best_effort_price,
                        "RECONCILE_ORPHAN_POSITION: adopted orphan order under generated intent"
                    );
                    report.orphans_adopted += 1;
                }
            }
        }

        Ok(report)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerClock {
    pub last_run_ms: u64,
    pub interval_s: u64,
}

impl ReconcilerClock {
    pub fn new(interval_s: u64) -> Self {
        Self {
            last_run_ms: 0,
            interval_s,
        }
    }

    pub fn due(&self) -> bool {
        now_ms().saturating_sub(self.last_run_ms) >= self.interval_s * 1000
    }

    pub fn mark_run(&mut self) {
        self.last_run_ms = now_ms();
    }
}
