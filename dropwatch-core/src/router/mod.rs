//! Order Router: idempotent order submission against an `ExchangeAdapter`.
//!
//! The retry loop is built directly on `resilience::backoff::ExponentialBackoff`;
//! the intent registry is a `DashMap<IntentId, OrderIntent>` whose per-shard
//! locking gives "first attempt to acquire wins" tie-breaking for free when
//! two retries for the same intent race.

use crate::config::RouterConfig;
use crate::core::{now_ms, EngineError, EngineResult, IntentId, Side, Symbol, TimeInForce};
use crate::exchange::{CreateOrderOutcome, CreateOrderParams, ExchangeAdapter, ExchangeOrder, OrderStatus as ExchangeOrderStatus};
use crate::quantize::{FilterRecord, Quantizer};
use crate::resilience::{BackoffConfig, ExponentialBackoff};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentStatus {
    New,
    Reserved,
    Sent,
    Partial,
    Filled,
    Canceled,
    Failed,
}

impl IntentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, IntentStatus::Filled | IntentStatus::Canceled | IntentStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub intent_id: IntentId,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    pub limit_price: Decimal,
    pub time_in_force: TimeInForce,
    pub client_order_id: String,
    pub status: IntentStatus,
    pub attempt_count: u32,
    pub created_ms: u64,
    pub last_update_ms: u64,
    pub exchange_order_id: Option<String>,
    pub filled_qty: Decimal,
    pub avg_fill_price: Decimal,
    pub accumulated_fees: Decimal,
    pub failure_reason: Option<String>,
}

pub struct SubmitParams {
    pub symbol: Symbol,
    pub side: Side,
    pub raw_price: Decimal,
    pub raw_quantity: Decimal,
    pub time_in_force: TimeInForce,
    pub timestamp_bucket: u64,
}

fn stable_client_order_id(intent_id: IntentId) -> String {
    let mut hasher = DefaultHasher::new();
    intent_id.hash(&mut hasher);
    format!("dw-{:016x}", hasher.finish())
}

/// Submits orders idempotently, tracks them in an in-memory registry, and
/// retries transient exchange failures with exponential backoff.
pub struct OrderRouter {
    exchange: Arc<dyn ExchangeAdapter>,
    registry: DashMap<IntentId, OrderIntent>,
    cfg: RouterConfig,
}

impl OrderRouter {
    pub fn new(exchange: Arc<dyn ExchangeAdapter>, cfg: RouterConfig) -> Self {
        Self {
            exchange,
            registry: DashMap::new(),
            cfg,
        }
    }

    pub fn get(&self, intent_id: IntentId) -> Option<OrderIntent> {
        self.registry.get(&intent_id).map(|r| r.clone())
    }

    /// Submit an order intent idempotently, quantizing through `filters`.
    pub fn submit(&self, intent_id: IntentId, params: SubmitParams, filters: FilterRecord) -> EngineResult<OrderIntent> {
        if let Some(existing) = self.registry.get(&intent_id) {
            if existing.status.is_terminal() {
                return Ok(existing.clone());
            }
        }

        let quantized = Quantizer::validate_and_fix(params.raw_price, params.raw_quantity, filters);
        if !quantized.is_valid() {
            return Err(EngineError::ComplianceError(format!(
                "quantization failed: {:?}",
                quantized.violations
            )));
        }

        let client_order_id = stable_client_order_id(intent_id);
        let now = now_ms();

        // entry()-based tie-breaking: the first caller to win the shard
        // lock inserts the NEW intent; a racing retry sees Sent/terminal
        // state on the winner's entry and returns it instead of resubmitting.
        {
            let mut entry = self.registry.entry(intent_id).or_insert_with(|| OrderIntent {
                intent_id,
                symbol: params.symbol.clone(),
                side: params.side,
                quantity: quantized.quantized_amount,
                limit_price: quantized.quantized_price,
                time_in_force: params.time_in_force,
                client_order_id: client_order_id.clone(),
                status: IntentStatus::New,
                attempt_count: 0,
                created_ms: now,
                last_update_ms: now,
                exchange_order_id: None,
                filled_qty: Decimal::ZERO,
                avg_fill_price: Decimal::ZERO,
                accumulated_fees: Decimal::ZERO,
                failure_reason: None,
            });
            if entry.status.is_terminal() || entry.status == IntentStatus::Sent {
                return Ok(entry.clone());
            }
            entry.status = IntentStatus::Reserved;
        }

        let backoff_cfg = BackoffConfig {
            initial_delay: std::time::Duration::from_millis(self.cfg.router_backoff_ms),
            max_delay: std::time::Duration::from_millis(self.cfg.router_backoff_ms * 20),
            multiplier: 2.0,
            max_retries: Some(self.cfg.router_max_retries as usize),
            jitter_factor: 0.1,
        };
        let mut backoff = ExponentialBackoff::with_config(backoff_cfg);

        loop {
            let attempt_started = now_ms();
            let outcome = self.exchange.create_order(CreateOrderParams {
                symbol: params.symbol.clone(),
                side: params.side,
                order_type: crate::core::OrderType::Limit,
                qty: quantized.quantized_amount,
                price: quantized.quantized_price,
                client_order_id: client_order_id.clone(),
                time_in_force: params.time_in_force,
            });

            let mut entry = self.registry.get_mut(&intent_id).expect("just inserted");
            entry.attempt_count += 1;
            entry.last_update_ms = now_ms();
            let latency_ms = entry.last_update_ms.saturating_sub(attempt_started);

            match outcome {
                Ok(CreateOrderOutcome::Accepted { exchange_order_id }) => {
                    info!(%intent_id, %client_order_id, latency_ms, "ORDER_SENT");
                    entry.exchange_order_id = Some(exchange_order_id);
                    entry.status = IntentStatus::Sent;
                    return Ok(entry.clone());
                }
                Ok(CreateOrderOutcome::Rejected { code, reason }) => {
                    warn!(%intent_id, code, reason, "ORDER_FAILED");
                    entry.status = IntentStatus::Failed;
                    entry.failure_reason = Some(format!("{code}: {reason}"));
                    return Err(EngineError::ExchangeRejection { code, reason });
                }
                Err(e) => {
                    drop(entry);
                    match backoff.next_delay() {
                        Some(delay) => {
                            warn!(%intent_id, error = %e, attempt = backoff.attempt_number(), "order submit failed, retrying");
                            std::thread::sleep(delay);
                            continue;
                        }
                        None => {
                            let mut entry = self.registry.get_mut(&intent_id).expect("just inserted");
                            entry.status = IntentStatus::Failed;
                            entry.failure_reason = Some(e.to_string());
                            return Err(EngineError::ExchangeTransient(e.to_string()));
                        }
                    }
                }
            }
        }
    }

    /// Register an order the exchange already holds that this router never
    /// submitted, under a freshly generated intent id — the reconciler's
    /// orphan-adopt path. No `create_order` call is made; the order is
    /// already live.
    pub fn adopt_orphan(&self, intent_id: IntentId, order: &ExchangeOrder) -> OrderIntent {
        let now = now_ms();
        let status = match order.status {
            ExchangeOrderStatus::Filled => IntentStatus::Filled,
            ExchangeOrderStatus::PartiallyFilled => IntentStatus::Partial,
            ExchangeOrderStatus::Canceled | ExchangeOrderStatus::Rejected => IntentStatus::Canceled,
            ExchangeOrderStatus::Open => IntentStatus::Sent,
        };
        let intent = OrderIntent {
            intent_id,
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: order.filled_qty.max(Decimal::ZERO),
            limit_price: order.avg_fill_price,
            time_in_force: TimeInForce::GoodTilCanceled,
            client_order_id: order.client_order_id.clone(),
            status,
            attempt_count: 0,
            created_ms: now,
            last_update_ms: now,
            exchange_order_id: Some(order.exchange_order_id.clone()),
            filled_qty: order.filled_qty,
            avg_fill_price: order.avg_fill_price,
            accumulated_fees: order.fee,
            failure_reason: None,
        };
        self.registry.insert(intent_id, intent.clone());
        intent
    }

    pub fn mark_filled(&self, intent_id: IntentId, filled_qty: Decimal, avg_fill_price: Decimal, fee: Decimal) {
        if let Some(mut entry) = self.registry.get_mut(&intent_id) {
            entry.filled_qty = filled_qty;
            entry.avg_fill_price = avg_fill_price;
            entry.accumulated_fees += fee;
            entry.status = if filled_qty >= entry.quantity {
                IntentStatus::Filled
            } else {
                IntentStatus::Partial
            };
            entry.last_update_ms = now_ms();
        }
    }

    pub fn mark_canceled(&self, intent_id: IntentId) {
        if let Some(mut entry) = self.registry.get_mut(&intent_id) {
            entry.status = IntentStatus::Canceled;
            entry.last_update_ms = now_ms();
        }
    }

    /// Evict terminal intents older than `router_completed_order_ttl_s`.
    /// Non-terminal intents are never evicted.
    pub fn cleanup_completed(&self) -> usize {
        let cutoff_ms = self.cfg.router_completed_order_ttl_s * 1000;
        let now = now_ms();
        let stale: Vec<IntentId> = self
            .registry
            .iter()
            .filter(|e| e.status.is_terminal() && now.saturating_sub(e.last_update_ms) > cutoff_ms)
            .map(|e| *e.key())
            .collect();
        for id in &stale {
            self.registry.remove(id);
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }
}
