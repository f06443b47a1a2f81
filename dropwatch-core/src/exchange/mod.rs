//! The exchange boundary: a trait abstracting over a single spot venue,
//! concrete record types for everything that crosses it, and a simulated
//! adapter backing the test suite.
//!
//! `ExchangeAdapter` occupies the role a single-purpose execution trait
//! plays in earlier engines in this codebase, generalized to the
//! multi-operation account surface a multi-symbol engine needs
//! (tickers, order books, balances, open orders, order lifecycle).

use crate::core::{OrderType, Side, Symbol, TimeInForce};
use crate::quantize::FilterRecord;
use anyhow::Result;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Ticker {
    pub symbol: Symbol,
    pub last: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone)]
pub struct OrderBookLevel {
    pub price: Decimal,
    pub qty: Decimal,
}

#[derive(Debug, Clone)]
pub struct OrderBook {
    pub symbol: Symbol,
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone)]
pub struct Balance {
    pub free: Decimal,
    pub locked: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected)
    }
}

#[derive(Debug, Clone)]
pub struct ExchangeOrder {
    pub exchange_order_id: String,
    pub client_order_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub avg_fill_price: Decimal,
    pub fee: Decimal,
}

#[derive(Debug, Clone)]
pub struct CreateOrderParams {
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: Decimal,
    pub price: Decimal,
    pub client_order_id: String,
    pub time_in_force: TimeInForce,
}

/// Result of `create_order`: either accepted (with the exchange's own id)
/// or rejected with a code/reason pair.
#[derive(Debug, Clone)]
pub enum CreateOrderOutcome {
    Accepted { exchange_order_id: String },
    Rejected { code: String, reason: String },
}

/// The external exchange account surface the engine depends on.
///
/// Implementations MUST support both server-assigned and client-specified
/// order ids, MUST treat re-sending the same `client_order_id` with the
/// same params as an idempotent no-op (same outcome, no duplicate order),
/// and MUST report a structured error code + message on rejection.
pub trait ExchangeAdapter: Send + Sync {
    fn fetch_tickers(&self, symbols: &[Symbol]) -> Result<Vec<Ticker>>;
    fn fetch_order_book(&self, symbol: &Symbol, depth: usize) -> Result<OrderBook>;
    fn fetch_balance(&self) -> Result<Balance>;
    fn fetch_open_orders(&self) -> Result<Vec<ExchangeOrder>>;
    fn fetch_order(&self, order_id: &str, symbol: &Symbol) -> Result<ExchangeOrder>;
    fn create_order(&self, params: CreateOrderParams) -> Result<CreateOrderOutcome>;
    fn cancel_order(&self, order_id: &str, symbol: &Symbol) -> Result<()>;
    fn market(&self, symbol: &Symbol) -> Result<FilterRecord>;
}

/// In-memory adapter for tests and the `SimulatedExchangeAdapter`-backed
/// integration scenarios: immediate fills at the requested price unless
/// configured otherwise, no network, no latency.
pub struct SimulatedExchangeAdapter {
    prices: DashMap<Symbol, Decimal>,
    filters: DashMap<Symbol, FilterRecord>,
    orders: DashMap<String, ExchangeOrder>,
    balance: Arc<parking_lot::Mutex<Balance>>,
    next_order_id: AtomicU64,
    /// When set, the next `create_order` call is rejected with this
    /// code/reason instead of accepted — lets tests exercise the
    /// ExchangeRejection path deterministically.
    force_next_rejection: Arc<parking_lot::Mutex<Option<(String, String)>>>,
    /// When true, orders are accepted but never auto-filled; tests drive
    /// fills explicitly via `set_order_status`.
    pub auto_fill: bool,
}

impl SimulatedExchangeAdapter {
    pub fn new() -> Self {
        Self {
            prices: DashMap::new(),
            filters: DashMap::new(),
            orders: DashMap::new(),
            balance: Arc::new(parking_lot::Mutex::new(Balance {
                free: Decimal::new(100_000, 0),
                locked: Decimal::ZERO,
            })),
            next_order_id: AtomicU64::new(1),
            force_next_rejection: Arc::new(parking_lot::Mutex::new(None)),
            auto_fill: true,
        }
    }

    pub fn set_price(&self, symbol: &Symbol, price: Decimal) {
        self.prices.insert(symbol.clone(), price);
    }

    pub fn set_filters(&self, symbol: &Symbol, filters: FilterRecord) {
        self.filters.insert(symbol.clone(), filters);
    }

    pub fn force_next_rejection(&self, code: impl Into<String>, reason: impl Into<String>) {
        *self.force_next_rejection.lock() = Some((code.into(), reason.into()));
    }

    pub fn set_order_status(&self, exchange_order_id: &str, status: OrderStatus, filled_qty: Decimal) {
        if let Some(mut order) = self.orders.get_mut(exchange_order_id) {
            order.status = status;
            order.filled_qty = filled_qty;
        }
    }

    pub fn set_balance_free(&self, free: Decimal) {
        self.balance.lock().free = free;
    }
}

impl Default for SimulatedExchangeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ExchangeAdapter for SimulatedExchangeAdapter {
    fn fetch_tickers(&self, symbols: &[Symbol]) -> Result<Vec<Ticker>> {
        Ok(symbols
            .iter()
            .map(|s| {
                let last = self.prices.get(s).map(|p| *p).unwrap_or(Decimal::new(100, 0));
                Ticker {
                    symbol: s.clone(),
                    last,
                    bid: last,
                    ask: last,
                    timestamp_ms: crate::core::now_ms(),
                }
            })
            .collect())
    }

    fn fetch_order_book(&self, symbol: &Symbol, _depth: usize) -> Result<OrderBook> {
        let last = self.prices.get(symbol).map(|p| *p).unwrap_or(Decimal::new(100, 0));
        Ok(OrderBook {
            symbol: symbol.clone(),
            bids: vec![OrderBookLevel { price: last, qty: Decimal::new(10, 0) }],
            asks: vec![OrderBookLevel { price: last, qty: Decimal::new(10, 0) }],
            timestamp_ms: crate::core::now_ms(),
        })
    }

    fn fetch_balance(&self) -> Result<Balance> {
        Ok(self.balance.lock().clone())
    }

    fn fetch_open_orders(&self) -> Result<Vec<ExchangeOrder>> {
        Ok(self
            .orders
            .iter()
            .filter(|e| !e.status.is_terminal())
            .map(|e| e.clone())
            .collect())
    }

    fn fetch_order(&self, order_id: &str, _symbol: &Symbol) -> Result<ExchangeOrder> {
        self.orders
            .get(order_id)
            .map(|o| o.clone())
            .ok_or_else(|| anyhow::anyhow!("unknown order id {order_id}"))
    }

    fn create_order(&self, params: CreateOrderParams) -> Result<CreateOrderOutcome> {
        if let Some((code, reason)) = self.force_next_rejection.lock().take() {
            return Ok(CreateOrderOutcome::Rejected { code, reason });
        }

        // Idempotence: same client_order_id re-sent returns the same order.
        if let Some(existing) = self
            .orders
            .iter()
            .find(|o| o.client_order_id == params.client_order_id)
        {
            return Ok(CreateOrderOutcome::Accepted {
                exchange_order_id: existing.exchange_order_id.clone(),
            });
        }

        let id = self.next_order_id.fetch_add(1, Ordering::SeqCst);
        let exchange_order_id = format!("SIM-{id}");

        let status = if self.auto_fill {
            OrderStatus::Filled
        } else {
            OrderStatus::Open
        };
        let filled_qty = if self.auto_fill { params.qty } else { Decimal::ZERO };

        self.orders.insert(
            exchange_order_id.clone(),
            ExchangeOrder {
                exchange_order_id: exchange_order_id.clone(),
                client_order_id: params.client_order_id,
                symbol: params.symbol,
                side: params.side,
                status,
                filled_qty,
                avg_fill_price: params.price,
                fee: Decimal::ZERO,
            },
        );

        Ok(CreateOrderOutcome::Accepted { exchange_order_id })
    }

    fn cancel_order(&self, order_id: &str, _symbol: &Symbol) -> Result<()> {
        match self.orders.get_mut(order_id) {
            Some(mut order) => {
                // Idempotent: canceling an already-canceled order succeeds.
                if !order.status.is_terminal() {
                    order.status = OrderStatus::Canceled;
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn market(&self, symbol: &Symbol) -> Result<FilterRecord> {
        Ok(self
            .filters
            .get(symbol)
            .map(|f| *f)
            .unwrap_or_else(FilterRecord::conservative_default))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Side;
    use rust_decimal_macros::dec;

    #[test]
    fn create_order_is_idempotent_on_client_order_id() {
        let adapter = SimulatedExchangeAdapter::new();
        let params = CreateOrderParams {
            symbol: Symbol::new("BTC-USDT"),
            side: Side::Buy,
            order_type: OrderType::Limit,
            qty: dec!(0.01),
            price: dec!(50000),
            client_order_id: "abc123".into(),
            time_in_force: TimeInForce::GoodTilCanceled,
        };
        let r1 = adapter.create_order(params.clone()).unwrap();
        let r2 = adapter.create_order(params).unwrap();
        match (r1, r2) {
            (CreateOrderOutcome::Accepted { exchange_order_id: a }, CreateOrderOutcome::Accepted { exchange_order_id: b }) => {
                assert_eq!(a, b);
            }
            _ => panic!("expected both accepted"),
        }
        assert_eq!(adapter.orders.len(), 1);
    }

    #[test]
    fn cancel_already_canceled_order_is_a_noop_success() {
        let mut adapter = SimulatedExchangeAdapter::new();
        adapter.auto_fill = false;
        let outcome = adapter
            .create_order(CreateOrderParams {
                symbol: Symbol::new("BTC-USDT"),
                side: Side::Buy,
                order_type: OrderType::Limit,
                qty: dec!(0.01),
                price: dec!(50000),
                client_order_id: "xyz".into(),
                time_in_force: TimeInForce::GoodTilCanceled,
            })
            .unwrap();
        let id = match outcome {
            CreateOrderOutcome::Accepted { exchange_order_id } => exchange_order_id,
            _ => panic!(),
        };
        adapter.cancel_order(&id, &Symbol::new("BTC-USDT")).unwrap();
        adapter.cancel_order(&id, &Symbol::new("BTC-USDT")).unwrap();
        assert_eq!(adapter.fetch_order(&id, &Symbol::new("BTC-USDT")).unwrap().status, OrderStatus::Canceled);
    }
}
