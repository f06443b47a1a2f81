//! Portfolio: the single synchronized owner of cash and positions.
//!
//! Guarded by a `parking_lot::ReentrantMutex` rather than a plain `Mutex`
//! because `apply_fill` can call `release` internally while the caller
//! already holds the lock — the spec calls for reentrant semantics
//! explicitly, and `parking_lot` is already used elsewhere in this crate.

use crate::bus::{BusEvent, EventBus};
use crate::core::{now_ms, ReservationId, Side, Symbol};
use crate::persistence;
use parking_lot::ReentrantMutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionEntry {
    pub symbol: Symbol,
    pub amount: Decimal,
    pub average_entry: Decimal,
    pub accumulated_fees: Decimal,
    pub opened_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub symbol: Symbol,
    pub side: Side,
    pub amount: Decimal,
    pub created_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PortfolioBook {
    free: Decimal,
    reserved: Decimal,
    positions: HashMap<Symbol, PositionEntry>,
    reservations: HashMap<ReservationId, Reservation>,
}

#[derive(Debug, Clone)]
pub struct RealizedFill {
    pub symbol: Symbol,
    pub realized_pnl: Decimal,
    pub remaining_amount: Decimal,
}

/// Thread-safe cash-and-position book. All state lives behind one
/// reentrant lock; persistence is debounced and off the hot path.
pub struct Portfolio {
    inner: ReentrantMutex<RefCell<PortfolioBook>>,
    persist_path: Option<PathBuf>,
    last_persist_ms: ReentrantMutex<RefCell<u64>>,
    persist_interval_ms: u64,
    bus: EventBus,
}

impl Portfolio {
    pub fn new(initial_budget: Decimal) -> Self {
        Self {
            inner: ReentrantMutex::new(RefCell::new(PortfolioBook {
                free: initial_budget,
                reserved: Decimal::ZERO,
                positions: HashMap::new(),
                reservations: HashMap::new(),
            })),
            persist_path: None,
            last_persist_ms: ReentrantMutex::new(RefCell::new(0)),
            persist_interval_ms: 1_000,
            bus: EventBus::new(),
        }
    }

    /// Share an `EventBus` with the engine so `set_budget`/`adjust_budget`
    /// land on the same audit stream as order and phase events, instead of
    /// a private bus nobody subscribes to.
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_persistence(mut self, path: PathBuf, interval_ms: u64) -> Self {
        self.persist_path = Some(path);
        self.persist_interval_ms = interval_ms;
        self
    }

    pub fn free_balance(&self) -> Decimal {
        self.inner.lock().borrow().free
    }

    pub fn reserved_balance(&self) -> Decimal {
        self.inner.lock().borrow().reserved
    }

    /// Move `amount` from free to reserved. Fails if free < amount.
    pub fn reserve(&self, amount: Decimal, symbol: &Symbol, side: Side, reservation_id: ReservationId) -> bool {
        let guard = self.inner.lock();
        let mut book = guard.borrow_mut();
        if book.free < amount {
            return false;
        }
        book.free -= amount;
        book.reserved += amount;
        book.reservations.insert(
            reservation_id,
            Reservation {
                symbol: symbol.clone(),
                side,
                amount,
                created_at_ms: now_ms(),
            },
        );
        drop(book);
        drop(guard);
        self.maybe_persist();
        true
    }

    /// Return reserved funds to free. Idempotent: releasing a missing id
    /// is a no-op, logged rather than returned as an error.
    pub fn release(&self, reservation_id: ReservationId, reason: &str) {
        let guard = self.inner.lock();
        let mut book = guard.borrow_mut();
        match book.reservations.remove(&reservation_id) {
            Some(res) => {
                book.reserved -= res.amount;
                book.free += res.amount;
            }
            None => {
                warn!(%reservation_id, reason, "release called on unknown reservation id, no-op");
            }
        }
        drop(book);
        drop(guard);
        self.maybe_persist();
    }

    /// Consume a reservation and apply a fill. Buys increase the position
    /// using weighted-average entry price; sells reduce it and compute
    /// realized PnL.
    pub fn apply_fill(
        &self,
        reservation_id: ReservationId,
        symbol: &Symbol,
        side: Side,
        qty: Decimal,
        price: Decimal,
        fee: Decimal,
    ) -> RealizedFill {
        let guard = self.inner.lock();
        let mut book = guard.borrow_mut();

        if let Some(res) = book.reservations.remove(&reservation_id) {
            book.reserved -= res.amount;
            let notional = qty * price;
            match side {
                Side::Buy => {
                    // refund any unused reservation (quantization may have
                    // trimmed the filled quantity below the reserved amount)
                    let spent = notional + fee;
                    if res.amount > spent {
                        book.free += res.amount - spent;
                    } else if spent > res.amount {
                        book.free -= spent - res.amount;
                    }
                }
                Side::Sell => {
                    book.free += notional - fee;
                }
            }
        }

        let realized = match side {
            Side::Buy => {
                let entry = book.positions.entry(symbol.clone()).or_insert(PositionEntry {
                    symbol: symbol.clone(),
                    amount: Decimal::ZERO,
                    average_entry: Decimal::ZERO,
                    accumulated_fees: Decimal::ZERO,
                    opened_at_ms: now_ms(),
                });
                let total_cost = entry.amount * entry.average_entry + qty * price;
                let total_amount = entry.amount + qty;
                entry.average_entry = if total_amount.is_zero() {
                    Decimal::ZERO
                } else {
                    total_cost / total_amount
                };
                entry.amount = total_amount;
                entry.accumulated_fees += fee;
                RealizedFill {
                    symbol: symbol.clone(),
                    realized_pnl: Decimal::ZERO,
                    remaining_amount: entry.amount,
                }
            }
            Side::Sell => {
                let mut realized_pnl = Decimal::ZERO;
                let mut remaining = Decimal::ZERO;
                if let Some(entry) = book.positions.get_mut(symbol) {
                    let sell_qty = qty.min(entry.amount);
                    realized_pnl = (price - entry.average_entry) * sell_qty - fee;
                    entry.amount -= sell_qty;
                    entry.accumulated_fees += fee;
                    remaining = entry.amount;
                    if entry.amount.is_zero() {
                        book.positions.remove(symbol);
                        remaining = Decimal::ZERO;
                    }
                }
                RealizedFill {
                    symbol: symbol.clone(),
                    realized_pnl,
                    remaining_amount: remaining,
                }
            }
        };

        drop(book);
        drop(guard);
        self.maybe_persist();
        realized
    }

    pub fn set_budget(&self, amount: Decimal, reason: &str) {
        let guard = self.inner.lock();
        let mut book = guard.borrow_mut();
        info!(amount = %amount, reason, old = %book.free, "budget set");
        book.free = amount;
        drop(book);
        drop(guard);
        self.bus.publish(BusEvent::BudgetUpdated { amount });
        self.maybe_persist();
    }

    pub fn adjust_budget(&self, delta: Decimal, reason: &str) {
        let guard = self.inner.lock();
        let mut book = guard.borrow_mut();
        info!(delta = %delta, reason, "budget adjusted");
        book.free += delta;
        drop(book);
        drop(guard);
        self.bus.publish(BusEvent::BudgetAdjusted { delta });
        self.maybe_persist();
    }

    /// Immutable snapshot of all open positions — not a live reference.
    pub fn get_all_positions(&self) -> Vec<PositionEntry> {
        self.inner.lock().borrow().positions.values().cloned().collect()
    }

    pub fn get_position(&self, symbol: &Symbol) -> Option<PositionEntry> {
        self.inner.lock().borrow().positions.get(symbol).cloned()
    }

    /// Record a position the reconciler found on the exchange but this
    /// engine never reserved budget for — an orphan adoption. Inserted at
    /// best-effort average price with no effect on free/reserved cash,
    /// since those balances were never ours to begin with.
    pub fn adopt_position(&self, symbol: &Symbol, amount: Decimal, average_entry: Decimal) {
        let guard = self.inner.lock();
        let mut book = guard.borrow_mut();
        book.positions.insert(
            symbol.clone(),
            PositionEntry {
                symbol: symbol.clone(),
                amount,
                average_entry,
                accumulated_fees: Decimal::ZERO,
                opened_at_ms: now_ms(),
            },
        );
        drop(book);
        drop(guard);
        self.maybe_persist();
    }

    /// Release reservations older than `max_age_s`, returning how many
    /// were cleaned up.
    pub fn cleanup_stale_reservations(&self, max_age_s: u64) -> usize {
        let now = now_ms();
        let cutoff = max_age_s * 1000;
        let stale_ids: Vec<ReservationId> = {
            let guard = self.inner.lock();
            let book = guard.borrow();
            book.reservations
                .iter()
                .filter(|(_, r)| now.saturating_sub(r.created_at_ms) > cutoff)
                .map(|(id, _)| *id)
                .collect()
        };
        let count = stale_ids.len();
        if count > 0 {
            warn!(count, "releasing stale reservations");
        }
        for id in stale_ids {
            self.release(id, "stale_reservation_cleanup");
        }
        count
    }

    /// Budget-health check: free + reserved + Σ(position notional at
    /// entry) should track `external_verified_balance` within `tolerance`
    /// (a fraction, e.g. 0.01 for 1%). Returns the drift fraction.
    pub fn budget_drift(&self, external_verified_balance: Decimal) -> Decimal {
        let guard = self.inner.lock();
        let book = guard.borrow();
        let position_notional: Decimal = book
            .positions
            .values()
            .map(|p| p.amount * p.average_entry)
            .sum();
        let local_total = book.free + book.reserved + position_notional;
        if external_verified_balance.is_zero() {
            return Decimal::ZERO;
        }
        (local_total - external_verified_balance) / external_verified_balance
    }

    fn maybe_persist(&self) {
        let Some(path) = &self.persist_path else { return };
        let now = now_ms();
        {
            let guard = self.last_persist_ms.lock();
            let mut last = guard.borrow_mut();
            if now.saturating_sub(*last) < self.persist_interval_ms {
                return;
            }
            *last = now;
        }
        self.flush_to(path);
    }

    /// Synchronous flush, used on the debounce path and unconditionally
    /// on shutdown.
    pub fn flush(&self) {
        if let Some(path) = self.persist_path.clone() {
            self.flush_to(&path);
        }
    }

    fn flush_to(&self, path: &PathBuf) {
        let book = self.inner.lock().borrow().clone();
        if let Err(e) = persistence::write_json_atomic(path, &book) {
            warn!(error = %e, "failed to persist portfolio");
        }
    }
}

impl Clone for PortfolioBook {
    fn clone(&self) -> Self {
        Self {
            free: self.free,
            reserved: self.reserved,
            positions: self.positions.clone(),
            reservations: self.reservations.clone(),
        }
    }
}
