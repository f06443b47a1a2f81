//! The in-process audit/event bus, shared by `Portfolio` and `Engine`.
//!
//! Lives below both so neither has to depend on the other to publish or
//! subscribe: `Portfolio` reports budget changes, `Engine` reports phase
//! and order-lifecycle events, and anything downstream (metrics, a UI
//! feed) subscribes without caring which side published.

use crate::core::{IntentId, Side, Symbol};
use crate::market::Snapshot;
use rust_decimal::Decimal;
use std::sync::Arc;

/// Events published on the in-process bus, one variant per topic named in
/// the external-interfaces contract. Unlike the raw snapshot transport
/// (a dedicated `mpsc` channel owned by `MarketDataService`), this bus is
/// a genuine multi-subscriber broadcast: every subscriber registered
/// before a `publish` call receives its own copy.
#[derive(Debug, Clone)]
pub enum BusEvent {
    MarketSnapshots(Vec<Snapshot>),
    OrderIntent { symbol: Symbol, intent_id: IntentId, side: Side },
    OrderFilled { symbol: Symbol, intent_id: IntentId, qty: Decimal, price: Decimal },
    OrderFailed { symbol: Symbol, intent_id: IntentId, reason: String },
    OrderReconciled { symbol: Symbol, advanced: usize },
    BudgetReserved { symbol: Symbol, amount: Decimal },
    BudgetReleased { symbol: Symbol, amount: Decimal },
    BudgetUpdated { amount: Decimal },
    BudgetAdjusted { delta: Decimal },
}

/// Multi-producer, multi-subscriber broadcast over `crossbeam::channel`.
/// `crossbeam::channel::Receiver` is mpmc (any one message goes to exactly
/// one receiver among clones of the same channel), which doesn't give
/// every subscriber its own feed — so each `subscribe()` gets its own
/// channel and `publish` fans out to all of them.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<parking_lot::Mutex<Vec<crossbeam::channel::Sender<BusEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(parking_lot::Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> crossbeam::channel::Receiver<BusEvent> {
        let (tx, rx) = crossbeam::channel::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: BusEvent) {
        let mut subs = self.subscribers.lock();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn publish_fans_out_to_every_subscriber() {
        let bus = EventBus::new();
        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();
        bus.publish(BusEvent::BudgetUpdated { amount: dec!(1) });
        assert!(matches!(rx1.try_recv(), Ok(BusEvent::BudgetUpdated { .. })));
        assert!(matches!(rx2.try_recv(), Ok(BusEvent::BudgetUpdated { .. })));
    }

    #[test]
    fn dropped_subscriber_is_pruned_on_next_publish() {
        let bus = EventBus::new();
        {
            let _rx = bus.subscribe();
        }
        bus.publish(BusEvent::BudgetUpdated { amount: dec!(1) });
        assert_eq!(bus.subscribers.lock().len(), 0);
    }
}
