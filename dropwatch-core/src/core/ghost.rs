//! Ghost-position log: a small audit trail for buy attempts that never
//! became a real position.
//!
//! A `ComplianceError` abort moves no funds and creates no `PositionEntry`
//! in `Portfolio` — but an operator watching the UI still needs to see
//! that the engine tried and backed off, rather than silently doing
//! nothing. Each abort is recorded here as a `GhostPosition` so it stays
//! queryable after the `BusEvent::OrderFailed` that announced it has long
//! since scrolled off a log tail.

use crate::core::{now_ms, Symbol};
use parking_lot::Mutex;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct GhostPosition {
    pub symbol: Symbol,
    pub reason: String,
    pub recorded_at_ms: u64,
}

/// Fixed-capacity ring buffer of recent ghost positions, oldest evicted
/// first once `capacity` is reached.
pub struct GhostPositionLog {
    capacity: usize,
    entries: Mutex<VecDeque<GhostPosition>>,
}

impl GhostPositionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    pub fn record(&self, symbol: Symbol, reason: impl Into<String>) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(GhostPosition {
            symbol,
            reason: reason.into(),
            recorded_at_ms: now_ms(),
        });
    }

    /// Snapshot of every ghost position currently retained, oldest first.
    pub fn all(&self) -> Vec<GhostPosition> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn for_symbol(&self, symbol: &Symbol) -> Vec<GhostPosition> {
        self.entries.lock().iter().filter(|g| &g.symbol == symbol).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for GhostPositionLog {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_queryable_by_symbol() {
        let log = GhostPositionLog::new(10);
        let sym = Symbol::new("BTC-USDT");
        log.record(sym.clone(), "compliance violation: min_notional");
        assert_eq!(log.len(), 1);
        assert_eq!(log.for_symbol(&sym).len(), 1);
        assert!(log.for_symbol(&Symbol::new("ETH-USDT")).is_empty());
    }

    #[test]
    fn ring_buffer_evicts_oldest_past_capacity() {
        let log = GhostPositionLog::new(2);
        let sym = Symbol::new("BTC-USDT");
        log.record(sym.clone(), "first");
        log.record(sym.clone(), "second");
        log.record(sym.clone(), "third");
        let all = log.all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].reason, "second");
        assert_eq!(all[1].reason, "third");
    }
}
