//! The per-symbol phase graph and the state record each symbol carries.
//!
//! Modeled as a flat struct + enum rather than the typestate pattern used
//! elsewhere in this codebase (see `core::order_fsm` equivalents in prior
//! single-purpose engines): the 12-phase graph has back-edges
//! (POSITION<->EXIT_EVAL, PLACE_SELL<->WAIT_SELL_FILL, any->ERROR) that a
//! move-based typestate can't express without re-introducing a sum type at
//! every call site, which is exactly what we'd be trying to avoid.

use super::ids::Symbol;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Warmup,
    Idle,
    EntryEval,
    PlaceBuy,
    WaitFill,
    Position,
    ExitEval,
    PlaceSell,
    WaitSellFill,
    PostTrade,
    Cooldown,
    Error,
}

impl Phase {
    pub fn has_open_position(&self) -> bool {
        matches!(
            self,
            Phase::Position
                | Phase::ExitEval
                | Phase::PlaceSell
                | Phase::WaitSellFill
                | Phase::PostTrade
        )
    }

    pub fn is_flat(&self) -> bool {
        matches!(
            self,
            Phase::Idle | Phase::Cooldown | Phase::EntryEval | Phase::PlaceBuy | Phase::WaitFill
        )
    }

    pub fn is_scanner_eligible(&self) -> bool {
        matches!(self, Phase::Idle | Phase::Warmup | Phase::Cooldown)
    }
}

/// Audit record of a single phase transition, kept in a bounded ring on
/// `SymbolState` and mirrored to the `phase_events_<run_id>.jsonl` log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseEvent {
    pub from: Phase,
    pub to: Phase,
    pub at_ms: u64,
    pub reason: String,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Everything the engine tracks about one tradable symbol.
///
/// Invariants (enforced by the handlers in `crate::engine`, not by this
/// type itself — a plain data record has no way to reject an illegal
/// write, only the dispatch loop can):
/// - if `phase` has an open position, `amount > 0` and `entry_price > 0`
/// - if `phase.is_flat()`, `amount == 0`
/// - while a position is open after Dynamic Protection has run once,
///   exactly one of `{tp_active, sl_active}` is true
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolState {
    // identity
    pub symbol: Symbol,
    pub phase: Phase,
    pub decision_id: u64,

    // order references
    pub active_order_id: Option<String>,
    pub client_order_id: Option<String>,
    pub tp_order_id: Option<String>,
    pub sl_order_id: Option<String>,
    /// The router intent currently in flight for this symbol (buy while
    /// in WAIT_FILL, sell while in WAIT_SELL_FILL). Cleared once terminal.
    pub pending_intent_id: Option<super::ids::IntentId>,

    // timing
    pub last_update_ms: u64,
    pub entry_ts_ms: Option<u64>,
    pub cooldown_until_ms: Option<u64>,
    pub order_placed_ms: Option<u64>,
    pub partial_fill_first_seen_ms: Option<u64>,

    // position
    pub amount: Decimal,
    pub entry_price: Decimal,
    pub fee_per_unit: Decimal,
    pub current_price: Decimal,

    // trailing
    pub trail_high: Decimal,
    pub trailing_trigger_price: Option<Decimal>,
    pub trailing_active: bool,

    // drop-trigger
    pub anchor_price: Option<Decimal>,
    pub anchor_ts_ms: Option<u64>,
    pub anchor_source: Option<String>,

    // exit protections
    pub tp_price: Option<Decimal>,
    pub sl_price: Option<Decimal>,
    pub tp_active: bool,
    pub sl_active: bool,

    // metadata
    pub entry_signal_tag: Option<String>,
    pub exit_reason: Option<String>,
    pub error_count: u32,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub phase_history: VecDeque<PhaseEvent>,
}

const PHASE_HISTORY_CAP: usize = 32;

impl SymbolState {
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            phase: Phase::Warmup,
            decision_id: 0,
            active_order_id: None,
            client_order_id: None,
            tp_order_id: None,
            sl_order_id: None,
            pending_intent_id: None,
            last_update_ms: now_ms(),
            entry_ts_ms: None,
            cooldown_until_ms: None,
            order_placed_ms: None,
            partial_fill_first_seen_ms: None,
            amount: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            fee_per_unit: Decimal::ZERO,
            current_price: Decimal::ZERO,
            trail_high: Decimal::ZERO,
            trailing_trigger_price: None,
            trailing_active: false,
            anchor_price: None,
            anchor_ts_ms: None,
            anchor_source: None,
            tp_price: None,
            sl_price: None,
            tp_active: false,
            sl_active: false,
            entry_signal_tag: None,
            exit_reason: None,
            error_count: 0,
            retry_count: 0,
            last_error: None,
            phase_history: VecDeque::with_capacity(PHASE_HISTORY_CAP),
        }
    }

    /// Transition to a new phase, recording the event in the bounded ring.
    pub fn transition(&mut self, to: Phase, reason: impl Into<String>) {
        let event = PhaseEvent {
            from: self.phase,
            to,
            at_ms: now_ms(),
            reason: reason.into(),
        };
        if self.phase_history.len() == PHASE_HISTORY_CAP {
            self.phase_history.pop_front();
        }
        self.phase_history.push_back(event);
        self.phase = to;
        self.last_update_ms = now_ms();
    }

    pub fn is_in_cooldown(&self) -> bool {
        match self.cooldown_until_ms {
            Some(until) => now_ms() < until,
            None => false,
        }
    }

    pub fn unrealized_pnl_pct(&self) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        (self.current_price - self.entry_price) / self.entry_price * Decimal::ONE_HUNDRED
    }
}
