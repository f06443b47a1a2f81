//! Position exit machinery: the Wait-Fill Service, the priority-ordered
//! Exit Engine, and the Dynamic Protection Manager that switches the
//! active protective order between SL and TP as PnL moves.

use crate::config::ProtectionConfig;
use crate::core::{now_ms, SymbolState};
use crate::exchange::{ExchangeOrder, OrderStatus};
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitFillOutcome {
    /// Still open (or partially filled within its stuck-timeout budget);
    /// not terminal, caller must poll again next cycle.
    Pending,
    Filled,
    Canceled,
    BuyAborted,
}

/// Polls an order to a terminal outcome under a deterministic timeout
/// policy: total timeout since placement, or a partial-fill-stuck timeout
/// with no increase in filled quantity.
pub struct WaitFillService;

impl WaitFillService {
    pub fn evaluate(
        order: Option<&ExchangeOrder>,
        placed_at_ms: u64,
        partial_first_seen_ms: Option<u64>,
        wait_fill_timeout_s: u64,
        partial_max_age_s: u64,
    ) -> WaitFillOutcome {
        let Some(order) = order else {
            return WaitFillOutcome::BuyAborted;
        };

        if order.status == OrderStatus::Filled {
            return WaitFillOutcome::Filled;
        }
        if matches!(order.status, OrderStatus::Canceled | OrderStatus::Rejected) {
            return WaitFillOutcome::BuyAborted;
        }

        let now = now_ms();
        if now.saturating_sub(placed_at_ms) >= wait_fill_timeout_s * 1000 {
            return WaitFillOutcome::Canceled;
        }

        if order.status == OrderStatus::PartiallyFilled {
            if let Some(first_seen) = partial_first_seen_ms {
                if now.saturating_sub(first_seen) >= partial_max_age_s * 1000 {
                    return WaitFillOutcome::Canceled;
                }
            }
        }

        WaitFillOutcome::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExitRule {
    HardSl = 0,
    HardTp = 1,
    Trailing = 2,
    Time = 3,
}

#[derive(Debug, Clone)]
pub struct ExitDecision {
    pub rule: ExitRule,
    pub price: Decimal,
    pub reason: String,
    pub priority: u8,
}

/// Selects the single highest-priority triggered exit rule. Conflicts
/// (e.g. SL and TP both cross on a wick) resolve strictly by priority,
/// never by whichever check happens to run first.
pub struct ExitEngine;

impl ExitEngine {
    pub fn evaluate(state: &SymbolState, current_price: Decimal, protection: &ProtectionConfig) -> Option<ExitDecision> {
        if let (Some(sl_px), true) = (state.sl_price, state.sl_active) {
            if current_price <= sl_px {
                return Some(ExitDecision {
                    rule: ExitRule::HardSl,
                    price: sl_px,
                    reason: "EXIT_SIGNAL_SL".into(),
                    priority: 0,
                });
            }
        }

        if let (Some(tp_px), true) = (state.tp_price, state.tp_active) {
            if current_price >= tp_px {
                return Some(ExitDecision {
                    rule: ExitRule::HardTp,
                    price: tp_px,
                    reason: "EXIT_SIGNAL_TP".into(),
                    priority: 1,
                });
            }
        }

        if state.trailing_active && !state.trail_high.is_zero() {
            let drawdown_pct = (state.trail_high - current_price) / state.trail_high * Decimal::ONE_HUNDRED;
            if drawdown_pct >= protection.trail_pct {
                return Some(ExitDecision {
                    rule: ExitRule::Trailing,
                    price: current_price,
                    reason: "EXIT_SIGNAL_TRAILING".into(),
                    priority: 2,
                });
            }
        }

        if let Some(entry_ts) = state.entry_ts_ms {
            let age_s = now_ms().saturating_sub(entry_ts) / 1000;
            if age_s >= protection.max_hold_time_s {
                return Some(ExitDecision {
                    rule: ExitRule::Time,
                    price: current_price,
                    reason: "EXIT_SIGNAL_TIME".into(),
                    priority: 3,
                });
            }
        }

        None
    }

    /// Update trailing-stop activation/peak bookkeeping in place, called
    /// once per POSITION cycle before `evaluate`.
    pub fn update_trailing(state: &mut SymbolState, current_price: Decimal, protection: &ProtectionConfig) {
        state.trail_high = state.trail_high.max(current_price);
        if !state.trailing_active {
            let pnl_pct = state.unrealized_pnl_pct();
            if pnl_pct >= protection.trail_activation_pct {
                state.trailing_active = true;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionSwitch {
    None,
    ToSl,
    ToTp,
}

/// Periodically re-evaluates whether the active protective order should
/// be TP or SL, with a per-symbol cooldown between switches and rollback
/// on any placement/cancel failure.
pub struct DynamicProtectionManager;

impl DynamicProtectionManager {
    /// Decide whether a switch is warranted right now. Does not itself
    /// place/cancel orders — the caller applies the switch and, only on
    /// success, calls `apply`; on failure it must leave state untouched
    /// (the rollback the spec requires falls out of never having mutated
    /// state before confirmation).
    pub fn decide(state: &SymbolState, protection: &ProtectionConfig, last_switch_ms: Option<u64>) -> ProtectionSwitch {
        if let Some(last) = last_switch_ms {
            if now_ms().saturating_sub(last) < protection.switch_cooldown_s * 1000 {
                return ProtectionSwitch::None;
            }
        }

        let pnl_pct = state.unrealized_pnl_pct();

        if pnl_pct < protection.switch_to_sl_pnl_pct && state.tp_active && !state.sl_active {
            return ProtectionSwitch::ToSl;
        }
        if pnl_pct > protection.switch_to_tp_pnl_pct && state.sl_active && !state.tp_active {
            return ProtectionSwitch::ToTp;
        }
        ProtectionSwitch::None
    }

    pub fn apply(state: &mut SymbolState, switch: ProtectionSwitch) {
        match switch {
            ProtectionSwitch::ToSl => {
                state.sl_active = true;
                state.tp_active = false;
            }
            ProtectionSwitch::ToTp => {
                state.sl_active = false;
                state.tp_active = true;
            }
            ProtectionSwitch::None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Phase, Symbol};
    use rust_decimal_macros::dec;

    fn protection() -> ProtectionConfig {
        ProtectionConfig {
            tp_pct: dec!(1.0),
            sl_pct: dec!(1.0),
            trail_pct: dec!(0.5),
            trail_activation_pct: dec!(0.3),
            max_hold_time_s: 14400,
            switch_cooldown_s: 20,
            switch_to_sl_pnl_pct: dec!(-0.5),
            switch_to_tp_pnl_pct: dec!(0.2),
        }
    }

    fn position_state() -> SymbolState {
        let mut s = SymbolState::new(Symbol::new("BTC-USDT"));
        s.transition(Phase::Position, "test");
        s.entry_price = dec!(100);
        s.entry_ts_ms = Some(now_ms());
        s.tp_price = Some(dec!(101));
        s.sl_price = Some(dec!(99));
        s.tp_active = true;
        s.sl_active = true;
        s.trail_high = dec!(100);
        s
    }

    #[test]
    fn hard_sl_outranks_hard_tp_on_the_same_tick() {
        let mut s = position_state();
        // contrived: both thresholds crossed, SL must win by priority
        s.tp_price = Some(dec!(90));
        let decision = ExitEngine::evaluate(&s, dec!(95), &protection()).unwrap();
        assert_eq!(decision.rule, ExitRule::HardSl);
    }

    #[test]
    fn hard_tp_fires_when_only_tp_crossed() {
        let s = position_state();
        let decision = ExitEngine::evaluate(&s, dec!(102), &protection()).unwrap();
        assert_eq!(decision.rule, ExitRule::HardTp);
        assert_eq!(decision.reason, "EXIT_SIGNAL_TP");
    }

    #[test]
    fn no_rule_fires_when_nothing_triggered() {
        let s = position_state();
        let decision = ExitEngine::evaluate(&s, dec!(100.2), &protection());
        assert!(decision.is_none());
    }

    #[test]
    fn trailing_activates_and_then_triggers_on_drawdown() {
        let mut s = position_state();
        s.tp_active = false;
        s.sl_active = false;
        s.current_price = dec!(100.5);
        ExitEngine::update_trailing(&mut s, dec!(100.5), &protection());
        assert!(s.trailing_active);
        let decision = ExitEngine::evaluate(&s, dec!(99.9), &protection()).unwrap();
        assert_eq!(decision.rule, ExitRule::Trailing);
    }

    #[test]
    fn protection_switches_to_sl_below_threshold() {
        let mut s = position_state();
        s.current_price = dec!(99.4); // -0.6% pnl
        let switch = DynamicProtectionManager::decide(&s, &protection(), None);
        assert_eq!(switch, ProtectionSwitch::ToSl);
        DynamicProtectionManager::apply(&mut s, switch);
        assert!(s.sl_active && !s.tp_active);
    }

    #[test]
    fn protection_switch_respects_cooldown() {
        let s = position_state();
        let switch = DynamicProtectionManager::decide(&s, &protection(), Some(now_ms()));
        assert_eq!(switch, ProtectionSwitch::None);
    }

    #[test]
    fn wait_fill_reports_filled_on_terminal_fill() {
        let order = ExchangeOrder {
            exchange_order_id: "1".into(),
            client_order_id: "c1".into(),
            symbol: Symbol::new("BTC-USDT"),
            side: crate::core::Side::Buy,
            status: OrderStatus::Filled,
            filled_qty: dec!(1),
            avg_fill_price: dec!(100),
            fee: Decimal::ZERO,
        };
        let outcome = WaitFillService::evaluate(Some(&order), now_ms(), None, 30, 10);
        assert_eq!(outcome, WaitFillOutcome::Filled);
    }

    #[test]
    fn wait_fill_times_out_and_cancels() {
        let order = ExchangeOrder {
            exchange_order_id: "1".into(),
            client_order_id: "c1".into(),
            symbol: Symbol::new("BTC-USDT"),
            side: crate::core::Side::Buy,
            status: OrderStatus::Open,
            filled_qty: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
            fee: Decimal::ZERO,
        };
        let placed_at = now_ms() - 40_000;
        let outcome = WaitFillService::evaluate(Some(&order), placed_at, None, 30, 10);
        assert_eq!(outcome, WaitFillOutcome::Canceled);
    }

    #[test]
    fn wait_fill_aborts_on_missing_order() {
        let outcome = WaitFillService::evaluate(None, now_ms(), None, 30, 10);
        assert_eq!(outcome, WaitFillOutcome::BuyAborted);
    }

    #[test]
    fn wait_fill_reports_pending_while_still_open() {
        let order = ExchangeOrder {
            exchange_order_id: "1".into(),
            client_order_id: "c1".into(),
            symbol: Symbol::new("BTC-USDT"),
            side: crate::core::Side::Buy,
            status: OrderStatus::Open,
            filled_qty: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
            fee: Decimal::ZERO,
        };
        let outcome = WaitFillService::evaluate(Some(&order), now_ms(), None, 30, 10);
        assert_eq!(outcome, WaitFillOutcome::Pending);
    }

    #[test]
    fn wait_fill_reports_pending_on_partial_fill_within_stuck_budget() {
        let order = ExchangeOrder {
            exchange_order_id: "1".into(),
            client_order_id: "c1".into(),
            symbol: Symbol::new("BTC-USDT"),
            side: crate::core::Side::Buy,
            status: OrderStatus::PartiallyFilled,
            filled_qty: dec!(0.8),
            avg_fill_price: dec!(100),
            fee: Decimal::ZERO,
        };
        let first_seen = now_ms() - 4_000;
        let outcome = WaitFillService::evaluate(Some(&order), now_ms() - 4_000, Some(first_seen), 30, 10);
        assert_eq!(outcome, WaitFillOutcome::Pending);
    }

    #[test]
    fn wait_fill_cancels_partial_fill_stuck_past_its_own_timeout() {
        let order = ExchangeOrder {
            exchange_order_id: "1".into(),
            client_order_id: "c1".into(),
            symbol: Symbol::new("BTC-USDT"),
            side: crate::core::Side::Buy,
            status: OrderStatus::PartiallyFilled,
            filled_qty: dec!(0.8),
            avg_fill_price: dec!(100),
            fee: Decimal::ZERO,
        };
        let first_seen = now_ms() - 12_000;
        let outcome = WaitFillService::evaluate(Some(&order), now_ms() - 12_000, Some(first_seen), 30, 10);
        assert_eq!(outcome, WaitFillOutcome::Canceled);
    }
}
