//! Market Guards: the bundle of pre-trade checks applied before an entry
//! signal is allowed to become an order.
//!
//! Same shape as earlier pre-trade rejection reporting in this codebase:
//! a report of what failed rather than a single bool, so callers can log
//! and metric the specific reason a symbol was skipped.

use crate::config::{GuardConfig, TradingConfig};
use crate::core::SymbolState;
use crate::market::Snapshot;
use crate::quantize::{FilterRecord, Quantizer};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuardViolation {
    SpreadTooWide,
    InsufficientDepth,
    InvalidTicker,
    CooldownActive,
    NoSlotAvailable,
    InsufficientBudget,
}

#[derive(Debug, Clone, Default)]
pub struct GuardReport {
    pub failed: Vec<GuardViolation>,
}

impl GuardReport {
    pub fn passed(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct MarketGuards;

impl MarketGuards {
    /// Evaluate every entry guard against a snapshot and the current book
    /// of open positions. `open_position_count` is the number of symbols
    /// currently past `Phase::WaitFill` and not yet flat.
    pub fn evaluate_entry(
        snapshot: &Snapshot,
        state: &SymbolState,
        trading: &TradingConfig,
        guard: &GuardConfig,
        open_position_count: usize,
        budget_available: Decimal,
        filters: FilterRecord,
    ) -> GuardReport {
        let mut failed = Vec::new();

        if !snapshot.usable() {
            failed.push(GuardViolation::InvalidTicker);
        }

        if snapshot.spread_bps > Decimal::from(guard.max_spread_bps) {
            failed.push(GuardViolation::SpreadTooWide);
        }

        if snapshot.depth_usd_ask < guard.depth_min_notional_usd {
            failed.push(GuardViolation::InsufficientDepth);
        }

        if state.is_in_cooldown() {
            failed.push(GuardViolation::CooldownActive);
        }

        if open_position_count >= trading.max_concurrent_positions {
            failed.push(GuardViolation::NoSlotAvailable);
        }

        if !Self::can_afford(snapshot.last, budget_available, filters) {
            failed.push(GuardViolation::InsufficientBudget);
        }

        GuardReport { failed }
    }

    /// Can `budget` buy at least `min_qty` of the symbol at `price`,
    /// quantized, while covering `min_notional`?
    pub fn can_afford(price: Decimal, budget: Decimal, filters: FilterRecord) -> bool {
        if price <= Decimal::ZERO || budget <= Decimal::ZERO {
            return false;
        }
        if budget < filters.min_notional {
            return false;
        }
        let raw_qty = budget / price;
        let quantized_qty = Quantizer::quantize_amount(raw_qty, filters.amount_step);
        quantized_qty >= filters.min_qty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Phase, Symbol, SymbolState};
    use crate::market::SNAPSHOT_SCHEMA_VERSION;
    use rust_decimal_macros::dec;

    fn trading() -> TradingConfig {
        TradingConfig {
            max_concurrent_positions: 5,
            position_size_usdt: dec!(25),
            cooldown_secs: 300,
            entry_block_cooldown_s: 120,
        }
    }

    fn guard() -> GuardConfig {
        GuardConfig {
            max_spread_bps: 20,
            depth_min_notional_usd: dec!(500),
            exit_min_liquidity_spread_pct: dec!(10),
            exit_low_liquidity_action: crate::config::LowLiquidityAction::Wait,
        }
    }

    fn filters() -> FilterRecord {
        FilterRecord {
            price_tick: dec!(0.01),
            amount_step: dec!(0.0001),
            min_qty: dec!(0.001),
            min_notional: dec!(10),
        }
    }

    fn snapshot() -> Snapshot {
        Snapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            symbol: Symbol::new("BTC-USDT"),
            timestamp_ms: crate::core::now_ms(),
            last: dec!(100),
            bid: dec!(99.99),
            ask: dec!(100.01),
            mid: dec!(100),
            spread_bps: dec!(2),
            spread_pct: dec!(0.02),
            depth_usd_bid: dec!(1000),
            depth_usd_ask: dec!(1000),
            depth_imbalance: Decimal::ZERO,
            rolling_peak: dec!(110),
            rolling_trough: dec!(90),
            anchor: dec!(110),
            anchor_mode_tag: "hybrid",
            drop_pct_from_anchor: dec!(-0.09),
            rise_pct_from_trough: dec!(0.11),
            data_age_ms: 10,
            stale: false,
            valid: true,
        }
    }

    #[test]
    fn passes_when_all_checks_clear() {
        let state = SymbolState::new(Symbol::new("BTC-USDT"));
        let report = MarketGuards::evaluate_entry(&snapshot(), &state, &trading(), &guard(), 0, dec!(1000), filters());
        assert!(report.passed());
    }

    #[test]
    fn blocks_on_no_slot_available() {
        let state = SymbolState::new(Symbol::new("BTC-USDT"));
        let report = MarketGuards::evaluate_entry(&snapshot(), &state, &trading(), &guard(), 5, dec!(1000), filters());
        assert!(!report.passed());
        assert!(report.failed.contains(&GuardViolation::NoSlotAvailable));
    }

    #[test]
    fn blocks_on_cooldown_active() {
        let mut state = SymbolState::new(Symbol::new("BTC-USDT"));
        state.transition(Phase::Cooldown, "test");
        state.cooldown_until_ms = Some(crate::core::now_ms() + 60_000);
        let report = MarketGuards::evaluate_entry(&snapshot(), &state, &trading(), &guard(), 0, dec!(1000), filters());
        assert!(report.failed.contains(&GuardViolation::CooldownActive));
    }

    #[test]
    fn blocks_on_zero_depth() {
        let state = SymbolState::new(Symbol::new("BTC-USDT"));
        let mut snap = snapshot();
        snap.depth_usd_ask = Decimal::ZERO;
        let report = MarketGuards::evaluate_entry(&snap, &state, &trading(), &guard(), 0, dec!(1000), filters());
        assert!(report.failed.contains(&GuardViolation::InsufficientDepth));
    }

    #[test]
    fn can_afford_rejects_budget_below_min_notional() {
        assert!(!MarketGuards::can_afford(dec!(100), dec!(5), filters()));
    }

    #[test]
    fn can_afford_accepts_sufficient_budget() {
        assert!(MarketGuards::can_afford(dec!(100), dec!(1000), filters()));
    }
}
