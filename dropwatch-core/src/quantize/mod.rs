//! Exchange-compliance quantization: floor prices/amounts to tick/step,
//! enforce minimum notional, and cache per-symbol filters.
//!
//! Grounded in the decimal-only compliance checks of prior risk modules
//! in this codebase (`is_on_tick()`-style modulo comparisons) — every
//! decision here is made with `Decimal` arithmetic, never floats.

use crate::core::Symbol;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Immutable per-symbol exchange filter set, fetched once and cached for
/// the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterRecord {
    pub price_tick: Decimal,
    pub amount_step: Decimal,
    pub min_qty: Decimal,
    pub min_notional: Decimal,
}

impl FilterRecord {
    /// Conservative defaults used when the exchange does not report a
    /// field for a symbol.
    pub fn conservative_default() -> Self {
        Self {
            price_tick: Decimal::new(1, 2),   // 0.01
            amount_step: Decimal::new(1, 6),  // 0.000001
            min_qty: Decimal::new(1, 6),
            min_notional: Decimal::new(10, 0), // 10.0
        }
    }
}

/// Thread-safe read-mostly cache of filters, keyed by symbol.
#[derive(Default)]
pub struct FilterCache {
    filters: DashMap<Symbol, FilterRecord>,
}

impl FilterCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, symbol: &Symbol) -> Option<FilterRecord> {
        self.filters.get(symbol).map(|r| *r)
    }

    pub fn get_or_insert_with(
        &self,
        symbol: &Symbol,
        fetch: impl FnOnce() -> FilterRecord,
    ) -> FilterRecord {
        *self
            .filters
            .entry(symbol.clone())
            .or_insert_with(fetch)
    }

    pub fn insert(&self, symbol: Symbol, record: FilterRecord) {
        self.filters.insert(symbol, record);
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Violation {
    TickViolation,
    StepViolation,
    MinQty,
    MinNotional,
    InvalidAfterQuantize,
    MinCostAutoFixed,
    InvalidAmountAfterQuantize,
}

#[derive(Debug, Clone)]
pub struct ValidateResult {
    pub quantized_price: Decimal,
    pub quantized_amount: Decimal,
    pub violations: Vec<Violation>,
    pub auto_fixed: bool,
}

impl ValidateResult {
    pub fn is_valid(&self) -> bool {
        !self
            .violations
            .iter()
            .any(|v| matches!(v, Violation::InvalidAfterQuantize | Violation::InvalidAmountAfterQuantize))
    }
}

pub struct Quantizer;

impl Quantizer {
    /// Floor `raw` to the nearest multiple of `tick` at or below it.
    pub fn quantize_price(raw: Decimal, tick: Decimal) -> Decimal {
        if tick.is_zero() {
            return raw;
        }
        (raw / tick).floor() * tick
    }

    /// Floor `raw` to the nearest multiple of `step` at or below it.
    pub fn quantize_amount(raw: Decimal, step: Decimal) -> Decimal {
        if step.is_zero() {
            return raw;
        }
        (raw / step).floor() * step
    }

    /// Quantize price and amount, bump amount up to satisfy min_notional if
    /// necessary, and report every violation encountered along the way.
    pub fn validate_and_fix(
        raw_price: Decimal,
        raw_amount: Decimal,
        filters: FilterRecord,
    ) -> ValidateResult {
        let mut violations = Vec::new();
        let mut auto_fixed = false;

        let mut price = Self::quantize_price(raw_price, filters.price_tick);
        if !filters.price_tick.is_zero() && raw_price % filters.price_tick != Decimal::ZERO {
            violations.push(Violation::TickViolation);
        }

        let mut amount = Self::quantize_amount(raw_amount, filters.amount_step);
        if !filters.amount_step.is_zero() && raw_amount % filters.amount_step != Decimal::ZERO {
            violations.push(Violation::StepViolation);
        }

        if price <= Decimal::ZERO {
            violations.push(Violation::InvalidAfterQuantize);
        }

        if price * amount < filters.min_notional && price > Decimal::ZERO {
            // Bump amount up to the smallest quantized amount that clears
            // min_notional at this price.
            let needed = (filters.min_notional / price / filters.amount_step).ceil()
                * filters.amount_step;
            amount = needed;
            auto_fixed = true;
            violations.push(Violation::MinCostAutoFixed);
        }

        if amount < filters.min_qty {
            violations.push(Violation::MinQty);
            violations.push(Violation::InvalidAmountAfterQuantize);
        }

        if price <= Decimal::ZERO || amount <= Decimal::ZERO {
            price = price.max(Decimal::ZERO);
            amount = amount.max(Decimal::ZERO);
        }

        ValidateResult {
            quantized_price: price,
            quantized_amount: amount,
            violations,
            auto_fixed,
        }
    }
}
