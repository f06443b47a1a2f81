//! The market snapshot: one symbol's derived view of the book at an instant.

use crate::core::{now_ms, Symbol};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub schema_version: u32,
    pub symbol: Symbol,
    pub timestamp_ms: u64,
    pub last: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
    pub mid: Decimal,
    pub spread_bps: Decimal,
    pub spread_pct: Decimal,
    pub depth_usd_bid: Decimal,
    pub depth_usd_ask: Decimal,
    pub depth_imbalance: Decimal,
    pub rolling_peak: Decimal,
    pub rolling_trough: Decimal,
    pub anchor: Decimal,
    pub anchor_mode_tag: &'static str,
    pub drop_pct_from_anchor: Decimal,
    pub rise_pct_from_trough: Decimal,
    pub data_age_ms: u64,
    pub stale: bool,
    pub valid: bool,
}

impl Snapshot {
    /// Whether this snapshot is usable for entry decisions: not stale and
    /// not already flagged invalid by an upstream guard.
    pub fn usable(&self) -> bool {
        !self.stale && self.valid
    }

    pub fn age_ms(&self) -> u64 {
        now_ms().saturating_sub(self.timestamp_ms)
    }
}

/// Bid/ask depth in USD notional, used to derive imbalance and guard checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct DepthSample {
    pub bid_usd: Decimal,
    pub ask_usd: Decimal,
}

pub fn spread_bps(bid: Decimal, ask: Decimal) -> Decimal {
    if bid.is_zero() {
        return Decimal::ZERO;
    }
    let mid = (bid + ask) / Decimal::from(2);
    if mid.is_zero() {
        return Decimal::ZERO;
    }
    (ask - bid) / mid * Decimal::new(10_000, 0)
}
