//! Drop-Signal Evaluator: decides whether a snapshot's drop from anchor
//! crosses the configured trigger threshold.

use super::Snapshot;
use rust_decimal::Decimal;

#[derive(Debug, Clone)]
pub struct DropSignal {
    pub triggered: bool,
    pub mode_tag: &'static str,
    pub drop_pct: Decimal,
}

pub struct DropSignalEvaluator;

impl DropSignalEvaluator {
    /// `threshold` is a positive fraction (e.g. 0.02 for 2%); the signal
    /// fires when price has fallen at least that much below `anchor`.
    pub fn evaluate(snapshot: &Snapshot, threshold: Decimal) -> DropSignal {
        if !snapshot.usable() || snapshot.anchor.is_zero() {
            return DropSignal {
                triggered: false,
                mode_tag: snapshot.anchor_mode_tag,
                drop_pct: Decimal::ZERO,
            };
        }

        let drop_pct = (snapshot.last - snapshot.anchor) / snapshot.anchor;
        DropSignal {
            triggered: drop_pct <= -threshold,
            mode_tag: snapshot.anchor_mode_tag,
            drop_pct,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Symbol;
    use crate::market::snapshot::SNAPSHOT_SCHEMA_VERSION;
    use rust_decimal_macros::dec;

    fn snapshot(last: Decimal, anchor: Decimal, usable: bool) -> Snapshot {
        Snapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            symbol: Symbol::new("BTC-USDT"),
            timestamp_ms: 0,
            last,
            bid: last,
            ask: last,
            mid: last,
            spread_bps: Decimal::ZERO,
            spread_pct: Decimal::ZERO,
            depth_usd_bid: dec!(1000),
            depth_usd_ask: dec!(1000),
            depth_imbalance: Decimal::ZERO,
            rolling_peak: anchor,
            rolling_trough: last,
            anchor,
            anchor_mode_tag: "hybrid",
            drop_pct_from_anchor: Decimal::ZERO,
            rise_pct_from_trough: Decimal::ZERO,
            data_age_ms: 0,
            stale: !usable,
            valid: usable,
        }
    }

    #[test]
    fn triggers_when_drop_meets_threshold() {
        let snap = snapshot(dec!(98), dec!(100), true);
        let r = DropSignalEvaluator::evaluate(&snap, dec!(0.02));
        assert!(r.triggered);
        assert_eq!(r.drop_pct, dec!(-0.02));
    }

    #[test]
    fn does_not_trigger_above_threshold() {
        let snap = snapshot(dec!(99), dec!(100), true);
        let r = DropSignalEvaluator::evaluate(&snap, dec!(0.02));
        assert!(!r.triggered);
    }

    #[test]
    fn never_triggers_on_stale_snapshot() {
        let snap = snapshot(dec!(50), dec!(100), false);
        let r = DropSignalEvaluator::evaluate(&snap, dec!(0.02));
        assert!(!r.triggered);
    }
}
