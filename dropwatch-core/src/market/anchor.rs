//! Anchor Manager: tracks the reference price each symbol's drop percentage
//! is measured against, under one of four modes.

use crate::config::{DropTriggerMode, SignalConfig};
use crate::core::{now_ms, Symbol};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct AnchorEntry {
    session_peak: Decimal,
    rolling_peak: Decimal,
    persistent_anchor: Decimal,
    persistent_set_at_ms: u64,
}

impl AnchorEntry {
    fn new(price: Decimal, now: u64) -> Self {
        Self {
            session_peak: price,
            rolling_peak: price,
            persistent_anchor: price,
            persistent_set_at_ms: now,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AnchorResult {
    pub anchor: Decimal,
    pub mode_tag: &'static str,
}

/// Tracks per-symbol anchors across session-peak, rolling-peak, hybrid, and
/// persistent (disk-backed) modes.
pub struct AnchorManager {
    entries: DashMap<Symbol, AnchorEntry>,
    state_path: Option<PathBuf>,
}

impl AnchorManager {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            state_path: None,
        }
    }

    pub fn with_state_path(path: impl AsRef<Path>) -> Self {
        Self {
            entries: DashMap::new(),
            state_path: Some(path.as_ref().to_path_buf()),
        }
    }

    /// Load a previously-persisted anchor for `symbol`, used by persistent
    /// mode to survive restarts. Missing or unreadable state is not an
    /// error: the anchor simply seeds from the next observed price.
    pub fn restore(&self, symbol: &Symbol, anchor: Decimal, set_at_ms: u64) {
        self.entries
            .entry(symbol.clone())
            .and_modify(|e| {
                e.persistent_anchor = anchor;
                e.persistent_set_at_ms = set_at_ms;
            })
            .or_insert(AnchorEntry {
                session_peak: anchor,
                rolling_peak: anchor,
                persistent_anchor: anchor,
                persistent_set_at_ms: set_at_ms,
            });
    }

    /// Update the session/rolling peaks from an observed price and the
    /// window's rolling peak, and return the anchor for the configured mode.
    pub fn update(
        &self,
        symbol: &Symbol,
        price: Decimal,
        window_rolling_peak: Decimal,
        cfg: &SignalConfig,
    ) -> AnchorResult {
        let now = now_ms();
        let mut entry = self
            .entries
            .entry(symbol.clone())
            .or_insert_with(|| AnchorEntry::new(price, now));

        entry.session_peak = entry.session_peak.max(price);
        entry.rolling_peak = window_rolling_peak.max(price);

        match cfg.drop_trigger_mode {
            DropTriggerMode::SessionPeak => AnchorResult {
                anchor: entry.session_peak,
                mode_tag: "session_peak",
            },
            DropTriggerMode::RollingPeak => AnchorResult {
                anchor: entry.rolling_peak,
                mode_tag: "rolling_peak",
            },
            DropTriggerMode::Hybrid => AnchorResult {
                anchor: entry.session_peak.max(entry.rolling_peak),
                mode_tag: "hybrid",
            },
            DropTriggerMode::Persistent => {
                let stale_ms = cfg.anchor_stale_minutes * 60_000;
                let age = now.saturating_sub(entry.persistent_set_at_ms);
                if age > stale_ms {
                    entry.persistent_anchor = price;
                    entry.persistent_set_at_ms = now;
                }

                let clamp_ceiling = price * (Decimal::ONE + cfg.anchor_clamp_pct);
                if entry.persistent_anchor > clamp_ceiling {
                    entry.persistent_anchor = clamp_ceiling;
                }
                if price > entry.persistent_anchor {
                    entry.persistent_anchor = price;
                    entry.persistent_set_at_ms = now;
                }

                AnchorResult {
                    anchor: entry.persistent_anchor,
                    mode_tag: "persistent",
                }
            }
        }
    }

    pub fn state_path(&self) -> Option<&Path> {
        self.state_path.as_deref()
    }
}

impl Default for AnchorManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn cfg(mode: DropTriggerMode) -> SignalConfig {
        SignalConfig {
            drop_trigger_mode: mode,
            drop_trigger_value: dec!(0.02),
            anchor_stale_minutes: 60,
            window_lookback_s: 300,
            anchor_clamp_pct: dec!(0.05),
        }
    }

    #[test]
    fn session_peak_only_increases() {
        let mgr = AnchorManager::new();
        let sym = Symbol::new("BTC-USDT");
        let c = cfg(DropTriggerMode::SessionPeak);
        mgr.update(&sym, dec!(100), dec!(100), &c);
        let r = mgr.update(&sym, dec!(90), dec!(90), &c);
        assert_eq!(r.anchor, dec!(100));
    }

    #[test]
    fn hybrid_takes_max_of_session_and_rolling() {
        let mgr = AnchorManager::new();
        let sym = Symbol::new("BTC-USDT");
        let c = cfg(DropTriggerMode::Hybrid);
        mgr.update(&sym, dec!(100), dec!(100), &c);
        let r = mgr.update(&sym, dec!(90), dec!(120), &c);
        assert_eq!(r.anchor, dec!(120));
    }

    #[test]
    fn persistent_anchor_clamps_to_current_price_ceiling() {
        let mgr = AnchorManager::new();
        let sym = Symbol::new("BTC-USDT");
        let c = cfg(DropTriggerMode::Persistent);
        mgr.restore(&sym, dec!(1000), now_ms());
        let r = mgr.update(&sym, dec!(100), dec!(100), &c);
        // 100 * 1.05 = 105, far below the restored 1000 anchor
        assert_eq!(r.anchor, dec!(105.00));
    }
}
