//! Market-Data Service: polls the exchange in batches, maintains rolling
//! peak/trough windows, and publishes snapshots onto the event bus.
//!
//! Runs its poll loop on a dedicated thread wrapped in `catch_unwind` so a
//! single panicking poll cycle restarts the service instead of killing the
//! process, up to a configurable cap — the crash-and-never-restart failure
//! mode this replaces is the one thing this codebase refuses to repeat.

use super::anchor::AnchorManager;
use super::snapshot::{spread_bps, Snapshot, SNAPSHOT_SCHEMA_VERSION};
use crate::config::{MarketDataConfig, SignalConfig};
use crate::core::{now_ms, Symbol};
use crate::exchange::ExchangeAdapter;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::panic;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

struct RollingWindow {
    samples: VecDeque<(u64, rust_decimal::Decimal)>,
    lookback_ms: u64,
}

impl RollingWindow {
    fn new(lookback_ms: u64) -> Self {
        Self {
            samples: VecDeque::new(),
            lookback_ms,
        }
    }

    fn push(&mut self, at_ms: u64, price: rust_decimal::Decimal) {
        self.samples.push_back((at_ms, price));
        let cutoff = at_ms.saturating_sub(self.lookback_ms);
        while matches!(self.samples.front(), Some((t, _)) if *t < cutoff) {
            self.samples.pop_front();
        }
    }

    fn peak(&self) -> rust_decimal::Decimal {
        self.samples
            .iter()
            .map(|(_, p)| *p)
            .fold(rust_decimal::Decimal::MIN, |acc, p| if p > acc { p } else { acc })
    }

    fn trough(&self) -> rust_decimal::Decimal {
        self.samples
            .iter()
            .map(|(_, p)| *p)
            .fold(rust_decimal::Decimal::MAX, |acc, p| if p < acc { p } else { acc })
    }
}

/// Shared, concurrent per-symbol rolling-window state, separate from the
/// `AnchorManager` so the service can own window bookkeeping while the
/// anchor manager stays a pure function of (price, window peak, config).
struct WindowStore {
    windows: DashMap<Symbol, RollingWindow>,
    lookback_ms: u64,
}

impl WindowStore {
    fn new(lookback_ms: u64) -> Self {
        Self {
            windows: DashMap::new(),
            lookback_ms,
        }
    }

    fn observe(&self, symbol: &Symbol, at_ms: u64, price: rust_decimal::Decimal) -> (rust_decimal::Decimal, rust_decimal::Decimal) {
        let mut w = self
            .windows
            .entry(symbol.clone())
            .or_insert_with(|| RollingWindow::new(self.lookback_ms));
        w.push(at_ms, price);
        (w.peak(), w.trough())
    }
}

/// Runs the poll-and-publish loop. Not `Send`-bound to a thread itself;
/// `run_supervised` spawns the dedicated thread and handles restarts.
pub struct MarketDataService {
    exchange: Arc<dyn ExchangeAdapter>,
    symbols: Vec<Symbol>,
    md_cfg: MarketDataConfig,
    signal_cfg: SignalConfig,
    anchors: Arc<AnchorManager>,
    windows: WindowStore,
    last_published_ms: DashMap<Symbol, u64>,
    bus: Sender<Vec<Snapshot>>,
    shutdown: Arc<AtomicBool>,
    cycle_count: AtomicU32,
}

/// Order-book levels requested per side when pricing depth for the entry
/// guard. Deep enough to cover a typical position size without walking the
/// whole book.
const ORDER_BOOK_DEPTH_LEVELS: usize = 10;

impl MarketDataService {
    pub fn new(
        exchange: Arc<dyn ExchangeAdapter>,
        symbols: Vec<Symbol>,
        md_cfg: MarketDataConfig,
        signal_cfg: SignalConfig,
        anchors: Arc<AnchorManager>,
        bus: Sender<Vec<Snapshot>>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let lookback_ms = signal_cfg.window_lookback_s * 1000;
        Self {
            exchange,
            symbols,
            md_cfg,
            signal_cfg,
            anchors,
            windows: WindowStore::new(lookback_ms),
            last_published_ms: DashMap::new(),
            bus,
            shutdown,
            cycle_count: AtomicU32::new(0),
        }
    }

    /// Spawn the dedicated polling thread, auto-restarting on panic up to
    /// `md_max_auto_restarts` times. Returns the join handle.
    pub fn run_supervised(self: Arc<Self>) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            let mut restarts = 0u32;
            loop {
                if self.shutdown.load(Ordering::Relaxed) {
                    return;
                }
                let svc = self.clone();
                let result = panic::catch_unwind(panic::AssertUnwindSafe(|| svc.poll_loop()));
                if self.shutdown.load(Ordering::Relaxed) {
                    return;
                }
                match result {
                    Ok(()) => return,
                    Err(_) => {
                        restarts += 1;
                        error!(restarts, "market-data poll loop panicked");
                        if !self.md_cfg.md_auto_restart_on_crash || restarts > self.md_cfg.md_max_auto_restarts {
                            error!("market-data service exhausted restart budget, giving up");
                            return;
                        }
                        std::thread::sleep(Duration::from_secs(5));
                    }
                }
            }
        })
    }

    fn poll_loop(&self) {
        let mut heartbeat_every = 20u32;
        if heartbeat_every == 0 {
            heartbeat_every = 1;
        }
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }

            for batch in self.symbols.chunks(self.md_cfg.md_batch_size.max(1)) {
                if self.shutdown.load(Ordering::Relaxed) {
                    return;
                }
                if let Err(e) = self.poll_batch(batch) {
                    warn!(error = %e, "market-data batch poll failed");
                }
            }

            let cycle = self.cycle_count.fetch_add(1, Ordering::Relaxed) + 1;
            if cycle % heartbeat_every == 0 {
                info!(cycle, symbols = self.symbols.len(), "market-data heartbeat");
            }

            std::thread::sleep(Duration::from_millis(self.md_cfg.md_poll_ms));
        }
    }

    fn poll_batch(&self, symbols: &[Symbol]) -> anyhow::Result<()> {
        let tickers = self.exchange.fetch_tickers(symbols)?;
        let mut out = Vec::with_capacity(tickers.len());
        let now = now_ms();

        for ticker in tickers {
            if let Some(last) = self.last_published_ms.get(&ticker.symbol) {
                if now.saturating_sub(*last) < self.md_cfg.snapshot_min_period_ms {
                    continue;
                }
            }

            let (peak, trough) = self.windows.observe(&ticker.symbol, now, ticker.last);
            let anchor = self
                .anchors
                .update(&ticker.symbol, ticker.last, peak, &self.signal_cfg);

            let mid = (ticker.bid + ticker.ask) / rust_decimal::Decimal::from(2);
            let sb = spread_bps(ticker.bid, ticker.ask);
            let spread_pct = sb / rust_decimal::Decimal::from(100);

            let drop_pct_from_anchor = if anchor.anchor.is_zero() {
                rust_decimal::Decimal::ZERO
            } else {
                (ticker.last - anchor.anchor) / anchor.anchor
            };
            let rise_pct_from_trough = if trough.is_zero() {
                rust_decimal::Decimal::ZERO
            } else {
                (ticker.last - trough) / trough
            };

            let age_ms = now.saturating_sub(ticker.timestamp_ms);
            let stale = age_ms > self.md_cfg.snapshot_stale_ttl_s * 1000;

            let (depth_usd_bid, depth_usd_ask, depth_imbalance) =
                match self.exchange.fetch_order_book(&ticker.symbol, ORDER_BOOK_DEPTH_LEVELS) {
                    Ok(book) => {
                        let bid_usd: rust_decimal::Decimal =
                            book.bids.iter().map(|l| l.price * l.qty).sum();
                        let ask_usd: rust_decimal::Decimal =
                            book.asks.iter().map(|l| l.price * l.qty).sum();
                        let total = bid_usd + ask_usd;
                        let imbalance = if total.is_zero() {
                            rust_decimal::Decimal::ZERO
                        } else {
                            (bid_usd - ask_usd) / total
                        };
                        (bid_usd, ask_usd, imbalance)
                    }
                    Err(e) => {
                        warn!(symbol = %ticker.symbol, error = %e, "order book fetch failed, depth guard sees zero liquidity");
                        (rust_decimal::Decimal::ZERO, rust_decimal::Decimal::ZERO, rust_decimal::Decimal::ZERO)
                    }
                };

            let snap = Snapshot {
                schema_version: SNAPSHOT_SCHEMA_VERSION,
                symbol: ticker.symbol.clone(),
                timestamp_ms: ticker.timestamp_ms,
                last: ticker.last,
                bid: ticker.bid,
                ask: ticker.ask,
                mid,
                spread_bps: sb,
                spread_pct,
                depth_usd_bid,
                depth_usd_ask,
                depth_imbalance,
                rolling_peak: peak,
                rolling_trough: trough,
                anchor: anchor.anchor,
                anchor_mode_tag: anchor.mode_tag,
                drop_pct_from_anchor,
                rise_pct_from_trough,
                data_age_ms: age_ms,
                stale,
                valid: !stale,
            };

            self.last_published_ms.insert(ticker.symbol.clone(), now);
            out.push(snap);
        }

        if !out.is_empty() {
            debug!(count = out.len(), "publishing market snapshots");
            let _ = self.bus.send(out);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::SimulatedExchangeAdapter;
    use rust_decimal_macros::dec;
    use std::sync::mpsc::channel;

    fn md_cfg() -> MarketDataConfig {
        MarketDataConfig {
            md_poll_ms: 10,
            md_batch_size: 13,
            md_auto_restart_on_crash: true,
            md_max_auto_restarts: 5,
            snapshot_min_period_ms: 0,
            snapshot_stale_ttl_s: 30,
            md_cache_soft_ttl_ms: 5_000,
            md_cache_ttl_ms: 60_000,
        }
    }

    fn signal_cfg() -> SignalConfig {
        SignalConfig {
            drop_trigger_mode: crate::config::DropTriggerMode::Hybrid,
            drop_trigger_value: dec!(0.02),
            anchor_stale_minutes: 60,
            window_lookback_s: 300,
            anchor_clamp_pct: dec!(0.05),
        }
    }

    #[test]
    fn poll_batch_publishes_a_snapshot_per_symbol() {
        let adapter = Arc::new(SimulatedExchangeAdapter::new());
        let sym = Symbol::new("BTC-USDT");
        adapter.set_price(&sym, dec!(100));
        let (tx, rx) = channel();
        let svc = MarketDataService::new(
            adapter,
            vec![sym.clone()],
            md_cfg(),
            signal_cfg(),
            Arc::new(AnchorManager::new()),
            tx,
            Arc::new(AtomicBool::new(false)),
        );
        svc.poll_batch(&[sym.clone()]).unwrap();
        let batch = rx.recv().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].symbol, sym);
        assert_eq!(batch[0].last, dec!(100));
        assert!(batch[0].depth_usd_bid > rust_decimal::Decimal::ZERO);
        assert!(batch[0].depth_usd_ask > rust_decimal::Decimal::ZERO);
    }

    #[test]
    fn min_period_throttles_duplicate_publishes() {
        let adapter = Arc::new(SimulatedExchangeAdapter::new());
        let sym = Symbol::new("BTC-USDT");
        adapter.set_price(&sym, dec!(100));
        let (tx, rx) = channel();
        let mut cfg = md_cfg();
        cfg.snapshot_min_period_ms = 60_000;
        let svc = MarketDataService::new(
            adapter,
            vec![sym.clone()],
            cfg,
            signal_cfg(),
            Arc::new(AnchorManager::new()),
            tx,
            Arc::new(AtomicBool::new(false)),
        );
        svc.poll_batch(&[sym.clone()]).unwrap();
        svc.poll_batch(&[sym.clone()]).unwrap();
        let first = rx.recv().unwrap();
        assert_eq!(first.len(), 1);
        assert!(rx.try_recv().is_err());
    }
}
