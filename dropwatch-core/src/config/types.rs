//! Typed configuration tree for the engine.
//!
//! Every field here is a runtime-operational tunable (position sizing,
//! thresholds, timeouts) rather than a hot-path compile-time constant, so
//! unlike earlier single-purpose engines in this codebase there is no
//! parallel Cargo-feature-flag system: this struct is the whole story,
//! loaded from TOML with environment overrides in `config::EngineConfig::load`.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub trading: TradingConfig,
    pub signal: SignalConfig,
    pub protection: ProtectionConfig,
    pub execution: ExecutionConfig,
    pub guard: GuardConfig,
    pub market_data: MarketDataConfig,
    pub router: RouterConfig,
    pub metrics: MetricsConfig,

    /// Accepted-but-ignored ATR exit keys (Open Question #4: not
    /// implemented). Kept so config files mentioning them still validate.
    #[serde(default)]
    pub atr: AtrConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: usize,
    pub position_size_usdt: Decimal,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_entry_block_cooldown_s")]
    pub entry_block_cooldown_s: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropTriggerMode {
    SessionPeak = 1,
    RollingPeak = 2,
    Hybrid = 3,
    Persistent = 4,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    #[serde(default = "default_drop_trigger_mode")]
    pub drop_trigger_mode: DropTriggerMode,
    pub drop_trigger_value: Decimal,
    #[serde(default = "default_anchor_stale_minutes")]
    pub anchor_stale_minutes: u64,
    #[serde(default = "default_window_lookback_s")]
    pub window_lookback_s: u64,
    /// Max percent the persistent anchor is allowed to sit above current
    /// price before it is clamped back down.
    #[serde(default = "default_anchor_clamp_pct")]
    pub anchor_clamp_pct: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionConfig {
    pub tp_pct: Decimal,
    pub sl_pct: Decimal,
    pub trail_pct: Decimal,
    pub trail_activation_pct: Decimal,
    #[serde(default = "default_max_hold_time_s")]
    pub max_hold_time_s: u64,
    #[serde(default = "default_switch_cooldown_s")]
    pub switch_cooldown_s: u64,
    /// PnL% threshold below which the Dynamic Protection Manager switches
    /// from TP to SL.
    #[serde(default = "default_switch_sl_pnl_pct")]
    pub switch_to_sl_pnl_pct: Decimal,
    /// PnL% threshold above which it switches back from SL to TP.
    #[serde(default = "default_switch_tp_pnl_pct")]
    pub switch_to_tp_pnl_pct: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub buy_escalation_steps: Vec<EscalationStep>,
    #[serde(default = "default_exit_ladder_bps")]
    pub exit_ladder_bps: Vec<u32>,
    #[serde(default = "default_max_slippage_bps_entry")]
    pub max_slippage_bps_entry: u32,
    #[serde(default = "default_max_slippage_bps_exit")]
    pub max_slippage_bps_exit: u32,
    #[serde(default)]
    pub never_market_sells: bool,
    #[serde(default = "default_ioc_order_ttl_ms")]
    pub ioc_order_ttl_ms: u64,
    #[serde(default = "default_wait_fill_timeout_s")]
    pub wait_fill_timeout_s: u64,
    #[serde(default = "default_partial_max_age_s")]
    pub partial_max_age_s: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationStep {
    pub premium_bps: i32,
    pub ttl_ms: u64,
    pub tif: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LowLiquidityAction {
    Skip,
    Market,
    Wait,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default = "default_max_spread_bps")]
    pub max_spread_bps: u32,
    pub depth_min_notional_usd: Decimal,
    #[serde(default = "default_exit_min_liquidity_spread_pct")]
    pub exit_min_liquidity_spread_pct: Decimal,
    #[serde(default = "default_exit_low_liquidity_action")]
    pub exit_low_liquidity_action: LowLiquidityAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataConfig {
    #[serde(default = "default_md_poll_ms")]
    pub md_poll_ms: u64,
    #[serde(default = "default_md_batch_size")]
    pub md_batch_size: usize,
    #[serde(default = "default_true")]
    pub md_auto_restart_on_crash: bool,
    #[serde(default = "default_md_max_auto_restarts")]
    pub md_max_auto_restarts: u32,
    #[serde(default = "default_snapshot_min_period_ms")]
    pub snapshot_min_period_ms: u64,
    #[serde(default = "default_snapshot_stale_ttl_s")]
    pub snapshot_stale_ttl_s: u64,
    /// Soft TTL for the filter/ticker cache — must stay below the hard TTL.
    #[serde(default = "default_md_cache_soft_ttl_ms")]
    pub md_cache_soft_ttl_ms: u64,
    #[serde(default = "default_md_cache_ttl_ms")]
    pub md_cache_ttl_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_router_max_retries")]
    pub router_max_retries: u32,
    #[serde(default = "default_router_backoff_ms")]
    pub router_backoff_ms: u64,
    #[serde(default = "default_state_persist_interval_s")]
    pub state_persist_interval_s: u64,
    #[serde(default = "default_intent_stale_threshold_s")]
    pub intent_stale_threshold_s: u64,
    #[serde(default = "default_router_cleanup_interval_s")]
    pub router_cleanup_interval_s: u64,
    #[serde(default = "default_router_completed_order_ttl_s")]
    pub router_completed_order_ttl_s: u64,
    #[serde(default = "default_max_pending_buy_intents")]
    pub max_pending_buy_intents: usize,
    #[serde(default = "default_router_submit_timeout_s")]
    pub router_submit_timeout_s: u64,
    #[serde(default = "default_reconciler_interval_s")]
    pub reconciler_interval_s: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
    #[serde(default = "default_true")]
    pub enable_prometheus: bool,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AtrConfig {
    #[serde(default)]
    pub atr_period: Option<u32>,
    #[serde(default)]
    pub atr_multiplier: Option<Decimal>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            enable_prometheus: true,
            metrics_addr: default_metrics_addr(),
        }
    }
}

fn default_max_concurrent_positions() -> usize {
    5
}
fn default_cooldown_secs() -> u64 {
    300
}
fn default_entry_block_cooldown_s() -> u64 {
    120
}
fn default_drop_trigger_mode() -> DropTriggerMode {
    DropTriggerMode::Hybrid
}
fn default_anchor_stale_minutes() -> u64 {
    60
}
fn default_window_lookback_s() -> u64 {
    300
}
fn default_anchor_clamp_pct() -> Decimal {
    Decimal::new(5, 2) // 0.05
}
fn default_max_hold_time_s() -> u64 {
    4 * 3600
}
fn default_switch_cooldown_s() -> u64 {
    20
}
fn default_switch_sl_pnl_pct() -> Decimal {
    Decimal::new(-5, 1) // -0.5
}
fn default_switch_tp_pnl_pct() -> Decimal {
    Decimal::new(2, 1) // 0.2
}
fn default_exit_ladder_bps() -> Vec<u32> {
    vec![0, 5, 10, 15]
}
fn default_max_slippage_bps_entry() -> u32 {
    30
}
fn default_max_slippage_bps_exit() -> u32 {
    50
}
fn default_ioc_order_ttl_ms() -> u64 {
    2000
}
fn default_wait_fill_timeout_s() -> u64 {
    30
}
fn default_partial_max_age_s() -> u64 {
    10
}
fn default_max_spread_bps() -> u32 {
    20
}
fn default_exit_min_liquidity_spread_pct() -> Decimal {
    Decimal::TEN
}
fn default_exit_low_liquidity_action() -> LowLiquidityAction {
    LowLiquidityAction::Wait
}
fn default_md_poll_ms() -> u64 {
    750
}
fn default_md_batch_size() -> usize {
    13
}
fn default_true() -> bool {
    true
}
fn default_md_max_auto_restarts() -> u32 {
    5
}
fn default_snapshot_min_period_ms() -> u64 {
    500
}
fn default_snapshot_stale_ttl_s() -> u64 {
    30
}
fn default_md_cache_soft_ttl_ms() -> u64 {
    5_000
}
fn default_md_cache_ttl_ms() -> u64 {
    60_000
}
fn default_router_max_retries() -> u32 {
    3
}
fn default_router_backoff_ms() -> u64 {
    400
}
fn default_state_persist_interval_s() -> u64 {
    10
}
fn default_intent_stale_threshold_s() -> u64 {
    60
}
fn default_router_cleanup_interval_s() -> u64 {
    3600
}
fn default_router_completed_order_ttl_s() -> u64 {
    7200
}
fn default_max_pending_buy_intents() -> usize {
    100
}
fn default_router_submit_timeout_s() -> u64 {
    10
}
fn default_reconciler_interval_s() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_metrics_addr() -> String {
    "127.0.0.1:9090".to_string()
}
