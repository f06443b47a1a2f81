//! Configuration loading and validation.
//!
//! Runtime TOML file with environment-variable overrides (`DROPWATCH_`
//! prefix, double-underscore nesting), validated fail-fast at startup.
//! This is a real implementation of what the loader in this codebase's
//! config layer has historically left commented out pending the `config`
//! crate dependency — it is wired up here because every key in this
//! engine's configuration tree is a genuine runtime operational tunable.

pub mod types;

pub use types::*;

use anyhow::{Context, Result};
use config::{Config as ConfigLoader, Environment, File};
use rust_decimal::Decimal;
use std::path::Path;

impl EngineConfig {
    /// Load configuration from a TOML file with `DROPWATCH_` environment
    /// overrides layered on top (e.g. `DROPWATCH_TRADING__COOLDOWN_SECS=600`).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_path = path.as_ref();

        let loader = ConfigLoader::builder()
            .add_source(File::from(config_path))
            .add_source(Environment::with_prefix("DROPWATCH").separator("__"))
            .build()
            .with_context(|| format!("failed to build configuration from {:?}", config_path))?;

        let cfg: EngineConfig = loader
            .try_deserialize()
            .context("failed to deserialize engine configuration")?;

        cfg.validate()?;

        if cfg.atr.atr_period.is_some() || cfg.atr.atr_multiplier.is_some() {
            tracing::debug!("ATR exit configuration present but not implemented; ignoring");
        }

        Ok(cfg)
    }

    pub fn load_default() -> Result<Self> {
        Self::load("config/default.toml")
    }

    /// Cross-parameter checks that must hold before the engine starts.
    pub fn validate(&self) -> Result<()> {
        if self.protection.sl_pct <= Decimal::ZERO {
            anyhow::bail!("protection.sl_pct must be positive");
        }
        if self.protection.tp_pct <= Decimal::ZERO {
            anyhow::bail!("protection.tp_pct must be positive");
        }
        if self.protection.switch_to_sl_pnl_pct >= Decimal::ZERO {
            anyhow::bail!("protection.switch_to_sl_pnl_pct must be negative");
        }
        if self.protection.switch_to_tp_pnl_pct <= Decimal::ZERO {
            anyhow::bail!("protection.switch_to_tp_pnl_pct must be positive");
        }

        if self.market_data.md_cache_soft_ttl_ms >= self.market_data.md_cache_ttl_ms {
            anyhow::bail!(
                "market_data.md_cache_soft_ttl_ms ({}) must be < md_cache_ttl_ms ({})",
                self.market_data.md_cache_soft_ttl_ms,
                self.market_data.md_cache_ttl_ms
            );
        }

        if self.signal.drop_trigger_value <= Decimal::ZERO
            || self.signal.drop_trigger_value >= Decimal::ONE
        {
            anyhow::bail!(
                "signal.drop_trigger_value must satisfy 0 < value < 1.0, got {}",
                self.signal.drop_trigger_value
            );
        }

        if self.trading.max_concurrent_positions == 0 {
            anyhow::bail!("trading.max_concurrent_positions must be at least 1");
        }

        if self.trading.position_size_usdt <= Decimal::ZERO {
            anyhow::bail!("trading.position_size_usdt must be positive");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.metrics.log_level.as_str()) {
            anyhow::bail!(
                "invalid log level '{}', must be one of: {:?}",
                self.metrics.log_level,
                valid_log_levels
            );
        }

        Ok(())
    }
}
