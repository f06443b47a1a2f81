//! Error taxonomy for the engine.
//!
//! Each variant is handled explicitly at its phase handler; only
//! `Unhandled` escapes to the generic ERROR phase with backoff. This
//! mirrors the "result types with explicit variants" requirement: no
//! control-flow-by-exception, no stringly-typed failures.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Precision, min-notional, or min-qty violation survives quantization.
    /// Aborts the intent cleanly; a ghost-position record is created for
    /// audit transparency but no funds or PnL are touched.
    #[error("compliance violation: {0}")]
    ComplianceError(String),

    /// A Market Guard (spread, depth, volume, affordability) blocked entry.
    #[error("guard blocked: {0}")]
    GuardBlock(String),

    /// Portfolio reservation failed.
    #[error("budget reservation failed: {0}")]
    BudgetError(String),

    /// Exchange rejected the order outright (bad precision, insufficient
    /// funds, etc). Not retried — user-error rejections are surfaced.
    #[error("exchange rejected order: code={code} reason={reason}")]
    ExchangeRejection { code: String, reason: String },

    /// Network/timeout error talking to the exchange. Retried with backoff
    /// under the same client order id.
    #[error("transient exchange error: {0}")]
    ExchangeTransient(String),

    /// Snapshot older than SNAPSHOT_STALE_TTL_S; signal evaluation skipped.
    #[error("stale market data for {0}")]
    StaleData(String),

    /// Exit-side spread too wide per EXIT_MIN_LIQUIDITY_SPREAD_PCT.
    #[error("liquidity block on exit: {0}")]
    LiquidityBlock(String),

    /// Anything else. Routes the symbol to Phase::Error with exponential
    /// backoff; the `#[from]` makes `?` work against `anyhow::Result`
    /// call sites without a manual conversion at every boundary.
    #[error(transparent)]
    Unhandled(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether this error is recovered locally (never terminates the
    /// engine) as opposed to routing the symbol to the ERROR phase.
    pub fn is_recoverable_locally(&self) -> bool {
        !matches!(self, EngineError::Unhandled(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_variants_are_locally_recoverable() {
        assert!(EngineError::GuardBlock("spread".into()).is_recoverable_locally());
        assert!(EngineError::StaleData("BTC-USDT".into()).is_recoverable_locally());
    }

    #[test]
    fn unhandled_is_not_locally_recoverable() {
        let err: EngineError = anyhow::anyhow!("boom").into();
        assert!(!err.is_recoverable_locally());
    }

    #[test]
    fn display_carries_structured_fields() {
        let err = EngineError::ExchangeRejection {
            code: "INSUFFICIENT_FUNDS".into(),
            reason: "not enough quote balance".into(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("INSUFFICIENT_FUNDS"));
    }
}
