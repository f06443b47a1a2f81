//! Identity types threaded through the engine: symbols, intents, reservations.
//!
//! None of these carry exchange behavior; they are plain newtypes so the
//! compiler catches a `Symbol` passed where an `IntentId` is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// A tradable symbol, e.g. "BTC-USDT".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Stable, deterministic identifier for an order intent.
///
/// Derived from symbol + side + quantity + limit + a timestamp bucket, so
/// that resubmitting the same logical intent within the same bucket hashes
/// to the same id (idempotence requires reproducibility, not uniqueness,
/// which is why this is a deterministic hash rather than a random uuid).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IntentId(pub u128);

impl IntentId {
    pub fn derive(
        symbol: &Symbol,
        side: Side,
        quantity: rust_decimal::Decimal,
        limit_price: rust_decimal::Decimal,
        timestamp_bucket: u64,
    ) -> Self {
        use std::collections::hash_map::DefaultHasher;
        let mut hasher = DefaultHasher::new();
        symbol.hash(&mut hasher);
        side.hash(&mut hasher);
        quantity.hash(&mut hasher);
        limit_price.hash(&mut hasher);
        timestamp_bucket.hash(&mut hasher);
        let lo = hasher.finish();

        let mut hasher2 = DefaultHasher::new();
        timestamp_bucket.hash(&mut hasher2);
        symbol.hash(&mut hasher2);
        let hi = hasher2.finish();

        Self(((hi as u128) << 64) | lo as u128)
    }

    /// Generated id for an order the router never submitted but the
    /// reconciler is adopting — derived from the exchange's own order id
    /// so re-running reconciliation against the same orphan is idempotent.
    pub fn for_orphan(exchange_order_id: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        let mut hasher = DefaultHasher::new();
        "orphan".hash(&mut hasher);
        exchange_order_id.hash(&mut hasher);
        let lo = hasher.finish();
        let mut hasher2 = DefaultHasher::new();
        exchange_order_id.hash(&mut hasher2);
        "orphan2".hash(&mut hasher2);
        let hi = hasher2.finish();
        Self(((hi as u128) << 64) | lo as u128)
    }
}

impl fmt::Display for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Identifier for a Portfolio budget reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReservationId(pub u128);

impl ReservationId {
    pub fn from_intent(intent_id: IntentId) -> Self {
        Self(intent_id.0)
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Order type as understood by the exchange boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    LimitIoc,
    Market,
}

/// Time in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeInForce {
    GoodTilCanceled,
    ImmediateOrCancel,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn intent_id_is_deterministic() {
        let sym = Symbol::new("BTC-USDT");
        let a = IntentId::derive(&sym, Side::Buy, dec!(0.01), dec!(50000), 1000);
        let b = IntentId::derive(&sym, Side::Buy, dec!(0.01), dec!(50000), 1000);
        assert_eq!(a, b);
    }

    #[test]
    fn intent_id_changes_with_bucket() {
        let sym = Symbol::new("BTC-USDT");
        let a = IntentId::derive(&sym, Side::Buy, dec!(0.01), dec!(50000), 1000);
        let b = IntentId::derive(&sym, Side::Buy, dec!(0.01), dec!(50000), 1001);
        assert_ne!(a, b);
    }
}
