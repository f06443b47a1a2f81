//! Core types shared across the engine: identity, phase graph, errors.

pub mod errors;
pub mod ghost;
pub mod ids;
pub mod phase;

pub use errors::{EngineError, EngineResult};
pub use ghost::{GhostPosition, GhostPositionLog};
pub use ids::{IntentId, OrderType, ReservationId, Side, Symbol, TimeInForce};
pub use phase::{now_ms, Phase, PhaseEvent, SymbolState};
