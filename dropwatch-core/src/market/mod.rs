//! Market data: polling, rolling anchors, and the drop-signal evaluator.

pub mod anchor;
pub mod service;
pub mod signal;
pub mod snapshot;

pub use anchor::{AnchorManager, AnchorResult};
pub use service::MarketDataService;
pub use signal::{DropSignal, DropSignalEvaluator};
pub use snapshot::{spread_bps, DepthSample, Snapshot, SNAPSHOT_SCHEMA_VERSION};
