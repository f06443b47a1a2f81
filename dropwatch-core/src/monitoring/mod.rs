//! Monitoring and observability: Prometheus metrics and the HTTP server
//! that exposes them for scraping.

pub mod metrics;
pub mod server;

pub use metrics::{MetricsRegistry, OrderMetrics, PhaseMetrics, PositionMetrics, ReconcileMetrics};
pub use server::{MetricsServer, MetricsServerConfig};
