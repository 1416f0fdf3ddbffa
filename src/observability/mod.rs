//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Sessions, listener, reactor produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges, histograms via MetricsSink)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Session id flows through every session log event
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;

pub use self::logging::init_logging;
pub use self::metrics::{AtomicMetrics, MetricsSink, MetricsSnapshot, NoopMetrics, PrometheusSink};
