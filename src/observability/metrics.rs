//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define session metrics (opens, closes, handshakes, bytes, failures)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `tls_sessions_opened_total` (counter): sessions created, by role
//! - `tls_sessions_active` (gauge): sessions not yet torn down
//! - `tls_handshakes_total` (counter): completed handshakes, by role
//! - `tls_handshake_duration_seconds` (histogram): handshake latency, by role
//! - `tls_bytes_unwrapped_total` / `tls_bytes_wrapped_total` (counter): plaintext volume
//! - `tls_session_failures_total` (counter): fatal session errors, by kind
//!
//! # Design Decisions
//! - Sessions report through the `MetricsSink` trait, so tests can count
//!   in-process and the default costs nothing
//! - Low-overhead metric updates (atomic operations)

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::engine::Role;

/// Receives session metrics.
pub trait MetricsSink: Send + Sync {
    fn session_opened(&self, role: Role);
    fn session_closed(&self);
    fn handshake_completed(&self, role: Role, elapsed: Duration);
    fn bytes_unwrapped(&self, bytes: usize);
    fn bytes_wrapped(&self, bytes: usize);
    fn session_failed(&self, kind: &'static str);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn session_opened(&self, _role: Role) {}
    fn session_closed(&self) {}
    fn handshake_completed(&self, _role: Role, _elapsed: Duration) {}
    fn bytes_unwrapped(&self, _bytes: usize) {}
    fn bytes_wrapped(&self, _bytes: usize) {}
    fn session_failed(&self, _kind: &'static str) {}
}

/// Reports through the `metrics` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusSink;

impl MetricsSink for PrometheusSink {
    fn session_opened(&self, role: Role) {
        metrics::counter!("tls_sessions_opened_total", "role" => role.as_str()).increment(1);
        metrics::gauge!("tls_sessions_active").increment(1.0);
    }

    fn session_closed(&self) {
        metrics::gauge!("tls_sessions_active").decrement(1.0);
    }

    fn handshake_completed(&self, role: Role, elapsed: Duration) {
        metrics::counter!("tls_handshakes_total", "role" => role.as_str()).increment(1);
        metrics::histogram!("tls_handshake_duration_seconds", "role" => role.as_str())
            .record(elapsed.as_secs_f64());
    }

    fn bytes_unwrapped(&self, bytes: usize) {
        metrics::counter!("tls_bytes_unwrapped_total").increment(bytes as u64);
    }

    fn bytes_wrapped(&self, bytes: usize) {
        metrics::counter!("tls_bytes_wrapped_total").increment(bytes as u64);
    }

    fn session_failed(&self, kind: &'static str) {
        metrics::counter!("tls_session_failures_total", "kind" => kind).increment(1);
    }
}

/// Install the Prometheus recorder and its scrape endpoint on `addr`.
///
/// Must run inside a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

/// Point-in-time copy of [`AtomicMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub handshakes: u64,
    pub bytes_unwrapped: u64,
    pub bytes_wrapped: u64,
    pub failures: u64,
}

impl MetricsSnapshot {
    pub fn active_sessions(&self) -> u64 {
        self.sessions_opened.saturating_sub(self.sessions_closed)
    }
}

/// In-process counters.
#[derive(Debug, Default)]
pub struct AtomicMetrics {
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    handshakes: AtomicU64,
    bytes_unwrapped: AtomicU64,
    bytes_wrapped: AtomicU64,
    failures: AtomicU64,
}

impl AtomicMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_opened: self.sessions_opened.load(Ordering::SeqCst),
            sessions_closed: self.sessions_closed.load(Ordering::SeqCst),
            handshakes: self.handshakes.load(Ordering::SeqCst),
            bytes_unwrapped: self.bytes_unwrapped.load(Ordering::SeqCst),
            bytes_wrapped: self.bytes_wrapped.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
        }
    }
}

impl MetricsSink for AtomicMetrics {
    fn session_opened(&self, _role: Role) {
        self.sessions_opened.fetch_add(1, Ordering::SeqCst);
    }

    fn session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::SeqCst);
    }

    fn handshake_completed(&self, _role: Role, _elapsed: Duration) {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
    }

    fn bytes_unwrapped(&self, bytes: usize) {
        self.bytes_unwrapped.fetch_add(bytes as u64, Ordering::SeqCst);
    }

    fn bytes_wrapped(&self, bytes: usize) {
        self.bytes_wrapped.fetch_add(bytes as u64, Ordering::SeqCst);
    }

    fn session_failed(&self, _kind: &'static str) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_metrics_snapshot() {
        let metrics = AtomicMetrics::new();
        metrics.session_opened(Role::Server);
        metrics.session_opened(Role::Client);
        metrics.handshake_completed(Role::Server, Duration::from_millis(3));
        metrics.bytes_unwrapped(10);
        metrics.bytes_wrapped(4);
        metrics.session_closed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sessions_opened, 2);
        assert_eq!(snapshot.active_sessions(), 1);
        assert_eq!(snapshot.handshakes, 1);
        assert_eq!(snapshot.bytes_unwrapped, 10);
        assert_eq!(snapshot.bytes_wrapped, 4);
        assert_eq!(snapshot.failures, 0);
    }

    #[test]
    fn prometheus_sink_without_recorder_is_harmless() {
        let sink = PrometheusSink;
        sink.session_opened(Role::Server);
        sink.session_failed("io");
        sink.session_closed();
    }
}
