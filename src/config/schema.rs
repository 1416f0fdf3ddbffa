//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the tunnel.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::buffer::CACHE_LIMIT;

/// Root configuration for the TLS tunnel.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TunnelConfig {
    /// Listener configuration (bind address, session limit).
    pub listener: ListenerConfig,

    /// Certificates and keys.
    pub tls: TlsConfig,

    /// Plaintext relay target.
    pub tunnel: RelayConfig,

    /// Reactor and worker pool sizing.
    pub reactor: ReactorConfig,

    /// Buffer pool settings.
    pub buffers: BufferConfig,

    /// Per-session timing.
    pub session: SessionConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8443").
    pub bind_address: String,

    /// Maximum concurrent sessions. Connections beyond it are dropped.
    pub max_sessions: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8443".to_string(),
            max_sessions: 10_000,
        }
    }
}

/// TLS material.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to the server certificate chain (PEM).
    pub cert_path: String,

    /// Path to the server private key (PEM).
    pub key_path: String,

    /// Optional CA bundle (PEM) trusted by outbound client sessions.
    pub ca_path: Option<String>,

    /// Name outbound client sessions expect in the server certificate.
    pub server_name: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: "certs/server.crt".to_string(),
            key_path: "certs/server.key".to_string(),
            ca_path: None,
            server_name: "localhost".to_string(),
        }
    }
}

/// Plaintext relay configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RelayConfig {
    /// Where decrypted traffic is relayed (e.g., "127.0.0.1:8080").
    /// Without it, sessions echo decrypted data back to the client.
    pub remote_address: Option<String>,
}

/// Reactor configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// Worker threads that run session handlers.
    pub worker_threads: usize,

    /// Readiness events fetched per poll.
    pub events_capacity: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            events_capacity: 1024,
        }
    }
}

/// Buffer pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Cached entries kept per buffer size.
    pub cache_limit: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            cache_limit: CACHE_LIMIT,
        }
    }
}

/// Session timing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a graceful close keeps flushing `close_notify`, and waits
    /// for a tunnel remote to finish, in milliseconds.
    pub close_linger_ms: u64,

    /// How long a blocked write may stall before the session fails, in milliseconds.
    pub write_stall_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            close_linger_ms: 500,
            write_stall_timeout_ms: 5_000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format ("json" or "pretty").
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
