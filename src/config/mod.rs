//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → TunnelConfig (validated, immutable)
//!     → sections handed to listener, reactor, pool and sessions
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    BufferConfig, ListenerConfig, ObservabilityConfig, ReactorConfig, RelayConfig, SessionConfig,
    TlsConfig, TunnelConfig,
};
pub use validation::{validate_config, ValidationError};
