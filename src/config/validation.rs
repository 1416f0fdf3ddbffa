//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate addresses parse and counts are positive
//! - Check TLS material is configured
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: TunnelConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::TunnelConfig;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: &[&str] = &["json", "pretty"];

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field}: invalid socket address {value:?}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field}: unknown value {value:?}")]
    Unknown { field: &'static str, value: String },
}

/// Check a configuration, collecting every problem.
pub fn validate_config(config: &TunnelConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_address(&mut errors, "listener.bind_address", &config.listener.bind_address);
    check_positive(&mut errors, "listener.max_sessions", config.listener.max_sessions);

    check_present(&mut errors, "tls.cert_path", &config.tls.cert_path);
    check_present(&mut errors, "tls.key_path", &config.tls.key_path);

    if let Some(remote) = &config.tunnel.remote_address {
        check_address(&mut errors, "tunnel.remote_address", remote);
    }

    check_positive(&mut errors, "reactor.worker_threads", config.reactor.worker_threads);
    check_positive(&mut errors, "reactor.events_capacity", config.reactor.events_capacity);
    check_positive(&mut errors, "buffers.cache_limit", config.buffers.cache_limit);
    check_positive(
        &mut errors,
        "session.write_stall_timeout_ms",
        config.session.write_stall_timeout_ms as usize,
    );

    let obs = &config.observability;
    check_one_of(&mut errors, "observability.log_level", &obs.log_level, LOG_LEVELS);
    check_one_of(&mut errors, "observability.log_format", &obs.log_format, LOG_FORMATS);
    if obs.metrics_enabled {
        check_address(&mut errors, "observability.metrics_address", &obs.metrics_address);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_address(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
        });
    }
}

fn check_positive(errors: &mut Vec<ValidationError>, field: &'static str, value: usize) {
    if value == 0 {
        errors.push(ValidationError::Zero { field });
    }
}

fn check_present(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.trim().is_empty() {
        errors.push(ValidationError::Empty { field });
    }
}

fn check_one_of(errors: &mut Vec<ValidationError>, field: &'static str, value: &str, allowed: &[&str]) {
    if !allowed.contains(&value) {
        errors.push(ValidationError::Unknown {
            field,
            value: value.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(validate_config(&TunnelConfig::default()), Ok(()));
    }

    #[test]
    fn reports_every_problem() {
        let mut config = TunnelConfig::default();
        config.listener.bind_address = "not-an-address".into();
        config.reactor.worker_threads = 0;
        config.tls.key_path = String::new();
        config.observability.log_format = "xml".into();

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.contains(&ValidationError::Zero {
            field: "reactor.worker_threads"
        }));
        assert!(errors.contains(&ValidationError::Empty {
            field: "tls.key_path"
        }));
    }

    #[test]
    fn remote_address_checked_only_when_set() {
        let mut config = TunnelConfig::default();
        config.tunnel.remote_address = Some("localhost".into());
        let errors = validate_config(&config).unwrap_err();
        assert!(matches!(
            errors.as_slice(),
            [ValidationError::InvalidAddress {
                field: "tunnel.remote_address",
                ..
            }]
        ));
    }
}
