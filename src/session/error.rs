//! Session error type.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::engine::{EngineError, EngineStatus};

/// Errors that end a session. None of them is retried.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The engine returned a status its buffer contract rules out.
    #[error("engine returned {status:?} from {op}")]
    Contract {
        op: &'static str,
        status: EngineStatus,
    },

    #[error("peer stopped accepting writes for {0:?}")]
    WriteStalled(Duration),

    #[error("tunnel connect to {addr} failed: {source}")]
    TunnelConnect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("handshake has not begun")]
    NotStarted,

    #[error("session is closed")]
    Closed,

    #[error("event handler panicked")]
    Panicked,
}

impl SessionError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Io(_) => "io",
            SessionError::Engine(_) => "engine",
            SessionError::Contract { .. } => "contract",
            SessionError::WriteStalled(_) => "write_stalled",
            SessionError::TunnelConnect { .. } => "tunnel_connect",
            SessionError::NotStarted => "not_started",
            SessionError::Closed => "closed",
            SessionError::Panicked => "panicked",
        }
    }
}
