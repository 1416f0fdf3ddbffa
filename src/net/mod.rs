//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop on the reactor, session limit)
//!     → session::SessionBuilder (server session, handshake)
//!     → connection.rs (id, lifecycle tracking)
//!
//! Certificates:
//!     PEM files → tls.rs → rustls ServerConfig / ClientConfig
//! ```
//!
//! # Design Decisions
//! - Accepting never blocks the poll thread: the loop stops at `WouldBlock`
//! - Each session tracked for graceful shutdown
//! - Connections over the limit are closed immediately rather than queued

pub mod connection;
pub mod listener;
pub mod tls;

pub use connection::{SessionGuard, SessionId, SessionTracker};
pub use listener::{ListenerError, TlsListener};
pub use tls::{load_client_config, load_server_config};
