//! TLS session subsystem.
//!
//! # Data Flow
//! ```text
//! Reactor readiness (primary socket)
//!     → tls_session.rs (serialize on the session context)
//!     → handshake.rs (dispatch on handshake status: wrap / unwrap / task)
//!     → context.rs (channel I/O, engine calls, buffer flip/compact)
//!     → plaintext → SessionCallback::on_data, or tunnel.rs → remote socket
//!
//! Reactor readiness (tunnel socket)
//!     → tunnel.rs (remote plaintext)
//!     → tls_session.rs (queue, wrap, write to the primary socket)
//! ```
//!
//! # Design Decisions
//! - One handler per handshake status; the driver loops until it must wait
//! - Buffers come from a shared `BufferPool` at handshake start and go back
//!   exactly once at close
//! - Every error is fatal for its session only
//! - Tunnel queues are capped at `QUEUE_LIMIT`; a full queue pauses its
//!   producer until the consumer catches up
//! - A graceful close delivers what the tunnel still holds before the
//!   remote socket is shut

pub mod callback;
pub mod channel;
pub mod context;
pub mod error;
pub mod handshake;
pub mod tls_session;
pub mod tunnel;

pub use callback::{DiscardCallback, EchoCallback, SessionCallback};
pub use channel::{Channel, TcpChannel};
pub use context::{SessionContext, SessionFlags, SessionSettings};
pub use error::SessionError;
pub use handshake::{drive, Drive, SessionEvents};
pub use tls_session::{SessionBuilder, TlsSession};
pub use tunnel::{TunnelRelay, QUEUE_LIMIT, TUNNEL_BUFFER_SIZE};
