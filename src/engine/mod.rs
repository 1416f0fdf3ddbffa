//! Crypto engine boundary.
//!
//! # Data Flow
//! ```text
//! session state machine
//!     → CryptoEngine::wrap   (plaintext → TLS records in an outbound buffer)
//!     → CryptoEngine::unwrap (TLS records from an inbound buffer → plaintext)
//!     → CryptoEngine::handshake_status (what the driver must do next)
//! ```
//!
//! # Design Decisions
//! - The engine never touches sockets; it only transforms buffers
//! - Buffers follow the `NetBuffer` convention: `src` in read mode, `dst` in
//!   write mode; both cursors are advanced by the engine
//! - One engine per session, created by an `EngineFactory` for a `Role`

pub mod rustls;
#[cfg(test)]
pub(crate) mod scripted;

use std::fmt;

use crate::buffer::NetBuffer;

pub use self::rustls::{RustlsEngine, RustlsEngineFactory};

/// Which side of the handshake an engine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the driver has to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Produce outbound records (`wrap`) and write them.
    NeedWrap,
    /// Read inbound records and `unwrap` them.
    NeedUnwrap,
    /// Run delegated tasks before any further wrap/unwrap.
    NeedTask,
    /// The operation that returned this just completed the handshake.
    Finished,
    /// Handshake done; application data flows.
    NotHandshaking,
}

/// Outcome of a single wrap/unwrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Ok,
    /// `dst` is too small for the output.
    BufferOverflow,
    /// `src` does not hold enough bytes to make progress.
    BufferUnderflow,
    /// This side of the engine is closed.
    Closed,
}

/// Result of a wrap/unwrap call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineResult {
    pub status: EngineStatus,
    pub handshake_status: HandshakeStatus,
    pub bytes_consumed: usize,
    pub bytes_produced: usize,
}

/// A unit of potentially CPU-heavy handshake work.
pub type DelegatedTask = Box<dyn FnOnce() + Send>;

/// Errors raised by an engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The TLS library rejected the peer's input.
    #[error("TLS error: {0}")]
    Tls(#[from] ::rustls::Error),

    /// The engine could not be constructed.
    #[error("engine setup failed: {0}")]
    Setup(String),

    /// Engine-internal I/O (moving bytes between buffers and the TLS state).
    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A handshake-status-driven TLS engine.
pub trait CryptoEngine: Send {
    fn role(&self) -> Role;

    /// Start the handshake. Called once, before the first wrap/unwrap.
    fn begin_handshake(&mut self) -> Result<(), EngineError>;

    /// Encrypt bytes from `src` into `dst`. Handshake wraps pass an empty `src`.
    fn wrap(&mut self, src: &mut NetBuffer, dst: &mut NetBuffer)
        -> Result<EngineResult, EngineError>;

    /// Process records from `src`, writing any plaintext into `dst`.
    fn unwrap(&mut self, src: &mut NetBuffer, dst: &mut NetBuffer)
        -> Result<EngineResult, EngineError>;

    fn handshake_status(&self) -> HandshakeStatus;

    /// Next pending delegated task, if any.
    fn delegated_task(&mut self) -> Option<DelegatedTask>;

    /// Queue `close_notify`; later wraps flush it.
    fn close_outbound(&mut self);

    fn is_outbound_done(&self) -> bool;

    /// Whether input the engine has already accepted is still waiting to be
    /// surfaced through `unwrap`.
    fn has_pending_input(&self) -> bool {
        false
    }

    /// Size for buffers that hold TLS records.
    fn packet_buffer_size(&self) -> usize;

    /// Size for buffers that hold decrypted application data.
    fn application_buffer_size(&self) -> usize;
}

/// Creates one engine per session.
pub trait EngineFactory: Send + Sync {
    fn new_engine(&self, role: Role) -> Result<Box<dyn CryptoEngine>, EngineError>;
}
