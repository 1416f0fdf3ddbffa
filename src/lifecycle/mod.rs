//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → shutdown_signal() resolves
//!
//! Shutdown (shutdown.rs):
//!     Stop accepting → close_notify every session → drain → stop reactor
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, drain, stop the reactor last
//! - Shutdown has a deadline; sessions still open after it are dropped
//!   with the reactor

pub mod shutdown;
pub mod signals;

pub use shutdown::graceful_shutdown;
pub use signals::shutdown_signal;
