//! Buffer subsystem.
//!
//! # Data Flow
//! ```text
//! Session begins handshake
//!     → pool.rs (acquire record + application buffers, sized by the engine)
//!     → buf.rs (flip → wrap/unwrap → compact on every I/O event)
//!
//! Session closes
//!     → pool.rs (buffers cleared and cached for the next session)
//! ```

pub mod buf;
pub mod pool;

pub use buf::{BufferKind, NetBuffer};
pub use pool::{BufferPool, PoolStats, CACHE_LIMIT};
