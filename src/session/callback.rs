//! Application hooks.

use super::{SessionError, TlsSession};

/// Receives session events. Runs on the worker driving the session and must
/// not block; calling [`TlsSession::send`] or [`TlsSession::close`] from a
/// hook is allowed.
pub trait SessionCallback: Send + Sync {
    fn on_handshake_complete(&self, _session: &TlsSession) {}

    /// Decrypted application data, in wire order. Not called for sessions
    /// that relay to a tunnel.
    fn on_data(&self, session: &TlsSession, data: &[u8]);

    /// The session failed; it is being force-closed.
    fn on_exception(&self, _session: &TlsSession, _error: &SessionError) {}

    /// Teardown finished. Called exactly once.
    fn on_closed(&self, _session: &TlsSession) {}
}

/// Drops all application data.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardCallback;

impl SessionCallback for DiscardCallback {
    fn on_data(&self, session: &TlsSession, data: &[u8]) {
        tracing::trace!(session = %session.id(), bytes = data.len(), "Discarding application data");
    }
}

/// Sends every decrypted chunk back to the peer.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoCallback;

impl SessionCallback for EchoCallback {
    fn on_data(&self, session: &TlsSession, data: &[u8]) {
        if let Err(e) = session.send(data) {
            tracing::debug!(session = %session.id(), error = %e, "Echo dropped");
        }
    }
}
