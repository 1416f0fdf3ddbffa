//! Graceful shutdown.

use std::time::Duration;

use crate::net::{SessionTracker, TlsListener};
use crate::reactor::Reactor;

/// Stop `listener`, close every tracked session and wait up to `deadline`
/// for them to finish, then stop `reactor`. Returns whether every session
/// closed in time.
pub async fn graceful_shutdown(
    listener: &TlsListener,
    tracker: &SessionTracker,
    reactor: &Reactor,
    deadline: Duration,
) -> bool {
    listener.close();

    let closing = tracker.close_all();
    tracing::info!(sessions = closing, "Closing sessions");

    let drained = tracker.wait_idle(deadline).await;
    if drained {
        tracing::info!("All sessions closed");
    } else {
        tracing::warn!(
            remaining = tracker.active_count(),
            deadline_ms = deadline.as_millis() as u64,
            "Shutdown deadline passed with sessions still open"
        );
    }

    reactor.shutdown();
    drained
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::buffer::BufferPool;
    use crate::config::{ListenerConfig, ReactorConfig};
    use crate::engine::rustls::tests::factory_pair;
    use crate::session::SessionBuilder;

    #[test]
    fn shutdown_without_sessions_stops_everything() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let (reactor, thread) = Reactor::start(&ReactorConfig::default(), rt.handle().clone()).unwrap();
        let (server, _client) = factory_pair();
        let builder = SessionBuilder::new(reactor.clone(), Arc::new(BufferPool::new()), Arc::new(server));
        let config = ListenerConfig {
            bind_address: "127.0.0.1:0".to_string(),
            max_sessions: 4,
        };
        let listener = TlsListener::bind(&config, &reactor, builder).unwrap();
        let tracker = listener.tracker().clone();

        let drained = rt.block_on(graceful_shutdown(
            &listener,
            &tracker,
            &reactor,
            Duration::from_millis(100),
        ));
        assert!(drained);
        assert!(listener.is_closed());
        assert!(reactor.is_shutdown());
        thread.join();
    }
}
