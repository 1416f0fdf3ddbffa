//! TLS tunnel.
//!
//! Terminates TLS on a non-blocking reactor and relays decrypted traffic to
//! a plaintext remote, or echoes it back when no remote is configured.
//!
//! ```text
//!     TLS client ──▶ listener ──▶ session (handshake, unwrap) ──▶ tunnel ──▶ remote
//!     TLS client ◀── session (wrap) ◀──────────────────────────── tunnel ◀── remote
//! ```

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use tls_tunnel::buffer::BufferPool;
use tls_tunnel::config::{load_config, validate_config, ConfigError, TunnelConfig};
use tls_tunnel::engine::rustls::RustlsEngineFactory;
use tls_tunnel::lifecycle::{graceful_shutdown, shutdown_signal};
use tls_tunnel::net::{load_client_config, load_server_config, SessionTracker, TlsListener};
use tls_tunnel::observability::{init_logging, metrics::init_metrics, PrometheusSink};
use tls_tunnel::reactor::Reactor;
use tls_tunnel::session::{EchoCallback, SessionBuilder, SessionSettings};

/// How long shutdown waits for sessions to finish their close_notify exchange.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "tls-tunnel", version, about = "Non-blocking TLS terminating tunnel")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides `listener.bind_address`.
    #[arg(long)]
    bind: Option<String>,

    /// Plaintext remote to relay to, overrides `tunnel.remote_address`.
    #[arg(long)]
    remote: Option<String>,

    /// Log level, overrides `observability.log_level`.
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => TunnelConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }
    if let Some(remote) = cli.remote {
        config.tunnel.remote_address = Some(remote);
    }
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }
    validate_config(&config).map_err(ConfigError::Validation)?;

    init_logging(&config.observability)?;
    tracing::info!("tls-tunnel v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_sessions = config.listener.max_sessions,
        remote = ?config.tunnel.remote_address,
        worker_threads = config.reactor.worker_threads,
        "Configuration loaded"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.reactor.worker_threads)
        .thread_name("tls-worker")
        .enable_all()
        .build()?;

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                let _guard = runtime.enter();
                if let Err(e) = init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics endpoint");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let mut factory = RustlsEngineFactory::new().with_server(load_server_config(
        config.tls.cert_path.as_ref(),
        config.tls.key_path.as_ref(),
    )?);
    if let Some(ca_path) = &config.tls.ca_path {
        factory = factory.with_client(load_client_config(ca_path.as_ref())?, &config.tls.server_name)?;
    }

    let (reactor, reactor_thread) = Reactor::start(&config.reactor, runtime.handle().clone())?;
    let pool = Arc::new(BufferPool::with_limit(config.buffers.cache_limit));
    let tracker = SessionTracker::new();

    let mut builder = SessionBuilder::new(reactor.clone(), pool, Arc::new(factory))
        .metrics(Arc::new(PrometheusSink))
        .settings(SessionSettings::from(&config.session))
        .tracker(tracker.clone());
    match &config.tunnel.remote_address {
        Some(remote) => builder = builder.tunnel_to(remote.parse()?),
        None => builder = builder.callback(Arc::new(EchoCallback)),
    }

    let listener = TlsListener::bind(&config.listener, &reactor, builder)?;
    tracing::info!(address = %listener.local_addr(), "Listening for connections");

    runtime.block_on(async {
        shutdown_signal().await;
        graceful_shutdown(&listener, &tracker, &reactor, SHUTDOWN_DEADLINE).await;
    });
    reactor_thread.join();

    tracing::info!("Shutdown complete");
    Ok(())
}
