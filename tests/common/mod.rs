//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, StreamOwned};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::runtime::Runtime;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::oneshot;

use tls_tunnel::buffer::BufferPool;
use tls_tunnel::config::{ListenerConfig, ReactorConfig};
use tls_tunnel::engine::rustls::RustlsEngineFactory;
use tls_tunnel::net::{SessionTracker, TlsListener};
use tls_tunnel::observability::AtomicMetrics;
use tls_tunnel::reactor::{Reactor, ReactorThread};
use tls_tunnel::session::SessionBuilder;

pub type TlsClient = StreamOwned<ClientConnection, TcpStream>;

/// Self-signed certificate for `localhost` with matching server and client configs.
pub struct Certs {
    pub server: Arc<ServerConfig>,
    pub client: Arc<ClientConfig>,
}

impl Certs {
    pub fn generate() -> Self {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert: CertificateDer<'static> = certified.cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

        let server = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert.clone()], key)
            .unwrap();

        let mut roots = RootCertStore::empty();
        roots.add(cert).unwrap();
        let client = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self {
            server: Arc::new(server),
            client: Arc::new(client),
        }
    }

    /// Factory for both roles.
    pub fn factory(&self) -> Arc<RustlsEngineFactory> {
        Arc::new(
            RustlsEngineFactory::new()
                .with_server(self.server.clone())
                .with_client(self.client.clone(), "localhost")
                .unwrap(),
        )
    }
}

/// Runtime, reactor and a listener on an ephemeral loopback port.
pub struct Harness {
    pub runtime: Runtime,
    pub reactor: Reactor,
    pub pool: Arc<BufferPool>,
    pub metrics: Arc<AtomicMetrics>,
    pub tracker: SessionTracker,
    pub certs: Certs,
    pub listener: Option<Arc<TlsListener>>,
    thread: Option<ReactorThread>,
}

impl Harness {
    /// Start without a listener.
    pub fn new() -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let config = ReactorConfig {
            worker_threads: 2,
            events_capacity: 256,
        };
        let (reactor, thread) = Reactor::start(&config, runtime.handle().clone()).unwrap();
        Self {
            runtime,
            reactor,
            pool: Arc::new(BufferPool::new()),
            metrics: Arc::new(AtomicMetrics::new()),
            tracker: SessionTracker::new(),
            certs: Certs::generate(),
            listener: None,
            thread: Some(thread),
        }
    }

    /// Builder wired to this harness's reactor, pool, metrics and tracker.
    pub fn builder(&self) -> SessionBuilder {
        SessionBuilder::new(self.reactor.clone(), self.pool.clone(), self.certs.factory())
            .metrics(self.metrics.clone())
            .tracker(self.tracker.clone())
    }

    /// Start a listener with `configure` applied to the default builder.
    pub fn listen(&mut self, max_sessions: usize, configure: impl FnOnce(SessionBuilder) -> SessionBuilder) -> SocketAddr {
        let config = ListenerConfig {
            bind_address: "127.0.0.1:0".to_string(),
            max_sessions,
        };
        let listener = TlsListener::bind(&config, &self.reactor, configure(self.builder())).unwrap();
        let addr = listener.local_addr();
        self.listener = Some(listener);
        addr
    }

    pub fn listener(&self) -> &TlsListener {
        self.listener.as_ref().unwrap()
    }

    pub fn connect_client(&self, addr: SocketAddr) -> TlsClient {
        connect_client(addr, self.certs.client.clone())
    }

    /// Wait until the tracker has no live session.
    pub fn wait_idle(&self) -> bool {
        self.runtime
            .block_on(self.tracker.wait_idle(Duration::from_secs(5)))
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.close();
        }
        self.tracker.close_all();
        self.reactor.shutdown();
        if let Some(thread) = self.thread.take() {
            thread.join();
        }
    }
}

/// Blocking rustls client over a loopback socket.
pub fn connect_client(addr: SocketAddr, config: Arc<ClientConfig>) -> TlsClient {
    let tcp = TcpStream::connect(addr).unwrap();
    tcp.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    tcp.set_nodelay(true).unwrap();
    let name = ServerName::try_from("localhost").unwrap();
    let conn = ClientConnection::new(config, name).unwrap();
    StreamOwned::new(conn, tcp)
}

/// Read exactly `len` bytes.
pub fn read_exact(client: &mut TlsClient, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    client.read_exact(&mut buf).unwrap();
    buf
}

/// Send `close_notify` and flush it.
pub fn send_close_notify(client: &mut TlsClient) {
    client.conn.send_close_notify();
    client.flush().unwrap();
}

/// Whether the server ended the TLS stream cleanly with `close_notify`.
pub fn reads_clean_eof(client: &mut TlsClient) -> bool {
    let mut buf = [0u8; 64];
    matches!(client.read(&mut buf), Ok(0))
}

/// Plaintext echo backend on an ephemeral loopback port. Each connection's
/// full transcript is reported once the tunnel closes it.
pub fn start_echo_backend(runtime: &Runtime) -> (SocketAddr, UnboundedReceiver<Vec<u8>>) {
    let listener = runtime
        .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    runtime.spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut transcript = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            transcript.extend_from_slice(&buf[..n]);
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = tx.send(transcript);
            });
        }
    });
    (addr, rx)
}

/// Next transcript reported by [`start_echo_backend`].
pub fn recv_transcript(runtime: &Runtime, rx: &mut UnboundedReceiver<Vec<u8>>) -> Option<Vec<u8>> {
    runtime
        .block_on(async { tokio::time::timeout(Duration::from_secs(5), rx.recv()).await })
        .ok()
        .flatten()
}

/// Backend that accepts one connection and reads nothing until `release`
/// fires. Then it reads to EOF and reports the transcript.
pub fn start_stalled_backend(runtime: &Runtime) -> (SocketAddr, oneshot::Sender<()>, UnboundedReceiver<Vec<u8>>) {
    let listener = runtime
        .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let (release, released) = oneshot::channel();
    let (tx, rx) = mpsc::unbounded_channel();

    runtime.spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            let _ = released.await;
            let mut transcript = Vec::new();
            let _ = socket.read_to_end(&mut transcript).await;
            let _ = tx.send(transcript);
        }
    });
    (addr, release, rx)
}

/// Backend that writes `greeting` on connect, then closes.
pub fn start_greeting_backend(runtime: &Runtime, greeting: &'static [u8]) -> SocketAddr {
    let listener = runtime
        .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
        .unwrap();
    let addr = listener.local_addr().unwrap();

    runtime.spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = socket.write_all(greeting).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
