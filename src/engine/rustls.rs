//! `CryptoEngine` over rustls client/server connections.
//!
//! rustls keeps its own record buffers, so this adapter mostly moves bytes:
//! `unwrap` feeds `src` to `read_tls` and drains decrypted plaintext into
//! `dst`; `wrap` feeds plaintext to the connection writer and drains
//! `write_tls` output into `dst`.
//!
//! Plaintext decrypted before `Finished` has been reported stays inside the
//! connection and is surfaced by the first steady-state unwrap
//! (`has_pending_input` keeps the driver unwrapping until it is drained).

use std::io::{self, Read, Write};
use std::sync::Arc;

use ::rustls::pki_types::ServerName;
use ::rustls::{ClientConfig, ClientConnection, IoState, ServerConfig, ServerConnection};

use super::{
    CryptoEngine, DelegatedTask, EngineError, EngineFactory, EngineResult, EngineStatus,
    HandshakeStatus, Role,
};
use crate::buffer::NetBuffer;

/// Largest plaintext fragment a TLS record carries.
const MAX_FRAGMENT_LEN: usize = 16 * 1024;

/// Record header plus the largest fragment plus worst-case expansion.
pub const PACKET_BUFFER_SIZE: usize = 5 + MAX_FRAGMENT_LEN + 2048;

pub const APPLICATION_BUFFER_SIZE: usize = MAX_FRAGMENT_LEN;

enum TlsConnection {
    Client(ClientConnection),
    Server(ServerConnection),
}

impl TlsConnection {
    fn read_tls(&mut self, rd: &mut dyn Read) -> io::Result<usize> {
        match self {
            TlsConnection::Client(conn) => conn.read_tls(rd),
            TlsConnection::Server(conn) => conn.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn Write) -> io::Result<usize> {
        match self {
            TlsConnection::Client(conn) => conn.write_tls(wr),
            TlsConnection::Server(conn) => conn.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> Result<IoState, ::rustls::Error> {
        match self {
            TlsConnection::Client(conn) => conn.process_new_packets(),
            TlsConnection::Server(conn) => conn.process_new_packets(),
        }
    }

    fn read_plaintext(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            TlsConnection::Client(conn) => conn.reader().read(buf),
            TlsConnection::Server(conn) => conn.reader().read(buf),
        }
    }

    fn write_plaintext(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            TlsConnection::Client(conn) => conn.writer().write(buf),
            TlsConnection::Server(conn) => conn.writer().write(buf),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            TlsConnection::Client(conn) => conn.wants_write(),
            TlsConnection::Server(conn) => conn.wants_write(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            TlsConnection::Client(conn) => conn.is_handshaking(),
            TlsConnection::Server(conn) => conn.is_handshaking(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            TlsConnection::Client(conn) => conn.send_close_notify(),
            TlsConnection::Server(conn) => conn.send_close_notify(),
        }
    }
}

/// A rustls connection driven through the wrap/unwrap contract.
pub struct RustlsEngine {
    conn: TlsConnection,
    role: Role,
    finished_reported: bool,
    outbound_closed: bool,
    peer_closed: bool,
    pending_plaintext: usize,
}

impl RustlsEngine {
    pub fn client(config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Result<Self, EngineError> {
        let conn = ClientConnection::new(config, server_name)?;
        Ok(Self::from_connection(TlsConnection::Client(conn), Role::Client))
    }

    pub fn server(config: Arc<ServerConfig>) -> Result<Self, EngineError> {
        let conn = ServerConnection::new(config)?;
        Ok(Self::from_connection(TlsConnection::Server(conn), Role::Server))
    }

    fn from_connection(conn: TlsConnection, role: Role) -> Self {
        Self {
            conn,
            role,
            finished_reported: false,
            outbound_closed: false,
            peer_closed: false,
            pending_plaintext: 0,
        }
    }

    /// Build a result, reporting `Finished` exactly once.
    fn result(&mut self, status: EngineStatus, consumed: usize, produced: usize) -> EngineResult {
        let handshake_status = if !self.finished_reported && !self.conn.is_handshaking() {
            self.finished_reported = true;
            HandshakeStatus::Finished
        } else {
            self.handshake_status()
        };
        EngineResult {
            status,
            handshake_status,
            bytes_consumed: consumed,
            bytes_produced: produced,
        }
    }

    fn drain_plaintext(&mut self, dst: &mut NetBuffer) -> Result<usize, EngineError> {
        let want = self.pending_plaintext.min(dst.remaining());
        let mut produced = 0;
        while produced < want {
            let window = &mut dst.chunk_mut()[..want - produced];
            match self.conn.read_plaintext(window) {
                Ok(0) => break,
                Ok(n) => {
                    dst.advance(n);
                    produced += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        self.pending_plaintext -= produced;
        Ok(produced)
    }
}

impl CryptoEngine for RustlsEngine {
    fn role(&self) -> Role {
        self.role
    }

    fn begin_handshake(&mut self) -> Result<(), EngineError> {
        // The connection starts handshaking on construction; a client has its
        // ClientHello queued already.
        tracing::trace!(role = %self.role, "rustls handshake started");
        Ok(())
    }

    fn wrap(&mut self, src: &mut NetBuffer, dst: &mut NetBuffer) -> Result<EngineResult, EngineError> {
        let mut consumed = 0;
        if src.has_remaining() && !self.outbound_closed {
            consumed = self.conn.write_plaintext(src.chunk())?;
            src.advance(consumed);
        }

        if self.conn.wants_write() && !dst.has_remaining() {
            return Ok(self.result(EngineStatus::BufferOverflow, consumed, 0));
        }

        let mut produced = 0;
        while self.conn.wants_write() && dst.has_remaining() {
            let mut out: &mut [u8] = dst.chunk_mut();
            let n = self.conn.write_tls(&mut out)?;
            if n == 0 {
                break;
            }
            dst.advance(n);
            produced += n;
        }

        let status = if self.outbound_closed && !self.conn.wants_write() {
            EngineStatus::Closed
        } else {
            EngineStatus::Ok
        };
        Ok(self.result(status, consumed, produced))
    }

    fn unwrap(&mut self, src: &mut NetBuffer, dst: &mut NetBuffer) -> Result<EngineResult, EngineError> {
        let surface = self.finished_reported;
        let before = self.handshake_status();

        // Hold back new ciphertext until buffered plaintext has been drained;
        // rustls refuses input once its plaintext buffer is full.
        let mut consumed = 0;
        if src.has_remaining() && self.pending_plaintext == 0 && !self.peer_closed {
            let mut input: &[u8] = src.chunk();
            consumed = self.conn.read_tls(&mut input)?;
            src.advance(consumed);
        }

        let state = self.conn.process_new_packets()?;
        self.pending_plaintext = state.plaintext_bytes_to_read();
        if state.peer_has_closed() {
            self.peer_closed = true;
        }

        let mut produced = 0;
        if surface && self.pending_plaintext > 0 {
            if !dst.has_remaining() {
                return Ok(self.result(EngineStatus::BufferOverflow, consumed, 0));
            }
            produced = self.drain_plaintext(dst)?;
        }

        let after = self.handshake_status();
        let status = if self.peer_closed && self.pending_plaintext == 0 {
            EngineStatus::Closed
        } else if produced == 0
            && after == before
            && after != HandshakeStatus::NeedWrap
            && !src.has_remaining()
            && (self.pending_plaintext == 0 || !surface)
        {
            EngineStatus::BufferUnderflow
        } else {
            EngineStatus::Ok
        };
        Ok(self.result(status, consumed, produced))
    }

    fn handshake_status(&self) -> HandshakeStatus {
        if self.conn.wants_write() {
            HandshakeStatus::NeedWrap
        } else if self.conn.is_handshaking() {
            HandshakeStatus::NeedUnwrap
        } else {
            HandshakeStatus::NotHandshaking
        }
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        None
    }

    fn close_outbound(&mut self) {
        if !self.outbound_closed {
            self.outbound_closed = true;
            self.conn.send_close_notify();
        }
    }

    fn is_outbound_done(&self) -> bool {
        self.outbound_closed && !self.conn.wants_write()
    }

    fn has_pending_input(&self) -> bool {
        self.pending_plaintext > 0
    }

    fn packet_buffer_size(&self) -> usize {
        PACKET_BUFFER_SIZE
    }

    fn application_buffer_size(&self) -> usize {
        APPLICATION_BUFFER_SIZE
    }
}

/// Builds `RustlsEngine`s from shared rustls configs.
#[derive(Clone, Default)]
pub struct RustlsEngineFactory {
    server: Option<Arc<ServerConfig>>,
    client: Option<(Arc<ClientConfig>, ServerName<'static>)>,
}

impl RustlsEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable server-role engines.
    pub fn with_server(mut self, config: Arc<ServerConfig>) -> Self {
        self.server = Some(config);
        self
    }

    /// Enable client-role engines that verify the peer as `server_name`.
    pub fn with_client(mut self, config: Arc<ClientConfig>, server_name: &str) -> Result<Self, EngineError> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| EngineError::Setup(format!("invalid server name: {server_name}")))?;
        self.client = Some((config, name));
        Ok(self)
    }
}

impl EngineFactory for RustlsEngineFactory {
    fn new_engine(&self, role: Role) -> Result<Box<dyn CryptoEngine>, EngineError> {
        match role {
            Role::Server => {
                let config = self
                    .server
                    .as_ref()
                    .ok_or_else(|| EngineError::Setup("no server TLS config".into()))?;
                Ok(Box::new(RustlsEngine::server(config.clone())?))
            }
            Role::Client => {
                let (config, name) = self
                    .client
                    .as_ref()
                    .ok_or_else(|| EngineError::Setup("no client TLS config".into()))?;
                Ok(Box::new(RustlsEngine::client(config.clone(), name.clone())?))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::buffer::BufferKind;
    use ::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
    use ::rustls::RootCertStore;

    /// A server/client factory pair trusting one self-signed certificate.
    pub(crate) fn factory_pair() -> (RustlsEngineFactory, RustlsEngineFactory) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert: CertificateDer<'static> = certified.cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert.clone()], key)
            .unwrap();

        let mut roots = RootCertStore::empty();
        roots.add(cert).unwrap();
        let client_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let server = RustlsEngineFactory::new().with_server(Arc::new(server_config));
        let client = RustlsEngineFactory::new()
            .with_client(Arc::new(client_config), "localhost")
            .unwrap();
        (server, client)
    }

    fn wire() -> NetBuffer {
        NetBuffer::new(BufferKind::Direct, PACKET_BUFFER_SIZE * 4)
    }

    /// Move every pending record from `from` into `to`. Returns the handshake
    /// statuses reported on the way.
    fn transfer(
        from: &mut dyn CryptoEngine,
        to: &mut dyn CryptoEngine,
        app: &mut NetBuffer,
    ) -> Vec<HandshakeStatus> {
        let mut seen = Vec::new();
        let mut empty = NetBuffer::new(BufferKind::Heap, 0);
        let mut buf = wire();
        while from.handshake_status() == HandshakeStatus::NeedWrap {
            let r = from.wrap(&mut empty, &mut buf).unwrap();
            seen.push(r.handshake_status);
        }
        buf.flip();
        while buf.has_remaining() || to.has_pending_input() {
            let r = to.unwrap(&mut buf, app).unwrap();
            seen.push(r.handshake_status);
            if r.status == EngineStatus::BufferUnderflow {
                break;
            }
        }
        seen
    }

    #[test]
    fn handshake_completes_and_reports_finished_once() {
        let (server_factory, client_factory) = factory_pair();
        let mut client = client_factory.new_engine(Role::Client).unwrap();
        let mut server = server_factory.new_engine(Role::Server).unwrap();
        client.begin_handshake().unwrap();
        server.begin_handshake().unwrap();

        assert_eq!(client.handshake_status(), HandshakeStatus::NeedWrap);
        assert_eq!(server.handshake_status(), HandshakeStatus::NeedUnwrap);

        let mut app = NetBuffer::new(BufferKind::Heap, APPLICATION_BUFFER_SIZE);
        let mut statuses = Vec::new();
        for _ in 0..8 {
            statuses.extend(transfer(client.as_mut(), server.as_mut(), &mut app));
            statuses.extend(transfer(server.as_mut(), client.as_mut(), &mut app));
        }

        assert_eq!(client.handshake_status(), HandshakeStatus::NotHandshaking);
        assert_eq!(server.handshake_status(), HandshakeStatus::NotHandshaking);
        let finished = statuses
            .iter()
            .filter(|s| **s == HandshakeStatus::Finished)
            .count();
        assert_eq!(finished, 2);
    }

    #[test]
    fn application_data_round_trips_after_handshake() {
        let (server_factory, client_factory) = factory_pair();
        let mut client = client_factory.new_engine(Role::Client).unwrap();
        let mut server = server_factory.new_engine(Role::Server).unwrap();
        let mut app = NetBuffer::new(BufferKind::Heap, APPLICATION_BUFFER_SIZE);
        for _ in 0..8 {
            transfer(client.as_mut(), server.as_mut(), &mut app);
            transfer(server.as_mut(), client.as_mut(), &mut app);
        }
        app.clear();

        let mut plaintext = NetBuffer::new(BufferKind::Heap, 64);
        plaintext.put_slice(b"ping over tls");
        plaintext.flip();
        let mut records = wire();
        let r = client.wrap(&mut plaintext, &mut records).unwrap();
        assert_eq!(r.status, EngineStatus::Ok);
        assert_eq!(r.bytes_consumed, 13);
        assert!(r.bytes_produced > 13);

        records.flip();
        let mut received = Vec::new();
        while records.has_remaining() || server.has_pending_input() {
            let r = server.unwrap(&mut records, &mut app).unwrap();
            app.flip();
            received.extend_from_slice(app.chunk());
            app.clear();
            if r.status != EngineStatus::Ok {
                break;
            }
        }
        assert_eq!(received, b"ping over tls");
    }

    #[test]
    fn close_outbound_flushes_close_notify() {
        let (server_factory, client_factory) = factory_pair();
        let mut client = client_factory.new_engine(Role::Client).unwrap();
        let mut server = server_factory.new_engine(Role::Server).unwrap();
        let mut app = NetBuffer::new(BufferKind::Heap, APPLICATION_BUFFER_SIZE);
        for _ in 0..8 {
            transfer(client.as_mut(), server.as_mut(), &mut app);
            transfer(server.as_mut(), client.as_mut(), &mut app);
        }

        client.close_outbound();
        assert_eq!(client.handshake_status(), HandshakeStatus::NeedWrap);
        assert!(!client.is_outbound_done());

        let mut empty = NetBuffer::new(BufferKind::Heap, 0);
        let mut records = wire();
        let r = client.wrap(&mut empty, &mut records).unwrap();
        assert_eq!(r.status, EngineStatus::Closed);
        assert!(r.bytes_produced > 0);
        assert!(client.is_outbound_done());

        records.flip();
        let r = server.unwrap(&mut records, &mut app).unwrap();
        assert_eq!(r.status, EngineStatus::Closed);
    }

    #[test]
    fn wrap_into_full_buffer_overflows() {
        let (_, client_factory) = factory_pair();
        let mut client = client_factory.new_engine(Role::Client).unwrap();
        let mut empty = NetBuffer::new(BufferKind::Heap, 0);
        let mut full = NetBuffer::new(BufferKind::Direct, 0);
        let r = client.wrap(&mut empty, &mut full).unwrap();
        assert_eq!(r.status, EngineStatus::BufferOverflow);
        assert_eq!(r.bytes_produced, 0);
    }

    #[test]
    fn missing_role_config_is_a_setup_error() {
        let factory = RustlsEngineFactory::new();
        assert!(matches!(
            factory.new_engine(Role::Server),
            Err(EngineError::Setup(_))
        ));
    }
}
