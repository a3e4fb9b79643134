//! Test utilities for end-to-end C2S testing.
//!
//! Provides an in-memory server (memory repository, memory KV, in-process
//! cluster router), self-signed TLS material and a scripted XMPP client that
//! talks to a real `C2sSession` over an in-memory duplex pipe.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rookery_xmpp::c2s::{C2sSession, SessionConfig, SocketTransport};
use rookery_xmpp::cluster::{InProcessClusterRouter, MemoryKv};
use rookery_xmpp::config::{HostConfig, ListenerConfig, SaslMechanismName, XmppServerConfig};
use rookery_xmpp::storage::{MemoryRepository, OfflineRepository, User, UserRepository};
use rookery_xmpp::{ServerParts, XmppServer};
use rustls::pki_types::{CertificateDer, ServerName};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Domain served by test servers.
pub const DOMAIN: &str = "localhost";

const PIPE_CAPACITY: usize = 64 * 1024;

/// Install the ring crypto provider for rustls.
/// Must be called once before any client-side TLS operations.
pub fn install_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Install the crypto provider and a test log subscriber once per binary.
///
/// Set `RUST_LOG` to see server logs for a failing test.
pub fn init_test_env() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        install_crypto_provider();

        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Generated TLS credentials for testing.
pub struct TestTlsCredentials {
    pub cert_der: CertificateDer<'static>,
    dir: TempDir,
}

impl TestTlsCredentials {
    /// Generate a self-signed certificate for `domain` and write the PEM
    /// pair to a scratch directory.
    pub fn generate(domain: &str) -> Self {
        let CertifiedKey { cert, key_pair } =
            generate_simple_self_signed(vec![domain.to_string()])
                .expect("Failed to generate test certificate");
        let dir = tempfile::tempdir().expect("Failed to create cert dir");
        std::fs::write(dir.path().join("cert.pem"), cert.pem()).expect("Failed to write cert");
        std::fs::write(dir.path().join("key.pem"), key_pair.serialize_pem())
            .expect("Failed to write key");
        Self {
            cert_der: CertificateDer::from(cert.der().to_vec()),
            dir,
        }
    }

    /// Host entry pointing at the generated PEM files.
    pub fn host_config(&self, domain: &str) -> HostConfig {
        HostConfig {
            domain: domain.to_string(),
            cert_file: Some(self.dir.path().join("cert.pem")),
            key_file: Some(self.dir.path().join("key.pem")),
        }
    }

    /// Client-side connector that trusts the generated certificate.
    pub fn tls_connector(&self) -> TlsConnector {
        install_crypto_provider();
        let mut roots = RootCertStore::empty();
        roots.add(self.cert_der.clone()).expect("Failed to add cert");
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }
}

/// Listener settings used by test servers: PLAIN is offered so scripted
/// clients can authenticate without SCRAM.
pub fn test_listener() -> ListenerConfig {
    let mut listener = ListenerConfig::default();
    listener.sasl.mechanisms = vec![SaslMechanismName::Plain, SaslMechanismName::ScramSha256];
    listener
}

/// Server settings with no socket listeners; clients attach through
/// [`TestServer::connect`].
pub fn test_config() -> XmppServerConfig {
    XmppServerConfig {
        default_host: DOMAIN.to_string(),
        listeners: Vec::new(),
        ..XmppServerConfig::default()
    }
}

/// State shared by the members of a test cluster.
pub struct TestCluster {
    pub repository: Arc<MemoryRepository>,
    pub kv: Arc<MemoryKv>,
    pub router: Arc<InProcessClusterRouter>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            repository: Arc::new(MemoryRepository::new()),
            kv: Arc::new(MemoryKv::new()),
            router: Arc::new(InProcessClusterRouter::new()),
        }
    }
}

/// Test server handle.
pub struct TestServer {
    pub server: XmppServer,
    pub repository: Arc<MemoryRepository>,
    pub kv: Arc<MemoryKv>,
    pub tls: TestTlsCredentials,
    listener: ListenerConfig,
}

impl TestServer {
    /// Start a single-instance server with every module enabled.
    pub async fn start() -> Self {
        Self::start_with(test_config(), test_listener()).await
    }

    /// Start a single-instance server with custom settings.
    pub async fn start_with(config: XmppServerConfig, listener: ListenerConfig) -> Self {
        Self::start_in_cluster("node-1", config, listener, &TestCluster::new()).await
    }

    /// Start one member of `cluster`.
    pub async fn start_in_cluster(
        instance_id: &str,
        mut config: XmppServerConfig,
        listener: ListenerConfig,
        shared: &TestCluster,
    ) -> Self {
        init_test_env();
        let tls = TestTlsCredentials::generate(DOMAIN);
        config.hosts.push(tls.host_config(DOMAIN));
        let repository = shared.repository.clone();
        let kv = shared.kv.clone();
        let cluster = shared.router.clone();
        let parts = ServerParts::standalone(repository.clone(), kv.clone())
            .with_cluster(cluster.clone());
        let server = XmppServer::new(instance_id, config, parts).expect("Failed to build server");
        cluster.register(instance_id, server.local_router().clone());
        server.start().await.expect("Failed to start server");
        Self {
            server,
            repository,
            kv,
            tls,
            listener,
        }
    }

    /// Create an account.
    pub async fn add_user(&self, username: &str, password: &str) {
        self.repository
            .upsert_user(&User::with_password_iterations(username, password, 64).unwrap())
            .await
            .unwrap();
    }

    /// Messages waiting in `username`'s offline queue.
    pub async fn offline_count(&self, username: &str) -> usize {
        self.repository.count_offline_messages(username).await.unwrap()
    }

    /// Session settings for a connection; `secured` marks the transport as
    /// already encrypted.
    pub fn session_config(&self, secured: bool) -> SessionConfig {
        let tls_config = self.server.hosts().tls_config().unwrap();
        let mut config = SessionConfig::from_listener(&self.listener, tls_config);
        config.use_tls = secured;
        config
    }

    /// Attach a client to a new session on a transport that counts as
    /// secured.
    pub fn connect(&self) -> TestClient {
        self.connect_with(self.session_config(true))
    }

    /// Attach a client to a plaintext session that must negotiate STARTTLS.
    pub fn connect_plain(&self) -> TestClient {
        self.connect_with(self.session_config(false))
    }

    /// Attach a client to a session built from `config`.
    pub fn connect_with(&self, config: SessionConfig) -> TestClient {
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        let session = C2sSession::new(
            config,
            self.server.c2s_context().clone(),
            Box::new(SocketTransport::new(server)),
        );
        tokio::spawn(session.run());
        TestClient::new(client)
    }

    /// Stop the server.
    pub async fn stop(&self) {
        self.server.stop(Duration::from_secs(1)).await;
    }
}

enum ClientStream {
    Plain(DuplexStream),
    Tls(Box<TlsStream<DuplexStream>>),
    Upgrading,
}

/// Client half of a zlib-compressed stream.
struct ClientZlib {
    deflate: Compress,
    inflate: Decompress,
}

impl ClientZlib {
    fn new() -> Self {
        Self {
            deflate: Compress::new(Compression::default(), true),
            inflate: Decompress::new(true),
        }
    }

    fn compress(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + 128);
        self.deflate
            .compress_vec(data, &mut out, FlushCompress::Sync)
            .expect("deflate failed");
        out
    }

    fn decompress(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() * 8 + 1024);
        let mut consumed = 0;
        loop {
            let before = self.inflate.total_in();
            self.inflate
                .decompress_vec(&data[consumed..], &mut out, FlushDecompress::Sync)
                .expect("inflate failed");
            consumed += (self.inflate.total_in() - before) as usize;
            if consumed >= data.len() && out.len() < out.capacity() {
                return out;
            }
            out.reserve(8192);
        }
    }
}

/// Scripted XMPP client.
pub struct TestClient {
    stream: ClientStream,
    buffer: String,
    zlib: Option<ClientZlib>,
}

impl TestClient {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream: ClientStream::Plain(stream),
            buffer: String::new(),
            zlib: None,
        }
    }

    /// Send raw XML data.
    pub async fn send(&mut self, data: &str) {
        let bytes = match self.zlib {
            Some(ref mut zlib) => zlib.compress(data.as_bytes()),
            None => data.as_bytes().to_vec(),
        };
        let result = match &mut self.stream {
            ClientStream::Plain(s) => s.write_all(&bytes).await,
            ClientStream::Tls(s) => match s.write_all(&bytes).await {
                Ok(()) => s.flush().await,
                Err(e) => Err(e),
            },
            ClientStream::Upgrading => panic!("send during TLS upgrade"),
        };
        result.expect("Failed to send");
    }

    async fn read_more(&mut self, timeout_dur: Duration) -> std::io::Result<usize> {
        let mut buf = [0u8; 8192];
        let read = async {
            match &mut self.stream {
                ClientStream::Plain(s) => s.read(&mut buf).await,
                ClientStream::Tls(s) => s.read(&mut buf).await,
                ClientStream::Upgrading => Ok(0),
            }
        };
        let n = timeout(timeout_dur, read)
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "Read timeout"))??;
        match self.zlib {
            Some(ref mut zlib) if n > 0 => {
                let plain = zlib.decompress(&buf[..n]);
                self.buffer.push_str(&String::from_utf8_lossy(&plain));
            }
            _ => self.buffer.push_str(&String::from_utf8_lossy(&buf[..n])),
        }
        Ok(n)
    }

    /// Read until `pattern` shows up. Returns everything up to and including
    /// it and keeps the rest buffered.
    pub async fn read_until(&mut self, pattern: &str, timeout_dur: Duration) -> std::io::Result<String> {
        let deadline = tokio::time::Instant::now() + timeout_dur;
        loop {
            if let Some(pos) = self.buffer.find(pattern) {
                let rest = self.buffer.split_off(pos + pattern.len());
                return Ok(std::mem::replace(&mut self.buffer, rest));
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("Timeout waiting for {pattern:?}, buffered: {:?}", self.buffer),
                ));
            }
            if self.read_more(remaining).await? == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("Stream closed waiting for {pattern:?}, buffered: {:?}", self.buffer),
                ));
            }
        }
    }

    /// [`read_until`](Self::read_until) with the default timeout, panicking
    /// on failure.
    pub async fn expect(&mut self, pattern: &str) -> String {
        self.read_until(pattern, DEFAULT_TIMEOUT)
            .await
            .unwrap_or_else(|e| panic!("{e}"))
    }

    /// Assert that nothing arrives within `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        match self.read_more(window).await {
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Ok(0) => panic!("stream closed, buffered: {:?}", self.buffer),
            Ok(_) => panic!("unexpected data: {:?}", self.buffer),
            Err(e) => panic!("read failed: {e}"),
        }
        assert!(self.buffer.is_empty(), "unexpected data: {:?}", self.buffer);
    }

    /// Wait for the server to close the stream.
    pub async fn expect_closed(&mut self) -> String {
        let transcript = self.expect("</stream:stream>").await;
        loop {
            match self.read_more(DEFAULT_TIMEOUT).await {
                Ok(0) => return transcript,
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    panic!("connection not closed")
                }
                Err(_) => return transcript,
            }
        }
    }

    /// Open (or restart) the stream and return the advertised features.
    pub async fn open_stream(&mut self) -> String {
        self.send(&format!(
            "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' to='{DOMAIN}' version='1.0'>"
        ))
        .await;
        self.expect("<stream:stream").await;
        self.expect("</features>").await
    }

    /// Negotiate STARTTLS and upgrade the pipe.
    pub async fn starttls(&mut self, connector: TlsConnector) {
        self.send("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>").await;
        self.expect("<proceed").await;
        let ClientStream::Plain(stream) = std::mem::replace(&mut self.stream, ClientStream::Upgrading)
        else {
            panic!("TLS already active");
        };
        let server_name = ServerName::try_from(DOMAIN).expect("Invalid server name");
        let tls = connector
            .connect(server_name, stream)
            .await
            .expect("TLS handshake failed");
        self.stream = ClientStream::Tls(Box::new(tls));
        self.buffer.clear();
    }

    /// Negotiate zlib stream compression. The stream must be restarted
    /// afterwards.
    pub async fn compress(&mut self) {
        self.send("<compress xmlns='http://jabber.org/protocol/compress'><method>zlib</method></compress>")
            .await;
        self.expect("<compressed").await;
        self.expect("/>").await;
        self.buffer.clear();
        self.zlib = Some(ClientZlib::new());
    }

    /// Send a SASL PLAIN request.
    pub async fn send_plain_auth(&mut self, username: &str, password: &str) {
        self.send(&format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
            encode_sasl_plain(username, password)
        ))
        .await;
    }

    /// Authenticate with PLAIN and restart the stream. Returns the
    /// post-auth features.
    pub async fn authenticate(&mut self, username: &str, password: &str) -> String {
        self.open_stream().await;
        self.send_plain_auth(username, password).await;
        self.expect("<success").await;
        self.open_stream().await
    }

    /// Send a bind request.
    pub async fn send_bind(&mut self, resource: Option<&str>) {
        let resource = resource
            .map(|r| format!("<resource>{r}</resource>"))
            .unwrap_or_default();
        self.send(&format!(
            "<iq type='set' id='bind_1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>{resource}</bind></iq>"
        ))
        .await;
    }

    /// Bind `resource` and return the full JID the server assigned.
    pub async fn bind(&mut self, resource: &str) -> String {
        self.send_bind(Some(resource)).await;
        let reply = self.expect("</iq>").await;
        extract_bound_jid(&reply).unwrap_or_else(|| panic!("no bound jid in {reply:?}"))
    }

    /// Authenticate and bind in one go.
    pub async fn login(&mut self, username: &str, password: &str, resource: &str) -> String {
        self.authenticate(username, password).await;
        self.bind(resource).await
    }

    /// Announce availability with `priority`.
    pub async fn send_available(&mut self, priority: i8) {
        self.send(&format!("<presence><priority>{priority}</priority></presence>"))
            .await;
    }

    /// Enable message carbons and wait for the result.
    pub async fn enable_carbons(&mut self) {
        self.send("<iq type='set' id='carbons_1'><enable xmlns='urn:xmpp:carbons:2'/></iq>")
            .await;
        self.expect("carbons_1").await;
        self.expect(">").await;
    }

    /// Drop any buffered data.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Encode SASL PLAIN credentials.
pub fn encode_sasl_plain(username: &str, password: &str) -> String {
    BASE64_STANDARD.encode(format!("\0{username}\0{password}"))
}

/// Extract the JID from a bind result.
pub fn extract_bound_jid(response: &str) -> Option<String> {
    let start = response.find("<jid>")?;
    let end = response.find("</jid>")?;
    Some(response[start + 5..end].to_string())
}

/// Poll `check` until it holds or [`DEFAULT_TIMEOUT`] elapses.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) {
    let deadline = tokio::time::Instant::now() + DEFAULT_TIMEOUT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Async variant of [`eventually`].
pub async fn eventually_async<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + DEFAULT_TIMEOUT;
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
