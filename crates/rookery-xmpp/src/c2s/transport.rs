//! Byte transport under a C2S session.
//!
//! Layers, bottom up: the raw socket, TLS (STARTTLS or direct), zlib
//! compression (XEP-0138) and the read-side token bucket.

use std::sync::Arc;

use async_trait::async_trait;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, instrument};

use crate::config::CompressionLevel;
use crate::error::StreamErrorCondition;
use crate::shaper::RateLimiter;
use crate::types::TransportType;
use crate::XmppError;

/// Size of one socket read.
const READ_CHUNK: usize = 8192;

/// Length of the `tls-exporter` channel binding value (RFC 9266).
const EXPORTER_LEN: usize = 32;

const EXPORTER_LABEL: &[u8] = b"EXPORTER-Channel-Binding";

/// Anything a session can run over.
pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> IoStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Connection-level I/O used by the session machine.
#[async_trait]
pub trait Transport: Send {
    /// Transport family.
    fn kind(&self) -> TransportType;

    /// Next chunk of application bytes; empty at end of stream.
    ///
    /// Cancel safe: a cancelled read consumes nothing.
    async fn read(&mut self) -> Result<Vec<u8>, XmppError>;

    /// Write application bytes.
    async fn write(&mut self, data: &[u8]) -> Result<(), XmppError>;

    /// Flush pending writes.
    async fn flush(&mut self) -> Result<(), XmppError>;

    /// Upgrade to TLS.
    async fn start_tls(&mut self, config: Arc<ServerConfig>) -> Result<(), XmppError>;

    /// Compress every byte from now on.
    fn enable_compression(&mut self, level: CompressionLevel) -> Result<(), XmppError>;

    /// `tls-exporter` data once TLS is up.
    fn channel_binding(&self) -> Option<Vec<u8>>;

    /// Whether TLS is active.
    fn is_secured(&self) -> bool;

    /// Replace the read-side limiter.
    fn set_rate_limiter(&mut self, limiter: RateLimiter);

    /// Fail reads with `connection-timeout` after `deadline`; `None` clears it.
    fn set_read_deadline(&mut self, deadline: Option<Instant>);

    /// Shut the write side down.
    async fn close(&mut self) -> Result<(), XmppError>;
}

#[derive(Default)]
enum StreamInner {
    #[default]
    None,
    Plain(Box<dyn IoStream>),
    Tls(Box<TlsStream<Box<dyn IoStream>>>),
}

struct Zlib {
    deflate: Compress,
    inflate: Decompress,
}

/// Socket transport over any async byte stream.
pub struct SocketTransport {
    inner: StreamInner,
    zlib: Option<Zlib>,
    limiter: RateLimiter,
    throttled_until: Option<Instant>,
    read_deadline: Option<Instant>,
    channel_binding: Option<Vec<u8>>,
}

impl SocketTransport {
    /// Plain transport over `stream`.
    pub fn new(stream: impl IoStream) -> Self {
        Self {
            inner: StreamInner::Plain(Box::new(stream)),
            zlib: None,
            limiter: RateLimiter::unlimited(),
            throttled_until: None,
            read_deadline: None,
            channel_binding: None,
        }
    }

    async fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize, XmppError> {
        let deadline = self.read_deadline;
        let read = async {
            match &mut self.inner {
                StreamInner::None => Err(XmppError::internal("transport closed")),
                StreamInner::Plain(s) => Ok(s.read(buf).await?),
                StreamInner::Tls(s) => Ok(s.read(buf).await?),
            }
        };
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, read)
                .await
                .map_err(|_| XmppError::stream(StreamErrorCondition::ConnectionTimeout))?,
            None => read.await,
        }
    }

    async fn write_raw(&mut self, buf: &[u8]) -> Result<(), XmppError> {
        match &mut self.inner {
            StreamInner::None => Err(XmppError::internal("transport closed")),
            StreamInner::Plain(s) => Ok(s.write_all(buf).await?),
            StreamInner::Tls(s) => Ok(s.write_all(buf).await?),
        }
    }
}

impl std::fmt::Debug for SocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketTransport")
            .field("secured", &self.is_secured())
            .field("compressed", &self.zlib.is_some())
            .finish()
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn kind(&self) -> TransportType {
        TransportType::Socket
    }

    async fn read(&mut self) -> Result<Vec<u8>, XmppError> {
        if let Some(until) = self.throttled_until {
            tokio::time::sleep_until(until).await;
            self.throttled_until = None;
        }

        let mut buf = vec![0u8; READ_CHUNK];
        let n = self.read_raw(&mut buf).await?;
        buf.truncate(n);
        if n == 0 {
            return Ok(buf);
        }

        let now = Instant::now();
        let wait = self.limiter.reserve_at(n as u64, now.into_std());
        if !wait.is_zero() {
            self.throttled_until = Some(now + wait);
        }

        match self.zlib {
            Some(ref mut zlib) => inflate(&mut zlib.inflate, &buf),
            None => Ok(buf),
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), XmppError> {
        let compressed;
        let payload = match self.zlib {
            Some(ref mut zlib) => {
                compressed = deflate(&mut zlib.deflate, data)?;
                compressed.as_slice()
            }
            None => data,
        };
        self.write_raw(payload).await
    }

    async fn flush(&mut self) -> Result<(), XmppError> {
        match &mut self.inner {
            StreamInner::None => Err(XmppError::internal("transport closed")),
            StreamInner::Plain(s) => Ok(s.flush().await?),
            StreamInner::Tls(s) => Ok(s.flush().await?),
        }
    }

    #[instrument(skip_all)]
    async fn start_tls(&mut self, config: Arc<ServerConfig>) -> Result<(), XmppError> {
        let plain = match std::mem::take(&mut self.inner) {
            StreamInner::Plain(s) => s,
            other => {
                self.inner = other;
                return Err(XmppError::internal("TLS already active"));
            }
        };
        let acceptor = TlsAcceptor::from(config);
        let tls = acceptor.accept(plain).await?;

        let (_, conn) = tls.get_ref();
        self.channel_binding = conn
            .export_keying_material(vec![0u8; EXPORTER_LEN], EXPORTER_LABEL, None)
            .ok();
        debug!(
            protocol = ?conn.protocol_version(),
            sni = ?conn.server_name(),
            "TLS established"
        );
        self.inner = StreamInner::Tls(Box::new(tls));
        Ok(())
    }

    fn enable_compression(&mut self, level: CompressionLevel) -> Result<(), XmppError> {
        let Some(zlib_level) = level.zlib_level() else {
            return Err(XmppError::internal("compression is disabled"));
        };
        if self.zlib.is_some() {
            return Err(XmppError::internal("compression already active"));
        }
        self.zlib = Some(Zlib {
            deflate: Compress::new(Compression::new(zlib_level), true),
            inflate: Decompress::new(true),
        });
        Ok(())
    }

    fn channel_binding(&self) -> Option<Vec<u8>> {
        self.channel_binding.clone()
    }

    fn is_secured(&self) -> bool {
        matches!(self.inner, StreamInner::Tls(_))
    }

    fn set_rate_limiter(&mut self, limiter: RateLimiter) {
        self.limiter = limiter;
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline;
    }

    async fn close(&mut self) -> Result<(), XmppError> {
        match std::mem::take(&mut self.inner) {
            StreamInner::None => Ok(()),
            StreamInner::Plain(mut s) => Ok(s.shutdown().await?),
            StreamInner::Tls(mut s) => Ok(s.shutdown().await?),
        }
    }
}

fn zlib_error(e: impl std::fmt::Display) -> XmppError {
    XmppError::internal(format!("zlib: {}", e))
}

/// Compress `data` and sync-flush so the peer can decode it immediately.
fn deflate(c: &mut Compress, data: &[u8]) -> Result<Vec<u8>, XmppError> {
    let mut out = Vec::with_capacity(data.len() / 2 + 64);
    let mut consumed = 0;
    loop {
        if out.capacity() - out.len() < 64 {
            out.reserve(1024);
        }
        let (in_before, out_before) = (c.total_in(), c.total_out());
        c.compress_vec(&data[consumed..], &mut out, FlushCompress::Sync)
            .map_err(zlib_error)?;
        consumed += (c.total_in() - in_before) as usize;
        let progressed = c.total_in() != in_before || c.total_out() != out_before;
        if consumed >= data.len() && out.len() < out.capacity() {
            return Ok(out);
        }
        if !progressed && out.len() < out.capacity() {
            return Err(zlib_error("deflate stalled"));
        }
    }
}

fn inflate(d: &mut Decompress, data: &[u8]) -> Result<Vec<u8>, XmppError> {
    let mut out = Vec::with_capacity(data.len() * 4 + 64);
    let mut consumed = 0;
    loop {
        if out.len() == out.capacity() {
            out.reserve(READ_CHUNK);
        }
        let (in_before, out_before) = (d.total_in(), d.total_out());
        d.decompress_vec(&data[consumed..], &mut out, FlushDecompress::Sync)
            .map_err(zlib_error)?;
        consumed += (d.total_in() - in_before) as usize;
        let progressed = d.total_in() != in_before || d.total_out() != out_before;
        if consumed >= data.len() && out.len() < out.capacity() {
            return Ok(out);
        }
        if !progressed {
            if out.len() < out.capacity() {
                return Ok(out);
            }
            out.reserve(READ_CHUNK);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ClientZlib;
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_plain_read_write() {
        let (client, server) = tokio::io::duplex(1024);
        let mut transport = SocketTransport::new(server);
        let (mut rd, mut wr) = tokio::io::split(client);

        wr.write_all(b"<presence/>").await.unwrap();
        assert_eq!(transport.read().await.unwrap(), b"<presence/>");

        transport.write(b"<message/>").await.unwrap();
        transport.flush().await.unwrap();
        let mut buf = [0u8; 10];
        rd.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"<message/>");
        assert!(!transport.is_secured());
    }

    #[tokio::test]
    async fn test_compressed_round_trip() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut transport = SocketTransport::new(server);
        transport.enable_compression(CompressionLevel::Best).unwrap();
        assert!(transport.enable_compression(CompressionLevel::Best).is_err());
        let (mut rd, mut wr) = tokio::io::split(client);
        let mut codec = ClientZlib::new();

        let inbound = b"<iq type='get' id='1'><ping xmlns='urn:xmpp:ping'/></iq>";
        wr.write_all(&codec.compress(inbound)).await.unwrap();
        assert_eq!(transport.read().await.unwrap(), inbound);

        let outbound = b"<iq type='result' id='1'/>";
        transport.write(outbound).await.unwrap();
        transport.flush().await.unwrap();
        let mut buf = vec![0u8; 256];
        let n = rd.read(&mut buf).await.unwrap();
        assert_eq!(codec.decompress(&buf[..n]), outbound);
    }

    #[tokio::test]
    async fn test_read_deadline() {
        let (_client, server) = tokio::io::duplex(1024);
        let mut transport = SocketTransport::new(server);
        transport.set_read_deadline(Some(Instant::now() + Duration::from_millis(20)));

        match transport.read().await {
            Err(XmppError::Stream(err)) => {
                assert_eq!(err.condition, StreamErrorCondition::ConnectionTimeout)
            }
            other => panic!("unexpected read result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_eof_is_empty_chunk() {
        let (client, server) = tokio::io::duplex(1024);
        let mut transport = SocketTransport::new(server);
        drop(client);
        assert!(transport.read().await.unwrap().is_empty());
    }
}
