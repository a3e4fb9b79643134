//! C2S accept loop.

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::session::C2sSession;
use super::transport::{SocketTransport, Transport};
use super::{C2sContext, SessionConfig};
use crate::config::ListenerConfig;
use crate::error::StreamErrorCondition;
use crate::types::TransportType;
use crate::XmppError;

/// A bound C2S socket.
pub struct C2sListener {
    listener: TcpListener,
    session_config: SessionConfig,
    ctx: C2sContext,
}

impl C2sListener {
    /// Bind the socket described by `config`.
    pub async fn bind(
        config: &ListenerConfig,
        ctx: C2sContext,
        tls_config: Option<Arc<ServerConfig>>,
    ) -> Result<Self, XmppError> {
        if config.transport != TransportType::Socket {
            return Err(XmppError::config(format!(
                "listener transport '{}' is not supported",
                config.transport
            )));
        }
        if config.direct_tls && tls_config.is_none() {
            return Err(XmppError::config(format!(
                "listener {}:{} uses direct TLS but no host has a certificate",
                config.bind_addr, config.port
            )));
        }
        let listener = TcpListener::bind((config.bind_addr.as_str(), config.port)).await?;
        info!(
            addr = %listener.local_addr()?,
            direct_tls = config.direct_tls,
            "C2S listener bound"
        );
        Ok(Self {
            listener,
            session_config: SessionConfig::from_listener(config, tls_config),
            ctx,
        })
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, XmppError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            let (socket, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept C2S connection");
                        continue;
                    }
                },
            };
            self.spawn_session(socket, peer);
        }
        debug!("C2S listener stopped");
    }

    fn spawn_session(&self, socket: TcpStream, peer: SocketAddr) {
        if let Err(e) = socket.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }
        let session_config = self.session_config.clone();
        let ctx = self.ctx.clone();
        let span = info_span!("c2s", stream_id = tracing::field::Empty, peer = %peer);
        tokio::spawn(
            async move {
                let mut transport = SocketTransport::new(socket);
                if let Err(e) = accept_direct_tls(&mut transport, &session_config).await {
                    debug!(error = %e, "Direct TLS handshake failed");
                    return;
                }
                let session = C2sSession::new(session_config, ctx, Box::new(transport));
                tracing::Span::current().record("stream_id", session.stream().id().as_u64());
                session.run().await;
            }
            .instrument(span),
        );
    }
}

/// Run the direct TLS handshake, bounded by the connection timeout. A no-op
/// unless the listener uses direct TLS.
async fn accept_direct_tls(
    transport: &mut SocketTransport,
    config: &SessionConfig,
) -> Result<(), XmppError> {
    let Some(tls) = config.tls_config.clone().filter(|_| config.use_tls) else {
        return Ok(());
    };
    tokio::time::timeout(config.conn_timeout, transport.start_tls(tls))
        .await
        .map_err(|_| XmppError::stream(StreamErrorCondition::ConnectionTimeout))?
}
