//! C2S session machine.
//!
//! One task per connection owns the transport, the framer and every piece of
//! negotiation state. Inbound bytes, commands posted through the
//! [`LocalStream`] handle and the authentication timer are multiplexed in a
//! single loop, so a session never processes two things at once and
//! outbound writes keep the order of the stimuli that caused them.
//!
//! ```text
//! connecting ──header──► connected ──auth──► authenticating
//!     ▲                     │ starttls            │ success
//!     └─────── restart ─────┴─────────────────────┘
//! connecting ──header──► authenticated ──bind──► bound
//! any ──disconnect──► disconnected ──► terminated
//! ```

use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::time::Duration;

use futures::FutureExt;
use jid::{FullJid, Jid};
use minidom::Element;
use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep};
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use super::stream::{LocalStream, StreamCommand};
use super::transport::Transport;
use super::{C2sContext, SessionConfig};
use crate::auth::{Authenticator, Mechanism, SaslError};
use crate::config::{CompressionLevel, ResourceConflict};
use crate::error::{StanzaErrorCondition, StreamError, StreamErrorCondition};
use crate::hook::{names, ElementInfo, HookContext, HookInfo, StreamInfo};
use crate::metrics;
use crate::parser::{element_to_string, ns, stream_header, Frame, StreamHeader, XmlFramer, STREAM_CLOSE};
use crate::router::{RouteError, RoutingOptions};
use crate::stanza::{bare_jid, full_jid, JidExt, PresenceType, Stanza};
use crate::types::{SessionState, StanzaType, StreamId, TransportType};
use crate::XmppError;

/// Failed SASL exchanges tolerated before the stream is closed.
const MAX_AUTH_FAILURES: u32 = 5;

/// How long a bound stream stays addressable after a connection timeout.
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// A client connection from the first byte to termination.
pub struct C2sSession {
    config: SessionConfig,
    ctx: C2sContext,
    transport: Box<dyn Transport>,
    framer: XmlFramer,
    stream: LocalStream,
    commands: mpsc::Receiver<StreamCommand>,
    authenticator: Option<Box<dyn Authenticator>>,
    auth_failures: u32,
    auth_aborts: u32,
    auth_timer: Pin<Box<Sleep>>,
    auth_timer_armed: bool,
    header_sent: bool,
    send_disabled: bool,
    started_at: Instant,
}

impl C2sSession {
    /// Prepare a session over `transport`. Nothing happens until [`run`](Self::run).
    pub fn new(config: SessionConfig, ctx: C2sContext, transport: Box<dyn Transport>) -> Self {
        let directory = ctx.router.c2s().directory().clone();
        let (stream, commands) =
            LocalStream::new(StreamId::next(), ctx.hosts.default_host(), directory);
        let auth_timer = Box::pin(tokio::time::sleep(config.auth_timeout));
        let auth_timer_armed = !config.auth_timeout.is_zero();
        Self {
            framer: XmlFramer::new(config.max_stanza_size),
            config,
            ctx,
            transport,
            stream,
            commands,
            authenticator: None,
            auth_failures: 0,
            auth_aborts: 0,
            auth_timer,
            auth_timer_armed,
            header_sent: false,
            send_disabled: false,
            started_at: Instant::now(),
        }
    }

    /// Handle to this session.
    pub fn stream(&self) -> LocalStream {
        self.stream.clone()
    }

    /// Drive the session until it terminates.
    pub async fn run(mut self) {
        if let Err(e) = self.ctx.router.c2s().register(self.stream.clone()) {
            error!(error = %e, "Failed to register stream");
            self.terminate().await;
            return;
        }
        if self.config.use_tls || self.transport.is_secured() {
            self.stream.update_flags(|f| f.set_secured());
        }
        self.transport
            .set_rate_limiter(self.ctx.shapers.match_unauthenticated().rate_limiter());
        self.set_read_timeout(self.config.conn_timeout);
        metrics::record_session_started(&self.transport.kind().to_string());
        info!(transport = %self.transport.kind(), "C2S stream connected");
        self.run_stream_hook(names::C2S_STREAM_CONNECTED).await;

        while self.stream.state() != SessionState::Terminated {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(StreamCommand::Send(stanza)) => self.deliver(stanza).await,
                    Some(StreamCommand::Disconnect(err)) => self.disconnect(err).await,
                    None => self.disconnect(None).await,
                },
                _ = &mut self.auth_timer, if self.auth_timer_armed => {
                    self.auth_timer_armed = false;
                    if !self.stream.flags().is_authenticated() {
                        debug!("Authentication timed out");
                        self.disconnect(Some(StreamError::new(StreamErrorCondition::ConnectionTimeout)))
                            .await;
                    }
                },
                read = self.transport.read() => self.on_read(read).await,
            }
        }
        self.terminate().await;
    }

    async fn on_read(&mut self, read: Result<Vec<u8>, XmppError>) {
        match read {
            Ok(data) if data.is_empty() => {
                debug!("Peer closed the connection");
                self.disconnect(None).await;
            }
            Ok(data) => {
                if self.header_sent {
                    self.set_read_timeout(self.config.keep_alive_timeout);
                }
                self.framer.feed(&data);
                self.process_frames().await;
            }
            Err(XmppError::Stream(e)) => self.disconnect(Some(e)).await,
            Err(e) => {
                debug!(error = %e, "Read failed");
                self.disconnect(None).await;
            }
        }
    }

    async fn process_frames(&mut self) {
        while self.is_open() {
            let frame = match self.framer.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(XmppError::Stream(e)) => {
                    self.disconnect(Some(e)).await;
                    return;
                }
                Err(e) => {
                    debug!(error = %e, "Malformed input");
                    self.disconnect(Some(StreamError::new(StreamErrorCondition::NotWellFormed)))
                        .await;
                    return;
                }
            };
            self.process_frame(frame).await;
        }
    }

    /// Handle one frame under the request timeout, containing panics.
    async fn process_frame(&mut self, frame: Frame) {
        let req_timeout = self.config.req_timeout;
        let handled = AssertUnwindSafe(self.handle_frame(frame)).catch_unwind();
        match tokio::time::timeout(req_timeout, handled).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => self.fail(e).await,
            Ok(Err(_)) => {
                error!("Panic while processing element");
                self.disconnect(Some(StreamError::new(StreamErrorCondition::InternalServerError)))
                    .await;
            }
            Err(_) => {
                warn!(timeout_ms = req_timeout.as_millis() as u64, "Element processing timed out");
            }
        }
    }

    async fn fail(&mut self, err: XmppError) {
        match err {
            XmppError::Stream(e) => {
                debug!(condition = %e.condition, "Stream error");
                self.disconnect(Some(e)).await;
            }
            XmppError::Io(e) => {
                debug!(error = %e, "Transport failed");
                self.disconnect(None).await;
            }
            other => {
                warn!(error = %other, "Session failed");
                self.disconnect(Some(StreamError::new(StreamErrorCondition::InternalServerError)))
                    .await;
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), XmppError> {
        match frame {
            Frame::StreamOpen(header) => self.on_stream_open(header).await,
            Frame::StreamClose => {
                debug!("Client closed the stream");
                self.disconnect(None).await;
                Ok(())
            }
            Frame::Element(element) => {
                trace!(name = element.name(), state = %self.stream.state(), "RECV");
                match self.stream.state() {
                    SessionState::Connecting => {
                        Err(XmppError::stream(StreamErrorCondition::NotWellFormed))
                    }
                    SessionState::Connected => self.on_connected(element).await,
                    SessionState::Authenticating => self.on_authenticating(element).await,
                    SessionState::Authenticated => self.on_authenticated(element).await,
                    SessionState::Bound => self.on_bound(element).await,
                    SessionState::Disconnected | SessionState::Terminated => Ok(()),
                }
            }
        }
    }

    async fn on_stream_open(&mut self, header: StreamHeader) -> Result<(), XmppError> {
        if self.stream.state() != SessionState::Connecting {
            return Err(XmppError::stream(StreamErrorCondition::BadFormat));
        }
        let authenticated = self.stream.flags().is_authenticated();
        if !authenticated {
            let domain = header
                .to
                .clone()
                .unwrap_or_else(|| self.ctx.hosts.default_host().to_string());
            self.stream.set_domain(&domain);
        }
        let domain = self.stream.domain();
        let id = Uuid::new_v4().to_string();
        self.write_str(&stream_header(&domain, &id, ns::JABBER_CLIENT)).await?;
        self.header_sent = true;
        self.set_read_timeout(self.config.keep_alive_timeout);

        header.validate(ns::JABBER_CLIENT).map_err(XmppError::Stream)?;
        if !self.ctx.hosts.is_local_host(&domain) {
            return Err(XmppError::stream(StreamErrorCondition::HostUnknown));
        }

        let (features, next) = if authenticated {
            (self.post_auth_features(), SessionState::Authenticated)
        } else {
            (self.pre_auth_features(), SessionState::Connected)
        };
        self.write_element(&features).await?;
        self.stream.set_state(next);
        Ok(())
    }

    fn requires_tls(&self) -> bool {
        self.transport.kind() == TransportType::Socket
            && self.config.tls_config.is_some()
            && !self.stream.flags().is_secured()
    }

    fn offered_mechanisms(&self) -> Vec<Mechanism> {
        Mechanism::offered(
            &self.config.sasl_mechanisms,
            self.transport.channel_binding().is_some(),
        )
    }

    fn pre_auth_features(&self) -> Element {
        let mut features = Element::builder("features", ns::STREAM).build();
        if self.requires_tls() {
            features.append_child(
                Element::builder("starttls", ns::TLS)
                    .append(Element::builder("required", ns::TLS).build())
                    .build(),
            );
            return features;
        }
        let mut mechanisms = Element::builder("mechanisms", ns::SASL).build();
        for mechanism in self.offered_mechanisms() {
            mechanisms.append_child(
                Element::builder("mechanism", ns::SASL)
                    .append(mechanism.name().to_string())
                    .build(),
            );
        }
        features.append_child(mechanisms);
        features
    }

    fn post_auth_features(&self) -> Element {
        let mut features = Element::builder("features", ns::STREAM).build();
        if self.transport.kind() == TransportType::Socket
            && self.config.compression_level != CompressionLevel::NoCompression
            && !self.stream.flags().is_compressed()
        {
            features.append_child(
                Element::builder("compression", ns::COMPRESS_FEATURE)
                    .append(
                        Element::builder("method", ns::COMPRESS_FEATURE)
                            .append("zlib".to_string())
                            .build(),
                    )
                    .build(),
            );
        }
        features.append_child(
            Element::builder("bind", ns::BIND)
                .append(Element::builder("required", ns::BIND).build())
                .build(),
        );
        features.append_child(
            Element::builder("session", ns::SESSION)
                .append(Element::builder("optional", ns::SESSION).build())
                .build(),
        );
        for feature in self.ctx.modules.stream_features(&self.stream.domain()) {
            features.append_child(feature);
        }
        features
    }

    async fn on_connected(&mut self, element: Element) -> Result<(), XmppError> {
        if element.is("starttls", ns::TLS) {
            return self.start_tls().await;
        }
        if element.is("auth", ns::SASL) {
            return self.start_sasl(element).await;
        }
        if element.is("iq", ns::JABBER_CLIENT)
            && element.children().any(|c| c.is("query", ns::LEGACY_AUTH))
        {
            let iq = parse_stanza(element)?;
            return self
                .write_stanza(&iq.error_reply(StanzaErrorCondition::ServiceUnavailable))
                .await;
        }
        if is_stanza(&element) {
            return Err(XmppError::stream(StreamErrorCondition::NotAuthorized));
        }
        Err(XmppError::stream(StreamErrorCondition::UnsupportedStanzaType))
    }

    async fn start_tls(&mut self) -> Result<(), XmppError> {
        let config = match self.config.tls_config.clone() {
            Some(config) if !self.stream.flags().is_secured() => config,
            _ => {
                self.write_element(&Element::builder("failure", ns::TLS).build())
                    .await?;
                self.disconnect(None).await;
                return Ok(());
            }
        };
        self.write_element(&Element::builder("proceed", ns::TLS).build())
            .await?;
        self.framer.reset();
        self.transport.start_tls(config).await?;
        self.stream.update_flags(|f| f.set_secured());
        self.stream.set_state(SessionState::Connecting);
        debug!("STARTTLS negotiated");
        Ok(())
    }

    async fn start_sasl(&mut self, element: Element) -> Result<(), XmppError> {
        if self.requires_tls() {
            return Err(XmppError::Stream(
                StreamError::new(StreamErrorCondition::PolicyViolation).with_text("TLS required"),
            ));
        }
        let requested = element.attr("mechanism").unwrap_or_default().to_string();
        let mechanism = self
            .offered_mechanisms()
            .into_iter()
            .find(|m| m.name() == requested);
        let Some(mechanism) = mechanism else {
            return self.sasl_failed(SaslError::InvalidMechanism, "unknown").await;
        };
        let domain = self.stream.domain();
        self.authenticator = Some(mechanism.authenticator(
            &domain,
            self.ctx.repository.clone(),
            self.transport.channel_binding(),
        ));
        self.stream.set_state(SessionState::Authenticating);
        self.process_sasl(element).await
    }

    async fn on_authenticating(&mut self, element: Element) -> Result<(), XmppError> {
        if element.ns() != ns::SASL {
            return Err(XmppError::stream(StreamErrorCondition::NotAuthorized));
        }
        if element.name() == "abort" {
            self.auth_aborts += 1;
            if let Some(mut authenticator) = self.authenticator.take() {
                authenticator.reset();
            }
            self.stream.set_state(SessionState::Connected);
            debug!(aborts = self.auth_aborts, "SASL exchange aborted");
            if self.auth_aborts > 1 {
                return Err(XmppError::Stream(
                    StreamError::new(StreamErrorCondition::PolicyViolation)
                        .with_text("too many aborted authentications"),
                ));
            }
            return self.write_element(&SaslError::Aborted.to_element()).await;
        }
        self.process_sasl(element).await
    }

    async fn process_sasl(&mut self, element: Element) -> Result<(), XmppError> {
        let Some(mut authenticator) = self.authenticator.take() else {
            return Err(XmppError::stream(StreamErrorCondition::NotAuthorized));
        };
        let mechanism = authenticator.mechanism();
        match authenticator.process_element(&element).await {
            Ok(reply) => {
                if let Some(reply) = reply {
                    self.write_element(&reply).await?;
                }
                if authenticator.authenticated() {
                    let username = authenticator.username().to_string();
                    authenticator.reset();
                    return self.finish_sasl(mechanism, &username);
                }
                self.authenticator = Some(authenticator);
                Ok(())
            }
            Err(err) => {
                authenticator.reset();
                self.sasl_failed(err, mechanism).await
            }
        }
    }

    async fn sasl_failed(&mut self, err: SaslError, mechanism: &str) -> Result<(), XmppError> {
        self.write_element(&err.to_element()).await?;
        self.authenticator = None;
        self.auth_failures += 1;
        self.stream.set_state(SessionState::Connected);
        metrics::record_auth_attempt(mechanism, false);
        debug!(mechanism, reason = err.reason(), failures = self.auth_failures, "SASL failure");
        if self.auth_failures >= MAX_AUTH_FAILURES {
            return Err(XmppError::Stream(
                StreamError::new(StreamErrorCondition::PolicyViolation)
                    .with_text("too many authentication failures"),
            ));
        }
        Ok(())
    }

    fn finish_sasl(&mut self, mechanism: &str, username: &str) -> Result<(), XmppError> {
        let domain = self.stream.domain();
        let jid: Jid = bare_jid(username, &domain)?.into();
        self.stream.set_username(username);
        self.stream.update_flags(|f| f.set_authenticated());
        self.auth_timer_armed = false;
        self.transport
            .set_rate_limiter(self.ctx.shapers.match_jid(&jid).rate_limiter());
        metrics::record_auth_attempt(mechanism, true);
        info!(jid = %jid, mechanism, "Authenticated");

        self.framer.reset();
        self.stream.set_state(SessionState::Connecting);
        Ok(())
    }

    async fn on_authenticated(&mut self, element: Element) -> Result<(), XmppError> {
        if element.is("compress", ns::COMPRESS) {
            return self.compress(element).await;
        }
        if element.is("iq", ns::JABBER_CLIENT) {
            let iq = parse_stanza(element)?;
            if iq.is_iq_set() && iq.has_child("bind", ns::BIND) {
                return self.bind(iq).await;
            }
            return self
                .write_stanza(&iq.error_reply(StanzaErrorCondition::NotAllowed))
                .await;
        }
        if is_stanza(&element) {
            return Err(XmppError::stream(StreamErrorCondition::NotAuthorized));
        }
        Err(XmppError::stream(StreamErrorCondition::UnsupportedStanzaType))
    }

    async fn compress(&mut self, element: Element) -> Result<(), XmppError> {
        let method = element
            .get_child("method", ns::COMPRESS)
            .map(|m| m.text())
            .unwrap_or_default();
        let failure = if self.transport.kind() != TransportType::Socket
            || self.config.compression_level == CompressionLevel::NoCompression
            || self.stream.flags().is_compressed()
        {
            Some("setup-failed")
        } else if method.trim() != "zlib" {
            Some("unsupported-method")
        } else {
            None
        };
        if let Some(reason) = failure {
            let failure = Element::builder("failure", ns::COMPRESS)
                .append(Element::builder(reason, ns::COMPRESS).build())
                .build();
            return self.write_element(&failure).await;
        }

        self.write_element(&Element::builder("compressed", ns::COMPRESS).build())
            .await?;
        self.transport
            .enable_compression(self.config.compression_level)?;
        self.stream.update_flags(|f| f.set_compressed());
        self.framer.reset();
        self.stream.set_state(SessionState::Connecting);
        debug!(level = ?self.config.compression_level, "Compression enabled");
        Ok(())
    }

    #[instrument(skip_all, fields(stream_id = %self.stream.id()))]
    async fn bind(&mut self, iq: Stanza) -> Result<(), XmppError> {
        let username = self.stream.username();
        let domain = self.stream.domain();
        let requested = iq
            .child("bind", ns::BIND)
            .and_then(|b| b.get_child("resource", ns::BIND))
            .map(|r| r.text().trim().to_string())
            .filter(|r| !r.is_empty());

        let c2s = self.ctx.router.c2s().clone();
        let existing = c2s.directory().get_all(&username);
        let shaper = self
            .ctx
            .shapers
            .match_jid(&bare_jid(&username, &domain)?.into());
        if shaper.max_sessions > 0 && existing.len() >= shaper.max_sessions {
            info!(username, max_sessions = shaper.max_sessions, "Session limit reached");
            return Err(XmppError::Stream(StreamError::reached_max_session_count()));
        }

        let resource = match requested {
            None => Uuid::new_v4().to_string(),
            Some(requested) => match existing.iter().find(|d| d.resource() == requested) {
                None => requested,
                Some(desc) => match self.config.resource_conflict {
                    ResourceConflict::Override => {
                        debug!(resource = %requested, "Resource taken, assigning a new one");
                        Uuid::new_v4().to_string()
                    }
                    ResourceConflict::TerminateOld => {
                        info!(resource = %requested, "Resource taken, disconnecting previous session");
                        if let Err(e) = c2s.disconnect(desc, StreamError::resource_conflict()).await {
                            warn!(resource = %requested, error = %e, "Failed to disconnect previous session");
                        }
                        requested
                    }
                    ResourceConflict::Disallow => {
                        debug!(resource = %requested, "Resource taken, rejecting bind");
                        return self
                            .write_stanza(&iq.error_reply(StanzaErrorCondition::Conflict))
                            .await;
                    }
                },
            },
        };
        let jid = match full_jid(&username, &domain, &resource) {
            Ok(jid) => jid,
            Err(_) => {
                return self
                    .write_stanza(&iq.error_reply(StanzaErrorCondition::BadRequest))
                    .await
            }
        };

        self.stream.set_resource(&resource);
        self.stream
            .set_presence(Stanza::presence(PresenceType::Unavailable).with_from(jid.clone()));
        self.stream.set_state(SessionState::Bound);
        c2s.bind(self.stream.id())?;
        self.stream.republish().await?;
        self.stream.update_flags(|f| f.set_bound());
        info!(jid = %jid, "Resource bound");
        self.run_stream_hook(names::C2S_STREAM_BOUND).await;

        let payload = Element::builder("bind", ns::BIND)
            .append(
                Element::builder("jid", ns::BIND)
                    .append(jid.to_string())
                    .build(),
            )
            .build();
        self.write_stanza(&iq.result_reply_with(payload)).await
    }

    async fn on_bound(&mut self, element: Element) -> Result<(), XmppError> {
        if !is_stanza(&element) {
            return Err(XmppError::stream(StreamErrorCondition::UnsupportedStanzaType));
        }
        let Some(jid) = self.stream.jid() else {
            return Err(XmppError::internal("bound stream without JID"));
        };
        let mut stanza = parse_stanza(element)?.with_from(jid.clone());
        if stanza.to().is_none() && stanza.kind() != StanzaType::Presence {
            stanza.set_to(jid.to_bare().into());
        }

        let component_target = stanza
            .to()
            .map(|to| self.ctx.router.components().is_component_host(to.domain_str()))
            .unwrap_or(false);
        if component_target {
            if let Err(e) = self.ctx.router.components().process_stanza(stanza).await {
                debug!(error = %e, "Component rejected stanza");
            }
            return Ok(());
        }

        metrics::record_stanza(&stanza.kind().to_string());
        let Some(stanza) = self
            .run_element_hook(names::C2S_STREAM_ELEMENT_RECEIVED, stanza, Vec::new())
            .await
        else {
            return Ok(());
        };
        match stanza.kind() {
            StanzaType::Iq => self.process_iq(stanza, &jid).await,
            StanzaType::Presence => self.process_presence(stanza, &jid).await,
            StanzaType::Message => self.process_message(stanza).await,
            StanzaType::Other => Ok(()),
        }
    }

    async fn process_iq(&mut self, iq: Stanza, jid: &FullJid) -> Result<(), XmppError> {
        let Some(iq) = self
            .run_element_hook(names::C2S_STREAM_IQ_RECEIVED, iq, Vec::new())
            .await
        else {
            return Ok(());
        };
        let to_account = iq
            .to()
            .map(|to| !to.is_full_with_user())
            .unwrap_or(true);

        if iq.is_iq_set() && iq.has_child("session", ns::SESSION) && to_account {
            if self.stream.flags().is_session_started() {
                return self
                    .write_stanza(&iq.error_reply(StanzaErrorCondition::NotAllowed))
                    .await;
            }
            self.stream.update_flags(|f| f.set_session_started());
            debug!(jid = %jid, "Session started");
            return self.write_stanza(&iq.result_reply()).await;
        }
        if iq.is_iq_response() && to_account {
            trace!(id = ?iq.id(), "Dropping IQ response addressed to the server");
            return Ok(());
        }
        if self.ctx.modules.is_module_iq(&iq) {
            self.ctx.modules.process_iq(&iq).await;
            return Ok(());
        }

        let Some(iq) = self
            .run_element_hook(names::C2S_STREAM_WILL_ROUTE_ELEMENT, iq, Vec::new())
            .await
        else {
            return Ok(());
        };
        if let Err(e) = self.ctx.router.route(iq.clone(), RoutingOptions::default()).await {
            if !iq.is_iq_response() {
                return self.write_stanza(&iq.error_reply(e.stanza_condition())).await;
            }
        }
        Ok(())
    }

    async fn process_presence(&mut self, presence: Stanza, jid: &FullJid) -> Result<(), XmppError> {
        let Some(presence) = self
            .run_element_hook(names::C2S_STREAM_PRESENCE_RECEIVED, presence, Vec::new())
            .await
        else {
            return Ok(());
        };
        let directed = presence
            .to()
            .map(JidExt::is_full_with_user)
            .unwrap_or(false);
        if directed {
            let routable = matches!(
                presence.presence_type(),
                Some(PresenceType::Available | PresenceType::Unavailable | PresenceType::Error)
            );
            if !routable {
                return Ok(());
            }
            let Some(presence) = self
                .run_element_hook(names::C2S_STREAM_WILL_ROUTE_ELEMENT, presence, Vec::new())
                .await
            else {
                return Ok(());
            };
            if let Err(e) = self.ctx.router.route(presence, RoutingOptions::default()).await {
                debug!(error = %e, "Directed presence not delivered");
            }
            return Ok(());
        }

        let to_self = presence
            .to()
            .map(|to| to.to_bare() == jid.to_bare())
            .unwrap_or(true);
        if to_self && (presence.is_available() || presence.is_unavailable()) {
            self.stream.set_presence(presence);
            self.stream.republish().await?;
        }
        Ok(())
    }

    async fn process_message(&mut self, message: Stanza) -> Result<(), XmppError> {
        let Some(message) = self
            .run_element_hook(names::C2S_STREAM_MESSAGE_RECEIVED, message, Vec::new())
            .await
        else {
            return Ok(());
        };
        let Some(mut message) = self
            .run_element_hook(names::C2S_STREAM_WILL_ROUTE_ELEMENT, message, Vec::new())
            .await
        else {
            return Ok(());
        };

        let options = RoutingOptions::check_user_existence();
        let mut result = self.ctx.router.route(message.clone(), options).await;
        if matches!(result, Err(RouteError::ResourceNotFound)) {
            if let Some(bare) = message.to().map(|to| Jid::from(to.to_bare())) {
                debug!(to = %bare, "Resource not found, routing to bare JID");
                message.set_to(bare);
                result = self.ctx.router.route(message.clone(), options).await;
            }
        }
        match result {
            Ok(targets) => {
                self.run_element_hook(names::C2S_STREAM_MESSAGE_ROUTED, message, targets)
                    .await;
                Ok(())
            }
            Err(_) if message.message_type() == "error" => Ok(()),
            Err(e) => self.write_stanza(&message.error_reply(e.stanza_condition())).await,
        }
    }

    /// Write a stanza routed to this stream.
    async fn deliver(&mut self, stanza: Stanza) {
        if self.send_disabled || !self.is_open() {
            trace!("Dropping stanza for a closing stream");
            return;
        }
        if let Err(e) = self.write_stanza(&stanza).await {
            self.fail(e).await;
        }
    }

    /// Close the stream. A bound stream that timed out lingers for
    /// [`DISCONNECT_GRACE`] before terminating.
    #[instrument(skip_all, fields(stream_id = %self.stream.id()))]
    async fn disconnect(&mut self, error: Option<StreamError>) {
        let state = self.stream.state();
        if matches!(state, SessionState::Disconnected | SessionState::Terminated) {
            return;
        }
        if let Err(e) = self.close_output(error.as_ref()).await {
            debug!(error = %e, "Failed to close outbound stream");
        }
        self.stream.set_state(SessionState::Disconnected);
        info!(error = ?error.as_ref().map(|e| e.to_string()), "C2S stream disconnected");
        self.run_stream_hook(names::C2S_STREAM_DISCONNECTED).await;

        let timed_out = error
            .as_ref()
            .map(|e| e.condition == StreamErrorCondition::ConnectionTimeout)
            .unwrap_or(false);
        if state == SessionState::Bound && timed_out {
            self.send_disabled = true;
            self.linger().await;
        }
        self.terminate().await;
    }

    async fn close_output(&mut self, error: Option<&StreamError>) -> Result<(), XmppError> {
        if !self.header_sent {
            let domain = self.stream.domain();
            let id = Uuid::new_v4().to_string();
            self.write_str(&stream_header(&domain, &id, ns::JABBER_CLIENT)).await?;
            self.header_sent = true;
        }
        if let Some(error) = error {
            self.write_element(&error.to_element()).await?;
        }
        self.write_str(STREAM_CLOSE).await
    }

    async fn linger(&mut self) {
        debug!(grace_ms = DISCONNECT_GRACE.as_millis() as u64, "Holding resource after timeout");
        let grace = tokio::time::sleep(DISCONNECT_GRACE);
        tokio::pin!(grace);
        loop {
            tokio::select! {
                _ = &mut grace => return,
                command = self.commands.recv() => match command {
                    Some(StreamCommand::Send(_)) => trace!("Dropping stanza during disconnect grace"),
                    Some(StreamCommand::Disconnect(_)) => {}
                    None => return,
                },
            }
        }
    }

    /// Release everything the session holds. Idempotent.
    async fn terminate(&mut self) {
        if self.stream.state() == SessionState::Terminated {
            return;
        }
        let c2s = self.ctx.router.c2s().clone();
        c2s.unregister(&self.stream);
        if self.stream.flags().is_bound() {
            let (username, resource) = (self.stream.username(), self.stream.resource());
            if let Err(e) = c2s.directory().delete(&username, &resource).await {
                warn!(error = %e, "Failed to delete resource descriptor");
            }
        }
        if let Err(e) = self.transport.close().await {
            trace!(error = %e, "Transport close failed");
        }
        self.stream.set_state(SessionState::Terminated);
        self.run_stream_hook(names::C2S_STREAM_TERMINATED).await;
        metrics::record_session_ended(self.started_at.elapsed().as_secs_f64());
        info!(jid = ?self.stream.jid().map(|j| j.to_string()), "C2S stream terminated");
        self.stream.mark_done();
    }

    fn is_open(&self) -> bool {
        !matches!(
            self.stream.state(),
            SessionState::Disconnected | SessionState::Terminated
        )
    }

    fn set_read_timeout(&mut self, timeout: Duration) {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        self.transport.set_read_deadline(deadline);
    }

    async fn run_stream_hook(&mut self, name: &str) {
        let info = StreamInfo {
            id: self.stream.id(),
            jid: self.stream.jid(),
            presence: self.stream.presence(),
        };
        let mut ctx = HookContext::new(HookInfo::Stream(info)).with_sender(self.stream.clone());
        if let Err(e) = self.ctx.hooks.run(name, &mut ctx).await {
            warn!(hook = name, error = %e, "Hook failed");
        }
    }

    /// Run a stanza hook. Returns the possibly rewritten stanza, or `None`
    /// when a handler consumed it or the chain failed.
    async fn run_element_hook(
        &mut self,
        name: &str,
        stanza: Stanza,
        targets: Vec<FullJid>,
    ) -> Option<Stanza> {
        let info = ElementInfo {
            id: Some(self.stream.id()),
            stanza,
            targets,
        };
        let mut ctx = HookContext::new(HookInfo::Element(info)).with_sender(self.stream.clone());
        match self.ctx.hooks.run(name, &mut ctx).await {
            Ok(true) => None,
            Ok(false) => match ctx.info {
                HookInfo::Element(info) => Some(info.stanza),
                _ => None,
            },
            Err(e) => {
                warn!(hook = name, error = %e, "Hook failed, dropping stanza");
                None
            }
        }
    }

    async fn write_stanza(&mut self, stanza: &Stanza) -> Result<(), XmppError> {
        self.write_element(stanza.element()).await
    }

    async fn write_element(&mut self, element: &Element) -> Result<(), XmppError> {
        let xml = element_to_string(element)?;
        trace!(xml = %xml, "SEND");
        self.write_str(&xml).await
    }

    async fn write_str(&mut self, data: &str) -> Result<(), XmppError> {
        self.transport.write(data.as_bytes()).await?;
        self.transport.flush().await
    }
}

impl std::fmt::Debug for C2sSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("C2sSession")
            .field("stream", &self.stream)
            .field("auth_failures", &self.auth_failures)
            .finish_non_exhaustive()
    }
}

fn is_stanza(element: &Element) -> bool {
    element.ns() == ns::JABBER_CLIENT
        && matches!(element.name(), "iq" | "message" | "presence")
}

fn parse_stanza(element: Element) -> Result<Stanza, XmppError> {
    Stanza::from_element(element).map_err(|e| {
        debug!(error = %e, "Invalid stanza");
        XmppError::Stream(StreamError::new(StreamErrorCondition::BadFormat).with_text(e.to_string()))
    })
}
