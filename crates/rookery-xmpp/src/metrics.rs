//! Server metrics.
//!
//! Instruments come from the global OpenTelemetry meter provider, which the
//! host binary may install. Without a provider every recording is a no-op.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: OnceLock<Meter> = OnceLock::new();
static ACTIVE_SESSIONS: AtomicI64 = AtomicI64::new(0);

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("rookery-xmpp"))
}

// ============================================================================
// Counters
// ============================================================================

/// Accepted C2S connections.
pub fn connections_accepted() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.c2s.connections.accepted")
        .with_description("Total accepted C2S connections")
        .with_unit("connection")
        .build()
}

/// Stanzas received on bound streams.
pub fn stanzas_received() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.stanzas.received")
        .with_description("Total stanzas received from bound C2S streams")
        .with_unit("stanza")
        .build()
}

/// SASL outcomes.
pub fn auth_attempts() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.auth.attempts")
        .with_description("Total SASL authentication attempts")
        .with_unit("attempt")
        .build()
}

/// Routing outcomes.
pub fn routed_stanzas() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.router.routed")
        .with_description("Total routing decisions by outcome")
        .with_unit("stanza")
        .build()
}

/// Messages queued for offline delivery.
pub fn offline_queued() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.offline.queued")
        .with_description("Total messages stored for offline delivery")
        .with_unit("message")
        .build()
}

/// Archive inserts.
pub fn archive_inserts() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.archive.inserts")
        .with_description("Total archived message copies")
        .with_unit("message")
        .build()
}

// ============================================================================
// Gauges
// ============================================================================

/// Sessions currently running on this instance.
pub fn sessions_active() -> Gauge<i64> {
    meter()
        .i64_gauge("xmpp.c2s.sessions.active")
        .with_description("Current number of C2S sessions")
        .with_unit("session")
        .build()
}

// ============================================================================
// Histograms
// ============================================================================

/// Session lifetime.
pub fn session_duration() -> Histogram<f64> {
    meter()
        .f64_histogram("xmpp.c2s.session.duration")
        .with_description("C2S session lifetime")
        .with_unit("s")
        .build()
}

// ============================================================================
// Recording helpers
// ============================================================================

/// Record an accepted connection and bump the active session gauge.
pub fn record_session_started(transport: &str) {
    connections_accepted().add(1, &[KeyValue::new("transport", transport.to_string())]);
    let active = ACTIVE_SESSIONS.fetch_add(1, Ordering::Relaxed) + 1;
    sessions_active().record(active, &[]);
}

/// Record a terminated session.
pub fn record_session_ended(duration_secs: f64) {
    let active = ACTIVE_SESSIONS.fetch_sub(1, Ordering::Relaxed) - 1;
    sessions_active().record(active.max(0), &[]);
    session_duration().record(duration_secs, &[]);
}

/// Record a stanza received from a bound stream or a remote server.
pub fn record_stanza(stanza_type: &str) {
    stanzas_received().add(1, &[KeyValue::new("type", stanza_type.to_string())]);
}

/// Record a SASL outcome.
pub fn record_auth_attempt(mechanism: &str, success: bool) {
    auth_attempts().add(
        1,
        &[
            KeyValue::new("mechanism", mechanism.to_string()),
            KeyValue::new("result", if success { "success" } else { "failure" }),
        ],
    );
}

/// Record a routing outcome (`delivered`, `user_not_available`, ...).
pub fn record_route(outcome: &str) {
    routed_stanzas().add(1, &[KeyValue::new("outcome", outcome.to_string())]);
}

/// Record an offline enqueue.
pub fn record_offline_queued() {
    offline_queued().add(1, &[]);
}

/// Record an archive insert.
pub fn record_archive_insert() {
    archive_inserts().add(1, &[]);
}
