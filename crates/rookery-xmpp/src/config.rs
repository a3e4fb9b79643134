//! Server configuration types.
//!
//! Everything here deserializes with `#[serde(default)]`, so a configuration
//! file only has to name what it changes.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::types::TransportType;

/// Top-level XMPP configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct XmppServerConfig {
    /// Domain used when a stream header carries no `to`
    pub default_host: String,
    /// Locally served domains
    pub hosts: Vec<HostConfig>,
    /// Rate-limit and session-cap classes, first match wins
    pub shapers: Vec<ShaperConfig>,
    /// C2S listeners
    pub listeners: Vec<ListenerConfig>,
    /// Enabled modules and their options
    pub modules: ModulesConfig,
}

impl Default for XmppServerConfig {
    fn default() -> Self {
        Self {
            default_host: "localhost".to_string(),
            hosts: Vec::new(),
            shapers: Vec::new(),
            listeners: vec![ListenerConfig::default()],
            modules: ModulesConfig::default(),
        }
    }
}

/// A locally served domain and its TLS material.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Domain name
    pub domain: String,
    /// PEM certificate chain
    pub cert_file: Option<PathBuf>,
    /// PEM private key
    pub key_file: Option<PathBuf>,
}

/// JID matcher of a shaper.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ShaperMatching {
    /// Literal JIDs (bare or full)
    pub jid: Vec<String>,
    /// Regular expression over the JID string
    pub regex: Option<String>,
}

/// A shaper class.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShaperConfig {
    /// Class name (for logs)
    pub name: String,
    /// Concurrent sessions per account; 0 means unlimited
    pub max_sessions: usize,
    /// Bytes per second
    pub rate_limit: u64,
    /// Bucket size in bytes
    pub burst: u64,
    /// Which JIDs the class applies to
    pub matching: ShaperMatching,
}

impl Default for ShaperConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_sessions: 3,
            rate_limit: 131_072,
            burst: 65_536,
            matching: ShaperMatching::default(),
        }
    }
}

/// SASL mechanism names accepted in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaslMechanismName {
    /// PLAIN (RFC 4616)
    Plain,
    /// SCRAM-SHA-1 (+PLUS)
    #[serde(rename = "scram_sha_1")]
    ScramSha1,
    /// SCRAM-SHA-256 (+PLUS)
    #[serde(rename = "scram_sha_256")]
    ScramSha256,
    /// SCRAM-SHA-512 (+PLUS)
    #[serde(rename = "scram_sha_512")]
    ScramSha512,
    /// SCRAM-SHA3-512 (+PLUS)
    #[serde(rename = "scram_sha3_512")]
    ScramSha3_512,
}

/// SASL block of a listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SaslConfig {
    /// Offered mechanisms, in preference order
    pub mechanisms: Vec<SaslMechanismName>,
}

impl Default for SaslConfig {
    fn default() -> Self {
        Self {
            mechanisms: vec![
                SaslMechanismName::ScramSha512,
                SaslMechanismName::ScramSha256,
                SaslMechanismName::ScramSha1,
                SaslMechanismName::ScramSha3_512,
            ],
        }
    }
}

/// zlib compression level offered after authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionLevel {
    /// Compression not offered
    #[default]
    NoCompression,
    /// zlib level 6
    Default,
    /// zlib level 9
    Best,
    /// zlib level 1
    Speed,
}

impl CompressionLevel {
    /// zlib level, `None` when compression is disabled.
    pub fn zlib_level(&self) -> Option<u32> {
        match self {
            CompressionLevel::NoCompression => None,
            CompressionLevel::Default => Some(6),
            CompressionLevel::Best => Some(9),
            CompressionLevel::Speed => Some(1),
        }
    }
}

/// What to do when a bind requests a resource that is already online.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceConflict {
    /// Assign a generated resource to the new session
    #[default]
    Override,
    /// Reject the bind with `conflict`
    Disallow,
    /// Disconnect the existing session
    TerminateOld,
}

/// A C2S listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address
    pub bind_addr: String,
    /// TCP port
    pub port: u16,
    /// Transport family
    pub transport: TransportType,
    /// TLS from the first byte instead of STARTTLS
    pub direct_tls: bool,
    /// SASL options
    pub sasl: SaslConfig,
    /// Compression offered after authentication
    pub compression_level: CompressionLevel,
    /// Bind conflict policy
    pub resource_conflict: ResourceConflict,
    /// Largest accepted top-level element in bytes
    pub max_stanza_size: usize,
    /// Time allowed for the first stream header
    #[serde(with = "serde_duration")]
    pub conn_timeout: Duration,
    /// Time allowed to complete SASL
    #[serde(with = "serde_duration")]
    pub auth_timeout: Duration,
    /// Idle read timeout once the stream is open
    #[serde(with = "serde_duration")]
    pub keep_alive_timeout: Duration,
    /// Budget of one request on the session run queue
    #[serde(with = "serde_duration")]
    pub req_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 5222,
            transport: TransportType::Socket,
            direct_tls: false,
            sasl: SaslConfig::default(),
            compression_level: CompressionLevel::default(),
            resource_conflict: ResourceConflict::default(),
            max_stanza_size: 32_768,
            conn_timeout: Duration::from_secs(3),
            auth_timeout: Duration::from_secs(10),
            keep_alive_timeout: Duration::from_secs(120),
            req_timeout: Duration::from_secs(15),
        }
    }
}

/// Offline module options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Maximum queued messages per account
    pub queue_size: usize,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self { queue_size: 200 }
    }
}

/// What the ping module does when a ping goes unanswered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PingTimeoutAction {
    /// Log only
    #[default]
    None,
    /// Disconnect the stream with `connection-timeout`
    Kill,
}

/// Ping module options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PingConfig {
    /// Time to wait for a pong
    #[serde(with = "serde_duration")]
    pub ack_timeout: Duration,
    /// Idle time before a ping is sent
    #[serde(with = "serde_duration")]
    pub interval: Duration,
    /// Actively ping idle clients
    pub send_pings: bool,
    /// Action on a missed pong
    pub timeout_action: PingTimeoutAction,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(32),
            interval: Duration::from_secs(60),
            send_pings: false,
            timeout_action: PingTimeoutAction::None,
        }
    }
}

/// Version module options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VersionConfig {
    /// Include the operating system in replies
    pub show_os: bool,
}

/// Archive module options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Maximum archived messages per account
    pub queue_size: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self { queue_size: 2500 }
    }
}

/// Module block.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModulesConfig {
    /// Enabled module names
    pub enabled: Vec<String>,
    /// Offline options
    pub offline: OfflineConfig,
    /// Ping options
    pub ping: PingConfig,
    /// Version options
    pub version: VersionConfig,
    /// Archive options
    pub archive: ArchiveConfig,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            enabled: [
                "roster", "offline", "carbons", "archive", "ping", "disco", "version", "private",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            offline: OfflineConfig::default(),
            ping: PingConfig::default(),
            version: VersionConfig::default(),
            archive: ArchiveConfig::default(),
        }
    }
}

impl ModulesConfig {
    /// Whether the module called `name` is enabled.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.iter().any(|m| m == name)
    }
}

/// Durations as integer milliseconds or strings such as `500ms`, `3s`, `2m`.
pub mod serde_duration {
    use std::time::Duration;

    use serde::de::{self, Deserializer, Visitor};

    /// Parse a duration string with a unit suffix.
    pub fn parse(value: &str) -> Result<Duration, String> {
        let value = value.trim();
        let split = value
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(value.len());
        let (digits, unit) = value.split_at(split);
        let amount: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration '{}'", value))?;
        match unit.trim() {
            "" | "ms" => Ok(Duration::from_millis(amount)),
            "s" => Ok(Duration::from_secs(amount)),
            "m" => Ok(Duration::from_secs(amount * 60)),
            "h" => Ok(Duration::from_secs(amount * 3600)),
            other => Err(format!("unknown duration unit '{}'", other)),
        }
    }

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("milliseconds or a string like \"3s\"")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_millis(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_millis)
                .map_err(|_| E::custom("negative duration"))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
            parse(v).map_err(E::custom)
        }
    }

    /// Serde entry point.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        deserializer.deserialize_any(DurationVisitor)
    }
}
