//! Shaper table: per-JID rate limits and session caps.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use jid::Jid;
use regex::Regex;

use crate::config::ShaperConfig;
use crate::XmppError;

/// Which JIDs a shaper applies to.
#[derive(Debug, Clone)]
pub enum JidMatcher {
    /// Every JID
    Any,
    /// Literal bare or full JIDs
    Literal(HashSet<String>),
    /// Regular expression over the full JID string
    Regex(Regex),
}

impl JidMatcher {
    /// Whether `jid` is accepted.
    pub fn matches(&self, jid: &Jid) -> bool {
        match self {
            JidMatcher::Any => true,
            JidMatcher::Literal(set) => {
                set.contains(&jid.to_string()) || set.contains(&jid.to_bare().to_string())
            }
            JidMatcher::Regex(re) => re.is_match(&jid.to_string()),
        }
    }
}

/// A rate-limit and session-cap class.
#[derive(Debug, Clone)]
pub struct Shaper {
    /// Class name
    pub name: String,
    /// Concurrent sessions per account; 0 means unlimited
    pub max_sessions: usize,
    /// Bytes per second; 0 disables throttling
    pub rate_limit: u64,
    /// Bucket size in bytes
    pub burst: u64,
    matcher: JidMatcher,
}

impl Shaper {
    /// Built-in C2S class.
    pub fn default_c2s() -> Self {
        Self {
            name: "default".to_string(),
            max_sessions: 3,
            rate_limit: 131_072,
            burst: 65_536,
            matcher: JidMatcher::Any,
        }
    }

    /// Built-in S2S class.
    pub fn default_s2s() -> Self {
        Self {
            name: "default_s2s".to_string(),
            max_sessions: 0,
            rate_limit: 262_144,
            burst: 131_072,
            matcher: JidMatcher::Any,
        }
    }

    /// Build from configuration, compiling the regex if any.
    pub fn from_config(config: &ShaperConfig) -> Result<Self, XmppError> {
        let matcher = match config.matching.regex {
            Some(ref pattern) => JidMatcher::Regex(Regex::new(pattern).map_err(|e| {
                XmppError::config(format!("shaper {}: invalid regex: {}", config.name, e))
            })?),
            None if !config.matching.jid.is_empty() => {
                JidMatcher::Literal(config.matching.jid.iter().cloned().collect())
            }
            None => JidMatcher::Any,
        };
        Ok(Self {
            name: config.name.clone(),
            max_sessions: config.max_sessions,
            rate_limit: config.rate_limit,
            burst: config.burst,
            matcher,
        })
    }

    /// Whether the class applies to `jid`.
    pub fn matches(&self, jid: &Jid) -> bool {
        self.matcher.matches(jid)
    }

    /// A fresh limiter configured from this class.
    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::new(self.rate_limit, self.burst)
    }
}

/// Ordered shaper list; the first match wins.
#[derive(Debug, Clone, Default)]
pub struct Shapers {
    shapers: Vec<Shaper>,
}

impl Shapers {
    /// Build from configuration.
    pub fn from_config(configs: &[ShaperConfig]) -> Result<Self, XmppError> {
        let shapers = configs
            .iter()
            .map(Shaper::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { shapers })
    }

    /// Append a class.
    pub fn push(&mut self, shaper: Shaper) {
        self.shapers.push(shaper);
    }

    /// First class accepting `jid`, or the built-in C2S default.
    pub fn match_jid(&self, jid: &Jid) -> Shaper {
        self.shapers
            .iter()
            .find(|s| s.matches(jid))
            .cloned()
            .unwrap_or_else(Shaper::default_c2s)
    }

    /// Class for a peer that has not authenticated yet: the first class
    /// accepting any JID, or the built-in C2S default.
    pub fn match_unauthenticated(&self) -> Shaper {
        self.shapers
            .iter()
            .find(|s| matches!(s.matcher, JidMatcher::Any))
            .cloned()
            .unwrap_or_else(Shaper::default_c2s)
    }

    /// First class accepting `jid`, or the built-in S2S default.
    pub fn match_s2s(&self, jid: &Jid) -> Shaper {
        self.shapers
            .iter()
            .find(|s| s.matches(jid))
            .cloned()
            .unwrap_or_else(Shaper::default_s2s)
    }
}

/// Token bucket applied to transport reads.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    rate_bytes_per_sec: u64,
    burst_bytes: u64,
    available: u64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Limiter with `rate` bytes/s and a bucket of `burst` bytes.
    pub fn new(rate: u64, burst: u64) -> Self {
        let burst_bytes = burst.max(1);
        Self {
            rate_bytes_per_sec: rate,
            burst_bytes,
            available: burst_bytes,
            last_refill: Instant::now(),
        }
    }

    /// Limiter that never waits.
    pub fn unlimited() -> Self {
        Self::new(0, 0)
    }

    /// Take `bytes` from the bucket at `now`; returns how long the reader
    /// must wait before consuming them.
    pub fn reserve_at(&mut self, bytes: u64, now: Instant) -> Duration {
        if self.rate_bytes_per_sec == 0 || bytes == 0 {
            self.last_refill = now;
            return Duration::ZERO;
        }

        if now > self.last_refill {
            let elapsed_ms = now.duration_since(self.last_refill).as_millis() as u64;
            if elapsed_ms > 0 {
                let added = self
                    .rate_bytes_per_sec
                    .saturating_mul(elapsed_ms)
                    .saturating_div(1000);
                self.available = self.available.saturating_add(added).min(self.burst_bytes);
                self.last_refill = now;
            }
        }

        if bytes <= self.available {
            self.available -= bytes;
            return Duration::ZERO;
        }

        let deficit = bytes - self.available;
        self.available = 0;
        let wait_ms = ((deficit as u128) * 1000 + (self.rate_bytes_per_sec as u128 - 1))
            / self.rate_bytes_per_sec as u128;
        let wait = Duration::from_millis(wait_ms.min(u64::MAX as u128) as u64);
        self.last_refill = now + wait;
        wait
    }

    /// Consume `bytes`, sleeping as needed.
    pub async fn throttle(&mut self, bytes: u64) {
        let wait = self.reserve_at(bytes, Instant::now());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}
