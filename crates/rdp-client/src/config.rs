//! Client configuration.

use std::time::Duration;

use crate::actors::TargetSelector;
use crate::bridge::codec::DEFAULT_MAX_FRAME_LENGTH;
use crate::retry::RetryPolicy;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 6000;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Minimum pause between tearing a session down and dialing again.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;
pub const DEFAULT_ACTOR_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Per-request reply timeout; also bounds connect and the intro handshake.
    pub request_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub actor_ttl: Duration,
    /// Probe interval, and also how long the link may sit idle before a probe.
    pub keepalive_interval: Duration,
    pub keepalive_enabled: bool,
    pub retry: RetryPolicy,
    pub target: TargetSelector,
    pub max_frame_length: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            actor_ttl: DEFAULT_ACTOR_TTL,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            keepalive_enabled: true,
            retry: RetryPolicy::default(),
            target: TargetSelector::default(),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    /// Defaults overridden by `RDP_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`ClientConfig::from_env`] with a custom variable source.
    /// Unparseable values are ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let millis = |key: &str| {
            lookup(key)
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
        };

        let mut config = Self::default();
        if let Some(host) = lookup("RDP_HOST").filter(|h| !h.trim().is_empty()) {
            config.host = host.trim().to_string();
        }
        if let Some(port) = lookup("RDP_PORT").and_then(|s| s.trim().parse().ok()) {
            config.port = port;
        }
        if let Some(timeout) = millis("RDP_TIMEOUT_MS") {
            config.request_timeout = timeout;
        }
        if let Some(ttl) = millis("RDP_ACTOR_TTL_MS") {
            config.actor_ttl = ttl;
        }
        match millis("RDP_KEEPALIVE_MS") {
            Some(Duration::ZERO) => config.keepalive_enabled = false,
            Some(interval) => config.keepalive_interval = interval,
            None => {}
        }
        if let Some(prefix) = lookup("RDP_TARGET_URL") {
            config.target.url_prefix = Some(prefix);
        }
        if let Some(title) = lookup("RDP_TARGET_TITLE") {
            config.target.title_contains = Some(title);
        }
        config
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_actor_ttl(mut self, ttl: Duration) -> Self {
        self.actor_ttl = ttl;
        self
    }

    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self.keepalive_enabled = true;
        self
    }

    pub fn without_keepalive(mut self) -> Self {
        self.keepalive_enabled = false;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_target(mut self, target: TargetSelector) -> Self {
        self.target = target;
        self
    }

    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }
}
