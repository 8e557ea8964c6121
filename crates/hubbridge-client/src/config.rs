//! Client configuration.
//!
//! Default values and environment variable names are kept in one place so
//! the library and any host binary agree on them.

use crate::error::{HubError, HubResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default values for every tunable.
pub mod defaults {
    /// Time to wait for a `result` frame.
    pub const RESPONSE_TIMEOUT_MS: u64 = 5_000;
    /// Interval between keepalive pings.
    pub const PING_INTERVAL_MS: u64 = 30_000;
    /// Watchdog armed after each ping.
    pub const PING_TIMEOUT_MS: u64 = 35_000;
    /// Fixed delay between reconnect attempts. 0 disables auto-reconnect.
    pub const RECONNECT_DELAY_SECS: u64 = 5;
    /// Reconnect attempts before giving up.
    pub const MAX_RETRIES: u32 = 10;
    /// Window during which registry invalidations are merged.
    pub const FETCH_DEBOUNCE_MS: u64 = 5_000;
    /// Buffered client events per subscriber.
    pub const EVENT_CAPACITY: usize = 1_000;
}

/// Environment variable names.
pub mod env_vars {
    pub const URL: &str = "HUB_URL";
    pub const ACCESS_TOKEN: &str = "HUB_ACCESS_TOKEN";
    pub const RESPONSE_TIMEOUT_MS: &str = "HUB_RESPONSE_TIMEOUT_MS";
    pub const PING_INTERVAL_MS: &str = "HUB_PING_INTERVAL_MS";
    pub const PING_TIMEOUT_MS: &str = "HUB_PING_TIMEOUT_MS";
    pub const RECONNECT_DELAY_SECS: &str = "HUB_RECONNECT_DELAY_SECS";
    pub const MAX_RETRIES: &str = "HUB_MAX_RETRIES";
    pub const CA_CERT: &str = "HUB_CA_CERT";
    pub const REJECT_UNAUTHORIZED: &str = "HUB_REJECT_UNAUTHORIZED";
}

/// TLS options for `wss://` connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsOptions {
    /// Extra CA certificate (PEM) trusted in addition to the platform roots.
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,

    /// Reject servers whose certificate does not verify.
    #[serde(default = "default_reject_unauthorized")]
    pub reject_unauthorized: bool,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            ca_cert_path: None,
            reject_unauthorized: true,
        }
    }
}

/// Hub connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// WebSocket URL of the hub (e.g. ws://homeassistant.local:8123/api/websocket)
    pub url: String,

    /// Long-lived access token
    pub access_token: String,

    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// 0 disables the keepalive monitor
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,

    /// 0 disables auto-reconnect
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_fetch_debounce_ms")]
    pub fetch_debounce_ms: u64,

    #[serde(default)]
    pub tls: TlsOptions,

    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_reject_unauthorized() -> bool {
    true
}
fn default_response_timeout_ms() -> u64 {
    defaults::RESPONSE_TIMEOUT_MS
}
fn default_ping_interval_ms() -> u64 {
    defaults::PING_INTERVAL_MS
}
fn default_ping_timeout_ms() -> u64 {
    defaults::PING_TIMEOUT_MS
}
fn default_reconnect_delay_secs() -> u64 {
    defaults::RECONNECT_DELAY_SECS
}
fn default_max_retries() -> u32 {
    defaults::MAX_RETRIES
}
fn default_fetch_debounce_ms() -> u64 {
    defaults::FETCH_DEBOUNCE_MS
}
fn default_event_capacity() -> usize {
    defaults::EVENT_CAPACITY
}

impl HubConfig {
    /// Create a config with default timings.
    pub fn new(url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            access_token: access_token.into(),
            response_timeout_ms: defaults::RESPONSE_TIMEOUT_MS,
            ping_interval_ms: defaults::PING_INTERVAL_MS,
            ping_timeout_ms: defaults::PING_TIMEOUT_MS,
            reconnect_delay_secs: defaults::RECONNECT_DELAY_SECS,
            max_retries: defaults::MAX_RETRIES,
            fetch_debounce_ms: defaults::FETCH_DEBOUNCE_MS,
            tls: TlsOptions::default(),
            event_capacity: defaults::EVENT_CAPACITY,
        }
    }

    /// Build a config from `HUB_*` environment variables.
    ///
    /// `HUB_URL` and `HUB_ACCESS_TOKEN` are required; everything else falls
    /// back to [`defaults`].
    pub fn from_env() -> HubResult<Self> {
        let url = std::env::var(env_vars::URL)
            .map_err(|_| HubError::Config(format!("{} is not set", env_vars::URL)))?;
        let token = std::env::var(env_vars::ACCESS_TOKEN)
            .map_err(|_| HubError::Config(format!("{} is not set", env_vars::ACCESS_TOKEN)))?;

        let mut config = Self::new(url, token);
        config.apply_env_overrides();
        Ok(config)
    }

    /// Override fields from any `HUB_*` variables that are set and parse.
    pub fn apply_env_overrides(&mut self) {
        fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|s| s.parse().ok())
        }

        if let Some(v) = parsed(env_vars::RESPONSE_TIMEOUT_MS) {
            self.response_timeout_ms = v;
        }
        if let Some(v) = parsed(env_vars::PING_INTERVAL_MS) {
            self.ping_interval_ms = v;
        }
        if let Some(v) = parsed(env_vars::PING_TIMEOUT_MS) {
            self.ping_timeout_ms = v;
        }
        if let Some(v) = parsed(env_vars::RECONNECT_DELAY_SECS) {
            self.reconnect_delay_secs = v;
        }
        if let Some(v) = parsed(env_vars::MAX_RETRIES) {
            self.max_retries = v;
        }
        if let Ok(path) = std::env::var(env_vars::CA_CERT) {
            self.tls.ca_cert_path = Some(PathBuf::from(path));
        }
        if let Some(v) = parsed(env_vars::REJECT_UNAUTHORIZED) {
            self.tls.reject_unauthorized = v;
        }
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_keepalive(mut self, interval: Duration, watchdog: Duration) -> Self {
        self.ping_interval_ms = interval.as_millis() as u64;
        self.ping_timeout_ms = watchdog.as_millis() as u64;
        self
    }

    pub fn with_reconnect(mut self, delay_secs: u64, max_retries: u32) -> Self {
        self.reconnect_delay_secs = delay_secs;
        self.max_retries = max_retries;
        self
    }

    pub fn with_fetch_debounce(mut self, window: Duration) -> Self {
        self.fetch_debounce_ms = window.as_millis() as u64;
        self
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }

    /// Check the URL scheme and token before any socket is opened.
    pub fn validate(&self) -> HubResult<()> {
        if !self.is_secure() && !self.url.starts_with("ws://") {
            return Err(HubError::Connection(format!(
                "unsupported URL scheme in '{}', expected ws:// or wss://",
                self.url
            )));
        }
        if self.access_token.trim().is_empty() {
            return Err(HubError::Config("access token is empty".into()));
        }
        Ok(())
    }

    pub fn is_secure(&self) -> bool {
        self.url.starts_with("wss://")
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// `None` when keepalive is disabled.
    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_ms > 0).then(|| Duration::from_millis(self.ping_interval_ms))
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn fetch_debounce(&self) -> Duration {
        Duration::from_millis(self.fetch_debounce_ms)
    }

    /// Turn an `http(s)://host[:port]` base URL into the hub's WebSocket endpoint.
    pub fn websocket_url_from_http(base: &str) -> String {
        let base = base.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        if base.ends_with("/api/websocket") {
            base
        } else {
            format!("{}/api/websocket", base)
        }
    }
}
