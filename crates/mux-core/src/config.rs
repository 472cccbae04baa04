//! Configuration for the duplex client and the runner.
//!
//! Everything is read from a single JSON file. Timing values are plain
//! millisecond integers with production defaults, so a minimal config only
//! names the endpoint.
//!
//! # Example config
//!
//! ```json
//! {
//!   "log": { "module_name": "mux_runner", "log_path": "/tmp/log" },
//!   "client": {
//!     "environment": "testnet",
//!     "heartbeat_interval_ms": 10000,
//!     "request_timeout_ms": 5000
//!   },
//!   "subscriptions": ["ticker.BTC-PERPETUAL.100ms", "book.ETH-PERPETUAL.none.10.100ms"]
//! }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MuxError;

/// Upper bound for every millisecond setting (one day).
pub const MAX_DURATION_MS: u64 = 86_400_000;

/// Named endpoint presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[serde(alias = "test")]
    Testnet,
    #[serde(alias = "prod", alias = "main")]
    Production,
}

impl Environment {
    pub fn websocket_url(&self) -> &'static str {
        match self {
            Environment::Testnet => "wss://test.deribit.com/ws/api/v2",
            Environment::Production => "wss://www.deribit.com/ws/api/v2",
        }
    }
}

/// Settings for one client connection: endpoint, timings and protocol operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Endpoint preset, used when `url` is absent.
    #[serde(default)]
    pub environment: Option<Environment>,

    /// Explicit WebSocket URL; wins over `environment`.
    #[serde(default)]
    pub url: Option<String>,

    /// Extra HTTP headers for the WebSocket handshake.
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,

    // -- Reconnect --
    /// First reconnect delay.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Reconnect delay ceiling.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Upper bound on a single connection attempt.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    // -- Liveness --
    /// Interval between heartbeats while open (`0` disables).
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Consecutive failed heartbeats that close the connection.
    #[serde(default = "default_heartbeat_max_failures")]
    pub heartbeat_max_failures: u32,

    /// Close an unused open connection after this long (`0` never closes).
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    // -- Requests --
    /// Deadline applied to every request.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    // -- Protocol operations --
    #[serde(default = "default_subscribe_method")]
    pub subscribe_method: String,

    #[serde(default = "default_unsubscribe_method")]
    pub unsubscribe_method: String,

    #[serde(default = "default_heartbeat_method")]
    pub heartbeat_method: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            environment: None,
            url: None,
            extra_headers: HashMap::new(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_max_failures: default_heartbeat_max_failures(),
            idle_timeout_ms: default_idle_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            subscribe_method: default_subscribe_method(),
            unsubscribe_method: default_unsubscribe_method(),
            heartbeat_method: default_heartbeat_method(),
        }
    }
}

impl ClientConfig {
    /// Config pointing at an explicit URL with default timings.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Resolve the endpoint URL from `url` or `environment`.
    pub fn endpoint(&self) -> Result<String, MuxError> {
        match (&self.url, self.environment) {
            (Some(url), _) => Ok(url.clone()),
            (None, Some(env)) => Ok(env.websocket_url().to_string()),
            (None, None) => Err(MuxError::Config(
                "either `url` or `environment` must be set".into(),
            )),
        }
    }

    /// Check cross-field consistency.
    pub fn validate(&self) -> Result<(), MuxError> {
        self.endpoint()?;
        if self.backoff_base_ms == 0 {
            return Err(MuxError::Config("backoff_base_ms must be > 0".into()));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(MuxError::Config(format!(
                "backoff_max_ms ({}) must be >= backoff_base_ms ({})",
                self.backoff_max_ms, self.backoff_base_ms
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(MuxError::Config("request_timeout_ms must be > 0".into()));
        }
        if self.connect_timeout_ms == 0 {
            return Err(MuxError::Config("connect_timeout_ms must be > 0".into()));
        }
        for (name, ms) in [
            ("backoff_max_ms", self.backoff_max_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("idle_timeout_ms", self.idle_timeout_ms),
        ] {
            if ms > MAX_DURATION_MS {
                return Err(MuxError::Config(format!(
                    "{name} ({ms}) must be <= {MAX_DURATION_MS}"
                )));
            }
        }
        if self.heartbeat_interval_ms > 0 && self.heartbeat_max_failures == 0 {
            return Err(MuxError::Config(
                "heartbeat_max_failures must be > 0 when heartbeats are enabled".into(),
            ));
        }
        for (name, method) in [
            ("subscribe_method", &self.subscribe_method),
            ("unsubscribe_method", &self.unsubscribe_method),
            ("heartbeat_method", &self.heartbeat_method),
        ] {
            if method.trim().is_empty() {
                return Err(MuxError::Config(format!("{name} must not be empty")));
            }
        }
        Ok(())
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// `None` when heartbeats are disabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    /// `None` when idle connections are kept forever.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }
}

/// Logging block of the runner config.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogMeta {
    pub module_name: Option<String>,
    pub log_path: Option<String>,
}

/// Top-level runner config, deserialized from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub log: Option<LogMeta>,

    pub client: ClientConfig,

    /// Channels to subscribe at startup.
    #[serde(default)]
    pub subscriptions: Vec<String>,
}

impl AppConfig {
    /// Log file prefix, defaulting to `mux_runner`.
    pub fn module_name(&self) -> String {
        self.log
            .as_ref()
            .and_then(|m| m.module_name.clone())
            .unwrap_or_else(|| "mux_runner".to_string())
    }

    pub fn log_path(&self) -> Option<String> {
        self.log.as_ref().and_then(|m| m.log_path.clone())
    }
}

/// Load, parse and validate a JSON config file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_json::from_str(&content)?;
    config.client.validate()?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Defaults (used by serde)
// ---------------------------------------------------------------------------

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

fn default_heartbeat_max_failures() -> u32 {
    2
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_subscribe_method() -> String {
    "public/subscribe".into()
}

fn default_unsubscribe_method() -> String {
    "public/unsubscribe".into()
}

fn default_heartbeat_method() -> String {
    "public/test".into()
}
