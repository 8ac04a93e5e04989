//! Server, client, and codec configuration.
//!
//! The server follows 12-factor style: all settings come from environment
//! variables (or a `.env` file via `dotenvy`). Clients are configured in
//! code through [`ClientConfig`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::client::reconnect::{OfflineSendPolicy, ReconnectPolicy};
use crate::error::ConfigError;

/// Default size above which a message is split (3 MiB).
pub const DEFAULT_SPLIT_THRESHOLD: usize = 3 * 1024 * 1024;

/// Default chunk size for split messages (300 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 300 * 1024;

/// Default hard limit on one encoded message (100 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Default number of split transfers one decoder stages at once.
pub const DEFAULT_MAX_PENDING_TRANSFERS: usize = 64;

/// Default time a partial transfer may go without a new chunk.
pub const DEFAULT_TRANSFER_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Message splitting limits.
///
/// These are defaults both peers must agree on, not protocol law: a
/// receiver reassembles whatever chunk size the sender chose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecConfig {
    /// Encoded length above which a message is split.
    pub split_threshold: usize,
    /// Maximum length of one chunk.
    pub chunk_size: usize,
    /// Largest encoded message accepted or produced.
    pub max_message_size: usize,
    /// Split transfers a decoder stages at once; the least recently
    /// active one is dropped to admit another.
    pub max_pending_transfers: usize,
    /// Partial transfers idle for longer than this are dropped.
    pub transfer_idle_timeout: Duration,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            split_threshold: DEFAULT_SPLIT_THRESHOLD,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_pending_transfers: DEFAULT_MAX_PENDING_TRANSFERS,
            transfer_idle_timeout: DEFAULT_TRANSFER_IDLE_TIMEOUT,
        }
    }
}

impl CodecConfig {
    /// Checks that the limits are consistent.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidCodec`] if the chunk size is zero,
    /// larger than the split threshold, or the threshold exceeds the
    /// maximum message size.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::InvalidCodec(
                "chunk size must be positive".to_string(),
            ));
        }
        if self.chunk_size > self.split_threshold {
            return Err(ConfigError::InvalidCodec(format!(
                "chunk size {} exceeds split threshold {}",
                self.chunk_size, self.split_threshold
            )));
        }
        if self.split_threshold > self.max_message_size {
            return Err(ConfigError::InvalidCodec(format!(
                "split threshold {} exceeds max message size {}",
                self.split_threshold, self.max_message_size
            )));
        }
        Ok(())
    }
}

/// Top-level server configuration.
///
/// Loaded once at startup via [`ServerConfig::from_env`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to bind the HTTP/WebSocket server to.
    pub listen_addr: SocketAddr,

    /// Message splitting limits.
    pub codec: CodecConfig,

    /// Maximum run time of one command handler.
    pub handler_timeout: Duration,

    /// Interval between WebSocket pings.
    pub heartbeat_interval: Duration,

    /// Silence after which a client is considered dead.
    pub heartbeat_timeout: Duration,

    /// Capacity of each connection's outbound frame queue.
    pub outbound_queue_capacity: usize,

    /// Directory uploaded files are written to.
    pub upload_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            codec: CodecConfig::default(),
            handler_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            outbound_queue_capacity: 1024,
            upload_dir: PathBuf::from("./uploads"),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    ///
    /// Falls back to defaults when a variable is not set or invalid.
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidListenAddr`] if `LISTEN_ADDR` is set
    /// but cannot be parsed, or [`ConfigError::InvalidCodec`] if the
    /// splitting limits are inconsistent.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let listen_addr = match std::env::var("LISTEN_ADDR") {
            Ok(value) => value
                .parse()
                .map_err(|source| ConfigError::InvalidListenAddr { value, source })?,
            Err(_) => defaults.listen_addr,
        };

        let codec = CodecConfig {
            split_threshold: parse_env("SPLIT_THRESHOLD_BYTES", defaults.codec.split_threshold),
            chunk_size: parse_env("SPLIT_CHUNK_BYTES", defaults.codec.chunk_size),
            max_message_size: parse_env("MAX_MESSAGE_BYTES", defaults.codec.max_message_size),
            max_pending_transfers: parse_env(
                "MAX_PENDING_TRANSFERS",
                defaults.codec.max_pending_transfers,
            )
            .max(1),
            transfer_idle_timeout: Duration::from_secs(parse_env(
                "TRANSFER_IDLE_TIMEOUT_SECS",
                defaults.codec.transfer_idle_timeout.as_secs(),
            )),
        };
        codec.validate()?;

        let handler_timeout = Duration::from_secs(parse_env("HANDLER_TIMEOUT_SECS", 60));
        let heartbeat_interval = Duration::from_secs(parse_env("HEARTBEAT_INTERVAL_SECS", 10));
        let heartbeat_timeout = Duration::from_secs(parse_env("HEARTBEAT_TIMEOUT_SECS", 30));
        let outbound_queue_capacity = parse_env(
            "OUTBOUND_QUEUE_CAPACITY",
            defaults.outbound_queue_capacity,
        )
        .max(1);
        let upload_dir = std::env::var("UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.upload_dir);

        Ok(Self {
            listen_addr,
            codec,
            handler_timeout,
            heartbeat_interval,
            heartbeat_timeout,
            outbound_queue_capacity,
            upload_dir,
        })
    }
}

/// Client connection settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Use `wss://` instead of `ws://`.
    pub ssl: bool,
    /// Reconnection policy; `None` disables reconnection.
    pub reconnect: Option<ReconnectPolicy>,
    /// What `send` does while the connection is re-establishing.
    pub offline: OfflineSendPolicy,
    /// Default deadline for requests that do not pass their own.
    pub request_timeout: Option<Duration>,
    /// Capacity of the inbound frame queue between reader and dispatcher.
    pub inbound_queue_capacity: usize,
    /// Message splitting limits.
    pub codec: CodecConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3000,
            ssl: false,
            reconnect: Some(ReconnectPolicy::default()),
            offline: OfflineSendPolicy::default(),
            request_timeout: None,
            inbound_queue_capacity: 256,
            codec: CodecConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Creates a configuration for `host:port` with default settings.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// WebSocket URL of the server endpoint.
    #[must_use]
    pub fn url(&self) -> String {
        let scheme = if self.ssl { "wss" } else { "ws" };
        format!("{scheme}://{}:{}/ws", self.host, self.port)
    }
}

/// Parses an environment variable as `T`, returning `default` on missing
/// or invalid values.
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn default_codec_is_valid() {
        assert!(CodecConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let cfg = CodecConfig {
            chunk_size: 0,
            ..CodecConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn chunk_larger_than_threshold_is_rejected() {
        let cfg = CodecConfig {
            split_threshold: 10,
            chunk_size: 20,
            max_message_size: 100,
            ..CodecConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn client_url_respects_ssl() {
        let mut cfg = ClientConfig::new("example.com", 8443);
        assert_eq!(cfg.url(), "ws://example.com:8443/ws");
        cfg.ssl = true;
        assert_eq!(cfg.url(), "wss://example.com:8443/ws");
    }

    #[test]
    fn parse_env_falls_back_on_missing() {
        let value: u64 = parse_env("DUPLEX_RPC_TEST_SURELY_UNSET", 17);
        assert_eq!(value, 17);
    }
}
