// Server and client configuration

use crate::ipc::auth::Authenticator;
use crate::ipc::codec::DEFAULT_MAX_MESSAGE_SIZE;
use crate::ipc::error::{IpcError, Result};
use crate::ipc::transport::{ConnectionUri, SocketBuffers};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MAX_CONNECTIONS: usize = 20;
pub const DEFAULT_MAX_QUEUES: usize = 20;
pub const DEFAULT_MAX_TOPICS: usize = 20;
pub const MIN_MESSAGE_SIZE_LIMIT: usize = 2 * 1024;
pub const MAX_MESSAGE_SIZE_LIMIT: usize = 250 * 1024 * 1024;
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A byte size given either as a number or as a unit string ("50MB")
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ByteSize {
    Bytes(i64),
    Unit(String),
}

impl ByteSize {
    /// Resolve to a byte count; -1 keeps its "unset" meaning
    pub fn to_bytes(&self) -> Result<i64> {
        match self {
            ByteSize::Bytes(n) => Ok(*n),
            ByteSize::Unit(s) => parse_byte_size(s),
        }
    }
}

/// Parse "1024", "2KB", "50MB", "1GB" (1024-based); "-1" is passed through
pub fn parse_byte_size(s: &str) -> Result<i64> {
    let s = s.trim();
    let upper = s.to_ascii_uppercase();
    let (number, factor) = if let Some(n) = upper.strip_suffix("GB") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("MB") {
        (n, 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("KB") {
        (n, 1024)
    } else if let Some(n) = upper.strip_suffix('B') {
        (n, 1)
    } else {
        (upper.as_str(), 1)
    };
    let invalid = || IpcError::InvalidConfig(format!("invalid byte size: {}", s));
    let value: i64 = number.trim().parse().map_err(|_| invalid())?;
    if value < 0 && factor != 1 {
        return Err(invalid());
    }
    value.checked_mul(factor).ok_or_else(invalid)
}

/// Immutable server configuration
#[derive(Clone)]
pub struct ServerConfig {
    pub(crate) uri: ConnectionUri,
    pub(crate) max_connections: usize,
    pub(crate) max_message_size: usize,
    pub(crate) max_queues: usize,
    pub(crate) max_topics: usize,
    pub(crate) compress_cutoff_size: i64,
    pub(crate) encrypt: bool,
    pub(crate) log_dir: Option<PathBuf>,
    pub(crate) wal_dir: Option<PathBuf>,
    pub(crate) wal_compress: bool,
    pub(crate) wal_compact_at_start: bool,
    pub(crate) authenticator: Option<Arc<Authenticator>>,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) socket_buffers: SocketBuffers,
    pub(crate) handshake_timeout: Duration,
}

impl ServerConfig {
    /// Start from the defaults: 20 connections, queues and topics, 50MB
    /// messages, and no compression, encryption, journaling or heartbeats
    pub fn builder(uri: ConnectionUri) -> ServerConfigBuilder {
        ServerConfigBuilder {
            config: ServerConfig {
                uri,
                max_connections: DEFAULT_MAX_CONNECTIONS,
                max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
                max_queues: DEFAULT_MAX_QUEUES,
                max_topics: DEFAULT_MAX_TOPICS,
                compress_cutoff_size: -1,
                encrypt: false,
                log_dir: None,
                wal_dir: None,
                wal_compress: false,
                wal_compact_at_start: false,
                authenticator: None,
                heartbeat_interval: Duration::ZERO,
                socket_buffers: SocketBuffers::default(),
                handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            },
        }
    }

    pub fn uri(&self) -> &ConnectionUri {
        &self.uri
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Largest encoded message accepted in either direction
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn max_queues(&self) -> usize {
        self.max_queues
    }

    pub fn max_topics(&self) -> usize {
        self.max_topics
    }

    /// Payloads at least this large are compressed; negative disables it
    pub fn compress_cutoff_size(&self) -> i64 {
        self.compress_cutoff_size
    }

    pub fn encrypt(&self) -> bool {
        self.encrypt
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }

    /// Directory holding one write-ahead log per durable queue
    pub fn wal_dir(&self) -> Option<&Path> {
        self.wal_dir.as_deref()
    }

    /// Zero disables heartbeats and idle connection reaping
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Whether clients must authenticate during the handshake
    pub fn authentication_enabled(&self) -> bool {
        self.authenticator
            .as_ref()
            .map(|a| a.is_active())
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("uri", &self.uri.to_string())
            .field("max_connections", &self.max_connections)
            .field("max_message_size", &self.max_message_size)
            .field("max_queues", &self.max_queues)
            .field("max_topics", &self.max_topics)
            .field("compress_cutoff_size", &self.compress_cutoff_size)
            .field("encrypt", &self.encrypt)
            .field("wal_dir", &self.wal_dir)
            .field("authentication", &self.authentication_enabled())
            .field("heartbeat_interval", &self.heartbeat_interval)
            .finish()
    }
}

/// Builder validating a [`ServerConfig`]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Connections beyond this are closed right after accept
    pub fn max_connections(mut self, n: usize) -> Self {
        self.config.max_connections = n;
        self
    }

    /// Largest encoded message; must lie between 2KB and 250MB
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.config.max_message_size = bytes;
        self
    }

    pub fn max_queues(mut self, n: usize) -> Self {
        self.config.max_queues = n;
        self
    }

    pub fn max_topics(mut self, n: usize) -> Self {
        self.config.max_topics = n;
        self
    }

    /// Compress payloads of at least `bytes`; -1 turns compression off
    pub fn compress_cutoff_size(mut self, bytes: i64) -> Self {
        self.config.compress_cutoff_size = bytes;
        self
    }

    /// Require an encrypted session from every client
    pub fn encrypt(mut self, encrypt: bool) -> Self {
        self.config.encrypt = encrypt;
        self
    }

    /// Write the server log to a daily rolling file in `dir`
    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.log_dir = Some(dir.into());
        self
    }

    /// Journal durable queues under `dir`
    ///
    /// `compress` gzips the log files; `compact` rewrites each log at startup
    /// so it holds only the entries still queued.
    pub fn write_ahead_log(mut self, dir: impl Into<PathBuf>, compress: bool, compact: bool) -> Self {
        self.config.wal_dir = Some(dir.into());
        self.config.wal_compress = compress;
        self.config.wal_compact_at_start = compact;
        self
    }

    /// Authenticate clients against this credential store; requires `encrypt`
    pub fn authenticator(mut self, authenticator: Authenticator) -> Self {
        self.config.authenticator = Some(Arc::new(authenticator));
        self
    }

    /// Ask clients to send a HEARTBEAT this often
    ///
    /// A connection that stays silent for three intervals is closed.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Kernel socket buffer sizes; -1 keeps the system default
    pub fn socket_buffers(mut self, send: i64, receive: i64) -> Self {
        self.config.socket_buffers = SocketBuffers { send, receive };
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Validate the settings
    pub fn build(self) -> Result<ServerConfig> {
        let c = self.config;
        if c.max_connections == 0 {
            return Err(IpcError::InvalidConfig(
                "max-connections must be at least 1".to_string(),
            ));
        }
        if !(MIN_MESSAGE_SIZE_LIMIT..=MAX_MESSAGE_SIZE_LIMIT).contains(&c.max_message_size) {
            return Err(IpcError::InvalidConfig(format!(
                "max-message-size must be between {} and {} bytes, got {}",
                MIN_MESSAGE_SIZE_LIMIT, MAX_MESSAGE_SIZE_LIMIT, c.max_message_size
            )));
        }
        if c.authentication_enabled() && !c.encrypt {
            return Err(IpcError::InvalidConfig(
                "an authenticator requires encryption to be enabled".to_string(),
            ));
        }
        Ok(c)
    }
}

/// Client configuration; a cloned client reuses it for a new connection
#[derive(Clone)]
pub struct ClientConfig {
    pub(crate) uri: ConnectionUri,
    pub(crate) encrypt: bool,
    pub(crate) user_name: Option<String>,
    pub(crate) password: Option<String>,
    pub(crate) socket_buffers: SocketBuffers,
    pub(crate) handshake_timeout: Duration,
    pub(crate) max_message_size: usize,
}

impl ClientConfig {
    /// Plain, unauthenticated connection to `uri`
    pub fn new(uri: ConnectionUri) -> Self {
        Self {
            uri,
            encrypt: false,
            user_name: None,
            password: None,
            socket_buffers: SocketBuffers::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Request an encrypted session even if the server does not require one
    pub fn encrypt(mut self, encrypt: bool) -> Self {
        self.encrypt = encrypt;
        self
    }

    /// Credentials sent when the server requires authentication
    pub fn credentials(mut self, user_name: impl Into<String>, password: impl Into<String>) -> Self {
        self.user_name = Some(user_name.into());
        self.password = Some(password.into());
        self
    }

    pub fn socket_buffers(mut self, send: i64, receive: i64) -> Self {
        self.socket_buffers = SocketBuffers { send, receive };
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn uri(&self) -> &ConnectionUri {
        &self.uri
    }

    /// Configured user name; the password is never exposed
    pub fn user_name(&self) -> Option<&str> {
        self.user_name.as_deref()
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("uri", &self.uri.to_string())
            .field("encrypt", &self.encrypt)
            .field("user_name", &self.user_name)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Server options as named on the command line or in a JSON options file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ServerOptions {
    pub max_connections: Option<usize>,
    pub max_message_size: Option<ByteSize>,
    pub max_queues: Option<usize>,
    pub max_topics: Option<usize>,
    pub compress_cutoff_size: Option<ByteSize>,
    pub encrypt: bool,
    pub server_log_dir: Option<PathBuf>,
    pub write_ahead_log_dir: Option<PathBuf>,
    pub write_ahead_log_compress: bool,
    pub write_ahead_log_compact: bool,
    /// Path of a saved authenticator
    pub authenticator: Option<PathBuf>,
    pub socket_snd_buf_size: Option<ByteSize>,
    pub socket_rcv_buf_size: Option<ByteSize>,
    /// Seconds
    pub heartbeat_interval: Option<u64>,
}

impl ServerOptions {
    /// Load options from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    /// Build a validated server configuration for `uri`
    pub fn into_config(self, uri: ConnectionUri) -> Result<ServerConfig> {
        let mut builder = ServerConfig::builder(uri).encrypt(self.encrypt);

        if let Some(n) = self.max_connections {
            builder = builder.max_connections(n);
        }
        if let Some(size) = &self.max_message_size {
            let bytes = size.to_bytes()?;
            if bytes <= 0 {
                return Err(IpcError::InvalidConfig(
                    "max-message-size must be positive".to_string(),
                ));
            }
            builder = builder.max_message_size(bytes as usize);
        }
        if let Some(n) = self.max_queues {
            builder = builder.max_queues(n);
        }
        if let Some(n) = self.max_topics {
            builder = builder.max_topics(n);
        }
        if let Some(size) = &self.compress_cutoff_size {
            builder = builder.compress_cutoff_size(size.to_bytes()?);
        }
        if let Some(dir) = self.server_log_dir {
            builder = builder.log_dir(dir);
        }
        if let Some(dir) = self.write_ahead_log_dir {
            builder = builder.write_ahead_log(
                dir,
                self.write_ahead_log_compress,
                self.write_ahead_log_compact,
            );
        }
        if let Some(path) = &self.authenticator {
            builder = builder.authenticator(Authenticator::load(path)?);
        }
        let send = match &self.socket_snd_buf_size {
            Some(s) => s.to_bytes()?,
            None => -1,
        };
        let receive = match &self.socket_rcv_buf_size {
            Some(s) => s.to_bytes()?,
            None => -1,
        };
        builder = builder.socket_buffers(send, receive);
        if let Some(secs) = self.heartbeat_interval {
            builder = builder.heartbeat_interval(Duration::from_secs(secs));
        }

        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::auth::Role;

    #[test]
    fn test_parse_byte_size() {
        assert_eq!(parse_byte_size("1024").unwrap(), 1024);
        assert_eq!(parse_byte_size("2KB").unwrap(), 2048);
        assert_eq!(parse_byte_size("50MB").unwrap(), 50 * 1024 * 1024);
        assert_eq!(parse_byte_size("1gb").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_byte_size("10B").unwrap(), 10);
        assert_eq!(parse_byte_size("-1").unwrap(), -1);
        assert!(parse_byte_size("ten").is_err());
        assert!(parse_byte_size("-2MB").is_err());
        assert!(matches!(
            parse_byte_size("99999999999GB"),
            Err(IpcError::InvalidConfig(_))
        ));
        assert_eq!(parse_byte_size("8GB").unwrap(), 8 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::builder(ConnectionUri::local_port(33333))
            .build()
            .unwrap();
        assert_eq!(config.max_connections(), 20);
        assert_eq!(config.max_message_size(), 50 * 1024 * 1024);
        assert_eq!(config.max_queues(), 20);
        assert_eq!(config.max_topics(), 20);
        assert_eq!(config.compress_cutoff_size(), -1);
        assert!(!config.encrypt());
        assert!(!config.authentication_enabled());
    }

    #[test]
    fn test_message_size_range() {
        let uri = ConnectionUri::local_port(33333);
        assert!(ServerConfig::builder(uri.clone())
            .max_message_size(1024)
            .build()
            .is_err());
        assert!(ServerConfig::builder(uri.clone())
            .max_message_size(300 * 1024 * 1024)
            .build()
            .is_err());
        assert!(ServerConfig::builder(uri)
            .max_message_size(2 * 1024)
            .build()
            .is_ok());
    }

    #[test]
    fn test_authenticator_requires_encryption() {
        let mut auth = Authenticator::with_iterations(1_000);
        auth.add_credentials("tom", "123", Role::User).unwrap();
        let uri = ConnectionUri::local_port(33333);

        let err = ServerConfig::builder(uri.clone())
            .authenticator(auth.clone())
            .build();
        assert!(matches!(err, Err(IpcError::InvalidConfig(_))));

        let ok = ServerConfig::builder(uri)
            .authenticator(auth)
            .encrypt(true)
            .build()
            .unwrap();
        assert!(ok.authentication_enabled());
    }

    #[test]
    fn test_options_from_json() {
        let json = r#"{
            "max-connections": 5,
            "max-message-size": "2MB",
            "compress-cutoff-size": 1000,
            "socket-snd-buf-size": "64KB",
            "heartbeat-interval": 10
        }"#;
        let options: ServerOptions = serde_json::from_str(json).unwrap();
        let config = options
            .into_config(ConnectionUri::local_port(33333))
            .unwrap();
        assert_eq!(config.max_connections(), 5);
        assert_eq!(config.max_message_size(), 2 * 1024 * 1024);
        assert_eq!(config.compress_cutoff_size(), 1000);
        assert_eq!(config.socket_buffers.send, 64 * 1024);
        assert_eq!(config.socket_buffers.receive, -1);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_client_config_hides_password() {
        let config = ClientConfig::new(ConnectionUri::local_port(33333)).credentials("tom", "123");
        let debug = format!("{:?}", config);
        assert!(debug.contains("tom"));
        assert!(!debug.contains("123\""));
    }
}
