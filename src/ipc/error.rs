//! Error types for the IPC broker
//!
//! Library code returns [`IpcError`]; binaries and handler closures use
//! `anyhow` for propagation and convert at the boundary.

use thiserror::Error;

/// Central error type for broker operations
#[derive(Error, Debug)]
pub enum IpcError {
    // === Protocol Errors ===
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersionMismatch { expected: u8, actual: u8 },

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage { expected: String, actual: String },

    // === Payload Errors ===
    #[error("Message payload is binary (mimetype {0})")]
    NotTextPayload(String),

    #[error("Message payload is not structured data (mimetype {0})")]
    NotStructuredPayload(String),

    #[error("Unsupported charset: {0}")]
    UnsupportedCharset(String),

    // === Security Errors ===
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Encryption error: {0}")]
    Crypto(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    // === Transport Errors ===
    #[error("Invalid connection URI: {0}")]
    InvalidUri(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout after {0:?}")]
    Timeout(std::time::Duration),

    // === Broker Errors ===
    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Queue already exists: {0}")]
    QueueExists(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Topic already exists: {0}")]
    TopicExists(String),

    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    #[error("Function already exists: {0}")]
    FunctionExists(String),

    #[error("Limit reached: {0}")]
    LimitReached(String),

    #[error("Client is in subscription mode")]
    SubscriptionMode,

    #[error("Request failed with status {status}: {message}")]
    Remote { status: String, message: String },

    // === Configuration ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Storage ===
    #[error("Write-ahead log error: {0}")]
    Wal(String),

    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Serialization ===
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias using IpcError
pub type Result<T> = std::result::Result<T, IpcError>;

impl IpcError {
    /// Errors after which the connection cannot continue
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            IpcError::ProtocolVersionMismatch { .. }
                | IpcError::MessageTooLarge { .. }
                | IpcError::MalformedMessage(_)
                | IpcError::AuthenticationFailed(_)
                | IpcError::HandshakeFailed(_)
                | IpcError::Crypto(_)
                | IpcError::ConnectionClosed
                | IpcError::Io(_)
        )
    }
}
