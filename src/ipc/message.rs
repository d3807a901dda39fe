// Message types exchanged between clients and the server

use crate::ipc::error::{IpcError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Mimetype marking a structured (JSON) payload
pub const MIMETYPE_STRUCTURED: &str = "application/json";
/// Mimetype used for plain text payloads
pub const MIMETYPE_TEXT: &str = "text/plain";
/// Mimetype used for raw binary payloads
pub const MIMETYPE_BINARY: &str = "application/octet-stream";
/// Default charset for text and structured payloads
pub const CHARSET_UTF8: &str = "UTF-8";

/// Kind of a message, drives routing on the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum MessageType {
    Null = 0,
    Request = 1,
    Response = 2,
    Publish = 3,
    Subscribe = 4,
    Unsubscribe = 5,
    Offer = 6,
    Poll = 7,
    CreateQueue = 8,
    CreateTempQueue = 9,
    RemoveQueue = 10,
    StatusQueue = 11,
    CreateTopic = 12,
    RemoveTopic = 13,
    StatusTopic = 14,
    ClientConfig = 15,
    DiffieHellmanKeyRequest = 16,
    Authentication = 17,
    Heartbeat = 18,
    ServerStatus = 19,
}

impl MessageType {
    /// Decode a wire type code; None for codes this version does not know
    pub fn from_u8(value: u8) -> Option<Self> {
        use MessageType::*;
        let ty = match value {
            0 => Null,
            1 => Request,
            2 => Response,
            3 => Publish,
            4 => Subscribe,
            5 => Unsubscribe,
            6 => Offer,
            7 => Poll,
            8 => CreateQueue,
            9 => CreateTempQueue,
            10 => RemoveQueue,
            11 => StatusQueue,
            12 => CreateTopic,
            13 => RemoveTopic,
            14 => StatusTopic,
            15 => ClientConfig,
            16 => DiffieHellmanKeyRequest,
            17 => Authentication,
            18 => Heartbeat,
            19 => ServerStatus,
            _ => return None,
        };
        Some(ty)
    }

    /// Types exchanged only while a connection is being set up
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            MessageType::ClientConfig
                | MessageType::DiffieHellmanKeyRequest
                | MessageType::Authentication
        )
    }

    /// Types that mutate the queue/topic registries
    pub fn requires_admin(self) -> bool {
        matches!(
            self,
            MessageType::CreateQueue
                | MessageType::RemoveQueue
                | MessageType::CreateTopic
                | MessageType::RemoveTopic
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        f.write_str(&name)
    }
}

/// Outcome carried by a response message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ResponseStatus {
    Null = 0,
    Ok = 1,
    ServerError = 2,
    BadRequest = 3,
    HandlerError = 4,
    QueueNotFound = 5,
    QueueEmpty = 6,
    QueueFull = 7,
}

impl ResponseStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        use ResponseStatus::*;
        let status = match value {
            0 => Null,
            1 => Ok,
            2 => ServerError,
            3 => BadRequest,
            4 => HandlerError,
            5 => QueueNotFound,
            6 => QueueEmpty,
            7 => QueueFull,
            _ => return None,
        };
        Some(status)
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResponseStatus::Null => "NULL",
            ResponseStatus::Ok => "OK",
            ResponseStatus::ServerError => "SERVER_ERROR",
            ResponseStatus::BadRequest => "BAD_REQUEST",
            ResponseStatus::HandlerError => "HANDLER_ERROR",
            ResponseStatus::QueueNotFound => "QUEUE_NOT_FOUND",
            ResponseStatus::QueueEmpty => "QUEUE_EMPTY",
            ResponseStatus::QueueFull => "QUEUE_FULL",
        };
        f.write_str(name)
    }
}

/// Byte counts of the three encoded sections of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MessageSize {
    pub header: usize,
    pub payload_meta: usize,
    pub payload_data: usize,
    pub total: usize,
}

/// An immutable message
///
/// Fields are only set through the constructors and `with_*` builders;
/// server and client derive new messages (responses, queue entries) from
/// existing ones instead of mutating them in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub(crate) id: Uuid,
    pub(crate) message_type: MessageType,
    pub(crate) response_status: ResponseStatus,
    pub(crate) oneway: bool,
    pub(crate) durable: bool,
    pub(crate) timestamp: i64,
    pub(crate) expires_at: Option<i64>,
    pub(crate) timeout_ms: i64,
    pub(crate) request_id: Option<String>,
    pub(crate) subject: String,
    pub(crate) destination_name: Option<String>,
    pub(crate) reply_to_queue_name: Option<String>,
    pub(crate) mimetype: String,
    pub(crate) charset: Option<String>,
    pub(crate) data: Vec<u8>,
}

impl Message {
    fn with_payload(
        subject: impl Into<String>,
        mimetype: impl Into<String>,
        charset: Option<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type: MessageType::Request,
            response_status: ResponseStatus::Null,
            oneway: false,
            durable: false,
            timestamp: now_millis(),
            expires_at: None,
            timeout_ms: -1,
            request_id: None,
            subject: subject.into(),
            destination_name: None,
            reply_to_queue_name: None,
            mimetype: mimetype.into(),
            charset,
            data,
        }
    }

    /// Create a text message with an explicit mimetype and charset
    pub fn text(
        subject: impl Into<String>,
        mimetype: impl Into<String>,
        charset: impl Into<String>,
        text: &str,
    ) -> Result<Self> {
        let charset = charset.into();
        let data = encode_text(&charset, text)?;
        Ok(Self::with_payload(subject, mimetype, Some(charset), data))
    }

    /// Create a `text/plain; UTF-8` message
    pub fn plain_text(subject: impl Into<String>, text: &str) -> Self {
        Self::with_payload(
            subject,
            MIMETYPE_TEXT,
            Some(CHARSET_UTF8.to_string()),
            text.as_bytes().to_vec(),
        )
    }

    /// Create a binary message (no charset)
    pub fn binary(subject: impl Into<String>, mimetype: impl Into<String>, data: Vec<u8>) -> Self {
        Self::with_payload(subject, mimetype, None, data)
    }

    /// Create a structured-data message serialized as JSON
    pub fn structured<T: Serialize>(subject: impl Into<String>, value: &T) -> Result<Self> {
        let data = serde_json::to_vec(value)?;
        Ok(Self::with_payload(
            subject,
            MIMETYPE_STRUCTURED,
            Some(CHARSET_UTF8.to_string()),
            data,
        ))
    }

    /// An empty control message of the given type
    pub(crate) fn control(message_type: MessageType) -> Self {
        let mut msg = Self::with_payload("", MIMETYPE_BINARY, None, Vec::new());
        msg.message_type = message_type;
        msg
    }

    /// A control message of the given type carrying a JSON body
    pub(crate) fn control_with<T: Serialize>(message_type: MessageType, body: &T) -> Result<Self> {
        let mut msg = Self::structured("", body)?;
        msg.message_type = message_type;
        Ok(msg)
    }

    /// Set an absolute expiry time
    pub fn with_expires_at(mut self, expires_at: SystemTime) -> Self {
        self.expires_at = Some(system_time_to_millis(expires_at));
        self
    }

    /// Expire the message `ttl` after its creation time
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = Some(self.timestamp + ttl.as_millis() as i64);
        self
    }

    /// Attach a caller supplied request id used for idempotency checks
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Mark the message durable
    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Set the reply-to queue name
    pub fn with_reply_to(mut self, queue_name: impl Into<String>) -> Self {
        self.reply_to_queue_name = Some(queue_name.into());
        self
    }

    // Accessors

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Status of a response; `Null` on requests
    pub fn response_status(&self) -> ResponseStatus {
        self.response_status
    }

    /// Whether the sender expects no response
    pub fn is_oneway(&self) -> bool {
        self.oneway
    }

    /// Whether a queue with a write-ahead log journals this message
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Creation time in milliseconds since the Unix epoch
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp
    }

    pub fn timestamp(&self) -> SystemTime {
        millis_to_system_time(self.timestamp)
    }

    /// Absolute expiry time, if any
    pub fn expires_at(&self) -> Option<SystemTime> {
        self.expires_at.map(millis_to_system_time)
    }

    /// Check if the message has expired
    pub fn has_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => now_millis() >= at,
            None => false,
        }
    }

    /// Caller supplied idempotency key
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// The queue, topic or function the message targets
    pub fn queue_name(&self) -> Option<&str> {
        self.destination_name.as_deref()
    }

    /// Queue the receiver should answer to
    pub fn reply_to_queue_name(&self) -> Option<&str> {
        self.reply_to_queue_name.as_deref()
    }

    pub fn payload_mimetype(&self) -> &str {
        &self.mimetype
    }

    /// Charset of a text payload; None for binary payloads
    pub fn payload_charset(&self) -> Option<&str> {
        self.charset.as_deref()
    }

    /// True when the payload carries no charset
    pub fn is_binary(&self) -> bool {
        self.charset.is_none()
    }

    pub fn is_structured(&self) -> bool {
        self.mimetype == MIMETYPE_STRUCTURED
    }

    /// Raw payload bytes, whatever the mimetype
    pub fn payload_binary(&self) -> &[u8] {
        &self.data
    }

    /// Decode the payload as text using its charset
    pub fn payload_text(&self) -> Result<String> {
        match &self.charset {
            Some(charset) => decode_text(charset, &self.data),
            None => Err(IpcError::NotTextPayload(self.mimetype.clone())),
        }
    }

    /// Decode a structured payload into a JSON value
    pub fn payload_structured(&self) -> Result<serde_json::Value> {
        self.payload_as()
    }

    /// Decode a structured payload into a typed value
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        if !self.is_structured() {
            return Err(IpcError::NotStructuredPayload(self.mimetype.clone()));
        }
        Ok(serde_json::from_slice(&self.data)?)
    }

    /// Encoded section sizes, without compression or encryption
    pub fn size(&self) -> MessageSize {
        crate::ipc::codec::message_size(self)
    }

    // Derivations used by client and server

    pub(crate) fn addressed(
        mut self,
        message_type: MessageType,
        destination: Option<&str>,
        timeout_ms: i64,
    ) -> Self {
        self.message_type = message_type;
        self.destination_name = destination.map(str::to_string);
        self.timeout_ms = timeout_ms;
        self
    }

    /// Queue wait carried by OFFER/POLL; None waits indefinitely
    pub(crate) fn wait_timeout(&self) -> Option<Duration> {
        (self.timeout_ms >= 0).then(|| Duration::from_millis(self.timeout_ms as u64))
    }

    pub(crate) fn into_oneway(mut self) -> Self {
        self.oneway = true;
        self
    }

    /// Turn a message into the response for the request with `request_id`
    pub(crate) fn into_response(mut self, request_id: Uuid, status: ResponseStatus) -> Self {
        self.id = request_id;
        self.message_type = MessageType::Response;
        self.response_status = status;
        self.oneway = false;
        self
    }

    /// An empty response for `request`
    pub(crate) fn response(request: &Message, status: ResponseStatus) -> Self {
        let mut msg = Self::control(MessageType::Response);
        msg.subject = request.subject.clone();
        msg.destination_name = request.destination_name.clone();
        msg.into_response(request.id, status)
    }

    /// A text response for `request`, used for error descriptions
    pub(crate) fn text_response(request: &Message, status: ResponseStatus, text: &str) -> Self {
        let mut msg = Self::plain_text(request.subject.clone(), text);
        msg.destination_name = request.destination_name.clone();
        msg.into_response(request.id, status)
    }

    /// A structured response for `request`
    pub(crate) fn structured_response<T: Serialize>(
        request: &Message,
        status: ResponseStatus,
        body: &T,
    ) -> Result<Self> {
        let mut msg = Self::structured(request.subject.clone(), body)?;
        msg.destination_name = request.destination_name.clone();
        Ok(msg.into_response(request.id, status))
    }

    /// Undo `into_response` for a polled entry that must go back on its queue
    pub(crate) fn into_queue_entry(mut self, entry_id: Uuid) -> Self {
        self.id = entry_id;
        self.message_type = MessageType::Offer;
        self.response_status = ResponseStatus::Null;
        self
    }

    /// Same content under a new id, so each submission is correlated on its own
    pub(crate) fn restamped(mut self) -> Self {
        self.id = Uuid::new_v4();
        self
    }

    pub(crate) fn into_published(mut self) -> Self {
        self.message_type = MessageType::Publish;
        self.oneway = true;
        self
    }

    /// Error text of a non-OK response, or the status name
    pub(crate) fn error_text(&self) -> String {
        self.payload_text()
            .ok()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| self.response_status.to_string())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}] subject={:?} status={}",
            self.message_type, self.id, self.mimetype, self.subject, self.response_status
        )
    }
}

/// Wire form of an optional wait; `-1` means forever
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> i64 {
    match timeout {
        Some(t) => t.as_millis().min(i64::MAX as u128) as i64,
        None => -1,
    }
}

pub(crate) fn now_millis() -> i64 {
    system_time_to_millis(SystemTime::now())
}

fn system_time_to_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

fn millis_to_system_time(millis: i64) -> SystemTime {
    if millis >= 0 {
        UNIX_EPOCH + Duration::from_millis(millis as u64)
    } else {
        UNIX_EPOCH - Duration::from_millis(millis.unsigned_abs())
    }
}

fn normalized_charset(charset: &str) -> String {
    charset.trim().to_ascii_uppercase().replace('_', "-")
}

fn encode_text(charset: &str, text: &str) -> Result<Vec<u8>> {
    match normalized_charset(charset).as_str() {
        "UTF-8" | "UTF8" => Ok(text.as_bytes().to_vec()),
        "US-ASCII" | "ASCII" => {
            if text.is_ascii() {
                Ok(text.as_bytes().to_vec())
            } else {
                Err(IpcError::UnsupportedCharset(format!(
                    "text is not representable in {}",
                    charset
                )))
            }
        }
        "ISO-8859-1" | "LATIN1" => text
            .chars()
            .map(|c| {
                u8::try_from(c as u32).map_err(|_| {
                    IpcError::UnsupportedCharset(format!("text is not representable in {}", charset))
                })
            })
            .collect(),
        _ => Err(IpcError::UnsupportedCharset(charset.to_string())),
    }
}

fn decode_text(charset: &str, data: &[u8]) -> Result<String> {
    match normalized_charset(charset).as_str() {
        "UTF-8" | "UTF8" | "US-ASCII" | "ASCII" => String::from_utf8(data.to_vec())
            .map_err(|e| IpcError::MalformedMessage(format!("invalid {} payload: {}", charset, e))),
        "ISO-8859-1" | "LATIN1" => Ok(data.iter().map(|&b| b as char).collect()),
        _ => Err(IpcError::UnsupportedCharset(charset.to_string())),
    }
}
