//! Message codec for framing broker messages
//!
//! Every message travels as one frame made of three sections. The header
//! carries routing and control fields, the payload metadata describes the
//! payload and the transforms applied to it, and the payload data holds
//! the (possibly compressed, possibly encrypted) bytes.
//!
//! ## Frame Format (version 1, big-endian)
//!
//! ```text
//! +-----------------+-------------+----------------+--------------+--------------+
//! | frame_len (4B)  | version (1B)| header_len (4B)| meta_len (4B)| data_len (4B)|
//! +-----------------+-------------+----------------+--------------+--------------+
//! | header section  | payload metadata section     | payload data section        |
//! +-----------------+------------------------------+-----------------------------+
//! ```
//!
//! Header: `type u8 | status u8 | flags u8 | id [16] | timestamp i64 |
//! expires_at i64 | timeout_ms i64 | request_id str? | subject str |
//! destination str? | reply_to str?`
//!
//! Metadata: `transforms u8 | mimetype str | charset str?`
//!
//! Strings are a `u16` length followed by UTF-8 bytes; `0xFFFF` marks an
//! absent optional string.
//!
//! Payload data is compressed first and encrypted second; the decoder
//! reverses the transforms in the opposite order.

use crate::ipc::crypto::SessionCipher;
use crate::ipc::error::{IpcError, Result};
use crate::ipc::message::{Message, MessageSize, MessageType, ResponseStatus};
use bytes::{Buf, BufMut, BytesMut};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

/// Current wire protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed preamble: frame length, version and the three section lengths
pub const PREAMBLE_LEN: usize = 4 + 1 + 4 + 4 + 4;

/// Default maximum message size (50 MB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

const FLAG_ONEWAY: u8 = 0x01;
const FLAG_DURABLE: u8 = 0x02;

const TRANSFORM_GZIP: u8 = 0x01;
const TRANSFORM_ENCRYPTED: u8 = 0x02;

const ABSENT: u16 = 0xFFFF;
const MAX_STR_LEN: usize = (ABSENT - 1) as usize;

/// Codec for encoding and decoding broker messages
///
/// This codec handles:
/// - Length-prefix framing and version validation
/// - The `max_message_size` limit in both directions
/// - Payload compression above the cutoff size
/// - Payload encryption once a session cipher is installed
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_message_size: usize,
    compress_cutoff_size: i64,
    cipher: Option<Arc<SessionCipher>>,
}

impl FrameCodec {
    /// Create a codec; a negative cutoff disables compression
    pub fn new(max_message_size: usize, compress_cutoff_size: i64) -> Self {
        Self {
            max_message_size,
            compress_cutoff_size,
            cipher: None,
        }
    }

    /// Encrypt all subsequent payloads with the given cipher
    pub fn set_cipher(&mut self, cipher: Arc<SessionCipher>) {
        self.cipher = Some(cipher);
    }

    pub fn is_encrypting(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn set_compress_cutoff_size(&mut self, cutoff: i64) {
        self.compress_cutoff_size = cutoff;
    }

    pub fn set_max_message_size(&mut self, max: usize) {
        self.max_message_size = max;
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Encode a complete frame into `dst`
    pub fn encode_frame(&self, msg: &Message, dst: &mut BytesMut) -> Result<MessageSize> {
        let logical = message_size(msg);
        if logical.total > self.max_message_size {
            return Err(IpcError::MessageTooLarge {
                size: logical.total,
                max: self.max_message_size,
            });
        }

        let mut header = BytesMut::with_capacity(logical.header);
        encode_header(msg, &mut header)?;

        let mut transforms = 0u8;
        let mut data = std::borrow::Cow::Borrowed(msg.data.as_slice());

        if self.compress_cutoff_size >= 0 && data.len() as i64 > self.compress_cutoff_size {
            data = std::borrow::Cow::Owned(compress(&data)?);
            transforms |= TRANSFORM_GZIP;
        }
        if let Some(cipher) = &self.cipher {
            data = std::borrow::Cow::Owned(cipher.encrypt(&data, &header)?);
            transforms |= TRANSFORM_ENCRYPTED;
        }

        let mut meta = BytesMut::with_capacity(logical.payload_meta);
        encode_meta(msg, transforms, &mut meta)?;

        let size = MessageSize {
            header: PREAMBLE_LEN + header.len(),
            payload_meta: meta.len(),
            payload_data: data.len(),
            total: PREAMBLE_LEN + header.len() + meta.len() + data.len(),
        };
        if size.total > self.max_message_size {
            return Err(IpcError::MessageTooLarge {
                size: size.total,
                max: self.max_message_size,
            });
        }

        dst.reserve(size.total);
        dst.put_u32((size.total - 4) as u32);
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u32(header.len() as u32);
        dst.put_u32(meta.len() as u32);
        dst.put_u32(data.len() as u32);
        dst.put_slice(&header);
        dst.put_slice(&meta);
        dst.put_slice(&data);

        Ok(size)
    }

    /// Decode one complete frame (including its length prefix)
    pub fn decode_frame(&self, frame: &[u8]) -> Result<Message> {
        if frame.len() < PREAMBLE_LEN {
            return Err(IpcError::MalformedMessage(format!(
                "frame too small: {} bytes",
                frame.len()
            )));
        }
        let mut buf = frame;
        let frame_len = buf.get_u32() as usize;
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(IpcError::ProtocolVersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: version,
            });
        }
        let header_len = buf.get_u32() as usize;
        let meta_len = buf.get_u32() as usize;
        let data_len = buf.get_u32() as usize;

        if frame_len + 4 != frame.len()
            || PREAMBLE_LEN + header_len + meta_len + data_len != frame.len()
        {
            return Err(IpcError::MalformedMessage(format!(
                "section lengths {}+{}+{} do not match frame length {}",
                header_len, meta_len, data_len, frame_len
            )));
        }

        let (header, rest) = buf.split_at(header_len);
        let (meta, data) = rest.split_at(meta_len);

        let mut msg = decode_header(header)?;
        let transforms = decode_meta(meta, &mut msg)?;

        let mut payload = data.to_vec();
        if transforms & TRANSFORM_ENCRYPTED != 0 {
            let cipher = self.cipher.as_ref().ok_or_else(|| {
                IpcError::Crypto("received encrypted payload without a session key".to_string())
            })?;
            payload = cipher.decrypt(&payload, header)?;
        }
        if transforms & TRANSFORM_GZIP != 0 {
            payload = decompress(&payload, self.max_message_size)?;
        }
        msg.data = payload;

        Ok(msg)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE, -1)
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = IpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        // Need at least the length prefix
        if src.len() < 4 {
            return Ok(None);
        }

        // Peek at the length (don't consume yet)
        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let total = u32::from_be_bytes(length_bytes) as usize + 4;

        if total < PREAMBLE_LEN {
            return Err(IpcError::MalformedMessage(format!(
                "frame too small: {} bytes",
                total
            )));
        }
        if total > self.max_message_size {
            return Err(IpcError::MessageTooLarge {
                size: total,
                max: self.max_message_size,
            });
        }

        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let frame = src.split_to(total);
        self.decode_frame(&frame).map(Some)
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = IpcError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        self.encode_frame(&item, dst).map(|_| ())
    }
}

/// Section sizes of a message encoded without compression or encryption
pub fn message_size(msg: &Message) -> MessageSize {
    let header = 3
        + 16
        + 8 * 3
        + opt_str_len(msg.request_id.as_deref())
        + 2
        + msg.subject.len()
        + opt_str_len(msg.destination_name.as_deref())
        + opt_str_len(msg.reply_to_queue_name.as_deref());
    let meta = 1 + 2 + msg.mimetype.len() + opt_str_len(msg.charset.as_deref());
    let data = msg.data.len();

    MessageSize {
        header: PREAMBLE_LEN + header,
        payload_meta: meta,
        payload_data: data,
        total: PREAMBLE_LEN + header + meta + data,
    }
}

fn opt_str_len(s: Option<&str>) -> usize {
    2 + s.map(str::len).unwrap_or(0)
}

fn encode_header(msg: &Message, buf: &mut BytesMut) -> Result<()> {
    let mut flags = 0u8;
    if msg.oneway {
        flags |= FLAG_ONEWAY;
    }
    if msg.durable {
        flags |= FLAG_DURABLE;
    }

    buf.put_u8(msg.message_type as u8);
    buf.put_u8(msg.response_status as u8);
    buf.put_u8(flags);
    buf.put_slice(msg.id.as_bytes());
    buf.put_i64(msg.timestamp);
    buf.put_i64(msg.expires_at.unwrap_or(-1));
    buf.put_i64(msg.timeout_ms);
    put_opt_str(buf, msg.request_id.as_deref())?;
    put_str(buf, &msg.subject)?;
    put_opt_str(buf, msg.destination_name.as_deref())?;
    put_opt_str(buf, msg.reply_to_queue_name.as_deref())?;
    Ok(())
}

fn encode_meta(msg: &Message, transforms: u8, buf: &mut BytesMut) -> Result<()> {
    buf.put_u8(transforms);
    put_str(buf, &msg.mimetype)?;
    put_opt_str(buf, msg.charset.as_deref())?;
    Ok(())
}

fn decode_header(mut buf: &[u8]) -> Result<Message> {
    ensure_remaining(buf, 3 + 16 + 24, "header")?;

    let type_code = buf.get_u8();
    let message_type = MessageType::from_u8(type_code)
        .ok_or_else(|| IpcError::MalformedMessage(format!("unknown message type {}", type_code)))?;
    let status_code = buf.get_u8();
    let response_status = ResponseStatus::from_u8(status_code).ok_or_else(|| {
        IpcError::MalformedMessage(format!("unknown response status {}", status_code))
    })?;
    let flags = buf.get_u8();

    let mut id = [0u8; 16];
    buf.copy_to_slice(&mut id);
    let timestamp = buf.get_i64();
    let expires_at = buf.get_i64();
    let timeout_ms = buf.get_i64();

    let request_id = get_opt_str(&mut buf)?;
    let subject = get_str(&mut buf)?;
    let destination_name = get_opt_str(&mut buf)?;
    let reply_to_queue_name = get_opt_str(&mut buf)?;

    if buf.has_remaining() {
        return Err(IpcError::MalformedMessage(format!(
            "{} trailing header bytes",
            buf.remaining()
        )));
    }

    Ok(Message {
        id: Uuid::from_bytes(id),
        message_type,
        response_status,
        oneway: flags & FLAG_ONEWAY != 0,
        durable: flags & FLAG_DURABLE != 0,
        timestamp,
        expires_at: (expires_at >= 0).then_some(expires_at),
        timeout_ms,
        request_id,
        subject,
        destination_name,
        reply_to_queue_name,
        mimetype: String::new(),
        charset: None,
        data: Vec::new(),
    })
}

fn decode_meta(mut buf: &[u8], msg: &mut Message) -> Result<u8> {
    ensure_remaining(buf, 1, "payload metadata")?;
    let transforms = buf.get_u8();
    msg.mimetype = get_str(&mut buf)?;
    msg.charset = get_opt_str(&mut buf)?;
    if buf.has_remaining() {
        return Err(IpcError::MalformedMessage(format!(
            "{} trailing metadata bytes",
            buf.remaining()
        )));
    }
    Ok(transforms)
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<()> {
    if s.len() > MAX_STR_LEN {
        return Err(IpcError::MalformedMessage(format!(
            "header string too long: {} bytes",
            s.len()
        )));
    }
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_opt_str(buf: &mut BytesMut, s: Option<&str>) -> Result<()> {
    match s {
        Some(s) => put_str(buf, s),
        None => {
            buf.put_u16(ABSENT);
            Ok(())
        }
    }
}

fn get_opt_str(buf: &mut &[u8]) -> Result<Option<String>> {
    ensure_remaining(buf, 2, "string length")?;
    let len = buf.get_u16();
    if len == ABSENT {
        return Ok(None);
    }
    read_utf8(buf, len as usize).map(Some)
}

fn get_str(buf: &mut &[u8]) -> Result<String> {
    get_opt_str(buf)?
        .ok_or_else(|| IpcError::MalformedMessage("missing required string".to_string()))
}

fn read_utf8(buf: &mut &[u8], len: usize) -> Result<String> {
    ensure_remaining(buf, len, "string")?;
    let (s, rest) = buf.split_at(len);
    let s = std::str::from_utf8(s)
        .map_err(|e| IpcError::MalformedMessage(format!("invalid UTF-8 string: {}", e)))?
        .to_string();
    *buf = rest;
    Ok(s)
}

fn ensure_remaining(buf: &[u8], needed: usize, what: &str) -> Result<()> {
    if buf.len() < needed {
        return Err(IpcError::MalformedMessage(format!(
            "truncated {}: need {} bytes, have {}",
            what,
            needed,
            buf.len()
        )));
    }
    Ok(())
}

pub(crate) fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub(crate) fn decompress(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| IpcError::MalformedMessage(format!("invalid compressed payload: {}", e)))?;
    if out.len() > limit {
        return Err(IpcError::MessageTooLarge {
            size: out.len(),
            max: limit,
        });
    }
    Ok(out)
}
