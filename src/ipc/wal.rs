//! Write-ahead log for durable queues.
//!
//! Every durable queue owns one append-only journal file. Accepted durable
//! offers are written to the journal before they are acknowledged, and
//! every poll of a journaled entry appends an acknowledgement so a replay
//! never resurrects consumed entries.
//!
//! # Record Format
//!
//! ```text
//! +-----------+--------------+----------------+
//! | kind (1B) | length (4B)  | body (N bytes) |
//! +-----------+--------------+----------------+
//! ```
//!
//! - kind `1`: queue config, JSON `{"name", "capacity"}`
//! - kind `2`: message, an encoded message frame
//! - kind `3`: acknowledgement, the 16-byte id of the consumed message
//!
//! Bit `0x80` of the kind marks a gzip-compressed body. A truncated final
//! record (torn write) ends the replay.
//!
//! Compaction rewrites a journal so that it holds only the config record
//! and the unconsumed messages. It runs at server start only.

use crate::ipc::codec::{compress, decompress, FrameCodec};
use crate::ipc::config::MAX_MESSAGE_SIZE_LIMIT;
use crate::ipc::error::{IpcError, Result};
use crate::ipc::message::Message;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const WAL_EXTENSION: &str = "wal";

const KIND_CONFIG: u8 = 1;
const KIND_DATA: u8 = 2;
const KIND_ACK: u8 = 3;
const COMPRESSED: u8 = 0x80;

/// Queue settings stored at the start of every journal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalQueueConfig {
    pub name: String,
    pub capacity: usize,
}

/// Journal state reconstructed from disk
#[derive(Debug)]
pub struct ReplayedQueue {
    pub config: WalQueueConfig,
    pub entries: VecDeque<Message>,
}

/// Single-writer append-only journal of one durable queue
pub struct WriteAheadLog {
    path: PathBuf,
    writer: BufWriter<File>,
    compress: bool,
    codec: FrameCodec,
}

impl WriteAheadLog {
    /// Start a fresh journal for a new durable queue
    pub fn create(dir: &Path, config: &WalQueueConfig, compress: bool) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(file_name_for(&config.name));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        let mut wal = Self::from_file(path, file, compress);
        let body = serde_json::to_vec(config)?;
        wal.write_record(KIND_CONFIG, &body)?;
        wal.flush()?;
        Ok(wal)
    }

    /// Reopen an existing journal for appending
    pub fn open(path: &Path, compress: bool) -> Result<Self> {
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self::from_file(path.to_path_buf(), file, compress))
    }

    fn from_file(path: PathBuf, file: File, compress: bool) -> Self {
        Self {
            path,
            writer: BufWriter::new(file),
            compress,
            codec: FrameCodec::new(MAX_MESSAGE_SIZE_LIMIT, -1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Journal an accepted message
    pub fn append_message(&mut self, msg: &Message) -> Result<()> {
        let mut frame = BytesMut::new();
        self.codec.encode_frame(msg, &mut frame)?;
        self.write_record(KIND_DATA, &frame)?;
        self.flush()
    }

    /// Journal the removal of a message
    pub fn append_ack(&mut self, id: Uuid) -> Result<()> {
        self.write_record(KIND_ACK, id.as_bytes())?;
        self.flush()
    }

    /// Delete the journal file
    pub fn remove(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_record(&mut self, kind: u8, body: &[u8]) -> Result<()> {
        let (kind, body) = if self.compress && kind != KIND_CONFIG {
            (kind | COMPRESSED, std::borrow::Cow::Owned(compress(body)?))
        } else {
            (kind, std::borrow::Cow::Borrowed(body))
        };
        self.writer
            .write_all(&[kind])
            .and_then(|_| self.writer.write_all(&(body.len() as u32).to_be_bytes()))
            .and_then(|_| self.writer.write_all(&body))
            .map_err(|e| IpcError::Wal(format!("{}: {}", self.path.display(), e)))
    }

    /// Push buffered records to the device; an acknowledged offer must survive a crash
    fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .and_then(|_| self.writer.get_ref().sync_data())
            .map_err(|e| IpcError::Wal(format!("{}: {}", self.path.display(), e)))
    }
}

/// Replay a journal and return its unconsumed, unexpired messages
pub fn replay(path: &Path) -> Result<ReplayedQueue> {
    let codec = FrameCodec::new(MAX_MESSAGE_SIZE_LIMIT, -1);
    let mut reader = BufReader::new(File::open(path)?);
    let mut config: Option<WalQueueConfig> = None;
    let mut entries: VecDeque<Message> = VecDeque::new();

    while let Some((kind, body)) = read_record(&mut reader)? {
        let body = if kind & COMPRESSED != 0 {
            decompress(&body, MAX_MESSAGE_SIZE_LIMIT)?
        } else {
            body
        };
        match kind & !COMPRESSED {
            KIND_CONFIG => config = Some(serde_json::from_slice(&body)?),
            KIND_DATA => entries.push_back(codec.decode_frame(&body)?),
            KIND_ACK => {
                let id = Uuid::from_slice(&body)
                    .map_err(|e| IpcError::Wal(format!("invalid ack record: {}", e)))?;
                if let Some(pos) = entries.iter().position(|m| m.id() == id) {
                    entries.remove(pos);
                }
            }
            other => {
                return Err(IpcError::Wal(format!(
                    "{}: unknown record kind {}",
                    path.display(),
                    other
                )))
            }
        }
    }

    let config = config
        .ok_or_else(|| IpcError::Wal(format!("{}: missing config record", path.display())))?;

    let before = entries.len();
    entries.retain(|m| !m.has_expired());
    if entries.len() != before {
        debug!(
            "Dropped {} expired entries while replaying {}",
            before - entries.len(),
            path.display()
        );
    }

    Ok(ReplayedQueue { config, entries })
}

/// Rewrite a journal so it holds only the live messages
pub fn compact(path: &Path, compress: bool) -> Result<ReplayedQueue> {
    let replayed = replay(path)?;
    let dir = path
        .parent()
        .ok_or_else(|| IpcError::Wal(format!("{}: no parent directory", path.display())))?;

    let tmp_dir = dir.join(".compact");
    let mut wal = WriteAheadLog::create(&tmp_dir, &replayed.config, compress)?;
    for msg in &replayed.entries {
        wal.append_message(msg)?;
    }
    let tmp_path = wal.path().to_path_buf();
    drop(wal);

    std::fs::rename(&tmp_path, path)?;
    let _ = std::fs::remove_dir(&tmp_dir);

    info!(
        "Compacted write-ahead log {} ({} live entries)",
        path.display(),
        replayed.entries.len()
    );
    Ok(replayed)
}

/// All journal files in `dir`
pub fn discover(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(WAL_EXTENSION) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Journal file name; '/' is not allowed on disk and '.' never occurs in
/// queue names, so the mapping stays unique
pub fn file_name_for(queue_name: &str) -> String {
    format!("{}.{}", queue_name.replace('/', "."), WAL_EXTENSION)
}

fn read_record<R: Read>(reader: &mut R) -> Result<Option<(u8, Vec<u8>)>> {
    let mut head = [0u8; 5];
    match read_full(reader, &mut head)? {
        0 => return Ok(None),
        n if n < head.len() => {
            warn!("Ignoring truncated write-ahead log record header");
            return Ok(None);
        }
        _ => {}
    }
    let len = u32::from_be_bytes([head[1], head[2], head[3], head[4]]) as usize;
    if len > MAX_MESSAGE_SIZE_LIMIT {
        return Err(IpcError::Wal(format!("record of {} bytes exceeds limit", len)));
    }
    let mut body = vec![0u8; len];
    if read_full(reader, &mut body)? < len {
        warn!("Ignoring truncated write-ahead log record");
        return Ok(None);
    }
    Ok(Some((head[0], body)))
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
