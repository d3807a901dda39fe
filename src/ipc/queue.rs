// Bounded and circular message queues with timed offer/poll

use crate::ipc::error::{IpcError, Result};
use crate::ipc::message::Message;
use crate::ipc::wal::WriteAheadLog;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// Longest allowed queue or topic name
pub const MAX_NAME_LEN: usize = 80;

/// Overflow behaviour of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    /// Offers wait for free capacity
    Bounded,
    /// Offers evict the oldest entry when full
    Circular,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKind::Bounded => f.write_str("bounded"),
            QueueKind::Circular => f.write_str("circular"),
        }
    }
}

impl std::str::FromStr for QueueKind {
    type Err = IpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bounded" => Ok(QueueKind::Bounded),
            "circular" => Ok(QueueKind::Circular),
            other => Err(IpcError::InvalidConfig(format!("unknown queue type: {}", other))),
        }
    }
}

/// Status map reported for a queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub name: String,
    pub exists: bool,
    #[serde(rename = "type")]
    pub kind: Option<QueueKind>,
    pub temporary: bool,
    pub durable: bool,
    pub capacity: usize,
    pub size: usize,
}

impl QueueStatus {
    pub fn missing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            exists: false,
            kind: None,
            temporary: false,
            durable: false,
            capacity: 0,
            size: 0,
        }
    }
}

/// Body of a CREATE_QUEUE request; the name travels as destination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateQueueRequest {
    pub capacity: usize,
    #[serde(rename = "type")]
    pub kind: QueueKind,
    #[serde(default)]
    pub durable: bool,
}

/// Body of a CREATE_TEMP_QUEUE request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTempQueueRequest {
    pub capacity: usize,
}

/// Result of a timed offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Accepted,
    Full,
}

/// Validate a queue or topic name: alphanumerics, `_`, `-`, `/`, at most 80 chars
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(IpcError::InvalidName(format!(
            "'{}' must be 1..={} characters",
            name, MAX_NAME_LEN
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '/'))
    {
        return Err(IpcError::InvalidName(format!(
            "'{}' may only contain alphanumerics, '_', '-' and '/'",
            name
        )));
    }
    Ok(())
}

struct QueueState {
    items: VecDeque<Message>,
    wal: Option<WriteAheadLog>,
}

/// A named message queue
///
/// Offers and polls take the queue's own lock; waiters park on the
/// `not_full` / `not_empty` notifications and re-check after every wakeup.
pub struct IpcQueue {
    name: String,
    kind: QueueKind,
    capacity: usize,
    temporary: bool,
    durable: bool,
    state: Mutex<QueueState>,
    not_empty: Notify,
    not_full: Notify,
    closed: AtomicBool,
}

impl IpcQueue {
    pub fn new(name: &str, kind: QueueKind, capacity: usize, temporary: bool) -> Result<Self> {
        validate_name(name)?;
        if capacity == 0 {
            return Err(IpcError::InvalidConfig(
                "queue capacity must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            name: name.to_string(),
            kind,
            capacity,
            temporary,
            durable: false,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(1024)),
                wal: None,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// A bounded queue journaled to `wal`, pre-filled with replayed entries
    pub fn durable(
        name: &str,
        capacity: usize,
        wal: WriteAheadLog,
        entries: VecDeque<Message>,
    ) -> Result<Self> {
        let mut queue = Self::new(name, QueueKind::Bounded, capacity, false)?;
        queue.durable = true;
        let state = queue.state.get_mut();
        state.items = entries;
        state.wal = Some(wal);
        Ok(queue)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn status(&self) -> QueueStatus {
        QueueStatus {
            name: self.name.clone(),
            exists: true,
            kind: Some(self.kind),
            temporary: self.temporary,
            durable: self.durable,
            capacity: self.capacity,
            size: self.len().await,
        }
    }

    /// Offer a message, waiting up to `timeout` (None = forever) for capacity
    ///
    /// Circular queues never wait. A journaling failure fails the offer and
    /// leaves the queue unchanged.
    pub async fn offer(&self, msg: Message, timeout: Option<Duration>) -> Result<OfferOutcome> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            self.ensure_open()?;

            {
                let mut guard = self.state.lock().await;
                let state = &mut *guard;
                let circular = self.kind == QueueKind::Circular;
                if circular || state.items.len() < self.capacity {
                    if msg.is_durable() {
                        if let Some(wal) = state.wal.as_mut() {
                            wal.append_message(&msg)?;
                        }
                    }
                    while state.items.len() >= self.capacity {
                        state.items.pop_front();
                    }
                    state.items.push_back(msg);
                    drop(guard);
                    self.not_empty.notify_waiters();
                    return Ok(OfferOutcome::Accepted);
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(OfferOutcome::Full);
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Poll the oldest unexpired message, waiting up to `timeout` (None = forever)
    ///
    /// A durable entry is acknowledged in the journal before it leaves the
    /// queue, so a failed ack leaves it in place.
    pub async fn poll(&self, timeout: Option<Duration>) -> Result<Option<Message>> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            self.ensure_open()?;

            {
                let mut guard = self.state.lock().await;
                let state = &mut *guard;
                let mut removed = false;
                while let Some(front) = state.items.front() {
                    let (id, durable, expired) = (front.id(), front.is_durable(), front.has_expired());
                    if durable {
                        if let Some(wal) = state.wal.as_mut() {
                            wal.append_ack(id)?;
                        }
                    }
                    let Some(msg) = state.items.pop_front() else {
                        break;
                    };
                    removed = true;
                    if !expired {
                        drop(guard);
                        self.not_full.notify_waiters();
                        return Ok(Some(msg));
                    }
                }
                if removed {
                    drop(guard);
                    self.not_full.notify_waiters();
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Put back a polled message that could not be delivered
    ///
    /// Returns false when the queue filled up in the meantime.
    pub(crate) async fn requeue_front(&self, msg: Message) -> Result<bool> {
        self.ensure_open()?;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.items.len() >= self.capacity {
            return Ok(false);
        }
        if msg.is_durable() {
            if let Some(wal) = state.wal.as_mut() {
                wal.append_message(&msg)?;
            }
        }
        state.items.push_front(msg);
        drop(guard);
        self.not_empty.notify_waiters();
        Ok(true)
    }

    /// Wake every waiter; later offers and polls fail with QueueNotFound
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(IpcError::QueueNotFound(self.name.clone()))
        } else {
            Ok(())
        }
    }

    /// Detach the journal so the caller can delete it
    pub(crate) async fn take_wal(&self) -> Option<WriteAheadLog> {
        self.state.lock().await.wal.take()
    }
}

impl fmt::Debug for IpcQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcQueue")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("capacity", &self.capacity)
            .field("temporary", &self.temporary)
            .field("durable", &self.durable)
            .finish()
    }
}
