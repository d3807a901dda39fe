// IPC client: one connection, many concurrent requests

use crate::ipc::codec::{message_size, FrameCodec};
use crate::ipc::config::ClientConfig;
use crate::ipc::error::{IpcError, Result};
use crate::ipc::handshake::{self, ServerSettings};
use crate::ipc::message::{timeout_millis, Message, MessageType, ResponseStatus};
use crate::ipc::queue::{CreateQueueRequest, CreateTempQueueRequest, QueueKind, QueueStatus};
use crate::ipc::server::ServerStatus;
use crate::ipc::topic::TopicStatus;
use crate::ipc::transport::IpcStream;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use uuid::Uuid;

type PendingMap = Arc<Mutex<HashMap<Uuid, oneshot::Sender<Message>>>>;

/// Callback invoked for every message published to a subscribed topic
pub type SubscriptionHandler = Arc<dyn Fn(Message) + Send + Sync>;

type SubscriptionMap = Arc<Mutex<HashMap<String, Vec<(SubscriptionId, SubscriptionHandler)>>>>;

/// Handle returned by [`Client::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A response that has not arrived yet
///
/// Completed by the client's reader when the matching response comes in.
/// Dropping it only forgets the local pending entry; the server may still
/// process the request.
pub struct ResponseFuture {
    id: Uuid,
    rx: oneshot::Receiver<Message>,
    pending: PendingMap,
}

impl ResponseFuture {
    /// Id of the request this future answers
    pub fn request_id(&self) -> Uuid {
        self.id
    }

    /// Wait up to `timeout` (None = forever) for the response
    pub async fn wait(self, timeout: Option<Duration>) -> Result<Message> {
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, self)
                .await
                .map_err(|_| IpcError::Timeout(timeout))?,
            None => self.await,
        }
    }
}

impl Future for ResponseFuture {
    type Output = Result<Message>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| IpcError::ConnectionClosed))
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

/// A connection to an IPC server
///
/// Safe to share between tasks; requests are multiplexed over the single
/// connection by message id.
pub struct Client {
    config: ClientConfig,
    settings: ServerSettings,
    tx: mpsc::UnboundedSender<Message>,
    pending: PendingMap,
    subscriptions: SubscriptionMap,
    next_subscription: AtomicU64,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    /// Connect and run the handshake
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let stream = IpcStream::connect(&config.uri, config.socket_buffers).await?;
        let codec = FrameCodec::new(config.max_message_size, -1);
        let mut framed = Framed::new(stream, codec);
        let settings = handshake::connect(&mut framed, &config).await?;

        let (mut sink, mut frames) = framed.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let (publish_tx, mut publish_rx) = mpsc::unbounded_channel::<Message>();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let subscriptions: SubscriptionMap = Arc::new(Mutex::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));
        let mut tasks = Vec::new();

        let writer_running = running.clone();
        let writer_pending = pending.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let id = msg.id();
                match sink.send(msg).await {
                    Ok(()) => {}
                    Err(e @ IpcError::MessageTooLarge { .. }) => {
                        warn!("Dropping message {}: {}", id, e);
                        writer_pending.lock().remove(&id);
                    }
                    Err(e) => {
                        warn!("Failed to write message: {}", e);
                        break;
                    }
                }
            }
            writer_running.store(false, Ordering::SeqCst);
        }));

        let reader_pending = pending.clone();
        let reader_running = running.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(msg) => match msg.message_type() {
                        MessageType::Response => {
                            let waiter = reader_pending.lock().remove(&msg.id());
                            match waiter {
                                Some(waiter) => {
                                    let _ = waiter.send(msg);
                                }
                                None => debug!("Discarding unmatched response {}", msg.id()),
                            }
                        }
                        MessageType::Publish => {
                            let _ = publish_tx.send(msg);
                        }
                        other => warn!("Ignoring unexpected {} message", other),
                    },
                    Err(e) if e.is_connection_fatal() => {
                        warn!("Connection error: {}", e);
                        break;
                    }
                    Err(e) => warn!("Discarding unreadable message: {}", e),
                }
            }
            reader_running.store(false, Ordering::SeqCst);
            // Dropped senders fail every waiter with ConnectionClosed
            reader_pending.lock().clear();
        }));

        let dispatch_subscriptions = subscriptions.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(msg) = publish_rx.recv().await {
                let topic = msg.queue_name().unwrap_or_default().to_string();
                let handlers: Vec<SubscriptionHandler> = dispatch_subscriptions
                    .lock()
                    .get(&topic)
                    .map(|subs| subs.iter().map(|(_, h)| h.clone()).collect())
                    .unwrap_or_default();
                if handlers.is_empty() {
                    continue;
                }
                // Callbacks may block; keep them off the runtime's worker threads
                let delivery = tokio::task::spawn_blocking(move || {
                    for handler in handlers {
                        let msg = msg.clone();
                        if std::panic::catch_unwind(AssertUnwindSafe(|| handler(msg))).is_err() {
                            warn!("Subscription handler for {} panicked", topic);
                        }
                    }
                });
                if delivery.await.is_err() {
                    break;
                }
            }
        }));

        let interval = settings.heartbeat_interval();
        if !interval.is_zero() {
            let heartbeat_tx = tx.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let beat = Message::control(MessageType::Heartbeat).into_oneway();
                    if heartbeat_tx.send(beat).is_err() {
                        break;
                    }
                }
            }));
        }

        info!("Connected to {}", config.uri);
        Ok(Self {
            config,
            settings,
            tx,
            pending,
            subscriptions,
            next_subscription: AtomicU64::new(1),
            running,
            tasks: Mutex::new(tasks),
        })
    }

    /// Open a second, independent connection with the same configuration
    pub async fn clone_client(&self) -> Result<Self> {
        Self::connect(self.config.clone()).await
    }

    /// Configuration this client connected with
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Settings announced by the server during the handshake
    pub fn server_settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// False once the connection has closed, from either side
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Close the connection; outstanding requests fail with ConnectionClosed
    pub fn close(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            debug!("Closing connection to {}", self.config.uri);
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.pending.lock().clear();
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(IpcError::ConnectionClosed)
        }
    }

    fn ensure_not_subscribed(&self) -> Result<()> {
        if self.subscriptions.lock().is_empty() {
            Ok(())
        } else {
            Err(IpcError::SubscriptionMode)
        }
    }

    fn check_size(&self, msg: &Message) -> Result<()> {
        let size = message_size(msg).total;
        if size > self.settings.max_message_size {
            return Err(IpcError::MessageTooLarge {
                size,
                max: self.settings.max_message_size,
            });
        }
        Ok(())
    }

    /// Register a pending entry, then hand the message to the writer
    ///
    /// Every submission gets its own id, so the same message value can be
    /// in flight more than once.
    fn submit(&self, msg: Message) -> Result<ResponseFuture> {
        self.ensure_running()?;
        self.check_size(&msg)?;
        let msg = msg.restamped();
        let id = msg.id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        let future = ResponseFuture {
            id,
            rx,
            pending: self.pending.clone(),
        };
        self.tx.send(msg).map_err(|_| IpcError::ConnectionClosed)?;
        Ok(future)
    }

    fn submit_oneway(&self, msg: Message) -> Result<()> {
        self.ensure_running()?;
        self.check_size(&msg)?;
        self.tx
            .send(msg.restamped().into_oneway())
            .map_err(|_| IpcError::ConnectionClosed)
    }

    /// Send a control request and require an OK response
    async fn admin(&self, msg: Message) -> Result<Message> {
        let response = self.submit(msg)?.await?;
        expect_ok(response)
    }

    // Requests

    /// Send a request to the server's default handler and wait for the response
    pub async fn send(&self, msg: Message, timeout: Option<Duration>) -> Result<Message> {
        self.send_async(msg)?.wait(timeout).await
    }

    /// Like [`Client::send`] but returns once the request is queued
    pub fn send_async(&self, msg: Message) -> Result<ResponseFuture> {
        self.ensure_not_subscribed()?;
        self.submit(msg.addressed(MessageType::Request, None, -1))
    }

    /// Fire and forget; remote errors are never reported
    pub fn send_oneway(&self, msg: Message) -> Result<()> {
        self.ensure_not_subscribed()?;
        self.submit_oneway(msg.addressed(MessageType::Request, None, -1))
    }

    /// Send a request to the named server function
    pub async fn send_to(
        &self,
        function: &str,
        msg: Message,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        self.send_to_async(function, msg)?.wait(timeout).await
    }

    /// Like [`Client::send_to`] but returns once the request is queued
    pub fn send_to_async(&self, function: &str, msg: Message) -> Result<ResponseFuture> {
        self.ensure_not_subscribed()?;
        self.submit(msg.addressed(MessageType::Request, Some(function), -1))
    }

    // Queues

    /// Offer a message, waiting up to `timeout` on the server for capacity
    ///
    /// The response status is OK, QUEUE_FULL or QUEUE_NOT_FOUND.
    pub async fn offer(
        &self,
        queue: &str,
        msg: Message,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        self.offer_async(queue, msg, timeout)?.await
    }

    /// Like [`Client::offer`] but returns once the offer is queued
    pub fn offer_async(
        &self,
        queue: &str,
        msg: Message,
        timeout: Option<Duration>,
    ) -> Result<ResponseFuture> {
        self.submit(msg.addressed(MessageType::Offer, Some(queue), timeout_millis(timeout)))
    }

    /// Poll the oldest message, waiting up to `timeout` on the server
    ///
    /// The response status is OK, QUEUE_EMPTY or QUEUE_NOT_FOUND.
    pub async fn poll(&self, queue: &str, timeout: Option<Duration>) -> Result<Message> {
        self.poll_async(queue, timeout)?.await
    }

    /// Like [`Client::poll`] but returns once the poll is queued
    pub fn poll_async(&self, queue: &str, timeout: Option<Duration>) -> Result<ResponseFuture> {
        let msg = Message::control(MessageType::Poll).addressed(
            MessageType::Poll,
            Some(queue),
            timeout_millis(timeout),
        );
        self.submit(msg)
    }

    /// Create a named queue; requires the admin role
    pub async fn create_queue(
        &self,
        name: &str,
        capacity: usize,
        kind: QueueKind,
        durable: bool,
    ) -> Result<()> {
        let body = CreateQueueRequest {
            capacity,
            kind,
            durable,
        };
        let msg = Message::control_with(MessageType::CreateQueue, &body)?.addressed(
            MessageType::CreateQueue,
            Some(name),
            -1,
        );
        self.admin(msg).await.map(|_| ())
    }

    /// Create a bounded queue that lives as long as this connection
    pub async fn create_temporary_queue(&self, capacity: usize) -> Result<String> {
        let msg = Message::control_with(
            MessageType::CreateTempQueue,
            &CreateTempQueueRequest { capacity },
        )?;
        self.admin(msg).await?.payload_text()
    }

    /// Remove a queue and its write-ahead log; waiting polls get QUEUE_NOT_FOUND
    pub async fn remove_queue(&self, name: &str) -> Result<()> {
        let msg = Message::control(MessageType::RemoveQueue).addressed(
            MessageType::RemoveQueue,
            Some(name),
            -1,
        );
        self.admin(msg).await.map(|_| ())
    }

    pub async fn exists_queue(&self, name: &str) -> Result<bool> {
        Ok(self.queue_status(name).await?.exists)
    }

    /// Size, capacity and counters of a queue
    pub async fn queue_status(&self, name: &str) -> Result<QueueStatus> {
        let msg = Message::control(MessageType::StatusQueue).addressed(
            MessageType::StatusQueue,
            Some(name),
            -1,
        );
        self.admin(msg).await?.payload_as()
    }

    // Topics

    /// Publish to a topic; the response is OK or BAD_REQUEST
    pub async fn publish(&self, topic: &str, msg: Message) -> Result<Message> {
        self.publish_async(topic, msg)?.await
    }

    pub fn publish_async(&self, topic: &str, msg: Message) -> Result<ResponseFuture> {
        self.ensure_not_subscribed()?;
        self.submit(msg.addressed(MessageType::Publish, Some(topic), -1))
    }

    /// Publish without waiting for the server's acknowledgement
    pub fn publish_oneway(&self, topic: &str, msg: Message) -> Result<()> {
        self.ensure_not_subscribed()?;
        self.submit_oneway(msg.addressed(MessageType::Publish, Some(topic), -1))
    }

    /// Subscribe `handler` to `topic`
    ///
    /// Each call adds an independent subscription. The client stays in
    /// subscription mode until its last subscription is removed.
    pub async fn subscribe<F>(&self, topic: &str, handler: F) -> Result<SubscriptionId>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let first = !self.subscriptions.lock().contains_key(topic);
        if first {
            let msg = Message::control(MessageType::Subscribe).addressed(
                MessageType::Subscribe,
                Some(topic),
                -1,
            );
            self.admin(msg).await?;
        }

        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        debug!("Subscribed to {} ({:?})", topic, id);
        Ok(id)
    }

    /// Remove a subscription; the server is told once a topic has no handlers left
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let emptied = {
            let mut subscriptions = self.subscriptions.lock();
            let mut emptied = None;
            for (topic, subs) in subscriptions.iter_mut() {
                let before = subs.len();
                subs.retain(|(sub, _)| *sub != id);
                if subs.len() != before {
                    if subs.is_empty() {
                        emptied = Some(topic.clone());
                    }
                    break;
                }
            }
            if let Some(topic) = &emptied {
                subscriptions.remove(topic);
            }
            emptied
        };

        if let Some(topic) = emptied {
            let msg = Message::control(MessageType::Unsubscribe).addressed(
                MessageType::Unsubscribe,
                Some(&topic),
                -1,
            );
            self.admin(msg).await?;
        }
        Ok(())
    }

    /// Create a topic; requires the admin role
    pub async fn create_topic(&self, name: &str) -> Result<()> {
        let msg = Message::control(MessageType::CreateTopic).addressed(
            MessageType::CreateTopic,
            Some(name),
            -1,
        );
        self.admin(msg).await.map(|_| ())
    }

    pub async fn remove_topic(&self, name: &str) -> Result<()> {
        let msg = Message::control(MessageType::RemoveTopic).addressed(
            MessageType::RemoveTopic,
            Some(name),
            -1,
        );
        self.admin(msg).await.map(|_| ())
    }

    pub async fn exists_topic(&self, name: &str) -> Result<bool> {
        let msg = Message::control(MessageType::StatusTopic).addressed(
            MessageType::StatusTopic,
            Some(name),
            -1,
        );
        let status: TopicStatus = self.admin(msg).await?.payload_as()?;
        Ok(status.exists)
    }

    /// Connection, registry and request counters of the server
    pub async fn server_status(&self) -> Result<ServerStatus> {
        self.admin(Message::control(MessageType::ServerStatus))
            .await?
            .payload_as()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

fn expect_ok(response: Message) -> Result<Message> {
    if response.response_status() == ResponseStatus::Ok {
        Ok(response)
    } else {
        Err(IpcError::Remote {
            status: response.response_status().to_string(),
            message: response.error_text(),
        })
    }
}
