// IPC server: accept loop, per-connection dispatch and statistics

use crate::ipc::broker::{Broker, Handler, WalSettings};
use crate::ipc::codec::FrameCodec;
use crate::ipc::config::ServerConfig;
use crate::ipc::connection::{ClientConnection, ClientManager};
use crate::ipc::error::{IpcError, Result};
use crate::ipc::handshake;
use crate::ipc::message::{Message, MessageType, ResponseStatus};
use crate::ipc::queue::{
    CreateQueueRequest, CreateTempQueueRequest, IpcQueue, OfferOutcome, QueueKind, QueueStatus,
};
use crate::ipc::topic::TopicStatus;
use crate::ipc::transport::{ConnectionUri, IpcListener, IpcStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

/// Missed heartbeat intervals after which a silent connection is closed
const IDLE_HEARTBEATS: u32 = 3;

/// Statistics reported by SERVER_STATUS
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerStatus {
    pub running: bool,
    pub max_connections: usize,
    pub active_connections: usize,
    pub accepted_connections: u64,
    pub rejected_connections: u64,
    pub queues: usize,
    pub topics: usize,
    pub functions: usize,
    pub handled_requests: u64,
    pub published_messages: u64,
    pub handler_errors: u64,
}

#[derive(Default)]
struct Statistics {
    accepted: AtomicU64,
    rejected: AtomicU64,
    handled: AtomicU64,
    published: AtomicU64,
    handler_errors: AtomicU64,
}

struct ServerState {
    config: Arc<ServerConfig>,
    broker: Broker,
    clients: ClientManager,
    handler: Option<Arc<dyn Handler>>,
    limit: Arc<Semaphore>,
    stats: Statistics,
    running: AtomicBool,
}

impl ServerState {
    async fn status(&self) -> ServerStatus {
        let max = self.config.max_connections;
        ServerStatus {
            running: self.running.load(Ordering::SeqCst),
            max_connections: max,
            active_connections: max.saturating_sub(self.limit.available_permits()),
            accepted_connections: self.stats.accepted.load(Ordering::Relaxed),
            rejected_connections: self.stats.rejected.load(Ordering::Relaxed),
            queues: self.broker.queue_count().await,
            topics: self.broker.topic_count().await,
            functions: self.broker.function_count().await,
            handled_requests: self.stats.handled.load(Ordering::Relaxed),
            published_messages: self.stats.published.load(Ordering::Relaxed),
            handler_errors: self.stats.handler_errors.load(Ordering::Relaxed),
        }
    }
}

/// A running IPC server
pub struct Server {
    state: Arc<ServerState>,
    local_uri: ConnectionUri,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Bind, restore durable queues and start accepting connections
    ///
    /// `handler` serves REQUEST messages without a destination.
    pub async fn start(config: ServerConfig, handler: Option<Arc<dyn Handler>>) -> Result<Self> {
        let config = Arc::new(config);
        let listener = IpcListener::bind(&config.uri, config.socket_buffers).await?;
        let local_uri = listener.local_uri()?;

        let wal = config.wal_dir.clone().map(|dir| WalSettings {
            dir,
            compress: config.wal_compress,
        });
        let broker = Broker::new(config.max_queues, config.max_topics, wal);
        let restored = broker.restore(config.wal_compact_at_start).await?;
        if restored > 0 {
            info!("Restored {} durable queue(s)", restored);
        }

        let state = Arc::new(ServerState {
            limit: Arc::new(Semaphore::new(config.max_connections)),
            config,
            broker,
            clients: ClientManager::new(),
            handler,
            stats: Statistics::default(),
            running: AtomicBool::new(true),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(run_listener(listener, state.clone(), shutdown_rx));

        info!("IPC server listening on {}", local_uri);
        Ok(Self {
            state,
            local_uri,
            shutdown_tx,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    /// Start a server whose default handler is `handler`
    pub async fn with_handler(config: ServerConfig, handler: impl Handler) -> Result<Self> {
        Self::start(config, Some(Arc::new(handler))).await
    }

    /// The bound address; resolves an ephemeral port
    pub fn local_uri(&self) -> &ConnectionUri {
        &self.local_uri
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> ServerStatus {
        self.state.status().await
    }

    /// Stop accepting, close every connection and wait for the listener
    pub async fn close(&self) {
        if !self.state.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("IPC server on {} stopped", self.local_uri);
    }

    // Local administration

    pub async fn create_queue(
        &self,
        name: &str,
        capacity: usize,
        kind: QueueKind,
        durable: bool,
    ) -> Result<()> {
        self.state
            .broker
            .create_queue(name, capacity, kind, durable)
            .await
            .map(|_| ())
    }

    pub async fn remove_queue(&self, name: &str) -> Result<bool> {
        self.state.broker.remove_queue(name).await
    }

    pub async fn exists_queue(&self, name: &str) -> bool {
        self.state.broker.exists_queue(name).await
    }

    pub async fn queue_status(&self, name: &str) -> QueueStatus {
        self.state.broker.queue_status(name).await
    }

    pub async fn create_topic(&self, name: &str) -> Result<()> {
        self.state.broker.create_topic(name).await.map(|_| ())
    }

    pub async fn remove_topic(&self, name: &str) -> bool {
        self.state.broker.remove_topic(name).await
    }

    pub async fn exists_topic(&self, name: &str) -> bool {
        self.state.broker.exists_topic(name).await
    }

    pub async fn topic_status(&self, name: &str) -> TopicStatus {
        self.state.broker.topic_status(name).await
    }

    /// Register a handler addressable by name
    pub async fn create_function(&self, name: &str, handler: impl Handler) -> Result<()> {
        self.state
            .broker
            .create_function(name, Arc::new(handler))
            .await
    }

    pub async fn remove_function(&self, name: &str) -> bool {
        self.state.broker.remove_function(name).await
    }

    pub async fn exists_function(&self, name: &str) -> bool {
        self.state.broker.exists_function(name).await
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.state.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
    }
}

async fn run_listener(
    listener: IpcListener,
    state: Arc<ServerState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok(stream) => {
                        match state.limit.clone().try_acquire_owned() {
                            Ok(permit) => {
                                state.stats.accepted.fetch_add(1, Ordering::Relaxed);
                                let state = state.clone();
                                let shutdown = shutdown_rx.clone();
                                tokio::spawn(async move {
                                    handle_connection(stream, state, shutdown, permit).await;
                                });
                            }
                            Err(_) => {
                                state.stats.rejected.fetch_add(1, Ordering::Relaxed);
                                warn!(
                                    "Rejected connection from {}: max connections ({}) reached",
                                    stream.peer(),
                                    state.config.max_connections
                                );
                            }
                        }
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                info!("Shutting down listener");
                break;
            }
        }
    }
}

async fn handle_connection(
    stream: IpcStream,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<bool>,
    _permit: OwnedSemaphorePermit,
) {
    let peer = stream.peer();
    let codec = FrameCodec::new(
        state.config.max_message_size,
        state.config.compress_cutoff_size,
    );
    let mut framed = Framed::new(stream, codec);

    let session = match handshake::accept(&mut framed, &state.config).await {
        Ok(session) => session,
        Err(e) => {
            warn!("Handshake with {} failed: {}", peer, e);
            return;
        }
    };

    debug!(
        "Handshake with {} complete (encrypted: {})",
        peer,
        framed.codec().is_encrypting()
    );
    let (mut sink, mut frames) = framed.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            // Oversized responses are replaced so the caller is not left waiting
            let stub = (msg.message_type() == MessageType::Response)
                .then(|| Message::response(&msg, ResponseStatus::ServerError));
            match sink.send(msg).await {
                Ok(()) => {}
                Err(e @ IpcError::MessageTooLarge { .. }) => {
                    warn!("Response not sent: {}", e);
                    if let Some(stub) = stub {
                        let reply =
                            Message::text_response(&stub, ResponseStatus::ServerError, &e.to_string());
                        if sink.send(reply).await.is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    debug!("Write failed: {}", e);
                    break;
                }
            }
        }
    });

    let client = state
        .clients
        .add_client(ClientConnection::new(peer, session, tx))
        .await;

    let mut lanes = QueueLanes::new(state.clone(), client.clone());
    let heartbeat = state.config.heartbeat_interval;
    let idle_limit = heartbeat * IDLE_HEARTBEATS;
    let mut idle_check = tokio::time::interval(if heartbeat.is_zero() {
        Duration::from_secs(3600)
    } else {
        heartbeat
    });

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(msg)) => {
                    client.touch();
                    dispatch(&state, &client, &mut lanes, msg).await;
                }
                Some(Err(e)) if e.is_connection_fatal() => {
                    warn!("Closing connection {}: {}", client.id, e);
                    break;
                }
                Some(Err(e)) => warn!("Discarding unreadable message from {}: {}", client.id, e),
                None => break,
            },
            _ = idle_check.tick(), if !heartbeat.is_zero() => {
                if client.is_idle(idle_limit) {
                    warn!("Closing connection {}: no traffic for {:?}", client.id, idle_limit);
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    // Waiting offers and polls must not outlive the connection
    drop(lanes);
    state.clients.remove_client(&client.id).await;
    state
        .broker
        .unsubscribe_all(&client.id, &client.take_subscriptions())
        .await;
    for name in client.take_temp_queues() {
        if let Err(e) = state.broker.remove_queue(&name).await {
            warn!("Failed to remove temporary queue {}: {}", name, e);
        }
    }
    write_task.abort();
}

fn reply(client: &ClientConnection, request_oneway: bool, response: Message) {
    if request_oneway {
        return;
    }
    if let Err(e) = client.send(response) {
        debug!("Dropping response for {}: {}", client.id, e);
    }
}

fn bad_request(request: &Message, text: &str) -> Message {
    Message::text_response(request, ResponseStatus::BadRequest, text)
}

fn ok(request: &Message) -> Message {
    Message::response(request, ResponseStatus::Ok)
}

fn structured_ok<T: Serialize>(request: &Message, body: &T) -> Message {
    Message::structured_response(request, ResponseStatus::Ok, body).unwrap_or_else(|e| {
        error!("Failed to encode response body: {}", e);
        Message::text_response(request, ResponseStatus::ServerError, &e.to_string())
    })
}

/// Route one inbound message
async fn dispatch(
    state: &Arc<ServerState>,
    client: &Arc<ClientConnection>,
    lanes: &mut QueueLanes,
    msg: Message,
) {
    let msg_type = msg.message_type();
    let oneway = msg.is_oneway();
    debug!("{} from {}", msg, client.id);

    if msg_type.requires_admin() && !client.session.is_admin() {
        let err = IpcError::PermissionDenied(format!("{} requires the admin role", msg_type));
        warn!("Client {}: {}", client.id, err);
        reply(client, oneway, bad_request(&msg, &err.to_string()));
        return;
    }

    match msg_type {
        MessageType::Request => handle_request(state, client, msg).await,
        MessageType::Offer | MessageType::Poll => {
            if lookup_queue(state, client, &msg).await.is_some() {
                lanes.submit(msg);
            }
        }
        MessageType::Publish => handle_publish(state, client, msg).await,
        MessageType::Subscribe => {
            let response = match topic_name(&msg) {
                Some(name) => match state.broker.topic(name).await {
                    Some(topic) => {
                        topic.subscribe(&client.id);
                        client.add_subscription(name);
                        debug!("Client {} subscribed to {}", client.id, name);
                        ok(&msg)
                    }
                    None => bad_request(&msg, &IpcError::TopicNotFound(name.into()).to_string()),
                },
                None => bad_request(&msg, "missing topic name"),
            };
            reply(client, oneway, response);
        }
        MessageType::Unsubscribe => {
            if let Some(name) = topic_name(&msg) {
                if let Some(topic) = state.broker.topic(name).await {
                    topic.unsubscribe(&client.id);
                }
                client.remove_subscription(name);
            }
            reply(client, oneway, ok(&msg));
        }
        MessageType::CreateQueue => {
            let response = match create_queue(state, &msg).await {
                Ok(()) => ok(&msg),
                Err(e) => bad_request(&msg, &e.to_string()),
            };
            reply(client, oneway, response);
        }
        MessageType::CreateTempQueue => {
            let response = match create_temp_queue(state, client, &msg).await {
                Ok(name) => Message::text_response(&msg, ResponseStatus::Ok, &name),
                Err(e) => bad_request(&msg, &e.to_string()),
            };
            reply(client, oneway, response);
        }
        MessageType::RemoveQueue => {
            let response = match msg.queue_name() {
                Some(name) => match state.broker.remove_queue(name).await {
                    Ok(_) => ok(&msg),
                    Err(e) => Message::text_response(
                        &msg,
                        ResponseStatus::ServerError,
                        &e.to_string(),
                    ),
                },
                None => bad_request(&msg, "missing queue name"),
            };
            reply(client, oneway, response);
        }
        MessageType::StatusQueue => {
            let response = match msg.queue_name() {
                Some(name) => structured_ok(&msg, &state.broker.queue_status(name).await),
                None => bad_request(&msg, "missing queue name"),
            };
            reply(client, oneway, response);
        }
        MessageType::CreateTopic => {
            let response = match topic_name(&msg) {
                Some(name) => match state.broker.create_topic(name).await {
                    Ok(_) => ok(&msg),
                    Err(e) => bad_request(&msg, &e.to_string()),
                },
                None => bad_request(&msg, "missing topic name"),
            };
            reply(client, oneway, response);
        }
        MessageType::RemoveTopic => {
            if let Some(name) = topic_name(&msg) {
                state.broker.remove_topic(name).await;
            }
            reply(client, oneway, ok(&msg));
        }
        MessageType::StatusTopic => {
            let response = match topic_name(&msg) {
                Some(name) => structured_ok(&msg, &state.broker.topic_status(name).await),
                None => bad_request(&msg, "missing topic name"),
            };
            reply(client, oneway, response);
        }
        MessageType::ServerStatus => {
            let status = state.status().await;
            reply(client, oneway, structured_ok(&msg, &status));
        }
        MessageType::Heartbeat => {}
        MessageType::ClientConfig
        | MessageType::DiffieHellmanKeyRequest
        | MessageType::Authentication
        | MessageType::Response
        | MessageType::Null => {
            let text = if msg_type.is_handshake() {
                format!("{} is only valid during the handshake", msg_type)
            } else {
                format!("unexpected {} message", msg_type)
            };
            reply(client, oneway, bad_request(&msg, &text));
        }
    }
}

fn topic_name(msg: &Message) -> Option<&str> {
    msg.queue_name().filter(|n| !n.is_empty())
}

async fn handle_request(state: &Arc<ServerState>, client: &Arc<ClientConnection>, msg: Message) {
    let oneway = msg.is_oneway();
    if client.in_subscription_mode() {
        reply(
            client,
            oneway,
            bad_request(&msg, &IpcError::SubscriptionMode.to_string()),
        );
        return;
    }

    let handler = match msg.queue_name() {
        Some(name) => match state.broker.function(name).await {
            Some(handler) => handler,
            None => {
                let text = format!("function not found: {}", name);
                reply(client, oneway, bad_request(&msg, &text));
                return;
            }
        },
        None => match &state.handler {
            Some(handler) => handler.clone(),
            None => {
                reply(client, oneway, bad_request(&msg, "server has no request handler"));
                return;
            }
        },
    };

    state.stats.handled.fetch_add(1, Ordering::Relaxed);
    let template = Message::response(&msg, ResponseStatus::Ok);
    let outcome = tokio::task::spawn_blocking(move || handler.handle(msg)).await;

    let response = match outcome {
        Ok(Ok(Some(response))) => response.into_response(template.id(), ResponseStatus::Ok),
        Ok(Ok(None)) => template,
        Ok(Err(e)) => {
            state.stats.handler_errors.fetch_add(1, Ordering::Relaxed);
            warn!("Handler failed: {:#}", e);
            Message::text_response(&template, ResponseStatus::HandlerError, &format!("{:#}", e))
        }
        Err(e) => {
            state.stats.handler_errors.fetch_add(1, Ordering::Relaxed);
            let text = if e.is_panic() {
                panic_text(e.into_panic())
            } else {
                e.to_string()
            };
            error!("Handler panicked: {}", text);
            Message::text_response(&template, ResponseStatus::HandlerError, &text)
        }
    };
    reply(client, oneway, response);
}

fn panic_text(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}

/// Per-queue FIFO lanes for one connection's OFFER and POLL requests
///
/// Requests for the same queue run one after another, so pipelined offers
/// land in send order while a waiting poll on one queue does not hold up
/// another. Dropping the lanes aborts whatever is still waiting.
struct QueueLanes {
    state: Arc<ServerState>,
    client: Arc<ClientConnection>,
    lanes: HashMap<String, QueueLane>,
}

struct QueueLane {
    tx: mpsc::UnboundedSender<Message>,
    task: JoinHandle<()>,
}

impl QueueLanes {
    fn new(state: Arc<ServerState>, client: Arc<ClientConnection>) -> Self {
        Self {
            state,
            client,
            lanes: HashMap::new(),
        }
    }

    fn submit(&mut self, msg: Message) {
        let name = msg.queue_name().unwrap_or_default().to_string();
        if self.lanes.get(&name).is_some_and(|lane| lane.task.is_finished()) {
            self.lanes.remove(&name);
        }
        let lane = self.lanes.entry(name).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let task = tokio::spawn(run_lane(self.state.clone(), self.client.clone(), rx));
            QueueLane { tx, task }
        });
        if let Err(e) = lane.tx.send(msg) {
            let msg = e.0;
            error!("Queue lane for {} is gone", msg.queue_name().unwrap_or_default());
            let text = "queue request could not be scheduled";
            reply(
                &self.client,
                msg.is_oneway(),
                Message::text_response(&msg, ResponseStatus::ServerError, text),
            );
        }
    }
}

impl Drop for QueueLanes {
    fn drop(&mut self) {
        for lane in self.lanes.values() {
            lane.task.abort();
        }
    }
}

async fn run_lane(
    state: Arc<ServerState>,
    client: Arc<ClientConnection>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        // Looked up again: the queue may have been removed while this waited
        let Some(queue) = lookup_queue(&state, &client, &msg).await else {
            continue;
        };
        if msg.message_type() == MessageType::Offer {
            handle_offer(&client, &queue, msg).await;
        } else {
            handle_poll(&client, &queue, msg).await;
        }
    }
}

fn queue_error_response(template: &Message, queue: &IpcQueue, e: IpcError) -> Message {
    match e {
        IpcError::QueueNotFound(_) => {
            Message::text_response(template, ResponseStatus::QueueNotFound, &e.to_string())
        }
        e => {
            error!("Queue {} failed: {}", queue.name(), e);
            Message::text_response(template, ResponseStatus::ServerError, &e.to_string())
        }
    }
}

async fn handle_offer(client: &Arc<ClientConnection>, queue: &IpcQueue, msg: Message) {
    let oneway = msg.is_oneway();
    let template = Message::response(&msg, ResponseStatus::Ok);
    let timeout = msg.wait_timeout();
    let response = match queue.offer(msg, timeout).await {
        Ok(OfferOutcome::Accepted) => template,
        Ok(OfferOutcome::Full) => Message::response(&template, ResponseStatus::QueueFull),
        Err(e) => queue_error_response(&template, queue, e),
    };
    reply(client, oneway, response);
}

async fn handle_poll(client: &Arc<ClientConnection>, queue: &IpcQueue, msg: Message) {
    let oneway = msg.is_oneway();
    let template = Message::response(&msg, ResponseStatus::Ok);
    let entry = match queue.poll(msg.wait_timeout()).await {
        Ok(Some(entry)) => entry,
        Ok(None) => {
            reply(client, oneway, Message::response(&template, ResponseStatus::QueueEmpty));
            return;
        }
        Err(e) => {
            reply(client, oneway, queue_error_response(&template, queue, e));
            return;
        }
    };
    if oneway {
        return;
    }

    let entry_id = entry.id();
    let response = entry.into_response(template.id(), ResponseStatus::Ok);
    if let Err(undelivered) = client.try_send(response) {
        // The connection went away while the entry was in hand
        let entry = undelivered.into_queue_entry(entry_id);
        match queue.requeue_front(entry).await {
            Ok(true) => debug!("Returned undelivered entry to {}", queue.name()),
            Ok(false) => warn!("Dropped undelivered entry: {} is full", queue.name()),
            Err(e) => warn!("Dropped undelivered entry for {}: {}", queue.name(), e),
        }
    }
}

async fn lookup_queue(
    state: &Arc<ServerState>,
    client: &Arc<ClientConnection>,
    msg: &Message,
) -> Option<Arc<IpcQueue>> {
    let name = msg.queue_name().unwrap_or_default();
    let queue = state.broker.queue(name).await;
    if queue.is_none() {
        let text = IpcError::QueueNotFound(name.to_string()).to_string();
        reply(
            client,
            msg.is_oneway(),
            Message::text_response(msg, ResponseStatus::QueueNotFound, &text),
        );
    }
    queue
}

async fn handle_publish(state: &Arc<ServerState>, client: &Arc<ClientConnection>, msg: Message) {
    let oneway = msg.is_oneway();
    if client.in_subscription_mode() {
        reply(
            client,
            oneway,
            bad_request(&msg, &IpcError::SubscriptionMode.to_string()),
        );
        return;
    }
    let Some(topic) = topic_name(&msg).map(str::to_string) else {
        reply(client, oneway, bad_request(&msg, "missing topic name"));
        return;
    };
    let Some(topic) = state.broker.topic(&topic).await else {
        let text = IpcError::TopicNotFound(topic).to_string();
        reply(client, oneway, bad_request(&msg, &text));
        return;
    };

    let response = ok(&msg);
    let subscribers = topic.subscribers();
    let published = msg.into_published();
    let delivered = state.clients.deliver(&subscribers, &published).await;
    state.stats.published.fetch_add(1, Ordering::Relaxed);
    debug!("Published to {} ({} subscribers)", topic.name(), delivered);
    reply(client, oneway, response);
}

async fn create_queue(state: &Arc<ServerState>, msg: &Message) -> Result<()> {
    let name = msg
        .queue_name()
        .ok_or_else(|| IpcError::InvalidName("missing queue name".to_string()))?;
    let request: CreateQueueRequest = msg.payload_as()?;
    state
        .broker
        .create_queue(name, request.capacity, request.kind, request.durable)
        .await
        .map(|_| ())
}

async fn create_temp_queue(
    state: &Arc<ServerState>,
    client: &Arc<ClientConnection>,
    msg: &Message,
) -> Result<String> {
    let request: CreateTempQueueRequest = msg.payload_as()?;
    let queue = state.broker.create_temporary_queue(request.capacity).await?;
    client.add_temp_queue(queue.name());
    Ok(queue.name().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::auth::{Authenticator, Role};
    use crate::ipc::config::ClientConfig;

    async fn raw_client(server: &Server) -> Framed<IpcStream, FrameCodec> {
        let stream = IpcStream::connect(server.local_uri(), Default::default())
            .await
            .unwrap();
        let mut framed = Framed::new(stream, FrameCodec::default());
        handshake::connect(&mut framed, &ClientConfig::new(server.local_uri().clone()))
            .await
            .unwrap();
        framed
    }

    fn config() -> ServerConfig {
        ServerConfig::builder(ConnectionUri::local_port(0))
            .build()
            .unwrap()
    }

    async fn roundtrip(conn: &mut Framed<IpcStream, FrameCodec>, msg: Message) -> Message {
        conn.send(msg).await.unwrap();
        conn.next().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_request_without_handler_is_bad_request() {
        let server = Server::start(config(), None).await.unwrap();
        let mut conn = raw_client(&server).await;

        let request = Message::plain_text("test", "hello");
        let response = roundtrip(&mut conn, request.clone()).await;
        assert_eq!(response.id(), request.id());
        assert_eq!(response.response_status(), ResponseStatus::BadRequest);
        server.close().await;
    }

    #[tokio::test]
    async fn test_echo_and_status() {
        let server = Server::with_handler(config(), |m: Message| -> anyhow::Result<Option<Message>> {
            Ok(Some(m))
        })
        .await
        .unwrap();
        let mut conn = raw_client(&server).await;

        let response = roundtrip(&mut conn, Message::plain_text("test", "hello")).await;
        assert_eq!(response.response_status(), ResponseStatus::Ok);
        assert_eq!(response.payload_text().unwrap(), "hello");

        let status = roundtrip(&mut conn, Message::control(MessageType::ServerStatus)).await;
        let status: ServerStatus = status.payload_as().unwrap();
        assert!(status.running);
        assert_eq!(status.active_connections, 1);
        assert_eq!(status.handled_requests, 1);
        server.close().await;
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_handler_error() {
        let server = Server::with_handler(config(), |_m: Message| -> anyhow::Result<Option<Message>> {
            panic!("boom")
        })
        .await
        .unwrap();
        let mut conn = raw_client(&server).await;

        let response = roundtrip(&mut conn, Message::plain_text("test", "hello")).await;
        assert_eq!(response.response_status(), ResponseStatus::HandlerError);
        assert!(response.payload_text().unwrap().contains("boom"));

        // The connection survives
        let response = roundtrip(&mut conn, Message::control(MessageType::ServerStatus)).await;
        assert_eq!(response.response_status(), ResponseStatus::Ok);
        server.close().await;
    }

    #[tokio::test]
    async fn test_admin_role_required() {
        let mut auth = Authenticator::with_iterations(1_000);
        auth.add_credentials("tom", "123", Role::User).unwrap();
        let config = ServerConfig::builder(ConnectionUri::local_port(0))
            .encrypt(true)
            .authenticator(auth)
            .build()
            .unwrap();
        let server = Server::start(config, None).await.unwrap();

        let stream = IpcStream::connect(server.local_uri(), Default::default())
            .await
            .unwrap();
        let mut conn = Framed::new(stream, FrameCodec::default());
        let client_config =
            ClientConfig::new(server.local_uri().clone()).credentials("tom", "123");
        handshake::connect(&mut conn, &client_config).await.unwrap();

        let request = Message::control(MessageType::CreateTopic).addressed(
            MessageType::CreateTopic,
            Some("news"),
            -1,
        );
        let response = roundtrip(&mut conn, request).await;
        assert_eq!(response.response_status(), ResponseStatus::BadRequest);
        assert!(response.payload_text().unwrap().contains("requires the admin role"));
        assert!(!server.exists_topic("news").await);
        server.close().await;
    }

    #[tokio::test]
    async fn test_poll_missing_queue() {
        let server = Server::start(config(), None).await.unwrap();
        let mut conn = raw_client(&server).await;
        let request = Message::control(MessageType::Poll).addressed(MessageType::Poll, Some("nope"), 0);
        let response = roundtrip(&mut conn, request).await;
        assert_eq!(response.response_status(), ResponseStatus::QueueNotFound);
        server.close().await;
    }

    #[tokio::test]
    async fn test_connection_limit_rejects() {
        let config = ServerConfig::builder(ConnectionUri::local_port(0))
            .max_connections(1)
            .handshake_timeout(Duration::from_secs(2))
            .build()
            .unwrap();
        let server = Server::start(config, None).await.unwrap();
        let _first = raw_client(&server).await;

        let stream = IpcStream::connect(server.local_uri(), Default::default())
            .await
            .unwrap();
        let mut second = Framed::new(stream, FrameCodec::default());
        let result =
            handshake::connect(&mut second, &ClientConfig::new(server.local_uri().clone())).await;
        assert!(result.is_err());
        assert_eq!(server.status().await.rejected_connections, 1);
        server.close().await;
    }

    #[tokio::test]
    async fn test_silent_connection_closed() {
        let config = ServerConfig::builder(ConnectionUri::local_port(0))
            .heartbeat_interval(Duration::from_millis(100))
            .build()
            .unwrap();
        let server = Server::start(config, None).await.unwrap();
        let mut conn = raw_client(&server).await;

        let next = tokio::time::timeout(Duration::from_secs(3), conn.next())
            .await
            .expect("silent connection was kept open");
        assert!(!matches!(next, Some(Ok(_))));
        assert_eq!(server.status().await.active_connections, 0);
        server.close().await;
    }

    #[tokio::test]
    async fn test_pipelined_offers_keep_order() {
        let server = Server::start(config(), None).await.unwrap();
        server
            .create_queue("seq", 100, QueueKind::Bounded, false)
            .await
            .unwrap();
        let mut conn = raw_client(&server).await;

        for i in 0..50 {
            let offer = Message::plain_text("n", &i.to_string()).addressed(
                MessageType::Offer,
                Some("seq"),
                300,
            );
            conn.send(offer).await.unwrap();
        }
        for _ in 0..50 {
            let response = conn.next().await.unwrap().unwrap();
            assert_eq!(response.response_status(), ResponseStatus::Ok);
        }

        for i in 0..50 {
            let poll = Message::control(MessageType::Poll).addressed(MessageType::Poll, Some("seq"), 0);
            let polled = roundtrip(&mut conn, poll).await;
            assert_eq!(polled.payload_text().unwrap(), i.to_string());
        }
        server.close().await;
    }
}
