// Server-side connection table

use crate::ipc::auth::Role;
use crate::ipc::error::{IpcError, Result};
use crate::ipc::message::Message;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Session state established by the handshake
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub user: Option<String>,
    /// None when the server runs without authentication
    pub role: Option<Role>,
    pub encrypted: bool,
}

impl Session {
    /// Admin operations are open to everyone unless authentication is on
    pub fn is_admin(&self) -> bool {
        match self.role {
            None => true,
            Some(role) => role == Role::Admin,
        }
    }
}

/// A connected client as seen by the server
pub struct ClientConnection {
    pub id: String,
    pub peer: String,
    pub session: Session,
    tx: mpsc::UnboundedSender<Message>,
    subscriptions: Mutex<HashSet<String>>,
    temp_queues: Mutex<Vec<String>>,
    last_activity: Mutex<Instant>,
}

impl ClientConnection {
    pub fn new(peer: String, session: Session, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            peer,
            session,
            tx,
            subscriptions: Mutex::new(HashSet::new()),
            temp_queues: Mutex::new(Vec::new()),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Queue a message for the connection's writer task
    pub fn send(&self, message: Message) -> Result<()> {
        self.tx.send(message).map_err(|_| IpcError::ConnectionClosed)
    }

    /// Like `send`, but hands the message back when the writer is gone
    pub fn try_send(&self, message: Message) -> std::result::Result<(), Message> {
        self.tx.send(message).map_err(|e| e.0)
    }

    /// Record inbound traffic, heartbeats included
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Whether nothing arrived for longer than `limit`
    pub fn is_idle(&self, limit: Duration) -> bool {
        self.last_activity().elapsed() > limit
    }

    pub fn add_subscription(&self, topic: &str) {
        self.subscriptions.lock().insert(topic.to_string());
    }

    pub fn remove_subscription(&self, topic: &str) -> bool {
        self.subscriptions.lock().remove(topic)
    }

    /// A connection with any subscription may not send or publish
    pub fn in_subscription_mode(&self) -> bool {
        !self.subscriptions.lock().is_empty()
    }

    pub fn take_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().drain().collect()
    }

    pub fn add_temp_queue(&self, name: &str) {
        self.temp_queues.lock().push(name.to_string());
    }

    pub fn take_temp_queues(&self) -> Vec<String> {
        std::mem::take(&mut *self.temp_queues.lock())
    }
}

/// Manages all connected clients
pub struct ClientManager {
    clients: Arc<RwLock<HashMap<String, Arc<ClientConnection>>>>,
}

impl ClientManager {
    pub fn new() -> Self {
        Self {
            clients: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a connection and return its shared handle
    pub async fn add_client(&self, client: ClientConnection) -> Arc<ClientConnection> {
        let client = Arc::new(client);
        let mut clients = self.clients.write().await;
        clients.insert(client.id.clone(), client.clone());
        tracing::info!("Client {} connected from {}", client.id, client.peer);
        client
    }

    pub async fn remove_client(&self, id: &str) -> Option<Arc<ClientConnection>> {
        let mut clients = self.clients.write().await;
        let removed = clients.remove(id);
        if removed.is_some() {
            tracing::info!("Client {} disconnected", id);
        }
        removed
    }

    /// Deliver a message to each listed connection; returns how many accepted it
    pub async fn deliver(&self, ids: &[String], message: &Message) -> usize {
        let clients = self.clients.read().await;
        let mut delivered = 0;
        for id in ids {
            let Some(client) = clients.get(id) else {
                continue;
            };
            match client.send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!("Failed to deliver to client {}: {}", id, e),
            }
        }
        delivered
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }
}

impl Default for ClientManager {
    fn default() -> Self {
        Self::new()
    }
}
