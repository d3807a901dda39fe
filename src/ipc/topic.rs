// Pub/sub topics and their subscriber sets

use crate::ipc::error::Result;
use crate::ipc::queue::validate_name;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Status map reported for a topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicStatus {
    pub name: String,
    pub exists: bool,
    pub subscribers: usize,
}

/// A named topic
///
/// Subscribers are server connections; a client multiplexes its own
/// handlers over the single subscription of its connection.
#[derive(Debug)]
pub struct Topic {
    name: String,
    subscribers: RwLock<HashSet<String>>,
}

impl Topic {
    pub fn new(name: &str) -> Result<Self> {
        validate_name(name)?;
        Ok(Self {
            name: name.to_string(),
            subscribers: RwLock::new(HashSet::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a connection; returns false if it was already subscribed
    pub fn subscribe(&self, connection_id: &str) -> bool {
        self.subscribers.write().insert(connection_id.to_string())
    }

    /// Remove a connection; returns whether it was subscribed
    pub fn unsubscribe(&self, connection_id: &str) -> bool {
        self.subscribers.write().remove(connection_id)
    }

    pub fn is_subscribed(&self, connection_id: &str) -> bool {
        self.subscribers.read().contains(connection_id)
    }

    /// Snapshot of the current subscribers
    pub fn subscribers(&self) -> Vec<String> {
        self.subscribers.read().iter().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn status(&self) -> TopicStatus {
        TopicStatus {
            name: self.name.clone(),
            exists: true,
            subscribers: self.subscriber_count(),
        }
    }
}
