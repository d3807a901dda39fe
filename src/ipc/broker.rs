// Server-wide registries of queues, topics and functions

use crate::ipc::error::{IpcError, Result};
use crate::ipc::message::Message;
use crate::ipc::queue::{validate_name, IpcQueue, QueueKind, QueueStatus};
use crate::ipc::topic::{Topic, TopicStatus};
use crate::ipc::wal::{self, WalQueueConfig, WriteAheadLog};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Prefix of server-generated temporary queue names
pub const TEMP_QUEUE_PREFIX: &str = "temp-queue/";

/// A request handler: the server's default handler or a named function
///
/// Returning `Ok(None)` sends an empty OK response; an error becomes a
/// HANDLER_ERROR response carrying the error text.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: Message) -> anyhow::Result<Option<Message>>;
}

impl<F> Handler for F
where
    F: Fn(Message) -> anyhow::Result<Option<Message>> + Send + Sync + 'static,
{
    fn handle(&self, request: Message) -> anyhow::Result<Option<Message>> {
        self(request)
    }
}

/// Where durable queues keep their journals
#[derive(Debug, Clone)]
pub struct WalSettings {
    pub dir: PathBuf,
    pub compress: bool,
}

/// Registries shared by every connection of a server
pub struct Broker {
    queues: RwLock<HashMap<String, Arc<IpcQueue>>>,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    functions: RwLock<HashMap<String, Arc<dyn Handler>>>,
    max_queues: usize,
    max_topics: usize,
    wal: Option<WalSettings>,
}

impl Broker {
    pub fn new(max_queues: usize, max_topics: usize, wal: Option<WalSettings>) -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            topics: RwLock::new(HashMap::new()),
            functions: RwLock::new(HashMap::new()),
            max_queues,
            max_topics,
            wal,
        }
    }

    /// Recreate durable queues from the journal directory
    ///
    /// With `compact` every journal is rewritten first. Returns the number of
    /// queues restored.
    pub async fn restore(&self, compact: bool) -> Result<usize> {
        let Some(settings) = &self.wal else {
            return Ok(0);
        };

        let mut restored = 0;
        for path in wal::discover(&settings.dir)? {
            let replayed = if compact {
                wal::compact(&path, settings.compress)?
            } else {
                wal::replay(&path)?
            };
            let name = replayed.config.name.clone();
            let journal = WriteAheadLog::open(&path, settings.compress)?;
            let entries = replayed.entries.len();
            let queue = IpcQueue::durable(&name, replayed.config.capacity, journal, replayed.entries)?;

            let mut queues = self.queues.write().await;
            if queues.contains_key(&name) {
                warn!("Skipping duplicate write-ahead log for queue {}", name);
                continue;
            }
            queues.insert(name.clone(), Arc::new(queue));
            restored += 1;
            info!("Restored durable queue {} with {} entries", name, entries);
        }
        Ok(restored)
    }

    // Queues

    pub async fn create_queue(
        &self,
        name: &str,
        capacity: usize,
        kind: QueueKind,
        durable: bool,
    ) -> Result<Arc<IpcQueue>> {
        validate_name(name)?;
        if durable && kind == QueueKind::Circular {
            return Err(IpcError::InvalidConfig(
                "circular queues cannot be durable".to_string(),
            ));
        }

        let mut queues = self.queues.write().await;
        if queues.contains_key(name) {
            return Err(IpcError::QueueExists(name.to_string()));
        }
        if queues.len() >= self.max_queues {
            return Err(IpcError::LimitReached(format!(
                "max queues ({}) reached",
                self.max_queues
            )));
        }

        let queue = if durable {
            let settings = self.wal.as_ref().ok_or_else(|| {
                IpcError::InvalidConfig(
                    "durable queues require a write-ahead-log directory".to_string(),
                )
            })?;
            let config = WalQueueConfig {
                name: name.to_string(),
                capacity,
            };
            if capacity == 0 {
                return Err(IpcError::InvalidConfig(
                    "queue capacity must be at least 1".to_string(),
                ));
            }
            let journal = WriteAheadLog::create(&settings.dir, &config, settings.compress)?;
            IpcQueue::durable(name, capacity, journal, Default::default())?
        } else {
            IpcQueue::new(name, kind, capacity, false)?
        };

        let queue = Arc::new(queue);
        queues.insert(name.to_string(), queue.clone());
        info!(
            "Created {} queue {} (capacity {}, durable {})",
            kind, name, capacity, durable
        );
        Ok(queue)
    }

    /// Create a bounded queue named `temp-queue/<uuid>`
    pub async fn create_temporary_queue(&self, capacity: usize) -> Result<Arc<IpcQueue>> {
        let name = format!("{}{}", TEMP_QUEUE_PREFIX, Uuid::new_v4());
        let queue = Arc::new(IpcQueue::new(&name, QueueKind::Bounded, capacity, true)?);

        let mut queues = self.queues.write().await;
        if queues.len() >= self.max_queues {
            return Err(IpcError::LimitReached(format!(
                "max queues ({}) reached",
                self.max_queues
            )));
        }
        queues.insert(name.clone(), queue.clone());
        info!("Created temporary queue {}", name);
        Ok(queue)
    }

    /// Remove a queue, deleting its journal; returns whether it existed
    pub async fn remove_queue(&self, name: &str) -> Result<bool> {
        let removed = self.queues.write().await.remove(name);
        let Some(queue) = removed else {
            return Ok(false);
        };
        queue.close();
        if let Some(journal) = queue.take_wal().await {
            journal.remove()?;
        }
        info!("Removed queue {}", name);
        Ok(true)
    }

    pub async fn queue(&self, name: &str) -> Option<Arc<IpcQueue>> {
        self.queues.read().await.get(name).cloned()
    }

    pub async fn exists_queue(&self, name: &str) -> bool {
        self.queues.read().await.contains_key(name)
    }

    pub async fn queue_status(&self, name: &str) -> QueueStatus {
        match self.queue(name).await {
            Some(queue) => queue.status().await,
            None => QueueStatus::missing(name),
        }
    }

    pub async fn queue_count(&self) -> usize {
        self.queues.read().await.len()
    }

    // Topics

    pub async fn create_topic(&self, name: &str) -> Result<Arc<Topic>> {
        let topic = Arc::new(Topic::new(name)?);
        let mut topics = self.topics.write().await;
        if topics.contains_key(name) {
            return Err(IpcError::TopicExists(name.to_string()));
        }
        if topics.len() >= self.max_topics {
            return Err(IpcError::LimitReached(format!(
                "max topics ({}) reached",
                self.max_topics
            )));
        }
        topics.insert(name.to_string(), topic.clone());
        info!("Created topic {}", name);
        Ok(topic)
    }

    pub async fn remove_topic(&self, name: &str) -> bool {
        let removed = self.topics.write().await.remove(name).is_some();
        if removed {
            info!("Removed topic {}", name);
        }
        removed
    }

    pub async fn topic(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.read().await.get(name).cloned()
    }

    pub async fn exists_topic(&self, name: &str) -> bool {
        self.topics.read().await.contains_key(name)
    }

    pub async fn topic_status(&self, name: &str) -> TopicStatus {
        match self.topic(name).await {
            Some(topic) => topic.status(),
            None => TopicStatus {
                name: name.to_string(),
                exists: false,
                subscribers: 0,
            },
        }
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    /// Drop a connection from every topic it subscribed to
    pub async fn unsubscribe_all(&self, connection_id: &str, topic_names: &[String]) {
        let topics = self.topics.read().await;
        for name in topic_names {
            if let Some(topic) = topics.get(name) {
                topic.unsubscribe(connection_id);
            }
        }
    }

    // Functions

    pub async fn create_function(&self, name: &str, handler: Arc<dyn Handler>) -> Result<()> {
        validate_name(name)?;
        let mut functions = self.functions.write().await;
        if functions.contains_key(name) {
            return Err(IpcError::FunctionExists(name.to_string()));
        }
        functions.insert(name.to_string(), handler);
        info!("Created function {}", name);
        Ok(())
    }

    pub async fn remove_function(&self, name: &str) -> bool {
        self.functions.write().await.remove(name).is_some()
    }

    pub async fn function(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.functions.read().await.get(name).cloned()
    }

    pub async fn exists_function(&self, name: &str) -> bool {
        self.functions.read().await.contains_key(name)
    }

    pub async fn function_count(&self) -> usize {
        self.functions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::queue::OfferOutcome;
    use std::time::Duration;
    use tempfile::tempdir;

    fn broker() -> Broker {
        Broker::new(2, 2, None)
    }

    #[tokio::test]
    async fn test_queue_registry() {
        let broker = broker();
        broker
            .create_queue("orders", 100, QueueKind::Bounded, false)
            .await
            .unwrap();
        assert!(broker.exists_queue("orders").await);

        let err = broker
            .create_queue("orders", 100, QueueKind::Bounded, false)
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::QueueExists(_)));

        let status = broker.queue_status("orders").await;
        assert!(status.exists);
        assert_eq!(status.capacity, 100);

        assert!(broker.remove_queue("orders").await.unwrap());
        assert!(!broker.remove_queue("orders").await.unwrap());
        assert!(!broker.queue_status("orders").await.exists);
    }

    #[tokio::test]
    async fn test_queue_limit() {
        let broker = broker();
        broker.create_queue("a", 1, QueueKind::Bounded, false).await.unwrap();
        broker.create_queue("b", 1, QueueKind::Circular, false).await.unwrap();
        let err = broker
            .create_queue("c", 1, QueueKind::Bounded, false)
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::LimitReached(_)));
    }

    #[tokio::test]
    async fn test_invalid_queue_requests() {
        let dir = tempdir().unwrap();
        let broker = Broker::new(
            5,
            5,
            Some(WalSettings {
                dir: dir.path().to_path_buf(),
                compress: false,
            }),
        );
        assert!(matches!(
            broker.create_queue("ring", 10, QueueKind::Circular, true).await,
            Err(IpcError::InvalidConfig(_))
        ));
        assert!(matches!(
            broker.create_queue("bad name", 10, QueueKind::Bounded, false).await,
            Err(IpcError::InvalidName(_))
        ));

        let no_wal = Broker::new(5, 5, None);
        assert!(matches!(
            no_wal.create_queue("jobs", 10, QueueKind::Bounded, true).await,
            Err(IpcError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_temporary_queue_name() {
        let broker = broker();
        let queue = broker.create_temporary_queue(10).await.unwrap();
        assert!(queue.name().starts_with(TEMP_QUEUE_PREFIX));
        assert!(queue.is_temporary());
        assert!(broker.exists_queue(queue.name()).await);
    }

    #[tokio::test]
    async fn test_durable_restore() {
        let dir = tempdir().unwrap();
        let settings = WalSettings {
            dir: dir.path().to_path_buf(),
            compress: true,
        };

        {
            let broker = Broker::new(5, 5, Some(settings.clone()));
            let queue = broker
                .create_queue("jobs/eu", 10, QueueKind::Bounded, true)
                .await
                .unwrap();
            for n in 0..3 {
                let msg = Message::plain_text("job", &n.to_string()).with_durable(true);
                assert_eq!(queue.offer(msg, None).await.unwrap(), OfferOutcome::Accepted);
            }
            let first = queue.poll(Some(Duration::ZERO)).await.unwrap().unwrap();
            assert_eq!(first.payload_text().unwrap(), "0");
        }

        let broker = Broker::new(5, 5, Some(settings));
        assert_eq!(broker.restore(true).await.unwrap(), 1);
        let queue = broker.queue("jobs/eu").await.unwrap();
        assert!(queue.is_durable());
        assert_eq!(queue.capacity(), 10);
        for n in 1..3 {
            let msg = queue.poll(Some(Duration::ZERO)).await.unwrap().unwrap();
            assert_eq!(msg.payload_text().unwrap(), n.to_string());
        }
    }

    #[tokio::test]
    async fn test_remove_durable_queue_deletes_journal() {
        let dir = tempdir().unwrap();
        let broker = Broker::new(
            5,
            5,
            Some(WalSettings {
                dir: dir.path().to_path_buf(),
                compress: false,
            }),
        );
        broker.create_queue("jobs", 5, QueueKind::Bounded, true).await.unwrap();
        let journal = dir.path().join(wal::file_name_for("jobs"));
        assert!(journal.exists());

        broker.remove_queue("jobs").await.unwrap();
        assert!(!journal.exists());
    }

    #[tokio::test]
    async fn test_topic_registry() {
        let broker = broker();
        broker.create_topic("news").await.unwrap();
        assert!(matches!(
            broker.create_topic("news").await,
            Err(IpcError::TopicExists(_))
        ));
        broker.create_topic("alerts").await.unwrap();
        assert!(matches!(
            broker.create_topic("sports").await,
            Err(IpcError::LimitReached(_))
        ));

        let topic = broker.topic("news").await.unwrap();
        topic.subscribe("c1");
        assert_eq!(broker.topic_status("news").await.subscribers, 1);
        broker.unsubscribe_all("c1", &["news".to_string()]).await;
        assert_eq!(topic.subscriber_count(), 0);

        assert!(broker.remove_topic("news").await);
        assert!(!broker.exists_topic("news").await);
    }

    #[tokio::test]
    async fn test_function_registry() {
        let broker = broker();
        let echo = |m: Message| -> anyhow::Result<Option<Message>> { Ok(Some(m)) };
        broker.create_function("echo", Arc::new(echo)).await.unwrap();
        assert!(matches!(
            broker.create_function("echo", Arc::new(echo)).await,
            Err(IpcError::FunctionExists(_))
        ));

        let handler = broker.function("echo").await.unwrap();
        let reply = handler.handle(Message::plain_text("t", "hi")).unwrap().unwrap();
        assert_eq!(reply.payload_text().unwrap(), "hi");

        assert!(broker.remove_function("echo").await);
        assert!(!broker.exists_function("echo").await);
    }
}
