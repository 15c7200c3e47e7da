//! Topic-keyed pub/sub fan-out.
//!
//! Each topic owns one tokio broadcast channel, so a publish is a single
//! `send` regardless of how many sessions listen. Delivery is at-most-once:
//! a receiver that falls more than `capacity` messages behind skips ahead
//! and the skipped messages are gone. There is no replay for late
//! subscribers and no delivery acknowledgement.
//!
//! Messages are delivered to every subscriber of the topic, including the
//! session that caused them. Filtering self-echo is the subscriber's job.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::document::DocumentId;
use crate::error::SyncError;

/// Default per-subscriber buffer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// A typed topic name: `namespace` + document id.
///
/// The type parameter pins the message type carried on the topic, so a
/// `Topic<ChangeNotification>` cannot be handed to a channel of anything else.
pub struct Topic<T> {
    namespace: &'static str,
    document_id: DocumentId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Topic<T> {
    pub const fn new(namespace: &'static str, document_id: DocumentId) -> Self {
        Self {
            namespace,
            document_id,
            _marker: PhantomData,
        }
    }

    pub fn namespace(&self) -> &'static str {
        self.namespace
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    fn key(&self) -> TopicKey {
        (self.namespace, self.document_id)
    }
}

// Manual impls keep `T` free of bounds
impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Topic<T> {}

impl<T> PartialEq for Topic<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<T> Eq for Topic<T> {}

impl<T> Hash for Topic<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl<T> fmt::Debug for Topic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({}:{})", self.namespace, self.document_id)
    }
}

impl<T> fmt::Display for Topic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.document_id)
    }
}

type TopicKey = (&'static str, DocumentId);

/// Identifier of one subscription, for logs and bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A live subscription. Dropping it stops delivery; pass it to
/// [`SyncChannel::unsubscribe`] to also release an empty topic.
pub struct Subscription<T> {
    id: SubscriberId,
    topic: Topic<T>,
    rx: broadcast::Receiver<Arc<T>>,
}

impl<T: Send + Sync + 'static> Subscription<T> {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn topic(&self) -> Topic<T> {
        self.topic
    }

    /// Next message, or `None` once the channel is closed.
    ///
    /// Lag is logged and skipped; the lost messages are not recovered.
    pub async fn recv(&mut self) -> Option<Arc<T>> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!(
                        "Subscriber {} on {} lagged, {skipped} messages dropped",
                        self.id,
                        self.topic
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .finish()
    }
}

/// Channel counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub messages_published: u64,
    /// Sum of receivers reached over all publishes
    pub deliveries: u64,
    pub active_topics: usize,
}

struct AtomicChannelStats {
    messages_published: AtomicU64,
    deliveries: AtomicU64,
}

/// The pub/sub backend shared by coordinators and sessions.
pub struct SyncChannel<T> {
    topics: RwLock<HashMap<TopicKey, broadcast::Sender<Arc<T>>>>,
    capacity: usize,
    closed: AtomicBool,
    stats: AtomicChannelStats,
}

impl<T: Send + Sync + 'static> SyncChannel<T> {
    /// `capacity` is how many messages a slow subscriber may fall behind
    /// before it starts losing them.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
            stats: AtomicChannelStats {
                messages_published: AtomicU64::new(0),
                deliveries: AtomicU64::new(0),
            },
        }
    }

    /// Start receiving messages published on `topic` from now on.
    pub async fn subscribe(&self, topic: &Topic<T>) -> Result<Subscription<T>, SyncError> {
        self.ensure_open()?;

        // Fast path: topic already has a sender
        {
            let topics = self.topics.read().await;
            if let Some(sender) = topics.get(&topic.key()) {
                return Ok(self.subscription(topic, sender));
            }
        }

        let mut topics = self.topics.write().await;
        // close() may have run while we waited for the write lock
        self.ensure_open()?;
        let sender = topics
            .entry(topic.key())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        let sub = self.subscription(topic, sender);
        log::debug!("Topic {topic} created");
        Ok(sub)
    }

    /// Stop a subscription and drop its topic if nobody else listens.
    pub async fn unsubscribe(&self, sub: Subscription<T>) -> bool {
        let topic = sub.topic;
        drop(sub);
        self.release(&topic).await
    }

    /// Drop `topic` if it has no receivers left. Returns true if removed.
    pub async fn release(&self, topic: &Topic<T>) -> bool {
        let mut topics = self.topics.write().await;
        let empty = topics
            .get(&topic.key())
            .is_some_and(|sender| sender.receiver_count() == 0);
        if empty {
            topics.remove(&topic.key());
            log::debug!("Topic {topic} removed");
        }
        empty
    }

    /// Fan `msg` out to every current subscriber of `topic`.
    ///
    /// Returns how many subscribers it reached; zero is not an error.
    pub async fn publish(&self, topic: &Topic<T>, msg: T) -> Result<usize, SyncError> {
        self.ensure_open()?;

        let topics = self.topics.read().await;
        let reached = match topics.get(&topic.key()) {
            Some(sender) => sender.send(Arc::new(msg)).unwrap_or(0),
            None => 0,
        };

        self.stats.messages_published.fetch_add(1, Ordering::Relaxed);
        self.stats
            .deliveries
            .fetch_add(reached as u64, Ordering::Relaxed);
        Ok(reached)
    }

    /// Tear the channel down. Subscribers see end-of-stream; later
    /// publish/subscribe calls fail with `ChannelUnavailable`.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut topics = self.topics.write().await;
        let count = topics.len();
        topics.clear();
        log::info!("Sync channel closed ({count} topics dropped)");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn subscriber_count(&self, topic: &Topic<T>) -> usize {
        self.topics
            .read()
            .await
            .get(&topic.key())
            .map_or(0, |sender| sender.receiver_count())
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    pub async fn stats(&self) -> ChannelStats {
        ChannelStats {
            messages_published: self.stats.messages_published.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            active_topics: self.topic_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn subscription(&self, topic: &Topic<T>, sender: &broadcast::Sender<Arc<T>>) -> Subscription<T> {
        Subscription {
            id: SubscriberId::new(),
            topic: *topic,
            rx: sender.subscribe(),
        }
    }

    fn ensure_open(&self) -> Result<(), SyncError> {
        if self.is_closed() {
            return Err(SyncError::ChannelUnavailable(
                "sync channel is closed".to_string(),
            ));
        }
        Ok(())
    }
}

impl<T: Send + Sync + 'static> Default for SyncChannel<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NS: &str = "test";

    fn topic(doc: DocumentId) -> Topic<String> {
        Topic::new(NS, doc)
    }

    #[tokio::test]
    async fn test_subscribe_publish_fan_out() {
        let channel = SyncChannel::<String>::new(16);
        let t = topic(DocumentId::new());

        let mut a = channel.subscribe(&t).await.unwrap();
        let mut b = channel.subscribe(&t).await.unwrap();
        let mut c = channel.subscribe(&t).await.unwrap();

        // Sender included: every subscriber gets it
        let reached = channel.publish(&t, "hello".to_string()).await.unwrap();
        assert_eq!(reached, 3);

        assert_eq!(*a.recv().await.unwrap(), "hello");
        assert_eq!(*b.recv().await.unwrap(), "hello");
        assert_eq!(*c.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let channel = SyncChannel::<String>::new(16);
        let reached = channel
            .publish(&topic(DocumentId::new()), "nobody".to_string())
            .await
            .unwrap();
        assert_eq!(reached, 0);
        assert_eq!(channel.topic_count().await, 0);
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let channel = SyncChannel::<String>::new(16);
        let t1 = topic(DocumentId::new());
        let t2 = topic(DocumentId::new());

        let mut s1 = channel.subscribe(&t1).await.unwrap();
        let _s2 = channel.subscribe(&t2).await.unwrap();

        assert_eq!(channel.publish(&t2, "for two".into()).await.unwrap(), 1);
        assert_eq!(channel.publish(&t1, "for one".into()).await.unwrap(), 1);
        assert_eq!(*s1.recv().await.unwrap(), "for one");
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let channel = SyncChannel::<String>::new(16);
        let doc = DocumentId::new();
        let a: Topic<String> = Topic::new("a", doc);
        let b: Topic<String> = Topic::new("b", doc);
        assert_ne!(a, b);

        let _sub = channel.subscribe(&a).await.unwrap();
        assert_eq!(channel.publish(&b, "x".into()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_no_replay_for_late_subscriber() {
        let channel = SyncChannel::<String>::new(16);
        let t = topic(DocumentId::new());
        let _early = channel.subscribe(&t).await.unwrap();

        channel.publish(&t, "before".into()).await.unwrap();
        let mut late = channel.subscribe(&t).await.unwrap();
        channel.publish(&t, "after".into()).await.unwrap();

        assert_eq!(*late.recv().await.unwrap(), "after");
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_empty_topic() {
        let channel = SyncChannel::<String>::new(16);
        let t = topic(DocumentId::new());

        let a = channel.subscribe(&t).await.unwrap();
        let b = channel.subscribe(&t).await.unwrap();
        assert_eq!(channel.subscriber_count(&t).await, 2);

        assert!(!channel.unsubscribe(a).await);
        assert_eq!(channel.topic_count().await, 1);
        assert!(channel.unsubscribe(b).await);
        assert_eq!(channel.topic_count().await, 0);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips() {
        let channel = SyncChannel::<String>::new(2);
        let t = topic(DocumentId::new());
        let mut sub = channel.subscribe(&t).await.unwrap();

        for i in 0..5 {
            channel.publish(&t, format!("m{i}")).await.unwrap();
        }

        // Oldest messages are lost; the newest survive
        assert_eq!(*sub.recv().await.unwrap(), "m3");
        assert_eq!(*sub.recv().await.unwrap(), "m4");
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let channel = SyncChannel::<String>::new(16);
        let t = topic(DocumentId::new());
        let mut sub = channel.subscribe(&t).await.unwrap();

        channel.close().await;
        assert!(channel.is_closed());
        assert!(sub.recv().await.is_none());
        assert!(matches!(
            channel.publish(&t, "x".into()).await,
            Err(SyncError::ChannelUnavailable(_))
        ));
        assert!(matches!(
            channel.subscribe(&t).await,
            Err(SyncError::ChannelUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_stats() {
        let channel = SyncChannel::<String>::new(16);
        let t = topic(DocumentId::new());
        let _a = channel.subscribe(&t).await.unwrap();
        let _b = channel.subscribe(&t).await.unwrap();

        channel.publish(&t, "1".into()).await.unwrap();
        channel.publish(&t, "2".into()).await.unwrap();

        let stats = channel.stats().await;
        assert_eq!(stats.messages_published, 2);
        assert_eq!(stats.deliveries, 4);
        assert_eq!(stats.active_topics, 1);
    }
}
