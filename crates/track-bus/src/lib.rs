use std::collections::HashMap;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

/// Default per-topic channel depth. Receivers that fall further behind than
/// this lag and lose the oldest messages instead of backpressuring the
/// publisher; a live feed only cares about the most recent value.
pub const DEFAULT_TOPIC_CAPACITY: usize = 64;

/// One message delivered on a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus has been shut down")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Topic-based publish/subscribe surface. Implemented by the in-memory
/// [`LocalBus`] and by the remote connection manager in the client crate,
/// so publishers and subscribers do not care which side of a socket their
/// counterpart lives on.
pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage>;

    /// Publishes to every current subscriber of `topic` and returns how many
    /// receivers the message reached. Zero subscribers is not an error: the
    /// feed carries no obligation to queue for absent listeners.
    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<usize>;
}

/// In-memory bus backed by one broadcast channel per topic. Serves unit
/// tests directly and provides the inbound fan-out inside the connection
/// manager.
#[derive(Debug)]
pub struct LocalBus {
    capacity: usize,
    topics: parking_lot::RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            topics: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Number of live receivers currently attached to `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(broadcast::Sender::receiver_count)
            .unwrap_or(0)
    }

    /// Drops every topic channel. Outstanding receivers observe `Closed` on
    /// their next `recv`, which is how subscription teardown propagates when
    /// the owning connection goes away.
    pub fn reset(&self) {
        self.topics.write().clear();
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.sender_for(topic).subscribe()
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<usize> {
        let sender = self.sender_for(topic);
        let message = BusMessage {
            topic: topic.to_string(),
            payload,
        };
        Ok(sender.send(message).unwrap_or(0))
    }
}
