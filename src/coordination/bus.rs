use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::coordination::Message;
use crate::error::Result;

/// Capacity of each subscriber's delivery queue.
const SUBSCRIBER_QUEUE: usize = 256;

/// Topic-based pub/sub used for all controller↔worker coordination.
///
/// The protocol built on top never blocks waiting for a reply and tolerates
/// both loss and duplication, so implementations only need best-effort
/// fan-out. `InProcessBus` serves a single-process pool; an external broker
/// (e.g. Redis pub/sub) plugs in behind the same trait.
#[async_trait]
pub trait CoordinationBus: Send + Sync {
    async fn publish(&self, topic: &str, message: Message) -> Result<()>;

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Message>>;
}

/// In-process broker: per-topic fan-out over bounded mpsc channels.
#[derive(Clone, Default)]
pub struct InProcessBus {
    topics: Arc<Mutex<HashMap<String, Vec<mpsc::Sender<Message>>>>>,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationBus for InProcessBus {
    async fn publish(&self, topic: &str, message: Message) -> Result<()> {
        let mut topics = self.topics.lock().await;
        let Some(subscribers) = topics.get_mut(topic) else {
            // Nobody listening; fine for a fire-and-forget broker
            tracing::debug!(topic, kind = message.kind(), "Publish to topic with no subscribers");
            return Ok(());
        };

        subscribers.retain(|tx| !tx.is_closed());
        for tx in subscribers.iter() {
            // A subscriber with a full queue misses the message rather than
            // stalling the publisher; the protocol's timeouts recover.
            if let Err(err) = tx.try_send(message.clone()) {
                tracing::warn!(
                    topic,
                    kind = message.kind(),
                    error = %err,
                    "Dropping message for slow subscriber"
                );
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Message>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        self.topics
            .lock()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

/// Shared handle type used throughout the controller and workers.
pub type BusHandle = Arc<dyn CoordinationBus>;

impl std::fmt::Debug for InProcessBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessBus").finish_non_exhaustive()
    }
}
