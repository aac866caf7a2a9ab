//! Fan-out of sync progress to WebSocket subscribers.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use super::ServerMessage;

/// Registry of live WebSocket subscribers.
///
/// Each subscriber owns an unbounded queue; the socket task drains it.
#[derive(Debug, Default)]
pub struct ProgressHub {
    subscribers: DashMap<Uuid, UnboundedSender<ServerMessage>>,
}

impl ProgressHub {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a subscriber and hand back its id and outgoing queue.
    pub fn subscribe(&self) -> (Uuid, UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.subscribers.insert(id, tx);
        tracing::info!(subscriber = %id, "progress subscriber added");
        (id, rx)
    }

    pub fn unsubscribe(&self, id: &Uuid) {
        if self.subscribers.remove(id).is_some() {
            tracing::info!(subscriber = %id, "progress subscriber removed");
        }
    }

    /// Queue `message` for every subscriber. Returns how many accepted it.
    pub fn publish(&self, message: &ServerMessage) -> usize {
        let delivered = self
            .subscribers
            .iter()
            .filter(|sub| sub.value().send(message.clone()).is_ok())
            .count();
        tracing::trace!(delivered, "published progress");
        delivered
    }

    /// Queue `message` for one subscriber only.
    pub fn reply(&self, id: &Uuid, message: ServerMessage) -> bool {
        self.subscribers
            .get(id)
            .is_some_and(|sub| sub.send(message).is_ok())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
