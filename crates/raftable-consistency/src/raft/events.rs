// State machine change notifications
// Applied mutations are published to subscribers over unbounded channels so a
// slow subscriber never holds up command application.

use std::sync::Arc;

use parking_lot::Mutex;
use raftable_api::{TableMetadata, TableModificationEvent};
use tokio::sync::mpsc;
use tracing::trace;

use super::state::DatabaseState;

/// Something the state machine did, in apply order
#[derive(Debug, Clone)]
pub enum DatabaseEvent {
    TableCreated(TableMetadata),
    TableDropped(String),
    TableModified(TableModificationEvent),
    /// Local state was replaced wholesale by a snapshot
    SnapshotInstalled(Arc<DatabaseState>),
}

/// Fan-out of [`DatabaseEvent`]s to any number of subscribers
#[derive(Default)]
pub struct DatabaseEventPublisher {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<DatabaseEvent>>>,
}

impl DatabaseEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every event published from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DatabaseEvent> {
        self.subscribe_with(None)
    }

    /// Subscribe, receiving `initial` ahead of any later event
    pub fn subscribe_with(&self, initial: Option<DatabaseEvent>) -> mpsc::UnboundedReceiver<DatabaseEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(event) = initial {
            let _ = tx.send(event);
        }
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: DatabaseEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        trace!(subscribers = subscribers.len(), "Published database event");
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = DatabaseEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
