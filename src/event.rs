use tokio::sync::broadcast;

use crate::cache::DataSource;
use crate::model::Collection;

/// Notifications published by the sync service
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
  /// The active owner changed; in-memory state now belongs to `current`
  OwnerChanged {
    previous: Option<String>,
    current: Option<String>,
  },
  /// A full refresh cycle began
  RefreshStarted { forced: bool },
  /// A full refresh cycle ended
  RefreshFinished { fell_back: bool },
  /// A collection's in-memory data was replaced
  CollectionLoaded {
    collection: Collection,
    source: DataSource,
    count: usize,
  },
  /// A mutation could not reach the remote and was stored locally only
  SavedLocally { collection: Collection },
}

/// Fan-out of [`SyncEvent`]s to any number of subscribers
pub struct EventBus {
  tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity);
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.tx.subscribe()
  }

  /// Publish to current subscribers; nobody listening is fine.
  pub fn emit(&self, event: SyncEvent) {
    let _ = self.tx.send(event);
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(64)
  }
}
