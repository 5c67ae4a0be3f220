//! Durable per-owner snapshots of each collection.
//!
//! The fallback store is the last known-good state for an owner. It backs
//! reads when the remote service is unreachable or refuses a request, and it
//! is updated on every local mutation regardless of the remote outcome.
//! Loads never fail: missing or malformed data reads as an empty collection.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::model::Collection;

use super::storage::KeyValueStore;
use super::traits::{collection_key, Record};

const SNAPSHOT_PREFIX: &str = "fallback:";
const STAMP_PREFIX: &str = "fetched:";

/// Default age after which `cleanup_stale` drops a snapshot
pub const DEFAULT_STALE_AFTER_DAYS: i64 = 30;

fn snapshot_key(collection: Collection, owner: &str) -> String {
  format!("{}{}", SNAPSHOT_PREFIX, collection_key(collection, owner))
}

fn stamp_key(collection: Collection, owner: &str) -> String {
  format!("{}{}", STAMP_PREFIX, collection_key(collection, owner))
}

/// Typed view over the durable key-value store.
#[derive(Clone)]
pub struct FallbackStore {
  store: Arc<dyn KeyValueStore>,
  clock: Arc<dyn Clock>,
}

impl FallbackStore {
  pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
    Self { store, clock }
  }

  /// Last persisted snapshot of `T`'s collection for `owner`.
  ///
  /// Returns an empty list if nothing is persisted. Unparsable snapshots are
  /// deleted and read as empty.
  pub fn load<T: Record>(&self, owner: &str) -> Vec<T> {
    let key = snapshot_key(T::collection(), owner);
    let raw = match self.store.get(&key) {
      Ok(Some(raw)) => raw,
      Ok(None) => return Vec::new(),
      Err(e) => {
        warn!(key = %key, error = %e, "fallback read failed");
        return Vec::new();
      }
    };

    match serde_json::from_str::<Vec<T>>(&raw) {
      Ok(rows) => rows,
      Err(e) => {
        let err = SyncError::MalformedLocalData {
          key: key.clone(),
          message: e.to_string(),
        };
        warn!(error = %err, "dropping malformed fallback snapshot");
        self.remove_key(&key);
        Vec::new()
      }
    }
  }

  /// Persist `rows` as the full snapshot, replacing any prior value.
  pub fn save<T: Record>(&self, owner: &str, rows: &[T]) -> Result<()> {
    let key = snapshot_key(T::collection(), owner);
    let raw = serde_json::to_string(rows)?;
    self
      .store
      .set(&key, &raw)
      .map_err(|e| SyncError::Storage(e.to_string()))
  }

  /// Load, apply `change`, and save back. Returns the saved snapshot.
  pub fn modify<T, F>(&self, owner: &str, change: F) -> Result<Vec<T>>
  where
    T: Record,
    F: FnOnce(&mut Vec<T>),
  {
    let mut rows = self.load::<T>(owner);
    change(&mut rows);
    self.save(owner, &rows)?;
    Ok(rows)
  }

  /// Remember that `T`'s collection was fetched from the remote just now.
  pub fn mark_fetched<T: Record>(&self, owner: &str) -> Result<()> {
    let key = stamp_key(T::collection(), owner);
    self
      .store
      .set(&key, &self.clock.now().to_rfc3339())
      .map_err(|e| SyncError::Storage(e.to_string()))
  }

  /// When `T`'s collection was last fetched from the remote, if known.
  pub fn fetched_at<T: Record>(&self, owner: &str) -> Option<DateTime<Utc>> {
    let key = stamp_key(T::collection(), owner);
    let raw = self.store.get(&key).ok().flatten()?;
    match DateTime::parse_from_rfc3339(&raw) {
      Ok(at) => Some(at.with_timezone(&Utc)),
      Err(_) => {
        self.remove_key(&key);
        None
      }
    }
  }

  /// Remove every persisted collection (and fetch stamp) for `owner`.
  pub fn clear_all(&self, owner: &str) {
    for collection in Collection::ALL {
      self.remove_key(&snapshot_key(collection, owner));
      self.remove_key(&stamp_key(collection, owner));
    }
    debug!(owner, "cleared fallback snapshots");
  }

  /// Delete snapshots whose first row is older than `max_age`.
  ///
  /// Snapshots that fail to parse are deleted as well. Returns the number of
  /// snapshots removed.
  pub fn cleanup_stale(&self, max_age: Duration) -> usize {
    let keys = match self.store.keys_with_prefix(SNAPSHOT_PREFIX) {
      Ok(keys) => keys,
      Err(e) => {
        warn!(error = %e, "fallback key scan failed");
        return 0;
      }
    };

    let now = self.clock.now();
    let mut removed = 0;

    for key in keys {
      let stale = match self.store.get(&key) {
        Ok(Some(raw)) => match serde_json::from_str::<Vec<Value>>(&raw) {
          Ok(rows) => rows
            .first()
            .and_then(row_created_at)
            .is_some_and(|created_at| now - created_at > max_age),
          Err(_) => true,
        },
        Ok(None) => false,
        Err(e) => {
          warn!(key = %key, error = %e, "fallback read failed during cleanup");
          false
        }
      };

      if stale {
        self.remove_key(&key);
        let stamp = key.replacen(SNAPSHOT_PREFIX, STAMP_PREFIX, 1);
        self.remove_key(&stamp);
        removed += 1;
      }
    }

    if removed > 0 {
      debug!(removed, "cleaned up stale fallback snapshots");
    }
    removed
  }

  /// Keys of every persisted snapshot, e.g. `fallback:products_u1`.
  pub fn snapshot_keys(&self) -> Vec<String> {
    self
      .store
      .keys_with_prefix(SNAPSHOT_PREFIX)
      .unwrap_or_default()
  }

  fn remove_key(&self, key: &str) {
    if let Err(e) = self.store.remove(key) {
      warn!(key = %key, error = %e, "fallback remove failed");
    }
  }
}

fn row_created_at(row: &Value) -> Option<DateTime<Utc>> {
  let raw = row.get("created_at")?.as_str()?;
  DateTime::parse_from_rfc3339(raw)
    .ok()
    .map(|at| at.with_timezone(&Utc))
}
