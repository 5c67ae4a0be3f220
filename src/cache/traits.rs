//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

use crate::model::{Collection, Dataset, RecordId};

use super::memory::{CacheSet, TtlCache};

/// Trait for rows that can be cached, persisted locally and synced.
///
/// Implementors expose identity, ownership and age; everything else in the
/// row is carried through serialization untouched.
pub trait Record: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Payload accepted when creating a new row
  type Draft: Serialize + Send + Sync;

  /// Collection the row belongs to
  fn collection() -> Collection;

  fn id(&self) -> &RecordId;

  /// Owner identity (`user_id` column)
  fn owner_id(&self) -> &str;

  /// Creation timestamp, used for aging decisions
  fn created_at(&self) -> Option<DateTime<Utc>>;

  /// Build a row that only exists locally.
  fn from_draft(draft: Self::Draft, id: RecordId, owner: &str, created_at: DateTime<Utc>)
    -> Self;

  /// This collection's slot in the in-memory state
  fn slot(data: &Dataset) -> &Vec<Self>;

  fn slot_mut(data: &mut Dataset) -> &mut Vec<Self>;

  /// This collection's TTL cache
  fn cache(caches: &CacheSet) -> &TtlCache<Vec<Self>>;
}

/// Key shared by the cache and the fallback store for one owner's collection,
/// e.g. `products_u1`.
pub fn collection_key(collection: Collection, owner: &str) -> String {
  format!("{}_{}", collection.name(), owner)
}

/// Where a collection's in-memory data came from after a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
  /// Fresh data from the remote service
  Network,
  /// In-memory TTL cache hit
  Cache,
  /// Durable snapshot still inside its TTL, no request made
  LocalFresh,
  /// Remote unavailable or refused, served the fallback snapshot
  Fallback,
  /// Throttled; in-memory state left as it was
  Skipped,
}

/// Result from a fetch, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct FetchResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: DataSource,
}

impl<T> FetchResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: DataSource::Network,
    }
  }

  pub fn from_cache(data: T) -> Self {
    Self {
      data,
      source: DataSource::Cache,
    }
  }

  pub fn from_local(data: T) -> Self {
    Self {
      data,
      source: DataSource::LocalFresh,
    }
  }

  pub fn fallback(data: T) -> Self {
    Self {
      data,
      source: DataSource::Fallback,
    }
  }

  pub fn skipped(data: T) -> Self {
    Self {
      data,
      source: DataSource::Skipped,
    }
  }
}
