//! In-memory TTL cache tier.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use crate::clock::Clock;
use crate::model::{CakeItem, Collection, Product, Sale, StockMovement};

use super::traits::collection_key;

/// Default time-to-live for entity collections, in seconds
pub const DEFAULT_TTL_SECS: i64 = 3600;

/// A full cached value with the time it was written.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
  pub data: V,
  pub written_at: DateTime<Utc>,
}

/// Key/value cache whose entries expire after a fixed TTL.
///
/// Writes always replace the whole value for a key; there is no merging.
#[derive(Debug)]
pub struct TtlCache<V> {
  entries: Mutex<HashMap<String, CacheEntry<V>>>,
  ttl: Duration,
  clock: Arc<dyn Clock>,
}

impl<V: Clone> TtlCache<V> {
  pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      ttl,
      clock,
    }
  }

  pub fn ttl(&self) -> Duration {
    self.ttl
  }

  fn is_expired(&self, written_at: DateTime<Utc>) -> bool {
    self.clock.now() - written_at > self.ttl
  }

  /// Fresh value for `key`, or `None` if missing or older than the TTL.
  pub fn get(&self, key: &str) -> Option<V> {
    let mut entries = self.entries.lock().ok()?;
    let expired = match entries.get(key) {
      Some(entry) if !self.is_expired(entry.written_at) => return Some(entry.data.clone()),
      Some(_) => true,
      None => false,
    };
    if expired {
      entries.remove(key);
    }
    None
  }

  /// Store `data` under `key` with a fresh timestamp.
  pub fn set(&self, key: &str, data: V) {
    let written_at = self.clock.now();
    if let Ok(mut entries) = self.entries.lock() {
      entries.insert(key.to_string(), CacheEntry { data, written_at });
    }
  }

  pub fn remove(&self, key: &str) {
    if let Ok(mut entries) = self.entries.lock() {
      entries.remove(key);
    }
  }

  /// Whether an entry exists for `key`, fresh or not.
  pub fn contains(&self, key: &str) -> bool {
    self
      .entries
      .lock()
      .map(|entries| entries.contains_key(key))
      .unwrap_or(false)
  }

  pub fn size(&self) -> usize {
    self.entries.lock().map(|e| e.len()).unwrap_or(0)
  }

  pub fn clear(&self) {
    if let Ok(mut entries) = self.entries.lock() {
      entries.clear();
    }
  }
}

/// One TTL cache per entity collection.
#[derive(Debug)]
pub struct CacheSet {
  pub products: TtlCache<Vec<Product>>,
  pub movements: TtlCache<Vec<StockMovement>>,
  pub sales: TtlCache<Vec<Sale>>,
  pub bolos: TtlCache<Vec<CakeItem>>,
}

impl CacheSet {
  pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
    Self {
      products: TtlCache::new(ttl, Arc::clone(&clock)),
      movements: TtlCache::new(ttl, Arc::clone(&clock)),
      sales: TtlCache::new(ttl, Arc::clone(&clock)),
      bolos: TtlCache::new(ttl, clock),
    }
  }

  pub fn size(&self) -> usize {
    self.products.size() + self.movements.size() + self.sales.size() + self.bolos.size()
  }

  pub fn clear(&self) {
    self.products.clear();
    self.movements.clear();
    self.sales.clear();
    self.bolos.clear();
  }

  /// Drop every collection cached for `owner`.
  pub fn clear_owner(&self, owner: &str) {
    self.products.remove(&collection_key(Collection::Products, owner));
    self.movements.remove(&collection_key(Collection::Movements, owner));
    self.sales.remove(&collection_key(Collection::Sales, owner));
    self.bolos.remove(&collection_key(Collection::Bolos, owner));
  }
}
