//! Two-path writes: remote first, local fallback store when the remote is
//! unavailable.
//!
//! A write that reaches the remote merges the authoritative row into memory,
//! the cache (when an entry exists) and the fallback store. A write that
//! cannot reach it lands in memory and the fallback store only, and the cache
//! entry for the collection is dropped so it cannot hide the local change.

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::cache::{collection_key, Record};
use crate::error::{Result, SyncError};
use crate::event::SyncEvent;
use crate::model::{
  CakeItem, Collection, NewCakeItem, NewProduct, NewSale, NewStockMovement, Product, RecordId, Sale,
  StockMovement,
};
use crate::remote::{Filter, Remote};

use super::SyncService;

/// Where a mutation was made durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteTarget {
  /// Accepted by the remote service
  Remote,
  /// Saved to the fallback store only
  Local,
}

/// Outcome of a mutation that did not fail outright.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationResult<T> {
  pub data: T,
  pub target: WriteTarget,
  /// Why the remote was not used, for local writes
  pub reason: Option<SyncError>,
}

impl<T> MutationResult<T> {
  fn remote(data: T) -> Self {
    Self {
      data,
      target: WriteTarget::Remote,
      reason: None,
    }
  }

  fn local(data: T, reason: SyncError) -> Self {
    Self {
      data,
      target: WriteTarget::Local,
      reason: Some(reason),
    }
  }

  pub fn saved_locally(&self) -> bool {
    self.target == WriteTarget::Local
  }
}

/// Edit applied identically to every local tier of one collection.
enum Change<'a, T> {
  Upsert(&'a T),
  Remove(&'a RecordId),
}

impl<T: Record> Change<'_, T> {
  fn apply(&self, rows: &mut Vec<T>) {
    match self {
      Change::Upsert(record) => match rows.iter_mut().find(|r| r.id() == record.id()) {
        Some(slot) => *slot = (*record).clone(),
        None => rows.insert(0, (*record).clone()),
      },
      Change::Remove(id) => rows.retain(|r| r.id() != *id),
    }
  }
}

impl<R: Remote + Sync + 'static> SyncService<R> {
  // ==========================================================================
  // Generic operations
  // ==========================================================================

  /// Create a record from `draft`.
  ///
  /// Falls back to a locally identified record when the remote is
  /// unavailable; only an unexpected failure is an error.
  pub async fn add<T: Record>(&self, draft: T::Draft) -> Result<MutationResult<T>> {
    let (owner, generation) = self.active_owner()?;
    let collection = T::collection();

    let mut row = serde_json::to_value(&draft)?;
    match row.as_object_mut() {
      Some(fields) => {
        fields.insert("user_id".to_string(), Value::from(owner.as_str()));
      }
      None => {
        return Err(SyncError::Serialization(format!(
          "{} draft is not a JSON object",
          collection
        )))
      }
    }

    let attempt = match self.write_gate(&owner).await {
      Ok(()) => {
        let remote = &self.inner.remote;
        let row = &row;
        self
          .inner
          .config
          .retry
          .run(move || remote.insert(collection, row))
          .await
          .and_then(|stored| self.parse_row::<T>(stored))
      }
      Err(e) => Err(e),
    };

    match attempt {
      Ok(record) => {
        self.inner.governor.record_request();
        self.merge(&owner, generation, Change::Upsert(&record), true)?;
        debug!(collection = %collection, id = %record.id(), "record created remotely");
        Ok(MutationResult::remote(record))
      }
      Err(reason) if reason.is_recoverable() => {
        let now = self.inner.clock.now();
        let id = RecordId::local(now, self.next_local_seq());
        let record = T::from_draft(draft, id, &owner, now);
        self.merge(&owner, generation, Change::Upsert(&record), false)?;
        self.saved_locally::<T>(&reason);
        Ok(MutationResult::local(record, reason))
      }
      Err(e) => Err(e),
    }
  }

  /// Apply a JSON-object `patch` to the record with `id`.
  ///
  /// `id` and `user_id` in the patch are ignored.
  pub async fn update<T: Record>(&self, id: &RecordId, patch: Value) -> Result<MutationResult<T>> {
    let (owner, generation) = self.active_owner()?;
    let collection = T::collection();

    let Value::Object(mut fields) = patch else {
      return Err(SyncError::Serialization(format!(
        "{} patch is not a JSON object",
        collection
      )));
    };
    fields.remove("id");
    fields.remove("user_id");
    let patch = Value::Object(fields);

    let attempt = match self.write_gate(&owner).await {
      Ok(()) => {
        let remote = &self.inner.remote;
        let patch = &patch;
        let filters = &match_filters(id, &owner);
        self
          .inner
          .config
          .retry
          .run(move || remote.update(collection, patch, filters))
          .await
          .and_then(|rows| {
            rows
              .into_iter()
              .next()
              .ok_or_else(|| SyncError::RemoteRejected("no rows matched".to_string()))
          })
          .and_then(|stored| self.parse_row::<T>(stored))
      }
      Err(e) => Err(e),
    };

    match attempt {
      Ok(record) => {
        self.inner.governor.record_request();
        self.merge(&owner, generation, Change::Upsert(&record), true)?;
        debug!(collection = %collection, id = %id, "record updated remotely");
        Ok(MutationResult::remote(record))
      }
      Err(reason) if reason.is_recoverable() => {
        let current = self
          .find_local::<T>(&owner, id)
          .ok_or_else(|| not_found(collection, id))?;
        let record = apply_patch(&current, &patch)?;
        self.merge(&owner, generation, Change::Upsert(&record), false)?;
        self.saved_locally::<T>(&reason);
        Ok(MutationResult::local(record, reason))
      }
      Err(e) => Err(e),
    }
  }

  /// Delete the record with `id`. Returns the id that was removed.
  pub async fn delete<T: Record>(&self, id: &RecordId) -> Result<MutationResult<RecordId>> {
    let (owner, generation) = self.active_owner()?;
    let collection = T::collection();

    let attempt = match self.write_gate(&owner).await {
      Ok(()) => {
        let remote = &self.inner.remote;
        let filters = &match_filters(id, &owner);
        self
          .inner
          .config
          .retry
          .run(move || remote.delete(collection, filters))
          .await
      }
      Err(e) => Err(e),
    };

    match attempt {
      Ok(()) => {
        self.inner.governor.record_request();
        self.merge::<T>(&owner, generation, Change::Remove(id), true)?;
        debug!(collection = %collection, id = %id, "record deleted remotely");
        Ok(MutationResult::remote(id.clone()))
      }
      Err(reason) if reason.is_recoverable() => {
        if self.find_local::<T>(&owner, id).is_none() {
          return Err(not_found(collection, id));
        }
        self.merge::<T>(&owner, generation, Change::Remove(id), false)?;
        self.saved_locally::<T>(&reason);
        Ok(MutationResult::local(id.clone(), reason))
      }
      Err(e) => Err(e),
    }
  }

  // ==========================================================================
  // Typed operations
  // ==========================================================================

  pub async fn add_product(&self, draft: NewProduct) -> Result<MutationResult<Product>> {
    self.add(draft).await
  }

  pub async fn update_product(&self, id: &RecordId, patch: Value) -> Result<MutationResult<Product>> {
    self.update(id, patch).await
  }

  pub async fn delete_product(&self, id: &RecordId) -> Result<MutationResult<RecordId>> {
    self.delete::<Product>(id).await
  }

  pub async fn add_movement(
    &self,
    draft: NewStockMovement,
  ) -> Result<MutationResult<StockMovement>> {
    self.add(draft).await
  }

  pub async fn update_movement(
    &self,
    id: &RecordId,
    patch: Value,
  ) -> Result<MutationResult<StockMovement>> {
    self.update(id, patch).await
  }

  pub async fn delete_movement(&self, id: &RecordId) -> Result<MutationResult<RecordId>> {
    self.delete::<StockMovement>(id).await
  }

  pub async fn add_sale(&self, draft: NewSale) -> Result<MutationResult<Sale>> {
    self.add(draft).await
  }

  pub async fn update_sale(&self, id: &RecordId, patch: Value) -> Result<MutationResult<Sale>> {
    self.update(id, patch).await
  }

  pub async fn delete_sale(&self, id: &RecordId) -> Result<MutationResult<RecordId>> {
    self.delete::<Sale>(id).await
  }

  pub async fn add_bolo(&self, draft: NewCakeItem) -> Result<MutationResult<CakeItem>> {
    self.add(draft).await
  }

  pub async fn update_bolo(&self, id: &RecordId, patch: Value) -> Result<MutationResult<CakeItem>> {
    self.update(id, patch).await
  }

  pub async fn delete_bolo(&self, id: &RecordId) -> Result<MutationResult<RecordId>> {
    self.delete::<CakeItem>(id).await
  }

  // ==========================================================================
  // Helpers
  // ==========================================================================

  /// Whether a write may be attempted remotely for `owner`.
  ///
  /// Offline mode and a missing or different remote identity both send the
  /// write straight to the local path without touching the remote.
  async fn write_gate(&self, owner: &str) -> Result<()> {
    if self.inner.governor.is_offline() {
      return Err(SyncError::OfflineModeActive);
    }

    let timeout = self.inner.config.retry.timeout;
    match tokio::time::timeout(timeout, self.inner.remote.current_identity()).await {
      Ok(Some(identity)) if identity == owner => Ok(()),
      Ok(_) => Err(SyncError::NotAuthenticated),
      Err(_) => Err(SyncError::RemoteTimeout(timeout)),
    }
  }

  fn parse_row<T: Record>(&self, row: Value) -> Result<T> {
    serde_json::from_value(row).map_err(|e| SyncError::MalformedRemoteData {
      collection: T::collection(),
      message: e.to_string(),
    })
  }

  /// The record as held in memory, or in the fallback snapshot.
  fn find_local<T: Record>(&self, owner: &str, id: &RecordId) -> Option<T> {
    let in_memory = {
      let state = self.state();
      if state.owner.as_deref() == Some(owner) {
        T::slot(&state.data).iter().find(|r| r.id() == id).cloned()
      } else {
        None
      }
    };

    in_memory.or_else(|| {
      self
        .inner
        .fallback
        .load::<T>(owner)
        .into_iter()
        .find(|r| r.id() == id)
    })
  }

  /// Apply `change` to memory and the fallback store, and keep the cache
  /// consistent: merged into an existing entry for remote writes, dropped for
  /// local ones. Memory is left alone if the owner changed meanwhile.
  fn merge<T: Record>(
    &self,
    owner: &str,
    generation: u64,
    change: Change<'_, T>,
    confirmed: bool,
  ) -> Result<()> {
    self
      .inner
      .fallback
      .modify::<T, _>(owner, |rows| change.apply(rows))?;

    let key = collection_key(T::collection(), owner);
    let cache = T::cache(&self.inner.caches);
    if confirmed {
      if let Some(mut rows) = cache.get(&key) {
        change.apply(&mut rows);
        cache.set(&key, rows);
      }
    } else {
      cache.remove(&key);
    }

    let mut state = self.state();
    if state.generation == generation {
      change.apply(T::slot_mut(&mut state.data));
    }
    Ok(())
  }

  fn saved_locally<T: Record>(&self, reason: &SyncError) {
    warn!(collection = %T::collection(), reason = %reason, "remote write unavailable, saved locally");
    self.inner.events.emit(SyncEvent::SavedLocally {
      collection: T::collection(),
    });
  }
}

fn match_filters(id: &RecordId, owner: &str) -> Vec<Filter> {
  vec![Filter::eq("id", id.to_value()), Filter::eq("user_id", owner)]
}

fn not_found(collection: Collection, id: &RecordId) -> SyncError {
  SyncError::RecordNotFound {
    collection,
    id: id.to_string(),
  }
}

/// Overlay the patch's fields onto `record`.
fn apply_patch<T: Record>(record: &T, patch: &Value) -> Result<T> {
  let mut value = serde_json::to_value(record)?;
  if let (Value::Object(target), Value::Object(fields)) = (&mut value, patch) {
    merge_fields(target, fields);
  }
  Ok(serde_json::from_value(value)?)
}

fn merge_fields(target: &mut Map<String, Value>, fields: &Map<String, Value>) {
  for (name, value) in fields {
    target.insert(name.clone(), value.clone());
  }
}
