//! Throttled refresh scheduler and the per-collection fetch protocol.
//!
//! A refresh cycle walks the collections in [`Collection::ALL`] order with a
//! fixed pause between fetches. Each fetch tries, in order: the TTL cache, a
//! fresh fallback snapshot, the minimum-interval throttle, the request
//! governor and finally the remote. Recoverable failures serve the fallback
//! snapshot instead.

use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::cache::{collection_key, DataSource, FetchResult, Record};
use crate::error::{Result, SyncError};
use crate::event::SyncEvent;
use crate::model::{CakeItem, Collection, Product, Sale, StockMovement};
use crate::remote::{Remote, SelectQuery};

use super::{PendingRefresh, SyncService, SyncState};

/// What one collection ended up with during a refresh cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionOutcome {
  pub collection: Collection,
  pub source: DataSource,
  pub count: usize,
  /// Why the remote was not used, when it was wanted
  #[serde(skip_serializing_if = "Option::is_none", serialize_with = "as_display")]
  pub reason: Option<SyncError>,
}

/// Summary of a completed refresh cycle.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
  pub forced: bool,
  pub started_at: DateTime<Utc>,
  pub collections: Vec<CollectionOutcome>,
  /// An unrecoverable error made the cycle reload everything from the fallback store
  pub fell_back: bool,
}

fn as_display<S: serde::Serializer>(
  reason: &Option<SyncError>,
  serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
  match reason {
    Some(e) => serializer.serialize_str(&e.to_string()),
    None => serializer.serialize_none(),
  }
}

/// What an [`InFlight`] guard holds.
#[derive(Debug, Clone, Copy)]
enum Claim {
  Cycle,
  Fetch(Collection),
}

/// Releases its claim when dropped, unless the owner changed meanwhile
/// (an owner switch resets all refresh bookkeeping).
struct InFlight<'a> {
  state: &'a Mutex<SyncState>,
  claim: Claim,
  generation: u64,
}

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    let mut state = self
      .state
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    if state.generation != self.generation {
      return;
    }
    match self.claim {
      Claim::Cycle => {
        state.refresh.cycles_in_flight = state.refresh.cycles_in_flight.saturating_sub(1);
      }
      Claim::Fetch(collection) => {
        state.refresh.fetching.remove(&collection);
      }
    }
  }
}

/// How a single fetch should treat the minimum-interval throttle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Throttle {
  Apply,
  /// Forced fetches and fetches inside a cycle that already passed its own check
  Bypass,
}

type Fetched<T> = (FetchResult<Vec<T>>, Option<SyncError>);

/// Decode remote rows one by one, skipping the ones that do not fit `T`.
/// Only a batch with no usable row at all is malformed.
fn decode_rows<T: Record>(collection: Collection, rows: Vec<Value>) -> Result<Vec<T>> {
  let total = rows.len();
  let mut decoded = Vec::with_capacity(total);
  let mut last_error = None;

  for row in rows {
    match serde_json::from_value::<T>(row) {
      Ok(record) => decoded.push(record),
      Err(e) => {
        warn!(collection = %collection, error = %e, "skipping malformed row");
        last_error = Some(e);
      }
    }
  }

  match last_error {
    Some(e) if decoded.is_empty() => Err(SyncError::MalformedRemoteData {
      collection,
      message: e.to_string(),
    }),
    Some(_) => {
      warn!(collection = %collection, kept = decoded.len(), total, "kept the well-formed rows");
      Ok(decoded)
    }
    None => Ok(decoded),
  }
}

impl<R: Remote + Sync + 'static> SyncService<R> {
  // ==========================================================================
  // Scheduling
  // ==========================================================================

  /// Ask for a refresh of every collection.
  ///
  /// A non-forced request (re)starts the debounce timer; only the most recent
  /// timer survives. A forced request cancels any pending timer and starts
  /// the executor right away. Either way the work runs on a spawned task,
  /// which fails with [`SyncError::NoRuntime`] when there is no runtime to
  /// spawn it on.
  pub fn request_refresh(&self, force: bool) -> Result<()> {
    let runtime = self.runtime()?;

    if force {
      self.state().refresh.cancel_pending();
      let service = self.clone();
      runtime.spawn(async move {
        service.execute_refresh(true).await;
      });
      return Ok(());
    }

    let seq = self.inner.debounce_seq.fetch_add(1, Ordering::SeqCst) + 1;
    let delay = self.inner.config.debounce;
    let service = self.clone();

    let mut state = self.state();
    state.refresh.cancel_pending();
    let handle = runtime.spawn(async move {
      tokio::time::sleep(delay).await;
      {
        let mut state = service.state();
        match &state.refresh.pending {
          Some(pending) if pending.seq == seq => state.refresh.pending = None,
          // Superseded while waking up
          _ => return,
        }
      }
      service.execute_refresh(false).await;
    });
    state.refresh.pending = Some(PendingRefresh { seq, handle });
    debug!(seq, delay_secs = delay.as_secs(), "refresh debounced");
    Ok(())
  }

  /// Cancel any pending debounce and run a cycle on the current task.
  pub async fn refresh_now(&self, force: bool) -> Option<RefreshReport> {
    self.state().refresh.cancel_pending();
    self.execute_refresh(force).await
  }

  /// Run one refresh cycle. Returns `None` when the cycle was skipped: no
  /// active owner, a cycle already in flight, or (unless forced) the last
  /// cycle started less than the minimum interval ago.
  pub async fn execute_refresh(&self, force: bool) -> Option<RefreshReport> {
    let started_at = self.inner.clock.now();

    let (owner, generation) = {
      let mut state = self.state();
      let owner = state.owner.clone()?;
      if !force && state.refresh.cycles_in_flight > 0 {
        debug!("refresh already in flight");
        return None;
      }
      if !force {
        if let Some(last) = state.refresh.last_fetch_at {
          if self.elapsed_since(last) < self.inner.config.min_interval {
            debug!(last = %last, "refresh throttled");
            return None;
          }
        }
      }
      state.refresh.cycles_in_flight += 1;
      state.refresh.last_fetch_at = Some(started_at);
      (owner, state.generation)
    };
    let _in_flight = InFlight {
      state: &self.inner.state,
      claim: Claim::Cycle,
      generation,
    };

    info!(owner = %owner, forced = force, "refresh started");
    self.inner.events.emit(SyncEvent::RefreshStarted { forced: force });

    let mut report = RefreshReport {
      forced: force,
      started_at,
      collections: Vec::with_capacity(Collection::ALL.len()),
      fell_back: false,
    };

    for (i, collection) in Collection::ALL.into_iter().enumerate() {
      if i > 0 {
        tokio::time::sleep(self.inner.config.fetch_pause).await;
      }
      if self.generation() != generation {
        debug!("owner changed during refresh, abandoning cycle");
        break;
      }

      let outcome = match collection {
        Collection::Products => self.fetch_step::<Product>(&owner, generation).await,
        Collection::Movements => self.fetch_step::<StockMovement>(&owner, generation).await,
        Collection::Sales => self.fetch_step::<Sale>(&owner, generation).await,
        Collection::Bolos => self.fetch_step::<CakeItem>(&owner, generation).await,
      };

      match outcome {
        Ok(outcome) => report.collections.push(outcome),
        Err(e) => {
          warn!(collection = %collection, error = %e, "refresh failed, loading everything from fallback");
          report.collections.push(CollectionOutcome {
            collection,
            source: DataSource::Fallback,
            count: 0,
            reason: Some(e),
          });
          self.load_all_from_fallback(&owner, generation);
          report.fell_back = true;
          break;
        }
      }
    }

    info!(owner = %owner, fell_back = report.fell_back, "refresh finished");
    self.inner.events.emit(SyncEvent::RefreshFinished {
      fell_back: report.fell_back,
    });
    Some(report)
  }

  // ==========================================================================
  // Per-collection fetch
  // ==========================================================================

  /// Bring `T`'s collection up to date outside a refresh cycle.
  ///
  /// Returns the rows now held in memory and where they came from. Only an
  /// unexpected failure is an error, and in that case every collection has
  /// been reloaded from the fallback store.
  pub async fn fetch_collection<T: Record>(&self, force: bool) -> Result<FetchResult<Vec<T>>> {
    let (owner, generation) = self.active_owner()?;
    let Some(_in_flight) = self.begin(T::collection(), generation) else {
      debug!(collection = %T::collection(), "fetch already in flight");
      return Ok(FetchResult::skipped(self.records()));
    };

    let throttle = if force { Throttle::Bypass } else { Throttle::Apply };
    match self.fetch_inner::<T>(&owner, generation, throttle).await {
      Ok((result, _)) => {
        if result.source == DataSource::Skipped {
          return Ok(FetchResult::skipped(self.records()));
        }
        self.apply(generation, result.data.clone(), result.source);
        Ok(result)
      }
      Err(e) => {
        warn!(collection = %T::collection(), error = %e, "fetch failed, loading everything from fallback");
        self.load_all_from_fallback(&owner, generation);
        Err(e)
      }
    }
  }

  async fn fetch_step<T: Record>(&self, owner: &str, generation: u64) -> Result<CollectionOutcome> {
    let collection = T::collection();
    let Some(_in_flight) = self.begin(collection, generation) else {
      return Ok(CollectionOutcome {
        collection,
        source: DataSource::Skipped,
        count: self.records::<T>().len(),
        reason: None,
      });
    };

    let (result, reason) = self.fetch_inner::<T>(owner, generation, Throttle::Bypass).await?;
    let count = result.data.len();
    if result.source != DataSource::Skipped {
      self.apply(generation, result.data, result.source);
    }
    Ok(CollectionOutcome {
      collection,
      source: result.source,
      count,
      reason,
    })
  }

  /// The fetch protocol proper. Does not touch in-memory state.
  async fn fetch_inner<T: Record>(
    &self,
    owner: &str,
    generation: u64,
    throttle: Throttle,
  ) -> Result<Fetched<T>> {
    let collection = T::collection();
    let key = collection_key(collection, owner);
    let cache = T::cache(&self.inner.caches);

    if let Some(rows) = cache.get(&key) {
      debug!(key = %key, "cache hit");
      return Ok((FetchResult::from_cache(rows), None));
    }

    if let Some(fetched_at) = self.inner.fallback.fetched_at::<T>(owner) {
      if self.elapsed_since(fetched_at) < self.inner.config.cache_ttl {
        debug!(key = %key, fetched_at = %fetched_at, "fallback snapshot still fresh");
        return Ok((FetchResult::from_local(self.inner.fallback.load(owner)), None));
      }
    }

    if throttle == Throttle::Apply {
      let last = self.state().refresh.last_data_fetch;
      if let Some(last) = last {
        if self.elapsed_since(last) < self.inner.config.min_interval {
          debug!(key = %key, "fetch throttled");
          return Ok((FetchResult::skipped(Vec::new()), None));
        }
      }
    }

    let fetched = match self.inner.governor.check() {
      Ok(()) => self.select_rows::<T>(owner).await,
      Err(e) => Err(e),
    };

    let rows = match fetched {
      Ok(rows) => rows,
      Err(e) if e.is_recoverable() => {
        warn!(collection = %collection, error = %e, "remote unavailable, serving fallback");
        return Ok((FetchResult::fallback(self.inner.fallback.load(owner)), Some(e)));
      }
      Err(e) => return Err(e),
    };

    if self.generation() != generation {
      debug!(key = %key, "owner changed during fetch, discarding rows");
      return Ok((FetchResult::skipped(Vec::new()), None));
    }

    cache.set(&key, rows.clone());
    self.inner.fallback.save(owner, &rows)?;
    if let Err(e) = self.inner.fallback.mark_fetched::<T>(owner) {
      warn!(key = %key, error = %e, "failed to record fetch time");
    }
    {
      let mut state = self.state();
      if state.generation == generation {
        state.refresh.last_data_fetch = Some(self.inner.clock.now());
      }
    }

    debug!(key = %key, count = rows.len(), "fetched from remote");
    Ok((FetchResult::from_network(rows), None))
  }

  /// One bounded select for `owner`'s rows, counted against the quota.
  async fn select_rows<T: Record>(&self, owner: &str) -> Result<Vec<T>> {
    let collection = T::collection();
    let query = SelectQuery::owned_by(owner, self.inner.config.fetch_limit);
    let remote = &self.inner.remote;
    let query = &query;

    let rows = self
      .inner
      .config
      .retry
      .run(move || remote.select(collection, query))
      .await?;
    self.inner.governor.record_request();

    decode_rows(collection, rows)
  }

  // ==========================================================================
  // Helpers
  // ==========================================================================

  /// The runtime captured at construction, else the caller's.
  fn runtime(&self) -> Result<Handle> {
    self
      .inner
      .runtime
      .clone()
      .or_else(|| Handle::try_current().ok())
      .ok_or(SyncError::NoRuntime)
  }

  pub(super) fn active_owner(&self) -> Result<(String, u64)> {
    let state = self.state();
    let owner = state.owner.clone().ok_or(SyncError::NoActiveOwner)?;
    Ok((owner, state.generation))
  }

  /// Claim `collection` for one fetch, or `None` if a fetch of it is running.
  fn begin(&self, collection: Collection, generation: u64) -> Option<InFlight<'_>> {
    let mut state = self.state();
    if state.generation != generation || !state.refresh.fetching.insert(collection) {
      return None;
    }
    Some(InFlight {
      state: &self.inner.state,
      claim: Claim::Fetch(collection),
      generation,
    })
  }

  /// Time since `at` on the injected clock; a future `at` counts as just now.
  fn elapsed_since(&self, at: DateTime<Utc>) -> Duration {
    (self.inner.clock.now() - at)
      .to_std()
      .unwrap_or(Duration::ZERO)
  }
}
