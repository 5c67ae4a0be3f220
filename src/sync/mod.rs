//! Sync service: request governor, TTL cache, fallback store and the throttled
//! refresh scheduler composed behind one explicitly constructed object.
//!
//! Reads flow one way: scheduler → governor → remote → cache → fallback store
//! → in-memory state. Writes try the remote first and fall back to the
//! fallback store and in-memory state when the remote is unavailable.

mod mutations;
mod policy;
mod refresh;
#[cfg(test)]
mod tests;

pub use mutations::{MutationResult, WriteTarget};
pub use policy::RetryPolicy;
pub use refresh::{CollectionOutcome, RefreshReport};

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{CacheSet, DataSource, FallbackStore, KeyValueStore, Record};
use crate::clock::Clock;
use crate::event::{EventBus, SyncEvent};
use crate::governor::{RequestGovernor, DEFAULT_MAX_DAILY_REQUESTS};
use crate::model::{CakeItem, Collection, Dataset, Product, Sale, StockMovement};
use crate::remote::Remote;

/// What happens to the previous owner's fallback snapshots on a user switch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerSwitchPolicy {
  /// Delete the previous owner's snapshots before loading the new owner
  #[default]
  PurgePrevious,
  /// Keep them on disk; only in-memory state and cache are dropped
  RetainPrevious,
}

/// Runtime tuning for the sync service.
#[derive(Debug, Clone)]
pub struct SyncConfig {
  pub max_daily_requests: u32,
  pub offline_mode: bool,
  /// Time-to-live of cache entries and of fresh fallback snapshots
  pub cache_ttl: Duration,
  /// Minimum spacing between non-forced refreshes
  pub min_interval: Duration,
  pub debounce: Duration,
  /// Pause between consecutive collection fetches in one cycle
  pub fetch_pause: Duration,
  pub retry: RetryPolicy,
  /// Age after which `cleanup_stale` drops a snapshot
  pub stale_after: Duration,
  /// Maximum rows fetched per collection; zero is treated as one
  pub fetch_limit: usize,
  pub owner_switch: OwnerSwitchPolicy,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_daily_requests: DEFAULT_MAX_DAILY_REQUESTS,
      offline_mode: false,
      cache_ttl: Duration::from_secs(60 * 60),
      min_interval: Duration::from_secs(5 * 60),
      debounce: Duration::from_secs(30),
      fetch_pause: Duration::from_secs(3),
      retry: RetryPolicy::default(),
      stale_after: Duration::from_secs(30 * 24 * 60 * 60),
      fetch_limit: 1000,
      owner_switch: OwnerSwitchPolicy::default(),
    }
  }
}

/// Scheduler bookkeeping. Reset whenever the owner changes.
#[derive(Debug, Default)]
struct RefreshState {
  /// Start of the last full refresh cycle
  last_fetch_at: Option<DateTime<Utc>>,
  /// Last successful remote fetch of any collection
  last_data_fetch: Option<DateTime<Utc>>,
  pending: Option<PendingRefresh>,
  /// Full cycles running; forced cycles may overlap, so this is a count
  cycles_in_flight: usize,
  /// Collections with a fetch running
  fetching: HashSet<Collection>,
}

#[derive(Debug)]
struct PendingRefresh {
  seq: u64,
  handle: JoinHandle<()>,
}

impl RefreshState {
  fn cancel_pending(&mut self) {
    if let Some(pending) = self.pending.take() {
      pending.handle.abort();
    }
  }
}

#[derive(Debug, Default)]
struct SyncState {
  owner: Option<String>,
  /// Bumped on every owner change so late results for a previous owner are dropped
  generation: u64,
  data: Dataset,
  refresh: RefreshState,
}

/// Point-in-time view of the service for diagnostics displays.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
  pub owner: Option<String>,
  pub requests_today: u32,
  pub max_daily_requests: u32,
  pub offline_mode: bool,
  pub cache_entries: usize,
  pub refresh_in_flight: bool,
  pub refresh_pending: bool,
  pub last_fetch_at: Option<DateTime<Utc>>,
  pub counts: Vec<(Collection, usize)>,
  pub snapshots: Vec<String>,
}

pub(crate) struct Inner<R> {
  remote: R,
  config: SyncConfig,
  clock: Arc<dyn Clock>,
  governor: RequestGovernor,
  caches: CacheSet,
  fallback: FallbackStore,
  state: Mutex<SyncState>,
  events: EventBus,
  /// Runtime the service was built on, used for debounce and forced refresh tasks
  runtime: Option<Handle>,
  local_seq: AtomicU64,
  debounce_seq: AtomicU64,
}

/// Offline-tolerant data-access service for one active owner at a time.
///
/// Cloning is cheap and every clone drives the same state.
pub struct SyncService<R> {
  inner: Arc<Inner<R>>,
}

impl<R> Clone for SyncService<R> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<R: Remote + Sync + 'static> SyncService<R> {
  /// Build the service. When called inside a Tokio runtime, that runtime is
  /// kept for background refreshes, so [`SyncService::request_refresh`] also
  /// works from plain threads later on.
  pub fn new(
    remote: R,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
  ) -> Self {
    let ttl = chrono::Duration::from_std(config.cache_ttl)
      .unwrap_or_else(|_| chrono::Duration::seconds(crate::cache::DEFAULT_TTL_SECS));
    let governor = RequestGovernor::new(
      config.max_daily_requests,
      config.offline_mode,
      Arc::clone(&store),
      Arc::clone(&clock),
    );

    Self {
      inner: Arc::new(Inner {
        remote,
        governor,
        caches: CacheSet::new(ttl, Arc::clone(&clock)),
        fallback: FallbackStore::new(store, Arc::clone(&clock)),
        clock,
        config,
        state: Mutex::new(SyncState::default()),
        events: EventBus::default(),
        runtime: Handle::try_current().ok(),
        local_seq: AtomicU64::new(0),
        debounce_seq: AtomicU64::new(0),
      }),
    }
  }

  fn state(&self) -> MutexGuard<'_, SyncState> {
    self
      .inner
      .state
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  // ==========================================================================
  // Lifecycle
  // ==========================================================================

  /// Make `owner` the active owner and load its fallback snapshots into memory.
  pub fn init(&self, owner: &str) {
    if self.switch_owner(Some(owner.to_string())) {
      self.load_all_from_fallback(owner, self.generation());
    }
  }

  /// Log out: cancel pending work, drop in-memory state and purge the owner's
  /// local snapshots.
  pub fn dispose(&self) {
    self.switch_owner(None);
  }

  /// Ask the remote who is signed in and follow any change of identity.
  ///
  /// An absent identity leaves the current owner in place so offline use keeps
  /// working. Returns the active owner afterwards.
  pub async fn sync_identity(&self) -> Option<String> {
    if let Some(identity) = self.inner.remote.current_identity().await {
      if self.owner().as_deref() != Some(identity.as_str()) {
        self.init(&identity);
      }
    }
    self.owner()
  }

  /// Switch the active owner. Returns `false` if `new_owner` is already active.
  ///
  /// Cancels any pending debounce, resets refresh bookkeeping, drops the
  /// previous owner's in-memory state and cache entries, and (per
  /// [`OwnerSwitchPolicy`], or always on logout) clears its fallback snapshots
  /// before anything is loaded for the new owner.
  pub fn switch_owner(&self, new_owner: Option<String>) -> bool {
    let previous = {
      let mut state = self.state();
      if state.owner == new_owner {
        return false;
      }
      state.refresh.cancel_pending();
      state.refresh = RefreshState::default();
      state.data = Dataset::default();
      state.generation += 1;
      std::mem::replace(&mut state.owner, new_owner.clone())
    };

    if let Some(prev) = previous.as_deref() {
      self.inner.caches.clear_owner(prev);
      let purge =
        new_owner.is_none() || self.inner.config.owner_switch == OwnerSwitchPolicy::PurgePrevious;
      if purge {
        self.inner.fallback.clear_all(prev);
      }
    }

    info!(previous = ?previous, current = ?new_owner, "active owner changed");
    self.inner.events.emit(SyncEvent::OwnerChanged {
      previous,
      current: new_owner,
    });
    true
  }

  // ==========================================================================
  // Accessors
  // ==========================================================================

  pub fn owner(&self) -> Option<String> {
    self.state().owner.clone()
  }

  fn generation(&self) -> u64 {
    self.state().generation
  }

  /// Current in-memory rows of `T`'s collection.
  pub fn records<T: Record>(&self) -> Vec<T> {
    T::slot(&self.state().data).clone()
  }

  pub fn products(&self) -> Vec<Product> {
    self.records()
  }

  pub fn movements(&self) -> Vec<StockMovement> {
    self.records()
  }

  pub fn sales(&self) -> Vec<Sale> {
    self.records()
  }

  pub fn bolos(&self) -> Vec<CakeItem> {
    self.records()
  }

  /// Copy of the whole in-memory state
  pub fn dataset(&self) -> Dataset {
    self.state().data.clone()
  }

  pub fn governor(&self) -> &RequestGovernor {
    &self.inner.governor
  }

  pub fn caches(&self) -> &CacheSet {
    &self.inner.caches
  }

  pub fn fallback(&self) -> &FallbackStore {
    &self.inner.fallback
  }

  pub fn remote(&self) -> &R {
    &self.inner.remote
  }

  pub fn config(&self) -> &SyncConfig {
    &self.inner.config
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.inner.events.subscribe()
  }

  pub fn set_offline_mode(&self, offline: bool) {
    self.inner.governor.set_offline_mode(offline);
  }

  pub fn diagnostics(&self) -> Diagnostics {
    let (owner, refresh_in_flight, refresh_pending, last_fetch_at, counts) = {
      let state = self.state();
      let counts: Vec<(Collection, usize)> = Collection::ALL
        .iter()
        .map(|c| (*c, state.data.len_of(*c)))
        .collect();
      (
        state.owner.clone(),
        state.refresh.cycles_in_flight > 0,
        state.refresh.pending.is_some(),
        state.refresh.last_fetch_at,
        counts,
      )
    };

    Diagnostics {
      owner,
      requests_today: self.inner.governor.today_count(),
      max_daily_requests: self.inner.governor.max_daily_requests(),
      offline_mode: self.inner.governor.is_offline(),
      cache_entries: self.inner.caches.size(),
      refresh_in_flight,
      refresh_pending,
      last_fetch_at,
      counts,
      snapshots: self.inner.fallback.snapshot_keys(),
    }
  }

  // ==========================================================================
  // Maintenance
  // ==========================================================================

  /// Drop fallback snapshots older than the configured age.
  pub fn cleanup_stale(&self) -> usize {
    let max_age = chrono::Duration::from_std(self.inner.config.stale_after)
      .unwrap_or_else(|_| chrono::Duration::days(crate::cache::DEFAULT_STALE_AFTER_DAYS));
    self.inner.fallback.cleanup_stale(max_age)
  }

  /// Forget everything held locally for the active owner without logging out.
  pub fn clear_local_data(&self) {
    let owner = {
      let mut state = self.state();
      state.data = Dataset::default();
      state.owner.clone()
    };
    if let Some(owner) = owner {
      self.inner.caches.clear_owner(&owner);
      self.inner.fallback.clear_all(&owner);
    }
  }

  // ==========================================================================
  // Shared helpers
  // ==========================================================================

  /// Replace `T`'s in-memory rows, unless the owner changed meanwhile.
  fn apply<T: Record>(&self, generation: u64, rows: Vec<T>, source: DataSource) -> bool {
    let count = rows.len();
    {
      let mut state = self.state();
      if state.generation != generation {
        debug!(collection = %T::collection(), "dropping result for previous owner");
        return false;
      }
      *T::slot_mut(&mut state.data) = rows;
    }
    self.inner.events.emit(SyncEvent::CollectionLoaded {
      collection: T::collection(),
      source,
      count,
    });
    true
  }

  fn load_from_fallback<T: Record>(&self, owner: &str, generation: u64) -> usize {
    let rows = self.inner.fallback.load::<T>(owner);
    let count = rows.len();
    self.apply(generation, rows, DataSource::Fallback);
    count
  }

  fn load_all_from_fallback(&self, owner: &str, generation: u64) {
    self.load_from_fallback::<Product>(owner, generation);
    self.load_from_fallback::<StockMovement>(owner, generation);
    self.load_from_fallback::<Sale>(owner, generation);
    self.load_from_fallback::<CakeItem>(owner, generation);
  }

  fn next_local_seq(&self) -> u64 {
    self.inner.local_seq.fetch_add(1, Ordering::SeqCst)
  }
}
