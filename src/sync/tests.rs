use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use color_eyre::eyre::eyre;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};

use super::*;
use crate::cache::MemoryStorage;
use crate::clock::ManualClock;
use crate::error::{Result, SyncError};
use crate::model::{MovementKind, NewCakeItem, NewProduct, NewSale, RecordId};
use crate::remote::{Filter, Remote, SelectQuery};

// ============================================================================
// Fakes
// ============================================================================

#[derive(Debug, Clone)]
struct Call {
  verb: &'static str,
  collection: Option<Collection>,
  at: Instant,
}

/// In-memory backend with switchable failures.
#[derive(Default)]
struct FakeRemote {
  tables: Mutex<HashMap<Collection, Vec<Value>>>,
  calls: Mutex<Vec<Call>>,
  identity: Mutex<Option<String>>,
  fail_reads: AtomicBool,
  fail_writes: AtomicBool,
  read_delay_secs: AtomicU64,
  next_id: AtomicI64,
}

impl FakeRemote {
  fn signed_in(owner: &str) -> Self {
    let remote = Self::default();
    remote.sign_in(Some(owner));
    remote
  }

  fn sign_in(&self, owner: Option<&str>) {
    *self.identity.lock().unwrap() = owner.map(String::from);
  }

  fn seed(&self, collection: Collection, rows: Vec<Value>) {
    self
      .tables
      .lock()
      .unwrap()
      .entry(collection)
      .or_default()
      .extend(rows);
  }

  fn rows(&self, collection: Collection) -> Vec<Value> {
    self
      .tables
      .lock()
      .unwrap()
      .get(&collection)
      .cloned()
      .unwrap_or_default()
  }

  fn record(&self, verb: &'static str, collection: Option<Collection>) {
    self.calls.lock().unwrap().push(Call {
      verb,
      collection,
      at: Instant::now(),
    });
  }

  fn calls(&self, verb: &str) -> Vec<Call> {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|c| c.verb == verb)
      .cloned()
      .collect()
  }

  fn write_check(&self) -> Result<()> {
    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(SyncError::RemoteRejected("permission denied".into()));
    }
    Ok(())
  }
}

fn matches_all(row: &Value, filters: &[Filter]) -> bool {
  filters.iter().all(|f| row.get(&f.column) == Some(&f.value))
}

impl Remote for FakeRemote {
  async fn select(&self, collection: Collection, query: &SelectQuery) -> Result<Vec<Value>> {
    self.record("select", Some(collection));
    let delay = self.read_delay_secs.load(Ordering::SeqCst);
    if delay > 0 {
      sleep(Duration::from_secs(delay)).await;
    }
    if self.fail_reads.load(Ordering::SeqCst) {
      return Err(SyncError::RemoteRejected("service unavailable".into()));
    }

    Ok(
      self
        .rows(collection)
        .into_iter()
        .filter(|row| matches_all(row, &query.filters))
        .collect(),
    )
  }

  async fn insert(&self, collection: Collection, row: &Value) -> Result<Value> {
    self.record("insert", Some(collection));
    self.write_check()?;

    let mut stored = row.clone();
    if let Some(fields) = stored.as_object_mut() {
      let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
      fields.insert("id".into(), json!(id));
      fields.insert("created_at".into(), json!("2024-03-10T12:00:00Z"));
    }
    self.seed(collection, vec![stored.clone()]);
    Ok(stored)
  }

  async fn update(
    &self,
    collection: Collection,
    patch: &Value,
    filters: &[Filter],
  ) -> Result<Vec<Value>> {
    self.record("update", Some(collection));
    self.write_check()?;

    let mut tables = self.tables.lock().unwrap();
    let mut updated = Vec::new();
    for row in tables.entry(collection).or_default().iter_mut() {
      if !matches_all(row, filters) {
        continue;
      }
      if let (Some(target), Some(fields)) = (row.as_object_mut(), patch.as_object()) {
        for (name, value) in fields {
          target.insert(name.clone(), value.clone());
        }
      }
      updated.push(row.clone());
    }
    Ok(updated)
  }

  async fn delete(&self, collection: Collection, filters: &[Filter]) -> Result<()> {
    self.record("delete", Some(collection));
    self.write_check()?;

    self
      .tables
      .lock()
      .unwrap()
      .entry(collection)
      .or_default()
      .retain(|row| !matches_all(row, filters));
    Ok(())
  }

  async fn current_identity(&self) -> Option<String> {
    self.record("identity", None);
    self.identity.lock().unwrap().clone()
  }
}

/// Memory storage whose writes can be made to fail.
#[derive(Default)]
struct FlakyStorage {
  inner: MemoryStorage,
  fail_writes: AtomicBool,
}

impl KeyValueStore for FlakyStorage {
  fn get(&self, key: &str) -> color_eyre::Result<Option<String>> {
    self.inner.get(key)
  }

  fn set(&self, key: &str, value: &str) -> color_eyre::Result<()> {
    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(eyre!("disk full"));
    }
    self.inner.set(key, value)
  }

  fn remove(&self, key: &str) -> color_eyre::Result<()> {
    self.inner.remove(key)
  }

  fn keys_with_prefix(&self, prefix: &str) -> color_eyre::Result<Vec<String>> {
    self.inner.keys_with_prefix(prefix)
  }
}

// ============================================================================
// Helpers
// ============================================================================

fn start_time() -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()
}

struct Harness {
  service: SyncService<FakeRemote>,
  clock: Arc<ManualClock>,
}

impl Harness {
  fn new(remote: FakeRemote, config: SyncConfig) -> Self {
    let clock = Arc::new(ManualClock::new(start_time()));
    let storage = Arc::new(MemoryStorage::new());
    let service = SyncService::new(remote, storage, clock.clone(), config);
    Self { service, clock }
  }

  fn remote(&self) -> &FakeRemote {
    self.service.remote()
  }
}

fn product_row(id: i64, owner: &str, name: &str) -> Value {
  json!({
    "id": id,
    "user_id": owner,
    "nome": name,
    "preco": 2.5,
    "quantidade": 10,
    "created_at": "2024-03-10T11:00:00Z"
  })
}

/// Backend holding data for `u1` (and one foreign row), signed in as `u1`.
fn seeded_remote() -> FakeRemote {
  let remote = FakeRemote::signed_in("u1");
  remote.seed(
    Collection::Products,
    vec![
      product_row(1, "u1", "Brigadeiro"),
      product_row(2, "u1", "Beijinho"),
      product_row(3, "u2", "Quindim"),
    ],
  );
  remote.seed(
    Collection::Movements,
    vec![json!({
      "id": "m1",
      "user_id": "u1",
      "produto_id": 1,
      "tipo": "entrada",
      "quantidade": 5
    })],
  );
  remote.seed(
    Collection::Sales,
    vec![json!({"id": 10, "user_id": "u1", "itens": [], "total": 12.0})],
  );
  remote.seed(
    Collection::Bolos,
    vec![json!({"id": 20, "user_id": "u1", "nome": "Cenoura", "sabor": "chocolate"})],
  );
  remote
}

fn product(id: i64, owner: &str, name: &str) -> Product {
  let draft = NewProduct {
    name: name.to_string(),
    ..Default::default()
  };
  Product::from_draft(draft, RecordId::Number(id), owner, start_time())
}

fn sources(report: &RefreshReport) -> Vec<DataSource> {
  report.collections.iter().map(|c| c.source).collect()
}

async fn wait_for(events: &mut broadcast::Receiver<SyncEvent>, wanted: impl Fn(&SyncEvent) -> bool) {
  loop {
    match events.recv().await {
      Ok(event) if wanted(&event) => return,
      Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
      Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
    }
  }
}

fn drain(events: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
  let mut seen = Vec::new();
  while let Ok(event) = events.try_recv() {
    seen.push(event);
  }
  seen
}

// ============================================================================
// Scheduling
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_debounce_runs_once_after_last_call() {
  let h = Harness::new(seeded_remote(), SyncConfig::default());
  h.service.init("u1");
  let mut events = h.service.subscribe();
  let start = Instant::now();

  h.service.request_refresh(false).unwrap();
  sleep(Duration::from_secs(5)).await;
  h.service.request_refresh(false).unwrap();
  sleep(Duration::from_secs(5)).await;
  h.service.request_refresh(false).unwrap();

  wait_for(&mut events, |e| matches!(e, SyncEvent::RefreshStarted { .. })).await;
  let fired_after = start.elapsed();
  assert!(fired_after >= Duration::from_secs(40));
  assert!(fired_after < Duration::from_secs(41));

  wait_for(&mut events, |e| matches!(e, SyncEvent::RefreshFinished { .. })).await;
  sleep(Duration::from_secs(300)).await;

  let started = drain(&mut events)
    .into_iter()
    .filter(|e| matches!(e, SyncEvent::RefreshStarted { .. }))
    .count();
  assert_eq!(started, 0);
  assert_eq!(h.remote().calls("select").len(), 4);
  assert!(!h.service.diagnostics().refresh_pending);
}

#[tokio::test(start_paused = true)]
async fn test_cycle_fetches_in_order_with_pauses() {
  let h = Harness::new(seeded_remote(), SyncConfig::default());
  h.service.init("u1");

  let report = h.service.refresh_now(true).await.unwrap();

  let selects = h.remote().calls("select");
  let order: Vec<Collection> = selects.iter().filter_map(|c| c.collection).collect();
  assert_eq!(order, Collection::ALL.to_vec());
  for pair in selects.windows(2) {
    assert!(pair[1].at - pair[0].at >= Duration::from_secs(3));
  }

  assert_eq!(sources(&report), vec![DataSource::Network; 4]);
  assert!(!report.fell_back);
  assert_eq!(h.service.products().len(), 2);
  assert!(h.service.products().iter().all(|p| p.user_id == "u1"));
  assert_eq!(h.service.movements().len(), 1);
  assert_eq!(h.service.sales().len(), 1);
  assert_eq!(h.service.bolos()[0].flavor.as_deref(), Some("chocolate"));
  assert_eq!(h.service.governor().today_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_forced_refresh_cancels_pending_debounce() {
  let config = SyncConfig {
    min_interval: Duration::ZERO,
    ..SyncConfig::default()
  };
  let h = Harness::new(seeded_remote(), config);
  h.service.init("u1");
  let mut events = h.service.subscribe();

  h.service.request_refresh(false).unwrap();
  assert!(h.service.diagnostics().refresh_pending);

  assert!(h.service.refresh_now(true).await.is_some());
  assert!(!h.service.diagnostics().refresh_pending);
  sleep(Duration::from_secs(120)).await;

  let started = drain(&mut events)
    .into_iter()
    .filter(|e| matches!(e, SyncEvent::RefreshStarted { .. }))
    .count();
  assert_eq!(started, 1);
  assert_eq!(h.remote().calls("select").len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_request_refresh_forced_runs_immediately() {
  let h = Harness::new(seeded_remote(), SyncConfig::default());
  h.service.init("u1");
  let mut events = h.service.subscribe();
  let start = Instant::now();

  h.service.request_refresh(true).unwrap();
  wait_for(&mut events, |e| matches!(e, SyncEvent::RefreshStarted { forced: true })).await;

  assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_cycles_are_throttled_then_served_from_cache() {
  let h = Harness::new(seeded_remote(), SyncConfig::default());
  h.service.init("u1");

  assert!(h.service.refresh_now(false).await.is_some());
  assert!(h.service.refresh_now(false).await.is_none());

  h.clock.advance(chrono::Duration::minutes(6));
  let report = h.service.refresh_now(false).await.unwrap();

  assert_eq!(sources(&report), vec![DataSource::Cache; 4]);
  assert_eq!(h.remote().calls("select").len(), 4);
  assert_eq!(h.service.products().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_is_a_no_op_while_one_is_in_flight() {
  let config = SyncConfig {
    min_interval: Duration::ZERO,
    ..SyncConfig::default()
  };
  let remote = seeded_remote();
  remote.read_delay_secs.store(10, Ordering::SeqCst);
  let h = Harness::new(remote, config);
  h.service.init("u1");

  let background = {
    let service = h.service.clone();
    tokio::spawn(async move { service.refresh_now(false).await })
  };
  sleep(Duration::from_secs(1)).await;

  assert!(h.service.diagnostics().refresh_in_flight);
  assert!(h.service.execute_refresh(false).await.is_none());
  let products = h.service.fetch_collection::<Product>(true).await.unwrap();
  assert_eq!(products.source, DataSource::Skipped);

  let report = background.await.unwrap().unwrap();
  assert_eq!(report.collections.len(), 4);
  assert!(!h.service.diagnostics().refresh_in_flight);
  assert_eq!(h.remote().calls("select").len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_owner_switch_cancels_pending_debounce() {
  let h = Harness::new(seeded_remote(), SyncConfig::default());
  h.service.init("u1");

  h.service.request_refresh(false).unwrap();
  h.service.init("u2");
  sleep(Duration::from_secs(60)).await;

  assert!(h.remote().calls("select").is_empty());
  assert!(!h.service.diagnostics().refresh_pending);
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_forced_cycles_keep_refresh_in_flight() {
  let config = SyncConfig {
    min_interval: Duration::ZERO,
    ..SyncConfig::default()
  };
  let remote = seeded_remote();
  remote.read_delay_secs.store(10, Ordering::SeqCst);
  let h = Harness::new(remote, config);
  h.service.init("u1");

  let first = {
    let service = h.service.clone();
    tokio::spawn(async move { service.refresh_now(true).await })
  };
  sleep(Duration::from_secs(1)).await;
  let second = {
    let service = h.service.clone();
    tokio::spawn(async move { service.execute_refresh(true).await })
  };

  // The cycles take turns per collection; the second one owns the last fetch
  first.await.unwrap().unwrap();
  assert!(!second.is_finished());
  assert!(h.service.diagnostics().refresh_in_flight);
  assert!(h.service.execute_refresh(false).await.is_none());

  second.await.unwrap().unwrap();
  assert!(!h.service.diagnostics().refresh_in_flight);
  assert_eq!(h.remote().calls("select").len(), 4);
}

#[test]
fn test_request_refresh_without_runtime_is_an_error() {
  let h = Harness::new(seeded_remote(), SyncConfig::default());
  h.service.init("u1");

  assert_eq!(h.service.request_refresh(true), Err(SyncError::NoRuntime));
  assert_eq!(h.service.request_refresh(false), Err(SyncError::NoRuntime));
  assert!(!h.service.diagnostics().refresh_pending);
  assert!(h.remote().calls("select").is_empty());
}

#[test]
fn test_request_refresh_from_plain_thread_uses_construction_runtime() {
  let runtime = tokio::runtime::Builder::new_current_thread()
    .enable_all()
    .start_paused(true)
    .build()
    .unwrap();
  let h = {
    let _guard = runtime.enter();
    Harness::new(seeded_remote(), SyncConfig::default())
  };
  h.service.init("u1");
  let mut events = h.service.subscribe();

  h.service.request_refresh(true).unwrap();
  runtime.block_on(wait_for(&mut events, |e| {
    matches!(e, SyncEvent::RefreshFinished { .. })
  }));

  assert_eq!(h.remote().calls("select").len(), 4);
  assert_eq!(h.service.products().len(), 2);
}

// ============================================================================
// Fetch protocol
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_odd_rows_do_not_block_their_collection() {
  let remote = FakeRemote::signed_in("u1");
  remote.seed(
    Collection::Products,
    vec![json!({
      "id": 1,
      "user_id": "u1",
      "nome": "Brigadeiro",
      "created_at": "2024-03-10T11:00:00"
    })],
  );
  remote.seed(
    Collection::Movements,
    vec![
      json!({"id": "m1", "user_id": "u1", "produto_id": 1, "tipo": "entrada", "quantidade": 5}),
      json!({"id": "m2", "user_id": "u1", "produto_id": 1, "tipo": "ajuste", "quantidade": -1}),
      // No product reference at all
      json!({"id": "m3", "user_id": "u1", "tipo": "saida"}),
    ],
  );
  remote.seed(
    Collection::Sales,
    vec![json!({"id": 10, "user_id": "u1", "itens": [{"nome": "Bolo"}], "total": 5.0})],
  );
  remote.seed(
    Collection::Bolos,
    vec![json!({"id": 20, "user_id": "u1", "preco": "caro"})],
  );
  let h = Harness::new(remote, SyncConfig::default());
  h.service.init("u1");

  let report = h.service.refresh_now(true).await.unwrap();

  assert!(!report.fell_back);
  assert_eq!(
    sources(&report),
    vec![
      DataSource::Network,
      DataSource::Network,
      DataSource::Network,
      DataSource::Fallback
    ]
  );
  assert!(matches!(
    report.collections[3].reason,
    Some(SyncError::MalformedRemoteData {
      collection: Collection::Bolos,
      ..
    })
  ));

  let products = h.service.products();
  assert_eq!(products.len(), 1);
  assert_eq!(
    products[0].created_at,
    Some(Utc.with_ymd_and_hms(2024, 3, 10, 11, 0, 0).unwrap())
  );

  let kinds: Vec<MovementKind> = h.service.movements().into_iter().map(|m| m.kind).collect();
  assert_eq!(
    kinds,
    vec![MovementKind::Inbound, MovementKind::Other("ajuste".into())]
  );
  let persisted = h.service.fallback().load::<StockMovement>("u1");
  assert_eq!(persisted[1].kind, MovementKind::Other("ajuste".into()));

  assert_eq!(h.service.sales()[0].items[0].name, "Bolo");
  assert!(h.service.bolos().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_quota_exhaustion_serves_fallback() {
  let config = SyncConfig {
    max_daily_requests: 2,
    ..SyncConfig::default()
  };
  let h = Harness::new(seeded_remote(), config);
  let persisted = Sale::from_draft(
    NewSale {
      items: Vec::new(),
      total: 30.0,
      payment_method: Some("pix".into()),
    },
    RecordId::Number(99),
    "u1",
    start_time(),
  );
  h.service.fallback().save("u1", &[persisted.clone()]).unwrap();
  h.service.init("u1");

  let report = h.service.refresh_now(true).await.unwrap();

  assert_eq!(
    sources(&report),
    vec![
      DataSource::Network,
      DataSource::Network,
      DataSource::Fallback,
      DataSource::Fallback
    ]
  );
  assert_eq!(
    report.collections[2].reason,
    Some(SyncError::QuotaExceeded { count: 2, max: 2 })
  );
  assert_eq!(h.remote().calls("select").len(), 2);
  assert_eq!(h.service.sales(), vec![persisted]);
}

#[tokio::test(start_paused = true)]
async fn test_failing_remote_always_leaves_fallback_data() {
  let remote = FakeRemote::signed_in("u1");
  remote.fail_reads.store(true, Ordering::SeqCst);
  remote.fail_writes.store(true, Ordering::SeqCst);
  let h = Harness::new(remote, SyncConfig::default());
  h.service
    .fallback()
    .save("u1", &[product(1, "u1", "Brigadeiro")])
    .unwrap();
  h.service.init("u1");

  let report = h.service.refresh_now(true).await.unwrap();
  assert!(!report.fell_back);
  assert!(report
    .collections
    .iter()
    .all(|c| c.source == DataSource::Fallback
      && matches!(c.reason, Some(SyncError::RemoteRejected(_)))));
  assert_eq!(h.service.products(), vec![product(1, "u1", "Brigadeiro")]);

  let sales = h.service.fetch_collection::<Sale>(true).await.unwrap();
  assert_eq!(sales.source, DataSource::Fallback);
  assert!(sales.data.is_empty());

  let added = h
    .service
    .add_product(NewProduct {
      name: "Pudim".into(),
      ..Default::default()
    })
    .await
    .unwrap();
  assert!(added.saved_locally());
  assert_eq!(h.service.products().len(), 2);
  assert_eq!(h.service.fallback().load::<Product>("u1").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_fails_fast_without_retry() {
  let remote = seeded_remote();
  remote.read_delay_secs.store(60, Ordering::SeqCst);
  let h = Harness::new(remote, SyncConfig::default());
  h.service.init("u1");
  let start = Instant::now();

  let report = h.service.refresh_now(true).await.unwrap();

  let timeout = Some(SyncError::RemoteTimeout(Duration::from_secs(30)));
  assert!(report.collections.iter().all(|c| c.reason == timeout));
  assert_eq!(h.remote().calls("select").len(), 4);
  // Four 30s timeouts and three 3s pauses
  assert!(start.elapsed() >= Duration::from_secs(129));
  assert!(start.elapsed() < Duration::from_secs(130));
  assert_eq!(h.service.governor().today_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_fresh_fetch_stamp_skips_network_after_restart() {
  let clock = Arc::new(ManualClock::new(start_time()));
  let storage = Arc::new(MemoryStorage::new());

  let first = SyncService::new(
    seeded_remote(),
    storage.clone(),
    clock.clone(),
    SyncConfig::default(),
  );
  first.init("u1");
  first.refresh_now(true).await.unwrap();

  let second = SyncService::new(
    FakeRemote::signed_in("u1"),
    storage.clone(),
    clock.clone(),
    SyncConfig::default(),
  );
  second.init("u1");
  assert_eq!(second.products().len(), 2);

  let report = second.refresh_now(true).await.unwrap();
  assert_eq!(sources(&report), vec![DataSource::LocalFresh; 4]);
  assert!(second.remote().calls("select").is_empty());
  assert_eq!(second.governor().today_count(), 4);

  clock.advance(chrono::Duration::hours(2));
  let report = second.refresh_now(true).await.unwrap();
  assert_eq!(sources(&report), vec![DataSource::Network; 4]);
  assert_eq!(second.remote().calls("select").len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_fetch_collection_throttle_keeps_memory() {
  let config = SyncConfig {
    cache_ttl: Duration::from_secs(60),
    ..SyncConfig::default()
  };
  let h = Harness::new(seeded_remote(), config);
  h.service.init("u1");

  let first = h.service.fetch_collection::<Product>(false).await.unwrap();
  assert_eq!(first.source, DataSource::Network);
  assert_eq!(first.data.len(), 2);

  h.clock.advance(chrono::Duration::minutes(2));

  let sales = h.service.fetch_collection::<Sale>(false).await.unwrap();
  assert_eq!(sales.source, DataSource::Skipped);
  assert!(sales.data.is_empty());

  let products = h.service.fetch_collection::<Product>(false).await.unwrap();
  assert_eq!(products.source, DataSource::Skipped);
  assert_eq!(products.data.len(), 2);

  let forced = h.service.fetch_collection::<Sale>(true).await.unwrap();
  assert_eq!(forced.source, DataSource::Network);
  assert_eq!(h.service.sales().len(), 1);
  assert_eq!(h.remote().calls("select").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unrecoverable_error_reloads_everything_from_fallback() {
  let storage = Arc::new(FlakyStorage::default());
  let service = SyncService::new(
    seeded_remote(),
    storage.clone(),
    Arc::new(ManualClock::new(start_time())),
    SyncConfig::default(),
  );
  let persisted = product(7, "u1", "Persisted");
  service.fallback().save("u1", &[persisted.clone()]).unwrap();
  service.init("u1");
  storage.fail_writes.store(true, Ordering::SeqCst);

  let report = service.refresh_now(true).await.unwrap();

  assert!(report.fell_back);
  assert_eq!(report.collections.len(), 1);
  assert!(matches!(
    report.collections[0].reason,
    Some(SyncError::Storage(_))
  ));
  assert_eq!(service.products(), vec![persisted]);
  assert_eq!(service.remote().calls("select").len(), 1);
}

#[tokio::test]
async fn test_fetch_without_owner_fails() {
  let h = Harness::new(seeded_remote(), SyncConfig::default());
  let err = h.service.fetch_collection::<Product>(true).await.unwrap_err();
  assert_eq!(err, SyncError::NoActiveOwner);
  assert!(h.service.execute_refresh(true).await.is_none());
}

// ============================================================================
// Mutations
// ============================================================================

#[tokio::test]
async fn test_add_reaches_remote() {
  let h = Harness::new(FakeRemote::signed_in("u1"), SyncConfig::default());
  h.service.init("u1");

  let result = h
    .service
    .add_product(NewProduct {
      name: "Brigadeiro".into(),
      price: 2.5,
      quantity: 40,
      category: None,
    })
    .await
    .unwrap();

  assert_eq!(result.target, WriteTarget::Remote);
  assert_eq!(result.reason, None);
  assert_eq!(result.data.id, RecordId::Number(1));
  assert_eq!(result.data.user_id, "u1");
  assert_eq!(h.service.products(), vec![result.data.clone()]);
  assert_eq!(
    h.service.fallback().load::<Product>("u1"),
    vec![result.data.clone()]
  );
  assert_eq!(h.remote().rows(Collection::Products)[0]["user_id"], json!("u1"));
  assert_eq!(h.service.governor().today_count(), 1);
}

#[tokio::test]
async fn test_rejected_add_is_saved_locally() {
  let remote = FakeRemote::signed_in("u1");
  remote.fail_writes.store(true, Ordering::SeqCst);
  let h = Harness::new(remote, SyncConfig::default());
  h.service.init("u1");
  let mut events = h.service.subscribe();

  let result = h
    .service
    .add_product(NewProduct {
      name: "X".into(),
      ..Default::default()
    })
    .await
    .unwrap();

  assert!(result.saved_locally());
  assert!(result.data.id.is_local());
  assert!(matches!(result.reason, Some(SyncError::RemoteRejected(_))));

  let persisted = h.service.fallback().load::<Product>("u1");
  assert_eq!(persisted.len(), 1);
  assert_eq!(persisted[0].name, "X");
  assert_eq!(h.service.products(), persisted);
  assert!(drain(&mut events).contains(&SyncEvent::SavedLocally {
    collection: Collection::Products
  }));
}

#[tokio::test]
async fn test_unauthenticated_write_skips_remote() {
  let h = Harness::new(FakeRemote::default(), SyncConfig::default());
  h.service.init("u1");

  let result = h
    .service
    .add_sale(NewSale {
      total: 18.0,
      ..Default::default()
    })
    .await
    .unwrap();

  assert_eq!(result.reason, Some(SyncError::NotAuthenticated));
  assert!(h.remote().calls("insert").is_empty());
  assert_eq!(h.service.governor().today_count(), 0);
  assert_eq!(h.service.sales().len(), 1);
}

#[tokio::test]
async fn test_identity_mismatch_counts_as_unauthenticated() {
  let h = Harness::new(FakeRemote::signed_in("someone-else"), SyncConfig::default());
  h.service.init("u1");

  let result = h.service.add_bolo(NewCakeItem::default()).await.unwrap();

  assert_eq!(result.reason, Some(SyncError::NotAuthenticated));
  assert!(h.remote().calls("insert").is_empty());
}

#[tokio::test]
async fn test_offline_mode_writes_locally() {
  let h = Harness::new(FakeRemote::signed_in("u1"), SyncConfig::default());
  h.service.init("u1");
  h.service.set_offline_mode(true);

  let result = h
    .service
    .add_bolo(NewCakeItem {
      name: "Floresta negra".into(),
      ..Default::default()
    })
    .await
    .unwrap();

  assert_eq!(result.reason, Some(SyncError::OfflineModeActive));
  assert!(h.remote().calls("identity").is_empty());
  assert_eq!(h.service.bolos()[0].name, "Floresta negra");
}

#[tokio::test(start_paused = true)]
async fn test_remote_update_merges_into_every_tier() {
  let h = Harness::new(seeded_remote(), SyncConfig::default());
  h.service.init("u1");
  h.service.refresh_now(true).await.unwrap();

  let result = h
    .service
    .update_product(&RecordId::Number(1), json!({"preco": 9.5, "user_id": "intruder"}))
    .await
    .unwrap();

  assert_eq!(result.target, WriteTarget::Remote);
  assert_eq!(result.data.price, 9.5);
  assert_eq!(result.data.user_id, "u1");

  let in_memory = h.service.products();
  assert_eq!(in_memory.iter().find(|p| p.id == RecordId::Number(1)).unwrap().price, 9.5);
  let cached = h.service.caches().products.get("products_u1").unwrap();
  assert_eq!(cached.iter().find(|p| p.id == RecordId::Number(1)).unwrap().price, 9.5);
  let persisted = h.service.fallback().load::<Product>("u1");
  assert_eq!(persisted.iter().find(|p| p.id == RecordId::Number(1)).unwrap().price, 9.5);
}

#[tokio::test(start_paused = true)]
async fn test_local_update_patches_and_invalidates_cache() {
  let remote = seeded_remote();
  remote.fail_writes.store(true, Ordering::SeqCst);
  let h = Harness::new(remote, SyncConfig::default());
  h.service.init("u1");
  h.service.refresh_now(true).await.unwrap();
  assert!(h.service.caches().products.contains("products_u1"));

  let result = h
    .service
    .update_product(&RecordId::Number(2), json!({"quantidade": 0}))
    .await
    .unwrap();

  assert!(result.saved_locally());
  assert_eq!(result.data.quantity, 0);
  assert_eq!(result.data.name, "Beijinho");
  assert!(!h.service.caches().products.contains("products_u1"));
  let persisted = h.service.fallback().load::<Product>("u1");
  assert_eq!(persisted.iter().find(|p| p.id == RecordId::Number(2)).unwrap().quantity, 0);
}

#[tokio::test]
async fn test_update_rejects_non_object_patch() {
  let h = Harness::new(FakeRemote::signed_in("u1"), SyncConfig::default());
  h.service.init("u1");

  let err = h
    .service
    .update_product(&RecordId::Number(1), json!([1, 2]))
    .await
    .unwrap_err();
  assert!(matches!(err, SyncError::Serialization(_)));
}

#[tokio::test]
async fn test_unknown_record_is_not_found() {
  let h = Harness::new(FakeRemote::signed_in("u1"), SyncConfig::default());
  h.service.init("u1");

  // Remote matches no rows and nothing is held locally
  let err = h
    .service
    .update_product(&RecordId::from("nope"), json!({"nome": "Y"}))
    .await
    .unwrap_err();
  assert_eq!(
    err,
    SyncError::RecordNotFound {
      collection: Collection::Products,
      id: "nope".into()
    }
  );

  h.remote().fail_writes.store(true, Ordering::SeqCst);
  let err = h.service.delete_sale(&RecordId::Number(404)).await.unwrap_err();
  assert!(matches!(err, SyncError::RecordNotFound { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_remote_delete_removes_everywhere() {
  let h = Harness::new(seeded_remote(), SyncConfig::default());
  h.service.init("u1");
  h.service.refresh_now(true).await.unwrap();

  let result = h.service.delete_product(&RecordId::Number(1)).await.unwrap();

  assert_eq!(result.target, WriteTarget::Remote);
  assert!(h.service.products().iter().all(|p| p.id != RecordId::Number(1)));
  assert!(h
    .service
    .fallback()
    .load::<Product>("u1")
    .iter()
    .all(|p| p.id != RecordId::Number(1)));
  assert!(h
    .remote()
    .rows(Collection::Products)
    .iter()
    .all(|row| row["id"] != json!(1)));
}

#[tokio::test(start_paused = true)]
async fn test_local_delete() {
  let remote = seeded_remote();
  remote.fail_writes.store(true, Ordering::SeqCst);
  let h = Harness::new(remote, SyncConfig::default());
  h.service.init("u1");
  h.service.refresh_now(true).await.unwrap();

  let result = h.service.delete_movement(&RecordId::from("m1")).await.unwrap();

  assert!(result.saved_locally());
  assert!(h.service.movements().is_empty());
  assert!(h.service.fallback().load::<StockMovement>("u1").is_empty());
}

// ============================================================================
// Owner lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_switch_retaining_previous_snapshots() {
  let config = SyncConfig {
    owner_switch: OwnerSwitchPolicy::RetainPrevious,
    ..SyncConfig::default()
  };
  let remote = FakeRemote::signed_in("B");
  remote.seed(Collection::Products, vec![product_row(5, "B", "Bem-casado")]);
  let h = Harness::new(remote, config);
  h.service.fallback().save("A", &[product(1, "A", "Brigadeiro")]).unwrap();

  h.service.init("A");
  assert_eq!(h.service.products().len(), 1);

  h.service.init("B");
  assert!(h.service.products().is_empty());
  assert_eq!(
    h.service.fallback().load::<Product>("A"),
    vec![product(1, "A", "Brigadeiro")]
  );

  h.service.refresh_now(true).await.unwrap();
  assert!(h.service.products().iter().all(|p| p.user_id == "B"));
  let cached = h.service.caches().products.get("products_B").unwrap();
  assert!(cached.iter().all(|p| p.user_id == "B"));
  assert!(h
    .service
    .fallback()
    .load::<Product>("B")
    .iter()
    .all(|p| p.user_id == "B"));
  assert!(h.service.caches().products.get("products_A").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_switch_purges_previous_owner_by_default() {
  let remote = FakeRemote::signed_in("A");
  remote.seed(Collection::Products, vec![product_row(1, "A", "Brigadeiro")]);
  let h = Harness::new(remote, SyncConfig::default());
  h.service.init("A");
  h.service.refresh_now(true).await.unwrap();
  let mut events = h.service.subscribe();

  assert!(h.service.switch_owner(Some("B".into())));
  assert!(!h.service.switch_owner(Some("B".into())));

  assert!(h.service.products().is_empty());
  assert!(h.service.fallback().load::<Product>("A").is_empty());
  assert!(h.service.fallback().fetched_at::<Product>("A").is_none());
  assert!(h.service.caches().products.get("products_A").is_none());
  assert_eq!(
    drain(&mut events),
    vec![SyncEvent::OwnerChanged {
      previous: Some("A".into()),
      current: Some("B".into())
    }]
  );
}

#[tokio::test(start_paused = true)]
async fn test_results_for_previous_owner_are_discarded() {
  let remote = FakeRemote::signed_in("A");
  remote.seed(Collection::Products, vec![product_row(1, "A", "Brigadeiro")]);
  remote.read_delay_secs.store(10, Ordering::SeqCst);
  let h = Harness::new(remote, SyncConfig::default());
  h.service.init("A");

  let background = {
    let service = h.service.clone();
    tokio::spawn(async move { service.refresh_now(true).await })
  };
  sleep(Duration::from_secs(1)).await;
  h.service.init("B");

  let report = background.await.unwrap().unwrap();
  assert_eq!(sources(&report), vec![DataSource::Skipped]);
  assert!(h.service.products().is_empty());
  assert!(h.service.fallback().load::<Product>("A").is_empty());
  assert!(h.service.caches().products.get("products_A").is_none());
}

#[tokio::test]
async fn test_dispose_forgets_owner_and_local_data() {
  let remote = FakeRemote::signed_in("u1");
  remote.fail_writes.store(true, Ordering::SeqCst);
  let h = Harness::new(remote, SyncConfig::default());
  h.service.init("u1");
  h.service
    .add_product(NewProduct {
      name: "Pudim".into(),
      ..Default::default()
    })
    .await
    .unwrap();

  h.service.dispose();

  assert_eq!(h.service.owner(), None);
  assert!(h.service.dataset().is_empty());
  assert!(h.service.fallback().load::<Product>("u1").is_empty());
  let err = h
    .service
    .add_product(NewProduct::default())
    .await
    .unwrap_err();
  assert_eq!(err, SyncError::NoActiveOwner);
}

#[tokio::test]
async fn test_sync_identity_follows_remote_session() {
  let h = Harness::new(FakeRemote::signed_in("u2"), SyncConfig::default());
  h.service.init("u1");

  assert_eq!(h.service.sync_identity().await.as_deref(), Some("u2"));
  assert_eq!(h.service.owner().as_deref(), Some("u2"));

  h.remote().sign_in(None);
  assert_eq!(h.service.sync_identity().await.as_deref(), Some("u2"));
}

// ============================================================================
// Maintenance and diagnostics
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_diagnostics_snapshot() {
  let h = Harness::new(seeded_remote(), SyncConfig::default());
  h.service.init("u1");
  h.service.refresh_now(true).await.unwrap();

  let diagnostics = h.service.diagnostics();

  assert_eq!(diagnostics.owner.as_deref(), Some("u1"));
  assert_eq!(diagnostics.requests_today, 4);
  assert_eq!(diagnostics.max_daily_requests, 200);
  assert_eq!(diagnostics.cache_entries, 4);
  assert_eq!(diagnostics.last_fetch_at, Some(start_time()));
  assert!(diagnostics.counts.contains(&(Collection::Products, 2)));
  assert!(diagnostics
    .snapshots
    .contains(&"fallback:products_u1".to_string()));
  assert!(serde_json::to_value(&diagnostics).is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_clear_local_data_keeps_owner() {
  let h = Harness::new(seeded_remote(), SyncConfig::default());
  h.service.init("u1");
  h.service.refresh_now(true).await.unwrap();

  h.service.clear_local_data();

  assert_eq!(h.service.owner().as_deref(), Some("u1"));
  assert!(h.service.dataset().is_empty());
  assert_eq!(h.service.caches().size(), 0);
  assert!(h.service.fallback().snapshot_keys().is_empty());
}

#[test]
fn test_cleanup_stale_uses_configured_age() {
  let h = Harness::new(FakeRemote::default(), SyncConfig::default());
  let old = Product::from_draft(
    NewProduct::default(),
    RecordId::Number(1),
    "u9",
    start_time() - chrono::Duration::days(45),
  );
  h.service.fallback().save("u9", &[old]).unwrap();
  h.service
    .fallback()
    .save("u1", &[product(2, "u1", "recent")])
    .unwrap();

  assert_eq!(h.service.cleanup_stale(), 1);
  assert_eq!(h.service.cleanup_stale(), 0);
  assert_eq!(h.service.fallback().snapshot_keys(), vec!["fallback:products_u1".to_string()]);
}
