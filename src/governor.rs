//! Daily request budget and offline switch.
//!
//! Every outbound read asks the governor first. The counter is scoped to the
//! current calendar day and persisted so a restart does not refill the budget.
//! Anything unreadable about the persisted counter is treated as a fresh day
//! with nothing spent, never as unlimited quota.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::KeyValueStore;
use crate::clock::Clock;
use crate::error::SyncError;

const COUNTER_KEY: &str = "request_counter";

/// Default daily request budget
pub const DEFAULT_MAX_DAILY_REQUESTS: u32 = 200;

/// Requests made on one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCounter {
  pub date: NaiveDate,
  pub count: u32,
}

/// Gate for outbound remote requests.
pub struct RequestGovernor {
  max_daily_requests: u32,
  offline_mode: AtomicBool,
  counter: Mutex<RequestCounter>,
  store: Arc<dyn KeyValueStore>,
  clock: Arc<dyn Clock>,
}

impl RequestGovernor {
  pub fn new(
    max_daily_requests: u32,
    offline_mode: bool,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    let counter = Self::load_counter(store.as_ref(), clock.today());
    Self {
      max_daily_requests,
      offline_mode: AtomicBool::new(offline_mode),
      counter: Mutex::new(counter),
      store,
      clock,
    }
  }

  fn load_counter(store: &dyn KeyValueStore, today: NaiveDate) -> RequestCounter {
    let fresh = RequestCounter {
      date: today,
      count: 0,
    };

    match store.get(COUNTER_KEY) {
      Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
        warn!(error = %e, "unreadable request counter, starting a new day");
        fresh
      }),
      Ok(None) => fresh,
      Err(e) => {
        warn!(error = %e, "request counter read failed, starting a new day");
        fresh
      }
    }
  }

  fn persist(&self, counter: &RequestCounter) {
    let result = serde_json::to_string(counter)
      .map_err(|e| e.to_string())
      .and_then(|raw| {
        self
          .store
          .set(COUNTER_KEY, &raw)
          .map_err(|e| e.to_string())
      });
    if let Err(e) = result {
      warn!(error = %e, "failed to persist request counter");
    }
  }

  /// Whether a new remote request is permitted right now.
  pub fn can_make_request(&self) -> bool {
    self.check().is_ok()
  }

  /// Like [`can_make_request`](Self::can_make_request), but says why not.
  pub fn check(&self) -> Result<(), SyncError> {
    if self.is_offline() {
      return Err(SyncError::OfflineModeActive);
    }
    let count = self.today_count();
    if count >= self.max_daily_requests {
      return Err(SyncError::QuotaExceeded {
        count,
        max: self.max_daily_requests,
      });
    }
    Ok(())
  }

  /// Count one request against today's budget.
  pub fn record_request(&self) {
    let today = self.clock.today();
    let snapshot = {
      let mut counter = match self.counter.lock() {
        Ok(counter) => counter,
        Err(poisoned) => poisoned.into_inner(),
      };
      if counter.date != today {
        counter.date = today;
        counter.count = 0;
      }
      counter.count = counter.count.saturating_add(1);
      *counter
    };
    debug!(count = snapshot.count, "request recorded");
    self.persist(&snapshot);
  }

  /// Requests recorded today.
  pub fn today_count(&self) -> u32 {
    let today = self.clock.today();
    match self.counter.lock() {
      Ok(counter) if counter.date == today => counter.count,
      Ok(_) => 0,
      Err(poisoned) => {
        let counter = poisoned.into_inner();
        if counter.date == today {
          counter.count
        } else {
          0
        }
      }
    }
  }

  pub fn max_daily_requests(&self) -> u32 {
    self.max_daily_requests
  }

  pub fn is_offline(&self) -> bool {
    self.offline_mode.load(Ordering::SeqCst)
  }

  pub fn set_offline_mode(&self, offline: bool) {
    self.offline_mode.store(offline, Ordering::SeqCst);
  }
}
