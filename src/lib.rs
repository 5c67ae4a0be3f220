//! Offline-tolerant data access for a small-shop inventory and sales backend.
//!
//! [`SyncService`] keeps products, stock movements, sales and cake items for
//! one owner at a time. Reads go through a daily request budget, a TTL cache
//! and a throttled refresh scheduler; durable per-owner snapshots back every
//! read and write when the backend is unreachable.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod governor;
pub mod model;
pub mod remote;
pub mod sync;

pub use error::{Result, SyncError};
pub use event::SyncEvent;
pub use sync::{MutationResult, SyncConfig, SyncService, WriteTarget};
