//! Remote data collaborator.
//!
//! The sync core talks to the backend through four verbs per collection plus
//! an identity check. Rows travel as JSON values; typing happens at the
//! boundary inside the sync core.

mod rest;

pub use rest::RestRemote;

use serde_json::Value;

use crate::error::Result;
use crate::model::Collection;

/// Equality predicate on one column.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
  pub column: String,
  pub value: Value,
}

impl Filter {
  pub fn eq(column: &str, value: impl Into<Value>) -> Self {
    Self {
      column: column.to_string(),
      value: value.into(),
    }
  }
}

/// Sort order for a select.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
  pub column: String,
  pub descending: bool,
}

/// Parameters of a `select`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectQuery {
  /// Equality filters, all of which must match
  pub filters: Vec<Filter>,
  pub order: Option<Order>,
  /// Zero-based inclusive row range
  pub range: Option<(usize, usize)>,
}

impl SelectQuery {
  /// Rows owned by `owner`, newest first, at most `limit` of them (and at
  /// least one, since the range is inclusive).
  pub fn owned_by(owner: &str, limit: usize) -> Self {
    let limit = limit.max(1);
    Self {
      filters: vec![Filter::eq("user_id", owner)],
      order: Some(Order {
        column: "created_at".to_string(),
        descending: true,
      }),
      range: Some((0, limit - 1)),
    }
  }
}

/// Backend operations the sync core depends on.
#[trait_variant::make(Remote: Send)]
pub trait LocalRemote {
  async fn select(&self, collection: Collection, query: &SelectQuery) -> Result<Vec<Value>>;

  /// Insert one row and echo it back as stored.
  async fn insert(&self, collection: Collection, row: &Value) -> Result<Value>;

  async fn update(
    &self,
    collection: Collection,
    patch: &Value,
    filters: &[Filter],
  ) -> Result<Vec<Value>>;

  async fn delete(&self, collection: Collection, filters: &[Filter]) -> Result<()>;

  /// Identity the backend currently considers authenticated
  async fn current_identity(&self) -> Option<String>;
}
