//! Entity collections held by the sync core.
//!
//! The backend owns these rows; the core only keeps cached and fallback copies.
//! Beyond identity, ownership and `created_at`, the payload is opaque to the
//! core, so every record keeps unknown columns in a flattened `extra` map.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::cache::{CacheSet, Record, TtlCache};

/// The four collections kept in sync, in refresh order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
  Products,
  Movements,
  Sales,
  Bolos,
}

impl Collection {
  /// Refresh order: Products, then Movements, then Sales, then Bolos.
  pub const ALL: [Collection; 4] = [
    Collection::Products,
    Collection::Movements,
    Collection::Sales,
    Collection::Bolos,
  ];

  /// Remote table name and key prefix
  pub fn name(self) -> &'static str {
    match self {
      Self::Products => "products",
      Self::Movements => "movements",
      Self::Sales => "sales",
      Self::Bolos => "bolos",
    }
  }
}

impl fmt::Display for Collection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Row identifier. The backend hands out integers or strings; records
/// synthesized locally get a `local_` prefixed string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
  Number(i64),
  Text(String),
}

impl RecordId {
  /// Timestamp-based id for a record that only exists locally.
  pub fn local(created_at: DateTime<Utc>, seq: u64) -> Self {
    Self::Text(format!("local_{}_{}", created_at.timestamp_millis(), seq))
  }

  pub fn is_local(&self) -> bool {
    matches!(self, Self::Text(s) if s.starts_with("local_"))
  }

  /// JSON form used in remote match predicates
  pub fn to_value(&self) -> Value {
    match self {
      Self::Number(n) => Value::from(*n),
      Self::Text(s) => Value::from(s.as_str()),
    }
  }
}

impl fmt::Display for RecordId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Number(n) => write!(f, "{}", n),
      Self::Text(s) => f.write_str(s),
    }
  }
}

impl From<i64> for RecordId {
  fn from(n: i64) -> Self {
    Self::Number(n)
  }
}

impl From<&str> for RecordId {
  fn from(s: &str) -> Self {
    Self::Text(s.to_string())
  }
}

// ============================================================================
// Timestamps
// ============================================================================

/// Parse a backend timestamp. Accepts RFC 3339, the `2024-03-10 11:00:00+00`
/// form Postgres prints for `timestamptz`, and offset-less timestamps, which
/// are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
  if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
    return Some(at.with_timezone(&Utc));
  }
  if let Ok(at) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z") {
    return Some(at.with_timezone(&Utc));
  }
  ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
    .iter()
    .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
    .map(|naive| Utc.from_utc_datetime(&naive))
}

/// `created_at` is informational; anything unparseable reads as absent.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
  D: Deserializer<'de>,
{
  let raw = Option::<Value>::deserialize(deserializer)?;
  Ok(match raw {
    Some(Value::String(s)) => parse_timestamp(&s),
    _ => None,
  })
}

// ============================================================================
// Records
// ============================================================================

/// Inventory product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
  pub id: RecordId,
  pub user_id: String,
  #[serde(rename = "nome", default)]
  pub name: String,
  #[serde(rename = "preco", default)]
  pub price: f64,
  #[serde(rename = "quantidade", default)]
  pub quantity: i64,
  #[serde(rename = "categoria", default, skip_serializing_if = "Option::is_none")]
  pub category: Option<String>,
  #[serde(
    default,
    deserialize_with = "lenient_timestamp",
    skip_serializing_if = "Option::is_none"
  )]
  pub created_at: Option<DateTime<Utc>>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// Creation payload for a product
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewProduct {
  #[serde(rename = "nome")]
  pub name: String,
  #[serde(rename = "preco", default)]
  pub price: f64,
  #[serde(rename = "quantidade", default)]
  pub quantity: i64,
  #[serde(rename = "categoria", default, skip_serializing_if = "Option::is_none")]
  pub category: Option<String>,
}

/// Direction of a stock movement. Kinds this crate does not know about are
/// carried through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MovementKind {
  Inbound,
  Outbound,
  Other(String),
}

impl From<String> for MovementKind {
  fn from(raw: String) -> Self {
    match raw.as_str() {
      "entrada" => Self::Inbound,
      "saida" => Self::Outbound,
      _ => Self::Other(raw),
    }
  }
}

impl From<MovementKind> for String {
  fn from(kind: MovementKind) -> Self {
    match kind {
      MovementKind::Inbound => "entrada".to_string(),
      MovementKind::Outbound => "saida".to_string(),
      MovementKind::Other(raw) => raw,
    }
  }
}

/// Stock entering or leaving the shop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockMovement {
  pub id: RecordId,
  pub user_id: String,
  #[serde(rename = "produto_id")]
  pub product_id: RecordId,
  #[serde(rename = "tipo")]
  pub kind: MovementKind,
  #[serde(rename = "quantidade", default)]
  pub quantity: i64,
  #[serde(rename = "motivo", default, skip_serializing_if = "Option::is_none")]
  pub reason: Option<String>,
  #[serde(
    default,
    deserialize_with = "lenient_timestamp",
    skip_serializing_if = "Option::is_none"
  )]
  pub created_at: Option<DateTime<Utc>>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// Creation payload for a stock movement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStockMovement {
  #[serde(rename = "produto_id")]
  pub product_id: RecordId,
  #[serde(rename = "tipo")]
  pub kind: MovementKind,
  #[serde(rename = "quantidade")]
  pub quantity: i64,
  #[serde(rename = "motivo", default, skip_serializing_if = "Option::is_none")]
  pub reason: Option<String>,
}

/// One line of a sale
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaleItem {
  #[serde(rename = "nome", default)]
  pub name: String,
  #[serde(rename = "quantidade", default)]
  pub quantity: i64,
  #[serde(rename = "preco_unitario", default)]
  pub unit_price: f64,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// Completed sale (a checked-out cart)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sale {
  pub id: RecordId,
  pub user_id: String,
  #[serde(rename = "itens", default)]
  pub items: Vec<SaleItem>,
  #[serde(default)]
  pub total: f64,
  #[serde(
    rename = "forma_pagamento",
    default,
    skip_serializing_if = "Option::is_none"
  )]
  pub payment_method: Option<String>,
  #[serde(
    default,
    deserialize_with = "lenient_timestamp",
    skip_serializing_if = "Option::is_none"
  )]
  pub created_at: Option<DateTime<Utc>>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// Creation payload for a sale
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewSale {
  #[serde(rename = "itens")]
  pub items: Vec<SaleItem>,
  pub total: f64,
  #[serde(
    rename = "forma_pagamento",
    default,
    skip_serializing_if = "Option::is_none"
  )]
  pub payment_method: Option<String>,
}

/// Cake on offer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CakeItem {
  pub id: RecordId,
  pub user_id: String,
  #[serde(rename = "nome", default)]
  pub name: String,
  #[serde(rename = "sabor", default, skip_serializing_if = "Option::is_none")]
  pub flavor: Option<String>,
  #[serde(rename = "preco", default)]
  pub price: f64,
  #[serde(rename = "quantidade", default)]
  pub quantity: i64,
  #[serde(
    default,
    deserialize_with = "lenient_timestamp",
    skip_serializing_if = "Option::is_none"
  )]
  pub created_at: Option<DateTime<Utc>>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// Creation payload for a cake
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewCakeItem {
  #[serde(rename = "nome")]
  pub name: String,
  #[serde(rename = "sabor", default, skip_serializing_if = "Option::is_none")]
  pub flavor: Option<String>,
  #[serde(rename = "preco", default)]
  pub price: f64,
  #[serde(rename = "quantidade", default)]
  pub quantity: i64,
}

// ============================================================================
// Record implementations
// ============================================================================

impl Record for Product {
  type Draft = NewProduct;

  fn collection() -> Collection {
    Collection::Products
  }

  fn id(&self) -> &RecordId {
    &self.id
  }

  fn owner_id(&self) -> &str {
    &self.user_id
  }

  fn created_at(&self) -> Option<DateTime<Utc>> {
    self.created_at
  }

  fn from_draft(draft: NewProduct, id: RecordId, owner: &str, created_at: DateTime<Utc>) -> Self {
    Self {
      id,
      user_id: owner.to_string(),
      name: draft.name,
      price: draft.price,
      quantity: draft.quantity,
      category: draft.category,
      created_at: Some(created_at),
      extra: Map::new(),
    }
  }

  fn slot(data: &Dataset) -> &Vec<Self> {
    &data.products
  }

  fn slot_mut(data: &mut Dataset) -> &mut Vec<Self> {
    &mut data.products
  }

  fn cache(caches: &CacheSet) -> &TtlCache<Vec<Self>> {
    &caches.products
  }
}

impl Record for StockMovement {
  type Draft = NewStockMovement;

  fn collection() -> Collection {
    Collection::Movements
  }

  fn id(&self) -> &RecordId {
    &self.id
  }

  fn owner_id(&self) -> &str {
    &self.user_id
  }

  fn created_at(&self) -> Option<DateTime<Utc>> {
    self.created_at
  }

  fn from_draft(
    draft: NewStockMovement,
    id: RecordId,
    owner: &str,
    created_at: DateTime<Utc>,
  ) -> Self {
    Self {
      id,
      user_id: owner.to_string(),
      product_id: draft.product_id,
      kind: draft.kind,
      quantity: draft.quantity,
      reason: draft.reason,
      created_at: Some(created_at),
      extra: Map::new(),
    }
  }

  fn slot(data: &Dataset) -> &Vec<Self> {
    &data.movements
  }

  fn slot_mut(data: &mut Dataset) -> &mut Vec<Self> {
    &mut data.movements
  }

  fn cache(caches: &CacheSet) -> &TtlCache<Vec<Self>> {
    &caches.movements
  }
}

impl Record for Sale {
  type Draft = NewSale;

  fn collection() -> Collection {
    Collection::Sales
  }

  fn id(&self) -> &RecordId {
    &self.id
  }

  fn owner_id(&self) -> &str {
    &self.user_id
  }

  fn created_at(&self) -> Option<DateTime<Utc>> {
    self.created_at
  }

  fn from_draft(draft: NewSale, id: RecordId, owner: &str, created_at: DateTime<Utc>) -> Self {
    Self {
      id,
      user_id: owner.to_string(),
      items: draft.items,
      total: draft.total,
      payment_method: draft.payment_method,
      created_at: Some(created_at),
      extra: Map::new(),
    }
  }

  fn slot(data: &Dataset) -> &Vec<Self> {
    &data.sales
  }

  fn slot_mut(data: &mut Dataset) -> &mut Vec<Self> {
    &mut data.sales
  }

  fn cache(caches: &CacheSet) -> &TtlCache<Vec<Self>> {
    &caches.sales
  }
}

impl Record for CakeItem {
  type Draft = NewCakeItem;

  fn collection() -> Collection {
    Collection::Bolos
  }

  fn id(&self) -> &RecordId {
    &self.id
  }

  fn owner_id(&self) -> &str {
    &self.user_id
  }

  fn created_at(&self) -> Option<DateTime<Utc>> {
    self.created_at
  }

  fn from_draft(draft: NewCakeItem, id: RecordId, owner: &str, created_at: DateTime<Utc>) -> Self {
    Self {
      id,
      user_id: owner.to_string(),
      name: draft.name,
      flavor: draft.flavor,
      price: draft.price,
      quantity: draft.quantity,
      created_at: Some(created_at),
      extra: Map::new(),
    }
  }

  fn slot(data: &Dataset) -> &Vec<Self> {
    &data.bolos
  }

  fn slot_mut(data: &mut Dataset) -> &mut Vec<Self> {
    &mut data.bolos
  }

  fn cache(caches: &CacheSet) -> &TtlCache<Vec<Self>> {
    &caches.bolos
  }
}

// ============================================================================
// In-memory state
// ============================================================================

/// In-memory copy of every collection for the active owner.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
  pub products: Vec<Product>,
  pub movements: Vec<StockMovement>,
  pub sales: Vec<Sale>,
  pub bolos: Vec<CakeItem>,
}

impl Dataset {
  pub fn len_of(&self, collection: Collection) -> usize {
    match collection {
      Collection::Products => self.products.len(),
      Collection::Movements => self.movements.len(),
      Collection::Sales => self.sales.len(),
      Collection::Bolos => self.bolos.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    Collection::ALL.iter().all(|c| self.len_of(*c) == 0)
  }
}
