use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::config::{Config, RemoteConfig};
use crate::error::{Result, SyncError};
use crate::model::Collection;

use super::{Filter, Remote, SelectQuery};

/// Client for a PostgREST-style backend (`/rest/v1/<table>` plus `/auth/v1/user`).
#[derive(Clone)]
pub struct RestRemote {
  client: reqwest::Client,
  base: Url,
  api_key: String,
  access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
  id: String,
}

impl RestRemote {
  pub fn new(config: &RemoteConfig) -> color_eyre::Result<Self> {
    let api_key = Config::get_api_key()?;
    let access_token = Config::get_access_token();
    Self::with_credentials(&config.url, api_key, access_token)
  }

  pub fn with_credentials(
    url: &str,
    api_key: String,
    access_token: Option<String>,
  ) -> color_eyre::Result<Self> {
    let normalized = if url.ends_with('/') {
      url.to_string()
    } else {
      format!("{}/", url)
    };
    let base = Url::parse(&normalized)
      .map_err(|e| color_eyre::eyre::eyre!("Invalid backend URL '{}': {}", url, e))?;

    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| color_eyre::eyre::eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      api_key,
      access_token,
    })
  }

  fn table_url(&self, collection: Collection, filters: &[Filter]) -> Result<Url> {
    let mut url = self
      .base
      .join(&format!("rest/v1/{}", collection.name()))
      .map_err(|e| SyncError::RemoteRejected(format!("bad table URL: {}", e)))?;
    {
      let mut pairs = url.query_pairs_mut();
      for filter in filters {
        pairs.append_pair(&filter.column, &format!("eq.{}", filter_value(&filter.value)));
      }
    }
    Ok(url)
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
    self
      .client
      .request(method, url)
      .header("apikey", &self.api_key)
      .bearer_auth(bearer)
  }

  async fn send(&self, request: RequestBuilder) -> Result<Response> {
    let response = request
      .send()
      .await
      .map_err(|e| SyncError::RemoteRejected(format!("request failed: {}", e)))?;

    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
      return Err(SyncError::NotAuthenticated);
    }

    let body = response.text().await.unwrap_or_default();
    Err(SyncError::RemoteRejected(format!(
      "HTTP {}: {}",
      status.as_u16(),
      body
    )))
  }

  async fn rows(collection: Collection, response: Response) -> Result<Vec<Value>> {
    response
      .json::<Vec<Value>>()
      .await
      .map_err(|e| SyncError::MalformedRemoteData {
        collection,
        message: e.to_string(),
      })
  }
}

/// PostgREST filter operand: bare strings, JSON text for anything else.
fn filter_value(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

impl Remote for RestRemote {
  async fn select(&self, collection: Collection, query: &SelectQuery) -> Result<Vec<Value>> {
    let mut url = self.table_url(collection, &query.filters)?;
    {
      let mut pairs = url.query_pairs_mut();
      pairs.append_pair("select", "*");
      if let Some(order) = &query.order {
        let direction = if order.descending { "desc" } else { "asc" };
        pairs.append_pair("order", &format!("{}.{}", order.column, direction));
      }
      if let Some((from, to)) = query.range {
        pairs.append_pair("offset", &from.to_string());
        pairs.append_pair("limit", &(to.saturating_sub(from) + 1).to_string());
      }
    }

    let response = self.send(self.request(Method::GET, url)).await?;
    Self::rows(collection, response).await
  }

  async fn insert(&self, collection: Collection, row: &Value) -> Result<Value> {
    let url = self.table_url(collection, &[])?;
    let request = self
      .request(Method::POST, url)
      .header("Prefer", "return=representation")
      .json(row);

    let response = self.send(request).await?;
    Self::rows(collection, response)
      .await?
      .into_iter()
      .next()
      .ok_or_else(|| SyncError::RemoteRejected("insert returned no rows".to_string()))
  }

  async fn update(
    &self,
    collection: Collection,
    patch: &Value,
    filters: &[Filter],
  ) -> Result<Vec<Value>> {
    let url = self.table_url(collection, filters)?;
    let request = self
      .request(Method::PATCH, url)
      .header("Prefer", "return=representation")
      .json(patch);

    let response = self.send(request).await?;
    Self::rows(collection, response).await
  }

  async fn delete(&self, collection: Collection, filters: &[Filter]) -> Result<()> {
    let url = self.table_url(collection, filters)?;
    self.send(self.request(Method::DELETE, url)).await?;
    Ok(())
  }

  async fn current_identity(&self) -> Option<String> {
    // Without a user session there is nothing to ask
    self.access_token.as_ref()?;

    let url = self.base.join("auth/v1/user").ok()?;
    let response = self.send(self.request(Method::GET, url)).await.ok()?;
    response.json::<ApiUser>().await.ok().map(|user| user.id)
  }
}
