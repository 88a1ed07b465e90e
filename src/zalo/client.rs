use crate::cache::RosterEntity;
use crate::config::Config;
use crate::zalo::api_types::{ApiDetailsRequest, ApiIdsResponse, ApiRecordsResponse};
use crate::zalo::types::Session;
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Zalo backend API client
#[derive(Clone)]
pub struct ZaloClient {
  http: reqwest::Client,
  base: Url,
}

impl ZaloClient {
  pub fn new(config: &Config) -> Result<Self> {
    let base = base_url(&config.backend.url)?;

    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.backend.timeout_secs))
      .user_agent(concat!("zroster/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { http, base })
  }

  /// POST a JSON body and decode the JSON response
  async fn post<B, R>(&self, path: &str, body: &B) -> Result<R>
  where
    B: Serialize + ?Sized,
    R: DeserializeOwned,
  {
    let url = self
      .base
      .join(path)
      .map_err(|e| eyre!("Invalid endpoint {}: {}", path, e))?;

    let response = self
      .http
      .post(url)
      .json(body)
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", path, e))?;

    let status = response.status();
    if !status.is_success() {
      let text = response.text().await.unwrap_or_default();
      return Err(eyre!("HTTP {} from {}: {}", status, path, text));
    }

    response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse response from {}: {}", path, e))
  }

  /// Get the ids currently valid for a roster kind
  pub async fn fetch_ids<T: RosterEntity>(&self, session: &Session) -> Result<Vec<String>> {
    let path = ids_path::<T>();
    let response: ApiIdsResponse = self.post(&path, session).await?;
    let ids = response.into_result()?;

    debug!(endpoint = %path, count = ids.len(), "Fetched valid ids");
    Ok(ids)
  }

  /// Get full records for a batch of ids
  pub async fn fetch_details<T: RosterEntity>(
    &self,
    session: &Session,
    ids: &[String],
  ) -> Result<Vec<T>> {
    let path = details_path::<T>();
    let body = ApiDetailsRequest { session, ids };
    let response: ApiRecordsResponse<T> = self.post(&path, &body).await?;
    let records = response.into_result()?;

    debug!(endpoint = %path, requested = ids.len(), received = records.len(), "Fetched details");
    Ok(records)
  }
}

/// Parse the configured base URL so relative endpoint paths append to it
fn base_url(raw: &str) -> Result<Url> {
  let mut base = Url::parse(raw).map_err(|e| eyre!("Invalid backend URL {}: {}", raw, e))?;
  if !base.path().ends_with('/') {
    let path = format!("{}/", base.path());
    base.set_path(&path);
  }
  Ok(base)
}

fn ids_path<T: RosterEntity>() -> String {
  format!("api/{}/ids", T::namespace())
}

fn details_path<T: RosterEntity>() -> String {
  format!("api/{}/details", T::namespace())
}
