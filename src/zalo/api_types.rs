//! Wire types for the Zalo backend API.
//!
//! These mirror the JSON envelopes the backend returns and are converted
//! into plain results (or `ApiError`) at the client boundary.

use serde::{Deserialize, Deserializer, Serialize};

use super::error::ApiError;
use super::types::Session;

/// Body for detail requests: session credentials plus the ids to resolve
#[derive(Debug, Serialize)]
pub struct ApiDetailsRequest<'a> {
  #[serde(flatten)]
  pub session: &'a Session,
  pub ids: &'a [String],
}

/// Response of the cheap id listing endpoints
#[derive(Debug, Deserialize)]
pub struct ApiIdsResponse {
  pub success: bool,
  #[serde(default, deserialize_with = "deserialize_ids")]
  pub ids: Vec<String>,
  pub code: Option<i64>,
  pub message: Option<String>,
}

impl ApiIdsResponse {
  pub fn into_result(self) -> Result<Vec<String>, ApiError> {
    if self.success {
      Ok(self.ids)
    } else {
      Err(ApiError::from_response(self.code, self.message))
    }
  }
}

/// Response of the detail endpoints
#[derive(Debug, Deserialize)]
pub struct ApiRecordsResponse<T> {
  pub success: bool,
  #[serde(default = "Vec::new")]
  pub records: Vec<T>,
  pub code: Option<i64>,
  pub message: Option<String>,
}

impl<T> ApiRecordsResponse<T> {
  pub fn into_result(self) -> Result<Vec<T>, ApiError> {
    if self.success {
      Ok(self.records)
    } else {
      Err(ApiError::from_response(self.code, self.message))
    }
  }
}

/// Ids arrive as strings from some endpoints and as numbers from others
#[derive(Deserialize)]
#[serde(untagged)]
enum ApiId {
  Text(String),
  Number(u64),
}

fn deserialize_ids<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: Deserializer<'de>,
{
  let ids: Option<Vec<ApiId>> = Option::deserialize(deserializer)?;
  Ok(
    ids
      .unwrap_or_default()
      .into_iter()
      .map(|id| match id {
        ApiId::Text(s) => s,
        ApiId::Number(n) => n.to_string(),
      })
      .collect(),
  )
}
