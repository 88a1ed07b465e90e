// Typed failures reported by the Zalo backend.
// Travel inside eyre reports so callers can downcast for session expiry.

use thiserror::Error;

/// Response codes the backend uses for an expired or revoked session.
pub const SESSION_EXPIRED_CODES: &[i64] = &[3, 179];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
  #[error("Zalo session expired (code {code}), log in again")]
  SessionExpired { code: i64 },

  #[error("Backend rejected request{}: {message}", code_suffix(.code))]
  Rejected { code: Option<i64>, message: String },
}

fn code_suffix(code: &Option<i64>) -> String {
  code.map(|c| format!(" (code {})", c)).unwrap_or_default()
}

impl ApiError {
  /// Classify an unsuccessful response.
  pub fn from_response(code: Option<i64>, message: Option<String>) -> Self {
    match code {
      Some(code) if SESSION_EXPIRED_CODES.contains(&code) => Self::SessionExpired { code },
      _ => Self::Rejected {
        code,
        message: message.unwrap_or_else(|| "no message".to_string()),
      },
    }
  }

  pub fn is_session_expired(&self) -> bool {
    matches!(self, Self::SessionExpired { .. })
  }
}
