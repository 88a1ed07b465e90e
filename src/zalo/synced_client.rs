//! Zalo client bound to a roster cache.

use chrono::{DateTime, Utc};
use color_eyre::{
  eyre::{eyre, Report},
  Result,
};
use std::sync::Mutex;

use crate::cache::{
  roster_key, ActiveFlag, ReconcileResult, Reconciler, RosterEntity, RosterStore, SqliteStorage,
};
use crate::config::Config;
use crate::event::EventSink;

use super::client::ZaloClient;
use super::error::ApiError;
use super::types::Session;

/// Zalo client with roster caching.
///
/// Every sync runs one reconciliation pass: cached data first, then the id
/// listing, then batched detail fetches.
pub struct SyncedZaloClient<S: RosterStore = SqliteStorage> {
  inner: ZaloClient,
  reconciler: Reconciler<S>,
}

impl SyncedZaloClient<SqliteStorage> {
  /// Create a client backed by the on-disk cache.
  pub fn new(config: &Config) -> Result<Self> {
    let storage = SqliteStorage::open()?;
    Self::with_storage(config, storage)
  }
}

impl<S: RosterStore> SyncedZaloClient<S> {
  pub fn with_storage(config: &Config, storage: S) -> Result<Self> {
    let inner = ZaloClient::new(config)?;
    let reconciler = Reconciler::new(storage).with_config(config.sync.reconcile_config());

    Ok(Self { inner, reconciler })
  }

  /// Reconcile one roster kind for the session's account.
  ///
  /// A session-expiry response ends the pass right away, without touching
  /// `active`, and is returned as an error so the caller can ask for a
  /// fresh login.
  pub async fn sync<T: RosterEntity>(
    &self,
    session: &Session,
    active: &ActiveFlag,
    events: &EventSink<T>,
  ) -> Result<ReconcileResult<T>> {
    let expired: Mutex<Option<ApiError>> = Mutex::new(None);
    let expired = &expired;
    let pass = active.child();
    let pass = &pass;

    let result = self
      .reconciler
      .reconcile(
        &session.own_id,
        pass,
        events,
        || {
          let inner = self.inner.clone();
          let session = session.clone();
          async move { track_expiry(expired, pass, inner.fetch_ids::<T>(&session).await) }
        },
        |batch| {
          let inner = self.inner.clone();
          let session = session.clone();
          async move {
            let result = inner.fetch_details::<T>(&session, &batch).await;
            track_expiry(expired, pass, result)
          }
        },
      )
      .await?;

    match latched(expired) {
      Some(err) => Err(err.into()),
      None => Ok(result),
    }
  }

  /// Cached roster for an account, no network access.
  pub fn cached<T: RosterEntity>(&self, owner: &str) -> Result<Vec<T>> {
    self.reconciler.cached(owner)
  }

  /// When an account's roster was last written.
  pub fn cached_at<T: RosterEntity>(&self, owner: &str) -> Result<Option<DateTime<Utc>>> {
    self.reconciler.storage().cached_at(&roster_key::<T>(owner))
  }

  /// Forget an account's cached roster.
  pub fn clear<T: RosterEntity>(&self, owner: &str) -> Result<bool> {
    self.reconciler.storage().clear::<T>(owner)
  }
}

/// Remember a session-expiry failure and stop the pass it happened in.
fn track_expiry<X>(
  expired: &Mutex<Option<ApiError>>,
  pass: &ActiveFlag,
  result: Result<X>,
) -> Result<X> {
  if let Err(e) = &result {
    if let Some(api) = e.downcast_ref::<ApiError>() {
      if api.is_session_expired() {
        pass.deactivate();
        if let Ok(mut slot) = expired.lock() {
          *slot = Some(api.clone());
        }
      }
    }
  }
  result
}

fn latched(expired: &Mutex<Option<ApiError>>) -> Option<ApiError> {
  expired.lock().ok().and_then(|slot| slot.clone())
}

/// Whether a report carries a session-expiry failure.
pub fn is_session_expired(report: &Report) -> bool {
  report
    .downcast_ref::<ApiError>()
    .is_some_and(ApiError::is_session_expired)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::event::SyncEvent;
  use crate::zalo::types::Group;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::{TcpListener, TcpStream};

  fn config() -> Config {
    Config::from_yaml(
      r#"
backend:
  url: http://127.0.0.1:9
sync:
  batch_delay_ms: 0
"#,
    )
    .unwrap()
  }

  fn session() -> Session {
    Session {
      own_id: "8490".into(),
      cookie: "c".into(),
      imei: "i".into(),
      user_agent: "ua".into(),
    }
  }

  /// Read one HTTP request, headers and body.
  async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
      let n = socket.read(&mut chunk).await.unwrap();
      if n == 0 {
        break;
      }
      buf.extend_from_slice(&chunk[..n]);
      let text = String::from_utf8_lossy(&buf);
      if let Some(end) = text.find("\r\n\r\n") {
        let length = text[..end]
          .lines()
          .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name
              .eq_ignore_ascii_case("content-length")
              .then(|| value.trim().parse::<usize>().ok())
              .flatten()
          })
          .unwrap_or(0);
        if buf.len() >= end + 4 + length {
          break;
        }
      }
    }
    String::from_utf8_lossy(&buf).into_owned()
  }

  /// Local backend listing 20 group ids whose detail calls all report an
  /// expired session. Returns its base URL and the detail call counter.
  async fn expiring_backend() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let detail_calls = Arc::new(AtomicUsize::new(0));
    let calls = Arc::clone(&detail_calls);

    tokio::spawn(async move {
      while let Ok((mut socket, _)) = listener.accept().await {
        let calls = Arc::clone(&calls);
        tokio::spawn(async move {
          let request = read_request(&mut socket).await;
          let body = if request.starts_with("POST /api/groups/ids") {
            let ids: Vec<String> = (0..20).map(|i| format!("g{}", i)).collect();
            serde_json::json!({ "success": true, "ids": ids }).to_string()
          } else {
            calls.fetch_add(1, Ordering::SeqCst);
            r#"{"success": false, "code": 179}"#.to_string()
          };
          let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\
             Connection: close\r\n\r\n{}",
            body.len(),
            body
          );
          let _ = socket.write_all(response.as_bytes()).await;
        });
      }
    });

    (format!("http://{}", addr), detail_calls)
  }

  #[test]
  fn test_track_expiry_latches_session_errors() {
    let expired = Mutex::new(None);
    let pass = ActiveFlag::new();

    let ok: Result<u32> = track_expiry(&expired, &pass, Ok(1));
    assert_eq!(ok.unwrap(), 1);
    assert!(latched(&expired).is_none());

    let other: Result<u32> = track_expiry(&expired, &pass, Err(eyre!("connection refused")));
    assert!(other.is_err());
    assert!(latched(&expired).is_none());
    assert!(pass.is_active());

    let err: Result<u32> = track_expiry(
      &expired,
      &pass,
      Err(ApiError::SessionExpired { code: 3 }.into()),
    );
    assert!(is_session_expired(&err.unwrap_err()));
    assert_eq!(latched(&expired), Some(ApiError::SessionExpired { code: 3 }));
    assert!(!pass.is_active());
  }

  #[test]
  fn test_is_session_expired() {
    assert!(is_session_expired(&Report::new(ApiError::SessionExpired {
      code: 179
    })));
    assert!(!is_session_expired(&Report::new(ApiError::Rejected {
      code: Some(1),
      message: "nope".into()
    })));
    assert!(!is_session_expired(&eyre!("plain failure")));
  }

  #[tokio::test]
  async fn test_unreachable_backend_keeps_cache() {
    let storage = MemoryStorage::new();
    let cached = vec![Group {
      id: "g1".into(),
      name: "Sellers".into(),
      avatar: None,
      total_member: 3,
      is_creator: false,
      is_admin: true,
    }];
    storage.save("8490", &cached).unwrap();

    let client = SyncedZaloClient::with_storage(&config(), storage).unwrap();

    let result = client
      .sync::<Group>(&session(), &ActiveFlag::new(), &EventSink::none())
      .await
      .unwrap();

    assert_eq!(
      result.outcome,
      crate::cache::ReconcileOutcome::Aborted(crate::cache::AbortReason::ListingFailed)
    );
    assert_eq!(client.cached::<Group>("8490").unwrap(), cached);
    assert!(client.cached_at::<Group>("8490").unwrap().is_some());
  }

  #[tokio::test]
  async fn test_session_expiry_ends_pass_immediately() {
    let (url, detail_calls) = expiring_backend().await;
    let config = Config::from_yaml(&format!(
      "backend:\n  url: {}\nsync:\n  batch_size: 5\n  batch_delay_ms: 500\n",
      url
    ))
    .unwrap();
    let client = SyncedZaloClient::with_storage(&config, MemoryStorage::new()).unwrap();
    let active = ActiveFlag::new();
    let (sink, mut rx) = EventSink::<Group>::channel();
    let start = std::time::Instant::now();

    let err = client.sync::<Group>(&session(), &active, &sink).await.unwrap_err();
    let elapsed = start.elapsed();
    drop(sink);

    assert!(is_session_expired(&err));
    assert_eq!(detail_calls.load(Ordering::SeqCst), 1);
    // No inter-batch sleeps after the expiry
    assert!(elapsed < std::time::Duration::from_millis(500));
    // The caller's flag is left alone
    assert!(active.is_active());

    let mut failed = 0;
    while let Some(event) = rx.recv().await {
      if let SyncEvent::BatchFailed { .. } = event {
        failed += 1;
      }
    }
    assert_eq!(failed, 0);
    assert!(client.cached::<Group>("8490").unwrap().is_empty());
  }
}
