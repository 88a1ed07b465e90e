use tokio::sync::mpsc;

/// Progress events emitted while a roster is being reconciled
#[derive(Debug, Clone)]
pub enum SyncEvent<T> {
  /// Cached roster, sent before any network call. Sent again once the
  /// pass gets its turn if another pass on the same roster was running.
  Cached(Vec<T>),
  /// Records confirmed gone were dropped and the roster persisted
  Pruned { removed: Vec<String>, roster: Vec<T> },
  /// A detail batch was merged and the roster persisted
  BatchMerged {
    batch: usize,
    total: usize,
    roster: Vec<T>,
  },
  /// A detail batch failed; its entities stay as they were
  BatchFailed {
    batch: usize,
    total: usize,
    error: String,
  },
}

/// Sending half for sync events. Sends never fail the pass; a dropped
/// receiver just means nobody is listening anymore.
pub struct EventSink<T> {
  tx: Option<mpsc::UnboundedSender<SyncEvent<T>>>,
}

impl<T> EventSink<T> {
  /// Create a sink along with the receiver that consumes it
  pub fn channel() -> (Self, mpsc::UnboundedReceiver<SyncEvent<T>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx: Some(tx) }, rx)
  }

  /// A sink that drops every event
  pub fn none() -> Self {
    Self { tx: None }
  }

  pub fn send(&self, event: SyncEvent<T>) {
    if let Some(tx) = &self.tx {
      let _ = tx.send(event);
    }
  }
}

impl<T> Clone for EventSink<T> {
  fn clone(&self) -> Self {
    Self {
      tx: self.tx.clone(),
    }
  }
}
