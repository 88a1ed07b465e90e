//! Reconciliation of a cached roster against the remote set of valid ids.

use color_eyre::{eyre::eyre, Result};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::storage::RosterStore;
use super::traits::{roster_key, ActiveFlag, RosterEntity};
use crate::event::{EventSink, SyncEvent};

/// Tuning knobs for a reconciliation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileConfig {
  /// Maximum ids per detail request
  pub batch_size: usize,
  /// Pause between consecutive detail requests
  pub batch_delay: Duration,
  /// Caches larger than this never trust an empty id listing
  pub spurious_empty_threshold: usize,
  /// If set, also distrust listings smaller than this fraction of the cache
  pub min_trusted_fraction: Option<f64>,
}

impl Default for ReconcileConfig {
  fn default() -> Self {
    Self {
      batch_size: 5,
      batch_delay: Duration::from_millis(1500),
      spurious_empty_threshold: 5,
      min_trusted_fraction: None,
    }
  }
}

/// Difference between the cached roster and a trusted id listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterDelta {
  /// Cached ids missing from the listing, in cache order
  pub removed: Vec<String>,
  /// Listed ids not in the cache, in listing order
  pub new_ids: Vec<String>,
  /// Listed ids already cached, in listing order
  pub existing_ids: Vec<String>,
}

/// Compute which cached records are gone and which ids need fetching.
pub fn diff_ids<T: RosterEntity>(cached: &[T], ids: &[String]) -> RosterDelta {
  let cached_ids: HashSet<&str> = cached.iter().map(|r| r.entity_id()).collect();
  let valid: HashSet<&str> = ids.iter().map(String::as_str).collect();

  let removed = cached
    .iter()
    .map(|r| r.entity_id())
    .filter(|id| !valid.contains(id))
    .map(String::from)
    .collect();

  let mut seen = HashSet::new();
  let mut new_ids = Vec::new();
  let mut existing_ids = Vec::new();
  for id in ids {
    if !seen.insert(id.as_str()) {
      continue;
    }
    if cached_ids.contains(id.as_str()) {
      existing_ids.push(id.clone());
    } else {
      new_ids.push(id.clone());
    }
  }

  RosterDelta {
    removed,
    new_ids,
    existing_ids,
  }
}

/// Upsert records by id: replace in place if present, append otherwise.
pub fn merge_records<T: RosterEntity>(roster: &mut Vec<T>, records: Vec<T>) {
  let mut positions: HashMap<String, usize> = roster
    .iter()
    .enumerate()
    .map(|(i, r)| (r.entity_id().to_string(), i))
    .collect();

  for record in records {
    match positions.get(record.entity_id()) {
      Some(&i) => roster[i] = record,
      None => {
        positions.insert(record.entity_id().to_string(), roster.len());
        roster.push(record);
      }
    }
  }
}

/// Why a pass stopped before touching the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
  /// The id listing call failed
  ListingFailed,
  /// The id listing was empty or too small to trust against the cache
  SuspiciousIdSet,
}

/// Counters for a pass that got past the listing step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
  pub removed: usize,
  pub new_ids: usize,
  pub refreshed: usize,
  pub batches_merged: usize,
  pub batches_failed: usize,
  /// The consumer went away before every batch was processed
  pub cancelled: bool,
}

/// How a pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
  Aborted(AbortReason),
  Completed(ReconcileReport),
}

/// Roster after a pass, including the outcome of the pass.
#[derive(Debug, Clone)]
pub struct ReconcileResult<T> {
  /// The roster as persisted at the end of the pass
  pub roster: Vec<T>,
  pub outcome: ReconcileOutcome,
}

impl<T> ReconcileResult<T> {
  fn aborted(roster: Vec<T>, reason: AbortReason) -> Self {
    Self {
      roster,
      outcome: ReconcileOutcome::Aborted(reason),
    }
  }
}

/// Keeps persisted rosters in step with a remote source.
///
/// Passes for the same `<namespace>_<owner>` key are serialized; passes for
/// different keys may run concurrently. Lock entries nobody holds or waits
/// on are dropped the next time a lock is taken.
pub struct Reconciler<S: RosterStore> {
  storage: Arc<S>,
  config: ReconcileConfig,
  locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl<S: RosterStore> Reconciler<S> {
  /// Create a new reconciler with the given storage backend.
  pub fn new(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
      config: ReconcileConfig::default(),
      locks: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  /// Replace the tuning configuration.
  pub fn with_config(mut self, config: ReconcileConfig) -> Self {
    self.config = config;
    self
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  /// Cached roster for an owner, without any network access.
  pub fn cached<T: RosterEntity>(&self, owner: &str) -> Result<Vec<T>> {
    self.storage.load(owner)
  }

  /// Whether an id listing of `listed` entries should be ignored given a
  /// cache of `cached` entries.
  fn is_suspicious(&self, cached: usize, listed: usize) -> bool {
    if cached <= self.config.spurious_empty_threshold {
      return false;
    }
    if listed == 0 {
      return true;
    }
    match self.config.min_trusted_fraction {
      Some(fraction) => (listed as f64) < (cached as f64) * fraction,
      None => false,
    }
  }

  /// Take the per-key pass lock. The flag is true if another pass held it.
  async fn lock_key(&self, key: &str) -> Result<(OwnedMutexGuard<()>, bool)> {
    let lock = {
      let mut locks = self
        .locks
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      locks.retain(|k, entry| k == key || Arc::strong_count(entry) > 1);
      Arc::clone(locks.entry(key.to_string()).or_default())
    };
    match Arc::clone(&lock).try_lock_owned() {
      Ok(guard) => Ok((guard, false)),
      Err(_) => Ok((lock.lock_owned().await, true)),
    }
  }

  /// Run one reconciliation pass for `owner`.
  ///
  /// 1. Load the cached roster and emit it right away, even if another pass
  ///    on the same roster is still running
  /// 2. Fetch the valid id listing once; abort untouched on failure or if
  ///    the listing looks spurious
  /// 3. Drop cached records missing from the listing and persist
  /// 4. Fetch details for new ids, then existing ids, in delayed batches,
  ///    persisting after every merged batch
  ///
  /// `active` is checked before each batch and after each detail call.
  /// Batch failures are logged and skipped; only storage errors fail the pass.
  pub async fn reconcile<T, FI, FutI, FB, FutB>(
    &self,
    owner: &str,
    active: &ActiveFlag,
    events: &EventSink<T>,
    fetch_valid_ids: FI,
    mut fetch_detail_batch: FB,
  ) -> Result<ReconcileResult<T>>
  where
    T: RosterEntity,
    FI: FnOnce() -> FutI,
    FutI: Future<Output = Result<Vec<String>>>,
    FB: FnMut(Vec<String>) -> FutB,
    FutB: Future<Output = Result<Vec<T>>>,
  {
    let key = roster_key::<T>(owner);
    let mut roster: Vec<T> = self.storage.load(owner)?;
    events.send(SyncEvent::Cached(roster.clone()));

    let (_guard, waited) = self.lock_key(&key).await?;
    if waited {
      // The pass we waited for may have rewritten the roster
      roster = self.storage.load(owner)?;
      events.send(SyncEvent::Cached(roster.clone()));
    }

    let ids = match fetch_valid_ids().await {
      Ok(ids) => ids,
      Err(e) => {
        warn!(%key, error = %e, "Listing valid ids failed, keeping cached roster");
        return Ok(ReconcileResult::aborted(roster, AbortReason::ListingFailed));
      }
    };

    if self.is_suspicious(roster.len(), ids.len()) {
      warn!(
        %key,
        cached = roster.len(),
        listed = ids.len(),
        "Ignoring suspicious id listing, keeping cached roster"
      );
      return Ok(ReconcileResult::aborted(
        roster,
        AbortReason::SuspiciousIdSet,
      ));
    }

    let delta = diff_ids(&roster, &ids);
    let mut report = ReconcileReport {
      removed: delta.removed.len(),
      new_ids: delta.new_ids.len(),
      refreshed: delta.existing_ids.len(),
      ..Default::default()
    };

    if !delta.removed.is_empty() {
      let removed: HashSet<&str> = delta.removed.iter().map(String::as_str).collect();
      roster.retain(|r| !removed.contains(r.entity_id()));
      self.storage.save(owner, &roster)?;
      info!(%key, removed = delta.removed.len(), "Pruned roster");
      events.send(SyncEvent::Pruned {
        removed: delta.removed.clone(),
        roster: roster.clone(),
      });
    }

    let valid: HashSet<&str> = ids.iter().map(String::as_str).collect();
    let queue: Vec<String> = delta
      .new_ids
      .into_iter()
      .chain(delta.existing_ids)
      .collect();
    let batches: Vec<Vec<String>> = queue
      .chunks(self.config.batch_size.max(1))
      .map(<[String]>::to_vec)
      .collect();
    let total = batches.len();

    for (index, batch) in batches.into_iter().enumerate() {
      let number = index + 1;
      if !active.is_active() {
        debug!(%key, batch = number, total, "Consumer inactive, stopping pass");
        report.cancelled = true;
        break;
      }

      let result = fetch_detail_batch(batch).await;
      if !active.is_active() {
        debug!(%key, batch = number, total, "Consumer went away mid-batch, discarding result");
        report.cancelled = true;
        break;
      }

      match result {
        Ok(records) => {
          let records: Vec<T> = records
            .into_iter()
            .filter(|r| valid.contains(r.entity_id()))
            .collect();
          merge_records(&mut roster, records);
          self.storage.save(owner, &roster)?;
          report.batches_merged += 1;
          events.send(SyncEvent::BatchMerged {
            batch: number,
            total,
            roster: roster.clone(),
          });
        }
        Err(e) => {
          warn!(%key, batch = number, total, error = %e, "Detail batch failed, skipping");
          report.batches_failed += 1;
          events.send(SyncEvent::BatchFailed {
            batch: number,
            total,
            error: e.to_string(),
          });
        }
      }

      if number < total {
        tokio::time::sleep(self.config.batch_delay).await;
      }
    }

    info!(
      %key,
      removed = report.removed,
      new = report.new_ids,
      refreshed = report.refreshed,
      merged = report.batches_merged,
      failed = report.batches_failed,
      cancelled = report.cancelled,
      "Reconciliation pass finished"
    );

    Ok(ReconcileResult {
      roster,
      outcome: ReconcileOutcome::Completed(report),
    })
  }
}

impl<S: RosterStore> Clone for Reconciler<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      config: self.config.clone(),
      locks: Arc::clone(&self.locks),
    }
  }
}
