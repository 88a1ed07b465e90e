//! Core traits and types for roster caching.

use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Trait for entities that live in a cached roster.
///
/// Everything beyond the id is opaque to the reconciler; it is only
/// serialized and handed back to the caller.
pub trait RosterEntity: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Stable external identifier (e.g., group id, friend user id)
  fn entity_id(&self) -> &str;

  /// Roster namespace used to build storage keys (e.g., "groups")
  fn namespace() -> &'static str;
}

/// Build the storage key for one owner's roster: `<namespace>_<owner>`.
pub fn roster_key<T: RosterEntity>(owner: &str) -> String {
  format!("{}_{}", T::namespace(), owner)
}

/// Cooperative "is the consumer still interested" flag.
///
/// Cloned handles share the same state. Flipping it stops a pass before
/// the next batch is dispatched; in-flight calls are not interrupted.
#[derive(Debug, Clone)]
pub struct ActiveFlag {
  flag: Arc<AtomicBool>,
  parent: Option<Box<ActiveFlag>>,
}

impl ActiveFlag {
  pub fn new() -> Self {
    Self {
      flag: Arc::new(AtomicBool::new(true)),
      parent: None,
    }
  }

  /// A flag that goes inactive with `self`, but can also be deactivated
  /// on its own without affecting `self`.
  pub fn child(&self) -> Self {
    Self {
      flag: Arc::new(AtomicBool::new(true)),
      parent: Some(Box::new(self.clone())),
    }
  }

  pub fn is_active(&self) -> bool {
    self.flag.load(Ordering::SeqCst) && self.parent.as_ref().map_or(true, |p| p.is_active())
  }

  /// Mark the consumer as gone.
  pub fn deactivate(&self) {
    self.flag.store(false, Ordering::SeqCst);
  }
}

impl Default for ActiveFlag {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::Deserialize;

  #[derive(Debug, Clone, Serialize, Deserialize)]
  struct Thing {
    id: String,
  }

  impl RosterEntity for Thing {
    fn entity_id(&self) -> &str {
      &self.id
    }

    fn namespace() -> &'static str {
      "things"
    }
  }

  #[test]
  fn test_roster_key() {
    assert_eq!(roster_key::<Thing>("8490"), "things_8490");
  }

  #[test]
  fn test_active_flag_shared_between_clones() {
    let flag = ActiveFlag::new();
    let handle = flag.clone();
    assert!(flag.is_active());

    handle.deactivate();
    assert!(!flag.is_active());
  }

  #[test]
  fn test_child_flag_follows_parent_only_downward() {
    let parent = ActiveFlag::new();
    let child = parent.child();

    child.deactivate();
    assert!(!child.is_active());
    assert!(parent.is_active());

    let other = parent.child();
    parent.deactivate();
    assert!(!other.is_active());
  }
}
