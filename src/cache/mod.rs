//! Roster caching and reconciliation.
//!
//! This module is agnostic of what a roster holds:
//! - Persists one ordered roster per `<namespace>_<owner>` key
//! - Reconciles a roster against a cheap remote id listing plus batched
//!   detail fetches
//! - Refuses to wipe a healthy cache when the listing comes back
//!   suspiciously empty

mod reconcile;
mod storage;
mod traits;

pub use reconcile::{AbortReason, ReconcileConfig, ReconcileOutcome, ReconcileResult, Reconciler};
pub use storage::{MemoryStorage, RosterStore, SqliteStorage};
pub use traits::{roster_key, ActiveFlag, RosterEntity};
