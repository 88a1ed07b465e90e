pub mod api_types;
pub mod cache;
pub mod client;
pub mod error;
pub mod synced_client;
pub mod types;

pub use synced_client::{is_session_expired, SyncedZaloClient};
pub use types::{Friend, Group, Session};
