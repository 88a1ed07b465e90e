//! Roster caching implementations for Zalo types.

use crate::cache::RosterEntity;

use super::types::{Friend, Group};

impl RosterEntity for Group {
  fn entity_id(&self) -> &str {
    &self.id
  }

  fn namespace() -> &'static str {
    "groups"
  }
}

impl RosterEntity for Friend {
  fn entity_id(&self) -> &str {
    &self.user_id
  }

  fn namespace() -> &'static str {
    "friends"
  }
}
