use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::AccountConfig;

/// Session credentials sent with every backend call
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
  pub own_id: String,
  pub cookie: String,
  pub imei: String,
  pub user_agent: String,
}

impl Session {
  pub fn from_account(account: &AccountConfig, cookie: String) -> Self {
    Self {
      own_id: account.id.clone(),
      cookie,
      imei: account.imei.clone(),
      user_agent: account.user_agent.clone(),
    }
  }
}

/// A group the account belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
  pub id: String,
  #[serde(default)]
  pub name: String,
  pub avatar: Option<String>,
  #[serde(default)]
  pub total_member: u64,
  /// The account created the group
  #[serde(default)]
  pub is_creator: bool,
  /// The account is one of the group admins
  #[serde(default)]
  pub is_admin: bool,
}

/// A friend of the account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Friend {
  pub user_id: String,
  #[serde(default)]
  pub display_name: String,
  pub zalo_name: Option<String>,
  pub avatar: Option<String>,
  pub phone_number: Option<String>,
}

impl fmt::Display for Group {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}  {}  ({} members)", self.id, self.name, self.total_member)?;
    if self.is_creator {
      write!(f, " [creator]")
    } else if self.is_admin {
      write!(f, " [admin]")
    } else {
      Ok(())
    }
  }
}

impl fmt::Display for Friend {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}  {}", self.user_id, self.display_name)?;
    if let Some(phone) = &self.phone_number {
      write!(f, "  {}", phone)?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_group_display() {
    let group = Group {
      id: "g1".into(),
      name: "Sellers".into(),
      avatar: None,
      total_member: 42,
      is_creator: false,
      is_admin: true,
    };
    assert_eq!(group.to_string(), "g1  Sellers  (42 members) [admin]");
  }

  #[test]
  fn test_friend_deserialize_and_display() {
    let friend: Friend =
      serde_json::from_str(r#"{"userId": "u1", "displayName": "Lan", "phoneNumber": "0901"}"#)
        .unwrap();
    assert_eq!(friend.to_string(), "u1  Lan  0901");
    assert!(friend.zalo_name.is_none());
  }
}
