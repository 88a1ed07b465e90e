//! Roster storage trait with SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use super::traits::{roster_key, RosterEntity};

/// Trait for roster storage backends.
///
/// Backends only implement a raw key-value surface; typed load/save are
/// provided on top of it and serialize rosters as JSON arrays.
pub trait RosterStore: Send + Sync {
  /// Get the raw stored bytes for a key.
  fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>>;

  /// Overwrite the value for a key.
  fn set_raw(&self, key: &str, data: &[u8], record_count: usize) -> Result<()>;

  /// Delete a key. Returns whether anything was stored.
  fn remove(&self, key: &str) -> Result<bool>;

  /// When the key was last written.
  fn cached_at(&self, key: &str) -> Result<Option<DateTime<Utc>>>;

  /// Load an owner's roster, empty if nothing has been cached yet.
  ///
  /// Duplicate ids keep their first occurrence.
  fn load<T: RosterEntity>(&self, owner: &str) -> Result<Vec<T>> {
    let key = roster_key::<T>(owner);
    let Some(data) = self.get_raw(&key)? else {
      return Ok(Vec::new());
    };

    let records: Vec<T> = serde_json::from_slice(&data)
      .map_err(|e| eyre!("Failed to deserialize roster {}: {}", key, e))?;

    let mut seen = HashSet::new();
    Ok(
      records
        .into_iter()
        .filter(|r| seen.insert(r.entity_id().to_string()))
        .collect(),
    )
  }

  /// Persist an owner's roster, replacing whatever was stored.
  fn save<T: RosterEntity>(&self, owner: &str, records: &[T]) -> Result<()> {
    let key = roster_key::<T>(owner);
    let data =
      serde_json::to_vec(records).map_err(|e| eyre!("Failed to serialize roster {}: {}", key, e))?;
    self.set_raw(&key, &data, records.len())
  }

  /// Drop an owner's roster.
  fn clear<T: RosterEntity>(&self, owner: &str) -> Result<bool> {
    self.remove(&roster_key::<T>(owner))
  }
}

/// In-memory storage. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStorage {
  entries: Mutex<HashMap<String, (Vec<u8>, DateTime<Utc>)>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl RosterStore for MemoryStorage {
  fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(entries.get(key).map(|(data, _)| data.clone()))
  }

  fn set_raw(&self, key: &str, data: &[u8], _record_count: usize) -> Result<()> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.insert(key.to_string(), (data.to_vec(), Utc::now()));
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<bool> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(entries.remove(key).is_some())
  }

  fn cached_at(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(entries.get(key).map(|(_, at)| *at))
  }
}

/// SQLite-based roster storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Create a new SQLite storage at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a throwaway database that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  fn default_path() -> Result<std::path::PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("zroster").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One serialized roster (JSON array) per <namespace>_<owner> key
CREATE TABLE IF NOT EXISTS roster_cache (
    cache_key TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    record_count INTEGER NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl RosterStore for SqliteStorage {
  fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row(
        "SELECT data FROM roster_cache WHERE cache_key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read roster {}: {}", key, e))
  }

  fn set_raw(&self, key: &str, data: &[u8], record_count: usize) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO roster_cache (cache_key, data, record_count, cached_at)
         VALUES (?, ?, ?, datetime('now'))",
        params![key, data, record_count],
      )
      .map_err(|e| eyre!("Failed to store roster {}: {}", key, e))?;

    Ok(())
  }

  fn remove(&self, key: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let deleted = conn
      .execute("DELETE FROM roster_cache WHERE cache_key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete roster {}: {}", key, e))?;

    Ok(deleted > 0)
  }

  fn cached_at(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let cached_at: Option<String> = conn
      .query_row(
        "SELECT cached_at FROM roster_cache WHERE cache_key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read roster timestamp {}: {}", key, e))?;

    cached_at.as_deref().map(parse_datetime).transpose()
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::{Deserialize, Serialize};

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Member {
    id: String,
    name: String,
  }

  impl RosterEntity for Member {
    fn entity_id(&self) -> &str {
      &self.id
    }

    fn namespace() -> &'static str {
      "members"
    }
  }

  fn member(id: &str, name: &str) -> Member {
    Member {
      id: id.to_string(),
      name: name.to_string(),
    }
  }

  #[test]
  fn test_sqlite_save_and_load() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let roster = vec![member("a", "Alice"), member("b", "Bob")];

    storage.save("owner1", &roster).unwrap();

    let loaded: Vec<Member> = storage.load("owner1").unwrap();
    assert_eq!(loaded, roster);
    assert!(storage.cached_at("members_owner1").unwrap().is_some());
  }

  #[test]
  fn test_sqlite_load_missing_is_empty() {
    let storage = SqliteStorage::open_in_memory().unwrap();

    let loaded: Vec<Member> = storage.load("nobody").unwrap();
    assert!(loaded.is_empty());
    assert!(storage.cached_at("members_nobody").unwrap().is_none());
  }

  #[test]
  fn test_sqlite_save_overwrites() {
    let storage = SqliteStorage::open_in_memory().unwrap();

    storage.save("owner1", &[member("a", "Alice")]).unwrap();
    storage.save("owner1", &[member("b", "Bob")]).unwrap();

    let loaded: Vec<Member> = storage.load("owner1").unwrap();
    assert_eq!(loaded, vec![member("b", "Bob")]);
  }

  #[test]
  fn test_owners_are_isolated() {
    let storage = SqliteStorage::open_in_memory().unwrap();

    storage.save("owner1", &[member("a", "Alice")]).unwrap();
    storage.save("owner2", &[member("b", "Bob")]).unwrap();

    let first: Vec<Member> = storage.load("owner1").unwrap();
    let second: Vec<Member> = storage.load("owner2").unwrap();
    assert_eq!(first, vec![member("a", "Alice")]);
    assert_eq!(second, vec![member("b", "Bob")]);
  }

  #[test]
  fn test_clear() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.save("owner1", &[member("a", "Alice")]).unwrap();

    assert!(storage.clear::<Member>("owner1").unwrap());
    assert!(!storage.clear::<Member>("owner1").unwrap());

    let loaded: Vec<Member> = storage.load("owner1").unwrap();
    assert!(loaded.is_empty());
  }

  #[test]
  fn test_load_drops_duplicate_ids() {
    let storage = MemoryStorage::new();
    let raw = serde_json::to_vec(&vec![
      member("a", "First"),
      member("b", "Bob"),
      member("a", "Second"),
    ])
    .unwrap();
    storage.set_raw("members_owner1", &raw, 3).unwrap();

    let loaded: Vec<Member> = storage.load("owner1").unwrap();
    assert_eq!(loaded, vec![member("a", "First"), member("b", "Bob")]);
  }

  #[test]
  fn test_corrupt_roster_is_an_error() {
    let storage = MemoryStorage::new();
    storage.set_raw("members_owner1", b"not json", 0).unwrap();

    let loaded: Result<Vec<Member>> = storage.load("owner1");
    assert!(loaded.is_err());
  }
}
