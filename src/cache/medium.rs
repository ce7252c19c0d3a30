//! Durable key-value medium backing the persistent store.
//!
//! The medium is a synchronous string store with finite capacity. Writes may
//! fail with `StorageError::CapacityExceeded`; the store reacts by evicting its
//! oldest entries and retrying once before degrading to in-memory-only.

use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::StorageError;

/// Synchronous key-value store with a finite capacity.
///
/// Exactly one `PersistentStore` may own a given medium key; two stores pointed
/// at the same key race at the medium level (last writer wins).
pub trait DurableMedium: Send + Sync {
  fn read(&self, key: &str) -> Result<Option<String>, StorageError>;
  fn write(&self, key: &str, value: &str) -> Result<(), StorageError>;
  fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// SQLite-backed medium.
pub struct SqliteMedium {
  conn: Mutex<Connection>,
  /// Per-value byte quota enforced before the insert, if configured.
  max_value_bytes: Option<usize>,
}

/// Schema for the medium table.
const MEDIUM_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl SqliteMedium {
  /// Open the medium at the default platform data path.
  pub fn open(max_value_bytes: Option<usize>) -> Result<Self, StorageError> {
    Self::open_at(&Self::default_path()?, max_value_bytes)
  }

  /// Open the medium at an explicit path.
  pub fn open_at(
    path: &std::path::Path,
    max_value_bytes: Option<usize>,
  ) -> Result<Self, StorageError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| StorageError::Io(format!("failed to create cache directory: {}", e)))?;
    }

    let conn = Connection::open(&path).map_err(|e| {
      StorageError::Io(format!(
        "failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::from_connection(conn, max_value_bytes)
  }

  /// Open an in-memory database. Used by tests.
  pub fn open_in_memory(max_value_bytes: Option<usize>) -> Result<Self, StorageError> {
    let conn = Connection::open_in_memory()
      .map_err(|e| StorageError::Io(format!("failed to open in-memory database: {}", e)))?;
    Self::from_connection(conn, max_value_bytes)
  }

  fn from_connection(
    conn: Connection,
    max_value_bytes: Option<usize>,
  ) -> Result<Self, StorageError> {
    conn
      .execute_batch(MEDIUM_SCHEMA)
      .map_err(|e| StorageError::Io(format!("failed to run medium migrations: {}", e)))?;

    Ok(Self {
      conn: Mutex::new(conn),
      max_value_bytes,
    })
  }

  fn default_path() -> Result<std::path::PathBuf, StorageError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| StorageError::Io("could not determine data directory".into()))?;

    Ok(data_dir.join("fleetdeck").join("cache.db"))
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StorageError> {
    self.conn.lock().map_err(|_| StorageError::LockPoisoned)
  }
}

impl DurableMedium for SqliteMedium {
  fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT value FROM kv_store WHERE key = ?")
      .map_err(|e| StorageError::Io(format!("failed to prepare read: {}", e)))?;

    let value: Option<String> = stmt.query_row(params![key], |row| row.get(0)).ok();
    Ok(value)
  }

  fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
    if let Some(quota) = self.max_value_bytes {
      if value.len() > quota {
        return Err(StorageError::CapacityExceeded(format!(
          "{} bytes exceeds quota of {}",
          value.len(),
          quota
        )));
      }
    }

    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value, stored_at) VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(map_write_error)?;

    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), StorageError> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM kv_store WHERE key = ?", params![key])
      .map_err(|e| StorageError::Io(format!("failed to remove entry: {}", e)))?;

    Ok(())
  }
}

/// SQLITE_FULL surfaces as a capacity condition so the store can evict.
fn map_write_error(e: rusqlite::Error) -> StorageError {
  if let rusqlite::Error::SqliteFailure(err, _) = &e {
    if err.code == rusqlite::ErrorCode::DiskFull {
      return StorageError::CapacityExceeded(e.to_string());
    }
  }
  StorageError::Io(format!("failed to write entry: {}", e))
}

/// In-memory medium with an optional byte quota.
///
/// Stands in for the durable medium in tests and when persistence is disabled;
/// contents last only for the process lifetime.
pub struct MemoryMedium {
  entries: Mutex<HashMap<String, String>>,
  max_total_bytes: Option<usize>,
}

impl MemoryMedium {
  pub fn new(max_total_bytes: Option<usize>) -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      max_total_bytes,
    }
  }
}

impl DurableMedium for MemoryMedium {
  fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
    let entries = self.entries.lock().map_err(|_| StorageError::LockPoisoned)?;
    Ok(entries.get(key).cloned())
  }

  fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
    let mut entries = self.entries.lock().map_err(|_| StorageError::LockPoisoned)?;

    if let Some(quota) = self.max_total_bytes {
      let other_bytes: usize = entries
        .iter()
        .filter(|(k, _)| k.as_str() != key)
        .map(|(k, v)| k.len() + v.len())
        .sum();
      if other_bytes + key.len() + value.len() > quota {
        return Err(StorageError::CapacityExceeded(format!(
          "write of {} bytes exceeds quota of {}",
          key.len() + value.len(),
          quota
        )));
      }
    }

    entries.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), StorageError> {
    let mut entries = self.entries.lock().map_err(|_| StorageError::LockPoisoned)?;
    entries.remove(key);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sqlite_round_trip_and_remove() {
    let medium = SqliteMedium::open_in_memory(None).unwrap();

    assert_eq!(medium.read("snapshot").unwrap(), None);
    medium.write("snapshot", "[1,2,3]").unwrap();
    assert_eq!(medium.read("snapshot").unwrap(), Some("[1,2,3]".into()));

    medium.write("snapshot", "[4]").unwrap();
    assert_eq!(medium.read("snapshot").unwrap(), Some("[4]".into()));

    medium.remove("snapshot").unwrap();
    assert_eq!(medium.read("snapshot").unwrap(), None);
  }

  #[test]
  fn sqlite_quota_raises_capacity_exceeded() {
    let medium = SqliteMedium::open_in_memory(Some(8)).unwrap();

    medium.write("k", "short").unwrap();
    let err = medium.write("k", "longer than eight").unwrap_err();
    assert!(err.is_capacity_exceeded());
  }

  #[test]
  fn memory_quota_counts_total_bytes() {
    let medium = MemoryMedium::new(Some(10));

    medium.write("a", "12345").unwrap();
    let err = medium.write("b", "123456789").unwrap_err();
    assert!(err.is_capacity_exceeded());

    // Replacing the existing key does not double-count its old value.
    medium.write("a", "123456789").unwrap();
  }
}
