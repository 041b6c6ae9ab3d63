//! Durable key-value store for consolidated-profile snapshots.

use rusqlite::{params, Connection};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::error::SyncError;

/// Durable local key-value store.
pub trait SnapshotStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<Value>, SyncError>;
  fn set(&self, key: &str, value: &Value) -> Result<(), SyncError>;
  fn remove(&self, key: &str) -> Result<(), SyncError>;
}

/// In-memory store for tests and cache-less deployments.
#[derive(Default)]
pub struct MemoryStore {
  entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl SnapshotStore for MemoryStore {
  fn get(&self, key: &str) -> Result<Option<Value>, SyncError> {
    let entries = self
      .entries
      .lock()
      .map_err(|e| SyncError::Storage(format!("lock poisoned: {}", e)))?;
    Ok(entries.get(key).cloned())
  }

  fn set(&self, key: &str, value: &Value) -> Result<(), SyncError> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| SyncError::Storage(format!("lock poisoned: {}", e)))?;
    entries.insert(key.to_string(), value.clone());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), SyncError> {
    let mut entries = self
      .entries
      .lock()
      .map_err(|e| SyncError::Storage(format!("lock poisoned: {}", e)))?;
    entries.remove(key);
    Ok(())
  }
}

/// SQLite-backed store so snapshots survive process restarts.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

/// Schema for the snapshot table.
const SNAPSHOT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    key TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open() -> Result<Self, SyncError> {
    let path = Self::default_path()?;

    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| SyncError::Storage(format!("failed to create data directory: {}", e)))?;
    }

    let conn = Connection::open(&path).map_err(|e| {
      SyncError::Storage(format!(
        "failed to open snapshot database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn)
  }

  /// Open the store at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self, SyncError> {
    let conn = Connection::open(path).map_err(|e| {
      SyncError::Storage(format!(
        "failed to open snapshot database at {}: {}",
        path.display(),
        e
      ))
    })?;
    Self::with_connection(conn)
  }

  /// In-memory SQLite database, useful in tests.
  pub fn in_memory() -> Result<Self, SyncError> {
    let conn = Connection::open_in_memory()
      .map_err(|e| SyncError::Storage(format!("failed to open in-memory database: {}", e)))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self, SyncError> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  fn default_path() -> Result<std::path::PathBuf, SyncError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| SyncError::Storage("could not determine data directory".into()))?;

    Ok(data_dir.join("edusync").join("snapshots.db"))
  }

  fn run_migrations(&self) -> Result<(), SyncError> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| SyncError::Storage(format!("lock poisoned: {}", e)))?;

    conn
      .execute_batch(SNAPSHOT_SCHEMA)
      .map_err(|e| SyncError::Storage(format!("failed to run migrations: {}", e)))?;

    Ok(())
  }
}

impl SnapshotStore for SqliteStore {
  fn get(&self, key: &str) -> Result<Option<Value>, SyncError> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| SyncError::Storage(format!("lock poisoned: {}", e)))?;

    let mut stmt = conn
      .prepare("SELECT data FROM snapshots WHERE key = ?")
      .map_err(|e| SyncError::Storage(format!("failed to prepare query: {}", e)))?;

    let data: Option<Vec<u8>> = stmt.query_row(params![key], |row| row.get(0)).ok();

    match data {
      Some(bytes) => {
        let value = serde_json::from_slice(&bytes)
          .map_err(|e| SyncError::Storage(format!("failed to deserialize snapshot: {}", e)))?;
        Ok(Some(value))
      }
      None => Ok(None),
    }
  }

  fn set(&self, key: &str, value: &Value) -> Result<(), SyncError> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| SyncError::Storage(format!("lock poisoned: {}", e)))?;

    let data = serde_json::to_vec(value)
      .map_err(|e| SyncError::Storage(format!("failed to serialize snapshot: {}", e)))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO snapshots (key, data, stored_at) VALUES (?, ?, datetime('now'))",
        params![key, data],
      )
      .map_err(|e| SyncError::Storage(format!("failed to store snapshot: {}", e)))?;

    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), SyncError> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| SyncError::Storage(format!("lock poisoned: {}", e)))?;

    conn
      .execute("DELETE FROM snapshots WHERE key = ?", params![key])
      .map_err(|e| SyncError::Storage(format!("failed to remove snapshot: {}", e)))?;

    Ok(())
  }
}
