//! Bucket storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::{CachedResponse, RequestKey, StoredResponse};

/// Trait for cache storage backends.
///
/// Storage holds any number of named buckets, each mapping request keys to
/// responses. Implementations serialize access internally.
pub trait CacheStorage: Send + Sync {
  /// Create the bucket if it does not exist yet.
  fn open_bucket(&self, name: &str) -> Result<()>;

  /// Store all entries into a bucket in one transaction, creating the bucket
  /// if needed. Either every entry is stored or none is.
  fn put_all(&self, bucket: &str, entries: &[(RequestKey, StoredResponse)]) -> Result<()>;

  /// Look up a single request in a bucket.
  fn match_request(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Whether a batch store into the bucket has completed.
  ///
  /// A bucket that was only opened, or whose batch failed, is not complete.
  fn is_complete(&self, name: &str) -> Result<bool>;

  /// Names of all buckets, in creation order.
  fn keys(&self) -> Result<Vec<String>>;

  /// Delete a bucket and everything stored in it.
  ///
  /// Returns false if there was no such bucket.
  fn delete_bucket(&self, name: &str) -> Result<bool>;

  /// URLs stored in a bucket, in insertion order.
  fn entries(&self, bucket: &str) -> Result<Vec<String>>;
}

/// SQLite-based bucket storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open or create the storage database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a throwaway storage that lives only as long as this value.
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
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("conv-cache").join("cache.db"))
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
PRAGMA foreign_keys = ON;

-- One row per named bucket; complete is set once a batch store commits
CREATE TABLE IF NOT EXISTS buckets (
    name TEXT PRIMARY KEY,
    complete INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses (serialized JSON), keyed by request hash
CREATE TABLE IF NOT EXISTS entries (
    bucket TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    url TEXT NOT NULL,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (bucket, key_hash),
    FOREIGN KEY (bucket) REFERENCES buckets(name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_entries_bucket ON entries(bucket);
"#;

impl CacheStorage for SqliteStorage {
  fn open_bucket(&self, name: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO buckets (name, created_at) VALUES (?, datetime('now'))",
        params![name],
      )
      .map_err(|e| eyre!("Failed to open bucket {}: {}", name, e))?;

    Ok(())
  }

  fn put_all(&self, bucket: &str, entries: &[(RequestKey, StoredResponse)]) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO buckets (name, created_at) VALUES (?, datetime('now'))",
      params![bucket],
    )
    .map_err(|e| eyre!("Failed to open bucket {}: {}", bucket, e))?;

    for (key, response) in entries {
      let data =
        serde_json::to_vec(response).map_err(|e| eyre!("Failed to serialize response: {}", e))?;

      tx.execute(
        "INSERT OR REPLACE INTO entries (bucket, key_hash, url, data, cached_at)
         VALUES (?, ?, ?, ?, datetime('now'))",
        params![bucket, key.hash(), key.url(), data],
      )
      .map_err(|e| eyre!("Failed to store {} in bucket {}: {}", key.url(), bucket, e))?;
    }

    tx.execute(
      "UPDATE buckets SET complete = 1 WHERE name = ?",
      params![bucket],
    )
    .map_err(|e| eyre!("Failed to mark bucket {} complete: {}", bucket, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn match_request(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, cached_at FROM entries WHERE bucket = ? AND key_hash = ?",
        params![bucket, key.hash()],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {} in bucket {}: {}", key.url(), bucket, e))?;

    match row {
      Some((data, cached_at_str)) => {
        let response: StoredResponse = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize response: {}", e))?;
        let cached_at = parse_datetime(&cached_at_str)?;
        Ok(Some(CachedResponse {
          response,
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn is_complete(&self, name: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let complete: Option<bool> = conn
      .query_row(
        "SELECT complete FROM buckets WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read bucket {}: {}", name, e))?;

    Ok(complete.unwrap_or(false))
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM buckets ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to enumerate buckets: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read bucket name: {}", e))?;

    Ok(names)
  }

  fn delete_bucket(&self, name: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // Entries go with the bucket through the cascade
    let deleted = conn
      .execute("DELETE FROM buckets WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete bucket {}: {}", name, e))?;

    Ok(deleted > 0)
  }

  fn entries(&self, bucket: &str) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT url FROM entries WHERE bucket = ? ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let urls = stmt
      .query_map(params![bucket], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list bucket {}: {}", bucket, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read entry url: {}", e))?;

    Ok(urls)
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
  use url::Url;

  fn entry(url: &str, body: &str) -> (RequestKey, StoredResponse) {
    let parsed = Url::parse(url).unwrap();
    (
      RequestKey::for_url(&parsed),
      StoredResponse {
        url: url.to_string(),
        status: 200,
        headers: vec![("content-type".to_string(), "text/plain".to_string())],
        body: body.as_bytes().to_vec(),
      },
    )
  }

  #[test]
  fn test_put_and_match() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let (key, response) = entry("https://conv.test/", "index");
    storage
      .put_all("conv-1.0.0", &[(key.clone(), response.clone())])
      .unwrap();

    let cached = storage.match_request("conv-1.0.0", &key).unwrap().unwrap();
    assert_eq!(cached.response, response);

    // Same key, different bucket
    assert!(storage.match_request("conv-0.9.0", &key).unwrap().is_none());
  }

  #[test]
  fn test_keys_in_creation_order() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open_bucket("conv-0.9.0").unwrap();
    storage.open_bucket("conv-1.0.0").unwrap();
    storage.open_bucket("conv-0.9.0").unwrap();

    assert_eq!(storage.keys().unwrap(), vec!["conv-0.9.0", "conv-1.0.0"]);
    assert!(!storage.is_complete("conv-1.0.0").unwrap());
  }

  #[test]
  fn test_opened_bucket_is_not_complete() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open_bucket("conv-1.0.0").unwrap();
    assert!(!storage.is_complete("conv-1.0.0").unwrap());
    assert!(!storage.is_complete("conv-2.0.0").unwrap());

    storage.put_all("conv-1.0.0", &[]).unwrap();
    assert!(storage.is_complete("conv-1.0.0").unwrap());
  }

  #[test]
  fn test_delete_bucket_removes_entries() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let (key, response) = entry("https://conv.test/static/manifest.webmanifest", "{}");
    storage
      .put_all("conv-0.9.0", &[(key.clone(), response)])
      .unwrap();

    assert!(storage.delete_bucket("conv-0.9.0").unwrap());
    assert!(storage.keys().unwrap().is_empty());
    assert!(storage.match_request("conv-0.9.0", &key).unwrap().is_none());
    assert!(storage.entries("conv-0.9.0").unwrap().is_empty());
  }

  #[test]
  fn test_delete_missing_bucket_is_noop() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open_bucket("conv-1.0.0").unwrap();

    assert!(!storage.delete_bucket("conv-0.1.0").unwrap());
    assert_eq!(storage.keys().unwrap(), vec!["conv-1.0.0"]);
  }

  #[test]
  fn test_entries_listing() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .put_all(
        "conv-1.0.0",
        &[
          entry("https://conv.test/", "index"),
          entry("https://conv.test/static/manifest.webmanifest", "{}"),
        ],
      )
      .unwrap();

    assert_eq!(
      storage.entries("conv-1.0.0").unwrap(),
      vec![
        "https://conv.test/",
        "https://conv.test/static/manifest.webmanifest"
      ]
    );
  }

  #[test]
  fn test_put_replaces_existing_entry() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let first = entry("https://conv.test/", "old");
    let second = entry("https://conv.test/", "new");
    storage.put_all("conv-1.0.0", &[first]).unwrap();
    storage.put_all("conv-1.0.0", &[second.clone()]).unwrap();

    let cached = storage
      .match_request("conv-1.0.0", &second.0)
      .unwrap()
      .unwrap();
    assert_eq!(cached.response.body, b"new");
    assert_eq!(storage.entries("conv-1.0.0").unwrap().len(), 1);
  }
}
