//! Cache storage trait and SQLite implementation.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::StatusCode;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use url::Url;

use super::traits::{CacheEntryInfo, CachedResponse, StoreSummary};
use crate::db::Database;
use crate::http::{headers_from_pairs, headers_to_pairs, RequestKey, Response, ResponseType};

/// Trait for cache storage backends.
///
/// A backend holds every named cache store of one application.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the named store if it does not exist yet.
  fn open(&self, cache_name: &str) -> Result<()>;

  /// Whether the named store exists.
  fn has(&self, cache_name: &str) -> Result<bool>;

  /// Names of all stores, oldest first.
  fn keys(&self) -> Result<Vec<String>>;

  /// Delete a store and everything in it. Returns false if it did not exist.
  fn delete(&self, cache_name: &str) -> Result<bool>;

  /// Look up the response stored for a request.
  fn match_request(&self, cache_name: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Store a response, replacing any previous one for the same request.
  /// Fails if the store does not exist, so a deleted store stays deleted.
  fn put(&self, cache_name: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Store several responses in one transaction, creating the store if needed.
  fn put_all(&self, cache_name: &str, entries: &[(RequestKey, Response)]) -> Result<()>;

  /// List the requests stored in a store.
  fn entries(&self, cache_name: &str) -> Result<Vec<CacheEntryInfo>>;

  /// List every store with its entry count.
  fn summaries(&self) -> Result<Vec<StoreSummary>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the storage database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    Ok(Self::from_database(Database::open(path)?))
  }

  /// Storage that only lives in memory.
  pub fn in_memory() -> Result<Self> {
    Ok(Self::from_database(Database::open_in_memory()?))
  }

  pub fn from_database(db: Database) -> Self {
    Self {
      conn: Mutex::new(db.into_connection()),
    }
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

fn ensure_store(conn: &Connection, cache_name: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_stores (name) VALUES (?)",
      params![cache_name],
    )
    .map_err(|e| eyre!("Failed to open cache store {}: {}", cache_name, e))?;
  Ok(())
}

fn store_exists(conn: &Connection, cache_name: &str) -> Result<bool> {
  let found: Option<i64> = conn
    .query_row(
      "SELECT 1 FROM cache_stores WHERE name = ?",
      params![cache_name],
      |row| row.get(0),
    )
    .optional()
    .map_err(|e| eyre!("Failed to query cache stores: {}", e))?;
  Ok(found.is_some())
}

fn insert_entry(
  conn: &Connection,
  cache_name: &str,
  key: &RequestKey,
  response: &Response,
) -> Result<()> {
  let headers = serde_json::to_string(&headers_to_pairs(&response.headers))
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (cache_name, request_key, method, url, status, headers, body, response_type, redirected, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        cache_name,
        key.cache_hash(),
        key.method().as_str(),
        key.url().as_str(),
        response.status.as_u16(),
        headers,
        &response.body[..],
        response.response_type.as_str(),
        response.redirected,
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", key, e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open(&self, cache_name: &str) -> Result<()> {
    let conn = self.lock()?;
    ensure_store(&conn, cache_name)
  }

  fn has(&self, cache_name: &str) -> Result<bool> {
    let conn = self.lock()?;
    store_exists(&conn, cache_name)
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_stores ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache store name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, cache_name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE cache_name = ?",
      params![cache_name],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", cache_name, e))?;
    let removed = tx
      .execute(
        "DELETE FROM cache_stores WHERE name = ?",
        params![cache_name],
      )
      .map_err(|e| eyre!("Failed to delete cache store {}: {}", cache_name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn match_request(&self, cache_name: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;

    let row = conn
      .query_row(
        "SELECT url, status, headers, body, response_type, redirected, cached_at
         FROM cache_entries
         WHERE cache_name = ? AND request_key = ?",
        params![cache_name, key.cache_hash()],
        |row| {
          Ok((
            row.get::<_, String>(0)?,
            row.get::<_, u16>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Vec<u8>>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, bool>(5)?,
            row.get::<_, String>(6)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key, e))?;

    let Some((url, status, headers, body, response_type, redirected, cached_at)) = row else {
      return Ok(None);
    };

    let pairs: Vec<(String, Vec<u8>)> = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers of {}: {}", key, e))?;

    let response = Response {
      url: Url::parse(&url).map_err(|e| eyre!("Invalid stored URL '{}': {}", url, e))?,
      status: StatusCode::from_u16(status)
        .map_err(|e| eyre!("Invalid stored status {}: {}", status, e))?,
      headers: headers_from_pairs(pairs),
      body: Bytes::from(body),
      response_type: ResponseType::parse(&response_type)?,
      redirected,
    };

    Ok(Some(CachedResponse {
      response,
      cached_at: parse_datetime(&cached_at)?,
    }))
  }

  fn put(&self, cache_name: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    if !store_exists(&tx, cache_name)? {
      return Err(eyre!("Cache store {} does not exist", cache_name));
    }
    insert_entry(&tx, cache_name, key, response)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn put_all(&self, cache_name: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_store(&tx, cache_name)?;
    for (key, response) in entries {
      insert_entry(&tx, cache_name, key, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn entries(&self, cache_name: &str) -> Result<Vec<CacheEntryInfo>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT method, url, status, length(body), response_type, cached_at
         FROM cache_entries
         WHERE cache_name = ?
         ORDER BY url",
      )
      .map_err(|e| eyre!("Failed to prepare entry query: {}", e))?;

    let rows = stmt
      .query_map(params![cache_name], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, u16>(2)?,
          row.get::<_, i64>(3)?,
          row.get::<_, String>(4)?,
          row.get::<_, String>(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query entries: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry: {}", e))?;

    rows
      .into_iter()
      .map(
        |(method, url, status, body_len, response_type, cached_at)| {
          Ok(CacheEntryInfo {
            method,
            url,
            status,
            body_len: usize::try_from(body_len).unwrap_or_default(),
            response_type,
            cached_at: parse_datetime(&cached_at)?,
          })
        },
      )
      .collect()
  }

  fn summaries(&self) -> Result<Vec<StoreSummary>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT s.name, s.created_at, COUNT(e.request_key)
         FROM cache_stores s
         LEFT JOIN cache_entries e ON e.cache_name = s.name
         GROUP BY s.name
         ORDER BY s.rowid",
      )
      .map_err(|e| eyre!("Failed to prepare store query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, i64>(2)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query stores: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read store: {}", e))?;

    rows
      .into_iter()
      .map(|(name, created_at, entries)| {
        Ok(StoreSummary {
          name,
          entries: usize::try_from(entries).unwrap_or_default(),
          created_at: parse_datetime(&created_at)?,
        })
      })
      .collect()
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
