//! Core types returned by the cache stores.

use chrono::{DateTime, Utc};
use std::fmt;

use crate::http::Response;

/// A response read back from a cache store.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  /// When the response was written
  pub cached_at: DateTime<Utc>,
}

/// Listing row for one stored request.
#[derive(Debug, Clone)]
pub struct CacheEntryInfo {
  pub method: String,
  pub url: String,
  pub status: u16,
  pub body_len: usize,
  pub response_type: String,
  pub cached_at: DateTime<Utc>,
}

/// Listing row for one cache store.
#[derive(Debug, Clone)]
pub struct StoreSummary {
  pub name: String,
  pub entries: usize,
  pub created_at: DateTime<Utc>,
}

/// Result from an intercepted fetch, including where the response came from.
#[derive(Debug, Clone)]
pub struct FetchResult {
  pub response: Response,
  pub source: CacheSource,
}

impl FetchResult {
  pub fn new(response: Response, source: CacheSource) -> Self {
    Self { response, source }
  }
}

/// Indicates how an intercepted fetch was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Served from the cache store, network untouched
  Hit,
  /// Fetched from the network and written to the store
  Refill,
  /// Fetched from the network and not stored
  Network,
}

impl CacheSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Hit => "hit",
      Self::Refill => "refill",
      Self::Network => "network",
    }
  }
}

impl fmt::Display for CacheSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}
