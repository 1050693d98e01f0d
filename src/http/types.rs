//! Request and response model shared by the cache and the network client.

use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

/// Headers that only make sense for a single connection and are never
/// forwarded or stored.
const HOP_BY_HOP: &[&str] = &[
  "connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
  "host",
];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
  HOP_BY_HOP.contains(&name.as_str())
}

/// Map a client-side path onto the upstream origin.
///
/// Paths are taken relative to the origin's base path, so an upstream of
/// `http://host/app/` serves `/index.html` from `http://host/app/index.html`.
pub fn upstream_url(origin: &Url, path: &str) -> Result<Url> {
  // "./" keeps segments like "http:" from being read as a scheme
  origin
    .join(&format!("./{}", path.trim_start_matches('/')))
    .map_err(|e| eyre!("Invalid path '{}': {}", path, e))
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: HeaderMap,
  pub body: Bytes,
}

impl Request {
  /// A plain GET with no headers, as issued for manifest assets.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      headers: HeaderMap::new(),
      body: Bytes::new(),
    }
  }

  /// The identity this request is cached under.
  pub fn key(&self) -> RequestKey {
    RequestKey::new(self.method.clone(), &self.url)
  }
}

/// Request identity inside a cache store: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  method: Method,
  url: Url,
}

impl RequestKey {
  pub fn new(method: Method, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self { method, url }
  }

  pub fn method(&self) -> &Method {
    &self.method
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  /// SHA256 of "METHOD URL", used as a stable fixed-length storage key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// How a response relates to the application's origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
  /// Same origin as the application
  Basic,
  /// Cross-origin, readable via CORS headers
  Cors,
  /// Cross-origin without CORS headers
  Opaque,
  /// Synthetic network error
  Error,
}

impl ResponseType {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Basic => "basic",
      Self::Cors => "cors",
      Self::Opaque => "opaque",
      Self::Error => "error",
    }
  }

  pub fn parse(s: &str) -> Result<Self> {
    match s {
      "basic" => Ok(Self::Basic),
      "cors" => Ok(Self::Cors),
      "opaque" => Ok(Self::Opaque),
      "error" => Ok(Self::Error),
      other => Err(eyre!("Unknown response type '{}'", other)),
    }
  }

  /// Classify a response fetched from `url` for an application served at `origin`.
  pub fn classify(origin: &Url, url: &Url, headers: &HeaderMap) -> Self {
    if origin.origin() == url.origin() {
      Self::Basic
    } else if headers.contains_key(reqwest::header::ACCESS_CONTROL_ALLOW_ORIGIN) {
      Self::Cors
    } else {
      Self::Opaque
    }
  }
}

impl fmt::Display for ResponseType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A fully buffered response.
///
/// The body is a reference-counted buffer, so cloning a response hands out
/// another complete, unconsumed copy without copying bytes.
#[derive(Debug, Clone)]
pub struct Response {
  /// Final URL after redirects
  pub url: Url,
  pub status: StatusCode,
  pub headers: HeaderMap,
  pub body: Bytes,
  pub response_type: ResponseType,
  /// Whether at least one redirect was followed
  pub redirected: bool,
}

impl Response {
  /// True for any 2xx status.
  pub fn ok(&self) -> bool {
    self.status.is_success()
  }

  /// Same-origin and not redirected.
  pub fn is_direct_origin(&self) -> bool {
    self.response_type == ResponseType::Basic && !self.redirected
  }

  /// Whether the fetch path may store this response.
  pub fn is_cacheable(&self) -> bool {
    self.status == StatusCode::OK && self.is_direct_origin()
  }
}

/// Flatten headers into name/value pairs for storage.
///
/// Values are kept as raw bytes; header values need not be UTF-8.
pub fn headers_to_pairs(headers: &HeaderMap) -> Vec<(String, Vec<u8>)> {
  headers
    .iter()
    .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
    .collect()
}

/// Rebuild a header map from stored pairs, skipping anything invalid.
pub fn headers_from_pairs(pairs: Vec<(String, Vec<u8>)>) -> HeaderMap {
  let mut headers = HeaderMap::with_capacity(pairs.len());
  for (name, value) in pairs {
    if let (Ok(name), Ok(value)) = (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_bytes(&value),
    ) {
      headers.append(name, value);
    }
  }
  headers
}
