use color_eyre::{eyre::eyre, Result};
use std::collections::HashSet;
use url::Url;

use crate::http::upstream_url;

/// Assets precached when the configuration does not list any.
pub const DEFAULT_ASSETS: &[&str] = &[
  "/",
  "/index.html",
  "/manifest.json",
  "favicon/favicon.ico",
  "favicon/web-app-manifest-192x192.png",
  "favicon/web-app-manifest-512x512.png",
];

/// Ordered list of absolute URLs that must be stored before a version installs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetManifest {
  urls: Vec<Url>,
}

impl AssetManifest {
  /// Resolve manifest entries against the upstream origin.
  ///
  /// Entries are either paths (relative to the origin's base path) or
  /// absolute http(s) URLs. Fragments are dropped; an entry that resolves
  /// to the same URL as an earlier one is an error.
  pub fn resolve<I, T>(origin: &Url, entries: I) -> Result<Self>
  where
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
  {
    let mut urls = Vec::new();
    let mut seen = HashSet::new();

    for entry in entries {
      let entry = entry.as_ref().trim();
      if entry.is_empty() {
        return Err(eyre!("Manifest entries must not be empty"));
      }

      let mut url = match Url::parse(entry) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => url,
        _ => upstream_url(origin, entry)?,
      };
      url.set_fragment(None);

      if !seen.insert(url.clone()) {
        return Err(eyre!("Duplicate manifest entry '{}' ({})", entry, url));
      }
      urls.push(url);
    }

    Ok(Self { urls })
  }

  pub fn urls(&self) -> &[Url] {
    &self.urls
  }

  pub fn iter(&self) -> impl Iterator<Item = &Url> {
    self.urls.iter()
  }

  pub fn len(&self) -> usize {
    self.urls.len()
  }

  pub fn is_empty(&self) -> bool {
    self.urls.is_empty()
  }
}
