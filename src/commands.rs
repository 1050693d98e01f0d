//! Subcommand implementations.

use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use crate::cache::{CacheEntryInfo, CacheStorage, SqliteStorage, StoreSummary};
use crate::config::{Config, Overrides};
use crate::http::UpstreamClient;
use crate::server::{self, ProxyState};
use crate::worker::{AssetManifest, Registration};

fn open_storage(config: &Config) -> Result<SqliteStorage> {
  let path = config.database_path()?;
  info!(path = %path.display(), "Opening cache database");
  SqliteStorage::open(&path)
}

fn registration(
  config: &Config,
  storage: SqliteStorage,
) -> Result<Registration<SqliteStorage, UpstreamClient>> {
  let client = UpstreamClient::new(config.origin()?, config.request_timeout())?;
  Ok(
    Registration::new(Arc::new(storage), Arc::new(client)).with_skip_waiting(config.skip_waiting),
  )
}

/// Run the proxy, installing the configured version first.
///
/// A failed install is not fatal: requests pass through to the upstream and
/// the update loop retries.
pub async fn serve(
  config: Config,
  config_path: PathBuf,
  overrides: Overrides,
  ephemeral: bool,
) -> Result<()> {
  let storage = if ephemeral {
    SqliteStorage::in_memory()?
  } else {
    open_storage(&config)?
  };
  let registration = Arc::new(registration(&config, storage)?);

  if let Err(e) = registration
    .register(&config.cache.name, config.asset_manifest()?)
    .await
  {
    warn!(version = %config.cache.name, error = %e, "Install failed, passing requests through");
  }
  let status = registration.status();
  info!(controller = ?status.controller, waiting = ?status.waiting, "Registration ready");

  if let Some(interval) = config.update_interval() {
    let origin = config.origin()?;
    let load = move || reload(&config_path, &overrides, &origin);
    tokio::spawn(server::watch_for_updates(
      Arc::clone(&registration),
      interval,
      load,
    ));
  }

  let state = Arc::new(ProxyState {
    registration,
    origin: config.origin()?,
    max_body_bytes: config.max_body_bytes,
  });
  server::serve(state, config.listen).await
}

/// Re-read the config file for the update loop.
///
/// The upstream client and listener are built once at startup, so a changed
/// `upstream` is rejected until restart.
fn reload(path: &Path, overrides: &Overrides, origin: &Url) -> Result<(String, AssetManifest)> {
  let config = Config::load_from_path(path, overrides)?;
  let reloaded = config.origin()?;
  if reloaded != *origin {
    return Err(eyre!(
      "upstream changed from {} to {}; restart to apply",
      origin,
      reloaded
    ));
  }
  Ok((config.cache.name.clone(), config.asset_manifest()?))
}

/// Precache the configured version without serving, pruning older versions.
pub async fn install(config: Config) -> Result<()> {
  let registration = registration(&config, open_storage(&config)?)?;
  let manifest = config.asset_manifest()?;
  let assets = manifest.len();
  if manifest.is_empty() {
    warn!(version = %config.cache.name, "Manifest is empty, nothing will be precached");
  }

  registration
    .register(&config.cache.name, manifest)
    .await
    .map_err(|e| eyre!("Failed to install {}: {}", config.cache.name, e))?;

  println!("Installed {} ({} assets)", config.cache.name, assets);
  Ok(())
}

pub fn stores(config: &Config) -> Result<()> {
  let storage = open_storage(config)?;
  let summaries = storage.summaries()?;

  if summaries.is_empty() {
    println!("No cache stores");
    return Ok(());
  }

  for store in &summaries {
    println!("{}", store_row(store, &config.cache.name));
  }
  Ok(())
}

/// List the entries of `name`, or of the configured version.
pub fn entries(config: &Config, name: Option<&str>) -> Result<()> {
  let storage = open_storage(config)?;
  let name = name.unwrap_or(&config.cache.name);

  for entry in &store_entries(&storage, name)? {
    println!("{}", entry_row(entry));
  }
  Ok(())
}

/// Delete every cache store.
pub fn clear(config: &Config) -> Result<()> {
  let storage = open_storage(config)?;
  let deleted = clear_stores(&storage)?;
  println!("Deleted {} cache store(s)", deleted);
  Ok(())
}

/// One `stores` line; `*` marks the configured version.
fn store_row(store: &StoreSummary, current: &str) -> String {
  let marker = if store.name == current { "*" } else { " " };
  format!(
    "{} {:<32} {:>6} entries  created {}",
    marker,
    store.name,
    store.entries,
    store.created_at.format("%Y-%m-%d %H:%M:%S")
  )
}

fn entry_row(entry: &CacheEntryInfo) -> String {
  format!(
    "{:<6} {} {:>9}B {:<6} {}  {}",
    entry.method,
    entry.status,
    entry.body_len,
    entry.response_type,
    entry.cached_at.format("%Y-%m-%d %H:%M:%S"),
    entry.url
  )
}

fn store_entries<S: CacheStorage>(storage: &S, name: &str) -> Result<Vec<CacheEntryInfo>> {
  if !storage.has(name)? {
    return Err(eyre!("No cache store named '{}'", name));
  }
  storage.entries(name)
}

fn clear_stores<S: CacheStorage>(storage: &S) -> Result<usize> {
  let names = storage.keys()?;
  for name in &names {
    storage.delete(name)?;
  }
  Ok(names.len())
}
