use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use reqwest::Method;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

use super::manifest::AssetManifest;
use super::state::WorkerState;
use crate::cache::{CacheSource, CacheStorage, FetchResult};
use crate::http::{Fetcher, Request};

/// One version of the offline cache manager.
///
/// A worker owns exactly one cache store, named by its version string. It
/// moves through install (precache the manifest), activate (prune every other
/// store) and then answers fetches cache-first, refilling the store from the
/// network on a miss.
pub struct CacheWorker<S: CacheStorage, F: Fetcher> {
  cache_name: String,
  manifest: AssetManifest,
  storage: Arc<S>,
  fetcher: Arc<F>,
  state: RwLock<WorkerState>,
  /// Whether install asks to skip the waiting phase
  skip_waiting_on_install: bool,
  skip_waiting: AtomicBool,
  activated: AtomicBool,
}

impl<S: CacheStorage, F: Fetcher> CacheWorker<S, F> {
  pub fn new(
    cache_name: impl Into<String>,
    manifest: AssetManifest,
    storage: Arc<S>,
    fetcher: Arc<F>,
  ) -> Self {
    Self {
      cache_name: cache_name.into(),
      manifest,
      storage,
      fetcher,
      state: RwLock::new(WorkerState::Uninstalled),
      skip_waiting_on_install: true,
      skip_waiting: AtomicBool::new(false),
      activated: AtomicBool::new(false),
    }
  }

  /// Set whether a successful install requests to skip waiting.
  pub fn with_skip_waiting(mut self, skip_waiting: bool) -> Self {
    self.skip_waiting_on_install = skip_waiting;
    self
  }

  /// Name of the cache store this version owns.
  pub fn cache_name(&self) -> &str {
    &self.cache_name
  }

  pub fn manifest(&self) -> &AssetManifest {
    &self.manifest
  }

  pub fn state(&self) -> WorkerState {
    *self.state.read().unwrap_or_else(PoisonError::into_inner)
  }

  fn set_state(&self, state: WorkerState) {
    *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
  }

  /// Move from `from` to `to`, failing if the worker is elsewhere.
  fn transition(&self, from: WorkerState, to: WorkerState) -> Result<()> {
    let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
    if *state != from {
      return Err(eyre!(
        "Cannot move worker {} to {}: it is {}",
        self.cache_name,
        to,
        *state
      ));
    }
    *state = to;
    Ok(())
  }

  /// Ask to become active without waiting for the current controller to go idle.
  pub fn skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
  }

  pub fn skip_waiting_requested(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }

  /// Whether this worker has ever been activated (and so may answer fetches).
  pub fn is_activated(&self) -> bool {
    self.activated.load(Ordering::SeqCst)
  }

  /// Precache every manifest asset into this version's store.
  ///
  /// Either all assets are fetched with a 2xx status and stored, or the
  /// install fails and the worker becomes redundant.
  pub async fn install(&self) -> Result<()> {
    self.transition(WorkerState::Uninstalled, WorkerState::Installing)?;
    info!(version = %self.cache_name, assets = self.manifest.len(), "Installing");

    match self.precache().await {
      Ok(()) => {
        self.set_state(WorkerState::Installed);
        if self.skip_waiting_on_install {
          self.skip_waiting();
        }
        info!(version = %self.cache_name, "Installed");
        Ok(())
      }
      Err(e) => {
        self.set_state(WorkerState::Redundant);
        warn!(version = %self.cache_name, error = %e, "Install failed");
        Err(e)
      }
    }
  }

  async fn precache(&self) -> Result<()> {
    self.storage.open(&self.cache_name)?;

    let fetches = self.manifest.iter().map(|url| async move {
      let request = Request::get(url.clone());
      let key = request.key();
      let response = self
        .fetcher
        .fetch(request)
        .await
        .map_err(|e| eyre!("Failed to precache {}: {}", url, e))?;

      if !response.ok() {
        return Err(eyre!(
          "Failed to precache {}: upstream answered {}",
          url,
          response.status
        ));
      }

      debug!(url = %url, status = %response.status, "Precached");
      Ok((key, response))
    });

    let entries = try_join_all(fetches).await?;
    self.storage.put_all(&self.cache_name, &entries)
  }

  /// Delete every cache store except this version's and take control.
  pub async fn activate(&self) -> Result<()> {
    self.transition(WorkerState::Installed, WorkerState::Activating)?;
    info!(version = %self.cache_name, "Activating");

    let names = match self.storage.keys() {
      Ok(names) => names,
      Err(e) => {
        self.set_state(WorkerState::Redundant);
        return Err(e);
      }
    };

    for name in names.iter().filter(|name| **name != self.cache_name) {
      // Best effort: a store that survives is retried on the next activation
      match self.storage.delete(name) {
        Ok(_) => info!(stale = %name, "Deleted stale cache"),
        Err(e) => warn!(stale = %name, error = %e, "Failed to delete stale cache"),
      }
    }

    self.activated.store(true, Ordering::SeqCst);
    self.set_state(WorkerState::Active);
    info!(version = %self.cache_name, "Active");
    Ok(())
  }

  /// Mark the worker as replaced. In-flight fetches finish but stop writing.
  pub fn retire(&self) {
    self.set_state(WorkerState::Redundant);
  }

  /// Undo `retire` for an activated worker whose successor failed to activate.
  pub fn reinstate(&self) {
    if self.is_activated() {
      let _ = self.transition(WorkerState::Redundant, WorkerState::Active);
    }
  }

  /// Answer an intercepted request: cache first, then network with refill.
  pub async fn handle_fetch(&self, request: Request) -> Result<FetchResult> {
    if !self.is_activated() {
      return Err(eyre!(
        "Worker {} cannot handle fetches while {}",
        self.cache_name,
        self.state()
      ));
    }

    // Only GET is ever looked up or stored
    if request.method != Method::GET {
      let response = self.fetcher.fetch(request).await?;
      return Ok(FetchResult::new(response, CacheSource::Network));
    }

    let key = request.key();
    if let Some(cached) = self.storage.match_request(&self.cache_name, &key)? {
      debug!(request = %key, "Cache hit");
      return Ok(FetchResult::new(cached.response, CacheSource::Hit));
    }

    let response = self.fetcher.fetch(request).await?;
    if !response.is_cacheable() {
      debug!(
        request = %key,
        status = %response.status,
        response_type = %response.response_type,
        redirected = response.redirected,
        "Not caching response"
      );
      return Ok(FetchResult::new(response, CacheSource::Network));
    }

    // A retired worker's store may already be gone; put refuses to recreate it
    if self.state() != WorkerState::Active {
      return Ok(FetchResult::new(response, CacheSource::Network));
    }

    // The body is a shared buffer: the store and the caller each get a full copy
    if let Err(e) = self.storage.put(&self.cache_name, &key, &response) {
      warn!(request = %key, error = %e, "Failed to cache response");
      return Ok(FetchResult::new(response, CacheSource::Network));
    }

    debug!(request = %key, "Cached response");
    Ok(FetchResult::new(response, CacheSource::Refill))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::http::mock::{url, MockFetcher};
  use crate::http::{RequestKey, ResponseType};
  use bytes::Bytes;
  use reqwest::StatusCode;
  use url::Url;

  fn origin() -> Url {
    Url::parse(crate::http::mock::ORIGIN).unwrap()
  }

  fn manifest(paths: &[&str]) -> AssetManifest {
    AssetManifest::resolve(&origin(), paths).unwrap()
  }

  fn worker(
    name: &str,
    paths: &[&str],
    storage: &Arc<SqliteStorage>,
    fetcher: &Arc<MockFetcher>,
  ) -> CacheWorker<SqliteStorage, MockFetcher> {
    CacheWorker::new(name, manifest(paths), storage.clone(), fetcher.clone())
  }

  fn shell_fetcher() -> Arc<MockFetcher> {
    let fetcher = MockFetcher::new();
    fetcher
      .respond("/", 200, "root")
      .respond("/index.html", 200, "index")
      .respond("/new.html", 200, "new");
    Arc::new(fetcher)
  }

  async fn active_worker(
    paths: &[&str],
    storage: &Arc<SqliteStorage>,
    fetcher: &Arc<MockFetcher>,
  ) -> CacheWorker<SqliteStorage, MockFetcher> {
    let w = worker("app-v1", paths, storage, fetcher);
    w.install().await.unwrap();
    w.activate().await.unwrap();
    w
  }

  fn stored(storage: &SqliteStorage, name: &str, path: &str) -> bool {
    storage
      .match_request(name, &RequestKey::new(Method::GET, &url(path)))
      .unwrap()
      .is_some()
  }

  #[tokio::test]
  async fn test_install_precaches_manifest() {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let fetcher = shell_fetcher();
    let w = worker("app-v1", &["/", "/index.html"], &storage, &fetcher);

    w.install().await.unwrap();

    assert_eq!(w.state(), WorkerState::Installed);
    assert!(w.skip_waiting_requested());
    assert_eq!(storage.entries("app-v1").unwrap().len(), 2);
    assert!(stored(&storage, "app-v1", "/index.html"));
  }

  #[tokio::test]
  async fn test_install_twice_has_no_duplicates() {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let fetcher = shell_fetcher();

    worker("app-v1", &["/", "/index.html"], &storage, &fetcher)
      .install()
      .await
      .unwrap();
    worker("app-v1", &["/", "/index.html"], &storage, &fetcher)
      .install()
      .await
      .unwrap();

    let urls: Vec<String> = storage
      .entries("app-v1")
      .unwrap()
      .into_iter()
      .map(|e| e.url)
      .collect();
    assert_eq!(urls, vec!["http://app.test/", "http://app.test/index.html"]);
  }

  #[tokio::test]
  async fn test_install_fails_on_single_network_error() {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let fetcher = shell_fetcher();
    fetcher.fail("/manifest.json");
    let w = worker("app-v1", &["/", "/manifest.json"], &storage, &fetcher);

    assert!(w.install().await.is_err());
    assert_eq!(w.state(), WorkerState::Redundant);
    assert!(storage.entries("app-v1").unwrap().is_empty());
    assert!(w.activate().await.is_err());
  }

  #[tokio::test]
  async fn test_install_fails_on_error_status() {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let fetcher = shell_fetcher();
    fetcher.respond("/gone.png", 404, "missing");
    let w = worker("app-v1", &["/", "/gone.png"], &storage, &fetcher);

    let err = w.install().await.unwrap_err();
    assert!(err.to_string().contains("404"));
    assert_eq!(w.state(), WorkerState::Redundant);
  }

  #[tokio::test]
  async fn test_install_only_once() {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let fetcher = shell_fetcher();
    let w = worker("app-v1", &["/"], &storage, &fetcher);

    w.install().await.unwrap();
    assert!(w.install().await.is_err());
    assert_eq!(w.state(), WorkerState::Installed);
  }

  #[tokio::test]
  async fn test_without_skip_waiting_install_does_not_request_it() {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let fetcher = shell_fetcher();
    let w = worker("app-v1", &["/"], &storage, &fetcher).with_skip_waiting(false);

    w.install().await.unwrap();
    assert!(!w.skip_waiting_requested());
  }

  #[tokio::test]
  async fn test_activate_deletes_every_other_store() {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let fetcher = shell_fetcher();
    for stale in ["app-v0", "app-v1", "other-cache"] {
      storage.open(stale).unwrap();
    }

    let w = worker("app-v2", &["/"], &storage, &fetcher);
    w.install().await.unwrap();
    w.activate().await.unwrap();

    assert_eq!(w.state(), WorkerState::Active);
    assert_eq!(storage.keys().unwrap(), vec!["app-v2"]);
  }

  #[tokio::test]
  async fn test_activate_requires_install() {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let fetcher = shell_fetcher();
    let w = worker("app-v1", &["/"], &storage, &fetcher);

    assert!(w.activate().await.is_err());
    assert_eq!(w.state(), WorkerState::Uninstalled);
  }

  #[tokio::test]
  async fn test_upgrade_scenario() {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let fetcher = shell_fetcher();

    let v1 = worker("app-v1", &["/", "/index.html"], &storage, &fetcher);
    v1.install().await.unwrap();
    v1.activate().await.unwrap();
    assert_eq!(storage.entries("app-v1").unwrap().len(), 2);

    let v2 = worker(
      "app-v2",
      &["/", "/index.html", "/new.html"],
      &storage,
      &fetcher,
    );
    v2.install().await.unwrap();
    v2.activate().await.unwrap();

    assert!(!storage.has("app-v1").unwrap());
    assert_eq!(storage.keys().unwrap(), vec!["app-v2"]);
    assert_eq!(storage.entries("app-v2").unwrap().len(), 3);
  }

  #[tokio::test]
  async fn test_fetch_before_activation_is_rejected() {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let fetcher = shell_fetcher();
    let w = worker("app-v1", &["/"], &storage, &fetcher);
    w.install().await.unwrap();

    assert!(w.handle_fetch(Request::get(url("/"))).await.is_err());
  }

  #[tokio::test]
  async fn test_cached_request_skips_network() {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let fetcher = shell_fetcher();
    let w = active_worker(&["/", "/index.html"], &storage, &fetcher).await;
    let calls_after_install = fetcher.calls();

    let result = w.handle_fetch(Request::get(url("/index.html"))).await.unwrap();

    assert_eq!(result.source, CacheSource::Hit);
    assert_eq!(&result.response.body[..], b"index");
    assert_eq!(fetcher.calls(), calls_after_install);
  }

  #[tokio::test]
  async fn test_fragment_does_not_defeat_cache() {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let fetcher = shell_fetcher();
    let w = active_worker(&["/index.html"], &storage, &fetcher).await;

    let result = w
      .handle_fetch(Request::get(url("/index.html#about")))
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Hit);
  }

  #[tokio::test]
  async fn test_miss_refills_store() {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let fetcher = shell_fetcher();
    fetcher.respond("/about.html", 200, "about");
    let w = active_worker(&["/"], &storage, &fetcher).await;

    let first = w.handle_fetch(Request::get(url("/about.html"))).await.unwrap();
    assert_eq!(first.source, CacheSource::Refill);
    assert_eq!(&first.response.body[..], b"about");
    assert!(stored(&storage, "app-v1", "/about.html"));

    let second = w.handle_fetch(Request::get(url("/about.html"))).await.unwrap();
    assert_eq!(second.source, CacheSource::Hit);
    assert_eq!(&second.response.body[..], b"about");
    assert_eq!(fetcher.calls_for("/about.html"), 1);
  }

  #[tokio::test]
  async fn test_error_status_is_returned_but_not_stored() {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let fetcher = shell_fetcher();
    fetcher.respond("/missing", 404, "not found");
    let w = active_worker(&["/"], &storage, &fetcher).await;

    let result = w.handle_fetch(Request::get(url("/missing"))).await.unwrap();

    assert_eq!(result.response.status, StatusCode::NOT_FOUND);
    assert_eq!(result.source, CacheSource::Network);
    assert!(!stored(&storage, "app-v1", "/missing"));
  }

  #[tokio::test]
  async fn test_cross_origin_and_redirected_are_not_stored() {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let fetcher = shell_fetcher();
    fetcher
      .respond_with("/opaque", 200, "x", ResponseType::Opaque, false)
      .respond_with("/cors", 200, "x", ResponseType::Cors, false)
      .respond_with("/moved", 200, "x", ResponseType::Basic, true);
    let w = active_worker(&["/"], &storage, &fetcher).await;

    for path in ["/opaque", "/cors", "/moved"] {
      let result = w.handle_fetch(Request::get(url(path))).await.unwrap();
      assert_eq!(result.response.status, StatusCode::OK);
      assert_eq!(result.source, CacheSource::Network);
      assert!(!stored(&storage, "app-v1", path), "{} was stored", path);
    }
  }

  #[tokio::test]
  async fn test_network_failure_propagates() {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let fetcher = shell_fetcher();
    fetcher.fail("/offline");
    let w = active_worker(&["/"], &storage, &fetcher).await;

    assert!(w.handle_fetch(Request::get(url("/offline"))).await.is_err());
    assert!(!stored(&storage, "app-v1", "/offline"));
  }

  #[tokio::test]
  async fn test_non_get_bypasses_cache() {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let fetcher = shell_fetcher();
    let w = active_worker(&["/"], &storage, &fetcher).await;
    let before = fetcher.calls_for("/");

    let request = Request {
      method: Method::POST,
      url: url("/"),
      headers: Default::default(),
      body: Bytes::from_static(b"form"),
    };
    let result = w.handle_fetch(request).await.unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(fetcher.calls_for("/"), before + 1);
    assert!(storage
      .match_request("app-v1", &RequestKey::new(Method::POST, &url("/")))
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_retired_worker_serves_but_does_not_write() {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let fetcher = shell_fetcher();
    fetcher.respond("/late.html", 200, "late");
    let w = active_worker(&["/"], &storage, &fetcher).await;
    w.retire();

    let result = w.handle_fetch(Request::get(url("/late.html"))).await.unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert!(!stored(&storage, "app-v1", "/late.html"));
  }

  #[tokio::test]
  async fn test_reinstated_worker_writes_again() {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let fetcher = shell_fetcher();
    fetcher.respond("/late.html", 200, "late");
    let w = active_worker(&["/"], &storage, &fetcher).await;
    w.retire();
    w.reinstate();

    assert_eq!(w.state(), WorkerState::Active);
    let result = w.handle_fetch(Request::get(url("/late.html"))).await.unwrap();
    assert_eq!(result.source, CacheSource::Refill);
  }

  #[tokio::test]
  async fn test_refill_into_deleted_store_is_dropped() {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let fetcher = shell_fetcher();
    fetcher.respond("/late.html", 200, "late");
    let w = active_worker(&["/"], &storage, &fetcher).await;

    // Pruned by a newer version while this one still looks active
    storage.delete("app-v1").unwrap();

    let result = w.handle_fetch(Request::get(url("/late.html"))).await.unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(&result.response.body[..], b"late");
    assert!(storage.keys().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_concurrent_fetches_on_distinct_keys() {
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let fetcher = shell_fetcher();
    let paths: Vec<String> = (0..16).map(|i| format!("/page-{}.html", i)).collect();
    for path in &paths {
      fetcher.respond(path, 200, path);
    }
    let w = Arc::new(active_worker(&["/"], &storage, &fetcher).await);

    let handles: Vec<_> = paths
      .iter()
      .map(|path| {
        let w = w.clone();
        let request = Request::get(url(path));
        tokio::spawn(async move { w.handle_fetch(request).await })
      })
      .collect();

    for handle in handles {
      let result = handle.await.unwrap().unwrap();
      assert_eq!(result.source, CacheSource::Refill);
    }
    assert_eq!(storage.entries("app-v1").unwrap().len(), 17);
  }
}
