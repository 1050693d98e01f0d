use color_eyre::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::cache_worker::CacheWorker;
use super::manifest::AssetManifest;
use super::state::WorkerState;
use crate::cache::{CacheSource, CacheStorage, FetchResult};
use crate::http::{Fetcher, Request};

/// Snapshot of a registration for status output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationStatus {
  pub controller: Option<(String, WorkerState)>,
  pub waiting: Option<String>,
  pub in_flight: usize,
}

/// Owner of the cache workers for one application.
///
/// Installs new versions, decides when they take control, and routes every
/// intercepted request to the current controller. Without a controller,
/// requests go straight to the network.
pub struct Registration<S: CacheStorage, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  skip_waiting: bool,
  controller: RwLock<Option<Arc<CacheWorker<S, F>>>>,
  waiting: RwLock<Option<Arc<CacheWorker<S, F>>>>,
  in_flight: AtomicUsize,
  /// Serialises register and promotion
  update_lock: Mutex<()>,
}

/// Counts a dispatch for as long as it is alive, including when it is dropped mid-flight.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
  fn enter(counter: &'a AtomicUsize) -> Self {
    counter.fetch_add(1, Ordering::SeqCst);
    Self(counter)
  }
}

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

impl<S: CacheStorage, F: Fetcher> Registration<S, F> {
  pub fn new(storage: Arc<S>, fetcher: Arc<F>) -> Self {
    Self {
      storage,
      fetcher,
      skip_waiting: true,
      controller: RwLock::new(None),
      waiting: RwLock::new(None),
      in_flight: AtomicUsize::new(0),
      update_lock: Mutex::new(()),
    }
  }

  /// Set whether new versions skip waiting for the controller to go idle.
  pub fn with_skip_waiting(mut self, skip_waiting: bool) -> Self {
    self.skip_waiting = skip_waiting;
    self
  }

  /// The worker currently answering fetches.
  pub fn controller(&self) -> Option<Arc<CacheWorker<S, F>>> {
    self
      .controller
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  /// An installed worker waiting to take control.
  pub fn waiting(&self) -> Option<Arc<CacheWorker<S, F>>> {
    self
      .waiting
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn status(&self) -> RegistrationStatus {
    RegistrationStatus {
      controller: self
        .controller()
        .map(|w| (w.cache_name().to_string(), w.state())),
      waiting: self.waiting().map(|w| w.cache_name().to_string()),
      in_flight: self.in_flight.load(Ordering::SeqCst),
    }
  }

  /// Install `cache_name` with `manifest` and let it take control.
  ///
  /// A version identical to the controller (or the waiting worker) is a
  /// no-op. If install fails the current controller keeps serving and the
  /// error is returned so the caller can retry later.
  pub async fn register(
    &self,
    cache_name: &str,
    manifest: AssetManifest,
  ) -> Result<Arc<CacheWorker<S, F>>> {
    let _guard = self.update_lock.lock().await;

    for existing in [self.controller(), self.waiting()].into_iter().flatten() {
      if existing.cache_name() == cache_name && *existing.manifest() == manifest {
        debug!(version = %cache_name, "Version unchanged");
        return Ok(existing);
      }
    }

    let worker = Arc::new(
      CacheWorker::new(
        cache_name,
        manifest,
        Arc::clone(&self.storage),
        Arc::clone(&self.fetcher),
      )
      .with_skip_waiting(self.skip_waiting),
    );

    worker.install().await?;

    if self.controller().is_none() || worker.skip_waiting_requested() {
      self.activate_and_claim(&worker).await?;
      return Ok(worker);
    }

    info!(version = %cache_name, "Waiting for in-flight requests to finish");
    let replaced = self
      .waiting
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .replace(Arc::clone(&worker));
    if let Some(replaced) = replaced {
      replaced.retire();
    }

    if self.in_flight.load(Ordering::SeqCst) == 0 {
      self.promote_waiting().await;
    }

    Ok(worker)
  }

  /// Activate `worker` and route all further requests through it.
  ///
  /// The previous controller is retired before stale stores are pruned, so
  /// none of its refills can land in a store that activation deletes.
  async fn activate_and_claim(&self, worker: &Arc<CacheWorker<S, F>>) -> Result<()> {
    let previous = self.controller();
    if let Some(previous) = &previous {
      previous.retire();
    }

    if let Err(e) = worker.activate().await {
      if let Some(previous) = &previous {
        previous.reinstate();
      }
      return Err(e);
    }

    *self
      .controller
      .write()
      .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(worker));

    match previous {
      Some(previous) => info!(
        previous = %previous.cache_name(),
        version = %worker.cache_name(),
        "Replaced controller"
      ),
      None => info!(version = %worker.cache_name(), "Claimed clients"),
    }

    Ok(())
  }

  /// Promote the waiting worker, if any. Caller holds the update lock.
  async fn promote_waiting(&self) {
    let waiting = self
      .waiting
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .take();

    if let Some(worker) = waiting {
      if let Err(e) = self.activate_and_claim(&worker).await {
        warn!(version = %worker.cache_name(), error = %e, "Failed to activate waiting worker");
      }
    }
  }

  /// Route a request through the controller, or to the network if there is none.
  pub async fn dispatch(&self, request: Request) -> Result<FetchResult> {
    let result = {
      let _flight = InFlight::enter(&self.in_flight);
      match self.controller() {
        Some(worker) => worker.handle_fetch(request).await,
        None => {
          debug!(url = %request.url, "No controller, passing through");
          self
            .fetcher
            .fetch(request)
            .await
            .map(|response| FetchResult::new(response, CacheSource::Network))
        }
      }
    };

    self.promote_if_idle().await;
    result
  }

  async fn promote_if_idle(&self) {
    if self.in_flight.load(Ordering::SeqCst) != 0 || self.waiting().is_none() {
      return;
    }
    // A running register will promote on its own
    let Ok(_guard) = self.update_lock.try_lock() else {
      return;
    };
    if self.in_flight.load(Ordering::SeqCst) == 0 {
      self.promote_waiting().await;
    }
  }
}
