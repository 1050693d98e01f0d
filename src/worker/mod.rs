//! Offline cache manager lifecycle.
//!
//! A [`CacheWorker`] is one version of the cache manager: it installs by
//! precaching an [`AssetManifest`] into its own versioned store, activates by
//! deleting every other store, and then answers fetches cache-first. The
//! [`Registration`] plays the host's part: it installs new versions, decides
//! when they take control, and routes requests to whichever worker is in
//! charge.

mod cache_worker;
mod manifest;
mod registration;
mod state;

pub use manifest::{AssetManifest, DEFAULT_ASSETS};
pub use registration::Registration;
