//! Reverse-proxy listener that puts the registration in front of the upstream.

use axum::body::Body;
use axum::extract::State;
use axum::http::header::{HeaderName, HeaderValue, CONTENT_LENGTH};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as AxumResponse};
use axum::Router;
use bytes::{Bytes, BytesMut};
use color_eyre::{eyre::eyre, Result};
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheStorage, FetchResult};
use crate::http::{is_hop_by_hop, upstream_url, Fetcher, Request};
use crate::worker::{AssetManifest, Registration};

/// Response header telling clients how a request was answered.
pub const SOURCE_HEADER: &str = "x-precache";

pub struct ProxyState<S: CacheStorage, F: Fetcher> {
  pub registration: Arc<Registration<S, F>>,
  /// Upstream base URL that inbound paths are resolved against
  pub origin: Url,
  pub max_body_bytes: usize,
}

pub fn router<S: CacheStorage, F: Fetcher>(state: Arc<ProxyState<S, F>>) -> Router {
  Router::new().fallback(proxy::<S, F>).with_state(state)
}

/// Bind `listen` and serve until Ctrl+C or SIGTERM.
pub async fn serve<S: CacheStorage, F: Fetcher>(
  state: Arc<ProxyState<S, F>>,
  listen: SocketAddr,
) -> Result<()> {
  let listener = tokio::net::TcpListener::bind(listen)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", listen, e))?;

  let origin = state.origin.clone();
  info!(address = %listen, upstream = %origin, "Proxy listening");

  axum::serve(listener, router(state))
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| eyre!("Proxy server error: {}", e))?;

  info!("Proxy stopped");
  Ok(())
}

async fn proxy<S: CacheStorage, F: Fetcher>(
  State(state): State<Arc<ProxyState<S, F>>>,
  request: axum::extract::Request,
) -> AxumResponse {
  let request = match into_request(&state, request).await {
    Ok(request) => request,
    Err(response) => return response,
  };

  let method = request.method.clone();
  let url = request.url.clone();

  match state.registration.dispatch(request).await {
    Ok(result) => {
      debug!(
        method = %method,
        url = %url,
        status = %result.response.status,
        source = %result.source,
        "Served"
      );
      into_response(result)
    }
    Err(e) => {
      warn!(method = %method, url = %url, error = %e, "Fetch failed");
      (
        StatusCode::BAD_GATEWAY,
        format!("precache: failed to fetch {}\n", url),
      )
        .into_response()
    }
  }
}

async fn into_request<S: CacheStorage, F: Fetcher>(
  state: &ProxyState<S, F>,
  request: axum::extract::Request,
) -> Result<Request, AxumResponse> {
  let (parts, body) = request.into_parts();

  let declared_len = parts
    .headers
    .get(CONTENT_LENGTH)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.parse::<usize>().ok());
  if declared_len.is_some_and(|len| len > state.max_body_bytes) {
    return Err(StatusCode::PAYLOAD_TOO_LARGE.into_response());
  }

  let path = parts
    .uri
    .path_and_query()
    .map(|pq| pq.as_str())
    .unwrap_or("/");
  let url = upstream_url(&state.origin, path)
    .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()).into_response())?;

  let body = read_body(body, state.max_body_bytes).await?;

  let mut headers = parts.headers;
  let hop_by_hop: Vec<HeaderName> = headers
    .keys()
    .filter(|name| is_hop_by_hop(name))
    .cloned()
    .collect();
  for name in hop_by_hop {
    headers.remove(name);
  }

  Ok(Request {
    method: parts.method,
    url,
    headers,
    body,
  })
}

/// Buffer a request body, answering 413 past `limit` and 400 if the stream breaks.
async fn read_body(body: Body, limit: usize) -> Result<Bytes, AxumResponse> {
  let mut stream = body.into_data_stream();
  let mut buf = BytesMut::new();

  while let Some(chunk) = stream.next().await {
    let chunk = chunk.map_err(|e| {
      (
        StatusCode::BAD_REQUEST,
        format!("precache: failed to read request body: {}\n", e),
      )
        .into_response()
    })?;
    if buf.len() + chunk.len() > limit {
      return Err(StatusCode::PAYLOAD_TOO_LARGE.into_response());
    }
    buf.extend_from_slice(&chunk);
  }

  Ok(buf.freeze())
}

fn into_response(result: FetchResult) -> AxumResponse {
  let FetchResult { response, source } = result;

  let mut out = AxumResponse::new(Body::from(response.body));
  *out.status_mut() = response.status;

  let headers = out.headers_mut();
  for (name, value) in response.headers.iter() {
    if !is_hop_by_hop(name) && *name != CONTENT_LENGTH {
      headers.append(name.clone(), value.clone());
    }
  }
  headers.insert(
    HeaderName::from_static(SOURCE_HEADER),
    HeaderValue::from_static(source.as_str()),
  );

  out
}

/// Periodically re-read the version and manifest and register them.
///
/// Registering an unchanged version is a no-op, so this also serves as the
/// install retry when no version is in control yet.
pub async fn watch_for_updates<S, F, L>(
  registration: Arc<Registration<S, F>>,
  interval: Duration,
  load: L,
) where
  S: CacheStorage,
  F: Fetcher,
  L: Fn() -> Result<(String, AssetManifest)> + Send + 'static,
{
  let mut ticker = tokio::time::interval(interval);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
  // The first tick completes immediately
  ticker.tick().await;

  loop {
    ticker.tick().await;

    let (cache_name, manifest) = match load() {
      Ok(version) => version,
      Err(e) => {
        warn!(error = %e, "Failed to reload configuration");
        continue;
      }
    };

    match registration.register(&cache_name, manifest).await {
      Ok(worker) => debug!(version = %worker.cache_name(), "Update check complete"),
      Err(e) => warn!(version = %cache_name, error = %e, "Update failed, will retry"),
    }
  }
}

async fn shutdown_signal() {
  let ctrl_c = async {
    if let Err(e) = signal::ctrl_c().await {
      error!(error = %e, "Failed to install Ctrl+C handler");
    }
  };

  #[cfg(unix)]
  let terminate = async {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
      Ok(mut s) => {
        s.recv().await;
      }
      Err(e) => {
        error!(error = %e, "Failed to install signal handler");
        std::future::pending::<()>().await;
      }
    }
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    () = ctrl_c => {},
    () = terminate => {},
  }

  info!("Shutdown signal received");
}
