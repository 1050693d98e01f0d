//! Scripted network for exercising the worker without sockets.

use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::Mutex;
use url::Url;

use super::{Fetcher, Request, Response, ResponseType};

pub const ORIGIN: &str = "http://app.test/";

/// Absolute URL for `path` on the mock origin.
pub fn url(path: &str) -> Url {
  Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

#[derive(Clone)]
enum Route {
  Respond {
    status: StatusCode,
    body: Bytes,
    response_type: ResponseType,
    redirected: bool,
  },
  Fail,
}

#[derive(Default)]
pub struct MockFetcher {
  routes: Mutex<HashMap<String, Route>>,
  calls: Mutex<Vec<String>>,
}

impl MockFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  /// Answer `path` with a same-origin response.
  pub fn respond(&self, path: &str, status: u16, body: &str) -> &Self {
    self.respond_with(path, status, body, ResponseType::Basic, false)
  }

  pub fn respond_with(
    &self,
    path: &str,
    status: u16,
    body: &str,
    response_type: ResponseType,
    redirected: bool,
  ) -> &Self {
    let route = Route::Respond {
      status: StatusCode::from_u16(status).unwrap(),
      body: Bytes::from(body.to_string()),
      response_type,
      redirected,
    };
    self
      .routes
      .lock()
      .unwrap()
      .insert(url(path).to_string(), route);
    self
  }

  /// Make `path` fail at the transport level.
  pub fn fail(&self, path: &str) -> &Self {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url(path).to_string(), Route::Fail);
    self
  }

  pub fn calls(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  pub fn calls_for(&self, path: &str) -> usize {
    let target = url(path).to_string();
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|c| **c == target)
      .count()
  }
}

impl Fetcher for MockFetcher {
  async fn fetch(&self, request: Request) -> Result<Response> {
    let key = request.url.to_string();
    self.calls.lock().unwrap().push(key.clone());

    let route = self.routes.lock().unwrap().get(&key).cloned();
    match route {
      Some(Route::Respond {
        status,
        body,
        response_type,
        redirected,
      }) => Ok(Response {
        url: request.url,
        status,
        headers: HeaderMap::new(),
        body,
        response_type,
        redirected,
      }),
      Some(Route::Fail) | None => Err(eyre!("Failed to fetch {}: connection refused", key)),
    }
  }
}
