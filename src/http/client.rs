use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, ACCEPT_ENCODING, CONTENT_LENGTH};
use std::future::Future;
use std::time::Duration;
use url::Url;

use super::types::{is_hop_by_hop, Request, Response, ResponseType};

/// Anything that can put a request on the network.
pub trait Fetcher: Send + Sync + 'static {
  /// Issue the request and buffer the whole response.
  ///
  /// Any HTTP status is a successful fetch; only transport failures
  /// (unreachable host, timeout, broken body) are errors.
  fn fetch(&self, request: Request) -> impl Future<Output = Result<Response>> + Send;
}

/// Network client for the upstream origin that serves the application.
#[derive(Clone)]
pub struct UpstreamClient {
  client: reqwest::Client,
  origin: Url,
}

impl UpstreamClient {
  pub fn new(origin: Url, timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .redirect(reqwest::redirect::Policy::limited(10))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, origin })
  }
}

impl Fetcher for UpstreamClient {
  async fn fetch(&self, request: Request) -> Result<Response> {
    let Request {
      method,
      url,
      headers,
      body,
    } = request;

    let mut forwarded = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
      // reqwest negotiates its own encoding so bodies arrive decoded
      if is_hop_by_hop(name) || *name == ACCEPT_ENCODING || *name == CONTENT_LENGTH {
        continue;
      }
      forwarded.append(name.clone(), value.clone());
    }

    let mut builder = self.client.request(method, url.clone()).headers(forwarded);
    if !body.is_empty() {
      builder = builder.body(body);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", url, e))?;

    let final_url = response.url().clone();
    let redirected = final_url != url;
    let status = response.status();

    let mut headers = response.headers().clone();
    headers.remove(CONTENT_LENGTH);
    let hop_by_hop: Vec<_> = headers
      .keys()
      .filter(|name| is_hop_by_hop(name))
      .cloned()
      .collect();
    for name in hop_by_hop {
      headers.remove(name);
    }

    let response_type = ResponseType::classify(&self.origin, &final_url, &headers);

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", url, e))?;

    Ok(Response {
      url: final_url,
      status,
      headers,
      body,
      response_type,
      redirected,
    })
  }
}
