//! Network side of the proxy: the request/response model and the upstream client.

mod client;
#[cfg(test)]
pub mod mock;
mod types;

pub use client::{Fetcher, UpstreamClient};
pub use types::{
  headers_from_pairs, headers_to_pairs, is_hop_by_hop, upstream_url, Request, RequestKey,
  Response, ResponseType,
};
