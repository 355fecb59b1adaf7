//! The upstream seam.
//!
//! Everything that talks to the analytics server goes through
//! [`Upstream`]: the dataset fetcher, the boundary ingestor, and through it
//! the boundary cache. [`HttpUpstream`](crate::client::HttpUpstream) is the
//! production implementation; tests plug in counting or scripted fakes.
//!
//! ```text
//!   fetch::fetch_records ──┐
//!                          ├──▶ Arc<dyn Upstream> ──▶ GET {base}{path}?{params}
//!   boundary::fetch_levels ┘
//! ```

use async_trait::async_trait;
use serde_json::Value;

use dhis2_bridge_core::models::EndpointFamily;
use dhis2_bridge_core::BridgeError;

/// A source of JSON documents addressed by path and query parameters.
///
/// Implementations map every transport, HTTP, or authentication failure to
/// [`BridgeError::UpstreamUnavailable`] and every undecodable 2xx body to
/// [`BridgeError::UpstreamMalformed`]. A successful call that carries no
/// data must return `Ok` so callers can tell "empty" from "down".
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn get_json(
        &self,
        family: EndpointFamily,
        path: &str,
        params: &[(String, String)],
    ) -> Result<Value, BridgeError>;
}
