//! Pooled HTTP(S) client used to fetch cache misses from the origin.
//!
//! Generalizes the teacher's one-shot handshake-per-request client into a
//! connection-reusing pool — origin fetches are the hot path on a miss, and
//! paying a fresh TCP+TLS handshake per request would dominate miss latency
//! under load.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{Request, Response, StatusCode, body::Incoming, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use thiserror::Error;

const MAX_IDLE_PER_HOST: usize = 100;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("origin url is not valid: {0}")]
    InvalidUrl(#[from] http::uri::InvalidUri),
    #[error("origin request could not be built: {0}")]
    BuildRequest(#[from] http::Error),
    #[error("origin connection failed: {0}")]
    Connect(#[from] hyper_util::client::legacy::Error),
    #[error("origin returned a non-success status: {0}")]
    Status(StatusCode),
    #[error("failed to read origin response body: {0}")]
    Body(#[source] hyper::Error),
}

/// A successful origin fetch: status, selected headers, and body bytes.
pub struct OriginResponse {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub last_modified: Option<HeaderValue>,
    pub body: Bytes,
}

#[derive(Clone)]
pub struct UpstreamClient {
    client: Client<HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>, Empty<Bytes>>,
}

impl UpstreamClient {
    pub fn new(timeout: Duration, reuse_connections: bool) -> Self {
        let mut inner = hyper_util::client::legacy::connect::HttpConnector::new();
        inner.enforce_http(false);
        inner.set_connect_timeout(Some(timeout));

        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .wrap_connector(inner);

        let mut builder = Client::builder(TokioExecutor::new());
        if reuse_connections {
            builder.pool_max_idle_per_host(MAX_IDLE_PER_HOST);
            builder.pool_idle_timeout(Duration::from_secs(90));
        } else {
            builder.pool_max_idle_per_host(0);
        }

        Self { client: builder.build(connector) }
    }

    /// Fetches `path` under `origin_base`, returning the bytes and the
    /// headers the pipeline needs to forward (`Content-Type`,
    /// `Last-Modified`).
    pub async fn fetch(&self, origin_base: &str, path: &str) -> Result<OriginResponse, UpstreamError> {
        let uri: hyper::Uri = format!("{}{}", origin_base.trim_end_matches('/'), path).parse()?;

        let request = Request::get(uri).body(Empty::<Bytes>::new())?;
        let response: Response<Incoming> = self.client.request(request).await?;

        let status = response.status();
        let content_type = response.headers().get(hyper::header::CONTENT_TYPE).cloned();
        let last_modified = response.headers().get(hyper::header::LAST_MODIFIED).cloned();

        if !status.is_success() {
            return Err(UpstreamError::Status(status));
        }

        let body = response.into_body().collect().await.map_err(UpstreamError::Body)?.to_bytes();

        Ok(OriginResponse { status, content_type, last_modified, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_builds_with_pooling_enabled() {
        let _client = UpstreamClient::new(Duration::from_secs(10), true);
    }

    #[test]
    fn client_builds_with_pooling_disabled() {
        let _client = UpstreamClient::new(Duration::from_secs(10), false);
    }
}
