//! Control-plane client: heartbeat, certificate acquisition, graceful stop.
//!
//! All calls are confined to IPv4 resolution — the control plane is IPv4-only
//! per operational contract — and go out over a single pooled HTTPS client
//! the same way the upstream fetcher does (see [`crate::upstream`]), rather
//! than the one-shot handshake-per-call the control plane strictly needs;
//! reusing one client keeps connection setup off the heartbeat's critical
//! path.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use http_body_util::{BodyExt, Full};
use hyper::{Request, body::Bytes};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector, connect::dns::Name},
    rt::TokioExecutor,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tower_service::Service;

use crate::policy::Policy;

/// A DNS resolver that discards every `AAAA` result, so control-plane
/// connections only ever reach an IPv4 address — the control plane is
/// IPv4-only per operational contract.
#[derive(Clone, Default)]
struct Ipv4OnlyResolver;

impl Service<Name> for Ipv4OnlyResolver {
    type Response = std::vec::IntoIter<SocketAddr>;
    type Error = std::io::Error;
    type Future =
        std::pin::Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, name: Name) -> Self::Future {
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((name.as_str(), 0)).await?;
            let v4: Vec<SocketAddr> = addrs.filter(|a| a.is_ipv4()).collect();
            Ok(v4.into_iter())
        })
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control plane unreachable: {0}")]
    Connect(#[from] hyper_util::client::legacy::Error),
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),
    #[error("invalid JSON from control plane: {0}")]
    Json(#[from] serde_json::Error),
    #[error("control plane returned no usable certificate and none is cached")]
    NoCertificate,
    #[error("control plane response decoded but carried no origin url")]
    NoOrigin,
    #[error("control plane token key was not valid base64")]
    BadTokenKey,
    #[error("control plane token key was not 32 bytes")]
    WrongTokenKeyLength,
}

#[derive(Debug, Serialize)]
struct HeartbeatRequest<'a> {
    secret: &'a str,
    port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip_address: Option<IpAddr>,
    disk_space: u64,
    network_speed: u64,
    build_version: i64,
    tls_created_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TlsMaterial {
    #[allow(dead_code)]
    created_at: String,
    private_key: String,
    certificate: String,
}

#[derive(Debug, Deserialize)]
struct HeartbeatResponse {
    image_server: String,
    latest_build: i64,
    url: String,
    token_key: String,
    compromised: bool,
    paused: bool,
    disable_tokens: bool,
    tls: Option<TlsMaterial>,
}

#[derive(Debug, Serialize)]
struct ShutdownRequest<'a> {
    secret: &'a str,
}

/// Parameters describing this node as advertised in every heartbeat.
pub struct NodeIdentity {
    pub secret: String,
    pub port: u16,
    pub ip_address: Option<IpAddr>,
    pub disk_space_bytes: u64,
    pub network_speed_bytes_per_sec: u64,
    pub build_version: i64,
}

/// A parsed heartbeat: the resulting policy plus whether the control plane
/// marked the node compromised or paused, which callers log but otherwise
/// do not act on — this spec mandates no behavioral hook beyond visibility.
pub struct Heartbeat {
    pub policy: Policy,
    pub compromised: bool,
    pub paused: bool,
}

pub struct ControlClient {
    client: Client<HttpsConnector<HttpConnector<Ipv4OnlyResolver>>, Full<Bytes>>,
    control_server: String,
}

impl ControlClient {
    pub fn new(control_server: String) -> Self {
        let mut inner = HttpConnector::new_with_resolver(Ipv4OnlyResolver);
        inner.enforce_http(false);
        inner.set_connect_timeout(Some(Duration::from_secs(10)));

        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .wrap_connector(inner);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        Self { client, control_server }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.control_server.trim_end_matches('/'), path)
    }

    async fn post_json<T: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<R, ControlError> {
        let payload = serde_json::to_vec(body)?;
        let request = Request::post(self.url(path))
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(payload)))
            .expect("well-formed control request");

        let response = self.client.request(request).await?;
        let bytes = response.into_body().collect().await?.to_bytes();
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Sends a heartbeat and returns the policy the control plane assigned.
    /// Resolves spec §4.3's "discard responses missing a usable TLS/origin"
    /// rule relative to `existing_cert`: when the response omits `tls` and
    /// a certificate is already cached, the heartbeat still succeeds (the
    /// cached certificate remains valid); only the combination of no `tls`
    /// key *and* no cached certificate is fatal.
    pub async fn heartbeat(
        &self,
        identity: &NodeIdentity,
        has_cached_certificate: bool,
    ) -> Result<(Heartbeat, Option<(String, String)>), ControlError> {
        let request = HeartbeatRequest {
            secret: &identity.secret,
            port: identity.port,
            ip_address: identity.ip_address,
            disk_space: identity.disk_space_bytes,
            network_speed: identity.network_speed_bytes_per_sec,
            build_version: identity.build_version,
            tls_created_at: None,
        };

        let response: HeartbeatResponse = self.post_json("/ping", &request).await?;

        if response.image_server.is_empty() {
            return Err(ControlError::NoOrigin);
        }

        let token_key_bytes = BASE64
            .decode(response.token_key.as_bytes())
            .map_err(|_| ControlError::BadTokenKey)?;
        let token_key: [u8; 32] = token_key_bytes
            .try_into()
            .map_err(|_| ControlError::WrongTokenKeyLength)?;

        let cert_pair = match &response.tls {
            Some(tls) => Some((tls.certificate.clone(), tls.private_key.clone())),
            None if has_cached_certificate => None,
            None => return Err(ControlError::NoCertificate),
        };

        let canonical_hostname = host_from_url(&response.url);

        let policy = Policy {
            origin_url: response.image_server,
            token_key,
            disable_tokens: response.disable_tokens,
            tls_cert: response
                .tls
                .as_ref()
                .map(|t| t.certificate.clone())
                .unwrap_or_default(),
            tls_key: response
                .tls
                .as_ref()
                .map(|t| t.private_key.clone())
                .unwrap_or_default(),
            canonical_hostname,
            compromised: response.compromised,
            paused: response.paused,
            latest_build: response.latest_build,
        };

        let heartbeat = Heartbeat {
            compromised: response.compromised,
            paused: response.paused,
            policy,
        };

        Ok((heartbeat, cert_pair))
    }

    /// Convenience used at startup: heartbeats and returns only the parsed
    /// TLS keypair, fatal if none results.
    pub async fn get_certificate(
        &self,
        identity: &NodeIdentity,
    ) -> Result<(String, String), ControlError> {
        let (_, cert_pair) = self.heartbeat(identity, false).await?;
        cert_pair.ok_or(ControlError::NoCertificate)
    }

    /// Best-effort notification that the node is going away.
    pub async fn shutdown(&self, secret: &str) {
        let request = ShutdownRequest { secret };
        let payload = match serde_json::to_vec(&request) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode shutdown request");
                return;
            }
        };

        let built = Request::post(self.url("/stop"))
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(payload)));

        let Ok(built) = built else { return };

        if let Err(e) = self.client.request(built).await {
            tracing::warn!(error = %e, "shutdown notification to control plane failed");
        }
    }
}

/// Extracts the bare hostname (no scheme, no port) from the node's announced
/// URL, for use as the SNI/Host gating value.
fn host_from_url(url: &str) -> String {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let host_and_port = without_scheme.split('/').next().unwrap_or(without_scheme);
    host_and_port.rsplit_once(':').map(|(host, _)| host).unwrap_or(host_and_port).to_string()
}

pub type SharedControlClient = Arc<ControlClient>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_request_serializes_expected_shape() {
        let request = HeartbeatRequest {
            secret: "s3cr3t",
            port: 443,
            ip_address: None,
            disk_space: 10,
            network_speed: 20,
            build_version: 30,
            tls_created_at: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["secret"], "s3cr3t");
        assert_eq!(json["tls_created_at"], serde_json::Value::Null);
        assert!(json.get("ip_address").is_none());
    }

    #[test]
    fn host_from_url_strips_scheme_port_and_path() {
        assert_eq!(host_from_url("https://node.example.org:443/"), "node.example.org");
        assert_eq!(host_from_url("https://node.example.org"), "node.example.org");
        assert_eq!(host_from_url("node.example.org:443"), "node.example.org");
    }

    #[test]
    fn heartbeat_response_parses_minimal_shape() {
        let raw = serde_json::json!({
            "image_server": "https://example.org",
            "latest_build": 42,
            "url": "https://origin.example.org",
            "token_key": BASE64.encode([7u8; 32]),
            "compromised": false,
            "paused": false,
            "disable_tokens": false,
            "tls": {
                "created_at": "2024-01-01T00:00:00Z",
                "private_key": "KEY",
                "certificate": "CERT",
            }
        });
        let parsed: HeartbeatResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.latest_build, 42);
        assert!(parsed.tls.is_some());
    }
}
