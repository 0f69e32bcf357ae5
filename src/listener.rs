//! TLS listener: binds an IPv4 TCP socket, optionally peeks SNI before the
//! handshake completes, and serves each accepted connection through the
//! router via hyper's auto (HTTP/1 or HTTP/2) connection builder.
//!
//! Grounded on the teacher's `server_tls.rs` (deleted from this workspace
//! once its semantics were folded in here) for the rustls `ServerConfig`
//! setup and the accept loop shape; SNI peeking uses
//! `tokio_rustls::LazyConfigAcceptor`, the idiomatic rustls equivalent of
//! the original Go node's raw-socket `tlshowdy.Peek`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as AutoBuilder,
};
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::LazyConfigAcceptor;

use crate::{cert::CertificateHolder, router::Router};

const SNI_PEEK_TIMEOUT: Duration = Duration::from_secs(5);
const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

/// Builds the server-side rustls config backed by the live certificate
/// holder. ALPN offers `h2` only when HTTP/2 is enabled by configuration.
pub fn build_server_config(cert_holder: Arc<CertificateHolder>, allow_http2: bool) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(cert_holder);

    config.alpn_protocols = if allow_http2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    };

    Arc::new(config)
}

/// Accepts TLS connections on `addr` until `shutdown` resolves, dispatching
/// each completed handshake to `router`. SNI is peeked to reject a
/// mismatch against `canonical_hostname` (or a missing SNI entirely) when
/// `reject_invalid_sni` is set; rejection happens by dropping the connection
/// before completing the handshake. `client_timeout` bounds how long a
/// served connection may stay open once the handshake completes.
pub async fn serve(
    addr: SocketAddr,
    server_config: Arc<ServerConfig>,
    router: Arc<Router>,
    canonical_hostname: Arc<tokio::sync::RwLock<String>>,
    reject_invalid_sni: bool,
    client_timeout: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "tls listener bound");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };

                if let Err(e) = configure_keepalive(&stream) {
                    tracing::warn!(error = %e, "failed to configure tcp keepalive");
                }

                let server_config = server_config.clone();
                let router = router.clone();
                let canonical_hostname = canonical_hostname.clone();

                tokio::spawn(async move {
                    if let Err(e) = handle_connection(
                        stream,
                        peer,
                        server_config,
                        router,
                        canonical_hostname,
                        reject_invalid_sni,
                        client_timeout,
                    )
                    .await
                    {
                        tracing::debug!(%peer, error = %e, "connection closed with error");
                    }
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("tls listener stopping");
                    return Ok(());
                }
            }
        }
    }
}

fn configure_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    let sock_ref = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new().with_time(TCP_KEEPALIVE);
    sock_ref.set_tcp_keepalive(&keepalive)
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    server_config: Arc<ServerConfig>,
    router: Arc<Router>,
    canonical_hostname: Arc<tokio::sync::RwLock<String>>,
    reject_invalid_sni: bool,
    client_timeout: Duration,
) -> anyhow::Result<()> {
    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
    tokio::pin!(acceptor);

    let start = tokio::time::timeout(SNI_PEEK_TIMEOUT, &mut acceptor).await??;

    if reject_invalid_sni {
        match start.client_hello().server_name() {
            Some(sni) => {
                let expected = canonical_hostname.read().await;
                if sni != expected.as_str() && sni != "localhost" {
                    tracing::debug!(%peer, sni, expected = %*expected, "rejecting connection for sni mismatch");
                    return Ok(());
                }
            }
            None => {
                tracing::debug!(%peer, "rejecting connection with no sni");
                return Ok(());
            }
        }
    }

    let tls_stream = start.into_stream(server_config).await?;

    let io = TokioIo::new(tls_stream);
    let service = hyper::service::service_fn(move |req| {
        let router = router.clone();
        async move { Ok::<_, std::convert::Infallible>(router.dispatch(req).await) }
    });

    match tokio::time::timeout(
        client_timeout,
        AutoBuilder::new(TokioExecutor::new()).serve_connection(io, service),
    )
    .await
    {
        Ok(result) => result.map_err(|e| anyhow::anyhow!("connection serve error: {e}"))?,
        Err(_) => tracing::debug!(%peer, "connection timed out"),
    }

    Ok(())
}
