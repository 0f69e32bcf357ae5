//! Wires every component together and drives the node's background loops:
//! heartbeat (15s), certificate rotation (24h), and graceful shutdown.

use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use tokio::sync::{RwLock, watch};

use crate::{
    cache::ContentStore,
    cert::{CertificateHolder, parse_keypair},
    config::Config,
    control::{ControlClient, NodeIdentity},
    listener,
    metrics::Metrics,
    pipeline::{self, PipelineState},
    policy::{self, PolicyCell},
    router::Router,
    signals::{self, Signal},
    upstream::UpstreamClient,
};

/// Fixed per §4.7: the upstream fetch client always uses a 30s timeout,
/// independent of `performance.client_timeout_seconds` (that setting governs
/// the served connection's read/write timeout instead).
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const CERT_ROTATION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_secs(1);
const QUIET_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("initial heartbeat failed and no certificate is available: {0}")]
    PolicyMissing(#[from] crate::control::ControlError),
    #[error("cache directory could not be opened: {0}")]
    CacheUnavailable(#[from] crate::cache::CacheError),
    #[error("delivered certificate could not be parsed: {0}")]
    InvalidCertificate(#[from] crate::cert::CertError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Runs the node to completion: startup heartbeat, component wiring, all
/// background loops, and the accept loop, returning once a graceful
/// shutdown has fully drained.
pub async fn run(config: Config) -> Result<(), SupervisorError> {
    let control = Arc::new(ControlClient::new(config.client.control_server.clone()));

    let identity_port = config.r#override.port.unwrap_or(config.client.port);
    let disk_space = disk_space_bytes(&config.cache.directory);
    let network_speed = config.client.max_speed_kbps * 1_000 / 8;

    let identity = NodeIdentity {
        secret: config.client.secret.clone(),
        port: identity_port,
        ip_address: config.r#override.address,
        disk_space_bytes: disk_space,
        network_speed_bytes_per_sec: network_speed,
        build_version: env!("CARGO_PKG_VERSION").replace('.', "").parse().unwrap_or(0),
    };

    let cert_holder = Arc::new(CertificateHolder::empty());
    let policy_cell: Arc<PolicyCell> = Arc::new(policy::new_cell());

    let (heartbeat, cert_pair) = control
        .heartbeat(&identity, false)
        .await
        .map_err(SupervisorError::PolicyMissing)?;

    if heartbeat.compromised {
        tracing::warn!("control plane marked this node compromised");
    }
    if heartbeat.paused {
        tracing::warn!("control plane marked this node paused");
    }

    let canonical_hostname = Arc::new(RwLock::new(heartbeat.policy.canonical_hostname.clone()));

    if let Some((cert_pem, key_pem)) = &cert_pair {
        let keypair = parse_keypair(cert_pem, key_pem)?;
        cert_holder.update(keypair);
    }
    policy_cell.store(Arc::new(Some(heartbeat.policy)));

    let cache_limit_bytes = config
        .r#override
        .size
        .unwrap_or(config.cache.max_size_mebibytes * 1024 * 1024);
    let content_store = Arc::new(ContentStore::open(
        config.cache.directory.clone().into(),
        cache_limit_bytes,
        config.cache.refresh_age_seconds as i64,
    )?);

    let metrics = Arc::new(Metrics::new());
    let upstream = UpstreamClient::new(UPSTREAM_TIMEOUT, config.performance.upstream_connection_reuse);

    let last_request = Arc::new(AtomicI64::new(chrono::Utc::now().timestamp()));

    let mut router = Router::new();
    let pipeline_state = Arc::new(PipelineState {
        content_store: content_store.clone(),
        policy: policy_cell.clone(),
        metrics: metrics.clone(),
        upstream,
        security: config.security.clone(),
        performance: config.performance.clone(),
        last_request: last_request.clone(),
    });
    pipeline::register(&mut router, pipeline_state);

    router.route(hyper::Method::GET, "/robots.txt", crate::metrics::robots_txt);
    if config.metrics.enable_prometheus {
        let metrics_for_route = metrics.clone();
        router.route(hyper::Method::GET, "/metrics", move |_req: crate::types::Request| {
            let metrics = metrics_for_route.clone();
            async move { crate::metrics::metrics_response(&metrics) }
        });
    }
    let router = Arc::new(router);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = Arc::new(std::sync::atomic::AtomicBool::new(true));

    let scan_snapshot = Arc::new(parking_lot::Mutex::new(Vec::new()));
    tokio::spawn(crate::cache::eviction::run_scanner(
        content_store.clone(),
        scan_snapshot.clone(),
        Duration::from_secs(config.cache.max_scan_interval_seconds),
        Duration::from_secs(config.cache.max_scan_time_seconds),
        running.clone(),
    ));
    tokio::spawn(crate::cache::eviction::run_evictor(
        content_store.clone(),
        scan_snapshot,
        Duration::from_secs(config.cache.max_scan_time_seconds),
        running.clone(),
    ));

    tokio::spawn(heartbeat_loop(
        control.clone(),
        identity_clone(&identity, identity_port, config.r#override.address, disk_space, network_speed),
        policy_cell.clone(),
        cert_holder.clone(),
        canonical_hostname.clone(),
        config.r#override.upstream.clone(),
        running.clone(),
    ));

    tokio::spawn(rotation_loop(
        control.clone(),
        identity_clone(&identity, identity_port, config.r#override.address, disk_space, network_speed),
        cert_holder.clone(),
        running.clone(),
    ));

    let addr = SocketAddr::new(
        config.r#override.address.unwrap_or(IpAddr::from([0, 0, 0, 0])),
        identity_port,
    );
    let server_config = listener::build_server_config(cert_holder.clone(), config.performance.allow_http2);

    signals::app_signals().emit(Signal::new(signals::ids::SERVER_STARTED)).await;

    let listener_task = tokio::spawn(listener::serve(
        addr,
        server_config,
        router,
        canonical_hostname,
        config.security.reject_invalid_sni,
        Duration::from_secs(config.performance.client_timeout_seconds),
        shutdown_rx,
    ));

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining connections");

    running.store(false, Ordering::Relaxed);
    control.shutdown(&config.client.secret).await;
    let shutdown_start = chrono::Utc::now().timestamp();

    loop {
        let idle_for = chrono::Utc::now().timestamp() - last_request.load(Ordering::Relaxed);
        let draining_for = chrono::Utc::now().timestamp() - shutdown_start;
        if idle_for >= QUIET_PERIOD.as_secs() as i64
            || draining_for >= config.client.graceful_shutdown_seconds as i64
        {
            break;
        }
        tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
    }

    let _ = shutdown_tx.send(true);
    let _ = listener_task.await;

    signals::app_signals().emit(Signal::new(signals::ids::SERVER_STOPPED)).await;

    Ok(())
}

fn identity_clone(
    identity: &NodeIdentity,
    port: u16,
    ip_address: Option<IpAddr>,
    disk_space: u64,
    network_speed: u64,
) -> NodeIdentity {
    NodeIdentity {
        secret: identity.secret.clone(),
        port,
        ip_address,
        disk_space_bytes: disk_space,
        network_speed_bytes_per_sec: network_speed,
        build_version: identity.build_version,
    }
}

async fn heartbeat_loop(
    control: Arc<ControlClient>,
    identity: NodeIdentity,
    policy_cell: Arc<PolicyCell>,
    cert_holder: Arc<CertificateHolder>,
    canonical_hostname: Arc<RwLock<String>>,
    upstream_override: Option<String>,
    running: Arc<std::sync::atomic::AtomicBool>,
) {
    while running.load(Ordering::Relaxed) {
        tokio::time::sleep(HEARTBEAT_INTERVAL).await;
        if !running.load(Ordering::Relaxed) {
            break;
        }

        let has_cert = cert_holder.get().is_some();
        match control.heartbeat(&identity, has_cert).await {
            Ok((heartbeat, cert_pair)) => {
                if heartbeat.compromised {
                    tracing::warn!("control plane marked this node compromised");
                }
                if heartbeat.paused {
                    tracing::warn!("control plane marked this node paused");
                }

                if let Some((cert_pem, key_pem)) = cert_pair {
                    match parse_keypair(&cert_pem, &key_pem) {
                        Ok(keypair) => cert_holder.update(keypair),
                        Err(e) => tracing::warn!(error = %e, "heartbeat delivered an unparseable certificate"),
                    }
                }

                let mut policy = heartbeat.policy;
                if upstream_override.is_some() {
                    // local override.upstream always wins over heartbeat-delivered origin
                    if let Some(ref upstream) = upstream_override {
                        policy.origin_url = upstream.clone();
                    }
                }

                *canonical_hostname.write().await = policy.canonical_hostname.clone();
                policy_cell.store(Arc::new(Some(policy)));
            }
            Err(e) => {
                tracing::warn!(error = %e, "heartbeat failed, retaining previous policy");
            }
        }
    }
}

async fn rotation_loop(
    control: Arc<ControlClient>,
    identity: NodeIdentity,
    cert_holder: Arc<CertificateHolder>,
    running: Arc<std::sync::atomic::AtomicBool>,
) {
    while running.load(Ordering::Relaxed) {
        tokio::time::sleep(CERT_ROTATION_INTERVAL).await;
        if !running.load(Ordering::Relaxed) {
            break;
        }

        match control.get_certificate(&identity).await {
            Ok((cert_pem, key_pem)) => match parse_keypair(&cert_pem, &key_pem) {
                Ok(keypair) => {
                    cert_holder.update(keypair);
                    tracing::info!("tls certificate rotated");
                }
                Err(e) => tracing::warn!(error = %e, "rotation delivered an unparseable certificate"),
            },
            Err(e) => tracing::warn!(error = %e, "certificate rotation failed, keeping current certificate"),
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn disk_space_bytes(cache_directory: &str) -> u64 {
    std::fs::create_dir_all(cache_directory).ok();
    // Best-effort: statvfs-style free-space queries aren't portably available
    // through std alone; the control plane treats this as advisory capacity
    // information, not an enforced limit.
    match fs2::available_space(cache_directory) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(error = %e, "failed to query available disk space");
            0
        }
    }
}
