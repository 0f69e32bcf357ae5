//! Request Pipeline: the `GET /{token?}/{kind}/{chapter}/{filename}` handler.
//!
//! Two route patterns (tokenless and tokened) share this single handler.
//! Stages run reject-fast to expensive, exactly as laid out in the data
//! model: hostname gate, shape validation, token verification, referer
//! normalization, response-header preamble, conditional short-circuit,
//! cache lookup, hit/miss paths, trailer accounting.

use std::{
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Instant,
};

use futures_util::StreamExt;
use http::{StatusCode, header};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::{
    body::CacheBody,
    cache::{ContentStore, layout::Fingerprint},
    config::{PerformanceConfig, SecurityConfig},
    metrics::Metrics,
    policy::PolicyCell,
    router::Router,
    token,
    types::{Request, Response},
    upstream::UpstreamClient,
};

static CHAPTER_REFERER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^https://mangadex\.org/chapter/[0-9]+").unwrap());

/// Shared state every pipeline invocation reads. Cloned (cheaply, behind
/// `Arc`) into the handler closure registered with the router.
pub struct PipelineState {
    pub content_store: Arc<ContentStore>,
    pub policy: Arc<PolicyCell>,
    pub metrics: Arc<Metrics>,
    pub upstream: UpstreamClient,
    pub security: SecurityConfig,
    pub performance: PerformanceConfig,
    /// Wall-clock time of the most recently admitted request, read by the
    /// supervisor's shutdown handler.
    pub last_request: Arc<AtomicI64>,
}

/// Registers both route patterns against one shared handler.
pub fn register(router: &mut Router, state: Arc<PipelineState>) {
    let s1 = state.clone();
    router.route(hyper::Method::GET, "/{kind}/{chapter}/{filename}", move |req: Request| {
        let state = s1.clone();
        async move { handle(state, req).await }
    });

    let s2 = state;
    router.route(
        hyper::Method::GET,
        "/{token}/{kind}/{chapter}/{filename}",
        move |req: Request| {
            let state = s2.clone();
            async move { handle(state, req).await }
        },
    );
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn plain_response(status: StatusCode) -> Response {
    hyper::Response::builder()
        .status(status)
        .body(CacheBody::empty())
        .expect("status-only response is well-formed")
}

async fn handle(state: Arc<PipelineState>, req: Request) -> Response {
    let started = Instant::now();

    let params = req
        .extensions()
        .get::<crate::route::PathParams>()
        .cloned()
        .unwrap_or_default()
        .0;

    let policy_snapshot = state.policy.load_full();
    let Some(policy) = policy_snapshot.as_ref() else {
        // No policy has ever been delivered; the supervisor should not have
        // started the listener in this state, but fail closed if it did.
        return plain_response(StatusCode::SERVICE_UNAVAILABLE);
    };

    // Stage 1: hostname gate.
    if state.security.reject_invalid_hostname {
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|h| h.split(':').next().unwrap_or(h));

        if host != Some(policy.canonical_hostname.as_str()) {
            state.metrics.dropped.inc();
            return plain_response(StatusCode::BAD_REQUEST);
        }
    }

    // Stage 2: shape validation.
    let (Some(kind), Some(chapter), Some(filename)) =
        (params.get("kind"), params.get("chapter"), params.get("filename"))
    else {
        state.metrics.dropped.inc();
        return plain_response(StatusCode::BAD_REQUEST);
    };

    let Some(fingerprint) = Fingerprint::parse(kind, chapter, filename) else {
        state.metrics.dropped.inc();
        return plain_response(StatusCode::BAD_REQUEST);
    };

    // Stage 3: token verification.
    if !policy.disable_tokens && state.security.reject_invalid_tokens {
        if let Some(token_str) = params.get("token") {
            let verdict = token::verify(token_str, &fingerprint.chapter, &policy.token_key, chrono::Utc::now());
            if let Some(status) = verdict.status() {
                state.metrics.dropped.inc();
                return plain_response(status);
            }
        } else {
            state.metrics.dropped.inc();
            return plain_response(StatusCode::FORBIDDEN);
        }
    }

    state.last_request.store(now(), Ordering::Relaxed);
    state.metrics.requests.inc();

    // Stage 4: referer normalization (privacy measure; never logged raw).
    let _referer = req
        .headers()
        .get(header::REFERER)
        .and_then(|v| v.to_str().ok())
        .map(|raw| match CHAPTER_REFERER_RE.find(raw) {
            Some(m) => m.as_str().to_string(),
            None => raw.to_string(),
        })
        .unwrap_or_else(|| "None".to_string());

    // Stage 5: response-header preamble.
    let mut builder = hyper::Response::builder()
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(header::ACCESS_CONTROL_EXPOSE_HEADERS, "*")
        .header(header::CACHE_CONTROL, "public, max-age=1209600")
        .header("Timing-Allow-Origin", "*")
        .header(header::X_CONTENT_TYPE_OPTIONS, "nosniff");

    if state.security.send_server_header {
        builder = builder.header(header::SERVER, "cachenode");
    }

    // Stage 6: conditional short-circuit.
    if req.headers().contains_key(header::IF_MODIFIED_SINCE) {
        state.metrics.skipped.inc();
        return builder
            .status(StatusCode::NOT_MODIFIED)
            .body(CacheBody::empty())
            .expect("304 response is well-formed");
    }

    // Stage 7: cache lookup.
    let mut already_counted_refresh = false;
    if let Some(hit) = state.content_store.get(&fingerprint).await {
        let mut bytes = None;
        if !state.performance.low_memory_mode {
            use tokio::io::AsyncReadExt;
            let mut file = hit.file;
            let mut buf = Vec::with_capacity(hit.size as usize);
            if file.read_to_end(&mut buf).await.is_ok() {
                bytes = Some(buf);
            }
        }

        let mut corrupted = false;
        if state.security.verify_image_integrity && fingerprint.kind == "data" {
            if let Some(buf) = &bytes {
                if let Some(expected) = expected_sha256(filename) {
                    let mut hasher = Sha256::new();
                    hasher.update(buf);
                    let digest = hex::encode(hasher.finalize());
                    if digest != expected {
                        corrupted = true;
                        state.metrics.corrupted.inc();
                    }
                }
            }
        }

        let refresh_requested = state.security.allow_visitor_cache_refresh
            && req
                .headers()
                .get(header::CACHE_CONTROL)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.contains("no-cache"))
                .unwrap_or(false);

        if !corrupted && !refresh_requested {
            state.metrics.hits.inc();
            let elapsed = started.elapsed().as_millis();

            let response = builder
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, mime_guess::from_path(filename).first_or_octet_stream().as_ref())
                .header(header::CONTENT_LENGTH, hit.size)
                .header(header::LAST_MODIFIED, httpdate::fmt_http_date(
                    std::time::UNIX_EPOCH + std::time::Duration::from_secs(hit.mtime.max(0) as u64),
                ))
                .header("X-Cache", "HIT")
                .header("X-Time-Taken", elapsed.to_string())
                .body(match bytes {
                    Some(buf) => {
                        state.metrics.served_bytes.inc_by(buf.len() as u64);
                        CacheBody::from(buf)
                    }
                    None => {
                        state.metrics.served_bytes.inc_by(hit.size);
                        let stream = tokio_util_reader_stream(hit.file);
                        CacheBody::from_stream(stream)
                    }
                })
                .expect("cache hit response is well-formed");

            tracing::info!(fingerprint = %fingerprint.canonical(), cache = "HIT", ms = elapsed, "request complete");
            return response;
        }

        if refresh_requested {
            state.metrics.refreshed.inc();
            already_counted_refresh = true;
        }
    }

    // Stage 9: miss path. A visitor-triggered refresh already incremented
    // `refreshed` above and must not also bump `misses`.
    if !already_counted_refresh {
        state.metrics.misses.inc();
    }
    let origin = policy.origin_url.clone();
    match state.upstream.fetch(&origin, &fingerprint.canonical()).await {
        Ok(origin_response) => {
            let mtime = origin_response
                .last_modified
                .as_ref()
                .and_then(|v| v.to_str().ok())
                .and_then(parse_mtime)
                .unwrap_or_else(now);

            let content_type = origin_response
                .content_type
                .clone()
                .unwrap_or_else(|| header::HeaderValue::from_static("application/octet-stream"));

            let served_len = origin_response.body.len() as u64;
            state.content_store.set(&fingerprint, mtime, &origin_response.body).await;
            state.metrics.served_bytes.inc_by(served_len);

            let elapsed = started.elapsed().as_millis();
            tracing::info!(fingerprint = %fingerprint.canonical(), cache = "MISS", ms = elapsed, "request complete");

            builder
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CONTENT_LENGTH, served_len)
                .header(header::LAST_MODIFIED, httpdate::fmt_http_date(
                    std::time::UNIX_EPOCH + std::time::Duration::from_secs(mtime.max(0) as u64),
                ))
                .header("X-Cache", "MISS")
                .header("X-Time-Taken", elapsed.to_string())
                .body(CacheBody::from(origin_response.body))
                .expect("miss response is well-formed")
        }
        Err(crate::upstream::UpstreamError::Status(status)) => {
            state.metrics.failed.inc();
            tracing::warn!(fingerprint = %fingerprint.canonical(), %status, "origin returned non-success status");
            builder.status(status).body(CacheBody::empty()).expect("status-propagated response is well-formed")
        }
        Err(e) => {
            state.metrics.failed.inc();
            tracing::warn!(fingerprint = %fingerprint.canonical(), error = %e, "origin fetch failed");
            builder
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .body(CacheBody::empty())
                .expect("503 response is well-formed")
        }
    }
}

/// Parses a filename of the form `<64-hex>-<rest>.ext` for the optional
/// integrity check; returns the expected SHA-256 hex digest if the name
/// matches the `verify_image_integrity` grammar.
fn expected_sha256(filename: &str) -> Option<String> {
    let stem = filename.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(filename);
    let (candidate, _rest) = stem.split_once('-')?;
    if candidate.len() == 64 && candidate.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
        Some(candidate.to_string())
    } else {
        None
    }
}

/// Parses an origin `Last-Modified` header as either an HTTP-date or a
/// bare integer-seconds fallback.
fn parse_mtime(value: &str) -> Option<i64> {
    httpdate::parse_http_date(value)
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .or_else(|| value.trim().parse::<i64>().ok())
}

fn tokio_util_reader_stream(file: tokio::fs::File) -> impl futures_util::Stream<Item = Result<bytes::Bytes, std::io::Error>> {
    futures_util::stream::unfold(file, |mut file| async move {
        use tokio::io::AsyncReadExt;
        let mut buf = vec![0u8; 64 * 1024];
        match file.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(bytes::Bytes::from(buf)), file))
            }
            Err(e) => Some((Err(e), file)),
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chapter_referer_keeps_only_matched_prefix() {
        let raw = "https://mangadex.org/chapter/12345/page/3?foo=bar";
        let m = CHAPTER_REFERER_RE.find(raw).unwrap();
        assert_eq!(m.as_str(), "https://mangadex.org/chapter/12345");
    }

    #[test]
    fn expected_sha256_parses_prefixed_filename() {
        let digest = "a".repeat(64);
        let filename = format!("{digest}-orig.jpg");
        assert_eq!(expected_sha256(&filename), Some(digest));
    }

    #[test]
    fn expected_sha256_rejects_plain_filename() {
        assert_eq!(expected_sha256("1.jpg"), None);
    }

    #[test]
    fn parse_mtime_accepts_http_date_and_integer_fallback() {
        let date = httpdate::fmt_http_date(std::time::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000));
        assert_eq!(parse_mtime(&date), Some(1_700_000_000));
        assert_eq!(parse_mtime("1700000001"), Some(1_700_000_001));
        assert_eq!(parse_mtime("not-a-date"), None);
    }
}
