//! Static configuration loaded once at startup from a TOML file.
//!
//! Recognized keys mirror the groups an operator would find in the node's
//! `config.toml`: `client`, `override`, `cache`, `performance`, `security`,
//! and `metrics`. There is no file-watching or hot-reload — configuration is
//! read once, at process startup, and handed out as an `Arc<Config>`.

use std::{net::IpAddr, path::Path};

use serde::Deserialize;
use thiserror::Error;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Client identity and control-plane connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub control_server: String,
    pub secret: String,
    pub port: u16,
    #[serde(default = "default_max_speed_kbps")]
    pub max_speed_kbps: u64,
    #[serde(default = "default_graceful_shutdown_seconds")]
    pub graceful_shutdown_seconds: u64,
}

fn default_max_speed_kbps() -> u64 {
    10_000
}

fn default_graceful_shutdown_seconds() -> u64 {
    60
}

/// Local overrides for values the control plane would otherwise assign.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OverrideConfig {
    pub address: Option<IpAddr>,
    pub port: Option<u16>,
    pub size: Option<u64>,
    pub upstream: Option<String>,
}

/// Content store sizing and timing knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub directory: String,
    #[serde(default = "default_max_size_mebibytes")]
    pub max_size_mebibytes: u64,
    #[serde(default = "default_max_scan_interval_seconds")]
    pub max_scan_interval_seconds: u64,
    #[serde(default = "default_max_scan_time_seconds")]
    pub max_scan_time_seconds: u64,
    #[serde(default = "default_refresh_age_seconds")]
    pub refresh_age_seconds: u64,
}

fn default_max_size_mebibytes() -> u64 {
    10_240
}

fn default_max_scan_interval_seconds() -> u64 {
    600
}

fn default_max_scan_time_seconds() -> u64 {
    120
}

fn default_refresh_age_seconds() -> u64 {
    3_600
}

/// Throughput and resource-usage tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct PerformanceConfig {
    #[serde(default)]
    pub allow_http2: bool,
    #[serde(default = "default_client_timeout_seconds")]
    pub client_timeout_seconds: u64,
    #[serde(default)]
    pub low_memory_mode: bool,
    #[serde(default = "default_true")]
    pub upstream_connection_reuse: bool,
}

fn default_client_timeout_seconds() -> u64 {
    10
}

/// Request-validation and hardening flags.
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub allow_visitor_cache_refresh: bool,
    #[serde(default)]
    pub reject_invalid_hostname: bool,
    #[serde(default)]
    pub reject_invalid_sni: bool,
    /// Open question in the design notes resolved to `true`: this is the safe default.
    #[serde(default = "default_true")]
    pub reject_invalid_tokens: bool,
    #[serde(default)]
    pub send_server_header: bool,
    #[serde(default)]
    pub use_forwarded_for_headers: bool,
    #[serde(default)]
    pub verify_image_integrity: bool,
}

fn default_true() -> bool {
    true
}

/// Observability surface.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enable_prometheus: bool,
}

/// The complete static configuration for one node.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub client: ClientConfig,
    #[serde(default)]
    pub r#override: OverrideConfig,
    pub cache: CacheConfig,
    #[serde(default = "PerformanceConfig::defaults")]
    pub performance: PerformanceConfig,
    #[serde(default = "SecurityConfig::defaults")]
    pub security: SecurityConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl PerformanceConfig {
    fn defaults() -> Self {
        toml::from_str("").expect("empty performance defaults always parse")
    }
}

impl SecurityConfig {
    fn defaults() -> Self {
        toml::from_str("").expect("empty security defaults always parse")
    }
}

impl Config {
    /// Loads and parses a TOML config file from disk. Called exactly once at startup.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [client]
            control_server = "https://control.example"
            secret = "s3cr3t"
            port = 443

            [cache]
            directory = "/tmp/cache"
            "#,
        )
        .unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.client.port, 443);
        assert_eq!(cfg.cache.max_size_mebibytes, 10_240);
        assert!(cfg.security.reject_invalid_tokens);
        assert!(!cfg.metrics.enable_prometheus);
    }

    #[test]
    fn missing_file_errors() {
        let err = Config::load("/nonexistent/config.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
