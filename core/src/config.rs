use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, ShimError};

/// Request timeout applied when none is configured.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Oldest engine API version the shim talks to.
pub const MINIMUM_ENGINE_API_VERSION: &str = "1.42";

/// Shim configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShimConfig {
    /// Engine endpoint (`unix:///var/run/docker.sock`, `tcp://host:2375`).
    /// Falls back to `DOCKER_HOST` / local defaults when unset.
    pub engine_endpoint: Option<String>,

    /// Per-request engine timeout in seconds (0 = default)
    pub request_timeout_secs: u64,

    /// Image pull is abandoned when no progress arrives for this long
    pub image_pull_progress_deadline_secs: u64,

    /// Minimum accepted engine API version
    pub min_api_version: String,

    /// Image backing every sandbox's infra container
    pub pod_infra_image: String,

    /// Grace period when stopping a sandbox's infra container
    pub sandbox_stop_grace_secs: u64,

    /// Streaming settings
    pub streaming: StreamingConfig,

    /// Log output format for the shim itself
    pub log_format: LogFormat,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            engine_endpoint: None,
            request_timeout_secs: 0,
            image_pull_progress_deadline_secs: 60,
            min_api_version: MINIMUM_ENGINE_API_VERSION.to_string(),
            pod_infra_image: "registry.k8s.io/pause:3.9".to_string(),
            sandbox_stop_grace_secs: 10,
            streaming: StreamingConfig::default(),
            log_format: LogFormat::Text,
        }
    }
}

impl ShimConfig {
    /// Load configuration from a YAML file. Missing fields take defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ShimError::InvalidArgument(format!(
                "cannot read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: ShimConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Loaded shim configuration");
        Ok(config)
    }

    /// Reject values the shim cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.image_pull_progress_deadline_secs == 0 {
            return Err(ShimError::InvalidArgument(
                "image_pull_progress_deadline_secs must be greater than zero".to_string(),
            ));
        }
        if self.streaming.token_ttl_secs == 0 {
            return Err(ShimError::InvalidArgument(
                "streaming.token_ttl_secs must be greater than zero".to_string(),
            ));
        }
        if self.streaming.max_inflight == 0 {
            return Err(ShimError::InvalidArgument(
                "streaming.max_inflight must be greater than zero".to_string(),
            ));
        }
        if self.pod_infra_image.is_empty() {
            return Err(ShimError::InvalidArgument(
                "pod_infra_image must not be empty".to_string(),
            ));
        }
        parse_api_version(&self.min_api_version)?;
        Ok(())
    }

    /// Effective per-request engine timeout.
    pub fn request_timeout(&self) -> Duration {
        if self.request_timeout_secs == 0 {
            DEFAULT_REQUEST_TIMEOUT
        } else {
            Duration::from_secs(self.request_timeout_secs)
        }
    }

    pub fn image_pull_progress_deadline(&self) -> Duration {
        Duration::from_secs(self.image_pull_progress_deadline_secs)
    }

    pub fn sandbox_stop_grace(&self) -> Duration {
        Duration::from_secs(self.sandbox_stop_grace_secs)
    }
}

/// Streaming server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Listen address for upgraded exec/attach/port-forward connections
    pub addr: SocketAddr,

    /// Lifetime of an issued token, used or not
    pub token_ttl_secs: u64,

    /// Maximum number of tokens waiting to be consumed
    pub max_inflight: usize,

    /// How long the surviving side of a session may drain after the other closed
    pub teardown_grace_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 10010)),
            token_ttl_secs: 60,
            max_inflight: 1000,
            teardown_grace_ms: 2000,
        }
    }
}

impl StreamingConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: '{}' (supported: text, json)", s)),
        }
    }
}

/// Parse an engine API version such as `1.42` or `1.42.0` into `(major, minor)`.
pub fn parse_api_version(version: &str) -> Result<(u64, u64)> {
    let mut parts = version.trim().split('.');
    let parse = |part: Option<&str>| -> Result<u64> {
        part.and_then(|p| p.parse::<u64>().ok()).ok_or_else(|| {
            ShimError::InvalidArgument(format!("malformed API version: '{}'", version))
        })
    };
    let major = parse(parts.next())?;
    let minor = parse(parts.next())?;
    Ok((major, minor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ShimConfig::default();
        assert_eq!(config.request_timeout(), DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(config.image_pull_progress_deadline(), Duration::from_secs(60));
        assert_eq!(config.min_api_version, "1.42");
        assert_eq!(config.streaming.token_ttl(), Duration::from_secs(60));
        assert_eq!(config.streaming.max_inflight, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_explicit_request_timeout() {
        let config = ShimConfig {
            request_timeout_secs: 5,
            ..Default::default()
        };
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "engine_endpoint: unix:///run/docker.sock\nstreaming:\n  token_ttl_secs: 30\nlog_format: json"
        )
        .unwrap();

        let config = ShimConfig::from_file(file.path()).unwrap();
        assert_eq!(
            config.engine_endpoint.as_deref(),
            Some("unix:///run/docker.sock")
        );
        assert_eq!(config.streaming.token_ttl_secs, 30);
        assert_eq!(config.streaming.max_inflight, 1000);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_from_file_rejects_zero_ttl() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "streaming:\n  token_ttl_secs: 0").unwrap();
        assert!(ShimConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_from_file_missing() {
        let err = ShimConfig::from_file(Path::new("/nonexistent/dockershim.yaml")).unwrap_err();
        assert!(matches!(err, ShimError::InvalidArgument(_)));
    }

    #[test]
    fn test_parse_api_version() {
        assert_eq!(parse_api_version("1.42").unwrap(), (1, 42));
        assert_eq!(parse_api_version("1.43.0").unwrap(), (1, 43));
        assert!(parse_api_version("one.two").is_err());
        assert!(parse_api_version("1").is_err());
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
