//! Configuration for the lbsync controller
//!
//! Defaults match a typical in-cluster deployment; every field can be
//! overridden through `LBSYNC_*` / `TENCENT_*` environment variables.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// kube-rs rejects server-side watch timeouts at or above this value
const MAX_WATCH_TIMEOUT_SECS: u32 = 295;

/// Controller configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Rules document location (default: rules.yaml)
    #[serde(default = "default_rules_path")]
    pub rules_path: PathBuf,

    /// Config cache time-to-live in seconds (default: 60s)
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Server-side pod watch timeout in seconds (default: 290s)
    #[serde(default = "default_watch_timeout")]
    pub watch_timeout_secs: u32,

    /// Upper bound on one watch stream's lifetime in seconds (default: 1h)
    #[serde(default = "default_max_stream_lifetime")]
    pub max_stream_lifetime_secs: u64,

    /// Fixed delay before reopening a broken watch in seconds (default: 5s)
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    /// Address for the /metrics endpoint, disabled when unset
    pub metrics_addr: Option<String>,

    /// Cloud API configuration
    #[serde(default)]
    pub cloud: CloudConfig,
}

/// Cloud load balancer API configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloudConfig {
    /// Region (default: ap-beijing)
    #[serde(default = "default_region")]
    pub region: String,

    /// API endpoint host (default: clb.tencentcloudapi.com)
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Per-request timeout in seconds (default: 30s)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_rules_path() -> PathBuf {
    PathBuf::from("rules.yaml")
}

fn default_cache_ttl() -> u64 {
    60
}

fn default_watch_timeout() -> u32 {
    290
}

fn default_max_stream_lifetime() -> u64 {
    3600
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_region() -> String {
    "ap-beijing".to_string()
}

fn default_endpoint() -> String {
    "clb.tencentcloudapi.com".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint: default_endpoint(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            rules_path: default_rules_path(),
            cache_ttl_secs: default_cache_ttl(),
            watch_timeout_secs: default_watch_timeout(),
            max_stream_lifetime_secs: default_max_stream_lifetime(),
            reconnect_delay_secs: default_reconnect_delay(),
            metrics_addr: None,
            cloud: CloudConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, SyncError> {
        let mut config = Self::default();

        if let Ok(val) = env::var("LBSYNC_RULES_PATH") {
            config.rules_path = PathBuf::from(val);
        }
        if let Some(val) = parse_env("LBSYNC_CACHE_TTL_SECS")? {
            config.cache_ttl_secs = val;
        }
        if let Some(val) = parse_env("LBSYNC_WATCH_TIMEOUT_SECS")? {
            config.watch_timeout_secs = val;
        }
        if let Some(val) = parse_env("LBSYNC_MAX_STREAM_LIFETIME_SECS")? {
            config.max_stream_lifetime_secs = val;
        }
        if let Some(val) = parse_env("LBSYNC_RECONNECT_DELAY_SECS")? {
            config.reconnect_delay_secs = val;
        }
        if let Ok(val) = env::var("LBSYNC_METRICS_ADDR") {
            if !val.is_empty() {
                config.metrics_addr = Some(val);
            }
        }

        // Cloud API
        if let Ok(val) = env::var("TENCENT_REGION") {
            if !val.is_empty() {
                config.cloud.region = val;
            }
        }
        if let Ok(val) = env::var("TENCENT_CLB_ENDPOINT") {
            if !val.is_empty() {
                config.cloud.endpoint = val;
            }
        }
        if let Some(val) = parse_env("TENCENT_REQUEST_TIMEOUT_SECS")? {
            config.cloud.request_timeout_secs = val;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot honour
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.cache_ttl_secs == 0 {
            return Err(SyncError::Config(
                "cache_ttl_secs must be greater than zero".to_string(),
            ));
        }
        if self.watch_timeout_secs == 0 || self.watch_timeout_secs >= MAX_WATCH_TIMEOUT_SECS {
            return Err(SyncError::Config(format!(
                "watch_timeout_secs must be between 1 and {}, got {}",
                MAX_WATCH_TIMEOUT_SECS - 1,
                self.watch_timeout_secs
            )));
        }
        if self.max_stream_lifetime_secs == 0 {
            return Err(SyncError::Config(
                "max_stream_lifetime_secs must be greater than zero".to_string(),
            ));
        }
        if self.reconnect_delay_secs == 0 {
            return Err(SyncError::Config(
                "reconnect_delay_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn max_stream_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_stream_lifetime_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

fn parse_env<T: FromStr>(name: &str) -> Result<Option<T>, SyncError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) if !val.is_empty() => val
            .parse::<T>()
            .map(Some)
            .map_err(|e| SyncError::Config(format!("invalid {}={:?}: {}", name, val, e))),
        _ => Ok(None),
    }
}
