use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

pub mod defaults;
pub mod duration_serde;

use defaults::*;

use crate::errors::AppError;
use crate::models::TranscodeProfile;
use crate::models::session::StreamFormat;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Transcode profiles by name
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout", with = "duration_serde::duration")]
    pub request_timeout: Duration,
}

/// Health monitoring policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// How long a Starting session may produce nothing before failing
    #[serde(
        default = "default_segment_grace_period",
        with = "duration_serde::duration"
    )]
    pub segment_grace_period: Duration,
    /// Segment age beyond interval x multiplier flips Healthy to Stale
    #[serde(default = "default_stale_multiplier")]
    pub stale_multiplier: u32,
    /// Floor for the computed per-session poll interval
    #[serde(
        default = "default_min_check_interval",
        with = "duration_serde::duration"
    )]
    pub min_check_interval: Duration,
    /// Consecutive stale samples / reconnects before permanent failure
    #[serde(default = "default_monitor_tries")]
    pub monitor_tries: u32,
    /// Debounce before tearing down a session with zero viewers
    #[serde(default = "default_idle_grace", with = "duration_serde::duration")]
    pub idle_grace: Duration,
}

/// Upstream process launch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_ffmpeg_command")]
    pub ffmpeg_command: String,
    /// Directory under which per-session segment output lives
    #[serde(default = "default_segment_root")]
    pub segment_root: PathBuf,
    /// Reconnect backoff sequence, last entry held for further retries
    #[serde(
        default = "default_retry_backoff",
        with = "duration_serde::duration_list"
    )]
    pub retry_backoff: Vec<Duration>,
    /// Timeout for the upstream reachability probe used to classify failures
    #[serde(
        default = "default_upstream_probe_timeout",
        with = "duration_serde::duration"
    )]
    pub upstream_probe_timeout: Duration,
}

/// Per-provider admission ceilings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Ceiling applied to providers without an explicit entry; 0 = unlimited
    #[serde(default)]
    pub default_max_connections: u32,
    /// Explicit per-provider ceilings; 0 = unlimited
    #[serde(default)]
    pub providers: HashMap<String, u32>,
    /// Retry-After hint returned with capacity rejections
    #[serde(default = "default_retry_after", with = "duration_serde::duration")]
    pub retry_after: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Rolling window over which samples and failures are aggregated
    #[serde(default = "default_sample_window", with = "duration_serde::duration")]
    pub sample_window: Duration,
    /// Failures within the window that raise a danger alert
    #[serde(default = "default_failure_alert_threshold")]
    pub failure_alert_threshold: u32,
}

/// On-disk form of a transcode profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub format: String,
    /// HLS segment duration in seconds (hls_time)
    #[serde(default = "default_hls_time")]
    pub hls_time: u64,
    #[serde(default)]
    pub args_template: Vec<String>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

impl ProfileConfig {
    /// Convert into a validated runtime profile
    pub fn resolve(&self, name: &str) -> Result<TranscodeProfile, AppError> {
        let format: StreamFormat = self
            .format
            .parse()
            .map_err(|e: String| AppError::configuration(e))?;
        let profile = TranscodeProfile {
            name: name.to_string(),
            format,
            segment_interval: Duration::from_secs(self.hls_time),
            args_template: self.args_template.clone(),
            parameters: self.parameters.clone(),
        };
        profile.validate()?;
        Ok(profile)
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_segment_grace_period() -> Duration {
    Duration::from_secs(DEFAULT_SEGMENT_GRACE_PERIOD_SECS)
}

fn default_stale_multiplier() -> u32 {
    DEFAULT_STALE_MULTIPLIER
}

fn default_min_check_interval() -> Duration {
    Duration::from_secs(DEFAULT_MIN_CHECK_INTERVAL_SECS)
}

fn default_monitor_tries() -> u32 {
    DEFAULT_MONITOR_TRIES
}

fn default_idle_grace() -> Duration {
    Duration::from_secs(DEFAULT_IDLE_GRACE_SECS)
}

fn default_ffmpeg_command() -> String {
    DEFAULT_FFMPEG_COMMAND.to_string()
}

fn default_segment_root() -> PathBuf {
    std::env::temp_dir().join("shared-stream-monitor")
}

fn default_retry_backoff() -> Vec<Duration> {
    DEFAULT_RETRY_BACKOFF_SECS
        .iter()
        .map(|s| Duration::from_secs(*s))
        .collect()
}

fn default_upstream_probe_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_retry_after() -> Duration {
    Duration::from_secs(30)
}

fn default_sample_window() -> Duration {
    Duration::from_secs(300)
}

fn default_failure_alert_threshold() -> u32 {
    3
}

fn default_hls_time() -> u64 {
    4
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            segment_grace_period: default_segment_grace_period(),
            stale_multiplier: default_stale_multiplier(),
            min_check_interval: default_min_check_interval(),
            monitor_tries: default_monitor_tries(),
            idle_grace: default_idle_grace(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ffmpeg_command: default_ffmpeg_command(),
            segment_root: default_segment_root(),
            retry_backoff: default_retry_backoff(),
            upstream_probe_timeout: default_upstream_probe_timeout(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_max_connections: 0,
            providers: HashMap::new(),
            retry_after: default_retry_after(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            sample_window: default_sample_window(),
            failure_alert_threshold: default_failure_alert_threshold(),
        }
    }
}

impl Config {
    pub fn load_from_file(config_file: &str) -> Result<Self> {
        if std::path::Path::new(&config_file).exists() {
            let contents = std::fs::read_to_string(config_file)?;
            Ok(toml::from_str(&contents)?)
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::write(config_file, contents)?;
            info!("Created default config file: {}", config_file);
            Ok(default_config)
        }
    }

    /// Resolve and validate all configured transcode profiles
    pub fn resolved_profiles(&self) -> Result<HashMap<String, TranscodeProfile>, AppError> {
        let mut resolved = HashMap::new();
        for (name, profile) in &self.profiles {
            resolved.insert(name.clone(), profile.resolve(name)?);
        }
        Ok(resolved)
    }
}
