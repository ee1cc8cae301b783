//! Shared stream session models
//!
//! A session is one upstream fetch (typically an ffmpeg relay process) shared
//! by any number of viewers. The registry holds one `SessionRecord` per active
//! session; the process handle itself is owned locally by the monitor process
//! that spawned it and never enters the shared record.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Container format of the upstream fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum StreamFormat {
    /// Segmented HLS output; health is judged by segment freshness
    Hls,
    /// Continuous MPEG-TS output; health is judged by byte flow
    Ts,
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamFormat::Hls => write!(f, "hls"),
            StreamFormat::Ts => write!(f, "ts"),
        }
    }
}

impl FromStr for StreamFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hls" => Ok(StreamFormat::Hls),
            "ts" | "mpegts" => Ok(StreamFormat::Ts),
            _ => Err(format!("Unknown stream format: {s}")),
        }
    }
}

/// Session lifecycle state
///
/// Only the health monitor and retry coordinator advance this, always through
/// compare-and-swap updates. Viewer attach/detach never touches state.
/// `Stopped` is terminal and reachable from any state via explicit teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Upstream spawned, waiting for first data within the grace period
    Starting,
    /// Producing fresh data
    Healthy,
    /// Producing data too slowly, not yet failed
    Stale,
    /// Upstream failed; retryable until attempts are exhausted
    Failed,
    /// Explicitly torn down
    Stopped,
}

impl SessionState {
    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (_, Stopped)
                | (Starting, Healthy)
                | (Starting, Failed)
                | (Healthy, Stale)
                | (Healthy, Failed)
                | (Stale, Healthy)
                | (Stale, Failed)
                | (Failed, Starting)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Starting => "starting",
            SessionState::Healthy => "healthy",
            SessionState::Stale => "stale",
            SessionState::Failed => "failed",
            SessionState::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Authoritative record of one shared stream session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Unique per (source, variant/profile) combination
    pub session_key: String,
    /// Provider/playlist the session counts against for admission
    pub provider_id: String,
    /// Resolved source URL being fetched
    pub upstream_url: String,
    pub format: StreamFormat,
    /// Name of the transcode profile producing this session's output
    pub profile_name: String,
    pub state: SessionState,
    pub viewer_count: u32,
    pub started_at: DateTime<Utc>,
    pub last_healthy_at: Option<DateTime<Utc>>,
    pub last_check_at: Option<DateTime<Utc>>,
    /// Consecutive stale samples / reconnect attempts; reset on every return to Healthy
    pub retry_count: u32,
    /// Segment duration of the producing profile (HLS hls_time), sizes the poll interval
    #[serde(with = "crate::config::duration_serde::duration")]
    pub segment_interval: Duration,
}

impl SessionRecord {
    pub fn new(
        session_key: impl Into<String>,
        provider_id: impl Into<String>,
        upstream_url: impl Into<String>,
        format: StreamFormat,
        profile_name: impl Into<String>,
        segment_interval: Duration,
    ) -> Self {
        Self {
            session_key: session_key.into(),
            provider_id: provider_id.into(),
            upstream_url: upstream_url.into(),
            format,
            profile_name: profile_name.into(),
            state: SessionState::Starting,
            viewer_count: 0,
            started_at: Utc::now(),
            last_healthy_at: None,
            last_check_at: None,
            retry_count: 0,
            segment_interval,
        }
    }

    /// Poll interval for health checks: half the segment interval, floored
    /// at the configured minimum
    pub fn poll_interval(&self, min_check_interval: Duration) -> Duration {
        let half = Duration::from_secs(self.segment_interval.as_secs() / 2);
        half.max(min_check_interval)
    }

    /// Staleness cutoff for HLS segment age
    pub fn stale_threshold(&self, multiplier: u32) -> Duration {
        self.segment_interval * multiplier
    }

    /// How long the session has been in `Starting` since (re)spawn
    pub fn starting_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.started_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// What the probe actually observed for one check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthObservation {
    /// Age of the newest HLS segment, `None` when no segment exists yet
    LatestSegmentAge(Option<Duration>),
    /// Raw TS byte counters since the previous check
    BytesSinceLastCheck { delta: u64, total: u64 },
}

/// Verdict derived from an observation against the session's thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthVerdict {
    Ok,
    Stale,
    NoData,
}

/// One health monitor observation
///
/// Created each poll tick, consumed immediately by the state machine, and
/// retained only in the metrics aggregator's short rolling window.
#[derive(Debug, Clone)]
pub struct HealthSample {
    pub session_key: String,
    pub observed_at: DateTime<Utc>,
    pub observation: HealthObservation,
    pub verdict: HealthVerdict,
}

/// Classified cause of a session failure
///
/// All kinds are retryable up to the policy limit; none are fatal to the
/// monitor process itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UpstreamUnreachable,
    NoDataProduced,
    ProcessExited,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::UpstreamUnreachable => "upstream_unreachable",
            FailureKind::NoDataProduced => "no_data_produced",
            FailureKind::ProcessExited => "process_exited",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_teardown_reachable_from_any_state() {
        for state in [
            SessionState::Starting,
            SessionState::Healthy,
            SessionState::Stale,
            SessionState::Failed,
            SessionState::Stopped,
        ] {
            assert!(state.can_transition_to(SessionState::Stopped));
        }
    }

    #[test]
    fn test_health_failure_never_leaves_stopped() {
        for next in [
            SessionState::Starting,
            SessionState::Healthy,
            SessionState::Stale,
            SessionState::Failed,
        ] {
            assert!(!SessionState::Stopped.can_transition_to(next));
        }
    }

    #[test]
    fn test_stale_recovers_or_fails() {
        assert!(SessionState::Stale.can_transition_to(SessionState::Healthy));
        assert!(SessionState::Stale.can_transition_to(SessionState::Failed));
        assert!(!SessionState::Stale.can_transition_to(SessionState::Starting));
    }

    #[test]
    fn test_retry_reenters_starting_only_from_failed() {
        assert!(SessionState::Failed.can_transition_to(SessionState::Starting));
        assert!(!SessionState::Healthy.can_transition_to(SessionState::Starting));
        assert!(!SessionState::Starting.can_transition_to(SessionState::Stale));
    }

    #[test]
    fn test_poll_interval_floors_at_minimum() {
        let record = SessionRecord::new(
            "k",
            "p",
            "http://upstream/stream",
            StreamFormat::Hls,
            "default",
            Duration::from_secs(4),
        );
        // hls_time=4 -> floor(4/2)=2, clamped up to the 3s minimum
        assert_eq!(
            record.poll_interval(Duration::from_secs(3)),
            Duration::from_secs(3)
        );

        let record = SessionRecord::new(
            "k",
            "p",
            "http://upstream/stream",
            StreamFormat::Hls,
            "default",
            Duration::from_secs(10),
        );
        assert_eq!(
            record.poll_interval(Duration::from_secs(3)),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_stale_threshold_uses_multiplier() {
        let record = SessionRecord::new(
            "k",
            "p",
            "http://upstream/stream",
            StreamFormat::Hls,
            "default",
            Duration::from_secs(4),
        );
        assert_eq!(record.stale_threshold(3), Duration::from_secs(12));
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("hls".parse::<StreamFormat>().unwrap(), StreamFormat::Hls);
        assert_eq!("mpegts".parse::<StreamFormat>().unwrap(), StreamFormat::Ts);
        assert!("flv".parse::<StreamFormat>().is_err());
    }
}
