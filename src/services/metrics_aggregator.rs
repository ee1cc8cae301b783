//! Metrics & alert aggregation
//!
//! Rolls the registry and the health monitor's recent samples up into
//! counters for dashboards, and raises threshold-based alerts: a danger
//! alert when a provider sits at its connection ceiling and when failures
//! burst within the rolling window. Read-only over the registry; never
//! mutates session state.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use utoipa::ToSchema;

use crate::config::MetricsConfig;
use crate::errors::RegistryError;
use crate::models::session::{FailureKind, HealthSample, HealthVerdict, SessionState};
use crate::registry::SessionRegistry;
use crate::services::admission::AdmissionLimits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Danger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    CapacityNear,
    CapacityReached,
    FailureBurst,
    SessionPermanentlyFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub kind: AlertKind,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// Point-in-time rollup of registry state
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StatsSnapshot {
    pub active_sessions: usize,
    pub connections_by_provider: HashMap<String, u32>,
    pub stale_count: usize,
    pub failed_count: usize,
    pub total_viewers: u32,
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SessionSummary {
    pub session_key: String,
    pub provider_id: String,
    pub state: SessionState,
    pub viewer_count: u32,
    pub retry_count: u32,
    pub seconds_since_last_healthy: Option<i64>,
}

struct FailureEvent {
    at: Instant,
    session_key: String,
    kind: FailureKind,
    permanent: bool,
}

pub struct MetricsAggregator {
    registry: Arc<SessionRegistry>,
    limits: AdmissionLimits,
    sample_window: Duration,
    failure_alert_threshold: u32,
    samples: Mutex<VecDeque<(Instant, HealthSample)>>,
    failures: Mutex<VecDeque<FailureEvent>>,
}

impl MetricsAggregator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        limits: AdmissionLimits,
        config: &MetricsConfig,
    ) -> Self {
        Self {
            registry,
            limits,
            sample_window: config.sample_window,
            failure_alert_threshold: config.failure_alert_threshold,
            samples: Mutex::new(VecDeque::new()),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Record one health observation; retained only within the rolling window
    pub async fn record_sample(&self, sample: HealthSample) {
        let mut samples = self.samples.lock().await;
        samples.push_back((Instant::now(), sample));
        Self::prune(&mut samples, self.sample_window, |(at, _)| *at);
    }

    /// Record a session failure, permanent or retryable
    pub async fn record_failure(&self, session_key: &str, kind: FailureKind, permanent: bool) {
        let mut failures = self.failures.lock().await;
        failures.push_back(FailureEvent {
            at: Instant::now(),
            session_key: session_key.to_string(),
            kind,
            permanent,
        });
        Self::prune(&mut failures, self.sample_window, |e| e.at);
    }

    /// Point-in-time counters; eventually consistent with the registry
    pub async fn snapshot(&self) -> Result<StatsSnapshot, RegistryError> {
        let records = self.registry.list_active().await?;
        let now = Utc::now();

        let mut connections_by_provider: HashMap<String, u32> = HashMap::new();
        let mut stale_count = 0;
        let mut failed_count = 0;
        let mut total_viewers = 0;
        let mut sessions = Vec::with_capacity(records.len());

        for record in &records {
            *connections_by_provider
                .entry(record.provider_id.clone())
                .or_insert(0) += record.viewer_count;
            total_viewers += record.viewer_count;
            match record.state {
                SessionState::Stale => stale_count += 1,
                SessionState::Failed => failed_count += 1,
                _ => {}
            }
            sessions.push(SessionSummary {
                session_key: record.session_key.clone(),
                provider_id: record.provider_id.clone(),
                state: record.state,
                viewer_count: record.viewer_count,
                retry_count: record.retry_count,
                seconds_since_last_healthy: record
                    .last_healthy_at
                    .map(|at| (now - at).num_seconds()),
            });
        }

        Ok(StatsSnapshot {
            active_sessions: records.len(),
            connections_by_provider,
            stale_count,
            failed_count,
            total_viewers,
            sessions,
        })
    }

    /// Current alerts derived from the snapshot and the failure window
    pub async fn alerts(&self) -> Result<Vec<Alert>, RegistryError> {
        let snapshot = self.snapshot().await?;
        let now = Utc::now();
        let mut alerts = Vec::new();

        for (provider_id, active) in &snapshot.connections_by_provider {
            let max = self.limits.max_for(provider_id);
            if max == 0 {
                continue;
            }
            if *active >= max {
                alerts.push(Alert {
                    severity: AlertSeverity::Danger,
                    kind: AlertKind::CapacityReached,
                    message: format!("Provider {provider_id} at capacity: {active}/{max} connections"),
                    raised_at: now,
                });
            } else if *active * 10 >= max * 8 {
                alerts.push(Alert {
                    severity: AlertSeverity::Warning,
                    kind: AlertKind::CapacityNear,
                    message: format!(
                        "Provider {provider_id} approaching capacity: {active}/{max} connections"
                    ),
                    raised_at: now,
                });
            }
        }

        let mut failures = self.failures.lock().await;
        Self::prune(&mut failures, self.sample_window, |e| e.at);

        for event in failures.iter().filter(|e| e.permanent) {
            alerts.push(Alert {
                severity: AlertSeverity::Danger,
                kind: AlertKind::SessionPermanentlyFailed,
                message: format!(
                    "Session {} permanently failed ({})",
                    event.session_key, event.kind
                ),
                raised_at: now,
            });
        }

        if failures.len() as u32 >= self.failure_alert_threshold {
            alerts.push(Alert {
                severity: AlertSeverity::Danger,
                kind: AlertKind::FailureBurst,
                message: format!(
                    "{} session failures within the last {}",
                    failures.len(),
                    humantime::format_duration(self.sample_window)
                ),
                raised_at: now,
            });
        }

        Ok(alerts)
    }

    /// Count of stale verdicts observed in the current window
    pub async fn stale_samples_in_window(&self) -> usize {
        let mut samples = self.samples.lock().await;
        Self::prune(&mut samples, self.sample_window, |(at, _)| *at);
        samples
            .iter()
            .filter(|(_, s)| s.verdict != HealthVerdict::Ok)
            .count()
    }

    fn prune<T>(window: &mut VecDeque<T>, max_age: Duration, at: impl Fn(&T) -> Instant) {
        let now = Instant::now();
        while let Some(front) = window.front() {
            if now.duration_since(at(front)) > max_age {
                window.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::session::{HealthObservation, SessionRecord, StreamFormat};
    use crate::registry::MemoryRegistryStore;

    fn aggregator(limits: AdmissionLimits) -> (Arc<SessionRegistry>, MetricsAggregator) {
        let registry = Arc::new(SessionRegistry::new(Arc::new(MemoryRegistryStore::new())));
        let aggregator = MetricsAggregator::new(registry.clone(), limits, &MetricsConfig::default());
        (registry, aggregator)
    }

    fn record(key: &str, provider: &str) -> SessionRecord {
        SessionRecord::new(
            key,
            provider,
            "http://upstream/stream",
            StreamFormat::Hls,
            "default",
            Duration::from_secs(4),
        )
    }

    #[tokio::test]
    async fn test_snapshot_counts_by_state_and_provider() {
        let (registry, aggregator) = aggregator(AdmissionLimits::default());
        registry.create_or_get(record("a", "p1")).await.unwrap();
        registry.create_or_get(record("b", "p1")).await.unwrap();
        registry.create_or_get(record("c", "p2")).await.unwrap();

        registry.increment_viewer("a").await.unwrap();
        registry.increment_viewer("a").await.unwrap();
        registry.increment_viewer("c").await.unwrap();

        let store = registry.store();
        store
            .compare_and_swap_state("b", SessionState::Starting, SessionState::Failed)
            .await
            .unwrap();

        let snapshot = aggregator.snapshot().await.unwrap();
        assert_eq!(snapshot.active_sessions, 3);
        assert_eq!(snapshot.failed_count, 1);
        assert_eq!(snapshot.stale_count, 0);
        assert_eq!(snapshot.total_viewers, 3);
        assert_eq!(snapshot.connections_by_provider.get("p1"), Some(&2));
        assert_eq!(snapshot.connections_by_provider.get("p2"), Some(&1));
    }

    #[tokio::test]
    async fn test_capacity_reached_raises_danger_alert() {
        let limits = AdmissionLimits::new(0, HashMap::from([("p1".to_string(), 2)]));
        let (registry, aggregator) = aggregator(limits);
        registry.create_or_get(record("a", "p1")).await.unwrap();
        registry.increment_viewer("a").await.unwrap();
        registry.increment_viewer("a").await.unwrap();

        let alerts = aggregator.alerts().await.unwrap();
        assert!(alerts.iter().any(|a| a.kind == AlertKind::CapacityReached
            && a.severity == AlertSeverity::Danger));
    }

    #[tokio::test]
    async fn test_failure_burst_alert() {
        let (_registry, aggregator) = aggregator(AdmissionLimits::default());
        for key in ["a", "b", "c"] {
            aggregator
                .record_failure(key, FailureKind::NoDataProduced, false)
                .await;
        }

        let alerts = aggregator.alerts().await.unwrap();
        assert!(alerts.iter().any(|a| a.kind == AlertKind::FailureBurst));
    }

    #[tokio::test]
    async fn test_permanent_failure_alert() {
        let (_registry, aggregator) = aggregator(AdmissionLimits::default());
        aggregator
            .record_failure("dead", FailureKind::UpstreamUnreachable, true)
            .await;

        let alerts = aggregator.alerts().await.unwrap();
        assert!(
            alerts
                .iter()
                .any(|a| a.kind == AlertKind::SessionPermanentlyFailed)
        );
    }

    #[tokio::test]
    async fn test_samples_tracked_in_window() {
        let (_registry, aggregator) = aggregator(AdmissionLimits::default());
        aggregator
            .record_sample(HealthSample {
                session_key: "a".to_string(),
                observed_at: Utc::now(),
                observation: HealthObservation::LatestSegmentAge(Some(Duration::from_secs(13))),
                verdict: HealthVerdict::Stale,
            })
            .await;
        assert_eq!(aggregator.stale_samples_in_window().await, 1);
    }
}
