//! Retry coordination for failed sessions
//!
//! When a session fails, viewers stay attached while the coordinator tears
//! down the dead process, waits out an escalating backoff, and relaunches the
//! upstream fetch. The session's `retry_count` doubles as the backoff index;
//! it only resets when the session returns to Healthy, so a stream that keeps
//! failing walks the backoff sequence and is eventually declared permanently
//! failed. Permanent failures disconnect viewers and leave the Failed record
//! in place so admission keeps rejecting the key until an operator frees it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::config::{RelayConfig, StreamingConfig};
use crate::errors::AppResult;
use crate::models::TranscodeProfile;
use crate::models::session::{FailureKind, SessionState};
use crate::registry::SessionRegistry;
use crate::services::metrics_aggregator::MetricsAggregator;
use crate::services::process_launcher::{ProcessLauncher, ProcessTable};
use crate::services::scheduler::TaskScheduler;

/// Receives session failures detected by the health monitor
#[async_trait]
pub trait FailureHandler: Send + Sync {
    async fn on_session_failed(
        &self,
        session_key: &str,
        kind: FailureKind,
    ) -> AppResult<FailureOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// A reconnect attempt was scheduled
    Scheduled { attempt: u32, delay: Duration },
    /// Attempts exhausted; the session stays Failed until explicitly freed
    PermanentlyFailed,
    /// The session disappeared before the failure could be handled
    SessionGone,
}

struct CoordinatorInner {
    registry: Arc<SessionRegistry>,
    processes: Arc<ProcessTable>,
    launcher: Arc<dyn ProcessLauncher>,
    profiles: HashMap<String, TranscodeProfile>,
    scheduler: TaskScheduler,
    metrics: Arc<MetricsAggregator>,
    backoff: Vec<Duration>,
    monitor_tries: u32,
    probe_client: reqwest::Client,
    probe_timeout: Duration,
}

#[derive(Clone)]
pub struct RetryCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl RetryCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<SessionRegistry>,
        processes: Arc<ProcessTable>,
        launcher: Arc<dyn ProcessLauncher>,
        profiles: HashMap<String, TranscodeProfile>,
        scheduler: TaskScheduler,
        metrics: Arc<MetricsAggregator>,
        relay: &RelayConfig,
        streaming: &StreamingConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                registry,
                processes,
                launcher,
                profiles,
                scheduler,
                metrics,
                backoff: relay.retry_backoff.clone(),
                monitor_tries: streaming.monitor_tries,
                probe_client: reqwest::Client::new(),
                probe_timeout: relay.upstream_probe_timeout,
            }),
        }
    }

    /// Backoff before reconnect attempt `attempt` (1-based); the last entry
    /// is held for all further attempts.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let inner = &self.inner;
        let index = (attempt.max(1) as usize - 1).min(inner.backoff.len().saturating_sub(1));
        inner
            .backoff
            .get(index)
            .copied()
            .unwrap_or(Duration::from_secs(60))
    }

    /// Up to 10% random spread so simultaneous failures do not reconnect in
    /// lockstep against the same upstream.
    fn jittered(&self, delay: Duration) -> Duration {
        let spread = delay.as_millis() as u64 / 10;
        if spread == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..=spread))
    }

    /// Distinguish a dead upstream from a live one producing nothing
    async fn classify(&self, upstream_url: &str, reported: FailureKind) -> FailureKind {
        if reported != FailureKind::NoDataProduced {
            return reported;
        }
        let probe = self
            .inner
            .probe_client
            .head(upstream_url)
            .timeout(self.inner.probe_timeout)
            .send()
            .await;
        match probe {
            Ok(response) if response.status().is_success() => FailureKind::NoDataProduced,
            Ok(response) => {
                debug!(upstream_url, status = %response.status(), "upstream probe rejected");
                FailureKind::UpstreamUnreachable
            }
            Err(e) => {
                debug!(upstream_url, "upstream probe failed: {e}");
                FailureKind::UpstreamUnreachable
            }
        }
    }

    pub async fn handle_failure(
        &self,
        session_key: &str,
        kind: FailureKind,
    ) -> AppResult<FailureOutcome> {
        let inner = &self.inner;
        let Some(record) = inner.registry.attach(session_key).await? else {
            return Ok(FailureOutcome::SessionGone);
        };
        if record.state == SessionState::Stopped {
            return Ok(FailureOutcome::SessionGone);
        }

        let kind = self.classify(&record.upstream_url, kind).await;

        // The monitor usually moved the record to Failed already; racing
        // teardown makes that transition a benign no-op here.
        inner
            .registry
            .transition(
                session_key,
                &[
                    SessionState::Starting,
                    SessionState::Healthy,
                    SessionState::Stale,
                ],
                SessionState::Failed,
            )
            .await?;

        if record.retry_count >= inner.monitor_tries {
            error!(
                session_key,
                retry_count = record.retry_count,
                %kind,
                "session permanently failed, disconnecting viewers"
            );
            inner.metrics.record_failure(session_key, kind, true).await;
            inner.processes.kill_and_remove(session_key).await?;
            return Ok(FailureOutcome::PermanentlyFailed);
        }

        let attempt = inner.registry.store().bump_retry(session_key).await?;
        let delay = self.jittered(self.backoff_delay(attempt));
        inner.metrics.record_failure(session_key, kind, false).await;

        info!(
            session_key,
            %kind,
            attempt,
            max_attempts = inner.monitor_tries,
            delay = %humantime::format_duration(delay),
            viewers = record.viewer_count,
            "scheduling session reconnect"
        );

        inner.scheduler.spawn_after(
            &format!("reconnect:{session_key}"),
            delay,
            self.reconnect(session_key),
        );

        Ok(FailureOutcome::Scheduled { attempt, delay })
    }

    /// Relaunch the upstream for a Failed session, restarting its grace
    /// period. Boxed at the definition: the relaunch-failure path re-enters
    /// `handle_failure`, which schedules this again, and the box keeps the
    /// two future types from referring to each other.
    fn reconnect(&self, session_key: &str) -> BoxFuture<'static, ()> {
        let coordinator = self.clone();
        let key = session_key.to_string();
        Box::pin(async move { coordinator.try_reconnect(&key).await })
    }

    async fn try_reconnect(&self, session_key: &str) {
        let inner = &self.inner;
        let record = match inner.registry.attach(session_key).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(session_key, "reconnect skipped, session removed");
                return;
            }
            Err(e) => {
                warn!(session_key, "reconnect aborted, registry read failed: {e}");
                return;
            }
        };

        if record.state != SessionState::Failed {
            debug!(session_key, state = %record.state, "reconnect skipped, state changed");
            return;
        }
        if record.viewer_count == 0 {
            debug!(session_key, "reconnect skipped, no viewers remain");
            return;
        }

        let Some(profile) = inner.profiles.get(&record.profile_name) else {
            error!(
                session_key,
                profile = %record.profile_name,
                "reconnect aborted, profile no longer configured"
            );
            return;
        };

        if let Err(e) = inner
            .registry
            .store()
            .reset_for_restart(session_key, Utc::now())
            .await
        {
            warn!(session_key, "reconnect aborted, restart reset failed: {e}");
            return;
        }

        match inner.launcher.launch(&record, profile).await {
            Ok(process) => {
                inner.processes.insert(session_key, process).await;
                match inner
                    .registry
                    .transition(session_key, &[SessionState::Failed], SessionState::Starting)
                    .await
                {
                    Ok(Some(_)) => {
                        info!(
                            session_key,
                            attempt = record.retry_count,
                            viewers = record.viewer_count,
                            "upstream relaunched, session re-entering startup"
                        );
                    }
                    Ok(None) => {
                        // Torn down while we were launching; release the orphan
                        warn!(session_key, "session changed under reconnect, killing orphan");
                        if let Err(e) = inner.processes.kill_and_remove(session_key).await {
                            warn!(session_key, "orphan cleanup failed: {e}");
                        }
                    }
                    Err(e) => warn!(session_key, "reconnect transition failed: {e}"),
                }
            }
            Err(e) => {
                warn!(session_key, "relaunch failed: {e}");
                if let Err(e) = self
                    .handle_failure(session_key, FailureKind::UpstreamUnreachable)
                    .await
                {
                    warn!(session_key, "failed to record relaunch failure: {e}");
                }
            }
        }
    }
}

#[async_trait]
impl FailureHandler for RetryCoordinator {
    async fn on_session_failed(
        &self,
        session_key: &str,
        kind: FailureKind,
    ) -> AppResult<FailureOutcome> {
        self.handle_failure(session_key, kind).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::LaunchError;
    use crate::models::session::{SessionRecord, StreamFormat};
    use crate::registry::MemoryRegistryStore;
    use crate::services::admission::AdmissionLimits;
    use crate::services::process_launcher::UpstreamProcess;
    use crate::services::process_launcher::test_support::FakeProcess;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StubLauncher {
        launches: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl ProcessLauncher for StubLauncher {
        async fn launch(
            &self,
            _record: &SessionRecord,
            _profile: &TranscodeProfile,
        ) -> Result<Box<dyn UpstreamProcess>, LaunchError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(LaunchError::SpawnFailed {
                    message: "stub".to_string(),
                });
            }
            Ok(Box::new(FakeProcess::running()))
        }
    }

    fn profile() -> TranscodeProfile {
        TranscodeProfile {
            name: "default".to_string(),
            format: StreamFormat::Hls,
            segment_interval: Duration::from_secs(4),
            args_template: Vec::new(),
            parameters: HashMap::new(),
        }
    }

    fn record(key: &str) -> SessionRecord {
        SessionRecord::new(
            key,
            "provider-1",
            "http://127.0.0.1:1/stream",
            StreamFormat::Hls,
            "default",
            Duration::from_secs(4),
        )
    }

    fn coordinator(registry: Arc<SessionRegistry>, fail_launch: bool) -> RetryCoordinator {
        let metrics = Arc::new(MetricsAggregator::new(
            registry.clone(),
            AdmissionLimits::default(),
            &crate::config::MetricsConfig::default(),
        ));
        RetryCoordinator::new(
            registry,
            Arc::new(ProcessTable::new()),
            Arc::new(StubLauncher {
                launches: AtomicU32::new(0),
                fail: fail_launch,
            }),
            HashMap::from([("default".to_string(), profile())]),
            TaskScheduler::new(),
            metrics,
            &RelayConfig::default(),
            &StreamingConfig::default(),
        )
    }

    #[test]
    fn test_backoff_sequence_holds_last_entry() {
        let registry = Arc::new(SessionRegistry::new(Arc::new(MemoryRegistryStore::new())));
        let coordinator = coordinator(registry, false);
        assert_eq!(coordinator.backoff_delay(1), Duration::from_secs(60));
        assert_eq!(coordinator.backoff_delay(2), Duration::from_secs(120));
        assert_eq!(coordinator.backoff_delay(3), Duration::from_secs(300));
        assert_eq!(coordinator.backoff_delay(4), Duration::from_secs(300));
        assert_eq!(coordinator.backoff_delay(9), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_failure_schedules_reconnect_and_bumps_retry() {
        let registry = Arc::new(SessionRegistry::new(Arc::new(MemoryRegistryStore::new())));
        registry.create_or_get(record("s1")).await.unwrap();
        registry.increment_viewer("s1").await.unwrap();

        let coordinator = coordinator(registry.clone(), false);
        let outcome = coordinator
            .handle_failure("s1", FailureKind::ProcessExited)
            .await
            .unwrap();

        assert!(matches!(outcome, FailureOutcome::Scheduled { attempt: 1, .. }));
        let after = registry.attach("s1").await.unwrap().unwrap();
        assert_eq!(after.state, SessionState::Failed);
        assert_eq!(after.retry_count, 1);
        // Viewers stay attached through the backoff
        assert_eq!(after.viewer_count, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_become_permanent() {
        let registry = Arc::new(SessionRegistry::new(Arc::new(MemoryRegistryStore::new())));
        registry.create_or_get(record("s1")).await.unwrap();
        let store = registry.store();
        for _ in 0..3 {
            store.bump_retry("s1").await.unwrap();
        }

        let coordinator = coordinator(registry.clone(), false);
        let outcome = coordinator
            .handle_failure("s1", FailureKind::ProcessExited)
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::PermanentlyFailed);

        // Record stays Failed so admission keeps rejecting the key
        let after = registry.attach("s1").await.unwrap().unwrap();
        assert_eq!(after.state, SessionState::Failed);
    }

    #[tokio::test]
    async fn test_missing_session_is_benign() {
        let registry = Arc::new(SessionRegistry::new(Arc::new(MemoryRegistryStore::new())));
        let coordinator = coordinator(registry, false);
        let outcome = coordinator
            .handle_failure("ghost", FailureKind::ProcessExited)
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::SessionGone);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_relaunches_and_restarts_grace() {
        let registry = Arc::new(SessionRegistry::new(Arc::new(MemoryRegistryStore::new())));
        registry.create_or_get(record("s1")).await.unwrap();
        registry.increment_viewer("s1").await.unwrap();

        let coordinator = coordinator(registry.clone(), false);
        coordinator
            .handle_failure("s1", FailureKind::ProcessExited)
            .await
            .unwrap();

        // Jitter adds at most 10% to the 60s base delay
        tokio::time::advance(Duration::from_secs(67)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        let after = registry.attach("s1").await.unwrap().unwrap();
        assert_eq!(after.state, SessionState::Starting);
        assert!(coordinator.inner.processes.contains("s1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_relaunch_schedules_next_attempt() {
        let registry = Arc::new(SessionRegistry::new(Arc::new(MemoryRegistryStore::new())));
        registry.create_or_get(record("s1")).await.unwrap();
        registry.increment_viewer("s1").await.unwrap();

        let coordinator = coordinator(registry.clone(), true);
        coordinator
            .handle_failure("s1", FailureKind::ProcessExited)
            .await
            .unwrap();

        // The first reconnect fires after the 60s backoff and its relaunch
        // fails, which consumes another attempt and reschedules
        tokio::time::advance(Duration::from_secs(67)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        let after = registry.attach("s1").await.unwrap().unwrap();
        assert_eq!(after.state, SessionState::Failed);
        assert_eq!(after.retry_count, 2);
        assert!(!coordinator.inner.processes.contains("s1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_skipped_when_no_viewers() {
        let registry = Arc::new(SessionRegistry::new(Arc::new(MemoryRegistryStore::new())));
        registry.create_or_get(record("s1")).await.unwrap();

        let coordinator = coordinator(registry.clone(), false);
        coordinator
            .handle_failure("s1", FailureKind::ProcessExited)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(67)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        let after = registry.attach("s1").await.unwrap().unwrap();
        assert_eq!(after.state, SessionState::Failed);
        assert!(!coordinator.inner.processes.contains("s1").await);
    }
}
