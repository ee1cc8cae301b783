//! Session health monitoring
//!
//! One poll loop per session, spawned when the upstream launches and exiting
//! when the record disappears or reaches Stopped. Each tick the probe reads
//! the session's output (segment freshness for HLS, byte flow for TS), the
//! verdict is applied to the state machine through compare-and-swap updates,
//! and failures are handed to the retry coordinator. A check that overruns
//! its poll interval forfeits the tick rather than stacking up behind it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::StreamingConfig;
use crate::errors::{AppResult, MonitorError};
use crate::models::session::{
    FailureKind, HealthObservation, HealthSample, HealthVerdict, SessionRecord, SessionState,
    StreamFormat,
};
use crate::registry::SessionRegistry;
use crate::services::metrics_aggregator::MetricsAggregator;
use crate::services::process_launcher::ProcessTable;
use crate::services::retry_coordinator::FailureHandler;
use crate::services::scheduler::TaskScheduler;

/// Reads a session's output freshness
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn observe(&self, record: &SessionRecord) -> Result<HealthObservation, MonitorError>;
}

/// Probe backed by the local process table: segment directory mtimes for
/// HLS, stdout byte counters for TS.
pub struct ProcessProbe {
    processes: Arc<ProcessTable>,
    /// Last seen byte totals per TS session, for delta computation
    last_totals: Mutex<HashMap<String, u64>>,
}

impl ProcessProbe {
    pub fn new(processes: Arc<ProcessTable>) -> Self {
        Self {
            processes,
            last_totals: Mutex::new(HashMap::new()),
        }
    }

    async fn newest_segment_age(
        &self,
        record: &SessionRecord,
    ) -> Result<Option<Duration>, MonitorError> {
        let Some(dir) = self.processes.segment_dir(&record.session_key).await else {
            return Err(MonitorError::ProcessMissing {
                session_key: record.session_key.clone(),
            });
        };

        let mut newest: Option<SystemTime> = None;
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("ts") {
                continue;
            }
            let modified = entry.metadata().await?.modified()?;
            if newest.is_none_or(|n| modified > n) {
                newest = Some(modified);
            }
        }

        Ok(newest.map(|mtime| {
            SystemTime::now()
                .duration_since(mtime)
                .unwrap_or(Duration::ZERO)
        }))
    }

    async fn byte_delta(&self, record: &SessionRecord) -> Result<HealthObservation, MonitorError> {
        let Some(total) = self.processes.bytes_produced(&record.session_key).await else {
            return Err(MonitorError::ProcessMissing {
                session_key: record.session_key.clone(),
            });
        };
        let mut totals = self.last_totals.lock().await;
        let last = totals.insert(record.session_key.clone(), total).unwrap_or(0);
        Ok(HealthObservation::BytesSinceLastCheck {
            delta: total.saturating_sub(last),
            total,
        })
    }
}

#[async_trait]
impl HealthProbe for ProcessProbe {
    async fn observe(&self, record: &SessionRecord) -> Result<HealthObservation, MonitorError> {
        match record.format {
            StreamFormat::Hls => Ok(HealthObservation::LatestSegmentAge(
                self.newest_segment_age(record).await?,
            )),
            StreamFormat::Ts => self.byte_delta(record).await,
        }
    }
}

pub struct HealthMonitor {
    registry: Arc<SessionRegistry>,
    processes: Arc<ProcessTable>,
    probe: Arc<dyn HealthProbe>,
    metrics: Arc<MetricsAggregator>,
    failures: Arc<dyn FailureHandler>,
    scheduler: TaskScheduler,
    grace_period: Duration,
    stale_multiplier: u32,
    min_check_interval: Duration,
    monitor_tries: u32,
}

impl HealthMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<SessionRegistry>,
        processes: Arc<ProcessTable>,
        probe: Arc<dyn HealthProbe>,
        metrics: Arc<MetricsAggregator>,
        failures: Arc<dyn FailureHandler>,
        scheduler: TaskScheduler,
        config: &StreamingConfig,
    ) -> Self {
        Self {
            registry,
            processes,
            probe,
            metrics,
            failures,
            scheduler,
            grace_period: config.segment_grace_period,
            stale_multiplier: config.stale_multiplier,
            min_check_interval: config.min_check_interval,
            monitor_tries: config.monitor_tries,
        }
    }

    /// Spawn the poll loop for a session. Idempotent to call again after a
    /// reconnect: the loop keys off the registry record, not the process.
    pub fn watch(self: &Arc<Self>, session_key: &str) {
        let monitor = self.clone();
        let key = session_key.to_string();
        self.scheduler.spawn(&format!("monitor:{session_key}"), async move {
            monitor.poll_loop(&key).await;
        });
    }

    async fn poll_loop(&self, session_key: &str) {
        debug!(session_key, "health poll loop started");
        loop {
            let record = match self.registry.attach(session_key).await {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(e) => {
                    warn!(session_key, "poll loop registry read failed: {e}");
                    tokio::time::sleep(self.min_check_interval).await;
                    continue;
                }
            };
            if record.state == SessionState::Stopped {
                break;
            }

            tokio::time::sleep(record.poll_interval(self.min_check_interval)).await;

            // Reconnect backoff in progress; nothing to probe
            if record.state == SessionState::Failed {
                continue;
            }

            if let Err(e) = self.check_once(session_key).await {
                warn!(session_key, "health check errored: {e}");
            }
        }
        debug!(session_key, "health poll loop exited");
    }

    /// Run one health check tick. Public so the session manager can force an
    /// immediate check.
    pub async fn check_once(&self, session_key: &str) -> AppResult<Option<HealthSample>> {
        let Some(record) = self.registry.attach(session_key).await? else {
            return Ok(None);
        };
        if matches!(record.state, SessionState::Stopped | SessionState::Failed) {
            return Ok(None);
        }

        let interval = record.poll_interval(self.min_check_interval);
        let now = Utc::now();

        // A dead process is a failure regardless of what the output looks like
        if self.processes.is_running(session_key).await == Some(false) {
            self.registry.store().mark_checked(session_key, now).await?;
            self.fail(session_key, FailureKind::ProcessExited).await;
            return Ok(None);
        }

        let observation =
            match tokio::time::timeout(interval, self.probe.observe(&record)).await {
                Ok(Ok(observation)) => observation,
                Ok(Err(MonitorError::ProcessMissing { .. })) => {
                    self.registry.store().mark_checked(session_key, now).await?;
                    self.fail(session_key, FailureKind::ProcessExited).await;
                    return Ok(None);
                }
                Ok(Err(e)) => {
                    // Transient probe trouble; skip the tick rather than
                    // failing the session on an I/O hiccup
                    warn!(session_key, "probe failed: {e}");
                    self.registry.store().mark_checked(session_key, now).await?;
                    return Ok(None);
                }
                Err(_) => {
                    warn!(
                        session_key,
                        timeout = ?interval,
                        "health check overran its interval, forfeiting tick"
                    );
                    self.registry.store().mark_checked(session_key, now).await?;
                    return Ok(None);
                }
            };

        let verdict = self.verdict(&record, &observation);
        self.registry.store().mark_checked(session_key, now).await?;

        let sample = HealthSample {
            session_key: session_key.to_string(),
            observed_at: now,
            observation,
            verdict,
        };
        self.metrics.record_sample(sample.clone()).await;

        self.apply(&record, verdict).await?;
        Ok(Some(sample))
    }

    fn verdict(&self, record: &SessionRecord, observation: &HealthObservation) -> HealthVerdict {
        match observation {
            HealthObservation::LatestSegmentAge(Some(age)) => {
                if *age <= record.stale_threshold(self.stale_multiplier) {
                    HealthVerdict::Ok
                } else {
                    HealthVerdict::Stale
                }
            }
            HealthObservation::LatestSegmentAge(None) => HealthVerdict::NoData,
            HealthObservation::BytesSinceLastCheck { delta, .. } => {
                if *delta > 0 {
                    HealthVerdict::Ok
                } else {
                    HealthVerdict::NoData
                }
            }
        }
    }

    async fn apply(&self, record: &SessionRecord, verdict: HealthVerdict) -> AppResult<()> {
        let session_key = record.session_key.as_str();
        let now = Utc::now();

        match (record.state, verdict) {
            (SessionState::Starting, HealthVerdict::Ok) => {
                if self
                    .registry
                    .transition(session_key, &[SessionState::Starting], SessionState::Healthy)
                    .await?
                    .is_some()
                {
                    self.registry.store().mark_healthy(session_key, now).await?;
                    info!(session_key, "session produced first data, now healthy");
                }
            }
            (SessionState::Starting, _) => {
                if record.starting_for(now) > self.grace_period {
                    warn!(
                        session_key,
                        grace = ?self.grace_period,
                        "no data within startup grace period"
                    );
                    self.fail(session_key, FailureKind::NoDataProduced).await;
                }
                // Still within grace; keep waiting
            }
            (SessionState::Healthy, HealthVerdict::Ok) => {
                self.registry.store().mark_healthy(session_key, now).await?;
            }
            (SessionState::Healthy, _) => {
                if self
                    .registry
                    .transition(session_key, &[SessionState::Healthy], SessionState::Stale)
                    .await?
                    .is_some()
                {
                    let strikes = self.registry.store().bump_retry(session_key).await?;
                    warn!(session_key, strikes, "session went stale");
                    if strikes >= self.monitor_tries {
                        self.fail(session_key, FailureKind::NoDataProduced).await;
                    }
                }
            }
            (SessionState::Stale, HealthVerdict::Ok) => {
                if self
                    .registry
                    .transition(session_key, &[SessionState::Stale], SessionState::Healthy)
                    .await?
                    .is_some()
                {
                    // mark_healthy also resets retry_count
                    self.registry.store().mark_healthy(session_key, now).await?;
                    info!(session_key, "stale session recovered");
                }
            }
            (SessionState::Stale, _) => {
                let strikes = self.registry.store().bump_retry(session_key).await?;
                debug!(session_key, strikes, "session still stale");
                if strikes >= self.monitor_tries {
                    self.fail(session_key, FailureKind::NoDataProduced).await;
                }
            }
            // Failed and Stopped are filtered out before apply
            (SessionState::Failed | SessionState::Stopped, _) => {}
        }
        Ok(())
    }

    async fn fail(&self, session_key: &str, kind: FailureKind) {
        let moved = self
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
            .await;
        match moved {
            // Only the CAS winner notifies the coordinator, so a failure is
            // handled exactly once
            Ok(Some(from)) => {
                warn!(session_key, %from, %kind, "session failed");
                if let Err(e) = self.failures.on_session_failed(session_key, kind).await {
                    warn!(session_key, "failure handler errored: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(session_key, "failure transition errored: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricsConfig;
    use crate::errors::AppError;
    use crate::models::session::StreamFormat;
    use crate::registry::MemoryRegistryStore;
    use crate::services::admission::AdmissionLimits;
    use crate::services::process_launcher::test_support::FakeProcess;
    use crate::services::retry_coordinator::FailureOutcome;
    use std::sync::atomic::Ordering;

    /// Probe returning a programmable observation
    struct StubProbe {
        observation: std::sync::Mutex<Result<HealthObservation, String>>,
    }

    impl StubProbe {
        fn new(observation: HealthObservation) -> Arc<Self> {
            Arc::new(Self {
                observation: std::sync::Mutex::new(Ok(observation)),
            })
        }

        fn set(&self, observation: HealthObservation) {
            *self.observation.lock().unwrap() = Ok(observation);
        }
    }

    #[async_trait]
    impl HealthProbe for StubProbe {
        async fn observe(
            &self,
            record: &SessionRecord,
        ) -> Result<HealthObservation, MonitorError> {
            self.observation
                .lock()
                .unwrap()
                .clone()
                .map_err(|message| MonitorError::ProbeFailed {
                    session_key: record.session_key.clone(),
                    message,
                })
        }
    }

    /// Failure handler that just records what it saw
    #[derive(Default)]
    struct RecordingHandler {
        seen: std::sync::Mutex<Vec<(String, FailureKind)>>,
    }

    #[async_trait]
    impl FailureHandler for RecordingHandler {
        async fn on_session_failed(
            &self,
            session_key: &str,
            kind: FailureKind,
        ) -> Result<FailureOutcome, AppError> {
            self.seen
                .lock()
                .unwrap()
                .push((session_key.to_string(), kind));
            Ok(FailureOutcome::Scheduled {
                attempt: 1,
                delay: Duration::from_secs(60),
            })
        }
    }

    struct Fixture {
        registry: Arc<SessionRegistry>,
        processes: Arc<ProcessTable>,
        probe: Arc<StubProbe>,
        handler: Arc<RecordingHandler>,
        monitor: Arc<HealthMonitor>,
    }

    async fn fixture(observation: HealthObservation) -> Fixture {
        let registry = Arc::new(SessionRegistry::new(Arc::new(MemoryRegistryStore::new())));
        let processes = Arc::new(ProcessTable::new());
        let probe = StubProbe::new(observation);
        let handler = Arc::new(RecordingHandler::default());
        let metrics = Arc::new(MetricsAggregator::new(
            registry.clone(),
            AdmissionLimits::default(),
            &MetricsConfig::default(),
        ));
        let monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            processes.clone(),
            probe.clone(),
            metrics,
            handler.clone(),
            TaskScheduler::new(),
            &StreamingConfig::default(),
        ));
        Fixture {
            registry,
            processes,
            probe,
            handler,
            monitor,
        }
    }

    fn record(key: &str) -> SessionRecord {
        SessionRecord::new(
            key,
            "provider-1",
            "http://upstream/stream",
            StreamFormat::Hls,
            "default",
            Duration::from_secs(4),
        )
    }

    async fn seed(fixture: &Fixture, key: &str) {
        fixture.registry.create_or_get(record(key)).await.unwrap();
        fixture
            .processes
            .insert(key, Box::new(FakeProcess::running()))
            .await;
    }

    #[tokio::test]
    async fn test_starting_session_becomes_healthy_on_fresh_segment() {
        let fx = fixture(HealthObservation::LatestSegmentAge(Some(Duration::from_secs(
            2,
        ))))
        .await;
        seed(&fx, "s1").await;

        let sample = fx.monitor.check_once("s1").await.unwrap().unwrap();
        assert_eq!(sample.verdict, HealthVerdict::Ok);

        let after = fx.registry.attach("s1").await.unwrap().unwrap();
        assert_eq!(after.state, SessionState::Healthy);
        assert!(after.last_healthy_at.is_some());
        assert_eq!(after.retry_count, 0);
    }

    #[tokio::test]
    async fn test_starting_session_waits_within_grace() {
        let fx = fixture(HealthObservation::LatestSegmentAge(None)).await;
        seed(&fx, "s1").await;

        fx.monitor.check_once("s1").await.unwrap();

        let after = fx.registry.attach("s1").await.unwrap().unwrap();
        assert_eq!(after.state, SessionState::Starting);
        assert!(fx.handler.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_starting_session_fails_once_after_grace() {
        let fx = fixture(HealthObservation::LatestSegmentAge(None)).await;
        seed(&fx, "s1").await;

        // Backdate the spawn past the 20s grace period
        let store = fx.registry.store();
        store
            .reset_for_restart("s1", Utc::now() - chrono::Duration::seconds(25))
            .await
            .unwrap();

        fx.monitor.check_once("s1").await.unwrap();
        // Second tick sees Failed and does nothing
        fx.monitor.check_once("s1").await.unwrap();

        let after = fx.registry.attach("s1").await.unwrap().unwrap();
        assert_eq!(after.state, SessionState::Failed);
        let seen = fx.handler.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], ("s1".to_string(), FailureKind::NoDataProduced));
    }

    #[tokio::test]
    async fn test_healthy_goes_stale_on_old_segment() {
        // hls_time=4, multiplier=3: threshold is 12s, a 13s old segment is stale
        let fx = fixture(HealthObservation::LatestSegmentAge(Some(Duration::from_secs(
            2,
        ))))
        .await;
        seed(&fx, "s1").await;
        fx.monitor.check_once("s1").await.unwrap();

        fx.probe
            .set(HealthObservation::LatestSegmentAge(Some(Duration::from_secs(13))));
        let sample = fx.monitor.check_once("s1").await.unwrap().unwrap();
        assert_eq!(sample.verdict, HealthVerdict::Stale);

        let after = fx.registry.attach("s1").await.unwrap().unwrap();
        assert_eq!(after.state, SessionState::Stale);
        assert_eq!(after.retry_count, 1);
    }

    #[tokio::test]
    async fn test_stale_session_recovers_and_resets_retries() {
        let fx = fixture(HealthObservation::LatestSegmentAge(Some(Duration::from_secs(
            2,
        ))))
        .await;
        seed(&fx, "s1").await;
        fx.monitor.check_once("s1").await.unwrap();

        fx.probe
            .set(HealthObservation::LatestSegmentAge(Some(Duration::from_secs(13))));
        fx.monitor.check_once("s1").await.unwrap();

        fx.probe
            .set(HealthObservation::LatestSegmentAge(Some(Duration::from_secs(1))));
        fx.monitor.check_once("s1").await.unwrap();

        let after = fx.registry.attach("s1").await.unwrap().unwrap();
        assert_eq!(after.state, SessionState::Healthy);
        assert_eq!(after.retry_count, 0);
        assert!(fx.handler.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persistent_staleness_fails_after_tries() {
        let fx = fixture(HealthObservation::LatestSegmentAge(Some(Duration::from_secs(
            2,
        ))))
        .await;
        seed(&fx, "s1").await;
        fx.monitor.check_once("s1").await.unwrap();

        fx.probe
            .set(HealthObservation::LatestSegmentAge(Some(Duration::from_secs(30))));
        // monitor_tries=3: stale strike on each tick, third strike fails
        fx.monitor.check_once("s1").await.unwrap();
        fx.monitor.check_once("s1").await.unwrap();
        fx.monitor.check_once("s1").await.unwrap();

        let after = fx.registry.attach("s1").await.unwrap().unwrap();
        assert_eq!(after.state, SessionState::Failed);
        assert_eq!(fx.handler.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dead_process_fails_session() {
        let fx = fixture(HealthObservation::LatestSegmentAge(Some(Duration::from_secs(
            1,
        ))))
        .await;
        fx.registry.create_or_get(record("s1")).await.unwrap();
        let process = FakeProcess::running();
        process.running.store(false, Ordering::Relaxed);
        fx.processes.insert("s1", Box::new(process)).await;

        fx.monitor.check_once("s1").await.unwrap();

        let after = fx.registry.attach("s1").await.unwrap().unwrap();
        assert_eq!(after.state, SessionState::Failed);
        let seen = fx.handler.seen.lock().unwrap();
        assert_eq!(seen[0].1, FailureKind::ProcessExited);
    }

    #[tokio::test]
    async fn test_process_probe_reads_segment_mtimes() {
        let dir = tempfile::tempdir().unwrap();
        let processes = Arc::new(ProcessTable::new());
        let mut process = FakeProcess::running();
        process.segment_dir = Some(dir.path().to_path_buf());
        processes.insert("s1", Box::new(process)).await;

        let probe = ProcessProbe::new(processes);
        let rec = record("s1");

        // An empty segment directory means no data yet
        let observed = probe.observe(&rec).await.unwrap();
        assert_eq!(observed, HealthObservation::LatestSegmentAge(None));

        tokio::fs::write(dir.path().join("seg0.ts"), b"payload")
            .await
            .unwrap();
        // Non-segment files are ignored
        tokio::fs::write(dir.path().join("playlist.m3u8"), b"#EXTM3U")
            .await
            .unwrap();

        match probe.observe(&rec).await.unwrap() {
            HealthObservation::LatestSegmentAge(Some(age)) => {
                assert!(age < Duration::from_secs(5));
            }
            other => panic!("unexpected observation: {other:?}"),
        }

        // No registered process at all is a hard error, not "no data"
        let ghost = record("ghost");
        assert!(matches!(
            probe.observe(&ghost).await,
            Err(MonitorError::ProcessMissing { .. })
        ));
    }

    #[tokio::test]
    async fn test_ts_byte_flow_judged_by_delta() {
        let fx = fixture(HealthObservation::BytesSinceLastCheck {
            delta: 4096,
            total: 4096,
        })
        .await;
        fx.registry
            .create_or_get(SessionRecord::new(
                "ts1",
                "provider-1",
                "http://upstream/stream",
                StreamFormat::Ts,
                "default",
                Duration::from_secs(4),
            ))
            .await
            .unwrap();
        fx.processes
            .insert("ts1", Box::new(FakeProcess::running()))
            .await;

        let sample = fx.monitor.check_once("ts1").await.unwrap().unwrap();
        assert_eq!(sample.verdict, HealthVerdict::Ok);

        fx.probe.set(HealthObservation::BytesSinceLastCheck {
            delta: 0,
            total: 4096,
        });
        let sample = fx.monitor.check_once("ts1").await.unwrap().unwrap();
        assert_eq!(sample.verdict, HealthVerdict::NoData);
    }
}
