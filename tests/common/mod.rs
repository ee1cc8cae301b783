//! Shared fixtures for integration tests
//!
//! Builds the full service stack against the in-memory registry, a scripted
//! health probe, and a launcher that hands out fake processes instead of
//! spawning ffmpeg.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use shared_stream_monitor::config::{Config, LimitsConfig};
use shared_stream_monitor::errors::{LaunchError, MonitorError};
use shared_stream_monitor::models::TranscodeProfile;
use shared_stream_monitor::models::session::{
    HealthObservation, SessionRecord, StreamFormat,
};
use shared_stream_monitor::registry::{MemoryRegistryStore, SessionRegistry};
use shared_stream_monitor::services::{
    AdmissionController, AdmissionLimits, HealthMonitor, HealthProbe, MetricsAggregator,
    ProcessLauncher, ProcessTable, RetryCoordinator, SessionManager, TaskScheduler,
    UpstreamProcess,
};
use shared_stream_monitor::web::AppState;

pub struct StubProcess {
    running: Arc<AtomicBool>,
    /// Per-process kill state: killing a replaced handle must not flip the
    /// shared `running` control flag and mark its replacement dead
    killed: AtomicBool,
    bytes: Arc<AtomicU64>,
}

#[async_trait]
impl UpstreamProcess for StubProcess {
    fn bytes_produced(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    fn segment_dir(&self) -> Option<&Path> {
        None
    }

    fn is_running(&mut self) -> bool {
        self.running.load(Ordering::Relaxed) && !self.killed.load(Ordering::Relaxed)
    }

    async fn kill(&mut self) -> Result<(), LaunchError> {
        self.killed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// Launcher whose processes share one externally controlled liveness flag
pub struct StubLauncher {
    pub launches: Arc<AtomicU32>,
    pub running: Arc<AtomicBool>,
    pub fail: Arc<AtomicBool>,
}

impl StubLauncher {
    pub fn new() -> Self {
        Self {
            launches: Arc::new(AtomicU32::new(0)),
            running: Arc::new(AtomicBool::new(true)),
            fail: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl ProcessLauncher for StubLauncher {
    async fn launch(
        &self,
        _record: &SessionRecord,
        _profile: &TranscodeProfile,
    ) -> Result<Box<dyn UpstreamProcess>, LaunchError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(LaunchError::SpawnFailed {
                message: "stub launcher configured to fail".to_string(),
            });
        }
        Ok(Box::new(StubProcess {
            running: self.running.clone(),
            killed: AtomicBool::new(false),
            bytes: Arc::new(AtomicU64::new(0)),
        }))
    }
}

/// Probe returning whatever observation the test scripted last
pub struct ScriptedProbe {
    observation: std::sync::Mutex<HealthObservation>,
}

impl ScriptedProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            observation: std::sync::Mutex::new(HealthObservation::LatestSegmentAge(Some(
                Duration::from_secs(1),
            ))),
        })
    }

    pub fn set(&self, observation: HealthObservation) {
        *self.observation.lock().unwrap() = observation;
    }

    pub fn fresh_segment(&self) {
        self.set(HealthObservation::LatestSegmentAge(Some(Duration::from_secs(1))));
    }

    pub fn segment_age(&self, secs: u64) {
        self.set(HealthObservation::LatestSegmentAge(Some(
            Duration::from_secs(secs),
        )));
    }

    pub fn no_segments(&self) {
        self.set(HealthObservation::LatestSegmentAge(None));
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn observe(
        &self,
        _record: &SessionRecord,
    ) -> Result<HealthObservation, MonitorError> {
        Ok(*self.observation.lock().unwrap())
    }
}

pub fn test_profile() -> TranscodeProfile {
    TranscodeProfile {
        name: "sd".to_string(),
        format: StreamFormat::Hls,
        segment_interval: Duration::from_secs(4),
        args_template: vec![
            "-c:v".to_string(),
            "libx264".to_string(),
            "-b:v".to_string(),
            "{bitrate}".to_string(),
        ],
        parameters: HashMap::from([("bitrate".to_string(), "2000k".to_string())]),
    }
}

pub struct Harness {
    pub registry: Arc<SessionRegistry>,
    pub processes: Arc<ProcessTable>,
    pub manager: Arc<SessionManager>,
    pub monitor: Arc<HealthMonitor>,
    pub metrics: Arc<MetricsAggregator>,
    pub probe: Arc<ScriptedProbe>,
    pub launcher_launches: Arc<AtomicU32>,
    pub launcher_running: Arc<AtomicBool>,
    pub launcher_fail: Arc<AtomicBool>,
    pub scheduler: TaskScheduler,
}

impl Harness {
    pub fn app_state(&self) -> AppState {
        AppState {
            manager: self.manager.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

pub fn harness(max_connections: u32) -> Harness {
    let mut config = Config::default();
    config.limits = LimitsConfig {
        default_max_connections: max_connections,
        ..LimitsConfig::default()
    };
    harness_with_config(config)
}

pub fn harness_with_config(config: Config) -> Harness {
    let registry = Arc::new(SessionRegistry::new(Arc::new(MemoryRegistryStore::new())));
    let processes = Arc::new(ProcessTable::new());
    let scheduler = TaskScheduler::new();
    let probe = ScriptedProbe::new();
    let limits = AdmissionLimits::from_config(&config.limits);
    let profiles = HashMap::from([("sd".to_string(), test_profile())]);

    let launcher = Arc::new(StubLauncher::new());
    let launcher_launches = launcher.launches.clone();
    let launcher_running = launcher.running.clone();
    let launcher_fail = launcher.fail.clone();

    let metrics = Arc::new(MetricsAggregator::new(
        registry.clone(),
        limits.clone(),
        &config.metrics,
    ));
    let coordinator = RetryCoordinator::new(
        registry.clone(),
        processes.clone(),
        launcher.clone(),
        profiles.clone(),
        scheduler.clone(),
        metrics.clone(),
        &config.relay,
        &config.streaming,
    );
    let monitor = Arc::new(HealthMonitor::new(
        registry.clone(),
        processes.clone(),
        probe.clone(),
        metrics.clone(),
        Arc::new(coordinator),
        scheduler.clone(),
        &config.streaming,
    ));
    let admission = Arc::new(AdmissionController::new(
        registry.clone(),
        limits,
        config.streaming.monitor_tries,
        config.limits.retry_after,
    ));
    let manager = Arc::new(SessionManager::new(
        registry.clone(),
        admission,
        processes.clone(),
        launcher,
        profiles,
        monitor.clone(),
        scheduler.clone(),
        &config.streaming,
    ));

    Harness {
        registry,
        processes,
        manager,
        monitor,
        metrics,
        probe,
        launcher_launches,
        launcher_running,
        launcher_fail,
        scheduler,
    }
}
