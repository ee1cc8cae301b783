//! Session lifecycle orchestration
//!
//! The session manager is the single entry point the web layer talks to:
//! viewer attach/detach, explicit teardown, and process-wide shutdown. It
//! wires admission, process launching, health monitoring and idle reaping
//! together; the individual policies live in their own services.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StreamingConfig;
use crate::errors::{AppError, AppResult};
use crate::models::TranscodeProfile;
use crate::models::session::{SessionRecord, SessionState};
use crate::registry::{SessionRegistry, provider_counter};
use crate::services::admission::AdmissionController;
use crate::services::health_monitor::HealthMonitor;
use crate::services::process_launcher::{ProcessLauncher, ProcessTable};
use crate::services::scheduler::TaskScheduler;
use crate::services::task_pipeline::TaskPipeline;

/// A viewer's request to join a shared stream
#[derive(Debug, Clone)]
pub struct AttachRequest {
    pub provider_id: String,
    pub upstream_url: String,
    pub profile_name: String,
}

#[derive(Debug, Clone)]
pub struct AttachGrant {
    pub stream_handle: Uuid,
    pub session_key: String,
    pub viewer_count: u32,
    pub created: bool,
    pub state: SessionState,
}

pub struct SessionManager {
    registry: Arc<SessionRegistry>,
    admission: Arc<AdmissionController>,
    processes: Arc<ProcessTable>,
    launcher: Arc<dyn ProcessLauncher>,
    profiles: HashMap<String, TranscodeProfile>,
    monitor: Arc<HealthMonitor>,
    scheduler: TaskScheduler,
    idle_grace: Duration,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<SessionRegistry>,
        admission: Arc<AdmissionController>,
        processes: Arc<ProcessTable>,
        launcher: Arc<dyn ProcessLauncher>,
        profiles: HashMap<String, TranscodeProfile>,
        monitor: Arc<HealthMonitor>,
        scheduler: TaskScheduler,
        config: &StreamingConfig,
    ) -> Self {
        Self {
            registry,
            admission,
            processes,
            launcher,
            profiles,
            monitor,
            scheduler,
            idle_grace: config.idle_grace,
        }
    }

    /// One session per (provider, upstream, profile) combination
    pub fn session_key(request: &AttachRequest) -> String {
        let mut hasher = DefaultHasher::new();
        request.upstream_url.hash(&mut hasher);
        format!(
            "{}:{}:{:016x}",
            request.provider_id,
            request.profile_name,
            hasher.finish()
        )
    }

    /// Admit a viewer, launching the shared upstream when this is the first
    /// viewer for the key. A launch failure rolls the admission back so the
    /// provider's capacity is not leaked.
    pub async fn attach_viewer(&self, request: AttachRequest) -> AppResult<AttachGrant> {
        let profile = self
            .profiles
            .get(&request.profile_name)
            .ok_or_else(|| AppError::not_found("profile", &request.profile_name))?;

        let session_key = Self::session_key(&request);
        let template = SessionRecord::new(
            session_key.clone(),
            request.provider_id.clone(),
            request.upstream_url.clone(),
            profile.format,
            profile.name.clone(),
            profile.segment_interval,
        );

        let admission = self.admission.try_admit(template).await?;

        // Launch when no process owns the key yet: either this admission
        // created the session, or its creator was rolled back at capacity
        // before launching and this viewer inherited the record.
        let needs_launch =
            admission.created || !self.processes.contains(&session_key).await;
        if needs_launch {
            match self.launcher.launch(&admission.record, profile).await {
                Ok(process) => {
                    self.processes.insert(&session_key, process).await;
                    self.monitor.watch(&session_key);
                }
                Err(e) => {
                    warn!(session_key, "upstream launch failed, rolling back admission: {e}");
                    self.rollback_failed_launch(&request.provider_id, &session_key)
                        .await;
                    return Err(e.into());
                }
            }
        }

        Ok(AttachGrant {
            stream_handle: admission.stream_handle,
            session_key,
            viewer_count: admission.viewer_count,
            created: admission.created,
            state: admission.record.state,
        })
    }

    /// Detach one viewer. When the last viewer leaves, teardown is debounced
    /// by the idle grace so channel-hopping does not churn the upstream.
    pub async fn detach_viewer(&self, session_key: &str) -> AppResult<u32> {
        let Some(record) = self.registry.attach(session_key).await? else {
            return Err(AppError::not_found("session", session_key));
        };

        let remaining = self
            .admission
            .release(&record.provider_id, session_key)
            .await?;
        debug!(session_key, remaining, "viewer detached");

        if remaining == 0 {
            self.schedule_idle_teardown(session_key);
        }
        Ok(remaining)
    }

    fn schedule_idle_teardown(&self, session_key: &str) {
        let registry = self.registry.clone();
        let processes = self.processes.clone();
        let key = session_key.to_string();
        self.scheduler.spawn_after(
            &format!("idle-teardown:{session_key}"),
            self.idle_grace,
            async move {
                match registry.attach(&key).await {
                    Ok(Some(record)) if record.viewer_count == 0 => {
                        info!(session_key = %key, "tearing down idle session");
                        if let Err(e) = teardown(&registry, &processes, &key).await {
                            warn!(session_key = %key, "idle teardown failed: {e}");
                        }
                    }
                    Ok(Some(record)) => {
                        debug!(
                            session_key = %key,
                            viewers = record.viewer_count,
                            "idle teardown cancelled, viewers returned"
                        );
                    }
                    Ok(None) => {}
                    Err(e) => warn!(session_key = %key, "idle teardown check failed: {e}"),
                }
            },
        );
    }

    /// Forced teardown, e.g. an operator freeing a permanently failed key.
    /// Any still-attached viewers are disconnected and uncounted.
    pub async fn stop_session(&self, session_key: &str) -> AppResult<()> {
        let Some(record) = self.registry.attach(session_key).await? else {
            return Err(AppError::not_found("session", session_key));
        };

        // Evicting the record requires a zero viewer count; the disconnected
        // viewers must also stop counting against the provider ceiling.
        for _ in 0..record.viewer_count {
            self.registry.decrement_viewer(session_key).await?;
            self.registry
                .store()
                .counter_add(&provider_counter(&record.provider_id), -1)
                .await?;
        }

        teardown(&self.registry, &self.processes, session_key).await
    }

    /// Kill every upstream and cancel all background work
    pub async fn shutdown(&self) {
        info!("shutting down session manager");
        self.scheduler.shutdown();
        self.processes.kill_all().await;
    }

    async fn rollback_failed_launch(&self, provider_id: &str, session_key: &str) {
        if let Err(e) = self.admission.release(provider_id, session_key).await {
            warn!(session_key, "launch rollback release failed: {e}");
        }
        if let Err(e) = teardown(&self.registry, &self.processes, session_key).await {
            debug!(session_key, "launch rollback teardown: {e}");
        }
    }
}

/// Ordered teardown: kill the process (disconnecting clients), mark the
/// record Stopped, then evict it. Steps retry independently so a transient
/// store error does not leave a zombie process.
async fn teardown(
    registry: &Arc<SessionRegistry>,
    processes: &Arc<ProcessTable>,
    session_key: &str,
) -> AppResult<()> {
    let key = session_key.to_string();
    let processes = processes.clone();
    let registry_mark = registry.clone();
    let registry_evict = registry.clone();
    let key_kill = key.clone();
    let key_mark = key.clone();
    let key_evict = key.clone();

    TaskPipeline::new(format!("teardown:{session_key}"))
        .step("kill-process", 2, move || {
            let processes = processes.clone();
            let key = key_kill.clone();
            async move {
                processes.kill_and_remove(&key).await?;
                Ok(())
            }
        })
        .step("mark-stopped", 3, move || {
            let registry = registry_mark.clone();
            let key = key_mark.clone();
            async move {
                registry
                    .transition(
                        &key,
                        &[
                            SessionState::Starting,
                            SessionState::Healthy,
                            SessionState::Stale,
                            SessionState::Failed,
                        ],
                        SessionState::Stopped,
                    )
                    .await?;
                Ok(())
            }
        })
        .step("evict-record", 3, move || {
            let registry = registry_evict.clone();
            let key = key_evict.clone();
            async move {
                registry.remove(&key).await?;
                Ok(())
            }
        })
        .run()
        .await
}
