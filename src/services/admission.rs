//! Admission control
//!
//! Decides whether a new viewer may attach to an existing shared session or
//! trigger a new upstream fetch, and enforces per-provider concurrent
//! connection ceilings. The check is two-phase: a cheap pre-check against the
//! provider counter, then an authoritative recount after the increment with a
//! rollback path, so minor races are tolerated but the ceiling is never
//! permanently exceeded. Rejections are fail-fast (429-equivalent with a
//! retry-after hint), never queued.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LimitsConfig;
use crate::errors::AdmissionError;
use crate::models::session::{SessionRecord, SessionState};
use crate::registry::{SessionRegistry, provider_counter};

/// Per-provider connection ceilings; 0 means unlimited
#[derive(Debug, Clone, Default)]
pub struct AdmissionLimits {
    default_max_connections: u32,
    providers: HashMap<String, u32>,
}

impl AdmissionLimits {
    pub fn new(default_max_connections: u32, providers: HashMap<String, u32>) -> Self {
        Self {
            default_max_connections,
            providers,
        }
    }

    pub fn from_config(config: &LimitsConfig) -> Self {
        Self::new(config.default_max_connections, config.providers.clone())
    }

    pub fn max_for(&self, provider_id: &str) -> u32 {
        self.providers
            .get(provider_id)
            .copied()
            .unwrap_or(self.default_max_connections)
    }

    pub fn provider_ids(&self) -> impl Iterator<Item = &String> {
        self.providers.keys()
    }
}

/// A granted admission: the session the viewer is attached to and an opaque
/// handle identifying this viewer's attachment
#[derive(Debug, Clone)]
pub struct Admission {
    pub stream_handle: Uuid,
    pub record: SessionRecord,
    /// Whether this admission created the session (caller must spawn the upstream)
    pub created: bool,
    pub viewer_count: u32,
}

pub struct AdmissionController {
    registry: Arc<SessionRegistry>,
    limits: AdmissionLimits,
    /// Sessions in Failed state with this many attempts are permanently dead
    monitor_tries: u32,
    retry_after: Duration,
}

impl AdmissionController {
    pub fn new(
        registry: Arc<SessionRegistry>,
        limits: AdmissionLimits,
        monitor_tries: u32,
        retry_after: Duration,
    ) -> Self {
        Self {
            registry,
            limits,
            monitor_tries,
            retry_after,
        }
    }

    pub fn limits(&self) -> &AdmissionLimits {
        &self.limits
    }

    /// Admit a viewer to the session identified by `template.session_key`,
    /// creating the session record if absent.
    pub async fn try_admit(&self, template: SessionRecord) -> Result<Admission, AdmissionError> {
        let provider_id = template.provider_id.clone();
        let session_key = template.session_key.clone();
        let max = self.limits.max_for(&provider_id);
        let counter = provider_counter(&provider_id);

        let existing = self.registry.attach(&session_key).await?;

        if let Some(record) = &existing
            && self.is_permanently_failed(record)
        {
            debug!(session_key, "rejecting admission to permanently failed session");
            return Err(AdmissionError::SessionFailed { session_key });
        }

        // Cheap pre-check: at capacity with no session to share means no room
        // for a new upstream fetch.
        if max > 0 && existing.is_none() {
            let current = self.registry.store().counter_get(&counter).await?;
            if current >= max as i64 {
                return Err(self.capacity_exhausted(&provider_id, current, max));
            }
        }

        let (record, created) = self.registry.create_or_get(template).await?;
        let viewer_count = self.registry.increment_viewer(&session_key).await?;
        let active = self.registry.store().counter_add(&counter, 1).await?;

        // Authoritative recount. Roll back whenever the increment pushed the
        // provider over its ceiling.
        if max > 0 && active > max as i64 {
            self.registry.decrement_viewer(&session_key).await?;
            let current = self.registry.store().counter_add(&counter, -1).await?;
            if created {
                self.discard_unused_session(&session_key).await;
            }
            return Err(self.capacity_exhausted(&provider_id, current, max));
        }

        if created {
            info!(
                session_key,
                provider_id,
                upstream_url = %record.upstream_url,
                "admitted first viewer, new session created"
            );
        } else {
            debug!(session_key, viewer_count, "viewer attached to existing session");
        }

        Ok(Admission {
            stream_handle: Uuid::new_v4(),
            record,
            created,
            viewer_count,
        })
    }

    /// Release one viewer's admission; returns the remaining viewer count
    pub async fn release(
        &self,
        provider_id: &str,
        session_key: &str,
    ) -> Result<u32, AdmissionError> {
        let remaining = self.registry.decrement_viewer(session_key).await?;
        self.registry
            .store()
            .counter_add(&provider_counter(provider_id), -1)
            .await?;
        Ok(remaining)
    }

    fn is_permanently_failed(&self, record: &SessionRecord) -> bool {
        record.state == SessionState::Failed && record.retry_count >= self.monitor_tries
    }

    fn capacity_exhausted(&self, provider_id: &str, current: i64, max: u32) -> AdmissionError {
        warn!(
            provider_id,
            current, max, "admission rejected: provider at capacity"
        );
        AdmissionError::CapacityExhausted {
            provider_id: provider_id.to_string(),
            current: current.max(0) as u32,
            max,
            retry_after: self.retry_after,
        }
    }

    /// Evict a session created by an admission that was then rolled back.
    /// The discard is atomic on (Starting, zero viewers): a viewer admitted
    /// to the session in the meantime keeps it, and this path never changes
    /// session state.
    async fn discard_unused_session(&self, session_key: &str) {
        match self.registry.discard_unused(session_key).await {
            Ok(true) => debug!(session_key, "rolled-back session discarded"),
            Ok(false) => debug!(session_key, "rollback discard skipped, session in use"),
            Err(e) => warn!(session_key, "rollback discard failed: {e}"),
        }
    }
}
