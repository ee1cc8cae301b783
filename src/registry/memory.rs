//! In-memory registry store
//!
//! Single-process implementation of `RegistryStore`. Each operation holds the
//! map lock for its full duration, giving the same atomicity a shared
//! external store provides per command. Deployments spanning multiple worker
//! processes swap this for a store backed by a shared service; nothing above
//! the trait changes.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::warn;

use crate::errors::RegistryError;
use crate::models::session::{SessionRecord, SessionState};
use crate::registry::RegistryStore;

#[derive(Default)]
pub struct MemoryRegistryStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
    counters: RwLock<HashMap<String, i64>>,
}

impl MemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistryStore {
    async fn get(&self, session_key: &str) -> Result<Option<SessionRecord>, RegistryError> {
        Ok(self.sessions.read().await.get(session_key).cloned())
    }

    async fn insert_if_absent(
        &self,
        record: SessionRecord,
    ) -> Result<(SessionRecord, bool), RegistryError> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&record.session_key) {
            return Ok((existing.clone(), false));
        }
        sessions.insert(record.session_key.clone(), record.clone());
        Ok((record, true))
    }

    async fn compare_and_swap_state(
        &self,
        session_key: &str,
        expected: SessionState,
        next: SessionState,
    ) -> Result<bool, RegistryError> {
        let mut sessions = self.sessions.write().await;
        let record = sessions
            .get_mut(session_key)
            .ok_or_else(|| RegistryError::SessionNotFound {
                session_key: session_key.to_string(),
            })?;
        if record.state != expected {
            return Ok(false);
        }
        if !expected.can_transition_to(next) {
            return Err(RegistryError::InvalidTransition {
                session_key: session_key.to_string(),
                from: expected,
                to: next,
            });
        }
        record.state = next;
        Ok(true)
    }

    async fn increment_viewers(&self, session_key: &str) -> Result<u32, RegistryError> {
        let mut sessions = self.sessions.write().await;
        let record = sessions
            .get_mut(session_key)
            .ok_or_else(|| RegistryError::SessionNotFound {
                session_key: session_key.to_string(),
            })?;
        record.viewer_count += 1;
        Ok(record.viewer_count)
    }

    async fn decrement_viewers(&self, session_key: &str) -> Result<u32, RegistryError> {
        let mut sessions = self.sessions.write().await;
        let record = sessions
            .get_mut(session_key)
            .ok_or_else(|| RegistryError::SessionNotFound {
                session_key: session_key.to_string(),
            })?;
        if record.viewer_count == 0 {
            warn!(
                session_key,
                "viewer count decremented below zero, clamping to zero"
            );
        } else {
            record.viewer_count -= 1;
        }
        Ok(record.viewer_count)
    }

    async fn mark_checked(
        &self,
        session_key: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().await;
        let record = sessions
            .get_mut(session_key)
            .ok_or_else(|| RegistryError::SessionNotFound {
                session_key: session_key.to_string(),
            })?;
        record.last_check_at = Some(at);
        Ok(())
    }

    async fn mark_healthy(
        &self,
        session_key: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().await;
        let record = sessions
            .get_mut(session_key)
            .ok_or_else(|| RegistryError::SessionNotFound {
                session_key: session_key.to_string(),
            })?;
        record.last_healthy_at = Some(at);
        record.last_check_at = Some(at);
        record.retry_count = 0;
        Ok(())
    }

    async fn bump_retry(&self, session_key: &str) -> Result<u32, RegistryError> {
        let mut sessions = self.sessions.write().await;
        let record = sessions
            .get_mut(session_key)
            .ok_or_else(|| RegistryError::SessionNotFound {
                session_key: session_key.to_string(),
            })?;
        record.retry_count += 1;
        Ok(record.retry_count)
    }

    async fn reset_for_restart(
        &self,
        session_key: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().await;
        let record = sessions
            .get_mut(session_key)
            .ok_or_else(|| RegistryError::SessionNotFound {
                session_key: session_key.to_string(),
            })?;
        record.started_at = at;
        record.last_healthy_at = None;
        Ok(())
    }

    async fn remove(&self, session_key: &str) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().await;
        let Some(record) = sessions.get(session_key) else {
            return Ok(());
        };
        if record.viewer_count > 0
            || !matches!(record.state, SessionState::Stopped | SessionState::Failed)
        {
            return Err(RegistryError::RemovalDenied {
                session_key: session_key.to_string(),
                state: record.state,
                viewer_count: record.viewer_count,
            });
        }
        sessions.remove(session_key);
        Ok(())
    }

    async fn discard_if_unused(&self, session_key: &str) -> Result<bool, RegistryError> {
        let mut sessions = self.sessions.write().await;
        let Some(record) = sessions.get(session_key) else {
            return Ok(false);
        };
        if record.state != SessionState::Starting || record.viewer_count > 0 {
            return Ok(false);
        }
        sessions.remove(session_key);
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<SessionRecord>, RegistryError> {
        Ok(self.sessions.read().await.values().cloned().collect())
    }

    async fn counter_add(&self, name: &str, delta: i64) -> Result<i64, RegistryError> {
        let mut counters = self.counters.write().await;
        let value = counters.entry(name.to_string()).or_insert(0);
        *value += delta;
        if *value < 0 {
            warn!(counter = name, "counter dropped below zero, clamping");
            *value = 0;
        }
        Ok(*value)
    }

    async fn counter_get(&self, name: &str) -> Result<i64, RegistryError> {
        Ok(self
            .counters
            .read()
            .await
            .get(name)
            .copied()
            .unwrap_or(0))
    }
}
