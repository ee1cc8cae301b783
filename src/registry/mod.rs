//! Session Registry
//!
//! Authoritative map of active shared-stream sessions. All mutation goes
//! through `RegistryStore`, a small set of atomic primitives shaped like a
//! shared key-value store (atomic counters, compare-and-swap state updates,
//! field updates), so multiple worker processes observing the same sessions
//! stay consistent without any in-process lock spanning them.
//!
//! Compare-and-swap conflicts are benign races: `compare_and_swap_state`
//! returns `Ok(false)` and the caller re-reads and retries, bounded by a
//! small attempt count.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::RegistryError;
use crate::models::session::{SessionRecord, SessionState};

pub use memory::MemoryRegistryStore;

/// Bound for compare-and-swap retry loops before giving up and logging
const MAX_CAS_ATTEMPTS: u32 = 4;

/// Atomic primitives the registry requires from its backing store
///
/// Every operation is atomic with respect to every other; mutations are
/// visible to all holders of the store immediately. The in-memory
/// implementation mirrors what a shared store (Redis-style) provides.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn get(&self, session_key: &str) -> Result<Option<SessionRecord>, RegistryError>;

    /// Insert if absent; single-writer-wins. Returns the stored record and
    /// whether this call created it.
    async fn insert_if_absent(
        &self,
        record: SessionRecord,
    ) -> Result<(SessionRecord, bool), RegistryError>;

    /// Compare-and-swap the session state. `Ok(false)` means the expectation
    /// was stale; `InvalidTransition` means the state machine forbids the move.
    async fn compare_and_swap_state(
        &self,
        session_key: &str,
        expected: SessionState,
        next: SessionState,
    ) -> Result<bool, RegistryError>;

    /// Atomically increment the viewer count, returning the new value
    async fn increment_viewers(&self, session_key: &str) -> Result<u32, RegistryError>;

    /// Atomically decrement the viewer count, returning the new value.
    /// Decrementing below zero clamps to zero (and is logged as a logic error).
    async fn decrement_viewers(&self, session_key: &str) -> Result<u32, RegistryError>;

    /// Record that a health check ran
    async fn mark_checked(
        &self,
        session_key: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RegistryError>;

    /// Record a healthy observation: sets `last_healthy_at`, resets `retry_count`
    async fn mark_healthy(
        &self,
        session_key: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RegistryError>;

    /// Atomically increment `retry_count`, returning the new value
    async fn bump_retry(&self, session_key: &str) -> Result<u32, RegistryError>;

    /// Reset `started_at` for a reconnect attempt so the grace period restarts
    async fn reset_for_restart(
        &self,
        session_key: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RegistryError>;

    /// Delete the record. Only valid with zero viewers and a session in
    /// Stopped or Failed state; anything else is `RemovalDenied`.
    async fn remove(&self, session_key: &str) -> Result<(), RegistryError>;

    /// Atomically delete a Starting record only while it still has zero
    /// viewers, returning whether it was removed. Rolls back a session
    /// created by a rejected admission without disturbing a viewer admitted
    /// to it in the meantime.
    async fn discard_if_unused(&self, session_key: &str) -> Result<bool, RegistryError>;

    /// Snapshot of all records at call time; no consistency guarantee across
    /// the whole list.
    async fn list(&self) -> Result<Vec<SessionRecord>, RegistryError>;

    /// Atomically add to a named counter (e.g. per-provider connections),
    /// returning the new value
    async fn counter_add(&self, name: &str, delta: i64) -> Result<i64, RegistryError>;

    async fn counter_get(&self, name: &str) -> Result<i64, RegistryError>;
}

/// Counter key for a provider's active connection count
pub fn provider_counter(provider_id: &str) -> String {
    format!("provider:{provider_id}:connections")
}

/// Typed facade over the registry store
#[derive(Clone)]
pub struct SessionRegistry {
    store: Arc<dyn RegistryStore>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<dyn RegistryStore> {
        self.store.clone()
    }

    /// Atomic read for viewer attachment; `None` when no session exists
    pub async fn attach(&self, session_key: &str) -> Result<Option<SessionRecord>, RegistryError> {
        self.store.get(session_key).await
    }

    /// Create a Starting session if absent, otherwise return the existing one.
    /// Safe under concurrent callers racing to create the same key.
    pub async fn create_or_get(
        &self,
        record: SessionRecord,
    ) -> Result<(SessionRecord, bool), RegistryError> {
        self.store.insert_if_absent(record).await
    }

    pub async fn increment_viewer(&self, session_key: &str) -> Result<u32, RegistryError> {
        self.store.increment_viewers(session_key).await
    }

    pub async fn decrement_viewer(&self, session_key: &str) -> Result<u32, RegistryError> {
        self.store.decrement_viewers(session_key).await
    }

    /// Drive the session into `next` from any of `from`, retrying stale
    /// expectations a bounded number of times.
    ///
    /// Returns the state the transition was applied from, or `None` when the
    /// session is absent or in none of the `from` states (a benign outcome
    /// for callers racing teardown).
    pub async fn transition(
        &self,
        session_key: &str,
        from: &[SessionState],
        next: SessionState,
    ) -> Result<Option<SessionState>, RegistryError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(current) = self.store.get(session_key).await? else {
                return Ok(None);
            };
            if current.state == next {
                return Ok(None);
            }
            if !from.contains(&current.state) {
                return Ok(None);
            }
            if self
                .store
                .compare_and_swap_state(session_key, current.state, next)
                .await?
            {
                return Ok(Some(current.state));
            }
            tracing::debug!(
                session_key,
                expected = %current.state,
                "compare-and-swap lost a race, re-reading"
            );
        }
        Err(RegistryError::CasRetriesExhausted {
            session_key: session_key.to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    pub async fn remove(&self, session_key: &str) -> Result<(), RegistryError> {
        self.store.remove(session_key).await
    }

    /// Evict a never-used Starting session; `Ok(false)` when a viewer raced in
    pub async fn discard_unused(&self, session_key: &str) -> Result<bool, RegistryError> {
        self.store.discard_if_unused(session_key).await
    }

    pub async fn list_active(&self) -> Result<Vec<SessionRecord>, RegistryError> {
        self.store.list().await
    }
}
