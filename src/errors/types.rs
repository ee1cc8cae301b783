//! Error type definitions for the shared stream monitor
//!
//! This module defines all error types used throughout the application,
//! providing a hierarchical error system that makes debugging and error
//! handling more straightforward.

use std::time::Duration;
use thiserror::Error;

use crate::models::session::SessionState;

/// Top-level application error type
///
/// This enum represents all possible errors that can occur in the application.
/// It uses `thiserror` to provide automatic error trait implementations and
/// proper error chaining.
#[derive(Error, Debug)]
pub enum AppError {
    /// Session registry errors
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Admission control errors
    #[error("Admission error: {0}")]
    Admission(#[from] AdmissionError),

    /// Health monitoring errors
    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),

    /// Upstream process launch errors
    #[error("Launch error: {0}")]
    Launch(#[from] LaunchError),

    /// Transcode profile errors
    #[error("Profile error: {0}")]
    Profile(#[from] ProfileError),

    /// Validation errors
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Resource not found errors
    #[error("Not found: {resource} with id {id}")]
    NotFound { resource: String, id: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Session registry specific errors
///
/// Compare-and-swap conflicts are deliberately NOT errors:
/// `compare_and_swap_state` returns `Ok(false)` so callers can re-read and
/// retry. Errors here are
/// genuine contract violations or exhausted bounded retries.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Session key not present in the store
    #[error("Session not found: {session_key}")]
    SessionNotFound { session_key: String },

    /// A state transition the state machine does not permit
    #[error("Invalid transition for {session_key}: {from} -> {to}")]
    InvalidTransition {
        session_key: String,
        from: SessionState,
        to: SessionState,
    },

    /// Removal attempted while the session is still referenced or live
    #[error(
        "Removal denied for {session_key}: state={state}, viewers={viewer_count} (requires zero viewers and a stopped or failed session)"
    )]
    RemovalDenied {
        session_key: String,
        state: SessionState,
        viewer_count: u32,
    },

    /// Bounded compare-and-swap retry loop gave up
    #[error("Gave up after {attempts} compare-and-swap attempts for {session_key}")]
    CasRetriesExhausted { session_key: String, attempts: u32 },

    /// Backing store failure
    #[error("Store error: {message}")]
    Store { message: String },
}

/// Admission control specific errors
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// Provider is at its connection ceiling; callers may retry later
    #[error(
        "Capacity exhausted for provider {provider_id}: {current}/{max} connections, retry after {retry_after:?}"
    )]
    CapacityExhausted {
        provider_id: String,
        current: u32,
        max: u32,
        retry_after: Duration,
    },

    /// Session has permanently failed; reject fast instead of spinning up a doomed session
    #[error("Session {session_key} has permanently failed")]
    SessionFailed { session_key: String },

    /// Registry errors bubbling up through admission
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Health monitoring specific errors
///
/// A health check that overruns its poll interval is not an error; the
/// monitor forfeits the tick.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Probe could not read the session's output
    #[error("Probe failed for {session_key}: {message}")]
    ProbeFailed {
        session_key: String,
        message: String,
    },

    /// No process handle registered for the session
    #[error("No process handle for {session_key}")]
    ProcessMissing { session_key: String },

    /// Filesystem errors while inspecting segment output
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Upstream process launch errors
#[derive(Error, Debug)]
pub enum LaunchError {
    /// The ffmpeg binary could not be spawned
    #[error("Failed to spawn upstream process: {message}")]
    SpawnFailed { message: String },

    /// Output location could not be prepared
    #[error("Failed to prepare output directory {path}: {message}")]
    OutputUnavailable { path: String, message: String },

    /// Profile failed validation before launch
    #[error("Profile rejected: {0}")]
    Profile(#[from] ProfileError),
}

/// Transcode profile template and rate-control validation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProfileError {
    /// Template references a placeholder outside the allow-list
    #[error("Unknown template variable '{{{name}}}' in profile '{profile}'")]
    UnknownVariable { profile: String, name: String },

    /// Template references a placeholder with no configured value
    #[error("Missing parameter '{name}' for profile '{profile}'")]
    MissingParameter { profile: String, name: String },

    /// A rate parameter could not be parsed (expects e.g. "3000k", "2M" or plain bits/s)
    #[error("Invalid rate '{value}' for parameter '{name}' in profile '{profile}'")]
    InvalidRate {
        profile: String,
        name: String,
        value: String,
    },

    /// Video Buffering Verifier constraint violated
    #[error("VBV violation in profile '{profile}': {message}")]
    VbvViolation { profile: String, message: String },
}

/// Convenience methods for creating common error types
impl AppError {
    /// Create a validation error with a custom message
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found<R: Into<String>, I: Into<String>>(resource: R, id: I) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
