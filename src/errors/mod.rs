//! Error handling for the shared stream monitor
//!
//! This module provides a hierarchical error system built on `thiserror`,
//! with a top-level `AppError` and layer-specific sub-errors.

pub mod types;

pub use types::{
    AdmissionError, AppError, LaunchError, MonitorError, ProfileError, RegistryError,
};

/// Convenient result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
