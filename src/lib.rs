//! Shared stream session monitor
//!
//! Manages shared upstream stream sessions: one ffmpeg fetch per stream
//! shared by every attached viewer, per-provider admission ceilings, a
//! segment-freshness health state machine, and backoff-driven reconnects.

pub mod config;
pub mod errors;
pub mod models;
pub mod registry;
pub mod services;
pub mod web;
