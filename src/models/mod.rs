//! Data models for shared stream sessions and transcode profiles

pub mod profile;
pub mod session;

pub use profile::TranscodeProfile;
pub use session::{
    FailureKind, HealthObservation, HealthSample, HealthVerdict, SessionRecord, SessionState,
    StreamFormat,
};
