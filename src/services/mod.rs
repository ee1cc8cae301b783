//! Service layer
//!
//! Each service owns one policy: admission decides who gets in, the health
//! monitor decides what state a session is in, the retry coordinator decides
//! when to relaunch, and the session manager sequences them.

pub mod admission;
pub mod ffmpeg_command_builder;
pub mod health_monitor;
pub mod metrics_aggregator;
pub mod process_launcher;
pub mod retry_coordinator;
pub mod scheduler;
pub mod session_manager;
pub mod task_pipeline;

pub use admission::{Admission, AdmissionController, AdmissionLimits};
pub use ffmpeg_command_builder::FfmpegCommandBuilder;
pub use health_monitor::{HealthMonitor, HealthProbe, ProcessProbe};
pub use metrics_aggregator::{Alert, AlertKind, AlertSeverity, MetricsAggregator, StatsSnapshot};
pub use process_launcher::{FfmpegLauncher, ProcessLauncher, ProcessTable, UpstreamProcess};
pub use retry_coordinator::{FailureHandler, FailureOutcome, RetryCoordinator};
pub use scheduler::TaskScheduler;
pub use session_manager::{AttachGrant, AttachRequest, SessionManager};
pub use task_pipeline::TaskPipeline;
