//! Default values shared across configuration sections

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8085;

pub const DEFAULT_FFMPEG_COMMAND: &str = "ffmpeg";

/// Grace period for a Starting session to produce its first data
pub const DEFAULT_SEGMENT_GRACE_PERIOD_SECS: u64 = 20;

/// Segment age multiplier before a healthy session is considered stale
pub const DEFAULT_STALE_MULTIPLIER: u32 = 3;

/// Floor for the per-session health poll interval
pub const DEFAULT_MIN_CHECK_INTERVAL_SECS: u64 = 3;

/// Consecutive stale samples / reconnect attempts before permanent failure
pub const DEFAULT_MONITOR_TRIES: u32 = 3;

/// Debounce after viewer_count reaches zero before teardown
pub const DEFAULT_IDLE_GRACE_SECS: u64 = 5;

/// Reconnect backoff sequence in seconds, last value held for further retries
pub const DEFAULT_RETRY_BACKOFF_SECS: &[u64] = &[60, 120, 300];
