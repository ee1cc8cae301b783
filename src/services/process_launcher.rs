//! Upstream process launching and ownership
//!
//! Each session exclusively owns at most one upstream fetch/transcode
//! process. Handles live in the `ProcessTable` of the monitor process that
//! spawned them, never in the shared registry record, and are released on
//! teardown or permanent failure.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::LaunchError;
use crate::models::TranscodeProfile;
use crate::models::session::{SessionRecord, StreamFormat};
use crate::services::ffmpeg_command_builder::FfmpegCommandBuilder;

/// A running upstream fetch owned by exactly one session
#[async_trait]
pub trait UpstreamProcess: Send {
    /// Total bytes the process has produced on its output stream (TS)
    fn bytes_produced(&self) -> u64;

    /// Directory the process writes segments into (HLS)
    fn segment_dir(&self) -> Option<&Path>;

    fn is_running(&mut self) -> bool;

    async fn kill(&mut self) -> Result<(), LaunchError>;
}

/// Spawns upstream processes for sessions
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(
        &self,
        record: &SessionRecord,
        profile: &TranscodeProfile,
    ) -> Result<Box<dyn UpstreamProcess>, LaunchError>;
}

/// A table entry: the process plus the token used to signal attached
/// clients to disconnect when the session dies.
pub struct SessionProcess {
    pub process: Box<dyn UpstreamProcess>,
    pub clients: CancellationToken,
}

/// Local table of process handles keyed by session key
#[derive(Default)]
pub struct ProcessTable {
    inner: Mutex<HashMap<String, SessionProcess>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a process for a session, killing any predecessor first
    pub async fn insert(&self, session_key: &str, process: Box<dyn UpstreamProcess>) {
        let entry = SessionProcess {
            process,
            clients: CancellationToken::new(),
        };
        let previous = self.inner.lock().await.insert(session_key.to_string(), entry);
        if let Some(mut previous) = previous {
            warn!(session_key, "replacing a live process handle");
            if let Err(e) = previous.process.kill().await {
                warn!(session_key, "failed to kill replaced process: {e}");
            }
        }
    }

    pub async fn contains(&self, session_key: &str) -> bool {
        self.inner.lock().await.contains_key(session_key)
    }

    pub async fn bytes_produced(&self, session_key: &str) -> Option<u64> {
        self.inner
            .lock()
            .await
            .get(session_key)
            .map(|p| p.process.bytes_produced())
    }

    pub async fn segment_dir(&self, session_key: &str) -> Option<PathBuf> {
        self.inner
            .lock()
            .await
            .get(session_key)
            .and_then(|p| p.process.segment_dir().map(Path::to_path_buf))
    }

    pub async fn is_running(&self, session_key: &str) -> Option<bool> {
        self.inner
            .lock()
            .await
            .get_mut(session_key)
            .map(|p| p.process.is_running())
    }

    /// Token clients watch to learn the session was torn down
    pub async fn client_token(&self, session_key: &str) -> Option<CancellationToken> {
        self.inner
            .lock()
            .await
            .get(session_key)
            .map(|p| p.clients.clone())
    }

    /// Kill and release the session's process; signals clients first
    pub async fn kill_and_remove(&self, session_key: &str) -> Result<(), LaunchError> {
        let entry = self.inner.lock().await.remove(session_key);
        if let Some(mut entry) = entry {
            entry.clients.cancel();
            entry.process.kill().await?;
            debug!(session_key, "released upstream process handle");
        }
        Ok(())
    }

    /// Kill every owned process; used on shutdown
    pub async fn kill_all(&self) {
        let mut inner = self.inner.lock().await;
        for (session_key, entry) in inner.iter_mut() {
            entry.clients.cancel();
            if let Err(e) = entry.process.kill().await {
                warn!(session_key, "failed to kill process on shutdown: {e}");
            }
        }
        inner.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

/// ffmpeg process handle
pub struct FfmpegProcess {
    child: tokio::process::Child,
    bytes_out: Arc<AtomicU64>,
    segment_dir: Option<PathBuf>,
}

#[async_trait]
impl UpstreamProcess for FfmpegProcess {
    fn bytes_produced(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    fn segment_dir(&self) -> Option<&Path> {
        self.segment_dir.as_deref()
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn kill(&mut self) -> Result<(), LaunchError> {
        if let Err(e) = self.child.kill().await {
            // Already-exited children report errors we can ignore
            debug!("kill returned: {e}");
        }
        Ok(())
    }
}

impl Drop for FfmpegProcess {
    fn drop(&mut self) {
        // Ensure the child does not outlive its handle
        if let Err(e) = self.child.start_kill() {
            debug!("start_kill on drop returned: {e}");
        }
    }
}

/// Launches ffmpeg with profile-templated arguments
pub struct FfmpegLauncher {
    ffmpeg_command: String,
    segment_root: PathBuf,
    builder: FfmpegCommandBuilder,
}

impl FfmpegLauncher {
    pub fn new(ffmpeg_command: String, segment_root: PathBuf) -> Self {
        Self {
            ffmpeg_command,
            segment_root,
            builder: FfmpegCommandBuilder::new(),
        }
    }

    fn session_dir(&self, session_key: &str) -> PathBuf {
        let sanitized: String = session_key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.segment_root
            .join(format!("{sanitized}-{}", Uuid::new_v4()))
    }
}

#[async_trait]
impl ProcessLauncher for FfmpegLauncher {
    async fn launch(
        &self,
        record: &SessionRecord,
        profile: &TranscodeProfile,
    ) -> Result<Box<dyn UpstreamProcess>, LaunchError> {
        profile.validate()?;

        let segment_dir = match record.format {
            StreamFormat::Hls => {
                let dir = self.session_dir(&record.session_key);
                tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                    LaunchError::OutputUnavailable {
                        path: dir.display().to_string(),
                        message: e.to_string(),
                    }
                })?;
                Some(dir)
            }
            StreamFormat::Ts => None,
        };

        let args = self
            .builder
            .build_args(profile, &record.upstream_url, segment_dir.as_deref())?;

        debug!(
            session_key = %record.session_key,
            command = %self.ffmpeg_command,
            "launching upstream process: {}",
            args.join(" ")
        );

        let mut cmd = TokioCommand::new(&self.ffmpeg_command);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(if record.format == StreamFormat::Ts {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| LaunchError::SpawnFailed {
            message: format!("{}: {e}", self.ffmpeg_command),
        })?;

        let bytes_out = Arc::new(AtomicU64::new(0));

        // Count raw TS bytes flowing out of the process
        if let Some(mut stdout) = child.stdout.take() {
            let counter = bytes_out.clone();
            let session_key = record.session_key.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    match stdout.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            counter.fetch_add(n as u64, Ordering::Relaxed);
                        }
                        Err(e) => {
                            debug!(session_key, "stdout read ended: {e}");
                            break;
                        }
                    }
                }
            });
        }

        // Surface ffmpeg diagnostics at debug level, errors at warn
        if let Some(stderr) = child.stderr.take() {
            let session_key = record.session_key.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.contains("error") || line.contains("Error") {
                        warn!(session_key, "ffmpeg: {line}");
                    } else {
                        debug!(session_key, "ffmpeg: {line}");
                    }
                }
            });
        }

        info!(
            session_key = %record.session_key,
            pid = ?child.id(),
            format = %record.format,
            profile = %profile.name,
            "upstream process started"
        );

        Ok(Box::new(FfmpegProcess {
            child,
            bytes_out,
            segment_dir,
        }))
    }
}
