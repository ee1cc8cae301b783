//! FFmpeg command builder
//!
//! Turns a validated transcode profile into the final ffmpeg argument
//! vector: fixed input analysis arguments, the profile's templated encoding
//! arguments, then format-specific output arguments.

use std::path::Path;

use tracing::debug;

use crate::errors::ProfileError;
use crate::models::TranscodeProfile;
use crate::models::session::StreamFormat;

/// Segments kept in the live playlist window
const HLS_LIST_SIZE: u32 = 6;

pub struct FfmpegCommandBuilder;

impl FfmpegCommandBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Build the full argument vector for a session launch.
    ///
    /// `segment_dir` is required for HLS output; TS streams to stdout.
    pub fn build_args(
        &self,
        profile: &TranscodeProfile,
        input_url: &str,
        segment_dir: Option<&Path>,
    ) -> Result<Vec<String>, ProfileError> {
        let output = match (profile.format, segment_dir) {
            (StreamFormat::Hls, Some(dir)) => dir.join("playlist.m3u8").display().to_string(),
            (StreamFormat::Hls, None) | (StreamFormat::Ts, _) => "pipe:1".to_string(),
        };

        let mut args = Vec::new();
        self.add_input_args(&mut args, input_url);
        args.extend(profile.substitute(input_url, &output)?);
        self.add_output_args(&mut args, profile, segment_dir, &output);

        debug!(
            profile = %profile.name,
            "built ffmpeg command with {} arguments",
            args.len()
        );
        Ok(args)
    }

    fn add_input_args(&self, args: &mut Vec<String>, input_url: &str) {
        args.extend(
            [
                "-hide_banner",
                "-loglevel",
                "warning",
                "-analyzeduration",
                "10000000",
                "-probesize",
                "10000000",
                "-i",
                input_url,
            ]
            .map(str::to_string),
        );
    }

    fn add_output_args(
        &self,
        args: &mut Vec<String>,
        profile: &TranscodeProfile,
        segment_dir: Option<&Path>,
        output: &str,
    ) {
        match profile.format {
            StreamFormat::Hls => {
                args.extend(["-f".to_string(), "hls".to_string()]);
                args.extend([
                    "-hls_time".to_string(),
                    profile.segment_interval.as_secs().to_string(),
                ]);
                args.extend(["-hls_list_size".to_string(), HLS_LIST_SIZE.to_string()]);
                args.extend([
                    "-hls_flags".to_string(),
                    "delete_segments+append_list".to_string(),
                ]);
                if let Some(dir) = segment_dir {
                    args.extend([
                        "-hls_segment_filename".to_string(),
                        dir.join("seg-%05d.ts").display().to_string(),
                    ]);
                }
                args.push(output.to_string());
            }
            StreamFormat::Ts => {
                args.extend(["-f".to_string(), "mpegts".to_string()]);
                args.push(output.to_string());
            }
        }
    }
}

impl Default for FfmpegCommandBuilder {
    fn default() -> Self {
        Self::new()
    }
}
