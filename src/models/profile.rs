//! Transcode profile templates
//!
//! Profiles carry an ffmpeg argument template with named placeholders drawn
//! from a fixed allow-list. Free-text interpolation is rejected up front so
//! unsupported directives cannot be injected through configuration, and the
//! rate-control parameters are checked for VBV consistency before any process
//! is launched.

use std::collections::HashMap;
use std::time::Duration;

use tracing::warn;

use crate::errors::ProfileError;
use crate::models::session::StreamFormat;

/// Placeholders a template may reference. `input` and `output` are supplied
/// at launch time; everything else must come from the profile's parameters.
pub const ALLOWED_TEMPLATE_VARS: &[&str] = &[
    "input", "output", "bitrate", "maxrate", "bufsize", "crf", "preset",
];

/// A validated ffmpeg transcoding profile
#[derive(Debug, Clone)]
pub struct TranscodeProfile {
    pub name: String,
    pub format: StreamFormat,
    /// HLS segment duration (hls_time); also drives health poll sizing
    pub segment_interval: Duration,
    /// Argument template, one token per element, placeholders as `{name}`
    pub args_template: Vec<String>,
    /// Values substituted for non-builtin placeholders
    pub parameters: HashMap<String, String>,
}

impl TranscodeProfile {
    /// Validate the template against the placeholder allow-list and check
    /// VBV consistency of the rate parameters.
    ///
    /// Returns the list of non-fatal warnings (also logged).
    pub fn validate(&self) -> Result<Vec<String>, ProfileError> {
        for token in &self.args_template {
            for var in template_vars(token) {
                if !ALLOWED_TEMPLATE_VARS.contains(&var.as_str()) {
                    return Err(ProfileError::UnknownVariable {
                        profile: self.name.clone(),
                        name: var,
                    });
                }
                if var != "input" && var != "output" && !self.parameters.contains_key(&var) {
                    return Err(ProfileError::MissingParameter {
                        profile: self.name.clone(),
                        name: var,
                    });
                }
            }
        }

        let warnings = self.validate_vbv()?;
        for warning in &warnings {
            warn!(profile = %self.name, "{warning}");
        }
        Ok(warnings)
    }

    /// VBV (Video Buffering Verifier) consistency: bitrate must not exceed
    /// maxrate, bufsize must cover at least one maxrate window, and a bufsize
    /// under 4x maxrate is flagged as a warning.
    fn validate_vbv(&self) -> Result<Vec<String>, ProfileError> {
        let bitrate = self.rate_parameter("bitrate")?;
        let maxrate = self.rate_parameter("maxrate")?;
        let bufsize = self.rate_parameter("bufsize")?;

        let mut warnings = Vec::new();

        if let (Some(bitrate), Some(maxrate)) = (bitrate, maxrate)
            && bitrate > maxrate
        {
            return Err(ProfileError::VbvViolation {
                profile: self.name.clone(),
                message: format!("bitrate ({bitrate} b/s) exceeds maxrate ({maxrate} b/s)"),
            });
        }

        if let (Some(bufsize), Some(maxrate)) = (bufsize, maxrate) {
            if bufsize < maxrate {
                return Err(ProfileError::VbvViolation {
                    profile: self.name.clone(),
                    message: format!("bufsize ({bufsize} b) is below maxrate ({maxrate} b/s)"),
                });
            }
            if bufsize < maxrate.saturating_mul(4) {
                warnings.push(format!(
                    "bufsize ({bufsize} b) is below 4x maxrate ({maxrate} b/s); expect rate-control oscillation on bursty content"
                ));
            }
        }

        Ok(warnings)
    }

    /// Substitute placeholders, producing the final argument vector
    pub fn substitute(&self, input: &str, output: &str) -> Result<Vec<String>, ProfileError> {
        let mut args = Vec::with_capacity(self.args_template.len());
        for token in &self.args_template {
            let mut resolved = token.clone();
            for var in template_vars(token) {
                let value = match var.as_str() {
                    "input" => input,
                    "output" => output,
                    name => self.parameters.get(name).map(String::as_str).ok_or_else(|| {
                        ProfileError::MissingParameter {
                            profile: self.name.clone(),
                            name: name.to_string(),
                        }
                    })?,
                };
                resolved = resolved.replace(&format!("{{{var}}}"), value);
            }
            args.push(resolved);
        }
        Ok(args)
    }

    fn rate_parameter(&self, name: &str) -> Result<Option<u64>, ProfileError> {
        match self.parameters.get(name) {
            None => Ok(None),
            Some(value) => {
                parse_rate(value)
                    .map(Some)
                    .ok_or_else(|| ProfileError::InvalidRate {
                        profile: self.name.clone(),
                        name: name.to_string(),
                        value: value.clone(),
                    })
            }
        }
    }
}

/// Extract `{name}` placeholders from a template token
fn template_vars(token: &str) -> Vec<String> {
    let mut vars = Vec::new();
    let mut rest = token;
    while let Some(start) = rest.find('{') {
        let Some(end) = rest[start..].find('}') else {
            break;
        };
        vars.push(rest[start + 1..start + end].to_string());
        rest = &rest[start + end + 1..];
    }
    vars
}

/// Parse an ffmpeg-style rate value ("3000k", "2M", "2500000") into bits
fn parse_rate(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let (number, multiplier) = match value.chars().last() {
        Some('k') | Some('K') => (&value[..value.len() - 1], 1_000u64),
        Some('m') | Some('M') => (&value[..value.len() - 1], 1_000_000u64),
        _ => (value, 1u64),
    };
    number.parse::<u64>().ok().map(|n| n * multiplier)
}
