use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use crate::config::EncoderProfile;
use crate::error::ConversionError;

/// Lines of encoder stderr kept for failure reports
const STDERR_TAIL_LINES: usize = 20;

/// FFmpeg version information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FFmpegVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FFmpegVersion {
    /// Parse version from FFmpeg version string
    /// Example: "ffmpeg version 6.1.1" -> FFmpegVersion { major: 6, minor: 1, patch: 1 }
    pub fn parse(version_str: &str) -> Result<Self> {
        let version_part = version_str
            .split_whitespace()
            .find(|s| s.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false))
            .ok_or_else(|| anyhow!("No version number found in: {}", version_str))?;

        // Distro builds append suffixes like "6.1.1-3ubuntu5"
        let numeric: &str = version_part
            .split(|c: char| !(c.is_ascii_digit() || c == '.'))
            .next()
            .unwrap_or(version_part);
        let parts: Vec<&str> = numeric.split('.').filter(|p| !p.is_empty()).collect();

        if parts.is_empty() {
            return Err(anyhow!("Invalid version format: {}", version_str));
        }

        let major = parts[0].parse::<u32>()
            .with_context(|| format!("Failed to parse major version from: {}", parts[0]))?;
        let minor = match parts.get(1) {
            Some(p) => p.parse::<u32>()
                .with_context(|| format!("Failed to parse minor version from: {}", p))?,
            None => 0,
        };
        let patch = match parts.get(2) {
            Some(p) => p.parse::<u32>()
                .with_context(|| format!("Failed to parse patch version from: {}", p))?,
            None => 0,
        };

        Ok(FFmpegVersion { major, minor, patch })
    }
}

/// Exit details of a finished encoder run
#[derive(Debug, Clone)]
pub struct EncoderRun {
    pub exit_code: Option<i32>,
    pub stderr_tail: String,
    pub elapsed: Duration,
}

/// Builds the fixed argument vector for a conversion.
///
/// Paths are passed as separate arguments and the encoder is spawned
/// directly, never through a shell.
pub struct CommandBuilder;

impl CommandBuilder {
    pub fn new() -> Self {
        CommandBuilder
    }

    /// Build the conversion command for `input` -> `output` under `profile`
    pub fn build_convert_command(
        &self,
        input: &Path,
        output: &Path,
        profile: &EncoderProfile,
    ) -> Vec<String> {
        let mut args = Vec::new();

        args.push("-hide_banner".to_string());
        args.push("-nostdin".to_string());
        args.push("-y".to_string());

        args.push("-i".to_string());
        args.push(input.to_string_lossy().to_string());

        // First video stream if any, all audio streams if any
        args.push("-map".to_string());
        args.push("0:v:0?".to_string());
        args.push("-map".to_string());
        args.push("0:a?".to_string());

        args.push("-c:v".to_string());
        args.push(profile.video_codec.clone());
        args.push("-b:v".to_string());
        args.push(profile.video_bitrate.clone());

        args.push("-c:a".to_string());
        args.push(profile.audio_codec.clone());
        args.push("-b:a".to_string());
        args.push(profile.audio_bitrate.clone());

        if matches!(profile.container.as_str(), "mp4" | "mov" | "m4a") {
            args.push("-movflags".to_string());
            args.push("+faststart".to_string());
        }

        args.push(output.to_string_lossy().to_string());

        args
    }
}

impl Default for CommandBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle on the external encoder binary
#[derive(Debug, Clone)]
pub struct Encoder {
    pub ffmpeg_bin: PathBuf,
}

impl Encoder {
    pub fn new(ffmpeg_bin: impl Into<PathBuf>) -> Self {
        Encoder {
            ffmpeg_bin: ffmpeg_bin.into(),
        }
    }

    /// Query `ffmpeg -version`
    pub async fn detect_version(&self) -> Result<FFmpegVersion> {
        let output = Command::new(&self.ffmpeg_bin)
            .arg("-version")
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to execute FFmpeg at: {}", self.ffmpeg_bin.display()))?;

        if !output.status.success() {
            return Err(anyhow!("FFmpeg version check failed"));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let first_line = stdout.lines().next()
            .ok_or_else(|| anyhow!("Empty output from FFmpeg -version"))?;

        FFmpegVersion::parse(first_line)
    }

    /// Run the encoder with `args`, killing it once `limit` elapses.
    ///
    /// Exit status 0 is success; anything else maps onto the conversion error
    /// taxonomy.
    pub async fn run(&self, args: &[String], limit: Duration) -> Result<EncoderRun, ConversionError> {
        let started = std::time::Instant::now();
        debug!("Executing encoder: {} {:?}", self.ffmpeg_bin.display(), args);

        let mut child = Command::new(&self.ffmpeg_bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ConversionError::SpawnFailure(format!(
                "{}: {}", self.ffmpeg_bin.display(), e
            )))?;

        let stderr_handle = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut tail: Vec<String> = Vec::new();
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.remove(0);
                    }
                    tail.push(line);
                }
                tail.join("\n")
            })
        });

        let status = match tokio::time::timeout(limit, child.wait()).await {
            Ok(result) => result.map_err(|e| ConversionError::SpawnFailure(format!(
                "failed to wait for encoder: {}", e
            )))?,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill timed-out encoder: {}", e);
                }
                if let Some(handle) = stderr_handle {
                    handle.abort();
                }
                return Err(ConversionError::EncoderTimeout { secs: whole_secs_rounded_up(limit) });
            }
        };

        let stderr_tail = match stderr_handle {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        let run = EncoderRun {
            exit_code: status.code(),
            stderr_tail,
            elapsed: started.elapsed(),
        };

        if !status.success() {
            return Err(ConversionError::EncoderNonZeroExit {
                code: run.exit_code,
                stderr_tail: run.stderr_tail,
            });
        }

        info!("Encoder finished in {:.1}s", run.elapsed.as_secs_f64());
        Ok(run)
    }
}

/// Sub-second limits still report as at least one second
fn whole_secs_rounded_up(limit: Duration) -> u64 {
    limit.as_secs() + u64::from(limit.subsec_nanos() > 0)
}
