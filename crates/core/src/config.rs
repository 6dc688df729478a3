use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

const MIB: u64 = 1024 * 1024;

/// Config file `convertd` and `converttop` read when no path is given
pub const DEFAULT_CONFIG_PATH: &str = "/etc/convertd/config.toml";

/// The explicit path if one was given, else the default file if it exists
pub fn config_path_or_default(explicit: Option<&Path>) -> Option<PathBuf> {
    resolve_config_path(explicit, Path::new(DEFAULT_CONFIG_PATH))
}

fn resolve_config_path(explicit: Option<&Path>, default: &Path) -> Option<PathBuf> {
    match explicit {
        Some(path) => Some(path.to_path_buf()),
        None if default.exists() => Some(default.to_path_buf()),
        None => None,
    }
}

/// Size ceiling and conversion quota for one service tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    /// Largest accepted upload in bytes
    pub max_upload_bytes: u64,
    /// Conversions allowed per quota window; `None` means unlimited
    pub quota_per_window: Option<u32>,
}

/// Limits for the free and premium tiers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    pub free: TierLimits,
    pub premium: TierLimits,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            free: TierLimits {
                max_upload_bytes: 100 * MIB,
                quota_per_window: Some(5),
            },
            premium: TierLimits {
                max_upload_bytes: 2000 * MIB,
                quota_per_window: None,
            },
        }
    }
}

/// Fixed output profile handed to the encoder for every job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderProfile {
    /// Output container extension (e.g. "mp4")
    pub container: String,
    pub video_codec: String,
    pub video_bitrate: String,
    pub audio_codec: String,
    pub audio_bitrate: String,
}

impl Default for EncoderProfile {
    fn default() -> Self {
        Self {
            container: "mp4".to_string(),
            video_codec: "libx264".to_string(),
            video_bitrate: "2500k".to_string(),
            audio_codec: "aac".to_string(),
            audio_bitrate: "192k".to_string(),
        }
    }
}

/// External encoder settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Path to the ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    pub profile: EncoderProfile,
    /// Wall-clock limit per job before the encoder is killed
    pub timeout_secs: u64,
    /// Extra attempts after a spawn failure (non-zero exits are never retried)
    pub spawn_retries: u32,
    /// Maximum number of encoder processes running at once
    pub max_concurrent_jobs: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            profile: EncoderProfile::default(),
            timeout_secs: 30 * 60,
            spawn_retries: 2,
            max_concurrent_jobs: 2,
        }
    }
}

/// Directory layout used by the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Inputs and outputs owned by live jobs
    pub transient_dir: PathBuf,
    /// Where the upload transport drops files and request manifests
    pub spool_dir: PathBuf,
    /// Result manifests for the delivery transport
    pub outbox_dir: PathBuf,
    /// Command files from collaborators (payment, delivery)
    pub command_dir: PathBuf,
    /// Stats snapshot for the dashboard
    pub state_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = PathBuf::from("/tmp/convertd");
        Self {
            transient_dir: base.join("transient"),
            spool_dir: base.join("spool"),
            outbox_dir: base.join("outbox"),
            command_dir: base.join("commands"),
            state_dir: base.join("state"),
        }
    }
}

/// Configuration for the conversion service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub tiers: TierConfig,
    /// Length of the rolling quota window in seconds
    pub quota_window_secs: u64,
    /// Accepted upload MIME types (video/audio containers)
    pub allowed_mime_types: Vec<String>,
    pub encoder: EncoderConfig,
    pub storage: StorageConfig,
    /// Age after which transient files and job records are reclaimed
    pub retention_secs: u64,
    /// Interval between sweeper passes
    pub sweep_interval_secs: u64,
    /// Interval between spool/command directory scans
    pub poll_interval_secs: u64,
    /// Interval between stats snapshot writes
    pub snapshot_interval_secs: u64,
    /// Delay between the two size checks of a spooled upload
    pub spool_settle_millis: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl ServiceConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            tiers: TierConfig::default(),
            quota_window_secs: 24 * 60 * 60,
            allowed_mime_types: default_mime_types(),
            encoder: EncoderConfig::default(),
            storage: StorageConfig::default(),
            retention_secs: 60 * 60,
            sweep_interval_secs: 60 * 60,
            poll_interval_secs: 2,
            snapshot_interval_secs: 5,
            spool_settle_millis: 500,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the service cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.encoder.max_concurrent_jobs == 0 {
            bail!("encoder.max_concurrent_jobs must be at least 1");
        }
        if self.quota_window_secs == 0 {
            bail!("quota_window_secs must be greater than zero");
        }
        if self.retention_secs == 0 || self.sweep_interval_secs == 0 {
            bail!("retention_secs and sweep_interval_secs must be greater than zero");
        }
        if self.tiers.free.max_upload_bytes > self.tiers.premium.max_upload_bytes {
            bail!(
                "free tier ceiling ({} bytes) exceeds premium ceiling ({} bytes)",
                self.tiers.free.max_upload_bytes,
                self.tiers.premium.max_upload_bytes
            );
        }
        if self.allowed_mime_types.is_empty() {
            bail!("allowed_mime_types must not be empty");
        }
        Ok(())
    }

    pub fn quota_window(&self) -> Duration {
        Duration::from_secs(self.quota_window_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn encoder_timeout(&self) -> Duration {
        Duration::from_secs(self.encoder.timeout_secs)
    }
}

fn default_mime_types() -> Vec<String> {
    [
        "video/mp4",
        "video/quicktime",
        "video/x-matroska",
        "video/webm",
        "video/x-msvideo",
        "video/mpeg",
        "video/x-flv",
        "video/3gpp",
        "audio/mpeg",
        "audio/mp4",
        "audio/aac",
        "audio/wav",
        "audio/x-wav",
        "audio/ogg",
        "audio/flac",
        "audio/webm",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_tier_table() {
        let cfg = ServiceConfig::default();
        assert_eq!(cfg.tiers.free.max_upload_bytes, 100 * MIB);
        assert_eq!(cfg.tiers.premium.max_upload_bytes, 2000 * MIB);
        assert_eq!(cfg.tiers.free.quota_per_window, Some(5));
        assert_eq!(cfg.tiers.premium.quota_per_window, None);
        assert_eq!(cfg.quota_window(), Duration::from_secs(86_400));
        assert_eq!(cfg.retention(), Duration::from_secs(3_600));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let cfg = ServiceConfig::load_config(Some(Path::new("/nonexistent/convertd.toml"))).unwrap();
        assert_eq!(cfg, ServiceConfig::default());
    }

    #[test]
    fn test_default_path_used_only_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let default = dir.path().join("config.toml");
        let explicit = Path::new("/srv/convertd.json");

        assert_eq!(resolve_config_path(None, &default), None);
        assert_eq!(resolve_config_path(Some(explicit), &default), Some(explicit.to_path_buf()));

        std::fs::write(&default, "retention_secs = 60").unwrap();
        assert_eq!(resolve_config_path(None, &default), Some(default.clone()));
        assert_eq!(resolve_config_path(Some(explicit), &default), Some(explicit.to_path_buf()));
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("convertd.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "retention_secs = 120").unwrap();
        writeln!(file, "[encoder]").unwrap();
        writeln!(file, "max_concurrent_jobs = 4").unwrap();
        writeln!(file, "[tiers.free]").unwrap();
        writeln!(file, "max_upload_bytes = 1048576").unwrap();
        writeln!(file, "quota_per_window = 3").unwrap();

        let cfg = ServiceConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.retention_secs, 120);
        assert_eq!(cfg.encoder.max_concurrent_jobs, 4);
        assert_eq!(cfg.encoder.timeout_secs, 1800);
        assert_eq!(cfg.tiers.free.quota_per_window, Some(3));
        assert_eq!(cfg.tiers.premium.max_upload_bytes, 2000 * MIB);
    }

    #[test]
    fn test_json_config_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("convertd.json");
        std::fs::write(&path, r#"{"quota_window_secs": 60, "encoder": {"timeout_secs": 5}}"#).unwrap();

        let cfg = ServiceConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.quota_window_secs, 60);
        assert_eq!(cfg.encoder.timeout_secs, 5);
    }

    #[test]
    fn test_validate_rejects_inverted_ceilings() {
        let mut cfg = ServiceConfig::default();
        cfg.tiers.free.max_upload_bytes = cfg.tiers.premium.max_upload_bytes + 1;
        assert!(cfg.validate().is_err());

        let mut cfg = ServiceConfig::default();
        cfg.encoder.max_concurrent_jobs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ServiceConfig::default();
        cfg.allowed_mime_types.clear();
        assert!(cfg.validate().is_err());
    }
}
