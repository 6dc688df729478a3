//! Stats snapshot shared between the daemon and the dashboard.

use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::context::{ServiceContext, ServiceStats};
use crate::job::{Job, JobState};

pub const SNAPSHOT_FILE: &str = "stats.json";

/// Dashboard view of one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: String,
    pub owner: String,
    pub state: JobState,
    pub size_bytes: u64,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure: Option<String>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        JobSummary {
            id: job.id.to_string(),
            owner: job.owner.to_string(),
            state: job.state,
            size_bytes: job.size_bytes,
            mime_type: job.mime_type.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            failure: job.failure.as_ref().map(|f| f.summary()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub generated_at: DateTime<Utc>,
    pub stats: ServiceStats,
    pub jobs: Vec<JobSummary>,
}

impl Snapshot {
    pub fn capture(ctx: &ServiceContext) -> Result<Self> {
        let stats = ctx.stats().context("Failed to collect service stats")?;
        let jobs = ctx.jobs().context("Failed to list jobs")?;
        Ok(Snapshot {
            generated_at: Utc::now(),
            stats,
            jobs: jobs.iter().map(JobSummary::from).collect(),
        })
    }
}

pub fn snapshot_path(state_dir: &Path) -> PathBuf {
    state_dir.join(SNAPSHOT_FILE)
}

/// Capture and write `stats.json` into `state_dir`
pub fn write_snapshot(state_dir: &Path, ctx: &ServiceContext) -> Result<Snapshot> {
    let snapshot = Snapshot::capture(ctx)?;
    write_json_atomic(&snapshot_path(state_dir), &snapshot)?;
    Ok(snapshot)
}

pub fn load_snapshot(path: &Path) -> Result<Snapshot> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read snapshot: {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse snapshot: {}", path.display()))
}

/// Write pretty JSON through a temp file and rename, so readers never see a
/// half-written document.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}
