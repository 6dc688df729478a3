use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::error::{ConversionError, StorageResult};
use crate::identity::Identity;
use crate::store::KeyValueStore;

/// Unique job token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        JobId(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw.trim()).ok().map(JobId)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job lifecycle: `Admitted -> Running -> {Succeeded, Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Admitted,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    /// `Admitted -> Failed` covers jobs that never got an encoder (e.g. orphaned inputs).
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Admitted, JobState::Running)
                | (JobState::Admitted, JobState::Failed)
                | (JobState::Running, JobState::Succeeded)
                | (JobState::Running, JobState::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Admitted => "admitted",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job ended in `Failed`; kept on the record and sent to waiters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    SpawnFailure { message: String },
    NonZeroExit { code: Option<i32>, stderr_tail: String },
    Timeout { secs: u64 },
    EmptyOutput,
    /// The record was reclaimed before the job finished
    Orphaned,
}

impl FailureReason {
    /// Map an encoder error onto a storable reason
    pub fn from_error(err: &ConversionError) -> Self {
        match err {
            ConversionError::SpawnFailure(message) => FailureReason::SpawnFailure {
                message: message.clone(),
            },
            ConversionError::EncoderNonZeroExit { code, stderr_tail } => FailureReason::NonZeroExit {
                code: *code,
                stderr_tail: stderr_tail.clone(),
            },
            ConversionError::EncoderTimeout { secs } => FailureReason::Timeout { secs: *secs },
            ConversionError::EmptyOutput => FailureReason::EmptyOutput,
            ConversionError::Orphaned(_) => FailureReason::Orphaned,
            other => FailureReason::SpawnFailure {
                message: other.to_string(),
            },
        }
    }

    pub fn into_error(self, job_id: &JobId) -> ConversionError {
        match self {
            FailureReason::SpawnFailure { message } => ConversionError::SpawnFailure(message),
            FailureReason::NonZeroExit { code, stderr_tail } => {
                ConversionError::EncoderNonZeroExit { code, stderr_tail }
            }
            FailureReason::Timeout { secs } => ConversionError::EncoderTimeout { secs },
            FailureReason::EmptyOutput => ConversionError::EmptyOutput,
            FailureReason::Orphaned => ConversionError::Orphaned(job_id.to_string()),
        }
    }

    pub fn summary(&self) -> String {
        match self {
            FailureReason::SpawnFailure { message } => format!("spawn failure: {}", message),
            FailureReason::NonZeroExit { code, .. } => match code {
                Some(code) => format!("encoder exited with status {}", code),
                None => "encoder terminated by signal".to_string(),
            },
            FailureReason::Timeout { secs } => format!("encoder timed out after {}s", secs),
            FailureReason::EmptyOutput => "encoder produced no output".to_string(),
            FailureReason::Orphaned => "job record reclaimed before completion".to_string(),
        }
    }
}

/// One conversion request's lifecycle record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner: Identity,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub mime_type: String,
    /// Whether admission took a quota reservation (false for premium)
    pub quota_reserved: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure: Option<FailureReason>,
    /// Encoder spawn attempts made so far
    pub attempts: u32,
    /// Set once the engine (or an abandon) has taken charge of the
    /// reservation. An unclaimed non-terminal job that gets swept has its
    /// reservation released by the sweeper.
    #[serde(default)]
    pub claimed: bool,
}

impl Job {
    pub fn new(
        id: JobId,
        owner: Identity,
        input_path: PathBuf,
        output_path: PathBuf,
        size_bytes: u64,
        mime_type: String,
        quota_reserved: bool,
    ) -> Self {
        Job {
            id,
            owner,
            input_path,
            output_path,
            state: JobState::Admitted,
            created_at: Utc::now(),
            size_bytes,
            mime_type,
            quota_reserved,
            started_at: None,
            finished_at: None,
            failure: None,
            attempts: 0,
            claimed: false,
        }
    }

    /// Move to `next`, stamping timestamps. Invalid transitions are refused.
    pub fn advance(&mut self, next: JobState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!("Job {}: refusing transition {} -> {}", self.id, self.state, next);
            return false;
        }
        self.state = next;
        match next {
            JobState::Running => self.started_at = Some(Utc::now()),
            JobState::Succeeded | JobState::Failed => self.finished_at = Some(Utc::now()),
            JobState::Admitted => {}
        }
        true
    }

    /// Whether removing this record strands a reservation nobody will release
    pub fn holds_unclaimed_reservation(&self) -> bool {
        self.quota_reserved && !self.claimed && !self.state.is_terminal()
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

/// Live job table.
///
/// Updates never resurrect a record the sweeper already removed.
pub struct JobTable {
    store: Arc<dyn KeyValueStore<Job>>,
    lock: Mutex<()>,
}

impl JobTable {
    pub fn new(store: Arc<dyn KeyValueStore<Job>>) -> Self {
        JobTable {
            store,
            lock: Mutex::new(()),
        }
    }

    pub fn insert(&self, job: Job) -> StorageResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.store.set(&job.id.to_string(), job)
    }

    pub fn get(&self, id: &JobId) -> StorageResult<Option<Job>> {
        self.store.get(&id.to_string())
    }

    /// Apply `f` to a live job and return the updated copy, or None if it is gone
    pub fn update<F>(&self, id: &JobId, f: F) -> StorageResult<Option<Job>>
    where
        F: FnOnce(&mut Job),
    {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let key = id.to_string();
        match self.store.get(&key)? {
            Some(mut job) => {
                f(&mut job);
                self.store.set(&key, job.clone())?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    pub fn remove(&self, id: &JobId) -> StorageResult<Option<Job>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.store.delete(&id.to_string())
    }

    pub fn all(&self) -> StorageResult<Vec<Job>> {
        let mut jobs = self.store.values()?;
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    pub fn count_in_state(&self, state: JobState) -> StorageResult<usize> {
        Ok(self.store.values()?.iter().filter(|j| j.state == state).count())
    }

    pub fn len(&self) -> StorageResult<usize> {
        self.store.len()
    }
}
