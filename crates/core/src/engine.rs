//! Conversion job engine.
//!
//! Each submitted job gets its own supervising task. The task waits for one
//! of `max_concurrent_jobs` encoder slots (the job stays `Admitted` while it
//! queues), moves the job to `Running`, spawns the encoder and settles the
//! job as `Succeeded` or `Failed`. Waiters are woken through a per-job watch
//! channel.
//!
//! Quota bookkeeping happens exactly once per job, at the terminal
//! transition: commit on success, release otherwise.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use log::{debug, error, info, warn};
use tokio::sync::{watch, Semaphore};
use crate::config::{EncoderConfig, EncoderProfile};
use crate::encoder::{CommandBuilder, Encoder};
use crate::error::ConversionError;
use crate::job::{FailureReason, Job, JobId, JobState, JobTable};
use crate::quota::QuotaTracker;
use crate::transient::{InUseGuard, TransientStore};

/// Pause between spawn attempts
const SPAWN_RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Engine tuning, usually taken from [`EncoderConfig`]
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub ffmpeg_bin: PathBuf,
    pub profile: EncoderProfile,
    pub timeout: Duration,
    pub spawn_retries: u32,
    pub max_concurrent_jobs: usize,
}

impl EngineSettings {
    pub fn from_config(cfg: &EncoderConfig) -> Self {
        EngineSettings {
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
            profile: cfg.profile.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
            spawn_retries: cfg.spawn_retries,
            max_concurrent_jobs: cfg.max_concurrent_jobs.max(1),
        }
    }
}

/// What waiters observe on a job's watch channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub state: JobState,
    pub failure: Option<FailureReason>,
}

/// Readable converted artifact. The file is protected from the sweeper for
/// as long as the handle lives.
#[derive(Debug)]
pub struct OutputHandle {
    pub job_id: JobId,
    pub path: PathBuf,
    pub size_bytes: u64,
    _guard: InUseGuard,
}

pub struct JobEngine {
    jobs: Arc<JobTable>,
    quota: Arc<QuotaTracker>,
    transient: Arc<TransientStore>,
    encoder: Encoder,
    builder: CommandBuilder,
    settings: EngineSettings,
    slots: Arc<Semaphore>,
    watchers: Mutex<HashMap<JobId, watch::Sender<Progress>>>,
}

impl JobEngine {
    pub fn new(
        jobs: Arc<JobTable>,
        quota: Arc<QuotaTracker>,
        transient: Arc<TransientStore>,
        settings: EngineSettings,
    ) -> Arc<Self> {
        Arc::new(JobEngine {
            jobs,
            quota,
            transient,
            encoder: Encoder::new(settings.ffmpeg_bin.clone()),
            builder: CommandBuilder::new(),
            slots: Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1))),
            settings,
            watchers: Mutex::new(HashMap::new()),
        })
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    /// Hand an `Admitted` job to the engine. Returns immediately; encoding
    /// runs on a supervising task.
    pub fn submit(self: &Arc<Self>, job_id: JobId) -> Result<(), ConversionError> {
        let job = self
            .jobs
            .get(&job_id)?
            .ok_or_else(|| ConversionError::JobNotFound(job_id.to_string()))?;

        // Held from submission on, so a queued job's input survives sweeps
        let input_guard = self.transient.mark_in_use(&job.input_path);

        let mut claimed = false;
        let job = self
            .jobs
            .update(&job_id, |j| {
                if j.state == JobState::Admitted && !j.claimed {
                    j.claimed = true;
                    claimed = true;
                }
            })?
            .ok_or_else(|| ConversionError::JobNotFound(job_id.to_string()))?;
        if !claimed {
            debug!("Job {}: submit ignored, already {} (claimed: {})", job_id, job.state, job.claimed);
            return Ok(());
        }

        {
            let mut watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
            let (tx, _rx) = watch::channel(Progress {
                state: JobState::Admitted,
                failure: None,
            });
            watchers.insert(job_id, tx);
        }

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.drive(job, input_guard).await;
        });
        Ok(())
    }

    /// Withdraw an `Admitted` job that was never submitted: its reservation
    /// is released and its input and record deleted. Returns false when the
    /// job is gone or already belongs to the engine.
    pub fn abandon(&self, job_id: JobId) -> Result<bool, ConversionError> {
        let mut claimed = false;
        let job = match self.jobs.update(&job_id, |j| {
            if j.state == JobState::Admitted && !j.claimed {
                j.claimed = true;
                claimed = true;
            }
        })? {
            Some(job) => job,
            None => return Ok(false),
        };
        if !claimed {
            return Ok(false);
        }

        self.release_reservation(&job);
        self.transient.discard(&job.input_path);
        self.jobs.remove(&job_id)?;
        warn!("Job {}: abandoned before submission", job_id);
        Ok(true)
    }

    /// Wait for a job to finish and return its output handle
    pub async fn await_result(&self, job_id: JobId) -> Result<OutputHandle, ConversionError> {
        let rx = {
            let watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
            watchers.get(&job_id).map(|tx| tx.subscribe())
        };

        if let Some(mut rx) = rx {
            let finished = rx
                .wait_for(|p| p.state.is_terminal())
                .await
                .map(|p| p.clone());
            if let Ok(Progress { state: JobState::Failed, failure }) = finished {
                return Err(failure.unwrap_or(FailureReason::Orphaned).into_error(&job_id));
            }
        }

        self.open_output(job_id)
    }

    /// Open the output of a succeeded job for delivery
    pub fn open_output(&self, job_id: JobId) -> Result<OutputHandle, ConversionError> {
        let job = self
            .jobs
            .get(&job_id)?
            .ok_or_else(|| ConversionError::JobNotFound(job_id.to_string()))?;

        match job.state {
            JobState::Succeeded => {}
            JobState::Failed => {
                return Err(job.failure.unwrap_or(FailureReason::Orphaned).into_error(&job_id));
            }
            JobState::Admitted | JobState::Running => {
                return Err(ConversionError::NotReady(job_id.to_string()));
            }
        }

        let guard = self.transient.mark_in_use(&job.output_path);
        let size_bytes = std::fs::metadata(&job.output_path)
            .map_err(|e| crate::error::StorageError::io(&job.output_path, e))?
            .len();

        Ok(OutputHandle {
            job_id,
            path: job.output_path,
            size_bytes,
            _guard: guard,
        })
    }

    /// Delete a finished job's files and drop its record. Safe to repeat.
    pub fn finish_delivery(&self, job_id: JobId) -> Result<bool, ConversionError> {
        let job = match self.jobs.get(&job_id)? {
            Some(job) => job,
            None => return Ok(false),
        };
        if !job.state.is_terminal() {
            return Err(ConversionError::NotReady(job_id.to_string()));
        }

        self.jobs.remove(&job_id)?;
        self.transient.discard(&job.input_path);
        self.transient.discard(&job.output_path);
        info!("Job {}: delivered, transient files removed", job_id);
        Ok(true)
    }

    pub fn job(&self, job_id: &JobId) -> Result<Option<Job>, ConversionError> {
        Ok(self.jobs.get(job_id)?)
    }

    pub fn state(&self, job_id: &JobId) -> Result<Option<JobState>, ConversionError> {
        Ok(self.jobs.get(job_id)?.map(|j| j.state))
    }

    /// Jobs that have not reached a terminal state
    pub fn active_jobs(&self) -> Result<usize, ConversionError> {
        Ok(self.jobs.count_in_state(JobState::Admitted)? + self.jobs.count_in_state(JobState::Running)?)
    }

    pub fn running_jobs(&self) -> Result<usize, ConversionError> {
        Ok(self.jobs.count_in_state(JobState::Running)?)
    }

    /// Supervise one job from queueing to its terminal state
    async fn drive(self: Arc<Self>, job: Job, _input_guard: InUseGuard) {
        let id = job.id;

        // Closed only if the engine is shutting down
        let _permit = match Arc::clone(&self.slots).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.settle_orphan(&job);
                return;
            }
        };

        let _output_guard = self.transient.mark_in_use(&job.output_path);

        let mut started = false;
        let running = self.jobs.update(&id, |j| {
            started = j.advance(JobState::Running);
        });
        match running {
            Ok(Some(_)) if started => {}
            Ok(_) => {
                warn!("Job {}: record gone or not admitted before start, cleaning up", id);
                self.settle_orphan(&job);
                return;
            }
            Err(e) => {
                error!("Job {}: failed to mark running: {}", id, e);
                self.settle_orphan(&job);
                return;
            }
        }
        self.publish(&id, JobState::Running, None);
        info!("Job {}: encoder starting for {}", id, job.input_path.display());

        let args = self.builder.build_convert_command(&job.input_path, &job.output_path, &self.settings.profile);
        let outcome = self.run_with_retry(&id, &args).await.and_then(|_| self.verify_output(&job));

        match outcome {
            Ok(size) => self.settle_success(&job, size),
            Err(e) => self.settle_failure(&job, &e),
        }
    }

    async fn run_with_retry(&self, id: &JobId, args: &[String]) -> Result<(), ConversionError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if let Err(e) = self.jobs.update(id, |j| j.attempts = attempt) {
                warn!("Job {}: failed to record attempt: {}", id, e);
            }

            match self.encoder.run(args, self.settings.timeout).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_retryable() && attempt <= self.settings.spawn_retries => {
                    warn!("Job {}: attempt {} failed ({}), retrying", id, attempt, e);
                    tokio::time::sleep(SPAWN_RETRY_BACKOFF).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn verify_output(&self, job: &Job) -> Result<u64, ConversionError> {
        match std::fs::metadata(&job.output_path) {
            Ok(m) if m.len() > 0 => Ok(m.len()),
            _ => Err(ConversionError::EmptyOutput),
        }
    }

    fn settle_success(&self, job: &Job, size: u64) {
        let id = job.id;
        let mut applied = false;
        match self.jobs.update(&id, |j| {
            applied = j.advance(JobState::Succeeded);
        }) {
            Ok(Some(_)) if applied => {}
            Ok(_) => {
                warn!("Job {}: record reclaimed while running, discarding output", id);
                self.settle_orphan(job);
                return;
            }
            Err(e) => {
                error!("Job {}: failed to record success: {}", id, e);
                self.settle_orphan(job);
                return;
            }
        }

        let committed = if job.quota_reserved {
            self.quota.commit(&job.owner)
        } else {
            self.quota.record_unmetered(&job.owner)
        };
        if let Err(e) = committed {
            warn!("Job {}: failed to count conversion for {}: {}", id, job.owner, e);
        }

        self.publish(&id, JobState::Succeeded, None);
        info!("Job {}: ✅ succeeded, {} byte output at {}", id, size, job.output_path.display());
    }

    fn settle_failure(&self, job: &Job, err: &ConversionError) {
        let id = job.id;
        let reason = FailureReason::from_error(err);

        self.transient.discard(&job.input_path);
        self.transient.discard(&job.output_path);
        self.release_reservation(job);

        let recorded = self.jobs.update(&id, |j| {
            if j.advance(JobState::Failed) {
                j.failure = Some(reason.clone());
            }
        });
        if let Err(e) = recorded {
            error!("Job {}: failed to record failure: {}", id, e);
        }

        self.publish(&id, JobState::Failed, Some(reason));
        error!("Job {}: ❌ failed: {}", id, err);
    }

    /// The record vanished (swept) or the engine is shutting down: give the
    /// reservation back and delete whatever the job left on disk.
    fn settle_orphan(&self, job: &Job) {
        self.transient.discard(&job.input_path);
        self.transient.discard(&job.output_path);
        self.release_reservation(job);
        self.publish(&job.id, JobState::Failed, Some(FailureReason::Orphaned));
    }

    fn release_reservation(&self, job: &Job) {
        if job.quota_reserved {
            if let Err(e) = self.quota.release(&job.owner) {
                warn!("Job {}: failed to release reservation for {}: {}", job.id, job.owner, e);
            }
        }
    }

    fn publish(&self, id: &JobId, state: JobState, failure: Option<FailureReason>) {
        let mut watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = watchers.get(id) {
            tx.send_replace(Progress { state, failure });
        }
        if state.is_terminal() {
            watchers.remove(id);
        }
    }
}
