//! Periodic reclamation of transient files and stale job records.
//!
//! Anything older than the retention horizon goes: files by modification
//! time, job records by creation time. Files marked in use are left for a
//! later pass. A swept job that still holds a reservation nobody else will
//! settle gets it released here, and idle usage records are pruned.

use std::sync::Arc;
use std::time::{Duration, SystemTime};
use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::watch;
use crate::job::JobTable;
use crate::quota::QuotaTracker;
use crate::transient::TransientStore;

/// Outcome of one sweep pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub files_deleted: usize,
    pub files_skipped_in_use: usize,
    pub jobs_removed: usize,
    pub reservations_released: usize,
    pub usage_pruned: usize,
    pub errors: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.files_deleted == 0
            && self.jobs_removed == 0
            && self.reservations_released == 0
            && self.usage_pruned == 0
            && self.errors == 0
    }
}

pub struct Sweeper {
    transient: Arc<TransientStore>,
    jobs: Arc<JobTable>,
    quota: Arc<QuotaTracker>,
    retention: Duration,
    interval: Duration,
}

impl Sweeper {
    pub fn new(
        transient: Arc<TransientStore>,
        jobs: Arc<JobTable>,
        quota: Arc<QuotaTracker>,
        retention: Duration,
        interval: Duration,
    ) -> Self {
        Sweeper {
            transient,
            jobs,
            quota,
            retention,
            interval,
        }
    }

    /// Run a single pass. Per-item failures are logged and counted; the pass
    /// always visits everything.
    pub fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        self.sweep_files(&mut report);
        self.sweep_jobs(&mut report);
        match self.quota.prune_idle() {
            Ok(pruned) => report.usage_pruned = pruned,
            Err(e) => {
                warn!("Sweep: cannot prune usage records: {}", e);
                report.errors += 1;
            }
        }

        if report.is_empty() {
            debug!("Sweep: nothing to reclaim");
        } else {
            info!(
                "Sweep: deleted {} files, removed {} jobs ({} reservations released), skipped {} in-use files, pruned {} usage records, {} errors",
                report.files_deleted,
                report.jobs_removed,
                report.reservations_released,
                report.files_skipped_in_use,
                report.usage_pruned,
                report.errors
            );
        }
        report
    }

    fn sweep_files(&self, report: &mut SweepReport) {
        let files = match self.transient.list() {
            Ok(files) => files,
            Err(e) => {
                warn!("Sweep: cannot list transient storage: {}", e);
                report.errors += 1;
                return;
            }
        };

        let now = SystemTime::now();
        for file in files {
            // Future mtimes (clock skew) count as fresh
            let age = now.duration_since(file.modified).unwrap_or(Duration::ZERO);
            if age < self.retention {
                continue;
            }
            if self.transient.is_in_use(&file.path) {
                debug!("Sweep: {} is in use, skipping", file.path.display());
                report.files_skipped_in_use += 1;
                continue;
            }
            match self.transient.remove(&file.path) {
                Ok(true) => {
                    debug!("Sweep: deleted {}", file.path.display());
                    report.files_deleted += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Sweep: {}", e);
                    report.errors += 1;
                }
            }
        }
    }

    fn sweep_jobs(&self, report: &mut SweepReport) {
        let jobs = match self.jobs.all() {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("Sweep: cannot read job table: {}", e);
                report.errors += 1;
                return;
            }
        };

        let now = Utc::now();
        for job in jobs {
            let age = job.age(now).to_std().unwrap_or(Duration::ZERO);
            if age < self.retention {
                continue;
            }
            match self.jobs.remove(&job.id) {
                Ok(Some(removed)) => {
                    debug!("Job {}: record expired in state {}", removed.id, removed.state);
                    report.jobs_removed += 1;
                    // Claimed jobs settle their own reservation when they find the record gone
                    if removed.holds_unclaimed_reservation() {
                        match self.quota.release(&removed.owner) {
                            Ok(()) => {
                                info!("Job {}: released reservation of never-submitted job for {}", removed.id, removed.owner);
                                report.reservations_released += 1;
                            }
                            Err(e) => {
                                warn!("Job {}: failed to release reservation: {}", removed.id, e);
                                report.errors += 1;
                            }
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Job {}: failed to remove expired record: {}", job.id, e);
                    report.errors += 1;
                }
            }
        }
    }

    /// Sweep every `interval` until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Sweeper started: retention {}s, interval {}s",
            self.retention.as_secs(),
            self.interval.as_secs()
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let sweeper = Arc::clone(&self);
                    if let Err(e) = tokio::task::spawn_blocking(move || sweeper.sweep_once()).await {
                        warn!("Sweep pass panicked: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Sweeper stopped");
    }
}
