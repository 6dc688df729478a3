//! Service composition root.
//!
//! `ServiceContext` owns every table and component and is passed explicitly
//! to whatever needs it. Nothing in the crate is global.

use std::path::Path;
use std::sync::Arc;
use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use crate::admission::{Admission, AdmissionController};
use crate::config::ServiceConfig;
use crate::engine::{EngineSettings, JobEngine, OutputHandle};
use crate::error::{AdmissionError, ConversionError, StorageResult};
use crate::identity::Identity;
use crate::job::{Job, JobId, JobTable};
use crate::policy::{PremiumRegistry, TierPolicyResolver};
use crate::quota::QuotaTracker;
use crate::store::MemoryStore;
use crate::sweeper::Sweeper;
use crate::transient::TransientStore;

/// Aggregate counters for the presentation layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStats {
    pub total_users: usize,
    pub total_conversions: u64,
    /// Jobs in `Admitted` or `Running`
    pub active_jobs: usize,
    pub premium_count: usize,
}

pub struct ServiceContext {
    config: ServiceConfig,
    premium: Arc<PremiumRegistry>,
    resolver: Arc<TierPolicyResolver>,
    quota: Arc<QuotaTracker>,
    transient: Arc<TransientStore>,
    jobs: Arc<JobTable>,
    admission: AdmissionController,
    engine: Arc<JobEngine>,
    sweeper: Arc<Sweeper>,
}

impl ServiceContext {
    /// Wire up all components over in-memory tables
    pub fn new(config: ServiceConfig) -> Self {
        Self::with_engine_settings(EngineSettings::from_config(&config.encoder), config)
    }

    pub fn with_engine_settings(settings: EngineSettings, config: ServiceConfig) -> Self {
        let premium = Arc::new(PremiumRegistry::new(Arc::new(MemoryStore::new())));
        let resolver = Arc::new(TierPolicyResolver::new(config.tiers.clone(), Arc::clone(&premium)));
        let quota = Arc::new(QuotaTracker::new(Arc::new(MemoryStore::new()), config.quota_window()));
        let transient = TransientStore::new(config.storage.transient_dir.clone());
        let jobs = Arc::new(JobTable::new(Arc::new(MemoryStore::new())));

        let admission = AdmissionController::new(
            &config.allowed_mime_types,
            Arc::clone(&resolver),
            Arc::clone(&quota),
            Arc::clone(&transient),
            Arc::clone(&jobs),
            settings.profile.container.clone(),
        );
        let engine = JobEngine::new(Arc::clone(&jobs), Arc::clone(&quota), Arc::clone(&transient), settings);
        let sweeper = Arc::new(Sweeper::new(
            Arc::clone(&transient),
            Arc::clone(&jobs),
            Arc::clone(&quota),
            config.retention(),
            config.sweep_interval(),
        ));

        ServiceContext {
            config,
            premium,
            resolver,
            quota,
            transient,
            jobs,
            admission,
            engine,
            sweeper,
        }
    }

    /// Create the transient directory and drop whatever a previous process
    /// left in it. Returns the number of files removed.
    pub fn prepare_storage(&self) -> Result<usize> {
        self.transient
            .ensure_dir()
            .with_context(|| format!("Failed to create transient dir: {}", self.transient.root().display()))?;
        let purged = self.transient.purge_all().context("Failed to purge transient dir")?;
        if purged > 0 {
            info!("Startup: purged {} leftover transient files", purged);
        }
        Ok(purged)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<JobEngine> {
        &self.engine
    }

    pub fn sweeper(&self) -> Arc<Sweeper> {
        Arc::clone(&self.sweeper)
    }

    pub fn grant_premium(&self, identity: &Identity) -> StorageResult<bool> {
        self.premium.grant(identity)
    }

    pub fn revoke_premium(&self, identity: &Identity) -> StorageResult<bool> {
        self.premium.revoke(identity)
    }

    pub fn is_premium(&self, identity: &Identity) -> StorageResult<bool> {
        self.premium.is_premium(identity)
    }

    /// Conversions left in the current window; `None` means unlimited
    pub fn remaining(&self, identity: &Identity) -> StorageResult<Option<u32>> {
        match self.resolver.resolve(identity)?.quota_per_window {
            Some(quota) => Ok(Some(self.quota.remaining(identity, quota)?)),
            None => Ok(None),
        }
    }

    pub fn stats(&self) -> StorageResult<ServiceStats> {
        let jobs = self.jobs.all()?;
        let active_jobs = jobs.iter().filter(|j| !j.state.is_terminal()).count();
        Ok(ServiceStats {
            total_users: self.quota.total_users(),
            total_conversions: self.quota.total_conversions(),
            active_jobs,
            premium_count: self.premium.count()?,
        })
    }

    /// Every live job record, oldest first
    pub fn jobs(&self) -> StorageResult<Vec<Job>> {
        self.jobs.all()
    }

    pub async fn admit<R>(
        &self,
        identity: &Identity,
        mime_type: &str,
        declared_size: u64,
        reader: R,
    ) -> Result<Admission, AdmissionError>
    where
        R: AsyncRead + Unpin,
    {
        self.admission.admit(identity, mime_type, declared_size, reader).await
    }

    pub async fn admit_file(
        &self,
        identity: &Identity,
        mime_type: &str,
        spooled: &Path,
        declared_size: Option<u64>,
    ) -> Result<Admission, AdmissionError> {
        self.admission.admit_file(identity, mime_type, spooled, declared_size).await
    }

    pub fn submit(&self, job_id: JobId) -> Result<(), ConversionError> {
        self.engine.submit(job_id)
    }

    /// Give up on an admitted job that will not be submitted
    pub fn abandon(&self, job_id: JobId) -> Result<bool, ConversionError> {
        self.engine.abandon(job_id)
    }

    pub async fn await_result(&self, job_id: JobId) -> Result<OutputHandle, ConversionError> {
        self.engine.await_result(job_id).await
    }

    pub fn finish_delivery(&self, job_id: JobId) -> Result<bool, ConversionError> {
        self.engine.finish_delivery(job_id)
    }
}
