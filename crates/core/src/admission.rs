//! Upload admission: MIME allow-list, tier ceiling, quota, then storage.
//!
//! Gates run in that order and the first failure wins. Whatever bytes a
//! rejected request already put on disk are deleted before the error is
//! returned, and a reservation taken for it is released.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use crate::error::{AdmissionError, StorageError};
use crate::identity::Identity;
use crate::job::{Job, JobId, JobTable};
use crate::policy::{TierPolicy, TierPolicyResolver};
use crate::quota::QuotaTracker;
use crate::transient::TransientStore;

/// Accepted upload, with a job waiting in `Admitted`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub job_id: JobId,
    pub size_bytes: u64,
    pub is_premium: bool,
    /// Conversions left in the window; `None` for unlimited tiers
    pub remaining: Option<u32>,
}

/// Result of the policy gates, before any bytes are accepted
struct Ticket {
    policy: TierPolicy,
    mime_type: String,
    reserved: bool,
    remaining: Option<u32>,
}

pub struct AdmissionController {
    allowed_mime_types: HashSet<String>,
    resolver: Arc<TierPolicyResolver>,
    quota: Arc<QuotaTracker>,
    transient: Arc<TransientStore>,
    jobs: Arc<JobTable>,
    output_container: String,
}

impl AdmissionController {
    pub fn new(
        allowed_mime_types: &[String],
        resolver: Arc<TierPolicyResolver>,
        quota: Arc<QuotaTracker>,
        transient: Arc<TransientStore>,
        jobs: Arc<JobTable>,
        output_container: impl Into<String>,
    ) -> Self {
        AdmissionController {
            allowed_mime_types: allowed_mime_types.iter().map(|m| normalize_mime(m)).collect(),
            resolver,
            quota,
            transient,
            jobs,
            output_container: output_container.into(),
        }
    }

    /// Admit an upload streamed from `reader`.
    ///
    /// The declared size is checked before anything is written; the observed
    /// size is enforced while streaming and must match the declared one.
    pub async fn admit<R>(
        &self,
        identity: &Identity,
        declared_mime: &str,
        declared_size: u64,
        reader: R,
    ) -> Result<Admission, AdmissionError>
    where
        R: AsyncRead + Unpin,
    {
        let ticket = self.check_gates(identity, declared_mime, declared_size)?;
        let limit = ticket.policy.max_upload_bytes;
        let job_id = JobId::new();
        let partial = self.transient.partial_path(&job_id);

        let written = {
            let _guard = self.transient.mark_in_use(&partial);
            match stream_to_file(reader, &partial, limit).await {
                Ok(n) => n,
                Err(e) => {
                    self.transient.discard(&partial);
                    self.release(identity, &ticket);
                    return Err(e.into());
                }
            }
        };

        if let Err(e) = self.check_observed_size(identity, written, Some(declared_size), &ticket) {
            self.transient.discard(&partial);
            self.release(identity, &ticket);
            return Err(e);
        }

        let input = self.transient.input_path(&job_id, extension_for_mime(&ticket.mime_type));
        if let Err(e) = fs::rename(&partial, &input) {
            self.transient.discard(&partial);
            self.release(identity, &ticket);
            return Err(StorageError::io(&input, e).into());
        }

        self.register(identity, job_id, input, written, ticket)
    }

    /// Admit an upload the transport already wrote to `spooled`.
    ///
    /// On rejection the spooled file is deleted; on success it is moved into
    /// transient storage with a fresh modification time. Without a declared
    /// size the file's own size stands in for it.
    pub async fn admit_file(
        &self,
        identity: &Identity,
        declared_mime: &str,
        spooled: &Path,
        declared_size: Option<u64>,
    ) -> Result<Admission, AdmissionError> {
        let size = match fs::metadata(spooled) {
            Ok(m) => m.len(),
            Err(e) => return Err(StorageError::io(spooled, e).into()),
        };

        let ticket = match self.check_gates(identity, declared_mime, declared_size.unwrap_or(size)) {
            Ok(ticket) => ticket,
            Err(e) => {
                self.transient.discard(spooled);
                return Err(e);
            }
        };

        if let Err(e) = self.check_observed_size(identity, size, declared_size, &ticket) {
            self.transient.discard(spooled);
            self.release(identity, &ticket);
            return Err(e);
        }

        let job_id = JobId::new();
        let input = self.transient.input_path(&job_id, extension_for_mime(&ticket.mime_type));
        if let Err(e) = move_file(spooled, &input).and_then(|_| touch(&input)) {
            self.transient.discard(spooled);
            self.transient.discard(&input);
            self.release(identity, &ticket);
            return Err(e.into());
        }

        self.register(identity, job_id, input, size, ticket)
    }

    /// Type, declared size and quota gates, in that order
    fn check_gates(
        &self,
        identity: &Identity,
        declared_mime: &str,
        declared_size: u64,
    ) -> Result<Ticket, AdmissionError> {
        let mime_type = normalize_mime(declared_mime);
        if !self.allowed_mime_types.contains(&mime_type) {
            info!("Rejected upload from {}: unsupported type {:?}", identity, declared_mime);
            return Err(AdmissionError::UnsupportedType(declared_mime.to_string()));
        }

        let policy = self.resolver.resolve(identity)?;
        if declared_size > policy.max_upload_bytes {
            info!(
                "Rejected upload from {}: {} bytes over {} byte ceiling (premium: {})",
                identity, declared_size, policy.max_upload_bytes, policy.is_premium
            );
            return Err(AdmissionError::FileTooLarge {
                size: declared_size,
                limit: policy.max_upload_bytes,
                upgrade_hint: !policy.is_premium,
            });
        }
        if declared_size == 0 {
            return Err(AdmissionError::EmptyUpload);
        }

        let (reserved, remaining) = match policy.quota_per_window {
            Some(quota) => {
                let decision = self.quota.check_and_reserve(identity, quota)?;
                if !decision.allowed {
                    info!("Rejected upload from {}: quota of {} exhausted", identity, quota);
                    return Err(AdmissionError::QuotaExceeded {
                        quota,
                        window_secs: self.quota.window().as_secs(),
                    });
                }
                (true, Some(decision.remaining))
            }
            None => (false, None),
        };

        Ok(Ticket {
            policy,
            mime_type,
            reserved,
            remaining,
        })
    }

    fn check_observed_size(
        &self,
        identity: &Identity,
        observed: u64,
        declared: Option<u64>,
        ticket: &Ticket,
    ) -> Result<(), AdmissionError> {
        if observed > ticket.policy.max_upload_bytes {
            return Err(AdmissionError::FileTooLarge {
                size: observed,
                limit: ticket.policy.max_upload_bytes,
                upgrade_hint: !ticket.policy.is_premium,
            });
        }
        if observed == 0 {
            return Err(AdmissionError::EmptyUpload);
        }
        match declared {
            Some(declared) if declared != observed => {
                info!(
                    "Rejected upload from {}: declared {} bytes, received {}",
                    identity, declared, observed
                );
                Err(AdmissionError::SizeMismatch { declared, observed })
            }
            _ => Ok(()),
        }
    }

    fn register(
        &self,
        identity: &Identity,
        job_id: JobId,
        input: PathBuf,
        size_bytes: u64,
        ticket: Ticket,
    ) -> Result<Admission, AdmissionError> {
        let output = self.transient.output_path(&job_id, &self.output_container);
        let job = Job::new(
            job_id,
            identity.clone(),
            input.clone(),
            output,
            size_bytes,
            ticket.mime_type.clone(),
            ticket.reserved,
        );

        if let Err(e) = self.jobs.insert(job) {
            self.transient.discard(&input);
            self.release(identity, &ticket);
            return Err(e.into());
        }

        info!(
            "Job {}: admitted {} bytes ({}) from {}",
            job_id, size_bytes, ticket.mime_type, identity
        );
        Ok(Admission {
            job_id,
            size_bytes,
            is_premium: ticket.policy.is_premium,
            remaining: ticket.remaining,
        })
    }

    fn release(&self, identity: &Identity, ticket: &Ticket) {
        if ticket.reserved {
            if let Err(e) = self.quota.release(identity) {
                warn!("Failed to release quota reservation for {}: {}", identity, e);
            }
        }
    }
}

/// Copy at most `limit + 1` bytes so an oversized stream is detected
/// without reading it to the end.
async fn stream_to_file<R>(reader: R, path: &Path, limit: u64) -> Result<u64, StorageError>
where
    R: AsyncRead + Unpin,
{
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| StorageError::io(path, e))?;
    let mut limited = reader.take(limit.saturating_add(1));
    let written = tokio::io::copy(&mut limited, &mut file)
        .await
        .map_err(|e| StorageError::io(path, e))?;
    file.flush().await.map_err(|e| StorageError::io(path, e))?;
    debug!("Streamed {} bytes to {}", written, path.display());
    Ok(written)
}

/// Rename, falling back to copy + delete across filesystems
fn move_file(from: &Path, to: &Path) -> Result<(), StorageError> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::io(from, e)),
        Err(_) => {
            fs::copy(from, to).map_err(|e| StorageError::io(to, e))?;
            fs::remove_file(from).map_err(|e| StorageError::io(from, e))
        }
    }
}

/// Reset the modification time; a rename keeps the spooled file's, which
/// the sweeper would otherwise judge the input by
fn touch(path: &Path) -> Result<(), StorageError> {
    fs::OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|f| f.set_modified(SystemTime::now()))
        .map_err(|e| StorageError::io(path, e))
}

/// Lowercase and strip parameters (`video/MP4; codecs=avc1` -> `video/mp4`)
pub fn normalize_mime(raw: &str) -> String {
    raw.split(';').next().unwrap_or("").trim().to_ascii_lowercase()
}

/// File extension used for a stored input of the given type
pub fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "video/mp4" => "mp4",
        "video/quicktime" => "mov",
        "video/x-matroska" => "mkv",
        "video/webm" | "audio/webm" => "webm",
        "video/x-msvideo" => "avi",
        "video/mpeg" => "mpg",
        "video/x-flv" => "flv",
        "video/3gpp" => "3gp",
        "audio/mpeg" => "mp3",
        "audio/mp4" => "m4a",
        "audio/aac" => "aac",
        "audio/wav" | "audio/x-wav" => "wav",
        "audio/ogg" => "ogg",
        "audio/flac" => "flac",
        _ => "bin",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServiceConfig, TierConfig, TierLimits};
    use crate::policy::PremiumRegistry;
    use crate::store::MemoryStore;
    use proptest::prelude::*;
    use std::time::Duration;

    const MIB: u64 = 1024 * 1024;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        controller: AdmissionController,
        premium: Arc<PremiumRegistry>,
        quota: Arc<QuotaTracker>,
        jobs: Arc<JobTable>,
    }

    fn fixture(tiers: TierConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("transient");
        let transient = TransientStore::new(&root);
        transient.ensure_dir().unwrap();

        let premium = Arc::new(PremiumRegistry::new(Arc::new(MemoryStore::new())));
        let resolver = Arc::new(TierPolicyResolver::new(tiers, Arc::clone(&premium)));
        let quota = Arc::new(QuotaTracker::new(Arc::new(MemoryStore::new()), Duration::from_secs(86_400)));
        let jobs = Arc::new(JobTable::new(Arc::new(MemoryStore::new())));
        let controller = AdmissionController::new(
            &ServiceConfig::default().allowed_mime_types,
            resolver,
            Arc::clone(&quota),
            transient,
            Arc::clone(&jobs),
            "mp4",
        );
        Fixture { _dir: dir, root, controller, premium, quota, jobs }
    }

    /// Small ceilings so streamed uploads stay cheap
    fn small_tiers() -> TierConfig {
        TierConfig {
            free: TierLimits { max_upload_bytes: 1024, quota_per_window: Some(5) },
            premium: TierLimits { max_upload_bytes: 8192, quota_per_window: None },
        }
    }

    fn files_in(dir: &Path) -> usize {
        fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    fn id(raw: &str) -> Identity {
        Identity::new(raw).unwrap()
    }

    #[test]
    fn test_mime_normalization() {
        assert_eq!(normalize_mime("Video/MP4; codecs=\"avc1\""), "video/mp4");
        assert_eq!(normalize_mime("  audio/mpeg "), "audio/mpeg");
        assert_eq!(extension_for_mime("video/x-matroska"), "mkv");
        assert_eq!(extension_for_mime("application/x-unknown"), "bin");
    }

    #[tokio::test]
    async fn test_unsupported_type_writes_nothing() {
        let fx = fixture(small_tiers());
        let err = fx
            .controller
            .admit(&id("a"), "application/pdf", 10, &b"%PDF-1.7.."[..])
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::UnsupportedType(_)));
        assert_eq!(files_in(&fx.root), 0);
        assert!(fx.quota.usage(&id("a")).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_declared_oversize_rejected_with_upgrade_hint() {
        let fx = fixture(small_tiers());
        let payload = vec![0u8; 2048];
        let err = fx
            .controller
            .admit(&id("b"), "video/mp4", 2048, &payload[..])
            .await
            .unwrap_err();
        match err {
            AdmissionError::FileTooLarge { size, limit, upgrade_hint } => {
                assert_eq!(size, 2048);
                assert_eq!(limit, 1024);
                assert!(upgrade_hint);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(files_in(&fx.root), 0);
        assert_eq!(fx.quota.remaining(&id("b"), 5).unwrap(), 5);
    }

    #[tokio::test]
    async fn test_understated_size_caught_while_streaming() {
        let fx = fixture(small_tiers());
        let payload = vec![7u8; 4096];
        let err = fx
            .controller
            .admit(&id("c"), "video/mp4", 100, &payload[..])
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::FileTooLarge { upgrade_hint: true, .. }));
        assert_eq!(files_in(&fx.root), 0, "partial upload must be deleted");
        let usage = fx.quota.usage(&id("c")).unwrap().unwrap();
        assert_eq!(usage.reserved, 0);
        assert_eq!(usage.conversion_count, 0);
        assert_eq!(fx.jobs.len().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_accepted_upload_creates_admitted_job() {
        let fx = fixture(small_tiers());
        let admission = fx
            .controller
            .admit(&id("d"), "video/mp4", 512, &vec![1u8; 512][..])
            .await
            .unwrap();
        assert_eq!(admission.size_bytes, 512);
        assert_eq!(admission.remaining, Some(4));
        assert!(!admission.is_premium);

        let job = fx.jobs.get(&admission.job_id).unwrap().unwrap();
        assert_eq!(job.state, crate::job::JobState::Admitted);
        assert!(job.quota_reserved);
        assert_eq!(fs::metadata(&job.input_path).unwrap().len(), 512);
        assert!(job.input_path.to_string_lossy().ends_with(".input.mp4"));
        assert!(!job.output_path.exists());
        assert_eq!(files_in(&fx.root), 1);
    }

    #[tokio::test]
    async fn test_sixth_upload_exceeds_quota() {
        let fx = fixture(small_tiers());
        let who = id("10.0.0.1");
        for _ in 0..5 {
            fx.controller.admit(&who, "video/mp4", 64, &[0u8; 64][..]).await.unwrap();
        }
        let err = fx.controller.admit(&who, "video/mp4", 64, &[0u8; 64][..]).await.unwrap_err();
        assert!(matches!(err, AdmissionError::QuotaExceeded { quota: 5, .. }));
        assert_eq!(files_in(&fx.root), 5);
    }

    #[tokio::test]
    async fn test_default_tier_scenario_with_declared_sizes() {
        // 50 MiB x5 accepted, 6th over quota; 150 MiB rejected without consuming quota.
        let fx = fixture(TierConfig::default());
        let dir = tempfile::tempdir().unwrap();
        let who = id("scenario");

        let oversized = dir.path().join("big.mp4");
        let f = fs::File::create(&oversized).unwrap();
        f.set_len(150 * MIB).unwrap();
        let err = fx.controller.admit_file(&who, "video/mp4", &oversized, None).await.unwrap_err();
        assert!(err.upgrade_hint());
        assert!(!oversized.exists());
        assert_eq!(fx.quota.remaining(&who, 5).unwrap(), 5);

        for i in 0..5 {
            let upload = dir.path().join(format!("clip{}.mp4", i));
            fs::File::create(&upload).unwrap().set_len(50 * MIB).unwrap();
            fx.controller.admit_file(&who, "video/mp4", &upload, Some(50 * MIB)).await.unwrap();
            assert!(!upload.exists());
        }

        let sixth = dir.path().join("clip6.mp4");
        fs::File::create(&sixth).unwrap().set_len(50 * MIB).unwrap();
        let err = fx.controller.admit_file(&who, "video/mp4", &sixth, None).await.unwrap_err();
        assert!(matches!(err, AdmissionError::QuotaExceeded { .. }));
        assert!(!sixth.exists(), "rejected spool file must be deleted");
    }

    #[tokio::test]
    async fn test_premium_bypasses_ceiling_and_quota() {
        let fx = fixture(small_tiers());
        let x = id("x");
        fx.premium.grant(&x).unwrap();

        // between free (1 KiB) and premium (8 KiB) ceilings
        for _ in 0..7 {
            let admission = fx
                .controller
                .admit(&x, "audio/mpeg", 4096, &vec![3u8; 4096][..])
                .await
                .unwrap();
            assert!(admission.is_premium);
            assert_eq!(admission.remaining, None);
        }
        assert!(fx.quota.usage(&x).unwrap().is_none());

        let err = fx
            .controller
            .admit(&x, "audio/mpeg", 9000, &vec![3u8; 9000][..])
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::FileTooLarge { upgrade_hint: false, .. }));
    }

    #[tokio::test]
    async fn test_declared_size_must_match_stream() {
        let fx = fixture(small_tiers());
        let who = id("f");
        let err = fx
            .controller
            .admit(&who, "video/mp4", 10, &[5u8; 20][..])
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::SizeMismatch { declared: 10, observed: 20 }), "{:?}", err);
        assert!(!err.upgrade_hint());
        assert_eq!(files_in(&fx.root), 0);
        assert_eq!(fx.quota.remaining(&who, 5).unwrap(), 5);
        assert_eq!(fx.jobs.len().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_spooled_size_mismatch_deletes_spool_file() {
        let fx = fixture(small_tiers());
        let dir = tempfile::tempdir().unwrap();
        let who = id("g");
        let upload = dir.path().join("clip.mp4");
        fs::write(&upload, [1u8; 300]).unwrap();

        let err = fx
            .controller
            .admit_file(&who, "video/mp4", &upload, Some(200))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::SizeMismatch { declared: 200, observed: 300 }));
        assert!(!upload.exists());
        assert_eq!(files_in(&fx.root), 0);
        assert_eq!(fx.quota.usage(&who).unwrap().unwrap().reserved, 0);
    }

    #[tokio::test]
    async fn test_spooled_input_gets_fresh_mtime() {
        let fx = fixture(small_tiers());
        let dir = tempfile::tempdir().unwrap();
        let upload = dir.path().join("archived.mp4");
        fs::write(&upload, [2u8; 100]).unwrap();
        let two_hours_ago = SystemTime::now() - Duration::from_secs(2 * 3600);
        fs::File::options().write(true).open(&upload).unwrap().set_modified(two_hours_ago).unwrap();

        let admission = fx.controller.admit_file(&id("h"), "video/mp4", &upload, Some(100)).await.unwrap();
        let job = fx.jobs.get(&admission.job_id).unwrap().unwrap();
        let modified = fs::metadata(&job.input_path).unwrap().modified().unwrap();
        let age = SystemTime::now().duration_since(modified).unwrap_or_default();
        assert!(age < Duration::from_secs(60), "input mtime is {:?} old", age);
    }

    #[tokio::test]
    async fn test_empty_upload_is_rejected() {
        let fx = fixture(small_tiers());
        let err = fx.controller.admit(&id("e"), "video/webm", 0, &b""[..]).await.unwrap_err();
        assert!(matches!(err, AdmissionError::EmptyUpload));
        assert_eq!(files_in(&fx.root), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Whatever the declared size, a free-tier rejection leaves no file behind
        /// and consumes no quota.
        #[test]
        fn test_rejections_leave_nothing_behind(
            declared in 0u64..4096,
            actual in 0usize..4096,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let fx = fixture(small_tiers());
            let who = id("prop");
            let payload = vec![9u8; actual];
            let result = rt.block_on(fx.controller.admit(&who, "video/mp4", declared, &payload[..]));

            match result {
                Ok(admission) => {
                    prop_assert!(admission.size_bytes <= 1024);
                    prop_assert_eq!(files_in(&fx.root), 1);
                }
                Err(_) => {
                    prop_assert_eq!(files_in(&fx.root), 0);
                    prop_assert_eq!(fx.quota.remaining(&who, 5).unwrap(), 5);
                }
            }
        }
    }
}
