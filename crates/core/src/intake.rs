//! Spool-directory upload transport.
//!
//! A client drops the upload file and then a `<name>.request.json` manifest
//! next to it. Each scan picks up manifests whose upload has stopped growing,
//! runs them through admission and hands accepted jobs to the engine.
//! Outcomes are reported as `<key>.result.json` files in the outbox.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;
use crate::context::ServiceContext;
use crate::error::AdmissionError;
use crate::identity::Identity;
use crate::job::{Job, JobId, JobState};
use crate::snapshot::write_json_atomic;

const MANIFEST_SUFFIX: &str = ".request.json";
const RESULT_SUFFIX: &str = ".result.json";

/// Client-written description of a spooled upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestManifest {
    pub identity: String,
    pub mime_type: String,
    /// Upload file name, relative to the manifest's directory
    pub file_name: String,
    #[serde(default)]
    pub declared_size: Option<u64>,
}

/// A manifest whose upload is complete
#[derive(Debug, Clone)]
pub struct SpoolRequest {
    pub manifest_path: PathBuf,
    pub upload_path: PathBuf,
    pub manifest: RequestManifest,
    pub size_bytes: u64,
}

impl SpoolRequest {
    /// Outbox key for rejections: the manifest name without its suffix
    pub fn key(&self) -> String {
        manifest_key(&self.manifest_path)
    }
}

#[derive(Debug, Clone)]
pub enum SpoolEntry {
    Ready(SpoolRequest),
    /// Not ready yet (still copying); left alone for the next scan
    Pending(PathBuf, String),
    /// Unusable manifest; removed by [`process_spool`]
    Invalid(PathBuf, String),
}

/// Result reported back to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultManifest {
    pub job_id: Option<String>,
    pub identity: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub output_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub upgrade_hint: Option<bool>,
}

impl ResultManifest {
    pub fn from_job(job: &Job) -> Self {
        ResultManifest {
            job_id: Some(job.id.to_string()),
            identity: job.owner.to_string(),
            state: job.state.to_string(),
            output_path: (job.state == JobState::Succeeded).then(|| job.output_path.clone()),
            error: job.failure.as_ref().map(|f| f.summary()),
            upgrade_hint: None,
        }
    }

    pub fn rejected(identity: &str, err: &AdmissionError) -> Self {
        ResultManifest {
            job_id: None,
            identity: identity.to_string(),
            state: "rejected".to_string(),
            output_path: None,
            error: Some(err.to_string()),
            upgrade_hint: Some(err.upgrade_hint()),
        }
    }
}

fn manifest_key(manifest_path: &Path) -> String {
    let name = manifest_path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    name.strip_suffix(MANIFEST_SUFFIX).unwrap_or(name).to_string()
}

pub fn result_path(outbox_dir: &Path, key: &str) -> PathBuf {
    outbox_dir.join(format!("{}{}", key, RESULT_SUFFIX))
}

/// Find request manifests under `spool_dir` and check their uploads are
/// stable: sizes are sampled twice, `settle` apart.
pub async fn scan_spool(spool_dir: &Path, settle: Duration) -> Result<Vec<SpoolEntry>> {
    if !spool_dir.exists() {
        warn!("Spool directory does not exist: {}", spool_dir.display());
        return Ok(Vec::new());
    }

    let mut results = Vec::new();
    let mut candidates = Vec::new();

    for entry in WalkDir::new(spool_dir).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading spool entry: {}", e);
                continue;
            }
        };
        let path = entry.path();
        let is_manifest = path
            .file_name()
            .and_then(|s| s.to_str())
            .map_or(false, |name| name.ends_with(MANIFEST_SUFFIX));
        if !path.is_file() || !is_manifest {
            continue;
        }

        match read_manifest(path) {
            Ok((manifest, upload_path)) => {
                let size = match fs::metadata(&upload_path) {
                    Ok(m) => m.len(),
                    Err(_) => {
                        results.push(SpoolEntry::Pending(path.to_path_buf(), "upload not present yet".to_string()));
                        continue;
                    }
                };
                candidates.push((path.to_path_buf(), upload_path, manifest, size));
            }
            Err(reason) => {
                results.push(SpoolEntry::Invalid(path.to_path_buf(), reason));
            }
        }
    }

    if candidates.is_empty() {
        return Ok(results);
    }

    // Stable-file check: stat again after the settle delay
    debug!("Checking stability for {} spooled uploads", candidates.len());
    tokio::time::sleep(settle).await;

    for (manifest_path, upload_path, manifest, size0) in candidates {
        let size1 = match fs::metadata(&upload_path) {
            Ok(m) => m.len(),
            Err(e) => {
                results.push(SpoolEntry::Pending(manifest_path, format!("upload vanished: {}", e)));
                continue;
            }
        };
        if size1 != size0 {
            results.push(SpoolEntry::Pending(manifest_path, "upload still copying".to_string()));
            continue;
        }
        debug!("Spooled upload ready: {} ({} bytes)", upload_path.display(), size1);
        results.push(SpoolEntry::Ready(SpoolRequest {
            manifest_path,
            upload_path,
            manifest,
            size_bytes: size1,
        }));
    }

    Ok(results)
}

fn read_manifest(path: &Path) -> std::result::Result<(RequestManifest, PathBuf), String> {
    let content = fs::read_to_string(path).map_err(|e| format!("unreadable: {}", e))?;
    let manifest: RequestManifest =
        serde_json::from_str(&content).map_err(|e| format!("malformed manifest: {}", e))?;

    // A bare file name only; no traversal out of the spool
    let file_name = Path::new(&manifest.file_name);
    if file_name.file_name() != Some(file_name.as_os_str()) {
        return Err(format!("file_name must be a plain file name: {:?}", manifest.file_name));
    }
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let upload_path = dir.join(file_name);
    Ok((manifest, upload_path))
}

/// Admit a ready request and submit its job. The manifest is consumed either
/// way; a rejection is written to the outbox straight away. A job that cannot
/// be submitted is abandoned so it holds no reservation.
pub async fn handle_request(ctx: &ServiceContext, request: &SpoolRequest, outbox_dir: &Path) -> Result<Option<JobId>> {
    let manifest = &request.manifest;
    let outcome = match Identity::new(manifest.identity.clone()) {
        Ok(identity) => {
            ctx.admit_file(&identity, &manifest.mime_type, &request.upload_path, manifest.declared_size)
                .await
        }
        Err(e) => {
            remove_quietly(&request.upload_path);
            Err(AdmissionError::Storage(e))
        }
    };
    remove_quietly(&request.manifest_path);

    match outcome {
        Ok(admission) => {
            if let Err(e) = ctx.submit(admission.job_id) {
                if let Err(abandon_err) = ctx.abandon(admission.job_id) {
                    warn!("Job {}: failed to abandon after submit error: {}", admission.job_id, abandon_err);
                }
                let result = ResultManifest {
                    job_id: Some(admission.job_id.to_string()),
                    identity: manifest.identity.clone(),
                    state: JobState::Failed.to_string(),
                    output_path: None,
                    error: Some(e.to_string()),
                    upgrade_hint: None,
                };
                write_json_atomic(&result_path(outbox_dir, &admission.job_id.to_string()), &result)?;
                return Err(e).with_context(|| format!("Failed to submit job {}", admission.job_id));
            }
            Ok(Some(admission.job_id))
        }
        Err(e) => {
            info!("Spool request {} rejected: {}", request.key(), e);
            let result = ResultManifest::rejected(&manifest.identity, &e);
            write_json_atomic(&result_path(outbox_dir, &request.key()), &result)?;
            Ok(None)
        }
    }
}

/// One intake pass: scan, drop invalid manifests, handle ready requests.
/// A request that fails is logged and the pass moves on. Returns the ids of
/// newly submitted jobs.
pub async fn process_spool(ctx: &ServiceContext, spool_dir: &Path, outbox_dir: &Path, settle: Duration) -> Result<Vec<JobId>> {
    let mut submitted = Vec::new();
    for entry in scan_spool(spool_dir, settle).await? {
        match entry {
            SpoolEntry::Ready(request) => match handle_request(ctx, &request, outbox_dir).await {
                Ok(Some(job_id)) => submitted.push(job_id),
                Ok(None) => {}
                Err(e) => error!("❌ Spool request {} failed: {:#}", request.key(), e),
            },
            SpoolEntry::Pending(path, reason) => {
                debug!("Spool request {} not ready: {}", path.display(), reason);
            }
            SpoolEntry::Invalid(path, reason) => {
                warn!("Dropping spool request {}: {}", path.display(), reason);
                let result = ResultManifest {
                    job_id: None,
                    identity: String::new(),
                    state: "rejected".to_string(),
                    output_path: None,
                    error: Some(reason),
                    upgrade_hint: None,
                };
                if let Err(e) = write_json_atomic(&result_path(outbox_dir, &manifest_key(&path)), &result) {
                    error!("❌ Failed to report invalid spool request {}: {:#}", path.display(), e);
                }
                remove_quietly(&path);
            }
        }
    }
    if !submitted.is_empty() {
        info!("Intake: submitted {} job(s) from spool", submitted.len());
    }
    Ok(submitted)
}

/// Write result manifests for tracked jobs that have finished and stop
/// tracking them. Jobs whose record vanished are dropped silently.
pub fn report_finished(ctx: &ServiceContext, outbox_dir: &Path, pending: &mut HashSet<JobId>) -> Result<usize> {
    let mut reported = 0;
    let mut done = Vec::new();
    for job_id in pending.iter() {
        match ctx.engine().job(job_id)? {
            Some(job) if job.state.is_terminal() => {
                let result = ResultManifest::from_job(&job);
                write_json_atomic(&result_path(outbox_dir, &job_id.to_string()), &result)?;
                info!("Job {}: result written ({})", job_id, job.state);
                reported += 1;
                done.push(*job_id);
            }
            Some(_) => {}
            None => {
                debug!("Job {}: record gone before its result was reported", job_id);
                done.push(*job_id);
            }
        }
    }
    for job_id in done {
        pending.remove(&job_id);
    }
    Ok(reported)
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{ServiceConfig, TierLimits};
    use crate::encoder::tests::stub_encoder;

    struct Dirs {
        _root: tempfile::TempDir,
        spool: PathBuf,
        outbox: PathBuf,
    }

    fn setup() -> (Dirs, ServiceContext) {
        let root = tempfile::tempdir().unwrap();
        let spool = root.path().join("spool");
        let outbox = root.path().join("outbox");
        fs::create_dir_all(&spool).unwrap();
        fs::create_dir_all(&outbox).unwrap();

        let mut config = ServiceConfig::default_config();
        config.storage.transient_dir = root.path().join("transient");
        config.tiers.free = TierLimits {
            max_upload_bytes: 64,
            quota_per_window: Some(5),
        };
        config.encoder.ffmpeg_bin = stub_encoder(
            root.path(),
            "ffmpeg",
            "for last; do :; done\nprintf 'converted' > \"$last\"",
        );
        let ctx = ServiceContext::new(config);
        ctx.prepare_storage().unwrap();
        (Dirs { _root: root, spool, outbox }, ctx)
    }

    fn spool_upload(spool: &Path, key: &str, identity: &str, mime: &str, payload: &[u8]) {
        let file_name = format!("{}.bin", key);
        fs::write(spool.join(&file_name), payload).unwrap();
        let manifest = RequestManifest {
            identity: identity.to_string(),
            mime_type: mime.to_string(),
            file_name,
            declared_size: Some(payload.len() as u64),
        };
        fs::write(
            spool.join(format!("{}{}", key, MANIFEST_SUFFIX)),
            serde_json::to_string(&manifest).unwrap(),
        )
        .unwrap();
    }

    fn read_result(outbox: &Path, key: &str) -> ResultManifest {
        let content = fs::read_to_string(result_path(outbox, key)).unwrap();
        serde_json::from_str(&content).unwrap()
    }

    #[tokio::test]
    async fn test_scan_classifies_manifests() {
        let (dirs, _ctx) = setup();
        spool_upload(&dirs.spool, "ready", "1.1.1.1", "video/mp4", b"payload");
        fs::write(dirs.spool.join("broken.request.json"), "{not json").unwrap();
        fs::write(
            dirs.spool.join("early.request.json"),
            r#"{"identity":"x","mime_type":"video/mp4","file_name":"missing.bin"}"#,
        )
        .unwrap();
        fs::write(
            dirs.spool.join("escape.request.json"),
            r#"{"identity":"x","mime_type":"video/mp4","file_name":"../etc/passwd"}"#,
        )
        .unwrap();

        let entries = scan_spool(&dirs.spool, Duration::from_millis(10)).await.unwrap();
        let ready = entries.iter().filter(|e| matches!(e, SpoolEntry::Ready(_))).count();
        let pending = entries.iter().filter(|e| matches!(e, SpoolEntry::Pending(..))).count();
        let invalid = entries.iter().filter(|e| matches!(e, SpoolEntry::Invalid(..))).count();
        assert_eq!((ready, pending, invalid), (1, 1, 2));
    }

    #[tokio::test]
    async fn test_accepted_request_reports_output() {
        let (dirs, ctx) = setup();
        spool_upload(&dirs.spool, "clip", "1.1.1.1", "video/mp4", b"payload");

        let submitted = process_spool(&ctx, &dirs.spool, &dirs.outbox, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(submitted.len(), 1);
        assert!(!dirs.spool.join("clip.request.json").exists());
        assert!(!dirs.spool.join("clip.bin").exists(), "upload moved into transient storage");

        let job_id = submitted[0];
        ctx.await_result(job_id).await.unwrap();

        let mut pending: HashSet<JobId> = submitted.into_iter().collect();
        assert_eq!(report_finished(&ctx, &dirs.outbox, &mut pending).unwrap(), 1);
        assert!(pending.is_empty());

        let result = read_result(&dirs.outbox, &job_id.to_string());
        assert_eq!(result.state, "succeeded");
        assert_eq!(result.identity, "1.1.1.1");
        assert!(result.output_path.unwrap().exists());
    }

    #[tokio::test]
    async fn test_failing_request_does_not_stop_the_pass() {
        let (dirs, ctx) = setup();
        // A file where the outbox should be: every result write fails
        fs::remove_dir(&dirs.outbox).unwrap();
        fs::write(&dirs.outbox, b"not a directory").unwrap();
        spool_upload(&dirs.spool, "doc", "3.3.3.3", "application/pdf", b"%PDF");
        spool_upload(&dirs.spool, "clip", "3.3.3.3", "video/mp4", b"payload");
        fs::write(dirs.spool.join("broken.request.json"), "{not json").unwrap();

        let submitted = process_spool(&ctx, &dirs.spool, &dirs.outbox, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(submitted.len(), 1, "accepted request still submitted");
        assert_eq!(fs::read_dir(&dirs.spool).unwrap().count(), 0, "every manifest consumed");
        ctx.await_result(submitted[0]).await.unwrap();
    }

    #[tokio::test]
    async fn test_declared_size_mismatch_is_rejected() {
        let (dirs, ctx) = setup();
        fs::write(dirs.spool.join("short.bin"), b"0123456789").unwrap();
        fs::write(
            dirs.spool.join("short.request.json"),
            r#"{"identity":"4.4.4.4","mime_type":"video/mp4","file_name":"short.bin","declared_size":4}"#,
        )
        .unwrap();

        let submitted = process_spool(&ctx, &dirs.spool, &dirs.outbox, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(submitted.is_empty());
        let result = read_result(&dirs.outbox, "short");
        assert_eq!(result.state, "rejected");
        assert!(result.error.unwrap().contains("declared size"));
        assert!(!dirs.spool.join("short.bin").exists());
        let user = Identity::new("4.4.4.4").unwrap();
        assert_eq!(ctx.remaining(&user).unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_rejected_request_writes_reason() {
        let (dirs, ctx) = setup();
        spool_upload(&dirs.spool, "huge", "2.2.2.2", "video/mp4", &[0u8; 100]);
        spool_upload(&dirs.spool, "doc", "2.2.2.2", "application/pdf", b"%PDF");

        let submitted = process_spool(&ctx, &dirs.spool, &dirs.outbox, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(submitted.is_empty());

        let huge = read_result(&dirs.outbox, "huge");
        assert_eq!(huge.state, "rejected");
        assert_eq!(huge.upgrade_hint, Some(true));
        let doc = read_result(&dirs.outbox, "doc");
        assert_eq!(doc.upgrade_hint, Some(false));

        assert_eq!(fs::read_dir(&dirs.spool).unwrap().count(), 0, "spool emptied");
        assert!(ctx.jobs().unwrap().is_empty());
    }
}
