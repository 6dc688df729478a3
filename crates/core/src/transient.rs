//! Transient input/output files and the in-use registry that keeps the
//! sweeper away from files a job or a delivery is touching.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;
use log::{debug, info, warn};
use crate::error::{StorageError, StorageResult};
use crate::job::JobId;

/// A file currently present in transient storage
#[derive(Debug, Clone)]
pub struct TransientFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: SystemTime,
}

/// Directory-backed transient storage
#[derive(Debug)]
pub struct TransientStore {
    root: PathBuf,
    in_use: Mutex<HashMap<PathBuf, usize>>,
}

impl TransientStore {
    pub fn new(root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(TransientStore {
            root: root.into(),
            in_use: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_dir(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.root).map_err(|e| StorageError::io(&self.root, e))
    }

    /// Path of the uploaded input for a job
    pub fn input_path(&self, job_id: &JobId, extension: &str) -> PathBuf {
        self.root.join(format!("{}.input.{}", job_id, extension))
    }

    /// Path the encoder writes the converted artifact to
    pub fn output_path(&self, job_id: &JobId, container: &str) -> PathBuf {
        self.root.join(format!("{}.output.{}", job_id, container))
    }

    /// Path an upload is streamed to before it is accepted
    pub fn partial_path(&self, job_id: &JobId) -> PathBuf {
        self.root.join(format!("{}.upload.part", job_id))
    }

    /// Mark `path` as in use until the returned guard is dropped
    pub fn mark_in_use(self: &Arc<Self>, path: &Path) -> InUseGuard {
        let mut in_use = self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        *in_use.entry(path.to_path_buf()).or_insert(0) += 1;
        InUseGuard {
            store: Arc::clone(self),
            path: path.to_path_buf(),
        }
    }

    pub fn is_in_use(&self, path: &Path) -> bool {
        let in_use = self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        in_use.contains_key(path)
    }

    fn unmark(&self, path: &Path) {
        let mut in_use = self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = in_use.get_mut(path) {
            *count -= 1;
            if *count == 0 {
                in_use.remove(path);
            }
        }
    }

    /// Delete a file. A file that is already gone counts as deleted.
    pub fn remove(&self, path: &Path) -> StorageResult<bool> {
        match fs::remove_file(path) {
            Ok(()) => {
                debug!("Deleted transient file: {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    /// Best-effort delete used on cleanup paths; failures are logged only
    pub fn discard(&self, path: &Path) {
        if let Err(e) = self.remove(path) {
            warn!("Failed to delete transient file {}: {}", path.display(), e);
        }
    }

    /// Files in the transient directory (non-recursive)
    pub fn list(&self) -> StorageResult<Vec<TransientFile>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(&self.root, e)),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Error reading transient directory entry: {}", e);
                    continue;
                }
            };
            let path = entry.path();
            let metadata = match entry.metadata() {
                Ok(m) => m,
                // raced with a delete
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!("Failed to stat transient file {}: {}", path.display(), e);
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }
            files.push(TransientFile {
                path,
                size_bytes: metadata.len(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        Ok(files)
    }

    /// Delete every file not marked in use. Used at startup, when no job
    /// record can reference what a previous process left behind.
    pub fn purge_all(&self) -> StorageResult<usize> {
        let mut cleaned = 0;
        for file in self.list()? {
            if self.is_in_use(&file.path) {
                continue;
            }
            match self.remove(&file.path) {
                Ok(true) => {
                    info!("🗑️  Deleted orphaned transient file: {}", file.path.display());
                    cleaned += 1;
                }
                Ok(false) => {}
                Err(e) => warn!("{}", e),
            }
        }
        Ok(cleaned)
    }
}

/// Keeps a transient file marked in use while alive
#[derive(Debug)]
pub struct InUseGuard {
    store: Arc<TransientStore>,
    path: PathBuf,
}

impl InUseGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InUseGuard {
    fn drop(&mut self) {
        self.store.unmark(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_are_scoped_to_job() {
        let store = TransientStore::new("/var/tmp/convert");
        let id = JobId::new();
        let input = store.input_path(&id, "mkv");
        let output = store.output_path(&id, "mp4");
        assert_eq!(input.parent(), Some(Path::new("/var/tmp/convert")));
        assert!(input.to_string_lossy().ends_with(".input.mkv"));
        assert!(output.to_string_lossy().ends_with(".output.mp4"));
        assert!(input.to_string_lossy().contains(&id.to_string()));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = TransientStore::new(dir.path());
        let path = dir.path().join("a.bin");
        fs::write(&path, b"data").unwrap();

        assert!(store.remove(&path).unwrap());
        assert!(!store.remove(&path).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_in_use_guards_are_counted() {
        let store = TransientStore::new("/tmp");
        let path = Path::new("/tmp/x.input.mp4");

        let first = store.mark_in_use(path);
        let second = store.mark_in_use(path);
        assert!(store.is_in_use(path));
        drop(first);
        assert!(store.is_in_use(path));
        drop(second);
        assert!(!store.is_in_use(path));
    }

    #[test]
    fn test_purge_all_skips_in_use_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = TransientStore::new(dir.path());
        let busy = dir.path().join("busy.input.mp4");
        let stale = dir.path().join("stale.output.mp4");
        fs::write(&busy, b"busy").unwrap();
        fs::write(&stale, b"stale").unwrap();

        let _guard = store.mark_in_use(&busy);
        assert_eq!(store.purge_all().unwrap(), 1);
        assert!(busy.exists());
        assert!(!stale.exists());
    }

    #[test]
    fn test_list_missing_root_is_empty() {
        let store = TransientStore::new("/nonexistent/convertd/transient");
        assert!(store.list().unwrap().is_empty());
    }
}
