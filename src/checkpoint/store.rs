//! Durable checkpoint persistence.
//!
//! - A reader never observes a half-written checkpoint (temp file, fsync,
//!   atomic rename, directory fsync)
//! - One engine instance per plan id at a time (exclusive lock file)
//! - A missing checkpoint is `Ok(None)`; an unreadable one is an error, never
//!   "assume a previous state"

use super::{Checkpoint, CompletionReceipt};
use crate::models::{is_valid_plan_id, StoreError};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Exclusive right to write a plan's checkpoint. Released on drop.
pub struct StoreLease {
    plan_id: String,
    _guard: Box<dyn std::any::Any + Send + Sync>,
}

impl StoreLease {
    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }
}

impl std::fmt::Debug for StoreLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreLease")
            .field("plan_id", &self.plan_id)
            .finish()
    }
}

/// Key/value persistence of checkpoints and completion receipts, keyed by
/// plan id.
pub trait CheckpointStore: Send + Sync {
    /// Take the per-plan writer lock. Fails with [`StoreError::Locked`] if
    /// another instance holds it.
    fn lock(&self, plan_id: &str) -> Result<StoreLease, StoreError>;

    fn save(&self, plan_id: &str, checkpoint: &Checkpoint) -> Result<(), StoreError>;

    /// `Ok(None)` if no checkpoint was ever written (or it was cleared).
    fn load(&self, plan_id: &str) -> Result<Option<Checkpoint>, StoreError>;

    fn clear(&self, plan_id: &str) -> Result<(), StoreError>;

    fn save_receipt(&self, receipt: &CompletionReceipt) -> Result<(), StoreError>;

    fn load_receipt(&self, plan_id: &str) -> Result<Option<CompletionReceipt>, StoreError>;

    fn clear_receipt(&self, plan_id: &str) -> Result<(), StoreError>;

    /// Plan ids with an active checkpoint.
    fn list(&self) -> Result<Vec<String>, StoreError>;
}

pub(super) fn check_plan_id(plan_id: &str) -> Result<(), StoreError> {
    if is_valid_plan_id(plan_id) {
        Ok(())
    } else {
        Err(StoreError::InvalidPlanId(plan_id.to_string()))
    }
}

// =============================================================================
// File store
// =============================================================================

/// Checkpoint store backed by a directory of JSON files.
///
/// Layout per plan id:
/// - `<id>.checkpoint.json`: active checkpoint
/// - `<id>.checkpoint.backup.json`: previous revision, for forensics only
/// - `<id>.receipt.json`: completion receipt
/// - `<id>.lock`: writer lock (holds the pid of the owner)
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn new(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)
            .map_err(|e| StoreError::io("creating checkpoint dir", dir, e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn checkpoint_path(&self, plan_id: &str) -> PathBuf {
        self.dir.join(format!("{plan_id}.checkpoint.json"))
    }

    pub fn backup_path(&self, plan_id: &str) -> PathBuf {
        self.dir.join(format!("{plan_id}.checkpoint.backup.json"))
    }

    pub fn receipt_path(&self, plan_id: &str) -> PathBuf {
        self.dir.join(format!("{plan_id}.receipt.json"))
    }

    fn lock_path(&self, plan_id: &str) -> PathBuf {
        self.dir.join(format!("{plan_id}.lock"))
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, StoreError> {
        let content = match fs::read(path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io("reading record", path, e)),
        };
        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io("removing record", path, e)),
        }
    }
}

/// Replace `path` with `value` so readers see either the old or the new
/// content, never a mix.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let content =
        serde_json::to_vec_pretty(value).map_err(|e| StoreError::Serialize(e.to_string()))?;
    write_atomic(path, &path.with_extension("json.tmp"), &content)
}

/// Write `content` to `temp_path`, fsync it, then rename it over `path`.
pub(super) fn write_atomic(path: &Path, temp_path: &Path, content: &[u8]) -> Result<(), StoreError> {
    {
        let mut file = File::create(temp_path)
            .map_err(|e| StoreError::io("creating temp record", temp_path, e))?;
        file.write_all(content)
            .map_err(|e| StoreError::io("writing temp record", temp_path, e))?;
        file.sync_all()
            .map_err(|e| StoreError::io("syncing temp record", temp_path, e))?;
    }

    fs::rename(temp_path, path).map_err(|e| StoreError::io("renaming record", path, e))?;
    sync_parent_dir(path)
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        File::open(parent)
            .and_then(|d| d.sync_all())
            .map_err(|e| StoreError::io("syncing checkpoint dir", parent, e))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

struct FileLockGuard {
    file: File,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn lock(&self, plan_id: &str) -> Result<StoreLease, StoreError> {
        check_plan_id(plan_id)?;
        let path = self.lock_path(plan_id);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StoreError::io("opening lock file", &path, e))?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
                || e.kind() == ErrorKind::WouldBlock
            {
                let holder = fs::read_to_string(&path)
                    .ok()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| "unknown holder".to_string());
                return Err(StoreError::Locked {
                    plan_id: plan_id.to_string(),
                    holder,
                });
            }
            return Err(StoreError::io("locking plan", &path, e));
        }

        // Record the owner for diagnostics; the lock itself is what counts.
        file.set_len(0)
            .and_then(|_| write!(file, "pid {}", std::process::id()))
            .and_then(|_| file.flush())
            .map_err(|e| StoreError::io("writing lock file", &path, e))?;

        debug!(plan_id, "Acquired plan lock");
        Ok(StoreLease {
            plan_id: plan_id.to_string(),
            _guard: Box::new(FileLockGuard { file }),
        })
    }

    fn save(&self, plan_id: &str, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        check_plan_id(plan_id)?;
        let path = self.checkpoint_path(plan_id);

        // Keep the previous revision around for manual forensics
        if path.exists() {
            let backup = self.backup_path(plan_id);
            fs::copy(&path, &backup)
                .map_err(|e| StoreError::io("backing up checkpoint", &backup, e))?;
        }

        write_json_atomic(&path, checkpoint)?;
        debug!(plan_id, revision = checkpoint.revision, "Checkpoint saved");
        Ok(())
    }

    fn load(&self, plan_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        check_plan_id(plan_id)?;
        self.read_json(&self.checkpoint_path(plan_id))
    }

    fn clear(&self, plan_id: &str) -> Result<(), StoreError> {
        check_plan_id(plan_id)?;
        Self::remove_if_exists(&self.checkpoint_path(plan_id))?;
        Self::remove_if_exists(&self.backup_path(plan_id))?;
        sync_parent_dir(&self.checkpoint_path(plan_id))
    }

    fn save_receipt(&self, receipt: &CompletionReceipt) -> Result<(), StoreError> {
        check_plan_id(&receipt.plan_id)?;
        write_json_atomic(&self.receipt_path(&receipt.plan_id), receipt)
    }

    fn load_receipt(&self, plan_id: &str) -> Result<Option<CompletionReceipt>, StoreError> {
        check_plan_id(plan_id)?;
        self.read_json(&self.receipt_path(plan_id))
    }

    fn clear_receipt(&self, plan_id: &str) -> Result<(), StoreError> {
        check_plan_id(plan_id)?;
        Self::remove_if_exists(&self.receipt_path(plan_id))
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        let pattern = self.dir.join("*.checkpoint.json");
        let pattern_str = pattern.to_string_lossy();

        let paths = glob::glob(&pattern_str).map_err(|e| StoreError::Corrupt {
            path: pattern.clone(),
            reason: format!("invalid glob pattern: {e}"),
        })?;

        let mut ids: Vec<String> = paths
            .filter_map(|r| r.ok())
            .filter_map(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| n.strip_suffix(".checkpoint.json"))
                    .map(str::to_string)
            })
            .collect();
        ids.sort();
        Ok(ids)
    }
}

// =============================================================================
// Memory store
// =============================================================================

#[derive(Default)]
struct MemoryInner {
    checkpoints: HashMap<String, String>,
    receipts: HashMap<String, String>,
    locks: HashSet<String>,
}

/// In-process store for tests and embedding.
///
/// Records are kept serialized so they go through the same JSON round trip
/// as the file store.
#[derive(Clone, Default)]
pub struct MemoryCheckpointStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Raw JSON of a stored checkpoint.
    pub fn raw(&self, plan_id: &str) -> Option<String> {
        self.inner().checkpoints.get(plan_id).cloned()
    }
}

struct MemoryLockGuard {
    inner: Arc<Mutex<MemoryInner>>,
    plan_id: String,
}

impl Drop for MemoryLockGuard {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.locks.remove(&self.plan_id);
    }
}

fn decode<T: DeserializeOwned>(plan_id: &str, raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        path: PathBuf::from(format!("memory://{plan_id}")),
        reason: e.to_string(),
    })
}

fn encode<T: Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialize(e.to_string()))
}

impl CheckpointStore for MemoryCheckpointStore {
    fn lock(&self, plan_id: &str) -> Result<StoreLease, StoreError> {
        check_plan_id(plan_id)?;
        if !self.inner().locks.insert(plan_id.to_string()) {
            return Err(StoreError::Locked {
                plan_id: plan_id.to_string(),
                holder: "this process".to_string(),
            });
        }
        Ok(StoreLease {
            plan_id: plan_id.to_string(),
            _guard: Box::new(MemoryLockGuard {
                inner: Arc::clone(&self.inner),
                plan_id: plan_id.to_string(),
            }),
        })
    }

    fn save(&self, plan_id: &str, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        check_plan_id(plan_id)?;
        let raw = encode(checkpoint)?;
        self.inner().checkpoints.insert(plan_id.to_string(), raw);
        Ok(())
    }

    fn load(&self, plan_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        check_plan_id(plan_id)?;
        let raw = self.inner().checkpoints.get(plan_id).cloned();
        raw.map(|r| decode(plan_id, &r)).transpose()
    }

    fn clear(&self, plan_id: &str) -> Result<(), StoreError> {
        self.inner().checkpoints.remove(plan_id);
        Ok(())
    }

    fn save_receipt(&self, receipt: &CompletionReceipt) -> Result<(), StoreError> {
        check_plan_id(&receipt.plan_id)?;
        let raw = encode(receipt)?;
        self.inner().receipts.insert(receipt.plan_id.clone(), raw);
        Ok(())
    }

    fn load_receipt(&self, plan_id: &str) -> Result<Option<CompletionReceipt>, StoreError> {
        let raw = self.inner().receipts.get(plan_id).cloned();
        raw.map(|r| decode(plan_id, &r)).transpose()
    }

    fn clear_receipt(&self, plan_id: &str) -> Result<(), StoreError> {
        self.inner().receipts.remove(plan_id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self.inner().checkpoints.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
