//! # Module: store
//!
//! Lock-protected atomic persistence for every shared workspace file.
//!
//! Readers never lock: every writer goes through a uniquely named temporary
//! sibling followed by a rename, so a reader sees either the previous or the
//! complete new content. Writers serialize on a per-file sentinel lock kept
//! under `<root>/locks/`.
//!
//! ## Sub-modules
//! - [`lock`]: sentinel lock with timeout and staleness reclaim

pub mod lock;

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Result;
pub use lock::{FileLock, LockOptions};

/// Active skill sources and variant history.
pub const VARIANTS_FILE: &str = "variants.json";
/// Evaluator weights.
pub const FEEDBACK_FILE: &str = "feedback.json";
/// Meta-policy state.
pub const META_POLICY_FILE: &str = "meta_mutator.json";
/// Seal record.
pub const SEAL_FILE: &str = "seal.json";
/// Seal failure/lockout state.
pub const SEAL_STATE_FILE: &str = "seal_state.json";
/// One record per mutation decision.
pub const MUTATION_LEDGER: &str = "mutation_ledger.jsonl";
/// One record per meta-policy update.
pub const META_LEDGER: &str = "meta_ledger.jsonl";

const LOCK_DIR: &str = "locks";

// ---------------------------------------------------------------------------
// Versioned
// ---------------------------------------------------------------------------

/// A JSON document stored in the workspace with a `schema` field.
///
/// Documents written by a newer schema than this build understands are
/// ignored in favour of defaults rather than half-parsed.
pub trait Versioned: Serialize + DeserializeOwned + Default {
    const SCHEMA: u32;
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Handle on one workspace directory.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    lock: LockOptions,
}

impl Store {
    /// Open (and create if needed) the workspace at `root`.
    pub fn open(root: impl Into<PathBuf>, lock: LockOptions) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(LOCK_DIR))?;
        Ok(Self { root, lock })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock_options(&self) -> LockOptions {
        self.lock
    }

    /// Absolute path of a workspace file.
    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn sentinel_for(&self, target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string());
        self.root.join(LOCK_DIR).join(format!("{name}.lock"))
    }

    /// Acquire the lock guarding `target` with the store's default timeout.
    pub fn lock(&self, target: &Path) -> Result<FileLock> {
        FileLock::acquire(&self.sentinel_for(target), &self.lock)
    }

    /// Run `f` while holding the lock guarding `target`.
    pub fn with_lock<R>(
        &self,
        target: &Path,
        timeout: Duration,
        f: impl FnOnce() -> Result<R>,
    ) -> Result<R> {
        let opts = self.lock.with_timeout(timeout);
        let _guard = FileLock::acquire(&self.sentinel_for(target), &opts)?;
        f()
    }

    /// Replace `target` with `bytes` atomically, under its lock.
    pub fn atomic_write(&self, target: &Path, bytes: &[u8]) -> Result<()> {
        let _guard = self.lock(target)?;
        write_replace(target, bytes)
    }

    /// Serialize `value` as pretty JSON and write it atomically.
    pub fn save_json<T: Serialize>(&self, target: &Path, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.atomic_write(target, &bytes)
    }

    /// Append one JSON record as a single line, under the file's lock.
    pub fn append_record<T: Serialize>(&self, target: &Path, record: &T) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let _guard = self.lock(target)?;
        if let Some(dir) = target.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(target)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Read every well-formed record of a ledger; torn or corrupt lines are
    /// skipped.
    pub fn read_records<T: DeserializeOwned>(&self, target: &Path) -> Result<Vec<T>> {
        let raw = match fs::read_to_string(target) {
            Ok(s) => s,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| match serde_json::from_str(l) {
                Ok(r) => Some(r),
                Err(e) => {
                    warn!(target: "store", file = %target.display(), error = %e, "skipping malformed ledger line");
                    None
                }
            })
            .collect())
    }

    /// Load a versioned document, falling back to `T::default()` when the file
    /// is missing, corrupt, or from a newer schema.
    pub fn load_json_or_default<T: Versioned>(&self, target: &Path) -> T {
        load_versioned(target)
    }

    /// Read-modify-write `target` under a single lock acquisition.
    pub fn update_json<T, R>(&self, target: &Path, f: impl FnOnce(&mut T) -> R) -> Result<R>
    where
        T: Versioned,
    {
        let _guard = self.lock(target)?;
        let mut doc: T = load_versioned(target);
        let out = f(&mut doc);
        let bytes = serde_json::to_vec_pretty(&doc)?;
        write_replace(target, &bytes)?;
        Ok(out)
    }
}

fn load_versioned<T: Versioned>(target: &Path) -> T {
    let raw = match fs::read_to_string(target) {
        Ok(s) => s,
        Err(e) => {
            if e.kind() != ErrorKind::NotFound {
                warn!(target: "store", file = %target.display(), error = %e, "unreadable state file, using defaults");
            }
            return T::default();
        }
    };
    let value: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(target: "store", file = %target.display(), error = %e, "corrupt state file, using defaults");
            return T::default();
        }
    };
    let schema = value.get("schema").and_then(|s| s.as_u64()).unwrap_or(0);
    if schema > u64::from(T::SCHEMA) {
        warn!(
            target: "store",
            file = %target.display(),
            found = schema,
            supported = T::SCHEMA,
            "state file written by a newer schema, using defaults"
        );
        return T::default();
    }
    serde_json::from_value(value).unwrap_or_else(|e| {
        warn!(target: "store", file = %target.display(), error = %e, "state file does not match schema, using defaults");
        T::default()
    })
}

/// Write to a uniquely named temporary sibling, fsync, rename over `target`.
/// Callers must hold the target's lock.
fn write_replace(target: &Path, bytes: &[u8]) -> Result<()> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()));

    let written = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(())
    })();
    if let Err(e) = written.and_then(|()| fs::rename(&tmp, target)) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    debug!(target: "store", file = %target.display(), bytes = bytes.len(), "atomic write");
    Ok(())
}
