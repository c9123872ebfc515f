//! # Stage: Sentinel File Lock
//!
//! ## Responsibility
//! Cross-process exclusive lock built on a sentinel file created with
//! create-new semantics. Works the same on every platform and survives
//! processes that never cooperate beyond "create, then delete".
//!
//! ## Guarantees
//! - Bounded: acquisition polls until `timeout`, then returns
//!   [`EvolveError::LockTimeout`]
//! - Self-healing: a sentinel older than `stale_after` is treated as abandoned
//!   by a crashed holder and reclaimed
//! - Exclusive under reclaim: removal of a stale sentinel happens under a
//!   second create-new guard and only if the sentinel still carries the
//!   owner token and mtime that were judged stale
//! - Scoped: the sentinel is removed on drop, and only while it still
//!   carries this holder's token
//!
//! ## NOT Responsible For
//! - Protecting readers (readers rely on atomic rename, not on the lock)
//! - Re-entrancy: acquiring the same lock twice from one thread times out
//! - Holders that keep a lock longer than `stale_after`; they are
//!   indistinguishable from crashed ones

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, warn};

use crate::error::{EvolveError, Result};

// ---------------------------------------------------------------------------
// LockOptions
// ---------------------------------------------------------------------------

/// Timing knobs for lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LockOptions {
    /// How long a caller waits before giving up.
    pub timeout: Duration,
    /// Age after which an existing sentinel is considered abandoned.
    pub stale_after: Duration,
    /// Sleep between acquisition attempts.
    pub poll: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            stale_after: Duration::from_secs(120),
            poll: Duration::from_millis(50),
        }
    }
}

impl LockOptions {
    /// Same options with a different timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

// ---------------------------------------------------------------------------
// FileLock
// ---------------------------------------------------------------------------

/// An acquired sentinel lock. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    sentinel: PathBuf,
    token: String,
    _file: File,
}

impl FileLock {
    /// Acquire the sentinel at `sentinel`, waiting up to `opts.timeout`.
    pub fn acquire(sentinel: &Path, opts: &LockOptions) -> Result<Self> {
        if let Some(dir) = sentinel.parent() {
            fs::create_dir_all(dir)?;
        }
        let token = format!("{} {}", std::process::id(), uuid::Uuid::new_v4().simple());
        let start = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(sentinel) {
                Ok(mut file) => {
                    if let Err(e) = writeln!(file, "{token}").and_then(|()| file.sync_data()) {
                        warn!(target: "store", sentinel = %sentinel.display(), error = %e, "failed to stamp lock");
                        remove_logged(sentinel, "unstamped lock");
                        return Err(e.into());
                    }
                    debug!(target: "store", sentinel = %sentinel.display(), "lock acquired");
                    return Ok(Self { sentinel: sentinel.to_path_buf(), token, _file: file });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    match inspect(sentinel, opts.stale_after) {
                        Sentinel::Gone => continue,
                        Sentinel::Stale(seen) => {
                            reclaim(sentinel, &seen, opts.stale_after);
                            continue;
                        }
                        Sentinel::Fresh => {}
                    }
                    let waited = start.elapsed();
                    if waited >= opts.timeout {
                        return Err(EvolveError::LockTimeout {
                            path: sentinel.to_path_buf(),
                            waited,
                        });
                    }
                    std::thread::sleep(opts.poll.min(opts.timeout - waited));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Path of the sentinel file backing this lock.
    pub fn sentinel(&self) -> &Path {
        &self.sentinel
    }

    /// Owner token written into the sentinel (`<pid> <uuid>`).
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        match fs::read_to_string(&self.sentinel) {
            Ok(owner) if owner.trim() == self.token => remove_logged(&self.sentinel, "release"),
            Ok(owner) => warn!(
                target: "store",
                sentinel = %self.sentinel.display(),
                owner = owner.trim(),
                "lock was reclaimed by another holder; leaving it in place"
            ),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!(target: "store", sentinel = %self.sentinel.display(), error = %e, "failed to release lock")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Staleness and reclaim
// ---------------------------------------------------------------------------

/// What a sentinel looked like when it was judged stale.
#[derive(Debug, Clone, PartialEq)]
struct Seen {
    owner: String,
    modified: SystemTime,
}

#[derive(Debug)]
enum Sentinel {
    /// Vanished between the failed create and the inspection.
    Gone,
    Fresh,
    Stale(Seen),
}

fn inspect(path: &Path, stale_after: Duration) -> Sentinel {
    let modified = match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(t) => t,
        Err(e) if e.kind() == ErrorKind::NotFound => return Sentinel::Gone,
        Err(_) => return Sentinel::Fresh,
    };
    let stale = SystemTime::now()
        .duration_since(modified)
        .map(|age| age > stale_after)
        .unwrap_or(false);
    if !stale {
        return Sentinel::Fresh;
    }
    match fs::read_to_string(path) {
        Ok(owner) => Sentinel::Stale(Seen { owner: owner.trim().to_string(), modified }),
        Err(e) if e.kind() == ErrorKind::NotFound => Sentinel::Gone,
        Err(_) => Sentinel::Fresh,
    }
}

fn guard_path(sentinel: &Path) -> PathBuf {
    let mut name = sentinel.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".reclaim");
    sentinel.with_file_name(name)
}

/// Remove `sentinel` if it is still exactly the stale file described by
/// `seen`. Only one waiter at a time may get past the reclaim guard, and it
/// re-inspects under the guard, so a sentinel freshly created by another
/// waiter is never removed.
fn reclaim(sentinel: &Path, seen: &Seen, stale_after: Duration) {
    let guard = guard_path(sentinel);
    let _file = match OpenOptions::new().write(true).create_new(true).open(&guard) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            // A reclaimer that died between create and remove.
            if let Sentinel::Stale(_) = inspect(&guard, stale_after) {
                remove_logged(&guard, "abandoned reclaim guard");
            }
            return;
        }
        Err(e) => {
            warn!(target: "store", guard = %guard.display(), error = %e, "cannot create reclaim guard");
            return;
        }
    };
    match inspect(sentinel, stale_after) {
        Sentinel::Stale(now) if now == *seen => {
            warn!(
                target: "store",
                sentinel = %sentinel.display(),
                owner = %seen.owner,
                "reclaiming abandoned lock"
            );
            remove_logged(sentinel, "reclaim");
        }
        _ => debug!(target: "store", sentinel = %sentinel.display(), "sentinel changed before reclaim"),
    }
    remove_logged(&guard, "reclaim guard");
}

fn remove_logged(path: &Path, what: &str) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            warn!(target: "store", file = %path.display(), error = %e, what, "failed to remove lock file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fast_opts() -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(120),
            stale_after: Duration::from_secs(120),
            poll: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_acquire_creates_and_drop_removes_sentinel() {
        let dir = TempDir::new().unwrap();
        let sentinel = dir.path().join("locks").join("a.json.lock");
        {
            let lock = FileLock::acquire(&sentinel, &fast_opts()).unwrap();
            assert!(lock.sentinel().exists());
        }
        assert!(!sentinel.exists());
    }

    #[test]
    fn test_second_acquire_times_out_while_held() {
        let dir = TempDir::new().unwrap();
        let sentinel = dir.path().join("b.lock");
        let _held = FileLock::acquire(&sentinel, &fast_opts()).unwrap();
        let err = FileLock::acquire(&sentinel, &fast_opts()).unwrap_err();
        assert!(err.is_retryable(), "expected LockTimeout, got {err}");
    }

    #[test]
    fn test_acquire_succeeds_after_release() {
        let dir = TempDir::new().unwrap();
        let sentinel = dir.path().join("c.lock");
        drop(FileLock::acquire(&sentinel, &fast_opts()).unwrap());
        assert!(FileLock::acquire(&sentinel, &fast_opts()).is_ok());
    }

    #[test]
    fn test_stale_sentinel_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let sentinel = dir.path().join("d.lock");
        std::fs::write(&sentinel, "999999\n").unwrap();
        let old = SystemTime::now() - Duration::from_secs(600);
        File::options().write(true).open(&sentinel).unwrap().set_modified(old).unwrap();

        let lock = FileLock::acquire(&sentinel, &fast_opts());
        assert!(lock.is_ok(), "stale lock should be reclaimed");
    }

    #[test]
    fn test_fresh_foreign_sentinel_is_respected() {
        let dir = TempDir::new().unwrap();
        let sentinel = dir.path().join("e.lock");
        std::fs::write(&sentinel, "999999\n").unwrap();
        assert!(FileLock::acquire(&sentinel, &fast_opts()).is_err());
        // Foreign sentinel untouched.
        assert!(sentinel.exists());
    }

    #[test]
    fn test_waiter_acquires_once_holder_releases() {
        let dir = TempDir::new().unwrap();
        let sentinel = dir.path().join("f.lock");
        let held = FileLock::acquire(&sentinel, &fast_opts()).unwrap();
        let path = sentinel.clone();
        let waiter = std::thread::spawn(move || {
            let opts = LockOptions { timeout: Duration::from_secs(2), ..fast_opts() };
            FileLock::acquire(&path, &opts).is_ok()
        });
        std::thread::sleep(Duration::from_millis(40));
        drop(held);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_sentinel_carries_holder_token() {
        let dir = TempDir::new().unwrap();
        let sentinel = dir.path().join("g.lock");
        let lock = FileLock::acquire(&sentinel, &fast_opts()).unwrap();
        let raw = std::fs::read_to_string(&sentinel).unwrap();
        assert_eq!(raw.trim(), lock.token());
        assert!(lock.token().starts_with(&std::process::id().to_string()));
    }

    #[test]
    fn test_drop_leaves_sentinel_owned_by_someone_else() {
        let dir = TempDir::new().unwrap();
        let sentinel = dir.path().join("h.lock");
        let lock = FileLock::acquire(&sentinel, &fast_opts()).unwrap();
        // Another process reclaimed and re-created the sentinel meanwhile.
        std::fs::write(&sentinel, "31337 feedface\n").unwrap();
        drop(lock);
        assert_eq!(std::fs::read_to_string(&sentinel).unwrap(), "31337 feedface\n");
    }

    #[test]
    fn test_reclaim_skips_sentinel_that_changed_since_inspection() {
        let dir = TempDir::new().unwrap();
        let sentinel = dir.path().join("i.lock");
        std::fs::write(&sentinel, "999999\n").unwrap();
        let old = SystemTime::now() - Duration::from_secs(600);
        File::options().write(true).open(&sentinel).unwrap().set_modified(old).unwrap();
        let seen = match inspect(&sentinel, Duration::from_secs(120)) {
            Sentinel::Stale(seen) => seen,
            other => panic!("expected stale sentinel, got {other:?}"),
        };

        // A faster waiter reclaimed it and now holds a fresh lock.
        std::fs::remove_file(&sentinel).unwrap();
        let fresh = FileLock::acquire(&sentinel, &fast_opts()).unwrap();

        reclaim(&sentinel, &seen, Duration::from_secs(120));
        assert!(sentinel.exists(), "fresh holder's sentinel must survive");
        assert!(!guard_path(&sentinel).exists());
        drop(fresh);
        assert!(!sentinel.exists());
    }

    #[test]
    fn test_abandoned_reclaim_guard_is_cleared() {
        let dir = TempDir::new().unwrap();
        let sentinel = dir.path().join("j.lock");
        let old = SystemTime::now() - Duration::from_secs(600);
        for path in [sentinel.clone(), guard_path(&sentinel)] {
            std::fs::write(&path, "999999\n").unwrap();
            File::options().write(true).open(&path).unwrap().set_modified(old).unwrap();
        }
        let opts = LockOptions { timeout: Duration::from_millis(500), ..fast_opts() };
        assert!(FileLock::acquire(&sentinel, &opts).is_ok());
        assert!(!guard_path(&sentinel).exists());
    }

    #[test]
    fn test_lock_options_with_timeout() {
        let o = LockOptions::default().with_timeout(Duration::from_millis(5));
        assert_eq!(o.timeout, Duration::from_millis(5));
        assert_eq!(o.stale_after, Duration::from_secs(120));
    }
}
