//! Cross-process single-flight locks for global data refreshes.
//!
//! # Lock File
//!
//! Location: `<root>/locks/{id}.lock`
//!
//! ```json
//! { "pid": 4242, "acquired_at": 1735689600000, "proc_started": 1735689500, "token": "01J..." }
//! ```
//!
//! # Acquisition
//!
//! Creation uses `O_CREAT|O_EXCL`, so exactly one process wins an empty slot.
//! An existing lock may be taken over when it is stale:
//!
//! 1. The holder pid is not alive
//! 2. The holder pid is alive but its start time differs (pid reused)
//! 3. The lock is older than the category's lock timeout
//!
//! Takeover renames the stale file aside and checks the renamed bytes are the
//! ones judged stale. If a competitor re-created the lock in the meantime, it
//! is put back and this process backs off.
//!
//! Losing is never an error: the caller uses whatever the shared cache holds.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};

use crate::error::validate_identifier;
use crate::freshness::FreshnessCategory;
use crate::storage::StorageConfig;

// Per-PID sysinfo refresh; a full process scan would dominate a status line render.
thread_local! {
    static SYSTEM_CACHE: RefCell<Option<(sysinfo::System, Instant)>> = const { RefCell::new(None) };
}

/// Tolerance when comparing recorded and observed process start times.
const START_TIME_TOLERANCE_SECS: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    /// Epoch ms.
    pub acquired_at: i64,
    /// Holder start time in epoch seconds, when it could be determined.
    #[serde(default)]
    pub proc_started: Option<u64>,
    pub token: String,
}

pub fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    #[cfg(unix)]
    {
        if unsafe { libc::kill(pid as i32, 0) } == 0 {
            return true;
        }
        // EPERM: exists, owned by someone else.
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Start time of `pid` in epoch seconds, or `None` if it cannot be queried.
pub fn get_process_start_time(pid: u32) -> Option<u64> {
    use sysinfo::{Pid, ProcessRefreshKind, System};

    SYSTEM_CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        let (sys, _) = cache.get_or_insert_with(|| (System::new(), Instant::now()));

        let sysinfo_pid = Pid::from(pid as usize);
        sys.refresh_process_specifics(sysinfo_pid, ProcessRefreshKind::new());
        sys.process(sysinfo_pid).map(|process| process.start_time())
    })
}

fn stale_reason(record: &LockRecord, timeout: Duration, now_ms: i64) -> Option<&'static str> {
    if !is_pid_alive(record.pid) {
        return Some("holder exited");
    }
    if let (Some(expected), Some(actual)) = (record.proc_started, get_process_start_time(record.pid)) {
        if actual.abs_diff(expected) > START_TIME_TOLERANCE_SECS {
            return Some("holder pid reused");
        }
    }
    let age_ms = now_ms.saturating_sub(record.acquired_at);
    if age_ms > timeout.as_millis() as i64 {
        return Some("lock expired");
    }
    None
}

fn modified_longer_ago_than(path: &Path, timeout: Duration) -> bool {
    fs_err::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
        .is_some_and(|age| age > timeout)
}

pub struct SingleFlightCoordinator {
    locks_dir: PathBuf,
    timeout_override: Option<Duration>,
    timeouts: HashMap<String, Duration>,
    /// id → token for locks this coordinator currently holds.
    owned: Mutex<HashMap<String, String>>,
}

impl SingleFlightCoordinator {
    pub fn new(storage: &StorageConfig) -> Self {
        Self {
            locks_dir: storage.locks_dir(),
            timeout_override: None,
            timeouts: HashMap::new(),
            owned: Mutex::new(HashMap::new()),
        }
    }

    /// Uses `timeout` for every id, ignoring per-category policy.
    pub fn with_timeout_override(mut self, timeout: Option<Duration>) -> Self {
        self.timeout_override = timeout;
        self
    }

    /// Sets the stale-lock timeout for one id.
    pub fn with_lock_timeout(mut self, id: impl Into<String>, timeout: Duration) -> Self {
        self.timeouts.insert(id.into(), timeout);
        self
    }

    pub fn lock_timeout(&self, id: &str) -> Duration {
        self.timeout_override
            .or_else(|| self.timeouts.get(id).copied())
            .unwrap_or_else(|| FreshnessCategory::parse(id).policy().lock_timeout)
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.locks_dir.join(format!("{}.lock", id))
    }

    fn owned(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.owned.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn holds(&self, id: &str) -> bool {
        self.owned().contains_key(id)
    }

    /// Attempts to become the single refresher for `id`. Never blocks.
    pub fn try_acquire(&self, id: &str) -> bool {
        if let Err(e) = validate_identifier(id) {
            tracing::warn!(lock = %id, error = %e, "Refusing lock with invalid id");
            return false;
        }
        if self.holds(id) {
            return false;
        }
        if let Err(e) = fs_err::create_dir_all(&self.locks_dir) {
            tracing::warn!(error = %e, "Cannot create locks dir");
            return false;
        }

        let path = self.lock_path(id);
        match self.create_lock(id, &path) {
            CreateOutcome::Created => true,
            CreateOutcome::Failed => false,
            CreateOutcome::Exists => {
                if self.take_over_if_stale(id, &path) {
                    matches!(self.create_lock(id, &path), CreateOutcome::Created)
                } else {
                    tracing::debug!(lock = %id, "Lock held by another process");
                    false
                }
            }
        }
    }

    /// Acquires what it can from `ids`; returns the acquired subset in input order.
    pub fn try_acquire_many(&self, ids: &[&str]) -> Vec<String> {
        ids.iter()
            .filter(|id| self.try_acquire(id))
            .map(|id| id.to_string())
            .collect()
    }

    /// Releases a lock this coordinator holds.
    ///
    /// The file is removed either way, so a failed refresh lets the next
    /// process retry at once. A lock taken over by someone else is left alone.
    pub fn release(&self, id: &str, success: bool) {
        let Some(token) = self.owned().remove(id) else {
            tracing::debug!(lock = %id, "Release of a lock not held here");
            return;
        };

        let path = self.lock_path(id);
        let current = fs_err::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<LockRecord>(&bytes).ok());
        match current {
            Some(record) if record.token == token => {
                if let Err(e) = fs_err::remove_file(&path) {
                    tracing::warn!(lock = %id, error = %e, "Failed to remove lock file");
                }
            }
            Some(_) => tracing::warn!(lock = %id, "Lock was taken over before release"),
            None => tracing::debug!(lock = %id, "Lock file already gone at release"),
        }

        if success {
            tracing::debug!(lock = %id, "Released lock after refresh");
        } else {
            tracing::warn!(lock = %id, "Released lock after failed refresh");
        }
    }

    fn create_lock(&self, id: &str, path: &Path) -> CreateOutcome {
        let pid = std::process::id();
        let record = LockRecord {
            pid,
            acquired_at: crate::now_ms(),
            proc_started: get_process_start_time(pid),
            token: ulid::Ulid::new().to_string(),
        };
        let bytes = match serde_json::to_vec(&record) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(lock = %id, error = %e, "Cannot serialize lock record");
                return CreateOutcome::Failed;
            }
        };

        let file = fs_err::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path);
        let mut file = match file {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return CreateOutcome::Exists,
            Err(e) => {
                tracing::warn!(lock = %id, error = %e, "Cannot create lock file");
                return CreateOutcome::Failed;
            }
        };

        if let Err(e) = file.write_all(&bytes) {
            tracing::warn!(lock = %id, error = %e, "Cannot write lock file");
            drop(file);
            let _ = fs_err::remove_file(path);
            return CreateOutcome::Failed;
        }

        self.owned().insert(id.to_string(), record.token);
        tracing::debug!(lock = %id, "Acquired lock");
        CreateOutcome::Created
    }

    /// Clears the way for a fresh `create_new` when the existing lock is stale.
    fn take_over_if_stale(&self, id: &str, path: &Path) -> bool {
        let observed = match fs_err::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return true,
            Err(_) => return false,
        };

        let timeout = self.lock_timeout(id);
        let reason = match serde_json::from_slice::<LockRecord>(&observed) {
            Ok(record) => stale_reason(&record, timeout, crate::now_ms()),
            // Unreadable: a holder may still be mid-write, so only mtime can age it out.
            Err(_) => modified_longer_ago_than(path, timeout).then_some("unreadable lock expired"),
        };
        let Some(reason) = reason else {
            return false;
        };

        let aside = path.with_extension(format!("stale-{}", ulid::Ulid::new()));
        if fs_err::rename(path, &aside).is_err() {
            // Someone else moved it first.
            return false;
        }
        let moved = fs_err::read(&aside).unwrap_or_default();
        if moved != observed {
            restore_displaced(id, &aside, path);
            return false;
        }

        let _ = fs_err::remove_file(&aside);
        tracing::info!(lock = %id, reason, "Took over stale lock");
        true
    }
}

/// Hands a lock we moved aside by mistake back to `path`, unless a third
/// contender already claimed the slot. The aside copy is removed either way.
fn restore_displaced(id: &str, aside: &Path, path: &Path) -> bool {
    let restored = match fs_err::hard_link(aside, path) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(lock = %id, error = %e, "Displaced lock could not be restored");
            false
        }
    };
    let _ = fs_err::remove_file(aside);
    restored
}

impl Drop for SingleFlightCoordinator {
    fn drop(&mut self) {
        let held: Vec<String> = self.owned().keys().cloned().collect();
        for id in held {
            self.release(&id, false);
        }
    }
}

enum CreateOutcome {
    Created,
    Exists,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const DEAD_PID: u32 = 99_999_999;

    fn coordinator(root: &Path) -> SingleFlightCoordinator {
        SingleFlightCoordinator::new(&StorageConfig::with_root(root.to_path_buf()))
    }

    fn write_lock(root: &Path, id: &str, record: &LockRecord) {
        let dir = root.join("locks");
        fs_err::create_dir_all(&dir).unwrap();
        fs_err::write(dir.join(format!("{}.lock", id)), serde_json::to_vec(record).unwrap()).unwrap();
    }

    #[test]
    fn test_displaced_lock_is_restored_into_free_slot() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("billing.lock");
        let aside = temp.path().join("billing.stale-x");
        fs_err::write(&aside, b"competitor").unwrap();

        assert!(restore_displaced("billing", &aside, &path));
        assert_eq!(fs_err::read(&path).unwrap(), b"competitor");
        assert!(!aside.exists());
    }

    #[test]
    fn test_displaced_lock_yields_to_third_contender() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("billing.lock");
        let aside = temp.path().join("billing.stale-x");
        fs_err::write(&aside, b"competitor").unwrap();
        fs_err::write(&path, b"third").unwrap();

        assert!(!restore_displaced("billing", &aside, &path));
        assert_eq!(fs_err::read(&path).unwrap(), b"third");
        assert!(!aside.exists());
    }

    #[test]
    fn test_is_pid_alive_current_process() {
        assert!(is_pid_alive(std::process::id()));
        assert!(!is_pid_alive(DEAD_PID));
        assert!(!is_pid_alive(0));
    }

    #[test]
    fn test_second_acquire_fails_until_release() {
        let temp = tempdir().unwrap();
        let a = coordinator(temp.path());
        let b = coordinator(temp.path());

        assert!(a.try_acquire("billing"));
        assert!(!a.try_acquire("billing"));
        assert!(!b.try_acquire("billing"));

        a.release("billing", true);
        assert!(!temp.path().join("locks/billing.lock").exists());
        assert!(b.try_acquire("billing"));
    }

    #[test]
    fn test_failed_release_still_frees_the_lock() {
        let temp = tempdir().unwrap();
        let a = coordinator(temp.path());
        assert!(a.try_acquire("quota"));
        a.release("quota", false);
        assert!(coordinator(temp.path()).try_acquire("quota"));
    }

    #[test]
    fn test_dead_holder_is_taken_over() {
        let temp = tempdir().unwrap();
        write_lock(
            temp.path(),
            "billing",
            &LockRecord {
                pid: DEAD_PID,
                acquired_at: crate::now_ms(),
                proc_started: None,
                token: "old".to_string(),
            },
        );
        let c = coordinator(temp.path());
        assert!(c.try_acquire("billing"));

        let raw = fs_err::read(temp.path().join("locks/billing.lock")).unwrap();
        let record: LockRecord = serde_json::from_slice(&raw).unwrap();
        assert_eq!(record.pid, std::process::id());
        assert_ne!(record.token, "old");
    }

    #[test]
    fn test_expired_lock_of_live_holder_is_taken_over() {
        let temp = tempdir().unwrap();
        write_lock(
            temp.path(),
            "git",
            &LockRecord {
                pid: std::process::id(),
                acquired_at: crate::now_ms() - 60_000,
                proc_started: None,
                token: "old".to_string(),
            },
        );
        let c = coordinator(temp.path()).with_lock_timeout("git", Duration::from_secs(15));
        assert!(c.try_acquire("git"));
    }

    #[test]
    fn test_live_recent_lock_is_respected() {
        let temp = tempdir().unwrap();
        write_lock(
            temp.path(),
            "billing",
            &LockRecord {
                pid: std::process::id(),
                acquired_at: crate::now_ms(),
                proc_started: None,
                token: "theirs".to_string(),
            },
        );
        assert!(!coordinator(temp.path()).try_acquire("billing"));
    }

    #[test]
    fn test_fresh_corrupt_lock_is_not_stale() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("locks");
        fs_err::create_dir_all(&dir).unwrap();
        fs_err::write(dir.join("billing.lock"), "").unwrap();
        assert!(!coordinator(temp.path()).try_acquire("billing"));

        let c = coordinator(temp.path()).with_timeout_override(Some(Duration::ZERO));
        std::thread::sleep(Duration::from_millis(20));
        assert!(c.try_acquire("billing"));
    }

    #[test]
    fn test_release_leaves_taken_over_lock_alone() {
        let temp = tempdir().unwrap();
        let a = coordinator(temp.path());
        assert!(a.try_acquire("quota"));
        let replacement = LockRecord {
            pid: std::process::id(),
            acquired_at: crate::now_ms(),
            proc_started: None,
            token: "someone-else".to_string(),
        };
        write_lock(temp.path(), "quota", &replacement);

        a.release("quota", true);
        assert!(temp.path().join("locks/quota.lock").exists());
    }

    #[test]
    fn test_try_acquire_many_returns_acquired_subset() {
        let temp = tempdir().unwrap();
        let other = coordinator(temp.path());
        assert!(other.try_acquire("quota"));

        let c = coordinator(temp.path());
        assert_eq!(c.try_acquire_many(&["billing", "quota", "git"]), vec!["billing", "git"]);
    }

    #[test]
    fn test_invalid_id_is_never_acquired() {
        let temp = tempdir().unwrap();
        assert!(!coordinator(temp.path()).try_acquire("../billing"));
    }

    #[test]
    fn test_drop_releases_held_locks() {
        let temp = tempdir().unwrap();
        {
            let c = coordinator(temp.path());
            assert!(c.try_acquire("billing"));
        }
        assert!(!temp.path().join("locks/billing.lock").exists());
    }

    #[test]
    fn test_lock_timeout_resolution() {
        let temp = tempdir().unwrap();
        let c = coordinator(temp.path()).with_lock_timeout("custom", Duration::from_secs(7));
        assert_eq!(c.lock_timeout("billing"), Duration::from_secs(60));
        assert_eq!(c.lock_timeout("custom"), Duration::from_secs(7));
        let c = c.with_timeout_override(Some(Duration::from_secs(1)));
        assert_eq!(c.lock_timeout("billing"), Duration::from_secs(1));
    }
}
