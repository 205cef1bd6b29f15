//! Cross-process advisory file locks built on atomic directory creation.
//!
//! `mkdir` either creates the directory or fails because it exists, on
//! every filesystem including network mounts, which makes a sibling marker
//! directory a portable mutex. The marker also serves as a scratch area:
//! writers stage the new content inside it and rename it over the target.
//!
//! Each holder writes a random token into its marker. A stale marker is
//! renamed to a unique tombstone before it is deleted, so two processes
//! breaking the same lock never delete each other's fresh marker, and a
//! holder whose lock was broken leaves the new owner's marker alone.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

/// Reserved prefix of lock marker directories. Entries carrying it are
/// never listed by the store.
pub const LOCK_PREFIX: &str = ".lock_";

const SCRATCH_NAME: &str = "pending";
const OWNER_NAME: &str = "owner";
const MAX_BACKOFF: Duration = Duration::from_millis(50);

/// A held lock on one file. Released when dropped.
#[derive(Debug)]
pub struct FileLock {
    marker: PathBuf,
    token: String,
}

impl FileLock {
    /// Marker directory guarding `target`.
    pub fn marker_for(target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let parent = target.parent().unwrap_or_else(|| Path::new("."));
        parent.join(format!("{LOCK_PREFIX}{name}"))
    }

    /// Block until the lock on `target` is held.
    ///
    /// A marker older than `stale_after` is assumed to belong to a crashed
    /// writer and is removed. Gives up with `LockTimeout` after waiting
    /// twice that long.
    pub fn acquire(target: &Path, stale_after: Duration) -> StoreResult<Self> {
        let marker = Self::marker_for(target);
        let started = Instant::now();
        let mut backoff = Duration::from_millis(1);

        loop {
            match fs::create_dir(&marker) {
                Ok(()) => {
                    let token = Uuid::new_v4().simple().to_string();
                    if let Err(e) = fs::write(marker.join(OWNER_NAME), &token) {
                        let _ = fs::remove_dir_all(&marker);
                        return Err(StoreError::Io(format!("{}: {e}", marker.display())));
                    }
                    debug!(marker = ?marker, "lock acquired");
                    return Ok(Self { marker, token });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if marker_age(&marker).is_some_and(|age| age > stale_after) {
                        break_stale(&marker, stale_after);
                        continue;
                    }
                    if started.elapsed() > stale_after * 2 {
                        return Err(StoreError::LockTimeout(target.display().to_string()));
                    }
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(StoreError::NotFound(target.display().to_string()));
                }
                Err(e) => return Err(StoreError::Io(format!("{}: {e}", marker.display()))),
            }
        }
    }

    /// Staging file inside the marker directory.
    pub fn scratch_path(&self) -> PathBuf {
        self.marker.join(SCRATCH_NAME)
    }

    pub fn marker(&self) -> &Path {
        &self.marker
    }

    /// Whether the marker on disk still carries this holder's token.
    pub fn is_held(&self) -> bool {
        owner_of(&self.marker).as_deref() == Some(self.token.as_str())
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if !self.is_held() {
            warn!(marker = ?self.marker, "lock was broken by another writer, leaving it");
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.marker) {
            warn!(marker = ?self.marker, error = %e, "failed to release lock");
        }
    }
}

/// Move a stale marker aside under a unique name, then delete only that.
///
/// The marker may have been broken and re-taken since its age was read, so
/// the tombstone is checked again and handed back if it is someone's live
/// lock.
fn break_stale(marker: &Path, stale_after: Duration) {
    let owner = owner_of(marker);
    let mut tombstone = marker.as_os_str().to_owned();
    tombstone.push(format!(".{}.stale", Uuid::new_v4().simple()));
    let tombstone = PathBuf::from(tombstone);

    if let Err(e) = fs::rename(marker, &tombstone) {
        debug!(marker = ?marker, error = %e, "stale lock already broken");
        return;
    }
    let still_stale = marker_age(&tombstone).is_some_and(|age| age > stale_after);
    if !still_stale || owner_of(&tombstone) != owner {
        debug!(marker = ?marker, "marker changed hands, restoring it");
        if let Err(e) = fs::rename(&tombstone, marker) {
            warn!(marker = ?marker, error = %e, "cannot restore lock marker");
            let _ = fs::remove_dir_all(&tombstone);
        }
        return;
    }

    warn!(marker = ?marker, "breaking stale lock");
    if let Err(e) = fs::remove_dir_all(&tombstone) {
        warn!(tombstone = ?tombstone, error = %e, "failed to remove broken lock");
    }
}

fn owner_of(marker: &Path) -> Option<String> {
    fs::read_to_string(marker.join(OWNER_NAME)).ok()
}

fn marker_age(marker: &Path) -> Option<Duration> {
    let modified = fs::metadata(marker).and_then(|m| m.modified()).ok()?;
    SystemTime::now().duration_since(modified).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_is_a_hidden_sibling() {
        let marker = FileLock::marker_for(Path::new("/data/jobs/abc.json"));
        assert_eq!(marker, PathBuf::from("/data/jobs/.lock_abc.json"));
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("job.json");

        {
            let lock = FileLock::acquire(&target, Duration::from_secs(5)).unwrap();
            assert!(lock.marker().is_dir());
        }
        assert!(!FileLock::marker_for(&target).exists());

        // Re-acquiring succeeds immediately.
        let _again = FileLock::acquire(&target, Duration::from_secs(5)).unwrap();
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn stale_marker_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("job.json");
        fs::create_dir(FileLock::marker_for(&target)).unwrap();

        std::thread::sleep(Duration::from_millis(30));
        let lock = FileLock::acquire(&target, Duration::from_millis(10)).unwrap();
        assert!(lock.marker().is_dir());
        assert!(lock.is_held());
        // The broken marker's tombstone is gone too.
        assert_eq!(entries(dir.path()), vec![".lock_job.json".to_string()]);
    }

    #[test]
    fn holder_whose_lock_was_broken_leaves_the_new_marker() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("job.json");

        let slow = FileLock::acquire(&target, Duration::from_millis(10)).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        let fresh = FileLock::acquire(&target, Duration::from_millis(10)).unwrap();
        assert!(!slow.is_held());
        assert!(fresh.is_held());

        drop(slow);
        assert!(fresh.marker().is_dir());
        assert!(fresh.is_held());

        drop(fresh);
        assert!(entries(dir.path()).is_empty());
    }

    #[test]
    fn live_marker_judged_stale_too_late_is_restored() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("job.json");
        let live = FileLock::acquire(&target, Duration::from_secs(60)).unwrap();

        // A breaker that read the age of an older marker before this one
        // was created.
        break_stale(live.marker(), Duration::from_secs(60));

        assert!(live.is_held());
        assert_eq!(entries(dir.path()), vec![".lock_job.json".to_string()]);
    }

    #[test]
    fn contending_breakers_stay_exclusive() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("job.json");
        fs::create_dir(FileLock::marker_for(&target)).unwrap();
        let stale_after = Duration::from_millis(300);
        std::thread::sleep(stale_after + Duration::from_millis(50));

        let inside = AtomicUsize::new(0);
        let acquired = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|| {
                    for _ in 0..20 {
                        let lock = FileLock::acquire(&target, stale_after).unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        std::thread::sleep(Duration::from_millis(1));
                        inside.fetch_sub(1, Ordering::SeqCst);
                        acquired.fetch_add(1, Ordering::SeqCst);
                        drop(lock);
                    }
                });
            }
        });

        assert_eq!(acquired.load(Ordering::SeqCst), 40);
        assert!(entries(dir.path()).is_empty());
    }

    #[test]
    fn missing_parent_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("missing").join("job.json");
        let result = FileLock::acquire(&target, Duration::from_secs(1));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }
}
