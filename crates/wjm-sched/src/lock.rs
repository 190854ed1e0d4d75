//! Named exclusive locks over the shared state tree.
//!
//! Three locks serialize the cooperating short-lived processes:
//! `Scheduler` (admission), `IdGen` (allocation), and `QueueDrain`
//! (one drainer at a time). The primary implementation is an advisory
//! flock on a lock file, which the kernel releases even on crash; where
//! flock is unavailable the universal mkdir-sentinel fallback is used.
//! Stale sentinel directories are never auto-cleaned; operators remove
//! them out of band.
//!
//! Deadlock discipline: a process may only acquire locks in decreasing
//! order Scheduler > IdGen > QueueDrain, and never blocks on one while
//! holding a lower one.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::time::Duration;

use fs2::FileExt;
use thiserror::Error;
use tokio::time::{sleep, Instant};

use wjm_core::layout::StateDirs;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Admission decision plus dispatch critical section.
    Scheduler,
    /// Job-id allocation.
    IdGen,
    /// Queue drain; non-blocking by contract.
    QueueDrain,
}

impl LockKind {
    pub fn name(&self) -> &'static str {
        match self {
            LockKind::Scheduler => "scheduler",
            LockKind::IdGen => "idgen",
            LockKind::QueueDrain => "queue_drain",
        }
    }

    /// How long acquisition may block. `None` = single non-blocking try.
    fn timeout(&self) -> Option<Duration> {
        match self {
            LockKind::Scheduler | LockKind::IdGen => Some(Duration::from_secs(30)),
            LockKind::QueueDrain => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("timed out waiting for the {0} lock")]
    Timeout(&'static str),
    #[error("the {0} lock is held by another process")]
    Busy(&'static str),
    #[error("lock io error: {0}")]
    Io(#[from] io::Error),
}

enum Backend {
    /// Advisory flock; released by the kernel when the file closes.
    Flock(File),
    /// mkdir sentinel; removed on drop, survives crashes as stale.
    Sentinel(camino::Utf8PathBuf),
}

/// Held lock; released on drop. Release is idempotent: dropping twice is
/// impossible and a vanished sentinel is ignored.
pub struct LockGuard {
    backend: Backend,
    kind: LockKind,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match &self.backend {
            Backend::Flock(file) => {
                let _ = fs2::FileExt::unlock(file);
            }
            Backend::Sentinel(path) => {
                let _ = fs::remove_dir(path);
            }
        }
        tracing::trace!(lock = self.kind.name(), "released");
    }
}

/// Acquire a named lock, blocking up to its bound.
///
/// `QueueDrain` never blocks: if another drainer holds it the caller gets
/// `Busy` and is expected to exit silently.
pub async fn acquire(dirs: &StateDirs, kind: LockKind) -> Result<LockGuard, LockError> {
    fs::create_dir_all(&dirs.state_dir)?;
    let deadline = kind.timeout().map(|t| Instant::now() + t);

    loop {
        match try_acquire(dirs, kind)? {
            Some(guard) => {
                tracing::trace!(lock = kind.name(), "acquired");
                return Ok(guard);
            }
            None => match deadline {
                None => return Err(LockError::Busy(kind.name())),
                Some(deadline) if Instant::now() >= deadline => {
                    return Err(LockError::Timeout(kind.name()));
                }
                Some(_) => sleep(POLL_INTERVAL).await,
            },
        }
    }
}

/// One acquisition attempt: flock first, mkdir sentinel when the
/// filesystem cannot flock.
fn try_acquire(dirs: &StateDirs, kind: LockKind) -> Result<Option<LockGuard>, LockError> {
    let path = dirs.lock_file(kind.name());
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path.as_std_path())?;
    match file.try_lock_exclusive() {
        Ok(()) => {
            return Ok(Some(LockGuard {
                backend: Backend::Flock(file),
                kind,
            }))
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
        Err(e) if is_unsupported(&e) => {}
        Err(e) => return Err(e.into()),
    }

    // flock unsupported on this substrate: directory-creation fallback.
    let sentinel = dirs.lock_sentinel(kind.name());
    match fs::create_dir(sentinel.as_std_path()) {
        Ok(()) => Ok(Some(LockGuard {
            backend: Backend::Sentinel(sentinel),
            kind,
        })),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn is_unsupported(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(code) if code == nix::libc::ENOSYS || code == nix::libc::EOPNOTSUPP
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8Path;
    use tempfile::TempDir;
    use wjm_core::Config;

    fn dirs(temp: &TempDir) -> StateDirs {
        let root = Utf8Path::from_path(temp.path()).unwrap();
        StateDirs::from_config(&Config::with_root(root.to_path_buf()))
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let temp = TempDir::new().unwrap();
        let dirs = dirs(&temp);
        let guard = acquire(&dirs, LockKind::Scheduler).await.unwrap();
        drop(guard);
        // Reacquirable after release.
        acquire(&dirs, LockKind::Scheduler).await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_drain_is_non_blocking() {
        let temp = TempDir::new().unwrap();
        let dirs = dirs(&temp);
        let _held = acquire(&dirs, LockKind::QueueDrain).await.unwrap();
        let second = acquire(&dirs, LockKind::QueueDrain).await;
        assert!(matches!(second, Err(LockError::Busy("queue_drain"))));
    }

    #[tokio::test]
    async fn test_locks_are_independent() {
        let temp = TempDir::new().unwrap();
        let dirs = dirs(&temp);
        let _scheduler = acquire(&dirs, LockKind::Scheduler).await.unwrap();
        // IdGen is a different lock and must not contend.
        acquire(&dirs, LockKind::IdGen).await.unwrap();
    }
}
