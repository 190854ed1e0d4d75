//! Atomic, gap-free job-id allocation.
//!
//! The next id is `1 + max(existing numeric index)`, scanning both record
//! directories and queue entries so a queued job whose record dir was
//! removed at admission time can never have its id recycled. The record
//! directory is claimed with exclusive create, which is an atomic
//! test-and-set on its own even without the `IdGen` lock.

use std::fs;
use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;

use wjm_core::layout::StateDirs;
use wjm_core::record::{JobId, MAX_JOB_INDEX};

use crate::lock::{acquire, LockError, LockKind};

/// Defensive collision retries; collisions must not happen while holding
/// `IdGen`.
const CREATE_RETRIES: u32 = 1000;
const CREATE_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum IdGenError {
    #[error("job id space exhausted (job_{MAX_JOB_INDEX} reached): archive retired jobs first")]
    IdExhausted,
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("id allocation io error: {0}")]
    Io(#[from] io::Error),
}

/// Allocate the next job id and create its record directory.
pub async fn allocate_job_id(dirs: &StateDirs) -> Result<JobId, IdGenError> {
    let _guard = acquire(dirs, LockKind::IdGen).await?;

    for attempt in 0..CREATE_RETRIES {
        let max = highest_used_index(dirs)?;
        if max >= MAX_JOB_INDEX {
            return Err(IdGenError::IdExhausted);
        }
        let candidate = JobId::new(max + 1).expect("index bounded by MAX_JOB_INDEX");

        match fs::create_dir(dirs.record_dir(candidate).as_std_path()) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                tracing::warn!(
                    id = %candidate,
                    attempt,
                    "record directory collision while holding idgen lock"
                );
                sleep(CREATE_RETRY_DELAY).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(IdGenError::IdExhausted)
}

/// Highest numeric index across record dirs and queue scripts; 0 when the
/// store is empty. Non-matching names are ignored.
fn highest_used_index(dirs: &StateDirs) -> io::Result<u16> {
    let mut max = 0u16;
    for dir in [&dirs.job_dir, &dirs.queue_dir] {
        let entries = match fs::read_dir(dir.as_std_path()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(index) = parse_index(name) {
                max = max.max(index);
            }
        }
    }
    Ok(max)
}

/// `job_007` or `job_007.run` (and its sidecars) -> 7.
fn parse_index(name: &str) -> Option<u16> {
    let rest = name.strip_prefix("job_")?;
    let digits = rest.split('.').next()?;
    digits.parse().ok()
}
