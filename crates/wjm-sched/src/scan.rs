//! Sanitizing record reads.
//!
//! Every observer (status, list, admission, drain) goes through this one
//! view so pid-file self-healing has a single source of truth. A record
//! claiming RUNNING or PAUSED without a live pid is stale: the dead pid
//! file is cleared and the job is reported as terminated-unknown, while
//! `status` is left untouched on disk.

use std::collections::BTreeSet;
use std::fs;
use std::io;

use nix::sys::signal::kill;
use nix::unistd::Pid;
use thiserror::Error;

use wjm_core::codec::{read_record, write_record, RecordError};
use wjm_core::layout::StateDirs;
use wjm_core::record::{JobId, JobRecord, JobStatus};

use crate::probe::allocated_gpus;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("scan io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Record(#[from] RecordError),
}

/// A sanitized view of one job record.
#[derive(Debug, Clone)]
pub struct JobView {
    pub record: JobRecord,
    /// Live status on disk but no live process behind it.
    pub stale: bool,
}

impl JobView {
    /// Status as observers should report it.
    pub fn effective_status(&self) -> JobStatus {
        if self.stale {
            JobStatus::Failed
        } else {
            self.record.status
        }
    }

    /// Whether this record holds capacity right now.
    pub fn is_live(&self) -> bool {
        self.record.status.is_live() && !self.stale
    }
}

/// Capacity currently committed by live records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunningUsage {
    pub count: u32,
    pub weight: u64,
    pub gpus: BTreeSet<u32>,
}

pub fn pid_alive(pid: u32) -> bool {
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        // EPERM: the process exists but belongs to someone else.
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Load one record, self-healing stale pid state.
///
/// Returns `None` when the directory has no `job.info` yet; allocation
/// creates the directory before admission commits, and observers skip
/// that window.
pub fn load_job(dirs: &StateDirs, id: JobId) -> Result<Option<JobView>, ScanError> {
    let info_path = dirs.job_info(id);
    if !info_path.exists() {
        return Ok(None);
    }
    let mut record = read_record(&info_path)?;

    let mut stale = false;
    if record.status.is_live() {
        let pid_path = dirs.pid_file(id);
        let pid = match fs::read_to_string(pid_path.as_std_path()) {
            Ok(text) => text.trim().parse::<u32>().ok(),
            Err(_) => record.pid,
        };
        let alive = pid.is_some_and(pid_alive);
        if !alive {
            stale = true;
            if pid_path.exists() {
                if let Err(e) = fs::remove_file(pid_path.as_std_path()) {
                    tracing::warn!(job = %id, error = %e, "failed to clear stale pid file");
                }
            }
            if record.pid.is_some() {
                record.pid = None;
                if let Err(e) = write_record(&info_path, &record) {
                    tracing::warn!(job = %id, error = %e, "failed to clear stale pid field");
                }
            }
            tracing::debug!(job = %id, "stale record: no live process");
        } else {
            record.pid = pid;
        }
    }

    Ok(Some(JobView { record, stale }))
}

/// All records in the store, sorted by job id.
pub fn scan_jobs(dirs: &StateDirs) -> Result<Vec<JobView>, ScanError> {
    let mut ids: Vec<JobId> = Vec::new();
    let entries = match fs::read_dir(dirs.job_dir.as_std_path()) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if let Ok(id) = name.parse::<JobId>() {
                if name == id.dir_name() {
                    ids.push(id);
                }
            }
        }
    }
    ids.sort_unstable();

    let mut views = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(view) = load_job(dirs, id)? {
            views.push(view);
        }
    }
    Ok(views)
}

/// Sum live capacity over a scan. PAUSED jobs still hold their weight and
/// devices.
pub fn running_usage(views: &[JobView]) -> RunningUsage {
    let live: Vec<&JobRecord> = views
        .iter()
        .filter(|v| v.is_live())
        .map(|v| &v.record)
        .collect();
    RunningUsage {
        count: live.len() as u32,
        weight: live.iter().map(|r| u64::from(r.weight)).sum(),
        gpus: allocated_gpus(live.iter().copied()),
    }
}

/// Ids of COMPLETED jobs, for dependency gating.
pub fn completed_ids(views: &[JobView]) -> BTreeSet<JobId> {
    views
        .iter()
        .filter(|v| v.effective_status() == JobStatus::Completed)
        .map(|v| v.record.job_id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8Path;
    use tempfile::TempDir;
    use wjm_core::layout::atomic_write;
    use wjm_core::record::JobSpec;
    use wjm_core::spec::{CpuSpec, GpuSpec, MemorySpec, RetryOn};
    use wjm_core::{Config, Priority};

    fn dirs(temp: &TempDir) -> StateDirs {
        let root = Utf8Path::from_path(temp.path()).unwrap();
        let dirs = StateDirs::from_config(&Config::with_root(root.to_path_buf()));
        dirs.ensure().unwrap();
        dirs
    }

    fn spec(weight: u32) -> JobSpec {
        JobSpec {
            body: "echo hi\n".to_string(),
            script_name: "job.sh".to_string(),
            name: None,
            weight,
            gpu: GpuSpec::None,
            cpu: CpuSpec::None,
            memory: MemorySpec::None,
            priority: Priority::Normal,
            timeout: None,
            dependencies: Vec::new(),
            retry_max: 0,
            retry_delay: std::time::Duration::from_secs(60),
            retry_on: RetryOn::AnyNonzero,
            pre_hook: None,
            post_hook: None,
            on_fail: None,
            on_success: None,
            project: None,
            group: None,
            array: None,
        }
    }

    fn write_running(dirs: &StateDirs, index: u16, weight: u32, pid: Option<u32>) -> JobId {
        let id = JobId::new(index).unwrap();
        let mut record = JobRecord::from_spec(&spec(weight), id, "alice");
        record.pid = pid;
        fs::create_dir_all(dirs.record_dir(id)).unwrap();
        write_record(&dirs.job_info(id), &record).unwrap();
        if let Some(pid) = pid {
            atomic_write(&dirs.pid_file(id), &pid.to_string()).unwrap();
        }
        id
    }

    #[test]
    fn test_missing_info_is_skipped() {
        let temp = TempDir::new().unwrap();
        let dirs = dirs(&temp);
        fs::create_dir_all(dirs.record_dir(JobId::new(1).unwrap())).unwrap();
        assert!(load_job(&dirs, JobId::new(1).unwrap()).unwrap().is_none());
        assert!(scan_jobs(&dirs).unwrap().is_empty());
    }

    #[test]
    fn test_live_record_counts_usage() {
        let temp = TempDir::new().unwrap();
        let dirs = dirs(&temp);
        // Our own pid is certainly alive.
        write_running(&dirs, 1, 40, Some(std::process::id()));
        let views = scan_jobs(&dirs).unwrap();
        let usage = running_usage(&views);
        assert_eq!(usage.count, 1);
        assert_eq!(usage.weight, 40);
    }

    #[test]
    fn test_stale_record_self_heals() {
        let temp = TempDir::new().unwrap();
        let dirs = dirs(&temp);
        // Pid far above any real process on the test host.
        let id = write_running(&dirs, 1, 40, Some(4_000_000));
        let view = load_job(&dirs, id).unwrap().unwrap();
        assert!(view.stale);
        assert_eq!(view.effective_status(), JobStatus::Failed);
        assert!(!dirs.pid_file(id).exists());

        // Status stays RUNNING on disk; the pid field is gone.
        let on_disk = read_record(&dirs.job_info(id)).unwrap();
        assert_eq!(on_disk.status, JobStatus::Running);
        assert_eq!(on_disk.pid, None);

        // And a stale record holds no capacity.
        let usage = running_usage(&scan_jobs(&dirs).unwrap());
        assert_eq!(usage, RunningUsage::default());
    }

    #[test]
    fn test_completed_ids() {
        let temp = TempDir::new().unwrap();
        let dirs = dirs(&temp);
        let id = write_running(&dirs, 2, 10, None);
        let mut record = read_record(&dirs.job_info(id)).unwrap();
        record.status = JobStatus::Completed;
        record.exit_code = Some(0);
        write_record(&dirs.job_info(id), &record).unwrap();

        let views = scan_jobs(&dirs).unwrap();
        assert!(completed_ids(&views).contains(&id));
    }

    #[test]
    fn test_gpu_usage_derived_from_live_records() {
        let temp = TempDir::new().unwrap();
        let dirs = dirs(&temp);
        let id = write_running(&dirs, 1, 10, Some(std::process::id()));
        let mut record = read_record(&dirs.job_info(id)).unwrap();
        record.gpu = GpuSpec::Ids(vec![0, 2]);
        write_record(&dirs.job_info(id), &record).unwrap();

        let usage = running_usage(&scan_jobs(&dirs).unwrap());
        assert_eq!(usage.gpus, BTreeSet::from([0, 2]));
    }
}
