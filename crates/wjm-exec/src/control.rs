//! Control verbs: kill, pause, resume, signal.
//!
//! Each one locates the record, enforces ownership by effective user,
//! and signals the supervised process group (falling back to the single
//! pid when the group signal fails). Pause and resume own SIGSTOP and
//! SIGCONT; the generic signal verb rejects them.

use std::fs;
use std::str::FromStr;

use chrono::Utc;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;

use wjm_core::codec::write_record;
use wjm_core::layout::StateDirs;
use wjm_core::record::{JobId, JobRecord, JobStatus};
use wjm_core::Config;
use wjm_sched::{load_job, load_queued_spec, remove_queue_entry, unregister_pid, JobView};

use crate::dispatch::{current_user, file_owner};
use crate::error::ExecError;

fn ensure_owner(record: &JobRecord) -> Result<(), ExecError> {
    if nix::unistd::Uid::effective().is_root() {
        return Ok(());
    }
    let user = current_user();
    if record.user != user {
        return Err(ExecError::NotOwner {
            id: record.job_id,
            owner: record.user.clone(),
        });
    }
    Ok(())
}

fn ensure_file_owner(id: JobId, path: &camino::Utf8Path) -> Result<String, ExecError> {
    let owner = file_owner(path).unwrap_or_else(|| "unknown".to_string());
    if nix::unistd::Uid::effective().is_root() {
        return Ok(owner);
    }
    if owner != current_user() {
        return Err(ExecError::NotOwner { id, owner });
    }
    Ok(owner)
}

/// Signal the job's process group, falling back to the single pid.
fn signal_group(pid: u32, signal: Signal) -> Result<(), ExecError> {
    let pid = Pid::from_raw(pid as i32);
    if killpg(pid, signal).is_ok() {
        return Ok(());
    }
    kill(pid, signal)?;
    Ok(())
}

fn live_view(dirs: &StateDirs, id: JobId) -> Result<JobView, ExecError> {
    let view = load_job(dirs, id)?.ok_or(ExecError::NotFound(id))?;
    if !view.is_live() {
        return Err(ExecError::WrongState {
            id,
            status: view.effective_status(),
        });
    }
    Ok(view)
}

/// Kill a running, paused, or queued job.
///
/// Running jobs get SIGTERM (escalation to SIGKILL is the timeout
/// facility's business, never kill's). Queued jobs lose their entry and
/// gain a KILLED record so the id never silently vanishes.
pub fn kill_job(config: &Config, dirs: &StateDirs, id: JobId) -> Result<(), ExecError> {
    if let Some(view) = load_job(dirs, id)? {
        let mut record = view.record;
        ensure_owner(&record)?;
        if record.status.is_terminal() {
            return Err(ExecError::WrongState {
                id,
                status: record.status,
            });
        }
        if let (false, Some(pid)) = (view.stale, record.pid) {
            if let Err(e) = signal_group(pid, Signal::SIGTERM) {
                tracing::warn!(job = %id, error = %e, "SIGTERM delivery failed");
            }
            // A stopped group only sees the TERM once it continues.
            if record.status == JobStatus::Paused {
                let _ = signal_group(pid, Signal::SIGCONT);
            }
            if let Err(e) = unregister_pid(dirs, pid) {
                tracing::warn!(job = %id, error = %e, "failed to unregister pid");
            }
        }
        record.status = JobStatus::Killed;
        record.end_time = Some(Utc::now());
        record.pid = None;
        write_record(&dirs.job_info(id), &record)?;
        remove_pid_file(dirs, id);
        // Defensive: a queue entry for the same id has no owner anymore.
        remove_queue_entry(dirs, id, false)?;
        tracing::info!(job = %id, "killed");
        return Ok(());
    }

    // No record: a queued job. Remove the entry and leave a KILLED record
    // behind.
    let script_path = dirs.queue_script(id);
    if !script_path.exists() {
        return Err(ExecError::NotFound(id));
    }
    let owner = ensure_file_owner(id, &script_path)?;
    let spec = load_queued_spec(dirs, config, id)?;
    remove_queue_entry(dirs, id, false)?;

    let mut record = JobRecord::from_spec(&spec, id, &owner);
    record.status = JobStatus::Killed;
    record.queue_time = Some(record.submit_time);
    record.end_time = Some(Utc::now());
    fs::create_dir_all(dirs.record_dir(id).as_std_path())?;
    write_record(&dirs.job_info(id), &record)?;
    tracing::info!(job = %id, "killed while queued");
    Ok(())
}

/// SIGSTOP the job's process group and flip the record to PAUSED.
pub fn pause_job(dirs: &StateDirs, id: JobId) -> Result<(), ExecError> {
    let view = live_view(dirs, id)?;
    let mut record = view.record;
    ensure_owner(&record)?;
    if record.status != JobStatus::Running {
        return Err(ExecError::WrongState {
            id,
            status: record.status,
        });
    }
    let pid = record.pid.ok_or(ExecError::NotFound(id))?;
    signal_group(pid, Signal::SIGSTOP)?;
    record.status = JobStatus::Paused;
    write_record(&dirs.job_info(id), &record)?;
    tracing::info!(job = %id, "paused");
    Ok(())
}

/// SIGCONT the job's process group and flip the record back to RUNNING.
pub fn resume_job(dirs: &StateDirs, id: JobId) -> Result<(), ExecError> {
    let view = live_view(dirs, id)?;
    let mut record = view.record;
    ensure_owner(&record)?;
    if record.status != JobStatus::Paused {
        return Err(ExecError::WrongState {
            id,
            status: record.status,
        });
    }
    let pid = record.pid.ok_or(ExecError::NotFound(id))?;
    signal_group(pid, Signal::SIGCONT)?;
    record.status = JobStatus::Running;
    write_record(&dirs.job_info(id), &record)?;
    tracing::info!(job = %id, "resumed");
    Ok(())
}

/// Forward an arbitrary signal to the job's process group.
pub fn signal_job(dirs: &StateDirs, id: JobId, signal: &str) -> Result<(), ExecError> {
    let parsed = parse_signal(signal)?;
    if matches!(parsed, Signal::SIGSTOP | Signal::SIGCONT) {
        return Err(ExecError::ReservedSignal);
    }
    let view = live_view(dirs, id)?;
    ensure_owner(&view.record)?;
    let pid = view.record.pid.ok_or(ExecError::NotFound(id))?;
    signal_group(pid, parsed)?;
    tracing::info!(job = %id, signal = %parsed, "signal forwarded");
    Ok(())
}

/// Accepts `TERM`, `SIGTERM`, or a numeric signal.
fn parse_signal(s: &str) -> Result<Signal, ExecError> {
    let s = s.trim();
    if let Ok(num) = s.parse::<i32>() {
        return Signal::try_from(num).map_err(|_| ExecError::InvalidSignal(s.to_string()));
    }
    let name = s.to_uppercase();
    let name = if name.starts_with("SIG") {
        name
    } else {
        format!("SIG{name}")
    };
    Signal::from_str(&name).map_err(|_| ExecError::InvalidSignal(s.to_string()))
}

fn remove_pid_file(dirs: &StateDirs, id: JobId) {
    if let Err(e) = fs::remove_file(dirs.pid_file(id).as_std_path()) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(job = %id, error = %e, "failed to remove pid file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8Path;
    use tempfile::TempDir;
    use wjm_core::layout::atomic_write;
    use wjm_core::record::JobSpec;
    use wjm_core::spec::{CpuSpec, GpuSpec, MemorySpec, RetryOn};
    use wjm_core::Priority;
    use wjm_sched::enqueue;

    fn setup(temp: &TempDir) -> (Config, StateDirs) {
        let root = Utf8Path::from_path(temp.path()).unwrap();
        let config = Config::with_root(root.to_path_buf());
        let dirs = StateDirs::from_config(&config);
        dirs.ensure().unwrap();
        (config, dirs)
    }

    fn spec() -> JobSpec {
        JobSpec {
            body: "sleep 60\n".to_string(),
            script_name: "job.sh".to_string(),
            name: None,
            weight: 10,
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

    fn seed_record(dirs: &StateDirs, index: u16, status: JobStatus, pid: Option<u32>) -> JobId {
        let id = JobId::new(index).unwrap();
        let mut record = JobRecord::from_spec(&spec(), id, &current_user());
        record.status = status;
        record.pid = pid;
        fs::create_dir_all(dirs.record_dir(id)).unwrap();
        write_record(&dirs.job_info(id), &record).unwrap();
        if let Some(pid) = pid {
            atomic_write(&dirs.pid_file(id), &pid.to_string()).unwrap();
        }
        id
    }

    #[test]
    fn test_parse_signal_forms() {
        assert_eq!(parse_signal("TERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("SIGUSR1").unwrap(), Signal::SIGUSR1);
        assert_eq!(parse_signal("9").unwrap(), Signal::SIGKILL);
        assert!(parse_signal("NOPE").is_err());
        assert!(parse_signal("999").is_err());
    }

    #[test]
    fn test_signal_rejects_reserved() {
        let temp = TempDir::new().unwrap();
        let (_, dirs) = setup(&temp);
        let id = seed_record(&dirs, 1, JobStatus::Running, Some(std::process::id()));
        let err = signal_job(&dirs, id, "STOP").unwrap_err();
        assert!(matches!(err, ExecError::ReservedSignal));
        let err = signal_job(&dirs, id, "CONT").unwrap_err();
        assert!(matches!(err, ExecError::ReservedSignal));
    }

    #[test]
    fn test_kill_of_missing_job() {
        let temp = TempDir::new().unwrap();
        let (config, dirs) = setup(&temp);
        let err = kill_job(&config, &dirs, JobId::new(9).unwrap()).unwrap_err();
        assert!(matches!(err, ExecError::NotFound(_)));
    }

    #[test]
    fn test_kill_of_terminal_job_is_wrong_state() {
        let temp = TempDir::new().unwrap();
        let (config, dirs) = setup(&temp);
        let id = seed_record(&dirs, 1, JobStatus::Completed, None);
        let err = kill_job(&config, &dirs, id).unwrap_err();
        assert!(matches!(err, ExecError::WrongState { .. }));
    }

    #[test]
    fn test_kill_queued_job_leaves_killed_record() {
        let temp = TempDir::new().unwrap();
        let (config, dirs) = setup(&temp);
        let id = JobId::new(4).unwrap();
        enqueue(&dirs, &spec(), id, "capacity").unwrap();

        kill_job(&config, &dirs, id).unwrap();
        assert!(!dirs.queue_script(id).exists());
        let record = wjm_core::codec::read_record(&dirs.job_info(id)).unwrap();
        assert_eq!(record.status, JobStatus::Killed);
        assert!(record.end_time.is_some());
    }

    #[test]
    fn test_pause_requires_running() {
        let temp = TempDir::new().unwrap();
        let (_, dirs) = setup(&temp);
        let id = seed_record(&dirs, 1, JobStatus::Paused, Some(std::process::id()));
        let err = pause_job(&dirs, id).unwrap_err();
        assert!(matches!(err, ExecError::WrongState { .. }));
    }

    #[test]
    fn test_owner_check_blocks_other_users() {
        let temp = TempDir::new().unwrap();
        let (_, dirs) = setup(&temp);
        let id = JobId::new(2).unwrap();
        let mut record = JobRecord::from_spec(&spec(), id, "someone_else");
        record.status = JobStatus::Running;
        record.pid = Some(std::process::id());
        fs::create_dir_all(dirs.record_dir(id)).unwrap();
        write_record(&dirs.job_info(id), &record).unwrap();
        atomic_write(&dirs.pid_file(id), &std::process::id().to_string()).unwrap();

        if nix::unistd::Uid::effective().is_root() {
            // Root bypasses ownership; nothing to assert here.
            return;
        }
        let err = pause_job(&dirs, id).unwrap_err();
        assert!(matches!(err, ExecError::NotOwner { .. }));
    }
}
