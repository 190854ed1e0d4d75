//! Dispatch: turn an admitted spec into a running supervised job.
//!
//! The supervisor is this same binary re-entered through the hidden
//! `_supervise` verb, spawned into its own session so it survives the
//! submitter's exit and its process group can be signalled as a unit.
//! The caller holds the scheduler lock, so the sequence {record write,
//! spawn, pid visibility} is linearized before anyone else can admit.

use std::fs::{self, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use chrono::Utc;

use wjm_core::codec::write_record;
use wjm_core::layout::{atomic_write, StateDirs};
use wjm_core::record::{JobId, JobRecord, JobSpec};
use wjm_core::spec::GpuSpec;
use wjm_sched::register_pid;

use crate::error::ExecError;

/// Effective user identity, as captured in job records.
pub fn current_user() -> String {
    if let Ok(user) = std::env::var("USER") {
        if !user.is_empty() {
            return user;
        }
    }
    nix::unistd::User::from_uid(nix::unistd::Uid::effective())
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_else(|| "unknown".to_string())
}

/// Username owning `path`, for queue entries that predate any record.
pub fn file_owner(path: &camino::Utf8Path) -> Option<String> {
    use std::os::unix::fs::MetadataExt;
    let uid = fs::metadata(path.as_std_path()).ok()?.uid();
    nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|u| u.name)
}

/// Start a supervised job for an admitted spec. Returns the supervisor
/// pid once the record and pid file are visible on disk.
///
/// Any failure after the record directory exists but before the child is
/// live tears the record back down, so no partial record outlives the
/// scheduler lock.
pub fn start_job(
    dirs: &StateDirs,
    spec: &JobSpec,
    id: JobId,
    gpu_ids: Vec<u32>,
    user: &str,
) -> Result<u32, ExecError> {
    match start_job_inner(dirs, spec, id, gpu_ids, user) {
        Ok(pid) => Ok(pid),
        Err(e) => {
            let _ = fs::remove_dir_all(dirs.record_dir(id).as_std_path());
            Err(e)
        }
    }
}

fn start_job_inner(
    dirs: &StateDirs,
    spec: &JobSpec,
    id: JobId,
    gpu_ids: Vec<u32>,
    user: &str,
) -> Result<u32, ExecError> {
    fs::create_dir_all(dirs.record_dir(id).as_std_path())?;

    let mut record = JobRecord::from_spec(spec, id, user);
    record.gpu = if gpu_ids.is_empty() {
        GpuSpec::None
    } else {
        GpuSpec::Ids(gpu_ids)
    };
    record.start_time = Some(Utc::now());

    let command_path = dirs.command_file(id);
    atomic_write(&command_path, &spec.body)?;
    if spec.body.starts_with("#!") {
        fs::set_permissions(
            command_path.as_std_path(),
            fs::Permissions::from_mode(0o755),
        )?;
    }
    write_record(&dirs.job_info(id), &record)?;

    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dirs.log_file(id).as_std_path())?;
    let exe = std::env::current_exe().map_err(|e| ExecError::Spawn {
        id,
        reason: e.to_string(),
    })?;

    let mut cmd = Command::new(exe);
    cmd.arg("_supervise")
        .arg(id.to_string())
        .env("WJM_JOB_DIR", dirs.job_dir.as_str())
        .stdin(Stdio::null())
        .stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log));
    unsafe {
        // New session: detach from the submitter's terminal and make the
        // supervisor its own process-group leader.
        cmd.pre_exec(|| {
            nix::unistd::setsid()
                .map(|_| ())
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
        });
    }
    let child = cmd.spawn().map_err(|e| ExecError::Spawn {
        id,
        reason: e.to_string(),
    })?;
    let pid = child.id();

    record.pid = Some(pid);
    write_record(&dirs.job_info(id), &record)?;
    atomic_write(&dirs.pid_file(id), &pid.to_string())?;
    if let Err(e) = register_pid(dirs, pid, id) {
        tracing::warn!(job = %id, error = %e, "failed to register supervisor pid");
    }

    tracing::info!(job = %id, pid, weight = record.weight, "job started");
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_user_is_nonempty() {
        assert!(!current_user().is_empty());
    }
}
