//! Control verbs: thin wrappers over the execution primitives.

use miette::{IntoDiagnostic, Result};

use wjm_core::layout::StateDirs;
use wjm_core::record::JobId;
use wjm_core::Config;
use wjm_exec::{current_user, drain_queue, kill_job, pause_job, resume_job, signal_job, ExecError};
use wjm_sched::scan_jobs;

use super::submit::queued_ids;

/// Kill one job, or every non-terminal job the caller owns.
pub async fn kill(config: &Config, dirs: &StateDirs, target: &str) -> Result<()> {
    if target == "all" {
        let me = current_user();
        let root = nix::unistd::Uid::effective().is_root();
        let mut killed = 0;

        let views = scan_jobs(dirs).into_diagnostic()?;
        for view in views {
            if view.record.status.is_terminal() {
                continue;
            }
            if !root && view.record.user != me {
                continue;
            }
            match kill_job(config, dirs, view.record.job_id) {
                Ok(()) => killed += 1,
                Err(e) => tracing::warn!(job = %view.record.job_id, error = %e, "kill failed"),
            }
        }
        for id in queued_ids(dirs)? {
            match kill_job(config, dirs, id) {
                Ok(()) => killed += 1,
                Err(ExecError::NotOwner { .. }) => {}
                Err(e) => tracing::warn!(job = %id, error = %e, "kill failed"),
            }
        }
        println!("killed {killed} job(s)");
    } else {
        let id: JobId = target.parse().into_diagnostic()?;
        kill_job(config, dirs, id).into_diagnostic()?;
        println!("{id} killed");
    }

    // Freed capacity: let queued work in.
    drain_queue(config, dirs).await.into_diagnostic()?;
    Ok(())
}

pub fn pause(dirs: &StateDirs, id: JobId) -> Result<()> {
    pause_job(dirs, id).into_diagnostic()?;
    println!("{id} paused");
    Ok(())
}

pub fn resume(dirs: &StateDirs, id: JobId) -> Result<()> {
    resume_job(dirs, id).into_diagnostic()?;
    println!("{id} resumed");
    Ok(())
}

pub fn signal(dirs: &StateDirs, id: JobId, name: &str) -> Result<()> {
    signal_job(dirs, id, name).into_diagnostic()?;
    println!("{name} sent to {id}");
    Ok(())
}
