//! Managed-pid registry.
//!
//! Every spawned supervisor is recorded as a `pid job_id` line in
//! `.scheduler_state/managed_pids.txt`. `doctor` uses it to find orphans:
//! processes still alive after their owning record directory is gone.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use wjm_core::layout::{atomic_write, StateDirs};
use wjm_core::record::JobId;

use crate::scan::pid_alive;

pub fn register_pid(dirs: &StateDirs, pid: u32, id: JobId) -> io::Result<()> {
    fs::create_dir_all(dirs.state_dir.as_std_path())?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dirs.managed_pids().as_std_path())?;
    writeln!(file, "{pid} {id}")
}

/// Drop a pid's line from the registry.
pub fn unregister_pid(dirs: &StateDirs, pid: u32) -> io::Result<()> {
    let path = dirs.managed_pids();
    let text = match fs::read_to_string(path.as_std_path()) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let prefix = format!("{pid} ");
    let kept: Vec<&str> = text
        .lines()
        .filter(|line| !line.starts_with(&prefix))
        .collect();
    let mut out = kept.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    atomic_write(&path, &out)
}

/// Registry entries whose record directory is gone.
///
/// Dead pids are pruned from the registry as a side effect; live ones are
/// returned for the caller to reap.
pub fn scan_orphans(dirs: &StateDirs) -> io::Result<Vec<(u32, JobId)>> {
    let path = dirs.managed_pids();
    let text = match fs::read_to_string(path.as_std_path()) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut orphans = Vec::new();
    let mut kept = String::new();
    for line in text.lines() {
        let Some((pid_str, id_str)) = line.split_once(' ') else {
            continue;
        };
        let (Ok(pid), Ok(id)) = (pid_str.parse::<u32>(), id_str.parse::<JobId>()) else {
            continue;
        };
        if !pid_alive(pid) {
            // Process already gone: just prune the line.
            continue;
        }
        if dirs.job_info(id).exists() {
            kept.push_str(line);
            kept.push('\n');
        } else {
            orphans.push((pid, id));
            kept.push_str(line);
            kept.push('\n');
        }
    }
    atomic_write(&path, &kept)?;
    Ok(orphans)
}

/// Terminate an orphan and drop it from the registry.
pub fn reap_orphan(dirs: &StateDirs, pid: u32) -> io::Result<()> {
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::warn!(pid, error = %e, "failed to signal orphan");
    }
    unregister_pid(dirs, pid)
}
