//! Queue entries: one script per QUEUED job plus its sidecar set.
//!
//! A sidecar is one small file per attribute, each rewritten atomically
//! via rename; that is the closest thing the substrate has to an atomic
//! group write. The script itself is stored with its directive header so
//! a drain pass (or resubmit) can rebuild the full spec.

use std::fs;
use std::io;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use thiserror::Error;

use wjm_core::layout::{atomic_write, Sidecar, StateDirs};
use wjm_core::record::{JobId, JobSpec, Priority};
use wjm_core::spec::{GpuSpec, NOT_APPLICABLE};
use wjm_core::Config;
use wjm_parsers::directive::render_script;
use wjm_parsers::{parse_script, DirectiveError};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue io error: {0}")]
    Io(#[from] io::Error),
    #[error("queue entry for {id} is missing its script")]
    MissingScript { id: JobId },
    #[error(transparent)]
    Directive(#[from] DirectiveError),
}

/// One queued script paired with its priority, ready for drain ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: JobId,
    pub priority_value: u32,
}

/// Write a queue entry and its sidecars for a refused submission.
pub fn enqueue(
    dirs: &StateDirs,
    spec: &JobSpec,
    id: JobId,
    reason: &str,
) -> Result<(), QueueError> {
    fs::create_dir_all(dirs.queue_dir.as_std_path())?;
    atomic_write(&dirs.queue_script(id), &render_script(spec))?;

    let depends = if spec.dependencies.is_empty() {
        NOT_APPLICABLE.to_string()
    } else {
        spec.dependencies
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(",")
    };
    let sidecars = [
        (Sidecar::Weight, spec.weight.to_string()),
        (Sidecar::Gpu, spec.gpu.to_field()),
        (Sidecar::Priority, spec.priority.value().to_string()),
        (Sidecar::Depends, depends),
        (Sidecar::SubmitTime, Utc::now().to_rfc3339()),
        (
            Sidecar::Name,
            spec.name.clone().unwrap_or_else(|| NOT_APPLICABLE.to_string()),
        ),
        (Sidecar::Reason, reason.to_string()),
    ];
    for (kind, value) in sidecars {
        atomic_write(&dirs.sidecar(id, kind), &value)?;
    }
    Ok(())
}

/// Refresh the human-readable refusal reason on an existing entry.
pub fn update_reason(dirs: &StateDirs, id: JobId, reason: &str) -> io::Result<()> {
    atomic_write(&dirs.sidecar(id, Sidecar::Reason), reason)
}

fn read_sidecar(dirs: &StateDirs, id: JobId, kind: Sidecar) -> Option<String> {
    let text = fs::read_to_string(dirs.sidecar(id, kind).as_std_path()).ok()?;
    let text = text.trim().to_string();
    (!text.is_empty() && text != NOT_APPLICABLE).then_some(text)
}

/// Queued entries in drain order: priority descending, ties in id order
/// (which reflects submit order). With the priority queue disabled the
/// order is purely id order.
pub fn list_queue_entries(
    dirs: &StateDirs,
    priority_enabled: bool,
) -> Result<Vec<QueueEntry>, QueueError> {
    let mut entries = Vec::new();
    let read = match fs::read_dir(dirs.queue_dir.as_std_path()) {
        Ok(read) => read,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(entries),
        Err(e) => return Err(e.into()),
    };
    for entry in read {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(stem) = name.strip_suffix(".run") else {
            continue;
        };
        let Ok(id) = stem.parse::<JobId>() else {
            continue;
        };
        let priority_value = read_sidecar(dirs, id, Sidecar::Priority)
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| Priority::Normal.value());
        entries.push(QueueEntry { id, priority_value });
    }

    entries.sort_by_key(|e| e.id);
    if priority_enabled {
        entries.sort_by_key(|e| std::cmp::Reverse(e.priority_value));
    }
    Ok(entries)
}

/// Rebuild the full spec for a queued job from its script and sidecars.
///
/// The sidecars are authoritative for the attributes they carry; symbolic
/// GPU specs come back as written and are re-resolved by the caller.
pub fn load_queued_spec(
    dirs: &StateDirs,
    config: &Config,
    id: JobId,
) -> Result<JobSpec, QueueError> {
    let script_path = dirs.queue_script(id);
    let text = fs::read_to_string(script_path.as_std_path()).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            QueueError::MissingScript { id }
        } else {
            QueueError::Io(e)
        }
    })?;
    let parsed = parse_script(&text)?;
    let mut spec = parsed.directives.into_spec(config, id.dir_name(), parsed.body);

    if let Some(weight) = read_sidecar(dirs, id, Sidecar::Weight).and_then(|v| v.parse().ok()) {
        spec.weight = weight;
    }
    if let Some(gpu) = read_sidecar(dirs, id, Sidecar::Gpu).and_then(|v| v.parse().ok()) {
        spec.gpu = gpu;
    }
    if let Some(priority) = read_sidecar(dirs, id, Sidecar::Priority)
        .and_then(|v| v.parse().ok())
        .and_then(Priority::from_value)
    {
        spec.priority = priority;
    }
    if let Some(depends) = read_sidecar(dirs, id, Sidecar::Depends) {
        spec.dependencies = depends
            .split(',')
            .filter_map(|d| d.trim().parse().ok())
            .collect();
    }
    spec.name = read_sidecar(dirs, id, Sidecar::Name);
    Ok(spec)
}

/// Queue metadata for monitoring output.
pub fn queued_meta(dirs: &StateDirs, id: JobId) -> (Option<DateTime<Utc>>, Option<String>) {
    let submit_time = read_sidecar(dirs, id, Sidecar::SubmitTime)
        .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
        .map(|dt| dt.with_timezone(&Utc));
    let reason = read_sidecar(dirs, id, Sidecar::Reason);
    (submit_time, reason)
}

/// Remove a queue entry and all its sidecars. When `mark_processed` the
/// dispatch marker is left behind for the 24 h cleanup window.
pub fn remove_queue_entry(
    dirs: &StateDirs,
    id: JobId,
    mark_processed: bool,
) -> io::Result<()> {
    remove_if_exists(&dirs.queue_script(id))?;
    for kind in Sidecar::ALL {
        remove_if_exists(&dirs.sidecar(id, kind))?;
    }
    if mark_processed {
        atomic_write(&dirs.processed_marker(id), &Utc::now().to_rfc3339())?;
    }
    Ok(())
}

fn remove_if_exists(path: &camino::Utf8Path) -> io::Result<()> {
    match fs::remove_file(path.as_std_path()) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Delete processed markers older than `ttl`. Returns how many went.
pub fn clean_processed_markers(dirs: &StateDirs, ttl: Duration) -> io::Result<usize> {
    let mut removed = 0;
    let read = match fs::read_dir(dirs.queue_dir.as_std_path()) {
        Ok(read) => read,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let now = SystemTime::now();
    for entry in read {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.ends_with(".run.processed") {
            continue;
        }
        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|m| now.duration_since(m).ok());
        if age.is_some_and(|a| a > ttl) {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}
