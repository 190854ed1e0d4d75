//! The queue drain pass.
//!
//! Runs whenever a supervised job terminates and on the explicit drain
//! verb. One drainer at a time: the `QueueDrain` lock is taken
//! non-blocking and a busy lock means someone else will discover any
//! remaining work. Entries are considered in priority order with
//! work-conserving backfill: an ineligible entry never blocks the ones
//! behind it; it simply stays first in line for the next pass.

use std::fs;
use std::time::Duration;

use wjm_core::layout::StateDirs;
use wjm_core::Config;
use wjm_sched::{
    acquire, clean_processed_markers, completed_ids, evaluate, free_gpu_ids, list_queue_entries,
    load_queued_spec, probe_gpus, remove_queue_entry, running_usage, scan_jobs, update_reason,
    AdmissionOutcome, AdmissionRequest, LockError, LockKind,
};

use crate::dispatch::{current_user, file_owner, start_job};
use crate::error::ExecError;

const PROCESSED_MARKER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Dispatch every eligible queued job. Returns the number dispatched;
/// 0 with no error when another drainer holds the lock.
pub async fn drain_queue(config: &Config, dirs: &StateDirs) -> Result<usize, ExecError> {
    let _guard = match acquire(dirs, LockKind::QueueDrain).await {
        Ok(guard) => guard,
        Err(LockError::Busy(_)) => {
            tracing::debug!("another drainer is active");
            return Ok(0);
        }
        Err(e) => return Err(e.into()),
    };

    if let Err(e) = clean_processed_markers(dirs, PROCESSED_MARKER_TTL) {
        tracing::warn!(error = %e, "processed-marker cleanup failed");
    }

    let mut views = scan_jobs(dirs)?;
    let mut usage = running_usage(&views);
    let at_capacity = |usage: &wjm_sched::RunningUsage| {
        config.max_concurrent_jobs > 0 && usage.count >= config.max_concurrent_jobs
    };
    if at_capacity(&usage) {
        return Ok(0);
    }

    // GPU inventory once per pass; allocation is re-derived per entry.
    let gpus = probe_gpus().await;
    let entries = list_queue_entries(dirs, config.priority_queue_enabled)?;
    let mut dispatched = 0;

    for entry in entries {
        if at_capacity(&usage) {
            break;
        }
        let spec = match load_queued_spec(dirs, config, entry.id) {
            Ok(spec) => spec,
            Err(e) => {
                tracing::warn!(job = %entry.id, error = %e, "unreadable queue entry skipped");
                continue;
            }
        };

        let completed = completed_ids(&views);
        let free = free_gpu_ids(&gpus, &usage.gpus);
        let request = AdmissionRequest {
            weight: spec.weight,
            gpu: &spec.gpu,
            dependencies: &spec.dependencies,
        };
        // Already serialized by QueueDrain; taking Scheduler here would
        // invert the lock order.
        match evaluate(config, &usage, &free, &completed, &request) {
            AdmissionOutcome::Start { gpu_ids } => {
                let user = file_owner(&dirs.queue_script(entry.id)).unwrap_or_else(current_user);
                fs::create_dir_all(dirs.record_dir(entry.id).as_std_path())?;
                match start_job(dirs, &spec, entry.id, gpu_ids, &user) {
                    Ok(_) => {
                        remove_queue_entry(dirs, entry.id, true)?;
                        dispatched += 1;
                        views = scan_jobs(dirs)?;
                        usage = running_usage(&views);
                    }
                    Err(e) => {
                        tracing::warn!(job = %entry.id, error = %e, "queued dispatch failed");
                    }
                }
            }
            AdmissionOutcome::Defer { reason } => {
                if let Err(e) = update_reason(dirs, entry.id, &reason) {
                    tracing::debug!(job = %entry.id, error = %e, "reason refresh failed");
                }
            }
        }
    }

    if dispatched > 0 {
        tracing::info!(dispatched, "drain pass complete");
    }
    Ok(dispatched)
}
