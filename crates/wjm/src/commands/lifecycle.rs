//! Lifecycle verbs: drain, archive, clean, doctor, validate-config,
//! resources.

use std::fs;
use std::io::{BufReader, Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{Duration as ChronoDuration, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use miette::{IntoDiagnostic, Result};
use serde_json::json;

use wjm_cli::CleanFilter;
use wjm_core::layout::StateDirs;
use wjm_core::record::JobStatus;
use wjm_core::Config;
use wjm_exec::drain_queue;
use wjm_sched::{probe_system, reap_orphan, scan_jobs, scan_orphans, running_usage};

pub async fn drain(config: &Config, dirs: &StateDirs) -> Result<()> {
    let dispatched = drain_queue(config, dirs).await.into_diagnostic()?;
    println!("dispatched {dispatched} job(s)");
    Ok(())
}

/// Move terminal records into the next archive batch, compressing logs.
pub fn archive(config: &Config, dirs: &StateDirs) -> Result<()> {
    let views = scan_jobs(dirs).into_diagnostic()?;
    let terminal: Vec<_> = views
        .iter()
        .filter(|v| v.record.status.is_terminal())
        .collect();
    if terminal.is_empty() {
        println!("nothing to archive");
        return Ok(());
    }

    let batch = next_batch(config, dirs).into_diagnostic()?;
    fs::create_dir_all(batch.as_std_path()).into_diagnostic()?;

    for view in &terminal {
        let id = view.record.job_id;
        let from = dirs.record_dir(id);
        let to = batch.join(id.dir_name());
        fs::rename(from.as_std_path(), to.as_std_path()).into_diagnostic()?;
        if config.log_compression_enabled {
            compress_logs(&to).into_diagnostic()?;
        }
    }
    prune_batches(config, dirs).into_diagnostic()?;
    println!("archived {} job(s) into {batch}", terminal.len());
    Ok(())
}

/// The batch new archives land in: the highest existing batch while it
/// has room under ARCHIVE_THRESHOLD, otherwise the next index.
fn next_batch(config: &Config, dirs: &StateDirs) -> std::io::Result<Utf8PathBuf> {
    let mut highest: Option<u32> = None;
    if let Ok(entries) = fs::read_dir(dirs.archive_dir.as_std_path()) {
        for entry in entries.flatten() {
            if let Some(index) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.parse::<u32>().ok())
            {
                highest = Some(highest.map_or(index, |h: u32| h.max(index)));
            }
        }
    }
    let batch_index = match highest {
        None => 0,
        Some(index) => {
            let count = fs::read_dir(dirs.archive_batch(index).as_std_path())
                .map(|entries| entries.count())
                .unwrap_or(0);
            if config.archive_threshold > 0 && count >= config.archive_threshold as usize {
                index + 1
            } else {
                index
            }
        }
    };
    Ok(dirs.archive_batch(batch_index))
}

/// Oldest batches go first once MAX_ARCHIVE_BATCHES is exceeded.
fn prune_batches(config: &Config, dirs: &StateDirs) -> std::io::Result<()> {
    if config.max_archive_batches == 0 {
        return Ok(());
    }
    let mut batches: Vec<u32> = fs::read_dir(dirs.archive_dir.as_std_path())?
        .flatten()
        .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse().ok()))
        .collect();
    batches.sort_unstable();
    while batches.len() > config.max_archive_batches as usize {
        let oldest = batches.remove(0);
        let path = dirs.archive_batch(oldest);
        tracing::info!(batch = %path, "pruning oldest archive batch");
        fs::remove_dir_all(path.as_std_path())?;
    }
    Ok(())
}

fn compress_logs(job_dir: &Utf8Path) -> std::io::Result<()> {
    for entry in fs::read_dir(job_dir.as_std_path())?.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.ends_with(".log") {
            continue;
        }
        let source = entry.path();
        let target = source.with_extension("log.gz");

        let mut reader = BufReader::new(fs::File::open(&source)?);
        let mut encoder = GzEncoder::new(fs::File::create(&target)?, Compression::default());
        let mut buf = [0u8; 8192];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            encoder.write_all(&buf[..n])?;
        }
        encoder.finish()?.sync_all()?;
        fs::remove_file(&source)?;
    }
    Ok(())
}

/// Delete finished records matching the filter.
pub fn clean(config: &Config, dirs: &StateDirs, filter: CleanFilter) -> Result<()> {
    let views = scan_jobs(dirs).into_diagnostic()?;
    let cutoff = Utc::now() - ChronoDuration::days(i64::from(config.log_cleanup_days));
    let mut removed = 0;

    for view in views {
        let record = &view.record;
        if !record.status.is_terminal() {
            continue;
        }
        let matches = match filter {
            CleanFilter::Failed => record.status == JobStatus::Failed,
            CleanFilter::Completed => record.status == JobStatus::Completed,
            CleanFilter::All => true,
            CleanFilter::Old => record.end_time.is_some_and(|end| end < cutoff),
        };
        if matches {
            fs::remove_dir_all(dirs.record_dir(record.job_id).as_std_path()).into_diagnostic()?;
            removed += 1;
        }
    }
    println!("removed {removed} job record(s)");
    Ok(())
}

/// Heal stale records, reap orphans, report lock debris.
pub fn doctor(dirs: &StateDirs) -> Result<()> {
    // The scan itself clears dead pid files.
    let views = scan_jobs(dirs).into_diagnostic()?;
    let stale = views.iter().filter(|v| v.stale).count();
    if stale > 0 {
        println!("healed {stale} stale record(s)");
    }

    let orphans = scan_orphans(dirs).into_diagnostic()?;
    for (pid, id) in &orphans {
        println!("reaping orphan pid {pid} (was {id})");
        reap_orphan(dirs, *pid).into_diagnostic()?;
    }

    for name in ["scheduler", "idgen", "queue_drain"] {
        let sentinel = dirs.lock_sentinel(name);
        if sentinel.exists() {
            // Never auto-removed; could belong to a live process.
            println!("stale {name} lock directory at {sentinel}; remove it manually if no scheduler is running");
        }
    }

    if stale == 0 && orphans.is_empty() {
        println!("state is healthy");
    }
    Ok(())
}

/// Parse and lint the config file without touching any state.
pub fn validate_config(explicit: Option<&Utf8Path>) -> Result<()> {
    let located = explicit.map(Utf8Path::to_path_buf).or_else(Config::locate);
    let Some(path) = located else {
        println!("no config file found; built-in defaults are in use");
        return Ok(());
    };

    let config = Config::load(&path).into_diagnostic()?;
    let findings = config.lint();
    if findings.is_empty() {
        println!("{path}: ok");
    } else {
        println!("{path}:");
        for finding in findings {
            println!("  warning: {finding}");
        }
    }
    Ok(())
}

/// System inventory plus current allocation.
pub async fn resources(dirs: &StateDirs, json: bool) -> Result<()> {
    let system = probe_system().await;
    let views = scan_jobs(dirs).into_diagnostic()?;
    let usage = running_usage(&views);

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "system": system,
                "allocated": {
                    "running_jobs": usage.count,
                    "running_weight": usage.weight,
                    "gpus": usage.gpus,
                },
            }))
            .into_diagnostic()?
        );
        return Ok(());
    }

    println!(
        "cpus: {} logical, {} physical",
        system.logical_cpus, system.physical_cpus
    );
    println!(
        "memory: {:.1} GiB total, {:.1} GiB available",
        system.total_memory_bytes as f64 / (1u64 << 30) as f64,
        system.available_memory_bytes as f64 / (1u64 << 30) as f64,
    );
    if system.gpus.is_empty() {
        println!("gpus: none detected");
    } else {
        println!("gpus:");
        for gpu in &system.gpus {
            let state = if usage.gpus.contains(&gpu.index) {
                "allocated"
            } else {
                "free"
            };
            println!(
                "  {}: {} ({} MiB, {}% util) [{state}]",
                gpu.index, gpu.name, gpu.memory_total_mb, gpu.utilization_pct
            );
        }
    }
    println!(
        "allocation: {} running job(s), weight {}",
        usage.count, usage.weight
    );
    Ok(())
}
