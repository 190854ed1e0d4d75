//! Monitoring verbs: status, list, info, logs, watch.
//!
//! All reads go through the sanitizing scan, so a stale record is healed
//! by whichever monitor sees it first. `watch` is a plain reprint loop.

use std::fs;
use std::io::{Read, Seek, SeekFrom};

use chrono::Utc;
use miette::{bail, miette, IntoDiagnostic, Result};
use serde_json::json;
use tokio::time::sleep;

use wjm_core::codec::serialize_record;
use wjm_core::layout::StateDirs;
use wjm_core::record::{JobId, JobStatus};
use wjm_core::Config;
use wjm_parsers::format_duration;
use wjm_sched::{
    list_queue_entries, load_job, load_queued_spec, queued_meta, running_usage, scan_jobs, JobView,
};

fn elapsed_since(start: chrono::DateTime<Utc>) -> String {
    let secs = (Utc::now() - start).num_seconds().max(0) as u64;
    format_duration(secs)
}

fn status_label(view: &JobView) -> String {
    if view.stale {
        format!("{} (stale)", view.effective_status())
    } else {
        view.record.status.to_string()
    }
}

pub fn status(config: &Config, dirs: &StateDirs) -> Result<()> {
    let views = scan_jobs(dirs).into_diagnostic()?;
    let usage = running_usage(&views);
    let queued = list_queue_entries(dirs, config.priority_queue_enabled).into_diagnostic()?;

    let count_of = |status: JobStatus| {
        views
            .iter()
            .filter(|v| v.effective_status() == status)
            .count()
    };
    println!(
        "jobs: {} running, {} paused, {} queued, {} completed, {} failed, {} killed",
        count_of(JobStatus::Running),
        count_of(JobStatus::Paused),
        queued.len(),
        count_of(JobStatus::Completed),
        count_of(JobStatus::Failed),
        count_of(JobStatus::Killed),
    );

    let jobs_cap = match config.max_concurrent_jobs {
        0 => "unlimited".to_string(),
        n => n.to_string(),
    };
    let weight_cap = match config.max_total_weight {
        0 => "unlimited".to_string(),
        n => n.to_string(),
    };
    let gpus = if usage.gpus.is_empty() {
        "none".to_string()
    } else {
        usage
            .gpus
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(",")
    };
    println!(
        "capacity: {}/{} jobs, weight {}/{}, gpus in use: {}",
        usage.count, jobs_cap, usage.weight, weight_cap, gpus
    );

    let live: Vec<&JobView> = views.iter().filter(|v| v.is_live()).collect();
    if !live.is_empty() {
        println!("running:");
        for view in live {
            let record = &view.record;
            let since = record
                .start_time
                .map(elapsed_since)
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {}  {:<9} w{:<4} gpu {:<6} {:>8}  {}",
                record.job_id,
                record.status.to_string(),
                record.weight,
                record.gpu.to_field(),
                since,
                record.display_name(),
            );
        }
    }

    if !queued.is_empty() {
        println!("queued:");
        for entry in &queued {
            let (_, reason) = queued_meta(dirs, entry.id);
            let spec = load_queued_spec(dirs, config, entry.id).ok();
            let name = spec
                .as_ref()
                .and_then(|s| s.name.clone())
                .unwrap_or_else(|| "-".to_string());
            let weight = spec.as_ref().map(|s| s.weight).unwrap_or(0);
            println!(
                "  {}  prio {:<3} w{:<4} {:<16} {}",
                entry.id,
                entry.priority_value,
                weight,
                name,
                reason.unwrap_or_default(),
            );
        }
    }
    Ok(())
}

pub fn list(
    config: &Config,
    dirs: &StateDirs,
    status: Option<String>,
    project: Option<String>,
    group: Option<String>,
    json: bool,
) -> Result<()> {
    let status_filter = status
        .map(|s| {
            s.to_uppercase()
                .parse::<JobStatus>()
                .map_err(|e| miette!("{e}"))
        })
        .transpose()?;

    let views = scan_jobs(dirs).into_diagnostic()?;
    let mut rows = Vec::new();
    for view in &views {
        let record = &view.record;
        if let Some(filter) = status_filter {
            if view.effective_status() != filter {
                continue;
            }
        }
        if let Some(project) = &project {
            if record.project.as_deref() != Some(project.as_str()) {
                continue;
            }
        }
        if let Some(group) = &group {
            if record.group.as_deref() != Some(group.as_str()) {
                continue;
            }
        }
        rows.push(json!({
            "job_id": record.job_id.to_string(),
            "name": record.display_name(),
            "status": status_label(view),
            "priority": record.priority.to_string(),
            "weight": record.weight,
            "user": record.user,
            "project": record.project,
            "group": record.group,
            "submit_time": record.submit_time.to_rfc3339(),
            "exit_code": record.exit_code,
        }));
    }

    if status_filter.is_none() || status_filter == Some(JobStatus::Queued) {
        for entry in list_queue_entries(dirs, config.priority_queue_enabled).into_diagnostic()? {
            let spec = load_queued_spec(dirs, config, entry.id).ok();
            let (submit_time, reason) = queued_meta(dirs, entry.id);
            if let Some(project_filter) = &project {
                let matches = spec
                    .as_ref()
                    .is_some_and(|s| s.project.as_deref() == Some(project_filter.as_str()));
                if !matches {
                    continue;
                }
            }
            if let Some(group_filter) = &group {
                let matches = spec
                    .as_ref()
                    .is_some_and(|s| s.group.as_deref() == Some(group_filter.as_str()));
                if !matches {
                    continue;
                }
            }
            rows.push(json!({
                "job_id": entry.id.to_string(),
                "name": spec.as_ref().and_then(|s| s.name.clone()),
                "status": "QUEUED",
                "priority": entry.priority_value,
                "weight": spec.as_ref().map(|s| s.weight),
                "queue_reason": reason,
                "submit_time": submit_time.map(|t| t.to_rfc3339()),
            }));
        }
    }

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&rows).into_diagnostic()?
        );
        return Ok(());
    }

    if rows.is_empty() {
        println!("no jobs");
        return Ok(());
    }
    println!(
        "{:<8} {:<20} {:<18} {:<8} {:>6}  {}",
        "ID", "NAME", "STATUS", "PRIO", "WEIGHT", "SUBMITTED"
    );
    for row in rows {
        println!(
            "{:<8} {:<20} {:<18} {:<8} {:>6}  {}",
            row["job_id"].as_str().unwrap_or("-"),
            row["name"].as_str().unwrap_or("-"),
            row["status"].as_str().unwrap_or("-"),
            row["priority"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| row["priority"].to_string()),
            row["weight"].as_u64().unwrap_or(0),
            row["submit_time"].as_str().unwrap_or("-"),
        );
    }
    Ok(())
}

pub fn info(config: &Config, dirs: &StateDirs, id: JobId, json: bool) -> Result<()> {
    if let Some(view) = load_job(dirs, id).into_diagnostic()? {
        if json {
            let mut value = serde_json::to_value(&view.record).into_diagnostic()?;
            value["effective_status"] = json!(view.effective_status().to_string());
            println!("{}", serde_json::to_string_pretty(&value).into_diagnostic()?);
        } else {
            print!("{}", serialize_record(&view.record));
            if view.stale {
                println!("# no live process behind this record");
            }
        }
        return Ok(());
    }

    // Queued jobs have no record yet; report from the entry.
    if dirs.queue_script(id).exists() {
        let spec = load_queued_spec(dirs, config, id).into_diagnostic()?;
        let (submit_time, reason) = queued_meta(dirs, id);
        if json {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "job_id": id.to_string(),
                    "status": "QUEUED",
                    "name": spec.name,
                    "weight": spec.weight,
                    "gpu": spec.gpu.to_field(),
                    "priority": spec.priority.to_string(),
                    "dependencies": spec.dependencies.iter().map(|d| d.to_string()).collect::<Vec<_>>(),
                    "queue_reason": reason,
                    "submit_time": submit_time.map(|t| t.to_rfc3339()),
                }))
                .into_diagnostic()?
            );
        } else {
            println!("JOB_ID={id}");
            println!("STATUS=QUEUED");
            println!("WEIGHT={}", spec.weight);
            println!("GPU={}", spec.gpu.to_field());
            println!("PRIORITY={}", spec.priority);
            if let Some(reason) = reason {
                println!("QUEUE_REASON={reason}");
            }
        }
        return Ok(());
    }
    bail!("no job record for {id}")
}

pub async fn logs(
    dirs: &StateDirs,
    id: JobId,
    tail: Option<usize>,
    head: Option<usize>,
    follow: bool,
    all: bool,
) -> Result<()> {
    let path = dirs.log_file(id);
    if !path.exists() {
        bail!("no log for {id} at {path}");
    }

    if follow {
        return follow_log(&path).await;
    }

    let text = fs::read_to_string(path.as_std_path()).into_diagnostic()?;
    if all {
        print!("{text}");
    } else if let Some(n) = head {
        for line in text.lines().take(n) {
            println!("{line}");
        }
    } else {
        let n = tail.unwrap_or(20);
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(n);
        for line in &lines[start..] {
            println!("{line}");
        }
    }
    Ok(())
}

/// Print appended log data until interrupted.
async fn follow_log(path: &camino::Utf8Path) -> Result<()> {
    let mut offset = 0u64;
    loop {
        let len = fs::metadata(path.as_std_path()).into_diagnostic()?.len();
        if len < offset {
            // Truncated (e.g. rotation): start over.
            offset = 0;
        }
        if len > offset {
            let mut file = fs::File::open(path.as_std_path()).into_diagnostic()?;
            file.seek(SeekFrom::Start(offset)).into_diagnostic()?;
            let mut chunk = String::new();
            file.read_to_string(&mut chunk).into_diagnostic()?;
            print!("{chunk}");
            offset = len;
        }
        sleep(std::time::Duration::from_millis(1000)).await;
    }
}

pub async fn watch(config: &Config, dirs: &StateDirs, target: Option<String>) -> Result<()> {
    let target = target.unwrap_or_else(|| "all".to_string());
    let id = if target == "all" {
        None
    } else {
        Some(target.parse::<JobId>().into_diagnostic()?)
    };

    loop {
        // Clear screen and home the cursor; no alternate-screen TUI.
        print!("\x1b[2J\x1b[H");
        match id {
            None => status(config, dirs)?,
            Some(id) => info(config, dirs, id, false)?,
        }
        sleep(config.watch_refresh_interval).await;
    }
}
