//! Submission: directive/preset/flag merge, array expansion, admission.
//!
//! Precedence is preset < script directive < CLI flag. Each expanded spec
//! passes through the normal admission path one at a time, under the
//! scheduler lock, so the engine never knows arrays exist.

use std::fs;
use std::time::Duration;

use camino::Utf8Path;
use miette::{bail, miette, IntoDiagnostic, Result, WrapErr};

use wjm_cli::SubmitArgs;
use wjm_core::layout::StateDirs;
use wjm_core::record::{ArrayMember, JobId, JobSpec};
use wjm_core::spec::GpuSpec;
use wjm_core::Config;
use wjm_exec::{current_user, start_job};
use wjm_parsers::directive::Directives;
use wjm_parsers::{parse_array_spec, parse_script};
use wjm_sched::{
    acquire, allocate_job_id, completed_ids, enqueue, evaluate, free_gpu_ids, list_queue_entries,
    load_job, probe_gpus, running_usage, scan_jobs, AdmissionOutcome, AdmissionRequest, LockKind,
};

pub async fn run(
    config: &Config,
    dirs: &StateDirs,
    script: &Utf8Path,
    overrides: SubmitArgs,
    allow_queue: bool,
) -> Result<()> {
    let text = fs::read_to_string(script.as_std_path())
        .into_diagnostic()
        .wrap_err_with(|| format!("cannot read script {script}"))?;
    let parsed = parse_script(&text).into_diagnostic()?;

    let preset = preset_directives(config, overrides.preset.as_deref())?;
    let flags = flag_directives(&overrides);
    let merged = preset.overlay(parsed.directives).overlay(flags);

    let script_name = script.file_name().unwrap_or("job").to_string();
    let mut spec = merged.into_spec(config, script_name, parsed.body);
    spec.name = overrides.name.clone();
    spec.dependencies = overrides.depends_on.clone();
    validate_spec(&spec)?;

    for spec in expand_array(spec, overrides.array.as_deref())? {
        submit_one(config, dirs, spec, allow_queue).await?;
    }
    Ok(())
}

/// Re-enter submission with a finished job's stored body and directives.
pub async fn resubmit(
    config: &Config,
    dirs: &StateDirs,
    id: JobId,
    immediate: bool,
) -> Result<()> {
    let view = load_job(dirs, id)
        .into_diagnostic()?
        .ok_or_else(|| miette!("no job record for {id}"))?;
    if view.is_live() {
        bail!("{id} is still {}; kill it before resubmitting", view.record.status);
    }
    let record = view.record;
    let body = fs::read_to_string(dirs.command_file(id).as_std_path())
        .into_diagnostic()
        .wrap_err_with(|| format!("{id} has no stored script body"))?;

    let spec = JobSpec {
        body,
        script_name: record.script_name.clone(),
        name: record.name.clone(),
        weight: record.weight,
        gpu: record.gpu.clone(),
        cpu: record.cpu.clone(),
        memory: record.memory,
        priority: record.priority,
        timeout: record.timeout,
        dependencies: record.dependencies.clone(),
        retry_max: record.retry_max,
        retry_delay: record.retry_delay,
        retry_on: record.retry_on.clone(),
        pre_hook: record.pre_hook.clone(),
        post_hook: record.post_hook.clone(),
        on_fail: record.on_fail.clone(),
        on_success: record.on_success.clone(),
        project: record.project.clone(),
        group: record.group.clone(),
        array: record.array.clone(),
    };
    submit_one(config, dirs, spec, !immediate).await
}

/// One spec through the admission path: start now or queue.
async fn submit_one(
    config: &Config,
    dirs: &StateDirs,
    spec: JobSpec,
    allow_queue: bool,
) -> Result<()> {
    // Lock timeouts surface as their own error; no silent fallback.
    let _guard = acquire(dirs, LockKind::Scheduler).await.into_diagnostic()?;

    if config.max_total_jobs > 0 {
        let records = scan_jobs(dirs).into_diagnostic()?.len();
        let queued = list_queue_entries(dirs, false).into_diagnostic()?.len();
        if records + queued >= config.max_total_jobs as usize {
            bail!(
                "job store holds {} records (limit {}); archive or clean first",
                records + queued,
                config.max_total_jobs
            );
        }
    }
    let id = allocate_job_id(dirs).await.into_diagnostic()?;

    let views = scan_jobs(dirs).into_diagnostic()?;
    let usage = running_usage(&views);
    let completed = completed_ids(&views);
    let gpus = probe_gpus().await;
    let free = free_gpu_ids(&gpus, &usage.gpus);
    let request = AdmissionRequest {
        weight: spec.weight,
        gpu: &spec.gpu,
        dependencies: &spec.dependencies,
    };

    match evaluate(config, &usage, &free, &completed, &request) {
        AdmissionOutcome::Start { gpu_ids } => {
            let pid = start_job(dirs, &spec, id, gpu_ids, &current_user()).into_diagnostic()?;
            println!("{id} started (pid {pid})");
        }
        AdmissionOutcome::Defer { reason } => {
            if !allow_queue {
                let _ = fs::remove_dir_all(dirs.record_dir(id).as_std_path());
                bail!("admission refused for {id}: {reason}");
            }
            // Queue entry first, then the placeholder record dir, so the
            // id is always visible to at least one allocator view.
            enqueue(dirs, &spec, id, &reason).into_diagnostic()?;
            fs::remove_dir_all(dirs.record_dir(id).as_std_path()).into_diagnostic()?;
            println!("{id} queued: {reason}");
        }
    }
    Ok(())
}

/// Preset directives sit below script directives in precedence.
fn preset_directives(config: &Config, name: Option<&str>) -> Result<Directives> {
    let Some(name) = name else {
        return Ok(Directives::default());
    };
    let preset = config
        .presets
        .get(name)
        .ok_or_else(|| miette!("unknown preset '{name}'"))?;
    let gpu = match (&preset.devices, &preset.gpu) {
        (Some(devices), _) => Some(GpuSpec::Ids(devices.clone())),
        (None, gpu) => gpu.clone(),
    };
    Ok(Directives {
        weight: preset.weight,
        priority: preset.priority,
        gpu,
        ..Directives::default()
    })
}

fn flag_directives(overrides: &SubmitArgs) -> Directives {
    Directives {
        weight: overrides.weight,
        gpu: overrides.gpu.clone(),
        priority: overrides.priority,
        timeout: overrides.timeout,
        retry_max: overrides.retry,
        retry_delay: overrides.retry_delay.map(Duration::from_secs),
        retry_on: overrides.retry_on.clone(),
        cpu: overrides.cpu.clone(),
        memory: overrides.memory,
        project: overrides.project.clone(),
        group: overrides.group.clone(),
        ..Directives::default()
    }
}

/// Flags bypass the directive parser, so bounds are re-checked on the
/// merged spec.
fn validate_spec(spec: &JobSpec) -> Result<()> {
    if spec.weight == 0 || spec.weight > 1000 {
        bail!("weight {} out of range 1..=1000", spec.weight);
    }
    if spec.retry_max > 10 {
        bail!("retry {} out of range 0..=10", spec.retry_max);
    }
    for (field, value) in [
        ("name", &spec.name),
        ("project", &spec.project),
        ("group", &spec.group),
    ] {
        if let Some(value) = value {
            if value.is_empty() || value.len() > 50 {
                bail!("{field} must be 1..=50 characters");
            }
            if value.chars().any(|c| c == '/' || c == '=' || c.is_control()) {
                bail!("{field} must not contain '/', '=', or control characters");
            }
        }
    }
    Ok(())
}

/// Array expansion: one spec per element, each tagged with its identity.
fn expand_array(spec: JobSpec, array: Option<&str>) -> Result<Vec<JobSpec>> {
    let Some(array) = array else {
        return Ok(vec![spec]);
    };
    let indices = parse_array_spec(array).into_diagnostic()?;
    let base = spec
        .name
        .clone()
        .unwrap_or_else(|| spec.script_name.trim_end_matches(".sh").to_string());
    let size = indices.len() as u32;

    Ok(indices
        .into_iter()
        .map(|index| {
            let mut element = spec.clone();
            element.name = Some(format!("{base}[{index}]"));
            element.array = Some(ArrayMember {
                index,
                array_id: base.clone(),
                size,
            });
            element
        })
        .collect())
}

/// Queued ids owned by anyone, for `kill all`.
pub fn queued_ids(dirs: &StateDirs) -> Result<Vec<JobId>> {
    Ok(list_queue_entries(dirs, false)
        .into_diagnostic()?
        .into_iter()
        .map(|e| e.id)
        .collect())
}
