//! The per-job supervisor.
//!
//! Runs as a detached process owning exactly one job: it applies limits,
//! executes hooks and the body, drives the retry and timeout machinery,
//! records the terminal state, and finally drains the queue into the
//! freed capacity. Pause and kill act on the whole process group, so the
//! supervisor's own sleeps and waits stop and die together with the body.

use std::collections::HashMap;
use std::fs;
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use tokio::process::Command;
use tokio::time::{sleep, timeout};

use wjm_core::codec::{read_record, write_record};
use wjm_core::layout::{atomic_write, StateDirs};
use wjm_core::record::{FailReason, JobId, JobRecord, JobStatus};
use wjm_core::spec::GpuSpec;
use wjm_core::Config;
use wjm_sched::probe::total_memory_bytes;
use wjm_sched::unregister_pid;

use crate::drain::drain_queue;
use crate::error::ExecError;
use crate::hooks::{run_hook, HookKind};

/// Grace between SIGTERM and SIGKILL on timeout.
const KILL_GRACE: Duration = Duration::from_secs(10);

/// Conventional exit codes for a timed-out body: 124 when SIGTERM was
/// enough, 137 when SIGKILL had to finish the job.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
pub const KILLED_EXIT_CODE: i32 = 137;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BodyOutcome {
    exit_code: i32,
    timed_out: bool,
}

/// Supervise one job to its terminal state. Returns the exit code the
/// supervisor process should itself exit with.
pub async fn run_supervisor(
    config: &Config,
    dirs: &StateDirs,
    id: JobId,
) -> Result<i32, ExecError> {
    let info_path = dirs.job_info(id);
    let mut record = read_record(&info_path)?;

    let pid = std::process::id();
    record.pid = Some(pid);
    record.status = JobStatus::Running;
    record.start_time = Some(Utc::now());
    write_record(&info_path, &record)?;
    atomic_write(&dirs.pid_file(id), &pid.to_string())?;

    let env = job_env(&record, dirs);

    if let Some(code) = run_hook(&record, HookKind::Pre, &env).await {
        if code != 0 {
            tracing::error!(job = %id, code, "pre-hook failed; body skipped");
            record.fail_reason = Some(FailReason::PreHookFailed);
            return finalize(config, dirs, record, code, false, true).await;
        }
    }

    let outcome = loop {
        let outcome = execute_body(&record, dirs, &env).await?;
        if outcome.exit_code != 0
            && record.retry_count < u32::from(record.retry_max)
            && record.retry_on.matches(outcome.exit_code)
        {
            record.retry_count += 1;
            write_record(&info_path, &record)?;
            tracing::info!(
                job = %id,
                code = outcome.exit_code,
                attempt = record.retry_count,
                "retrying after delay"
            );
            sleep(record.retry_delay).await;
            continue;
        }
        break outcome;
    };

    finalize(config, dirs, record, outcome.exit_code, outcome.timed_out, false).await
}

/// Environment injected into the body and every hook.
fn job_env(record: &JobRecord, dirs: &StateDirs) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("WJM_JOB_ID".to_string(), record.job_id.to_string());
    env.insert(
        "WJM_JOB_DIR".to_string(),
        dirs.record_dir(record.job_id).to_string(),
    );
    if let GpuSpec::Ids(ids) = &record.gpu {
        env.insert(
            "CUDA_VISIBLE_DEVICES".to_string(),
            ids.iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(","),
        );
    }
    if let Some(array) = &record.array {
        env.insert("WJM_ARRAY_INDEX".to_string(), array.index.to_string());
        env.insert("WJM_ARRAY_ID".to_string(), array.array_id.clone());
        env.insert("WJM_ARRAY_SIZE".to_string(), array.size.to_string());
    }
    env
}

/// The argv that runs the body: affinity wrapper first, then either the
/// script itself (shebang) or sh.
fn body_argv(record: &JobRecord, script_path: &str, direct_exec: bool) -> Vec<String> {
    let mut argv = Vec::new();
    if let Some(ids) = record.cpu.cpu_ids() {
        argv.push("taskset".to_string());
        argv.push("-c".to_string());
        argv.push(
            ids.iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(","),
        );
    }
    if direct_exec {
        argv.push(script_path.to_string());
    } else {
        argv.push("sh".to_string());
        argv.push(script_path.to_string());
    }
    argv
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(1))
}

/// One body execution, with limits and timeout applied.
async fn execute_body(
    record: &JobRecord,
    dirs: &StateDirs,
    env: &HashMap<String, String>,
) -> Result<BodyOutcome, ExecError> {
    let script_path = dirs.command_file(record.job_id);
    let direct_exec = fs::read_to_string(script_path.as_std_path())
        .map(|body| body.starts_with("#!"))
        .unwrap_or(false);
    let argv = body_argv(record, script_path.as_str(), direct_exec);

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]).envs(env).stdin(Stdio::null());

    if let Some(bytes) = record.memory.resolve_bytes(total_memory_bytes()) {
        unsafe {
            cmd.pre_exec(move || {
                nix::sys::resource::setrlimit(
                    nix::sys::resource::Resource::RLIMIT_AS,
                    bytes,
                    bytes,
                )
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
            });
        }
    }

    let mut child = cmd.spawn()?;

    let Some(limit) = record.timeout else {
        let status = child.wait().await?;
        return Ok(BodyOutcome {
            exit_code: exit_code_of(status),
            timed_out: false,
        });
    };

    match timeout(limit, child.wait()).await {
        Ok(status) => Ok(BodyOutcome {
            exit_code: exit_code_of(status?),
            timed_out: false,
        }),
        Err(_) => {
            tracing::warn!(job = %record.job_id, "timeout reached; sending SIGTERM");
            signal_child(&child, nix::sys::signal::Signal::SIGTERM);
            match timeout(KILL_GRACE, child.wait()).await {
                Ok(status) => {
                    status?;
                    Ok(BodyOutcome {
                        exit_code: TIMEOUT_EXIT_CODE,
                        timed_out: true,
                    })
                }
                Err(_) => {
                    tracing::warn!(job = %record.job_id, "grace expired; sending SIGKILL");
                    signal_child(&child, nix::sys::signal::Signal::SIGKILL);
                    child.wait().await?;
                    Ok(BodyOutcome {
                        exit_code: KILLED_EXIT_CODE,
                        timed_out: true,
                    })
                }
            }
        }
    }
}

fn signal_child(child: &tokio::process::Child, signal: nix::sys::signal::Signal) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), signal);
    }
}

/// Persist the terminal state, run the closing hooks, free the pid file,
/// and drain the queue into the freed capacity.
async fn finalize(
    config: &Config,
    dirs: &StateDirs,
    mut record: JobRecord,
    exit_code: i32,
    timed_out: bool,
    pre_hook_failed: bool,
) -> Result<i32, ExecError> {
    let id = record.job_id;
    record.end_time = Some(Utc::now());
    record.exit_code = Some(exit_code);
    record.pid = None;
    record.status = if !pre_hook_failed && exit_code == 0 {
        JobStatus::Completed
    } else {
        JobStatus::Failed
    };
    if !pre_hook_failed
        && record.status == JobStatus::Failed
        && (timed_out || exit_code == TIMEOUT_EXIT_CODE || exit_code == KILLED_EXIT_CODE)
    {
        record.fail_reason = Some(FailReason::Timeout);
    }

    write_record(&dirs.job_info(id), &record)?;
    atomic_write(&dirs.exit_code_file(id), &exit_code.to_string())?;

    let env = job_env(&record, dirs);
    match record.status {
        JobStatus::Completed => {
            let _ = run_hook(&record, HookKind::OnSuccess, &env).await;
        }
        // A pre-hook failure never ran the body, so only the post-hook
        // applies.
        JobStatus::Failed if !pre_hook_failed => {
            let _ = run_hook(&record, HookKind::OnFail, &env).await;
        }
        _ => {}
    }
    let _ = run_hook(&record, HookKind::Post, &env).await;

    if let Err(e) = fs::remove_file(dirs.pid_file(id).as_std_path()) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(job = %id, error = %e, "failed to remove pid file");
        }
    }
    if let Err(e) = unregister_pid(dirs, std::process::id()) {
        tracing::warn!(job = %id, error = %e, "failed to unregister pid");
    }
    tracing::info!(job = %id, status = %record.status, exit_code, "job finished");

    if let Err(e) = drain_queue(config, dirs).await {
        tracing::warn!(error = %e, "post-completion drain failed");
    }
    Ok(exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8Path;
    use tempfile::TempDir;
    use wjm_core::record::JobSpec;
    use wjm_core::spec::{CpuSpec, MemorySpec, RetryOn};
    use wjm_core::{Config, Priority};

    fn setup(temp: &TempDir) -> (Config, StateDirs) {
        let root = Utf8Path::from_path(temp.path()).unwrap();
        let config = Config::with_root(root.to_path_buf());
        let dirs = StateDirs::from_config(&config);
        dirs.ensure().unwrap();
        (config, dirs)
    }

    fn spec(body: &str) -> JobSpec {
        JobSpec {
            body: body.to_string(),
            script_name: "job.sh".to_string(),
            name: None,
            weight: 1,
            gpu: GpuSpec::None,
            cpu: CpuSpec::None,
            memory: MemorySpec::None,
            priority: Priority::Normal,
            timeout: None,
            dependencies: Vec::new(),
            retry_max: 0,
            retry_delay: Duration::from_secs(0),
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

    fn seed_job(dirs: &StateDirs, id: JobId, spec: &JobSpec) -> JobRecord {
        let record = JobRecord::from_spec(spec, id, "tester");
        fs::create_dir_all(dirs.record_dir(id)).unwrap();
        atomic_write(&dirs.command_file(id), &spec.body).unwrap();
        write_record(&dirs.job_info(id), &record).unwrap();
        record
    }

    #[test]
    fn test_body_argv_shapes() {
        let mut record = JobRecord::from_spec(&spec("echo hi\n"), JobId::new(1).unwrap(), "t");
        assert_eq!(
            body_argv(&record, "/j/command.run", false),
            vec!["sh", "/j/command.run"]
        );
        assert_eq!(
            body_argv(&record, "/j/command.run", true),
            vec!["/j/command.run"]
        );

        record.cpu = "0,2".parse().unwrap();
        assert_eq!(
            body_argv(&record, "/j/command.run", false),
            vec!["taskset", "-c", "0,2", "sh", "/j/command.run"]
        );

        record.cpu = "3".parse().unwrap();
        assert_eq!(
            body_argv(&record, "/j/command.run", true),
            vec!["taskset", "-c", "0,1,2", "/j/command.run"]
        );
    }

    #[test]
    fn test_job_env_contents() {
        let temp = TempDir::new().unwrap();
        let (_, dirs) = setup(&temp);
        let id = JobId::new(3).unwrap();
        let mut record = JobRecord::from_spec(&spec("true\n"), id, "t");
        record.gpu = GpuSpec::Ids(vec![0, 2]);
        record.array = Some(wjm_core::record::ArrayMember {
            index: 4,
            array_id: "sweep".to_string(),
            size: 8,
        });

        let env = job_env(&record, &dirs);
        assert_eq!(env["WJM_JOB_ID"], "job_003");
        assert_eq!(env["CUDA_VISIBLE_DEVICES"], "0,2");
        assert_eq!(env["WJM_ARRAY_INDEX"], "4");
        assert_eq!(env["WJM_ARRAY_ID"], "sweep");
        assert_eq!(env["WJM_ARRAY_SIZE"], "8");
        assert!(env["WJM_JOB_DIR"].ends_with("job_003"));
    }

    #[tokio::test]
    async fn test_supervise_success() {
        let temp = TempDir::new().unwrap();
        let (config, dirs) = setup(&temp);
        let id = JobId::new(1).unwrap();
        seed_job(&dirs, id, &spec("exit 0\n"));

        let code = run_supervisor(&config, &dirs, id).await.unwrap();
        assert_eq!(code, 0);

        let record = read_record(&dirs.job_info(id)).unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.exit_code, Some(0));
        assert!(record.end_time.is_some());
        assert!(!dirs.pid_file(id).exists());
        assert_eq!(
            fs::read_to_string(dirs.exit_code_file(id)).unwrap(),
            "0"
        );
    }

    #[tokio::test]
    async fn test_retry_on_matching_exit() {
        let temp = TempDir::new().unwrap();
        let (config, dirs) = setup(&temp);
        let id = JobId::new(1).unwrap();

        // Counts attempts, always exits 2.
        let marker = dirs.job_dir.join("attempts");
        let body = format!("echo x >> {marker}\nexit 2\n");
        let mut job = spec(&body);
        job.retry_max = 3;
        job.retry_on = RetryOn::Codes(vec![2]);
        seed_job(&dirs, id, &job);

        let code = run_supervisor(&config, &dirs, id).await.unwrap();
        assert_eq!(code, 2);

        let record = read_record(&dirs.job_info(id)).unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.retry_count, 3);
        let attempts = fs::read_to_string(marker.as_std_path()).unwrap();
        assert_eq!(attempts.lines().count(), 4);
    }

    #[tokio::test]
    async fn test_no_retry_on_other_exit() {
        let temp = TempDir::new().unwrap();
        let (config, dirs) = setup(&temp);
        let id = JobId::new(1).unwrap();

        let mut job = spec("exit 2\n");
        job.retry_max = 3;
        job.retry_on = RetryOn::Codes(vec![5]);
        seed_job(&dirs, id, &job);

        run_supervisor(&config, &dirs, id).await.unwrap();
        let record = read_record(&dirs.job_info(id)).unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.retry_count, 0);
    }

    #[tokio::test]
    async fn test_pre_hook_failure_skips_body() {
        let temp = TempDir::new().unwrap();
        let (config, dirs) = setup(&temp);
        let id = JobId::new(1).unwrap();

        let marker = dirs.job_dir.join("ran");
        let mut job = spec(&format!("touch {marker}\n"));
        job.pre_hook = Some("exit 1".to_string());
        seed_job(&dirs, id, &job);

        run_supervisor(&config, &dirs, id).await.unwrap();
        let record = read_record(&dirs.job_info(id)).unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.fail_reason, Some(FailReason::PreHookFailed));
        assert!(!marker.exists(), "body must not run after pre-hook failure");
    }

    #[tokio::test]
    async fn test_timeout_marks_fail_reason() {
        let temp = TempDir::new().unwrap();
        let (config, dirs) = setup(&temp);
        let id = JobId::new(1).unwrap();

        let mut job = spec("sleep 30\n");
        job.timeout = Some(Duration::from_secs(1));
        seed_job(&dirs, id, &job);

        let code = run_supervisor(&config, &dirs, id).await.unwrap();
        assert_eq!(code, TIMEOUT_EXIT_CODE);

        let record = read_record(&dirs.job_info(id)).unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.fail_reason, Some(FailReason::Timeout));
    }

    #[tokio::test]
    async fn test_success_and_post_hooks_run() {
        let temp = TempDir::new().unwrap();
        let (config, dirs) = setup(&temp);
        let id = JobId::new(1).unwrap();

        let ok = dirs.job_dir.join("ok");
        let post = dirs.job_dir.join("post");
        let mut job = spec("exit 0\n");
        job.on_success = Some(format!("touch {ok}"));
        job.post_hook = Some(format!("touch {post}"));
        seed_job(&dirs, id, &job);

        run_supervisor(&config, &dirs, id).await.unwrap();
        assert!(ok.exists());
        assert!(post.exists());
    }
}
