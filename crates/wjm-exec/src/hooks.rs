//! Job hook execution.
//!
//! Hooks are shell fragments run with the job's environment plus
//! `WJM_HOOK_TYPE`. The pre-hook is fatal on nonzero exit; post, fail,
//! and success hooks are best-effort and only warn.

use std::collections::HashMap;
use std::process::Stdio;

use tokio::process::Command;

use wjm_core::record::JobRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Pre,
    Post,
    OnFail,
    OnSuccess,
}

impl HookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::Pre => "pre",
            HookKind::Post => "post",
            HookKind::OnFail => "on_fail",
            HookKind::OnSuccess => "on_success",
        }
    }

    fn fragment<'a>(&self, record: &'a JobRecord) -> Option<&'a str> {
        match self {
            HookKind::Pre => record.pre_hook.as_deref(),
            HookKind::Post => record.post_hook.as_deref(),
            HookKind::OnFail => record.on_fail.as_deref(),
            HookKind::OnSuccess => record.on_success.as_deref(),
        }
    }
}

/// Run a hook if the record defines it; returns its exit code.
///
/// Output goes to the supervisor's stdio, which is the job log.
pub async fn run_hook(
    record: &JobRecord,
    kind: HookKind,
    env: &HashMap<String, String>,
) -> Option<i32> {
    let fragment = kind.fragment(record)?;

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(fragment)
        .envs(env)
        .env("WJM_HOOK_TYPE", kind.as_str())
        .stdin(Stdio::null());

    let status = match cmd.status().await {
        Ok(status) => status,
        Err(e) => {
            tracing::warn!(job = %record.job_id, hook = kind.as_str(), error = %e, "hook failed to spawn");
            return Some(127);
        }
    };
    let code = status.code().unwrap_or(1);
    if code != 0 && kind != HookKind::Pre {
        tracing::warn!(job = %record.job_id, hook = kind.as_str(), code, "hook exited nonzero");
    }
    Some(code)
}
