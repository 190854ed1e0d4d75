//! Job identity, status lifecycle, and the durable job record.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::spec::{CpuSpec, GpuSpec, MemorySpec, RetryOn};

/// Highest allocatable job index; callers must archive before exhaustion.
pub const MAX_JOB_INDEX: u16 = 999;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid job id '{0}': expected job_NNN with NNN in 1..=999")]
pub struct InvalidJobId(pub String);

/// A `job_NNN` identifier, N in 1..=999.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(u16);

impl JobId {
    pub fn new(index: u16) -> Result<Self, InvalidJobId> {
        if index == 0 || index > MAX_JOB_INDEX {
            return Err(InvalidJobId(index.to_string()));
        }
        Ok(JobId(index))
    }

    pub fn index(&self) -> u16 {
        self.0
    }

    /// Directory / file-stem form: `job_007`.
    pub fn dir_name(&self) -> String {
        format!("job_{:03}", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job_{:03}", self.0)
    }
}

impl FromStr for JobId {
    type Err = InvalidJobId;

    /// Accepts `job_007`, `job_7`, or a bare index `7`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("job_").unwrap_or(s);
        let index: u16 = digits
            .parse()
            .map_err(|_| InvalidJobId(s.to_string()))?;
        JobId::new(index).map_err(|_| InvalidJobId(s.to_string()))
    }
}

impl TryFrom<String> for JobId {
    type Error = InvalidJobId;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> String {
        id.to_string()
    }
}

/// Job lifecycle state.
///
/// QUEUED -> RUNNING <-> PAUSED -> COMPLETED | FAILED | KILLED.
/// RUNNING re-enters RUNNING through the retry loop with `retry_count`
/// incremented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Killed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Killed
        )
    }

    /// States that are expected to have a live pid file.
    pub fn is_live(&self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Paused)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Paused => "PAUSED",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Killed => "KILLED",
        };
        write!(f, "{s}")
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(JobStatus::Queued),
            "RUNNING" => Ok(JobStatus::Running),
            "PAUSED" => Ok(JobStatus::Paused),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            "KILLED" => Ok(JobStatus::Killed),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

/// Scheduling rank among queued jobs; higher drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// Numeric rank stored in the priority sidecar.
    pub fn value(&self) -> u32 {
        match self {
            Priority::Urgent => 40,
            Priority::High => 30,
            Priority::Normal => 20,
            Priority::Low => 10,
        }
    }

    pub fn from_value(value: u32) -> Option<Self> {
        match value {
            40 => Some(Priority::Urgent),
            30 => Some(Priority::High),
            20 => Some(Priority::Normal),
            10 => Some(Priority::Low),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Urgent => "urgent",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        };
        write!(f, "{s}")
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown priority '{0}': expected urgent, high, normal, or low")]
pub struct InvalidPriority(pub String);

impl FromStr for Priority {
    type Err = InvalidPriority;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "urgent" => Ok(Priority::Urgent),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(InvalidPriority(other.to_string())),
        }
    }
}

/// Why a job ended FAILED.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailReason {
    PreHookFailed,
    Timeout,
    SpawnFailed,
    Other(String),
}

impl FailReason {
    pub fn as_str(&self) -> &str {
        match self {
            FailReason::PreHookFailed => "pre_hook_failed",
            FailReason::Timeout => "timeout",
            FailReason::SpawnFailed => "spawn_failed",
            FailReason::Other(s) => s,
        }
    }
}

impl FromStr for FailReason {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pre_hook_failed" => FailReason::PreHookFailed,
            "timeout" => FailReason::Timeout,
            "spawn_failed" => FailReason::SpawnFailed,
            other => FailReason::Other(other.to_string()),
        })
    }
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Array-element identity for jobs expanded from `--array`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayMember {
    /// Element index within the array spec.
    pub index: u32,
    /// Shared identifier for the whole array (the base name).
    pub array_id: String,
    /// Number of elements the array expanded to.
    pub size: u32,
}

/// Everything known about a job before an id is allocated.
///
/// Submission front-ends (plain scripts, arrays) produce these; each one
/// then passes through the normal admission path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    /// Metadata-stripped script body.
    pub body: String,
    /// Original file basename.
    pub script_name: String,
    pub name: Option<String>,
    pub weight: u32,
    pub gpu: GpuSpec,
    pub cpu: CpuSpec,
    pub memory: MemorySpec,
    pub priority: Priority,
    pub timeout: Option<Duration>,
    pub dependencies: Vec<JobId>,
    pub retry_max: u8,
    pub retry_delay: Duration,
    pub retry_on: RetryOn,
    pub pre_hook: Option<String>,
    pub post_hook: Option<String>,
    pub on_fail: Option<String>,
    pub on_success: Option<String>,
    pub project: Option<String>,
    pub group: Option<String>,
    pub array: Option<ArrayMember>,
}

/// The durable per-job record behind `job.info`.
///
/// Exclusively owned by the supervising process until a terminal state is
/// written; read-only to every observer afterwards. Unknown keys read from
/// disk are preserved in `extras` so newer writers never lose fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub name: Option<String>,
    pub user: String,
    pub script_name: String,

    pub weight: u32,
    pub gpu: GpuSpec,
    pub cpu: CpuSpec,
    pub memory: MemorySpec,

    pub priority: Priority,
    /// Wall-clock limit for the body; None = unlimited.
    pub timeout: Option<Duration>,
    pub dependencies: Vec<JobId>,

    pub retry_max: u8,
    pub retry_delay: Duration,
    pub retry_on: RetryOn,
    pub retry_count: u32,

    pub pre_hook: Option<String>,
    pub post_hook: Option<String>,
    pub on_fail: Option<String>,
    pub on_success: Option<String>,

    pub project: Option<String>,
    pub group: Option<String>,

    pub submit_time: DateTime<Utc>,
    pub queue_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,

    /// Supervisor pid; present iff the job is live.
    pub pid: Option<u32>,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub fail_reason: Option<FailReason>,

    pub array: Option<ArrayMember>,

    /// Unknown KEY=VALUE pairs preserved across rewrites.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extras: Vec<(String, String)>,
}

impl JobRecord {
    /// Build the initial record for a spec that was admitted to run.
    pub fn from_spec(spec: &JobSpec, job_id: JobId, user: &str) -> Self {
        JobRecord {
            job_id,
            name: spec.name.clone(),
            user: user.to_string(),
            script_name: spec.script_name.clone(),
            weight: spec.weight,
            gpu: spec.gpu.clone(),
            cpu: spec.cpu.clone(),
            memory: spec.memory,
            priority: spec.priority,
            timeout: spec.timeout,
            dependencies: spec.dependencies.clone(),
            retry_max: spec.retry_max,
            retry_delay: spec.retry_delay,
            retry_on: spec.retry_on.clone(),
            retry_count: 0,
            pre_hook: spec.pre_hook.clone(),
            post_hook: spec.post_hook.clone(),
            on_fail: spec.on_fail.clone(),
            on_success: spec.on_success.clone(),
            project: spec.project.clone(),
            group: spec.group.clone(),
            submit_time: Utc::now(),
            queue_time: None,
            start_time: None,
            end_time: None,
            pid: None,
            status: JobStatus::Running,
            exit_code: None,
            fail_reason: None,
            array: spec.array.clone(),
            extras: Vec::new(),
        }
    }

    /// Display name: friendly name if set, else the script basename.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.script_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_parse_forms() {
        assert_eq!("job_007".parse::<JobId>().unwrap().index(), 7);
        assert_eq!("job_42".parse::<JobId>().unwrap().index(), 42);
        assert_eq!("42".parse::<JobId>().unwrap().index(), 42);
        assert!("job_000".parse::<JobId>().is_err());
        assert!("job_1000".parse::<JobId>().is_err());
        assert!("../etc".parse::<JobId>().is_err());
        assert!("job_00x".parse::<JobId>().is_err());
    }

    #[test]
    fn test_job_id_display() {
        assert_eq!(JobId::new(7).unwrap().to_string(), "job_007");
        assert_eq!(JobId::new(999).unwrap().dir_name(), "job_999");
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::from_value(30), Some(Priority::High));
        assert_eq!(Priority::from_value(15), None);
    }

    #[test]
    fn test_status_lifecycle_flags() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Killed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Paused.is_live());
        assert!(!JobStatus::Queued.is_live());
    }

    #[test]
    fn test_fail_reason_round_trip() {
        for s in ["pre_hook_failed", "timeout", "spawn_failed", "oom"] {
            let reason: FailReason = s.parse().unwrap();
            assert_eq!(reason.as_str(), s);
        }
    }
}
