//! KEY=VALUE record codec for `job.info`.
//!
//! One field per line, no quoting. Every reader and writer goes through
//! this codec; ad-hoc field access does not exist. Unknown keys are
//! tolerated on read and preserved on write so older binaries never strip
//! fields written by newer ones.

use std::fmt::Write as _;
use std::fs;
use std::str::FromStr;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::layout::atomic_write;
use crate::record::{ArrayMember, FailReason, JobId, JobRecord, JobStatus, Priority};
use crate::spec::{CpuSpec, GpuSpec, MemorySpec, RetryOn, NOT_APPLICABLE};

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("failed to read record {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
    #[error("record line {line} is not KEY=VALUE: '{text}'")]
    Malformed { line: usize, text: String },
    #[error("record is missing required field {field}")]
    MissingField { field: &'static str },
    #[error("invalid value for {field}: '{value}' ({reason})")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },
}

fn invalid(field: &'static str, value: &str, reason: impl ToString) -> RecordError {
    RecordError::InvalidField {
        field,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn opt(value: &str) -> Option<&str> {
    (!value.is_empty() && value != NOT_APPLICABLE).then_some(value)
}

fn parse_time(field: &'static str, value: &str) -> Result<Option<DateTime<Utc>>, RecordError> {
    match opt(value) {
        None => Ok(None),
        Some(v) => DateTime::parse_from_rfc3339(v)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| invalid(field, value, e)),
    }
}

fn time_field(time: &Option<DateTime<Utc>>) -> String {
    match time {
        Some(t) => t.to_rfc3339(),
        None => NOT_APPLICABLE.to_string(),
    }
}

/// Serialize a record to its KEY=VALUE text form.
pub fn serialize_record(record: &JobRecord) -> String {
    let mut out = String::new();
    let mut field = |key: &str, value: String| {
        let _ = writeln!(out, "{key}={value}");
    };
    let opt_str = |value: &Option<String>| {
        value.clone().unwrap_or_else(|| NOT_APPLICABLE.to_string())
    };

    field("JOB_ID", record.job_id.to_string());
    field("NAME", opt_str(&record.name));
    field("USER", record.user.clone());
    field("SCRIPT", record.script_name.clone());
    field("STATUS", record.status.to_string());
    field("WEIGHT", record.weight.to_string());
    field("GPU", record.gpu.to_field());
    field("CPU", record.cpu.to_field());
    field("MEMORY", record.memory.to_field());
    field("PRIORITY", record.priority.to_string());
    field(
        "TIMEOUT",
        record
            .timeout
            .map(|t| t.as_secs().to_string())
            .unwrap_or_else(|| NOT_APPLICABLE.to_string()),
    );
    field(
        "DEPENDENCIES",
        if record.dependencies.is_empty() {
            NOT_APPLICABLE.to_string()
        } else {
            record
                .dependencies
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(",")
        },
    );
    field("RETRY_MAX", record.retry_max.to_string());
    field("RETRY_DELAY", record.retry_delay.as_secs().to_string());
    field("RETRY_ON", record.retry_on.to_field());
    field("RETRY_COUNT", record.retry_count.to_string());
    field("PRE_HOOK", opt_str(&record.pre_hook));
    field("POST_HOOK", opt_str(&record.post_hook));
    field("ON_FAIL", opt_str(&record.on_fail));
    field("ON_SUCCESS", opt_str(&record.on_success));
    field("PROJECT", opt_str(&record.project));
    field("GROUP", opt_str(&record.group));
    field("SUBMIT_TIME", record.submit_time.to_rfc3339());
    field("QUEUE_TIME", time_field(&record.queue_time));
    field("START_TIME", time_field(&record.start_time));
    field("END_TIME", time_field(&record.end_time));
    field(
        "PID",
        record
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| NOT_APPLICABLE.to_string()),
    );
    field(
        "EXIT_CODE",
        record
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| NOT_APPLICABLE.to_string()),
    );
    field(
        "FAIL_REASON",
        record
            .fail_reason
            .as_ref()
            .map(|r| r.to_string())
            .unwrap_or_else(|| NOT_APPLICABLE.to_string()),
    );
    if let Some(array) = &record.array {
        field("ARRAY_INDEX", array.index.to_string());
        field("ARRAY_ID", array.array_id.clone());
        field("ARRAY_SIZE", array.size.to_string());
    }
    for (key, value) in &record.extras {
        field(key, value.clone());
    }
    out
}

/// Parse the KEY=VALUE text form back into a record.
pub fn parse_record(text: &str) -> Result<JobRecord, RecordError> {
    let mut job_id: Option<JobId> = None;
    let mut status: Option<JobStatus> = None;
    let mut user: Option<String> = None;
    let mut name = None;
    let mut script_name = String::new();
    let mut weight = 1u32;
    let mut gpu = GpuSpec::None;
    let mut cpu = CpuSpec::None;
    let mut memory = MemorySpec::None;
    let mut priority = Priority::Normal;
    let mut timeout = None;
    let mut dependencies = Vec::new();
    let mut retry_max = 0u8;
    let mut retry_delay = Duration::from_secs(60);
    let mut retry_on = RetryOn::AnyNonzero;
    let mut retry_count = 0u32;
    let mut pre_hook = None;
    let mut post_hook = None;
    let mut on_fail = None;
    let mut on_success = None;
    let mut project = None;
    let mut group = None;
    let mut submit_time = None;
    let mut queue_time = None;
    let mut start_time = None;
    let mut end_time = None;
    let mut pid = None;
    let mut exit_code = None;
    let mut fail_reason = None;
    let mut array_index = None;
    let mut array_id = None;
    let mut array_size = None;
    let mut extras = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim_end();
        if line.is_empty() {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or(RecordError::Malformed {
            line: idx + 1,
            text: line.to_string(),
        })?;
        match key {
            "JOB_ID" => {
                job_id = Some(value.parse().map_err(|e| invalid("JOB_ID", value, e))?);
            }
            "NAME" => name = opt(value).map(str::to_string),
            "USER" => user = Some(value.to_string()),
            "SCRIPT" => script_name = value.to_string(),
            "STATUS" => {
                status = Some(value.parse().map_err(|e| invalid("STATUS", value, e))?);
            }
            "WEIGHT" => weight = value.parse().map_err(|e| invalid("WEIGHT", value, e))?,
            "GPU" => gpu = value.parse().map_err(|e| invalid("GPU", value, e))?,
            "CPU" => cpu = value.parse().map_err(|e| invalid("CPU", value, e))?,
            "MEMORY" => memory = value.parse().map_err(|e| invalid("MEMORY", value, e))?,
            "PRIORITY" => {
                priority = value.parse().map_err(|e| invalid("PRIORITY", value, e))?;
            }
            "TIMEOUT" => {
                timeout = opt(value)
                    .map(|v| {
                        v.parse::<u64>()
                            .map(Duration::from_secs)
                            .map_err(|e| invalid("TIMEOUT", value, e))
                    })
                    .transpose()?;
            }
            "DEPENDENCIES" => {
                if let Some(v) = opt(value) {
                    dependencies = v
                        .split(',')
                        .map(|d| d.trim().parse::<JobId>())
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(|e| invalid("DEPENDENCIES", value, e))?;
                }
            }
            "RETRY_MAX" => {
                retry_max = value.parse().map_err(|e| invalid("RETRY_MAX", value, e))?;
            }
            "RETRY_DELAY" => {
                retry_delay = Duration::from_secs(
                    value
                        .parse()
                        .map_err(|e| invalid("RETRY_DELAY", value, e))?,
                );
            }
            "RETRY_ON" => retry_on = value.parse().map_err(|e| invalid("RETRY_ON", value, e))?,
            "RETRY_COUNT" => {
                retry_count = value
                    .parse()
                    .map_err(|e| invalid("RETRY_COUNT", value, e))?;
            }
            "PRE_HOOK" => pre_hook = opt(value).map(str::to_string),
            "POST_HOOK" => post_hook = opt(value).map(str::to_string),
            "ON_FAIL" => on_fail = opt(value).map(str::to_string),
            "ON_SUCCESS" => on_success = opt(value).map(str::to_string),
            "PROJECT" => project = opt(value).map(str::to_string),
            "GROUP" => group = opt(value).map(str::to_string),
            "SUBMIT_TIME" => {
                submit_time = parse_time("SUBMIT_TIME", value)?;
            }
            "QUEUE_TIME" => queue_time = parse_time("QUEUE_TIME", value)?,
            "START_TIME" => start_time = parse_time("START_TIME", value)?,
            "END_TIME" => end_time = parse_time("END_TIME", value)?,
            "PID" => {
                pid = opt(value)
                    .map(|v| v.parse::<u32>().map_err(|e| invalid("PID", value, e)))
                    .transpose()?;
            }
            "EXIT_CODE" => {
                exit_code = opt(value)
                    .map(|v| v.parse::<i32>().map_err(|e| invalid("EXIT_CODE", value, e)))
                    .transpose()?;
            }
            "FAIL_REASON" => {
                fail_reason = opt(value).map(|v| FailReason::from_str(v).unwrap());
            }
            "ARRAY_INDEX" => {
                array_index = Some(
                    value
                        .parse::<u32>()
                        .map_err(|e| invalid("ARRAY_INDEX", value, e))?,
                );
            }
            "ARRAY_ID" => array_id = Some(value.to_string()),
            "ARRAY_SIZE" => {
                array_size = Some(
                    value
                        .parse::<u32>()
                        .map_err(|e| invalid("ARRAY_SIZE", value, e))?,
                );
            }
            _ => extras.push((key.to_string(), value.to_string())),
        }
    }

    let array = match (array_index, array_id, array_size) {
        (Some(index), Some(array_id), Some(size)) => Some(ArrayMember {
            index,
            array_id,
            size,
        }),
        _ => None,
    };

    Ok(JobRecord {
        job_id: job_id.ok_or(RecordError::MissingField { field: "JOB_ID" })?,
        name,
        user: user.ok_or(RecordError::MissingField { field: "USER" })?,
        script_name,
        weight,
        gpu,
        cpu,
        memory,
        priority,
        timeout,
        dependencies,
        retry_max,
        retry_delay,
        retry_on,
        retry_count,
        pre_hook,
        post_hook,
        on_fail,
        on_success,
        project,
        group,
        submit_time: submit_time.ok_or(RecordError::MissingField {
            field: "SUBMIT_TIME",
        })?,
        queue_time,
        start_time,
        end_time,
        pid,
        status: status.ok_or(RecordError::MissingField { field: "STATUS" })?,
        exit_code,
        fail_reason,
        array,
        extras,
    })
}

pub fn read_record(path: &Utf8Path) -> Result<JobRecord, RecordError> {
    let text = fs::read_to_string(path).map_err(|source| RecordError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_record(&text)
}

/// Commit a record to disk atomically (temp file plus rename).
pub fn write_record(path: &Utf8Path, record: &JobRecord) -> Result<(), RecordError> {
    atomic_write(path, &serialize_record(record)).map_err(|source| RecordError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::JobSpec;
    use tempfile::TempDir;

    fn sample_record() -> JobRecord {
        let spec = JobSpec {
            body: "echo hi\n".to_string(),
            script_name: "train.sh".to_string(),
            name: Some("nightly".to_string()),
            weight: 40,
            gpu: "0,1".parse().unwrap(),
            cpu: "2-5".parse().unwrap(),
            memory: "4G".parse().unwrap(),
            priority: Priority::High,
            timeout: Some(Duration::from_secs(120)),
            dependencies: vec!["job_001".parse().unwrap()],
            retry_max: 3,
            retry_delay: Duration::from_secs(5),
            retry_on: "2,5".parse().unwrap(),
            pre_hook: Some("echo pre".to_string()),
            post_hook: None,
            on_fail: None,
            on_success: Some("notify done".to_string()),
            project: Some("ml".to_string()),
            group: Some("batch-a".to_string()),
            array: None,
        };
        JobRecord::from_spec(&spec, JobId::new(7).unwrap(), "alice")
    }

    #[test]
    fn test_round_trip() {
        let mut record = sample_record();
        record.pid = Some(4242);
        record.start_time = Some(Utc::now());
        let parsed = parse_record(&serialize_record(&record)).unwrap();
        // RFC3339 round-trips to the same instant.
        assert_eq!(parsed.job_id, record.job_id);
        assert_eq!(parsed.gpu, record.gpu);
        assert_eq!(parsed.cpu, record.cpu);
        assert_eq!(parsed.memory, record.memory);
        assert_eq!(parsed.dependencies, record.dependencies);
        assert_eq!(parsed.retry_on, record.retry_on);
        assert_eq!(parsed.pid, Some(4242));
        assert_eq!(parsed.pre_hook.as_deref(), Some("echo pre"));
        assert_eq!(parsed.on_success.as_deref(), Some("notify done"));
    }

    #[test]
    fn test_unknown_keys_preserved() {
        let record = sample_record();
        let mut text = serialize_record(&record);
        text.push_str("FUTURE_FIELD=some value\n");
        let parsed = parse_record(&text).unwrap();
        assert_eq!(
            parsed.extras,
            vec![("FUTURE_FIELD".to_string(), "some value".to_string())]
        );
        // And they survive a rewrite.
        let rewritten = serialize_record(&parsed);
        assert!(rewritten.contains("FUTURE_FIELD=some value"));
    }

    #[test]
    fn test_value_may_contain_equals() {
        let record = sample_record();
        let mut text = serialize_record(&record);
        text = text.replace("PRE_HOOK=echo pre", "PRE_HOOK=FOO=bar env");
        let parsed = parse_record(&text).unwrap();
        assert_eq!(parsed.pre_hook.as_deref(), Some("FOO=bar env"));
    }

    #[test]
    fn test_missing_required_field() {
        let text = "JOB_ID=job_001\nSTATUS=RUNNING\n";
        let err = parse_record(text).unwrap_err();
        assert!(matches!(err, RecordError::MissingField { field: "USER" }));
    }

    #[test]
    fn test_array_fields_round_trip() {
        let mut record = sample_record();
        record.array = Some(ArrayMember {
            index: 3,
            array_id: "sweep".to_string(),
            size: 5,
        });
        let parsed = parse_record(&serialize_record(&record)).unwrap();
        assert_eq!(parsed.array, record.array);
    }

    #[test]
    fn test_write_and_read_file() {
        let temp = TempDir::new().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("job.info")).unwrap();
        let record = sample_record();
        write_record(&path, &record).unwrap();
        let read = read_record(&path).unwrap();
        assert_eq!(read.job_id, record.job_id);
        assert_eq!(read.status, JobStatus::Running);
    }
}
