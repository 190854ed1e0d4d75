//! Scheduler configuration.
//!
//! A plain KEY=VALUE file, parsed once at startup into a `Config` value
//! that is threaded explicitly through the call tree. Presets and CLI
//! overrides are computed at the submission boundary, never by mutating
//! shared state.

use std::collections::BTreeMap;
use std::fs;
use std::str::FromStr;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::record::Priority;
use crate::spec::GpuSpec;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
    #[error("config line {line} is not KEY=VALUE: '{text}'")]
    Malformed { line: usize, text: String },
    #[error("invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

/// Submission defaults selectable with `--preset`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preset {
    pub weight: Option<u32>,
    pub priority: Option<Priority>,
    pub gpu: Option<GpuSpec>,
    /// Explicit device list overriding GPU auto-selection.
    pub devices: Option<Vec<u32>>,
}

/// Named queue profile from `QUEUE_<name>_*` keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueProfile {
    pub max_jobs: Option<u32>,
    pub max_weight: Option<u32>,
    pub requires_gpu: bool,
    pub priority_boost: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub job_dir: Utf8PathBuf,
    pub queue_dir: Utf8PathBuf,
    pub archive_dir: Utf8PathBuf,
    pub log_dir: Utf8PathBuf,

    /// 0 = unlimited.
    pub max_concurrent_jobs: u32,
    /// 0 = unlimited.
    pub max_total_weight: u32,
    pub max_total_jobs: u32,

    pub default_job_weight: u32,
    pub default_job_priority: Priority,
    pub priority_queue_enabled: bool,

    pub archive_threshold: u32,
    pub max_archive_batches: u32,

    /// Per-job log name; `XXX` is replaced by the job index.
    pub log_file_name: String,
    pub watch_refresh_interval: Duration,
    pub max_log_size_mb: u64,
    pub log_rotation_count: u32,
    pub log_cleanup_days: u32,
    pub log_compression_enabled: bool,

    pub dependencies_enabled: bool,

    pub presets: BTreeMap<String, Preset>,
    pub queues: BTreeMap<String, QueueProfile>,

    /// Keys the parser did not recognize, kept for validate-config.
    pub unknown_keys: Vec<String>,
}

impl Config {
    /// Defaults rooted at `job_dir`, with queue/archive nested under it.
    pub fn with_root(job_dir: Utf8PathBuf) -> Self {
        let queue_dir = job_dir.join("queue");
        let archive_dir = job_dir.join("archive");
        Config {
            log_dir: job_dir.clone(),
            job_dir,
            queue_dir,
            archive_dir,
            max_concurrent_jobs: 4,
            max_total_weight: 100,
            max_total_jobs: 999,
            default_job_weight: 10,
            default_job_priority: Priority::Normal,
            priority_queue_enabled: true,
            archive_threshold: 50,
            max_archive_batches: 100,
            log_file_name: "job_XXX.log".to_string(),
            watch_refresh_interval: Duration::from_secs(5),
            max_log_size_mb: 100,
            log_rotation_count: 3,
            log_cleanup_days: 30,
            log_compression_enabled: true,
            dependencies_enabled: true,
            presets: builtin_presets(),
            queues: BTreeMap::new(),
            unknown_keys: Vec::new(),
        }
    }

    /// The default state root: `$WJM_JOB_DIR`, else `~/.wjm/jobs`.
    pub fn default_root() -> Utf8PathBuf {
        if let Ok(dir) = std::env::var("WJM_JOB_DIR") {
            return Utf8PathBuf::from(dir);
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Utf8PathBuf::from(home).join(".wjm").join("jobs")
    }

    /// The config file location: `$WJM_CONFIG`, else `~/.config/wjm/wjm.conf`.
    pub fn locate() -> Option<Utf8PathBuf> {
        if let Ok(path) = std::env::var("WJM_CONFIG") {
            return Some(Utf8PathBuf::from(path));
        }
        let home = std::env::var("HOME").ok()?;
        let path = Utf8PathBuf::from(home)
            .join(".config")
            .join("wjm")
            .join("wjm.conf");
        path.exists().then_some(path)
    }

    /// Load the located config file, or plain defaults when there is none.
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::locate() {
            Some(path) => Self::load(&path),
            None => Ok(Self::with_root(Self::default_root())),
        }
    }

    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut config = Config::with_root(Self::default_root());
        let mut explicit_queue_dir = false;
        let mut explicit_archive_dir = false;
        let mut explicit_log_dir = false;

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or(ConfigError::Malformed {
                line: idx + 1,
                text: line.to_string(),
            })?;
            let key = key.trim();
            let value = value.trim();
            match key {
                "JOB_DIR" => config.job_dir = Utf8PathBuf::from(value),
                "QUEUE_DIR" => {
                    config.queue_dir = Utf8PathBuf::from(value);
                    explicit_queue_dir = true;
                }
                "ARCHIVE_DIR" => {
                    config.archive_dir = Utf8PathBuf::from(value);
                    explicit_archive_dir = true;
                }
                "LOG_DIR" => {
                    config.log_dir = Utf8PathBuf::from(value);
                    explicit_log_dir = true;
                }
                "MAX_CONCURRENT_JOBS" => config.max_concurrent_jobs = parse_num(key, value)?,
                "MAX_TOTAL_WEIGHT" => config.max_total_weight = parse_num(key, value)?,
                "MAX_TOTAL_JOBS" => config.max_total_jobs = parse_num(key, value)?,
                "DEFAULT_JOB_WEIGHT" => {
                    let weight: u32 = parse_num(key, value)?;
                    if weight == 0 || weight > 1000 {
                        return Err(ConfigError::InvalidValue {
                            key: key.to_string(),
                            value: value.to_string(),
                            reason: "weight must be 1..=1000".to_string(),
                        });
                    }
                    config.default_job_weight = weight;
                }
                "DEFAULT_JOB_PRIORITY" => {
                    config.default_job_priority =
                        Priority::from_str(value).map_err(|e| ConfigError::InvalidValue {
                            key: key.to_string(),
                            value: value.to_string(),
                            reason: e.to_string(),
                        })?;
                }
                "PRIORITY_QUEUE_ENABLED" => config.priority_queue_enabled = parse_bool(key, value)?,
                "ARCHIVE_THRESHOLD" => config.archive_threshold = parse_num(key, value)?,
                "MAX_ARCHIVE_BATCHES" => config.max_archive_batches = parse_num(key, value)?,
                "LOG_FILE_NAME" => {
                    if !value.contains("XXX") {
                        return Err(ConfigError::InvalidValue {
                            key: key.to_string(),
                            value: value.to_string(),
                            reason: "must contain the XXX placeholder".to_string(),
                        });
                    }
                    config.log_file_name = value.to_string();
                }
                "WATCH_REFRESH_INTERVAL" => {
                    config.watch_refresh_interval = Duration::from_secs(parse_num(key, value)?)
                }
                "MAX_LOG_SIZE_MB" => config.max_log_size_mb = parse_num(key, value)?,
                "LOG_ROTATION_COUNT" => config.log_rotation_count = parse_num(key, value)?,
                "LOG_CLEANUP_DAYS" => config.log_cleanup_days = parse_num(key, value)?,
                "LOG_COMPRESSION_ENABLED" => {
                    config.log_compression_enabled = parse_bool(key, value)?
                }
                "DEPENDENCIES_ENABLED" => config.dependencies_enabled = parse_bool(key, value)?,
                _ => {
                    if !parse_preset_key(&mut config.presets, key, value)?
                        && !parse_queue_key(&mut config.queues, key, value)?
                    {
                        config.unknown_keys.push(key.to_string());
                    }
                }
            }
        }

        // Directories not set explicitly follow JOB_DIR.
        if !explicit_queue_dir {
            config.queue_dir = config.job_dir.join("queue");
        }
        if !explicit_archive_dir {
            config.archive_dir = config.job_dir.join("archive");
        }
        if !explicit_log_dir {
            config.log_dir = config.job_dir.clone();
        }
        Ok(config)
    }

    /// Non-fatal findings for `validate-config`.
    pub fn lint(&self) -> Vec<String> {
        let mut findings = Vec::new();
        for key in &self.unknown_keys {
            findings.push(format!("unknown key {key}"));
        }
        if self.archive_threshold == 0 {
            findings.push("ARCHIVE_THRESHOLD=0 disables archive batching".to_string());
        }
        if self.max_total_weight > 0 && self.default_job_weight > self.max_total_weight {
            findings.push(format!(
                "DEFAULT_JOB_WEIGHT {} exceeds MAX_TOTAL_WEIGHT {}: every default submission will queue",
                self.default_job_weight, self.max_total_weight
            ));
        }
        for (name, queue) in &self.queues {
            if let (Some(queue_weight), true) = (queue.max_weight, self.max_total_weight > 0) {
                if queue_weight > self.max_total_weight {
                    findings.push(format!(
                        "QUEUE_{name}_MAX_WEIGHT {queue_weight} exceeds MAX_TOTAL_WEIGHT {}",
                        self.max_total_weight
                    ));
                }
            }
            if let Some(boost) = queue.priority_boost {
                if boost > 30 {
                    findings.push(format!(
                        "QUEUE_{name}_PRIORITY_BOOST {boost} exceeds the priority span"
                    ));
                }
            }
        }
        findings
    }
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: "expected a non-negative integer".to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}

/// `PRESET_<NAME>_<WEIGHT|PRIORITY|GPU|DEVICES>`.
fn parse_preset_key(
    presets: &mut BTreeMap<String, Preset>,
    key: &str,
    value: &str,
) -> Result<bool, ConfigError> {
    let Some(rest) = key.strip_prefix("PRESET_") else {
        return Ok(false);
    };
    let invalid = |reason: String| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason,
    };
    if let Some(name) = rest.strip_suffix("_WEIGHT") {
        let preset = presets.entry(name.to_lowercase()).or_default();
        preset.weight = Some(parse_num(key, value)?);
    } else if let Some(name) = rest.strip_suffix("_PRIORITY") {
        let preset = presets.entry(name.to_lowercase()).or_default();
        preset.priority = Some(Priority::from_str(value).map_err(|e| invalid(e.to_string()))?);
    } else if let Some(name) = rest.strip_suffix("_GPU") {
        let preset = presets.entry(name.to_lowercase()).or_default();
        preset.gpu = Some(GpuSpec::from_str(value).map_err(|e| invalid(e.to_string()))?);
    } else if let Some(name) = rest.strip_suffix("_DEVICES") {
        let devices = value
            .split(',')
            .map(|p| p.trim().parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| invalid("expected comma list of device ids".to_string()))?;
        let preset = presets.entry(name.to_lowercase()).or_default();
        preset.devices = Some(devices);
    } else {
        return Ok(false);
    }
    Ok(true)
}

/// `QUEUE_<name>_<MAX_JOBS|MAX_WEIGHT|REQUIRES_GPU|PRIORITY_BOOST>`.
fn parse_queue_key(
    queues: &mut BTreeMap<String, QueueProfile>,
    key: &str,
    value: &str,
) -> Result<bool, ConfigError> {
    let Some(rest) = key.strip_prefix("QUEUE_") else {
        return Ok(false);
    };
    if let Some(name) = rest.strip_suffix("_MAX_JOBS") {
        let queue = queues.entry(name.to_lowercase()).or_default();
        queue.max_jobs = Some(parse_num(key, value)?);
    } else if let Some(name) = rest.strip_suffix("_MAX_WEIGHT") {
        let queue = queues.entry(name.to_lowercase()).or_default();
        queue.max_weight = Some(parse_num(key, value)?);
    } else if let Some(name) = rest.strip_suffix("_REQUIRES_GPU") {
        let requires = parse_bool(key, value)?;
        let queue = queues.entry(name.to_lowercase()).or_default();
        queue.requires_gpu = requires;
    } else if let Some(name) = rest.strip_suffix("_PRIORITY_BOOST") {
        let queue = queues.entry(name.to_lowercase()).or_default();
        queue.priority_boost = Some(parse_num(key, value)?);
    } else {
        return Ok(false);
    }
    Ok(true)
}

fn builtin_presets() -> BTreeMap<String, Preset> {
    let mut presets = BTreeMap::new();
    presets.insert(
        "small".to_string(),
        Preset {
            weight: Some(10),
            ..Preset::default()
        },
    );
    presets.insert(
        "medium".to_string(),
        Preset {
            weight: Some(50),
            ..Preset::default()
        },
    );
    presets.insert(
        "large".to_string(),
        Preset {
            weight: Some(200),
            ..Preset::default()
        },
    );
    presets.insert(
        "gpu".to_string(),
        Preset {
            weight: Some(100),
            gpu: Some(GpuSpec::Auto(1)),
            ..Preset::default()
        },
    );
    presets.insert(
        "urgent".to_string(),
        Preset {
            weight: Some(10),
            priority: Some(Priority::Urgent),
            ..Preset::default()
        },
    );
    presets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_keys() {
        let config = Config::parse(
            "# scheduler config\n\
             JOB_DIR=/srv/jobs\n\
             MAX_CONCURRENT_JOBS=2\n\
             MAX_TOTAL_WEIGHT=100\n\
             DEFAULT_JOB_PRIORITY=high\n\
             LOG_COMPRESSION_ENABLED=false\n",
        )
        .unwrap();
        assert_eq!(config.job_dir, Utf8PathBuf::from("/srv/jobs"));
        assert_eq!(config.queue_dir, Utf8PathBuf::from("/srv/jobs/queue"));
        assert_eq!(config.max_concurrent_jobs, 2);
        assert_eq!(config.default_job_priority, Priority::High);
        assert!(!config.log_compression_enabled);
    }

    #[test]
    fn test_zero_means_unlimited_is_accepted() {
        let config = Config::parse("MAX_CONCURRENT_JOBS=0\nMAX_TOTAL_WEIGHT=0\n").unwrap();
        assert_eq!(config.max_concurrent_jobs, 0);
        assert_eq!(config.max_total_weight, 0);
    }

    #[test]
    fn test_log_file_name_requires_placeholder() {
        assert!(Config::parse("LOG_FILE_NAME=job.log\n").is_err());
        assert!(Config::parse("LOG_FILE_NAME=run_XXX.out\n").is_ok());
    }

    #[test]
    fn test_preset_keys() {
        let config = Config::parse(
            "PRESET_TRAIN_WEIGHT=300\n\
             PRESET_TRAIN_PRIORITY=high\n\
             PRESET_TRAIN_GPU=auto:2\n\
             PRESET_TRAIN_DEVICES=0,1\n",
        )
        .unwrap();
        let preset = config.presets.get("train").unwrap();
        assert_eq!(preset.weight, Some(300));
        assert_eq!(preset.priority, Some(Priority::High));
        assert_eq!(preset.gpu, Some(GpuSpec::Auto(2)));
        assert_eq!(preset.devices, Some(vec![0, 1]));
    }

    #[test]
    fn test_builtin_presets_present() {
        let config = Config::with_root("/tmp/x".into());
        for name in ["small", "medium", "large", "gpu", "urgent"] {
            assert!(config.presets.contains_key(name), "missing preset {name}");
        }
        assert_eq!(config.presets["gpu"].gpu, Some(GpuSpec::Auto(1)));
    }

    #[test]
    fn test_queue_profile_keys() {
        let config = Config::parse(
            "QUEUE_GPU_MAX_JOBS=2\n\
             QUEUE_GPU_MAX_WEIGHT=80\n\
             QUEUE_GPU_REQUIRES_GPU=true\n\
             QUEUE_GPU_PRIORITY_BOOST=10\n",
        )
        .unwrap();
        let queue = config.queues.get("gpu").unwrap();
        assert_eq!(queue.max_jobs, Some(2));
        assert_eq!(queue.max_weight, Some(80));
        assert!(queue.requires_gpu);
        assert_eq!(queue.priority_boost, Some(10));
    }

    #[test]
    fn test_unknown_keys_collected() {
        let config = Config::parse("SOME_FUTURE_KEY=1\n").unwrap();
        assert_eq!(config.unknown_keys, vec!["SOME_FUTURE_KEY".to_string()]);
        assert!(config
            .lint()
            .iter()
            .any(|f| f.contains("SOME_FUTURE_KEY")));
    }

    #[test]
    fn test_malformed_line_rejected() {
        assert!(Config::parse("NOT A PAIR\n").is_err());
    }

    #[test]
    fn test_lint_flags_unreachable_default_weight() {
        let config = Config::parse("MAX_TOTAL_WEIGHT=5\nDEFAULT_JOB_WEIGHT=10\n").unwrap();
        assert!(config.lint().iter().any(|f| f.contains("DEFAULT_JOB_WEIGHT")));
    }
}
