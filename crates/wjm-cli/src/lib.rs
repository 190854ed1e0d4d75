//! CLI argument surface for wjm.

use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand, ValueEnum};

use wjm_core::record::{JobId, Priority};
use wjm_core::spec::{CpuSpec, GpuSpec, MemorySpec, RetryOn};
use wjm_parsers::parse_duration;

#[derive(Parser, Debug)]
#[command(name = "wjm", version)]
#[command(about = "Workstation job manager: submit, schedule, and supervise shell jobs")]
pub struct Cli {
    /// Config file (default: $WJM_CONFIG, then ~/.config/wjm/wjm.conf)
    #[arg(long, global = true)]
    pub config: Option<Utf8PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Submit a script and start it now; refusal is an error
    SubmitNow {
        script: Utf8PathBuf,
        #[command(flatten)]
        overrides: SubmitArgs,
    },
    /// Submit a script; queue it when capacity refuses it
    SubmitQueued {
        script: Utf8PathBuf,
        #[command(flatten)]
        overrides: SubmitArgs,
    },

    /// Kill a job (or every job you own with 'all')
    Kill {
        /// Job id, or 'all'
        target: String,
    },
    /// SIGSTOP a running job
    Pause { id: JobId },
    /// SIGCONT a paused job
    Resume { id: JobId },
    /// Forward a signal (name or number) to a job's process group
    Signal { id: JobId, signal: String },
    /// Re-enter submission with a finished job's script and directives
    Resubmit {
        id: JobId,
        /// Start now instead of allowing a queue entry
        #[arg(long)]
        immediate: bool,
    },

    /// Summary of running, queued, and recent jobs
    Status,
    /// List job records and queue entries
    List {
        /// Filter by status (QUEUED, RUNNING, PAUSED, COMPLETED, FAILED, KILLED)
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        group: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Full record for one job
    Info {
        id: JobId,
        #[arg(long)]
        json: bool,
    },
    /// Show a job's log
    Logs {
        id: JobId,
        /// Last N lines (default 20)
        #[arg(long, conflicts_with_all = ["head", "all", "follow"])]
        tail: Option<usize>,
        /// First N lines
        #[arg(long, conflicts_with_all = ["all", "follow"])]
        head: Option<usize>,
        /// Keep printing as the job writes
        #[arg(long)]
        follow: bool,
        /// The whole log
        #[arg(long)]
        all: bool,
    },
    /// Re-render status until interrupted
    Watch {
        /// Job id, or 'all' (default)
        target: Option<String>,
    },

    /// Run one queue drain pass
    Drain,
    /// Move finished jobs into the archive tree
    Archive,
    /// Delete finished job records
    Clean {
        #[arg(value_enum)]
        filter: CleanFilter,
    },
    /// Heal stale records, reap orphans, report lock debris
    Doctor,
    /// Check the config file and report problems
    ValidateConfig,
    /// Show CPUs, memory, GPUs, and current allocation
    Resources {
        #[arg(long)]
        json: bool,
    },
    /// Print the version
    Version,

    /// Internal: supervise one job (spawned by dispatch)
    #[command(name = "_supervise", hide = true)]
    Supervise { id: JobId },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanFilter {
    Failed,
    Completed,
    All,
    Old,
}

/// Submission flags; each one overrides the matching script directive.
#[derive(Args, Debug, Default)]
pub struct SubmitArgs {
    /// Friendly job name
    #[arg(long)]
    pub name: Option<String>,
    /// urgent, high, normal, or low
    #[arg(long)]
    pub priority: Option<Priority>,
    /// Named preset supplying defaults below directives
    #[arg(long)]
    pub preset: Option<String>,
    /// Cost units against the global weight cap (1..=1000)
    #[arg(long)]
    pub weight: Option<u32>,
    /// GPU ids, 'auto', 'auto:K', or 'any'
    #[arg(long)]
    pub gpu: Option<GpuSpec>,
    /// CPU affinity: count, range a-b, or list
    #[arg(long)]
    pub cpu: Option<CpuSpec>,
    /// Virtual-memory cap, e.g. 4G or 50%
    #[arg(long)]
    pub memory: Option<MemorySpec>,
    /// Wall-clock limit, e.g. 30s, 5m, 2h
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,
    /// Retry attempts on failure (0..=10)
    #[arg(long)]
    pub retry: Option<u8>,
    /// Seconds between retries
    #[arg(long)]
    pub retry_delay: Option<u64>,
    /// Exit codes that trigger a retry, or 'any'
    #[arg(long)]
    pub retry_on: Option<RetryOn>,
    #[arg(long)]
    pub project: Option<String>,
    #[arg(long)]
    pub group: Option<String>,
    /// Jobs that must COMPLETE first
    #[arg(long = "depends-on", value_delimiter = ',')]
    pub depends_on: Vec<JobId>,
    /// Array spec: N-M, N-M:S, or a comma list
    #[arg(long)]
    pub array: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_submit() {
        let cli = Cli::parse_from([
            "wjm",
            "submit-queued",
            "train.sh",
            "--weight",
            "40",
            "--gpu",
            "auto:2",
            "--priority",
            "high",
            "--timeout",
            "2h",
            "--depends-on",
            "job_001,job_002",
        ]);
        match cli.command {
            Command::SubmitQueued { script, overrides } => {
                assert_eq!(script, Utf8PathBuf::from("train.sh"));
                assert_eq!(overrides.weight, Some(40));
                assert_eq!(overrides.gpu, Some(GpuSpec::Auto(2)));
                assert_eq!(overrides.priority, Some(Priority::High));
                assert_eq!(overrides.timeout, Some(Duration::from_secs(7200)));
                assert_eq!(overrides.depends_on.len(), 2);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_cli_parses_control_verbs() {
        let cli = Cli::parse_from(["wjm", "pause", "job_007"]);
        assert!(matches!(cli.command, Command::Pause { id } if id.index() == 7));

        let cli = Cli::parse_from(["wjm", "signal", "job_007", "USR1"]);
        assert!(matches!(cli.command, Command::Signal { .. }));

        let cli = Cli::parse_from(["wjm", "clean", "failed"]);
        assert!(matches!(
            cli.command,
            Command::Clean {
                filter: CleanFilter::Failed
            }
        ));
    }

    #[test]
    fn test_hidden_supervise_verb() {
        let cli = Cli::parse_from(["wjm", "_supervise", "job_003"]);
        assert!(matches!(cli.command, Command::Supervise { id } if id.index() == 3));
    }

    #[test]
    fn test_logs_flags_conflict() {
        assert!(Cli::try_parse_from(["wjm", "logs", "job_001", "--tail", "5", "--all"]).is_err());
    }

    #[test]
    fn test_bad_job_id_is_rejected() {
        assert!(Cli::try_parse_from(["wjm", "pause", "nope"]).is_err());
    }
}
