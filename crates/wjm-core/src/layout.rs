//! On-disk layout of the scheduler state tree.
//!
//! ```text
//! <JOB_DIR>/
//!   job_NNN/            one directory per job record
//!   queue/              queued scripts plus per-attribute sidecars
//!   archive/NNN/        retired batches
//!   .scheduler_state/   locks and the managed-pid registry
//! ```

use std::fs;
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::NamedTempFile;

use crate::config::Config;
use crate::record::JobId;

/// Per-attribute sidecar files next to a queued script.
///
/// Sidecars are sibling files because the substrate has no atomic
/// multi-field write; each one is rewritten atomically via rename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sidecar {
    Weight,
    Gpu,
    Priority,
    Depends,
    SubmitTime,
    Name,
    Reason,
}

impl Sidecar {
    pub fn extension(&self) -> &'static str {
        match self {
            Sidecar::Weight => "weight",
            Sidecar::Gpu => "gpu",
            Sidecar::Priority => "priority",
            Sidecar::Depends => "depends",
            Sidecar::SubmitTime => "submit_time",
            Sidecar::Name => "name",
            Sidecar::Reason => "reason",
        }
    }

    pub const ALL: [Sidecar; 7] = [
        Sidecar::Weight,
        Sidecar::Gpu,
        Sidecar::Priority,
        Sidecar::Depends,
        Sidecar::SubmitTime,
        Sidecar::Name,
        Sidecar::Reason,
    ];
}

/// Resolved state-tree paths for one scheduler instance.
#[derive(Debug, Clone)]
pub struct StateDirs {
    pub job_dir: Utf8PathBuf,
    pub queue_dir: Utf8PathBuf,
    pub archive_dir: Utf8PathBuf,
    pub state_dir: Utf8PathBuf,
    log_file_name: String,
}

impl StateDirs {
    pub fn from_config(config: &Config) -> Self {
        StateDirs {
            job_dir: config.job_dir.clone(),
            queue_dir: config.queue_dir.clone(),
            archive_dir: config.archive_dir.clone(),
            state_dir: config.job_dir.join(".scheduler_state"),
            log_file_name: config.log_file_name.clone(),
        }
    }

    /// Create every directory the scheduler writes into.
    pub fn ensure(&self) -> io::Result<()> {
        for dir in [
            &self.job_dir,
            &self.queue_dir,
            &self.archive_dir,
            &self.state_dir,
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn record_dir(&self, id: JobId) -> Utf8PathBuf {
        self.job_dir.join(id.dir_name())
    }

    pub fn job_info(&self, id: JobId) -> Utf8PathBuf {
        self.record_dir(id).join("job.info")
    }

    pub fn command_file(&self, id: JobId) -> Utf8PathBuf {
        self.record_dir(id).join("command.run")
    }

    pub fn pid_file(&self, id: JobId) -> Utf8PathBuf {
        self.record_dir(id).join("job.pid")
    }

    pub fn exit_code_file(&self, id: JobId) -> Utf8PathBuf {
        self.record_dir(id).join("exit.code")
    }

    /// Per-job wrapper log, named from the `LOG_FILE_NAME` template with
    /// its `XXX` placeholder replaced by the zero-padded index.
    pub fn log_file(&self, id: JobId) -> Utf8PathBuf {
        let name = self
            .log_file_name
            .replace("XXX", &format!("{:03}", id.index()));
        self.record_dir(id).join(name)
    }

    pub fn queue_script(&self, id: JobId) -> Utf8PathBuf {
        self.queue_dir.join(format!("{}.run", id.dir_name()))
    }

    pub fn sidecar(&self, id: JobId, kind: Sidecar) -> Utf8PathBuf {
        self.queue_dir
            .join(format!("{}.{}", id.dir_name(), kind.extension()))
    }

    pub fn processed_marker(&self, id: JobId) -> Utf8PathBuf {
        self.queue_dir.join(format!("{}.run.processed", id.dir_name()))
    }

    pub fn archive_batch(&self, batch: u32) -> Utf8PathBuf {
        self.archive_dir.join(format!("{batch:03}"))
    }

    pub fn managed_pids(&self) -> Utf8PathBuf {
        self.state_dir.join("managed_pids.txt")
    }

    /// Lock file (flock) and sentinel directory (mkdir fallback) for a
    /// named lock.
    pub fn lock_file(&self, name: &str) -> Utf8PathBuf {
        self.state_dir.join(format!("{name}.lock"))
    }

    pub fn lock_sentinel(&self, name: &str) -> Utf8PathBuf {
        self.state_dir.join(format!("{name}.lock.d"))
    }
}

/// Write `contents` to `path` through a same-directory temp file plus
/// rename, so readers never observe a partial file and interrupted writers
/// leave no `.tmp` litter behind.
pub fn atomic_write(path: &Utf8Path, contents: &str) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    fs::create_dir_all(parent)?;
    let mut tmp = NamedTempFile::new_in(parent.as_std_path())?;
    tmp.write_all(contents.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path.as_std_path()).map_err(|e| e.error)?;
    Ok(())
}
