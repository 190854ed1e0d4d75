//! Execution-side error type.

use thiserror::Error;

use wjm_core::codec::RecordError;
use wjm_core::record::{JobId, JobStatus};
use wjm_sched::{LockError, QueueError, ScanError};

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("no job record for {0}")]
    NotFound(JobId),
    #[error("{id} is owned by {owner}; only the owner may control it")]
    NotOwner { id: JobId, owner: String },
    #[error("{id} is {status}; operation needs a live job")]
    WrongState { id: JobId, status: JobStatus },
    #[error("invalid signal '{0}'")]
    InvalidSignal(String),
    #[error("SIGSTOP and SIGCONT are reserved for pause/resume")]
    ReservedSignal,
    #[error("failed to spawn supervisor for {id}: {reason}")]
    Spawn { id: JobId, reason: String },
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("signal error: {0}")]
    Signal(#[from] nix::Error),
    #[error("execution io error: {0}")]
    Io(#[from] std::io::Error),
}
