//! Core types and on-disk state for wjm.
//!
//! Job records, the KEY=VALUE record codec, resource spec grammars,
//! and the directory layout shared by every command.

pub mod codec;
pub mod config;
pub mod layout;
pub mod record;
pub mod spec;

pub use codec::{read_record, write_record, RecordError};
pub use config::{Config, ConfigError, Preset, QueueProfile};
pub use layout::{atomic_write, Sidecar, StateDirs};
pub use record::{FailReason, JobId, JobRecord, JobSpec, JobStatus, Priority, MAX_JOB_INDEX};
pub use spec::{CpuSpec, GpuSpec, MemorySpec, RetryOn, SpecError};
