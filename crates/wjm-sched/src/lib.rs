//! Scheduling engine for wjm.
//!
//! Everything that coordinates concurrent short-lived scheduler
//! processes: named on-disk locks, atomic job-id allocation, the system
//! resource probe, the sanitizing record scan, capacity admission, queue
//! entries, and the managed-pid registry.

pub mod admission;
pub mod idgen;
pub mod lock;
pub mod probe;
pub mod queue;
pub mod registry;
pub mod scan;

pub use admission::{evaluate, AdmissionOutcome, AdmissionRequest};
pub use idgen::{allocate_job_id, IdGenError};
pub use lock::{acquire, LockError, LockGuard, LockKind};
pub use probe::{
    allocated_gpus, free_gpu_ids, probe_gpus, probe_system, resolve_gpu_spec, GpuDevice,
    SystemResources,
};
pub use queue::{
    clean_processed_markers, enqueue, list_queue_entries, load_queued_spec, queued_meta,
    remove_queue_entry, update_reason, QueueEntry, QueueError,
};
pub use registry::{reap_orphan, register_pid, scan_orphans, unregister_pid};
pub use scan::{
    completed_ids, load_job, pid_alive, running_usage, scan_jobs, JobView, RunningUsage, ScanError,
};
