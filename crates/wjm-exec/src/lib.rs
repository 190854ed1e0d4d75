//! Job execution for wjm.
//!
//! Dispatch (detached supervisor spawn), the per-job supervisor state
//! machine, hook execution, the queue drain pass, and the control verbs
//! that signal supervised process groups.

pub mod control;
pub mod dispatch;
pub mod drain;
pub mod error;
pub mod hooks;
pub mod supervisor;

pub use control::{kill_job, pause_job, resume_job, signal_job};
pub use dispatch::{current_user, start_job};
pub use drain::drain_queue;
pub use error::ExecError;
pub use supervisor::run_supervisor;
