//! Job queue, lock table and the single-writer loop that drives them.
//!
//! Callers build a [`JobRequest`] and hand it to a [`SchedulerHandle`]. The
//! [`Scheduler`] loop launches queued jobs once their lock keys are free,
//! relays their output, and reaps them when they exit.

pub mod exec;
pub mod handle;
pub mod job;
pub mod lock;
pub mod probe;
pub mod relay;
pub mod runner;

pub use exec::{run_command, CommandOutput, JobCommand};
pub use handle::SchedulerHandle;
pub use job::{Hook, Job, JobId, JobRequest, JobState, OutputCallback, RunningJob};
pub use lock::LockTable;
pub use probe::ProcessPoll;
pub use runner::{Scheduler, INTERNAL_ERROR_RETURN_CODE, ZOMBIE_RETURN_CODE};
