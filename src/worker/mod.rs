//! Worker processes and the supervisor's pool of them.
//!
//! Inside a worker process:
//! - [`registry`] and [`targets`]: the named targets a job can call
//! - [`JobExecutor`]: runs one job under its time and memory limits
//! - [`WorkerLoop`]: reads jobs from stdin and writes results to stdout
//!
//! Inside a supervisor:
//! - [`WorkerProcess`]: handle to one child process and its pipes
//! - [`WorkerPool`]: fixed set of workers, multiplexed result pipes, reaping
//!
//! # Execution Flow
//!
//! 1. The pool writes a job frame to a ready worker's stdin
//! 2. The worker loop decodes it and hands it to the executor
//! 3. The target runs on a blocking thread while the loop watches the alarm
//! 4. Exactly one result frame goes back on stdout

pub mod drawer;
pub mod executor;
pub mod pool;
pub mod process;
pub mod registry;
pub mod targets;

pub use drawer::WorkerLoop;
pub use executor::{JobExecutor, Outcome};
pub use pool::{PollOutcome, Reaped, WorkerPool};
pub use process::{PipeEvent, WorkerProcess};
pub use registry::{Execution, Registry, TargetError};
