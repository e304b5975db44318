pub mod assigner;
pub mod job;
pub mod notification;
pub mod queue;
pub mod result;

pub use job::{priority, Args, BuckId, Job, JobBuilder, Limits, Payload};
pub use notification::Notice;
pub use queue::{Enqueued, JobQueue, JobState};
pub use result::JobResult;
