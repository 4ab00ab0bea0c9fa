pub mod job;
pub mod queue;

pub use job::{AffinityKey, ApkSource, DeviceSource, Job, JobId, JobSpec, SlotId};
pub use queue::JobQueue;
