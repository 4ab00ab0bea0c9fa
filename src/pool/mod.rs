//! Worker pool supervision.
//!
//! The [`Supervisor`] owns a bounded set of long-lived worker processes,
//! each bound for life to one [`AffinityKey`](crate::scheduler::AffinityKey).
//! Jobs are routed to an idle worker with an identical key; otherwise a new
//! worker is created if the pool has room. Otherwise the job waits.
//!
//! # Components
//!
//! - [`machine`]: pure per-worker state machine (`Initializing -> Ready <-> Busy`)
//! - [`launcher`]: process spawning and stdio plumbing for the control protocol
//! - [`collaborators`]: recording, report storage and workspace resolution
//! - [`supervisor`]: the actor tying the queue, workers and observers together

pub mod collaborators;
pub mod launcher;
pub mod machine;
pub mod supervisor;
pub mod worker;

pub use collaborators::{
    Collaborators, CommandRecorder, DirWorkspaces, FsReportStore, NoopRecorder, Recorder,
    RecordingSummary, ReportStore, WorkspaceResolver,
};
pub use launcher::{ProcessLauncher, WorkerEvent, WorkerLauncher, WorkerLink};
pub use machine::{SlotEvent, SlotMachine, Transition, WorkerStatus};
pub use supervisor::{Placement, Supervisor, SupervisorCommand, SupervisorHandle};
pub use worker::Worker;
