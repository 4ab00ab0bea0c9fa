//! Supervisor-side view of one worker's lifecycle.
//!
//! ```text
//! Initializing ──READY──→ Ready ──bind──→ Busy ──READY_FOR_NEXT_JOB──→ Ready ...
//!      │                                   ↑
//!      └──bind (START deferred)──→ Busy ──READY──→ START sent
//!
//! any state ──exit──→ removed (unstarted job always requeued,
//!                               running job requeued unless terminating)
//! ```
//!
//! [`SlotMachine::handle`] only updates bookkeeping and returns a
//! [`Transition`]; the supervisor performs the I/O the transition asks for.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::scheduler::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Initializing,
    Ready,
    Busy,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Initializing => write!(f, "initializing"),
            WorkerStatus::Ready => write!(f, "ready"),
            WorkerStatus::Busy => write!(f, "busy"),
        }
    }
}

/// State-affecting events reported for a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotEvent {
    Ready,
    JobFinished {
        exit_code: i32,
        report_path: Option<PathBuf>,
    },
    Exited {
        exit_code: Option<i32>,
    },
}

/// What the supervisor must do after an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Bring-up finished with a job already bound: send START now.
    StartDeferred(Job),
    /// Worker is idle and unbound: look for pending work.
    DispatchNext,
    /// A job completed; finalize it, then dispatch.
    Finalize {
        job: Job,
        exit_code: i32,
        report_path: Option<PathBuf>,
    },
    /// The worker exited holding a job that must go back to the queue.
    /// `started` is true when START had already been sent.
    Requeue { job: Job, started: bool },
    /// The worker is gone with nothing to recover. `dropped` is a job whose
    /// START was sent before an intentional shutdown.
    Removed { dropped: Option<Job> },
    /// The event does not fit the current state.
    Ignored(&'static str),
}

#[derive(Debug, Clone)]
pub struct SlotMachine {
    status: WorkerStatus,
    booted: bool,
    current_job: Option<Job>,
    terminating: bool,
}

impl Default for SlotMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotMachine {
    pub fn new() -> Self {
        Self {
            status: WorkerStatus::Initializing,
            booted: false,
            current_job: None,
            terminating: false,
        }
    }

    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    pub fn current_job(&self) -> Option<&Job> {
        self.current_job.as_ref()
    }

    /// Bring-up completed (READY seen).
    pub fn is_booted(&self) -> bool {
        self.booted
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating
    }

    /// Ready, unbound, and not shutting down.
    pub fn is_idle(&self) -> bool {
        self.status == WorkerStatus::Ready && !self.terminating
    }

    pub fn mark_terminating(&mut self) {
        self.terminating = true;
    }

    /// Bind a job. Returns `Ok(true)` when START can be sent immediately and
    /// `Ok(false)` when it has to wait for READY. A worker that already
    /// holds a job or is terminating hands the job back.
    pub fn bind(&mut self, job: Job) -> Result<bool, Job> {
        if self.current_job.is_some() || self.terminating {
            return Err(job);
        }
        self.current_job = Some(job);
        self.status = WorkerStatus::Busy;
        Ok(self.booted)
    }

    pub fn handle(&mut self, event: SlotEvent) -> Transition {
        match event {
            SlotEvent::Ready => {
                if self.booted {
                    return Transition::Ignored("duplicate READY");
                }
                self.booted = true;
                match &self.current_job {
                    Some(job) => Transition::StartDeferred(job.clone()),
                    None => {
                        self.status = WorkerStatus::Ready;
                        if self.terminating {
                            Transition::Ignored("READY while terminating")
                        } else {
                            Transition::DispatchNext
                        }
                    }
                }
            }
            SlotEvent::JobFinished {
                exit_code,
                report_path,
            } => {
                if !self.booted {
                    return Transition::Ignored("READY_FOR_NEXT_JOB before READY");
                }
                match self.current_job.take() {
                    Some(job) => {
                        self.status = WorkerStatus::Ready;
                        Transition::Finalize {
                            job,
                            exit_code,
                            report_path,
                        }
                    }
                    None => Transition::Ignored("READY_FOR_NEXT_JOB without a running job"),
                }
            }
            SlotEvent::Exited { .. } => {
                let job = self.current_job.take();
                self.status = WorkerStatus::Ready;
                match job {
                    // A job that never started is recoverable whatever the
                    // reason for the exit.
                    Some(job) if !self.terminating || !self.booted => Transition::Requeue {
                        job,
                        started: self.booted,
                    },
                    dropped => Transition::Removed { dropped },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::JobSpec;

    fn job(id: u64) -> Job {
        Job::from_spec(id, JobSpec::new("main", "c1", "login.feature", "v1"))
    }

    fn busy_invariant(machine: &SlotMachine) {
        assert_eq!(
            machine.status() == WorkerStatus::Busy,
            machine.current_job().is_some()
        );
    }

    #[test]
    fn ready_without_job_asks_for_dispatch() {
        let mut machine = SlotMachine::new();
        assert_eq!(machine.status(), WorkerStatus::Initializing);
        assert_eq!(machine.handle(SlotEvent::Ready), Transition::DispatchNext);
        assert!(machine.is_idle());
        busy_invariant(&machine);
    }

    #[test]
    fn bind_before_ready_defers_start() {
        let mut machine = SlotMachine::new();
        assert_eq!(machine.bind(job(1)), Ok(false));
        assert_eq!(machine.status(), WorkerStatus::Busy);
        busy_invariant(&machine);

        match machine.handle(SlotEvent::Ready) {
            Transition::StartDeferred(started) => assert_eq!(started.id, 1),
            other => panic!("unexpected transition {:?}", other),
        }
        assert_eq!(machine.status(), WorkerStatus::Busy);
    }

    #[test]
    fn bind_after_ready_starts_immediately() {
        let mut machine = SlotMachine::new();
        machine.handle(SlotEvent::Ready);
        assert_eq!(machine.bind(job(1)), Ok(true));
        busy_invariant(&machine);
    }

    #[test]
    fn busy_worker_rejects_second_job() {
        let mut machine = SlotMachine::new();
        machine.handle(SlotEvent::Ready);
        machine.bind(job(1)).unwrap();
        let rejected = machine.bind(job(2)).unwrap_err();
        assert_eq!(rejected.id, 2);
        assert_eq!(machine.current_job().map(|j| j.id), Some(1));
    }

    #[test]
    fn job_finished_returns_to_ready() {
        let mut machine = SlotMachine::new();
        machine.handle(SlotEvent::Ready);
        machine.bind(job(1)).unwrap();

        let transition = machine.handle(SlotEvent::JobFinished {
            exit_code: 1,
            report_path: None,
        });
        match transition {
            Transition::Finalize { job, exit_code, .. } => {
                assert_eq!(job.id, 1);
                assert_eq!(exit_code, 1);
            }
            other => panic!("unexpected transition {:?}", other),
        }
        assert!(machine.is_idle());
        busy_invariant(&machine);
    }

    #[test]
    fn stray_job_finished_is_ignored() {
        let mut machine = SlotMachine::new();
        machine.handle(SlotEvent::Ready);
        assert!(matches!(
            machine.handle(SlotEvent::JobFinished {
                exit_code: 0,
                report_path: None
            }),
            Transition::Ignored(_)
        ));
        assert!(matches!(machine.handle(SlotEvent::Ready), Transition::Ignored(_)));
    }

    #[test]
    fn exit_while_busy_requeues() {
        let mut machine = SlotMachine::new();
        machine.handle(SlotEvent::Ready);
        machine.bind(job(4)).unwrap();
        match machine.handle(SlotEvent::Exited {
            exit_code: Some(137),
        }) {
            Transition::Requeue { job, started } => {
                assert_eq!(job.id, 4);
                assert!(started);
            }
            other => panic!("unexpected transition {:?}", other),
        }
    }

    #[test]
    fn exit_during_bring_up_with_bound_job_requeues_unstarted() {
        let mut machine = SlotMachine::new();
        machine.bind(job(4)).unwrap();
        assert!(matches!(
            machine.handle(SlotEvent::Exited { exit_code: Some(1) }),
            Transition::Requeue { started: false, .. }
        ));
    }

    #[test]
    fn exit_while_terminating_drops_job() {
        let mut machine = SlotMachine::new();
        machine.handle(SlotEvent::Ready);
        machine.bind(job(4)).unwrap();
        machine.mark_terminating();
        match machine.handle(SlotEvent::Exited { exit_code: Some(0) }) {
            Transition::Removed { dropped } => assert_eq!(dropped.map(|j| j.id), Some(4)),
            other => panic!("unexpected transition {:?}", other),
        }
    }

    #[test]
    fn exit_while_terminating_requeues_unstarted_job() {
        let mut machine = SlotMachine::new();
        machine.bind(job(4)).unwrap();
        machine.mark_terminating();
        match machine.handle(SlotEvent::Exited { exit_code: Some(0) }) {
            Transition::Requeue { job, started } => {
                assert_eq!(job.id, 4);
                assert!(!started);
            }
            other => panic!("unexpected transition {:?}", other),
        }
    }

    #[test]
    fn terminating_worker_is_not_idle_and_refuses_jobs() {
        let mut machine = SlotMachine::new();
        machine.handle(SlotEvent::Ready);
        machine.mark_terminating();
        assert!(!machine.is_idle());
        assert!(machine.bind(job(1)).is_err());
        assert_eq!(
            machine.handle(SlotEvent::Exited { exit_code: Some(0) }),
            Transition::Removed { dropped: None }
        );
    }
}
