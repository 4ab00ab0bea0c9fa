use std::collections::VecDeque;

use crate::scheduler::job::{Job, JobId, JobSpec};

/// Ordered collection of pending jobs.
///
/// The queue owns identifier assignment and is the single point where a
/// pending job is handed out, so two idle workers can never both receive it.
#[derive(Debug)]
pub struct JobQueue {
    pending: VecDeque<Job>,
    next_id: JobId,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            next_id: 1,
        }
    }

    /// Assign the next identifier and append the job at the back.
    pub fn enqueue(&mut self, spec: JobSpec) -> Job {
        let job = Job::from_spec(self.next_id, spec);
        self.next_id += 1;
        tracing::debug!(job_id = job.id, feature = %job.feature, "Job enqueued");
        self.pending.push_back(job.clone());
        job
    }

    /// Scan pending jobs in queue order and remove the first one `place`
    /// accepts, returning it together with the placement decision.
    ///
    /// Jobs that `place` rejects stay where they are, so a later job may
    /// leave before an earlier one whose affinity has no idle worker.
    pub fn dispatch_next<P, F>(&mut self, mut place: F) -> Option<(Job, P)>
    where
        F: FnMut(&Job) -> Option<P>,
    {
        let (index, placement) = self
            .pending
            .iter()
            .enumerate()
            .find_map(|(index, job)| place(job).map(|p| (index, p)))?;
        let job = self.pending.remove(index)?;
        Some((job, placement))
    }

    /// Put a previously dispatched job back at the front.
    ///
    /// The job keeps its identifier and submitted fields; only the slot
    /// binding is cleared. Requeueing a job that is already pending is a
    /// no-op.
    pub fn requeue(&mut self, mut job: Job) {
        if self.pending.iter().any(|j| j.id == job.id) {
            tracing::warn!(job_id = job.id, "Job already pending, ignoring requeue");
            return;
        }
        job.slot_id = None;
        tracing::info!(job_id = job.id, attempts = job.attempts, "Job requeued");
        self.pending.push_front(job);
    }

    /// Get a pending job by ID
    pub fn get_job(&self, id: JobId) -> Option<&Job> {
        self.pending.iter().find(|j| j.id == id)
    }

    /// Pending jobs in dispatch preference order
    pub fn pending_jobs(&self) -> Vec<&Job> {
        self.pending.iter().collect()
    }

    pub fn front(&self) -> Option<&Job> {
        self.pending.front()
    }

    /// Returns the number of pending jobs
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if nothing is pending
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(branch: &str) -> JobSpec {
        JobSpec::new(branch, "c1", "login.feature", "v1")
    }

    #[test]
    fn enqueue_assigns_monotonic_ids() {
        let mut queue = JobQueue::new();
        let a = queue.enqueue(spec("main"));
        let b = queue.enqueue(spec("main"));
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn dispatch_next_skips_unplaceable_jobs() {
        let mut queue = JobQueue::new();
        queue.enqueue(spec("dev"));
        let main = queue.enqueue(spec("main"));

        let taken = queue.dispatch_next(|job| (job.branch == "main").then_some(()));
        assert_eq!(taken.map(|(job, _)| job.id), Some(main.id));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.front().map(|j| j.branch.as_str()), Some("dev"));
    }

    #[test]
    fn dispatch_next_returns_none_when_nothing_fits() {
        let mut queue = JobQueue::new();
        queue.enqueue(spec("dev"));
        assert!(queue.dispatch_next(|_| None::<()>).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn requeue_goes_to_front_without_new_id() {
        let mut queue = JobQueue::new();
        let first = queue.enqueue(spec("main"));
        queue.enqueue(spec("main"));

        let (mut job, _) = queue.dispatch_next(|_| Some(())).unwrap();
        job.slot_id = Some(3);
        queue.enqueue(spec("main"));
        queue.requeue(job);

        let front = queue.front().unwrap();
        assert_eq!(front.id, first.id);
        assert!(front.slot_id.is_none());
        assert_eq!(queue.len(), 3);

        let next = queue.enqueue(spec("main"));
        assert_eq!(next.id, 4);
    }

    #[test]
    fn requeue_is_idempotent() {
        let mut queue = JobQueue::new();
        let job = queue.enqueue(spec("main"));
        queue.requeue(job.clone());
        queue.requeue(job);
        assert_eq!(queue.len(), 1);
    }
}
