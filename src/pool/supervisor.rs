use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::error::{FarmError, Result};
use crate::events::{
    EventBus, JobAbandoned, JobFinished, JobStarted, LogUpdate, PoolEvent, PoolSnapshot,
    ProgressUpdate,
};
use crate::pool::collaborators::Collaborators;
use crate::pool::launcher::{WorkerEvent, WorkerLauncher};
use crate::pool::machine::{SlotEvent, Transition};
use crate::pool::worker::Worker;
use crate::protocol::{ControlMessage, InitPayload, WorkerMessage};
use crate::scheduler::{AffinityKey, DeviceSource, Job, JobQueue, JobSpec, SlotId};

const COMMAND_CHANNEL_CAPACITY: usize = 256;
const WORKER_EVENT_CHANNEL_CAPACITY: usize = 1024;
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Requests handled by the supervisor loop.
#[derive(Debug)]
pub enum SupervisorCommand {
    Submit {
        spec: JobSpec,
        response_tx: oneshot::Sender<Result<Job>>,
    },
    Snapshot {
        response_tx: oneshot::Sender<PoolSnapshot>,
    },
    PendingJobs {
        response_tx: oneshot::Sender<Vec<Job>>,
    },
    TerminateWorker {
        slot_id: SlotId,
        response_tx: oneshot::Sender<Result<()>>,
    },
}

/// Where a pending job can go right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// An idle worker with a matching affinity key
    Idle(SlotId),
    /// No match, but the pool has room for a new worker
    Spawn,
}

/// Owns the worker registry and the job queue, and drives every worker
/// through the control protocol.
///
/// All state lives on one task; worker processes only ever talk to it
/// through [`WorkerEvent`]s, so no locking is needed.
pub struct Supervisor {
    config: PoolConfig,
    workers: BTreeMap<SlotId, Worker>,
    queue: JobQueue,
    launcher: Arc<dyn WorkerLauncher>,
    collaborators: Collaborators,
    events: EventBus,
    worker_events_tx: mpsc::Sender<WorkerEvent>,
    next_instance: u64,
    draining: bool,
}

impl Supervisor {
    pub fn new(
        config: PoolConfig,
        launcher: Arc<dyn WorkerLauncher>,
        collaborators: Collaborators,
        events: EventBus,
    ) -> (Self, mpsc::Receiver<WorkerEvent>) {
        let (worker_events_tx, worker_events_rx) = mpsc::channel(WORKER_EVENT_CHANNEL_CAPACITY);

        let supervisor = Self {
            config,
            workers: BTreeMap::new(),
            queue: JobQueue::new(),
            launcher,
            collaborators,
            events,
            worker_events_tx,
            next_instance: 1,
            draining: false,
        };

        (supervisor, worker_events_rx)
    }

    /// Move the supervisor onto its own task and return a handle to it.
    pub fn spawn(
        self,
        worker_events_rx: mpsc::Receiver<WorkerEvent>,
        shutdown: CancellationToken,
    ) -> (SupervisorHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let handle = SupervisorHandle {
            command_tx,
            events: self.events.clone(),
        };
        let task = tokio::spawn(self.run(command_rx, worker_events_rx, shutdown));
        (handle, task)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn worker(&self, slot_id: SlotId) -> Option<&Worker> {
        self.workers.get(&slot_id)
    }

    pub fn workers(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn has_capacity(&self) -> bool {
        self.workers.len() < self.config.max_workers
    }

    /// Main loop: serve commands and worker events until shutdown.
    pub async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<SupervisorCommand>,
        mut worker_events_rx: mpsc::Receiver<WorkerEvent>,
        shutdown: CancellationToken,
    ) {
        tracing::info!(
            max_workers = self.config.max_workers,
            device_source = %self.config.device_source,
            "Supervisor started"
        );

        // Losing every handle only stops new requests; workers keep running.
        let mut commands_open = true;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                Some(event) = worker_events_rx.recv() => {
                    self.handle_worker_event(event).await;
                }

                command = command_rx.recv(), if commands_open => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => commands_open = false,
                    }
                }
            }
        }

        self.shutdown(&mut worker_events_rx).await;
    }

    async fn handle_command(&mut self, command: SupervisorCommand) {
        match command {
            SupervisorCommand::Submit { spec, response_tx } => {
                let result = self.submit(spec).await;
                let _ = response_tx.send(result);
            }
            SupervisorCommand::Snapshot { response_tx } => {
                let _ = response_tx.send(self.snapshot());
            }
            SupervisorCommand::PendingJobs { response_tx } => {
                let pending = self.queue.pending_jobs().into_iter().cloned().collect();
                let _ = response_tx.send(pending);
            }
            SupervisorCommand::TerminateWorker {
                slot_id,
                response_tx,
            } => {
                let result = self.terminate_worker(slot_id);
                let _ = response_tx.send(result);
            }
        }
    }

    /// Validate, enqueue and try to dispatch right away.
    pub async fn submit(&mut self, spec: JobSpec) -> Result<Job> {
        spec.validate(self.config.device_source)?;
        let job = self.queue.enqueue(spec);
        tracing::info!(
            job_id = job.id,
            feature = %job.feature,
            branch = %job.branch,
            client = %job.client,
            "Job submitted"
        );
        self.dispatch().await;
        Ok(job)
    }

    /// An idle worker whose affinity key exactly matches the job's.
    pub fn find_suitable_worker(&self, job: &Job) -> Option<SlotId> {
        idle_match(&self.workers, &job.affinity_key(self.config.device_source))
    }

    /// Pair pending jobs with workers until nothing more fits.
    pub async fn dispatch(&mut self) {
        if self.draining {
            return;
        }

        loop {
            let workers = &self.workers;
            let config = &self.config;
            let Some((job, placement)) = self
                .queue
                .dispatch_next(|job| placement_for(workers, config, job))
            else {
                break;
            };

            match placement {
                Placement::Idle(slot_id) => {
                    if let Err(e) = self.run_job(job, slot_id).await {
                        tracing::error!(slot_id, error = %e, "Failed to run job on idle worker");
                    }
                }
                Placement::Spawn => {
                    let key = job.affinity_key(self.config.device_source);
                    match self.create_worker(key, job.quick_test) {
                        Ok(slot_id) => {
                            if let Err(e) = self.run_job(job, slot_id).await {
                                tracing::error!(slot_id, error = %e, "Failed to bind job to new worker");
                            }
                        }
                        Err(e) => {
                            tracing::warn!(job_id = job.id, error = %e, "Could not create worker, job stays queued");
                            self.queue.requeue(job);
                            break;
                        }
                    }
                }
            }
        }

        self.reclaim_devices();
    }

    /// Start a new worker process bound to `key` and send it INIT.
    ///
    /// Refuses with [`FarmError::PoolAtCapacity`] when the pool is full.
    pub fn create_worker(&mut self, key: AffinityKey, quick_test: bool) -> Result<SlotId> {
        if !self.has_capacity() {
            return Err(FarmError::PoolAtCapacity {
                max: self.config.max_workers,
            });
        }

        let slot_id = self.next_slot_id();
        let instance = self.next_instance;
        self.next_instance += 1;

        let (workspace, persistent) = self.resolve_workspace(&key);

        // Event forwarding is wired up inside launch, before INIT goes out.
        let link = self
            .launcher
            .launch(slot_id, instance, self.worker_events_tx.clone())?;
        let worker = Worker::new(slot_id, instance, key.clone(), workspace.clone(), persistent, link);

        let mut init = InitPayload::new(&key, workspace.clone(), persistent);
        init.quick_test = quick_test;
        if let Err(e) = worker.send(ControlMessage::Init(init)) {
            // The exit event that follows cleans the slot up.
            tracing::warn!(slot_id, error = %e, "Failed to send INIT");
        }

        tracing::info!(
            slot_id,
            instance,
            key = %key,
            workspace = %workspace.display(),
            persistent,
            "Worker created"
        );
        self.workers.insert(slot_id, worker);
        self.broadcast_status();
        Ok(slot_id)
    }

    /// Bind `job` to a worker and start it, or leave START pending until the
    /// worker reports READY.
    pub async fn run_job(&mut self, mut job: Job, slot_id: SlotId) -> Result<()> {
        let Some(worker) = self.workers.get_mut(&slot_id) else {
            self.queue.requeue(job);
            return Err(FarmError::WorkerNotFound(slot_id));
        };

        job.slot_id = Some(slot_id);
        job.attempts += 1;
        let start_now = match worker.bind(job.clone()) {
            Ok(start_now) => start_now,
            Err(mut job) => {
                job.attempts -= 1;
                self.queue.requeue(job);
                return Err(FarmError::Internal(format!(
                    "worker {} cannot accept a job",
                    slot_id
                )));
            }
        };

        tracing::info!(job_id = job.id, slot_id, attempt = job.attempts, start_now, "Job dispatched");
        self.events.publish(PoolEvent::JobStarted(JobStarted {
            slot_id,
            job_id: job.id,
            feature: job.feature.clone(),
            branch: job.branch.clone(),
        }));

        if start_now {
            self.start_job(slot_id, job).await;
        }
        self.broadcast_status();
        Ok(())
    }

    /// Ask a worker to shut down. Its exit will not requeue anything.
    pub fn terminate_worker(&mut self, slot_id: SlotId) -> Result<()> {
        let worker = self
            .workers
            .get_mut(&slot_id)
            .ok_or(FarmError::WorkerNotFound(slot_id))?;
        if worker.is_terminating() {
            return Ok(());
        }

        worker.mark_terminating();
        if let Err(e) = worker.send(ControlMessage::Terminate) {
            tracing::warn!(slot_id, error = %e, "Failed to send TERMINATE");
        }
        tracing::info!(slot_id, "Worker terminating");
        self.broadcast_status();
        Ok(())
    }

    pub async fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Message {
                slot_id,
                instance,
                message,
            } => self.handle_worker_message(slot_id, instance, message).await,
            WorkerEvent::Exited {
                slot_id,
                instance,
                exit_code,
            } => self.handle_worker_exit(slot_id, instance, exit_code).await,
        }
    }

    pub async fn handle_worker_message(
        &mut self,
        slot_id: SlotId,
        instance: u64,
        message: WorkerMessage,
    ) {
        let Some(worker) = self
            .workers
            .get_mut(&slot_id)
            .filter(|w| w.instance == instance)
        else {
            tracing::warn!(slot_id, instance, message = message.name(), "Message from unknown worker dropped");
            return;
        };

        let event = match message {
            WorkerMessage::Ready => SlotEvent::Ready,
            WorkerMessage::ReadyForNextJob {
                exit_code,
                report_path,
            } => SlotEvent::JobFinished {
                exit_code,
                report_path,
            },
            WorkerMessage::Log { line } => {
                self.events
                    .publish(PoolEvent::LogUpdate(LogUpdate { slot_id, line }));
                return;
            }
            WorkerMessage::ProgressUpdate { event, data } => {
                let job_id = worker.current_job().map(|j| j.id);
                self.events.publish(PoolEvent::ProgressUpdate(ProgressUpdate {
                    slot_id,
                    job_id,
                    event,
                    data,
                }));
                return;
            }
        };

        let transition = worker.handle(event);
        match transition {
            Transition::StartDeferred(job) => {
                tracing::info!(slot_id, job_id = job.id, "Worker ready, starting deferred job");
                self.start_job(slot_id, job).await;
                self.broadcast_status();
            }
            Transition::DispatchNext => {
                tracing::info!(slot_id, "Worker ready");
                self.broadcast_status();
                self.dispatch().await;
            }
            Transition::Finalize {
                job,
                exit_code,
                report_path,
            } => {
                self.finalize_job(slot_id, job, exit_code, report_path).await;
                self.broadcast_status();
                self.dispatch().await;
            }
            Transition::Ignored(reason) => {
                tracing::warn!(slot_id, reason, "Ignoring worker message");
            }
            Transition::Requeue { .. } | Transition::Removed { .. } => {
                tracing::error!(slot_id, ?transition, "Exit transition produced by a message");
            }
        }
    }

    /// Remove an exited worker and recover whatever job it held.
    pub async fn handle_worker_exit(&mut self, slot_id: SlotId, instance: u64, exit_code: Option<i32>) {
        if !self.is_live(slot_id, instance) {
            tracing::warn!(slot_id, instance, "Exit from unknown worker ignored");
            return;
        }
        let Some(mut worker) = self.workers.remove(&slot_id) else {
            return;
        };
        let terminating = worker.is_terminating();
        let booted = worker.is_booted();

        match worker.handle(SlotEvent::Exited { exit_code }) {
            Transition::Requeue { mut job, started } => {
                if started && job.record {
                    self.stop_recording_after_exit(slot_id, &job).await;
                }

                if self.draining {
                    tracing::info!(slot_id, job_id = job.id, "Job dropped during shutdown");
                } else if terminating {
                    // Bound but never started: an intentional terminate is
                    // not a failed attempt.
                    tracing::info!(slot_id, job_id = job.id, "Unstarted job requeued from terminated worker");
                    job.attempts = job.attempts.saturating_sub(1);
                    self.queue.requeue(job);
                } else if job.attempts >= self.config.max_job_attempts {
                    tracing::warn!(slot_id, job_id = job.id, exit_code = ?exit_code, started, "Worker died holding a job");
                    tracing::error!(job_id = job.id, attempts = job.attempts, "Job abandoned after repeated worker deaths");
                    self.events.publish(PoolEvent::JobAbandoned(JobAbandoned {
                        job_id: job.id,
                        attempts: job.attempts,
                    }));
                } else {
                    tracing::warn!(slot_id, job_id = job.id, exit_code = ?exit_code, started, "Worker died holding a job");
                    self.events.publish(PoolEvent::LogUpdate(LogUpdate {
                        slot_id,
                        line: format!("worker died (exit code {:?}), job {} requeued", exit_code, job.id),
                    }));
                    self.queue.requeue(job);
                }
            }
            Transition::Removed { dropped } => {
                if let Some(job) = dropped {
                    tracing::info!(slot_id, job_id = job.id, "Job dropped with terminated worker");
                    if job.record {
                        self.stop_recording_after_exit(slot_id, &job).await;
                    }
                }
                if !terminating && !booted {
                    tracing::warn!(slot_id, exit_code = ?exit_code, "Worker exited during bring-up");
                } else {
                    tracing::info!(slot_id, exit_code = ?exit_code, "Worker removed");
                }
            }
            other => {
                tracing::error!(slot_id, transition = ?other, "Unexpected exit transition");
            }
        }

        self.broadcast_status();
        self.dispatch().await;
    }

    /// Close the recording of a job whose worker went away mid-run.
    async fn stop_recording_after_exit(&self, slot_id: SlotId, job: &Job) {
        if let Err(e) = self.collaborators.recorder.stop_recording(job, slot_id).await {
            tracing::warn!(slot_id, job_id = job.id, error = %e, "Failed to stop recording after worker exit");
        }
    }

    /// Current pool state, one entry per slot in slot order.
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            slots: self.workers.values().map(Worker::snapshot).collect(),
        }
    }

    pub fn broadcast_status(&self) {
        self.events
            .publish(PoolEvent::WorkerPoolUpdate(self.snapshot()));
    }

    /// Recording (if requested) strictly before START.
    async fn start_job(&mut self, slot_id: SlotId, job: Job) {
        if job.record {
            if let Err(e) = self.collaborators.recorder.start_recording(&job, slot_id).await {
                tracing::warn!(slot_id, job_id = job.id, error = %e, "Failed to start recording");
                self.events.publish(PoolEvent::LogUpdate(LogUpdate {
                    slot_id,
                    line: format!("recording start failed: {}", e),
                }));
            }
        }

        let Some(worker) = self.workers.get(&slot_id) else {
            return;
        };
        if let Err(e) = worker.send(ControlMessage::Start { job }) {
            tracing::warn!(slot_id, error = %e, "Failed to send START");
        }
    }

    /// Recording stop and report persistence strictly after the worker has
    /// reported the job finished. Collaborator failures are only logged.
    async fn finalize_job(
        &mut self,
        slot_id: SlotId,
        job: Job,
        exit_code: i32,
        report_path: Option<PathBuf>,
    ) {
        if job.record {
            match self.collaborators.recorder.stop_recording(&job, slot_id).await {
                Ok(summary) => {
                    tracing::info!(slot_id, job_id = job.id, summary = %summary.summary, "Recording stopped");
                }
                Err(e) => {
                    tracing::warn!(slot_id, job_id = job.id, error = %e, "Failed to stop recording");
                    self.events.publish(PoolEvent::LogUpdate(LogUpdate {
                        slot_id,
                        line: format!("recording stop failed: {}", e),
                    }));
                }
            }
        }

        let report_url = match report_path {
            Some(path) => match self.collaborators.reports.persist_report(&job, &path).await {
                Ok(url) => url,
                Err(e) => {
                    tracing::warn!(slot_id, job_id = job.id, error = %e, "Failed to persist report");
                    self.events.publish(PoolEvent::LogUpdate(LogUpdate {
                        slot_id,
                        line: format!("report persistence failed: {}", e),
                    }));
                    None
                }
            },
            None => None,
        };

        tracing::info!(slot_id, job_id = job.id, exit_code, report_url = ?report_url, "Job finished");
        self.events.publish(PoolEvent::JobFinished(JobFinished {
            slot_id,
            job_id: job.id,
            exit_code,
            report_url,
        }));
    }

    /// With local devices, an idle worker holding a device that a pending
    /// job needs under a different affinity key is shut down to free it.
    fn reclaim_devices(&mut self) {
        if !self.config.reclaim_idle_devices || self.config.device_source != DeviceSource::Local {
            return;
        }

        let mut to_reclaim = Vec::new();
        for job in self.queue.pending_jobs() {
            let key = job.affinity_key(self.config.device_source);
            let Some(serial) = key.device_serial.as_deref() else {
                continue;
            };
            let holder = self.workers.values().find(|w| {
                w.key.device_serial.as_deref() == Some(serial) && w.key != key && w.is_idle()
            });
            if let Some(holder) = holder {
                if !to_reclaim.contains(&holder.id) {
                    tracing::info!(slot_id = holder.id, job_id = job.id, device = serial, "Reclaiming idle device");
                    to_reclaim.push(holder.id);
                }
            }
        }

        for slot_id in to_reclaim {
            if let Err(e) = self.terminate_worker(slot_id) {
                tracing::warn!(slot_id, error = %e, "Failed to reclaim worker");
            }
        }
    }

    /// Terminate every worker, wait for their exits up to the grace period,
    /// then kill whatever is left.
    async fn shutdown(&mut self, worker_events_rx: &mut mpsc::Receiver<WorkerEvent>) {
        self.draining = true;
        let slot_ids: Vec<SlotId> = self.workers.keys().copied().collect();
        tracing::info!(workers = slot_ids.len(), pending = self.queue.len(), "Supervisor draining");
        for slot_id in slot_ids {
            let _ = self.terminate_worker(slot_id);
        }

        let grace = Duration::from_millis(self.config.terminate_grace_ms);
        if !self.drain_exits(worker_events_rx, grace).await {
            tracing::warn!(remaining = self.workers.len(), "Grace period over, killing workers");
            for worker in self.workers.values_mut() {
                worker.kill();
            }
            self.drain_exits(worker_events_rx, KILL_WAIT).await;
        }
        tracing::info!("Supervisor stopped");
    }

    /// Process worker events until every worker is gone. Returns false on
    /// timeout.
    async fn drain_exits(
        &mut self,
        worker_events_rx: &mut mpsc::Receiver<WorkerEvent>,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.workers.is_empty() {
            match tokio::time::timeout_at(deadline, worker_events_rx.recv()).await {
                Ok(Some(event)) => self.handle_worker_event(event).await,
                Ok(None) => return true,
                Err(_) => return false,
            }
        }
        true
    }

    fn is_live(&self, slot_id: SlotId, instance: u64) -> bool {
        self.workers
            .get(&slot_id)
            .is_some_and(|w| w.instance == instance)
    }

    /// Lowest slot id not currently in use.
    fn next_slot_id(&self) -> SlotId {
        (1..SlotId::MAX)
            .find(|id| !self.workers.contains_key(id))
            .unwrap_or(SlotId::MAX)
    }

    fn resolve_workspace(&self, key: &AffinityKey) -> (PathBuf, bool) {
        let workspaces = &self.collaborators.workspaces;
        if workspaces.has_persistent_workspace(&key.branch) {
            (workspaces.persistent_workspace(&key.branch), true)
        } else {
            (workspaces.allocate_ephemeral_workspace(key), false)
        }
    }
}

fn idle_match(workers: &BTreeMap<SlotId, Worker>, key: &AffinityKey) -> Option<SlotId> {
    workers
        .values()
        .find(|w| w.is_idle() && &w.key == key)
        .map(|w| w.id)
}

/// Placement policy: exact-match idle worker first, otherwise a new worker
/// if there is room and the job's device is not held by anyone.
fn placement_for(
    workers: &BTreeMap<SlotId, Worker>,
    config: &PoolConfig,
    job: &Job,
) -> Option<Placement> {
    let key = job.affinity_key(config.device_source);
    if let Some(slot_id) = idle_match(workers, &key) {
        return Some(Placement::Idle(slot_id));
    }

    if workers.len() >= config.max_workers {
        return None;
    }
    let device_taken = key.device_serial.as_ref().is_some_and(|serial| {
        workers
            .values()
            .any(|w| w.key.device_serial.as_ref() == Some(serial))
    });
    if device_taken {
        return None;
    }
    Some(Placement::Spawn)
}

/// Cloneable front door to a running [`Supervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    command_tx: mpsc::Sender<SupervisorCommand>,
    events: EventBus,
}

impl SupervisorHandle {
    pub async fn submit(&self, spec: JobSpec) -> Result<Job> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(SupervisorCommand::Submit { spec, response_tx })
            .await?;
        response_rx.await.map_err(|_| FarmError::SupervisorClosed)?
    }

    pub async fn snapshot(&self) -> Result<PoolSnapshot> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(SupervisorCommand::Snapshot { response_tx }).await?;
        response_rx.await.map_err(|_| FarmError::SupervisorClosed)
    }

    pub async fn pending_jobs(&self) -> Result<Vec<Job>> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(SupervisorCommand::PendingJobs { response_tx })
            .await?;
        response_rx.await.map_err(|_| FarmError::SupervisorClosed)
    }

    pub async fn terminate_worker(&self, slot_id: SlotId) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(SupervisorCommand::TerminateWorker {
            slot_id,
            response_tx,
        })
        .await?;
        response_rx.await.map_err(|_| FarmError::SupervisorClosed)?
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    async fn send(&self, command: SupervisorCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| FarmError::SupervisorClosed)
    }
}
