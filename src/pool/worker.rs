use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::events::SlotSnapshot;
use crate::pool::launcher::WorkerLink;
use crate::pool::machine::{SlotEvent, SlotMachine, Transition, WorkerStatus};
use crate::protocol::ControlMessage;
use crate::scheduler::{AffinityKey, Job, SlotId};

/// A live worker process and what it is bound to.
///
/// The affinity key is fixed at creation; a worker is never repurposed for
/// another branch, client, APK or device.
#[derive(Debug)]
pub struct Worker {
    pub id: SlotId,
    pub instance: u64,
    pub key: AffinityKey,
    pub workspace: PathBuf,
    pub persistent: bool,
    pub created_at: DateTime<Utc>,
    machine: SlotMachine,
    link: WorkerLink,
}

impl Worker {
    pub fn new(
        id: SlotId,
        instance: u64,
        key: AffinityKey,
        workspace: PathBuf,
        persistent: bool,
        link: WorkerLink,
    ) -> Self {
        Self {
            id,
            instance,
            key,
            workspace,
            persistent,
            created_at: Utc::now(),
            machine: SlotMachine::new(),
            link,
        }
    }

    pub fn status(&self) -> WorkerStatus {
        self.machine.status()
    }

    pub fn current_job(&self) -> Option<&Job> {
        self.machine.current_job()
    }

    pub fn is_idle(&self) -> bool {
        self.machine.is_idle()
    }

    pub fn is_booted(&self) -> bool {
        self.machine.is_booted()
    }

    pub fn is_terminating(&self) -> bool {
        self.machine.is_terminating()
    }

    pub fn bind(&mut self, job: Job) -> std::result::Result<bool, Job> {
        self.machine.bind(job)
    }

    pub fn handle(&mut self, event: SlotEvent) -> Transition {
        self.machine.handle(event)
    }

    pub fn mark_terminating(&mut self) {
        self.machine.mark_terminating();
    }

    pub fn send(&self, message: ControlMessage) -> Result<()> {
        self.link.send(message)
    }

    pub fn kill(&mut self) {
        self.link.kill();
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            slot_id: self.id,
            status: self.status(),
            branch: self.key.branch.clone(),
            client: self.key.client.clone(),
            apk_identifier: self.key.apk_identifier.clone(),
            device_serial: self.key.device_serial.clone(),
            terminating: self.is_terminating(),
            workspace_path: self.workspace.clone(),
            persistent_workspace: self.persistent,
            created_at: self.created_at,
            job: self.current_job().cloned(),
        }
    }
}
