use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};

use crate::config::WorkerProcessConfig;
use crate::error::{FarmError, Result};
use crate::protocol::{decode_line, write_message, ControlMessage, WorkerMessage};
use crate::scheduler::SlotId;

/// Something that happened to a worker process, as seen by its I/O tasks.
///
/// `instance` identifies one spawn of a slot so events from a previous
/// occupant of a reused slot id can be told apart.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Message {
        slot_id: SlotId,
        instance: u64,
        message: WorkerMessage,
    },
    Exited {
        slot_id: SlotId,
        instance: u64,
        exit_code: Option<i32>,
    },
}

impl WorkerEvent {
    pub fn slot_id(&self) -> SlotId {
        match self {
            WorkerEvent::Message { slot_id, .. } | WorkerEvent::Exited { slot_id, .. } => *slot_id,
        }
    }
}

/// Supervisor end of a live worker: a control channel plus a kill switch.
#[derive(Debug)]
pub struct WorkerLink {
    slot_id: SlotId,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl WorkerLink {
    pub fn new(
        slot_id: SlotId,
        control_tx: mpsc::UnboundedSender<ControlMessage>,
        kill_tx: Option<oneshot::Sender<()>>,
    ) -> Self {
        Self {
            slot_id,
            control_tx,
            kill_tx,
        }
    }

    /// Queue a control message; never blocks.
    pub fn send(&self, message: ControlMessage) -> Result<()> {
        self.control_tx
            .send(message)
            .map_err(|_| FarmError::WorkerUnreachable(self.slot_id))
    }

    /// Force-kill the process. The exit still arrives as a normal event.
    pub fn kill(&mut self) {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
    }
}

/// Starts worker processes. Implementations must install whatever forwards
/// the worker's messages and exit into `events` before returning, so no
/// message can be missed.
pub trait WorkerLauncher: Send + Sync {
    fn launch(
        &self,
        slot_id: SlotId,
        instance: u64,
        events: mpsc::Sender<WorkerEvent>,
    ) -> Result<WorkerLink>;
}

/// Launches `<program> worker ...` as a child process speaking the control
/// protocol over stdin/stdout.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    config: WorkerProcessConfig,
}

impl ProcessLauncher {
    pub fn new(config: WorkerProcessConfig) -> Self {
        Self { config }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(
        &self,
        slot_id: SlotId,
        instance: u64,
        events: mpsc::Sender<WorkerEvent>,
    ) -> Result<WorkerLink> {
        let mut child = Command::new(&self.config.program)
            .arg("worker")
            .args(self.config.commands.to_args())
            .env("RUST_LOG", &self.config.log_filter)
            .env("FARM_SLOT_ID", slot_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(FarmError::Spawn)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| FarmError::Internal("worker stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FarmError::Internal("worker stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| FarmError::Internal("worker stderr not captured".to_string()))?;

        tracing::info!(slot_id, instance, pid = ?child.id(), "Worker process spawned");

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();

        tokio::spawn(write_control(slot_id, stdin, control_rx));
        tokio::spawn(forward_stderr(slot_id, stderr));
        tokio::spawn(watch_process(slot_id, instance, child, stdout, kill_rx, events));

        Ok(WorkerLink::new(slot_id, control_tx, Some(kill_tx)))
    }
}

async fn write_control(
    slot_id: SlotId,
    mut stdin: ChildStdin,
    mut control_rx: mpsc::UnboundedReceiver<ControlMessage>,
) {
    while let Some(message) = control_rx.recv().await {
        tracing::debug!(slot_id, message = message.name(), "Sending control message");
        if let Err(e) = write_message(&mut stdin, &message).await {
            tracing::warn!(slot_id, error = %e, "Failed to write to worker stdin");
            break;
        }
    }
    // Dropping stdin closes the pipe; the worker treats EOF as TERMINATE.
}

async fn forward_stderr(slot_id: SlotId, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "device_farm::worker_stderr", slot_id, "{}", line);
    }
}

/// Forward stdout messages in order, then the exit. Both go through the same
/// task so the exit event is always the last event of an instance.
async fn watch_process(
    slot_id: SlotId,
    instance: u64,
    mut child: Child,
    stdout: ChildStdout,
    mut kill_rx: oneshot::Receiver<()>,
    events: mpsc::Sender<WorkerEvent>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut killed = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match decode_line::<WorkerMessage>(&line) {
                            Ok(message) => {
                                let event = WorkerEvent::Message { slot_id, instance, message };
                                if events.send(event).await.is_err() {
                                    // Supervisor is gone; stop the worker with it.
                                    let _ = child.start_kill();
                                    return;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(slot_id, error = %e, line = %line, "Undecodable worker message");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(slot_id, error = %e, "Failed to read worker stdout");
                        break;
                    }
                }
            }
            // Fires on an explicit kill or when the link is dropped.
            _ = &mut kill_rx, if !killed => {
                killed = true;
                tracing::warn!(slot_id, "Killing worker process");
                let _ = child.start_kill();
            }
        }
    }

    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut kill_rx, if !killed => {
            let _ = child.start_kill();
            child.wait().await
        }
    };

    let exit_code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!(slot_id, error = %e, "Failed to reap worker process");
            None
        }
    };
    tracing::info!(slot_id, instance, exit_code = ?exit_code, "Worker process exited");

    let _ = events
        .send(WorkerEvent::Exited {
            slot_id,
            instance,
            exit_code,
        })
        .await;
}
