use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::pool::WorkerStatus;
use crate::scheduler::{Job, JobId, SlotId};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStarted {
    pub slot_id: SlotId,
    pub job_id: JobId,
    pub feature: String,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogUpdate {
    pub slot_id: SlotId,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub slot_id: SlotId,
    pub job_id: Option<JobId>,
    pub event: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFinished {
    pub slot_id: SlotId,
    pub job_id: JobId,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAbandoned {
    pub job_id: JobId,
    pub attempts: u32,
}

/// One pool slot as seen by observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotSnapshot {
    pub slot_id: SlotId,
    pub status: WorkerStatus,
    pub branch: String,
    pub client: String,
    pub apk_identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_serial: Option<String>,
    pub terminating: bool,
    pub workspace_path: PathBuf,
    pub persistent_workspace: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub job: Option<Job>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub slots: Vec<SlotSnapshot>,
}

impl PoolSnapshot {
    pub fn slot(&self, slot_id: SlotId) -> Option<&SlotSnapshot> {
        self.slots.iter().find(|s| s.slot_id == slot_id)
    }
}

/// Observer-facing events emitted by the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    JobStarted(JobStarted),
    LogUpdate(LogUpdate),
    ProgressUpdate(ProgressUpdate),
    JobFinished(JobFinished),
    WorkerPoolUpdate(PoolSnapshot),
    JobAbandoned(JobAbandoned),
}

impl PoolEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PoolEvent::JobStarted(_) => "job_started",
            PoolEvent::LogUpdate(_) => "log_update",
            PoolEvent::ProgressUpdate(_) => "progress_update",
            PoolEvent::JobFinished(_) => "job_finished",
            PoolEvent::WorkerPoolUpdate(_) => "worker_pool_update",
            PoolEvent::JobAbandoned(_) => "job_abandoned",
        }
    }
}

/// Fan-out of pool events. Publishing never blocks; observers that fall
/// behind lose the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PoolEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: PoolEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_are_tagged_snake_case() {
        let event = PoolEvent::JobFinished(JobFinished {
            slot_id: 2,
            job_id: 9,
            exit_code: 0,
            report_url: None,
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"event": "job_finished", "slotId": 2, "jobId": 9, "exitCode": 0})
        );
        assert_eq!(event.name(), "job_finished");
    }

    #[tokio::test]
    async fn bus_delivers_to_subscribers() {
        let bus = EventBus::new();
        bus.publish(PoolEvent::JobAbandoned(JobAbandoned { job_id: 1, attempts: 3 }));

        let mut rx = bus.subscribe();
        bus.publish(PoolEvent::LogUpdate(LogUpdate {
            slot_id: 1,
            line: "hello".to_string(),
        }));
        match rx.recv().await.unwrap() {
            PoolEvent::LogUpdate(update) => assert_eq!(update.line, "hello"),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
