//! Control protocol between the supervisor and a worker process.
//!
//! Messages travel as newline-delimited JSON over the worker's stdin
//! (supervisor → worker) and stdout (worker → supervisor). Each message is
//! internally tagged on `"type"`:
//!
//! ```text
//! supervisor                         worker
//!     │ ── INIT ──────────────────────→ │  staged bring-up
//!     │ ←───────────────────── READY ── │
//!     │ ── START{job} ────────────────→ │  run feature
//!     │ ←──────────── LOG / PROGRESS ── │
//!     │ ←──────── READY_FOR_NEXT_JOB ── │
//!     │ ── TERMINATE ─────────────────→ │  teardown, exit
//! ```

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::Result;
use crate::scheduler::{AffinityKey, ApkSource, Job};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApkRef {
    pub identifier: String,
    pub source: ApkSource,
}

/// Everything a worker needs for bring-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitPayload {
    pub branch: String,
    pub client: String,
    pub workspace_path: PathBuf,
    pub is_persistent: bool,
    pub apk_ref: ApkRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_serial: Option<String>,
    #[serde(default)]
    pub quick_test: bool,
}

impl InitPayload {
    pub fn new(key: &AffinityKey, workspace_path: PathBuf, is_persistent: bool) -> Self {
        Self {
            branch: key.branch.clone(),
            client: key.client.clone(),
            workspace_path,
            is_persistent,
            apk_ref: ApkRef {
                identifier: key.apk_identifier.clone(),
                source: key.apk_source,
            },
            device_serial: key.device_serial.clone(),
            quick_test: false,
        }
    }
}

/// Supervisor → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    Init(InitPayload),
    Start { job: Job },
    Terminate,
}

impl ControlMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::Init(_) => "INIT",
            ControlMessage::Start { .. } => "START",
            ControlMessage::Terminate => "TERMINATE",
        }
    }
}

/// Worker → supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    Ready,
    ReadyForNextJob {
        #[serde(rename = "exitCode")]
        exit_code: i32,
        #[serde(rename = "reportPath", default, skip_serializing_if = "Option::is_none")]
        report_path: Option<PathBuf>,
    },
    Log {
        line: String,
    },
    ProgressUpdate {
        event: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

impl WorkerMessage {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerMessage::Ready => "READY",
            WorkerMessage::ReadyForNextJob { .. } => "READY_FOR_NEXT_JOB",
            WorkerMessage::Log { .. } => "LOG",
            WorkerMessage::ProgressUpdate { .. } => "PROGRESS_UPDATE",
        }
    }
}

/// Encode a message as a single JSON line, including the trailing newline.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T> {
    Ok(serde_json::from_str(line.trim_end())?)
}

/// Write one message and flush, so the peer sees it immediately.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let line = encode_line(message)?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::JobSpec;
    use serde_json::json;

    #[test]
    fn message_tags_match_wire_names() {
        let ready = serde_json::to_value(WorkerMessage::Ready).unwrap();
        assert_eq!(ready, json!({"type": "READY"}));

        let done = serde_json::to_value(WorkerMessage::ReadyForNextJob {
            exit_code: 1,
            report_path: Some(PathBuf::from("/tmp/report.json")),
        })
        .unwrap();
        assert_eq!(
            done,
            json!({"type": "READY_FOR_NEXT_JOB", "exitCode": 1, "reportPath": "/tmp/report.json"})
        );

        let terminate = serde_json::to_value(ControlMessage::Terminate).unwrap();
        assert_eq!(terminate, json!({"type": "TERMINATE"}));
    }

    #[test]
    fn init_payload_is_camel_case() {
        let job = Job::from_spec(1, JobSpec::new("main", "c1", "a.feature", "v1").with_device("emu-1"));
        let key = job.affinity_key(crate::scheduler::DeviceSource::Local);
        let init = ControlMessage::Init(InitPayload::new(&key, PathBuf::from("/ws/main"), true));
        let value = serde_json::to_value(&init).unwrap();
        assert_eq!(value["type"], "INIT");
        assert_eq!(value["workspacePath"], "/ws/main");
        assert_eq!(value["isPersistent"], true);
        assert_eq!(value["apkRef"]["identifier"], "v1");
        assert_eq!(value["deviceSerial"], "emu-1");
    }

    #[test]
    fn decode_accepts_missing_optional_fields() {
        let msg: WorkerMessage = decode_line("{\"type\":\"READY_FOR_NEXT_JOB\",\"exitCode\":0}\n").unwrap();
        assert_eq!(
            msg,
            WorkerMessage::ReadyForNextJob {
                exit_code: 0,
                report_path: None
            }
        );

        let progress: WorkerMessage =
            decode_line(r#"{"type":"PROGRESS_UPDATE","event":"step"}"#).unwrap();
        assert_eq!(progress.name(), "PROGRESS_UPDATE");
    }

    #[test]
    fn decode_rejects_unknown_type() {
        assert!(decode_line::<ControlMessage>(r#"{"type":"REBOOT"}"#).is_err());
    }

    #[test]
    fn encoded_line_ends_with_newline() {
        let line = encode_line(&WorkerMessage::Log {
            line: "hello".to_string(),
        })
        .unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }
}
