use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::protocol::{write_message, InitPayload, WorkerMessage};
use crate::scheduler::Job;
use crate::worker::stages::job_env;

/// Prefix of a stdout line carrying a structured progress event.
pub const PROGRESS_PREFIX: &str = "@@progress ";

/// Exit code reported when the test process could not run or was killed.
pub const EXECUTION_FAILED: i32 = -1;

/// Result of one feature run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub report_path: Option<PathBuf>,
    /// The run was cut short by a terminate request.
    pub cancelled: bool,
}

/// Runs one feature at a time with the configured `run-feature` command,
/// streaming its output back over the control protocol as it happens.
#[derive(Debug, Clone)]
pub struct FeatureExecutor {
    command: Option<String>,
}

impl FeatureExecutor {
    pub fn new(command: Option<String>) -> Self {
        Self { command }
    }

    /// Where the run is expected to write its report.
    pub fn report_path(workspace: &Path, job: &Job) -> PathBuf {
        workspace
            .join(".farm-reports")
            .join(format!("job-{}.json", job.id))
    }

    /// Execute `job`, writing `LOG` and `PROGRESS_UPDATE` messages to `out`.
    ///
    /// Cancelling `cancel` kills the test process.
    pub async fn execute<W>(
        &self,
        init: &InitPayload,
        job: &Job,
        out: &mut W,
        cancel: &CancellationToken,
    ) -> ExecutionResult
    where
        W: AsyncWrite + Unpin,
    {
        let Some(command) = &self.command else {
            send(out, log_line("no run-feature command configured")).await;
            return failed();
        };

        let workspace = init.workspace_path.as_path();
        let report_path = Self::report_path(workspace, job);
        if let Some(dir) = report_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                tracing::warn!(job_id = job.id, error = %e, "Failed to create report directory");
            }
        }
        // A stale report from a previous run must not be mistaken for this one's.
        let _ = tokio::fs::remove_file(&report_path).await;

        tracing::info!(job_id = job.id, feature = %job.feature, "Executing feature");

        let spawned = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(workspace)
            .envs(job_env(init, job, &report_path))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(job_id = job.id, error = %e, "Failed to spawn test process");
                send(out, log_line(&format!("failed to start test process: {}", e))).await;
                return failed();
            }
        };

        let mut stdout = child.stdout.take().map(OutputLines::new);
        let mut stderr = child.stderr.take().map(OutputLines::new);
        let mut cancelled = false;

        while stdout.is_some() || stderr.is_some() {
            tokio::select! {
                line = next_line(&mut stdout), if stdout.is_some() => match line {
                    Some(line) => send(out, classify_stdout(line)).await,
                    None => stdout = None,
                },
                line = next_line(&mut stderr), if stderr.is_some() => match line {
                    Some(line) => send(out, log_line(&line)).await,
                    None => stderr = None,
                },
                _ = cancel.cancelled() => {
                    tracing::warn!(job_id = job.id, "Killing test process");
                    cancelled = true;
                    let _ = child.start_kill();
                    // Grandchildren may keep the pipes open; stop reading.
                    break;
                }
            }
        }

        let status = if cancelled {
            child.wait().await
        } else {
            tokio::select! {
                status = child.wait() => status,
                _ = cancel.cancelled() => {
                    cancelled = true;
                    let _ = child.start_kill();
                    child.wait().await
                }
            }
        };
        let exit_code = match status {
            Ok(status) => status.code().unwrap_or(EXECUTION_FAILED),
            Err(e) => {
                tracing::error!(job_id = job.id, error = %e, "Failed to wait for test process");
                EXECUTION_FAILED
            }
        };
        let exit_code = if cancelled { EXECUTION_FAILED } else { exit_code };

        let report_path = if report_path.is_file() {
            Some(report_path)
        } else {
            None
        };

        tracing::info!(
            job_id = job.id,
            exit_code,
            cancelled,
            report = ?report_path,
            "Feature completed"
        );

        ExecutionResult {
            exit_code,
            report_path,
            cancelled,
        }
    }
}

/// Line reader over raw test output. Bytes that are not UTF-8 are replaced
/// rather than ending the stream.
struct OutputLines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> OutputLines<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    /// Cancel safe: a partially read line stays in `buf` for the next call.
    async fn next_line(&mut self) -> Option<String> {
        match self.reader.read_until(b'\n', &mut self.buf).await {
            Ok(0) if self.buf.is_empty() => None,
            Ok(_) => {
                let line = decode_output_line(&self.buf);
                self.buf.clear();
                Some(line)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read test output");
                None
            }
        }
    }
}

fn decode_output_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

async fn next_line<R: AsyncRead + Unpin>(lines: &mut Option<OutputLines<R>>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await,
        None => None,
    }
}

/// A `@@progress` line becomes a progress event; anything else is a log line.
pub fn classify_stdout(line: String) -> WorkerMessage {
    let Some(raw) = line.strip_prefix(PROGRESS_PREFIX) else {
        return WorkerMessage::Log { line };
    };
    let parsed: Option<serde_json::Value> = serde_json::from_str(raw).ok();
    let event = parsed
        .as_ref()
        .and_then(|v| v.get("event"))
        .and_then(|e| e.as_str())
        .map(str::to_string);

    match (event, parsed) {
        (Some(event), Some(mut value)) => WorkerMessage::ProgressUpdate {
            event,
            data: value
                .get_mut("data")
                .map(serde_json::Value::take)
                .unwrap_or(serde_json::Value::Null),
        },
        _ => WorkerMessage::Log { line },
    }
}

fn log_line(line: &str) -> WorkerMessage {
    WorkerMessage::Log {
        line: line.to_string(),
    }
}

fn failed() -> ExecutionResult {
    ExecutionResult {
        exit_code: EXECUTION_FAILED,
        report_path: None,
        cancelled: false,
    }
}

async fn send<W: AsyncWrite + Unpin>(out: &mut W, message: WorkerMessage) {
    if let Err(e) = write_message(out, &message).await {
        tracing::warn!(error = %e, message = message.name(), "Failed to write to supervisor");
    }
}
