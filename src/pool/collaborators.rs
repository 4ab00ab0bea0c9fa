//! Capabilities the supervisor consumes but does not own: network-mock
//! recording around a job, report persistence, and workspace resolution.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::{PoolConfig, RecordingConfig, ReportConfig, WorkspaceConfig};
use crate::error::{FarmError, Result};
use crate::scheduler::{AffinityKey, Job, SlotId};
use crate::worker::stages::run_shell;

/// Outcome of a recording session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordingSummary {
    pub summary: String,
}

#[async_trait]
pub trait Recorder: Send + Sync {
    async fn start_recording(&self, job: &Job, slot_id: SlotId) -> Result<()>;
    async fn stop_recording(&self, job: &Job, slot_id: SlotId) -> Result<RecordingSummary>;
}

#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Persist a raw report and return where it can be fetched from, or
    /// `None` when there was nothing to keep.
    async fn persist_report(&self, job: &Job, raw_report: &Path) -> Result<Option<String>>;
}

pub trait WorkspaceResolver: Send + Sync {
    fn has_persistent_workspace(&self, branch: &str) -> bool;
    fn persistent_workspace(&self, branch: &str) -> PathBuf;
    fn allocate_ephemeral_workspace(&self, key: &AffinityKey) -> PathBuf;
}

/// The supervisor's set of collaborators.
#[derive(Clone)]
pub struct Collaborators {
    pub recorder: Arc<dyn Recorder>,
    pub reports: Arc<dyn ReportStore>,
    pub workspaces: Arc<dyn WorkspaceResolver>,
}

impl Collaborators {
    pub fn from_config(config: &PoolConfig) -> Self {
        let recorder: Arc<dyn Recorder> = match &config.recording {
            Some(recording) => Arc::new(CommandRecorder::new(recording.clone())),
            None => Arc::new(NoopRecorder),
        };
        Self {
            recorder,
            reports: Arc::new(FsReportStore::new(config.reports.clone())),
            workspaces: Arc::new(DirWorkspaces::new(config.workspaces.clone())),
        }
    }
}

/// Used when no recording service is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecorder;

#[async_trait]
impl Recorder for NoopRecorder {
    async fn start_recording(&self, job: &Job, slot_id: SlotId) -> Result<()> {
        tracing::debug!(job_id = job.id, slot_id, "Recording requested but no recorder configured");
        Ok(())
    }

    async fn stop_recording(&self, _job: &Job, _slot_id: SlotId) -> Result<RecordingSummary> {
        Ok(RecordingSummary::default())
    }
}

/// Brackets a job with shell commands that drive the recording service.
#[derive(Debug, Clone)]
pub struct CommandRecorder {
    config: RecordingConfig,
}

impl CommandRecorder {
    pub fn new(config: RecordingConfig) -> Self {
        Self { config }
    }

    fn env(job: &Job, slot_id: SlotId) -> Vec<(String, String)> {
        vec![
            ("FARM_SLOT_ID".to_string(), slot_id.to_string()),
            ("FARM_JOB_ID".to_string(), job.id.to_string()),
            ("FARM_FEATURE".to_string(), job.feature.clone()),
            ("FARM_BRANCH".to_string(), job.branch.clone()),
            ("FARM_CLIENT".to_string(), job.client.clone()),
            (
                "FARM_DEVICE_SERIAL".to_string(),
                job.device_serial.clone().unwrap_or_default(),
            ),
        ]
    }
}

#[async_trait]
impl Recorder for CommandRecorder {
    async fn start_recording(&self, job: &Job, slot_id: SlotId) -> Result<()> {
        run_shell(
            "start-recording",
            &self.config.start_command,
            None,
            &Self::env(job, slot_id),
        )
        .await
        .map_err(|e| FarmError::Collaborator(e.to_string()))?;
        tracing::info!(job_id = job.id, slot_id, "Recording started");
        Ok(())
    }

    async fn stop_recording(&self, job: &Job, slot_id: SlotId) -> Result<RecordingSummary> {
        let stdout = run_shell(
            "stop-recording",
            &self.config.stop_command,
            None,
            &Self::env(job, slot_id),
        )
        .await
        .map_err(|e| FarmError::Collaborator(e.to_string()))?;
        Ok(RecordingSummary {
            summary: stdout.trim().to_string(),
        })
    }
}

/// Copies reports under `<root>/<job id>/` and serves them from `base_url`.
#[derive(Debug, Clone)]
pub struct FsReportStore {
    config: ReportConfig,
}

impl FsReportStore {
    pub fn new(config: ReportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ReportStore for FsReportStore {
    async fn persist_report(&self, job: &Job, raw_report: &Path) -> Result<Option<String>> {
        if !tokio::fs::try_exists(raw_report).await? {
            tracing::warn!(job_id = job.id, path = %raw_report.display(), "Report file missing");
            return Ok(None);
        }

        let file_name = raw_report
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "report".to_string());
        let dest_dir = self.config.root.join(job.id.to_string());
        tokio::fs::create_dir_all(&dest_dir).await?;
        tokio::fs::copy(raw_report, dest_dir.join(&file_name)).await?;

        let url = format!(
            "{}/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            job.id,
            file_name
        );
        tracing::info!(job_id = job.id, url = %url, "Report stored");
        Ok(Some(url))
    }
}

/// Workspaces laid out as directories: one persistent checkout per branch,
/// plus uniquely named throwaway ones.
#[derive(Debug, Clone)]
pub struct DirWorkspaces {
    config: WorkspaceConfig,
}

impl DirWorkspaces {
    pub fn new(config: WorkspaceConfig) -> Self {
        Self { config }
    }
}

impl WorkspaceResolver for DirWorkspaces {
    fn has_persistent_workspace(&self, branch: &str) -> bool {
        self.persistent_workspace(branch).is_dir()
    }

    fn persistent_workspace(&self, branch: &str) -> PathBuf {
        self.config.persistent_root.join(sanitize(branch))
    }

    fn allocate_ephemeral_workspace(&self, key: &AffinityKey) -> PathBuf {
        self.config.ephemeral_root.join(format!(
            "{}-{}-{}",
            sanitize(&key.branch),
            sanitize(&key.client),
            Uuid::new_v4().simple()
        ))
    }
}

/// Make a branch or client name safe to use as one path component.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
