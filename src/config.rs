use std::net::SocketAddr;
use std::path::PathBuf;

use crate::scheduler::DeviceSource;

/// Shell commands a worker runs for bring-up, execution and teardown.
///
/// Each command runs as `sh -c <cmd>` inside the workspace with the
/// `FARM_*` environment set. A `None` stage is skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerCommands {
    /// Checkout and dependency install
    pub prepare_workspace: Option<String>,
    /// Take the exclusive device lock
    pub acquire_device: Option<String>,
    /// Start the automation server bound to the device
    pub start_server: Option<String>,
    /// Run one feature; its exit code is the job's result
    pub run_feature: Option<String>,
    pub stop_server: Option<String>,
    pub release_device: Option<String>,
}

impl WorkerCommands {
    /// Render as `device-farm worker` arguments.
    pub fn to_args(&self) -> Vec<String> {
        let flags = [
            ("--prepare-workspace", &self.prepare_workspace),
            ("--acquire-device", &self.acquire_device),
            ("--start-server", &self.start_server),
            ("--run-feature", &self.run_feature),
            ("--stop-server", &self.stop_server),
            ("--release-device", &self.release_device),
        ];

        let mut args = Vec::new();
        for (flag, value) in flags {
            if let Some(cmd) = value {
                args.push(flag.to_string());
                args.push(cmd.clone());
            }
        }
        args
    }
}

/// How the supervisor launches worker processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerProcessConfig {
    /// Binary to execute with the `worker` subcommand
    pub program: PathBuf,
    pub commands: WorkerCommands,
    /// `RUST_LOG` handed to worker processes
    pub log_filter: String,
}

impl Default for WorkerProcessConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("device-farm"),
            commands: WorkerCommands::default(),
            log_filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceConfig {
    /// Long-lived per-branch checkouts, reused when present
    pub persistent_root: PathBuf,
    /// Parent directory for throwaway checkouts
    pub ephemeral_root: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        let base = std::env::temp_dir().join("device-farm");
        Self {
            persistent_root: base.join("persistent"),
            ephemeral_root: base.join("ephemeral"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportConfig {
    pub root: PathBuf,
    /// Prefix of the URLs handed back for stored reports
    pub base_url: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("device-farm").join("reports"),
            base_url: "/reports".to_string(),
        }
    }
}

/// Commands bracketing a recorded job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingConfig {
    pub start_command: String,
    pub stop_command: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Hard ceiling on live worker processes
    pub max_workers: usize,
    pub device_source: DeviceSource,
    /// Dispatches allowed per job before a crashing job is dropped
    pub max_job_attempts: u32,
    /// Terminate idle workers that hold a device a pending job needs
    pub reclaim_idle_devices: bool,
    /// Grace period after TERMINATE before a worker is killed on shutdown
    pub terminate_grace_ms: u64,
    pub worker: WorkerProcessConfig,
    pub workspaces: WorkspaceConfig,
    pub reports: ReportConfig,
    pub recording: Option<RecordingConfig>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            device_source: DeviceSource::Local,
            max_job_attempts: 3,
            reclaim_idle_devices: true,
            terminate_grace_ms: 10_000,
            worker: WorkerProcessConfig::default(),
            workspaces: WorkspaceConfig::default(),
            reports: ReportConfig::default(),
            recording: None,
        }
    }
}

impl PoolConfig {
    pub fn new(max_workers: usize, device_source: DeviceSource) -> Self {
        Self {
            max_workers,
            device_source,
            ..Default::default()
        }
    }

    pub fn with_commands(mut self, commands: WorkerCommands) -> Self {
        self.worker.commands = commands;
        self
    }

    pub fn with_program(mut self, program: PathBuf) -> Self {
        self.worker.program = program;
        self
    }

    pub fn with_recording(mut self, recording: RecordingConfig) -> Self {
        self.recording = Some(recording);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub dashboard_addr: Option<SocketAddr>,
    pub pool: PoolConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            dashboard_addr: Some(SocketAddr::from(([127, 0, 0, 1], 8080))),
            pool: PoolConfig::default(),
        }
    }
}
