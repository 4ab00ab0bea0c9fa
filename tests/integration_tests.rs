//! End-to-end tests running real worker processes.
//!
//! Each test launches the `device-farm` binary as workers under a live
//! supervisor and drives jobs through shell stage commands.


use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use device_farm::config::{PoolConfig, ReportConfig, WorkerCommands, WorkspaceConfig};
use device_farm::events::{EventBus, PoolEvent};
use device_farm::pool::{Collaborators, ProcessLauncher, Supervisor, SupervisorHandle};
use device_farm::scheduler::DeviceSource;
use test_harness::{assert_eventually, next_matching, spec};

const EVENT_TIMEOUT: Duration = Duration::from_secs(30);

struct Farm {
    handle: SupervisorHandle,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
    dir: TempDir,
}

impl Farm {
    fn start(commands: WorkerCommands, max_job_attempts: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PoolConfig::new(2, DeviceSource::Remote)
            .with_program(PathBuf::from(env!("CARGO_BIN_EXE_device-farm")))
            .with_commands(commands);
        config.max_job_attempts = max_job_attempts;
        config.terminate_grace_ms = 5_000;
        config.workspaces = WorkspaceConfig {
            persistent_root: dir.path().join("persistent"),
            ephemeral_root: dir.path().join("ephemeral"),
        };
        config.reports = ReportConfig {
            root: dir.path().join("reports"),
            base_url: "/reports".to_string(),
        };

        let launcher = Arc::new(ProcessLauncher::new(config.worker.clone()));
        let collaborators = Collaborators::from_config(&config);
        let (supervisor, worker_events_rx) =
            Supervisor::new(config, launcher, collaborators, EventBus::new());
        let shutdown = CancellationToken::new();
        let (handle, task) = supervisor.spawn(worker_events_rx, shutdown.clone());

        Self {
            handle,
            shutdown,
            task,
            dir,
        }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(20), self.task)
            .await
            .expect("supervisor stopped")
            .unwrap();
    }
}

fn commands(run_feature: &str) -> WorkerCommands {
    WorkerCommands {
        run_feature: Some(run_feature.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_job_runs_to_completion() {
    let farm = Farm::start(commands("echo running $FARM_FEATURE"), 3);
    let mut events = farm.handle.subscribe();

    let job = farm
        .handle
        .submit(spec("main", "c1", "v1", "login.feature"))
        .await
        .unwrap();

    let line = next_matching(&mut events, EVENT_TIMEOUT, |e| match e {
        PoolEvent::LogUpdate(log) if log.line.starts_with("running") => Some(log.line.clone()),
        _ => None,
    })
    .await;
    assert_eq!(line, "running login.feature");

    let finished = next_matching(&mut events, EVENT_TIMEOUT, |e| match e {
        PoolEvent::JobFinished(f) => Some(f.clone()),
        _ => None,
    })
    .await;
    assert_eq!(finished.job_id, job.id);
    assert_eq!(finished.exit_code, 0);
    assert!(finished.report_url.is_none());

    farm.stop().await;
}

#[tokio::test]
async fn test_failing_feature_reports_exit_code() {
    let farm = Farm::start(commands("exit 3"), 3);
    let mut events = farm.handle.subscribe();

    farm.handle
        .submit(spec("main", "c1", "v1", "login.feature"))
        .await
        .unwrap();

    let exit_code = next_matching(&mut events, EVENT_TIMEOUT, |e| match e {
        PoolEvent::JobFinished(f) => Some(f.exit_code),
        _ => None,
    })
    .await;
    assert_eq!(exit_code, 3);

    farm.stop().await;
}

#[tokio::test]
async fn test_report_is_stored() {
    let farm = Farm::start(commands("echo '[]' > \"$FARM_REPORT_PATH\""), 3);
    let mut events = farm.handle.subscribe();

    let job = farm
        .handle
        .submit(spec("main", "c1", "v1", "login.feature"))
        .await
        .unwrap();

    let url = next_matching(&mut events, EVENT_TIMEOUT, |e| match e {
        PoolEvent::JobFinished(f) => Some(f.report_url.clone()),
        _ => None,
    })
    .await;

    let file_name = format!("job-{}.json", job.id);
    assert_eq!(url, Some(format!("/reports/{}/{}", job.id, file_name)));
    let stored = farm
        .path()
        .join("reports")
        .join(job.id.to_string())
        .join(&file_name);
    assert!(stored.is_file());

    farm.stop().await;
}

#[tokio::test]
async fn test_worker_reused_for_matching_jobs() {
    let farm = Farm::start(commands("true"), 3);
    let mut events = farm.handle.subscribe();

    let mut slots = Vec::new();
    for feature in ["a.feature", "b.feature"] {
        farm.handle
            .submit(spec("main", "c1", "v1", feature))
            .await
            .unwrap();
        let slot_id = next_matching(&mut events, EVENT_TIMEOUT, |e| match e {
            PoolEvent::JobFinished(f) => Some(f.slot_id),
            _ => None,
        })
        .await;
        slots.push(slot_id);
    }

    assert_eq!(slots, vec![1, 1]);
    assert_eq!(farm.handle.snapshot().await.unwrap().slots.len(), 1);

    farm.stop().await;
}

#[tokio::test]
async fn test_crashing_worker_abandons_job() {
    // Killing the worker process mid-job looks like a crash to the supervisor.
    let farm = Farm::start(commands("kill -9 $PPID"), 1);
    let mut events = farm.handle.subscribe();

    let job = farm
        .handle
        .submit(spec("main", "c1", "v1", "login.feature"))
        .await
        .unwrap();

    let abandoned = next_matching(&mut events, EVENT_TIMEOUT, |e| match e {
        PoolEvent::JobAbandoned(a) => Some(a.clone()),
        _ => None,
    })
    .await;
    assert_eq!(abandoned.job_id, job.id);
    assert_eq!(abandoned.attempts, 1);

    let handle = farm.handle.clone();
    assert_eventually(
        || {
            let handle = handle.clone();
            async move {
                handle
                    .snapshot()
                    .await
                    .map(|s| s.slots.is_empty())
                    .unwrap_or(false)
            }
        },
        Duration::from_secs(5),
        "Crashed worker should leave the pool",
    )
    .await;

    farm.stop().await;
}

#[tokio::test]
async fn test_bring_up_failure_requeues_then_abandons() {
    let farm = Farm::start(
        WorkerCommands {
            prepare_workspace: Some("exit 4".to_string()),
            run_feature: Some("true".to_string()),
            ..Default::default()
        },
        2,
    );
    let mut events = farm.handle.subscribe();

    farm.handle
        .submit(spec("main", "c1", "v1", "login.feature"))
        .await
        .unwrap();

    let attempts = next_matching(&mut events, EVENT_TIMEOUT, |e| match e {
        PoolEvent::JobAbandoned(a) => Some(a.attempts),
        _ => None,
    })
    .await;
    assert_eq!(attempts, 2);

    farm.stop().await;
}

#[tokio::test]
async fn test_shutdown_tears_down_workers() {
    let marker_dir = tempfile::tempdir().unwrap();
    let marker = marker_dir.path().join("released");
    let farm = Farm::start(
        WorkerCommands {
            run_feature: Some("true".to_string()),
            release_device: Some(format!("touch '{}'", marker.display())),
            ..Default::default()
        },
        3,
    );
    let mut events = farm.handle.subscribe();

    farm.handle
        .submit(spec("main", "c1", "v1", "login.feature"))
        .await
        .unwrap();
    next_matching(&mut events, EVENT_TIMEOUT, |e| match e {
        PoolEvent::JobFinished(f) => Some(f.job_id),
        _ => None,
    })
    .await;

    farm.stop().await;
    assert!(marker.is_file());
}
