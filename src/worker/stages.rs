use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;

use crate::config::WorkerCommands;
use crate::protocol::InitPayload;
use crate::scheduler::Job;

/// Failure of a single bring-up or teardown stage.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("{stage}: failed to spawn: {source}")]
    Spawn {
        stage: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{stage}: exited with {code:?}: {stderr}")]
    Failed {
        stage: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("workspace {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Run `sh -c <cmd>` and return its stdout. A non-zero exit is an error
/// carrying the tail of stderr.
pub async fn run_shell(
    stage: &str,
    cmd: &str,
    cwd: Option<&Path>,
    env: &[(String, String)],
) -> Result<String, StageError> {
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(cmd)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    tracing::info!(stage, cmd, "Running stage");
    let output = command.output().await.map_err(|source| StageError::Spawn {
        stage: stage.to_string(),
        source,
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    for line in stderr.lines() {
        tracing::debug!(stage, "{}", line);
    }

    if !output.status.success() {
        return Err(StageError::Failed {
            stage: stage.to_string(),
            code: output.status.code(),
            stderr: tail(&stderr, 20),
        });
    }
    Ok(stdout)
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// Environment every worker command sees.
pub fn init_env(init: &InitPayload) -> Vec<(String, String)> {
    vec![
        ("FARM_BRANCH".to_string(), init.branch.clone()),
        ("FARM_CLIENT".to_string(), init.client.clone()),
        (
            "FARM_WORKSPACE".to_string(),
            init.workspace_path.display().to_string(),
        ),
        (
            "FARM_PERSISTENT_WORKSPACE".to_string(),
            init.is_persistent.to_string(),
        ),
        ("FARM_APK".to_string(), init.apk_ref.identifier.clone()),
        ("FARM_APK_SOURCE".to_string(), init.apk_ref.source.to_string()),
        (
            "FARM_DEVICE_SERIAL".to_string(),
            init.device_serial.clone().unwrap_or_default(),
        ),
        ("FARM_QUICK_TEST".to_string(), init.quick_test.to_string()),
    ]
}

/// [`init_env`] plus the per-job variables.
pub fn job_env(init: &InitPayload, job: &Job, report_path: &Path) -> Vec<(String, String)> {
    let mut env = init_env(init);
    env.extend([
        ("FARM_JOB_ID".to_string(), job.id.to_string()),
        ("FARM_FEATURE".to_string(), job.feature.clone()),
        ("FARM_RECORD".to_string(), job.record.to_string()),
        (
            "FARM_REPORT_PATH".to_string(),
            report_path.display().to_string(),
        ),
    ]);
    env
}

/// How far bring-up got, so teardown only undoes what was done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageProgress {
    pub workspace_ready: bool,
    pub device_acquired: bool,
    pub server_started: bool,
}

/// Ordered bring-up: locate the workspace, prepare it, lock the device,
/// start the automation server. Stops at the first failure.
pub async fn bring_up(
    commands: &WorkerCommands,
    init: &InitPayload,
    progress: &mut StageProgress,
) -> Result<(), StageError> {
    let workspace = init.workspace_path.as_path();
    let env = init_env(init);

    tokio::fs::create_dir_all(workspace)
        .await
        .map_err(|source| StageError::Workspace {
            path: workspace.to_path_buf(),
            source,
        })?;
    progress.workspace_ready = true;

    if let Some(cmd) = &commands.prepare_workspace {
        run_shell("prepare-workspace", cmd, Some(workspace), &env).await?;
    }
    if let Some(cmd) = &commands.acquire_device {
        run_shell("acquire-device", cmd, Some(workspace), &env).await?;
    }
    progress.device_acquired = true;
    if let Some(cmd) = &commands.start_server {
        run_shell("start-server", cmd, Some(workspace), &env).await?;
    }
    progress.server_started = true;

    Ok(())
}

/// Reverse of [`bring_up`]. Every step is best-effort; failures are logged
/// and the next step still runs.
pub async fn tear_down(commands: &WorkerCommands, init: &InitPayload, progress: StageProgress) {
    let workspace = init.workspace_path.as_path();
    let cwd = workspace.is_dir().then_some(workspace);
    let env = init_env(init);

    if progress.server_started {
        if let Some(cmd) = &commands.stop_server {
            if let Err(e) = run_shell("stop-server", cmd, cwd, &env).await {
                tracing::warn!(error = %e, "Teardown stage failed");
            }
        }
    }
    if progress.device_acquired {
        if let Some(cmd) = &commands.release_device {
            if let Err(e) = run_shell("release-device", cmd, cwd, &env).await {
                tracing::warn!(error = %e, "Teardown stage failed");
            }
        }
    }
    if progress.workspace_ready && !init.is_persistent {
        match tokio::fs::remove_dir_all(workspace).await {
            Ok(()) => tracing::info!(workspace = %workspace.display(), "Ephemeral workspace removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(workspace = %workspace.display(), error = %e, "Failed to remove workspace"),
        }
    }
}
