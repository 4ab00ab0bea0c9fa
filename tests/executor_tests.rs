use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use device_farm::protocol::{decode_line, InitPayload, WorkerMessage};
use device_farm::scheduler::{AffinityKey, ApkSource, Job, JobSpec};
use device_farm::worker::FeatureExecutor;

fn test_init(workspace: &Path) -> InitPayload {
    let key = AffinityKey {
        branch: "main".to_string(),
        client: "c1".to_string(),
        apk_identifier: "v1".to_string(),
        apk_source: ApkSource::Registry,
        device_serial: None,
    };
    InitPayload::new(&key, workspace.to_path_buf(), false)
}

fn test_job(id: u64) -> Job {
    Job::from_spec(id, JobSpec::new("main", "c1", "login.feature", "v1"))
}

fn decode_all(out: &[u8]) -> Vec<WorkerMessage> {
    String::from_utf8_lossy(out)
        .lines()
        .map(|line| decode_line(line).unwrap())
        .collect()
}

/// Run `command` for job 1 in a fresh workspace and return the result and
/// the messages written.
async fn run(command: &str) -> (device_farm::worker::ExecutionResult, Vec<WorkerMessage>) {
    let dir = tempfile::tempdir().unwrap();
    let executor = FeatureExecutor::new(Some(command.to_string()));
    let mut out = Vec::new();

    let result = executor
        .execute(&test_init(dir.path()), &test_job(1), &mut out, &CancellationToken::new())
        .await;

    (result, decode_all(&out))
}

#[tokio::test]
async fn test_execute_streams_stdout_as_log() {
    let (result, messages) = run("echo hello; echo world").await;

    assert_eq!(result.exit_code, 0);
    assert!(!result.cancelled);
    assert!(result.report_path.is_none());
    assert_eq!(
        messages,
        vec![
            WorkerMessage::Log {
                line: "hello".to_string()
            },
            WorkerMessage::Log {
                line: "world".to_string()
            },
        ]
    );
}

#[tokio::test]
async fn test_execute_forwards_stderr() {
    let (result, messages) = run("echo broken >&2; exit 2").await;

    assert_eq!(result.exit_code, 2);
    assert_eq!(
        messages,
        vec![WorkerMessage::Log {
            line: "broken".to_string()
        }]
    );
}

#[tokio::test]
async fn test_execute_large_output() {
    let (result, messages) = run("seq 1 1000").await;

    assert_eq!(result.exit_code, 0);
    assert_eq!(messages.len(), 1000);
    assert_eq!(
        messages.last(),
        Some(&WorkerMessage::Log {
            line: "1000".to_string()
        })
    );
}

#[tokio::test]
async fn test_execute_survives_invalid_utf8_output() {
    let (result, messages) =
        run(r"printf 'caf\351\n'; i=0; while [ $i -lt 20000 ]; do echo line $i; i=$((i+1)); done; exit 0")
            .await;

    assert_eq!(result.exit_code, 0);
    assert_eq!(messages.len(), 20001);
    assert_eq!(
        messages[0],
        WorkerMessage::Log {
            line: "caf\u{fffd}".to_string()
        }
    );
    assert_eq!(
        messages.last(),
        Some(&WorkerMessage::Log {
            line: "line 19999".to_string()
        })
    );
}

#[tokio::test]
async fn test_execute_progress_lines() {
    let (_, messages) =
        run(r#"echo '@@progress {"event":"scenario_started","data":{"name":"login"}}'"#).await;

    assert_eq!(
        messages,
        vec![WorkerMessage::ProgressUpdate {
            event: "scenario_started".to_string(),
            data: serde_json::json!({"name": "login"}),
        }]
    );
}

#[tokio::test]
async fn test_execute_sets_job_environment() {
    let (_, messages) = run(r#"echo "$FARM_JOB_ID $FARM_FEATURE $FARM_BRANCH $FARM_RECORD""#).await;

    assert_eq!(
        messages,
        vec![WorkerMessage::Log {
            line: "1 login.feature main false".to_string()
        }]
    );
}

#[tokio::test]
async fn test_execute_runs_in_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FeatureExecutor::new(Some("pwd".to_string()));
    let mut out = Vec::new();

    executor
        .execute(&test_init(dir.path()), &test_job(1), &mut out, &CancellationToken::new())
        .await;

    let expected = dir.path().canonicalize().unwrap();
    match &decode_all(&out)[0] {
        WorkerMessage::Log { line } => {
            assert_eq!(Path::new(line).canonicalize().unwrap(), expected)
        }
        other => panic!("unexpected message {:?}", other),
    }
}

#[tokio::test]
async fn test_execute_reports_written_report() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FeatureExecutor::new(Some("echo '[]' > \"$FARM_REPORT_PATH\"".to_string()));
    let mut out = Vec::new();
    let job = test_job(4);

    let result = executor
        .execute(&test_init(dir.path()), &job, &mut out, &CancellationToken::new())
        .await;

    assert_eq!(
        result.report_path,
        Some(FeatureExecutor::report_path(dir.path(), &job))
    );
}

#[tokio::test]
async fn test_execute_ignores_stale_report() {
    let dir = tempfile::tempdir().unwrap();
    let job = test_job(4);
    let stale = FeatureExecutor::report_path(dir.path(), &job);
    std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
    std::fs::write(&stale, "old").unwrap();

    let executor = FeatureExecutor::new(Some("true".to_string()));
    let mut out = Vec::new();
    let result = executor
        .execute(&test_init(dir.path()), &job, &mut out, &CancellationToken::new())
        .await;

    assert!(result.report_path.is_none());
}

#[tokio::test]
async fn test_execute_without_command() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FeatureExecutor::new(None);
    let mut out = Vec::new();

    let result = executor
        .execute(&test_init(dir.path()), &test_job(1), &mut out, &CancellationToken::new())
        .await;

    assert_eq!(result.exit_code, -1);
    assert_eq!(decode_all(&out).len(), 1);
}

#[tokio::test]
async fn test_execute_spawn_failure() {
    let dir = tempfile::tempdir().unwrap();
    // A regular file cannot be used as the working directory.
    let not_a_dir = dir.path().join("file");
    std::fs::write(&not_a_dir, "").unwrap();
    let executor = FeatureExecutor::new(Some("true".to_string()));
    let mut out = Vec::new();

    let result = executor
        .execute(&test_init(&not_a_dir), &test_job(1), &mut out, &CancellationToken::new())
        .await;

    assert_eq!(result.exit_code, -1);
    assert!(!result.cancelled);
    match &decode_all(&out)[0] {
        WorkerMessage::Log { line } => assert!(line.starts_with("failed to start test process")),
        other => panic!("unexpected message {:?}", other),
    }
}

#[tokio::test]
async fn test_execute_cancel_kills_process() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FeatureExecutor::new(Some("exec sleep 60".to_string()));
    let cancel = CancellationToken::new();
    let mut out = Vec::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        executor.execute(&test_init(dir.path()), &test_job(1), &mut out, &cancel),
    )
    .await
    .expect("cancelled run returns promptly");

    assert!(result.cancelled);
    assert_eq!(result.exit_code, -1);
}

#[tokio::test]
async fn test_execute_signal_exit_is_failure() {
    let (result, _) = run("kill -9 $$").await;
    assert_eq!(result.exit_code, -1);
}
