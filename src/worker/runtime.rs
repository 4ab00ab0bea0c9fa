use std::fmt;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, Lines};
use tokio_util::sync::CancellationToken;

use crate::config::WorkerCommands;
use crate::protocol::{decode_line, write_message, ControlMessage, InitPayload, WorkerMessage};
use crate::scheduler::Job;
use crate::worker::executor::{ExecutionResult, FeatureExecutor};
use crate::worker::stages::{self, StageProgress};

/// Orderly teardown
pub const EXIT_OK: i32 = 0;
/// A bring-up stage failed; `READY` was never sent
pub const EXIT_BRING_UP_FAILED: i32 = 1;
/// The first control message was missing, malformed or not `INIT`
pub const EXIT_PROTOCOL: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    AwaitingInit,
    Initializing,
    Ready,
    Busy,
    Terminating,
    Exited,
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeState::AwaitingInit => write!(f, "awaiting_init"),
            RuntimeState::Initializing => write!(f, "initializing"),
            RuntimeState::Ready => write!(f, "ready"),
            RuntimeState::Busy => write!(f, "busy"),
            RuntimeState::Terminating => write!(f, "terminating"),
            RuntimeState::Exited => write!(f, "exited"),
        }
    }
}

/// What arrived on the control channel while something else was running.
enum Control {
    Message(ControlMessage),
    /// Stdin EOF, a read error or a fatal signal; all mean "stop".
    Closed(&'static str),
    Garbage,
}

/// The worker side of the control protocol.
///
/// Reads [`ControlMessage`]s from `input`, writes [`WorkerMessage`]s to
/// `output`. In a worker process these are stdin and stdout.
pub struct WorkerRuntime<R, W> {
    input: Lines<BufReader<R>>,
    output: W,
    commands: WorkerCommands,
    executor: FeatureExecutor,
    state: RuntimeState,
    progress: StageProgress,
    torn_down: bool,
}

impl<R, W> WorkerRuntime<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(input: R, output: W, commands: WorkerCommands) -> Self {
        let executor = FeatureExecutor::new(commands.run_feature.clone());
        Self {
            input: BufReader::new(input).lines(),
            output,
            commands,
            executor,
            state: RuntimeState::AwaitingInit,
            progress: StageProgress::default(),
            torn_down: false,
        }
    }

    pub fn state(&self) -> RuntimeState {
        self.state
    }

    /// Serve the protocol until told to stop. Returns the process exit code.
    pub async fn run(mut self, shutdown: CancellationToken) -> i32 {
        let init = match self.await_init(&shutdown).await {
            Ok(init) => init,
            Err(code) => {
                self.state = RuntimeState::Exited;
                return code;
            }
        };

        tracing::info!(
            branch = %init.branch,
            client = %init.client,
            workspace = %init.workspace_path.display(),
            persistent = init.is_persistent,
            device = ?init.device_serial,
            "Worker initializing"
        );
        self.state = RuntimeState::Initializing;

        if let Some(code) = self.bring_up(&init, &shutdown).await {
            self.teardown(&init).await;
            return code;
        }

        self.state = RuntimeState::Ready;
        tracing::info!("Worker ready");
        self.send(WorkerMessage::Ready).await;

        self.serve(&init, &shutdown).await;
        self.teardown(&init).await;
        EXIT_OK
    }

    async fn await_init(&mut self, shutdown: &CancellationToken) -> Result<InitPayload, i32> {
        let line = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Shutdown before INIT");
                return Err(EXIT_OK);
            }
            line = self.input.next_line() => line,
        };

        match line {
            Ok(Some(line)) => match decode_line::<ControlMessage>(&line) {
                Ok(ControlMessage::Init(init)) => Ok(init),
                Ok(other) => {
                    tracing::error!(message = other.name(), "Expected INIT as first message");
                    Err(EXIT_PROTOCOL)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Undecodable first message");
                    Err(EXIT_PROTOCOL)
                }
            },
            Ok(None) => {
                tracing::error!("Control channel closed before INIT");
                Err(EXIT_PROTOCOL)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to read INIT");
                Err(EXIT_PROTOCOL)
            }
        }
    }

    /// Run the bring-up stages while still listening for TERMINATE.
    /// Returns an exit code when the worker must not go on to READY.
    async fn bring_up(&mut self, init: &InitPayload, shutdown: &CancellationToken) -> Option<i32> {
        let bring_up = stages::bring_up(&self.commands, init, &mut self.progress);
        tokio::pin!(bring_up);

        loop {
            tokio::select! {
                result = &mut bring_up => {
                    return match result {
                        Ok(()) => None,
                        Err(e) => {
                            tracing::error!(error = %e, "Bring-up failed");
                            Some(EXIT_BRING_UP_FAILED)
                        }
                    };
                }
                control = read_control(&mut self.input, shutdown) => match control {
                    Control::Message(ControlMessage::Terminate) | Control::Closed(_) => {
                        tracing::info!("Stopped during bring-up");
                        self.state = RuntimeState::Terminating;
                        return Some(EXIT_OK);
                    }
                    Control::Message(other) => {
                        tracing::warn!(message = other.name(), state = %self.state, "Ignoring control message");
                    }
                    Control::Garbage => {}
                },
            }
        }
    }

    /// Ready/busy loop. Returns once the worker should tear down.
    async fn serve(&mut self, init: &InitPayload, shutdown: &CancellationToken) {
        loop {
            match read_control(&mut self.input, shutdown).await {
                Control::Message(ControlMessage::Start { job }) => {
                    self.state = RuntimeState::Busy;
                    let result = self.run_job(init, &job, shutdown).await;
                    if result.cancelled {
                        self.state = RuntimeState::Terminating;
                        return;
                    }
                    self.state = RuntimeState::Ready;
                    self.send(WorkerMessage::ReadyForNextJob {
                        exit_code: result.exit_code,
                        report_path: result.report_path,
                    })
                    .await;
                }
                Control::Message(ControlMessage::Terminate) => {
                    tracing::info!("TERMINATE received");
                    self.state = RuntimeState::Terminating;
                    return;
                }
                Control::Message(ControlMessage::Init(_)) => {
                    tracing::warn!(state = %self.state, "Ignoring repeated INIT");
                }
                Control::Closed(reason) => {
                    tracing::info!(reason, "Control channel closed");
                    self.state = RuntimeState::Terminating;
                    return;
                }
                Control::Garbage => {}
            }
        }
    }

    /// Execute one job while watching the control channel. A TERMINATE or a
    /// closed channel kills the test process.
    async fn run_job(
        &mut self,
        init: &InitPayload,
        job: &Job,
        shutdown: &CancellationToken,
    ) -> ExecutionResult {
        tracing::info!(job_id = job.id, feature = %job.feature, "START received");
        let cancel = shutdown.child_token();
        let execution = self.executor.execute(init, job, &mut self.output, &cancel);
        tokio::pin!(execution);

        let mut input_open = true;
        loop {
            tokio::select! {
                result = &mut execution => return result,
                control = read_control(&mut self.input, shutdown), if input_open => match control {
                    Control::Message(ControlMessage::Terminate) => {
                        tracing::info!(job_id = job.id, "TERMINATE during job");
                        cancel.cancel();
                    }
                    Control::Closed(reason) => {
                        tracing::info!(job_id = job.id, reason, "Control channel closed during job");
                        input_open = false;
                        cancel.cancel();
                    }
                    Control::Message(other) => {
                        tracing::warn!(job_id = job.id, message = other.name(), "Ignoring control message while busy");
                    }
                    Control::Garbage => {}
                },
            }
        }
    }

    async fn teardown(&mut self, init: &InitPayload) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.state = RuntimeState::Terminating;
        tracing::info!("Tearing down");
        stages::tear_down(&self.commands, init, self.progress).await;
        self.state = RuntimeState::Exited;
    }

    async fn send(&mut self, message: WorkerMessage) {
        if let Err(e) = write_message(&mut self.output, &message).await {
            tracing::warn!(error = %e, message = message.name(), "Failed to write to supervisor");
        }
    }
}

async fn read_control<R>(input: &mut Lines<BufReader<R>>, shutdown: &CancellationToken) -> Control
where
    R: AsyncRead + Unpin,
{
    let line = tokio::select! {
        _ = shutdown.cancelled() => return Control::Closed("signal"),
        line = input.next_line() => line,
    };

    match line {
        Ok(Some(line)) if line.trim().is_empty() => Control::Garbage,
        Ok(Some(line)) => match decode_line::<ControlMessage>(&line) {
            Ok(message) => Control::Message(message),
            Err(e) => {
                tracing::warn!(error = %e, line = %line, "Undecodable control message");
                Control::Garbage
            }
        },
        Ok(None) => Control::Closed("eof"),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read control channel");
            Control::Closed("read error")
        }
    }
}
