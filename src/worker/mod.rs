//! Worker runtime: the process side of the control protocol.
//!
//! Each worker process serves exactly one affinity key for its whole life:
//! - **Bring-up**: workspace, dependency install, device lock, automation server
//! - **Execution**: one feature at a time, output streamed back as `LOG`
//! - **Teardown**: reverse of bring-up, best-effort and idempotent
//!
//! # Components
//!
//! - [`WorkerRuntime`]: reads control messages and drives the state machine
//! - [`FeatureExecutor`]: runs the `run-feature` command for a job
//! - [`stages`]: shell stage commands and the `FARM_*` environment
//!
//! # Execution Flow
//!
//! 1. Supervisor sends `INIT`; the runtime runs the bring-up stages
//! 2. On success it sends `READY`; on failure it exits with code 1
//! 3. Each `START` runs [`FeatureExecutor::execute`], then `READY_FOR_NEXT_JOB`
//! 4. `TERMINATE`, stdin EOF or a signal tears down and exits with code 0

pub mod executor;
pub mod runtime;
pub mod stages;

pub use executor::{ExecutionResult, FeatureExecutor};
pub use runtime::{RuntimeState, WorkerRuntime};
pub use stages::StageError;
