use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use device_farm::config::{
    NodeConfig, PoolConfig, RecordingConfig, ReportConfig, WorkerCommands, WorkerProcessConfig,
    WorkspaceConfig,
};
use device_farm::node::Node;
use device_farm::scheduler::DeviceSource;
use device_farm::shutdown::install_shutdown_handler;
use device_farm::worker::WorkerRuntime;

#[derive(Parser, Debug)]
#[command(name = "device-farm")]
#[command(version)]
#[command(about = "Schedules UI-test features onto a pool of long-lived device workers")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the supervisor and its dashboard
    Server(ServerArgs),

    /// Run one worker process (started by the server, speaks the control
    /// protocol over stdin/stdout)
    Worker(WorkerArgs),
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address the dashboard binds to
    #[arg(long, default_value = "127.0.0.1")]
    dashboard_host: IpAddr,

    /// Port for the dashboard
    #[arg(long, default_value = "8080")]
    dashboard_port: u16,

    /// Run without the dashboard
    #[arg(long)]
    no_dashboard: bool,

    /// Maximum number of concurrent worker processes
    #[arg(long, default_value = "4")]
    max_workers: usize,

    /// Where devices come from
    #[arg(long, value_enum, default_value = "local")]
    device_source: DeviceSourceArg,

    /// Dispatch attempts before a job whose workers keep dying is abandoned
    #[arg(long, default_value = "3")]
    max_job_attempts: u32,

    /// Never terminate idle workers to free a device another job needs
    #[arg(long)]
    no_reclaim: bool,

    /// How long to wait for workers to tear down on shutdown
    #[arg(long, default_value = "10000")]
    terminate_grace_ms: u64,

    /// Directory holding one persistent workspace per branch
    #[arg(long)]
    persistent_root: Option<PathBuf>,

    /// Directory for throwaway workspaces
    #[arg(long)]
    ephemeral_root: Option<PathBuf>,

    /// Directory reports are copied into
    #[arg(long)]
    reports_root: Option<PathBuf>,

    /// URL prefix under which stored reports are served
    #[arg(long, default_value = "/reports")]
    reports_base_url: String,

    /// Command that starts a network recording for a job
    #[arg(long, requires = "record_stop_command")]
    record_start_command: Option<String>,

    /// Command that stops a recording; its stdout is the recording summary
    #[arg(long, requires = "record_start_command")]
    record_stop_command: Option<String>,

    /// Binary launched for workers (defaults to this executable)
    #[arg(long)]
    worker_program: Option<PathBuf>,

    /// RUST_LOG handed to worker processes
    #[arg(long, default_value = "info")]
    worker_log_filter: String,

    #[command(flatten)]
    commands: StageCommandArgs,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DeviceSourceArg {
    Local,
    Remote,
}

impl From<DeviceSourceArg> for DeviceSource {
    fn from(arg: DeviceSourceArg) -> Self {
        match arg {
            DeviceSourceArg::Local => DeviceSource::Local,
            DeviceSourceArg::Remote => DeviceSource::Remote,
        }
    }
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    #[command(flatten)]
    commands: StageCommandArgs,
}

/// Shell commands for each worker stage, shared by both subcommands: the
/// server forwards its own to every worker it launches.
#[derive(ClapArgs, Debug, Clone, Default)]
struct StageCommandArgs {
    /// Checkout and dependency install, run in the workspace
    #[arg(long)]
    prepare_workspace: Option<String>,

    /// Takes the exclusive device lock
    #[arg(long)]
    acquire_device: Option<String>,

    /// Starts the automation server; must return once the server is up
    #[arg(long)]
    start_server: Option<String>,

    /// Runs one feature; FARM_FEATURE names it
    #[arg(long)]
    run_feature: Option<String>,

    #[arg(long)]
    stop_server: Option<String>,

    #[arg(long)]
    release_device: Option<String>,
}

impl From<StageCommandArgs> for WorkerCommands {
    fn from(args: StageCommandArgs) -> Self {
        WorkerCommands {
            prepare_workspace: args.prepare_workspace,
            acquire_device: args.acquire_device,
            start_server: args.start_server,
            run_feature: args.run_feature,
            stop_server: args.stop_server,
            release_device: args.release_device,
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter(env_filter()).init();

    let program = match args.worker_program {
        Some(program) => program,
        None => std::env::current_exe()?,
    };

    let defaults = WorkspaceConfig::default();
    let workspaces = WorkspaceConfig {
        persistent_root: args.persistent_root.unwrap_or(defaults.persistent_root),
        ephemeral_root: args.ephemeral_root.unwrap_or(defaults.ephemeral_root),
    };
    let reports = ReportConfig {
        root: args.reports_root.unwrap_or_else(|| ReportConfig::default().root),
        base_url: args.reports_base_url,
    };
    let recording = match (args.record_start_command, args.record_stop_command) {
        (Some(start_command), Some(stop_command)) => Some(RecordingConfig {
            start_command,
            stop_command,
        }),
        _ => None,
    };

    let pool = PoolConfig {
        max_workers: args.max_workers,
        device_source: args.device_source.into(),
        max_job_attempts: args.max_job_attempts,
        reclaim_idle_devices: !args.no_reclaim,
        terminate_grace_ms: args.terminate_grace_ms,
        worker: WorkerProcessConfig {
            program,
            commands: args.commands.into(),
            log_filter: args.worker_log_filter,
        },
        workspaces,
        reports,
        recording,
    };

    let dashboard_addr = if args.no_dashboard {
        None
    } else {
        Some(SocketAddr::new(args.dashboard_host, args.dashboard_port))
    };

    let config = NodeConfig {
        dashboard_addr,
        pool,
    };

    tracing::info!(
        dashboard_addr = ?config.dashboard_addr,
        max_workers = config.pool.max_workers,
        device_source = %config.pool.device_source,
        worker_program = %config.pool.worker.program.display(),
        recording = config.pool.recording.is_some(),
        "Starting device-farm server"
    );

    let shutdown = install_shutdown_handler();
    Node::new(config).run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Worker Implementation
// =============================================================================

async fn run_worker(args: WorkerArgs) -> i32 {
    // Stdout carries the protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let shutdown = install_shutdown_handler();
    let runtime = WorkerRuntime::new(tokio::io::stdin(), tokio::io::stdout(), args.commands.into());
    let code = runtime.run(shutdown).await;
    tracing::info!(exit_code = code, "Worker exiting");
    code
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Worker(worker_args) => {
            let code = run_worker(worker_args).await;
            // A blocked stdin read would otherwise hold the runtime open.
            std::process::exit(code);
        }
    }

    Ok(())
}
