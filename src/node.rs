use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::events::EventBus;
use crate::pool::launcher::WorkerEvent;
use crate::pool::{Collaborators, ProcessLauncher, Supervisor, WorkerLauncher};

/// A farm server: the supervisor plus the optional dashboard in front of it.
pub struct Node {
    pub config: NodeConfig,
    supervisor: Supervisor,
    worker_events_rx: mpsc::Receiver<WorkerEvent>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        let launcher: Arc<dyn WorkerLauncher> =
            Arc::new(ProcessLauncher::new(config.pool.worker.clone()));
        let collaborators = Collaborators::from_config(&config.pool);
        Self::with_parts(config, launcher, collaborators)
    }

    /// Build a node around a custom launcher and collaborators.
    pub fn with_parts(
        config: NodeConfig,
        launcher: Arc<dyn WorkerLauncher>,
        collaborators: Collaborators,
    ) -> Self {
        let (supervisor, worker_events_rx) =
            Supervisor::new(config.pool.clone(), launcher, collaborators, EventBus::new());
        Self {
            config,
            supervisor,
            worker_events_rx,
        }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// 1. Spawns the supervisor actor
    /// 2. Optionally spawns the web dashboard
    /// 3. Waits for the supervisor to drain its workers and stop
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
        let (handle, supervisor_task) = self
            .supervisor
            .spawn(self.worker_events_rx, shutdown.clone());

        if let Some(dashboard_addr) = self.config.dashboard_addr {
            let state = DashboardState { supervisor: handle };
            let dashboard_shutdown = shutdown.clone();
            tokio::spawn(async move {
                run_dashboard(dashboard_addr, state, dashboard_shutdown).await;
            });
        }

        supervisor_task.await?;
        tracing::info!("Node stopped");
        Ok(())
    }
}
