//! Shared application state handed to every boundary (IPC, HTTP).

use std::sync::Arc;

use crate::config::CloisterConfig;
use crate::orchestrator::convoy::ConvoyOrchestrator;
use crate::orchestrator::health_monitor::HealthMonitor;
use crate::orchestrator::specialist_queue::SpecialistQueue;
use crate::persistence::agent_repo::AgentRepo;
use crate::persistence::convoy_repo::ConvoyRepo;
use crate::persistence::db::Database;
use crate::persistence::queue_repo::QueueRepo;
use crate::persistence::specialist_repo::SpecialistRepo;
use crate::process::ProcessControl;

/// Explicitly constructed context; there are no globals.
pub struct AppState {
    /// Immutable configuration for this run.
    pub config: Arc<CloisterConfig>,
    /// `SQLite` connection pool.
    pub db: Arc<Database>,
    /// Process-control seam.
    pub process: Arc<dyn ProcessControl>,
    /// Agent registry.
    pub agents: AgentRepo,
    /// Health watchdog.
    pub monitor: Arc<HealthMonitor>,
    /// Specialist queues and wake.
    pub specialists: SpecialistQueue,
    /// Convoy orchestrator.
    pub convoys: ConvoyOrchestrator,
}

impl AppState {
    /// Wire every component over one database and process seam.
    #[must_use]
    pub fn new(
        config: Arc<CloisterConfig>,
        db: Arc<Database>,
        process: Arc<dyn ProcessControl>,
    ) -> Self {
        let agents = AgentRepo::new(Arc::clone(&db));
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&config),
            agents.clone(),
            Arc::clone(&process),
        ));
        let specialists = SpecialistQueue::new(
            Arc::clone(&config),
            QueueRepo::new(Arc::clone(&db)),
            SpecialistRepo::new(Arc::clone(&db)),
            agents.clone(),
            Arc::clone(&process),
        );
        let convoys = ConvoyOrchestrator::new(
            Arc::clone(&config),
            ConvoyRepo::new(Arc::clone(&db)),
            agents.clone(),
            Arc::clone(&process),
        );

        Self {
            config,
            db,
            process,
            agents,
            monitor,
            specialists,
            convoys,
        }
    }
}
