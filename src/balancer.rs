use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::BalancerConfig;
use crate::coordinator::{MigrationCoordinator, MigrationTask, TaskTrigger};
use crate::detector::OverloadDetector;
use crate::fleet::{FleetSnapshot, FleetState};
use crate::hypervisor::{Connector, Migrator};
use crate::monitor::HostMonitor;
use crate::scheduler::{SchedulerLoop, TickReport};
use crate::selector::{CandidateSelector, MigrationCandidate};
use crate::types::{GuestId, HostId};
use crate::virsh::{VirshConnector, VirshMigrator};
use crate::{BalancerError, Result, log_info};

/// Task table as shown to operators.
#[derive(Debug, Clone, Serialize)]
pub struct TaskOverview {
    pub active: Vec<MigrationTask>,
    pub recent: Vec<MigrationTask>,
}

/// The assembled balancer: monitor, fleet state, scheduler and coordinator
/// wired together from one [`BalancerConfig`].
pub struct Balancer {
    config: BalancerConfig,
    fleet: Arc<FleetState>,
    selector: CandidateSelector,
    coordinator: Arc<MigrationCoordinator>,
    scheduler: SchedulerLoop,
}

impl Balancer {
    /// Balancer driving real hosts through `virsh`.
    pub fn from_config(config: BalancerConfig) -> Self {
        let connector = Arc::new(VirshConnector::new(&config.hosts));
        let migrator = Arc::new(VirshMigrator::new(config.coordinator.migration_timeout()));
        Self::with_backends(config, connector, migrator)
    }

    pub fn with_backends(
        config: BalancerConfig,
        connector: Arc<dyn Connector>,
        migrator: Arc<dyn Migrator>,
    ) -> Self {
        let staleness = config.monitor.staleness();
        let fleet = Arc::new(FleetState::new());
        let monitor = Arc::new(HostMonitor::new(Arc::clone(&connector), &config.monitor));
        let detector = OverloadDetector::new(config.thresholds, &config.detector, staleness);
        let selector = CandidateSelector::new(config.thresholds, &config.selector, staleness);
        let coordinator = Arc::new(MigrationCoordinator::new(
            Arc::clone(&fleet),
            connector,
            migrator,
            config.coordinator.clone(),
        ));

        let scheduler = SchedulerLoop::new(
            config.host_ids(),
            monitor,
            Arc::clone(&fleet),
            detector,
            selector.clone(),
            Arc::clone(&coordinator),
            config.scheduler.interval(),
            config.coordinator.shutdown_grace(),
        );

        Self {
            config,
            fleet,
            selector,
            coordinator,
            scheduler,
        }
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    /// Run the scheduler until `shutdown` is set, then drain migrations.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        log_info!(
            "Balancing {} hosts (cpu > {}%, mem > {}%, window {})",
            self.scheduler.hosts().len(),
            self.config.thresholds.cpu_percent,
            self.config.thresholds.mem_percent,
            self.config.detector.window
        );
        self.scheduler.run(shutdown).await;
    }

    /// One scheduling pass.
    pub async fn tick(&self) -> TickReport {
        self.scheduler.tick().await
    }

    /// Sample every host without making any decision.
    pub async fn refresh(&self) -> TickReport {
        let (sampled, unreachable) = self.scheduler.refresh().await;
        TickReport {
            sampled,
            unreachable,
            ..TickReport::default()
        }
    }

    pub fn fleet_snapshot(&self) -> FleetSnapshot {
        self.fleet.snapshot()
    }

    pub fn tasks(&self) -> TaskOverview {
        TaskOverview {
            active: self.coordinator.active_tasks(),
            recent: self.coordinator.recent_tasks(),
        }
    }

    pub fn task(&self, id: Uuid) -> Option<MigrationTask> {
        self.coordinator.task(id)
    }

    /// Operator-requested migration of `guest`, in the background.
    ///
    /// With no `destination` the selector picks one under the usual margin.
    /// An explicit destination only has to be a different, reachable host with
    /// a fresh sample. Reservations and the concurrency limit still apply.
    pub fn force_migrate(&self, guest: &GuestId, destination: Option<&HostId>) -> Result<Uuid> {
        let candidate = self.manual_candidate(guest, destination)?;
        self.coordinator.start(&candidate, TaskTrigger::Manual)
    }

    /// Like [`force_migrate`](Self::force_migrate) but waits for the outcome.
    pub async fn force_migrate_and_wait(
        &self,
        guest: &GuestId,
        destination: Option<&HostId>,
    ) -> Result<MigrationTask> {
        let candidate = self.manual_candidate(guest, destination)?;
        self.coordinator.execute(&candidate, TaskTrigger::Manual).await
    }

    /// Cancel the active migration of `guest`, if any.
    pub fn force_cancel(&self, guest: &GuestId) -> bool {
        self.coordinator.cancel(guest)
    }

    fn manual_candidate(&self, guest: &GuestId, destination: Option<&HostId>) -> Result<MigrationCandidate> {
        let snapshot = self.fleet.snapshot();
        let stats = snapshot
            .guest(guest)
            .ok_or_else(|| BalancerError::GuestNotFound(guest.clone()))?;
        let source = stats.host_id.clone();

        let (destination, projected_mem_percent) = match destination {
            Some(dest) => {
                if snapshot.host(dest).is_none() {
                    return Err(BalancerError::HostNotFound(dest.clone()));
                }
                if *dest == source {
                    return Err(BalancerError::NoDestination(guest.clone()));
                }
                let load = snapshot
                    .fresh_load(dest, self.selector.staleness())
                    .ok_or_else(|| BalancerError::NoDestination(guest.clone()))?;
                let projected = self.selector.projected_mem_percent(stats, load, &snapshot);
                (dest.clone(), projected)
            }
            None => self
                .selector
                .select_destination(stats, &source, &snapshot)
                .ok_or_else(|| BalancerError::NoDestination(guest.clone()))?,
        };

        Ok(MigrationCandidate {
            guest: guest.clone(),
            source,
            destination,
            projected_mem_percent,
        })
    }
}
