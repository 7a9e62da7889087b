use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::coordinator::{MigrationCoordinator, TaskTrigger};
use crate::detector::{OverloadDetector, Verdict};
use crate::fleet::FleetState;
use crate::monitor::HostMonitor;
use crate::selector::CandidateSelector;
use crate::types::HostId;
use crate::{BalancerError, log_debug, log_error, log_info, log_warn};

/// What one scheduling pass did. Mostly useful to tests and the CLI.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub sampled: Vec<HostId>,
    pub unreachable: Vec<HostId>,
    pub overloaded: Vec<HostId>,
    pub started: Vec<Uuid>,
}

/// Periodic driver: sample, detect, select, hand off.
pub struct SchedulerLoop {
    hosts: Vec<HostId>,
    monitor: Arc<HostMonitor>,
    fleet: Arc<FleetState>,
    detector: Mutex<OverloadDetector>,
    selector: CandidateSelector,
    coordinator: Arc<MigrationCoordinator>,
    interval: Duration,
    shutdown_grace: Duration,
}

impl SchedulerLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hosts: Vec<HostId>,
        monitor: Arc<HostMonitor>,
        fleet: Arc<FleetState>,
        detector: OverloadDetector,
        selector: CandidateSelector,
        coordinator: Arc<MigrationCoordinator>,
        interval: Duration,
        shutdown_grace: Duration,
    ) -> Self {
        let mut hosts = hosts;
        hosts.sort();
        hosts.dedup();
        for host in &hosts {
            fleet.register_host(host);
        }

        Self {
            hosts,
            monitor,
            fleet,
            detector: Mutex::new(detector),
            selector,
            coordinator,
            interval,
            shutdown_grace,
        }
    }

    fn detector(&self) -> MutexGuard<'_, OverloadDetector> {
        self.detector.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tick until `shutdown` flips to true, then cancel in-flight migrations
    /// and wait for them to settle.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        log_info!(
            "Starting scheduler loop over {} hosts every {:?}",
            self.hosts.len(),
            self.interval
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.tick().await;
                    log_debug!(
                        "Tick done: {} sampled, {} unreachable, {} overloaded, {} migrations started",
                        report.sampled.len(),
                        report.unreachable.len(),
                        report.overloaded.len(),
                        report.started.len()
                    );
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        log_info!("Scheduler shutting down");
                        break;
                    }
                }
            }
        }

        self.coordinator.shutdown(self.shutdown_grace).await;
    }

    /// Sample every host in parallel and fold the results into the fleet
    /// state and the detector. Returns (sampled, unreachable), both sorted.
    pub async fn refresh(&self) -> (Vec<HostId>, Vec<HostId>) {
        let mut sampled = Vec::new();
        let mut unreachable = Vec::new();

        let mut sampling = JoinSet::new();
        for host in &self.hosts {
            let monitor = Arc::clone(&self.monitor);
            let host = host.clone();
            sampling.spawn(async move {
                let result = monitor.sample(&host).await;
                (host, result)
            });
        }

        while let Some(joined) = sampling.join_next().await {
            match joined {
                Ok((host, Ok(sample))) => {
                    self.detector().observe(&sample.load);
                    self.fleet.update(&host, sample.load, sample.guests);
                    sampled.push(host);
                }
                Ok((host, Err(e))) => {
                    log_warn!("Excluding host {} from this tick: {}", host, e);
                    self.fleet.mark_unreachable(&host);
                    unreachable.push(host);
                }
                Err(e) => log_error!("Sampling task crashed: {}", e),
            }
        }

        sampled.sort();
        unreachable.sort();
        (sampled, unreachable)
    }

    /// One scheduling pass. Never fails: broken hosts are only logged and skipped.
    pub async fn tick(&self) -> TickReport {
        let (sampled, unreachable) = self.refresh().await;
        let mut report = TickReport {
            sampled,
            unreachable,
            ..TickReport::default()
        };

        let now = Utc::now();
        {
            let mut detector = self.detector();
            for host in &report.sampled {
                match detector.evaluate(host, now) {
                    Verdict::Overloaded if detector.in_cooldown(host, now) => {
                        log_debug!("Host {} overloaded but still cooling down", host);
                    }
                    Verdict::Overloaded => report.overloaded.push(host.clone()),
                    Verdict::Normal => {}
                    Verdict::InsufficientData => {
                        log_debug!("Not enough samples for host {} yet", host);
                    }
                }
            }
        }

        for host in report.overloaded.clone() {
            if self.coordinator.is_at_capacity() {
                log_info!("Migration limit reached, deferring remaining overloaded hosts");
                break;
            }

            // Fresh snapshot per host so earlier hand-offs count as pending load.
            let snapshot = self.fleet.snapshot();
            let Some(candidate) = self.selector.select_migration(&host, &snapshot) else {
                log_info!("Host {} is overloaded but no migration fits", host);
                continue;
            };

            match self.coordinator.start(&candidate, TaskTrigger::Scheduled) {
                Ok(id) => {
                    log_info!(
                        "Host {} overloaded: moving {} to {} (projected mem {:.1}%)",
                        host,
                        candidate.guest,
                        candidate.destination,
                        candidate.projected_mem_percent
                    );
                    self.detector().record_trigger(&host, now);
                    report.started.push(id);
                }
                Err(BalancerError::Reservation(conflict)) => {
                    log_debug!("Skipping {}: {}", candidate.guest, conflict);
                }
                Err(BalancerError::AtCapacity(_)) => break,
                Err(e) => log_warn!("Could not start migration of {}: {}", candidate.guest, e),
            }
        }

        report
    }

    pub fn hosts(&self) -> &[HostId] {
        &self.hosts
    }
}
