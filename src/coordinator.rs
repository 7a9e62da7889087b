use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, watch};
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::fleet::FleetState;
use crate::hypervisor::{Connector, MigrationOptions, Migrator};
use crate::selector::MigrationCandidate;
use crate::types::{GuestId, HostId};
use crate::{BalancerError, Result, log_debug, log_error, log_info, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Reserving,
    InFlight,
    Committing,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskTrigger {
    Scheduled,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationTask {
    pub id: Uuid,
    pub guest_id: GuestId,
    pub source_host: HostId,
    pub dest_host: HostId,
    pub state: TaskState,
    /// How many tasks this guest has had while it stayed in the task table, this one included.
    pub attempt: u32,
    pub trigger: TaskTrigger,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

struct ActiveTask {
    task: MigrationTask,
    cancel: watch::Sender<bool>,
}

#[derive(Default)]
struct TaskTable {
    active: HashMap<GuestId, ActiveTask>,
    history: VecDeque<MigrationTask>,
    attempts: HashMap<GuestId, u32>,
}

/// Releases a guest's reservation when dropped, with the failure cooldown
/// unless [`succeed`](Self::succeed) ran first. Covers early returns and panics.
struct ReservationGuard {
    fleet: Arc<FleetState>,
    guest: GuestId,
    cooldown: Duration,
    released: bool,
}

impl ReservationGuard {
    fn succeed(mut self) {
        self.fleet.release(&self.guest);
        self.released = true;
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if !self.released {
            log_debug!(
                "Releasing reservation for {} with {:?} cooldown",
                self.guest,
                self.cooldown
            );
            self.fleet.release_with_cooldown(&self.guest, self.cooldown);
        }
    }
}

/// A task that holds its reservation and permit and is ready to run.
struct PreparedTask {
    task: MigrationTask,
    guard: ReservationGuard,
    cancel: watch::Receiver<bool>,
    _permit: OwnedSemaphorePermit,
}

/// Drives migration tasks from reservation to a terminal state.
///
/// At most one task per guest (the reservation in [`FleetState`]) and at most
/// `max_concurrent` tasks overall (a semaphore shared by scheduled and manual
/// migrations). Finished tasks are kept in a bounded history.
pub struct MigrationCoordinator {
    fleet: Arc<FleetState>,
    connector: Arc<dyn Connector>,
    migrator: Arc<dyn Migrator>,
    config: CoordinatorConfig,
    options: MigrationOptions,
    permits: Arc<Semaphore>,
    tasks: Mutex<TaskTable>,
    finished: Notify,
}

impl MigrationCoordinator {
    pub fn new(
        fleet: Arc<FleetState>,
        connector: Arc<dyn Connector>,
        migrator: Arc<dyn Migrator>,
        config: CoordinatorConfig,
    ) -> Self {
        let options = MigrationOptions {
            bandwidth_mibps: config.bandwidth_mibps,
            disk_migration: config.disk_migration,
        };

        Self {
            fleet,
            connector,
            migrator,
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
            options,
            config,
            tasks: Mutex::new(TaskTable::default()),
            finished: Notify::new(),
        }
    }

    fn table(&self) -> MutexGuard<'_, TaskTable> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve the guest and launch the migration in the background.
    ///
    /// Fails without touching any state when the coordinator is at capacity or
    /// the guest is already reserved.
    pub fn start(self: &Arc<Self>, candidate: &MigrationCandidate, trigger: TaskTrigger) -> Result<Uuid> {
        let prepared = self.prepare(candidate, trigger)?;
        let id = prepared.task.id;
        let guest = prepared.task.guest_id.clone();

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let inner = tokio::spawn({
                let coordinator = Arc::clone(&coordinator);
                async move { coordinator.drive(prepared).await }
            });

            if let Err(e) = inner.await {
                log_error!("Migration task for {} crashed: {}", guest, e);
                coordinator.finish(&guest, TaskState::Failed, Some(format!("task crashed: {}", e)));
            }
        });

        Ok(id)
    }

    /// Same as [`start`](Self::start) but waits for the terminal state.
    pub async fn execute(&self, candidate: &MigrationCandidate, trigger: TaskTrigger) -> Result<MigrationTask> {
        let prepared = self.prepare(candidate, trigger)?;
        Ok(self.drive(prepared).await)
    }

    fn prepare(&self, candidate: &MigrationCandidate, trigger: TaskTrigger) -> Result<PreparedTask> {
        let permit = Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|_| BalancerError::AtCapacity(self.config.max_concurrent))?;

        let mut task = MigrationTask {
            id: Uuid::new_v4(),
            guest_id: candidate.guest.clone(),
            source_host: candidate.source.clone(),
            dest_host: candidate.destination.clone(),
            state: TaskState::Pending,
            attempt: 0,
            trigger,
            created_at: Utc::now(),
            finished_at: None,
            last_error: None,
        };

        task.state = TaskState::Reserving;
        // Held until the task is listed, so cancel never misses a reserved guest.
        let mut table = self.table();
        if let Err(conflict) = self
            .fleet
            .reserve_for(&task.guest_id, Some(&task.dest_host))
        {
            log_debug!("Not migrating {}: {}", task.guest_id, conflict);
            return Err(BalancerError::Reservation(conflict));
        }

        let guard = ReservationGuard {
            fleet: Arc::clone(&self.fleet),
            guest: task.guest_id.clone(),
            cooldown: self.config.failure_cooldown(),
            released: false,
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let attempt = table.attempts.entry(task.guest_id.clone()).or_insert(0);
        *attempt += 1;
        task.attempt = *attempt;
        table.active.insert(
            task.guest_id.clone(),
            ActiveTask {
                task: task.clone(),
                cancel: cancel_tx,
            },
        );
        drop(table);

        log_info!(
            "Migration task {} queued: {} from {} to {} (attempt {})",
            task.id,
            task.guest_id,
            task.source_host,
            task.dest_host,
            task.attempt
        );

        Ok(PreparedTask {
            task,
            guard,
            cancel: cancel_rx,
            _permit: permit,
        })
    }

    async fn drive(&self, prepared: PreparedTask) -> MigrationTask {
        let PreparedTask {
            task,
            guard,
            cancel,
            _permit,
        } = prepared;
        let guest = task.guest_id.clone();

        match self.run_migration(&task, cancel).await {
            Ok(()) => {
                self.set_state(&guest, TaskState::Committing);
                if let Err(e) = self.fleet.relocate(&guest, &task.source_host, &task.dest_host) {
                    // Destination's next sample will pick the guest up.
                    log_warn!("Could not relocate {} in fleet state: {}", guest, e);
                }
                guard.succeed();
                log_info!(
                    "Migration of {} from {} to {} succeeded",
                    guest,
                    task.source_host,
                    task.dest_host
                );
                self.finish(&guest, TaskState::Succeeded, None)
                    .unwrap_or_else(|| terminal(task, TaskState::Succeeded, None))
            }
            Err(e) => {
                drop(guard);
                log_error!(
                    "Migration of {} from {} to {} failed: {}",
                    guest,
                    task.source_host,
                    task.dest_host,
                    e
                );
                self.finish(&guest, TaskState::Failed, Some(e.clone()))
                    .unwrap_or_else(|| terminal(task, TaskState::Failed, Some(e)))
            }
        }
    }

    async fn run_migration(
        &self,
        task: &MigrationTask,
        cancel: watch::Receiver<bool>,
    ) -> std::result::Result<(), String> {
        let source = self
            .connector
            .connect(&task.source_host)
            .await
            .map_err(|e| e.to_string())?;
        let destination = self
            .connector
            .connect(&task.dest_host)
            .await
            .map_err(|e| e.to_string())?;

        let handle = source
            .lookup_guest(&task.guest_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("guest {} is not running on {}", task.guest_id, task.source_host))?;

        if *cancel.borrow() {
            return Err("cancelled before the migration started".to_string());
        }

        self.set_state(&task.guest_id, TaskState::InFlight);
        self.migrator
            .migrate_live(
                &handle,
                source.as_ref(),
                destination.as_ref(),
                &self.options,
                cancel,
            )
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn set_state(&self, guest: &GuestId, state: TaskState) {
        let mut table = self.table();
        if let Some(active) = table.active.get_mut(guest) {
            log_debug!("Task {} for {}: {:?} -> {:?}", active.task.id, guest, active.task.state, state);
            active.task.state = state;
        }
    }

    fn finish(&self, guest: &GuestId, state: TaskState, error: Option<String>) -> Option<MigrationTask> {
        let mut table = self.table();
        let mut task = table.active.remove(guest)?.task;

        task.state = state;
        task.finished_at = Some(Utc::now());
        task.last_error = error;

        table.history.push_back(task.clone());
        while table.history.len() > self.config.history_limit {
            let Some(evicted) = table.history.pop_front() else {
                break;
            };
            let remembered = table.active.contains_key(&evicted.guest_id)
                || table.history.iter().any(|t| t.guest_id == evicted.guest_id);
            if !remembered {
                table.attempts.remove(&evicted.guest_id);
            }
        }
        drop(table);

        self.finished.notify_waiters();
        Some(task)
    }

    /// Ask the task migrating `guest` to stop. False if there is none.
    pub fn cancel(&self, guest: &GuestId) -> bool {
        let table = self.table();
        match table.active.get(guest) {
            Some(active) => {
                log_info!("Cancelling migration task {} for {}", active.task.id, guest);
                let _ = active.cancel.send(true);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let table = self.table();
        for active in table.active.values() {
            let _ = active.cancel.send(true);
        }
    }

    /// Cancel everything and wait for every task to reach a terminal state.
    ///
    /// Migrations that cannot be aborted are still awaited after `grace`; only
    /// the log level changes.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel_all();
        let deadline = tokio::time::Instant::now() + grace;
        let mut warned = false;

        loop {
            let notified = self.finished.notified();
            let remaining = self.in_flight();
            if remaining == 0 {
                break;
            }

            if !warned && tokio::time::Instant::now() >= deadline {
                log_warn!(
                    "{} migration(s) still settling after {:?}, waiting for them to finish",
                    remaining,
                    grace
                );
                warned = true;
            }

            // Periodic re-check in case a notification fired before we subscribed.
            let _ = tokio::time::timeout(Duration::from_millis(250), notified).await;
        }

        log_info!("All migration tasks settled");
    }

    pub fn in_flight(&self) -> usize {
        self.table().active.len()
    }

    pub fn active_tasks(&self) -> Vec<MigrationTask> {
        let mut tasks: Vec<_> = self
            .table()
            .active
            .values()
            .map(|active| active.task.clone())
            .collect();
        tasks.sort_by_key(|task| task.created_at);
        tasks
    }

    /// Finished tasks, oldest first.
    pub fn recent_tasks(&self) -> Vec<MigrationTask> {
        self.table().history.iter().cloned().collect()
    }

    pub fn task(&self, id: Uuid) -> Option<MigrationTask> {
        let table = self.table();
        table
            .active
            .values()
            .map(|active| &active.task)
            .chain(table.history.iter())
            .find(|task| task.id == id)
            .cloned()
    }

    pub fn is_at_capacity(&self) -> bool {
        self.permits.available_permits() == 0
    }
}

fn terminal(mut task: MigrationTask, state: TaskState, error: Option<String>) -> MigrationTask {
    task.state = state;
    task.finished_at = Some(Utc::now());
    task.last_error = error;
    task
}
