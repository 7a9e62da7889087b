// Integration tests for the migration coordinator
mod common;

use common::{FakeConnector, FakeMigrator, FakeWorld, GIB, Outcome, eventually, guest, load};
use nova_balancer::BalancerError;
use nova_balancer::config::CoordinatorConfig;
use nova_balancer::coordinator::{MigrationCoordinator, TaskState, TaskTrigger};
use nova_balancer::error::ReservationConflict;
use nova_balancer::fleet::FleetState;
use nova_balancer::selector::MigrationCandidate;
use nova_balancer::types::{GuestId, HostId};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

struct Harness {
    world: Arc<FakeWorld>,
    fleet: Arc<FleetState>,
    migrator: Arc<FakeMigrator>,
    coordinator: Arc<MigrationCoordinator>,
}

fn harness(config: CoordinatorConfig) -> Harness {
    let world = FakeWorld::new();
    world.add_host("hv-a", 95.0, 60.0, 64 * GIB);
    world.add_host("hv-b", 10.0, 20.0, 64 * GIB);
    world.add_guest("hv-a", "vm-1", 4 * GIB, 300);
    world.add_guest("hv-a", "vm-2", 2 * GIB, 100);

    let fleet = Arc::new(FleetState::new());
    fleet.update(
        &HostId::from("hv-a"),
        load("hv-a", 95.0, 60.0, 64 * GIB),
        vec![guest("hv-a", "vm-1", 4 * GIB, 300), guest("hv-a", "vm-2", 2 * GIB, 100)],
    );
    fleet.update(&HostId::from("hv-b"), load("hv-b", 10.0, 20.0, 64 * GIB), vec![]);

    let migrator = FakeMigrator::new(Arc::clone(&world));
    let coordinator = Arc::new(MigrationCoordinator::new(
        Arc::clone(&fleet),
        FakeConnector::new(Arc::clone(&world)),
        migrator.clone(),
        config,
    ));

    Harness {
        world,
        fleet,
        migrator,
        coordinator,
    }
}

fn candidate(guest: &str) -> MigrationCandidate {
    MigrationCandidate {
        guest: GuestId::from(guest),
        source: HostId::from("hv-a"),
        destination: HostId::from("hv-b"),
        projected_mem_percent: 26.25,
    }
}

#[tokio::test]
async fn test_successful_migration_relocates_guest() {
    let h = harness(CoordinatorConfig::default());
    let vm = GuestId::from("vm-1");

    let task = h
        .coordinator
        .execute(&candidate("vm-1"), TaskTrigger::Scheduled)
        .await
        .unwrap();

    assert_eq!(task.state, TaskState::Succeeded);
    assert_eq!(task.attempt, 1);
    assert!(task.finished_at.is_some());
    assert!(task.last_error.is_none());

    let snapshot = h.fleet.snapshot();
    assert_eq!(snapshot.location(&vm), Some(&HostId::from("hv-b")));
    assert!(!snapshot.host(&HostId::from("hv-a")).unwrap().guests.contains_key(&vm));
    assert!(!snapshot.is_reserved(&vm));
    assert!(!snapshot.is_cooling_down(&vm));
    assert_eq!(h.world.guests_on("hv-b"), vec![vm]);
    assert_eq!(h.coordinator.recent_tasks().len(), 1);
}

#[tokio::test]
async fn test_failed_migration_cools_down() {
    let h = harness(CoordinatorConfig::default());
    h.migrator.set_outcome(Outcome::Fail("destination refused".to_string()));
    let vm = GuestId::from("vm-1");

    let task = h
        .coordinator
        .execute(&candidate("vm-1"), TaskTrigger::Manual)
        .await
        .unwrap();

    assert_eq!(task.state, TaskState::Failed);
    assert!(task.last_error.unwrap().contains("destination refused"));
    assert_eq!(h.fleet.location(&vm), Some(HostId::from("hv-a")));
    assert!(!h.fleet.is_reserved(&vm));
    assert!(!h.fleet.reserve(&vm), "reservable again before the cooldown");

    let retry = h
        .coordinator
        .execute(&candidate("vm-1"), TaskTrigger::Manual)
        .await;
    assert!(matches!(
        retry,
        Err(BalancerError::Reservation(ReservationConflict::CoolingDown { .. }))
    ));
}

#[tokio::test]
async fn test_unreachable_destination_releases_reservation() {
    let h = harness(CoordinatorConfig::default());
    h.world.set_reachable("hv-b", false);
    let vm = GuestId::from("vm-1");

    let task = h
        .coordinator
        .execute(&candidate("vm-1"), TaskTrigger::Scheduled)
        .await
        .unwrap();

    assert_eq!(task.state, TaskState::Failed);
    assert!(!h.fleet.is_reserved(&vm));
    assert_eq!(h.migrator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_concurrent_starts_reserve_once() {
    let h = harness(CoordinatorConfig::default());
    h.migrator.set_delay(Duration::from_millis(200));

    let first = h.coordinator.start(&candidate("vm-1"), TaskTrigger::Scheduled);
    let second = h.coordinator.start(&candidate("vm-1"), TaskTrigger::Manual);

    let id = first.unwrap();
    assert!(matches!(
        second,
        Err(BalancerError::Reservation(ReservationConflict::InFlight))
    ));

    let active = h.coordinator.active_tasks();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, id);

    let coordinator = Arc::clone(&h.coordinator);
    assert!(eventually(|| coordinator.task(id).is_some_and(|t| t.state == TaskState::Succeeded)).await);
    assert_eq!(h.migrator.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.coordinator.recent_tasks().len(), 1);
}

#[tokio::test]
async fn test_cancel_aborts_in_flight_migration() {
    let h = harness(CoordinatorConfig::default());
    h.migrator.set_delay(Duration::from_secs(30));
    let vm = GuestId::from("vm-1");

    let id = h.coordinator.start(&candidate("vm-1"), TaskTrigger::Scheduled).unwrap();
    let coordinator = Arc::clone(&h.coordinator);
    assert!(eventually(|| coordinator.task(id).is_some_and(|t| t.state == TaskState::InFlight)).await);

    assert!(h.coordinator.cancel(&vm));
    assert!(eventually(|| coordinator.task(id).is_some_and(|t| t.state == TaskState::Failed)).await);

    assert_eq!(h.fleet.location(&vm), Some(HostId::from("hv-a")));
    assert!(!h.fleet.is_reserved(&vm));
    assert!(!h.coordinator.cancel(&vm));
}

#[tokio::test]
async fn test_concurrency_limit() {
    let config = CoordinatorConfig {
        max_concurrent: 1,
        ..CoordinatorConfig::default()
    };
    let h = harness(config);
    h.migrator.set_delay(Duration::from_millis(300));

    h.coordinator.start(&candidate("vm-1"), TaskTrigger::Scheduled).unwrap();
    assert!(h.coordinator.is_at_capacity());

    let refused = h.coordinator.start(&candidate("vm-2"), TaskTrigger::Scheduled);
    assert!(matches!(refused, Err(BalancerError::AtCapacity(1))));
    assert!(!h.fleet.is_reserved(&GuestId::from("vm-2")));

    h.coordinator.shutdown(Duration::from_secs(1)).await;
    assert_eq!(h.coordinator.in_flight(), 0);
    assert!(!h.coordinator.is_at_capacity());
}

#[tokio::test]
async fn test_history_is_bounded() {
    let config = CoordinatorConfig {
        history_limit: 1,
        ..CoordinatorConfig::default()
    };
    let h = harness(config);

    h.coordinator.execute(&candidate("vm-1"), TaskTrigger::Manual).await.unwrap();
    h.coordinator.execute(&candidate("vm-2"), TaskTrigger::Manual).await.unwrap();

    let recent = h.coordinator.recent_tasks();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].guest_id, GuestId::from("vm-2"));
}

#[tokio::test]
async fn test_panicking_migration_releases_guest() {
    let h = harness(CoordinatorConfig::default());
    h.migrator.set_outcome(Outcome::Panic);
    let vm = GuestId::from("vm-1");

    let id = h.coordinator.start(&candidate("vm-1"), TaskTrigger::Scheduled).unwrap();
    let coordinator = Arc::clone(&h.coordinator);
    assert!(eventually(|| coordinator.task(id).is_some_and(|t| t.state == TaskState::Failed)).await);

    assert!(!h.fleet.is_reserved(&vm));
    assert!(h.fleet.snapshot().is_cooling_down(&vm));
    assert_eq!(h.fleet.location(&vm), Some(HostId::from("hv-a")));
    assert!(h.coordinator.active_tasks().is_empty());

    let recent = h.coordinator.recent_tasks();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].state, TaskState::Failed);
    assert!(recent[0].last_error.as_deref().unwrap_or_default().contains("crashed"));
}

#[tokio::test]
async fn test_started_task_is_cancellable_at_once() {
    let h = harness(CoordinatorConfig::default());
    h.migrator.set_delay(Duration::from_secs(30));
    let vm = GuestId::from("vm-1");

    let id = h.coordinator.start(&candidate("vm-1"), TaskTrigger::Manual).unwrap();
    assert!(h.fleet.is_reserved(&vm));
    assert!(h.coordinator.cancel(&vm));

    let coordinator = Arc::clone(&h.coordinator);
    assert!(eventually(|| coordinator.task(id).is_some_and(|t| t.state == TaskState::Failed)).await);
    assert!(!h.fleet.is_reserved(&vm));
}

#[tokio::test]
async fn test_attempts_forgotten_with_history() {
    let config = CoordinatorConfig {
        history_limit: 1,
        ..CoordinatorConfig::default()
    };
    let h = harness(config);

    let first = h.coordinator.execute(&candidate("vm-1"), TaskTrigger::Manual).await.unwrap();
    assert_eq!(first.attempt, 1);
    h.coordinator.execute(&candidate("vm-2"), TaskTrigger::Manual).await.unwrap();

    // Put vm-1 back on hv-a and move it again.
    let back = MigrationCandidate {
        guest: GuestId::from("vm-1"),
        source: HostId::from("hv-b"),
        destination: HostId::from("hv-a"),
        projected_mem_percent: 66.25,
    };
    let returned = h.coordinator.execute(&back, TaskTrigger::Manual).await.unwrap();
    assert_eq!(returned.state, TaskState::Succeeded);
    assert_eq!(returned.attempt, 1);

    // vm-1 is still in history, so its counter keeps going.
    let again = h.coordinator.execute(&candidate("vm-1"), TaskTrigger::Manual).await.unwrap();
    assert_eq!(again.attempt, 2);
}
