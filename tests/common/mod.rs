// In-memory hypervisor fleet shared by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use nova_balancer::config::{BalancerConfig, HostConfig};
use nova_balancer::error::{ConnectionError, MigrationError};
use nova_balancer::hypervisor::{
    Connector, GuestHandle, GuestInfo, HostSampler, HypervisorConnection, MigrationOptions, Migrator,
};
use nova_balancer::types::{GuestId, GuestState, GuestStats, HostId, HostLoad};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

pub const GIB: u64 = 1024 * 1024 * 1024;

/// Reading returned by a fresh sampler before it has a baseline.
pub const WARMUP_CPU_READING: f64 = 100.0;

#[derive(Debug, Clone)]
pub struct FakeHost {
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub memory_total_bytes: u64,
    pub reachable: bool,
    /// Calls against the host never return.
    pub hanging: bool,
    pub guests: BTreeMap<GuestId, GuestInfo>,
}

/// The "hypervisors". Fakes read from and write to it.
#[derive(Default)]
pub struct FakeWorld {
    hosts: Mutex<HashMap<HostId, FakeHost>>,
    pub sessions_opened: AtomicUsize,
    pub cpu_reads: AtomicUsize,
}

impl FakeWorld {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_host(&self, id: &str, cpu_percent: f64, mem_percent: f64, memory_total_bytes: u64) {
        self.hosts.lock().unwrap().insert(
            HostId::from(id),
            FakeHost {
                cpu_percent,
                mem_percent,
                memory_total_bytes,
                reachable: true,
                hanging: false,
                guests: BTreeMap::new(),
            },
        );
    }

    pub fn add_guest(&self, host: &str, guest: &str, used_memory_bytes: u64, cpu_time_ns: u64) {
        let mut hosts = self.hosts.lock().unwrap();
        let entry = hosts.get_mut(&HostId::from(host)).expect("unknown fake host");
        entry.guests.insert(
            GuestId::from(guest),
            GuestInfo {
                state: GuestState::Running,
                max_memory_bytes: used_memory_bytes,
                used_memory_bytes,
                vcpus: 2,
                cpu_time_ns,
            },
        );
    }

    pub fn set_load(&self, host: &str, cpu_percent: f64, mem_percent: f64) {
        let mut hosts = self.hosts.lock().unwrap();
        let entry = hosts.get_mut(&HostId::from(host)).expect("unknown fake host");
        entry.cpu_percent = cpu_percent;
        entry.mem_percent = mem_percent;
    }

    pub fn set_reachable(&self, host: &str, reachable: bool) {
        let mut hosts = self.hosts.lock().unwrap();
        hosts.get_mut(&HostId::from(host)).expect("unknown fake host").reachable = reachable;
    }

    pub fn set_hanging(&self, host: &str, hanging: bool) {
        let mut hosts = self.hosts.lock().unwrap();
        hosts.get_mut(&HostId::from(host)).expect("unknown fake host").hanging = hanging;
    }

    /// Park forever if `id` is hanging, like a hypervisor that stopped answering.
    async fn stall_if_hanging(&self, id: &HostId) {
        let hanging = self
            .hosts
            .lock()
            .unwrap()
            .get(id)
            .is_some_and(|host| host.hanging);
        if hanging {
            std::future::pending::<()>().await;
        }
    }

    pub fn guests_on(&self, host: &str) -> Vec<GuestId> {
        self.hosts
            .lock()
            .unwrap()
            .get(&HostId::from(host))
            .map(|entry| entry.guests.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn host(&self, id: &HostId) -> Result<FakeHost, ConnectionError> {
        let hosts = self.hosts.lock().unwrap();
        match hosts.get(id) {
            Some(host) if host.reachable => Ok(host.clone()),
            Some(_) => Err(ConnectionError::new(id, "connection refused")),
            None => Err(ConnectionError::new(id, "no such host")),
        }
    }

    fn move_guest(&self, guest: &GuestId, from: &HostId, to: &HostId) -> bool {
        let mut hosts = self.hosts.lock().unwrap();
        let Some(info) = hosts.get_mut(from).and_then(|entry| entry.guests.remove(guest)) else {
            return false;
        };
        match hosts.get_mut(to) {
            Some(entry) => {
                entry.guests.insert(guest.clone(), info);
                true
            }
            None => false,
        }
    }
}

pub struct FakeConnector {
    world: Arc<FakeWorld>,
}

impl FakeConnector {
    pub fn new(world: Arc<FakeWorld>) -> Arc<Self> {
        Arc::new(Self { world })
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, host: &HostId) -> Result<Arc<dyn HypervisorConnection>, ConnectionError> {
        self.world.stall_if_hanging(host).await;
        self.world.host(host)?;
        Ok(Arc::new(FakeConnection {
            host: host.clone(),
            uri: format!("fake+tcp://{}/system", host),
            world: Arc::clone(&self.world),
        }))
    }

    fn sampler(&self, host: &HostId) -> Result<Box<dyn HostSampler>, ConnectionError> {
        self.world.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSampler {
            host: host.clone(),
            world: Arc::clone(&self.world),
            reads: 0,
        }))
    }
}

pub struct FakeConnection {
    host: HostId,
    uri: String,
    world: Arc<FakeWorld>,
}

#[async_trait]
impl HypervisorConnection for FakeConnection {
    fn host_id(&self) -> &HostId {
        &self.host
    }

    fn uri(&self) -> &str {
        &self.uri
    }

    async fn list_active_guests(&self) -> Result<Vec<GuestHandle>, ConnectionError> {
        let host = self.world.host(&self.host)?;
        Ok(host
            .guests
            .keys()
            .map(|name| GuestHandle::new(self.host.clone(), name.clone()))
            .collect())
    }

    async fn guest_info(&self, guest: &GuestHandle) -> Result<GuestInfo, ConnectionError> {
        let host = self.world.host(&self.host)?;
        host.guests
            .get(&guest.name)
            .cloned()
            .ok_or_else(|| ConnectionError::new(&self.host, format!("domain {} not found", guest.name)))
    }
}

/// First reading of every sampler is [`WARMUP_CPU_READING`], like a real
/// delta-based sampler without a baseline.
pub struct FakeSampler {
    host: HostId,
    world: Arc<FakeWorld>,
    reads: usize,
}

#[async_trait]
impl HostSampler for FakeSampler {
    async fn cpu_percent(&mut self) -> Result<f64, ConnectionError> {
        self.world.stall_if_hanging(&self.host).await;
        let host = self.world.host(&self.host)?;
        self.world.cpu_reads.fetch_add(1, Ordering::SeqCst);
        self.reads += 1;
        if self.reads == 1 {
            return Ok(WARMUP_CPU_READING);
        }
        Ok(host.cpu_percent)
    }

    async fn memory_percent(&mut self) -> Result<f64, ConnectionError> {
        Ok(self.world.host(&self.host)?.mem_percent)
    }

    async fn memory_total_bytes(&mut self) -> Result<u64, ConnectionError> {
        Ok(self.world.host(&self.host)?.memory_total_bytes)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Succeed,
    Fail(String),
    /// The migration future panics.
    Panic,
}

/// Moves guests inside the [`FakeWorld`] after `delay`, unless cancelled.
pub struct FakeMigrator {
    world: Arc<FakeWorld>,
    outcome: Mutex<Outcome>,
    delay: Mutex<Duration>,
    pub calls: AtomicUsize,
}

impl FakeMigrator {
    pub fn new(world: Arc<FakeWorld>) -> Arc<Self> {
        Arc::new(Self {
            world,
            outcome: Mutex::new(Outcome::Succeed),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_outcome(&self, outcome: Outcome) {
        *self.outcome.lock().unwrap() = outcome;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl Migrator for FakeMigrator {
    async fn migrate_live(
        &self,
        guest: &GuestHandle,
        source: &dyn HypervisorConnection,
        destination: &dyn HypervisorConnection,
        _options: &MigrationOptions,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<GuestHandle, MigrationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        let outcome = self.outcome.lock().unwrap().clone();

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.wait_for(|cancelled| *cancelled) => {
                return Err(MigrationError::Aborted(format!("migration of {} cancelled", guest.name)));
            }
        }

        match outcome {
            Outcome::Succeed => {
                if !self.world.move_guest(&guest.name, source.host_id(), destination.host_id()) {
                    return Err(MigrationError::Rejected("guest vanished".to_string()));
                }
                Ok(GuestHandle::new(destination.host_id().clone(), guest.name.clone()))
            }
            Outcome::Fail(reason) => Err(MigrationError::Rejected(reason)),
            Outcome::Panic => panic!("fake migrator blew up migrating {}", guest.name),
        }
    }
}

/// Config for the given hosts, tuned so tests need no real waiting.
pub fn test_config(hosts: &[&str]) -> BalancerConfig {
    let mut config = BalancerConfig::default();
    config.hosts = hosts
        .iter()
        .map(|id| HostConfig {
            id: HostId::from(*id),
            uri: format!("fake+tcp://{}/system", id),
            local: false,
        })
        .collect();
    config.scheduler.interval_seconds = 1;
    config.monitor.warmup_millis = 0;
    config.monitor.timeout_seconds = 2;
    config.coordinator.shutdown_grace_seconds = 1;
    config
}

pub fn load(host: &str, cpu_percent: f64, mem_percent: f64, memory_total_bytes: u64) -> HostLoad {
    HostLoad {
        host_id: HostId::from(host),
        cpu_percent,
        mem_percent,
        memory_total_bytes,
        sampled_at: Utc::now(),
    }
}

pub fn guest(host: &str, guest: &str, used_memory_bytes: u64, cpu_time_ns: u64) -> GuestStats {
    GuestStats {
        guest_id: GuestId::from(guest),
        host_id: HostId::from(host),
        state: GuestState::Running,
        max_memory_bytes: used_memory_bytes,
        used_memory_bytes,
        vcpus: 2,
        cpu_time_ns,
        sampled_at: Utc::now(),
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
