//! Collaborator interfaces the scheduler consumes.
//!
//! Everything that actually talks to a hypervisor or the OS sits behind these
//! traits: `virsh` implements them against libvirt, `sampler` against /proc,
//! and the tests against in-memory fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{ConnectionError, MigrationError};
use crate::types::{GuestId, GuestState, HostId};

/// Reference to a guest on a particular host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GuestHandle {
    pub host: HostId,
    pub name: GuestId,
}

impl GuestHandle {
    pub fn new(host: HostId, name: GuestId) -> Self {
        Self { host, name }
    }
}

/// Equivalent of libvirt's `virDomainGetInfo`.
#[derive(Debug, Clone, PartialEq)]
pub struct GuestInfo {
    pub state: GuestState,
    pub max_memory_bytes: u64,
    pub used_memory_bytes: u64,
    pub vcpus: u32,
    pub cpu_time_ns: u64,
}

#[async_trait]
pub trait HypervisorConnection: Send + Sync {
    fn host_id(&self) -> &HostId;

    /// Connection URI other hosts can use to reach this one (migration target).
    fn uri(&self) -> &str;

    async fn list_active_guests(&self) -> Result<Vec<GuestHandle>, ConnectionError>;

    async fn guest_info(&self, guest: &GuestHandle) -> Result<GuestInfo, ConnectionError>;

    async fn lookup_guest(&self, name: &GuestId) -> Result<Option<GuestHandle>, ConnectionError> {
        let guests = self.list_active_guests().await?;
        Ok(guests.into_iter().find(|guest| &guest.name == name))
    }
}

/// Stateful host load sampler. The first `cpu_percent` reading of a fresh
/// sampler is meaningless and must be discarded by the caller.
#[async_trait]
pub trait HostSampler: Send {
    async fn cpu_percent(&mut self) -> Result<f64, ConnectionError>;

    async fn memory_percent(&mut self) -> Result<f64, ConnectionError>;

    async fn memory_total_bytes(&mut self) -> Result<u64, ConnectionError>;
}

/// Opens connections and samplers for fleet members.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &HostId) -> Result<Arc<dyn HypervisorConnection>, ConnectionError>;

    fn sampler(&self, host: &HostId) -> Result<Box<dyn HostSampler>, ConnectionError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationOptions {
    pub bandwidth_mibps: Option<u64>,
    pub disk_migration: bool,
}

#[async_trait]
pub trait Migrator: Send + Sync {
    /// Live-migrate `guest` from `source` to `destination`.
    ///
    /// Must watch `cancel` and abort the job when it flips to `true`, but only
    /// return once the hypervisor has settled on one owner for the guest.
    async fn migrate_live(
        &self,
        guest: &GuestHandle,
        source: &dyn HypervisorConnection,
        destination: &dyn HypervisorConnection,
        options: &MigrationOptions,
        cancel: watch::Receiver<bool>,
    ) -> Result<GuestHandle, MigrationError>;
}
