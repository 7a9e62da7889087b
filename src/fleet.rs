use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::ReservationConflict;
use crate::types::{GuestId, GuestStats, HostId, HostLoad};
use crate::{BalancerError, Result, log_debug, log_info};

#[derive(Debug, Clone, Default, Serialize)]
pub struct HostEntry {
    pub load: Option<HostLoad>,
    pub guests: BTreeMap<GuestId, GuestStats>,
    /// False after the latest sampling attempt failed. The old load is kept
    /// so "unreachable" can be told apart from "never sampled".
    pub reachable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reservation {
    pub guest_id: GuestId,
    pub source: Option<HostId>,
    pub destination: Option<HostId>,
    pub reserved_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    hosts: BTreeMap<HostId, HostEntry>,
    locations: HashMap<GuestId, HostId>,
    reservations: HashMap<GuestId, Reservation>,
    cooldowns: HashMap<GuestId, DateTime<Utc>>,
    /// When `relocate` last moved each guest. Reports taken before that are stale.
    relocated_at: HashMap<GuestId, DateTime<Utc>>,
    version: u64,
}

/// Shared view of the fleet: per-host load and guest inventory, guest
/// locations, in-flight reservations and failure cooldowns.
///
/// Every mutation happens under one lock, so a [`FleetSnapshot`] never shows a
/// guest under two hosts, and an unreserved guest is never left without an owner.
#[derive(Debug, Default)]
pub struct FleetState {
    inner: Mutex<Inner>,
}

impl FleetState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a host before it has been sampled.
    pub fn register_host(&self, host: &HostId) {
        let mut inner = self.lock();
        inner.hosts.entry(host.clone()).or_default();
        inner.version += 1;
    }

    /// Replace `host`'s slice with a fresh sample.
    pub fn update(&self, host: &HostId, load: HostLoad, stats: Vec<GuestStats>) {
        let mut guard = self.lock();
        let inner = &mut *guard;

        let previous = inner
            .hosts
            .get_mut(host)
            .map(|entry| std::mem::take(&mut entry.guests))
            .unwrap_or_default();

        let sampled_at = load.sampled_at;
        let mut guests = BTreeMap::new();
        let mut moved_from: Vec<(GuestId, HostId)> = Vec::new();

        for stat in stats {
            let id = stat.guest_id.clone();
            let owner = inner.locations.get(&id).cloned();

            if inner.reservations.contains_key(&id) {
                // Mid-migration: only relocate() changes the owner.
                if owner.as_ref().is_none_or(|owner| owner == host) {
                    inner.locations.insert(id.clone(), host.clone());
                    guests.insert(id, stat);
                }
                continue;
            }

            if let Some(owner) = owner {
                let stale = inner
                    .relocated_at
                    .get(&id)
                    .is_some_and(|at| stat.sampled_at < *at);
                if &owner != host && stale {
                    log_debug!("Ignoring report of {} on {} taken before it moved to {}", id, host, owner);
                    continue;
                }
                if &owner != host {
                    log_info!("Guest {} moved from {} to {} outside the balancer", id, owner, host);
                    moved_from.push((id.clone(), owner));
                }
            }
            inner.locations.insert(id.clone(), host.clone());
            guests.insert(id, stat);
        }

        for (id, old) in previous {
            if guests.contains_key(&id) {
                continue;
            }
            let still_owner = inner.locations.get(&id) == Some(host);
            let arrived_after_sample = inner
                .relocated_at
                .get(&id)
                .is_some_and(|at| sampled_at < *at);
            if still_owner && (inner.reservations.contains_key(&id) || arrived_after_sample) {
                // Keep the ownership record until the migration settles.
                guests.insert(id, old);
            } else if still_owner {
                log_debug!("Guest {} no longer running on {}", id, host);
                inner.locations.remove(&id);
                inner.relocated_at.remove(&id);
            }
        }

        for (id, owner) in moved_from {
            if let Some(entry) = inner.hosts.get_mut(&owner) {
                entry.guests.remove(&id);
            }
        }

        let entry = inner.hosts.entry(host.clone()).or_default();
        entry.load = Some(load);
        entry.guests = guests;
        entry.reachable = true;
        inner.version += 1;
    }

    /// Note a failed sampling attempt. Inventory is left untouched.
    pub fn mark_unreachable(&self, host: &HostId) {
        let mut inner = self.lock();
        inner.hosts.entry(host.clone()).or_default().reachable = false;
        inner.version += 1;
    }

    pub fn snapshot(&self) -> FleetSnapshot {
        let inner = self.lock();
        FleetSnapshot {
            taken_at: Utc::now(),
            version: inner.version,
            hosts: inner.hosts.clone(),
            reservations: inner
                .reservations
                .iter()
                .map(|(id, reservation)| (id.clone(), reservation.clone()))
                .collect(),
            cooldowns: inner
                .cooldowns
                .iter()
                .map(|(id, until)| (id.clone(), *until))
                .collect(),
        }
    }

    /// Mark `guest` as having a migration in flight. False if it already had one
    /// or is still cooling down after a failure.
    pub fn reserve(&self, guest: &GuestId) -> bool {
        self.reserve_for(guest, None).is_ok()
    }

    /// Like [`reserve`](Self::reserve), recording `destination` so its pending
    /// load is counted against it until the reservation is released.
    pub fn reserve_for(
        &self,
        guest: &GuestId,
        destination: Option<&HostId>,
    ) -> std::result::Result<(), ReservationConflict> {
        let mut inner = self.lock();
        let now = Utc::now();

        if inner.reservations.contains_key(guest) {
            return Err(ReservationConflict::InFlight);
        }

        if let Some(until) = inner.cooldowns.get(guest).copied() {
            if until > now {
                return Err(ReservationConflict::CoolingDown {
                    remaining_secs: (until - now).num_seconds().max(1),
                });
            }
            inner.cooldowns.remove(guest);
        }

        let source = inner.locations.get(guest).cloned();
        inner.reservations.insert(
            guest.clone(),
            Reservation {
                guest_id: guest.clone(),
                source,
                destination: destination.cloned(),
                reserved_at: now,
            },
        );
        inner.version += 1;
        Ok(())
    }

    pub fn release(&self, guest: &GuestId) {
        let mut inner = self.lock();
        if inner.reservations.remove(guest).is_some() {
            inner.version += 1;
        }
    }

    /// Release and keep the guest ineligible for `cooldown`.
    pub fn release_with_cooldown(&self, guest: &GuestId, cooldown: Duration) {
        let mut inner = self.lock();
        inner.reservations.remove(guest);
        let cooldown = chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::MAX);
        let until = Utc::now().checked_add_signed(cooldown).unwrap_or(DateTime::<Utc>::MAX_UTC);
        inner.cooldowns.insert(guest.clone(), until);
        inner.version += 1;
    }

    /// Move `guest`'s ownership record and stats from `from` to `to`.
    pub fn relocate(&self, guest: &GuestId, from: &HostId, to: &HostId) -> Result<()> {
        let mut guard = self.lock();
        let inner = &mut *guard;

        let mut stats = inner
            .hosts
            .get_mut(from)
            .and_then(|entry| entry.guests.remove(guest))
            .ok_or_else(|| BalancerError::GuestNotFound(guest.clone()))?;

        stats.host_id = to.clone();
        inner
            .hosts
            .entry(to.clone())
            .or_default()
            .guests
            .insert(guest.clone(), stats);
        inner.locations.insert(guest.clone(), to.clone());
        inner.relocated_at.insert(guest.clone(), Utc::now());
        inner.version += 1;

        log_debug!("Relocated guest {} from {} to {}", guest, from, to);
        Ok(())
    }

    pub fn location(&self, guest: &GuestId) -> Option<HostId> {
        self.lock().locations.get(guest).cloned()
    }

    pub fn is_reserved(&self, guest: &GuestId) -> bool {
        self.lock().reservations.contains_key(guest)
    }
}

/// Immutable, self-consistent copy of [`FleetState`].
#[derive(Debug, Clone, Serialize)]
pub struct FleetSnapshot {
    pub taken_at: DateTime<Utc>,
    pub version: u64,
    pub hosts: BTreeMap<HostId, HostEntry>,
    pub reservations: BTreeMap<GuestId, Reservation>,
    pub cooldowns: BTreeMap<GuestId, DateTime<Utc>>,
}

impl FleetSnapshot {
    pub fn host(&self, host: &HostId) -> Option<&HostEntry> {
        self.hosts.get(host)
    }

    pub fn load(&self, host: &HostId) -> Option<&HostLoad> {
        self.hosts.get(host)?.load.as_ref()
    }

    /// Load of `host` if it is reachable and its sample is within `staleness`.
    pub fn fresh_load(&self, host: &HostId, staleness: chrono::Duration) -> Option<&HostLoad> {
        let entry = self.hosts.get(host)?;
        if !entry.reachable {
            return None;
        }
        entry
            .load
            .as_ref()
            .filter(|load| load.is_fresh(self.taken_at, staleness))
    }

    pub fn location(&self, guest: &GuestId) -> Option<&HostId> {
        self.hosts
            .iter()
            .find(|(_, entry)| entry.guests.contains_key(guest))
            .map(|(host, _)| host)
    }

    pub fn guest(&self, guest: &GuestId) -> Option<&GuestStats> {
        self.hosts
            .values()
            .find_map(|entry| entry.guests.get(guest))
    }

    pub fn is_reserved(&self, guest: &GuestId) -> bool {
        self.reservations.contains_key(guest)
    }

    pub fn is_cooling_down(&self, guest: &GuestId) -> bool {
        self.cooldowns
            .get(guest)
            .is_some_and(|until| *until > self.taken_at)
    }

    /// Memory of guests currently being migrated onto `host`.
    pub fn pending_bytes(&self, host: &HostId) -> u64 {
        self.reservations
            .values()
            .filter(|reservation| reservation.destination.as_ref() == Some(host))
            .filter_map(|reservation| self.guest(&reservation.guest_id))
            .map(|stats| stats.used_memory_bytes)
            .sum()
    }

    pub fn guest_count(&self) -> usize {
        self.hosts.values().map(|entry| entry.guests.len()).sum()
    }
}
