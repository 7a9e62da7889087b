use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::config::{SelectorConfig, Thresholds};
use crate::fleet::FleetSnapshot;
use crate::types::{GuestId, GuestStats, HostId, HostLoad};
use crate::log_debug;

/// Order in which guests on an overloaded host are considered for eviction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RankingPolicy {
    /// Highest cumulative CPU time first, then highest memory use.
    #[default]
    BusiestFirst,
    /// Highest memory use first, then highest CPU time.
    LargestMemoryFirst,
}

impl RankingPolicy {
    /// `Less` means `a` should be evicted before `b`. Remaining ties go to the
    /// lower guest id so the choice is deterministic.
    pub fn compare(&self, a: &GuestStats, b: &GuestStats) -> Ordering {
        let primary = match self {
            RankingPolicy::BusiestFirst => b
                .cpu_time_ns
                .cmp(&a.cpu_time_ns)
                .then(b.used_memory_bytes.cmp(&a.used_memory_bytes)),
            RankingPolicy::LargestMemoryFirst => b
                .used_memory_bytes
                .cmp(&a.used_memory_bytes)
                .then(b.cpu_time_ns.cmp(&a.cpu_time_ns)),
        };
        primary.then_with(|| a.guest_id.cmp(&b.guest_id))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationCandidate {
    pub guest: GuestId,
    pub source: HostId,
    pub destination: HostId,
    /// Destination memory use after the move, including other in-flight arrivals.
    pub projected_mem_percent: f64,
}

/// Picks which guest leaves an overloaded host and where it goes.
#[derive(Debug, Clone)]
pub struct CandidateSelector {
    thresholds: Thresholds,
    margin_percent: f64,
    ranking: RankingPolicy,
    staleness: chrono::Duration,
}

impl CandidateSelector {
    pub fn new(thresholds: Thresholds, config: &SelectorConfig, staleness: chrono::Duration) -> Self {
        Self {
            thresholds,
            margin_percent: config.margin_percent,
            ranking: config.ranking,
            staleness,
        }
    }

    fn mem_cap(&self) -> f64 {
        self.thresholds.mem_percent - self.margin_percent
    }

    fn cpu_cap(&self) -> f64 {
        self.thresholds.cpu_percent - self.margin_percent
    }

    /// Guests on `host` eligible for eviction, best candidate first.
    pub fn rank_guests<'a>(&self, host: &HostId, snapshot: &'a FleetSnapshot) -> Vec<&'a GuestStats> {
        let Some(entry) = snapshot.host(host) else {
            return Vec::new();
        };

        let mut guests: Vec<&GuestStats> = entry
            .guests
            .values()
            .filter(|stats| !snapshot.is_reserved(&stats.guest_id))
            .filter(|stats| !snapshot.is_cooling_down(&stats.guest_id))
            .filter(|stats| snapshot.taken_at.signed_duration_since(stats.sampled_at) <= self.staleness)
            .collect();

        guests.sort_by(|a, b| self.ranking.compare(a, b));
        guests
    }

    /// Memory percent of `destination` once `guest` and every other migration
    /// already headed there have landed.
    pub fn projected_mem_percent(
        &self,
        guest: &GuestStats,
        destination: &HostLoad,
        snapshot: &FleetSnapshot,
    ) -> f64 {
        let pending = snapshot.pending_bytes(&destination.host_id);
        destination.mem_percent
            + destination.memory_share_percent(pending)
            + destination.memory_share_percent(guest.used_memory_bytes)
    }

    /// Projected memory percent, or `None` if the move would break the safety margin.
    fn project(&self, guest: &GuestStats, destination: &HostLoad, snapshot: &FleetSnapshot) -> Option<f64> {
        if destination.cpu_percent > self.cpu_cap() {
            return None;
        }

        let projected = self.projected_mem_percent(guest, destination, snapshot);
        (projected <= self.mem_cap()).then_some(projected)
    }

    pub fn staleness(&self) -> chrono::Duration {
        self.staleness
    }

    /// Least loaded host that can take `guest` without crossing the margin.
    pub fn select_destination(
        &self,
        guest: &GuestStats,
        source: &HostId,
        snapshot: &FleetSnapshot,
    ) -> Option<(HostId, f64)> {
        let mut survivors: Vec<(&HostLoad, f64)> = snapshot
            .hosts
            .keys()
            .filter(|host| *host != source)
            .filter_map(|host| snapshot.fresh_load(host, self.staleness))
            .filter_map(|load| self.project(guest, load, snapshot).map(|projected| (load, projected)))
            .collect();

        survivors.sort_by(|(a, _), (b, _)| {
            a.combined_score()
                .total_cmp(&b.combined_score())
                .then_with(|| a.host_id.cmp(&b.host_id))
        });

        survivors
            .first()
            .map(|(load, projected)| (load.host_id.clone(), *projected))
    }

    /// Choose a guest to move off `host` and a destination for it.
    ///
    /// Guests are tried in rank order and the first one some host can absorb
    /// wins. `None` if nothing fits; a guest is never forced onto a busier host.
    pub fn select_migration(&self, host: &HostId, snapshot: &FleetSnapshot) -> Option<MigrationCandidate> {
        for guest in self.rank_guests(host, snapshot) {
            match self.select_destination(guest, host, snapshot) {
                Some((destination, projected_mem_percent)) => {
                    return Some(MigrationCandidate {
                        guest: guest.guest_id.clone(),
                        source: host.clone(),
                        destination,
                        projected_mem_percent,
                    });
                }
                None => log_debug!("No destination can absorb guest {} from {}", guest.guest_id, host),
            }
        }
        None
    }
}
