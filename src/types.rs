use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a hypervisor in the fleet.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(String);

/// Identifier of a guest (libvirt domain name). Stable across migration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GuestId(String);

macro_rules! string_id {
    ($ty:ident) => {
        impl $ty {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $ty {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $ty {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(HostId);
string_id!(GuestId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuestState {
    Running,
    Paused,
    Shutdown,
    Crashed,
    Other,
}

impl GuestState {
    pub fn from_virsh(state: &str) -> Self {
        match state.trim() {
            "running" => GuestState::Running,
            "paused" => GuestState::Paused,
            "shut off" | "shutdown" => GuestState::Shutdown,
            "crashed" => GuestState::Crashed,
            _ => GuestState::Other,
        }
    }
}

/// Resource usage of one guest, as seen by its current host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestStats {
    pub guest_id: GuestId,
    pub host_id: HostId,
    pub state: GuestState,
    pub max_memory_bytes: u64,
    pub used_memory_bytes: u64,
    pub vcpus: u32,
    pub cpu_time_ns: u64,
    pub sampled_at: DateTime<Utc>,
}

/// Aggregate pressure on one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostLoad {
    pub host_id: HostId,
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub memory_total_bytes: u64,
    pub sampled_at: DateTime<Utc>,
}

impl HostLoad {
    /// Share of this host's memory `bytes` would occupy, in percent.
    pub fn memory_share_percent(&self, bytes: u64) -> f64 {
        if self.memory_total_bytes == 0 {
            return f64::INFINITY;
        }
        bytes as f64 * 100.0 / self.memory_total_bytes as f64
    }

    pub fn combined_score(&self) -> f64 {
        self.cpu_percent + self.mem_percent
    }

    pub fn is_fresh(&self, now: DateTime<Utc>, staleness: chrono::Duration) -> bool {
        now.signed_duration_since(self.sampled_at) <= staleness
    }
}

/// One successful monitoring pass over a host.
#[derive(Debug, Clone)]
pub struct HostSample {
    pub load: HostLoad,
    pub guests: Vec<GuestStats>,
}
