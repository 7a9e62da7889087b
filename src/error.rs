use std::fmt;
use std::time::Duration;

use crate::types::{GuestId, HostId};

#[derive(Debug)]
pub enum BalancerError {
    InvalidConfig(String),
    ConfigError(String),
    HostNotFound(HostId),
    GuestNotFound(GuestId),
    NoDestination(GuestId),
    AtCapacity(usize),
    Reservation(ReservationConflict),
    Connection(ConnectionError),
    Monitor(MonitorError),
    IoError(std::io::Error),
    SerdeError(String),
}

impl fmt::Display for BalancerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalancerError::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            BalancerError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            BalancerError::HostNotFound(host) => write!(f, "Host '{}' not found", host),
            BalancerError::GuestNotFound(guest) => write!(f, "Guest '{}' not found", guest),
            BalancerError::NoDestination(guest) => {
                write!(f, "No host has spare capacity for guest '{}'", guest)
            }
            BalancerError::AtCapacity(limit) => write!(
                f,
                "Migration limit reached ({} in flight), try again later",
                limit
            ),
            BalancerError::Reservation(conflict) => write!(f, "{}", conflict),
            BalancerError::Connection(err) => write!(f, "{}", err),
            BalancerError::Monitor(err) => write!(f, "{}", err),
            BalancerError::IoError(err) => write!(f, "IO error: {}", err),
            BalancerError::SerdeError(err) => write!(f, "Configuration parse error: {}", err),
        }
    }
}

impl std::error::Error for BalancerError {}

impl From<std::io::Error> for BalancerError {
    fn from(err: std::io::Error) -> Self {
        BalancerError::IoError(err)
    }
}

impl From<toml::de::Error> for BalancerError {
    fn from(err: toml::de::Error) -> Self {
        BalancerError::SerdeError(err.to_string())
    }
}

impl From<serde_json::Error> for BalancerError {
    fn from(err: serde_json::Error) -> Self {
        BalancerError::SerdeError(err.to_string())
    }
}

impl From<ReservationConflict> for BalancerError {
    fn from(err: ReservationConflict) -> Self {
        BalancerError::Reservation(err)
    }
}

impl From<ConnectionError> for BalancerError {
    fn from(err: ConnectionError) -> Self {
        BalancerError::Connection(err)
    }
}

impl From<MonitorError> for BalancerError {
    fn from(err: MonitorError) -> Self {
        BalancerError::Monitor(err)
    }
}

/// Failure to talk to a hypervisor at all.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Cannot reach host '{host}': {reason}")]
pub struct ConnectionError {
    pub host: HostId,
    pub reason: String,
}

impl ConnectionError {
    pub fn new(host: &HostId, reason: impl Into<String>) -> Self {
        Self {
            host: host.clone(),
            reason: reason.into(),
        }
    }
}

/// Sampling failures. Either way the host is left out of the current tick.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MonitorError {
    #[error("Host '{0}' unreachable: {1}")]
    Unreachable(HostId, String),

    #[error("Sampling host '{0}' timed out after {1:?}")]
    Timeout(HostId, Duration),
}

impl From<ConnectionError> for MonitorError {
    fn from(err: ConnectionError) -> Self {
        MonitorError::Unreachable(err.host, err.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MigrationError {
    #[error("Migration rejected: {0}")]
    Rejected(String),

    #[error("Migration aborted: {0}")]
    Aborted(String),

    #[error("Migration timed out after {0:?}")]
    Timeout(Duration),
}

/// Another task already owns the guest, or it failed recently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReservationConflict {
    #[error("Guest already has a migration in flight")]
    InFlight,

    #[error("Guest is cooling down after a failed migration ({remaining_secs}s left)")]
    CoolingDown { remaining_secs: i64 },
}
