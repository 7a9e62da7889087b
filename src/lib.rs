pub mod balancer;
pub mod config;
pub mod coordinator;
pub mod detector;
pub mod error;
pub mod fleet;
pub mod hypervisor;
pub mod logger;
pub mod monitor;
pub mod sampler;
pub mod scheduler;
pub mod selector;
pub mod types;
pub mod virsh;

pub use error::BalancerError;
pub use types::{GuestId, GuestStats, HostId, HostLoad};

pub type Result<T> = std::result::Result<T, BalancerError>;

pub use balancer::{Balancer, TaskOverview};
pub use config::BalancerConfig;
pub use coordinator::{MigrationCoordinator, MigrationTask, TaskState, TaskTrigger};
pub use fleet::{FleetSnapshot, FleetState};
pub use hypervisor::{Connector, HostSampler, HypervisorConnection, Migrator};
