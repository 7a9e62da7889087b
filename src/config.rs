use crate::{BalancerError, Result, selector::RankingPolicy, types::HostId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "Balancer.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Free-form fleet name, only used in logs.
    pub fleet: Option<String>,
    #[serde(default, rename = "host")]
    pub hosts: Vec<HostConfig>,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub selector: SelectorConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub id: HostId,
    /// libvirt connection URI, e.g. `qemu+ssh://hv1/system`.
    pub uri: String,
    /// Sample CPU and memory from this machine's /proc instead of through libvirt.
    #[serde(default)]
    pub local: bool,
}

/// Load level above which a host counts as overloaded. Shared by detector and selector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default = "default_threshold_percent")]
    pub cpu_percent: f64,
    #[serde(default = "default_threshold_percent")]
    pub mem_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Number of consecutive samples that must agree before the verdict flips.
    #[serde(default = "default_detector_window")]
    pub window: usize,
    /// Quiet period after a host triggered a migration.
    #[serde(default = "default_detector_cooldown_seconds")]
    pub cooldown_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Headroom a destination must keep below the thresholds after receiving the guest.
    #[serde(default = "default_margin_percent")]
    pub margin_percent: f64,
    #[serde(default)]
    pub ranking: RankingPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_failure_cooldown_seconds")]
    pub failure_cooldown_seconds: u64,
    /// Passed through to the migrator; `None` leaves the hypervisor default.
    #[serde(default)]
    pub bandwidth_mibps: Option<u64>,
    #[serde(default)]
    pub disk_migration: bool,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
    /// Abort a live migration that has not converged after this long. 0 disables the limit.
    #[serde(default = "default_migration_timeout_seconds")]
    pub migration_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Samples older than this are ignored by the detector and selector.
    #[serde(default = "default_staleness_seconds")]
    pub staleness_seconds: u64,
    /// Pause between the discarded first CPU reading of a session and the first real one.
    #[serde(default = "default_warmup_millis")]
    pub warmup_millis: u64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            fleet: None,
            hosts: vec![HostConfig {
                id: HostId::from("localhost"),
                uri: "qemu:///system".to_string(),
                local: true,
            }],
            thresholds: Thresholds::default(),
            detector: DetectorConfig::default(),
            selector: SelectorConfig::default(),
            coordinator: CoordinatorConfig::default(),
            scheduler: SchedulerConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_percent: default_threshold_percent(),
            mem_percent: default_threshold_percent(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window: default_detector_window(),
            cooldown_seconds: default_detector_cooldown_seconds(),
        }
    }
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            margin_percent: default_margin_percent(),
            ranking: RankingPolicy::default(),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            failure_cooldown_seconds: default_failure_cooldown_seconds(),
            bandwidth_mibps: None,
            disk_migration: false,
            history_limit: default_history_limit(),
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
            migration_timeout_seconds: default_migration_timeout_seconds(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_monitor_timeout_seconds(),
            staleness_seconds: default_staleness_seconds(),
            warmup_millis: default_warmup_millis(),
        }
    }
}

fn default_threshold_percent() -> f64 {
    90.0
}

fn default_detector_window() -> usize {
    2
}

fn default_detector_cooldown_seconds() -> u64 {
    300
}

fn default_margin_percent() -> f64 {
    10.0
}

fn default_max_concurrent() -> usize {
    2
}

fn default_failure_cooldown_seconds() -> u64 {
    600
}

fn default_history_limit() -> usize {
    100
}

fn default_shutdown_grace_seconds() -> u64 {
    30
}

fn default_migration_timeout_seconds() -> u64 {
    1800 // 30 minutes
}

fn default_interval_seconds() -> u64 {
    10
}

fn default_monitor_timeout_seconds() -> u64 {
    15
}

fn default_staleness_seconds() -> u64 {
    60
}

fn default_warmup_millis() -> u64 {
    1000
}

impl DetectorConfig {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_seconds as i64)
    }
}

impl CoordinatorConfig {
    pub fn failure_cooldown(&self) -> Duration {
        Duration::from_secs(self.failure_cooldown_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    pub fn migration_timeout(&self) -> Option<Duration> {
        (self.migration_timeout_seconds > 0).then(|| Duration::from_secs(self.migration_timeout_seconds))
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

impl MonitorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn staleness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.staleness_seconds as i64)
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_millis)
    }
}

impl BalancerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> Result<Self> {
        let config: BalancerConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| BalancerError::ConfigError(e.to_string()))?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Use `path` if it exists, else the per-user config directory, else defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::from_file(path);
        }

        if let Some(user_path) = user_config_path() {
            if user_path.exists() {
                return Self::from_file(user_path);
            }
        }

        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(BalancerError::InvalidConfig(
                "at least one [[host]] entry is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for host in &self.hosts {
            if host.uri.trim().is_empty() {
                return Err(BalancerError::InvalidConfig(format!(
                    "host '{}' has an empty uri",
                    host.id
                )));
            }
            if !seen.insert(&host.id) {
                return Err(BalancerError::InvalidConfig(format!(
                    "host '{}' is listed twice",
                    host.id
                )));
            }
        }

        for (name, value) in [
            ("thresholds.cpu_percent", self.thresholds.cpu_percent),
            ("thresholds.mem_percent", self.thresholds.mem_percent),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(BalancerError::InvalidConfig(format!(
                    "{} must be within 0..=100, got {}",
                    name, value
                )));
            }
        }

        if !(0.0..100.0).contains(&self.selector.margin_percent) {
            return Err(BalancerError::InvalidConfig(format!(
                "selector.margin_percent must be within 0..100, got {}",
                self.selector.margin_percent
            )));
        }

        if self.detector.window == 0 {
            return Err(BalancerError::InvalidConfig(
                "detector.window must be at least 1".to_string(),
            ));
        }

        if self.coordinator.max_concurrent == 0 {
            return Err(BalancerError::InvalidConfig(
                "coordinator.max_concurrent must be at least 1".to_string(),
            ));
        }

        if self.scheduler.interval_seconds == 0 {
            return Err(BalancerError::InvalidConfig(
                "scheduler.interval_seconds must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn get_host(&self, id: &HostId) -> Option<&HostConfig> {
        self.hosts.iter().find(|host| &host.id == id)
    }

    pub fn host_ids(&self) -> Vec<HostId> {
        self.hosts.iter().map(|host| host.id.clone()).collect()
    }
}

pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("nova-balancer").join(DEFAULT_CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_parsing() {
        let toml_str = r#"
fleet = "rack-3"

[[host]]
id = "hv1"
uri = "qemu+ssh://hv1/system"

[[host]]
id = "hv2"
uri = "qemu+ssh://hv2/system"

[thresholds]
cpu_percent = 85.0

[selector]
margin_percent = 15.0
ranking = "largest-memory-first"

[coordinator]
max_concurrent = 4
bandwidth_mibps = 500
"#;

        let config = BalancerConfig::from_str(toml_str).unwrap();
        assert_eq!(config.fleet, Some("rack-3".to_string()));
        assert_eq!(config.hosts.len(), 2);
        assert_eq!(config.thresholds.cpu_percent, 85.0);
        assert_eq!(config.thresholds.mem_percent, 90.0);
        assert_eq!(config.selector.margin_percent, 15.0);
        assert_eq!(config.selector.ranking, RankingPolicy::LargestMemoryFirst);
        assert_eq!(config.coordinator.max_concurrent, 4);
        assert_eq!(config.coordinator.bandwidth_mibps, Some(500));
        assert!(!config.coordinator.disk_migration);

        let hv2 = config.get_host(&HostId::from("hv2")).unwrap();
        assert_eq!(hv2.uri, "qemu+ssh://hv2/system");
        assert!(!hv2.local);
    }

    #[test]
    fn defaults_are_valid() {
        let config = BalancerConfig::default();
        assert_eq!(config.thresholds.cpu_percent, 90.0);
        assert_eq!(config.thresholds.mem_percent, 90.0);
        assert_eq!(config.detector.window, 2);
        assert_eq!(config.selector.margin_percent, 10.0);
        assert_eq!(config.selector.ranking, RankingPolicy::BusiestFirst);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_duplicate_hosts() {
        let toml_str = r#"
[[host]]
id = "hv1"
uri = "qemu+ssh://hv1/system"

[[host]]
id = "hv1"
uri = "qemu+ssh://hv1-alt/system"
"#;
        assert!(matches!(
            BalancerConfig::from_str(toml_str),
            Err(BalancerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let toml_str = r#"
[[host]]
id = "hv1"
uri = "qemu:///system"

[thresholds]
mem_percent = 120.0
"#;
        assert!(BalancerConfig::from_str(toml_str).is_err());
    }

    #[test]
    fn rejects_empty_fleet() {
        assert!(BalancerConfig::from_str("fleet = \"empty\"").is_err());
    }
}
