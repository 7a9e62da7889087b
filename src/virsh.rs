use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::{Duration, Instant, sleep_until};

use crate::config::HostConfig;
use crate::error::{ConnectionError, MigrationError};
use crate::hypervisor::{
    Connector, GuestHandle, GuestInfo, HostSampler, HypervisorConnection, MigrationOptions,
    Migrator,
};
use crate::sampler::LocalHostSampler;
use crate::types::{GuestId, GuestState, HostId};
use crate::{log_debug, log_error, log_info, log_warn};

const KIB: u64 = 1024;

async fn run_virsh(host: &HostId, uri: &str, args: &[&str]) -> Result<String, ConnectionError> {
    log_debug!("virsh -c {} {}", uri, args.join(" "));

    let output = Command::new("virsh")
        .arg("-c")
        .arg(uri)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ConnectionError::new(host, format!("failed to run virsh: {}", e)))?;

    if !output.status.success() {
        let error = String::from_utf8_lossy(&output.stderr);
        return Err(ConnectionError::new(host, error.trim().to_string()));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Opens `virsh` backed connections to the hosts listed in the config.
pub struct VirshConnector {
    hosts: HashMap<HostId, HostConfig>,
}

impl VirshConnector {
    pub fn new(hosts: &[HostConfig]) -> Self {
        Self {
            hosts: hosts
                .iter()
                .map(|host| (host.id.clone(), host.clone()))
                .collect(),
        }
    }

    fn host_config(&self, host: &HostId) -> Result<&HostConfig, ConnectionError> {
        self.hosts
            .get(host)
            .ok_or_else(|| ConnectionError::new(host, "host is not part of the fleet"))
    }

    pub fn check_virsh_available() -> bool {
        std::process::Command::new("virsh")
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl Connector for VirshConnector {
    async fn connect(&self, host: &HostId) -> Result<Arc<dyn HypervisorConnection>, ConnectionError> {
        let config = self.host_config(host)?;
        // Cheap round trip so an unreachable host fails here rather than mid-migration.
        run_virsh(host, &config.uri, &["uri"]).await?;

        Ok(Arc::new(VirshConnection {
            host: host.clone(),
            uri: config.uri.clone(),
        }))
    }

    fn sampler(&self, host: &HostId) -> Result<Box<dyn HostSampler>, ConnectionError> {
        let config = self.host_config(host)?;
        if config.local {
            Ok(Box::new(LocalHostSampler::new(host.clone())))
        } else {
            Ok(Box::new(VirshHostSampler::new(host.clone(), config.uri.clone())))
        }
    }
}

pub struct VirshConnection {
    host: HostId,
    uri: String,
}

#[async_trait]
impl HypervisorConnection for VirshConnection {
    fn host_id(&self) -> &HostId {
        &self.host
    }

    fn uri(&self) -> &str {
        &self.uri
    }

    async fn list_active_guests(&self) -> Result<Vec<GuestHandle>, ConnectionError> {
        let output = run_virsh(&self.host, &self.uri, &["list", "--name", "--state-running"]).await?;

        Ok(parse_guest_names(&output)
            .into_iter()
            .map(|name| GuestHandle::new(self.host.clone(), name))
            .collect())
    }

    async fn guest_info(&self, guest: &GuestHandle) -> Result<GuestInfo, ConnectionError> {
        let output = run_virsh(&self.host, &self.uri, &["dominfo", guest.name.as_str()]).await?;

        parse_dominfo(&output).ok_or_else(|| {
            ConnectionError::new(
                &self.host,
                format!("unparseable dominfo output for '{}'", guest.name),
            )
        })
    }
}

/// Domain names from `virsh list --name`, one per line.
pub fn parse_guest_names(output: &str) -> Vec<GuestId> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(GuestId::from)
        .collect()
}

/// Parse `virsh dominfo` into the same fields `virDomainGetInfo` returns.
pub fn parse_dominfo(output: &str) -> Option<GuestInfo> {
    let mut state = None;
    let mut vcpus = None;
    let mut cpu_time_ns = None;
    let mut max_memory_bytes = None;
    let mut used_memory_bytes = None;

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match key.trim() {
            "State" => state = Some(GuestState::from_virsh(value)),
            "CPU(s)" => vcpus = value.parse::<u32>().ok(),
            "CPU time" => {
                cpu_time_ns = value
                    .trim_end_matches('s')
                    .parse::<f64>()
                    .ok()
                    .map(|secs| (secs * 1_000_000_000.0) as u64)
            }
            "Max memory" => max_memory_bytes = parse_kib(value),
            "Used memory" => used_memory_bytes = parse_kib(value),
            _ => {}
        }
    }

    Some(GuestInfo {
        state: state?,
        max_memory_bytes: max_memory_bytes?,
        used_memory_bytes: used_memory_bytes?,
        vcpus: vcpus.unwrap_or(1),
        // A freshly started domain may not report CPU time yet.
        cpu_time_ns: cpu_time_ns.unwrap_or(0),
    })
}

fn parse_kib(value: &str) -> Option<u64> {
    let number = value.split_whitespace().next()?;
    number.parse::<u64>().ok().map(|kib| kib * KIB)
}

/// Cumulative host CPU counters from `virsh nodecpustats`, in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuCounters {
    pub busy: u64,
    pub idle: u64,
}

impl CpuCounters {
    /// Busy percentage between `previous` and `self`.
    pub fn busy_percent_since(&self, previous: &CpuCounters) -> f64 {
        let busy = self.busy.saturating_sub(previous.busy) as f64;
        let idle = self.idle.saturating_sub(previous.idle) as f64;
        let total = busy + idle;
        if total == 0.0 {
            return 0.0;
        }
        (busy / total * 100.0).clamp(0.0, 100.0)
    }
}

pub fn parse_cpu_stats(output: &str) -> Option<CpuCounters> {
    let mut counters = CpuCounters::default();
    let mut seen_idle = false;

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let Ok(value) = value.trim().parse::<u64>() else {
            continue;
        };

        match key.trim() {
            "idle" | "iowait" => {
                counters.idle += value;
                seen_idle = true;
            }
            "user" | "system" | "kernel" => counters.busy += value,
            _ => {}
        }
    }

    seen_idle.then_some(counters)
}

/// Host memory from `virsh nodememstats`: (used percent, total bytes).
pub fn parse_mem_stats(output: &str) -> Option<(f64, u64)> {
    let mut fields = HashMap::new();
    for line in output.lines() {
        if let Some((key, value)) = line.split_once(':') {
            if let Some(bytes) = parse_kib(value.trim()) {
                fields.insert(key.trim().to_string(), bytes);
            }
        }
    }

    let total = *fields.get("total")?;
    if total == 0 {
        return None;
    }
    let available = fields.get("free").copied().unwrap_or(0)
        + fields.get("buffers").copied().unwrap_or(0)
        + fields.get("cached").copied().unwrap_or(0);
    let used = total.saturating_sub(available);

    Some((used as f64 / total as f64 * 100.0, total))
}

/// Samples a remote host through libvirt's node statistics.
pub struct VirshHostSampler {
    host: HostId,
    uri: String,
    previous_cpu: Option<CpuCounters>,
    memory_total_bytes: Option<u64>,
}

impl VirshHostSampler {
    pub fn new(host: HostId, uri: String) -> Self {
        Self {
            host,
            uri,
            previous_cpu: None,
            memory_total_bytes: None,
        }
    }

    async fn read_memory(&mut self) -> Result<(f64, u64), ConnectionError> {
        let output = run_virsh(&self.host, &self.uri, &["nodememstats"]).await?;
        let (percent, total) = parse_mem_stats(&output)
            .ok_or_else(|| ConnectionError::new(&self.host, "unparseable nodememstats output"))?;
        self.memory_total_bytes = Some(total);
        Ok((percent, total))
    }
}

#[async_trait]
impl HostSampler for VirshHostSampler {
    async fn cpu_percent(&mut self) -> Result<f64, ConnectionError> {
        let output = run_virsh(&self.host, &self.uri, &["nodecpustats"]).await?;
        let current = parse_cpu_stats(&output)
            .ok_or_else(|| ConnectionError::new(&self.host, "unparseable nodecpustats output"))?;

        // No previous counters on the first call, so the reading is meaningless.
        let percent = match self.previous_cpu {
            Some(previous) => current.busy_percent_since(&previous),
            None => 0.0,
        };
        self.previous_cpu = Some(current);
        Ok(percent)
    }

    async fn memory_percent(&mut self) -> Result<f64, ConnectionError> {
        Ok(self.read_memory().await?.0)
    }

    async fn memory_total_bytes(&mut self) -> Result<u64, ConnectionError> {
        match self.memory_total_bytes {
            Some(total) => Ok(total),
            None => Ok(self.read_memory().await?.1),
        }
    }
}

/// Drives `virsh migrate --live` on the source host.
pub struct VirshMigrator {
    timeout: Option<Duration>,
}

impl VirshMigrator {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    fn build_command(
        guest: &GuestHandle,
        source: &dyn HypervisorConnection,
        destination: &dyn HypervisorConnection,
        options: &MigrationOptions,
    ) -> Command {
        let mut cmd = Command::new("virsh");
        cmd.args(["-c", source.uri()]);
        cmd.args(["migrate", "--live", "--persistent", "--undefinesource"]);

        if let Some(bandwidth) = options.bandwidth_mibps {
            cmd.args(["--bandwidth", &bandwidth.to_string()]);
        }

        if options.disk_migration {
            cmd.arg("--copy-storage-all");
        }

        cmd.arg(guest.name.as_str());
        cmd.arg(destination.uri());
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd
    }

    async fn abort_job(guest: &GuestHandle, source: &dyn HypervisorConnection) {
        log_warn!("Aborting migration job for guest '{}'", guest.name);
        if let Err(e) = run_virsh(source.host_id(), source.uri(), &["domjobabort", guest.name.as_str()]).await {
            log_error!("domjobabort failed for guest '{}': {}", guest.name, e);
        }
    }
}

enum AbortReason {
    Cancelled,
    TimedOut(Duration),
}

#[async_trait]
impl Migrator for VirshMigrator {
    async fn migrate_live(
        &self,
        guest: &GuestHandle,
        source: &dyn HypervisorConnection,
        destination: &dyn HypervisorConnection,
        options: &MigrationOptions,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<GuestHandle, MigrationError> {
        log_info!(
            "Starting live migration of '{}' from {} to {}",
            guest.name,
            source.host_id(),
            destination.host_id()
        );

        let child = Self::build_command(guest, source, destination, options)
            .spawn()
            .map_err(|e| MigrationError::Rejected(format!("failed to start virsh: {}", e)))?;

        let output = child.wait_with_output();
        tokio::pin!(output);

        let deadline = self.timeout.map(|timeout| (Instant::now() + timeout, timeout));
        let mut watching_cancel = true;
        let mut aborted: Option<AbortReason> = None;

        // After an abort keep waiting: the job only settles once virsh exits.
        let result = loop {
            tokio::select! {
                result = &mut output => break result,
                changed = cancel.changed(), if watching_cancel && aborted.is_none() => {
                    match changed {
                        Ok(()) if *cancel.borrow() => {
                            Self::abort_job(guest, source).await;
                            aborted = Some(AbortReason::Cancelled);
                        }
                        Ok(()) => {}
                        Err(_) => watching_cancel = false,
                    }
                }
                _ = async {
                    match deadline {
                        Some((at, _)) => sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                }, if aborted.is_none() => {
                    Self::abort_job(guest, source).await;
                    aborted = deadline.map(|(_, timeout)| AbortReason::TimedOut(timeout));
                }
            }
        };

        let output = result
            .map_err(|e| MigrationError::Rejected(format!("virsh migrate did not run: {}", e)))?;

        if output.status.success() {
            if aborted.is_some() {
                log_warn!(
                    "Migration of '{}' completed before the abort took effect",
                    guest.name
                );
            }
            return Ok(GuestHandle::new(
                destination.host_id().clone(),
                guest.name.clone(),
            ));
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(match aborted {
            Some(AbortReason::Cancelled) => MigrationError::Aborted(stderr),
            Some(AbortReason::TimedOut(timeout)) => MigrationError::Timeout(timeout),
            None => MigrationError::Rejected(stderr),
        })
    }
}
