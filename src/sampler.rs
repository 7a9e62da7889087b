// Host sampler for the machine the balancer itself runs on.

use async_trait::async_trait;
use nix::sys::sysinfo::sysinfo;

use crate::error::ConnectionError;
use crate::hypervisor::HostSampler;
use crate::types::HostId;
use crate::virsh::CpuCounters;

const PROC_STAT: &str = "/proc/stat";
const PROC_MEMINFO: &str = "/proc/meminfo";

pub struct LocalHostSampler {
    host: HostId,
    previous_cpu: Option<CpuCounters>,
}

impl LocalHostSampler {
    pub fn new(host: HostId) -> Self {
        Self {
            host,
            previous_cpu: None,
        }
    }

    fn read(&self, path: &str) -> Result<String, ConnectionError> {
        std::fs::read_to_string(path)
            .map_err(|e| ConnectionError::new(&self.host, format!("cannot read {}: {}", path, e)))
    }
}

/// Aggregate `cpu` line of /proc/stat.
pub fn parse_proc_stat(contents: &str) -> Option<CpuCounters> {
    let line = contents.lines().find(|line| line.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|field| field.parse().ok())
        .collect();

    if fields.len() < 4 {
        return None;
    }

    // user nice system idle iowait irq softirq steal; guest time is already in user.
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let busy = fields[0]
        + fields[1]
        + fields[2]
        + fields.iter().skip(5).take(3).sum::<u64>();

    Some(CpuCounters { busy, idle })
}

/// `MemAvailable` from /proc/meminfo, in bytes.
pub fn parse_mem_available(contents: &str) -> Option<u64> {
    let line = contents.lines().find(|line| line.starts_with("MemAvailable:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

#[async_trait]
impl HostSampler for LocalHostSampler {
    async fn cpu_percent(&mut self) -> Result<f64, ConnectionError> {
        let contents = self.read(PROC_STAT)?;
        let current = parse_proc_stat(&contents)
            .ok_or_else(|| ConnectionError::new(&self.host, "unparseable /proc/stat"))?;

        let percent = match self.previous_cpu {
            Some(previous) => current.busy_percent_since(&previous),
            None => 0.0,
        };
        self.previous_cpu = Some(current);
        Ok(percent)
    }

    async fn memory_percent(&mut self) -> Result<f64, ConnectionError> {
        let info = sysinfo().map_err(|e| ConnectionError::new(&self.host, e.to_string()))?;
        let total = info.ram_total();
        if total == 0 {
            return Err(ConnectionError::new(&self.host, "sysinfo reported no memory"));
        }

        // Older kernels lack MemAvailable; fall back to plain free memory.
        let available = self
            .read(PROC_MEMINFO)
            .ok()
            .and_then(|contents| parse_mem_available(&contents))
            .unwrap_or_else(|| info.ram_unused());

        let used = total.saturating_sub(available);
        Ok(used as f64 / total as f64 * 100.0)
    }

    async fn memory_total_bytes(&mut self) -> Result<u64, ConnectionError> {
        let info = sysinfo().map_err(|e| ConnectionError::new(&self.host, e.to_string()))?;
        Ok(info.ram_total())
    }
}
