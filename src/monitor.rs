use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, sleep, timeout};

use crate::config::MonitorConfig;
use crate::error::{ConnectionError, MonitorError};
use crate::hypervisor::{Connector, HostSampler, HypervisorConnection};
use crate::types::{GuestStats, HostId, HostLoad, HostSample};
use crate::{log_debug, log_warn};

struct HostSession {
    connection: Arc<dyn HypervisorConnection>,
    sampler: Box<dyn HostSampler>,
}

type SessionSlot = Arc<Mutex<Option<HostSession>>>;

/// Samples hosts through the collaborator traits, keeping one session per host.
///
/// A session starts with a discarded CPU reading, so callers only ever see
/// readings taken over a real interval. Any failure drops the session; the
/// next sample reconnects and warms up again.
pub struct HostMonitor {
    connector: Arc<dyn Connector>,
    timeout: Duration,
    warmup: Duration,
    sessions: Mutex<HashMap<HostId, SessionSlot>>,
}

impl HostMonitor {
    pub fn new(connector: Arc<dyn Connector>, config: &MonitorConfig) -> Self {
        Self {
            connector,
            timeout: config.timeout(),
            warmup: config.warmup(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Take one all-or-nothing sample of `host` within the configured timeout.
    pub async fn sample(&self, host: &HostId) -> Result<HostSample, MonitorError> {
        let slot = self.slot(host).await;
        let mut session = slot.lock().await;

        match timeout(self.timeout, self.sample_session(host, &mut session)).await {
            Ok(Ok(sample)) => Ok(sample),
            Ok(Err(e)) => {
                *session = None;
                log_warn!("Sampling host {} failed: {}", host, e);
                Err(e.into())
            }
            Err(_) => {
                *session = None;
                log_warn!("Sampling host {} timed out after {:?}", host, self.timeout);
                Err(MonitorError::Timeout(host.clone(), self.timeout))
            }
        }
    }

    async fn slot(&self, host: &HostId) -> SessionSlot {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(host.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    async fn open_session(&self, host: &HostId) -> Result<HostSession, ConnectionError> {
        log_debug!("Opening monitoring session for host {}", host);

        let connection = self.connector.connect(host).await?;
        let mut sampler = self.connector.sampler(host)?;

        // First reading of a fresh sampler has no baseline.
        let _ = sampler.cpu_percent().await?;
        if !self.warmup.is_zero() {
            sleep(self.warmup).await;
        }

        Ok(HostSession {
            connection,
            sampler,
        })
    }

    async fn sample_session(
        &self,
        host: &HostId,
        session: &mut Option<HostSession>,
    ) -> Result<HostSample, ConnectionError> {
        if session.is_none() {
            *session = Some(self.open_session(host).await?);
        }
        let Some(HostSession {
            connection,
            sampler,
        }) = session.as_mut()
        else {
            return Err(ConnectionError::new(host, "no monitoring session"));
        };

        let cpu_percent = sampler.cpu_percent().await?;
        let mem_percent = sampler.memory_percent().await?;
        let memory_total_bytes = sampler.memory_total_bytes().await?;

        let handles = connection.list_active_guests().await?;
        let sampled_at = Utc::now();
        let mut guests = Vec::with_capacity(handles.len());
        for handle in handles {
            let info = connection.guest_info(&handle).await?;
            guests.push(GuestStats {
                guest_id: handle.name.clone(),
                host_id: host.clone(),
                state: info.state,
                max_memory_bytes: info.max_memory_bytes,
                used_memory_bytes: info.used_memory_bytes,
                vcpus: info.vcpus,
                cpu_time_ns: info.cpu_time_ns,
                sampled_at,
            });
        }

        log_debug!(
            "Host {}: cpu {:.1}%, mem {:.1}%, {} guests",
            host,
            cpu_percent,
            mem_percent,
            guests.len()
        );

        Ok(HostSample {
            load: HostLoad {
                host_id: host.clone(),
                cpu_percent,
                mem_percent,
                memory_total_bytes,
                sampled_at,
            },
            guests,
        })
    }
}
