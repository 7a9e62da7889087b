use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::config::{DetectorConfig, Thresholds};
use crate::types::{HostId, HostLoad};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Overloaded,
    Normal,
    InsufficientData,
}

#[derive(Debug, Default)]
struct HostHistory {
    samples: VecDeque<HostLoad>,
    stable: Option<Verdict>,
    last_triggered: Option<DateTime<Utc>>,
}

/// Threshold check with hysteresis over a trailing window of samples.
///
/// The verdict only flips when the whole window agrees: every sample above a
/// threshold to become `Overloaded`, every sample below both thresholds (and
/// the post-migration cooldown over) to go back to `Normal`. Mixed windows keep
/// the previous verdict.
#[derive(Debug)]
pub struct OverloadDetector {
    thresholds: Thresholds,
    window: usize,
    cooldown: chrono::Duration,
    staleness: chrono::Duration,
    history: HashMap<HostId, HostHistory>,
}

impl OverloadDetector {
    pub fn new(thresholds: Thresholds, config: &DetectorConfig, staleness: chrono::Duration) -> Self {
        Self {
            thresholds,
            window: config.window.max(1),
            cooldown: config.cooldown(),
            staleness,
            history: HashMap::new(),
        }
    }

    /// Append a sample. Re-observing the sample already at the tail is a no-op.
    pub fn observe(&mut self, load: &HostLoad) {
        let history = self.history.entry(load.host_id.clone()).or_default();
        if history
            .samples
            .back()
            .is_some_and(|last| last.sampled_at >= load.sampled_at)
        {
            return;
        }

        history.samples.push_back(load.clone());
        while history.samples.len() > self.window {
            history.samples.pop_front();
        }
    }

    pub fn evaluate(&mut self, host: &HostId, now: DateTime<Utc>) -> Verdict {
        let thresholds = self.thresholds;
        let window = self.window;
        let staleness = self.staleness;
        let cooldown = self.cooldown;

        let Some(history) = self.history.get_mut(host) else {
            return Verdict::InsufficientData;
        };

        let fresh = history
            .samples
            .iter()
            .filter(|load| load.is_fresh(now, staleness))
            .count();
        if fresh < window {
            return Verdict::InsufficientData;
        }

        let over = |load: &HostLoad| {
            load.cpu_percent > thresholds.cpu_percent || load.mem_percent > thresholds.mem_percent
        };

        let all_over = history.samples.iter().all(over);
        let all_under = history.samples.iter().all(|load| !over(load));
        let cooled = history
            .last_triggered
            .is_none_or(|at| now.signed_duration_since(at) >= cooldown);

        let verdict = if all_over {
            Verdict::Overloaded
        } else if all_under && cooled {
            Verdict::Normal
        } else {
            history.stable.unwrap_or(Verdict::Normal)
        };

        history.stable = Some(verdict);
        verdict
    }

    /// Remember that `host`'s overload triggered a migration at `at`.
    pub fn record_trigger(&mut self, host: &HostId, at: DateTime<Utc>) {
        self.history.entry(host.clone()).or_default().last_triggered = Some(at);
    }

    /// Whether `host` triggered a migration less than the cooldown ago.
    pub fn in_cooldown(&self, host: &HostId, now: DateTime<Utc>) -> bool {
        self.history
            .get(host)
            .and_then(|history| history.last_triggered)
            .is_some_and(|at| now.signed_duration_since(at) < self.cooldown)
    }
}
