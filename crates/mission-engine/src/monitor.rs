use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::sync::RwLock;

/// Per-worker memory budget used to derive `safe_worker_count`
/// (spec.md §4.4, default 400 MiB).
pub const DEFAULT_PER_WORKER_BUDGET_BYTES: u64 = 400 * 1024 * 1024;

pub const MEMORY_SAMPLE_INTERVAL_S: u64 = 10;

/// How long a stale reading may be reused before falling back to the
/// conservative `safe_worker_count = 1` (spec.md §4.4).
const STALE_READING_GRACE: Duration = Duration::from_secs(60);

/// Advisory thresholds as a fraction of total memory used. Hysteretic:
/// re-expansion requires falling 5 points below the trigger (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryAdvisory {
    Normal,
    Slow,
    Throttle,
    Alert,
    Emergency,
}

const SLOW_THRESHOLD: f64 = 0.80;
const THROTTLE_THRESHOLD: f64 = 0.85;
const ALERT_THRESHOLD: f64 = 0.90;
const EMERGENCY_THRESHOLD: f64 = 0.95;
const HYSTERESIS: f64 = 0.05;

fn advisory_for(used_fraction: f64) -> MemoryAdvisory {
    if used_fraction >= EMERGENCY_THRESHOLD {
        MemoryAdvisory::Emergency
    } else if used_fraction >= ALERT_THRESHOLD {
        MemoryAdvisory::Alert
    } else if used_fraction >= THROTTLE_THRESHOLD {
        MemoryAdvisory::Throttle
    } else if used_fraction >= SLOW_THRESHOLD {
        MemoryAdvisory::Slow
    } else {
        MemoryAdvisory::Normal
    }
}

struct Reading {
    free_bytes: u64,
    used_fraction: f64,
    sampled_at: Instant,
}

/// Publishes a conservative `safe_worker_count` derived from observed
/// memory headroom. Grounded on `sysinfo`'s `System::refresh_memory`
/// idiom (no teacher crate reads host memory directly; this is the
/// ecosystem's standard crate for that, justified in DESIGN.md).
pub struct ResourceMonitor {
    per_worker_budget_bytes: u64,
    system: RwLock<System>,
    last_good: RwLock<Option<Reading>>,
    last_advisory: RwLock<MemoryAdvisory>,
}

impl ResourceMonitor {
    pub fn new(per_worker_budget_bytes: u64) -> Self {
        Self {
            per_worker_budget_bytes,
            system: RwLock::new(System::new()),
            last_good: RwLock::new(None),
            last_advisory: RwLock::new(MemoryAdvisory::Normal),
        }
    }

    /// Samples memory and returns the current advisory level, applying
    /// hysteresis against the previously reported level.
    pub async fn sample(&self) -> MemoryAdvisory {
        let mut system = self.system.write().await;
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            // Read failed or unsupported platform: fall back per spec.md §4.4.
            return self.apply_stale_fallback().await;
        }

        let free = system.available_memory();
        let used_fraction = 1.0 - (free as f64 / total as f64);
        *self.last_good.write().await = Some(Reading {
            free_bytes: free,
            used_fraction,
            sampled_at: Instant::now(),
        });

        self.apply_hysteresis(advisory_for(used_fraction)).await
    }

    async fn apply_stale_fallback(&self) -> MemoryAdvisory {
        let last_good = self.last_good.read().await;
        match last_good.as_ref() {
            Some(reading) if reading.sampled_at.elapsed() < STALE_READING_GRACE => {
                self.apply_hysteresis(advisory_for(reading.used_fraction)).await
            }
            _ => {
                *self.last_advisory.write().await = MemoryAdvisory::Emergency;
                MemoryAdvisory::Emergency
            }
        }
    }

    async fn apply_hysteresis(&self, computed: MemoryAdvisory) -> MemoryAdvisory {
        let mut last = self.last_advisory.write().await;
        let effective = if computed < *last {
            // Dropping out of a higher advisory requires clearing the
            // trigger threshold by a full hysteresis margin, not just
            // crossing back below it.
            let last_reading = self.last_good.read().await;
            let fraction = last_reading.as_ref().map(|r| r.used_fraction).unwrap_or(0.0);
            let still_elevated = match *last {
                MemoryAdvisory::Emergency => fraction >= EMERGENCY_THRESHOLD - HYSTERESIS,
                MemoryAdvisory::Alert => fraction >= ALERT_THRESHOLD - HYSTERESIS,
                MemoryAdvisory::Throttle => fraction >= THROTTLE_THRESHOLD - HYSTERESIS,
                MemoryAdvisory::Slow => fraction >= SLOW_THRESHOLD - HYSTERESIS,
                MemoryAdvisory::Normal => false,
            };
            if still_elevated {
                *last
            } else {
                computed
            }
        } else {
            computed
        };
        *last = effective;
        effective
    }

    /// `safe_worker_count = floor(0.8 × free_memory_bytes / per_worker_budget)`
    /// (spec.md §4.4), falling back to 1 once the reading is stale beyond
    /// the grace window or the system read failed outright.
    pub async fn safe_worker_count(&self) -> u32 {
        let advisory = self.sample().await;
        let last_good = self.last_good.read().await;
        let Some(reading) = last_good.as_ref() else {
            return 1;
        };
        if reading.sampled_at.elapsed() >= STALE_READING_GRACE {
            return 1;
        }

        let available_for_workers = (reading.free_bytes as f64) * 0.8;
        let count = (available_for_workers / self.per_worker_budget_bytes as f64).floor() as u32;
        match advisory {
            MemoryAdvisory::Emergency => (count / 2).max(1),
            _ => count.max(1),
        }
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_PER_WORKER_BUDGET_BYTES)
    }
}

pub type SharedResourceMonitor = Arc<ResourceMonitor>;

/// Spawns the periodic sampling loop. Returns a handle the caller can
/// abort on shutdown, mirroring `mission_runner.rs`'s JoinHandle ownership.
pub fn spawn_sampling_loop(monitor: SharedResourceMonitor) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(MEMORY_SAMPLE_INTERVAL_S));
        loop {
            interval.tick().await;
            let advisory = monitor.sample().await;
            if advisory >= MemoryAdvisory::Alert {
                tracing::warn!(?advisory, "resource monitor advisory");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_thresholds_are_ordered() {
        assert_eq!(advisory_for(0.50), MemoryAdvisory::Normal);
        assert_eq!(advisory_for(0.81), MemoryAdvisory::Slow);
        assert_eq!(advisory_for(0.86), MemoryAdvisory::Throttle);
        assert_eq!(advisory_for(0.91), MemoryAdvisory::Alert);
        assert_eq!(advisory_for(0.96), MemoryAdvisory::Emergency);
    }

    #[tokio::test]
    async fn safe_worker_count_is_nonzero_when_memory_available() {
        let monitor = ResourceMonitor::new(DEFAULT_PER_WORKER_BUDGET_BYTES);
        let count = monitor.safe_worker_count().await;
        // Can't assert an exact value (host-dependent), but the formula
        // must never divide by zero or panic.
        assert!(count < u32::MAX);
    }

    #[tokio::test]
    async fn hysteresis_requires_clearing_margin_before_dropping_level() {
        let monitor = ResourceMonitor::new(DEFAULT_PER_WORKER_BUDGET_BYTES);
        *monitor.last_advisory.write().await = MemoryAdvisory::Alert;
        *monitor.last_good.write().await = Some(Reading {
            free_bytes: 1024,
            used_fraction: 0.87,
            sampled_at: Instant::now(),
        });
        let effective = monitor.apply_hysteresis(MemoryAdvisory::Throttle).await;
        assert_eq!(effective, MemoryAdvisory::Alert);
    }
}
