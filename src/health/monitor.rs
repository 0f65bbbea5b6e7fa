//! Scheduler and health-view state for `HealthMonitor` (§4.1).
//!
//! Grounded on the teacher's `monitoring/monitoring_system.rs`
//! (`SystemHealth`, `ComponentHealth`, `HealthStatus`), with the HDR
//! histogram / SIMD / NUMA / benchmarking submodules it carried dropped —
//! this spec has no use for them — and regeneralized into a scheduler-driven
//! probe registry instead of a passive status aggregator.

use crate::clock::Clock;
use crate::types::HealthStatus;
use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// A caller-supplied health probe. May suspend; the scheduler enforces
/// `timeout` regardless of how long the probe itself would run.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self) -> std::result::Result<(), String>;
}

#[async_trait]
pub trait RecoveryCallback: Send + Sync {
    async fn on_recovery(&self, check_id: &str);
}

struct CheckEntry {
    component_type: String,
    component_name: String,
    probe: Arc<dyn Probe>,
    interval: Duration,
    timeout: Duration,
    failure_threshold: u32,
    recovery_threshold: u32,
    critical: bool,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    last_status: parking_lot::RwLock<HealthStatus>,
    last_observed_at: AtomicU32,
    enabled: AtomicBool,
    shutdown: Notify,
    recovery_callbacks: parking_lot::RwLock<Vec<Arc<dyn RecoveryCallback>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverallHealth {
    pub status: HealthStatus,
    pub total: usize,
    pub healthy: usize,
    pub components: Vec<(String, HealthStatus)>,
}

/// Owns the periodic probing schedule and the derived health view.
#[derive(Clone)]
pub struct HealthMonitor {
    checks: Arc<DashMap<String, Arc<CheckEntry>>>,
    clock: Arc<dyn Clock>,
    running: Arc<AtomicBool>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("checks", &self.checks.len())
            .finish()
    }
}

impl HealthMonitor {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            checks: Arc::new(DashMap::new()),
            clock,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Idempotent by `check_id`; fails if the id is already registered with a
    /// different probe (identified by `Arc` pointer identity, since probes
    /// are arbitrary caller-supplied trait objects with no natural equality).
    /// Registration does not run the probe; the first run happens at the
    /// next scheduler tick.
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &self,
        check_id: impl Into<String>,
        component_type: impl Into<String>,
        component_name: impl Into<String>,
        probe: Arc<dyn Probe>,
        interval: Duration,
        timeout: Duration,
        failure_threshold: u32,
        recovery_threshold: u32,
        critical: bool,
    ) -> crate::error::Result<()> {
        let check_id = check_id.into();
        if let Some(existing) = self.checks.get(&check_id) {
            if !Arc::ptr_eq(&existing.probe, &probe) {
                return Err(crate::error::Error::AlreadyRegistered(check_id));
            }
            return Ok(());
        }
        let entry = Arc::new(CheckEntry {
            component_type: component_type.into(),
            component_name: component_name.into(),
            probe,
            interval,
            timeout,
            failure_threshold,
            recovery_threshold,
            critical,
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            last_status: parking_lot::RwLock::new(HealthStatus::Unknown),
            last_observed_at: AtomicU32::new(0),
            enabled: AtomicBool::new(self.running.load(Ordering::SeqCst)),
            shutdown: Notify::new(),
            recovery_callbacks: parking_lot::RwLock::new(Vec::new()),
        });
        self.checks.insert(check_id.clone(), entry.clone());
        if self.running.load(Ordering::SeqCst) {
            self.spawn_scheduler(check_id, entry);
        }
        Ok(())
    }

    /// Stops scheduling; the in-flight probe (if any) is allowed to finish
    /// within its timeout — it simply finds the check gone on its next tick.
    pub fn unregister(&self, check_id: &str) {
        if let Some((_, entry)) = self.checks.remove(check_id) {
            entry.enabled.store(false, Ordering::SeqCst);
            entry.shutdown.notify_waiters();
        }
    }

    pub fn register_recovery(&self, check_id: &str, callback: Arc<dyn RecoveryCallback>) {
        if let Some(entry) = self.checks.get(check_id) {
            entry.recovery_callbacks.write().push(callback);
        }
    }

    /// Returns UNKNOWN until the first probe completes, and for unregistered
    /// ids — the monitor never throws to query callers.
    pub fn component_health(&self, check_id: &str) -> HealthStatus {
        self.checks
            .get(check_id)
            .map(|e| *e.last_status.read())
            .unwrap_or(HealthStatus::Unknown)
    }

    pub fn overall_health(&self) -> OverallHealth {
        let mut components = Vec::new();
        let mut healthy = 0usize;
        let mut any_critical_unhealthy = false;
        let mut any_degraded = false;
        for entry in self.checks.iter() {
            let status = *entry.last_status.read();
            if matches!(status, HealthStatus::Healthy) {
                healthy += 1;
            }
            if matches!(status, HealthStatus::Unhealthy) {
                if entry.critical {
                    any_critical_unhealthy = true;
                } else {
                    any_degraded = true;
                }
            }
            if matches!(status, HealthStatus::Degraded) {
                any_degraded = true;
            }
            components.push((entry.component_name.clone(), status));
        }
        let status = if any_critical_unhealthy {
            HealthStatus::Unhealthy
        } else if any_degraded {
            HealthStatus::Degraded
        } else if components.is_empty() {
            HealthStatus::Unknown
        } else {
            HealthStatus::Healthy
        };
        OverallHealth {
            status,
            total: components.len(),
            healthy,
            components,
        }
    }

    /// Starts the scheduler; disabling (`disable`) cancels pending probes
    /// cooperatively.
    pub fn enable(&self) {
        self.running.store(true, Ordering::SeqCst);
        for entry in self.checks.iter() {
            if !entry.enabled.swap(true, Ordering::SeqCst) {
                self.spawn_scheduler(entry.key().clone(), entry.value().clone());
            }
        }
    }

    pub fn disable(&self) {
        self.running.store(false, Ordering::SeqCst);
        for entry in self.checks.iter() {
            entry.enabled.store(false, Ordering::SeqCst);
            entry.shutdown.notify_waiters();
        }
    }

    fn spawn_scheduler(&self, check_id: String, entry: Arc<CheckEntry>) {
        let clock = self.clock.clone();
        tokio::spawn(async move {
            loop {
                let jitter_frac = rand::thread_rng().gen_range(-0.1..=0.1);
                let base = entry.interval.as_secs_f64();
                let wait = Duration::from_secs_f64((base * (1.0 + jitter_frac)).max(0.0));
                tokio::select! {
                    _ = clock.sleep(wait) => {}
                    _ = entry.shutdown.notified() => break,
                }
                if !entry.enabled.load(Ordering::SeqCst) {
                    break;
                }

                let outcome = tokio::time::timeout(entry.timeout, entry.probe.check()).await;
                let success = match outcome {
                    Ok(Ok(())) => true,
                    Ok(Err(reason)) => {
                        debug!(check_id = %check_id, reason = %reason, "probe failed");
                        false
                    }
                    Err(_) => {
                        debug!(check_id = %check_id, "probe timed out");
                        false
                    }
                };
                entry.last_observed_at.store(
                    clock.monotonic_now().min(u32::MAX as u64) as u32,
                    Ordering::SeqCst,
                );

                if success {
                    entry.consecutive_failures.store(0, Ordering::SeqCst);
                    let successes = entry.consecutive_successes.fetch_add(1, Ordering::SeqCst) + 1;
                    let was_unhealthy = matches!(*entry.last_status.read(), HealthStatus::Unhealthy);
                    if successes >= entry.recovery_threshold {
                        *entry.last_status.write() = HealthStatus::Healthy;
                        if was_unhealthy {
                            let callbacks = entry.recovery_callbacks.read().clone();
                            for cb in callbacks {
                                cb.on_recovery(&check_id).await;
                            }
                        }
                    }
                } else {
                    entry.consecutive_successes.store(0, Ordering::SeqCst);
                    let failures = entry.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    if failures >= entry.failure_threshold {
                        *entry.last_status.write() = HealthStatus::Unhealthy;
                    } else if matches!(*entry.last_status.read(), HealthStatus::Unknown) {
                        *entry.last_status.write() = HealthStatus::Degraded;
                    }
                }
            }
        });
    }
}
