//! Post-restore availability monitor.
//!
//! After a restore requests a reboot, the agent goes away. The caller waits
//! out a grace period, then probes at a fixed interval until the device
//! answers or the overall timeout runs out.

use crate::error::{CtlError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilityPolicy {
    /// Wait before the first probe
    pub grace: Duration,
    /// Time between probes, also the per-probe deadline
    pub interval: Duration,
    /// Give up this long after the reboot was requested
    pub timeout: Duration,
}

impl Default for AvailabilityPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(30),
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(300),
        }
    }
}

/// A lightweight liveness check.
pub trait Probe {
    fn probe(&self) -> impl Future<Output = bool> + Send;
}

/// Wait for the device to come back. Returns how long that took.
pub async fn wait_for_device<P: Probe>(probe: &P, policy: &AvailabilityPolicy) -> Result<Duration> {
    let started = Instant::now();
    let deadline = started + policy.timeout;
    let mut attempts = 0u32;

    info!("Waiting {}s before probing the device", policy.grace.as_secs());
    sleep(policy.grace.min(policy.timeout)).await;

    loop {
        attempts += 1;
        let attempt_started = Instant::now();
        let reachable = timeout(policy.interval, probe.probe()).await.unwrap_or(false);
        if reachable {
            let waited = started.elapsed();
            info!("Device reachable after {}s ({} probes)", waited.as_secs(), attempts);
            return Ok(waited);
        }
        debug!("Probe {} failed", attempts);

        let next = attempt_started + policy.interval;
        if next >= deadline {
            return Err(CtlError::DeviceUnreachable {
                waited: started.elapsed(),
                attempts,
            });
        }
        tokio::time::sleep_until(next).await;
    }
}
