//! Caller configuration: `.env` / environment, overridden by CLI flags.

use crate::error::{CtlError, Result};
use crate::monitor::AvailabilityPolicy;
use std::time::Duration;

pub const DEFAULT_AGENT_URL: &str = "http://192.168.1.1:9991";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtlConfig {
    pub agent_url: String,
    pub policy: AvailabilityPolicy,
}

impl CtlConfig {
    /// Read `OVERLAY_CTL_*` variables, loading `.env` first when present.
    pub fn from_env() -> Result<Self> {
        // A missing .env is normal.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = AvailabilityPolicy::default();
        let secs = |key: &str, default: Duration| -> Result<Duration> {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|e| CtlError::Config(format!("{}={:?}: {}", key, raw, e))),
                None => Ok(default),
            }
        };

        let policy = AvailabilityPolicy {
            grace: secs("OVERLAY_CTL_GRACE_SECS", defaults.grace)?,
            interval: secs("OVERLAY_CTL_INTERVAL_SECS", defaults.interval)?,
            timeout: secs("OVERLAY_CTL_TIMEOUT_SECS", defaults.timeout)?,
        };
        if policy.interval.is_zero() {
            return Err(CtlError::Config("OVERLAY_CTL_INTERVAL_SECS must be positive".into()));
        }

        Ok(Self {
            agent_url: lookup("OVERLAY_CTL_AGENT_URL")
                .unwrap_or_else(|| DEFAULT_AGENT_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            policy,
        })
    }
}
