//! Dispatch configuration
//!
//! Every field has a default, so an empty `()` is a valid configuration.

use chrono::TimeDelta;
use serde::Deserialize;

use crate::{balancer::BalancerConfig, mx::DnsConfig, policy::RetryPolicy, worker::WorkerConfig};

const fn default_batch_limit() -> usize {
    10
}

const fn default_stale_lock_days() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Allocate egress addresses from IP pools and overrides.
    ///
    /// When disabled every message is left unassigned and delivered from
    /// the system default address.
    ///
    /// Default: `false`
    #[serde(default)]
    pub ip_pools_enabled: bool,

    /// Maximum number of siblings claimed alongside a primary message
    ///
    /// Default: 10
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,

    /// Minimum age of a message before it can be claimed, giving batch-mates
    /// time to arrive (in seconds)
    ///
    /// Default: 0 (disabled)
    #[serde(default)]
    pub ready_grace_secs: u64,

    /// Locks older than this are assumed orphaned by a dead worker
    /// (in days)
    ///
    /// Default: 1
    #[serde(default = "default_stale_lock_days")]
    pub stale_lock_days: u32,

    #[serde(default)]
    pub dns: DnsConfig,

    #[serde(default)]
    pub balancer: BalancerConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub worker: WorkerConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            ip_pools_enabled: false,
            batch_limit: default_batch_limit(),
            ready_grace_secs: 0,
            stale_lock_days: default_stale_lock_days(),
            dns: DnsConfig::default(),
            balancer: BalancerConfig::default(),
            retry: RetryPolicy::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl DispatchConfig {
    /// Saturates at [`TimeDelta::MAX`].
    #[must_use]
    pub fn ready_grace(&self) -> TimeDelta {
        i64::try_from(self.ready_grace_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX)
    }

    #[must_use]
    pub fn stale_lock_threshold(&self) -> TimeDelta {
        TimeDelta::days(i64::from(self.stale_lock_days))
    }
}
