//! Least-used IP pool selection
//!
//! Pools are ranked by messages per member address. Rather than always
//! returning the single idlest pool (which every caller would then pile
//! onto), the balancer rotates through the top `N` once a minute:
//!
//! ```text
//! index = floor(unix_time / 60) mod N
//! ```
//!
//! Requests inside the same minute land on the same pool, and successive
//! minutes walk the least-used set.

use std::{cmp::Ordering, fmt::Debug, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Days, TimeDelta, Utc};
use outpost_common::{Clock, dispatch};
use serde::{Deserialize, Serialize};

use crate::{
    error::BalanceError,
    ids::{IpAddressId, IpPoolId},
    ip::{IpPool, PoolCandidate},
};

/// Pools considered when no positive `top_n` is given.
pub const DEFAULT_TOP_N: usize = 5;

/// Seconds per rotation slot.
const ROTATION_SECS: i64 = 60;

#[derive(Debug, Clone, Deserialize)]
pub struct BalancerConfig {
    /// How many of the least-used pools to rotate through (default: 5)
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

const fn default_top_n() -> usize {
    DEFAULT_TOP_N
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            top_n: default_top_n(),
        }
    }
}

/// How far back usage is counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageWindow {
    #[default]
    AllTime,
    Today,
    Yesterday,
    /// The last 7 days
    Week,
    /// The last 30 days
    Month,
    /// The last 365 days
    Year,
}

/// The widest bounded window, in days. Usage tallies older than this may be
/// discarded.
pub const LONGEST_WINDOW_DAYS: u64 = 365;

/// A half-open time range `[since, until)`; `None` is unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageRange {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl UsageRange {
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.since.is_none_or(|since| at >= since) && self.until.is_none_or(|until| at < until)
    }
}

impl UsageWindow {
    /// The concrete range this window covers at `now`. Day boundaries are
    /// UTC midnight.
    #[must_use]
    pub fn range(self, now: DateTime<Utc>) -> UsageRange {
        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|start| start.and_utc());
        let ago = |days: u64| now.checked_sub_days(Days::new(days));

        match self {
            Self::AllTime => UsageRange::default(),
            Self::Today => UsageRange {
                since: midnight,
                until: None,
            },
            Self::Yesterday => UsageRange {
                since: midnight.and_then(|start| start.checked_sub_signed(TimeDelta::days(1))),
                until: midnight,
            },
            Self::Week => UsageRange {
                since: ago(7),
                until: None,
            },
            Self::Month => UsageRange {
                since: ago(30),
                until: None,
            },
            Self::Year => UsageRange {
                since: ago(LONGEST_WINDOW_DAYS),
                until: None,
            },
        }
    }
}

impl std::str::FromStr for UsageWindow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" | "all_time" | "all-time" => Ok(Self::AllTime),
            "today" => Ok(Self::Today),
            "yesterday" => Ok(Self::Yesterday),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "year" => Ok(Self::Year),
            other => Err(format!("unknown usage window: {other}")),
        }
    }
}

/// Counts of messages sent through addresses.
#[async_trait]
pub trait UsageSource: Send + Sync + Debug {
    /// Messages queued or delivered through any of `ips` within `range`.
    async fn messages_through(
        &self,
        ips: &[IpAddressId],
        range: UsageRange,
    ) -> Result<u64, BalanceError>;
}

/// A pool's load, as ranked by the balancer.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolUsage {
    pub pool: IpPool,
    pub ip_count: usize,
    pub messages: u64,
    pub ratio: f64,
}

impl PoolUsage {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(pool: IpPool, ip_count: usize, messages: u64) -> Self {
        let ratio = if messages == 0 || ip_count == 0 {
            0.0
        } else {
            messages as f64 / ip_count as f64
        };

        Self {
            pool,
            ip_count,
            messages,
            ratio,
        }
    }
}

/// Sorts pools by usage ratio, least used first. Equal ratios fall back to
/// pool id so the order is stable between calls.
pub fn rank(usages: &mut [PoolUsage]) {
    usages.sort_by(|a, b| match a.ratio.total_cmp(&b.ratio) {
        Ordering::Equal => a.pool.id.cmp(&b.pool.id),
        other => other,
    });
}

/// `floor(unix_secs / 60) mod n`, or `0` when `n` is zero.
#[must_use]
pub fn rotation_index(unix_secs: i64, n: usize) -> usize {
    let Ok(n_slots) = i64::try_from(n) else {
        return 0;
    };
    if n_slots == 0 {
        return 0;
    }

    let slot = unix_secs.div_euclid(ROTATION_SECS).rem_euclid(n_slots);
    usize::try_from(slot).unwrap_or(0)
}

/// Effective `top_n`: zero means "use the default".
#[must_use]
pub const fn effective_top_n(requested: usize, fallback: usize) -> usize {
    match (requested, fallback) {
        (0, 0) => DEFAULT_TOP_N,
        (0, fallback) => fallback,
        (requested, _) => requested,
    }
}

/// How a new server should get its pool.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolAssignmentRequest {
    /// An explicit choice always wins
    #[serde(default)]
    pub pool: Option<IpPoolId>,
    /// Pick the least-used pool when no explicit choice is given
    #[serde(default = "default_auto_assign")]
    pub auto_assign: bool,
    /// Overrides the configured `top_n` when positive
    #[serde(default)]
    pub top_n: usize,
}

const fn default_auto_assign() -> bool {
    true
}

impl Default for PoolAssignmentRequest {
    fn default() -> Self {
        Self {
            pool: None,
            auto_assign: default_auto_assign(),
            top_n: 0,
        }
    }
}

/// Ranks pools by recent usage and rotates among the least used.
#[derive(Debug, Clone)]
pub struct PoolBalancer {
    usage: Arc<dyn UsageSource>,
    clock: Arc<dyn Clock>,
    config: BalancerConfig,
}

impl PoolBalancer {
    #[must_use]
    pub fn new(usage: Arc<dyn UsageSource>, clock: Arc<dyn Clock>, config: BalancerConfig) -> Self {
        Self {
            usage,
            clock,
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &BalancerConfig {
        &self.config
    }

    /// Measures and ranks every candidate that has at least one address.
    ///
    /// # Errors
    ///
    /// Returns [`BalanceError::Usage`] if the usage source fails.
    pub async fn usage(
        &self,
        candidates: &[PoolCandidate],
        window: UsageWindow,
    ) -> Result<Vec<PoolUsage>, BalanceError> {
        let range = window.range(self.clock.now());
        let mut usages = Vec::with_capacity(candidates.len());

        for candidate in candidates.iter().filter(|c| !c.ip_address_ids.is_empty()) {
            let messages = self
                .usage
                .messages_through(&candidate.ip_address_ids, range)
                .await?;
            usages.push(PoolUsage::new(
                candidate.pool.clone(),
                candidate.ip_address_ids.len(),
                messages,
            ));
        }

        rank(&mut usages);
        Ok(usages)
    }

    /// Picks among the `top_n` least-used non-empty pools by the current
    /// minute. `top_n` of zero uses the configured value.
    ///
    /// # Errors
    ///
    /// Returns [`BalanceError::NoValidPools`] if every candidate is empty.
    pub async fn least_used_pool(
        &self,
        candidates: &[PoolCandidate],
        top_n: usize,
        window: UsageWindow,
    ) -> Result<IpPool, BalanceError> {
        let usages = self.usage(candidates, window).await?;
        if usages.is_empty() {
            return Err(BalanceError::NoValidPools);
        }

        let top_n = effective_top_n(top_n, self.config.top_n).min(usages.len());
        let now = self.clock.now().timestamp();
        let index = rotation_index(now, top_n);
        let chosen = usages[index].pool.clone();

        dispatch!(
            level = DEBUG,
            pool = %chosen.id,
            index,
            top_n,
            "Selected least used pool {} ({} candidates)",
            chosen.name,
            usages.len()
        );

        Ok(chosen)
    }

    /// Chooses a pool for a server being provisioned.
    ///
    /// Returns `None` when auto-assignment is off or no candidate has any
    /// addresses.
    ///
    /// # Errors
    ///
    /// Returns [`BalanceError::Usage`] if the usage source fails.
    pub async fn assign_pool(
        &self,
        request: &PoolAssignmentRequest,
        candidates: &[PoolCandidate],
    ) -> Result<Option<IpPoolId>, BalanceError> {
        if let Some(pool) = request.pool {
            return Ok(Some(pool));
        }

        if !request.auto_assign {
            return Ok(None);
        }

        match self
            .least_used_pool(candidates, request.top_n, UsageWindow::AllTime)
            .await
        {
            Ok(pool) => Ok(Some(pool.id)),
            Err(BalanceError::NoValidPools) => Ok(None),
            Err(err) => Err(err),
        }
    }
}
