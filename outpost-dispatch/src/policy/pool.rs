//! Pool resolution for a message
//!
//! Each server has an optional default pool and an ordered list of rules
//! that route particular recipients or senders to other pools. The first
//! matching rule wins; otherwise the default pool is used.

use std::fmt::Debug;

use ahash::AHashMap;
use outpost_common::Domain;
use serde::Deserialize;

use crate::{
    ids::{IpPoolId, ServerId},
    queue::NewQueuedMessage,
};

/// Decides which pool a message's address is drawn from.
pub trait PoolResolver: Send + Sync + Debug {
    fn resolve_pool_for(&self, message: &NewQueuedMessage) -> Option<IpPoolId>;
}

/// Routes matching messages to a pool.
///
/// Entries in `to` and `from` are either full addresses or bare domains. A
/// rule matches when every non-empty list has an entry matching the
/// message. A rule with both lists empty never matches.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PoolRule {
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub from: Vec<String>,
    pub pool: IpPoolId,
}

fn entry_matches(entry: &str, address: &str) -> bool {
    let entry = entry.trim();
    if entry.contains('@') {
        entry.eq_ignore_ascii_case(address.trim())
    } else {
        Domain::from_address(address).is_some_and(|domain| domain == Domain::new(entry))
    }
}

impl PoolRule {
    #[must_use]
    pub fn matches(&self, message: &NewQueuedMessage) -> bool {
        if self.to.is_empty() && self.from.is_empty() {
            return false;
        }

        let list_matches = |list: &[String], address: &str| {
            list.is_empty() || list.iter().any(|entry| entry_matches(entry, address))
        };

        list_matches(&self.to, &message.rcpt_to) && list_matches(&self.from, &message.mail_from)
    }
}

/// One server's pool configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerPools {
    #[serde(default)]
    pub default_pool: Option<IpPoolId>,
    #[serde(default)]
    pub rules: Vec<PoolRule>,
}

impl ServerPools {
    #[must_use]
    pub fn resolve(&self, message: &NewQueuedMessage) -> Option<IpPoolId> {
        self.rules
            .iter()
            .find(|rule| rule.matches(message))
            .map(|rule| rule.pool)
            .or(self.default_pool)
    }

    /// Every pool this server may draw from: the default first, then rule
    /// pools, without duplicates.
    #[must_use]
    pub fn pools(&self) -> Vec<IpPoolId> {
        let mut pools: Vec<IpPoolId> = self.default_pool.into_iter().collect();
        for rule in &self.rules {
            if !pools.contains(&rule.pool) {
                pools.push(rule.pool);
            }
        }
        pools
    }
}

/// [`PoolResolver`] over per-server defaults and rules.
#[derive(Debug, Clone, Default)]
pub struct ServerPoolRules {
    servers: AHashMap<ServerId, ServerPools>,
}

impl ServerPoolRules {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, server: ServerId, pools: ServerPools) {
        self.servers.insert(server, pools);
    }

    #[must_use]
    pub fn with(mut self, server: ServerId, pools: ServerPools) -> Self {
        self.set(server, pools);
        self
    }

    #[must_use]
    pub fn get(&self, server: ServerId) -> Option<&ServerPools> {
        self.servers.get(&server)
    }
}

impl PoolResolver for ServerPoolRules {
    fn resolve_pool_for(&self, message: &NewQueuedMessage) -> Option<IpPoolId> {
        self.servers
            .get(&message.server)
            .and_then(|pools| pools.resolve(message))
    }
}
