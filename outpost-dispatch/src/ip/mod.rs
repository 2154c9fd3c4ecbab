//! IP resource model
//!
//! Egress IP addresses, the pools that group them, and the organizations
//! and servers that may use those pools. Membership is many-to-many: one
//! address can serve several pools, and an address is only deleted once
//! every pool has let go of it.

pub mod mapping;

use std::{
    collections::BTreeSet,
    net::{Ipv4Addr, Ipv6Addr},
};

use ahash::AHashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    error::IpError,
    ids::{IpAddressId, IpPoolId, OrganizationId, ServerId},
};

pub use mapping::EmailIpMappings;

/// Priority given to addresses registered without one.
pub const DEFAULT_PRIORITY: u8 = 100;

/// Highest accepted priority weight.
pub const MAX_PRIORITY: u8 = 100;

/// An egress IP address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddress {
    pub id: IpAddressId,
    pub ipv4: Ipv4Addr,
    pub ipv6: Option<Ipv6Addr>,
    /// Used for PTR records and the SMTP banner
    pub hostname: String,
    /// Selection weight in `0..=100`; higher is chosen more often
    pub priority: u8,
}

/// Registration request for an [`IpAddress`], validated on insert.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewIpAddress {
    pub ipv4: String,
    #[serde(default)]
    pub ipv6: Option<String>,
    pub hostname: String,
    #[serde(default)]
    pub priority: Option<u8>,
}

/// A named set of egress addresses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpPool {
    pub id: IpPoolId,
    pub name: String,
    pub default: bool,
}

/// A pool together with its member addresses, as handed to the balancer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolCandidate {
    pub pool: IpPool,
    pub ip_address_ids: Vec<IpAddressId>,
}

/// In-memory view of addresses, pools, memberships and ownership.
#[derive(Debug, Default)]
pub struct IpRegistry {
    addresses: AHashMap<IpAddressId, IpAddress>,
    pools: AHashMap<IpPoolId, IpPool>,
    /// (pool, address) pairs, ordered so membership scans are deterministic
    members: BTreeSet<(IpPoolId, IpAddressId)>,
    /// (address, pool) pairs for the reverse direction
    memberships: BTreeSet<(IpAddressId, IpPoolId)>,
    organization_pools: AHashMap<OrganizationId, Vec<IpPoolId>>,
    server_organizations: AHashMap<ServerId, OrganizationId>,
    next_address_id: u64,
    next_pool_id: u64,
}

impl IpRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new address after validating it.
    ///
    /// # Errors
    ///
    /// Returns an [`IpError`] if either literal fails to parse or is already
    /// registered, the hostname is blank, or the priority exceeds 100.
    pub fn insert_address(&mut self, new: NewIpAddress) -> Result<IpAddress, IpError> {
        let ipv4: Ipv4Addr = new
            .ipv4
            .trim()
            .parse()
            .map_err(|_| IpError::InvalidIpv4(new.ipv4.clone()))?;

        let ipv6 = match new.ipv6.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(literal) => Some(
                literal
                    .parse::<Ipv6Addr>()
                    .map_err(|_| IpError::InvalidIpv6(literal.to_string()))?,
            ),
        };

        let hostname = new.hostname.trim();
        if hostname.is_empty() {
            return Err(IpError::MissingHostname);
        }

        let priority = new.priority.unwrap_or(DEFAULT_PRIORITY);
        if priority > MAX_PRIORITY {
            return Err(IpError::PriorityOutOfRange(priority));
        }

        for existing in self.addresses.values() {
            if existing.ipv4 == ipv4 {
                return Err(IpError::DuplicateAddress(ipv4.to_string()));
            }
            if let Some(v6) = ipv6
                && existing.ipv6 == Some(v6)
            {
                return Err(IpError::DuplicateAddress(v6.to_string()));
            }
        }

        self.next_address_id += 1;
        let address = IpAddress {
            id: IpAddressId(self.next_address_id),
            ipv4,
            ipv6,
            hostname: hostname.to_string(),
            priority,
        };
        self.addresses.insert(address.id, address.clone());

        Ok(address)
    }

    /// Creates a new, empty pool.
    ///
    /// # Errors
    ///
    /// Returns [`IpError::MissingPoolName`] for a blank name.
    pub fn insert_pool(&mut self, name: &str, default: bool) -> Result<IpPool, IpError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(IpError::MissingPoolName);
        }

        self.next_pool_id += 1;
        let pool = IpPool {
            id: IpPoolId(self.next_pool_id),
            name: name.to_string(),
            default,
        };
        self.pools.insert(pool.id, pool.clone());

        Ok(pool)
    }

    /// Adds an address to a pool.
    ///
    /// Returns `false` if it was already a member.
    ///
    /// # Errors
    ///
    /// Returns an error if either side is unknown.
    pub fn add_to_pool(&mut self, ip: IpAddressId, pool: IpPoolId) -> Result<bool, IpError> {
        self.require_address(ip)?;
        self.require_pool(pool)?;

        let added = self.members.insert((pool, ip));
        self.memberships.insert((ip, pool));
        Ok(added)
    }

    /// Removes an address from a pool, returning whether it was a member.
    pub fn remove_from_pool(&mut self, ip: IpAddressId, pool: IpPoolId) -> bool {
        self.memberships.remove(&(ip, pool));
        self.members.remove(&(pool, ip))
    }

    /// Deletes an address that no longer belongs to any pool.
    ///
    /// Queued messages referencing the address must be detached first; see
    /// `Dispatcher::retire_ip_address`.
    ///
    /// # Errors
    ///
    /// Returns [`IpError::StillPooled`] while any pool still lists it.
    pub fn remove_address(&mut self, ip: IpAddressId) -> Result<IpAddress, IpError> {
        self.require_address(ip)?;

        let pools = self.pools_for_address(ip).len();
        if pools > 0 {
            return Err(IpError::StillPooled(ip, pools));
        }

        self.addresses
            .remove(&ip)
            .ok_or(IpError::UnknownAddress(ip))
    }

    /// Grants an organization use of a pool.
    ///
    /// # Errors
    ///
    /// Returns [`IpError::UnknownPool`] for an unknown pool.
    pub fn attach_pool(&mut self, organization: OrganizationId, pool: IpPoolId) -> Result<(), IpError> {
        self.require_pool(pool)?;

        let pools = self.organization_pools.entry(organization).or_default();
        if !pools.contains(&pool) {
            pools.push(pool);
        }
        Ok(())
    }

    /// Records which organization a server belongs to.
    pub fn register_server(&mut self, server: ServerId, organization: OrganizationId) {
        self.server_organizations.insert(server, organization);
    }

    #[must_use]
    pub fn server_organization(&self, server: ServerId) -> Option<OrganizationId> {
        self.server_organizations.get(&server).copied()
    }

    /// Pools available to an organization, in the order they were attached.
    #[must_use]
    pub fn organization_pools(&self, organization: OrganizationId) -> Vec<IpPoolId> {
        self.organization_pools
            .get(&organization)
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn address(&self, ip: IpAddressId) -> Option<&IpAddress> {
        self.addresses.get(&ip)
    }

    #[must_use]
    pub fn find_by_ipv4(&self, ipv4: &str) -> Option<&IpAddress> {
        let ipv4: Ipv4Addr = ipv4.trim().parse().ok()?;
        self.addresses.values().find(|address| address.ipv4 == ipv4)
    }

    #[must_use]
    pub fn pool(&self, pool: IpPoolId) -> Option<&IpPool> {
        self.pools.get(&pool)
    }

    #[must_use]
    pub fn pool_by_name(&self, name: &str) -> Option<&IpPool> {
        self.pools.values().find(|pool| pool.name == name)
    }

    /// Member addresses of a pool, ordered by id.
    #[must_use]
    pub fn members(&self, pool: IpPoolId) -> Vec<&IpAddress> {
        self.members
            .range((pool, IpAddressId(0))..=(pool, IpAddressId(u64::MAX)))
            .filter_map(|(_, ip)| self.addresses.get(ip))
            .collect()
    }

    /// Pools an address belongs to, ordered by id.
    #[must_use]
    pub fn pools_for_address(&self, ip: IpAddressId) -> Vec<&IpPool> {
        self.memberships
            .range((ip, IpPoolId(0))..=(ip, IpPoolId(u64::MAX)))
            .filter_map(|(_, pool)| self.pools.get(pool))
            .collect()
    }

    #[must_use]
    pub fn pool_names_for(&self, ip: IpAddressId) -> Vec<&str> {
        self.pools_for_address(ip)
            .into_iter()
            .map(|pool| pool.name.as_str())
            .collect()
    }

    /// `"192.0.2.10 (primary, bulk)"`
    #[must_use]
    pub fn describe_address(&self, ip: IpAddressId) -> Option<String> {
        let address = self.addresses.get(&ip)?;
        let names = self.pool_names_for(ip).join(", ");
        Some(format!("{} ({names})", address.ipv4))
    }

    /// The de-duplicated union of the member addresses of several pools,
    /// keeping first-seen order.
    #[must_use]
    pub fn addresses_in_pools(&self, pools: &[IpPoolId]) -> Vec<IpAddress> {
        let mut seen = ahash::AHashSet::new();
        pools
            .iter()
            .flat_map(|pool| self.members(*pool))
            .filter(|address| seen.insert(address.id))
            .cloned()
            .collect()
    }

    /// Snapshots pools and their memberships for the balancer. Unknown pool
    /// ids are skipped.
    #[must_use]
    pub fn pool_candidates(&self, pools: &[IpPoolId]) -> Vec<PoolCandidate> {
        pools
            .iter()
            .filter_map(|id| {
                let pool = self.pools.get(id)?;
                Some(PoolCandidate {
                    pool: pool.clone(),
                    ip_address_ids: self.members(*id).iter().map(|address| address.id).collect(),
                })
            })
            .collect()
    }

    /// Picks one member of `pool` with probability weighted by priority.
    ///
    /// Each member draws `random() * priority` and the highest draw wins,
    /// so a priority-0 address is only chosen when every member has
    /// priority 0. Returns `None` for an empty or unknown pool.
    pub fn select_by_priority<R: Rng + ?Sized>(
        &self,
        pool: IpPoolId,
        rng: &mut R,
    ) -> Option<IpAddress> {
        let mut best: Option<(f64, &IpAddress)> = None;

        for address in self.members(pool) {
            let score = rng.random::<f64>() * f64::from(address.priority);
            if best.is_none_or(|(top, _)| score > top) {
                best = Some((score, address));
            }
        }

        best.map(|(_, address)| address.clone())
    }

    fn require_address(&self, ip: IpAddressId) -> Result<&IpAddress, IpError> {
        self.addresses.get(&ip).ok_or(IpError::UnknownAddress(ip))
    }

    fn require_pool(&self, pool: IpPoolId) -> Result<&IpPool, IpError> {
        self.pools.get(&pool).ok_or(IpError::UnknownPool(pool))
    }
}
