//! Email to IP overrides
//!
//! Pins a sender address, or every sender at a domain via `*@domain`, to one
//! egress address on a given server. A match bypasses pool selection
//! entirely.

use ahash::AHashMap;
use outpost_common::Domain;

use super::IpRegistry;
use crate::{
    error::{IpError, MappingError},
    ids::{IpAddressId, ServerId},
};

const WILDCARD_PREFIX: &str = "*@";

/// Per-server override table keyed by `(server, email_address)`.
#[derive(Debug, Default, Clone)]
pub struct EmailIpMappings {
    mappings: AHashMap<(ServerId, String), IpAddressId>,
}

/// Stored form of a mapping key: literal mailboxes are kept verbatim,
/// wildcard domains are lowercased.
fn normalise(email: &str) -> String {
    let email = email.trim();
    match email.strip_prefix(WILDCARD_PREFIX) {
        Some(domain) => format!("{WILDCARD_PREFIX}{}", Domain::new(domain)),
        None => email.to_string(),
    }
}

impl EmailIpMappings {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a mapping after checking it against the registry.
    ///
    /// # Errors
    ///
    /// Rejects blank or duplicate keys, unknown servers and addresses, and
    /// addresses outside every pool of the server's organization.
    pub fn insert(
        &mut self,
        registry: &IpRegistry,
        server: ServerId,
        email: &str,
        ip: IpAddressId,
    ) -> Result<(), MappingError> {
        let key = normalise(email);
        if key.is_empty() || key == WILDCARD_PREFIX {
            return Err(MappingError::MissingEmail);
        }

        if self.mappings.contains_key(&(server, key.clone())) {
            return Err(MappingError::Duplicate { server, email: key });
        }

        let organization = registry
            .server_organization(server)
            .ok_or(IpError::UnknownServer(server))?;
        registry.address(ip).ok_or(IpError::UnknownAddress(ip))?;

        let organization_pools = registry.organization_pools(organization);
        let allowed = registry
            .pools_for_address(ip)
            .iter()
            .any(|pool| organization_pools.contains(&pool.id));
        if !allowed {
            return Err(MappingError::ForeignIpAddress { ip, server });
        }

        self.mappings.insert((server, key), ip);
        Ok(())
    }

    /// Removes a mapping, returning the address it pointed at.
    pub fn remove(&mut self, server: ServerId, email: &str) -> Option<IpAddressId> {
        self.mappings.remove(&(server, normalise(email)))
    }

    /// Drops every mapping that points at `ip`, returning how many went.
    pub fn remove_address(&mut self, ip: IpAddressId) -> usize {
        let before = self.mappings.len();
        self.mappings.retain(|_, mapped| *mapped != ip);
        before - self.mappings.len()
    }

    /// Finds the override for a sender.
    ///
    /// An exact match on the address wins; otherwise the `*@domain` wildcard
    /// for the address's domain is tried.
    #[must_use]
    pub fn match_for_email(&self, server: ServerId, email: &str) -> Option<IpAddressId> {
        let email = email.trim();
        if email.is_empty() {
            return None;
        }

        if let Some(ip) = self.mappings.get(&(server, email.to_string())) {
            return Some(*ip);
        }

        let domain = Domain::from_address(email)?;
        self.mappings
            .get(&(server, format!("{WILDCARD_PREFIX}{domain}")))
            .copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}
