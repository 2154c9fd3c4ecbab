//! Configuration file loading and registry seeding.
//!
//! An `outpost.config.ron` holds the engine settings plus an optional
//! `seed` describing the IP model to start with:
//!
//! ```ron
//! (
//!     dispatch: (ip_pools_enabled: true),
//!     seed: (
//!         pools: [
//!             (name: "primary", default: true, addresses: [
//!                 (ipv4: "192.0.2.1", hostname: "mta1.example.net", priority: Some(100)),
//!             ]),
//!         ],
//!         organizations: [(id: 1, pools: ["primary"])],
//!         servers: [(id: 1, organization: 1, default_pool: Some("primary"))],
//!     ),
//! )
//! ```

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use outpost_common::internal;
use outpost_dispatch::{
    DispatchConfig, Dispatcher, DispatchError, DnsError, EmailIpMappings, HickoryMxLookup,
    IpError, IpPoolId, IpRegistry, MappingError, MemoryQueueStore, NewIpAddress, OrganizationId,
    PoolRule, ServerId, ServerPoolRules, ServerPools,
};
use parking_lot::RwLock;
use serde::Deserialize;
use thiserror::Error;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "OUTPOST_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] ron::error::SpannedError),

    #[error("{CONFIG_ENV} points to non-existent file: {0}")]
    MissingEnvPath(PathBuf),

    #[error("No configuration file found. Tried:\n  - {CONFIG_ENV} environment variable\n{0}")]
    NotFound(String),

    #[error("Pool {0} is declared more than once")]
    DuplicatePool(String),

    #[error("Unknown pool {0}")]
    UnknownPool(String),

    #[error("No seeded address has IPv4 {0}")]
    UnknownAddress(String),

    #[error("Server {0} is declared more than once")]
    DuplicateServer(ServerId),

    #[error(transparent)]
    Ip(#[from] IpError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Dns(#[from] DnsError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Top level of `outpost.config.ron`.
#[derive(Debug, Default, Deserialize)]
pub struct OutpostConfig {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub seed: SeedConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeedConfig {
    #[serde(default)]
    pub pools: Vec<PoolSeed>,
    #[serde(default)]
    pub organizations: Vec<OrganizationSeed>,
    #[serde(default)]
    pub servers: Vec<ServerSeed>,
    #[serde(default)]
    pub mappings: Vec<MappingSeed>,
}

/// A pool and its member addresses. An address listed under several pools
/// is registered once and shared.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolSeed {
    pub name: String,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub addresses: Vec<NewIpAddress>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrganizationSeed {
    pub id: OrganizationId,
    #[serde(default)]
    pub pools: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSeed {
    pub id: ServerId,
    pub organization: OrganizationId,
    #[serde(default)]
    pub default_pool: Option<String>,
    #[serde(default)]
    pub rules: Vec<RuleSeed>,
}

/// A pool rule naming its pool instead of its id.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSeed {
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub from: Vec<String>,
    pub pool: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MappingSeed {
    pub server: ServerId,
    pub email: String,
    pub ipv4: String,
}

/// The IP model built from a [`SeedConfig`].
#[derive(Debug)]
pub struct Seeded {
    pub registry: IpRegistry,
    pub mappings: EmailIpMappings,
    pub pools: ServerPoolRules,
}

impl OutpostConfig {
    /// Parses a RON document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the document is not a valid config.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(content)?)
    }

    /// Reads and parses the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file can't be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&content)
    }

    /// Builds a dispatcher over the seeded IP model, an in-memory queue and
    /// the system resolver.
    ///
    /// # Errors
    ///
    /// Returns an error if the seed is invalid or the resolver can't be
    /// created.
    pub fn dispatcher(&self) -> Result<Dispatcher, ConfigError> {
        let Seeded {
            registry,
            mappings,
            pools,
        } = self.seed.build()?;
        let lookup = HickoryMxLookup::new(&self.dispatch.dns)?;

        Ok(Dispatcher::builder()
            .with_config(self.dispatch.clone())
            .with_memory_store(MemoryQueueStore::new())
            .with_mx_lookup(Arc::new(lookup))
            .with_registry(Arc::new(RwLock::new(registry)))
            .with_mappings(Arc::new(RwLock::new(mappings)))
            .with_pool_resolver(Arc::new(pools))
            .build()?)
    }
}

/// Pool ids by configured name, in declaration order.
#[derive(Debug, Default)]
struct PoolNames(Vec<(String, IpPoolId)>);

impl PoolNames {
    fn insert(&mut self, name: &str, id: IpPoolId) {
        self.0.push((name.trim().to_string(), id));
    }

    fn get(&self, name: &str) -> Option<IpPoolId> {
        let name = name.trim();
        self.0
            .iter()
            .find(|(known, _)| known == name)
            .map(|(_, id)| *id)
    }

    fn require(&self, name: &str) -> Result<IpPoolId, ConfigError> {
        self.get(name)
            .ok_or_else(|| ConfigError::UnknownPool(name.to_string()))
    }
}

impl SeedConfig {
    /// Registers pools, addresses, organizations, servers and overrides in
    /// that order, validating each against what came before.
    ///
    /// # Errors
    ///
    /// Returns the first validation failure.
    pub fn build(&self) -> Result<Seeded, ConfigError> {
        let mut registry = IpRegistry::new();
        let mut names = PoolNames::default();

        for seed in &self.pools {
            if names.get(&seed.name).is_some() {
                return Err(ConfigError::DuplicatePool(seed.name.clone()));
            }

            let pool = registry.insert_pool(&seed.name, seed.default)?;
            names.insert(&seed.name, pool.id);

            for address in &seed.addresses {
                let existing = registry.find_by_ipv4(&address.ipv4).map(|ip| ip.id);
                let id = match existing {
                    Some(id) => id,
                    None => registry.insert_address(address.clone())?.id,
                };
                registry.add_to_pool(id, pool.id)?;
            }
        }

        for organization in &self.organizations {
            for name in &organization.pools {
                registry.attach_pool(organization.id, names.require(name)?)?;
            }
        }

        let mut pools = ServerPoolRules::new();
        for server in &self.servers {
            if registry.server_organization(server.id).is_some() {
                return Err(ConfigError::DuplicateServer(server.id));
            }
            registry.register_server(server.id, server.organization);

            let default_pool = server
                .default_pool
                .as_deref()
                .map(|name| names.require(name))
                .transpose()?;
            let rules = server
                .rules
                .iter()
                .map(|rule| {
                    Ok(PoolRule {
                        to: rule.to.clone(),
                        from: rule.from.clone(),
                        pool: names.require(&rule.pool)?,
                    })
                })
                .collect::<Result<Vec<_>, ConfigError>>()?;

            pools.set(
                server.id,
                ServerPools {
                    default_pool,
                    rules,
                },
            );
        }

        let mut mappings = EmailIpMappings::new();
        for mapping in &self.mappings {
            let ip = registry
                .find_by_ipv4(&mapping.ipv4)
                .map(|address| address.id)
                .ok_or_else(|| ConfigError::UnknownAddress(mapping.ipv4.clone()))?;
            mappings.insert(&registry, mapping.server, &mapping.email, ip)?;
        }

        internal!(
            level = INFO,
            "Seeded {} pool(s), {} server(s) and {} override(s)",
            self.pools.len(),
            self.servers.len(),
            mappings.len()
        );

        Ok(Seeded {
            registry,
            mappings,
            pools,
        })
    }
}

/// Paths searched, in order, when [`CONFIG_ENV`] is unset.
#[must_use]
pub fn default_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from("./outpost.config.ron"),
        PathBuf::from("/etc/outpost/outpost.config.ron"),
    ]
}

/// Find the configuration file using the following precedence:
/// 1. `OUTPOST_CONFIG` environment variable
/// 2. ./outpost.config.ron (current working directory)
/// 3. /etc/outpost/outpost.config.ron (system-wide config)
///
/// # Errors
///
/// Returns an error if the environment variable names a missing file, or
/// no default path exists.
pub fn find_config_file() -> Result<PathBuf, ConfigError> {
    locate(
        std::env::var_os(CONFIG_ENV).map(PathBuf::from),
        &default_paths(),
    )
}

/// [`find_config_file`] with the environment and search paths supplied.
///
/// # Errors
///
/// See [`find_config_file`].
pub fn locate(env_path: Option<PathBuf>, defaults: &[PathBuf]) -> Result<PathBuf, ConfigError> {
    if let Some(path) = env_path {
        if path.exists() {
            return Ok(path);
        }
        return Err(ConfigError::MissingEnvPath(path));
    }

    if let Some(path) = defaults.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = defaults
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    Err(ConfigError::NotFound(paths_tried))
}
