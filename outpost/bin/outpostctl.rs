//! Command-line diagnostics for the outpost dispatch engine
//!
//! - MX batch keys: which recipient domains would share a delivery batch
//! - Pool balancing: the least-used pool for an organization
//! - Address selection: how often each pool member is picked

use std::{collections::BTreeMap, path::PathBuf};

use clap::{Parser, Subcommand};
use outpost::{OutpostConfig, find_config_file};
use outpost_common::{Domain, logging};
use outpost_dispatch::{BatchScope, OrganizationId, UsageWindow};

/// Inspect batching and IP allocation decisions
#[derive(Parser, Debug)]
#[command(name = "outpostctl")]
#[command(about = "Inspect outpost dispatch decisions", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to OUTPOST_CONFIG, then the standard paths)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve MX hashes and show which domains batch together
    Mx {
        /// Recipient domains to resolve
        #[arg(required = true)]
        domains: Vec<String>,
    },
    /// IP pool balancing
    Pool {
        #[command(subcommand)]
        action: PoolAction,
    },
    /// IP address selection
    Ip {
        #[command(subcommand)]
        action: IpAction,
    },
}

#[derive(Subcommand, Debug)]
enum PoolAction {
    /// Show pool usage and the pool the balancer would pick right now
    LeastUsed {
        /// Organization id (defaults to the first configured organization)
        #[arg(long)]
        organization: Option<u64>,

        /// Rotate among this many least-used pools (0 uses the configured value)
        #[arg(long, default_value = "0")]
        top_n: usize,

        /// Usage window: all-time, today, yesterday, week, month or year
        #[arg(long, default_value = "all-time")]
        window: UsageWindow,
    },
}

#[derive(Subcommand, Debug)]
enum IpAction {
    /// Draw from a pool repeatedly and print how often each address won
    Sample {
        /// Pool name
        #[arg(long)]
        pool: String,

        /// Number of draws
        #[arg(long, default_value = "10000")]
        draws: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref(), matches!(cli.command, Commands::Mx { .. }))?;

    match cli.command {
        Commands::Mx { domains } => cmd_mx(&config, &domains).await?,
        Commands::Pool {
            action:
                PoolAction::LeastUsed {
                    organization,
                    top_n,
                    window,
                },
        } => cmd_least_used(&config, organization, top_n, window).await?,
        Commands::Ip {
            action: IpAction::Sample { pool, draws },
        } => cmd_sample(&config, &pool, draws)?,
    }

    Ok(())
}

/// Loads the configuration, falling back to defaults when `optional` and no
/// file can be found.
fn load_config(explicit: Option<&PathBuf>, optional: bool) -> anyhow::Result<OutpostConfig> {
    let path = match explicit {
        Some(path) => path.clone(),
        None => match find_config_file() {
            Ok(path) => path,
            Err(err) if optional => {
                tracing::debug!("Using default configuration: {err}");
                return Ok(OutpostConfig::default());
            }
            Err(err) => return Err(err.into()),
        },
    };

    OutpostConfig::load(&path)
        .map_err(|e| anyhow::anyhow!("Failed to load config from {}: {e}", path.display()))
}

async fn cmd_mx(config: &OutpostConfig, domains: &[String]) -> anyhow::Result<()> {
    let dispatcher = config.dispatcher()?;
    let resolver = dispatcher.batch_keys();

    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();

    println!("{:<32} {:<18} {:<40}", "DOMAIN", "MX HASH", "BATCH KEY");
    println!("{}", "-".repeat(90));

    for domain in domains {
        let hash = resolver.mx_hash_for_domain(domain).await;
        let scope = BatchScope::Outgoing {
            recipient_domain: Some(Domain::new(domain)),
        };
        let key = resolver.batch_key(&scope).await.unwrap_or_default();

        println!(
            "{domain:<32} {:<18} {key:<40}",
            hash.as_deref().unwrap_or("-")
        );
        groups.entry(key).or_default().push(domain.clone());
    }

    let shared: Vec<_> = groups.values().filter(|members| members.len() > 1).collect();
    if shared.is_empty() {
        println!("\nNo domains share a batch");
    } else {
        println!("\nBatched together:");
        for members in shared {
            println!("  {}", members.join(", "));
        }
    }

    Ok(())
}

async fn cmd_least_used(
    config: &OutpostConfig,
    organization: Option<u64>,
    top_n: usize,
    window: UsageWindow,
) -> anyhow::Result<()> {
    let organization = organization
        .map(OrganizationId)
        .or_else(|| config.seed.organizations.first().map(|org| org.id))
        .ok_or_else(|| anyhow::anyhow!("No organization given and none configured"))?;

    let dispatcher = config.dispatcher()?;
    let candidates = {
        let registry = dispatcher.registry().read();
        registry.pool_candidates(&registry.organization_pools(organization))
    };

    let usages = dispatcher.balancer().usage(&candidates, window).await?;

    println!("{:<24} {:>8} {:>10} {:>10}", "POOL", "IPS", "MESSAGES", "RATIO");
    println!("{}", "-".repeat(55));
    for usage in &usages {
        println!(
            "{:<24} {:>8} {:>10} {:>10.2}",
            usage.pool.name, usage.ip_count, usage.messages, usage.ratio
        );
    }

    let chosen = dispatcher
        .least_used_pool_for_organization(organization, top_n, window)
        .await?;
    println!("\nSelected: {} ({})", chosen.name, chosen.id);

    Ok(())
}

fn cmd_sample(config: &OutpostConfig, pool: &str, draws: u32) -> anyhow::Result<()> {
    let registry = config.seed.build()?.registry;
    let pool = registry
        .pool_by_name(pool)
        .ok_or_else(|| anyhow::anyhow!("Unknown pool {pool}"))?;

    let mut wins: BTreeMap<String, u32> = registry
        .members(pool.id)
        .iter()
        .map(|address| (address.ipv4.to_string(), 0))
        .collect();
    if wins.is_empty() {
        anyhow::bail!("Pool {} has no addresses", pool.name);
    }

    let mut rng = rand::rng();
    for _ in 0..draws {
        if let Some(address) = registry.select_by_priority(pool.id, &mut rng) {
            *wins.entry(address.ipv4.to_string()).or_default() += 1;
        }
    }

    println!("{:<18} {:>8} {:>10} {:>8}", "ADDRESS", "PRIORITY", "DRAWS", "SHARE");
    println!("{}", "-".repeat(47));
    for address in registry.members(pool.id) {
        let count = wins.get(&address.ipv4.to_string()).copied().unwrap_or_default();
        println!(
            "{:<18} {:>8} {:>10} {:>7.2}%",
            address.ipv4,
            address.priority,
            count,
            f64::from(count) * 100.0 / f64::from(draws.max(1))
        );
    }

    Ok(())
}
