//! MX-aware batch keys.
//!
//! Messages for different domains that share mail-exchange hosts (two
//! companies on the same hosted provider, say) can go out over one SMTP
//! session. Domains are fingerprinted by their sorted MX hostnames; the
//! fingerprint becomes the batch key.
//!
//! # Caching Strategy
//!
//! - **Per resolver**: the cache is owned by a [`MxBatchKeyResolver`], not
//!   a process-wide static, and reads time through an injected [`Clock`]
//! - **Short TTLs**: minutes, since MX records can change; failed lookups
//!   are cached for a shorter time than empty answers
//! - **Bounded**: once `cache_size` is reached, expired entries are purged
//!   and then the entry closest to expiry is evicted
//! - **Lock-free**: `DashMap` gives concurrent access without a global mutex
//!
//! The cache is process-local. Separate workers may resolve the same domain
//! independently; only the TTL bounds staleness.

use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use hickory_resolver::{
    TokioResolver,
    config::ResolverOpts,
    name_server::TokioConnectionProvider,
};
use outpost_common::{Clock, Domain};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::ids::RouteId;

/// Length of the hex fingerprint used in batch keys.
pub const MX_HASH_LEN: usize = 16;

/// Errors that can occur during MX resolution.
#[derive(Debug, Error)]
pub enum DnsError {
    /// DNS query failed due to network or resolver issues.
    #[error("DNS lookup failed: {0}")]
    LookupFailed(String),

    /// DNS query timed out.
    #[error("DNS query timed out for domain: {0}")]
    Timeout(String),
}

impl From<hickory_resolver::ResolveError> for DnsError {
    fn from(error: hickory_resolver::ResolveError) -> Self {
        Self::LookupFailed(error.to_string())
    }
}

/// Configuration for MX resolution and the batch-key cache.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    /// DNS query timeout in seconds (default: 5)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// How long a resolved (or empty) answer is reused, in seconds
    /// (default: 300)
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// How long a failed lookup is remembered, in seconds (default: 60)
    #[serde(default = "default_failure_ttl_secs")]
    pub failure_ttl_secs: u64,

    /// Maximum number of cached domains (default: 10000)
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
}

const fn default_timeout_secs() -> u64 {
    5
}

const fn default_cache_ttl_secs() -> u64 {
    300 // 5 minutes
}

const fn default_failure_ttl_secs() -> u64 {
    60
}

const fn default_cache_size() -> usize {
    10_000
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            failure_ttl_secs: default_failure_ttl_secs(),
            cache_size: default_cache_size(),
        }
    }
}

/// One MX answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    /// Lower value = higher priority. Ignored for batching.
    pub priority: u16,
    pub host: String,
}

impl MxRecord {
    #[must_use]
    pub fn new(priority: u16, host: impl Into<String>) -> Self {
        Self {
            priority,
            host: host.into(),
        }
    }
}

/// MX lookups.
///
/// Implementations return `Ok(vec![])` when the domain has no MX records
/// and `Err(DnsError::Timeout)` when the query timed out.
#[async_trait]
pub trait MxLookup: Send + Sync + Debug {
    async fn mx(&self, domain: &str) -> Result<Vec<MxRecord>, DnsError>;
}

/// [`MxLookup`] backed by the system resolver configuration.
#[derive(Debug)]
pub struct HickoryMxLookup {
    resolver: TokioResolver,
    timeout: Duration,
}

impl HickoryMxLookup {
    /// Creates a lookup using the system DNS configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the system DNS configuration cannot be loaded.
    pub fn new(config: &DnsConfig) -> Result<Self, DnsError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())?
            .with_options(opts)
            .build();

        Ok(Self { resolver, timeout })
    }
}

#[async_trait]
impl MxLookup for HickoryMxLookup {
    async fn mx(&self, domain: &str) -> Result<Vec<MxRecord>, DnsError> {
        // The resolver retries internally, so bound the whole lookup as well
        let lookup = tokio::time::timeout(
            self.timeout.saturating_mul(2),
            self.resolver.mx_lookup(domain),
        )
        .await
        .map_err(|_| DnsError::Timeout(domain.to_string()))?;

        match lookup {
            Ok(mx_lookup) => Ok(mx_lookup
                .iter()
                .map(|mx| MxRecord::new(mx.preference(), mx.exchange().to_utf8()))
                .collect()),
            Err(err) if err.is_no_records_found() || err.is_nx_domain() => {
                debug!("No MX records found for {domain}");
                Ok(Vec::new())
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Fingerprints a set of MX records by hostname only.
///
/// Hostnames are normalised (lowercase, no root dot), de-duplicated and
/// sorted, so priorities and answer order never change the result.
/// Returns `None` for an empty set.
#[must_use]
pub fn mx_hash(records: &[MxRecord]) -> Option<String> {
    let mut hosts: Vec<Domain> = records
        .iter()
        .map(|record| Domain::new(&record.host))
        .filter(|host| !host.is_empty())
        .collect();
    if hosts.is_empty() {
        return None;
    }

    hosts.sort();
    hosts.dedup();

    let joined = hosts
        .iter()
        .map(Domain::as_str)
        .collect::<Vec<_>>()
        .join(",");
    let digest = Sha256::digest(joined.as_bytes());

    let mut hash = hex::encode(digest);
    hash.truncate(MX_HASH_LEN);
    Some(hash)
}

/// Cached fingerprint with expiration time.
#[derive(Debug, Clone)]
struct CachedHash {
    hash: Option<Arc<str>>,
    expires_at: DateTime<Utc>,
}

/// Snapshot of cache occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub expired: usize,
}

/// How a message should be grouped for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchScope {
    /// Outbound mail, grouped by the recipient domain's MX hosts
    Outgoing { recipient_domain: Option<Domain> },
    /// Inbound mail routed to an endpoint, grouped by route and endpoint
    Incoming {
        route: RouteId,
        endpoint_id: u64,
        endpoint_type: String,
    },
    /// Not batchable
    Other,
}

/// Resolves MX fingerprints and derives batch keys.
#[derive(Debug)]
pub struct MxBatchKeyResolver {
    lookup: Arc<dyn MxLookup>,
    clock: Arc<dyn Clock>,
    cache: DashMap<Domain, CachedHash>,
    config: DnsConfig,
}

impl MxBatchKeyResolver {
    #[must_use]
    pub fn new(lookup: Arc<dyn MxLookup>, clock: Arc<dyn Clock>, config: DnsConfig) -> Self {
        Self {
            lookup,
            clock,
            cache: DashMap::new(),
            config,
        }
    }

    /// Returns the MX fingerprint for a domain, or `None` when the domain is
    /// empty, has no MX records, or could not be resolved.
    ///
    /// Never fails: DNS errors are logged and treated as "no records".
    pub async fn mx_hash_for_domain(&self, domain: &str) -> Option<Arc<str>> {
        let domain = Domain::new(domain);
        if domain.is_empty() {
            return None;
        }

        let now = self.clock.now();
        if let Some(cached) = self.cache.get(&domain) {
            if cached.expires_at > now {
                debug!("MX cache hit for {domain}");
                return cached.hash.clone();
            }
            debug!("MX cache entry expired for {domain}");
        }

        let (hash, ttl_secs) = match self.lookup.mx(&domain).await {
            Ok(records) => (mx_hash(&records).map(Arc::from), self.config.cache_ttl_secs),
            Err(DnsError::Timeout(_)) => {
                debug!("MX lookup timed out for {domain}, treating as no records");
                (None, self.config.failure_ttl_secs)
            }
            Err(err) => {
                warn!("Failed to resolve MX for {domain}: {err}");
                (None, self.config.failure_ttl_secs)
            }
        };

        self.store(domain, hash.clone(), ttl_secs);
        hash
    }

    /// Derives the batch key for a message.
    ///
    /// - Outgoing: `outgoing-<mx hash>`, or `outgoing-<domain>` when there is
    ///   no hash. A recipient without a domain gets no key
    /// - Incoming: `incoming-rt:<route>-ep:<endpoint id>-<endpoint type>`,
    ///   without any DNS lookup
    /// - Anything else: no key
    pub async fn batch_key(&self, scope: &BatchScope) -> Option<String> {
        match scope {
            BatchScope::Outgoing { recipient_domain } => {
                let domain = recipient_domain.as_ref().filter(|domain| !domain.is_empty())?;
                Some(match self.mx_hash_for_domain(domain.as_str()).await {
                    Some(hash) => format!("outgoing-{hash}"),
                    None => format!("outgoing-{domain}"),
                })
            }
            BatchScope::Incoming {
                route,
                endpoint_id,
                endpoint_type,
            } => Some(format!(
                "incoming-rt:{}-ep:{endpoint_id}-{endpoint_type}",
                route.get()
            )),
            BatchScope::Other => None,
        }
    }

    /// Drops the cached entry for a domain so the next call resolves again.
    pub fn invalidate(&self, domain: &str) -> bool {
        self.cache.remove(&Domain::new(domain)).is_some()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let now = self.clock.now();
        let expired = self
            .cache
            .iter()
            .filter(|entry| entry.value().expires_at <= now)
            .count();

        CacheStats {
            entries: self.cache.len(),
            expired,
        }
    }

    fn store(&self, domain: Domain, hash: Option<Arc<str>>, ttl_secs: u64) {
        let now = self.clock.now();
        let expires_at = i64::try_from(ttl_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        if !self.cache.contains_key(&domain) && self.cache.len() >= self.config.cache_size {
            self.evict(now);
        }

        self.cache.insert(
            domain,
            CachedHash { hash, expires_at },
        );
    }

    /// Purges expired entries, then (if still full) the entry nearest to
    /// expiry.
    fn evict(&self, now: DateTime<Utc>) {
        self.cache.retain(|_, cached| cached.expires_at > now);

        if self.cache.len() < self.config.cache_size {
            return;
        }

        let oldest = self
            .cache
            .iter()
            .min_by_key(|entry| entry.value().expires_at)
            .map(|entry| entry.key().clone());

        if let Some(domain) = oldest {
            debug!("MX cache full, evicting {domain}");
            self.cache.remove(&domain);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ahash::AHashMap;
    use outpost_common::ManualClock;
    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Debug, Default)]
    struct ScriptedLookup {
        answers: AHashMap<String, Result<Vec<MxRecord>, String>>,
        calls: AtomicUsize,
    }

    impl ScriptedLookup {
        fn with(mut self, domain: &str, hosts: &[(u16, &str)]) -> Self {
            self.answers.insert(
                domain.to_string(),
                Ok(hosts.iter().map(|(p, h)| MxRecord::new(*p, *h)).collect()),
            );
            self
        }

        fn failing(mut self, domain: &str, error: &str) -> Self {
            self.answers
                .insert(domain.to_string(), Err(error.to_string()));
            self
        }
    }

    #[async_trait]
    impl MxLookup for ScriptedLookup {
        async fn mx(&self, domain: &str) -> Result<Vec<MxRecord>, DnsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.answers.get(domain) {
                Some(Ok(records)) => Ok(records.clone()),
                Some(Err(error)) if error == "timeout" => Err(DnsError::Timeout(domain.to_string())),
                Some(Err(error)) => Err(DnsError::LookupFailed(error.clone())),
                None => Ok(Vec::new()),
            }
        }
    }

    fn resolver(lookup: ScriptedLookup) -> (MxBatchKeyResolver, Arc<ScriptedLookup>, ManualClock) {
        let lookup = Arc::new(lookup);
        let clock = ManualClock::at_unix(1_700_000_000);
        let resolver = MxBatchKeyResolver::new(
            lookup.clone(),
            Arc::new(clock.clone()),
            DnsConfig::default(),
        );
        (resolver, lookup, clock)
    }

    #[test]
    fn test_mx_hash_shape() {
        let hash = mx_hash(&[MxRecord::new(10, "mail1.example.com")]).unwrap();
        assert_eq!(hash.len(), MX_HASH_LEN);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(mx_hash(&[]), None);
    }

    #[test]
    fn test_mx_hash_ignores_priority_order_and_case() {
        let a = mx_hash(&[
            MxRecord::new(10, "mail1.example.com."),
            MxRecord::new(20, "mail2.example.com"),
        ]);
        let b = mx_hash(&[
            MxRecord::new(15, "MAIL2.example.com"),
            MxRecord::new(5, "mail1.example.com"),
        ]);
        assert_eq!(a, b);

        let c = mx_hash(&[MxRecord::new(10, "mail3.example.com")]);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_shared_mx_hosts_share_a_hash() {
        let (resolver, _, _) = resolver(
            ScriptedLookup::default()
                .with("domain1.com", &[(10, "mail1.example.com"), (20, "mail2.example.com")])
                .with("domain2.com", &[(5, "mail1.example.com"), (15, "mail2.example.com")]),
        );

        let one = resolver.mx_hash_for_domain("domain1.com").await;
        let two = resolver.mx_hash_for_domain("domain2.com").await;
        assert!(one.is_some());
        assert_eq!(one, two);
    }

    #[tokio::test]
    async fn test_blank_domain_skips_dns() {
        let (resolver, lookup, _) = resolver(ScriptedLookup::default());
        assert_eq!(resolver.mx_hash_for_domain("").await, None);
        assert_eq!(resolver.mx_hash_for_domain("  ").await, None);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cache_hit_within_ttl_and_refresh_after() {
        let (resolver, lookup, clock) =
            resolver(ScriptedLookup::default().with("cached.com", &[(10, "mail.cached.com")]));

        let first = resolver.mx_hash_for_domain("cached.com").await;
        let second = resolver.mx_hash_for_domain("Cached.com").await;
        assert_eq!(first, second);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);

        clock.advance(TimeDelta::seconds(301));
        let third = resolver.mx_hash_for_domain("cached.com").await;
        assert_eq!(first, third);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_answer_is_cached() {
        let (resolver, lookup, _) = resolver(ScriptedLookup::default().with("nomail.com", &[]));

        assert_eq!(resolver.mx_hash_for_domain("nomail.com").await, None);
        assert_eq!(resolver.mx_hash_for_domain("nomail.com").await, None);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_are_absorbed_and_cached_briefly() {
        let (resolver, lookup, clock) = resolver(
            ScriptedLookup::default()
                .failing("error.com", "SERVFAIL")
                .failing("slow.com", "timeout"),
        );

        assert_eq!(resolver.mx_hash_for_domain("error.com").await, None);
        assert_eq!(resolver.mx_hash_for_domain("slow.com").await, None);
        assert_eq!(resolver.mx_hash_for_domain("error.com").await, None);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 2);

        clock.advance(TimeDelta::seconds(61));
        assert_eq!(resolver.mx_hash_for_domain("error.com").await, None);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cache_is_bounded() {
        let lookup = Arc::new(ScriptedLookup::default());
        let clock = ManualClock::at_unix(1_700_000_000);
        let resolver = MxBatchKeyResolver::new(
            lookup,
            Arc::new(clock.clone()),
            DnsConfig {
                cache_size: 2,
                ..DnsConfig::default()
            },
        );

        resolver.mx_hash_for_domain("a.com").await;
        clock.advance(TimeDelta::seconds(1));
        resolver.mx_hash_for_domain("b.com").await;
        clock.advance(TimeDelta::seconds(1));
        resolver.mx_hash_for_domain("c.com").await;

        assert_eq!(resolver.stats().entries, 2);
        // a.com expired soonest, so it went first
        assert!(!resolver.invalidate("a.com"));
        assert!(resolver.invalidate("c.com"));
    }

    #[tokio::test]
    async fn test_batch_keys() {
        let (resolver, lookup, _) = resolver(
            ScriptedLookup::default()
                .with("corp-a.com", &[(10, "mail.sharedhost.com")])
                .with("corp-b.com", &[(20, "mail.sharedhost.com")]),
        );

        let outgoing = |domain: &str| BatchScope::Outgoing {
            recipient_domain: Some(Domain::new(domain)),
        };

        let a = resolver.batch_key(&outgoing("corp-a.com")).await.unwrap();
        let b = resolver.batch_key(&outgoing("corp-b.com")).await.unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("outgoing-"));
        assert_eq!(a.len(), "outgoing-".len() + MX_HASH_LEN);

        assert_eq!(
            resolver.batch_key(&outgoing("nomail.com")).await.as_deref(),
            Some("outgoing-nomail.com")
        );

        let calls = lookup.calls.load(Ordering::SeqCst);
        let incoming = BatchScope::Incoming {
            route: RouteId(4),
            endpoint_id: 9,
            endpoint_type: "HTTPEndpoint".to_string(),
        };
        assert_eq!(
            resolver.batch_key(&incoming).await.as_deref(),
            Some("incoming-rt:4-ep:9-HTTPEndpoint")
        );
        assert_eq!(lookup.calls.load(Ordering::SeqCst), calls);

        assert_eq!(resolver.batch_key(&BatchScope::Other).await, None);
    }

    #[tokio::test]
    async fn test_recipient_without_domain_is_not_batched() {
        let (resolver, lookup, _) = resolver(ScriptedLookup::default());

        let missing = BatchScope::Outgoing {
            recipient_domain: None,
        };
        let blank = BatchScope::Outgoing {
            recipient_domain: Some(Domain::new(" ")),
        };
        assert_eq!(resolver.batch_key(&missing).await, None);
        assert_eq!(resolver.batch_key(&blank).await, None);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_huge_ttl_saturates() {
        let lookup = Arc::new(ScriptedLookup::default().with("forever.com", &[(10, "mx.forever.com")]));
        let clock = ManualClock::at_unix(1_700_000_000);
        let resolver = MxBatchKeyResolver::new(
            lookup.clone(),
            Arc::new(clock.clone()),
            DnsConfig {
                cache_ttl_secs: u64::MAX,
                failure_ttl_secs: u64::MAX,
                ..DnsConfig::default()
            },
        );

        let hash = resolver.mx_hash_for_domain("forever.com").await;
        assert!(hash.is_some());
        assert_eq!(resolver.mx_hash_for_domain("never.com").await, None);

        clock.advance(TimeDelta::days(365 * 100));
        assert_eq!(resolver.mx_hash_for_domain("forever.com").await, hash);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 2);
        assert_eq!(resolver.stats().expired, 0);
    }

    #[tokio::test]
    #[ignore = "Requires network access"]
    async fn test_hickory_lookup_gmail() {
        let lookup = HickoryMxLookup::new(&DnsConfig::default()).unwrap();
        let records = lookup.mx("gmail.com").await.unwrap();
        assert!(!records.is_empty());
    }
}
