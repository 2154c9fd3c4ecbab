//! The queue dispatch engine
//!
//! [`Dispatcher`] ties the pieces together: it allocates an egress address
//! and batch key when a message is enqueued, hands ready batches to
//! workers under an exclusive claim, and settles each claim as delivered,
//! retried or abandoned.
//!
//! All cross-worker coordination goes through the [`QueueStore`]. The
//! dispatcher itself holds no queue state, so any number of dispatchers
//! (in any number of processes) can share one store.

use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use outpost_common::{Clock, SystemClock, dispatch, internal};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::{
    balancer::{PoolAssignmentRequest, PoolBalancer, UsageSource, UsageWindow},
    config::DispatchConfig,
    error::{DeliveryError, DispatchError, StoreError},
    ids::{IpAddressId, IpPoolId, OrganizationId, QueuedMessageId, ServerId, WorkerId},
    ip::{EmailIpMappings, IpAddress, IpPool, IpRegistry},
    mx::{MxBatchKeyResolver, MxLookup},
    policy::{PoolResolver, ServerPoolRules},
    queue::{
        Allocation, Completion, MemoryQueueStore, NewQueuedMessage, QueueStats, QueueStore,
        QueuedMessage, ReadyFilter,
    },
};

/// Receives messages that were abandoned and asked for a bounce.
#[async_trait]
pub trait BounceSink: Send + Sync + Debug {
    async fn bounce(&self, message: &QueuedMessage, reason: &str);
}

/// A primary message and the siblings claimed with it.
///
/// Every message in the batch carries the same lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedBatch {
    pub primary: QueuedMessage,
    pub siblings: Vec<QueuedMessage>,
}

impl ClaimedBatch {
    /// The primary first, then siblings.
    pub fn messages(&self) -> impl Iterator<Item = &QueuedMessage> {
        std::iter::once(&self.primary).chain(&self.siblings)
    }

    pub fn ids(&self) -> Vec<QueuedMessageId> {
        self.messages().map(|message| message.id).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        1 + self.siblings.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }
}

/// What happened to a message after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Released and gated until `retry_after`
    Retrying(QueuedMessage),
    /// Removed from the queue
    Abandoned(QueuedMessage),
}

/// Queue dispatch engine.
#[derive(Debug)]
pub struct Dispatcher {
    config: DispatchConfig,
    store: Arc<dyn QueueStore>,
    registry: Arc<RwLock<IpRegistry>>,
    mappings: Arc<RwLock<EmailIpMappings>>,
    pools: Arc<dyn PoolResolver>,
    batch_keys: MxBatchKeyResolver,
    balancer: PoolBalancer,
    bounces: Option<Arc<dyn BounceSink>>,
    clock: Arc<dyn Clock>,
}

/// Builder for [`Dispatcher`]
///
/// A store, a usage source and an MX lookup are required;
/// [`DispatcherBuilder::with_memory_store`] supplies the first two at once.
#[derive(Debug, Default)]
pub struct DispatcherBuilder {
    config: DispatchConfig,
    store: Option<Arc<dyn QueueStore>>,
    usage: Option<Arc<dyn UsageSource>>,
    lookup: Option<Arc<dyn MxLookup>>,
    registry: Option<Arc<RwLock<IpRegistry>>>,
    mappings: Option<Arc<RwLock<EmailIpMappings>>>,
    pools: Option<Arc<dyn PoolResolver>>,
    bounces: Option<Arc<dyn BounceSink>>,
    clock: Option<Arc<dyn Clock>>,
}

impl DispatcherBuilder {
    #[must_use]
    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_usage(mut self, usage: Arc<dyn UsageSource>) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Uses one in-memory store as both queue and usage source.
    #[must_use]
    pub fn with_memory_store(self, store: MemoryQueueStore) -> Self {
        let store = Arc::new(store);
        self.with_store(store.clone()).with_usage(store)
    }

    #[must_use]
    pub fn with_mx_lookup(mut self, lookup: Arc<dyn MxLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    #[must_use]
    pub fn with_registry(mut self, registry: Arc<RwLock<IpRegistry>>) -> Self {
        self.registry = Some(registry);
        self
    }

    #[must_use]
    pub fn with_mappings(mut self, mappings: Arc<RwLock<EmailIpMappings>>) -> Self {
        self.mappings = Some(mappings);
        self
    }

    #[must_use]
    pub fn with_pool_resolver(mut self, pools: Arc<dyn PoolResolver>) -> Self {
        self.pools = Some(pools);
        self
    }

    #[must_use]
    pub fn with_bounce_sink(mut self, bounces: Arc<dyn BounceSink>) -> Self {
        self.bounces = Some(bounces);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the final `Dispatcher`
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] if the store, usage source
    /// or MX lookup is missing.
    pub fn build(self) -> Result<Dispatcher, DispatchError> {
        let missing = |what: &str| DispatchError::Configuration(format!("{what} is required"));

        let store = self.store.ok_or_else(|| missing("a queue store"))?;
        let usage = self.usage.ok_or_else(|| missing("a usage source"))?;
        let lookup = self.lookup.ok_or_else(|| missing("an MX lookup"))?;
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);

        let batch_keys = MxBatchKeyResolver::new(lookup, clock.clone(), self.config.dns.clone());
        let balancer = PoolBalancer::new(usage, clock.clone(), self.config.balancer.clone());

        Ok(Dispatcher {
            store,
            registry: self.registry.unwrap_or_default(),
            mappings: self.mappings.unwrap_or_default(),
            pools: self
                .pools
                .unwrap_or_else(|| Arc::new(ServerPoolRules::new()) as Arc<dyn PoolResolver>),
            batch_keys,
            balancer,
            bounces: self.bounces,
            clock,
            config: self.config,
        })
    }
}

impl Dispatcher {
    #[must_use]
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    #[must_use]
    pub const fn config(&self) -> &DispatchConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<RwLock<IpRegistry>> {
        &self.registry
    }

    #[must_use]
    pub const fn mappings(&self) -> &Arc<RwLock<EmailIpMappings>> {
        &self.mappings
    }

    #[must_use]
    pub const fn batch_keys(&self) -> &MxBatchKeyResolver {
        &self.batch_keys
    }

    #[must_use]
    pub const fn balancer(&self) -> &PoolBalancer {
        &self.balancer
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn ready_filter(&self) -> ReadyFilter {
        ReadyFilter {
            grace: self.config.ready_grace(),
            server: None,
        }
    }

    /// Chooses the egress address for a message.
    ///
    /// An override for the envelope sender wins outright. Otherwise the
    /// message's pool is resolved and a member drawn by priority. `None`
    /// means "send from the system default address".
    pub fn allocate_ip_address(&self, message: &NewQueuedMessage) -> Option<IpAddressId> {
        let registry = self.registry.read();

        let mapped = self
            .mappings
            .read()
            .match_for_email(message.server, &message.mail_from);
        if let Some(ip) = mapped {
            if registry.address(ip).is_some() {
                debug!("Using override {ip} for sender {}", message.mail_from);
                return Some(ip);
            }
            warn!("Override for {} points at unknown {ip}, ignoring", message.mail_from);
        }

        let pool = self.pools.resolve_pool_for(message)?;
        registry
            .select_by_priority(pool, &mut rand::rng())
            .map(|address| address.id)
    }

    /// Accepts a message for delivery, fixing its address and batch key.
    ///
    /// Neither DNS failures nor a lack of addresses block the enqueue: the
    /// message falls back to a literal-domain batch key or no address.
    ///
    /// # Errors
    ///
    /// Only store failures are returned.
    pub async fn enqueue(&self, message: NewQueuedMessage) -> Result<QueuedMessage, DispatchError> {
        let ip_address = if self.config.ip_pools_enabled {
            let ip = self.allocate_ip_address(&message);
            if ip.is_none() {
                dispatch!(
                    level = WARN,
                    server = %message.server,
                    "No IP address available for {}, leaving it unassigned",
                    message.message
                );
            }
            ip
        } else {
            None
        };

        let batch_key = self.batch_keys.batch_key(&message.batch_scope()).await;
        let queued = self
            .store
            .insert(
                message,
                Allocation {
                    ip_address,
                    batch_key,
                },
                self.clock.now(),
            )
            .await?;

        dispatch!(
            level = DEBUG,
            id = %queued.id,
            batch_key = queued.batch_key.as_deref().unwrap_or("-"),
            "Queued {} for {}",
            queued.message,
            queued.rcpt_to
        );

        Ok(queued)
    }

    /// Fetches a queued message by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn get(&self, id: QueuedMessageId) -> Result<Option<QueuedMessage>, DispatchError> {
        Ok(self.store.get(id).await?)
    }

    /// Claims the next ready message and up to `limit` of its batch-mates.
    ///
    /// Returns `None` when nothing is ready. Two workers racing for the same
    /// batch receive disjoint sets.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn claim_ready(
        &self,
        worker: &WorkerId,
        limit: usize,
    ) -> Result<Option<ClaimedBatch>, DispatchError> {
        let now = self.clock.now();
        let Some(primary) = self
            .store
            .claim_next(worker, &self.ready_filter(), now)
            .await?
        else {
            return Ok(None);
        };

        let siblings = self.batchable_messages(&primary, worker, limit).await?;
        dispatch!(
            level = DEBUG,
            %worker,
            "Claimed {} with {} sibling(s)",
            primary.id,
            siblings.len()
        );

        Ok(Some(ClaimedBatch { primary, siblings }))
    }

    /// Locks and returns ready messages that can share `primary`'s delivery:
    /// same batch key, same address, not locked by anyone, not backing off.
    ///
    /// `primary` itself is never included.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::PrimaryNotLocked`] unless `worker` holds the
    /// primary's lock. This is a caller bug, not a race.
    pub async fn batchable_messages(
        &self,
        primary: &QueuedMessage,
        worker: &WorkerId,
        limit: usize,
    ) -> Result<Vec<QueuedMessage>, DispatchError> {
        if !primary.is_locked_by(worker) {
            return Err(DispatchError::PrimaryNotLocked(primary.id));
        }

        if primary.batch_key.is_none() || limit == 0 {
            return Ok(Vec::new());
        }

        match self
            .store
            .claim_siblings(primary.id, worker, limit, self.clock.now())
            .await
        {
            Ok(siblings) => Ok(siblings),
            Err(StoreError::LockNotHeld { id, .. }) => Err(DispatchError::PrimaryNotLocked(id)),
            Err(err) => Err(err.into()),
        }
    }

    fn holder(message: &QueuedMessage) -> Result<&WorkerId, DispatchError> {
        message
            .locked_by()
            .ok_or(DispatchError::NotLocked(message.id))
    }

    /// Removes a delivered message from the queue.
    ///
    /// # Errors
    ///
    /// Fails if the message is not locked, or its lock changed hands.
    pub async fn mark_delivered(&self, message: &QueuedMessage) -> Result<(), DispatchError> {
        let worker = Self::holder(message)?;
        self.store
            .complete(message.id, worker, Completion::Delivered, self.clock.now())
            .await?;

        dispatch!(level = DEBUG, %worker, "Delivered {}", message.id);
        Ok(())
    }

    /// Releases a message for another attempt after `delay`.
    ///
    /// # Errors
    ///
    /// Fails if the message is not locked, or its lock changed hands.
    pub async fn schedule_retry(
        &self,
        message: &QueuedMessage,
        delay: Duration,
    ) -> Result<QueuedMessage, DispatchError> {
        let retry_after = TimeDelta::from_std(delay)
            .ok()
            .and_then(|delay| self.clock.now().checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.release(message, retry_after, None).await
    }

    async fn release(
        &self,
        message: &QueuedMessage,
        retry_after: DateTime<Utc>,
        last_error: Option<String>,
    ) -> Result<QueuedMessage, DispatchError> {
        let worker = Self::holder(message)?;
        let now = self.clock.now();

        let released = self
            .store
            .release_for_retry(message.id, worker, retry_after, last_error, now)
            .await?;

        dispatch!(
            level = DEBUG,
            %worker,
            "Retrying {} after {retry_after} (attempt {})",
            released.id,
            released.attempts
        );
        Ok(released)
    }

    /// Settles a failed attempt.
    ///
    /// Temporary failures are retried with exponential backoff until the
    /// retry policy runs out of attempts. Permanent failures, and temporary
    /// ones past the last attempt, abandon the message.
    ///
    /// # Errors
    ///
    /// Fails if the message is not locked, or its lock changed hands.
    pub async fn fail_attempt(
        &self,
        message: &QueuedMessage,
        error: &DeliveryError,
    ) -> Result<AttemptOutcome, DispatchError> {
        let attempts = message.attempts.saturating_add(1);

        if error.is_temporary() && self.config.retry.should_retry(attempts) {
            let retry_after = self.config.retry.next_retry_at(self.clock.now(), attempts);
            let released = self
                .release(message, retry_after, Some(error.to_string()))
                .await?;
            return Ok(AttemptOutcome::Retrying(released));
        }

        let reason = if error.is_temporary() {
            format!("Gave up after {attempts} attempts: {error}")
        } else {
            error.to_string()
        };
        let abandoned = self.abandon(message, &reason).await?;
        Ok(AttemptOutcome::Abandoned(abandoned))
    }

    /// Removes a message that will never be delivered, bouncing it if the
    /// payload asked for bounces.
    ///
    /// # Errors
    ///
    /// Fails if the message is not locked, or its lock changed hands.
    pub async fn abandon(
        &self,
        message: &QueuedMessage,
        reason: &str,
    ) -> Result<QueuedMessage, DispatchError> {
        let worker = Self::holder(message)?;
        let removed = self
            .store
            .complete(message.id, worker, Completion::Abandoned, self.clock.now())
            .await?;

        dispatch!(level = INFO, %worker, "Abandoned {}: {reason}", removed.id);

        if removed.send_bounces
            && let Some(bounces) = &self.bounces
        {
            bounces.bounce(&removed, reason).await;
        }

        Ok(removed)
    }

    /// Makes a message ready immediately, whatever its backoff.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::NotFound`] for an unknown id.
    pub async fn force_retry_now(
        &self,
        id: QueuedMessageId,
    ) -> Result<QueuedMessage, DispatchError> {
        let message = self
            .store
            .clear_retry(id, self.clock.now())
            .await
            .map_err(|err| match err {
                StoreError::NotFound(id) => DispatchError::NotFound(id),
                err => err.into(),
            })?;

        internal!(level = INFO, "Forced retry of {id}");
        Ok(message)
    }

    /// Deletes a message that no worker holds.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::MessageLocked`] while a worker holds it; the
    /// message stays queued.
    pub async fn remove_unlocked(
        &self,
        id: QueuedMessageId,
    ) -> Result<QueuedMessage, DispatchError> {
        let removed = self
            .store
            .remove_unlocked(id)
            .await
            .map_err(|err| match err {
                StoreError::Locked(id) => DispatchError::MessageLocked(id),
                StoreError::NotFound(id) => DispatchError::NotFound(id),
                err => err.into(),
            })?;

        internal!(level = INFO, "Removed {id} from the queue");
        Ok(removed)
    }

    /// Frees messages whose lock is older than `threshold`, returning them
    /// to the ready set.
    ///
    /// A threshold reaching back past the earliest representable time
    /// releases nothing.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] for a non-positive
    /// threshold, which would release live claims.
    pub async fn recover_stale_locks(
        &self,
        threshold: TimeDelta,
    ) -> Result<Vec<QueuedMessageId>, DispatchError> {
        if threshold <= TimeDelta::zero() {
            return Err(DispatchError::Configuration(format!(
                "stale lock threshold must be positive, got {threshold}"
            )));
        }

        let now = self.clock.now();
        let Some(locked_before) = now.checked_sub_signed(threshold) else {
            debug!("Stale lock threshold {threshold} reaches past the earliest time, nothing to recover");
            return Ok(Vec::new());
        };
        let released = self.store.release_stale(locked_before, now).await?;

        if released.is_empty() {
            debug!("No stale locks found");
        } else {
            info!("Recovered {} stale lock(s)", released.len());
        }

        Ok(released)
    }

    /// Deletes every unlocked message queued for a server.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn purge_server_queue(&self, server: ServerId) -> Result<usize, DispatchError> {
        let purged = self.store.purge_server(server).await?;
        internal!(level = INFO, "Purged {purged} message(s) queued for {server}");
        Ok(purged)
    }

    /// Deletes an address, first detaching it from queued messages and
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::IpError::StillPooled`] while any pool lists
    /// the address.
    pub async fn retire_ip_address(&self, ip: IpAddressId) -> Result<IpAddress, DispatchError> {
        {
            let registry = self.registry.read();
            if registry.address(ip).is_none() {
                return Err(crate::error::IpError::UnknownAddress(ip).into());
            }
            let pools = registry.pools_for_address(ip).len();
            if pools > 0 {
                return Err(crate::error::IpError::StillPooled(ip, pools).into());
            }
        }

        let detached = self.store.detach_ip(ip, self.clock.now()).await?;
        let unmapped = self.mappings.write().remove_address(ip);
        let address = self.registry.write().remove_address(ip)?;

        internal!(
            level = INFO,
            "Retired {} ({detached} queued message(s) detached, {unmapped} override(s) removed)",
            address.ipv4
        );
        Ok(address)
    }

    /// The least-used of `pools`, rotating among the `top_n` idlest.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::BalanceError::NoValidPools`] if none of the
    /// pools has an address.
    pub async fn least_used_pool(
        &self,
        pools: &[IpPoolId],
        top_n: usize,
        window: UsageWindow,
    ) -> Result<IpPool, DispatchError> {
        let candidates = self.registry.read().pool_candidates(pools);
        Ok(self
            .balancer
            .least_used_pool(&candidates, top_n, window)
            .await?)
    }

    /// [`Dispatcher::least_used_pool`] over an organization's pools.
    ///
    /// # Errors
    ///
    /// Returns an error if the organization has no pool with an address.
    pub async fn least_used_pool_for_organization(
        &self,
        organization: OrganizationId,
        top_n: usize,
        window: UsageWindow,
    ) -> Result<IpPool, DispatchError> {
        let pools = self.registry.read().organization_pools(organization);
        self.least_used_pool(&pools, top_n, window).await
    }

    /// Chooses the pool for a server being created in `organization`.
    ///
    /// # Errors
    ///
    /// Returns an error if usage statistics are unavailable.
    pub async fn assign_pool_for_new_server(
        &self,
        organization: OrganizationId,
        request: &PoolAssignmentRequest,
    ) -> Result<Option<IpPoolId>, DispatchError> {
        let candidates = {
            let registry = self.registry.read();
            registry.pool_candidates(&registry.organization_pools(organization))
        };

        let assigned = self.balancer.assign_pool(request, &candidates).await?;
        if let Some(pool) = assigned {
            internal!(level = INFO, "Assigned {pool} to new server in {organization}");
        }
        Ok(assigned)
    }

    /// Queue counters, optionally for a single server.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn stats(&self, server: Option<ServerId>) -> Result<QueueStats, DispatchError> {
        let filter = ReadyFilter {
            server,
            ..self.ready_filter()
        };
        Ok(self.store.stats(&filter, self.clock.now()).await?)
    }
}
