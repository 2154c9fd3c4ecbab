//! Queue dispatch and IP allocation
//!
//! This crate decides, for every message headed out of the platform:
//! - Which egress IP address sends it (sender overrides first, then a
//!   priority-weighted draw from the server's pool)
//! - Which other messages it can share an SMTP session with (MX-aware
//!   batch keys)
//! - Which worker delivers it, under an exclusive claim that concurrent
//!   workers skip rather than wait on
//! - When it is retried, abandoned, or recovered from a dead worker
//!
//! It also balances new servers across the least-used IP pools.

pub mod balancer;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod ids;
pub mod ip;
pub mod mx;
pub mod policy;
pub mod queue;
pub mod worker;

pub use balancer::{
    BalancerConfig, PoolAssignmentRequest, PoolBalancer, PoolUsage, UsageRange, UsageSource,
    UsageWindow,
};
pub use config::DispatchConfig;
pub use dispatcher::{AttemptOutcome, BounceSink, ClaimedBatch, Dispatcher, DispatcherBuilder};
pub use error::{BalanceError, DeliveryError, DispatchError, IpError, MappingError, StoreError};
pub use ids::{
    IpAddressId, IpPoolId, MessageId, OrganizationId, QueuedMessageId, RouteId, ServerId, WorkerId,
};
pub use ip::{EmailIpMappings, IpAddress, IpPool, IpRegistry, NewIpAddress, PoolCandidate};
pub use mx::{BatchScope, DnsConfig, DnsError, HickoryMxLookup, MxBatchKeyResolver, MxLookup, MxRecord};
pub use policy::{PoolResolver, PoolRule, RetryPolicy, ServerPoolRules, ServerPools};
pub use queue::{
    Direction, Endpoint, Lock, MemoryQueueStore, NewQueuedMessage, QueueStats, QueueStore,
    QueuedMessage, ReadyFilter,
};
pub use worker::{Deliverer, DeliveryReport, DispatchWorker, TickSummary, WorkerConfig};
