//! Typed error handling for dispatch operations.
//!
//! Recoverable conditions (DNS failures, missing IP pools, transient
//! delivery failures) never surface here: they are absorbed where they
//! happen and replaced by a fallback value. What remains is:
//! - Invariant violations by the caller (claiming without a lock, removing
//!   a locked message)
//! - Data integrity violations rejected at write time
//! - Failures of the backing queue store

use thiserror::Error;

use crate::ids::{IpAddressId, IpPoolId, QueuedMessageId, ServerId, WorkerId};

/// Top-level dispatch error type.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Sibling messages were requested without holding the primary's lock.
    #[error("Must lock {0} before locking any of its batch")]
    PrimaryNotLocked(QueuedMessageId),

    /// An operation that requires a held lock was given an unlocked message.
    #[error("{0} is not locked")]
    NotLocked(QueuedMessageId),

    /// The message is locked by an in-flight worker.
    #[error("{0} is locked and cannot be removed from the queue")]
    MessageLocked(QueuedMessageId),

    /// A queued message (or payload) could not be found.
    #[error("{0} not found in queue")]
    NotFound(QueuedMessageId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ip(#[from] IpError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Balance(#[from] BalanceError),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl DispatchError {
    /// Returns `true` if the caller broke the locking protocol.
    #[must_use]
    pub const fn is_lock_violation(&self) -> bool {
        matches!(
            self,
            Self::PrimaryNotLocked(_)
                | Self::NotLocked(_)
                | Self::MessageLocked(_)
                | Self::Store(StoreError::LockNotHeld { .. } | StoreError::Locked(_))
        )
    }
}

/// Errors raised by a queue store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No row with this id.
    #[error("{0} not found in queue")]
    NotFound(QueuedMessageId),

    /// The row is locked, so an operation reserved for unlocked rows was
    /// refused.
    #[error("{0} is locked")]
    Locked(QueuedMessageId),

    /// A compare-on-lock update found another (or no) lock holder.
    #[error("{id} is not locked by {worker}")]
    LockNotHeld {
        id: QueuedMessageId,
        worker: WorkerId,
    },

    /// The store itself failed (connection, I/O, serialization).
    #[error("Queue store error: {0}")]
    Backend(String),
}

/// Validation failures in the IP resource model.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IpError {
    #[error("Invalid IPv4 address: {0}")]
    InvalidIpv4(String),

    #[error("Invalid IPv6 address: {0}")]
    InvalidIpv6(String),

    #[error("IP address already registered: {0}")]
    DuplicateAddress(String),

    #[error("Hostname must not be blank")]
    MissingHostname,

    #[error("Priority must be between 0 and 100, got {0}")]
    PriorityOutOfRange(u8),

    #[error("Pool name must not be blank")]
    MissingPoolName,

    #[error("Unknown IP address: {0}")]
    UnknownAddress(IpAddressId),

    #[error("Unknown IP pool: {0}")]
    UnknownPool(IpPoolId),

    #[error("Unknown server: {0}")]
    UnknownServer(ServerId),

    /// Addresses are only deleted once no pool references them.
    #[error("{0} still belongs to {1} pool(s)")]
    StillPooled(IpAddressId, usize),
}

/// Write-time failures for email to IP overrides.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("Email address must not be blank")]
    MissingEmail,

    #[error("A mapping for {email} already exists on {server}")]
    Duplicate { server: ServerId, email: String },

    #[error("{ip} must belong to at least one IP pool in the server's organization")]
    ForeignIpAddress { ip: IpAddressId, server: ServerId },

    #[error(transparent)]
    Ip(#[from] IpError),
}

/// Pool balancing failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BalanceError {
    /// None of the candidate pools has a member address.
    #[error("No valid pools: every candidate pool is empty")]
    NoValidPools,

    #[error("Usage statistics unavailable: {0}")]
    Usage(String),
}

/// Outcome of a single delivery attempt, reported by the delivery layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// Retried with backoff (4xx responses, connection failures).
    #[error("Temporary failure: {0}")]
    Temporary(String),

    /// Never retried (5xx responses, policy rejections).
    #[error("Permanent failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}
