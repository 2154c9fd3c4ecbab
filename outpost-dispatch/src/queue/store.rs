use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Allocation, Completion, NewQueuedMessage, QueueStats, QueuedMessage, ReadyFilter};
use crate::{
    error::StoreError,
    ids::{IpAddressId, QueuedMessageId, ServerId, WorkerId},
};

/// Persistence for the delivery queue.
///
/// Every method is one atomic transaction. The claim methods select and
/// mark rows in the same step, skipping rows another worker already holds,
/// so concurrent workers always walk away with disjoint sets and never wait
/// on each other. Updates that finish a claim compare on the lock holder
/// and fail with [`StoreError::LockNotHeld`] if it changed.
#[async_trait]
pub trait QueueStore: Send + Sync + Debug {
    /// Inserts a new row and assigns its id.
    async fn insert(
        &self,
        new: NewQueuedMessage,
        allocation: Allocation,
        now: DateTime<Utc>,
    ) -> Result<QueuedMessage, StoreError>;

    async fn get(&self, id: QueuedMessageId) -> Result<Option<QueuedMessage>, StoreError>;

    /// All rows, optionally for one server, in dispatch order.
    async fn list(&self, server: Option<ServerId>) -> Result<Vec<QueuedMessage>, StoreError>;

    /// Locks the first ready row in dispatch order (priority descending,
    /// then oldest first).
    async fn claim_next(
        &self,
        worker: &WorkerId,
        filter: &ReadyFilter,
        now: DateTime<Utc>,
    ) -> Result<Option<QueuedMessage>, StoreError>;

    /// Locks up to `limit` ready rows sharing the primary's batch key and IP
    /// address, stamping them with the primary's lock.
    ///
    /// Fails with [`StoreError::LockNotHeld`] unless `worker` holds the
    /// primary.
    async fn claim_siblings(
        &self,
        primary: QueuedMessageId,
        worker: &WorkerId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueuedMessage>, StoreError>;

    /// Deletes a row held by `worker`.
    async fn complete(
        &self,
        id: QueuedMessageId,
        worker: &WorkerId,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> Result<QueuedMessage, StoreError>;

    /// Releases a row held by `worker`, bumps `attempts` and gates it until
    /// `retry_after`.
    async fn release_for_retry(
        &self,
        id: QueuedMessageId,
        worker: &WorkerId,
        retry_after: DateTime<Utc>,
        last_error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<QueuedMessage, StoreError>;

    /// Clears `retry_after` and marks the row manual, whatever its backoff.
    async fn clear_retry(
        &self,
        id: QueuedMessageId,
        now: DateTime<Utc>,
    ) -> Result<QueuedMessage, StoreError>;

    /// Deletes a row only if nobody holds it.
    ///
    /// Fails with [`StoreError::Locked`] otherwise.
    async fn remove_unlocked(&self, id: QueuedMessageId) -> Result<QueuedMessage, StoreError>;

    /// Clears every lock taken before `locked_before`.
    async fn release_stale(
        &self,
        locked_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueuedMessageId>, StoreError>;

    /// Deletes every unlocked row for a server.
    async fn purge_server(&self, server: ServerId) -> Result<usize, StoreError>;

    /// Nulls the IP address on every row that references it.
    async fn detach_ip(&self, ip: IpAddressId, now: DateTime<Utc>) -> Result<usize, StoreError>;

    async fn stats(&self, filter: &ReadyFilter, now: DateTime<Utc>)
    -> Result<QueueStats, StoreError>;
}
