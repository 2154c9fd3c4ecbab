use std::{cmp::Reverse, collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, Utc};
use parking_lot::Mutex;

use super::{
    Allocation, Completion, Lock, NewQueuedMessage, QueueStats, QueuedMessage, ReadyFilter,
    store::QueueStore,
};
use crate::{
    balancer::{LONGEST_WINDOW_DAYS, UsageRange, UsageSource},
    error::{BalanceError, StoreError},
    ids::{IpAddressId, QueuedMessageId, ServerId, WorkerId},
};

/// In-memory queue store
///
/// Rows live in a `BTreeMap` behind a single mutex. Each trait method takes
/// the mutex once, so selecting rows and stamping their lock happen in one
/// critical section; a concurrent claim simply never sees rows that are
/// already locked. This gives the same disjoint-claim guarantee as
/// `SELECT ... FOR UPDATE SKIP LOCKED` without any waiting.
///
/// Delivered messages are tallied per address per UTC day so pool usage
/// survives the row being deleted. Days more than [`LONGEST_WINDOW_DAYS`]
/// behind the newest tally are dropped, so all-time usage only reaches back
/// that far.
///
/// Primarily intended for tests and single-process deployments.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueueStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    rows: BTreeMap<QueuedMessageId, QueuedMessage>,
    delivered: BTreeMap<(IpAddressId, NaiveDate), u64>,
    next_id: u64,
}

/// Dispatch order: priority descending, then oldest first.
fn dispatch_order(message: &QueuedMessage) -> (Reverse<i32>, DateTime<Utc>, QueuedMessageId) {
    (Reverse(message.priority), message.created_at, message.id)
}

impl Inner {
    fn tally(&mut self, ip: IpAddressId, at: DateTime<Utc>, count: u64) {
        let day = at.date_naive();
        let newest_day = self.delivered.keys().all(|(_, known)| *known < day);
        *self.delivered.entry((ip, day)).or_default() += count;

        if newest_day
            && let Some(cutoff) = day.checked_sub_days(Days::new(LONGEST_WINDOW_DAYS))
        {
            self.delivered.retain(|(_, known), _| *known >= cutoff);
        }
    }

    fn held_by(&mut self, id: QueuedMessageId, worker: &WorkerId) -> Result<&mut QueuedMessage, StoreError> {
        let row = self.rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if row.is_locked_by(worker) {
            Ok(row)
        } else {
            Err(StoreError::LockNotHeld {
                id,
                worker: worker.clone(),
            })
        }
    }
}

impl MemoryQueueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records a delivery made outside this store, such as history
    /// imported at startup.
    pub fn record_delivery(&self, ip: IpAddressId, at: DateTime<Utc>, count: u64) {
        self.inner.lock().tally(ip, at, count);
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn insert(
        &self,
        new: NewQueuedMessage,
        allocation: Allocation,
        now: DateTime<Utc>,
    ) -> Result<QueuedMessage, StoreError> {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = QueuedMessageId(inner.next_id);

        let row = QueuedMessage::from_new(id, new, allocation, now);
        inner.rows.insert(id, row.clone());
        Ok(row)
    }

    async fn get(&self, id: QueuedMessageId) -> Result<Option<QueuedMessage>, StoreError> {
        Ok(self.inner.lock().rows.get(&id).cloned())
    }

    async fn list(&self, server: Option<ServerId>) -> Result<Vec<QueuedMessage>, StoreError> {
        let inner = self.inner.lock();
        let mut rows: Vec<_> = inner
            .rows
            .values()
            .filter(|row| server.is_none_or(|server| row.server == server))
            .cloned()
            .collect();
        rows.sort_by_key(dispatch_order);
        Ok(rows)
    }

    async fn claim_next(
        &self,
        worker: &WorkerId,
        filter: &ReadyFilter,
        now: DateTime<Utc>,
    ) -> Result<Option<QueuedMessage>, StoreError> {
        let mut inner = self.inner.lock();

        let next = inner
            .rows
            .values()
            .filter(|row| filter.matches(row, now))
            .min_by_key(|row| dispatch_order(row))
            .map(|row| row.id);

        Ok(next.and_then(|id| {
            inner.rows.get_mut(&id).map(|row| {
                row.lock = Some(Lock {
                    locked_by: worker.clone(),
                    locked_at: now,
                });
                row.updated_at = now;
                row.clone()
            })
        }))
    }

    async fn claim_siblings(
        &self,
        primary: QueuedMessageId,
        worker: &WorkerId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueuedMessage>, StoreError> {
        let mut inner = self.inner.lock();
        let primary = inner.held_by(primary, worker)?.clone();
        let Some(lock) = primary.lock.clone() else {
            return Err(StoreError::LockNotHeld {
                id: primary.id,
                worker: worker.clone(),
            });
        };

        let mut siblings: Vec<_> = inner
            .rows
            .values()
            .filter(|row| row.is_sibling_of(&primary, now))
            .map(|row| (dispatch_order(row), row.id))
            .collect();
        siblings.sort();

        let mut claimed = Vec::with_capacity(limit.min(siblings.len()));
        for (_, id) in siblings.into_iter().take(limit) {
            if let Some(row) = inner.rows.get_mut(&id) {
                row.lock = Some(lock.clone());
                row.updated_at = now;
                claimed.push(row.clone());
            }
        }

        Ok(claimed)
    }

    async fn complete(
        &self,
        id: QueuedMessageId,
        worker: &WorkerId,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> Result<QueuedMessage, StoreError> {
        let mut inner = self.inner.lock();
        inner.held_by(id, worker)?;

        let row = inner.rows.remove(&id).ok_or(StoreError::NotFound(id))?;
        if completion == Completion::Delivered
            && let Some(ip) = row.ip_address
        {
            inner.tally(ip, now, 1);
        }

        Ok(row)
    }

    async fn release_for_retry(
        &self,
        id: QueuedMessageId,
        worker: &WorkerId,
        retry_after: DateTime<Utc>,
        last_error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<QueuedMessage, StoreError> {
        let mut inner = self.inner.lock();
        let row = inner.held_by(id, worker)?;

        row.lock = None;
        row.attempts = row.attempts.saturating_add(1);
        row.retry_after = Some(retry_after);
        row.manual = false;
        if last_error.is_some() {
            row.last_error = last_error;
        }
        row.updated_at = now;

        Ok(row.clone())
    }

    async fn clear_retry(
        &self,
        id: QueuedMessageId,
        now: DateTime<Utc>,
    ) -> Result<QueuedMessage, StoreError> {
        let mut inner = self.inner.lock();
        let row = inner.rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        row.retry_after = None;
        row.manual = true;
        row.updated_at = now;

        Ok(row.clone())
    }

    async fn remove_unlocked(&self, id: QueuedMessageId) -> Result<QueuedMessage, StoreError> {
        let mut inner = self.inner.lock();
        let row = inner.rows.get(&id).ok_or(StoreError::NotFound(id))?;

        if row.is_locked() {
            return Err(StoreError::Locked(id));
        }

        inner.rows.remove(&id).ok_or(StoreError::NotFound(id))
    }

    async fn release_stale(
        &self,
        locked_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueuedMessageId>, StoreError> {
        let mut inner = self.inner.lock();
        let mut released = Vec::new();

        for row in inner.rows.values_mut() {
            if row
                .lock
                .as_ref()
                .is_some_and(|lock| lock.locked_at < locked_before)
            {
                row.lock = None;
                row.updated_at = now;
                released.push(row.id);
            }
        }

        Ok(released)
    }

    async fn purge_server(&self, server: ServerId) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        let before = inner.rows.len();
        inner
            .rows
            .retain(|_, row| row.server != server || row.is_locked());
        Ok(before - inner.rows.len())
    }

    async fn detach_ip(&self, ip: IpAddressId, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        let mut detached = 0;

        for row in inner
            .rows
            .values_mut()
            .filter(|row| row.ip_address == Some(ip))
        {
            row.ip_address = None;
            row.updated_at = now;
            detached += 1;
        }

        Ok(detached)
    }

    async fn stats(
        &self,
        filter: &ReadyFilter,
        now: DateTime<Utc>,
    ) -> Result<QueueStats, StoreError> {
        let inner = self.inner.lock();
        let mut stats = QueueStats::default();

        for row in inner
            .rows
            .values()
            .filter(|row| filter.server.is_none_or(|server| row.server == server))
        {
            stats.total += 1;
            if row.is_locked() {
                stats.locked += 1;
            } else if row.is_backing_off(now) {
                stats.backing_off += 1;
            }
            if filter.matches(row, now) {
                stats.ready += 1;
            }
        }

        Ok(stats)
    }
}

#[async_trait]
impl UsageSource for MemoryQueueStore {
    async fn messages_through(
        &self,
        ips: &[IpAddressId],
        range: UsageRange,
    ) -> Result<u64, BalanceError> {
        let inner = self.inner.lock();

        let queued = inner
            .rows
            .values()
            .filter(|row| row.ip_address.is_some_and(|ip| ips.contains(&ip)))
            .filter(|row| range.contains(row.created_at))
            .count() as u64;

        let first_day = range.since.map(|since| since.date_naive());
        let delivered: u64 = inner
            .delivered
            .iter()
            .filter(|((ip, day), _)| {
                ips.contains(ip)
                    && first_day.is_none_or(|first| *day >= first)
                    && range.until.is_none_or(|until| {
                        day.and_hms_opt(0, 0, 0)
                            .is_some_and(|start| start.and_utc() < until)
                    })
            })
            .map(|(_, count)| count)
            .sum();

        Ok(queued + delivered)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{ids::MessageId, queue::tests::at};

    fn new_message(id: u64, rcpt: &str) -> NewQueuedMessage {
        NewQueuedMessage::outgoing(ServerId(1), MessageId(id), "sender@example.com", rcpt)
    }

    /// Locks one row directly, whatever the dispatch order.
    fn lock_row(
        store: &MemoryQueueStore,
        id: QueuedMessageId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> QueuedMessage {
        let mut inner = store.inner.lock();
        let row = inner.rows.get_mut(&id).unwrap();
        row.lock = Some(Lock {
            locked_by: worker.clone(),
            locked_at: now,
        });
        row.updated_at = now;
        row.clone()
    }

    fn keyed(key: &str, ip: u64) -> Allocation {
        Allocation {
            ip_address: Some(IpAddressId(ip)),
            batch_key: Some(key.to_string()),
        }
    }

    #[tokio::test]
    async fn test_claim_order_priority_then_age() {
        let store = MemoryQueueStore::new();
        let low = store
            .insert(new_message(1, "a@x.com"), Allocation::default(), at(0))
            .await
            .unwrap();
        let high_new = store
            .insert(new_message(2, "b@x.com").with_priority(5), Allocation::default(), at(2))
            .await
            .unwrap();
        let high_old = store
            .insert(new_message(3, "c@x.com").with_priority(5), Allocation::default(), at(1))
            .await
            .unwrap();

        let worker = WorkerId::new("w1");
        let filter = ReadyFilter::default();
        let mut order = Vec::new();
        while let Some(row) = store.claim_next(&worker, &filter, at(10)).await.unwrap() {
            order.push(row.id);
        }

        assert_eq!(order, vec![high_old.id, high_new.id, low.id]);
    }

    #[tokio::test]
    async fn test_siblings_require_held_primary() {
        let store = MemoryQueueStore::new();
        let primary = store
            .insert(new_message(1, "a@x.com"), keyed("outgoing-k", 1), at(0))
            .await
            .unwrap();
        let sibling = store
            .insert(new_message(2, "b@x.com"), keyed("outgoing-k", 1), at(0))
            .await
            .unwrap();

        let worker = WorkerId::new("w1");
        let result = store.claim_siblings(primary.id, &worker, 10, at(1)).await;
        assert!(matches!(result, Err(StoreError::LockNotHeld { .. })));

        lock_row(&store, primary.id, &worker, at(1));
        let other = WorkerId::new("w2");
        let result = store.claim_siblings(primary.id, &other, 10, at(1)).await;
        assert!(matches!(result, Err(StoreError::LockNotHeld { .. })));

        let claimed = store.claim_siblings(primary.id, &worker, 10, at(1)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, sibling.id);
        assert_eq!(claimed[0].lock, store.get(primary.id).await.unwrap().unwrap().lock);
    }

    #[tokio::test]
    async fn test_siblings_respect_limit_ip_and_backoff() {
        let store = MemoryQueueStore::new();
        let worker = WorkerId::new("w1");
        let primary = store
            .insert(new_message(1, "a@x.com"), keyed("k", 1), at(0))
            .await
            .unwrap();
        for id in 2..=5 {
            store
                .insert(new_message(id, "b@x.com"), keyed("k", 1), at(0))
                .await
                .unwrap();
        }
        store
            .insert(new_message(6, "c@x.com"), keyed("k", 2), at(0))
            .await
            .unwrap();

        // Put one sibling into backoff
        let backing_off = lock_row(&store, QueuedMessageId(5), &worker, at(0));
        store
            .release_for_retry(backing_off.id, &worker, at(100), None, at(0))
            .await
            .unwrap();

        lock_row(&store, primary.id, &worker, at(1));
        let first = store.claim_siblings(primary.id, &worker, 2, at(1)).await.unwrap();
        let second = store.claim_siblings(primary.id, &worker, 10, at(1)).await.unwrap();

        let ids = |rows: &[QueuedMessage]| rows.iter().map(|row| row.id.get()).collect::<Vec<_>>();
        assert_eq!(ids(&first), vec![2, 3]);
        assert_eq!(ids(&second), vec![4]);
    }

    #[tokio::test]
    async fn test_retry_and_force() {
        let store = MemoryQueueStore::new();
        let worker = WorkerId::new("w1");
        let row = store
            .insert(new_message(1, "a@x.com"), Allocation::default(), at(0))
            .await
            .unwrap();
        lock_row(&store, row.id, &worker, at(0));

        let retried = store
            .release_for_retry(row.id, &worker, at(300), Some("421".into()), at(1))
            .await
            .unwrap();
        assert_eq!(retried.attempts, 1);
        assert!(!retried.is_locked());
        assert_eq!(retried.last_error.as_deref(), Some("421"));
        assert!(store.claim_next(&worker, &ReadyFilter::default(), at(2)).await.unwrap().is_none());

        let forced = store.clear_retry(row.id, at(3)).await.unwrap();
        assert!(forced.manual);
        assert_eq!(forced.retry_after, None);
        assert_eq!(forced.attempts, 1);
        assert!(store.claim_next(&worker, &ReadyFilter::default(), at(3)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_remove_unlocked_refuses_locked_rows() {
        let store = MemoryQueueStore::new();
        let worker = WorkerId::new("w1");
        let row = store
            .insert(new_message(1, "a@x.com"), Allocation::default(), at(0))
            .await
            .unwrap();
        lock_row(&store, row.id, &worker, at(0));

        assert!(matches!(
            store.remove_unlocked(row.id).await,
            Err(StoreError::Locked(_))
        ));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_release_stale_and_purge() {
        let store = MemoryQueueStore::new();
        let worker = WorkerId::new("w1");
        let old = store
            .insert(new_message(1, "a@x.com"), Allocation::default(), at(0))
            .await
            .unwrap();
        let fresh = store
            .insert(new_message(2, "b@x.com"), Allocation::default(), at(0))
            .await
            .unwrap();
        store
            .insert(new_message(3, "c@x.com"), Allocation::default(), at(0))
            .await
            .unwrap();
        lock_row(&store, old.id, &worker, at(0));
        lock_row(&store, fresh.id, &worker, at(1000));

        let released = store.release_stale(at(500), at(1001)).await.unwrap();
        assert_eq!(released, vec![old.id]);

        // The fresh lock survives a purge, the other two go
        assert_eq!(store.purge_server(ServerId(1)).await.unwrap(), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.purge_server(ServerId(2)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_usage_counts_queued_and_delivered() {
        let store = MemoryQueueStore::new();
        let worker = WorkerId::new("w1");
        for id in 1..=3 {
            store
                .insert(new_message(id, "a@x.com"), keyed("k", 1), at(0))
                .await
                .unwrap();
        }
        store
            .insert(new_message(4, "a@x.com"), keyed("k", 2), at(0))
            .await
            .unwrap();

        let row = lock_row(&store, QueuedMessageId(1), &worker, at(0));
        store
            .complete(row.id, &worker, Completion::Delivered, at(0))
            .await
            .unwrap();

        let all = UsageRange::default();
        assert_eq!(store.messages_through(&[IpAddressId(1)], all).await, Ok(3));
        assert_eq!(
            store
                .messages_through(&[IpAddressId(1), IpAddressId(2)], all)
                .await,
            Ok(4)
        );

        let later = UsageRange {
            since: Some(at(0) + TimeDelta::days(2)),
            until: None,
        };
        assert_eq!(store.messages_through(&[IpAddressId(1)], later).await, Ok(0));
    }

    #[tokio::test]
    async fn test_old_delivery_tallies_are_dropped() {
        let store = MemoryQueueStore::new();
        store.record_delivery(IpAddressId(1), at(0), 5);
        store.record_delivery(IpAddressId(2), at(0) + TimeDelta::days(200), 3);

        let all = UsageRange::default();
        let both = [IpAddressId(1), IpAddressId(2)];
        assert_eq!(store.messages_through(&both, all).await, Ok(8));

        store.record_delivery(IpAddressId(2), at(0) + TimeDelta::days(400), 1);
        assert_eq!(store.messages_through(&[IpAddressId(1)], all).await, Ok(0));
        assert_eq!(store.messages_through(&both, all).await, Ok(4));

        // A late tally for an older day keeps the newer ones.
        store.record_delivery(IpAddressId(1), at(0) + TimeDelta::days(100), 2);
        assert_eq!(store.messages_through(&both, all).await, Ok(6));
        assert_eq!(store.inner.lock().delivered.len(), 3);
    }

    #[tokio::test]
    async fn test_detach_ip_and_stats() {
        let store = MemoryQueueStore::new();
        let worker = WorkerId::new("w1");
        for id in 1..=3 {
            store
                .insert(new_message(id, "a@x.com"), keyed("k", 1), at(0))
                .await
                .unwrap();
        }
        lock_row(&store, QueuedMessageId(1), &worker, at(0));
        lock_row(&store, QueuedMessageId(2), &worker, at(0));
        store
            .release_for_retry(QueuedMessageId(2), &worker, at(60), None, at(0))
            .await
            .unwrap();

        let stats = store.stats(&ReadyFilter::default(), at(1)).await.unwrap();
        assert_eq!(
            stats,
            QueueStats {
                total: 3,
                ready: 1,
                locked: 1,
                backing_off: 1,
            }
        );

        assert_eq!(store.detach_ip(IpAddressId(1), at(2)).await.unwrap(), 3);
        assert!(
            store
                .list(None)
                .await
                .unwrap()
                .iter()
                .all(|row| row.ip_address.is_none())
        );
    }
}
