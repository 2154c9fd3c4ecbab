//! Queued messages and their lifecycle
//!
//! ```text
//! created -> allocated -> ready -> locked -> delivered (deleted)
//!                           ^         |----> retry scheduled (unlocked, attempts + 1)
//!                           |_________|----> abandoned (deleted)
//! ```
//!
//! A message is ready when nobody holds its lock, its `retry_after` (if
//! any) has passed, and it is older than the configured grace window.

pub mod memory;
pub mod retry;
pub mod store;

use chrono::{DateTime, TimeDelta, Utc};
use outpost_common::Domain;
use serde::{Deserialize, Serialize};

pub use memory::MemoryQueueStore;
pub use store::QueueStore;

use crate::{
    ids::{IpAddressId, MessageId, QueuedMessageId, RouteId, ServerId, WorkerId},
    mx::BatchScope,
};

/// An exclusive claim on a queued message.
///
/// Holder and timestamp live together so a half-set lock cannot exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub locked_by: WorkerId,
    pub locked_at: DateTime<Utc>,
}

/// Where an inbound message is being handed off to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: u64,
    pub kind: String,
}

/// Which way a message is travelling, which decides how it is batched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Outgoing,
    Incoming {
        route: RouteId,
        endpoint: Endpoint,
    },
    Other,
}

/// A message accepted for delivery, before allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewQueuedMessage {
    pub server: ServerId,
    pub message: MessageId,
    /// Envelope sender, consulted by the override map
    pub mail_from: String,
    pub rcpt_to: String,
    #[serde(default)]
    pub direction: Direction,
    /// Higher is dispatched first
    #[serde(default)]
    pub priority: i32,
    /// Whether a bounce should be generated if the message is abandoned
    #[serde(default)]
    pub send_bounces: bool,
}

impl NewQueuedMessage {
    #[must_use]
    pub fn outgoing(
        server: ServerId,
        message: MessageId,
        mail_from: impl Into<String>,
        rcpt_to: impl Into<String>,
    ) -> Self {
        Self {
            server,
            message,
            mail_from: mail_from.into(),
            rcpt_to: rcpt_to.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    #[must_use]
    pub const fn with_bounces(mut self) -> Self {
        self.send_bounces = true;
        self
    }

    #[must_use]
    pub fn recipient_domain(&self) -> Option<Domain> {
        Domain::from_address(&self.rcpt_to)
    }

    /// How the batch key for this message is derived.
    #[must_use]
    pub fn batch_scope(&self) -> BatchScope {
        match &self.direction {
            Direction::Outgoing => BatchScope::Outgoing {
                recipient_domain: self.recipient_domain(),
            },
            Direction::Incoming { route, endpoint } => BatchScope::Incoming {
                route: *route,
                endpoint_id: endpoint.id,
                endpoint_type: endpoint.kind.clone(),
            },
            Direction::Other => BatchScope::Other,
        }
    }
}

/// The result of allocation, fixed at enqueue time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allocation {
    pub ip_address: Option<IpAddressId>,
    pub batch_key: Option<String>,
}

/// A row in the delivery queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: QueuedMessageId,
    pub server: ServerId,
    pub message: MessageId,
    pub mail_from: String,
    pub rcpt_to: String,
    pub direction: Direction,
    pub ip_address: Option<IpAddressId>,
    pub batch_key: Option<String>,
    pub priority: i32,
    /// Never decreases
    pub attempts: u32,
    pub lock: Option<Lock>,
    pub retry_after: Option<DateTime<Utc>>,
    /// Set when an operator forced a retry
    pub manual: bool,
    pub send_bounces: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueuedMessage {
    /// Builds the row for a freshly allocated message.
    #[must_use]
    pub fn from_new(
        id: QueuedMessageId,
        new: NewQueuedMessage,
        allocation: Allocation,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            server: new.server,
            message: new.message,
            mail_from: new.mail_from,
            rcpt_to: new.rcpt_to,
            direction: new.direction,
            ip_address: allocation.ip_address,
            batch_key: allocation.batch_key,
            priority: new.priority,
            attempts: 0,
            lock: None,
            retry_after: None,
            manual: false,
            send_bounces: new.send_bounces,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub const fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    #[must_use]
    pub fn is_locked_by(&self, worker: &WorkerId) -> bool {
        self.lock
            .as_ref()
            .is_some_and(|lock| &lock.locked_by == worker)
    }

    #[must_use]
    pub fn locked_by(&self) -> Option<&WorkerId> {
        self.lock.as_ref().map(|lock| &lock.locked_by)
    }

    /// Still waiting out a retry delay.
    #[must_use]
    pub fn is_backing_off(&self, now: DateTime<Utc>) -> bool {
        self.retry_after.is_some_and(|at| at > now)
    }

    /// Whether a worker may claim this message now. A grace window that runs
    /// past the end of time never elapses.
    #[must_use]
    pub fn is_ready(&self, now: DateTime<Utc>, grace: TimeDelta) -> bool {
        !self.is_locked()
            && !self.is_backing_off(now)
            && self
                .created_at
                .checked_add_signed(grace)
                .is_some_and(|ready_at| ready_at <= now)
    }

    /// Whether the message could join another ready message's batch.
    ///
    /// Siblings skip the grace window: the batch is already going out.
    #[must_use]
    pub fn is_sibling_of(&self, primary: &Self, now: DateTime<Utc>) -> bool {
        self.id != primary.id
            && self.batch_key.is_some()
            && self.batch_key == primary.batch_key
            && self.ip_address == primary.ip_address
            && self.is_ready(now, TimeDelta::zero())
    }

    #[must_use]
    pub fn recipient_domain(&self) -> Option<Domain> {
        Domain::from_address(&self.rcpt_to)
    }
}

/// Narrows which ready messages a claim may pick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadyFilter {
    /// Minimum age since enqueue
    pub grace: TimeDelta,
    /// Only claim messages for this server
    pub server: Option<ServerId>,
}

impl ReadyFilter {
    #[must_use]
    pub fn matches(&self, message: &QueuedMessage, now: DateTime<Utc>) -> bool {
        self.server.is_none_or(|server| server == message.server) && message.is_ready(now, self.grace)
    }
}

/// What happened to a message leaving the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Delivered,
    Abandoned,
}

/// Queue counters for the enclosing application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub ready: usize,
    pub locked: usize,
    pub backing_off: usize,
}
