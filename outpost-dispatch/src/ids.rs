//! Numeric identities for the records the engine reads and writes.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }
    };
}

numeric_id!(
    /// Row identity of a queued message
    QueuedMessageId,
    "queued"
);
numeric_id!(
    /// Identity of the underlying message payload
    MessageId,
    "message"
);
numeric_id!(ServerId, "server");
numeric_id!(OrganizationId, "organization");
numeric_id!(IpAddressId, "ip");
numeric_id!(IpPoolId, "pool");
numeric_id!(
    /// Inbound route a message matched
    RouteId,
    "route"
);

/// Identity of a worker process holding queue locks.
///
/// Two workers must never share an identity, otherwise one could release
/// the other's claims.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `hostname:pid` for the running process, with a tag to keep several
    /// workers inside one process apart.
    #[must_use]
    pub fn local(tag: &str) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Self(format!("{host}:{}:{tag}", std::process::id()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
