//! Domain newtype for type safety
//!
//! Wraps domain strings so recipient domains, MX hosts and wildcard keys
//! cannot be confused with full mailbox addresses. Domains are stored in
//! lowercase since DNS names compare case-insensitively.

use std::{
    fmt::{self, Display},
    ops::Deref,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

/// A lowercase domain name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Domain(Arc<str>);

impl Domain {
    /// Create a new `Domain`, lowercasing and dropping any trailing root dot
    #[must_use]
    pub fn new(s: impl AsRef<str>) -> Self {
        let s = s.as_ref().trim().trim_end_matches('.');
        Self(Arc::from(s.to_ascii_lowercase()))
    }

    /// Extracts the domain part of a mailbox address (everything after the
    /// last `@`).
    ///
    /// Returns `None` when there is no `@` or nothing follows it.
    ///
    /// ```
    /// use outpost_common::Domain;
    ///
    /// let domain = Domain::from_address("User@Example.COM").unwrap();
    /// assert_eq!(domain.as_str(), "example.com");
    /// assert!(Domain::from_address("postmaster").is_none());
    /// ```
    #[must_use]
    pub fn from_address(address: &str) -> Option<Self> {
        let (_, domain) = address.trim().rsplit_once('@')?;
        let domain = Self::new(domain.trim_end_matches('>'));
        (!domain.is_empty()).then_some(domain)
    }

    /// Get the domain as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Domain {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for Domain {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<String> for Domain {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for Domain {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<Domain> for String {
    fn from(domain: Domain) -> Self {
        domain.0.to_string()
    }
}
