//! Identifier types used across the resource manager
//!
//! Cookies name owners and loans across the network. A remote party only
//! ever sends back a cookie, which the receiver resolves through its own
//! tables. Local ids name entries in an owner's arenas and never leave the
//! process.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Network-visible name of an owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerCookie(pub Uuid);

impl OwnerCookie {
    /// Create a new random owner cookie
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID
    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OwnerCookie {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OwnerCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner-{}", self.0)
    }
}

impl From<Uuid> for OwnerCookie {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Network-visible name of a loan, shared by creditor and debtor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LoanCookie(pub Uuid);

impl LoanCookie {
    /// Create a new random loan cookie
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID
    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for LoanCookie {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LoanCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loan-{}", self.0)
    }
}

impl From<Uuid> for LoanCookie {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Registered resource type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceTypeId(pub u64);

impl fmt::Display for ResourceTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rtype-{}", self.0)
    }
}

/// Credit group of cooperating debtors.
///
/// Debtors borrowing under the same group may all hold a right their
/// creditor lent once; `GroupId::NONE` marks an ordinary loan.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct GroupId(pub u64);

impl GroupId {
    /// No group: the loan is exclusive to its debtor
    pub const NONE: Self = Self(0);

    /// True for `GroupId::NONE`
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group-{}", self.0)
    }
}

/// Service location of a resource domain
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint(pub String);

impl Endpoint {
    /// Create an endpoint from an address string
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Address string of the endpoint
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Endpoint {
    fn from(address: &str) -> Self {
        Self(address.to_string())
    }
}

macro_rules! local_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

local_id!(
    /// Owner slot inside a resource type group
    OwnerId,
    "owner"
);
local_id!(
    /// Incoming request of an owner
    IncomingId,
    "in"
);
local_id!(
    /// Outgoing request of an owner
    OutgoingId,
    "out"
);
local_id!(
    /// Right entry on an owner's owned lists
    RightId,
    "right"
);
local_id!(
    /// Loan entry on an owner's borrowed or sublet list
    LoanId,
    "loan"
);
local_id!(
    /// Edge of the pin graph
    PinId,
    "pin"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookies_are_unique() {
        assert_ne!(OwnerCookie::new(), OwnerCookie::new());
        assert_ne!(LoanCookie::new(), LoanCookie::new());
    }

    #[test]
    fn test_display() {
        assert_eq!(IncomingId(7).to_string(), "in#7");
        assert_eq!(Endpoint::from("s3").to_string(), "s3");
        assert!(OwnerCookie::new().to_string().starts_with("owner-"));
    }
}
