//! Request flags, grant policies and priorities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

/// Flags steering how an incoming request may be satisfied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IncomingFlags(u32);

impl IncomingFlags {
    /// No flags: only local rights, conflicts with held rights are shared
    pub const NONE: Self = Self(0);
    /// Missing rights may be borrowed from the creditor
    pub const MAY_BORROW: Self = Self(1 << 0);
    /// Sublet rights may be revoked from debtors
    pub const MAY_REVOKE: Self = Self(1 << 1);
    /// Wait for conflicting held rights to be released
    pub const LOCAL_WAIT: Self = Self(1 << 2);
    /// Fail instead of waiting for conflicting held rights
    pub const LOCAL_TRY: Self = Self(1 << 3);

    /// Raw bit representation
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Build from raw bits, dropping unknown ones
    pub fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & 0b1111)
    }

    /// True when every flag of `other` is set
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Flags with those of `other` cleared
    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for IncomingFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for IncomingFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::MAY_BORROW, "MAY_BORROW"),
            (Self::MAY_REVOKE, "MAY_REVOKE"),
            (Self::LOCAL_WAIT, "LOCAL_WAIT"),
            (Self::LOCAL_TRY, "LOCAL_TRY"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            f.write_str("NONE")
        } else {
            f.write_str(&set.join("|"))
        }
    }
}

/// Decides which right is granted once a request can be satisfied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Policy {
    /// Pin the covering rights as they are
    #[default]
    Inplace,
    /// Carve exactly the wanted right out of the covering rights
    Strict,
    /// Merge the covering rights into one
    Join,
    /// Grant every cached right that does not conflict with held rights
    Max,
    /// Resource-type specific policy, resolved by `ResourceType::apply_policy`
    Custom(u32),
}

/// Scheduling priority of an incoming request, higher is served first
pub type Priority = u8;

/// Kind of pin graph edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PinFlag {
    /// Wake the request when the pinned object changes
    Track,
    /// Keep a held right from being taken away
    Protect,
    /// Refuse new protecting pins on the right
    Barrier,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_ops() {
        let flags = IncomingFlags::MAY_BORROW | IncomingFlags::LOCAL_WAIT;
        assert!(flags.contains(IncomingFlags::MAY_BORROW));
        assert!(!flags.contains(IncomingFlags::MAY_REVOKE));
        assert_eq!(
            flags.without(IncomingFlags::MAY_BORROW),
            IncomingFlags::LOCAL_WAIT
        );
        assert_eq!(flags.to_string(), "MAY_BORROW|LOCAL_WAIT");
        assert_eq!(IncomingFlags::NONE.to_string(), "NONE");
    }

    #[test]
    fn test_truncate_unknown_bits() {
        let flags = IncomingFlags::from_bits_truncate(0xff);
        assert_eq!(flags.bits(), 0b1111);
    }
}
