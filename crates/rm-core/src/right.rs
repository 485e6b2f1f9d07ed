//! Right algebra
//!
//! A right is an opaque, resource-type specific usage permission. The engine
//! never looks inside a right; it only combines rights through the
//! operations below and relies on these laws (0 is the empty right):
//!
//! - `intersects` is symmetric, `intersects(A, A)` iff `A != 0`, and
//!   nothing intersects 0.
//! - `conflicts(A, B)` implies `intersects(A, B)` and is symmetric.
//! - `diff(A, A) == 0`, `diff(A, 0) == A`, `diff(A, B)` never intersects `B`.
//! - `join` is the least upper bound; `meet(A, B) = diff(A, diff(A, B))` is
//!   commutative and idempotent, and `join(diff(A, B), meet(A, B)) == A`.
//!
//! A type that breaks these laws makes the owner books meaningless. The
//! testkit ships a law checker for use in property tests.

use crate::errors::{RmError, RmResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// Capability set every resource type's right payload implements
pub trait Right: Clone + Debug + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// The empty right
    fn empty() -> Self;

    /// True for the empty right
    fn is_empty(&self) -> bool;

    /// True when the rights share some part
    fn intersects(&self, other: &Self) -> bool;

    /// True when the rights cannot be granted to two parties at once
    fn conflicts(&self, other: &Self) -> bool;

    /// True when every part of `self` is implied by `other`
    fn is_subset(&self, other: &Self) -> bool;

    /// Least upper bound
    fn join(&self, other: &Self) -> Self;

    /// Part of `self` not intersecting `other`
    fn diff(&self, other: &Self) -> Self;

    /// Greatest lower bound
    fn meet(&self, other: &Self) -> Self {
        self.diff(&self.diff(other))
    }

    /// Serialise into the opaque byte buffer carried in messages
    fn encode(&self) -> RmResult<Vec<u8>> {
        bincode::serialize(self).map_err(RmError::from)
    }

    /// Parse a right out of a message buffer
    fn decode(bytes: &[u8]) -> RmResult<Self> {
        bincode::deserialize(bytes).map_err(|err| RmError::not_representable(err.to_string()))
    }

    /// Encoded length in bytes
    fn len(&self) -> usize {
        bincode::serialized_size(self).map_or(0, |size| size as usize)
    }
}

/// Join of every right in the iterator, empty for an empty iterator
pub fn join_all<'a, R: Right>(rights: impl IntoIterator<Item = &'a R>) -> R {
    rights
        .into_iter()
        .fold(R::empty(), |acc, right| acc.join(right))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    struct Bits(u16);

    impl Right for Bits {
        fn empty() -> Self {
            Bits(0)
        }
        fn is_empty(&self) -> bool {
            self.0 == 0
        }
        fn intersects(&self, other: &Self) -> bool {
            self.0 & other.0 != 0
        }
        fn conflicts(&self, other: &Self) -> bool {
            self.intersects(other)
        }
        fn is_subset(&self, other: &Self) -> bool {
            self.0 & !other.0 == 0
        }
        fn join(&self, other: &Self) -> Self {
            Bits(self.0 | other.0)
        }
        fn diff(&self, other: &Self) -> Self {
            Bits(self.0 & !other.0)
        }
    }

    #[test]
    fn test_default_meet() {
        assert_eq!(Bits(0b1100).meet(&Bits(0b0110)), Bits(0b0100));
    }

    #[test]
    fn test_join_all() {
        let rights = [Bits(1), Bits(4), Bits(8)];
        assert_eq!(join_all(rights.iter()), Bits(13));
        assert_eq!(join_all::<Bits>([].iter()), Bits::empty());
    }

    #[test]
    fn test_decode_garbage_is_not_representable() {
        let err = Bits::decode(&[1]).unwrap_err();
        assert!(matches!(err, RmError::NotRepresentable { .. }));
    }

    proptest! {
        #[test]
        fn prop_encode_decode(bits in any::<u16>()) {
            let right = Bits(bits);
            let bytes = right.encode().unwrap();
            prop_assert_eq!(bytes.len(), right.len());
            prop_assert_eq!(Bits::decode(&bytes).unwrap(), right);
        }

        #[test]
        fn prop_join_diff_meet(a in any::<u16>(), b in any::<u16>()) {
            let (a, b) = (Bits(a), Bits(b));
            prop_assert_eq!(a.diff(&b).join(&a.meet(&b)), a);
            prop_assert_eq!(a.meet(&b), b.meet(&a));
        }
    }
}
