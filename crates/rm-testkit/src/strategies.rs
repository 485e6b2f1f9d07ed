//! Property test strategies for resource manager types

use proptest::prelude::*;

pub use proptest;

use crate::extents::Extents;
use crate::rings::{Rings, ALL_RINGS};
use rm_core::{IncomingFlags, Policy};

/// Any set of known rings, empty included
pub fn arb_rings() -> impl Strategy<Value = Rings> {
    (0..=ALL_RINGS.bits()).prop_map(Rings)
}

/// A single exclusive ring
pub fn arb_ring() -> impl Strategy<Value = Rings> {
    (0u32..20).prop_map(|bit| Rings(1 << bit))
}

/// Up to four ranges inside the first 256 bytes
pub fn arb_extents() -> impl Strategy<Value = Extents> {
    prop::collection::vec((0u64..256, 1u64..64), 0..4).prop_map(|ranges| {
        Extents::new(ranges.into_iter().map(|(start, len)| (start, start + len)))
    })
}

/// Request flags in any combination
pub fn arb_flags() -> impl Strategy<Value = IncomingFlags> {
    (0u32..16).prop_map(IncomingFlags::from_bits_truncate)
}

/// Policies the engine resolves without a custom hook
pub fn arb_builtin_policy() -> impl Strategy<Value = Policy> {
    prop_oneof![
        Just(Policy::Inplace),
        Just(Policy::Strict),
        Just(Policy::Join),
        Just(Policy::Max),
    ]
}
