//! Rings of power
//!
//! A bitmask right over twenty named rings. Every ring is exclusive except
//! `SHARED_RING`, which any number of holders may keep at once. The
//! three-server scenarios are written in terms of these rings.

#![allow(missing_docs)]

use rm_core::{ResourceType, ResourceTypeId, Right, RmError, RmResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

/// Type tag of [`RingsType`]
pub const RINGS_TYPE: ResourceTypeId = ResourceTypeId(0x7269);

/// Custom policy: grant the wanted rings plus every cached ring of the same
/// family
pub const RINGS_FAMILY: u32 = 1;

/// A set of rings
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rings(pub u64);

pub const NARYA: Rings = Rings(1 << 0);
pub const NENYA: Rings = Rings(1 << 1);
pub const VILYA: Rings = Rings(1 << 2);
pub const DURIN: Rings = Rings(1 << 3);
pub const THROR: Rings = Rings(1 << 4);
pub const GR_2: Rings = Rings(1 << 5);
pub const GR_3: Rings = Rings(1 << 6);
pub const GR_4: Rings = Rings(1 << 7);
pub const GR_5: Rings = Rings(1 << 8);
pub const GR_6: Rings = Rings(1 << 9);
pub const ANGMAR: Rings = Rings(1 << 10);
pub const KHAMUL: Rings = Rings(1 << 11);
pub const MR_2: Rings = Rings(1 << 12);
pub const MR_3: Rings = Rings(1 << 13);
pub const MR_4: Rings = Rings(1 << 14);
pub const MR_5: Rings = Rings(1 << 15);
pub const MR_6: Rings = Rings(1 << 16);
pub const MR_7: Rings = Rings(1 << 17);
pub const MR_8: Rings = Rings(1 << 18);
pub const THE_ONE: Rings = Rings(1 << 19);
/// The only ring holders do not conflict over
pub const SHARED_RING: Rings = Rings(1 << 20);

pub const ELVEN_RINGS: Rings = Rings(NARYA.0 | NENYA.0 | VILYA.0);
pub const DWARF_RINGS: Rings = Rings(0b111_1111 << 3);
pub const MEN_RINGS: Rings = Rings(0b1_1111_1111 << 10);
pub const ALL_RINGS: Rings = Rings((1 << 21) - 1);

const NAMES: [&str; 21] = [
    "narya", "nenya", "vilya", "durin", "thror", "gr2", "gr3", "gr4", "gr5", "gr6", "angmar",
    "khamul", "mr2", "mr3", "mr4", "mr5", "mr6", "mr7", "mr8", "the-one", "shared",
];

impl Rings {
    pub fn bits(self) -> u64 {
        self.0
    }

    /// Rings named in the set, lowest first
    pub fn names(self) -> Vec<&'static str> {
        NAMES
            .iter()
            .enumerate()
            .filter(|(bit, _)| self.0 & (1 << bit) != 0)
            .map(|(_, name)| *name)
            .collect()
    }
}

impl BitOr for Rings {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Rings(self.0 | rhs.0)
    }
}

impl fmt::Debug for Rings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 & !ALL_RINGS.0 != 0 {
            return write!(f, "Rings({:#x})", self.0);
        }
        write!(f, "Rings[{}]", self.names().join("|"))
    }
}

impl Right for Rings {
    fn empty() -> Self {
        Rings(0)
    }

    fn is_empty(&self) -> bool {
        self.0 == 0
    }

    fn intersects(&self, other: &Self) -> bool {
        self.0 & other.0 != 0
    }

    fn conflicts(&self, other: &Self) -> bool {
        self.0 & other.0 & !SHARED_RING.0 != 0
    }

    fn is_subset(&self, other: &Self) -> bool {
        self.0 & !other.0 == 0
    }

    fn join(&self, other: &Self) -> Self {
        Rings(self.0 | other.0)
    }

    fn diff(&self, other: &Self) -> Self {
        Rings(self.0 & !other.0)
    }

    fn meet(&self, other: &Self) -> Self {
        Rings(self.0 & other.0)
    }
}

/// Resource type whose rights are [`Rings`]; resources are numbered
#[derive(Debug, Clone, Copy, Default)]
pub struct RingsType;

impl ResourceType for RingsType {
    type Right = Rings;
    type Id = u64;

    fn type_id(&self) -> ResourceTypeId {
        RINGS_TYPE
    }

    fn name(&self) -> &str {
        "rings"
    }

    fn validate(&self, right: &Rings) -> RmResult<()> {
        let unknown = right.0 & !ALL_RINGS.0;
        if unknown != 0 {
            return Err(RmError::not_representable(format!(
                "no ring behind bits {unknown:#x}"
            )));
        }
        Ok(())
    }

    fn apply_policy(&self, code: u32, need: &Rings, cached: &Rings) -> RmResult<Rings> {
        if code != RINGS_FAMILY {
            return Err(RmError::invalid(format!("rings have no policy {code}")));
        }
        let families = [ELVEN_RINGS, DWARF_RINGS, MEN_RINGS]
            .into_iter()
            .filter(|family| family.intersects(need))
            .fold(Rings::empty(), |acc, family| acc.join(&family));
        Ok(need.join(&families.meet(cached)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_families_partition_the_exclusive_rings() {
        let families = ELVEN_RINGS | DWARF_RINGS | MEN_RINGS;
        assert_eq!(families | THE_ONE | SHARED_RING, ALL_RINGS);
        assert!(!ELVEN_RINGS.intersects(&DWARF_RINGS));
        assert!(!DWARF_RINGS.intersects(&MEN_RINGS));
        assert_eq!(DWARF_RINGS, DURIN | THROR | GR_2 | GR_3 | GR_4 | GR_5 | GR_6);
        assert_eq!(
            MEN_RINGS,
            ANGMAR | KHAMUL | MR_2 | MR_3 | MR_4 | MR_5 | MR_6 | MR_7 | MR_8
        );
    }

    #[test]
    fn test_shared_ring_never_conflicts() {
        assert!(SHARED_RING.intersects(&SHARED_RING));
        assert!(!SHARED_RING.conflicts(&SHARED_RING));
        assert!((NENYA | SHARED_RING).conflicts(&NENYA));
        assert!(!(NENYA | SHARED_RING).conflicts(&(VILYA | SHARED_RING)));
    }

    #[test]
    fn test_validate_rejects_unknown_bits() {
        assert!(RingsType.validate(&ALL_RINGS).is_ok());
        let err = RingsType.validate(&Rings(1 << 40)).unwrap_err();
        assert_eq!(err.code(), rm_core::errno::ESRCH);
    }

    #[test]
    fn test_family_policy_stays_within_cached() {
        let cached = NENYA | VILYA | DURIN;
        let grant = RingsType.apply_policy(RINGS_FAMILY, &NENYA, &cached).unwrap();
        assert_eq!(grant, NENYA | VILYA);
        assert!(RingsType.apply_policy(7, &NENYA, &cached).is_err());
    }

    #[test]
    fn test_debug_names_rings() {
        assert_eq!(format!("{:?}", NENYA | SHARED_RING), "Rings[nenya|shared]");
    }
}
