//! Right algebra laws
//!
//! Every resource type's right must obey these for the engine's books to
//! stay consistent. [`check_right_laws`] reports the first law a pair of
//! rights violates, so property tests can shrink toward a minimal
//! counterexample.

use rm_core::Right;

macro_rules! law {
    ($holds:expr, $name:literal) => {
        if !$holds {
            return Err(format!(concat!("violated: ", $name)));
        }
    };
}

/// Check every algebra law on `a` and `b`
pub fn check_right_laws<R: Right>(a: &R, b: &R) -> Result<(), String> {
    let empty = R::empty();

    law!(empty.is_empty(), "empty() is empty");
    law!(a.intersects(b) == b.intersects(a), "intersects is symmetric");
    law!(a.intersects(a) == !a.is_empty(), "a intersects itself iff non-empty");
    law!(!a.intersects(&empty), "nothing intersects empty");
    law!(!a.conflicts(b) || a.intersects(b), "conflicts implies intersects");
    law!(a.conflicts(b) == b.conflicts(a), "conflicts is symmetric");

    law!(a.diff(a).is_empty(), "diff(a, a) is empty");
    law!(a.diff(&empty) == *a, "diff(a, empty) is a");
    law!(!a.diff(b).intersects(b), "diff(a, b) misses b");

    let join = a.join(b);
    law!(a.is_subset(&join) && b.is_subset(&join), "join is an upper bound");
    law!(join.diff(a).diff(b).is_empty(), "join is the least upper bound");
    law!(a.join(&empty) == *a, "empty is the join identity");

    let meet = a.meet(b);
    law!(meet == b.meet(a), "meet is commutative");
    law!(a.meet(a) == *a, "meet is idempotent");
    law!(meet.is_subset(a) && meet.is_subset(b), "meet is a lower bound");
    law!(a.diff(b).join(&meet) == *a, "diff and meet partition a");

    law!(a.is_subset(a), "is_subset is reflexive");
    law!(empty.is_subset(a), "empty is a subset of everything");

    let decoded = a.encode().and_then(|bytes| R::decode(&bytes));
    law!(decoded.as_ref() == Ok(a), "decode inverts encode");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::{arb_extents, arb_rings};
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_rings_obey_the_laws(a in arb_rings(), b in arb_rings()) {
            prop_assert_eq!(check_right_laws(&a, &b), Ok(()));
        }

        #[test]
        fn test_extents_obey_the_laws(a in arb_extents(), b in arb_extents()) {
            prop_assert_eq!(check_right_laws(&a, &b), Ok(()));
        }
    }

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Lopsided(u8);

    impl Right for Lopsided {
        fn empty() -> Self {
            Lopsided(0)
        }
        fn is_empty(&self) -> bool {
            self.0 == 0
        }
        fn intersects(&self, other: &Self) -> bool {
            self.0 & other.0 != 0
        }
        // Conflicts in one direction only.
        fn conflicts(&self, other: &Self) -> bool {
            self.0 > other.0 && self.intersects(other)
        }
        fn is_subset(&self, other: &Self) -> bool {
            self.0 & !other.0 == 0
        }
        fn join(&self, other: &Self) -> Self {
            Lopsided(self.0 | other.0)
        }
        fn diff(&self, other: &Self) -> Self {
            Lopsided(self.0 & !other.0)
        }
    }

    #[test]
    fn test_checker_reports_broken_law() {
        let err = check_right_laws(&Lopsided(3), &Lopsided(1)).unwrap_err();
        assert_eq!(err, "violated: conflicts is symmetric");
    }
}
