//! Byte extents
//!
//! A right over byte ranges of a file: a normalized list of disjoint,
//! non-adjacent half-open ranges sorted by start. Any overlap conflicts.

use rm_core::{ResourceType, ResourceTypeId, Right, RmError, RmResult};
use serde::{Deserialize, Serialize};

/// Type tag of [`ExtentType`]
pub const EXTENTS_TYPE: ResourceTypeId = ResourceTypeId(0x6578);

/// A set of byte ranges
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Extents(Vec<(u64, u64)>);

impl Extents {
    /// Normalize arbitrary ranges; empty and inverted ranges vanish
    pub fn new(ranges: impl IntoIterator<Item = (u64, u64)>) -> Self {
        let mut ranges: Vec<(u64, u64)> = ranges.into_iter().filter(|(s, e)| s < e).collect();
        ranges.sort_unstable();
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
        for (start, end) in ranges {
            match merged.last_mut() {
                Some(last) if start <= last.1 => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }
        Extents(merged)
    }

    /// One range `[start, end)`
    pub fn range(start: u64, end: u64) -> Self {
        Self::new([(start, end)])
    }

    /// Sorted disjoint ranges
    pub fn ranges(&self) -> &[(u64, u64)] {
        &self.0
    }

    /// Number of bytes covered
    pub fn bytes(&self) -> u64 {
        self.0.iter().map(|(s, e)| e - s).sum()
    }

    fn is_normalized(&self) -> bool {
        self.0.iter().all(|(s, e)| s < e) && self.0.windows(2).all(|pair| pair[0].1 < pair[1].0)
    }
}

impl Right for Extents {
    fn empty() -> Self {
        Extents(Vec::new())
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn intersects(&self, other: &Self) -> bool {
        let (mut i, mut j) = (0, 0);
        while i < self.0.len() && j < other.0.len() {
            let (a, b) = (self.0[i], other.0[j]);
            if a.0 < b.1 && b.0 < a.1 {
                return true;
            }
            if a.1 <= b.1 {
                i += 1;
            } else {
                j += 1;
            }
        }
        false
    }

    fn conflicts(&self, other: &Self) -> bool {
        self.intersects(other)
    }

    fn is_subset(&self, other: &Self) -> bool {
        self.diff(other).is_empty()
    }

    fn join(&self, other: &Self) -> Self {
        Self::new(self.0.iter().chain(&other.0).copied())
    }

    fn diff(&self, other: &Self) -> Self {
        let mut out = Vec::new();
        for &(start, end) in &self.0 {
            let mut from = start;
            for &(cut_start, cut_end) in &other.0 {
                if cut_end <= from {
                    continue;
                }
                if cut_start >= end {
                    break;
                }
                if cut_start > from {
                    out.push((from, cut_start));
                }
                from = from.max(cut_end);
                if from >= end {
                    break;
                }
            }
            if from < end {
                out.push((from, end));
            }
        }
        Extents(out)
    }
}

/// Resource type for byte ranges of named files
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtentType;

impl ResourceType for ExtentType {
    type Right = Extents;
    type Id = String;

    fn type_id(&self) -> ResourceTypeId {
        EXTENTS_TYPE
    }

    fn name(&self) -> &str {
        "extents"
    }

    fn validate(&self, right: &Extents) -> RmResult<()> {
        if !right.is_normalized() {
            return Err(RmError::not_representable(format!(
                "extents {:?} are not normalized",
                right.0
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_merges_overlapping_and_adjacent_ranges() {
        let extents = Extents::new([(10, 20), (0, 5), (5, 8), (15, 30), (40, 40)]);
        assert_eq!(extents.ranges(), &[(0, 8), (10, 30)]);
        assert_eq!(extents.bytes(), 28);
    }

    #[test]
    fn test_diff_splits_ranges() {
        let file = Extents::range(0, 100);
        let hole = Extents::new([(10, 20), (50, 60)]);
        let left = file.diff(&hole);
        assert_eq!(left.ranges(), &[(0, 10), (20, 50), (60, 100)]);
        assert!(!left.intersects(&hole));
        assert_eq!(left.join(&hole), file);
    }

    #[test]
    fn test_meet_keeps_the_overlap() {
        let a = Extents::new([(0, 10), (20, 30)]);
        let b = Extents::range(5, 25);
        assert_eq!(a.meet(&b).ranges(), &[(5, 10), (20, 25)]);
    }

    #[test]
    fn test_touching_ranges_do_not_intersect() {
        assert!(!Extents::range(0, 10).intersects(&Extents::range(10, 20)));
        assert!(Extents::range(0, 11).conflicts(&Extents::range(10, 20)));
    }

    #[test]
    fn test_decoded_unnormalized_extents_are_rejected() {
        let raw = Extents(vec![(5, 10), (0, 3)]);
        let bytes = raw.encode().unwrap();
        let err = ExtentType.decode_right(&bytes).unwrap_err();
        assert_eq!(err.code(), rm_core::errno::ESRCH);
    }
}
