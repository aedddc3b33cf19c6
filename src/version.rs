use serde::{Deserialize, Serialize};
use std::fmt;

/// Version vector primitive used everywhere a "which update is newer"
/// decision is made.
///
/// The incarnation number identifies one life of a node process and bumps
/// on restart; the minor version counts local state changes within that
/// life. Ordering is lexicographic, incarnation first, so a restarted node
/// always dominates its previous life regardless of minor counts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeVersion {
    incarnation: i64,
    minor: i64,
}

impl NodeVersion {
    pub fn new(incarnation: i64, minor: i64) -> Self {
        Self { incarnation, minor }
    }

    pub fn incarnation(&self) -> i64 {
        self.incarnation
    }

    pub fn minor(&self) -> i64 {
        self.minor
    }

    /// Next version within the same life. The caller's own minor version is
    /// monotonically non-decreasing while the process lives.
    pub fn bump_minor(&mut self) {
        self.minor += 1;
    }

    /// A version that dominates every version of the given incarnation.
    /// Used to synthesize a terminal Leave for a stale duplicate node.
    pub fn highest_of(incarnation: i64) -> Self {
        Self {
            incarnation,
            minor: i64::MAX,
        }
    }
}

impl fmt::Display for NodeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.incarnation, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incarnation_dominates() {
        let old_life = NodeVersion::new(1, 500);
        let new_life = NodeVersion::new(2, 0);

        assert!(old_life < new_life);
    }

    #[test]
    fn minor_breaks_ties() {
        let a = NodeVersion::new(3, 1);
        let b = NodeVersion::new(3, 2);

        assert!(a < b);
        assert_eq!(a, NodeVersion::new(3, 1));
    }

    #[test]
    fn total_order() {
        let a = NodeVersion::new(1, 2);
        let b = NodeVersion::new(2, 1);

        // Exactly one of <, ==, > holds.
        assert_eq!((a < b) as u8 + (a == b) as u8 + (a > b) as u8, 1);
    }

    #[test]
    fn highest_of_dominates_life() {
        let v = NodeVersion::new(4, i64::MAX - 1);

        assert!(v < NodeVersion::highest_of(4));
        assert!(NodeVersion::highest_of(4) < NodeVersion::new(5, 0));
    }

    #[test]
    fn bump_minor_is_monotone() {
        let mut v = NodeVersion::new(1, 0);
        let before = v;
        v.bump_minor();

        assert!(before < v);
        assert_eq!(v.minor(), 1);
    }
}
