//! Per-replica logical timestamps.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Maps a replica ID to the latest logical timestamp seen from it.
///
/// A missing entry is the same as timestamp zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    timestamps: HashMap<String, i64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replica_timestamp(&self, replica_id: &str) -> Option<i64> {
        self.timestamps.get(replica_id).copied()
    }

    pub fn set_replica_timestamp(&mut self, replica_id: impl Into<String>, timestamp: i64) {
        self.timestamps.insert(replica_id.into(), timestamp);
    }

    /// Advance the replica's timestamp by one and return it.
    pub fn increment(&mut self, replica_id: &str) -> i64 {
        let ts = self.timestamps.entry(replica_id.to_string()).or_insert(0);
        *ts += 1;
        *ts
    }

    /// Take the componentwise maximum of both clocks.
    pub fn merge(&mut self, other: &VectorClock) {
        for (replica, &ts) in &other.timestamps {
            let entry = self.timestamps.entry(replica.clone()).or_insert(ts);
            if *entry < ts {
                *entry = ts;
            }
        }
    }

    /// True if this clock strictly dominates `other`: no entry is smaller and
    /// at least one is larger or absent from `other`.
    pub fn is_after(&self, other: &VectorClock) -> bool {
        let mut any_after = false;
        for (replica, &other_ts) in &other.timestamps {
            match self.timestamps.get(replica) {
                None => return false,
                Some(&ts) if ts < other_ts => return false,
                Some(&ts) if ts > other_ts => any_after = true,
                Some(_) => {}
            }
        }
        any_after || self.timestamps.len() > other.timestamps.len()
    }

    /// Neither clock is after the other and they differ.
    pub fn is_concurrent_with(&self, other: &VectorClock) -> bool {
        self != other && !self.is_after(other) && !other.is_after(self)
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Entries sorted by replica ID.
    pub fn entries(&self) -> Vec<(&str, i64)> {
        let mut entries: Vec<_> = self
            .timestamps
            .iter()
            .map(|(k, v)| (k.as_str(), *v))
            .collect();
        entries.sort_unstable();
        entries
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VectorClock{{")?;
        for (i, (replica, ts)) in self.entries().into_iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{replica}={ts}")?;
        }
        write!(f, "}}")
    }
}

impl<S: Into<String>> FromIterator<(S, i64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (S, i64)>>(iter: I) -> Self {
        Self {
            timestamps: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(entries: &[(&str, i64)]) -> VectorClock {
        entries.iter().map(|(k, v)| (*k, *v)).collect()
    }

    #[test]
    fn test_is_after() {
        let cases = [
            (clock(&[("A", 1)]), clock(&[]), true),
            (clock(&[("A", 1)]), clock(&[("A", 1)]), false),
            (clock(&[("A", 1)]), clock(&[("B", 1)]), false),
            (clock(&[("A", 1), ("B", 1)]), clock(&[("A", 1)]), true),
            (clock(&[("A", 1)]), clock(&[("A", 1), ("B", 1)]), false),
            (clock(&[("A", 2)]), clock(&[("A", 1)]), true),
            (clock(&[("A", 2)]), clock(&[("A", 1), ("B", 1)]), false),
            (clock(&[("A", 2), ("B", 1)]), clock(&[("A", 1), ("B", 1)]), true),
        ];
        for (a, b, expected) in cases {
            assert_eq!(a.is_after(&b), expected, "{a} after {b}");
        }
    }

    #[test]
    fn test_is_after_irreflexive() {
        assert!(!VectorClock::new().is_after(&VectorClock::new()));
        let c = clock(&[("A", 3), ("B", 7)]);
        assert!(!c.is_after(&c.clone()));
    }

    #[test]
    fn test_merge_takes_componentwise_max() {
        let mut merged = clock(&[("A", 3), ("B", 1)]);
        merged.merge(&clock(&[("A", 1), ("B", 2), ("C", 3)]));
        assert_eq!(merged, clock(&[("A", 3), ("B", 2), ("C", 3)]));

        let mut other = clock(&[("A", 1), ("B", 2), ("C", 3)]);
        other.merge(&clock(&[("A", 3), ("B", 1)]));
        assert_eq!(other, merged);
    }

    #[test]
    fn test_increment_and_display() {
        let mut c = VectorClock::new();
        assert_eq!(c.increment("B"), 1);
        assert_eq!(c.increment("B"), 2);
        c.set_replica_timestamp("A", 5);
        assert_eq!(c.replica_timestamp("A"), Some(5));
        assert_eq!(c.replica_timestamp("Z"), None);
        assert_eq!(c.to_string(), "VectorClock{A=5, B=2}");
    }

    #[test]
    fn test_concurrent() {
        let a = clock(&[("A", 2), ("B", 1)]);
        let b = clock(&[("A", 1), ("B", 2)]);
        assert!(a.is_concurrent_with(&b));
        assert!(!a.is_concurrent_with(&a));
    }

    #[test]
    fn test_bincode_round_trip() {
        let c = clock(&[("member-1", 4), ("member-2", 9)]);
        let bytes = bincode::serialize(&c).unwrap();
        let decoded: VectorClock = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, c);
    }
}
