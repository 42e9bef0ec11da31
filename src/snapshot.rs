//! Snapshot attachment policy.
//!
//! Snapshots only shorten replay; an entity that never snapshots behaves
//! identically, just recovers slower.

use std::num::NonZeroU64;

use crate::message::SequenceNumber;

/// Threshold used when the configured value is 0.
pub const DEFAULT_SNAPSHOT_EVERY: u64 = 100;

/// Decides whether a command result carries a snapshot.
///
/// # Examples
///
/// ```
/// use entity_stream::SnapshotPolicy;
///
/// let policy = SnapshotPolicy::from_setting("counter", 3);
/// assert!(!policy.should_snapshot(2));
/// assert!(policy.should_snapshot(3));
/// assert!(policy.should_snapshot(6));
///
/// assert!(!SnapshotPolicy::from_setting("counter", -1).should_snapshot(100));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotPolicy {
    /// Snapshot whenever the new sequence number is a multiple of the value.
    Every(NonZeroU64),
    Never,
}

impl SnapshotPolicy {
    /// Build the policy from a `snapshot_every` setting.
    ///
    /// `0` selects [`DEFAULT_SNAPSHOT_EVERY`]; negative values disable
    /// snapshots, which is logged as not recommended.
    pub fn from_setting(entity_type: &str, snapshot_every: i64) -> Self {
        match u64::try_from(snapshot_every) {
            Ok(0) => Self::default(),
            Ok(n) => NonZeroU64::new(n).map_or_else(Self::default, Self::Every),
            Err(_) => {
                tracing::warn!(
                    entity_type,
                    snapshot_every,
                    "snapshots disabled; recovery will replay the full event history, which is not recommended"
                );
                Self::Never
            }
        }
    }

    pub fn should_snapshot(&self, new_sequence_number: SequenceNumber) -> bool {
        match self {
            Self::Every(n) => new_sequence_number % n.get() == 0,
            Self::Never => false,
        }
    }
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        // DEFAULT_SNAPSHOT_EVERY is a non-zero constant.
        NonZeroU64::new(DEFAULT_SNAPSHOT_EVERY).map_or(Self::Never, Self::Every)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_selects_default() {
        let policy = SnapshotPolicy::from_setting("counter", 0);
        assert_eq!(policy, SnapshotPolicy::default());
        assert!(policy.should_snapshot(DEFAULT_SNAPSHOT_EVERY));
        assert!(!policy.should_snapshot(DEFAULT_SNAPSHOT_EVERY - 1));
    }

    #[test]
    fn negative_never_snapshots() {
        let policy = SnapshotPolicy::from_setting("counter", -5);
        assert_eq!(policy, SnapshotPolicy::Never);
        for seq in [0, 1, 5, 100, 1000] {
            assert!(!policy.should_snapshot(seq));
        }
    }

    #[test]
    fn attaches_iff_multiple() {
        let policy = SnapshotPolicy::from_setting("counter", 4);
        let hits: Vec<u64> = (1..=12).filter(|s| policy.should_snapshot(*s)).collect();
        assert_eq!(hits, vec![4, 8, 12]);
    }

    #[test]
    fn every_one_snapshots_always() {
        let policy = SnapshotPolicy::from_setting("counter", 1);
        assert!((1..10).all(|s| policy.should_snapshot(s)));
    }
}
