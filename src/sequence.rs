//! Per-entity event sequence bookkeeping.

use crate::error::ProtocolError;
use crate::message::SequenceNumber;

/// Tracks the sequence number of the last applied event and of the last
/// snapshot taken.
///
/// Starts at 0 for a fresh entity, or at the snapshot's sequence number
/// when resuming. Every replayed or appended event must be exactly
/// `current + 1`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceTracker {
    current: SequenceNumber,
    last_snapshot: SequenceNumber,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from a snapshot taken at `sequence_number`.
    pub fn from_snapshot(sequence_number: SequenceNumber) -> Self {
        Self {
            current: sequence_number,
            last_snapshot: sequence_number,
        }
    }

    pub fn current(&self) -> SequenceNumber {
        self.current
    }

    pub fn last_snapshot(&self) -> SequenceNumber {
        self.last_snapshot
    }

    /// Accept a replayed event, rejecting gaps, duplicates and reordering.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::SequenceGap`] if `sequence_number` is not
    /// `current + 1`; the tracker is left unchanged.
    pub fn record_replayed(&mut self, sequence_number: SequenceNumber) -> Result<(), ProtocolError> {
        let expected = self.current + 1;
        if sequence_number != expected {
            return Err(ProtocolError::SequenceGap {
                expected,
                received: sequence_number,
            });
        }
        self.current = sequence_number;
        Ok(())
    }

    /// Sequence number the entity would reach after `count` more events.
    pub fn peek_advance(&self, count: usize) -> SequenceNumber {
        self.current + count as SequenceNumber
    }

    /// Advance past `count` newly appended events and return the new value.
    pub fn advance(&mut self, count: usize) -> SequenceNumber {
        self.current = self.peek_advance(count);
        self.current
    }

    pub fn mark_snapshot(&mut self, sequence_number: SequenceNumber) {
        self.last_snapshot = sequence_number;
    }
}
