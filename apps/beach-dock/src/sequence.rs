//! Sequence bookkeeping for resumable streams.
//!
//! Backends deliver events at-least-once across reconnects: a replay may
//! repeat events the client already applied. A `SequenceCursor` remembers the
//! highest sequence applied for one session+channel and is the only
//! de-duplication mechanism, so it must be consulted before any buffer
//! mutation.

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceCursor {
    last: Option<u64>,
}

impl SequenceCursor {
    pub const fn new() -> Self {
        Self { last: None }
    }

    pub const fn at(sequence: u64) -> Self {
        Self {
            last: Some(sequence),
        }
    }

    /// Highest sequence applied so far, `None` before the first event.
    pub fn last(&self) -> Option<u64> {
        self.last
    }

    pub fn should_accept(&self, sequence: u64) -> bool {
        match self.last {
            Some(last) => sequence > last,
            None => true,
        }
    }

    /// Advances the cursor if `sequence` is newer. Returns whether it moved.
    pub fn update(&mut self, sequence: u64) -> bool {
        if self.should_accept(sequence) {
            self.last = Some(sequence);
            true
        } else {
            false
        }
    }

    /// Sequence to request when resuming a stream.
    ///
    /// This is the last applied sequence itself rather than the one after it:
    /// some backends treat `from` as exclusive and others as inclusive, and the
    /// duplicate check absorbs the repeated event either way.
    pub fn resume_from(&self) -> u64 {
        self.last.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_cursor_accepts_sequence_zero() {
        let cursor = SequenceCursor::new();
        assert!(cursor.should_accept(0));
        assert_eq!(cursor.last(), None);
        assert_eq!(cursor.resume_from(), 0);
    }

    #[test]
    fn stale_and_repeated_sequences_are_rejected() {
        let mut cursor = SequenceCursor::new();
        assert!(cursor.update(3));
        assert!(!cursor.should_accept(3));
        assert!(!cursor.should_accept(1));
        assert!(!cursor.update(2));
        assert_eq!(cursor.last(), Some(3));
        assert!(cursor.update(7));
        assert_eq!(cursor.resume_from(), 7);
    }

    #[test]
    fn cursor_never_moves_backwards_under_shuffled_delivery() {
        let deliveries = [0, 1, 1, 4, 2, 3, 4, 9, 5, 9, 8, 10, 0, 10];
        let mut cursor = SequenceCursor::new();
        let mut previous = None;
        let mut accepted = Vec::new();
        for sequence in deliveries {
            if cursor.update(sequence) {
                accepted.push(sequence);
            }
            assert!(cursor.last() >= previous);
            previous = cursor.last();
        }
        assert_eq!(accepted, vec![0, 1, 4, 9, 10]);
    }
}
