//! Thread-safe sequence counter for ordering printer status snapshots and
//! connection epochs.
//!
//! # Why sequence numbers instead of timestamps? (for beginners)
//!
//! Printers stamp their frames with a wall-clock `TimeStamp` in whole
//! seconds, and their clocks are frequently wrong (no RTC, no NTP).  Two
//! status frames in the same second compare equal, and a printer whose clock
//! jumps backwards after a reboot would make fresh data look stale.
//!
//! The hub therefore assigns its own numbers on arrival.  A counter that only
//! ever grows gives every accepted snapshot a strictly larger `updated_at`
//! than the previous one, and "is this older than what I have?" becomes a
//! plain integer comparison.
//!
//! # Thread safety
//!
//! The counter uses `AtomicU64`, so a shared `Arc<SequenceCounter>` can be
//! advanced from several tasks without a lock and never hands out the same
//! value twice.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter that starts at 1.
///
/// Zero is reserved as "nothing seen yet", so the first call to
/// [`SequenceCounter::next`] returns 1.
///
/// # Examples
///
/// ```rust
/// use chitu_core::protocol::SequenceCounter;
///
/// let counter = SequenceCounter::new();
/// assert_eq!(counter.next(), 1);
/// assert_eq!(counter.next(), 2);
/// assert_eq!(counter.current(), 2);
/// ```
#[derive(Debug)]
pub struct SequenceCounter {
    inner: AtomicU64,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self {
            inner: AtomicU64::new(0),
        }
    }

    /// Advances the counter and returns the new value.
    ///
    /// Saturates at `u64::MAX` instead of wrapping: a wrapped counter would
    /// make every later snapshot look older than the last one.
    pub fn next(&self) -> u64 {
        let previous = self
            .inner
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_add(1))
            })
            .unwrap_or(u64::MAX);
        previous.saturating_add(1)
    }

    /// Returns the last value handed out (0 if none).
    pub fn current(&self) -> u64 {
        self.inner.load(Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_sequence_counter_starts_at_one() {
        // Arrange
        let counter = SequenceCounter::new();

        // Act
        let first = counter.next();

        // Assert
        assert_eq!(first, 1);
        assert_eq!(counter.current(), 1);
    }

    #[test]
    fn test_sequence_counter_increments_monotonically() {
        let counter = SequenceCounter::new();
        let values: Vec<u64> = (0..100).map(|_| counter.next()).collect();
        for window in values.windows(2) {
            assert!(window[1] > window[0], "values must strictly increase");
        }
    }

    #[test]
    fn test_sequence_counter_saturates_at_u64_max() {
        // Arrange – one step before the ceiling
        let counter = SequenceCounter {
            inner: AtomicU64::new(u64::MAX - 1),
        };

        // Act
        let last = counter.next();
        let after = counter.next();

        // Assert
        assert_eq!(last, u64::MAX);
        assert_eq!(after, u64::MAX, "counter must not wrap back to small values");
    }

    #[test]
    fn test_sequence_counter_is_thread_safe() {
        // Arrange
        let counter = Arc::new(SequenceCounter::new());

        // Act – advance from several threads at once
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = Arc::clone(&counter);
                thread::spawn(move || (0..500).map(|_| c.next()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread panicked"))
            .collect();

        // Assert – no value handed out twice
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 8 * 500);
    }
}
