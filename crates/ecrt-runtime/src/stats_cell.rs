//! Seqlock publication of cycle statistics.
//!
//! The cyclic worker publishes a [`StatsSnapshot`] after every cycle; any
//! number of reporter threads read consistent copies. The writer never
//! waits. A reader that overlaps a publish retries.
//!
//! The snapshot is stored as plain atomic words, so no unsafe code is needed:
//!
//! ```text
//! sequence (odd = publish in progress) │ word 0 │ word 1 │ ... │ word N-1
//! ```

use crossbeam_utils::CachePadded;
use ecrt_common::metrics::{StatsSnapshot, SNAPSHOT_WORDS};
use std::sync::atomic::{fence, AtomicU64, Ordering};

/// Single-writer, multi-reader statistics cell.
#[derive(Debug)]
pub struct SharedStats {
    /// Publish counter; odd while a publish is in progress.
    sequence: CachePadded<AtomicU64>,
    /// Flattened snapshot.
    words: [AtomicU64; SNAPSHOT_WORDS],
}

impl Default for SharedStats {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedStats {
    /// Create a cell holding an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        let cell = Self {
            sequence: CachePadded::new(AtomicU64::new(0)),
            words: std::array::from_fn(|_| AtomicU64::new(0)),
        };
        cell.publish(&StatsSnapshot::default());
        cell
    }

    /// Publish a snapshot.
    ///
    /// Must only be called from one thread at a time.
    pub fn publish(&self, snapshot: &StatsSnapshot) {
        let words = snapshot.to_words();

        self.sequence.fetch_add(1, Ordering::Relaxed);
        fence(Ordering::Release);

        for (slot, word) in self.words.iter().zip(words) {
            slot.store(word, Ordering::Relaxed);
        }

        self.sequence.fetch_add(1, Ordering::Release);
    }

    /// Read the latest complete snapshot.
    #[must_use]
    pub fn read(&self) -> StatsSnapshot {
        loop {
            let seq1 = self.sequence.load(Ordering::Acquire);
            if seq1 & 1 != 0 {
                std::hint::spin_loop();
                continue;
            }

            let mut words = [0u64; SNAPSHOT_WORDS];
            for (out, slot) in words.iter_mut().zip(&self.words) {
                *out = slot.load(Ordering::Relaxed);
            }

            fence(Ordering::Acquire);
            let seq2 = self.sequence.load(Ordering::Relaxed);
            if seq1 == seq2 {
                return StatsSnapshot::from_words(&words);
            }

            std::hint::spin_loop();
        }
    }

    /// Number of completed publishes, including the initial empty one.
    #[must_use]
    pub fn publish_count(&self) -> u64 {
        self.sequence.load(Ordering::Acquire) / 2
    }
}
