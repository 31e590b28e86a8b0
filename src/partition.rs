//! Segmentation rule shared by the hasher and the divergence search.

/// One contiguous range of a partitioned span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Absolute start offset.
    pub start: u64,
    /// Length in bytes.
    pub length: u64,
}

impl Segment {
    /// Exclusive end offset.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start + self.length
    }
}

/// Length of every segment except the last.
///
/// # Panics
///
/// Panics if `count` is zero.
#[must_use]
pub const fn standard_length(length: u64, count: u64) -> u64 {
    assert!(count > 0, "segment count must be positive");
    length / count
}

/// Split `[start, start + length)` into `count` segments.
///
/// The first `count - 1` segments have `length / count` bytes; the last one
/// absorbs the remainder, so the lengths always sum to `length`.
///
/// # Panics
///
/// Panics if `count` is zero.
///
/// # Example
///
/// ```rust
/// use forkpoint::partition::split;
///
/// let lengths: Vec<u64> = split(0, 10_240, 5).iter().map(|s| s.length).collect();
/// assert_eq!(lengths, [2048, 2048, 2048, 2048, 2048]);
///
/// let lengths: Vec<u64> = split(0, 13, 5).iter().map(|s| s.length).collect();
/// assert_eq!(lengths, [2, 2, 2, 2, 5]);
/// ```
#[must_use]
pub fn split(start: u64, length: u64, count: u64) -> Vec<Segment> {
    let standard = standard_length(length, count);
    (0..count)
        .map(|i| {
            let offset = i * standard;
            let len = if i + 1 == count {
                length - offset
            } else {
                standard
            };
            Segment {
                start: start + offset,
                length: len,
            }
        })
        .collect()
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Segment lengths always sum to the partitioned length
        #[test]
        fn lengths_sum_exactly(length in 0u64..1_000_000, count in 1u64..64) {
            let total: u64 = split(0, length, count).iter().map(|s| s.length).sum();
            prop_assert_eq!(total, length);
        }

        /// Only the last segment may differ from the standard length
        #[test]
        fn only_last_segment_absorbs(length in 0u64..100_000, count in 1u64..32) {
            let segments = split(0, length, count);
            let standard = standard_length(length, count);
            for segment in &segments[..segments.len() - 1] {
                prop_assert_eq!(segment.length, standard);
            }
            prop_assert!(segments[segments.len() - 1].length >= standard);
        }
    }
}
