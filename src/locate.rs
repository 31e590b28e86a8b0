//! Divide-and-conquer search for the first differing byte.
//!
//! Each round asks both sides for a `fan_out`-way digest set over the
//! current range, keeps the first sub-segment whose digests disagree and
//! repeats on it until a single byte remains.

use std::path::Path;
use std::thread;

use tracing::{debug, warn};

use crate::cancel::Cancellation;
use crate::checker::{FileHashChecker, HashMode, MultipartHashChecker};
use crate::error::{ForkpointError, Result};
use crate::hash::HashAlgorithm;
use crate::hierarchy::{HasherConfig, HierarchicalHasher};
use crate::model::SegmentHash;
use crate::partition;

/// Configuration for the divergence search.
#[derive(Debug, Clone)]
pub struct LocatorConfig {
    /// Sub-segments compared per round.
    pub fan_out: usize,
    /// Digest algorithm requested from both sides.
    pub algorithm: HashAlgorithm,
    /// Read buffer of the hashers built for local files.
    pub read_buffer_size: usize,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            fan_out: 5,
            algorithm: HashAlgorithm::default(),
            read_buffer_size: 64 * 1024,
        }
    }
}

/// Builder for [`DivergenceLocator`].
///
/// # Example
///
/// ```rust
/// use forkpoint::{HashAlgorithm, LocatorBuilder};
///
/// let locator = LocatorBuilder::new()
///     .fan_out(8)
///     .algorithm(HashAlgorithm::Sha256)
///     .build();
/// assert_eq!(locator.config().fan_out, 8);
/// ```
#[derive(Debug, Clone, Default)]
pub struct LocatorBuilder {
    config: LocatorConfig,
    cancel: Option<Cancellation>,
}

impl LocatorBuilder {
    /// Builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of sub-segments compared per round.
    ///
    /// # Panics
    ///
    /// Panics if `fan_out` is less than 2.
    #[must_use]
    pub fn fan_out(mut self, fan_out: usize) -> Self {
        assert!(fan_out >= 2, "Fan-out must be at least 2");
        self.config.fan_out = fan_out;
        self
    }

    /// Set the digest algorithm.
    #[must_use]
    pub const fn algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.config.algorithm = algorithm;
        self
    }

    /// Set the read buffer size used when hashing local files.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    #[must_use]
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        assert!(size > 0, "Read buffer size must be positive");
        self.config.read_buffer_size = size;
        self
    }

    /// Observe an external cancellation token.
    #[must_use]
    pub fn cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Build the locator.
    #[must_use]
    pub fn build(self) -> DivergenceLocator {
        DivergenceLocator {
            config: self.config,
            cancel: self.cancel.unwrap_or_default(),
        }
    }
}

/// Finds the earliest byte offset at which two copies differ.
///
/// `locate` returns `None` when both copies are identical over the
/// compared length.
///
/// # Example
///
/// ```rust
/// use std::io::Cursor;
/// use forkpoint::{DivergenceLocator, StreamHashChecker};
///
/// let source = StreamHashChecker::new(Cursor::new(b"hello world".to_vec()));
/// let target = StreamHashChecker::new(Cursor::new(b"hello there".to_vec()));
///
/// let locator = DivergenceLocator::new();
/// assert_eq!(locator.locate(&source, &target).unwrap(), Some(6));
/// ```
#[derive(Debug, Clone, Default)]
pub struct DivergenceLocator {
    config: LocatorConfig,
    cancel: Cancellation,
}

impl DivergenceLocator {
    /// Locator with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &LocatorConfig {
        &self.config
    }

    /// The token this locator observes between rounds.
    #[must_use]
    pub const fn cancellation(&self) -> &Cancellation {
        &self.cancel
    }

    /// Search for the first differing byte between `source` and `target`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the source length is unknown,
    /// `Cancelled` when cancelled between rounds, `DigestMismatch` when a
    /// side answers with a digest set of the wrong shape, or any error of
    /// the checkers.
    pub fn locate<S, T>(&self, source: &S, target: &T) -> Result<Option<u64>>
    where
        S: MultipartHashChecker + ?Sized,
        T: MultipartHashChecker + ?Sized,
    {
        let (source_length, target_length) = thread::scope(|scope| {
            let target_length = scope.spawn(|| target.length());
            let source_length = source.length();
            (source_length, join(target_length))
        });
        let source_length = source_length?;
        let target_length = target_length?;

        if let (Some(s), Some(t)) = (source_length, target_length) {
            if s != t {
                debug!(source = s, target = t, "lengths differ");
                return Ok(Some(0));
            }
        }
        let mut current = source_length.ok_or_else(|| {
            ForkpointError::InvalidArgument("source length is unknown".to_string())
        })?;
        if current == 0 {
            return Ok(None);
        }

        let algorithm = self.config.algorithm;
        let mut start = 0u64;
        let mut round = 0usize;
        loop {
            self.cancel.check()?;
            let segments = current.min(self.config.fan_out as u64);
            if segments <= 1 {
                debug!(offset = start, rounds = round, "divergence pinpointed");
                return Ok(Some(start));
            }
            debug!(round, start, length = current, segments, "comparing digests");

            let parts = segments as usize;
            let (source_hashes, target_hashes) = thread::scope(|scope| {
                let remote = scope.spawn(|| target.hashes(start, current, parts, algorithm));
                let local = source.hashes(start, current, parts, algorithm);
                (local, join(remote))
            });
            let source_hashes = checked_shape(source_hashes?, parts)?;
            let target_hashes = checked_shape(target_hashes?, parts)?;

            if source_hashes[0].hash == target_hashes[0].hash {
                if round == 0 {
                    return Ok(None);
                }
                warn!(
                    start,
                    length = current,
                    "whole-range digests agree after an earlier mismatch; data changed during the search"
                );
                return Ok(start.checked_sub(1));
            }

            let Some(index) = source_hashes[1..]
                .iter()
                .zip(&target_hashes[1..])
                .position(|(s, t)| s.hash != t.hash)
            else {
                warn!(start, length = current, "no sub-segment differs although the whole range does");
                return Ok(Some(start));
            };

            let segment = partition::split(start, current, segments)[index];
            start = segment.start;
            current = segment.length;
            round += 1;
        }
    }

    /// Compare two local files.
    ///
    /// # Errors
    ///
    /// See [`locate`](Self::locate); also fails if either file cannot be
    /// read.
    pub fn locate_files(&self, source: &Path, target: &Path) -> Result<Option<u64>> {
        let source = self.file_checker(source);
        let target = self.file_checker(target);
        self.locate(&source, &target)
    }

    /// File checker sharing this locator's buffer size and cancellation.
    #[must_use]
    pub fn file_checker(&self, path: &Path) -> FileHashChecker {
        let hasher = HierarchicalHasher::with_config(HasherConfig {
            read_buffer_size: self.config.read_buffer_size,
        })
        .with_cancellation(self.cancel.clone());
        FileHashChecker::new(path)
            .with_mode(HashMode::RandomAccess)
            .with_hasher(hasher)
    }
}

fn join<T>(handle: thread::ScopedJoinHandle<'_, T>) -> T {
    handle
        .join()
        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
}

fn checked_shape(hashes: Vec<SegmentHash>, parts: usize) -> Result<Vec<SegmentHash>> {
    if hashes.len() == parts + 1 {
        Ok(hashes)
    } else {
        Err(ForkpointError::DigestMismatch {
            expected: parts + 1,
            actual: hashes.len(),
        })
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::checker::StreamHashChecker;
    use proptest::prelude::*;
    use std::io::Cursor;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        /// The search reports no divergence exactly when the copies are equal
        #[test]
        fn none_iff_identical(
            data in prop::collection::vec(any::<u8>(), 1..2048),
            offset in any::<prop::sample::Index>(),
            flip in 1u8..=255,
            mutate in any::<bool>()
        ) {
            let mut target = data.clone();
            let at = offset.index(data.len());
            if mutate {
                target[at] ^= flip;
            }
            let source = StreamHashChecker::new(Cursor::new(data));
            let checker = StreamHashChecker::new(Cursor::new(target));
            let found = DivergenceLocator::new().locate(&source, &checker).unwrap();
            if mutate {
                prop_assert_eq!(found, Some(at as u64));
            } else {
                prop_assert_eq!(found, None);
            }
        }
    }
}
