//! Whole-range and sub-partition digests in a single pass.
//!
//! For a range `[start, start + byte_count)` split into `P` parts, the
//! hasher returns `P + 1` digests ordered `[whole, part 0, .., part P-1]`.
//!
//! The streaming path never reads a byte twice: one whole-range tap sits on
//! the root [`EventingSource`], the part taps nest on the whole-range tap,
//! `P + 1` worker threads drain the taps into digests, and the calling
//! thread is the only one that reads the source. The random-access path
//! computes the same boundaries and hashes each range by seeking, which is
//! cheaper for local files where re-reading costs nothing but page cache.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::iter;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use rayon::prelude::*;
use tracing::debug;

use crate::cancel::Cancellation;
use crate::error::{ForkpointError, Result};
use crate::eventing::{EventingSource, Tappable};
use crate::hash::HashAlgorithm;
use crate::model::SegmentHash;
use crate::partition::{self, Segment};
use crate::tap::{WindowSpec, WindowedTap};

/// Configuration for hierarchical hashing.
#[derive(Debug, Clone)]
pub struct HasherConfig {
    /// Size of each forward read from the root source.
    pub read_buffer_size: usize,
}

impl Default for HasherConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 64 * 1024,
        }
    }
}

/// Computes a digest set `[whole, part 0, .., part P-1]` over a byte range.
///
/// # Example
///
/// ```rust
/// use std::io::Cursor;
/// use forkpoint::{HashAlgorithm, HierarchicalHasher};
///
/// let data = vec![7u8; 1000];
/// let hasher = HierarchicalHasher::new();
/// let digests = hasher
///     .hash_stream(Cursor::new(&data), 0, 1000, 4, HashAlgorithm::Blake3)
///     .unwrap();
///
/// assert_eq!(digests.len(), 5);
/// assert_eq!(digests[0].hash, HashAlgorithm::Blake3.digest(&data));
/// assert_eq!(digests[1].hash, HashAlgorithm::Blake3.digest(&data[..250]));
/// ```
#[derive(Debug, Clone, Default)]
pub struct HierarchicalHasher {
    config: HasherConfig,
    cancel: Cancellation,
}

impl HierarchicalHasher {
    /// Hasher with default configuration and its own cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hasher with custom configuration.
    ///
    /// # Panics
    ///
    /// Panics if the read buffer size is zero.
    #[must_use]
    pub fn with_config(config: HasherConfig) -> Self {
        assert!(config.read_buffer_size > 0, "Read buffer size must be positive");
        Self {
            config,
            cancel: Cancellation::new(),
        }
    }

    /// Observe `cancel` instead of the hasher's own token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &HasherConfig {
        &self.config
    }

    /// The token this hasher observes.
    #[must_use]
    pub const fn cancellation(&self) -> &Cancellation {
        &self.cancel
    }

    /// Single-pass digests of a forward-only source positioned at 0.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for fewer than two parts, `Cancelled` if
    /// cancelled, or any I/O error of the source.
    pub fn hash_stream<R: Read + Send>(
        &self,
        source: R,
        start: u64,
        byte_count: u64,
        part_count: usize,
        algorithm: HashAlgorithm,
    ) -> Result<Vec<SegmentHash>> {
        let source = EventingSource::new(source);
        self.hash_eventing(&source, start, byte_count, part_count, algorithm)
    }

    /// Single-pass digests, driving an existing eventing source forward.
    ///
    /// Other subscribers of `source` observe the same pass.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for fewer than two parts or a source
    /// already past `start`, `Cancelled` if cancelled, or any I/O error of
    /// the source.
    pub fn hash_eventing<S: Read + Send>(
        &self,
        source: &EventingSource<S>,
        start: u64,
        byte_count: u64,
        part_count: usize,
        algorithm: HashAlgorithm,
    ) -> Result<Vec<SegmentHash>> {
        let end = validate(start, byte_count, part_count)?;
        if source.position() > start {
            return Err(ForkpointError::InvalidArgument(format!(
                "source is at {} which is past the range start {start}",
                source.position()
            )));
        }
        self.cancel.check()?;

        debug!(start, byte_count, part_count, %algorithm, "single-pass hierarchical hash");

        let segments = partition::split(start, byte_count, part_count as u64);
        let taps = attach_taps(&source.tap_point(), start, byte_count, &segments);

        let digests = thread::scope(|scope| {
            let workers: Vec<_> = taps
                .iter()
                .map(|tap| scope.spawn(move || self.hash_tap(tap, algorithm)))
                .collect();

            let driven = self.drive(source, end);
            match &driven {
                Ok(()) => source.signal_end(),
                Err(_) => taps.iter().for_each(|tap| tap.abort()),
            }

            let results: Vec<Result<String>> = workers
                .into_iter()
                .map(|worker| {
                    worker
                        .join()
                        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
                })
                .collect();

            driven?;
            results.into_iter().collect::<Result<Vec<String>>>()
        })?;

        Ok(assemble(start, byte_count, &segments, digests))
    }

    /// Digests by direct indexed reads; no taps involved.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for fewer than two parts, `Cancelled` if
    /// cancelled, or any I/O error of the source.
    pub fn hash_random_access<R: Read + Seek>(
        &self,
        source: &mut R,
        start: u64,
        byte_count: u64,
        part_count: usize,
        algorithm: HashAlgorithm,
    ) -> Result<Vec<SegmentHash>> {
        validate(start, byte_count, part_count)?;
        debug!(start, byte_count, part_count, %algorithm, "random-access hierarchical hash");

        let segments = partition::split(start, byte_count, part_count as u64);
        let ranges = iter::once(Segment {
            start,
            length: byte_count,
        })
        .chain(segments.iter().copied());

        let mut digests = Vec::with_capacity(part_count + 1);
        for range in ranges {
            self.cancel.check()?;
            digests.push(hash_range(source, range, algorithm)?);
        }

        Ok(assemble(start, byte_count, &segments, digests))
    }

    /// Digests of a named file, each range hashed in parallel through its
    /// own handle.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for fewer than two parts, `Cancelled` if
    /// cancelled, or any I/O error opening or reading the file.
    pub fn hash_file(
        &self,
        path: &Path,
        start: u64,
        byte_count: u64,
        part_count: usize,
        algorithm: HashAlgorithm,
    ) -> Result<Vec<SegmentHash>> {
        validate(start, byte_count, part_count)?;
        debug!(path = %path.display(), start, byte_count, part_count, %algorithm, "parallel file hash");

        let segments = partition::split(start, byte_count, part_count as u64);
        let ranges: Vec<Segment> = iter::once(Segment {
            start,
            length: byte_count,
        })
        .chain(segments.iter().copied())
        .collect();

        let digests = ranges
            .par_iter()
            .map(|range| {
                self.cancel.check()?;
                let mut file = File::open(path)?;
                hash_range(&mut file, *range, algorithm)
            })
            .collect::<Result<Vec<String>>>()?;

        Ok(assemble(start, byte_count, &segments, digests))
    }

    /// Drain `tap` into a digest.
    pub(crate) fn hash_tap(&self, tap: &WindowedTap, algorithm: HashAlgorithm) -> Result<String> {
        self.cancel.check()?;
        let mut hasher = algorithm.hasher();
        let mut buffer = vec![0u8; self.config.read_buffer_size];
        loop {
            let n = tap.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            self.cancel.check()?;
            hasher.update(&buffer[..n]);
        }
        Ok(hasher.finalize_base64())
    }

    /// Pump the root source forward until `end` or end of stream.
    fn drive<S: Read>(&self, source: &EventingSource<S>, end: u64) -> Result<()> {
        let mut buffer = vec![0u8; self.config.read_buffer_size];
        loop {
            self.cancel.check()?;
            let position = source.position();
            if position >= end {
                return Ok(());
            }
            let want = usize::try_from(end - position)
                .unwrap_or(usize::MAX)
                .min(buffer.len());
            if source.read(&mut buffer[..want])? == 0 {
                return Ok(());
            }
        }
    }
}

/// Whole-range tap on `point` followed by one tap per segment nested on it.
pub(crate) fn attach_taps(
    point: &Arc<dyn Tappable>,
    start: u64,
    byte_count: u64,
    segments: &[Segment],
) -> Vec<WindowedTap> {
    let whole = WindowedTap::attach(point, WindowSpec::new(start, byte_count));
    let whole_point = whole.tap_point();
    let parts = segments.iter().map(|segment| {
        WindowedTap::attach(
            &whole_point,
            WindowSpec::new(segment.start - start, segment.length),
        )
    });
    iter::once(whole).chain(parts).collect()
}

pub(crate) fn validate(start: u64, byte_count: u64, part_count: usize) -> Result<u64> {
    if part_count < 2 {
        return Err(ForkpointError::InvalidArgument(format!(
            "part count must be at least 2, got {part_count}"
        )));
    }
    start.checked_add(byte_count).ok_or_else(|| {
        ForkpointError::InvalidArgument(format!(
            "range {start}+{byte_count} overflows"
        ))
    })
}

fn hash_range<R: Read + Seek>(
    source: &mut R,
    range: Segment,
    algorithm: HashAlgorithm,
) -> Result<String> {
    source.seek(SeekFrom::Start(range.start))?;
    let mut limited = source.take(range.length);
    Ok(algorithm.digest_reader(&mut limited)?)
}

pub(crate) fn assemble(
    start: u64,
    byte_count: u64,
    segments: &[Segment],
    digests: Vec<String>,
) -> Vec<SegmentHash> {
    iter::once((start, byte_count))
        .chain(segments.iter().map(|s| (s.start, s.length)))
        .zip(digests)
        .map(|((start, length), hash)| SegmentHash {
            start,
            length,
            hash,
        })
        .collect()
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Partitioning never alters the whole-range digest
        #[test]
        fn whole_digest_independent_of_parts(
            data in prop::collection::vec(any::<u8>(), 0..3000),
            parts in 2usize..9
        ) {
            let digests = HierarchicalHasher::new()
                .hash_stream(Cursor::new(&data), 0, data.len() as u64, parts, HashAlgorithm::Blake3)
                .unwrap();
            prop_assert_eq!(&digests[0].hash, &HashAlgorithm::Blake3.digest(&data));
            prop_assert_eq!(digests.len(), parts + 1);
        }
    }
}
