//! Digest sets over local or remote data.
//!
//! A [`MultipartHashChecker`] answers two questions about one copy of a
//! stream: how long it is, and what the digest set of a given range is.
//! The divergence search only ever talks to this trait.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::eventing::EventingSource;
use crate::hash::HashAlgorithm;
use crate::hierarchy::HierarchicalHasher;
use crate::model::SegmentHash;

/// Length and range digests of one copy of a stream.
pub trait MultipartHashChecker: Send + Sync {
    /// Total length, `None` when it cannot be known up front.
    ///
    /// # Errors
    ///
    /// Returns an error if the length cannot be queried.
    fn length(&self) -> Result<Option<u64>>;

    /// Digest set `[whole, part 0, .., part P-1]` of
    /// `[start, start + byte_count)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the data cannot be read or the arguments are
    /// invalid.
    fn hashes(
        &self,
        start: u64,
        byte_count: u64,
        part_count: usize,
        algorithm: HashAlgorithm,
    ) -> Result<Vec<SegmentHash>>;
}

impl<T: MultipartHashChecker + ?Sized> MultipartHashChecker for &T {
    fn length(&self) -> Result<Option<u64>> {
        (**self).length()
    }

    fn hashes(
        &self,
        start: u64,
        byte_count: u64,
        part_count: usize,
        algorithm: HashAlgorithm,
    ) -> Result<Vec<SegmentHash>> {
        (**self).hashes(start, byte_count, part_count, algorithm)
    }
}

impl<T: MultipartHashChecker + ?Sized> MultipartHashChecker for Arc<T> {
    fn length(&self) -> Result<Option<u64>> {
        (**self).length()
    }

    fn hashes(
        &self,
        start: u64,
        byte_count: u64,
        part_count: usize,
        algorithm: HashAlgorithm,
    ) -> Result<Vec<SegmentHash>> {
        (**self).hashes(start, byte_count, part_count, algorithm)
    }
}

impl<T: MultipartHashChecker + ?Sized> MultipartHashChecker for Box<T> {
    fn length(&self) -> Result<Option<u64>> {
        (**self).length()
    }

    fn hashes(
        &self,
        start: u64,
        byte_count: u64,
        part_count: usize,
        algorithm: HashAlgorithm,
    ) -> Result<Vec<SegmentHash>> {
        (**self).hashes(start, byte_count, part_count, algorithm)
    }
}

/// How a local checker computes digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashMode {
    /// Seek to each range and hash it directly.
    #[default]
    RandomAccess,
    /// One forward pass through nested taps.
    Tapped,
}

/// Checker over a named file, opened for every call.
#[derive(Debug, Clone)]
pub struct FileHashChecker {
    path: PathBuf,
    mode: HashMode,
    hasher: HierarchicalHasher,
}

impl FileHashChecker {
    /// Checker for `path` in random-access mode.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mode: HashMode::default(),
            hasher: HierarchicalHasher::new(),
        }
    }

    /// Select the hashing mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: HashMode) -> Self {
        self.mode = mode;
        self
    }

    /// Use a configured hasher (buffer size, cancellation).
    #[must_use]
    pub fn with_hasher(mut self, hasher: HierarchicalHasher) -> Self {
        self.hasher = hasher;
        self
    }

    /// The file being checked.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MultipartHashChecker for FileHashChecker {
    fn length(&self) -> Result<Option<u64>> {
        Ok(Some(std::fs::metadata(&self.path)?.len()))
    }

    fn hashes(
        &self,
        start: u64,
        byte_count: u64,
        part_count: usize,
        algorithm: HashAlgorithm,
    ) -> Result<Vec<SegmentHash>> {
        match self.mode {
            HashMode::RandomAccess => {
                self.hasher
                    .hash_file(&self.path, start, byte_count, part_count, algorithm)
            }
            HashMode::Tapped => {
                let mut file = File::open(&self.path)?;
                hash_tapped(&self.hasher, &mut file, start, byte_count, part_count, algorithm)
            }
        }
    }
}

/// Checker over an already-open stream, reusable across calls.
///
/// The stream is rewound as needed for every call; [`into_inner`] hands it
/// back to the owner when the checker is done.
///
/// [`into_inner`]: StreamHashChecker::into_inner
#[derive(Debug)]
pub struct StreamHashChecker<S> {
    stream: Mutex<S>,
    mode: HashMode,
    hasher: HierarchicalHasher,
}

impl<S> StreamHashChecker<S> {
    /// Checker over `stream` in random-access mode.
    #[must_use]
    pub fn new(stream: S) -> Self {
        Self {
            stream: Mutex::new(stream),
            mode: HashMode::default(),
            hasher: HierarchicalHasher::new(),
        }
    }

    /// Select the hashing mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: HashMode) -> Self {
        self.mode = mode;
        self
    }

    /// Use a configured hasher (buffer size, cancellation).
    #[must_use]
    pub fn with_hasher(mut self, hasher: HierarchicalHasher) -> Self {
        self.hasher = hasher;
        self
    }

    /// Give the stream back.
    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }
}

impl<S: Read + Seek + Send> MultipartHashChecker for StreamHashChecker<S> {
    fn length(&self) -> Result<Option<u64>> {
        let mut stream = self.stream.lock();
        let position = stream.stream_position()?;
        let length = stream.seek(SeekFrom::End(0))?;
        stream.seek(SeekFrom::Start(position))?;
        Ok(Some(length))
    }

    fn hashes(
        &self,
        start: u64,
        byte_count: u64,
        part_count: usize,
        algorithm: HashAlgorithm,
    ) -> Result<Vec<SegmentHash>> {
        let mut stream = self.stream.lock();
        match self.mode {
            HashMode::RandomAccess => self.hasher.hash_random_access(
                &mut *stream,
                start,
                byte_count,
                part_count,
                algorithm,
            ),
            HashMode::Tapped => hash_tapped(
                &self.hasher,
                &mut *stream,
                start,
                byte_count,
                part_count,
                algorithm,
            ),
        }
    }
}

/// Position `stream` at `start` and hash in a single tapped pass.
fn hash_tapped<S: Read + Seek + Send>(
    hasher: &HierarchicalHasher,
    stream: &mut S,
    start: u64,
    byte_count: u64,
    part_count: usize,
    algorithm: HashAlgorithm,
) -> Result<Vec<SegmentHash>> {
    stream.seek(SeekFrom::Start(start))?;
    let source = EventingSource::measured(stream)?;
    hasher.hash_eventing(&source, start, byte_count, part_count, algorithm)
}
