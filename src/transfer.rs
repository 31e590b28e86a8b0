//! Server side of the resumable transfer contract.
//!
//! A [`TransferServer`] answers "bump" negotiations by resizing the target,
//! hashing the requested range and reporting completion, and accepts raw
//! bytes for the full stream, its remainder, or an arbitrary segment.
//! Targets come from an injected [`TargetStreamFactory`]; completion is
//! reported to an injected [`UploadCompleted`] collaborator.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::checker::{MultipartHashChecker, StreamHashChecker};
use crate::error::{ForkpointError, Result};
use crate::hierarchy::HierarchicalHasher;
use crate::model::{StreamStatus, SubstreamDetails};

/// A target object the server writes into and hashes.
pub trait TargetStream: Read + Write + Seek + Send {
    /// Extend or truncate to `length` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the target cannot be resized.
    fn set_len(&mut self, length: u64) -> Result<()>;
}

impl TargetStream for File {
    fn set_len(&mut self, length: u64) -> Result<()> {
        File::set_len(self, length)?;
        Ok(())
    }
}

impl TargetStream for Cursor<Vec<u8>> {
    fn set_len(&mut self, length: u64) -> Result<()> {
        let length = usize::try_from(length)
            .map_err(|_| ForkpointError::InvalidArgument(format!("length {length} too large")))?;
        self.get_mut().resize(length, 0);
        Ok(())
    }
}

/// Opens targets keyed by `(partition, id)`.
pub trait TargetStreamFactory: Send + Sync {
    /// Open (creating if needed) the target for `id` in `partition`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the target cannot be opened.
    fn open(&self, partition: &str, id: &str) -> Result<Box<dyn TargetStream>>;
}

/// Notified when a target holds exactly the described stream.
pub trait UploadCompleted: Send + Sync {
    /// Called once a bump finds the target complete.
    ///
    /// # Errors
    ///
    /// Errors propagate to the bump caller.
    fn upload_completed(&self, partition: &str, id: &str) -> Result<()>;
}

impl<F> UploadCompleted for F
where
    F: Fn(&str, &str) -> Result<()> + Send + Sync,
{
    fn upload_completed(&self, partition: &str, id: &str) -> Result<()> {
        self(partition, id)
    }
}

/// How incoming bytes are placed in the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadMode {
    /// Write from offset 0 and truncate to what was written.
    Full,
    /// Write from the offset and truncate after the written bytes.
    Remaining,
    /// Write at the offset; the rest of the target is untouched.
    Segment,
}

/// Negotiation and upload endpoints over injected collaborators.
#[derive(Clone)]
pub struct TransferServer {
    factory: Arc<dyn TargetStreamFactory>,
    completed: Arc<dyn UploadCompleted>,
    hasher: HierarchicalHasher,
}

impl TransferServer {
    /// Server over `factory`, reporting completion to `completed`.
    pub fn new(
        factory: impl TargetStreamFactory + 'static,
        completed: impl UploadCompleted + 'static,
    ) -> Self {
        Self {
            factory: Arc::new(factory),
            completed: Arc::new(completed),
            hasher: HierarchicalHasher::new(),
        }
    }

    /// Use a configured hasher for target digests.
    #[must_use]
    pub fn with_hasher(mut self, hasher: HierarchicalHasher) -> Self {
        self.hasher = hasher;
        self
    }

    /// Answer a negotiation.
    ///
    /// Resizes the target to the descriptor's length, fills the target
    /// digests for the range the source asked about and invokes the
    /// completion callback when the target matches the source exactly.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the status carries no source details
    /// or a range outside the descriptor, `UnsupportedAlgorithm` for an
    /// unknown algorithm, or any error of the target or the callback.
    pub fn bump(&self, partition: &str, mut status: StreamStatus) -> Result<StreamStatus> {
        let descriptor = &status.descriptor;
        let algorithm = descriptor.algorithm()?;
        let source = status.source.as_ref().ok_or_else(|| {
            ForkpointError::InvalidArgument("bump without source details".to_string())
        })?;
        let in_range = source
            .start
            .checked_add(source.length)
            .is_some_and(|end| end <= descriptor.length);
        if !in_range {
            return Err(ForkpointError::InvalidArgument(format!(
                "range {}+{} exceeds length {}",
                source.start, source.length, descriptor.length
            )));
        }
        let part_count = source.hashes.len().saturating_sub(1).max(2);
        debug!(
            partition,
            id = %descriptor.id,
            start = source.start,
            length = source.length,
            part_count,
            "bump"
        );

        let mut target = self.factory.open(partition, &descriptor.id)?;
        target.set_len(descriptor.length)?;
        let checker = StreamHashChecker::new(target).with_hasher(self.hasher.clone());
        let hashes = checker.hashes(source.start, source.length, part_count, algorithm)?;

        status.target = Some(SubstreamDetails::with_hashes(
            source.start,
            source.length,
            algorithm,
            hashes,
        ));
        if status.is_complete() {
            info!(partition, id = %status.descriptor.id, "upload completed");
            self.completed
                .upload_completed(partition, &status.descriptor.id)?;
        }
        Ok(status)
    }

    /// Current length of a target.
    ///
    /// # Errors
    ///
    /// Returns an error if the target cannot be opened.
    pub fn length(&self, partition: &str, id: &str) -> Result<u64> {
        let mut target = self.factory.open(partition, id)?;
        Ok(target.seek(SeekFrom::End(0))?)
    }

    /// Replace the target with the bytes of `reader`.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or writing fails.
    pub fn upload_full(&self, partition: &str, id: &str, reader: impl Read) -> Result<u64> {
        self.upload(UploadMode::Full, partition, id, 0, reader)
    }

    /// Write `reader` from `offset` and drop anything after it.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or writing fails.
    pub fn upload_remaining(
        &self,
        partition: &str,
        id: &str,
        offset: u64,
        reader: impl Read,
    ) -> Result<u64> {
        self.upload(UploadMode::Remaining, partition, id, offset, reader)
    }

    /// Write `reader` at `offset`, leaving the rest of the target in place.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or writing fails.
    pub fn upload_segment(
        &self,
        partition: &str,
        id: &str,
        offset: u64,
        reader: impl Read,
    ) -> Result<u64> {
        self.upload(UploadMode::Segment, partition, id, offset, reader)
    }

    /// Copy `reader` into the target according to `mode`; returns the
    /// number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or writing fails.
    pub fn upload(
        &self,
        mode: UploadMode,
        partition: &str,
        id: &str,
        offset: u64,
        mut reader: impl Read,
    ) -> Result<u64> {
        let offset = match mode {
            UploadMode::Full => 0,
            UploadMode::Remaining | UploadMode::Segment => offset,
        };
        let mut target = self.factory.open(partition, id)?;
        target.seek(SeekFrom::Start(offset))?;
        let written = io::copy(&mut reader, &mut target)?;
        if mode != UploadMode::Segment {
            target.set_len(offset + written)?;
        }
        target.flush()?;
        debug!(partition, id, ?mode, offset, written, "upload");
        Ok(written)
    }
}

impl fmt::Debug for TransferServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferServer")
            .field("hasher", &self.hasher)
            .finish_non_exhaustive()
    }
}

/// Reject keys that are not a single plain path component.
fn validate_component(kind: &str, value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value != "."
        && value != ".."
        && !value.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(ForkpointError::InvalidArgument(format!("invalid {kind}: {value:?}")))
    }
}

/// Stores targets as files under `root/partition/id`.
#[derive(Debug, Clone)]
pub struct FsTargetFactory {
    root: PathBuf,
}

impl FsTargetFactory {
    /// Factory rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Where the target for `(partition, id)` lives.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if either key is not a plain file name.
    pub fn path_of(&self, partition: &str, id: &str) -> Result<PathBuf> {
        validate_component("partition", partition)?;
        validate_component("id", id)?;
        Ok(self.root.join(partition).join(id))
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl TargetStreamFactory for FsTargetFactory {
    fn open(&self, partition: &str, id: &str) -> Result<Box<dyn TargetStream>> {
        let path = self.path_of(partition, id)?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Box::new(file))
    }
}

/// Shared in-memory target; every handle sees the same bytes.
#[derive(Debug, Clone)]
pub struct MemoryTarget {
    bytes: Arc<Mutex<Vec<u8>>>,
    position: u64,
}

impl Read for MemoryTarget {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let bytes = self.bytes.lock();
        let start = usize::try_from(self.position).unwrap_or(usize::MAX).min(bytes.len());
        let n = buf.len().min(bytes.len() - start);
        buf[..n].copy_from_slice(&bytes[start..start + n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for MemoryTarget {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut bytes = self.bytes.lock();
        let start = usize::try_from(self.position)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "position too large"))?;
        let end = start + buf.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(buf);
        self.position = end as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryTarget {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.bytes.lock().len() as u64;
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        self.position = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start")
        })?;
        Ok(self.position)
    }
}

impl TargetStream for MemoryTarget {
    fn set_len(&mut self, length: u64) -> Result<()> {
        let length = usize::try_from(length)
            .map_err(|_| ForkpointError::InvalidArgument(format!("length {length} too large")))?;
        self.bytes.lock().resize(length, 0);
        Ok(())
    }
}

/// Keeps targets in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryTargetFactory {
    targets: Arc<Mutex<FxHashMap<(String, String), Arc<Mutex<Vec<u8>>>>>>,
}

impl MemoryTargetFactory {
    /// Empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a target with `bytes`.
    pub fn insert(&self, partition: &str, id: &str, bytes: Vec<u8>) {
        self.targets
            .lock()
            .insert((partition.to_string(), id.to_string()), Arc::new(Mutex::new(bytes)));
    }

    /// Snapshot of a target's bytes.
    #[must_use]
    pub fn contents(&self, partition: &str, id: &str) -> Option<Vec<u8>> {
        self.targets
            .lock()
            .get(&(partition.to_string(), id.to_string()))
            .map(|bytes| bytes.lock().clone())
    }
}

impl TargetStreamFactory for MemoryTargetFactory {
    fn open(&self, partition: &str, id: &str) -> Result<Box<dyn TargetStream>> {
        validate_component("partition", partition)?;
        validate_component("id", id)?;
        let bytes = self
            .targets
            .lock()
            .entry((partition.to_string(), id.to_string()))
            .or_default()
            .clone();
        Ok(Box::new(MemoryTarget { bytes, position: 0 }))
    }
}
