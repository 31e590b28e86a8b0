//! Client-side resumable upload.
//!
//! A push negotiates with the full digest set first. If the target is
//! already complete nothing is sent; otherwise the divergence search runs
//! against the remote target and only the bytes from the first differing
//! offset onward are uploaded.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use tracing::info;

use crate::checker::{MultipartHashChecker, StreamHashChecker};
use crate::error::Result;
use crate::hierarchy::{HasherConfig, HierarchicalHasher};
use crate::locate::DivergenceLocator;
use crate::model::{StreamDescriptor, StreamStatus, SubstreamDetails};
use crate::protocol::{RemoteHashChecker, TransferClient};
use crate::transfer::UploadMode;

/// What a push did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOutcome {
    /// Offset the upload resumed from, `None` when nothing was sent.
    pub resumed_from: Option<u64>,
    /// Bytes sent.
    pub uploaded: u64,
    /// Whether the target now matches the source.
    pub complete: bool,
}

/// Pushes streams to a target, sending only what the target lacks.
#[derive(Debug)]
pub struct ResumableUpload<C> {
    client: C,
    partition: String,
    locator: DivergenceLocator,
}

impl<C: TransferClient> ResumableUpload<C> {
    /// Uploader into `partition` with a default locator.
    pub fn new(client: C, partition: impl Into<String>) -> Self {
        Self {
            client,
            partition: partition.into(),
            locator: DivergenceLocator::new(),
        }
    }

    /// Use a configured locator (fan-out, algorithm, cancellation).
    #[must_use]
    pub fn with_locator(mut self, locator: DivergenceLocator) -> Self {
        self.locator = locator;
        self
    }

    /// Push the file at `path` as `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or any exchange fails.
    pub fn push_file(&self, path: &Path, id: &str) -> Result<UploadOutcome> {
        self.push(id, File::open(path)?)
    }

    /// Push `source` as `id`.
    ///
    /// # Errors
    ///
    /// Returns `Client` errors from the exchange, `Cancelled` if the
    /// locator is cancelled, or any I/O error of `source`.
    pub fn push<S: Read + Seek + Send>(&self, id: &str, source: S) -> Result<UploadOutcome> {
        let config = self.locator.config();
        let algorithm = config.algorithm;
        let hasher = HierarchicalHasher::with_config(HasherConfig {
            read_buffer_size: config.read_buffer_size,
        })
        .with_cancellation(self.locator.cancellation().clone());
        let checker = StreamHashChecker::new(source).with_hasher(hasher);

        let length = checker.length()?.unwrap_or_default();
        let descriptor = StreamDescriptor::new(id, length, algorithm);
        let parts = (config.fan_out as u64).min(length).max(2) as usize;
        let hashes = checker.hashes(0, length, parts, algorithm)?;
        let status = StreamStatus::new(
            descriptor.clone(),
            SubstreamDetails::with_hashes(0, length, algorithm, hashes.clone()),
        );

        if self.client.bump(&self.partition, status)?.is_complete() {
            info!(id, length, "target already complete");
            return Ok(UploadOutcome {
                resumed_from: None,
                uploaded: 0,
                complete: true,
            });
        }

        let remote =
            RemoteHashChecker::new(&self.client, self.partition.clone(), descriptor.clone());
        let Some(offset) = self.locator.locate(&checker, &remote)? else {
            return Ok(UploadOutcome {
                resumed_from: None,
                uploaded: 0,
                complete: false,
            });
        };

        let mut source = checker.into_inner();
        source.seek(SeekFrom::Start(offset))?;
        let uploaded = self.client.upload(
            UploadMode::Remaining,
            &self.partition,
            id,
            offset,
            &mut source,
        )?;
        info!(id, offset, uploaded, "resumed upload");

        let confirm = StreamStatus::new(
            descriptor,
            SubstreamDetails::with_hashes(0, length, algorithm, hashes),
        );
        let complete = self.client.bump(&self.partition, confirm)?.is_complete();
        Ok(UploadOutcome {
            resumed_from: Some(offset),
            uploaded,
            complete,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ForkpointError;
    use crate::transfer::{MemoryTargetFactory, TransferServer};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn server() -> (TransferServer, MemoryTargetFactory, Arc<AtomicUsize>) {
        let factory = MemoryTargetFactory::new();
        let completions = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&completions);
        let completed = move |_: &str, _: &str| -> Result<()> {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };
        let server = TransferServer::new(factory.clone(), completed);
        (server, factory, completions)
    }

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 13 % 241 + 1) as u8).collect()
    }

    #[test]
    fn fresh_target_receives_everything() {
        let (server, factory, completions) = server();
        let source = data(30_000);
        let outcome = ResumableUpload::new(&server, "p")
            .push("blob", Cursor::new(source.clone()))
            .unwrap();

        assert_eq!(outcome.resumed_from, Some(0));
        assert_eq!(outcome.uploaded, 30_000);
        assert!(outcome.complete);
        assert_eq!(factory.contents("p", "blob").unwrap(), source);
        assert_eq!(completions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn partial_target_resumes_at_divergence() {
        let (server, factory, _) = server();
        let source = data(30_000);
        factory.insert("p", "blob", source[..21_000].to_vec());

        let outcome = ResumableUpload::new(&server, "p")
            .push("blob", Cursor::new(source.clone()))
            .unwrap();

        assert_eq!(outcome.resumed_from, Some(21_000));
        assert_eq!(outcome.uploaded, 9_000);
        assert!(outcome.complete);
        assert_eq!(factory.contents("p", "blob").unwrap(), source);
    }

    #[test]
    fn complete_target_sends_nothing() {
        let (server, factory, completions) = server();
        let source = data(5_000);
        factory.insert("p", "blob", source.clone());

        let outcome = ResumableUpload::new(&server, "p")
            .push("blob", Cursor::new(source))
            .unwrap();

        assert_eq!(outcome.resumed_from, None);
        assert!(outcome.complete);
        assert_eq!(completions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_source() {
        let (server, factory, _) = server();
        factory.insert("p", "blob", b"stale".to_vec());
        let outcome = ResumableUpload::new(&server, "p")
            .push("blob", Cursor::new(Vec::new()))
            .unwrap();
        assert!(outcome.complete);
        assert_eq!(factory.contents("p", "blob").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn push_file_from_disk() {
        let (server, factory, _) = server();
        let source = data(12_345);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, &source).unwrap();

        let outcome = ResumableUpload::new(&server, "p")
            .push_file(file.path(), "disk.bin")
            .unwrap();
        assert!(outcome.complete);
        assert_eq!(factory.contents("p", "disk.bin").unwrap(), source);
    }

    #[test]
    fn invalid_id_is_rejected() {
        let (server, _, _) = server();
        let err = ResumableUpload::new(&server, "p")
            .push("../x", Cursor::new(data(10)))
            .unwrap_err();
        assert!(matches!(err, ForkpointError::InvalidArgument(_)));
    }
}
