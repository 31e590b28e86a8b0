//! Async divergence search and hashing using tokio.
//!
//! The locator itself blocks on I/O and on tap readers, so the async
//! versions run it on tokio's blocking pool. [`AsyncLocator::hash_reader`]
//! goes further: the async task drives an `AsyncRead` forward and
//! publishes each chunk to the tap tree while the digest workers drain
//! their taps on blocking threads.

#[cfg(feature = "async")]
use std::path::Path;
#[cfg(feature = "async")]
use std::sync::Arc;
#[cfg(feature = "async")]
use std::time::Duration;

#[cfg(feature = "async")]
use tokio::io::{AsyncRead, AsyncReadExt};
#[cfg(feature = "async")]
use tokio::task::JoinError;

#[cfg(feature = "async")]
use crate::cancel::Cancellation;
#[cfg(feature = "async")]
use crate::checker::MultipartHashChecker;
#[cfg(feature = "async")]
use crate::error::{ForkpointError, Result};
#[cfg(feature = "async")]
use crate::eventing::{ReadNotification, SourceHub, Tappable};
#[cfg(feature = "async")]
use crate::hash::HashAlgorithm;
#[cfg(feature = "async")]
use crate::hierarchy::{HasherConfig, HierarchicalHasher};
use crate::locate::DivergenceLocator;
#[cfg(feature = "async")]
use crate::model::SegmentHash;
#[cfg(feature = "async")]
use crate::tap::WindowedTap;
#[cfg(feature = "async")]
use crate::{hierarchy, partition};

/// How often a pending read re-checks the cancellation token.
#[cfg(feature = "async")]
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Async front end of [`DivergenceLocator`].
#[derive(Debug, Clone, Default)]
pub struct AsyncLocator {
    locator: DivergenceLocator,
}

impl AsyncLocator {
    /// Locator with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a configured locator.
    #[must_use]
    pub const fn from_locator(locator: DivergenceLocator) -> Self {
        Self { locator }
    }

    /// The wrapped blocking locator.
    #[must_use]
    pub const fn locator(&self) -> &DivergenceLocator {
        &self.locator
    }

    #[cfg(feature = "async")]
    fn hasher(&self) -> HierarchicalHasher {
        HierarchicalHasher::with_config(HasherConfig {
            read_buffer_size: self.locator.config().read_buffer_size,
        })
        .with_cancellation(self.locator.cancellation().clone())
    }

    /// Search for the first differing byte on the blocking pool.
    ///
    /// # Errors
    ///
    /// See [`DivergenceLocator::locate`].
    #[cfg(feature = "async")]
    pub async fn locate<S, T>(&self, source: Arc<S>, target: Arc<T>) -> Result<Option<u64>>
    where
        S: MultipartHashChecker + ?Sized + 'static,
        T: MultipartHashChecker + ?Sized + 'static,
    {
        let locator = self.locator.clone();
        tokio::task::spawn_blocking(move || locator.locate(&*source, &*target))
            .await
            .map_err(join_error)?
    }

    /// Compare two local files on the blocking pool.
    ///
    /// # Errors
    ///
    /// See [`DivergenceLocator::locate_files`].
    #[cfg(feature = "async")]
    pub async fn locate_files<P1, P2>(&self, source: P1, target: P2) -> Result<Option<u64>>
    where
        P1: AsRef<Path>,
        P2: AsRef<Path>,
    {
        let source = source.as_ref().to_path_buf();
        let target = target.as_ref().to_path_buf();
        let locator = self.locator.clone();
        tokio::task::spawn_blocking(move || locator.locate_files(&source, &target))
            .await
            .map_err(join_error)?
    }

    /// Single-pass digest set of `[start, start + byte_count)` of an async
    /// reader positioned at 0.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for fewer than two parts, `Cancelled` if
    /// cancelled, or any I/O error of the reader.
    #[cfg(feature = "async")]
    pub async fn hash_reader<R>(
        &self,
        mut reader: R,
        start: u64,
        byte_count: u64,
        part_count: usize,
        algorithm: HashAlgorithm,
    ) -> Result<Vec<SegmentHash>>
    where
        R: AsyncRead + Unpin,
    {
        let end = hierarchy::validate(start, byte_count, part_count)?;
        let hasher = self.hasher();
        hasher.cancellation().check()?;

        let hub = Arc::new(SourceHub::new(None));
        let point: Arc<dyn Tappable> = hub.clone();
        let segments = partition::split(start, byte_count, part_count as u64);
        let taps: Vec<_> = hierarchy::attach_taps(&point, start, byte_count, &segments)
            .into_iter()
            .map(Arc::new)
            .collect();

        let workers: Vec<_> = taps
            .iter()
            .map(|tap| {
                let tap = Arc::clone(tap);
                let hasher = hasher.clone();
                tokio::task::spawn_blocking(move || hasher.hash_tap(&tap, algorithm))
            })
            .collect();

        // Dropping this future at any await point must still release the
        // workers parked on their taps.
        let mut guard = AbortOnDrop {
            taps: &taps,
            armed: true,
        };
        let driven = drive(&hub, &mut reader, end, &hasher).await;
        if driven.is_ok() {
            hub.signal_end();
            guard.armed = false;
        }
        drop(guard);

        let mut results = Vec::with_capacity(workers.len());
        for worker in workers {
            results.push(worker.await.map_err(join_error)?);
        }
        driven?;
        let digests = results.into_iter().collect::<Result<Vec<String>>>()?;
        Ok(hierarchy::assemble(start, byte_count, &segments, digests))
    }
}

#[cfg(feature = "async")]
async fn drive<R: AsyncRead + Unpin>(
    hub: &SourceHub,
    reader: &mut R,
    end: u64,
    hasher: &HierarchicalHasher,
) -> Result<()> {
    let mut buffer = vec![0u8; hasher.config().read_buffer_size];
    loop {
        hasher.cancellation().check()?;
        let position = hub.position();
        if position >= end {
            return Ok(());
        }
        let want = usize::try_from(end - position)
            .unwrap_or(usize::MAX)
            .min(buffer.len());
        let n = tokio::select! {
            read = reader.read(&mut buffer[..want]) => read?,
            () = cancelled(hasher.cancellation()) => return Err(ForkpointError::Cancelled),
        };
        if n == 0 {
            return Ok(());
        }
        hub.publish_read(&ReadNotification::new(position, &buffer[..n]));
    }
}

/// Resolves once `cancel` fires.
#[cfg(feature = "async")]
async fn cancelled(cancel: &Cancellation) {
    while !cancel.is_cancelled() {
        tokio::time::sleep(CANCEL_POLL_INTERVAL).await;
    }
}

/// Aborts every tap when dropped while armed.
#[cfg(feature = "async")]
struct AbortOnDrop<'a> {
    taps: &'a [Arc<WindowedTap>],
    armed: bool,
}

#[cfg(feature = "async")]
impl Drop for AbortOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.taps.iter().for_each(|tap| tap.abort());
        }
    }
}

#[cfg(feature = "async")]
fn join_error(err: JoinError) -> ForkpointError {
    if err.is_panic() {
        std::panic::resume_unwind(err.into_panic());
    }
    ForkpointError::Cancelled
}

#[cfg(all(test, feature = "async"))]
mod async_tests {
    use super::*;
    use crate::checker::StreamHashChecker;
    use crate::locate::LocatorBuilder;
    use std::io::Cursor;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Instant;
    use tokio::io::ReadBuf;

    /// Yields `prefix` bytes, then never completes another read.
    struct Stall {
        prefix: usize,
    }

    impl AsyncRead for Stall {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if self.prefix == 0 {
                return Poll::Pending;
            }
            let n = self.prefix.min(buf.remaining());
            buf.put_slice(&vec![7u8; n]);
            self.prefix -= n;
            Poll::Ready(Ok(()))
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 17 % 239) as u8).collect()
    }

    #[tokio::test]
    async fn locate_on_blocking_pool() {
        let data = pattern(10_240);
        let mut changed = data.clone();
        changed[4_321] ^= 1;
        let source = Arc::new(StreamHashChecker::new(Cursor::new(data)));
        let target = Arc::new(StreamHashChecker::new(Cursor::new(changed)));

        let found = AsyncLocator::new().locate(source, target).await.unwrap();
        assert_eq!(found, Some(4_321));
    }

    #[tokio::test]
    async fn locate_files_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("same");
        tokio::fs::write(&path, pattern(3_000)).await.unwrap();

        let found = AsyncLocator::new().locate_files(&path, &path).await.unwrap();
        assert_eq!(found, None);
    }

    #[tokio::test]
    async fn hash_reader_matches_blocking_hasher() {
        let data = pattern(50_000);
        let locator = LocatorBuilder::new().read_buffer_size(4096).build();
        let async_digests = AsyncLocator::from_locator(locator)
            .hash_reader(&data[..], 1_000, 40_000, 5, HashAlgorithm::Sha256)
            .await
            .unwrap();
        let blocking = HierarchicalHasher::new()
            .hash_random_access(&mut Cursor::new(&data), 1_000, 40_000, 5, HashAlgorithm::Sha256)
            .unwrap();
        assert_eq!(async_digests, blocking);
    }

    #[tokio::test]
    async fn hash_reader_short_input() {
        let data = pattern(10);
        let digests = AsyncLocator::new()
            .hash_reader(&data[..], 0, 100, 2, HashAlgorithm::Blake3)
            .await
            .unwrap();
        assert_eq!(digests[0].hash, HashAlgorithm::Blake3.digest(&data));
    }

    #[tokio::test]
    async fn hash_reader_cancelled() {
        let cancel = Cancellation::new();
        cancel.cancel();
        let locator = LocatorBuilder::new().cancellation(cancel).build();
        let err = AsyncLocator::from_locator(locator)
            .hash_reader(&b"abc"[..], 0, 3, 2, HashAlgorithm::Blake3)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn hash_reader_cancelled_while_read_pending() {
        let cancel = Cancellation::new();
        let locator = LocatorBuilder::new().cancellation(cancel.clone()).build();
        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            AsyncLocator::from_locator(locator).hash_reader(
                Stall { prefix: 10 },
                0,
                1_000,
                4,
                HashAlgorithm::Blake3,
            ),
        )
        .await
        .expect("a pending read must observe cancellation");
        trigger.await.unwrap();
        assert!(outcome.unwrap_err().is_cancelled());
    }

    #[test]
    fn dropped_hash_reader_releases_tap_workers() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();
        let outcome = rt.block_on(async {
            tokio::time::timeout(
                Duration::from_millis(100),
                AsyncLocator::new().hash_reader(
                    Stall { prefix: 10 },
                    0,
                    1_000,
                    4,
                    HashAlgorithm::Blake3,
                ),
            )
            .await
        });
        assert!(outcome.is_err());

        let started = Instant::now();
        rt.shutdown_timeout(Duration::from_secs(5));
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "tap workers still parked after the future was dropped"
        );
    }

    #[tokio::test]
    async fn hash_reader_rejects_single_part() {
        let err = AsyncLocator::new()
            .hash_reader(&b"abc"[..], 0, 3, 1, HashAlgorithm::Blake3)
            .await
            .unwrap_err();
        assert!(matches!(err, ForkpointError::InvalidArgument(_)));
    }
}
