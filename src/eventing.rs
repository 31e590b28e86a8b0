//! Byte sources that announce every completed read and write.
//!
//! An [`EventingSource`] wraps any reader/writer and, right after each
//! buffer-based operation completes, publishes a notification carrying the
//! affected byte range and the bytes themselves. Subscribers (typically
//! [`WindowedTap`](crate::WindowedTap)s) observe a single forward pass
//! without pulling from the source themselves.
//!
//! The shared half of a source lives in a [`SourceHub`]: current position,
//! known length and the subscriber registries. Taps hold the hub through
//! the [`Tappable`] capability trait, which taps implement as well, so
//! windows nest to any depth.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ForkpointError, Result};

/// A completed buffer read.
///
/// `actual == 0` is the end-of-stream signal: the source is exhausted (or
/// the driver declared its logical range finished).
#[derive(Debug, Clone, Copy)]
pub struct ReadNotification<'a> {
    /// Position before the read.
    pub position_before: u64,
    /// Position after the read.
    pub position_after: u64,
    /// Buffer handed to the read.
    pub buffer: &'a [u8],
    /// Offset of the filled region inside `buffer`.
    pub offset: usize,
    /// Number of bytes requested.
    pub requested: usize,
    /// Number of bytes actually read.
    pub actual: usize,
}

impl<'a> ReadNotification<'a> {
    /// Notification for `data` read at `position`.
    #[must_use]
    pub fn new(position: u64, data: &'a [u8]) -> Self {
        Self {
            position_before: position,
            position_after: position + data.len() as u64,
            buffer: data,
            offset: 0,
            requested: data.len(),
            actual: data.len(),
        }
    }

    /// End-of-stream signal at `position`.
    #[must_use]
    pub const fn end_of_stream(position: u64) -> ReadNotification<'static> {
        ReadNotification {
            position_before: position,
            position_after: position,
            buffer: &[],
            offset: 0,
            requested: 0,
            actual: 0,
        }
    }

    /// The bytes that were read.
    #[must_use]
    pub fn data(&self) -> &'a [u8] {
        &self.buffer[self.offset..self.offset + self.actual]
    }

    /// Whether this is the end-of-stream signal.
    #[must_use]
    pub const fn is_end(&self) -> bool {
        self.actual == 0
    }
}

/// A completed buffer write.
#[derive(Debug, Clone, Copy)]
pub struct WriteNotification<'a> {
    /// Position before the write.
    pub position_before: u64,
    /// Position after the write.
    pub position_after: u64,
    /// Buffer handed to the write.
    pub buffer: &'a [u8],
    /// Offset of the written region inside `buffer`.
    pub offset: usize,
    /// Number of bytes offered.
    pub requested: usize,
    /// Number of bytes accepted.
    pub actual: usize,
}

/// Callback receiving read notifications.
pub type ReadListener = Arc<dyn Fn(&ReadNotification<'_>) + Send + Sync>;

/// Callback receiving write notifications.
pub type WriteListener = Arc<dyn Fn(&WriteNotification<'_>) + Send + Sync>;

/// Handle returned by a subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Ordered registry of listeners.
///
/// Publishing snapshots the list and calls listeners without holding the
/// registry lock, so a listener may subscribe or unsubscribe freely.
pub struct Subscribers<L> {
    entries: Mutex<Vec<(SubscriptionId, L)>>,
    next_id: AtomicU64,
}

impl<L: Clone> Subscribers<L> {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a listener.
    pub fn subscribe(&self, listener: L) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push((id, listener));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    /// Current listeners in subscription order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<L> {
        self.entries.lock().iter().map(|(_, l)| l.clone()).collect()
    }

    /// Number of listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nobody listens.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<L: Clone> Default for Subscribers<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L> fmt::Debug for Subscribers<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribers")
            .field("len", &self.entries.lock().len())
            .finish()
    }
}

/// Capability interface of anything a tap can attach to.
pub trait Tappable: Send + Sync {
    /// Position through which data has been published, in this node's
    /// own coordinates.
    fn position(&self) -> u64;

    /// Total length, when known.
    fn length(&self) -> Option<u64>;

    /// Receive every read notification published from now on.
    fn subscribe_read(&self, listener: ReadListener) -> SubscriptionId;

    /// Stop receiving read notifications.
    fn unsubscribe_read(&self, id: SubscriptionId);
}

/// Shared state of an [`EventingSource`]: position, length, listeners.
#[derive(Debug, Default)]
pub struct SourceHub {
    position: AtomicU64,
    length: Mutex<Option<u64>>,
    reads: Subscribers<ReadListener>,
    writes: Subscribers<WriteListener>,
}

impl SourceHub {
    /// Hub positioned at 0 with an optional known length.
    #[must_use]
    pub fn new(length: Option<u64>) -> Self {
        Self {
            length: Mutex::new(length),
            ..Self::default()
        }
    }

    /// Publish a read notification to every read listener.
    ///
    /// Non-empty notifications advance the hub position to
    /// `position_after`.
    pub fn publish_read(&self, notification: &ReadNotification<'_>) {
        if !notification.is_end() {
            self.position
                .store(notification.position_after, Ordering::Release);
        }
        for listener in self.reads.snapshot() {
            listener(notification);
        }
    }

    /// Publish a write notification to every write listener.
    pub fn publish_write(&self, notification: &WriteNotification<'_>) {
        self.position
            .store(notification.position_after, Ordering::Release);
        for listener in self.writes.snapshot() {
            listener(notification);
        }
    }

    /// Publish the end-of-stream signal at the current position.
    pub fn signal_end(&self) {
        self.publish_read(&ReadNotification::end_of_stream(self.position()));
    }

    /// Receive write notifications.
    pub fn subscribe_write(&self, listener: WriteListener) -> SubscriptionId {
        self.writes.subscribe(listener)
    }

    /// Stop receiving write notifications.
    pub fn unsubscribe_write(&self, id: SubscriptionId) {
        self.writes.unsubscribe(id);
    }

    /// Number of read listeners.
    #[must_use]
    pub fn read_subscribers(&self) -> usize {
        self.reads.len()
    }

    /// Replace the known length.
    pub fn set_length(&self, length: Option<u64>) {
        *self.length.lock() = length;
    }

    fn set_position(&self, position: u64) {
        self.position.store(position, Ordering::Release);
    }
}

impl Tappable for SourceHub {
    fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    fn length(&self) -> Option<u64> {
        *self.length.lock()
    }

    fn subscribe_read(&self, listener: ReadListener) -> SubscriptionId {
        self.reads.subscribe(listener)
    }

    fn unsubscribe_read(&self, id: SubscriptionId) {
        self.reads.unsubscribe(id);
    }
}

/// Wraps a byte source/sink and publishes its completed operations.
///
/// All I/O goes through `&self`, so one thread can drive the source while
/// others attach taps to [`EventingSource::tap_point`].
///
/// # Example
///
/// ```rust
/// use std::io::{Cursor, Read};
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use forkpoint::EventingSource;
///
/// let source = EventingSource::new(Cursor::new(b"hello".to_vec()));
/// let seen = Arc::new(AtomicUsize::new(0));
/// let counter = seen.clone();
/// source.subscribe_read(move |n| {
///     counter.fetch_add(n.actual, Ordering::Relaxed);
/// });
///
/// let mut buf = Vec::new();
/// (&source).read_to_end(&mut buf).unwrap();
/// assert_eq!(seen.load(Ordering::Relaxed), 5);
/// ```
pub struct EventingSource<S> {
    inner: Mutex<S>,
    hub: Arc<SourceHub>,
}

impl<S> EventingSource<S> {
    /// Wrap a source of unknown length positioned at 0.
    #[must_use]
    pub fn new(inner: S) -> Self {
        Self {
            inner: Mutex::new(inner),
            hub: Arc::new(SourceHub::new(None)),
        }
    }

    /// Wrap a source whose total length is known.
    #[must_use]
    pub fn with_length(inner: S, length: u64) -> Self {
        Self {
            inner: Mutex::new(inner),
            hub: Arc::new(SourceHub::new(Some(length))),
        }
    }

    /// The shared hub.
    #[must_use]
    pub const fn hub(&self) -> &Arc<SourceHub> {
        &self.hub
    }

    /// Attachment point for taps.
    #[must_use]
    pub fn tap_point(&self) -> Arc<dyn Tappable> {
        self.hub.clone()
    }

    /// Current position.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.hub.position()
    }

    /// Total length, when known.
    #[must_use]
    pub fn length(&self) -> Option<u64> {
        self.hub.length()
    }

    /// Subscribe a closure to read notifications.
    pub fn subscribe_read<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ReadNotification<'_>) + Send + Sync + 'static,
    {
        self.hub.subscribe_read(Arc::new(listener))
    }

    /// Remove a read subscription.
    pub fn unsubscribe_read(&self, id: SubscriptionId) {
        self.hub.unsubscribe_read(id);
    }

    /// Subscribe a closure to write notifications.
    pub fn subscribe_write<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&WriteNotification<'_>) + Send + Sync + 'static,
    {
        self.hub.subscribe_write(Arc::new(listener))
    }

    /// Remove a write subscription.
    pub fn unsubscribe_write(&self, id: SubscriptionId) {
        self.hub.unsubscribe_write(id);
    }

    /// Declare the logical end of the stream to every subscriber.
    pub fn signal_end(&self) {
        self.hub.signal_end();
    }

    /// Single-byte reads are not supported.
    ///
    /// # Errors
    ///
    /// Always returns `NotSupported`.
    pub fn read_byte(&self) -> Result<u8> {
        Err(ForkpointError::NotSupported("single-byte read"))
    }

    /// Single-byte writes are not supported.
    ///
    /// # Errors
    ///
    /// Always returns `NotSupported`.
    pub fn write_byte(&self, _byte: u8) -> Result<()> {
        Err(ForkpointError::NotSupported("single-byte write"))
    }

    /// Unwrap the source, dropping all subscriptions' feed.
    pub fn into_inner(self) -> S {
        self.inner.into_inner()
    }
}

impl<S: Seek> EventingSource<S> {
    /// Wrap a seekable source, measuring its length and current position.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if seeking fails.
    pub fn measured(mut inner: S) -> io::Result<Self> {
        let position = inner.stream_position()?;
        let length = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(position))?;
        let source = Self::with_length(inner, length);
        source.hub.set_position(position);
        Ok(source)
    }

    /// Seek the wrapped source.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if seeking fails.
    pub fn seek(&self, pos: SeekFrom) -> io::Result<u64> {
        let position = self.inner.lock().seek(pos)?;
        self.hub.set_position(position);
        Ok(position)
    }
}

impl<S: Read> EventingSource<S> {
    /// Read into `buf` and publish what was read.
    ///
    /// A zero-length result for a non-empty buffer publishes the
    /// end-of-stream signal instead of a read notification.
    ///
    /// # Errors
    ///
    /// Returns any error of the wrapped source.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let before = self.hub.position();
        let n = self.inner.lock().read(buf)?;

        if n > 0 {
            self.hub.publish_read(&ReadNotification {
                position_before: before,
                position_after: before + n as u64,
                buffer: buf,
                offset: 0,
                requested: buf.len(),
                actual: n,
            });
        } else if !buf.is_empty() {
            self.hub.signal_end();
        }
        Ok(n)
    }
}

impl<S: Write> EventingSource<S> {
    /// Write from `buf` and publish what was written.
    ///
    /// # Errors
    ///
    /// Returns any error of the wrapped sink.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let before = self.hub.position();
        let n = self.inner.lock().write(buf)?;
        self.hub.publish_write(&WriteNotification {
            position_before: before,
            position_after: before + n as u64,
            buffer: buf,
            offset: 0,
            requested: buf.len(),
            actual: n,
        });
        Ok(n)
    }

    /// Flush the wrapped sink.
    ///
    /// # Errors
    ///
    /// Returns any error of the wrapped sink.
    pub fn flush(&self) -> io::Result<()> {
        self.inner.lock().flush()
    }
}

impl<S: Read> Read for &EventingSource<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        EventingSource::read(self, buf)
    }
}

impl<S: Read> Read for EventingSource<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        EventingSource::read(self, buf)
    }
}

impl<S: Write> Write for &EventingSource<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        EventingSource::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        EventingSource::flush(self)
    }
}

impl<S: Seek> Seek for &EventingSource<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        EventingSource::seek(self, pos)
    }
}

impl<S> fmt::Debug for EventingSource<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventingSource")
            .field("position", &self.position())
            .field("length", &self.length())
            .field("read_subscribers", &self.hub.read_subscribers())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;

    type Log = Arc<Mutex<Vec<(u64, u64, usize, usize)>>>;

    fn recording(source: &EventingSource<Cursor<Vec<u8>>>) -> Log {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        source.subscribe_read(move |n| {
            sink.lock()
                .push((n.position_before, n.position_after, n.requested, n.actual));
        });
        log
    }

    // ==========================================================================
    // READ NOTIFICATIONS
    // ==========================================================================

    #[test]
    fn read_publishes_range() {
        let source = EventingSource::new(Cursor::new(vec![1u8; 10]));
        let log = recording(&source);

        let mut buf = [0u8; 4];
        assert_eq!(source.read(&mut buf).unwrap(), 4);
        assert_eq!(source.read(&mut buf).unwrap(), 4);
        assert_eq!(source.read(&mut buf).unwrap(), 2);

        assert_eq!(
            *log.lock(),
            vec![(0, 4, 4, 4), (4, 8, 4, 4), (8, 10, 4, 2)]
        );
        assert_eq!(source.position(), 10);
    }

    #[test]
    fn eof_publishes_end_signal() {
        let source = EventingSource::new(Cursor::new(vec![9u8; 3]));
        let log = recording(&source);

        let mut buf = [0u8; 8];
        source.read(&mut buf).unwrap();
        assert_eq!(source.read(&mut buf).unwrap(), 0);

        let log = log.lock();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1], (3, 3, 0, 0));
    }

    #[test]
    fn empty_buffer_read_is_silent() {
        let source = EventingSource::new(Cursor::new(vec![9u8; 3]));
        let log = recording(&source);
        assert_eq!(source.read(&mut []).unwrap(), 0);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn notification_carries_bytes() {
        let source = EventingSource::new(Cursor::new(b"abcdef".to_vec()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        source.subscribe_read(move |n| sink.lock().extend_from_slice(n.data()));

        let mut out = Vec::new();
        (&source).read_to_end(&mut out).unwrap();
        assert_eq!(*seen.lock(), b"abcdef");
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let source = EventingSource::new(Cursor::new(vec![0u8; 8]));
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let id = source.subscribe_read(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        let mut buf = [0u8; 4];
        source.read(&mut buf).unwrap();
        source.unsubscribe_read(id);
        source.read(&mut buf).unwrap();

        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(source.hub().read_subscribers(), 0);
    }

    // ==========================================================================
    // WRITE NOTIFICATIONS
    // ==========================================================================

    #[test]
    fn write_publishes_every_call() {
        let source = EventingSource::new(Cursor::new(Vec::new()));
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        source.subscribe_write(move |n| sink.lock().push((n.position_before, n.actual)));

        source.write(b"abc").unwrap();
        source.write(b"").unwrap();
        source.write(b"de").unwrap();

        assert_eq!(*log.lock(), vec![(0, 3), (3, 0), (3, 2)]);
        assert_eq!(source.into_inner().into_inner(), b"abcde");
    }

    // ==========================================================================
    // CAPABILITIES
    // ==========================================================================

    #[test]
    fn single_byte_operations_not_supported() {
        let source = EventingSource::new(Cursor::new(vec![1u8]));
        assert!(matches!(
            source.read_byte(),
            Err(ForkpointError::NotSupported(_))
        ));
        assert!(matches!(
            source.write_byte(1),
            Err(ForkpointError::NotSupported(_))
        ));
    }

    #[test]
    fn measured_reports_length_and_position() {
        let mut cursor = Cursor::new(vec![0u8; 100]);
        cursor.set_position(40);
        let source = EventingSource::measured(cursor).unwrap();
        assert_eq!(source.length(), Some(100));
        assert_eq!(source.position(), 40);
    }

    #[test]
    fn seek_updates_position() {
        let source = EventingSource::new(Cursor::new(vec![0u8; 100]));
        source.seek(SeekFrom::Start(70)).unwrap();
        assert_eq!(source.position(), 70);

        let log = recording(&source);
        let mut buf = [0u8; 10];
        source.read(&mut buf).unwrap();
        assert_eq!(log.lock()[0], (70, 80, 10, 10));
    }

    #[test]
    fn synthetic_publish_moves_hub() {
        let hub = SourceHub::new(Some(50));
        let data = [5u8; 20];
        hub.publish_read(&ReadNotification::new(10, &data));
        assert_eq!(hub.position(), 30);
        hub.signal_end();
        assert_eq!(hub.position(), 30);
        assert_eq!(hub.length(), Some(50));
    }

    #[test]
    fn listener_may_unsubscribe_itself() {
        let source = Arc::new(EventingSource::new(Cursor::new(vec![0u8; 8])));
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let hub = source.hub().clone();
        let own = slot.clone();
        let id = source.subscribe_read(move |_| {
            if let Some(id) = *own.lock() {
                hub.unsubscribe_read(id);
            }
        });
        *slot.lock() = Some(id);

        let mut buf = [0u8; 4];
        source.read(&mut buf).unwrap();
        assert_eq!(source.hub().read_subscribers(), 0);
    }
}
