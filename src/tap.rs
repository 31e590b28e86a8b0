//! Bounded forward-only windows over a notifying parent.
//!
//! A [`WindowedTap`] subscribes to a [`Tappable`] parent and keeps the
//! slice of every published read that falls inside its window. It never
//! reads from the parent: some driver pumps the root
//! [`EventingSource`](crate::EventingSource) and the bytes fan out through
//! the subscription tree. Because a tap republishes what it receives (in
//! its own coordinates), taps nest to any depth.
//!
//! Producer and consumer meet on a per-tap mutex guarding the byte queue
//! and a level-triggered `ready` flag with a condition variable:
//!
//! - the producer appends, then re-arms `ready`;
//! - the consumer waits for `ready`, drains, and re-arms `ready` itself if
//!   bytes remain (or the tap is finished) so later reads never block on
//!   data that is already there.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::error::{ForkpointError, Result};
use crate::eventing::{
    ReadListener, ReadNotification, SubscriptionId, Subscribers, Tappable,
};

/// Consumed prefix size after which the queue is compacted.
const COMPACT_THRESHOLD: usize = 64 * 1024;

/// A tap's window in its parent's coordinate space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    /// First parent position inside the window.
    pub start_at: u64,
    /// Window length; `None` extends to the end of the parent.
    pub max_length: Option<u64>,
}

impl WindowSpec {
    /// Window `[start_at, start_at + max_length)`.
    #[must_use]
    pub const fn new(start_at: u64, max_length: u64) -> Self {
        Self {
            start_at,
            max_length: Some(max_length),
        }
    }

    /// Window from `start_at` to the end of the parent.
    #[must_use]
    pub const fn unbounded(start_at: u64) -> Self {
        Self {
            start_at,
            max_length: None,
        }
    }

    /// Exclusive end position, `None` when unbounded.
    #[must_use]
    pub fn end(&self) -> Option<u64> {
        self.max_length
            .map(|len| self.start_at.saturating_add(len))
    }

    /// Intersection of `[before, after)` with the window.
    ///
    /// Left or right of the window yields `None`; a range containing the
    /// whole window yields exactly the window.
    #[must_use]
    pub fn overlap(&self, before: u64, after: u64) -> Option<(u64, u64)> {
        let lo = before.max(self.start_at);
        let hi = self.end().map_or(after, |end| after.min(end));
        (lo < hi).then_some((lo, hi))
    }
}

/// Byte queue with separate read and write cursors.
#[derive(Debug, Default)]
struct TapBuffer {
    bytes: Vec<u8>,
    read_cursor: usize,
    write_cursor: usize,
}

impl TapBuffer {
    fn buffered(&self) -> usize {
        self.write_cursor - self.read_cursor
    }

    fn append(&mut self, data: &[u8]) {
        self.bytes.truncate(self.write_cursor);
        self.bytes.extend_from_slice(data);
        self.write_cursor += data.len();
    }

    fn drain_into(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.buffered());
        out[..n].copy_from_slice(&self.bytes[self.read_cursor..self.read_cursor + n]);
        self.read_cursor += n;
        n
    }

    /// Drop the consumed prefix once it dominates the storage.
    ///
    /// Only ever called with the tap mutex held.
    fn compact(&mut self) {
        if self.read_cursor < COMPACT_THRESHOLD || self.read_cursor * 2 < self.write_cursor {
            return;
        }
        self.bytes.drain(..self.read_cursor);
        self.write_cursor -= self.read_cursor;
        self.read_cursor = 0;
    }
}

#[derive(Debug, Default)]
struct TapInner {
    buffer: TapBuffer,
    /// Bytes received from the parent so far.
    received: u64,
    ready: bool,
    exhausted: bool,
    aborted: bool,
}

/// Shared state of a tap: what the parent feeds and children attach to.
pub(crate) struct TapState {
    window: WindowSpec,
    parent: Weak<dyn Tappable>,
    inner: Mutex<TapInner>,
    signal: Condvar,
    children: Subscribers<ReadListener>,
}

impl TapState {
    fn on_parent_read(&self, notification: &ReadNotification<'_>) {
        if notification.is_end() {
            self.finish();
            return;
        }

        let Some((lo, hi)) = self
            .window
            .overlap(notification.position_before, notification.position_after)
        else {
            return;
        };

        let rel_lo = lo - self.window.start_at;
        let rel_hi = hi - self.window.start_at;

        let (before, slice, complete) = {
            let mut inner = self.inner.lock();
            if inner.exhausted || inner.aborted || rel_hi <= inner.received {
                return;
            }
            // Bytes already received are never surfaced twice.
            let skip = inner.received.saturating_sub(rel_lo);
            let from = usize::try_from(lo + skip - notification.position_before).unwrap_or(0);
            let to = usize::try_from(hi - notification.position_before).unwrap_or(0);
            let slice = &notification.data()[from..to];

            let before = inner.received;
            inner.buffer.append(slice);
            inner.received += slice.len() as u64;
            let complete = self
                .window
                .max_length
                .is_some_and(|max| inner.received >= max);
            if complete {
                inner.exhausted = true;
            }
            inner.ready = true;
            self.signal.notify_all();
            (before, slice, complete)
        };

        trace!(
            start_at = self.window.start_at,
            received_from = before,
            len = slice.len(),
            complete,
            "tap ingested"
        );

        self.publish(&ReadNotification::new(before, slice));
        if complete {
            self.publish(&ReadNotification::end_of_stream(before + slice.len() as u64));
        }
    }

    /// Latch exhaustion, wake readers, forward the end signal.
    fn finish(&self) {
        let position = {
            let mut inner = self.inner.lock();
            if inner.exhausted {
                return;
            }
            inner.exhausted = true;
            inner.ready = true;
            self.signal.notify_all();
            inner.received
        };
        self.publish(&ReadNotification::end_of_stream(position));
    }

    fn abort(&self) {
        let mut inner = self.inner.lock();
        inner.aborted = true;
        inner.ready = true;
        self.signal.notify_all();
    }

    fn publish(&self, notification: &ReadNotification<'_>) {
        for listener in self.children.snapshot() {
            listener(notification);
        }
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut inner = self.inner.lock();
        while !inner.ready {
            self.signal.wait(&mut inner);
        }
        if inner.aborted {
            return Err(ForkpointError::Cancelled);
        }

        let n = inner.buffer.drain_into(buf);
        inner.buffer.compact();
        inner.ready = inner.buffer.buffered() > 0 || inner.exhausted;
        Ok(n)
    }

    fn length(&self) -> Option<u64> {
        let parent_length = self.parent.upgrade().and_then(|parent| parent.length());
        let start = self.window.start_at;
        match (self.window.end(), parent_length) {
            (Some(end), Some(parent)) => Some(end.min(parent).saturating_sub(start)),
            (Some(_), None) => self.window.max_length,
            (None, Some(parent)) => Some(parent.saturating_sub(start)),
            (None, None) => None,
        }
    }
}

impl Tappable for TapState {
    /// Bytes received so far; children address the window from 0.
    fn position(&self) -> u64 {
        self.inner.lock().received
    }

    fn length(&self) -> Option<u64> {
        TapState::length(self)
    }

    fn subscribe_read(&self, listener: ReadListener) -> SubscriptionId {
        self.children.subscribe(listener)
    }

    fn unsubscribe_read(&self, id: SubscriptionId) {
        self.children.unsubscribe(id);
    }
}

impl fmt::Debug for TapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TapState")
            .field("window", &self.window)
            .field("inner", &*self.inner.lock())
            .finish_non_exhaustive()
    }
}

/// A bounded, forward-only logical view of a parent's byte range.
///
/// # Example
///
/// ```rust
/// use std::io::{Cursor, Read};
/// use forkpoint::{EventingSource, WindowSpec, WindowedTap};
///
/// let source = EventingSource::new(Cursor::new(b"0123456789".to_vec()));
/// let tap = WindowedTap::attach(&source.tap_point(), WindowSpec::new(3, 4));
///
/// // Drive the source; the tap collects its window on the side.
/// let mut sink = Vec::new();
/// (&source).read_to_end(&mut sink).unwrap();
///
/// let mut window = Vec::new();
/// (&tap).read_to_end(&mut window).unwrap();
/// assert_eq!(window, b"3456");
/// ```
pub struct WindowedTap {
    state: Arc<TapState>,
    subscription: SubscriptionId,
}

impl WindowedTap {
    /// Attach a tap to `parent` covering `window`.
    ///
    /// The tap holds only a weak reference to its parent, which must stay
    /// alive for as long as the tap is fed.
    #[must_use]
    pub fn attach(parent: &Arc<dyn Tappable>, window: WindowSpec) -> Self {
        let empty = window.max_length == Some(0);
        let state = Arc::new(TapState {
            window,
            parent: Arc::downgrade(parent),
            inner: Mutex::new(TapInner {
                ready: empty,
                exhausted: empty,
                ..TapInner::default()
            }),
            signal: Condvar::new(),
            children: Subscribers::new(),
        });

        let weak = Arc::downgrade(&state);
        let subscription = parent.subscribe_read(Arc::new(move |notification| {
            if let Some(state) = weak.upgrade() {
                state.on_parent_read(notification);
            }
        }));

        Self {
            state,
            subscription,
        }
    }

    /// The window this tap covers.
    #[must_use]
    pub fn window(&self) -> WindowSpec {
        self.state.window
    }

    /// Attachment point for nested taps.
    #[must_use]
    pub fn tap_point(&self) -> Arc<dyn Tappable> {
        self.state.clone()
    }

    /// Read buffered bytes, blocking until some arrive or the tap is
    /// exhausted. Returns 0 only when exhausted and drained.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` once the tap was aborted.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.state.read(buf)
    }

    /// Bytes consumed so far, derived from the received total and the
    /// buffered remainder.
    #[must_use]
    pub fn position(&self) -> u64 {
        let consumed = {
            let inner = self.state.inner.lock();
            inner.received - inner.buffer.buffered() as u64
        };
        self.length().map_or(consumed, |length| consumed.min(length))
    }

    /// Window length clipped to the parent's length.
    #[must_use]
    pub fn length(&self) -> Option<u64> {
        self.state.length()
    }

    /// Bytes received but not yet consumed.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.state.inner.lock().buffer.buffered()
    }

    /// Whether the tap will receive no more bytes.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.state.inner.lock().exhausted
    }

    /// Fail every current and future read with `Cancelled`.
    pub fn abort(&self) {
        self.state.abort();
    }

    /// Subscribe a closure to the bytes this tap receives.
    pub fn subscribe_read<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ReadNotification<'_>) + Send + Sync + 'static,
    {
        self.state.children.subscribe(Arc::new(listener))
    }

    /// Taps are forward-only.
    ///
    /// # Errors
    ///
    /// Always returns `NotSupported`.
    pub fn seek(&self, _pos: SeekFrom) -> Result<u64> {
        Err(ForkpointError::NotSupported("seek on a tap"))
    }

    /// Taps are forward-only.
    ///
    /// # Errors
    ///
    /// Always returns `NotSupported`.
    pub fn set_position(&self, _position: u64) -> Result<()> {
        Err(ForkpointError::NotSupported("position assignment on a tap"))
    }

    /// Single-byte reads are not supported.
    ///
    /// # Errors
    ///
    /// Always returns `NotSupported`.
    pub fn read_byte(&self) -> Result<u8> {
        Err(ForkpointError::NotSupported("single-byte read"))
    }

    /// Only the parent feeds a tap.
    ///
    /// # Errors
    ///
    /// Always returns `NotSupported`.
    pub fn write(&self, _buf: &[u8]) -> Result<usize> {
        Err(ForkpointError::NotSupported("write into a tap"))
    }

    /// Only the parent feeds a tap.
    ///
    /// # Errors
    ///
    /// Always returns `NotSupported`.
    pub fn write_byte(&self, _byte: u8) -> Result<()> {
        Err(ForkpointError::NotSupported("single-byte write"))
    }
}

impl Drop for WindowedTap {
    fn drop(&mut self) {
        if let Some(parent) = self.state.parent.upgrade() {
            parent.unsubscribe_read(self.subscription);
        }
    }
}

impl Read for &WindowedTap {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.state.read(buf).map_err(ForkpointError::into_io)
    }
}

impl Read for WindowedTap {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.state.read(buf).map_err(ForkpointError::into_io)
    }
}

impl Write for &WindowedTap {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        WindowedTap::write(self, buf).map_err(ForkpointError::into_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        Err(ForkpointError::NotSupported("flush on a tap").into_io())
    }
}

impl Seek for &WindowedTap {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        WindowedTap::seek(self, pos).map_err(ForkpointError::into_io)
    }
}

impl fmt::Debug for WindowedTap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowedTap")
            .field("window", &self.state.window)
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::eventing::SourceHub;
    use proptest::prelude::*;

    proptest! {
        /// Whatever the chunking of the parent feed, a tap yields exactly
        /// the bytes of its window
        #[test]
        fn window_contents_independent_of_chunking(
            data in prop::collection::vec(any::<u8>(), 0..600),
            start in 0u64..700,
            len in 0u64..700,
            chunk in 1usize..97
        ) {
            let hub = Arc::new(SourceHub::new(Some(data.len() as u64)));
            let point: Arc<dyn Tappable> = hub.clone();
            let tap = WindowedTap::attach(&point, WindowSpec::new(start, len));

            for (i, piece) in data.chunks(chunk).enumerate() {
                hub.publish_read(&ReadNotification::new((i * chunk) as u64, piece));
            }
            hub.signal_end();

            let mut out = Vec::new();
            (&tap).read_to_end(&mut out).unwrap();

            let lo = (start as usize).min(data.len());
            let hi = ((start + len) as usize).min(data.len());
            prop_assert_eq!(&out[..], &data[lo..hi]);
        }
    }
}
