//! # Forkpoint
//!
//! Find the first byte at which two copies of a data stream diverge
//! without transferring either copy.
//!
//! Both sides compute hierarchical digests: a digest of a whole range plus
//! digests of its sub-partitions, in one linear pass. Comparing those sets
//! narrows the range round by round until a single byte remains.
//!
//! ## Features
//!
//! - **Eventing sources**: wrap any byte source and publish every read
//! - **Windowed taps**: bounded, nestable views fed by a single forward pass
//! - **Hierarchical hashing**: `[whole, part 0, .., part P-1]` digest sets
//!   with BLAKE3 or SHA-256
//! - **Divergence search**: divide and conquer over two hash checkers
//! - **Resumable transfer**: negotiation and upload endpoints with a framed
//!   wire codec
//!
//! ## Example
//!
//! ```rust
//! use forkpoint::{DivergenceLocator, StreamHashChecker};
//! use std::io::Cursor;
//!
//! let original = vec![1u8; 10_240];
//! let mut copy = original.clone();
//! copy[8497] = 0;
//!
//! let source = StreamHashChecker::new(Cursor::new(original));
//! let target = StreamHashChecker::new(Cursor::new(copy));
//!
//! let offset = DivergenceLocator::new().locate(&source, &target).unwrap();
//! assert_eq!(offset, Some(8497));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod async_locate;
mod cancel;
mod checker;
mod error;
mod eventing;
mod hash;
mod hierarchy;
mod locate;
mod model;
pub mod partition;
mod protocol;
mod tap;
mod transfer;
mod upload;

pub use async_locate::AsyncLocator;
pub use cancel::Cancellation;
pub use checker::{FileHashChecker, HashMode, MultipartHashChecker, StreamHashChecker};
pub use error::{ForkpointError, Result};
pub use eventing::{
    EventingSource, ReadListener, ReadNotification, SourceHub, Subscribers, SubscriptionId,
    Tappable, WriteListener, WriteNotification,
};
pub use hash::{HashAlgorithm, StreamDigest};
pub use hierarchy::{HasherConfig, HierarchicalHasher};
pub use locate::{DivergenceLocator, LocatorBuilder, LocatorConfig};
pub use model::{SegmentHash, StreamDescriptor, StreamStatus, SubstreamDetails};
pub use protocol::{
    error_code, serve_connection, serve_listener, Codec, FrameHeader, FramedClient, Message,
    MessageType, RemoteHashChecker, TransferClient, MAX_PAYLOAD_SIZE, PROTOCOL_MAGIC,
    PROTOCOL_VERSION, UPLOAD_CHUNK_SIZE,
};
pub use tap::{WindowSpec, WindowedTap};
pub use transfer::{
    FsTargetFactory, MemoryTarget, MemoryTargetFactory, TargetStream, TargetStreamFactory,
    TransferServer, UploadCompleted, UploadMode,
};
pub use upload::{ResumableUpload, UploadOutcome};
