//! Wire protocol for remote negotiation and uploads.
//!
//! Every message travels as a 12-byte frame header followed by a bincode
//! payload. Requests carry a UUID correlation id that the reply echoes, so
//! failures can be traced across both ends.

use std::io::{self, Read, Write};
use std::iter;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::thread;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::checker::MultipartHashChecker;
use crate::error::{ForkpointError, Result};
use crate::hash::HashAlgorithm;
use crate::model::{SegmentHash, StreamDescriptor, StreamStatus, SubstreamDetails};
use crate::partition;
use crate::transfer::{TransferServer, UploadMode};

/// Protocol magic bytes: "FKPT"
pub const PROTOCOL_MAGIC: [u8; 4] = *b"FKPT";

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum payload size (16 MB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Largest data block a client puts in one upload frame.
pub const UPLOAD_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Protocol message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Negotiation request.
    Bump = 0x01,
    /// Negotiation reply.
    BumpReply = 0x02,
    /// Target length request.
    Length = 0x03,
    /// Target length reply.
    LengthReply = 0x04,
    /// Raw data upload.
    Upload = 0x05,
    /// Upload acknowledgment.
    Ack = 0x06,
    /// Failure reply.
    Error = 0x07,
}

impl MessageType {
    /// Convert from u8.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if the value is invalid.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Bump),
            0x02 => Ok(Self::BumpReply),
            0x03 => Ok(Self::Length),
            0x04 => Ok(Self::LengthReply),
            0x05 => Ok(Self::Upload),
            0x06 => Ok(Self::Ack),
            0x07 => Ok(Self::Error),
            _ => Err(ForkpointError::Protocol(format!(
                "Invalid message type: {value:#x}"
            ))),
        }
    }
}

/// Protocol frame header.
///
/// ```text
/// ┌─────────┬─────────┬─────────┬─────────┬─────────┐
/// │  MAGIC  │ LENGTH  │  TYPE   │ VERSION │  FLAGS  │
/// │ 4 bytes │ 4 bytes │ 1 byte  │ 1 byte  │ 2 bytes │
/// └─────────┴─────────┴─────────┴─────────┴─────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Magic bytes: "FKPT".
    pub magic: [u8; 4],
    /// Payload length (little-endian).
    pub length: u32,
    /// Message type.
    pub msg_type: MessageType,
    /// Protocol version.
    pub version: u8,
    /// Reserved flags.
    pub flags: u16,
}

impl FrameHeader {
    /// Header size in bytes.
    pub const SIZE: usize = 12;

    /// Create a new frame header.
    #[must_use]
    pub const fn new(msg_type: MessageType, payload_len: u32) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            length: payload_len,
            msg_type,
            version: PROTOCOL_VERSION,
            flags: 0,
        }
    }

    /// Validate the header.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if validation fails.
    pub fn validate(&self) -> Result<()> {
        if self.magic != PROTOCOL_MAGIC {
            return Err(ForkpointError::Protocol(format!(
                "Invalid magic: expected {:?}, got {:?}",
                PROTOCOL_MAGIC, self.magic
            )));
        }
        if self.version != PROTOCOL_VERSION {
            return Err(ForkpointError::Protocol(format!(
                "Unsupported version: expected {PROTOCOL_VERSION}, got {}",
                self.version
            )));
        }
        if self.length > MAX_PAYLOAD_SIZE {
            return Err(ForkpointError::Protocol(format!(
                "Payload too large: {} > {MAX_PAYLOAD_SIZE}",
                self.length
            )));
        }
        Ok(())
    }

    /// Encode header to bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8] = self.msg_type as u8;
        buf[9] = self.version;
        buf[10..12].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }

    /// Decode and validate a header.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if the header is malformed.
    pub fn decode(buf: &[u8; Self::SIZE]) -> Result<Self> {
        let header = Self {
            magic: [buf[0], buf[1], buf[2], buf[3]],
            length: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            msg_type: MessageType::from_u8(buf[8])?,
            version: buf[9],
            flags: u16::from_le_bytes([buf[10], buf[11]]),
        };
        header.validate()?;
        Ok(header)
    }

    /// Read header from a reader.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or decoding fails.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; Self::SIZE];
        reader.read_exact(&mut buf)?;
        Self::decode(&buf)
    }

    /// Write header to a writer.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.encode())?;
        Ok(())
    }
}

/// Protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Ask the target side to resize and hash a range.
    Bump {
        /// Request id.
        correlation_id: Uuid,
        /// Target partition.
        partition: String,
        /// Descriptor and source details.
        status: StreamStatus,
    },
    /// Negotiation result with target details filled.
    BumpReply {
        /// Echoed request id.
        correlation_id: Uuid,
        /// Completed status.
        status: StreamStatus,
    },
    /// Ask for the current target length.
    Length {
        /// Request id.
        correlation_id: Uuid,
        /// Target partition.
        partition: String,
        /// Target id.
        id: String,
    },
    /// Current target length.
    LengthReply {
        /// Echoed request id.
        correlation_id: Uuid,
        /// Length in bytes.
        length: u64,
    },
    /// Raw bytes for a target.
    Upload {
        /// Request id.
        correlation_id: Uuid,
        /// Placement of the bytes.
        mode: UploadMode,
        /// Target partition.
        partition: String,
        /// Target id.
        id: String,
        /// Write offset, ignored for [`UploadMode::Full`].
        offset: u64,
        /// Payload.
        data: Vec<u8>,
    },
    /// Upload applied.
    Ack {
        /// Echoed request id.
        correlation_id: Uuid,
        /// Bytes written.
        written: u64,
    },
    /// Request failed.
    Error {
        /// Echoed request id.
        correlation_id: Uuid,
        /// Error code.
        code: u32,
        /// Error message.
        message: String,
    },
}

impl Message {
    /// Get the message type.
    #[must_use]
    pub const fn msg_type(&self) -> MessageType {
        match self {
            Self::Bump { .. } => MessageType::Bump,
            Self::BumpReply { .. } => MessageType::BumpReply,
            Self::Length { .. } => MessageType::Length,
            Self::LengthReply { .. } => MessageType::LengthReply,
            Self::Upload { .. } => MessageType::Upload,
            Self::Ack { .. } => MessageType::Ack,
            Self::Error { .. } => MessageType::Error,
        }
    }

    /// Correlation id carried by the message.
    #[must_use]
    pub const fn correlation_id(&self) -> Uuid {
        match self {
            Self::Bump { correlation_id, .. }
            | Self::BumpReply { correlation_id, .. }
            | Self::Length { correlation_id, .. }
            | Self::LengthReply { correlation_id, .. }
            | Self::Upload { correlation_id, .. }
            | Self::Ack { correlation_id, .. }
            | Self::Error { correlation_id, .. } => *correlation_id,
        }
    }

    /// Encode message to bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| ForkpointError::Protocol(format!("Failed to encode message: {e}")))
    }

    /// Decode message from bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if deserialization fails.
    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data)
            .map_err(|e| ForkpointError::Protocol(format!("Failed to decode message: {e}")))
    }
}

/// Protocol codec for reading/writing framed messages.
#[derive(Debug, Default)]
pub struct Codec {
    /// Buffer for the last frame's payload.
    read_buf: Vec<u8>,
}

impl Codec {
    /// Create a new codec.
    #[must_use]
    pub fn new() -> Self {
        Self {
            read_buf: Vec::with_capacity(4096),
        }
    }

    /// Write a message to a writer.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is too large or writing fails.
    pub fn write_message<W: Write>(&self, writer: &mut W, message: &Message) -> Result<()> {
        let payload = message.encode()?;
        let payload_len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_PAYLOAD_SIZE)
            .ok_or_else(|| {
                ForkpointError::Protocol(format!(
                    "Payload exceeds maximum size: {} > {MAX_PAYLOAD_SIZE}",
                    payload.len()
                ))
            })?;

        FrameHeader::new(message.msg_type(), payload_len).write_to(writer)?;
        writer.write_all(&payload)?;
        Ok(())
    }

    /// Read one frame; the payload stays valid until the next read.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the header is malformed.
    pub fn read_frame<R: Read>(&mut self, reader: &mut R) -> Result<(FrameHeader, &[u8])> {
        let header = FrameHeader::read_from(reader)?;
        self.read_buf.resize(header.length as usize, 0);
        reader.read_exact(&mut self.read_buf)?;
        Ok((header, &self.read_buf))
    }

    /// Read a message from a reader.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or decoding fails, or if the payload
    /// does not match the header's message type.
    pub fn read_message<R: Read>(&mut self, reader: &mut R) -> Result<Message> {
        let (header, payload) = self.read_frame(reader)?;
        decode_checked(&header, payload)
    }
}

fn decode_checked(header: &FrameHeader, payload: &[u8]) -> Result<Message> {
    let message = Message::decode(payload)?;
    if message.msg_type() != header.msg_type {
        return Err(ForkpointError::Protocol(format!(
            "Header type {:?} does not match payload type {:?}",
            header.msg_type,
            message.msg_type()
        )));
    }
    Ok(message)
}

/// Wire error code for a failure.
#[must_use]
pub const fn error_code(err: &ForkpointError) -> u32 {
    match err {
        ForkpointError::InvalidArgument(_) | ForkpointError::Protocol(_) => 400,
        ForkpointError::UnsupportedAlgorithm(_) => 415,
        ForkpointError::Cancelled => 499,
        ForkpointError::NotSupported(_) => 501,
        _ => 500,
    }
}

/// Client side of the negotiation and upload endpoints.
pub trait TransferClient: Send + Sync {
    /// Negotiate: the reply carries the target details.
    ///
    /// # Errors
    ///
    /// Returns `Client` on transport or remote failure.
    fn bump(&self, partition: &str, status: StreamStatus) -> Result<StreamStatus>;

    /// Current length of the remote target.
    ///
    /// # Errors
    ///
    /// Returns `Client` on transport or remote failure.
    fn length(&self, partition: &str, id: &str) -> Result<u64>;

    /// Send the bytes of `reader`; returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns `Client` on transport or remote failure, or the reader's
    /// I/O error.
    fn upload(
        &self,
        mode: UploadMode,
        partition: &str,
        id: &str,
        offset: u64,
        reader: &mut dyn Read,
    ) -> Result<u64>;
}

impl<C: TransferClient + ?Sized> TransferClient for &C {
    fn bump(&self, partition: &str, status: StreamStatus) -> Result<StreamStatus> {
        (**self).bump(partition, status)
    }

    fn length(&self, partition: &str, id: &str) -> Result<u64> {
        (**self).length(partition, id)
    }

    fn upload(
        &self,
        mode: UploadMode,
        partition: &str,
        id: &str,
        offset: u64,
        reader: &mut dyn Read,
    ) -> Result<u64> {
        (**self).upload(mode, partition, id, offset, reader)
    }
}

/// The server answering in-process, without a wire in between.
impl TransferClient for TransferServer {
    fn bump(&self, partition: &str, status: StreamStatus) -> Result<StreamStatus> {
        Self::bump(self, partition, status)
    }

    fn length(&self, partition: &str, id: &str) -> Result<u64> {
        Self::length(self, partition, id)
    }

    fn upload(
        &self,
        mode: UploadMode,
        partition: &str,
        id: &str,
        offset: u64,
        reader: &mut dyn Read,
    ) -> Result<u64> {
        Self::upload(self, mode, partition, id, offset, reader)
    }
}

#[derive(Debug)]
struct Connection<S> {
    stream: S,
    codec: Codec,
    /// Set after a transport failure left the stream mid-frame.
    poisoned: bool,
}

/// Blocking request/response client over any duplex byte stream.
#[derive(Debug)]
pub struct FramedClient<S> {
    connection: Mutex<Connection<S>>,
}

impl FramedClient<TcpStream> {
    /// Connect over TCP.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

impl<S: Read + Write> FramedClient<S> {
    /// Client over an established stream.
    #[must_use]
    pub fn new(stream: S) -> Self {
        Self {
            connection: Mutex::new(Connection {
                stream,
                codec: Codec::new(),
                poisoned: false,
            }),
        }
    }

    /// Give the stream back.
    pub fn into_inner(self) -> S {
        self.connection.into_inner().stream
    }

    /// Send `request` and wait for its reply.
    ///
    /// Transport failures and error replies both surface as `Client`
    /// errors carrying the request's correlation id. A transport failure
    /// poisons the connection; every later request fails without touching
    /// the stream.
    fn request(&self, request: &Message) -> Result<Message> {
        let correlation_id = request.correlation_id();
        let mut connection = self.connection.lock();
        let Connection {
            stream,
            codec,
            poisoned,
        } = &mut *connection;

        let transport = |err: ForkpointError| {
            error!(%correlation_id, %err, "request failed in transport");
            ForkpointError::Client {
                correlation_id,
                message: err.to_string(),
                response: Vec::new(),
            }
        };
        if *poisoned {
            return Err(transport(ForkpointError::Protocol(
                "connection is out of sync after an earlier transport failure".to_string(),
            )));
        }

        let exchanged = codec
            .write_message(stream, request)
            .and_then(|()| stream.flush().map_err(ForkpointError::from));
        if let Err(err) = exchanged {
            *poisoned = true;
            return Err(transport(err));
        }
        let (header, payload) = match codec.read_frame(stream) {
            Ok(frame) => frame,
            Err(err) => {
                *poisoned = true;
                return Err(transport(err));
            }
        };

        let reply = decode_checked(&header, payload).map_err(|err| {
            error!(%correlation_id, %err, "undecodable reply");
            ForkpointError::Client {
                correlation_id,
                message: err.to_string(),
                response: payload.to_vec(),
            }
        })?;

        match reply {
            Message::Error {
                correlation_id: echoed,
                code,
                message,
            } => {
                error!(correlation_id = %echoed, code, %message, "remote rejected request");
                Err(ForkpointError::Client {
                    correlation_id: echoed,
                    message: format!("[{code}] {message}"),
                    response: payload.to_vec(),
                })
            }
            reply if reply.correlation_id() != correlation_id => {
                Err(ForkpointError::Protocol(format!(
                    "reply {} does not answer request {correlation_id}",
                    reply.correlation_id()
                )))
            }
            reply => Ok(reply),
        }
    }
}

fn unexpected(reply: &Message) -> ForkpointError {
    ForkpointError::Protocol(format!("unexpected reply {:?}", reply.msg_type()))
}

impl<S: Read + Write + Send> TransferClient for FramedClient<S> {
    fn bump(&self, partition: &str, status: StreamStatus) -> Result<StreamStatus> {
        let request = Message::Bump {
            correlation_id: Uuid::new_v4(),
            partition: partition.to_string(),
            status,
        };
        match self.request(&request)? {
            Message::BumpReply { status, .. } => Ok(status),
            other => Err(unexpected(&other)),
        }
    }

    fn length(&self, partition: &str, id: &str) -> Result<u64> {
        let request = Message::Length {
            correlation_id: Uuid::new_v4(),
            partition: partition.to_string(),
            id: id.to_string(),
        };
        match self.request(&request)? {
            Message::LengthReply { length, .. } => Ok(length),
            other => Err(unexpected(&other)),
        }
    }

    /// Sends the data in chunks; all but the last are segment writes, and
    /// the last one carries the truncation of `Full` and `Remaining`.
    fn upload(
        &self,
        mode: UploadMode,
        partition: &str,
        id: &str,
        offset: u64,
        reader: &mut dyn Read,
    ) -> Result<u64> {
        let base = match mode {
            UploadMode::Full => 0,
            UploadMode::Remaining | UploadMode::Segment => offset,
        };
        let mut written = 0u64;
        loop {
            let mut data = Vec::with_capacity(UPLOAD_CHUNK_SIZE);
            Read::take(&mut *reader, UPLOAD_CHUNK_SIZE as u64).read_to_end(&mut data)?;
            let last = data.len() < UPLOAD_CHUNK_SIZE;
            let chunk_mode = match mode {
                UploadMode::Full | UploadMode::Remaining if last => UploadMode::Remaining,
                _ => UploadMode::Segment,
            };
            if last && chunk_mode == UploadMode::Segment && data.is_empty() {
                break;
            }

            let request = Message::Upload {
                correlation_id: Uuid::new_v4(),
                mode: chunk_mode,
                partition: partition.to_string(),
                id: id.to_string(),
                offset: base + written,
                data,
            };
            match self.request(&request)? {
                Message::Ack { written: n, .. } => written += n,
                other => return Err(unexpected(&other)),
            }
            if last {
                break;
            }
        }
        debug!(partition, id, ?mode, written, "uploaded");
        Ok(written)
    }
}

/// Checker over a remote target, answered through bump negotiations.
#[derive(Debug)]
pub struct RemoteHashChecker<C> {
    client: C,
    partition: String,
    descriptor: StreamDescriptor,
}

impl<C: TransferClient> RemoteHashChecker<C> {
    /// Checker for the target described by `descriptor` in `partition`.
    ///
    /// Every digest request resizes the target to the descriptor's length.
    pub fn new(client: C, partition: impl Into<String>, descriptor: StreamDescriptor) -> Self {
        Self {
            client,
            partition: partition.into(),
            descriptor,
        }
    }
}

impl<C: TransferClient> MultipartHashChecker for RemoteHashChecker<C> {
    fn length(&self) -> Result<Option<u64>> {
        Ok(Some(self.client.length(&self.partition, &self.descriptor.id)?))
    }

    fn hashes(
        &self,
        start: u64,
        byte_count: u64,
        part_count: usize,
        algorithm: HashAlgorithm,
    ) -> Result<Vec<SegmentHash>> {
        if part_count < 2 {
            return Err(ForkpointError::InvalidArgument(format!(
                "part count must be at least 2, got {part_count}"
            )));
        }
        // Digest-less entries tell the server how many parts to compute.
        let layout = iter::once(SegmentHash::new(start, byte_count, String::new()))
            .chain(
                partition::split(start, byte_count, part_count as u64)
                    .into_iter()
                    .map(|s| SegmentHash::new(s.start, s.length, String::new())),
            )
            .collect();
        let descriptor = StreamDescriptor {
            hash_algorithm: algorithm.name().to_string(),
            ..self.descriptor.clone()
        };
        let status = StreamStatus::new(
            descriptor,
            SubstreamDetails::with_hashes(start, byte_count, algorithm, layout),
        );

        self.client
            .bump(&self.partition, status)?
            .target
            .map(|target| target.hashes)
            .ok_or_else(|| ForkpointError::Protocol("bump reply without target details".into()))
    }
}

/// Answer requests on `stream` until the peer closes it.
///
/// Failures of individual requests are sent back as error replies; only
/// transport failures end the loop with an error.
///
/// # Errors
///
/// Returns an error if the stream fails or a frame is malformed.
pub fn serve_connection<S: Read + Write>(server: &TransferServer, mut stream: S) -> Result<()> {
    let mut codec = Codec::new();
    loop {
        let request = match codec.read_message(&mut stream) {
            Ok(request) => request,
            Err(ForkpointError::Io(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                debug!("peer closed connection");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let reply = answer(server, request);
        codec.write_message(&mut stream, &reply)?;
        stream.flush()?;
    }
}

fn answer(server: &TransferServer, request: Message) -> Message {
    let correlation_id = request.correlation_id();
    let outcome = match request {
        Message::Bump {
            partition, status, ..
        } => server
            .bump(&partition, status)
            .map(|status| Message::BumpReply {
                correlation_id,
                status,
            }),
        Message::Length { partition, id, .. } => {
            server
                .length(&partition, &id)
                .map(|length| Message::LengthReply {
                    correlation_id,
                    length,
                })
        }
        Message::Upload {
            mode,
            partition,
            id,
            offset,
            data,
            ..
        } => server
            .upload(mode, &partition, &id, offset, data.as_slice())
            .map(|written| Message::Ack {
                correlation_id,
                written,
            }),
        other => Err(ForkpointError::Protocol(format!(
            "{:?} is not a request",
            other.msg_type()
        ))),
    };
    outcome.unwrap_or_else(|err| {
        warn!(%correlation_id, %err, "request failed");
        Message::Error {
            correlation_id,
            code: error_code(&err),
            message: err.to_string(),
        }
    })
}

/// Accept connections forever, one thread per connection.
///
/// # Errors
///
/// Returns an error if accepting fails.
pub fn serve_listener(listener: &TcpListener, server: &TransferServer) -> Result<()> {
    info!(addr = ?listener.local_addr().ok(), "listening");
    for stream in listener.incoming() {
        let stream = stream?;
        let peer = stream.peer_addr().ok();
        debug!(?peer, "accepted connection");
        let server = server.clone();
        thread::spawn(move || {
            if let Err(err) = serve_connection(&server, stream) {
                warn!(?peer, %err, "connection ended with error");
            }
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::StreamHashChecker;
    use crate::locate::DivergenceLocator;
    use crate::transfer::MemoryTargetFactory;
    use std::io::Cursor;
    use std::net::SocketAddr;

    fn spawn_server(server: TransferServer) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let _ = serve_listener(&listener, &server);
        });
        addr
    }

    fn memory_server() -> (TransferServer, MemoryTargetFactory) {
        let factory = MemoryTargetFactory::new();
        let server = TransferServer::new(factory.clone(), |_: &str, _: &str| -> Result<()> {
            Ok(())
        });
        (server, factory)
    }

    // ==========================================================================
    // FRAMING
    // ==========================================================================

    #[test]
    fn message_type_from_u8() {
        assert_eq!(MessageType::from_u8(0x01).unwrap(), MessageType::Bump);
        assert_eq!(MessageType::from_u8(0x07).unwrap(), MessageType::Error);
        assert!(MessageType::from_u8(0x00).is_err());
        assert!(MessageType::from_u8(0x08).is_err());
    }

    #[test]
    fn frame_header_layout() {
        let header = FrameHeader::new(MessageType::Upload, 0x0102_0304);
        let encoded = header.encode();
        assert_eq!(&encoded[0..4], b"FKPT");
        assert_eq!(&encoded[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(encoded[8], 0x05);
        assert_eq!(encoded[9], PROTOCOL_VERSION);
        assert_eq!(FrameHeader::decode(&encoded).unwrap(), header);
    }

    #[test]
    fn frame_header_rejects_bad_fields() {
        let mut header = FrameHeader::new(MessageType::Ack, 100);
        header.magic = *b"COPA";
        assert!(header.validate().is_err());

        let mut header = FrameHeader::new(MessageType::Ack, 100);
        header.version = 99;
        assert!(header.validate().is_err());

        let header = FrameHeader::new(MessageType::Ack, MAX_PAYLOAD_SIZE + 1);
        assert!(header.validate().is_err());
    }

    #[test]
    fn codec_reads_consecutive_frames() {
        let codec = Codec::new();
        let first = Message::Length {
            correlation_id: Uuid::new_v4(),
            partition: "p".to_string(),
            id: "a".to_string(),
        };
        let second = Message::Ack {
            correlation_id: Uuid::new_v4(),
            written: 42,
        };
        let mut buf = Vec::new();
        codec.write_message(&mut buf, &first).unwrap();
        codec.write_message(&mut buf, &second).unwrap();

        let mut reader = Codec::new();
        let mut cursor = Cursor::new(buf);
        assert_eq!(reader.read_message(&mut cursor).unwrap(), first);
        assert_eq!(reader.read_message(&mut cursor).unwrap(), second);
        assert!(reader.read_message(&mut cursor).is_err());
    }

    #[test]
    fn codec_rejects_mismatched_type() {
        let message = Message::Ack {
            correlation_id: Uuid::new_v4(),
            written: 1,
        };
        let payload = message.encode().unwrap();
        let mut buf = Vec::new();
        FrameHeader::new(MessageType::Bump, payload.len() as u32)
            .write_to(&mut buf)
            .unwrap();
        buf.extend_from_slice(&payload);

        let err = Codec::new().read_message(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, ForkpointError::Protocol(_)));
    }

    #[test]
    fn error_codes() {
        assert_eq!(error_code(&ForkpointError::InvalidArgument(String::new())), 400);
        assert_eq!(error_code(&ForkpointError::NotSupported("x")), 501);
        assert_eq!(error_code(&ForkpointError::Cancelled), 499);
    }

    // ==========================================================================
    // CLIENT / SERVER
    // ==========================================================================

    #[test]
    fn upload_and_length_over_tcp() {
        let (server, factory) = memory_server();
        let client = FramedClient::connect(spawn_server(server)).unwrap();

        let written = client
            .upload(UploadMode::Full, "p", "blob", 0, &mut &b"hello world"[..])
            .unwrap();
        assert_eq!(written, 11);
        assert_eq!(client.length("p", "blob").unwrap(), 11);

        client
            .upload(UploadMode::Remaining, "p", "blob", 6, &mut &b"there"[..])
            .unwrap();
        assert_eq!(factory.contents("p", "blob").unwrap(), b"hello there");
    }

    #[test]
    fn remote_failure_carries_correlation_id() {
        let (server, _) = memory_server();
        let client = FramedClient::connect(spawn_server(server)).unwrap();

        let err = client.length("p", "../escape").unwrap_err();
        match err {
            ForkpointError::Client {
                correlation_id,
                message,
                response,
            } => {
                assert!(!correlation_id.is_nil());
                assert!(message.contains("[400]"));
                let decoded = Message::decode(&response).unwrap();
                assert_eq!(decoded.correlation_id(), correlation_id);
            }
            other => panic!("expected client error, got {other:?}"),
        }
    }

    #[test]
    fn transport_failure_is_client_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });
        let client = FramedClient::connect(addr).unwrap();
        let err = client.length("p", "blob").unwrap_err();
        assert!(matches!(err, ForkpointError::Client { .. }));
    }

    /// Replays scripted reply bytes and fails once at `fail_at`.
    struct Flaky {
        replies: Cursor<Vec<u8>>,
        fail_at: u64,
        failed: bool,
        written: Vec<u8>,
    }

    impl Read for Flaky {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let position = self.replies.position();
            if self.failed {
                return self.replies.read(buf);
            }
            if position == self.fail_at {
                self.failed = true;
                return Err(io::ErrorKind::ConnectionReset.into());
            }
            let room = (self.fail_at - position) as usize;
            let n = buf.len().min(room);
            self.replies.read(&mut buf[..n])
        }
    }

    impl Write for Flaky {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn transport_failure_poisons_connection() {
        let mut replies = Vec::new();
        for length in [7, 8] {
            let reply = Message::LengthReply {
                correlation_id: Uuid::new_v4(),
                length,
            };
            Codec::new().write_message(&mut replies, &reply).unwrap();
        }
        let fail_at = FrameHeader::SIZE as u64 + 2;
        let client = FramedClient::new(Flaky {
            replies: Cursor::new(replies),
            fail_at,
            failed: false,
            written: Vec::new(),
        });

        let first = client.length("p", "blob").unwrap_err();
        assert!(matches!(first, ForkpointError::Client { .. }));

        match client.length("p", "blob").unwrap_err() {
            ForkpointError::Client { message, .. } => {
                assert!(message.contains("out of sync"), "{message}");
            }
            other => panic!("expected client error, got {other:?}"),
        }

        // The second request never reached the stream.
        let stream = client.into_inner();
        assert_eq!(stream.replies.position(), fail_at);
        let mut sent = Cursor::new(stream.written);
        let mut codec = Codec::new();
        assert!(matches!(
            codec.read_message(&mut sent).unwrap(),
            Message::Length { .. }
        ));
        assert!(codec.read_message(&mut sent).is_err());
    }

    #[test]
    fn remote_checker_drives_locator() {
        let (server, factory) = memory_server();
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let mut stale = data.clone();
        stale[15_000] ^= 0x55;
        factory.insert("p", "blob", stale);

        let client = FramedClient::connect(spawn_server(server)).unwrap();
        let descriptor = StreamDescriptor::new("blob", data.len() as u64, HashAlgorithm::Blake3);
        let remote = RemoteHashChecker::new(&client, "p", descriptor);
        let local = StreamHashChecker::new(Cursor::new(data));

        let found = DivergenceLocator::new().locate(&local, &remote).unwrap();
        assert_eq!(found, Some(15_000));
    }

    #[test]
    fn in_process_client() {
        let (server, factory) = memory_server();
        let client: &dyn TransferClient = &server;
        client
            .upload(UploadMode::Segment, "p", "blob", 2, &mut &b"xy"[..])
            .unwrap();
        assert_eq!(factory.contents("p", "blob").unwrap(), b"\0\0xy");
    }
}
