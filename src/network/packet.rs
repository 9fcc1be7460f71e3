//! Packet Framing
//!
//! Every message on the stream is a 6-byte header followed by the payload:
//!
//! ```text
//! +-------------------+-------------------+--------------------+
//! | opcode (2 bytes)  | length (4 bytes)  |   payload          |
//! | u16 little-endian | u32 little-endian |   (length bytes)   |
//! +-------------------+-------------------+--------------------+
//! ```
//!
//! The length does not include the header. A length of 0 is valid.

use std::io;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::codec::{Codec, CodecError};

/// Header size in bytes.
pub const HEADER_LEN: usize = 6;

/// Initial capacity of a [`PacketWriter`] buffer.
const INITIAL_BUFFER: usize = 256;

// =============================================================================
// OPCODES
// =============================================================================

/// Operation codes carried in the packet header.
///
/// Values 0, 1, 3, 7 and 11 are reserved group markers and never sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum OpCode {
    /// Ping from the server, pong from the client.
    Heartbeat = 2,
    /// A player connected or disconnected.
    PlayerConnected = 4,
    /// A player's position changed.
    PlayerMoved = 5,
    /// Chat line relayed to everyone.
    Chat = 6,
    /// A new garbage challenge.
    GarbageChallenge = 8,
    /// Acknowledgement of a correct garbage response.
    GarbageAck = 9,
    /// Full list of connected players.
    PlayerRoster = 10,
    /// Chat line from a client.
    ClientChat = 12,
    /// Movement request from a client.
    ClientMove = 13,
    /// Garbage response from a client.
    GarbageResponse = 14,
}

impl OpCode {
    /// Every opcode, in wire order.
    pub const ALL: [OpCode; 10] = [
        OpCode::Heartbeat,
        OpCode::PlayerConnected,
        OpCode::PlayerMoved,
        OpCode::Chat,
        OpCode::GarbageChallenge,
        OpCode::GarbageAck,
        OpCode::PlayerRoster,
        OpCode::ClientChat,
        OpCode::ClientMove,
        OpCode::GarbageResponse,
    ];

    /// Size of a table indexed by [`OpCode::index`].
    pub const TABLE_SIZE: usize = OpCode::GarbageResponse as usize + 1;

    /// Raw wire value.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Slot in a fixed-size handler table.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u16> for OpCode {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        OpCode::ALL
            .iter()
            .copied()
            .find(|op| op.as_u16() == value)
            .ok_or(value)
    }
}

// =============================================================================
// PACKETS
// =============================================================================

/// A parsed packet. The opcode is kept raw so unknown values reach dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Raw opcode from the header.
    pub opcode: u16,
    /// Exactly `length` payload bytes.
    pub payload: Vec<u8>,
}

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed payload size in bytes. Default: 1 MiB.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1_048_576,
        }
    }
}

/// Framing errors.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// No stream is attached.
    #[error("no stream attached")]
    NilStream,

    /// The stream ended inside a header.
    #[error("header length mismatch: got {got} of 6 bytes")]
    HeaderLengthMismatch {
        /// Header bytes received before the stream ended.
        got: usize,
    },

    /// The stream ended inside a payload.
    #[error("payload length mismatch: expected {expected} bytes, got {got}")]
    PayloadLengthMismatch {
        /// Length announced by the header.
        expected: usize,
        /// Bytes received before the stream ended.
        got: usize,
    },

    /// The header announced a payload above the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// Announced payload size.
        size: u64,
        /// Configured maximum.
        max: u32,
    },

    /// Reading from the stream failed.
    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    /// Writing to the stream failed.
    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    /// Encoding the payload failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Header length field for a payload of `len` bytes.
pub fn payload_len(len: usize) -> Result<u32, FrameError> {
    u32::try_from(len).map_err(|_| FrameError::PayloadTooLarge {
        size: len as u64,
        max: u32::MAX,
    })
}

/// Build a complete packet in a fresh buffer.
pub fn frame_bytes(opcode: u16, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let length = payload_len(payload.len())?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&opcode.to_le_bytes());
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Parse a 6-byte header into `(opcode, length)`.
pub fn parse_header(header: &[u8; HEADER_LEN]) -> (u16, u32) {
    let opcode = u16::from_le_bytes([header[0], header[1]]);
    let length = u32::from_le_bytes([header[2], header[3], header[4], header[5]]);
    (opcode, length)
}

// =============================================================================
// WRITER
// =============================================================================

/// Encodes messages into one reusable buffer, header included.
#[derive(Debug)]
pub struct PacketWriter<C: Codec> {
    codec: C,
    buf: Vec<u8>,
}

impl<C: Codec> PacketWriter<C> {
    /// Create a writer with the default initial buffer.
    pub fn new(codec: C) -> Self {
        Self::with_capacity(codec, INITIAL_BUFFER)
    }

    /// Create a writer whose buffer holds `capacity` bytes.
    pub fn with_capacity(codec: C, capacity: usize) -> Self {
        Self {
            codec,
            buf: vec![0u8; capacity.max(HEADER_LEN)],
        }
    }

    /// Current buffer size.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// The codec used for payloads.
    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Encode `message` behind a header and return the framed bytes.
    ///
    /// On [`CodecError::BufferTooSmall`] the buffer grows to
    /// `header + required + 2` and encoding is retried once.
    pub fn encode<T: Serialize>(&mut self, opcode: OpCode, message: &T) -> Result<&[u8], FrameError> {
        let written = match self.codec.encode(message, &mut self.buf[HEADER_LEN..]) {
            Ok(n) => n,
            Err(CodecError::BufferTooSmall { required, .. }) => {
                let grown = HEADER_LEN + required + 2;
                debug!("Growing packet buffer {} -> {}", self.buf.len(), grown);
                self.buf.resize(grown, 0);
                self.codec.encode(message, &mut self.buf[HEADER_LEN..])?
            }
            Err(e) => return Err(e.into()),
        };

        let length = payload_len(written)?;
        self.buf[0..2].copy_from_slice(&opcode.as_u16().to_le_bytes());
        self.buf[2..HEADER_LEN].copy_from_slice(&length.to_le_bytes());
        Ok(&self.buf[..HEADER_LEN + written])
    }

    /// Encode `message` and write it to `stream`. Returns the bytes written.
    pub async fn write<W, T>(
        &mut self,
        stream: Option<&mut W>,
        opcode: OpCode,
        message: &T,
    ) -> Result<usize, FrameError>
    where
        W: AsyncWrite + Unpin + ?Sized,
        T: Serialize,
    {
        let stream = stream.ok_or(FrameError::NilStream)?;
        let frame = self.encode(opcode, message)?;
        write_frame(stream, frame).await?;
        Ok(frame.len())
    }
}

/// Write an already framed packet and flush.
pub async fn write_frame<W>(stream: &mut W, frame: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    stream.write_all(frame).await.map_err(FrameError::Write)?;
    stream.flush().await.map_err(FrameError::Write)?;
    Ok(())
}

// =============================================================================
// READER
// =============================================================================

/// Peer-closed conditions that end a read loop without an error.
fn is_peer_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe
    )
}

/// Outcome of filling a buffer from the stream.
enum Fill {
    /// Buffer filled completely.
    Full,
    /// Stream ended after `n` bytes.
    Eof(usize),
    /// Peer closed the connection.
    Closed,
}

async fn fill<R>(reader: &mut R, buf: &mut [u8]) -> Result<Fill, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => return Ok(Fill::Eof(filled)),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_peer_closed(&e) => return Ok(Fill::Closed),
            Err(e) => return Err(FrameError::Read(e)),
        }
    }
    Ok(Fill::Full)
}

/// Read one packet.
///
/// Returns `Ok(None)` when the peer closed the stream at a packet boundary.
pub async fn read_packet<R>(reader: &mut R, config: &FrameConfig) -> Result<Option<Packet>, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    match fill(reader, &mut header).await? {
        Fill::Full => {}
        Fill::Eof(0) | Fill::Closed => return Ok(None),
        Fill::Eof(got) => return Err(FrameError::HeaderLengthMismatch { got }),
    }

    let (opcode, length) = parse_header(&header);
    if length > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: u64::from(length),
            max: config.max_payload_size,
        });
    }

    let mut payload = vec![0u8; length as usize];
    match fill(reader, &mut payload).await? {
        Fill::Full => Ok(Some(Packet { opcode, payload })),
        Fill::Closed => Ok(None),
        Fill::Eof(got) => Err(FrameError::PayloadLengthMismatch {
            expected: length as usize,
            got,
        }),
    }
}

/// Read packets into `out` until the stream closes or `close` fires.
///
/// A full queue blocks the loop until the consumer catches up; packets are
/// never dropped. The reader is consumed and dropped on return.
pub async fn read_loop<R>(
    mut reader: R,
    out: mpsc::Sender<Packet>,
    mut close: watch::Receiver<bool>,
    config: FrameConfig,
) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    if *close.borrow() {
        return Ok(());
    }

    loop {
        let packet = tokio::select! {
            result = read_packet(&mut reader, &config) => match result? {
                Some(packet) => packet,
                None => return Ok(()),
            },
            _ = close.changed() => return Ok(()),
        };

        tokio::select! {
            sent = out.send(packet) => {
                if sent.is_err() {
                    // Consumer is gone
                    return Ok(());
                }
            }
            _ = close.changed() => return Ok(()),
        }
    }
}
