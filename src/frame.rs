use std::{
    fmt::{self, Write},
    mem,
    ops::{Range, RangeInclusive},
};

use bytes::{Buf, BufMut, Bytes};
use tinyvec::TinyVec;

use crate::{
    coding::{self, BufExt, BufMutExt, UnexpectedEnd},
    range_set::RangeSet,
    shared::ConnectionId,
    transport_error::{Code as TransportErrorCode, Error as TransportError},
    varint::VarInt,
    Dir, StreamId, MAX_CID_SIZE,
};

/// A QUIC frame type codepoint
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct FrameType(u64);

impl FrameType {
    fn stream(self) -> Option<StreamInfo> {
        if STREAM_TYS.contains(&self.0) {
            Some(StreamInfo(self.0 as u8))
        } else {
            None
        }
    }
    fn datagram(self) -> Option<DatagramInfo> {
        if DATAGRAM_TYS.contains(&self.0) {
            Some(DatagramInfo(self.0 as u8))
        } else {
            None
        }
    }
}

impl coding::Codec for FrameType {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        Ok(Self(buf.get_var()?))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write_var(self.0);
    }
}

macro_rules! frame_types {
    {$($name:ident = $val:expr,)*} => {
        impl FrameType {
            $(pub(crate) const $name: FrameType = FrameType($val);)*
        }

        impl fmt::Debug for FrameType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    _ => write!(f, "Type({:02x})", self.0)
                }
            }
        }

        impl fmt::Display for FrameType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    x if STREAM_TYS.contains(&x) => f.write_str("STREAM"),
                    x if DATAGRAM_TYS.contains(&x) => f.write_str("DATAGRAM"),
                    _ => write!(f, "<unknown {:02x}>", self.0),
                }
            }
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct StreamInfo(u8);

impl StreamInfo {
    fn fin(self) -> bool {
        self.0 & 0x01 != 0
    }
    fn len(self) -> bool {
        self.0 & 0x02 != 0
    }
    fn off(self) -> bool {
        self.0 & 0x04 != 0
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct DatagramInfo(u8);

impl DatagramInfo {
    fn len(self) -> bool {
        self.0 & 0x01 != 0
    }
}

frame_types! {
    PADDING = 0x00,
    PING = 0x01,
    ACK = 0x02,
    RESET_STREAM = 0x04,
    STOP_SENDING = 0x05,
    CRYPTO = 0x06,
    NEW_TOKEN = 0x07,
    // STREAM
    MAX_DATA = 0x10,
    MAX_STREAM_DATA = 0x11,
    MAX_STREAMS_BIDI = 0x12,
    MAX_STREAMS_UNI = 0x13,
    DATA_BLOCKED = 0x14,
    STREAM_DATA_BLOCKED = 0x15,
    STREAMS_BLOCKED_BIDI = 0x16,
    STREAMS_BLOCKED_UNI = 0x17,
    NEW_CONNECTION_ID = 0x18,
    RETIRE_CONNECTION_ID = 0x19,
    PATH_CHALLENGE = 0x1a,
    PATH_RESPONSE = 0x1b,
    CONNECTION_CLOSE = 0x1c,
    APPLICATION_CLOSE = 0x1d,
    HANDSHAKE_DONE = 0x1e,
    // DATAGRAM
}

const STREAM_TYS: RangeInclusive<u64> = RangeInclusive::new(0x08, 0x0f);
const DATAGRAM_TYS: RangeInclusive<u64> = RangeInclusive::new(0x30, 0x31);

pub(crate) const RESET_TOKEN_SIZE: usize = 16;

/// The smallest unit of QUIC signalling carried inside packets
#[derive(Debug, Clone)]
pub enum Frame {
    Padding,
    Ping,
    Ack(Ack),
    ResetStream(ResetStream),
    StopSending(StopSending),
    Crypto(Crypto),
    NewToken(NewToken),
    Stream(Stream),
    MaxData(VarInt),
    MaxStreamData { id: StreamId, offset: u64 },
    MaxStreams { dir: Dir, count: u64 },
    DataBlocked { offset: u64 },
    StreamDataBlocked { id: StreamId, offset: u64 },
    StreamsBlocked { dir: Dir, limit: u64 },
    NewConnectionId(NewConnectionId),
    RetireConnectionId { sequence: u64 },
    PathChallenge(u64),
    PathResponse(u64),
    Close(Close),
    Datagram(Datagram),
    HandshakeDone,
}

impl Frame {
    pub(crate) fn ty(&self) -> FrameType {
        use Frame::*;
        match *self {
            Padding => FrameType::PADDING,
            Ping => FrameType::PING,
            Ack(_) => FrameType::ACK,
            ResetStream(_) => FrameType::RESET_STREAM,
            StopSending { .. } => FrameType::STOP_SENDING,
            Crypto(_) => FrameType::CRYPTO,
            NewToken(_) => FrameType::NEW_TOKEN,
            Stream(ref x) => {
                let mut ty = *STREAM_TYS.start();
                if x.fin {
                    ty |= 0x01;
                }
                if x.offset != 0 {
                    ty |= 0x04;
                }
                FrameType(ty)
            }
            MaxData(_) => FrameType::MAX_DATA,
            MaxStreamData { .. } => FrameType::MAX_STREAM_DATA,
            MaxStreams { dir: Dir::Bi, .. } => FrameType::MAX_STREAMS_BIDI,
            MaxStreams { dir: Dir::Uni, .. } => FrameType::MAX_STREAMS_UNI,
            DataBlocked { .. } => FrameType::DATA_BLOCKED,
            StreamDataBlocked { .. } => FrameType::STREAM_DATA_BLOCKED,
            StreamsBlocked { dir: Dir::Bi, .. } => FrameType::STREAMS_BLOCKED_BIDI,
            StreamsBlocked { dir: Dir::Uni, .. } => FrameType::STREAMS_BLOCKED_UNI,
            NewConnectionId(_) => FrameType::NEW_CONNECTION_ID,
            RetireConnectionId { .. } => FrameType::RETIRE_CONNECTION_ID,
            PathChallenge(_) => FrameType::PATH_CHALLENGE,
            PathResponse(_) => FrameType::PATH_RESPONSE,
            Close(self::Close::Connection(_)) => FrameType::CONNECTION_CLOSE,
            Close(self::Close::Application(_)) => FrameType::APPLICATION_CLOSE,
            Datagram(_) => FrameType(*DATAGRAM_TYS.start()),
            HandshakeDone => FrameType::HANDSHAKE_DONE,
        }
    }

    /// Whether receipt of this frame obligates the receiver to acknowledge the packet
    pub(crate) fn is_ack_eliciting(&self) -> bool {
        !matches!(*self, Self::Ack(_) | Self::Padding | Self::Close(_))
    }

    /// Whether this frame is re-offered for transmission when its packet is lost
    pub(crate) fn is_retransmittable(&self) -> bool {
        // DATAGRAM frames are fire-and-forget; probe frames are path-specific
        self.is_ack_eliciting()
            && !matches!(
                *self,
                Self::Datagram(_) | Self::PathChallenge(_) | Self::PathResponse(_)
            )
    }

    /// Whether this frame may appear in packets used to probe a new path
    pub fn is_probing(&self) -> bool {
        matches!(
            *self,
            Self::Padding | Self::PathChallenge(_) | Self::PathResponse(_) | Self::NewConnectionId(_)
        )
    }

    /// Whether this frame participates in the crypto handshake when sent below 1-RTT
    pub fn is_handshake(&self) -> bool {
        matches!(*self, Self::Crypto(_) | Self::Close(_))
    }

    /// Serialize into `out`
    ///
    /// `last` indicates the frame will not be followed by others in the same
    /// packet, allowing STREAM and DATAGRAM frames to omit their length field.
    pub(crate) fn encode(&self, last: bool, out: &mut Vec<u8>) {
        use Frame::*;
        match *self {
            Padding => out.write(FrameType::PADDING),
            Ping => out.write(FrameType::PING),
            Ack(ref x) => x.encode(out),
            ResetStream(ref x) => x.encode(out),
            StopSending(ref x) => x.encode(out),
            Crypto(ref x) => x.encode(out),
            NewToken(ref x) => x.encode(out),
            Stream(ref x) => x.encode(!last, out),
            MaxData(x) => {
                out.write(FrameType::MAX_DATA);
                out.write(x);
            }
            MaxStreamData { id, offset } => {
                out.write(FrameType::MAX_STREAM_DATA);
                out.write(id);
                out.write_var(offset);
            }
            MaxStreams { dir, count } => {
                out.write(match dir {
                    Dir::Bi => FrameType::MAX_STREAMS_BIDI,
                    Dir::Uni => FrameType::MAX_STREAMS_UNI,
                });
                out.write_var(count);
            }
            DataBlocked { offset } => {
                out.write(FrameType::DATA_BLOCKED);
                out.write_var(offset);
            }
            StreamDataBlocked { id, offset } => {
                out.write(FrameType::STREAM_DATA_BLOCKED);
                out.write(id);
                out.write_var(offset);
            }
            StreamsBlocked { dir, limit } => {
                out.write(match dir {
                    Dir::Bi => FrameType::STREAMS_BLOCKED_BIDI,
                    Dir::Uni => FrameType::STREAMS_BLOCKED_UNI,
                });
                out.write_var(limit);
            }
            NewConnectionId(ref x) => x.encode(out),
            RetireConnectionId { sequence } => {
                out.write(FrameType::RETIRE_CONNECTION_ID);
                out.write_var(sequence);
            }
            PathChallenge(token) => {
                out.write(FrameType::PATH_CHALLENGE);
                out.write(token);
            }
            PathResponse(token) => {
                out.write(FrameType::PATH_RESPONSE);
                out.write(token);
            }
            Close(ref x) => x.encode(out, usize::MAX),
            Datagram(ref x) => x.encode(!last, out),
            HandshakeDone => out.write(FrameType::HANDSHAKE_DONE),
        }
    }

    /// Number of bytes `encode` will produce, under the same `last` flag
    pub(crate) fn size(&self, last: bool) -> usize {
        use Frame::*;
        let ty_size = VarInt(self.ty().0).size();
        ty_size
            + match *self {
                Padding | Ping | HandshakeDone => 0,
                Ack(ref x) => {
                    VarInt::size_of(x.largest)
                        + VarInt::size_of(x.delay)
                        + VarInt::size_of(x.extra_blocks)
                        + x.additional.len()
                }
                ResetStream(ref x) => {
                    VarInt(x.id.0).size() + x.error_code.size() + x.final_offset.size()
                }
                StopSending(ref x) => VarInt(x.id.0).size() + x.error_code.size(),
                Crypto(ref x) => {
                    VarInt::size_of(x.offset)
                        + VarInt::size_of(x.data.len() as u64)
                        + x.data.len()
                }
                NewToken(ref x) => VarInt::size_of(x.token.len() as u64) + x.token.len(),
                Stream(ref x) => {
                    VarInt(x.id.0).size()
                        + if x.offset != 0 {
                            VarInt::size_of(x.offset)
                        } else {
                            0
                        }
                        + if last {
                            0
                        } else {
                            VarInt::size_of(x.data.len() as u64)
                        }
                        + x.data.len()
                }
                MaxData(x) => x.size(),
                MaxStreamData { id, offset } => VarInt(id.0).size() + VarInt::size_of(offset),
                MaxStreams { count, .. } => VarInt::size_of(count),
                DataBlocked { offset } => VarInt::size_of(offset),
                StreamDataBlocked { id, offset } => VarInt(id.0).size() + VarInt::size_of(offset),
                StreamsBlocked { limit, .. } => VarInt::size_of(limit),
                NewConnectionId(ref x) => {
                    VarInt::size_of(x.sequence)
                        + VarInt::size_of(x.retire_prior_to)
                        + 1
                        + x.id.len()
                        + RESET_TOKEN_SIZE
                }
                RetireConnectionId { sequence } => VarInt::size_of(sequence),
                PathChallenge(_) | PathResponse(_) => 8,
                Close(ref x) => x.size() - ty_size,
                Datagram(ref x) => {
                    (if last {
                        0
                    } else {
                        VarInt::size_of(x.data.len() as u64)
                    }) + x.data.len()
                }
            }
    }
}

/// Acknowledgment of a contiguous or gapped run of packet numbers
#[derive(Clone, Eq, PartialEq)]
pub struct Ack {
    pub largest: u64,
    pub delay: u64,
    /// Encoded first-range length and gap/length pairs, as they appear on the wire
    pub additional: Bytes,
    pub(crate) extra_blocks: u64,
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ranges = "[".to_string();
        let mut first = true;
        for range in self.iter() {
            if !first {
                ranges.push(',');
            }
            write!(ranges, "{range:?}")?;
            first = false;
        }
        ranges.push(']');

        f.debug_struct("Ack")
            .field("largest", &self.largest)
            .field("delay", &self.delay)
            .field("ranges", &ranges)
            .finish()
    }
}

impl<'a> IntoIterator for &'a Ack {
    type Item = RangeInclusive<u64>;
    type IntoIter = AckIter<'a>;

    fn into_iter(self) -> AckIter<'a> {
        AckIter::new(self.largest, &self.additional[..])
    }
}

impl Ack {
    /// Build an ACK frame covering `ranges`
    ///
    /// # Panics
    /// When `ranges` is empty.
    pub(crate) fn from_ranges(delay: u64, ranges: &RangeSet) -> Self {
        let mut rest = ranges.iter().rev();
        let first = rest.next().expect("ACK must cover at least one packet");
        let largest = first.end - 1;
        let mut additional = Vec::new();
        additional.write_var(first.end - first.start - 1);
        let mut prev = first.start;
        for block in rest {
            additional.write_var(prev - block.end - 1);
            additional.write_var(block.end - block.start - 1);
            prev = block.start;
        }
        Self {
            largest,
            delay,
            additional: additional.into(),
            extra_blocks: ranges.len() as u64 - 1,
        }
    }

    pub(crate) fn encode<W: BufMut>(&self, buf: &mut W) {
        buf.write(FrameType::ACK);
        buf.write_var(self.largest);
        buf.write_var(self.delay);
        buf.write_var(self.extra_blocks);
        buf.put_slice(&self.additional);
    }

    pub fn iter(&self) -> AckIter<'_> {
        self.into_iter()
    }
}

/// Iterates the high-to-low packet number ranges covered by an [`Ack`]
#[derive(Debug, Clone)]
pub struct AckIter<'a> {
    largest: u64,
    data: &'a [u8],
}

impl<'a> AckIter<'a> {
    fn new(largest: u64, data: &'a [u8]) -> Self {
        Self { largest, data }
    }
}

impl Iterator for AckIter<'_> {
    type Item = RangeInclusive<u64>;
    fn next(&mut self) -> Option<RangeInclusive<u64>> {
        if !self.data.has_remaining() {
            return None;
        }
        let block = self.data.get_var().unwrap();
        let largest = self.largest;
        if let Ok(gap) = self.data.get_var() {
            self.largest -= block + gap + 2;
        }
        Some(largest - block..=largest)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ResetStream {
    pub id: StreamId,
    pub error_code: VarInt,
    pub final_offset: VarInt,
}

impl ResetStream {
    pub(crate) const SIZE_BOUND: usize = 1 + 8 + 8 + 8;

    pub(crate) fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::RESET_STREAM); // 1 byte
        out.write(self.id); // <= 8 bytes
        out.write(self.error_code); // <= 8 bytes
        out.write(self.final_offset); // <= 8 bytes
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct StopSending {
    pub id: StreamId,
    pub error_code: VarInt,
}

impl StopSending {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::STOP_SENDING); // 1 byte
        out.write(self.id); // <= 8 bytes
        out.write(self.error_code) // <= 8 bytes
    }
}

#[derive(Debug, Clone)]
pub struct Crypto {
    pub offset: u64,
    pub data: Bytes,
}

impl Crypto {
    /// Type byte plus maximal offset and length encodings
    pub(crate) const SIZE_BOUND: usize = 17;

    pub(crate) fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::CRYPTO);
        out.write_var(self.offset);
        out.write_var(self.data.len() as u64);
        out.put_slice(&self.data);
    }
}

#[derive(Debug, Clone)]
pub struct NewToken {
    pub token: Bytes,
}

impl NewToken {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::NEW_TOKEN);
        out.write_var(self.token.len() as u64);
        out.put_slice(&self.token);
    }
}

#[derive(Debug, Clone)]
pub struct Stream {
    pub id: StreamId,
    pub offset: u64,
    pub fin: bool,
    pub data: Bytes,
}

impl Stream {
    /// Type byte plus maximal id, offset, and length encodings
    pub(crate) const SIZE_BOUND: usize = 1 + 8 + 8 + 8;

    pub(crate) fn encode(&self, length: bool, out: &mut Vec<u8>) {
        let mut ty = *STREAM_TYS.start();
        if self.offset != 0 {
            ty |= 0x04;
        }
        if length {
            ty |= 0x02;
        }
        if self.fin {
            ty |= 0x01;
        }
        out.write_var(ty); // 1 byte
        out.write(self.id); // <= 8 bytes
        if self.offset != 0 {
            out.write_var(self.offset); // <= 8 bytes
        }
        if length {
            out.write_var(self.data.len() as u64); // <= 8 bytes
        }
        out.put_slice(&self.data);
    }

    /// Smallest serialization of a frame at `offset` that omits its length field
    pub(crate) fn overhead(id: StreamId, offset: u64) -> usize {
        1 + VarInt(id.0).size()
            + if offset != 0 {
                VarInt::size_of(offset)
            } else {
                0
            }
    }
}

/// Metadata from a stream frame, without the payload bytes
#[derive(Debug, Clone)]
pub struct StreamMeta {
    pub id: StreamId,
    pub offsets: Range<u64>,
    pub fin: bool,
}

// This manual implementation exists because `Default` is not implemented for `StreamId`
impl Default for StreamMeta {
    fn default() -> Self {
        Self {
            id: StreamId(0),
            offsets: 0..0,
            fin: false,
        }
    }
}

/// A vector of [`StreamMeta`] with optimization for the single element case
pub(crate) type StreamMetaVec = TinyVec<[StreamMeta; 1]>;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NewConnectionId {
    pub sequence: u64,
    pub retire_prior_to: u64,
    pub id: ConnectionId,
    pub reset_token: [u8; RESET_TOKEN_SIZE],
}

impl NewConnectionId {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::NEW_CONNECTION_ID);
        out.write_var(self.sequence);
        out.write_var(self.retire_prior_to);
        out.write(self.id.len() as u8);
        out.put_slice(&self.id);
        out.put_slice(&self.reset_token);
    }
}

/// Reason for closing the connection
#[derive(Debug, Clone)]
pub enum Close {
    /// The transport detected an error
    Connection(ConnectionClose),
    /// The application requested the close
    Application(ApplicationClose),
}

impl Close {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W, max_len: usize) {
        match *self {
            Self::Connection(ref x) => x.encode(out, max_len),
            Self::Application(ref x) => x.encode(out, max_len),
        }
    }

    pub(crate) fn size(&self) -> usize {
        match *self {
            Self::Connection(ref x) => {
                1 + VarInt::size_of(u64::from(x.error_code))
                    + VarInt::size_of(x.frame_type.map_or(0, |ty| ty.0))
                    + VarInt::size_of(x.reason.len() as u64)
                    + x.reason.len()
            }
            Self::Application(ref x) => {
                1 + x.error_code.size() + VarInt::size_of(x.reason.len() as u64) + x.reason.len()
            }
        }
    }

    pub(crate) fn is_transport_layer(&self) -> bool {
        matches!(*self, Self::Connection(_))
    }
}

impl From<TransportError> for Close {
    fn from(x: TransportError) -> Self {
        Self::Connection(x.into())
    }
}
impl From<ConnectionClose> for Close {
    fn from(x: ConnectionClose) -> Self {
        Self::Connection(x)
    }
}
impl From<ApplicationClose> for Close {
    fn from(x: ApplicationClose) -> Self {
        Self::Application(x)
    }
}

/// Reason given by the transport for closing the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionClose {
    /// Class of error as encoded on the wire
    pub error_code: TransportErrorCode,
    /// Type of frame that caused the close
    pub frame_type: Option<FrameType>,
    /// Human-readable reason for the close
    pub reason: Bytes,
}

impl fmt::Display for ConnectionClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error_code.fmt(f)?;
        if !self.reason.as_ref().is_empty() {
            f.write_str(": ")?;
            f.write_str(&String::from_utf8_lossy(&self.reason))?;
        }
        Ok(())
    }
}

impl From<TransportError> for ConnectionClose {
    fn from(x: TransportError) -> Self {
        Self {
            error_code: x.code,
            frame_type: x.frame,
            reason: x.reason.into(),
        }
    }
}

impl ConnectionClose {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W, max_len: usize) {
        out.write(FrameType::CONNECTION_CLOSE); // 1 byte
        out.write(self.error_code); // <= 8 bytes
        let ty = self.frame_type.map_or(0, |x| x.0);
        out.write_var(ty); // <= 8 bytes
        let max_len = max_len.saturating_sub(
            3 + VarInt::size_of(ty) + VarInt::size_of(self.reason.len() as u64),
        );
        let actual_len = self.reason.len().min(max_len);
        out.write_var(actual_len as u64); // <= 8 bytes
        out.put_slice(&self.reason[0..actual_len]); // whatever's left
    }
}

/// Reason given by an application for closing the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationClose {
    /// Application-specific reason code
    pub error_code: VarInt,
    /// Human-readable reason for the close
    pub reason: Bytes,
}

impl fmt::Display for ApplicationClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.reason.as_ref().is_empty() {
            f.write_str(&String::from_utf8_lossy(&self.reason))?;
            f.write_str(" (code ")?;
            self.error_code.fmt(f)?;
            f.write_str(")")?;
        } else {
            self.error_code.fmt(f)?;
        }
        Ok(())
    }
}

impl ApplicationClose {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W, max_len: usize) {
        out.write(FrameType::APPLICATION_CLOSE); // 1 byte
        out.write(self.error_code); // <= 8 bytes
        let max_len = max_len
            .saturating_sub(3 + VarInt::size_of(self.reason.len() as u64));
        let actual_len = self.reason.len().min(max_len);
        out.write_var(actual_len as u64); // <= 8 bytes
        out.put_slice(&self.reason[0..actual_len]); // whatever's left
    }
}

/// An unreliable application datagram
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Payload
    pub data: Bytes,
}

impl Datagram {
    pub(crate) const SIZE_BOUND: usize = 1 + 8;

    pub(crate) fn encode(&self, length: bool, out: &mut Vec<u8>) {
        out.write(FrameType(*DATAGRAM_TYS.start() | u64::from(length))); // 1 byte
        if length {
            // Safe to unwrap because we check length sanity before queueing datagrams
            out.write(VarInt::from_u64(self.data.len() as u64).unwrap()); // <= 8 bytes
        }
        out.put_slice(&self.data); // whatever's left
    }
}

pub(crate) struct Iter {
    bytes: Bytes,
    last_ty: Option<FrameType>,
}

impl Iter {
    pub(crate) fn new(payload: Bytes) -> Result<Self, TransportError> {
        if payload.is_empty() {
            // "An endpoint MUST treat receipt of a packet containing no frames as a
            // connection error of type PROTOCOL_VIOLATION."
            return Err(TransportError::PROTOCOL_VIOLATION(
                "packet payload is empty",
            ));
        }

        Ok(Self {
            bytes: payload,
            last_ty: None,
        })
    }

    fn take_len(&mut self) -> Result<Bytes, UnexpectedEnd> {
        let len = self.bytes.get_var()?;
        if len > self.bytes.remaining() as u64 {
            return Err(UnexpectedEnd);
        }
        Ok(self.bytes.split_to(len as usize))
    }

    fn take_remaining(&mut self) -> Bytes {
        mem::take(&mut self.bytes)
    }

    fn try_next(&mut self) -> Result<Frame, IterErr> {
        let ty = self.bytes.get::<FrameType>()?;
        self.last_ty = Some(ty);
        Ok(match ty {
            FrameType::PADDING => Frame::Padding,
            FrameType::PING => Frame::Ping,
            FrameType::RESET_STREAM => Frame::ResetStream(ResetStream {
                id: self.bytes.get()?,
                error_code: self.bytes.get()?,
                final_offset: self.bytes.get()?,
            }),
            FrameType::STOP_SENDING => Frame::StopSending(StopSending {
                id: self.bytes.get()?,
                error_code: self.bytes.get()?,
            }),
            FrameType::CONNECTION_CLOSE => Frame::Close(Close::Connection(ConnectionClose {
                error_code: self.bytes.get()?,
                frame_type: {
                    let x = self.bytes.get_var()?;
                    if x == 0 {
                        None
                    } else {
                        Some(FrameType(x))
                    }
                },
                reason: self.take_len()?,
            })),
            FrameType::APPLICATION_CLOSE => Frame::Close(Close::Application(ApplicationClose {
                error_code: self.bytes.get()?,
                reason: self.take_len()?,
            })),
            FrameType::MAX_DATA => Frame::MaxData(self.bytes.get()?),
            FrameType::MAX_STREAM_DATA => Frame::MaxStreamData {
                id: self.bytes.get()?,
                offset: self.bytes.get_var()?,
            },
            FrameType::MAX_STREAMS_BIDI => Frame::MaxStreams {
                dir: Dir::Bi,
                count: self.bytes.get_var()?,
            },
            FrameType::MAX_STREAMS_UNI => Frame::MaxStreams {
                dir: Dir::Uni,
                count: self.bytes.get_var()?,
            },
            FrameType::DATA_BLOCKED => Frame::DataBlocked {
                offset: self.bytes.get_var()?,
            },
            FrameType::STREAM_DATA_BLOCKED => Frame::StreamDataBlocked {
                id: self.bytes.get()?,
                offset: self.bytes.get_var()?,
            },
            FrameType::STREAMS_BLOCKED_BIDI => Frame::StreamsBlocked {
                dir: Dir::Bi,
                limit: self.bytes.get_var()?,
            },
            FrameType::STREAMS_BLOCKED_UNI => Frame::StreamsBlocked {
                dir: Dir::Uni,
                limit: self.bytes.get_var()?,
            },
            FrameType::NEW_CONNECTION_ID => {
                let sequence = self.bytes.get_var()?;
                let retire_prior_to = self.bytes.get_var()?;
                if retire_prior_to > sequence {
                    return Err(IterErr::Malformed);
                }
                let length = self.bytes.get::<u8>()? as usize;
                if length > MAX_CID_SIZE || length == 0 {
                    return Err(IterErr::Malformed);
                }
                if length > self.bytes.remaining() {
                    return Err(IterErr::UnexpectedEnd);
                }
                let id = ConnectionId::new(&self.bytes[..length]);
                self.bytes.advance(length);
                if self.bytes.remaining() < RESET_TOKEN_SIZE {
                    return Err(IterErr::UnexpectedEnd);
                }
                let mut reset_token = [0; RESET_TOKEN_SIZE];
                self.bytes.copy_to_slice(&mut reset_token);
                Frame::NewConnectionId(NewConnectionId {
                    sequence,
                    retire_prior_to,
                    id,
                    reset_token,
                })
            }
            FrameType::RETIRE_CONNECTION_ID => Frame::RetireConnectionId {
                sequence: self.bytes.get_var()?,
            },
            FrameType::PATH_CHALLENGE => Frame::PathChallenge(self.bytes.get()?),
            FrameType::PATH_RESPONSE => Frame::PathResponse(self.bytes.get()?),
            FrameType::ACK => {
                let largest = self.bytes.get_var()?;
                let delay = self.bytes.get_var()?;
                let extra_blocks = self.bytes.get_var()?;
                let n = scan_ack_blocks(&self.bytes, largest, extra_blocks as usize)?;
                Frame::Ack(Ack {
                    delay,
                    largest,
                    additional: self.bytes.split_to(n),
                    extra_blocks,
                })
            }
            FrameType::CRYPTO => Frame::Crypto(Crypto {
                offset: self.bytes.get_var()?,
                data: self.take_len()?,
            }),
            FrameType::NEW_TOKEN => {
                let token = self.take_len()?;
                if token.is_empty() {
                    return Err(IterErr::Malformed);
                }
                Frame::NewToken(NewToken { token })
            }
            FrameType::HANDSHAKE_DONE => Frame::HandshakeDone,
            _ => {
                if let Some(s) = ty.stream() {
                    Frame::Stream(Stream {
                        id: self.bytes.get()?,
                        offset: if s.off() { self.bytes.get_var()? } else { 0 },
                        fin: s.fin(),
                        data: if s.len() {
                            self.take_len()?
                        } else {
                            self.take_remaining()
                        },
                    })
                } else if let Some(d) = ty.datagram() {
                    Frame::Datagram(Datagram {
                        data: if d.len() {
                            self.take_len()?
                        } else {
                            self.take_remaining()
                        },
                    })
                } else {
                    return Err(IterErr::InvalidFrameId);
                }
            }
        })
    }
}

impl Iterator for Iter {
    type Item = Result<Frame, InvalidFrame>;
    fn next(&mut self) -> Option<Self::Item> {
        if !self.bytes.has_remaining() {
            return None;
        }
        match self.try_next() {
            Ok(x) => Some(Ok(x)),
            Err(e) => {
                // Corrupt frame, skip it and everything that follows
                self.bytes.clear();
                Some(Err(InvalidFrame {
                    ty: self.last_ty,
                    reason: e.reason(),
                }))
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct InvalidFrame {
    pub(crate) ty: Option<FrameType>,
    pub(crate) reason: &'static str,
}

impl From<InvalidFrame> for TransportError {
    fn from(err: InvalidFrame) -> Self {
        let mut te = Self::FRAME_ENCODING_ERROR(err.reason);
        te.frame = err.ty;
        te
    }
}

/// Validate exactly `n` extra ACK ranges in `buf` and return the number of bytes they cover
fn scan_ack_blocks(mut buf: &[u8], largest: u64, n: usize) -> Result<usize, IterErr> {
    let total_len = buf.remaining();
    let first_block = buf.get_var()?;
    let mut smallest = largest.checked_sub(first_block).ok_or(IterErr::Malformed)?;
    for _ in 0..n {
        let gap = buf.get_var()?;
        smallest = smallest.checked_sub(gap + 2).ok_or(IterErr::Malformed)?;
        let block = buf.get_var()?;
        smallest = smallest.checked_sub(block).ok_or(IterErr::Malformed)?;
    }
    Ok(total_len - buf.remaining())
}

#[derive(Debug)]
enum IterErr {
    UnexpectedEnd,
    InvalidFrameId,
    Malformed,
}

impl IterErr {
    fn reason(&self) -> &'static str {
        use IterErr::*;
        match *self {
            UnexpectedEnd => "unexpected end",
            InvalidFrameId => "invalid frame ID",
            Malformed => "malformed",
        }
    }
}

impl From<UnexpectedEnd> for IterErr {
    fn from(_: UnexpectedEnd) -> Self {
        Self::UnexpectedEnd
    }
}
