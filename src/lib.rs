//! Protocol core for QUIC packet construction and session multiplexing.
//!
//! This crate contains the connection-independent state machines that turn
//! stream writes and control-plane events into encrypted QUIC datagrams and
//! back: wire framing, packet assembly, stream lifecycle management, flow
//! control, and retransmission bookkeeping. It performs no I/O and owns no
//! sockets, timers, or cryptographic primitives; those are supplied by the
//! host through the traits in [`crypto`] and the [`session::SessionVisitor`]
//! callbacks.

use std::{fmt, ops};

mod assembler;
mod coding;
mod config;
mod control_frames;
mod creator;
mod flow_control;
mod frame;
mod id_manager;
mod packet;
mod range_set;
mod send_buffer;
mod session;
mod shared;
mod spaces;
mod stream;
mod transport_error;
mod varint;

pub mod crypto;

#[cfg(test)]
mod tests;

pub use crate::config::TransportConfig;
pub use crate::creator::{PacketCreator, PacketFate, PacketSink, SerializedPacket};
pub use crate::frame::{
    Ack, AckIter, ApplicationClose, Close, ConnectionClose, Crypto, Datagram, Frame, FrameType,
    NewConnectionId, NewToken, ResetStream, StopSending, Stream as StreamFrame, StreamMeta,
};
pub use crate::packet::{EncryptionLevel, PacketDecodeError, SpaceId};
pub use crate::session::{CloseSource, ConnectionError, Session, SessionVisitor, Timer};
pub use crate::shared::ConnectionId;
pub use crate::stream::{FinishError, ReadError, WriteError};
pub use crate::transport_error::{Code as TransportErrorCode, Error as TransportError};
pub use crate::varint::{VarInt, VarIntBoundsExceeded};

/// The QUIC protocol version implemented
pub const VERSION: u32 = 0x0000_0001;

/// Whether an endpoint was the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl Side {
    #[inline]
    pub fn is_client(self) -> bool {
        self == Self::Client
    }

    #[inline]
    pub fn is_server(self) -> bool {
        self == Self::Server
    }
}

impl ops::Not for Side {
    type Output = Self;
    fn not(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

/// Whether a stream communicates data in both directions or only from the initiator
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Dir {
    /// Data flows in both directions
    Bi = 0,
    /// Data flows only from the stream's initiator
    Uni = 1,
}

impl Dir {
    pub fn iter() -> impl Iterator<Item = Self> {
        [Self::Bi, Self::Uni].iter().cloned()
    }
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::Bi => "bidirectional",
            Self::Uni => "unidirectional",
        })
    }
}

/// Identifier for a stream within a particular connection
///
/// The two low bits encode the initiating [`Side`] and the [`Dir`]; the
/// remaining 60 bits are a per-quadrant index assigned in increasing order.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(pub(crate) u64);

impl StreamId {
    pub(crate) fn new(initiator: Side, dir: Dir, index: u64) -> Self {
        Self(index << 2 | (dir as u64) << 1 | initiator as u64)
    }

    /// Which side of a connection initiated the stream
    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    /// Which directions data flows in
    pub fn dir(self) -> Dir {
        if self.0 & 0x2 == 0 {
            Dir::Bi
        } else {
            Dir::Uni
        }
    }

    /// Distinguishes streams of the same initiator and directionality
    pub fn index(self) -> u64 {
        self.0 >> 2
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let initiator = match self.initiator() {
            Side::Client => "client",
            Side::Server => "server",
        };
        write!(f, "{} {} stream {}", initiator, self.dir(), self.index())
    }
}

impl From<StreamId> for VarInt {
    fn from(x: StreamId) -> Self {
        Self(x.0)
    }
}

impl From<VarInt> for StreamId {
    fn from(x: VarInt) -> Self {
        Self(x.0)
    }
}

impl coding::Codec for StreamId {
    fn decode<B: bytes::Buf>(buf: &mut B) -> coding::Result<Self> {
        <VarInt as coding::Codec>::decode(buf).map(|x| Self(x.into_inner()))
    }
    fn encode<B: bytes::BufMut>(&self, buf: &mut B) {
        coding::Codec::encode(&VarInt::from_u64(self.0).unwrap(), buf);
    }
}

/// Why a packet is being (re)sent
///
/// Recorded in [`SerializedPacket`] so the host can distinguish fresh data
/// from loss- and probe-driven retransmissions.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransmissionType {
    /// First transmission of this data
    NotRetransmission,
    /// Data re-sent after the loss detector declared its packet lost
    LossRetransmission,
    /// Data re-sent to elicit an acknowledgment when the probe timer fires
    ProbeRetransmission,
}

//
// Useful internal constants
//

/// Maximum connection ID length permitted by QUIC v1
const MAX_CID_SIZE: usize = 20;
/// Smallest datagram a client may send while handshaking
const MIN_INITIAL_SIZE: usize = 1200;
/// The maximum stream offset / final size expressible on the wire
const MAX_STREAM_OFFSET: u64 = (1 << 62) - 1;
/// Reordering distance after which an unacked packet is declared lost
const PACKET_REORDERING_THRESHOLD: u64 = 3;

#[cfg(test)]
mod lib_tests {
    use super::*;

    #[test]
    fn stream_id_quadrants() {
        let id = StreamId::new(Side::Client, Dir::Bi, 0);
        assert_eq!(id.0, 0);
        let id = StreamId::new(Side::Server, Dir::Bi, 0);
        assert_eq!(id.0, 1);
        let id = StreamId::new(Side::Client, Dir::Uni, 0);
        assert_eq!(id.0, 2);
        let id = StreamId::new(Side::Server, Dir::Uni, 3);
        assert_eq!(id.0, 15);
        assert_eq!(id.initiator(), Side::Server);
        assert_eq!(id.dir(), Dir::Uni);
        assert_eq!(id.index(), 3);
    }
}
