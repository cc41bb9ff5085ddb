use std::{cmp::Ordering, io, ops::Range};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::{
    coding::{self, BufExt, BufMutExt},
    crypto::{HeaderKey, PacketKey},
    shared::ConnectionId,
    varint::VarInt,
    MAX_CID_SIZE, VERSION,
};

// Due to packet number encryption, it is impossible to fully decode a header
// (which includes a variable-length packet number) without crypto context.
// We first decode the version-invariant header, which identifies the
// destination connection ID, the version, and the packet type. That is enough
// for the session to select keys and complete the decode.
#[derive(Debug)]
pub(crate) struct PartialDecode {
    plain_header: PlainHeader,
    buf: io::Cursor<BytesMut>,
}

impl PartialDecode {
    /// Begin decoding a packet, splitting off any coalesced packets that follow it
    pub(crate) fn new(
        bytes: BytesMut,
        local_cid_len: usize,
    ) -> Result<(Self, Option<BytesMut>), PacketDecodeError> {
        let mut buf = io::Cursor::new(bytes);
        let plain_header = PlainHeader::decode(&mut buf, local_cid_len)?;
        let dgram_len = buf.get_ref().len();
        let packet_len = plain_header
            .payload_len()
            .map(|len| (buf.position() + len) as usize)
            .unwrap_or(dgram_len);
        match dgram_len.cmp(&packet_len) {
            Ordering::Equal => Ok((Self { plain_header, buf }, None)),
            Ordering::Less => Err(PacketDecodeError::InvalidHeader(
                "packet too short to contain payload length",
            )),
            Ordering::Greater => {
                let rest = Some(buf.get_mut().split_off(packet_len));
                Ok((Self { plain_header, buf }, rest))
            }
        }
    }

    pub(crate) fn space(&self) -> SpaceId {
        self.plain_header.level().space()
    }

    pub(crate) fn level(&self) -> EncryptionLevel {
        self.plain_header.level()
    }

    pub(crate) fn is_initial(&self) -> bool {
        matches!(self.plain_header, PlainHeader::Initial { .. })
    }

    pub(crate) fn dst_cid(&self) -> ConnectionId {
        self.plain_header.dst_cid()
    }

    /// Length of the packet being decoded, including coalesced-packet trimming
    pub(crate) fn len(&self) -> usize {
        self.buf.get_ref().len()
    }

    /// Remove header protection and split the packet into header and payload
    pub(crate) fn finish(self, header_key: &dyn HeaderKey) -> Result<Packet, PacketDecodeError> {
        use PlainHeader::*;
        let Self {
            plain_header,
            mut buf,
        } = self;

        let header = match plain_header {
            Initial {
                dst_cid,
                src_cid,
                token_pos,
                ..
            } => {
                let number = Self::decrypt_header(&mut buf, header_key)?;
                let header_len = buf.position() as usize;
                let mut bytes = buf.into_inner();
                let header_data = bytes.split_to(header_len).freeze();
                let token = header_data.slice(token_pos.start..token_pos.end);
                return Ok(Packet {
                    header: Header::Initial {
                        dst_cid,
                        src_cid,
                        token,
                        number,
                    },
                    header_data,
                    payload: bytes,
                });
            }
            Long {
                ty,
                dst_cid,
                src_cid,
                ..
            } => Header::Long {
                ty,
                dst_cid,
                src_cid,
                number: Self::decrypt_header(&mut buf, header_key)?,
            },
            Short { spin, dst_cid, .. } => {
                let number = Self::decrypt_header(&mut buf, header_key)?;
                let key_phase = buf.get_ref()[0] & KEY_PHASE_BIT != 0;
                Header::Short {
                    spin,
                    key_phase,
                    dst_cid,
                    number,
                }
            }
        };

        let header_len = buf.position() as usize;
        let mut bytes = buf.into_inner();
        Ok(Packet {
            header,
            header_data: bytes.split_to(header_len).freeze(),
            payload: bytes,
        })
    }

    fn decrypt_header(
        buf: &mut io::Cursor<BytesMut>,
        header_key: &dyn HeaderKey,
    ) -> Result<PacketNumber, PacketDecodeError> {
        let packet_length = buf.get_ref().len();
        let pn_offset = buf.position() as usize;
        if packet_length < pn_offset + 4 + header_key.sample_size() {
            return Err(PacketDecodeError::InvalidHeader(
                "packet too short to extract header protection sample",
            ));
        }

        header_key.decrypt(pn_offset, buf.get_mut());

        let len = PacketNumber::decode_len(buf.get_ref()[0]);
        PacketNumber::decode(len, buf)
    }
}

pub(crate) struct Packet {
    pub(crate) header: Header,
    pub(crate) header_data: Bytes,
    pub(crate) payload: BytesMut,
}

impl Packet {
    pub(crate) fn reserved_bits_valid(&self) -> bool {
        let mask = match self.header {
            Header::Short { .. } => SHORT_RESERVED_BITS,
            _ => LONG_RESERVED_BITS,
        };
        self.header_data[0] & mask == 0
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Header {
    Initial {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token: Bytes,
        number: PacketNumber,
    },
    Long {
        ty: LongType,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        number: PacketNumber,
    },
    Short {
        spin: bool,
        key_phase: bool,
        dst_cid: ConnectionId,
        number: PacketNumber,
    },
}

impl Header {
    pub(crate) fn encode(&self, w: &mut Vec<u8>) -> PartialEncode {
        use Header::*;
        let start = w.len();
        match *self {
            Initial {
                ref dst_cid,
                ref src_cid,
                ref token,
                number,
            } => {
                w.write(u8::from(LongHeaderType::Initial) | number.tag());
                w.write(VERSION);
                dst_cid.encode_prefixed(w);
                src_cid.encode_prefixed(w);
                w.write_var(token.len() as u64);
                w.put_slice(token);
                w.write::<u16>(0); // Placeholder for payload length; see `PartialEncode::finish`
                number.encode(w);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn: Some((number.len(), true)),
                }
            }
            Long {
                ty,
                ref dst_cid,
                ref src_cid,
                number,
            } => {
                w.write(u8::from(LongHeaderType::Standard(ty)) | number.tag());
                w.write(VERSION);
                dst_cid.encode_prefixed(w);
                src_cid.encode_prefixed(w);
                w.write::<u16>(0); // Placeholder for payload length; see `PartialEncode::finish`
                number.encode(w);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn: Some((number.len(), true)),
                }
            }
            Short {
                spin,
                key_phase,
                ref dst_cid,
                number,
            } => {
                w.write(
                    FIXED_BIT
                        | if key_phase { KEY_PHASE_BIT } else { 0 }
                        | if spin { SPIN_BIT } else { 0 }
                        | number.tag(),
                );
                w.put_slice(dst_cid);
                number.encode(w);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn: Some((number.len(), false)),
                }
            }
        }
    }

    pub(crate) fn number(&self) -> PacketNumber {
        use Header::*;
        match *self {
            Initial { number, .. } | Long { number, .. } | Short { number, .. } => number,
        }
    }

}

/// Exact size of the encoded header for the given shape
///
/// Used by the packet creator to reserve space before any frame is queued.
pub(crate) fn header_size(
    level: EncryptionLevel,
    dst_cid: &ConnectionId,
    src_cid: &ConnectionId,
    pn_len: usize,
    token_len: usize,
) -> usize {
    match level {
        EncryptionLevel::OneRtt => 1 + dst_cid.len() + pn_len,
        EncryptionLevel::Initial => {
            1 + 4
                + 1
                + dst_cid.len()
                + 1
                + src_cid.len()
                + VarInt::size_of(token_len as u64)
                + token_len
                + 2
                + pn_len
        }
        EncryptionLevel::Handshake | EncryptionLevel::ZeroRtt => {
            1 + 4 + 1 + dst_cid.len() + 1 + src_cid.len() + 2 + pn_len
        }
    }
}

pub(crate) struct PartialEncode {
    pub(crate) start: usize,
    pub(crate) header_len: usize,
    // Packet number length, payload length needed
    pn: Option<(usize, bool)>,
}

impl PartialEncode {
    /// Complete the packet: write the long-header length field, encrypt the
    /// payload in place, and apply header protection
    ///
    /// `buf` must already include space for the AEAD tag.
    pub(crate) fn finish(
        self,
        buf: &mut [u8],
        header_key: &dyn HeaderKey,
        number: u64,
        packet_key: &dyn PacketKey,
    ) {
        let Self { header_len, pn, .. } = self;
        let (pn_len, write_len) = pn.expect("packets without numbers are never serialized");

        let pn_pos = header_len - pn_len;
        if write_len {
            let len = buf.len() - header_len + pn_len;
            assert!(len < 2usize.pow(14)); // Fits in reserved space
            let mut slice = &mut buf[pn_pos - 2..pn_pos];
            slice.put_u16(len as u16 | 0b01 << 14);
        }

        packet_key.encrypt(number, buf, header_len);

        debug_assert!(
            pn_pos + 4 + header_key.sample_size() <= buf.len(),
            "packet must be padded to at least {} bytes for header protection sampling",
            pn_pos + 4 + header_key.sample_size()
        );
        header_key.encrypt(pn_pos, buf);
    }
}

#[derive(Debug)]
pub(crate) enum PlainHeader {
    Initial {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token_pos: Range<usize>,
        len: u64,
    },
    Long {
        ty: LongType,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        len: u64,
    },
    Short {
        spin: bool,
        dst_cid: ConnectionId,
    },
}

impl PlainHeader {
    fn dst_cid(&self) -> ConnectionId {
        use PlainHeader::*;
        match self {
            Initial { dst_cid, .. } | Long { dst_cid, .. } | Short { dst_cid, .. } => *dst_cid,
        }
    }

    fn payload_len(&self) -> Option<u64> {
        use PlainHeader::*;
        match self {
            Initial { len, .. } | Long { len, .. } => Some(*len),
            Short { .. } => None,
        }
    }

    fn level(&self) -> EncryptionLevel {
        use PlainHeader::*;
        match self {
            Initial { .. } => EncryptionLevel::Initial,
            Long {
                ty: LongType::Handshake,
                ..
            } => EncryptionLevel::Handshake,
            Long {
                ty: LongType::ZeroRtt,
                ..
            } => EncryptionLevel::ZeroRtt,
            Short { .. } => EncryptionLevel::OneRtt,
        }
    }

    fn decode(
        buf: &mut io::Cursor<BytesMut>,
        local_cid_len: usize,
    ) -> Result<Self, PacketDecodeError> {
        let first = buf.get::<u8>()?;
        if first & LONG_HEADER_FORM == 0 {
            if first & FIXED_BIT == 0 {
                return Err(PacketDecodeError::InvalidHeader("fixed bit unset"));
            }
            let spin = first & SPIN_BIT != 0;
            let dst_cid = Self::get_cid(buf, local_cid_len)?;

            Ok(Self::Short { spin, dst_cid })
        } else {
            let version = buf.get::<u32>()?;

            let dst_cid = ConnectionId::decode_prefixed(buf)?;
            let src_cid = ConnectionId::decode_prefixed(buf)?;

            if version != VERSION {
                return Err(PacketDecodeError::UnsupportedVersion {
                    src: src_cid,
                    destination: dst_cid,
                });
            }

            match LongHeaderType::from_byte(first)? {
                LongHeaderType::Initial => {
                    let token_len = buf.get_var()? as usize;
                    if token_len > buf.remaining() {
                        return Err(PacketDecodeError::InvalidHeader("token out of bounds"));
                    }
                    let token_start = buf.position() as usize;
                    buf.advance(token_len);

                    let len = buf.get_var()?;
                    Ok(Self::Initial {
                        dst_cid,
                        src_cid,
                        token_pos: token_start..token_start + token_len,
                        len,
                    })
                }
                LongHeaderType::Standard(ty) => Ok(Self::Long {
                    ty,
                    dst_cid,
                    src_cid,
                    len: buf.get_var()?,
                }),
            }
        }
    }

    fn get_cid<R: Buf>(buf: &mut R, len: usize) -> Result<ConnectionId, PacketDecodeError> {
        if len > MAX_CID_SIZE {
            return Err(PacketDecodeError::InvalidHeader(
                "illegal connection ID length",
            ));
        }
        if buf.remaining() < len {
            return Err(PacketDecodeError::InvalidHeader(
                "connection ID longer than packet",
            ));
        }
        let cid = ConnectionId::new(&buf.chunk()[..len]);
        buf.advance(len);
        Ok(cid)
    }
}

/// A truncated packet number, as it appears on the wire
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum PacketNumber {
    U8(u8),
    U16(u16),
    U24(u32),
    U32(u32),
}

impl PacketNumber {
    /// Truncate `n` to the smallest length unambiguous to a peer that has
    /// acknowledged everything up to `largest_acked`
    pub(crate) fn new(n: u64, largest_acked: u64) -> Self {
        let range = (n - largest_acked) * 2;
        Self::with_len(n, Self::min_len_for_range(range))
    }

    /// Truncate `n` to an explicit length chosen by the packet creator
    pub(crate) fn with_len(n: u64, len: usize) -> Self {
        use PacketNumber::*;
        match len {
            1 => U8(n as u8),
            2 => U16(n as u16),
            3 => U24(n as u32),
            4 => U32(n as u32),
            _ => unreachable!("illegal packet number length"),
        }
    }

    /// Smallest length whose window covers `range` packet numbers
    pub(crate) fn min_len_for_range(range: u64) -> usize {
        if range < 1 << 8 {
            1
        } else if range < 1 << 16 {
            2
        } else if range < 1 << 24 {
            3
        } else if range < 1 << 32 {
            4
        } else {
            panic!("packet number range too large to encode")
        }
    }

    pub(crate) fn len(self) -> usize {
        use PacketNumber::*;
        match self {
            U8(_) => 1,
            U16(_) => 2,
            U24(_) => 3,
            U32(_) => 4,
        }
    }

    pub(crate) fn encode<W: BufMut>(self, w: &mut W) {
        use PacketNumber::*;
        match self {
            U8(x) => w.write(x),
            U16(x) => w.write(x),
            U24(x) => w.put_uint(u64::from(x), 3),
            U32(x) => w.write(x),
        }
    }

    pub(crate) fn decode<R: Buf>(len: usize, r: &mut R) -> Result<Self, PacketDecodeError> {
        use PacketNumber::*;
        if r.remaining() < len {
            return Err(PacketDecodeError::InvalidHeader("truncated packet number"));
        }
        let pn = match len {
            1 => U8(r.get()?),
            2 => U16(r.get()?),
            3 => U24(r.get_uint(3) as u32),
            4 => U32(r.get()?),
            _ => unreachable!(),
        };
        Ok(pn)
    }

    pub(crate) fn decode_len(tag: u8) -> usize {
        1 + (tag & 0x03) as usize
    }

    fn tag(self) -> u8 {
        use PacketNumber::*;
        match self {
            U8(_) => 0b00,
            U16(_) => 0b01,
            U24(_) => 0b10,
            U32(_) => 0b11,
        }
    }

    /// Reconstruct the full packet number given the largest processed so far
    pub(crate) fn expand(self, expected: u64) -> u64 {
        // From RFC 9000 Appendix A.3
        use PacketNumber::*;
        let truncated = match self {
            U8(x) => u64::from(x),
            U16(x) => u64::from(x),
            U24(x) => u64::from(x),
            U32(x) => u64::from(x),
        };
        let nbits = self.len() * 8;
        let win = 1 << nbits;
        let hwin = win / 2;
        let mask = win - 1;
        // The incoming packet number should be greater than expected - hwin and less than or equal
        // to expected + hwin
        //
        // This means we can't just strip the trailing bits from expected and add the truncated
        // because that might yield a value outside the window.
        let candidate = (expected & !mask) | truncated;
        if expected.checked_sub(hwin).is_some_and(|x| candidate <= x) {
            candidate + win
        } else if candidate > expected + hwin && candidate > win {
            candidate - win
        } else {
            candidate
        }
    }
}

/// Long packet type including non-uniform cases
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum LongHeaderType {
    Initial,
    Standard(LongType),
}

impl LongHeaderType {
    fn from_byte(b: u8) -> Result<Self, PacketDecodeError> {
        use self::{LongHeaderType::*, LongType::*};
        if b & FIXED_BIT == 0 {
            return Err(PacketDecodeError::InvalidHeader("fixed bit unset"));
        }
        debug_assert!(b & LONG_HEADER_FORM != 0, "not a long packet");
        match (b & 0x30) >> 4 {
            0x0 => Ok(Initial),
            0x1 => Ok(Standard(ZeroRtt)),
            0x2 => Ok(Standard(Handshake)),
            _ => Err(PacketDecodeError::InvalidHeader("retry packets unsupported")),
        }
    }
}

impl From<LongHeaderType> for u8 {
    fn from(ty: LongHeaderType) -> Self {
        use self::{LongHeaderType::*, LongType::*};
        match ty {
            Initial => LONG_HEADER_FORM | FIXED_BIT,
            Standard(ZeroRtt) => LONG_HEADER_FORM | FIXED_BIT | (0x1 << 4),
            Standard(Handshake) => LONG_HEADER_FORM | FIXED_BIT | (0x2 << 4),
        }
    }
}

/// Long packet types with uniform header structure
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum LongType {
    Handshake,
    ZeroRtt,
}

/// Errors encountered while decoding a packet header
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum PacketDecodeError {
    /// The packet names a QUIC version this crate does not implement
    #[error("unsupported version")]
    UnsupportedVersion {
        /// Source connection ID carried by the packet
        src: ConnectionId,
        /// Destination connection ID carried by the packet
        destination: ConnectionId,
    },
    /// The header violates the invariant layout
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),
}

impl From<coding::UnexpectedEnd> for PacketDecodeError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        Self::InvalidHeader("unexpected end of packet")
    }
}

pub(crate) const LONG_HEADER_FORM: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;
pub(crate) const SPIN_BIT: u8 = 0x20;
const SHORT_RESERVED_BITS: u8 = 0x18;
const LONG_RESERVED_BITS: u8 = 0x0c;
const KEY_PHASE_BIT: u8 = 0x04;

/// Packet number space identifiers
///
/// Each space has an independent, monotonic packet number sequence; 0-RTT and
/// 1-RTT packets share the application data space.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum SpaceId {
    /// Unprotected packets, used to bootstrap the handshake
    Initial = 0,
    Handshake = 1,
    /// Application data space, used for 0-RTT and post-handshake/1-RTT packets
    Data = 2,
}

impl SpaceId {
    pub fn iter() -> impl Iterator<Item = Self> {
        [Self::Initial, Self::Handshake, Self::Data].iter().cloned()
    }
}

/// Key epochs of a connection
///
/// Each level has its own key material and constrains the frame types a
/// packet may carry. Progression is monotonic for each role; `ZeroRtt` is
/// skipped server-side.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EncryptionLevel {
    Initial = 0,
    ZeroRtt = 1,
    Handshake = 2,
    OneRtt = 3,
}

impl EncryptionLevel {
    /// The packet number space packets at this level inhabit
    pub fn space(self) -> SpaceId {
        match self {
            Self::Initial => SpaceId::Initial,
            Self::Handshake => SpaceId::Handshake,
            Self::ZeroRtt | Self::OneRtt => SpaceId::Data,
        }
    }

    /// Whether packets at this level use the long header shape
    pub fn is_long_header(self) -> bool {
        self != Self::OneRtt
    }

    pub fn iter() -> impl Iterator<Item = Self> {
        [Self::Initial, Self::ZeroRtt, Self::Handshake, Self::OneRtt]
            .iter()
            .cloned()
    }
}
