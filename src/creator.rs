use bytes::Bytes;
use tracing::{debug, trace};

use crate::crypto::{HeaderKey, PacketKey};
use crate::frame::{self, Frame, StreamMeta, StreamMetaVec};
use crate::packet::{self, EncryptionLevel, Header, LongType, PacketNumber, SpaceId};
use crate::range_set::RangeSet;
use crate::shared::ConnectionId;
use crate::transport_error::Code as TransportErrorCode;
use crate::varint::VarInt;
use crate::{Side, StreamId, TransmissionType};

/// What the host should do with a freshly serialized packet
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketFate {
    /// Hand to the UDP writer immediately
    Send,
    /// Hold until the path or keys allow transmission
    Buffer,
    /// Combine with packets at other encryption levels into one datagram
    Coalesce,
    /// Drop without sending, e.g. when the connection is already closed
    Discard,
}

/// A fully serialized, encrypted packet and its retransmission record
pub struct SerializedPacket {
    pub packet_number: u64,
    pub level: EncryptionLevel,
    /// Encrypted bytes ready for the wire
    pub buffer: Vec<u8>,
    pub ack_eliciting: bool,
    pub transmission_type: TransmissionType,
    pub fate: PacketFate,
    /// Stream data carried, by range; payloads stay in the owning streams
    pub(crate) stream_frames: StreamMetaVec,
    /// Handshake data ranges carried
    pub(crate) crypto_ranges: Vec<std::ops::Range<u64>>,
    /// Retransmittable control frames carried
    pub(crate) control_frames: Vec<Frame>,
    /// Packet numbers acknowledged by this packet
    pub(crate) acks: RangeSet,
}

impl SerializedPacket {
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Stream data ranges the packet carries, for retransmission tracking
    pub fn stream_frames(&self) -> &[StreamMeta] {
        &self.stream_frames
    }
}

/// Receives serialized packets and unrecoverable serialization failures
///
/// Implemented by the session's transmit queue, which records each packet
/// for retransmission before handing it to the wire.
pub trait PacketSink {
    fn on_serialized_packet(&mut self, packet: SerializedPacket);
    fn on_unrecoverable_error(&mut self, code: TransportErrorCode, reason: &'static str);
}

struct SendKeys {
    header: Box<dyn HeaderKey>,
    packet: Box<dyn PacketKey>,
}

/// Accumulates frames into an in-progress packet and serializes encrypted
/// packets under the current encryption level
///
/// Frames are queued through [`add_frame`](Self::add_frame) until the fit
/// test fails, at which point the caller flushes and retries. Stream and
/// handshake data are fragmented across packet boundaries by the
/// [`consume_data`](Self::consume_data) family.
pub struct PacketCreator {
    side: Side,
    dst_cid: ConnectionId,
    src_cid: ConnectionId,
    /// Token to reproduce in Initial packet headers, from a NEW_TOKEN or Retry
    retry_token: Bytes,
    level: EncryptionLevel,
    send_keys: [Option<SendKeys>; 4],
    /// Next packet number, per space
    next_packet_number: [u64; 3],
    /// Wire length of packet numbers, updated only between packets
    packet_number_length: usize,
    queued_frames: Vec<Frame>,
    /// Plaintext size of the in-progress packet: header plus queued frames,
    /// with the trailing frame's length field omitted
    packet_size: usize,
    ack_eliciting: bool,
    transmission_type: TransmissionType,
    pending_padding_bytes: usize,
    needs_full_padding: bool,
    max_packet_length: usize,
    /// Hard limit latched while a soft limit is in effect
    latched_hard_max: Option<usize>,
}

impl PacketCreator {
    pub fn new(
        side: Side,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        max_packet_length: usize,
    ) -> Self {
        Self {
            side,
            dst_cid,
            src_cid,
            retry_token: Bytes::new(),
            level: EncryptionLevel::Initial,
            send_keys: [None, None, None, None],
            next_packet_number: [0; 3],
            packet_number_length: 1,
            queued_frames: Vec::new(),
            packet_size: 0,
            ack_eliciting: false,
            transmission_type: TransmissionType::NotRetransmission,
            pending_padding_bytes: 0,
            needs_full_padding: false,
            max_packet_length,
            latched_hard_max: None,
        }
    }

    //
    // Configuration
    //

    pub fn set_connection_ids(&mut self, dst_cid: ConnectionId, src_cid: ConnectionId) {
        self.dst_cid = dst_cid;
        self.src_cid = src_cid;
    }

    pub fn set_retry_token(&mut self, token: Bytes) {
        self.retry_token = token;
    }

    /// Install send-side keys for packets at `level`
    pub fn install_keys(
        &mut self,
        level: EncryptionLevel,
        header: Box<dyn HeaderKey>,
        packet: Box<dyn PacketKey>,
    ) {
        self.send_keys[level as usize] = Some(SendKeys { header, packet });
    }

    /// Discard keys for `level`, preventing any further sends there
    pub fn discard_keys(&mut self, level: EncryptionLevel) {
        self.send_keys[level as usize] = None;
    }

    pub fn has_keys(&self, level: EncryptionLevel) -> bool {
        self.send_keys[level as usize].is_some()
    }

    /// Switch the level future packets will be built at
    ///
    /// Must not be called with frames queued; flush first.
    pub fn set_encryption_level(&mut self, level: EncryptionLevel) {
        debug_assert!(
            self.queued_frames.is_empty(),
            "level changed mid-packet"
        );
        self.level = level;
    }

    pub fn level(&self) -> EncryptionLevel {
        self.level
    }

    pub fn set_transmission_type(&mut self, ty: TransmissionType) {
        self.transmission_type = ty;
    }

    /// Lower the packet size limit until the next fit failure
    ///
    /// Used to leave room when coalescing packets into one datagram. Ignored
    /// if `length` cannot hold a header plus minimum payload.
    pub fn set_soft_max_packet_length(&mut self, length: usize) {
        debug_assert!(self.queued_frames.is_empty());
        if length > self.max_packet_length {
            return;
        }
        if length < self.header_size() + MIN_PACKET_PAYLOAD + self.tag_len() {
            trace!(length, "soft limit too small to fit a packet header");
            return;
        }
        self.latched_hard_max = Some(self.latched_hard_max.unwrap_or(self.max_packet_length));
        self.max_packet_length = length;
    }

    /// Restore the hard limit; returns whether a soft limit was in effect
    pub fn remove_soft_max_packet_length(&mut self) -> bool {
        match self.latched_hard_max.take() {
            Some(hard) => {
                self.max_packet_length = hard;
                true
            }
            None => false,
        }
    }

    /// Raise or lower the hard packet length limit
    pub fn set_max_packet_length(&mut self, length: usize) {
        debug_assert!(self.queued_frames.is_empty());
        self.latched_hard_max = None;
        self.max_packet_length = length;
    }

    pub fn max_packet_length(&self) -> usize {
        self.max_packet_length
    }

    //
    // Packet numbers
    //

    pub fn next_packet_number(&self, space: SpaceId) -> u64 {
        self.next_packet_number[space as usize]
    }

    /// Choose the smallest packet number length that the peer can expand
    /// unambiguously
    ///
    /// No-op while frames are queued; the in-progress packet keeps the length
    /// it was started with.
    pub fn update_packet_number_length(&mut self, least_unacked: u64, max_in_flight: u64) {
        if !self.queued_frames.is_empty() {
            return;
        }
        let next = self.next_packet_number[self.level.space() as usize];
        debug_assert!(least_unacked <= next);
        let delta = (next - least_unacked).max(max_in_flight);
        let length = PacketNumber::min_len_for_range(delta.saturating_mul(4));
        if length != self.packet_number_length {
            trace!(
                from = self.packet_number_length,
                to = length,
                "updating packet number length"
            );
            self.packet_number_length = length;
        }
    }

    /// Leave a gap in the packet number sequence, e.g. to detect optimistic acks
    pub fn skip_packet_numbers(&mut self, count: u64, least_unacked: u64, max_in_flight: u64) {
        if !self.queued_frames.is_empty() {
            return;
        }
        let space = self.level.space() as usize;
        self.next_packet_number[space] += count;
        self.update_packet_number_length(least_unacked, max_in_flight);
    }

    //
    // Fit accounting
    //

    pub(crate) fn tag_len(&self) -> usize {
        self.send_keys[self.level as usize]
            .as_ref()
            .map_or(16, |keys| keys.packet.tag_len())
    }

    /// Header plus AEAD overhead of a packet at `level`, for sizing
    /// coalescing budgets before any frame is queued
    pub(crate) fn packet_overhead(&self, level: EncryptionLevel) -> usize {
        let token_len = if level == EncryptionLevel::Initial {
            self.retry_token.len()
        } else {
            0
        };
        packet::header_size(
            level,
            &self.dst_cid,
            &self.src_cid,
            self.packet_number_length,
            token_len,
        ) + self.send_keys[level as usize]
            .as_ref()
            .map_or(16, |keys| keys.packet.tag_len())
    }

    fn sample_size(&self) -> usize {
        self.send_keys[self.level as usize]
            .as_ref()
            .map_or(16, |keys| keys.header.sample_size())
    }

    fn max_plaintext_size(&self) -> usize {
        self.max_packet_length - self.tag_len()
    }

    fn header_size(&self) -> usize {
        let token_len = if self.level == EncryptionLevel::Initial {
            self.retry_token.len()
        } else {
            0
        };
        packet::header_size(
            self.level,
            &self.dst_cid,
            &self.src_cid,
            self.packet_number_length,
            token_len,
        )
    }

    /// Size of the in-progress packet, before encryption expansion
    pub fn packet_size(&self) -> usize {
        if self.queued_frames.is_empty() {
            self.header_size()
        } else {
            self.packet_size
        }
    }

    /// Bytes the previously-last frame will grow by when another frame follows it
    ///
    /// A trailing STREAM or DATAGRAM frame omits its length field; appending
    /// anything after it forces the length to be encoded.
    fn expansion_on_new_frame(&self) -> usize {
        match self.queued_frames.last() {
            Some(Frame::Stream(x)) => VarInt::size_of(x.data.len() as u64),
            Some(Frame::Datagram(x)) => VarInt::size_of(x.data.len() as u64),
            _ => 0,
        }
    }

    /// Room left for another frame in the current packet
    pub fn bytes_free(&self) -> usize {
        let max = self.max_plaintext_size();
        max - max.min(self.packet_size() + self.expansion_on_new_frame())
    }

    pub fn has_pending_frames(&self) -> bool {
        !self.queued_frames.is_empty()
    }

    pub fn has_pending_stream_frames(&self) -> bool {
        self.queued_frames
            .iter()
            .any(|f| matches!(f, Frame::Stream(_)))
    }

    pub fn has_pending_crypto_frames(&self) -> bool {
        self.queued_frames
            .iter()
            .any(|f| matches!(f, Frame::Crypto(_)))
    }

    /// Whether a stream frame at `offset` could make progress in this packet,
    /// lifting any soft limit if it is what stands in the way
    pub fn has_room_for_stream_frame(&mut self, id: StreamId, offset: u64) -> bool {
        let min_size = frame::Stream::overhead(id, offset);
        if self.bytes_free() > min_size {
            return true;
        }
        if !self.remove_soft_max_packet_length() {
            return false;
        }
        self.bytes_free() > min_size
    }

    /// Whether a DATAGRAM frame of `length` payload bytes fits
    pub fn has_room_for_datagram_frame(&mut self, length: usize) -> bool {
        let size = 1 + VarInt::size_of(length as u64) + length;
        if self.bytes_free() >= size {
            return true;
        }
        if !self.remove_soft_max_packet_length() {
            return false;
        }
        self.bytes_free() >= size
    }

    //
    // Frame entry points
    //

    /// Queue `frame` in the current packet
    ///
    /// Returns `false` when the frame does not fit; the caller must flush and
    /// retry. Stream frames abutting the previously queued frame for the same
    /// stream are merged in place.
    pub fn add_frame(&mut self, frame: Frame, transmission_type: TransmissionType) -> bool {
        // `bytes_free` already accounts for the length field the trailing
        // frame gains when it stops being last
        let len = frame.size(true);
        if len > self.bytes_free()
            && (!self.remove_soft_max_packet_length() || len > self.bytes_free())
        {
            return false;
        }

        if self.queued_frames.is_empty() {
            self.packet_size = self.header_size();
            self.transmission_type = transmission_type;
        }

        // Merge a stream frame that continues the previous one
        if let Frame::Stream(ref new) = frame {
            if let Some(Frame::Stream(last)) = self.queued_frames.last_mut() {
                if last.id == new.id && last.offset + last.data.len() as u64 == new.offset {
                    debug_assert!(!last.fin, "data appended after fin");
                    let mut merged = Vec::with_capacity(last.data.len() + new.data.len());
                    merged.extend_from_slice(&last.data);
                    merged.extend_from_slice(&new.data);
                    last.data = merged.into();
                    last.fin = new.fin;
                    // The merged frame remains last, so its length stays omitted
                    self.packet_size += new.data.len();
                    self.ack_eliciting = true;
                    return true;
                }
            }
        }

        self.packet_size += len + self.expansion_on_new_frame();
        self.ack_eliciting |= frame.is_ack_eliciting();
        trace!(?frame, size = len, "queued");
        self.queued_frames.push(frame);
        true
    }

    /// Queue `frame` and pad its packet to the maximum length
    pub fn add_padded_frame(&mut self, frame: Frame, transmission_type: TransmissionType) -> bool {
        if self.add_frame(frame, transmission_type) {
            self.needs_full_padding = true;
            return true;
        }
        false
    }

    /// Request `n` bytes of padding, spread across this and subsequent packets
    pub fn add_pending_padding(&mut self, n: usize) {
        self.pending_padding_bytes += n;
    }

    /// Fragment stream data across as many packets as necessary
    ///
    /// Returns the bytes consumed and whether the FIN was consumed. Stream
    /// data never shares a packet with CRYPTO frames, and is refused below
    /// the 0-RTT level.
    pub fn consume_data(
        &mut self,
        id: StreamId,
        offset: u64,
        data: &[u8],
        fin: bool,
        transmission_type: TransmissionType,
        sink: &mut impl PacketSink,
    ) -> (usize, bool) {
        if self.level == EncryptionLevel::Initial || self.level == EncryptionLevel::Handshake {
            sink.on_unrecoverable_error(
                TransportErrorCode::INTERNAL_ERROR,
                "attempted to send stream data during the handshake",
            );
            return (0, false);
        }
        if self.has_pending_crypto_frames() {
            self.flush(sink);
        }

        let mut consumed = 0;
        loop {
            let remaining = &data[consumed..];
            if remaining.is_empty() && !fin {
                break;
            }
            let offset = offset + consumed as u64;
            if !self.has_room_for_stream_frame(id, offset) {
                self.flush(sink);
                continue;
            }
            let overhead = frame::Stream::overhead(id, offset);
            let capacity = self.bytes_free() - overhead;
            let take = capacity.min(remaining.len());
            let frame = frame::Stream {
                id,
                offset,
                fin: fin && take == remaining.len(),
                data: Bytes::copy_from_slice(&remaining[..take]),
            };
            let fin_consumed = frame.fin;
            if !self.add_frame(Frame::Stream(frame), transmission_type) {
                // Lost a race against padding debt; flush and retry
                self.flush(sink);
                continue;
            }
            consumed += take;
            if fin_consumed {
                return (consumed, true);
            }
            if consumed == data.len() {
                break;
            }
            // Packet is full; keep fragmenting
            self.flush(sink);
        }
        (consumed, false)
    }

    /// Fragment handshake data across as many packets as necessary
    ///
    /// Returns the bytes consumed. CRYPTO frames never share a packet with
    /// stream data.
    pub fn consume_crypto_data(
        &mut self,
        offset: u64,
        data: &[u8],
        transmission_type: TransmissionType,
        sink: &mut impl PacketSink,
    ) -> usize {
        if self.has_pending_stream_frames() {
            self.flush(sink);
        }
        let mut consumed = 0;
        while consumed < data.len() {
            let remaining = &data[consumed..];
            let offset = offset + consumed as u64;
            let min_size =
                1 + VarInt::size_of(offset) + VarInt::size_of(remaining.len() as u64);
            if self.bytes_free() <= min_size
                && (!self.remove_soft_max_packet_length() || self.bytes_free() <= min_size)
            {
                self.flush(sink);
                continue;
            }
            let take = (self.bytes_free() - min_size).min(remaining.len());
            let frame = frame::Crypto {
                offset,
                data: Bytes::copy_from_slice(&remaining[..take]),
            };
            if !self.add_frame(Frame::Crypto(frame), transmission_type) {
                self.flush(sink);
                continue;
            }
            consumed += take;
            if consumed < data.len() {
                self.flush(sink);
            }
        }
        consumed
    }

    //
    // Serialization
    //

    /// Serialize, encrypt, and emit the in-progress packet
    ///
    /// A no-op when nothing is queued and no padding debt exists.
    pub fn flush(&mut self, sink: &mut impl PacketSink) {
        if self.queued_frames.is_empty() && self.pending_padding_bytes == 0 {
            return;
        }
        let space = self.level.space();
        if self.send_keys[self.level as usize].is_none() {
            sink.on_unrecoverable_error(
                TransportErrorCode::INTERNAL_ERROR,
                "no keys installed for the current encryption level",
            );
            self.clear_packet();
            return;
        }
        let number = self.next_packet_number[space as usize];
        if number >= 1 << 62 {
            sink.on_unrecoverable_error(
                TransportErrorCode::INTERNAL_ERROR,
                "packet number space exhausted",
            );
            self.clear_packet();
            return;
        }
        let pn_len = self.packet_number_length;
        let pn = PacketNumber::with_len(number, pn_len);

        let header = match self.level {
            EncryptionLevel::Initial => Header::Initial {
                dst_cid: self.dst_cid,
                src_cid: self.src_cid,
                token: self.retry_token.clone(),
                number: pn,
            },
            EncryptionLevel::Handshake => Header::Long {
                ty: LongType::Handshake,
                dst_cid: self.dst_cid,
                src_cid: self.src_cid,
                number: pn,
            },
            EncryptionLevel::ZeroRtt => Header::Long {
                ty: LongType::ZeroRtt,
                dst_cid: self.dst_cid,
                src_cid: self.src_cid,
                number: pn,
            },
            EncryptionLevel::OneRtt => Header::Short {
                spin: false,
                key_phase: false,
                dst_cid: self.dst_cid,
                number: pn,
            },
        };

        let mut buffer = Vec::with_capacity(self.max_packet_length);
        let partial = header.encode(&mut buffer);
        let header_len = buffer.len();
        debug_assert_eq!(header_len, self.header_size());

        // Header protection samples ciphertext starting four bytes past the
        // start of the packet number; tiny packets take padding to cover it.
        let projected_payload = self.packet_size().saturating_sub(header_len);
        let required_payload =
            (4 + self.sample_size()).saturating_sub(pn_len + self.tag_len());
        if projected_payload < required_payload {
            self.pending_padding_bytes += required_payload - projected_payload;
        }

        // Padding after the final frame forces its length field; the field
        // itself comes out of the padding budget
        let final_expansion = self.expansion_on_new_frame();
        let free_at_end = self.max_plaintext_size() - self.packet_size();
        let padding_budget = free_at_end.saturating_sub(final_expansion);
        let trailing_padding = if padding_budget == 0 {
            0
        } else if self.needs_full_padding {
            padding_budget
        } else {
            self.pending_padding_bytes.min(padding_budget)
        };

        let n = self.queued_frames.len();
        for (i, frame) in self.queued_frames.iter().enumerate() {
            let last = i + 1 == n && trailing_padding == 0;
            frame.encode(last, &mut buffer);
        }
        if trailing_padding > 0 {
            buffer.resize(buffer.len() + trailing_padding, 0);
            self.pending_padding_bytes = self.pending_padding_bytes.saturating_sub(trailing_padding);
        }
        debug_assert!(buffer.len() <= self.max_plaintext_size());

        let keys = self.send_keys[self.level as usize].as_ref().unwrap();
        buffer.resize(buffer.len() + keys.packet.tag_len(), 0);
        partial.finish(&mut buffer, &*keys.header, number, &*keys.packet);

        self.next_packet_number[space as usize] += 1;

        // Split the retransmission record out of the queued frames
        let mut stream_frames = StreamMetaVec::new();
        let mut crypto_ranges = Vec::new();
        let mut control_frames = Vec::new();
        let mut acks = RangeSet::new();
        for frame in self.queued_frames.drain(..) {
            match frame {
                Frame::Stream(x) => stream_frames.push(StreamMeta {
                    id: x.id,
                    offsets: x.offset..x.offset + x.data.len() as u64,
                    fin: x.fin,
                }),
                Frame::Crypto(x) => {
                    crypto_ranges.push(x.offset..x.offset + x.data.len() as u64)
                }
                Frame::Ack(x) => {
                    for range in x.iter() {
                        acks.insert(*range.start()..*range.end() + 1);
                    }
                }
                x if x.is_retransmittable() => control_frames.push(x),
                _ => {}
            }
        }

        let packet = SerializedPacket {
            packet_number: number,
            level: self.level,
            ack_eliciting: self.ack_eliciting,
            transmission_type: self.transmission_type,
            fate: if self.level.is_long_header() {
                PacketFate::Coalesce
            } else {
                PacketFate::Send
            },
            buffer,
            stream_frames,
            crypto_ranges,
            control_frames,
            acks,
        };
        debug!(
            number,
            level = ?self.level,
            len = packet.buffer.len(),
            "serialized packet"
        );
        self.clear_packet();
        sink.on_serialized_packet(packet);
    }

    fn clear_packet(&mut self) {
        self.queued_frames.clear();
        self.packet_size = 0;
        self.ack_eliciting = false;
        self.needs_full_padding = false;
        self.transmission_type = TransmissionType::NotRetransmission;
    }

    //
    // Probes
    //

    /// Serialize a padded PING at a trial packet length, leaving limits intact
    pub fn generate_mtu_probe(&mut self, target: usize, sink: &mut impl PacketSink) {
        self.flush(sink);
        let hard = self.max_packet_length;
        let latched = self.latched_hard_max.take();
        self.max_packet_length = target;
        self.add_padded_frame(Frame::Ping, TransmissionType::NotRetransmission);
        self.flush(sink);
        self.max_packet_length = hard;
        self.latched_hard_max = latched;
    }

    /// Serialize a PATH_CHALLENGE or PATH_RESPONSE alone in a padded packet
    ///
    /// Only meaningful at 1-RTT; the session enforces the level.
    pub fn serialize_path_probe(&mut self, frame: Frame, sink: &mut impl PacketSink) {
        debug_assert!(matches!(
            frame,
            Frame::PathChallenge(_) | Frame::PathResponse(_)
        ));
        self.flush(sink);
        self.add_padded_frame(frame, TransmissionType::NotRetransmission);
        self.flush(sink);
    }

    pub fn side(&self) -> Side {
        self.side
    }
}

/// Smallest payload a packet may carry; see the header protection rules
const MIN_PACKET_PAYLOAD: usize = 3;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::null;
    use crate::frame::Iter;
    use crate::packet::PartialDecode;

    #[derive(Default)]
    struct Sink {
        packets: Vec<SerializedPacket>,
        errors: Vec<&'static str>,
    }

    impl PacketSink for Sink {
        fn on_serialized_packet(&mut self, packet: SerializedPacket) {
            self.packets.push(packet);
        }
        fn on_unrecoverable_error(&mut self, _code: TransportErrorCode, reason: &'static str) {
            self.errors.push(reason);
        }
    }

    fn creator_at(level: EncryptionLevel) -> PacketCreator {
        let mut creator = PacketCreator::new(
            Side::Client,
            ConnectionId::new(&[0xaa; 8]),
            ConnectionId::new(&[0xbb; 8]),
            1200,
        );
        let keys = null::keys(16);
        creator.install_keys(level, keys.header.local, keys.packet.local);
        creator.set_encryption_level(level);
        creator
    }

    fn payload_frames(packet: &SerializedPacket, local_cid_len: usize) -> Vec<Frame> {
        let (decode, rest) =
            PartialDecode::new(packet.buffer.as_slice().into(), local_cid_len).unwrap();
        assert!(rest.is_none());
        let keys = null::keys(16);
        let decoded = decode.finish(&*keys.header.remote).unwrap();
        let mut payload = decoded.payload;
        keys.packet
            .remote
            .decrypt(packet.packet_number, &decoded.header_data, &mut payload)
            .unwrap();
        Iter::new(payload.freeze())
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn single_stream_frame_packet() {
        let mut creator = creator_at(EncryptionLevel::OneRtt);
        let mut sink = Sink::default();
        let (consumed, fin) = creator.consume_data(
            StreamId(0),
            0,
            b"hello",
            true,
            TransmissionType::NotRetransmission,
            &mut sink,
        );
        assert_eq!((consumed, fin), (5, true));
        creator.flush(&mut sink);
        assert_eq!(sink.packets.len(), 1);
        let packet = &sink.packets[0];
        assert_eq!(packet.packet_number, 0);
        assert!(packet.ack_eliciting);
        assert_eq!(packet.stream_frames.len(), 1);
        assert_eq!(packet.stream_frames[0].offsets, 0..5);
        assert!(packet.stream_frames[0].fin);
        let frames = payload_frames(packet, 8);
        let stream = frames
            .iter()
            .find_map(|f| match f {
                Frame::Stream(s) => Some(s),
                _ => None,
            })
            .unwrap();
        assert_eq!(&stream.data[..], b"hello");
        assert!(stream.fin);
        assert_eq!(stream.offset, 0);
    }

    #[test]
    fn data_splits_across_packets() {
        let mut creator = creator_at(EncryptionLevel::OneRtt);
        let mut sink = Sink::default();
        let data = vec![0x42; 3000];
        let (consumed, fin) = creator.consume_data(
            StreamId(0),
            0,
            &data,
            true,
            TransmissionType::NotRetransmission,
            &mut sink,
        );
        creator.flush(&mut sink);
        assert_eq!(consumed, 3000);
        assert!(fin);
        assert!(sink.packets.len() >= 2);
        // First fragment fills the packet and carries no FIN
        assert!(!sink.packets[0].stream_frames[0].fin);
        assert_eq!(sink.packets[0].buffer.len(), 1200);
        // Offsets chain with no gap or overlap, FIN on the last
        let mut offset = 0;
        for (i, packet) in sink.packets.iter().enumerate() {
            let meta = &packet.stream_frames[0];
            assert_eq!(meta.offsets.start, offset);
            offset = meta.offsets.end;
            assert_eq!(meta.fin, i == sink.packets.len() - 1);
        }
        assert_eq!(offset, 3000);
    }

    #[test]
    fn abutting_stream_frames_merge() {
        let mut creator = creator_at(EncryptionLevel::OneRtt);
        let mut sink = Sink::default();
        creator.consume_data(
            StreamId(4),
            0,
            b"abc",
            false,
            TransmissionType::NotRetransmission,
            &mut sink,
        );
        creator.consume_data(
            StreamId(4),
            3,
            b"def",
            true,
            TransmissionType::NotRetransmission,
            &mut sink,
        );
        creator.flush(&mut sink);
        assert_eq!(sink.packets.len(), 1);
        let packet = &sink.packets[0];
        assert_eq!(packet.stream_frames.len(), 1);
        assert_eq!(packet.stream_frames[0].offsets, 0..6);
        assert!(packet.stream_frames[0].fin);
    }

    #[test]
    fn crypto_and_stream_data_never_mix() {
        let mut creator = creator_at(EncryptionLevel::OneRtt);
        let mut sink = Sink::default();
        creator.consume_crypto_data(0, b"ticket", TransmissionType::NotRetransmission, &mut sink);
        creator.consume_data(
            StreamId(0),
            0,
            b"data",
            false,
            TransmissionType::NotRetransmission,
            &mut sink,
        );
        creator.flush(&mut sink);
        assert_eq!(sink.packets.len(), 2);
        assert!(!sink.packets[0].crypto_ranges.is_empty());
        assert!(sink.packets[0].stream_frames.is_empty());
        assert!(sink.packets[1].crypto_ranges.is_empty());
        assert!(!sink.packets[1].stream_frames.is_empty());
    }

    #[test]
    fn stream_data_refused_during_handshake() {
        let mut creator = creator_at(EncryptionLevel::Initial);
        let mut sink = Sink::default();
        let (consumed, _) = creator.consume_data(
            StreamId(0),
            0,
            b"too early",
            false,
            TransmissionType::NotRetransmission,
            &mut sink,
        );
        assert_eq!(consumed, 0);
        assert_eq!(sink.errors.len(), 1);
    }

    #[test]
    fn full_padding_reaches_max() {
        let mut creator = creator_at(EncryptionLevel::Initial);
        let mut sink = Sink::default();
        assert!(creator.add_padded_frame(
            Frame::Crypto(frame::Crypto {
                offset: 0,
                data: Bytes::from_static(b"client hello"),
            }),
            TransmissionType::NotRetransmission,
        ));
        creator.flush(&mut sink);
        assert_eq!(sink.packets.len(), 1);
        assert_eq!(sink.packets[0].buffer.len(), 1200);
        let frames = payload_frames(&sink.packets[0], 8);
        assert!(frames.iter().any(|f| matches!(f, Frame::Padding)));
    }

    #[test]
    fn pending_padding_bleeds_across_packets() {
        let mut creator = creator_at(EncryptionLevel::OneRtt);
        let mut sink = Sink::default();
        creator.add_pending_padding(40);
        creator.add_frame(Frame::Ping, TransmissionType::NotRetransmission);
        creator.flush(&mut sink);
        assert_eq!(sink.packets.len(), 1);
        // All padding fit in the first packet
        creator.add_frame(Frame::Ping, TransmissionType::NotRetransmission);
        creator.flush(&mut sink);
        assert!(sink.packets[0].buffer.len() > sink.packets[1].buffer.len());
    }

    #[test]
    fn min_plaintext_enforced_for_header_protection() {
        let mut creator = creator_at(EncryptionLevel::OneRtt);
        let mut sink = Sink::default();
        creator.add_frame(Frame::Ping, TransmissionType::NotRetransmission);
        creator.flush(&mut sink);
        let packet = &sink.packets[0];
        // 1 byte short header flags + 8 cid + 1 pn, then payload + 16 tag
        // must cover the 4 + sample_size protection window
        let header_len = 1 + 8 + 1;
        assert!(packet.buffer.len() - header_len >= 4 - 1 + 16);
    }

    #[test]
    fn soft_max_cleared_on_fit_failure() {
        let mut creator = creator_at(EncryptionLevel::OneRtt);
        creator.set_soft_max_packet_length(60);
        // Too big for the soft limit; fit test falls back to the hard limit
        let big = Frame::Crypto(frame::Crypto {
            offset: 0,
            data: Bytes::from(vec![0; 500]),
        });
        assert!(creator.add_frame(big, TransmissionType::NotRetransmission));
        assert_eq!(creator.max_packet_length(), 1200);
    }

    #[test]
    fn packet_numbers_increment_per_space(){
        let mut creator = creator_at(EncryptionLevel::OneRtt);
        let keys = null::keys(16);
        creator.install_keys(EncryptionLevel::Initial, keys.header.local, keys.packet.local);
        let mut sink = Sink::default();
        creator.add_frame(Frame::Ping, TransmissionType::NotRetransmission);
        creator.flush(&mut sink);
        creator.add_frame(Frame::Ping, TransmissionType::NotRetransmission);
        creator.flush(&mut sink);
        assert_eq!(sink.packets[0].packet_number, 0);
        assert_eq!(sink.packets[1].packet_number, 1);
        // A different space starts over at zero
        creator.set_encryption_level(EncryptionLevel::Initial);
        creator.add_frame(Frame::Ping, TransmissionType::NotRetransmission);
        creator.flush(&mut sink);
        assert_eq!(sink.packets[2].packet_number, 0);
    }

    #[test]
    fn mtu_probe_restores_limits() {
        let mut creator = creator_at(EncryptionLevel::OneRtt);
        let mut sink = Sink::default();
        creator.generate_mtu_probe(1400, &mut sink);
        assert_eq!(sink.packets.len(), 1);
        assert_eq!(sink.packets[0].buffer.len(), 1400);
        assert_eq!(creator.max_packet_length(), 1200);
    }

    #[test]
    fn path_probe_is_padded_and_alone() {
        let mut creator = creator_at(EncryptionLevel::OneRtt);
        let mut sink = Sink::default();
        creator.add_frame(Frame::Ping, TransmissionType::NotRetransmission);
        creator.serialize_path_probe(Frame::PathChallenge(0x1234), &mut sink);
        assert_eq!(sink.packets.len(), 2);
        // The probe rode alone, after the queued ping flushed
        assert_eq!(sink.packets[1].buffer.len(), 1200);
        let frames = payload_frames(&sink.packets[1], 8);
        assert!(frames
            .iter()
            .any(|f| matches!(f, Frame::PathChallenge(0x1234))));
        assert!(!frames.iter().any(|f| matches!(f, Frame::Ping)));
    }

    #[test]
    fn packet_number_length_tracks_delta() {
        let mut creator = creator_at(EncryptionLevel::OneRtt);
        creator.update_packet_number_length(0, 0);
        let mut sink = Sink::default();
        creator.add_frame(Frame::Ping, TransmissionType::NotRetransmission);
        creator.flush(&mut sink);
        // A large in-flight count forces a longer encoding
        creator.update_packet_number_length(0, 1 << 14);
        creator.add_frame(Frame::Ping, TransmissionType::NotRetransmission);
        creator.flush(&mut sink);
        let short = &sink.packets[0].buffer;
        let long = &sink.packets[1].buffer;
        // Header grew by the extra packet number bytes
        assert_eq!(short[0] & 0x03, 0);
        assert_eq!(long[0] & 0x03, 2);
    }

    #[test]
    fn skipped_numbers_are_not_reused() {
        let mut creator = creator_at(EncryptionLevel::OneRtt);
        let mut sink = Sink::default();
        creator.skip_packet_numbers(7, 0, 0);
        creator.add_frame(Frame::Ping, TransmissionType::NotRetransmission);
        creator.flush(&mut sink);
        assert_eq!(sink.packets[0].packet_number, 7);
    }
}
