use std::collections::BTreeMap;
use std::mem;
use std::ops::Range;

use crate::assembler::Assembler;
use crate::frame::{Frame, StreamMetaVec};
use crate::range_set::RangeSet;

/// Mutable state specific to one packet number space
///
/// Keys live with their users: send halves in the packet creator, receive
/// halves beside the session's decode path.
pub(crate) struct PacketSpace {
    pub(crate) dedup: Dedup,
    /// Highest received packet number
    pub(crate) rx_packet: u64,

    /// Packet numbers to acknowledge
    pub(crate) pending_acks: RangeSet,
    /// Set iff we have received an ack-eliciting frame since the last ack we sent
    pub(crate) permit_ack_only: bool,

    /// The packet number of the next packet that will be sent, if any
    pub(crate) next_packet_number: u64,
    /// The largest packet number the remote peer acknowledged in an ACK frame
    pub(crate) largest_acked: Option<u64>,
    /// Transmitted but not acked
    // BTreeMap to efficiently iterate from the oldest on ack and loss
    pub(crate) sent_packets: BTreeMap<u64, SentPacket>,

    /// Incoming cryptographic handshake stream
    pub(crate) crypto_stream: Assembler,
    /// Current offset of the outgoing cryptographic handshake stream
    pub(crate) crypto_offset: u64,
    /// Sent handshake ranges awaiting retransmission after loss
    pub(crate) crypto_retransmits: RangeSet,
    /// Outgoing handshake bytes buffered until they are packed
    pub(crate) crypto_pending: Vec<u8>,
    /// Everything sent so far, kept until the space retires so lost ranges
    /// can be reproduced
    pub(crate) crypto_sent_data: Vec<u8>,
}

impl PacketSpace {
    pub(crate) fn new() -> Self {
        Self {
            dedup: Dedup::new(),
            rx_packet: 0,
            pending_acks: RangeSet::new(),
            permit_ack_only: false,
            next_packet_number: 0,
            largest_acked: None,
            sent_packets: BTreeMap::new(),
            crypto_stream: Assembler::new(),
            crypto_offset: 0,
            crypto_retransmits: RangeSet::new(),
            crypto_pending: Vec::new(),
            crypto_sent_data: Vec::new(),
        }
    }

    /// Whether an acknowledgment-bearing packet is currently owed
    pub(crate) fn wants_ack(&self) -> bool {
        self.permit_ack_only && !self.pending_acks.is_empty()
    }

    /// Whether any handshake bytes await (re)transmission
    pub(crate) fn has_crypto_data(&self) -> bool {
        !self.crypto_pending.is_empty() || !self.crypto_retransmits.is_empty()
    }

    /// Number of ack-eliciting packets in flight in this space
    pub(crate) fn ack_eliciting_in_flight(&self) -> u64 {
        self.sent_packets
            .values()
            .filter(|x| x.ack_eliciting)
            .count() as u64
    }

    /// Lowest packet number that remains unacknowledged, for packet-number
    /// length selection
    pub(crate) fn least_unacked(&self) -> u64 {
        self.sent_packets
            .keys()
            .next()
            .copied()
            .unwrap_or(self.next_packet_number)
    }

    /// Forget all in-flight state, used when keys for the space are discarded
    pub(crate) fn discard(&mut self) -> BTreeMap<u64, SentPacket> {
        self.pending_acks.clear();
        self.permit_ack_only = false;
        self.crypto_retransmits.clear();
        self.crypto_pending.clear();
        self.crypto_sent_data.clear();
        mem::take(&mut self.sent_packets)
    }
}

/// Record of a transmitted packet, retained until it is acked or lost
#[derive(Debug, Default)]
pub(crate) struct SentPacket {
    /// Whether an acknowledgement is expected directly in response
    pub(crate) ack_eliciting: bool,
    /// The number of bytes sent, including framing and tag overhead
    pub(crate) size: u16,
    /// Stream data carried, without payload bytes; the owning streams keep those
    pub(crate) stream_frames: StreamMetaVec,
    /// Handshake data ranges carried
    pub(crate) crypto_ranges: Vec<Range<u64>>,
    /// Retransmittable control frames carried
    pub(crate) control_frames: Vec<Frame>,
    /// Packet number ranges acknowledged by this packet
    pub(crate) acks: RangeSet,
}

/// RFC 4303-style sliding window packet number deduplicator
///
/// A contiguous bitfield where each bit corresponds to a packet number below
/// the highest authenticated one. Numbers left of the window are assumed seen;
/// QUIC never reuses packet numbers, so the window only needs to cover
/// plausible reordering.
pub(crate) struct Dedup {
    window: u128,
    /// Lowest packet number higher than all yet authenticated
    next: u64,
}

/// Packet numbers tracked in the window, plus the implicit highest bit
const WINDOW_SIZE: u64 = 1 + mem::size_of::<u128>() as u64 * 8;

impl Dedup {
    pub(crate) fn new() -> Self {
        Self { window: 0, next: 0 }
    }

    fn highest(&self) -> u64 {
        self.next - 1
    }

    /// Record a newly authenticated packet number, returning whether it might
    /// be a duplicate
    pub(crate) fn insert(&mut self, packet: u64) -> bool {
        if let Some(diff) = packet.checked_sub(self.next) {
            // Right of the window
            self.window = (self.window << 1 | 1)
                .checked_shl(diff.min(u64::from(u32::MAX)) as u32)
                .unwrap_or(0);
            self.next = packet + 1;
            false
        } else if self.highest() - packet < WINDOW_SIZE {
            // Within the window
            if let Some(bit) = (self.highest() - packet).checked_sub(1) {
                let mask = 1 << bit;
                let duplicate = self.window & mask != 0;
                self.window |= mask;
                duplicate
            } else {
                // == highest
                true
            }
        } else {
            // Left of the window
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_sanity() {
        let mut dedup = Dedup::new();
        assert!(!dedup.insert(0));
        assert!(dedup.insert(0));
        assert!(!dedup.insert(1));
        assert!(!dedup.insert(2));
        assert!(!dedup.insert(4));
        assert!(!dedup.insert(7));
        assert!(dedup.insert(4));
        assert!(!dedup.insert(3));
        assert!(!dedup.insert(6));
        assert!(!dedup.insert(5));
        assert!(dedup.insert(5));
    }

    #[test]
    fn dedup_happypath() {
        let mut dedup = Dedup::new();
        for i in 0..(2 * WINDOW_SIZE) {
            assert!(!dedup.insert(i));
            for j in 0..=i {
                assert!(dedup.insert(j));
            }
        }
    }

    #[test]
    fn dedup_jump() {
        let mut dedup = Dedup::new();
        dedup.insert(2 * WINDOW_SIZE);
        // Fell off the left edge
        assert!(dedup.insert(WINDOW_SIZE));
        // Still inside
        assert!(!dedup.insert(WINDOW_SIZE + 1));
        assert!(dedup.insert(WINDOW_SIZE + 1));
    }

    #[test]
    fn least_unacked_tracks_oldest() {
        let mut space = PacketSpace::new();
        assert_eq!(space.least_unacked(), 0);
        space.next_packet_number = 5;
        assert_eq!(space.least_unacked(), 5);
        space.sent_packets.insert(2, SentPacket::default());
        space.sent_packets.insert(4, SentPacket::default());
        assert_eq!(space.least_unacked(), 2);
    }
}
