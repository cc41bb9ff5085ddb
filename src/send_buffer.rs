use std::ops::Range;

use bytes::{Buf, BytesMut};

use crate::range_set::RangeSet;

/// Buffer of outgoing retransmittable stream data
///
/// Bytes live here from the application's `write` until the wire confirms
/// delivery; losing a range moves it back into the transmit schedule.
#[derive(Default, Debug)]
pub struct SendBuffer {
    /// Written but unacknowledged data. May or may not have been sent.
    unacked: BytesMut,
    /// The first offset past the end of `unacked`
    offset: u64,
    /// The first offset that has never been transmitted
    ///
    /// Always lies in (offset - unacked.len())..=offset
    unsent: u64,
    /// Acknowledged ranges that cannot be discarded yet because they don't
    /// include the earliest unacked offset
    acks: RangeSet,
    /// Previously transmitted ranges deemed lost
    retransmits: RangeSet,
}

impl SendBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append application data to the end of the stream
    pub fn write(&mut self, data: &[u8]) {
        self.unacked.extend_from_slice(data);
        self.offset += data.len() as u64;
    }

    /// Discard a range of acknowledged stream data
    pub fn ack(&mut self, range: Range<u64>) {
        // A range acked by a retransmission no longer needs resending
        self.retransmits.remove(range.clone());
        self.acks.insert(range);
        while self.acks.min() == Some(self.offset - self.unacked.len() as u64) {
            let prefix = self.acks.pop_min().unwrap();
            self.unacked.advance((prefix.end - prefix.start) as usize);
        }
    }

    /// Compute the next range to transmit and update state to account for it
    ///
    /// Pending retransmissions are drained before fresh data.
    pub fn poll_transmit(&mut self, max_len: usize) -> Range<u64> {
        if let Some(range) = self.retransmits.pop_min() {
            let end = range.end.min((max_len as u64).saturating_add(range.start));
            if end != range.end {
                self.retransmits.insert(end..range.end);
            }
            return range.start..end;
        }
        let end = self.offset.min((max_len as u64).saturating_add(self.unsent));
        let result = self.unsent..end;
        self.unsent = end;
        result
    }

    /// The bytes at `offsets`, which must be unacknowledged
    pub fn get(&self, offsets: Range<u64>) -> &[u8] {
        let base_offset = self.offset - self.unacked.len() as u64;
        let start = (offsets.start - base_offset) as usize;
        let end = (offsets.end - base_offset) as usize;
        &self.unacked[start..end]
    }

    /// Queue a sent but unacknowledged range for retransmission
    ///
    /// Ranges already acknowledged (by a duplicate transmission in a later
    /// packet) are skipped.
    pub fn retransmit(&mut self, range: Range<u64>) {
        debug_assert!(range.end <= self.unsent, "unsent data can't be lost");
        let base_offset = self.offset - self.unacked.len() as u64;
        let start = range.start.max(base_offset);
        if start >= range.end {
            return;
        }
        let mut pending = start..range.end;
        for acked in self.acks.iter() {
            if acked.start >= pending.end {
                break;
            }
            if acked.start > pending.start {
                self.retransmits.insert(pending.start..acked.start);
            }
            pending.start = pending.start.max(acked.end);
        }
        if pending.start < pending.end {
            self.retransmits.insert(pending);
        }
    }

    /// First stream offset unwritten by the application
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Whether all sent data has been acknowledged
    pub fn is_fully_acked(&self) -> bool {
        self.unacked.is_empty()
    }

    /// Whether there's data left to send, fresh or requeued
    pub fn has_unsent_data(&self) -> bool {
        self.unsent != self.offset || !self.retransmits.is_empty()
    }

    /// The amount of data that has not been acknowledged
    pub fn unacked(&self) -> u64 {
        self.unacked.len() as u64 - self.acks.total()
    }

    /// Discard all buffered data, e.g. on reset
    pub fn discard(&mut self) {
        self.unacked.clear();
        self.unsent = self.offset;
        self.acks.clear();
        self.retransmits.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSG: &[u8] = b"Hello, world!";

    #[test]
    fn fragment() {
        let mut buf = SendBuffer::new();
        buf.write(MSG);
        assert_eq!(buf.poll_transmit(5), 0..5);
        assert_eq!(buf.poll_transmit(MSG.len() - 5), 5..MSG.len() as u64);
        assert_eq!(buf.poll_transmit(42), MSG.len() as u64..MSG.len() as u64);
    }

    #[test]
    fn retransmit_before_fresh_data() {
        let mut buf = SendBuffer::new();
        buf.write(MSG);
        assert_eq!(buf.poll_transmit(5), 0..5);
        assert_eq!(buf.poll_transmit(2), 5..7);
        // Lose the first, but not the second
        buf.retransmit(0..5);
        assert_eq!(buf.poll_transmit(5), 0..5);
        assert_eq!(buf.poll_transmit(MSG.len() - 7), 7..MSG.len() as u64);
    }

    #[test]
    fn ack_frees_prefix() {
        let mut buf = SendBuffer::new();
        buf.write(MSG);
        assert_eq!(buf.poll_transmit(5), 0..5);
        buf.ack(0..5);
        assert_eq!(buf.unacked(), (MSG.len() - 5) as u64);
        assert_eq!(buf.get(5..7), &MSG[5..7]);
    }

    #[test]
    fn reordered_ack() {
        let mut buf = SendBuffer::new();
        buf.write(MSG);
        assert_eq!(buf.poll_transmit(5), 0..5);
        assert_eq!(buf.poll_transmit(2), 5..7);
        buf.ack(5..7);
        assert_eq!(buf.unacked(), MSG.len() as u64 - 2);
        assert!(!buf.is_fully_acked());
        buf.ack(0..5);
        assert_eq!(buf.unacked(), (MSG.len() - 7) as u64);
    }

    #[test]
    fn lost_range_acked_by_duplicate() {
        let mut buf = SendBuffer::new();
        buf.write(MSG);
        assert_eq!(buf.poll_transmit(5), 0..5);
        // A later packet carrying the same range is acked before the loss is processed
        buf.ack(0..5);
        buf.retransmit(0..5);
        // Nothing left to resend
        assert_eq!(buf.poll_transmit(5), 5..10);
    }

    #[test]
    fn discard_clears_pending() {
        let mut buf = SendBuffer::new();
        buf.write(MSG);
        buf.poll_transmit(5);
        buf.retransmit(0..5);
        buf.discard();
        assert!(!buf.has_unsent_data());
        assert!(buf.is_fully_acked());
    }
}
