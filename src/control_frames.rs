use std::collections::VecDeque;

use crate::frame::Frame;
use crate::{Dir, StreamId};

/// Queue of pending control frames and their retransmission bookkeeping
///
/// Frames leave the queue when packed into a packet and come back through
/// [`on_frame_lost`](Self::on_frame_lost) if that packet is declared lost.
/// Window-advertising frames supersede older queued copies so a burst of
/// updates collapses to the newest value.
#[derive(Debug, Default)]
pub struct ControlFrameManager {
    queue: VecDeque<Frame>,
}

impl ControlFrameManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a control frame for transmission
    pub fn queue(&mut self, frame: Frame) {
        if let Some(slot) = self.find_superseded(&frame) {
            self.queue[slot] = frame;
            return;
        }
        self.queue.push_back(frame);
    }

    /// Index of a queued frame the new frame makes obsolete
    fn find_superseded(&self, frame: &Frame) -> Option<usize> {
        use Frame::*;
        self.queue.iter().position(|queued| match (queued, frame) {
            (MaxData(_), MaxData(_)) => true,
            (MaxStreamData { id: a, .. }, MaxStreamData { id: b, .. }) => a == b,
            (MaxStreams { dir: a, .. }, MaxStreams { dir: b, .. }) => a == b,
            (DataBlocked { .. }, DataBlocked { .. }) => true,
            (StreamDataBlocked { id: a, .. }, StreamDataBlocked { id: b, .. }) => a == b,
            (StreamsBlocked { dir: a, .. }, StreamsBlocked { dir: b, .. }) => a == b,
            _ => false,
        })
    }

    /// A lost control frame is offered back for retransmission
    ///
    /// Frames made obsolete by a newer queued value are dropped instead.
    pub fn on_frame_lost(&mut self, frame: Frame) {
        if self.find_superseded(&frame).is_some() {
            return;
        }
        // Retransmissions go to the front to resolve peer stalls quickly
        self.queue.push_front(frame);
    }

    /// Acknowledgment of a control frame requires no requeue; the hook exists
    /// for symmetry and future per-kind bookkeeping
    pub fn on_frame_acked(&mut self, _frame: &Frame) {}

    /// Remove any queued frames referencing `id`, e.g. when the stream dies
    pub fn retire_stream(&mut self, id: StreamId) {
        use Frame::*;
        self.queue.retain(|f| {
            !matches!(
                f,
                MaxStreamData { id: x, .. } | StreamDataBlocked { id: x, .. } if *x == id
            )
        });
    }

    /// Drop any queued MAX_STREAMS for `dir` older than `count`
    pub fn drop_stale_max_streams(&mut self, dir: Dir, count: u64) {
        use Frame::*;
        self.queue.retain(|f| match f {
            MaxStreams { dir: d, count: c } => *d != dir || *c > count,
            _ => true,
        });
    }

    pub fn pop(&mut self) -> Option<Frame> {
        self.queue.pop_front()
    }

    /// Re-insert a frame that did not fit in the current packet
    pub fn push_front(&mut self, frame: Frame) {
        self.queue.push_front(frame);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::varint::VarInt;
    use assert_matches::assert_matches;

    #[test]
    fn window_updates_supersede() {
        let mut cfm = ControlFrameManager::new();
        cfm.queue(Frame::MaxData(VarInt(1000)));
        cfm.queue(Frame::MaxData(VarInt(2000)));
        assert_matches!(cfm.pop(), Some(Frame::MaxData(VarInt(2000))));
        assert!(cfm.is_empty());
    }

    #[test]
    fn per_stream_updates_are_independent() {
        let mut cfm = ControlFrameManager::new();
        cfm.queue(Frame::MaxStreamData {
            id: StreamId(0),
            offset: 100,
        });
        cfm.queue(Frame::MaxStreamData {
            id: StreamId(4),
            offset: 200,
        });
        cfm.queue(Frame::MaxStreamData {
            id: StreamId(0),
            offset: 300,
        });
        assert_matches!(
            cfm.pop(),
            Some(Frame::MaxStreamData { id: StreamId(0), offset: 300 })
        );
        assert_matches!(
            cfm.pop(),
            Some(Frame::MaxStreamData { id: StreamId(4), offset: 200 })
        );
    }

    #[test]
    fn lost_frames_requeue_unless_superseded() {
        let mut cfm = ControlFrameManager::new();
        cfm.on_frame_lost(Frame::HandshakeDone);
        assert_matches!(cfm.pop(), Some(Frame::HandshakeDone));
        cfm.queue(Frame::MaxData(VarInt(500)));
        cfm.on_frame_lost(Frame::MaxData(VarInt(300)));
        assert_matches!(cfm.pop(), Some(Frame::MaxData(VarInt(500))));
        assert!(cfm.is_empty());
    }

    #[test]
    fn retire_stream_purges_references() {
        let mut cfm = ControlFrameManager::new();
        cfm.queue(Frame::MaxStreamData {
            id: StreamId(8),
            offset: 1,
        });
        cfm.queue(Frame::MaxData(VarInt(9)));
        cfm.retire_stream(StreamId(8));
        assert_matches!(cfm.pop(), Some(Frame::MaxData(_)));
        assert!(cfm.is_empty());
    }
}
