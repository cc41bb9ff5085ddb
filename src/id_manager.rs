use std::ops::Range;

use tracing::{debug, trace};

use crate::transport_error::Error as TransportError;
use crate::{Dir, Side, StreamId};

/// Allocates and validates stream identifiers for every quadrant of the
/// `{initiator} x {directionality}` space
///
/// Outgoing identifiers are bounded by the peer's MAX_STREAMS; incoming
/// identifiers are validated against our own advertisement, with credit
/// replenished in batches once half of it has been consumed.
#[derive(Debug)]
pub struct StreamIdManager {
    side: Side,
    /// Next index to allocate for locally-initiated streams, per direction
    next: [u64; 2],
    /// Peer-advertised limit on locally-initiated stream count, per direction
    max: [u64; 2],
    /// Limit value for which a STREAMS_BLOCKED was emitted, per direction
    blocked_at: [Option<u64>; 2],
    /// Lowest index the peer has not yet opened, per direction
    next_remote: [u64; 2],
    /// Stream count limit we last advertised to the peer, per direction
    max_remote: [u64; 2],
    /// Configured concurrent-stream window for peer-initiated streams
    window_remote: [u64; 2],
}

impl StreamIdManager {
    pub fn new(side: Side, max_remote_bi: u64, max_remote_uni: u64) -> Self {
        Self {
            side,
            next: [0, 0],
            max: [0, 0],
            blocked_at: [None, None],
            next_remote: [0, 0],
            max_remote: [max_remote_bi, max_remote_uni],
            window_remote: [max_remote_bi, max_remote_uni],
        }
    }

    /// Whether another locally-initiated stream may currently be opened
    pub fn can_open(&self, dir: Dir) -> bool {
        self.next[dir as usize] < self.max[dir as usize]
    }

    /// Allocate the next locally-initiated stream id, if the peer permits one
    pub fn next_outgoing(&mut self, dir: Dir) -> Option<StreamId> {
        if !self.can_open(dir) {
            return None;
        }
        let index = self.next[dir as usize];
        self.next[dir as usize] += 1;
        Some(StreamId::new(self.side, dir, index))
    }

    /// Apply a MAX_STREAMS from the peer; returns whether we were unblocked
    pub fn on_max_streams(&mut self, dir: Dir, count: u64) -> bool {
        if count <= self.max[dir as usize] {
            return false;
        }
        let was_blocked = !self.can_open(dir);
        trace!(%dir, count, "stream limit raised");
        self.max[dir as usize] = count;
        self.blocked_at[dir as usize] = None;
        was_blocked
    }

    /// The limit to report in STREAMS_BLOCKED, at most once per limit epoch
    pub fn take_blocked(&mut self, dir: Dir) -> Option<u64> {
        let limit = self.max[dir as usize];
        if self.can_open(dir) || self.blocked_at[dir as usize] == Some(limit) {
            return None;
        }
        self.blocked_at[dir as usize] = Some(limit);
        Some(limit)
    }

    /// Validate a peer-referenced stream id, implicitly opening lower ids
    ///
    /// For a peer-initiated id, returns the range of indexes newly opened by
    /// this reference (empty when the stream already existed). Ids beyond our
    /// advertisement close the connection with STREAM_LIMIT_ERROR.
    pub fn maybe_open_remote(&mut self, id: StreamId) -> Result<Range<u64>, TransportError> {
        debug_assert_eq!(id.initiator(), !self.side);
        let dir = id.dir() as usize;
        if id.index() >= self.max_remote[dir] {
            debug!(%id, limit = self.max_remote[dir], "peer exceeded stream limit");
            return Err(TransportError::STREAM_LIMIT_ERROR(""));
        }
        let start = self.next_remote[dir];
        if id.index() < start {
            return Ok(start..start);
        }
        self.next_remote[dir] = id.index() + 1;
        Ok(start..id.index() + 1)
    }

    /// Whether a locally-initiated id could have been issued yet
    ///
    /// A peer frame referencing a local stream we never opened is a protocol
    /// violation, caught by the session.
    pub fn is_local_issued(&self, id: StreamId) -> bool {
        debug_assert_eq!(id.initiator(), self.side);
        id.index() < self.next[id.dir() as usize]
    }

    /// The limit to advertise in MAX_STREAMS, batched at half the window
    ///
    /// `closed` is the total number of fully-closed peer-initiated streams in
    /// `dir`. Returns `Some` and latches when at least half the credit since
    /// the last advertisement has been consumed.
    pub fn take_max_streams_update(&mut self, dir: Dir, closed: u64) -> Option<u64> {
        let dir = dir as usize;
        let new_limit = closed + self.window_remote[dir];
        if new_limit - self.max_remote[dir] < self.window_remote[dir] / 2 {
            return None;
        }
        self.max_remote[dir] = new_limit;
        Some(new_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outgoing_respects_peer_limit() {
        let mut mgr = StreamIdManager::new(Side::Client, 0, 0);
        assert_eq!(mgr.next_outgoing(Dir::Bi), None);
        assert_eq!(mgr.take_blocked(Dir::Bi), Some(0));
        assert_eq!(mgr.take_blocked(Dir::Bi), None);
        assert!(mgr.on_max_streams(Dir::Bi, 2));
        let a = mgr.next_outgoing(Dir::Bi).unwrap();
        let b = mgr.next_outgoing(Dir::Bi).unwrap();
        assert_eq!(a, StreamId::new(Side::Client, Dir::Bi, 0));
        assert_eq!(b, StreamId::new(Side::Client, Dir::Bi, 1));
        assert_eq!(mgr.next_outgoing(Dir::Bi), None);
    }

    #[test]
    fn stale_max_streams_ignored() {
        let mut mgr = StreamIdManager::new(Side::Client, 0, 0);
        mgr.on_max_streams(Dir::Uni, 5);
        assert!(!mgr.on_max_streams(Dir::Uni, 3));
        assert_eq!(mgr.next_outgoing(Dir::Uni).unwrap().index(), 0);
    }

    #[test]
    fn implicit_open_of_lower_ids() {
        let mut mgr = StreamIdManager::new(Side::Server, 10, 10);
        // Client opens bidi index 3 first; 0..=3 all spring into existence
        let id = StreamId::new(Side::Client, Dir::Bi, 3);
        assert_eq!(mgr.maybe_open_remote(id).unwrap(), 0..4);
        // Re-reference is not a new open
        assert_eq!(mgr.maybe_open_remote(id).unwrap(), 4..4);
        let id = StreamId::new(Side::Client, Dir::Bi, 1);
        assert_eq!(mgr.maybe_open_remote(id).unwrap(), 4..4);
    }

    #[test]
    fn limit_violation() {
        let mut mgr = StreamIdManager::new(Side::Server, 2, 2);
        let id = StreamId::new(Side::Client, Dir::Uni, 2);
        assert!(mgr.maybe_open_remote(id).is_err());
    }

    #[test]
    fn max_streams_batching() {
        let mut mgr = StreamIdManager::new(Side::Server, 8, 8);
        // One closed stream isn't worth an update yet
        assert_eq!(mgr.take_max_streams_update(Dir::Bi, 1), None);
        // Half the window consumed: batch an update
        assert_eq!(mgr.take_max_streams_update(Dir::Bi, 4), Some(12));
        // Latched until another half window is consumed
        assert_eq!(mgr.take_max_streams_update(Dir::Bi, 5), None);
        assert_eq!(mgr.take_max_streams_update(Dir::Bi, 8), Some(16));
    }
}
