use tracing::trace;

use crate::transport_error::Error as TransportError;

/// Byte-count flow control for one direction of a stream or connection
///
/// The send half tracks the peer's advertised limit against the bytes we have
/// committed; the receive half tracks what we have advertised against what the
/// peer has used, and retires the window as the application consumes data.
#[derive(Debug)]
pub struct FlowController {
    /// Highest offset the peer permits us to send up to
    send_limit: u64,
    /// Bytes we have committed for sending
    sent: u64,
    /// Limit value for which a BLOCKED frame was already emitted, if any
    ///
    /// Reset whenever the peer raises the limit, giving one BLOCKED signal
    /// per window epoch.
    blocked_at: Option<u64>,

    /// Highest offset we have permitted the peer to send up to
    recv_limit: u64,
    /// Configured window size
    window: u64,
    /// Highest offset the peer has used (sent data or declared via final size)
    received: u64,
    /// Bytes delivered to (or discarded on behalf of) the application
    consumed: u64,
}

impl FlowController {
    pub fn new(send_limit: u64, window: u64) -> Self {
        Self {
            send_limit,
            sent: 0,
            blocked_at: None,
            recv_limit: window,
            window,
            received: 0,
            consumed: 0,
        }
    }

    //
    // Send half
    //

    /// Bytes that may be committed before the peer's limit is reached
    pub fn send_budget(&self) -> u64 {
        self.send_limit - self.sent
    }

    /// Record that `n` bytes were committed for sending
    pub fn commit_send(&mut self, n: u64) {
        self.sent += n;
        debug_assert!(self.sent <= self.send_limit);
    }

    /// Apply a peer-supplied limit increase; returns whether we were unblocked
    pub fn raise_send_limit(&mut self, limit: u64) -> bool {
        if limit <= self.send_limit {
            return false;
        }
        let was_blocked = self.send_budget() == 0;
        trace!(limit, "send limit raised");
        self.send_limit = limit;
        self.blocked_at = None;
        was_blocked
    }

    /// The offset to report in a BLOCKED frame, at most once per limit epoch
    pub fn take_blocked(&mut self) -> Option<u64> {
        if self.send_budget() != 0 || self.blocked_at == Some(self.send_limit) {
            return None;
        }
        self.blocked_at = Some(self.send_limit);
        Some(self.send_limit)
    }

    //
    // Receive half
    //

    /// Charge `new_bytes` of peer usage against the advertised limit
    ///
    /// For the connection-level controller usage accumulates across streams,
    /// so callers report deltas rather than offsets.
    pub fn consume_receive_credit(&mut self, new_bytes: u64) -> Result<(), TransportError> {
        if self.received + new_bytes > self.recv_limit {
            return Err(TransportError::FLOW_CONTROL_ERROR(
                "peer exceeded advertised limit",
            ));
        }
        self.received += new_bytes;
        Ok(())
    }

    /// Credit the window for bytes consumed by the application
    pub fn record_consumed(&mut self, n: u64) {
        self.consumed += n;
        debug_assert!(self.consumed <= self.received);
    }

    /// The limit to advertise, when the window has drained past its midpoint
    ///
    /// Returns `Some` and latches the new limit when an update is worthwhile;
    /// the caller is responsible for queueing the corresponding MAX_DATA or
    /// MAX_STREAM_DATA frame.
    pub fn take_window_update(&mut self) -> Option<u64> {
        let new_limit = self
            .consumed
            .saturating_add(self.window)
            .min(crate::varint::VarInt::MAX.into_inner());
        if new_limit.saturating_sub(self.recv_limit) < self.window / 2 {
            return None;
        }
        trace!(new_limit, "advertising window update");
        self.recv_limit = new_limit;
        Some(new_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_budget_and_blocking() {
        let mut fc = FlowController::new(1000, 0);
        assert_eq!(fc.send_budget(), 1000);
        fc.commit_send(1000);
        assert_eq!(fc.send_budget(), 0);
        // Exactly one BLOCKED per epoch
        assert_eq!(fc.take_blocked(), Some(1000));
        assert_eq!(fc.take_blocked(), None);
        // Raising the limit unblocks and opens a new epoch
        assert!(fc.raise_send_limit(2500));
        assert_eq!(fc.send_budget(), 1500);
        assert_eq!(fc.take_blocked(), None);
        fc.commit_send(1500);
        assert_eq!(fc.take_blocked(), Some(2500));
    }

    #[test]
    fn stale_limit_ignored() {
        let mut fc = FlowController::new(1000, 0);
        assert!(!fc.raise_send_limit(500));
        assert_eq!(fc.send_budget(), 1000);
    }

    #[test]
    fn receive_limit_enforced() {
        let mut fc = FlowController::new(0, 100);
        assert!(fc.consume_receive_credit(60).is_ok());
        assert!(fc.consume_receive_credit(40).is_ok());
        assert!(fc.consume_receive_credit(1).is_err());
    }

    #[test]
    fn window_updates_at_midpoint() {
        let mut fc = FlowController::new(0, 100);
        fc.consume_receive_credit(49).unwrap();
        fc.record_consumed(49);
        assert_eq!(fc.take_window_update(), None);
        fc.consume_receive_credit(1).unwrap();
        fc.record_consumed(1);
        assert_eq!(fc.take_window_update(), Some(150));
        // Latched; no duplicate until another half-window drains
        assert_eq!(fc.take_window_update(), None);
    }
}
