use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, trace};

use crate::assembler::Assembler;
use crate::frame::StreamMeta;
use crate::send_buffer::SendBuffer;
use crate::transport_error::Error as TransportError;
use crate::varint::VarInt;
use crate::{StreamId, MAX_STREAM_OFFSET};

/// State for one stream of a connection
///
/// Owned by the session; every access goes through the id-keyed stream maps.
#[derive(Debug)]
pub(crate) struct Stream {
    pub(crate) id: StreamId,
    pub(crate) send: SendHalf,
    pub(crate) recv: RecvHalf,
    /// Scheduling weight; larger values are served first
    pub(crate) priority: i32,
}

impl Stream {
    pub(crate) fn new(id: StreamId, send_max_data: u64, recv_window: u64) -> Self {
        Self {
            id,
            send: SendHalf::new(send_max_data),
            recv: RecvHalf::new(recv_window),
            priority: 0,
        }
    }

    /// Whether every byte sent has been acknowledged, the peer's final size
    /// has been observed, and the application has consumed the outcome,
    /// allowing the stream entity to be destroyed
    pub(crate) fn is_closed(&self) -> bool {
        self.send.is_finished() && self.recv.is_finished() && !self.recv.is_draining()
    }

    /// Whether the application is done but unacked bytes keep the entity alive
    pub(crate) fn is_zombie(&self) -> bool {
        self.send.fin_sent() && !self.send.is_finished() && self.recv.is_finished()
    }
}

#[derive(Debug)]
pub(crate) struct SendHalf {
    state: SendState,
    pub(crate) buffer: SendBuffer,
    /// Peer-advertised limit on this stream's send offset
    max_data: u64,
    /// Limit for which STREAM_DATA_BLOCKED was emitted, reset on raise
    blocked_at: Option<u64>,
    /// Whether a frame carrying FIN still needs to go out
    pub(crate) fin_pending: bool,
    /// Whether this stream sits in the session's connection-blocked list
    pub(crate) connection_blocked: bool,
    /// The reason the peer asked us to stop, if STOP_SENDING was received
    stop_reason: Option<VarInt>,
}

impl SendHalf {
    fn new(max_data: u64) -> Self {
        Self {
            state: SendState::Ready,
            buffer: SendBuffer::new(),
            max_data,
            blocked_at: None,
            fin_pending: false,
            connection_blocked: false,
            stop_reason: None,
        }
    }

    /// Append data bounded by the stream window and `connection_budget`
    ///
    /// Returns the bytes accepted and whether a requested FIN was accepted.
    /// The FIN is only consumed together with the final byte of data.
    pub(crate) fn write(
        &mut self,
        data: &[u8],
        fin: bool,
        connection_budget: u64,
    ) -> Result<(usize, bool), WriteError> {
        if let Some(error_code) = self.stop_reason {
            return Err(WriteError::Stopped(error_code));
        }
        if self.state != SendState::Ready {
            return Err(WriteError::ClosedStream);
        }
        let budget = (self.max_data - self.buffer.offset()).min(connection_budget);
        if budget == 0 && (!data.is_empty() || !fin) {
            return Err(WriteError::Blocked);
        }
        let len = (budget as usize).min(data.len());
        self.buffer.write(&data[..len]);
        let fin_consumed = fin && len == data.len();
        if fin_consumed {
            self.state = SendState::DataSent { fin_acked: false };
            self.fin_pending = true;
        }
        trace!(len, fin_consumed, "buffered stream data");
        Ok((len, fin_consumed))
    }

    /// Mark the end of the stream without writing further data
    pub(crate) fn finish(&mut self) -> Result<(), FinishError> {
        if let Some(error_code) = self.stop_reason {
            return Err(FinishError::Stopped(error_code));
        }
        if self.state != SendState::Ready {
            return Err(FinishError::ClosedStream);
        }
        self.state = SendState::DataSent { fin_acked: false };
        self.fin_pending = true;
        Ok(())
    }

    /// Process an acknowledgment of `meta`; returns whether the send side
    /// reached data-received (everything durably delivered)
    pub(crate) fn on_acked(&mut self, meta: &StreamMeta) -> bool {
        if matches!(self.state, SendState::ResetSent | SendState::DataRecvd) {
            return false;
        }
        self.buffer.ack(meta.offsets.clone());
        if let SendState::DataSent { ref mut fin_acked } = self.state {
            *fin_acked |= meta.fin;
            if *fin_acked && self.buffer.is_fully_acked() {
                self.state = SendState::DataRecvd;
                return true;
            }
        }
        false
    }

    /// Re-offer the data of a lost frame; ranges since acked are skipped
    pub(crate) fn on_lost(&mut self, meta: &StreamMeta) {
        if matches!(self.state, SendState::ResetSent | SendState::DataRecvd) {
            return;
        }
        if !meta.offsets.is_empty() {
            self.buffer.retransmit(meta.offsets.clone());
        }
        if meta.fin {
            if let SendState::DataSent { fin_acked: false } = self.state {
                self.fin_pending = true;
            }
        }
    }

    /// Locally abandon the stream; the final size is the bytes written so far
    ///
    /// Returns the final size to advertise, or `None` if the send side was
    /// already terminal.
    pub(crate) fn reset(&mut self) -> Option<u64> {
        if matches!(self.state, SendState::ResetSent | SendState::DataRecvd) {
            return None;
        }
        self.state = SendState::ResetSent;
        self.fin_pending = false;
        let final_size = self.buffer.offset();
        self.buffer.discard();
        Some(final_size)
    }

    /// Handle STOP_SENDING; returns whether this was the first
    pub(crate) fn try_stop(&mut self, error_code: VarInt) -> bool {
        if self.stop_reason.is_none() {
            self.stop_reason = Some(error_code);
            true
        } else {
            false
        }
    }

    /// Raise the stream send window; returns whether we were unblocked
    pub(crate) fn increase_max_data(&mut self, offset: u64) -> bool {
        if offset <= self.max_data || self.state != SendState::Ready {
            return false;
        }
        let was_blocked = self.buffer.offset() == self.max_data;
        self.max_data = offset;
        self.blocked_at = None;
        was_blocked
    }

    /// The offset to report in STREAM_DATA_BLOCKED, once per limit epoch
    pub(crate) fn take_blocked(&mut self) -> Option<u64> {
        if self.buffer.offset() != self.max_data || self.blocked_at == Some(self.max_data) {
            return None;
        }
        self.blocked_at = Some(self.max_data);
        Some(self.max_data)
    }

    /// Whether data or a FIN awaits (re)transmission
    pub(crate) fn is_pending(&self) -> bool {
        !matches!(self.state, SendState::ResetSent | SendState::DataRecvd)
            && (self.buffer.has_unsent_data() || self.fin_pending)
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.state == SendState::Ready
    }

    /// Whether this half no longer needs the wire: reset, or fully acked
    pub(crate) fn is_finished(&self) -> bool {
        matches!(self.state, SendState::ResetSent | SendState::DataRecvd)
    }

    pub(crate) fn fin_sent(&self) -> bool {
        matches!(
            self.state,
            SendState::DataSent { .. } | SendState::DataRecvd
        )
    }

    /// Mark the half terminal for streams that never send, i.e. the local
    /// half of a peer-initiated unidirectional stream
    pub(crate) fn close_unused(&mut self) {
        self.state = SendState::DataRecvd;
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum SendState {
    /// Accepting new application data
    Ready,
    /// FIN buffered; only (re)transmissions remain
    DataSent { fin_acked: bool },
    /// Everything through FIN acknowledged; terminal
    DataRecvd,
    /// RESET_STREAM emitted; terminal
    ResetSent,
}

#[derive(Debug)]
pub(crate) struct RecvHalf {
    state: RecvState,
    pub(crate) assembler: Assembler,
    /// Limit advertised to the peer
    advertised: u64,
    /// Configured receive window
    window: u64,
    /// Highest offset the peer has used, including a reset's final size
    received_end: u64,
    /// Whether the application asked to discard incoming data
    stopped: bool,
}

impl RecvHalf {
    fn new(window: u64) -> Self {
        Self {
            state: RecvState::default(),
            assembler: Assembler::new(),
            advertised: window,
            window,
            received_end: 0,
            stopped: false,
        }
    }

    /// Buffer stream data from the peer
    ///
    /// Returns `(new_bytes, readable)`: the connection-level flow control
    /// consumption and whether new contiguous data became available.
    pub(crate) fn ingest(
        &mut self,
        offset: u64,
        data: Bytes,
        fin: bool,
    ) -> Result<(u64, bool), TransportError> {
        let end = offset + data.len() as u64;
        if end > MAX_STREAM_OFFSET {
            return Err(TransportError::FLOW_CONTROL_ERROR(
                "maximum stream offset too large",
            ));
        }
        if let Some(final_size) = self.final_size() {
            if end > final_size || (fin && end != final_size) {
                debug!(end, final_size, "final size error");
                return Err(TransportError::FINAL_SIZE_ERROR(""));
            }
        }
        if end > self.advertised {
            debug!(end, advertised = self.advertised, "flow control error");
            return Err(TransportError::FLOW_CONTROL_ERROR(""));
        }

        let new_bytes = end.saturating_sub(self.received_end);
        self.received_end = self.received_end.max(end);
        if fin {
            if self.stopped {
                // Stopped streams only needed the final size for accounting
                self.state = RecvState::Closed;
            } else if let RecvState::Recv { ref mut size } = self.state {
                *size = Some(end);
            }
        }

        if self.stopped {
            return Ok((new_bytes, false));
        }

        let readable = self.assembler.insert(offset, data);
        if let RecvState::Recv { size: Some(size) } = self.state {
            if self.assembler.watermark() == size {
                self.state = RecvState::DataRecvd { size };
            }
        }

        Ok((new_bytes, readable))
    }

    /// Deliver the next contiguous chunk to the application
    pub(crate) fn read(&mut self, max_len: usize) -> Result<Option<Bytes>, ReadError> {
        if self.stopped {
            return Err(ReadError::ClosedStream);
        }
        if let Some(chunk) = self.assembler.read(max_len) {
            return Ok(Some(chunk));
        }
        match self.state {
            RecvState::ResetRecvd { error_code, .. } => {
                self.state = RecvState::Closed;
                Err(ReadError::Reset(error_code))
            }
            RecvState::Closed => Err(ReadError::ClosedStream),
            RecvState::DataRecvd { size } if self.assembler.bytes_read() == size => {
                self.state = RecvState::Closed;
                Ok(None)
            }
            _ => Err(ReadError::Blocked),
        }
    }

    /// Handle RESET_STREAM; returns the connection-level flow credit consumed
    /// by the jump to `final_size`, or `None` if the reset is redundant
    pub(crate) fn on_reset(
        &mut self,
        error_code: VarInt,
        final_size: u64,
    ) -> Result<Option<u64>, TransportError> {
        if let Some(size) = self.final_size() {
            if size != final_size {
                return Err(TransportError::FINAL_SIZE_ERROR("inconsistent value"));
            }
        } else if self.received_end > final_size {
            return Err(TransportError::FINAL_SIZE_ERROR(
                "lower than high water mark",
            ));
        }
        if final_size > self.advertised {
            return Err(TransportError::FLOW_CONTROL_ERROR(""));
        }
        if matches!(
            self.state,
            RecvState::ResetRecvd { .. } | RecvState::Closed
        ) {
            return Ok(None);
        }
        let new_bytes = final_size.saturating_sub(self.received_end);
        self.received_end = self.received_end.max(final_size);
        self.state = if self.stopped {
            // A stopped stream has nobody left to observe the reset
            RecvState::Closed
        } else {
            RecvState::ResetRecvd {
                size: final_size,
                error_code,
            }
        };
        // Drop buffered data so reads fail over to the reset error immediately
        self.assembler.clear();
        Ok(Some(new_bytes))
    }

    /// Stop accepting data, discarding anything buffered
    ///
    /// Returns the receive-window credit to return to the connection.
    pub(crate) fn stop(&mut self) -> Result<u64, ReadError> {
        if self.stopped {
            return Err(ReadError::ClosedStream);
        }
        self.stopped = true;
        let credit = self.received_end - self.assembler.bytes_read();
        self.assembler.clear();
        if self.final_size().is_some() {
            self.state = RecvState::Closed;
        }
        Ok(credit)
    }

    /// The limit to advertise once the window has drained past its midpoint
    pub(crate) fn take_window_update(&mut self) -> Option<u64> {
        if !self.receiving_unknown_size() {
            return None;
        }
        let new_limit = self.assembler.bytes_read() + self.window;
        if new_limit - self.advertised < self.window / 2 {
            return None;
        }
        self.advertised = new_limit;
        Some(new_limit)
    }

    fn receiving_unknown_size(&self) -> bool {
        matches!(self.state, RecvState::Recv { size: None })
    }

    /// Whether the peer can send nothing further on this stream
    pub(crate) fn is_finished(&self) -> bool {
        !matches!(self.state, RecvState::Recv { .. })
    }

    /// Whether the end of the stream is known but the application has not
    /// observed it yet; `read` moves the half to its terminal state
    pub(crate) fn is_draining(&self) -> bool {
        matches!(
            self.state,
            RecvState::DataRecvd { .. } | RecvState::ResetRecvd { .. }
        )
    }

    pub(crate) fn final_size(&self) -> Option<u64> {
        match self.state {
            RecvState::Recv { size } => size,
            RecvState::DataRecvd { size } | RecvState::ResetRecvd { size, .. } => Some(size),
            RecvState::Closed => None,
        }
    }

    /// Mark the half terminal for streams that never receive, i.e. the local
    /// half of a self-initiated unidirectional stream
    pub(crate) fn close_unused(&mut self) {
        self.state = RecvState::Closed;
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum RecvState {
    /// Accepting data; `size` is set once FIN arrives
    Recv { size: Option<u64> },
    /// All bytes through the final size are buffered
    DataRecvd { size: u64 },
    /// Peer reset the stream; terminal once reported
    ResetRecvd { size: u64, error_code: VarInt },
    /// Everything delivered to the application
    Closed,
}

impl Default for RecvState {
    fn default() -> Self {
        Self::Recv { size: None }
    }
}

/// Errors triggered while writing to a send stream
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum WriteError {
    /// The peer is not able to accept additional data, or the connection is
    /// congested
    ///
    /// Retry after the stream's `on_can_write` signal.
    #[error("unable to accept further writes")]
    Blocked,
    /// The peer is no longer accepting data on this stream
    ///
    /// Carries an application-defined error code.
    #[error("stopped by peer: code {0}")]
    Stopped(VarInt),
    /// The stream has not been opened, or was already finished or reset
    #[error("closed stream")]
    ClosedStream,
}

/// Errors triggered while reading from a receive stream
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ReadError {
    /// No more data is currently available on this stream
    #[error("blocked")]
    Blocked,
    /// The peer abandoned transmitting data on this stream
    ///
    /// Carries an application-defined error code.
    #[error("reset by peer: code {0}")]
    Reset(VarInt),
    /// The stream has not been opened, or was already stopped or finished
    #[error("closed stream")]
    ClosedStream,
}

/// Errors triggered when finishing a send stream
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum FinishError {
    /// The peer is no longer accepting data on this stream
    #[error("stopped by peer: code {0}")]
    Stopped(VarInt),
    /// The stream has not been opened, or was already finished or reset
    #[error("closed stream")]
    ClosedStream,
}
