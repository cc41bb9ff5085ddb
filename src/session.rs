use std::collections::{BinaryHeap, VecDeque};

use bytes::{Bytes, BytesMut};
use rand::Rng;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::TransportConfig;
use crate::control_frames::ControlFrameManager;
use crate::creator::{PacketCreator, PacketFate, PacketSink, SerializedPacket};
use crate::crypto::{HandshakeSession, HeaderKey, Keys, PacketKey};
use crate::flow_control::FlowController;
use crate::frame::{
    self, ApplicationClose, Close, ConnectionClose, Frame, ResetStream, StopSending,
};
use crate::id_manager::StreamIdManager;
use crate::packet::{EncryptionLevel, PartialDecode, SpaceId};
use crate::shared::ConnectionId;
use crate::spaces::{PacketSpace, SentPacket};
use crate::stream::{FinishError, ReadError, Stream, WriteError};
use crate::transport_error::{Code as TransportErrorCode, Error as TransportError};
use crate::varint::VarInt;
use crate::{
    Dir, Side, StreamId, TransmissionType, MIN_INITIAL_SIZE, PACKET_REORDERING_THRESHOLD,
};

/// Events the session raises toward its host
///
/// A small interface implemented by the surrounding endpoint; the session
/// composes a visitor reference rather than being subclassed.
#[allow(unused_variables)]
pub trait SessionVisitor {
    /// New contiguous data or a FIN became readable on `id`
    fn on_data_available(&mut self, id: StreamId) {}
    /// A formerly blocked stream may accept writes again
    fn on_can_write(&mut self, id: StreamId) {}
    /// The stream entity reached the end of its life
    fn on_stream_closed(&mut self, id: StreamId) {}
    /// The peer opened `id`; it may be adopted with [`Session::accept`]
    fn on_stream_opened(&mut self, id: StreamId) {}
    /// The connection is done, locally or remotely caused; fired exactly once
    fn on_connection_closed(&mut self, error: &ConnectionError, source: CloseSource) {}
    /// RESET_STREAM arrived, before the stream state is torn down
    fn on_rst_stream_received(&mut self, frame: &ResetStream) {}
    /// STOP_SENDING arrived
    fn on_stop_sending_received(&mut self, frame: &StopSending) {}
    /// The crypto handshake finished
    fn on_handshake_complete(&mut self) {}
    /// An unreliable datagram arrived
    fn on_datagram_received(&mut self) {}
    /// NEW_TOKEN arrived; tokens speed up future connections
    fn on_new_token(&mut self, token: Bytes) {}
}

/// Which end initiated a connection close
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CloseSource {
    Local,
    Remote,
}

/// Reasons why a connection ended
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// The local protocol stack detected a violation
    #[error("transport error: {0}")]
    TransportError(#[from] TransportError),
    /// The peer closed at the transport layer
    #[error("closed by peer: {0}")]
    ConnectionClosed(ConnectionClose),
    /// The peer's application closed the connection
    #[error("closed by peer application: {0}")]
    ApplicationClosed(ApplicationClose),
    /// The local application closed the connection
    #[error("closed")]
    LocallyClosed,
    /// The idle timer expired with no network activity
    #[error("timed out")]
    TimedOut,
}

/// Host-armed timers; the session only exposes the expiry entry point
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Timer {
    /// No network activity for the negotiated idle duration
    Idle,
    /// Loss detection / probe timeout
    LossDetection,
    /// Deferred destruction of closed streams
    CleanupClosedStreams,
    /// The path has been degrading for too long
    PathDegrading,
}

/// Per-connection lifecycle phase
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum State {
    Handshaking,
    Established,
    /// CONNECTION_CLOSE sent or received; only closing frames may flow
    Draining,
    Closed,
}

/// Demultiplexes one authenticated QUIC connection into streams
///
/// Owns every stream map, the packet creator, flow control, and the
/// retransmission ledger. All methods are called from a single execution
/// context; suspension points are the host's I/O and timer waits.
pub struct Session {
    side: Side,
    config: TransportConfig,
    state: State,
    /// First fatal error wins; later ones are ignored
    error: Option<ConnectionError>,
    close_sent: bool,

    handshake: Box<dyn HandshakeSession>,
    handshake_complete: bool,
    /// Highest level for which send keys exist
    level: EncryptionLevel,
    recv_keys: [Option<(Box<dyn HeaderKey>, Box<dyn PacketKey>)>; 4],
    spaces: [PacketSpace; 3],

    creator: PacketCreator,
    transmits: TransmitQueue,
    local_cid: ConnectionId,

    /// Active streams the application exchanges data on
    streams: FxHashMap<StreamId, Stream>,
    /// Implicitly opened peer streams that no frame has referenced yet
    pending_streams: FxHashSet<StreamId>,
    /// Streams with FIN in both directions but unread buffered data
    draining_streams: FxHashMap<StreamId, Stream>,
    /// Locally finished streams awaiting acknowledgment of their last bytes
    zombie_streams: FxHashMap<StreamId, Stream>,
    /// Drop queue, emptied by the cleanup alarm so teardown cost stays out
    /// of hot call stacks
    closed_streams: Vec<Stream>,
    /// Peer streams the application has not accepted yet
    unclaimed_streams: VecDeque<StreamId>,
    /// Fully closed peer-initiated stream count, per direction, feeding
    /// MAX_STREAMS credit
    closed_remote: [u64; 2],

    id_manager: StreamIdManager,
    /// Peer's default per-stream window, from its transport parameters
    peer_max_stream_data: u64,
    /// Connection-level flow control
    flow: FlowController,
    control: ControlFrameManager,
    write_blocked: WriteBlockedList,
    /// Streams stalled on connection-level flow control
    connection_blocked: Vec<StreamId>,

    datagrams_recv: VecDeque<Bytes>,
    datagrams_send: VecDeque<Bytes>,

    /// A packet number gap is owed in the application space, armed when the
    /// handshake completes
    pn_skip_pending: bool,
    /// No new streams in either direction once set
    goaway: bool,

    visitor: Box<dyn SessionVisitor>,
}

impl Session {
    pub fn new(
        side: Side,
        config: TransportConfig,
        local_cid: ConnectionId,
        remote_cid: ConnectionId,
        initial_keys: Keys,
        handshake: Box<dyn HandshakeSession>,
        visitor: Box<dyn SessionVisitor>,
    ) -> Self {
        let creator = PacketCreator::new(side, remote_cid, local_cid, config.max_packet_size);
        let id_manager = StreamIdManager::new(
            side,
            config.max_concurrent_bidi_streams,
            config.max_concurrent_uni_streams,
        );
        let flow = FlowController::new(0, config.receive_window);
        let mut this = Self {
            side,
            state: State::Handshaking,
            error: None,
            close_sent: false,
            handshake,
            handshake_complete: false,
            level: EncryptionLevel::Initial,
            recv_keys: [None, None, None, None],
            spaces: [PacketSpace::new(), PacketSpace::new(), PacketSpace::new()],
            creator,
            transmits: TransmitQueue::default(),
            local_cid,
            streams: FxHashMap::default(),
            pending_streams: FxHashSet::default(),
            draining_streams: FxHashMap::default(),
            zombie_streams: FxHashMap::default(),
            closed_streams: Vec::new(),
            unclaimed_streams: VecDeque::new(),
            closed_remote: [0, 0],
            id_manager,
            peer_max_stream_data: 0,
            flow,
            control: ControlFrameManager::new(),
            write_blocked: WriteBlockedList::default(),
            connection_blocked: Vec::new(),
            datagrams_recv: VecDeque::new(),
            datagrams_send: VecDeque::new(),
            pn_skip_pending: false,
            goaway: false,
            visitor,
            config,
        };
        this.install_keys(EncryptionLevel::Initial, initial_keys);
        this.drive_handshake();
        this.write_pending();
        this
    }

    /// Install transport parameters learned during the handshake
    ///
    /// Until this is called the peer's limits are all zero and nothing but
    /// handshake data can flow.
    pub fn set_peer_params(
        &mut self,
        max_data: u64,
        max_stream_data: u64,
        max_streams_bidi: u64,
        max_streams_uni: u64,
    ) {
        self.flow.raise_send_limit(max_data);
        self.id_manager.on_max_streams(Dir::Bi, max_streams_bidi);
        self.id_manager.on_max_streams(Dir::Uni, max_streams_uni);
        self.peer_max_stream_data = max_stream_data;
    }

    //
    // Stream API
    //

    /// Open a locally-initiated stream, if the peer's limit permits one
    pub fn open(&mut self, dir: Dir) -> Option<StreamId> {
        if self.goaway || self.state == State::Draining || self.state == State::Closed {
            return None;
        }
        let id = match self.id_manager.next_outgoing(dir) {
            Some(id) => id,
            None => {
                if let Some(limit) = self.id_manager.take_blocked(dir) {
                    self.control.queue(Frame::StreamsBlocked { dir, limit });
                }
                return None;
            }
        };
        let mut stream = Stream::new(
            id,
            self.peer_max_stream_data,
            self.config.stream_receive_window,
        );
        if dir == Dir::Uni {
            stream.recv.close_unused();
        }
        self.streams.insert(id, stream);
        trace!(%id, "opened");
        Some(id)
    }

    /// Adopt the next peer-initiated stream, if one is waiting
    pub fn accept(&mut self) -> Option<StreamId> {
        self.unclaimed_streams.pop_front()
    }

    /// Write application data, bounded by stream- and connection-level
    /// flow control; the smaller window applies
    ///
    /// Returns the bytes consumed and whether `fin` was consumed. Blocked
    /// writers resume on the stream's `on_can_write` callback.
    pub fn write(
        &mut self,
        id: StreamId,
        data: &[u8],
        fin: bool,
    ) -> Result<(usize, bool), WriteError> {
        if self.state == State::Draining || self.state == State::Closed {
            return Err(WriteError::ClosedStream);
        }
        let conn_budget = self.flow.send_budget();
        let stream = self.streams.get_mut(&id).ok_or(WriteError::ClosedStream)?;
        let was_pending = stream.send.is_pending();
        let (consumed, fin_consumed) = match stream.send.write(data, fin, conn_budget) {
            Ok(x) => x,
            Err(WriteError::Blocked) => {
                if let Some(offset) = stream.send.take_blocked() {
                    self.control.queue(Frame::StreamDataBlocked { id, offset });
                }
                if conn_budget == 0 {
                    if !stream.send.connection_blocked {
                        stream.send.connection_blocked = true;
                        self.connection_blocked.push(id);
                    }
                    if let Some(offset) = self.flow.take_blocked() {
                        self.control.queue(Frame::DataBlocked { offset });
                    }
                }
                self.write_pending();
                return Err(WriteError::Blocked);
            }
            Err(e) => return Err(e),
        };
        self.flow.commit_send(consumed as u64);
        let priority = stream.priority;

        if consumed < data.len() {
            // Report whichever window ran dry; it governs the wakeup
            if let Some(offset) = stream.send.take_blocked() {
                self.control.queue(Frame::StreamDataBlocked { id, offset });
            }
            if self.flow.send_budget() == 0 {
                if !stream.send.connection_blocked {
                    stream.send.connection_blocked = true;
                    self.connection_blocked.push(id);
                }
                if let Some(offset) = self.flow.take_blocked() {
                    self.control.queue(Frame::DataBlocked { offset });
                }
            }
        }
        if !was_pending && (consumed > 0 || fin_consumed) {
            self.write_blocked.push(priority, id);
        }
        self.write_pending();
        if consumed == 0 && !fin_consumed {
            return Err(WriteError::Blocked);
        }
        Ok((consumed, fin_consumed))
    }

    /// Signal the end of the stream without further data
    pub fn finish(&mut self, id: StreamId) -> Result<(), FinishError> {
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(FinishError::ClosedStream)?;
        let was_pending = stream.send.is_pending();
        stream.send.finish()?;
        let priority = stream.priority;
        if !was_pending {
            self.write_blocked.push(priority, id);
        }
        self.write_pending();
        Ok(())
    }

    /// Read the next contiguous chunk of stream data
    pub fn read(&mut self, id: StreamId, max_len: usize) -> Result<Option<Bytes>, ReadError> {
        let stream = match self.stream_mut(id) {
            Some(stream) => stream,
            None => return Err(ReadError::ClosedStream),
        };
        let result = stream.recv.read(max_len);
        if let Ok(Some(ref chunk)) = result {
            self.flow.record_consumed(chunk.len() as u64);
            if let Some(limit) = self.flow.take_window_update() {
                self.control
                    .queue(Frame::MaxData(VarInt::from_u64(limit).unwrap()));
            }
            let update = self
                .stream_mut(id)
                .and_then(|s| s.recv.take_window_update());
            if let Some(offset) = update {
                self.control.queue(Frame::MaxStreamData { id, offset });
            }
        }
        self.maybe_transition(id);
        self.write_pending();
        result
    }

    /// Abandon the send direction; RESET_STREAM carries the bytes written so
    /// far as the final size
    ///
    /// The receive direction stays alive until the peer's FIN or reset is
    /// observed, which connection-level flow accounting requires.
    pub fn reset(&mut self, id: StreamId, error_code: VarInt) {
        let stream = match self.stream_mut(id) {
            Some(stream) => stream,
            None => return,
        };
        if let Some(final_size) = stream.send.reset() {
            self.control.queue(Frame::ResetStream(ResetStream {
                id,
                error_code,
                final_offset: VarInt::from_u64(final_size).unwrap(),
            }));
        }
        self.maybe_transition(id);
        self.write_pending();
    }

    /// Ask the peer to stop sending on `id`, discarding buffered receive data
    pub fn stop_sending(&mut self, id: StreamId, error_code: VarInt) {
        let stream = match self.stream_mut(id) {
            Some(stream) => stream,
            None => return,
        };
        if let Ok(credit) = stream.recv.stop() {
            self.flow.record_consumed(credit);
            self.control
                .queue(Frame::StopSending(StopSending { id, error_code }));
        }
        self.maybe_transition(id);
        self.write_pending();
    }

    /// Adjust a stream's scheduling weight; larger values are served first
    pub fn set_priority(&mut self, id: StreamId, priority: i32) {
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.priority = priority;
        }
    }

    /// Queue an unreliable datagram
    pub fn send_datagram(&mut self, data: Bytes) -> bool {
        let max = self.creator.max_packet_length();
        if data.len() + frame::Datagram::SIZE_BOUND > max {
            return false;
        }
        self.datagrams_send.push_back(data);
        self.write_pending();
        true
    }

    /// Take the next received datagram
    pub fn recv_datagram(&mut self) -> Option<Bytes> {
        self.datagrams_recv.pop_front()
    }

    /// Stop opening and accepting new streams; existing streams continue
    pub fn goaway(&mut self) {
        self.goaway = true;
    }

    /// Close the connection
    ///
    /// Emits exactly one CONNECTION_CLOSE; repeated calls are no-ops.
    pub fn close(&mut self, error_code: VarInt, reason: Bytes) {
        if self.error.is_some() {
            return;
        }
        self.error = Some(ConnectionError::LocallyClosed);
        let close = Close::Application(ApplicationClose { error_code, reason });
        self.send_close(close);
        self.teardown(CloseSource::Local);
    }

    //
    // Inbound path
    //

    /// Process one UDP datagram, which may hold several coalesced packets
    ///
    /// Synchronously dispatches resulting events to the visitor. The
    /// addresses and receive time feed path validation and loss timing,
    /// which belong to the host's path manager and alarm service.
    pub fn process_udp_packet(
        &mut self,
        _self_address: std::net::SocketAddr,
        _peer_address: std::net::SocketAddr,
        _receive_time: std::time::Instant,
        data: BytesMut,
    ) {
        if self.state == State::Closed {
            return;
        }
        let mut remaining = Some(data);
        while let Some(data) = remaining.take() {
            match PartialDecode::new(data, self.local_cid.len()) {
                Ok((decode, rest)) => {
                    remaining = rest;
                    self.process_decoded(decode);
                }
                Err(e) => {
                    debug!(%e, "dropping undecodable packet");
                    return;
                }
            }
            if self.state == State::Closed || self.state == State::Draining {
                break;
            }
        }
        self.write_pending();
    }

    fn process_decoded(&mut self, decode: PartialDecode) {
        if decode.dst_cid() != self.local_cid {
            debug!(cid = %decode.dst_cid(), "dropping packet for another connection");
            return;
        }
        let level = decode.level();
        let space_id = decode.space();
        let keys = match self.recv_keys[level as usize] {
            Some((ref header, ref packet)) => (header, packet),
            None => {
                debug!(?level, "dropping packet with no keys installed");
                return;
            }
        };
        let mut packet = match decode.finish(&**keys.0) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(%e, "dropping malformed packet");
                return;
            }
        };
        let space = &mut self.spaces[space_id as usize];
        let number = packet.header.number().expand(space.rx_packet);
        if keys
            .1
            .decrypt(number, &packet.header_data, &mut packet.payload)
            .is_err()
        {
            debug!(number, "packet failed authentication");
            return;
        }
        if space.dedup.insert(number) {
            trace!(number, "dropping duplicate packet");
            return;
        }
        space.rx_packet = space.rx_packet.max(number);
        space.pending_acks.insert_one(number);
        if !packet.reserved_bits_valid() {
            self.fatal(TransportError::PROTOCOL_VIOLATION("reserved bits set"));
            return;
        }
        let payload = packet.payload;
        // A handshake packet proves the peer left the initial level behind
        if self.side.is_server()
            && level == EncryptionLevel::Handshake
            && self.creator.has_keys(EncryptionLevel::Initial)
        {
            self.discard_space(SpaceId::Initial);
        }

        let iter = match frame::Iter::new(payload.freeze()) {
            Ok(iter) => iter,
            Err(e) => {
                self.fatal(e);
                return;
            }
        };
        let mut ack_eliciting = false;
        for result in iter {
            let frame = match result {
                Ok(frame) => frame,
                Err(e) => {
                    self.fatal(e.into());
                    return;
                }
            };
            ack_eliciting |= frame.is_ack_eliciting();
            if let Err(e) = self.dispatch_frame(level, frame) {
                self.fatal(e);
                return;
            }
            if self.state == State::Draining || self.state == State::Closed {
                return;
            }
        }
        if ack_eliciting {
            self.spaces[space_id as usize].permit_ack_only = true;
        }
    }

    /// Route one frame by kind; errors are fatal to the connection
    fn dispatch_frame(
        &mut self,
        level: EncryptionLevel,
        frame: Frame,
    ) -> Result<(), TransportError> {
        if level == EncryptionLevel::Initial || level == EncryptionLevel::Handshake {
            // Stream machinery is out of bounds until 1-RTT keys exist
            if matches!(frame, Frame::Stream(_) | Frame::MaxData(_) | Frame::Datagram(_)) {
                return Err(TransportError::PROTOCOL_VIOLATION(
                    "illegal frame type for encryption level",
                ));
            }
        }
        match frame {
            Frame::Padding | Frame::Ping => Ok(()),
            Frame::Crypto(crypto) => self.on_crypto(level, crypto),
            Frame::Ack(ack) => self.on_ack(level.space(), ack),
            Frame::Stream(stream) => self.on_stream_frame(stream),
            Frame::ResetStream(reset) => self.on_reset_stream(reset),
            Frame::StopSending(stop) => self.on_stop_sending(stop),
            Frame::MaxData(limit) => {
                if self.flow.raise_send_limit(limit.into_inner()) {
                    self.unblock_connection_blocked();
                }
                Ok(())
            }
            Frame::MaxStreamData { id, offset } => self.on_max_stream_data(id, offset),
            Frame::MaxStreams { dir, count } => {
                self.id_manager.on_max_streams(dir, count);
                Ok(())
            }
            Frame::DataBlocked { offset } => {
                trace!(offset, "peer reports DATA_BLOCKED");
                // Nudge the window along if the application has drained it
                if let Some(limit) = self.flow.take_window_update() {
                    self.control
                        .queue(Frame::MaxData(VarInt::from_u64(limit).unwrap()));
                }
                Ok(())
            }
            Frame::StreamDataBlocked { id, offset } => {
                trace!(%id, offset, "peer reports STREAM_DATA_BLOCKED");
                self.validate_peer_stream_ref(id)?;
                Ok(())
            }
            Frame::StreamsBlocked { dir, limit } => {
                trace!(%dir, limit, "peer reports STREAMS_BLOCKED");
                if let Some(new) = self
                    .id_manager
                    .take_max_streams_update(dir, self.closed_remote[dir as usize])
                {
                    self.control.queue(Frame::MaxStreams { dir, count: new });
                }
                Ok(())
            }
            Frame::NewConnectionId(_) | Frame::RetireConnectionId { .. } => {
                // Connection migration is the path manager's concern
                Ok(())
            }
            Frame::PathChallenge(token) => {
                // Reflected immediately on the same path, padded and alone
                if level == EncryptionLevel::OneRtt {
                    self.creator
                        .serialize_path_probe(Frame::PathResponse(token), &mut self.transmits);
                    self.record_transmits();
                }
                Ok(())
            }
            Frame::PathResponse(token) => {
                trace!(token, "path response received");
                Ok(())
            }
            Frame::Datagram(datagram) => {
                let limit = self.config.datagram_receive_buffer_size;
                if limit.is_some_and(|max| datagram.data.len() <= max) {
                    self.datagrams_recv.push_back(datagram.data);
                    self.visitor.on_datagram_received();
                }
                Ok(())
            }
            Frame::NewToken(token) => {
                if self.side.is_server() {
                    return Err(TransportError::PROTOCOL_VIOLATION(
                        "client sent NEW_TOKEN",
                    ));
                }
                self.visitor.on_new_token(token.token);
                Ok(())
            }
            Frame::HandshakeDone => {
                if self.side.is_server() {
                    return Err(TransportError::PROTOCOL_VIOLATION(
                        "client sent HANDSHAKE_DONE",
                    ));
                }
                // The server has confirmed the handshake; retire the
                // handshake number space outright
                self.discard_space(SpaceId::Handshake);
                Ok(())
            }
            Frame::Close(close) => {
                self.on_connection_close(close);
                Ok(())
            }
        }
    }

    fn on_crypto(
        &mut self,
        level: EncryptionLevel,
        crypto: frame::Crypto,
    ) -> Result<(), TransportError> {
        let space = &mut self.spaces[level.space() as usize];
        space.crypto_stream.insert(crypto.offset, crypto.data);
        while let Some(chunk) = space.crypto_stream.read(usize::MAX) {
            self.handshake.read_handshake(level, &chunk)?;
        }
        self.drive_handshake();
        Ok(())
    }

    fn on_stream_frame(&mut self, stream: frame::Stream) -> Result<(), TransportError> {
        let id = stream.id;
        self.ensure_stream(id)?;
        let Some(entry) = self.stream_mut(id) else {
            // Stream already fully closed; stale retransmission
            trace!(%id, "stream data for dead stream");
            return Ok(());
        };
        let was_finished = entry.recv.is_finished();
        let (new_bytes, readable) = entry.recv.ingest(stream.offset, stream.data, stream.fin)?;
        let now_finished = entry.recv.is_finished();
        self.flow.consume_receive_credit(new_bytes)?;
        if readable || (now_finished && !was_finished) {
            self.visitor.on_data_available(id);
        }
        self.maybe_transition(id);
        Ok(())
    }

    fn on_reset_stream(&mut self, reset: ResetStream) -> Result<(), TransportError> {
        let id = reset.id;
        self.ensure_stream(id)?;
        self.visitor.on_rst_stream_received(&reset);
        let Some(stream) = self.stream_mut(id) else {
            return Ok(());
        };
        match stream
            .recv
            .on_reset(reset.error_code, reset.final_offset.into_inner())?
        {
            Some(new_bytes) => {
                // Flow control counts the full final size, received or not
                self.flow.consume_receive_credit(new_bytes)?;
                self.flow.record_consumed(new_bytes);
                self.visitor.on_data_available(id);
            }
            None => return Ok(()),
        }
        self.maybe_transition(id);
        Ok(())
    }

    fn on_stop_sending(&mut self, stop: StopSending) -> Result<(), TransportError> {
        let id = stop.id;
        if id.dir() == Dir::Uni && id.initiator() != self.side {
            return Err(TransportError::STREAM_STATE_ERROR(
                "STOP_SENDING for peer-initiated unidirectional stream",
            ));
        }
        self.ensure_stream(id)?;
        self.visitor.on_stop_sending_received(&stop);
        let Some(stream) = self.stream_mut(id) else {
            return Ok(());
        };
        if stream.send.try_stop(stop.error_code) {
            // Respond with a reset carrying the requested code
            if let Some(final_size) = stream.send.reset() {
                self.control.queue(Frame::ResetStream(ResetStream {
                    id,
                    error_code: stop.error_code,
                    final_offset: VarInt::from_u64(final_size).unwrap(),
                }));
            }
        }
        self.maybe_transition(id);
        Ok(())
    }

    fn on_max_stream_data(&mut self, id: StreamId, offset: u64) -> Result<(), TransportError> {
        self.validate_peer_stream_ref(id)?;
        let Some(stream) = self.stream_mut(id) else {
            return Ok(());
        };
        if stream.send.increase_max_data(offset) {
            let priority = stream.priority;
            if stream.send.is_pending() {
                self.write_blocked.push(priority, id);
            }
            self.visitor.on_can_write(id);
        }
        Ok(())
    }

    fn on_connection_close(&mut self, close: Close) {
        if self.error.is_some() {
            return;
        }
        debug!("connection closed by peer");
        self.error = Some(match close {
            Close::Connection(reason) => ConnectionError::ConnectionClosed(reason),
            Close::Application(reason) => ConnectionError::ApplicationClosed(reason),
        });
        self.teardown(CloseSource::Remote);
    }

    /// Create any streams implied by a peer frame referencing `id`
    fn ensure_stream(&mut self, id: StreamId) -> Result<(), TransportError> {
        if id.initiator() == self.side {
            if !self.id_manager.is_local_issued(id) {
                return Err(TransportError::STREAM_STATE_ERROR(
                    "peer referenced an unopened local stream",
                ));
            }
            return Ok(());
        }
        let newly = self.id_manager.maybe_open_remote(id)?;
        for index in newly {
            let new_id = StreamId::new(!self.side, id.dir(), index);
            // The id a frame actually referenced becomes active right away;
            // lower ids spring into existence with no frames yet seen
            if new_id == id {
                self.pending_streams.remove(&new_id);
                self.install_remote_stream(new_id);
            } else {
                self.pending_streams.insert(new_id);
            }
        }
        if self.pending_streams.remove(&id) {
            self.install_remote_stream(id);
        }
        Ok(())
    }

    fn install_remote_stream(&mut self, id: StreamId) {
        let send_window = if id.dir() == Dir::Uni {
            // We never send on the peer's unidirectional streams
            0
        } else {
            self.peer_max_stream_data
        };
        let mut stream = Stream::new(id, send_window, self.config.stream_receive_window);
        if id.dir() == Dir::Uni {
            stream.send.close_unused();
        }
        self.streams.insert(id, stream);
        self.unclaimed_streams.push_back(id);
        self.visitor.on_stream_opened(id);
    }

    /// Frames referencing locally-initiated streams must name ones we opened
    fn validate_peer_stream_ref(&mut self, id: StreamId) -> Result<(), TransportError> {
        if id.initiator() == self.side && !self.id_manager.is_local_issued(id) {
            return Err(TransportError::STREAM_STATE_ERROR(
                "peer referenced an unopened local stream",
            ));
        }
        if id.initiator() != self.side {
            self.id_manager.maybe_open_remote(id)?;
        }
        Ok(())
    }

    //
    // Acknowledgment and loss
    //

    fn on_ack(&mut self, space_id: SpaceId, ack: frame::Ack) -> Result<(), TransportError> {
        if ack.largest >= self.spaces[space_id as usize].next_packet_number {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "acknowledged an unsent packet",
            ));
        }
        let space = &mut self.spaces[space_id as usize];
        space.largest_acked = Some(space.largest_acked.map_or(ack.largest, |x| x.max(ack.largest)));

        // Walk ranges high to low, as they are encoded
        let mut newly_acked = Vec::new();
        for range in ack.iter() {
            let mut pns: Vec<u64> = space
                .sent_packets
                .range(*range.start()..=*range.end())
                .map(|(&pn, _)| pn)
                .collect();
            pns.reverse();
            for pn in pns {
                let info = space.sent_packets.remove(&pn).unwrap();
                newly_acked.push((pn, info));
            }
        }
        for (pn, info) in newly_acked {
            trace!(pn, "packet acked");
            self.on_packet_acked(space_id, info);
        }
        self.detect_lost_packets(space_id);
        Ok(())
    }

    fn on_packet_acked(&mut self, space_id: SpaceId, info: SentPacket) {
        for meta in info.stream_frames {
            let id = meta.id;
            let Some(stream) = self.stream_mut(id) else {
                continue;
            };
            let finished = stream.send.on_acked(&meta);
            if finished {
                trace!(%id, "all sent data acknowledged");
                self.visitor.on_stream_closed(id);
            }
            self.maybe_transition(id);
        }
        let space = &mut self.spaces[space_id as usize];
        for range in info.crypto_ranges {
            space.crypto_retransmits.remove(range);
        }
        for frame in info.control_frames {
            self.control.on_frame_acked(&frame);
        }
        // Ranges this packet acknowledged are confirmed received; stop
        // re-acknowledging them
        let space = &mut self.spaces[space_id as usize];
        for range in info.acks.iter() {
            space.pending_acks.remove(range);
        }
    }

    /// Packets reordered beyond the threshold behind the largest acked are lost
    fn detect_lost_packets(&mut self, space_id: SpaceId) {
        let space = &mut self.spaces[space_id as usize];
        let Some(largest_acked) = space.largest_acked else {
            return;
        };
        let mut lost = Vec::new();
        for (&pn, _) in space.sent_packets.iter() {
            if pn + PACKET_REORDERING_THRESHOLD <= largest_acked {
                lost.push(pn);
            } else {
                break;
            }
        }
        for pn in lost {
            let info = self.spaces[space_id as usize].sent_packets.remove(&pn).unwrap();
            debug!(pn, ?space_id, "packet lost");
            self.on_packet_lost(space_id, info);
        }
    }

    fn on_packet_lost(&mut self, space_id: SpaceId, info: SentPacket) {
        trace!(size = info.size, "re-offering frames of a lost packet");
        for meta in info.stream_frames {
            let id = meta.id;
            let Some(stream) = self.stream_mut(id) else {
                continue;
            };
            // The owning stream decides whether the range is still useful;
            // it may have been acked via a later packet
            stream.send.on_lost(&meta);
            let priority = stream.priority;
            if stream.send.is_pending() {
                self.write_blocked.push(priority, id);
            }
        }
        let space = &mut self.spaces[space_id as usize];
        for range in info.crypto_ranges {
            space.crypto_retransmits.insert(range);
        }
        for frame in info.control_frames {
            self.control.on_frame_lost(frame);
        }
    }

    //
    // Handshake plumbing
    //

    fn drive_handshake(&mut self) {
        loop {
            let mut buf = Vec::new();
            let keys = self.handshake.write_handshake(&mut buf);
            if !buf.is_empty() {
                let space = &mut self.spaces[self.level.space() as usize];
                space.crypto_pending.extend_from_slice(&buf);
            }
            match keys {
                Some(keys) => {
                    let next = self.next_level();
                    self.install_keys(next, keys);
                }
                None => break,
            }
        }
        if !self.handshake.is_handshaking() && !self.handshake_complete {
            self.handshake_complete = true;
            self.state = State::Established;
            debug!("handshake complete");
            self.visitor.on_handshake_complete();
            if self.side.is_server() {
                self.control.queue(Frame::HandshakeDone);
                self.discard_space(SpaceId::Handshake);
            }
            self.pn_skip_pending = true;
        }
    }

    fn next_level(&self) -> EncryptionLevel {
        match self.level {
            EncryptionLevel::Initial => EncryptionLevel::Handshake,
            EncryptionLevel::ZeroRtt => EncryptionLevel::Handshake,
            EncryptionLevel::Handshake => EncryptionLevel::OneRtt,
            EncryptionLevel::OneRtt => EncryptionLevel::OneRtt,
        }
    }

    fn install_keys(&mut self, level: EncryptionLevel, keys: Keys) {
        debug!(?level, "keys installed");
        let Keys { header, packet } = keys;
        self.creator
            .install_keys(level, header.local, packet.local);
        self.recv_keys[level as usize] = Some((header.remote, packet.remote));
        if level > self.level {
            self.level = level;
        }
    }

    /// Drop keys and all outstanding packets at a retired number space
    fn discard_space(&mut self, space_id: SpaceId) {
        let level = match space_id {
            SpaceId::Initial => EncryptionLevel::Initial,
            SpaceId::Handshake => EncryptionLevel::Handshake,
            SpaceId::Data => return, // the application space is never retired
        };
        trace!(?space_id, "space discarded");
        self.creator.discard_keys(level);
        self.recv_keys[level as usize] = None;
        self.spaces[space_id as usize].discard();
    }

    //
    // Outbound path
    //

    /// Entry point for the host once a blocked socket becomes writable again
    pub fn on_can_write(&mut self) {
        self.write_pending();
    }

    /// Push everything sendable into serialized packets
    pub fn write_pending(&mut self) {
        if self.state == State::Draining || self.state == State::Closed {
            return;
        }
        self.send_handshake_data();
        self.send_acks();
        if self.creator.has_keys(EncryptionLevel::OneRtt)
            || self.creator.has_keys(EncryptionLevel::ZeroRtt)
        {
            let level = if self.creator.has_keys(EncryptionLevel::OneRtt) {
                EncryptionLevel::OneRtt
            } else {
                EncryptionLevel::ZeroRtt
            };
            self.creator.flush(&mut self.transmits);
            self.creator.set_encryption_level(level);
            if self.pn_skip_pending && level == EncryptionLevel::OneRtt {
                // A gap in the sequence exposes peers that acknowledge
                // packet numbers they never received
                self.pn_skip_pending = false;
                let skip: u64 = rand::rng().random_range(1..16);
                let space = &self.spaces[SpaceId::Data as usize];
                let (least, in_flight) =
                    (space.least_unacked(), space.ack_eliciting_in_flight());
                self.creator.skip_packet_numbers(skip, least, in_flight);
            }
            self.send_control_frames();
            self.send_datagrams();
            self.send_stream_data();
        }
        self.creator.flush(&mut self.transmits);
        self.record_transmits();
    }

    /// Emit CRYPTO frames for every space that has data and keys
    fn send_handshake_data(&mut self) {
        for space_id in SpaceId::iter() {
            let level = match space_id {
                SpaceId::Initial => EncryptionLevel::Initial,
                SpaceId::Handshake => EncryptionLevel::Handshake,
                SpaceId::Data => EncryptionLevel::OneRtt,
            };
            if !self.creator.has_keys(level) {
                continue;
            }
            if !self.spaces[space_id as usize].has_crypto_data() {
                continue;
            }
            self.creator.flush(&mut self.transmits);
            self.creator.set_encryption_level(level);
            // Retransmissions first, then fresh data
            loop {
                let range = self.spaces[space_id as usize].crypto_retransmits.pop_min();
                let Some(range) = range else { break };
                // Sent bytes are retained from offset zero while the space lives
                let data: Vec<u8> = self.spaces[space_id as usize].crypto_sent_data
                    [range.start as usize..range.end as usize]
                    .to_vec();
                self.creator.consume_crypto_data(
                    range.start,
                    &data,
                    TransmissionType::LossRetransmission,
                    &mut self.transmits,
                );
            }
            let pending = std::mem::take(&mut self.spaces[space_id as usize].crypto_pending);
            if !pending.is_empty() {
                let offset = self.spaces[space_id as usize].crypto_offset;
                self.creator.consume_crypto_data(
                    offset,
                    &pending,
                    TransmissionType::NotRetransmission,
                    &mut self.transmits,
                );
                let space = &mut self.spaces[space_id as usize];
                space.crypto_offset += pending.len() as u64;
                space.crypto_sent_data.extend_from_slice(&pending);
            }
            // Ack-eliciting initial packets must fill the minimum datagram
            if level == EncryptionLevel::Initial {
                self.pad_initial_flight();
            }
            self.creator.flush(&mut self.transmits);
        }
    }

    /// Pad the in-progress initial packet so the datagram reaches 1200 bytes,
    /// leaving room for a coalesced handshake packet when one is imminent
    fn pad_initial_flight(&mut self) {
        let mut budget = MIN_INITIAL_SIZE;
        if self.creator.has_keys(EncryptionLevel::Handshake)
            && self.spaces[SpaceId::Handshake as usize].has_crypto_data()
        {
            let hs = &self.spaces[SpaceId::Handshake as usize];
            let data_len = hs.crypto_pending.len();
            let frame_size = 1
                + VarInt::size_of(hs.crypto_offset)
                + VarInt::size_of(data_len as u64)
                + data_len;
            let projected =
                self.creator.packet_overhead(EncryptionLevel::Handshake) + frame_size;
            if projected + 64 < budget {
                budget -= projected;
            }
        }
        let current = self.creator.packet_size() + self.creator.tag_len();
        let shortfall = budget.saturating_sub(current);
        if shortfall > 0 {
            self.creator.add_pending_padding(shortfall);
        }
    }

    fn send_acks(&mut self) {
        for space_id in SpaceId::iter() {
            let level = match space_id {
                SpaceId::Initial => EncryptionLevel::Initial,
                SpaceId::Handshake => EncryptionLevel::Handshake,
                SpaceId::Data => EncryptionLevel::OneRtt,
            };
            if !self.creator.has_keys(level) {
                continue;
            }
            if !self.spaces[space_id as usize].wants_ack() {
                continue;
            }
            if self.creator.level() != level {
                self.creator.flush(&mut self.transmits);
                self.creator.set_encryption_level(level);
            }
            let ack = {
                let space = &mut self.spaces[space_id as usize];
                space.permit_ack_only = false;
                frame::Ack::from_ranges(0, &space.pending_acks)
            };
            if !self
                .creator
                .add_frame(Frame::Ack(ack.clone()), TransmissionType::NotRetransmission)
            {
                self.creator.flush(&mut self.transmits);
                self.creator
                    .add_frame(Frame::Ack(ack), TransmissionType::NotRetransmission);
            }
        }
    }

    fn send_control_frames(&mut self) {
        if self.control.is_empty() {
            return;
        }
        while let Some(frame) = self.control.pop() {
            if !self
                .creator
                .add_frame(frame.clone(), TransmissionType::NotRetransmission)
            {
                self.creator.flush(&mut self.transmits);
                if !self
                    .creator
                    .add_frame(frame.clone(), TransmissionType::NotRetransmission)
                {
                    self.control.push_front(frame);
                    break;
                }
            }
        }
    }

    fn send_datagrams(&mut self) {
        while let Some(data) = self.datagrams_send.pop_front() {
            if !self.creator.has_room_for_datagram_frame(data.len()) {
                self.creator.flush(&mut self.transmits);
            }
            if !self.creator.add_frame(
                Frame::Datagram(frame::Datagram { data: data.clone() }),
                TransmissionType::NotRetransmission,
            ) {
                self.datagrams_send.push_front(data);
                break;
            }
        }
    }

    /// Serve write-blocked streams in priority order, round-robin within a
    /// priority level
    fn send_stream_data(&mut self) {
        let mut guard = 0usize;
        while let Some(id) = self.write_blocked.pop() {
            guard += 1;
            if guard > 10_000 {
                debug_assert!(false, "write scheduler failed to converge");
                break;
            }
            let progressed = self.write_stream_frames(id);
            // Sending a FIN may have turned the stream into a zombie
            self.maybe_transition(id);
            let Some(stream) = self.stream_mut(id) else {
                continue;
            };
            if stream.send.is_pending() {
                let priority = stream.priority;
                if progressed {
                    // Round-robin: go to the back of this priority level
                    self.write_blocked.push(priority, id);
                } else {
                    // A stream that claims writability but makes no progress
                    // would spin the scheduler
                    debug_assert!(false, "stream {id} wrote nothing while writable");
                    break;
                }
            }
        }
    }

    /// Move one stream's sendable data into the packet creator
    ///
    /// Returns whether bytes or a FIN were consumed.
    fn write_stream_frames(&mut self, id: StreamId) -> bool {
        let mut progressed = false;
        loop {
            let Some(stream) = self.stream_mut(id) else {
                return progressed;
            };
            if !stream.send.is_pending() {
                return progressed;
            }
            let range = stream.send.buffer.poll_transmit(MAX_TRANSMIT_CHUNK);
            let at_end = range.end == stream.send.buffer.offset();
            let fin = stream.send.fin_pending && at_end;
            if range.is_empty() && !fin {
                return progressed;
            }
            let data = stream.send.buffer.get(range.clone()).to_vec();
            let (consumed, fin_consumed) = self.creator.consume_data(
                id,
                range.start,
                &data,
                fin,
                TransmissionType::NotRetransmission,
                &mut self.transmits,
            );
            if fin_consumed {
                if let Some(stream) = self.stream_mut(id) {
                    stream.send.fin_pending = false;
                }
            }
            progressed |= consumed > 0 || fin_consumed;
            if consumed < data.len() || (range.is_empty() && fin) {
                return progressed;
            }
        }
    }

    /// Record every serialized packet in its number space and surface fatal
    /// serialization errors
    fn record_transmits(&mut self) {
        if let Some((_code, reason)) = self.transmits.error.take() {
            self.fatal(TransportError::INTERNAL_ERROR(reason));
            return;
        }
        while let Some(packet) = self.transmits.queue.pop_front() {
            let space_id = packet.level.space();
            {
                // Mirror the creator's packet number sequence for ack
                // validation and packet-number-length selection
                let space = &mut self.spaces[space_id as usize];
                space.next_packet_number =
                    space.next_packet_number.max(packet.packet_number + 1);
            }
            // Bound the retransmission ledger; evicted packets are treated
            // as lost so their data finds another ride
            while self.spaces[space_id as usize].sent_packets.len() >= MAX_OUTSTANDING_PACKETS
            {
                let Some((&pn, _)) = self.spaces[space_id as usize].sent_packets.iter().next()
                else {
                    break;
                };
                let info = self.spaces[space_id as usize]
                    .sent_packets
                    .remove(&pn)
                    .unwrap();
                self.on_packet_lost(space_id, info);
            }
            if packet.ack_eliciting {
                let record = SentPacket {
                    ack_eliciting: packet.ack_eliciting,
                    size: packet.buffer.len() as u16,
                    stream_frames: packet.stream_frames.clone(),
                    crypto_ranges: packet.crypto_ranges.clone(),
                    control_frames: packet.control_frames.clone(),
                    acks: packet.acks.clone(),
                };
                self.spaces[space_id as usize]
                    .sent_packets
                    .insert(packet.packet_number, record);
            }
            // Sending at the handshake level retires a client's initial keys
            if self.side.is_client()
                && packet.level == EncryptionLevel::Handshake
                && self.creator.has_keys(EncryptionLevel::Initial)
            {
                self.discard_space(SpaceId::Initial);
            }
            self.transmits.outgoing.push_back(packet);
        }
        // Keep the truncated packet number unambiguous as flights change
        let space = &self.spaces[self.creator.level().space() as usize];
        let least = space.least_unacked();
        let in_flight = space.ack_eliciting_in_flight();
        self.creator.update_packet_number_length(least, in_flight);
    }

    /// Take the next encrypted packet destined for the wire
    pub fn poll_transmit(&mut self) -> Option<SerializedPacket> {
        self.transmits.outgoing.pop_front()
    }

    /// Assemble the next UDP datagram, coalescing packets at different levels
    pub fn poll_datagram(&mut self) -> Option<Vec<u8>> {
        let first = self.transmits.outgoing.pop_front()?;
        let max = self.creator.max_packet_length().max(first.buffer.len());
        let mut datagram = first.buffer;
        if first.fate == PacketFate::Coalesce {
            while let Some(next) = self.transmits.outgoing.front() {
                if datagram.len() + next.buffer.len() > max {
                    break;
                }
                let next = self.transmits.outgoing.pop_front().unwrap();
                let done = next.fate != PacketFate::Coalesce;
                datagram.extend_from_slice(&next.buffer);
                if done {
                    break;
                }
            }
        }
        Some(datagram)
    }

    //
    // Error handling and teardown
    //

    /// Latch a fatal error, close the connection, and notify the visitor once
    ///
    /// Errors never cross the session boundary as return values; repeated
    /// calls are idempotent.
    fn fatal(&mut self, error: TransportError) {
        if self.error.is_some() {
            return;
        }
        warn!(%error, "connection error");
        self.error = Some(ConnectionError::TransportError(error.clone()));
        self.send_close(Close::Connection(error.into()));
        self.teardown(CloseSource::Local);
    }

    fn send_close(&mut self, close: Close) {
        if self.close_sent {
            return;
        }
        // Closing frames ride at the highest level with keys
        if self.creator.has_keys(self.level) {
            self.creator.flush(&mut self.transmits);
            self.creator.set_encryption_level(self.level);
            if !self
                .creator
                .add_frame(Frame::Close(close), TransmissionType::NotRetransmission)
            {
                warn!("close frame did not fit");
            }
            self.creator.flush(&mut self.transmits);
            self.record_transmits();
        }
        self.close_sent = true;
    }

    /// Drop all stream state and enter the draining period
    fn teardown(&mut self, source: CloseSource) {
        self.state = State::Draining;
        let error = self.error.clone().expect("teardown without error");
        for (_, stream) in self.streams.drain() {
            self.closed_streams.push(stream);
        }
        for (_, stream) in self.draining_streams.drain() {
            self.closed_streams.push(stream);
        }
        for (_, stream) in self.zombie_streams.drain() {
            self.closed_streams.push(stream);
        }
        self.pending_streams.clear();
        self.unclaimed_streams.clear();
        self.write_blocked.clear();
        self.connection_blocked.clear();
        self.control.clear();
        self.datagrams_send.clear();
        self.visitor.on_connection_closed(&error, source);
    }

    //
    // Alarm entry points
    //

    pub fn on_alarm(&mut self, timer: Timer) {
        match timer {
            Timer::Idle => {
                if self.state == State::Draining {
                    // Draining period over; the connection may be destroyed
                    self.state = State::Closed;
                } else if self.error.is_none() {
                    self.error = Some(ConnectionError::TimedOut);
                    // Idle closure is silent; no CONNECTION_CLOSE is sent
                    self.close_sent = true;
                    self.teardown(CloseSource::Local);
                }
            }
            Timer::LossDetection => {
                // Probe: the oldest ack-eliciting packet per space is
                // declared lost and its frames re-offered
                for space_id in SpaceId::iter() {
                    let space = &mut self.spaces[space_id as usize];
                    let Some((&pn, _)) = space.sent_packets.iter().next() else {
                        continue;
                    };
                    let info = space.sent_packets.remove(&pn).unwrap();
                    debug!(pn, ?space_id, "probe timeout; retransmitting");
                    self.on_packet_lost(space_id, info);
                }
                self.write_pending();
            }
            Timer::CleanupClosedStreams => {
                trace!(count = self.closed_streams.len(), "reaping closed streams");
                self.closed_streams.clear();
            }
            Timer::PathDegrading => {
                debug!("path degrading");
            }
        }
    }

    //
    // Stream map transitions
    //

    fn stream_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        if self.streams.contains_key(&id) {
            return self.streams.get_mut(&id);
        }
        if self.draining_streams.contains_key(&id) {
            return self.draining_streams.get_mut(&id);
        }
        self.zombie_streams.get_mut(&id)
    }

    /// Re-home `id` according to its lifecycle state
    ///
    /// The maps stay disjoint: active, draining (FIN both ways, unread data),
    /// zombie (locally done, unacked bytes), closed (awaiting cleanup).
    fn maybe_transition(&mut self, id: StreamId) {
        let stream = if let Some(s) = self.streams.remove(&id) {
            s
        } else if let Some(s) = self.draining_streams.remove(&id) {
            s
        } else if let Some(s) = self.zombie_streams.remove(&id) {
            s
        } else {
            return;
        };

        if stream.is_closed() {
            trace!(%id, "stream closed");
            self.control.retire_stream(id);
            if id.initiator() != self.side {
                let dir = id.dir();
                self.closed_remote[dir as usize] += 1;
                if let Some(count) = self
                    .id_manager
                    .take_max_streams_update(dir, self.closed_remote[dir as usize])
                {
                    self.control.drop_stale_max_streams(dir, count);
                    self.control.queue(Frame::MaxStreams { dir, count });
                }
            }
            self.closed_streams.push(stream);
            return;
        }
        if stream.is_zombie() {
            self.zombie_streams.insert(id, stream);
            return;
        }
        if stream.send.is_finished() && stream.recv.is_draining() {
            self.draining_streams.insert(id, stream);
            return;
        }
        self.streams.insert(id, stream);
    }

    fn unblock_connection_blocked(&mut self) {
        let blocked = std::mem::take(&mut self.connection_blocked);
        for id in blocked {
            let Some(stream) = self.stream_mut(id) else {
                continue;
            };
            stream.send.connection_blocked = false;
            let priority = stream.priority;
            if stream.send.is_pending() {
                self.write_blocked.push(priority, id);
            }
            self.visitor.on_can_write(id);
        }
    }

    //
    // Introspection
    //

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn is_handshaking(&self) -> bool {
        !self.handshake_complete
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Draining | State::Closed)
    }

    /// The error that ended the connection, if any
    pub fn error(&self) -> Option<&ConnectionError> {
        self.error.as_ref()
    }

    /// Number of streams alive in any map
    pub fn stream_count(&self) -> usize {
        self.streams.len() + self.draining_streams.len() + self.zombie_streams.len()
    }

    pub fn zombie_count(&self) -> usize {
        self.zombie_streams.len()
    }
}

/// Outgoing packets between serialization and the host's writer
#[derive(Default)]
struct TransmitQueue {
    /// Serialized but not yet recorded in a number space
    queue: VecDeque<SerializedPacket>,
    /// Recorded packets ready for the wire
    outgoing: VecDeque<SerializedPacket>,
    error: Option<(TransportErrorCode, &'static str)>,
}

impl PacketSink for TransmitQueue {
    fn on_serialized_packet(&mut self, packet: SerializedPacket) {
        self.queue.push_back(packet);
    }

    fn on_unrecoverable_error(&mut self, code: TransportErrorCode, reason: &'static str) {
        if self.error.is_none() {
            self.error = Some((code, reason));
        }
    }
}

/// Streams with queued data, ordered by priority with round-robin inside a
/// priority level
#[derive(Default)]
struct WriteBlockedList {
    levels: BinaryHeap<PendingLevel>,
    queued: FxHashSet<StreamId>,
}

impl WriteBlockedList {
    fn push(&mut self, priority: i32, id: StreamId) {
        if !self.queued.insert(id) {
            return;
        }
        for level in self.levels.iter() {
            if level.priority == priority {
                level.queue.borrow_mut().push_back(id);
                return;
            }
        }
        let mut queue = VecDeque::new();
        queue.push_back(id);
        self.levels.push(PendingLevel {
            queue: std::cell::RefCell::new(queue),
            priority,
        });
    }

    fn pop(&mut self) -> Option<StreamId> {
        loop {
            let level = self.levels.peek()?;
            let id = level.queue.borrow_mut().pop_front();
            match id {
                Some(id) => {
                    self.queued.remove(&id);
                    return Some(id);
                }
                None => {
                    self.levels.pop();
                }
            }
        }
    }

    fn clear(&mut self) {
        self.levels.clear();
        self.queued.clear();
    }
}

struct PendingLevel {
    // RefCell is needed because BinaryHeap doesn't have an iter_mut()
    queue: std::cell::RefCell<VecDeque<StreamId>>,
    priority: i32,
}

impl PartialEq for PendingLevel {
    fn eq(&self, other: &Self) -> bool {
        self.priority.eq(&other.priority)
    }
}

impl PartialOrd for PendingLevel {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Eq for PendingLevel {}

impl Ord for PendingLevel {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority.cmp(&other.priority)
    }
}

/// Largest slice moved from a send buffer into the creator per step
const MAX_TRANSMIT_CHUNK: usize = 16 * 1024;

/// Bound on retained per-space retransmission records
const MAX_OUTSTANDING_PACKETS: usize = 4096;
