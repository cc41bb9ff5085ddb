use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;

use assert_matches::assert_matches;
use bytes::{Bytes, BytesMut};

use crate::creator::{PacketCreator, PacketSink, SerializedPacket};
use crate::crypto::{null, HandshakeSession, Keys};
use crate::frame::{Frame, ResetStream, StopSending};
use crate::packet::{EncryptionLevel, PartialDecode};
use crate::session::{CloseSource, ConnectionError, Session, SessionVisitor, Timer};
use crate::shared::ConnectionId;
use crate::stream::{ReadError, WriteError};
use crate::transport_error::Code as TransportErrorCode;
use crate::varint::VarInt;
use crate::{Dir, Side, StreamId, TransmissionType, TransportConfig};

const TAG_LEN: usize = 16;

fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "error".into()),
        )
        .with_test_writer()
        .finish();
    tracing::subscriber::set_default(sub)
}

//
// Scripted stand-in for the TLS machinery driven over CRYPTO frames
//

struct TestHandshake {
    side: Side,
    /// Clients with early material ship handshake data in their first flight
    eager: bool,
    stage: u8,
    sent_hello: bool,
    sent_finished: bool,
    peer_hello: bool,
    peer_finished: bool,
}

impl TestHandshake {
    fn new(side: Side, eager: bool) -> Box<Self> {
        Box::new(Self {
            side,
            eager,
            stage: 0,
            sent_hello: false,
            sent_finished: false,
            peer_hello: false,
            peer_finished: false,
        })
    }
}

impl HandshakeSession for TestHandshake {
    fn is_handshaking(&self) -> bool {
        match self.side {
            Side::Client => !(self.sent_finished && self.stage == 2),
            Side::Server => !self.peer_finished,
        }
    }

    fn read_handshake(
        &mut self,
        _level: EncryptionLevel,
        data: &[u8],
    ) -> Result<(), crate::TransportError> {
        match data {
            b"client hello" | b"server hello" => self.peer_hello = true,
            b"finished" => self.peer_finished = true,
            _ => {}
        }
        Ok(())
    }

    fn write_handshake(&mut self, buf: &mut Vec<u8>) -> Option<Keys> {
        match self.side {
            Side::Client => {
                if !self.sent_hello {
                    self.sent_hello = true;
                    buf.extend_from_slice(b"client hello");
                    if self.eager {
                        self.stage = 1;
                        return Some(null::keys(TAG_LEN));
                    }
                    return None;
                }
                if self.stage == 0 && self.peer_hello {
                    self.stage = 1;
                    return Some(null::keys(TAG_LEN));
                }
                if self.stage == 1 {
                    self.stage = 2;
                    self.sent_finished = true;
                    buf.extend_from_slice(b"finished");
                    return Some(null::keys(TAG_LEN));
                }
                None
            }
            Side::Server => {
                if self.peer_hello && !self.sent_hello {
                    self.sent_hello = true;
                    self.stage = 1;
                    buf.extend_from_slice(b"server hello");
                    return Some(null::keys(TAG_LEN));
                }
                if self.stage == 1 {
                    self.stage = 2;
                    buf.extend_from_slice(b"finished");
                    return Some(null::keys(TAG_LEN));
                }
                None
            }
        }
    }
}

//
// Recording visitor
//

#[derive(Default)]
struct Events {
    readable: Vec<StreamId>,
    writable: Vec<StreamId>,
    closed: Vec<StreamId>,
    opened: Vec<StreamId>,
    resets: Vec<ResetStream>,
    stops: Vec<StopSending>,
    conn_closed: Vec<CloseSource>,
    handshake_complete: bool,
    datagrams: usize,
}

struct Recorder(Rc<RefCell<Events>>);

impl SessionVisitor for Recorder {
    fn on_data_available(&mut self, id: StreamId) {
        self.0.borrow_mut().readable.push(id);
    }
    fn on_can_write(&mut self, id: StreamId) {
        self.0.borrow_mut().writable.push(id);
    }
    fn on_stream_closed(&mut self, id: StreamId) {
        self.0.borrow_mut().closed.push(id);
    }
    fn on_stream_opened(&mut self, id: StreamId) {
        self.0.borrow_mut().opened.push(id);
    }
    fn on_connection_closed(&mut self, _error: &ConnectionError, source: CloseSource) {
        self.0.borrow_mut().conn_closed.push(source);
    }
    fn on_rst_stream_received(&mut self, frame: &ResetStream) {
        self.0.borrow_mut().resets.push(*frame);
    }
    fn on_stop_sending_received(&mut self, frame: &StopSending) {
        self.0.borrow_mut().stops.push(*frame);
    }
    fn on_handshake_complete(&mut self) {
        self.0.borrow_mut().handshake_complete = true;
    }
    fn on_datagram_received(&mut self) {
        self.0.borrow_mut().datagrams += 1;
    }
}

//
// Connected pair harness
//

const CLIENT_CID: [u8; 8] = [0xc1; 8];
const SERVER_CID: [u8; 8] = [0x5e; 8];

fn addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 4433))
}

struct Pair {
    client: Session,
    server: Session,
    client_events: Rc<RefCell<Events>>,
    server_events: Rc<RefCell<Events>>,
}

impl Pair {
    fn new(eager: bool, server_config: TransportConfig) -> Self {
        let client_events = Rc::new(RefCell::new(Events::default()));
        let server_events = Rc::new(RefCell::new(Events::default()));
        let client = Session::new(
            Side::Client,
            TransportConfig::default(),
            ConnectionId::new(&CLIENT_CID),
            ConnectionId::new(&SERVER_CID),
            null::keys(TAG_LEN),
            TestHandshake::new(Side::Client, eager),
            Box::new(Recorder(client_events.clone())),
        );
        let server = Session::new(
            Side::Server,
            server_config,
            ConnectionId::new(&SERVER_CID),
            ConnectionId::new(&CLIENT_CID),
            null::keys(TAG_LEN),
            TestHandshake::new(Side::Server, false),
            Box::new(Recorder(server_events.clone())),
        );
        Self {
            client,
            server,
            client_events,
            server_events,
        }
    }

    fn set_params(&mut self, max_data: u64) {
        self.client.set_peer_params(max_data, 1 << 20, 32, 32);
        self.server.set_peer_params(1 << 20, 1 << 20, 32, 32);
    }

    /// Shuttle datagrams both ways until neither side produces more
    fn drive(&mut self) {
        for _ in 0..64 {
            let mut progress = false;
            while let Some(datagram) = self.client.poll_datagram() {
                progress = true;
                self.server.process_udp_packet(
                    addr(),
                    addr(),
                    Instant::now(),
                    BytesMut::from(&datagram[..]),
                );
            }
            while let Some(datagram) = self.server.poll_datagram() {
                progress = true;
                self.client.process_udp_packet(
                    addr(),
                    addr(),
                    Instant::now(),
                    BytesMut::from(&datagram[..]),
                );
            }
            if !progress {
                return;
            }
        }
        panic!("connection did not quiesce");
    }

    /// Drop everything currently queued for the wire on the client
    fn lose_client_flight(&mut self) -> usize {
        let mut lost = 0;
        while self.client.poll_datagram().is_some() {
            lost += 1;
        }
        lost
    }

    fn read_all(&mut self, id: StreamId) -> (Vec<u8>, bool) {
        let mut data = Vec::new();
        loop {
            match self.server.read(id, usize::MAX) {
                Ok(Some(chunk)) => data.extend_from_slice(&chunk),
                Ok(None) => return (data, true),
                Err(ReadError::Blocked) => return (data, false),
                Err(e) => panic!("read failed: {e}"),
            }
        }
    }
}

fn connect() -> Pair {
    let mut pair = Pair::new(false, TransportConfig::default());
    pair.set_params(1 << 20);
    pair.drive();
    assert!(!pair.client.is_handshaking());
    assert!(!pair.server.is_handshaking());
    assert!(pair.client_events.borrow().handshake_complete);
    assert!(pair.server_events.borrow().handshake_complete);
    pair
}

//
// Scenarios
//

#[test]
fn single_short_send() {
    let _guard = subscribe();
    let mut pair = connect();
    let id = pair.client.open(Dir::Bi).unwrap();
    assert_eq!(id, StreamId::new(Side::Client, Dir::Bi, 0));
    let (consumed, fin) = pair.client.write(id, b"hello", true).unwrap();
    assert_eq!((consumed, fin), (5, true));
    pair.drive();

    let sid = pair.server.accept().unwrap();
    assert_eq!(sid, id);
    let (data, finished) = pair.read_all(sid);
    assert_eq!(data, b"hello");
    assert!(finished);

    // Close the reverse direction so the entity can die on both ends
    pair.server.finish(sid).unwrap();
    pair.drive();
    assert_eq!(pair.client.read(id, usize::MAX).unwrap(), None);
    pair.drive();

    assert!(pair.client_events.borrow().closed.contains(&id));
    assert_eq!(pair.client.stream_count(), 0);
    assert_eq!(pair.server.stream_count(), 0);
}

#[test]
fn large_write_splits_and_reassembles() {
    let _guard = subscribe();
    let mut pair = connect();
    let id = pair.client.open(Dir::Bi).unwrap();
    let payload: Vec<u8> = (0..3000u32).map(|x| x as u8).collect();
    let (consumed, fin) = pair.client.write(id, &payload, true).unwrap();
    assert_eq!((consumed, fin), (3000, true));
    pair.drive();

    let sid = pair.server.accept().unwrap();
    let (data, finished) = pair.read_all(sid);
    assert_eq!(data, payload);
    assert!(finished);
}

#[test]
fn sequential_writes_concatenate() {
    let _guard = subscribe();
    let mut pair = connect();
    let id = pair.client.open(Dir::Bi).unwrap();
    let mut expected = Vec::new();
    for chunk in [&b"one"[..], &b"two"[..], &b"three"[..]] {
        let (n, _) = pair.client.write(id, chunk, false).unwrap();
        assert_eq!(n, chunk.len());
        expected.extend_from_slice(chunk);
        pair.drive();
    }
    let (_, fin) = pair.client.write(id, &[], true).unwrap();
    assert!(fin);
    pair.drive();

    let sid = pair.server.accept().unwrap();
    let (data, finished) = pair.read_all(sid);
    assert_eq!(data, expected);
    assert!(finished);
}

#[test]
fn lost_packet_is_retransmitted() {
    let _guard = subscribe();
    let mut pair = connect();
    let id = pair.client.open(Dir::Uni).unwrap();
    pair.client.write(id, &[0xab; 100], true).unwrap();
    // The whole flight vanishes
    assert!(pair.lose_client_flight() > 0);
    assert_eq!(pair.client.stream_count(), 1);
    // The probe timer re-offers the lost frames under a fresh packet number
    pair.client.on_alarm(Timer::LossDetection);
    pair.drive();

    let sid = pair.server.accept().unwrap();
    let (data, finished) = pair.read_all(sid);
    assert_eq!(data, vec![0xab; 100]);
    assert!(finished);
    // The retransmission's ack closed the stream on the sender
    assert!(pair.client_events.borrow().closed.contains(&id));
    assert_eq!(pair.client.stream_count(), 0);
}

#[test]
fn zombie_retained_until_acked() {
    let _guard = subscribe();
    let mut pair = connect();
    let id = pair.client.open(Dir::Uni).unwrap();
    pair.client.write(id, b"parting words", true).unwrap();
    // FIN is sent but the flight is lost; the entity must survive to
    // retransmit
    pair.lose_client_flight();
    assert_eq!(pair.client.zombie_count(), 1);
    pair.client.on_alarm(Timer::LossDetection);
    pair.drive();
    assert_eq!(pair.client.zombie_count(), 0);
    assert_eq!(pair.client.stream_count(), 0);

    let sid = pair.server.accept().unwrap();
    let (data, finished) = pair.read_all(sid);
    assert_eq!(data, b"parting words");
    assert!(finished);
}

#[test]
fn peer_reset_truncates_stream() {
    let _guard = subscribe();
    let mut pair = connect();
    let id = pair.client.open(Dir::Bi).unwrap();
    pair.client.write(id, b"request", false).unwrap();
    pair.drive();
    let sid = pair.server.accept().unwrap();

    // The server commits 200 bytes, then abandons the response
    pair.server.write(sid, &[0; 200], false).unwrap();
    pair.server.reset(sid, VarInt(42));
    pair.drive();

    let resets = pair.client_events.borrow().resets.clone();
    assert_eq!(resets.len(), 1);
    assert_eq!(resets[0].id, id);
    assert_eq!(resets[0].error_code, VarInt(42));
    assert_eq!(resets[0].final_offset, VarInt(200));
    // Buffered data is discarded; the reset surfaces instead
    assert_matches!(
        pair.client.read(id, usize::MAX),
        Err(ReadError::Reset(VarInt(42)))
    );
}

#[test]
fn stop_sending_elicits_reset() {
    let _guard = subscribe();
    let mut pair = connect();
    let id = pair.client.open(Dir::Uni).unwrap();
    pair.client.write(id, &[0; 50], false).unwrap();
    pair.drive();
    let sid = pair.server.accept().unwrap();
    pair.server.stop_sending(sid, VarInt(9));
    pair.drive();

    let stops = pair.client_events.borrow().stops.clone();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].error_code, VarInt(9));
    // The requested code comes back in our RESET_STREAM
    let resets = pair.server_events.borrow().resets.clone();
    assert_eq!(resets.len(), 1);
    assert_eq!(resets[0].error_code, VarInt(9));
    // Writing after the peer stopped us fails
    assert_matches!(
        pair.client.write(id, b"more", false),
        Err(WriteError::ClosedStream)
    );
}

#[test]
fn connection_flow_control_exhaustion() {
    let _guard = subscribe();
    let mut server_config = TransportConfig::default();
    server_config.receive_window(1000);
    let mut pair = Pair::new(false, server_config);
    // The server's transport parameters only grant 1000 bytes
    pair.client.set_peer_params(1000, 1 << 20, 32, 32);
    pair.server.set_peer_params(1 << 20, 1 << 20, 32, 32);
    pair.drive();

    let id = pair.client.open(Dir::Bi).unwrap();
    let (consumed, fin) = pair.client.write(id, &[0x42; 2000], false).unwrap();
    assert_eq!(consumed, 1000);
    assert!(!fin);
    assert_matches!(
        pair.client.write(id, &[0x42; 1000], false),
        Err(WriteError::Blocked)
    );
    pair.drive();

    // Consuming the data prompts a MAX_DATA that reopens the window
    let sid = pair.server.accept().unwrap();
    let (data, _) = pair.read_all(sid);
    assert_eq!(data.len(), 1000);
    pair.drive();
    assert!(pair.client_events.borrow().writable.contains(&id));

    let (consumed, _) = pair.client.write(id, &[0x42; 1000], false).unwrap();
    assert_eq!(consumed, 1000);
    pair.drive();
    let (data, _) = pair.read_all(sid);
    assert_eq!(data.len(), 1000);
}

#[test]
fn stream_flow_control_bounds_writes() {
    let _guard = subscribe();
    let mut pair = Pair::new(false, TransportConfig::default());
    // Generous connection window, tiny per-stream window
    pair.client.set_peer_params(1 << 20, 64, 32, 32);
    pair.server.set_peer_params(1 << 20, 1 << 20, 32, 32);
    pair.drive();

    let id = pair.client.open(Dir::Bi).unwrap();
    let (consumed, _) = pair.client.write(id, &[1; 100], false).unwrap();
    assert_eq!(consumed, 64);
}

#[test]
fn coalesced_initial_and_handshake_fill_min_datagram() {
    let _guard = subscribe();
    let mut pair = Pair::new(true, TransportConfig::default());
    pair.set_params(1 << 20);
    let first = pair.client.poll_datagram().unwrap();
    assert_eq!(first.len(), 1200);

    // Two packets share the datagram: a padded initial, then handshake
    let (d1, rest) = PartialDecode::new(BytesMut::from(&first[..]), SERVER_CID.len()).unwrap();
    assert!(d1.is_initial());
    let (d2, tail) = PartialDecode::new(rest.unwrap(), SERVER_CID.len()).unwrap();
    assert_eq!(d2.level(), EncryptionLevel::Handshake);
    assert!(tail.is_none());

    // The flight is still a valid opening; the handshake completes off it
    pair.server
        .process_udp_packet(addr(), addr(), Instant::now(), BytesMut::from(&first[..]));
    pair.drive();
    assert!(!pair.server.is_handshaking());
    assert!(!pair.client.is_handshaking());
}

#[test]
fn close_is_idempotent() {
    let _guard = subscribe();
    let mut pair = connect();
    pair.client.close(VarInt(0), Bytes::from_static(b"bye"));
    assert_eq!(pair.client_events.borrow().conn_closed.len(), 1);
    assert_eq!(pair.client_events.borrow().conn_closed[0], CloseSource::Local);
    pair.drive();
    assert_eq!(pair.server_events.borrow().conn_closed.len(), 1);
    assert_eq!(pair.server_events.borrow().conn_closed[0], CloseSource::Remote);

    // A second close emits nothing further
    pair.client.close(VarInt(1), Bytes::from_static(b"again"));
    assert_eq!(pair.client_events.borrow().conn_closed.len(), 1);
    assert!(pair.client.poll_datagram().is_none());
}

#[test]
fn higher_priority_streams_sent_first() {
    let _guard = subscribe();
    let mut pair = Pair::new(false, TransportConfig::default());
    pair.set_params(1 << 20);
    // Queue data on two streams while 1-RTT keys are still missing, so both
    // are pending when the scheduler first runs
    let low = pair.client.open(Dir::Bi).unwrap();
    let high = pair.client.open(Dir::Bi).unwrap();
    pair.client.set_priority(high, 7);
    pair.client.write(low, b"low priority", false).unwrap();
    pair.client.write(high, b"high priority", false).unwrap();
    pair.drive();

    let readable = pair.server_events.borrow().readable.clone();
    let first_high = readable.iter().position(|x| *x == high).unwrap();
    let first_low = readable.iter().position(|x| *x == low).unwrap();
    assert!(first_high < first_low);
}

#[test]
fn goaway_stops_new_streams() {
    let _guard = subscribe();
    let mut pair = connect();
    assert!(pair.client.open(Dir::Bi).is_some());
    pair.client.goaway();
    assert!(pair.client.open(Dir::Bi).is_none());
}

#[test]
fn datagrams_round_trip() {
    let _guard = subscribe();
    let mut pair = connect();
    assert!(pair.client.send_datagram(Bytes::from_static(b"fire and forget")));
    pair.drive();
    assert_eq!(pair.server_events.borrow().datagrams, 1);
    assert_eq!(
        pair.server.recv_datagram().unwrap(),
        Bytes::from_static(b"fire and forget")
    );
    // Oversized datagrams are refused outright
    assert!(!pair.client.send_datagram(Bytes::from(vec![0; 4096])));
}

#[test]
fn stream_limit_violation_closes_connection() {
    let _guard = subscribe();
    let mut pair = Pair::new(false, TransportConfig::default());
    pair.client.set_peer_params(1 << 20, 1 << 20, 1 << 10, 1 << 10);
    pair.server.set_peer_params(1 << 20, 1 << 20, 32, 32);
    pair.drive();

    // The server advertised the default limit; the client believes a much
    // larger one and opens past it
    let mut id = None;
    for _ in 0..101 {
        id = pair.client.open(Dir::Bi);
    }
    let id = id.unwrap();
    pair.client.write(id, b"x", false).unwrap();
    pair.drive();
    assert_eq!(pair.server_events.borrow().conn_closed.len(), 1);
    assert!(pair.server.is_closed());
}

#[test]
fn unknown_local_stream_reference_closes_connection() {
    let _guard = subscribe();
    let mut pair = connect();

    // Forge a 1-RTT packet claiming window credit for a server-initiated
    // stream the server never opened
    let mut forger = PacketCreator::new(
        Side::Client,
        ConnectionId::new(&SERVER_CID),
        ConnectionId::new(&[]),
        1200,
    );
    let keys = null::keys(TAG_LEN);
    forger.install_keys(EncryptionLevel::OneRtt, keys.header.local, keys.packet.local);
    forger.set_encryption_level(EncryptionLevel::OneRtt);
    forger.skip_packet_numbers(64, 0, 0);
    #[derive(Default)]
    struct Capture(Vec<SerializedPacket>);
    impl PacketSink for Capture {
        fn on_serialized_packet(&mut self, packet: SerializedPacket) {
            self.0.push(packet);
        }
        fn on_unrecoverable_error(&mut self, _: TransportErrorCode, reason: &'static str) {
            panic!("{reason}");
        }
    }
    let mut capture = Capture::default();
    forger.add_frame(
        Frame::MaxStreamData {
            id: StreamId::new(Side::Server, Dir::Bi, 5),
            offset: 1 << 16,
        },
        TransmissionType::NotRetransmission,
    );
    forger.flush(&mut capture);
    let packet = capture.0.pop().unwrap();

    pair.server.process_udp_packet(
        addr(),
        addr(),
        Instant::now(),
        BytesMut::from(&packet.buffer[..]),
    );
    assert!(pair.server.is_closed());
    assert_eq!(pair.server_events.borrow().conn_closed.len(), 1);
    // The resulting CONNECTION_CLOSE reaches the client exactly once
    pair.drive();
    assert_eq!(pair.client_events.borrow().conn_closed.len(), 1);
    assert_eq!(
        pair.client_events.borrow().conn_closed[0],
        CloseSource::Remote
    );
}

#[test]
fn implicit_stream_open_in_order() {
    let _guard = subscribe();
    let mut pair = connect();
    // Opening several and writing on the last one first still surfaces all
    let ids: Vec<_> = (0..3).map(|_| pair.client.open(Dir::Uni).unwrap()).collect();
    pair.client.write(ids[2], b"third", true).unwrap();
    pair.drive();
    let opened = pair.server_events.borrow().opened.clone();
    assert!(opened.contains(&ids[2]));
    // Lower ids exist implicitly and become live on their first frame
    pair.client.write(ids[0], b"first", true).unwrap();
    pair.drive();
    let opened = pair.server_events.borrow().opened.clone();
    assert!(opened.contains(&ids[0]));
}
