use crate::varint::VarInt;

/// Parameters governing a connection's transport-level behavior
///
/// A configuration record threaded through construction; the core holds no
/// process-wide mutable state.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum number of concurrent bidirectional streams the peer may open
    pub(crate) max_concurrent_bidi_streams: u64,
    /// Maximum number of concurrent unidirectional streams the peer may open
    pub(crate) max_concurrent_uni_streams: u64,
    /// Connection-level receive window
    pub(crate) receive_window: u64,
    /// Per-stream receive window
    pub(crate) stream_receive_window: u64,
    /// Hard limit on outgoing UDP payload size
    pub(crate) max_packet_size: usize,
    /// Largest DATAGRAM frame payload accepted from the peer, if any
    pub(crate) datagram_receive_buffer_size: Option<usize>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        const EXPECTED_RTT: u64 = 100; // ms
        const MAX_STREAM_BANDWIDTH: u64 = 12500 * 1000; // bytes/s
        // Window size needed to avoid pipeline stalls
        const STREAM_RWND: u64 = MAX_STREAM_BANDWIDTH / 1000 * EXPECTED_RTT;
        Self {
            max_concurrent_bidi_streams: 100,
            max_concurrent_uni_streams: 100,
            receive_window: VarInt::MAX.into_inner(),
            stream_receive_window: STREAM_RWND,
            max_packet_size: 1200,
            datagram_receive_buffer_size: Some(STREAM_RWND as usize),
        }
    }
}

impl TransportConfig {
    pub fn max_concurrent_bidi_streams(&mut self, value: u64) -> &mut Self {
        self.max_concurrent_bidi_streams = value;
        self
    }

    pub fn max_concurrent_uni_streams(&mut self, value: u64) -> &mut Self {
        self.max_concurrent_uni_streams = value;
        self
    }

    pub fn receive_window(&mut self, value: u64) -> &mut Self {
        self.receive_window = value;
        self
    }

    pub fn stream_receive_window(&mut self, value: u64) -> &mut Self {
        self.stream_receive_window = value;
        self
    }

    /// Set the hard limit on outgoing UDP payload size
    ///
    /// Values below 1200 violate the protocol's minimum and are clamped.
    pub fn max_packet_size(&mut self, value: usize) -> &mut Self {
        self.max_packet_size = value.max(crate::MIN_INITIAL_SIZE);
        self
    }

    pub fn datagram_receive_buffer_size(&mut self, value: Option<usize>) -> &mut Self {
        self.datagram_receive_buffer_size = value;
        self
    }
}
