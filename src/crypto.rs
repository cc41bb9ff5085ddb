//! Trait seams for the cryptographic collaborators of the core
//!
//! The session and packet creator are generic over the actual AEAD, header
//! protection, and handshake implementations; hosts supply them through the
//! traits here. The [`null`] module provides non-protecting implementations
//! with realistic framing overhead, used by the test suite and useful for
//! loopback benchmarking.

use bytes::BytesMut;

use crate::packet::EncryptionLevel;
use crate::transport_error::Error as TransportError;

/// Keys used to protect packet payloads
pub trait PacketKey: Send {
    /// Encrypt the packet payload in place, appending the AEAD tag
    ///
    /// `buf` covers the full packet including `tag_len` bytes of tag space at
    /// the end; `header_len` bytes of it are associated data.
    fn encrypt(&self, packet: u64, buf: &mut [u8], header_len: usize);
    /// Decrypt the payload in place, verifying and stripping the tag
    fn decrypt(
        &self,
        packet: u64,
        header: &[u8],
        payload: &mut BytesMut,
    ) -> Result<(), CryptoError>;
    /// The length of the AEAD tag appended to packets on encryption
    fn tag_len(&self) -> usize;
}

/// Keys used to protect packet headers
pub trait HeaderKey: Send {
    /// Decrypt the given packet's header: first byte low bits and packet number bytes
    fn decrypt(&self, pn_offset: usize, packet: &mut [u8]);
    /// Encrypt the given packet's header
    fn encrypt(&self, pn_offset: usize, packet: &mut [u8]);
    /// The number of ciphertext bytes sampled to derive the protection mask
    fn sample_size(&self) -> usize;
}

/// A pair of keys for bidirectional communication
pub struct KeyPair<T> {
    /// Protects outgoing data
    pub local: T,
    /// Unprotects incoming data
    pub remote: T,
}

/// A complete set of keys for a certain encryption level
pub struct Keys {
    /// Header protection keys
    pub header: KeyPair<Box<dyn HeaderKey>>,
    /// Packet protection keys
    pub packet: KeyPair<Box<dyn PacketKey>>,
}

/// The cryptographic handshake driven over CRYPTO frames
///
/// Implementations wrap a TLS 1.3 stack (or a stand-in for testing). The
/// session feeds it reassembled handshake bytes and drains its output into
/// CRYPTO frames at the current level; whenever it yields keys the session
/// installs them and advances the connection's encryption level.
pub trait HandshakeSession: Send {
    /// Returns `true` until the handshake completes
    fn is_handshaking(&self) -> bool;

    /// Process handshake bytes received at `level`, in stream order
    fn read_handshake(&mut self, level: EncryptionLevel, data: &[u8])
        -> Result<(), TransportError>;

    /// Write pending handshake bytes for the current send level into `buf`
    ///
    /// Returns keys for the next level when the handshake is ready to advance;
    /// the caller must install them before calling again.
    fn write_handshake(&mut self, buf: &mut Vec<u8>) -> Option<Keys>;

    /// 0-RTT keys, if the implementation has early material (clients only)
    fn early_keys(&mut self) -> Option<Keys> {
        None
    }
}

/// Packet could not be authenticated
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CryptoError;

/// Non-protecting keys with realistic wire overhead
pub mod null {
    use super::*;

    /// Construct a key set whose AEAD appends a zeroed tag of `tag_len` bytes
    pub fn keys(tag_len: usize) -> Keys {
        Keys {
            header: KeyPair {
                local: Box::new(NullHeaderKey),
                remote: Box::new(NullHeaderKey),
            },
            packet: KeyPair {
                local: Box::new(NullPacketKey { tag_len }),
                remote: Box::new(NullPacketKey { tag_len }),
            },
        }
    }

    struct NullHeaderKey;

    impl HeaderKey for NullHeaderKey {
        fn decrypt(&self, _pn_offset: usize, _packet: &mut [u8]) {}
        fn encrypt(&self, _pn_offset: usize, _packet: &mut [u8]) {}
        fn sample_size(&self) -> usize {
            16
        }
    }

    struct NullPacketKey {
        tag_len: usize,
    }

    impl PacketKey for NullPacketKey {
        fn encrypt(&self, _packet: u64, buf: &mut [u8], _header_len: usize) {
            let tag_start = buf.len() - self.tag_len;
            for byte in &mut buf[tag_start..] {
                *byte = 0;
            }
        }

        fn decrypt(
            &self,
            _packet: u64,
            _header: &[u8],
            payload: &mut BytesMut,
        ) -> Result<(), CryptoError> {
            if payload.len() < self.tag_len {
                return Err(CryptoError);
            }
            let plain_len = payload.len() - self.tag_len;
            payload.truncate(plain_len);
            Ok(())
        }

        fn tag_len(&self) -> usize {
            self.tag_len
        }
    }
}
