use std::fmt;

use bytes::{Buf, BufMut};

use crate::coding::{self, BufExt, UnexpectedEnd};
use crate::MAX_CID_SIZE;

/// Protocol-level identifier for a connection
///
/// An opaque byte string of 0–20 bytes chosen by the endpoint that will route
/// on it; compared by value. Mainly useful for routing decisions made outside
/// this crate.
#[derive(Default, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    /// Construct a connection ID from a byte slice
    ///
    /// # Panics
    /// When `bytes.len() > 20`.
    pub fn new(bytes: &[u8]) -> Self {
        assert!(bytes.len() <= MAX_CID_SIZE);
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    pub(crate) fn decode_prefixed<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        let len = buf.get::<u8>()? as usize;
        if len > MAX_CID_SIZE || buf.remaining() < len {
            return Err(UnexpectedEnd);
        }
        let mut bytes = [0; MAX_CID_SIZE];
        buf.copy_to_slice(&mut bytes[..len]);
        Ok(Self {
            len: len as u8,
            bytes,
        })
    }

    pub(crate) fn encode_prefixed<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.len);
        buf.put_slice(self);
    }
}

impl ::std::ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[0..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.bytes[0..self.len as usize].fmt(f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_roundtrip() {
        let cid = ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut buf = Vec::new();
        cid.encode_prefixed(&mut buf);
        assert_eq!(buf.len(), 9);
        let mut r = std::io::Cursor::new(&buf);
        assert_eq!(ConnectionId::decode_prefixed(&mut r).unwrap(), cid);
    }

    #[test]
    fn zero_length() {
        let cid = ConnectionId::new(&[]);
        assert!(cid.is_empty());
        let mut buf = Vec::new();
        cid.encode_prefixed(&mut buf);
        assert_eq!(buf, [0]);
    }
}
