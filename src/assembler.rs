use std::collections::BTreeMap;

use bytes::Bytes;

use crate::range_set::RangeSet;

/// Reassembles out-of-order stream data into the byte sequence the
/// application may consume
///
/// Everything in `[bytes_read, watermark)` is contiguous and deliverable;
/// later ranges are buffered until the gaps before them fill.
#[derive(Debug, Default)]
pub struct Assembler {
    /// Offsets that have been received, contiguous or not
    received: RangeSet,
    /// Buffered data, keyed by offset, non-overlapping
    chunks: BTreeMap<u64, Bytes>,
    /// End of the contiguous prefix
    watermark: u64,
    /// Bytes handed to the application
    read: u64,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a received range, ignoring previously received bytes
    ///
    /// Returns whether any new data became readable.
    pub fn insert(&mut self, mut offset: u64, mut data: Bytes) -> bool {
        // Trim against everything already received; duplicates and
        // overlapped re-deliveries are common after loss.
        while !data.is_empty() {
            let end = offset + data.len() as u64;
            let gap = self.received.gaps(offset..end).next();
            let Some(gap) = gap else { break };
            let chunk = data.slice((gap.start - offset) as usize..(gap.end - offset) as usize);
            self.received.insert(gap.clone());
            self.chunks.insert(gap.start, chunk);
            let consumed = (gap.end - offset) as usize;
            if consumed >= data.len() {
                break;
            }
            data = data.slice(consumed..);
            offset = gap.end;
        }
        self.advance()
    }

    fn advance(&mut self) -> bool {
        let old = self.watermark;
        self.watermark = match self.received.iter().next() {
            Some(range) if range.start == 0 => range.end,
            _ => 0,
        };
        self.watermark > old
    }

    /// Pop the next contiguous chunk, at most `max_len` bytes
    pub fn read(&mut self, max_len: usize) -> Option<Bytes> {
        if self.read >= self.watermark {
            return None;
        }
        let (&offset, chunk) = self.chunks.iter().next()?;
        debug_assert_eq!(offset, self.read, "gap below watermark");
        let chunk = if chunk.len() > max_len {
            let mut rest = self.chunks.remove(&offset).unwrap();
            let head = rest.split_to(max_len);
            self.chunks.insert(offset + max_len as u64, rest);
            head
        } else {
            self.chunks.remove(&offset).unwrap()
        };
        self.read += chunk.len() as u64;
        Some(chunk)
    }

    /// End of the contiguous readable prefix
    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    /// Bytes delivered to the application so far
    pub fn bytes_read(&self) -> u64 {
        self.read
    }

    /// Discard buffered data, e.g. on reset; received accounting is retained
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.read = self.watermark;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn next(x: &mut Assembler, size: usize) -> Option<Box<[u8]>> {
        let mut out = Vec::new();
        while out.len() < size {
            match x.read(size - out.len()) {
                Some(chunk) => out.extend_from_slice(&chunk),
                None => break,
            }
        }
        if out.is_empty() {
            None
        } else {
            Some(out.into())
        }
    }

    #[test]
    fn assemble_ordered() {
        let mut x = Assembler::new();
        assert_matches!(next(&mut x, 32), None);
        x.insert(0, Bytes::from_static(b"123"));
        assert_matches!(next(&mut x, 1), Some(ref y) if &y[..] == b"1");
        assert_matches!(next(&mut x, 3), Some(ref y) if &y[..] == b"23");
        x.insert(3, Bytes::from_static(b"456"));
        assert_matches!(next(&mut x, 32), Some(ref y) if &y[..] == b"456");
        x.insert(6, Bytes::from_static(b"789"));
        x.insert(9, Bytes::from_static(b"10"));
        assert_matches!(next(&mut x, 32), Some(ref y) if &y[..] == b"78910");
        assert_matches!(next(&mut x, 32), None);
    }

    #[test]
    fn assemble_unordered() {
        let mut x = Assembler::new();
        assert!(!x.insert(3, Bytes::from_static(b"456")));
        assert_matches!(next(&mut x, 32), None);
        assert!(x.insert(0, Bytes::from_static(b"123")));
        assert_matches!(next(&mut x, 32), Some(ref y) if &y[..] == b"123456");
        assert_matches!(next(&mut x, 32), None);
    }

    #[test]
    fn assemble_duplicate() {
        let mut x = Assembler::new();
        x.insert(0, Bytes::from_static(b"123"));
        x.insert(0, Bytes::from_static(b"123"));
        assert_matches!(next(&mut x, 32), Some(ref y) if &y[..] == b"123");
        assert_matches!(next(&mut x, 32), None);
    }

    #[test]
    fn assemble_contained() {
        let mut x = Assembler::new();
        x.insert(0, Bytes::from_static(b"12345"));
        x.insert(1, Bytes::from_static(b"234"));
        assert_matches!(next(&mut x, 32), Some(ref y) if &y[..] == b"12345");
        assert_matches!(next(&mut x, 32), None);
    }

    #[test]
    fn assemble_overlapping() {
        let mut x = Assembler::new();
        x.insert(0, Bytes::from_static(b"123"));
        x.insert(1, Bytes::from_static(b"234"));
        assert_matches!(next(&mut x, 32), Some(ref y) if &y[..] == b"1234");
        assert_matches!(next(&mut x, 32), None);
    }

    #[test]
    fn assemble_complex() {
        let mut x = Assembler::new();
        x.insert(0, Bytes::from_static(b"1"));
        x.insert(2, Bytes::from_static(b"3"));
        x.insert(4, Bytes::from_static(b"5"));
        x.insert(0, Bytes::from_static(b"123456"));
        assert_matches!(next(&mut x, 32), Some(ref y) if &y[..] == b"123456");
        assert_matches!(next(&mut x, 32), None);
    }

    #[test]
    fn assemble_old() {
        let mut x = Assembler::new();
        x.insert(0, Bytes::from_static(b"1234"));
        assert_matches!(next(&mut x, 32), Some(ref y) if &y[..] == b"1234");
        assert!(!x.insert(0, Bytes::from_static(b"1234")));
        assert_matches!(next(&mut x, 32), None);
    }

    #[test]
    fn watermark_tracks_contiguity() {
        let mut x = Assembler::new();
        x.insert(5, Bytes::from_static(b"67"));
        assert_eq!(x.watermark(), 0);
        x.insert(0, Bytes::from_static(b"12345"));
        assert_eq!(x.watermark(), 7);
    }
}
