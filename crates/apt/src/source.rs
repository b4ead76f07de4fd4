//! Byte blob, unparsed-range tracking and the cursor reader
//!
//! The decoder keeps a sorted, disjoint set of byte ranges that no read has
//! claimed yet. Every read performed through a [`Reader`] marks its span as
//! parsed, so whatever remains after decoding is exactly the file's
//! unrecognized bytes (a nonzero prefix is the file header, everything else
//! must be zero).

use crate::{Error, Result};
use byteorder::{ByteOrder, LE};
use memchr::memchr;
use std::cell::RefCell;
use std::collections::BTreeMap;

use crate::value::Address;

/// The input blob plus the disjoint set of not-yet-parsed ranges,
/// keyed by begin offset.
#[derive(Debug)]
pub struct DataSource {
    data: Vec<u8>,
    unparsed: RefCell<BTreeMap<Address, Address>>,
}

impl DataSource {
    pub fn new(data: Vec<u8>) -> Self {
        let mut unparsed = BTreeMap::new();
        if !data.is_empty() {
            unparsed.insert(0, data.len() as Address);
        }
        Self {
            data,
            unparsed: RefCell::new(unparsed),
        }
    }

    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// A reader over the whole blob.
    pub fn view(&self) -> Reader<'_> {
        Reader {
            source: self,
            pos: 0,
            end: self.len(),
        }
    }

    /// A reader starting at `offset`.
    pub fn reader_at(&self, offset: Address) -> Result<Reader<'_>> {
        self.view().sub_view(offset)
    }

    /// Remove `[begin, end)` from the unparsed set, splitting any ranges
    /// that extend past it. Requests for an empty range fail.
    pub fn mark_parsed(&self, begin: Address, end: Address) -> Result<()> {
        if begin >= end {
            return Err(Error::EmptyParseRange { begin, end });
        }

        let mut unparsed = self.unparsed.borrow_mut();
        let start_key = unparsed
            .range(..=begin)
            .next_back()
            .map(|(&b, _)| b)
            .unwrap_or(0);
        let overlapping: Vec<(Address, Address)> = unparsed
            .range(start_key..end)
            .filter(|&(&b, &e)| e > begin && b < end)
            .map(|(&b, &e)| (b, e))
            .collect();

        for (b, e) in overlapping {
            unparsed.remove(&b);
            if b < begin {
                unparsed.insert(b, begin);
            }
            if end < e {
                unparsed.insert(end, e);
            }
        }
        Ok(())
    }

    /// Snapshot of the remaining unparsed ranges, in address order.
    pub fn unparsed_ranges(&self) -> Vec<(Address, Address)> {
        self.unparsed.borrow().iter().map(|(&b, &e)| (b, e)).collect()
    }
}

/// Cursor view over a [`DataSource`]. Reads advance the view and, as a
/// deliberate side effect, mark the consumed span as parsed on the owning
/// source. Copying a reader snapshots the cursor, which is how the
/// constructor rewinds for derived-type dispatch.
#[derive(Debug, Clone, Copy)]
pub struct Reader<'a> {
    source: &'a DataSource,
    pos: Address,
    end: Address,
}

impl<'a> Reader<'a> {
    /// Absolute offset of the view start into the blob.
    pub fn absolute_position(&self) -> Address {
        self.pos
    }

    pub fn remaining(&self) -> u32 {
        self.end - self.pos
    }

    /// A new reader starting `from` bytes into this view. Does not advance
    /// or mark anything.
    pub fn sub_view(&self, from: u32) -> Result<Reader<'a>> {
        if from > self.remaining() {
            return Err(Error::Truncated {
                offset: self.pos,
                needed: from,
                available: self.remaining(),
            });
        }
        Ok(Reader {
            source: self.source,
            pos: self.pos + from,
            end: self.end,
        })
    }

    /// The first `n` bytes of the view; advances past them and marks them
    /// parsed.
    pub fn read_front(&mut self, n: u32) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(Error::Truncated {
                offset: self.pos,
                needed: n,
                available: self.remaining(),
            });
        }
        let begin = self.pos;
        let end = begin + n;
        let bytes = &self.source.data[begin as usize..end as usize];
        if n > 0 {
            self.source.mark_parsed(begin, end)?;
        }
        self.pos = end;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_front(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(LE::read_u16(self.read_front(2)?))
    }

    /// Three-byte little-endian unsigned value.
    pub fn read_u24(&mut self) -> Result<u32> {
        Ok(LE::read_u24(self.read_front(3)?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(LE::read_u32(self.read_front(4)?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(LE::read_i32(self.read_front(4)?))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(LE::read_f32(self.read_front(4)?))
    }

    /// Null-terminated string; consumes the terminator as well.
    pub fn read_string(&mut self) -> Result<String> {
        let view = &self.source.data[self.pos as usize..self.end as usize];
        let nul = memchr(0, view).ok_or(Error::UnterminatedString { offset: self.pos })? as u32;
        let bytes = self.read_front(nul + 1)?;
        Ok(String::from_utf8_lossy(&bytes[..nul as usize]).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_parsed_splits_ranges() {
        let source = DataSource::new(vec![0u8; 10]);
        assert_eq!(source.unparsed_ranges(), vec![(0, 10)]);

        source.mark_parsed(2, 5).unwrap();
        assert_eq!(source.unparsed_ranges(), vec![(0, 2), (5, 10)]);

        source.mark_parsed(0, 2).unwrap();
        source.mark_parsed(7, 10).unwrap();
        assert_eq!(source.unparsed_ranges(), vec![(5, 7)]);
    }

    #[test]
    fn test_mark_parsed_rejects_empty_range() {
        let source = DataSource::new(vec![0u8; 10]);
        assert!(matches!(
            source.mark_parsed(5, 5),
            Err(Error::EmptyParseRange { begin: 5, end: 5 })
        ));
        assert!(source.mark_parsed(6, 5).is_err());
    }

    #[test]
    fn test_mark_parsed_is_idempotent() {
        let source = DataSource::new(vec![0u8; 10]);
        source.mark_parsed(2, 5).unwrap();
        source.mark_parsed(2, 5).unwrap();
        source.mark_parsed(3, 4).unwrap();
        assert_eq!(source.unparsed_ranges(), vec![(0, 2), (5, 10)]);
    }

    #[test]
    fn test_mark_parsed_across_ranges() {
        let source = DataSource::new(vec![0u8; 20]);
        source.mark_parsed(5, 8).unwrap();
        // spans the hole and both neighbours
        source.mark_parsed(3, 10).unwrap();
        assert_eq!(source.unparsed_ranges(), vec![(0, 3), (10, 20)]);
    }

    #[test]
    fn test_reader_reads_and_marks() {
        let source = DataSource::new(vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let mut reader = source.view();
        assert_eq!(reader.read_u8().unwrap(), 1);
        assert_eq!(reader.read_u16().unwrap(), 0x0302);
        assert_eq!(reader.absolute_position(), 3);
        assert_eq!(reader.read_u32().unwrap(), 0x07060504);
        assert_eq!(source.unparsed_ranges(), vec![(7, 8)]);
    }

    #[test]
    fn test_reader_u24() {
        let source = DataSource::new(vec![0x2A, 0x00, 0x01]);
        let mut reader = source.view();
        assert_eq!(reader.read_u24().unwrap(), 0x01002A);
    }

    #[test]
    fn test_reader_out_of_view() {
        let source = DataSource::new(vec![1, 2]);
        let mut reader = source.view();
        assert!(matches!(
            reader.read_u32(),
            Err(Error::Truncated {
                offset: 0,
                needed: 4,
                available: 2,
            })
        ));
        assert!(source.view().sub_view(3).is_err());
    }

    #[test]
    fn test_sub_view_does_not_mark() {
        let source = DataSource::new(vec![0u8; 8]);
        let reader = source.view().sub_view(4).unwrap();
        assert_eq!(reader.absolute_position(), 4);
        assert_eq!(source.unparsed_ranges(), vec![(0, 8)]);
    }

    #[test]
    fn test_read_string() {
        let source = DataSource::new(b"hi\0rest".to_vec());
        let mut reader = source.view();
        assert_eq!(reader.read_string().unwrap(), "hi");
        assert_eq!(reader.absolute_position(), 3);

        let empty = DataSource::new(b"\0".to_vec());
        assert_eq!(empty.view().read_string().unwrap(), "");

        let unterminated = DataSource::new(b"abc".to_vec());
        assert!(matches!(
            unterminated.view().read_string(),
            Err(Error::UnterminatedString { offset: 0 })
        ));
    }
}
