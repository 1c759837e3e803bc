//! Module containing the basic types used throughout the store.
//! The block and record layers build their own stateful wrappers around these types; this module only holds the parts that define the on-disk format.

use super::error;
use super::error::ApiError;
use lazy_static::lazy_static;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::prelude::*;
use std::io::{Cursor, SeekFrom};

/// Buffer abstraction, representing some data on the heap.
/// Buffers are used to hold the sector-sized header area of a block, and as scratch space when moving payload bytes around.
/// Support regular read and write methods, but also (de)serialization of values implementing the appropriate traits.
#[derive(Debug, PartialEq, Eq)]
pub struct Buffer {
    ///Contents of the buffer, represented as a boxed slice
    /// The reason for this choice of data structure is that buffers never change size while in use.
    contents: Box<[u8]>,
}

impl Buffer {
    /// Create a new buffer, having the given `data` slice as its data
    pub fn new(data: Box<[u8]>) -> Buffer {
        Buffer { contents: data }
    }

    /// Create an all-zero buffer, with contents length of `len`
    pub fn new_zero(len: u64) -> Buffer {
        Buffer {
            contents: vec![0; len as usize].into_boxed_slice(),
        }
    }

    /// Size of the underlying data
    pub fn len(&self) -> u64 {
        self.contents.len() as u64
    }

    /// Is this a zero-sized buffer?
    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    /// Return a reference to this buffer's contents
    pub fn contents_as_ref(&self) -> &[u8] {
        return &self.contents;
    }

    /// Reads data from this buffer into the `data` slice, starting at the given `offset`.
    /// If the function does not return an error, the number of bytes read is always equal to `data.len()`.
    pub fn read_data(&self, data: &mut [u8], offset: u64) -> error::Result<()> {
        if offset + data.len() as u64 > self.len() {
            return Err(ApiError::BufferInput(
                "Trying to read beyond the bounds of the buffer",
            ));
        }

        let mut c = Cursor::new(&self.contents);
        c.seek(SeekFrom::Start(offset))?;
        c.read_exact(data).map_err(|e| e.into())
    }

    /// Writes the given slice into this buffer, starting at the given `offset`.
    /// If the function does not return an error, the number of bytes written is always equal to `data.len()`.
    pub fn write_data(&mut self, data: &[u8], offset: u64) -> error::Result<()> {
        if offset + data.len() as u64 > self.len() {
            return Err(ApiError::BufferInput(
                "Trying to write beyond the bounds of the buffer",
            ));
        }

        let mut c = Cursor::new(&mut self.contents[..]);
        c.seek(SeekFrom::Start(offset))?;
        c.write_all(data).map_err(|e| e.into())
    }

    /// Read any value that implements the `DeserializeOwned` trait from this buffer, starting at the given `offset`.
    /// The encoding is bincode's fixed-width little-endian format, so an `i64` occupies exactly [`HEADER_FIELD_SIZE`](constant.HEADER_FIELD_SIZE.html) bytes and a `u32` exactly [`FREE_ENTRY_SIZE`](constant.FREE_ENTRY_SIZE.html) bytes.
    pub fn deserialize_from<S>(&self, offset: u64) -> error::Result<S>
    where
        S: DeserializeOwned,
    {
        let mut c = Cursor::new(&self.contents);
        c.seek(SeekFrom::Start(offset))?;
        Ok((bincode::deserialize_from(c))?)
    }

    /// Write any value that implements the `Serialize` trait into this buffer at the given `offset`.
    /// Goes through `write_data` so that the appropriate error gets triggered when the encoded value does not fit, instead of silently extending the buffer.
    pub fn serialize_into<S>(&mut self, stru: &S, offset: u64) -> error::Result<()>
    where
        S: Serialize,
    {
        let stru_bin = bincode::serialize(stru)?;
        //Going through write data so that the appropriate errors get triggered
        self.write_data(&stru_bin, offset)
    }
}

/// Structure describing the shape of a store: how large each block is, and
/// how many of those bytes are reserved for the header area.
/// All other layout values are derived from these two.
/// Derives `Serialize` and `Deserialize` so that embedders can persist the
/// shape of a store in their own configuration alongside the image file.
///
/// Each block occupies exactly `[id * block_size, (id + 1) * block_size)` of
/// the backing stream, and is laid out as follows:
///
/// 1. *header area*: bytes `[0, header_size)`, an array of `header_size / 8`
///    little-endian `i64` fields. The first [`RESERVED_FIELDS`](constant.RESERVED_FIELDS.html)
///    fields have fixed meaning (see the `*_FIELD` constants); the rest are
///    free for embedders.
/// 2. *content area*: bytes `[header_size, block_size)`, opaque payload.
///
/// The *sector* is the I/O unit used for write-behind of the header area: a
/// block's header and leading content bytes are buffered in memory as one
/// sector and written back in a single aligned write when the block is
/// released.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    ///Size of the blocks the stream is partitioned into, in *BYTES*
    pub block_size: u64,
    ///Number of bytes at the start of each block reserved for header fields\
    ///Must be a multiple of 8, and no larger than the sector size
    pub header_size: u64,
}

impl Default for Geometry {
    /// The default shape: 40 KiB blocks with six header fields
    fn default() -> Geometry {
        Geometry {
            block_size: 40_960,
            header_size: 48,
        }
    }
}

impl Geometry {
    /// Create a new geometry from its two defining sizes
    pub fn new(block_size: u64, header_size: u64) -> Geometry {
        Geometry {
            block_size,
            header_size,
        }
    }

    /// Number of payload bytes each block can hold
    pub fn content_size(&self) -> u64 {
        self.block_size - self.header_size
    }

    /// Size of the I/O unit used for header write-behind.
    /// Chosen to match common disk sector alignment: 4096 bytes when blocks
    /// are large enough, 128 bytes for toy-sized blocks.
    pub fn sector_size(&self) -> u64 {
        if self.block_size >= 4096 {
            4096
        } else {
            128
        }
    }

    /// Number of `i64` header fields each block carries
    pub fn header_fields(&self) -> u64 {
        self.header_size / *HEADER_FIELD_SIZE
    }
}

/// Header field holding the id of the next block in a chain; 0 means this is the final block
pub const NEXT_FIELD: u64 = 0;
/// Header field holding the total payload length of a record, in bytes; only meaningful on the head block of a chain
pub const RECORD_LEN_FIELD: u64 = 1;
/// Header field holding the number of valid payload bytes stored in this block's content area
pub const CONTENT_LEN_FIELD: u64 = 2;
/// Header field holding the id of the previous block in a chain; 0 means this is a head block
pub const PREV_FIELD: u64 = 3;
/// Header field holding the deletion marker: 0 for a live block, 1 for a freed one
pub const DELETED_FIELD: u64 = 4;
/// Number of header fields with a reserved meaning
pub const RESERVED_FIELDS: u64 = 5;

/// Maximum total payload length of a single record, in bytes (4 MiB)
pub const MAX_RECORD_SIZE: u64 = 4_194_304;

/// Record id of the sentinel record whose content stores the free-block queue.
/// This record always exists in a non-empty store, and is created lazily by
/// the first operation that needs the queue.
pub const FREE_LIST_RECORD: u32 = 0;

lazy_static! {
    /// Encoded size of a single header field, in bytes.
    /// Computed by encoding a field value at runtime, so that the constants
    /// used for offset arithmetic can never drift from the actual encoding.
    pub static ref HEADER_FIELD_SIZE: u64 = bincode::serialize(&0i64).unwrap().len() as u64;
    /// Encoded size of a single free-list entry (a block id), in bytes.
    /// For similar reasons, again computed at runtime.
    pub static ref FREE_ENTRY_SIZE: u64 = bincode::serialize(&0u32).unwrap().len() as u64;
}

///Tests for the buffer and geometry types
#[cfg(test)]
mod tests {

    use super::{Buffer, Geometry, FREE_ENTRY_SIZE, HEADER_FIELD_SIZE};

    // For these tests, we use buffers of 100 bytes; large enough to hold a handful of header fields
    static BUF_SIZE: u64 = 100;

    //Testing the raw read/write methods offered by buffers
    #[test]
    fn raw_rw_test() {
        let mut b1 = Buffer::new_zero(BUF_SIZE);
        //Contents have been installed correctly
        assert_eq!(b1.contents_as_ref(), vec![0; BUF_SIZE as usize]);

        //Write and then reread some raw data
        let mut raw_data = vec![5; 5];
        b1.write_data(&raw_data, 10).unwrap();
        b1.read_data(&mut raw_data, 8).unwrap();
        assert_eq!(raw_data, vec!(0, 0, 5, 5, 5));

        //Try to read or write out of bounds
        //Trivial out of bounds
        let mut emp = vec![];
        assert!(b1.write_data(&emp, BUF_SIZE).is_ok()); //double check
        assert!(b1.write_data(&emp, BUF_SIZE + 1).is_err());
        assert!(b1.read_data(&mut emp, BUF_SIZE + 1).is_err());
        //Read or write out of bounds because of buffer size
        let mut one = vec![1];
        assert!(b1.write_data(&one, BUF_SIZE).is_err());
        assert!(b1.read_data(&mut one, BUF_SIZE).is_err());
        let mut two = vec![1, 2];
        assert!(b1.write_data(&two, BUF_SIZE - 1).is_err());
        assert!(b1.read_data(&mut two, BUF_SIZE - 1).is_err());
    }

    //Testing the (de)serialization methods offered by buffers, and the encoded-size statics
    #[test]
    fn serialization_test() {
        //The offset arithmetic of the whole store hinges on these two sizes
        assert_eq!(*HEADER_FIELD_SIZE, 8);
        assert_eq!(*FREE_ENTRY_SIZE, 4);

        let mut b1 = Buffer::new_zero(BUF_SIZE);
        //Header fields and free-list entries round-trip at arbitrary aligned offsets
        b1.serialize_into(&(-1i64), 0).unwrap();
        b1.serialize_into(&(1u32 << 20), 8 * 2).unwrap();
        assert_eq!(b1.deserialize_from::<i64>(0).unwrap(), -1);
        assert_eq!(b1.deserialize_from::<u32>(8 * 2).unwrap(), 1 << 20);

        //The encoding is little-endian: the low byte comes first
        b1.serialize_into(&0x0102_0304u32, 40).unwrap();
        let mut raw = [0; 4];
        b1.read_data(&mut raw, 40).unwrap();
        assert_eq!(raw, [4, 3, 2, 1]);

        //Writes that would run off the end of the buffer fail and change nothing
        let before = b1.contents_as_ref().to_vec();
        assert!(b1.serialize_into(&0u64, BUF_SIZE - 4).is_err());
        assert_eq!(b1.contents_as_ref(), &before[..]);
    }

    //Testing the values derived from a geometry
    #[test]
    fn geometry_test() {
        let g = Geometry::default();
        assert_eq!(g.block_size, 40_960);
        assert_eq!(g.header_size, 48);
        assert_eq!(g.content_size(), 40_912);
        assert_eq!(g.sector_size(), 4096);
        assert_eq!(g.header_fields(), 6);

        //Toy-sized blocks fall back to the small sector size
        let g = Geometry::new(256, 48);
        assert_eq!(g.sector_size(), 128);
        assert_eq!(g.content_size(), 208);
    }
}
