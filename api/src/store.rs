//! Collection of the traits implemented by the storage layers.
//! Every layer implements the [`StoreSupport`] trait, which covers the lifecycle of a store; the record layer additionally implements [`RecordSupport`].
//! Implementations are expected to define auxiliary functions for repetitive tasks (walking a chain of blocks, locating the tail of the free-block queue, slicing a payload into block-sized pieces) rather than inlining that logic at every call site.
//!
//! [`StoreSupport`]: trait.StoreSupport.html
//! [`RecordSupport`]: trait.RecordSupport.html

use super::{controller::Device, types::Geometry};
use std::{error, path::Path};

/// General trait that each storage layer implements, allowing stores to be set up, torn down and reopened.
/// Additionally, this trait defines the error type that is used by all of the layer's other traits.
///
/// Layers stack: the record layer wraps the block layer and delegates its
/// implementation of this trait downwards, tightening `geometry_valid` where
/// it imposes extra requirements of its own. Do not write one blanket
/// implementation for every layer.
pub trait StoreSupport: Sized {
    /// The type of the errors of this layer.
    ///
    /// Note the “supertrait” the error type must implement:
    /// [`error::Error`](https://doc.rust-lang.org/std/error/trait.Error.html),
    /// the base trait for all Rust errors.
    type Error: error::Error;

    /// Static method to check if the given geometry describes a store this layer can operate on.
    ///
    /// More concretely, the following conditions need to hold at every layer:
    /// - blocks are large enough to be sectored, i.e. `block_size >= 128`
    /// - the header area leaves room for content, i.e. `header_size < block_size`
    /// - the header area holds a whole number of fields, i.e. `header_size` is a multiple of 8
    /// - the header area fits inside one sector, so that releasing a block can
    ///   persist the entire header in a single aligned write
    ///
    /// Layers may impose additional conditions; consult their documentation.
    fn geometry_valid(geometry: &Geometry) -> bool;

    /// Create and open a new, empty store with the given geometry, backed by a
    /// fresh file at the given path.
    ///
    /// This method always does the following, regardless of the layer:
    /// - Check that the given geometry is valid for this layer
    /// - Create a new empty `Device` at the given path
    ///
    /// A new store contains no blocks at all; the backing stream has length 0.
    /// Any bookkeeping blocks the layer needs (such as the free-list sentinel
    /// of the record layer) appear lazily, the first time an operation needs
    /// them. This keeps the empty store representable by an empty file.
    fn mkstore<P: AsRef<Path>>(path: P, geometry: &Geometry) -> Result<Self, Self::Error>;

    /// Given an existing `Device` called `dev`, wrap it in a store with the given geometry.
    ///
    /// The geometry is checked for validity, but the stream contents are
    /// taken at face value: a stream whose length is not a multiple of the
    /// block size is only detected (and reported as corruption) by the first
    /// operation that needs to extend it.
    ///
    /// We could add `dev` to the error side of the return type to reclaim
    /// ownership in case of failure, but we do not bother recovering rejected
    /// devices, for simplicity reasons.
    fn mountstore(dev: Device, geometry: &Geometry) -> Result<Self, Self::Error>;

    /// Unmount the given store, thereby consuming it.
    /// Returns the image of the store, i.e. the `Device` backing it.
    ///
    /// # Panics
    /// Panics if any block handles borrowed from this store are still alive;
    /// every operation releases the blocks it borrows, so this can only
    /// happen when an embedder holds on to a handle across operations.
    fn unmountstore(self) -> Device;
}

/// This trait adds the abstraction of records to a store: persistent
/// variable-length byte sequences, identified by stable numeric ids.
///
/// A record is stored as a chain of blocks; its id is the id of the chain's
/// head block, which makes ids stable across updates. Record id
/// [`FREE_LIST_RECORD`](../types/constant.FREE_LIST_RECORD.html) is reserved
/// for the store's own bookkeeping and cannot be updated or deleted through
/// this trait.
///
/// Operations are synchronous and single-threaded; callers needing
/// concurrent access must serialize externally. Atomicity across the blocks
/// of one operation is *not* guaranteed: a failure mid-operation leaves the
/// store consistent at block granularity only.
pub trait RecordSupport: StoreSupport {
    /// Allocate a new, empty record and return its id.
    /// The record exists and can be read (as zero bytes), updated and deleted.
    fn r_alloc(&mut self) -> Result<u32, Self::Error>;

    /// Create a new record holding a copy of `data`, and return its id.
    /// Fails if `data` is longer than
    /// [`MAX_RECORD_SIZE`](../types/constant.MAX_RECORD_SIZE.html).
    fn r_create(&mut self, data: &[u8]) -> Result<u32, Self::Error>;

    /// Create a new record whose payload may depend on its own id.
    /// The id the record will receive is passed to `make`, and the bytes it
    /// returns become the record's payload. Useful for self-referencing
    /// payloads, e.g. a serialized node that embeds its own id.
    fn r_create_with<F>(&mut self, make: F) -> Result<u32, Self::Error>
    where
        F: FnOnce(u32) -> Vec<u8>;

    /// Read the full payload of the record with the given id.
    /// Returns `None` if no such record exists: the id lies beyond the end of
    /// the store, points at a freed block, or points into the middle of a
    /// chain rather than at its head.
    fn r_get(&self, record_id: u32) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Replace the payload of the record with the given id by a copy of `data`.
    /// The record keeps its id. Blocks are reused in place where possible;
    /// a shrinking record returns its surplus blocks to the store for reuse,
    /// and a growing one draws replacement blocks from the store before
    /// extending the stream.
    fn r_update(&mut self, record_id: u32, data: &[u8]) -> Result<(), Self::Error>;

    /// Delete the record with the given id.
    /// All its blocks are marked as freed and become available for reuse;
    /// the stream does not shrink. A subsequent `r_get` of the id returns
    /// `None`.
    fn r_delete(&mut self, record_id: u32) -> Result<(), Self::Error>;
}
