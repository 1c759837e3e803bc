//! Block layer of the store.
//!
//! Partitions the backing stream into fixed-size blocks, each made up of a
//! header area (an array of little-endian `i64` fields) and a content area
//! (opaque payload bytes). Blocks are borrowed from a [`BlockStore`] as
//! [`Block`] handles and given back by releasing them.
//!
//! Two properties of this layer carry the whole design:
//!
//! 1. **One in-memory block per id.** The store keeps a live-block table; as
//!    long as any handle to a block is alive, further fetches of the same id
//!    return a handle over the *same* in-memory state. Header edits made
//!    through one handle are therefore immediately visible through every
//!    other handle, which the record layer relies on when it holds several
//!    spots of the same chain at once.
//! 2. **Sector write-behind.** Header edits only touch an in-memory,
//!    sector-sized buffer covering the header area and the leading content
//!    bytes. The buffer is written back whole, in one aligned write, when
//!    the block is released. Content past the sector is written through to
//!    the stream immediately, so large payloads never accumulate in memory.
//!
//! [`BlockStore`]: struct.BlockStore.html
//! [`Block`]: struct.Block.html

use recstore_api::controller::Device;
use recstore_api::error::ApiError;
use recstore_api::store::StoreSupport;
use recstore_api::types::{Buffer, Geometry, HEADER_FIELD_SIZE, RESERVED_FIELDS};
use serde::{de::DeserializeOwned, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use super::error_store::BlockError;

/// Size of the chunks used when writing content past the sector straight
/// through to the stream; each chunk is flushed before the next one starts
const WRITE_CHUNK: u64 = 4096;

/// In-memory state of one live block, shared by every handle to it
#[derive(Debug)]
struct BlockState {
    /// Sector-sized buffer holding the header area and the leading content bytes
    sector: Buffer,
    /// Has the sector buffer diverged from the stream?
    dirty: bool,
    /// Lazily decoded cache of the reserved header fields
    reserved: [Option<i64>; RESERVED_FIELDS as usize],
    /// Set on first release; every later operation through any handle fails
    disposed: bool,
}

/// State shared between a store and all block handles borrowed from it
#[derive(Debug)]
struct StoreShared {
    geometry: Geometry,
    device: RefCell<Device>,
    /// The live-block table: one entry per block that is currently borrowed
    live: RefCell<HashMap<u32, Rc<RefCell<BlockState>>>>,
}

/// Struct representing the block layer of a store.
/// Hands out [`Block`] handles over the blocks of the backing stream, and
/// grows the stream one block at a time.
///
/// [`Block`]: struct.Block.html
#[derive(Debug)]
pub struct BlockStore {
    shared: Rc<StoreShared>,
}

impl StoreSupport for BlockStore {
    type Error = BlockError;

    fn geometry_valid(geometry: &Geometry) -> bool {
        geometry.block_size >= 128
            && geometry.header_size < geometry.block_size
            && geometry.header_size % *HEADER_FIELD_SIZE == 0
            && geometry.header_size <= geometry.sector_size()
    }

    fn mkstore<P: AsRef<Path>>(path: P, geometry: &Geometry) -> Result<Self, Self::Error> {
        if !Self::geometry_valid(geometry) {
            return Err(BlockError::BadArgument("invalid geometry"));
        }
        let device = Device::new(path)?;
        Ok(BlockStore::wrap(device, *geometry))
    }

    fn mountstore(dev: Device, geometry: &Geometry) -> Result<Self, Self::Error> {
        if !Self::geometry_valid(geometry) {
            return Err(BlockError::BadArgument("invalid geometry"));
        }
        Ok(BlockStore::wrap(dev, *geometry))
    }

    fn unmountstore(self) -> Device {
        match Rc::try_unwrap(self.shared) {
            Ok(shared) => shared.device.into_inner(),
            Err(_) => panic!("cannot unmount a store with outstanding block borrows"),
        }
    }
}

impl BlockStore {
    /// Wrap an already opened device in a block store
    fn wrap(device: Device, geometry: Geometry) -> BlockStore {
        BlockStore {
            shared: Rc::new(StoreShared {
                geometry,
                device: RefCell::new(device),
                live: RefCell::new(HashMap::new()),
            }),
        }
    }

    /// The geometry this store was opened with
    pub fn geometry(&self) -> Geometry {
        self.shared.geometry
    }

    /// Number of whole blocks the backing stream currently holds
    pub fn block_count(&self) -> u64 {
        self.shared.device.borrow().len() / self.shared.geometry.block_size
    }

    /// Number of blocks currently borrowed from this store
    pub fn live_blocks(&self) -> usize {
        self.shared.live.borrow().len()
    }

    /// Fetch the block with the given id.
    ///
    /// If a handle to this block is currently alive, the returned handle
    /// shares its in-memory state. Otherwise the block's sector is read from
    /// the stream into a fresh buffer and the block is registered in the
    /// live-block table. Returns `None` when the block lies beyond the end
    /// of the stream.
    pub fn b_get(&self, id: u32) -> Result<Option<Block>, BlockError> {
        if let Some(state) = self.shared.live.borrow().get(&id) {
            return Ok(Some(Block {
                id,
                state: Rc::clone(state),
                shared: Rc::clone(&self.shared),
            }));
        }
        let geometry = self.shared.geometry;
        let offset = id as u64 * geometry.block_size;
        let mut raw = vec![0; geometry.sector_size() as usize];
        {
            let device = self.shared.device.borrow();
            if offset + geometry.block_size > device.len() {
                return Ok(None);
            }
            device.read(offset, &mut raw)?;
        }
        Ok(Some(self.register(id, Buffer::new(raw.into_boxed_slice()))))
    }

    /// Append a fresh, zeroed block to the stream and return a handle to it.
    ///
    /// The new block's id follows from the stream length, so the stream must
    /// currently end on a block boundary; a stream that does not is corrupt
    /// and fails with `MisalignedStorage`.
    pub fn b_new(&self) -> Result<Block, BlockError> {
        let geometry = self.shared.geometry;
        let id = {
            let mut device = self.shared.device.borrow_mut();
            let len = device.len();
            if len % geometry.block_size != 0 {
                return Err(BlockError::MisalignedStorage);
            }
            let id = len / geometry.block_size;
            if id > u32::MAX as u64 {
                return Err(BlockError::AllocationFailed("block id space exhausted"));
            }
            device
                .set_len(len + geometry.block_size)
                .map_err(|_| BlockError::AllocationFailed("could not grow the stream"))?;
            device.flush()?;
            id as u32
        };
        Ok(self.register(id, Buffer::new_zero(geometry.sector_size())))
    }

    /// Install a block in the live-block table and hand out its first handle
    fn register(&self, id: u32, sector: Buffer) -> Block {
        let state = Rc::new(RefCell::new(BlockState {
            sector,
            dirty: false,
            reserved: [None; RESERVED_FIELDS as usize],
            disposed: false,
        }));
        self.shared.live.borrow_mut().insert(id, Rc::clone(&state));
        Block {
            id,
            state,
            shared: Rc::clone(&self.shared),
        }
    }
}

/// Handle to a live block, borrowed from a [`BlockStore`].
///
/// All handles to the same block share one in-memory state, so header edits
/// are coherent between them. A handle is given back with
/// [`release`](#method.release); the first release writes a dirty sector
/// back to the stream and unregisters the block, and every operation through
/// a remaining handle then fails with `Disposed`. Dropping the last handle
/// of an un-released block performs a best-effort release.
///
/// [`BlockStore`]: struct.BlockStore.html
#[derive(Debug)]
pub struct Block {
    id: u32,
    state: Rc<RefCell<BlockState>>,
    shared: Rc<StoreShared>,
}

impl Block {
    /// The id of this block; equal to its byte offset divided by the block size
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Number of payload bytes this block can hold
    pub fn content_size(&self) -> u64 {
        self.shared.geometry.content_size()
    }

    /// Fail with `BadField` when `field` does not name a header field
    fn check_field(&self, field: u64) -> Result<(), BlockError> {
        if field >= self.shared.geometry.header_fields() {
            return Err(BlockError::BadField(field));
        }
        Ok(())
    }

    /// Read the header field with the given index.
    /// The reserved fields are decoded once and cached; the remaining fields
    /// are decoded from the sector buffer on every call.
    pub fn get_header(&self, field: u64) -> Result<i64, BlockError> {
        self.check_field(field)?;
        let mut state = self.state.borrow_mut();
        if state.disposed {
            return Err(BlockError::Disposed);
        }
        let offset = field * *HEADER_FIELD_SIZE;
        if field < RESERVED_FIELDS {
            if let Some(value) = state.reserved[field as usize] {
                return Ok(value);
            }
            let value = state.sector.deserialize_from::<i64>(offset)?;
            state.reserved[field as usize] = Some(value);
            return Ok(value);
        }
        Ok(state.sector.deserialize_from::<i64>(offset)?)
    }

    /// Write the header field with the given index.
    /// The edit lands in the sector buffer and the reserved-field cache; it
    /// reaches the stream when the block is released, not before.
    pub fn set_header(&mut self, field: u64, value: i64) -> Result<(), BlockError> {
        self.check_field(field)?;
        let mut state = self.state.borrow_mut();
        if state.disposed {
            return Err(BlockError::Disposed);
        }
        state.sector.serialize_into(&value, field * *HEADER_FIELD_SIZE)?;
        if field < RESERVED_FIELDS {
            state.reserved[field as usize] = Some(value);
        }
        state.dirty = true;
        Ok(())
    }

    /// Read `data.len()` payload bytes starting at content offset `offset`.
    ///
    /// The part of the range that falls inside the sector comes from the
    /// sector buffer (so buffered writes are observed before they are
    /// flushed); the remainder is read from the stream in sector-sized
    /// chunks. Fails with `ShortRead` if the stream ends inside the range.
    pub fn read_data(&self, data: &mut [u8], offset: u64) -> Result<(), BlockError> {
        let geometry = self.shared.geometry;
        if offset + data.len() as u64 > geometry.content_size() {
            return Err(BlockError::OutOfBounds("read beyond the content area"));
        }
        let state = self.state.borrow();
        if state.disposed {
            return Err(BlockError::Disposed);
        }
        let sector_content = geometry.sector_size() - geometry.header_size;
        let mut done = 0u64;
        if offset < sector_content {
            let n = (data.len() as u64).min(sector_content - offset);
            state
                .sector
                .read_data(&mut data[..n as usize], geometry.header_size + offset)?;
            done = n;
        }
        let device = self.shared.device.borrow();
        while done < data.len() as u64 {
            let n = geometry.sector_size().min(data.len() as u64 - done);
            let addr = self.id as u64 * geometry.block_size + geometry.header_size + offset + done;
            if addr + n > device.len() {
                return Err(BlockError::ShortRead);
            }
            device.read(addr, &mut data[done as usize..(done + n) as usize])?;
            done += n;
        }
        Ok(())
    }

    /// Write the given payload bytes starting at content offset `offset`.
    ///
    /// The part of the range that falls inside the sector lands in the
    /// sector buffer and is deferred until release; the remainder is written
    /// through to the stream right away, flushed chunk by chunk.
    pub fn write_data(&mut self, data: &[u8], offset: u64) -> Result<(), BlockError> {
        let geometry = self.shared.geometry;
        if offset + data.len() as u64 > geometry.content_size() {
            return Err(BlockError::OutOfBounds("write beyond the content area"));
        }
        let mut state = self.state.borrow_mut();
        if state.disposed {
            return Err(BlockError::Disposed);
        }
        let sector_content = geometry.sector_size() - geometry.header_size;
        let mut done = 0u64;
        if offset < sector_content {
            let n = (data.len() as u64).min(sector_content - offset);
            state
                .sector
                .write_data(&data[..n as usize], geometry.header_size + offset)?;
            state.dirty = true;
            done = n;
        }
        let mut device = self.shared.device.borrow_mut();
        while done < data.len() as u64 {
            let n = WRITE_CHUNK.min(data.len() as u64 - done);
            let addr = self.id as u64 * geometry.block_size + geometry.header_size + offset + done;
            device.write(addr, &data[done as usize..(done + n) as usize])?;
            device.flush()?;
            done += n;
        }
        Ok(())
    }

    /// Write any value that implements the `Serialize` trait into this
    /// block's content area at the given offset.
    /// Goes through `write_data`, so the sector/write-through split and the
    /// bounds errors apply unchanged.
    pub fn serialize_into<S>(&mut self, stru: &S, offset: u64) -> Result<(), BlockError>
    where
        S: Serialize,
    {
        let stru_bin = bincode::serialize(stru).map_err(ApiError::from)?;
        self.write_data(&stru_bin, offset)
    }

    /// Read a value that implements the `DeserializeOwned` trait from this
    /// block's content area.
    /// `len` gives the encoded size of the value; for the fixed-width types
    /// stored by the record layer it is one of the size statics of the api
    /// crate.
    pub fn deserialize_from<S>(&self, offset: u64, len: u64) -> Result<S, BlockError>
    where
        S: DeserializeOwned,
    {
        let mut raw = vec![0; len as usize];
        self.read_data(&mut raw, offset)?;
        Ok(bincode::deserialize(&raw).map_err(ApiError::from)?)
    }

    /// Give this block back to the store.
    ///
    /// Idempotent. On the first release, a dirty sector buffer is written
    /// back to the stream in one aligned write and flushed, and the block is
    /// removed from the live-block table. Other handles to the same block
    /// observe the release: their next operation fails with `Disposed`.
    pub fn release(&mut self) -> Result<(), BlockError> {
        let mut state = self.state.borrow_mut();
        if state.disposed {
            return Ok(());
        }
        if state.dirty {
            let mut device = self.shared.device.borrow_mut();
            device.write(
                self.id as u64 * self.shared.geometry.block_size,
                state.sector.contents_as_ref(),
            )?;
            device.flush()?;
            state.dirty = false;
        }
        state.disposed = true;
        drop(state);
        self.shared.live.borrow_mut().remove(&self.id);
        Ok(())
    }
}

impl Drop for Block {
    /// A dropped handle releases the block when it is the last one, so that
    /// buffered header edits cannot be lost by forgetting an explicit
    /// release. Write errors are swallowed here; release explicitly to
    /// observe them.
    fn drop(&mut self) {
        // The live-block table itself holds one reference to the state
        if Rc::strong_count(&self.state) <= 2 {
            let _ = self.release();
        }
    }
}
