//! Record layer of the store.
//!
//! Composes blocks into chains to represent records of arbitrary length (up
//! to [`MAX_RECORD_SIZE`]), and keeps freed blocks available for reuse
//! through a queue embedded in the store itself: the content of the sentinel
//! record [`FREE_LIST_RECORD`] is a tightly packed sequence of little-endian
//! `u32` block ids, pushed and popped at its tail. Allocation prefers the
//! queue over growing the stream, so a store that deletes as much as it
//! creates does not grow.
//!
//! A record's id is the id of its chain's head block. The head carries the
//! total record length; every block carries the number of payload bytes it
//! holds, the id of its successor (0 for the final block), the id of its
//! predecessor (0 for a head), and a deletion marker.
//!
//! [`MAX_RECORD_SIZE`]: ../../recstore_api/types/constant.MAX_RECORD_SIZE.html
//! [`FREE_LIST_RECORD`]: ../../recstore_api/types/constant.FREE_LIST_RECORD.html

use recstore_api::controller::Device;
use recstore_api::store::{RecordSupport, StoreSupport};
use recstore_api::types::{
    Geometry, CONTENT_LEN_FIELD, DELETED_FIELD, FREE_ENTRY_SIZE, FREE_LIST_RECORD,
    MAX_RECORD_SIZE, NEXT_FIELD, PREV_FIELD, RECORD_LEN_FIELD, RESERVED_FIELDS,
};
use std::path::Path;

use super::block_store::{Block, BlockStore};
use super::error_store::RecordError;

/// Struct representing the record layer of a store
#[derive(Debug)]
pub struct RecordStore {
    block_store: BlockStore,
}

impl StoreSupport for RecordStore {
    type Error = RecordError;

    /// In addition to the block layer's conditions, the record layer needs
    /// one header field beyond the reserved ones, i.e. at least six fields
    fn geometry_valid(geometry: &Geometry) -> bool {
        BlockStore::geometry_valid(geometry) && geometry.header_fields() > RESERVED_FIELDS
    }

    fn mkstore<P: AsRef<Path>>(path: P, geometry: &Geometry) -> Result<Self, Self::Error> {
        if !Self::geometry_valid(geometry) {
            return Err(RecordError::BadArgument("invalid geometry"));
        }
        Ok(RecordStore {
            block_store: BlockStore::mkstore(path, geometry)?,
        })
    }

    fn mountstore(dev: Device, geometry: &Geometry) -> Result<Self, Self::Error> {
        if !Self::geometry_valid(geometry) {
            return Err(RecordError::BadArgument("invalid geometry"));
        }
        Ok(RecordStore {
            block_store: BlockStore::mountstore(dev, geometry)?,
        })
    }

    fn unmountstore(self) -> Device {
        self.block_store.unmountstore()
    }
}

impl RecordStore {
    /// The geometry this store was opened with
    pub fn geometry(&self) -> Geometry {
        self.block_store.geometry()
    }

    /// Number of whole blocks the backing stream currently holds
    pub fn block_count(&self) -> u64 {
        self.block_store.block_count()
    }

    fn content_size(&self) -> u64 {
        self.block_store.geometry().content_size()
    }

    /// Fetch the entire chain starting at `record_id`, in order.
    ///
    /// Special case: fetching the free-list sentinel of a store that does
    /// not have one yet creates it, as the first block of the stream. On
    /// failure every block fetched so far is given back before returning.
    fn get_blocks(&self, record_id: u32) -> Result<Vec<Block>, RecordError> {
        let mut chain = Vec::new();
        // On error the incomplete chain is dropped here, which releases it
        self.walk_chain(record_id, &mut chain)?;
        Ok(chain)
    }

    fn walk_chain(&self, record_id: u32, chain: &mut Vec<Block>) -> Result<(), RecordError> {
        let head = match self.block_store.b_get(record_id)? {
            Some(block) => block,
            None if record_id == FREE_LIST_RECORD => self.block_store.b_new()?,
            None => return Err(RecordError::BrokenChain("record head block is missing")),
        };
        let mut next = chain_step(&head)?;
        chain.push(head);
        while next != 0 {
            if chain.len() as u64 > self.block_store.block_count() {
                return Err(RecordError::BrokenChain("chain of blocks contains a cycle"));
            }
            let block = self
                .block_store
                .b_get(next)?
                .ok_or(RecordError::BrokenChain("chain points at a missing block"))?;
            next = chain_step(&block)?;
            chain.push(block);
        }
        Ok(())
    }

    /// Fetch the tail of the free-block queue: the final block of the
    /// sentinel record's chain and, if the chain is longer than one block,
    /// its predecessor. All earlier blocks of the chain are released before
    /// returning.
    fn space_tracking_blocks(&self) -> Result<(Block, Option<Block>), RecordError> {
        let mut chain = self.get_blocks(FREE_LIST_RECORD)?;
        let last = match chain.pop() {
            Some(block) => block,
            None => return Err(RecordError::BrokenChain("free-list chain is empty")),
        };
        let second_last = chain.pop();
        release_chain(&mut chain)?;
        Ok((last, second_last))
    }

    /// Pop the most recently freed block id off the queue, if there is one.
    ///
    /// When the tail block of the queue runs out of entries, the entry is
    /// popped from its predecessor instead, and the now-empty tail block is
    /// detached from the sentinel chain and itself enqueued in the popped
    /// entry's place; the queue thus consumes its own emptied tail blocks.
    fn try_pop_free(&self) -> Result<Option<u32>, RecordError> {
        let (mut last, second_last) = self.space_tracking_blocks()?;
        let tail_len = aligned_content_len(&last)?;
        if tail_len > 0 {
            let id = last.deserialize_from::<u32>(tail_len - *FREE_ENTRY_SIZE, *FREE_ENTRY_SIZE)?;
            last.set_header(CONTENT_LEN_FIELD, (tail_len - *FREE_ENTRY_SIZE) as i64)?;
            last.release()?;
            if let Some(mut second) = second_last {
                second.release()?;
            }
            return Ok(Some(id));
        }
        let mut second = match second_last {
            //A single empty tail block means the queue is empty
            None => {
                last.release()?;
                return Ok(None);
            }
            Some(block) => block,
        };
        let second_len = aligned_content_len(&second)?;
        if second_len == 0 {
            return Err(RecordError::EmptyFreeList);
        }
        let id = second.deserialize_from::<u32>(second_len - *FREE_ENTRY_SIZE, *FREE_ENTRY_SIZE)?;
        second.serialize_into(&last.id(), second_len - *FREE_ENTRY_SIZE)?;
        second.set_header(NEXT_FIELD, 0)?;
        last.set_header(PREV_FIELD, 0)?;
        last.release()?;
        second.release()?;
        Ok(Some(id))
    }

    /// Push the given block id onto the tail of the free-block queue.
    ///
    /// When the tail block is full, the queue grows by a *freshly created*
    /// block; drawing the extension block from the queue itself would drop
    /// entries.
    fn mark_as_free(&self, block_id: u32) -> Result<(), RecordError> {
        let (mut last, second_last) = self.space_tracking_blocks()?;
        let tail_len = aligned_content_len(&last)?;
        if tail_len + *FREE_ENTRY_SIZE <= self.content_size() {
            last.serialize_into(&block_id, tail_len)?;
            last.set_header(CONTENT_LEN_FIELD, (tail_len + *FREE_ENTRY_SIZE) as i64)?;
        } else {
            let mut fresh = self.block_store.b_new()?;
            fresh.set_header(PREV_FIELD, last.id() as i64)?;
            last.set_header(NEXT_FIELD, fresh.id() as i64)?;
            fresh.serialize_into(&block_id, 0)?;
            fresh.set_header(CONTENT_LEN_FIELD, *FREE_ENTRY_SIZE as i64)?;
            fresh.release()?;
        }
        last.release()?;
        if let Some(mut second) = second_last {
            second.release()?;
        }
        Ok(())
    }

    /// Produce a block for new data: a recycled one from the free-block
    /// queue if possible, a freshly appended one otherwise.
    fn allocate_block(&self) -> Result<Block, RecordError> {
        if let Some(id) = self.try_pop_free()? {
            let mut block = self
                .block_store
                .b_get(id)?
                .ok_or(RecordError::BrokenChain("free list points at a missing block"))?;
            //A recycled block still carries its old headers; reset all reserved fields
            for field in 0..RESERVED_FIELDS {
                block.set_header(field, 0)?;
            }
            return Ok(block);
        }
        Ok(self.block_store.b_new()?)
    }

    /// Write a fresh record's payload starting at the given head block,
    /// allocating and linking continuation blocks as needed, and return the
    /// record's id.
    fn write_payload(&self, mut head: Block, data: &[u8]) -> Result<u32, RecordError> {
        let record_id = head.id();
        head.set_header(RECORD_LEN_FIELD, data.len() as i64)?;
        if data.is_empty() {
            head.release()?;
            return Ok(record_id);
        }
        let content_size = self.content_size() as usize;
        let mut current = head;
        let mut written = 0;
        loop {
            let end = data.len().min(written + content_size);
            let slice = &data[written..end];
            current.write_data(slice, 0)?;
            current.set_header(CONTENT_LEN_FIELD, slice.len() as i64)?;
            written = end;
            if written == data.len() {
                current.release()?;
                return Ok(record_id);
            }
            let mut next = self.allocate_block()?;
            current.set_header(NEXT_FIELD, next.id() as i64)?;
            next.set_header(PREV_FIELD, current.id() as i64)?;
            current.release()?;
            current = next;
        }
    }

    /// Rewrite the payload of an existing chain in place, reusing its blocks
    /// front to back, allocating extra blocks when the new payload is longer
    /// and returning surplus blocks to the free-block queue when it is
    /// shorter. The caller releases the chain afterwards.
    fn rewrite_chain(&self, chain: &mut Vec<Block>, data: &[u8]) -> Result<(), RecordError> {
        if chain[0].get_header(PREV_FIELD)? != 0 {
            return Err(RecordError::BadArgument(
                "record id does not point at a head block",
            ));
        }
        let content_size = self.content_size() as usize;
        //An empty payload still occupies one (empty) slice, so the record
        //keeps its head block and with it its id
        let slices = if data.is_empty() {
            1
        } else {
            (data.len() + content_size - 1) / content_size
        };
        for i in 0..slices {
            if chain.len() <= i {
                chain.push(self.allocate_block()?);
            }
            let start = i * content_size;
            let end = data.len().min(start + content_size);
            let slice = &data[start..end];
            {
                let current = &mut chain[i];
                current.write_data(slice, 0)?;
                current.set_header(CONTENT_LEN_FIELD, slice.len() as i64)?;
                //Terminal for now; the next iteration relinks it
                current.set_header(NEXT_FIELD, 0)?;
                if i == 0 {
                    current.set_header(RECORD_LEN_FIELD, data.len() as i64)?;
                }
            }
            if i > 0 {
                let (front, back) = chain.split_at_mut(i);
                let previous = &mut front[i - 1];
                let current = &mut back[0];
                previous.set_header(NEXT_FIELD, current.id() as i64)?;
                current.set_header(PREV_FIELD, previous.id() as i64)?;
            }
        }
        //Surplus blocks of a shrinking record go back to the store
        for i in slices..chain.len() {
            self.mark_as_free(chain[i].id())?;
            chain[i].set_header(DELETED_FIELD, 1)?;
        }
        Ok(())
    }
}

impl RecordSupport for RecordStore {
    fn r_alloc(&mut self) -> Result<u32, Self::Error> {
        let mut block = self.allocate_block()?;
        let record_id = block.id();
        block.release()?;
        Ok(record_id)
    }

    fn r_create(&mut self, data: &[u8]) -> Result<u32, Self::Error> {
        if data.len() as u64 > MAX_RECORD_SIZE {
            return Err(RecordError::OversizedRecord(data.len() as i64));
        }
        let head = self.allocate_block()?;
        self.write_payload(head, data)
    }

    fn r_create_with<F>(&mut self, make: F) -> Result<u32, Self::Error>
    where
        F: FnOnce(u32) -> Vec<u8>,
    {
        let mut head = self.allocate_block()?;
        let data = make(head.id());
        if data.len() as u64 > MAX_RECORD_SIZE {
            //Roll the head block back, so the failed create does not leak it
            self.mark_as_free(head.id())?;
            head.set_header(DELETED_FIELD, 1)?;
            head.release()?;
            return Err(RecordError::OversizedRecord(data.len() as i64));
        }
        self.write_payload(head, &data)
    }

    fn r_get(&self, record_id: u32) -> Result<Option<Vec<u8>>, Self::Error> {
        //The sentinel's content is store bookkeeping, not an application record
        if record_id == FREE_LIST_RECORD {
            return Ok(None);
        }
        let mut head = match self.block_store.b_get(record_id)? {
            Some(block) => block,
            None => return Ok(None),
        };
        if head.get_header(DELETED_FIELD)? != 0 || head.get_header(PREV_FIELD)? != 0 {
            head.release()?;
            return Ok(None);
        }
        let record_len = head.get_header(RECORD_LEN_FIELD)?;
        if record_len < 0 || record_len as u64 > MAX_RECORD_SIZE {
            return Err(RecordError::OversizedRecord(record_len));
        }
        let mut payload = vec![0; record_len as usize];
        let mut gathered = 0;
        let mut steps = 0u64;
        let mut current = head;
        loop {
            let block_len = current.get_header(CONTENT_LEN_FIELD)?;
            if block_len < 0 {
                return Err(RecordError::BrokenChain("negative block content length"));
            }
            let block_len = block_len as usize;
            if gathered + block_len > payload.len() {
                return Err(RecordError::BrokenChain(
                    "chain holds more bytes than the record length",
                ));
            }
            current.read_data(&mut payload[gathered..gathered + block_len], 0)?;
            gathered += block_len;
            let next = next_block_id(&current)?;
            current.release()?;
            if next == 0 {
                break;
            }
            steps += 1;
            if steps > self.block_store.block_count() {
                return Err(RecordError::BrokenChain("chain of blocks contains a cycle"));
            }
            current = self
                .block_store
                .b_get(next)?
                .ok_or(RecordError::BrokenChain("chain points at a missing block"))?;
            if current.get_header(DELETED_FIELD)? != 0 {
                return Err(RecordError::BrokenChain("freed block on a live chain"));
            }
        }
        if gathered != payload.len() {
            return Err(RecordError::BrokenChain(
                "chain ended before the record length was reached",
            ));
        }
        Ok(Some(payload))
    }

    fn r_update(&mut self, record_id: u32, data: &[u8]) -> Result<(), Self::Error> {
        if record_id == FREE_LIST_RECORD {
            return Err(RecordError::BadArgument(
                "the free-list sentinel cannot be updated",
            ));
        }
        if data.len() as u64 > MAX_RECORD_SIZE {
            return Err(RecordError::OversizedRecord(data.len() as i64));
        }
        let mut chain = self.get_blocks(record_id)?;
        let result = self.rewrite_chain(&mut chain, data);
        //Give every block back even when the rewrite failed partway
        let released = release_chain(&mut chain);
        result?;
        released?;
        Ok(())
    }

    fn r_delete(&mut self, record_id: u32) -> Result<(), Self::Error> {
        if record_id == FREE_LIST_RECORD {
            return Err(RecordError::BadArgument(
                "the free-list sentinel cannot be deleted",
            ));
        }
        let mut current = self
            .block_store
            .b_get(record_id)?
            .ok_or(RecordError::BadArgument("no record with this id"))?;
        if current.get_header(PREV_FIELD)? != 0 {
            return Err(RecordError::BadArgument(
                "record id does not point at a head block",
            ));
        }
        let mut steps = 0u64;
        loop {
            if current.get_header(DELETED_FIELD)? != 0 {
                return Err(RecordError::BrokenChain("freed block on a live chain"));
            }
            let next = next_block_id(&current)?;
            //Enqueue and mark under the same borrow, so the block cannot end
            //up marked but unlisted or listed but unmarked
            self.mark_as_free(current.id())?;
            current.set_header(DELETED_FIELD, 1)?;
            current.release()?;
            if next == 0 {
                return Ok(());
            }
            steps += 1;
            if steps > self.block_store.block_count() {
                return Err(RecordError::BrokenChain("chain of blocks contains a cycle"));
            }
            current = self
                .block_store
                .b_get(next)?
                .ok_or(RecordError::BrokenChain("chain points at a missing block"))?;
        }
    }
}

/// Check that a block may sit on a live chain, and return its successor id
fn chain_step(block: &Block) -> Result<u32, RecordError> {
    if block.get_header(DELETED_FIELD)? != 0 {
        return Err(RecordError::BrokenChain("freed block on a live chain"));
    }
    next_block_id(block)
}

/// Read a block's successor id, rejecting values no block can have
fn next_block_id(block: &Block) -> Result<u32, RecordError> {
    let next = block.get_header(NEXT_FIELD)?;
    if next < 0 || next > u32::MAX as i64 {
        return Err(RecordError::BrokenChain("next pointer out of range"));
    }
    Ok(next as u32)
}

/// Read a free-list block's content length, which must be a whole number of entries
fn aligned_content_len(block: &Block) -> Result<u64, RecordError> {
    let len = block.get_header(CONTENT_LEN_FIELD)?;
    if len < 0 || len as u64 % *FREE_ENTRY_SIZE != 0 {
        return Err(RecordError::MisalignedFreeList);
    }
    Ok(len as u64)
}

/// Release every block in `chain`, reporting the first error but not
/// stopping on it
fn release_chain(chain: &mut Vec<Block>) -> Result<(), RecordError> {
    let mut result = Ok(());
    for block in chain.iter_mut() {
        let outcome = block.release();
        if result.is_ok() {
            if let Err(e) = outcome {
                result = Err(e.into());
            }
        }
    }
    chain.clear();
    result
}
