//! Error types of the two storage layers.
//! Each layer embeds the errors of the layer below it, so that `?` converts
//! upwards automatically: a controller failure deep inside a record
//! operation surfaces as `RecordError::BlockError(BlockError::ControllerError(..))`.

use recstore_api::error::ApiError;
use thiserror::Error;

///Error type used in the block layer
#[derive(Error, Debug)]
pub enum BlockError {
    ///errors from the controller layer
    #[error("Error in the controller layer")]
    ControllerError(#[from] ApiError),

    ///invalid input to the block layer
    #[error("Invalid block layer argument: {0}")]
    BadArgument(&'static str),

    ///operation on a block that has already been released
    #[error("Operation on a released block")]
    Disposed,

    ///header field index outside the header area
    #[error("Header field index {0} out of range")]
    BadField(u64),

    ///a read or write range falls outside the block content or a buffer
    #[error("Block access out of bounds: {0}")]
    OutOfBounds(&'static str),

    ///the stream length is not a whole multiple of the block size
    #[error("Stream length is not a multiple of the block size")]
    MisalignedStorage,

    ///the block layer could not create a new block
    #[error("Could not allocate a new block: {0}")]
    AllocationFailed(&'static str),

    ///the stream ended in the middle of a block read
    #[error("Stream ended in the middle of a block read")]
    ShortRead,
}

///Error type used in the record layer
#[derive(Error, Debug)]
pub enum RecordError {
    ///errors from the block layer
    #[error("Error in the block layer")]
    BlockError(#[from] BlockError),

    ///invalid input to the record layer
    #[error("Invalid record layer argument: {0}")]
    BadArgument(&'static str),

    ///a record length header claims more than the maximum record size
    #[error("Record length {0} exceeds the maximum record size")]
    OversizedRecord(i64),

    ///a chain of blocks is inconsistent: a dangling next pointer, a freed
    ///block on a live chain, or content lengths that contradict the record
    ///length
    #[error("Record chain is broken: {0}")]
    BrokenChain(&'static str),

    ///a free-list block's content length is not a multiple of the entry size
    #[error("Free-list block content length is not a multiple of the entry size")]
    MisalignedFreeList,

    ///a free-list block that should hold at least one entry holds none
    #[error("Free-list block unexpectedly empty")]
    EmptyFreeList,
}
