//! A disk-backed, block-oriented record store.
//!
//! This crate turns a growable byte stream (see the `recstore_api`
//! controller) into a persistent set of variable-length records identified
//! by stable numeric ids. It is built as two layers:
//!
//! 1. [`block_store`](block_store/index.html) partitions the stream into
//!    fixed-size blocks with header and content areas, hands them out as
//!    coherent in-memory handles, and writes header edits back
//!    sector-at-a-time on release.
//! 2. [`record_store`](record_store/index.html) chains blocks together into
//!    records, and recycles deleted blocks through a free-block queue that
//!    lives inside the store itself, so deleting and re-creating records
//!    does not grow the backing file.
//!
//! Higher-level concerns (indexing record ids, serializing application
//! values, transactions, crash recovery, concurrent access) are left to
//! embedders, which consume only the record layer's operations.

#![deny(missing_docs)]

// Layer errors
pub mod error_store;

// The two storage layers, bottom up
pub mod block_store;
pub mod record_store;
