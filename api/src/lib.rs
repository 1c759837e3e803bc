//! Shared foundation of the record store
//!
//! This crate contains the device controller that turns a file into a
//! growable byte stream, the buffer and geometry types that define the
//! on-disk format, and the traits implemented by the storage layers in the
//! `recstore` crate.
//!
//! Placing the modules here ensures that embedders can depend on the types
//! and traits without pulling in a concrete engine.

#![deny(missing_docs)]

//Implementation of the controller layer
pub mod controller;
pub mod error;

//Basic modules for types
pub mod types;

//Traits the storage layers implement
pub mod store;
