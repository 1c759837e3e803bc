//! Errors shared by the device controller and the buffer types.
//!
//! Every layer of the store defines its own error enum and embeds the one of
//! the layer below it, so that `?` converts upwards automatically. This module
//! holds the bottom of that chain: the errors that the [`Device`] controller
//! and the [`Buffer`] type can produce on their own.
//!
//! [`Device`]: ../controller/struct.Device.html
//! [`Buffer`]: ../types/struct.Buffer.html

use std::io;
use thiserror::Error;

/// Error type used by the api crate.
///
/// The `#[error]` tag generates the `Display` implementation, and the
/// `#[from]` tags generate `From` implementations so that `io::Error` and
/// `bincode::Error` convert into an `ApiError` under the `?` operator.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Error caused when performing IO on the backing file of a device
    #[error("Issue using IO in the controller layer")]
    ControllerIO(#[from] io::Error),
    /// Error caused when encoding or decoding an on-disk value
    #[error("Issue with serialization in the controller layer")]
    ControllerSerialize(#[from] bincode::Error),
    /// Invalid input to the controller layer
    /// Note: `&'static str` suffices here, as all messages are literals
    #[error("Invalid controller input: {0}")]
    ControllerInput(&'static str),
    /// Invalid input to a buffer operation
    #[error("Invalid buffer input: {0}")]
    BufferInput(&'static str),

    /// Catch-all for errors that clients of this crate want to funnel through
    /// the api error type without defining their own. The store crates never
    /// produce this variant themselves.
    #[error(transparent)]
    Other(#[from] anyhow::Error), // source and Display delegate to anyhow::Error
}

/// Generic alias for a `Result` with the error type `ApiError`.
pub type Result<T> = std::result::Result<T, ApiError>;
