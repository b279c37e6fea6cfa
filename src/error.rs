//! Crate-level error types.

use thiserror::Error;

/// Errors that can occur during UVC operations.
///
/// The set is closed: transport failures are mapped onto the same variants so
/// callers can match on them without knowing which backend is in use.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// Input/output error, including short control transfers.
    #[error("input/output error")]
    Io,

    /// Invalid parameter, or an operation on a stream that is not running.
    #[error("invalid parameter")]
    InvalidParam,

    /// Access denied by the operating system.
    #[error("access denied")]
    Access,

    /// The device has been disconnected.
    #[error("no such device")]
    NoDevice,

    /// Entity or transfer not found.
    #[error("entity not found")]
    NotFound,

    /// Resource busy: the interface is already streaming or still has open streams.
    #[error("resource busy")]
    Busy,

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// The device sent more data than the buffer could hold.
    #[error("overflow")]
    Overflow,

    /// Pipe error (endpoint stalled).
    #[error("pipe error")]
    Pipe,

    /// System call interrupted.
    #[error("system call interrupted")]
    Interrupted,

    /// Insufficient memory.
    #[error("insufficient memory")]
    NoMem,

    /// Operation or format not supported.
    #[error("operation not supported")]
    NotSupported,

    /// The device is not UVC-compliant or its descriptors are malformed.
    #[error("device is not UVC-compliant")]
    InvalidDevice,

    /// No format, resolution and frame rate combination matched the request.
    #[error("mode not supported")]
    InvalidMode,

    /// Polling is not available while a frame callback is registered.
    #[error("stream already has a frame callback")]
    CallbackExists,

    /// Undefined error.
    #[error("unknown error")]
    Other,
}

impl Error {
    /// Returns true if the error means the device is gone.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Error::NoDevice)
    }
}

#[cfg(feature = "rusb-backend")]
impl From<rusb::Error> for Error {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Io => Error::Io,
            rusb::Error::InvalidParam => Error::InvalidParam,
            rusb::Error::Access => Error::Access,
            rusb::Error::NoDevice => Error::NoDevice,
            rusb::Error::NotFound => Error::NotFound,
            rusb::Error::Busy => Error::Busy,
            rusb::Error::Timeout => Error::Timeout,
            rusb::Error::Overflow => Error::Overflow,
            rusb::Error::Pipe => Error::Pipe,
            rusb::Error::Interrupted => Error::Interrupted,
            rusb::Error::NoMem => Error::NoMem,
            rusb::Error::NotSupported => Error::NotSupported,
            rusb::Error::BadDescriptor => Error::InvalidDevice,
            rusb::Error::Other => Error::Other,
        }
    }
}

/// Result type alias for UVC operations.
pub type Result<T> = std::result::Result<T, Error>;
