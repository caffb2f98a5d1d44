
//! Error type definitions.

use std::borrow::Cow;
use std::convert::TryFrom;
use std::error;
use std::fmt;
use crate::meta::index::Idx;

pub use std::io::Error as IoError;
pub use std::io::Result as IoResult;

/// A result that may contain a voxar error.
pub type Result<T> = std::result::Result<T, Error>;

/// A result that, if ok, contains nothing, and otherwise contains a voxar error.
pub type UnitResult = Result<()>;


/// An error that may happen while writing or reading a voxel archive.
#[derive(Debug)]
pub enum Error {

    /// Reading or writing the underlying byte stream failed.
    Io(IoError),

    /// The archive contents are inconsistent: header and trailer disagree,
    /// an offset table is not monotonic, or the encoded body is truncated.
    Corrupt(Cow<'static, str>),

    /// The requested block coordinate is not present in the block index.
    /// Leaves the unarchiver usable for further requests.
    UnknownBlock(Idx),

    /// The coded sequence header describes a stream configuration
    /// that this decoder cannot handle.
    UnsupportedStream(Cow<'static, str>),

    /// The encoder or decoder collaborator failed.
    Codec(Cow<'static, str>),

    /// The destination memory view is too small for the requested slice.
    /// Leaves the unarchiver usable for further requests. No partial write occurred.
    InsufficientBuffer {

        /// Number of bytes the operation would have written.
        required: usize,

        /// Length of the destination that was supplied.
        actual: usize,
    },

    /// The memory budget is below the size of one block pair.
    InsufficientMemory {

        /// The supplied soft memory limit in bytes.
        limit: usize,

        /// The minimum number of bytes this configuration needs.
        required: usize,
    },

    /// The supplied configuration is outside the legal parameter space,
    /// for example a padding outside `0..=2` or a zero volume dimension.
    InvalidConfig(Cow<'static, str>),
}

impl Error {

    /// Create a corrupt-archive error with the specified message.
    pub fn corrupt(message: impl Into<Cow<'static, str>>) -> Self {
        Error::Corrupt(message.into())
    }

    /// Create an unsupported-stream error with the specified message.
    pub fn unsupported(message: impl Into<Cow<'static, str>>) -> Self {
        Error::UnsupportedStream(message.into())
    }

    /// Create an opaque codec-failure error with the specified message.
    pub fn codec(message: impl Into<Cow<'static, str>>) -> Self {
        Error::Codec(message.into())
    }

    /// Create an invalid-configuration error with the specified message.
    pub fn invalid_config(message: impl Into<Cow<'static, str>>) -> Self {
        Error::InvalidConfig(message.into())
    }
}

/// Enable using the `?` operator on `std::io::Result`.
impl From<IoError> for Error {
    fn from(error: IoError) -> Self {
        Error::Io(error)
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(error) => Some(error),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(error) => write!(formatter, "io error: {}", error),
            Error::Corrupt(message) => write!(formatter, "corrupt archive: {}", message),
            Error::UnknownBlock(index) => write!(formatter, "block {} is not in the archive", index),
            Error::UnsupportedStream(message) => write!(formatter, "unsupported stream: {}", message),
            Error::Codec(message) => write!(formatter, "codec failure: {}", message),

            Error::InsufficientBuffer { required, actual } =>
                write!(formatter, "insufficient buffer: {} < {}", actual, required),

            Error::InsufficientMemory { limit, required } =>
                write!(formatter, "memory limit of {} bytes is below one block pair ({} bytes)", limit, required),

            Error::InvalidConfig(message) => write!(formatter, "invalid configuration: {}", message),
        }
    }
}


/// Panics on architectures where `u64` does not fit into `usize`.
/// The file format addresses more bytes than a 32 bit machine can map anyway.
pub(crate) fn u64_to_usize(value: u64) -> usize {
    usize::try_from(value).expect("(u64 as usize) overflowed")
}

/// Panics on overflow, which cannot happen for any supported machine.
pub(crate) fn usize_to_u64(value: usize) -> u64 {
    u64::try_from(value).expect("(usize as u64) overflowed")
}

/// Returns a corrupt-archive error when the value does not fit,
/// as all in-frame quantities of a valid archive fit into `u32`.
pub(crate) fn usize_to_u32(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::corrupt("32 bit offset overflowed"))
}
