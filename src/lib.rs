
//! Archive huge 3D voxel volumes as video-encoded, block-indexed files,
//! and load arbitrary subsets of blocks back with a controlled memory budget.
//!
//! The volume is cut into overlapping padded cubic blocks. The blocks are
//! appended to one logical byte stream, which is cut into fixed-size planar
//! 4:2:0 frames and pushed through a video codec. A block index and a frame
//! offset table in the file trailer make every block randomly addressable.

#![warn(
    rust_2018_idioms,
    future_incompatible,
    unused_extern_crates,
    unused,

    missing_copy_implementations,
    missing_debug_implementations,
)]

#![deny(
    unused_variables,
    unused_must_use,
    trivial_numeric_casts,
)]

#![forbid(unsafe_code)]

pub mod io; // public to allow for custom trailer parsing

pub mod math;
pub mod error;
pub mod meta;
pub mod frame;
pub mod codec;
pub mod archive;
pub mod extract;

/// Re-exports of all types commonly required
/// for simply writing and reading voxel archives.
pub mod prelude {

    // main exports
    pub use crate::archive::{Archiver, ArchiverOptions, ArchiveSummary};
    pub use crate::archive::source::{RawSource, RawVolume, MemoryVolume};
    pub use crate::extract::Unarchiver;

    // secondary data types
    pub use crate::meta::{Header, ArchiveMeta, EncodeMethod, ChromaFormat};
    pub use crate::meta::index::{Idx, BlockIndex};
    pub use crate::codec::{EncodeOptions, DecodeOptions};
    pub use crate::math::Vec3;
    pub use crate::error::{Error, Result};
}
