
//! Describes the meta data of a voxel archive:
//! the fixed header, the frame offset table, and the block index.

pub mod index;

use std::collections::BTreeMap;
use std::io::SeekFrom;

use crate::error::{Error, Result, UnitResult, u64_to_usize, usize_to_u64};
use crate::io::{Data, Read, Write, Seek, Tracking};
use crate::math::{Vec3, compute_block_count};
use self::index::{Idx, BlockIndex};


/// The file format version that this crate writes and reads.
pub const FORMAT_VERSION: u64 = 1;

/// Number of bytes in the serialized header. Always the first bytes of an archive.
pub const HEADER_BYTE_SIZE: usize = 100;

/// Caps the pre-allocation when reading length-prefixed tables of corrupt files.
const ESTIMATED_MAX_TABLE_LEN: usize = 1 << 16;


/// Which video codec the archive body is encoded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeMethod {

    /// H.264 / AVC, decoded by an external backend.
    H264,

    /// H.265 / HEVC, decoded by an external backend.
    Hevc,

    /// The built-in reference packetization which stores each frame verbatim.
    Raw,
}

impl EncodeMethod {

    /// The value stored in the archive header.
    pub fn to_u64(self) -> u64 {
        match self {
            EncodeMethod::H264 => 0,
            EncodeMethod::Hevc => 1,
            EncodeMethod::Raw => 2,
        }
    }

    /// Interpret a header value.
    pub fn from_u64(value: u64) -> Result<Self> {
        match value {
            0 => Ok(EncodeMethod::H264),
            1 => Ok(EncodeMethod::Hevc),
            2 => Ok(EncodeMethod::Raw),
            _ => Err(Error::corrupt("unknown encode method")),
        }
    }
}


/// The chroma subsampling layout of the encoded frames.
/// Stored in a reserved header slot so readers do not
/// have to probe the bitstream to learn it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChromaFormat {

    /// 4:2:0 subsampling, the reference layout. Chroma planes have half the luma height.
    Yuv420,

    /// 4:2:2 subsampling. Chroma plane as high as the luma plane.
    Yuv422,

    /// 4:4:4, no subsampling. Chroma plane as high as the luma plane.
    Yuv444,

    /// No chroma plane at all. Cannot be decoded by this crate.
    Monochrome,
}

impl ChromaFormat {

    /// The value stored in the archive header.
    pub fn to_u64(self) -> u64 {
        match self {
            ChromaFormat::Yuv420 => 0,
            ChromaFormat::Yuv422 => 1,
            ChromaFormat::Yuv444 => 2,
            ChromaFormat::Monochrome => 3,
        }
    }

    /// Interpret a header value.
    pub fn from_u64(value: u64) -> Result<Self> {
        match value {
            0 => Ok(ChromaFormat::Yuv420),
            1 => Ok(ChromaFormat::Yuv422),
            2 => Ok(ChromaFormat::Yuv444),
            3 => Ok(ChromaFormat::Monochrome),
            _ => Err(Error::corrupt("unknown chroma format")),
        }
    }

    /// The combined height of the chroma rows following `luma_height` rows of luma.
    /// `None` for layouts without a decodable chroma plane.
    pub fn chroma_height(self, luma_height: usize) -> Option<usize> {
        match self {
            ChromaFormat::Yuv420 => Some(luma_height / 2),
            ChromaFormat::Yuv422 | ChromaFormat::Yuv444 => Some(luma_height),
            ChromaFormat::Monochrome => None,
        }
    }
}


/// The fixed meta data record at the start of every archive.
/// All derived fields are stored redundantly and validated when reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {

    /// The file format version this archive was written with.
    pub version: u64,

    /// Extent of the source volume in voxels.
    pub raw_dim: Vec3<usize>,

    /// Extent of the block grid, `ceil(raw_dim / block_inner)` per axis.
    pub grid_dim: Vec3<usize>,

    /// Extent of the conceptual padded volume, `grid_dim * block_size` per axis.
    pub adjusted_dim: Vec3<usize>,

    /// Binary logarithm of the block side length. Always in `5 ..= 14`.
    pub log_block_size: usize,

    /// Side length of one padded block in voxels, `1 << log_block_size`.
    pub block_size: usize,

    /// Side length of the non-padded block core, `block_size - 2 * padding`.
    pub block_inner: usize,

    /// Number of voxels each block overlaps its neighbors per face. Always in `0 ..= 2`.
    pub padding: usize,

    /// Which video codec the body is encoded with.
    pub encode_method: EncodeMethod,

    /// Byte size of one decoded frame.
    pub frame_size: usize,

    /// Chroma subsampling of the encoded frames.
    pub chroma_format: ChromaFormat,
}

impl Header {

    /// Compute the header for the specified volume and block configuration.
    /// Returns `Error::InvalidConfig` for parameters outside the legal space.
    pub fn new(
        raw_dim: Vec3<usize>, log_block_size: usize, padding: usize,
        encode_method: EncodeMethod, frame_size: usize,
    ) -> Result<Self>
    {
        if raw_dim.0 == 0 || raw_dim.1 == 0 || raw_dim.2 == 0 {
            return Err(Error::invalid_config("volume dimensions must not be zero"));
        }

        if !(5 ..= 14).contains(&log_block_size) {
            return Err(Error::invalid_config("log block size must be in 5 ..= 14"));
        }

        if padding > 2 {
            return Err(Error::invalid_config("padding must be 0, 1 or 2"));
        }

        if frame_size == 0 {
            return Err(Error::invalid_config("frame size must not be zero"));
        }

        let block_size = 1 << log_block_size;
        let block_inner = block_size - 2 * padding;

        let grid_dim = raw_dim.map(|extent| compute_block_count(extent, block_inner));
        let adjusted_dim = grid_dim * block_size;

        Ok(Header {
            version: FORMAT_VERSION,
            raw_dim, grid_dim, adjusted_dim,
            log_block_size, block_size, block_inner, padding,
            encode_method, frame_size,
            chroma_format: ChromaFormat::Yuv420,
        })
    }

    /// The number of voxels in one block, `block_size` cubed.
    pub fn block_volume(&self) -> usize {
        self.block_size * self.block_size * self.block_size
    }

    /// The number of blocks in the archive.
    pub fn block_count(&self) -> usize {
        self.grid_dim.volume()
    }

    /// Write the fixed-size header record.
    pub fn write(&self, write: &mut impl Write) -> UnitResult {
        fn dimensions(write: &mut impl Write, vector: Vec3<usize>) -> UnitResult {
            for extent in [vector.0, vector.1, vector.2] {
                crate::error::usize_to_u32(extent)?.write(write)?;
            }
            Ok(())
        }

        self.version.write(write)?;
        dimensions(write, self.raw_dim)?;
        dimensions(write, self.grid_dim)?;
        dimensions(write, self.adjusted_dim)?;
        usize_to_u64(self.log_block_size).write(write)?;
        usize_to_u64(self.block_size).write(write)?;
        usize_to_u64(self.block_inner).write(write)?;
        usize_to_u64(self.padding).write(write)?;
        self.encode_method.to_u64().write(write)?;
        usize_to_u64(self.frame_size).write(write)?;
        self.chroma_format.to_u64().write(write)?;
        Ok(())
    }

    /// Read and validate the fixed-size header record.
    pub fn read(read: &mut impl Read) -> Result<Self> {
        fn dimensions(read: &mut impl Read) -> Result<Vec3<usize>> {
            let index = Idx::read(read)?;
            Ok(Vec3(index.x as usize, index.y as usize, index.z as usize))
        }

        let version = u64::read(read)?;
        let raw_dim = dimensions(read)?;
        let grid_dim = dimensions(read)?;
        let adjusted_dim = dimensions(read)?;
        let log_block_size = u64_to_usize(u64::read(read)?);
        let block_size = u64_to_usize(u64::read(read)?);
        let block_inner = u64_to_usize(u64::read(read)?);
        let padding = u64_to_usize(u64::read(read)?);
        let encode_method = EncodeMethod::from_u64(u64::read(read)?)?;
        let frame_size = u64_to_usize(u64::read(read)?);
        let chroma_format = ChromaFormat::from_u64(u64::read(read)?)?;

        let header = Header {
            version, raw_dim, grid_dim, adjusted_dim,
            log_block_size, block_size, block_inner, padding,
            encode_method, frame_size, chroma_format,
        };

        header.validate()?;
        Ok(header)
    }

    /// Check that all redundantly stored fields agree with each other.
    pub fn validate(&self) -> UnitResult {
        if self.version != FORMAT_VERSION {
            return Err(Error::unsupported("file format version"));
        }

        if !(5 ..= 14).contains(&self.log_block_size) || self.padding > 2 {
            return Err(Error::corrupt("block configuration out of range"));
        }

        if self.block_size != 1 << self.log_block_size {
            return Err(Error::corrupt("block size does not match its logarithm"));
        }

        if self.block_inner != self.block_size - 2 * self.padding {
            return Err(Error::corrupt("block core size does not match padding"));
        }

        if self.raw_dim.0 == 0 || self.raw_dim.1 == 0 || self.raw_dim.2 == 0 {
            return Err(Error::corrupt("zero volume dimension"));
        }

        let expected_grid = self.raw_dim.map(|extent| compute_block_count(extent, self.block_inner));
        if self.grid_dim != expected_grid {
            return Err(Error::corrupt("block grid does not cover the volume"));
        }

        if self.adjusted_dim != self.grid_dim * self.block_size {
            return Err(Error::corrupt("padded volume does not match the block grid"));
        }

        if self.frame_size == 0 {
            return Err(Error::corrupt("zero frame size"));
        }

        Ok(())
    }
}


/// The sorted mapping from block coordinates to their frame windows.
pub type BlockIndexMap = BTreeMap<Idx, BlockIndex>;

/// All meta data of an archive: the header, the frame offset table,
/// and the block index. Everything needed to plan reads,
/// without any of the encoded bytes.
#[derive(Debug, Clone)]
pub struct ArchiveMeta {

    /// The fixed header record.
    pub header: Header,

    /// Byte offset into the encoded body at which each frame begins.
    /// Contains one final sentinel entry which equals the body byte size.
    pub frame_offsets: Vec<u64>,

    /// Maps each block coordinate to its frame window.
    pub block_index: BlockIndexMap,
}

impl ArchiveMeta {

    /// The number of whole frames in the encoded body.
    pub fn frame_count(&self) -> usize {
        self.frame_offsets.len().saturating_sub(1)
    }

    /// The byte size of the encoded body between header and trailer.
    pub fn body_byte_size(&self) -> u64 {
        self.frame_offsets.last().copied().unwrap_or(0)
    }

    /// Read header and trailer of an archive, leaving the byte source position undefined.
    /// Assumes the byte source is buffered.
    pub fn read_from_buffered(read: &mut (impl Read + Seek)) -> Result<Self> {
        let file_len = read.seek(SeekFrom::End(0))?;
        let body_start = usize_to_u64(HEADER_BYTE_SIZE);

        if file_len < body_start + u64::BYTE_SIZE as u64 {
            return Err(Error::corrupt("file is too small to contain an archive"));
        }

        read.seek(SeekFrom::Start(0))?;
        let header = Header::read(read)?;

        read.seek(SeekFrom::End(-(u64::BYTE_SIZE as i64)))?;
        let meta_offset = u64::read(read)?;

        if body_start + meta_offset + u64::BYTE_SIZE as u64 > file_len {
            return Err(Error::corrupt("trailer pointer is outside the file"));
        }

        read.seek(SeekFrom::Start(body_start + meta_offset))?;
        let frame_offsets = u64::read_u64_sized_vec(read, ESTIMATED_MAX_TABLE_LEN)?;

        let entry_count = u64_to_usize(u64::read(read)?);
        let mut block_index = BlockIndexMap::new();
        let mut previous: Option<Idx> = None;

        for _ in 0 .. entry_count {
            let index = Idx::read(read)?;
            let block = BlockIndex::read(read)?;

            if previous.map_or(false, |previous| previous >= index) {
                return Err(Error::corrupt("block index is not sorted"));
            }

            previous = Some(index);
            block_index.insert(index, block);
        }

        let meta = ArchiveMeta { header, frame_offsets, block_index };
        meta.validate(meta_offset)?;
        Ok(meta)
    }

    /// Check the invariants that connect header, offset table and block index.
    fn validate(&self, body_byte_size: u64) -> UnitResult {
        let offsets = &self.frame_offsets;

        if offsets.first() != Some(&0) {
            return Err(Error::corrupt("first frame offset is not zero"));
        }

        if offsets.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(Error::corrupt("frame offsets are not strictly increasing"));
        }

        if self.body_byte_size() != body_byte_size {
            return Err(Error::corrupt("frame offsets do not span the encoded body"));
        }

        if self.block_index.len() != self.header.block_count() {
            return Err(Error::corrupt("block index does not cover the block grid"));
        }

        let frame_count = self.frame_count();
        let frame_size = usize_to_u64(self.header.frame_size);
        let block_volume = usize_to_u64(self.header.block_volume());

        let grid = self.header.grid_dim;
        for (&index, &block) in &self.block_index {
            let inside_grid = (index.x as usize) < grid.0
                && (index.y as usize) < grid.1
                && (index.z as usize) < grid.2;

            if !inside_grid {
                return Err(Error::corrupt("block coordinate outside the grid"));
            }

            if block.first_frame > block.last_frame || (block.last_frame as usize) >= frame_count {
                return Err(Error::corrupt("block frame window outside the body"));
            }

            if u64::from(block.in_frame_offset) >= frame_size {
                return Err(Error::corrupt("block offset outside its frame"));
            }

            let window_bytes = u64::from(block.frame_span()) * frame_size
                - u64::from(block.in_frame_offset);

            if window_bytes < block_volume {
                return Err(Error::corrupt("block frame window is too small for a block"));
            }
        }

        // encode order: sorted by frame window, the windows must advance strictly
        // and may never end earlier than a window that started before them
        let mut windows: Vec<BlockIndex> = self.block_index.values().copied().collect();
        windows.sort_unstable();

        let advancing = windows.windows(2).all(|pair|
            pair[0] < pair[1] && pair[0].last_frame <= pair[1].last_frame
        );

        if !advancing {
            return Err(Error::corrupt("block windows do not advance in encode order"));
        }

        Ok(())
    }

    /// Write frame offsets, block index, and the trailer pointer
    /// at the current position of the writer, which must be the end of the body.
    pub fn write_trailer(
        write: &mut Tracking<impl Write>,
        frame_offsets: &[u64],
        block_index: &BlockIndexMap,
    ) -> UnitResult
    {
        let meta_offset = usize_to_u64(write.byte_position() - HEADER_BYTE_SIZE);

        u64::write_u64_sized_slice(write, frame_offsets)?;

        usize_to_u64(block_index.len()).write(write)?;
        for (&index, &block) in block_index {
            index.write(write)?;
            block.write(write)?;
        }

        meta_offset.write(write)?;
        Ok(())
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    fn example_header() -> Header {
        Header::new(
            Vec3(256, 256, 256), 6, 0,
            EncodeMethod::Raw, 2048 * 64 * 3 / 2
        ).unwrap()
    }

    #[test]
    fn header_derives_grid() {
        let header = example_header();
        assert_eq!(header.block_size, 64);
        assert_eq!(header.block_inner, 64);
        assert_eq!(header.grid_dim, Vec3(4, 4, 4));
        assert_eq!(header.adjusted_dim, Vec3(256, 256, 256));

        let padded = Header::new(Vec3(256, 256, 256), 6, 2, EncodeMethod::Raw, 1024).unwrap();
        assert_eq!(padded.block_inner, 60);
        assert_eq!(padded.grid_dim, Vec3(5, 5, 5));
        assert_eq!(padded.adjusted_dim, Vec3(320, 320, 320));
    }

    #[test]
    fn header_rejects_illegal_configurations() {
        assert!(matches!(
            Header::new(Vec3(0, 1, 1), 6, 0, EncodeMethod::Raw, 64),
            Err(Error::InvalidConfig(_))
        ));

        assert!(matches!(
            Header::new(Vec3(8, 8, 8), 4, 0, EncodeMethod::Raw, 64),
            Err(Error::InvalidConfig(_))
        ));

        assert!(matches!(
            Header::new(Vec3(8, 8, 8), 6, 3, EncodeMethod::Raw, 64),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn header_binary_roundtrip() {
        let header = example_header();

        let mut bytes = Vec::new();
        header.write(&mut bytes).unwrap();
        assert_eq!(bytes.len(), HEADER_BYTE_SIZE);

        let decoded = Header::read(&mut bytes.as_slice()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn header_read_detects_tampering() {
        let header = example_header();

        let mut bytes = Vec::new();
        header.write(&mut bytes).unwrap();

        // grid_dim.x lives right after version and raw_dim
        bytes[8 + 12] = 99;
        assert!(matches!(
            Header::read(&mut bytes.as_slice()),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn trailer_roundtrip() {
        let header = Header::new(Vec3(64, 64, 64), 6, 0, EncodeMethod::Raw, 1 << 16).unwrap();
        let block_volume = header.block_volume() as u64;
        let frame_size = header.frame_size as u64;

        // a single block spanning four whole frames
        let total_frames = (block_volume + frame_size - 1) / frame_size;
        assert_eq!(total_frames, 4);

        let mut block_index = BlockIndexMap::new();
        block_index.insert(
            Idx::new(0, 0, 0),
            BlockIndex { first_frame: 0, last_frame: total_frames as u32 - 1, in_frame_offset: 0 }
        );

        let mut frame_offsets = vec![0_u64];
        for frame in 0 .. total_frames {
            frame_offsets.push((frame + 1) * (frame_size + 4));
        }

        let mut write = Tracking::new(Cursor::new(Vec::<u8>::new()));
        header.write(&mut write).unwrap();
        std::io::copy(
            &mut std::io::repeat(0).take(*frame_offsets.last().unwrap()),
            &mut write
        ).unwrap();

        ArchiveMeta::write_trailer(&mut write, &frame_offsets, &block_index).unwrap();

        let mut cursor = write.into_inner();
        let meta = ArchiveMeta::read_from_buffered(&mut cursor).unwrap();

        assert_eq!(meta.header, header);
        assert_eq!(meta.frame_offsets, frame_offsets);
        assert_eq!(meta.block_index, block_index);
        assert_eq!(meta.frame_count() as u64, total_frames);
    }
}
