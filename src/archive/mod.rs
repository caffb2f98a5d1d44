
//! Convert a raw voxel volume into a block-indexed, video-encoded archive.
//! Streams the volume in memory-budgeted strides, reshapes each stride into
//! padded cubic blocks, and feeds the blocks to the frame assembler in
//! strict grid order while recording where each block lands.

pub mod source;
pub mod assembler;

use std::sync::Arc;

use bit_field::BitField;

use crate::codec::{self, EncodeOptions, Encoder};
use crate::error::{Error, Result, UnitResult};
use crate::io::{Data, Write, Seek, Tracking};
use crate::math::{Vec3, RoundingMode};
use crate::meta::{ArchiveMeta, BlockIndexMap, Header, HEADER_BYTE_SIZE};
use crate::meta::index::Idx;
use self::assembler::{BlockSource, FrameAssembler};
use self::source::RawSource;


/// How to convert a volume into an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiverOptions {

    /// Binary logarithm of the block side length. Must be in `5 ..= 14`.
    pub log_block_size: usize,

    /// Overlap of adjacent blocks per face, in voxels. Must be in `0 ..= 2`.
    pub padding: usize,

    /// Soft limit for the scratch memory of the conversion, in bytes.
    /// Must hold at least two blocks.
    pub memory_limit: usize,

    /// Configuration of the encode side of the codec seam.
    pub encode: EncodeOptions,
}

impl ArchiverOptions {

    /// Options for the specified block configuration,
    /// with the reference frame dimensions for that block size.
    pub fn new(log_block_size: usize, padding: usize) -> Self {
        ArchiverOptions {
            log_block_size, padding,
            memory_limit: 1024 * 1024 * 1024,
            encode: EncodeOptions::for_block_size(crate::meta::EncodeMethod::Raw, log_block_size),
        }
    }
}

impl Default for ArchiverOptions {
    fn default() -> Self { Self::new(6, 2) }
}


/// What a finished conversion produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {

    /// Extent of the block grid.
    pub grid_dim: Vec3<usize>,

    /// Number of blocks written to the archive.
    pub block_count: usize,

    /// Number of encoded frames in the archive body.
    pub frame_count: usize,

    /// Byte size of the encoded body between header and trailer.
    pub body_byte_size: u64,
}


/// Drives the block-refinement pipeline: converts one raw volume
/// into one sealed archive, then is destroyed.
///
/// On success, `convert` seals the archive with trailer and header.
/// On error the sink is abandoned mid-body without a trailer pointer,
/// so readers reject the file instead of decoding half an archive.
pub struct Archiver<S, W> {
    raw_source: S,
    sink: W,
    header: Header,
    encoder: Box<dyn Encoder>,
    batch_frames: usize,
    memory_limit: usize,
}

impl<S, W> Archiver<S, W> where S: RawSource, W: Write + Seek + Send + 'static {

    /// An archiver using the built-in encoder backend for the configured method.
    pub fn new(raw_source: S, sink: W, options: ArchiverOptions) -> Result<Self> {
        let encoder = codec::encoder_for(&options.encode)?;
        Self::with_encoder(raw_source, sink, encoder, options)
    }

    /// An archiver using the specified external encoder backend.
    /// The header records the encode method of the options.
    pub fn with_encoder(
        raw_source: S, sink: W, encoder: Box<dyn Encoder>, options: ArchiverOptions,
    ) -> Result<Self>
    {
        let header = Header::new(
            raw_source.dimensions(),
            options.log_block_size,
            options.padding,
            options.encode.method,
            encoder.frame_size(),
        )?;

        Ok(Archiver {
            raw_source, sink, header, encoder,
            batch_frames: options.encode.batch_frames,
            memory_limit: options.memory_limit,
        })
    }

    /// The header this conversion will write.
    pub fn header(&self) -> &Header { &self.header }
}

impl<S, W> std::fmt::Debug for Archiver<S, W> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("Archiver")
            .field("header", &self.header)
            .field("memory_limit", &self.memory_limit)
            .finish()
    }
}

impl<S, W> Archiver<S, W> where S: RawSource, W: Write + Seek + Send + 'static {

    /// Convert the whole volume and seal the archive.
    pub fn convert(self) -> Result<ArchiveSummary> {
        self.convert_with_progress(|_| {})
    }

    /// Convert the whole volume and seal the archive, reporting the
    /// fraction of completed blocks. The callback is called with `0.0`
    /// at least once at the start, and `1.0` for the last block.
    pub fn convert_with_progress(self, mut on_progress: impl FnMut(f64)) -> Result<ArchiveSummary> {
        let Archiver { mut raw_source, sink, header, encoder, batch_frames, memory_limit } = self;

        // placeholder header, finalized after the trailer is complete
        let mut write = Tracking::new(sink);
        u8::write_slice(&mut write, &[0_u8; HEADER_BYTE_SIZE])?;

        let assembler = FrameAssembler::new(encoder, write, batch_frames);
        let mut block_index = BlockIndexMap::new();

        let strides = drive_strides(
            &mut raw_source, &header, memory_limit,
            &assembler, &mut block_index, &mut on_progress
        );

        // always join the worker; it latched the root cause of any codec error
        let finished = assembler.finish();

        let (mut write, frame_offsets) = match (strides, finished) {
            (Ok(()), Ok(writer_and_offsets)) => writer_and_offsets,
            (_, Err(worker_error)) => return Err(worker_error),
            (Err(stride_error), Ok(_)) => return Err(stride_error),
        };

        ArchiveMeta::write_trailer(&mut write, &frame_offsets, &block_index)?;

        write.seek_write_to(0)?;
        header.write(&mut write)?;
        write.flush()?; // catch delayed io errors before reporting success

        Ok(ArchiveSummary {
            grid_dim: header.grid_dim,
            block_count: block_index.len(),
            frame_count: frame_offsets.len() - 1,
            body_byte_size: *frame_offsets.last().expect("offset table starts at zero"),
        })
    }
}


/// How the block grid is cut into memory-budgeted strides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StridePlan {
    cols_per_stride: usize,
    rows_per_stride: usize,
    stride_repetitions: usize,
    row_iterations: usize,
    buffer_len: usize,
}

impl StridePlan {

    /// Two equal scratch buffers must fit into the memory limit.
    /// Prefers whole rows of the grid, falls back to partial rows.
    fn new(grid: Vec3<usize>, block_volume: usize, memory_limit: usize) -> Result<Self> {
        let block_pair = 2 * block_volume;
        let blocks_in_mem = memory_limit / block_pair;

        if blocks_in_mem == 0 {
            return Err(Error::InsufficientMemory { limit: memory_limit, required: block_pair });
        }

        let (cols_per_stride, rows_per_stride, stride_repetitions) = {
            if blocks_in_mem >= grid.0 {
                (grid.0, (blocks_in_mem / grid.0).min(grid.1), 1)
            }
            else {
                (blocks_in_mem, 1, RoundingMode::Up.divide(grid.0, blocks_in_mem))
            }
        };

        Ok(StridePlan {
            cols_per_stride, rows_per_stride, stride_repetitions,
            row_iterations: RoundingMode::Up.divide(grid.1, rows_per_stride),
            buffer_len: block_volume * cols_per_stride * rows_per_stride,
        })
    }

    #[cfg(test)]
    fn total_strides(&self, grid: Vec3<usize>) -> usize {
        self.row_iterations * self.stride_repetitions * grid.2
    }
}


// one bit per volume face, set when the padded region was clipped against it
const CLIP_LOW_BITS: [usize; 3] = [5, 3, 1];
const CLIP_HIGH_BITS: [usize; 3] = [4, 2, 0];

/// The raw-volume region covering one stride, clipped against the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StrideRegion {

    /// Origin of the clipped region, inside the volume.
    pub(crate) origin: Vec3<usize>,

    /// Extent of the clipped region.
    pub(crate) size: Vec3<usize>,

    /// The full padded footprint of the stride, before clipping.
    pub(crate) padded_size: Vec3<usize>,

    /// Where the clipped data starts inside the padded footprint.
    /// Nonzero only for faces clipped on the low side.
    pub(crate) shift: Vec3<usize>,

    /// Which faces were clipped.
    pub(crate) clipped_faces: u8,
}

/// The padded source region of a single block, clipped against the volume.
pub(crate) fn clip_block_region(header: &Header, block: Idx) -> StrideRegion {
    clip_stride_region(header, (block.x as usize, block.y as usize), (1, 1), block.z as usize)
}

fn clip_stride_region(
    header: &Header, stride_start: (usize, usize), stride_size: (usize, usize), z: usize,
) -> StrideRegion
{
    let inner = header.block_inner as i64;
    let padding = header.padding as i64;

    let raw = [
        header.raw_dim.0 as i64,
        header.raw_dim.1 as i64,
        header.raw_dim.2 as i64,
    ];

    // the padded region may stick out of the volume on all six faces
    let mut start = [
        stride_start.0 as i64 * inner - padding,
        stride_start.1 as i64 * inner - padding,
        z as i64 * inner - padding,
    ];

    let padded = [
        stride_size.0 as i64 * inner + 2 * padding,
        stride_size.1 as i64 * inner + 2 * padding,
        inner + 2 * padding,
    ];

    let mut size = padded;
    let mut clipped_faces = 0_u8;
    let mut shift = [0_i64; 3];

    for axis in 0 .. 3 {
        if start[axis] + size[axis] > raw[axis] {
            size[axis] = raw[axis] - start[axis];
            clipped_faces.set_bit(CLIP_HIGH_BITS[axis], true);
        }

        if start[axis] < 0 {
            size[axis] -= padding;
            start[axis] = 0;
            shift[axis] = padding;
            clipped_faces.set_bit(CLIP_LOW_BITS[axis], true);
        }
    }

    StrideRegion {
        origin: Vec3(start[0] as usize, start[1] as usize, start[2] as usize),
        size: Vec3(size[0] as usize, size[1] as usize, size[2] as usize),
        padded_size: Vec3(padded[0] as usize, padded[1] as usize, padded[2] as usize),
        shift: Vec3(shift[0] as usize, shift[1] as usize, shift[2] as usize),
        clipped_faces,
    }
}

/// Zero the padded footprint and copy the clipped data to its shifted
/// position, so that missing voxels outside the volume read as zero.
pub(crate) fn reposition_clipped(region: &StrideRegion, source: &[u8], dst: &mut [u8]) {
    let Vec3(padded_x, padded_y, _) = region.padded_size;
    let Vec3(size_x, size_y, size_z) = region.size;
    let Vec3(shift_x, shift_y, shift_z) = region.shift;

    for byte in &mut dst[.. region.padded_size.volume()] { *byte = 0; }

    for dep in 0 .. size_z {
        for row in 0 .. size_y {
            let dst_offset = (dep + shift_z) * padded_x * padded_y
                + (row + shift_y) * padded_x + shift_x;

            let src_offset = (dep * size_y + row) * size_x;

            dst[dst_offset .. dst_offset + size_x]
                .copy_from_slice(&source[src_offset .. src_offset + size_x]);
        }
    }
}

/// Extract one `block_size` cube from the padded stride region.
fn extract_block(
    region_bytes: &[u8], padded_size: Vec3<usize>,
    block_size: usize, block_inner: usize,
    block_x: usize, block_y: usize, dst: &mut [u8],
) {
    let row_stride = padded_size.0;
    let slice_stride = padded_size.0 * padded_size.1;
    let base = block_x * block_inner + block_y * block_inner * row_stride;

    for dep in 0 .. block_size {
        for row in 0 .. block_size {
            let src = base + dep * slice_stride + row * row_stride;
            let dst_start = (dep * block_size + row) * block_size;

            dst[dst_start .. dst_start + block_size]
                .copy_from_slice(&region_bytes[src .. src + block_size]);
        }
    }
}

fn drive_strides<S: RawSource, W: Write + Send + 'static>(
    raw_source: &mut S, header: &Header, memory_limit: usize,
    assembler: &FrameAssembler<W>, block_index: &mut BlockIndexMap,
    on_progress: &mut impl FnMut(f64),
) -> UnitResult
{
    let grid = header.grid_dim;
    let block_size = header.block_size;
    let block_inner = header.block_inner;
    let block_volume = header.block_volume();

    let plan = StridePlan::new(grid, block_volume, memory_limit)?;

    let mut read_buffer = vec![0_u8; plan.buffer_len];
    let mut write_buffer = vec![0_u8; plan.buffer_len];

    // block extraction is pure compute, fan it out when a pool is available
    let pool = rayon_core::ThreadPoolBuilder::new().build().ok();

    let total_blocks = grid.volume();
    let mut submitted_blocks = 0_usize;
    on_progress(0.0);

    for z in 0 .. grid.2 {
        for row_iteration in 0 .. plan.row_iterations {
            for repetition in 0 .. plan.stride_repetitions {
                let stride_start = (
                    repetition * plan.cols_per_stride,
                    row_iteration * plan.rows_per_stride,
                );

                let stride_size = (
                    (grid.0 - stride_start.0).min(plan.cols_per_stride),
                    (grid.1 - stride_start.1).min(plan.rows_per_stride),
                );

                let region = clip_stride_region(header, stride_start, stride_size, z);

                raw_source.read_region(
                    region.origin, region.size,
                    &mut read_buffer[.. region.size.volume()]
                )?;

                if region.clipped_faces != 0 {
                    reposition_clipped(&region, &read_buffer, &mut write_buffer);
                    std::mem::swap(&mut read_buffer, &mut write_buffer);
                }

                let stride_blocks = stride_size.0 * stride_size.1;
                let padded_size = region.padded_size;

                {
                    let region_bytes = &read_buffer[..];
                    let block_slots = write_buffer[.. stride_blocks * block_volume]
                        .chunks_mut(block_volume)
                        .enumerate();

                    match &pool {
                        Some(pool) => pool.scope(|scope| {
                            for (slot, block_bytes) in block_slots {
                                scope.spawn(move |_| extract_block(
                                    region_bytes, padded_size, block_size, block_inner,
                                    slot % stride_size.0, slot / stride_size.0, block_bytes
                                ));
                            }
                        }),

                        None => {
                            for (slot, block_bytes) in block_slots {
                                extract_block(
                                    region_bytes, padded_size, block_size, block_inner,
                                    slot % stride_size.0, slot / stride_size.0, block_bytes
                                );
                            }
                        }
                    }
                }

                // hand the blocks to the assembler in strict grid order
                let stride_buffer = Arc::new(std::mem::take(&mut write_buffer));

                for block_y in 0 .. stride_size.1 {
                    for block_x in 0 .. stride_size.0 {
                        let slot = block_y * stride_size.0 + block_x;
                        let start = slot * block_volume;

                        let window = assembler.accept(BlockSource::Shared(
                            Arc::clone(&stride_buffer),
                            start .. start + block_volume
                        ))?;

                        let coordinate = Idx::new(
                            (stride_start.0 + block_x) as u32,
                            (stride_start.1 + block_y) as u32,
                            z as u32,
                        );

                        let duplicate = block_index.insert(coordinate, window);
                        debug_assert!(duplicate.is_none(), "block emitted twice");

                        submitted_blocks += 1;
                        on_progress({
                            if submitted_blocks == total_blocks { 1.0 }
                            else { submitted_blocks as f64 / total_blocks as f64 }
                        });
                    }
                }

                // reclaim the stride buffer once the assembler
                // owns copies of everything still pending
                assembler.flush(false)?;
                write_buffer = Arc::try_unwrap(stride_buffer)
                    .expect("flushed stride buffer still shared");
            }
        }
    }

    Ok(())
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::meta::EncodeMethod;

    fn header(raw_dim: Vec3<usize>, log_block_size: usize, padding: usize) -> Header {
        Header::new(raw_dim, log_block_size, padding, EncodeMethod::Raw, 1024).unwrap()
    }

    #[test]
    fn stride_plan_prefers_whole_rows() {
        let grid = Vec3(4, 4, 4);
        let block_volume = 64 * 64 * 64;

        // room for two whole rows of four blocks
        let plan = StridePlan::new(grid, block_volume, 2 * 8 * block_volume).unwrap();
        assert_eq!(plan.cols_per_stride, 4);
        assert_eq!(plan.rows_per_stride, 2);
        assert_eq!(plan.stride_repetitions, 1);
        assert_eq!(plan.row_iterations, 2);
        assert_eq!(plan.total_strides(grid), 8);

        // room for three blocks only, partial rows
        let plan = StridePlan::new(grid, block_volume, 2 * 3 * block_volume).unwrap();
        assert_eq!(plan.cols_per_stride, 3);
        assert_eq!(plan.rows_per_stride, 1);
        assert_eq!(plan.stride_repetitions, 2);
        assert_eq!(plan.row_iterations, 4);
        assert_eq!(plan.total_strides(grid), 32);
    }

    #[test]
    fn stride_plan_rejects_tiny_memory_budgets() {
        let block_volume = 64 * 64 * 64;

        assert!(matches!(
            StridePlan::new(Vec3(4, 4, 4), block_volume, 2 * block_volume - 1),
            Err(Error::InsufficientMemory { .. })
        ));
    }

    #[test]
    fn unclipped_region_keeps_its_footprint() {
        let header = header(Vec3(320, 320, 320), 6, 2);
        assert_eq!(header.block_inner, 60);

        let region = clip_stride_region(&header, (1, 1), (2, 2), 1);
        assert_eq!(region.clipped_faces, 0);
        assert_eq!(region.origin, Vec3(58, 58, 58));
        assert_eq!(region.size, Vec3(124, 124, 64));
        assert_eq!(region.padded_size, region.size);
        assert_eq!(region.shift, Vec3(0, 0, 0));
    }

    #[test]
    fn corner_region_clips_low_faces() {
        let header = header(Vec3(320, 320, 320), 6, 2);

        let region = clip_stride_region(&header, (0, 0), (2, 2), 0);
        assert_eq!(region.clipped_faces, 0b10_10_10);
        assert_eq!(region.origin, Vec3(0, 0, 0));
        assert_eq!(region.size, Vec3(122, 122, 62));
        assert_eq!(region.padded_size, Vec3(124, 124, 64));
        assert_eq!(region.shift, Vec3(2, 2, 2));
    }

    #[test]
    fn far_corner_region_clips_high_faces() {
        // the grid overshoots the volume, so the last blocks clip high
        let header = header(Vec3(300, 300, 300), 6, 2);
        assert_eq!(header.grid_dim, Vec3(5, 5, 5));

        let region = clip_stride_region(&header, (3, 3), (2, 2), 4);
        assert_eq!(region.clipped_faces, 0b01_01_01);
        assert_eq!(region.origin, Vec3(178, 178, 238));
        assert_eq!(region.size, Vec3(122, 122, 62));
        assert_eq!(region.padded_size, Vec3(124, 124, 64));
        assert_eq!(region.shift, Vec3(0, 0, 0));
    }

    #[test]
    fn repositioning_lands_at_the_shift_offset() {
        let region = StrideRegion {
            origin: Vec3(0, 0, 0),
            size: Vec3(2, 2, 2),
            padded_size: Vec3(3, 3, 3),
            shift: Vec3(1, 1, 1),
            clipped_faces: 0b10_10_10,
        };

        let source: Vec<u8> = (1 ..= 8).collect();
        let mut dst = vec![0xff_u8; 27];
        reposition_clipped(&region, &source, &mut dst);

        let mut expected = vec![0_u8; 27];
        for dep in 0 .. 2 { for row in 0 .. 2 { for col in 0 .. 2 {
            expected[(dep + 1) * 9 + (row + 1) * 3 + col + 1] =
                (dep * 4 + row * 2 + col + 1) as u8;
        }}}

        assert_eq!(dst, expected);
    }

    #[test]
    fn extraction_reads_the_inner_offsets() {
        // a 2x2 stride of 2x2x2 blocks with inner size 2 (no padding)
        let padded = Vec3(4, 4, 2);
        let region: Vec<u8> = (0 .. padded.volume() as u8).collect();

        let mut block = vec![0_u8; 8];
        extract_block(&region, padded, 2, 2, 1, 1, &mut block);

        assert_eq!(block, vec![
            10, 11, 14, 15, // first slice, rows at y = 2, 3, x = 2, 3
            26, 27, 30, 31, // second slice
        ]);
    }
}
