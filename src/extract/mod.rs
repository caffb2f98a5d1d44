
//! Read blocks back out of an archive: plan contiguous encoded runs
//! for a set of requested blocks, drive the decoder over them, and
//! scatter the decoded bytes into the callers' destination buffers.

pub mod driver;
pub mod stats;

use smallvec::SmallVec;

use crate::codec::{self, DecodeOptions, VideoDecoder};
use crate::error::{Error, Result, UnitResult, usize_to_u64};
use crate::frame::FrameLayout;
use crate::io::{ChainReader, Read, Seek, WindowReader, Windows};
use crate::math::Vec3;
use crate::meta::{ArchiveMeta, Header, HEADER_BYTE_SIZE};
use crate::meta::index::{BlockIndex, Idx};
use self::driver::{DecoderDriver, VoxelStreamPacket};


/// One requested block with its position in the virtual concatenation
/// of all decoded frames of its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PlannedBlock {
    id: Idx,
    linked_offset: u64,
}

/// The decode schedule for one batch of requested blocks: the blocks in
/// scatter order, and the contiguous byte ranges of the encoded body to feed
/// to the decoder. Blocks whose frame windows overlap share one run.
#[derive(Debug)]
struct ReadPlan {
    blocks: Vec<PlannedBlock>,
    runs: Windows,
}

impl ReadPlan {

    fn new(meta: &ArchiveMeta, requested: &[Idx]) -> Result<Self> {
        let mut lookups = SmallVec::<[(Idx, BlockIndex); 16]>::with_capacity(requested.len());

        for &id in requested {
            let entry = meta.block_index.get(&id).copied()
                .ok_or(Error::UnknownBlock(id))?;

            lookups.push((id, entry));
        }

        // scatter order: by frame window, grid coordinates break ties
        lookups.sort_unstable_by_key(|&(id, entry)| (entry, id));

        let layout = FrameLayout { frame_size: meta.header.frame_size };
        let mut blocks = Vec::with_capacity(lookups.len());
        let mut runs = Windows::new();

        let mut decoded_frames_before = 0_u64;
        let mut run_start = 0_usize;

        for position in 0 .. lookups.len() {
            let (id, entry) = lookups[position];
            let run_first_frame = lookups[run_start].1.first_frame;

            blocks.push(PlannedBlock {
                id,
                linked_offset: layout.linked_offset(decoded_frames_before, run_first_frame, entry),
            });

            // a run ends when the next block starts past the current frame window
            let run_ends = match lookups.get(position + 1) {
                Some(&(_, next)) => next.first_frame > entry.last_frame,
                None => true,
            };

            if run_ends {
                let begin = meta.frame_offsets[run_first_frame as usize];
                let end = meta.frame_offsets[entry.last_frame as usize + 1];

                runs.push((begin, end - begin));
                decoded_frames_before += u64::from(entry.last_frame - run_first_frame + 1);
                run_start = position + 1;
            }
        }

        Ok(ReadPlan { blocks, runs })
    }
}


/// Serves interleaved block requests from a sealed read-only archive.
#[derive(Debug)]
pub struct Unarchiver<R> {
    meta: ArchiveMeta,
    content: WindowReader<R>,
    driver: DecoderDriver,
}

impl<R: Read + Seek> Unarchiver<R> {

    /// Open an archive, reading header and trailer immediately.
    /// Uses the built-in decoder backend for the archive's encode method.
    /// Assumes the byte source is buffered.
    pub fn read_from_buffered(mut read: R, options: DecodeOptions) -> Result<Self> {
        let meta = ArchiveMeta::read_from_buffered(&mut read)?;
        let backend = codec::decoder_for(meta.header.encode_method, &options)?;
        Self::assemble(meta, read, backend, options)
    }

    /// Open an archive with an external decoder backend.
    pub fn with_decoder(
        mut read: R, backend: Box<dyn VideoDecoder>, options: DecodeOptions,
    ) -> Result<Self> {
        let meta = ArchiveMeta::read_from_buffered(&mut read)?;
        Self::assemble(meta, read, backend, options)
    }

    fn assemble(
        meta: ArchiveMeta, read: R, backend: Box<dyn VideoDecoder>, options: DecodeOptions,
    ) -> Result<Self> {
        let content = WindowReader::new(
            read, usize_to_u64(HEADER_BYTE_SIZE), meta.body_byte_size()
        )?;

        Ok(Unarchiver {
            meta, content,
            driver: DecoderDriver::new(backend, options),
        })
    }

    /// The complete meta data of the opened archive.
    pub fn meta(&self) -> &ArchiveMeta { &self.meta }

    /// The header of the opened archive.
    pub fn header(&self) -> &Header { &self.meta.header }

    /// Extent of the archived volume in voxels.
    pub fn raw_dim(&self) -> Vec3<usize> { self.meta.header.raw_dim }

    /// Extent of the block grid.
    pub fn grid_dim(&self) -> Vec3<usize> { self.meta.header.grid_dim }

    /// Side length of one block in voxels.
    pub fn block_size(&self) -> usize { self.meta.header.block_size }

    /// Side length of the non-padded block core in voxels.
    pub fn block_inner(&self) -> usize { self.meta.header.block_inner }

    /// Overlap of adjacent blocks per face, in voxels.
    pub fn padding(&self) -> usize { self.meta.header.padding }

    /// Byte size of one decoded frame.
    pub fn frame_size(&self) -> usize { self.meta.header.frame_size }

    /// Decode the requested blocks and hand each block's slices to the
    /// consumer, in sorted `(first_frame, in_frame_offset)` order: all
    /// slices of one block arrive in order before the next block begins.
    ///
    /// Unknown coordinates fail with `Error::UnknownBlock` before any
    /// decoding starts, and leave this unarchiver usable.
    pub fn batch_unarchive(
        &mut self, blocks: &[Idx],
        mut consumer: impl FnMut(Idx, &VoxelStreamPacket<'_, '_>) -> UnitResult,
    ) -> UnitResult
    {
        let plan = ReadPlan::new(&self.meta, blocks)?;
        if plan.blocks.is_empty() { return Ok(()); }

        let block_volume = usize_to_u64(self.meta.header.block_volume());
        let ReadPlan { blocks: planned, runs } = plan;

        let Unarchiver { content, driver, .. } = self;
        let encoded = ChainReader::new(&mut *content, runs)?;

        let mut current = 0_usize;
        let mut block_written = 0_u64;
        let mut linked_read_pos = 0_u64;

        driver.decode(encoded, |frame| {
            let frame_len = usize_to_u64(frame.byte_len());

            while current < planned.len() {
                let block = planned[current];

                let in_frame_offset = block.linked_offset as i64
                    + block_written as i64 - linked_read_pos as i64;

                // does this frame contain the next pending bytes of the block?
                let contained = in_frame_offset >= 0 && (in_frame_offset as u64) < frame_len;
                if !contained { break; }

                let available = frame_len - in_frame_offset as u64;
                let length = available.min(block_volume - block_written);

                let slice = VoxelStreamPacket::new(
                    frame,
                    in_frame_offset as usize,
                    block_written as usize,
                    length as usize,
                );

                consumer(block.id, &slice)?;
                block_written += length;

                if block_written < block_volume { break; }

                block_written = 0;
                current += 1;
            }

            linked_read_pos += frame_len;
            Ok(())
        })?;

        if current != planned.len() {
            return Err(Error::corrupt("stream ended before all requested blocks were decoded"));
        }

        Ok(())
    }

    /// Decode a single block into the destination buffer.
    /// The destination must hold at least one block; a shorter destination
    /// fails with `Error::InsufficientBuffer` before anything is written.
    /// Returns the number of bytes delivered, always one block volume.
    pub fn unarchive_into(&mut self, block: Idx, dst: &mut [u8]) -> Result<usize> {
        let required = self.meta.header.block_volume();

        if dst.len() < required {
            return Err(Error::InsufficientBuffer { required, actual: dst.len() });
        }

        let mut delivered = 0;
        self.batch_unarchive(&[block], |_, slice| {
            delivered += slice.length;
            slice.append_to(dst)
        })?;

        debug_assert_eq!(delivered, required, "block not fully delivered");
        Ok(delivered)
    }
}
