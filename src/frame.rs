
//! The bi-directional mapping between block bytes and frame bytes.
//! This math underlies both encode batching and decode scatter:
//! blocks are appended to one logical byte stream, and that stream
//! is cut into fixed-size frames for the video codec.

use std::convert::TryFrom;

use crate::error::{Error, Result, usize_to_u64};
use crate::meta::index::BlockIndex;


/// Frame dimensions are kept inside this range,
/// as larger surfaces exceed common codec level limits.
pub const MIN_FRAME_DIMENSION: usize = 64;

/// See `MIN_FRAME_DIMENSION`.
pub const MAX_FRAME_DIMENSION: usize = 4096;


/// Positions block byte streams inside the sequence of fixed-size frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {

    /// The byte size of one decoded frame.
    pub frame_size: usize,
}

impl FrameLayout {

    /// The layout for frames of the specified dimensions,
    /// with a chroma plane of half the luma height.
    pub fn for_dimensions(width: usize, height: usize) -> Self {
        FrameLayout { frame_size: width * height * 3 / 2 }
    }

    /// Where a block of `block_len` bytes lands when appended to the logical
    /// stream, given the frames already handed to the codec and the bytes
    /// still pending in front of the block. Pure arithmetic, no codec work.
    pub fn block_window(
        &self, emitted_frames: u64, pending_bytes: u64, block_len: u64,
    ) -> Result<BlockIndex>
    {
        let frame_size = usize_to_u64(self.frame_size);

        let first_frame = emitted_frames + pending_bytes / frame_size;
        let in_frame_offset = pending_bytes % frame_size;

        let stream_end = pending_bytes + block_len;
        let last_frame = emitted_frames + (stream_end + frame_size - 1) / frame_size - 1;

        let to_u32 = |value: u64| u32::try_from(value)
            .map_err(|_| Error::invalid_config("volume exceeds 32 bit frame addressing"));

        Ok(BlockIndex {
            first_frame: to_u32(first_frame)?,
            last_frame: to_u32(last_frame)?,
            in_frame_offset: to_u32(in_frame_offset)?,
        })
    }

    /// The position of a block inside the virtual concatenation of all
    /// decoded frames of its run: full frames already consumed by earlier
    /// runs and earlier frames of this run, plus the offset inside its first frame.
    pub fn linked_offset(
        &self, decoded_frames_before: u64, run_first_frame: u32, block: BlockIndex,
    ) -> u64
    {
        let frames_before_block =
            decoded_frames_before + u64::from(block.first_frame - run_first_frame);

        frames_before_block * usize_to_u64(self.frame_size) + u64::from(block.in_frame_offset)
    }
}


/// The reference frame dimensions for a block size:
/// one frame holds three quarters of a block where possible,
/// clamped into the codec-legal range.
pub fn default_frame_dimensions(log_block_size: usize) -> (usize, usize) {
    let block_size = 1_usize << log_block_size;

    let width = (block_size * block_size / 2)
        .max(MIN_FRAME_DIMENSION).min(MAX_FRAME_DIMENSION);

    let height = block_size
        .max(MIN_FRAME_DIMENSION).min(MAX_FRAME_DIMENSION);

    (width, height)
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn windows_of_sequentially_accepted_blocks() {
        let layout = FrameLayout { frame_size: 100 };

        // first block fills two and a half frames
        let first = layout.block_window(0, 0, 250).unwrap();
        assert_eq!(first, BlockIndex { first_frame: 0, last_frame: 2, in_frame_offset: 0 });

        // second block begins in the middle of the third frame
        let second = layout.block_window(0, 250, 250).unwrap();
        assert_eq!(second, BlockIndex { first_frame: 2, last_frame: 4, in_frame_offset: 50 });

        // after the codec consumed the first four frames, the formulas still agree
        let third = layout.block_window(4, 100, 100).unwrap();
        assert_eq!(third, BlockIndex { first_frame: 5, last_frame: 5, in_frame_offset: 0 });
    }

    #[test]
    fn window_covers_the_whole_block() {
        let mut random_state = 0x9e3779b97f4a7c15_u64;
        let mut next_random = move || {
            random_state ^= random_state << 13;
            random_state ^= random_state >> 7;
            random_state ^= random_state << 17;
            random_state
        };

        for _ in 0 .. 1000 {
            let layout = FrameLayout { frame_size: (next_random() % 5000 + 1) as usize };
            let emitted = next_random() % 1000;
            let pending = next_random() % (layout.frame_size as u64 * 4);
            let block_len = next_random() % 100_000 + 1;

            let window = layout.block_window(emitted, pending, block_len).unwrap();
            let frame_size = layout.frame_size as u64;

            assert!(u64::from(window.in_frame_offset) < frame_size);
            assert!(window.first_frame <= window.last_frame);

            // the claimed frame window must contain all bytes of the block
            let window_bytes = u64::from(window.frame_span()) * frame_size
                - u64::from(window.in_frame_offset);
            assert!(window_bytes >= block_len);

            // and the window must not claim a whole frame too much
            assert!(window_bytes - block_len < frame_size);
        }
    }

    #[test]
    fn linked_offsets_advance_with_the_run() {
        let layout = FrameLayout { frame_size: 100 };

        let block = BlockIndex { first_frame: 4, last_frame: 6, in_frame_offset: 30 };
        assert_eq!(layout.linked_offset(0, 4, block), 30);
        assert_eq!(layout.linked_offset(0, 3, block), 130);
        assert_eq!(layout.linked_offset(7, 4, block), 730);
    }

    #[test]
    fn reference_dimensions_are_codec_legal() {
        for log_block_size in 5 ..= 14 {
            let (width, height) = default_frame_dimensions(log_block_size);
            assert!((MIN_FRAME_DIMENSION ..= MAX_FRAME_DIMENSION).contains(&width));
            assert!((MIN_FRAME_DIMENSION ..= MAX_FRAME_DIMENSION).contains(&height));
            assert_eq!(width * height * 3 % 2, 0);
        }

        assert_eq!(default_frame_dimensions(6), (2048, 64));
    }
}
