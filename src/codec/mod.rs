
//! The narrow seam between the container and the video codec.
//! The codec consumes raw planar 4:2:0 frames and produces length-prefixed
//! packets, or the inverse. The container never inspects packet contents.

pub mod raw;

use crate::error::{Error, Result, UnitResult};
use crate::frame::default_frame_dimensions;
use crate::io::{Read, Write};
use crate::meta::{ChromaFormat, EncodeMethod};


/// Configuration of the encode side of the codec seam.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeOptions {

    /// Which codec encodes the frames.
    pub method: EncodeMethod,

    /// Width of the encoded frames in pixels.
    pub width: usize,

    /// Height of the luma plane of the encoded frames in pixels.
    pub height: usize,

    /// The encoder worker waits until this many frames are pending
    /// before invoking the codec.
    pub batch_frames: usize,
}

impl EncodeOptions {

    /// Options with the reference frame dimensions for the specified block size.
    pub fn for_block_size(method: EncodeMethod, log_block_size: usize) -> Self {
        let (width, height) = default_frame_dimensions(log_block_size);
        EncodeOptions { method, width, height, batch_frames: 16 }
    }

    /// The byte size of one raw 4:2:0 frame of these dimensions.
    pub fn frame_size(&self) -> usize {
        self.width * self.height * 3 / 2
    }

    /// Check that the dimensions are codec-legal.
    pub fn validate(&self) -> UnitResult {
        let legal = crate::frame::MIN_FRAME_DIMENSION ..= crate::frame::MAX_FRAME_DIMENSION;

        if !legal.contains(&self.width) || !legal.contains(&self.height) {
            return Err(Error::invalid_config("frame dimensions outside the codec-legal range"));
        }

        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(Error::invalid_config("4:2:0 frame dimensions must be even"));
        }

        if self.batch_frames == 0 {
            return Err(Error::invalid_config("batch must contain at least one frame"));
        }

        Ok(())
    }
}

impl Default for EncodeOptions {
    fn default() -> Self {
        EncodeOptions {
            method: EncodeMethod::Raw,
            width: 1024, height: 1024,
            batch_frames: 16,
        }
    }
}


/// Configuration of the decode side of the codec seam.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOptions {

    /// Number of decoded pictures that may be in flight at once.
    /// The backend may require more, in which case its requirement wins.
    pub io_queue_size: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        DecodeOptions { io_queue_size: 4 }
    }
}


/// Consumes raw planar frames and produces length-prefixed encoded packets.
/// One packet per frame: the packet of frame `i` starts
/// at the `i`-th entry of the archive's frame offset table.
pub trait Encoder: Send {

    /// The byte size of one raw frame this encoder consumes.
    fn frame_size(&self) -> usize;

    /// Encode exactly `frame_count` whole frames read from `frames`.
    /// Writes each packet as a `u32` byte length followed by the payload,
    /// and records each frame's total encoded byte length, prefix included.
    fn encode(
        &mut self, frames: &mut dyn Read, frame_count: usize,
        out: &mut dyn Write, frame_byte_lengths: &mut Vec<u32>,
    ) -> UnitResult;

    /// Emit any delayed frames the codec still buffers.
    /// Codecs without frame reordering have nothing to do here.
    fn finish(&mut self, out: &mut dyn Write, frame_byte_lengths: &mut Vec<u32>) -> UnitResult {
        let _ = (out, frame_byte_lengths);
        Ok(())
    }
}


/// The stream geometry a decode backend negotiated from the coded sequence header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceInfo {

    /// Width of the decoded frames in bytes.
    pub width: usize,

    /// Height of the luma plane of the decoded frames.
    pub luma_height: usize,

    /// Height of the coded surface, at least `luma_height`.
    /// When larger, the chroma plane starts below the luma plane padding.
    pub surface_height: usize,

    /// The chroma subsampling of the decoded surfaces.
    pub chroma: ChromaFormat,

    /// The minimum number of in-flight pictures the backend requires.
    pub required_slots: usize,
}

/// Receives the decode events of a backend. Implemented by the decoder driver.
pub trait DecodeSink {

    /// The sequence header was parsed. The sink allocates its picture slots
    /// and returns the slot count it will honor, at least `required_slots`.
    fn sequence(&mut self, info: SequenceInfo) -> Result<usize>;

    /// One picture finished decoding, in display order. Rows of the surface
    /// are `pitch` bytes apart. The sink takes ownership of the surface and
    /// returns the surface previously held by that slot for recycling.
    fn picture(&mut self, slot_index: usize, surface: Vec<u8>, pitch: usize)
        -> Result<Option<Vec<u8>>>;
}

/// Consumes length-prefixed packet payloads and emits decoded pictures
/// through a `DecodeSink`. Backends may buffer internally;
/// a `None` packet signals end of stream and drains all delayed pictures.
pub trait VideoDecoder: Send {

    /// Advance the decoder state with one packet payload, or drain with `None`.
    fn advance(&mut self, packet: Option<&[u8]>, sink: &mut dyn DecodeSink) -> UnitResult;
}


/// The encoder backend for the specified options.
/// External H.264/HEVC implementations plug in
/// through `Archiver::with_encoder` instead.
pub fn encoder_for(options: &EncodeOptions) -> Result<Box<dyn Encoder>> {
    options.validate()?;

    match options.method {
        EncodeMethod::Raw => Ok(Box::new(raw::RawEncoder::new(options.width, options.height))),

        EncodeMethod::H264 | EncodeMethod::Hevc =>
            Err(Error::unsupported("h264 and hevc need an external encoder backend")),
    }
}

/// The decoder backend for the specified encode method.
/// External H.264/HEVC implementations plug in
/// through `Unarchiver::with_decoder` instead.
pub fn decoder_for(method: EncodeMethod, _options: &DecodeOptions) -> Result<Box<dyn VideoDecoder>> {
    match method {
        EncodeMethod::Raw => Ok(Box::new(raw::RawDecoder::new())),

        EncodeMethod::H264 | EncodeMethod::Hevc =>
            Err(Error::unsupported("h264 and hevc need an external decoder backend")),
    }
}
