
//! Drives the asynchronous decode backend and surfaces it as a pull-push
//! pipeline: encoded packets go in, decoded frame packets come out,
//! with a bounded pool of in-flight pictures.

use crate::codec::{DecodeOptions, DecodeSink, SequenceInfo, VideoDecoder};
use crate::error::{Error, Result, UnitResult};
use crate::io::Read;


/// Coded dimensions above this are rejected as exceeding codec caps.
const MAX_CODED_DIMENSION: usize = 8192;


/// One entry of the picture pool. Holds the most recently displayed
/// surface of its picture index until the backend reuses the index.
#[derive(Debug, Default)]
struct Slot {
    surface: Option<MappedSurface>,
}

#[derive(Debug)]
struct MappedSurface {
    bytes: Vec<u8>,
    pitch: usize,
}

/// The stream geometry shared by all packets of one decode drive.
#[derive(Debug, Clone, Copy)]
struct StreamGeometry {
    width: usize,
    luma_height: usize,
    chroma_height: usize,
    surface_height: usize,
}


/// One decoded frame, handed to the consumer in display order.
/// Borrows the surface of its slot; the driver keeps the surface alive
/// until the slot is reused or the drive ends.
#[derive(Debug)]
pub struct FramePacket<'s> {
    surface: &'s [u8],
    pitch: usize,
    geometry: StreamGeometry,

    /// Index of this frame within the current decode drive, in display order.
    pub id: usize,
}

impl FramePacket<'_> {

    /// The number of decoded bytes this frame carries,
    /// width times the height of both planes.
    pub fn byte_len(&self) -> usize {
        self.geometry.width * (self.geometry.luma_height + self.geometry.chroma_height)
    }

    /// Copy `length` decoded bytes, starting at the decoded byte `offset`
    /// of this frame, to the start of the destination.
    ///
    /// Translates the flat offsets into pitched surface coordinates:
    /// a flat copy per plane where the pitch equals the width, otherwise
    /// a partial front row, a rectangle of whole rows, and a partial back row.
    pub fn copy_to(&self, dst: &mut [u8], offset: usize, length: usize) -> UnitResult {
        if dst.len() < length {
            return Err(Error::InsufficientBuffer { required: length, actual: dst.len() });
        }

        debug_assert!(offset + length <= self.byte_len(), "copy beyond the decoded frame");

        let geometry = self.geometry;
        let width = geometry.width;
        let pitch = self.pitch;

        // the luma plane, and the chroma plane below the coded surface.
        // a surface without coded padding rows is one contiguous rectangle.
        let mut rects = [
            (0_usize, geometry.luma_height),
            (pitch * geometry.surface_height, geometry.chroma_height),
        ];

        if geometry.surface_height == geometry.luma_height {
            rects[0].1 += geometry.chroma_height;
            rects[1].1 = 0;
        }

        let mut position = 0;
        let mut copied = 0;

        for &(rect_start, rect_height) in &rects {
            let rect_len = width * rect_height;

            let mut rect_offset = 0;
            if position < offset {
                let skip = (offset - position).min(rect_len);
                rect_offset = skip;
                position += skip;
            }

            let count = (rect_len - rect_offset).min(length - copied);
            if count == 0 { continue; }

            if pitch == width {
                let start = rect_start + rect_offset;
                dst[copied .. copied + count]
                    .copy_from_slice(&self.surface[start .. start + count]);
            }
            else {
                let first_whole_row = (rect_offset + width - 1) / width;
                let row_end = (rect_offset + count) / width;

                let front = (first_whole_row * width).min(rect_offset + count) - rect_offset;
                let back = (rect_offset + count).saturating_sub(row_end.max(first_whole_row) * width);

                if front != 0 {
                    let src = rect_start
                        + (rect_offset / width) * pitch + rect_offset % width;

                    dst[copied .. copied + front]
                        .copy_from_slice(&self.surface[src .. src + front]);
                }

                let mut row_dst = copied + front;
                for row in first_whole_row .. row_end {
                    let src = rect_start + row * pitch;
                    dst[row_dst .. row_dst + width]
                        .copy_from_slice(&self.surface[src .. src + width]);
                    row_dst += width;
                }

                if back != 0 {
                    let src = rect_start + row_end * pitch;
                    dst[row_dst .. row_dst + back]
                        .copy_from_slice(&self.surface[src .. src + back]);
                }
            }

            position += count;
            copied += count;
        }

        debug_assert_eq!(copied, length, "pitched copy accounting bug");
        Ok(())
    }
}


/// A slice of one decoded frame belonging to a single block.
#[derive(Debug)]
pub struct VoxelStreamPacket<'p, 's> {
    frame: &'p FramePacket<'s>,

    /// Byte offset of the slice inside the decoded frame.
    pub in_frame_offset: usize,

    /// Byte offset inside the destination block where this slice belongs.
    pub dst_offset: usize,

    /// Byte length of the slice.
    pub length: usize,
}

impl<'p, 's> VoxelStreamPacket<'p, 's> {

    pub(crate) fn new(
        frame: &'p FramePacket<'s>, in_frame_offset: usize, dst_offset: usize, length: usize,
    ) -> Self {
        VoxelStreamPacket { frame, in_frame_offset, dst_offset, length }
    }

    /// Copy this slice to its destination offset inside the block buffer.
    /// The whole destination block buffer is passed, not just the slice.
    pub fn append_to(&self, block_buffer: &mut [u8]) -> UnitResult {
        let required = self.dst_offset + self.length;

        if block_buffer.len() < required {
            return Err(Error::InsufficientBuffer { required, actual: block_buffer.len() });
        }

        self.frame.copy_to(
            &mut block_buffer[self.dst_offset .. required],
            self.in_frame_offset, self.length
        )
    }
}


/// Owns the decode backend and its picture pool for one archive.
pub struct DecoderDriver {
    backend: Box<dyn VideoDecoder>,
    slots: Vec<Slot>,
    geometry: Option<StreamGeometry>,
    io_queue_size: usize,
}

impl DecoderDriver {

    /// A driver with the specified backend.
    /// Slots are allocated when the backend reports the sequence header.
    pub fn new(backend: Box<dyn VideoDecoder>, options: DecodeOptions) -> Self {
        DecoderDriver {
            backend,
            slots: Vec::new(),
            geometry: None,
            io_queue_size: options.io_queue_size.max(1),
        }
    }

    /// Feed all length-prefixed packets of the input to the backend and
    /// invoke the consumer once per decoded frame, in display order.
    /// Consumers must return promptly and never block on unrelated work.
    pub fn decode(
        &mut self, mut input: impl Read,
        mut consumer: impl FnMut(&FramePacket<'_>) -> UnitResult,
    ) -> UnitResult
    {
        let mut packet = Vec::new();
        let mut packet_id = 0;

        let result = loop {
            let packet_len = match read_packet_len(&mut input) {
                Ok(Some(len)) => len,
                Ok(None) => break Ok(()),
                Err(error) => break Err(error),
            };

            packet.resize(packet_len, 0);
            if let Err(error) = input.read_exact(&mut packet) {
                break Err(Error::corrupt(format!("truncated packet: {}", error)));
            }

            if let Err(error) = self.advance(Some(packet.as_slice()), &mut packet_id, &mut consumer) {
                break Err(error);
            }
        };

        // cooperative teardown: drain the backend, then release every slot
        let drained = self.advance(None, &mut packet_id, &mut consumer);
        for slot in &mut self.slots { slot.surface = None; }

        result.and(drained)
    }

    fn advance(
        &mut self, packet: Option<&[u8]>, packet_id: &mut usize,
        consumer: &mut impl FnMut(&FramePacket<'_>) -> UnitResult,
    ) -> UnitResult
    {
        let DecoderDriver { backend, slots, geometry, io_queue_size } = self;

        backend.advance(packet, &mut DriverSink {
            slots, geometry,
            io_queue_size: *io_queue_size,
            packet_id, consumer,
        })
    }
}

impl std::fmt::Debug for DecoderDriver {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("DecoderDriver")
            .field("slots", &self.slots.len())
            .field("io_queue_size", &self.io_queue_size)
            .finish()
    }
}

/// The length prefix of the next packet, or `None` at a clean end of stream.
fn read_packet_len(input: &mut impl Read) -> Result<Option<usize>> {
    let mut prefix = [0_u8; 4];
    let mut filled = 0;

    while filled < prefix.len() {
        let count = input.read(&mut prefix[filled ..])?;

        if count == 0 {
            if filled == 0 { return Ok(None); }
            return Err(Error::corrupt("truncated packet length prefix"));
        }

        filled += count;
    }

    Ok(Some(u32::from_le_bytes(prefix) as usize))
}


struct DriverSink<'d, F> {
    slots: &'d mut Vec<Slot>,
    geometry: &'d mut Option<StreamGeometry>,
    io_queue_size: usize,
    packet_id: &'d mut usize,
    consumer: &'d mut F,
}

impl<F> DecodeSink for DriverSink<'_, F>
    where F: FnMut(&FramePacket<'_>) -> UnitResult
{
    fn sequence(&mut self, info: SequenceInfo) -> Result<usize> {
        if info.width == 0 || info.luma_height == 0 {
            return Err(Error::unsupported("empty coded frames"));
        }

        if info.width > MAX_CODED_DIMENSION || info.luma_height > MAX_CODED_DIMENSION {
            return Err(Error::unsupported("resolution exceeds codec caps"));
        }

        if info.surface_height < info.luma_height {
            return Err(Error::unsupported("coded surface smaller than the frame"));
        }

        let chroma_height = info.chroma.chroma_height(info.luma_height)
            .ok_or_else(|| Error::unsupported("stream without a chroma plane"))?;

        // the backend requirement always wins over the configured queue size
        let slot_count = self.io_queue_size.max(info.required_slots);
        self.slots.clear();
        self.slots.resize_with(slot_count, Slot::default);

        *self.geometry = Some(StreamGeometry {
            width: info.width,
            luma_height: info.luma_height,
            chroma_height,
            surface_height: info.surface_height,
        });

        Ok(slot_count)
    }

    fn picture(&mut self, slot_index: usize, surface: Vec<u8>, pitch: usize)
        -> Result<Option<Vec<u8>>>
    {
        let geometry = self.geometry
            .ok_or_else(|| Error::corrupt("picture displayed before any sequence header"))?;

        let slot = self.slots.get_mut(slot_index)
            .ok_or_else(|| Error::corrupt("picture index outside the slot pool"))?;

        if pitch < geometry.width {
            return Err(Error::corrupt("surface pitch smaller than the frame width"));
        }

        let required = pitch * (geometry.surface_height + geometry.chroma_height);
        if surface.len() < required {
            return Err(Error::corrupt("decoded surface is too small for its planes"));
        }

        // release the previous picture of this index, install the new one
        let previous = slot.surface.take().map(|mapped| mapped.bytes);
        slot.surface = Some(MappedSurface { bytes: surface, pitch });

        let mapped = slot.surface.as_ref().expect("slot installed above");
        let packet = FramePacket {
            surface: &mapped.bytes,
            pitch: mapped.pitch,
            geometry,
            id: *self.packet_id,
        };

        *self.packet_id += 1;
        (self.consumer)(&packet)?;

        Ok(previous)
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::raw::{RawDecoder, RawEncoder};
    use crate::codec::Encoder;

    fn flat_geometry(width: usize, luma_height: usize) -> StreamGeometry {
        StreamGeometry {
            width, luma_height,
            chroma_height: luma_height / 2,
            surface_height: luma_height,
        }
    }

    #[test]
    fn pitched_copies_match_the_flat_layout() {
        let width = 16;
        let luma_height = 8;
        let pitch = 24;
        let geometry = flat_geometry(width, luma_height);

        let frame_len = width * (luma_height + geometry.chroma_height);
        let flat: Vec<u8> = (0 .. frame_len).map(|byte| byte as u8).collect();

        // spread the flat frame over pitched rows
        let rows = luma_height + geometry.chroma_height;
        let mut surface = vec![0_u8; pitch * rows];
        for row in 0 .. rows {
            surface[row * pitch .. row * pitch + width]
                .copy_from_slice(&flat[row * width .. (row + 1) * width]);
        }

        let packet = FramePacket { surface: &surface, pitch, geometry, id: 0 };
        assert_eq!(packet.byte_len(), frame_len);

        // all offset and length combinations against the flat reference
        for offset in [0, 1, width - 1, width, width + 3, frame_len - 1] {
            for length in [1, width - 1, width, 3 * width + 7, frame_len - offset] {
                if offset + length > frame_len { continue; }

                let mut copied = vec![0_u8; length];
                packet.copy_to(&mut copied, offset, length).unwrap();
                assert_eq!(copied, &flat[offset .. offset + length], "at offset {}", offset);
            }
        }
    }

    #[test]
    fn copy_rejects_short_destinations() {
        let geometry = flat_geometry(16, 8);
        let surface = vec![0_u8; 16 * 12];
        let packet = FramePacket { surface: &surface, pitch: 16, geometry, id: 0 };

        let mut small = vec![0_u8; 9];
        assert!(matches!(
            packet.copy_to(&mut small, 0, 10),
            Err(Error::InsufficientBuffer { required: 10, actual: 9 })
        ));
    }

    #[test]
    fn driver_replays_an_encoded_stream() {
        let mut encoder = RawEncoder::new(64, 64);
        let frame_size = encoder.frame_size();

        let frames: Vec<u8> = (0 .. frame_size * 3).map(|byte| (byte % 251) as u8).collect();
        let mut encoded = Vec::new();
        let mut lengths = Vec::new();
        encoder.encode(&mut frames.as_slice(), 3, &mut encoded, &mut lengths).unwrap();

        // decode with a pitch that differs from the width
        let backend = RawDecoder::with_pitch_alignment(256);
        let mut driver = DecoderDriver::new(Box::new(backend), DecodeOptions::default());

        let mut decoded = Vec::new();
        driver.decode(encoded.as_slice(), |packet| {
            assert_eq!(packet.byte_len(), frame_size);
            assert_eq!(packet.id, decoded.len() / frame_size);

            let start = decoded.len();
            decoded.resize(start + frame_size, 0);
            packet.copy_to(&mut decoded[start ..], 0, frame_size)
        }).unwrap();

        assert_eq!(decoded, frames);
    }
}
