
//! The built-in reference backend. Stores each frame verbatim in one packet.
//! Every packet carries a small in-band sequence header, so the decode side
//! negotiates the stream geometry from the bitstream alone and can start
//! decoding at any frame boundary, like an intra-only elementary stream
//! with repeated parameter sets.

use std::convert::TryFrom;

use crate::error::{Error, Result, UnitResult, usize_to_u64};
use crate::io::{Data, Read, Write, ZeroPaddedReader};
use crate::meta::ChromaFormat;
use super::{Encoder, DecodeSink, SequenceInfo, VideoDecoder};


/// Identifies the in-band sequence header at the start of every packet.
const SEQUENCE_MAGIC: [u8; 4] = *b"rvs1";

/// Magic, width, height, chroma code, four bytes each.
const SEQUENCE_HEADER_SIZE: usize = 16;


/// Packetizes raw frames without touching their bytes.
#[derive(Debug)]
pub struct RawEncoder {
    width: usize,
    height: usize,
    frame: Vec<u8>,
}

impl RawEncoder {

    /// An encoder for frames of the specified luma dimensions.
    pub fn new(width: usize, height: usize) -> Self {
        RawEncoder { width, height, frame: Vec::new() }
    }

    /// Encode all bytes of the reader, zero-extending the final partial frame.
    /// Convenience for encoding outside of an archiver pipeline.
    pub fn encode_all(
        &mut self, frames: &mut (impl Read + ?Sized), byte_count: u64,
        out: &mut impl Write, frame_byte_lengths: &mut Vec<u32>,
    ) -> UnitResult
    {
        let frame_size = usize_to_u64(self.frame_size());
        let frame_count = (byte_count + frame_size - 1) / frame_size;

        let mut padded = ZeroPaddedReader::new(frames, frame_count * frame_size);
        self.encode(&mut padded, frame_count as usize, out, frame_byte_lengths)
    }
}

impl Encoder for RawEncoder {

    fn frame_size(&self) -> usize {
        self.width * self.height * 3 / 2
    }

    fn encode(
        &mut self, mut frames: &mut dyn Read, frame_count: usize,
        mut out: &mut dyn Write, frame_byte_lengths: &mut Vec<u32>,
    ) -> UnitResult
    {
        let frame_size = self.frame_size();

        let payload_len = u32::try_from(SEQUENCE_HEADER_SIZE + frame_size)
            .map_err(|_| Error::codec("frame does not fit into one packet"))?;

        for _ in 0 .. frame_count {
            self.frame.resize(frame_size, 0);
            u8::read_slice(&mut frames, &mut self.frame)?;

            payload_len.write(&mut out)?;

            u8::write_slice(&mut out, &SEQUENCE_MAGIC)?;
            u32::try_from(self.width).expect("frame width bug").write(&mut out)?;
            u32::try_from(self.height).expect("frame height bug").write(&mut out)?;
            (ChromaFormat::Yuv420.to_u64() as u32).write(&mut out)?;

            u8::write_slice(&mut out, &self.frame)?;
            frame_byte_lengths.push(u32::BYTE_SIZE as u32 + payload_len);
        }

        Ok(())
    }
}


/// Decodes the packets of a `RawEncoder` into pitched picture surfaces.
#[derive(Debug)]
pub struct RawDecoder {
    geometry: Option<RawStreamGeometry>,
    free_surfaces: Vec<Vec<u8>>,
    slot_count: usize,
    next_slot: usize,
    pitch_alignment: usize,
}

#[derive(Debug, Clone, Copy)]
struct RawStreamGeometry {
    width: usize,
    luma_height: usize,
    total_rows: usize,
    pitch: usize,
}

impl RawDecoder {

    /// A decoder emitting surfaces whose pitch equals the frame width.
    pub fn new() -> Self {
        Self::with_pitch_alignment(1)
    }

    /// A decoder emitting surfaces whose row pitch is rounded up to
    /// a multiple of the specified alignment. Exercises the pitched copy
    /// path that decoded device surfaces of hardware decoders take.
    pub fn with_pitch_alignment(pitch_alignment: usize) -> Self {
        debug_assert_ne!(pitch_alignment, 0, "zero pitch alignment");

        RawDecoder {
            geometry: None,
            free_surfaces: Vec::new(),
            slot_count: 0,
            next_slot: 0,
            pitch_alignment: pitch_alignment.max(1),
        }
    }

    /// Every packet repeats the sequence header. The first one negotiates
    /// the stream geometry with the sink, later ones are only verified.
    fn parse_sequence_header(&mut self, packet: &[u8], sink: &mut dyn DecodeSink) -> Result<()> {
        if packet.len() < SEQUENCE_HEADER_SIZE || packet[.. 4] != SEQUENCE_MAGIC {
            return Err(Error::corrupt("missing packet sequence header"));
        }

        let mut fields = &packet[4 ..];
        let width = u32::read(&mut fields)? as usize;
        let luma_height = u32::read(&mut fields)? as usize;
        let chroma = ChromaFormat::from_u64(u64::from(u32::read(&mut fields)?))?;

        if let Some(geometry) = self.geometry {
            if geometry.width != width || geometry.luma_height != luma_height {
                return Err(Error::corrupt("frame geometry changed mid-stream"));
            }

            return Ok(());
        }

        let chroma_height = chroma.chroma_height(luma_height)
            .ok_or_else(|| Error::unsupported("stream without a chroma plane"))?;

        let slot_count = sink.sequence(SequenceInfo {
            width, luma_height,
            surface_height: luma_height,
            chroma,
            required_slots: 1,
        })?;

        let pitch = (width + self.pitch_alignment - 1)
            / self.pitch_alignment * self.pitch_alignment;

        self.geometry = Some(RawStreamGeometry {
            width, luma_height,
            total_rows: luma_height + chroma_height,
            pitch,
        });

        self.slot_count = slot_count;
        self.next_slot = 0;
        Ok(())
    }
}

impl Default for RawDecoder {
    fn default() -> Self { Self::new() }
}

impl VideoDecoder for RawDecoder {

    fn advance(&mut self, packet: Option<&[u8]>, sink: &mut dyn DecodeSink) -> UnitResult {
        let packet = match packet {
            Some(packet) => packet,

            // this backend buffers no pictures, end of stream drains nothing
            None => return Ok(()),
        };

        self.parse_sequence_header(packet, sink)?;

        let geometry = self.geometry.expect("sequence header bug");
        let payload = &packet[SEQUENCE_HEADER_SIZE ..];

        if payload.len() != geometry.width * geometry.total_rows {
            return Err(Error::corrupt("encoded packet is not one whole frame"));
        }

        // lay the frame rows out with the negotiated surface pitch
        let mut surface = self.free_surfaces.pop().unwrap_or_default();
        surface.clear();
        surface.resize(geometry.pitch * geometry.total_rows, 0);

        for row in 0 .. geometry.total_rows {
            surface[row * geometry.pitch .. row * geometry.pitch + geometry.width]
                .copy_from_slice(&payload[row * geometry.width .. (row + 1) * geometry.width]);
        }

        let slot = self.next_slot;
        self.next_slot = (self.next_slot + 1) % self.slot_count.max(1);

        if let Some(recycled) = sink.picture(slot, surface, geometry.pitch)? {
            self.free_surfaces.push(recycled);
        }

        Ok(())
    }
}
