
//! Per-block quality statistics, for inspecting archives against their source.

use crate::archive::{clip_block_region, reposition_clipped};
use crate::archive::source::RawSource;
use crate::error::Result;
use crate::io::{Read, Seek};
use crate::meta::index::Idx;
use super::Unarchiver;


/// Basic statistics over the bytes of one channel of one block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelStatistics {

    /// Arithmetic mean of all byte values.
    pub average: f64,

    /// Smallest byte value.
    pub minimum: u8,

    /// Largest byte value.
    pub maximum: u8,
}

impl ChannelStatistics {

    /// Compute the statistics over the specified bytes.
    pub fn compute_from(bytes: &[u8]) -> Self {
        debug_assert!(!bytes.is_empty(), "statistics over an empty block");

        let mut minimum = u8::MAX;
        let mut maximum = u8::MIN;
        let mut sum = 0_u64;

        for &byte in bytes {
            minimum = minimum.min(byte);
            maximum = maximum.max(byte);
            sum += u64::from(byte);
        }

        ChannelStatistics {
            average: sum as f64 / bytes.len() as f64,
            minimum, maximum,
        }
    }
}


/// Statistics of one block: the decoded bytes, the original bytes,
/// and their elementwise absolute difference.
/// The latter two require a reference source volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockStatistics {

    /// Statistics over the decoded block bytes.
    pub decoded: ChannelStatistics,

    /// Statistics over the original padded block bytes.
    pub source: Option<ChannelStatistics>,

    /// Statistics over `|decoded - original|` per voxel.
    pub difference: Option<ChannelStatistics>,
}


/// Computes per-block statistics from an unarchiver
/// and an optional reference source volume.
#[derive(Debug)]
pub struct StatisticsCollector<'u, R, S> {
    unarchiver: &'u mut Unarchiver<R>,
    raw_source: Option<S>,

    decoded: Vec<u8>,
    clipped: Vec<u8>,
    original: Vec<u8>,
}

impl<'u, R, S> StatisticsCollector<'u, R, S>
    where R: Read + Seek, S: RawSource
{

    /// A collector without a reference volume only computes decoded statistics.
    pub fn new(unarchiver: &'u mut Unarchiver<R>, raw_source: Option<S>) -> Self {
        StatisticsCollector {
            unarchiver, raw_source,
            decoded: Vec::new(),
            clipped: Vec::new(),
            original: Vec::new(),
        }
    }

    /// Decode the specified block and compute its statistics.
    pub fn compute(&mut self, block: Idx) -> Result<BlockStatistics> {
        let header = self.unarchiver.header().clone();
        let block_volume = header.block_volume();

        self.decoded.resize(block_volume, 0);
        self.unarchiver.unarchive_into(block, &mut self.decoded)?;
        let decoded = ChannelStatistics::compute_from(&self.decoded);

        let (source, difference) = match &mut self.raw_source {
            None => (None, None),

            Some(raw_source) => {
                // reproduce the padded block exactly as the archiver built it
                let region = clip_block_region(&header, block);

                self.clipped.resize(region.size.volume(), 0);
                raw_source.read_region(region.origin, region.size, &mut self.clipped)?;

                self.original.resize(block_volume, 0);
                reposition_clipped(&region, &self.clipped, &mut self.original);

                let source = ChannelStatistics::compute_from(&self.original);

                let mut minimum = u8::MAX;
                let mut maximum = u8::MIN;
                let mut sum = 0_u64;

                for (&decoded, &original) in self.decoded.iter().zip(&self.original) {
                    let difference = if decoded > original { decoded - original }
                        else { original - decoded };

                    minimum = minimum.min(difference);
                    maximum = maximum.max(difference);
                    sum += u64::from(difference);
                }

                let difference = ChannelStatistics {
                    average: sum as f64 / block_volume as f64,
                    minimum, maximum,
                };

                (Some(source), Some(difference))
            }
        };

        Ok(BlockStatistics { decoded, source, difference })
    }
}
