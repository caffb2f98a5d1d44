
//! Region reads of the raw source volume.

use std::fs::File;
use std::io::{BufReader, SeekFrom};
use std::path::Path;

use crate::error::{Error, Result, UnitResult, usize_to_u64};
use crate::io::{Read, Seek};
use crate::math::Vec3;


/// Provides axis-aligned region reads of a voxel volume with one byte per voxel.
/// The x axis varies fastest in memory, then y, then z.
pub trait RawSource {

    /// Extent of the source volume in voxels.
    fn dimensions(&self) -> Vec3<usize>;

    /// Fill the destination with the voxels of the region, x varying fastest.
    /// The region must lie inside the volume,
    /// and the destination must hold exactly the region.
    fn read_region(&mut self, origin: Vec3<usize>, size: Vec3<usize>, dst: &mut [u8]) -> UnitResult;
}

/// Check the preconditions shared by all source implementations.
fn validate_region(
    dimensions: Vec3<usize>, origin: Vec3<usize>, size: Vec3<usize>, dst_len: usize,
) -> UnitResult
{
    let inside = origin.0 + size.0 <= dimensions.0
        && origin.1 + size.1 <= dimensions.1
        && origin.2 + size.2 <= dimensions.2;

    if !inside {
        return Err(Error::invalid_config("region outside the source volume"));
    }

    if dst_len != size.volume() {
        return Err(Error::InsufficientBuffer { required: size.volume(), actual: dst_len });
    }

    Ok(())
}


/// A voxel volume stored in a seekable byte stream, usually a raw file on disk.
#[derive(Debug)]
pub struct RawVolume<R> {
    reader: R,
    dimensions: Vec3<usize>,
}

impl RawVolume<BufReader<File>> {

    /// Open a raw voxel file of the specified dimensions.
    /// Fails when the file size does not match the volume.
    pub fn open(path: impl AsRef<Path>, dimensions: Vec3<usize>) -> Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();

        if file_len != usize_to_u64(dimensions.volume()) {
            return Err(Error::invalid_config("file size does not match the volume dimensions"));
        }

        Ok(Self::new(BufReader::new(file), dimensions))
    }
}

impl<R: Read + Seek> RawVolume<R> {

    /// Read voxels from the specified byte stream.
    /// The stream must contain exactly the volume, x varying fastest.
    pub fn new(reader: R, dimensions: Vec3<usize>) -> Self {
        RawVolume { reader, dimensions }
    }
}

impl<R: Read + Seek> RawSource for RawVolume<R> {

    fn dimensions(&self) -> Vec3<usize> { self.dimensions }

    fn read_region(&mut self, origin: Vec3<usize>, size: Vec3<usize>, dst: &mut [u8]) -> UnitResult {
        validate_region(self.dimensions, origin, size, dst.len())?;

        let Vec3(volume_x, volume_y, _) = self.dimensions;
        let row_len = size.0;

        // one seek and read per contiguous x row
        for z in 0 .. size.2 {
            for y in 0 .. size.1 {
                let source_offset =
                    ((origin.2 + z) * volume_y + origin.1 + y) * volume_x + origin.0;

                let row_start = (z * size.1 + y) * row_len;
                let row = &mut dst[row_start .. row_start + row_len];

                self.reader.seek(SeekFrom::Start(usize_to_u64(source_offset)))?;
                self.reader.read_exact(row)?;
            }
        }

        Ok(())
    }
}


/// A voxel volume kept in memory. Mainly useful for tests and small volumes.
#[derive(Debug, Clone)]
pub struct MemoryVolume {
    voxels: Vec<u8>,
    dimensions: Vec3<usize>,
}

impl MemoryVolume {

    /// A volume over the specified voxels, x varying fastest.
    /// Fails when the number of voxels does not match the dimensions.
    pub fn new(voxels: Vec<u8>, dimensions: Vec3<usize>) -> Result<Self> {
        if voxels.len() != dimensions.volume() {
            return Err(Error::invalid_config("voxel count does not match the volume dimensions"));
        }

        Ok(MemoryVolume { voxels, dimensions })
    }

    /// All voxels of this volume, x varying fastest.
    pub fn voxels(&self) -> &[u8] { &self.voxels }
}

impl RawSource for MemoryVolume {

    fn dimensions(&self) -> Vec3<usize> { self.dimensions }

    fn read_region(&mut self, origin: Vec3<usize>, size: Vec3<usize>, dst: &mut [u8]) -> UnitResult {
        validate_region(self.dimensions, origin, size, dst.len())?;

        let Vec3(volume_x, volume_y, _) = self.dimensions;
        let row_len = size.0;

        for z in 0 .. size.2 {
            for y in 0 .. size.1 {
                let source_offset =
                    ((origin.2 + z) * volume_y + origin.1 + y) * volume_x + origin.0;

                let row_start = (z * size.1 + y) * row_len;
                dst[row_start .. row_start + row_len]
                    .copy_from_slice(&self.voxels[source_offset .. source_offset + row_len]);
            }
        }

        Ok(())
    }
}
