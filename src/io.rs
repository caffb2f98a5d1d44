
//! Specialized binary input and output.
//! Uses the error handling for this crate.

pub use ::std::io::{Read, Write, Seek};

use std::io::SeekFrom;
use lebe::prelude::*;
use smallvec::SmallVec;
use crate::error::{Result, UnitResult, IoResult, usize_to_u64, u64_to_usize};


/// Keeps track of how many bytes were read or written, in order to provide
/// a cheap `byte_position` without calling expensive seek operations.
#[derive(Debug)]
pub struct Tracking<T> {

    /// The byte reader or writer whose position is tracked.
    inner: T,

    position: usize,
}

impl<T> Tracking<T> {

    /// Create a new tracking reader or writer. The inner position is assumed to be zero.
    pub fn new(inner: T) -> Self {
        Tracking { inner, position: 0 }
    }

    /// The number of bytes that have been read or written so far.
    pub fn byte_position(&self) -> usize {
        self.position
    }

    /// Put the reader or writer back into the caller's hands.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: Read> Read for Tracking<T> {
    fn read(&mut self, buffer: &mut [u8]) -> IoResult<usize> {
        let count = self.inner.read(buffer)?;
        self.position += count;
        Ok(count)
    }
}

impl<T: Write> Write for Tracking<T> {
    fn write(&mut self, buffer: &[u8]) -> IoResult<usize> {
        let count = self.inner.write(buffer)?;
        self.position += count;
        Ok(count)
    }

    fn flush(&mut self) -> IoResult<()> {
        self.inner.flush()
    }
}

impl<T: Write + Seek> Tracking<T> {

    /// Move the writing cursor to the specified target byte index.
    /// Seeking before the start of the stream is an error.
    pub fn seek_write_to(&mut self, target_position: usize) -> IoResult<()> {
        self.inner.seek(SeekFrom::Start(usize_to_u64(target_position)))?;
        self.position = target_position;
        Ok(())
    }
}


/// A read-only view into a sub range of a seekable byte source.
/// All positions are relative to the start of the window.
#[derive(Debug)]
pub struct WindowReader<R> {
    inner: R,
    start: u64,
    len: u64,
    position: u64,
}

impl<R: Read + Seek> WindowReader<R> {

    /// Create a view of the byte range `start .. start + len` of the inner reader.
    /// Seeks the inner reader to the start of the window.
    pub fn new(mut inner: R, start: u64, len: u64) -> IoResult<Self> {
        inner.seek(SeekFrom::Start(start))?;
        Ok(WindowReader { inner, start, len, position: 0 })
    }

    /// The number of bytes in this window.
    pub fn byte_len(&self) -> u64 { self.len }
}

impl<R: Read + Seek> Read for WindowReader<R> {
    fn read(&mut self, buffer: &mut [u8]) -> IoResult<usize> {
        let remaining = self.len.saturating_sub(self.position);
        let max = u64_to_usize(remaining.min(usize_to_u64(buffer.len())));
        if max == 0 { return Ok(0); }

        let count = self.inner.read(&mut buffer[..max])?;
        self.position += usize_to_u64(count);
        Ok(count)
    }
}

impl<R: Read + Seek> Seek for WindowReader<R> {
    fn seek(&mut self, target: SeekFrom) -> IoResult<u64> {
        let target_position = match target {
            SeekFrom::Start(position) => position as i64,
            SeekFrom::Current(offset) => self.position as i64 + offset,
            SeekFrom::End(offset) => self.len as i64 + offset,
        };

        if target_position < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "cannot seek before the start of the window"
            ));
        }

        self.position = target_position as u64;
        self.inner.seek(SeekFrom::Start(self.start + self.position))?;
        Ok(self.position)
    }
}


/// A list of byte ranges within a single seekable source.
pub type Windows = SmallVec<[(u64, u64); 4]>;

/// Reads the concatenation of multiple byte ranges of one seekable source,
/// as if they formed one contiguous stream. Ranges are `(start, len)` pairs.
#[derive(Debug)]
pub struct ChainReader<R> {
    inner: R,
    windows: Windows,
    current: usize,
    consumed_of_current: u64,
}

impl<R: Read + Seek> ChainReader<R> {

    /// Create a chained view over the specified byte ranges,
    /// seeking the inner reader to the start of the first range.
    pub fn new(mut inner: R, windows: Windows) -> IoResult<Self> {
        if let Some(&(start, _)) = windows.first() {
            inner.seek(SeekFrom::Start(start))?;
        }

        Ok(ChainReader { inner, windows, current: 0, consumed_of_current: 0 })
    }

    /// The total number of bytes in all chained ranges.
    pub fn byte_len(&self) -> u64 {
        self.windows.iter().map(|&(_, len)| len).sum()
    }
}

impl<R: Read + Seek> Read for ChainReader<R> {
    fn read(&mut self, buffer: &mut [u8]) -> IoResult<usize> {
        if buffer.is_empty() { return Ok(0); }

        // skip empty and exhausted ranges, seeking to the start of each new range
        while let Some(&(_, len)) = self.windows.get(self.current) {
            if self.consumed_of_current < len { break; }

            self.current += 1;
            self.consumed_of_current = 0;

            if let Some(&(next_start, _)) = self.windows.get(self.current) {
                self.inner.seek(SeekFrom::Start(next_start))?;
            }
        }

        let (_, len) = match self.windows.get(self.current) {
            Some(&window) => window,
            None => return Ok(0),
        };

        let remaining = u64_to_usize(len - self.consumed_of_current);
        let max = buffer.len().min(remaining);

        let count = self.inner.read(&mut buffer[..max])?;
        if count == 0 && max != 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "chained byte range exceeds the source"
            ));
        }

        self.consumed_of_current += usize_to_u64(count);
        Ok(count)
    }
}


/// Extends a reader to a fixed target length by yielding zeroes
/// after the inner reader is exhausted. Never truncates the inner reader.
#[derive(Debug)]
pub struct ZeroPaddedReader<R> {
    inner: R,
    padded_len: u64,
    position: u64,
    inner_exhausted: bool,
}

impl<R: Read> ZeroPaddedReader<R> {

    /// Create a reader that yields exactly `padded_len` bytes.
    pub fn new(inner: R, padded_len: u64) -> Self {
        ZeroPaddedReader { inner, padded_len, position: 0, inner_exhausted: false }
    }
}

impl<R: Read> Read for ZeroPaddedReader<R> {
    fn read(&mut self, buffer: &mut [u8]) -> IoResult<usize> {
        let remaining = self.padded_len.saturating_sub(self.position);
        let max = u64_to_usize(remaining.min(usize_to_u64(buffer.len())));
        if max == 0 { return Ok(0); }

        let count = {
            if self.inner_exhausted { 0 }
            else {
                let count = self.inner.read(&mut buffer[..max])?;
                if count == 0 { self.inner_exhausted = true; }
                count
            }
        };

        if count != 0 {
            self.position += usize_to_u64(count);
            return Ok(count);
        }

        for byte in &mut buffer[..max] { *byte = 0; }
        self.position += usize_to_u64(max);
        Ok(max)
    }
}


/// Extension trait for primitive types like numbers and arrays.
pub trait Data: Sized + Default + Clone {

    /// Number of bytes this would consume inside an archive.
    const BYTE_SIZE: usize = ::std::mem::size_of::<Self>();

    /// Read a value of type `Self`.
    fn read(read: &mut impl Read) -> Result<Self>;

    /// Read as many values of type `Self` as fit into the specified slice.
    /// If the slice cannot be filled completely, returns `Error::Io`.
    fn read_slice(read: &mut impl Read, slice: &mut [Self]) -> UnitResult;

    /// Write this value to the writer.
    fn write(self, write: &mut impl Write) -> UnitResult;

    /// Write all values of that slice to the writer.
    fn write_slice(write: &mut impl Write, slice: &[Self]) -> UnitResult;

    /// Read the specified number of values into a vector.
    /// The estimated maximum caps the pre-allocation: a corrupt length
    /// descriptor will run into the end of the stream instead of
    /// exhausting memory in a single allocation.
    fn read_vec(read: &mut impl Read, data_size: usize, estimated_max: usize) -> Result<Vec<Self>> {
        let mut data = Vec::with_capacity(data_size.min(estimated_max));

        let mut remaining = data_size;
        while remaining > 0 {
            let chunk = remaining.min(estimated_max.max(1));
            let start = data.len();
            data.resize(start + chunk, Self::default());
            Self::read_slice(read, &mut data[start ..])?;
            remaining -= chunk;
        }

        Ok(data)
    }

    /// Write a `u64` length descriptor, then all values of that slice.
    fn write_u64_sized_slice(write: &mut impl Write, slice: &[Self]) -> UnitResult {
        usize_to_u64(slice.len()).write(write)?;
        Self::write_slice(write, slice)
    }

    /// Read a `u64` length descriptor, then that many values into a vector.
    fn read_u64_sized_vec(read: &mut impl Read, estimated_max: usize) -> Result<Vec<Self>> {
        let count = u64_to_usize(u64::read(read)?);
        Self::read_vec(read, count, estimated_max)
    }
}


macro_rules! implement_data_for_primitive {
    ($kind: ident) => {
        impl Data for $kind {
            fn read(read: &mut impl Read) -> Result<Self> {
                Ok(read.read_from_little_endian()?)
            }

            fn write(self, write: &mut impl Write) -> UnitResult {
                write.write_as_little_endian(&self)?;
                Ok(())
            }

            fn read_slice(read: &mut impl Read, slice: &mut [Self]) -> UnitResult {
                read.read_from_little_endian_into(slice)?;
                Ok(())
            }

            fn write_slice(write: &mut impl Write, slice: &[Self]) -> UnitResult {
                write.write_as_little_endian(slice)?;
                Ok(())
            }
        }
    };
}

implement_data_for_primitive!(u8);
implement_data_for_primitive!(i8);
implement_data_for_primitive!(i16);
implement_data_for_primitive!(u16);
implement_data_for_primitive!(u32);
implement_data_for_primitive!(i32);
implement_data_for_primitive!(i64);
implement_data_for_primitive!(u64);


#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;
    use smallvec::smallvec;

    #[test]
    fn track_write_position() {
        let mut write = Tracking::new(Cursor::new(Vec::<u8>::new()));

        17_u64.write(&mut write).unwrap();
        assert_eq!(write.byte_position(), 8);

        u32::write_slice(&mut write, &[1, 2, 3]).unwrap();
        assert_eq!(write.byte_position(), 20);

        write.seek_write_to(4).unwrap();
        assert_eq!(write.byte_position(), 4);
    }

    #[test]
    fn window_stays_in_range() {
        let bytes: Vec<u8> = (0 .. 32).collect();
        let mut window = WindowReader::new(Cursor::new(bytes), 8, 16).unwrap();

        let mut contents = Vec::new();
        window.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, (8 .. 24).collect::<Vec<u8>>());

        window.seek(SeekFrom::Start(14)).unwrap();
        let mut last = [0_u8; 8];
        assert_eq!(window.read(&mut last).unwrap(), 2);
        assert_eq!(&last[.. 2], &[22, 23]);
    }

    #[test]
    fn chain_concatenates_ranges() {
        let bytes: Vec<u8> = (0 .. 64).collect();
        let mut chain = ChainReader::new(
            Cursor::new(bytes),
            smallvec![(0, 4), (32, 2), (60, 4)]
        ).unwrap();

        assert_eq!(chain.byte_len(), 10);

        let mut contents = Vec::new();
        chain.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, vec![0, 1, 2, 3, 32, 33, 60, 61, 62, 63]);
    }

    #[test]
    fn zero_padding_never_truncates() {
        let mut padded = ZeroPaddedReader::new(&[1_u8, 2, 3][..], 8);

        let mut contents = Vec::new();
        padded.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, vec![1, 2, 3, 0, 0, 0, 0, 0]);

        let mut not_padded = ZeroPaddedReader::new(&[1_u8, 2, 3, 4][..], 2);
        let mut contents = Vec::new();
        not_padded.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, vec![1, 2], "must not read beyond the target length");
    }

    #[test]
    fn sized_slice_roundtrip() {
        let mut bytes = Vec::new();
        u64::write_u64_sized_slice(&mut bytes, &[0, 10, 20, 30]).unwrap();

        let decoded = u64::read_u64_sized_vec(&mut bytes.as_slice(), 2).unwrap();
        assert_eq!(decoded, vec![0, 10, 20, 30]);
    }
}
