
//! Full write-then-read round trips over synthetic volumes,
//! using the built-in reference codec backend.

use std::io::{Cursor, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use voxar::prelude::*;


/// A seekable in-memory sink whose bytes survive the archiver consuming it.
#[derive(Debug, Clone, Default)]
struct SharedSink(Arc<Mutex<Cursor<Vec<u8>>>>);

impl SharedSink {
    fn bytes(&self) -> Vec<u8> {
        self.0.lock().unwrap().get_ref().clone()
    }
}

impl Write for SharedSink {
    fn write(&mut self, buffer: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().write(buffer)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().unwrap().flush()
    }
}

impl Seek for SharedSink {
    fn seek(&mut self, position: SeekFrom) -> std::io::Result<u64> {
        self.0.lock().unwrap().seek(position)
    }
}


fn random_volume(dimensions: Vec3<usize>, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut voxels = vec![0_u8; dimensions.volume()];
    rng.fill(&mut voxels[..]);
    voxels
}

fn archive(
    voxels: &[u8], dimensions: Vec3<usize>,
    log_block_size: usize, padding: usize, memory_limit: usize,
) -> (Vec<u8>, ArchiveSummary)
{
    let source = MemoryVolume::new(voxels.to_vec(), dimensions).unwrap();

    let mut options = ArchiverOptions::new(log_block_size, padding);
    options.memory_limit = memory_limit;

    let sink = SharedSink::default();
    let archiver = Archiver::new(source, sink.clone(), options).unwrap();
    let summary = archiver.convert().unwrap();

    (sink.bytes(), summary)
}

fn open(bytes: Vec<u8>) -> Unarchiver<Cursor<Vec<u8>>> {
    Unarchiver::read_from_buffered(Cursor::new(bytes), DecodeOptions::default()).unwrap()
}

/// The padded block as the archiver must have built it:
/// source voxels shifted by the padding, zeroes outside the volume.
fn reference_block(
    voxels: &[u8], dimensions: Vec3<usize>,
    block_size: usize, block_inner: usize, padding: usize, block: Idx,
) -> Vec<u8>
{
    let mut expected = vec![0_u8; block_size * block_size * block_size];

    for bz in 0 .. block_size {
        for by in 0 .. block_size {
            for bx in 0 .. block_size {
                let rx = (block.x as i64) * block_inner as i64 + bx as i64 - padding as i64;
                let ry = (block.y as i64) * block_inner as i64 + by as i64 - padding as i64;
                let rz = (block.z as i64) * block_inner as i64 + bz as i64 - padding as i64;

                let inside = rx >= 0 && ry >= 0 && rz >= 0
                    && (rx as usize) < dimensions.0
                    && (ry as usize) < dimensions.1
                    && (rz as usize) < dimensions.2;

                if inside {
                    let source = ((rz as usize) * dimensions.1 + ry as usize)
                        * dimensions.0 + rx as usize;

                    expected[(bz * block_size + by) * block_size + bx] = voxels[source];
                }
            }
        }
    }

    expected
}

const MIB: usize = 1024 * 1024;


#[test]
fn single_block_occupies_the_first_frames() {
    let dimensions = Vec3(256, 256, 256);
    let voxels = random_volume(dimensions, 17);

    let (bytes, summary) = archive(&voxels, dimensions, 6, 0, 64 * MIB);
    assert_eq!(summary.grid_dim, Vec3(4, 4, 4));
    assert_eq!(summary.block_count, 64);

    let mut unarchiver = open(bytes);
    let header = unarchiver.header().clone();

    // one block spans exactly ceil(block_volume / frame_size) frames
    let expected_last = (header.block_volume() + header.frame_size - 1) / header.frame_size - 1;
    let first_block = unarchiver.meta().block_index[&Idx::new(0, 0, 0)];
    assert_eq!(first_block.first_frame, 0);
    assert_eq!(first_block.in_frame_offset, 0);
    assert_eq!(first_block.last_frame as usize, expected_last);

    let mut decoded = vec![0_u8; header.block_volume()];
    let delivered = unarchiver.unarchive_into(Idx::new(0, 0, 0), &mut decoded).unwrap();
    assert_eq!(delivered, header.block_volume());

    let expected = reference_block(&voxels, dimensions, 64, 64, 0, Idx::new(0, 0, 0));
    assert_eq!(decoded, expected);
}

#[test]
fn batched_blocks_scatter_into_their_own_destinations() {
    let dimensions = Vec3(256, 256, 256);
    let voxels = random_volume(dimensions, 18);

    let (bytes, _) = archive(&voxels, dimensions, 6, 0, 64 * MIB);
    let mut unarchiver = open(bytes);
    let block_volume = unarchiver.header().block_volume();

    let requested = [Idx::new(0, 0, 0), Idx::new(1, 0, 0), Idx::new(2, 0, 0)];
    let mut destinations = vec![vec![0_u8; block_volume]; requested.len()];
    let mut seen = Vec::new();

    unarchiver.batch_unarchive(&requested, |id, slice| {
        if seen.last() != Some(&id) { seen.push(id); }
        let destination = &mut destinations[id.x as usize];
        slice.append_to(destination)
    }).unwrap();

    // all slices of one block arrive before the next block begins
    assert_eq!(seen, requested);

    for (position, &id) in requested.iter().enumerate() {
        let expected = reference_block(&voxels, dimensions, 64, 64, 0, id);
        assert_eq!(destinations[position], expected, "block {}", id);
    }
}

#[test]
fn padded_corner_blocks_are_zero_filled_and_shifted() {
    let dimensions = Vec3(128, 128, 128);
    let voxels = random_volume(dimensions, 19);

    // padding 2: block cores of 60 voxels, grid of 3 x 3 x 3
    let (bytes, summary) = archive(&voxels, dimensions, 6, 2, 64 * MIB);
    assert_eq!(summary.grid_dim, Vec3(3, 3, 3));

    let mut unarchiver = open(bytes);
    let block_volume = unarchiver.header().block_volume();
    let corner = Idx::new(0, 0, 0);

    let mut decoded = vec![0_u8; block_volume];
    unarchiver.unarchive_into(corner, &mut decoded).unwrap();

    // the first two planes are outside the volume
    assert!(decoded[.. 2 * 64 * 64].iter().all(|&voxel| voxel == 0));
    assert_eq!(decoded[(2 * 64 + 2) * 64 + 2], voxels[0], "volume corner lands at (p, p, p)");
    assert_eq!(
        decoded[(2 * 64 + 2) * 64 + 7], voxels[5],
        "edge voxels appear at (p + i, p, p)"
    );

    let expected = reference_block(&voxels, dimensions, 64, 60, 2, corner);
    assert_eq!(decoded, expected);

    // an interior block of the same archive carries no zero fill
    let interior = Idx::new(1, 1, 1);
    unarchiver.unarchive_into(interior, &mut decoded).unwrap();
    let expected = reference_block(&voxels, dimensions, 64, 60, 2, interior);
    assert_eq!(decoded, expected);
}

#[test]
fn out_of_order_requests_fill_the_right_buffers() {
    let dimensions = Vec3(256, 256, 256);
    let voxels = random_volume(dimensions, 20);

    let (bytes, _) = archive(&voxels, dimensions, 6, 0, 64 * MIB);
    let mut unarchiver = open(bytes);
    let block_volume = unarchiver.header().block_volume();

    // encode order of these is (1,0,0), (3,0,0), (0,1,0)
    let requested = [Idx::new(3, 0, 0), Idx::new(0, 1, 0), Idx::new(1, 0, 0)];

    let mut destinations: std::collections::BTreeMap<Idx, Vec<u8>> = requested.iter()
        .map(|&id| (id, vec![0_u8; block_volume]))
        .collect();

    let mut seen = Vec::new();

    unarchiver.batch_unarchive(&requested, |id, slice| {
        if seen.last() != Some(&id) { seen.push(id); }
        slice.append_to(destinations.get_mut(&id).unwrap())
    }).unwrap();

    assert_eq!(seen, vec![Idx::new(1, 0, 0), Idx::new(3, 0, 0), Idx::new(0, 1, 0)]);

    for (&id, destination) in &destinations {
        let expected = reference_block(&voxels, dimensions, 64, 64, 0, id);
        assert_eq!(destination, &expected, "block {}", id);
    }
}

#[test]
fn unknown_blocks_leave_the_unarchiver_usable() {
    let dimensions = Vec3(128, 128, 128);
    let voxels = random_volume(dimensions, 21);

    let (bytes, _) = archive(&voxels, dimensions, 5, 0, 64 * MIB);
    let mut unarchiver = open(bytes);
    let block_volume = unarchiver.header().block_volume();

    let mut decoded = vec![0_u8; block_volume];
    assert!(matches!(
        unarchiver.unarchive_into(Idx::new(99, 0, 0), &mut decoded),
        Err(Error::UnknownBlock(_))
    ));

    // the failed request must not poison later requests
    unarchiver.unarchive_into(Idx::new(1, 2, 3), &mut decoded).unwrap();
    let expected = reference_block(&voxels, dimensions, 32, 32, 0, Idx::new(1, 2, 3));
    assert_eq!(decoded, expected);
}

#[test]
fn short_destinations_observe_no_partial_write() {
    let dimensions = Vec3(64, 64, 64);
    let voxels = random_volume(dimensions, 22);

    let (bytes, _) = archive(&voxels, dimensions, 5, 0, 64 * MIB);
    let mut unarchiver = open(bytes);
    let block_volume = unarchiver.header().block_volume();

    let mut short = vec![0xab_u8; block_volume - 1];
    assert!(matches!(
        unarchiver.unarchive_into(Idx::new(0, 0, 0), &mut short),
        Err(Error::InsufficientBuffer { .. })
    ));

    assert!(short.iter().all(|&byte| byte == 0xab), "no bytes written on failure");
}

#[test]
fn frame_offsets_span_the_body_exactly() {
    let dimensions = Vec3(256, 256, 256);
    let voxels = random_volume(dimensions, 23);

    let (bytes, summary) = archive(&voxels, dimensions, 6, 0, 64 * MIB);
    let unarchiver = open(bytes);
    let meta = unarchiver.meta();

    // strictly monotonic, ending exactly at the body size
    assert!(meta.frame_offsets.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(meta.body_byte_size(), summary.body_byte_size);
    assert_eq!(meta.frame_count(), summary.frame_count);

    // sixty-four blocks cut into frames, the last frame zero padded
    let total_bytes = 64 * unarchiver.header().block_volume();
    let frame_size = unarchiver.header().frame_size;
    assert_eq!(meta.frame_count(), (total_bytes + frame_size - 1) / frame_size);

    // emitted in strict grid order, with strictly increasing stream positions
    let grid = unarchiver.grid_dim();
    let mut windows = Vec::new();
    for z in 0 .. grid.2 { for y in 0 .. grid.1 { for x in 0 .. grid.0 {
        windows.push(meta.block_index[&Idx::new(x as u32, y as u32, z as u32)]);
    }}}

    assert!(windows.windows(2).all(|pair| pair[0] < pair[1]));
    assert!((windows.last().unwrap().last_frame as usize) < meta.frame_count());
}

#[test]
fn memory_budget_does_not_change_the_archive() {
    let dimensions = Vec3(64, 64, 64);
    let voxels = random_volume(dimensions, 24);
    let block_volume = 32 * 32 * 32;

    // generous budget: whole grid rows per stride.
    // minimal budget: one block per stride, many repetitions.
    let (generous, _) = archive(&voxels, dimensions, 5, 0, 64 * MIB);
    let (minimal, _) = archive(&voxels, dimensions, 5, 0, 2 * block_volume);

    assert_eq!(generous, minimal, "striding must not change the output");

    // padded configurations stride identically, too
    let (generous, _) = archive(&voxels, dimensions, 5, 2, 64 * MIB);
    let (minimal, _) = archive(&voxels, dimensions, 5, 2, 2 * block_volume);
    assert_eq!(generous, minimal);
}

#[test]
fn memory_below_one_block_pair_is_rejected() {
    let dimensions = Vec3(64, 64, 64);
    let voxels = random_volume(dimensions, 25);
    let source = MemoryVolume::new(voxels, dimensions).unwrap();

    let mut options = ArchiverOptions::new(5, 0);
    options.memory_limit = 2 * 32 * 32 * 32 - 1;

    let archiver = Archiver::new(source, SharedSink::default(), options).unwrap();
    assert!(matches!(
        archiver.convert(),
        Err(Error::InsufficientMemory { .. })
    ));
}

#[test]
fn every_block_of_an_uneven_padded_volume_round_trips() {
    // dimensions that divide into no block configuration evenly,
    // so blocks clip on all high faces and padding clips on all low faces
    let dimensions = Vec3(100, 80, 70);
    let voxels = random_volume(dimensions, 26);

    let (bytes, summary) = archive(&voxels, dimensions, 5, 2, 6 * 32 * 32 * 32);
    assert_eq!(summary.grid_dim, Vec3(4, 3, 3));

    let mut unarchiver = open(bytes);
    let block_volume = unarchiver.header().block_volume();
    let grid = unarchiver.grid_dim();

    let mut decoded = vec![0_u8; block_volume];
    for z in 0 .. grid.2 as u32 {
        for y in 0 .. grid.1 as u32 {
            for x in 0 .. grid.0 as u32 {
                let id = Idx::new(x, y, z);
                unarchiver.unarchive_into(id, &mut decoded).unwrap();

                let expected = reference_block(&voxels, dimensions, 32, 28, 2, id);
                assert_eq!(decoded, expected, "block {}", id);
            }
        }
    }
}

#[test]
fn encoder_batch_size_does_not_change_the_archive() {
    let dimensions = Vec3(64, 64, 64);
    let voxels = random_volume(dimensions, 27);

    let archive_with_batch = |batch_frames: usize| {
        let source = MemoryVolume::new(voxels.clone(), dimensions).unwrap();

        let mut options = ArchiverOptions::new(5, 0);
        options.encode.batch_frames = batch_frames;

        let sink = SharedSink::default();
        Archiver::new(source, sink.clone(), options).unwrap().convert().unwrap();
        sink.bytes()
    };

    let eager = archive_with_batch(1);
    let batched = archive_with_batch(64);
    assert_eq!(eager, batched, "batching must not change the byte layout");
}

#[test]
fn statistics_match_the_reference_backend_exactly() {
    use voxar::extract::stats::StatisticsCollector;

    let dimensions = Vec3(64, 64, 64);
    let voxels = random_volume(dimensions, 28);

    let (bytes, _) = archive(&voxels, dimensions, 5, 1, 64 * MIB);
    let mut unarchiver = open(bytes);

    let reference = MemoryVolume::new(voxels, dimensions).unwrap();
    let mut collector = StatisticsCollector::new(&mut unarchiver, Some(reference));

    let stats = collector.compute(Idx::new(1, 1, 1)).unwrap();
    let source = stats.source.unwrap();
    let difference = stats.difference.unwrap();

    // the reference backend is lossless, decoded and source must agree
    assert_eq!(stats.decoded, source);
    assert_eq!(difference.maximum, 0);
    assert_eq!(difference.average, 0.0);
}
