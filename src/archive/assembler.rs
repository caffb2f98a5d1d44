
//! Assembles accepted block byte streams into whole fixed-size frames
//! and feeds them to the video encoder on a background worker.
//!
//! Block positions are computed synchronously on `accept`,
//! so the recorded index is consistent with the sequential byte layout
//! no matter how the worker interleaves with the producer.

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::{Arc, Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crate::codec::Encoder;
use crate::error::{Error, Result, UnitResult, IoResult, usize_to_u64};
use crate::frame::FrameLayout;
use crate::io::{Read, Write};
use crate::meta::index::BlockIndex;


/// The bytes of one block, handed to the frame assembler.
#[derive(Debug)]
pub enum BlockSource {

    /// A view into a caller-owned buffer. The buffer stays shared until the
    /// encoder consumed the bytes or a `flush` promoted them to owned copies.
    Shared(Arc<Vec<u8>>, Range<usize>),

    /// Bytes owned by the assembler.
    Owned(Vec<u8>),

    /// Zero fill, used to pad the final frame. Never referenced by any block.
    Padding(usize),
}

impl BlockSource {

    /// The number of bytes this source contributes to the logical stream.
    pub fn byte_len(&self) -> usize {
        match self {
            BlockSource::Shared(_, range) => range.len(),
            BlockSource::Owned(bytes) => bytes.len(),
            BlockSource::Padding(len) => *len,
        }
    }
}


/// A queued source and how much of it the encoder already consumed.
#[derive(Debug)]
struct PendingSource {
    source: BlockSource,
    consumed: usize,
}

impl PendingSource {

    fn new(source: BlockSource) -> Self {
        PendingSource { source, consumed: 0 }
    }

    fn remaining(&self) -> usize {
        self.source.byte_len() - self.consumed
    }

    /// Copy unconsumed bytes into the destination, advancing this source.
    fn read_into(&mut self, dst: &mut [u8]) -> usize {
        let count = dst.len().min(self.remaining());
        let dst = &mut dst[.. count];

        match &self.source {
            BlockSource::Shared(buffer, range) => {
                let start = range.start + self.consumed;
                dst.copy_from_slice(&buffer[start .. start + count]);
            }

            BlockSource::Owned(bytes) => {
                dst.copy_from_slice(&bytes[self.consumed .. self.consumed + count]);
            }

            BlockSource::Padding(_) => {
                for byte in dst.iter_mut() { *byte = 0; }
            }
        }

        self.consumed += count;
        count
    }

    /// Shrink this source to `keep` unconsumed bytes and return the cut-off
    /// tail as a fresh source. Both halves together cover the original bytes.
    fn split_tail(&mut self, keep: usize) -> PendingSource {
        debug_assert!(keep < self.remaining(), "split must actually cut the source");
        let cut = self.consumed + keep;

        let tail = match &mut self.source {
            BlockSource::Shared(buffer, range) => {
                let tail_range = range.start + cut .. range.end;
                range.end = range.start + cut;
                BlockSource::Shared(Arc::clone(buffer), tail_range)
            }

            BlockSource::Owned(bytes) => {
                let tail = bytes[cut ..].to_vec();
                bytes.truncate(cut);
                BlockSource::Owned(tail)
            }

            BlockSource::Padding(len) => {
                let tail = BlockSource::Padding(*len - cut);
                *len = cut;
                tail
            }
        };

        PendingSource::new(tail)
    }

    /// Copy the unconsumed bytes of a shared source into an owned buffer,
    /// releasing the reference to the caller's buffer.
    fn promote(&mut self) {
        if let BlockSource::Shared(buffer, range) = &self.source {
            let owned = buffer[range.start + self.consumed .. range.end].to_vec();
            self.source = BlockSource::Owned(owned);
            self.consumed = 0;
        }
    }
}


/// Reads the sources of one drained batch as a contiguous byte stream.
struct BatchReader {
    sources: VecDeque<PendingSource>,
}

impl Read for BatchReader {
    fn read(&mut self, buffer: &mut [u8]) -> IoResult<usize> {
        if buffer.is_empty() { return Ok(0); }

        while let Some(front) = self.sources.front_mut() {
            if front.remaining() == 0 {
                self.sources.pop_front();
                continue;
            }

            return Ok(front.read_into(buffer));
        }

        Ok(0)
    }
}


/// State owned by the producing side, behind the input lock.
#[derive(Debug)]
struct Input {
    queue: VecDeque<PendingSource>,
    pending_bytes: usize,
    emitted_frames: usize,
    should_flush: bool,
    should_stop: bool,
}

/// State owned by the encoding side, behind the work lock.
/// The two locks are only ever acquired in the order input, then work.
struct Work<W> {
    encoder: Box<dyn Encoder>,
    writer: W,
    frame_offsets: Vec<u64>,
    frame_byte_lengths: Vec<u32>,
    completed_passes: u64,
    error: Option<Error>,
}

struct Shared<W> {
    frame_size: usize,
    batch_bytes: usize,
    input: Mutex<Input>,
    work: Mutex<Work<W>>,
    input_changed: Condvar,
    pass_completed: Condvar,
    failed: AtomicBool,
}


/// An integral number of frames drained from the queue.
struct Batch {
    sources: VecDeque<PendingSource>,
    frame_count: usize,
}

/// Drain exactly `pending_bytes / frame_size` whole frames from the queue,
/// splitting the source at the frame boundary when necessary.
fn take_batch(input: &mut Input, frame_size: usize) -> Option<Batch> {
    let frame_count = input.pending_bytes / frame_size;
    if frame_count == 0 { return None; }

    let byte_len = frame_count * frame_size;
    let mut sources = VecDeque::new();
    let mut taken = 0;

    while taken < byte_len {
        let mut source = input.queue.pop_front().expect("pending byte accounting bug");
        let remaining = source.remaining();

        if taken + remaining > byte_len {
            let tail = source.split_tail(byte_len - taken);
            input.queue.push_front(tail);
            taken = byte_len;
        }
        else {
            taken += remaining;
        }

        sources.push_back(source);
    }

    input.pending_bytes -= byte_len;
    input.emitted_frames += frame_count;
    Some(Batch { sources, frame_count })
}

fn run_worker<W: Write>(shared: &Shared<W>) {
    loop {
        let batch;
        let mut work;

        {
            let mut input = shared.input.lock().expect("input lock poisoned");

            loop {
                if input.should_stop { return; }

                let enough_pending = input.pending_bytes >= shared.batch_bytes;
                if input.should_flush || enough_pending { break; }

                input = shared.input_changed.wait(input).expect("input lock poisoned");
            }

            input.should_flush = false;
            batch = take_batch(&mut input, shared.frame_size);

            // acquire the work lock before releasing the input lock, so a
            // flush that promotes the queue always observes this batch done
            work = shared.work.lock().expect("work lock poisoned");
        }

        if work.error.is_none() {
            if let Some(batch) = batch {
                let Work { encoder, writer, frame_offsets, frame_byte_lengths, .. } = &mut *work;

                frame_byte_lengths.clear();
                let mut frames = BatchReader { sources: batch.sources };

                let encoded = encoder.encode(
                    &mut frames, batch.frame_count,
                    writer, frame_byte_lengths
                );

                match encoded {
                    Ok(()) => {
                        for &byte_len in frame_byte_lengths.iter() {
                            let last = *frame_offsets.last().expect("offset table starts at zero");
                            frame_offsets.push(last + u64::from(byte_len));
                        }
                    }

                    Err(error) => {
                        shared.failed.store(true, Ordering::Release);
                        work.error = Some(error);
                    }
                }
            }
        }

        work.completed_passes += 1;
        shared.pass_completed.notify_all();
    }
}


/// Presents incoming variable-length block byte streams to the codec as
/// fixed-size frames, while telling the caller where each block ended up.
pub struct FrameAssembler<W> {
    shared: Option<Arc<Shared<W>>>,
    worker: Option<JoinHandle<()>>,
    layout: FrameLayout,
}

impl<W: Write + Send + 'static> FrameAssembler<W> {

    /// Start the background encoder worker.
    /// The assembler owns the writer until `finish` returns it.
    pub fn new(encoder: Box<dyn Encoder>, writer: W, batch_frames: usize) -> Self {
        let frame_size = encoder.frame_size();
        debug_assert_ne!(frame_size, 0, "zero frame size");

        let shared = Arc::new(Shared {
            frame_size,
            batch_bytes: frame_size * batch_frames.max(1),

            input: Mutex::new(Input {
                queue: VecDeque::new(),
                pending_bytes: 0,
                emitted_frames: 0,
                should_flush: false,
                should_stop: false,
            }),

            work: Mutex::new(Work {
                encoder, writer,
                frame_offsets: vec![0],
                frame_byte_lengths: Vec::new(),
                completed_passes: 0,
                error: None,
            }),

            input_changed: Condvar::new(),
            pass_completed: Condvar::new(),
            failed: AtomicBool::new(false),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("voxar frame encoder".to_string())
            .spawn(move || run_worker(worker_shared.as_ref()))
            .expect("cannot spawn the encoder worker thread");

        FrameAssembler {
            shared: Some(shared),
            worker: Some(worker),
            layout: FrameLayout { frame_size },
        }
    }

    fn shared(&self) -> &Arc<Shared<W>> {
        self.shared.as_ref().expect("frame assembler already finished")
    }

    /// The byte size of one frame of the owned encoder.
    pub fn frame_size(&self) -> usize {
        self.shared().frame_size
    }

    /// Append the source to the logical byte stream and return the frame
    /// window its bytes will occupy. Computed before any codec work.
    pub fn accept(&self, source: BlockSource) -> Result<BlockIndex> {
        let shared = self.shared();

        if shared.failed.load(Ordering::Acquire) {
            return Err(Error::codec("the encoder worker already failed"));
        }

        let mut input = shared.input.lock().expect("input lock poisoned");

        let window = self.layout.block_window(
            usize_to_u64(input.emitted_frames),
            usize_to_u64(input.pending_bytes),
            usize_to_u64(source.byte_len()),
        )?;

        input.pending_bytes += source.byte_len();
        input.queue.push_back(PendingSource::new(source));

        if input.pending_bytes >= shared.batch_bytes {
            shared.input_changed.notify_one();
        }

        Ok(window)
    }

    /// Promote all queued shared sources to self-owned copies, so callers
    /// may drop or reuse their buffers. Optionally blocks until the encoder
    /// caught up with all currently complete frames.
    pub fn flush(&self, wait: bool) -> UnitResult {
        let shared = self.shared();

        let mut input = shared.input.lock().expect("input lock poisoned");
        let mut work = shared.work.lock().expect("work lock poisoned");

        for source in &mut input.queue { source.promote(); }

        if wait {
            input.should_flush = true;
            shared.input_changed.notify_one();
        }

        drop(input);

        if wait {
            let target = work.completed_passes + 1;
            while work.completed_passes < target && work.error.is_none() {
                work = shared.pass_completed.wait(work).expect("work lock poisoned");
            }
        }

        if work.error.is_some() {
            return Err(Error::codec("the encoder worker already failed"));
        }

        Ok(())
    }

    /// Pad the final partial frame with zeroes, drain the encoder,
    /// stop the worker, and return the writer together with the finished
    /// frame offset table. The padding bytes are not referenced by any block.
    pub fn finish(mut self) -> Result<(W, Vec<u64>)> {
        let shared = self.shared.take().expect("frame assembler already finished");

        {
            let mut input = shared.input.lock().expect("input lock poisoned");
            let work = shared.work.lock().expect("work lock poisoned");

            let partial = input.pending_bytes % shared.frame_size;
            if partial != 0 {
                let padding = shared.frame_size - partial;
                input.pending_bytes += padding;
                input.queue.push_back(PendingSource::new(BlockSource::Padding(padding)));
            }

            // everything pending is now whole frames, one pass drains it all
            input.should_flush = true;
            shared.input_changed.notify_one();
            drop(input);

            let mut work = work;
            let target = work.completed_passes + 1;
            while work.completed_passes < target && work.error.is_none() {
                work = shared.pass_completed.wait(work).expect("work lock poisoned");
            }
        }

        {
            let mut input = shared.input.lock().expect("input lock poisoned");
            input.should_stop = true;
            shared.input_changed.notify_one();
        }

        self.worker.take()
            .expect("worker thread handle missing")
            .join().expect("encoder worker panicked");

        let shared = Arc::try_unwrap(shared).ok()
            .expect("stopped encoder worker still shares state");

        let work = shared.work.into_inner().expect("work lock poisoned");
        let Work { mut encoder, mut writer, mut frame_offsets, error, .. } = work;

        if let Some(error) = error {
            return Err(error);
        }

        // let codecs with frame reordering emit their delayed frames
        let mut delayed_lengths = Vec::new();
        encoder.finish(&mut writer, &mut delayed_lengths)?;

        for &byte_len in &delayed_lengths {
            let last = *frame_offsets.last().expect("offset table starts at zero");
            frame_offsets.push(last + u64::from(byte_len));
        }

        Ok((writer, frame_offsets))
    }
}

impl<W> Drop for FrameAssembler<W> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            if let Some(shared) = &self.shared {
                if let Ok(mut input) = shared.input.lock() {
                    input.should_stop = true;
                }

                shared.input_changed.notify_one();
            }

            let _ = worker.join();
        }
    }
}

impl<W> std::fmt::Debug for FrameAssembler<W> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("FrameAssembler")
            .field("frame_size", &self.layout.frame_size)
            .finish()
    }
}
