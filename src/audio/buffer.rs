//! Lock-free shared ring buffer for streamed PCM
//!
//! A fixed-capacity region of interleaved f32 samples plus the counters the
//! ingest (producer) and render (consumer) sides use to coordinate without a
//! lock. The region is split at construction into exactly one [`RingWriter`]
//! and one [`RingReader`]. Neither handle is `Clone`, so the single-producer
//! single-consumer contract is enforced by ownership.
//!
//! ```text
//!            write_index                      read_index
//!                 │                               │
//!   ┌─────────────▼───────────────────────────────▼──────────────┐
//!   │ ... new samples │ (unused / old lap) │ buffered, unread ...│
//!   └────────────────────────────────────────────────────────────┘
//!   lead = written_total - read_total   (never wraps, u64)
//! ```
//!
//! Samples are stored as `AtomicU32` bit patterns so both sides may touch the
//! same slot concurrently without undefined behaviour. Slot accesses are
//! `Relaxed`; the producer publishes them with a `Release` store of
//! `written_total` and the consumer observes them with an `Acquire` load.
//!
//! Song-boundary resets are split between the two handles. The writer bumps
//! a generation counter before clearing anything, and the reader re-checks
//! it after each copy, seqlock style, so a quantum that raced a reset is
//! discarded instead of played.

use crossbeam::utils::CachePadded;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::AudioError;

/// Upper bound on ring capacity in samples (~87s of 48kHz stereo)
pub const MAX_CAPACITY_SAMPLES: usize = 1 << 23;

/// Memory shared by the writer and reader handles
pub struct SharedRing {
    samples: Box<[AtomicU32]>,
    capacity: usize,

    // Producer-owned
    write_index: CachePadded<AtomicUsize>,
    written_total: CachePadded<AtomicU64>,

    // Consumer-owned
    read_index: CachePadded<AtomicUsize>,
    read_total: CachePadded<AtomicU64>,

    ready: AtomicBool,
    /// Bumped by every producer-side reset. A reader whose generation lags
    /// behind treats the ring as not ready.
    generation: AtomicU64,
    overruns: AtomicU64,
    underruns: AtomicU64,
}

impl SharedRing {
    fn new(capacity: usize) -> Result<Self, AudioError> {
        if capacity < 2 || capacity > MAX_CAPACITY_SAMPLES {
            return Err(AudioError::InvalidCapacity(capacity));
        }

        let samples = (0..capacity)
            .map(|_| AtomicU32::new(0.0f32.to_bits()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            samples,
            capacity,
            write_index: CachePadded::new(AtomicUsize::new(0)),
            written_total: CachePadded::new(AtomicU64::new(0)),
            read_index: CachePadded::new(AtomicUsize::new(0)),
            read_total: CachePadded::new(AtomicU64::new(0)),
            ready: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
        })
    }

    /// Capacity in samples (all channels)
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of samples that must be written before playback may start
    pub fn priming_threshold(&self) -> u64 {
        (self.capacity / 2) as u64
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn write_index(&self) -> usize {
        self.write_index.load(Ordering::Acquire)
    }

    pub fn read_index(&self) -> usize {
        self.read_index.load(Ordering::Acquire)
    }

    pub fn written_total(&self) -> u64 {
        self.written_total.load(Ordering::Acquire)
    }

    pub fn read_total(&self) -> u64 {
        self.read_total.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Samples written but not yet read. Saturates at zero while a song
    /// boundary is only half applied.
    pub fn lead(&self) -> u64 {
        self.written_total().saturating_sub(self.read_total())
    }

    /// Buffered fraction of capacity, clamped to 1.0
    pub fn fill_level(&self) -> f32 {
        (self.lead() as f32 / self.capacity as f32).min(1.0)
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> RingSnapshot {
        RingSnapshot {
            capacity: self.capacity,
            write_index: self.write_index(),
            read_index: self.read_index(),
            written_total: self.written_total(),
            read_total: self.read_total(),
            ready: self.is_ready(),
            generation: self.generation(),
            overruns: self.overruns(),
            underruns: self.underruns(),
        }
    }

    #[inline]
    fn store_span(&self, start: usize, src: &[f32]) {
        for (slot, sample) in self.samples[start..start + src.len()].iter().zip(src) {
            slot.store(sample.to_bits(), Ordering::Relaxed);
        }
    }

    #[inline]
    fn load_span(&self, start: usize, dst: &mut [f32]) {
        let end = start + dst.len();
        for (sample, slot) in dst.iter_mut().zip(&self.samples[start..end]) {
            *sample = f32::from_bits(slot.load(Ordering::Relaxed));
        }
    }
}

impl fmt::Debug for SharedRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRing")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// Counter snapshot, suitable for logging and the status API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RingSnapshot {
    pub capacity: usize,
    pub write_index: usize,
    pub read_index: usize,
    pub written_total: u64,
    pub read_total: u64,
    pub ready: bool,
    pub generation: u64,
    pub overruns: u64,
    pub underruns: u64,
}

impl RingSnapshot {
    /// True when the counters look like a freshly allocated ring
    pub fn is_fresh(&self) -> bool {
        self.write_index == 0
            && self.read_index == 0
            && self.written_total == 0
            && self.read_total == 0
            && !self.ready
            && self.overruns == 0
            && self.underruns == 0
    }
}

/// Result of a single producer write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteReport {
    /// Samples accepted (always the full input)
    pub written: usize,
    /// The write left the producer more than one buffer ahead of the reader
    pub overrun: bool,
}

/// Result of a single consumer read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadReport {
    /// Samples copied out of the ring
    pub copied: usize,
    /// Samples that had not been written yet and were output as silence
    pub starved: usize,
    /// The ring was not ready, so nothing was read
    pub silent: bool,
    /// The producer was more than one buffer ahead after this read
    pub overrun: bool,
}

impl ReadReport {
    fn silent() -> Self {
        Self {
            silent: true,
            ..Self::default()
        }
    }

    pub fn is_underrun(&self) -> bool {
        self.starved > 0
    }
}

/// Where a producer-side reset cut the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SongBoundary {
    /// `written_total` reached before the reset
    pub offset: u64,
    /// Generation the ring moved to. The reader must adopt exactly this value.
    pub generation: u64,
}

/// Allocate a ring of `capacity` samples and split it into its two handles
pub fn create_shared_ring(capacity: usize) -> Result<(RingWriter, RingReader), AudioError> {
    let ring = Arc::new(SharedRing::new(capacity)?);
    let writer = RingWriter {
        ring: Arc::clone(&ring),
        write_index: 0,
        written_total: 0,
    };
    let reader = RingReader {
        ring,
        read_index: 0,
        read_total: 0,
        generation: 0,
    };
    Ok((writer, reader))
}

/// Producer handle. Owned by the ingest task.
pub struct RingWriter {
    ring: Arc<SharedRing>,
    write_index: usize,
    written_total: u64,
}

impl RingWriter {
    /// Append samples at the write cursor, wrapping at capacity.
    ///
    /// Never blocks and never fails: unread samples are overwritten when the
    /// producer is more than one buffer ahead, and the overrun is counted.
    pub fn write(&mut self, samples: &[f32]) -> WriteReport {
        if samples.is_empty() {
            return WriteReport::default();
        }

        let capacity = self.ring.capacity;
        let mut pos = self.write_index;
        let mut span = samples;

        // Only the final `capacity` samples of an oversized write survive
        if span.len() > capacity {
            let skip = span.len() - capacity;
            pos = (pos + skip) % capacity;
            span = &span[skip..];
        }

        let first = span.len().min(capacity - pos);
        self.ring.store_span(pos, &span[..first]);
        if first < span.len() {
            self.ring.store_span(0, &span[first..]);
        }

        self.written_total += samples.len() as u64;
        self.write_index = (self.written_total % capacity as u64) as usize;
        self.ring
            .write_index
            .store(self.write_index, Ordering::Release);
        self.ring
            .written_total
            .store(self.written_total, Ordering::Release);

        let read_total = self.ring.read_total.load(Ordering::Acquire);
        let overrun = self.written_total.saturating_sub(read_total) > capacity as u64;
        if overrun {
            self.ring.overruns.fetch_add(1, Ordering::Relaxed);
        }

        WriteReport {
            written: samples.len(),
            overrun,
        }
    }

    /// Set the ready flag once half the ring has been written.
    ///
    /// Returns `true` only on the call that flips the flag.
    pub fn mark_ready_if_primed(&self) -> bool {
        if self.written_total < self.ring.priming_threshold() {
            return false;
        }
        self.ring
            .ready
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Producer half of a song-boundary reset.
    ///
    /// Clears the ready flag, advances the generation so the reader stops
    /// consuming until it resets too, zero-fills the samples and zeroes the
    /// producer counters.
    pub fn reset(&mut self) -> SongBoundary {
        let offset = self.written_total;

        self.ring.ready.store(false, Ordering::Release);
        let generation = self.ring.generation.fetch_add(1, Ordering::AcqRel) + 1;
        // Pairs with the reader's acquire fence: any slot store below that a
        // read observes makes the new generation visible to its re-check
        fence(Ordering::Release);

        for slot in self.ring.samples.iter() {
            slot.store(0.0f32.to_bits(), Ordering::Relaxed);
        }

        self.write_index = 0;
        self.written_total = 0;
        self.ring.write_index.store(0, Ordering::Release);
        self.ring.written_total.store(0, Ordering::Release);
        self.ring.overruns.store(0, Ordering::Relaxed);

        SongBoundary { offset, generation }
    }

    pub fn written_total(&self) -> u64 {
        self.written_total
    }

    pub fn write_index(&self) -> usize {
        self.write_index
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity
    }

    pub fn shared(&self) -> &Arc<SharedRing> {
        &self.ring
    }
}

impl fmt::Debug for RingWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingWriter")
            .field("write_index", &self.write_index)
            .field("written_total", &self.written_total)
            .finish()
    }
}

/// Consumer handle. Owned by the render task.
pub struct RingReader {
    ring: Arc<SharedRing>,
    read_index: usize,
    read_total: u64,
    generation: u64,
}

impl RingReader {
    /// Whether playback may read from the ring
    pub fn is_ready(&self) -> bool {
        self.ring.is_ready() && self.ring.generation() == self.generation
    }

    /// Fill `out` from the read cursor without allocating.
    ///
    /// Before the ring is ready, `out` is silenced and nothing advances.
    /// Samples the producer has not written yet are output as silence and
    /// reported as starved; the cursor only advances over real samples.
    pub fn read_into(&mut self, out: &mut [f32]) -> ReadReport {
        if out.is_empty() {
            return ReadReport::default();
        }
        if !self.is_ready() {
            out.fill(0.0);
            return ReadReport::silent();
        }

        let capacity = self.ring.capacity;
        let written = self.ring.written_total.load(Ordering::Acquire);
        let available = written.saturating_sub(self.read_total);
        let copied = available.min(out.len() as u64) as usize;

        let mut pos = self.read_index;
        let mut dst = &mut out[..copied];
        while !dst.is_empty() {
            let n = dst.len().min(capacity - pos);
            let (head, tail) = std::mem::take(&mut dst).split_at_mut(n);
            self.ring.load_span(pos, head);
            pos = (pos + n) % capacity;
            dst = tail;
        }
        out[copied..].fill(0.0);

        // A producer reset landed mid-copy: discard what was read
        fence(Ordering::Acquire);
        if self.ring.generation.load(Ordering::Relaxed) != self.generation {
            out.fill(0.0);
            return ReadReport::silent();
        }

        self.read_total += copied as u64;
        self.read_index = (self.read_total % capacity as u64) as usize;
        self.ring.read_index.store(self.read_index, Ordering::Release);
        self.ring.read_total.store(self.read_total, Ordering::Release);

        let starved = out.len() - copied;
        if starved > 0 {
            self.ring.underruns.fetch_add(1, Ordering::Relaxed);
        }

        let written = self.ring.written_total.load(Ordering::Acquire);
        let overrun = written.saturating_sub(self.read_total) > capacity as u64;
        if overrun {
            self.ring.overruns.fetch_add(1, Ordering::Relaxed);
        }

        ReadReport {
            copied,
            starved,
            silent: false,
            overrun,
        }
    }

    /// Allocating convenience over [`read_into`](Self::read_into)
    pub fn read(&mut self, count: usize) -> Vec<f32> {
        let mut out = vec![0.0; count];
        self.read_into(&mut out);
        out
    }

    /// Consumer half of a song-boundary reset.
    ///
    /// Adopts the boundary's generation and zeroes the consumer counters, so
    /// the next song is read from index zero. If the producer has already
    /// moved past `generation`, the reader stays silent until it is handed
    /// the later boundary too.
    pub fn reset(&mut self, generation: u64) {
        self.generation = generation;
        self.read_index = 0;
        self.read_total = 0;
        self.ring.read_index.store(0, Ordering::Release);
        self.ring.read_total.store(0, Ordering::Release);
        self.ring.underruns.store(0, Ordering::Relaxed);
    }

    /// Generation of the last boundary this reader applied
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn read_total(&self) -> u64 {
        self.read_total
    }

    pub fn read_index(&self) -> usize {
        self.read_index
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity
    }

    pub fn shared(&self) -> &Arc<SharedRing> {
        &self.ring
    }
}

impl fmt::Debug for RingReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingReader")
            .field("read_index", &self.read_index)
            .field("read_total", &self.read_total)
            .field("generation", &self.generation)
            .finish()
    }
}
