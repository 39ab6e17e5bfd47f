//! Audio render task
//!
//! Runs inside the host's real-time callback. Each invocation fills exactly
//! one output quantum from the ring reader. The hot path never blocks, never
//! allocates and never logs: anything unexpected degrades to silence and a
//! counter, which the session supervisor samples off the audio thread.

use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::audio::buffer::{ReadReport, RingReader};
use crate::protocol::{RenderCommand, RenderEvent};

/// Cumulative render counters for the whole session
#[derive(Debug, Default)]
pub struct RenderStats {
    quanta: AtomicU64,
    silent_quanta: AtomicU64,
    underrun_quanta: AtomicU64,
    overrun_quanta: AtomicU64,
    rejected_quanta: AtomicU64,
    songs_drained: AtomicU64,
}

impl RenderStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RenderStatsSnapshot {
        RenderStatsSnapshot {
            quanta: self.quanta.load(Ordering::Relaxed),
            silent_quanta: self.silent_quanta.load(Ordering::Relaxed),
            underrun_quanta: self.underrun_quanta.load(Ordering::Relaxed),
            overrun_quanta: self.overrun_quanta.load(Ordering::Relaxed),
            rejected_quanta: self.rejected_quanta.load(Ordering::Relaxed),
            songs_drained: self.songs_drained.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RenderStatsSnapshot {
    /// Callbacks served
    pub quanta: u64,
    /// Callbacks answered with silence because the ring was not ready
    pub silent_quanta: u64,
    /// Callbacks that ran out of buffered audio part-way
    pub underrun_quanta: u64,
    /// Callbacks that found the producer more than a buffer ahead
    pub overrun_quanta: u64,
    /// Callbacks with an output layout this task cannot serve
    pub rejected_quanta: u64,
    pub songs_drained: u64,
}

/// Consumer side of a session
pub struct RenderTask {
    reader: RingReader,
    channels: usize,
    commands: Receiver<RenderCommand>,
    events: Sender<RenderEvent>,
    /// Interleaved staging for planar hosts, sized once at construction
    scratch: Vec<f32>,
    stats: Arc<RenderStats>,
}

impl RenderTask {
    pub fn new(
        reader: RingReader,
        channels: u16,
        max_quantum_frames: usize,
        commands: Receiver<RenderCommand>,
        events: Sender<RenderEvent>,
    ) -> Self {
        let channels = channels.max(1) as usize;
        Self {
            reader,
            channels,
            commands,
            events,
            scratch: vec![0.0; max_quantum_frames * channels],
            stats: Arc::new(RenderStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<RenderStats> {
        Arc::clone(&self.stats)
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn reader(&self) -> &RingReader {
        &self.reader
    }

    /// Render one quantum into an interleaved output buffer
    pub fn render_interleaved(&mut self, out: &mut [f32]) {
        self.drain_commands();
        RenderStats::bump(&self.stats.quanta);

        if out.len() % self.channels != 0 {
            out.fill(0.0);
            RenderStats::bump(&self.stats.rejected_quanta);
            return;
        }
        if !self.reader.is_ready() {
            out.fill(0.0);
            RenderStats::bump(&self.stats.silent_quanta);
            return;
        }

        let report = self.reader.read_into(out);
        self.account(report);
    }

    /// Render one quantum into per-channel output buffers
    pub fn render_planar(&mut self, outputs: &mut [&mut [f32]]) {
        self.drain_commands();
        RenderStats::bump(&self.stats.quanta);

        let frames = outputs.first().map_or(0, |channel| channel.len());
        let needed = frames * self.channels;
        let consistent = outputs.len() == self.channels
            && outputs.iter().all(|channel| channel.len() == frames)
            && needed <= self.scratch.len();

        if !consistent {
            silence_planar(outputs);
            RenderStats::bump(&self.stats.rejected_quanta);
            return;
        }
        if !self.reader.is_ready() {
            silence_planar(outputs);
            RenderStats::bump(&self.stats.silent_quanta);
            return;
        }

        let staged = &mut self.scratch[..needed];
        let report = self.reader.read_into(staged);
        for (channel, output) in outputs.iter_mut().enumerate() {
            for (frame, sample) in output.iter_mut().enumerate() {
                *sample = staged[frame * self.channels + channel];
            }
        }
        self.account(report);
    }

    /// Apply any song-boundary commands queued by the controller
    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                RenderCommand::SongStarting { generation } => {
                    self.reader.reset(generation);
                }
                RenderCommand::SongFinished { generation, .. } => {
                    self.reader.reset(generation);
                    RenderStats::bump(&self.stats.songs_drained);
                    // Controller polls this channel; a full queue only loses the ack
                    let _ = self.events.try_send(RenderEvent::ReadSongFinished);
                }
            }
        }
    }

    fn account(&self, report: ReadReport) {
        if report.silent {
            RenderStats::bump(&self.stats.silent_quanta);
        }
        if report.is_underrun() {
            RenderStats::bump(&self.stats.underrun_quanta);
        }
        if report.overrun {
            RenderStats::bump(&self.stats.overrun_quanta);
        }
    }
}

fn silence_planar(outputs: &mut [&mut [f32]]) {
    for channel in outputs.iter_mut() {
        channel.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::{create_shared_ring, RingWriter};
    use crossbeam_channel::bounded;

    struct Harness {
        writer: RingWriter,
        task: RenderTask,
        commands: Sender<RenderCommand>,
        events: Receiver<RenderEvent>,
    }

    fn harness(capacity: usize, channels: u16) -> Harness {
        let (writer, reader) = create_shared_ring(capacity).unwrap();
        let (command_tx, command_rx) = bounded(8);
        let (event_tx, event_rx) = bounded(8);
        Harness {
            writer,
            task: RenderTask::new(reader, channels, 128, command_rx, event_tx),
            commands: command_tx,
            events: event_rx,
        }
    }

    #[test]
    fn test_silence_before_ready() {
        let mut h = harness(1000, 2);
        h.writer.write(&vec![0.5; 100]);

        let mut out = vec![1.0; 256];
        h.task.render_interleaved(&mut out);

        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(h.task.reader().read_total(), 0);
        let stats = h.task.stats().snapshot();
        assert_eq!(stats.quanta, 1);
        assert_eq!(stats.silent_quanta, 1);
    }

    #[test]
    fn test_playback_until_exhausted() {
        // 5s of 48kHz stereo
        let mut h = harness(480_000, 2);
        let source: Vec<f32> = (0..240_000).map(|i| (i % 1000) as f32 / 1000.0).collect();

        h.writer.write(&source[..200_000]);
        assert!(!h.writer.mark_ready_if_primed());
        h.writer.write(&source[200_000..]);
        assert!(h.writer.mark_ready_if_primed());

        let mut played = Vec::with_capacity(240_000);
        let mut out = vec![0.0; 256];
        let mut last_total = 0;
        while h.task.stats().snapshot().underrun_quanta == 0 {
            h.task.render_interleaved(&mut out);
            let total = h.task.reader().read_total();
            assert!(total >= last_total);
            last_total = total;
            played.extend_from_slice(&out);
        }

        // 937 full quanta, then one half-starved quantum
        assert_eq!(last_total, 240_000);
        assert_eq!(&played[..240_000], &source[..]);
        assert!(played[240_000..].iter().all(|&s| s == 0.0));

        h.task.render_interleaved(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(h.task.stats().snapshot().underrun_quanta, 2);
    }

    #[test]
    fn test_planar_deinterleaves() {
        let mut h = harness(16, 2);
        h.writer.write(&[1.0, -1.0, 2.0, -2.0, 3.0, -3.0, 4.0, -4.0]);
        h.writer.mark_ready_if_primed();

        let mut left = [0.0; 4];
        let mut right = [0.0; 4];
        h.task.render_planar(&mut [&mut left[..], &mut right[..]]);

        assert_eq!(left, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(right, [-1.0, -2.0, -3.0, -4.0]);
        assert_eq!(h.task.reader().read_total(), 8);
    }

    #[test]
    fn test_inconsistent_layout_is_silenced() {
        let mut h = harness(16, 2);
        h.writer.write(&[0.5; 8]);
        h.writer.mark_ready_if_primed();

        let mut odd = vec![1.0; 5];
        h.task.render_interleaved(&mut odd);
        assert!(odd.iter().all(|&s| s == 0.0));

        let mut left = [1.0; 4];
        let mut right = [1.0; 3];
        h.task.render_planar(&mut [&mut left[..], &mut right[..]]);
        assert!(left.iter().chain(right.iter()).all(|&s| s == 0.0));

        // Larger than the preallocated staging area
        let mut big_l = vec![1.0; 512];
        let mut big_r = vec![1.0; 512];
        h.task.render_planar(&mut [&mut big_l[..], &mut big_r[..]]);

        assert_eq!(h.task.stats().snapshot().rejected_quanta, 3);
        assert_eq!(h.task.reader().read_total(), 0);
    }

    #[test]
    fn test_song_finished_resets_and_acknowledges() {
        let mut h = harness(100, 2);
        h.writer.write(&[0.5; 80]);
        h.writer.mark_ready_if_primed();

        let mut out = vec![0.0; 20];
        h.task.render_interleaved(&mut out);
        assert_eq!(out, vec![0.5; 20]);

        let boundary = h.writer.reset();
        h.commands
            .send(RenderCommand::SongFinished {
                offset: boundary.offset,
                generation: boundary.generation,
            })
            .unwrap();

        h.task.render_interleaved(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(h.events.try_recv().unwrap(), RenderEvent::ReadSongFinished);
        assert!(h.task.reader().shared().snapshot().is_fresh());
        assert_eq!(h.task.stats().snapshot().songs_drained, 1);

        // Next song plays from index zero
        h.writer.write(&[0.25; 50]);
        h.writer.mark_ready_if_primed();
        h.task.render_interleaved(&mut out);
        assert_eq!(out, vec![0.25; 20]);
    }

    #[test]
    fn test_song_starting_resyncs_reader() {
        let mut h = harness(100, 1);
        h.writer.write(&[0.5; 60]);
        h.writer.mark_ready_if_primed();

        let boundary = h.writer.reset();
        h.writer.write(&[0.75; 60]);
        h.writer.mark_ready_if_primed();

        let mut out = vec![0.0; 10];
        h.task.render_interleaved(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));

        h.commands
            .send(RenderCommand::SongStarting {
                generation: boundary.generation,
            })
            .unwrap();
        h.task.render_interleaved(&mut out);
        assert_eq!(out, vec![0.75; 10]);
        assert!(h.events.try_recv().is_err());
    }

    #[test]
    fn test_back_to_back_boundaries_do_not_replay() {
        let mut h = harness(100, 1);
        h.writer.write(&[0.5; 60]);
        h.writer.mark_ready_if_primed();

        // Finished and starting arrive together; the producer has already
        // written the next song before the render side sees either
        let finished = h.writer.reset();
        let starting = h.writer.reset();
        let next_song: Vec<f32> = (0..60).map(|i| i as f32).collect();
        h.writer.write(&next_song);
        assert!(h.writer.mark_ready_if_primed());

        let mut out = vec![0.0; 10];
        h.commands
            .send(RenderCommand::SongFinished {
                offset: finished.offset,
                generation: finished.generation,
            })
            .unwrap();
        h.task.render_interleaved(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(h.task.reader().read_total(), 0);

        h.commands
            .send(RenderCommand::SongStarting {
                generation: starting.generation,
            })
            .unwrap();
        h.task.render_interleaved(&mut out);
        assert_eq!(out, next_song[..10]);
        h.task.render_interleaved(&mut out);
        assert_eq!(out, next_song[10..20]);
        assert_eq!(h.task.reader().read_total(), 20);
    }
}
