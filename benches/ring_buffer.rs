//! Ring buffer benchmarks
//!
//! Steady-state producer/consumer cost per render quantum.

use aux_listener::audio::buffer::create_shared_ring;
use aux_listener::audio::render::RenderTask;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

const CAPACITY: usize = 480_000;
const QUANTA: &[usize] = &[128, 256, 1024];

fn bench_write_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_write_read");

    for &frames in QUANTA {
        let samples = frames * 2;
        group.throughput(Throughput::Elements(samples as u64));

        let (mut writer, mut reader) = create_shared_ring(CAPACITY).unwrap();
        writer.write(&vec![0.1; CAPACITY / 2]);
        writer.mark_ready_if_primed();

        let input = vec![0.25f32; samples];
        let mut output = vec![0.0f32; samples];

        group.bench_with_input(BenchmarkId::from_parameter(frames), &frames, |b, _| {
            b.iter(|| {
                writer.write(black_box(&input));
                black_box(reader.read_into(&mut output))
            })
        });
    }

    group.finish();
}

fn bench_render(c: &mut Criterion) {
    let mut group = c.benchmark_group("render_quantum");

    for &frames in QUANTA {
        let (mut writer, reader) = create_shared_ring(CAPACITY).unwrap();
        writer.write(&vec![0.1; CAPACITY / 2]);
        writer.mark_ready_if_primed();

        let (_command_tx, command_rx) = crossbeam_channel::bounded(16);
        let (event_tx, _event_rx) = crossbeam_channel::bounded(16);
        let mut task = RenderTask::new(reader, 2, frames, command_rx, event_tx);

        let input = vec![0.25f32; frames * 2];
        let mut left = vec![0.0f32; frames];
        let mut right = vec![0.0f32; frames];
        let mut interleaved = vec![0.0f32; frames * 2];

        group.bench_with_input(BenchmarkId::new("interleaved", frames), &frames, |b, _| {
            b.iter(|| {
                writer.write(&input);
                task.render_interleaved(black_box(&mut interleaved));
            })
        });

        group.bench_with_input(BenchmarkId::new("planar", frames), &frames, |b, _| {
            b.iter(|| {
                writer.write(&input);
                let mut outputs = [left.as_mut_slice(), right.as_mut_slice()];
                task.render_planar(black_box(&mut outputs));
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_write_read, bench_render);
criterion_main!(benches);
