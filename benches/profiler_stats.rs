//! Profiler finalization and per-frame scheduling cost.
//! Run: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use framecap::clock::FrameTick;
use framecap::profiler::Profiler;
use framecap::schedule::{CaptureScheduler, GraphHandle};

fn bench_end_capture(c: &mut Criterion) {
    let mut group = c.benchmark_group("profiler");
    group.sample_size(50);

    group.bench_function("end_capture_16_events_x_256_frames", |b| {
        b.iter(|| {
            let mut profiler = Profiler::new(true);
            profiler.start_capture().expect("start capture");
            for frame in 0..256 {
                for event in 0..16 {
                    profiler.record_sample(
                        &format!("/onFrameRender/pass{event}/gpuTime"),
                        f64::from(frame % 7 + event),
                    );
                }
                profiler.end_frame();
            }
            black_box(profiler.end_capture().expect("end capture"))
        });
    });

    group.finish();
}

fn bench_scheduler(c: &mut Criterion) {
    let graph = GraphHandle::new("restir");
    let frames = (0..1000).map(|frame| frame * 3).collect::<Vec<i64>>();

    c.bench_function("scheduler_on_frame_3000_frames", |b| {
        b.iter(|| {
            let mut scheduler = CaptureScheduler::new();
            scheduler.add_frames(&graph, &frames).expect("frames");
            scheduler
                .add_ranges(&graph, &[(30, 300), (1000, 2000)])
                .expect("ranges");
            let mut dispatched = 0usize;
            for frame in 0..3000 {
                dispatched += scheduler.on_frame(&graph, FrameTick::at(frame, 60)).len();
            }
            black_box(dispatched)
        });
    });
}

criterion_group!(benches, bench_end_capture, bench_scheduler);
criterion_main!(benches);
