use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use image::GrayImage;
use larva_vr::core_modules::frame::Frame;
use larva_vr::ipc::{FrameCodec, QueueOptions, monitored_queue};

fn bench_frame_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_push_pop");
    for (width, height) in [(640u32, 480u32), (1280, 1024)] {
        let frame = Frame::gray(0, 0, GrayImage::from_pixel(width, height, image::Luma([128])));
        group.throughput(Throughput::Bytes((width * height) as u64));
        for copy_on_read in [false, true] {
            let options = QueueOptions {
                capacity: 8,
                copy_on_read,
                ..Default::default()
            };
            let (mut writer, mut reader, _) =
                monitored_queue("bench", FrameCodec::new(width, height, 1), &options).unwrap();
            let label = if copy_on_read { "copy" } else { "borrow" };
            group.bench_with_input(BenchmarkId::new(label, format!("{width}x{height}")), &frame, |b, frame| {
                b.iter(|| {
                    writer.push(black_box(frame)).unwrap();
                    black_box(reader.try_pop().unwrap())
                })
            });
        }
    }
    group.finish();
}

fn bench_overflowing_writer(c: &mut Criterion) {
    let frame = Frame::gray(0, 0, GrayImage::new(640, 480));
    let (mut writer, _reader, _) =
        monitored_queue("bench_overflow", FrameCodec::new(640, 480, 1), &QueueOptions::default()).unwrap();
    c.bench_function("frame_push_into_full_ring", |b| {
        b.iter(|| writer.push(black_box(&frame)).unwrap())
    });
}

criterion_group!(benches, bench_frame_round_trip, bench_overflowing_writer);
criterion_main!(benches);
