use bytes::Bytes;
use criterion::{criterion_group, criterion_main, Criterion};
use framewire::messages::{Message, RgbImage};

fn bench_frame_codec(c: &mut Criterion) {
    let width = 1920u32;
    let height = 1080u32;
    let pixels = Bytes::from(vec![128u8; (width * height * 3) as usize]);
    let frame = RgbImage::new(width, height, pixels, Some(0), Some(0), Some(16_666_667), 0, 60.0)
        .expect("frame");
    let message = Message::Frame(frame);
    let encoded = message.encode().expect("encode");

    c.bench_function("encode_1080p_frame", |b| {
        b.iter(|| {
            let _ = message.encode().expect("encode");
        })
    });

    c.bench_function("decode_1080p_frame", |b| {
        b.iter(|| {
            let _ = Message::decode(&encoded).expect("decode");
        })
    });
}

criterion_group!(benches, bench_frame_codec);
criterion_main!(benches);
