//! Topic matching, registry fan-out and PUBLISH encoding

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use relaymq::codec::{Decoder, Encoder};
use relaymq::protocol::{Packet, Publish, QoS};
use relaymq::session::SessionId;
use relaymq::topic::{topic_matches_filter, SubscriptionRegistry};

fn random_topic(rng: &mut StdRng, levels: usize) -> String {
    (0..levels)
        .map(|_| format!("l{}", rng.gen_range(0..8)))
        .collect::<Vec<_>>()
        .join("/")
}

fn random_filter(rng: &mut StdRng, levels: usize) -> String {
    let mut parts: Vec<String> = (0..levels)
        .map(|_| match rng.gen_range(0..10) {
            0 => "+".to_string(),
            n => format!("l{}", n % 8),
        })
        .collect();
    if rng.gen_bool(0.2) {
        parts.truncate(levels / 2);
        parts.push("#".to_string());
    }
    parts.join("/")
}

fn bench_matcher(c: &mut Criterion) {
    let mut group = c.benchmark_group("topic_matches_filter");
    group.bench_function("exact", |b| {
        b.iter(|| topic_matches_filter(black_box("home/kitchen/temp"), black_box("home/kitchen/temp")))
    });
    group.bench_function("single_level", |b| {
        b.iter(|| topic_matches_filter(black_box("home/kitchen/temp"), black_box("home/+/temp")))
    });
    group.bench_function("multi_level", |b| {
        b.iter(|| topic_matches_filter(black_box("home/kitchen/temp/raw"), black_box("home/#")))
    });
    group.finish();
}

fn bench_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_resolve");
    for filters in [100usize, 1_000, 10_000] {
        let mut rng = StdRng::seed_from_u64(7);
        let registry = SubscriptionRegistry::new();
        for i in 0..filters {
            let filter = random_filter(&mut rng, 4);
            registry.subscribe(SessionId(i as u64 % 512), &filter, QoS::AtLeastOnce);
        }
        let topics: Vec<String> = (0..64).map(|_| random_topic(&mut rng, 4)).collect();

        group.bench_with_input(BenchmarkId::from_parameter(filters), &topics, |b, topics| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % topics.len();
                black_box(registry.resolve(&topics[i]))
            })
        });
    }
    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let encoder = Encoder::new();
    let decoder = Decoder::new();
    let packet = Packet::Publish(Publish {
        packet_id: Some(42),
        ..Publish::new("sensors/floor1/room7/temp", vec![0u8; 256], QoS::AtLeastOnce)
    });
    let mut encoded = BytesMut::new();
    encoder.encode(&packet, &mut encoded).unwrap();

    c.bench_function("encode_publish_256", |b| {
        let mut buf = BytesMut::with_capacity(512);
        b.iter(|| {
            buf.clear();
            encoder.encode(black_box(&packet), &mut buf).unwrap();
        })
    });
    c.bench_function("decode_publish_256", |b| {
        b.iter(|| decoder.decode(black_box(&encoded)).unwrap())
    });
}

criterion_group!(benches, bench_matcher, bench_resolve, bench_codec);
criterion_main!(benches);
